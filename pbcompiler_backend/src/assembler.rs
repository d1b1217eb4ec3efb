//! Assembler for the PulseBlaster text format.
//!
//! Each non-empty line, after stripping `//` comments and tabs, holds one instruction:
//!
//! ```text
//! [label:] flags, duration[, opcode[, inst_data]]
//! ```
//!
//! - `flags`: `0x` hexadecimal or `0b` binary literal, at most `nr_flags` bits wide.
//! - `duration`: decimal number with unit `ns`, `us`, `ms` or `s`, e.g. `100ns` or `1.5 ms`.
//!   Converted to ns and truncated.
//! - `opcode`: case-insensitive opcode name, `CONTINUE` if left out.
//! - `inst_data`: a label (resolved to its address, forward or backward) or an integer,
//!   0 if left out. The operand of `END_LOOP` is always replaced by the address of its `LOOP`.
//!
//! The assembled program is unrolled once; every error, including ill-formed control flow
//! found while unrolling, is a [`CompileError::Parse`] naming the source line.

use indexmap::IndexMap;
use regex::Regex;
use tracing::debug;

use crate::config::{validate_channel_count, AssemblerConfig, MAX_CHANNELS};
use crate::error::{CompileError, Result};
use crate::instruction::{Instruction, InstructionSequence, Opcode};

const DURATION_PATTERN: &str = r"^([0-9]+(?:\.[0-9]+)?)\s*(ns|us|ms|s)$";

/// Assembles `code` into an [`InstructionSequence`] with `config.nr_flags` channels.
///
/// ```
/// use pbcompiler_backend::assembler::code_to_instructions;
/// use pbcompiler_backend::config::AssemblerConfig;
///
/// let code = "0x000001, 100ns, LOOP, 5 \n 0x000000, 200ns, END_LOOP \n 0x000001, 100ns, STOP";
/// let seq = code_to_instructions(code, &AssemblerConfig::default()).unwrap();
/// assert_eq!(seq.instructions().len(), 3);
/// assert_eq!(seq.durations().len(), 11);
/// assert_eq!(seq.branch_index(), None);
/// ```
pub fn code_to_instructions(code: &str, config: &AssemblerConfig) -> Result<InstructionSequence> {
    validate_channel_count(config.nr_flags)?;
    let parser = LineParser::new(config.nr_flags)?;

    let mut labels: IndexMap<String, usize> = IndexMap::new();
    let mut lines: Vec<ParsedLine> = Vec::new();
    for (idx, raw_line) in code.lines().enumerate() {
        let line_number = idx + 1;
        let stripped = raw_line
            .split("//")
            .next()
            .unwrap_or_default()
            .replace('\t', "");
        let stripped = stripped.trim();
        if stripped.is_empty() {
            continue;
        }
        let parsed = parser.parse_line(stripped, line_number)?;
        if let Some(label) = &parsed.instruction.label {
            if labels.insert(label.clone(), lines.len()).is_some() {
                return Err(CompileError::parse(
                    line_number,
                    format!("Duplicate label '{}'", label),
                ));
            }
        }
        lines.push(parsed);
    }

    match_loops(&mut lines)?;

    let mut source_lines = Vec::with_capacity(lines.len());
    let mut instructions = Vec::with_capacity(lines.len());
    for line in lines {
        let mut instruction = line.instruction;
        instruction.inst_data = match line.inst_data {
            Operand::Resolved(address) => address,
            Operand::Text(text) => resolve_operand(&text, &labels, line.line_number)?,
        };
        source_lines.push(line.line_number);
        instructions.push(instruction);
    }
    debug!(
        nr_instructions = instructions.len(),
        nr_labels = labels.len(),
        "assembled program"
    );

    InstructionSequence::with_limits(instructions, config.nr_flags, config.unroll).map_err(|err| {
        match err {
            CompileError::ControlFlow { address, message } => match source_lines.get(address) {
                Some(&line) => CompileError::parse(line, message),
                None => CompileError::ControlFlow { address, message },
            },
            other => other,
        }
    })
}

enum Operand {
    Text(String),
    Resolved(i64),
}

struct ParsedLine {
    instruction: Instruction,
    inst_data: Operand,
    line_number: usize,
}

struct LineParser {
    duration: Regex,
    nr_flags: usize,
}

impl LineParser {
    fn new(nr_flags: usize) -> Result<Self> {
        let duration =
            Regex::new(DURATION_PATTERN).map_err(|err| CompileError::parse(0, err.to_string()))?;
        Ok(LineParser { duration, nr_flags })
    }

    fn parse_line(&self, line: &str, line_number: usize) -> Result<ParsedLine> {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < 2 {
            return Err(CompileError::parse(
                line_number,
                format!("Invalid instruction '{}'", line),
            ));
        }
        if fields.len() > 4 {
            return Err(CompileError::parse(
                line_number,
                format!("Too many instruction fields in '{}'", line),
            ));
        }

        let (label, flags) = match fields[0].split_once(':') {
            Some((label, flags)) => {
                let label = label.trim();
                if label.is_empty() {
                    return Err(CompileError::parse(line_number, "Empty label"));
                }
                (Some(label.to_string()), flags.trim())
            }
            None => (None, fields[0]),
        };
        let flags = self.parse_flags(flags, line_number)?;
        let duration = self.parse_duration(fields[1], line_number)?;
        let opcode = match fields.get(2) {
            Some(name) => name
                .parse::<Opcode>()
                .map_err(|msg| CompileError::parse(line_number, msg))?,
            None => Opcode::CONTINUE,
        };
        let inst_data = Operand::Text(fields.get(3).unwrap_or(&"0").to_string());

        Ok(ParsedLine {
            instruction: Instruction {
                label,
                flags,
                duration,
                opcode,
                inst_data: 0,
            },
            inst_data,
            line_number,
        })
    }

    fn parse_flags(&self, token: &str, line_number: usize) -> Result<u64> {
        let prefix = token.get(..2).map(str::to_ascii_lowercase);
        let radix = match prefix.as_deref() {
            Some("0x") => 16,
            Some("0b") => 2,
            _ => {
                return Err(CompileError::parse(
                    line_number,
                    format!("Flags '{}' not in bits or hex", token),
                ))
            }
        };
        let value = u64::from_str_radix(&token[2..], radix).map_err(|err| {
            CompileError::parse(line_number, format!("Invalid flags value '{}': {}", token, err))
        })?;
        if self.nr_flags < MAX_CHANNELS && value >> self.nr_flags != 0 {
            return Err(CompileError::parse(
                line_number,
                format!("Flags value '{}' exceeds {} bits", token, self.nr_flags),
            ));
        }
        Ok(value)
    }

    fn parse_duration(&self, token: &str, line_number: usize) -> Result<u64> {
        let invalid = || {
            CompileError::parse(
                line_number,
                format!(
                    "Invalid duration '{}'. Expected '<value><unit>' with unit ns, us, ms or s, e.g. '100ns'",
                    token
                ),
            )
        };
        let captures = self.duration.captures(token).ok_or_else(invalid)?;
        let value: f64 = captures[1].parse().map_err(|_| invalid())?;
        let scale = match &captures[2] {
            "ns" => 1.,
            "us" => 1e3,
            "ms" => 1e6,
            _ => 1e9,
        };
        let ns = value * scale;
        if !ns.is_finite() || ns >= u64::MAX as f64 {
            return Err(CompileError::parse(
                line_number,
                format!("Duration '{}' does not fit in u64 nanoseconds", token),
            ));
        }
        let duration = ns as u64;
        if duration == 0 {
            return Err(CompileError::parse(
                line_number,
                format!("Duration '{}' is shorter than 1 ns", token),
            ));
        }
        Ok(duration)
    }
}

/// Pairs every END_LOOP with its LOOP and points its operand at the LOOP's address.
fn match_loops(lines: &mut [ParsedLine]) -> Result<()> {
    let mut open: Vec<usize> = Vec::new();
    for address in 0..lines.len() {
        match lines[address].instruction.opcode {
            Opcode::LOOP => open.push(address),
            Opcode::END_LOOP => {
                let start = open.pop().ok_or_else(|| {
                    CompileError::parse(
                        lines[address].line_number,
                        "END_LOOP without matching LOOP",
                    )
                })?;
                lines[address].inst_data = Operand::Resolved(start as i64);
            }
            _ => {}
        }
    }
    match open.last() {
        Some(&start) => Err(CompileError::parse(
            lines[start].line_number,
            "LOOP without matching END_LOOP",
        )),
        None => Ok(()),
    }
}

fn resolve_operand(text: &str, labels: &IndexMap<String, usize>, line_number: usize) -> Result<i64> {
    if let Some(&address) = labels.get(text) {
        return Ok(address as i64);
    }
    text.parse::<i64>().map_err(|_| {
        CompileError::parse(
            line_number,
            format!(
                "Invalid inst_data '{}', known labels: {:?}",
                text,
                labels.keys().collect::<Vec<_>>()
            ),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assemble(code: &str) -> Result<InstructionSequence> {
        code_to_instructions(code, &AssemblerConfig::default())
    }

    fn error_line(code: &str) -> usize {
        match assemble(code) {
            Err(CompileError::Parse { line, .. }) => line,
            other => panic!("expected a parse error, got {:?}", other),
        }
    }

    #[test]
    fn labels_resolve_forward_and_backward() {
        let code = "
            // Subroutine demo
            start: 0x1, 1us, JSR, sub
                   0x0, 1 us, BRANCH, start
            sub:   0b11, 0.5ms, RTS   // return
        ";
        let seq = assemble(code).unwrap();
        let instructions = seq.instructions();
        assert_eq!(instructions.len(), 3);
        assert_eq!(instructions[0].label.as_deref(), Some("start"));
        assert_eq!(instructions[0].inst_data, 2);
        assert_eq!(instructions[1].inst_data, 0);
        assert_eq!(instructions[2].flags, 0b11);
        assert_eq!(instructions[2].duration, 500_000);
        assert_eq!(seq.addresses(), &[0, 2, 1]);
        assert_eq!(seq.branch_index(), Some(0));
    }

    #[test]
    fn durations_and_defaults() {
        let seq = assemble("0x0, 2s\n0X1, 1.5 us, stop").unwrap();
        let instructions = seq.instructions();
        assert_eq!(instructions[0].duration, 2_000_000_000);
        assert_eq!(instructions[0].opcode, Opcode::CONTINUE);
        assert_eq!(instructions[0].inst_data, 0);
        assert_eq!(instructions[1].duration, 1_500);
        assert_eq!(instructions[1].opcode, Opcode::STOP);
    }

    #[test]
    fn end_loop_operand_points_at_loop() {
        let code = "0x1, 100ns, LOOP, 2\n0x0, 100ns, LOOP, 3\n0x1, 100ns, END_LOOP, 99\n0x0, 100ns, END_LOOP\n0x0, 100ns, STOP";
        let seq = assemble(code).unwrap();
        assert_eq!(seq.instructions()[2].inst_data, 1);
        assert_eq!(seq.instructions()[3].inst_data, 0);
        assert_eq!(seq.durations().len(), 2 * (1 + 3 * 2 + 1) + 1);
    }

    #[test]
    fn flag_width_is_enforced() {
        let narrow = AssemblerConfig::default().with_nr_flags(4);
        assert!(code_to_instructions("0b1111, 10ns", &narrow).is_ok());
        let err = code_to_instructions("0b10000, 10ns", &narrow).unwrap_err();
        assert!(err.to_string().contains("exceeds 4 bits"));
        assert!(code_to_instructions("0x1, 10ns", &AssemblerConfig::default().with_nr_flags(0)).is_err());
    }

    #[test]
    fn malformed_lines_name_the_line() {
        assert_eq!(error_line("0x0, 10ns\n\n12, 10ns"), 3);
        assert_eq!(error_line("0x0"), 1);
        assert_eq!(error_line("0x0, 10ns, CONTINUE, 0, 0"), 1);
        assert_eq!(error_line("0x0, 10 sec"), 1);
        assert_eq!(error_line("0x0, 10NS"), 1);
        assert_eq!(error_line("0x0, 0.1ns"), 1);
        assert_eq!(error_line("0x0, 10ns, JUMP"), 1);
        assert_eq!(error_line("0x0, 10ns, BRANCH, nowhere"), 1);
        assert_eq!(error_line(": 0x0, 10ns"), 1);
        assert_eq!(error_line("a: 0x0, 10ns\na: 0x0, 10ns"), 2);
    }

    #[test]
    fn oversized_durations_name_the_line() {
        assert_eq!(error_line("0x0, 10ns\n0x0, 99999999999999999999s\n0x1, 10ns, STOP"), 2);
        // Each fits on its own, their sum does not
        assert_eq!(error_line("0x0, 18000000000s\n0x0, 18000000000s, STOP"), 2);
        let seq = assemble("0x0, 18000000000s, STOP").unwrap();
        assert_eq!(seq.total_duration(), 18_000_000_000_000_000_000);
    }

    #[test]
    fn unmatched_loops_name_the_line() {
        assert_eq!(error_line("0x0, 10ns\n0x0, 10ns, END_LOOP"), 2);
        assert_eq!(error_line("0x0, 10ns, LOOP, 2\n0x0, 10ns\n0x0, 10ns, LOOP, 2\n0x0, 10ns, END_LOOP"), 1);
    }

    #[test]
    fn unroll_errors_map_to_source_lines() {
        // RTS without JSR on the third source line, after a comment line
        assert_eq!(error_line("0x0, 10ns\n// comment\n0x0, 10ns, RTS"), 3);
        assert_eq!(error_line("0x0, 10ns, JSR, 5"), 1);
        assert_eq!(error_line("0x0, 10ns\n0x0, 10ns, LOOP, 0\n0x0, 10ns, END_LOOP"), 2);
    }

    #[test]
    fn empty_program_is_a_control_flow_error() {
        assert!(matches!(
            assemble("// nothing here\n"),
            Err(CompileError::ControlFlow { address: 0, .. })
        ));
    }
}
