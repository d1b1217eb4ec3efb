use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pbcompiler_backend::assembler::code_to_instructions;
use pbcompiler_backend::compiler::generate_repeating_pulses;
use pbcompiler_backend::config::{AssemblerConfig, CompilerConfig};
use pbcompiler_backend::instruction::InstructionSequence;
use pbcompiler_backend::signal::SignalSpec;

#[derive(Parser, Debug)]
#[command(name = "pbcompiler")]
#[command(about = "Compile PulseBlaster programs from periodic signals or assembly text")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Assemble a PulseBlaster text program
    Asm {
        /// Path to the program
        path: PathBuf,

        /// Number of flag bits per instruction
        #[arg(long, default_value = "24")]
        nr_flags: usize,
    },
    /// Compile repeating pulses, e.g. `pulses --signal 10:0 --signal 20:1,2:0.25`
    Pulses {
        /// Signal as FREQ:CH[,CH...][:DUTY]
        #[arg(long = "signal", required = true, value_parser = parse_signal)]
        signals: Vec<SignalArg>,

        /// Active-low signal, same format as --signal
        #[arg(long = "active-low", value_parser = parse_signal)]
        active_low: Vec<SignalArg>,

        /// Masking signal, same format as --signal
        #[arg(long = "mask", value_parser = parse_signal)]
        masks: Vec<SignalArg>,

        /// Minimum instruction length in ns
        #[arg(long, default_value = "20")]
        quantum: u64,

        /// Number of flag bits per instruction
        #[arg(long, default_value = "24")]
        channels: usize,

        /// Number of trailing flag bits mirroring the other outputs
        #[arg(long, default_value = "3")]
        reserved: usize,
    },
}

#[derive(Debug, Clone)]
struct SignalArg {
    frequency: f64,
    channels: Vec<usize>,
    duty_cycle: f64,
}

impl SignalArg {
    fn to_spec(&self, active_high: bool) -> pbcompiler_backend::Result<SignalSpec> {
        SignalSpec::build(
            self.frequency,
            self.channels.iter().copied(),
            0,
            self.duty_cycle,
            0,
            active_high,
        )
    }
}

fn parse_signal(arg: &str) -> Result<SignalArg, String> {
    let mut parts = arg.split(':');
    let frequency = parts
        .next()
        .unwrap_or_default()
        .parse::<f64>()
        .map_err(|e| format!("invalid frequency in '{}': {}", arg, e))?;
    let channels = parts
        .next()
        .ok_or_else(|| format!("missing channels in '{}'", arg))?
        .split(',')
        .map(|c| c.trim().parse::<usize>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("invalid channel in '{}': {}", arg, e))?;
    let duty_cycle = match parts.next() {
        Some(duty) => duty
            .parse::<f64>()
            .map_err(|e| format!("invalid duty cycle in '{}': {}", arg, e))?,
        None => 0.5,
    };
    if parts.next().is_some() {
        return Err(format!("expected FREQ:CH[,CH...][:DUTY], got '{}'", arg));
    }
    Ok(SignalArg {
        frequency,
        channels,
        duty_cycle,
    })
}

fn run(command: Command) -> pbcompiler_backend::Result<InstructionSequence> {
    match command {
        Command::Asm { path, nr_flags } => {
            let code = std::fs::read_to_string(&path).map_err(|e| {
                pbcompiler_backend::CompileError::Parse {
                    line: 0,
                    message: format!("cannot read {}: {}", path.display(), e),
                }
            })?;
            info!("Assembling {}", path.display());
            code_to_instructions(&code, &AssemblerConfig::default().with_nr_flags(nr_flags))
        }
        Command::Pulses {
            signals,
            active_low,
            masks,
            quantum,
            channels,
            reserved,
        } => {
            let mut specs = signals
                .iter()
                .map(|s| s.to_spec(true))
                .collect::<pbcompiler_backend::Result<Vec<_>>>()?;
            for signal in &active_low {
                specs.push(signal.to_spec(false)?);
            }
            let masking = masks
                .iter()
                .map(|s| s.to_spec(true))
                .collect::<pbcompiler_backend::Result<Vec<_>>>()?;
            let config = CompilerConfig::default()
                .with_min_instruction_len(quantum)
                .with_channels(channels, reserved);
            generate_repeating_pulses(&specs, &masking, &config)
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match run(cli.command) {
        Ok(seq) => {
            print!("{}", seq);
            info!(
                steps = seq.durations().len(),
                total_duration_ns = seq.total_duration(),
                branch_index = ?seq.branch_index(),
                "Unrolled program"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
