use pbcompiler_backend::sync::minimum_duration_and_num_cycles;
use pbcompiler_backend::utils::{round_to_nearest_n_ns, round_u64};
use pbcompiler_backend::*;

/// Lengths (ns) of the contiguous high runs of `channel` before the terminal branch.
fn high_runs(seq: &InstructionSequence, channel: usize) -> Vec<u64> {
    let trace = seq.channel_trace(channel).unwrap();
    let steps = trace.len() - 1;
    let mut runs = Vec::new();
    let mut current = 0;
    for step in 0..steps {
        if trace[step] == 1 {
            current += seq.durations()[step];
        } else if current > 0 {
            runs.push(current);
            current = 0;
        }
    }
    if current > 0 {
        runs.push(current);
    }
    runs
}

#[test]
fn single_signal_compiles_to_one_period() {
    let signals = [SignalSpec::new(10., [0]).unwrap()];
    let seq = generate_repeating_pulses(&signals, &[], &CompilerConfig::default()).unwrap();

    // Program plus terminal branch span exactly one period
    assert_eq!(seq.total_duration(), 100_000_000);
    assert_eq!(seq.repeat_duration(), Some(100_000_000));
    assert_eq!(high_runs(&seq, 0), vec![50_000_000]);

    let last = seq.instructions().last().unwrap();
    assert_eq!(last.opcode, Opcode::BRANCH);
    assert_eq!(last.inst_data, 0);
    assert_eq!(seq.branch_index(), Some(0));
}

#[test]
fn integer_multiple_frequencies() {
    let signals = [SignalSpec::new(10., [0]).unwrap(), SignalSpec::new(20., [1]).unwrap()];
    let sync = minimum_duration_and_num_cycles(&signals, &[], None, &CompilerConfig::default()).unwrap();
    assert_eq!(sync.duration, 100_000_000);

    let seq = generate_repeating_pulses(&signals, &[], &CompilerConfig::default()).unwrap();
    assert_eq!(seq.total_duration(), 100_000_000);
    assert_eq!(high_runs(&seq, 0), vec![50_000_000]);
    assert_eq!(high_runs(&seq, 1), vec![25_000_000, 25_000_000]);
}

#[test]
fn unrelated_frequencies_use_lcm() {
    let signals = [SignalSpec::new(3.3, [0]).unwrap(), SignalSpec::new(5.3, [1]).unwrap()];
    let config = CompilerConfig::default().with_t_max(1_000_000_000_000);
    let sync = minimum_duration_and_num_cycles(&signals, &[], None, &config).unwrap();
    // Periods rounded to the 100 us grid: 303.0 ms and 188.7 ms
    assert_eq!(sync.duration, 190_587_000_000);
    assert_eq!(sync.nr_cycles, sync.duration / 20);
}

#[test]
#[should_panic(expected = "too large")]
fn unrelated_frequencies_above_ceiling() {
    let signals = [SignalSpec::new(3.3, [0]).unwrap(), SignalSpec::new(5.3, [1]).unwrap()];
    generate_repeating_pulses(&signals, &[], &CompilerConfig::default()).unwrap();
}

#[test]
fn masking_gates_shared_channel() {
    // 1 kHz on channel 0, let through during the first half of every 4 ms mask period.
    // The 125 Hz signal on channel 1 stretches the program over two mask periods.
    let signals = [SignalSpec::new(1e3, [0]).unwrap(), SignalSpec::new(125., [1]).unwrap()];
    let masking = [SignalSpec::new(250., [0]).unwrap()];
    let seq = generate_repeating_pulses(&signals, &masking, &CompilerConfig::default()).unwrap();
    assert_eq!(seq.total_duration(), 8_000_000);

    let quantum = 500_000;
    let times = seq.cumulative_times();
    let trace = seq.channel_trace(0).unwrap();
    for step in 0..trace.len() - 1 {
        let mut t = times[step];
        while t < times[step + 1] {
            let primary = (t / quantum) % 2 == 0;
            let mask_open = t % 4_000_000 < 2_000_000;
            assert_eq!(trace[step], (primary && mask_open) as u8, "channel 0 at {} ns", t);
            t += quantum;
        }
    }
    assert_eq!(high_runs(&seq, 0), vec![quantum; 4]);
    // Channel 1 is not masked
    assert_eq!(high_runs(&seq, 1), vec![4_000_000]);
}

#[test]
fn active_low_signal_is_complemented() {
    let signals = [SignalSpec::build(10., [2], 0, 0.5, 0, false).unwrap()];
    let seq = generate_repeating_pulses(&signals, &[], &CompilerConfig::default()).unwrap();
    // Low while the signal is on, high in the terminal all-off state
    assert_eq!(seq.channel_trace(2).unwrap(), vec![0, 1]);
    let last = seq.instructions().last().unwrap();
    assert_eq!(last.flags, 1 << 2 | 0b111 << 21);
}

#[test]
fn assembled_loop_unrolls() {
    let code = "0x000001, 100ns, LOOP, 5 \n 0x000000, 200ns, END_LOOP \n 0x000001, 100ns, STOP";
    let seq = code_to_instructions(code, &AssemblerConfig::default()).unwrap();
    assert_eq!(seq.instructions().len(), 3);
    assert_eq!(seq.durations().len(), 11);
    assert_eq!(seq.flags().dim(), (11, 24));
    assert_eq!(seq.branch_index(), None);
    assert_eq!(seq.total_duration(), 5 * 300 + 100);
    assert_eq!(seq.active_channels(&[]).unwrap(), vec![0]);
    assert!(seq.active_channels(&[0]).unwrap().is_empty());
}

#[test]
fn structural_errors_name_the_line() {
    let config = AssemblerConfig::default();
    let cases = [
        ("0x0, 10ns\n0x0, 10ns, END_LOOP", 2),
        ("0x0, 10ns, LOOP, 3\n0x0, 10ns\n0x0, 10ns", 1),
        ("0x0, 10ns\n0x0, 10ns\n0x0, 10ns, RTS", 3),
    ];
    for (code, line) in cases {
        let err = code_to_instructions(code, &config).unwrap_err();
        assert_eq!(err.line(), Some(line), "{}", err);
    }
}

#[test]
fn unbounded_control_flow_fails() {
    let recursion = vec![Instruction::new(0, 100, Opcode::JSR, 0)];
    assert!(matches!(
        InstructionSequence::new(recursion, 24),
        Err(CompileError::ControlFlow { address: 0, .. })
    ));

    let config = AssemblerConfig {
        nr_flags: 24,
        unroll: UnrollLimits {
            max_steps: 100,
            max_depth: 8,
        },
    };
    let err = code_to_instructions("0x1, 10ns, LOOP, 1000\n0x0, 10ns, END_LOOP", &config).unwrap_err();
    assert!(err.to_string().contains("exceeded 100 steps"));
}

#[test]
fn rounding_ties_go_to_even() {
    assert_eq!(round_u64(2.5), 2);
    assert_eq!(round_u64(3.5), 4);
    assert_eq!(round_to_nearest_n_ns(150, 100), 200);
    assert_eq!(round_to_nearest_n_ns(250, 100), 200);
}

#[test]
fn duty_cycle_ties_round_to_even() {
    // 10 MHz in 20 ns steps: a period of 5 steps whose half-duty high count is the tie 2.5
    let signals = [SignalSpec::new(1e7, [0]).unwrap()];
    let config = CompilerConfig::default().with_rounding(1, 4).with_channels(4, 0);
    let seq = generate_repeating_pulses(&signals, &[], &config).unwrap();

    assert_eq!(seq.durations(), &[40, 40, 20]);
    assert_eq!(seq.channel_trace(0).unwrap(), vec![1, 0, 0]);
    assert_eq!(high_runs(&seq, 0), vec![40]);
    assert_eq!(seq.total_duration(), 100);
}
