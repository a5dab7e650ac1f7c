//! End-to-end runs through the whole pipeline: G-code in, step pulses out,
//! on simulated hardware with the deterministic clock.

use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;

use steprun::controller::Controller;
use steprun::machine::Machine;

#[derive(Clone, Default)]
struct Sink(Arc<Mutex<Vec<u8>>>);

impl Sink {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn run_program(program: &str, max_ms: u64) -> (Controller, Sink) {
    let sink = Sink::default();
    let mut c = Controller::new(Machine::sim(), Box::new(sink.clone()));
    c.set_line_state(true, true);
    c.provide_input(program);
    assert!(c.run_until_idle(max_ms), "program did not drain in time");
    (c, sink)
}

const X_STEPS_PER_MM: f64 = 40.0;

#[test]
fn single_line_move_runs_to_position() {
    // 100mm at F6000 (100 mm/s): symmetric ramps with a long cruise body
    let (c, _) = run_program("G21 G90 G0 X0 Y0 Z0\nG1 X100 F6000\n", 10_000);
    let machine = &c.machine;

    assert!((machine.cm.position[0] - 100.0).abs() < 1e-9);
    assert!((machine.mr.position[0] - 100.0).abs() < 1e-6);

    let steps = machine.sim_hw().step_counts[0];
    let expected = (100.0 * X_STEPS_PER_MM) as i64;
    assert!(
        (steps - expected).abs() <= 4,
        "expected ~{} steps, got {}",
        expected,
        steps
    );

    // jerk-limited ramps put a floor under the move time:
    // cruise 6000 mm/min over 100mm is ~1s plus two ramps
    let elapsed = machine.tb.systick_ms;
    assert!(elapsed > 1_000, "move finished implausibly fast: {}ms", elapsed);
    assert!(elapsed < 2_000, "move took too long: {}ms", elapsed);
}

#[test]
fn colinear_chain_merges_into_cruise() {
    // many short colinear moves back-plan into a continuous run
    let mut program = String::new();
    for i in 1..=30 {
        program.push_str(&format!("G1 X{:.1} F3000\n", i as f64 * 0.5));
    }
    let (c, _) = run_program(&program, 20_000);
    let machine = &c.machine;

    assert!((machine.cm.position[0] - 15.0).abs() < 1e-9);
    let steps = machine.sim_hw().step_counts[0];
    assert!((steps - 600).abs() <= 4, "got {} steps", steps);

    // a continuous cruise at 50 mm/s covers 15mm in ~300ms plus ramps;
    // anything over a second would mean the chain planned to stops
    let elapsed = machine.tb.systick_ms;
    assert!(elapsed < 1_000, "chain did not merge: {}ms", elapsed);
}

#[test]
fn dwell_pauses_between_moves() {
    let (c, _) = run_program("G1 X5 F6000\nG4 P0.5\nG1 X10\n", 30_000);
    let machine = &c.machine;

    assert!((machine.cm.position[0] - 10.0).abs() < 1e-9);
    let steps = machine.sim_hw().step_counts[0];
    assert!((steps - 400).abs() <= 4);

    // two short moves plus the 500ms dwell
    let elapsed = machine.tb.systick_ms;
    assert!(elapsed >= 900, "dwell did not run: {}ms", elapsed);
}

#[test]
fn checksummed_line_is_accepted() {
    let body = "N5 G1 X1 F600";
    let sum = body.bytes().fold(0u8, |a, b| a ^ b);
    let program = format!("{}*{}\n", body, sum);
    let (c, sink) = run_program(&program, 10_000);
    assert!((c.machine.cm.position[0] - 1.0).abs() < 1e-9);
    assert!(!sink.text().contains("\"er\""));
}

#[test]
fn checksum_mismatch_rejects_block() {
    let body = "N5 G1 X1 F600";
    let sum = body.bytes().fold(0u8, |a, b| a ^ b).wrapping_add(1);
    let program = format!("{}*{}\n", body, sum);
    let (c, sink) = run_program(&program, 5_000);
    // block rejected, planner untouched
    assert_eq!(c.machine.cm.position[0], 0.0);
    assert_eq!(c.machine.sim_hw().step_counts[0], 0);
    assert!(sink.text().contains("\"er\""));
}

#[test]
fn pulse_trains_are_deterministic() {
    let program = "G1 X20 Y7.5 F4000\nG1 X0 Y0\nG4 P0.1\nG1 X3.25 F1000\n";
    let (a, _) = run_program(program, 60_000);
    let (b, _) = run_program(program, 60_000);
    assert_eq!(a.machine.sim_hw().raw_pulses, b.machine.sim_hw().raw_pulses);
    assert_eq!(a.machine.sim_hw().step_counts, b.machine.sim_hw().step_counts);
    assert_eq!(a.machine.tb.systick_ms, b.machine.tb.systick_ms);
}

#[test]
fn fractional_target_lands_within_one_step() {
    let (c, _) = run_program("G1 X33.333 F6000\n", 10_000);
    let steps = c.machine.sim_hw().step_counts[0];
    let expected = 33.333 * X_STEPS_PER_MM; // 1333.3 steps
    assert!(
        (steps as f64 - expected).abs() <= 3.0,
        "expected ~{:.1} steps, got {}",
        expected,
        steps
    );
}

#[test]
fn work_offsets_apply_to_targets() {
    let (c, _) = run_program("G10 L2 P1 X10\nG0 X0\n", 10_000);
    let machine = &c.machine;
    // work X0 sits at machine X10 under the G54 offset
    assert!((machine.cm.position[0] - 10.0).abs() < 1e-9);
    assert!((machine.cm.work_position(0) - 0.0).abs() < 1e-9);
}

#[test]
fn g92_shifts_the_frame() {
    let (c, _) = run_program("G0 X10\nG92 X0\nG0 X5\n", 20_000);
    assert!((c.machine.cm.position[0] - 15.0).abs() < 1e-9);
}

#[test]
fn inch_mode_scales_moves() {
    let (c, _) = run_program("G20\nG1 X1 F60\n", 120_000);
    assert!((c.machine.cm.position[0] - 25.4).abs() < 1e-9);
}

#[test]
fn spindle_and_coolant_commands_sequence_with_motion() {
    let (c, _) = run_program("M3 S1000\nG1 X2 F6000\nM9\nM5\n", 20_000);
    let events = &c
        .machine
        .peripherals
        .as_recording()
        .expect("recording peripherals")
        .events;
    assert!(events.iter().any(|e| e.contains("spindle-speed 1000")));
    assert!(events.iter().any(|e| e.contains("spindle Cw")));
    assert!(events.iter().any(|e| e.contains("spindle Off")));
    assert!(events.iter().any(|e| e.contains("coolant Both false")));
}

#[test]
fn message_comment_reaches_the_sink() {
    let (c, sink) = run_program("G4 P0.01 (MSG hello there)\nM100 ({\"xvm\":null})\n", 10_000);
    let events = &c
        .machine
        .peripherals
        .as_recording()
        .unwrap()
        .events;
    assert!(events.iter().any(|e| e.contains("hello there")));
    assert!(sink.text().contains("50000")); // xvm default reported
}

#[test]
fn arc_interpolates_to_target() {
    // quarter circle X0Y0 -> X10Y10 about center (0,10)
    let (c, _) = run_program("G17 G90\nG2 X10 Y10 I0 J10 F3000\n", 30_000);
    let machine = &c.machine;
    assert!((machine.cm.position[0] - 10.0).abs() < 1e-9);
    assert!((machine.cm.position[1] - 10.0).abs() < 1e-9);
    let sx = machine.sim_hw().step_counts[0];
    let sy = machine.sim_hw().step_counts[1];
    assert!((sx - 400).abs() <= 4, "X ended at {} steps", sx);
    assert!((sy - 400).abs() <= 4, "Y ended at {} steps", sy);
}

#[test]
fn program_stop_holds_until_cycle_start() {
    let sink = Sink::default();
    let mut c = Controller::new(Machine::sim(), Box::new(sink.clone()));
    c.set_line_state(true, true);
    c.provide_input("G1 X5 F6000\nM0\nG1 X10\n");

    // the stream stops at the M0
    assert!(!c.run_until_idle(5_000));
    assert_eq!(
        c.machine.cm.machine_state,
        steprun::canon::MachineState::ProgramStop
    );
    let at_stop = c.machine.mr.position[0];
    assert!((at_stop - 5.0).abs() < 0.01);

    // cycle start resumes the remainder
    c.provide_input("~");
    assert!(c.run_until_idle(10_000));
    assert!((c.machine.cm.position[0] - 10.0).abs() < 1e-9);
    assert!((c.machine.mr.position[0] - 10.0).abs() < 1e-6);
}
