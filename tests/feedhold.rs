//! Feed-hold behavior: in-flight deceleration, stopped-state commands,
//! resume, and queue flush.

use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;

use steprun::canon::{HoldState, MachineState};
use steprun::controller::Controller;
use steprun::machine::{Machine, PlannerSel};

#[derive(Clone, Default)]
struct Sink(Arc<Mutex<Vec<u8>>>);

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn controller() -> Controller {
    let mut c = Controller::new(Machine::sim(), Box::new(Sink::default()));
    c.set_line_state(true, true);
    c
}

const X_STEPS_PER_MM: f64 = 40.0;

#[test]
fn hold_decelerates_and_resume_completes_the_move() {
    let mut c = controller();
    c.provide_input("G1 X50 F3000\n");
    c.run_for_ms(300); // well inside the cruise body

    let at_hold_request = c.machine.mr.position[0];
    assert!(at_hold_request > 1.0 && at_hold_request < 45.0);

    c.provide_input("!");
    c.run_for_ms(500);

    let machine = &c.machine;
    assert_eq!(machine.hold.get(), HoldState::MotionStopped);
    assert!(!machine.st_runtime_isbusy());
    assert_eq!(machine.cm.machine_state, MachineState::Cycle);

    // monotonic deceleration: stopped past the request point, short of the end
    let stopped_at = machine.mr.position[0];
    assert!(stopped_at >= at_hold_request);
    assert!(stopped_at < 50.0);

    // position agrees with the pulses the motor actually saw
    let steps = machine.sim_hw().step_counts[0] as f64;
    assert!(
        (steps - stopped_at * X_STEPS_PER_MM).abs() <= 4.0,
        "steps {} vs position {}",
        steps,
        stopped_at
    );

    // resume: the move completes to its original target
    c.provide_input("~");
    assert!(c.run_until_idle(20_000));
    let machine = &c.machine;
    assert!((machine.cm.position[0] - 50.0).abs() < 1e-9);
    assert!((machine.mr.position[0] - 50.0).abs() < 1e-6);
    let steps = machine.sim_hw().step_counts[0];
    assert!((steps - 2000).abs() <= 4, "final steps {}", steps);
}

#[test]
fn commands_execute_while_held() {
    let mut c = controller();
    c.provide_input("M3 S800\nG1 X50 F3000\n");
    c.run_for_ms(300);
    c.provide_input("!");
    c.run_for_ms(400);
    assert_eq!(c.machine.hold.get(), HoldState::MotionStopped);
    assert_eq!(c.machine.planner_sel, PlannerSel::Secondary);

    // spindle off while held goes through the secondary queue
    c.provide_input("M5\n");
    c.run_for_ms(100);
    let events = c
        .machine
        .peripherals
        .as_recording()
        .unwrap()
        .events
        .clone();
    assert!(events.iter().any(|e| e.contains("spindle Off")));

    // a move while held is rejected, not queued
    c.provide_input("G1 X60\n");
    c.run_for_ms(50);
    assert_eq!(c.machine.hold.get(), HoldState::MotionStopped);

    c.provide_input("~");
    assert!(c.run_until_idle(20_000));
    assert_eq!(c.machine.planner_sel, PlannerSel::Primary);
    assert!((c.machine.cm.position[0] - 50.0).abs() < 1e-9);
}

#[test]
fn queue_flush_abandons_the_remainder() {
    let mut c = controller();
    c.provide_input("G1 X50 F3000\nG1 X80\n");
    c.run_for_ms(300);
    c.provide_input("!");
    c.run_for_ms(400);
    assert_eq!(c.machine.hold.get(), HoldState::MotionStopped);
    let stopped_at = c.machine.mr.position[0];

    c.provide_input("%");
    c.run_for_ms(10);
    // the queue is gone; planner and model positions collapse to the stop
    assert!(!c.machine.mp1.has_runnable_buffer());
    assert!((c.machine.cm.position[0] - stopped_at).abs() < 1e-6);

    c.provide_input("~");
    assert!(c.run_until_idle(10_000));
    // nothing left to run; the machine stays where it stopped
    assert!((c.machine.mr.position[0] - stopped_at).abs() < 1e-6);
}

#[test]
fn resume_dwell_settles_before_motion_restarts() {
    let mut c = controller();
    c.machine.cfg.resume_dwell = 0.2;
    c.provide_input("G1 X50 F3000\n");
    c.run_for_ms(300);
    c.provide_input("!");
    assert!(c.run_until_hold(5_000));
    let stopped_at = c.machine.mr.position[0];

    c.provide_input("~");
    c.run_for_ms(100);
    // the hold has released but the settle dwell is still counting down
    assert_eq!(c.machine.hold.get(), HoldState::Off);
    assert!(c.machine.st_runtime_isbusy());
    assert!((c.machine.mr.position[0] - stopped_at).abs() < 1e-9);

    assert!(c.run_until_idle(20_000));
    assert!((c.machine.mr.position[0] - 50.0).abs() < 1e-6);
}

#[test]
fn hold_during_ramp_waits_for_body() {
    let mut c = controller();
    c.provide_input("G1 X50 F3000\n");
    // the head of this move lasts ~90ms; ask for a hold inside it
    c.run_for_ms(50);
    c.provide_input("!");
    assert!(c.run_until_hold(5_000));
    // still stopped cleanly even though the request landed mid-ramp
    assert!(!c.machine.st_runtime_isbusy());
    let stopped_at = c.machine.mr.position[0];
    assert!(stopped_at > 0.0 && stopped_at < 50.0);

    c.provide_input("~");
    assert!(c.run_until_idle(20_000));
    assert!((c.machine.mr.position[0] - 50.0).abs() < 1e-6);
}
