//! Queue-level planner invariants, checked by driving the machine directly
//! without running the clock.

use steprun::gcode::parser::gcode_parser;
use steprun::machine::Machine;
use steprun::planner::{BlockType, BufferState, JUNCTION_UNLIMITED};
use steprun::ExecOutcome;

fn queued_alines(machine: &Machine) -> Vec<usize> {
    let q = &machine.mp1.q;
    let mut out = Vec::new();
    let mut i = q.r;
    loop {
        if q.blocks[i].buffer_state == BufferState::Empty {
            break;
        }
        if q.blocks[i].block_type == BlockType::Aline {
            out.push(i);
        }
        i = q.next(i);
        if i == q.w {
            break;
        }
    }
    out
}

#[test]
fn sharp_corner_limits_the_boundary_velocity() {
    let mut machine = Machine::sim();
    gcode_parser(&mut machine, "G1 X10 F600").unwrap();
    gcode_parser(&mut machine, "G1 Y10").unwrap();
    machine.mp_planner_callback();

    let blocks = queued_alines(&machine);
    assert_eq!(blocks.len(), 2);
    let first = &machine.mp1.q.blocks[blocks[0]];

    // a 90 degree corner carries a junction limit far below the feed rate
    assert!(first.junction_vmax < 200.0, "junction {}", first.junction_vmax);
    assert!(first.junction_vmax > 0.0);
    // back-planning respected it
    assert!(first.exit_velocity <= first.junction_vmax + 1e-9);
    assert!(first.exit_velocity > 0.0);
}

#[test]
fn colinear_boundaries_plan_at_cruise() {
    let mut machine = Machine::sim();
    for i in 1..=30 {
        let line = format!("G1 X{:.1} F3000", i as f64 * 0.5);
        gcode_parser(&mut machine, &line).unwrap();
    }
    machine.mp_planner_callback();

    let blocks = queued_alines(&machine);
    assert_eq!(blocks.len(), 30);

    // colinear continuation: no junction limit anywhere
    for &i in &blocks[..29] {
        assert_eq!(machine.mp1.q.blocks[i].junction_vmax, JUNCTION_UNLIMITED);
    }
    // away from the end-of-queue braking tail every boundary runs at cruise
    for &i in &blocks[..20] {
        let b = &machine.mp1.q.blocks[i];
        assert!(
            (b.exit_velocity - 3000.0).abs() < 1.0,
            "block {} exit {}",
            i,
            b.exit_velocity
        );
    }
    // the tail of the queue ramps down to a stop
    let last = &machine.mp1.q.blocks[blocks[29]];
    assert_eq!(last.exit_velocity, 0.0);
}

#[test]
fn forward_plan_fills_exactly_one_block() {
    let mut machine = Machine::sim();
    gcode_parser(&mut machine, "G1 X100 F6000").unwrap();
    gcode_parser(&mut machine, "G1 X200").unwrap();
    machine.mp_planner_callback();

    assert_eq!(machine.mp_forward_plan(), ExecOutcome::Done);
    let blocks = queued_alines(&machine);
    assert_eq!(
        machine.mp1.q.blocks[blocks[0]].buffer_state,
        BufferState::FullyPlanned
    );
    // the second block stays back-planned until its predecessor runs
    assert_eq!(
        machine.mp1.q.blocks[blocks[1]].buffer_state,
        BufferState::BackPlanned
    );
    assert_eq!(machine.mp_forward_plan(), ExecOutcome::Noop);
}

#[test]
fn planned_sections_sum_to_block_length() {
    let mut machine = Machine::sim();
    gcode_parser(&mut machine, "G1 X100 F6000").unwrap();
    machine.mp_planner_callback();
    assert_eq!(machine.mp_forward_plan(), ExecOutcome::Done);

    let p = machine.mr.p;
    let b = &machine.mr.blocks[p];
    let total = b.head_length + b.body_length + b.tail_length;
    assert!((total - 100.0).abs() < 1e-3, "sections sum to {}", total);
    assert!(b.head_length > 0.0 && b.body_length > 0.0 && b.tail_length > 0.0);
    // symmetric profile from rest to rest
    assert!((b.head_length - b.tail_length).abs() < 1e-6);
    assert!((b.cruise_velocity - 6000.0).abs() < 1e-6);
    assert_eq!(b.exit_velocity, 0.0);
}

#[test]
fn velocity_ordering_invariants_hold_across_the_queue() {
    let mut machine = Machine::sim();
    let program = [
        "G1 X10 F3000",
        "G1 X20 Y5",
        "G1 X5 Y10 F1200",
        "G1 X0 Y0 F6000",
    ];
    for line in program {
        gcode_parser(&mut machine, line).unwrap();
    }
    machine.mp_planner_callback();

    for &i in &queued_alines(&machine) {
        let b = &machine.mp1.q.blocks[i];
        assert!(b.exit_velocity <= b.cruise_vmax + 1e-9);
        assert!(b.cruise_vmax <= b.absolute_vmax + 1e-9);
        assert!(b.exit_velocity <= b.junction_vmax + 1e-9);
        assert!(b.exit_velocity >= 0.0);
        // unit vector is normalized over the participating axes
        let mag: f64 = b.unit.iter().map(|u| u * u).sum();
        assert!((mag - 1.0).abs() < 1e-9);
    }
}

#[test]
fn moves_before_commands_plan_to_a_stop() {
    let mut machine = Machine::sim();
    gcode_parser(&mut machine, "G1 X10 F3000").unwrap();
    gcode_parser(&mut machine, "G4 P0.2").unwrap();
    gcode_parser(&mut machine, "G1 X20").unwrap();
    machine.mp_planner_callback();

    let blocks = queued_alines(&machine);
    assert_eq!(blocks.len(), 2);
    // the dwell forces the first move to a zero exit
    assert_eq!(machine.mp1.q.blocks[blocks[0]].exit_velocity, 0.0);
}

#[test]
fn planner_full_is_back_pressure_not_loss() {
    let mut machine = Machine::sim();
    let mut queued = 0;
    for i in 1..200 {
        let line = format!("G1 X{} F3000", i);
        match gcode_parser(&mut machine, &line) {
            Ok(_) => queued += 1,
            Err(e) => {
                assert_eq!(e, steprun::Status::PlannerQueueFull);
                break;
            }
        }
    }
    // the ring admits its full capacity and then refuses cleanly
    assert_eq!(queued, 48);
    assert_eq!(machine.mp1.buffers_available(), 0);
}

#[test]
fn zero_length_moves_queue_nothing() {
    let mut machine = Machine::sim();
    gcode_parser(&mut machine, "G0 X0 Y0 Z0").unwrap();
    assert!(!machine.mp1.has_runnable_buffer());
    gcode_parser(&mut machine, "G91").unwrap();
    gcode_parser(&mut machine, "G1 X0 F600").unwrap();
    assert!(!machine.mp1.has_runnable_buffer());
}
