//! Step pulse engine: segment preparation, the one-slot loader handoff, and
//! the fixed-rate DDA that turns prepared segments into step edges.
//!
//! Ownership of the prep slot alternates between the executor (which fills
//! it) and the loader (which copies it into the run structure when the DDA
//! finishes the previous segment). The owner field is the release/acquire
//! flag for that handoff.

use std::sync::atomic::{AtomicU8, Ordering};

use log::debug;

use crate::hardware::Direction;
use crate::machine::Machine;
use crate::math;
use crate::planner::{BlockType, CommandPayload};
use crate::status::Status;
use crate::MOTORS;

/// DDA clock rate, Hz.
pub const FREQUENCY_DDA: f64 = 200_000.0;
/// System tick (dwell clock) rate, Hz.
pub const FREQUENCY_DWELL: f64 = 1_000.0;
/// Substeps per microstep in the DDA accumulator.
pub const DDA_SUBSTEPS: i32 = 32;

// step-error "nudge" correction
pub const STEP_CORRECTION_THRESHOLD: f64 = 2.0;
pub const STEP_CORRECTION_FACTOR: f64 = 0.25;
pub const STEP_CORRECTION_MAX: f64 = 0.6;
pub const STEP_CORRECTION_HOLDOFF: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepOwner {
    Exec,
    Loader,
}

/// SPSC ownership flag for the prep slot.
#[derive(Debug)]
pub struct PrepOwnerCell(AtomicU8);

impl Default for PrepOwnerCell {
    fn default() -> Self {
        PrepOwnerCell(AtomicU8::new(0))
    }
}

impl PrepOwnerCell {
    pub fn get(&self) -> PrepOwner {
        if self.0.load(Ordering::Acquire) == 0 {
            PrepOwner::Exec
        } else {
            PrepOwner::Loader
        }
    }

    pub fn set(&self, owner: PrepOwner) {
        let v = if owner == PrepOwner::Exec { 0 } else { 1 };
        self.0.store(v, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PrepMotor {
    pub direction: Direction,
    pub prev_direction: Direction,
    pub step_sign: i8,
    pub substep_increment: i32,
    pub accumulator_correction: f64,
    pub accumulator_correction_flag: bool,
    pub prev_segment_time: f64,
    pub correction_holdoff: i32,
    /// Running total of injected correction steps, for diagnostics.
    pub corrected_steps: f64,
}

impl Default for PrepMotor {
    fn default() -> Self {
        PrepMotor {
            direction: Direction::Cw,
            prev_direction: Direction::Cw,
            step_sign: 1,
            substep_increment: 0,
            accumulator_correction: 1.0,
            accumulator_correction_flag: false,
            prev_segment_time: 0.0,
            correction_holdoff: 0,
            corrected_steps: 0.0,
        }
    }
}

/// The staging slot filled by the executor and consumed by the loader.
#[derive(Debug, Default)]
pub struct PrepSlot {
    pub owner: PrepOwnerCell,
    pub block_type: BlockType,
    pub dda_ticks: i32,
    pub dda_ticks_x_substeps: i32,
    pub dwell_ticks: u32,
    pub command: Option<CommandPayload>,
    pub motors: [PrepMotor; MOTORS],
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunMotor {
    pub substep_increment: i32,
    /// Signed accumulator; steps fire on zero crossings from the positive
    /// side. Stays within (-dda_ticks_x_substeps, 0] between ticks.
    pub substep_accumulator: i32,
    pub step_sign: i8,
}

/// Live DDA state consumed by the step interrupt.
#[derive(Debug, Default)]
pub struct StepperRun {
    pub dda_ticks_downcount: i32,
    pub dda_ticks_x_substeps: i32,
    pub dwell_ticks_downcount: u32,
    pub motors: [RunMotor; MOTORS],
}

impl Machine {
    /// True while motors are stepping or a dwell is counting down.
    pub fn st_runtime_isbusy(&self) -> bool {
        self.st_run.dda_ticks_downcount != 0 || self.st_run.dwell_ticks_downcount != 0
    }

    /// Reset stepper internals; used at init and to stop movement.
    pub fn stepper_reset(&mut self) {
        self.tb.dda_timer_running = false;
        self.st_run.dda_ticks_downcount = 0;
        self.st_run.dwell_ticks_downcount = 0;
        self.st_pre.owner.set(PrepOwner::Exec); // must be EXEC or it won't restart
        for m in 0..MOTORS {
            self.st_pre.motors[m].prev_direction = Direction::Cw;
            self.st_pre.motors[m].direction = Direction::Cw;
            self.st_pre.motors[m].prev_segment_time = 0.0;
            self.st_pre.motors[m].corrected_steps = 0.0;
            self.st_run.motors[m].substep_accumulator = 0;
            self.st_run.motors[m].substep_increment = 0;
        }
        self.mp_set_steps_to_runtime_position();
    }

    /// One DDA clock tick. Clears the previous tick's step edges, runs each
    /// motor's accumulator, and loads the next segment when this one ends.
    pub fn st_dda_tick(&mut self) {
        for m in 0..MOTORS {
            self.hw.step_end(m);
        }
        if self.st_run.dda_ticks_downcount == 0 {
            // stop the clock or it keeps walking past the end of the segment
            self.tb.dda_timer_running = false;
            return;
        }
        let ticks_x_substeps = self.st_run.dda_ticks_x_substeps;
        for m in 0..MOTORS {
            let increment = self.st_run.motors[m].substep_increment;
            if increment == 0 {
                continue;
            }
            self.st_run.motors[m].substep_accumulator += increment;
            if self.st_run.motors[m].substep_accumulator > 0 {
                self.st_run.motors[m].substep_accumulator -= ticks_x_substeps;
                self.hw.step_start(m);
                let sign = self.st_run.motors[m].step_sign;
                self.enc.increment(m, sign);
            }
        }
        self.st_run.dda_ticks_downcount -= 1;
        if self.st_run.dda_ticks_downcount == 0 {
            self.st_load_move(); // at the same interrupt level
        }
    }

    /// System tick: the dwell countdown runs here.
    pub fn st_systick(&mut self) {
        if self.st_run.dwell_ticks_downcount > 0 {
            self.st_run.dwell_ticks_downcount -= 1;
            if self.st_run.dwell_ticks_downcount == 0 {
                self.st_load_move();
            }
        }
    }

    /// Request a load from outside the DDA interrupt.
    pub fn st_request_load_move(&mut self) {
        if self.st_runtime_isbusy() {
            return; // the segment-end path will load instead
        }
        if self.st_pre.owner.get() == PrepOwner::Loader {
            self.st_load_move();
        }
    }

    /// Copy the prep slot into the run structures and start the DDA. Must
    /// only run at (or above) DDA priority.
    pub fn st_load_move(&mut self) {
        if self.st_runtime_isbusy() {
            return;
        }
        if self.st_pre.owner.get() != PrepOwner::Loader {
            // nothing to load; begin the motor power timeout
            self.last_motion_ms = self.tb.systick_ms;
            return;
        }

        match self.st_pre.block_type {
            BlockType::Aline => {
                self.st_run.dda_ticks_downcount = self.st_pre.dda_ticks;
                self.st_run.dda_ticks_x_substeps = self.st_pre.dda_ticks_x_substeps;
                let ticks_x_substeps = self.st_run.dda_ticks_x_substeps;

                for m in 0..MOTORS {
                    let increment = self.st_pre.motors[m].substep_increment;
                    self.st_run.motors[m].substep_increment = increment;
                    if increment == 0 {
                        // a skipped motor keeps its accumulator; state
                        // comparisons below run against its last live segment
                        continue;
                    }
                    if self.st_pre.motors[m].accumulator_correction_flag {
                        // time base changed since the last segment
                        self.st_pre.motors[m].accumulator_correction_flag = false;
                        let correction = self.st_pre.motors[m].accumulator_correction;
                        let acc = self.st_run.motors[m].substep_accumulator;
                        self.st_run.motors[m].substep_accumulator =
                            (acc as f64 * correction) as i32;
                    }
                    if self.st_pre.motors[m].direction != self.st_pre.motors[m].prev_direction {
                        // direction flip: reflect the accumulator about its
                        // midpoint to preserve the partial step
                        self.st_pre.motors[m].prev_direction = self.st_pre.motors[m].direction;
                        let acc = self.st_run.motors[m].substep_accumulator;
                        self.st_run.motors[m].substep_accumulator = -(ticks_x_substeps + acc);
                        let dir = self.st_pre.motors[m].direction;
                        self.hw.set_direction(m, dir);
                    }
                    self.hw.motor_enable(m);
                    self.st_run.motors[m].step_sign = self.st_pre.motors[m].step_sign;
                    self.enc.accumulate(m);
                }
                self.motors_energized = true;
                self.last_motion_ms = self.tb.systick_ms;
                self.tb.dda_timer_running = true;
            }
            BlockType::Dwell => {
                self.st_run.dwell_ticks_downcount = self.st_pre.dwell_ticks;
                // the DDA clock stays stopped; the system tick counts it out
            }
            BlockType::Null => {}
            _ => {
                if let Some(payload) = self.st_pre.command.take() {
                    self.run_command(payload);
                }
            }
        }

        self.st_pre.block_type = BlockType::Null;
        self.st_pre.owner.set(PrepOwner::Exec);
        self.tb.request_exec(); // execute and prepare the next move
    }

    /// Prepare the next aline segment for the loader. Works in motor space
    /// (steps), not length units. Fractional steps are expected.
    pub fn st_prep_line(
        &mut self,
        travel_steps: &mut [f64; MOTORS],
        following_error: &[f64; MOTORS],
        segment_time: f64,
    ) -> Result<(), Status> {
        if self.st_pre.owner.get() != PrepOwner::Exec {
            return Err(self.cm_panic(Status::PrepSyncErrorPanic, "st_prep_line"));
        }
        if segment_time.is_infinite() {
            return Err(self.cm_panic(Status::SegmentTimeIsInfinitePanic, "st_prep_line"));
        }
        if segment_time.is_nan() {
            return Err(self.cm_panic(Status::SegmentTimeIsNanPanic, "st_prep_line"));
        }

        // convert minutes to seconds to DDA ticks
        self.st_pre.dda_ticks = (segment_time * 60.0 * FREQUENCY_DDA) as i32;
        self.st_pre.dda_ticks_x_substeps = self.st_pre.dda_ticks * DDA_SUBSTEPS;

        for m in 0..MOTORS {
            if math::fp_zero(travel_steps[m]) {
                // increment doubles as the motor-active flag
                self.st_pre.motors[m].substep_increment = 0;
                continue;
            }

            let polarity = self.cfg.motors[m].polarity;
            if travel_steps[m] >= 0.0 {
                self.st_pre.motors[m].direction = Direction::Cw.with_polarity(polarity);
                self.st_pre.motors[m].step_sign = 1;
            } else {
                self.st_pre.motors[m].direction = Direction::Ccw.with_polarity(polarity);
                self.st_pre.motors[m].step_sign = -1;
            }

            // accumulator correction is computed against the last segment
            // time this motor actually ran, even across dormant segments
            if (segment_time - self.st_pre.motors[m].prev_segment_time).abs() > 1.0e-7 {
                if self.st_pre.motors[m].prev_segment_time > 1.0e-12 {
                    self.st_pre.motors[m].accumulator_correction_flag = true;
                    self.st_pre.motors[m].accumulator_correction =
                        segment_time / self.st_pre.motors[m].prev_segment_time;
                }
                self.st_pre.motors[m].prev_segment_time = segment_time;
            }

            // 'nudge' correction: inject one bounded correction, then hold off
            self.st_pre.motors[m].correction_holdoff -= 1;
            if self.st_pre.motors[m].correction_holdoff < 0
                && following_error[m].abs() > STEP_CORRECTION_THRESHOLD
            {
                self.st_pre.motors[m].correction_holdoff = STEP_CORRECTION_HOLDOFF;
                let mut correction = following_error[m] * STEP_CORRECTION_FACTOR;
                if correction > 0.0 {
                    correction = correction
                        .min(travel_steps[m].abs())
                        .min(STEP_CORRECTION_MAX);
                } else {
                    correction = correction
                        .max(-travel_steps[m].abs())
                        .max(-STEP_CORRECTION_MAX);
                }
                self.st_pre.motors[m].corrected_steps += correction;
                travel_steps[m] -= correction;
            }

            // The accumulator must be exactly the fractional steps times the
            // substep multiplier or positional drift will occur. Rounding
            // removes the negative bias of the integer conversion.
            self.st_pre.motors[m].substep_increment =
                (travel_steps[m].abs() * DDA_SUBSTEPS as f64).round() as i32;
        }
        self.st_pre.block_type = BlockType::Aline;
        self.st_pre.owner.set(PrepOwner::Loader);
        Ok(())
    }

    /// Keep the loader fed when there is nothing to do.
    pub fn st_prep_null(&mut self) {
        self.st_pre.block_type = BlockType::Null;
        self.st_pre.owner.set(PrepOwner::Exec);
    }

    /// Stage a command payload for execution at its place in the stream.
    pub fn st_prep_command(&mut self, payload: Option<CommandPayload>) {
        self.st_pre.block_type = BlockType::Command;
        self.st_pre.command = payload;
        self.st_pre.owner.set(PrepOwner::Loader);
    }

    /// Stage a dwell, in microseconds.
    pub fn st_prep_dwell(&mut self, microseconds: f64) {
        self.st_pre.block_type = BlockType::Dwell;
        self.st_pre.dwell_ticks = (((microseconds / 1.0e6) * FREQUENCY_DWELL) as u32).max(1);
        self.st_pre.owner.set(PrepOwner::Loader);
    }

    /// Queue a dwell directly to the loader, bypassing the planner. Usable
    /// only while the executor is idle (feed-hold exit, stopped states).
    pub fn st_prep_out_of_band_dwell(&mut self, seconds: f64) {
        if !self.st_runtime_isbusy() {
            self.st_prep_dwell(seconds * 1.0e6);
            self.st_request_load_move();
        }
    }

    /// Main-loop callback managing motor power down after inactivity.
    pub fn st_motor_power_callback(&mut self) {
        if !self.planner().is_phat_city_time() {
            return; // stay out of the way when the planner is pressed
        }
        if !self.motors_energized {
            return;
        }
        let stopped = !self.st_runtime_isbusy()
            && self.st_pre.owner.get() != PrepOwner::Loader
            && self.cm.machine_state != crate::canon::MachineState::Cycle;
        if stopped {
            let timeout_ms = (self.cfg.motor_power_timeout * 1000.0) as u64;
            if self.tb.systick_ms.saturating_sub(self.last_motion_ms) >= timeout_ms {
                debug!("motor idle timeout; de-energizing");
                for m in 0..MOTORS {
                    self.hw.motor_disable(m);
                }
                self.motors_energized = false;
            }
        } else {
            self.last_motion_ms = self.tb.systick_ms;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::Machine;

    #[test]
    fn prep_owner_cell_round_trips() {
        let cell = PrepOwnerCell::default();
        assert_eq!(cell.get(), PrepOwner::Exec);
        cell.set(PrepOwner::Loader);
        assert_eq!(cell.get(), PrepOwner::Loader);
        cell.set(PrepOwner::Exec);
        assert_eq!(cell.get(), PrepOwner::Exec);
    }

    #[test]
    fn prep_line_converts_time_and_steps() {
        let mut machine = Machine::sim();
        let mut travel = [0.0; MOTORS];
        travel[0] = 10.0;
        travel[1] = -2.5;
        let ferr = [0.0; MOTORS];
        let seg_time = 2.5e-5; // minutes
        machine.st_prep_line(&mut travel, &ferr, seg_time).unwrap();

        // 2.5e-5 min * 60 * 200kHz = 300 ticks
        assert_eq!(machine.st_pre.dda_ticks, 300);
        assert_eq!(machine.st_pre.dda_ticks_x_substeps, 300 * DDA_SUBSTEPS);
        assert_eq!(machine.st_pre.motors[0].substep_increment, 10 * DDA_SUBSTEPS);
        assert_eq!(machine.st_pre.motors[0].step_sign, 1);
        assert_eq!(machine.st_pre.motors[1].substep_increment, 80);
        assert_eq!(machine.st_pre.motors[1].step_sign, -1);
        assert_eq!(machine.st_pre.motors[2].substep_increment, 0);
        assert_eq!(machine.st_pre.owner.get(), PrepOwner::Loader);
    }

    #[test]
    fn prep_line_rejects_bad_segment_times() {
        let mut machine = Machine::sim();
        let mut travel = [1.0; MOTORS];
        let ferr = [0.0; MOTORS];
        assert!(machine
            .st_prep_line(&mut travel, &ferr, f64::INFINITY)
            .is_err());
        let mut machine = Machine::sim();
        let mut travel = [1.0; MOTORS];
        assert!(machine.st_prep_line(&mut travel, &ferr, f64::NAN).is_err());
    }

    #[test]
    fn prep_line_requires_exec_ownership() {
        let mut machine = Machine::sim();
        machine.st_pre.owner.set(PrepOwner::Loader);
        let mut travel = [1.0; MOTORS];
        let ferr = [0.0; MOTORS];
        let err = machine
            .st_prep_line(&mut travel, &ferr, 2.5e-5)
            .unwrap_err();
        assert_eq!(err, Status::PrepSyncErrorPanic);
    }

    #[test]
    fn nudge_correction_is_bounded_and_held_off() {
        let mut machine = Machine::sim();
        let mut travel = [0.0; MOTORS];
        travel[0] = 10.0;
        let mut ferr = [0.0; MOTORS];
        ferr[0] = 4.0; // above threshold
        machine.st_prep_line(&mut travel, &ferr, 2.5e-5).unwrap();
        // correction = min(4.0 * 0.25, 0.6) = 0.6, subtracted from travel
        assert!((machine.st_pre.motors[0].corrected_steps - 0.6).abs() < 1e-9);
        assert_eq!(
            machine.st_pre.motors[0].correction_holdoff,
            STEP_CORRECTION_HOLDOFF
        );

        // next segment within holdoff: no further correction
        machine.st_pre.owner.set(PrepOwner::Exec);
        let mut travel2 = [0.0; MOTORS];
        travel2[0] = 10.0;
        machine.st_prep_line(&mut travel2, &ferr, 2.5e-5).unwrap();
        assert!((machine.st_pre.motors[0].corrected_steps - 0.6).abs() < 1e-9);
    }

    #[test]
    fn dda_emits_expected_step_count() {
        let mut machine = Machine::sim();
        let mut travel = [0.0; MOTORS];
        travel[0] = 10.0;
        let ferr = [0.0; MOTORS];
        machine.st_prep_line(&mut travel, &ferr, 2.5e-5).unwrap();
        machine.st_load_move();
        assert!(machine.tb.dda_timer_running);

        for _ in 0..300 {
            machine.st_dda_tick();
        }
        assert_eq!(machine.st_run.dda_ticks_downcount, 0);
        assert_eq!(machine.sim_hw().raw_pulses[0], 10);
    }

    #[test]
    fn direction_flip_reflects_accumulator() {
        let mut machine = Machine::sim();
        let ferr = [0.0; MOTORS];

        // forward fractional-step segment
        let mut travel = [0.0; MOTORS];
        travel[0] = 3.5;
        machine.st_prep_line(&mut travel, &ferr, 2.5e-5).unwrap();
        machine.st_load_move();
        for _ in 0..300 {
            machine.st_dda_tick();
        }
        let forward = machine.sim_hw().raw_pulses[0] as i64;

        // reverse over the same distance; net target delta is zero
        let mut travel = [0.0; MOTORS];
        travel[0] = -3.5;
        machine.st_prep_line(&mut travel, &ferr, 2.5e-5).unwrap();
        machine.st_load_move();
        for _ in 0..300 {
            machine.st_dda_tick();
        }
        let total = machine.sim_hw().raw_pulses[0] as i64;
        let reverse = total - forward;
        // 3.5 out plus 3.5 back crosses the accumulator 7 times in total
        assert_eq!(forward + reverse, 7);
        // the net position error stays within one step of quantization
        assert!(machine.sim_hw().step_counts[0].abs() <= 1);
    }

    #[test]
    fn dwell_prep_has_minimum_one_tick() {
        let mut machine = Machine::sim();
        machine.st_prep_dwell(1.0); // one microsecond
        assert_eq!(machine.st_pre.dwell_ticks, 1);
        machine.st_prep_dwell(0.5e6);
        assert_eq!(machine.st_pre.dwell_ticks, 500);
    }
}
