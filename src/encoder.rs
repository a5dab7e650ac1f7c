//! Step-count encoders. Each motor's encoder accumulates signed step pulses
//! from the DDA interrupt; the loader folds the running count into the
//! sampled position once per segment, which time-aligns readings with the
//! delayed commanded-step chain in the executor.

use crate::MOTORS;

#[derive(Debug, Default)]
pub struct Encoders {
    /// Pulses accumulated during the current segment, signed by direction.
    steps_run: [i32; MOTORS],
    /// Sampled position, in steps.
    position: [f64; MOTORS],
}

impl Encoders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called from the step interrupt on every emitted pulse.
    pub fn increment(&mut self, motor: usize, step_sign: i8) {
        self.steps_run[motor] += step_sign as i32;
    }

    /// Fold the segment's pulses into the position sample. Called by the
    /// loader at segment boundaries.
    pub fn accumulate(&mut self, motor: usize) {
        self.position[motor] += self.steps_run[motor] as f64;
        self.steps_run[motor] = 0;
    }

    pub fn read(&self, motor: usize) -> f64 {
        self.position[motor]
    }

    /// Force the encoders to agree with a known step position.
    pub fn set_positions(&mut self, steps: &[f64; MOTORS]) {
        self.position = *steps;
        self.steps_run = [0; MOTORS];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pulses_accumulate_with_sign() {
        let mut enc = Encoders::new();
        for _ in 0..5 {
            enc.increment(0, 1);
        }
        for _ in 0..2 {
            enc.increment(0, -1);
        }
        assert_eq!(enc.read(0), 0.0); // not sampled yet
        enc.accumulate(0);
        assert_eq!(enc.read(0), 3.0);
        enc.accumulate(0);
        assert_eq!(enc.read(0), 3.0); // idempotent with no new pulses
    }

    #[test]
    fn set_positions_clears_pending_pulses() {
        let mut enc = Encoders::new();
        enc.increment(1, 1);
        let mut steps = [0.0; MOTORS];
        steps[1] = 100.0;
        enc.set_positions(&steps);
        enc.accumulate(1);
        assert_eq!(enc.read(1), 100.0);
    }
}
