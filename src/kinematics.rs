//! Kinematics seam between axis space (mm) and motor space (steps). The
//! Cartesian implementation is a per-motor scale through the motor-to-axis
//! map; other geometries implement the same trait.

use crate::config::MachineConfig;
use crate::math::AxisVec;
use crate::MOTORS;

pub trait Kinematics: Send {
    /// Axis-space target to absolute motor steps.
    fn inverse(&self, target: &AxisVec, steps: &mut [f64; MOTORS]);
    /// Absolute motor steps back to axis space.
    fn forward(&self, steps: &[f64; MOTORS], position: &mut AxisVec);
}

#[derive(Debug, Clone)]
pub struct CartesianKinematics {
    pub steps_per_unit: [f64; MOTORS],
    pub motor_map: [usize; MOTORS],
}

impl CartesianKinematics {
    pub fn from_config(cfg: &MachineConfig) -> Self {
        let mut steps_per_unit = [0.0; MOTORS];
        let mut motor_map = [0; MOTORS];
        for m in 0..MOTORS {
            steps_per_unit[m] = cfg.motors[m].steps_per_unit();
            motor_map[m] = cfg.motors[m].motor_map;
        }
        CartesianKinematics {
            steps_per_unit,
            motor_map,
        }
    }
}

impl Kinematics for CartesianKinematics {
    fn inverse(&self, target: &AxisVec, steps: &mut [f64; MOTORS]) {
        for m in 0..MOTORS {
            steps[m] = target[self.motor_map[m]] * self.steps_per_unit[m];
        }
    }

    fn forward(&self, steps: &[f64; MOTORS], position: &mut AxisVec) {
        // first motor mapped to an axis wins; gantry followers just agree
        let mut seen = [false; crate::AXES];
        for m in 0..MOTORS {
            let axis = self.motor_map[m];
            if !seen[axis] && self.steps_per_unit[m] != 0.0 {
                position[axis] = steps[m] / self.steps_per_unit[m];
                seen[axis] = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AXES;
    use float_cmp::assert_approx_eq;

    #[test]
    fn cartesian_round_trip() {
        let cfg = MachineConfig::default();
        let kin = CartesianKinematics::from_config(&cfg);
        let mut target = [0.0; AXES];
        target[0] = 10.0;
        target[2] = -1.25;

        let mut steps = [0.0; MOTORS];
        kin.inverse(&target, &mut steps);
        // X: 40 steps/mm, Z: 200 steps/mm from the default geometry
        assert_approx_eq!(f64, steps[0], 400.0);
        assert_approx_eq!(f64, steps[2], -250.0);

        let mut back = [0.0; AXES];
        kin.forward(&steps, &mut back);
        assert_approx_eq!(f64, back[0], 10.0);
        assert_approx_eq!(f64, back[2], -1.25);
    }
}
