//! Machine configuration: per-axis kinematic limits, per-motor geometry, and
//! the global tuning parameters. Values are exposed through a keyed get/set
//! surface so the JSON channel can read and write them with range checking.
//!
//! Units: lengths in mm, velocities in mm/min, jerk in millions of mm/min^3.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::status::Status;
use crate::{AXES, MOTORS};

pub const JERK_MULTIPLIER: f64 = 1.0e6;

pub const JUNCTION_INTEGRATION_MIN: f64 = 0.05;
pub const JUNCTION_INTEGRATION_MAX: f64 = 5.00;

pub const FEED_OVERRIDE_MIN: f64 = 0.05;
pub const FEED_OVERRIDE_MAX: f64 = 2.00;
pub const TRAVERSE_OVERRIDE_MIN: f64 = 0.05;
pub const TRAVERSE_OVERRIDE_MAX: f64 = 1.00;

pub const MOTOR_TIMEOUT_SECONDS_MIN: f64 = 0.1;
pub const MOTOR_TIMEOUT_SECONDS_MAX: f64 = 4294967.0;

pub const AXIS_NAMES: [char; AXES] = ['X', 'Y', 'Z', 'A', 'B', 'C'];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AxisMode {
    Disabled,
    Standard,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AxisConfig {
    pub axis_mode: AxisMode,
    /// Rapid (G0) velocity ceiling, mm/min.
    pub velocity_max: f64,
    /// Feed (G1/G2/G3) velocity ceiling, mm/min.
    pub feedrate_max: f64,
    pub travel_min: f64,
    pub travel_max: f64,
    /// Jerk ceiling in millions of mm/min^3.
    pub jerk_max: f64,
    /// Jerk applied when braking into a feed hold; usually higher.
    pub jerk_high: f64,
    /// Homing search speed toward the switch, mm/min.
    pub search_velocity: f64,
}

impl AxisConfig {
    fn linear() -> Self {
        AxisConfig {
            axis_mode: AxisMode::Standard,
            velocity_max: 50_000.0,
            feedrate_max: 50_000.0,
            travel_min: 0.0,
            travel_max: 420.0,
            jerk_max: 5_000.0,
            jerk_high: 20_000.0,
            search_velocity: 3_000.0,
        }
    }

    fn rotary() -> Self {
        AxisConfig {
            axis_mode: AxisMode::Standard,
            velocity_max: 230_000.0,
            feedrate_max: 230_000.0,
            travel_min: -1.0,
            travel_max: -1.0, // -1 means infinite travel
            jerk_max: 5_000.0,
            jerk_high: 20_000.0,
            search_velocity: 10_000.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MotorPowerMode {
    Disabled,
    AlwaysOn,
    InCycle,
    WhenMoving,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MotorConfig {
    /// Axis this motor is slaved to.
    pub motor_map: usize,
    /// Degrees per whole step.
    pub step_angle: f64,
    /// Travel per motor revolution, mm (or degrees for rotary).
    pub travel_per_rev: f64,
    pub microsteps: u32,
    /// True reverses direction polarity.
    pub polarity: bool,
    pub power_mode: MotorPowerMode,
}

impl MotorConfig {
    pub fn steps_per_unit(&self) -> f64 {
        (360.0 * self.microsteps as f64) / (self.step_angle * self.travel_per_rev)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    pub axes: [AxisConfig; AXES],
    pub motors: [MotorConfig; MOTORS],
    /// Cornering aggressiveness; clamped to [0.05, 5.00].
    pub junction_integration_time: f64,
    /// Arc flattening tolerance, mm.
    pub chordal_tolerance: f64,
    /// Seconds of inactivity before motors are de-energized.
    pub motor_power_timeout: f64,
    /// Settle dwell on feed-hold resume (spindle spin-up), seconds.
    pub resume_dwell: f64,
    /// Minimum interval between timed status reports, ms.
    pub status_interval_ms: u64,
    pub feed_override_enable: bool,
    pub feed_override_factor: f64,
    pub traverse_override_enable: bool,
    pub traverse_override_factor: f64,
}

impl Default for MachineConfig {
    fn default() -> Self {
        let mut motors = [MotorConfig {
            motor_map: 0,
            step_angle: 1.8,
            travel_per_rev: 40.0,
            microsteps: 8,
            polarity: false,
            power_mode: MotorPowerMode::InCycle,
        }; MOTORS];
        for (i, m) in motors.iter_mut().enumerate() {
            m.motor_map = i;
        }
        // Z screws are usually finer pitch than the XY belts
        motors[2].travel_per_rev = 8.0;

        let mut axes = [AxisConfig::linear(); AXES];
        for axis in axes.iter_mut().skip(3) {
            *axis = AxisConfig::rotary();
        }

        MachineConfig {
            axes,
            motors,
            junction_integration_time: 0.75,
            chordal_tolerance: 0.01,
            motor_power_timeout: 2.0,
            resume_dwell: 0.0,
            status_interval_ms: 250,
            feed_override_enable: false,
            feed_override_factor: 1.0,
            traverse_override_enable: false,
            traverse_override_factor: 1.0,
        }
    }
}

fn axis_index(c: char) -> Option<usize> {
    AXIS_NAMES.iter().position(|&n| n == c.to_ascii_uppercase())
}

fn motor_index(c: char) -> Option<usize> {
    let n = c.to_digit(10)? as usize;
    if (1..=MOTORS).contains(&n) {
        Some(n - 1)
    } else {
        None
    }
}

fn check_range(v: f64, min: f64, max: f64) -> Result<f64, Status> {
    if v < min {
        Err(Status::InputLessThanMinValue)
    } else if v > max {
        Err(Status::InputExceedsMaxValue)
    } else {
        Ok(v)
    }
}

impl MachineConfig {
    /// Internal jerk value for an axis (mm/min^3).
    pub fn jerk(&self, axis: usize) -> f64 {
        self.axes[axis].jerk_max * JERK_MULTIPLIER
    }

    pub fn jerk_high(&self, axis: usize) -> f64 {
        self.axes[axis].jerk_high * JERK_MULTIPLIER
    }

    /// Read a configuration field by its mnemonic key, e.g. `xvm`, `2mi`, `jt`.
    pub fn get_value(&self, key: &str) -> Result<Value, Status> {
        let k = key.to_ascii_lowercase();
        match k.as_str() {
            "jt" => return Ok(self.junction_integration_time.into()),
            "ct" => return Ok(self.chordal_tolerance.into()),
            "mt" => return Ok(self.motor_power_timeout.into()),
            "rd" => return Ok(self.resume_dwell.into()),
            "si" => return Ok(self.status_interval_ms.into()),
            _ => {}
        }
        let mut chars = k.chars();
        let first = chars.next().ok_or(Status::UnrecognizedName)?;
        let field: String = chars.collect();
        if let Some(a) = axis_index(first) {
            let ax = &self.axes[a];
            return match field.as_str() {
                "vm" => Ok(ax.velocity_max.into()),
                "fr" => Ok(ax.feedrate_max.into()),
                "tn" => Ok(ax.travel_min.into()),
                "tm" => Ok(ax.travel_max.into()),
                "jm" => Ok(ax.jerk_max.into()),
                "jh" => Ok(ax.jerk_high.into()),
                "sv" => Ok(ax.search_velocity.into()),
                _ => Err(Status::UnrecognizedName),
            };
        }
        if let Some(m) = motor_index(first) {
            let mo = &self.motors[m];
            return match field.as_str() {
                "ma" => Ok(mo.motor_map.into()),
                "sa" => Ok(mo.step_angle.into()),
                "tr" => Ok(mo.travel_per_rev.into()),
                "mi" => Ok(mo.microsteps.into()),
                "po" => Ok((mo.polarity as u8).into()),
                "su" => Ok(mo.steps_per_unit().into()),
                _ => Err(Status::UnrecognizedName),
            };
        }
        Err(Status::UnrecognizedName)
    }

    /// Write a configuration field by key. Rejected values leave the prior
    /// value in place.
    pub fn set_value(&mut self, key: &str, value: &Value) -> Result<(), Status> {
        let v = value.as_f64().ok_or(Status::BadNumberFormat)?;
        let k = key.to_ascii_lowercase();
        match k.as_str() {
            "jt" => {
                self.junction_integration_time =
                    check_range(v, JUNCTION_INTEGRATION_MIN, JUNCTION_INTEGRATION_MAX)?;
                return Ok(());
            }
            "ct" => {
                self.chordal_tolerance = check_range(v, 0.001, 10.0)?;
                return Ok(());
            }
            "mt" => {
                self.motor_power_timeout =
                    check_range(v, MOTOR_TIMEOUT_SECONDS_MIN, MOTOR_TIMEOUT_SECONDS_MAX)?;
                return Ok(());
            }
            "rd" => {
                self.resume_dwell = check_range(v, 0.0, 60.0)?;
                return Ok(());
            }
            "si" => {
                self.status_interval_ms = check_range(v, 50.0, 60_000.0)? as u64;
                return Ok(());
            }
            _ => {}
        }
        let mut chars = k.chars();
        let first = chars.next().ok_or(Status::UnrecognizedName)?;
        let field: String = chars.collect();
        if let Some(a) = axis_index(first) {
            let ax = &mut self.axes[a];
            match field.as_str() {
                "vm" => ax.velocity_max = check_range(v, 0.0, 1.0e7)?,
                "fr" => ax.feedrate_max = check_range(v, 0.0, 1.0e7)?,
                "tn" => ax.travel_min = v,
                "tm" => ax.travel_max = v,
                "jm" => ax.jerk_max = check_range(v, 1.0, 1.0e6)?,
                "jh" => ax.jerk_high = check_range(v, 1.0, 1.0e6)?,
                "sv" => ax.search_velocity = check_range(v, 0.0, 1.0e7)?,
                _ => return Err(Status::UnrecognizedName),
            }
            return Ok(());
        }
        if let Some(m) = motor_index(first) {
            let mo = &mut self.motors[m];
            match field.as_str() {
                "ma" => mo.motor_map = check_range(v, 0.0, (AXES - 1) as f64)? as usize,
                "sa" => mo.step_angle = check_range(v, 0.001, 360.0)?,
                "tr" => mo.travel_per_rev = check_range(v, 0.0001, 1_000_000.0)?,
                "mi" => mo.microsteps = check_range(v, 1.0, 255.0)? as u32,
                "po" => mo.polarity = check_range(v, 0.0, 1.0)? != 0.0,
                _ => return Err(Status::UnrecognizedName),
            }
            return Ok(());
        }
        Err(Status::UnrecognizedName)
    }
}
