//! Canonical machine: G-code level machine state (modes, offsets, coordinate
//! systems) and the command set the parser dispatches into. Motion commands
//! compute machine-coordinate targets and hand fully-parameterized moves to
//! the planner; peripheral commands queue typed callbacks that fire in
//! sequence with motion.

use std::sync::atomic::{AtomicU8, Ordering};

use log::{info, warn};

use crate::machine::Machine;
use crate::math::{self, AxisVec};
use crate::planner::{BlockType, CommandPayload, MoveProfile};
use crate::settings::{NVM_COORD_BASE, NVM_G28_POSITION, NVM_G30_POSITION, NVM_G92_OFFSET};
use crate::status::Status;
use crate::AXES;

pub const COORDS: usize = 6; // G54..G59
pub const TOOLS: usize = 16;
pub const MM_PER_INCH: f64 = 25.4;
/// XYZ are length axes; ABC are rotary and never unit-converted.
pub const LINEAR_AXES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Units {
    Inches,
    #[default]
    Millimeters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Plane {
    #[default]
    Xy,
    Xz,
    Yz,
}

impl Plane {
    /// (first, second, normal) axis indices of the active plane.
    pub fn axes(self) -> (usize, usize, usize) {
        match self {
            Plane::Xy => (0, 1, 2),
            Plane::Xz => (2, 0, 1),
            Plane::Yz => (1, 2, 0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistanceMode {
    #[default]
    Absolute,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedRateMode {
    #[default]
    UnitsPerMinute,
    InverseTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoordSystem {
    #[default]
    G54,
    G55,
    G56,
    G57,
    G58,
    G59,
}

impl CoordSystem {
    pub fn index(self) -> usize {
        match self {
            CoordSystem::G54 => 0,
            CoordSystem::G55 => 1,
            CoordSystem::G56 => 2,
            CoordSystem::G57 => 3,
            CoordSystem::G58 => 4,
            CoordSystem::G59 => 5,
        }
    }

    pub fn from_index(i: usize) -> Option<Self> {
        match i {
            0 => Some(CoordSystem::G54),
            1 => Some(CoordSystem::G55),
            2 => Some(CoordSystem::G56),
            3 => Some(CoordSystem::G57),
            4 => Some(CoordSystem::G58),
            5 => Some(CoordSystem::G59),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PathControl {
    ExactPath,
    ExactStop,
    #[default]
    Continuous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MotionMode {
    StraightTraverse,
    StraightFeed,
    CwArc,
    CcwArc,
    #[default]
    CancelMotionMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpindleControl {
    Off,
    Cw,
    Ccw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoolantSelect {
    Mist,
    Flood,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramFlow {
    Stop,
    End,
}

/// G-code model state. A snapshot rides in every planner block so the
/// runtime always sees the modal state the block was parsed under.
#[derive(Debug, Clone)]
pub struct GcodeState {
    pub linenum: u32,
    pub motion_mode: MotionMode,
    /// mm/min, or 1/min in inverse-time mode.
    pub feed_rate: f64,
    pub feed_rate_mode: FeedRateMode,
    pub spindle_speed: f64,
    pub select_plane: Plane,
    pub units_mode: Units,
    pub coord_system: CoordSystem,
    pub path_control: PathControl,
    pub distance_mode: DistanceMode,
    pub arc_distance_mode: DistanceMode,
    pub absolute_override: bool,
    pub tool: u8,
    pub tool_select: u8,
    /// Move target in machine coordinates.
    pub target: AxisVec,
    /// Offset snapshot for work-position reporting.
    pub work_offset: AxisVec,
}

impl Default for GcodeState {
    fn default() -> Self {
        GcodeState {
            linenum: 0,
            motion_mode: MotionMode::CancelMotionMode,
            feed_rate: 0.0,
            feed_rate_mode: FeedRateMode::UnitsPerMinute,
            spindle_speed: 0.0,
            select_plane: Plane::Xy,
            units_mode: Units::Millimeters,
            coord_system: CoordSystem::G54,
            path_control: PathControl::Continuous,
            distance_mode: DistanceMode::Absolute,
            arc_distance_mode: DistanceMode::Incremental,
            absolute_override: false,
            tool: 0,
            tool_select: 0,
            target: [0.0; AXES],
            work_offset: [0.0; AXES],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Initializing,
    Ready,
    Alarm,
    ProgramStop,
    ProgramEnd,
    Cycle,
    Shutdown,
    Panic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionState {
    Stop,
    Run,
    Hold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CycleType {
    #[default]
    None,
    Machining,
    Homing,
    Probe,
}

/// Feed-hold state machine. Observed from the exec interrupt context, so it
/// lives in an atomic cell; transitions happen only at quiescence points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HoldState {
    Off = 0,
    Sync,
    DecelContinue,
    DecelToZero,
    DecelComplete,
    MotionStopping,
    MotionStopped,
}

#[derive(Debug)]
pub struct HoldStateCell(AtomicU8);

impl Default for HoldStateCell {
    fn default() -> Self {
        HoldStateCell(AtomicU8::new(HoldState::Off as u8))
    }
}

impl HoldStateCell {
    pub fn get(&self) -> HoldState {
        match self.0.load(Ordering::Acquire) {
            0 => HoldState::Off,
            1 => HoldState::Sync,
            2 => HoldState::DecelContinue,
            3 => HoldState::DecelToZero,
            4 => HoldState::DecelComplete,
            5 => HoldState::MotionStopping,
            _ => HoldState::MotionStopped,
        }
    }

    pub fn set(&self, state: HoldState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProbePending {
    pub toward: bool,
    pub alarm_on_fail: bool,
    pub triggered: bool,
    /// Set when the probe machinery is driving a homing search.
    pub homing_axis: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
pub struct ProbeResult {
    pub triggered: bool,
    /// Contact position in machine coordinates.
    pub position: AxisVec,
}

#[derive(Debug, Default)]
pub struct HomingState {
    /// Axes still to home, in execution order.
    pub axes: Vec<usize>,
    pub set_coordinates: bool,
    pub active: bool,
}

#[derive(Debug)]
pub struct CanonicalMachine {
    pub machine_state: MachineState,
    pub motion_state: MotionState,
    pub cycle_type: CycleType,

    pub gm: GcodeState,
    /// Model position in machine coordinates: where the last queued move
    /// ends, not where the steppers currently are.
    pub position: AxisVec,

    pub coord_offsets: [[f64; AXES]; COORDS],
    pub g92_offset: AxisVec,
    pub g92_active: bool,
    pub tl_offset: AxisVec,
    pub tool_table: [[f64; AXES]; TOOLS],
    pub g28_position: AxisVec,
    pub g30_position: AxisVec,

    pub probe_pending: Option<ProbePending>,
    pub probe_result: Option<ProbeResult>,
    pub homing: HomingState,
    pub arc: Option<crate::arc::ArcState>,

    pub m48_enabled: bool,
    pub alarm_status: Option<Status>,

    // realtime requests from the control-character channel
    pub feedhold_requested: bool,
    pub cycle_start_requested: bool,
    pub queue_flush_requested: bool,
    pub reset_requested: bool,
}

impl CanonicalMachine {
    pub fn new() -> Self {
        CanonicalMachine {
            machine_state: MachineState::Initializing,
            motion_state: MotionState::Stop,
            cycle_type: CycleType::None,
            gm: GcodeState::default(),
            position: [0.0; AXES],
            coord_offsets: [[0.0; AXES]; COORDS],
            g92_offset: [0.0; AXES],
            g92_active: false,
            tl_offset: [0.0; AXES],
            tool_table: [[0.0; AXES]; TOOLS],
            g28_position: [0.0; AXES],
            g30_position: [0.0; AXES],
            probe_pending: None,
            probe_result: None,
            homing: HomingState::default(),
            arc: None,
            m48_enabled: false,
            alarm_status: None,
            feedhold_requested: false,
            cycle_start_requested: false,
            queue_flush_requested: false,
            reset_requested: false,
        }
    }

    /// Sum of offsets in effect for an axis.
    pub fn offset_total(&self, axis: usize) -> f64 {
        let mut total = self.coord_offsets[self.gm.coord_system.index()][axis] + self.tl_offset[axis];
        if self.g92_active {
            total += self.g92_offset[axis];
        }
        total
    }

    /// Position in the active work coordinate system.
    pub fn work_position(&self, axis: usize) -> f64 {
        self.position[axis] - self.offset_total(axis)
    }

    /// Convert an input value on an axis to internal mm.
    pub fn to_internal_units(&self, axis: usize, value: f64) -> f64 {
        if axis < LINEAR_AXES && self.gm.units_mode == Units::Inches {
            value * MM_PER_INCH
        } else {
            value
        }
    }

    fn offsets_snapshot(&self) -> AxisVec {
        let mut ofs = [0.0; AXES];
        for (a, o) in ofs.iter_mut().enumerate() {
            *o = self.offset_total(a);
        }
        ofs
    }

    /// Resolve axis words into a machine-coordinate target.
    pub fn compute_target(&self, words: &[Option<f64>; AXES]) -> AxisVec {
        let mut target = self.position;
        for a in 0..AXES {
            let Some(raw) = words[a] else { continue };
            let v = self.to_internal_units(a, raw);
            target[a] = if self.gm.absolute_override {
                v
            } else if self.gm.distance_mode == DistanceMode::Absolute {
                v + self.offset_total(a)
            } else {
                self.position[a] + v
            };
        }
        target
    }
}

impl Default for CanonicalMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine {
    /// Any G/M word starts a cycle if one is not already running.
    pub fn cm_cycle_start(&mut self) {
        match self.cm.machine_state {
            MachineState::Ready | MachineState::ProgramStop | MachineState::ProgramEnd => {
                self.cm.machine_state = MachineState::Cycle;
                if self.cm.cycle_type == CycleType::None {
                    self.cm.cycle_type = CycleType::Machining;
                }
            }
            _ => {}
        }
    }

    /// Called when the planner drains and the runtime goes idle.
    pub fn cm_cycle_end(&mut self) {
        if self.cm.machine_state == MachineState::Cycle {
            self.cm.machine_state = MachineState::Ready;
        }
        self.cm.motion_state = MotionState::Stop;
        self.cm.cycle_type = CycleType::None;
    }

    pub fn cm_check_alarmed(&self) -> Result<(), Status> {
        match self.cm.machine_state {
            MachineState::Alarm => Err(Status::CommandRejectedByAlarm),
            MachineState::Shutdown | MachineState::Panic => {
                Err(Status::CommandRejectedByShutdown)
            }
            _ => Ok(()),
        }
    }

    /// M2/M30 on an alarmed (but not shut down) machine clears the alarm
    /// before the alarm gate would reject the block.
    pub fn cm_parse_clear(&mut self, commands: &str) {
        if self.cm.machine_state != MachineState::Alarm {
            return;
        }
        if find_word(commands, "M30") || find_word(commands, "M2") {
            info!("alarm cleared by program end");
            self.cm.machine_state = MachineState::Ready;
            self.cm.alarm_status = None;
        }
    }

    /// Latch a soft alarm. New motion is rejected until cleared.
    pub fn cm_alarm(&mut self, status: Status, context: &str) {
        if matches!(
            self.cm.machine_state,
            MachineState::Shutdown | MachineState::Panic
        ) {
            return;
        }
        warn!("ALARM {}: {}", status, context);
        self.cm.machine_state = MachineState::Alarm;
        self.cm.alarm_status = Some(status);
        self.report_exception(status, context);
    }

    /// Hard fault: latch panic and halt the step generator.
    pub fn cm_panic(&mut self, status: Status, context: &str) -> Status {
        log::error!("PANIC {}: {}", status, context);
        self.cm.machine_state = MachineState::Panic;
        self.cm.alarm_status = Some(status);
        self.tb.dda_timer_running = false;
        self.report_exception(status, context);
        status
    }

    pub fn cm_set_model_linenum(&mut self, n: u32) {
        self.cm.gm.linenum = n;
    }

    pub fn cm_m48_enable(&mut self, enable: bool) {
        self.cm.m48_enabled = enable;
        let mp = self.planner_mut();
        mp.overrides_enabled = enable;
    }

    pub fn cm_fro_control(&mut self, p: Option<f64>) -> Result<(), Status> {
        let Some(p) = p else {
            return Err(Status::InvalidOrMalformedCommand);
        };
        let enabled = self.cm.m48_enabled;
        let mp = self.planner_mut();
        if p == 0.0 {
            mp.overrides_enabled = false;
            return Ok(());
        }
        if p < crate::config::FEED_OVERRIDE_MIN {
            return Err(Status::InputLessThanMinValue);
        }
        if p > crate::config::FEED_OVERRIDE_MAX {
            return Err(Status::InputExceedsMaxValue);
        }
        mp.mfo_factor = p;
        mp.overrides_enabled = enabled;
        Ok(())
    }

    pub fn cm_tro_control(&mut self, p: Option<f64>) -> Result<(), Status> {
        let Some(p) = p else {
            return Err(Status::InvalidOrMalformedCommand);
        };
        if p < crate::config::TRAVERSE_OVERRIDE_MIN {
            return Err(Status::InputLessThanMinValue);
        }
        if p > crate::config::TRAVERSE_OVERRIDE_MAX {
            return Err(Status::InputExceedsMaxValue);
        }
        let mp = self.planner_mut();
        mp.traverse_factor = p;
        Ok(())
    }

    pub fn cm_spo_control(&mut self, p: Option<f64>) -> Result<(), Status> {
        let Some(p) = p else {
            return Err(Status::InvalidOrMalformedCommand);
        };
        if !(0.05..=2.0).contains(&p) {
            return Err(Status::InputValueRangeError);
        }
        self.peripherals.spindle_override(p);
        Ok(())
    }

    pub fn cm_set_feed_rate_mode(&mut self, mode: FeedRateMode) {
        self.cm.gm.feed_rate_mode = mode;
    }

    pub fn cm_set_feed_rate(&mut self, f: f64) -> Result<(), Status> {
        if f < 0.0 {
            return Err(Status::InputLessThanMinValue);
        }
        self.cm.gm.feed_rate = match self.cm.gm.feed_rate_mode {
            FeedRateMode::InverseTime => f, // 1/min, unit conversion n/a
            FeedRateMode::UnitsPerMinute => {
                if self.cm.gm.units_mode == Units::Inches {
                    f * MM_PER_INCH
                } else {
                    f
                }
            }
        };
        Ok(())
    }

    pub fn cm_spindle_speed_sync(&mut self, s: f64) -> Result<(), Status> {
        if s < 0.0 {
            return Err(Status::InputLessThanMinValue);
        }
        self.cm.gm.spindle_speed = s;
        let gm = self.cm.gm.clone();
        self.mp_queue_command(BlockType::SpindleSpeed, CommandPayload::SpindleSpeed(s), &gm)
    }

    pub fn cm_select_tool(&mut self, t: u8) -> Result<(), Status> {
        if t as usize >= TOOLS {
            return Err(Status::InputExceedsMaxValue);
        }
        self.cm.gm.tool_select = t;
        let gm = self.cm.gm.clone();
        self.mp_queue_command(BlockType::Tool, CommandPayload::ToolSelect(t), &gm)
    }

    pub fn cm_change_tool(&mut self) -> Result<(), Status> {
        let gm = self.cm.gm.clone();
        self.mp_queue_command(BlockType::Command, CommandPayload::ToolChange, &gm)
    }

    pub fn cm_spindle_control_sync(&mut self, control: SpindleControl) -> Result<(), Status> {
        let gm = self.cm.gm.clone();
        self.mp_queue_command(BlockType::Command, CommandPayload::Spindle(control), &gm)
    }

    pub fn cm_coolant_control_sync(
        &mut self,
        select: CoolantSelect,
        on: bool,
    ) -> Result<(), Status> {
        let gm = self.cm.gm.clone();
        self.mp_queue_command(
            BlockType::Command,
            CommandPayload::Coolant { select, on },
            &gm,
        )
    }

    pub fn cm_dwell(&mut self, seconds: f64) -> Result<(), Status> {
        if seconds < 0.0 {
            return Err(Status::InputLessThanMinValue);
        }
        let gm = self.cm.gm.clone();
        self.mp_dwell(seconds, &gm)
    }

    pub fn cm_select_plane(&mut self, plane: Plane) {
        self.cm.gm.select_plane = plane;
    }

    pub fn cm_set_units_mode(&mut self, units: Units) {
        self.cm.gm.units_mode = units;
    }

    pub fn cm_set_coord_system(&mut self, cs: CoordSystem) {
        self.cm.gm.coord_system = cs;
    }

    pub fn cm_set_path_control(&mut self, pc: PathControl) {
        self.cm.gm.path_control = pc;
    }

    pub fn cm_set_distance_mode(&mut self, dm: DistanceMode) {
        self.cm.gm.distance_mode = dm;
    }

    pub fn cm_set_arc_distance_mode(&mut self, dm: DistanceMode) {
        self.cm.gm.arc_distance_mode = dm;
    }

    pub fn cm_set_absolute_override(&mut self, on: bool) {
        self.cm.gm.absolute_override = on;
    }

    pub fn cm_set_tl_offset(&mut self, h: Option<u8>, additive: bool) -> Result<(), Status> {
        let tool = h.unwrap_or(self.cm.gm.tool) as usize;
        if tool >= TOOLS {
            return Err(Status::InputExceedsMaxValue);
        }
        let entry = self.cm.tool_table[tool];
        for a in 0..AXES {
            if additive {
                self.cm.tl_offset[a] += entry[a];
            } else {
                self.cm.tl_offset[a] = entry[a];
            }
        }
        Ok(())
    }

    pub fn cm_cancel_tl_offset(&mut self) {
        self.cm.tl_offset = [0.0; AXES];
    }

    pub(crate) fn motion_gm(&mut self, target: AxisVec, mode: MotionMode) -> GcodeState {
        self.cm.gm.motion_mode = mode;
        let mut gm = self.cm.gm.clone();
        gm.target = target;
        gm.work_offset = self.cm.offsets_snapshot();
        gm
    }

    pub fn cm_straight_traverse(&mut self, words: &[Option<f64>; AXES]) -> Result<(), Status> {
        let target = self.cm.compute_target(words);
        let gm = self.motion_gm(target, MotionMode::StraightTraverse);
        self.mp_aline(&gm, MoveProfile::Traverse)?;
        self.cm.position = target;
        Ok(())
    }

    pub fn cm_straight_feed(&mut self, words: &[Option<f64>; AXES]) -> Result<(), Status> {
        let target = self.cm.compute_target(words);
        let gm = self.motion_gm(target, MotionMode::StraightFeed);
        self.mp_aline(&gm, MoveProfile::Feed)?;
        self.cm.position = target;
        Ok(())
    }

    /// Queue a traverse to a machine-coordinate point, offsets ignored.
    fn traverse_to_machine_point(&mut self, point: AxisVec) -> Result<(), Status> {
        let gm = self.motion_gm(point, MotionMode::StraightTraverse);
        self.mp_aline(&gm, MoveProfile::Traverse)?;
        self.cm.position = point;
        Ok(())
    }

    /// Queue a feed to a machine-coordinate point at an explicit rate,
    /// offsets and modal feed state untouched. Used by homing searches.
    pub(crate) fn cm_feed_to_machine_point(
        &mut self,
        point: AxisVec,
        feed_rate: f64,
    ) -> Result<(), Status> {
        let saved_rate = self.cm.gm.feed_rate;
        let saved_mode = self.cm.gm.feed_rate_mode;
        self.cm.gm.feed_rate = feed_rate;
        self.cm.gm.feed_rate_mode = FeedRateMode::UnitsPerMinute;
        let gm = self.motion_gm(point, MotionMode::StraightFeed);
        let result = self.mp_aline(&gm, MoveProfile::Feed);
        self.cm.gm.feed_rate = saved_rate;
        self.cm.gm.feed_rate_mode = saved_mode;
        if result.is_ok() {
            self.cm.position = point;
        }
        result
    }

    pub fn cm_set_g28_position(&mut self) -> Result<(), Status> {
        self.cm.g28_position = self.cm.position;
        let pos = self.cm.g28_position;
        self.settings.save(NVM_G28_POSITION, &pos);
        Ok(())
    }

    pub fn cm_set_g30_position(&mut self) -> Result<(), Status> {
        self.cm.g30_position = self.cm.position;
        let pos = self.cm.g30_position;
        self.settings.save(NVM_G30_POSITION, &pos);
        Ok(())
    }

    /// G28/G30: optional intermediate point, then traverse to the stored
    /// machine position.
    pub fn cm_goto_stored_position(
        &mut self,
        words: &[Option<f64>; AXES],
        g28: bool,
    ) -> Result<(), Status> {
        if words.iter().any(|w| w.is_some()) {
            self.cm_straight_traverse(words)?;
        }
        let stored = if g28 {
            self.cm.g28_position
        } else {
            self.cm.g30_position
        };
        self.traverse_to_machine_point(stored)
    }

    /// G28.3: declare the current location of the given axes to be the given
    /// machine coordinates.
    pub fn cm_set_absolute_origin(&mut self, words: &[Option<f64>; AXES]) -> Result<(), Status> {
        for a in 0..AXES {
            if let Some(v) = words[a] {
                let v = self.cm.to_internal_units(a, v);
                self.set_absolute_position_axis(a, v);
            }
        }
        Ok(())
    }

    /// G28.2/G28.4: search-home the requested axes. The actual searching is
    /// sequenced by the controller loop using the probe machinery; Z homes
    /// first, then X, Y and the rotaries.
    pub fn cm_homing_cycle_start(
        &mut self,
        words: &[Option<f64>; AXES],
        set_coordinates: bool,
    ) -> Result<(), Status> {
        if !words.iter().any(|w| w.is_some()) {
            return Err(Status::GcodeAxisIsMissing);
        }
        let order = [2usize, 0, 1, 3, 4, 5];
        let axes: Vec<usize> = order
            .iter()
            .copied()
            .filter(|&a| words[a].is_some())
            .collect();
        self.cm.homing = HomingState {
            axes,
            set_coordinates,
            active: true,
        };
        self.cm.cycle_type = CycleType::Homing;
        self.cm.machine_state = MachineState::Cycle;
        Ok(())
    }

    /// G38.2/.3/.4/.5 straight probe. Runs the move through the normal
    /// pipeline; the executor watches the probe input and brakes on the
    /// contact edge.
    pub fn cm_straight_probe(
        &mut self,
        words: &[Option<f64>; AXES],
        toward: bool,
        alarm_on_fail: bool,
    ) -> Result<(), Status> {
        if !words.iter().any(|w| w.is_some()) {
            return Err(Status::GcodeAxisIsMissing);
        }
        if self.cm.gm.feed_rate < math::EPSILON {
            return Err(Status::FeedRateNotSpecified);
        }
        self.cm.probe_pending = Some(ProbePending {
            toward,
            alarm_on_fail,
            triggered: false,
            homing_axis: None,
        });
        self.cm.probe_result = None;
        self.cm.cycle_type = CycleType::Probe;
        self.cm.machine_state = MachineState::Cycle;
        self.cm_straight_feed(words)
    }

    /// G10: set coordinate data. L2 sets offsets directly; L20 sets them so
    /// the current position reads as the given value; L1 edits the tool
    /// table.
    pub fn cm_set_g10_data(
        &mut self,
        p: Option<f64>,
        l: Option<u8>,
        words: &[Option<f64>; AXES],
    ) -> Result<(), Status> {
        let p = p.ok_or(Status::InvalidOrMalformedCommand)? as usize;
        match l.ok_or(Status::InvalidOrMalformedCommand)? {
            1 => {
                if p >= TOOLS {
                    return Err(Status::InputExceedsMaxValue);
                }
                for a in 0..AXES {
                    if let Some(v) = words[a] {
                        self.cm.tool_table[p][a] = self.cm.to_internal_units(a, v);
                    }
                }
            }
            2 | 20 => {
                if !(1..=COORDS).contains(&p) {
                    return Err(Status::InputValueRangeError);
                }
                let cs = p - 1;
                let l20 = l == Some(20);
                for a in 0..AXES {
                    if let Some(v) = words[a] {
                        let v = self.cm.to_internal_units(a, v);
                        self.cm.coord_offsets[cs][a] = if l20 {
                            let mut base = self.cm.position[a] - self.cm.tl_offset[a] - v;
                            if self.cm.g92_active {
                                base -= self.cm.g92_offset[a];
                            }
                            base
                        } else {
                            v
                        };
                    }
                }
                let row = self.cm.coord_offsets[cs];
                self.settings.save(NVM_COORD_BASE + cs as u32, &row);
            }
            _ => return Err(Status::InputValueRangeError),
        }
        Ok(())
    }

    pub fn cm_set_g92_offsets(&mut self, words: &[Option<f64>; AXES]) -> Result<(), Status> {
        for a in 0..AXES {
            if let Some(v) = words[a] {
                let v = self.cm.to_internal_units(a, v);
                let coord = self.cm.coord_offsets[self.cm.gm.coord_system.index()][a];
                self.cm.g92_offset[a] = self.cm.position[a] - coord - self.cm.tl_offset[a] - v;
            }
        }
        self.cm.g92_active = true;
        let ofs = self.cm.g92_offset;
        self.settings.save(NVM_G92_OFFSET, &ofs);
        Ok(())
    }

    pub fn cm_reset_g92_offsets(&mut self) {
        self.cm.g92_offset = [0.0; AXES];
        self.cm.g92_active = false;
        let ofs = self.cm.g92_offset;
        self.settings.save(NVM_G92_OFFSET, &ofs);
    }

    pub fn cm_suspend_g92_offsets(&mut self) {
        self.cm.g92_active = false;
    }

    pub fn cm_resume_g92_offsets(&mut self) {
        self.cm.g92_active = true;
    }

    pub fn cm_json_command(&mut self, text: &str) -> Result<(), Status> {
        let gm = self.cm.gm.clone();
        self.mp_queue_command(
            BlockType::Command,
            CommandPayload::Json(text.to_string()),
            &gm,
        )
    }

    pub fn cm_json_command_immediate(&mut self, text: &str) -> Result<(), Status> {
        self.run_json(text)
    }

    pub fn cm_json_wait(&mut self, text: &str) -> Result<(), Status> {
        let gm = self.cm.gm.clone();
        self.mp_queue_command(
            BlockType::JsonWait,
            CommandPayload::JsonWait(text.to_string()),
            &gm,
        )
    }

    pub fn cm_program_stop(&mut self) -> Result<(), Status> {
        let gm = self.cm.gm.clone();
        self.mp_queue_command(BlockType::Stop, CommandPayload::Stop, &gm)
    }

    pub fn cm_program_end(&mut self) -> Result<(), Status> {
        let gm = self.cm.gm.clone();
        self.mp_queue_command(BlockType::End, CommandPayload::End, &gm)
    }

    /// Feed hold request (`!`). Purely cooperative: the executor engages the
    /// state machine at the next segment boundary.
    pub fn cm_request_feedhold(&mut self) {
        if self.cm.machine_state == MachineState::Cycle
            && self.cm.motion_state == MotionState::Run
            && self.hold.get() == HoldState::Off
        {
            self.hold.set(HoldState::Sync);
            self.cm.motion_state = MotionState::Hold;
        }
    }

    /// Cycle start / resume request (`~`).
    pub fn cm_request_cycle_start(&mut self) {
        self.cm.cycle_start_requested = true;
    }

    /// Queue flush request (`%`). Honored only while holding.
    pub fn cm_request_queue_flush(&mut self) {
        self.cm.queue_flush_requested = true;
    }

    /// Execute the body of a command block when the loader reaches it.
    pub fn run_command(&mut self, payload: CommandPayload) {
        match payload {
            CommandPayload::Spindle(control) => self.peripherals.spindle(control),
            CommandPayload::SpindleSpeed(s) => self.peripherals.spindle_speed(s),
            CommandPayload::Coolant { select, on } => self.peripherals.coolant(select, on),
            CommandPayload::ToolSelect(t) => {
                self.cm.gm.tool_select = t;
            }
            CommandPayload::ToolChange => {
                self.cm.gm.tool = self.cm.gm.tool_select;
                let tool = self.cm.gm.tool;
                self.peripherals.tool_change(tool);
            }
            CommandPayload::Json(text) => {
                if let Err(status) = self.run_json(&text) {
                    self.report_exception(status, "json command");
                }
            }
            CommandPayload::JsonWait(text) => {
                // wait conditions evaluate once at execution time
                if let Err(status) = self.run_json(&text) {
                    self.report_exception(status, "json wait");
                }
            }
            CommandPayload::Stop => {
                self.cm.machine_state = MachineState::ProgramStop;
                self.cm.motion_state = MotionState::Stop;
            }
            CommandPayload::End => {
                self.cm_program_end_exec();
            }
        }
    }

    /// M2/M30 semantics: reset modal defaults, end the cycle.
    fn cm_program_end_exec(&mut self) {
        self.cm.machine_state = MachineState::ProgramEnd;
        self.cm.motion_state = MotionState::Stop;
        self.cm.cycle_type = CycleType::None;
        let gm = &mut self.cm.gm;
        gm.motion_mode = MotionMode::CancelMotionMode;
        gm.coord_system = CoordSystem::G54;
        gm.select_plane = Plane::Xy;
        gm.distance_mode = DistanceMode::Absolute;
        gm.arc_distance_mode = DistanceMode::Incremental;
        gm.feed_rate_mode = FeedRateMode::UnitsPerMinute;
        gm.absolute_override = false;
        self.peripherals.spindle(SpindleControl::Off);
        self.peripherals.coolant(CoolantSelect::Both, false);
    }
}

/// True when the normalized command string contains the word `code` as a
/// complete M/G word (so "M2" does not match inside "M20").
fn find_word(commands: &str, code: &str) -> bool {
    let bytes = commands.as_bytes();
    let needle = code.as_bytes();
    let mut i = 0;
    while i + needle.len() <= bytes.len() {
        if &bytes[i..i + needle.len()] == needle {
            let end = i + needle.len();
            let boundary = end >= bytes.len() || !bytes[end].is_ascii_digit();
            if boundary {
                return true;
            }
        }
        i += 1;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_finder_respects_boundaries() {
        assert!(find_word("M2", "M2"));
        assert!(find_word("G1X5M30", "M30"));
        assert!(!find_word("M20", "M2"));
        assert!(!find_word("M200", "M30"));
    }

    #[test]
    fn offsets_compose() {
        let mut cm = CanonicalMachine::new();
        cm.coord_offsets[0][0] = 10.0;
        cm.g92_offset[0] = 2.0;
        cm.g92_active = true;
        cm.tl_offset[0] = 0.5;
        assert_eq!(cm.offset_total(0), 12.5);
        cm.g92_active = false;
        assert_eq!(cm.offset_total(0), 10.5);
    }

    #[test]
    fn compute_target_absolute_and_relative() {
        let mut cm = CanonicalMachine::new();
        cm.position[0] = 5.0;
        cm.coord_offsets[0][0] = 10.0;

        let mut words = [None; AXES];
        words[0] = Some(1.0);
        let t = cm.compute_target(&words);
        assert_eq!(t[0], 11.0); // offset applied in absolute mode

        cm.gm.distance_mode = DistanceMode::Incremental;
        let t = cm.compute_target(&words);
        assert_eq!(t[0], 6.0); // relative to current position

        cm.gm.distance_mode = DistanceMode::Absolute;
        cm.gm.absolute_override = true;
        let t = cm.compute_target(&words);
        assert_eq!(t[0], 1.0); // machine coordinates, no offsets
    }

    #[test]
    fn inch_mode_converts_linear_axes_only() {
        let mut cm = CanonicalMachine::new();
        cm.gm.units_mode = Units::Inches;
        assert_eq!(cm.to_internal_units(0, 1.0), 25.4);
        assert_eq!(cm.to_internal_units(3, 90.0), 90.0); // A axis in degrees
    }

    #[test]
    fn hold_cell_round_trips() {
        let cell = HoldStateCell::default();
        assert_eq!(cell.get(), HoldState::Off);
        cell.set(HoldState::DecelToZero);
        assert_eq!(cell.get(), HoldState::DecelToZero);
        cell.set(HoldState::MotionStopped);
        assert_eq!(cell.get(), HoldState::MotionStopped);
    }

    #[test]
    fn plane_axes() {
        assert_eq!(Plane::Xy.axes(), (0, 1, 2));
        assert_eq!(Plane::Xz.axes(), (2, 0, 1));
        assert_eq!(Plane::Yz.axes(), (1, 2, 0));
    }
}
