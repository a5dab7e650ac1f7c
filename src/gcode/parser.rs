//! RS-274/NGC block parser. Extracts (letter, value) words from a normalized
//! block, enforces modal-group rules, and dispatches to the canonical
//! machine in NIST execution order.

use log::debug;

use crate::canon::{
    CoolantSelect, CoordSystem, DistanceMode, FeedRateMode, MotionMode, Plane, ProgramFlow,
    SpindleControl, Units,
};
use crate::machine::Machine;
use crate::status::Status;
use crate::AXES;

/// Modal groups per NIST section 3.4. A block must not contain two G-words
/// from the same group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModalGroup {
    G0,  // {G10, G28, G30, G92} non-modal axis commands
    G1,  // {G0, G1, G2, G3, G80} motion
    G2,  // {G17, G18, G19} plane selection
    G3,  // {G90, G91} distance mode
    G5,  // {G93, G94} feed rate mode
    G6,  // {G20, G21} units
    G7,  // {G40, G41, G42} cutter radius compensation
    G8,  // {G43, G49} tool length offset
    G9,  // {G98, G99} canned cycle return mode
    G12, // {G54..G59} coordinate system selection
    G13, // {G61, G61.1, G64} path control mode
    M4,  // {M0, M1, M2, M30, M60} stopping
    M6,  // {M6} tool change
    M7,  // {M3, M4, M5} spindle turning
    M8,  // {M7, M8, M9} coolant
    M9,  // {M48, M49, M50, M50.1, M51} override switches
}

pub const MODAL_GROUP_COUNT: usize = 16;

impl ModalGroup {
    fn index(self) -> usize {
        match self {
            ModalGroup::G0 => 0,
            ModalGroup::G1 => 1,
            ModalGroup::G2 => 2,
            ModalGroup::G3 => 3,
            ModalGroup::G5 => 4,
            ModalGroup::G6 => 5,
            ModalGroup::G7 => 6,
            ModalGroup::G8 => 7,
            ModalGroup::G9 => 8,
            ModalGroup::G12 => 9,
            ModalGroup::G13 => 10,
            ModalGroup::M4 => 11,
            ModalGroup::M6 => 12,
            ModalGroup::M7 => 13,
            ModalGroup::M8 => 14,
            ModalGroup::M9 => 15,
        }
    }
}

/// Non-modal dispatch selector for the current block. Distinct from
/// [`MotionMode`]: the motion mode persists across blocks, the next action
/// does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NextAction {
    #[default]
    Default,
    Dwell,                // G4
    SetG10Data,           // G10
    GotoG28Position,      // G28
    SetG28Position,       // G28.1
    SearchHome,           // G28.2
    SetAbsoluteOrigin,    // G28.3
    HomingNoSet,          // G28.4
    GotoG30Position,      // G30
    SetG30Position,       // G30.1
    ProbeTowardAlarm,     // G38.2
    ProbeToward,          // G38.3
    ProbeAwayAlarm,       // G38.4
    ProbeAway,            // G38.5
    SetTlOffset,          // G43
    SetAdditionalTlOffset, // G43.2
    CancelTlOffset,       // G49
    SetG92Offsets,        // G92
    ResetG92Offsets,      // G92.1
    SuspendG92Offsets,    // G92.2
    ResumeG92Offsets,     // G92.3
    JsonCommandSync,      // M100
    JsonCommandImmediate, // M100.1
    JsonWait,             // M101
}

/// Everything one block can ask for. `Option` fields double as the
/// presence flags; `None` means the word was absent.
#[derive(Debug, Clone, Default)]
pub struct GcodeInput {
    pub next_action: NextAction,
    pub motion_mode: MotionMode,
    pub motion_mode_explicit: bool,
    pub program_flow: Option<ProgramFlow>,
    pub linenum: Option<u32>,

    pub target: [Option<f64>; AXES],
    pub arc_offset: [Option<f64>; 3],
    pub arc_radius: Option<f64>,

    pub f_word: Option<f64>,
    pub p_word: Option<f64>,
    pub s_word: Option<f64>,
    pub h_word: Option<u8>,
    pub l_word: Option<u8>,

    pub feed_rate_mode: Option<FeedRateMode>,
    pub select_plane: Option<Plane>,
    pub units_mode: Option<Units>,
    pub coord_system: Option<CoordSystem>,
    pub path_control: Option<crate::canon::PathControl>,
    pub distance_mode: Option<DistanceMode>,
    pub arc_distance_mode: Option<DistanceMode>,
    pub absolute_override: bool,

    pub tool_select: Option<u8>,
    pub tool_change: bool,
    pub coolant_mist: bool,
    pub coolant_flood: bool,
    pub coolant_off: bool,
    pub spindle_control: Option<SpindleControl>,

    pub m48_enable: Option<bool>,
    pub fro_control: bool,
    pub tro_control: bool,
    pub spo_control: bool,

    pub checksum_present: bool,
}

impl GcodeInput {
    pub fn has_axis_word(&self) -> bool {
        self.target.iter().any(|t| t.is_some())
    }

    fn has_arc_word(&self) -> bool {
        self.arc_offset.iter().any(|o| o.is_some()) || self.arc_radius.is_some()
    }
}

#[derive(Debug, Default)]
struct Modals {
    seen: [bool; MODAL_GROUP_COUNT],
}

impl Modals {
    fn set(&mut self, group: ModalGroup) -> Result<(), Status> {
        let idx = group.index();
        if self.seen[idx] {
            return Err(Status::ModalGroupViolation);
        }
        self.seen[idx] = true;
        Ok(())
    }

    fn has(&self, group: ModalGroup) -> bool {
        self.seen[group.index()]
    }
}

/// Isolate the first decimal digit of a dotted code (G38.2 -> 2).
fn point(value: f64) -> u8 {
    ((value * 10.0).round() - value.trunc() * 10.0) as u8
}

/// Pull the next `(letter, value)` word off the normalized block.
/// Returns `None` at end of input.
fn next_word(text: &str, pos: &mut usize) -> Result<Option<(char, f64, i64)>, Status> {
    let bytes = text.as_bytes();
    if *pos >= bytes.len() {
        return Ok(None);
    }
    let letter = bytes[*pos] as char;
    if !letter.is_ascii_uppercase() {
        return Err(Status::InvalidOrMalformedCommand);
    }
    *pos += 1;
    let start = *pos;
    while *pos < bytes.len() {
        let c = bytes[*pos] as char;
        if c.is_ascii_digit() || c == '.' || c == '-' {
            *pos += 1;
        } else {
            break;
        }
    }
    let num = &text[start..*pos];
    if num.is_empty() {
        return Err(Status::BadNumberFormat);
    }
    let value: f64 = num.parse().map_err(|_| Status::BadNumberFormat)?;
    // integer form retained so large line numbers survive intact
    let value_int: i64 = num.split('.').next().unwrap_or("0").parse().unwrap_or(0);
    Ok(Some((letter, value, value_int)))
}

/// The block parser. Holds no cross-block state beyond what the canonical
/// machine supplies (previous motion mode, feed rate mode).
#[derive(Debug, Default)]
pub struct GcodeParser;

impl GcodeParser {
    pub fn new() -> Self {
        GcodeParser
    }

    /// Parse a normalized block into a [`GcodeInput`].
    ///
    /// `model_motion_mode` seeds the motion mode from the previous block;
    /// `inverse_time_active` forces a fresh F word requirement as inverse
    /// time feeds do not persist.
    pub fn parse_block(
        &self,
        commands: &str,
        model_motion_mode: MotionMode,
        inverse_time_active: bool,
    ) -> Result<GcodeInput, Status> {
        let mut gv = GcodeInput {
            motion_mode: model_motion_mode,
            ..Default::default()
        };
        let mut modals = Modals::default();

        if inverse_time_active {
            gv.f_word = Some(0.0);
        }

        let mut pos = 0;
        while let Some((letter, value, value_int)) = next_word(commands, &mut pos)? {
            match letter {
                'G' => self.parse_g(&mut gv, &mut modals, value)?,
                'M' => self.parse_m(&mut gv, &mut modals, value)?,
                'T' => gv.tool_select = Some(value.trunc() as u8),
                'F' => gv.f_word = Some(value),
                'P' => gv.p_word = Some(value),
                'S' => gv.s_word = Some(value),
                'H' => gv.h_word = Some(value.trunc() as u8),
                'L' => gv.l_word = Some(value.trunc() as u8),
                'X' => gv.target[0] = Some(value),
                'Y' => gv.target[1] = Some(value),
                'Z' => gv.target[2] = Some(value),
                'A' => gv.target[3] = Some(value),
                'B' => gv.target[4] = Some(value),
                'C' => gv.target[5] = Some(value),
                'I' => gv.arc_offset[0] = Some(value),
                'J' => gv.arc_offset[1] = Some(value),
                'K' => gv.arc_offset[2] = Some(value),
                'R' => gv.arc_radius = Some(value),
                'N' => gv.linenum = Some(value_int.max(0) as u32),
                _ => return Err(Status::GcodeCommandUnsupported),
            }
        }

        self.validate(&gv, &modals)?;
        Ok(gv)
    }

    fn parse_g(&self, gv: &mut GcodeInput, modals: &mut Modals, value: f64) -> Result<(), Status> {
        match value.trunc() as u16 {
            0 => {
                modals.set(ModalGroup::G1)?;
                gv.motion_mode = MotionMode::StraightTraverse;
                gv.motion_mode_explicit = true;
            }
            1 => {
                modals.set(ModalGroup::G1)?;
                gv.motion_mode = MotionMode::StraightFeed;
                gv.motion_mode_explicit = true;
            }
            2 => {
                modals.set(ModalGroup::G1)?;
                gv.motion_mode = MotionMode::CwArc;
                gv.motion_mode_explicit = true;
            }
            3 => {
                modals.set(ModalGroup::G1)?;
                gv.motion_mode = MotionMode::CcwArc;
                gv.motion_mode_explicit = true;
            }
            4 => gv.next_action = NextAction::Dwell,
            10 => {
                modals.set(ModalGroup::G0)?;
                gv.next_action = NextAction::SetG10Data;
            }
            17 => {
                modals.set(ModalGroup::G2)?;
                gv.select_plane = Some(Plane::Xy);
            }
            18 => {
                modals.set(ModalGroup::G2)?;
                gv.select_plane = Some(Plane::Xz);
            }
            19 => {
                modals.set(ModalGroup::G2)?;
                gv.select_plane = Some(Plane::Yz);
            }
            20 => {
                modals.set(ModalGroup::G6)?;
                gv.units_mode = Some(Units::Inches);
            }
            21 => {
                modals.set(ModalGroup::G6)?;
                gv.units_mode = Some(Units::Millimeters);
            }
            28 => match point(value) {
                0 => {
                    modals.set(ModalGroup::G0)?;
                    gv.next_action = NextAction::GotoG28Position;
                }
                1 => {
                    modals.set(ModalGroup::G0)?;
                    gv.next_action = NextAction::SetG28Position;
                }
                2 => gv.next_action = NextAction::SearchHome,
                3 => gv.next_action = NextAction::SetAbsoluteOrigin,
                4 => gv.next_action = NextAction::HomingNoSet,
                _ => return Err(Status::GcodeCommandUnsupported),
            },
            30 => match point(value) {
                0 => {
                    modals.set(ModalGroup::G0)?;
                    gv.next_action = NextAction::GotoG30Position;
                }
                1 => {
                    modals.set(ModalGroup::G0)?;
                    gv.next_action = NextAction::SetG30Position;
                }
                _ => return Err(Status::GcodeCommandUnsupported),
            },
            38 => match point(value) {
                2 => gv.next_action = NextAction::ProbeTowardAlarm,
                3 => gv.next_action = NextAction::ProbeToward,
                4 => gv.next_action = NextAction::ProbeAwayAlarm,
                5 => gv.next_action = NextAction::ProbeAway,
                _ => return Err(Status::GcodeCommandUnsupported),
            },
            40 => {
                // cancel cutter radius compensation: accepted, nothing to do
                modals.set(ModalGroup::G7)?;
            }
            43 => match point(value) {
                0 => gv.next_action = NextAction::SetTlOffset,
                2 => gv.next_action = NextAction::SetAdditionalTlOffset,
                _ => return Err(Status::GcodeCommandUnsupported),
            },
            49 => gv.next_action = NextAction::CancelTlOffset,
            53 => gv.absolute_override = true,
            54 => {
                modals.set(ModalGroup::G12)?;
                gv.coord_system = Some(CoordSystem::G54);
            }
            55 => {
                modals.set(ModalGroup::G12)?;
                gv.coord_system = Some(CoordSystem::G55);
            }
            56 => {
                modals.set(ModalGroup::G12)?;
                gv.coord_system = Some(CoordSystem::G56);
            }
            57 => {
                modals.set(ModalGroup::G12)?;
                gv.coord_system = Some(CoordSystem::G57);
            }
            58 => {
                modals.set(ModalGroup::G12)?;
                gv.coord_system = Some(CoordSystem::G58);
            }
            59 => {
                modals.set(ModalGroup::G12)?;
                gv.coord_system = Some(CoordSystem::G59);
            }
            61 => match point(value) {
                0 => {
                    modals.set(ModalGroup::G13)?;
                    gv.path_control = Some(crate::canon::PathControl::ExactPath);
                }
                1 => {
                    modals.set(ModalGroup::G13)?;
                    gv.path_control = Some(crate::canon::PathControl::ExactStop);
                }
                _ => return Err(Status::GcodeCommandUnsupported),
            },
            64 => {
                modals.set(ModalGroup::G13)?;
                gv.path_control = Some(crate::canon::PathControl::Continuous);
            }
            80 => {
                modals.set(ModalGroup::G1)?;
                gv.motion_mode = MotionMode::CancelMotionMode;
                gv.motion_mode_explicit = true;
            }
            90 => match point(value) {
                0 => {
                    modals.set(ModalGroup::G3)?;
                    gv.distance_mode = Some(DistanceMode::Absolute);
                }
                1 => gv.arc_distance_mode = Some(DistanceMode::Absolute),
                _ => return Err(Status::GcodeCommandUnsupported),
            },
            91 => match point(value) {
                0 => {
                    modals.set(ModalGroup::G3)?;
                    gv.distance_mode = Some(DistanceMode::Incremental);
                }
                1 => gv.arc_distance_mode = Some(DistanceMode::Incremental),
                _ => return Err(Status::GcodeCommandUnsupported),
            },
            92 => match point(value) {
                0 => {
                    modals.set(ModalGroup::G0)?;
                    gv.next_action = NextAction::SetG92Offsets;
                }
                1 => gv.next_action = NextAction::ResetG92Offsets,
                2 => gv.next_action = NextAction::SuspendG92Offsets,
                3 => gv.next_action = NextAction::ResumeG92Offsets,
                _ => return Err(Status::GcodeCommandUnsupported),
            },
            93 => {
                modals.set(ModalGroup::G5)?;
                gv.feed_rate_mode = Some(FeedRateMode::InverseTime);
            }
            94 => {
                modals.set(ModalGroup::G5)?;
                gv.feed_rate_mode = Some(FeedRateMode::UnitsPerMinute);
            }
            _ => return Err(Status::GcodeCommandUnsupported),
        }
        Ok(())
    }

    fn parse_m(&self, gv: &mut GcodeInput, modals: &mut Modals, value: f64) -> Result<(), Status> {
        match value.trunc() as u16 {
            0 | 1 | 60 => {
                modals.set(ModalGroup::M4)?;
                gv.program_flow = Some(ProgramFlow::Stop);
            }
            2 | 30 => {
                modals.set(ModalGroup::M4)?;
                gv.program_flow = Some(ProgramFlow::End);
            }
            3 => {
                modals.set(ModalGroup::M7)?;
                gv.spindle_control = Some(SpindleControl::Cw);
            }
            4 => {
                modals.set(ModalGroup::M7)?;
                gv.spindle_control = Some(SpindleControl::Ccw);
            }
            5 => {
                modals.set(ModalGroup::M7)?;
                gv.spindle_control = Some(SpindleControl::Off);
            }
            6 => {
                modals.set(ModalGroup::M6)?;
                gv.tool_change = true;
            }
            7 => {
                modals.set(ModalGroup::M8)?;
                gv.coolant_mist = true;
            }
            8 => {
                modals.set(ModalGroup::M8)?;
                gv.coolant_flood = true;
            }
            9 => {
                modals.set(ModalGroup::M8)?;
                gv.coolant_off = true;
            }
            48 => {
                modals.set(ModalGroup::M9)?;
                gv.m48_enable = Some(true);
            }
            49 => {
                modals.set(ModalGroup::M9)?;
                gv.m48_enable = Some(false);
            }
            50 => match point(value) {
                0 => {
                    modals.set(ModalGroup::M9)?;
                    gv.fro_control = true;
                }
                1 => {
                    modals.set(ModalGroup::M9)?;
                    gv.tro_control = true;
                }
                _ => return Err(Status::McodeCommandUnsupported),
            },
            51 => {
                modals.set(ModalGroup::M9)?;
                gv.spo_control = true;
            }
            100 => match point(value) {
                0 => gv.next_action = NextAction::JsonCommandSync,
                1 => gv.next_action = NextAction::JsonCommandImmediate,
                _ => return Err(Status::McodeCommandUnsupported),
            },
            101 => gv.next_action = NextAction::JsonWait,
            _ => return Err(Status::McodeCommandUnsupported),
        }
        Ok(())
    }

    fn validate(&self, gv: &GcodeInput, modals: &Modals) -> Result<(), Status> {
        // NIST 3.4: an explicit group-1 word and a group-0 axis-word command
        // in the same block is an error when both carry axis words. An
        // implicit group-1 mode is merely suspended for the block.
        if modals.has(ModalGroup::G0) && modals.has(ModalGroup::G1) && gv.has_axis_word() {
            return Err(Status::ModalGroupViolation);
        }
        // motion words need something to act on
        if gv.motion_mode_explicit && gv.next_action == NextAction::Default {
            match gv.motion_mode {
                MotionMode::StraightTraverse | MotionMode::StraightFeed => {
                    if !gv.has_axis_word() {
                        return Err(Status::GcodeAxisIsMissing);
                    }
                }
                MotionMode::CwArc | MotionMode::CcwArc => {
                    if !gv.has_axis_word() && !gv.has_arc_word() {
                        return Err(Status::GcodeAxisIsMissing);
                    }
                }
                MotionMode::CancelMotionMode => {}
            }
        }
        Ok(())
    }
}

/// Top-level entry: parse one raw line and run it against the machine.
/// Returns `Ok(false)` for lines that produce no action (comments, block
/// deletes).
pub fn gcode_parser(machine: &mut Machine, line: &str) -> Result<bool, Status> {
    let (body, checksum_present) = verify_line(line)?;
    #[allow(unused_mut)]
    let mut block = crate::gcode::normalize(&body);
    if block.commands.is_empty() && block.active_comment.is_none() {
        return Ok(false);
    }

    // M2/M30 clear a soft alarm before the alarm gate is applied
    machine.cm_parse_clear(&block.commands);
    machine.cm_check_alarmed()?;

    if block.block_delete {
        debug!("block delete: {}", line.trim());
        return Ok(false);
    }

    #[cfg(feature = "marlin")]
    {
        match crate::marlin::handle(machine, &block.commands)? {
            crate::marlin::MarlinOutcome::Consumed => return Ok(true),
            crate::marlin::MarlinOutcome::Rewrite(rewritten) => block.commands = rewritten,
            crate::marlin::MarlinOutcome::NotHandled => {}
        }
    }

    let mut gv = machine.parser.parse_block(
        &block.commands,
        machine.cm.gm.motion_mode,
        machine.cm.gm.feed_rate_mode == FeedRateMode::InverseTime,
    )?;
    gv.checksum_present = checksum_present;
    execute_block(machine, &gv, block.active_comment.as_deref())?;

    // active comments on ordinary lines (messages and the like) execute
    // immediately; M100/M101 consumed theirs above
    let json_action = matches!(
        gv.next_action,
        NextAction::JsonCommandSync | NextAction::JsonCommandImmediate | NextAction::JsonWait
    );
    if !json_action {
        if let Some(ac) = &block.active_comment {
            machine.run_json(ac)?;
        }
    }
    Ok(true)
}

fn verify_line(line: &str) -> Result<(String, bool), Status> {
    let (body, present) = crate::gcode::verify_checksum(line)?;
    Ok((body.to_string(), present))
}

/// Apply a parsed block in NIST execution order.
pub fn execute_block(
    machine: &mut Machine,
    gv: &GcodeInput,
    active_comment: Option<&str>,
) -> Result<(), Status> {
    machine.cm_cycle_start();

    if let Some(n) = gv.linenum {
        machine.cm_set_model_linenum(n);
    }
    if let Some(enable) = gv.m48_enable {
        machine.cm_m48_enable(enable);
    }
    if gv.fro_control {
        machine.cm_fro_control(gv.p_word)?;
    }
    if gv.tro_control {
        machine.cm_tro_control(gv.p_word)?;
    }
    if gv.spo_control {
        machine.cm_spo_control(gv.p_word)?;
    }
    if let Some(mode) = gv.feed_rate_mode {
        machine.cm_set_feed_rate_mode(mode);
    }
    if let Some(f) = gv.f_word {
        machine.cm_set_feed_rate(f)?;
    }
    if let Some(s) = gv.s_word {
        machine.cm_spindle_speed_sync(s)?;
    }
    if let Some(t) = gv.tool_select {
        machine.cm_select_tool(t)?;
    }
    if gv.tool_change {
        machine.cm_change_tool()?;
    }
    if let Some(spindle) = gv.spindle_control {
        machine.cm_spindle_control_sync(spindle)?;
    }
    if gv.coolant_mist {
        machine.cm_coolant_control_sync(CoolantSelect::Mist, true)?;
    }
    if gv.coolant_flood {
        machine.cm_coolant_control_sync(CoolantSelect::Flood, true)?;
    }
    if gv.coolant_off {
        machine.cm_coolant_control_sync(CoolantSelect::Both, false)?;
    }
    if gv.next_action == NextAction::Dwell {
        machine.cm_dwell(gv.p_word.unwrap_or(0.0))?;
    }
    if let Some(plane) = gv.select_plane {
        machine.cm_select_plane(plane);
    }
    if let Some(units) = gv.units_mode {
        machine.cm_set_units_mode(units);
    }
    match gv.next_action {
        NextAction::SetTlOffset => machine.cm_set_tl_offset(gv.h_word, false)?,
        NextAction::SetAdditionalTlOffset => machine.cm_set_tl_offset(gv.h_word, true)?,
        NextAction::CancelTlOffset => machine.cm_cancel_tl_offset(),
        _ => {}
    }
    if let Some(cs) = gv.coord_system {
        machine.cm_set_coord_system(cs);
    }
    if let Some(pc) = gv.path_control {
        machine.cm_set_path_control(pc);
    }
    if let Some(dm) = gv.distance_mode {
        machine.cm_set_distance_mode(dm);
    }
    if let Some(adm) = gv.arc_distance_mode {
        machine.cm_set_arc_distance_mode(adm);
    }

    match gv.next_action {
        NextAction::SetG28Position => machine.cm_set_g28_position()?,
        NextAction::GotoG28Position => machine.cm_goto_stored_position(&gv.target, true)?,
        NextAction::SetG30Position => machine.cm_set_g30_position()?,
        NextAction::GotoG30Position => machine.cm_goto_stored_position(&gv.target, false)?,
        NextAction::SearchHome => machine.cm_homing_cycle_start(&gv.target, true)?,
        NextAction::HomingNoSet => machine.cm_homing_cycle_start(&gv.target, false)?,
        NextAction::SetAbsoluteOrigin => machine.cm_set_absolute_origin(&gv.target)?,
        NextAction::ProbeTowardAlarm => machine.cm_straight_probe(&gv.target, true, true)?,
        NextAction::ProbeToward => machine.cm_straight_probe(&gv.target, true, false)?,
        NextAction::ProbeAwayAlarm => machine.cm_straight_probe(&gv.target, false, true)?,
        NextAction::ProbeAway => machine.cm_straight_probe(&gv.target, false, false)?,
        NextAction::SetG10Data => {
            machine.cm_set_g10_data(gv.p_word, gv.l_word, &gv.target)?;
        }
        NextAction::SetG92Offsets => machine.cm_set_g92_offsets(&gv.target)?,
        NextAction::ResetG92Offsets => machine.cm_reset_g92_offsets(),
        NextAction::SuspendG92Offsets => machine.cm_suspend_g92_offsets(),
        NextAction::ResumeG92Offsets => machine.cm_resume_g92_offsets(),
        NextAction::JsonCommandSync => {
            machine.cm_json_command(active_comment.unwrap_or("{}"))?;
        }
        NextAction::JsonCommandImmediate => {
            machine.cm_json_command_immediate(active_comment.unwrap_or("{}"))?;
        }
        NextAction::JsonWait => {
            machine.cm_json_wait(active_comment.unwrap_or("{}"))?;
        }
        NextAction::Default => {
            machine.cm_set_absolute_override(gv.absolute_override);
            let result = match gv.motion_mode {
                MotionMode::CancelMotionMode => {
                    machine.cm.gm.motion_mode = MotionMode::CancelMotionMode;
                    Ok(())
                }
                MotionMode::StraightTraverse => {
                    if gv.has_axis_word() {
                        machine.cm_straight_traverse(&gv.target)
                    } else {
                        Ok(())
                    }
                }
                MotionMode::StraightFeed => {
                    if gv.has_axis_word() {
                        machine.cm_straight_feed(&gv.target)
                    } else {
                        Ok(())
                    }
                }
                MotionMode::CwArc | MotionMode::CcwArc => {
                    if gv.has_axis_word() || gv.arc_offset.iter().any(|o| o.is_some()) {
                        machine.cm_arc_feed(
                            &gv.target,
                            &gv.arc_offset,
                            gv.arc_radius,
                            gv.p_word,
                            gv.motion_mode == MotionMode::CwArc,
                        )
                    } else {
                        Ok(())
                    }
                }
            };
            machine.cm_set_absolute_override(false);
            result?;
        }
        NextAction::Dwell
        | NextAction::SetTlOffset
        | NextAction::SetAdditionalTlOffset
        | NextAction::CancelTlOffset => {}
    }

    if let Some(flow) = gv.program_flow {
        match flow {
            ProgramFlow::Stop => machine.cm_program_stop()?,
            ProgramFlow::End => machine.cm_program_end()?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canon::MotionMode;

    fn parse(text: &str) -> Result<GcodeInput, Status> {
        GcodeParser::new().parse_block(text, MotionMode::CancelMotionMode, false)
    }

    #[test]
    fn words_extract_in_order() {
        let gv = parse("G1X100Y-2.5F400").unwrap();
        assert_eq!(gv.motion_mode, MotionMode::StraightFeed);
        assert!(gv.motion_mode_explicit);
        assert_eq!(gv.target[0], Some(100.0));
        assert_eq!(gv.target[1], Some(-2.5));
        assert_eq!(gv.f_word, Some(400.0));
    }

    #[test]
    fn line_numbers_keep_integer_precision() {
        let gv = parse("N16777217G4P0").unwrap();
        assert_eq!(gv.linenum, Some(16_777_217));
    }

    #[test]
    fn dotted_codes_dispatch() {
        assert_eq!(parse("G38.2X5").unwrap().next_action, NextAction::ProbeTowardAlarm);
        assert_eq!(parse("G38.5X5").unwrap().next_action, NextAction::ProbeAway);
        assert_eq!(parse("G92.1").unwrap().next_action, NextAction::ResetG92Offsets);
        assert_eq!(parse("G28.3X0").unwrap().next_action, NextAction::SetAbsoluteOrigin);
    }

    #[test]
    fn modal_group_violation_same_group() {
        assert_eq!(parse("G0G1X1").unwrap_err(), Status::ModalGroupViolation);
        assert_eq!(parse("G17G18").unwrap_err(), Status::ModalGroupViolation);
        assert_eq!(parse("M3M5").unwrap_err(), Status::ModalGroupViolation);
    }

    #[test]
    fn group0_and_group1_with_axes_conflict() {
        assert_eq!(parse("G1G92X5").unwrap_err(), Status::ModalGroupViolation);
    }

    #[test]
    fn implicit_motion_suspended_for_group0() {
        // G92 with an implicit G1 active is fine: the motion word is suspended
        let gv = GcodeParser::new()
            .parse_block("G92X5", MotionMode::StraightFeed, false)
            .unwrap();
        assert_eq!(gv.next_action, NextAction::SetG92Offsets);
        assert!(!gv.motion_mode_explicit);
    }

    #[test]
    fn motion_without_axes_is_an_error() {
        assert_eq!(parse("G1").unwrap_err(), Status::GcodeAxisIsMissing);
        assert_eq!(parse("G0").unwrap_err(), Status::GcodeAxisIsMissing);
        assert_eq!(parse("G2F100").unwrap_err(), Status::GcodeAxisIsMissing);
        // a full-circle arc has no axis words but does have an offset
        assert!(parse("G2I5").is_ok());
    }

    #[test]
    fn unsupported_codes_are_flagged() {
        assert_eq!(parse("G123").unwrap_err(), Status::GcodeCommandUnsupported);
        assert_eq!(parse("M999").unwrap_err(), Status::McodeCommandUnsupported);
    }

    #[test]
    fn malformed_words_are_flagged() {
        assert_eq!(parse("G1X").unwrap_err(), Status::BadNumberFormat);
        assert_eq!(parse("G1X1.2.3").unwrap_err(), Status::BadNumberFormat);
    }

    #[test]
    fn inverse_time_mode_requires_fresh_f() {
        let gv = GcodeParser::new()
            .parse_block("G1X5", MotionMode::StraightFeed, true)
            .unwrap();
        // F forced to zero so the canonical machine can reject the move
        assert_eq!(gv.f_word, Some(0.0));
    }

    #[test]
    fn override_controls_parse() {
        let gv = parse("M50P0.5").unwrap();
        assert!(gv.fro_control);
        assert_eq!(gv.p_word, Some(0.5));
        let gv = parse("M50.1P0.8").unwrap();
        assert!(gv.tro_control);
        assert_eq!(parse("M48").unwrap().m48_enable, Some(true));
        assert_eq!(parse("M49").unwrap().m48_enable, Some(false));
    }

    #[test]
    fn program_flow_words() {
        assert_eq!(parse("M0").unwrap().program_flow, Some(ProgramFlow::Stop));
        assert_eq!(parse("M30").unwrap().program_flow, Some(ProgramFlow::End));
        assert_eq!(parse("M60").unwrap().program_flow, Some(ProgramFlow::Stop));
    }
}
