//! Runtime executor: walks the active block's head/body/tail sections,
//! samples the quintic-Bézier velocity curve into fixed-duration segments,
//! and hands per-motor step deltas to the stepper preparer.
//!
//! Everything in this module runs from the low-priority software interrupt.
//! Each call to the aline executor must produce one and only one prepared
//! segment: `Again` when the block has more segments, `Done` when the block
//! completed, `Noop` when nothing must be loaded.

use log::warn;

use crate::canon::{CycleType, GcodeState, HoldState, MachineState, MotionState, ProbeResult};
use crate::machine::{Machine, PlannerSel};
use crate::math::{self, AxisVec};
use crate::planner::{
    zoid, BlockRuntime, BlockState, BlockType, BufferState, Section, SectionState,
    MIN_SEGMENT_TIME, NOM_SEGMENT_USEC, SECTIONS,
};
use crate::report::SrRequest;
use crate::status::{ExecOutcome, Status};
use crate::{AXES, MOTORS};

macro_rules! mp {
    ($m:expr) => {
        match $m.planner_sel {
            PlannerSel::Primary => &mut $m.mp1,
            PlannerSel::Secondary => &mut $m.mp2,
        }
    };
}

fn usec(minutes: f64) -> f64 {
    minutes * 60.0e6
}

/// Persistent runtime state for the currently executing block.
#[derive(Debug)]
pub struct Runtime {
    pub block_state: BlockState,
    pub section: Section,
    pub section_state: SectionState,

    pub out_of_band_dwell_flag: bool,
    pub out_of_band_dwell_seconds: f64,

    pub unit: AxisVec,
    pub axis_flags: [bool; AXES],
    /// Final target of the running block, for position correction.
    pub target: AxisVec,
    /// Current runtime position.
    pub position: AxisVec,
    /// Kahan summation residue per axis.
    pub target_comp: AxisVec,
    /// Section endpoints, snapped to on the last segment of each section.
    pub waypoint: [AxisVec; SECTIONS],

    pub target_steps: [f64; MOTORS],
    pub position_steps: [f64; MOTORS],
    /// Target delayed by one more segment, time-aligned with the encoders.
    pub commanded_steps: [f64; MOTORS],
    pub encoder_steps: [f64; MOTORS],
    pub following_error: [f64; MOTORS],

    pub blocks: [BlockRuntime; 2],
    /// Index of the running block in `blocks`.
    pub r: usize,
    /// Index of the block being forward-planned. Swaps with `r` only when a
    /// new block starts.
    pub p: usize,

    pub entry_velocity: f64,

    pub segments: f64,
    pub segment_count: u32,
    pub segment_velocity: f64,
    pub segment_time: f64,

    /// Forward-difference levels F_1..F_5.
    pub forward_diff: [f64; 5],

    pub gm: GcodeState,
}

impl Runtime {
    pub fn new() -> Self {
        Runtime {
            block_state: BlockState::Inactive,
            section: Section::Head,
            section_state: SectionState::Off,
            out_of_band_dwell_flag: false,
            out_of_band_dwell_seconds: 0.0,
            unit: [0.0; AXES],
            axis_flags: [false; AXES],
            target: [0.0; AXES],
            position: [0.0; AXES],
            target_comp: [0.0; AXES],
            waypoint: [[0.0; AXES]; SECTIONS],
            target_steps: [0.0; MOTORS],
            position_steps: [0.0; MOTORS],
            commanded_steps: [0.0; MOTORS],
            encoder_steps: [0.0; MOTORS],
            following_error: [0.0; MOTORS],
            blocks: [BlockRuntime::default(); 2],
            r: 0,
            p: 1,
            entry_velocity: 0.0,
            segments: 0.0,
            segment_count: 0,
            segment_velocity: 0.0,
            segment_time: 0.0,
            forward_diff: [0.0; 5],
            gm: GcodeState::default(),
        }
    }

    /// Reset for the next use without wiping position or step state.
    pub fn reset(&mut self) {
        self.block_state = BlockState::Inactive;
        self.section = Section::Head;
        self.section_state = SectionState::Off;
        self.entry_velocity = 0.0;
        self.blocks[self.r].exit_velocity = 0.0;
        self.segment_velocity = 0.0;
        self.target_comp = [0.0; AXES];
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

/// Fold any section shorter than the minimum segment time into a neighbor,
/// so segment iteration always advances. Heads and tails keep their
/// endpoints; the body absorbs a short head or tail; a too-short body splits
/// into the head and tail.
pub fn normalize_block(b: &mut BlockRuntime, entry_velocity: f64) {
    if b.head_length > 0.0 && b.head_time < MIN_SEGMENT_TIME {
        b.body_length += b.head_length;
        b.body_time = b.body_length / b.cruise_velocity;
        b.head_length = 0.0;
        b.head_time = 0.0;
    }
    if b.tail_length > 0.0 && b.tail_time < MIN_SEGMENT_TIME {
        b.body_length += b.tail_length;
        b.body_time = b.body_length / b.cruise_velocity;
        b.tail_length = 0.0;
        b.tail_time = 0.0;
    }
    if b.body_length > 0.0 && b.body_time < MIN_SEGMENT_TIME {
        if b.tail_length > 0.0 {
            if b.head_length > 0.0 {
                b.head_length += b.body_length * 0.5;
                b.tail_length += b.body_length * 0.5;
                b.head_time = (2.0 * b.head_length) / (entry_velocity + b.cruise_velocity);
                b.tail_time = (2.0 * b.tail_length) / (b.cruise_velocity + b.exit_velocity);
            } else {
                b.tail_length += b.body_length;
                b.tail_time = (2.0 * b.tail_length) / (b.cruise_velocity + b.exit_velocity);
            }
            b.body_length = 0.0;
            b.body_time = 0.0;
        } else if b.head_length > 0.0 {
            b.head_length += b.body_length;
            b.head_time = (2.0 * b.head_length) / (entry_velocity + b.cruise_velocity);
            b.body_length = 0.0;
            b.body_time = 0.0;
        } else {
            warn!("move is all body and still too short to segment");
        }
    }
}

impl Machine {
    /// Just-in-time forward planning. Called from its own low-priority
    /// software interrupt; never plans the running block and never more than
    /// one move ahead of the executor.
    pub fn mp_forward_plan(&mut self) -> ExecOutcome {
        let mp = mp!(self);
        let run_idx = match mp.q.get_run_buffer() {
            Some(i) => i,
            None => {
                self.st_prep_null();
                return ExecOutcome::Noop;
            }
        };
        if mp.q.blocks[run_idx].buffer_state < BufferState::BackPlanned {
            return ExecOutcome::Noop;
        }

        let mut bf;
        let mut entry_velocity;
        if mp.q.blocks[run_idx].buffer_state == BufferState::Running {
            bf = mp.q.next(run_idx);
            entry_velocity = self.mr.blocks[self.mr.r].exit_velocity;
        } else {
            bf = run_idx;
            entry_velocity = self.mr.entry_velocity;
        }

        let mut planned_something = false;

        if mp.q.blocks[bf].block_type.is_command() {
            // "planning" a command is just marking it; skip chains of them.
            // The hop bound covers a ring made entirely of commands.
            let mut hops = 0;
            while mp.q.blocks[bf].block_type.is_command() && hops < mp.q.size() {
                if mp.q.blocks[bf].buffer_state == BufferState::BackPlanned {
                    mp.q.blocks[bf].buffer_state = BufferState::FullyPlanned;
                    planned_something = true;
                }
                bf = mp.q.next(bf);
                hops += 1;
            }
            if mp.q.blocks[bf].block_type == BlockType::Aline
                && mp.q.blocks[bf].buffer_state > BufferState::BackPlanned
            {
                entry_velocity = self.mr.blocks[self.mr.r].exit_velocity;
            }
        }

        if mp.q.blocks[bf].block_type == BlockType::Aline
            && mp.q.blocks[bf].buffer_state == BufferState::BackPlanned
        {
            let p = self.mr.p;
            let changed =
                zoid::calculate_ramps(&mut self.mr.blocks[p], &mut mp.q.blocks[bf], entry_velocity);
            mp.entry_changed = changed;
            mp.q.blocks[bf].buffer_state = BufferState::FullyPlanned;
            mp.q.blocks[bf].plannable = false;
            let b = &self.mr.blocks[p];
            if b.exit_velocity > b.cruise_velocity + 1e-6 {
                warn!("forward plan produced exit velocity above cruise");
            }
            planned_something = true;
        }

        if planned_something {
            ExecOutcome::Done
        } else {
            ExecOutcome::Noop
        }
    }

    /// Executor entry: dequeue and run the next piece of work, producing at
    /// most one prepared segment.
    pub fn mp_exec_move(&mut self) -> Result<ExecOutcome, Status> {
        // out-of-band dwell, armed on feed-hold exit while the executor idles
        if self.mr.out_of_band_dwell_flag {
            self.mr.out_of_band_dwell_flag = false;
            let seconds = self.mr.out_of_band_dwell_seconds;
            self.st_prep_out_of_band_dwell(seconds);
            return Ok(ExecOutcome::Done);
        }

        let motion_run = self.cm.motion_state == MotionState::Run;
        let mp = mp!(self);
        let bf_idx = match mp.q.get_run_buffer() {
            Some(i) => i,
            None => {
                self.st_prep_null();
                return Ok(ExecOutcome::Noop);
            }
        };

        let block_type = mp.q.blocks[bf_idx].block_type;
        if block_type == BlockType::Aline {
            let state = mp.q.blocks[bf_idx].buffer_state;
            if state != BufferState::Running {
                if state < BufferState::BackPlanned && motion_run {
                    // starvation: keep the motors energized, ask for planning
                    warn!("executor reached an unplanned buffer");
                    mp.request_planning = true;
                    self.st_prep_null();
                    return Ok(ExecOutcome::Noop);
                }
                if state == BufferState::BackPlanned {
                    // needs forward planning first; do it at its own priority
                    self.tb.request_forward_plan();
                    return Ok(ExecOutcome::Noop);
                }
                if state == BufferState::FullyPlanned {
                    mp.q.blocks[bf_idx].buffer_state = BufferState::Running;
                } else {
                    return Ok(ExecOutcome::Noop);
                }
            }
            // keep asking for the next move to be forward planned
            let next = mp.q.next(bf_idx);
            if mp.q.blocks[next].buffer_state >= BufferState::BackPlanned {
                self.tb.request_forward_plan();
            }
            return self.mp_exec_aline(bf_idx);
        }
        if block_type == BlockType::Null {
            return Ok(ExecOutcome::Noop);
        }
        self.mp_exec_command(bf_idx)
    }

    /// Stage a command/dwell block for the loader and release its buffer.
    fn mp_exec_command(&mut self, bf_idx: usize) -> Result<ExecOutcome, Status> {
        if self.cm.machine_state != MachineState::Cycle {
            return Ok(ExecOutcome::Noop); // program stop/end holds the stream
        }
        let mp = mp!(self);
        let state = mp.q.blocks[bf_idx].buffer_state;
        if state < BufferState::FullyPlanned {
            self.tb.request_forward_plan();
            return Ok(ExecOutcome::Noop);
        }
        let block_type = mp.q.blocks[bf_idx].block_type;
        if block_type == BlockType::Dwell {
            let seconds = mp.q.blocks[bf_idx].dwell_seconds;
            let empty = mp.q.free_run_buffer();
            self.st_prep_dwell(seconds * 1.0e6);
            if !empty {
                self.tb.request_forward_plan();
            }
            return Ok(ExecOutcome::Done);
        }
        let payload = mp.q.blocks[bf_idx].command.take();
        let empty = mp.q.free_run_buffer();
        self.st_prep_command(payload);
        if !empty {
            self.tb.request_forward_plan();
        }
        Ok(ExecOutcome::Done)
    }

    /// Acceleration-line executor. See the state transition notes in the
    /// module docs; the sequencing here must be exactly right.
    pub fn mp_exec_aline(&mut self, bf_idx: usize) -> Result<ExecOutcome, Status> {
        if self.cm.machine_state != MachineState::Cycle {
            return Ok(ExecOutcome::Noop);
        }
        {
            let mp = mp!(self);
            if mp.q.blocks[bf_idx].block_state == BlockState::Inactive {
                return Ok(ExecOutcome::Noop);
            }
        }

        // Initialize a new block, regardless of normal or feedhold operation
        if self.mr.block_state == BlockState::Inactive {
            let mp = mp!(self);
            let bf = &mut mp.q.blocks[bf_idx];
            if math::fp_zero(bf.length) {
                warn!("zero length move reached the executor");
            }
            self.mr.gm = bf.gm.clone();
            bf.block_state = BlockState::Active;
            self.mr.block_state = BlockState::InitialAction;

            // the ONLY place where r and p may change identity
            self.mr.r = self.mr.p;
            self.mr.p = 1 - self.mr.p;

            let entry = self.mr.entry_velocity;
            let r = self.mr.r;
            if entry > self.mr.blocks[r].cruise_velocity + 1e-6 {
                warn!("entry velocity above cruise velocity at block start");
            }
            if self.mr.blocks[r].exit_velocity > self.mr.blocks[r].cruise_velocity + 1e-6 {
                warn!("exit velocity above cruise velocity at block start");
            }
            normalize_block(&mut self.mr.blocks[r], entry);

            self.mr.unit = bf.unit;
            self.mr.target = bf.gm.target;
            self.mr.axis_flags = bf.axis_flags;
            self.mr.target_comp = [0.0; AXES];

            self.mr.section_state = SectionState::New;
            self.mr.section = Section::Head;
            if math::fp_zero(self.mr.blocks[r].head_length) {
                self.mr.section = Section::Body;
                if math::fp_zero(self.mr.blocks[r].body_length) {
                    self.mr.section = Section::Tail;
                }
            }

            // waypoints for floating-point position correction
            let b = self.mr.blocks[r];
            for axis in 0..AXES {
                let u = self.mr.unit[axis];
                let p = self.mr.position[axis];
                self.mr.waypoint[0][axis] = p + u * b.head_length;
                self.mr.waypoint[1][axis] = p + u * (b.head_length + b.body_length);
                self.mr.waypoint[2][axis] =
                    p + u * (b.head_length + b.body_length + b.tail_length);
            }
        }

        // probe end-condition: brake on the contact edge
        if let Some(pending) = self.cm.probe_pending {
            if !pending.triggered && self.hw.probe_input() == pending.toward {
                if let Some(p) = self.cm.probe_pending.as_mut() {
                    p.triggered = true;
                }
                self.cm.probe_result = Some(ProbeResult {
                    triggered: true,
                    position: self.mr.position,
                });
                if self.hold.get() == HoldState::Off {
                    self.hold.set(HoldState::Sync);
                    self.cm.motion_state = MotionState::Hold;
                }
            }
        }

        // Feedhold processing
        if self.hold.get() != HoldState::Off {
            if self.hold.get() == HoldState::MotionStopped {
                // VERY IMPORTANT to exit as a NOOP; do not load another move
                return Ok(ExecOutcome::Noop);
            }
            let outcome = self.exec_aline_feedhold(bf_idx)?;
            if outcome == ExecOutcome::Done || outcome == ExecOutcome::Noop {
                return Ok(outcome);
            }
        }

        self.mr.block_state = BlockState::Active;

        // from this point on the bf buffer contents do not affect execution
        let status = match self.mr.section {
            Section::Head => self.exec_aline_head()?,
            Section::Body => self.exec_aline_body()?,
            Section::Tail => self.exec_aline_tail()?,
        };

        // Conditionally make the move unplannable: allow 3 segments of
        // latency, and a tail can never be replanned once entered.
        if self.mr.section == Section::Tail
            || (self.mr.section == Section::Body && self.mr.segment_count < 3)
        {
            let mp = mp!(self);
            mp.q.blocks[bf_idx].plannable = false;
        }

        // Look for the end of a hold deceleration
        if self.hold.get() == HoldState::DecelToZero && status == ExecOutcome::Done {
            self.hold.set(HoldState::DecelComplete);
            let mp = mp!(self);
            mp.q.blocks[bf_idx].block_state = BlockState::InitialAction; // restart the rest later
        }

        if self.cm.motion_state != MotionState::Run && self.hold.get() == HoldState::Off {
            self.cm.motion_state = MotionState::Run;
        }

        if status == ExecOutcome::Again {
            self.sr_request(SrRequest::Timed);
        } else {
            self.mr.block_state = BlockState::Inactive;
            self.mr.section_state = SectionState::Off;
            self.mr.entry_velocity = self.mr.blocks[self.mr.r].exit_velocity;
            let mp = mp!(self);
            mp.run_time_remaining = 0.0;
            if mp.q.blocks[bf_idx].block_state == BlockState::Active {
                let empty = mp.q.free_run_buffer();
                if empty {
                    if self.hold.get() == HoldState::Off {
                        self.cm.motion_state = MotionState::Stop;
                        self.cm_cycle_end();
                    }
                } else {
                    self.tb.request_forward_plan();
                }
            }
        }
        Ok(status)
    }

    /// Precompute the Bézier forward differences for a head or tail section
    /// running from `v_0` to `v_1` over `mr.segments` intervals. The initial
    /// velocity is sampled at t = h/2 to approximate each segment's average.
    fn init_forward_diffs(&mut self, v_0: f64, v_1: f64) {
        let a = -6.0 * v_0 + 6.0 * v_1;
        let b = 15.0 * v_0 - 15.0 * v_1;
        let c = -10.0 * v_0 + 10.0 * v_1;
        // D = 0, E = 0, F = v_0

        let h = 1.0 / self.mr.segments;
        let h_2 = h * h;
        let h_3 = h_2 * h;
        let h_4 = h_3 * h;
        let h_5 = h_4 * h;

        let ah_5 = a * h_5;
        let bh_4 = b * h_4;
        let ch_3 = c * h_3;

        const CONST1: f64 = 7.5625; // 121/16
        const CONST2: f64 = 3.25; // 13/4
        const CONST3: f64 = 82.5; // 165/2

        self.mr.forward_diff[4] = CONST1 * ah_5 + 5.0 * bh_4 + CONST2 * ch_3; // F_5
        self.mr.forward_diff[3] = CONST3 * ah_5 + 29.0 * bh_4 + 9.0 * ch_3; // F_4
        self.mr.forward_diff[2] = 255.0 * ah_5 + 48.0 * bh_4 + 6.0 * ch_3; // F_3
        self.mr.forward_diff[1] = 300.0 * ah_5 + 24.0 * bh_4; // F_2
        self.mr.forward_diff[0] = 120.0 * ah_5; // F_1

        let half_h = h * 0.5;
        let half_h_3 = half_h * half_h * half_h;
        let half_h_4 = half_h_3 * half_h;
        let half_h_5 = half_h_4 * half_h;
        self.mr.segment_velocity = a * half_h_5 + b * half_h_4 + c * half_h_3 + v_0;
    }

    fn advance_forward_diffs(&mut self) {
        self.mr.forward_diff[4] += self.mr.forward_diff[3];
        self.mr.forward_diff[3] += self.mr.forward_diff[2];
        self.mr.forward_diff[2] += self.mr.forward_diff[1];
        self.mr.forward_diff[1] += self.mr.forward_diff[0];
    }

    fn exec_aline_head(&mut self) -> Result<ExecOutcome, Status> {
        let mut first_pass = false;
        if self.mr.section_state == SectionState::New {
            first_pass = true;
            let r = self.mr.r;
            if math::fp_zero(self.mr.blocks[r].head_length) {
                // feedhold may have changed the block
                self.mr.section = Section::Body;
                return self.exec_aline_body();
            }
            let head_time = self.mr.blocks[r].head_time;
            self.mr.segments = (usec(head_time) / NOM_SEGMENT_USEC).ceil();
            self.mr.segment_count = self.mr.segments as u32;
            self.mr.segment_time = head_time / self.mr.segments;
            if self.mr.segment_count == 1 {
                self.mr.segment_velocity = self.mr.blocks[r].head_length / self.mr.segment_time;
            } else {
                let entry = self.mr.entry_velocity;
                let cruise = self.mr.blocks[r].cruise_velocity;
                self.init_forward_diffs(entry, cruise);
            }
            if self.mr.segment_time < MIN_SEGMENT_TIME {
                warn!("head segment time below minimum");
                return Ok(ExecOutcome::Done); // exit without advancing position
            }
            self.mr.section_state = SectionState::Running;
        } else {
            self.mr.segment_velocity += self.mr.forward_diff[4];
        }

        if self.exec_aline_segment()? == ExecOutcome::Done {
            let r = self.mr.r;
            if math::fp_zero(self.mr.blocks[r].body_length)
                && math::fp_zero(self.mr.blocks[r].tail_length)
            {
                return Ok(ExecOutcome::Done); // ends the move
            }
            self.mr.section = Section::Body;
            self.mr.section_state = SectionState::New;
        } else if !first_pass {
            self.advance_forward_diffs();
        }
        Ok(ExecOutcome::Again)
    }

    /// The body runs in segments even though it is a straight line, so feed
    /// holds can engage mid-line with minimum latency.
    fn exec_aline_body(&mut self) -> Result<ExecOutcome, Status> {
        if self.mr.section_state == SectionState::New {
            let r = self.mr.r;
            if math::fp_zero(self.mr.blocks[r].body_length) {
                self.mr.section = Section::Tail;
                return self.exec_aline_tail();
            }
            let body_time = self.mr.blocks[r].body_time;
            self.mr.segments = (usec(body_time) / NOM_SEGMENT_USEC).ceil();
            self.mr.segment_time = body_time / self.mr.segments;
            self.mr.segment_velocity = self.mr.blocks[r].cruise_velocity;
            self.mr.segment_count = self.mr.segments as u32;
            if self.mr.segment_time < MIN_SEGMENT_TIME {
                warn!("body segment time below minimum");
                return Ok(ExecOutcome::Done);
            }
            self.mr.section_state = SectionState::Running;
        }
        if self.exec_aline_segment()? == ExecOutcome::Done {
            let r = self.mr.r;
            if math::fp_zero(self.mr.blocks[r].tail_length) {
                return Ok(ExecOutcome::Done);
            }
            self.mr.section = Section::Tail;
            self.mr.section_state = SectionState::New;
        }
        Ok(ExecOutcome::Again)
    }

    fn exec_aline_tail(&mut self) -> Result<ExecOutcome, Status> {
        let mut first_pass = false;
        if self.mr.section_state == SectionState::New {
            first_pass = true;
            let r = self.mr.r;
            if math::fp_zero(self.mr.blocks[r].tail_length) {
                return Ok(ExecOutcome::Done); // end the move
            }
            let tail_time = self.mr.blocks[r].tail_time;
            self.mr.segments = (usec(tail_time) / NOM_SEGMENT_USEC).ceil();
            self.mr.segment_count = self.mr.segments as u32;
            self.mr.segment_time = tail_time / self.mr.segments;
            if self.mr.segment_count == 1 {
                self.mr.segment_velocity = self.mr.blocks[r].tail_length / self.mr.segment_time;
            } else {
                let cruise = self.mr.blocks[r].cruise_velocity;
                let exit = self.mr.blocks[r].exit_velocity;
                self.init_forward_diffs(cruise, exit);
            }
            if self.mr.segment_time < MIN_SEGMENT_TIME {
                warn!("tail segment time below minimum");
                return Ok(ExecOutcome::Done);
            }
            self.mr.section_state = SectionState::Running;
        } else {
            self.mr.segment_velocity += self.mr.forward_diff[4];
        }

        if self.exec_aline_segment()? == ExecOutcome::Done {
            return Ok(ExecOutcome::Done);
        } else if !first_pass {
            self.advance_forward_diffs();
        }
        Ok(ExecOutcome::Again)
    }

    /// Produce one segment: compute the per-axis target (waypoint-snapped on
    /// the final segment of a section), convert through kinematics, derive
    /// per-motor travel and following error, and hand off to the stepper
    /// preparer.
    fn exec_aline_segment(&mut self) -> Result<ExecOutcome, Status> {
        self.mr.segment_count -= 1;
        if self.mr.segment_count == 0 && self.hold.get() == HoldState::Off {
            // sync to the section endpoint; not while going into a hold
            self.mr.gm.target = self.mr.waypoint[self.mr.section.index()];
        } else {
            let segment_length = self.mr.segment_velocity * self.mr.segment_time;
            for a in 0..AXES {
                // Kahan-compensated accumulation avoids drift over thousands
                // of segments
                let to_add = self.mr.unit[a] * segment_length - self.mr.target_comp[a];
                let target = self.mr.position[a] + to_add;
                self.mr.target_comp[a] = (target - self.mr.position[a]) - to_add;
                self.mr.gm.target[a] = target;
            }
        }

        // bucket-brigade the step chain before fetching the new target
        for m in 0..MOTORS {
            self.mr.commanded_steps[m] = self.mr.position_steps[m];
            self.mr.position_steps[m] = self.mr.target_steps[m];
            self.mr.encoder_steps[m] = self.enc.read(m);
            self.mr.following_error[m] = self.mr.encoder_steps[m] - self.mr.commanded_steps[m];
        }
        let mut target_steps = [0.0; MOTORS];
        self.kin.inverse(&self.mr.gm.target, &mut target_steps);
        self.mr.target_steps = target_steps;

        let mut travel_steps = [0.0; MOTORS];
        for m in 0..MOTORS {
            travel_steps[m] = target_steps[m] - self.mr.position_steps[m];
            // sub-centistep travel is rounding noise; encoder feedback
            // corrects any accumulation
            if travel_steps[m].abs() < 0.01 {
                travel_steps[m] = 0.0;
            }
        }

        let segment_time = self.mr.segment_time;
        {
            let mp = mp!(self);
            mp.run_time_remaining = (mp.run_time_remaining - segment_time).max(0.0);
        }

        let following_error = self.mr.following_error;
        self.st_prep_line(&mut travel_steps, &following_error, segment_time)?;
        self.mr.position = self.mr.gm.target;
        if self.mr.segment_count == 0 {
            Ok(ExecOutcome::Done)
        } else {
            Ok(ExecOutcome::Again)
        }
    }

    /// Feedhold helper: manages the deceleration into the hold and the
    /// stop/stopped transitions. Returns `Again` to continue section
    /// execution, `Done`/`Noop` to exit the aline executor.
    fn exec_aline_feedhold(&mut self, bf_idx: usize) -> Result<ExecOutcome, Status> {
        let hold = self.hold.get();

        // wait for the steppers to actually stop
        if hold == HoldState::MotionStopping {
            if !self.st_runtime_isbusy() {
                let remaining = math::axis_vector_length(&self.mr.position, &self.mr.target);
                let skip_remainder = matches!(
                    self.cm.cycle_type,
                    CycleType::Probe | CycleType::Homing
                );
                let runtime_position = self.mr.position;
                let mp = mp!(self);
                if skip_remainder || remaining < math::EPSILON_LENGTH {
                    mp.position = runtime_position;
                    mp.q.free_run_buffer();
                } else {
                    // set the block up to run its remainder on resume
                    let bf = &mut mp.q.blocks[bf_idx];
                    bf.length = remaining;
                    bf.block_state = BlockState::InitialAction;
                    let mut i = bf_idx;
                    while mp.q.blocks[i].buffer_state > BufferState::BackPlanned {
                        mp.q.blocks[i].buffer_state = BufferState::BackPlanned;
                        mp.q.blocks[i].plannable = true;
                        i = mp.q.next(i);
                    }
                }
                self.mr.reset();
                self.cm.motion_state = MotionState::Stop;
                self.hold.set(HoldState::MotionStopped);
                // hold-time commands go to the secondary queue until resume
                self.planner_sel = PlannerSel::Secondary;
                self.sr_request(SrRequest::Immediate);
            }
            return Ok(ExecOutcome::Noop);
        }

        // decelerated to zero; complete this exec before stopping
        if hold == HoldState::DecelComplete {
            self.hold.set(HoldState::MotionStopping);
            return Ok(ExecOutcome::Done);
        }

        if hold == HoldState::Sync
            || (hold == HoldState::DecelContinue && self.mr.block_state == BlockState::InitialAction)
        {
            // already in a tail: the move is already decelerating
            if self.mr.section == Section::Tail {
                if self.mr.blocks[self.mr.r].exit_velocity < 1.0e-4 {
                    self.hold.set(HoldState::DecelToZero);
                } else {
                    self.hold.set(HoldState::DecelContinue);
                }
                return Ok(ExecOutcome::Again);
            }
            // mid-head: jerk is locked in, wait for the body or tail
            if self.mr.section == Section::Head && self.mr.section_state != SectionState::New {
                return Ok(ExecOutcome::Again);
            }

            // body, or a head that has not started: replace with a tail
            self.mr.section = Section::Tail;
            self.mr.section_state = SectionState::New;
            self.mr.entry_velocity = self.mr.segment_velocity;
            let r = self.mr.r;
            let cruise = self.mr.entry_velocity;
            self.mr.blocks[r].cruise_velocity = cruise;
            self.mr.blocks[r].head_length = 0.0;
            self.mr.blocks[r].head_time = 0.0;
            self.mr.blocks[r].body_length = 0.0;
            self.mr.blocks[r].body_time = 0.0;

            let available = math::axis_vector_length(&self.mr.target, &self.mr.position);
            let (braking, decel_result) = {
                let mp = mp!(self);
                let bf = &mp.q.blocks[bf_idx];
                let braking = zoid::get_target_length(0.0, cruise, bf);
                let decel_result = if available + math::EPSILON_LENGTH - braking > 0.0 {
                    None
                } else {
                    Some(zoid::get_decel_velocity(cruise, available, bf))
                };
                (braking, decel_result)
            };

            match decel_result {
                None => {
                    // the deceleration fits in this block
                    self.hold.set(HoldState::DecelToZero);
                    self.mr.blocks[r].exit_velocity = 0.0;
                    self.mr.blocks[r].tail_length = braking;
                    self.mr.blocks[r].tail_time = if cruise > math::EPSILON {
                        braking * 2.0 / cruise
                    } else {
                        0.0
                    };
                }
                Some(Some(exit_velocity)) => {
                    // decelerate through this block and continue in the next
                    self.hold.set(HoldState::DecelContinue);
                    self.mr.blocks[r].exit_velocity = exit_velocity;
                    self.mr.blocks[r].tail_length = available;
                    self.mr.blocks[r].tail_time =
                        available * 2.0 / (exit_velocity + cruise);
                }
                Some(None) => {
                    // rare: deceleration math failed; cruise this block and
                    // push the deceleration into the next one
                    self.mr.section = Section::Body;
                    self.mr.blocks[r].exit_velocity = cruise;
                    self.mr.blocks[r].body_length = available;
                    self.mr.blocks[r].body_time = available / cruise;
                    self.mr.blocks[r].tail_length = 0.0;
                    self.mr.blocks[r].tail_time = 0.0;
                }
            }
            let entry = self.mr.entry_velocity;
            normalize_block(&mut self.mr.blocks[r], entry);
        }
        Ok(ExecOutcome::Again)
    }

    /// Synchronize the step counters and encoders to the current runtime
    /// position. Used at reset, after homing, and on position sets.
    pub fn mp_set_steps_to_runtime_position(&mut self) {
        let mut steps = [0.0; MOTORS];
        self.kin.inverse(&self.mr.position, &mut steps);
        self.mr.target_steps = steps;
        self.mr.position_steps = steps;
        self.mr.commanded_steps = steps;
        self.mr.following_error = [0.0; MOTORS];
        self.enc.set_positions(&steps);
    }

    /// Declare the machine position of one axis. Only meaningful with
    /// motion stopped.
    pub fn set_absolute_position_axis(&mut self, axis: usize, value: f64) {
        self.cm.position[axis] = value;
        self.mp1.position[axis] = value;
        self.mp2.position[axis] = value;
        self.mr.position[axis] = value;
        self.mr.target[axis] = value;
        self.mr.gm.target[axis] = value;
        self.mp_set_steps_to_runtime_position();
    }

    /// Arm an out-of-band dwell. Only honored while the executor is idle;
    /// it is consumed at the next loader cycle.
    pub fn mp_request_out_of_band_dwell(&mut self, seconds: f64) {
        if self.mr.block_state == BlockState::Inactive && !self.st_runtime_isbusy() {
            self.mr.out_of_band_dwell_flag = true;
            self.mr.out_of_band_dwell_seconds = seconds;
        }
    }

    /// Stop everything now: halt the step clock and clear the runtime.
    pub fn mp_halt_runtime(&mut self) {
        self.stepper_reset();
        self.mr.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn normalize_folds_short_head_into_body() {
        let mut b = BlockRuntime {
            head_length: 0.001,
            head_time: MIN_SEGMENT_TIME / 10.0,
            body_length: 10.0,
            body_time: 10.0 / 6000.0,
            tail_length: 1.0,
            tail_time: 1.0 / 3000.0,
            cruise_velocity: 6000.0,
            exit_velocity: 0.0,
        };
        normalize_block(&mut b, 5900.0);
        assert_eq!(b.head_length, 0.0);
        assert_eq!(b.head_time, 0.0);
        assert_approx_eq!(f64, b.body_length, 10.001);
        assert_approx_eq!(f64, b.body_time, 10.001 / 6000.0);
    }

    #[test]
    fn normalize_splits_short_body_between_head_and_tail() {
        let head_time = 10.0 * MIN_SEGMENT_TIME;
        let mut b = BlockRuntime {
            head_length: 2.0,
            head_time,
            body_length: 0.001,
            body_time: MIN_SEGMENT_TIME / 100.0,
            tail_length: 2.0,
            tail_time: head_time,
            cruise_velocity: 6000.0,
            exit_velocity: 0.0,
        };
        normalize_block(&mut b, 0.0);
        assert_eq!(b.body_length, 0.0);
        assert_approx_eq!(f64, b.head_length, 2.0005);
        assert_approx_eq!(f64, b.tail_length, 2.0005);
        assert!(b.head_time > 0.0 && b.tail_time > 0.0);
    }

    #[test]
    fn normalize_keeps_well_formed_blocks() {
        let mut b = BlockRuntime {
            head_length: 5.0,
            head_time: 100.0 * MIN_SEGMENT_TIME,
            body_length: 10.0,
            body_time: 100.0 * MIN_SEGMENT_TIME,
            tail_length: 5.0,
            tail_time: 100.0 * MIN_SEGMENT_TIME,
            cruise_velocity: 6000.0,
            exit_velocity: 0.0,
        };
        let before = b;
        normalize_block(&mut b, 0.0);
        assert_eq!(b.head_length, before.head_length);
        assert_eq!(b.body_length, before.body_length);
        assert_eq!(b.tail_length, before.tail_length);
    }

    #[test]
    fn runtime_reset_preserves_position() {
        let mut mr = Runtime::new();
        mr.position[0] = 42.0;
        mr.block_state = BlockState::Active;
        mr.segment_velocity = 100.0;
        mr.reset();
        assert_eq!(mr.block_state, BlockState::Inactive);
        assert_eq!(mr.segment_velocity, 0.0);
        assert_eq!(mr.position[0], 42.0);
    }
}
