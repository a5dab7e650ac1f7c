//! Planner queue: a fixed ring of move/command blocks linked by index, with
//! background back-planning and just-in-time forward planning.
//!
//! The queue is a list of instructions that execute in exact sequence. Moves
//! are joined to their neighbors so velocity and jerk constraints hold across
//! block boundaries; commands are callbacks that fire at their position in
//! the stream. Back-planning walks from the newest arrival toward the
//! running block tightening exit velocities; forward planning (zoid) shapes
//! one block's ramps right before the runtime needs it.

pub mod exec;
pub mod zoid;

use serde::Serialize;

use crate::canon::{CoolantSelect, GcodeState, SpindleControl};
use crate::machine::{Machine, PlannerSel};
use crate::math::{self, AxisVec};
use crate::status::Status;
use crate::AXES;

pub const PLANNER_QUEUE_SIZE: usize = 48;
pub const SECONDARY_QUEUE_SIZE: usize = 12;
/// Buffers held in reserve before admitting a new input line, so
/// back-planning always has look-ahead depth to work with.
pub const PLANNER_BUFFER_HEADROOM: usize = 4;

pub const MIN_SEGMENT_MS: f64 = 0.75;
pub const NOM_SEGMENT_MS: f64 = MIN_SEGMENT_MS * 2.0;
pub const MIN_BLOCK_MS: f64 = MIN_SEGMENT_MS * 2.0;

// planner times are in minutes
pub const NOM_SEGMENT_TIME: f64 = NOM_SEGMENT_MS / 60_000.0;
pub const NOM_SEGMENT_USEC: f64 = NOM_SEGMENT_MS * 1000.0;
pub const MIN_SEGMENT_TIME: f64 = MIN_SEGMENT_MS / 60_000.0;
pub const MIN_BLOCK_TIME: f64 = MIN_BLOCK_MS / 60_000.0;

/// Milliseconds before deciding no new blocks are arriving, so a nearly
/// empty queue can begin executing anyway.
pub const BLOCK_TIMEOUT_MS: u64 = 30;
/// With this much planned time in the queue there is no starvation risk.
pub const PHAT_CITY_TIME: f64 = 100.0 / 60_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum BufferState {
    #[default]
    Empty,
    Initializing,
    NotPlanned,
    BackPlanned,
    FullyPlanned,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockType {
    #[default]
    Null,
    Aline,
    Command,
    Dwell,
    JsonWait,
    Tool,
    SpindleSpeed,
    Stop,
    End,
}

impl BlockType {
    /// Everything that is not a move runs through the command path.
    pub fn is_command(self) -> bool {
        !matches!(self, BlockType::Null | BlockType::Aline)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockState {
    #[default]
    Inactive,
    InitialAction,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Head,
    Body,
    Tail,
}

pub const SECTIONS: usize = 3;

impl Section {
    pub fn index(self) -> usize {
        match self {
            Section::Head => 0,
            Section::Body => 1,
            Section::Tail => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SectionState {
    #[default]
    Off,
    New,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockHint {
    #[default]
    NoHint,
    CommandBlock,
    PerfectAcceleration,
    PerfectDeceleration,
    PerfectCruise,
    MixedAcceleration,
    MixedDeceleration,
    ZeroVelocity,
    ZeroBump,
    SymmetricBump,
    AsymmetricBump,
}

/// Payload for everything the queue can carry besides a move.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandPayload {
    Spindle(SpindleControl),
    SpindleSpeed(f64),
    Coolant { select: CoolantSelect, on: bool },
    ToolSelect(u8),
    ToolChange,
    Json(String),
    JsonWait(String),
    Stop,
    End,
}

/// One planner queue entry.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub buffer_state: BufferState,
    pub block_type: BlockType,
    pub block_state: BlockState,
    pub hint: BlockHint,

    pub unit: AxisVec,
    pub axis_flags: [bool; AXES],
    /// False once the block is running or its tail has been entered;
    /// guards against retroactive replanning.
    pub plannable: bool,

    pub length: f64,
    pub block_time: f64,
    pub override_factor: f64,

    pub cruise_velocity: f64,
    pub exit_velocity: f64,

    pub cruise_vset: f64,
    pub cruise_vmax: f64,
    pub exit_vmax: f64,
    pub absolute_vmax: f64,
    /// Ceiling on this block's exit velocity imposed by the corner it shares
    /// with the next block.
    pub junction_vmax: f64,

    pub jerk: f64,
    pub jerk_sq: f64,
    pub recip_jerk: f64,
    pub sqrt_j: f64,
    pub q_recip_2_sqrt_j: f64,

    pub command: Option<CommandPayload>,
    pub dwell_seconds: f64,

    pub gm: GcodeState,
}

/// sqrt(10)/3^(1/4): relates ramp length to jerk for the quintic velocity
/// curve whose peak jerk equals the configured limit.
pub const Q_FACTOR: f64 = 2.402811097; // sqrt(10) / 3^(1/4)

impl Block {
    pub fn reset(&mut self) {
        *self = Block::default();
    }

    /// Set the block jerk and cache its derived terms.
    pub fn set_jerk(&mut self, jerk: f64) {
        self.jerk = jerk;
        self.jerk_sq = jerk * jerk;
        self.recip_jerk = 1.0 / jerk;
        self.sqrt_j = jerk.sqrt();
        self.q_recip_2_sqrt_j = Q_FACTOR / (2.0 * self.sqrt_j);
    }
}

/// Ramp shape handed from the forward planner to the executor. Two of these
/// alternate: one executing, one being planned. They swap identity only when
/// the executor picks up a new block.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BlockRuntime {
    pub head_length: f64,
    pub body_length: f64,
    pub tail_length: f64,
    pub head_time: f64,
    pub body_time: f64,
    pub tail_time: f64,
    pub cruise_velocity: f64,
    pub exit_velocity: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlannerState {
    #[default]
    Idle,
    Startup,
    Priming,
    BackPlanning,
}

/// Fixed-capacity ring of blocks. `w` is the next entry to initialize, `r`
/// the running entry (or next to run). Links are indices, never pointers.
#[derive(Debug)]
pub struct PlannerQueue {
    pub blocks: Vec<Block>,
    pub w: usize,
    pub r: usize,
    pub buffers_available: usize,
}

impl PlannerQueue {
    pub fn new(size: usize) -> Self {
        PlannerQueue {
            blocks: vec![Block::default(); size],
            w: 0,
            r: 0,
            buffers_available: size,
        }
    }

    pub fn size(&self) -> usize {
        self.blocks.len()
    }

    pub fn next(&self, i: usize) -> usize {
        (i + 1) % self.blocks.len()
    }

    pub fn prev(&self, i: usize) -> usize {
        (i + self.blocks.len() - 1) % self.blocks.len()
    }

    /// Check out the next write buffer, or None if the ring is full.
    pub fn get_write_buffer(&mut self) -> Option<usize> {
        if self.buffers_available == 0 || self.blocks[self.w].buffer_state != BufferState::Empty {
            return None;
        }
        let idx = self.w;
        self.blocks[idx].reset();
        self.blocks[idx].buffer_state = BufferState::Initializing;
        Some(idx)
    }

    /// Commit an initialized buffer into the stream.
    pub fn commit_write_buffer(&mut self, idx: usize, block_type: BlockType) {
        let block = &mut self.blocks[idx];
        block.block_type = block_type;
        block.buffer_state = BufferState::NotPlanned;
        block.block_state = BlockState::InitialAction;
        block.plannable = true;
        self.buffers_available -= 1;
        self.w = self.next(self.w);
    }

    /// The run buffer, or None when nothing is queued.
    pub fn get_run_buffer(&self) -> Option<usize> {
        if self.blocks[self.r].buffer_state == BufferState::Empty {
            None
        } else {
            Some(self.r)
        }
    }

    /// Release the run buffer and advance. Returns true if the queue is now
    /// empty.
    pub fn free_run_buffer(&mut self) -> bool {
        self.blocks[self.r].reset();
        self.buffers_available += 1;
        self.r = self.next(self.r);
        self.blocks[self.r].buffer_state == BufferState::Empty
    }

    /// Drop everything between the run point and the write point. Used by
    /// queue flush while holding.
    pub fn flush(&mut self) {
        let size = self.size();
        for b in self.blocks.iter_mut() {
            b.reset();
        }
        self.w = 0;
        self.r = 0;
        self.buffers_available = size;
    }
}

/// One planning context. The machine owns two: the primary queue and a small
/// secondary queue used while a feed hold is in effect.
#[derive(Debug)]
pub struct Planner {
    pub q: PlannerQueue,
    /// End position of the most recently queued move (machine coords).
    pub position: AxisVec,
    /// Unit vector of the most recently queued move, for corner computation.
    pub prev_unit: AxisVec,
    pub planner_state: PlannerState,
    pub request_planning: bool,
    pub backplanning: bool,
    /// Set when forward planning had to change an exit velocity, which
    /// invalidates the next block's hint.
    pub entry_changed: bool,
    pub mfo_factor: f64,
    pub traverse_factor: f64,
    pub overrides_enabled: bool,
    pub block_timeout_deadline: Option<u64>,
    pub run_time_remaining: f64,
    pub plannable_time: f64,
}

impl Planner {
    pub fn new(queue_size: usize) -> Self {
        Planner {
            q: PlannerQueue::new(queue_size),
            position: [0.0; AXES],
            prev_unit: [0.0; AXES],
            planner_state: PlannerState::Idle,
            request_planning: false,
            backplanning: false,
            entry_changed: false,
            mfo_factor: 1.0,
            traverse_factor: 1.0,
            overrides_enabled: false,
            block_timeout_deadline: None,
            run_time_remaining: 0.0,
            plannable_time: 0.0,
        }
    }

    pub fn reset(&mut self) {
        self.q.flush();
        self.prev_unit = [0.0; AXES];
        self.planner_state = PlannerState::Idle;
        self.request_planning = false;
        self.backplanning = false;
        self.entry_changed = false;
        self.block_timeout_deadline = None;
        self.run_time_remaining = 0.0;
        self.plannable_time = 0.0;
    }

    pub fn buffers_available(&self) -> usize {
        self.q.buffers_available
    }

    /// True when a new input line may be admitted.
    pub fn has_room(&self) -> bool {
        self.q.buffers_available > PLANNER_BUFFER_HEADROOM
    }

    pub fn has_runnable_buffer(&self) -> bool {
        self.q.blocks[self.q.r].buffer_state != BufferState::Empty
    }

    /// True when the queue holds enough planned time that background work
    /// (reports, power management) can run without risking starvation.
    pub fn is_phat_city_time(&self) -> bool {
        self.planner_state == PlannerState::Idle || self.plannable_time > PHAT_CITY_TIME
    }
}

/// A large but finite stand-in for "no junction limit".
pub const JUNCTION_UNLIMITED: f64 = 8_675_309.0;

/// Corner velocity ceiling between two unit vectors: a centripetal
/// cornering limit derived from the dot product, scaled by the junction
/// integration parameter and the most restrictive participating axis jerk
/// (in pre-multiplier units). Straight continuations are unlimited; full
/// reversals plan to zero.
pub fn junction_velocity(unit_in: &AxisVec, unit_out: &AxisVec, jt: f64, jerk_cfg: f64) -> f64 {
    if unit_in.iter().all(|&u| u == 0.0) {
        return JUNCTION_UNLIMITED; // no previous move
    }
    let costheta = -math::vector_dot(unit_in, unit_out);
    if costheta < -0.999 {
        return JUNCTION_UNLIMITED; // straight continuation
    }
    if costheta > 0.999 {
        return 0.0; // full reversal
    }
    let sin_theta_d2 = (0.5 * (1.0 - costheta)).sqrt();
    let r_jd = sin_theta_d2 / (1.0 - sin_theta_d2);
    (r_jd * jt * jerk_cfg).sqrt()
}

/// Move profile selector for velocity limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveProfile {
    Traverse,
    Feed,
}

impl Machine {
    /// Plan and queue an acceleration-managed line. `gm.target` is the move
    /// target in machine coordinates. Zero-length moves collapse silently.
    pub fn mp_aline(&mut self, gm: &GcodeState, profile: MoveProfile) -> Result<(), Status> {
        if self.planner_sel == PlannerSel::Secondary {
            // only commands may queue while a feed hold is in effect
            return Err(Status::MachineIsBusy);
        }
        let now_ms = self.tb.systick_ms;
        let start = self.planner().position;
        let (length, unit) = math::displacement(&start, &gm.target);
        if length < math::EPSILON_LENGTH {
            return Ok(());
        }

        let mut axis_flags = [false; AXES];
        for (a, flag) in axis_flags.iter_mut().enumerate() {
            *flag = unit[a].abs() > math::EPSILON;
        }

        // project per-axis limits through the unit vector
        let mut traverse_vmax = f64::MAX;
        let mut feed_vmax = f64::MAX;
        let mut jerk = f64::MAX;
        let mut jerk_cfg = f64::MAX;
        for a in 0..AXES {
            if !axis_flags[a] {
                continue;
            }
            let ax = &self.cfg.axes[a];
            let recip = 1.0 / unit[a].abs();
            traverse_vmax = traverse_vmax.min(ax.velocity_max * recip);
            feed_vmax = feed_vmax.min(ax.feedrate_max * recip);
            jerk = jerk.min(self.cfg.jerk(a) * recip);
            jerk_cfg = jerk_cfg.min(ax.jerk_max);
        }

        let mp = self.planner_mut();
        let (mfo, tro, overrides) = (mp.mfo_factor, mp.traverse_factor, mp.overrides_enabled);

        let cruise_vset = match profile {
            MoveProfile::Traverse => {
                let factor = if overrides { tro } else { 1.0 };
                traverse_vmax * factor
            }
            MoveProfile::Feed => {
                let feed = match gm.feed_rate_mode {
                    crate::canon::FeedRateMode::InverseTime => length * gm.feed_rate,
                    crate::canon::FeedRateMode::UnitsPerMinute => gm.feed_rate,
                };
                if feed < math::EPSILON {
                    return Err(Status::FeedRateNotSpecified);
                }
                let factor = if overrides { mfo } else { 1.0 };
                feed * factor
            }
        };

        let absolute_vmax = traverse_vmax;
        let cruise_vmax = cruise_vset
            .min(absolute_vmax)
            .min(if profile == MoveProfile::Feed { feed_vmax } else { f64::MAX });

        let jt = self.cfg.junction_integration_time;
        let mp = self.planner_mut();
        let prev_unit = mp.prev_unit;
        let junction = junction_velocity(&prev_unit, &unit, jt, jerk_cfg);

        let idx = match mp.q.get_write_buffer() {
            Some(i) => i,
            None => return Err(Status::PlannerQueueFull),
        };

        // the corner limit binds the previous block's exit
        let prev_idx = mp.q.prev(idx);
        {
            let prev = &mut mp.q.blocks[prev_idx];
            if prev.block_type == BlockType::Aline
                && prev.plannable
                && prev.buffer_state >= BufferState::NotPlanned
            {
                prev.junction_vmax = prev.junction_vmax.min(junction);
            }
        }

        let block = &mut mp.q.blocks[idx];
        block.unit = unit;
        block.axis_flags = axis_flags;
        block.length = length;
        block.override_factor = if overrides { mfo } else { 1.0 };
        block.cruise_vset = cruise_vset;
        block.cruise_vmax = cruise_vmax;
        block.absolute_vmax = absolute_vmax;
        block.exit_vmax = cruise_vmax;
        block.exit_velocity = 0.0;
        block.junction_vmax = JUNCTION_UNLIMITED;
        block.set_jerk(jerk);
        block.block_time = length / cruise_vmax; // first estimate, refined by zoid
        block.gm = gm.clone();
        mp.q.commit_write_buffer(idx, BlockType::Aline);

        mp.position = gm.target;
        mp.prev_unit = unit;
        mp.request_planning = true;
        if mp.planner_state == PlannerState::Idle {
            mp.planner_state = PlannerState::Startup;
        }
        if mp.planner_state == PlannerState::Startup && mp.block_timeout_deadline.is_none() {
            mp.block_timeout_deadline = Some(now_ms + BLOCK_TIMEOUT_MS);
        }
        Ok(())
    }

    /// Queue a non-motion entry (command, tool, spindle speed, stop/end).
    pub fn mp_queue_command(
        &mut self,
        block_type: BlockType,
        payload: CommandPayload,
        gm: &GcodeState,
    ) -> Result<(), Status> {
        let now_ms = self.tb.systick_ms;
        let mp = self.planner_mut();
        let idx = match mp.q.get_write_buffer() {
            Some(i) => i,
            None => return Err(Status::PlannerQueueFull),
        };
        let block = &mut mp.q.blocks[idx];
        block.command = Some(payload);
        block.hint = BlockHint::CommandBlock;
        block.gm = gm.clone();
        mp.q.commit_write_buffer(idx, block_type);
        mp.request_planning = true;
        if mp.planner_state == PlannerState::Idle {
            mp.planner_state = PlannerState::Startup;
            mp.block_timeout_deadline = Some(now_ms + BLOCK_TIMEOUT_MS);
        }
        Ok(())
    }

    /// Queue a dwell.
    pub fn mp_dwell(&mut self, seconds: f64, gm: &GcodeState) -> Result<(), Status> {
        let now_ms = self.tb.systick_ms;
        let mp = self.planner_mut();
        let idx = match mp.q.get_write_buffer() {
            Some(i) => i,
            None => return Err(Status::PlannerQueueFull),
        };
        let block = &mut mp.q.blocks[idx];
        block.dwell_seconds = seconds.max(0.0);
        block.hint = BlockHint::CommandBlock;
        block.gm = gm.clone();
        mp.q.commit_write_buffer(idx, BlockType::Dwell);
        mp.request_planning = true;
        if mp.planner_state == PlannerState::Idle {
            mp.planner_state = PlannerState::Startup;
            mp.block_timeout_deadline = Some(now_ms + BLOCK_TIMEOUT_MS);
        }
        Ok(())
    }

    /// Background back-planning pass, called repeatedly from the main loop.
    /// Walks from the newest arrival backward toward the running block,
    /// tightening exit velocities so every boundary is reachable by
    /// deceleration and obeys its junction limit.
    pub fn mp_planner_callback(&mut self) {
        let systick = self.tb.systick_ms;
        let mr_idle = self.mr.block_state == BlockState::Inactive;
        let mp = self.planner_mut();

        if !mp.has_runnable_buffer() {
            if mp.planner_state != PlannerState::Idle && mr_idle {
                mp.planner_state = PlannerState::Idle;
                mp.block_timeout_deadline = None;
            }
            return;
        }
        if !mp.request_planning && mp.planner_state != PlannerState::Startup {
            return;
        }

        mp.backplanning = true;
        mp.plan_block_list();
        mp.backplanning = false;
        mp.request_planning = false;

        // startup gating: hold moves back until there is enough time in the
        // queue to plan well, or no new blocks are arriving
        if mp.planner_state == PlannerState::Startup {
            let timeout_hit = mp
                .block_timeout_deadline
                .map_or(false, |deadline| systick >= deadline);
            if mp.plannable_time > PHAT_CITY_TIME || timeout_hit || !mp.has_room() {
                mp.planner_state = PlannerState::Priming;
                mp.block_timeout_deadline = None;
                self.tb.request_forward_plan();
            }
        } else {
            self.tb.request_forward_plan();
        }
    }
}

impl Planner {
    /// One full backward pass. See module docs for the invariants.
    pub fn plan_block_list(&mut self) {
        let newest = self.q.prev(self.q.w);
        if self.q.blocks[newest].buffer_state == BufferState::Empty {
            return;
        }

        // gather indices newest -> oldest, stopping at the running block
        let mut chain: Vec<usize> = Vec::with_capacity(self.q.size());
        let mut i = newest;
        loop {
            let b = &self.q.blocks[i];
            if b.buffer_state == BufferState::Empty || b.buffer_state >= BufferState::Running {
                break;
            }
            chain.push(i);
            if i == self.q.r {
                break;
            }
            i = self.q.prev(i);
        }

        let mut plannable_time = 0.0;
        // the newest block must always be able to stop
        let mut braking_velocity = 0.0;

        for &idx in &chain {
            let block = &mut self.q.blocks[idx];
            if !block.plannable || block.buffer_state >= BufferState::FullyPlanned {
                // locked in; carry its planned values through
                if block.block_type == BlockType::Aline {
                    braking_velocity = zoid::max_entry_velocity(block, block.exit_velocity);
                }
                plannable_time += block.block_time;
                continue;
            }
            if block.block_type != BlockType::Aline {
                // commands execute at quiescence: the move ahead of one
                // must be able to brake to zero
                block.buffer_state = BufferState::BackPlanned;
                braking_velocity = 0.0;
                continue;
            }

            let new_exit = block
                .exit_vmax
                .min(block.junction_vmax)
                .min(braking_velocity);
            let unchanged = math::velocity_eq(new_exit, block.exit_velocity)
                && block.buffer_state >= BufferState::BackPlanned;
            block.exit_velocity = new_exit;
            block.buffer_state = BufferState::BackPlanned;
            plannable_time += block.block_time;

            if unchanged {
                // earlier blocks are already optimal; just finish accounting
                braking_velocity = zoid::max_entry_velocity(block, block.exit_velocity);
                let mut j = self.q.prev(idx);
                while self.q.blocks[j].buffer_state != BufferState::Empty {
                    plannable_time += self.q.blocks[j].block_time;
                    if j == self.q.r {
                        break;
                    }
                    j = self.q.prev(j);
                }
                break;
            }
            braking_velocity = zoid::max_entry_velocity(block, block.exit_velocity);
        }

        self.plannable_time = plannable_time;
        self.run_time_remaining = plannable_time;
    }
}

impl Machine {
    pub fn planner_mut(&mut self) -> &mut Planner {
        match self.planner_sel {
            PlannerSel::Primary => &mut self.mp1,
            PlannerSel::Secondary => &mut self.mp2,
        }
    }

    pub fn planner(&self) -> &Planner {
        match self.planner_sel {
            PlannerSel::Primary => &self.mp1,
            PlannerSel::Secondary => &self.mp2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_indices_wrap() {
        let q = PlannerQueue::new(4);
        assert_eq!(q.next(3), 0);
        assert_eq!(q.prev(0), 3);
    }

    #[test]
    fn write_commit_run_free_cycle() {
        let mut q = PlannerQueue::new(4);
        assert!(q.get_run_buffer().is_none());
        let idx = q.get_write_buffer().unwrap();
        q.commit_write_buffer(idx, BlockType::Aline);
        assert_eq!(q.buffers_available, 3);
        assert_eq!(q.get_run_buffer(), Some(idx));
        let empty = q.free_run_buffer();
        assert!(empty);
        assert_eq!(q.buffers_available, 4);
    }

    #[test]
    fn full_ring_refuses_writes() {
        let mut q = PlannerQueue::new(2);
        for _ in 0..2 {
            let idx = q.get_write_buffer().unwrap();
            q.commit_write_buffer(idx, BlockType::Aline);
        }
        assert!(q.get_write_buffer().is_none());
    }

    #[test]
    fn buffer_states_are_ordered() {
        assert!(BufferState::Empty < BufferState::NotPlanned);
        assert!(BufferState::NotPlanned < BufferState::BackPlanned);
        assert!(BufferState::BackPlanned < BufferState::FullyPlanned);
        assert!(BufferState::FullyPlanned < BufferState::Running);
    }

    #[test]
    fn junction_straight_is_unlimited() {
        let mut u = [0.0; AXES];
        u[0] = 1.0;
        let v = junction_velocity(&u, &u, 0.75, 5000.0);
        assert_eq!(v, JUNCTION_UNLIMITED);
    }

    #[test]
    fn junction_reversal_is_zero() {
        let mut u = [0.0; AXES];
        u[0] = 1.0;
        let mut rev = [0.0; AXES];
        rev[0] = -1.0;
        assert_eq!(junction_velocity(&u, &rev, 0.75, 5000.0), 0.0);
    }

    #[test]
    fn junction_right_angle_is_slow() {
        let mut u = [0.0; AXES];
        u[0] = 1.0;
        let mut v = [0.0; AXES];
        v[1] = 1.0;
        let vj = junction_velocity(&u, &v, 0.75, 5000.0);
        assert!(vj > 0.0);
        // a sharp corner plans far below any practical feed rate
        assert!(vj < 200.0, "corner velocity {} too permissive", vj);
    }

    #[test]
    fn junction_shallow_faster_than_sharp() {
        let mut u = [0.0; AXES];
        u[0] = 1.0;
        let mut sharp = [0.0; AXES];
        sharp[1] = 1.0;
        let mut shallow = [0.0; AXES];
        let theta: f64 = 0.05; // ~3 degrees
        shallow[0] = theta.cos();
        shallow[1] = theta.sin();
        let v_sharp = junction_velocity(&u, &sharp, 0.75, 5000.0);
        let v_shallow = junction_velocity(&u, &shallow, 0.75, 5000.0);
        assert!(v_shallow > v_sharp * 5.0);
    }
}
