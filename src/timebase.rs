//! Timebase and software-interrupt controller. Three logical clocks: the
//! DDA tick (step rate), the system tick (1 kHz, derived from the DDA
//! count), and two software-triggered events (EXEC, FWD_PLAN) drained in
//! strict priority order after each tick. The pending flags are atomics so
//! the same structure holds if the priority classes move onto threads.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::stepper::{FREQUENCY_DDA, FREQUENCY_DWELL};

pub const DDA_TICKS_PER_SYSTICK: u32 = (FREQUENCY_DDA / FREQUENCY_DWELL) as u32;

#[derive(Debug, Default)]
pub struct Timebase {
    /// Total DDA ticks elapsed since boot.
    pub dda_ticks: u64,
    /// Milliseconds elapsed since boot (system tick).
    pub systick_ms: u64,
    pub(crate) systick_accum: u32,
    /// True while the DDA timer is running a segment.
    pub dda_timer_running: bool,

    exec_pending: AtomicBool,
    fwd_plan_pending: AtomicBool,
}

impl Timebase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the executor software interrupt.
    pub fn request_exec(&self) {
        self.exec_pending.store(true, Ordering::Release);
    }

    /// Request the forward-planner software interrupt.
    pub fn request_forward_plan(&self) {
        self.fwd_plan_pending.store(true, Ordering::Release);
    }

    pub fn take_exec(&self) -> bool {
        self.exec_pending.swap(false, Ordering::AcqRel)
    }

    pub fn take_forward_plan(&self) -> bool {
        self.fwd_plan_pending.swap(false, Ordering::AcqRel)
    }

    pub fn exec_pending(&self) -> bool {
        self.exec_pending.load(Ordering::Acquire)
    }
}
