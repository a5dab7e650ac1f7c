//! The owning machine context. Every subsystem lives here as a plain field
//! and the cross-subsystem flows are methods on [`Machine`], so ownership is
//! explicit and the interrupt handlers operate on one stable context.

use std::collections::VecDeque;

use crate::canon::{CanonicalMachine, CoolantSelect, HoldStateCell, MachineState, SpindleControl};
use crate::config::MachineConfig;
use crate::encoder::Encoders;
use crate::gcode::GcodeParser;
use crate::hardware::{Hardware, SimHardware};
use crate::kinematics::{CartesianKinematics, Kinematics};
use crate::planner::exec::Runtime;
use crate::planner::{Planner, PLANNER_QUEUE_SIZE, SECONDARY_QUEUE_SIZE};
use crate::report::SrState;
use crate::settings::{
    MemoryStore, SettingsStore, NVM_COORD_BASE, NVM_G28_POSITION, NVM_G30_POSITION,
    NVM_G92_OFFSET,
};
use crate::status::ExecOutcome;
use crate::stepper::{PrepOwner, PrepSlot, StepperRun};
use crate::timebase::{Timebase, DDA_TICKS_PER_SYSTICK};

/// Which planning context is live: the primary queue, or the small
/// secondary queue used while a feed hold is in effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannerSel {
    Primary,
    Secondary,
}

/// Peripheral command sinks fired in sequence with motion. A small fixed
/// surface instead of arbitrary callbacks keeps the interrupt paths free of
/// allocation.
pub trait Peripherals: Send {
    fn spindle(&mut self, _control: SpindleControl) {}
    fn spindle_speed(&mut self, _rpm: f64) {}
    fn spindle_override(&mut self, _factor: f64) {}
    fn coolant(&mut self, _select: CoolantSelect, _on: bool) {}
    fn tool_change(&mut self, _tool: u8) {}
    fn message(&mut self, _text: &str) {}
    /// Simulator/test access to the recording implementation.
    fn as_recording(&self) -> Option<&RecordingPeripherals> {
        None
    }
}

pub struct NullPeripherals;

impl Peripherals for NullPeripherals {}

/// Records every peripheral event; used by the simulator and tests.
#[derive(Debug, Default)]
pub struct RecordingPeripherals {
    pub events: Vec<String>,
}

impl Peripherals for RecordingPeripherals {
    fn spindle(&mut self, control: SpindleControl) {
        self.events.push(format!("spindle {:?}", control));
    }

    fn spindle_speed(&mut self, rpm: f64) {
        self.events.push(format!("spindle-speed {}", rpm));
    }

    fn spindle_override(&mut self, factor: f64) {
        self.events.push(format!("spindle-override {}", factor));
    }

    fn coolant(&mut self, select: CoolantSelect, on: bool) {
        self.events.push(format!("coolant {:?} {}", select, on));
    }

    fn tool_change(&mut self, tool: u8) {
        self.events.push(format!("tool-change {}", tool));
    }

    fn message(&mut self, text: &str) {
        self.events.push(format!("msg {}", text));
    }

    fn as_recording(&self) -> Option<&RecordingPeripherals> {
        Some(self)
    }
}

pub struct Machine {
    pub cfg: MachineConfig,
    pub parser: GcodeParser,
    pub cm: CanonicalMachine,
    pub hold: HoldStateCell,

    pub mp1: Planner,
    pub mp2: Planner,
    pub planner_sel: PlannerSel,
    pub mr: Runtime,

    pub st_pre: PrepSlot,
    pub st_run: StepperRun,
    pub enc: Encoders,

    pub kin: Box<dyn Kinematics>,
    pub hw: Box<dyn Hardware>,
    pub peripherals: Box<dyn Peripherals>,
    pub settings: Box<dyn SettingsStore>,

    pub tb: Timebase,

    /// Outbound report lines, drained by the controller.
    pub outgoing: VecDeque<String>,
    pub sr: SrState,

    pub(crate) last_motion_ms: u64,
    pub(crate) motors_energized: bool,
}

impl Machine {
    pub fn new(
        cfg: MachineConfig,
        kin: Box<dyn Kinematics>,
        hw: Box<dyn Hardware>,
        peripherals: Box<dyn Peripherals>,
        settings: Box<dyn SettingsStore>,
    ) -> Self {
        let mut machine = Machine {
            cfg,
            parser: GcodeParser::new(),
            cm: CanonicalMachine::new(),
            hold: HoldStateCell::default(),
            mp1: Planner::new(PLANNER_QUEUE_SIZE),
            mp2: Planner::new(SECONDARY_QUEUE_SIZE),
            planner_sel: PlannerSel::Primary,
            mr: Runtime::new(),
            st_pre: PrepSlot::default(),
            st_run: StepperRun::default(),
            enc: Encoders::new(),
            kin,
            hw,
            peripherals,
            settings,
            tb: Timebase::new(),
            outgoing: VecDeque::new(),
            sr: SrState::default(),
            last_motion_ms: 0,
            motors_energized: false,
        };
        machine.stepper_reset();
        machine.load_persistent();
        machine.cm.machine_state = MachineState::Ready;
        machine
    }

    /// A machine wired to simulated hardware with the default configuration.
    pub fn sim() -> Self {
        Self::sim_with_config(MachineConfig::default())
    }

    pub fn sim_with_config(cfg: MachineConfig) -> Self {
        let kin = Box::new(CartesianKinematics::from_config(&cfg));
        Machine::new(
            cfg,
            kin,
            Box::new(SimHardware::new()),
            Box::new(RecordingPeripherals::default()),
            Box::new(MemoryStore::new()),
        )
    }

    /// Restore work offsets, stored positions and the G92 offset from the
    /// persistent store.
    fn load_persistent(&mut self) {
        for cs in 0..crate::canon::COORDS {
            if let Some(ofs) = self.settings.load(NVM_COORD_BASE + cs as u32) {
                self.cm.coord_offsets[cs] = ofs;
            }
        }
        if let Some(pos) = self.settings.load(NVM_G28_POSITION) {
            self.cm.g28_position = pos;
        }
        if let Some(pos) = self.settings.load(NVM_G30_POSITION) {
            self.cm.g30_position = pos;
        }
        if let Some(ofs) = self.settings.load(NVM_G92_OFFSET) {
            self.cm.g92_offset = ofs;
        }
    }

    /// Advance the clock by `n` DDA ticks, running the step interrupt, the
    /// derived system tick and the software interrupts in priority order.
    /// With fixed inputs this is fully deterministic.
    pub fn run_ticks(&mut self, n: u64) {
        for _ in 0..n {
            if self.tb.dda_timer_running {
                self.st_dda_tick();
            }
            self.tb.dda_ticks += 1;
            self.tb.systick_accum += 1;
            if self.tb.systick_accum >= DDA_TICKS_PER_SYSTICK {
                self.tb.systick_accum = 0;
                self.tb.systick_ms += 1;
                self.st_systick();
            }
            self.service_interrupts();
        }
    }

    /// Advance by whole milliseconds.
    pub fn run_ms(&mut self, ms: u64) {
        self.run_ticks(ms * DDA_TICKS_PER_SYSTICK as u64);
    }

    /// Drain the EXEC and FWD_PLAN software interrupts, highest priority
    /// first. Each handler may re-request the other; the drain is bounded
    /// because a prepared segment parks in the loader until the DDA frees.
    pub fn service_interrupts(&mut self) {
        for _ in 0..8 {
            let mut serviced = false;
            if self.tb.take_exec() {
                serviced = true;
                if self.st_pre.owner.get() == PrepOwner::Exec {
                    match self.mp_exec_move() {
                        Ok(ExecOutcome::Noop) | Err(_) => {}
                        Ok(_) => {
                            self.st_pre.owner.set(PrepOwner::Loader);
                            self.st_request_load_move();
                        }
                    }
                }
            }
            if self.tb.take_forward_plan() {
                serviced = true;
                if self.mp_forward_plan() != ExecOutcome::Noop {
                    self.tb.request_exec();
                }
            }
            if !serviced {
                break;
            }
        }
    }

    /// True when nothing is queued, running, or counting down.
    pub fn is_idle(&self) -> bool {
        !self.mp1.has_runnable_buffer()
            && !self.mp2.has_runnable_buffer()
            && self.mr.block_state == crate::planner::BlockState::Inactive
            && !self.st_runtime_isbusy()
            && !self.tb.dda_timer_running
            && self.st_pre.owner.get() == PrepOwner::Exec
            && self.cm.probe_pending.is_none()
            && !self.cm.homing.active
    }

    /// Simulated hardware accessor; panics when wired to real hardware.
    pub fn sim_hw(&self) -> &SimHardware {
        self.hw
            .as_any()
            .downcast_ref::<SimHardware>()
            .expect("machine is not using simulated hardware")
    }

    pub fn sim_hw_mut(&mut self) -> &mut SimHardware {
        self.hw
            .as_any_mut()
            .downcast_mut::<SimHardware>()
            .expect("machine is not using simulated hardware")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_machine_starts_ready_and_idle() {
        let machine = Machine::sim();
        assert_eq!(machine.cm.machine_state, MachineState::Ready);
        assert!(machine.is_idle());
    }

    #[test]
    fn persistent_offsets_restore_on_boot() {
        let mut store = MemoryStore::new();
        let mut ofs = [0.0; crate::AXES];
        ofs[0] = 12.5;
        store.save(NVM_COORD_BASE + 1, &ofs); // G55
        let cfg = MachineConfig::default();
        let kin = Box::new(CartesianKinematics::from_config(&cfg));
        let machine = Machine::new(
            cfg,
            kin,
            Box::new(SimHardware::new()),
            Box::new(NullPeripherals),
            Box::new(store),
        );
        assert_eq!(machine.cm.coord_offsets[1][0], 12.5);
    }

    #[test]
    fn clock_derives_system_tick() {
        let mut machine = Machine::sim();
        machine.run_ticks(200 * 5);
        assert_eq!(machine.tb.systick_ms, 5);
        machine.run_ms(3);
        assert_eq!(machine.tb.systick_ms, 8);
    }
}
