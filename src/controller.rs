//! Cooperative controller loop: line assembly from the byte source, command
//! dispatch, background planning, cycle sequencing (holds, probing, homing),
//! power management, reports and the indicator LED. Single threaded; the
//! interrupt work preempts it via `Machine::run_ticks`.

use std::collections::VecDeque;
use std::io::Write;

use bitflags::bitflags;
use log::{debug, info};

use crate::canon::{CycleType, HoldState, MachineState, MotionState, ProbePending};
use crate::machine::{Machine, PlannerSel};
use crate::report::SrRequest;
use crate::status::Status;
use crate::timebase::DDA_TICKS_PER_SYSTICK;

pub const LED_NORMAL_BLINK_RATE: u64 = 3000; // ms
pub const LED_ALARM_BLINK_RATE: u64 = 750;
pub const LED_SHUTDOWN_BLINK_RATE: u64 = 300;
pub const LED_PANIC_BLINK_RATE: u64 = 100;

/// Flow-control characters are reserved on the wire.
pub const CHAR_XON: u8 = 0x11;
pub const CHAR_XOFF: u8 = 0x13;

pub const CHAR_FEEDHOLD: u8 = b'!';
pub const CHAR_CYCLE_START: u8 = b'~';
pub const CHAR_QUEUE_FLUSH: u8 = b'%';
pub const CHAR_RESET: u8 = 0x18; // Ctrl-X

/// Longest accepted input line.
pub const RX_LINE_LEN: usize = 254;

/// Serial open/close at this rate is the bootloader-reset hook.
pub const RESET_BAUD_RATE: u32 = 1200;

bitflags! {
    /// Serial line-state bits; both must be up to count as connected.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LineState: u8 {
        const DTR = 0b01;
        const RTS = 0b10;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Initializing,
    NotConnected,
    Connected,
    Startup,
    Ready,
    Paused,
}

/// Extra travel past the soft limit when searching for a home switch, mm.
const HOMING_OVERSHOOT: f64 = 10.0;

pub struct Controller {
    pub machine: Machine,
    pub state: ControllerState,
    line_state: LineState,
    input: VecDeque<u8>,
    line_buf: String,
    line_overflow: bool,
    out: Box<dyn Write + Send>,
    led_on: bool,
    led_toggled_ms: u64,
}

impl Controller {
    pub fn new(machine: Machine, out: Box<dyn Write + Send>) -> Self {
        Controller {
            machine,
            state: ControllerState::NotConnected,
            line_state: LineState::empty(),
            input: VecDeque::new(),
            line_buf: String::new(),
            line_overflow: false,
            out,
            led_on: false,
            led_toggled_ms: 0,
        }
    }

    /// Update the serial line-state bits. Both DTR and RTS up means a host
    /// is attached.
    pub fn set_line_state(&mut self, dtr: bool, rts: bool) {
        self.line_state
            .set(LineState::DTR, dtr);
        self.line_state.set(LineState::RTS, rts);
        if self.line_state == LineState::DTR | LineState::RTS {
            if self.state == ControllerState::NotConnected {
                info!("host connected");
                self.state = ControllerState::Ready;
            }
        } else if self.state != ControllerState::NotConnected {
            info!("host disconnected");
            self.state = ControllerState::NotConnected;
        }
    }

    /// A 1200 baud open/close cycle is a reset signal from the host.
    pub fn baud_touch(&mut self, baud: u32) {
        if baud == RESET_BAUD_RATE {
            info!("1200 baud touch; reset requested");
            self.machine.cm.reset_requested = true;
        }
    }

    /// Feed raw bytes from the transport.
    pub fn provide_input(&mut self, text: &str) {
        self.input.extend(text.bytes());
    }

    pub fn has_pending_input(&self) -> bool {
        !self.input.is_empty() || !self.line_buf.is_empty()
    }

    /// One pass of the cooperative task ladder, in priority order. Each
    /// task may do nothing; the interrupt layer preempts all of it.
    pub fn run_task(&mut self) {
        self.process_realtime_requests();
        self.read_input();
        self.machine.mp_planner_callback();
        let _ = self.machine.cm_arc_callback();
        self.cycle_callback();
        self.machine.st_motor_power_callback();
        self.machine.sr_callback();
        self.update_led();
        self.flush_outgoing();
    }

    /// Run for `ms` of machine time, interleaving the main loop between
    /// interrupt batches.
    pub fn run_for_ms(&mut self, ms: u64) {
        for _ in 0..ms {
            self.run_task();
            self.machine.run_ticks(DDA_TICKS_PER_SYSTICK as u64);
        }
    }

    /// Run until a requested feed hold has fully stopped motion. Returns
    /// true when the hold point was reached.
    pub fn run_until_hold(&mut self, max_ms: u64) -> bool {
        for _ in 0..max_ms {
            self.run_task();
            if self.machine.hold.get() == HoldState::MotionStopped
                && !self.machine.st_runtime_isbusy()
            {
                return true;
            }
            self.machine.run_ticks(DDA_TICKS_PER_SYSTICK as u64);
        }
        false
    }

    /// Run until the machine drains or the time limit passes. Returns true
    /// when idle was reached.
    pub fn run_until_idle(&mut self, max_ms: u64) -> bool {
        for _ in 0..max_ms {
            self.run_task();
            if self.machine.is_idle()
                && !self.has_pending_input()
                && !self.machine.arc_active()
                && self.machine.hold.get() == HoldState::Off
            {
                self.run_task(); // let reports drain
                return true;
            }
            self.machine.run_ticks(DDA_TICKS_PER_SYSTICK as u64);
        }
        false
    }

    /// Pull one complete line from the byte source into the parser, if the
    /// planner can accept it. Control characters act immediately, even
    /// mid-line.
    fn read_input(&mut self) {
        // Realtime characters act immediately wherever they sit in the
        // stream; they must never wait behind planner back-pressure. '%' is
        // also a comment leader, so it only flushes while holding.
        let mut feedhold = false;
        let mut cycle_start = false;
        let mut reset = false;
        let mut flush = false;
        let holding = self.machine.hold.get() != HoldState::Off;
        self.input.retain(|&b| match b {
            CHAR_FEEDHOLD => {
                feedhold = true;
                false
            }
            CHAR_CYCLE_START => {
                cycle_start = true;
                false
            }
            CHAR_RESET => {
                reset = true;
                false
            }
            CHAR_QUEUE_FLUSH if holding => {
                flush = true;
                false
            }
            CHAR_XON | CHAR_XOFF => false, // reserved for flow control
            _ => true,
        });
        if feedhold {
            self.machine.cm_request_feedhold();
        }
        if cycle_start {
            self.machine.cm_request_cycle_start();
        }
        if flush {
            self.machine.cm_request_queue_flush();
        }
        if reset {
            self.machine.cm.reset_requested = true;
            return;
        }

        // admission: hold back while look-ahead depth is thin, an arc is
        // still spooling, or a hold is still decelerating. With motion fully
        // stopped, commands are admitted into the secondary queue.
        let hold = self.machine.hold.get();
        if !self.machine.planner().has_room()
            || self.machine.arc_active()
            || (hold != HoldState::Off && hold != HoldState::MotionStopped)
        {
            return;
        }

        while let Some(byte) = self.input.pop_front() {
            if byte == b'\n' || byte == b'\r' {
                let line = std::mem::take(&mut self.line_buf);
                let overflowed = std::mem::take(&mut self.line_overflow);
                if overflowed {
                    self.machine
                        .report_exception(Status::InvalidOrMalformedCommand, "line too long");
                } else if !line.trim().is_empty() {
                    self.dispatch_line(&line);
                }
                return; // one line per pass
            }
            if self.line_buf.len() >= RX_LINE_LEN {
                self.line_overflow = true;
            } else {
                self.line_buf.push(byte as char);
            }
        }
    }

    fn dispatch_line(&mut self, line: &str) {
        debug!("gcode: {}", line.trim());
        match crate::gcode::parser::gcode_parser(&mut self.machine, line) {
            Ok(_) => {}
            Err(status) => {
                self.machine.report_exception(status, line.trim());
            }
        }
    }

    /// Handle the realtime request flags raised by control characters.
    fn process_realtime_requests(&mut self) {
        let machine = &mut self.machine;

        if machine.cm.reset_requested {
            machine.cm.reset_requested = false;
            info!("reset");
            machine.mp_halt_runtime();
            machine.mp1.reset();
            machine.mp2.reset();
            machine.planner_sel = PlannerSel::Primary;
            machine.hold.set(HoldState::Off);
            machine.cm.arc = None;
            machine.cm.probe_pending = None;
            machine.cm.homing = Default::default();
            machine.cm.cycle_type = CycleType::None;
            machine.cm.motion_state = MotionState::Stop;
            machine.cm.machine_state = MachineState::Ready;
            machine.cm.alarm_status = None;
            machine.cm.cycle_start_requested = false;
            machine.cm.queue_flush_requested = false;
            // planner and model positions collapse to wherever we stopped
            let position = machine.mr.position;
            machine.mp1.position = position;
            machine.mp2.position = position;
            machine.cm.position = position;
            self.line_buf.clear();
            self.input.clear();
            return;
        }

        if machine.cm.queue_flush_requested {
            machine.cm.queue_flush_requested = false;
            if machine.hold.get() == HoldState::MotionStopped {
                info!("queue flush");
                machine.mp1.reset();
                machine.mp2.reset();
                machine.cm.arc = None;
                let position = machine.mr.position;
                machine.mp1.position = position;
                machine.mp2.position = position;
                machine.cm.position = position;
            }
        }

        if machine.cm.cycle_start_requested {
            match machine.hold.get() {
                HoldState::MotionStopped => {
                    // drain any hold-time commands queued to the secondary
                    // planner before releasing the hold
                    if machine.planner_sel == PlannerSel::Secondary
                        && machine.mp2.has_runnable_buffer()
                    {
                        machine.tb.request_forward_plan();
                        machine.tb.request_exec();
                        return; // retry next pass
                    }
                    machine.cm.cycle_start_requested = false;
                    self.exit_feedhold();
                }
                HoldState::Off => {
                    machine.cm.cycle_start_requested = false;
                    if matches!(
                        machine.cm.machine_state,
                        MachineState::ProgramStop | MachineState::ProgramEnd
                    ) {
                        machine.cm.machine_state = MachineState::Cycle;
                        machine.tb.request_forward_plan();
                        machine.tb.request_exec();
                    }
                }
                _ => {} // still decelerating; keep the request pending
            }
        }
    }

    /// Release a completed feed hold: back to the primary planner, replan
    /// the remainder, restart the interrupt chain. A configured resume
    /// dwell (spindle settle) runs out-of-band before motion restarts.
    fn exit_feedhold(&mut self) {
        let machine = &mut self.machine;
        info!("cycle start: resuming from hold");
        machine.planner_sel = PlannerSel::Primary;
        machine.hold.set(HoldState::Off);
        machine.cm.motion_state = MotionState::Stop;
        let settle = machine.cfg.resume_dwell;
        if settle > 0.0 {
            machine.mp_request_out_of_band_dwell(settle);
        }
        machine.mp1.request_planning = true;
        machine.tb.request_forward_plan();
        machine.tb.request_exec();
    }

    /// Sequencing for multi-move cycles: hold progress, probe completion,
    /// homing advance, and cycle end.
    fn cycle_callback(&mut self) {
        let machine = &mut self.machine;

        // keep the hold state machine moving while the DDA idles
        match machine.hold.get() {
            HoldState::Off | HoldState::MotionStopped => {}
            _ => machine.tb.request_exec(),
        }

        // nudge the executor while hold-time commands sit in the secondary
        if machine.planner_sel == PlannerSel::Secondary && machine.mp2.has_runnable_buffer() {
            machine.tb.request_forward_plan();
        }

        self.probe_callback();
        self.homing_callback();

        // fall-back cycle end when everything has drained
        let machine = &mut self.machine;
        if machine.cm.machine_state == MachineState::Cycle
            && machine.cm.cycle_type == CycleType::Machining
            && machine.hold.get() == HoldState::Off
            && machine.is_idle()
            && !machine.arc_active()
        {
            machine.cm_cycle_end();
            machine.sr_request(SrRequest::Immediate);
        }
    }

    /// Finish probe cycles: publish the contact point after the stop, or
    /// flag the miss when the move ran dry.
    fn probe_callback(&mut self) {
        let machine = &mut self.machine;
        let Some(pending) = machine.cm.probe_pending else {
            return;
        };

        if pending.triggered && machine.hold.get() == HoldState::MotionStopped {
            machine.cm.probe_pending = None;
            machine.planner_sel = PlannerSel::Primary;
            machine.hold.set(HoldState::Off);
            machine.cm.motion_state = MotionState::Stop;
            // the rest of the probe move was discarded; the model position
            // rewinds to wherever the machine actually stopped
            machine.cm.position = machine.mr.position;
            if let Some(axis) = pending.homing_axis {
                self.finish_homing_axis(axis);
            } else {
                machine.report_probe_result();
                machine.cm_cycle_end();
                machine.sr_request(SrRequest::Immediate);
            }
            return;
        }

        if !pending.triggered
            && machine.hold.get() == HoldState::Off
            && machine.is_idle_except_probe()
        {
            // the move completed without seeing the edge
            machine.cm.probe_pending = None;
            if let Some(axis) = pending.homing_axis {
                machine.cm.homing = Default::default();
                machine.cm_alarm(Status::HomingCycleFailed, &format!("axis {}", axis));
                return;
            }
            machine.cm.probe_result = Some(crate::canon::ProbeResult {
                triggered: false,
                position: machine.mr.position,
            });
            if pending.alarm_on_fail {
                machine.cm_alarm(Status::ProbeCycleFailed, "no contact");
            } else {
                machine.report_probe_result();
            }
            machine.cm_cycle_end();
        }
    }

    /// Start the next homing search, or close the cycle out.
    fn homing_callback(&mut self) {
        let machine = &mut self.machine;
        if !machine.cm.homing.active
            || machine.cm.probe_pending.is_some()
            || machine.hold.get() != HoldState::Off
        {
            return;
        }
        if !machine.is_idle_except_probe() {
            return;
        }
        if machine.cm.homing.axes.is_empty() {
            machine.cm.homing.active = false;
            info!("homing complete");
            machine.cm_cycle_end();
            machine.sr_request(SrRequest::Immediate);
            return;
        }
        let axis = machine.cm.homing.axes.remove(0);
        let search_velocity = machine.cfg.axes[axis].search_velocity;
        let travel_min = machine.cfg.axes[axis].travel_min;
        let mut point = machine.cm.position;
        point[axis] = travel_min - HOMING_OVERSHOOT;
        machine.cm.probe_pending = Some(ProbePending {
            toward: true,
            alarm_on_fail: true,
            triggered: false,
            homing_axis: Some(axis),
        });
        machine.cm.probe_result = None;
        if let Err(status) = machine.cm_feed_to_machine_point(point, search_velocity) {
            machine.cm.probe_pending = None;
            machine.cm.homing = Default::default();
            machine.cm_alarm(status, "homing move rejected");
        }
    }

    /// On switch contact, declare the axis position and continue.
    fn finish_homing_axis(&mut self, axis: usize) {
        let machine = &mut self.machine;
        let home_position = machine.cfg.axes[axis].travel_min;
        if machine.cm.homing.set_coordinates {
            machine.set_absolute_position_axis(axis, home_position);
        }
        debug!("homed axis {}", axis);
        // the next pass of homing_callback starts the next axis
    }

    /// Blink the indicator at the rate of the current machine state.
    fn update_led(&mut self) {
        let machine = &mut self.machine;
        let rate = match machine.cm.machine_state {
            MachineState::Alarm => LED_ALARM_BLINK_RATE,
            MachineState::Shutdown => LED_SHUTDOWN_BLINK_RATE,
            MachineState::Panic => LED_PANIC_BLINK_RATE,
            _ => LED_NORMAL_BLINK_RATE,
        };
        let now = machine.tb.systick_ms;
        if now.saturating_sub(self.led_toggled_ms) >= rate / 2 {
            self.led_toggled_ms = now;
            self.led_on = !self.led_on;
            let on = self.led_on;
            machine.hw.set_led(on);
        }
    }

    fn flush_outgoing(&mut self) {
        while let Some(line) = self.machine.outgoing.pop_front() {
            let _ = writeln!(self.out, "{}", line);
        }
        let _ = self.out.flush();
    }
}

impl Machine {
    /// Idle check that ignores the probe-pending flag, for cycle
    /// sequencing that is itself managing the probe.
    pub fn is_idle_except_probe(&self) -> bool {
        !self.mp1.has_runnable_buffer()
            && !self.mp2.has_runnable_buffer()
            && self.mr.block_state == crate::planner::BlockState::Inactive
            && !self.st_runtime_isbusy()
            && !self.tb.dda_timer_running
    }
}
