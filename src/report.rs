//! Status and exception reporting over the JSON surface, plus the loose
//! JSON reader used for active comments ({msg:"..."} style input with bare
//! keys and t/f shorthand).

use serde_json::{json, Map, Value};

use crate::canon::{CycleType, HoldState, MachineState, Units};
use crate::config::AXIS_NAMES;
use crate::machine::Machine;
use crate::status::Status;
use crate::AXES;

/// Default display precision per axis class: linear axes report microns,
/// rotaries report hundredths of a degree.
pub const LINEAR_PRECISION: usize = 3;
pub const ROTARY_PRECISION: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SrRequest {
    #[default]
    None,
    Timed,
    Immediate,
}

#[derive(Debug, Default)]
pub struct SrState {
    pub pending: SrRequest,
    pub last_ms: u64,
}

/// Wire status code for the machine state ladder.
pub fn machine_stat_code(machine: &Machine) -> u8 {
    match machine.cm.machine_state {
        MachineState::Initializing => 0,
        MachineState::Ready => 1,
        MachineState::Alarm => 2,
        MachineState::ProgramStop => 3,
        MachineState::ProgramEnd => 4,
        MachineState::Cycle => {
            if machine.hold.get() != HoldState::Off {
                6
            } else {
                match machine.cm.cycle_type {
                    CycleType::Probe => 7,
                    CycleType::Homing => 9,
                    _ => 5,
                }
            }
        }
        MachineState::Shutdown => 12,
        MachineState::Panic => 13,
    }
}

/// Format an axis value at its display precision. The output reparses to
/// within one unit of the last digit.
pub fn format_axis_value(value: f64, precision: usize) -> String {
    format!("{:.*}", precision, value)
}

pub fn axis_precision(axis: usize) -> usize {
    if axis < crate::canon::LINEAR_AXES {
        LINEAR_PRECISION
    } else {
        ROTARY_PRECISION
    }
}

/// Read relaxed JSON: bare keys are quoted, bare `t`/`f`/`n` values become
/// true/false/null, and other bare words become strings. Strict JSON passes
/// through untouched.
pub fn parse_loose_json(text: &str) -> Result<Value, Status> {
    if let Ok(v) = serde_json::from_str(text) {
        return Ok(v);
    }
    let mut out = String::with_capacity(text.len() + 8);
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    let mut in_string = false;
    while i < chars.len() {
        let c = chars[i];
        if in_string {
            out.push(c);
            if c == '\\' && i + 1 < chars.len() {
                out.push(chars[i + 1]);
                i += 2;
                continue;
            }
            if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
                i += 1;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                // peek whether this word is a key
                let mut j = i;
                while j < chars.len() && chars[j].is_whitespace() {
                    j += 1;
                }
                let is_key = chars.get(j) == Some(&':');
                if is_key {
                    out.push('"');
                    out.push_str(&word);
                    out.push('"');
                } else {
                    match word.as_str() {
                        "true" | "false" | "null" => out.push_str(&word),
                        "t" => out.push_str("true"),
                        "f" => out.push_str("false"),
                        "n" => out.push_str("null"),
                        _ => {
                            out.push('"');
                            out.push_str(&word);
                            out.push('"');
                        }
                    }
                }
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    serde_json::from_str(&out).map_err(|_| Status::InvalidOrMalformedCommand)
}

impl Machine {
    /// Queue an outbound report line.
    pub fn emit_report(&mut self, line: String) {
        self.outgoing.push_back(line);
    }

    /// Request a status report. Immediate requests outrank timed ones.
    pub fn sr_request(&mut self, request: SrRequest) {
        match (self.sr.pending, request) {
            (SrRequest::Immediate, _) => {}
            (_, SrRequest::Immediate) => self.sr.pending = SrRequest::Immediate,
            (SrRequest::None, SrRequest::Timed) => self.sr.pending = SrRequest::Timed,
            _ => {}
        }
    }

    /// Emit a pending status report, rate-limiting the timed flavor.
    /// Called from the controller loop.
    pub fn sr_callback(&mut self) {
        let now = self.tb.systick_ms;
        let due = match self.sr.pending {
            SrRequest::None => false,
            SrRequest::Immediate => true,
            SrRequest::Timed => now.saturating_sub(self.sr.last_ms) >= self.cfg.status_interval_ms,
        };
        if !due {
            return;
        }
        self.sr.pending = SrRequest::None;
        self.sr.last_ms = now;
        let report = self.status_report();
        self.emit_report(report.to_string());
    }

    /// Build the status report object: line number, work position, velocity
    /// and state.
    pub fn status_report(&self) -> Value {
        let mut sr = Map::new();
        sr.insert("line".into(), json!(self.cm.gm.linenum));
        sr.insert("stat".into(), json!(machine_stat_code(self)));
        let per_inch = self.cm.gm.units_mode == Units::Inches;
        for a in 0..AXES {
            // report runtime display position in the active work frame
            let mut value = self.mr.position[a] - self.cm.gm.work_offset[a];
            if per_inch && a < crate::canon::LINEAR_AXES {
                value /= crate::canon::MM_PER_INCH;
            }
            let key = format!("pos{}", AXIS_NAMES[a].to_ascii_lowercase());
            let text = format_axis_value(value, axis_precision(a));
            sr.insert(key, json!(text.parse::<f64>().unwrap_or(value)));
        }
        sr.insert("vel".into(), json!(self.mr.segment_velocity));
        sr.insert("feed".into(), json!(self.cm.gm.feed_rate));
        json!({ "sr": Value::Object(sr) })
    }

    /// Surface an exception. Deep-in-interrupt errors call this from the
    /// controller loop after the flag is noticed.
    pub fn report_exception(&mut self, status: Status, context: &str) {
        let line = json!({
            "er": {
                "fb": env!("CARGO_PKG_VERSION"),
                "st": status.code(),
                "msg": format!("{} in {}", status, context),
            }
        });
        self.emit_report(line.to_string());
    }

    /// Report the most recent probe result.
    pub fn report_probe_result(&mut self) {
        if let Some(result) = self.cm.probe_result {
            let mut prb = Map::new();
            prb.insert("e".into(), json!(if result.triggered { 1 } else { 0 }));
            for a in 0..AXES {
                let key = AXIS_NAMES[a].to_ascii_lowercase().to_string();
                let text = format_axis_value(result.position[a], axis_precision(a));
                prb.insert(key, json!(text.parse::<f64>().unwrap_or(result.position[a])));
            }
            let line = json!({ "prb": Value::Object(prb) });
            self.emit_report(line.to_string());
        }
    }

    /// Execute a JSON command: `msg` entries go to the message sink, `null`
    /// values are config reads, everything else is a config write.
    pub fn run_json(&mut self, text: &str) -> Result<(), Status> {
        let value = parse_loose_json(text)?;
        let Value::Object(map) = value else {
            return Err(Status::InvalidOrMalformedCommand);
        };
        for (key, entry) in map {
            if key == "msg" {
                let text = entry.as_str().unwrap_or_default().to_string();
                self.peripherals.message(&text);
                let line = json!({ "msg": text });
                self.emit_report(line.to_string());
                continue;
            }
            let reply = if entry.is_null() {
                self.cfg.get_value(&key)?
            } else {
                self.cfg.set_value(&key, &entry)?;
                entry
            };
            let mut r = Map::new();
            r.insert(key, reply);
            let line = json!({ "r": Value::Object(r) });
            self.emit_report(line.to_string());
        }
        Ok(())
    }
}
