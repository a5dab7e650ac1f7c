//! Optional Marlin-dialect shim (feature `marlin`). Maps the common Marlin
//! moves and temperature/fan codes onto the canonical machine and the
//! peripheral sinks. Anything unrecognized falls through to the native
//! parser.

use log::debug;

use crate::machine::Machine;
use crate::status::Status;

/// What the shim did with a normalized block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarlinOutcome {
    /// Not a Marlin-specific code; parse natively.
    NotHandled,
    /// Fully handled here.
    Consumed,
    /// Rewritten into native G-code; parse the replacement.
    Rewrite(String),
}

/// Extract the numeric value following a word letter in a normalized block.
fn word_value(commands: &str, letter: char) -> Option<f64> {
    let bytes = commands.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b as char == letter && (i == 0 || !bytes[i - 1].is_ascii_digit()) {
            let rest = &commands[i + 1..];
            let end = rest
                .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-'))
                .unwrap_or(rest.len());
            return rest[..end].parse().ok();
        }
    }
    None
}

fn leading_code(commands: &str) -> Option<(char, u16)> {
    let mut chars = commands.chars();
    let letter = chars.next()?;
    if letter != 'G' && letter != 'M' {
        return None;
    }
    let digits: String = chars.take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok().map(|n| (letter, n))
}

/// Run a normalized block through the Marlin dialect map.
pub fn handle(machine: &mut Machine, commands: &str) -> Result<MarlinOutcome, Status> {
    let Some((letter, number)) = leading_code(commands) else {
        return Ok(MarlinOutcome::NotHandled);
    };

    if letter == 'G' {
        // Marlin G28 is a homing cycle, not a go-to-stored-position
        if number == 28 && !commands.contains('.') {
            let rest = &commands[3..];
            let rewritten = if rest.is_empty() {
                "G28.2X0Y0Z0".to_string()
            } else {
                format!("G28.2{}", rest)
            };
            return Ok(MarlinOutcome::Rewrite(rewritten));
        }
        return Ok(MarlinOutcome::NotHandled);
    }

    match number {
        82 | 83 => {
            // extruder distance modes; the A-axis mapping is always absolute
            debug!("marlin extruder mode ignored: {}", commands);
            Ok(MarlinOutcome::Consumed)
        }
        84 | 18 => {
            for m in 0..crate::MOTORS {
                machine.hw.motor_disable(m);
            }
            machine.motors_energized = false;
            Ok(MarlinOutcome::Consumed)
        }
        104 | 109 => {
            let temp = word_value(commands, 'S').unwrap_or(0.0);
            machine
                .peripherals
                .message(&format!("set extruder temperature {}", temp));
            Ok(MarlinOutcome::Consumed)
        }
        140 | 190 => {
            let temp = word_value(commands, 'S').unwrap_or(0.0);
            machine
                .peripherals
                .message(&format!("set bed temperature {}", temp));
            Ok(MarlinOutcome::Consumed)
        }
        106 => {
            let speed = word_value(commands, 'S').unwrap_or(255.0);
            machine
                .peripherals
                .message(&format!("set fan speed {}", speed));
            Ok(MarlinOutcome::Consumed)
        }
        107 => {
            machine.peripherals.message("set fan speed 0");
            Ok(MarlinOutcome::Consumed)
        }
        110 => {
            let line = word_value(commands, 'N').unwrap_or(0.0);
            machine.cm.gm.linenum = line.max(0.0) as u32;
            Ok(MarlinOutcome::Consumed)
        }
        114 => {
            let report = machine.status_report();
            machine.emit_report(report.to_string());
            Ok(MarlinOutcome::Consumed)
        }
        115 => {
            machine.emit_report(format!(
                "{{\"fv\":\"{}\"}}",
                env!("CARGO_PKG_VERSION")
            ));
            Ok(MarlinOutcome::Consumed)
        }
        _ => Ok(MarlinOutcome::NotHandled),
    }
}
