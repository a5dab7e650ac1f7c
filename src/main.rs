use std::fs;
use std::io::{self, Read};

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use steprun::controller::Controller;
use steprun::machine::Machine;
use steprun::{MachineConfig, MOTORS};

/// Motion-control core simulator: runs a G-code program against the
/// simulated machine and reports where it ended up.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// G-code program; reads stdin when omitted
    #[arg()]
    gcode_file: Option<String>,

    /// Machine configuration (JSON); defaults apply when omitted
    #[arg(short, long)]
    config: Option<String>,

    /// Print per-motor step totals after the run
    #[arg(long)]
    steps: bool,

    /// Milliseconds of simulated time to allow before giving up
    #[arg(long, default_value_t = 600_000)]
    time_limit_ms: u64,

    /// Enable debug messages
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut builder = env_logger::Builder::from_default_env();
    if args.verbose {
        builder.filter(None, log::LevelFilter::Debug);
    } else {
        builder.filter(None, log::LevelFilter::Info);
    }
    builder.init();

    let cfg = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path))?;
            serde_json::from_str::<MachineConfig>(&text)
                .with_context(|| format!("parsing config {}", path))?
        }
        None => MachineConfig::default(),
    };

    let program = match &args.gcode_file {
        Some(path) => {
            fs::read_to_string(path).with_context(|| format!("reading {}", path))?
        }
        None => {
            let mut text = String::new();
            io::stdin().read_to_string(&mut text).context("reading stdin")?;
            text
        }
    };

    let machine = Machine::sim_with_config(cfg);
    let mut controller = Controller::new(machine, Box::new(io::stdout()));
    controller.set_line_state(true, true);

    info!("running {} lines", program.lines().count());
    controller.provide_input(&program);
    if !program.ends_with('\n') {
        controller.provide_input("\n");
    }

    let finished = controller.run_until_idle(args.time_limit_ms);
    if !finished {
        anyhow::bail!("program did not finish within {} ms", args.time_limit_ms);
    }

    let machine = &controller.machine;
    let elapsed_s = machine.tb.systick_ms as f64 / 1000.0;
    info!("done in {:.3}s of machine time", elapsed_s);
    println!(
        "final position: X{:.3} Y{:.3} Z{:.3} A{:.2} B{:.2} C{:.2}",
        machine.cm.position[0],
        machine.cm.position[1],
        machine.cm.position[2],
        machine.cm.position[3],
        machine.cm.position[4],
        machine.cm.position[5],
    );
    if args.steps {
        let hw = machine.sim_hw();
        for m in 0..MOTORS {
            println!(
                "motor {}: {} steps ({} pulses)",
                m + 1,
                hw.step_counts[m],
                hw.raw_pulses[m]
            );
        }
    }
    Ok(())
}
