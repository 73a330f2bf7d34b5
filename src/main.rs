use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use cncstream::{init_logging, load_config};
use cncstream_camtools::{Autolevel, ControllerProber, HeightMap, ProbeGrid, ScanParams};
use cncstream_communication::{CncController, SimulatedGrbl};
use cncstream_core::{AppEvent, AutolevelEvent, EventCategory, EventFilter, RunEvent, RunOutcome};
use cncstream_gcode::MotionProgram;
use cncstream_settings::Config;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MARGIN_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Parser)]
#[command(
    author = env!("CARGO_PKG_AUTHORS"),
    version = env!("CARGO_PKG_VERSION"),
    long_version = concat!(env!("CARGO_PKG_VERSION"), " (built ", env!("BUILD_DATE"), ")"),
    about = env!("CARGO_PKG_DESCRIPTION"),
)]
struct Cli {
    /// Path to configuration file (TOML or JSON)
    #[arg(long = "config", short = 'C', value_name = "FILE", global = true)]
    config: Option<PathBuf>,
    /// Serial port, overrides the configuration
    #[arg(long, short = 'p', global = true)]
    port: Option<String>,
    /// Baud rate, overrides the configuration
    #[arg(long, short = 'b', global = true)]
    baud: Option<u32>,
    /// Talk to the built-in GRBL simulator instead of a serial port
    #[arg(long, global = true)]
    simulate: bool,
    /// Log as JSON lines
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List serial ports
    Ports,
    /// Stream a G-code file
    Stream {
        file: PathBuf,
        /// Compensate with a saved height map before streaming
        #[arg(long, value_name = "MAP")]
        height_map: Option<PathBuf>,
    },
    /// Probe a height map over the configured grid
    Autolevel {
        /// Where to save the height map
        #[arg(long, short = 'o', default_value = "heightmap.json")]
        output: PathBuf,
        /// Compensate this program with the new map
        #[arg(long, value_name = "FILE")]
        compensate: Option<PathBuf>,
        /// Probe over the XY bounds of the program given with --compensate
        #[arg(long, requires = "compensate")]
        margins: bool,
        /// Rapid around the grid outline before probing
        #[arg(long)]
        trace: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json)?;

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(port) = &cli.port {
        config.connection.port = port.clone();
    }
    if let Some(baud) = cli.baud {
        config.connection.baud_rate = baud;
    }
    config.validate().context("invalid configuration")?;

    match &cli.command {
        Command::Ports => list_ports(),
        Command::Stream { file, height_map } => {
            let controller = connect(&config, cli.simulate)?;
            stream(controller, file, height_map.as_deref())
        }
        Command::Autolevel {
            output,
            compensate,
            margins,
            trace,
        } => {
            let controller = connect(&config, cli.simulate)?;
            let options = AutolevelOptions {
                margins: *margins,
                trace: *trace,
            };
            autolevel(controller, &config, output, compensate.as_deref(), options)
        }
    }
}

fn list_ports() -> anyhow::Result<()> {
    let ports = cncstream_communication::list_ports().context("listing serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{}\t{}", port.port_name, port.description);
    }
    Ok(())
}

fn connect(config: &Config, simulate: bool) -> anyhow::Result<CncController> {
    let mut controller = CncController::new(config.clone());
    if simulate {
        let sim = SimulatedGrbl::new().with_surface(|_, _| Some(0.0));
        controller
            .connect_simulated(sim)
            .context("connecting to simulator")?;
    } else {
        controller
            .connect_serial()
            .with_context(|| format!("connecting to {}", config.connection.port))?;
    }
    if !controller.wait_for(CONNECT_TIMEOUT, |s| s.controller_state.is_quiescent()) {
        let state = controller.state().controller_state();
        bail!("controller not ready ({})", state);
    }
    Ok(controller)
}

/// Ask on the terminal before a suspended tool change resumes
fn confirm_tool_change(tool: u32) -> anyhow::Result<()> {
    print!("Load tool T{:02} and press Enter to continue ", tool);
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(())
}

fn stream(mut controller: CncController, file: &Path, height_map: Option<&Path>) -> anyhow::Result<()> {
    let mut program = MotionProgram::load(file).with_context(|| format!("reading {}", file.display()))?;
    if let Some(path) = height_map {
        let map = HeightMap::load(path).with_context(|| format!("reading {}", path.display()))?;
        let mut session = Autolevel::new(*map.grid());
        session.set_height_map(map);
        let (compensated, report) = session.compensate(&program)?;
        tracing::info!(
            "Compensated {} moves into {} segments",
            report.moves_compensated,
            report.segments_emitted
        );
        program = compensated;
    }

    let (tx, rx) = mpsc::channel();
    let subscription = controller
        .events()
        .subscribe(EventFilter::Categories(vec![EventCategory::Run]), move |event| {
            if let AppEvent::Run(e) = event {
                let _ = tx.send(e);
            }
        });

    controller.run().run_program(&program)?;

    let outcome = loop {
        match rx.recv_timeout(Duration::from_millis(500)) {
            Ok(RunEvent::Progress { completed, total }) => {
                tracing::debug!("{}/{} lines acknowledged", completed, total);
            }
            Ok(RunEvent::Message { text }) => println!("{}", text),
            Ok(RunEvent::ToolChangePending { tool, token }) => {
                confirm_tool_change(tool)?;
                controller.run().acknowledge_tool_change(token)?;
            }
            Ok(RunEvent::Ended {
                outcome,
                lines,
                elapsed,
            }) => {
                println!("{} lines in {:.1}s", lines, elapsed.as_secs_f64());
                break outcome;
            }
            Ok(_) => {}
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if !controller.is_connected() {
                    break RunOutcome::Failed("connection lost".into());
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                break RunOutcome::Failed("event bus closed".into());
            }
        }
    };

    controller.events().unsubscribe(subscription);
    controller.disconnect();
    match outcome {
        RunOutcome::Completed => Ok(()),
        RunOutcome::Stopped => bail!("run stopped"),
        RunOutcome::Failed(reason) => bail!("run failed: {}", reason),
    }
}

#[derive(Debug, Clone, Copy)]
struct AutolevelOptions {
    margins: bool,
    trace: bool,
}

fn autolevel(
    mut controller: CncController,
    config: &Config,
    output: &Path,
    program: Option<&Path>,
    options: AutolevelOptions,
) -> anyhow::Result<()> {
    let source = program
        .map(|path| MotionProgram::load(path).with_context(|| format!("reading {}", path.display())))
        .transpose()?;
    let grid = match &source {
        Some(source) if options.margins => {
            controller.run().load_program(source);
            ProbeGrid::from_margins(
                controller.state(),
                config.autolevel.step_x,
                config.autolevel.step_y,
            )?
        }
        _ => ProbeGrid::from_settings(&config.autolevel)?,
    };
    let params = ScanParams::from_config(config);
    let mut session = Autolevel::new(grid).with_events(controller.events().clone());
    if options.trace {
        session.scan_margins(controller.run(), params)?;
        if !controller.wait_for_run(MARGIN_TIMEOUT) {
            bail!("tracing the margins did not finish");
        }
    }
    let subscription = controller.events().subscribe(
        EventFilter::Categories(vec![EventCategory::Autolevel]),
        |event| {
            if let AppEvent::Autolevel(AutolevelEvent::PointProbed {
                point,
                completed,
                total,
            }) = event
            {
                println!(
                    "[{}/{}] X{:.3} Y{:.3} Z{:.4}{}",
                    completed,
                    total,
                    point.target.x,
                    point.target.y,
                    point.position.z,
                    if point.success { "" } else { " (no contact)" }
                );
            }
        },
    );

    let mut prober = ControllerProber::from_controller(&controller, &config.autolevel);
    let completed = session
        .scan(&mut prober, params)
        .finish()
        .context("probing height map")?;
    controller.events().unsubscribe(subscription);
    controller.disconnect();
    if !completed {
        bail!("scan aborted");
    }

    let map = session.height_map();
    if let Some((min, max)) = map.min_max() {
        println!("Surface Z {:.4} to {:.4}", min, max);
    }
    map.save(output)
        .with_context(|| format!("writing {}", output.display()))?;

    if let (Some(path), Some(source)) = (program, &source) {
        let (compensated, report) = session.compensate(source)?;
        let target = path.with_extension("leveled.nc");
        compensated
            .save(&target)
            .with_context(|| format!("writing {}", target.display()))?;
        println!(
            "Wrote {} ({} moves, {} degraded points)",
            target.display(),
            report.moves_compensated,
            report.degraded_points
        );
    }
    Ok(())
}
