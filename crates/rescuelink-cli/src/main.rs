//! `rescuelink` – RescueLink command line interface.
//!
//! Flies the configured mission against the simulated vehicle, camera and
//! detector:
//!
//! 1. Loads `~/.rescuelink/config.toml` (or the path given as the first
//!    argument), writing a default config on first run.
//! 2. Starts the rescue system and prints every telemetry event as a
//!    dashboard JSON line on stdout.
//! 3. **Ctrl-C** once latches an emergency stop; a second Ctrl-C shuts the
//!    system down without waiting for the stop.
//! 4. Reads operator commands from stdin: `home` recalls the vehicle,
//!    `stop` latches an emergency stop.

mod config;

use colored::Colorize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{info, warn};

use rescuelink_hal::sim::{SimCamera, SimDetector, SimVehicle};
use rescuelink_middleware::{BusTelemetrySink, TelemetryBus, dashboard_frame};
use rescuelink_runtime::{Collaborators, RescueSystem, SystemConfig, init_tracing};
use rescuelink_types::{MissionPlan, Position};

fn main() -> ExitCode {
    let _tracing = init_tracing("rescuelink");

    print_banner();

    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(config::config_path);

    let cfg = match config::load_from(&path) {
        Ok(Some(cfg)) => {
            println!("  Config loaded from {}", path.display().to_string().bold());
            cfg
        }
        Ok(None) => first_run(&path),
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            return ExitCode::FAILURE;
        }
    };

    let (system_config, plan) = match cfg.to_system_config() {
        Ok(pair) => pair,
        Err(e) => {
            println!("{}: {}", "Invalid configuration".red(), e);
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            println!("{}: {}", "Failed to start async runtime".red(), e);
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(fly(&cfg, system_config, plan))
}

fn first_run(path: &Path) -> config::Config {
    let mut cfg = config::Config::default();
    config::apply_env_overrides(&mut cfg);
    match config::save_to(&cfg, path) {
        Ok(()) => println!(
            "  {} Default config written to {}",
            "✓".green().bold(),
            path.display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    cfg
}

async fn fly(cfg: &config::Config, system_config: SystemConfig, plan: MissionPlan) -> ExitCode {
    let bus = TelemetryBus::default();
    let mut events = bus.subscribe_all();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("{}", dashboard_frame(&event));
        }
    });

    let home = plan.get(0).map(|w| w.position()).unwrap_or(Position {
        latitude: 0.0,
        longitude: 0.0,
        altitude: 0.0,
    });
    let vehicle = SimVehicle::new()
        .with_home(home)
        .with_battery(cfg.sim.battery_pct)
        .with_drain(cfg.sim.drain_per_poll)
        .reach_after_polls(cfg.sim.reach_after_polls);
    let collaborators = Collaborators {
        camera: Box::new(SimCamera::new("sim-camera").failing_every(cfg.sim.camera_fail_every)),
        detector: Box::new(
            SimDetector::new("sim-detector")
                .with_hazard_frames(cfg.sim.hazard_from_frame..cfg.sim.hazard_until_frame),
        ),
        link: Box::new(vehicle.command_link("sim-link")),
        telemetry: Box::new(vehicle.telemetry()),
    };

    println!(
        "  Flying {} waypoint(s) as {} at {} Hz\n",
        plan.len(),
        cfg.device_id.bold(),
        system_config.tick_rate_hz
    );

    let sink = Arc::new(BusTelemetrySink::new(bus.clone()));
    let system = match RescueSystem::start(system_config, plan, collaborators, sink).await {
        Ok(system) => system,
        Err(e) => {
            println!("{}: {}", "Startup failed".red().bold(), e);
            return ExitCode::FAILURE;
        }
    };

    install_ctrlc(&system);
    spawn_operator_console(&system);

    let summary = system.run().await;

    // Close the bus so the printer drains and exits.
    drop(bus);
    if tokio::time::timeout(Duration::from_secs(1), printer).await.is_err() {
        warn!("telemetry printer did not drain in time");
    }

    info!(
        frames_skipped = summary.frames_skipped,
        detections = summary.monitor.eligible,
        "run finished"
    );
    match summary.final_state {
        Some(state) => println!("\n  Final state: {}", state.to_string().bold()),
        None => println!("\n  {}", "Final state unknown: control task failed".red()),
    }
    ExitCode::SUCCESS
}

fn install_ctrlc(system: &RescueSystem) {
    let latch = system.emergency_latch();
    let run = system.run_flag();
    let presses = AtomicUsize::new(0);

    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        if presses.fetch_add(1, Ordering::SeqCst) == 0 {
            println!("{}", "⚠  Ctrl-C received – latching emergency stop …".yellow().bold());
            latch.trigger();
        } else {
            println!("{}", "⚠  Second Ctrl-C – shutting down.".yellow().bold());
            run.stop();
        }
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; emergency stop on Ctrl-C will not be available");
    }
}

/// Operator commands on stdin.  A plain thread: a blocked stdin read must
/// not hold up runtime shutdown.
fn spawn_operator_console(system: &RescueSystem) {
    let latch = system.emergency_latch();
    let recall = system.recall_latch();
    println!(
        "  Type {} to recall the vehicle or {} for an emergency stop.\n",
        "home".bold().cyan(),
        "stop".bold().cyan()
    );

    let spawned = std::thread::Builder::new()
        .name("operator-console".to_string())
        .spawn(move || {
            for line in std::io::stdin().lines() {
                let Ok(line) = line else { break };
                match line.trim() {
                    "home" | "rth" => {
                        if recall.trigger() {
                            println!("{}", "  ↩ Return home requested.".yellow().bold());
                        }
                    }
                    "stop" => {
                        if latch.trigger() {
                            println!("{}", "⚠  Emergency stop latched.".yellow().bold());
                        }
                    }
                    "" => {}
                    other => println!("  Unknown command: {}", other.dimmed()),
                }
            }
        });
    if let Err(e) = spawned {
        warn!(error = %e, "Failed to start operator console; use Ctrl-C for an emergency stop");
    }
}

fn print_banner() {
    println!();
    println!("{}", r#"   ___                       __   _      __  "#.bold().red());
    println!("{}", r#"  / _ \___ ___ ______ _____ / /  (_)__  / /__"#.bold().red());
    println!("{}", r#" / , _/ -_|_-</ __/ // / -_) /__/ / _ \/  '_/"#.bold().red());
    println!("{}", r#"/_/|_|\__/___/\__/\_,_/\__/____/_/_//_/_/\_\ "#.bold().red());
    println!();
    println!(
        "  {} v{}",
        "Autonomous search & rescue mission runtime".bold(),
        env!("CARGO_PKG_VERSION")
    );
    println!();
}
