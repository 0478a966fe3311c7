use clap::Parser;
use colored::*;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

use metro_scada_sim::config::{LineConfig, ScadaConfig, TriggerRef};
use metro_scada_sim::modbus::{FaultMode, PlcMemory, PlcSimulator};
use metro_scada_sim::types::ControllerId;
use metro_scada_sim::init_logging;

/// Simulated PLCs for the metro network
#[derive(Parser, Debug)]
#[command(name = "plc_farm", version)]
struct Args {
    /// JSON configuration (defaults to the built-in metro deployment)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bind every controller on this host, ports counting up from --base-port
    #[arg(long, requires = "base_port")]
    host: Option<String>,

    #[arg(long)]
    base_port: Option<u16>,

    /// Also run the station controller PLC-03
    #[arg(long, conflicts_with = "config")]
    stations: bool,

    /// Move one occupied sensor along every line and drive signals from it
    #[arg(long)]
    animate: bool,

    /// Step period for --animate, in milliseconds
    #[arg(long, default_value_t = 1000)]
    step_ms: u64,

    /// Controllers that answer coil reads one byte short
    #[arg(long = "short-coil-reply")]
    short_coil_reply: Vec<String>,

    /// Log filter (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log: String,
}

type MemoryMap = HashMap<ControllerId, Arc<Mutex<PlcMemory>>>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();
    init_logging(&args.log);

    let config = match (&args.config, &args.host, args.base_port) {
        (Some(path), _, _) => ScadaConfig::from_json_file(path)?,
        (None, Some(host), Some(port)) if args.stations => ScadaConfig::metro_with_stations(host, port),
        (None, Some(host), Some(port)) => ScadaConfig::metro_on_host(host, port),
        _ if args.stations => ScadaConfig::metro_with_stations("127.0.0.1", 5020),
        _ => ScadaConfig::metro_default(),
    };
    config.validate()?;

    println!("{}", "═══════════════════════════════════════════════════════".cyan().bold());
    println!("{}", "              METRO PLC FARM (SIMULATED)               ".cyan().bold());
    println!("{}", "═══════════════════════════════════════════════════════".cyan().bold());
    println!();

    let mut simulators = Vec::with_capacity(config.controllers.len());
    let mut memories = MemoryMap::new();

    for endpoint in &config.controllers {
        let sim = PlcSimulator::for_endpoint(endpoint).await?;
        println!(
            "{} {} ({}) on {}  coils={} registers={}",
            "✓".green().bold(),
            endpoint.id.as_str().bright_white().bold(),
            endpoint.role,
            sim.local_addr(),
            endpoint.coil_count,
            endpoint.register_count
        );
        if args.short_coil_reply.iter().any(|id| id == endpoint.id.as_str()) {
            sim.set_fault(FaultMode::ShortCoilReply);
            println!("  {} short coil replies enabled", "→".yellow().bold());
        }
        memories.insert(endpoint.id.clone(), sim.memory());
        simulators.push(sim);
    }

    arm_train_guards(&config, &memories).await;
    println!();
    println!("{} Collision guards armed on every train slot", "→".green().bold());

    let animation = if args.animate {
        println!("{} Animating sensors every {} ms", "→".green().bold(), args.step_ms);
        let config = config.clone();
        let memories = memories.clone();
        Some(tokio::spawn(animate(config, memories, Duration::from_millis(args.step_ms))))
    } else {
        None
    };

    println!();
    println!("Press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    println!();
    println!("{} Shutting down...", "→".yellow().bold());

    if let Some(task) = animation {
        task.abort();
    }
    for sim in simulators {
        let served = sim.requests_served();
        let name = sim.name().to_string();
        sim.shutdown().await;
        println!("{} {} stopped after {} requests", "✓".green(), name, served);
    }

    Ok(())
}

/// Guard coil true = front-train detection active
async fn arm_train_guards(config: &ScadaConfig, memories: &MemoryMap) {
    for line in &config.lines {
        let Some(trains) = &line.trains else { continue };
        let Some(memory) = memories.get(&trains.controller) else { continue };
        let mut mem = memory.lock().await;
        for offset in trains.guard_coils.start..trains.guard_coils.end {
            if let Some(coil) = mem.coils.get_mut(offset) {
                *coil = true;
            }
        }
    }
}

async fn animate(config: ScadaConfig, memories: MemoryMap, step: Duration) {
    let mut ticker = tokio::time::interval(step);
    let mut position: HashMap<String, usize> = HashMap::new();

    loop {
        ticker.tick().await;

        // Advance one occupied sensor per line
        for line in &config.lines {
            let Some(memory) = memories.get(&line.sensors.controller) else { continue };
            let count = line.sensors.registers.len();
            if count == 0 {
                continue;
            }
            let pos = position.entry(line.id.to_string()).or_insert(0);
            *pos = (*pos + 1) % count;

            let mut mem = memory.lock().await;
            for k in 0..count {
                let reg = line.sensors.registers.start + k;
                if let Some(value) = mem.registers.get_mut(reg) {
                    *value = u16::from(k == *pos);
                }
            }
        }

        let occupied = read_occupancy(&config, &memories).await;
        for line in &config.lines {
            if let Err(e) = drive_signals(line, &occupied, &memories).await {
                warn!(line = %line.id, error = %e, "signal update skipped");
            }
        }
    }
}

async fn read_occupancy(config: &ScadaConfig, memories: &MemoryMap) -> HashMap<String, Vec<bool>> {
    let mut occupied = HashMap::new();
    for line in &config.lines {
        let Some(memory) = memories.get(&line.sensors.controller) else { continue };
        let mem = memory.lock().await;
        let sensors = (line.sensors.registers.start..line.sensors.registers.end)
            .map(|reg| mem.registers.get(reg).is_some_and(|v| *v != 0))
            .collect();
        occupied.insert(line.id.to_string(), sensors);
    }
    occupied
}

/// Stop while a trigger-on sensor is occupied and no trigger-off sensor is
async fn drive_signals(
    line: &LineConfig,
    occupied: &HashMap<String, Vec<bool>>,
    memories: &MemoryMap,
) -> Result<(), String> {
    let Some(signals) = &line.signals else { return Ok(()) };
    let memory = memories
        .get(&signals.controller)
        .ok_or_else(|| format!("no simulator for {}", signals.controller))?;

    let any = |refs: &[TriggerRef]| {
        refs.iter().any(|r| {
            occupied
                .get(r.line.as_str())
                .and_then(|s| s.get(r.sensor))
                .copied()
                .unwrap_or(false)
        })
    };

    let mut mem = memory.lock().await;
    for (k, triggers) in signals.triggers.iter().enumerate() {
        let stop = any(&triggers.trigger_on) && !any(&triggers.trigger_off);
        if let Some(coil) = mem.coils.get_mut(signals.coils.start + k) {
            if *coil != stop {
                info!(line = %line.id, signal = k, stop, "signal aspect changed");
            }
            *coil = stop;
        }
    }
    Ok(())
}
