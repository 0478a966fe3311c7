use clap::Parser;
use colored::*;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use metro_scada_sim::topology::SignalAspect;
use metro_scada_sim::{
    ConnectionState, CycleReport, DataManager, EventJournal, InterlockMonitor, MonitorState, ScadaConfig,
    TrackModel, init_logging,
};

/// Operator view: polls every PLC, rebuilds the track state and watches interlocks
#[derive(Parser, Debug)]
#[command(name = "hmi_monitor", version)]
struct Args {
    /// JSON configuration (defaults to the built-in metro deployment)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for the event journal
    #[arg(long, default_value = "event_logs")]
    journal_dir: PathBuf,

    /// Stop after this many poll cycles
    #[arg(long)]
    cycles: Option<u64>,

    /// Include the station controller PLC-03 in the built-in layout
    #[arg(long, conflicts_with = "config")]
    stations: bool,

    /// Log filter (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();
    init_logging(&args.log);

    let config = match &args.config {
        Some(path) => ScadaConfig::from_json_file(path)?,
        None if args.stations => ScadaConfig::metro_with_stations("127.0.0.1", 5020),
        None => ScadaConfig::metro_default(),
    };

    let mut track = TrackModel::build(&config)?;
    let data = Arc::new(DataManager::new(config)?);
    let journal = EventJournal::create("HMI", Some(args.journal_dir.clone()))?;
    let mut monitor = InterlockMonitor::with_journal(journal.clone());

    println!("{}", "═══════════════════════════════════════════════════════".green().bold());
    println!("{}", "              METRO SCADA HMI MONITOR                  ".green().bold());
    println!("{}", "═══════════════════════════════════════════════════════".green().bold());
    println!();
    println!("{} Journal: {}", "→".green().bold(), journal.path().display());

    journal.log_startup(data.controllers().count(), track.lines().count());
    let connected = data.start().await;
    println!(
        "{} {}/{} controllers connected",
        if connected == data.controllers().count() { "✓".green().bold() } else { "✗".red().bold() },
        connected,
        data.controllers().count()
    );
    for endpoint in data.controllers() {
        let state = data.connection_state(&endpoint.id)?;
        journal.log_connection_change(&endpoint.id, state);
    }
    println!("Press Ctrl+C to stop");
    println!();

    let mut ticker = tokio::time::interval(data.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let tick = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            tick = ticker.tick() => tick,
        };

        let Some(report) = data.periodic(tick).await else { continue };
        journal_report(&journal, &report);

        if let Err(e) = track.sync(&data) {
            warn!(error = %e, "topology sync failed");
            continue;
        }
        let anomalies = track.check_consistency();
        let state = monitor.observe(&anomalies);

        print_status(&report, &track, state);
        for anomaly in &anomalies {
            println!("    {} {}", "!".red().bold(), anomaly);
        }

        if args.cycles.is_some_and(|max| report.cycle >= max) {
            break;
        }
    }

    println!();
    println!("{} Shutting down...", "→".yellow().bold());
    data.shutdown().await;
    println!("{}", monitor.stats());
    info!(entries = journal.sequence(), "journal closed");
    Ok(())
}

fn journal_report(journal: &EventJournal, report: &CycleReport) {
    for (controller, state) in &report.connection_changes {
        journal.log_connection_change(controller, *state);
    }
    for (controller, detail) in &report.mismatched {
        journal.log_protocol_mismatch(controller, detail);
    }
}

fn print_status(report: &CycleReport, track: &TrackModel, state: MonitorState) {
    let links = if report.all_refreshed() {
        format!("{} ok", report.refreshed.len()).green()
    } else {
        format!(
            "{} ok / {} skipped / {} failed",
            report.refreshed.len(),
            report.skipped.len(),
            report.failed.len()
        )
        .yellow()
    };
    println!("{} cycle {:>5} │ {} │ {}", "→".blue().bold(), report.cycle, links, state);

    for (controller, state) in &report.connection_changes {
        let mark = if *state == ConnectionState::Connected { "✓".green() } else { "✗".red() };
        println!("    {} {} {}", mark, controller, state);
    }

    for line in track.lines() {
        let sensors: String = line.sensors.iter().map(|s| if s.occupied { '■' } else { '·' }).collect();
        let signals: String = line
            .signals
            .iter()
            .map(|s| match s.aspect {
                SignalAspect::Stop => "R".red().to_string(),
                SignalAspect::Clear => "G".green().to_string(),
            })
            .collect();
        let trains: Vec<String> = line
            .trains
            .iter()
            .map(|t| {
                let power = if t.powered { "on" } else { "off" };
                let guard = if t.guard_armed { "armed".green() } else { "OPEN".red().bold() };
                format!("{} {}@{} {}", t.id, power, t.speed, guard)
            })
            .collect();
        println!(
            "    {:<7} {}  {}  {}",
            line.id.as_str().bright_white().bold(),
            sensors,
            signals,
            trains.join(" │ ")
        );
        if !line.stations.is_empty() {
            let platforms: String = line
                .stations
                .iter()
                .map(|st| match (st.occupied, st.departure) {
                    (true, SignalAspect::Stop) => "▣".red().to_string(),
                    (true, SignalAspect::Clear) => "▣".green().to_string(),
                    (false, _) => "□".normal().to_string(),
                })
                .collect();
            println!("    {:<7} {}", "station", platforms);
        }
    }
}
