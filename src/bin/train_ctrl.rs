use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use std::sync::Arc;

use metro_scada_sim::{DataManager, EventJournal, LineId, ScadaConfig, TrackModel, TrainOperator, init_logging};

/// Train operator console: power and speed commands for the train PLC
#[derive(Parser, Debug)]
#[command(name = "train_ctrl", version)]
struct Args {
    /// JSON configuration (defaults to the built-in metro deployment)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for the operator journal
    #[arg(long, default_value = "event_logs")]
    journal_dir: PathBuf,

    /// Log filter (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show every train slot as last polled
    Status,

    /// Switch one train's power
    Power {
        #[arg(long)]
        line: String,
        #[arg(long)]
        slot: usize,
        /// Cut power instead of applying it
        #[arg(long)]
        off: bool,
    },

    /// Power every train on (or off)
    PowerAll {
        #[arg(long)]
        off: bool,
    },

    /// Set one train's speed register
    Speed {
        #[arg(long)]
        line: String,
        #[arg(long)]
        slot: usize,
        #[arg(long)]
        value: u16,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();
    init_logging(&args.log);

    let config = match &args.config {
        Some(path) => ScadaConfig::from_json_file(path)?,
        None => ScadaConfig::metro_default(),
    };

    let data = Arc::new(DataManager::new(config)?);
    let connected = data.start().await;
    println!(
        "{} {}/{} controllers connected",
        if connected == data.controllers().count() { "✓".green().bold() } else { "✗".red().bold() },
        connected,
        data.controllers().count()
    );

    let journal = EventJournal::create("TRAIN_CTRL", Some(args.journal_dir.clone()))?;
    let operator = TrainOperator::new(Arc::clone(&data))?.with_journal(journal);

    match &args.command {
        Command::Status => {}
        Command::Power { line, slot, off } => {
            operator.set_power(&LineId::from(line.as_str()), *slot, !off).await?;
            println!("{} {} slot {} power {}", "→".green().bold(), line, slot, if *off { "off" } else { "on" });
        }
        Command::PowerAll { off } => {
            let count = operator.power_all(!off).await?;
            println!("{} {} trains powered {}", "→".green().bold(), count, if *off { "off" } else { "on" });
        }
        Command::Speed { line, slot, value } => {
            operator.set_speed(&LineId::from(line.as_str()), *slot, *value).await?;
            println!("{} {} slot {} speed {}", "→".green().bold(), line, slot, value);
        }
    }

    // Commands only show up in the image after a poll
    let report = data.refresh().await.ok_or("poll cycle already in progress")?;
    let mut track = TrackModel::build(data.config())?;
    track.sync(&data)?;

    println!();
    println!("{} cycle {}", "→".blue().bold(), report.cycle);
    for line in track.lines() {
        for train in &line.trains {
            let power = if train.powered { "on".green() } else { "off".normal() };
            let guard = if train.guard_armed { "armed".green() } else { "OPEN".red().bold() };
            println!("    {:<10} power {:<3}  speed {:>3}  guard {}", train.id, power, train.speed, guard);
        }
    }

    data.shutdown().await;
    Ok(())
}
