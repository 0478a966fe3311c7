use clap::Parser;
use colored::*;
use std::path::PathBuf;

use metro_scada_sim::verify_journal_file;

/// Check the hash chain of an event journal
#[derive(Parser, Debug)]
#[command(name = "journal_verify", version)]
struct Args {
    /// Journal files (.jsonl)
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();
    let mut failed = 0;

    for path in &args.files {
        println!("{} {}", "→".blue().bold(), path.display());
        let result = verify_journal_file(path)?;
        if result.verified {
            println!("  {} {} entries, chain intact", "✓".green().bold(), result.total_entries);
        } else {
            failed += 1;
            println!(
                "  {} {} entries, {} issue(s)",
                "✗".red().bold(),
                result.total_entries,
                result.issues.len()
            );
            for issue in &result.issues {
                println!("    {}", issue.red());
            }
        }
    }

    if failed > 0 {
        return Err(format!("{} of {} journal(s) failed verification", failed, args.files.len()).into());
    }
    Ok(())
}
