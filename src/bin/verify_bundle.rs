use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command};
use tracing::{error, info};

use audit_ledger::audit::{verify_bundle, CheckpointBundle};

fn main() -> Result<()> {
    let matches = Command::new("verify-bundle")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Verify an exported audit checkpoint bundle offline")
        .arg(
            Arg::new("bundle")
                .value_name("PATH")
                .help("Path to the bundle JSON file")
                .required(true),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Enable verbose output"),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .action(ArgAction::SetTrue)
                .help("Suppress output except errors"),
        )
        .get_matches();

    let verbose = matches.get_flag("verbose");
    let quiet = matches.get_flag("quiet");
    let level = if quiet {
        tracing::Level::ERROR
    } else if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let path = matches
        .get_one::<String>("bundle")
        .context("bundle path is required")?;

    info!("Verifying checkpoint bundle: {}", path);
    let content = std::fs::read(path).with_context(|| format!("Failed to read {}", path))?;
    let bundle: CheckpointBundle =
        serde_json::from_slice(&content).context("File is not a checkpoint bundle")?;

    let result = verify_bundle(&bundle);
    if !result.is_valid {
        for issue in &result.issues {
            error!("{}", issue);
        }
        eprintln!(
            "✗ Checkpoint {} bundle failed verification ({} issue(s))",
            result.checkpoint_number,
            result.issues.len()
        );
        std::process::exit(1);
    }

    if !quiet {
        println!(
            "✓ Checkpoint {} bundle verified: {} events, {} proofs",
            result.checkpoint_number, result.events_checked, result.proofs_checked
        );
    }
    Ok(())
}
