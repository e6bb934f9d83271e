//! Audit Ledger CLI
//!
//! Records events, seals checkpoints and verifies the tamper-evident chain.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audit_ledger::audit::{AuditEvent, AuditWriter};
use audit_ledger::config::LedgerConfig;

#[derive(Parser)]
#[command(name = "audit-ledger")]
#[command(about = "Tamper-evident audit trail with signed Merkle checkpoints")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML, JSON or YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the chain id from configuration
    #[arg(long, global = true)]
    chain_id: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Record an event, or a JSON array of events with --batch
    Record {
        #[arg(required_unless_present = "batch")]
        event_type: Option<String>,

        #[arg(required_unless_present = "batch")]
        category: Option<String>,

        #[arg(long)]
        actor_type: Option<String>,

        #[arg(long)]
        actor_id: Option<String>,

        #[arg(long)]
        resource_type: Option<String>,

        #[arg(long)]
        resource_id: Option<String>,

        /// Event payload as JSON
        #[arg(long, default_value = "{}")]
        payload: String,

        /// File holding a JSON array of events, recorded atomically
        #[arg(long, conflicts_with = "event_type")]
        batch: Option<PathBuf>,
    },

    /// Seal all pending events into a checkpoint
    Checkpoint,

    /// Verify the hash chain
    Verify {
        #[arg(long)]
        start: Option<u64>,

        #[arg(long)]
        end: Option<u64>,
    },

    /// Verify one checkpoint, or all of them
    VerifyCheckpoints {
        #[arg(short, long)]
        number: Option<u64>,
    },

    /// Show chain statistics
    Stats,

    /// Print and check the inclusion proof of an event
    Proof {
        sequence_number: u64,
    },

    /// Export a checkpoint bundle to WORM storage, or to a file with --output
    Export {
        checkpoint_number: u64,

        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Rotate the checkpoint signing key
    RotateKey,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "audit_ledger=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut config = LedgerConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(chain_id) = cli.chain_id {
        config.chain.chain_id = chain_id;
    }

    let writer = AuditWriter::from_config(&config)
        .await
        .context("Failed to open audit ledger")?;
    writer.initialize().await?;
    info!("Audit ledger ready on chain {}", writer.chain_id());

    match cli.command {
        Commands::Record {
            event_type,
            category,
            actor_type,
            actor_id,
            resource_type,
            resource_id,
            payload,
            batch,
        } => {
            if let Some(path) = batch {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                let events: Vec<AuditEvent> =
                    serde_json::from_str(&content).context("Batch file is not a JSON array of events")?;
                let records = writer.record_events(events).await?;
                print_json(&records)?;
            } else {
                let event_type = event_type.ok_or_else(|| anyhow!("event type is required"))?;
                let category = category.ok_or_else(|| anyhow!("category is required"))?;
                let payload = serde_json::from_str(&payload).context("Payload is not valid JSON")?;

                let mut event = AuditEvent::new(event_type, category).with_payload(payload);
                event.actor_type = actor_type;
                event.actor_id = actor_id;
                event.resource_type = resource_type;
                event.resource_id = resource_id;

                let record = writer.record_event(event).await?;
                print_json(&record)?;
            }
        }

        Commands::Checkpoint => {
            let checkpoint = writer.create_checkpoint().await?;
            print_json(&checkpoint)?;
        }

        Commands::Verify { start, end } => {
            let result = writer.verify_chain(start, end).await?;
            print_json(&result)?;
            if !result.is_valid {
                error!("Chain verification failed");
                std::process::exit(1);
            }
        }

        Commands::VerifyCheckpoints { number } => {
            let results = match number {
                Some(number) => vec![writer.verify_checkpoint(number).await?],
                None => writer.verify_all_checkpoints().await?,
            };
            print_json(&results)?;
            if results.iter().any(|r| !r.is_valid) {
                error!("Checkpoint verification failed");
                std::process::exit(1);
            }
        }

        Commands::Stats => {
            print_json(&writer.get_stats().await?)?;
        }

        Commands::Proof { sequence_number } => {
            let proof = writer.get_event_proof(sequence_number).await?;
            let valid = writer.verify_event_proof(&proof).await;
            print_json(&proof)?;
            if !valid {
                error!("Inclusion proof for event {} does not verify", sequence_number);
                std::process::exit(1);
            }
        }

        Commands::Export {
            checkpoint_number,
            output,
        } => match output {
            Some(path) => {
                let bundle = writer.build_checkpoint_bundle(checkpoint_number).await?;
                std::fs::write(&path, serde_json::to_vec_pretty(&bundle)?)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                info!("Checkpoint {} bundle written to {}", checkpoint_number, path.display());
            }
            None => {
                let object = writer.export_checkpoint(checkpoint_number).await?;
                print_json(&object)?;
            }
        },

        Commands::RotateKey => {
            let key_id = writer.rotate_signing_key().await?;
            println!("{}", key_id);
        }
    }

    writer.database().close().await;
    Ok(())
}
