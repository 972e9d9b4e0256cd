//! Remitflow operator CLI
//!
//! Usage:
//!   remitflow_admin evaluate <bucket>             - Force threshold evaluation
//!   remitflow_admin approve <bucket>              - Approve a pending bucket
//!   remitflow_admin reject <bucket>               - Send a pending bucket back to accumulation
//!   remitflow_admin override <bucket>             - Release regardless of thresholds
//!   remitflow_admin redrive <bucket>              - Retry a failed release
//!   remitflow_admin complete <bucket>             - Record successful file generation
//!   remitflow_admin fail <bucket> -m <message>    - Record failed file generation
//!   remitflow_admin show <bucket>                 - Bucket with its audit trails
//!   remitflow_admin reset-checkpoint <pos> [seq]  - Replay the feed from a position
//!   remitflow_admin mark-all-unprocessed          - Replay the whole feed

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use log::info;
use remitflow::pipeline::{
    config::PipelineConfig,
    db::SqliteStore,
    engine::PipelineEngine,
    ingestion::FeedConsumer,
    release::LogReleaseSink,
    store::BucketStore,
    types::{Actor, Bucket, BucketId, FeedPosition},
};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "remitflow_admin")]
#[command(about = "Operator actions on remitflow buckets and the feed checkpoint")]
#[command(version)]
struct Cli {
    /// SQLite database path (overrides REMITFLOW_DB_PATH)
    #[arg(long)]
    db: Option<String>,

    /// Operator name recorded in the approval log
    #[arg(short, long, default_value = "operator")]
    actor: String,

    /// Roles held by the operator (comma separated)
    #[arg(short, long, value_delimiter = ',')]
    roles: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Re-check configuration and thresholds of an open bucket
    Evaluate { bucket: BucketId },

    /// PENDING_APPROVAL -> GENERATING
    Approve {
        bucket: BucketId,
        #[arg(short, long)]
        comments: Option<String>,
        /// Unix seconds at which generation should run
        #[arg(long)]
        scheduled_for: Option<i64>,
    },

    /// PENDING_APPROVAL -> ACCUMULATING
    Reject {
        bucket: BucketId,
        #[arg(short, long)]
        comments: Option<String>,
    },

    /// ACCUMULATING / PENDING_APPROVAL -> GENERATING
    Override {
        bucket: BucketId,
        #[arg(short, long)]
        comments: Option<String>,
    },

    /// FAILED -> GENERATING
    Redrive {
        bucket: BucketId,
        #[arg(short, long)]
        comments: Option<String>,
    },

    /// GENERATING -> COMPLETED
    Complete { bucket: BucketId },

    /// GENERATING -> FAILED
    Fail {
        bucket: BucketId,
        #[arg(short, long)]
        message: String,
    },

    /// Print a bucket, its processing log and its approval log
    Show { bucket: BucketId },

    /// Move the consumer checkpoint to (position, sequence)
    ResetCheckpoint {
        position: i64,
        #[arg(default_value_t = 0)]
        sequence: i64,
    },

    /// Rewind every consumer to the start of the feed
    MarkAllUnprocessed,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = PipelineConfig::from_env();
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    let store = Arc::new(SqliteStore::open(&config.db_path)?);
    let engine = Arc::new(PipelineEngine::new(
        store.clone(),
        store.clone(),
        Arc::new(LogReleaseSink),
        &config,
    ));

    let roles: Vec<&str> = cli.roles.iter().map(String::as_str).collect();
    let actor = Actor::new(cli.actor, &roles);
    let lifecycle = engine.lifecycle();

    match cli.command {
        Commands::Evaluate { bucket } => {
            print_bucket(&engine.evaluate_thresholds(bucket).await?);
        }
        Commands::Approve {
            bucket,
            comments,
            scheduled_for,
        } => {
            let updated = lifecycle
                .approve(bucket, &actor, comments.as_deref(), scheduled_for)
                .await?;
            print_bucket(&updated);
        }
        Commands::Reject { bucket, comments } => {
            print_bucket(&lifecycle.reject(bucket, &actor, comments.as_deref()).await?);
        }
        Commands::Override { bucket, comments } => {
            let updated = lifecycle
                .override_release(bucket, &actor, comments.as_deref())
                .await?;
            print_bucket(&updated);
        }
        Commands::Redrive { bucket, comments } => {
            print_bucket(&lifecycle.redrive(bucket, &actor, comments.as_deref()).await?);
        }
        Commands::Complete { bucket } => {
            print_bucket(&lifecycle.complete_generation(bucket).await?);
        }
        Commands::Fail { bucket, message } => {
            print_bucket(&lifecycle.fail_generation(bucket, &message).await?);
        }
        Commands::Show { bucket } => {
            let Some(found) = store.get_bucket(bucket).await? else {
                return Err(format!("bucket {} not found", bucket).into());
            };
            print_bucket(&found);

            println!("\nProcessing log:");
            for entry in store.processing_log(bucket).await? {
                println!("  {}", serde_json::to_string(&entry)?);
            }
            println!("\nApproval log:");
            for entry in store.approval_log(bucket).await? {
                println!("  {}", serde_json::to_string(&entry)?);
            }
        }
        Commands::ResetCheckpoint { position, sequence } => {
            let consumer = FeedConsumer::new(store.clone(), store.clone(), engine.clone(), &config);
            let checkpoint = consumer
                .reset_checkpoint(FeedPosition::new(position, sequence))
                .await?;
            info!(
                "✅ Checkpoint of '{}' now at {}",
                checkpoint.consumer_id, checkpoint.last_position
            );
        }
        Commands::MarkAllUnprocessed => {
            let consumer = FeedConsumer::new(store.clone(), store.clone(), engine.clone(), &config);
            let rewound = consumer.mark_all_unprocessed().await?;
            info!("✅ {} consumer checkpoint(s) rewound to the start of the feed", rewound);
        }
    }

    Ok(())
}

fn print_bucket(bucket: &Bucket) {
    match serde_json::to_string_pretty(bucket) {
        Ok(json) => println!("{}", json),
        Err(_) => println!("{:?}", bucket),
    }
}
