//! Operator cleanup utility for the long-term agentic memory engine.
//!
//! Two subcommands, both dry-run unless `--confirm` is passed:
//! `purge-user` deletes all entity data owned by a user's animas
//! (preserving the user row itself, which lives outside this crate's data
//! model); `purge-since` deletes every record created after a timestamp
//! across a fixed table list. Exit code 0 on success, non-zero on any
//! store error.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use ltam_core::ids::UserId;
use ltam_core::store::Store;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "ltam", version, about = "Operator CLI for the LTAM engine")]
struct Cli {
    /// Path to the SQLite database. Defaults to the platform data
    /// directory resolved by `ltam_core::config::default_database_path`.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Delete all entity data for one user's animas.
    PurgeUser {
        /// The user to purge, identified by id. (Spec's cleanup utility
        /// names this flag by email, but user accounts live outside this
        /// engine's data model — see DESIGN.md.)
        #[arg(long = "user-id")]
        user_id: Uuid,

        /// Actually delete rows. Without this flag, prints the row counts
        /// that would be deleted and exits without writing.
        #[arg(long)]
        confirm: bool,
    },

    /// Delete every record created after `cutoff` across a fixed table
    /// list.
    PurgeSince {
        /// RFC 3339 timestamp, e.g. 2026-01-15T00:00:00Z.
        #[arg(long)]
        cutoff: DateTime<Utc>,

        /// Actually delete rows. Without this flag, prints the row counts
        /// that would be deleted and exits without writing.
        #[arg(long)]
        confirm: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    let cli = Cli::parse();
    let db_path = match cli.db {
        Some(p) => p,
        None => ltam_core::config::default_database_path()?,
    };
    let store = Store::open(&db_path)?;

    match cli.command {
        Command::PurgeUser { user_id, confirm } => purge_user(&store, user_id, confirm),
        Command::PurgeSince { cutoff, confirm } => purge_since(&store, cutoff, confirm),
    }
}

fn purge_user(store: &Store, user_id: Uuid, confirm: bool) -> anyhow::Result<()> {
    let dry_run = !confirm;
    let counts = store.purge_user_data(UserId::from(user_id), dry_run)?;

    if dry_run {
        println!("Dry run — no rows deleted. Pass --confirm to execute.");
    } else {
        println!("Purged user {user_id}:");
    }
    println!("  animas:    {}", counts.animas);
    println!("  events:    {}", counts.events);
    println!("  memories:  {}", counts.memories);
    println!("  knowledge: {}", counts.knowledge);

    Ok(())
}

fn purge_since(store: &Store, cutoff: DateTime<Utc>, confirm: bool) -> anyhow::Result<()> {
    let dry_run = !confirm;
    let results = store.purge_since(cutoff, dry_run)?;

    if dry_run {
        println!("Dry run — no rows deleted. Pass --confirm to execute.");
    } else {
        println!("Purged all records created after {cutoff}:");
    }
    for (table, count) in results {
        println!("  {table}: {count}");
    }

    Ok(())
}
