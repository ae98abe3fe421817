use std::path::PathBuf;

use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};

/// Top-level CLI entry point.
#[derive(Debug, Parser)]
#[command(
    name = "quaestor",
    version,
    author,
    about = "Quaestor grounded-answers service"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
    /// Increase logging verbosity (-v, -vv, -vvv).
    #[arg(global = true, short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub fn print_help() {
        let mut cmd = Cli::command();
        let _ = cmd.print_help();
        println!();
    }
}

/// Supported subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the Quaestor HTTP server.
    Serve(ServeArgs),
    /// Run the ingestion worker (drains the job queue, hosts the watchdog).
    Worker(WorkerArgs),
    /// Sweep documents stuck in RUNNING past the TTL, once.
    Watchdog(WatchdogArgs),
    /// Administrative operations (users, stores, budgets, uploads).
    Admin(AdminArgs),
}

#[derive(Debug, Args)]
pub struct ServeArgs;

#[derive(Debug, Args)]
pub struct WorkerArgs {
    /// Drain the queue once and exit instead of looping.
    #[arg(long)]
    pub once: bool,
    /// Maximum jobs claimed per drain cycle.
    #[arg(long, default_value_t = 10)]
    pub limit: usize,
}

#[derive(Debug, Args)]
pub struct WatchdogArgs {
    /// Reset stuck documents to PENDING for a fresh attempt instead of
    /// marking them ERROR.
    #[arg(long)]
    pub requeue: bool,
}

#[derive(Debug, Args)]
pub struct AdminArgs {
    #[command(subcommand)]
    pub command: AdminCommands,
}

#[derive(Debug, Subcommand)]
pub enum AdminCommands {
    /// Create a user and print its API token.
    UserAdd(UserAddArgs),
    /// Create a remote store and register it for a user.
    StoreCreate(StoreCreateArgs),
    /// Soft-delete a store and best-effort delete its remote namespace.
    StoreDelete(StoreDeleteArgs),
    /// Clear the soft-delete marker on a store or document.
    Restore(RestoreArgs),
    /// Set a user's monthly budget in USD.
    BudgetSet(BudgetSetArgs),
    /// Register a local file for ingestion into a store.
    Ingest(IngestArgs),
    /// List a store's documents and their ingestion status.
    Documents(DocumentsArgs),
}

#[derive(Debug, Args)]
pub struct UserAddArgs {
    /// Email address for the new user.
    pub email: String,
}

#[derive(Debug, Args)]
pub struct StoreCreateArgs {
    /// Owning user id.
    pub user_id: String,
    /// Human-readable store name.
    pub display_name: String,
}

#[derive(Debug, Args)]
pub struct StoreDeleteArgs {
    /// Store id to soft-delete.
    pub store_id: String,
}

#[derive(Debug, Args)]
pub struct RestoreArgs {
    /// Restore this store (mutually exclusive with --document).
    #[arg(long, conflicts_with = "document")]
    pub store: Option<String>,
    /// Restore this document.
    #[arg(long)]
    pub document: Option<String>,
}

#[derive(Debug, Args)]
pub struct BudgetSetArgs {
    /// User id the budget applies to.
    pub user_id: String,
    /// Monthly limit in USD.
    pub monthly_limit_usd: f64,
}

#[derive(Debug, Args)]
pub struct IngestArgs {
    /// Target store id.
    pub store_id: String,
    /// Local file to upload and index.
    pub file: PathBuf,
    /// Optional display name shown in the remote store.
    #[arg(long)]
    pub display_name: Option<String>,
}

#[derive(Debug, Args)]
pub struct DocumentsArgs {
    /// Store id to list.
    pub store_id: String,
}
