use std::process;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{filter::LevelFilter, fmt};
use uuid::Uuid;

use quaestor_app::cli::{
    AdminArgs, AdminCommands, BudgetSetArgs, Cli, Commands, DocumentsArgs, IngestArgs,
    RestoreArgs, StoreCreateArgs, StoreDeleteArgs, UserAddArgs, WatchdogArgs, WorkerArgs,
};
use quaestor_app::config;
use quaestor_app::error::AppError;
use quaestor_app::server;
use quaestor_app::services::watchdog::{self, WatchdogConfig};
use quaestor_app::services::{
    build_app_context, run_ingestion, AppContext, CostMicros, Document, IngestJob, ResetMode,
};

const WORKER_IDLE_POLL: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let log_level = determine_log_level(&cli);
    init_tracing(log_level);

    if let Err(err) = run(cli).await {
        eprintln!("{err}");
        process::exit(1);
    }
}

fn init_tracing(level: LevelFilter) {
    let subscriber = fmt().with_max_level(level).with_target(false).finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("Tracing subscriber already set; skipping re-initialization.");
    }
}

fn determine_log_level(cli: &Cli) -> LevelFilter {
    match cli.command.as_ref() {
        Some(Commands::Serve(_)) | Some(Commands::Worker(_)) => match cli.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        },
        _ => match cli.verbose {
            0 => LevelFilter::OFF,
            1 => LevelFilter::INFO,
            2 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        },
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    match cli.command {
        Some(Commands::Serve(_)) => {
            let settings = config::load()?;
            let ctx = build_app_context(settings)?;
            server::serve(ctx).await?;
        }
        Some(Commands::Worker(args)) => {
            let settings = config::load()?;
            let ctx = build_app_context(settings)?;
            run_worker(ctx, args).await?;
        }
        Some(Commands::Watchdog(args)) => {
            let settings = config::load()?;
            let ctx = build_app_context(settings)?;
            run_watchdog_once(&ctx, &args)?;
        }
        Some(Commands::Admin(args)) => {
            let settings = config::load()?;
            let ctx = build_app_context(settings)?;
            run_admin(ctx, args).await?;
        }
        None => {
            Cli::print_help();
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

async fn run_worker(ctx: Arc<AppContext>, args: WorkerArgs) -> Result<(), AppError> {
    let limit = args.limit.max(1);
    tracing::info!(
        event = "worker_start",
        limit,
        once = args.once,
        watchdog_cadence_minutes = ctx.settings.watchdog.cron_minutes
    );

    let cadence = Duration::from_secs(ctx.settings.watchdog.cron_minutes.max(1) * 60);
    let mut watchdog_tick = tokio::time::interval_at(tokio::time::Instant::now() + cadence, cadence);

    loop {
        let drained = drain_queue(&ctx, limit).await?;
        if args.once {
            tracing::info!(event = "worker_drained_once", processed = drained);
            return Ok(());
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(event = "worker_shutdown");
                return Ok(());
            }
            _ = watchdog_tick.tick() => {
                let config = WatchdogConfig {
                    ttl_minutes: ctx.settings.watchdog.ttl_minutes,
                };
                if let Err(err) =
                    watchdog::sweep_stuck_documents(&ctx.catalog, &config, ResetMode::Fail)
                {
                    tracing::error!(event = "watchdog_sweep_failed", error = %err);
                }
            }
            _ = tokio::time::sleep(WORKER_IDLE_POLL) => {}
        }
    }
}

/// Claim up to `limit` jobs and run each on a blocking thread. The job row is
/// removed only after a terminal outcome; metadata-store failures (and
/// panics) leave it behind for redelivery.
async fn drain_queue(ctx: &Arc<AppContext>, limit: usize) -> Result<usize, AppError> {
    let claimed = {
        let queue = ctx.queue.clone();
        tokio::task::spawn_blocking(move || queue.claim_pending(limit))
            .await
            .map_err(|err| AppError::TaskAborted(err.to_string()))??
    };

    let mut processed = 0_usize;
    for job in claimed {
        let job_id = job.job_id.clone();
        let outcome = {
            let ctx = ctx.clone();
            tokio::task::spawn_blocking(move || run_ingestion(&ctx, &job)).await
        };
        match outcome {
            Ok(Ok(disposition)) => {
                tracing::info!(event = "ingest_job_complete", job_id = %job_id, disposition = ?disposition);
                ctx.queue.remove(&job_id)?;
                processed += 1;
            }
            Ok(Err(err)) => {
                tracing::warn!(
                    event = "ingest_job_deferred",
                    job_id = %job_id,
                    error = %err,
                    "metadata store error; leaving job for redelivery"
                );
            }
            Err(join_err) => {
                tracing::error!(
                    event = "ingest_job_panicked",
                    job_id = %job_id,
                    error = %join_err,
                    "leaving job for redelivery"
                );
            }
        }
    }
    Ok(processed)
}

fn run_watchdog_once(ctx: &AppContext, args: &WatchdogArgs) -> Result<(), AppError> {
    let config = WatchdogConfig {
        ttl_minutes: ctx.settings.watchdog.ttl_minutes,
    };
    let mode = if args.requeue {
        ResetMode::Requeue
    } else {
        ResetMode::Fail
    };
    let report = watchdog::sweep_stuck_documents(&ctx.catalog, &config, mode)?;
    if report.is_empty() {
        println!("no stuck documents");
    } else {
        println!("reset {} document(s):", report.reset.len());
        for id in &report.reset {
            println!("  - {id}");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Admin
// ---------------------------------------------------------------------------

async fn run_admin(ctx: Arc<AppContext>, args: AdminArgs) -> Result<(), AppError> {
    match args.command {
        AdminCommands::UserAdd(sub) => admin_user_add(&ctx, sub),
        AdminCommands::StoreCreate(sub) => admin_store_create(ctx, sub).await,
        AdminCommands::StoreDelete(sub) => admin_store_delete(ctx, sub).await,
        AdminCommands::Restore(sub) => admin_restore(&ctx, sub),
        AdminCommands::BudgetSet(sub) => admin_budget_set(&ctx, sub),
        AdminCommands::Ingest(sub) => admin_ingest(&ctx, sub),
        AdminCommands::Documents(sub) => admin_documents(&ctx, sub),
    }
}

fn admin_user_add(ctx: &AppContext, args: UserAddArgs) -> Result<(), AppError> {
    let user = ctx.catalog.create_user(&args.email)?;
    println!("user_id\t{}", user.id);
    println!("api_token\t{}", user.api_token);
    Ok(())
}

async fn admin_store_create(ctx: Arc<AppContext>, args: StoreCreateArgs) -> Result<(), AppError> {
    ctx.catalog
        .get_user(&args.user_id)?
        .ok_or_else(|| AppError::UserNotFound(args.user_id.clone()))?;

    // Remote call is blocking; keep it off the runtime threads.
    let fs_name = {
        let rag = ctx.rag.clone();
        let display_name = args.display_name.clone();
        tokio::task::spawn_blocking(move || rag.create_store(&display_name))
            .await
            .map_err(|err| AppError::TaskAborted(err.to_string()))??
    };

    let store = ctx
        .catalog
        .create_store(&args.user_id, &args.display_name, &fs_name)?;
    println!("store_id\t{}", store.id);
    println!("fs_name\t{}", store.fs_name);
    Ok(())
}

async fn admin_store_delete(ctx: Arc<AppContext>, args: StoreDeleteArgs) -> Result<(), AppError> {
    let store = ctx.catalog.soft_delete_store(&args.store_id, None)?;

    // Remote cleanup is best-effort; the soft delete stands regardless.
    let fs_name = store.fs_name.clone();
    let rag = ctx.rag.clone();
    let remote = tokio::task::spawn_blocking(move || rag.delete_store(&fs_name)).await;
    match remote {
        Ok(Ok(())) => println!("deleted {} (remote cleaned up)", store.id),
        Ok(Err(err)) => {
            tracing::warn!(event = "store_remote_delete_failed", store_id = %store.id, error = %err);
            println!("deleted {} (remote cleanup failed; see logs)", store.id);
        }
        Err(_) => println!("deleted {} (remote cleanup aborted)", store.id),
    }
    Ok(())
}

fn admin_restore(ctx: &AppContext, args: RestoreArgs) -> Result<(), AppError> {
    if let Some(store_id) = &args.store {
        let store = ctx.catalog.restore_store(store_id)?;
        println!("restored store {}", store.id);
        return Ok(());
    }
    if let Some(document_id) = &args.document {
        let document = ctx.catalog.restore_document(document_id)?;
        println!("restored document {}", document.id);
        return Ok(());
    }
    println!("nothing to restore: pass --store or --document");
    Ok(())
}

fn admin_budget_set(ctx: &AppContext, args: BudgetSetArgs) -> Result<(), AppError> {
    ctx.catalog
        .get_user(&args.user_id)?
        .ok_or_else(|| AppError::UserNotFound(args.user_id.clone()))?;
    let limit = CostMicros::from_usd(args.monthly_limit_usd);
    ctx.ledger.set_budget(&args.user_id, limit)?;
    println!("budget for {} set to {limit}", args.user_id);
    Ok(())
}

/// Register a local file for ingestion: copy it into the upload area, create
/// the PENDING document row, and enqueue the durable job.
fn admin_ingest(ctx: &AppContext, args: IngestArgs) -> Result<(), AppError> {
    let store = ctx
        .catalog
        .get_store(&args.store_id)?
        .filter(|store| !store.is_deleted())
        .ok_or_else(|| AppError::StoreNotFound(args.store_id.clone()))?;

    let metadata = std::fs::metadata(&args.file).map_err(|source| AppError::Io {
        path: args.file.clone(),
        source,
    })?;
    let filename = args
        .file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    let mime_type = mime_guess::from_path(&args.file)
        .first()
        .map(|mime| mime.essence_str().to_string());

    let staged = ctx
        .paths
        .uploads_dir()?
        .join(format!("{}-{filename}", Uuid::new_v4().simple()));
    std::fs::copy(&args.file, &staged).map_err(|source| AppError::Io {
        path: staged.clone(),
        source,
    })?;

    let document = Document::new(
        &store.id,
        &filename,
        args.display_name.clone(),
        metadata.len(),
        mime_type,
    );
    ctx.catalog.insert_document(&document)?;
    ctx.queue.enqueue(&IngestJob::new(
        &store.id,
        &document.id,
        staged.to_string_lossy().into_owned(),
    ))?;

    println!("document_id\t{}", document.id);
    println!("status\tPENDING (queued)");
    Ok(())
}

fn admin_documents(ctx: &AppContext, args: DocumentsArgs) -> Result<(), AppError> {
    let documents = ctx.catalog.list_documents(&args.store_id)?;
    if documents.is_empty() {
        println!("no documents in store {}", args.store_id);
        return Ok(());
    }
    println!("id\tstatus\tfilename\tlast_error");
    for document in documents {
        println!(
            "{}\t{:?}\t{}\t{}",
            document.id,
            document.status,
            document.filename,
            document.last_error.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}
