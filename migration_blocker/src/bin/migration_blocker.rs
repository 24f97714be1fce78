//
// Main entry point for the migration_blocker executable
//
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;
use tracing::*;
use utils::logging::{self, LogFormat};

use migration_blocker::defaults::DEFAULT_GC_INTERVAL;
use migration_blocker::donor::MigrationDonor;
use migration_blocker::gc;
use migration_blocker::record_store::{FileMigrationStore, MigrationStore};
use migration_blocker::{BlockerConf, LinearizableReadPolicy};

#[derive(Parser)]
#[command(author, version, about = "Donor-side access blocker for partition migrations")]
struct Args {
    /// Path to the data directory.
    #[arg(short = 'D', long, default_value = "./")]
    datadir: Utf8PathBuf,
    /// Do not wait for changes to be written safely to disk. Unsafe.
    #[arg(short, long)]
    no_sync: bool,
    /// How often to look for forgotten migrations to remove.
    #[arg(long, value_parser = humantime::parse_duration, default_value = DEFAULT_GC_INTERVAL)]
    gc_interval: Duration,
    /// What linearizable reads do while a migration is blocking: block or reject.
    #[arg(long, default_value = "block")]
    linearizable_reads: LinearizableReadPolicy,
    /// Format for logging, either 'plain' or 'json'.
    #[arg(long, default_value = "plain")]
    log_format: String,
    /// Start as a secondary: gate operations but do not accept orchestrator
    /// calls or collect garbage.
    #[arg(long)]
    secondary: bool,
    /// Dump the migration records found in the data directory as JSON and exit.
    #[arg(long)]
    dump_records: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let conf = BlockerConf {
        workdir: args.datadir.clone(),
        no_sync: args.no_sync,
        gc_interval: args.gc_interval,
        linearizable_read_policy: args.linearizable_reads,
        log_format: LogFormat::from_config(&args.log_format)?,
    };

    if args.dump_records {
        let store = FileMigrationStore::open(&conf.migrations_dir(), true)?;
        let records: Vec<_> = store.records().values().collect();
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    logging::init(conf.log_format, logging::Output::Stdout)?;
    let _panic_hook_guard = logging::replace_panic_hook_with_tracing_panic_hook();
    info!("version: {}", env!("CARGO_PKG_VERSION"));

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?
        .block_on(start_blocker(conf, !args.secondary))
}

async fn start_blocker(conf: BlockerConf, primary: bool) -> anyhow::Result<()> {
    let migrations_dir = conf.migrations_dir();
    info!("loading migration records from {migrations_dir}");
    let store = FileMigrationStore::open(&migrations_dir, conf.no_sync)
        .with_context(|| format!("failed to open record store at {migrations_dir}"))?;

    let donor = Arc::new(MigrationDonor::new(conf, store));
    let stats = if primary {
        donor.step_up().await?
    } else {
        donor.recover().await?
    };
    info!("ready as {}: {stats}", donor.role());

    let shutdown = CancellationToken::new();
    let gc_task = tokio::spawn(gc::task_main(Arc::clone(&donor), shutdown.clone()));

    let mut sigint = tokio::signal::unix::signal(SignalKind::interrupt())?;
    let mut sigquit = tokio::signal::unix::signal(SignalKind::quit())?;
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    info!("terminating on signal");

    shutdown.cancel();
    match gc_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("migration gc task failed: {e:#}"),
        Err(e) => error!("error joining migration gc task: {e}"),
    }

    let status = serde_json::to_string(&donor.status())?;
    info!("final blocker status: {status}");
    Ok(())
}
