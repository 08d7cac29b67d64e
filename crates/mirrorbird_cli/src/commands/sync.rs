//! `sync:run` and `sync:daemon`.

use mirrorbird::schedule::Scheduler;
use mirrorbird::state::StateStore;

use super::{build_engine, CliError};
use crate::config::Config;

/// Execute exactly one run of the sync engine.
pub async fn handle_run(config: &Config) -> Result<(), CliError> {
    let engine = build_engine(config)?;
    let report = engine.run().await?;

    if report.skipped_by_lock {
        tracing::warn!("run skipped: another holder owns the job lock");
    } else {
        let uploaded: usize = report.accounts.iter().map(|a| a.uploaded).sum();
        let skipped: usize = report.accounts.iter().map(|a| a.skipped).sum();
        let failed: usize = report.accounts.iter().map(|a| a.failed).sum();
        tracing::info!(
            accounts = report.accounts.len(),
            uploaded,
            skipped,
            failed,
            "run finished"
        );
    }

    engine.state().close().await?;
    Ok(())
}

/// Start the scheduler loop; runs until the process is killed.
pub async fn handle_daemon(config: &Config) -> Result<(), CliError> {
    let engine = build_engine(config)?;
    let scheduler = Scheduler::new(engine, config.schedule_config());
    scheduler.start().await;
    Ok(())
}
