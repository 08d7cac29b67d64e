//! Run summaries and their text rendering for the archive channel.

use chrono::{DateTime, SecondsFormat, Utc};

/// Outcome of one run of the sync engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// True when another holder owned the job lock and nothing ran.
    pub skipped_by_lock: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// One summary per configured account, in processing order.
    pub accounts: Vec<AccountSummary>,
}

/// Outcome of one account within a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSummary {
    pub handle: String,
    pub uploaded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub incremental_candidates: usize,
    pub incremental_selected: usize,
    pub backfill_candidates: usize,
    pub backfill_selected: usize,
    pub backfill_done: bool,
    pub cooldown_active: bool,
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl AccountSummary {
    /// All-zero summary for an account that did no work.
    #[must_use]
    pub fn empty(handle: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            uploaded: 0,
            skipped: 0,
            failed: 0,
            incremental_candidates: 0,
            incremental_selected: 0,
            backfill_candidates: 0,
            backfill_selected: 0,
            backfill_done: false,
            cooldown_active: false,
            cooldown_until: None,
        }
    }
}

fn timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Render the aggregated run report delivered after each run.
#[must_use]
pub fn render_report(report: &RunReport) -> String {
    let mut lines = vec![
        "Daily sync report".to_string(),
        format!("started:  {}", timestamp(report.started_at)),
        format!("finished: {}", timestamp(report.finished_at)),
    ];

    if report.skipped_by_lock {
        lines.push("skipped: another run holds the job lock".to_string());
        return lines.join("\n");
    }

    if report.accounts.is_empty() {
        lines.push("no accounts configured".to_string());
        return lines.join("\n");
    }

    for account in &report.accounts {
        if account.cooldown_active {
            let until = account
                .cooldown_until
                .map(timestamp)
                .unwrap_or_else(|| "unknown".to_string());
            lines.push(format!("@{}: in cooldown until {until}", account.handle));
            continue;
        }
        let mut line = format!(
            "@{}: uploaded {}, skipped {}, failed {} (incremental {}/{}, backfill {}/{})",
            account.handle,
            account.uploaded,
            account.skipped,
            account.failed,
            account.incremental_selected,
            account.incremental_candidates,
            account.backfill_selected,
            account.backfill_candidates,
        );
        if account.backfill_done {
            line.push_str(", backfill complete");
        }
        lines.push(line);
    }

    lines.join("\n")
}

/// Render the per-account failure notice for non-cooldown errors.
#[must_use]
pub fn render_account_failure(handle: &str, error: &impl std::fmt::Display) -> String {
    format!("Sync failed for @{handle}: {error}")
}
