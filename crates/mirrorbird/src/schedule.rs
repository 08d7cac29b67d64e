//! Daily wall-clock scheduler.
//!
//! A single-threaded tick loop that fires the engine once per day at a
//! configured local time in an IANA timezone. At-most-one run is in flight:
//! the in-memory flag guards this process, the engine's job lock guards
//! everything else. A run skipped because of lock contention leaves the
//! day's bookkeeping untouched so a later tick retries.

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use thiserror::Error;
use tokio::time::MissedTickBehavior;

use crate::download::Downloader;
use crate::engine::SyncEngine;
use crate::sink::SinkClient;
use crate::source::SourceClient;
use crate::state::StateStore;

/// Operator hint emitted when a failure smells like rejected credentials.
pub const AUTH_FAILURE_HINT: &str = "source credentials look expired or rejected (HTTP 401/403): \
     refresh the cookie bundle in SOURCE_COOKIES_JSON and restart";

#[derive(Debug, Error)]
#[error("invalid daily-at time {raw:?}: expected HH:MM")]
pub struct InvalidDailyAt {
    raw: String,
}

/// Parse a 24-hour `"HH:MM"` trigger time.
pub fn parse_daily_at(raw: &str) -> Result<(u32, u32), InvalidDailyAt> {
    let invalid = || InvalidDailyAt {
        raw: raw.to_string(),
    };
    let (hour, minute) = raw.split_once(':').ok_or_else(invalid)?;
    let hour: u32 = hour.parse().map_err(|_| invalid())?;
    let minute: u32 = minute.parse().map_err(|_| invalid())?;
    if hour > 23 || minute > 59 {
        return Err(invalid());
    }
    Ok((hour, minute))
}

/// Whether an error message pattern-matches a credential problem worth an
/// operator hint.
#[must_use]
pub fn looks_like_auth_failure(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    message.contains("401")
        || message.contains("403")
        || lower.contains("unauthorized")
        || lower.contains("forbidden")
        || lower.contains("authentication")
}

/// Scheduler knobs; defaults match the daemon's documented environment.
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub timezone: Tz,
    /// `(hour, minute)` local trigger time.
    pub daily_at: (u32, u32),
    pub tick_seconds: u64,
    /// Perform one run before entering the tick loop.
    pub run_on_start: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::Asia::Shanghai,
            daily_at: (9, 0),
            tick_seconds: 30,
            run_on_start: false,
        }
    }
}

/// What a tick decided to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickDecision {
    Run,
    AlreadyRunning,
    NotDue,
    AlreadyRanToday,
}

fn decide(
    is_running: bool,
    date_key: &str,
    hour: u32,
    minute: u32,
    daily_at: (u32, u32),
    last_run_date_key: Option<&str>,
) -> TickDecision {
    if is_running {
        return TickDecision::AlreadyRunning;
    }
    if (hour, minute) < daily_at {
        return TickDecision::NotDue;
    }
    if last_run_date_key == Some(date_key) {
        return TickDecision::AlreadyRanToday;
    }
    TickDecision::Run
}

/// Project an instant into the configured zone as `(date_key, hour, minute)`.
fn zoned_parts(instant: DateTime<Utc>, timezone: &Tz) -> (String, u32, u32) {
    let local = instant.with_timezone(timezone);
    (
        local.format("%Y-%m-%d").to_string(),
        local.hour(),
        local.minute(),
    )
}

/// Drives the engine from a daily wall-clock trigger.
pub struct Scheduler<S, C, K, D> {
    engine: SyncEngine<S, C, K, D>,
    config: ScheduleConfig,
    is_running: bool,
    last_run_date_key: Option<String>,
}

impl<S, C, K, D> Scheduler<S, C, K, D>
where
    S: StateStore,
    C: SourceClient,
    K: SinkClient,
    D: Downloader,
{
    pub fn new(engine: SyncEngine<S, C, K, D>, config: ScheduleConfig) -> Self {
        Self {
            engine,
            config,
            is_running: false,
            last_run_date_key: None,
        }
    }

    /// Run until the process is killed.
    pub async fn start(mut self) {
        tracing::info!(
            timezone = %self.config.timezone,
            daily_at = %format!("{:02}:{:02}", self.config.daily_at.0, self.config.daily_at.1),
            tick_seconds = self.config.tick_seconds,
            "scheduler started"
        );

        if self.config.run_on_start {
            let (date_key, _, _) = zoned_parts(Utc::now(), &self.config.timezone);
            tracing::info!("startup run requested");
            self.execute(&date_key).await;
        }

        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(self.config.tick_seconds.max(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.tick().await;
        }
    }

    async fn tick(&mut self) {
        let (date_key, hour, minute) = zoned_parts(Utc::now(), &self.config.timezone);
        match decide(
            self.is_running,
            &date_key,
            hour,
            minute,
            self.config.daily_at,
            self.last_run_date_key.as_deref(),
        ) {
            TickDecision::AlreadyRunning => {
                tracing::warn!("previous run still in flight, skipping tick");
            }
            TickDecision::NotDue | TickDecision::AlreadyRanToday => {}
            TickDecision::Run => self.execute(&date_key).await,
        }
    }

    /// Run the engine once, updating the day bookkeeping. A lock-skipped run
    /// leaves `last_run_date_key` untouched so a later tick retries.
    async fn execute(&mut self, date_key: &str) {
        self.is_running = true;
        match self.engine.run().await {
            Ok(report) if report.skipped_by_lock => {
                tracing::warn!("run skipped by job lock, will retry on a later tick");
            }
            Ok(report) => {
                self.last_run_date_key = Some(date_key.to_string());
                let uploaded: usize = report.accounts.iter().map(|a| a.uploaded).sum();
                let failed: usize = report.accounts.iter().map(|a| a.failed).sum();
                tracing::info!(date_key, uploaded, failed, "scheduled run finished");
            }
            Err(error) => {
                tracing::error!(%error, "scheduled run failed");
                if looks_like_auth_failure(&error.to_string()) {
                    tracing::error!("{AUTH_FAILURE_HINT}");
                }
            }
        }
        self.is_running = false;
    }
}
