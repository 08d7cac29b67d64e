//! Environment-driven configuration.
//!
//! The daemon is configured entirely from environment variables (it runs in
//! a container); a `.env` file is loaded best-effort before parsing. Every
//! knob has the documented default except the source cookie bundle and sink
//! credentials, which are required.

use std::path::PathBuf;
use std::str::FromStr;

use chrono_tz::Tz;
use thiserror::Error;

use mirrorbird::engine::EngineConfig;
use mirrorbird::schedule::{parse_daily_at, ScheduleConfig};
use mirrorbird::sink::SinkCredentials;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} is required but not set")]
    Missing { name: &'static str },

    #[error("invalid {name}: {message}")]
    Invalid { name: &'static str, message: String },
}

impl ConfigError {
    fn invalid(name: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            name,
            message: message.into(),
        }
    }
}

/// Fully parsed daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Source account handles, in processing order, `@` stripped.
    pub accounts: Vec<String>,
    /// Raw cookie bundle JSON; parsed by the source adapter.
    pub cookies_json: String,
    pub web_bearer_token: Option<String>,

    pub sink_api_id: i64,
    pub sink_api_hash: String,
    pub sink_string_session: Option<String>,
    pub sink_channel_id: String,

    pub timezone: Tz,
    pub state_db_path: PathBuf,
    pub backfill_pages_per_run: u32,
    pub max_media_per_run: u32,
    pub download_tmp_dir: PathBuf,
    pub job_lock_ttl_seconds: i64,
    pub max_upload_video_bytes: u64,
    pub rate_limit_cooldown_seconds: i64,

    pub daily_at: (u32, u32),
    pub tick_seconds: u64,
    pub run_on_start: bool,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let timezone_raw = get_var_or("TZ", "Asia/Shanghai");
        let timezone = timezone_raw
            .parse::<Tz>()
            .map_err(|e| ConfigError::invalid("TZ", e.to_string()))?;

        let daily_at_raw = get_var_or("SYNC_DAILY_AT", "09:00");
        let daily_at = parse_daily_at(&daily_at_raw)
            .map_err(|e| ConfigError::invalid("SYNC_DAILY_AT", e.to_string()))?;

        Ok(Self {
            accounts: normalize_handles(&get_var_or("SOURCE_USERS", "")),
            cookies_json: get_var("SOURCE_COOKIES_JSON")?,
            web_bearer_token: get_opt_var("SOURCE_WEB_BEARER_TOKEN"),

            sink_api_id: parse_var("SINK_API_ID", get_var("SINK_API_ID")?)?,
            sink_api_hash: get_var("SINK_API_HASH")?,
            sink_string_session: get_opt_var("SINK_STRING_SESSION"),
            sink_channel_id: get_var("SINK_CHANNEL_ID")?,

            timezone,
            state_db_path: PathBuf::from(get_var_or("STATE_DB_PATH", "/data/state.sqlite")),
            backfill_pages_per_run: parse_var(
                "BACKFILL_PAGES_PER_RUN",
                get_var_or("BACKFILL_PAGES_PER_RUN", "10"),
            )?,
            max_media_per_run: parse_var(
                "MAX_MEDIA_PER_RUN",
                get_var_or("MAX_MEDIA_PER_RUN", "300"),
            )?,
            download_tmp_dir: PathBuf::from(get_var_or("DOWNLOAD_TMP_DIR", "/tmp/work")),
            job_lock_ttl_seconds: parse_var(
                "JOB_LOCK_TTL_SECONDS",
                get_var_or("JOB_LOCK_TTL_SECONDS", "3300"),
            )?,
            max_upload_video_bytes: parse_var(
                "MAX_UPLOAD_VIDEO_BYTES",
                get_var_or("MAX_UPLOAD_VIDEO_BYTES", "536870912"),
            )?,
            rate_limit_cooldown_seconds: parse_var(
                "SOURCE_RATE_LIMIT_COOLDOWN_SECONDS",
                get_var_or("SOURCE_RATE_LIMIT_COOLDOWN_SECONDS", "7200"),
            )?,

            daily_at,
            tick_seconds: parse_var(
                "SCHEDULER_TICK_SECONDS",
                get_var_or("SCHEDULER_TICK_SECONDS", "30"),
            )?,
            run_on_start: is_truthy(&get_var_or("SCHEDULER_RUN_ON_START", "")),
        })
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            accounts: self.accounts.clone(),
            download_dir: self.download_tmp_dir.clone(),
            backfill_pages_per_run: self.backfill_pages_per_run,
            max_media_per_run: self.max_media_per_run,
            job_lock_ttl_seconds: self.job_lock_ttl_seconds,
            max_upload_video_bytes: self.max_upload_video_bytes,
            rate_limit_cooldown_seconds: self.rate_limit_cooldown_seconds,
        }
    }

    pub fn schedule_config(&self) -> ScheduleConfig {
        ScheduleConfig {
            timezone: self.timezone,
            daily_at: self.daily_at,
            tick_seconds: self.tick_seconds,
            run_on_start: self.run_on_start,
        }
    }

    pub fn sink_credentials(&self) -> SinkCredentials {
        SinkCredentials {
            api_id: self.sink_api_id,
            api_hash: self.sink_api_hash.clone(),
            string_session: self.sink_string_session.clone(),
            channel_id: self.sink_channel_id.clone(),
        }
    }
}

fn get_var(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::Missing { name })
}

fn get_opt_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn get_var_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_var<T>(name: &'static str, raw: String) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e| ConfigError::invalid(name, format!("{e} (got {raw:?})")))
}

/// Truthy values accepted for boolean switches.
pub fn is_truthy(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Split a comma-separated handle list, trimming and stripping leading `@`.
pub fn normalize_handles(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .map(|h| h.strip_prefix('@').unwrap_or(h))
        .filter(|h| !h.is_empty())
        .map(String::from)
        .collect()
}
