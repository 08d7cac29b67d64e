//! `health:check` - probe the source adapter with the first configured
//! account and the sink adapter; exit non-zero on any failure.

use mirrorbird::sink::{SinkClient, TelegramSink};
use mirrorbird::source::SourceClient;

use super::{build_source, CliError};
use crate::config::Config;

pub async fn handle_health_check(config: &Config) -> Result<(), CliError> {
    let handle = config
        .accounts
        .first()
        .ok_or("health check needs at least one account in SOURCE_USERS")?;

    let source = build_source(config)?;
    source.health_check(handle).await?;
    println!("source: ok (@{handle} resolvable)");

    let sink = TelegramSink::new(config.sink_credentials())?;
    sink.health_check().await?;
    sink.disconnect().await?;
    println!("sink: ok");

    Ok(())
}
