//! `auth:telegram` - sink credential bootstrap.
//!
//! The interactive user-session flow (producing SINK_STRING_SESSION) lives
//! outside this binary. This command validates what it can: the configured
//! bot credentials and channel reachability.

use mirrorbird::sink::{SinkClient, TelegramSink};

use super::CliError;
use crate::config::Config;

pub async fn handle_auth_telegram(config: &Config) -> Result<(), CliError> {
    let sink = TelegramSink::new(config.sink_credentials())?;
    sink.health_check().await?;
    println!("sink credentials: ok (SINK_API_ID/SINK_API_HASH accepted)");

    if config.sink_string_session.is_some() {
        println!("SINK_STRING_SESSION: present");
    } else {
        println!(
            "SINK_STRING_SESSION: not set - generate one with an interactive \
             user-session tool if the deployment needs it"
        );
    }
    sink.disconnect().await?;
    Ok(())
}
