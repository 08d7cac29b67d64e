//! One handler per CLI subcommand.

pub mod auth;
pub mod cookies;
pub mod health;
pub mod sync;

use mirrorbird::download::HttpDownloader;
use mirrorbird::engine::SyncEngine;
use mirrorbird::sink::TelegramSink;
use mirrorbird::source::{CookieBundle, GraphqlSourceClient};
use mirrorbird::state::SqliteStore;

use crate::config::Config;

pub type CliError = Box<dyn std::error::Error>;

/// Wire the production adapters into an engine.
pub(crate) fn build_engine(
    config: &Config,
) -> Result<SyncEngine<SqliteStore, GraphqlSourceClient, TelegramSink, HttpDownloader>, CliError> {
    if let Some(parent) = config.state_db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let store = SqliteStore::open(&config.state_db_path)?;
    let source = build_source(config)?;
    let sink = TelegramSink::new(config.sink_credentials())?;
    Ok(SyncEngine::new(
        store,
        source,
        sink,
        HttpDownloader::new(),
        config.engine_config(),
    ))
}

pub(crate) fn build_source(config: &Config) -> Result<GraphqlSourceClient, CliError> {
    let bundle = CookieBundle::parse(&config.cookies_json)?;
    Ok(GraphqlSourceClient::new(
        bundle,
        config.web_bearer_token.clone(),
    )?)
}
