//! Mirrorbird - a daily media sync daemon.
//!
//! Once per day the engine ingests media-bearing posts from a set of public
//! source-platform accounts and republishes the media to a private archive
//! channel, never delivering the same media twice. Progress is durable:
//! per-account cursors, a content-addressed dedupe registry, and a job lock
//! live in a single SQLite file, so runs survive restarts and pick up where
//! they left off.
//!
//! # Architecture
//!
//! The engine orchestrates three adapters behind traits, so tests can swap
//! in fakes:
//!
//! - [`source::SourceClient`] - authenticated, paged timeline retrieval with
//!   host failover and credential rotation.
//! - [`sink::SinkClient`] - chunked media-group delivery and text reports.
//! - [`state::StateStore`] - cursors, dedupe registry, and the job lock.
//!
//! [`schedule::Scheduler`] drives one run per local day in a configured
//! IANA timezone.
//!
//! # Example
//!
//! ```ignore
//! use mirrorbird::{
//!     download::HttpDownloader,
//!     engine::{EngineConfig, SyncEngine},
//!     sink::{SinkCredentials, TelegramSink},
//!     source::{CookieBundle, GraphqlSourceClient},
//!     state::SqliteStore,
//! };
//!
//! let state = SqliteStore::open("/data/state.sqlite")?;
//! let source = GraphqlSourceClient::new(CookieBundle::parse(&cookies_json)?, None)?;
//! let sink = TelegramSink::new(credentials)?;
//! let engine = SyncEngine::new(state, source, sink, HttpDownloader::new(), config);
//! let report = engine.run().await?;
//! ```

pub mod download;
pub mod engine;
pub mod retry;
pub mod schedule;
pub mod sink;
pub mod source;
pub mod state;

pub use engine::{media_key, EngineConfig, EngineError, RunReport, SyncEngine};
pub use schedule::{ScheduleConfig, Scheduler};
