//! Mirrorbird CLI - entry point for the daily media sync daemon.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use console::Term;
use tracing_subscriber::EnvFilter;

use mirrorbird::schedule::{looks_like_auth_failure, AUTH_FAILURE_HINT};

#[derive(Parser)]
#[command(name = "mirrorbird")]
#[command(version)]
#[command(about = "Mirrors media posts from public timelines into a private archive channel")]
#[command(
    long_about = "Mirrorbird ingests media-bearing posts from a set of public source-platform \
accounts once per day and republishes the media to a private archive channel. Progress is \
durable in a SQLite state file, media are never delivered twice, and rate-limited accounts \
cool down instead of failing the run."
)]
#[command(after_long_help = r#"ENVIRONMENT VARIABLES
    SOURCE_USERS                        Comma-separated handles (leading @ stripped)
    SOURCE_COOKIES_JSON                 JSON array of cookie entries (requires auth_token, ct0)
    SOURCE_WEB_BEARER_TOKEN             Optional bearer override, tried before built-ins
    SINK_API_ID, SINK_API_HASH          Sink credentials (compose the bot token)
    SINK_STRING_SESSION                 Reserved for the interactive bootstrap flow
    SINK_CHANNEL_ID                     Archive channel id or @name
    TZ                                  IANA timezone (default Asia/Shanghai)
    STATE_DB_PATH                       SQLite state file (default /data/state.sqlite)
    BACKFILL_PAGES_PER_RUN              Pages per fetch direction (default 10)
    MAX_MEDIA_PER_RUN                   Global media budget per run (default 300)
    DOWNLOAD_TMP_DIR                    Scratch directory (default /tmp/work)
    JOB_LOCK_TTL_SECONDS                Job lock TTL (default 3300)
    MAX_UPLOAD_VIDEO_BYTES              Video size cap (default 512 MiB)
    SOURCE_RATE_LIMIT_COOLDOWN_SECONDS  Per-account cooldown (default 7200)
    SYNC_DAILY_AT                       Daily trigger HH:MM (default 09:00)
    SCHEDULER_TICK_SECONDS              Tick interval (default 30)
    SCHEDULER_RUN_ON_START              Run once at startup (1/true/yes/on)
    APP_MODE                            daemon => default command is sync:daemon
"#)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute exactly one run of the sync engine and exit
    #[command(name = "sync:run")]
    SyncRun,
    /// Start the daily scheduler loop; run until killed
    #[command(name = "sync:daemon")]
    SyncDaemon,
    /// Validate sink credentials (the interactive session bootstrap lives elsewhere)
    #[command(name = "auth:telegram")]
    AuthTelegram,
    /// Probe the source adapter with the first configured account and the sink adapter
    #[command(name = "health:check")]
    HealthCheck,
    /// Parse the cookie bundle, probe the session, and print a report
    #[command(name = "cookies:check")]
    CookiesCheck,
}

/// Default command when none is given: `APP_MODE=daemon` selects the
/// scheduler loop, anything else a single run.
fn default_command() -> Commands {
    match std::env::var("APP_MODE").ok().as_deref() {
        Some("daemon") => Commands::SyncDaemon,
        _ => Commands::SyncRun,
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mirrorbird=info,mirrorbird_cli=info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(Term::stdout().is_term())
        .init();
}

async fn run(command: Commands) -> Result<(), commands::CliError> {
    let config = config::Config::from_env()?;

    match command {
        Commands::SyncRun => commands::sync::handle_run(&config).await,
        Commands::SyncDaemon => commands::sync::handle_daemon(&config).await,
        Commands::AuthTelegram => commands::auth::handle_auth_telegram(&config).await,
        Commands::HealthCheck => commands::health::handle_health_check(&config).await,
        Commands::CookiesCheck => commands::cookies::handle_cookies_check(&config).await,
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or_else(default_command);

    if let Err(error) = run(command).await {
        eprintln!("error: {error}");
        if looks_like_auth_failure(&error.to_string()) {
            eprintln!("hint: {AUTH_FAILURE_HINT}");
        }
        std::process::exit(1);
    }
}
