//! RTC Signal Server
//!
//! WebSocket signaling relay for one-to-one WebRTC calls.
//!
//! # Usage
//!
//! ```bash
//! # In-memory mode (default)
//! rtc-signal --port 8080 --token-secret "$SECRET"
//!
//! # With a SQLite session journal
//! rtc-signal --port 8080 --db /var/lib/rtc-signal/journal.db
//!
//! # Issue a token for a user (for testing embeds)
//! rtc-signal --token-secret "$SECRET" issue-token u1
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rtc_core::crypto::TokenKey;
use rtc_core::{unix_now, Config, Validator};
use rtc_signal::{Hub, SessionRegistry, SignalServer, SignalingRelay, Storage};

/// Evicted sessions are kept in the journal this long (7 days)
const JOURNAL_RETENTION_SECS: u64 = 7 * 24 * 3600;

#[derive(Parser, Debug)]
#[command(name = "rtc-signal")]
#[command(about = "Signaling relay for embedded WebRTC calls")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Config file (default: platform config dir)
    #[arg(short, long, env = "RTC_SIGNAL_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "RTC_SIGNAL_PORT")]
    port: Option<u16>,

    /// Bind address
    #[arg(short, long, env = "RTC_SIGNAL_BIND")]
    bind: Option<String>,

    /// SQLite journal path (optional, no journal if not specified)
    #[arg(short, long, env = "RTC_SIGNAL_DB")]
    db: Option<PathBuf>,

    /// Seconds without signaling before a session is finalized
    #[arg(long, env = "RTC_SIGNAL_IDLE_TIMEOUT")]
    idle_timeout: Option<u64>,

    /// Shared secret for auth tokens
    #[arg(long, env = "RTC_TOKEN_SECRET", hide_env_values = true)]
    token_secret: Option<String>,

    /// Log as JSON lines
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a token for a user
    IssueToken {
        /// User id the token is bound to
        user_id: String,

        /// Lifetime in seconds (default: auth.token_ttl_secs)
        #[arg(long)]
        ttl: Option<u64>,
    },

    /// Print a sample config file
    SampleConfig,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let (plain, json) = if args.json {
        (None, Some(fmt::layer().json()))
    } else {
        (Some(fmt::layer()), None)
    };
    tracing_subscriber::registry()
        .with(plain)
        .with(json)
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let mut config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };
    if let Some(port) = args.port {
        config.signal.port = port;
    }
    if let Some(bind) = &args.bind {
        config.signal.bind = bind.parse()?;
    }
    if let Some(db) = &args.db {
        config.signal.db_path = Some(db.clone());
    }
    if let Some(idle) = args.idle_timeout {
        config.signal.idle_timeout_secs = idle;
    }
    if let Some(secret) = &args.token_secret {
        config.auth.token_secret = Some(secret.clone());
    }

    let key = match &config.auth.token_secret {
        Some(secret) => TokenKey::from_secret(secret),
        None => {
            warn!("No token secret configured; using a random key for this process");
            TokenKey::random().map_err(|e| format!("RNG unavailable: {}", e))?
        }
    };

    match args.command {
        Some(Command::IssueToken { user_id, ttl }) => {
            let ttl = ttl.unwrap_or(config.auth.token_ttl_secs);
            println!("{}", key.issue(&user_id, unix_now() + ttl));
            return Ok(());
        }
        Some(Command::SampleConfig) => {
            println!("{}", Config::sample());
            return Ok(());
        }
        None => {}
    }

    let addr = SocketAddr::new(config.signal.bind, config.signal.port);

    info!("Starting RTC Signal Server");
    info!("Listening on {}", addr);

    // Initialize the journal if a database path is configured
    let mut registry = SessionRegistry::new(config.signal.idle_timeout());
    if let Some(db_path) = &config.signal.db_path {
        // Create parent directory if it doesn't exist
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        info!("Using SQLite journal: {:?}", db_path);
        let journal = Storage::open(db_path)?;

        let session_count = journal.session_count().unwrap_or(0);
        let open_count = journal.open_session_count().unwrap_or(0);
        info!(
            "Journal holds {} sessions ({} never evicted)",
            session_count, open_count
        );
        match journal.prune_evicted(JOURNAL_RETENTION_SECS) {
            Ok(0) => {}
            Ok(n) => info!("Pruned {} old sessions from the journal", n),
            Err(e) => warn!("Journal prune failed: {}", e),
        }

        registry = registry.with_journal(Arc::new(journal));
    } else {
        info!("No session journal (in-memory only)");
    }

    let relay = Arc::new(SignalingRelay::new(Arc::new(registry)));
    let hub = Arc::new(Hub::new(
        relay,
        Validator::with_key(key),
        config.signal.auth_timeout(),
    ));
    let server = SignalServer::new(hub, config.signal.sweep_interval());

    // Handle Ctrl+C
    tokio::select! {
        result = server.serve(addr) => {
            if let Err(e) = result {
                error!("Signal server error: {:?}", e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    Ok(())
}
