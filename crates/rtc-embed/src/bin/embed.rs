//! RTC Embed CLI - Join calls and inspect coordinator releases
//!
//! Usage:
//!   rtc-embed join <session-id> --user-id u1 --token <token>
//!   rtc-embed join <session-id> --identity user.json --token <token>
//!   rtc-embed loader-url
//!   rtc-embed load

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rtc_core::{CallState, Config, IdentityRecord, SessionId};
use rtc_embed::{
    ClientCoordinator, CoordinatorLoader, CoordinatorState, EmbedAttributes, HostEvent,
    HostNotifier, RenderTarget, StartOutcome, SyntheticMedia, WsConnector,
};

#[derive(Parser)]
#[command(name = "rtc-embed")]
#[command(about = "Embedded WebRTC call coordinator", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: platform config dir)
    #[arg(short, long, global = true, env = "RTC_EMBED_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Join a call and print host events as JSON lines
    Join {
        /// Session id (UUID)
        session_id: String,

        /// User id (data-user-id)
        #[arg(long)]
        user_id: Option<String>,

        /// Display name (data-user-name)
        #[arg(long)]
        user_name: Option<String>,

        /// Avatar URL (data-user-avatar)
        #[arg(long)]
        user_avatar: Option<String>,

        /// User record JSON file; resolves id, name and avatar
        #[arg(long, conflicts_with = "user_id")]
        identity: Option<PathBuf>,

        /// Auth token (data-user-token)
        #[arg(long, env = "RTC_USER_TOKEN", hide_env_values = true)]
        token: String,

        /// Signal server URL (default: client.signal_url)
        #[arg(short, long)]
        signal: Option<String>,

        /// Fetch the coordinator code before connecting
        #[arg(long)]
        load: bool,
    },

    /// Print the URL the loader would fetch next
    LoaderUrl,

    /// Fetch the coordinator code and print its digest
    Load,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Set up logging; stdout carries host events, so logs go to stderr
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let (plain, json) = if cli.json {
        (None, Some(fmt::layer().json().with_writer(std::io::stderr)))
    } else {
        (Some(fmt::layer().with_target(false).with_writer(std::io::stderr)), None)
    };
    tracing_subscriber::registry()
        .with(plain)
        .with(json)
        .with(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .init();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };

    match cli.command {
        Commands::Join {
            session_id,
            user_id,
            user_name,
            user_avatar,
            identity,
            token,
            signal,
            load,
        } => {
            let attrs = match identity {
                Some(path) => {
                    let record = IdentityRecord::from_json(&std::fs::read_to_string(&path)?)?;
                    EmbedAttributes::from_identity(&record, &token, config.loader.asset_origin.as_deref())
                }
                None => EmbedAttributes {
                    user_name,
                    user_id,
                    user_avatar,
                    user_token: Some(token),
                },
            };
            let session_id: SessionId = session_id.parse()?;
            run_join(config, attrs, session_id, signal, load).await?;
        }
        Commands::LoaderUrl => {
            let loader = CoordinatorLoader::from_config(&config.loader)?;
            println!("{}", loader.request_url()?);
        }
        Commands::Load => {
            let loader = CoordinatorLoader::from_config(&config.loader)?;
            let code = loader.load().await?;
            println!("{} {} bytes blake3={}", code.url, code.bytes.len(), code.digest);
        }
    }

    Ok(())
}

async fn run_join(
    config: Config,
    attrs: EmbedAttributes,
    session_id: SessionId,
    signal_url: Option<String>,
    load: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let url = signal_url.unwrap_or_else(|| config.client.signal_url.clone());
    let connector = Arc::new(WsConnector::new(&url)?);
    let media = Arc::new(SyntheticMedia::new("cli"));
    let (notifier, mut events) = HostNotifier::channel();

    let mut coordinator = ClientCoordinator::new(
        config.client.clone(),
        connector,
        media,
        notifier,
        RenderTarget::new("stdout"),
    );
    if load {
        coordinator = coordinator.with_loader(CoordinatorLoader::from_config(&config.loader)?);
    }

    info!("Connecting to {}", url);
    match coordinator.start(&attrs).await {
        StartOutcome::Started { user_id } => info!("Signed in as {}", user_id),
        StartOutcome::AlreadyStarted => {}
        StartOutcome::Failed(e) => {
            drain(&mut events);
            return Err(e.into());
        }
    }

    let snapshot = coordinator.join(session_id).await?;
    info!(
        "Joined {} ({}, {} participant(s))",
        snapshot.session_id,
        snapshot.state,
        snapshot.participants.len()
    );

    // Print host events until the call ends or Ctrl+C
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                print_event(&event);
                if coordinator.state() == CoordinatorState::Failed {
                    error!("Signaling channel lost");
                    break;
                }
                if coordinator.call_state().is_some_and(CallState::is_terminal) {
                    info!("Call finished");
                    break;
                }
            }
            _ = signal::ctrl_c() => {
                info!("Hanging up...");
                break;
            }
        }
    }

    coordinator.teardown().await;
    drain(&mut events);
    Ok(())
}

fn drain(events: &mut rtc_embed::HostEvents) {
    while let Some(event) = events.try_recv() {
        print_event(&event);
    }
}

fn print_event(event: &HostEvent) {
    match event.to_json() {
        Ok(json) => println!("{}", json),
        Err(e) => warn!("Cannot encode host event: {}", e),
    }
}
