//! dojo - terminal client for DojoPool live rooms

mod commands;
mod display;

use anyhow::{Context, Result};
use clap::Parser;
use commands::Session;
use dojo_core::{ConnectionState, Credential, RoomKey};
use dojo_engine::{Realtime, RealtimeConfig};
use dojo_networking::RestClient;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "dojo", version, about = "Follow DojoPool matches, tournaments and chat")]
struct Cli {
    /// WebSocket endpoint (overrides the config file)
    #[arg(long)]
    url: Option<String>,

    /// REST API base URL (overrides the config file)
    #[arg(long)]
    api_url: Option<String>,

    /// Access token. Falls back to the DOJO_TOKEN environment variable.
    #[arg(long)]
    token: Option<String>,

    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Rooms to join on start, e.g. match:42 chat:lobby
    rooms: Vec<RoomKey>,
}

fn load_config(cli: &Cli) -> Result<RealtimeConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
        }
        None => RealtimeConfig::default(),
    };
    if let Some(url) = &cli.url {
        config.url = url.clone();
    }
    if let Some(api_url) = &cli.api_url {
        config.api_url = api_url.clone();
    }
    Ok(config)
}

fn credential(cli: &Cli) -> Result<Credential> {
    cli.token
        .clone()
        .or_else(|| std::env::var("DOJO_TOKEN").ok())
        .filter(|token| !token.trim().is_empty())
        .map(Credential::new)
        .context("no access token: pass --token or set DOJO_TOKEN")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dojo=info,dojo_engine=info,dojo_networking=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let credential = credential(&cli)?;

    info!("Connecting to {}", config.url);

    let rest = Arc::new(RestClient::new(&config.api_url, credential.clone())?);
    let realtime = Realtime::new(config);
    let _subscriptions = display::attach(&realtime);

    // Room state is authoritative over REST; re-fetch after every reconnect
    let refresher = {
        let realtime = realtime.clone();
        let rest = rest.clone();
        let mut states = realtime.watch_state();
        tokio::spawn(async move {
            let mut previous = *states.borrow();
            while states.changed().await.is_ok() {
                let current = *states.borrow_and_update();
                if previous == ConnectionState::Reconnecting
                    && current == ConnectionState::Connected
                {
                    commands::refresh_rooms(&realtime, &rest).await;
                }
                if current == ConnectionState::AuthFailed {
                    warn!("Access token rejected; restart with a fresh --token");
                }
                previous = current;
            }
        })
    };

    realtime.connect(credential);

    let mut session = Session::new(realtime.clone(), rest);
    for room in cli.rooms {
        session.join(room);
    }
    println!("{}", commands::HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    break;
                };
                match commands::parse(&line) {
                    Ok(Some(command)) => match session.execute(command).await {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => println!("! {:#}", e),
                    },
                    Ok(None) => {}
                    Err(e) => println!("! {:#}", e),
                }
            }
        }
    }

    drop(session);
    realtime.shutdown();
    refresher.abort();
    info!("Bye");
    Ok(())
}
