//! CLI for Busline
//!
//! Subcommands:
//! - `server`: run a broker backed by the configured sled store
//! - `client`: join a channel, optionally broadcast a text, print what arrives

use std::sync::Arc;

use busline::bus::BusEngine;
use busline::client::BusClient;
use busline::config::{LogSettings, Settings, load_config};
use busline::database::BusDatabase;
use busline::lock::LockAuthority;
use busline::message::{BusMessage, MessageBody};
use busline::persistence::SledStore;
use busline::server::{BusServer, start_websocket_server};
use busline::utils::{Result, logging};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "busline")]
enum Command {
    /// Start a broker
    Server,
    /// Connect a client to a broker
    Client {
        /// WebSocket URL of the broker
        #[arg(long, default_value = "ws://127.0.0.1:8080")]
        url: String,
        /// Channel to join (defaults to `bus.channel`)
        #[arg(long)]
        channel: Option<String>,
        /// Text to broadcast to every client once joined
        #[arg(long)]
        text: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cmd = Command::parse();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            logging::init(&LogSettings::default());
            error!("Failed to load configuration: {e}");
            return;
        }
    };
    logging::init(&config.log);

    match cmd {
        Command::Server => {
            if let Err(e) = run_server(config).await {
                error!("Server failed: {e}");
            }
        }
        Command::Client { url, channel, text } => {
            let channel = channel.unwrap_or_else(|| config.bus.channel.clone());
            run_client(config, url, channel, text).await;
        }
    }
}

async fn run_server(config: Settings) -> Result<()> {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let store = Arc::new(SledStore::open(&config.store.path)?);
    let database = BusDatabase::new(store.clone(), config.server.server_id.clone(), &config.bus);

    let mut server = BusServer::new(BusEngine::new(), database.clone());
    server.register_handler("RequestLock", Arc::new(LockAuthority::new(database)));
    info!("Starting broker {}", config.server.server_id);

    tokio::select! {
        result = start_websocket_server(&addr, Arc::new(server)) => {
            if let Err(e) = result {
                error!("WebSocket server exited: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    store.close()?;
    Ok(())
}

async fn run_client(config: Settings, url: String, channel: String, text: Option<String>) {
    let client = Arc::new(BusClient::new(channel, &config.bus));
    let mut events = client.subscribe();
    let connection = tokio::spawn(client.clone().run(url));

    let mut pending_text = text;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(message) => {
                    // our own Join came back acknowledged: safe to talk now
                    if message.kind() == "Join" {
                        if let Some(text) = pending_text.take() {
                            client.send(BusMessage::broadcast(text));
                        }
                    }
                    print_event(&message);
                }
                Err(RecvError::Lagged(skipped)) => info!("Skipped {skipped} events"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received. Exiting gracefully.");
                break;
            }
        }
    }
    connection.abort();
}

fn print_event(message: &BusMessage) {
    match message.body() {
        MessageBody::Text { text } => println!(
            "[{}] {}: {text}",
            message.channels().join(","),
            message.client_id.as_deref().unwrap_or("?")
        ),
        _ => println!("{} {} (delivered: {})", message.kind(), message.id(), message.delivered),
    }
}
