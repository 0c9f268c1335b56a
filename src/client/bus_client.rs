//! Bus client
//!
//! Joins one channel, keeps the membership alive with Pings and republishes
//! everything it receives on a local `broadcast` channel. Delivery receipts are
//! unwrapped so subscribers see the original message with its final
//! `delivered` flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::bus::BusEngine;
use crate::config::BusSettings;
use crate::message::{BusMessage, MessageBody};
use crate::utils::Result;

const EVENT_CAPACITY: usize = 256;

pub struct BusClient {
    channel: String,
    engine: BusEngine,
    client_id: Mutex<Option<String>>,
    outbound: Mutex<Option<UnboundedSender<WsMessage>>>,
    ready: AtomicBool,
    events: broadcast::Sender<BusMessage>,
    heartbeat_interval: Duration,
    reconnect_interval: Duration,
}

impl BusClient {
    pub fn new(channel: impl Into<String>, settings: &BusSettings) -> Self {
        Self::with_engine(channel, BusEngine::new(), settings)
    }

    /// A client whose engine knows extra message types.
    pub fn with_engine(channel: impl Into<String>, engine: BusEngine, settings: &BusSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            channel: channel.into(),
            engine,
            client_id: Mutex::new(None),
            outbound: Mutex::new(None),
            ready: AtomicBool::new(false),
            events,
            heartbeat_interval: Duration::from_millis(settings.heartbeat_interval_ms),
            reconnect_interval: Duration::from_millis(settings.reconnect_interval_ms),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn engine(&self) -> &BusEngine {
        &self.engine
    }

    /// Id used on the current (or most recent) connection.
    pub fn client_id(&self) -> Option<String> {
        self.client_id.lock().ok()?.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Local event stream of every inbound message.
    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.events.subscribe()
    }

    /// Adopts a freshly opened transport and joins the configured channel.
    pub fn on_open(&self, sender: UnboundedSender<WsMessage>) -> String {
        let client_id = format!("client-{}", uuid::Uuid::new_v4());
        if let Ok(mut current) = self.client_id.lock() {
            *current = Some(client_id.clone());
        }
        if let Ok(mut outbound) = self.outbound.lock() {
            *outbound = Some(sender);
        }
        self.ready.store(true, Ordering::SeqCst);

        info!("Connected as {client_id}, joining {}", self.channel);
        self.send(BusMessage::join(self.channel.clone()));
        client_id
    }

    pub fn on_close(&self) {
        self.ready.store(false, Ordering::SeqCst);
        if let Ok(mut outbound) = self.outbound.lock() {
            outbound.take();
        }
        debug!("Transport closed");
    }

    pub fn on_frame(&self, text: &str) {
        match self.engine.decode(text) {
            Some(message) => self.dispatch(message),
            None => debug!(
                "Dropping unrecognized frame: {}",
                text.chars().take(100).collect::<String>()
            ),
        }
    }

    fn dispatch(&self, message: BusMessage) {
        let message = match message.body() {
            MessageBody::DeliveryReceipt { .. } => match self.engine.unwrap_receipt(&message) {
                Some(original) => original,
                None => {
                    debug!("Dropping receipt {} with an unknown payload", message.id());
                    return;
                }
            },
            _ => message,
        };
        // no subscribers is fine
        let _ = self.events.send(message);
    }

    /// Stamps the client id and queues the frame. Returns `false` (after
    /// logging) when the transport is not ready; never waits for it.
    pub fn send(&self, mut message: BusMessage) -> bool {
        if !self.is_ready() {
            warn!("Transport not ready, dropping {} {}", message.kind(), message.id());
            return false;
        }
        message.client_id = self.client_id();

        let frame = WsMessage::text(self.engine.encode(&message));
        let sent = self
            .outbound
            .lock()
            .ok()
            .and_then(|outbound| outbound.as_ref().map(|tx| tx.send(frame).is_ok()))
            .unwrap_or(false);
        if !sent {
            warn!("Transport went away before {} {} was sent", message.kind(), message.id());
        }
        sent
    }

    /// Sends a Ping every heartbeat interval while ready. The loop keeps going
    /// through disconnects and ends once the client is dropped.
    pub fn spawn_heartbeat(self: &Arc<Self>) -> JoinHandle<()> {
        let client: Weak<Self> = Arc::downgrade(self);
        let interval = self.heartbeat_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(client) = client.upgrade() else {
                    break;
                };
                if client.is_ready() {
                    client.send(BusMessage::ping());
                } else {
                    debug!("Skipping heartbeat, transport not ready");
                }
            }
        })
    }

    /// Connects to `url` and keeps reconnecting after every close or failed
    /// attempt. Runs until the task is dropped.
    pub async fn run(self: Arc<Self>, url: String) {
        let _heartbeat = self.spawn_heartbeat();
        loop {
            if let Err(e) = self.connect_once(&url).await {
                warn!("Connection to {url} failed: {e}");
            }
            debug!("Reconnecting in {:?}", self.reconnect_interval);
            tokio::time::sleep(self.reconnect_interval).await;
        }
    }

    /// One connection lifetime: open, pump frames until closed.
    pub async fn connect_once(&self, url: &str) -> Result<()> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = ws_sender.send(msg).await {
                    warn!("Failed to send frame: {e}");
                    break;
                }
            }
        });

        self.on_open(tx);

        while let Some(frame) = ws_receiver.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => self.on_frame(text.as_str()),
                Ok(WsMessage::Close(close)) => {
                    if let Some(close) = close {
                        info!(
                            "Server closed the connection ({}): {}",
                            u16::from(close.code),
                            close.reason
                        );
                    }
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    self.on_close();
                    writer.abort();
                    return Err(e.into());
                }
            }
        }

        self.on_close();
        writer.abort();
        Ok(())
    }
}

impl std::fmt::Debug for BusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusClient")
            .field("channel", &self.channel)
            .field("client_id", &self.client_id())
            .field("ready", &self.is_ready())
            .finish()
    }
}
