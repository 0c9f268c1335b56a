//! Bus server
//!
//! Every connection moves through Unjoined -> Joined -> Closed. The state for
//! one connection lives in its `Session`, owned by the task reading that
//! socket, so frames from one client are handled strictly one after another.
//!
//! Communication messages are not held in memory: they are posted to the
//! `BusDatabase`, which queues them per recipient and raises a store notify.
//! Notifications land in a single FIFO drained by one dispatcher task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::handler::NegotiationHandler;
use crate::bus::{BusEngine, Connection, DeliveryContext, PROTOCOL_ERROR_CLOSE_CODE};
use crate::database::BusDatabase;
use crate::message::{BusMessage, Category, MessageBody};
use crate::utils::{BusError, Result};

/// Server-side record of a joined connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConnectionState {
    pub id: String,
    pub channel: String,
}

/// One live connection as seen by the server.
#[derive(Debug)]
pub struct Session {
    connection: Connection,
    state: Option<ClientConnectionState>,
    closed: bool,
}

impl Session {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            state: None,
            closed: false,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn state(&self) -> Option<&ClientConnectionState> {
        self.state.as_ref()
    }

    /// True once a negotiation failure has closed the connection.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn joined(&self, message: &BusMessage) -> Result<&ClientConnectionState> {
        let state = self.state.as_ref().ok_or_else(|| {
            BusError::negotiation(format!("{} sent before joining a channel", message.kind()))
        })?;
        if message.client_id.as_deref() != Some(state.id.as_str()) {
            return Err(BusError::negotiation(format!(
                "client id changed from {} mid-connection",
                state.id
            )));
        }
        Ok(state)
    }
}

/// `^\w+$` over ASCII word characters.
pub fn is_valid_channel_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub struct BusServer {
    engine: BusEngine,
    database: BusDatabase,
    clients: Mutex<HashMap<String, Connection>>,
    handlers: HashMap<String, Arc<dyn NegotiationHandler>>,
    notify_tx: UnboundedSender<String>,
    notify_rx: Mutex<Option<UnboundedReceiver<String>>>,
}

impl BusServer {
    pub fn new(engine: BusEngine, database: BusDatabase) -> Self {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        Self {
            engine,
            database,
            clients: Mutex::new(HashMap::new()),
            handlers: HashMap::new(),
            notify_tx,
            notify_rx: Mutex::new(Some(notify_rx)),
        }
    }

    /// Routes negotiation messages of type `kind` to `handler`.
    pub fn register_handler(&mut self, kind: impl Into<String>, handler: Arc<dyn NegotiationHandler>) {
        self.handlers.insert(kind.into(), handler);
    }

    pub fn engine(&self) -> &BusEngine {
        &self.engine
    }

    pub fn database(&self) -> &BusDatabase {
        &self.database
    }

    pub fn connected_clients(&self) -> Vec<String> {
        self.clients
            .lock()
            .map(|clients| clients.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn connection_for(&self, client_id: &str) -> Option<Connection> {
        self.clients.lock().ok()?.get(client_id).cloned()
    }

    /// Drops the routing entry and notify subscription for `client_id`
    /// unless a newer connection has taken the id over.
    fn forget_connection(&self, client_id: &str, connection: &Connection) {
        let Ok(mut clients) = self.clients.lock() else {
            return;
        };
        if clients
            .get(client_id)
            .is_some_and(|c| c.id() == connection.id())
        {
            clients.remove(client_id);
            self.database.store().unsubscribe(client_id);
        }
    }

    /// Starts the single worker that drains notified client queues in FIFO
    /// order. Only the first call spawns anything.
    pub fn spawn_dispatcher(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut notifications = self.notify_rx.lock().ok()?.take()?;
        let server = Arc::clone(self);
        Some(tokio::spawn(async move {
            while let Some(client_id) = notifications.recv().await {
                server.drain(&client_id).await;
            }
            debug!("Dispatcher stopped");
        }))
    }

    /// Sends everything queued for `client_id` to its connection and records
    /// it to history. Returns how many frames were written.
    pub async fn drain(&self, client_id: &str) -> usize {
        let Some(connection) = self.connection_for(client_id) else {
            debug!("No local connection for {client_id}; leaving its queue alone");
            return 0;
        };
        if !connection.is_open() {
            debug!("Connection for {client_id} is closing; leaving its queue alone");
            return 0;
        }

        let values = match self.database.take_messages(client_id).await {
            Ok(values) => values,
            Err(e) => {
                error!("Failed to take queued messages for {client_id}: {e}");
                return 0;
            }
        };
        if values.is_empty() {
            return 0;
        }

        // stop at the first failed write; the rest goes back in order
        let mut sent = Vec::with_capacity(values.len());
        let mut unsent = Vec::new();
        for value in values {
            if unsent.is_empty() && connection.send_text(value.content.clone()) {
                sent.push(value);
            } else {
                unsent.push(value);
            }
        }

        if !unsent.is_empty() {
            warn!(
                "Connection for {client_id} closed during dispatch; requeueing {} messages",
                unsent.len()
            );
            if let Err(e) = self.database.requeue(client_id, unsent).await {
                error!("Failed to requeue messages for {client_id}: {e}");
            }
        }

        let count = sent.len();
        if let Err(e) = self.database.record_history(client_id, sent).await {
            warn!("Failed to record history for {client_id}: {e}");
        }
        debug!("Dispatched {count} messages to {client_id}");
        count
    }

    /// Decodes and dispatches one inbound frame. Malformed frames are dropped.
    pub async fn handle_frame(&self, session: &mut Session, text: &str) {
        match self.engine.decode(text) {
            Some(message) => self.dispatch(session, message).await,
            None => debug!(
                "Dropping unrecognized frame on {}: {}",
                session.connection.id(),
                text.chars().take(100).collect::<String>()
            ),
        }
    }

    pub async fn dispatch(&self, session: &mut Session, message: BusMessage) {
        let mut context = DeliveryContext::new(session.connection.clone());

        let outcome = match message.category() {
            Category::Negotiation => self
                .handle_negotiation(session, &message, &mut context)
                .await
                .map(|_| true),
            Category::Communication => self.handle_communication(session, &message).await,
        };

        match outcome {
            Ok(delivered) => {
                let reply = context
                    .response
                    .take()
                    .unwrap_or_else(|| self.engine.receipt_for(&message, delivered));
                if !session.connection.send_text(self.engine.encode(&reply)) {
                    debug!("Connection {} closed before reply", session.connection.id());
                }
            }
            Err(BusError::Negotiation(reason)) => {
                warn!(
                    "Closing {} after negotiation failure: {reason}",
                    session.connection.id()
                );
                session.connection.close(PROTOCOL_ERROR_CLOSE_CODE, &reason);
                session.closed = true;
            }
            Err(e) => error!(
                "Failed to handle {} {} on {}: {e}",
                message.kind(),
                message.id(),
                session.connection.id()
            ),
        }
    }

    async fn handle_negotiation(
        &self,
        session: &mut Session,
        message: &BusMessage,
        context: &mut DeliveryContext,
    ) -> Result<()> {
        match message.body() {
            MessageBody::Join => self.join(session, message).await,
            MessageBody::Ping => self.ping(session, message).await,
            _ => {
                session.joined(message)?;
                let handler = self.handlers.get(message.kind()).ok_or_else(|| {
                    BusError::negotiation(format!(
                        "unsupported negotiation message {}",
                        message.kind()
                    ))
                })?;
                handler.handle(message, context).await
            }
        }
    }

    async fn join(&self, session: &mut Session, message: &BusMessage) -> Result<()> {
        let [channel] = message.channels() else {
            return Err(BusError::negotiation(format!(
                "join requires exactly one channel, got {}",
                message.channels().len()
            )));
        };
        if !is_valid_channel_name(channel) {
            return Err(BusError::negotiation(format!(
                "invalid channel name '{channel}'"
            )));
        }
        if let Some(state) = &session.state {
            return Err(BusError::negotiation(format!(
                "connection already joined {} as {}",
                state.channel, state.id
            )));
        }
        let Some(client_id) = message.client_id.clone() else {
            return Err(BusError::negotiation("join without a client id"));
        };

        // registered before the membership becomes visible, so no post can
        // slip in between
        self.database
            .store()
            .subscribe(&client_id, self.notify_tx.clone());
        if let Ok(mut clients) = self.clients.lock() {
            clients.insert(client_id.clone(), session.connection.clone());
        }

        if let Err(e) = self.database.join(channel, &client_id).await {
            self.forget_connection(&client_id, &session.connection);
            return Err(e);
        }

        // anything queued before the subscription existed
        if self.notify_tx.send(client_id.clone()).is_err() {
            debug!("Dispatcher gone; {client_id} will be drained on next notify");
        }

        info!("{client_id} joined {channel}");
        session.state = Some(ClientConnectionState {
            id: client_id,
            channel: channel.clone(),
        });
        Ok(())
    }

    async fn ping(&self, session: &mut Session, message: &BusMessage) -> Result<()> {
        if !message.channels().is_empty() {
            return Err(BusError::negotiation("ping must not address channels"));
        }
        let state = session.joined(message)?;
        self.database
            .touch(&state.channel, &state.id, message.id())
            .await?;
        debug!("Ping from {}", state.id);
        Ok(())
    }

    async fn handle_communication(&self, session: &mut Session, message: &BusMessage) -> Result<bool> {
        if matches!(message.body(), MessageBody::DeliveryReceipt { .. }) {
            return Err(BusError::negotiation(
                "delivery receipts are only sent by the server",
            ));
        }
        let state = session.joined(message)?;
        let delivered = self.database.post(message).await?;
        info!(
            "{} posted {} to {:?} (delivered: {delivered})",
            state.id,
            message.kind(),
            message.channels()
        );
        Ok(delivered)
    }

    /// Forgets the connection and removes its membership and queue.
    /// Failures are logged, never retried.
    pub async fn disconnect(&self, session: &mut Session) {
        let Some(state) = session.state.take() else {
            debug!("{} closed before joining", session.connection.id());
            return;
        };

        self.forget_connection(&state.id, &session.connection);

        if let Err(e) = self.database.leave(&state.channel, &state.id).await {
            warn!("Failed to clean up {} in {}: {e}", state.id, state.channel);
        }
        info!("{} left {}", state.id, state.channel);
    }
}

impl std::fmt::Debug for BusServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusServer")
            .field("database", &self.database)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
