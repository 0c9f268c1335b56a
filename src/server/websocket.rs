//! WebSocket transport
//!
//! Accepts TCP/WebSocket connections and feeds their text frames to the
//! `BusServer`. Each connection gets:
//! - a reader loop (this task) that hands frames to the server one at a time
//! - a forwarding task that owns the socket's write half and drains an
//!   unbounded channel, so the server never awaits socket writes while
//!   handling a frame

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::spawn;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use super::bus_server::{BusServer, Session};
use crate::bus::Connection;
use crate::utils::Result;

pub async fn start_websocket_server(addr: &str, server: Arc<BusServer>) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Bus server listening on ws://{addr}");
    serve(listener, server).await
}

/// Accept loop over an already bound listener.
pub async fn serve(listener: TcpListener, server: Arc<BusServer>) -> Result<()> {
    server.spawn_dispatcher();

    loop {
        let (stream, peer) = listener.accept().await?;
        debug!("Accepted TCP connection from {peer}");
        let server = server.clone();
        tokio::spawn(async move {
            handle_connection(stream, server).await;
        });
    }
}

async fn handle_connection(stream: TcpStream, server: Arc<BusServer>) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake error: {e}");
            return;
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let mut session = Session::new(Connection::new(tx));
    let connection_id = session.connection().id().to_string();

    let writer = {
        let connection_id = connection_id.clone();
        spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = msg.is_close();
                if let Err(e) = ws_sender.send(msg).await {
                    warn!("Failed to send frame to {connection_id}: {e}");
                    break;
                }
                if closing {
                    break;
                }
            }
            debug!("Send loop closed for {connection_id}");
        })
    };

    while let Some(frame) = ws_receiver.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => {
                server.handle_frame(&mut session, text.as_str()).await;
                if session.is_closed() {
                    break;
                }
            }
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Read error on {connection_id}: {e}");
                break;
            }
        }
    }

    server.disconnect(&mut session).await;
    // last sender goes with the session; the writer drains and stops
    drop(session);
    if let Err(e) = writer.await {
        warn!("Send loop for {connection_id} panicked: {e}");
    }
    info!("{connection_id} disconnected");
}
