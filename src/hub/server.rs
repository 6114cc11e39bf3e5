use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::{Bytes, Message, Utf8Bytes};
use tracing::{debug, error, info, warn};

use super::actor::HubHandle;
use super::messages::{ClientMessage, ServerMessage, now_millis};
use super::registry::Registry;
use super::types::{Connection, ConnectionId, HubError, HubStats, OutboundMessage};
use crate::config::HubConfig;

/// How long a closing connection gets to flush its last frames
const CLOSE_GRACE: Duration = Duration::from_secs(1);

pub struct HubServer {
    listener: TcpListener,
    handle: HubHandle,
    config: HubConfig,
}

impl HubServer {
    /// Bind the listener and start the hub actor
    pub async fn bind(config: HubConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        info!("Rendezvous hub listening on {}", listener.local_addr()?);

        let registry = Registry::new().with_delivery_notices(config.notify_undelivered);
        Ok(Self {
            listener,
            handle: HubHandle::spawn(registry),
            config,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> HubHandle {
        self.handle.clone()
    }

    /// Serve until Ctrl+C or SIGTERM
    pub async fn run(self) -> io::Result<HubStats> {
        self.run_until(shutdown_signal()).await
    }

    /// Serve until `shutdown` resolves, then stop accepting, close every
    /// connection and return the stats as they were when shutdown began.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> io::Result<HubStats> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,

                accepted = self.listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("Accept failed: {}", e);
                            continue;
                        }
                    };
                    let handle = self.handle.clone();
                    let config = self.config.clone();
                    let stop_rx = stop_rx.clone();

                    connections.spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, handle, config, stop_rx).await {
                            error!("Connection error from {}: {}", addr, e);
                        }
                    });
                }

                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        drop(self.listener);
        let stats = self.handle.stats().await.unwrap_or_default();
        info!(
            "Shutting down: {} peers in {} rooms, {} connections to close",
            stats.peers,
            stats.rooms,
            connections.len()
        );

        let _ = stop_tx.send(true);
        let drained = tokio::time::timeout(self.config.drain_timeout, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "Drain timed out, aborting {} connections",
                connections.len()
            );
            connections.abort_all();
        }

        info!(
            "Relay totals: {} attempted, {} delivered, {} dropped",
            stats.relay.attempted, stats.relay.delivered, stats.relay.dropped
        );
        Ok(stats)
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl+C received"),
        _ = terminate => info!("SIGTERM received"),
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    handle: HubHandle,
    config: HubConfig,
    mut stop_rx: watch::Receiver<bool>,
) -> Result<(), HubError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundMessage>();
    let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<Message>();
    let conn = Connection::new(ConnectionId::next(), tx);

    info!("WebSocket connection {} from {}", conn.id, addr);

    let mut ping_interval = tokio::time::interval(config.ping_interval);
    // the first tick completes immediately
    ping_interval.tick().await;
    let mut waiting_for_pong = false;
    let mut pong_deadline: Option<tokio::time::Instant> = None;

    let mut send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                Some(msg) = rx.recv() => {
                    let ws_msg = Message::Text(msg.into_inner());
                    if ws_tx.send(ws_msg).await.is_err() {
                        break;
                    }
                }
                Some(ctrl_msg) = ctrl_rx.recv() => {
                    let closing = matches!(ctrl_msg, Message::Close(_));
                    if ws_tx.send(ctrl_msg).await.is_err() || closing {
                        break;
                    }
                }
                else => break,
            }
        }
    });

    conn.send(
        ServerMessage::ServerInfo {
            message: format!("connected to rendezvous hub as {}", conn.id),
            timestamp: now_millis(),
        }
        .encode(),
    );

    loop {
        let pong_timeout = async {
            match pong_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = stop_rx.changed() => {
                info!("Closing {}: hub shutting down", conn.id);
                break;
            }

            _ = ping_interval.tick() => {
                if waiting_for_pong {
                    warn!("No Pong received, disconnecting {}", addr);
                    break;
                }
                if ctrl_tx.send(Message::Ping(Bytes::new())).is_err() {
                    break;
                }
                waiting_for_pong = true;
                pong_deadline = Some(tokio::time::Instant::now() + config.pong_timeout);
                debug!("Ping sent to {}", addr);
            }

            _ = pong_timeout => {
                warn!("Pong timeout, disconnecting {}", addr);
                break;
            }

            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        warn!("WebSocket error on {}: {}", conn.id, e);
                        break;
                    }
                    None => break,
                };

                match msg {
                    Message::Text(text) => {
                        if let Err(e) = handle_text_message(text, &conn, &handle).await {
                            warn!("Message handling error on {}: {}", conn.id, e);
                            break;
                        }
                    }
                    Message::Binary(_) => {
                        let err = HubError::Parse("binary frames are not supported".to_string());
                        conn.send(ServerMessage::error(&err).encode());
                    }
                    Message::Pong(_) => {
                        waiting_for_pong = false;
                        pong_deadline = None;
                        debug!("Pong received from {}", addr);
                    }
                    Message::Close(_) => {
                        info!("Close received from {}", addr);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    // Graceful and ungraceful exits share the same cleanup.
    if let Err(e) = handle.disconnect(conn.id).await {
        warn!("Cleanup for {} failed: {}", conn.id, e);
    }

    let _ = ctrl_tx.send(Message::Close(None));
    drop(ctrl_tx);
    drop(conn);
    if tokio::time::timeout(CLOSE_GRACE, &mut send_task).await.is_err() {
        send_task.abort();
    }
    info!("WebSocket disconnected: {}", addr);

    Ok(())
}

async fn handle_text_message(
    text: Utf8Bytes,
    conn: &Connection,
    handle: &HubHandle,
) -> Result<(), HubError> {
    let client_msg = match ClientMessage::decode(text.as_str()) {
        Ok(m) => m,
        Err(e) => {
            debug!("Bad message from {}: {}", conn.id, e);
            conn.send(ServerMessage::error(&e).encode());
            return Ok(());
        }
    };
    debug!("{} from {}", client_msg.kind(), conn.id);

    match client_msg {
        ClientMessage::JoinRoom(request) => handle.join(conn.clone(), request).await,

        ClientMessage::LeaveRoom(request) => handle.leave(conn.id, request.peer_id).await,

        ClientMessage::Offer(envelope)
        | ClientMessage::Answer(envelope)
        | ClientMessage::IceCandidate(envelope) => {
            handle
                .relay(conn.clone(), envelope, OutboundMessage::new(text))
                .await
        }
    }
}
