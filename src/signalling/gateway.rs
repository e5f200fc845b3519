//! WebSocket-backed `SignallingTransport`.
//!
//! The reconnect loop is lifted directly from the teacher's
//! `client/src-tauri/src/network/websocket.rs::connection_loop` — same
//! split-sink/stream `tokio::select!` shape, same backoff formula
//! (`min(2^min(attempt, 5), 30s)`), same shutdown-channel cancellation —
//! generalized from the teacher's chat `ClientEvent`/`ServerEvent` pair to
//! this crate's `OutboundSignal`/`InboundSignal` pair.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::{InboundSignal, OutboundSignal, SignallingTransport};
use crate::error::SignallingError;

/// Mirrors the teacher's `ConnectionStatus` (`client/src-tauri/src/network/
/// websocket.rs`), minus the Tauri `AppHandle::emit` half — this crate has
/// no event bus of its own, so callers watch `WebSocketGateway::watch_status`
/// instead of subscribing to `"ws:connected"`/`"ws:reconnecting"` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Disconnected,
}

pub struct WebSocketGateway {
    outbound_tx: mpsc::UnboundedSender<OutboundSignal>,
    inbound_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<InboundSignal>>>,
    shutdown_tx: mpsc::Sender<()>,
    status_rx: watch::Receiver<ConnectionStatus>,
}

impl WebSocketGateway {
    /// Connects to `url` and starts the background reconnect loop. The
    /// caller drives the connection's lifetime by dropping the returned
    /// handle (which signals `shutdown_tx`), matching the teacher's
    /// `WebSocketManager::disconnect`.
    pub fn connect(url: String) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);

        tokio::spawn(connection_loop(url, outbound_rx, inbound_tx, shutdown_rx, status_tx));

        Self {
            outbound_tx,
            inbound_rx: std::sync::Mutex::new(Some(inbound_rx)),
            shutdown_tx,
            status_rx,
        }
    }

    pub async fn disconnect(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }

    /// A `VoiceConnection` caller watches this for a `Reconnecting ->
    /// Connected` transition and calls `handle_transport_reconnected()`
    /// (spec.md §4.5 "Signalling reconnect").
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }
}

impl SignallingTransport for WebSocketGateway {
    fn send(&self, event: OutboundSignal) -> BoxFuture<'_, Result<(), SignallingError>> {
        Box::pin(async move {
            self.outbound_tx
                .send(event)
                .map_err(|_| SignallingError::Closed)
        })
    }

    fn take_inbound(&self) -> mpsc::UnboundedReceiver<InboundSignal> {
        self.inbound_rx
            .lock()
            .unwrap()
            .take()
            .expect("inbound receiver already taken")
    }
}

async fn connection_loop(
    url: String,
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundSignal>,
    inbound_tx: mpsc::UnboundedSender<InboundSignal>,
    mut shutdown_rx: mpsc::Receiver<()>,
    status_tx: watch::Sender<ConnectionStatus>,
) {
    let attempt = AtomicU32::new(0);

    loop {
        if shutdown_rx.try_recv().is_ok() {
            let _ = status_tx.send(ConnectionStatus::Disconnected);
            return;
        }

        let current_attempt = attempt.load(Ordering::SeqCst);
        let _ = status_tx.send(if current_attempt > 0 {
            ConnectionStatus::Reconnecting { attempt: current_attempt }
        } else {
            ConnectionStatus::Connecting
        });

        match tokio_tungstenite::connect_async(&url).await {
            Ok((stream, _)) => {
                info!(url = %url, "signalling gateway connected");
                attempt.store(0, Ordering::SeqCst);
                let _ = status_tx.send(ConnectionStatus::Connected);
                let (mut sink, mut source) = stream.split();

                loop {
                    tokio::select! {
                        msg = source.next() => {
                            match msg {
                                Some(Ok(Message::Text(text))) => {
                                    handle_inbound_text(&text, &inbound_tx);
                                }
                                Some(Ok(Message::Ping(payload))) => {
                                    let _ = sink.send(Message::Pong(payload)).await;
                                }
                                Some(Ok(Message::Close(_))) | None => {
                                    warn!("signalling gateway closed by peer");
                                    break;
                                }
                                Some(Err(e)) => {
                                    warn!(error = %e, "signalling gateway read error");
                                    break;
                                }
                                _ => {}
                            }
                        }
                        event = outbound_rx.recv() => {
                            match event {
                                Some(event) => {
                                    if let Err(e) = send_event(&mut sink, &event).await {
                                        warn!(error = %e, "failed to send signalling event");
                                        break;
                                    }
                                }
                                None => {
                                    debug!("signalling outbound channel closed; shutting down");
                                    let _ = status_tx.send(ConnectionStatus::Disconnected);
                                    return;
                                }
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            let _ = sink.send(Message::Close(None)).await;
                            let _ = status_tx.send(ConnectionStatus::Disconnected);
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(url = %url, error = %e, "signalling gateway connect failed");
            }
        }

        let n = attempt.fetch_add(1, Ordering::SeqCst);
        let backoff = Duration::from_secs(2u64.saturating_pow(n.min(5)).min(30));
        tokio::select! {
            () = tokio::time::sleep(backoff) => {}
            _ = shutdown_rx.recv() => {
                let _ = status_tx.send(ConnectionStatus::Disconnected);
                return;
            }
        }
    }
}

async fn send_event(
    sink: &mut (impl futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    event: &OutboundSignal,
) -> Result<(), SignallingError> {
    let json = serde_json::to_string(event)?;
    sink.send(Message::Text(json.into())).await?;
    Ok(())
}

fn handle_inbound_text(text: &str, inbound_tx: &mpsc::UnboundedSender<InboundSignal>) {
    match serde_json::from_str::<InboundSignal>(text) {
        Ok(event) => {
            let _ = inbound_tx.send(event);
        }
        Err(e) => {
            debug!(error = %e, "ignoring unparseable signalling message");
        }
    }
}
