//! Follower side of the relay channel: request/ack bookkeeping, lifecycle
//! signals and the websocket connector.

use crate::error::ChannelError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rdebug_core::relay::{
    decode_frame, encode_frame, AckPayload, RelayEnvelope, RelayMsg, DEFAULT_MAX_FRAME_BYTES,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// What the follower sees of its channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelSignal {
    Connected,
    Reconnected,
    Disconnected,
    Message(RelayEnvelope),
}

/// What a transport reports to the channel pump.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Up,
    Down,
    Frame(RelayEnvelope),
}

pub struct RelaySocket {
    outbound: mpsc::Sender<RelayEnvelope>,
    pending: Mutex<HashMap<u64, oneshot::Sender<AckPayload>>>,
    next_request: AtomicU64,
    connected: AtomicBool,
    ack_timeout: Duration,
}

impl RelaySocket {
    fn new(outbound: mpsc::Sender<RelayEnvelope>, ack_timeout: Duration) -> Self {
        Self {
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            ack_timeout,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Sends `msg` and waits for the matching ack.
    pub async fn request(&self, msg: RelayMsg) -> Result<AckPayload, ChannelError> {
        let request_id = self.next_request.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(request_id, tx);

        if self
            .outbound
            .send(RelayEnvelope::request(request_id, msg))
            .await
            .is_err()
        {
            self.lock_pending().remove(&request_id);
            return Err(ChannelError::Closed);
        }

        let ack = match tokio::time::timeout(self.ack_timeout, rx).await {
            Ok(Ok(ack)) => ack,
            Ok(Err(_)) => return Err(ChannelError::Closed),
            Err(_) => {
                self.lock_pending().remove(&request_id);
                return Err(ChannelError::Timeout);
            }
        };
        match ack.error {
            Some(error) => Err(ChannelError::Rejected {
                code: error.code,
                message: error.message,
            }),
            None => Ok(ack),
        }
    }

    /// Completes a pending request if `envelope` is its ack, otherwise hands
    /// the envelope back.
    fn resolve(&self, envelope: RelayEnvelope) -> Option<RelayEnvelope> {
        let RelayMsg::Ack(ack) = envelope.msg else {
            return Some(envelope);
        };
        let Some(request_id) = envelope.request_id else {
            debug!(event = "relay_ack_without_request");
            return None;
        };
        match self.lock_pending().remove(&request_id) {
            Some(waiter) => {
                let _ = waiter.send(ack);
            }
            None => debug!(event = "relay_ack_unmatched", request_id),
        }
        None
    }

    fn fail_pending(&self) {
        self.lock_pending().clear();
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<AckPayload>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// An opened relay channel as seen by its owner.
pub struct ChannelEnd {
    pub socket: Arc<RelaySocket>,
    pub signals: mpsc::UnboundedReceiver<ChannelSignal>,
}

impl ChannelEnd {
    /// Wires a transport into a channel end. Acks are resolved here and never
    /// reach `signals`.
    pub fn wire(
        outbound: mpsc::Sender<RelayEnvelope>,
        mut link: mpsc::UnboundedReceiver<LinkEvent>,
        ack_timeout: Duration,
    ) -> Self {
        let socket = Arc::new(RelaySocket::new(outbound, ack_timeout));
        let (signal_tx, signals) = mpsc::unbounded_channel();
        let pump = socket.clone();
        tokio::spawn(async move {
            let mut was_up = false;
            while let Some(event) = link.recv().await {
                let signal = match event {
                    LinkEvent::Up => {
                        pump.connected.store(true, Ordering::SeqCst);
                        let signal = if was_up {
                            ChannelSignal::Reconnected
                        } else {
                            ChannelSignal::Connected
                        };
                        was_up = true;
                        signal
                    }
                    LinkEvent::Down => {
                        if !pump.connected.swap(false, Ordering::SeqCst) {
                            continue;
                        }
                        pump.fail_pending();
                        ChannelSignal::Disconnected
                    }
                    LinkEvent::Frame(envelope) => match pump.resolve(envelope) {
                        Some(envelope) => ChannelSignal::Message(envelope),
                        None => continue,
                    },
                };
                if signal_tx.send(signal).is_err() {
                    break;
                }
            }
            if pump.connected.swap(false, Ordering::SeqCst) {
                pump.fail_pending();
                let _ = signal_tx.send(ChannelSignal::Disconnected);
            }
        });
        Self { socket, signals }
    }
}

#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn open(&self, namespace: &str, ack_timeout: Duration)
        -> Result<ChannelEnd, ChannelError>;
}

/// Connects to a hub's websocket endpoint and keeps reconnecting.
pub struct WsConnector {
    base_url: String,
}

impl WsConnector {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl RelayConnector for WsConnector {
    async fn open(
        &self,
        namespace: &str,
        ack_timeout: Duration,
    ) -> Result<ChannelEnd, ChannelError> {
        let base = self.base_url.trim_end_matches('/');
        if !(base.starts_with("ws://") || base.starts_with("wss://")) {
            return Err(ChannelError::Connect(format!("not a websocket url: {base}")));
        }
        let url = format!("{base}{namespace}");
        let (out_tx, out_rx) = mpsc::channel(256);
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        tokio::spawn(ws_link_loop(url, out_rx, link_tx));
        Ok(ChannelEnd::wire(out_tx, link_rx, ack_timeout))
    }
}

async fn ws_link_loop(
    url: String,
    mut out_rx: mpsc::Receiver<RelayEnvelope>,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
) {
    let mut backoff = Duration::from_secs(1);
    loop {
        let (ws, _) = match connect_async(url.as_str()).await {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "relay_connect_error", url = %url, error = %err);
                if link_tx.is_closed() {
                    return;
                }
                tokio::time::sleep(backoff).await;
                backoff = next_backoff(backoff);
                continue;
            }
        };
        backoff = Duration::from_secs(1);
        info!(event = "relay_connected", url = %url);
        if link_tx.send(LinkEvent::Up).is_err() {
            return;
        }

        let (mut sink, mut stream) = ws.split();
        let owner_gone = loop {
            tokio::select! {
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match decode_frame::<RelayEnvelope>(&text, DEFAULT_MAX_FRAME_BYTES) {
                            Ok(envelope) => {
                                if link_tx.send(LinkEvent::Frame(envelope)).is_err() {
                                    break true;
                                }
                            }
                            Err(err) => warn!(event = "relay_frame_invalid", error = %err),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break false,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(event = "relay_read_error", error = %err);
                        break false;
                    }
                },
                outgoing = out_rx.recv() => match outgoing {
                    Some(envelope) => match encode_frame(&envelope, DEFAULT_MAX_FRAME_BYTES) {
                        Ok(text) => {
                            if sink.send(Message::Text(text)).await.is_err() {
                                break false;
                            }
                        }
                        Err(err) => warn!(event = "relay_encode_error", error = %err),
                    },
                    None => break true,
                },
            }
        };
        let _ = sink.close().await;
        info!(event = "relay_disconnected", url = %url);
        if owner_gone || link_tx.send(LinkEvent::Down).is_err() {
            return;
        }
        tokio::time::sleep(backoff).await;
        backoff = next_backoff(backoff);
    }
}

fn next_backoff(current: Duration) -> Duration {
    let next = current + current;
    if next > Duration::from_secs(10) {
        Duration::from_secs(10)
    } else {
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdebug_core::relay::ConnectClientPayload;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn request_resolves_on_matching_ack() {
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let mut end = ChannelEnd::wire(out_tx, link_rx, Duration::from_secs(3));
        link_tx.send(LinkEvent::Up).expect("up");
        assert_eq!(end.signals.recv().await, Some(ChannelSignal::Connected));
        assert!(end.socket.is_connected());

        let socket = end.socket.clone();
        let waiter = tokio::spawn(async move {
            socket
                .request(RelayMsg::ConnectClient(ConnectClientPayload {
                    id: "client-1".to_string(),
                }))
                .await
        });

        let sent = out_rx.recv().await.expect("request sent");
        let request_id = sent.request_id.expect("request id");
        link_tx
            .send(LinkEvent::Frame(RelayEnvelope::ack(
                Some(request_id),
                Some("id4".to_string()),
            )))
            .expect("ack");

        let ack = waiter.await.expect("join").expect("ack");
        assert_eq!(ack.transaction_id.as_deref(), Some("id4"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn nack_becomes_rejected_error() {
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let end = ChannelEnd::wire(out_tx, link_rx, Duration::from_secs(3));
        link_tx.send(LinkEvent::Up).expect("up");

        let socket = end.socket.clone();
        let waiter = tokio::spawn(async move {
            socket
                .request(RelayMsg::ConnectClient(ConnectClientPayload {
                    id: "client-1".to_string(),
                }))
                .await
        });
        let sent = out_rx.recv().await.expect("request sent");
        link_tx
            .send(LinkEvent::Frame(RelayEnvelope::nack(
                sent.request_id,
                "client_taken",
                "in use",
            )))
            .expect("nack");

        let result = waiter.await.expect("join");
        assert!(matches!(result, Err(ChannelError::Rejected { code, .. }) if code == "client_taken"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn link_down_fails_pending_and_signals_reconnect() {
        let (out_tx, _out_rx) = mpsc::channel(8);
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let mut end = ChannelEnd::wire(out_tx, link_rx, Duration::from_secs(3));
        link_tx.send(LinkEvent::Up).expect("up");
        assert_eq!(end.signals.recv().await, Some(ChannelSignal::Connected));

        let socket = end.socket.clone();
        let waiter = tokio::spawn(async move {
            socket
                .request(RelayMsg::ConnectClient(ConnectClientPayload {
                    id: "client-1".to_string(),
                }))
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        link_tx.send(LinkEvent::Down).expect("down");
        assert_eq!(end.signals.recv().await, Some(ChannelSignal::Disconnected));
        assert_eq!(waiter.await.expect("join"), Err(ChannelError::Closed));

        link_tx.send(LinkEvent::Up).expect("up again");
        assert_eq!(end.signals.recv().await, Some(ChannelSignal::Reconnected));
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        assert_eq!(next_backoff(Duration::from_secs(1)), Duration::from_secs(2));
        assert_eq!(next_backoff(Duration::from_secs(8)), Duration::from_secs(10));
    }
}
