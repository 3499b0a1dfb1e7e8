use crate::bus::{BusEvent, EventBus};
use crate::channel::{ChannelEnd, LinkEvent, RelayConnector};
use crate::client::{Client, ClientEvent, ClientEventKind, WeakClient};
use crate::config::{ClientOptions, HubConfig};
use crate::error::{ChannelError, HubError};
use crate::registry::Registry;
use crate::session::{Session, WeakSession};
use async_trait::async_trait;
use rdebug_core::relay::{CommandPayload, RelayEnvelope, RelayMsg};
use rdebug_core::{CommandId, OutputChannel, SessionEvent};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub enum HubEvent {
    /// A listened leader's session became ready and is now relayed.
    Session(Session),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HubEventKind {
    Session,
}

impl BusEvent for HubEvent {
    type Kind = HubEventKind;

    fn kind(&self) -> HubEventKind {
        HubEventKind::Session
    }
}

struct FollowerChannel {
    /// Set once the follower announced itself with `connect-client`.
    client_id: Option<String>,
    sender: mpsc::Sender<RelayEnvelope>,
    /// Dropped with the entry, which ends the channel's serve loop.
    _evict: oneshot::Sender<()>,
}

pub struct Hub {
    config: HubConfig,
    registry: Arc<Registry>,
    sessions: RwLock<HashMap<String, WeakSession>>,
    channels: RwLock<HashMap<String, FollowerChannel>>,
    conn_counter: AtomicU64,
    events: EventBus<HubEvent>,
    leaders: Mutex<Vec<WeakClient>>,
}

impl Hub {
    pub fn new(config: HubConfig, registry: Arc<Registry>) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            sessions: RwLock::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
            conn_counter: AtomicU64::new(0),
            events: EventBus::new(),
            leaders: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn on(&self, kind: HubEventKind) -> mpsc::UnboundedReceiver<HubEvent> {
        self.events.on(kind)
    }

    pub fn leaders(&self) -> Vec<Client> {
        let mut leaders = self.leaders.lock().unwrap_or_else(PoisonError::into_inner);
        leaders.retain(|client| client.upgrade().is_some());
        leaders.iter().filter_map(WeakClient::upgrade).collect()
    }

    /// Relays the sessions of a leader client and connects it.
    pub async fn listen(self: &Arc<Self>, client: &Client) -> Result<(), HubError> {
        self.observe(client);
        client.connect(None).await?;
        Ok(())
    }

    fn observe(self: &Arc<Self>, client: &Client) {
        let hub = Arc::downgrade(self);
        client.observe_sessions(move |session| {
            let Some(hub) = hub.upgrade() else {
                return;
            };
            hub.track(session);
        });
        let mut leaders = self.leaders.lock().unwrap_or_else(PoisonError::into_inner);
        leaders.retain(|leader| leader.upgrade().is_some());
        leaders.push(client.downgrade());
    }

    /// Starts relaying `session`. Must run before the session emits `ready`.
    pub(crate) fn track(self: &Arc<Self>, session: &Session) {
        let events = session.on_any();
        tokio::spawn(relay_session(
            Arc::downgrade(self),
            session.clone(),
            events,
        ));
    }

    pub async fn session_for_id(&self, id: &str) -> Option<Session> {
        self.sessions.read().await.get(id).and_then(WeakSession::upgrade)
    }

    /// Client ids announced on open follower channels.
    pub async fn follower_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .channels
            .read()
            .await
            .values()
            .filter_map(|channel| channel.client_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn register_session(&self, session: &Session) {
        let id = session.id();
        let name = session.name();
        if let Some(client_id) = self.config.lock_for(&name) {
            session.lock_to_client(client_id);
        }
        self.sessions
            .write()
            .await
            .insert(id.clone(), session.downgrade());
        info!(event = "hub_session_registered", session_id = %id, name = %name);
        self.events.emit(HubEvent::Session(session.clone()));
    }

    async fn unregister_session(&self, id: &str) {
        if self.sessions.write().await.remove(id).is_some() {
            info!(event = "hub_session_removed", session_id = %id);
        }
    }

    /// Sends one session event to every announced follower, or only to the
    /// locked client's channel.
    async fn broadcast_event(&self, session: &Session, session_id: &str, event: &SessionEvent) {
        let (kind, args) = match event.to_relay() {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "hub_event_encode_error", session_id = %session_id, error = %err);
                return;
            }
        };
        let envelope = RelayEnvelope::event(session_id, kind, args);
        let locked = session.locked_client_id();

        let targets: Vec<(String, mpsc::Sender<RelayEnvelope>)> = {
            let channels = self.channels.read().await;
            channels
                .iter()
                .filter(|(_, channel)| match (&channel.client_id, &locked) {
                    (None, _) => false,
                    (Some(_), None) => true,
                    (Some(client_id), Some(locked)) => client_id == locked,
                })
                .map(|(conn_id, channel)| (conn_id.clone(), channel.sender.clone()))
                .collect()
        };

        let mut stale = Vec::new();
        for (conn_id, sender) in targets {
            match sender.try_send(envelope.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    stale.push(conn_id);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(event = "hub_slow_follower", conn_id = %conn_id);
                    stale.push(conn_id);
                }
            }
        }
        for conn_id in stale {
            self.unregister_channel(&conn_id).await;
        }
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("relay-conn-{id}")
    }

    async fn unregister_channel(&self, conn_id: &str) {
        if let Some(channel) = self.channels.write().await.remove(conn_id) {
            info!(
                event = "hub_channel_closed",
                conn_id = %conn_id,
                client_id = %channel.client_id.unwrap_or_default()
            );
        }
    }

    /// Serves one follower channel until `inbound` ends or the hub evicts
    /// the channel. Returning drops `outbound`, which closes the transport.
    pub async fn serve_channel(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<RelayEnvelope>,
        outbound: mpsc::Sender<RelayEnvelope>,
    ) {
        let conn_id = self.next_conn_id();
        let (evict, mut evicted) = oneshot::channel();
        self.channels.write().await.insert(
            conn_id.clone(),
            FollowerChannel {
                client_id: None,
                sender: outbound.clone(),
                _evict: evict,
            },
        );
        info!(event = "hub_channel_open", conn_id = %conn_id);

        loop {
            let envelope = tokio::select! {
                _ = &mut evicted => {
                    info!(event = "hub_channel_evicted", conn_id = %conn_id);
                    break;
                }
                envelope = inbound.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };
            let Some(reply) = self.handle_envelope(&conn_id, envelope).await else {
                continue;
            };
            tokio::select! {
                _ = &mut evicted => {
                    info!(event = "hub_channel_evicted", conn_id = %conn_id);
                    break;
                }
                sent = outbound.send(reply) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
        self.unregister_channel(&conn_id).await;
    }

    async fn handle_envelope(&self, conn_id: &str, envelope: RelayEnvelope) -> Option<RelayEnvelope> {
        let request_id = envelope.request_id;
        match envelope.msg {
            RelayMsg::ConnectClient(payload) => {
                let announced = match self.channels.write().await.get_mut(conn_id) {
                    Some(channel) => {
                        channel.client_id = Some(payload.id.clone());
                        true
                    }
                    None => false,
                };
                if !announced {
                    warn!(event = "hub_announce_unknown_channel", conn_id = %conn_id, client_id = %payload.id);
                    return Some(RelayEnvelope::nack(
                        request_id,
                        "unknown_channel",
                        format!("channel {conn_id} is closed"),
                    ));
                }
                info!(event = "hub_client_connected", conn_id = %conn_id, client_id = %payload.id);
                Some(RelayEnvelope::ack(request_id, None))
            }
            RelayMsg::DisconnectClient(_) => {
                let previous = self
                    .channels
                    .write()
                    .await
                    .get_mut(conn_id)
                    .and_then(|channel| channel.client_id.take());
                info!(
                    event = "hub_client_disconnected",
                    conn_id = %conn_id,
                    client_id = %previous.unwrap_or_default()
                );
                Some(RelayEnvelope::ack(request_id, None))
            }
            RelayMsg::Command(payload) => match self.route_command(conn_id, payload).await {
                Ok(transaction_id) => Some(RelayEnvelope::ack(
                    request_id,
                    transaction_id.map(|id| id.to_string()),
                )),
                Err((code, message)) => {
                    warn!(event = "hub_command_rejected", conn_id = %conn_id, code = code, message = %message);
                    Some(RelayEnvelope::nack(request_id, code, message))
                }
            },
            RelayMsg::Event(_) | RelayMsg::Ack(_) => {
                debug!(event = "hub_unexpected_message", conn_id = %conn_id);
                None
            }
        }
    }

    async fn route_command(
        &self,
        conn_id: &str,
        payload: CommandPayload,
    ) -> Result<Option<CommandId>, (&'static str, String)> {
        let Some(session) = self.session_for_id(&payload.session).await else {
            return Err(("unknown_session", format!("no session {}", payload.session)));
        };
        if let Some(locked) = session.locked_client_id() {
            let caller = self
                .channels
                .read()
                .await
                .get(conn_id)
                .and_then(|channel| channel.client_id.clone());
            if caller.as_deref() != Some(locked.as_str()) {
                return Err(("session_locked", format!("session locked to {locked}")));
            }
        }
        debug!(event = "hub_command", conn_id = %conn_id, session_id = %payload.session, name = %payload.name);
        session
            .send_command(&payload.name, payload.args, payload.data, None)
            .await
            .map_err(|err| ("command_failed", err.to_string()))
    }

    /// In-process channel with the same contract as the websocket endpoint.
    pub fn fake_channel(self: &Arc<Self>) -> ChannelEnd {
        let (out_tx, out_rx) = mpsc::channel(self.config.queue_capacity);
        let (in_tx, mut in_rx) = mpsc::channel(self.config.queue_capacity);
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        tokio::spawn(self.clone().serve_channel(out_rx, in_tx));
        tokio::spawn(async move {
            if link_tx.send(LinkEvent::Up).is_err() {
                return;
            }
            while let Some(envelope) = in_rx.recv().await {
                if link_tx.send(LinkEvent::Frame(envelope)).is_err() {
                    return;
                }
            }
            let _ = link_tx.send(LinkEvent::Down);
        });
        ChannelEnd::wire(out_tx, link_rx, self.config.ack_timeout)
    }

    pub fn fake_connector(self: &Arc<Self>) -> Arc<dyn RelayConnector> {
        Arc::new(FakeConnector {
            hub: Arc::downgrade(self),
        })
    }

    /// Connects to an engine the runner just started and waits for its
    /// session. Returns the session id.
    pub async fn attach_engine(
        self: &Arc<Self>,
        host: &str,
        port: u16,
        session_name: &str,
    ) -> Result<String, HubError> {
        let options = ClientOptions::engine(host, port, session_name)
            .with_connect_timeout(self.config.attach_connect_timeout);
        let client = Client::new(options, self.registry.clone());
        let mut sessions = client.on(ClientEventKind::Session);
        self.listen(&client).await?;

        let wait = async {
            loop {
                match sessions.recv().await {
                    Some(ClientEvent::Session(session)) if session.name() == session_name => {
                        return Some(session.id());
                    }
                    Some(_) => continue,
                    None => return None,
                }
            }
        };
        match tokio::time::timeout(self.config.attach_wait, wait).await {
            Ok(Some(session_id)) => Ok(session_id),
            _ => {
                warn!(event = "hub_attach_timeout", host = %host, port = port, name = %session_name);
                Err(HubError::AttachTimeout {
                    host: host.to_string(),
                    port,
                })
            }
        }
    }

    /// Forwards process output when the session asked for it. Returns
    /// whether the channel is enabled.
    pub async fn script_output(&self, session_id: &str, channel: OutputChannel, data: &str) -> bool {
        let Some(session) = self.session_for_id(session_id).await else {
            debug!(event = "hub_output_unknown_session", session_id = %session_id);
            return false;
        };
        let enabled = session.runtime_option(&channel.option_key());
        if enabled {
            session.emit(SessionEvent::Output {
                channel,
                data: data.to_string(),
            });
        }
        enabled
    }

    /// The runner saw the engine process exit.
    pub async fn script_end(&self, session_id: &str) -> bool {
        let Some(session) = self.session_for_id(session_id).await else {
            return false;
        };
        session.end(false);
        true
    }
}

async fn relay_session(
    hub: Weak<Hub>,
    session: Session,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(hub) = hub.upgrade() else {
            return;
        };
        if matches!(event, SessionEvent::Ready { .. }) {
            hub.register_session(&session).await;
        }
        let session_id = session.id();
        if session_id.is_empty() {
            // Handshake traffic before the session has an identity.
            continue;
        }
        hub.broadcast_event(&session, &session_id, &event).await;
        if matches!(event, SessionEvent::End { .. }) {
            hub.unregister_session(&session_id).await;
            return;
        }
    }
}

struct FakeConnector {
    hub: Weak<Hub>,
}

#[async_trait]
impl RelayConnector for FakeConnector {
    async fn open(&self, _namespace: &str, _ack_timeout: Duration) -> Result<ChannelEnd, ChannelError> {
        let hub = self.hub.upgrade().ok_or(ChannelError::Closed)?;
        Ok(hub.fake_channel())
    }
}
