//! Owner of one session transport: a raw engine socket (leader) or a relay
//! channel to the hub (follower).

use crate::bus::{BusEvent, EventBus};
use crate::channel::{ChannelEnd, ChannelSignal, RelaySocket};
use crate::config::{ClientOptions, EngineAddr, TransportMode};
use crate::error::ClientError;
use crate::registry::{Registry, RegistryEvent};
use crate::session::Session;
use rdebug_core::relay::{ConnectClientPayload, DisconnectClientPayload, RelayEnvelope, RelayMsg};
use rdebug_core::{EventKind, SessionEvent};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const READ_CHUNK_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connect,
    Disconnect,
    Session(Session),
    /// The engine never accepted a connection within the connect timeout.
    ConnectTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientEventKind {
    Connect,
    Disconnect,
    Session,
    ConnectTimeout,
}

impl BusEvent for ClientEvent {
    type Kind = ClientEventKind;

    fn kind(&self) -> ClientEventKind {
        match self {
            Self::Connect => ClientEventKind::Connect,
            Self::Disconnect => ClientEventKind::Disconnect,
            Self::Session(_) => ClientEventKind::Session,
            Self::ConnectTimeout => ClientEventKind::ConnectTimeout,
        }
    }
}

type SessionHook = Arc<dyn Fn(&Session) + Send + Sync>;

#[derive(Clone)]
pub struct Client(Arc<ClientInner>);

#[derive(Clone)]
pub struct WeakClient(Weak<ClientInner>);

impl WeakClient {
    pub fn upgrade(&self) -> Option<Client> {
        self.0.upgrade().map(Client)
    }
}

struct ClientInner {
    options: ClientOptions,
    registry: Arc<Registry>,
    events: EventBus<ClientEvent>,
    hooks: Mutex<Vec<SessionHook>>,
    state: Mutex<ClientState>,
}

#[derive(Default)]
struct ClientState {
    id: String,
    connected: bool,
    connecting: bool,
    /// The one session of the current engine connection.
    engine_session: Option<Session>,
    sessions: HashMap<String, Session>,
    relay: Option<Arc<RelaySocket>>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Client {
    pub fn new(options: ClientOptions, registry: Arc<Registry>) -> Self {
        let state = ClientState {
            id: registry.next_client_id(),
            ..ClientState::default()
        };
        Self(Arc::new(ClientInner {
            options,
            registry,
            events: EventBus::new(),
            hooks: Mutex::new(Vec::new()),
            state: Mutex::new(state),
        }))
    }

    pub fn downgrade(&self) -> WeakClient {
        WeakClient(Arc::downgrade(&self.0))
    }

    pub fn id(&self) -> String {
        self.lock().id.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.0.registry
    }

    pub fn session(&self, id: &str) -> Option<Session> {
        self.lock().sessions.get(id).cloned()
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.lock().sessions.values().cloned().collect()
    }

    pub fn on(&self, kind: ClientEventKind) -> mpsc::UnboundedReceiver<ClientEvent> {
        self.0.events.on(kind)
    }

    pub fn on_any(&self) -> mpsc::UnboundedReceiver<ClientEvent> {
        self.0.events.on_any()
    }

    /// Runs `hook` on every session this client creates, before the session
    /// produces its first event.
    pub fn observe_sessions(&self, hook: impl Fn(&Session) + Send + Sync + 'static) {
        self.0
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(hook));
    }

    /// Starts connecting. Completion is reported through `connect` (or
    /// `connect-timeout`) events.
    pub async fn connect(&self, id: Option<String>) -> Result<(), ClientError> {
        let mode = self.0.options.mode()?;
        {
            let mut state = self.lock();
            if state.connected || state.connecting {
                return Err(ClientError::AlreadyConnected);
            }
            state.connecting = true;
            if let Some(id) = id {
                state.id = id;
            }
        }

        match mode {
            TransportMode::Engine(addr) => {
                tokio::spawn(self.clone().engine_connect_loop(addr));
                Ok(())
            }
            TransportMode::Relay(connector) => {
                let opened = connector
                    .open(&self.0.options.namespace, self.0.options.ack_timeout)
                    .await;
                match opened {
                    Ok(end) => {
                        tokio::spawn(self.clone().relay_loop(end));
                        Ok(())
                    }
                    Err(err) => {
                        self.lock().connecting = false;
                        Err(err.into())
                    }
                }
            }
        }
    }

    async fn engine_connect_loop(self, addr: EngineAddr) {
        let target = addr.to_socket_string();
        let started = Instant::now();
        let mut ticker = tokio::time::interval(self.0.options.retry_interval);
        loop {
            ticker.tick().await;
            match TcpStream::connect(&target).await {
                Ok(stream) => {
                    self.on_engine_connected(stream).await;
                    return;
                }
                Err(err) => {
                    debug!(event = "engine_connect_retry", addr = %target, error = %err);
                }
            }
            if started.elapsed() > self.0.options.connect_timeout {
                warn!(
                    event = "engine_connect_timeout",
                    client_id = %self.id(),
                    addr = %target,
                    timeout_ms = self.0.options.connect_timeout.as_millis() as u64
                );
                self.lock().connecting = false;
                self.0.events.emit(ClientEvent::ConnectTimeout);
                return;
            }
        }
    }

    async fn on_engine_connected(&self, stream: TcpStream) {
        let (reader, writer) = stream.into_split();
        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let session = Session::engine(
            line_tx,
            self.0.registry.clone(),
            self.0.options.session_name.clone(),
            self.0.options.abort_on_engine_eof,
        );

        let client_id = {
            let mut state = self.lock();
            if state.engine_session.is_some() {
                warn!(event = "engine_session_exists", client_id = %state.id);
                return;
            }
            state.connected = true;
            state.connecting = false;
            state.engine_session = Some(session.clone());
            state.id.clone()
        };
        info!(event = "engine_connected", client_id = %client_id);

        self.0.registry.insert(self);
        self.0.events.emit(ClientEvent::Connect);
        self.0.registry.announce(RegistryEvent::Connect {
            client_id: client_id.clone(),
        });

        self.run_hooks(&session);
        let lifecycle = session.on_any();
        let tasks = vec![
            tokio::spawn(writer_loop(client_id.clone(), writer, line_rx)),
            tokio::spawn(self.clone().engine_lifecycle(session.clone(), lifecycle)),
            tokio::spawn(reader_loop(client_id.clone(), reader, session.clone())),
        ];
        self.lock().tasks.extend(tasks);

        if let Err(err) = session.start().await {
            warn!(event = "session_start_failed", client_id = %client_id, error = %err);
            self.disconnect().await;
        }
    }

    /// Registers the engine session on `ready` and tears the connection down
    /// on `end`; the engine serves one session per connection.
    async fn engine_lifecycle(
        self,
        session: Session,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event.kind() {
                EventKind::Ready => {
                    let session_id = session.id();
                    self.lock()
                        .sessions
                        .insert(session_id.clone(), session.clone());
                    info!(event = "client_session", client_id = %self.id(), session_id = %session_id);
                    self.0.events.emit(ClientEvent::Session(session.clone()));
                }
                EventKind::End => {
                    let session_id = session.id();
                    {
                        let mut state = self.lock();
                        state.sessions.remove(&session_id);
                        state.engine_session = None;
                    }
                    info!(event = "client_session_end", client_id = %self.id(), session_id = %session_id);
                    self.disconnect().await;
                    return;
                }
                _ => {}
            }
        }
    }

    async fn relay_loop(self, end: ChannelEnd) {
        let ChannelEnd {
            socket,
            mut signals,
        } = end;
        self.lock().relay = Some(socket.clone());
        while let Some(signal) = signals.recv().await {
            match signal {
                ChannelSignal::Connected | ChannelSignal::Reconnected => {
                    self.announce(&socket).await;
                }
                ChannelSignal::Disconnected => self.disconnect().await,
                ChannelSignal::Message(envelope) => self.on_relay_message(&socket, envelope),
            }
        }
        debug!(event = "relay_channel_closed", client_id = %self.id());
    }

    async fn announce(&self, socket: &RelaySocket) {
        let client_id = self.id();
        if !self.0.registry.reserve(&client_id) {
            return;
        }
        let request = RelayMsg::ConnectClient(ConnectClientPayload {
            id: client_id.clone(),
        });
        if let Err(err) = socket.request(request).await {
            warn!(event = "relay_announce_failed", client_id = %client_id, error = %err);
            self.0.registry.remove(&client_id);
            return;
        }
        {
            let mut state = self.lock();
            state.connected = true;
            state.connecting = false;
        }
        info!(event = "relay_client_connected", client_id = %client_id);
        self.0.registry.insert(self);
        self.0.registry.announce(RegistryEvent::Connect {
            client_id: client_id.clone(),
        });
        self.0.events.emit(ClientEvent::Connect);
    }

    fn on_relay_message(&self, socket: &Arc<RelaySocket>, envelope: RelayEnvelope) {
        let RelayMsg::Event(event) = envelope.msg else {
            debug!(event = "relay_message_ignored", client_id = %self.id());
            return;
        };
        if !self.is_connected() {
            return;
        }

        let (session, created) = {
            let mut state = self.lock();
            match state.sessions.get(&event.session) {
                Some(session) => (session.clone(), false),
                None => {
                    let session = Session::sync(socket.clone(), event.session.clone());
                    state.sessions.insert(event.session.clone(), session.clone());
                    (session, true)
                }
            }
        };

        if created {
            self.run_hooks(&session);
            let mut ended = session.on(EventKind::End);
            let client = self.downgrade();
            let session_id = event.session.clone();
            tokio::spawn(async move {
                if ended.recv().await.is_none() {
                    return;
                }
                if let Some(client) = client.upgrade() {
                    client.lock().sessions.remove(&session_id);
                }
            });
            debug!(event = "mirror_session_created", client_id = %self.id(), session_id = %event.session);
            self.0.events.emit(ClientEvent::Session(session.clone()));
        }

        session.replay(&event.kind, event.args);
    }

    /// Idempotent; always ends with local and registry `disconnect` events.
    pub async fn disconnect(&self) {
        let (relay, tasks, active) = {
            let mut state = self.lock();
            if !state.connected {
                return;
            }
            (
                state.relay.clone(),
                std::mem::take(&mut state.tasks),
                state.sessions.len(),
            )
        };

        match relay {
            None => {
                if active > 0 {
                    // TODO: issue `quit unconditionally` on the session before dropping the socket.
                    warn!(
                        event = "disconnect_with_active_session",
                        client_id = %self.id(),
                        sessions = active
                    );
                }
                {
                    let mut state = self.lock();
                    state.engine_session = None;
                    state.sessions.clear();
                }
                for task in tasks {
                    task.abort();
                }
            }
            Some(socket) => {
                if socket.is_connected() {
                    let request = RelayMsg::DisconnectClient(DisconnectClientPayload::default());
                    if let Err(err) = socket.request(request).await {
                        debug!(event = "relay_disconnect_failed", client_id = %self.id(), error = %err);
                    }
                }
            }
        }
        self.finish_disconnect();
    }

    fn finish_disconnect(&self) {
        let client_id = {
            let mut state = self.lock();
            if !state.connected {
                return;
            }
            state.connected = false;
            state.id.clone()
        };
        self.0.registry.remove(&client_id);
        info!(event = "client_disconnected", client_id = %client_id);
        self.0.events.emit(ClientEvent::Disconnect);
        self.0.registry.announce(RegistryEvent::Disconnect { client_id });
    }

    fn run_hooks(&self, session: &Session) {
        let hooks: Vec<SessionHook> = self
            .0
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for hook in hooks {
            hook(session);
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.0.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn writer_loop(client_id: String, mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = rx.recv().await {
        let send = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        };
        if let Err(err) = send.await {
            debug!(event = "engine_write_error", client_id = %client_id, error = %err);
            break;
        }
    }
}

async fn reader_loop(client_id: String, mut reader: OwnedReadHalf, session: Session) {
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    let mut carry: Vec<u8> = Vec::new();
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!(event = "engine_eof", client_id = %client_id);
                break;
            }
            Ok(n) => {
                carry.extend_from_slice(&buf[..n]);
                let text = take_utf8(&mut carry);
                if !text.is_empty() {
                    session.receive(&text);
                }
            }
            Err(err) => {
                debug!(event = "engine_read_error", client_id = %client_id, error = %err);
                break;
            }
        }
    }
    session.transport_closed();
}

/// Drains the valid UTF-8 prefix of `carry`, keeping an incomplete trailing
/// sequence for the next read.
fn take_utf8(carry: &mut Vec<u8>) -> String {
    match std::str::from_utf8(carry.as_slice()) {
        Ok(text) => {
            let text = text.to_string();
            carry.clear();
            text
        }
        Err(err) if err.error_len().is_none() => {
            let tail = carry.split_off(err.valid_up_to());
            let text = String::from_utf8_lossy(&carry[..]).into_owned();
            *carry = tail;
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(&carry[..]).into_owned();
            carry.clear();
            text
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{LinkEvent, RelayConnector};
    use crate::config::HubConfig;
    use crate::error::ChannelError;
    use crate::hub::Hub;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::net::TcpListener;

    const SENTINEL: &str = r#"<suspended file="/tmp/demo.rb" line="1" threadId="1" frames="1"/>"#;

    /// Hub channel whose link state the test drives by hand.
    struct BouncingConnector {
        hub: Arc<Hub>,
        link: Mutex<Option<mpsc::UnboundedSender<LinkEvent>>>,
    }

    impl BouncingConnector {
        fn link(&self) -> mpsc::UnboundedSender<LinkEvent> {
            self.link
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
                .expect("channel opened")
        }
    }

    #[async_trait]
    impl RelayConnector for BouncingConnector {
        async fn open(
            &self,
            _namespace: &str,
            ack_timeout: Duration,
        ) -> Result<ChannelEnd, ChannelError> {
            let (out_tx, out_rx) = mpsc::channel(16);
            let (in_tx, mut in_rx) = mpsc::channel(16);
            let (link_tx, link_rx) = mpsc::unbounded_channel();
            tokio::spawn(self.hub.clone().serve_channel(out_rx, in_tx));
            let frames = link_tx.clone();
            tokio::spawn(async move {
                while let Some(envelope) = in_rx.recv().await {
                    if frames.send(LinkEvent::Frame(envelope)).is_err() {
                        return;
                    }
                }
            });
            let _ = link_tx.send(LinkEvent::Up);
            *self.link.lock().unwrap_or_else(PoisonError::into_inner) = Some(link_tx);
            Ok(ChannelEnd::wire(out_tx, link_rx, ack_timeout))
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ClientEvent>) -> ClientEvent {
        tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("timely event")
            .expect("event")
    }

    #[test]
    fn utf8_carry_keeps_split_sequences() {
        let mut carry = "é".as_bytes()[..1].to_vec();
        assert_eq!(take_utf8(&mut carry), "");
        assert_eq!(carry.len(), 1);
        carry.extend_from_slice(&"é".as_bytes()[1..]);
        assert_eq!(take_utf8(&mut carry), "é");
        assert!(carry.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn connect_without_transport_is_a_config_error() {
        let client = Client::new(ClientOptions::default(), Arc::new(Registry::new()));
        assert!(matches!(client.connect(None).await, Err(ClientError::Config(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_connect_fails_fast() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let client = Client::new(
            ClientOptions::engine("127.0.0.1", port, "demo"),
            Arc::new(Registry::new()),
        );
        client.connect(None).await.expect("first connect");
        assert_eq!(client.connect(None).await, Err(ClientError::AlreadyConnected));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unreachable_engine_reports_connect_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let client = Client::new(
            ClientOptions::engine("127.0.0.1", port, "demo")
                .with_connect_timeout(Duration::from_millis(300)),
            Arc::new(Registry::new()),
        );
        let mut events = client.on_any();
        client.connect(None).await.expect("connect starts");
        assert!(matches!(next_event(&mut events).await, ClientEvent::ConnectTimeout));
        assert!(!client.is_connected());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn engine_connect_registers_and_sends_start() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let registry = Arc::new(Registry::new());
        let mut global = registry.events().on_any();
        let client = Client::new(ClientOptions::engine("127.0.0.1", port, "demo"), registry.clone());
        let mut events = client.on_any();

        client.connect(Some("client-leader".to_string())).await.expect("connect");
        let (mut engine, _) = listener.accept().await.expect("accept");

        assert!(matches!(next_event(&mut events).await, ClientEvent::Connect));
        assert_eq!(
            global.recv().await,
            Some(RegistryEvent::Connect {
                client_id: "client-leader".to_string()
            })
        );
        assert_eq!(registry.connected_ids(), vec!["client-leader".to_string()]);

        let mut buf = [0u8; 64];
        let n = engine.read(&mut buf).await.expect("read start");
        assert_eq!(&buf[..n], b"start\n");

        client.disconnect().await;
        assert!(matches!(next_event(&mut events).await, ClientEvent::Disconnect));
        assert!(registry.connected_ids().is_empty());
        client.disconnect().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn relay_disconnect_withdraws_the_announcement() {
        let registry = Arc::new(Registry::new());
        let hub = Hub::new(HubConfig::default(), registry.clone());
        let client = Client::new(ClientOptions::relay(hub.fake_connector()), registry.clone());
        let mut events = client.on_any();

        client.connect(Some("client-f".to_string())).await.expect("connect");
        assert!(matches!(next_event(&mut events).await, ClientEvent::Connect));
        assert_eq!(hub.follower_ids().await, vec!["client-f".to_string()]);
        assert!(registry.contains("client-f"));

        client.disconnect().await;
        assert!(hub.follower_ids().await.is_empty());
        assert!(matches!(next_event(&mut events).await, ClientEvent::Disconnect));
        assert!(!client.is_connected());
        assert!(!registry.contains("client-f"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn relay_link_bounce_reannounces_and_resumes_events() {
        let registry = Arc::new(Registry::new());
        let hub = Hub::new(HubConfig::default(), registry.clone());
        let connector = Arc::new(BouncingConnector {
            hub: hub.clone(),
            link: Mutex::new(None),
        });
        let client = Client::new(ClientOptions::relay(connector.clone()), registry.clone());
        let mut events = client.on_any();

        client.connect(Some("client-f".to_string())).await.expect("connect");
        assert!(matches!(next_event(&mut events).await, ClientEvent::Connect));
        let link = connector.link();

        link.send(LinkEvent::Down).expect("down");
        assert!(matches!(next_event(&mut events).await, ClientEvent::Disconnect));
        assert!(!client.is_connected());
        assert!(!registry.contains("client-f"));

        link.send(LinkEvent::Up).expect("up");
        assert!(matches!(next_event(&mut events).await, ClientEvent::Connect));
        assert!(client.is_connected());
        assert_eq!(registry.connected_ids(), vec!["client-f".to_string()]);

        // Already registered: a further reconnect does not announce again.
        link.send(LinkEvent::Up).expect("up again");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(events.try_recv().is_err());

        let (writer, _wire) = mpsc::unbounded_channel();
        let session = Session::engine(writer, registry.clone(), "demo".to_string(), false);
        hub.track(&session);
        session.receive(SENTINEL);
        match next_event(&mut events).await {
            ClientEvent::Session(mirror) => {
                assert!(mirror.is_mirror());
                assert_eq!(mirror.id(), session.id());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
