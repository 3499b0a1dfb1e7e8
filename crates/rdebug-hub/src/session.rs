//! One debugging conversation: status machine, FIFO response correlation,
//! intercepted commands and event fan-out.

use crate::bus::{BusEvent, EventBus};
use crate::channel::RelaySocket;
use crate::error::SessionError;
use crate::registry::Registry;
use rdebug_core::relay::{CommandPayload, RelayMsg};
use rdebug_core::{
    format_command, CommandId, CommandResponse, EventKind, OutputChannel, Packet, PacketParser,
    ResponseArgs, SessionEvent, SessionStatus,
};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Responses kept for callbacks whose relay ack has not arrived yet.
const UNCLAIMED_CACHE_MAX: usize = 512;

impl BusEvent for SessionEvent {
    type Kind = EventKind;

    fn kind(&self) -> EventKind {
        SessionEvent::kind(self)
    }
}

pub type Reply = oneshot::Sender<CommandResponse>;

#[derive(Clone)]
pub struct Session(Arc<SessionInner>);

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("Session")
            .field("id", &state.id)
            .field("status", &state.status)
            .field("mirror", &self.is_mirror())
            .finish()
    }
}

#[derive(Clone)]
pub struct WeakSession(Weak<SessionInner>);

impl WeakSession {
    pub fn upgrade(&self) -> Option<Session> {
        self.0.upgrade().map(Session)
    }
}

struct SessionInner {
    transport: Transport,
    events: EventBus<SessionEvent>,
    state: Mutex<SessionState>,
}

enum Transport {
    Engine {
        writer: mpsc::UnboundedSender<String>,
        registry: Arc<Registry>,
        session_name: String,
        abort_on_eof: bool,
    },
    Relay(Arc<RelaySocket>),
}

struct PendingCommand {
    id: CommandId,
    name: String,
}

struct SessionState {
    id: String,
    name: String,
    status: SessionStatus,
    command_counter: u64,
    pending: VecDeque<PendingCommand>,
    callbacks: HashMap<CommandId, Reply>,
    unclaimed: VecDeque<CommandResponse>,
    runtime_options: HashMap<String, bool>,
    locked_client_id: Option<String>,
    parser: PacketParser,
}

impl SessionState {
    fn new(id: String, status: SessionStatus) -> Self {
        Self {
            id,
            name: String::new(),
            status,
            command_counter: 0,
            pending: VecDeque::new(),
            callbacks: HashMap::new(),
            unclaimed: VecDeque::new(),
            runtime_options: HashMap::new(),
            locked_client_id: None,
            parser: PacketParser::new(),
        }
    }
}

/// Commands answered locally instead of by the engine.
enum Intercept {
    Output { channel: OutputChannel, enabled: bool },
    FileSource,
}

impl Intercept {
    fn classify(name: &str, args: &[String]) -> Option<Self> {
        match name {
            "set" => {
                let channel = args.first()?.parse::<OutputChannel>().ok()?;
                let enabled = args
                    .get(1)
                    .map(|flag| matches!(flag.as_str(), "1" | "on" | "true"))
                    .unwrap_or(false);
                Some(Self::Output { channel, enabled })
            }
            "file-source" => Some(Self::FileSource),
            _ => None,
        }
    }
}

impl Session {
    /// Session bound to a direct engine socket. Starts in `init`.
    pub(crate) fn engine(
        writer: mpsc::UnboundedSender<String>,
        registry: Arc<Registry>,
        session_name: String,
        abort_on_eof: bool,
    ) -> Self {
        Self(Arc::new(SessionInner {
            transport: Transport::Engine {
                writer,
                registry,
                session_name,
                abort_on_eof,
            },
            events: EventBus::new(),
            state: Mutex::new(SessionState::new(String::new(), SessionStatus::Init)),
        }))
    }

    /// Mirror of a hub-side session, addressed by `id` over the relay.
    pub fn sync(socket: Arc<RelaySocket>, id: impl Into<String>) -> Self {
        Self(Arc::new(SessionInner {
            transport: Transport::Relay(socket),
            events: EventBus::new(),
            state: Mutex::new(SessionState::new(id.into(), SessionStatus::Ready)),
        }))
    }

    pub fn downgrade(&self) -> WeakSession {
        WeakSession(Arc::downgrade(&self.0))
    }

    pub fn ptr_eq(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn id(&self) -> String {
        self.lock().id.clone()
    }

    pub fn name(&self) -> String {
        self.lock().name.clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.lock().status
    }

    pub fn is_mirror(&self) -> bool {
        matches!(self.0.transport, Transport::Relay(_))
    }

    pub fn pending_commands(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn runtime_option(&self, key: &str) -> bool {
        self.lock().runtime_options.get(key).copied().unwrap_or(false)
    }

    pub fn locked_client_id(&self) -> Option<String> {
        self.lock().locked_client_id.clone()
    }

    pub fn lock_to_client(&self, client_id: impl Into<String>) {
        let client_id = client_id.into();
        let mut state = self.lock();
        info!(event = "session_locked", session_id = %state.id, client_id = %client_id);
        state.locked_client_id = Some(client_id);
    }

    pub fn on(&self, kind: EventKind) -> mpsc::UnboundedReceiver<SessionEvent> {
        self.0.events.on(kind)
    }

    pub fn on_any(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        self.0.events.on_any()
    }

    /// Issues a command. Returns the command id, or for a mirror the relay
    /// transaction id when the hub issued one.
    pub async fn send_command(
        &self,
        name: &str,
        args: Vec<String>,
        data: Option<String>,
        reply: Option<Reply>,
    ) -> Result<Option<CommandId>, SessionError> {
        match &self.0.transport {
            Transport::Engine { writer, .. } => self.send_engine(writer, name, args, reply).map(Some),
            Transport::Relay(socket) => self.send_relay(socket, name, args, data, reply).await,
        }
    }

    /// Sends a command and waits for its correlated response.
    pub async fn request(
        &self,
        name: &str,
        args: Vec<String>,
    ) -> Result<CommandResponse, SessionError> {
        let (tx, rx) = oneshot::channel();
        if self.send_command(name, args, None, Some(tx)).await?.is_none() {
            return Err(SessionError::NoResponse);
        }
        rx.await.map_err(|_| SessionError::NoResponse)
    }

    /// Initial handshake; the engine was started stopped and waits for it.
    pub(crate) async fn start(&self) -> Result<(), SessionError> {
        self.send_command("start", Vec::new(), None, None).await.map(|_| ())
    }

    fn send_engine(
        &self,
        writer: &mpsc::UnboundedSender<String>,
        name: &str,
        args: Vec<String>,
        reply: Option<Reply>,
    ) -> Result<CommandId, SessionError> {
        let mut state = self.lock();
        if state.status != SessionStatus::Ready && name != "start" {
            return Err(SessionError::NotReady(state.status));
        }
        state.command_counter += 1;
        let id = CommandId::from_counter(state.command_counter);

        let intercept = Intercept::classify(name, &args);
        if intercept.is_none() && writer.send(format_command(name, &args)).is_err() {
            return Err(SessionError::TransportClosed);
        }
        if let Some(reply) = reply {
            state.callbacks.insert(id.clone(), reply);
        }
        if intercept.is_none() && name != "start" {
            state.pending.push_back(PendingCommand {
                id: id.clone(),
                name: name.to_string(),
            });
        }
        debug!(event = "command_sent", session_id = %state.id, command_id = %id, name = %name);
        self.publish(
            &mut state,
            SessionEvent::Command {
                name: name.to_string(),
                args: args.clone(),
            },
        );

        match intercept {
            Some(Intercept::Output { channel, enabled }) => {
                state.runtime_options.insert(channel.option_key(), enabled);
                drop(state);
                let session = self.clone();
                let response = CommandResponse {
                    id: id.clone(),
                    name: name.to_string(),
                    args: ResponseArgs::Echo(args),
                    data: String::new(),
                };
                tokio::spawn(async move {
                    tokio::task::yield_now().await;
                    session.emit(SessionEvent::CommandResponse(response));
                });
            }
            Some(Intercept::FileSource) => {
                drop(state);
                let session = self.clone();
                let id = id.clone();
                let name = name.to_string();
                let path = args.into_iter().next();
                tokio::spawn(async move {
                    let (args, data) = read_source(path).await;
                    session.emit(SessionEvent::CommandResponse(CommandResponse {
                        id,
                        name,
                        args,
                        data,
                    }));
                });
            }
            None => {}
        }
        Ok(id)
    }

    async fn send_relay(
        &self,
        socket: &RelaySocket,
        name: &str,
        args: Vec<String>,
        data: Option<String>,
        reply: Option<Reply>,
    ) -> Result<Option<CommandId>, SessionError> {
        let session = {
            let state = self.lock();
            if state.status != SessionStatus::Ready {
                return Err(SessionError::NotReady(state.status));
            }
            state.id.clone()
        };
        let ack = socket
            .request(RelayMsg::Command(CommandPayload {
                session,
                name: name.to_string(),
                args,
                data,
            }))
            .await?;
        let Some(transaction_id) = ack.transaction_id.map(CommandId::from) else {
            return Ok(None);
        };
        if let Some(reply) = reply {
            let mut state = self.lock();
            let early = state
                .unclaimed
                .iter()
                .position(|response| response.id == transaction_id)
                .and_then(|index| state.unclaimed.remove(index));
            match early {
                Some(response) => {
                    let _ = reply.send(response);
                }
                None => {
                    state.callbacks.insert(transaction_id.clone(), reply);
                }
            }
        }
        Ok(Some(transaction_id))
    }

    /// Feeds raw engine text through the parser and dispatches the packets.
    pub fn receive(&self, chunk: &str) {
        let mut state = self.lock();
        let packets = match state.parser.feed(chunk) {
            Ok(packets) => packets,
            Err(err) => {
                warn!(event = "packet_parse_error", session_id = %state.id, error = %err);
                return;
            }
        };
        for packet in packets {
            match state.status {
                SessionStatus::Ready => self.interpret_ready(&mut state, packet),
                SessionStatus::Init => self.interpret_init(&mut state, packet),
                status => {
                    debug!(event = "packet_after_end", status = ?status, tag = %packet.tag);
                }
            }
        }
    }

    fn interpret_init(&self, state: &mut SessionState, packet: Packet) {
        let is_sentinel = packet.attr_is("threadId", 1)
            && packet.attr_is("line", 1)
            && packet.attr_is("frames", 1);
        if !is_sentinel {
            debug!(event = "init_packet_ignored", tag = %packet.tag);
            return;
        }
        let Transport::Engine {
            registry,
            session_name,
            ..
        } = &self.0.transport
        else {
            return;
        };
        state.name = session_name.clone();
        state.id = registry.next_session_id(session_name);
        state.status = SessionStatus::Ready;
        info!(event = "session_ready", session_id = %state.id, name = %state.name);
        let ready = SessionEvent::Ready {
            id: state.id.clone(),
            name: state.name.clone(),
        };
        self.publish(state, ready);
    }

    fn interpret_ready(&self, state: &mut SessionState, packet: Packet) {
        if packet.trailing > 0 {
            // One document answers one queued command; the rest is lost.
            warn!(
                event = "batched_packet",
                session_id = %state.id,
                tag = %packet.tag,
                dropped = packet.trailing
            );
        }
        let status = match packet.tag.as_str() {
            "breakpoint" => Some("break"),
            "suspended" => Some("suspended"),
            "exception" => Some("exception"),
            _ => None,
        };
        let args = if packet.is_list() {
            ResponseArgs::List(packet.items.clone())
        } else if !packet.is_empty() {
            ResponseArgs::Attrs(packet.attrs.clone())
        } else {
            debug!(event = "packet_ignored", session_id = %state.id, tag = %packet.tag);
            return;
        };

        match state.pending.pop_front() {
            Some(pending) => {
                let response = CommandResponse {
                    id: pending.id,
                    name: pending.name,
                    args,
                    data: packet.text.clone(),
                };
                self.publish(state, SessionEvent::CommandResponse(response));
            }
            None if status.is_some() => {}
            None => {
                warn!(event = "correlation_miss", session_id = %state.id, tag = %packet.tag);
            }
        }

        if let Some(status) = status {
            self.publish(state, SessionEvent::status(status, packet.attrs));
        }
    }

    /// Publishes an event produced outside the engine socket: process output,
    /// the runner's end notification, or a replayed relay event.
    pub fn emit(&self, event: SessionEvent) {
        let mut state = self.lock();
        match &event {
            SessionEvent::Ready { id, name } => {
                if state.status.is_finished() {
                    return;
                }
                if state.id.is_empty() {
                    state.id = id.clone();
                }
                state.name = name.clone();
                state.status = SessionStatus::Ready;
            }
            SessionEvent::End { aborted } => {
                if state.status.is_finished() {
                    return;
                }
                state.status = if *aborted {
                    SessionStatus::Aborted
                } else {
                    SessionStatus::Ended
                };
                info!(event = "session_end", session_id = %state.id, aborted = *aborted);
            }
            _ => {}
        }
        self.publish(&mut state, event);
    }

    pub fn end(&self, aborted: bool) {
        self.emit(SessionEvent::End { aborted });
    }

    /// Re-emits a relayed `type`/`args` pair on this mirror.
    pub fn replay(&self, kind: &str, args: serde_json::Value) {
        match SessionEvent::from_relay(kind, args) {
            Ok(event) => self.emit(event),
            Err(err) => {
                warn!(event = "relay_event_invalid", session_id = %self.id(), kind = %kind, error = %err)
            }
        }
    }

    /// Engine socket reached EOF.
    pub(crate) fn transport_closed(&self) {
        let abort_on_eof = match &self.0.transport {
            Transport::Engine { abort_on_eof, .. } => *abort_on_eof,
            Transport::Relay(_) => false,
        };
        if self.status().is_finished() {
            return;
        }
        if !abort_on_eof {
            // The runner's end notification finishes the session.
            debug!(event = "engine_eof_ignored", session_id = %self.id());
            return;
        }
        self.end(true);
    }

    /// Resolves the callback of a `command-response`, then fans the event out.
    fn publish(&self, state: &mut SessionState, event: SessionEvent) {
        if let SessionEvent::CommandResponse(response) = &event {
            match state.callbacks.remove(&response.id) {
                Some(reply) => {
                    let _ = reply.send(response.clone());
                }
                None if self.is_mirror() => {
                    if state.unclaimed.len() >= UNCLAIMED_CACHE_MAX {
                        state.unclaimed.pop_front();
                    }
                    state.unclaimed.push_back(response.clone());
                }
                None => {
                    debug!(event = "callback_miss", session_id = %state.id, command_id = %response.id);
                }
            }
        }
        self.0.events.emit(event);
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.0.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn read_source(path: Option<String>) -> (ResponseArgs, String) {
    let Some(path) = path else {
        return (ResponseArgs::error("file-source needs a path"), String::new());
    };
    match tokio::fs::read_to_string(&path).await {
        Ok(text) => (ResponseArgs::Attrs(Default::default()), text),
        Err(err) => (ResponseArgs::error(format!("{path}: {err}")), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const SENTINEL: &str = r#"<suspended file="/tmp/demo.rb" line="1" threadId="1" frames="1"/>"#;

    fn engine_session() -> (Session, mpsc::UnboundedReceiver<String>) {
        let (writer, wire) = mpsc::unbounded_channel();
        let session = Session::engine(writer, Arc::new(Registry::new()), "demo".to_string(), false);
        (session, wire)
    }

    fn ready_session() -> (Session, mpsc::UnboundedReceiver<String>) {
        let (session, wire) = engine_session();
        session.receive(SENTINEL);
        assert_eq!(session.status(), SessionStatus::Ready);
        (session, wire)
    }

    async fn next_response(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> CommandResponse {
        let event = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("timely event")
            .expect("event");
        match event {
            SessionEvent::CommandResponse(response) => response,
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn commands_are_rejected_until_ready_except_start() {
        let (session, mut wire) = engine_session();
        let err = session
            .send_command("frame", vec![], None, None)
            .await
            .expect_err("not ready");
        assert_eq!(err, SessionError::NotReady(SessionStatus::Init));

        session.start().await.expect("start");
        assert_eq!(wire.recv().await.as_deref(), Some("start\n"));
        assert_eq!(session.pending_commands(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn only_the_sentinel_makes_the_session_ready() {
        let (session, _wire) = engine_session();
        let mut ready = session.on(EventKind::Ready);

        session.receive(r#"<suspended file="/tmp/demo.rb" line="3" threadId="1" frames="1"/>"#);
        assert_eq!(session.status(), SessionStatus::Init);

        session.receive(SENTINEL);
        assert_eq!(session.status(), SessionStatus::Ready);
        assert_eq!(session.id(), "session-1-demo");
        assert_eq!(
            ready.recv().await,
            Some(SessionEvent::Ready {
                id: "session-1-demo".to_string(),
                name: "demo".to_string()
            })
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn responses_correlate_in_fifo_order() {
        let (session, mut wire) = ready_session();
        let mut responses = session.on(EventKind::CommandResponse);

        let first = session
            .send_command("break", vec!["/tmp/demo.rb:4".into()], None, None)
            .await
            .expect("first")
            .expect("id");
        let second = session
            .send_command("frame", vec![], None, None)
            .await
            .expect("second")
            .expect("id");
        assert_eq!(wire.recv().await.as_deref(), Some("break /tmp/demo.rb:4\n"));
        assert_eq!(wire.recv().await.as_deref(), Some("frame\n"));

        session.receive(r#"<breakpointAdded no="1" location="/tmp/demo.rb:4"/>"#);
        session.receive("<frames>");
        session.receive(r#"<frame no="1" file="/tmp/demo.rb" line="4"/>"#);
        session.receive("</frames>");

        let one = next_response(&mut responses).await;
        assert_eq!(one.id, first);
        assert_eq!(one.name, "break");
        assert_eq!(one.args.attr("no"), Some("1"));

        let two = next_response(&mut responses).await;
        assert_eq!(two.id, second);
        assert_eq!(two.args.items().len(), 1);
        assert_eq!(session.pending_commands(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_senders_keep_queue_and_wire_order_aligned() {
        let (session, mut wire) = ready_session();
        let mut handles = Vec::new();
        for n in 0..16 {
            let session = session.clone();
            handles.push(tokio::spawn(async move {
                let (tx, rx) = oneshot::channel();
                let id = session
                    .send_command("eval", vec![n.to_string()], None, Some(tx))
                    .await
                    .expect("send")
                    .expect("id");
                (id, rx)
            }));
        }
        let mut waiters = Vec::new();
        for handle in handles {
            waiters.push(handle.await.expect("join"));
        }

        for _ in 0..16 {
            let line = wire.recv().await.expect("wire line");
            let value = line.trim().trim_start_matches("eval ").to_string();
            session.receive(&format!(r#"<eval expression="{value}" value="{value}"/>"#));
        }

        for (id, rx) in waiters {
            let response = rx.await.expect("response");
            assert_eq!(response.id, id);
            assert_eq!(response.args.attr("expression"), response.args.attr("value"));
        }
        assert_eq!(session.pending_commands(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn set_stdout_is_intercepted_and_echoed() {
        let (session, mut wire) = ready_session();
        let response = session
            .request("set", vec!["stdout".into(), "on".into()])
            .await
            .expect("echo");
        assert_eq!(response.args, ResponseArgs::Echo(vec!["stdout".into(), "on".into()]));
        assert!(session.runtime_option("show-stdout"));
        assert!(!session.runtime_option("show-stderr"));
        assert_eq!(session.pending_commands(), 0);
        assert!(wire.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn file_source_reads_local_file() {
        let path = std::env::temp_dir().join(format!("rdebug-source-{}.rb", std::process::id()));
        std::fs::write(&path, "puts 1\n").expect("write source");
        let (session, _wire) = ready_session();

        let response = session
            .request("file-source", vec![path.display().to_string()])
            .await
            .expect("source");
        assert_eq!(response.data, "puts 1\n");
        assert_eq!(response.args.attr("error"), None);

        let missing = session
            .request("file-source", vec!["/nonexistent/rdebug.rb".into()])
            .await
            .expect("error response");
        assert!(missing.args.attr("error").is_some());
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn breakpoint_hit_resolves_cont_and_raises_status() {
        let (session, _wire) = ready_session();
        let mut all = session.on_any();
        let cont = session
            .send_command("cont", vec![], None, None)
            .await
            .expect("cont")
            .expect("id");
        assert!(matches!(all.recv().await, Some(SessionEvent::Command { .. })));

        session.receive(r#"<breakpoint file="/tmp/demo.rb" line="4" threadId="1"/>"#);
        assert_eq!(next_response(&mut all).await.id, cont);
        match all.recv().await {
            Some(SessionEvent::Status { status, args }) => {
                assert_eq!(status, "break");
                assert_eq!(args.get("line").map(String::as_str), Some("4"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn end_is_emitted_once_and_eof_does_not_abort_by_default() {
        let (session, _wire) = ready_session();
        let mut ends = session.on(EventKind::End);
        session.transport_closed();
        assert_eq!(session.status(), SessionStatus::Ready);

        session.end(false);
        session.end(true);
        assert_eq!(session.status(), SessionStatus::Ended);
        assert_eq!(ends.recv().await, Some(SessionEvent::End { aborted: false }));
        assert!(ends.try_recv().is_err());
    }
}
