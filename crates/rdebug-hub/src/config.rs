use crate::channel::RelayConnector;
use crate::error::ClientError;
use rdebug_core::relay::{DEFAULT_MAX_FRAME_BYTES, DEFAULT_NAMESPACE};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(250);
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineAddr {
    pub host: String,
    pub port: u16,
}

impl EngineAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn to_socket_string(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Clone)]
pub struct ClientOptions {
    pub engine: Option<EngineAddr>,
    pub relay: Option<Arc<dyn RelayConnector>>,
    pub session_name: String,
    pub connect_timeout: Duration,
    pub retry_interval: Duration,
    pub namespace: String,
    pub ack_timeout: Duration,
    /// Escalate an engine EOF to an aborted session end.
    pub abort_on_engine_eof: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            engine: None,
            relay: None,
            session_name: String::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            namespace: DEFAULT_NAMESPACE.to_string(),
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            abort_on_engine_eof: false,
        }
    }
}

impl ClientOptions {
    pub fn engine(host: impl Into<String>, port: u16, session_name: impl Into<String>) -> Self {
        Self {
            engine: Some(EngineAddr::new(host, port)),
            session_name: session_name.into(),
            ..Self::default()
        }
    }

    pub fn relay(connector: Arc<dyn RelayConnector>) -> Self {
        Self {
            relay: Some(connector),
            ..Self::default()
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub(crate) fn mode(&self) -> Result<TransportMode, ClientError> {
        match (&self.engine, &self.relay) {
            (Some(addr), None) => Ok(TransportMode::Engine(addr.clone())),
            (None, Some(connector)) => Ok(TransportMode::Relay(connector.clone())),
            (None, None) => Err(ClientError::Config(
                "neither engine address nor relay connector configured".to_string(),
            )),
            (Some(_), Some(_)) => Err(ClientError::Config(
                "engine address and relay connector are mutually exclusive".to_string(),
            )),
        }
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("engine", &self.engine)
            .field("relay", &self.relay.is_some())
            .field("session_name", &self.session_name)
            .field("connect_timeout", &self.connect_timeout)
            .field("namespace", &self.namespace)
            .finish()
    }
}

pub(crate) enum TransportMode {
    Engine(EngineAddr),
    Relay(Arc<dyn RelayConnector>),
}

/// Sessions with this name are locked to `client_id` when they register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRule {
    pub session_name: String,
    pub client_id: String,
}

impl LockRule {
    /// Parses `session-name=client-id`.
    pub fn parse(raw: &str) -> Option<Self> {
        let (session_name, client_id) = raw.split_once('=')?;
        let session_name = session_name.trim();
        let client_id = client_id.trim();
        if session_name.is_empty() || client_id.is_empty() {
            return None;
        }
        Some(Self {
            session_name: session_name.to_string(),
            client_id: client_id.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub namespace: String,
    pub queue_capacity: usize,
    pub write_timeout: Duration,
    pub ack_timeout: Duration,
    pub max_frame_bytes: usize,
    pub attach_connect_timeout: Duration,
    pub attach_wait: Duration,
    pub lock_rules: Vec<LockRule>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            queue_capacity: 256,
            write_timeout: Duration::from_secs(2),
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            attach_connect_timeout: Duration::from_millis(2000),
            attach_wait: Duration::from_millis(3250),
            lock_rules: Vec::new(),
        }
    }
}

impl HubConfig {
    pub fn lock_for(&self, session_name: &str) -> Option<&str> {
        self.lock_rules
            .iter()
            .find(|rule| rule.session_name == session_name)
            .map(|rule| rule.client_id.as_str())
    }
}
