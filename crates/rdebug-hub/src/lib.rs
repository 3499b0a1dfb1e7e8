//! Session multiplexing for `ruby-debug-ide`: engine and relay clients, the
//! hub that fans one engine session out to many followers, and its
//! websocket endpoint.

pub mod bus;
pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod hub;
pub mod registry;
pub mod session;
pub mod ws;

pub use channel::{ChannelEnd, ChannelSignal, RelayConnector, RelaySocket, WsConnector};
pub use client::{Client, ClientEvent, ClientEventKind};
pub use config::{ClientOptions, EngineAddr, HubConfig, LockRule};
pub use error::{ChannelError, ClientError, HubError, SessionError};
pub use hub::{Hub, HubEvent, HubEventKind};
pub use registry::{Registry, RegistryEvent, RegistryEventKind};
pub use session::Session;
