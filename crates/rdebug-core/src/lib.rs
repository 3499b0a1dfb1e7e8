//! Protocol types for relaying `ruby-debug-ide` sessions.
//!
//! Everything in this crate is runtime-free: the engine packet parser, the
//! command codec, the session event model and the relay wire envelope.

pub mod command;
pub mod error;
pub mod event;
pub mod packet;
pub mod parser;
pub mod relay;
pub mod xml;

pub use command::{format_command, CommandId};
pub use error::ProtocolError;
pub use event::{
    CommandResponse, EventKind, OutputChannel, ResponseArgs, SessionEvent, SessionStatus,
};
pub use packet::{Attrs, Packet};
pub use parser::PacketParser;
pub use relay::{FrameError, RelayEnvelope, RelayMsg};
