//! Structured events a session publishes to its observers.

use crate::command::CommandId;
use crate::packet::Attrs;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Init,
    Ready,
    Ended,
    Aborted,
}

impl SessionStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Ended | Self::Aborted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputChannel {
    Stdout,
    Stderr,
}

impl OutputChannel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }

    /// Runtime option that gates forwarding of this channel.
    pub fn option_key(self) -> String {
        format!("show-{}", self.as_str())
    }
}

impl FromStr for OutputChannel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "stdout" => Ok(Self::Stdout),
            "stderr" => Ok(Self::Stderr),
            other => Err(format!("unknown output channel: {other}")),
        }
    }
}

/// Arguments of a `command-response`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseArgs {
    /// Child attribute mappings of a list-shaped response.
    List(Vec<Attrs>),
    /// Caller arguments echoed back by an intercepted command.
    Echo(Vec<String>),
    Attrs(Attrs),
}

impl ResponseArgs {
    pub fn attr(&self, key: &str) -> Option<&str> {
        match self {
            Self::Attrs(attrs) => attrs.get(key).map(String::as_str),
            _ => None,
        }
    }

    pub fn items(&self) -> &[Attrs] {
        match self {
            Self::List(items) => items,
            _ => &[],
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        let mut attrs = Attrs::new();
        attrs.insert("error".to_string(), message.into());
        Self::Attrs(attrs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub id: CommandId,
    pub name: String,
    pub args: ResponseArgs,
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "args", rename_all = "kebab-case")]
pub enum SessionEvent {
    Ready {
        id: String,
        name: String,
    },
    End {
        aborted: bool,
    },
    Command {
        name: String,
        #[serde(default)]
        args: Vec<String>,
    },
    CommandResponse(CommandResponse),
    /// Engine notification such as a breakpoint hit.
    Status {
        status: String,
        #[serde(default)]
        args: Attrs,
    },
    Output {
        channel: OutputChannel,
        data: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Ready,
    End,
    Command,
    CommandResponse,
    Status,
    Output,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::End => "end",
            Self::Command => "command",
            Self::CommandResponse => "command-response",
            Self::Status => "status",
            Self::Output => "output",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SessionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Ready { .. } => EventKind::Ready,
            Self::End { .. } => EventKind::End,
            Self::Command { .. } => EventKind::Command,
            Self::CommandResponse(_) => EventKind::CommandResponse,
            Self::Status { .. } => EventKind::Status,
            Self::Output { .. } => EventKind::Output,
        }
    }

    pub fn status(status: &str, args: Attrs) -> Self {
        Self::Status {
            status: status.to_string(),
            args,
        }
    }

    /// Splits the event into the `type`/`args` pair carried by relay frames.
    pub fn to_relay(&self) -> Result<(String, Value), serde_json::Error> {
        let value = serde_json::to_value(self)?;
        let Value::Object(mut fields) = value else {
            return Ok((self.kind().as_str().to_string(), Value::Null));
        };
        let args = fields.remove("args").unwrap_or(Value::Null);
        Ok((self.kind().as_str().to_string(), args))
    }

    pub fn from_relay(kind: &str, args: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::json!({ "type": kind, "args": args }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> Attrs {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn relay_pair_uses_kebab_case_type() {
        let event = SessionEvent::CommandResponse(CommandResponse {
            id: CommandId::from_counter(2),
            name: "break".to_string(),
            args: ResponseArgs::Attrs(attrs(&[("no", "1")])),
            data: String::new(),
        });
        let (kind, args) = event.to_relay().expect("to relay");
        assert_eq!(kind, "command-response");
        assert_eq!(args["id"], "id2");
        assert_eq!(args["args"]["no"], "1");

        let rebuilt = SessionEvent::from_relay(&kind, args).expect("from relay");
        assert_eq!(rebuilt, event);
    }

    #[test]
    fn status_event_survives_relay() {
        let event = SessionEvent::status("break", attrs(&[("file", "/tmp/x.rb"), ("line", "4")]));
        let (kind, args) = event.to_relay().expect("to relay");
        assert_eq!(kind, "status");
        assert_eq!(SessionEvent::from_relay(&kind, args).expect("rebuild"), event);
    }

    #[test]
    fn response_args_shapes_are_distinguished() {
        let list: ResponseArgs =
            serde_json::from_value(serde_json::json!([{ "name": "x" }])).expect("list");
        assert_eq!(list.items().len(), 1);

        let echo: ResponseArgs =
            serde_json::from_value(serde_json::json!(["stdout", "on"])).expect("echo");
        assert_eq!(echo, ResponseArgs::Echo(vec!["stdout".into(), "on".into()]));

        let flat: ResponseArgs =
            serde_json::from_value(serde_json::json!({ "no": "1" })).expect("attrs");
        assert_eq!(flat.attr("no"), Some("1"));
        assert_eq!(ResponseArgs::error("gone").attr("error"), Some("gone"));
    }

    #[test]
    fn unknown_relay_type_is_rejected() {
        assert!(SessionEvent::from_relay("bogus", Value::Null).is_err());
    }

    #[test]
    fn output_channel_names_runtime_option() {
        assert_eq!(OutputChannel::Stderr.option_key(), "show-stderr");
        assert_eq!("stdout".parse::<OutputChannel>(), Ok(OutputChannel::Stdout));
    }
}
