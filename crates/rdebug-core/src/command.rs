use serde::{Deserialize, Serialize};
use std::fmt;

/// Formats one engine command: `<name>[ <arg>]*\n`.
pub fn format_command<S: AsRef<str>>(name: &str, args: &[S]) -> String {
    let mut line = String::from(name);
    for arg in args {
        line.push(' ');
        line.push_str(arg.as_ref());
    }
    line.push('\n');
    line
}

/// Session-local command identifier (`id<n>`), or a relay transaction id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(String);

impl CommandId {
    pub fn from_counter(counter: u64) -> Self {
        Self(format!("id{counter}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CommandId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CommandId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
