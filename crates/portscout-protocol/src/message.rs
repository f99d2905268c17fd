use serde::{Deserialize, Serialize};

use crate::port::Port;

/// Kind of a port event flowing from a discovery to its client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortEventKind {
    Add,
    Remove,
}

impl PortEventKind {
    /// Wire spelling of the event kind, used as the message `eventType`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            PortEventKind::Add => "add",
            PortEventKind::Remove => "remove",
        }
    }
}

impl std::fmt::Display for PortEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// The single JSON record used for every reply and event on the wire.
///
/// `event_type` is the lowercase command name for replies (`hello`,
/// `start`, `stop`, `start_sync`, `list`, `quit`), `add`/`remove` for
/// port events and `command_error` for protocol violations. Optional
/// fields are omitted when absent; `error` is present only when `true`.
///
/// The declaration order of the fields is the key order of the
/// pretty-printed output and is part of the wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub event_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub error: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<Port>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<Port>>,
}

impl Message {
    /// Successful reply to a command: `{eventType, message: "OK"}`.
    #[must_use]
    pub fn ok(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            protocol_version: None,
            message: Some("OK".to_string()),
            error: false,
            port: None,
            ports: None,
        }
    }

    /// Failed reply or asynchronous error: `{eventType, message, error: true}`.
    #[must_use]
    pub fn error(event_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            protocol_version: None,
            message: Some(message.into()),
            error: true,
            port: None,
            ports: None,
        }
    }

    /// Asynchronous `add`/`remove` port event.
    #[must_use]
    pub fn port_event(kind: PortEventKind, port: Port) -> Self {
        Self {
            event_type: kind.as_str().to_string(),
            protocol_version: None,
            message: None,
            error: false,
            port: Some(port),
            ports: None,
        }
    }

    /// Reply to `LIST` carrying the current port snapshot.
    #[must_use]
    pub fn port_list(ports: Vec<Port>) -> Self {
        Self {
            event_type: "list".to_string(),
            protocol_version: None,
            message: None,
            error: false,
            port: None,
            ports: Some(ports),
        }
    }
}
