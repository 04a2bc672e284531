//! Wire messages.
//!
//! Three logical channels carry traffic:
//! - the registry channel ([`REGISTRY_CHANNEL`]), where clients and servers
//!   announce themselves to the broker ([`RegistryMessage`]);
//! - a dedicated per-client channel named after the client's token, where the
//!   client sends request [`Packet`]s and the host answers with
//!   [`HostMessage`]s;
//! - the host inbox, where the broker sends [`HostDirective`](crate::HostDirective)s.

use crate::contract::Contract;
use crate::identity::Token;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

/// Name of the well-known channel the broker listens on.
pub const REGISTRY_CHANNEL: &str = "courier.registry";

/// Request/response unit on a dedicated channel.
///
/// A packet with neither `result` nor `error` is a request; a response
/// echoes the request's `uuid`, `method` and `args`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub uuid: Token,
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

// A present-but-null `result` is still a response.
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl Packet {
    /// A new request with a fresh id.
    pub fn request(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            uuid: Token::random(),
            method: method.into(),
            args,
            result: None,
            error: None,
        }
    }

    pub fn is_response(&self) -> bool {
        self.result.is_some() || self.error.is_some()
    }

    /// Turn a request into its response.
    pub fn respond(mut self, outcome: Result<Value, RemoteError>) -> Self {
        match outcome {
            Ok(value) => self.result = Some(value),
            Err(error) => self.error = Some(error),
        }
        self
    }

    /// The outcome carried by a response. Errors win over results.
    pub fn into_outcome(self) -> Result<Value, RemoteError> {
        match (self.error, self.result) {
            (Some(error), _) => Err(error),
            (None, result) => Ok(result.unwrap_or(Value::Null)),
        }
    }
}

/// Failure reported by a host in a response packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unknown_method(method: &str) -> Self {
        Self::new(
            RemoteErrorKind::UnknownMethod,
            format!("method not defined in the contract: {method}"),
        )
    }

    pub fn handler(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Handler, message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    /// The request named a method the host does not implement.
    UnknownMethod,
    /// The handler itself failed.
    Handler,
    /// The request could not be understood.
    BadRequest,
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::UnknownMethod => "unknown method",
            Self::Handler => "handler failed",
            Self::BadRequest => "bad request",
        };
        f.write_str(name)
    }
}

/// Control notices a host sends on a dedicated channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notice {
    /// The server accepted the client; carries the contract description.
    Connected { interface: Contract },
    /// The server dropped the client.
    Disconnected { interface: Contract },
    /// Fire-and-forget event sent to every connected client.
    Broadcast {
        name: String,
        #[serde(default)]
        data: Value,
    },
}

/// Anything a host sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HostMessage {
    Notice(Notice),
    Response(Packet),
}

/// Event posted on the registry channel.
///
/// Kept loosely typed so the broker can reject malformed events with a
/// precise error instead of a decode failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryMessage {
    /// `register`, `unregister` or `config`.
    pub name: String,
    /// `client` or `server`.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Token>,
    /// Hosting configuration, for `config` events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
}

impl RegistryMessage {
    fn announce(name: &str, kind: &str, contract: &str, version: &str, uuid: Option<Token>) -> Self {
        Self {
            name: name.to_string(),
            kind: Some(kind.to_string()),
            contract: Some(contract.to_string()),
            version: Some(version.to_string()),
            uuid,
            config: None,
        }
    }

    pub fn register_client(contract: &str, version: &str, uuid: Token) -> Self {
        Self::announce("register", "client", contract, version, Some(uuid))
    }

    pub fn unregister_client(contract: &str, version: &str, uuid: Token) -> Self {
        Self::announce("unregister", "client", contract, version, Some(uuid))
    }

    pub fn register_server(contract: &str, version: &str) -> Self {
        Self::announce("register", "server", contract, version, None)
    }

    pub fn unregister_server(contract: &str, version: &str) -> Self {
        Self::announce("unregister", "server", contract, version, None)
    }

    pub fn config(config: Value) -> Self {
        Self {
            name: "config".to_string(),
            config: Some(config),
            ..Self::default()
        }
    }
}
