//! Hosting contexts.
//!
//! A host is an independent execution context running one or more servers.
//! The broker starts hosts on demand and steers them with [`HostDirective`]s
//! delivered to the host's inbox.

use crate::channel::Hub;
use crate::identity::Token;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// How a host is run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HostKind {
    /// Dedicated background worker, one instance per launch.
    Worker,
    /// Worker shared between every context that launches the same location.
    SharedWorker,
    /// Persistent controller; attached, never lazily started.
    ServiceWorker,
    /// Hidden document.
    Window,
}

impl fmt::Display for HostKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Worker => "Worker",
            Self::SharedWorker => "SharedWorker",
            Self::ServiceWorker => "ServiceWorker",
            Self::Window => "Window",
        };
        f.write_str(name)
    }
}

/// Broker-to-host instruction, addressed to one contract's server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostDirective {
    /// Accept a client: open its dedicated channel and send `connected`.
    Register { contract: String, uuid: Token },
    /// Drop a client.
    Unregister { contract: String, uuid: Token },
    /// Re-announce the server to the broker (used when the broker adopts a
    /// live host whose server for this contract had retired).
    Announce { contract: String },
}

impl HostDirective {
    pub fn contract(&self) -> &str {
        match self {
            Self::Register { contract, .. }
            | Self::Unregister { contract, .. }
            | Self::Announce { contract } => contract,
        }
    }
}

/// Sending half of a host inbox.
pub type HostOutbox = mpsc::UnboundedSender<HostDirective>;

/// Receiving half of a host inbox.
pub type HostInbox = mpsc::UnboundedReceiver<HostDirective>;

/// Everything a host body gets when it starts.
#[derive(Debug)]
pub struct HostContext {
    pub hub: Hub,
    pub location: String,
    pub kind: HostKind,
    pub inbox: HostInbox,
}

impl HostContext {
    /// A context plus the outbox feeding it.
    pub fn new(hub: Hub, location: impl Into<String>, kind: HostKind) -> (Self, HostOutbox) {
        let (tx, inbox) = mpsc::unbounded_channel();
        let ctx = Self {
            hub,
            location: location.into(),
            kind,
            inbox,
        };
        (ctx, tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kinds_use_configuration_names() {
        let kind: HostKind = serde_json::from_value(json!("SharedWorker")).unwrap();
        assert_eq!(kind, HostKind::SharedWorker);
        assert_eq!(HostKind::ServiceWorker.to_string(), "ServiceWorker");
    }

    #[test]
    fn directive_wire_shape() {
        let uuid = Token::random();
        let directive = HostDirective::Register {
            contract: "logic".into(),
            uuid,
        };
        assert_eq!(
            serde_json::to_value(&directive).unwrap(),
            json!({ "type": "register", "contract": "logic", "uuid": uuid.to_string() })
        );
        assert_eq!(directive.contract(), "logic");
    }

    #[tokio::test]
    async fn context_outbox_feeds_inbox() {
        let (mut ctx, outbox) = HostContext::new(Hub::new(), "worker.js", HostKind::Worker);
        outbox
            .send(HostDirective::Announce {
                contract: "history".into(),
            })
            .unwrap();
        assert_eq!(ctx.inbox.recv().await.unwrap().contract(), "history");
    }
}
