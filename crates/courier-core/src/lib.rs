//! Core types for Courier.
//!
//! Courier lets isolated execution contexts call each other's methods and
//! receive each other's events by message passing. This crate provides the
//! shared primitives: identity tokens, contracts and their registry, the wire
//! messages, the in-process channel hub, and host plumbing. The client,
//! server and broker live in their own crates.

mod channel;
mod contract;
mod host;
mod identity;
mod message;
mod registry;

pub use channel::{Channel, ChannelError, ChannelSender, Hub};
pub use contract::{ArgType, Contract, ContractError, MethodSignature};
pub use host::{HostContext, HostDirective, HostInbox, HostKind, HostOutbox};
pub use identity::{Token, TokenParseError};
pub use message::{
    HostMessage, Notice, Packet, REGISTRY_CHANNEL, RegistryMessage, RemoteError, RemoteErrorKind,
};
pub use registry::{ContractRegistry, ContractSource, DirectorySource, StaticSource};

/// Client connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No dedicated channel; calls are queued.
    Disconnected,
    /// Registration announced, waiting for the host's `connected`.
    Connecting,
    /// Bound to the contract; calls go straight to the host.
    Connected,
    /// Unregistration announced, waiting for the host's `disconnected`.
    Disconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}
