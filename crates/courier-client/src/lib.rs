//! Client side of Courier.
//!
//! A [`Client`] consumes one contract. It registers with the broker, waits
//! for its host to send the contract, and then exposes the contract as a
//! [`RemoteInterface`] whose methods validate their arguments before a
//! request goes out. Calls made before the connection is up are queued and
//! flushed in order once it is.

mod call;
mod client;
mod error;
mod stub;

pub use call::{CallError, CallFuture};
pub use client::{Client, ClientConfig, ListenerId};
pub use error::ClientError;
pub use stub::{RemoteInterface, RemoteMethod};
