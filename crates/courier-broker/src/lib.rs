//! Broker side of Courier.
//!
//! The [`Broker`] listens on the registry channel for client and server
//! registrations. It keeps the [`Registrations`] directory, consults the
//! [`HostingConfig`] to find where a contract is served, and asks a
//! [`Launcher`] to start hosts lazily, tearing them down once no contract
//! they serve has clients left.

mod broker;
mod config;
mod launcher;
mod registrations;

pub use broker::{Broker, BrokerError, BrokerHandle};
pub use config::{ConfigError, HostEntry, HostingConfig};
pub use launcher::{Host, HostId, LaunchError, Launcher, TaskLauncher};
pub use registrations::Registrations;
