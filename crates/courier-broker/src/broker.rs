//! The broker: directory of contracts, their clients and their hosts.

use crate::config::{ConfigError, HostingConfig};
use crate::launcher::{LaunchError, Launcher};
use crate::registrations::Registrations;
use courier_core::{Channel, ChannelError, HostDirective, Hub, REGISTRY_CHANNEL, RegistryMessage, Token};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("empty contract names are not allowed")]
    EmptyContract,
    #[error("client registration for {0} carries no client id")]
    MissingClientId(String),
    #[error("unknown registry event: {0}")]
    UnknownEventName(String),
    #[error("unknown registration type: {0}")]
    UnknownRegistrationType(String),
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Listens on the registry channel and keeps hosts running exactly while
/// their contracts have clients.
pub struct Broker {
    launcher: Box<dyn Launcher>,
    config: Option<HostingConfig>,
    registrations: Registrations,
    channel: Channel,
}

impl Broker {
    /// Subscribe to the registry channel. Events posted from here on are
    /// processed once the broker runs.
    pub fn new(hub: &Hub, launcher: impl Launcher + 'static) -> Self {
        Self {
            launcher: Box::new(launcher),
            config: None,
            registrations: Registrations::init(),
            channel: hub.open(REGISTRY_CHANNEL),
        }
    }

    pub fn with_config(mut self, config: HostingConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn config(&self) -> Option<&HostingConfig> {
        self.config.as_ref()
    }

    pub fn registrations(&self) -> &Registrations {
        &self.registrations
    }

    /// Install a hosting configuration, then resolve hosts for contracts
    /// whose clients have been waiting without one.
    pub fn set_config(&mut self, config: HostingConfig) -> Result<(), BrokerError> {
        tracing::debug!(hosts = config.hosts().count(), "hosting configuration updated");
        self.config = Some(config);
        for contract in self.registrations.unserved() {
            self.resolve_host(&contract, true)?;
        }
        Ok(())
    }

    /// Apply one registry event.
    ///
    /// Malformed events fail without touching the directory.
    pub fn handle(&mut self, message: RegistryMessage) -> Result<(), BrokerError> {
        match message.name.as_str() {
            "config" => {
                let config = message.config.ok_or(ConfigError::Missing)?;
                self.set_config(HostingConfig::from_value(config)?)
            }
            "register" | "unregister" => {
                let register = message.name == "register";
                let contract = message
                    .contract
                    .filter(|c| !c.is_empty())
                    .ok_or(BrokerError::EmptyContract)?;

                match message.kind.as_deref() {
                    Some("client") => {
                        let uuid = message
                            .uuid
                            .ok_or_else(|| BrokerError::MissingClientId(contract.clone()))?;
                        if register {
                            self.register_client(&contract, uuid)
                        } else {
                            self.unregister_client(&contract, uuid)
                        }
                    }
                    Some("server") if register => self.register_server(&contract),
                    Some("server") => self.unregister_server(&contract),
                    other => Err(BrokerError::UnknownRegistrationType(
                        other.unwrap_or_default().to_string(),
                    )),
                }
            }
            other => Err(BrokerError::UnknownEventName(other.to_string())),
        }
    }

    /// Process registry events until the channel closes.
    pub async fn run(&mut self) {
        while let Some(message) = self.channel.recv_as::<RegistryMessage>().await {
            self.dispatch(message);
        }
    }

    /// Run on a background task. Dropping the handle stops the broker.
    pub fn spawn(mut self) -> BrokerHandle {
        let (stop, mut stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = &mut stopped => {}
                _ = self.run() => {}
            }
            self.shutdown();
        });
        BrokerHandle {
            stop: Some(stop),
            task,
        }
    }

    /// Terminate every host and forget every registration.
    pub fn shutdown(&mut self) {
        let terminated = self.registrations.shutdown();
        tracing::info!(hosts = terminated, "broker shut down");
    }

    fn dispatch(&mut self, message: Result<RegistryMessage, ChannelError>) {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("invalid registry event: {}", e);
                return;
            }
        };
        if let Err(e) = self.handle(message) {
            tracing::error!("registry event rejected: {}", e);
        }
    }

    fn register_client(&mut self, contract: &str, uuid: Token) -> Result<(), BrokerError> {
        let registration = self.registrations.entry(contract);
        if registration.clients.contains(&uuid) {
            tracing::debug!(%contract, client = %uuid, "client already registered");
        } else {
            registration.clients.push(uuid);
        }

        let ready = registration.ready;
        match registration.server.clone() {
            Some(host) if ready => {
                tracing::debug!(%contract, client = %uuid, host = %host.id(), "forwarding client");
                host.post(HostDirective::Register {
                    contract: contract.to_string(),
                    uuid,
                })?;
                Ok(())
            }
            Some(host) => {
                tracing::debug!(%contract, host = %host.id(), "host starting, client will be replayed");
                Ok(())
            }
            None => self.resolve_host(contract, true),
        }
    }

    fn unregister_client(&mut self, contract: &str, uuid: Token) -> Result<(), BrokerError> {
        let Some(registration) = self.registrations.get_mut(contract) else {
            tracing::warn!(%contract, client = %uuid, "cannot remove client from unknown contract");
            return Ok(());
        };

        match registration.clients.iter().position(|c| *c == uuid) {
            Some(index) => {
                registration.clients.remove(index);
            }
            None => tracing::debug!(%contract, client = %uuid, "cannot remove unknown client"),
        }

        if let Some(host) = &registration.server
            && registration.ready
        {
            host.post(HostDirective::Unregister {
                contract: contract.to_string(),
                uuid,
            })?;
        }

        self.registrations.remove_if_empty(contract);
        Ok(())
    }

    fn register_server(&mut self, contract: &str) -> Result<(), BrokerError> {
        if self.registrations.server(contract).is_none() {
            // A co-hosted sibling or a controller starting on its own.
            self.resolve_host(contract, false)?;
        }

        let Some(registration) = self.registrations.get_mut(contract) else {
            tracing::warn!(%contract, "server announced for a contract with no host");
            return Ok(());
        };
        let Some(host) = registration.server.clone() else {
            tracing::warn!(%contract, "server announced for a contract with no host");
            self.registrations.remove_if_empty(contract);
            return Ok(());
        };

        tracing::debug!(
            %contract,
            host = %host.id(),
            clients = registration.clients.len(),
            "server ready"
        );
        registration.ready = true;
        for uuid in &registration.clients {
            host.post(HostDirective::Register {
                contract: contract.to_string(),
                uuid: *uuid,
            })?;
        }
        Ok(())
    }

    fn unregister_server(&mut self, contract: &str) -> Result<(), BrokerError> {
        let Some(registration) = self.registrations.get_mut(contract) else {
            tracing::warn!(%contract, "cannot remove server of unknown contract");
            return Ok(());
        };
        let Some(host) = registration.server.clone() else {
            tracing::warn!(%contract, "cannot remove server that never started");
            return Ok(());
        };
        registration.ready = false;

        if !registration.clients.is_empty() {
            // Clients arrived while the server was retiring; bring it back.
            tracing::debug!(
                %contract,
                clients = registration.clients.len(),
                "server retired with clients waiting, asking it to announce again"
            );
            host.post(HostDirective::Announce {
                contract: contract.to_string(),
            })?;
            return Ok(());
        }

        self.registrations.remove(contract);
        if self.registrations.host_in_use(host.id()) {
            tracing::debug!(%contract, host = %host.id(), "host still serves other contracts");
        } else {
            host.terminate();
            self.registrations.detach(host.id());
        }
        Ok(())
    }

    /// Give `contract` a host: adopt the live instance at its configured
    /// location or launch one. With `announce`, an adopted host is asked to
    /// announce the contract's server.
    fn resolve_host(&mut self, contract: &str, announce: bool) -> Result<(), BrokerError> {
        let Some((location, entry)) = self.config.as_ref().and_then(|c| c.host_for(contract))
        else {
            tracing::warn!(%contract, "no host configured for contract");
            return Ok(());
        };
        let (location, kind) = (location.to_string(), entry.kind);

        if let Some(host) = self.registrations.host_at(&location) {
            tracing::debug!(%contract, host = %host.id(), %location, "co-hosting on running host");
            let registration = self.registrations.entry(contract);
            registration.server = Some(host.clone());
            registration.ready = false;
            if announce {
                host.post(HostDirective::Announce {
                    contract: contract.to_string(),
                })?;
            }
            return Ok(());
        }

        match self.launcher.launch(kind, &location)? {
            Some(host) => {
                tracing::info!(%contract, host = %host.id(), %location, %kind, "launched host");
                let registration = self.registrations.entry(contract);
                registration.server = Some(host);
                registration.ready = false;
            }
            None => {
                tracing::warn!(%contract, %location, %kind, "no host instance available");
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("config", &self.config)
            .field("registrations", &self.registrations)
            .finish()
    }
}

/// A broker running in the background.
#[derive(Debug)]
pub struct BrokerHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl BrokerHandle {
    /// Stop the broker, terminating every host it started.
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.task).await {
            tracing::warn!("broker task failed: {}", e);
        }
    }
}
