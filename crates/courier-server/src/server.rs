//! The server: one per contract inside a host.

use crate::methods::MethodTable;
use courier_core::{
    Channel, ChannelError, ChannelSender, Contract, ContractError, ContractRegistry, Hub, Notice,
    Packet, REGISTRY_CHANNEL, RegistryMessage, RemoteError, RemoteErrorKind, Token,
};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::task::JoinHandle;

/// Errors raised by a server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The method table does not match the contract, or the contract is unknown.
    #[error(transparent)]
    Contract(#[from] ContractError),
    #[error("contract {contract}: method not defined in the contract: {method}")]
    UnknownMethod { contract: String, method: String },
    #[error("rejected call to {method}: {source}")]
    BadRequest {
        method: String,
        #[source]
        source: ContractError,
    },
    #[error("unexpected response packet {0} on a server channel")]
    UnexpectedResponse(Token),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// A contract implementation serving many clients.
///
/// Cloning shares the same server. Must be used from within a tokio runtime:
/// every registered client gets a listener task.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    contract: Arc<Contract>,
    version: String,
    methods: MethodTable,
    hub: Hub,
    state: Mutex<ServerState>,
}

struct ServerState {
    ports: Vec<Port>,
    accepting: bool,
}

/// A connected client's dedicated channel.
struct Port {
    client: Token,
    sender: ChannelSender,
    listener: JoinHandle<()>,
}

impl Server {
    /// Build a server for `name`, enforcing the contract.
    ///
    /// Fails unless `methods` implements every declared method and nothing
    /// else.
    pub fn new(
        hub: Hub,
        registry: &ContractRegistry,
        name: &str,
        version: &str,
        methods: MethodTable,
    ) -> Result<Self, ServerError> {
        let contract = registry.get(name)?;
        contract.check_implementation(methods.names())?;

        if !contract.version.is_empty() && contract.version != version {
            tracing::warn!(
                contract = %name,
                declared = %contract.version,
                served = %version,
                "server version differs from contract version"
            );
        }

        Ok(Self {
            inner: Arc::new(ServerInner {
                contract,
                version: version.to_string(),
                methods,
                hub,
                state: Mutex::new(ServerState {
                    ports: Vec::new(),
                    accepting: true,
                }),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.contract.name
    }

    pub fn version(&self) -> &str {
        &self.inner.version
    }

    pub fn contract(&self) -> &Contract {
        &self.inner.contract
    }

    /// Ids of the currently connected clients, in connection order.
    pub fn clients(&self) -> Vec<Token> {
        self.inner.state().ports.iter().map(|p| p.client).collect()
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.state().accepting
    }

    /// Tell the broker this server is ready. Resumes accepting clients.
    pub fn announce(&self) -> Result<(), ServerError> {
        self.inner.state().accepting = true;
        tracing::debug!(contract = %self.name(), "announcing server");
        self.inner.hub.post(
            REGISTRY_CHANNEL,
            &RegistryMessage::register_server(self.name(), self.version()),
        )?;
        Ok(())
    }

    /// Accept a client: open its dedicated channel, send the contract and
    /// start listening for requests. Registering a connected client again
    /// is a no-op.
    pub fn register_client(&self, client: Token) -> Result<(), ServerError> {
        let mut state = self.inner.state();
        if !state.accepting {
            tracing::debug!(contract = %self.name(), %client, "not accepting clients");
            return Ok(());
        }
        if state.ports.iter().any(|p| p.client == client) {
            tracing::debug!(contract = %self.name(), %client, "client already registered");
            return Ok(());
        }

        tracing::debug!(contract = %self.name(), %client, "registering client");
        let channel = self.inner.hub.open(client.to_string());
        let sender = channel.sender();
        sender.post(&Notice::Connected {
            interface: self.contract().clone(),
        })?;

        let listener = tokio::spawn(listen(Arc::downgrade(&self.inner), channel));
        state.ports.push(Port {
            client,
            sender,
            listener,
        });
        Ok(())
    }

    /// Drop a client. When the last client leaves, the server stops
    /// accepting and announces its own unregistration.
    pub fn unregister_client(&self, client: Token) -> Result<(), ServerError> {
        let mut state = self.inner.state();
        let Some(index) = state.ports.iter().position(|p| p.client == client) else {
            tracing::debug!(contract = %self.name(), %client, "no such client to remove");
            return Ok(());
        };

        let port = state.ports.remove(index);
        self.inner.disconnect(port);

        if state.ports.is_empty() && state.accepting {
            state.accepting = false;
            drop(state);
            self.retire()?;
        }
        Ok(())
    }

    /// Send an event to every connected client. Returns how many received it.
    pub fn broadcast<T: Serialize>(&self, name: &str, data: &T) -> Result<usize, ServerError> {
        let notice = Notice::Broadcast {
            name: name.to_string(),
            data: serde_json::to_value(data).map_err(ChannelError::Encode)?,
        };

        let state = self.inner.state();
        let mut delivered = 0;
        for port in &state.ports {
            match port.sender.post(&notice) {
                Ok(n) => delivered += n,
                Err(e) => {
                    tracing::debug!(contract = %self.name(), client = %port.client, "broadcast dropped: {}", e)
                }
            }
        }
        Ok(delivered)
    }

    /// Disconnect every client and announce unregistration.
    pub fn shutdown(&self) -> Result<(), ServerError> {
        let ports = {
            let mut state = self.inner.state();
            state.accepting = false;
            std::mem::take(&mut state.ports)
        };
        for port in ports {
            self.inner.disconnect(port);
        }
        self.retire()
    }

    fn retire(&self) -> Result<(), ServerError> {
        tracing::debug!(contract = %self.name(), "unregistering server");
        self.inner.hub.post(
            REGISTRY_CHANNEL,
            &RegistryMessage::unregister_server(self.name(), self.version()),
        )?;
        Ok(())
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("contract", &self.name())
            .field("version", &self.version())
            .field("clients", &self.clients().len())
            .finish()
    }
}

impl ServerInner {
    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop listening, then say goodbye so a response racing the teardown
    /// can still be matched by the client.
    fn disconnect(&self, port: Port) {
        tracing::debug!(contract = %self.contract.name, client = %port.client, "disconnecting client");
        let notice = Notice::Disconnected {
            interface: (*self.contract).clone(),
        };
        if let Err(e) = port.sender.post(&notice) {
            tracing::debug!(client = %port.client, "disconnect notice dropped: {}", e);
        }
        port.listener.abort();
    }

    /// Route one request. The handler's result is posted back on `reply`
    /// once it resolves.
    fn dispatch(&self, packet: Packet, reply: ChannelSender) -> Result<(), ServerError> {
        if packet.is_response() {
            return Err(ServerError::UnexpectedResponse(packet.uuid));
        }

        let Some(handler) = self.methods.get(&packet.method) else {
            let method = packet.method.clone();
            reply.post(&packet.respond(Err(RemoteError::unknown_method(&method))))?;
            return Err(ServerError::UnknownMethod {
                contract: self.contract.name.clone(),
                method,
            });
        };

        if let Err(source) = self.contract.validate_call(&packet.method, &packet.args) {
            let method = packet.method.clone();
            let error = RemoteError::new(RemoteErrorKind::BadRequest, source.to_string());
            reply.post(&packet.respond(Err(error)))?;
            return Err(ServerError::BadRequest { method, source });
        }

        let pending = handler(packet.args.clone());
        tokio::spawn(async move {
            let outcome = pending.await;
            let method = packet.method.clone();
            if let Err(e) = reply.post(&packet.respond(outcome)) {
                tracing::debug!(%method, "response dropped: {}", e);
            }
        });
        Ok(())
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for port in &state.ports {
            port.listener.abort();
        }
    }
}

async fn listen(server: Weak<ServerInner>, mut channel: Channel) {
    let reply = channel.sender();
    while let Some(message) = channel.recv_as::<Packet>().await {
        let Some(server) = server.upgrade() else {
            break;
        };

        let packet = match message {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!(contract = %server.contract.name, "invalid request: {}", e);
                continue;
            }
        };

        if let Err(e) = server.dispatch(packet, reply.clone()) {
            tracing::error!(contract = %server.contract.name, client = %channel.name(), "{}", e);
        }
    }
}
