//! The client: one per contract per consuming context.

use crate::call::{CallError, CallFuture, CallOutcome};
use crate::error::ClientError;
use crate::stub::RemoteInterface;
use courier_core::{
    Channel, ChannelSender, ConnectionState, Contract, HostMessage, Hub, Notice, Packet,
    REGISTRY_CHANNEL, RegistryMessage, Token,
};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Client tuning.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Fail calls not answered within this long. `None` waits forever.
    pub call_timeout: Option<Duration>,
}

impl ClientConfig {
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }
}

/// Handle returned by [`Client::add_event_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&Value) + Send + Sync>;
type Reply = oneshot::Sender<CallOutcome>;

/// Connection state, carrying the bound interface while connected.
enum Link {
    Disconnected,
    Connecting,
    Connected(Arc<RemoteInterface>),
    Disconnecting,
}

impl Link {
    fn state(&self) -> ConnectionState {
        match self {
            Self::Disconnected => ConnectionState::Disconnected,
            Self::Connecting => ConnectionState::Connecting,
            Self::Connected(_) => ConnectionState::Connected,
            Self::Disconnecting => ConnectionState::Disconnecting,
        }
    }
}

/// A call waiting for the connection.
struct PendingCall {
    packet: Packet,
    reply: Reply,
}

struct Core {
    link: Link,
    channel: Option<ChannelSender>,
    pump: Option<JoinHandle<()>>,
    pending: VecDeque<PendingCall>,
    running: HashMap<Token, Reply>,
    connect_waiters: Vec<oneshot::Sender<Result<(), ClientError>>>,
    disconnect_waiters: Vec<oneshot::Sender<()>>,
    listeners: HashMap<String, Vec<(ListenerId, Listener)>>,
    next_listener: u64,
}

pub(crate) struct ClientInner {
    contract: String,
    version: String,
    id: Token,
    hub: Hub,
    config: ClientConfig,
    core: Mutex<Core>,
}

enum Wait {
    Done,
    Connect(oneshot::Receiver<Result<(), ClientError>>),
    Disconnect(oneshot::Receiver<()>),
}

/// A consumer of one contract.
///
/// The client's identity and its pending/running call tables live as long
/// as the client; reconnecting reuses them. Cloning shares the client.
/// Must be used from within a tokio runtime.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// A disconnected client.
    pub fn new(hub: Hub, contract: &str, version: &str) -> Self {
        Self::with_config(hub, contract, version, ClientConfig::default())
    }

    pub fn with_config(hub: Hub, contract: &str, version: &str, config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                contract: contract.to_string(),
                version: version.to_string(),
                id: Token::random(),
                hub,
                config,
                core: Mutex::new(Core {
                    link: Link::Disconnected,
                    channel: None,
                    pump: None,
                    pending: VecDeque::new(),
                    running: HashMap::new(),
                    connect_waiters: Vec::new(),
                    disconnect_waiters: Vec::new(),
                    listeners: HashMap::new(),
                    next_listener: 0,
                }),
            }),
        }
    }

    /// A client that starts connecting right away. Calls made before the
    /// host answers are queued.
    pub fn open(hub: Hub, contract: &str, version: &str) -> Result<Self, ClientError> {
        let client = Self::new(hub, contract, version);
        client.inner.begin_connect()?;
        Ok(client)
    }

    pub fn id(&self) -> Token {
        self.inner.id
    }

    pub fn contract(&self) -> &str {
        &self.inner.contract
    }

    pub fn version(&self) -> &str {
        &self.inner.version
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.core().link.state()
    }

    /// Connect to the contract's host.
    ///
    /// Resolves once the host sends `connected`. Concurrent calls share the
    /// in-flight attempt; while a disconnect is in flight, waits for it and
    /// then connects.
    pub async fn connect(&self) -> Result<(), ClientError> {
        loop {
            match self.inner.begin_connect()? {
                Wait::Done => return Ok(()),
                Wait::Connect(rx) => return rx.await.unwrap_or(Err(ClientError::Closed)),
                Wait::Disconnect(rx) => {
                    let _ = rx.await;
                }
            }
        }
    }

    /// Disconnect from the host.
    ///
    /// Fails with [`ClientError::CurrentlyConnecting`] while a connect is in
    /// flight and leaves the state untouched.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        match self.inner.begin_disconnect()? {
            None => Ok(()),
            Some(rx) => rx.await.map_err(|_| ClientError::Closed),
        }
    }

    /// Call `method` with `args`.
    ///
    /// While connected, the call is checked against the contract and sent
    /// immediately. Otherwise it is queued and sent, in order, as soon as the
    /// client connects. The returned future never blocks the caller.
    pub fn call(&self, method: &str, args: Vec<Value>) -> Result<CallFuture, ClientError> {
        self.inner.call(method, args)
    }

    /// The contract-bound interface. Only available while connected.
    pub fn bound(&self) -> Result<Arc<RemoteInterface>, ClientError> {
        match &self.inner.core().link {
            Link::Connected(interface) => Ok(interface.clone()),
            _ => Err(ClientError::NotConnected),
        }
    }

    /// Run `listener` for every broadcast named `name`. Listeners survive
    /// reconnects.
    pub fn add_event_listener<F>(&self, name: &str, listener: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let mut core = self.inner.core();
        core.next_listener += 1;
        let id = ListenerId(core.next_listener);
        core.listeners
            .entry(name.to_string())
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Returns whether a listener was removed.
    pub fn remove_event_listener(&self, name: &str, id: ListenerId) -> bool {
        let mut core = self.inner.core();
        let Some(listeners) = core.listeners.get_mut(name) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        let removed = listeners.len() != before;
        if listeners.is_empty() {
            core.listeners.remove(name);
        }
        removed
    }

    /// Calls queued until the client connects.
    pub fn pending_calls(&self) -> usize {
        self.inner.core().pending.len()
    }

    /// Calls sent and awaiting a response.
    pub fn running_calls(&self) -> usize {
        self.inner.core().running.len()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("contract", &self.inner.contract)
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl ClientInner {
    fn core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin_connect(self: &Arc<Self>) -> Result<Wait, ClientError> {
        let mut core = self.core();
        match core.link.state() {
            ConnectionState::Connected => Ok(Wait::Done),
            ConnectionState::Connecting => {
                let (tx, rx) = oneshot::channel();
                core.connect_waiters.push(tx);
                Ok(Wait::Connect(rx))
            }
            ConnectionState::Disconnecting => {
                let (tx, rx) = oneshot::channel();
                core.disconnect_waiters.push(tx);
                Ok(Wait::Disconnect(rx))
            }
            ConnectionState::Disconnected => {
                // Listen before announcing: the host answers on this channel.
                let channel = self.hub.open(self.id.to_string());
                core.channel = Some(channel.sender());
                core.pump = Some(tokio::spawn(pump(Arc::downgrade(self), channel)));
                core.link = Link::Connecting;

                tracing::debug!(contract = %self.contract, client = %self.id, "connecting");
                let announced = self.hub.post(
                    REGISTRY_CHANNEL,
                    &RegistryMessage::register_client(&self.contract, &self.version, self.id),
                );
                if let Err(e) = announced {
                    core.link = Link::Disconnected;
                    core.channel = None;
                    if let Some(pump) = core.pump.take() {
                        pump.abort();
                    }
                    return Err(e.into());
                }

                let (tx, rx) = oneshot::channel();
                core.connect_waiters.push(tx);
                Ok(Wait::Connect(rx))
            }
        }
    }

    fn begin_disconnect(&self) -> Result<Option<oneshot::Receiver<()>>, ClientError> {
        let mut core = self.core();
        match core.link.state() {
            ConnectionState::Disconnected => Ok(None),
            ConnectionState::Connecting => Err(ClientError::CurrentlyConnecting),
            ConnectionState::Disconnecting => {
                let (tx, rx) = oneshot::channel();
                core.disconnect_waiters.push(tx);
                Ok(Some(rx))
            }
            ConnectionState::Connected => {
                tracing::debug!(contract = %self.contract, client = %self.id, "disconnecting");
                self.hub.post(
                    REGISTRY_CHANNEL,
                    &RegistryMessage::unregister_client(&self.contract, &self.version, self.id),
                )?;
                core.link = Link::Disconnecting;

                let (tx, rx) = oneshot::channel();
                core.disconnect_waiters.push(tx);
                Ok(Some(rx))
            }
        }
    }

    fn call(self: &Arc<Self>, method: &str, args: Vec<Value>) -> Result<CallFuture, ClientError> {
        let mut core = self.core();
        let connected = match &core.link {
            Link::Connected(interface) => {
                interface.contract().validate_call(method, &args)?;
                true
            }
            _ => false,
        };

        let packet = Packet::request(method, args);
        if connected {
            self.send_locked(&mut core, packet)
        } else {
            Ok(self.queue_locked(&mut core, packet))
        }
    }

    /// Send through a bound stub; arguments are already validated.
    pub(crate) fn send_bound(
        self: &Arc<Self>,
        method: &str,
        args: Vec<Value>,
    ) -> Result<CallFuture, ClientError> {
        let mut core = self.core();
        if core.link.state() != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        self.send_locked(&mut core, Packet::request(method, args))
    }

    fn send_locked(self: &Arc<Self>, core: &mut Core, packet: Packet) -> Result<CallFuture, ClientError> {
        let channel = core.channel.as_ref().ok_or(ClientError::NotConnected)?;
        channel.post(&packet)?;

        let (tx, rx) = oneshot::channel();
        core.running.insert(packet.uuid, tx);
        Ok(self.future_for(packet.uuid, rx))
    }

    fn queue_locked(self: &Arc<Self>, core: &mut Core, packet: Packet) -> CallFuture {
        tracing::debug!(contract = %self.contract, method = %packet.method, "queueing call until connected");
        let (tx, rx) = oneshot::channel();
        let id = packet.uuid;
        core.pending.push_back(PendingCall { packet, reply: tx });
        self.future_for(id, rx)
    }

    fn future_for(self: &Arc<Self>, id: Token, rx: oneshot::Receiver<CallOutcome>) -> CallFuture {
        let deadline = self
            .config
            .call_timeout
            .map(|timeout| Box::pin(tokio::time::sleep(timeout)));
        CallFuture::new(id, rx, deadline, Arc::downgrade(self))
    }

    /// Drop a call from both tables (its future gave up).
    pub(crate) fn forget(&self, id: Token) {
        let mut core = self.core();
        core.running.remove(&id);
        core.pending.retain(|call| call.packet.uuid != id);
    }

    /// Apply one host message. Returns whether to keep listening.
    fn handle(self: &Arc<Self>, message: HostMessage) -> Result<bool, ClientError> {
        match message {
            HostMessage::Notice(Notice::Connected { interface }) => {
                self.on_connected(interface);
                Ok(true)
            }
            HostMessage::Notice(Notice::Disconnected { .. }) => {
                self.on_disconnected();
                Ok(false)
            }
            HostMessage::Notice(Notice::Broadcast { name, data }) => {
                self.on_broadcast(&name, &data);
                Ok(true)
            }
            HostMessage::Response(packet) => self.on_response(packet).map(|()| true),
        }
    }

    fn on_connected(self: &Arc<Self>, interface: Contract) {
        let mut core = self.core();
        let state = core.link.state();
        if state != ConnectionState::Connecting {
            tracing::debug!(client = %self.id, %state, "ignoring connected notice");
            return;
        }
        if interface.name != self.contract {
            tracing::warn!(
                client = %self.id,
                expected = %self.contract,
                received = %interface.name,
                "host sent a different contract"
            );
        }

        let interface = Arc::new(RemoteInterface::bind(interface, Arc::downgrade(self)));
        core.link = Link::Connected(interface.clone());
        tracing::debug!(
            contract = %self.contract,
            client = %self.id,
            pending = core.pending.len(),
            "connected"
        );

        let channel = core.channel.clone();
        let pending = std::mem::take(&mut core.pending);
        for call in pending {
            let PendingCall { packet, reply } = call;
            if let Err(e) = interface.contract().validate_call(&packet.method, &packet.args) {
                let _ = reply.send(Err(CallError::Rejected(e)));
                continue;
            }

            let posted = channel.as_ref().map(|c| c.post(&packet));
            match posted {
                Some(Ok(_)) => {
                    core.running.insert(packet.uuid, reply);
                }
                Some(Err(e)) => {
                    tracing::debug!(method = %packet.method, "queued call dropped: {}", e);
                    let _ = reply.send(Err(CallError::Disconnected));
                }
                None => {
                    let _ = reply.send(Err(CallError::Disconnected));
                }
            }
        }

        for waiter in core.connect_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    fn on_disconnected(&self) {
        let mut core = self.core();
        let previous = core.link.state();
        core.link = Link::Disconnected;
        core.channel = None;
        // The pump is the caller; it stops on its own.
        core.pump = None;

        tracing::debug!(
            contract = %self.contract,
            client = %self.id,
            %previous,
            running = core.running.len(),
            "disconnected"
        );

        for (_, reply) in core.running.drain() {
            let _ = reply.send(Err(CallError::Disconnected));
        }
        for waiter in core.connect_waiters.drain(..) {
            let _ = waiter.send(Err(ClientError::ConnectFailed));
        }
        for waiter in core.disconnect_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    fn on_broadcast(&self, name: &str, data: &Value) {
        let listeners: Vec<Listener> = self
            .core()
            .listeners
            .get(name)
            .map(|l| l.iter().map(|(_, f)| f.clone()).collect())
            .unwrap_or_default();

        if listeners.is_empty() {
            tracing::debug!(client = %self.id, event = %name, "no listener for broadcast");
        }
        for listener in listeners {
            listener(data);
        }
    }

    fn on_response(&self, packet: Packet) -> Result<(), ClientError> {
        if !packet.is_response() {
            return Err(ClientError::UnexpectedRequest(packet.uuid));
        }

        let reply = self
            .core()
            .running
            .remove(&packet.uuid)
            .ok_or(ClientError::UnknownResponse(packet.uuid))?;
        let _ = reply.send(packet.into_outcome().map_err(CallError::Remote));
        Ok(())
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let core = self.core.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(pump) = core.pump.take() {
            pump.abort();
        }
        let state = core.link.state();
        if matches!(state, ConnectionState::Connecting | ConnectionState::Connected) {
            let _ = self.hub.post(
                REGISTRY_CHANNEL,
                &RegistryMessage::unregister_client(&self.contract, &self.version, self.id),
            );
        }
    }
}

async fn pump(client: Weak<ClientInner>, mut channel: Channel) {
    while let Some(message) = channel.recv_as::<HostMessage>().await {
        let Some(client) = client.upgrade() else {
            break;
        };

        let message = match message {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(client = %client.id, "invalid message from host: {}", e);
                continue;
            }
        };

        match client.handle(message) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                tracing::error!(contract = %client.contract, client = %client.id, "protocol error: {}", e)
            }
        }
    }
}
