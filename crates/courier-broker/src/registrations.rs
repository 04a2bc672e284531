//! The broker's registration directory.
//!
//! One entry per contract that has at least one known client or a known
//! host. Only the broker mutates it, in response to registry events.

use crate::launcher::{Host, HostId};
use courier_core::Token;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

pub(crate) struct Registration {
    /// Host serving the contract, set once launched or adopted.
    pub(crate) server: Option<Arc<dyn Host>>,
    /// The server inside `server` has announced itself.
    pub(crate) ready: bool,
    /// Client ids in registration order, without duplicates.
    pub(crate) clients: Vec<Token>,
}

impl Registration {
    fn new() -> Self {
        Self {
            server: None,
            ready: false,
            clients: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.server.is_none() && self.clients.is_empty()
    }

    fn served_by(&self, id: HostId) -> bool {
        self.server.as_ref().is_some_and(|h| h.id() == id)
    }
}

/// Contract name → registration.
#[derive(Default)]
pub struct Registrations {
    entries: BTreeMap<String, Registration>,
}

impl Registrations {
    /// An empty directory.
    pub fn init() -> Self {
        Self::default()
    }

    /// Terminate every host still referenced, each exactly once, and forget
    /// all registrations. Returns the number of hosts terminated.
    pub fn shutdown(&mut self) -> usize {
        let mut seen = HashSet::new();
        for registration in self.entries.values() {
            if let Some(host) = &registration.server
                && seen.insert(host.id())
            {
                host.terminate();
            }
        }
        self.entries.clear();
        seen.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contracts(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Registered clients of `contract`, in registration order.
    pub fn clients(&self, contract: &str) -> &[Token] {
        self.entries
            .get(contract)
            .map(|r| r.clients.as_slice())
            .unwrap_or_default()
    }

    /// Host currently backing `contract`.
    pub fn server(&self, contract: &str) -> Option<HostId> {
        self.entries
            .get(contract)
            .and_then(|r| r.server.as_ref())
            .map(|h| h.id())
    }

    pub fn is_ready(&self, contract: &str) -> bool {
        self.entries.get(contract).is_some_and(|r| r.ready)
    }

    pub(crate) fn get_mut(&mut self, contract: &str) -> Option<&mut Registration> {
        self.entries.get_mut(contract)
    }

    pub(crate) fn entry(&mut self, contract: &str) -> &mut Registration {
        self.entries
            .entry(contract.to_string())
            .or_insert_with(Registration::new)
    }

    pub(crate) fn remove(&mut self, contract: &str) -> Option<Registration> {
        self.entries.remove(contract)
    }

    pub(crate) fn remove_if_empty(&mut self, contract: &str) {
        if self.entries.get(contract).is_some_and(Registration::is_empty) {
            self.entries.remove(contract);
        }
    }

    /// A live host already running at `location`, for co-hosting.
    pub(crate) fn host_at(&self, location: &str) -> Option<Arc<dyn Host>> {
        self.entries
            .values()
            .filter_map(|r| r.server.as_ref())
            .find(|h| h.location() == location)
            .cloned()
    }

    /// Whether some contract served by `id` still has clients.
    pub(crate) fn host_in_use(&self, id: HostId) -> bool {
        self.entries
            .values()
            .any(|r| r.served_by(id) && !r.clients.is_empty())
    }

    /// Drop every reference to a terminated host. Entries left with neither
    /// clients nor a host are deleted.
    pub(crate) fn detach(&mut self, id: HostId) {
        for registration in self.entries.values_mut() {
            if registration.served_by(id) {
                registration.server = None;
                registration.ready = false;
            }
        }
        self.entries.retain(|_, r| !r.is_empty());
    }

    /// Contracts with clients waiting and no host.
    pub(crate) fn unserved(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, r)| r.server.is_none() && !r.clients.is_empty())
            .map(|(name, _)| name.clone())
            .collect()
    }
}

impl fmt::Debug for Registrations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (name, r) in &self.entries {
            map.entry(
                name,
                &format_args!(
                    "server={:?} ready={} clients={}",
                    r.server.as_ref().map(|h| h.id()),
                    r.ready,
                    r.clients.len()
                ),
            );
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::LaunchError;
    use courier_core::HostDirective;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Stub {
        id: HostId,
        terminated: AtomicUsize,
    }

    impl Host for Stub {
        fn id(&self) -> HostId {
            self.id
        }

        fn location(&self) -> &str {
            "servers/main"
        }

        fn post(&self, _: HostDirective) -> Result<(), LaunchError> {
            Ok(())
        }

        fn terminate(&self) {
            self.terminated.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn stub(id: u64) -> Arc<Stub> {
        Arc::new(Stub {
            id: HostId::new(id),
            terminated: AtomicUsize::new(0),
        })
    }

    #[test]
    fn shutdown_terminates_shared_hosts_once() {
        let host = stub(1);
        let mut registrations = Registrations::init();
        registrations.entry("logic").server = Some(host.clone());
        registrations.entry("history").server = Some(host.clone());
        registrations.entry("favorites").clients.push(Token::random());

        assert_eq!(registrations.shutdown(), 1);
        assert_eq!(host.terminated.load(Ordering::SeqCst), 1);
        assert!(registrations.is_empty());
    }

    #[test]
    fn detach_drops_entries_left_empty() {
        let host = stub(7);
        let client = Token::random();
        let mut registrations = Registrations::init();
        registrations.entry("logic").server = Some(host.clone());
        let history = registrations.entry("history");
        history.server = Some(host.clone());
        history.ready = true;
        history.clients.push(client);

        assert!(registrations.host_in_use(host.id()));
        assert_eq!(registrations.host_at("servers/main").map(|h| h.id()), Some(host.id()));

        registrations.detach(host.id());
        assert_eq!(registrations.contracts().collect::<Vec<_>>(), vec!["history"]);
        assert_eq!(registrations.server("history"), None);
        assert!(!registrations.is_ready("history"));
        assert_eq!(registrations.clients("history"), &[client]);
        assert_eq!(registrations.unserved(), vec!["history".to_string()]);
    }
}
