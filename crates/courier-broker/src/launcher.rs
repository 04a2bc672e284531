//! Starting and stopping hosts.
//!
//! The broker never runs servers itself. It asks a [`Launcher`] for a host
//! at a configured location and talks to that host only through
//! [`HostDirective`]s.

use courier_core::{HostContext, HostDirective, HostKind, HostOutbox, Hub};
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;

/// Identifies one running host instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostId(u64);

impl HostId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host#{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("nothing to run at {0}")]
    UnknownLocation(String),
    #[error("{0} is no longer running")]
    HostGone(HostId),
}

/// A running host, as the broker sees it.
pub trait Host: Send + Sync {
    fn id(&self) -> HostId;

    fn location(&self) -> &str;

    fn post(&self, directive: HostDirective) -> Result<(), LaunchError>;

    fn terminate(&self);
}

/// Starts hosts on the broker's behalf.
pub trait Launcher: Send + Sync {
    /// Start (or reach) a host of `kind` at `location`.
    ///
    /// `Ok(None)` means no instance is available and none can be started
    /// lazily, as with a service-worker controller that is not running.
    fn launch(&self, kind: HostKind, location: &str) -> Result<Option<Arc<dyn Host>>, LaunchError>;
}

type HostBody = Arc<dyn Fn(HostContext) -> BoxFuture<'static, ()> + Send + Sync>;

/// Runs hosts as tokio tasks in this process.
///
/// Each location gets an async body that receives its [`HostContext`];
/// typically it builds its servers and hands them to `courier_server::serve`.
///
/// - `Worker` and `Window` start a fresh task per launch.
/// - `SharedWorker` reuses the running task for the location, if any.
/// - `ServiceWorker` only resolves to a controller previously attached with
///   [`TaskLauncher::attach_controller`].
pub struct TaskLauncher {
    hub: Hub,
    bodies: HashMap<String, HostBody>,
    state: Mutex<LauncherState>,
}

#[derive(Default)]
struct LauncherState {
    next_id: u64,
    shared: HashMap<String, Arc<TaskHost>>,
    controllers: HashMap<String, Arc<TaskHost>>,
}

struct TaskHost {
    id: HostId,
    location: String,
    kind: HostKind,
    outbox: HostOutbox,
    task: JoinHandle<()>,
    /// Set by `terminate`. An aborted task only reports finished once the
    /// runtime polls it again.
    terminated: AtomicBool,
}

impl TaskLauncher {
    pub fn new(hub: Hub) -> Self {
        Self {
            hub,
            bodies: HashMap::new(),
            state: Mutex::new(LauncherState::default()),
        }
    }

    /// Register the body run for hosts at `location`.
    pub fn host<F, Fut>(mut self, location: &str, body: F) -> Self
    where
        F: Fn(HostContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let body: HostBody = Arc::new(move |ctx| Box::pin(body(ctx)));
        self.bodies.insert(location.to_string(), body);
        self
    }

    /// Start the persistent controller for `location`. Later `ServiceWorker`
    /// launches for that location resolve to it.
    pub fn attach_controller(&self, location: &str) -> Result<HostId, LaunchError> {
        let mut state = self.state();
        let host = self.spawn(&mut state, HostKind::ServiceWorker, location)?;
        let id = host.id;
        if let Some(previous) = state.controllers.insert(location.to_string(), host) {
            previous.terminate();
        }
        Ok(id)
    }

    /// Hosts this launcher started that are still running.
    pub fn running(&self) -> usize {
        let state = self.state();
        state.shared.values().filter(|h| h.is_running()).count()
            + state.controllers.values().filter(|h| h.is_running()).count()
    }

    fn state(&self) -> MutexGuard<'_, LauncherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn(
        &self,
        state: &mut LauncherState,
        kind: HostKind,
        location: &str,
    ) -> Result<Arc<TaskHost>, LaunchError> {
        let body = self
            .bodies
            .get(location)
            .ok_or_else(|| LaunchError::UnknownLocation(location.to_string()))?;

        state.next_id += 1;
        let id = HostId(state.next_id);
        let (ctx, outbox) = HostContext::new(self.hub.clone(), location, kind);
        let task = tokio::spawn(body(ctx));

        tracing::info!(%id, %location, %kind, "host started");
        Ok(Arc::new(TaskHost {
            id,
            location: location.to_string(),
            kind,
            outbox,
            task,
            terminated: AtomicBool::new(false),
        }))
    }
}

impl Launcher for TaskLauncher {
    fn launch(&self, kind: HostKind, location: &str) -> Result<Option<Arc<dyn Host>>, LaunchError> {
        let mut state = self.state();
        match kind {
            HostKind::ServiceWorker => Ok(state
                .controllers
                .get(location)
                .filter(|h| h.is_running())
                .map(|h| Arc::clone(h) as Arc<dyn Host>)),
            HostKind::SharedWorker => {
                if let Some(host) = state.shared.get(location).filter(|h| h.is_running()) {
                    return Ok(Some(host.clone()));
                }
                let host = self.spawn(&mut state, kind, location)?;
                state.shared.insert(location.to_string(), host.clone());
                Ok(Some(host))
            }
            HostKind::Worker | HostKind::Window => {
                Ok(Some(self.spawn(&mut state, kind, location)?))
            }
        }
    }
}

impl fmt::Debug for TaskLauncher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskLauncher")
            .field("locations", &self.bodies.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TaskHost {
    fn is_running(&self) -> bool {
        !self.terminated.load(Ordering::SeqCst) && !self.task.is_finished()
    }
}

impl Host for TaskHost {
    fn id(&self) -> HostId {
        self.id
    }

    fn location(&self) -> &str {
        &self.location
    }

    fn post(&self, directive: HostDirective) -> Result<(), LaunchError> {
        if !self.is_running() {
            return Err(LaunchError::HostGone(self.id));
        }
        self.outbox
            .send(directive)
            .map_err(|_| LaunchError::HostGone(self.id))
    }

    fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(id = %self.id, location = %self.location, kind = %self.kind, "terminating host");
        self.task.abort();
    }
}
