use std::{
    collections::{BTreeSet, HashMap},
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures::future::{BoxFuture, FutureExt};
use tokio::{
    net::TcpStream,
    sync::RwLock,
    task::JoinHandle,
    time::{sleep, timeout},
};
use tracing::{debug, error, info, warn};

use super::{
    registration::{Registered, Registration},
    restart::{RestartPolicy, RestartTracker},
    runner::{OnStop, Runner, RunnerFactory},
};
use crate::{error::RouterError, util::Counter};

/// Least delay between consecutive failed respawns of one executable.
const RETRY_FLOOR: Duration = Duration::from_millis(100);

/// A plugin that is registered and reachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginRecord {
    pub id: u32,
    pub service: String,
    pub addr: SocketAddr,
    pub version: String,
    pub exe: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    /// Spawned, handshake not finished. Not routable.
    Pending,
    Registered,
    /// Gone, or never known.
    Removed,
}

#[derive(Debug, Clone)]
pub struct ControlOptions {
    pub registration_addr: SocketAddr,
    pub handshake_timeout: Duration,
    pub restart: RestartPolicy,
}

impl Default for ControlOptions {
    fn default() -> Self {
        Self {
            registration_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            handshake_timeout: Duration::from_secs(30),
            restart: RestartPolicy::default(),
        }
    }
}

struct Entry {
    record: Arc<PluginRecord>,
    runner: Arc<dyn Runner>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Starting {
    Waiting,
    /// The process ended while its handshake was still running.
    Exited,
}

/// All plugin tables live behind one lock so that id, service and
/// executable views always agree.
#[derive(Default)]
struct Tables {
    by_id: HashMap<u32, Entry>,
    by_service: HashMap<String, Arc<PluginRecord>>,
    by_exe: HashMap<PathBuf, BTreeSet<u32>>,
    starting: HashMap<u32, Starting>,
}

impl Tables {
    fn insert(&mut self, record: Arc<PluginRecord>, runner: Arc<dyn Runner>) {
        self.by_service.insert(record.service.clone(), record.clone());
        self.by_exe.entry(record.exe.clone()).or_default().insert(record.id);
        self.by_id.insert(record.id, Entry { record, runner });
    }

    fn remove(&mut self, id: u32) -> Option<Entry> {
        let entry = self.by_id.remove(&id)?;
        let record = &entry.record;
        if self
            .by_service
            .get(&record.service)
            .is_some_and(|r| r.id == id)
        {
            self.by_service.remove(&record.service);
        }
        if let Some(ids) = self.by_exe.get_mut(&record.exe) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_exe.remove(&record.exe);
            }
        }
        Some(entry)
    }
}

/// Plugin supervisor: launches executables, waits for their registration,
/// keeps the routing tables and restarts plugins that crash.
pub struct Control {
    runners: Arc<dyn RunnerFactory>,
    registration: Arc<Registration>,
    registration_task: JoinHandle<()>,
    tables: RwLock<Tables>,
    ids: Counter,
    handshake_timeout: Duration,
    restarts: RestartTracker,
    closing: AtomicBool,
}

impl Control {
    /// Starts the registration service; plugins can be run afterwards.
    pub async fn start(
        runners: Arc<dyn RunnerFactory>,
        options: ControlOptions,
    ) -> Result<Arc<Self>, RouterError> {
        let (registration, registration_task) =
            Registration::start(options.registration_addr, options.handshake_timeout).await?;
        Ok(Arc::new(Self {
            runners,
            registration,
            registration_task,
            tables: RwLock::new(Tables::default()),
            ids: Counter::default(),
            handshake_timeout: options.handshake_timeout,
            restarts: RestartTracker::new(options.restart),
            closing: AtomicBool::new(false),
        }))
    }

    pub fn registration(&self) -> &Arc<Registration> {
        &self.registration
    }

    pub fn registration_addr(&self) -> SocketAddr {
        self.registration.addr()
    }

    /// Launches `exe` and waits until it registered, failed, or the handshake
    /// timeout expired. Only a registered plugin is ever routable.
    pub async fn run(self: &Arc<Self>, exe: impl AsRef<Path>) -> Result<Arc<PluginRecord>, RouterError> {
        let exe = exe.as_ref().to_path_buf();
        let runner = self.runners.new_runner(&exe)?;
        let id = self.ids.next();

        let completion = self.registration.add_pending(id);
        self.tables.write().await.starting.insert(id, Starting::Waiting);
        debug!(id, exe = %exe.display(), "starting plugin");

        if let Err(err) = runner.start(id, self.registration.addr(), self.on_stop(id, exe.clone())).await {
            self.abandon(id).await;
            return Err(err);
        }

        let registered = match timeout(self.handshake_timeout, completion).await {
            Ok(Ok(Ok(registered))) => registered,
            Ok(Ok(Err(err))) => {
                warn!(id, exe = %exe.display(), "plugin failed to register: {err}");
                self.discard(id, &runner).await;
                return Err(err);
            }
            Ok(Err(_)) => {
                self.discard(id, &runner).await;
                return Err(RouterError::PluginExited("registration abandoned".into()));
            }
            Err(_) => {
                warn!(id, exe = %exe.display(), "awaiting registration to complete has timed out");
                self.discard(id, &runner).await;
                return Err(RouterError::HandshakeTimeout);
            }
        };

        self.install(id, exe, registered, runner).await
    }

    async fn install(
        &self,
        id: u32,
        exe: PathBuf,
        registered: Registered,
        runner: Arc<dyn Runner>,
    ) -> Result<Arc<PluginRecord>, RouterError> {
        let record = Arc::new(PluginRecord {
            id,
            service: registered.service,
            addr: registered.addr,
            version: registered.version,
            exe,
        });

        let refused = {
            let mut tables = self.tables.write().await;
            match tables.starting.remove(&id) {
                Some(Starting::Exited) => Some(RouterError::PluginExited(format!(
                    "plugin #{id} exited right after registering"
                ))),
                _ if tables.by_service.contains_key(&record.service) => {
                    Some(RouterError::DuplicateService(record.service.clone()))
                }
                _ => {
                    tables.insert(record.clone(), runner.clone());
                    None
                }
            }
        };

        if let Some(err) = refused {
            error!(id, service = %record.service, exe = %record.exe.display(), "{err}");
            self.discard(id, &runner).await;
            return Err(err);
        }

        self.restarts.on_registered(&record.exe);
        info!(
            id,
            service = %record.service,
            version = %record.version,
            addr = %record.addr,
            "plugin registered"
        );
        Ok(record)
    }

    fn on_stop(self: &Arc<Self>, id: u32, exe: PathBuf) -> OnStop {
        let control: Weak<Self> = Arc::downgrade(self);
        Box::new(move |restart, err| {
            if let Some(control) = control.upgrade() {
                tokio::spawn(control.restart_or_remove(id, exe, restart, err));
            }
        })
    }

    /// Reaction to a plugin process ending: drop it from the tables and, if
    /// it crashed while registered, launch the executable again.
    fn restart_or_remove(
        self: Arc<Self>,
        id: u32,
        exe: PathBuf,
        restart: bool,
        err: Option<anyhow::Error>,
    ) -> BoxFuture<'static, ()> {
        async move {
            match (&err, restart) {
                (Some(err), true) => warn!(id, exe = %exe.display(), "plugin crashed: {err:#}"),
                (Some(err), false) => debug!(id, exe = %exe.display(), "plugin stopped: {err:#}"),
                (None, _) => info!(id, exe = %exe.display(), "plugin exited"),
            }

            let removed = {
                let mut tables = self.tables.write().await;
                if let Some(state) = tables.starting.get_mut(&id) {
                    *state = Starting::Exited;
                    None
                } else {
                    tables.remove(id).map(|entry| entry.record)
                }
            };

            let Some(record) = removed else {
                let reason = err.map_or_else(|| "exited".to_string(), |e| format!("{e:#}"));
                self.registration
                    .fail_pending(id, RouterError::PluginExited(reason));
                return;
            };
            info!(id, service = %record.service, "plugin removed");

            if !restart || err.is_none() || self.closing.load(Ordering::SeqCst) {
                return;
            }
            self.respawn(exe).await;
        }
        .boxed()
    }

    /// Launches `exe` again until one instance registers. Gives up when the
    /// restart budget is spent, on shutdown, or once `exe` is stopped on
    /// purpose.
    async fn respawn(self: &Arc<Self>, exe: PathBuf) {
        let generation = self.restarts.generation(&exe);
        let mut attempt = 0u32;
        loop {
            let Some(mut delay) = self.restarts.on_crash(&exe) else {
                error!("{}", RouterError::RestartLimit(exe));
                return;
            };
            if attempt > 0 {
                delay = delay.max(RETRY_FLOOR);
            }
            attempt += 1;
            if !delay.is_zero() {
                sleep(delay).await;
            }
            if self.closing.load(Ordering::SeqCst) || self.restarts.generation(&exe) != generation {
                return;
            }

            match self.run(&exe).await {
                Ok(record) => {
                    // stopped on purpose while the respawn was registering
                    if self.restarts.generation(&exe) != generation {
                        let _ = self.stop(record.id).await;
                    }
                    return;
                }
                Err(RouterError::DuplicateService(service)) => {
                    warn!(exe = %exe.display(), %service, "service taken by another plugin, not restarting");
                    return;
                }
                Err(err) => {
                    warn!(exe = %exe.display(), attempt, "failed to restart plugin: {err}");
                }
            }
        }
    }

    /// Closes the pending slot of a plugin that never made it to `start`.
    async fn abandon(&self, id: u32) {
        self.registration.remove_pending(id);
        self.tables.write().await.starting.remove(&id);
    }

    /// Tears down a plugin that will not be registered.
    async fn discard(&self, id: u32, runner: &Arc<dyn Runner>) {
        self.abandon(id).await;
        if let Err(err) = runner.stop().await {
            warn!(id, "failed to stop plugin: {err}");
        }
    }

    /// Opens a fresh connection to the plugin serving `service`.
    pub async fn dial(&self, service: &str) -> Result<TcpStream, RouterError> {
        let addr = self
            .lookup(service)
            .await
            .map(|record| record.addr)
            .ok_or_else(|| RouterError::ServiceNotFound(service.to_string()))?;
        Ok(TcpStream::connect(addr).await?)
    }

    pub async fn lookup(&self, service: &str) -> Option<Arc<PluginRecord>> {
        self.tables.read().await.by_service.get(service).cloned()
    }

    pub async fn plugin(&self, id: u32) -> Option<Arc<PluginRecord>> {
        self.tables.read().await.by_id.get(&id).map(|e| e.record.clone())
    }

    /// Registered plugins ordered by id.
    pub async fn plugins(&self) -> Vec<Arc<PluginRecord>> {
        let tables = self.tables.read().await;
        let mut records: Vec<_> = tables.by_id.values().map(|e| e.record.clone()).collect();
        records.sort_by_key(|r| r.id);
        records
    }

    /// Ids of registered plugins launched from `exe`.
    pub async fn ids_for(&self, exe: &Path) -> Vec<u32> {
        self.tables
            .read()
            .await
            .by_exe
            .get(exe)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn state(&self, id: u32) -> PluginState {
        let tables = self.tables.read().await;
        if tables.by_id.contains_key(&id) {
            PluginState::Registered
        } else if tables.starting.get(&id) == Some(&Starting::Waiting) {
            PluginState::Pending
        } else {
            PluginState::Removed
        }
    }

    /// Stops plugin `id` for good; it is unroutable before the process dies.
    pub async fn stop(&self, id: u32) -> Result<(), RouterError> {
        let entry = self
            .tables
            .write()
            .await
            .remove(id)
            .ok_or(RouterError::NotRunning(id))?;
        info!(id, service = %entry.record.service, "stopping plugin");
        entry.runner.stop().await
    }

    /// Stops every plugin launched from `exe`.
    pub async fn stop_exe(&self, exe: &Path) -> Result<(), RouterError> {
        self.restarts.forget(exe);
        let mut result = Ok(());
        for id in self.ids_for(exe).await {
            match self.stop(id).await {
                // raced with a crash
                Err(RouterError::NotRunning(_)) => {}
                Err(err) => result = Err(err),
                Ok(()) => {}
            }
        }
        result
    }

    /// Stops all plugins and the registration service. No restarts happen
    /// afterwards.
    pub async fn shutdown(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.registration_task.abort();

        let entries: Vec<Entry> = {
            let mut tables = self.tables.write().await;
            let ids: Vec<u32> = tables.by_id.keys().copied().collect();
            ids.into_iter().filter_map(|id| tables.remove(id)).collect()
        };
        for entry in entries {
            if let Err(err) = entry.runner.stop().await {
                warn!(id = entry.record.id, "failed to stop plugin: {err}");
            }
        }
        info!("all plugins stopped");
    }
}
