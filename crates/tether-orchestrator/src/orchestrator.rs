//! Orchestrator lifecycle
//!
//! The [`Orchestrator`] ties the pieces together for one project:
//!
//! 1. `start` resolves the state identity, loads credentials and the backend
//!    binary in parallel, and spawns the backend.
//! 2. `dev_server_listening` pushes the environment (fatal on failure), runs
//!    the initial deploy and the startup functions, then begins turning file
//!    changes into coalesced redeploys.
//! 3. `shutdown` stops everything; it is idempotent and also reachable from
//!    OS signal handlers.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use tether_core::config::TetherConfig;
use tether_core::credentials;
use tether_core::error::{Result, SupervisorError, TetherError};
use tether_core::identity::{self, StateIdentity};
use tether_core::CredentialSet;

use crate::backend::{BackendEndpoint, BackendRegistry, BackendSupervisor};
use crate::binary::resolve_binary;
use crate::control::ControlPlaneClient;
use crate::deploy::{run_debouncer, DeployCoordinator, DeployRequest, FileChange, WatchFilter};
use crate::env::{EnvContext, EnvSource};

/// Everything that exists once `start` has resolved the state
struct Session {
    identity: StateIdentity,
    state_dir: PathBuf,
    supervisor: Arc<BackendSupervisor>,
    coordinator: DeployCoordinator,
}

/// Supervises one local backend for one project
pub struct Orchestrator {
    project_root: PathBuf,
    config: TetherConfig,
    env: EnvSource,
    filter: WatchFilter,
    registry: Arc<BackendRegistry>,
    cancel: CancellationToken,
    changes_tx: mpsc::Sender<FileChange>,
    changes_rx: Mutex<Option<mpsc::Receiver<FileChange>>>,
    session: Mutex<Option<Arc<Session>>>,
    pipeline_started: AtomicBool,
    signals_installed: AtomicBool,
    shutting_down: AtomicBool,
    stopped: watch::Sender<bool>,
}

impl Orchestrator {
    /// Create an orchestrator for `project_root`; nothing runs until `start`
    pub fn new(project_root: impl Into<PathBuf>, config: TetherConfig) -> Self {
        let project_root = project_root.into();
        let (changes_tx, changes_rx) = mpsc::channel(config.deploy.queue_capacity.max(1));
        let (stopped, _) = watch::channel(false);

        Self {
            filter: WatchFilter::new(&project_root, &config.deploy),
            env: EnvSource::Static(config.env.clone()),
            project_root,
            config,
            registry: Arc::new(BackendRegistry::new()),
            cancel: CancellationToken::new(),
            changes_tx,
            changes_rx: Mutex::new(Some(changes_rx)),
            session: Mutex::new(None),
            pipeline_started: AtomicBool::new(false),
            signals_installed: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            stopped,
        }
    }

    /// Replace the environment taken from the config
    pub fn with_env(mut self, env: EnvSource) -> Self {
        self.env = env;
        self
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn config(&self) -> &TetherConfig {
        &self.config
    }

    /// Directories a host should watch for source changes
    pub fn watch_roots(&self) -> Vec<PathBuf> {
        self.filter.roots()
    }

    fn session(&self) -> Option<Arc<Session>> {
        self.session.lock().ok().and_then(|session| session.clone())
    }

    pub fn identity(&self) -> Option<StateIdentity> {
        self.session().map(|session| session.identity.clone())
    }

    pub fn state_dir(&self) -> Option<PathBuf> {
        self.session().map(|session| session.state_dir.clone())
    }

    pub fn credentials(&self) -> Option<CredentialSet> {
        self.session()
            .map(|session| session.supervisor.credentials().clone())
    }

    /// Live backend endpoint
    pub fn endpoint(&self) -> Option<BackendEndpoint> {
        self.session()
            .and_then(|session| session.supervisor.endpoint())
    }

    /// Control-plane client bound to the current endpoint
    pub fn control(&self) -> ControlPlaneClient {
        match self.session() {
            Some(session) => ControlPlaneClient::new(
                session.supervisor.endpoint().map(|endpoint| endpoint.port),
                session.supervisor.credentials().admin_key.clone(),
            ),
            None => ControlPlaneClient::new(None, String::new()),
        }
    }

    /// Resolve state and credentials, fetch the binary, and spawn the backend
    ///
    /// Calling `start` again after a successful start returns the running
    /// endpoint; after a failed spawn it retries the spawn.
    pub async fn start(&self) -> Result<BackendEndpoint> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(SupervisorError::NotStarted.into());
        }
        if let Some(session) = self.session() {
            if let Some(endpoint) = session.supervisor.endpoint() {
                return Ok(endpoint);
            }
            return self.spawn_backend(&session).await;
        }

        let state = &self.config.state;
        let project_root = self.project_root.clone();
        let suffix = state.suffix.clone();
        let branch_timeout = state.branch_timeout;
        let identity = tokio::task::spawn_blocking(move || {
            identity::resolve(&project_root, suffix.as_deref(), branch_timeout)
        })
        .await
        .map_err(|e| TetherError::Io(std::io::Error::other(e)))?;

        let state_dir = self
            .project_root
            .join(&state.dir_name)
            .join(identity.dir_name());
        tracing::info!("State identity {} at {:?}", identity, state_dir);

        if state.reset {
            tracing::info!("Resetting backend state");
            self.registry.terminate_previous(&state_dir);
            remove_state_dir(&state_dir).await?;
        }
        tokio::fs::create_dir_all(&state_dir).await?;

        let instance_name = state
            .instance_name
            .clone()
            .unwrap_or_else(|| default_instance_name(&identity));

        let (credentials, binary) = tokio::try_join!(
            async {
                credentials::load_or_create(
                    &state_dir,
                    &instance_name,
                    state.credentials.as_ref(),
                    state.reset,
                )
                .map_err(TetherError::from)
            },
            async {
                resolve_binary(&self.config.binary)
                    .await
                    .map_err(TetherError::from)
            },
        )?;

        if self.is_shutting_down() {
            tracing::info!("Shutdown requested during startup, not spawning backend");
            return Err(SupervisorError::NotStarted.into());
        }
        if !state.reset {
            self.registry.terminate_previous(&state_dir);
        }

        let supervisor = Arc::new(BackendSupervisor::new(
            binary,
            credentials,
            state_dir.clone(),
            self.project_root.clone(),
            self.config.backend.clone(),
            self.config.deploy.clone(),
            Arc::clone(&self.registry),
        ));
        let session = Arc::new(Session {
            identity,
            state_dir,
            coordinator: DeployCoordinator::new(supervisor.clone()),
            supervisor,
        });
        if let Ok(mut slot) = self.session.lock() {
            *slot = Some(Arc::clone(&session));
        }

        self.spawn_backend(&session).await
    }

    /// Spawn the backend unless a shutdown intervenes
    ///
    /// A shutdown that lands while the spawn is pending may have found no
    /// process to stop, so the backend is stopped here instead.
    async fn spawn_backend(&self, session: &Session) -> Result<BackendEndpoint> {
        let spawned = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SupervisorError::NotStarted),
            result = session.supervisor.spawn() => result,
        };

        if self.is_shutting_down() {
            session
                .supervisor
                .stop(self.config.backend.purge_on_exit)
                .await?;
            return Err(SupervisorError::NotStarted.into());
        }
        Ok(spawned?)
    }

    /// Run the post-start sequence once the host's dev server is up
    ///
    /// Environment variables are pushed one at a time and any failure is
    /// returned. A failed initial deploy or startup function is logged and
    /// the sequence continues.
    pub async fn dev_server_listening(&self, address: Option<&str>) -> Result<()> {
        let session = self.session().ok_or(SupervisorError::NotStarted)?;
        let endpoint = session
            .supervisor
            .endpoint()
            .ok_or(SupervisorError::NotStarted)?;
        let control = ControlPlaneClient::new(
            Some(endpoint.port),
            session.supervisor.credentials().admin_key.clone(),
        );

        let context = EnvContext {
            backend_url: endpoint.url(),
            site_url: endpoint.site_url(),
            dev_server_address: address.map(str::to_string),
        };
        let vars = self.env.resolve(&context);
        for (name, value) in &vars {
            control.set_env(name, value).await?;
            tracing::debug!("Set environment variable {}", name);
        }
        if !vars.is_empty() {
            tracing::info!("Pushed {} environment variable(s)", vars.len());
        }

        match session.coordinator.deploy_now().await {
            Ok(()) => tracing::info!("Initial deploy complete"),
            Err(e) => tracing::error!("Initial deploy failed: {}", e),
        }

        for call in &self.config.functions {
            match control.run_function(&call.name, &call.args).await {
                Ok(value) => {
                    tracing::info!("Startup function {} completed", call.name);
                    tracing::debug!("{} returned {}", call.name, value);
                }
                Err(e) => tracing::warn!("Startup function {} failed: {}", call.name, e),
            }
        }

        self.start_pipeline(&session);
        Ok(())
    }

    /// Spawn the debouncer that turns file changes into deploy requests
    fn start_pipeline(&self, session: &Session) {
        if self.pipeline_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(changes) = self.changes_rx.lock().ok().and_then(|mut rx| rx.take()) else {
            return;
        };

        let coordinator = session.coordinator.clone();
        tokio::spawn(run_debouncer(
            changes,
            self.config.deploy.debounce,
            self.cancel.child_token(),
            move |batch| {
                tracing::info!("{} file(s) changed, redeploying", batch.len());
                coordinator.request();
            },
        ));
        tracing::debug!("Watching for source changes");
    }

    /// Feed a file change from the host
    ///
    /// Returns false if the change was filtered out or dropped because the
    /// queue is full.
    pub fn notify_file_change(&self, change: FileChange) -> bool {
        if !self.filter.matches(&change.path) {
            tracing::trace!("Ignoring change to {:?}", change.path);
            return false;
        }
        match self.changes_tx.try_send(change) {
            Ok(()) => true,
            Err(TrySendError::Full(change)) => {
                tracing::debug!("Change queue full, dropping {:?}", change.path);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Ask for a deploy outside of file changes
    pub fn request_deploy(&self) -> Option<DeployRequest> {
        let session = self.session()?;
        session.supervisor.endpoint()?;
        Some(session.coordinator.request())
    }

    /// Push environment changes to the running backend in one request
    pub async fn update_env(&self, vars: &BTreeMap<String, String>) -> Result<()> {
        self.control()
            .set_envs(vars.iter().map(|(name, value)| (name.as_str(), value.as_str())))
            .await?;
        tracing::info!("Updated {} environment variable(s)", vars.len());
        Ok(())
    }

    /// Shut down on Ctrl+C or SIGTERM; only the first call installs handlers
    pub fn install_signal_handlers(self: &Arc<Self>) {
        if self.signals_installed.swap(true, Ordering::SeqCst) {
            return;
        }

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let ctrl_c = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!("Failed to listen for Ctrl+C: {}", e);
                    std::future::pending::<()>().await;
                }
            };

            #[cfg(unix)]
            let terminate = async {
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(mut signal) => {
                        signal.recv().await;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to install SIGTERM handler: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            };

            #[cfg(not(unix))]
            let terminate = std::future::pending::<()>();

            tokio::select! {
                _ = ctrl_c => {
                    tracing::info!("Received Ctrl+C, shutting down...");
                }
                _ = terminate => {
                    tracing::info!("Received SIGTERM, shutting down...");
                }
                _ = orchestrator.cancel.cancelled() => return,
            }

            if let Err(e) = orchestrator.shutdown().await {
                tracing::error!("Shutdown failed: {}", e);
            }
        });
    }

    /// Stop background tasks and the backend
    ///
    /// Later calls wait for the first one to finish and return `Ok`.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            self.wait_for_shutdown().await;
            return Ok(());
        }

        tracing::info!("Shutting down");
        self.cancel.cancel();

        let result = match self.session() {
            Some(session) => {
                if !session.coordinator.is_idle() {
                    tracing::info!("Deploy still in flight, stopping backend anyway");
                }
                session
                    .supervisor
                    .stop(self.config.backend.purge_on_exit)
                    .await
                    .map_err(TetherError::from)
            }
            None => Ok(()),
        };

        self.stopped.send_replace(true);
        tracing::info!("Shutdown complete");
        result
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Wait until a shutdown has completed
    pub async fn wait_for_shutdown(&self) {
        let mut stopped = self.stopped.subscribe();
        let _ = stopped.wait_for(|stopped| *stopped).await;
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(pid) = self.session().and_then(|session| session.supervisor.handle().pid) {
            tracing::debug!("Orchestrator dropped with backend {} still tracked, terminating", pid);
            let _ = tether_core::pidfile::terminate_process(pid);
            self.registry.clear();
        }
    }
}

/// Instance name used when none is configured: `anonymous-<first 8 hash chars>`
pub fn default_instance_name(identity: &StateIdentity) -> String {
    let short: String = identity.hash.chars().take(8).collect();
    format!("anonymous-{}", short)
}

async fn remove_state_dir(state_dir: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(state_dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
