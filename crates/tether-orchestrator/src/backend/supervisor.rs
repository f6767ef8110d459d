//! Backend process supervision
//!
//! The supervisor owns the backend's lifecycle: it picks ports, launches the
//! binary against the state directory, waits for the health endpoint, and
//! tears the process down again. Only the supervisor changes the status in
//! [`BackendHandle`].

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;

use tether_core::config::{BackendConfig, DeployConfig};
use tether_core::error::SupervisorError;
use tether_core::CredentialSet;

use super::health::wait_for_healthy;
use super::ports::pick_port_pair;
use super::registry::BackendRegistry;
use crate::deploy::Deployer;

/// How long `stop` waits for the process to exit before touching its files
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Backend lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendStatus {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Snapshot of the supervised backend
#[derive(Debug, Clone)]
pub struct BackendHandle {
    pub port: Option<u16>,
    pub site_proxy_port: Option<u16>,
    pub pid: Option<u32>,
    pub backend_dir: PathBuf,
    pub status: BackendStatus,
}

/// Loopback addresses of a live backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendEndpoint {
    pub port: u16,
    pub site_proxy_port: u16,
}

impl BackendEndpoint {
    /// Base URL of the backend API
    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// Base URL of the HTTP actions proxy
    pub fn site_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.site_proxy_port)
    }
}

/// Launches and stops one backend process
pub struct BackendSupervisor {
    binary: PathBuf,
    credentials: CredentialSet,
    project_root: PathBuf,
    config: BackendConfig,
    deploy: DeployConfig,
    registry: Arc<BackendRegistry>,
    handle: Arc<Mutex<BackendHandle>>,
    /// Exit description published by the reaper task
    exited: Mutex<Option<watch::Receiver<Option<String>>>>,
}

impl BackendSupervisor {
    pub fn new(
        binary: PathBuf,
        credentials: CredentialSet,
        state_dir: PathBuf,
        project_root: PathBuf,
        config: BackendConfig,
        deploy: DeployConfig,
        registry: Arc<BackendRegistry>,
    ) -> Self {
        Self {
            binary,
            credentials,
            project_root,
            config,
            deploy,
            registry,
            handle: Arc::new(Mutex::new(BackendHandle {
                port: None,
                site_proxy_port: None,
                pid: None,
                backend_dir: state_dir,
                status: BackendStatus::NotStarted,
            })),
            exited: Mutex::new(None),
        }
    }

    /// Current handle snapshot
    pub fn handle(&self) -> BackendHandle {
        match self.handle.lock() {
            Ok(handle) => handle.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn status(&self) -> BackendStatus {
        self.handle().status
    }

    /// Credentials the backend was started with
    pub fn credentials(&self) -> &CredentialSet {
        &self.credentials
    }

    /// Live endpoint, once the backend is running
    pub fn endpoint(&self) -> Option<BackendEndpoint> {
        let handle = self.handle();
        match (handle.status, handle.port, handle.site_proxy_port) {
            (BackendStatus::Running, Some(port), Some(site_proxy_port)) => Some(BackendEndpoint {
                port,
                site_proxy_port,
            }),
            _ => None,
        }
    }

    fn update<R>(&self, f: impl FnOnce(&mut BackendHandle) -> R) -> R {
        match self.handle.lock() {
            Ok(mut handle) => f(&mut handle),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// Start the backend and wait until it answers health probes
    ///
    /// On a health timeout the process is left running and tracked, so a
    /// later `stop` still terminates it. A process still tracked from an
    /// earlier attempt is terminated before the new one is launched.
    pub async fn spawn(&self) -> Result<BackendEndpoint, SupervisorError> {
        self.terminate_tracked().await;
        let backend_dir = self.handle().backend_dir;
        let storage_dir = backend_dir.join(&self.config.storage_dir);
        tokio::fs::create_dir_all(&storage_dir).await?;

        let (port, site_proxy_port) = pick_port_pair()?;
        self.update(|h| {
            h.status = BackendStatus::Starting;
            h.port = Some(port);
            h.site_proxy_port = Some(site_proxy_port);
            h.pid = None;
        });

        let mut command = Command::new(&self.binary);
        command
            .arg("--port")
            .arg(port.to_string())
            .arg("--site-proxy-port")
            .arg(site_proxy_port.to_string())
            .arg("--instance-name")
            .arg(&self.credentials.instance_name)
            .arg("--instance-secret")
            .arg(self.credentials.secret_hex())
            .arg("--local-storage")
            .arg(&storage_dir)
            .arg(backend_dir.join(&self.config.sqlite_file))
            .current_dir(&backend_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.update(|h| h.status = BackendStatus::NotStarted);
                return Err(SupervisorError::ProcessStartFailed(format!(
                    "failed to run {:?}: {}",
                    self.binary, e
                )));
            }
        };

        let Some(pid) = child.id() else {
            self.update(|h| h.status = BackendStatus::NotStarted);
            return Err(SupervisorError::ProcessStartFailed(
                "backend exited before reporting a PID".to_string(),
            ));
        };
        self.update(|h| h.pid = Some(pid));
        self.registry.record(&backend_dir, pid);
        tracing::info!(pid, port, site_proxy_port, "Backend process spawned");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, "stderr"));
        }

        let (exit_tx, mut exit_rx) = watch::channel(None);
        if let Ok(mut exited) = self.exited.lock() {
            *exited = Some(exit_rx.clone());
        }
        let reaper_handle = Arc::clone(&self.handle);
        tokio::spawn(async move {
            let description = match child.wait().await {
                Ok(status) => {
                    tracing::info!(pid, %status, "Backend process exited");
                    status.to_string()
                }
                Err(e) => {
                    tracing::error!(pid, error = %e, "Failed to wait on backend process");
                    e.to_string()
                }
            };
            if let Ok(mut handle) = reaper_handle.lock() {
                if handle.pid == Some(pid) {
                    handle.pid = None;
                    if handle.status == BackendStatus::Running {
                        handle.status = BackendStatus::Stopped;
                    }
                }
            }
            let _ = exit_tx.send(Some(description));
        });

        let url = format!("http://127.0.0.1:{}", port);
        let healthy = tokio::select! {
            result = wait_for_healthy(&url, self.config.health_timeout, &self.config.health_backoff) => result,
            Ok(exit) = exit_rx.wait_for(|exit| exit.is_some()) => {
                let exit = exit.clone().unwrap_or_default();
                Err(SupervisorError::ProcessStartFailed(format!(
                    "backend exited during startup: {}",
                    exit
                )))
            }
        };

        match healthy {
            Ok(()) => {
                self.update(|h| h.status = BackendStatus::Running);
                tracing::info!("Backend ready at {}", url);
                Ok(BackendEndpoint {
                    port,
                    site_proxy_port,
                })
            }
            Err(e) => {
                self.update(|h| h.status = BackendStatus::NotStarted);
                Err(e)
            }
        }
    }

    /// Terminate the backend, optionally deleting its state directory
    ///
    /// Termination is best effort; only a failed purge is reported.
    pub async fn stop(&self, purge_state: bool) -> Result<(), SupervisorError> {
        let backend_dir = self.update(|h| {
            h.status = BackendStatus::Stopping;
            h.backend_dir.clone()
        });

        self.terminate_tracked().await;
        self.update(|h| {
            h.status = BackendStatus::Stopped;
            h.port = None;
            h.site_proxy_port = None;
        });

        if purge_state {
            tracing::info!("Removing backend state {:?}", backend_dir);
            purge_dir(&backend_dir).await?;
        }
        Ok(())
    }

    /// Terminate the tracked process, if any, and wait for the reaper
    async fn terminate_tracked(&self) {
        if let Some(pid) = self.update(|h| h.pid.take()) {
            tracing::info!("Stopping backend (PID {})", pid);
            match tether_core::pidfile::terminate_process(pid) {
                Ok(()) => self.wait_for_exit().await,
                Err(e) => tracing::warn!("Failed to terminate backend {}: {}", pid, e),
            }
        }
        self.registry.clear();
    }

    async fn wait_for_exit(&self) {
        let exited = self.exited.lock().ok().and_then(|exited| exited.clone());
        if let Some(mut exited) = exited {
            if tokio::time::timeout(STOP_GRACE, exited.wait_for(|exit| exit.is_some()))
                .await
                .is_err()
            {
                tracing::warn!("Backend did not exit within {:?}", STOP_GRACE);
            }
        }
    }

    /// Push the project's functions to the running backend
    pub async fn deploy(&self) -> Result<(), SupervisorError> {
        let endpoint = self.endpoint().ok_or(SupervisorError::NotStarted)?;
        let Some((program, leading)) = self.deploy.command.split_first() else {
            return Err(SupervisorError::DeployFailed {
                output: "deploy command is empty".to_string(),
            });
        };

        let mut command = Command::new(program);
        command
            .args(leading)
            .arg("--url")
            .arg(endpoint.url())
            .arg("--admin-key")
            .arg(&self.credentials.admin_key)
            .current_dir(&self.project_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::info!("Deploying to {}", endpoint.url());
        let output = match tokio::time::timeout(self.deploy.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(SupervisorError::DeployFailed {
                    output: format!("failed to run {}: {}", program, e),
                })
            }
            Err(_) => {
                return Err(SupervisorError::DeployFailed {
                    output: format!("deploy timed out after {:?}", self.deploy.timeout),
                })
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(SupervisorError::DeployFailed {
                output: format!("{}\n{}{}", output.status, stdout, stderr),
            });
        }

        tracing::debug!(stdout = %stdout.trim(), "Deploy output");
        tracing::info!("Deploy complete");
        Ok(())
    }
}

#[async_trait]
impl Deployer for BackendSupervisor {
    async fn deploy(&self) -> Result<(), SupervisorError> {
        BackendSupervisor::deploy(self).await
    }
}

async fn forward_output<R>(stream: R, name: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::debug!(target: "tether::backend", stream = name, "{}", line),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("Backend {} closed: {}", name, e);
                break;
            }
        }
    }
}

async fn purge_dir(dir: &Path) -> Result<(), SupervisorError> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
