//! Single-flight deploy scheduling
//!
//! At most one deploy runs at a time. Requests that arrive while a deploy is
//! in flight collapse into a single trailing deploy, which starts as soon as
//! the current one finishes. However many requests arrive during one deploy,
//! exactly one trailing deploy follows it.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use tether_core::error::SupervisorError;

/// Something that can push the project to the backend
#[async_trait]
pub trait Deployer: Send + Sync + 'static {
    async fn deploy(&self) -> Result<(), SupervisorError>;
}

/// Scheduling state of the coordinator
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeployCoordinatorState {
    /// A deploy is running
    pub in_flight: bool,
    /// Another deploy was requested while one was running
    pub pending_trailing: bool,
}

/// Outcome of a deploy request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployRequest {
    /// The coordinator was idle and a deploy started
    Started,
    /// A deploy was already running; a trailing deploy is scheduled
    Coalesced,
}

/// Coalescing deploy scheduler
#[derive(Clone)]
pub struct DeployCoordinator {
    deployer: Arc<dyn Deployer>,
    state: Arc<watch::Sender<DeployCoordinatorState>>,
}

impl DeployCoordinator {
    pub fn new(deployer: Arc<dyn Deployer>) -> Self {
        let (state, _) = watch::channel(DeployCoordinatorState::default());
        Self {
            deployer,
            state: Arc::new(state),
        }
    }

    /// Current scheduling state
    pub fn state(&self) -> DeployCoordinatorState {
        *self.state.borrow()
    }

    pub fn is_idle(&self) -> bool {
        !self.state().in_flight
    }

    /// Mark a deploy as in flight; returns false if one already was
    fn try_begin(&self) -> bool {
        let mut began = false;
        self.state.send_modify(|state| {
            if !state.in_flight {
                state.in_flight = true;
                began = true;
            }
        });
        began
    }

    /// Request a deploy without waiting for it
    ///
    /// Must be called from within a tokio runtime.
    pub fn request(&self) -> DeployRequest {
        let mut outcome = DeployRequest::Started;
        self.state.send_modify(|state| {
            if state.in_flight {
                state.pending_trailing = true;
                outcome = DeployRequest::Coalesced;
            } else {
                state.in_flight = true;
            }
        });

        match outcome {
            DeployRequest::Started => {
                tracing::debug!("Deploy requested");
                let coordinator = self.clone();
                tokio::spawn(async move { coordinator.run_chain().await });
            }
            DeployRequest::Coalesced => {
                tracing::debug!("Deploy in flight, scheduling trailing deploy");
            }
        }
        outcome
    }

    /// Deploy and wait for the result
    ///
    /// Waits for any running deploy to finish first. Requests made while this
    /// deploy runs are coalesced into a trailing deploy as usual.
    pub async fn deploy_now(&self) -> Result<(), SupervisorError> {
        loop {
            self.wait_idle().await;
            if self.try_begin() {
                break;
            }
        }

        let result = self.deployer.deploy().await;
        if self.finish_one() {
            let coordinator = self.clone();
            tokio::spawn(async move { coordinator.run_chain().await });
        }
        result
    }

    /// Wait until no deploy is in flight or pending
    pub async fn wait_idle(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|state| !state.in_flight).await;
    }

    /// Run deploys until no trailing deploy is pending
    async fn run_chain(&self) {
        loop {
            match self.deployer.deploy().await {
                Ok(()) => tracing::debug!("Deploy finished"),
                Err(e) => tracing::error!("Deploy failed: {}", e),
            }
            if !self.finish_one() {
                break;
            }
            tracing::info!("Running trailing deploy");
        }
    }

    /// Close out one deploy; returns true when a trailing deploy should run
    fn finish_one(&self) -> bool {
        let mut again = false;
        self.state.send_modify(|state| {
            if state.pending_trailing {
                state.pending_trailing = false;
                again = true;
            } else {
                state.in_flight = false;
            }
        });
        again
    }
}
