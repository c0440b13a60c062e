//! Owns a set of agents for the lifetime of a process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use reef_backend::{backend_for, BackendKind};
use reef_core::{Reef, ReefError};
use reef_trace::Tracer;
use serde::Serialize;
use tokio::sync::Notify;

use crate::agent::Agent;
use crate::config::RunnerConfig;
use crate::context::Services;
use crate::error::RunnerError;
use crate::registry::AgentRegistry;

/// Snapshot reported by [`AgentRunner::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunnerStats {
    pub agent_count: usize,
    pub backend: BackendKind,
    pub running: bool,
}

/// Trips [`AgentRunner::run`] from another task.
#[derive(Debug, Clone)]
pub struct ShutdownHandle(Arc<Notify>);

impl ShutdownHandle {
    /// Asks the runner to stop. A trigger before `run` starts is remembered.
    pub fn trigger(&self) {
        self.0.notify_one();
    }
}

/// Builds the backend, tracer and reef from a [`RunnerConfig`], registers
/// its agents and keeps them subscribed until shutdown.
pub struct AgentRunner {
    agents: Vec<Arc<Agent>>,
    config: RunnerConfig,
    services: Services,
    tracer: Option<Tracer>,
    registry: Arc<AgentRegistry>,
    reef: Mutex<Option<Reef>>,
    init: tokio::sync::Mutex<()>,
    notify: Arc<Notify>,
    running: AtomicBool,
    stopped: AtomicBool,
}

impl std::fmt::Debug for AgentRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRunner")
            .field("agents", &self.registry.names())
            .field("backend", &self.config.backend.kind)
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl AgentRunner {
    pub fn new<I, A>(agents: I, config: RunnerConfig) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Arc<Agent>>,
    {
        Self {
            agents: agents.into_iter().map(Into::into).collect(),
            config,
            services: Services::default(),
            tracer: None,
            registry: Arc::new(AgentRegistry::new()),
            reef: Mutex::new(None),
            init: tokio::sync::Mutex::new(()),
            notify: Arc::new(Notify::new()),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Collaborators handed to every agent.
    pub fn with_services(mut self, services: Services) -> Self {
        self.services = services;
        self
    }

    /// Uses `tracer` instead of building one from the observability config.
    pub fn with_tracer(mut self, tracer: Tracer) -> Self {
        self.tracer = Some(tracer);
        self
    }

    /// Settings this runner was built with.
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Connects the backend, builds the reef and registers every agent.
    /// Later calls return the same reef until the runner is shut down.
    ///
    /// # Errors
    ///
    /// `Reef(ShuttingDown)` after [`AgentRunner::shutdown`], `Trace` when
    /// the span store cannot be opened, `Backend` when the transport cannot
    /// connect, `Agent` when a subscription fails.
    pub async fn initialize(&self) -> Result<Reef, RunnerError> {
        let _init = self.init.lock().await;
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ReefError::ShuttingDown(self.config.reef.name.clone()).into());
        }
        if let Some(reef) = self.reef() {
            return Ok(reef);
        }

        let tracer = match &self.tracer {
            Some(tracer) => tracer.clone(),
            None => Tracer::new(&self.config.observability)?,
        };
        let backend = backend_for(self.config.backend.kind);
        backend.initialize(&self.config.backend).await?;
        let reef = Reef::new(backend, tracer, self.config.reef.clone());

        if let Some(storage) = &self.services.storage {
            for provider in storage.connect_all().await {
                tracing::warn!(provider = %provider, "storage provider unavailable");
            }
        }

        for agent in &self.agents {
            self.registry.register(Arc::clone(agent));
            if let Err(e) = agent.register_with(&reef, self.services.clone()).await {
                tracing::error!(agent = %agent.name(), error = %e, "agent registration failed");
                if let Err(close) = reef.shutdown(false).await {
                    tracing::warn!(error = %close, "failed to close backend after registration error");
                }
                return Err(e.into());
            }
        }

        *self.reef.lock().unwrap_or_else(PoisonError::into_inner) = Some(reef.clone());
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(
            reef = %reef.name(),
            backend = %self.config.backend.kind,
            agents = self.agents.len(),
            "agent runner initialized"
        );
        Ok(reef)
    }

    /// Initializes, then waits for the shutdown handle, SIGINT or SIGTERM
    /// and shuts down.
    ///
    /// # Errors
    ///
    /// See [`AgentRunner::initialize`] and [`AgentRunner::shutdown`].
    pub async fn run(&self) -> Result<(), RunnerError> {
        self.initialize().await?;
        tokio::select! {
            () = shutdown_signal() => {}
            () = self.notify.notified() => {
                tracing::info!("shutdown requested, stopping agent runner");
            }
        }
        self.shutdown().await
    }

    /// Drains in-flight work and closes the backend. Later calls do nothing.
    ///
    /// # Errors
    ///
    /// Returns `Reef` when the backend fails to close cleanly.
    pub async fn shutdown(&self) -> Result<(), RunnerError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.running.store(false, Ordering::SeqCst);
        let Some(reef) = self.reef() else {
            return Ok(());
        };
        reef.shutdown(true).await?;
        tracing::info!(reef = %reef.name(), "agent runner stopped");
        Ok(())
    }

    /// Agent count, backend kind and whether the runner is live.
    pub fn stats(&self) -> RunnerStats {
        RunnerStats {
            agent_count: self.registry.len(),
            backend: self.config.backend.kind,
            running: self.running.load(Ordering::SeqCst),
        }
    }

    /// The reef, once initialized.
    pub fn reef(&self) -> Option<Reef> {
        self.reef
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Agents registered by [`AgentRunner::initialize`].
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// A handle that stops [`AgentRunner::run`] from another task.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(Arc::clone(&self.notify))
    }
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
///
/// A signal that cannot be installed is logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
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
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
