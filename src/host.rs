//! Composition root.
//!
//! Builds the four components from one [`Config`], runs the bridge listener
//! and routes validated bridge callbacks to whichever component owns the
//! reaction.

use serde::Serialize;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::collab::{
    ChatBroadcaster, ChatCategory, LocalRepository, Repository, StaticFiles, SymlinkStaticFiles,
    TracingBroadcaster,
};
use crate::locks::{source_from_config, InstallSnapshot, InstallSource, LockManager};
use crate::pipeline::{PipelineDeps, PipelineSnapshot, StagingPipeline};
use crate::transport::{BridgeEvent, BridgeServer, TransportGateway};
use crate::types::{Config, Error, Result};
use crate::watchdog::{
    platform_suspender, EngineLauncher, OsLauncher, ProcessSuspender, Watchdog, WatchdogSnapshot,
};

/// Replaceable collaborators. [`HostParts::from_config`] gives the
/// filesystem-backed defaults the CLI uses.
#[derive(Clone)]
pub struct HostParts {
    pub repository: Arc<dyn Repository>,
    pub static_files: Arc<dyn StaticFiles>,
    pub chat: Arc<dyn ChatBroadcaster>,
    pub install_source: Arc<dyn InstallSource>,
    pub launcher: Arc<dyn EngineLauncher>,
    pub suspender: Arc<dyn ProcessSuspender>,
}

impl std::fmt::Debug for HostParts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostParts")
            .field("suspender", &self.suspender)
            .finish_non_exhaustive()
    }
}

impl HostParts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            repository: Arc::new(LocalRepository::new(config.source_dir())),
            static_files: Arc::new(SymlinkStaticFiles::new(config.static_dir())),
            chat: Arc::new(TracingBroadcaster),
            install_source: source_from_config(&config.install),
            launcher: Arc::new(OsLauncher::new(
                config.diagnostics_dir(),
                config.watchdog.max_diagnostic_logs,
                config.watchdog.readiness_poll_interval,
                config.watchdog.reattach_poll_interval,
            )),
            suspender: platform_suspender(),
        }
    }
}

/// Status of every component.
#[derive(Debug, Clone, Serialize)]
pub struct HostSnapshot {
    pub watchdog: WatchdogSnapshot,
    pub pipeline: PipelineSnapshot,
    pub install: InstallSnapshot,
    pub api_version: Option<String>,
}

/// Owns the warden's components.
pub struct Host {
    config: Config,
    locks: LockManager,
    gateway: TransportGateway,
    watchdog: Watchdog,
    pipeline: StagingPipeline,
    chat: Arc<dyn ChatBroadcaster>,
    events: Mutex<Option<mpsc::UnboundedReceiver<BridgeEvent>>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("root", &self.config.paths.root)
            .field("watchdog", &self.watchdog)
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

impl Host {
    pub fn from_config(config: Config) -> Result<Self> {
        let parts = HostParts::from_config(&config);
        Self::new(config, parts)
    }

    pub fn new(config: Config, parts: HostParts) -> Result<Self> {
        let locks = LockManager::open(&config, parts.install_source, parts.chat.clone())?;
        let (gateway, events) = TransportGateway::new(config.transport.clone());
        let watchdog = Watchdog::new(
            &config,
            locks.clone(),
            gateway.clone(),
            parts.chat.clone(),
            parts.launcher,
            parts.suspender,
        );
        let pipeline = StagingPipeline::new(
            &config,
            PipelineDeps {
                watchdog: watchdog.clone(),
                locks: locks.clone(),
                gateway: gateway.clone(),
                repository: parts.repository,
                static_files: parts.static_files,
                chat: parts.chat.clone(),
            },
        );

        Ok(Self {
            config,
            locks,
            gateway,
            watchdog,
            pipeline,
            chat: parts.chat,
            events: Mutex::new(Some(events)),
            cancel: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn gateway(&self) -> &TransportGateway {
        &self.gateway
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    pub fn pipeline(&self) -> &StagingPipeline {
        &self.pipeline
    }

    pub fn snapshot(&self) -> HostSnapshot {
        HostSnapshot {
            watchdog: self.watchdog.snapshot(),
            pipeline: self.pipeline.snapshot(),
            install: self.locks.snapshot(),
            api_version: self.gateway.api_version().map(|v| v.to_string()),
        }
    }

    /// Serve the bridge and route its events until [`Host::shutdown`].
    pub async fn run(&self) -> Result<()> {
        let events = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| Error::busy("host is already running"))?;

        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, self.config.transport.bridge_port));
        let server = BridgeServer::new(self.gateway.clone(), addr);

        tokio::select! {
            served = server.serve() => served?,
            _ = self.route(events) => {}
            _ = self.cancel.cancelled() => {
                tracing::info!("host shutting down");
            }
        }
        server.shutdown();
        Ok(())
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn route(&self, mut events: mpsc::UnboundedReceiver<BridgeEvent>) {
        while let Some(event) = events.recv().await {
            self.dispatch(event);
        }
    }

    /// React to one validated bridge callback.
    pub fn dispatch(&self, event: BridgeEvent) {
        tracing::debug!(?event, "bridge event");
        match event {
            BridgeEvent::KillRequested => {
                if let Err(e) = self.watchdog.hard_restart() {
                    tracing::warn!(error = %e, "engine asked to be killed but is not supervised");
                }
            }
            BridgeEvent::Broadcast(text) => self.chat.broadcast(&text, ChatCategory::Game),
            BridgeEvent::AdminBroadcast(text) => self.chat.broadcast(&text, ChatCategory::Admin),
            BridgeEvent::WorldRebooted => self.pipeline.on_world_rebooted(),
        }
    }
}
