//! Process watchdog.
//!
//! Owns the engine's OS process and supervises it from a background task:
//!
//! ```text
//!  Offline ──start──▶ Online ──exit──▶ HardRebooting ──relaunch──▶ Online
//!     ▲                 │                   │
//!     └── stop/detach ──┴── Pinged exit ────┘ (cancelled during backoff)
//! ```
//!
//! Exits within `bad_start_threshold` of a launch are bad starts and back off
//! exponentially; later exits relaunch immediately.

pub mod backoff;
pub mod process;
pub mod suspend;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::collab::{ChatBroadcaster, ChatCategory};
use crate::locks::{ExecutableLease, LockManager};
use crate::recovery::with_recovery_async;
use crate::transport::{TopicCommand, TransportGateway};
use crate::types::{Config, EngineConfig, Error, Result, SessionSecret, WatchdogConfig};

pub use backoff::backoff_delay;
pub use process::{
    AttachedHandle, EngineExit, EngineHandle, EngineLauncher, LaunchSpec, OsLauncher,
};
pub use suspend::{platform_suspender, CooperativeSuspender, ProcessSuspender};
#[cfg(unix)]
pub use suspend::SignalSuspender;

/// Engine process status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    Offline,
    /// Between an exit and a successful relaunch, backoff included.
    HardRebooting,
    Online,
}

/// Graceful-stop negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPhase {
    #[default]
    None,
    /// Reserved by the protocol; no code path assigns it.
    Requested,
    /// A stop command reached the engine; its next exit is final.
    Pinged,
}

/// What cancelling the supervising loop does to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopMode {
    Kill,
    Detach,
}

/// An engine left running by [`Watchdog::detach`]. Both fields are needed
/// to take it over again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachedEngine {
    pub pid: u32,
    pub secret: SessionSecret,
}

/// Point-in-time view of the watchdog.
#[derive(Debug, Clone, Serialize)]
pub struct WatchdogSnapshot {
    pub status: EngineStatus,
    pub shutdown_phase: ShutdownPhase,
    pub retries: u32,
    pub pid: Option<u32>,
    pub launched_at: Option<DateTime<Utc>>,
    pub restart_requested: bool,
    pub detached_pid: Option<u32>,
}

struct Supervisor {
    generation: u64,
    cancel: CancellationToken,
    /// Hard restart requests for this loop only.
    kill: Arc<Notify>,
    task: JoinHandle<Option<DetachedEngine>>,
}

struct WatchdogState {
    status: EngineStatus,
    shutdown_phase: ShutdownPhase,
    retries: u32,
    pid: Option<u32>,
    launched_at: Option<DateTime<Utc>>,
    restart_requested: bool,
    detached_pid: Option<u32>,
    starting: bool,
    stop_mode: StopMode,
    generation: u64,
    supervisor: Option<Supervisor>,
}

/// A launched engine and the lease keeping its run tool in place.
struct Running {
    handle: Box<dyn EngineHandle>,
    lease: ExecutableLease,
}

enum LoopEvent {
    Exited(Result<EngineExit>),
    Cancelled,
    KillRequested,
}

struct WatchdogInner {
    config: WatchdogConfig,
    engine: EngineConfig,
    live_path: std::path::PathBuf,
    locks: LockManager,
    gateway: TransportGateway,
    chat: Arc<dyn ChatBroadcaster>,
    launcher: Arc<dyn EngineLauncher>,
    suspender: Arc<dyn ProcessSuspender>,
    state: Mutex<WatchdogState>,
}

/// Supervises the engine process.
#[derive(Clone)]
pub struct Watchdog {
    inner: Arc<WatchdogInner>,
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog")
            .field("snapshot", &self.snapshot())
            .finish_non_exhaustive()
    }
}

/// Clears the `starting` flag however `start` ends.
struct StartingGuard<'a>(&'a WatchdogInner);

impl Drop for StartingGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().starting = false;
    }
}

impl Watchdog {
    pub fn new(
        config: &Config,
        locks: LockManager,
        gateway: TransportGateway,
        chat: Arc<dyn ChatBroadcaster>,
        launcher: Arc<dyn EngineLauncher>,
        suspender: Arc<dyn ProcessSuspender>,
    ) -> Self {
        Self {
            inner: Arc::new(WatchdogInner {
                config: config.watchdog.clone(),
                engine: config.engine.clone(),
                live_path: config.live_path(),
                locks,
                gateway,
                chat,
                launcher,
                suspender,
                state: Mutex::new(WatchdogState {
                    status: EngineStatus::Offline,
                    shutdown_phase: ShutdownPhase::None,
                    retries: 0,
                    pid: None,
                    launched_at: None,
                    restart_requested: false,
                    detached_pid: None,
                    starting: false,
                    stop_mode: StopMode::Kill,
                    generation: 0,
                    supervisor: None,
                }),
            }),
        }
    }

    pub fn status(&self) -> EngineStatus {
        self.inner.lock().status
    }

    pub fn is_online(&self) -> bool {
        self.status() == EngineStatus::Online
    }

    pub fn snapshot(&self) -> WatchdogSnapshot {
        let state = self.inner.lock();
        WatchdogSnapshot {
            status: state.status,
            shutdown_phase: state.shutdown_phase,
            retries: state.retries,
            pid: state.pid,
            launched_at: state.launched_at,
            restart_requested: state.restart_requested,
            detached_pid: state.detached_pid,
        }
    }

    /// Launch the engine, wait for readiness and start supervising it.
    pub async fn start(&self) -> Result<()> {
        let _starting = self.claim_start()?;

        if !self.inner.locks.has_runnable_install() {
            return Err(Error::unavailable("no runnable runtime install"));
        }
        let running = self.inner.launch().await?;

        self.spawn_supervisor(running);
        self.inner.chat.broadcast("Engine is online.", ChatCategory::Status);
        Ok(())
    }

    /// Supervise an engine a previous warden detached from.
    pub async fn reattach(&self, pid: u32, secret: SessionSecret) -> Result<()> {
        let _starting = self.claim_start()?;

        let lease = self.inner.locks.acquire_run_tool()?;
        let handle = self.inner.launcher.attach(pid)?;
        // the engine reports its API version again after its next reboot
        self.inner.gateway.adopt_session(secret);
        {
            let mut state = self.inner.lock();
            state.pid = Some(pid);
            state.launched_at = Some(Utc::now());
            state.detached_pid = None;
        }

        self.spawn_supervisor(Running { handle, lease });
        tracing::info!(pid, "supervising reattached engine");
        Ok(())
    }

    fn claim_start(&self) -> Result<StartingGuard<'_>> {
        let mut state = self.inner.lock();
        if state.status != EngineStatus::Offline || state.starting || state.supervisor.is_some() {
            return Err(Error::busy("engine is already running"));
        }
        state.starting = true;
        Ok(StartingGuard(&self.inner))
    }

    fn spawn_supervisor(&self, running: Running) {
        let cancel = CancellationToken::new();
        let kill = Arc::new(Notify::new());
        let mut state = self.inner.lock();
        state.generation += 1;
        state.status = EngineStatus::Online;
        state.retries = 0;
        state.stop_mode = StopMode::Kill;

        let generation = state.generation;
        let inner = self.inner.clone();
        let token = cancel.clone();
        let kill_requests = kill.clone();
        let task = tokio::spawn(async move {
            let supervised = inner
                .clone()
                .supervise(running, token, kill_requests, generation);
            let outcome = with_recovery_async(supervised, "watchdog").await;
            match outcome {
                Ok(pid) => pid,
                Err(e) => {
                    tracing::error!(error = %e, "watchdog loop failed; engine marked offline");
                    inner.finish(generation, EngineStatus::Offline);
                    None
                }
            }
        });
        state.supervisor = Some(Supervisor {
            generation,
            cancel,
            kill,
            task,
        });
    }

    /// Kill the engine and stop supervising it.
    pub async fn stop(&self) -> Result<()> {
        self.cancel_loop(StopMode::Kill).await.map(|_| ())
    }

    /// Stop supervising but leave the engine running; returns what a later
    /// [`reattach`](Self::reattach) needs.
    pub async fn detach(&self) -> Result<Option<DetachedEngine>> {
        self.cancel_loop(StopMode::Detach).await
    }

    async fn cancel_loop(&self, mode: StopMode) -> Result<Option<DetachedEngine>> {
        let supervisor = {
            let mut state = self.inner.lock();
            state.stop_mode = mode;
            state.supervisor.take()
        }
        .ok_or_else(|| Error::unavailable("engine is not running"))?;

        supervisor.cancel.cancel();
        match supervisor.task.await {
            Ok(pid) => Ok(pid),
            Err(e) => Err(Error::internal(format!("watchdog task failed: {}", e))),
        }
    }

    /// Ask the engine to restart at its next reboot point.
    pub async fn request_restart(&self) -> Result<()> {
        self.require_online()?;
        let reply = self.inner.gateway.send_topic(TopicCommand::GracefulRestart).await?;
        self.inner.lock().restart_requested = true;
        tracing::info!(%reply, "graceful restart requested");
        Ok(())
    }

    /// Ask the engine to shut down at its next reboot point. Its next exit
    /// will not be restarted.
    pub async fn request_stop(&self) -> Result<()> {
        self.require_online()?;
        let reply = self.inner.gateway.send_topic(TopicCommand::GracefulShutdown).await?;
        self.inner.lock().shutdown_phase = ShutdownPhase::Pinged;
        tracing::info!(%reply, "graceful shutdown requested");
        Ok(())
    }

    /// Kill the engine and relaunch it immediately without counting a bad
    /// start.
    pub fn hard_restart(&self) -> Result<()> {
        let kill = {
            let mut state = self.inner.lock();
            let kill = match (&state.supervisor, state.status) {
                (Some(supervisor), EngineStatus::Online) => supervisor.kill.clone(),
                _ => return Err(Error::unavailable("engine is not running")),
            };
            state.status = EngineStatus::HardRebooting;
            kill
        };
        kill.notify_one();
        Ok(())
    }

    /// Run `action` while the engine process is frozen. The engine is resumed
    /// even if `action` panics.
    pub fn run_suspended<T>(&self, action: impl FnOnce() -> T) -> Result<T> {
        let pid = {
            let state = self.inner.lock();
            match (state.status, state.pid) {
                (EngineStatus::Online, Some(pid)) => pid,
                _ => return Err(Error::unavailable("engine is not running")),
            }
        };

        self.inner.suspender.suspend(pid)?;
        let _resume = suspend::ResumeGuard {
            suspender: self.inner.suspender.clone(),
            pid,
        };
        Ok(action())
    }

    fn require_online(&self) -> Result<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(Error::unavailable("engine is not running"))
        }
    }
}

impl WatchdogInner {
    fn lock(&self) -> MutexGuard<'_, WatchdogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, status: EngineStatus) {
        self.lock().status = status;
    }

    /// Acquire a run-tool lease, launch and wait for readiness.
    async fn launch(&self) -> Result<Running> {
        let lease = self.locks.acquire_run_tool()?;
        let secret = self.gateway.begin_session();
        let spec = LaunchSpec {
            executable: lease.path().to_path_buf(),
            artifact: self.live_path.join(self.engine.artifact_file_name()),
            working_dir: self.live_path.clone(),
            topic_port: self.gateway.config().topic_port,
            bridge_port: self.gateway.config().bridge_port,
            secret,
            extra_args: self.engine.extra_args.clone(),
        };

        let mut handle = self.launcher.launch(&spec).await?;
        if let Err(e) = handle.wait_ready(self.config.startup_timeout).await {
            tracing::error!(error = %e, "engine failed to become ready");
            if let Err(kill_err) = handle.kill().await {
                tracing::warn!(error = %kill_err, "failed to kill unready engine");
            }
            self.gateway.reset_session();
            return Err(e);
        }

        {
            let mut state = self.lock();
            state.pid = handle.pid();
            state.launched_at = Some(Utc::now());
            state.shutdown_phase = ShutdownPhase::None;
            state.restart_requested = false;
            state.detached_pid = None;
        }
        tracing::info!(pid = ?handle.pid(), version = %lease.version(), "engine ready");
        Ok(Running { handle, lease })
    }

    /// Release everything tied to a process that is gone.
    fn retire(&self, running: Running) {
        drop(running);
        self.gateway.reset_session();
        self.lock().pid = None;
    }

    /// Final state once the loop ends on its own.
    fn finish(&self, generation: u64, status: EngineStatus) {
        let mut state = self.lock();
        state.status = status;
        state.pid = None;
        state.shutdown_phase = ShutdownPhase::None;
        state.restart_requested = false;
        if state.supervisor.as_ref().is_some_and(|s| s.generation == generation) {
            state.supervisor = None;
        }
    }

    /// Count a bad start and return the delay before the next attempt.
    fn count_bad_start(&self) -> (u32, Duration) {
        let mut state = self.lock();
        state.retries = state.retries.saturating_add(1);
        (state.retries, backoff_delay(state.retries, self.config.max_backoff))
    }

    async fn supervise(
        self: Arc<Self>,
        mut running: Running,
        cancel: CancellationToken,
        kill: Arc<Notify>,
        generation: u64,
    ) -> Result<Option<DetachedEngine>> {
        let mut started = Instant::now();
        loop {
            let event = tokio::select! {
                exit = running.handle.wait() => LoopEvent::Exited(exit),
                _ = cancel.cancelled() => LoopEvent::Cancelled,
                _ = kill.notified() => LoopEvent::KillRequested,
            };

            match event {
                LoopEvent::Cancelled => {
                    return Ok(self.release_on_cancel(running, generation).await);
                }
                LoopEvent::KillRequested
                    if self.lock().status != EngineStatus::HardRebooting =>
                {
                    // the request raced an exit that already relaunched
                    tracing::debug!(pid = ?running.handle.pid(), "ignoring stale hard restart");
                    continue;
                }
                LoopEvent::KillRequested => {
                    tracing::warn!(pid = ?running.handle.pid(), "engine requested a hard restart");
                    if let Err(e) = running.handle.kill().await {
                        tracing::warn!(error = %e, "failed to kill engine");
                    }
                    self.retire(running);
                    {
                        let mut state = self.lock();
                        state.status = EngineStatus::HardRebooting;
                        state.retries = 0;
                    }
                    self.chat.broadcast(
                        "Engine hard restart requested; relaunching.",
                        ChatCategory::Status,
                    );
                }
                LoopEvent::Exited(exit) => {
                    let exit = exit.unwrap_or_else(|e| {
                        tracing::warn!(error = %e, "lost track of engine process");
                        EngineExit::default()
                    });
                    let uptime = started.elapsed();
                    self.retire(running);

                    let (phase, planned) = {
                        let mut state = self.lock();
                        (state.shutdown_phase, std::mem::take(&mut state.restart_requested))
                    };
                    if phase == ShutdownPhase::Pinged {
                        tracing::info!(%exit, "engine shut down as requested");
                        self.finish(generation, EngineStatus::Offline);
                        self.lock().retries = 0;
                        self.chat.broadcast("Engine has shut down.", ChatCategory::Status);
                        return Ok(None);
                    }

                    self.set_status(EngineStatus::HardRebooting);
                    if planned {
                        tracing::info!(%exit, "engine exited for a requested restart");
                        self.lock().retries = 0;
                    } else if uptime < self.config.bad_start_threshold {
                        let (retries, delay) = self.count_bad_start();
                        tracing::error!(
                            %exit,
                            uptime_ms = uptime.as_millis() as u64,
                            retries,
                            delay_s = delay.as_secs(),
                            "engine crashed shortly after launch"
                        );
                        self.chat.broadcast(
                            &format!(
                                "Engine crashed right after starting ({}); retry {} in {}s.",
                                exit,
                                retries,
                                delay.as_secs()
                            ),
                            ChatCategory::Status,
                        );
                        if !sleep_or_cancel(delay, &cancel).await {
                            self.finish(generation, EngineStatus::Offline);
                            return Ok(None);
                        }
                    } else {
                        tracing::error!(
                            %exit,
                            uptime_s = uptime.as_secs(),
                            "engine crashed; relaunching"
                        );
                        self.lock().retries = 0;
                        self.chat.broadcast(
                            &format!("Engine crashed ({}); restarting.", exit),
                            ChatCategory::Status,
                        );
                    }
                }
            }

            running = match self.relaunch(&cancel, generation).await {
                Some(running) => running,
                None => return Ok(None),
            };
            started = Instant::now();
        }
    }

    /// Keep trying to launch until it works or the loop is cancelled.
    async fn relaunch(&self, cancel: &CancellationToken, generation: u64) -> Option<Running> {
        loop {
            let attempt = tokio::select! {
                launched = self.launch() => Some(launched),
                _ = cancel.cancelled() => None,
            };

            match attempt {
                None => {
                    self.finish(generation, EngineStatus::Offline);
                    return None;
                }
                Some(Ok(running)) => {
                    self.set_status(EngineStatus::Online);
                    self.chat.broadcast("Engine is back online.", ChatCategory::Status);
                    return Some(running);
                }
                Some(Err(e)) => {
                    let (retries, delay) = self.count_bad_start();
                    tracing::error!(
                        error = %e,
                        retries,
                        delay_s = delay.as_secs(),
                        "engine relaunch failed"
                    );
                    self.chat.broadcast(
                        &format!(
                            "Engine relaunch failed ({}); retry {} in {}s.",
                            e,
                            retries,
                            delay.as_secs()
                        ),
                        ChatCategory::Status,
                    );
                    if !sleep_or_cancel(delay, cancel).await {
                        self.finish(generation, EngineStatus::Offline);
                        return None;
                    }
                }
            }
        }
    }

    async fn release_on_cancel(
        &self,
        running: Running,
        generation: u64,
    ) -> Option<DetachedEngine> {
        let mode = self.lock().stop_mode;
        let Running { mut handle, lease } = running;

        let detached = match mode {
            StopMode::Kill => {
                if let Err(e) = handle.kill().await {
                    tracing::warn!(error = %e, "failed to kill engine");
                }
                None
            }
            StopMode::Detach => handle.detach(),
        };
        drop(lease);
        self.gateway.reset_session();
        self.finish(generation, EngineStatus::Offline);
        {
            let mut state = self.lock();
            state.retries = 0;
            state.detached_pid = detached;
        }

        match detached {
            Some(pid) => {
                tracing::info!(pid, "detached from engine");
                self.chat.broadcast("Warden detached; engine left running.", ChatCategory::Admin);
                Some(DetachedEngine {
                    pid,
                    secret: self.gateway.session_secret(),
                })
            }
            None => {
                tracing::info!("engine stopped");
                self.chat.broadcast("Engine stopped.", ChatCategory::Status);
                None
            }
        }
    }
}

/// Sleep for `delay`; `false` when cancelled first.
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel.cancelled() => false,
    }
}
