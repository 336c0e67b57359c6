//! Zero-downtime staging pipeline.
//!
//! Builds into whichever slot Live does not reference, then repoints Live:
//!
//! ```text
//!  resolve Live ─▶ self-heal ─▶ prepare slot ─▶ copy source ─▶ PreCompile.sh
//!       ─▶ build tool (build-tool lease) ─▶ swap Live ─▶ PostCompile.sh
//! ```
//!
//! The swap runs with the engine frozen when it is online; the engine picks
//! the new build up at its next reboot (`PendingUpdate`).

pub mod build;
pub mod slots;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::collab::{link, ChatBroadcaster, ChatCategory, Repository, StaticFiles};
use crate::locks::LockManager;
use crate::recovery::with_recovery_async;
use crate::transport::{TopicCommand, TransportGateway};
use crate::types::{BuildId, Config, EngineConfig, Error, PipelineConfig, Result};
use crate::watchdog::{EngineStatus, Watchdog};

pub use build::OutputTail;
pub use slots::BuildSlot;

/// Hook run before the build tool; a failure aborts the build.
pub const PRE_BUILD_HOOK: &str = "PreCompile.sh";
/// Hook run after a successful swap.
pub const POST_BUILD_HOOK: &str = "PostCompile.sh";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// No Live pointer yet; the next build also creates the slots.
    Uninitialized,
    Initializing,
    Initialized,
    Building,
}

/// How a cancel request landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    NotRunning,
    Immediate,
    /// The source copy cannot be interrupted; cancellation follows it.
    DeferredUntilCopyCompletes,
}

impl fmt::Display for CancelOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CancelOutcome::NotRunning => "No build is running.",
            CancelOutcome::Immediate => "Build cancelled.",
            CancelOutcome::DeferredUntilCopyCompletes => {
                "Build will be cancelled once the source copy completes."
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BuildResult {
    Succeeded { pending_update: bool },
    Failed { reason: String },
    Cancelled,
}

/// Record of one finished build.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub id: BuildId,
    pub slot: Option<BuildSlot>,
    pub revision: Option<String>,
    pub result: BuildResult,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub output_tail: Vec<String>,
}

impl BuildReport {
    pub fn succeeded(&self) -> bool {
        matches!(self.result, BuildResult::Succeeded { .. })
    }
}

/// Point-in-time view of the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSnapshot {
    pub status: PipelineStatus,
    pub pending_update: bool,
    pub live_slot: Option<BuildSlot>,
    pub running_build: Option<BuildId>,
    pub last_report: Option<BuildReport>,
}

struct RunningBuild {
    id: BuildId,
    cancel: CancellationToken,
    task: Option<JoinHandle<BuildReport>>,
}

struct PipelineState {
    status: PipelineStatus,
    pending_update: bool,
    copying: bool,
    running: Option<RunningBuild>,
    last_report: Option<BuildReport>,
}

/// What a build learned on the way, kept even when it fails.
#[derive(Default)]
struct BuildProgress {
    slot: Option<BuildSlot>,
    revision: Option<String>,
    tail: OutputTail,
}

struct PipelineInner {
    config: PipelineConfig,
    engine: EngineConfig,
    game_dir: PathBuf,
    live_path: PathBuf,
    hooks_dir: PathBuf,
    watchdog: Watchdog,
    locks: LockManager,
    gateway: TransportGateway,
    repository: Arc<dyn Repository>,
    static_files: Arc<dyn StaticFiles>,
    chat: Arc<dyn ChatBroadcaster>,
    state: Mutex<PipelineState>,
    /// Id of the most recently finished build.
    finished: watch::Sender<Option<BuildId>>,
}

/// Two-slot blue/green deployer.
#[derive(Clone)]
pub struct StagingPipeline {
    inner: Arc<PipelineInner>,
}

impl fmt::Debug for StagingPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagingPipeline")
            .field("game_dir", &self.inner.game_dir)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Collaborators the pipeline drives.
#[derive(Clone)]
pub struct PipelineDeps {
    pub watchdog: Watchdog,
    pub locks: LockManager,
    pub gateway: TransportGateway,
    pub repository: Arc<dyn Repository>,
    pub static_files: Arc<dyn StaticFiles>,
    pub chat: Arc<dyn ChatBroadcaster>,
}

impl fmt::Debug for PipelineDeps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineDeps")
            .field("watchdog", &self.watchdog)
            .field("locks", &self.locks)
            .finish_non_exhaustive()
    }
}

impl StagingPipeline {
    pub fn new(config: &Config, deps: PipelineDeps) -> Self {
        let live_path = config.live_path();
        let status = if std::fs::symlink_metadata(&live_path).is_ok() {
            PipelineStatus::Initialized
        } else {
            PipelineStatus::Uninitialized
        };

        Self {
            inner: Arc::new(PipelineInner {
                config: config.pipeline.clone(),
                engine: config.engine.clone(),
                game_dir: config.game_dir(),
                live_path,
                hooks_dir: config.hooks_dir(),
                watchdog: deps.watchdog,
                locks: deps.locks,
                gateway: deps.gateway,
                repository: deps.repository,
                static_files: deps.static_files,
                chat: deps.chat,
                state: Mutex::new(PipelineState {
                    status,
                    pending_update: false,
                    copying: false,
                    running: None,
                    last_report: None,
                }),
                finished: watch::channel(None).0,
            }),
        }
    }

    pub fn status(&self) -> PipelineStatus {
        self.inner.lock().status
    }

    /// Live bits changed but the running engine has not reloaded them.
    pub fn pending_update(&self) -> bool {
        self.inner.lock().pending_update
    }

    pub fn last_report(&self) -> Option<BuildReport> {
        self.inner.lock().last_report.clone()
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        let live_slot = slots::live_target(&self.inner.live_path);
        let state = self.inner.lock();
        PipelineSnapshot {
            status: state.status,
            pending_update: state.pending_update,
            live_slot,
            running_build: state.running.as_ref().map(|r| r.id),
            last_report: state.last_report.clone(),
        }
    }

    /// The engine rebooted in-process and now runs the Live build.
    pub fn on_world_rebooted(&self) {
        let mut state = self.inner.lock();
        if state.pending_update {
            tracing::info!("engine rebooted onto the staged build");
        }
        state.pending_update = false;
    }

    /// Start a build in the background. `silent` suppresses the start and
    /// success broadcasts; failures are always announced.
    pub fn build(&self, silent: bool) -> Result<BuildId> {
        // ask the other components before taking our own lock
        let engine_status = self.inner.watchdog.status();
        let has_install = self
            .inner
            .locks
            .has_build_install(self.inner.config.build_with_staged);

        let mut state = self.inner.lock();
        if state.running.is_some() {
            return Err(Error::busy("a build is already running"));
        }
        if !has_install {
            return Err(Error::unavailable("no runnable runtime install"));
        }
        let initialize = state.status == PipelineStatus::Uninitialized;
        if initialize && engine_status != EngineStatus::Offline {
            return Err(Error::busy("the first build requires the engine to be offline"));
        }

        let id = BuildId::new();
        let cancel = CancellationToken::new();
        state.status = if initialize {
            PipelineStatus::Initializing
        } else {
            PipelineStatus::Building
        };

        let inner = self.inner.clone();
        let task = tokio::spawn(inner.run(id, silent, initialize, cancel.clone()));
        state.running = Some(RunningBuild {
            id,
            cancel,
            task: Some(task),
        });
        tracing::info!(build_id = %id, initialize, "build started");
        Ok(id)
    }

    /// Request cancellation of the running build.
    pub fn cancel(&self) -> CancelOutcome {
        let state = self.inner.lock();
        let Some(running) = &state.running else {
            return CancelOutcome::NotRunning;
        };
        running.cancel.cancel();
        let outcome = if state.copying {
            CancelOutcome::DeferredUntilCopyCompletes
        } else {
            CancelOutcome::Immediate
        };
        tracing::info!(build_id = %running.id, ?outcome, "build cancellation requested");
        outcome
    }

    /// Wait for the running build, or return the last report when idle.
    pub async fn wait(&self) -> Option<BuildReport> {
        let task = {
            let mut state = self.inner.lock();
            state.running.as_mut().and_then(|r| r.task.take())
        };
        match task {
            Some(task) => match task.await {
                Ok(report) => Some(report),
                Err(e) => {
                    tracing::error!(error = %e, "build task failed");
                    self.last_report()
                }
            },
            None => {
                // another waiter holds the task
                let mut finished = self.inner.finished.subscribe();
                loop {
                    if self.inner.lock().running.is_none() {
                        break;
                    }
                    if finished.changed().await.is_err() {
                        break;
                    }
                }
                self.last_report()
            }
        }
    }
}

impl PipelineInner {
    fn lock(&self) -> MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn announce(&self, text: &str) {
        self.chat.broadcast(text, ChatCategory::Status);
    }

    async fn run(
        self: Arc<Self>,
        id: BuildId,
        silent: bool,
        initialize: bool,
        cancel: CancellationToken,
    ) -> BuildReport {
        let started_at = Utc::now();
        if !silent {
            self.announce("Deployment started.");
        }

        let mut progress = BuildProgress::default();
        let outcome = with_recovery_async(
            self.execute(initialize, &cancel, &mut progress),
            "build",
        )
        .await;

        let result = match outcome {
            Ok(pending_update) => BuildResult::Succeeded { pending_update },
            Err(e) if e.is_cancelled() => BuildResult::Cancelled,
            Err(e) => BuildResult::Failed {
                reason: e.to_string(),
            },
        };

        match &result {
            BuildResult::Succeeded { pending_update } => {
                tracing::info!(
                    build_id = %id,
                    slot = ?progress.slot,
                    pending_update,
                    "build succeeded"
                );
                if !silent {
                    let text = if *pending_update {
                        "Deployment staged; it goes live at the next round.".to_string()
                    } else {
                        "Deployment complete.".to_string()
                    };
                    self.announce(&text);
                }
            }
            BuildResult::Cancelled => {
                tracing::info!(build_id = %id, "build cancelled");
                self.announce("Deployment cancelled.");
            }
            BuildResult::Failed { reason } => {
                tracing::error!(build_id = %id, %reason, "build failed");
                self.announce(&format!("Deployment failed: {}", reason));
            }
        }

        let report = BuildReport {
            id,
            slot: progress.slot,
            revision: progress.revision,
            result,
            started_at,
            finished_at: Utc::now(),
            output_tail: progress.tail.into_vec(),
        };

        let initialized = std::fs::symlink_metadata(&self.live_path).is_ok();
        let mut state = self.lock();
        state.status = if initialized {
            PipelineStatus::Initialized
        } else {
            PipelineStatus::Uninitialized
        };
        state.copying = false;
        state.running = None;
        state.last_report = Some(report.clone());
        drop(state);
        self.finished.send_replace(Some(report.id));
        report
    }

    /// The build proper. Returns whether the swap happened while online.
    async fn execute(
        &self,
        initialize: bool,
        cancel: &CancellationToken,
        progress: &mut BuildProgress,
    ) -> Result<bool> {
        if initialize {
            self.initialize_slots().await?;
        }
        checkpoint(cancel)?;

        let target = self.select_target()?;
        progress.slot = Some(target);
        let slot_dir = target.dir(&self.game_dir);

        self.prepare_slot(&slot_dir).await?;
        checkpoint(cancel)?;

        let revision = self.copy_source(&slot_dir).await?;
        progress.revision = Some(revision);
        checkpoint(cancel)?;

        build::run_hook(
            &self.hooks_dir.join(PRE_BUILD_HOOK),
            &slot_dir,
            cancel,
            &mut progress.tail,
        )
        .await?;
        checkpoint(cancel)?;

        {
            let lease = self.locks.acquire_build_tool(self.config.build_with_staged)?;
            let project = self.engine.project_file_name();
            build::run_tool(
                "build tool",
                lease.path(),
                &[project.as_str()],
                &slot_dir,
                cancel,
                &mut progress.tail,
            )
            .await?;
        }

        let artifact = slot_dir.join(self.engine.artifact_file_name());
        if !artifact.is_file() {
            return Err(Error::internal(format!(
                "build tool did not produce {}",
                artifact.display()
            )));
        }
        checkpoint(cancel)?;

        let swapped_online = self.swap_live(target)?;

        if let Err(e) = build::run_hook(
            &self.hooks_dir.join(POST_BUILD_HOOK),
            &slot_dir,
            &CancellationToken::new(),
            &mut progress.tail,
        )
        .await
        {
            tracing::warn!(error = %e, "post-build hook failed");
            self.chat.broadcast(
                &format!("{} failed: {}", POST_BUILD_HOOK, e),
                ChatCategory::Admin,
            );
        }

        if swapped_online {
            let command = TopicCommand::DeploymentStaged {
                revision: progress.revision.clone().unwrap_or_default(),
            };
            if let Err(e) = self.gateway.send_topic(command).await {
                tracing::warn!(error = %e, "could not notify engine of staged deployment");
            }
        }
        Ok(swapped_online)
    }

    /// Create both slots and point Live at slot A.
    async fn initialize_slots(&self) -> Result<()> {
        tracing::info!(game_dir = %self.game_dir.display(), "initializing build slots");
        for slot in BuildSlot::ALL {
            let dir = slot.dir(&self.game_dir);
            tokio::fs::create_dir_all(&dir).await?;
            self.repository
                .copy_restricted_paths(&dir, &self.config.shared_paths)
                .await?;
        }
        slots::link_live(&self.game_dir, &self.live_path, BuildSlot::A)?;
        Ok(())
    }

    /// Pick the slot Live does not reference, repairing a stale Live first.
    fn select_target(&self) -> Result<BuildSlot> {
        let live = slots::resolve_live(&self.game_dir, &self.live_path)?;
        let target = live.map_or(BuildSlot::A, BuildSlot::inverse);

        let lock_file = target
            .dir(&self.game_dir)
            .join(self.engine.resource_lock_file_name());
        if !slots::resource_lock_held(&lock_file) {
            return Ok(target);
        }

        tracing::warn!(
            %target,
            lock = %lock_file.display(),
            "run tool holds the target slot; repairing stale live pointer"
        );
        slots::link_live(&self.game_dir, &self.live_path, target)?;
        self.chat.broadcast(
            &format!("Live pointer was stale; repointed to {}.", target),
            ChatCategory::Admin,
        );
        Ok(target.inverse())
    }

    /// Wipe the slot except shared paths, then recreate and relink.
    async fn prepare_slot(&self, slot_dir: &std::path::Path) -> Result<()> {
        let dir = slot_dir.to_path_buf();
        let keep = self.config.shared_paths.clone();
        let required = self.config.required_directories.clone();
        retry_held_once("slot wipe", || {
            let (dir, keep, required) = (dir.clone(), keep.clone(), required.clone());
            async move {
                tokio::task::spawn_blocking(move || -> std::io::Result<()> {
                    slots::wipe_except(&dir, &keep)?;
                    for sub in &required {
                        std::fs::create_dir_all(dir.join(sub))?;
                    }
                    Ok(())
                })
                .await
                .map_err(|e| Error::internal(format!("slot preparation task failed: {e}")))??;
                Ok(())
            }
        })
        .await?;

        self.static_files.link_into(slot_dir).await?;

        if let Some(library) = &self.config.bridge_library {
            let name = library
                .file_name()
                .ok_or_else(|| Error::validation("pipeline.bridge_library has no file name"))?;
            let dest = slot_dir.join(name);
            if std::fs::symlink_metadata(&dest).is_ok() {
                std::fs::remove_file(&dest)?;
            }
            link(library, &dest)?;
        }
        Ok(())
    }

    /// Copy the source tree; the copy itself is not interruptible.
    async fn copy_source(&self, slot_dir: &std::path::Path) -> Result<String> {
        let revision = self.repository.current_revision().await?;
        tracing::info!(%revision, slot = %slot_dir.display(), "copying source");

        self.lock().copying = true;
        let copied = retry_held_once("source copy", || {
            self.repository
                .copy_tree(slot_dir, &self.config.shared_paths)
        })
        .await;
        self.lock().copying = false;
        copied?;

        if !self.repository.repository_metadata_matches(&revision).await {
            return Err(Error::validation("repository changed during copy"));
        }
        if let Err(e) = self.repository.create_backup_tag().await {
            tracing::warn!(error = %e, "backup tag failed");
        }
        Ok(revision)
    }

    /// Repoint Live at `target`. Returns whether the engine was online.
    fn swap_live(&self, target: BuildSlot) -> Result<bool> {
        let swap = || slots::link_live(&self.game_dir, &self.live_path, target);

        if self.watchdog.is_online() {
            // flagged before the engine resumes so its next reboot clears it
            let staged = || {
                swap()?;
                self.lock().pending_update = true;
                Ok::<_, Error>(())
            };
            match self.watchdog.run_suspended(staged) {
                Ok(linked) => {
                    linked?;
                    return Ok(true);
                }
                // stopped between the check and the suspend
                Err(Error::Unavailable(_)) => {}
                Err(e) => return Err(e),
            }
        }
        swap()?;
        Ok(false)
    }
}

/// Pause before the single retry of a slot operation that hit a held file.
const HELD_FILE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Whether an I/O error means another process has the file open.
fn held_by_another_process(error: &Error) -> bool {
    let Error::Io(e) = error else {
        return false;
    };
    if e.kind() == std::io::ErrorKind::PermissionDenied {
        return true;
    }
    // ERROR_SHARING_VIOLATION, ERROR_LOCK_VIOLATION
    cfg!(windows) && matches!(e.raw_os_error(), Some(32 | 33))
}

/// Run `op`, retrying once after a short delay if a file was held open.
async fn retry_held_once<T, F, Fut>(what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match op().await {
        Err(e) if held_by_another_process(&e) => {
            tracing::warn!(error = %e, operation = what, "file held open; retrying once");
            tokio::time::sleep(HELD_FILE_RETRY_DELAY).await;
            op().await
        }
        other => other,
    }
}

fn checkpoint(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::cancelled("build cancelled"))
    } else {
        Ok(())
    }
}
