//! Executable lock manager.
//!
//! Owns the active and staged runtime installs and hands out
//! reference-counted leases on the two executables inside them. A staged
//! install replaces the active one only while nobody holds a lease.
//!
//! ```text
//! Idle ──begin_install──▶ Downloading ──▶ Extracting ──▶ Staged
//!  ▲                                                       │
//!  └────────────── Promoting ◀── promote (no leases) ◀─────┘
//! ```

pub mod install;

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::collab::{ChatBroadcaster, ChatCategory};
use crate::types::{Config, EngineConfig, Error, Result};

pub use install::{
    source_from_config, HttpInstallSource, InstallSource, LocalArchiveSource, UnconfiguredSource,
};

/// Which executable a lease covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutableKind {
    BuildTool,
    RunTool,
}

/// State of the runtime version manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallState {
    Idle,
    Downloading,
    Extracting,
    Staged,
    Promoting,
}

impl InstallState {
    /// Leases cannot be handed out in these states.
    pub fn is_transitioning(self) -> bool {
        matches!(
            self,
            InstallState::Downloading | InstallState::Extracting | InstallState::Promoting
        )
    }
}

/// Point-in-time view of the lock manager.
#[derive(Debug, Clone, Serialize)]
pub struct InstallSnapshot {
    pub state: InstallState,
    pub active_version: Option<String>,
    pub staged_version: Option<String>,
    pub build_tool_leases: u32,
    pub run_tool_leases: u32,
}

#[derive(Debug)]
struct LockState {
    install: InstallState,
    build_tool_refs: u32,
    run_tool_refs: u32,
    /// Leases (of either kind) resolved into the staging directory.
    staged_refs: u32,
    active_version: Option<String>,
    staged_version: Option<String>,
}

impl LockState {
    fn refs_mut(&mut self, kind: ExecutableKind) -> &mut u32 {
        match kind {
            ExecutableKind::BuildTool => &mut self.build_tool_refs,
            ExecutableKind::RunTool => &mut self.run_tool_refs,
        }
    }

    fn can_promote(&self) -> bool {
        self.install == InstallState::Staged && self.build_tool_refs == 0 && self.run_tool_refs == 0
    }
}

struct LockInner {
    engine: EngineConfig,
    version_marker: String,
    active_dir: PathBuf,
    staging_dir: PathBuf,
    source: Arc<dyn InstallSource>,
    chat: Arc<dyn ChatBroadcaster>,
    state: Mutex<LockState>,
}

/// Reference-counted gate over the runtime executables.
#[derive(Clone)]
pub struct LockManager {
    inner: Arc<LockInner>,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("active_dir", &self.inner.active_dir)
            .field("staging_dir", &self.inner.staging_dir)
            .field("state", &*self.lock())
            .finish_non_exhaustive()
    }
}

impl LockManager {
    /// Open the install directories described by `config`, recovering the
    /// active and staged versions from their markers.
    pub fn open(
        config: &Config,
        source: Arc<dyn InstallSource>,
        chat: Arc<dyn ChatBroadcaster>,
    ) -> Result<Self> {
        let active_dir = config.runtime_active_dir();
        let staging_dir = config.runtime_staging_dir();
        if let Some(parent) = active_dir.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let marker = config.install.version_marker.clone();
        let active_version = install::read_marker(&active_dir, &marker);
        let staged_version = install::read_marker(&staging_dir, &marker);
        let install = if staged_version.is_some() {
            InstallState::Staged
        } else {
            InstallState::Idle
        };
        tracing::info!(
            active = ?active_version,
            staged = ?staged_version,
            "runtime installs opened"
        );

        Ok(Self {
            inner: Arc::new(LockInner {
                engine: config.engine.clone(),
                version_marker: marker,
                active_dir,
                staging_dir,
                source,
                chat,
                state: Mutex::new(LockState {
                    install,
                    build_tool_refs: 0,
                    run_tool_refs: 0,
                    staged_refs: 0,
                    active_version,
                    staged_version,
                }),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, LockState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> InstallState {
        self.lock().install
    }

    /// `(build tool, run tool)` outstanding lease counts.
    pub fn lease_counts(&self) -> (u32, u32) {
        let state = self.lock();
        (state.build_tool_refs, state.run_tool_refs)
    }

    pub fn snapshot(&self) -> InstallSnapshot {
        let state = self.lock();
        InstallSnapshot {
            state: state.install,
            active_version: state.active_version.clone(),
            staged_version: state.staged_version.clone(),
            build_tool_leases: state.build_tool_refs,
            run_tool_leases: state.run_tool_refs,
        }
    }

    /// Whether an install exists that the run tool can be leased from.
    pub fn has_runnable_install(&self) -> bool {
        self.lock().active_version.is_some()
    }

    /// Whether the build tool can be leased, counting a staged install when
    /// `prefer_staged` is set.
    pub fn has_build_install(&self, prefer_staged: bool) -> bool {
        let state = self.lock();
        state.active_version.is_some()
            || (prefer_staged
                && state.install == InstallState::Staged
                && state.staged_version.is_some())
    }

    pub fn acquire_build_tool(&self, prefer_staged: bool) -> Result<ExecutableLease> {
        self.acquire(ExecutableKind::BuildTool, prefer_staged)
    }

    pub fn acquire_run_tool(&self) -> Result<ExecutableLease> {
        self.acquire(ExecutableKind::RunTool, false)
    }

    fn acquire(&self, kind: ExecutableKind, prefer_staged: bool) -> Result<ExecutableLease> {
        let relative = match kind {
            ExecutableKind::BuildTool => &self.inner.engine.build_tool,
            ExecutableKind::RunTool => &self.inner.engine.run_tool,
        };

        let mut state = self.lock();
        if state.install.is_transitioning() {
            return Err(Error::busy(format!(
                "runtime install is {:?}; {:?} unavailable",
                state.install, kind
            )));
        }

        let (dir, version, staged) = match (&state.staged_version, &state.active_version) {
            (Some(staged), _) if prefer_staged && state.install == InstallState::Staged => {
                (&self.inner.staging_dir, staged.clone(), true)
            }
            (_, Some(active)) => (&self.inner.active_dir, active.clone(), false),
            _ => return Err(Error::unavailable("no runtime version is installed")),
        };

        let path = dir.join(relative);
        if !path.is_file() {
            return Err(Error::unavailable(format!(
                "{:?} missing from runtime {}: {}",
                kind,
                version,
                path.display()
            )));
        }

        *state.refs_mut(kind) += 1;
        if staged {
            state.staged_refs += 1;
        }
        tracing::debug!(
            ?kind,
            %version,
            staged,
            build_tool = state.build_tool_refs,
            run_tool = state.run_tool_refs,
            "lease acquired"
        );
        drop(state);

        Ok(ExecutableLease {
            manager: self.clone(),
            kind,
            staged,
            path,
            version,
        })
    }

    /// Drop one reference. Releasing a lease that was never acquired is a
    /// programming error and aborts.
    fn release(&self, kind: ExecutableKind, staged: bool) {
        let should_promote = {
            let mut state = self.lock();
            let refs = state.refs_mut(kind);
            assert!(*refs > 0, "released a {:?} lease that was never acquired", kind);
            *refs -= 1;
            if staged {
                assert!(state.staged_refs > 0, "released an unheld staged lease");
                state.staged_refs -= 1;
            }
            tracing::debug!(
                ?kind,
                build_tool = state.build_tool_refs,
                run_tool = state.run_tool_refs,
                "lease released"
            );
            state.can_promote()
        };

        if should_promote {
            self.spawn_promotion();
        }
    }

    /// Run `promote` as its own unit of work so the releasing caller never
    /// waits on (or deadlocks against) filesystem work.
    fn spawn_promotion(&self) {
        let manager = self.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || manager.promote());
            }
            Err(_) => {
                std::thread::spawn(move || manager.promote());
            }
        }
    }

    /// Swap the staged install over the active one. Only succeeds while
    /// staged and no lease is outstanding.
    pub fn promote(&self) -> bool {
        let version = {
            let mut state = self.lock();
            if !state.can_promote() {
                tracing::debug!(
                    state = ?state.install,
                    build_tool = state.build_tool_refs,
                    run_tool = state.run_tool_refs,
                    "promotion deferred"
                );
                return false;
            }
            state.install = InstallState::Promoting;
            state.staged_version.clone()
        };

        let result = replace_dir(&self.inner.staging_dir, &self.inner.active_dir);

        let mut state = self.lock();
        match result {
            Ok(()) => {
                state.install = InstallState::Idle;
                state.active_version = version.clone();
                state.staged_version = None;
                drop(state);
                let version = version.unwrap_or_default();
                tracing::info!(%version, "runtime promoted");
                self.inner.chat.broadcast(
                    &format!("Runtime {} is now active.", version),
                    ChatCategory::Status,
                );
                true
            }
            Err(e) => {
                state.install = InstallState::Staged;
                drop(state);
                tracing::error!(error = %e, "runtime promotion failed; staged install kept");
                false
            }
        }
    }

    /// Download and stage `version`, then try to promote it.
    pub async fn begin_install(&self, version: &str) -> Result<()> {
        {
            let mut state = self.lock();
            if state.install.is_transitioning() {
                return Err(Error::busy(format!(
                    "runtime install already in progress ({:?})",
                    state.install
                )));
            }
            if state.staged_refs > 0 {
                return Err(Error::busy(format!(
                    "staged runtime {} is in use by {} lease(s)",
                    state.staged_version.as_deref().unwrap_or("?"),
                    state.staged_refs
                )));
            }
            if state.active_version.as_deref() == Some(version)
                && state.install != InstallState::Staged
            {
                tracing::info!(%version, "runtime already active");
                return Ok(());
            }
            state.install = InstallState::Downloading;
        }

        tracing::info!(%version, "runtime install started");
        match self.stage(version).await {
            Ok(()) => {
                {
                    let mut state = self.lock();
                    state.install = InstallState::Staged;
                    state.staged_version = Some(version.to_string());
                }
                self.inner.chat.broadcast(
                    &format!("Runtime {} staged; it will activate once idle.", version),
                    ChatCategory::Status,
                );
                self.promote();
                Ok(())
            }
            Err(e) => {
                let staged =
                    install::read_marker(&self.inner.staging_dir, &self.inner.version_marker);
                {
                    let mut state = self.lock();
                    state.install = if staged.is_some() {
                        InstallState::Staged
                    } else {
                        InstallState::Idle
                    };
                    state.staged_version = staged;
                }
                tracing::error!(%version, error = %e, "runtime install failed");
                self.inner.chat.broadcast(
                    &format!("Runtime {} install failed: {}", version, e),
                    ChatCategory::Status,
                );
                Err(e)
            }
        }
    }

    async fn stage(&self, version: &str) -> Result<()> {
        let archive = self.inner.source.fetch(version).await?;

        self.lock().install = InstallState::Extracting;
        let dir = self.inner.staging_dir.clone();
        let marker = self.inner.version_marker.clone();
        let version = version.to_string();
        tokio::task::spawn_blocking(move || install::extract_into(archive, &dir, &marker, &version))
            .await
            .map_err(|e| Error::internal(format!("extraction task failed: {e}")))?
    }
}

/// Delete `dst`, then move `src` into its place.
fn replace_dir(src: &Path, dst: &Path) -> std::io::Result<()> {
    if dst.exists() {
        std::fs::remove_dir_all(dst)?;
    }
    std::fs::rename(src, dst)
}

/// A held reference on one executable. Dropping it releases the reference.
#[must_use = "dropping a lease releases it immediately"]
pub struct ExecutableLease {
    manager: LockManager,
    kind: ExecutableKind,
    staged: bool,
    path: PathBuf,
    version: String,
}

impl ExecutableLease {
    pub fn kind(&self) -> ExecutableKind {
        self.kind
    }

    /// Resolved executable path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Whether the lease points into the staged (not yet promoted) install.
    pub fn is_staged(&self) -> bool {
        self.staged
    }
}

impl std::fmt::Debug for ExecutableLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableLease")
            .field("kind", &self.kind)
            .field("staged", &self.staged)
            .field("path", &self.path)
            .field("version", &self.version)
            .finish()
    }
}

impl Drop for ExecutableLease {
    fn drop(&mut self) {
        self.manager.release(self.kind, self.staged);
    }
}
