//! Launching and observing the engine's OS process.
//!
//! The watchdog only talks to [`EngineLauncher`] and [`EngineHandle`], so
//! tests can substitute scripted processes for real ones.

use async_trait::async_trait;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};

use crate::types::{Error, Result, SessionSecret};

/// Environment variable carrying the topic port to the engine.
pub const ENV_TOPIC_PORT: &str = "WARDEN_TOPIC_PORT";
/// Environment variable carrying the bridge port to the engine.
pub const ENV_BRIDGE_PORT: &str = "WARDEN_BRIDGE_PORT";
/// Environment variable carrying the topic secret to the engine.
pub const ENV_ACCESS_SECRET: &str = "WARDEN_ACCESS_SECRET";

/// Everything needed to start one engine process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Run tool executable (resolved from the lease).
    pub executable: PathBuf,
    /// Compiled artifact, resolved through the live pointer.
    pub artifact: PathBuf,
    pub working_dir: PathBuf,
    pub topic_port: u16,
    pub bridge_port: u16,
    pub secret: SessionSecret,
    pub extra_args: Vec<String>,
}

impl LaunchSpec {
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            self.artifact.display().to_string(),
            "-port".to_string(),
            self.topic_port.to_string(),
        ];
        args.extend(self.extra_args.iter().cloned());
        args
    }

    pub fn envs(&self) -> [(&'static str, String); 3] {
        [
            (ENV_TOPIC_PORT, self.topic_port.to_string()),
            (ENV_BRIDGE_PORT, self.bridge_port.to_string()),
            (ENV_ACCESS_SECRET, self.secret.as_str().to_string()),
        ]
    }
}

/// How an engine process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineExit {
    /// `None` when killed by a signal or observed only by polling.
    pub code: Option<i32>,
}

impl fmt::Display for EngineExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {}", code),
            None => f.write_str("no exit code"),
        }
    }
}

/// Starts engine processes and adopts detached ones.
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn EngineHandle>>;

    /// Supervise a process left running by an earlier warden.
    fn attach(&self, pid: u32) -> Result<Box<dyn EngineHandle>>;
}

/// One running engine process.
#[async_trait]
pub trait EngineHandle: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Resolve once the engine accepts topic calls.
    async fn wait_ready(&mut self, timeout: Duration) -> Result<()>;

    /// Resolve when the process exits. Cancel-safe.
    async fn wait(&mut self) -> Result<EngineExit>;

    async fn kill(&mut self) -> Result<()>;

    /// Stop supervising without terminating; returns the PID left running.
    fn detach(self: Box<Self>) -> Option<u32>;
}

// =============================================================================
// OS launcher
// =============================================================================

/// Spawns the run tool with `tokio::process`, writing its output to a fresh
/// diagnostic log per run.
#[derive(Debug, Clone)]
pub struct OsLauncher {
    diagnostics_dir: PathBuf,
    max_logs: usize,
    poll_interval: Duration,
    liveness_interval: Duration,
}

impl OsLauncher {
    pub fn new(
        diagnostics_dir: impl Into<PathBuf>,
        max_logs: usize,
        poll_interval: Duration,
        liveness_interval: Duration,
    ) -> Self {
        Self {
            diagnostics_dir: diagnostics_dir.into(),
            max_logs,
            poll_interval,
            liveness_interval,
        }
    }

    fn open_log(&self) -> Result<(PathBuf, std::fs::File)> {
        std::fs::create_dir_all(&self.diagnostics_dir)?;
        prune_logs(&self.diagnostics_dir, self.max_logs.saturating_sub(1))?;
        let name = format!(
            "engine-{}.log",
            chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
        );
        let path = self.diagnostics_dir.join(name);
        let file = std::fs::File::create(&path)?;
        Ok((path, file))
    }
}

#[async_trait]
impl EngineLauncher for OsLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn EngineHandle>> {
        // output goes straight to the file so a detached engine keeps logging
        let (log_path, log) = self.open_log()?;
        let stderr = log.try_clone()?;

        let mut cmd = Command::new(&spec.executable);
        cmd.args(spec.args())
            .envs(spec.envs())
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr));

        let child = cmd.spawn().map_err(|e| {
            Error::unavailable(format!(
                "cannot spawn {}: {}",
                spec.executable.display(),
                e
            ))
        })?;
        tracing::info!(
            pid = ?child.id(),
            executable = %spec.executable.display(),
            log = %log_path.display(),
            "engine launched"
        );

        Ok(Box::new(OsHandle {
            child,
            topic_port: spec.topic_port,
            poll_interval: self.poll_interval,
            detached: false,
        }))
    }

    fn attach(&self, pid: u32) -> Result<Box<dyn EngineHandle>> {
        let handle = AttachedHandle::new(pid, self.liveness_interval)?;
        tracing::info!(pid, "engine reattached");
        Ok(Box::new(handle))
    }
}

/// Delete the oldest `engine-*.log` files until at most `keep` remain.
fn prune_logs(dir: &Path, keep: usize) -> std::io::Result<()> {
    let mut logs: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("engine-") && n.ends_with(".log"))
        })
        .collect();
    if logs.len() <= keep {
        return Ok(());
    }
    // timestamped names sort chronologically
    logs.sort();
    let excess = logs.len() - keep;
    for path in logs.into_iter().take(excess) {
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::warn!(path = %path.display(), error = %e, "failed to prune diagnostic log");
        }
    }
    Ok(())
}

struct OsHandle {
    child: Child,
    topic_port: u16,
    poll_interval: Duration,
    detached: bool,
}

#[async_trait]
impl EngineHandle for OsHandle {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait_ready(&mut self, timeout: Duration) -> Result<()> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, self.topic_port));
        let poll_interval = self.poll_interval;
        let child = &mut self.child;

        let ready = async {
            loop {
                if let Some(status) = child.try_wait()? {
                    return Err(Error::unavailable(format!(
                        "engine exited during startup ({})",
                        status
                    )));
                }
                if TcpStream::connect(addr).await.is_ok() {
                    return Ok(());
                }
                tokio::time::sleep(poll_interval).await;
            }
        };

        tokio::time::timeout(timeout, ready).await.map_err(|_| {
            Error::timeout(format!(
                "engine not accepting topic calls on {} after {}s",
                addr,
                timeout.as_secs()
            ))
        })?
    }

    async fn wait(&mut self) -> Result<EngineExit> {
        let status = self.child.wait().await?;
        Ok(EngineExit {
            code: status.code(),
        })
    }

    async fn kill(&mut self) -> Result<()> {
        match self.child.kill().await {
            Ok(()) => Ok(()),
            // already reaped
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn detach(mut self: Box<Self>) -> Option<u32> {
        self.detached = true;
        self.child.id()
    }
}

impl Drop for OsHandle {
    fn drop(&mut self) {
        if !self.detached {
            let _ = self.child.start_kill();
        }
    }
}

// =============================================================================
// Attached processes
// =============================================================================

/// A process this warden did not spawn, observed by liveness polling.
#[derive(Debug)]
pub struct AttachedHandle {
    pid: u32,
    poll_interval: Duration,
}

impl AttachedHandle {
    pub fn new(pid: u32, poll_interval: Duration) -> Result<Self> {
        if !is_alive(pid)? {
            return Err(Error::unavailable(format!("no process with pid {}", pid)));
        }
        Ok(Self { pid, poll_interval })
    }
}

#[async_trait]
impl EngineHandle for AttachedHandle {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn wait_ready(&mut self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    async fn wait(&mut self) -> Result<EngineExit> {
        while is_alive(self.pid)? {
            tokio::time::sleep(self.poll_interval).await;
        }
        Ok(EngineExit::default())
    }

    async fn kill(&mut self) -> Result<()> {
        kill_pid(self.pid)
    }

    fn detach(self: Box<Self>) -> Option<u32> {
        Some(self.pid)
    }
}

#[cfg(unix)]
fn to_pid(pid: u32) -> Result<nix::unistd::Pid> {
    i32::try_from(pid)
        .map(nix::unistd::Pid::from_raw)
        .map_err(|_| Error::validation(format!("pid {} out of range", pid)))
}

#[cfg(unix)]
fn is_alive(pid: u32) -> Result<bool> {
    use nix::errno::Errno;

    match nix::sys::signal::kill(to_pid(pid)?, None) {
        Ok(()) | Err(Errno::EPERM) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(Error::internal(format!("probing pid {} failed: {}", pid, e))),
    }
}

#[cfg(unix)]
fn kill_pid(pid: u32) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::Signal;

    match nix::sys::signal::kill(to_pid(pid)?, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(Error::internal(format!("killing pid {} failed: {}", pid, e))),
    }
}

#[cfg(not(unix))]
fn is_alive(pid: u32) -> Result<bool> {
    Err(Error::unavailable(format!(
        "cannot observe pid {} on this platform",
        pid
    )))
}

#[cfg(not(unix))]
fn kill_pid(pid: u32) -> Result<()> {
    Err(Error::unavailable(format!(
        "cannot signal pid {} on this platform",
        pid
    )))
}
