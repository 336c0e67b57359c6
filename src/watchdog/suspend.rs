//! Pausing the engine around filesystem swaps.

use std::sync::Arc;

use crate::types::Result;

/// Capability to freeze and thaw another process.
pub trait ProcessSuspender: Send + Sync + std::fmt::Debug {
    fn suspend(&self, pid: u32) -> Result<()>;
    fn resume(&self, pid: u32) -> Result<()>;
}

/// Stops every thread of the process with SIGSTOP, resumes with SIGCONT.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalSuspender;

#[cfg(unix)]
impl SignalSuspender {
    fn send(pid: u32, signal: nix::sys::signal::Signal) -> Result<()> {
        use nix::unistd::Pid;

        let raw = i32::try_from(pid)
            .map_err(|_| crate::types::Error::validation(format!("pid {} out of range", pid)))?;
        nix::sys::signal::kill(Pid::from_raw(raw), signal).map_err(|e| {
            crate::types::Error::internal(format!("{:?} to pid {} failed: {}", signal, pid, e))
        })
    }
}

#[cfg(unix)]
impl ProcessSuspender for SignalSuspender {
    fn suspend(&self, pid: u32) -> Result<()> {
        tracing::debug!(pid, "suspending engine");
        Self::send(pid, nix::sys::signal::Signal::SIGSTOP)
    }

    fn resume(&self, pid: u32) -> Result<()> {
        tracing::debug!(pid, "resuming engine");
        Self::send(pid, nix::sys::signal::Signal::SIGCONT)
    }
}

/// Reduced-safety fallback for platforms without process suspension. The
/// engine keeps running; the swap relies on the atomic rename alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct CooperativeSuspender;

impl ProcessSuspender for CooperativeSuspender {
    fn suspend(&self, pid: u32) -> Result<()> {
        tracing::warn!(pid, "process suspension unavailable; swapping without pausing the engine");
        Ok(())
    }

    fn resume(&self, _pid: u32) -> Result<()> {
        Ok(())
    }
}

/// Best suspender for this platform.
pub fn platform_suspender() -> Arc<dyn ProcessSuspender> {
    #[cfg(unix)]
    {
        Arc::new(SignalSuspender)
    }
    #[cfg(not(unix))]
    {
        Arc::new(CooperativeSuspender)
    }
}

/// Resumes on drop, so a panicking action still thaws the engine.
pub(crate) struct ResumeGuard {
    pub(crate) suspender: Arc<dyn ProcessSuspender>,
    pub(crate) pid: u32,
}

impl Drop for ResumeGuard {
    fn drop(&mut self) {
        if let Err(e) = self.suspender.resume(self.pid) {
            tracing::error!(pid = self.pid, error = %e, "failed to resume engine");
        }
    }
}
