//! Build slots and the Live pointer.
//!
//! `<game>/A` and `<game>/B` each hold a complete build; `<game>/Live` is a
//! relative symlink to one of them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::types::{Error, Result};

/// One of the two on-disk build directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildSlot {
    A,
    B,
}

impl BuildSlot {
    pub const ALL: [BuildSlot; 2] = [BuildSlot::A, BuildSlot::B];

    pub fn inverse(self) -> Self {
        match self {
            BuildSlot::A => BuildSlot::B,
            BuildSlot::B => BuildSlot::A,
        }
    }

    pub fn dir_name(self) -> &'static str {
        match self {
            BuildSlot::A => "A",
            BuildSlot::B => "B",
        }
    }

    pub fn dir(self, game_dir: &Path) -> PathBuf {
        game_dir.join(self.dir_name())
    }

    fn from_dir_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|slot| slot.dir_name() == name)
    }
}

impl fmt::Display for BuildSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot {}", self.dir_name())
    }
}

/// Find the slot Live really resolves to by writing a marker through it.
/// `None` when there is no Live pointer yet.
pub fn resolve_live(game_dir: &Path, live: &Path) -> Result<Option<BuildSlot>> {
    if fs::symlink_metadata(live).is_err() {
        return Ok(None);
    }

    let marker = format!(".live-marker-{}", uuid::Uuid::new_v4().simple());
    fs::write(live.join(&marker), b"")?;
    let found = BuildSlot::ALL
        .into_iter()
        .find(|slot| slot.dir(game_dir).join(&marker).exists());
    if let Err(e) = fs::remove_file(live.join(&marker)) {
        tracing::warn!(error = %e, "failed to remove live marker file");
    }

    found.map(Some).ok_or_else(|| {
        Error::internal(format!(
            "{} does not resolve to a build slot",
            live.display()
        ))
    })
}

/// Slot named by the Live symlink, without touching the filesystem beyond
/// reading the link.
pub fn live_target(live: &Path) -> Option<BuildSlot> {
    let target = fs::read_link(live).ok()?;
    BuildSlot::from_dir_name(target.file_name()?.to_str()?)
}

/// Point Live at `slot` by renaming a fresh symlink over it.
pub fn link_live(game_dir: &Path, live: &Path, slot: BuildSlot) -> io::Result<()> {
    let staging = game_dir.join(format!(".Live-{}", uuid::Uuid::new_v4().simple()));
    symlink_dir(Path::new(slot.dir_name()), &staging)?;

    #[cfg(windows)]
    if fs::symlink_metadata(live).is_ok() {
        fs::remove_dir(live)?;
    }

    if let Err(e) = fs::rename(&staging, live) {
        let _ = fs::remove_file(&staging);
        return Err(e);
    }
    tracing::info!(%slot, "live pointer updated");
    Ok(())
}

#[cfg(unix)]
fn symlink_dir(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink_dir(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}

/// Whether a run tool still has `lock_file` open. A stale, unheld lock file
/// is removed.
pub fn resource_lock_held(lock_file: &Path) -> bool {
    if fs::symlink_metadata(lock_file).is_err() {
        return false;
    }

    #[cfg(target_os = "linux")]
    if let Some(held) = held_open_by_any_process(lock_file) {
        if !held {
            if let Err(e) = fs::remove_file(lock_file) {
                tracing::warn!(
                    path = %lock_file.display(),
                    error = %e,
                    "failed to remove stale resource lock"
                );
            }
        }
        return held;
    }

    fs::remove_file(lock_file).is_err()
}

/// Scan `/proc/*/fd` for a descriptor on `path`. `None` when `/proc` cannot
/// be read.
#[cfg(target_os = "linux")]
fn held_open_by_any_process(path: &Path) -> Option<bool> {
    let wanted = fs::canonicalize(path).ok()?;
    let procs = fs::read_dir("/proc").ok()?;

    for proc_entry in procs.flatten() {
        let is_pid = proc_entry
            .file_name()
            .to_str()
            .is_some_and(|n| n.bytes().all(|b| b.is_ascii_digit()));
        if !is_pid {
            continue;
        }
        // other users' processes are unreadable; skip them
        let Ok(fds) = fs::read_dir(proc_entry.path().join("fd")) else {
            continue;
        };
        for fd in fds.flatten() {
            if fs::read_link(fd.path()).is_ok_and(|target| target == wanted) {
                return Some(true);
            }
        }
    }
    Some(false)
}

/// Empty `slot_dir` except for the slot-relative `keep` paths.
pub fn wipe_except(slot_dir: &Path, keep: &[PathBuf]) -> io::Result<()> {
    fs::create_dir_all(slot_dir)?;
    wipe_dir(slot_dir, Path::new(""), keep)
}

fn wipe_dir(dir: &Path, relative: &Path, keep: &[PathBuf]) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let rel = relative.join(entry.file_name());
        if keep.iter().any(|k| *k == rel) {
            continue;
        }

        let file_type = entry.file_type()?;
        let holds_kept = keep.iter().any(|k| k.starts_with(&rel));
        if file_type.is_dir() && holds_kept {
            wipe_dir(&entry.path(), &rel, keep)?;
        } else if file_type.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}
