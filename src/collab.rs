//! External collaborators.
//!
//! Version control, chat and static-asset linking live outside the warden.
//! The core only talks to them through these traits; the small concrete
//! implementations here back the CLI binary and the tests.

use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};

use crate::types::{Error, Result};

// =============================================================================
// Version control
// =============================================================================

/// Source tree owner.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Copy the whole working tree into `dest`, skipping the slot-relative
    /// `exclude` paths.
    async fn copy_tree(&self, dest: &Path, exclude: &[PathBuf]) -> Result<()>;

    /// Copy only the slot-relative `only` paths into `dest`.
    async fn copy_restricted_paths(&self, dest: &Path, only: &[PathBuf]) -> Result<()>;

    /// Identifier of the revision currently checked out.
    async fn current_revision(&self) -> Result<String>;

    /// Record a content-addressed backup tag of the current tree.
    async fn create_backup_tag(&self) -> Result<()>;

    /// Whether the repository still sits at `expected`.
    async fn repository_metadata_matches(&self, expected: &str) -> bool;
}

/// A plain directory acting as the source tree.
///
/// The revision is the trimmed content of a `REVISION` file at the root, or
/// `"unknown"`. Backup tags are only logged.
#[derive(Debug, Clone)]
pub struct LocalRepository {
    root: PathBuf,
}

impl LocalRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Repository for LocalRepository {
    async fn copy_tree(&self, dest: &Path, exclude: &[PathBuf]) -> Result<()> {
        let root = self.root.clone();
        let dest = dest.to_path_buf();
        let exclude = exclude.to_vec();
        tokio::task::spawn_blocking(move || -> Result<()> {
            copy_excluding(&root, &dest, Path::new(""), &exclude)?;
            Ok(())
        })
        .await
        .map_err(|e| Error::internal(format!("copy task failed: {e}")))?
    }

    async fn copy_restricted_paths(&self, dest: &Path, only: &[PathBuf]) -> Result<()> {
        let root = self.root.clone();
        let dest = dest.to_path_buf();
        let only = only.to_vec();
        tokio::task::spawn_blocking(move || -> Result<()> {
            for rel in &only {
                let src = root.join(rel);
                if src.exists() {
                    copy_recursive(&src, &dest.join(rel))?;
                }
            }
            Ok(())
        })
        .await
        .map_err(|e| Error::internal(format!("copy task failed: {e}")))?
    }

    async fn current_revision(&self) -> Result<String> {
        match tokio::fs::read_to_string(self.root.join("REVISION")).await {
            Ok(s) => Ok(s.trim().to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok("unknown".to_string()),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_backup_tag(&self) -> Result<()> {
        let revision = self.current_revision().await?;
        tracing::info!(revision = %revision, "backup tag requested for local source tree");
        Ok(())
    }

    async fn repository_metadata_matches(&self, expected: &str) -> bool {
        matches!(self.current_revision().await, Ok(rev) if rev == expected)
    }
}

/// Recursively copy `src` to `dst`, recreating symlinks rather than following them.
/// Copy `src` into `dst`, skipping root-relative `exclude` paths at any
/// depth and the top-level `.git`.
fn copy_excluding(
    src: &Path,
    dst: &Path,
    relative: &Path,
    exclude: &[PathBuf],
) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let rel = relative.join(entry.file_name());
        if rel.as_os_str() == ".git" || exclude.iter().any(|e| *e == rel) {
            continue;
        }
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() && exclude.iter().any(|e| e.starts_with(&rel)) {
            copy_excluding(&entry.path(), &target, &rel, exclude)?;
        } else {
            copy_recursive(&entry.path(), &target)?;
        }
    }
    Ok(())
}

pub fn copy_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    let meta = fs::symlink_metadata(src)?;
    if meta.file_type().is_symlink() {
        let target = fs::read_link(src)?;
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        link(&target, dst)
    } else if meta.is_dir() {
        fs::create_dir_all(dst)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &dst.join(entry.file_name()))?;
        }
        Ok(())
    } else {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(src, dst).map(|_| ())
    }
}

/// Create a symlink at `link_path` pointing to `target`.
#[cfg(unix)]
pub fn link(target: &Path, link_path: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link_path)
}

/// Create a symlink at `link_path` pointing to `target`.
#[cfg(windows)]
pub fn link(target: &Path, link_path: &Path) -> std::io::Result<()> {
    if target.is_dir() {
        std::os::windows::fs::symlink_dir(target, link_path)
    } else {
        std::os::windows::fs::symlink_file(target, link_path)
    }
}

// =============================================================================
// Chat
// =============================================================================

/// Audience of a broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatCategory {
    /// Deployment and watchdog status lines.
    Status,
    /// Admin-only channel.
    Admin,
    /// Relayed from the engine for everyone.
    Game,
}

/// Fire-and-forget chat broadcast. Implementations swallow and log their
/// own failures.
#[cfg_attr(test, mockall::automock)]
pub trait ChatBroadcaster: Send + Sync {
    fn broadcast(&self, text: &str, category: ChatCategory);
}

/// Broadcaster that only writes to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingBroadcaster;

impl ChatBroadcaster for TracingBroadcaster {
    fn broadcast(&self, text: &str, category: ChatCategory) {
        tracing::info!(?category, "chat: {}", text);
    }
}

// =============================================================================
// Static files
// =============================================================================

/// Links shared static assets into a build slot.
#[async_trait]
pub trait StaticFiles: Send + Sync {
    async fn link_into(&self, dest: &Path) -> Result<()>;
}

/// Symlinks every entry of a static directory into the slot root.
#[derive(Debug, Clone)]
pub struct SymlinkStaticFiles {
    dir: PathBuf,
}

impl SymlinkStaticFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl StaticFiles for SymlinkStaticFiles {
    async fn link_into(&self, dest: &Path) -> Result<()> {
        if !self.dir.exists() {
            return Ok(());
        }
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let link_path = dest.join(entry.file_name());
            if tokio::fs::symlink_metadata(&link_path).await.is_ok() {
                tracing::debug!(path = %link_path.display(), "static entry already present");
                continue;
            }
            link(&entry.path(), &link_path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_repository_copy_excludes() {
        let src = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        fs::write(src.path().join("engine.dme"), "code").unwrap();
        fs::create_dir_all(src.path().join("config")).unwrap();
        fs::write(src.path().join("config/admins.txt"), "secret").unwrap();
        fs::create_dir_all(src.path().join("maps/station")).unwrap();
        fs::write(src.path().join("maps/station/map.dmm"), "map").unwrap();

        let repo = LocalRepository::new(src.path());
        repo.copy_tree(dest.path(), &[PathBuf::from("config")])
            .await
            .unwrap();

        assert!(dest.path().join("engine.dme").exists());
        assert!(dest.path().join("maps/station/map.dmm").exists());
        assert!(!dest.path().join("config").exists());

        repo.copy_restricted_paths(dest.path(), &[PathBuf::from("config")])
            .await
            .unwrap();
        assert!(dest.path().join("config/admins.txt").exists());
    }

    #[tokio::test]
    async fn test_local_repository_copy_keeps_nested_shared_path() {
        let src = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("data/logs")).unwrap();
        fs::write(src.path().join("data/motd.txt"), "welcome").unwrap();
        fs::write(src.path().join("data/logs/stale.log"), "from source").unwrap();
        fs::create_dir_all(dest.path().join("data/logs")).unwrap();
        fs::write(dest.path().join("data/logs/round.log"), "kept").unwrap();

        let repo = LocalRepository::new(src.path());
        repo.copy_tree(dest.path(), &[PathBuf::from("data/logs")])
            .await
            .unwrap();

        assert_eq!(fs::read_to_string(dest.path().join("data/motd.txt")).unwrap(), "welcome");
        assert_eq!(
            fs::read_to_string(dest.path().join("data/logs/round.log")).unwrap(),
            "kept"
        );
        assert!(!dest.path().join("data/logs/stale.log").exists());
    }

    #[tokio::test]
    async fn test_local_repository_revision() {
        let src = tempfile::tempdir().unwrap();
        let repo = LocalRepository::new(src.path());
        assert_eq!(repo.current_revision().await.unwrap(), "unknown");

        fs::write(src.path().join("REVISION"), "abc123\n").unwrap();
        assert_eq!(repo.current_revision().await.unwrap(), "abc123");
        assert!(repo.repository_metadata_matches("abc123").await);
        assert!(!repo.repository_metadata_matches("def456").await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_static_files() {
        let statics = tempfile::tempdir().unwrap();
        let slot = tempfile::tempdir().unwrap();
        fs::write(statics.path().join("banlist.txt"), "").unwrap();
        fs::create_dir_all(statics.path().join("data")).unwrap();

        let linker = SymlinkStaticFiles::new(statics.path());
        linker.link_into(slot.path()).await.unwrap();
        // second pass is a no-op
        linker.link_into(slot.path()).await.unwrap();

        assert!(slot.path().join("banlist.txt").is_symlink());
        assert!(slot.path().join("data").is_symlink());
    }
}
