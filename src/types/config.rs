//! Configuration structures.
//!
//! Configuration is loaded from a JSON file (every section optional) and the
//! `WARDEN_ROOT` environment variable. It is never written back.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::errors::Result;

/// Global warden configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Filesystem layout.
    #[serde(default)]
    pub paths: PathsConfig,

    /// What the engine is and how it is launched.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Supervising loop tuning.
    #[serde(default)]
    pub watchdog: WatchdogConfig,

    /// Build slot handling.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Runtime version installs.
    #[serde(default)]
    pub install: InstallConfig,

    /// Topic/bridge transport.
    #[serde(default)]
    pub transport: TransportConfig,
}

impl Config {
    /// Load configuration from a JSON file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: Config = serde_json::from_str(&raw)?;
        config.apply_env();
        Ok(config)
    }

    /// `WARDEN_ROOT` overrides `paths.root`.
    pub fn apply_env(&mut self) {
        if let Ok(root) = std::env::var("WARDEN_ROOT") {
            if !root.trim().is_empty() {
                self.paths.root = PathBuf::from(root);
            }
        }
    }

    pub fn runtime_active_dir(&self) -> PathBuf {
        self.paths.root.join("runtime").join("active")
    }

    pub fn runtime_staging_dir(&self) -> PathBuf {
        self.paths.root.join("runtime").join("staging")
    }

    pub fn game_dir(&self) -> PathBuf {
        self.paths.root.join("game")
    }

    pub fn live_path(&self) -> PathBuf {
        self.game_dir().join("Live")
    }

    pub fn diagnostics_dir(&self) -> PathBuf {
        self.paths.root.join("diagnostics")
    }

    pub fn hooks_dir(&self) -> PathBuf {
        self.paths.root.join("hooks")
    }

    pub fn static_dir(&self) -> PathBuf {
        self.paths.root.join("static")
    }

    /// Source tree builds are copied from.
    pub fn source_dir(&self) -> PathBuf {
        self.paths
            .source
            .clone()
            .unwrap_or_else(|| self.paths.root.join("source"))
    }
}

/// Filesystem layout root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Everything the warden owns lives below this directory.
    pub root: PathBuf,

    /// Source tree for the local repository; `<root>/source` when unset.
    #[serde(default)]
    pub source: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("warden-data"),
            source: None,
        }
    }
}

/// Engine project and executables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Base name of the project file and the compiled artifact.
    pub project_name: String,

    /// Extension of the project file handed to the build tool.
    pub project_extension: String,

    /// Extension of the compiled artifact the run tool serves.
    pub artifact_extension: String,

    /// Build tool path, relative to an install directory.
    pub build_tool: PathBuf,

    /// Run tool path, relative to an install directory.
    pub run_tool: PathBuf,

    /// Extra arguments appended to the run tool command line.
    #[serde(default)]
    pub extra_args: Vec<String>,

    /// Name of the resource-lock artifact the run tool keeps open in the
    /// directory it serves from. Defaults to `<project>.rsc.lk`.
    #[serde(default)]
    pub resource_lock_name: Option<String>,
}

impl EngineConfig {
    pub fn project_file_name(&self) -> String {
        format!("{}.{}", self.project_name, self.project_extension)
    }

    pub fn artifact_file_name(&self) -> String {
        format!("{}.{}", self.project_name, self.artifact_extension)
    }

    pub fn resource_lock_file_name(&self) -> String {
        self.resource_lock_name
            .clone()
            .unwrap_or_else(|| format!("{}.rsc.lk", self.project_name))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            project_name: "engine".to_string(),
            project_extension: "dme".to_string(),
            artifact_extension: "dmb".to_string(),
            build_tool: PathBuf::from("bin/compiler"),
            run_tool: PathBuf::from("bin/server"),
            extra_args: Vec::new(),
            resource_lock_name: None,
        }
    }
}

/// Supervising loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// How long a launched engine may take to become ready.
    #[serde(with = "humantime_serde")]
    pub startup_timeout: Duration,

    /// Exits sooner than this after launch count as bad starts.
    #[serde(with = "humantime_serde")]
    pub bad_start_threshold: Duration,

    /// Upper bound on the bad-start backoff.
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,

    /// Leave the engine running (detach) instead of killing it when the
    /// host shuts down.
    pub detach_on_shutdown: bool,

    /// Per-run diagnostic logs kept in the diagnostics directory.
    pub max_diagnostic_logs: usize,

    /// Interval between readiness checks of the topic port.
    #[serde(with = "humantime_serde")]
    pub readiness_poll_interval: Duration,

    /// Interval between liveness checks of a re-attached engine.
    #[serde(with = "humantime_serde")]
    pub reattach_poll_interval: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(60),
            bad_start_threshold: Duration::from_secs(10),
            max_backoff: Duration::from_secs(3600),
            detach_on_shutdown: false,
            max_diagnostic_logs: 20,
            readiness_poll_interval: Duration::from_millis(250),
            reattach_poll_interval: Duration::from_secs(1),
        }
    }
}

/// Build slot configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PipelineConfig {
    /// Slot-relative paths that survive a slot wipe and are never copied
    /// over from the source tree.
    #[serde(default)]
    pub shared_paths: Vec<PathBuf>,

    /// Slot-relative directories recreated after every wipe.
    #[serde(default)]
    pub required_directories: Vec<PathBuf>,

    /// Interop bridge library linked into every slot.
    #[serde(default)]
    pub bridge_library: Option<PathBuf>,

    /// Compile with a staged (not yet promoted) runtime when one exists.
    #[serde(default)]
    pub build_with_staged: bool,
}

/// Runtime install configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallConfig {
    /// Zip download URL; `{version}` is substituted.
    pub download_url_template: String,

    /// Marker file written into an install directory with its version.
    pub version_marker: String,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            download_url_template: String::new(),
            version_marker: "version.txt".to_string(),
        }
    }
}

/// Topic/bridge transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Loopback port the engine listens on for topic calls.
    pub topic_port: u16,

    /// Loopback port the warden listens on for bridge callbacks.
    pub bridge_port: u16,

    /// Connect/write/read budget for one topic call.
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,

    /// Maximum topic reply size in bytes.
    pub max_reply_bytes: usize,

    /// Read timeout for a bridge connection.
    #[serde(with = "humantime_serde")]
    pub bridge_read_timeout: Duration,

    /// Maximum concurrent bridge connections.
    pub bridge_max_connections: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            topic_port: 1337,
            bridge_port: 1338,
            call_timeout: Duration::from_secs(5),
            max_reply_bytes: 64 * 1024,
            bridge_read_timeout: Duration::from_secs(10),
            bridge_max_connections: 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = serde_json::from_str(
            r#"{ "paths": { "root": "/srv/warden" }, "watchdog": {
                "startup_timeout": "30s", "bad_start_threshold": "5s",
                "max_backoff": "1h", "detach_on_shutdown": true,
                "max_diagnostic_logs": 3, "readiness_poll_interval": "100ms",
                "reattach_poll_interval": "2s" } }"#,
        )
        .unwrap();

        assert_eq!(config.paths.root, PathBuf::from("/srv/warden"));
        assert_eq!(config.watchdog.startup_timeout, Duration::from_secs(30));
        assert_eq!(config.watchdog.max_backoff, Duration::from_secs(3600));
        assert!(config.watchdog.detach_on_shutdown);
        assert_eq!(config.transport.topic_port, 1337);
        assert_eq!(config.live_path(), PathBuf::from("/srv/warden/game/Live"));
    }

    #[test]
    fn test_engine_file_names() {
        let engine = EngineConfig::default();
        assert_eq!(engine.project_file_name(), "engine.dme");
        assert_eq!(engine.artifact_file_name(), "engine.dmb");
        assert_eq!(engine.resource_lock_file_name(), "engine.rsc.lk");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warden.json");
        std::fs::write(&path, r#"{ "engine": { "project_name": "station",
            "project_extension": "dme", "artifact_extension": "dmb",
            "build_tool": "bin/DreamMaker", "run_tool": "bin/DreamDaemon" } }"#)
            .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.engine.artifact_file_name(), "station.dmb");
        assert_eq!(config.engine.run_tool, PathBuf::from("bin/DreamDaemon"));
    }
}
