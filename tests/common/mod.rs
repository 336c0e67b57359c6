//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use engine_warden::collab::{ChatBroadcaster, ChatCategory};
use engine_warden::transport::codec::{decode_topic_frame, encode_reply, parse_param_string};
use engine_warden::watchdog::{EngineExit, EngineHandle, EngineLauncher, LaunchSpec};
use engine_warden::{Config, Result};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Reserve a loopback port by binding and dropping a listener.
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

/// Config rooted in `dir` with both loopback ports free.
pub async fn config_in(dir: &Path) -> Config {
    let mut config = Config::default();
    config.paths.root = dir.to_path_buf();
    config.transport.topic_port = free_port().await;
    config.transport.bridge_port = free_port().await;
    config
}

/// Lay down an active runtime install. `compiler` is the build tool script
/// body; the run tool is never executed by these tests.
pub fn seed_runtime(config: &Config, version: &str, compiler: &str) {
    let dir = config.runtime_active_dir();
    std::fs::create_dir_all(dir.join("bin")).unwrap();
    write_script(&dir.join("bin/compiler"), compiler);
    write_script(&dir.join("bin/server"), "#!/bin/sh\nexit 0\n");
    std::fs::write(dir.join(&config.install.version_marker), version).unwrap();
}

pub fn write_script(path: &Path, body: &str) {
    std::fs::write(path, body).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
}

// =============================================================================
// Chat
// =============================================================================

/// Records every broadcast.
#[derive(Debug, Default)]
pub struct RecordingChat {
    lines: Mutex<Vec<(String, ChatCategory)>>,
}

impl RecordingChat {
    pub fn lines(&self) -> Vec<(String, ChatCategory)> {
        self.lines.lock().unwrap().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|(text, _)| text.contains(needle))
    }
}

impl ChatBroadcaster for RecordingChat {
    fn broadcast(&self, text: &str, category: ChatCategory) {
        self.lines
            .lock()
            .unwrap()
            .push((text.to_string(), category));
    }
}

// =============================================================================
// Fake engine topic endpoint
// =============================================================================

/// Loopback listener standing in for the engine's topic port. Every frame
/// it receives is decoded and kept; each call is answered with `reply`.
#[derive(Debug)]
pub struct FakeTopicServer {
    calls: Arc<Mutex<Vec<Vec<(String, String)>>>>,
    task: JoinHandle<()>,
}

impl FakeTopicServer {
    pub async fn start(port: u16, reply: &'static str) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let recorded = calls.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let recorded = recorded.clone();
                tokio::spawn(async move {
                    let mut header = [0u8; 4];
                    if stream.read_exact(&mut header).await.is_err() {
                        return;
                    }
                    let declared = u16::from_be_bytes([header[2], header[3]]) as usize;
                    let mut frame = header.to_vec();
                    frame.resize(declared + 4, 0);
                    if stream.read_exact(&mut frame[4..]).await.is_err() {
                        return;
                    }
                    let params = decode_topic_frame(&frame).unwrap();
                    recorded.lock().unwrap().push(parse_param_string(&params));
                    let _ = stream.write_all(&encode_reply(reply).unwrap()).await;
                });
            }
        });
        Self { calls, task }
    }

    pub fn calls(&self) -> Vec<Vec<(String, String)>> {
        self.calls.lock().unwrap().clone()
    }

    /// Value of `key` in every recorded call that has it.
    pub fn values_of(&self, key: &str) -> Vec<String> {
        self.calls()
            .iter()
            .filter_map(|pairs| pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone()))
            .collect()
    }

    /// Wait until at least `n` calls arrived.
    pub async fn wait_for_calls(&self, n: usize) {
        for _ in 0..200 {
            if self.calls.lock().unwrap().len() >= n {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("expected {} topic calls, saw {:?}", n, self.calls());
    }
}

impl Drop for FakeTopicServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// =============================================================================
// Scripted engine
// =============================================================================

/// Engine that exits after a scripted lifetime, when told to, or when killed.
pub struct ScriptedEngine {
    pid: u32,
    deadline: Option<Instant>,
    exit: Arc<Notify>,
}

#[async_trait]
impl EngineHandle for ScriptedEngine {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn wait_ready(&mut self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    async fn wait(&mut self) -> Result<EngineExit> {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = self.exit.notified() => {}
            },
            None => self.exit.notified().await,
        }
        Ok(EngineExit { code: Some(1) })
    }

    async fn kill(&mut self) -> Result<()> {
        Ok(())
    }

    fn detach(self: Box<Self>) -> Option<u32> {
        Some(self.pid)
    }
}

/// Hands out engines with the queued lifetimes; `None` (or an empty queue)
/// means the engine runs until told to exit.
#[derive(Default)]
pub struct ScriptedLauncher {
    lifetimes: Mutex<VecDeque<Option<Duration>>>,
    launches: Mutex<Vec<Instant>>,
    exit: Arc<Notify>,
}

impl ScriptedLauncher {
    pub fn with_lifetimes(lifetimes: impl IntoIterator<Item = Option<Duration>>) -> Arc<Self> {
        Arc::new(Self {
            lifetimes: Mutex::new(lifetimes.into_iter().collect()),
            ..Self::default()
        })
    }

    pub fn launches(&self) -> Vec<Instant> {
        self.launches.lock().unwrap().clone()
    }

    /// Make the running engine exit.
    pub fn exit_engine(&self) {
        self.exit.notify_one();
    }
}

#[async_trait]
impl EngineLauncher for ScriptedLauncher {
    async fn launch(&self, _spec: &LaunchSpec) -> Result<Box<dyn EngineHandle>> {
        let now = Instant::now();
        let lifetime = self.lifetimes.lock().unwrap().pop_front().flatten();
        let mut launches = self.launches.lock().unwrap();
        launches.push(now);
        Ok(Box::new(ScriptedEngine {
            pid: 10_000 + launches.len() as u32,
            deadline: lifetime.map(|l| now + l),
            exit: self.exit.clone(),
        }))
    }

    fn attach(&self, pid: u32) -> Result<Box<dyn EngineHandle>> {
        Ok(Box::new(ScriptedEngine {
            pid,
            deadline: None,
            exit: self.exit.clone(),
        }))
    }
}

/// Poll `check` every 10ms for up to five seconds.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}
