//! Staging pipeline integration tests: real slot directories, a shell-script
//! build tool and the host wiring around them.

#![cfg(unix)]

mod common;

use common::{
    config_in, eventually, seed_runtime, write_script, FakeTopicServer, RecordingChat,
    ScriptedLauncher,
};
use engine_warden::pipeline::{BuildResult, BuildSlot, CancelOutcome, PipelineStatus};
use engine_warden::transport::BridgeEvent;
use engine_warden::watchdog::CooperativeSuspender;
use engine_warden::{Config, Error, Host, HostParts};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const COMPILER: &str = r#"#!/bin/sh
echo "compiling $1"
if [ ! -f "$1" ]; then
    echo "missing $1" >&2
    exit 2
fi
echo built > engine.dmb
echo "0 errors, 0 warnings"
"#;

struct Fixture {
    dir: tempfile::TempDir,
    config: Config,
    host: Host,
    chat: Arc<RecordingChat>,
}

impl Fixture {
    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn slot(&self, slot: BuildSlot) -> PathBuf {
        slot.dir(&self.config.game_dir())
    }

    fn live_link(&self) -> PathBuf {
        std::fs::read_link(self.config.live_path()).unwrap()
    }

    async fn build(&self, silent: bool) -> engine_warden::pipeline::BuildReport {
        self.host.pipeline().build(silent).unwrap();
        tokio::time::timeout(Duration::from_secs(30), self.host.pipeline().wait())
            .await
            .expect("build did not finish")
            .expect("no build report")
    }
}

async fn fixture_with(compiler: Option<&str>, tweak: impl FnOnce(&mut Config)) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_in(dir.path()).await;
    config.pipeline.shared_paths = vec![PathBuf::from("config")];
    tweak(&mut config);

    let source = config.source_dir();
    std::fs::create_dir_all(source.join("config")).unwrap();
    std::fs::create_dir_all(source.join("code")).unwrap();
    std::fs::write(source.join("engine.dme"), "#include \"code/main.dm\"\n").unwrap();
    std::fs::write(source.join("code/main.dm"), "/world\n").unwrap();
    std::fs::write(source.join("config/admins.txt"), "first-admin\n").unwrap();
    std::fs::write(source.join("REVISION"), "rev1\n").unwrap();

    std::fs::create_dir_all(config.static_dir()).unwrap();
    std::fs::write(config.static_dir().join("rsc.bin"), "assets").unwrap();

    if let Some(compiler) = compiler {
        seed_runtime(&config, "515.1", compiler);
    }

    let chat = Arc::new(RecordingChat::default());
    let mut parts = HostParts::from_config(&config);
    parts.chat = chat.clone();
    parts.launcher = ScriptedLauncher::with_lifetimes([None, None]);
    parts.suspender = Arc::new(CooperativeSuspender);
    let host = Host::new(config.clone(), parts).unwrap();

    Fixture {
        dir,
        config,
        host,
        chat,
    }
}

async fn fixture() -> Fixture {
    fixture_with(Some(COMPILER), |_| {}).await
}

#[tokio::test]
async fn test_first_build_initializes_both_slots() {
    let f = fixture().await;
    assert_eq!(f.host.pipeline().status(), PipelineStatus::Uninitialized);

    let report = f.build(false).await;
    assert!(report.succeeded(), "{report:?}");
    assert_eq!(
        report.result,
        BuildResult::Succeeded {
            pending_update: false
        }
    );
    assert_eq!(report.slot, Some(BuildSlot::B));
    assert_eq!(report.revision.as_deref(), Some("rev1"));
    assert!(report.output_tail.iter().any(|l| l == "0 errors, 0 warnings"));

    // Live was created on A, then moved to the freshly built B
    assert_eq!(f.live_link(), PathBuf::from("B"));
    assert_eq!(f.host.pipeline().snapshot().live_slot, Some(BuildSlot::B));
    assert!(f.slot(BuildSlot::A).is_dir());
    assert!(f.slot(BuildSlot::B).join("engine.dmb").is_file());
    assert!(f.slot(BuildSlot::B).join("code/main.dm").is_file());
    assert!(std::fs::symlink_metadata(f.slot(BuildSlot::B).join("rsc.bin"))
        .unwrap()
        .file_type()
        .is_symlink());

    assert_eq!(f.host.pipeline().status(), PipelineStatus::Initialized);
    assert!(!f.host.pipeline().pending_update());
    assert_eq!(f.host.locks().lease_counts(), (0, 0));
    assert!(f.chat.contains("Deployment started."));
    assert!(f.chat.contains("Deployment complete."));
}

#[tokio::test]
async fn test_builds_alternate_slots_and_keep_shared_paths() {
    let f = fixture().await;
    assert_eq!(f.build(true).await.slot, Some(BuildSlot::B));

    // Shared paths come from the source only when the slots are created
    std::fs::write(
        f.config.source_dir().join("config/admins.txt"),
        "second-admin\n",
    )
    .unwrap();
    std::fs::write(f.config.source_dir().join("REVISION"), "rev2\n").unwrap();

    let report = f.build(true).await;
    assert_eq!(report.slot, Some(BuildSlot::A));
    assert_eq!(report.revision.as_deref(), Some("rev2"));
    assert_eq!(f.live_link(), PathBuf::from("A"));
    assert_eq!(
        std::fs::read_to_string(f.slot(BuildSlot::A).join("config/admins.txt")).unwrap(),
        "first-admin\n"
    );

    let third = f.build(true).await;
    assert_eq!(third.slot, Some(BuildSlot::B));
    assert_eq!(f.live_link(), PathBuf::from("B"));

    // Silent builds announce nothing when they succeed
    assert!(f.chat.lines().is_empty());
}

#[tokio::test]
async fn test_first_build_requires_offline_engine() {
    let f = fixture().await;
    f.host.watchdog().start().await.unwrap();

    let err = f.host.pipeline().build(false).unwrap_err();
    assert!(matches!(err, Error::Busy(_)), "got {err:?}");
    assert_eq!(f.host.pipeline().status(), PipelineStatus::Uninitialized);

    f.host.watchdog().stop().await.unwrap();
}

#[tokio::test]
async fn test_build_without_runtime_is_unavailable() {
    let f = fixture_with(None, |_| {}).await;
    let err = f.host.pipeline().build(false).unwrap_err();
    assert!(matches!(err, Error::Unavailable(_)), "got {err:?}");
    assert!(f.host.pipeline().last_report().is_none());
}

#[tokio::test]
async fn test_online_swap_leaves_update_pending_until_reboot() {
    let f = fixture().await;
    let engine = FakeTopicServer::start(f.config.transport.topic_port, "ok").await;
    assert!(f.build(true).await.succeeded());

    f.host.watchdog().start().await.unwrap();
    f.host.gateway().handle_bridge("api_ver 5.1.0");
    engine.wait_for_calls(1).await;

    let report = f.build(false).await;
    assert_eq!(
        report.result,
        BuildResult::Succeeded {
            pending_update: true
        }
    );
    assert_eq!(f.live_link(), PathBuf::from("A"));
    assert!(f.host.pipeline().pending_update());
    assert!(f.chat.contains("next round"));

    engine.wait_for_calls(2).await;
    assert_eq!(engine.values_of("command").last().unwrap(), "deployment_staged");
    assert_eq!(engine.values_of("revision"), vec!["rev1".to_string()]);

    f.host.dispatch(BridgeEvent::WorldRebooted);
    assert!(!f.host.pipeline().pending_update());

    f.host.watchdog().stop().await.unwrap();
}

#[tokio::test]
async fn test_reboot_during_post_hook_clears_pending_update() {
    let f = fixture().await;
    let engine = FakeTopicServer::start(f.config.transport.topic_port, "ok").await;
    assert!(f.build(true).await.succeeded());

    f.host.watchdog().start().await.unwrap();
    f.host.gateway().handle_bridge("api_ver 5.1.0");
    engine.wait_for_calls(1).await;

    let hooks = f.config.hooks_dir();
    std::fs::create_dir_all(&hooks).unwrap();
    let release = f.root().join("release-hook");
    write_script(
        &hooks.join("PostCompile.sh"),
        &format!(
            "#!/bin/sh\nwhile [ ! -f '{}' ]; do sleep 0.05; done\n",
            release.display()
        ),
    );

    f.host.pipeline().build(true).unwrap();
    eventually("online swap", || f.host.pipeline().pending_update()).await;
    assert_eq!(f.live_link(), PathBuf::from("A"));

    // The engine reboots onto the new slot while the post hook still runs
    f.host.dispatch(BridgeEvent::WorldRebooted);
    std::fs::write(&release, "").unwrap();
    let report = tokio::time::timeout(Duration::from_secs(30), f.host.pipeline().wait())
        .await
        .unwrap()
        .unwrap();

    assert!(report.succeeded(), "{report:?}");
    assert!(!f.host.pipeline().pending_update());
    f.host.watchdog().stop().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_waiters_share_one_report() {
    let slow = COMPILER.replacen("#!/bin/sh\n", "#!/bin/sh\nsleep 0.3\n", 1);
    let f = fixture_with(Some(&slow), |_| {}).await;
    f.host.pipeline().build(true).unwrap();

    let pipeline = f.host.pipeline();
    let (first, second) = tokio::time::timeout(
        Duration::from_secs(30),
        async { tokio::join!(pipeline.wait(), pipeline.wait()) },
    )
    .await
    .expect("waiters were not woken");

    let (first, second) = (first.unwrap(), second.unwrap());
    assert_eq!(first.id, second.id);
    assert!(first.succeeded(), "{first:?}");
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_stale_live_pointer_is_repaired() {
    let f = fixture().await;
    assert_eq!(f.build(true).await.slot, Some(BuildSlot::B));

    // The engine still serves from B but Live was left pointing at A
    let live = f.config.live_path();
    std::fs::remove_file(&live).unwrap();
    std::os::unix::fs::symlink("A", &live).unwrap();
    let lock_file = f
        .slot(BuildSlot::B)
        .join(f.config.engine.resource_lock_file_name());
    std::fs::write(&lock_file, "").unwrap();
    let _held = std::fs::File::open(&lock_file).unwrap();

    let report = f.build(true).await;
    assert!(report.succeeded(), "{report:?}");
    assert_eq!(report.slot, Some(BuildSlot::A));
    assert_eq!(f.live_link(), PathBuf::from("A"));

    // B was never wiped
    assert!(lock_file.exists());
    assert!(f.slot(BuildSlot::B).join("engine.dmb").is_file());
    assert!(f.chat.contains("repointed to slot B"));
}

#[tokio::test]
async fn test_cancel_kills_build_tool() {
    let f = fixture_with(Some("#!/bin/sh\necho started\nexec sleep 30\n"), |_| {}).await;
    assert_eq!(f.host.pipeline().cancel(), CancelOutcome::NotRunning);

    f.host.pipeline().build(false).unwrap();
    eventually("build tool leased", || f.host.locks().lease_counts().0 == 1).await;
    assert!(matches!(
        f.host.pipeline().build(false),
        Err(Error::Busy(_))
    ));

    assert_eq!(f.host.pipeline().cancel(), CancelOutcome::Immediate);
    let report = tokio::time::timeout(Duration::from_secs(5), f.host.pipeline().wait())
        .await
        .expect("cancelled build kept running")
        .unwrap();

    assert_eq!(report.result, BuildResult::Cancelled);
    assert_eq!(f.host.locks().lease_counts(), (0, 0));
    assert_eq!(f.host.pipeline().status(), PipelineStatus::Initialized);
    assert!(f.chat.contains("Deployment cancelled."));
    // Live still points at the initial slot
    assert_eq!(f.live_link(), PathBuf::from("A"));
}

#[tokio::test]
async fn test_failed_pre_hook_aborts_build() {
    let f = fixture().await;
    let hooks = f.config.hooks_dir();
    std::fs::create_dir_all(&hooks).unwrap();
    write_script(
        &hooks.join("PreCompile.sh"),
        "#!/bin/sh\necho \"hook refused\"\nexit 3\n",
    );

    let report = f.build(true).await;
    match &report.result {
        BuildResult::Failed { reason } => assert!(reason.contains("PreCompile.sh"), "{reason}"),
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(report.output_tail.iter().any(|l| l == "hook refused"));
    assert!(!f.slot(BuildSlot::B).join("engine.dmb").exists());
    assert_eq!(f.live_link(), PathBuf::from("A"));
    assert_eq!(f.host.pipeline().status(), PipelineStatus::Initialized);

    // Failures are announced even for silent builds
    assert!(f.chat.contains("Deployment failed"));
}

#[tokio::test]
async fn test_failed_post_hook_only_warns() {
    let f = fixture().await;
    let hooks = f.config.hooks_dir();
    std::fs::create_dir_all(&hooks).unwrap();
    write_script(&hooks.join("PostCompile.sh"), "#!/bin/sh\nexit 1\n");

    let report = f.build(true).await;
    assert!(report.succeeded(), "{report:?}");
    assert_eq!(f.live_link(), PathBuf::from("B"));
    assert!(f.chat.contains("PostCompile.sh failed"));
}

#[tokio::test]
async fn test_missing_artifact_fails_build() {
    let f = fixture_with(Some("#!/bin/sh\necho \"nothing to do\"\n"), |_| {}).await;

    let report = f.build(true).await;
    match &report.result {
        BuildResult::Failed { reason } => assert!(reason.contains("did not produce"), "{reason}"),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(f.live_link(), PathBuf::from("A"));
    assert!(f.root().join("game/B").is_dir());
}

#[tokio::test]
async fn test_required_directories_are_recreated() {
    let f = fixture_with(Some(COMPILER), |config| {
        config.pipeline.required_directories = vec![PathBuf::from("data/logs")];
    })
    .await;

    assert!(f.build(true).await.succeeded());
    assert!(f.slot(BuildSlot::B).join("data/logs").is_dir());
}
