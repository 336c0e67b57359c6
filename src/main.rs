//! engine-warden - supervises a game-server engine from the command line.
//!
//! - `run`: serve the bridge, launch (or reattach to) the engine and supervise
//!   it until Ctrl-C
//! - `build`: stage the current source tree into the inactive slot
//! - `install`: download and stage a runtime version
//! - `status`: print every component's state as JSON

use clap::{Parser, Subcommand};
use engine_warden::types::SessionSecret;
use engine_warden::{Config, Error, Host, Result};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "engine-warden")]
#[command(about = "Game-server engine watchdog and zero-downtime deployer", long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(short, long, env = "WARDEN_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Launch the engine and supervise it until Ctrl-C
    Run {
        /// Deploy the current source tree before launching
        #[arg(long)]
        build: bool,

        /// Leave the engine running on exit instead of stopping it
        #[arg(long)]
        detach_on_exit: bool,

        /// Adopt an engine a previous warden detached from
        #[arg(long, value_name = "PID", conflicts_with = "build", requires = "secret")]
        reattach: Option<u32>,

        /// Session secret printed when that engine was detached
        #[arg(long, env = "WARDEN_ENGINE_SECRET", hide_env_values = true)]
        secret: Option<String>,
    },
    /// Deploy the current source tree into the inactive build slot
    Build,
    /// Download and stage a runtime version
    Install { version: String },
    /// Print component status as JSON
    Status,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    engine_warden::observability::init_tracing();

    if let Err(e) = execute(args).await {
        tracing::error!(code = e.code(), error = %e, "engine-warden failed");
        eprintln!("error [{}]: {}", e.code(), e);
        std::process::exit(1);
    }
}

async fn execute(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => {
            let mut config = Config::default();
            config.apply_env();
            config
        }
    };
    tracing::info!(root = %config.paths.root.display(), "engine warden starting");

    let host = Arc::new(Host::from_config(config)?);

    match args.command {
        Command::Run {
            build,
            detach_on_exit,
            reattach,
            secret,
        } => {
            let reattach = match (reattach, secret) {
                (Some(pid), Some(secret)) => Some((
                    pid,
                    SessionSecret::from_string(secret).map_err(Error::validation)?,
                )),
                (Some(_), None) => return Err(Error::validation("--reattach needs --secret")),
                (None, _) => None,
            };
            run(host, build, detach_on_exit, reattach).await?
        }
        Command::Build => {
            host.pipeline().build(false)?;
            let report = host.pipeline().wait().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_some_and(|r| r.succeeded()) {
                return Err(Error::internal("deployment did not succeed"));
            }
        }
        Command::Install { version } => {
            host.locks().begin_install(&version).await?;
            println!("{}", serde_json::to_string_pretty(&host.locks().snapshot())?);
        }
        Command::Status => {
            println!("{}", serde_json::to_string_pretty(&host.snapshot())?);
        }
    }

    Ok(())
}

async fn run(
    host: Arc<Host>,
    build: bool,
    detach_on_exit: bool,
    reattach: Option<(u32, SessionSecret)>,
) -> Result<()> {
    let server = {
        let host = host.clone();
        tokio::spawn(async move { host.run().await })
    };

    if build {
        host.pipeline().build(false)?;
        match host.pipeline().wait().await {
            Some(report) if report.succeeded() => {}
            other => {
                tracing::error!(report = ?other, "initial deployment failed");
                host.shutdown();
                return Err(Error::internal("initial deployment failed"));
            }
        }
    }

    match reattach {
        Some((pid, secret)) => host.watchdog().reattach(pid, secret).await?,
        None => host.watchdog().start().await?,
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received");

    if detach_on_exit || host.config().watchdog.detach_on_shutdown {
        if let Some(detached) = host.watchdog().detach().await? {
            // feed back as --reattach PID --secret SECRET
            println!("{} {}", detached.pid, detached.secret.as_str());
        }
    } else if let Err(e) = host.watchdog().stop().await {
        tracing::warn!(error = %e, "engine was not running");
    }

    host.shutdown();
    server
        .await
        .map_err(|e| Error::internal(format!("bridge task failed: {e}")))?
}
