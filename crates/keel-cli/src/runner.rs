use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use log::{debug, info};

use keel_common::config::{AppConfig, ExecutionMode, StreamingMode};
use keel_coordinator::coordinator::{
    CoordinatorActor, CoordinatorEvent, CoordinatorHandle, CoordinatorOptions,
};
use keel_coordinator::election::StandaloneLeaderElection;
use keel_coordinator::library::LocalArtifactStore;
use keel_server::actor::ActorHandle;

#[derive(Debug, Parser)]
#[clap(name = "keel", about = "The Keel job coordinator")]
pub struct CliArgs {
    /// The directory containing the keel.toml configuration file.
    #[clap(long)]
    pub config_dir: PathBuf,
    #[clap(long, value_enum)]
    pub execution_mode: ExecutionModeArg,
    #[clap(long, value_enum)]
    pub streaming_mode: Option<StreamingModeArg>,
    /// The host to bind the coordinator to, overriding the configuration.
    #[clap(long)]
    pub host: Option<String>,
    /// The port for the web status frontend, if one is built in.
    #[clap(long)]
    pub webui_port: Option<u16>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ExecutionModeArg {
    Cluster,
    Local,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StreamingModeArg {
    Streaming,
    Batch,
}

#[derive(Debug)]
pub enum RunnerError {
    Startup(String),
    Runtime(String),
}

impl std::fmt::Display for RunnerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerError::Startup(message) => write!(f, "startup failed: {message}"),
            RunnerError::Runtime(message) => write!(f, "runtime failure: {message}"),
        }
    }
}

pub fn main(args: CliArgs) -> Result<(), RunnerError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| RunnerError::Startup(e.to_string()))?;
    runtime.block_on(run(args))
}

async fn run(args: CliArgs) -> Result<(), RunnerError> {
    let config_file = args.config_dir.join("keel.toml");
    let mut config = AppConfig::load_with_file(&config_file.to_string_lossy())
        .map_err(|e| RunnerError::Startup(e.to_string()))?;
    config.mode = match args.execution_mode {
        ExecutionModeArg::Cluster => ExecutionMode::Cluster,
        ExecutionModeArg::Local => ExecutionMode::Local,
    };
    if let Some(streaming) = args.streaming_mode {
        config.streaming = match streaming {
            StreamingModeArg::Streaming => StreamingMode::Streaming,
            StreamingModeArg::Batch => StreamingMode::Batch,
        };
    }
    if let Some(host) = args.host {
        config.coordinator.listen_host = host;
    }
    if args.webui_port.is_some() {
        // No web monitor is compiled in; fall back silently.
        debug!("no web monitor component is available, ignoring --webui-port");
    }

    let artifact_store = Arc::new(LocalArtifactStore::new(&config.coordinator.artifact_dir));
    let election = Arc::new(StandaloneLeaderElection::new());
    let options = CoordinatorOptions::try_new(&config, artifact_store, election.clone())
        .map_err(|e| RunnerError::Startup(e.to_string()))?;

    let handle: CoordinatorHandle = ActorHandle::<CoordinatorActor>::new(options);
    election
        .start(&handle)
        .await
        .map_err(|e| RunnerError::Startup(e.to_string()))?;
    info!("coordinator is running, press Ctrl-C to shut down");

    tokio::select! {
        _ = handle.clone().wait_for_stop() => {
            // The loop only stops by itself on a poison failure.
            Err(RunnerError::Runtime(
                "the coordinator stopped unexpectedly".to_string(),
            ))
        }
        out = tokio::signal::ctrl_c() => {
            out.map_err(|e| RunnerError::Runtime(e.to_string()))?;
            info!("shutting down");
            handle
                .send(CoordinatorEvent::Shutdown)
                .await
                .map_err(|e| RunnerError::Runtime(e.to_string()))?;
            handle.wait_for_stop().await;
            Ok(())
        }
    }
}
