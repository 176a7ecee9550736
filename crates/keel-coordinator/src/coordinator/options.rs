use std::sync::Arc;
use std::time::Duration;

use keel_common::config::AppConfig;

use crate::election::{ConfirmBackoff, LeaderElection};
use crate::error::{CoordinationError, CoordinationResult};
use crate::library::ArtifactStore;

pub struct CoordinatorOptions {
    pub listen_host: String,
    pub listen_port: u16,
    pub high_availability: bool,
    pub blob_server_port: u16,
    pub default_execution_retries: usize,
    pub execution_retry_delay: Duration,
    pub session_timeout: Duration,
    pub instance_heartbeat_timeout: Duration,
    pub archive_max_count: usize,
    pub confirm_backoff: ConfirmBackoff,
    pub artifact_store: Arc<dyn ArtifactStore>,
    pub election: Arc<dyn LeaderElection>,
}

impl CoordinatorOptions {
    pub fn try_new(
        config: &AppConfig,
        artifact_store: Arc<dyn ArtifactStore>,
        election: Arc<dyn LeaderElection>,
    ) -> CoordinationResult<Self> {
        let coordinator = &config.coordinator;
        if coordinator.high_availability && coordinator.listen_port != 0 {
            return Err(CoordinationError::invalid(
                "the bind port must be 0 (ephemeral) when high availability is enabled",
            ));
        }
        Ok(Self {
            listen_host: coordinator.listen_host.clone(),
            listen_port: coordinator.listen_port,
            high_availability: coordinator.high_availability,
            blob_server_port: coordinator.blob_server_port,
            default_execution_retries: coordinator.default_execution_retries,
            execution_retry_delay: Duration::from_millis(coordinator.execution_retry_delay_ms),
            session_timeout: Duration::from_secs(coordinator.session_timeout_secs),
            instance_heartbeat_timeout: Duration::from_secs(
                coordinator.instance_heartbeat_timeout_secs,
            ),
            archive_max_count: coordinator.archive_max_count,
            confirm_backoff: ConfirmBackoff::from(&coordinator.rpc_retry_strategy),
            artifact_store,
            election,
        })
    }
}
