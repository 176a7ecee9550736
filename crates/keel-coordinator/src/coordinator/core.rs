use std::collections::HashMap;

use async_trait::async_trait;
use log::{debug, error, info};

use crate::archive::{ArchiveActor, ArchiveOptions};
use crate::coordinator::{CoordinatorActor, CoordinatorEvent, CoordinatorOptions, LeadershipState};
use crate::error::CoordinationError;
use crate::instance::InstanceManager;
use crate::library::LibraryCacheManager;
use crate::protocol::ClusterMessage;
use crate::scheduler::Scheduler;
use keel_server::actor::{Actor, ActorAction, ActorContext, ActorHandle};

#[async_trait]
impl Actor for CoordinatorActor {
    type Message = CoordinatorEvent;
    type Options = CoordinatorOptions;
    type Error = CoordinationError;

    fn name() -> &'static str {
        "CoordinatorActor"
    }

    fn new(options: CoordinatorOptions) -> Self {
        let instance_manager = InstanceManager::new(options.instance_heartbeat_timeout);
        let archive = ActorHandle::<ArchiveActor>::new(ArchiveOptions {
            max_count: options.archive_max_count,
        });
        Self {
            options,
            leadership: LeadershipState::Standby,
            jobs: HashMap::new(),
            instance_manager,
            scheduler: Scheduler::new(),
            library_cache: LibraryCacheManager::new(),
            archive,
        }
    }

    async fn start(&mut self, _: &mut ActorContext<Self>) -> Result<(), Self::Error> {
        info!(
            "coordinator started on {}:{} in standby",
            self.options.listen_host, self.options.listen_port
        );
        Ok(())
    }

    fn receive(
        &mut self,
        ctx: &mut ActorContext<Self>,
        message: CoordinatorEvent,
    ) -> Result<ActorAction, Self::Error> {
        match message {
            CoordinatorEvent::GrantLeadership { session } => {
                Ok(self.handle_grant_leadership(ctx, session))
            }
            CoordinatorEvent::LeadershipConfirmed { session } => {
                Ok(self.handle_leadership_confirmed(session))
            }
            CoordinatorEvent::RevokeLeadership => Ok(self.handle_revoke_leadership()),
            CoordinatorEvent::ElectionError { message } => {
                // A broken election service leaves no safe way to continue;
                // the supervisor restarts or replaces the coordinator.
                Err(CoordinationError::internal(format!(
                    "leader election service failed: {message}"
                )))
            }
            CoordinatorEvent::Message { session, message } => {
                if self.leadership.current_session() != Some(session) {
                    debug!("dropping message with stale leader session {session}");
                    return Ok(ActorAction::Continue);
                }
                self.handle_cluster_message(ctx, message)
            }
            CoordinatorEvent::WorkerTerminated { instance_id } => {
                Ok(self.handle_worker_terminated(ctx, instance_id))
            }
            CoordinatorEvent::ProbeInstanceHeartbeat {
                instance_id,
                watermark,
            } => Ok(self.handle_probe_instance_heartbeat(ctx, instance_id, watermark)),
            CoordinatorEvent::SubmissionPrepared { submission } => {
                Ok(self.handle_submission_prepared(ctx, submission))
            }
            CoordinatorEvent::JobStatusChanged {
                job_id,
                status,
                timestamp,
                error,
            } => self.handle_job_status_changed(ctx, job_id, status, timestamp, error),
            CoordinatorEvent::RestartJob { job_id } => Ok(self.handle_restart_job(ctx, job_id)),
            CoordinatorEvent::TriggerCheckpoint { job_id } => {
                Ok(self.handle_trigger_checkpoint(ctx, job_id))
            }
            CoordinatorEvent::ProbeCheckpointTimeout {
                job_id,
                checkpoint_id,
            } => Ok(self.handle_probe_checkpoint_timeout(job_id, checkpoint_id)),
            CoordinatorEvent::ProbeSessionTimeout { job_id, watermark } => {
                Ok(self.handle_probe_session_timeout(ctx, job_id, watermark))
            }
            CoordinatorEvent::Shutdown => Ok(ActorAction::Stop),
        }
    }

    async fn stop(mut self, _: &mut ActorContext<Self>) -> Result<(), Self::Error> {
        info!("coordinator is shutting down");
        // Shutdown order: jobs and their timers first, then scheduling
        // capacity, then the artifact cache, and the election client last.
        self.cancel_and_clear("coordinator is shutting down");
        let session = self.leadership.current_session();
        for instance in self.instance_manager.drain() {
            if let Some(session) = session {
                Self::send_gateway_message(
                    &instance.gateway,
                    session,
                    crate::protocol::TaskManagerMessage::Disconnect {
                        reason: "coordinator is shutting down".to_string(),
                    },
                );
            }
        }
        self.leadership = LeadershipState::Standby;
        self.scheduler.shutdown();
        self.library_cache.shutdown();
        if let Err(e) = self.options.election.stop().await {
            error!("failed to stop the leader election client: {e}");
        }
        Ok(())
    }
}

impl CoordinatorActor {
    pub(super) fn handle_cluster_message(
        &mut self,
        ctx: &mut ActorContext<Self>,
        message: ClusterMessage,
    ) -> Result<ActorAction, CoordinationError> {
        match message {
            ClusterMessage::RegisterTaskManager {
                connection,
                hardware,
                slot_count,
                gateway,
                reply,
            } => Ok(self.handle_register_task_manager(
                ctx, connection, hardware, slot_count, gateway, reply,
            )),
            ClusterMessage::Heartbeat {
                instance_id,
                metrics,
                accumulators,
            } => Ok(self.handle_heartbeat(ctx, instance_id, metrics, accumulators)),
            ClusterMessage::Disconnect {
                instance_id,
                reason,
            } => Ok(self.handle_disconnect(ctx, instance_id, reason)),
            ClusterMessage::SubmitJob {
                graph,
                mode,
                client,
            } => Ok(self.handle_submit_job(ctx, graph, mode, client)),
            ClusterMessage::CancelJob { job_id, reply } => {
                Ok(self.handle_cancel_job(ctx, job_id, reply))
            }
            ClusterMessage::UpdateTaskExecutionState { state, reply } => {
                Ok(self.handle_update_task_execution_state(ctx, state, reply))
            }
            ClusterMessage::RequestNextInputSplit {
                job_id,
                vertex_id,
                attempt_id,
                reply,
            } => Ok(self.handle_request_next_input_split(ctx, job_id, vertex_id, attempt_id, reply)),
            ClusterMessage::ScheduleOrUpdateConsumers {
                job_id,
                partition_id,
                reply,
            } => Ok(self.handle_schedule_or_update_consumers(ctx, job_id, partition_id, reply)),
            ClusterMessage::RequestPartitionState {
                job_id,
                partition_id,
                consumer_attempt_id,
                result_id,
                reply,
            } => Ok(self.handle_request_partition_state(
                job_id,
                partition_id,
                consumer_attempt_id,
                result_id,
                reply,
            )),
            ClusterMessage::Checkpoint(message) => Ok(self.handle_checkpoint_message(message)),
            ClusterMessage::RequestStackTrace { instance_id, reply } => {
                Ok(self.handle_request_stack_trace(instance_id, reply))
            }
            ClusterMessage::RequestJobStatus { job_id, reply } => {
                Ok(self.handle_request_job_status(ctx, job_id, reply))
            }
            ClusterMessage::RequestRunningJobs { reply } => {
                Ok(self.handle_request_running_jobs(reply))
            }
            ClusterMessage::RequestOverview { reply } => {
                Ok(self.handle_request_overview(ctx, reply))
            }
        }
    }
}
