use log::{debug, error, info, warn};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::archive::ArchiveEvent;
use crate::coordinator::{CoordinatorActor, CoordinatorEvent, LeadershipState};
use crate::election::confirm_with_retry;
use crate::error::{CoordinationError, CoordinationResult, JobFailureCause, JobFailureKind};
use crate::graph::{CheckpointAckResult, GraphAction, JobStatus};
use crate::id::{
    CheckpointId, ExecutionAttemptId, InstanceId, JobId, JobVertexId, LeaderSessionId, PartitionId,
    ResultId,
};
use crate::instance::Instance;
use crate::protocol::{
    AccumulatorSnapshot, CancellationResponse, CheckpointMessage, ClientMessage, ClusterOverview,
    HardwareDescription, InstanceConnectionInfo, JobStatusResponse, JobSummary, NextInputSplit,
    PartitionStateResponse, RegistrationResponse, SerializedJobExecutionResult,
    TaskExecutionState, TaskManagerEnvelope, TaskManagerGateway, TaskManagerMessage,
};
use crate::scheduler::{Slot, SlotRequest};
use crate::splits::serialize_split;
use keel_common::datetime::current_time_millis;
use keel_server::actor::{ActorAction, ActorContext};

impl CoordinatorActor {
    // ------------------------------------------------------------------
    // Leadership
    // ------------------------------------------------------------------

    pub(super) fn handle_grant_leadership(
        &mut self,
        ctx: &mut ActorContext<Self>,
        session: LeaderSessionId,
    ) -> ActorAction {
        info!("granted leadership with session {session}, confirming");
        self.leadership = LeadershipState::Confirming { session };
        let election = self.options.election.clone();
        let backoff = self.options.confirm_backoff.clone();
        let handle = ctx.handle().clone();
        // Confirmation may block on the election backend; it must not run
        // on the event loop.
        ctx.spawn(async move {
            match confirm_with_retry(election.as_ref(), session, &backoff).await {
                Ok(()) => {
                    handle
                        .send(CoordinatorEvent::LeadershipConfirmed { session })
                        .await
                }
                Err(e) => {
                    handle
                        .send(CoordinatorEvent::ElectionError {
                            message: e.to_string(),
                        })
                        .await
                }
            }
        });
        ActorAction::Continue
    }

    pub(super) fn handle_leadership_confirmed(&mut self, session: LeaderSessionId) -> ActorAction {
        match &self.leadership {
            LeadershipState::Confirming { session: expected } if *expected == session => {
                info!("leadership confirmed with session {session}");
                self.leadership = LeadershipState::Leading { session };
            }
            _ => {
                warn!("ignoring stale leadership confirmation for session {session}");
            }
        }
        ActorAction::Continue
    }

    pub(super) fn handle_revoke_leadership(&mut self) -> ActorAction {
        if matches!(self.leadership, LeadershipState::Standby) {
            return ActorAction::Continue;
        }
        info!("leadership revoked, moving to standby");
        let session = self.leadership.current_session();
        self.cancel_and_clear("coordinator is no longer the leader");
        for instance in self.instance_manager.drain() {
            if let Some(session) = session {
                Self::send_gateway_message(
                    &instance.gateway,
                    session,
                    TaskManagerMessage::Disconnect {
                        reason: "coordinator is no longer the leader".to_string(),
                    },
                );
            }
        }
        self.scheduler.shutdown();
        self.leadership = LeadershipState::Standby;
        ActorAction::Continue
    }

    /// Fails every live job, answers waiting clients, and clears the table.
    pub(super) fn cancel_and_clear(&mut self, cause: &str) {
        for (job_id, mut entry) in self.jobs.drain() {
            entry.graph.fail(cause);
            if let Some(client) = &entry.info.client {
                let _ = client.send(ClientMessage::JobResultFailure {
                    job_id,
                    cause: JobFailureCause {
                        kind: JobFailureKind::Execution,
                        message: format!("All jobs are cancelled and cleared: {cause}"),
                    },
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // Worker registration and liveness
    // ------------------------------------------------------------------

    pub(super) fn handle_register_task_manager(
        &mut self,
        ctx: &mut ActorContext<Self>,
        connection: InstanceConnectionInfo,
        hardware: HardwareDescription,
        slot_count: usize,
        gateway: TaskManagerGateway,
        reply: oneshot::Sender<RegistrationResponse>,
    ) -> ActorAction {
        if let Some(existing) = self.instance_manager.registered_instance(&connection) {
            let _ = reply.send(RegistrationResponse::AlreadyRegistered {
                instance_id: existing,
                blob_server_port: self.options.blob_server_port,
            });
            return ActorAction::Continue;
        }
        match self
            .instance_manager
            .register(connection, hardware, slot_count, gateway.clone())
        {
            Ok(instance_id) => {
                let _ = reply.send(RegistrationResponse::AcknowledgeRegistration {
                    instance_id,
                    blob_server_port: self.options.blob_server_port,
                });
                let slots = self
                    .instance_manager
                    .instance(instance_id)
                    .map(Instance::slots)
                    .unwrap_or_default();
                let fulfilled = self.scheduler.instance_registered(slots);
                self.deploy_fulfilled(ctx, fulfilled);
                // Watch the worker's liveness channel: the back-channel
                // closing means the worker process is gone.
                let handle = ctx.handle().clone();
                let closed = gateway.clone();
                ctx.spawn(async move {
                    closed.closed().await;
                    handle
                        .send(CoordinatorEvent::WorkerTerminated { instance_id })
                        .await
                });
                ctx.send_with_delay(
                    CoordinatorEvent::ProbeInstanceHeartbeat {
                        instance_id,
                        watermark: Instant::now(),
                    },
                    self.instance_manager.heartbeat_timeout(),
                );
            }
            Err(e) => {
                let _ = reply.send(RegistrationResponse::RefuseRegistration {
                    reason: e.to_string(),
                });
            }
        }
        ActorAction::Continue
    }

    pub(super) fn handle_heartbeat(
        &mut self,
        ctx: &mut ActorContext<Self>,
        instance_id: InstanceId,
        metrics: Vec<u8>,
        accumulators: Vec<AccumulatorSnapshot>,
    ) -> ActorAction {
        if let Some(watermark) = self.instance_manager.record_heartbeat(instance_id, metrics) {
            ctx.send_with_delay(
                CoordinatorEvent::ProbeInstanceHeartbeat {
                    instance_id,
                    watermark,
                },
                self.instance_manager.heartbeat_timeout(),
            );
        }
        for snapshot in accumulators {
            match self.jobs.get_mut(&snapshot.job_id) {
                Some(entry) => entry.graph.merge_accumulators(snapshot),
                None => debug!(
                    "discarding accumulators for unknown job {}",
                    snapshot.job_id
                ),
            }
        }
        ActorAction::Continue
    }

    pub(super) fn handle_probe_instance_heartbeat(
        &mut self,
        ctx: &mut ActorContext<Self>,
        instance_id: InstanceId,
        watermark: Instant,
    ) -> ActorAction {
        if self.instance_manager.is_heartbeat_stale(instance_id, watermark) {
            warn!("instance {instance_id} missed its heartbeat deadline");
            return self.handle_worker_terminated(ctx, instance_id);
        }
        ActorAction::Continue
    }

    pub(super) fn handle_disconnect(
        &mut self,
        ctx: &mut ActorContext<Self>,
        instance_id: InstanceId,
        reason: String,
    ) -> ActorAction {
        info!("instance {instance_id} disconnected: {reason}");
        self.handle_worker_terminated(ctx, instance_id)
    }

    pub(super) fn handle_worker_terminated(
        &mut self,
        ctx: &mut ActorContext<Self>,
        instance_id: InstanceId,
    ) -> ActorAction {
        let Some(instance) = self.instance_manager.unregister(instance_id) else {
            return ActorAction::Continue;
        };
        let affected = self.scheduler.instance_unregistered(instance_id);
        let cause = format!(
            "task manager at {} (instance {instance_id}) terminated",
            instance.connection
        );
        for (job_id, attempt_id) in affected {
            let actions = match self.jobs.get_mut(&job_id) {
                Some(entry) => {
                    let (_, actions) = entry.graph.update_execution_state(&TaskExecutionState {
                        job_id,
                        attempt_id,
                        state: crate::graph::execution::ExecutionState::Failed,
                        error: Some(cause.clone()),
                    });
                    actions
                }
                None => vec![],
            };
            self.run_graph_actions(ctx, actions);
        }
        ActorAction::Continue
    }

    // ------------------------------------------------------------------
    // Job control
    // ------------------------------------------------------------------

    pub(super) fn handle_cancel_job(
        &mut self,
        ctx: &mut ActorContext<Self>,
        job_id: JobId,
        reply: oneshot::Sender<CancellationResponse>,
    ) -> ActorAction {
        match self.jobs.get_mut(&job_id) {
            Some(entry) => {
                let _ = reply.send(CancellationResponse::Success { job_id });
                let actions = entry.graph.cancel();
                self.scheduler.cancel_queued_requests(job_id);
                self.run_graph_actions(ctx, actions);
            }
            None => {
                let _ = reply.send(CancellationResponse::Failure {
                    job_id,
                    reason: format!("No job found with id {job_id}"),
                });
            }
        }
        ActorAction::Continue
    }

    pub(super) fn handle_update_task_execution_state(
        &mut self,
        ctx: &mut ActorContext<Self>,
        state: Option<TaskExecutionState>,
        reply: oneshot::Sender<bool>,
    ) -> ActorAction {
        let Some(state) = state else {
            let _ = reply.send(false);
            return ActorAction::Continue;
        };
        let Some(entry) = self.jobs.get_mut(&state.job_id) else {
            debug!(
                "received task state update for unknown job {}",
                state.job_id
            );
            let _ = reply.send(false);
            return ActorAction::Continue;
        };
        let (accepted, actions) = entry.graph.update_execution_state(&state);
        let _ = reply.send(accepted);
        self.run_graph_actions(ctx, actions);
        ActorAction::Continue
    }

    pub(super) fn handle_request_next_input_split(
        &mut self,
        ctx: &mut ActorContext<Self>,
        job_id: JobId,
        vertex_id: JobVertexId,
        attempt_id: ExecutionAttemptId,
        reply: oneshot::Sender<NextInputSplit>,
    ) -> ActorAction {
        let Some(entry) = self.jobs.get_mut(&job_id) else {
            debug!("input split request for unknown job {job_id}");
            let _ = reply.send(NextInputSplit { data: None });
            return ActorAction::Continue;
        };
        let split = entry.graph.next_input_split(vertex_id, attempt_id);
        match serialize_split(split.as_ref()) {
            Ok(data) => {
                let _ = reply.send(NextInputSplit { data });
            }
            Err(e) => {
                error!("failed to serialize input split for vertex {vertex_id}: {e}");
                let actions = entry
                    .graph
                    .fail(&format!("input split serialization failed for vertex {vertex_id}: {e}"));
                let _ = reply.send(NextInputSplit { data: None });
                self.run_graph_actions(ctx, actions);
            }
        }
        ActorAction::Continue
    }

    pub(super) fn handle_schedule_or_update_consumers(
        &mut self,
        ctx: &mut ActorContext<Self>,
        job_id: JobId,
        partition_id: PartitionId,
        reply: oneshot::Sender<CoordinationResult<()>>,
    ) -> ActorAction {
        let Some(entry) = self.jobs.get_mut(&job_id) else {
            let _ = reply.send(Err(CoordinationError::internal(format!(
                "cannot find job {job_id} to schedule consumers"
            ))));
            return ActorAction::Continue;
        };
        let _ = reply.send(Ok(()));
        match entry
            .graph
            .schedule_or_update_consumers(partition_id, &mut self.scheduler)
        {
            Ok(actions) => self.run_graph_actions(ctx, actions),
            Err(e) => {
                warn!("failed to schedule consumers of partition {partition_id}: {e}");
            }
        }
        ActorAction::Continue
    }

    pub(super) fn handle_request_partition_state(
        &mut self,
        job_id: JobId,
        partition_id: PartitionId,
        _consumer_attempt_id: ExecutionAttemptId,
        result_id: ResultId,
        reply: oneshot::Sender<PartitionStateResponse>,
    ) -> ActorAction {
        // A missing job is not an error here: the producer may simply be
        // gone already.
        let state = self
            .jobs
            .get(&job_id)
            .and_then(|entry| entry.graph.partition_state(partition_id));
        let _ = reply.send(PartitionStateResponse {
            result_id,
            partition_id,
            state,
        });
        ActorAction::Continue
    }

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    pub(super) fn handle_checkpoint_message(&mut self, message: CheckpointMessage) -> ActorAction {
        match message {
            CheckpointMessage::Acknowledge {
                job_id,
                checkpoint_id,
                attempt_id,
            } => {
                let Some(entry) = self.jobs.get_mut(&job_id) else {
                    debug!("checkpoint acknowledgment for unknown job {job_id}");
                    return ActorAction::Continue;
                };
                let now = current_time_millis();
                match entry.graph.acknowledge_checkpoint(checkpoint_id, attempt_id, now) {
                    CheckpointAckResult::Completed {
                        checkpoint,
                        confirmations,
                    } => {
                        self.send_stamped_to_all(
                            confirmations,
                            |attempt_id| TaskManagerMessage::ConfirmCheckpoint {
                                job_id,
                                checkpoint_id: checkpoint.checkpoint_id,
                                timestamp: checkpoint.timestamp,
                                attempt_id,
                            },
                        );
                    }
                    CheckpointAckResult::NoCoordinator => {
                        error!(
                            "received checkpoint acknowledgment for job {job_id} \
                             which has no checkpoint coordinator"
                        );
                    }
                    // Duplicates are discarded silently; unknown ids are
                    // logged inside the checkpoint coordinator.
                    CheckpointAckResult::Pending
                    | CheckpointAckResult::Duplicate
                    | CheckpointAckResult::Unknown => {}
                }
            }
            CheckpointMessage::Decline {
                job_id,
                checkpoint_id,
                attempt_id,
                reason,
            } => {
                if let Some(entry) = self.jobs.get_mut(&job_id) {
                    if !entry.graph.decline_checkpoint(checkpoint_id, &reason) {
                        debug!(
                            "attempt {attempt_id} declined unknown checkpoint {checkpoint_id}"
                        );
                    }
                }
            }
        }
        ActorAction::Continue
    }

    pub(super) fn handle_trigger_checkpoint(
        &mut self,
        ctx: &mut ActorContext<Self>,
        job_id: JobId,
    ) -> ActorAction {
        let Some(entry) = self.jobs.get_mut(&job_id) else {
            // The job is gone; the periodic trigger chain ends here.
            return ActorAction::Continue;
        };
        if entry.graph.is_terminal() {
            return ActorAction::Continue;
        }
        let Some(coordinator) = entry.graph.checkpoint_coordinator() else {
            return ActorAction::Continue;
        };
        let interval = coordinator.interval();
        let timeout = coordinator.timeout();
        match entry.graph.trigger_checkpoint(current_time_millis()) {
            Ok(Some(plan)) => {
                let checkpoint_id = plan.checkpoint_id;
                let timestamp = plan.timestamp;
                self.send_stamped_to_all(plan.triggers, |attempt_id| {
                    TaskManagerMessage::TriggerCheckpoint {
                        job_id,
                        checkpoint_id,
                        timestamp,
                        attempt_id,
                    }
                });
                ctx.send_with_delay(
                    CoordinatorEvent::ProbeCheckpointTimeout {
                        job_id,
                        checkpoint_id,
                    },
                    timeout,
                );
            }
            Ok(None) => {
                debug!("skipping checkpoint trigger for job {job_id}");
            }
            Err(e) => {
                error!("failed to trigger checkpoint for job {job_id}: {e}");
            }
        }
        ctx.send_with_delay(CoordinatorEvent::TriggerCheckpoint { job_id }, interval);
        ActorAction::Continue
    }

    pub(super) fn handle_probe_checkpoint_timeout(
        &mut self,
        job_id: JobId,
        checkpoint_id: CheckpointId,
    ) -> ActorAction {
        if let Some(entry) = self.jobs.get_mut(&job_id) {
            entry.graph.expire_checkpoint(checkpoint_id);
        }
        ActorAction::Continue
    }

    // ------------------------------------------------------------------
    // Job termination and archiving
    // ------------------------------------------------------------------

    pub(super) fn handle_job_status_changed(
        &mut self,
        ctx: &mut ActorContext<Self>,
        job_id: JobId,
        status: JobStatus,
        timestamp: u64,
        error: Option<String>,
    ) -> Result<ActorAction, CoordinationError> {
        let Some(entry) = self.jobs.get_mut(&job_id) else {
            // Idempotent removal for jobs already gone from the live table.
            self.remove_job(ctx, job_id);
            return Ok(ActorAction::Continue);
        };
        entry.graph.set_status_timestamp(status, timestamp);
        if entry.info.listening_mode.wants_state_changes() {
            if let Some(client) = &entry.info.client {
                let _ = client.send(ClientMessage::JobStatusChanged {
                    job_id,
                    status,
                    timestamp,
                    error: error.clone(),
                });
            }
        }
        if status == JobStatus::Restarting {
            let delay = entry.graph.retry_delay();
            info!("job {job_id} restarts in {delay:?}");
            ctx.send_with_delay(CoordinatorEvent::RestartJob { job_id }, delay);
            return Ok(ActorAction::Continue);
        }
        if !status.is_terminal() {
            return Ok(ActorAction::Continue);
        }
        entry.info.end = Some(timestamp);
        let mut poison = None;
        if let Some(client) = entry.info.client.clone() {
            let (message, failure) = Self::terminal_result_message(
                &entry.graph,
                status,
                entry.info.start,
                timestamp,
                error.as_deref(),
            );
            let _ = client.send(message);
            poison = failure;
        }
        if let Some(poison) = poison {
            return Err(poison);
        }
        if entry.info.session_alive {
            entry.info.last_active = Instant::now();
            let watermark = entry.info.last_active;
            ctx.send_with_delay(
                CoordinatorEvent::ProbeSessionTimeout { job_id, watermark },
                entry.info.session_timeout,
            );
        } else {
            self.remove_job(ctx, job_id);
        }
        Ok(ActorAction::Continue)
    }

    /// Builds the client reply for a terminal status. The second value is
    /// the poison for a status that is not actually terminal: the reply is
    /// sent first, then the coordinator crashes on the programming error.
    pub(super) fn terminal_result_message(
        graph: &crate::graph::ExecutionGraph,
        status: JobStatus,
        start: u64,
        timestamp: u64,
        error: Option<&str>,
    ) -> (ClientMessage, Option<CoordinationError>) {
        let job_id = graph.job_id();
        match status {
            JobStatus::Finished => match graph.serialized_accumulator_results() {
                Ok(accumulator_results) => (
                    ClientMessage::JobResultSuccess {
                        result: SerializedJobExecutionResult {
                            job_id,
                            net_runtime_ms: timestamp.saturating_sub(start),
                            accumulator_results,
                        },
                    },
                    None,
                ),
                Err(e) => {
                    error!("failed to retrieve accumulator results for job {job_id}: {e}");
                    (
                        ClientMessage::JobResultFailure {
                            job_id,
                            cause: JobFailureCause {
                                kind: JobFailureKind::Execution,
                                message: "Failed to retrieve accumulator results".to_string(),
                            },
                        },
                        None,
                    )
                }
            },
            JobStatus::Canceled => (
                ClientMessage::JobResultFailure {
                    job_id,
                    cause: JobFailureCause {
                        kind: JobFailureKind::Cancellation,
                        message: match error {
                            Some(e) => format!("Job was cancelled. {e}"),
                            None => "Job was cancelled.".to_string(),
                        },
                    },
                },
                None,
            ),
            JobStatus::Failed => (
                ClientMessage::JobResultFailure {
                    job_id,
                    cause: JobFailureCause {
                        kind: JobFailureKind::Execution,
                        message: match error {
                            Some(e) => format!("Job execution failed. {e}"),
                            None => "Job execution failed.".to_string(),
                        },
                    },
                },
                None,
            ),
            other => (
                ClientMessage::JobResultFailure {
                    job_id,
                    cause: JobFailureCause {
                        kind: JobFailureKind::Execution,
                        message: format!("{other} is not a terminal state"),
                    },
                },
                Some(CoordinationError::internal(format!(
                    "{other} is not a terminal state"
                ))),
            ),
        }
    }

    pub(super) fn handle_probe_session_timeout(
        &mut self,
        ctx: &mut ActorContext<Self>,
        job_id: JobId,
        watermark: Instant,
    ) -> ActorAction {
        let expired = self
            .jobs
            .get(&job_id)
            .is_some_and(|entry| entry.info.last_active == watermark);
        if expired {
            info!("session for job {job_id} expired");
            self.remove_job(ctx, job_id);
        }
        ActorAction::Continue
    }

    /// Takes the job out of the live table, hands the graph to the archive,
    /// and releases its artifacts. All failures are logged, never fatal.
    pub(super) fn remove_job(&mut self, ctx: &mut ActorContext<Self>, job_id: JobId) {
        let Some(mut entry) = self.jobs.remove(&job_id) else {
            return;
        };
        self.scheduler.cancel_queued_requests(job_id);
        entry.graph.prepare_for_archiving();
        let archive = self.archive.clone();
        let graph = Box::new(entry.graph);
        ctx.spawn(async move {
            if let Err(e) = archive.send(ArchiveEvent::Archive { graph }).await {
                error!("failed to archive job {job_id}: {e}");
            }
            Ok(())
        });
        if !self.library_cache.unregister_job(job_id) {
            debug!("job {job_id} had no entry in the library cache");
        }
    }

    pub(super) fn handle_restart_job(
        &mut self,
        ctx: &mut ActorContext<Self>,
        job_id: JobId,
    ) -> ActorAction {
        let actions = {
            let Some(entry) = self.jobs.get_mut(&job_id) else {
                return ActorAction::Continue;
            };
            if entry.graph.status() != JobStatus::Restarting {
                debug!(
                    "job {job_id} is no longer restarting ({})",
                    entry.graph.status()
                );
                return ActorAction::Continue;
            }
            if let Err(e) = entry.graph.restart() {
                error!("failed to restart job {job_id}: {e}");
                entry.graph.fail(&e.to_string())
            } else {
                match entry.graph.schedule_for_execution(&mut self.scheduler) {
                    Ok(actions) => actions,
                    Err(e) => entry.graph.fail(&e.to_string()),
                }
            }
        };
        self.run_graph_actions(ctx, actions);
        ActorAction::Continue
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub(super) fn handle_request_job_status(
        &mut self,
        ctx: &mut ActorContext<Self>,
        job_id: JobId,
        reply: oneshot::Sender<JobStatusResponse>,
    ) -> ActorAction {
        if let Some(entry) = self.jobs.get(&job_id) {
            let _ = reply.send(JobStatusResponse::Found {
                job_id,
                status: entry.graph.status(),
            });
            return ActorAction::Continue;
        }
        // Not live: ask the archive off the loop and reply from there.
        let archive = self.archive.clone();
        ctx.spawn(async move {
            let (tx, rx) = oneshot::channel();
            archive
                .send(ArchiveEvent::RequestJobStatus { job_id, reply: tx })
                .await?;
            let response = match rx.await {
                Ok(Some(status)) => JobStatusResponse::Found { job_id, status },
                _ => JobStatusResponse::NotFound { job_id },
            };
            let _ = reply.send(response);
            Ok(())
        });
        ActorAction::Continue
    }

    pub(super) fn handle_request_running_jobs(
        &mut self,
        reply: oneshot::Sender<Vec<JobSummary>>,
    ) -> ActorAction {
        let summaries = self
            .jobs
            .values()
            .filter(|entry| !entry.graph.is_terminal())
            .map(|entry| entry.graph.summary())
            .collect();
        let _ = reply.send(summaries);
        ActorAction::Continue
    }

    pub(super) fn handle_request_overview(
        &mut self,
        ctx: &mut ActorContext<Self>,
        reply: oneshot::Sender<ClusterOverview>,
    ) -> ActorAction {
        // Snapshot the live state synchronously, then join the archive
        // counts off the loop.
        let mut overview = ClusterOverview {
            instances: self.instance_manager.count_registered(),
            total_slots: self.scheduler.total_slots(),
            available_slots: self.scheduler.available_slots(),
            ..Default::default()
        };
        for entry in self.jobs.values() {
            match entry.graph.status() {
                JobStatus::Finished => overview.jobs_finished += 1,
                JobStatus::Canceled => overview.jobs_cancelled += 1,
                JobStatus::Failed => overview.jobs_failed += 1,
                _ => overview.jobs_running += 1,
            }
        }
        let archive = self.archive.clone();
        ctx.spawn(async move {
            let (tx, rx) = oneshot::channel();
            archive
                .send(ArchiveEvent::RequestCounts { reply: tx })
                .await?;
            if let Ok(counts) = rx.await {
                overview.jobs_finished += counts.finished;
                overview.jobs_cancelled += counts.canceled;
                overview.jobs_failed += counts.failed;
            }
            let _ = reply.send(overview);
            Ok(())
        });
        ActorAction::Continue
    }

    pub(super) fn handle_request_stack_trace(
        &mut self,
        instance_id: InstanceId,
        reply: oneshot::Sender<Vec<u8>>,
    ) -> ActorAction {
        // The coordinator only forwards; the worker answers through the
        // requester's reply channel. An unknown instance drops the reply,
        // which the requester observes as a closed channel.
        if let Some(instance) = self.instance_manager.instance(instance_id) {
            if let Some(session) = self.leadership.current_session() {
                Self::send_gateway_message(
                    &instance.gateway,
                    session,
                    TaskManagerMessage::RequestStackTrace { reply },
                );
            }
        }
        ActorAction::Continue
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    /// Interprets the side effects of a graph transition: sends deployments
    /// and cancellations to workers and returns released slots to the
    /// scheduler, deploying any queued requests they fulfill.
    pub(super) fn run_graph_actions(
        &mut self,
        ctx: &mut ActorContext<Self>,
        actions: Vec<GraphAction>,
    ) {
        for action in actions {
            match action {
                GraphAction::Deploy {
                    gateway,
                    deployment,
                } => {
                    if let Some(session) = self.leadership.current_session() {
                        Self::send_gateway_message(
                            &gateway,
                            session,
                            TaskManagerMessage::SubmitTask { deployment },
                        );
                    } else {
                        warn!("not deploying task without a confirmed leader session");
                    }
                }
                GraphAction::CancelTask {
                    gateway,
                    attempt_id,
                } => {
                    if let Some(session) = self.leadership.current_session() {
                        Self::send_gateway_message(
                            &gateway,
                            session,
                            TaskManagerMessage::CancelTask { attempt_id },
                        );
                    }
                }
                GraphAction::ReleaseSlot { attempt_id } => {
                    let fulfilled = self.scheduler.release(attempt_id);
                    self.deploy_fulfilled(ctx, fulfilled);
                }
            }
        }
    }

    /// Deploys queued slot requests that became satisfiable. A request
    /// whose attempt no longer waits for a slot hands its slot back, which
    /// may in turn fulfill further requests.
    pub(super) fn deploy_fulfilled(
        &mut self,
        ctx: &mut ActorContext<Self>,
        fulfilled: Vec<(SlotRequest, Slot)>,
    ) {
        let mut pending = fulfilled;
        while let Some((request, slot)) = pending.pop() {
            let deploy = match self.jobs.get_mut(&request.job_id) {
                Some(entry) => entry.graph.deploy_to_slot(request.attempt_id, slot.clone()),
                None => Ok(None),
            };
            match deploy {
                Ok(Some(action)) => self.run_graph_actions(ctx, vec![action]),
                Ok(None) => {
                    pending.extend(self.scheduler.return_slot(request.attempt_id, slot));
                }
                Err(e) => {
                    warn!(
                        "failed to deploy queued attempt {}: {e}",
                        request.attempt_id
                    );
                    pending.extend(self.scheduler.return_slot(request.attempt_id, slot));
                }
            }
        }
    }

    pub(super) fn send_stamped_to_all<F>(
        &mut self,
        targets: Vec<(TaskManagerGateway, ExecutionAttemptId)>,
        message: F,
    ) where
        F: Fn(ExecutionAttemptId) -> TaskManagerMessage,
    {
        let Some(session) = self.leadership.current_session() else {
            warn!("dropping outbound messages without a confirmed leader session");
            return;
        };
        for (gateway, attempt_id) in targets {
            Self::send_gateway_message(&gateway, session, message(attempt_id));
        }
    }

    /// Stamps an outbound message with the leader session and sends it on
    /// the worker back-channel.
    pub(super) fn send_gateway_message(
        gateway: &TaskManagerGateway,
        session: LeaderSessionId,
        message: TaskManagerMessage,
    ) {
        if gateway
            .send(TaskManagerEnvelope { session, message })
            .is_err()
        {
            debug!("task manager back-channel is closed");
        }
    }
}
