pub mod execution;
pub mod vertex;

use std::collections::HashMap;
use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::checkpoint::{CheckpointAck, CheckpointCoordinator, CompletedCheckpoint};
use crate::error::{CoordinationError, CoordinationResult};
use crate::graph::execution::ExecutionState;
use crate::graph::vertex::ExecutionJobVertex;
use crate::id::{CheckpointId, ExecutionAttemptId, JobId, JobVertexId, PartitionId};
use crate::jobgraph::{CheckpointSettings, ScheduleMode};
use crate::library::UserCodeContext;
use crate::protocol::{
    AccumulatorSnapshot, JobSummary, TaskDeploymentDescriptor, TaskExecutionState,
    TaskManagerGateway,
};
use crate::scheduler::{Scheduler, Slot, SlotAllocation, SlotRequest};
use crate::splits::InputSplit;
use keel_common::datetime::current_time_millis;

/// The lifecycle state of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Created,
    Running,
    Failing,
    Failed,
    Cancelling,
    Canceled,
    Finished,
    Restarting,
    Suspended,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Canceled | JobStatus::Failed | JobStatus::Suspended
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobStatus::Created => "CREATED",
            JobStatus::Running => "RUNNING",
            JobStatus::Failing => "FAILING",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelling => "CANCELLING",
            JobStatus::Canceled => "CANCELED",
            JobStatus::Finished => "FINISHED",
            JobStatus::Restarting => "RESTARTING",
            JobStatus::Suspended => "SUSPENDED",
        };
        write!(f, "{name}")
    }
}

/// Posted to status listeners on every job state transition.
/// The job id is the only link back to the coordinator's tables.
#[derive(Debug, Clone)]
pub struct JobStatusChange {
    pub job_id: JobId,
    pub status: JobStatus,
    pub timestamp: u64,
    pub error: Option<String>,
}

/// Posted to execution listeners on every attempt state transition.
#[derive(Debug, Clone)]
pub struct ExecutionStateChange {
    pub job_id: JobId,
    pub vertex_id: JobVertexId,
    pub subtask_index: usize,
    pub attempt_id: ExecutionAttemptId,
    pub state: ExecutionState,
    pub error: Option<String>,
}

/// Side effects produced by graph transitions, interpreted by the
/// coordinator on the event loop (gateway sends are stamped there).
pub enum GraphAction {
    Deploy {
        gateway: TaskManagerGateway,
        deployment: TaskDeploymentDescriptor,
    },
    CancelTask {
        gateway: TaskManagerGateway,
        attempt_id: ExecutionAttemptId,
    },
    ReleaseSlot {
        attempt_id: ExecutionAttemptId,
    },
}

/// A triggered checkpoint: barrier messages to send and the timeout to arm.
pub struct CheckpointTriggerPlan {
    pub checkpoint_id: CheckpointId,
    pub timestamp: u64,
    pub triggers: Vec<(TaskManagerGateway, ExecutionAttemptId)>,
}

/// The outcome of an acknowledge-checkpoint message.
pub enum CheckpointAckResult {
    Completed {
        checkpoint: CompletedCheckpoint,
        confirmations: Vec<(TaskManagerGateway, ExecutionAttemptId)>,
    },
    Pending,
    Duplicate,
    Unknown,
    NoCoordinator,
}

/// The runtime state machine for one submitted job: its vertices, their
/// execution attempts, accumulators, retry budget, and (when enabled) the
/// checkpoint coordinator.
pub struct ExecutionGraph {
    job_id: JobId,
    job_name: String,
    status: JobStatus,
    status_timestamps: HashMap<JobStatus, u64>,
    vertices: Vec<ExecutionJobVertex>,
    vertex_index: HashMap<JobVertexId, usize>,
    attempts: HashMap<ExecutionAttemptId, (usize, usize)>,
    partitions: HashMap<PartitionId, (JobVertexId, usize)>,
    user_code: UserCodeContext,
    retries_left: usize,
    retry_delay: Duration,
    schedule_mode: ScheduleMode,
    queued_scheduling: bool,
    json_plan: String,
    accumulators: HashMap<ExecutionAttemptId, HashMap<String, Vec<u8>>>,
    checkpoint_coordinator: Option<CheckpointCoordinator>,
    status_listeners: Vec<mpsc::UnboundedSender<JobStatusChange>>,
    execution_listeners: Vec<mpsc::UnboundedSender<ExecutionStateChange>>,
    failure_cause: Option<String>,
}

impl ExecutionGraph {
    pub fn new(job_id: JobId, job_name: String, user_code: UserCodeContext) -> Self {
        let mut status_timestamps = HashMap::new();
        status_timestamps.insert(JobStatus::Created, current_time_millis());
        Self {
            job_id,
            job_name,
            status: JobStatus::Created,
            status_timestamps,
            vertices: vec![],
            vertex_index: HashMap::new(),
            attempts: HashMap::new(),
            partitions: HashMap::new(),
            user_code,
            retries_left: 0,
            retry_delay: Duration::from_secs(0),
            schedule_mode: ScheduleMode::Eager,
            queued_scheduling: false,
            json_plan: "{}".to_string(),
            accumulators: HashMap::new(),
            checkpoint_coordinator: None,
            status_listeners: vec![],
            execution_listeners: vec![],
            failure_cause: None,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn status_timestamp(&self, status: JobStatus) -> Option<u64> {
        self.status_timestamps.get(&status).copied()
    }

    pub fn set_status_timestamp(&mut self, status: JobStatus, timestamp: u64) {
        self.status_timestamps.insert(status, timestamp);
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn retries_left(&self) -> usize {
        self.retries_left
    }

    pub fn set_retries(&mut self, retries: usize) {
        self.retries_left = retries;
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn set_retry_delay(&mut self, delay: Duration) {
        self.retry_delay = delay;
    }

    pub fn set_schedule_mode(&mut self, mode: ScheduleMode) {
        self.schedule_mode = mode;
    }

    pub fn set_queued_scheduling(&mut self, enabled: bool) {
        self.queued_scheduling = enabled;
    }

    pub fn set_json_plan(&mut self, plan: String) {
        self.json_plan = plan;
    }

    pub fn json_plan(&self) -> &str {
        &self.json_plan
    }

    pub fn user_code(&self) -> &UserCodeContext {
        &self.user_code
    }

    pub fn failure_cause(&self) -> Option<&str> {
        self.failure_cause.as_deref()
    }

    pub fn register_status_listener(&mut self, listener: mpsc::UnboundedSender<JobStatusChange>) {
        self.status_listeners.push(listener);
    }

    pub fn register_execution_listener(
        &mut self,
        listener: mpsc::UnboundedSender<ExecutionStateChange>,
    ) {
        self.execution_listeners.push(listener);
    }

    /// Attaches the materialized vertices, in topological order.
    pub fn attach_vertices(&mut self, vertices: Vec<ExecutionJobVertex>) {
        self.vertices = vertices;
        self.vertex_index = self
            .vertices
            .iter()
            .enumerate()
            .map(|(i, v)| (v.vertex_id, i))
            .collect();
        self.rebuild_attempt_index();
    }

    fn rebuild_attempt_index(&mut self) {
        self.attempts.clear();
        self.partitions.clear();
        for (vi, vertex) in self.vertices.iter().enumerate() {
            for (si, execution) in vertex.subtasks.iter().enumerate() {
                self.attempts.insert(execution.attempt_id, (vi, si));
            }
            for (si, &partition) in vertex.produced_partitions.iter().enumerate() {
                self.partitions.insert(partition, (vertex.vertex_id, si));
            }
        }
    }

    pub fn vertex(&self, vertex_id: JobVertexId) -> Option<&ExecutionJobVertex> {
        self.vertex_index
            .get(&vertex_id)
            .map(|&index| &self.vertices[index])
    }

    pub fn vertices(&self) -> &[ExecutionJobVertex] {
        &self.vertices
    }

    /// Resolves an attempt id back to its vertex and subtask index.
    pub fn resolve_attempt(&self, attempt_id: ExecutionAttemptId) -> Option<(JobVertexId, usize)> {
        self.attempts
            .get(&attempt_id)
            .map(|&(vi, si)| (self.vertices[vi].vertex_id, si))
    }

    /// Configures checkpointing. Every referenced vertex id must resolve to
    /// an attached vertex.
    pub fn enable_checkpointing(&mut self, settings: &CheckpointSettings) -> CoordinationResult<()> {
        for vertex_id in settings
            .trigger_vertices
            .iter()
            .chain(&settings.ack_vertices)
            .chain(&settings.confirm_vertices)
        {
            if !self.vertex_index.contains_key(vertex_id) {
                return Err(CoordinationError::JobSubmission(format!(
                    "checkpoint settings reference unknown vertex {vertex_id}"
                )));
            }
        }
        self.checkpoint_coordinator = Some(CheckpointCoordinator::new(settings));
        Ok(())
    }

    pub fn checkpoint_coordinator(&self) -> Option<&CheckpointCoordinator> {
        self.checkpoint_coordinator.as_ref()
    }

    fn transition_status(&mut self, status: JobStatus, error: Option<String>) {
        if self.status == status {
            return;
        }
        info!("job {} switched from {} to {status}", self.job_id, self.status);
        self.status = status;
        let timestamp = current_time_millis();
        self.status_timestamps.insert(status, timestamp);
        if let Some(error) = &error {
            self.failure_cause = Some(error.clone());
        }
        let change = JobStatusChange {
            job_id: self.job_id,
            status,
            timestamp,
            error,
        };
        self.status_listeners
            .retain(|listener| listener.send(change.clone()).is_ok());
    }

    fn notify_execution_listeners(&mut self, vi: usize, si: usize) {
        let vertex = &self.vertices[vi];
        let execution = &vertex.subtasks[si];
        let change = ExecutionStateChange {
            job_id: self.job_id,
            vertex_id: vertex.vertex_id,
            subtask_index: si,
            attempt_id: execution.attempt_id,
            state: execution.state,
            error: execution.error.clone(),
        };
        self.execution_listeners
            .retain(|listener| listener.send(change.clone()).is_ok());
    }

    /// Transitions the job to RUNNING and requests slots for the vertices
    /// eligible under the schedule mode. A scheduling failure is returned to
    /// the caller, which reports it through [ExecutionGraph::fail]; it never
    /// undoes the submission.
    pub fn schedule_for_execution(
        &mut self,
        scheduler: &mut Scheduler,
    ) -> CoordinationResult<Vec<GraphAction>> {
        if self.status != JobStatus::Created {
            return Err(CoordinationError::internal(format!(
                "job {} cannot be scheduled while {}",
                self.job_id, self.status
            )));
        }
        self.transition_status(JobStatus::Running, None);
        let eligible: Vec<usize> = match self.schedule_mode {
            ScheduleMode::Eager => (0..self.vertices.len()).collect(),
            ScheduleMode::LazyFromSources => (0..self.vertices.len())
                .filter(|&i| self.vertices[i].is_source())
                .collect(),
        };
        let mut actions = vec![];
        for vi in eligible {
            actions.extend(self.deploy_vertex(vi, scheduler)?);
        }
        Ok(actions)
    }

    /// Requests slots for every not-yet-scheduled subtask of one vertex,
    /// preferring slots co-located with the vertex's producers.
    fn deploy_vertex(
        &mut self,
        vi: usize,
        scheduler: &mut Scheduler,
    ) -> CoordinationResult<Vec<GraphAction>> {
        let (preferred_instances, preferred_hosts) = {
            let vertex = &self.vertices[vi];
            let mut instances = vec![];
            let mut hosts = vec![];
            for input in &vertex.inputs {
                let Some(&ii) = self.vertex_index.get(input) else {
                    continue;
                };
                for execution in &self.vertices[ii].subtasks {
                    if let Some(slot) = &execution.assigned_slot {
                        instances.push(slot.instance_id);
                        hosts.push(slot.host.clone());
                    }
                }
            }
            (instances, hosts)
        };
        let pending: Vec<(usize, ExecutionAttemptId)> = self.vertices[vi]
            .subtasks
            .iter()
            .enumerate()
            .filter(|(_, e)| e.state == ExecutionState::Created)
            .map(|(si, e)| (si, e.attempt_id))
            .collect();
        let mut actions = vec![];
        for (_, attempt_id) in pending {
            let request = SlotRequest {
                job_id: self.job_id,
                attempt_id,
                preferred_instances: preferred_instances.clone(),
                preferred_hosts: preferred_hosts.clone(),
            };
            match scheduler.request_slot(request, self.queued_scheduling) {
                SlotAllocation::Allocated(slot) => {
                    if let Some(action) = self.deploy_to_slot(attempt_id, slot)? {
                        actions.push(action);
                    }
                }
                SlotAllocation::Queued => {}
                SlotAllocation::Refused => {
                    return Err(CoordinationError::JobExecution(format!(
                        "not enough free slots to schedule vertex {}",
                        self.vertices[vi].name
                    )));
                }
            }
        }
        Ok(actions)
    }

    /// Assigns an allocated slot to an attempt and produces the deployment.
    /// Returns [None] when the attempt is no longer waiting for a slot; the
    /// caller then returns the slot to the scheduler.
    pub fn deploy_to_slot(
        &mut self,
        attempt_id: ExecutionAttemptId,
        slot: Slot,
    ) -> CoordinationResult<Option<GraphAction>> {
        let Some(&(vi, si)) = self.attempts.get(&attempt_id) else {
            return Ok(None);
        };
        if self.vertices[vi].subtasks[si].state != ExecutionState::Created {
            return Ok(None);
        }
        let gateway = slot.gateway.clone();
        {
            let execution = &mut self.vertices[vi].subtasks[si];
            execution.try_transition(ExecutionState::Scheduled, None);
            execution.assigned_slot = Some(slot);
            execution.try_transition(ExecutionState::Deploying, None);
        }
        self.notify_execution_listeners(vi, si);
        let deployment = self.build_deployment(vi, si);
        Ok(Some(GraphAction::Deploy {
            gateway,
            deployment,
        }))
    }

    fn build_deployment(&self, vi: usize, si: usize) -> TaskDeploymentDescriptor {
        let vertex = &self.vertices[vi];
        let execution = &vertex.subtasks[si];
        TaskDeploymentDescriptor {
            job_id: self.job_id,
            vertex_id: vertex.vertex_id,
            vertex_name: vertex.name.clone(),
            subtask_index: si,
            parallelism: vertex.parallelism,
            attempt_id: execution.attempt_id,
            attempt_number: execution.attempt_number,
            invokable_class_name: vertex.invokable_class_name.clone(),
            artifacts: self.user_code.artifact_locations(),
            classpaths: self.user_code.classpaths.clone(),
            produced_partitions: vec![vertex.produced_partitions[si]],
        }
    }

    /// Applies a task-state update reported by a task manager.
    /// Returns whether the update was accepted, plus follow-up actions.
    pub fn update_execution_state(
        &mut self,
        state: &TaskExecutionState,
    ) -> (bool, Vec<GraphAction>) {
        if self.status.is_terminal() {
            return (false, vec![]);
        }
        let Some(&(vi, si)) = self.attempts.get(&state.attempt_id) else {
            warn!(
                "job {} has no execution attempt {}",
                self.job_id, state.attempt_id
            );
            return (false, vec![]);
        };
        if !self.vertices[vi].subtasks[si].try_transition(state.state, state.error.clone()) {
            return (false, vec![]);
        }
        self.notify_execution_listeners(vi, si);
        let mut actions = vec![];
        if state.state.is_terminal() {
            actions.push(GraphAction::ReleaseSlot {
                attempt_id: state.attempt_id,
            });
        }
        match state.state {
            ExecutionState::Finished => {
                if self.vertices.iter().all(|v| v.all_subtasks_finished()) {
                    self.transition_status(JobStatus::Finished, None);
                }
            }
            ExecutionState::Failed => {
                let cause = state
                    .error
                    .clone()
                    .unwrap_or_else(|| "task execution failed".to_string());
                actions.extend(self.handle_attempt_failure(cause));
            }
            ExecutionState::Canceled => {
                self.finish_termination_if_settled();
            }
            _ => {}
        }
        (true, actions)
    }

    fn handle_attempt_failure(&mut self, cause: String) -> Vec<GraphAction> {
        match self.status {
            JobStatus::Created | JobStatus::Running | JobStatus::Restarting => {
                self.transition_status(JobStatus::Failing, Some(cause));
                let actions = self.cancel_active_attempts();
                if self.all_attempts_terminal() {
                    self.finish_failing();
                }
                actions
            }
            JobStatus::Failing | JobStatus::Cancelling => {
                self.finish_termination_if_settled();
                vec![]
            }
            _ => vec![],
        }
    }

    /// Cancels every non-terminal attempt: running attempts get a cancel
    /// message, attempts without a slot are canceled directly.
    fn cancel_active_attempts(&mut self) -> Vec<GraphAction> {
        let mut actions = vec![];
        let mut notified = vec![];
        for (vi, vertex) in self.vertices.iter_mut().enumerate() {
            for (si, execution) in vertex.subtasks.iter_mut().enumerate() {
                match execution.state {
                    ExecutionState::Created => {
                        execution.try_transition(ExecutionState::Canceled, None);
                        notified.push((vi, si));
                    }
                    ExecutionState::Scheduled | ExecutionState::Deploying
                    | ExecutionState::Running => {
                        execution.try_transition(ExecutionState::Canceling, None);
                        notified.push((vi, si));
                        if let Some(slot) = &execution.assigned_slot {
                            actions.push(GraphAction::CancelTask {
                                gateway: slot.gateway.clone(),
                                attempt_id: execution.attempt_id,
                            });
                        }
                    }
                    _ => {}
                }
            }
        }
        for (vi, si) in notified {
            self.notify_execution_listeners(vi, si);
        }
        actions
    }

    fn all_attempts_terminal(&self) -> bool {
        self.vertices.iter().all(|v| v.all_subtasks_terminal())
    }

    fn finish_termination_if_settled(&mut self) {
        if !self.all_attempts_terminal() {
            return;
        }
        match self.status {
            JobStatus::Cancelling => self.transition_status(JobStatus::Canceled, None),
            JobStatus::Failing => self.finish_failing(),
            _ => {}
        }
    }

    /// Settles a failing job: consume one retry and restart, or fail for
    /// good. Each accepted restart decrements the retry budget.
    fn finish_failing(&mut self) {
        if self.retries_left > 0 {
            self.retries_left -= 1;
            self.transition_status(JobStatus::Restarting, None);
        } else {
            let cause = self.failure_cause.clone();
            self.transition_status(JobStatus::Failed, cause);
        }
    }

    /// Initiates job cancellation. The final CANCELED transition happens
    /// when the last attempt reports a terminal state.
    pub fn cancel(&mut self) -> Vec<GraphAction> {
        match self.status {
            JobStatus::Created => {
                let actions = self.cancel_active_attempts();
                self.transition_status(JobStatus::Canceled, None);
                actions
            }
            JobStatus::Running | JobStatus::Restarting => {
                self.transition_status(JobStatus::Cancelling, None);
                let actions = self.cancel_active_attempts();
                self.finish_termination_if_settled();
                actions
            }
            // A failing job keeps failing; terminal and cancelling jobs
            // have nothing left to cancel.
            _ => vec![],
        }
    }

    /// Fails the whole job with an external cause. The job settles to
    /// RESTARTING or FAILED once every attempt reaches a terminal state.
    pub fn fail(&mut self, cause: &str) -> Vec<GraphAction> {
        match self.status {
            JobStatus::Created | JobStatus::Running | JobStatus::Restarting => {
                self.handle_attempt_failure(cause.to_string())
            }
            JobStatus::Failing | JobStatus::Cancelling => {
                self.finish_termination_if_settled();
                vec![]
            }
            _ => vec![],
        }
    }

    /// Resets all vertices for a new round of execution after RESTARTING.
    pub fn restart(&mut self) -> CoordinationResult<()> {
        if self.status != JobStatus::Restarting {
            return Err(CoordinationError::internal(format!(
                "job {} cannot restart while {}",
                self.job_id, self.status
            )));
        }
        for vertex in &mut self.vertices {
            vertex.reset_for_restart()?;
        }
        self.rebuild_attempt_index();
        self.accumulators.clear();
        self.transition_status(JobStatus::Created, None);
        Ok(())
    }

    /// Deploys the consumers of a produced partition (lazy scheduling).
    pub fn schedule_or_update_consumers(
        &mut self,
        partition_id: PartitionId,
        scheduler: &mut Scheduler,
    ) -> CoordinationResult<Vec<GraphAction>> {
        let Some(&(producer_id, _)) = self.partitions.get(&partition_id) else {
            return Err(CoordinationError::invalid(format!(
                "job {} has no partition {partition_id}",
                self.job_id
            )));
        };
        let consumers = match self.vertex(producer_id) {
            Some(vertex) => vertex.consumers.clone(),
            None => vec![],
        };
        let mut actions = vec![];
        for consumer in consumers {
            if let Some(&vi) = self.vertex_index.get(&consumer) {
                actions.extend(self.deploy_vertex(vi, scheduler)?);
            }
        }
        Ok(actions)
    }

    /// The current state of the execution producing a partition, or [None]
    /// when the partition is unknown.
    pub fn partition_state(&self, partition_id: PartitionId) -> Option<ExecutionState> {
        let &(vertex_id, subtask) = self.partitions.get(&partition_id)?;
        self.vertex(vertex_id)
            .and_then(|v| v.subtasks.get(subtask))
            .map(|e| e.state)
    }

    /// Hands out the next input split for an attempt, using the host of its
    /// assigned slot for locality ([None] when unassigned).
    pub fn next_input_split(
        &mut self,
        vertex_id: JobVertexId,
        attempt_id: ExecutionAttemptId,
    ) -> Option<InputSplit> {
        let host = self
            .attempts
            .get(&attempt_id)
            .and_then(|&(vi, si)| self.vertices[vi].subtasks.get(si))
            .and_then(|e| e.host().map(|h| h.to_string()));
        let subtask = self.attempts.get(&attempt_id).map(|&(_, si)| si)?;
        let &vi = self.vertex_index.get(&vertex_id)?;
        self.vertices[vi].next_input_split(host.as_deref(), subtask)
    }

    /// Triggers a checkpoint if the job and all trigger/ack subtasks are
    /// running. Returns [None] when this round must be skipped.
    pub fn trigger_checkpoint(&mut self, now: u64) -> CoordinationResult<Option<CheckpointTriggerPlan>> {
        if self.status != JobStatus::Running {
            return Ok(None);
        }
        let Some(coordinator) = &self.checkpoint_coordinator else {
            return Ok(None);
        };
        let trigger_vertices = coordinator.trigger_vertices().to_vec();
        let ack_vertices = coordinator.ack_vertices().to_vec();
        let mut triggers = vec![];
        for vertex_id in &trigger_vertices {
            let Some(vertex) = self.vertex(*vertex_id) else {
                return Ok(None);
            };
            for execution in &vertex.subtasks {
                let (ExecutionState::Running, Some(slot)) =
                    (execution.state, &execution.assigned_slot)
                else {
                    return Ok(None);
                };
                triggers.push((slot.gateway.clone(), execution.attempt_id));
            }
        }
        let mut expected = std::collections::HashSet::new();
        for vertex_id in &ack_vertices {
            let Some(vertex) = self.vertex(*vertex_id) else {
                return Ok(None);
            };
            for execution in &vertex.subtasks {
                if execution.state != ExecutionState::Running {
                    return Ok(None);
                }
                expected.insert(execution.attempt_id);
            }
        }
        let Some(coordinator) = self.checkpoint_coordinator.as_mut() else {
            return Ok(None);
        };
        let checkpoint_id = coordinator.start_checkpoint(now, expected)?;
        Ok(Some(CheckpointTriggerPlan {
            checkpoint_id,
            timestamp: now,
            triggers,
        }))
    }

    pub fn acknowledge_checkpoint(
        &mut self,
        checkpoint_id: CheckpointId,
        attempt_id: ExecutionAttemptId,
        now: u64,
    ) -> CheckpointAckResult {
        let confirm_vertices = match &self.checkpoint_coordinator {
            Some(coordinator) => coordinator.confirm_vertices().to_vec(),
            None => return CheckpointAckResult::NoCoordinator,
        };
        let Some(coordinator) = self.checkpoint_coordinator.as_mut() else {
            return CheckpointAckResult::NoCoordinator;
        };
        match coordinator.acknowledge(checkpoint_id, attempt_id, now) {
            CheckpointAck::Complete(checkpoint) => {
                let mut confirmations = vec![];
                for vertex_id in confirm_vertices {
                    if let Some(vertex) = self.vertex(vertex_id) {
                        for execution in &vertex.subtasks {
                            if let (ExecutionState::Running, Some(slot)) =
                                (execution.state, &execution.assigned_slot)
                            {
                                confirmations.push((slot.gateway.clone(), execution.attempt_id));
                            }
                        }
                    }
                }
                CheckpointAckResult::Completed {
                    checkpoint,
                    confirmations,
                }
            }
            CheckpointAck::Pending => CheckpointAckResult::Pending,
            CheckpointAck::Duplicate => CheckpointAckResult::Duplicate,
            CheckpointAck::Unknown => CheckpointAckResult::Unknown,
        }
    }

    pub fn decline_checkpoint(&mut self, checkpoint_id: CheckpointId, reason: &str) -> bool {
        self.checkpoint_coordinator
            .as_mut()
            .is_some_and(|c| c.decline(checkpoint_id, reason))
    }

    pub fn expire_checkpoint(&mut self, checkpoint_id: CheckpointId) -> bool {
        self.checkpoint_coordinator
            .as_mut()
            .is_some_and(|c| c.expire(checkpoint_id))
    }

    /// Stores the latest accumulator snapshot of a known attempt.
    /// Snapshots from unknown attempts are discarded.
    pub fn merge_accumulators(&mut self, snapshot: AccumulatorSnapshot) {
        if !self.attempts.contains_key(&snapshot.attempt_id) {
            return;
        }
        self.accumulators
            .insert(snapshot.attempt_id, snapshot.accumulators);
    }

    /// Flattens the per-attempt accumulator snapshots into one result map.
    pub fn serialized_accumulator_results(
        &self,
    ) -> CoordinationResult<HashMap<String, Vec<u8>>> {
        let mut results = HashMap::new();
        for snapshot in self.accumulators.values() {
            for (name, value) in snapshot {
                results.insert(name.clone(), value.clone());
            }
        }
        Ok(results)
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            job_id: self.job_id,
            name: self.job_name.clone(),
            status: self.status,
            start_time: self
                .status_timestamp(JobStatus::Created)
                .unwrap_or_default(),
        }
    }

    /// Strips listeners and split sources before the graph moves to the
    /// archive.
    pub fn prepare_for_archiving(&mut self) {
        self.status_listeners.clear();
        self.execution_listeners.clear();
        for vertex in &mut self.vertices {
            vertex.prepare_for_archiving();
        }
    }
}
