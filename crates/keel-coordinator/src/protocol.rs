use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::error::{CoordinationResult, JobFailureCause};
use crate::graph::execution::ExecutionState;
use crate::graph::JobStatus;
use crate::id::{
    ExecutionAttemptId, InstanceId, JobId, JobVertexId, LeaderSessionId, PartitionId, ResultId,
};
use crate::jobgraph::JobGraph;

/// The back-channel to a registered task manager.
/// Every message is wrapped in an envelope stamped with the leader session
/// id under which it was emitted.
pub type TaskManagerGateway = mpsc::UnboundedSender<TaskManagerEnvelope>;

/// The reply address of a client; submit acks, job results, and optional
/// per-execution notifications are delivered through it.
pub type ClientGateway = mpsc::UnboundedSender<ClientMessage>;

pub struct TaskManagerEnvelope {
    pub session: LeaderSessionId,
    pub message: TaskManagerMessage,
}

/// Messages the coordinator sends to a task manager.
pub enum TaskManagerMessage {
    SubmitTask {
        deployment: TaskDeploymentDescriptor,
    },
    CancelTask {
        attempt_id: ExecutionAttemptId,
    },
    TriggerCheckpoint {
        job_id: JobId,
        checkpoint_id: crate::id::CheckpointId,
        timestamp: u64,
        attempt_id: ExecutionAttemptId,
    },
    ConfirmCheckpoint {
        job_id: JobId,
        checkpoint_id: crate::id::CheckpointId,
        timestamp: u64,
        attempt_id: ExecutionAttemptId,
    },
    Disconnect {
        reason: String,
    },
    RequestStackTrace {
        reply: oneshot::Sender<Vec<u8>>,
    },
}

/// Everything a task manager needs to start one parallel subtask.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDeploymentDescriptor {
    pub job_id: JobId,
    pub vertex_id: JobVertexId,
    pub vertex_name: String,
    pub subtask_index: usize,
    pub parallelism: usize,
    pub attempt_id: ExecutionAttemptId,
    pub attempt_number: usize,
    pub invokable_class_name: String,
    pub artifacts: Vec<String>,
    pub classpaths: Vec<String>,
    pub produced_partitions: Vec<PartitionId>,
}

/// Session-stamped traffic from workers and clients.
/// The coordinator compares the stamp against its current leader session id
/// before dispatching; a mismatch drops the message silently.
pub enum ClusterMessage {
    RegisterTaskManager {
        connection: InstanceConnectionInfo,
        hardware: HardwareDescription,
        slot_count: usize,
        gateway: TaskManagerGateway,
        reply: oneshot::Sender<RegistrationResponse>,
    },
    Heartbeat {
        instance_id: InstanceId,
        metrics: Vec<u8>,
        accumulators: Vec<AccumulatorSnapshot>,
    },
    Disconnect {
        instance_id: InstanceId,
        reason: String,
    },
    SubmitJob {
        graph: Option<JobGraph>,
        mode: ListeningMode,
        client: ClientGateway,
    },
    CancelJob {
        job_id: JobId,
        reply: oneshot::Sender<CancellationResponse>,
    },
    UpdateTaskExecutionState {
        state: Option<TaskExecutionState>,
        reply: oneshot::Sender<bool>,
    },
    RequestNextInputSplit {
        job_id: JobId,
        vertex_id: JobVertexId,
        attempt_id: ExecutionAttemptId,
        reply: oneshot::Sender<NextInputSplit>,
    },
    ScheduleOrUpdateConsumers {
        job_id: JobId,
        partition_id: PartitionId,
        reply: oneshot::Sender<CoordinationResult<()>>,
    },
    RequestPartitionState {
        job_id: JobId,
        partition_id: PartitionId,
        consumer_attempt_id: ExecutionAttemptId,
        result_id: ResultId,
        reply: oneshot::Sender<PartitionStateResponse>,
    },
    Checkpoint(CheckpointMessage),
    RequestStackTrace {
        instance_id: InstanceId,
        reply: oneshot::Sender<Vec<u8>>,
    },
    RequestJobStatus {
        job_id: JobId,
        reply: oneshot::Sender<JobStatusResponse>,
    },
    RequestRunningJobs {
        reply: oneshot::Sender<Vec<JobSummary>>,
    },
    RequestOverview {
        reply: oneshot::Sender<ClusterOverview>,
    },
}

/// Checkpoint-related messages from task manager subtasks, routed by subtype.
pub enum CheckpointMessage {
    Acknowledge {
        job_id: JobId,
        checkpoint_id: crate::id::CheckpointId,
        attempt_id: ExecutionAttemptId,
    },
    Decline {
        job_id: JobId,
        checkpoint_id: crate::id::CheckpointId,
        attempt_id: ExecutionAttemptId,
        reason: String,
    },
}

/// Messages delivered to the client reply address.
pub enum ClientMessage {
    JobSubmitSuccess {
        job_id: JobId,
    },
    JobResultSuccess {
        result: SerializedJobExecutionResult,
    },
    JobResultFailure {
        job_id: JobId,
        cause: JobFailureCause,
    },
    JobStatusChanged {
        job_id: JobId,
        status: JobStatus,
        timestamp: u64,
        error: Option<String>,
    },
    ExecutionStateChanged {
        job_id: JobId,
        vertex_id: JobVertexId,
        subtask_index: usize,
        attempt_id: ExecutionAttemptId,
        state: ExecutionState,
        error: Option<String>,
    },
}

/// The level of notifications a client requests when submitting a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListeningMode {
    Detached,
    ExecutionResult,
    ExecutionResultAndStateChanges,
}

impl ListeningMode {
    pub fn is_detached(&self) -> bool {
        matches!(self, ListeningMode::Detached)
    }

    pub fn wants_state_changes(&self) -> bool {
        matches!(self, ListeningMode::ExecutionResultAndStateChanges)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceConnectionInfo {
    pub host: String,
    pub data_port: u16,
}

impl std::fmt::Display for InstanceConnectionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.data_port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareDescription {
    pub cpu_cores: usize,
    pub physical_memory: u64,
    pub free_memory: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationResponse {
    AcknowledgeRegistration {
        instance_id: InstanceId,
        blob_server_port: u16,
    },
    AlreadyRegistered {
        instance_id: InstanceId,
        blob_server_port: u16,
    },
    RefuseRegistration {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancellationResponse {
    Success { job_id: JobId },
    Failure { job_id: JobId, reason: String },
}

/// The state of one execution attempt as observed by a task manager.
#[derive(Debug, Clone)]
pub struct TaskExecutionState {
    pub job_id: JobId,
    pub attempt_id: ExecutionAttemptId,
    pub state: ExecutionState,
    pub error: Option<String>,
}

/// The reply to an input split request. `data` is the serialized split,
/// or [None] when the assigner has no more splits for the subtask.
#[derive(Debug, Clone)]
pub struct NextInputSplit {
    pub data: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct PartitionStateResponse {
    pub result_id: ResultId,
    pub partition_id: PartitionId,
    pub state: Option<ExecutionState>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatusResponse {
    Found { job_id: JobId, status: JobStatus },
    NotFound { job_id: JobId },
}

#[derive(Debug, Clone)]
pub struct JobSummary {
    pub job_id: JobId,
    pub name: String,
    pub status: JobStatus,
    pub start_time: u64,
}

/// Aggregated counts across the live table, the instance registry, and the
/// archive of terminated jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterOverview {
    pub instances: usize,
    pub total_slots: usize,
    pub available_slots: usize,
    pub jobs_running: usize,
    pub jobs_finished: usize,
    pub jobs_cancelled: usize,
    pub jobs_failed: usize,
}

/// The result delivered to an attached client when its job finishes.
#[derive(Debug, Clone)]
pub struct SerializedJobExecutionResult {
    pub job_id: JobId,
    pub net_runtime_ms: u64,
    pub accumulator_results: HashMap<String, Vec<u8>>,
}

/// Accumulator values reported by a task manager heartbeat, keyed by the
/// reporting attempt. Values are opaque serialized bytes; a later snapshot
/// for the same attempt replaces the earlier one.
#[derive(Debug, Clone)]
pub struct AccumulatorSnapshot {
    pub job_id: JobId,
    pub attempt_id: ExecutionAttemptId,
    pub accumulators: HashMap<String, Vec<u8>>,
}
