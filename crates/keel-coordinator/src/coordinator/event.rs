use tokio::time::Instant;

use crate::error::CoordinationResult;
use crate::graph::JobStatus;
use crate::id::{CheckpointId, InstanceId, JobId, LeaderSessionId};
use crate::jobgraph::JobGraph;
use crate::library::UserCodeContext;
use crate::protocol::{ClientGateway, ClusterMessage, ListeningMode};

/// Everything the coordinator loop processes, one message at a time.
///
/// Remote traffic arrives as [CoordinatorEvent::Message] carrying the
/// sender's expected leader session id; the rest are lifecycle events and
/// delayed self-messages (probes and timers), which bypass the session
/// filter.
pub enum CoordinatorEvent {
    GrantLeadership {
        session: LeaderSessionId,
    },
    /// The election service acknowledged the session the coordinator
    /// confirmed asynchronously.
    LeadershipConfirmed {
        session: LeaderSessionId,
    },
    RevokeLeadership,
    /// An error reported by the election service; poisons the coordinator.
    ElectionError {
        message: String,
    },
    Message {
        session: LeaderSessionId,
        message: ClusterMessage,
    },
    /// The liveness watcher observed a worker's back-channel closing.
    WorkerTerminated {
        instance_id: InstanceId,
    },
    ProbeInstanceHeartbeat {
        instance_id: InstanceId,
        watermark: Instant,
    },
    /// Artifact materialization for a submission finished off-loop.
    SubmissionPrepared {
        submission: PreparedSubmission,
    },
    /// Posted by an execution graph's status listener.
    JobStatusChanged {
        job_id: JobId,
        status: JobStatus,
        timestamp: u64,
        error: Option<String>,
    },
    RestartJob {
        job_id: JobId,
    },
    TriggerCheckpoint {
        job_id: JobId,
    },
    ProbeCheckpointTimeout {
        job_id: JobId,
        checkpoint_id: CheckpointId,
    },
    ProbeSessionTimeout {
        job_id: JobId,
        watermark: Instant,
    },
    Shutdown,
}

pub struct PreparedSubmission {
    pub graph: JobGraph,
    pub mode: ListeningMode,
    pub client: ClientGateway,
    pub user_code: CoordinationResult<UserCodeContext>,
}
