mod core;
mod event;
mod handler;
mod options;
mod submit;

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

pub use event::{CoordinatorEvent, PreparedSubmission};
pub use options::CoordinatorOptions;

use crate::archive::ArchiveActor;
use crate::graph::ExecutionGraph;
use crate::id::{JobId, LeaderSessionId};
use crate::instance::InstanceManager;
use crate::library::LibraryCacheManager;
use crate::protocol::{ClientGateway, ListeningMode};
use crate::scheduler::Scheduler;
use keel_server::actor::ActorHandle;

/// The active coordinator: a single serial event loop owning the live-jobs
/// table, the leader session id, and the collaborator components.
pub struct CoordinatorActor {
    options: CoordinatorOptions,
    leadership: LeadershipState,
    jobs: HashMap<JobId, JobEntry>,
    instance_manager: InstanceManager,
    scheduler: Scheduler,
    library_cache: LibraryCacheManager,
    archive: ActorHandle<ArchiveActor>,
}

pub(crate) struct JobEntry {
    pub graph: ExecutionGraph,
    pub info: JobInfo,
}

/// Coordinator-side bookkeeping for one live job.
pub(crate) struct JobInfo {
    /// The reply address of the waiting client, or [None] when the client
    /// submitted in detached mode.
    pub client: Option<ClientGateway>,
    pub listening_mode: ListeningMode,
    pub start: u64,
    pub end: Option<u64>,
    /// Whether the job id stays resumable after a terminal state.
    pub session_alive: bool,
    pub session_timeout: Duration,
    /// Watermark guarding the one-shot session expiry timer.
    pub last_active: Instant,
}

/// The coordinator's position in the leadership state machine.
/// Termination is handled by the actor stop path rather than a state.
pub(crate) enum LeadershipState {
    Standby,
    /// Granted a session but the election service has not yet confirmed it;
    /// session-stamped traffic is not accepted yet.
    Confirming { session: LeaderSessionId },
    Leading { session: LeaderSessionId },
}

impl LeadershipState {
    /// The session under which inbound traffic is accepted and outbound
    /// traffic is stamped. [None] unless leadership is confirmed.
    pub fn current_session(&self) -> Option<LeaderSessionId> {
        match self {
            LeadershipState::Leading { session } => Some(*session),
            _ => None,
        }
    }
}

/// A handle used by election services, protocol frontends, and tests to
/// reach the coordinator loop.
pub type CoordinatorHandle = ActorHandle<CoordinatorActor>;
