use serde::{Deserialize, Serialize};

use crate::id::ExecutionAttemptId;
use crate::scheduler::Slot;

/// The lifecycle of one execution attempt of one parallel subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionState {
    /// Created but not yet given a slot.
    Created,
    /// A slot has been allocated for the attempt.
    Scheduled,
    /// The deployment has been sent to the task manager.
    Deploying,
    Running,
    Finished,
    Canceling,
    Canceled,
    Failed,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Finished | ExecutionState::Canceled | ExecutionState::Failed
        )
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExecutionState::Created => "CREATED",
            ExecutionState::Scheduled => "SCHEDULED",
            ExecutionState::Deploying => "DEPLOYING",
            ExecutionState::Running => "RUNNING",
            ExecutionState::Finished => "FINISHED",
            ExecutionState::Canceling => "CANCELING",
            ExecutionState::Canceled => "CANCELED",
            ExecutionState::Failed => "FAILED",
        };
        write!(f, "{name}")
    }
}

fn is_transition_allowed(from: ExecutionState, to: ExecutionState) -> bool {
    use ExecutionState::*;
    match from {
        Created => matches!(to, Scheduled | Canceled | Failed),
        Scheduled => matches!(to, Deploying | Canceling | Canceled | Failed),
        Deploying => matches!(to, Running | Canceling | Canceled | Failed),
        Running => matches!(to, Finished | Canceling | Canceled | Failed),
        Canceling => matches!(to, Canceled | Failed),
        Finished | Canceled | Failed => false,
    }
}

/// One attempt of one parallel subtask of one vertex.
pub struct Execution {
    pub attempt_id: ExecutionAttemptId,
    pub attempt_number: usize,
    pub state: ExecutionState,
    pub assigned_slot: Option<Slot>,
    pub error: Option<String>,
}

impl Execution {
    pub fn new(attempt_number: usize) -> Self {
        Self {
            attempt_id: ExecutionAttemptId::random(),
            attempt_number,
            state: ExecutionState::Created,
            assigned_slot: None,
            error: None,
        }
    }

    /// Applies a state transition if it is allowed from the current state.
    /// Returns whether the transition was applied; out-of-order and stale
    /// updates are rejected without mutating the attempt.
    pub fn try_transition(&mut self, target: ExecutionState, error: Option<String>) -> bool {
        if !is_transition_allowed(self.state, target) {
            return false;
        }
        self.state = target;
        if error.is_some() {
            self.error = error;
        }
        true
    }

    pub fn host(&self) -> Option<&str> {
        self.assigned_slot.as_ref().map(|slot| slot.host.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut execution = Execution::new(0);
        assert!(execution.try_transition(ExecutionState::Scheduled, None));
        assert!(execution.try_transition(ExecutionState::Deploying, None));
        assert!(execution.try_transition(ExecutionState::Running, None));
        assert!(execution.try_transition(ExecutionState::Finished, None));
        assert!(execution.state.is_terminal());
    }

    #[test]
    fn test_terminal_states_reject_updates() {
        let mut execution = Execution::new(0);
        assert!(execution.try_transition(ExecutionState::Failed, Some("boom".to_string())));
        assert!(!execution.try_transition(ExecutionState::Running, None));
        assert!(!execution.try_transition(ExecutionState::Canceled, None));
        assert_eq!(execution.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_running_cannot_regress() {
        let mut execution = Execution::new(0);
        execution.try_transition(ExecutionState::Scheduled, None);
        execution.try_transition(ExecutionState::Deploying, None);
        execution.try_transition(ExecutionState::Running, None);
        assert!(!execution.try_transition(ExecutionState::Scheduled, None));
        assert!(!execution.try_transition(ExecutionState::Deploying, None));
    }
}
