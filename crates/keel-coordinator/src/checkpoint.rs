use std::collections::{BTreeMap, HashSet, VecDeque};
use std::time::Duration;

use log::{info, warn};

use crate::error::CoordinationResult;
use crate::id::{CheckpointId, ExecutionAttemptId, IdGenerator, JobVertexId};
use crate::jobgraph::CheckpointSettings;

/// How many completed checkpoints are retained for inspection.
const MAX_RETAINED_CHECKPOINTS: usize = 10;

/// Coordinates periodic checkpoint barriers for one execution graph.
///
/// The owner drives it from the event loop: it starts a checkpoint when the
/// interval timer fires, feeds in acknowledge and decline messages, and
/// expires checkpoints whose timeout probe fires. Checkpoint ids are
/// monotonically increasing and never reused, so after a timeout the next
/// trigger continues from the next id.
pub struct CheckpointCoordinator {
    interval: Duration,
    timeout: Duration,
    trigger_vertices: Vec<JobVertexId>,
    ack_vertices: Vec<JobVertexId>,
    confirm_vertices: Vec<JobVertexId>,
    id_generator: IdGenerator<CheckpointId>,
    pending: BTreeMap<CheckpointId, PendingCheckpoint>,
    completed: VecDeque<CompletedCheckpoint>,
}

pub struct PendingCheckpoint {
    pub checkpoint_id: CheckpointId,
    /// The wall-clock time at which the checkpoint was triggered.
    pub timestamp: u64,
    not_yet_acknowledged: HashSet<ExecutionAttemptId>,
    acknowledged: HashSet<ExecutionAttemptId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedCheckpoint {
    pub checkpoint_id: CheckpointId,
    pub timestamp: u64,
    pub completion_timestamp: u64,
}

/// The outcome of feeding one acknowledgment into the coordinator.
pub enum CheckpointAck {
    /// All expected subtasks have acknowledged.
    Complete(CompletedCheckpoint),
    Pending,
    /// The attempt already acknowledged this checkpoint; dropped silently.
    Duplicate,
    /// The checkpoint id is not pending; logged and dropped.
    Unknown,
}

impl CheckpointCoordinator {
    pub fn new(settings: &CheckpointSettings) -> Self {
        Self {
            interval: settings.interval,
            timeout: settings.timeout,
            trigger_vertices: settings.trigger_vertices.clone(),
            ack_vertices: settings.ack_vertices.clone(),
            confirm_vertices: settings.confirm_vertices.clone(),
            id_generator: IdGenerator::new(),
            pending: BTreeMap::new(),
            completed: VecDeque::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn trigger_vertices(&self) -> &[JobVertexId] {
        &self.trigger_vertices
    }

    pub fn ack_vertices(&self) -> &[JobVertexId] {
        &self.ack_vertices
    }

    pub fn confirm_vertices(&self) -> &[JobVertexId] {
        &self.confirm_vertices
    }

    /// Opens a new pending checkpoint expecting acknowledgments from the
    /// given attempts.
    pub fn start_checkpoint(
        &mut self,
        timestamp: u64,
        expected_acks: HashSet<ExecutionAttemptId>,
    ) -> CoordinationResult<CheckpointId> {
        let checkpoint_id = self.id_generator.next()?;
        info!(
            "triggering checkpoint {checkpoint_id} with {} expected acknowledgments",
            expected_acks.len()
        );
        self.pending.insert(
            checkpoint_id,
            PendingCheckpoint {
                checkpoint_id,
                timestamp,
                not_yet_acknowledged: expected_acks,
                acknowledged: HashSet::new(),
            },
        );
        Ok(checkpoint_id)
    }

    pub fn acknowledge(
        &mut self,
        checkpoint_id: CheckpointId,
        attempt_id: ExecutionAttemptId,
        now: u64,
    ) -> CheckpointAck {
        let Some(pending) = self.pending.get_mut(&checkpoint_id) else {
            warn!("received acknowledgment for unknown checkpoint {checkpoint_id}");
            return CheckpointAck::Unknown;
        };
        if pending.acknowledged.contains(&attempt_id) {
            return CheckpointAck::Duplicate;
        }
        if !pending.not_yet_acknowledged.remove(&attempt_id) {
            // An attempt outside the expected set; treat as a duplicate so
            // the message is discarded without affecting the checkpoint.
            warn!(
                "attempt {attempt_id} is not expected to acknowledge checkpoint {checkpoint_id}"
            );
            return CheckpointAck::Duplicate;
        }
        pending.acknowledged.insert(attempt_id);
        if !pending.not_yet_acknowledged.is_empty() {
            return CheckpointAck::Pending;
        }
        let Some(pending) = self.pending.remove(&checkpoint_id) else {
            return CheckpointAck::Unknown;
        };
        let completed = CompletedCheckpoint {
            checkpoint_id,
            timestamp: pending.timestamp,
            completion_timestamp: now,
        };
        info!(
            "checkpoint {checkpoint_id} is complete ({} ms)",
            now.saturating_sub(pending.timestamp)
        );
        // Pending checkpoints older than a completed one can no longer win.
        let stale: Vec<CheckpointId> = self
            .pending
            .range(..checkpoint_id)
            .map(|(&id, _)| id)
            .collect();
        for id in stale {
            info!("discarding subsumed checkpoint {id}");
            self.pending.remove(&id);
        }
        self.completed.push_back(completed.clone());
        while self.completed.len() > MAX_RETAINED_CHECKPOINTS {
            self.completed.pop_front();
        }
        CheckpointAck::Complete(completed)
    }

    /// Aborts a pending checkpoint declined by a subtask.
    pub fn decline(&mut self, checkpoint_id: CheckpointId, reason: &str) -> bool {
        if self.pending.remove(&checkpoint_id).is_some() {
            warn!("checkpoint {checkpoint_id} was declined: {reason}");
            true
        } else {
            false
        }
    }

    /// Expires a checkpoint whose timeout probe fired while it was still
    /// pending. Returns whether the checkpoint was discarded.
    pub fn expire(&mut self, checkpoint_id: CheckpointId) -> bool {
        if self.pending.remove(&checkpoint_id).is_some() {
            warn!("checkpoint {checkpoint_id} expired before completion");
            true
        } else {
            false
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn completed_checkpoints(&self) -> impl Iterator<Item = &CompletedCheckpoint> {
        self.completed.iter()
    }

    pub fn latest_completed(&self) -> Option<&CompletedCheckpoint> {
        self.completed.back()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn coordinator() -> CheckpointCoordinator {
        CheckpointCoordinator::new(&CheckpointSettings {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(10),
            trigger_vertices: vec![],
            ack_vertices: vec![],
            confirm_vertices: vec![],
        })
    }

    fn attempts(count: usize) -> Vec<ExecutionAttemptId> {
        (0..count).map(|_| ExecutionAttemptId::random()).collect()
    }

    #[test]
    fn test_checkpoint_completes_when_all_acknowledge() {
        let mut coordinator = coordinator();
        let acks = attempts(2);
        let id = coordinator
            .start_checkpoint(100, acks.iter().copied().collect())
            .unwrap();
        assert!(matches!(
            coordinator.acknowledge(id, acks[0], 150),
            CheckpointAck::Pending
        ));
        match coordinator.acknowledge(id, acks[1], 200) {
            CheckpointAck::Complete(completed) => {
                assert_eq!(completed.checkpoint_id, id);
                assert_eq!(completed.timestamp, 100);
                assert_eq!(completed.completion_timestamp, 200);
            }
            _ => panic!("expected checkpoint completion"),
        }
        assert_eq!(coordinator.pending_count(), 0);
        assert_eq!(coordinator.latest_completed().unwrap().checkpoint_id, id);
    }

    #[test]
    fn test_duplicate_acknowledgment_is_discarded() {
        let mut coordinator = coordinator();
        let acks = attempts(2);
        let id = coordinator
            .start_checkpoint(100, acks.iter().copied().collect())
            .unwrap();
        assert!(matches!(
            coordinator.acknowledge(id, acks[0], 110),
            CheckpointAck::Pending
        ));
        assert!(matches!(
            coordinator.acknowledge(id, acks[0], 120),
            CheckpointAck::Duplicate
        ));
        assert_eq!(coordinator.pending_count(), 1);
    }

    #[test]
    fn test_unknown_checkpoint_is_dropped() {
        let mut coordinator = coordinator();
        assert!(matches!(
            coordinator.acknowledge(CheckpointId::from(42), ExecutionAttemptId::random(), 0),
            CheckpointAck::Unknown
        ));
    }

    #[test]
    fn test_completion_prunes_older_pending_checkpoints() {
        let mut coordinator = coordinator();
        let old_acks = attempts(1);
        let old = coordinator
            .start_checkpoint(100, old_acks.iter().copied().collect())
            .unwrap();
        let new_acks = attempts(1);
        let new = coordinator
            .start_checkpoint(200, new_acks.iter().copied().collect())
            .unwrap();
        assert!(old < new);
        assert!(matches!(
            coordinator.acknowledge(new, new_acks[0], 250),
            CheckpointAck::Complete(_)
        ));
        // The older checkpoint was subsumed; a late acknowledgment is unknown.
        assert!(matches!(
            coordinator.acknowledge(old, old_acks[0], 260),
            CheckpointAck::Unknown
        ));
    }

    #[test]
    fn test_expiry_and_decline_keep_ids_monotonic() {
        let mut coordinator = coordinator();
        let first_acks = attempts(1);
        let first = coordinator
            .start_checkpoint(100, first_acks.iter().copied().collect())
            .unwrap();
        assert!(coordinator.expire(first));
        assert!(!coordinator.expire(first));

        let second = coordinator.start_checkpoint(200, HashSet::new()).unwrap();
        assert!(second > first);
        assert!(!coordinator.decline(first, "late decline"));
    }
}
