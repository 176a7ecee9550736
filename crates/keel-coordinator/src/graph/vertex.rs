use std::sync::Arc;

use log::warn;

use crate::error::{CoordinationError, CoordinationResult};
use crate::graph::execution::{Execution, ExecutionState};
use crate::id::{JobVertexId, PartitionId};
use crate::jobgraph::JobVertex;
use crate::splits::{InputSplit, InputSplitAssigner, InputSplitSource};

/// One vertex of the execution graph: the materialized form of a job
/// vertex, holding its parallel subtasks (the current execution attempt of
/// each) and the input-split assigner when the vertex is a data source.
pub struct ExecutionJobVertex {
    pub vertex_id: JobVertexId,
    pub name: String,
    pub invokable_class_name: String,
    pub parallelism: usize,
    /// Upstream vertices; empty for sources.
    pub inputs: Vec<JobVertexId>,
    /// Downstream vertices, used for lazy consumer scheduling.
    pub consumers: Vec<JobVertexId>,
    pub subtasks: Vec<Execution>,
    /// The result partition produced by each subtask.
    pub produced_partitions: Vec<PartitionId>,
    split_source: Option<Arc<dyn InputSplitSource>>,
    split_assigner: Option<Box<dyn InputSplitAssigner>>,
}

impl ExecutionJobVertex {
    pub fn try_new(
        vertex: &JobVertex,
        parallelism: usize,
        inputs: Vec<JobVertexId>,
        consumers: Vec<JobVertexId>,
    ) -> CoordinationResult<Self> {
        if parallelism == 0 {
            return Err(CoordinationError::JobSubmission(format!(
                "vertex {} has zero parallelism",
                vertex.name
            )));
        }
        let split_assigner = vertex
            .split_source
            .as_ref()
            .map(|source| {
                let splits = source.create_splits(parallelism)?;
                Ok::<_, CoordinationError>(source.create_assigner(splits))
            })
            .transpose()?;
        Ok(Self {
            vertex_id: vertex.id,
            name: vertex.name.clone(),
            invokable_class_name: vertex.invokable_class_name.clone(),
            parallelism,
            inputs,
            consumers,
            subtasks: (0..parallelism).map(Execution::new).collect(),
            produced_partitions: (0..parallelism).map(|_| PartitionId::random()).collect(),
            split_source: vertex.split_source.clone(),
            split_assigner,
        })
    }

    pub fn is_source(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn all_subtasks_finished(&self) -> bool {
        self.subtasks
            .iter()
            .all(|e| e.state == ExecutionState::Finished)
    }

    pub fn all_subtasks_terminal(&self) -> bool {
        self.subtasks.iter().all(|e| e.state.is_terminal())
    }

    /// Hands out the next input split for a subtask, preferring splits local
    /// to the given host.
    pub fn next_input_split(
        &mut self,
        host: Option<&str>,
        subtask_index: usize,
    ) -> Option<InputSplit> {
        match self.split_assigner.as_mut() {
            Some(assigner) => assigner.next_split(host, subtask_index),
            None => {
                warn!("vertex {} has no input-split assigner", self.name);
                None
            }
        }
    }

    /// Replaces every subtask with a fresh attempt and rebuilds the split
    /// assigner, for a job restart. Returns the new attempts.
    pub fn reset_for_restart(&mut self) -> CoordinationResult<()> {
        self.subtasks = self
            .subtasks
            .iter()
            .map(|e| Execution::new(e.attempt_number + 1))
            .collect();
        self.split_assigner = self
            .split_source
            .as_ref()
            .map(|source| {
                let splits = source.create_splits(self.parallelism)?;
                Ok::<_, CoordinationError>(source.create_assigner(splits))
            })
            .transpose()?;
        Ok(())
    }

    /// Drops the pieces that are not meaningful in the archive.
    pub fn prepare_for_archiving(&mut self) {
        self.split_source = None;
        self.split_assigner = None;
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::splits::VectorSplitSource;

    fn source_vertex(parallelism: usize, splits: usize) -> ExecutionJobVertex {
        let splits = (0..splits)
            .map(|n| InputSplit::new(n, json!({})))
            .collect::<Vec<_>>();
        let vertex = JobVertex::new("source", "demo.Source")
            .with_split_source(Arc::new(VectorSplitSource::new(splits)));
        ExecutionJobVertex::try_new(&vertex, parallelism, vec![], vec![]).unwrap()
    }

    #[test]
    fn test_materialization_creates_attempts_and_partitions() {
        let vertex = source_vertex(3, 0);
        assert_eq!(vertex.subtasks.len(), 3);
        assert_eq!(vertex.produced_partitions.len(), 3);
        assert!(vertex.is_source());
        assert!(vertex
            .subtasks
            .iter()
            .all(|e| e.state == ExecutionState::Created && e.attempt_number == 0));
    }

    #[test]
    fn test_zero_parallelism_is_rejected() {
        let vertex = JobVertex::new("bad", "demo.Bad");
        assert!(ExecutionJobVertex::try_new(&vertex, 0, vec![], vec![]).is_err());
    }

    #[test]
    fn test_restart_renews_attempts_and_splits() {
        let mut vertex = source_vertex(1, 2);
        let first_attempt = vertex.subtasks[0].attempt_id;
        assert!(vertex.next_input_split(None, 0).is_some());
        assert!(vertex.next_input_split(None, 0).is_some());
        assert!(vertex.next_input_split(None, 0).is_none());

        vertex.reset_for_restart().unwrap();
        assert_ne!(vertex.subtasks[0].attempt_id, first_attempt);
        assert_eq!(vertex.subtasks[0].attempt_number, 1);
        // The assigner is rebuilt, so the splits are handed out again.
        assert!(vertex.next_input_split(None, 0).is_some());
    }
}
