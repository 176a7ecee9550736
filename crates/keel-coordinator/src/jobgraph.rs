use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{CoordinationError, CoordinationResult};
use crate::id::{JobId, JobVertexId};
use crate::library::UserCodeContext;
use crate::splits::InputSplitSource;

/// The logical DAG submitted by a client. The coordinator materializes it
/// into an execution graph; it is never mutated after submission.
pub struct JobGraph {
    pub job_id: JobId,
    pub name: String,
    pub vertices: Vec<JobVertex>,
    pub edges: Vec<JobEdge>,
    pub checkpoint_settings: Option<CheckpointSettings>,
    pub session_timeout: Duration,
    pub schedule_mode: ScheduleMode,
    pub queued_scheduling: bool,
    pub artifact_keys: Vec<ArtifactKey>,
    pub classpaths: Vec<String>,
    /// Configured number of execution retries, or [None] to use the
    /// coordinator default.
    pub execution_retries: Option<usize>,
}

pub struct JobVertex {
    pub id: JobVertexId,
    pub name: String,
    pub invokable_class_name: String,
    pub parallelism: VertexParallelism,
    pub split_source: Option<Arc<dyn InputSplitSource>>,
    pub initializer: Option<Arc<dyn MasterInitHook>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEdge {
    pub source: JobVertexId,
    pub target: JobVertexId,
}

#[derive(Debug, Clone)]
pub struct CheckpointSettings {
    pub interval: Duration,
    pub timeout: Duration,
    pub trigger_vertices: Vec<JobVertexId>,
    pub ack_vertices: Vec<JobVertexId>,
    pub confirm_vertices: Vec<JobVertexId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleMode {
    /// Deploy every vertex when the job is scheduled.
    Eager,
    /// Deploy source vertices only; downstream vertices are deployed when a
    /// producer announces its partitions.
    LazyFromSources,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexParallelism {
    Fixed(usize),
    /// Resolved to the scheduler's total slot count at submission time.
    AutoMax,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactKey(pub String);

impl ArtifactKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }
}

impl std::fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A hook invoked on the coordinator under the job's user-code context
/// before the vertex is materialized.
pub trait MasterInitHook: Send + Sync {
    fn initialize_on_master(&self, context: &UserCodeContext) -> CoordinationResult<()>;
}

impl JobGraph {
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    /// Returns the vertices in topological order starting from the sources.
    /// Fails when the edge set references unknown vertices or contains a
    /// cycle.
    pub fn topologically_sorted(&self) -> CoordinationResult<Vec<&JobVertex>> {
        let index: HashMap<JobVertexId, usize> = self
            .vertices
            .iter()
            .enumerate()
            .map(|(i, v)| (v.id, i))
            .collect();
        let mut in_degree = vec![0usize; self.vertices.len()];
        let mut adjacency: Vec<Vec<usize>> = vec![vec![]; self.vertices.len()];
        for edge in &self.edges {
            let (Some(&source), Some(&target)) = (index.get(&edge.source), index.get(&edge.target))
            else {
                return Err(CoordinationError::JobSubmission(format!(
                    "edge {} -> {} references an unknown vertex",
                    edge.source, edge.target
                )));
            };
            adjacency[source].push(target);
            in_degree[target] += 1;
        }
        let mut ready: VecDeque<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut sorted = Vec::with_capacity(self.vertices.len());
        while let Some(current) = ready.pop_front() {
            sorted.push(&self.vertices[current]);
            for &next in &adjacency[current] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push_back(next);
                }
            }
        }
        if sorted.len() != self.vertices.len() {
            return Err(CoordinationError::JobSubmission(
                "the job graph contains a cycle".to_string(),
            ));
        }
        Ok(sorted)
    }

    /// Returns the ids of vertices without incoming edges.
    pub fn source_vertices(&self) -> Vec<JobVertexId> {
        self.vertices
            .iter()
            .filter(|v| !self.edges.iter().any(|e| e.target == v.id))
            .map(|v| v.id)
            .collect()
    }

    /// Returns the downstream vertex ids of the given vertex.
    pub fn consumers_of(&self, vertex_id: JobVertexId) -> Vec<JobVertexId> {
        self.edges
            .iter()
            .filter(|e| e.source == vertex_id)
            .map(|e| e.target)
            .collect()
    }

    /// Renders the plan as JSON for status frontends. The caller treats a
    /// failure as non-fatal and records an empty plan.
    pub fn json_plan(&self, parallelism: &HashMap<JobVertexId, usize>) -> CoordinationResult<String> {
        let nodes = self
            .vertices
            .iter()
            .map(|v| {
                json!({
                    "id": v.id.to_string(),
                    "name": v.name,
                    "invokable": v.invokable_class_name,
                    "parallelism": parallelism.get(&v.id).copied().unwrap_or(1),
                })
            })
            .collect::<Vec<_>>();
        let edges = self
            .edges
            .iter()
            .map(|e| {
                json!({
                    "source": e.source.to_string(),
                    "target": e.target.to_string(),
                })
            })
            .collect::<Vec<_>>();
        Ok(serde_json::to_string(&json!({
            "jid": self.job_id.to_string(),
            "name": self.name,
            "nodes": nodes,
            "edges": edges,
        }))?)
    }
}

/// A builder-flavored constructor used by clients and tests.
pub struct JobGraphBuilder {
    graph: JobGraph,
}

impl JobGraphBuilder {
    pub fn new(job_id: JobId, name: impl Into<String>) -> Self {
        Self {
            graph: JobGraph {
                job_id,
                name: name.into(),
                vertices: vec![],
                edges: vec![],
                checkpoint_settings: None,
                session_timeout: Duration::from_secs(0),
                schedule_mode: ScheduleMode::Eager,
                queued_scheduling: false,
                artifact_keys: vec![],
                classpaths: vec![],
                execution_retries: None,
            },
        }
    }

    pub fn vertex(mut self, vertex: JobVertex) -> Self {
        self.graph.vertices.push(vertex);
        self
    }

    pub fn edge(mut self, source: JobVertexId, target: JobVertexId) -> Self {
        self.graph.edges.push(JobEdge { source, target });
        self
    }

    pub fn checkpointing(mut self, settings: CheckpointSettings) -> Self {
        self.graph.checkpoint_settings = Some(settings);
        self
    }

    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.graph.session_timeout = timeout;
        self
    }

    pub fn schedule_mode(mut self, mode: ScheduleMode) -> Self {
        self.graph.schedule_mode = mode;
        self
    }

    pub fn queued_scheduling(mut self, enabled: bool) -> Self {
        self.graph.queued_scheduling = enabled;
        self
    }

    pub fn artifacts(mut self, keys: Vec<ArtifactKey>) -> Self {
        self.graph.artifact_keys = keys;
        self
    }

    pub fn execution_retries(mut self, retries: usize) -> Self {
        self.graph.execution_retries = Some(retries);
        self
    }

    pub fn build(self) -> JobGraph {
        self.graph
    }
}

impl JobVertex {
    pub fn new(name: impl Into<String>, invokable_class_name: impl Into<String>) -> Self {
        Self {
            id: JobVertexId::random(),
            name: name.into(),
            invokable_class_name: invokable_class_name.into(),
            parallelism: VertexParallelism::Fixed(1),
            split_source: None,
            initializer: None,
        }
    }

    pub fn with_parallelism(mut self, parallelism: VertexParallelism) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_split_source(mut self, source: Arc<dyn InputSplitSource>) -> Self {
        self.split_source = Some(source);
        self
    }

    pub fn with_initializer(mut self, initializer: Arc<dyn MasterInitHook>) -> Self {
        self.initializer = Some(initializer);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> (JobGraph, Vec<JobVertexId>) {
        let source = JobVertex::new("source", "demo.Source");
        let left = JobVertex::new("left", "demo.Map");
        let right = JobVertex::new("right", "demo.Map");
        let sink = JobVertex::new("sink", "demo.Sink");
        let ids = vec![source.id, left.id, right.id, sink.id];
        let graph = JobGraphBuilder::new(JobId::random(), "diamond")
            .vertex(sink)
            .vertex(right)
            .vertex(left)
            .vertex(source)
            .edge(ids[0], ids[1])
            .edge(ids[0], ids[2])
            .edge(ids[1], ids[3])
            .edge(ids[2], ids[3])
            .build();
        (graph, ids)
    }

    #[test]
    fn test_topological_sort_starts_from_sources() {
        let (graph, ids) = diamond();
        let sorted = graph.topologically_sorted().unwrap();
        let order: Vec<JobVertexId> = sorted.iter().map(|v| v.id).collect();
        assert_eq!(order[0], ids[0]);
        assert_eq!(order[3], ids[3]);
        assert_eq!(graph.source_vertices(), vec![ids[0]]);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let a = JobVertex::new("a", "demo.A");
        let b = JobVertex::new("b", "demo.B");
        let (a_id, b_id) = (a.id, b.id);
        let graph = JobGraphBuilder::new(JobId::random(), "cyclic")
            .vertex(a)
            .vertex(b)
            .edge(a_id, b_id)
            .edge(b_id, a_id)
            .build();
        assert!(matches!(
            graph.topologically_sorted(),
            Err(CoordinationError::JobSubmission(_))
        ));
    }

    #[test]
    fn test_json_plan_contains_all_vertices() {
        let (graph, ids) = diamond();
        let parallelism = ids.iter().map(|id| (*id, 2)).collect();
        let plan = graph.json_plan(&parallelism).unwrap();
        let value: serde_json::Value = serde_json::from_str(&plan).unwrap();
        assert_eq!(value["nodes"].as_array().unwrap().len(), 4);
        assert_eq!(value["edges"].as_array().unwrap().len(), 4);
    }
}
