use std::collections::VecDeque;

use async_trait::async_trait;
use log::info;
use tokio::sync::oneshot;

use crate::error::CoordinationError;
use crate::graph::{ExecutionGraph, JobStatus};
use crate::id::JobId;
use keel_server::actor::{Actor, ActorAction, ActorContext};

/// Bounded in-memory history of terminated execution graphs.
/// Runs as its own actor so status queries for archived jobs can be awaited
/// off the coordinator loop.
pub struct ArchiveActor {
    max_count: usize,
    jobs: VecDeque<Box<ExecutionGraph>>,
}

#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    pub max_count: usize,
}

pub enum ArchiveEvent {
    Archive {
        graph: Box<ExecutionGraph>,
    },
    RequestJobStatus {
        job_id: JobId,
        reply: oneshot::Sender<Option<JobStatus>>,
    },
    RequestCounts {
        reply: oneshot::Sender<ArchivedJobCounts>,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchivedJobCounts {
    pub finished: usize,
    pub canceled: usize,
    pub failed: usize,
}

#[async_trait]
impl Actor for ArchiveActor {
    type Message = ArchiveEvent;
    type Options = ArchiveOptions;
    type Error = CoordinationError;

    fn name() -> &'static str {
        "ArchiveActor"
    }

    fn new(options: ArchiveOptions) -> Self {
        Self {
            max_count: options.max_count,
            jobs: VecDeque::new(),
        }
    }

    async fn start(&mut self, _: &mut ActorContext<Self>) -> Result<(), Self::Error> {
        Ok(())
    }

    fn receive(
        &mut self,
        _: &mut ActorContext<Self>,
        message: ArchiveEvent,
    ) -> Result<ActorAction, Self::Error> {
        match message {
            ArchiveEvent::Archive { graph } => {
                info!(
                    "archiving job {} with terminal status {}",
                    graph.job_id(),
                    graph.status()
                );
                // A resubmitted job id replaces its older archive entry.
                self.jobs.retain(|g| g.job_id() != graph.job_id());
                self.jobs.push_back(graph);
                while self.jobs.len() > self.max_count {
                    self.jobs.pop_front();
                }
            }
            ArchiveEvent::RequestJobStatus { job_id, reply } => {
                let status = self
                    .jobs
                    .iter()
                    .find(|g| g.job_id() == job_id)
                    .map(|g| g.status());
                let _ = reply.send(status);
            }
            ArchiveEvent::RequestCounts { reply } => {
                let mut counts = ArchivedJobCounts::default();
                for graph in &self.jobs {
                    match graph.status() {
                        JobStatus::Finished => counts.finished += 1,
                        JobStatus::Canceled => counts.canceled += 1,
                        JobStatus::Failed => counts.failed += 1,
                        _ => {}
                    }
                }
                let _ = reply.send(counts);
            }
        }
        Ok(ActorAction::Continue)
    }

    async fn stop(self, _: &mut ActorContext<Self>) -> Result<(), Self::Error> {
        Ok(())
    }
}
