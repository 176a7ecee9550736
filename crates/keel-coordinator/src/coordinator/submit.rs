use std::collections::HashMap;

use log::{info, warn};
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::coordinator::{
    CoordinatorActor, CoordinatorEvent, JobEntry, JobInfo, PreparedSubmission,
};
use crate::error::{CoordinationError, CoordinationResult};
use crate::graph::vertex::ExecutionJobVertex;
use crate::graph::ExecutionGraph;
use crate::id::{JobId, JobVertexId};
use crate::jobgraph::{JobGraph, VertexParallelism};
use crate::library::prepare_user_code;
use crate::protocol::{ClientGateway, ClientMessage, ListeningMode};
use keel_common::datetime::current_time_millis;
use keel_server::actor::{ActorAction, ActorContext};

/// Whether a submission materialized a new execution graph or re-attached
/// to a live one (session resumption).
enum SubmissionOutcome {
    New,
    Resumed,
}

impl CoordinatorActor {
    /// Phase one of a submission: validate the graph reference and send the
    /// artifact keys for materialization off the loop. Registering the
    /// artifacts first means any later failure can trigger their cleanup.
    pub(super) fn handle_submit_job(
        &mut self,
        ctx: &mut ActorContext<Self>,
        graph: Option<JobGraph>,
        mode: ListeningMode,
        client: ClientGateway,
    ) -> ActorAction {
        let Some(graph) = graph else {
            let _ = client.send(ClientMessage::JobResultFailure {
                job_id: JobId::from(Uuid::nil()),
                cause: CoordinationError::JobSubmission(
                    "job graph must not be null".to_string(),
                )
                .to_failure_cause(),
            });
            return ActorAction::Continue;
        };
        info!("received job {} ({})", graph.job_id, graph.name);
        let store = self.options.artifact_store.clone();
        let handle = ctx.handle().clone();
        ctx.spawn(async move {
            let user_code = prepare_user_code(
                store,
                graph.job_id,
                &graph.artifact_keys,
                graph.classpaths.clone(),
            )
            .await;
            handle
                .send(CoordinatorEvent::SubmissionPrepared {
                    submission: PreparedSubmission {
                        graph,
                        mode,
                        client,
                        user_code,
                    },
                })
                .await
        });
        ActorAction::Continue
    }

    /// Phase two: materialize the execution graph and answer the client.
    /// Any failure unwinds the submission (artifacts unregistered, live
    /// table entry removed, constructed graph failed).
    pub(super) fn handle_submission_prepared(
        &mut self,
        ctx: &mut ActorContext<Self>,
        submission: PreparedSubmission,
    ) -> ActorAction {
        let PreparedSubmission {
            graph,
            mode,
            client,
            user_code,
        } = submission;
        let job_id = graph.job_id;
        match self.finish_submission(ctx, graph, mode, &client, user_code) {
            Ok(outcome) => {
                let _ = client.send(ClientMessage::JobSubmitSuccess { job_id });
                match outcome {
                    // Scheduling is an independent step after the reply; its
                    // failure does not undo the submission.
                    SubmissionOutcome::New => self.schedule_job(ctx, job_id),
                    SubmissionOutcome::Resumed => self.replay_result_if_terminal(job_id),
                }
            }
            Err(e) => {
                warn!("submission of job {job_id} failed: {e}");
                self.library_cache.unregister_job(job_id);
                if let Some(mut entry) = self.jobs.remove(&job_id) {
                    let actions = entry.graph.fail(&e.to_string());
                    self.run_graph_actions(ctx, actions);
                }
                let _ = client.send(ClientMessage::JobResultFailure {
                    job_id,
                    cause: e.into_job_error().to_failure_cause(),
                });
            }
        }
        ActorAction::Continue
    }

    fn finish_submission(
        &mut self,
        ctx: &mut ActorContext<Self>,
        graph: JobGraph,
        mode: ListeningMode,
        client: &ClientGateway,
        user_code: CoordinationResult<crate::library::UserCodeContext>,
    ) -> CoordinationResult<SubmissionOutcome> {
        let job_id = graph.job_id;
        let user_code = user_code?;
        if graph.is_empty() {
            return Err(CoordinationError::JobSubmission(
                "The given job is empty".to_string(),
            ));
        }
        if self.library_cache.context(job_id).is_none() {
            self.library_cache.register_job(job_id, user_code.clone());
        }
        let client_gateway = if mode.is_detached() {
            None
        } else {
            Some(client.clone())
        };

        // Session resumption: a live execution graph for this job id is
        // reused instead of being rebuilt.
        if self.jobs.contains_key(&job_id) {
            return self.resume_session(ctx, job_id, mode, client_gateway);
        }

        let mut execution_graph = ExecutionGraph::new(job_id, graph.name.clone(), user_code.clone());
        execution_graph.set_retries(
            graph
                .execution_retries
                .unwrap_or(self.options.default_execution_retries),
        );
        execution_graph.set_retry_delay(self.options.execution_retry_delay);
        execution_graph.set_schedule_mode(graph.schedule_mode);
        execution_graph.set_queued_scheduling(graph.queued_scheduling);

        // Resolve parallelism and run master-init hooks before the vertices
        // are materialized.
        let total_slots = self.scheduler.total_slots();
        let mut parallelism: HashMap<JobVertexId, usize> = HashMap::new();
        for vertex in &graph.vertices {
            if vertex.invokable_class_name.is_empty() {
                return Err(CoordinationError::JobSubmission(format!(
                    "vertex {} has no invokable class",
                    vertex.name
                )));
            }
            let resolved = match vertex.parallelism {
                VertexParallelism::Fixed(n) => n,
                VertexParallelism::AutoMax => total_slots,
            };
            parallelism.insert(vertex.id, resolved);
            if let Some(hook) = &vertex.initializer {
                hook.initialize_on_master(&user_code)
                    .map_err(|e| CoordinationError::JobExecution(e.to_string()))?;
            }
        }

        // The JSON plan is best effort and never a submission failure.
        match graph.json_plan(&parallelism) {
            Ok(plan) => execution_graph.set_json_plan(plan),
            Err(e) => {
                warn!("failed to render the JSON plan for job {job_id}: {e}");
                execution_graph.set_json_plan("{}".to_string());
            }
        }

        let sorted = graph.topologically_sorted()?;
        let mut vertices = Vec::with_capacity(sorted.len());
        for vertex in sorted {
            let inputs: Vec<JobVertexId> = graph
                .edges
                .iter()
                .filter(|e| e.target == vertex.id)
                .map(|e| e.source)
                .collect();
            let consumers = graph.consumers_of(vertex.id);
            vertices.push(ExecutionJobVertex::try_new(
                vertex,
                parallelism[&vertex.id],
                inputs,
                consumers,
            )?);
        }
        execution_graph.attach_vertices(vertices);

        if let Some(settings) = &graph.checkpoint_settings {
            execution_graph.enable_checkpointing(settings)?;
        }

        // The status listener posts back into the coordinator loop; the
        // job id is the only link between the graph and the live table.
        let (status_tx, mut status_rx) = mpsc::unbounded_channel();
        execution_graph.register_status_listener(status_tx);
        let handle = ctx.handle().clone();
        ctx.spawn(async move {
            while let Some(change) = status_rx.recv().await {
                handle
                    .send(CoordinatorEvent::JobStatusChanged {
                        job_id: change.job_id,
                        status: change.status,
                        timestamp: change.timestamp,
                        error: change.error,
                    })
                    .await?;
            }
            Ok(())
        });

        if mode.wants_state_changes() {
            let (execution_tx, mut execution_rx) = mpsc::unbounded_channel();
            execution_graph.register_execution_listener(execution_tx);
            let listener = client.clone();
            ctx.spawn(async move {
                while let Some(change) = execution_rx.recv().await {
                    if listener
                        .send(ClientMessage::ExecutionStateChanged {
                            job_id: change.job_id,
                            vertex_id: change.vertex_id,
                            subtask_index: change.subtask_index,
                            attempt_id: change.attempt_id,
                            state: change.state,
                            error: change.error,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(())
            });
        }

        let session_alive = !graph.session_timeout.is_zero();
        let checkpoint_interval = execution_graph
            .checkpoint_coordinator()
            .map(|c| c.interval());
        self.jobs.insert(
            job_id,
            JobEntry {
                graph: execution_graph,
                info: JobInfo {
                    client: client_gateway,
                    listening_mode: mode,
                    start: current_time_millis(),
                    end: None,
                    session_alive,
                    session_timeout: if session_alive {
                        graph.session_timeout
                    } else {
                        self.options.session_timeout
                    },
                    last_active: Instant::now(),
                },
            },
        );
        if let Some(interval) = checkpoint_interval {
            ctx.send_with_delay(CoordinatorEvent::TriggerCheckpoint { job_id }, interval);
        }
        Ok(SubmissionOutcome::New)
    }

    /// Re-attaches a client to a live execution graph submitted under the
    /// same job id within its session, refreshing the session watermark.
    fn resume_session(
        &mut self,
        ctx: &mut ActorContext<Self>,
        job_id: JobId,
        mode: ListeningMode,
        client_gateway: Option<ClientGateway>,
    ) -> CoordinationResult<SubmissionOutcome> {
        info!("job {job_id} is resumed within its session");
        let Some(entry) = self.jobs.get_mut(&job_id) else {
            return Err(CoordinationError::internal(format!(
                "job {job_id} disappeared during session resumption"
            )));
        };
        entry.info.listening_mode = mode;
        entry.info.client = client_gateway;
        entry.info.last_active = Instant::now();
        if entry.graph.is_terminal() && entry.info.session_alive {
            let watermark = entry.info.last_active;
            ctx.send_with_delay(
                CoordinatorEvent::ProbeSessionTimeout { job_id, watermark },
                entry.info.session_timeout,
            );
        }
        Ok(SubmissionOutcome::Resumed)
    }

    /// Replays the result of an already-settled job to the re-attached
    /// client, after the submit acknowledgment.
    fn replay_result_if_terminal(&mut self, job_id: JobId) {
        let Some(entry) = self.jobs.get(&job_id) else {
            return;
        };
        if !entry.graph.is_terminal() {
            return;
        }
        let Some(client) = &entry.info.client else {
            return;
        };
        let timestamp = entry.info.end.unwrap_or_else(current_time_millis);
        let (message, poison) = Self::terminal_result_message(
            &entry.graph,
            entry.graph.status(),
            entry.info.start,
            timestamp,
            entry.graph.failure_cause(),
        );
        let _ = client.send(message);
        if let Some(poison) = poison {
            warn!("replayed a non-terminal result for job {job_id}: {poison}");
        }
    }

    /// Invokes schedule-for-execution on a freshly submitted graph.
    /// Errors are reported through the graph's own fail path, which emits a
    /// follow-up status-change message.
    pub(super) fn schedule_job(&mut self, ctx: &mut ActorContext<Self>, job_id: JobId) {
        let actions = {
            let Some(entry) = self.jobs.get_mut(&job_id) else {
                return;
            };
            if entry.graph.status() != crate::graph::JobStatus::Created {
                return;
            }
            match entry.graph.schedule_for_execution(&mut self.scheduler) {
                Ok(actions) => actions,
                Err(e) => {
                    warn!("scheduling job {job_id} failed: {e}");
                    entry.graph.fail(&e.to_string())
                }
            }
        };
        self.run_graph_actions(ctx, actions);
    }
}
