use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use keel_common::config::AppConfig;
use keel_coordinator::coordinator::{
    CoordinatorActor, CoordinatorEvent, CoordinatorHandle, CoordinatorOptions,
};
use keel_coordinator::election::StandaloneLeaderElection;
use keel_coordinator::graph::execution::ExecutionState;
use keel_coordinator::graph::JobStatus;
use keel_coordinator::id::{InstanceId, JobId, LeaderSessionId};
use keel_coordinator::jobgraph::{
    CheckpointSettings, JobGraph, JobGraphBuilder, JobVertex, VertexParallelism,
};
use keel_coordinator::library::NoArtifactStore;
use keel_coordinator::protocol::{
    CancellationResponse, ClientMessage, ClusterMessage, CheckpointMessage, HardwareDescription,
    InstanceConnectionInfo, JobStatusResponse, ListeningMode, RegistrationResponse,
    TaskDeploymentDescriptor, TaskExecutionState, TaskManagerEnvelope, TaskManagerMessage,
};
use keel_coordinator::error::JobFailureKind;
use keel_server::actor::ActorHandle;

const WAIT: Duration = Duration::from_secs(5);

struct TestCluster {
    handle: CoordinatorHandle,
    session: LeaderSessionId,
}

struct TestWorker {
    instance_id: InstanceId,
    inbox: mpsc::UnboundedReceiver<TaskManagerEnvelope>,
    gateway: mpsc::UnboundedSender<TaskManagerEnvelope>,
}

struct TestClient {
    gateway: mpsc::UnboundedSender<ClientMessage>,
    inbox: mpsc::UnboundedReceiver<ClientMessage>,
}

impl TestClient {
    fn new() -> Self {
        let (gateway, inbox) = mpsc::unbounded_channel();
        Self { gateway, inbox }
    }

    async fn next(&mut self) -> ClientMessage {
        timeout(WAIT, self.inbox.recv())
            .await
            .expect("timed out waiting for a client message")
            .expect("client channel closed")
    }
}

impl TestCluster {
    async fn start() -> Self {
        let mut config = AppConfig::load().unwrap();
        // Keep restarts fast so retry scenarios settle within the test
        // timeout.
        config.coordinator.execution_retry_delay_ms = 50;
        let options = CoordinatorOptions::try_new(
            &config,
            Arc::new(NoArtifactStore),
            Arc::new(StandaloneLeaderElection::new()),
        )
        .unwrap();
        let handle = ActorHandle::<CoordinatorActor>::new(options);
        let session = LeaderSessionId::random();
        handle
            .send(CoordinatorEvent::GrantLeadership { session })
            .await
            .unwrap();
        let cluster = Self { handle, session };
        cluster.await_leadership().await;
        cluster
    }

    /// Leadership confirmation runs off the loop; poll with a stamped query
    /// until it is accepted.
    async fn await_leadership(&self) {
        for _ in 0..100 {
            let (tx, rx) = oneshot::channel();
            self.send(ClusterMessage::RequestRunningJobs { reply: tx }).await;
            if rx.await.is_ok() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("coordinator never became leader");
    }

    async fn send(&self, message: ClusterMessage) {
        self.handle
            .send(CoordinatorEvent::Message {
                session: self.session,
                message,
            })
            .await
            .unwrap();
    }

    async fn register_worker(&self, host: &str, port: u16, slot_count: usize) -> TestWorker {
        let (gateway, inbox) = mpsc::unbounded_channel();
        let (tx, rx) = oneshot::channel();
        self.send(ClusterMessage::RegisterTaskManager {
            connection: InstanceConnectionInfo {
                host: host.to_string(),
                data_port: port,
            },
            hardware: HardwareDescription {
                cpu_cores: 4,
                physical_memory: 1 << 32,
                free_memory: 1 << 31,
            },
            slot_count,
            gateway: gateway.clone(),
            reply: tx,
        })
        .await;
        match rx.await.unwrap() {
            RegistrationResponse::AcknowledgeRegistration { instance_id, .. } => TestWorker {
                instance_id,
                inbox,
                gateway,
            },
            other => panic!("unexpected registration response: {other:?}"),
        }
    }

    async fn submit(&self, graph: JobGraph, mode: ListeningMode) -> TestClient {
        let client = TestClient::new();
        self.send(ClusterMessage::SubmitJob {
            graph: Some(graph),
            mode,
            client: client.gateway.clone(),
        })
        .await;
        client
    }

    async fn report_task_state(&self, state: TaskExecutionState) -> bool {
        let (tx, rx) = oneshot::channel();
        self.send(ClusterMessage::UpdateTaskExecutionState {
            state: Some(state),
            reply: tx,
        })
        .await;
        rx.await.unwrap()
    }

    async fn job_status(&self, job_id: JobId) -> JobStatusResponse {
        let (tx, rx) = oneshot::channel();
        self.send(ClusterMessage::RequestJobStatus { job_id, reply: tx })
            .await;
        rx.await.unwrap()
    }
}

impl TestWorker {
    async fn next_envelope(&mut self) -> TaskManagerEnvelope {
        timeout(WAIT, self.inbox.recv())
            .await
            .expect("timed out waiting for a task manager message")
            .expect("task manager channel closed")
    }

    async fn next_deployment(&mut self) -> TaskDeploymentDescriptor {
        loop {
            if let TaskManagerMessage::SubmitTask { deployment } = self.next_envelope().await.message
            {
                return deployment;
            }
        }
    }
}

fn single_vertex_graph(parallelism: usize) -> JobGraph {
    JobGraphBuilder::new(JobId::random(), "test-job")
        .vertex(
            JobVertex::new("v", "demo.Invokable")
                .with_parallelism(VertexParallelism::Fixed(parallelism)),
        )
        .build()
}

async fn run_to_running(
    cluster: &TestCluster,
    worker: &mut TestWorker,
    count: usize,
) -> Vec<TaskDeploymentDescriptor> {
    let mut deployments = vec![];
    for _ in 0..count {
        let deployment = worker.next_deployment().await;
        assert!(cluster
            .report_task_state(TaskExecutionState {
                job_id: deployment.job_id,
                attempt_id: deployment.attempt_id,
                state: ExecutionState::Running,
                error: None,
            })
            .await);
        deployments.push(deployment);
    }
    deployments
}

#[tokio::test]
async fn test_happy_path_submission() {
    let cluster = TestCluster::start().await;
    let mut worker = cluster.register_worker("worker-a", 41000, 2).await;

    let graph = single_vertex_graph(2);
    let job_id = graph.job_id;
    let mut client = cluster.submit(graph, ListeningMode::ExecutionResult).await;
    match client.next().await {
        ClientMessage::JobSubmitSuccess { job_id: id } => assert_eq!(id, job_id),
        _ => panic!("expected a submit acknowledgment"),
    }

    let deployments = run_to_running(&cluster, &mut worker, 2).await;
    for deployment in &deployments {
        assert_eq!(deployment.job_id, job_id);
        assert!(cluster
            .report_task_state(TaskExecutionState {
                job_id,
                attempt_id: deployment.attempt_id,
                state: ExecutionState::Finished,
                error: None,
            })
            .await);
    }

    match client.next().await {
        ClientMessage::JobResultSuccess { result } => {
            assert_eq!(result.job_id, job_id);
            assert!(result.accumulator_results.is_empty());
        }
        _ => panic!("expected a successful job result"),
    }
}

#[tokio::test]
async fn test_empty_job_is_rejected() {
    let cluster = TestCluster::start().await;
    let graph = JobGraphBuilder::new(JobId::random(), "empty").build();
    let job_id = graph.job_id;
    let mut client = cluster.submit(graph, ListeningMode::ExecutionResult).await;
    match client.next().await {
        ClientMessage::JobResultFailure { job_id: id, cause } => {
            assert_eq!(id, job_id);
            assert_eq!(cause.kind, JobFailureKind::Submission);
            assert!(cause.message.contains("empty"));
        }
        _ => panic!("expected a submission failure"),
    }

    // No live-jobs entry was created.
    let (tx, rx) = oneshot::channel();
    cluster
        .send(ClusterMessage::RequestRunningJobs { reply: tx })
        .await;
    assert!(rx.await.unwrap().is_empty());
}

#[tokio::test]
async fn test_duplicate_registration_replies_already_registered() {
    let cluster = TestCluster::start().await;
    let worker = cluster.register_worker("worker-a", 41000, 2).await;

    let (gateway, _inbox) = mpsc::unbounded_channel();
    let (tx, rx) = oneshot::channel();
    cluster
        .send(ClusterMessage::RegisterTaskManager {
            connection: InstanceConnectionInfo {
                host: "worker-a".to_string(),
                data_port: 41000,
            },
            hardware: HardwareDescription {
                cpu_cores: 4,
                physical_memory: 1 << 32,
                free_memory: 1 << 31,
            },
            slot_count: 2,
            gateway,
            reply: tx,
        })
        .await;
    match rx.await.unwrap() {
        RegistrationResponse::AlreadyRegistered { instance_id, .. } => {
            assert_eq!(instance_id, worker.instance_id);
        }
        other => panic!("unexpected registration response: {other:?}"),
    }
}

#[tokio::test]
async fn test_cancellation_round_trip() {
    let cluster = TestCluster::start().await;
    let mut worker = cluster.register_worker("worker-a", 41000, 1).await;

    let graph = single_vertex_graph(1);
    let job_id = graph.job_id;
    let mut client = cluster.submit(graph, ListeningMode::ExecutionResult).await;
    client.next().await;
    let deployments = run_to_running(&cluster, &mut worker, 1).await;

    let (tx, rx) = oneshot::channel();
    cluster
        .send(ClusterMessage::CancelJob { job_id, reply: tx })
        .await;
    assert_eq!(
        rx.await.unwrap(),
        CancellationResponse::Success { job_id }
    );

    // The worker is asked to cancel the running attempt and reports back.
    loop {
        if let TaskManagerMessage::CancelTask { attempt_id } = worker.next_envelope().await.message {
            assert_eq!(attempt_id, deployments[0].attempt_id);
            break;
        }
    }
    assert!(cluster
        .report_task_state(TaskExecutionState {
            job_id,
            attempt_id: deployments[0].attempt_id,
            state: ExecutionState::Canceled,
            error: None,
        })
        .await);

    match client.next().await {
        ClientMessage::JobResultFailure { cause, .. } => {
            assert_eq!(cause.kind, JobFailureKind::Cancellation);
            assert!(cause.message.contains("Job was cancelled."));
        }
        _ => panic!("expected a cancellation result"),
    }

    // The job is archived and still answers status queries.
    for _ in 0..100 {
        if cluster.job_status(job_id).await
            == (JobStatusResponse::Found {
                job_id,
                status: JobStatus::Canceled,
            })
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job never reached the archive");
}

#[tokio::test]
async fn test_second_cancel_after_removal_fails() {
    let cluster = TestCluster::start().await;
    let job_id = JobId::random();
    let (tx, rx) = oneshot::channel();
    cluster
        .send(ClusterMessage::CancelJob { job_id, reply: tx })
        .await;
    match rx.await.unwrap() {
        CancellationResponse::Failure { reason, .. } => {
            assert!(reason.contains("No job found"));
        }
        _ => panic!("expected a cancellation failure"),
    }
}

#[tokio::test]
async fn test_worker_death_fails_the_job() {
    let cluster = TestCluster::start().await;
    let mut worker = cluster.register_worker("worker-a", 41000, 1).await;

    let graph = single_vertex_graph(1);
    let job_id = graph.job_id;
    let mut client = cluster.submit(graph, ListeningMode::ExecutionResult).await;
    client.next().await;
    run_to_running(&cluster, &mut worker, 1).await;

    // The worker process dies: its back-channel closes.
    drop(worker.inbox);
    drop(worker.gateway);

    match client.next().await {
        ClientMessage::JobResultFailure { job_id: id, cause } => {
            assert_eq!(id, job_id);
            assert_eq!(cause.kind, JobFailureKind::Execution);
        }
        _ => panic!("expected a job failure"),
    }
}

#[tokio::test]
async fn test_worker_death_consumes_a_retry() {
    let cluster = TestCluster::start().await;
    let mut worker = cluster.register_worker("worker-a", 41000, 1).await;

    let graph = JobGraphBuilder::new(JobId::random(), "retried")
        .vertex(JobVertex::new("v", "demo.Invokable"))
        .execution_retries(1)
        .build();
    let job_id = graph.job_id;
    let mut client = cluster.submit(graph, ListeningMode::ExecutionResult).await;
    client.next().await;
    run_to_running(&cluster, &mut worker, 1).await;

    // A second worker stands by before the first one dies, so the restart
    // finds capacity.
    let mut replacement = cluster.register_worker("worker-b", 41001, 1).await;
    drop(worker.inbox);
    drop(worker.gateway);

    let deployment = replacement.next_deployment().await;
    assert_eq!(deployment.job_id, job_id);
    assert_eq!(deployment.attempt_number, 1);
    assert!(cluster
        .report_task_state(TaskExecutionState {
            job_id,
            attempt_id: deployment.attempt_id,
            state: ExecutionState::Running,
            error: None,
        })
        .await);
    assert!(cluster
        .report_task_state(TaskExecutionState {
            job_id,
            attempt_id: deployment.attempt_id,
            state: ExecutionState::Finished,
            error: None,
        })
        .await);
    match client.next().await {
        ClientMessage::JobResultSuccess { result } => assert_eq!(result.job_id, job_id),
        _ => panic!("expected the retried job to finish"),
    }
}

#[tokio::test]
async fn test_late_message_from_deposed_leader_is_dropped() {
    let cluster = TestCluster::start().await;
    let mut worker = cluster.register_worker("worker-a", 41000, 1).await;

    let graph = single_vertex_graph(1);
    let mut client = cluster.submit(graph, ListeningMode::ExecutionResult).await;
    client.next().await;
    let deployments = run_to_running(&cluster, &mut worker, 1).await;

    cluster
        .handle
        .send(CoordinatorEvent::RevokeLeadership)
        .await
        .unwrap();

    // The waiting client is told that all jobs were cleared.
    match client.next().await {
        ClientMessage::JobResultFailure { cause, .. } => {
            assert!(cause.message.contains("All jobs are cancelled and cleared"));
        }
        _ => panic!("expected a cancel-and-clear failure"),
    }
    // The worker is told to disconnect.
    loop {
        if let TaskManagerMessage::Disconnect { reason } = worker.next_envelope().await.message {
            assert!(reason.contains("no longer the leader"));
            break;
        }
    }

    // A delayed update stamped with the old session is silently dropped:
    // no reply, no state change.
    let (tx, rx) = oneshot::channel();
    cluster
        .send(ClusterMessage::UpdateTaskExecutionState {
            state: Some(TaskExecutionState {
                job_id: deployments[0].job_id,
                attempt_id: deployments[0].attempt_id,
                state: ExecutionState::Finished,
                error: None,
            }),
            reply: tx,
        })
        .await;
    assert!(rx.await.is_err());
}

#[tokio::test]
async fn test_session_resume_replays_the_result() {
    let cluster = TestCluster::start().await;
    let mut worker = cluster.register_worker("worker-a", 41000, 1).await;

    let job_id = JobId::random();
    let build = || {
        JobGraphBuilder::new(job_id, "session-job")
            .vertex(JobVertex::new("v", "demo.Invokable"))
            .session_timeout(Duration::from_secs(60))
            .build()
    };
    let mut client = cluster.submit(build(), ListeningMode::ExecutionResult).await;
    client.next().await;
    let deployments = run_to_running(&cluster, &mut worker, 1).await;
    assert!(cluster
        .report_task_state(TaskExecutionState {
            job_id,
            attempt_id: deployments[0].attempt_id,
            state: ExecutionState::Finished,
            error: None,
        })
        .await);
    match client.next().await {
        ClientMessage::JobResultSuccess { .. } => {}
        _ => panic!("expected the job to finish"),
    }

    // The job stays resumable within its session: a second submission with
    // the same id reuses the execution graph and replays the result.
    let mut resumed = cluster.submit(build(), ListeningMode::ExecutionResult).await;
    match resumed.next().await {
        ClientMessage::JobSubmitSuccess { job_id: id } => assert_eq!(id, job_id),
        _ => panic!("expected a submit acknowledgment"),
    }
    match resumed.next().await {
        ClientMessage::JobResultSuccess { result } => assert_eq!(result.job_id, job_id),
        _ => panic!("expected the replayed result"),
    }
}

#[tokio::test]
async fn test_checkpoint_round_trip() {
    let cluster = TestCluster::start().await;
    let mut worker = cluster.register_worker("worker-a", 41000, 1).await;

    let vertex = JobVertex::new("source", "demo.Source");
    let vertex_id = vertex.id;
    let graph = JobGraphBuilder::new(JobId::random(), "checkpointed")
        .vertex(vertex)
        .checkpointing(CheckpointSettings {
            interval: Duration::from_millis(50),
            timeout: Duration::from_secs(10),
            trigger_vertices: vec![vertex_id],
            ack_vertices: vec![vertex_id],
            confirm_vertices: vec![vertex_id],
        })
        .build();
    let job_id = graph.job_id;
    let mut client = cluster.submit(graph, ListeningMode::ExecutionResult).await;
    client.next().await;
    let deployments = run_to_running(&cluster, &mut worker, 1).await;
    let attempt_id = deployments[0].attempt_id;

    // The periodic trigger fires once the trigger subtasks are running.
    let checkpoint_id = loop {
        if let TaskManagerMessage::TriggerCheckpoint {
            checkpoint_id,
            attempt_id: target,
            ..
        } = worker.next_envelope().await.message
        {
            assert_eq!(target, attempt_id);
            break checkpoint_id;
        }
    };

    cluster
        .send(ClusterMessage::Checkpoint(CheckpointMessage::Acknowledge {
            job_id,
            checkpoint_id,
            attempt_id,
        }))
        .await;
    loop {
        if let TaskManagerMessage::ConfirmCheckpoint {
            checkpoint_id: confirmed,
            ..
        } = worker.next_envelope().await.message
        {
            assert_eq!(confirmed, checkpoint_id);
            break;
        }
    }

    // A duplicate acknowledgment is a no-op: the next confirm on the wire
    // belongs to a later checkpoint.
    cluster
        .send(ClusterMessage::Checkpoint(CheckpointMessage::Acknowledge {
            job_id,
            checkpoint_id,
            attempt_id,
        }))
        .await;
    loop {
        match worker.next_envelope().await.message {
            TaskManagerMessage::ConfirmCheckpoint {
                checkpoint_id: confirmed,
                ..
            } => {
                assert!(confirmed > checkpoint_id);
                break;
            }
            TaskManagerMessage::TriggerCheckpoint {
                checkpoint_id: triggered,
                ..
            } => {
                cluster
                    .send(ClusterMessage::Checkpoint(CheckpointMessage::Acknowledge {
                        job_id,
                        checkpoint_id: triggered,
                        attempt_id,
                    }))
                    .await;
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn test_overview_counts_live_and_archived_jobs() {
    let cluster = TestCluster::start().await;
    let mut worker = cluster.register_worker("worker-a", 41000, 2).await;

    let graph = single_vertex_graph(1);
    let job_id = graph.job_id;
    let mut client = cluster.submit(graph, ListeningMode::ExecutionResult).await;
    client.next().await;
    let deployments = run_to_running(&cluster, &mut worker, 1).await;
    assert!(cluster
        .report_task_state(TaskExecutionState {
            job_id,
            attempt_id: deployments[0].attempt_id,
            state: ExecutionState::Finished,
            error: None,
        })
        .await);
    client.next().await;

    // The finished job was removed and archived; overview merges both.
    for _ in 0..100 {
        let (tx, rx) = oneshot::channel();
        cluster
            .send(ClusterMessage::RequestOverview { reply: tx })
            .await;
        let overview = rx.await.unwrap();
        if overview.jobs_finished == 1 {
            assert_eq!(overview.instances, 1);
            assert_eq!(overview.total_slots, 2);
            assert_eq!(overview.available_slots, 2);
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("the finished job never showed up in the overview");
}
