use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use log::warn;

use crate::error::{CoordinationError, CoordinationResult};
use crate::id::JobId;
use crate::jobgraph::ArtifactKey;

/// Materializes artifact keys into locally accessible paths.
/// Materialization may perform IO and therefore runs off the event loop.
#[async_trait]
pub trait ArtifactStore: Send + Sync + 'static {
    async fn materialize(&self, key: &ArtifactKey) -> CoordinationResult<PathBuf>;
}

/// Resolves artifact keys against a local directory.
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn materialize(&self, key: &ArtifactKey) -> CoordinationResult<PathBuf> {
        let path = self.root.join(&key.0);
        if !path.starts_with(&self.root) {
            return Err(CoordinationError::invalid(format!(
                "artifact key {key} escapes the artifact directory"
            )));
        }
        match tokio::fs::try_exists(&path).await {
            Ok(true) => Ok(path),
            Ok(false) => Err(CoordinationError::invalid(format!(
                "artifact {key} not found"
            ))),
            Err(e) => Err(e.into()),
        }
    }
}

/// The class-loading context handed to master-init hooks and deployments.
#[derive(Debug, Clone)]
pub struct UserCodeContext {
    pub job_id: JobId,
    pub artifact_paths: Vec<PathBuf>,
    pub classpaths: Vec<String>,
}

impl UserCodeContext {
    pub fn artifact_locations(&self) -> Vec<String> {
        self.artifact_paths
            .iter()
            .map(|p| p.display().to_string())
            .collect()
    }
}

/// Materializes a job's artifacts and builds its user-code context.
/// Runs off the event loop; the result is routed back as a message.
pub async fn prepare_user_code(
    store: Arc<dyn ArtifactStore>,
    job_id: JobId,
    keys: &[ArtifactKey],
    classpaths: Vec<String>,
) -> CoordinationResult<UserCodeContext> {
    let mut artifact_paths = Vec::with_capacity(keys.len());
    for key in keys {
        let path = store
            .materialize(key)
            .await
            .map_err(|e| CoordinationError::JobSubmission(e.to_string()))?;
        artifact_paths.push(path);
    }
    Ok(UserCodeContext {
        job_id,
        artifact_paths,
        classpaths,
    })
}

/// Registry of materialized user code per live job, owned by the
/// coordinator and mutated only on the event loop.
pub struct LibraryCacheManager {
    entries: HashMap<JobId, UserCodeContext>,
}

impl LibraryCacheManager {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn register_job(&mut self, job_id: JobId, context: UserCodeContext) {
        if self.entries.insert(job_id, context).is_some() {
            warn!("job {job_id} was already registered with the library cache");
        }
    }

    pub fn context(&self, job_id: JobId) -> Option<&UserCodeContext> {
        self.entries.get(&job_id)
    }

    pub fn unregister_job(&mut self, job_id: JobId) -> bool {
        self.entries.remove(&job_id).is_some()
    }

    pub fn shutdown(&mut self) {
        self.entries.clear();
    }
}

impl Default for LibraryCacheManager {
    fn default() -> Self {
        Self::new()
    }
}

/// An artifact store that refuses every key, for deployments without a blob
/// service. Jobs that carry no artifacts never hit it.
pub struct NoArtifactStore;

#[async_trait]
impl ArtifactStore for NoArtifactStore {
    async fn materialize(&self, key: &ArtifactKey) -> CoordinationResult<PathBuf> {
        Err(CoordinationError::invalid(format!(
            "no artifact store is configured (requested {key})"
        )))
    }
}
