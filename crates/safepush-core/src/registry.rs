//! Remote execution/registry service abstraction.
//!
//! The harness treats the registry purely as a polling job queue:
//! - `submit` starts a job and returns immediately
//! - `get_status` re-fetches the job
//! - `list_versions` / `get_schema` expose a model's versions and their
//!   OpenAPI documents
//! - `latest_schema` reads the deployed document of a model whose versions
//!   are not listable (public models)
//!
//! Transport is out of scope. In-memory fakes live in [`crate::fakes`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::context::{Mode, ModelRef};

/// Errors returned by a [`Registry`] implementation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    /// The addressed entity does not exist (HTTP 404 equivalent).
    #[error("not found: {what}")]
    NotFound { what: String },

    #[error("registry returned status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),
}

impl RegistryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::NotFound { .. })
    }
}

/// Result type for registry operations.
pub type RegistryResult<T> = std::result::Result<T, RegistryError>;

/// Lifecycle status of a remote job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[serde(alias = "starting")]
    Submitted,
    #[serde(alias = "processing")]
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Submitted => "submitted",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }
}

/// Whether a job runs inference or training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    Inference,
    Training,
}

impl From<&Mode> for JobMode {
    fn from(mode: &Mode) -> Self {
        if mode.is_training() {
            JobMode::Training
        } else {
            JobMode::Inference
        }
    }
}

/// One submitted execution, as last seen by the poller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub mode: JobMode,
    pub status: JobStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A registered version of a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub id: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// Fully qualified `owner/name:version` reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionRef {
    pub model: ModelRef,
    pub id: String,
}

impl std::fmt::Display for VersionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.model, self.id)
    }
}

/// How a submission addresses the code to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitTarget {
    /// A specific registered version (private models).
    Version(VersionRef),
    /// The model itself, letting the registry pick its deployed version
    /// (public/unregistered models that do not expose versions).
    Model(ModelRef),
}

impl std::fmt::Display for SubmitTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmitTarget::Version(v) => write!(f, "{v}"),
            SubmitTarget::Model(m) => write!(f, "{m}"),
        }
    }
}

/// Remote execution and registry service.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Start a job. Training mode carries its destination model.
    async fn submit(
        &self,
        target: &SubmitTarget,
        input: &Map<String, Value>,
        mode: &Mode,
    ) -> RegistryResult<Job>;

    /// Re-fetch a job by id.
    async fn get_status(&self, job_id: &str) -> RegistryResult<Job>;

    /// Versions of a model, newest first.
    async fn list_versions(&self, model: &ModelRef) -> RegistryResult<Vec<Version>>;

    /// Full OpenAPI document of a version.
    async fn get_schema(&self, version: &VersionRef) -> RegistryResult<Value>;

    /// OpenAPI document of the model's latest deployed version, addressed by
    /// model. `None` when nothing is deployed.
    async fn latest_schema(&self, model: &ModelRef) -> RegistryResult<Option<Value>>;
}

/// Newest version of `model`, or `None` when it has never been pushed.
pub async fn latest_version(
    registry: &dyn Registry,
    model: &ModelRef,
) -> RegistryResult<Option<VersionRef>> {
    let versions = registry.list_versions(model).await?;
    Ok(versions.into_iter().next().map(|v| VersionRef {
        model: model.clone(),
        id: v.id,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_accepts_registry_aliases() {
        let s: JobStatus = serde_json::from_str("\"starting\"").unwrap();
        assert_eq!(s, JobStatus::Submitted);
        let s: JobStatus = serde_json::from_str("\"processing\"").unwrap();
        assert_eq!(s, JobStatus::Running);
        let s: JobStatus = serde_json::from_str("\"canceled\"").unwrap();
        assert!(s.is_terminal());
    }

    #[test]
    fn only_final_states_are_terminal() {
        assert!(!JobStatus::Submitted.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Canceled.is_terminal());
    }

    #[test]
    fn version_ref_display() {
        let v = VersionRef {
            model: ModelRef::new("acme", "sdxl"),
            id: "abc123".to_string(),
        };
        assert_eq!(v.to_string(), "acme/sdxl:abc123");
    }
}
