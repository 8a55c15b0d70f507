//! In-memory fakes for the collaborator traits (testing only)
//!
//! Provides `FakeRegistry`, `ScriptedJudge`, and `MemoryMediaFetcher` that
//! satisfy the trait contracts without any network access.

use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};

use crate::context::{Mode, ModelRef};
use crate::error::{HarnessError, Result};
use crate::judge::{Attachment, JudgmentClient, JudgmentError};
use crate::media::{DownloadedFile, MediaFetcher};
use crate::registry::*;

// ---------------------------------------------------------------------------
// FakeRegistry
// ---------------------------------------------------------------------------

/// How a fake job behaves once submitted.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptedJob {
    /// Number of `get_status` calls before the job reports `status`.
    pub polls_until_terminal: u32,
    pub status: JobStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
}

impl ScriptedJob {
    pub fn succeeded(output: Value) -> Self {
        Self {
            polls_until_terminal: 1,
            status: JobStatus::Succeeded,
            output: Some(output),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            polls_until_terminal: 1,
            status: JobStatus::Failed,
            output: None,
            error: Some(error.into()),
        }
    }

    pub fn canceled() -> Self {
        Self {
            polls_until_terminal: 1,
            status: JobStatus::Canceled,
            output: None,
            error: None,
        }
    }

    /// A job that stays `running` forever.
    pub fn never_finishes() -> Self {
        Self {
            polls_until_terminal: u32::MAX,
            status: JobStatus::Running,
            output: None,
            error: None,
        }
    }

    pub fn after_polls(mut self, polls: u32) -> Self {
        self.polls_until_terminal = polls;
        self
    }
}

type Responder = Arc<dyn Fn(&Map<String, Value>) -> ScriptedJob + Send + Sync>;

/// One registered model of a [`FakeRegistry`].
#[derive(Clone)]
pub struct FakeModel {
    /// Newest first.
    versions: Vec<(Version, Value)>,
    public_only: bool,
    responder: Responder,
}

impl Default for FakeModel {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeModel {
    /// A model with no versions whose jobs succeed with output `"ok"`.
    pub fn new() -> Self {
        Self {
            versions: Vec::new(),
            public_only: false,
            responder: Arc::new(|_| ScriptedJob::succeeded(Value::String("ok".to_string()))),
        }
    }

    /// Push a version (with its OpenAPI document) as the newest one.
    pub fn with_version(mut self, id: impl Into<String>, openapi: Value) -> Self {
        let version = Version {
            id: id.into(),
            created_at: Some(Utc::now()),
        };
        self.versions.insert(0, (version, openapi));
        self
    }

    /// Versions exist but `list_versions` answers not-found, like a public model.
    pub fn public_only(mut self) -> Self {
        self.public_only = true;
        self
    }

    pub fn responding<F>(mut self, responder: F) -> Self
    where
        F: Fn(&Map<String, Value>) -> ScriptedJob + Send + Sync + 'static,
    {
        self.responder = Arc::new(responder);
        self
    }
}

/// A recorded `submit` call.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub job_id: String,
    pub target: SubmitTarget,
    pub input: Map<String, Value>,
    pub training: bool,
}

#[derive(Debug)]
struct JobState {
    job: Job,
    script: ScriptedJob,
    polls: u32,
}

/// In-memory registry backed by `HashMap<ModelRef, FakeModel>`.
#[derive(Default)]
pub struct FakeRegistry {
    models: Mutex<HashMap<ModelRef, FakeModel>>,
    jobs: Mutex<HashMap<String, JobState>>,
    submissions: Mutex<Vec<Submission>>,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(self, model: ModelRef, fake: FakeModel) -> Self {
        self.models.lock().unwrap().insert(model, fake);
        self
    }

    /// Every submission so far, in call order.
    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().unwrap().clone()
    }

    /// Submissions addressed to `model`, by version or by model.
    pub fn submissions_to(&self, model: &ModelRef) -> Vec<Submission> {
        self.submissions()
            .into_iter()
            .filter(|s| match &s.target {
                SubmitTarget::Version(v) => &v.model == model,
                SubmitTarget::Model(m) => m == model,
            })
            .collect()
    }

    pub fn poll_count(&self, job_id: &str) -> u32 {
        self.jobs
            .lock()
            .unwrap()
            .get(job_id)
            .map_or(0, |state| state.polls)
    }

    fn not_found(what: impl std::fmt::Display) -> RegistryError {
        RegistryError::NotFound {
            what: what.to_string(),
        }
    }
}

#[async_trait]
impl Registry for FakeRegistry {
    async fn submit(
        &self,
        target: &SubmitTarget,
        input: &Map<String, Value>,
        mode: &Mode,
    ) -> RegistryResult<Job> {
        let script = {
            let models = self.models.lock().unwrap();
            let fake = match target {
                SubmitTarget::Version(v) => models
                    .get(&v.model)
                    .filter(|m| m.versions.iter().any(|(ver, _)| ver.id == v.id))
                    .ok_or_else(|| Self::not_found(v))?,
                SubmitTarget::Model(m) => models.get(m).ok_or_else(|| Self::not_found(m))?,
            };
            (fake.responder)(input)
        };

        let status = if script.polls_until_terminal == 0 {
            script.status
        } else {
            JobStatus::Submitted
        };
        let job = Job {
            id: uuid::Uuid::new_v4().to_string(),
            mode: JobMode::from(mode),
            status,
            output: None,
            error: None,
            created_at: Utc::now(),
        };
        let job = if status.is_terminal() {
            Job {
                output: script.output.clone(),
                error: script.error.clone(),
                ..job
            }
        } else {
            job
        };

        self.submissions.lock().unwrap().push(Submission {
            job_id: job.id.clone(),
            target: target.clone(),
            input: input.clone(),
            training: mode.is_training(),
        });
        self.jobs.lock().unwrap().insert(
            job.id.clone(),
            JobState {
                job: job.clone(),
                script,
                polls: 0,
            },
        );
        Ok(job)
    }

    async fn get_status(&self, job_id: &str) -> RegistryResult<Job> {
        let mut jobs = self.jobs.lock().unwrap();
        let state = jobs
            .get_mut(job_id)
            .ok_or_else(|| Self::not_found(format!("job {job_id}")))?;
        state.polls = state.polls.saturating_add(1);
        if state.polls >= state.script.polls_until_terminal {
            state.job.status = state.script.status;
            state.job.output = state.script.output.clone();
            state.job.error = state.script.error.clone();
        } else {
            state.job.status = JobStatus::Running;
        }
        Ok(state.job.clone())
    }

    async fn list_versions(&self, model: &ModelRef) -> RegistryResult<Vec<Version>> {
        let models = self.models.lock().unwrap();
        let fake = models.get(model).ok_or_else(|| Self::not_found(model))?;
        if fake.public_only {
            return Err(Self::not_found(format!("versions of {model}")));
        }
        Ok(fake.versions.iter().map(|(v, _)| v.clone()).collect())
    }

    async fn get_schema(&self, version: &VersionRef) -> RegistryResult<Value> {
        let models = self.models.lock().unwrap();
        models
            .get(&version.model)
            .and_then(|m| m.versions.iter().find(|(v, _)| v.id == version.id))
            .map(|(_, schema)| schema.clone())
            .ok_or_else(|| Self::not_found(version))
    }

    async fn latest_schema(&self, model: &ModelRef) -> RegistryResult<Option<Value>> {
        let models = self.models.lock().unwrap();
        let fake = models.get(model).ok_or_else(|| Self::not_found(model))?;
        Ok(fake.versions.first().map(|(_, schema)| schema.clone()))
    }
}

// ---------------------------------------------------------------------------
// ScriptedJudge
// ---------------------------------------------------------------------------

/// Judgment client answering from queued scripts.
///
/// When a queue is empty the configured default answer is used, or a
/// `Service` error when there is none.
#[derive(Debug, Default)]
pub struct ScriptedJudge {
    booleans: Mutex<VecDeque<std::result::Result<bool, JudgmentError>>>,
    json: Mutex<VecDeque<std::result::Result<Value, JudgmentError>>>,
    default_boolean: Option<bool>,
    default_json: Option<Value>,
    boolean_prompts: Mutex<Vec<String>>,
    json_prompts: Mutex<Vec<String>>,
    attachments: Mutex<Vec<Vec<Attachment>>>,
}

impl ScriptedJudge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every unscripted yes/no question with `answer`.
    pub fn always(mut self, answer: bool) -> Self {
        self.default_boolean = Some(answer);
        self
    }

    /// Answer every unscripted generation request with `value`.
    pub fn always_json(mut self, value: Value) -> Self {
        self.default_json = Some(value);
        self
    }

    pub fn push_boolean(&self, answer: std::result::Result<bool, JudgmentError>) {
        self.booleans.lock().unwrap().push_back(answer);
    }

    pub fn push_json(&self, answer: std::result::Result<Value, JudgmentError>) {
        self.json.lock().unwrap().push_back(answer);
    }

    pub fn boolean_prompts(&self) -> Vec<String> {
        self.boolean_prompts.lock().unwrap().clone()
    }

    pub fn json_prompts(&self) -> Vec<String> {
        self.json_prompts.lock().unwrap().clone()
    }

    /// Attachments of every call, in call order.
    pub fn attachments(&self) -> Vec<Vec<Attachment>> {
        self.attachments.lock().unwrap().clone()
    }

    fn unscripted() -> JudgmentError {
        JudgmentError::Service("no scripted answer".to_string())
    }
}

#[async_trait]
impl JudgmentClient for ScriptedJudge {
    async fn classify_boolean(
        &self,
        prompt: &str,
        attachments: &[Attachment],
    ) -> std::result::Result<bool, JudgmentError> {
        self.boolean_prompts.lock().unwrap().push(prompt.to_string());
        self.attachments.lock().unwrap().push(attachments.to_vec());
        match self.booleans.lock().unwrap().pop_front() {
            Some(answer) => answer,
            None => self.default_boolean.ok_or_else(Self::unscripted),
        }
    }

    async fn generate_json(
        &self,
        prompt: &str,
        attachments: &[Attachment],
    ) -> std::result::Result<Value, JudgmentError> {
        self.json_prompts.lock().unwrap().push(prompt.to_string());
        self.attachments.lock().unwrap().push(attachments.to_vec());
        match self.json.lock().unwrap().pop_front() {
            Some(answer) => answer,
            None => self.default_json.clone().ok_or_else(Self::unscripted),
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryMediaFetcher
// ---------------------------------------------------------------------------

/// Media fetcher serving bytes from a `HashMap<url, bytes>`.
#[derive(Debug, Default)]
pub struct MemoryMediaFetcher {
    files: Mutex<HashMap<String, Vec<u8>>>,
    downloads: Mutex<Vec<String>>,
}

impl MemoryMediaFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, url: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.insert(url, bytes);
        self
    }

    pub fn insert(&self, url: impl Into<String>, bytes: Vec<u8>) {
        self.files.lock().unwrap().insert(url.into(), bytes);
    }

    /// Every downloaded URL, in call order.
    pub fn downloads(&self) -> Vec<String> {
        self.downloads.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaFetcher for MemoryMediaFetcher {
    async fn download(&self, url: &str) -> Result<DownloadedFile> {
        self.downloads.lock().unwrap().push(url.to_string());
        let bytes = self
            .files
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| HarnessError::Media(format!("failed to download {url}: not found")))?;
        DownloadedFile::from_bytes(url, &bytes)
    }
}

/// Encode a solid-colour PNG.
pub fn solid_png(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb(rgb));
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn model() -> ModelRef {
        ModelRef::new("acme", "sdxl")
    }

    #[tokio::test]
    async fn job_reaches_scripted_status_after_polls() {
        let registry = FakeRegistry::new().with_model(
            model(),
            FakeModel::new()
                .with_version("v1", json!({}))
                .responding(|_| ScriptedJob::succeeded(json!("done")).after_polls(2)),
        );
        let target = SubmitTarget::Version(VersionRef {
            model: model(),
            id: "v1".into(),
        });
        let job = registry
            .submit(&target, &Map::new(), &Mode::Inference)
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Submitted);

        let job = registry.get_status(&job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Running);
        let job = registry.get_status(&job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.output, Some(json!("done")));
        assert_eq!(registry.poll_count(&job.id), 2);
    }

    #[tokio::test]
    async fn public_model_hides_versions() {
        let registry = FakeRegistry::new().with_model(
            model(),
            FakeModel::new()
                .with_version("v1", json!({"old": true}))
                .with_version("v2", json!({"new": true}))
                .public_only(),
        );
        let err = registry.list_versions(&model()).await.unwrap_err();
        assert!(err.is_not_found());
        let latest = registry.latest_schema(&model()).await.unwrap();
        assert_eq!(latest, Some(json!({"new": true})));
    }

    #[tokio::test]
    async fn versions_are_newest_first() {
        let registry = FakeRegistry::new().with_model(
            model(),
            FakeModel::new()
                .with_version("v1", json!({}))
                .with_version("v2", json!({})),
        );
        let ids: Vec<_> = registry
            .list_versions(&model())
            .await
            .unwrap()
            .into_iter()
            .map(|v| v.id)
            .collect();
        assert_eq!(ids, vec!["v2", "v1"]);
    }

    #[tokio::test]
    async fn scripted_judge_falls_back_to_default() {
        let judge = ScriptedJudge::new().always(false);
        judge.push_boolean(Ok(true));
        assert!(judge.classify_boolean("a", &[]).await.unwrap());
        assert!(!judge.classify_boolean("b", &[]).await.unwrap());
        assert_eq!(judge.boolean_prompts(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn memory_fetcher_serves_known_urls() {
        let fetcher = MemoryMediaFetcher::new().with_file("https://x/a.png", solid_png(2, 2, [1, 2, 3]));
        let file = fetcher.download("https://x/a.png").await.unwrap();
        assert_eq!(file.media_type().unwrap(), "image/png");
        assert!(fetcher.download("https://x/missing.png").await.is_err());
    }
}
