//! src/services/vision.rs
//!
//! Label/moderation analysis against an external vision service. The
//! backend is a trait so tests can substitute a mock; the production
//! implementation talks JSON over HTTP with a bounded timeout.
//!
//! Cost model: label and moderation detection are cheap and always run; face
//! detection is materially more expensive and is only issued when the label
//! set already suggests a person is in the frame. A false negative on the
//! label call means skipped face detection, which is accepted degradation.

use crate::models::analysis::{AnalysisResult, Label};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Labels that gate the face-detection call.
const PERSON_LABELS: [&str; 6] = ["Person", "Human", "Face", "People", "Portrait", "Selfie"];

/// Full-analysis tuning, mirrored from the original service defaults.
const FULL_MAX_LABELS: u32 = 15;
const FULL_MIN_CONFIDENCE: f32 = 80.0;
const LITE_MAX_LABELS: u32 = 10;
const LITE_MIN_CONFIDENCE: f32 = 85.0;
/// The persisted label list is capped at this many entries.
const LABEL_CAP: usize = 10;

#[derive(Debug, Error)]
pub enum VisionError {
    #[error("vision service unavailable: {0}")]
    Unavailable(String),
    #[error("vision request failed: {0}")]
    Http(String),
    #[error("vision analysis timed out after {0}ms")]
    Timeout(u64),
}

/// Raw detection capabilities of the external service.
#[async_trait]
pub trait VisionBackend: Send + Sync {
    async fn detect_labels(
        &self,
        key: &str,
        max_labels: u32,
        min_confidence: f32,
    ) -> Result<Vec<Label>, VisionError>;

    async fn detect_moderation_labels(
        &self,
        key: &str,
        min_confidence: f32,
    ) -> Result<Vec<Label>, VisionError>;

    async fn detect_faces(&self, key: &str) -> Result<Vec<Value>, VisionError>;
}

/// How one analysis attempt ended. The orchestrator's main path never
/// branches on exceptions for this expected-to-sometimes-fail dependency.
#[derive(Debug)]
pub enum AnalysisOutcome {
    Ok(AnalysisResult),
    Degraded(String),
}

/// Two-stage, cost-aware analysis over a [`VisionBackend`].
#[derive(Clone)]
pub struct VisionService {
    backend: Arc<dyn VisionBackend>,
    timeout: Duration,
}

impl VisionService {
    pub fn new(backend: Arc<dyn VisionBackend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    /// Service that degrades every analysis; used when no endpoint is
    /// configured.
    pub fn disabled() -> Self {
        Self::new(Arc::new(DisabledBackend), Duration::from_millis(1))
    }

    /// Full analysis: labels + moderation concurrently, then face detection
    /// only when a person-indicating label was seen.
    pub async fn analyze(&self, key: &str) -> Result<AnalysisResult, VisionError> {
        let timeout_ms = self.timeout.as_millis() as u64;
        tokio::time::timeout(self.timeout, self.analyze_inner(key))
            .await
            .map_err(|_| VisionError::Timeout(timeout_ms))?
    }

    async fn analyze_inner(&self, key: &str) -> Result<AnalysisResult, VisionError> {
        let (labels_res, moderation) = tokio::try_join!(
            self.backend
                .detect_labels(key, FULL_MAX_LABELS, FULL_MIN_CONFIDENCE),
            self.backend
                .detect_moderation_labels(key, FULL_MIN_CONFIDENCE),
        )?;

        let mut labels = labels_res;
        labels.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        labels.truncate(LABEL_CAP);

        let nsfw = !moderation.is_empty();
        debug!(key, labels = labels.len(), nsfw, "label/moderation pass done");

        let has_person = labels
            .iter()
            .any(|l| PERSON_LABELS.contains(&l.name.as_str()));

        let faces = if has_person {
            self.backend.detect_faces(key).await?
        } else {
            debug!(key, "no person labels, skipping face detection");
            Vec::new()
        };
        let face_count = faces.len() as u32;

        Ok(AnalysisResult {
            raw: json!({
                "labels": labels,
                "moderation": moderation,
                "faces": faces,
            }),
            labels,
            nsfw,
            face_count,
        })
    }

    /// Lite mode: labels only, no moderation, no faces. For callers that
    /// must minimize cost further.
    pub async fn analyze_lite(&self, key: &str) -> Result<AnalysisResult, VisionError> {
        let timeout_ms = self.timeout.as_millis() as u64;
        let mut labels = tokio::time::timeout(
            self.timeout,
            self.backend
                .detect_labels(key, LITE_MAX_LABELS, LITE_MIN_CONFIDENCE),
        )
        .await
        .map_err(|_| VisionError::Timeout(timeout_ms))??;
        labels.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        labels.truncate(LABEL_CAP);

        Ok(AnalysisResult {
            raw: json!({ "labels": labels }),
            labels,
            nsfw: false,
            face_count: 0,
        })
    }

    /// Full analysis collapsed to an outcome: a failure degrades to empty
    /// fields instead of propagating, so post creation is never blocked by a
    /// degraded analysis service.
    pub async fn analyze_best_effort(&self, key: &str) -> AnalysisOutcome {
        match self.analyze(key).await {
            Ok(result) => AnalysisOutcome::Ok(result),
            Err(err) => {
                warn!(key, error = %err, "analysis degraded");
                AnalysisOutcome::Degraded(err.to_string())
            }
        }
    }
}

/// Backend used when no vision endpoint is configured.
struct DisabledBackend;

#[async_trait]
impl VisionBackend for DisabledBackend {
    async fn detect_labels(&self, _: &str, _: u32, _: f32) -> Result<Vec<Label>, VisionError> {
        Err(VisionError::Unavailable("no endpoint configured".into()))
    }

    async fn detect_moderation_labels(&self, _: &str, _: f32) -> Result<Vec<Label>, VisionError> {
        Err(VisionError::Unavailable("no endpoint configured".into()))
    }

    async fn detect_faces(&self, _: &str) -> Result<Vec<Value>, VisionError> {
        Err(VisionError::Unavailable("no endpoint configured".into()))
    }
}

// --- HTTP backend ---

#[derive(Serialize)]
struct DetectRequest<'a> {
    key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_labels: Option<u32>,
    min_confidence: f32,
}

#[derive(Deserialize)]
struct LabelsResponse {
    labels: Vec<Label>,
}

#[derive(Deserialize)]
struct FacesResponse {
    faces: Vec<Value>,
}

/// JSON-over-HTTP vision backend. Each capability is one POST to
/// `{endpoint}/{detect-labels|detect-moderation|detect-faces}` carrying the
/// object key; the service reads the object from shared storage itself.
pub struct HttpVisionBackend {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpVisionBackend {
    pub fn new(endpoint: &str, api_key: Option<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &DetectRequest<'_>,
    ) -> Result<T, VisionError> {
        let url = format!("{}/{}", self.endpoint, path);
        let mut req = self.client.post(&url).json(body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| VisionError::Unavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(VisionError::Http(format!(
                "{} returned {}",
                path,
                resp.status()
            )));
        }
        resp.json::<T>()
            .await
            .map_err(|e| VisionError::Http(e.to_string()))
    }
}

#[async_trait]
impl VisionBackend for HttpVisionBackend {
    async fn detect_labels(
        &self,
        key: &str,
        max_labels: u32,
        min_confidence: f32,
    ) -> Result<Vec<Label>, VisionError> {
        let body = DetectRequest {
            key,
            max_labels: Some(max_labels),
            min_confidence,
        };
        let resp: LabelsResponse = self.post("detect-labels", &body).await?;
        Ok(resp.labels)
    }

    async fn detect_moderation_labels(
        &self,
        key: &str,
        min_confidence: f32,
    ) -> Result<Vec<Label>, VisionError> {
        let body = DetectRequest {
            key,
            max_labels: None,
            min_confidence,
        };
        let resp: LabelsResponse = self.post("detect-moderation", &body).await?;
        Ok(resp.labels)
    }

    async fn detect_faces(&self, key: &str) -> Result<Vec<Value>, VisionError> {
        let body = DetectRequest {
            key,
            max_labels: None,
            min_confidence: 0.0,
        };
        let resp: FacesResponse = self.post("detect-faces", &body).await?;
        Ok(resp.faces)
    }
}
