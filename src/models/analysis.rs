//! Result value of the label/moderation analysis.
//!
//! Not persisted standalone — the orchestrator folds it into the post record.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single content label with the detector's confidence (0–100).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Label {
    pub name: String,
    pub confidence: f32,
}

impl Label {
    pub fn new(name: impl Into<String>, confidence: f32) -> Self {
        Self {
            name: name.into(),
            confidence,
        }
    }
}

/// What one analysis pass produced for an image.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AnalysisResult {
    /// Capped label list, sorted by confidence descending.
    pub labels: Vec<Label>,
    /// True when any moderation label was reported.
    pub nsfw: bool,
    /// Number of detected faces; zero when face detection was skipped.
    pub face_count: u32,
    /// Opaque raw payload for audit and debugging.
    pub raw: Value,
}

impl AnalysisResult {
    /// The value a post falls back to when analysis is degraded or skipped.
    pub fn empty() -> Self {
        Self {
            labels: Vec::new(),
            nsfw: false,
            face_count: 0,
            raw: Value::Null,
        }
    }

    /// Label names in confidence order.
    pub fn label_names(&self) -> Vec<String> {
        self.labels.iter().map(|l| l.name.clone()).collect()
    }
}
