//! The outbound seam to model-specific inference code

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Opaque request payload. The orchestrator never looks inside beyond
/// producing a short summary for history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Value);

impl Payload {
    /// Wrap a JSON document. Anything other than an object is malformed.
    pub fn from_json(value: Value) -> Result<Self> {
        if !value.is_object() {
            return Err(Error::InvalidInput(
                "Payload must be a JSON object".to_string(),
            ));
        }
        Ok(Self(value))
    }

    pub fn body(&self) -> &Value {
        &self.0
    }

    pub fn into_body(self) -> Value {
        self.0
    }

    pub fn summary(&self, max_chars: usize) -> String {
        summarize(&self.0, max_chars)
    }
}

/// Binary output (audio, image) produced alongside a result.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactData {
    pub bytes: Bytes,
    pub suggested_name: String,
}

/// What a backend hands back from one `execute` call.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendOutput {
    pub body: Value,
    pub artifact: Option<ArtifactData>,
}

impl BackendOutput {
    pub fn json(body: Value) -> Self {
        Self {
            body,
            artifact: None,
        }
    }

    pub fn with_artifact(mut self, bytes: impl Into<Bytes>, suggested_name: impl Into<String>) -> Self {
        self.artifact = Some(ArtifactData {
            bytes: bytes.into(),
            suggested_name: suggested_name.into(),
        });
        self
    }

    pub fn summary(&self, max_chars: usize) -> String {
        summarize(&self.body, max_chars)
    }
}

/// Model-specific inference code behind one backend.
///
/// All methods may block for a long time; the orchestrator always calls them
/// from a blocking thread and never concurrently for the same backend.
pub trait BackendExecutor: Send + Sync + 'static {
    /// Bring the model resident. Called on startup, resume after release, and restart.
    fn load(&self) -> Result<()>;

    /// Run one inference call.
    fn execute(&self, payload: &Payload) -> Result<BackendOutput>;

    /// Release resident resources.
    fn unload(&self) -> Result<()>;
}

/// Prefer a `text` field, fall back to compact JSON.
fn summarize(value: &Value, max_chars: usize) -> String {
    let full = match value.get("text").and_then(Value::as_str) {
        Some(text) => text.to_string(),
        None => value.to_string(),
    };

    if full.chars().count() <= max_chars {
        return full;
    }
    let mut cut: String = full.chars().take(max_chars).collect();
    cut.push_str("...");
    cut
}
