//! Backend identity and concurrency class

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// The closed set of inference capabilities the server can host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Speech-to-text
    Asr,
    /// Text-to-speech
    Tts,
    Translate,
    /// Image generation
    Image,
    /// Image understanding
    Vision,
}

impl BackendKind {
    pub fn all() -> &'static [BackendKind] {
        &[
            BackendKind::Asr,
            BackendKind::Tts,
            BackendKind::Translate,
            BackendKind::Image,
            BackendKind::Vision,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Asr => "asr",
            BackendKind::Tts => "tts",
            BackendKind::Translate => "translate",
            BackendKind::Image => "image",
            BackendKind::Vision => "vision",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BackendKind::all()
            .iter()
            .copied()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::InvalidInput(format!("Unknown backend: {}", s)))
    }
}

/// How a backend shares the accelerator with the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrencyClass {
    /// Must not run while any other exclusive backend runs.
    #[default]
    Exclusive,
    /// Runs off the shared accelerator; bypasses the arbiter.
    Independent,
}

impl fmt::Display for ConcurrencyClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConcurrencyClass::Exclusive => f.write_str("exclusive"),
            ConcurrencyClass::Independent => f.write_str("independent"),
        }
    }
}
