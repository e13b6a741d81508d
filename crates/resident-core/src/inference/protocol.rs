//! Wire format shared by the daemon and process runners.
//!
//! Requests and responses are single JSON objects. Over a socket each one is
//! preceded by its length as a 4-byte big-endian integer.

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{Read, Write};

use crate::backend::{BackendKind, BackendOutput};
use crate::error::{Error, Result};

/// Frames larger than this are treated as a broken stream.
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Check,
    Load,
    Execute,
    Unload,
    Shutdown,
}

/// Request to a runner
#[derive(Debug, Serialize)]
pub struct RunnerRequest<'a> {
    pub command: Command,
    pub backend: BackendKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<&'a Value>,
}

impl<'a> RunnerRequest<'a> {
    pub fn command(command: Command, backend: BackendKind) -> Self {
        Self {
            command,
            backend,
            payload: None,
        }
    }

    pub fn execute(backend: BackendKind, payload: &'a Value) -> Self {
        Self {
            command: Command::Execute,
            backend,
            payload: Some(payload),
        }
    }
}

/// Response from a runner
#[derive(Debug, Default, Deserialize)]
pub struct RunnerResponse {
    pub status: Option<String>,
    pub result: Option<Value>,
    pub artifact_base64: Option<String>,
    pub artifact_name: Option<String>,
    pub error: Option<String>,
    /// The runner lost its model state while failing.
    #[serde(default)]
    pub fatal: bool,
}

impl RunnerResponse {
    /// Surface a reported error.
    pub fn check(self) -> Result<Self> {
        match self.error {
            Some(error) if self.fatal => Err(Error::BackendFault(error)),
            Some(error) => Err(Error::InferenceError(error)),
            None => Ok(self),
        }
    }

    pub fn into_output(self) -> Result<BackendOutput> {
        let response = self.check()?;
        let output = BackendOutput::json(response.result.unwrap_or(Value::Null));

        match response.artifact_base64 {
            Some(encoded) => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(encoded.as_bytes())
                    .map_err(|e| Error::InferenceError(format!("Failed to decode artifact: {}", e)))?;
                let name = response
                    .artifact_name
                    .unwrap_or_else(|| "artifact.bin".to_string());
                Ok(output.with_artifact(bytes, name))
            }
            None => Ok(output),
        }
    }
}

/// A request as one JSON line.
pub fn write_json(request: &RunnerRequest<'_>) -> Result<Vec<u8>> {
    let mut body = serde_json::to_vec(request)?;
    body.push(b'\n');
    Ok(body)
}

pub fn write_frame(writer: &mut impl Write, request: &RunnerRequest<'_>) -> Result<()> {
    let body = serde_json::to_vec(request)?;
    let length = u32::try_from(body.len())
        .map_err(|_| Error::InvalidInput(format!("Request of {} bytes is too large", body.len())))?;
    writer.write_all(&length.to_be_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

pub fn read_frame(reader: &mut impl Read) -> Result<RunnerResponse> {
    let mut length_buf = [0u8; 4];
    reader.read_exact(&mut length_buf)?;
    let length = u32::from_be_bytes(length_buf) as usize;
    if length > MAX_FRAME_LEN {
        return Err(Error::BackendFault(format!(
            "Runner sent a {} byte frame",
            length
        )));
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body)?;
    serde_json::from_slice(&body)
        .map_err(|e| Error::InferenceError(format!("Failed to parse runner response: {}", e)))
}

/// Parse the first JSON object line of a runner's stdout; anything the runner
/// printed before it is ignored.
pub fn parse_stdout(stdout: &str) -> Result<RunnerResponse> {
    let line = stdout
        .lines()
        .find(|line| line.trim_start().starts_with('{'))
        .ok_or_else(|| Error::InferenceError("Runner printed no JSON response".to_string()))?;

    serde_json::from_str(line).map_err(|e| {
        Error::InferenceError(format!("Failed to parse runner response: {} - {}", e, line))
    })
}
