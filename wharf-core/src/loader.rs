//! Handler artifact loading and invocation.
//!
//! Artifacts are executed out of process; the runtime is selected by file
//! extension. Loading validates the artifact through the runtime's own
//! syntax checker, so a broken handler fails the load instead of the
//! first request. Every invocation spawns the artifact fresh from disk,
//! which is what makes hot reload safe: there is no in-process module
//! cache to bust, and a generation stamp ties log records to the load
//! that produced them.
//!
//! Wire contract: the request view is one JSON object on stdin, the
//! response one JSON object on stdout. Stderr is the handler's logging
//! channel and is forwarded line by line to the function's logger.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{HandlerError, LoadError};
use crate::logger::Logger;

/// Conventional default artifact names, probed in order when neither the
/// route nor the manifest names one.
const DEFAULT_ARTIFACTS: &[&str] = &["handler.js", "handler.mjs", "handler.py", "handler.sh"];

/// Runtime selected by artifact extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerRuntime {
    Node,
    Python,
    Shell,
}

impl HandlerRuntime {
    pub fn for_artifact(path: &Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("js" | "mjs") => Some(HandlerRuntime::Node),
            Some("py") => Some(HandlerRuntime::Python),
            Some("sh") => Some(HandlerRuntime::Shell),
            _ => None,
        }
    }

    pub fn program(self) -> &'static str {
        match self {
            HandlerRuntime::Node => "node",
            HandlerRuntime::Python => "python3",
            HandlerRuntime::Shell => "sh",
        }
    }

    fn check_command(self, path: &Path) -> Command {
        let mut cmd = Command::new(self.program());
        match self {
            HandlerRuntime::Node => {
                cmd.arg("--check").arg(path);
            }
            HandlerRuntime::Python => {
                cmd.arg("-m").arg("py_compile").arg(path);
            }
            HandlerRuntime::Shell => {
                cmd.arg("-n").arg(path);
            }
        }
        cmd
    }

    fn run_command(self, path: &Path) -> Command {
        let mut cmd = Command::new(self.program());
        cmd.arg(path);
        cmd
    }
}

/// A validated handler artifact, stamped with the generation that loaded
/// it.
#[derive(Debug, Clone)]
pub struct LoadedHandler {
    pub artifact: String,
    pub path: PathBuf,
    pub runtime: HandlerRuntime,
    pub generation: u64,
}

/// Find the conventional default artifact in a function directory.
pub fn default_artifact(dir: &Path) -> Result<String, LoadError> {
    DEFAULT_ARTIFACTS
        .iter()
        .find(|name| dir.join(name).is_file())
        .map(|name| name.to_string())
        .ok_or_else(|| LoadError::NoDefaultArtifact(dir.to_path_buf()))
}

/// Validate an artifact and produce a fresh handler for this generation.
pub async fn load_handler(
    dir: &Path,
    artifact: &str,
    generation: u64,
) -> Result<LoadedHandler, LoadError> {
    let path = dir.join(artifact);
    let metadata = match std::fs::metadata(&path) {
        Ok(metadata) => metadata,
        Err(_) => return Err(LoadError::NotFound(path)),
    };
    if !metadata.is_file() {
        return Err(LoadError::NotAFile(path));
    }
    let runtime =
        HandlerRuntime::for_artifact(&path).ok_or_else(|| LoadError::UnsupportedExtension(path.clone()))?;

    let output = runtime
        .check_command(&path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| LoadError::CheckSpawn {
            program: runtime.program().to_string(),
            source,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(LoadError::SyntaxCheck {
            path,
            detail: tail(&stderr, 2000),
        });
    }

    Ok(LoadedHandler {
        artifact: artifact.to_string(),
        path,
        runtime,
        generation,
    })
}

/// Request view handed to an HTTP handler on stdin.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpHandlerRequest {
    pub method: String,
    pub path: String,
    pub route_path: String,
    pub path_params: HashMap<String, String>,
    pub query_params: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub body: String,
    pub is_base64_encoded: bool,
    pub function_name: String,
    pub request_id: String,
}

/// Reduced view handed to a cron handler.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CronHandlerRequest {
    pub job_name: String,
    pub function_name: String,
    pub scheduled_for: DateTime<Utc>,
}

/// Response read back from an HTTP handler's stdout. An empty stdout is
/// a bare completion: status 200, no body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HandlerResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
    pub is_base64_encoded: bool,
}

impl Default for HandlerResponse {
    fn default() -> Self {
        Self {
            status: 200,
            headers: HashMap::new(),
            body: String::new(),
            is_base64_encoded: false,
        }
    }
}

/// Encode raw request bytes for the wire: UTF-8 stays text, anything
/// else rides as base64 with the flag set.
pub fn encode_body(bytes: &[u8]) -> (String, bool) {
    match std::str::from_utf8(bytes) {
        Ok(text) => (text.to_string(), false),
        Err(_) => (BASE64.encode(bytes), true),
    }
}

impl HandlerResponse {
    /// Body bytes, decoding base64 when the handler flagged it.
    pub fn body_bytes(&self) -> Result<Vec<u8>, HandlerError> {
        if self.is_base64_encoded {
            Ok(BASE64.decode(self.body.as_bytes())?)
        } else {
            Ok(self.body.clone().into_bytes())
        }
    }
}

/// Run an HTTP invocation to completion.
pub async fn invoke_http(
    handler: &LoadedHandler,
    dir: &Path,
    env: &HashMap<String, String>,
    request: &HttpHandlerRequest,
    logger: &Logger,
) -> Result<HandlerResponse, HandlerError> {
    let payload = serde_json::to_vec(request)?;
    let stdout = run_handler(handler, dir, env, &request.function_name, &payload, logger).await?;

    let text = stdout.trim();
    if text.is_empty() {
        return Ok(HandlerResponse::default());
    }
    Ok(serde_json::from_str(text)?)
}

/// Run a cron invocation to completion. Stdout is ignored; a zero exit
/// is success.
pub async fn invoke_cron(
    handler: &LoadedHandler,
    dir: &Path,
    env: &HashMap<String, String>,
    request: &CronHandlerRequest,
    logger: &Logger,
) -> Result<(), HandlerError> {
    let payload = serde_json::to_vec(request)?;
    run_handler(handler, dir, env, &request.function_name, &payload, logger).await?;
    Ok(())
}

async fn run_handler(
    handler: &LoadedHandler,
    dir: &Path,
    env: &HashMap<String, String>,
    function: &str,
    payload: &[u8],
    logger: &Logger,
) -> Result<String, HandlerError> {
    let mut child = handler
        .runtime
        .run_command(&handler.path)
        .current_dir(dir)
        .envs(env)
        .env("WHARF_FUNCTION", function)
        .env("WHARF_FUNCTION_DIR", dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| HandlerError::Spawn {
            program: handler.runtime.program().to_string(),
            source,
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(payload).await?;
        stdin.write_all(b"\n").await?;
        // Closing stdin is the handler's end-of-request signal.
    }

    let output = child.wait_with_output().await?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
        logger.info(line, json!({"stream": "stderr", "artifact": handler.artifact}));
    }

    if !output.status.success() {
        return Err(HandlerError::NonZeroExit {
            status: output.status.code().unwrap_or(-1),
            stderr: tail(&stderr, 2000),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn tail(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth_back(max.saturating_sub(1)) {
        Some((idx, _)) => trimmed[idx..].to_string(),
        None => trimmed.to_string(),
    }
}
