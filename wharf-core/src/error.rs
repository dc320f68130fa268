use std::path::PathBuf;
use thiserror::Error;

/// Route or cron manifest rejected during load.
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("no manifests found (route.config.json or cron.json required)")]
    NoManifests,

    #[error("route manifest declares no routes")]
    NoRoutes,

    #[error("route {path:?} declares no methods")]
    EmptyMethods { path: String },

    #[error("route {path:?} declares unknown method {method:?}")]
    UnknownMethod { path: String, method: String },

    #[error("duplicate route key {key:?} within the function")]
    DuplicateRoute { key: String },

    #[error("duplicate cron job name {name:?}")]
    DuplicateJob { name: String },

    #[error("cron job with empty name")]
    UnnamedJob,
}

/// Dependency resolver failed; terminal for the current load attempt.
#[derive(Error, Debug)]
pub enum DependencyError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {seconds}s")]
    Timeout { program: String, seconds: u64 },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: i32,
        stderr: String,
    },
}

/// Handler artifact could not be loaded.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("handler artifact not found: {0}")]
    NotFound(PathBuf),

    #[error("handler artifact is not a regular file: {0}")]
    NotAFile(PathBuf),

    #[error("no runtime for artifact extension: {0}")]
    UnsupportedExtension(PathBuf),

    #[error("no default handler artifact in {0}")]
    NoDefaultArtifact(PathBuf),

    #[error("failed to run {program} for syntax check: {source}")]
    CheckSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("syntax check failed for {path}: {detail}")]
    SyntaxCheck { path: PathBuf, detail: String },
}

/// A route key is already owned by another function.
#[derive(Error, Debug)]
#[error("route {key:?} is already owned by function {owner:?}")]
pub struct RouteConflictError {
    pub key: String,
    pub owner: String,
}

/// User handler failed during a request or a scheduled fire.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("failed to spawn handler {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("handler exited with {status}: {stderr}")]
    NonZeroExit { status: i32, stderr: String },

    #[error("handler wrote an invalid response: {0}")]
    InvalidResponse(#[from] serde_json::Error),

    #[error("handler response body is not valid base64: {0}")]
    InvalidBody(#[from] base64::DecodeError),

    #[error("IO error talking to handler: {0}")]
    Io(#[from] std::io::Error),
}

/// A single cron job declaration was rejected; the rest of the function
/// loads normally.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("unparseable cron expression {expression:?}: {detail}")]
    InvalidSchedule { expression: String, detail: String },

    #[error("unknown timezone {timezone:?}")]
    UnknownTimezone { timezone: String },

    #[error("cron handler artifact could not be loaded: {0}")]
    Artifact(#[from] LoadError),
}

/// A resource could not be released within its drain window.
#[derive(Error, Debug)]
#[error("{what} did not drain within {seconds}s")]
pub struct ShutdownError {
    pub what: String,
    pub seconds: u64,
}

/// Umbrella for everything a reload attempt can die of. Captured at the
/// orchestrator; never propagates out of the reload loop.
#[derive(Error, Debug)]
pub enum ReloadError {
    #[error("invalid function name {0:?}")]
    InvalidName(String),

    #[error("function directory missing: {0}")]
    MissingDirectory(PathBuf),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    RouteConflict(#[from] RouteConflictError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReloadError {
    /// Short machine-readable kind used in structured log records.
    pub fn kind(&self) -> &'static str {
        match self {
            ReloadError::InvalidName(_) => "InvalidName",
            ReloadError::MissingDirectory(_) => "MissingDirectory",
            ReloadError::Manifest(_) => "ManifestError",
            ReloadError::Dependency(_) => "DependencyError",
            ReloadError::Load(_) => "LoadError",
            ReloadError::RouteConflict(_) => "RouteConflictError",
            ReloadError::Io(_) => "IoError",
        }
    }
}
