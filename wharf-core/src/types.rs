//! Core data model: functions, their lifecycle states, and the
//! per-invocation context.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::loader::LoadedHandler;
use crate::logger::Logger;
use crate::route::{CompiledRoute, RouteKey};

/// Lifecycle state of a loaded function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionStatus {
    Loading,
    Running,
    Failed,
    Unloading,
}

/// Weak descriptor of a scheduled job, held by the registry for status
/// reporting. The live handle is owned by the scheduler alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub name: String,
    pub schedule: String,
    pub timezone: String,
    pub handler: String,
}

/// One loaded generation of a function. Entries are immutable; a reload
/// swaps the whole `Arc` so requests never observe a spliced mix of
/// generations.
#[derive(Debug, Clone)]
pub struct FunctionEntry {
    /// Directory basename; lowercase `[a-z0-9_-]+`.
    pub name: String,
    pub dir: PathBuf,
    pub status: FunctionStatus,
    pub env: Arc<HashMap<String, String>>,
    /// Loaded handlers keyed by artifact name.
    pub handlers: HashMap<String, LoadedHandler>,
    pub routes: Vec<CompiledRoute>,
    pub jobs: Vec<JobDescriptor>,
    /// Incremented on every successful reload; correlates log records.
    pub generation: u64,
    pub loaded_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl FunctionEntry {
    /// Placeholder registered while a brand-new function loads for the
    /// first time.
    pub fn loading(name: &str, dir: PathBuf) -> Self {
        let mut entry = Self::failed(name, dir, String::new());
        entry.status = FunctionStatus::Loading;
        entry.last_error = None;
        entry
    }

    /// Placeholder for a function that has never loaded successfully.
    /// Holds zero routes and zero jobs by construction.
    pub fn failed(name: &str, dir: PathBuf, error: String) -> Self {
        Self {
            name: name.to_string(),
            dir,
            status: FunctionStatus::Failed,
            env: Arc::new(HashMap::new()),
            handlers: HashMap::new(),
            routes: Vec::new(),
            jobs: Vec::new(),
            generation: 0,
            loaded_at: Utc::now(),
            last_error: Some(error),
        }
    }

    /// The last-good generation with a fresh failure annotation, for a
    /// reload that died while a previous generation stays live.
    pub fn with_error(&self, error: String) -> Self {
        let mut entry = self.clone();
        entry.last_error = Some(error);
        entry
    }

    pub fn route_keys(&self) -> Vec<RouteKey> {
        self.routes.iter().flat_map(CompiledRoute::keys).collect()
    }
}

/// Snapshot row returned by `Registry::list`.
#[derive(Debug, Clone, Serialize)]
pub struct FunctionSummary {
    pub name: String,
    pub status: FunctionStatus,
    pub routes: Vec<String>,
    pub jobs: Vec<JobDescriptor>,
    pub generation: u64,
    pub loaded_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Everything a single HTTP invocation needs, built by the multiplexer.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub function: String,
    pub dir: PathBuf,
    pub route_path: String,
    pub artifact: String,
    pub env: Arc<HashMap<String, String>>,
    pub logger: Logger,
    pub request_id: String,
    pub started: Instant,
}

/// Function names are directory basenames: lowercase alphanumerics,
/// underscore, and dash.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation() {
        assert!(is_valid_name("greeter"));
        assert!(is_valid_name("api_v2-beta"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Greeter"));
        assert!(!is_valid_name("has space"));
        assert!(!is_valid_name("dot.name"));
    }

    #[test]
    fn failed_placeholder_holds_no_routes_or_jobs() {
        let entry = FunctionEntry::failed("f", PathBuf::from("/tmp/f"), "boom".into());
        assert_eq!(entry.status, FunctionStatus::Failed);
        assert!(entry.routes.is_empty());
        assert!(entry.jobs.is_empty());
        assert_eq!(entry.generation, 0);
        assert_eq!(entry.last_error.as_deref(), Some("boom"));
    }
}
