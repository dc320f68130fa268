//! Manifest loading and validation.
//!
//! `route.config.json` and `cron.json` are the wire format between the
//! host and user code; field names are stable. Validation is strict for
//! the route manifest (any violation fails the load). Cron declarations
//! are validated structurally here (names present and unique); schedule,
//! timezone, and artifact checks happen per job at scheduling time so a
//! single bad job cannot take down the rest of the function.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ManifestError;

/// Route manifest file name within a function directory.
pub const ROUTE_MANIFEST: &str = "route.config.json";
/// Cron manifest file name within a function directory.
pub const CRON_MANIFEST: &str = "cron.json";

const METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS", "TRACE", "CONNECT",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteManifest {
    /// Path prefix for every route; defaults to `/<function-name>`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
    /// Default handler artifact; route declarations may override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    pub routes: Vec<RouteDecl>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDecl {
    /// Path pattern relative to the base; `:name` segments bind path
    /// parameters.
    pub path: String,
    pub methods: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronManifest {
    #[serde(default)]
    pub jobs: Vec<JobDecl>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDecl {
    /// Unique within the function.
    pub name: String,
    /// Standard 5-field cron expression.
    pub schedule: String,
    pub handler: String,
    /// IANA timezone name; UTC when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Both descriptors of one function directory.
#[derive(Debug, Clone)]
pub struct FunctionManifests {
    /// `None` for a cron-only function (no `route.config.json`).
    pub routes: Option<RouteManifest>,
    pub cron: CronManifest,
}

impl RouteManifest {
    /// Resolved base prefix, normalized with a leading and no trailing
    /// slash. `"/"` collapses to the empty prefix.
    pub fn base_path(&self, function: &str) -> String {
        match &self.base {
            Some(base) => {
                let base = base.trim_end_matches('/');
                if base.is_empty() {
                    String::new()
                } else if base.starts_with('/') {
                    base.to_string()
                } else {
                    format!("/{base}")
                }
            }
            None => format!("/{function}"),
        }
    }

    /// Handler artifact name for a declaration: the route's own, else the
    /// manifest default. `None` means "find the conventional artifact".
    pub fn artifact_for<'a>(&'a self, decl: &'a RouteDecl) -> Option<&'a str> {
        decl.handler.as_deref().or(self.handler.as_deref())
    }
}

/// Load and validate both manifests for a function directory.
///
/// A directory with neither descriptor is not a function. A missing
/// `cron.json` (or one with an empty `jobs` array) means zero jobs and is
/// not an error.
pub fn load_manifests(dir: &Path) -> Result<FunctionManifests, ManifestError> {
    let routes = load_route_manifest(dir)?;
    let cron = load_cron_manifest(dir)?;

    if routes.is_none() && cron.is_none() {
        return Err(ManifestError::NoManifests);
    }

    Ok(FunctionManifests {
        routes,
        cron: cron.unwrap_or_default(),
    })
}

/// Load `route.config.json`; `Ok(None)` when the file does not exist.
pub fn load_route_manifest(dir: &Path) -> Result<Option<RouteManifest>, ManifestError> {
    let path = dir.join(ROUTE_MANIFEST);
    let Some(contents) = read_optional(&path)? else {
        return Ok(None);
    };

    let mut manifest: RouteManifest = serde_json::from_str(&contents)
        .map_err(|source| ManifestError::Json { path, source })?;
    validate_routes(&mut manifest)?;
    Ok(Some(manifest))
}

/// Load `cron.json`; `Ok(None)` when the file does not exist.
pub fn load_cron_manifest(dir: &Path) -> Result<Option<CronManifest>, ManifestError> {
    let path = dir.join(CRON_MANIFEST);
    let Some(contents) = read_optional(&path)? else {
        return Ok(None);
    };

    let manifest: CronManifest = serde_json::from_str(&contents)
        .map_err(|source| ManifestError::Json { path, source })?;
    validate_jobs(&manifest)?;
    Ok(Some(manifest))
}

fn read_optional(path: &Path) -> Result<Option<String>, ManifestError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(ManifestError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn validate_routes(manifest: &mut RouteManifest) -> Result<(), ManifestError> {
    if manifest.routes.is_empty() {
        return Err(ManifestError::NoRoutes);
    }

    for decl in &mut manifest.routes {
        if !decl.path.starts_with('/') {
            decl.path.insert(0, '/');
        }

        if decl.methods.is_empty() {
            return Err(ManifestError::EmptyMethods {
                path: decl.path.clone(),
            });
        }

        let mut seen = Vec::with_capacity(decl.methods.len());
        for method in &decl.methods {
            let upper = method.to_ascii_uppercase();
            if !METHODS.contains(&upper.as_str()) {
                return Err(ManifestError::UnknownMethod {
                    path: decl.path.clone(),
                    method: method.clone(),
                });
            }
            if !seen.contains(&upper) {
                seen.push(upper);
            }
        }
        decl.methods = seen;
    }

    Ok(())
}

fn validate_jobs(manifest: &CronManifest) -> Result<(), ManifestError> {
    let mut seen: Vec<&str> = Vec::with_capacity(manifest.jobs.len());
    for job in &manifest.jobs {
        if job.name.trim().is_empty() {
            return Err(ManifestError::UnnamedJob);
        }
        if seen.contains(&job.name.as_str()) {
            return Err(ManifestError::DuplicateJob {
                name: job.name.clone(),
            });
        }
        seen.push(&job.name);
    }
    Ok(())
}
