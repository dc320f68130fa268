//! Dependency installation coordinator.
//!
//! Before handlers load, a function's declared libraries must be
//! materialized inside the function directory. Each supported runtime
//! contributes a resolver: a declaration file to look for, a child
//! process to run, and a marker file whose freshness makes reinstallation
//! skippable. Installs for one function never overlap; installs across
//! functions run in parallel up to a bounded width.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::json;
use tokio::process::Command;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::timeout;
use tracing::debug;

use crate::error::DependencyError;
use crate::logger::Logger;

/// One platform resolver: declaration file in, materialized libraries out.
#[derive(Debug, Clone)]
pub struct Resolver {
    /// Declaration file that activates this resolver.
    pub manifest: String,
    /// Marker whose mtime records the last successful install.
    pub marker: String,
    pub program: String,
    pub args: Vec<String>,
}

fn default_resolvers() -> Vec<Resolver> {
    vec![
        Resolver {
            manifest: "package.json".into(),
            marker: "node_modules/.wharf-install.stamp".into(),
            program: "npm".into(),
            args: vec!["install".into(), "--no-audit".into(), "--no-fund".into()],
        },
        Resolver {
            manifest: "requirements.txt".into(),
            marker: ".wharf-deps/.wharf-install.stamp".into(),
            program: "pip3".into(),
            args: vec![
                "install".into(),
                "-r".into(),
                "requirements.txt".into(),
                "--target".into(),
                ".wharf-deps".into(),
            ],
        },
    ]
}

#[derive(Debug, Clone)]
pub struct InstallerConfig {
    /// Wall-clock limit for one resolver run.
    pub timeout: Duration,
    /// Cross-function install parallelism.
    pub parallelism: usize,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            parallelism: 4,
        }
    }
}

#[derive(Debug)]
pub struct DependencyInstaller {
    config: InstallerConfig,
    resolvers: Vec<Resolver>,
    semaphore: Arc<Semaphore>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl DependencyInstaller {
    pub fn new(config: InstallerConfig) -> Self {
        Self::with_resolvers(config, default_resolvers())
    }

    pub fn with_resolvers(config: InstallerConfig, resolvers: Vec<Resolver>) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.parallelism.max(1)));
        Self {
            config,
            resolvers,
            semaphore,
            locks: DashMap::new(),
        }
    }

    /// Cross-function parallelism bound, shared with the reload pipeline.
    pub fn parallelism(&self) -> usize {
        self.config.parallelism.max(1)
    }

    /// Guarantee the function's declared libraries are materialized.
    ///
    /// Succeeds immediately when no declaration exists or the marker is at
    /// least as new as the declaration.
    pub async fn ensure(
        &self,
        function: &str,
        dir: &Path,
        logger: &Logger,
    ) -> Result<(), DependencyError> {
        let applicable: Vec<Resolver> = self
            .resolvers
            .iter()
            .filter(|r| dir.join(&r.manifest).is_file())
            .cloned()
            .collect();
        if applicable.is_empty() {
            return Ok(());
        }

        let lock = self
            .locks
            .entry(function.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;
        // The semaphore is never closed; ok() keeps the permit alive.
        let _permit = self.semaphore.acquire().await.ok();

        for resolver in applicable {
            if is_fresh(dir, &resolver) {
                debug!(function, manifest = %resolver.manifest, "dependency cache hit");
                continue;
            }
            self.run_resolver(function, dir, &resolver, logger).await?;
        }

        Ok(())
    }

    async fn run_resolver(
        &self,
        function: &str,
        dir: &Path,
        resolver: &Resolver,
        logger: &Logger,
    ) -> Result<(), DependencyError> {
        debug!(function, program = %resolver.program, "installing dependencies");

        let child = Command::new(&resolver.program)
            .args(&resolver.args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| DependencyError::Spawn {
                program: resolver.program.clone(),
                source,
            })?;

        let output = match timeout(self.config.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(DependencyError::Spawn {
                    program: resolver.program.clone(),
                    source,
                });
            }
            // The dropped child is killed via kill_on_drop.
            Err(_) => {
                return Err(DependencyError::Timeout {
                    program: resolver.program.clone(),
                    seconds: self.config.timeout.as_secs(),
                });
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
            if !is_resolver_warning(line) {
                logger.warn(line, json!({"program": resolver.program}));
            }
        }

        if !output.status.success() {
            return Err(DependencyError::Failed {
                program: resolver.program.clone(),
                status: output.status.code().unwrap_or(-1),
                stderr: stderr.trim().chars().take(2000).collect(),
            });
        }

        write_marker(dir, resolver);
        Ok(())
    }
}

/// Lines resolvers emit on stderr as routine noise.
fn is_resolver_warning(line: &str) -> bool {
    let lower = line.trim_start().to_ascii_lowercase();
    lower.starts_with("npm warn") || lower.starts_with("warning")
}

fn is_fresh(dir: &Path, resolver: &Resolver) -> bool {
    let manifest_mtime = std::fs::metadata(dir.join(&resolver.manifest)).and_then(|m| m.modified());
    let marker_mtime = std::fs::metadata(dir.join(&resolver.marker)).and_then(|m| m.modified());
    match (manifest_mtime, marker_mtime) {
        (Ok(manifest), Ok(marker)) => marker >= manifest,
        _ => false,
    }
}

fn write_marker(dir: &Path, resolver: &Resolver) {
    let path = dir.join(&resolver.marker);
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let _ = std::fs::write(path, chrono::Utc::now().to_rfc3339());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::{LogLevel, LoggerConfig};
    use tempfile::TempDir;

    fn logger(dir: &TempDir) -> Logger {
        Logger::new(LoggerConfig::new(dir.path().join("logs"))).expect("logger")
    }

    fn shell_resolver(script: &str) -> Resolver {
        Resolver {
            manifest: "deps.txt".into(),
            marker: ".deps-stamp".into(),
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
        }
    }

    fn installer(resolver: Resolver) -> DependencyInstaller {
        DependencyInstaller::with_resolvers(InstallerConfig::default(), vec![resolver])
    }

    #[tokio::test]
    async fn no_declaration_succeeds_without_running() {
        let dir = TempDir::new().unwrap();
        let installer = installer(shell_resolver("echo ran >> ran.log"));
        installer.ensure("f", dir.path(), &logger(&dir)).await.unwrap();
        assert!(!dir.path().join("ran.log").exists());
    }

    #[tokio::test]
    async fn marker_freshness_skips_reinstall() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("deps.txt"), "leftpad\n").unwrap();
        let installer = installer(shell_resolver("echo ran >> ran.log"));
        let logger = logger(&dir);

        installer.ensure("f", dir.path(), &logger).await.unwrap();
        installer.ensure("f", dir.path(), &logger).await.unwrap();

        let runs = std::fs::read_to_string(dir.path().join("ran.log")).unwrap();
        assert_eq!(runs.lines().count(), 1);
    }

    #[tokio::test]
    async fn concurrent_ensures_for_one_function_run_once() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("deps.txt"), "leftpad\n").unwrap();
        let installer = Arc::new(installer(shell_resolver("sleep 0.2; echo ran >> ran.log")));
        let logger = logger(&dir);

        let a = installer.ensure("f", dir.path(), &logger);
        let b = installer.ensure("f", dir.path(), &logger);
        let (ra, rb) = tokio::join!(a, b);
        ra.unwrap();
        rb.unwrap();

        let runs = std::fs::read_to_string(dir.path().join("ran.log")).unwrap();
        assert_eq!(runs.lines().count(), 1);
    }

    #[tokio::test]
    async fn resolver_failure_is_terminal_and_logged() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("deps.txt"), "leftpad\n").unwrap();
        let installer = installer(shell_resolver("echo 'resolver exploded' >&2; exit 2"));
        let logger = logger(&dir);

        let err = installer.ensure("f", dir.path(), &logger).await.unwrap_err();
        match err {
            DependencyError::Failed { status, stderr, .. } => {
                assert_eq!(status, 2);
                assert!(stderr.contains("resolver exploded"));
            }
            other => panic!("unexpected: {other}"),
        }

        let warns = logger.recent(10, None, Some(LogLevel::Warn));
        assert_eq!(warns.len(), 1);
        assert!(warns[0].message.contains("resolver exploded"));
    }

    #[tokio::test]
    async fn warning_lines_are_not_recorded() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("deps.txt"), "leftpad\n").unwrap();
        let installer = installer(shell_resolver(
            "echo 'npm warn deprecated leftpad' >&2; echo 'WARNING: legacy' >&2",
        ));
        let logger = logger(&dir);

        installer.ensure("f", dir.path(), &logger).await.unwrap();
        assert!(logger.recent(10, None, Some(LogLevel::Warn)).is_empty());
    }

    #[tokio::test]
    async fn slow_resolver_times_out() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("deps.txt"), "leftpad\n").unwrap();
        let installer = DependencyInstaller::with_resolvers(
            InstallerConfig {
                timeout: Duration::from_millis(100),
                parallelism: 4,
            },
            vec![shell_resolver("sleep 5")],
        );

        let err = installer
            .ensure("f", dir.path(), &logger(&dir))
            .await
            .unwrap_err();
        assert!(matches!(err, DependencyError::Timeout { .. }));
    }
}
