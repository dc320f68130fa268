//! Reload orchestration.
//!
//! All registry mutations funnel through here. A reload is "prepare a
//! new generation, then atomically swap": the expensive work (manifests,
//! dependency install, handler syntax checks) runs outside any global
//! lock, while conflict checking, the job swap, the registry install,
//! and the route-table publication happen under one swap mutex so no
//! request or concurrent load ever observes a half-built generation. A
//! failed reload never touches a live previous generation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::env_file;
use crate::error::{ManifestError, ReloadError};
use crate::installer::DependencyInstaller;
use crate::loader::{self, LoadedHandler};
use crate::logger::Logger;
use crate::manifest::{self, FunctionManifests};
use crate::registry::Registry;
use crate::route::{CompiledRoute, RouteKey, RoutePattern, RouteTableHandle};
use crate::scheduler::CronScheduler;
use crate::types::{FunctionEntry, FunctionStatus, is_valid_name};
use crate::watch::{ChangeEvent, ChangeKind};

/// RPC-style commands accepted alongside watcher events.
#[derive(Debug)]
pub enum Command {
    Reload {
        name: String,
        reply: oneshot::Sender<Result<(), String>>,
    },
}

/// Cloneable entry point for the management surface.
#[derive(Debug, Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::Sender<Command>,
}

impl OrchestratorHandle {
    pub fn new(tx: mpsc::Sender<Command>) -> Self {
        Self { tx }
    }

    /// Reload one function and wait for the outcome.
    pub async fn reload(&self, name: &str) -> Result<(), String> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Reload {
                name: name.to_string(),
                reply,
            })
            .await
            .map_err(|_| "orchestrator is gone".to_string())?;
        rx.await.map_err(|_| "orchestrator dropped the reload".to_string())?
    }
}

pub struct Orchestrator {
    root: PathBuf,
    registry: Arc<Registry>,
    routes: Arc<RouteTableHandle>,
    scheduler: Arc<CronScheduler>,
    installer: Arc<DependencyInstaller>,
    logger: Logger,
    /// Per-function reload serialization.
    locks: DashMap<String, Arc<AsyncMutex<()>>>,
    /// Serializes conflict-check-and-swap across functions.
    swap_lock: AsyncMutex<()>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("root", &self.root)
            .field("locked_functions", &self.locks.len())
            .finish()
    }
}

struct Prepared {
    env: Arc<HashMap<String, String>>,
    manifests: FunctionManifests,
    handlers: HashMap<String, LoadedHandler>,
    routes: Vec<CompiledRoute>,
    generation: u64,
}

impl Orchestrator {
    pub fn new(
        root: PathBuf,
        registry: Arc<Registry>,
        routes: Arc<RouteTableHandle>,
        scheduler: Arc<CronScheduler>,
        installer: Arc<DependencyInstaller>,
        logger: Logger,
    ) -> Arc<Self> {
        Arc::new(Self {
            root,
            registry,
            routes,
            scheduler,
            installer,
            logger,
            locks: DashMap::new(),
            swap_lock: AsyncMutex::new(()),
        })
    }

    /// Load every conforming directory under the functions root. Used at
    /// startup; failures are recorded per function and never abort the
    /// sweep.
    pub async fn sweep(self: &Arc<Self>) {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) => {
                error!("cannot read functions directory {}: {err}", self.root.display());
                return;
            }
        };

        let mut loads = JoinSet::new();
        for entry in entries.flatten() {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !entry.path().is_dir() || !is_valid_name(&name) {
                continue;
            }
            let this = Arc::clone(self);
            loads.spawn(async move {
                let _ = this.reload_function(&name).await;
            });
        }
        while loads.join_next().await.is_some() {}

        info!(
            functions = self.registry.running_count(),
            "startup sweep complete"
        );
    }

    /// Single consumer loop over watcher events and management commands.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<ChangeEvent>,
        mut commands: mpsc::Receiver<Command>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                command = commands.recv() => {
                    let Some(Command::Reload { name, reply }) = command else { break };
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        let result = this.reload_function(&name).await;
                        let _ = reply.send(result.map_err(|err| err.to_string()));
                    });
                }
                event = events.recv() => {
                    let Some(event) = event else { break };
                    let this = Arc::clone(&self);
                    tokio::spawn(async move { this.handle_change(event).await });
                }
            }
        }
        debug!("orchestrator loop stopped");
    }

    async fn handle_change(self: Arc<Self>, event: ChangeEvent) {
        match event.kind {
            ChangeKind::DirectoryRemoved => self.unload_function(&event.function).await,
            _ => {
                // The directory may have vanished between the event and
                // now; a missing directory is an unload, not a failure.
                if !self.root.join(&event.function).is_dir() {
                    self.unload_function(&event.function).await;
                    return;
                }
                let _ = self.reload_function(&event.function).await;
            }
        }
    }

    /// Reload one function: prepare the new generation, then swap it in.
    /// Errors are fully recorded here (log + registry) before returning.
    pub async fn reload_function(self: &Arc<Self>, name: &str) -> Result<(), ReloadError> {
        let lock = self.function_lock(name);
        let _guard = lock.lock().await;

        let result = self.prepare_and_swap(name).await;
        if let Err(err) = &result {
            self.record_failure(name, err);
        }
        result
    }

    /// Unload a removed function: stop its jobs, drop its registry
    /// entry, republish the route table.
    pub async fn unload_function(self: &Arc<Self>, name: &str) {
        let lock = self.function_lock(name);
        let _guard = lock.lock().await;

        let Some(entry) = self.registry.get_by_name(name) else {
            return;
        };

        let mut unloading = (*entry).clone();
        unloading.status = FunctionStatus::Unloading;
        self.registry.install(Arc::new(unloading));

        self.scheduler.unload_jobs(name).await;

        {
            let _swap = self.swap_lock.lock().await;
            self.registry.remove(name);
            self.routes.publish(self.registry.build_table());
        }

        self.logger
            .for_function(name)
            .info("function unloaded", json!({"generation": entry.generation}));
        info!(function = name, "function unloaded");
    }

    async fn prepare_and_swap(self: &Arc<Self>, name: &str) -> Result<(), ReloadError> {
        if !is_valid_name(name) {
            return Err(ReloadError::InvalidName(name.to_string()));
        }
        let dir = self.root.join(name);
        if !dir.is_dir() {
            return Err(ReloadError::MissingDirectory(dir));
        }

        if self.registry.get_by_name(name).is_none() {
            self.registry
                .install(Arc::new(FunctionEntry::loading(name, dir.clone())));
        }

        let prepared = self.prepare(name, &dir).await?;
        self.swap(name, &dir, prepared).await
    }

    async fn prepare(self: &Arc<Self>, name: &str, dir: &PathBuf) -> Result<Prepared, ReloadError> {
        let logger = self.logger.for_function(name);

        let env = Arc::new(env_file::load_env(dir, &logger)?);
        let manifests = manifest::load_manifests(dir)?;

        self.installer.ensure(name, dir, &logger).await?;

        let generation = self
            .registry
            .get_by_name(name)
            .map(|entry| entry.generation + 1)
            .unwrap_or(1);

        let mut handlers: HashMap<String, LoadedHandler> = HashMap::new();
        let mut routes = Vec::new();

        if let Some(route_manifest) = &manifests.routes {
            let base = route_manifest.base_path(name);
            let mut seen_keys: Vec<RouteKey> = Vec::new();

            for decl in &route_manifest.routes {
                let artifact = match route_manifest.artifact_for(decl) {
                    Some(artifact) => artifact.to_string(),
                    None => loader::default_artifact(dir)?,
                };
                if !handlers.contains_key(&artifact) {
                    let handler = loader::load_handler(dir, &artifact, generation).await?;
                    handlers.insert(artifact.clone(), handler);
                }

                let full_path = format!("{base}{}", decl.path);
                let route = CompiledRoute {
                    function: name.to_string(),
                    route_path: decl.path.clone(),
                    full_path: full_path.clone(),
                    methods: decl.methods.clone(),
                    artifact,
                    pattern: RoutePattern::compile(&full_path),
                    order: self.registry.next_order(),
                };
                for key in route.keys() {
                    if seen_keys.contains(&key) {
                        return Err(ManifestError::DuplicateRoute {
                            key: key.to_string(),
                        }
                        .into());
                    }
                    seen_keys.push(key);
                }
                routes.push(route);
            }
        }

        Ok(Prepared {
            env,
            manifests,
            handlers,
            routes,
            generation,
        })
    }

    async fn swap(self: &Arc<Self>, name: &str, dir: &PathBuf, prepared: Prepared) -> Result<(), ReloadError> {
        let _swap = self.swap_lock.lock().await;

        let keys: Vec<RouteKey> = prepared.routes.iter().flat_map(CompiledRoute::keys).collect();
        if let Some((key, owner)) = self.registry.conflicting_owner(name, &keys) {
            return Err(crate::error::RouteConflictError {
                key: key.to_string(),
                owner,
            }
            .into());
        }

        self.scheduler.unload_jobs(name).await;
        let jobs = self
            .scheduler
            .start_jobs(
                name,
                dir,
                Arc::clone(&prepared.env),
                &prepared.manifests.cron.jobs,
                prepared.generation,
            )
            .await;

        let entry = Arc::new(FunctionEntry {
            name: name.to_string(),
            dir: dir.clone(),
            status: FunctionStatus::Running,
            env: prepared.env,
            handlers: prepared.handlers,
            routes: prepared.routes,
            jobs,
            generation: prepared.generation,
            loaded_at: chrono::Utc::now(),
            last_error: None,
        });

        self.registry.install(Arc::clone(&entry));
        self.routes.publish(self.registry.build_table());

        self.logger.for_function(name).info(
            "function loaded",
            json!({
                "generation": entry.generation,
                "routes": entry.route_keys().len(),
                "jobs": entry.jobs.len(),
            }),
        );
        info!(
            function = name,
            generation = entry.generation,
            routes = entry.routes.len(),
            jobs = entry.jobs.len(),
            "function loaded"
        );
        Ok(())
    }

    fn record_failure(&self, name: &str, err: &ReloadError) {
        let dir = self.root.join(name);

        // A directory that carries neither descriptor is not a function;
        // drop any placeholder instead of pinning a failed entry.
        if matches!(err, ReloadError::Manifest(ManifestError::NoManifests)) {
            self.registry.remove(name);
            self.logger.for_function(name).warn(
                "directory is not a function",
                json!({"dir": dir.display().to_string()}),
            );
            return;
        }

        self.logger.for_function(name).error(
            format!("function load failed: {err}"),
            json!({"error": err.kind()}),
        );
        error!(function = name, error = err.kind(), "function load failed: {err}");

        match self.registry.get_by_name(name) {
            Some(prev) if prev.status == FunctionStatus::Running => {
                // Last-good generation stays live; only annotate it.
                self.registry.install(Arc::new(prev.with_error(err.to_string())));
            }
            _ => {
                self.registry
                    .install(Arc::new(FunctionEntry::failed(name, dir, err.to_string())));
            }
        }
    }

    fn function_lock(&self, name: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}
