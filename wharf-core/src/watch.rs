//! Filesystem watcher over the functions directory.
//!
//! Raw `notify` events are classified per function, filtered through a
//! deny list, and coalesced behind a per-function stability window so a
//! burst of writes produces one reload and half-written manifests are
//! never read. A hard floor keeps two reloads of the same function at
//! least five seconds apart.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::event::EventKind;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

use crate::manifest::{CRON_MANIFEST, ROUTE_MANIFEST};
use crate::registry::Registry;
use crate::types::is_valid_name;

/// Change classification, ordered by coalescing priority: when several
/// kinds land inside one stability window the highest wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChangeKind {
    AuxiliaryChanged,
    HandlerChanged,
    ConfigChanged,
    DirectoryAdded,
    DirectoryRemoved,
}

/// A debounced, classified change for one function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub function: String,
    pub kind: ChangeKind,
}

#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Quiet period required before a change is forwarded; doubles as
    /// the write-finish guard.
    pub stability_window: Duration,
    /// Minimum spacing between two reloads of the same function.
    pub reload_floor: Duration,
    /// Directory depth observed below the functions root.
    pub max_depth: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            stability_window: Duration::from_secs(2),
            reload_floor: Duration::from_secs(5),
            max_depth: 3,
        }
    }
}

const DENIED_DIRS: &[&str] = &[
    "node_modules",
    ".wharf-deps",
    "__pycache__",
    ".git",
    ".hg",
    ".svn",
];

const DENIED_FILES: &[&str] = &[
    "package-lock.json",
    ".package-lock.json",
    "yarn.lock",
    ".ds_store",
    "thumbs.db",
];

const DENIED_EXTENSIONS: &[&str] = &["swp", "swo", "swx", "tmp", "bak", "part", "pyc", "stamp"];

/// Live watcher over the functions root. Dropping it stops the notify
/// stream; [`FunctionWatcher::shutdown`] also stops the debounce task.
pub struct FunctionWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for FunctionWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionWatcher")
            .field("task_finished", &self.task.is_finished())
            .finish()
    }
}

impl FunctionWatcher {
    /// Attach a recursive watcher and start the debounce loop, emitting
    /// coalesced [`ChangeEvent`]s on `tx`.
    pub fn spawn(
        root: &Path,
        registry: Arc<Registry>,
        tx: mpsc::Sender<ChangeEvent>,
        config: WatchConfig,
    ) -> notify::Result<Self> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = raw_tx.send(res);
        })?;
        watcher.watch(root, RecursiveMode::Recursive)?;

        let task = tokio::spawn(debounce_loop(
            root.to_path_buf(),
            registry,
            raw_rx,
            tx,
            config,
        ));

        Ok(Self {
            _watcher: watcher,
            task,
        })
    }

    pub fn shutdown(self) {
        self.task.abort();
        // Dropping the watcher stops the notify stream.
    }
}

struct Pending {
    kind: ChangeKind,
    deadline: Instant,
}

async fn debounce_loop(
    root: PathBuf,
    registry: Arc<Registry>,
    mut raw_rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
    tx: mpsc::Sender<ChangeEvent>,
    config: WatchConfig,
) {
    let mut pending: HashMap<String, Pending> = HashMap::new();
    let mut last_emit: HashMap<String, Instant> = HashMap::new();

    loop {
        let next_deadline = pending.values().map(|p| p.deadline).min();

        let msg = match next_deadline {
            None => raw_rx.recv().await,
            Some(deadline) => match timeout_at(deadline, raw_rx.recv()).await {
                Ok(msg) => msg,
                Err(_) => {
                    let now = Instant::now();
                    let due: Vec<String> = pending
                        .iter()
                        .filter(|(_, p)| p.deadline <= now)
                        .map(|(name, _)| name.clone())
                        .collect();
                    for function in due {
                        let Some(p) = pending.remove(&function) else {
                            continue;
                        };
                        last_emit.insert(function.clone(), now);
                        debug!(function = %function, kind = ?p.kind, "forwarding debounced change");
                        if tx
                            .send(ChangeEvent {
                                function,
                                kind: p.kind,
                            })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    continue;
                }
            },
        };

        match msg {
            None => break,
            Some(Err(err)) => warn!("filesystem watch error: {err}"),
            Some(Ok(event)) => {
                let now = Instant::now();
                for (function, kind) in classify(&root, &registry, &config, &event) {
                    let floor = last_emit
                        .get(&function)
                        .map(|at| *at + config.reload_floor)
                        .unwrap_or(now);
                    let deadline = (now + config.stability_window).max(floor);

                    pending
                        .entry(function)
                        .and_modify(|p| {
                            p.kind = p.kind.max(kind);
                            p.deadline = deadline;
                        })
                        .or_insert(Pending { kind, deadline });
                }
            }
        }
    }
}

/// Map a raw notify event onto `(function, kind)` pairs, applying the
/// deny list and the depth cap.
fn classify(
    root: &Path,
    registry: &Registry,
    config: &WatchConfig,
    event: &Event,
) -> Vec<(String, ChangeKind)> {
    if matches!(event.kind, EventKind::Access(_) | EventKind::Any | EventKind::Other) {
        return Vec::new();
    }

    let mut changes = Vec::new();
    for path in &event.paths {
        if let Some(change) = classify_path(root, registry, config, &event.kind, path)
            && !changes.contains(&change)
        {
            changes.push(change);
        }
    }
    changes
}

fn classify_path(
    root: &Path,
    registry: &Registry,
    config: &WatchConfig,
    kind: &EventKind,
    path: &Path,
) -> Option<(String, ChangeKind)> {
    let rel = path.strip_prefix(root).ok()?;
    let components: Vec<&str> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(os) => os.to_str(),
            _ => None,
        })
        .collect();

    if components.is_empty() || components.len() > config.max_depth {
        return None;
    }
    if components.iter().any(|c| is_denied(c)) {
        return None;
    }

    let function = components[0];
    if !is_valid_name(function) {
        return None;
    }

    if components.len() == 1 {
        // The function directory itself. Creation of a stray top-level
        // file must not look like a new function.
        return match kind {
            EventKind::Create(_) if path.is_dir() => {
                Some((function.to_string(), ChangeKind::DirectoryAdded))
            }
            EventKind::Create(_) => None,
            EventKind::Remove(_) => Some((function.to_string(), ChangeKind::DirectoryRemoved)),
            _ => Some((function.to_string(), ChangeKind::AuxiliaryChanged)),
        };
    }

    let file_name = components[components.len() - 1];
    let change = if components.len() == 2 && (file_name == ROUTE_MANIFEST || file_name == CRON_MANIFEST)
    {
        ChangeKind::ConfigChanged
    } else if components.len() == 2 && is_known_handler(registry, function, file_name) {
        ChangeKind::HandlerChanged
    } else {
        ChangeKind::AuxiliaryChanged
    };

    Some((function.to_string(), change))
}

/// Is the file a route or cron handler artifact of the loaded function?
/// Unloaded functions have no artifact set yet; their files ride along as
/// auxiliary changes.
fn is_known_handler(registry: &Registry, function: &str, file_name: &str) -> bool {
    registry.get_by_name(function).is_some_and(|entry| {
        entry.handlers.contains_key(file_name)
            || entry.jobs.iter().any(|job| job.handler == file_name)
    })
}

fn is_denied(component: &str) -> bool {
    let lower = component.to_ascii_lowercase();
    if DENIED_DIRS.contains(&lower.as_str()) || DENIED_FILES.contains(&lower.as_str()) {
        return true;
    }
    if lower.ends_with('~') || lower.starts_with(".#") {
        return true;
    }
    match lower.rsplit_once('.') {
        Some((_, ext)) => DENIED_EXTENSIONS.contains(&ext),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::{CompiledRoute, RoutePattern};
    use crate::types::{FunctionEntry, FunctionStatus, JobDescriptor};
    use chrono::Utc;
    use notify::event::{CreateKind, ModifyKind, RemoveKind};
    use tempfile::TempDir;

    fn registry_with_greeter(dir: &Path) -> Arc<Registry> {
        let registry = Registry::new();
        let mut handlers = HashMap::new();
        handlers.insert(
            "handler.sh".to_string(),
            crate::loader::LoadedHandler {
                artifact: "handler.sh".to_string(),
                path: dir.join("greeter/handler.sh"),
                runtime: crate::loader::HandlerRuntime::Shell,
                generation: 1,
            },
        );
        registry.install(Arc::new(FunctionEntry {
            name: "greeter".to_string(),
            dir: dir.join("greeter"),
            status: FunctionStatus::Running,
            env: Arc::new(HashMap::new()),
            handlers,
            routes: vec![CompiledRoute {
                function: "greeter".to_string(),
                route_path: "/".to_string(),
                full_path: "/greeter/".to_string(),
                methods: vec!["GET".to_string()],
                artifact: "handler.sh".to_string(),
                pattern: RoutePattern::compile("/greeter/"),
                order: 0,
            }],
            jobs: vec![JobDescriptor {
                name: "tick".to_string(),
                schedule: "* * * * *".to_string(),
                timezone: "UTC".to_string(),
                handler: "job.sh".to_string(),
            }],
            generation: 1,
            loaded_at: Utc::now(),
            last_error: None,
        }));
        Arc::new(registry)
    }

    fn modify(path: PathBuf) -> Event {
        Event::new(EventKind::Modify(ModifyKind::Any)).add_path(path)
    }

    #[test]
    fn manifest_and_handler_changes_classify() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let registry = registry_with_greeter(root);
        let config = WatchConfig::default();

        let changes = classify(&root, &registry, &config, &modify(root.join("greeter/route.config.json")));
        assert_eq!(changes, vec![("greeter".to_string(), ChangeKind::ConfigChanged)]);

        let changes = classify(&root, &registry, &config, &modify(root.join("greeter/cron.json")));
        assert_eq!(changes, vec![("greeter".to_string(), ChangeKind::ConfigChanged)]);

        let changes = classify(&root, &registry, &config, &modify(root.join("greeter/handler.sh")));
        assert_eq!(changes, vec![("greeter".to_string(), ChangeKind::HandlerChanged)]);

        let changes = classify(&root, &registry, &config, &modify(root.join("greeter/job.sh")));
        assert_eq!(changes, vec![("greeter".to_string(), ChangeKind::HandlerChanged)]);

        let changes = classify(&root, &registry, &config, &modify(root.join("greeter/notes.txt")));
        assert_eq!(
            changes,
            vec![("greeter".to_string(), ChangeKind::AuxiliaryChanged)]
        );
    }

    #[test]
    fn deny_list_and_depth_cap_filter_noise() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let registry = registry_with_greeter(root);
        let config = WatchConfig::default();

        for path in [
            root.join("greeter/node_modules/leftpad/index.js"),
            root.join("greeter/package-lock.json"),
            root.join("greeter/.handler.sh.swp"),
            root.join("greeter/handler.sh~"),
            root.join("greeter/.git/HEAD"),
            root.join("greeter/__pycache__/handler.pyc"),
            root.join("greeter/a/b/c/too-deep.txt"),
            root.join("Greeter/handler.sh"),
        ] {
            assert!(
                classify(&root, &registry, &config, &modify(path.clone())).is_empty(),
                "expected {path:?} to be ignored"
            );
        }
    }

    #[test]
    fn top_level_directory_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let registry = registry_with_greeter(root);
        let config = WatchConfig::default();

        std::fs::create_dir(root.join("newfn")).unwrap();
        let event = Event::new(EventKind::Create(CreateKind::Folder)).add_path(root.join("newfn"));
        assert_eq!(
            classify(root, &registry, &config, &event),
            vec![("newfn".to_string(), ChangeKind::DirectoryAdded)]
        );

        // A stray top-level file is not a new function.
        std::fs::write(root.join("strayfile"), "x").unwrap();
        let event = Event::new(EventKind::Create(CreateKind::File)).add_path(root.join("strayfile"));
        assert!(classify(root, &registry, &config, &event).is_empty());

        let event = Event::new(EventKind::Remove(RemoveKind::Folder)).add_path(root.join("greeter"));
        assert_eq!(
            classify(root, &registry, &config, &event),
            vec![("greeter".to_string(), ChangeKind::DirectoryRemoved)]
        );
    }

    #[test]
    fn coalescing_priority_prefers_structural_changes() {
        assert!(ChangeKind::DirectoryRemoved > ChangeKind::DirectoryAdded);
        assert!(ChangeKind::DirectoryAdded > ChangeKind::ConfigChanged);
        assert!(ChangeKind::ConfigChanged > ChangeKind::HandlerChanged);
        assert!(ChangeKind::HandlerChanged > ChangeKind::AuxiliaryChanged);
    }

    #[tokio::test]
    async fn watcher_coalesces_bursts_into_one_event() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_path_buf();
        std::fs::create_dir(root.join("burst")).unwrap();

        let registry = Arc::new(Registry::new());
        let (tx, mut rx) = mpsc::channel(16);
        let config = WatchConfig {
            stability_window: Duration::from_millis(200),
            reload_floor: Duration::from_millis(400),
            max_depth: 3,
        };
        let watcher = FunctionWatcher::spawn(&root, registry, tx, config).expect("watcher");

        for i in 0..5 {
            std::fs::write(root.join("burst/route.config.json"), format!("{{\"v\":{i}}}"))
                .unwrap();
        }

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("change within window")
            .expect("channel open");
        assert_eq!(event.function, "burst");

        // The burst landed inside one stability window.
        assert!(
            tokio::time::timeout(Duration::from_millis(300), rx.recv())
                .await
                .is_err(),
            "burst must coalesce into a single event"
        );

        watcher.shutdown();
    }
}
