//! The function registry: the single authoritative index of loaded
//! functions.
//!
//! All writers go through the reload orchestrator. The lock is held only
//! across index mutation, never across user code; dispatch works from
//! immutable route-table snapshots rebuilt after each mutation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::route::{RouteKey, RouteTable};
use crate::types::{FunctionEntry, FunctionStatus, FunctionSummary};

#[derive(Debug, Default)]
pub struct Registry {
    inner: RwLock<HashMap<String, Arc<FunctionEntry>>>,
    order: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<FunctionEntry>> {
        self.inner.read().get(name).cloned()
    }

    /// Atomic replacement; returns the previous entry if any.
    pub fn install(&self, entry: Arc<FunctionEntry>) -> Option<Arc<FunctionEntry>> {
        self.inner.write().insert(entry.name.clone(), entry)
    }

    pub fn remove(&self, name: &str) -> Option<Arc<FunctionEntry>> {
        self.inner.write().remove(name)
    }

    /// Point-in-time snapshot of every function, sorted by name.
    pub fn list(&self) -> Vec<FunctionSummary> {
        let mut rows: Vec<FunctionSummary> = self
            .inner
            .read()
            .values()
            .map(|entry| FunctionSummary {
                name: entry.name.clone(),
                status: entry.status,
                routes: entry.route_keys().iter().map(RouteKey::to_string).collect(),
                jobs: entry.jobs.clone(),
                generation: entry.generation,
                loaded_at: entry.loaded_at,
                last_error: entry.last_error.clone(),
            })
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }

    /// `(route-key, owner-name)` pairs across all registered routes.
    /// Only live generations carry routes; placeholders contribute
    /// nothing, so no status filter is needed (or wanted: a function
    /// mid-reload must keep defending its keys).
    pub fn iter_routes(&self) -> Vec<(RouteKey, String)> {
        self.inner
            .read()
            .values()
            .flat_map(|entry| {
                entry
                    .route_keys()
                    .into_iter()
                    .map(|key| (key, entry.name.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// First key from `keys` already owned by a function other than
    /// `name`, with its owner.
    pub fn conflicting_owner(&self, name: &str, keys: &[RouteKey]) -> Option<(RouteKey, String)> {
        self.iter_routes()
            .into_iter()
            .find(|(key, owner)| owner != name && keys.contains(key))
    }

    pub fn running_count(&self) -> usize {
        self.inner
            .read()
            .values()
            .filter(|entry| entry.status == FunctionStatus::Running)
            .count()
    }

    /// Fresh dispatch snapshot over every registered route.
    pub fn build_table(&self) -> RouteTable {
        let routes = self
            .inner
            .read()
            .values()
            .flat_map(|entry| entry.routes.iter().cloned())
            .collect();
        RouteTable::new(routes)
    }

    /// Monotonic registration stamp for route ordering.
    pub fn next_order(&self) -> u64 {
        self.order.fetch_add(1, Ordering::Relaxed)
    }
}
