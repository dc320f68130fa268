//! Route table: pattern compilation, request matching, and immutable
//! dispatch snapshots.
//!
//! The table consumed by dispatch is an immutable snapshot behind an
//! `Arc`; every registry mutation builds a fresh table and publishes it
//! with a single pointer swap, so readers never observe a partially
//! updated generation and never hold a lock across handler execution.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

/// The global uniqueness criterion: one owner per `(METHOD, full-path)`.
/// Paths are compared as opaque strings; parameter names participate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey {
    pub method: String,
    pub path: String,
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// A compiled path pattern. `:name` segments bind path parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePattern {
    raw: String,
    segments: Vec<Segment>,
}

impl RoutePattern {
    /// Compile a full path (base + route path, leading `/`).
    pub fn compile(full_path: &str) -> Self {
        let segments = full_path
            .split('/')
            .skip(1)
            .map(|s| match s.strip_prefix(':') {
                Some(name) if !name.is_empty() => Segment::Param(name.to_string()),
                _ => Segment::Literal(s.to_string()),
            })
            .collect();
        Self {
            raw: full_path.to_string(),
            segments,
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Match a concrete request path, binding path parameters. Trailing
    /// slashes are significant: `/a/` and `/a` are distinct.
    pub fn match_path(&self, path: &str) -> Option<HashMap<String, String>> {
        if !path.starts_with('/') {
            return None;
        }
        let given: Vec<&str> = path.split('/').skip(1).collect();
        if given.len() != self.segments.len() {
            return None;
        }

        let mut params = HashMap::new();
        for (segment, value) in self.segments.iter().zip(given) {
            match segment {
                Segment::Literal(lit) => {
                    if lit != value {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    if value.is_empty() {
                        return None;
                    }
                    params.insert(name.clone(), value.to_string());
                }
            }
        }
        Some(params)
    }

    /// Specificity ordering among patterns matching the same path:
    /// literal segments outrank parameter segments at the first point of
    /// difference.
    fn cmp_specificity(&self, other: &Self) -> Ordering {
        for (a, b) in self.segments.iter().zip(&other.segments) {
            match (a, b) {
                (Segment::Literal(_), Segment::Param(_)) => return Ordering::Greater,
                (Segment::Param(_), Segment::Literal(_)) => return Ordering::Less,
                _ => {}
            }
        }
        Ordering::Equal
    }
}

/// One registered route: a pattern, its method set, and the owning
/// function's resolved handler artifact.
#[derive(Debug, Clone)]
pub struct CompiledRoute {
    pub function: String,
    /// Declared path relative to the base, as written in the manifest.
    pub route_path: String,
    pub full_path: String,
    pub methods: Vec<String>,
    pub artifact: String,
    pub pattern: RoutePattern,
    /// Registration stamp; earliest registration wins specificity ties.
    pub order: u64,
}

impl CompiledRoute {
    pub fn keys(&self) -> impl Iterator<Item = RouteKey> + '_ {
        self.methods.iter().map(|m| RouteKey {
            method: m.clone(),
            path: self.full_path.clone(),
        })
    }
}

/// Outcome of resolving a request against the table.
#[derive(Debug)]
pub enum RouteMatch<'a> {
    Found {
        route: &'a CompiledRoute,
        params: HashMap<String, String>,
    },
    /// The path matched but no pattern admits the method.
    MethodNotAllowed { allow: Vec<String> },
    NotFound,
}

/// Immutable dispatch snapshot.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<CompiledRoute>,
}

impl RouteTable {
    /// Build a snapshot. Routes are ordered by registration stamp with a
    /// function-name tiebreak so resolution is deterministic.
    pub fn new(mut routes: Vec<CompiledRoute>) -> Self {
        routes.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.function.cmp(&b.function)));
        Self { routes }
    }

    pub fn resolve(&self, method: &str, path: &str) -> RouteMatch<'_> {
        let mut best: Option<(&CompiledRoute, HashMap<String, String>)> = None;
        let mut allow: BTreeSet<&str> = BTreeSet::new();
        let mut any_match = false;

        for route in &self.routes {
            let Some(params) = route.pattern.match_path(path) else {
                continue;
            };
            any_match = true;

            if route.methods.iter().any(|m| m == method) {
                let more_specific = match &best {
                    None => true,
                    Some((current, _)) => {
                        route.pattern.cmp_specificity(&current.pattern) == Ordering::Greater
                    }
                };
                if more_specific {
                    best = Some((route, params));
                }
            } else {
                allow.extend(route.methods.iter().map(String::as_str));
            }
        }

        match best {
            Some((route, params)) => RouteMatch::Found { route, params },
            None if any_match => RouteMatch::MethodNotAllowed {
                allow: allow.into_iter().map(str::to_string).collect(),
            },
            None => RouteMatch::NotFound,
        }
    }

    /// Every registered key, for the 404 diagnostic body.
    pub fn route_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .routes
            .iter()
            .flat_map(|r| r.keys().map(|k| k.to_string()))
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Shared pointer to the current snapshot. The lock is held only long
/// enough to clone or replace the `Arc`.
#[derive(Debug)]
pub struct RouteTableHandle {
    inner: RwLock<Arc<RouteTable>>,
}

impl Default for RouteTableHandle {
    fn default() -> Self {
        Self {
            inner: RwLock::new(Arc::new(RouteTable::default())),
        }
    }
}

impl RouteTableHandle {
    pub fn load(&self) -> Arc<RouteTable> {
        Arc::clone(&self.inner.read())
    }

    pub fn publish(&self, table: RouteTable) {
        *self.inner.write() = Arc::new(table);
    }
}
