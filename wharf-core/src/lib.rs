//! Core runtime for the Wharf function host.
//!
//! Wharf loads independently-developed user functions from a watched
//! directory, serves each function's declared HTTP routes from a shared
//! port, runs per-function cron jobs, and hot-reloads functions when
//! their files change. This crate holds the runtime components; the HTTP
//! surface and process lifecycle live in `wharf-server`.
//!
//! Component map:
//! - [`logger`] — structured per-function JSON-lines logging
//! - [`manifest`] — `route.config.json` / `cron.json` loading
//! - [`env_file`] — function-local `.env` parsing
//! - [`installer`] — dependency installation coordinator
//! - [`loader`] — handler artifact loading and subprocess invocation
//! - [`registry`] — the authoritative function index
//! - [`route`] — route patterns, matching, dispatch snapshots
//! - [`scheduler`] — cron job lifecycle
//! - [`watch`] — filesystem watching, classification, debouncing
//! - [`orchestrator`] — reload serialization and atomic swaps

pub mod env_file;
pub mod error;
pub mod installer;
pub mod loader;
pub mod logger;
pub mod manifest;
pub mod orchestrator;
pub mod registry;
pub mod route;
pub mod scheduler;
pub mod types;
pub mod watch;

pub use error::{
    DependencyError, HandlerError, LoadError, ManifestError, ReloadError, RouteConflictError,
    SchedulerError, ShutdownError,
};
pub use logger::{LogLevel, LogRecord, Logger, LoggerConfig};
pub use registry::Registry;
pub use route::{RouteMatch, RouteTable, RouteTableHandle};
pub use types::{FunctionEntry, FunctionStatus, FunctionSummary, InvocationContext};
