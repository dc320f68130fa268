//! Structured per-function logging.
//!
//! Every record is one JSON object per line, written to the global
//! `main.log` sink and, when the record is bound to a function, to that
//! function's sink under `functions/`. Callers never block: records are
//! handed to a single writer task over an unbounded channel. A bounded
//! in-memory tail of recent records backs the dashboard read API.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

/// Record severity. `Access`, `Cron`, and `CronError` are product levels
/// emitted by the multiplexer and the scheduler; they bypass the
/// `LOG_LEVEL` threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Access,
    Cron,
    CronError,
}

impl LogLevel {
    /// Position in the DEBUG..ERROR ladder; `None` for the product levels
    /// that are never threshold-filtered.
    fn severity(self) -> Option<u8> {
        match self {
            LogLevel::Debug => Some(0),
            LogLevel::Info => Some(1),
            LogLevel::Warn => Some(2),
            LogLevel::Error => Some(3),
            LogLevel::Access | LogLevel::Cron | LogLevel::CronError => None,
        }
    }

    fn is_error_class(self) -> bool {
        matches!(self, LogLevel::Error | LogLevel::CronError)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Access => "ACCESS",
            LogLevel::Cron => "CRON",
            LogLevel::CronError => "CRON_ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARN" | "WARNING" => Ok(LogLevel::Warn),
            "ERROR" => Ok(LogLevel::Error),
            "ACCESS" => Ok(LogLevel::Access),
            "CRON" => Ok(LogLevel::Cron),
            "CRON_ERROR" => Ok(LogLevel::CronError),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

/// One structured record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Value::is_null", default)]
    pub data: Value,
}

/// Sink layout and retention knobs.
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// Root log directory; `main.log` and `functions/` live underneath.
    pub dir: PathBuf,
    /// Threshold for DEBUG/INFO/WARN/ERROR records.
    pub min_level: LogLevel,
    /// Size at which a sink file is rotated.
    pub max_file_bytes: u64,
    /// Rotated generations kept per sink (`<file>.1` .. `<file>.N`).
    pub retained_files: usize,
    /// Capacity of the in-memory tail served by [`Logger::recent`].
    pub tail_capacity: usize,
}

impl LoggerConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            min_level: LogLevel::Info,
            max_file_bytes: 100 * 1024 * 1024,
            retained_files: 5,
            tail_capacity: 1024,
        }
    }
}

enum WriterMsg {
    Record(LogRecord),
    Flush(oneshot::Sender<()>),
}

struct Shared {
    min_level: LogLevel,
    tail: Mutex<VecDeque<LogRecord>>,
    tail_capacity: usize,
}

/// Cheaply cloneable handle. [`Logger::for_function`] yields a clone bound
/// to a function name; the bound name overrides any name supplied per
/// record.
#[derive(Clone)]
pub struct Logger {
    tx: mpsc::UnboundedSender<WriterMsg>,
    shared: Arc<Shared>,
    function: Option<Arc<str>>,
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("function", &self.function)
            .field("min_level", &self.shared.min_level)
            .finish()
    }
}

impl Logger {
    /// Create the sink directories and start the writer task.
    pub fn new(config: LoggerConfig) -> std::io::Result<Self> {
        std::fs::create_dir_all(config.dir.join("functions"))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            min_level: config.min_level,
            tail: Mutex::new(VecDeque::with_capacity(config.tail_capacity)),
            tail_capacity: config.tail_capacity,
        });

        tokio::spawn(writer_loop(config, rx));

        Ok(Self {
            tx,
            shared,
            function: None,
        })
    }

    /// Clone bound to a function name.
    pub fn for_function(&self, name: &str) -> Logger {
        Logger {
            tx: self.tx.clone(),
            shared: Arc::clone(&self.shared),
            function: Some(Arc::from(name)),
        }
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>, data: Value) {
        if let (Some(sev), Some(min)) = (level.severity(), self.shared.min_level.severity())
            && sev < min
        {
            return;
        }

        let function = match &self.function {
            Some(bound) => Some(bound.to_string()),
            None => data
                .get("function")
                .and_then(Value::as_str)
                .map(str::to_owned),
        };

        let record = LogRecord {
            timestamp: Utc::now(),
            level,
            function,
            message: message.into(),
            data,
        };

        {
            let mut tail = self.shared.tail.lock();
            if tail.len() == self.shared.tail_capacity {
                tail.pop_front();
            }
            tail.push_back(record.clone());
        }

        // Only fails after the writer task is gone, i.e. during teardown.
        let _ = self.tx.send(WriterMsg::Record(record));
    }

    pub fn debug(&self, message: impl Into<String>, data: Value) {
        self.log(LogLevel::Debug, message, data);
    }

    pub fn info(&self, message: impl Into<String>, data: Value) {
        self.log(LogLevel::Info, message, data);
    }

    pub fn warn(&self, message: impl Into<String>, data: Value) {
        self.log(LogLevel::Warn, message, data);
    }

    pub fn error(&self, message: impl Into<String>, data: Value) {
        self.log(LogLevel::Error, message, data);
    }

    /// Most recent records, newest last, optionally filtered by function
    /// and level. The sole read surface consumed by the dashboard.
    pub fn recent(
        &self,
        limit: usize,
        function: Option<&str>,
        level: Option<LogLevel>,
    ) -> Vec<LogRecord> {
        let tail = self.shared.tail.lock();
        let filtered: Vec<LogRecord> = tail
            .iter()
            .filter(|r| function.is_none_or(|f| r.function.as_deref() == Some(f)))
            .filter(|r| level.is_none_or(|l| r.level == l))
            .cloned()
            .collect();
        let skip = filtered.len().saturating_sub(limit);
        filtered.into_iter().skip(skip).collect()
    }

    /// Wait for every record enqueued so far to reach disk.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(WriterMsg::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

struct Sink {
    file: File,
    written: u64,
}

async fn writer_loop(config: LoggerConfig, mut rx: mpsc::UnboundedReceiver<WriterMsg>) {
    let mut sinks: HashMap<PathBuf, Sink> = HashMap::new();

    while let Some(msg) = rx.recv().await {
        match msg {
            WriterMsg::Record(record) => {
                let Ok(mut line) = serde_json::to_string(&record) else {
                    continue;
                };
                line.push('\n');

                for path in sink_paths(&config.dir, &record) {
                    if let Err(err) = write_line(&config, &mut sinks, &path, &line).await {
                        warn!("log write to {} failed: {err}", path.display());
                        sinks.remove(&path);
                    }
                }
            }
            WriterMsg::Flush(done) => {
                for sink in sinks.values_mut() {
                    let _ = sink.file.flush().await;
                }
                let _ = done.send(());
            }
        }
    }
}

fn sink_paths(dir: &Path, record: &LogRecord) -> Vec<PathBuf> {
    let mut paths = vec![dir.join("main.log")];
    if let Some(function) = &record.function {
        paths.push(dir.join("functions").join(format!("{function}.log")));
        if record.level.is_error_class() {
            paths.push(dir.join("functions").join(format!("{function}.error.log")));
        }
    }
    paths
}

async fn write_line(
    config: &LoggerConfig,
    sinks: &mut HashMap<PathBuf, Sink>,
    path: &Path,
    line: &str,
) -> std::io::Result<()> {
    if !sinks.contains_key(path) {
        let file = OpenOptions::new().create(true).append(true).open(path).await?;
        let written = file.metadata().await?.len();
        sinks.insert(path.to_path_buf(), Sink { file, written });
    }

    let needs_rotation = sinks
        .get(path)
        .is_some_and(|s| s.written + line.len() as u64 > config.max_file_bytes);
    if needs_rotation {
        sinks.remove(path);
        rotate(path, config.retained_files).await?;
        let file = OpenOptions::new().create(true).append(true).open(path).await?;
        sinks.insert(path.to_path_buf(), Sink { file, written: 0 });
    }

    if let Some(sink) = sinks.get_mut(path) {
        sink.file.write_all(line.as_bytes()).await?;
        sink.written += line.len() as u64;
    }
    Ok(())
}

fn numbered(path: &Path, n: usize) -> PathBuf {
    PathBuf::from(format!("{}.{n}", path.display()))
}

async fn rotate(path: &Path, retain: usize) -> std::io::Result<()> {
    if retain == 0 {
        return tokio::fs::remove_file(path).await;
    }
    let _ = tokio::fs::remove_file(numbered(path, retain)).await;
    for n in (1..retain).rev() {
        let _ = tokio::fs::rename(numbered(path, n), numbered(path, n + 1)).await;
    }
    tokio::fs::rename(path, numbered(path, 1)).await
}
