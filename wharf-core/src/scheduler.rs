//! Cron scheduler: owns every scheduled job.
//!
//! Job declarations are validated per job; a bad schedule, unknown
//! timezone, or missing artifact skips that job with a WARN and never
//! fails the function's load. Each scheduled job is a task sleeping
//! toward its next tick; fires run in their own task guarded by a
//! per-job mutex so no invocation ever overlaps itself.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use chrono_tz::Tz;
use cron::Schedule;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{SchedulerError, ShutdownError};
use crate::loader::{self, CronHandlerRequest, LoadedHandler};
use crate::logger::{LogLevel, Logger};
use crate::manifest::JobDecl;
use crate::types::JobDescriptor;

const DRAIN_WINDOW: Duration = Duration::from_secs(5);

/// Parse a 5-field cron expression, normalizing to the seconds-bearing
/// form the `cron` crate expects (fires at second 0).
pub fn parse_schedule(expression: &str) -> Result<Schedule, SchedulerError> {
    if expression.split_whitespace().count() != 5 {
        return Err(SchedulerError::InvalidSchedule {
            expression: expression.to_string(),
            detail: "expected 5 fields".to_string(),
        });
    }
    Schedule::from_str(&format!("0 {expression}")).map_err(|err| SchedulerError::InvalidSchedule {
        expression: expression.to_string(),
        detail: err.to_string(),
    })
}

/// Resolve an optional IANA timezone name; UTC when absent.
pub fn resolve_timezone(name: Option<&str>) -> Result<Tz, SchedulerError> {
    match name {
        None => Ok(Tz::UTC),
        Some(name) => name.parse().map_err(|_| SchedulerError::UnknownTimezone {
            timezone: name.to_string(),
        }),
    }
}

struct JobHandle {
    name: String,
    token: CancellationToken,
    task: JoinHandle<()>,
    busy: Arc<AsyncMutex<()>>,
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("name", &self.name)
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

/// Owns all job handles, keyed by function name. Job sets are swapped by
/// the orchestrator under the function's reload lock: old set stopped,
/// then new set started.
#[derive(Debug)]
pub struct CronScheduler {
    jobs: Mutex<HashMap<String, Vec<JobHandle>>>,
    logger: Logger,
    drain: Duration,
}

impl CronScheduler {
    pub fn new(logger: Logger) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            logger,
            drain: DRAIN_WINDOW,
        }
    }

    #[cfg(test)]
    fn with_drain(logger: Logger, drain: Duration) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            logger,
            drain,
        }
    }

    /// Validate and start the function's jobs, returning descriptors for
    /// the registry. Invalid declarations are skipped with a WARN.
    pub async fn start_jobs(
        &self,
        function: &str,
        dir: &Path,
        env: Arc<HashMap<String, String>>,
        declarations: &[JobDecl],
        generation: u64,
    ) -> Vec<JobDescriptor> {
        let logger = self.logger.for_function(function);
        let mut handles = Vec::new();
        let mut descriptors = Vec::new();

        for decl in declarations {
            let schedule = match parse_schedule(&decl.schedule) {
                Ok(schedule) => schedule,
                Err(err) => {
                    logger.warn(
                        format!("skipping cron job: {err}"),
                        json!({"job": decl.name, "schedule": decl.schedule}),
                    );
                    continue;
                }
            };
            let tz = match resolve_timezone(decl.timezone.as_deref()) {
                Ok(tz) => tz,
                Err(err) => {
                    logger.warn(
                        format!("skipping cron job: {err}"),
                        json!({"job": decl.name, "timezone": decl.timezone}),
                    );
                    continue;
                }
            };
            let handler = match loader::load_handler(dir, &decl.handler, generation).await {
                Ok(handler) => handler,
                Err(err) => {
                    logger.warn(
                        format!("skipping cron job: {err}"),
                        json!({"job": decl.name, "handler": decl.handler}),
                    );
                    continue;
                }
            };

            let token = CancellationToken::new();
            let busy = Arc::new(AsyncMutex::new(()));
            let task = tokio::spawn(run_job(JobContext {
                function: function.to_string(),
                dir: dir.to_path_buf(),
                env: Arc::clone(&env),
                job: decl.name.clone(),
                handler,
                schedule: schedule.clone(),
                tz,
                token: token.clone(),
                busy: Arc::clone(&busy),
                logger: logger.clone(),
            }));

            debug!(function, job = %decl.name, schedule = %decl.schedule, "cron job scheduled");
            handles.push(JobHandle {
                name: decl.name.clone(),
                token,
                task,
                busy,
            });
            descriptors.push(JobDescriptor {
                name: decl.name.clone(),
                schedule: decl.schedule.clone(),
                timezone: tz.name().to_string(),
                handler: decl.handler.clone(),
            });
        }

        if !handles.is_empty() {
            self.jobs.lock().insert(function.to_string(), handles);
        }
        descriptors
    }

    /// Stop every handle owned by the function and wait for running
    /// invocations to drain. Past the window a handle is abandoned with a
    /// WARN.
    pub async fn unload_jobs(&self, function: &str) -> usize {
        let handles = self.jobs.lock().remove(function).unwrap_or_default();
        if handles.is_empty() {
            return 0;
        }

        for handle in &handles {
            handle.token.cancel();
        }

        let logger = self.logger.for_function(function);
        let mut abandoned = 0;
        for handle in handles {
            let JobHandle { name, task, busy, .. } = handle;
            let drained = timeout(self.drain, async {
                let _ = task.await;
                let _running = busy.lock().await;
            })
            .await
            .is_ok();

            if !drained {
                abandoned += 1;
                let err = ShutdownError {
                    what: format!("cron job {name:?}"),
                    seconds: self.drain.as_secs(),
                };
                logger.warn(err.to_string(), json!({"job": name}));
            }
        }
        abandoned
    }

    /// Job names currently scheduled for a function.
    pub fn job_names(&self, function: &str) -> Vec<String> {
        self.jobs
            .lock()
            .get(function)
            .map(|handles| handles.iter().map(|h| h.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Stop everything; used by the shutdown coordinator.
    pub async fn shutdown(&self) {
        let functions: Vec<String> = self.jobs.lock().keys().cloned().collect();
        for function in functions {
            self.unload_jobs(&function).await;
        }
    }
}

struct JobContext {
    function: String,
    dir: PathBuf,
    env: Arc<HashMap<String, String>>,
    job: String,
    handler: LoadedHandler,
    schedule: Schedule,
    tz: Tz,
    token: CancellationToken,
    busy: Arc<AsyncMutex<()>>,
    logger: Logger,
}

async fn run_job(ctx: JobContext) {
    loop {
        let Some(next) = ctx.schedule.upcoming(ctx.tz).next() else {
            break;
        };
        let now = Utc::now().with_timezone(&ctx.tz);
        let Ok(wait) = next.signed_duration_since(now).to_std() else {
            continue;
        };

        tokio::select! {
            _ = ctx.token.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        match Arc::clone(&ctx.busy).try_lock_owned() {
            Ok(running) => {
                let request = CronHandlerRequest {
                    job_name: ctx.job.clone(),
                    function_name: ctx.function.clone(),
                    scheduled_for: next.with_timezone(&Utc),
                };
                let handler = ctx.handler.clone();
                let dir = ctx.dir.clone();
                let env = Arc::clone(&ctx.env);
                let logger = ctx.logger.clone();
                let job = ctx.job.clone();

                tokio::spawn(async move {
                    let started = Instant::now();
                    let result = loader::invoke_cron(&handler, &dir, &env, &request, &logger).await;
                    let duration_ms = started.elapsed().as_millis() as u64;
                    match result {
                        Ok(()) => logger.log(
                            LogLevel::Cron,
                            "cron job completed",
                            json!({
                                "job": job,
                                "durationMs": duration_ms,
                                "scheduledFor": request.scheduled_for,
                                "generation": handler.generation,
                            }),
                        ),
                        Err(err) => logger.log(
                            LogLevel::CronError,
                            format!("cron job failed: {err}"),
                            json!({
                                "error": "CronHandlerError",
                                "job": job,
                                "durationMs": duration_ms,
                                "scheduledFor": request.scheduled_for,
                            }),
                        ),
                    }
                    drop(running);
                });
            }
            Err(_) => {
                ctx.logger.warn(
                    "skipping overlapping cron fire",
                    json!({"job": ctx.job, "missedTick": next.to_rfc3339()}),
                );
            }
        }
    }
}
