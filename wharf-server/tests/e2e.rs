//! End-to-end scenarios: real function directories on disk, the full
//! reload pipeline, and requests driven through the axum service.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use axum::response::Response;
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use wharf_core::installer::{DependencyInstaller, InstallerConfig};
use wharf_core::orchestrator::Orchestrator;
use wharf_core::scheduler::CronScheduler;
use wharf_core::watch::{FunctionWatcher, WatchConfig};
use wharf_core::{LogLevel, Logger, LoggerConfig, Registry, RouteTableHandle};
use wharf_server::{AppState, create_app};

struct TestHost {
    _tmp: TempDir,
    root: PathBuf,
    registry: Arc<Registry>,
    scheduler: Arc<CronScheduler>,
    orchestrator: Arc<Orchestrator>,
    logger: Logger,
    app: Router,
}

fn host() -> TestHost {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("functions");
    std::fs::create_dir_all(&root).unwrap();

    let mut logger_config = LoggerConfig::new(tmp.path().join("logs"));
    logger_config.min_level = LogLevel::Debug;
    let logger = Logger::new(logger_config).unwrap();

    let registry = Arc::new(Registry::new());
    let routes = Arc::new(RouteTableHandle::default());
    let scheduler = Arc::new(CronScheduler::new(logger.clone()));
    let installer = Arc::new(DependencyInstaller::new(InstallerConfig::default()));
    let orchestrator = Orchestrator::new(
        root.clone(),
        Arc::clone(&registry),
        Arc::clone(&routes),
        Arc::clone(&scheduler),
        installer,
        logger.clone(),
    );

    let app = create_app(AppState {
        registry: Arc::clone(&registry),
        routes: Arc::clone(&routes),
        logger: logger.clone(),
    });

    TestHost {
        _tmp: tmp,
        root,
        registry,
        scheduler,
        orchestrator,
        logger,
        app,
    }
}

fn write_function(root: &PathBuf, name: &str, routes_json: &str, handler: &str) {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("route.config.json"), routes_json).unwrap();
    std::fs::write(dir.join("handler.sh"), handler).unwrap();
}

fn text_handler(body: &str) -> String {
    format!("cat >/dev/null\nprintf '{{\"status\":200,\"body\":\"{body}\"}}'\n")
}

async fn send(app: &Router, method: &str, path: &str) -> Response {
    let request = Request::builder()
        .method(method)
        .uri(path)
        .body(Body::empty())
        .unwrap();
    app.clone().oneshot(request).await.unwrap()
}

async fn body_text(response: Response) -> String {
    let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    String::from_utf8_lossy(&bytes).into_owned()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}

#[tokio::test]
async fn boot_with_two_functions() {
    let host = host();
    write_function(
        &host.root,
        "a",
        r#"{"routes": [{"path": "/", "methods": ["GET"]}]}"#,
        &text_handler("a-v1"),
    );
    write_function(
        &host.root,
        "b",
        r#"{"routes": [{"path": "/info", "methods": ["GET", "POST"]}]}"#,
        &text_handler("b-v1"),
    );
    host.orchestrator.sweep().await;

    let response = send(&host.app, "GET", "/a/").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "a-v1");

    assert_eq!(send(&host.app, "GET", "/b/info").await.status(), StatusCode::OK);
    assert_eq!(send(&host.app, "POST", "/b/info").await.status(), StatusCode::OK);

    let response = send(&host.app, "PUT", "/b/info").await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(
        response.headers().get(header::ALLOW).unwrap(),
        "GET,POST"
    );

    assert_eq!(send(&host.app, "GET", "/c/").await.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn conflict_on_load_keeps_incumbent() {
    let host = host();
    write_function(
        &host.root,
        "a",
        r#"{"base": "/", "routes": [{"path": "/shared", "methods": ["GET"]}]}"#,
        &text_handler("from-a"),
    );
    host.orchestrator.reload_function("a").await.unwrap();

    write_function(
        &host.root,
        "b",
        r#"{"base": "/", "routes": [{"path": "/shared", "methods": ["GET"]}]}"#,
        &text_handler("from-b"),
    );
    host.orchestrator.reload_function("b").await.unwrap_err();

    let response = send(&host.app, "GET", "/shared").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "from-a");

    let b = host.registry.get_by_name("b").unwrap();
    assert_eq!(b.status, wharf_core::FunctionStatus::Failed);

    let errors = host.logger.recent(10, Some("b"), Some(LogLevel::Error));
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].data["error"], "RouteConflictError");
    assert!(errors[0].message.contains("\"a\""));
}

#[tokio::test]
async fn health_reports_running_functions() {
    let host = host();
    write_function(
        &host.root,
        "a",
        r#"{"routes": [{"path": "/", "methods": ["GET"]}]}"#,
        &text_handler("ok"),
    );
    host.orchestrator.sweep().await;

    let response = send(&host.app, "GET", "/health").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["functions"], 1);
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn unmatched_request_gets_diagnostic_body() {
    let host = host();
    write_function(
        &host.root,
        "a",
        r#"{"routes": [{"path": "/", "methods": ["GET"]}]}"#,
        &text_handler("ok"),
    );
    host.orchestrator.sweep().await;

    let response = send(&host.app, "GET", "/nope").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["method"], "GET");
    assert_eq!(body["path"], "/nope");
    assert_eq!(body["availableRoutes"], serde_json::json!(["GET /a/"]));
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn failing_handler_yields_500_with_context() {
    let host = host();
    write_function(
        &host.root,
        "boom",
        r#"{"routes": [{"path": "/", "methods": ["GET"]}]}"#,
        "cat >/dev/null\necho 'kaboom' >&2\nexit 2\n",
    );
    host.orchestrator.sweep().await;

    let response = send(&host.app, "GET", "/boom/").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(response).await;
    assert_eq!(body["function"], "boom");
    assert_eq!(body["route"], "/boom/");
    assert!(body["error"].as_str().unwrap().contains("exited"));

    let errors = host.logger.recent(10, Some("boom"), Some(LogLevel::Error));
    assert_eq!(errors.len(), 1);
}

#[tokio::test]
async fn function_env_and_query_params_reach_the_handler() {
    let host = host();
    let dir = host.root.join("envy");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("route.config.json"),
        r#"{"routes": [{"path": "/greet", "methods": ["GET"]}]}"#,
    )
    .unwrap();
    std::fs::write(dir.join(".env"), "GREETING='well met'\n").unwrap();
    std::fs::write(
        dir.join("handler.sh"),
        "if grep -q '\"who\":\"world\"'; then WHO=world; else WHO=unknown; fi\n\
         printf '{\"body\":\"%s %s\"}' \"$GREETING\" \"$WHO\"\n",
    )
    .unwrap();
    host.orchestrator.sweep().await;

    let response = send(&host.app, "GET", "/envy/greet?who=world").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "well met world");
}

#[tokio::test]
async fn access_records_are_written_per_request() {
    let host = host();
    write_function(
        &host.root,
        "a",
        r#"{"routes": [{"path": "/", "methods": ["GET"]}]}"#,
        &text_handler("ok"),
    );
    host.orchestrator.sweep().await;

    send(&host.app, "GET", "/a/").await;
    send(&host.app, "GET", "/missing").await;

    let function_access = host.logger.recent(10, Some("a"), Some(LogLevel::Access));
    assert_eq!(function_access.len(), 1);
    assert_eq!(function_access[0].data["status"], 200);
    assert_eq!(function_access[0].data["method"], "GET");
    assert!(function_access[0].data["durationMs"].is_u64());

    let all_access = host.logger.recent(10, None, Some(LogLevel::Access));
    assert_eq!(all_access.len(), 2);
    assert_eq!(all_access[1].data["status"], 404);
}

/// Wire the watcher and the orchestrator loop the way `main` does, with
/// short debounce windows for test speed.
fn spawn_reload_pipeline(
    host: &TestHost,
) -> (FunctionWatcher, CancellationToken, mpsc::Sender<wharf_core::orchestrator::Command>) {
    let (event_tx, event_rx) = mpsc::channel(64);
    // Kept alive: closing the command channel stops the loop.
    let (cmd_tx, cmd_rx) = mpsc::channel(4);
    let token = CancellationToken::new();

    let watcher = FunctionWatcher::spawn(
        &host.root,
        Arc::clone(&host.registry),
        event_tx,
        WatchConfig {
            stability_window: Duration::from_millis(200),
            reload_floor: Duration::from_millis(400),
            max_depth: 3,
        },
    )
    .expect("watcher");

    tokio::spawn(Arc::clone(&host.orchestrator).run(event_rx, cmd_rx, token.clone()));
    (watcher, token, cmd_tx)
}

#[tokio::test]
async fn hot_reload_swaps_handler_without_visible_errors() {
    let host = host();
    write_function(
        &host.root,
        "a",
        r#"{"routes": [{"path": "/hello", "methods": ["GET"]}]}"#,
        &text_handler("v1"),
    );
    host.orchestrator.sweep().await;
    let (watcher, token, _cmd_tx) = spawn_reload_pipeline(&host);

    let response = send(&host.app, "GET", "/a/hello").await;
    assert_eq!(body_text(response).await, "v1");

    // Atomic replace so no in-flight spawn ever reads a half-written file.
    let staged = host.root.join("a/handler.new");
    std::fs::write(&staged, text_handler("v2")).unwrap();
    std::fs::rename(&staged, host.root.join("a/handler.sh")).unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let response = send(&host.app, "GET", "/a/hello").await;
        assert_eq!(response.status(), StatusCode::OK, "no error during the swap");
        let body = body_text(response).await;
        assert!(body == "v1" || body == "v2", "unexpected body {body:?}");
        if body == "v2" {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "handler was not reloaded in time"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let entry = host.registry.get_by_name("a").unwrap();
    assert_eq!(entry.generation, 2);

    watcher.shutdown();
    token.cancel();
}

#[tokio::test]
async fn removing_a_directory_unloads_routes_and_jobs() {
    let host = host();
    write_function(
        &host.root,
        "b",
        r#"{"routes": [{"path": "/info", "methods": ["GET"]}]}"#,
        &text_handler("b"),
    );
    std::fs::write(
        host.root.join("b/cron.json"),
        r#"{"jobs": [{"name": "tick", "schedule": "0 0 1 1 *", "handler": "handler.sh"}]}"#,
    )
    .unwrap();
    host.orchestrator.sweep().await;
    assert_eq!(host.scheduler.job_names("b"), vec!["tick"]);
    let (watcher, token, _cmd_tx) = spawn_reload_pipeline(&host);

    assert_eq!(send(&host.app, "GET", "/b/info").await.status(), StatusCode::OK);

    std::fs::remove_dir_all(host.root.join("b")).unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if send(&host.app, "GET", "/b/info").await.status() == StatusCode::NOT_FOUND {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "routes survived directory removal"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert!(host.registry.get_by_name("b").is_none());
    assert!(host.scheduler.job_names("b").is_empty());

    watcher.shutdown();
    token.cancel();
}

#[tokio::test]
async fn adding_a_directory_loads_it_live() {
    let host = host();
    host.orchestrator.sweep().await;
    let (watcher, token, _cmd_tx) = spawn_reload_pipeline(&host);

    assert_eq!(send(&host.app, "GET", "/late/").await.status(), StatusCode::NOT_FOUND);

    write_function(
        &host.root,
        "late",
        r#"{"routes": [{"path": "/", "methods": ["GET"]}]}"#,
        &text_handler("late-v1"),
    );

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let response = send(&host.app, "GET", "/late/").await;
        if response.status() == StatusCode::OK {
            assert_eq!(body_text(response).await, "late-v1");
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "new directory was not loaded"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    watcher.shutdown();
    token.cancel();
}
