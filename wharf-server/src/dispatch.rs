//! Request dispatch: the HTTP surface of the route multiplexer.
//!
//! Every request outside `/health` lands in [`dispatch`], which resolves
//! the current route-table snapshot, builds the invocation context, runs
//! the handler, and emits one ACCESS record on completion. Handler
//! failures become a 500 with a small JSON body; they never take the
//! host down.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::{Body, to_bytes};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use chrono::Utc;
use serde_json::{Value, json};
use uuid::Uuid;
use wharf_core::loader::{self, HttpHandlerRequest};
use wharf_core::logger::LogLevel;
use wharf_core::route::{RouteMatch, RouteTableHandle};
use wharf_core::types::InvocationContext;
use wharf_core::{HandlerError, Logger, Registry};

/// Request bodies beyond this are rejected before reaching the handler.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub routes: Arc<RouteTableHandle>,
    pub logger: Logger,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("functions", &self.registry.running_count())
            .finish()
    }
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "functions": state.registry.running_count(),
        "timestamp": Utc::now(),
    }))
}

/// Fallback service: everything that is not `/health`.
pub async fn dispatch(State(state): State<AppState>, request: Request) -> Response {
    let started = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.to_string());
    let user_agent = request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let table = state.routes.load();
    let (response, function) = match table.resolve(&method, &path) {
        RouteMatch::NotFound => (
            (
                StatusCode::NOT_FOUND,
                Json(json!({
                    "method": method,
                    "path": path,
                    "availableRoutes": table.route_keys(),
                    "timestamp": Utc::now(),
                })),
            )
                .into_response(),
            None,
        ),
        RouteMatch::MethodNotAllowed { allow } => {
            let allow_value = allow.join(",");
            let mut response = (
                StatusCode::METHOD_NOT_ALLOWED,
                Json(json!({
                    "error": "method not allowed",
                    "method": method,
                    "path": path,
                    "allow": allow,
                    "timestamp": Utc::now(),
                })),
            )
                .into_response();
            if let Ok(value) = HeaderValue::from_str(&allow_value) {
                response.headers_mut().insert(header::ALLOW, value);
            }
            (response, None)
        }
        RouteMatch::Found { route, params } => {
            let function = route.function.clone();
            let route_path = route.route_path.clone();
            let artifact = route.artifact.clone();
            let full_path = route.full_path.clone();
            let response = invoke_route(
                &state,
                request,
                &function,
                &route_path,
                &full_path,
                &artifact,
                params,
            )
            .await;
            (response, Some(function))
        }
    };

    let access_logger = match &function {
        Some(name) => state.logger.for_function(name),
        None => state.logger.clone(),
    };
    access_logger.log(
        LogLevel::Access,
        format!("{method} {path} {}", response.status().as_u16()),
        json!({
            "method": method,
            "path": path,
            "status": response.status().as_u16(),
            "durationMs": started.elapsed().as_millis() as u64,
            "remote": remote,
            "userAgent": user_agent,
        }),
    );

    response
}

#[allow(clippy::too_many_arguments)]
async fn invoke_route(
    state: &AppState,
    request: Request,
    function: &str,
    route_path: &str,
    full_path: &str,
    artifact: &str,
    params: HashMap<String, String>,
) -> Response {
    let Some(entry) = state.registry.get_by_name(function) else {
        // The table and registry are updated under one swap lock; a miss
        // here means the function vanished mid-flight.
        return handler_error_response(
            function,
            full_path,
            &HandlerError::NonZeroExit {
                status: -1,
                stderr: "function is no longer loaded".to_string(),
            },
        );
    };
    let Some(handler) = entry.handlers.get(artifact) else {
        return handler_error_response(
            function,
            full_path,
            &HandlerError::NonZeroExit {
                status: -1,
                stderr: format!("no loaded handler for artifact {artifact:?}"),
            },
        );
    };

    let context = InvocationContext {
        function: function.to_string(),
        dir: entry.dir.clone(),
        route_path: route_path.to_string(),
        artifact: artifact.to_string(),
        env: Arc::clone(&entry.env),
        logger: state.logger.for_function(function),
        request_id: Uuid::new_v4().to_string(),
        started: Instant::now(),
    };

    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let query_params = parse_query(request.uri().query());
    let headers = collect_headers(&request);

    let body = match to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(json!({"error": "request body too large"})),
            )
                .into_response();
        }
    };
    let (body, is_base64_encoded) = loader::encode_body(&body);

    let handler_request = HttpHandlerRequest {
        method,
        path,
        route_path: context.route_path.clone(),
        path_params: params,
        query_params,
        headers,
        body,
        is_base64_encoded,
        function_name: context.function.clone(),
        request_id: context.request_id.clone(),
    };

    match loader::invoke_http(
        handler,
        &context.dir,
        &context.env,
        &handler_request,
        &context.logger,
    )
    .await
    {
        Ok(handler_response) => build_response(&context, full_path, handler_response),
        Err(err) => {
            context.logger.error(
                format!("handler failed: {err}"),
                json!({
                    "route": full_path,
                    "artifact": context.artifact,
                    "requestId": context.request_id,
                }),
            );
            handler_error_response(&context.function, full_path, &err)
        }
    }
}

fn build_response(
    context: &InvocationContext,
    full_path: &str,
    handler_response: loader::HandlerResponse,
) -> Response {
    let status = StatusCode::from_u16(handler_response.status)
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let body = match handler_response.body_bytes() {
        Ok(body) => body,
        Err(err) => {
            context.logger.error(
                format!("handler failed: {err}"),
                json!({"route": full_path, "requestId": context.request_id}),
            );
            return handler_error_response(&context.function, full_path, &err);
        }
    };

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    for (name, value) in &handler_response.headers {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        let Ok(value) = HeaderValue::from_str(value) else {
            continue;
        };
        response.headers_mut().insert(name, value);
    }
    response
}

fn handler_error_response(function: &str, route: &str, err: &HandlerError) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "error": err.to_string(),
            "function": function,
            "route": route,
            "timestamp": Utc::now(),
        })),
    )
        .into_response()
}

fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    match query {
        Some(query) => url::form_urlencoded::parse(query.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect(),
        None => HashMap::new(),
    }
}

fn collect_headers(request: &Request) -> HashMap<String, String> {
    request
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}
