//! # HTTP Trigger Routes
//!
//! Everything under the mount point is handed to the HTTP enqueuer. The
//! response is streamed from whatever the worker writes.

use std::convert::Infallible;

use axum::{
    body::{Body, Bytes},
    extract::{Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::any,
    Json, Router,
};
use serde_json::json;
use tracing::warn;

use super::state::AppState;
use crate::enqueuer::http::{HttpDispatch, MOUNT_PATH};
use crate::queue::{Header, HttpRequest, ResponseChunk, ResponseReceiver};

pub fn invoke_routes() -> Router<AppState> {
    Router::new()
        .route(MOUNT_PATH, any(invoke_handler))
        .route(&format!("{}/*path", MOUNT_PATH), any(invoke_handler))
}

/// Path relative to the mount point, always starting with `/`
pub fn relative_path(path: &str) -> String {
    let rest = path.strip_prefix(MOUNT_PATH).unwrap_or(path);
    if rest.starts_with('/') {
        rest.to_string()
    } else {
        format!("/{}", rest)
    }
}

fn to_request(method: &Method, uri: &Uri, headers: &HeaderMap, body: Bytes) -> HttpRequest {
    let query = Query::<Vec<(String, String)>>::try_from_uri(uri)
        .map(|Query(pairs)| pairs)
        .unwrap_or_default()
        .into_iter()
        .map(|(name, value)| Header::new(name, value))
        .collect();
    let headers = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| Header::new(name.as_str(), value))
        })
        .collect();

    HttpRequest {
        method: method.as_str().to_string(),
        url: uri.to_string(),
        path: relative_path(uri.path()),
        params: Vec::new(),
        query,
        headers,
        body: body.to_vec(),
    }
}

async fn invoke_handler(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = to_request(&method, &uri, &headers, body);

    match state.enqueuers.http.dispatch(request) {
        Ok(HttpDispatch::NotFound) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "message": format!("No function is bound to {} {}", method, uri.path()) })),
        )
            .into_response(),
        Ok(HttpDispatch::Preflight { allow_methods }) => preflight(&allow_methods),
        Ok(HttpDispatch::Enqueued { event_id, response }) => stream_response(&event_id, response).await,
        Err(e) => {
            warn!(error = %e, path = %uri.path(), "HTTP invocation failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "message": e.to_string() })),
            )
                .into_response()
        }
    }
}

fn preflight(allow_methods: &str) -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("*"));
    if let Ok(value) = HeaderValue::from_str(allow_methods) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, value);
    }
    response
}

/// Wait for the head, then stream data chunks until the end marker
async fn stream_response(event_id: &str, mut receiver: ResponseReceiver) -> Response {
    let (status, headers) = match receiver.recv().await {
        Some(ResponseChunk::Head { status, headers }) => (status, headers),
        other => {
            warn!(event_id = %event_id, chunk = ?other, "Response ended before its head");
            return (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "message": "Function did not respond" })),
            )
                .into_response();
        }
    };

    let body = futures_util::stream::unfold(receiver, |mut receiver| async move {
        match receiver.recv().await {
            Some(ResponseChunk::Data(data)) => Some((Ok::<_, Infallible>(Bytes::from(data)), receiver)),
            _ => None,
        }
    });

    let mut response = Response::new(Body::from_stream(body));
    *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    for Header { name, value } in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().append(name, value);
            }
            _ => warn!(event_id = %event_id, header = %name, "Dropping invalid response header"),
        }
    }
    response
}
