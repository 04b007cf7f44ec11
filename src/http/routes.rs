//! HTTP surface (component G).
//!
//! Grounded directly on `examples/http_server.rs`'s axum `Router`/handler
//! layout (`resolve_repo_path`-style path validation, `headers_to_map`,
//! `Body::from_stream` for streamed responses) and the content-type/
//! service-name helpers in `protocol::http`, extended with `/healthz` and
//! `/metrics` per `SPEC_FULL.md` §4.G.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use bytes::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use futures::StreamExt as _;

use crate::error::GobletError;
use crate::fingerprint::{Command as V2Command, ParsedRequest};
use crate::http::metrics;
use crate::materializer;
use crate::state::AppState;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/{repo}/info/refs", get(info_refs))
        .route("/{repo}/git-upload-pack", post(upload_pack))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_endpoint))
        .with_state(state)
}

const UPLOAD_PACK_RESULT_CONTENT_TYPE: &str = "application/x-git-upload-pack-result";
const UPLOAD_PACK_ADVERTISEMENT_CONTENT_TYPE: &str = "application/x-git-upload-pack-advertisement";

fn headers_to_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_ascii_lowercase(), v.to_string())))
        .collect()
}

/// Rejects path traversal and constructs the upstream origin URL this repo
/// name maps to. Goblet proxies a single configured upstream host family
/// (passed via the `X-Goblet-Origin` header or a `origin` query parameter,
/// since spec §6 treats URL canonicalization as a pluggable collaborator
/// rather than a baked-in origin).
fn origin_url_for(repo: &str, query: &HashMap<String, String>, headers: &HashMap<String, String>) -> Result<String, GobletError> {
    if repo.contains("..") || repo.contains('\\') {
        return Err(GobletError::Forbidden("invalid repository path".into()));
    }
    if let Some(origin) = query.get("origin") {
        return Ok(format!("{}/{}", origin.trim_end_matches('/'), repo));
    }
    if let Some(origin) = headers.get("x-goblet-origin") {
        return Ok(format!("{}/{}", origin.trim_end_matches('/'), repo));
    }
    Err(GobletError::Protocol(
        "no origin specified (origin= query param or X-Goblet-Origin header required)".into(),
    ))
}

/// Enforces the total-request deadline up to the first response byte (spec:
/// "on timeout before first byte: HTTP 504"). Only wraps the non-streaming
/// work (mirror resolution); once a response body starts streaming the
/// per-subprocess deadlines in `upstream.rs`/`materializer.rs` apply instead.
async fn with_request_deadline<F, T>(state: &AppState, fut: F) -> Result<T, GobletError>
where
    F: std::future::Future<Output = Result<T, GobletError>>,
{
    match tokio::time::timeout(state.request_timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(GobletError::Timeout(format!(
            "request exceeded total deadline of {:?} before the first response byte",
            state.request_timeout
        ))),
    }
}

async fn healthz(State(state): State<Arc<AppState>>) -> Response {
    if tokio::fs::metadata(state.mirrors.cache_root())
        .await
        .is_ok()
    {
        (StatusCode::OK, "ok").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "cache root unavailable").into_response()
    }
}

async fn metrics_endpoint(State(state): State<Arc<AppState>>) -> Response {
    let body = metrics::render(&state);
    ([("Content-Type", "text/plain; version=0.0.4")], body).into_response()
}

async fn info_refs(
    State(state): State<Arc<AppState>>,
    Path(repo): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let started = Instant::now();

    if query.get("service").map(String::as_str) != Some("git-upload-pack") {
        return GobletError::Protocol("only service=git-upload-pack is supported".into())
            .into_response();
    }

    let header_map = headers_to_map(&headers);
    let origin = match origin_url_for(&repo, &query, &header_map) {
        Ok(o) => o,
        Err(e) => return e.into_response(),
    };

    let credentials = match state.auth.authenticate(&header_map).await {
        Ok(c) => c,
        Err(e) => return e.into_response(),
    };

    let empty_request = ParsedRequest {
        command: Some(V2Command::LsRefs),
        ..Default::default()
    };
    let fingerprint = empty_request.fingerprint();

    let ready = with_request_deadline(&state, async {
        let handle = state
            .resolve_fresh_mirror(&origin, false, fingerprint, &credentials, "ls-refs")
            .await?;
        let refs = materializer::ls_refs(&state.mirrors, &handle, &empty_request).await?;
        Ok(refs)
    })
    .await;
    let refs = match ready {
        Ok(r) => r,
        Err(e) => {
            state.counters.observe_duration("ls-refs", started.elapsed());
            return e.into_response();
        }
    };

    let mut body = bytes::BytesMut::new();
    crate::pktline::encode_data(&mut body, b"# service=git-upload-pack\n");
    crate::pktline::encode_flush(&mut body);
    body.extend_from_slice(&materializer::capability_advertisement());
    body.extend_from_slice(&refs);

    state.counters.observe_duration("ls-refs", started.elapsed());
    state.counters.add_bytes_out(body.len() as u64);

    (
        [("Content-Type", UPLOAD_PACK_ADVERTISEMENT_CONTENT_TYPE)],
        body.freeze(),
    )
        .into_response()
}

async fn upload_pack(
    State(state): State<Arc<AppState>>,
    Path(repo): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    request_body: Bytes,
) -> Response {
    let started = Instant::now();

    let header_map = headers_to_map(&headers);
    let origin = match origin_url_for(&repo, &query, &header_map) {
        Ok(o) => o,
        Err(e) => return e.into_response(),
    };
    let credentials = match state.auth.authenticate(&header_map).await {
        Ok(c) => c,
        Err(e) => return e.into_response(),
    };

    let parsed = match ParsedRequest::parse(&request_body) {
        Ok(p) => p,
        Err(e) => return e.into_response(),
    };
    if parsed.command != Some(V2Command::Fetch) {
        return GobletError::Protocol("git-upload-pack body must be a fetch command".into())
            .into_response();
    }
    let fingerprint = parsed.fingerprint();

    let ready = with_request_deadline(&state, async {
        // First pass: get whatever mirror we have (refreshing if simply stale).
        let handle = state
            .resolve_fresh_mirror(&origin, false, fingerprint, &credentials, "fetch")
            .await?;

        // Second pass: if a specific wanted oid is missing, force a refresh
        // regardless of freshness window (spec §4.H).
        let mut missing = false;
        for want in &parsed.wants {
            if !state.mirrors.has_object(&handle, want).await? {
                missing = true;
                break;
            }
        }
        if missing {
            state
                .resolve_fresh_mirror(&origin, true, fingerprint, &credentials, "fetch")
                .await
        } else {
            Ok(handle)
        }
    })
    .await;
    let handle = match ready {
        Ok(h) => h,
        Err(e) => {
            state.counters.observe_duration("fetch", started.elapsed());
            return e.into_response();
        }
    };

    let stream = match materializer::fetch_stream(&handle, request_body).await {
        Ok(s) => s,
        Err(e) => {
            state.counters.observe_duration("fetch", started.elapsed());
            return e.into_response();
        }
    };

    state.counters.observe_duration("fetch", started.elapsed());

    let counting_state = Arc::clone(&state);
    let body_stream = stream.map(move |res| match res {
        Ok(bytes) => {
            counting_state.counters.add_bytes_out(bytes.len() as u64);
            Ok::<_, std::io::Error>(bytes)
        }
        Err(e) => Err(std::io::Error::other(e.to_string())),
    });

    (
        [("Content-Type", UPLOAD_PACK_RESULT_CONTENT_TYPE)],
        Body::from_stream(body_stream),
    )
        .into_response()
}
