//! Custom middleware for HTTP request recording
//!
//! Every request gets its own `Lifecycle` (reachable from handlers through
//! request extensions). Once the response is ready, the request itself is
//! recorded as an inbound traffic event and the lifecycle is flushed in a
//! tracked background task, so recording never delays the response and is
//! still awaited on shutdown.

use axum::{
    body::{Body, HttpBody},
    http::{header, HeaderMap, Request, Uri},
    response::Response,
};
use futures::future::BoxFuture;
use std::{
    sync::Arc,
    task::{Context, Poll},
    time::Instant,
};
use tower::{Layer, Service};

use super::AppState;
use crate::db::{Context as TrafficContext, TrafficEvent};
use crate::lifecycle::Lifecycle;

/// Path prefixes not recorded as traffic (the viewer polls these continuously)
const EXCLUDED_PREFIXES: &[&str] = &["/api/livelog"];

/// Scheme the client used, checking proxy headers first
fn get_scheme(headers: &HeaderMap, uri: &Uri) -> String {
    if let Some(proto) = headers.get("x-forwarded-proto") {
        if let Ok(proto) = proto.to_str() {
            if let Some(first) = proto.split(',').next() {
                let proto = first.trim();
                if !proto.is_empty() {
                    return proto.to_string();
                }
            }
        }
    }

    uri.scheme_str().unwrap_or("http").to_string()
}

/// Host the request was addressed to
fn get_authority(headers: &HeaderMap, uri: &Uri) -> String {
    headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .or_else(|| uri.authority().map(|a| a.to_string()))
        .unwrap_or_default()
}

/// Layer for HTTP request recording
#[derive(Clone)]
pub struct RequestRecordingLayer {
    state: Arc<AppState>,
}

impl RequestRecordingLayer {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

impl<S> Layer<S> for RequestRecordingLayer {
    type Service = RequestRecordingMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestRecordingMiddleware {
            inner,
            state: self.state.clone(),
        }
    }
}

/// Middleware service for HTTP request recording
#[derive(Clone)]
pub struct RequestRecordingMiddleware<S> {
    inner: S,
    state: Arc<AppState>,
}

impl<S> Service<Request<Body>> for RequestRecordingMiddleware<S>
where
    S: Service<Request<Body>, Response = Response> + Send + Clone + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<Body>) -> Self::Future {
        let state = self.state.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let lifecycle = Lifecycle::new(&state.statistics, state.live_log.clone());
            request.extensions_mut().insert(lifecycle.clone());

            // Extract request info before passing to handler
            let method = request.method().to_string();
            let path = request.uri().path().to_string();
            let query = request.uri().query().map(|q| format!("?{}", q)).unwrap_or_default();
            let full_uri = format!("{}{}", path, query);
            let scheme = get_scheme(request.headers(), request.uri());
            let authority = get_authority(request.headers(), request.uri());
            let request_size = calculate_request_size(request.headers(), &method, &full_uri);
            let should_record = !EXCLUDED_PREFIXES.iter().any(|p| path.starts_with(p));

            let started = Instant::now();
            let response = inner.call(request).await?;
            let latency_ms = u32::try_from(started.elapsed().as_millis()).unwrap_or(u32::MAX);
            let status = response.status().as_u16();
            let response_size = calculate_response_size(&response);

            // Record and flush in the background (end of this request's lifecycle)
            let site = state.statistics.site;
            let tasks = state.clone();
            tasks.background.spawn(async move {
                if should_record {
                    let event = TrafficEvent::new(TrafficContext::Inbound, &method, &scheme, &authority, &path)
                        .with_response(status, latency_ms)
                        .with_sizes(request_size, response_size)
                        .with_site(site);
                    lifecycle.record(&event).await;
                }
                lifecycle.finish(&state.db).await;
            });

            Ok(response)
        })
    }
}

/// Calculate estimated request size from headers and request line
fn calculate_request_size(headers: &HeaderMap, method: &str, uri: &str) -> u64 {
    // Request line: "GET /path HTTP/1.1\r\n"
    let request_line_size = method.len() + 1 + uri.len() + 11;

    // "Key: Value\r\n"
    let headers_size: usize = headers
        .iter()
        .map(|(k, v)| k.as_str().len() + 2 + v.len() + 2)
        .sum();

    let body_size: usize = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    (request_line_size + headers_size + 2 + body_size) as u64
}

/// Response body size from Content-Length, or the body's exact size hint
fn calculate_response_size(response: &Response) -> u64 {
    response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
        .or_else(|| response.body().size_hint().exact())
        .unwrap_or(0)
}
