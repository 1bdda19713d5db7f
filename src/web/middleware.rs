//! Request logging middleware
//!
//! Resolves the real client address once per request, hands it to handlers
//! as a [`ClientIp`] extension and logs the outcome with its latency.

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{HeaderMap, Request},
    response::Response,
};
use futures::future::BoxFuture;
use std::{
    net::SocketAddr,
    task::{Context, Poll},
    time::Instant,
};
use tower::{Layer, Service};
use tracing::{info, warn};

/// Client address after proxy headers are taken into account
#[derive(Debug, Clone)]
pub struct ClientIp(pub String);

/// Get the real client IP address, checking proxy headers first
/// Priority: X-Real-IP > X-Forwarded-For (first IP) > ConnectInfo
fn get_real_ip(headers: &HeaderMap, fallback_ip: &str) -> String {
    // Set by Caddy/nginx
    if let Some(ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let ip = ip.trim();
        if !ip.is_empty() {
            return ip.to_string();
        }
    }

    // May contain a chain of proxies, first is the original client
    if let Some(ips) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first_ip) = ips.split(',').next() {
            let ip = first_ip.trim();
            if !ip.is_empty() {
                return ip.to_string();
            }
        }
    }

    fallback_ip.to_string()
}

#[derive(Clone, Default)]
pub struct RequestLoggingLayer;

impl<S> Layer<S> for RequestLoggingLayer {
    type Service = RequestLoggingMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestLoggingMiddleware { inner }
    }
}

#[derive(Clone)]
pub struct RequestLoggingMiddleware<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for RequestLoggingMiddleware<S>
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
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let started = Instant::now();
            let method = request.method().to_string();
            let path = request.uri().path().to_string();

            let fallback_ip = request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
                .unwrap_or_else(|| "unknown".to_string());
            let ip = get_real_ip(request.headers(), &fallback_ip);
            request.extensions_mut().insert(ClientIp(ip.clone()));

            let response = inner.call(request).await?;

            let status = response.status();
            let elapsed_ms = started.elapsed().as_millis();
            if status.is_server_error() {
                warn!("HTTP {} {} from {} -> {} ({}ms)", method, path, ip, status.as_u16(), elapsed_ms);
            } else {
                info!("HTTP {} {} from {} -> {} ({}ms)", method, path, ip, status.as_u16(), elapsed_ms);
            }

            Ok(response)
        })
    }
}
