// 请求日志中间件
use std::net::SocketAddr;
use std::time::Instant;

use axum::{
    extract::{ConnectInfo, Request},
    http::{header, Method},
    middleware::Next,
    response::Response,
};
use tower_http::cors::{Any, CorsLayer};

use crate::trial::RequestOrigin;

/// Log method, path, status, latency and client address for every request.
pub async fn request_log_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().path().to_string();

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client_ip = RequestOrigin::from_parts(request.headers(), peer)
        .client_address()
        .unwrap_or_else(|| "-".to_string());

    let start = Instant::now();
    let response = next.run(request).await;
    let duration = start.elapsed().as_millis() as u64;
    let status = response.status().as_u16();

    if uri.starts_with("/health") {
        tracing::debug!("[Request] {} {} → {} ({}ms)", method, uri, status, duration);
    } else {
        tracing::info!(
            "[Request] {} {} → {} ({}ms) client_ip={}",
            method,
            uri,
            status,
            duration,
            client_ip
        );
    }

    response
}

/// Browser front-ends call the trial endpoint cross-origin.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}
