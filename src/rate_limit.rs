//! Rate limiting for the ceremony endpoints

use axum::{
    extract::{ConnectInfo, FromRequestParts, Request, State},
    http::{request::Parts, Extensions, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{
    collections::HashMap,
    convert::Infallible,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::RwLock;
use tracing::warn;

/// Rate limiter configuration
#[derive(Clone, Debug)]
pub struct RateLimiterConfig {
    /// Maximum requests per window
    pub max_requests: u32,
    /// Time window duration
    pub window_duration: Duration,
    /// Whether to use IP-based limiting
    pub use_ip_limiting: bool,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_requests: 30,
            window_duration: Duration::from_secs(60),
            use_ip_limiting: true,
        }
    }
}

/// Fixed-window limiter keyed by client
#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    requests: Arc<RwLock<HashMap<String, RequestInfo>>>,
}

#[derive(Debug, Clone)]
struct RequestInfo {
    count: u32,
    window_start: Instant,
}

#[derive(Debug, PartialEq, Eq)]
pub struct RateLimited {
    pub retry_after: u64,
    pub limit: u32,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            requests: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Drop clients whose window has closed
    pub async fn cleanup(&self) {
        let now = Instant::now();
        self.requests.write().await.retain(|_, info| {
            now.duration_since(info.window_start) < self.config.window_duration
        });
    }

    #[cfg(test)]
    async fn tracked_clients(&self) -> usize {
        self.requests.read().await.len()
    }

    /// Count a request for `key`, failing once the window is exhausted
    pub async fn check_rate_limit(&self, key: &str) -> Result<(), RateLimited> {
        if rand::random::<f32>() < 0.01 {
            self.cleanup().await;
        }

        let mut requests = self.requests.write().await;
        let now = Instant::now();

        let info = requests.entry(key.to_string()).or_insert(RequestInfo {
            count: 0,
            window_start: now,
        });

        if now.duration_since(info.window_start) >= self.config.window_duration {
            info.count = 0;
            info.window_start = now;
        }

        if info.count >= self.config.max_requests {
            let retry_after = self
                .config
                .window_duration
                .saturating_sub(now.duration_since(info.window_start))
                .as_secs()
                .max(1);

            return Err(RateLimited {
                retry_after,
                limit: self.config.max_requests,
            });
        }

        info.count += 1;
        Ok(())
    }
}

/// Best-effort client address: proxy headers first, then the peer address
pub fn client_key(headers: &HeaderMap, extensions: &Extensions) -> Option<String> {
    if let Some(forwarded_for) = headers.get("x-forwarded-for") {
        if let Ok(value) = forwarded_for.to_str() {
            if let Some(ip) = value.split(',').next() {
                let ip = ip.trim();
                if !ip.is_empty() {
                    return Some(ip.to_string());
                }
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip") {
        if let Ok(value) = real_ip.to_str() {
            return Some(value.trim().to_string());
        }
    }

    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|conn_info| conn_info.0.ip().to_string())
}

/// Extracts the caller's address for audit logging
#[derive(Debug, Clone)]
pub struct ClientIp(pub Option<String>);

impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(ClientIp(client_key(&parts.headers, &parts.extensions)))
    }
}

/// Rate limiting middleware
pub async fn rate_limit_middleware(
    State(limiter): State<RateLimiter>,
    request: Request,
    next: Next,
) -> Response {
    let key = if limiter.config.use_ip_limiting {
        client_key(request.headers(), request.extensions())
            .unwrap_or_else(|| "unknown".to_string())
    } else {
        "global".to_string()
    };

    if let Err(err) = limiter.check_rate_limit(&key).await {
        warn!(client = %key, path = %request.uri().path(), "rate limit exceeded");

        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            axum::Json(json!({
                "ok": false,
                "error": "Too many requests",
                "retry_after": err.retry_after,
            })),
        )
            .into_response();

        let headers = response.headers_mut();
        headers.insert("X-RateLimit-Limit", HeaderValue::from(err.limit));
        headers.insert("X-RateLimit-Remaining", HeaderValue::from_static("0"));
        headers.insert("Retry-After", HeaderValue::from(err.retry_after));

        return response;
    }

    next.run(request).await
}

pub mod presets {
    use super::*;
    use crate::config::BioIdConfig;

    /// Enrollment and verification ceremonies, per configuration
    pub fn ceremony_endpoints(config: &BioIdConfig) -> RateLimiter {
        RateLimiter::new(RateLimiterConfig {
            max_requests: config.rate_limit_max_requests,
            window_duration: config.rate_limit_window(),
            use_ip_limiting: true,
        })
    }
}
