//! Per-client rate limiting for the discovery endpoint.
//!
//! Simple in-memory sliding window per IP address with a burst allowance.
//! Discovery requests fan out to the catalog and the model provider, so the
//! gate sits at request entry rather than around the whole API.

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Body returned when the gate trips.
const RATE_LIMIT_BODY: &str = "429 Failure – rate limit exceeded for dependencies";

/// Configuration for rate limiting.
#[derive(Clone)]
pub struct RateLimitConfig {
    /// Maximum requests per window.
    pub max_requests: u32,
    /// Window duration.
    pub window: Duration,
    /// Burst allowance (extra requests above limit before hard reject).
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 30,
            window: Duration::from_secs(60),
            burst: 10,
        }
    }
}

impl RateLimitConfig {
    /// Reads `RATE_LIMIT_MAX_REQUESTS`, `RATE_LIMIT_WINDOW_SECS`,
    /// `RATE_LIMIT_BURST`, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let parse = |key: &str, fallback: u32| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(fallback)
        };

        Self {
            max_requests: parse("RATE_LIMIT_MAX_REQUESTS", defaults.max_requests),
            window: Duration::from_secs(u64::from(parse(
                "RATE_LIMIT_WINDOW_SECS",
                defaults.window.as_secs() as u32,
            ))),
            burst: parse("RATE_LIMIT_BURST", defaults.burst),
        }
    }
}

/// Rate limiter state tracking requests per IP.
#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Arc<Mutex<HashMap<IpAddr, RateLimitEntry>>>,
}

struct RateLimitEntry {
    count: u32,
    window_start: Instant,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Check if a request from this client should be allowed.
    fn check(&self, ip: IpAddr) -> RateLimitResult {
        let mut state = self.state.lock();
        let now = Instant::now();

        let entry = state.entry(ip).or_insert(RateLimitEntry {
            count: 0,
            window_start: now,
        });

        // Reset window if expired
        if now.duration_since(entry.window_start) >= self.config.window {
            entry.count = 0;
            entry.window_start = now;
        }

        entry.count += 1;

        let limit = self.config.max_requests + self.config.burst;
        let reset_at = entry.window_start + self.config.window;

        if entry.count > limit {
            RateLimitResult::Exceeded {
                retry_after: reset_at.duration_since(now),
            }
        } else {
            RateLimitResult::Allowed
        }
    }

    /// Periodic cleanup of old entries (call from a background task).
    pub fn cleanup(&self) {
        let mut state = self.state.lock();
        let now = Instant::now();
        let window = self.config.window;

        state.retain(|_, entry| now.duration_since(entry.window_start) < window * 2);
    }
}

enum RateLimitResult {
    Allowed,
    Exceeded { retry_after: Duration },
}

/// Gate applied to `/api/dependencies`.
pub async fn dependencies_rate_limit(
    connect_info: Option<ConnectInfo<SocketAddr>>,
    State(limiter): State<RateLimiter>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let ip = connect_info
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

    match limiter.check(ip) {
        RateLimitResult::Allowed => next.run(request).await,
        RateLimitResult::Exceeded { retry_after } => {
            warn!(
                ip = %ip,
                retry_after_secs = retry_after.as_secs(),
                "Rate limit exceeded for dependencies"
            );

            (
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", retry_after.as_secs().to_string())],
                RATE_LIMIT_BODY,
            )
                .into_response()
        }
    }
}
