use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::ConnectInfo,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::ApiError;

#[derive(Debug, Default)]
struct Window {
    hits: VecDeque<Instant>,
}

/// Per-address sliding-window limiter: at most `max` requests inside any
/// trailing `window`. Orthogonal to the per-rule daily limits enforced by
/// the permission engine.
#[derive(Clone)]
pub struct RateLimiter {
    windows: Arc<Mutex<HashMap<IpAddr, Window>>>,
    max: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max: usize, window: Duration) -> Self {
        Self {
            windows: Arc::new(Mutex::new(HashMap::new())),
            max,
            window,
        }
    }

    pub async fn check(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        let entry = windows.entry(ip).or_default();

        while let Some(front) = entry.hits.front() {
            if now.duration_since(*front) >= self.window {
                entry.hits.pop_front();
            } else {
                break;
            }
        }

        if entry.hits.len() < self.max {
            entry.hits.push_back(now);
            true
        } else {
            false
        }
    }

    /// Evict addresses idle longer than `max_idle`.
    pub async fn purge_stale(&self, max_idle: Duration) {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        windows.retain(|_, w| {
            w.hits
                .back()
                .map(|last| now.duration_since(*last) < max_idle)
                .unwrap_or(false)
        });
    }
}

pub async fn rate_limit_middleware(
    axum::extract::State(limiter): axum::extract::State<RateLimiter>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    if let Some(ip) = client_ip(&req) {
        if !limiter.check(ip).await {
            warn!(ip = %ip, "Rate limit exceeded");
            return ApiError::rate_limited().into_response();
        }
    }

    next.run(req).await
}

/// The peer address of the connection, or the nearest proxy-reported one
/// when the socket address is unavailable. A forwarded-for list keeps only
/// its first (client-most) hop.
fn client_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    let proxied = |name: &str| -> Option<IpAddr> {
        req.headers()
            .get(name)?
            .to_str()
            .ok()?
            .split(',')
            .next()?
            .trim()
            .parse()
            .ok()
    };

    req.extensions()
        .get::<ConnectInfo<std::net::SocketAddr>>()
        .map(|info| info.0.ip())
        .or_else(|| proxied("x-forwarded-for"))
        .or_else(|| proxied("x-real-ip"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_limit_inside_window() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        let ip: IpAddr = "127.0.0.1".parse().unwrap();

        for _ in 0..3 {
            assert!(limiter.check(ip).await);
        }
        assert!(!limiter.check(ip).await);
    }

    #[tokio::test]
    async fn test_window_slides() {
        let limiter = RateLimiter::new(2, Duration::from_millis(50));
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        assert!(limiter.check(ip).await);
        assert!(limiter.check(ip).await);
        assert!(!limiter.check(ip).await);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(limiter.check(ip).await);
    }

    #[tokio::test]
    async fn test_addresses_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let ip1: IpAddr = "10.0.0.1".parse().unwrap();
        let ip2: IpAddr = "10.0.0.2".parse().unwrap();

        assert!(limiter.check(ip1).await);
        assert!(!limiter.check(ip1).await);
        assert!(limiter.check(ip2).await);
    }

    #[test]
    fn test_client_ip_socket_beats_proxy_headers() {
        let mut req = Request::builder()
            .header("x-forwarded-for", "1.2.3.4, 10.0.0.1")
            .body(axum::body::Body::empty())
            .unwrap();
        // Only proxy headers: first hop of the forwarded list wins.
        assert_eq!(client_ip(&req), Some("1.2.3.4".parse().unwrap()));

        // With a real socket address, headers are ignored.
        req.extensions_mut().insert(ConnectInfo(std::net::SocketAddr::from((
            [127, 0, 0, 1],
            9000,
        ))));
        assert_eq!(client_ip(&req), Some("127.0.0.1".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_purge_stale() {
        let limiter = RateLimiter::new(5, Duration::from_secs(60));
        let ip: IpAddr = "192.168.1.1".parse().unwrap();
        assert!(limiter.check(ip).await);

        limiter.purge_stale(Duration::ZERO).await;

        let windows = limiter.windows.lock().await;
        assert!(windows.is_empty());
    }
}
