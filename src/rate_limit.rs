use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header::RETRY_AFTER, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::warn;

use crate::error::ErrorBody;

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Reject { retry_after: Duration },
}

/// Fixed-window request budget per client IP.
///
/// Elapsed windows are dropped from `check` at most once per window length,
/// so memory stays bounded by the clients seen in the last two windows even
/// without a background sweep.
#[derive(Debug)]
pub struct RateLimiter {
    windows: DashMap<IpAddr, Window>,
    max_requests: u32,
    window: Duration,
    last_purge: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            max_requests,
            window,
            last_purge: Mutex::new(Instant::now()),
        }
    }

    pub fn check(&self, ip: IpAddr) -> Decision {
        let now = Instant::now();
        // Runs before the entry guard below is taken; retain locks every shard.
        self.purge_if_due(now);

        let mut slot = self.windows.entry(ip).or_insert(Window {
            started: now,
            count: 0,
        });

        let elapsed = now.saturating_duration_since(slot.started);
        if elapsed >= self.window {
            *slot = Window {
                started: now,
                count: 0,
            };
        }

        if slot.count >= self.max_requests {
            let retry_after = self.window.saturating_sub(now.saturating_duration_since(slot.started));
            return Decision::Reject { retry_after };
        }

        slot.count += 1;
        Decision::Allow
    }

    fn purge_if_due(&self, now: Instant) {
        let due = {
            let mut last = self.last_purge.lock().unwrap_or_else(PoisonError::into_inner);
            if now.saturating_duration_since(*last) >= self.window {
                *last = now;
                true
            } else {
                false
            }
        };
        if due {
            self.purge_stale_at(now);
        }
    }

    /// Drop windows that have fully elapsed.
    pub fn purge_stale(&self) -> usize {
        self.purge_stale_at(Instant::now())
    }

    fn purge_stale_at(&self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.started) < self.window);
        before.saturating_sub(self.windows.len())
    }

    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }
}

/// Peers without connection info share the unspecified address bucket.
fn client_ip(req: &Request) -> IpAddr {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

pub async fn enforce(
    State(limiter): State<Arc<RateLimiter>>,
    req: Request,
    next: Next,
) -> Response {
    let ip = client_ip(&req);

    match limiter.check(ip) {
        Decision::Allow => next.run(req).await,
        Decision::Reject { retry_after } => {
            warn!(%ip, path = %req.uri().path(), "rate limit exceeded");

            let secs = retry_after.as_secs().max(1);
            let mut resp = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(ErrorBody::new(
                    "Too Many Requests",
                    "Too many requests from this IP, please try again later",
                )),
            )
                .into_response();
            resp.headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(secs));
            resp
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_after_budget_is_spent() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));

        assert_eq!(limiter.check(ip(1)), Decision::Allow);
        assert_eq!(limiter.check(ip(1)), Decision::Allow);
        assert_eq!(
            limiter.check(ip(1)),
            Decision::Reject {
                retry_after: Duration::from_secs(60)
            }
        );
        // other clients are independent
        assert_eq!(limiter.check(ip(2)), Decision::Allow);
    }

    #[tokio::test(start_paused = true)]
    async fn window_resets_after_it_elapses() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert_eq!(limiter.check(ip(1)), Decision::Allow);

        tokio::time::advance(Duration::from_secs(45)).await;
        assert_eq!(
            limiter.check(ip(1)),
            Decision::Reject {
                retry_after: Duration::from_secs(15)
            }
        );

        tokio::time::advance(Duration::from_secs(15)).await;
        assert_eq!(limiter.check(ip(1)), Decision::Allow);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_drops_elapsed_windows() {
        let limiter = RateLimiter::new(5, Duration::from_secs(10));
        limiter.check(ip(1));
        tokio::time::advance(Duration::from_secs(6)).await;
        limiter.check(ip(2));
        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(limiter.purge_stale(), 1);
        assert_eq!(limiter.tracked_clients(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn check_evicts_elapsed_windows_without_a_sweep() {
        let limiter = RateLimiter::new(10, Duration::from_secs(1));
        for i in 0..2000u32 {
            let [_, _, hi, lo] = i.to_be_bytes();
            limiter.check(IpAddr::V4(Ipv4Addr::new(10, 1, hi, lo)));
        }
        assert_eq!(limiter.tracked_clients(), 2000);

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(limiter.check(ip(1)), Decision::Allow);
        assert_eq!(limiter.tracked_clients(), 1);
    }
}
