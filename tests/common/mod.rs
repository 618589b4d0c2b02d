#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{body::to_bytes, Router};
use http::{Request, StatusCode};
use serde_json::Value;
use tower::util::ServiceExt;

use cms_proxy::{AppConfig, ProxyError, Upstream};

/// Upstream double that answers every fetch with the same outcome and counts calls.
pub struct FakeUpstream {
    outcome: Result<Value, ProxyError>,
    delay: Duration,
    calls: AtomicUsize,
    last_query: std::sync::Mutex<Option<(String, Vec<(String, String)>)>>,
}

impl FakeUpstream {
    pub fn ok(body: Value) -> Arc<Self> {
        Self::with(Ok(body), Duration::ZERO)
    }

    pub fn failing(err: ProxyError) -> Arc<Self> {
        Self::with(Err(err), Duration::ZERO)
    }

    pub fn with(outcome: Result<Value, ProxyError>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            outcome,
            delay,
            calls: AtomicUsize::new(0),
            last_query: std::sync::Mutex::new(None),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<(String, Vec<(String, String)>)> {
        self.last_query.lock().unwrap().clone()
    }
}

#[async_trait]
impl Upstream for FakeUpstream {
    async fn fetch(&self, resource_path: &str, query: &[(String, String)]) -> Result<Value, ProxyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_query.lock().unwrap() = Some((resource_path.to_string(), query.to_vec()));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.outcome.clone()
    }

    async fn ping(&self) -> Result<(), ProxyError> {
        self.outcome.clone().map(|_| ())
    }
}

pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.assets.public_host = Some("assets.example.com".into());
    config.rate_limit.enabled = false;
    config
}

pub async fn send(app: &Router, req: Request<axum::body::Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

pub async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
    let req = Request::builder()
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap();
    send(app, req).await
}
