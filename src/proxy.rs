use std::{sync::Arc, time::Duration};

use anyhow::Result;
use axum::{
    extract::{rejection::PathRejection, Path, RawQuery, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, MethodRouter},
    Json, Router,
};
use dashmap::{mapref::entry::Entry, DashMap};
use serde_json::{json, Value};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    cache_key::{derive_key, parse_query},
    error::{ErrorBody, ProxyError},
    parse_ttl,
    rate_limit::{self, RateLimiter},
    rewrite::AssetRewriter,
    store::CacheStore,
    upstream::{ContentfulClient, Upstream},
    validate_config, AppConfig,
};

pub const ADMIN_KEY_HEADER: &str = "x-admin-key";
const MAX_ID_LENGTH: usize = 64;

type FetchOutcome = Result<Arc<Value>, ProxyError>;
type Inflight = DashMap<String, watch::Receiver<Option<FetchOutcome>>>;

// Proxy Server State
pub struct ProxyServer {
    upstream: Option<Arc<dyn Upstream>>,
    cache: CacheStore,
    rewriter: AssetRewriter,
    admin_key: Option<String>,
    limiter: Option<Arc<RateLimiter>>,
    inflight: Inflight,
}

/// Removes the in-flight slot when the leading request finishes or is dropped.
struct InflightGuard<'a> {
    inflight: &'a Inflight,
    key: &'a str,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.inflight.remove(self.key);
    }
}

impl ProxyServer {
    pub fn new(config: &AppConfig) -> Result<Arc<Self>> {
        validate_config(config)?;

        let upstream: Option<Arc<dyn Upstream>> = match config.upstream.credential() {
            Some(credential) => {
                let timeout = parse_ttl(&config.upstream.timeout)?;
                let client = ContentfulClient::new(&config.upstream.base_url, &credential, timeout)?;
                Some(Arc::new(client))
            }
            None => {
                warn!("upstream credentials missing; content routes will answer 500 until configured");
                None
            }
        };

        Self::build(config, upstream)
    }

    /// Build the server around an already constructed upstream.
    /// `None` runs the proxy unconfigured.
    pub fn with_upstream(
        config: &AppConfig,
        upstream: Option<Arc<dyn Upstream>>,
    ) -> Result<Arc<Self>> {
        validate_config(config)?;
        Self::build(config, upstream)
    }

    /// `config` must already be validated.
    fn build(config: &AppConfig, upstream: Option<Arc<dyn Upstream>>) -> Result<Arc<Self>> {
        let ttl = parse_ttl(&config.cache.ttl)?;
        let limiter = if config.rate_limit.enabled {
            let window = parse_ttl(&config.rate_limit.window)?;
            Some(Arc::new(RateLimiter::new(config.rate_limit.requests, window)))
        } else {
            None
        };

        let admin_key = config.server.admin_key.clone().filter(|k| !k.is_empty());
        if admin_key.is_none() {
            warn!("server.admin_key not set; cache admin routes are unauthenticated");
        }

        Ok(Arc::new(Self {
            upstream,
            cache: CacheStore::new(ttl),
            rewriter: AssetRewriter::new(
                config.assets.upstream_host.clone(),
                config.assets.public_host.clone(),
            ),
            admin_key,
            limiter,
            inflight: DashMap::new(),
        }))
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn limiter(&self) -> Option<Arc<RateLimiter>> {
        self.limiter.clone()
    }

    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    /// Answer one content request: cache first, upstream on a miss.
    pub async fn serve(&self, resource_path: &str, raw_query: Option<&str>) -> FetchOutcome {
        let upstream = self.upstream.as_deref().ok_or(ProxyError::Configuration)?;

        let query = parse_query(raw_query);
        let key = derive_key(resource_path, &query);

        // Values are rewritten before they are stored, so a hit is served as is.
        if let Some(value) = self.cache.get(&key) {
            debug!(%key, "cache hit");
            return Ok(value);
        }
        debug!(%key, "cache miss");

        self.fetch_single_flight(upstream, resource_path, &query, &key)
            .await
    }

    async fn fetch_single_flight(
        &self,
        upstream: &dyn Upstream,
        resource_path: &str,
        query: &[(String, String)],
        key: &str,
    ) -> FetchOutcome {
        let (mut rx, tx) = match self.inflight.entry(key.to_string()) {
            Entry::Occupied(e) => (e.get().clone(), None),
            Entry::Vacant(e) => {
                let (tx, rx) = watch::channel(None);
                e.insert(rx.clone());
                (rx, Some(tx))
            }
        };

        // Leader path
        if let Some(tx) = tx {
            let _guard = InflightGuard {
                inflight: &self.inflight,
                key,
            };
            let outcome = self.fetch_and_cache(upstream, resource_path, query, key).await;
            let _ = tx.send(Some(outcome.clone()));
            return outcome;
        }

        // Follower path
        let published = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => None,
        };
        match published {
            Some(outcome) => outcome,
            None => {
                // Leader was dropped before publishing.
                debug!(%key, "in-flight fetch abandoned, fetching directly");
                self.fetch_and_cache(upstream, resource_path, query, key).await
            }
        }
    }

    async fn fetch_and_cache(
        &self,
        upstream: &dyn Upstream,
        resource_path: &str,
        query: &[(String, String)],
        key: &str,
    ) -> FetchOutcome {
        let raw = upstream.fetch(resource_path, query).await?;
        let value = Arc::new(self.rewriter.rewrite(&raw));
        self.cache.set(key, value.clone());
        Ok(value)
    }

    /// Periodically drop expired cache entries and stale rate-limit windows.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let purged = server.cache.purge_expired();
                if let Some(limiter) = &server.limiter {
                    limiter.purge_stale();
                }
                if purged > 0 {
                    debug!(purged, "swept expired cache entries");
                }
            }
        })
    }

    fn admin_authorized(&self, headers: &HeaderMap) -> bool {
        match &self.admin_key {
            None => true,
            Some(expected) => headers
                .get(ADMIN_KEY_HEADER)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|given| given == expected),
        }
    }
}

fn validate_id(id: &str) -> Result<(), ProxyError> {
    let well_formed = !id.is_empty()
        && id.len() <= MAX_ID_LENGTH
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if well_formed {
        Ok(())
    } else {
        Err(ProxyError::BadRequest(format!("Invalid resource id: {id:?}")))
    }
}

async fn respond(server: &ProxyServer, resource_path: &str, query: Option<&str>) -> Response {
    match server.serve(resource_path, query).await {
        Ok(value) => Json(value).into_response(),
        Err(err) => {
            match &err {
                ProxyError::Upstream { .. } | ProxyError::BadRequest(_) => {
                    warn!(resource = %resource_path, error = %err, "request rejected")
                }
                ProxyError::Configuration | ProxyError::Connection(_) => {
                    error!(resource = %resource_path, error = %err, "request failed")
                }
            }
            err.into_response()
        }
    }
}

/// `GET /{collection}`
fn collection_route(collection: &'static str) -> MethodRouter<Arc<ProxyServer>> {
    get(
        move |State(server): State<Arc<ProxyServer>>, RawQuery(query): RawQuery| async move {
            respond(&server, collection, query.as_deref()).await
        },
    )
}

/// `GET /{collection}/{id}`
fn item_route(collection: &'static str) -> MethodRouter<Arc<ProxyServer>> {
    get(
        move |State(server): State<Arc<ProxyServer>>,
              id: Result<Path<String>, PathRejection>,
              RawQuery(query): RawQuery| async move {
            let id = match id {
                Ok(Path(id)) => validate_id(&id).map(|_| id),
                Err(rejection) => Err(ProxyError::BadRequest(format!(
                    "Invalid resource id: {}",
                    rejection.body_text()
                ))),
            };
            match id {
                Ok(id) => respond(&server, &format!("{collection}/{id}"), query.as_deref()).await,
                Err(err) => {
                    warn!(collection, error = %err, "request rejected");
                    err.into_response()
                }
            }
        },
    )
}

async fn require_admin_key(
    State(server): State<Arc<ProxyServer>>,
    req: Request,
    next: Next,
) -> Response {
    if server.admin_authorized(req.headers()) {
        return next.run(req).await;
    }
    warn!(path = %req.uri().path(), "rejected admin request without a valid key");
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorBody::new("Unauthorized", "A valid admin key is required")),
    )
        .into_response()
}

async fn clear_cache(State(server): State<Arc<ProxyServer>>) -> impl IntoResponse {
    server.cache.flush_all();
    info!("cache cleared");
    Json(json!({ "message": "Cache cleared successfully" }))
}

async fn cache_stats(State(server): State<Arc<ProxyServer>>) -> impl IntoResponse {
    Json(server.cache.stats())
}

async fn health(State(server): State<Arc<ProxyServer>>) -> Response {
    let Some(upstream) = server.upstream.as_deref() else {
        return ProxyError::Configuration.into_response();
    };

    match upstream.ping().await {
        Ok(()) => Json(json!({ "status": "ok", "upstream": "reachable" })).into_response(),
        Err(err) => {
            warn!(error = %err, "upstream health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "degraded", "upstream": "unreachable" })),
            )
                .into_response()
        }
    }
}

/// All routes of the proxy, without transport layers.
pub fn app(server: Arc<ProxyServer>) -> Router {
    let mut content = Router::new()
        .route("/entries", collection_route("entries"))
        .route("/entries/{id}", item_route("entries"))
        .route("/assets", collection_route("assets"))
        .route("/assets/{id}", item_route("assets"))
        .route("/content_types", collection_route("content_types"));

    if let Some(limiter) = server.limiter() {
        content = content.route_layer(middleware::from_fn_with_state(limiter, rate_limit::enforce));
    }

    let admin = Router::new()
        .route("/cache", delete(clear_cache))
        .route("/cache/stats", get(cache_stats))
        .route_layer(middleware::from_fn_with_state(
            server.clone(),
            require_admin_key,
        ));

    Router::new()
        .merge(content)
        .merge(admin)
        .route("/health", get(health))
        .with_state(server)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_restricted_to_a_safe_alphabet() {
        assert!(validate_id("5KsDBWseXY6QegucYAoacS").is_ok());
        assert!(validate_id("my-entry_1.v2").is_ok());
        assert!(validate_id("").is_err());
        assert!(validate_id("..").is_err());
        assert!(validate_id("a/b").is_err());
        assert!(validate_id("a?b").is_err());
        assert!(validate_id(&"x".repeat(65)).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_purges_expired_entries() {
        let mut config = AppConfig::default();
        config.cache.ttl = "10s".into();
        let server = ProxyServer::with_upstream(&config, None).unwrap();
        server.cache().set("k", Arc::new(json!(1)));

        let sweeper = server.spawn_sweeper(Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(server.cache().stats().keys, 0);
        sweeper.abort();
    }

    #[test]
    fn admin_key_is_optional() {
        let open = ProxyServer::with_upstream(&AppConfig::default(), None).unwrap();
        assert!(open.admin_authorized(&HeaderMap::new()));

        let mut config = AppConfig::default();
        config.server.admin_key = Some("s3cret".into());
        let gated = ProxyServer::with_upstream(&config, None).unwrap();

        let mut headers = HeaderMap::new();
        assert!(!gated.admin_authorized(&headers));
        headers.insert(ADMIN_KEY_HEADER, "wrong".parse().unwrap());
        assert!(!gated.admin_authorized(&headers));
        headers.insert(ADMIN_KEY_HEADER, "s3cret".parse().unwrap());
        assert!(gated.admin_authorized(&headers));
    }
}
