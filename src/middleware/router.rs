//! Per-endpoint rate limiting.
//!
//! Rules are compiled and sorted by specificity once at construction, so a
//! broad `/*` rule can never shadow a stricter `/critical` rule regardless
//! of declaration order. Each rule gets its own limiter; limiters of the
//! same algorithm share one store.

use super::path::clean_path;
use super::{check_limit, path::match_pattern, Options, RequestInfo, Verdict};
use crate::config::Config;
use crate::error::Error;
use crate::limiter::Limiter;
use crate::sliding_window::{SlidingWindow, SlidingWindowState};
use crate::store::{MemoryStore, MemoryStoreConfig};
use crate::token_bucket::{TokenBucket, TokenBucketState};
use axum::body::Body;
use http::{Method, Request, Response};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Rate limiting algorithm for an endpoint rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    /// Steady refill with controlled bursting.
    #[default]
    TokenBucket,
    /// Weighted two-window count; stricter, no bursting.
    SlidingWindow,
}

/// Rate limit configuration for one endpoint pattern.
#[derive(Debug, Clone)]
pub struct EndpointRule {
    /// URL path to match: exact, or a prefix ending with `*`.
    pub path: String,
    /// HTTP methods to match. Empty means all methods.
    pub methods: Vec<Method>,
    /// Limit configuration for this endpoint.
    pub config: Config,
    /// Algorithm to use.
    pub algorithm: Algorithm,
}

impl EndpointRule {
    /// Rule matching `path` for all methods with the token bucket
    /// algorithm.
    pub fn new(path: impl Into<String>, config: Config) -> Self {
        Self {
            path: path.into(),
            methods: Vec::new(),
            config,
            algorithm: Algorithm::TokenBucket,
        }
    }

    /// Restrict the rule to specific methods.
    pub fn methods<I>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = Method>,
    {
        self.methods = methods.into_iter().collect();
        self
    }

    /// Select the algorithm.
    pub fn algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    fn is_prefix(&self) -> bool {
        self.path.ends_with('*')
    }
}

/// Sort so that iteration order is specificity order: exact before prefix,
/// longer before shorter, with-methods before without. Stable within ties.
fn sort_by_specificity(rules: &mut [EndpointRule]) {
    rules.sort_by(|a, b| {
        a.is_prefix()
            .cmp(&b.is_prefix())
            .then_with(|| b.path.len().cmp(&a.path.len()))
            .then_with(|| a.methods.is_empty().cmp(&b.methods.is_empty()))
    });
}

struct Endpoint {
    path: String,
    methods: Vec<Method>,
    limiter: Box<dyn Limiter>,
}

impl Endpoint {
    fn matches(&self, clean: &str, method: &Method) -> bool {
        match_pattern(clean, &self.path)
            && (self.methods.is_empty() || self.methods.contains(method))
    }
}

struct RouterShared {
    endpoints: Vec<Endpoint>,
    options: Options,
    token_store: Option<Arc<MemoryStore<TokenBucketState>>>,
    window_store: Option<Arc<MemoryStore<SlidingWindowState>>>,
}

/// Tower layer applying per-endpoint rate limits.
///
/// Requests matching no rule are forwarded untouched.
pub struct RateLimitRouterLayer {
    shared: Arc<RouterShared>,
}

impl RateLimitRouterLayer {
    /// Compile endpoint rules with a default in-memory store.
    pub fn new(endpoints: Vec<EndpointRule>, options: Options) -> Result<Self, Error> {
        Self::with_store_config(endpoints, MemoryStoreConfig::default(), options)
    }

    /// Compile endpoint rules with custom store sizing.
    pub fn with_store_config(
        mut endpoints: Vec<EndpointRule>,
        store_config: MemoryStoreConfig,
        options: Options,
    ) -> Result<Self, Error> {
        sort_by_specificity(&mut endpoints);

        let mut token_store: Option<Arc<MemoryStore<TokenBucketState>>> = None;
        let mut window_store: Option<Arc<MemoryStore<SlidingWindowState>>> = None;
        let mut compiled = Vec::with_capacity(endpoints.len());
        for rule in endpoints {
            let limiter: Box<dyn Limiter> = match rule.algorithm {
                Algorithm::TokenBucket => {
                    let store = Arc::clone(token_store.get_or_insert_with(|| {
                        Arc::new(MemoryStore::with_config(store_config))
                    }));
                    Box::new(TokenBucket::new(rule.config, store)?)
                }
                Algorithm::SlidingWindow => {
                    let store = Arc::clone(window_store.get_or_insert_with(|| {
                        Arc::new(MemoryStore::with_config(store_config))
                    }));
                    Box::new(SlidingWindow::new(rule.config, store)?)
                }
            };
            compiled.push(Endpoint { path: rule.path, methods: rule.methods, limiter });
        }

        Ok(Self {
            shared: Arc::new(RouterShared {
                endpoints: compiled,
                options,
                token_store,
                window_store,
            }),
        })
    }

    /// Stop the background cleanup of the router's stores. Idempotent.
    pub async fn close(&self) {
        if let Some(store) = &self.shared.token_store {
            store.close().await;
        }
        if let Some(store) = &self.shared.window_store {
            store.close().await;
        }
    }
}

impl Clone for RateLimitRouterLayer {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl fmt::Debug for RateLimitRouterLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitRouterLayer")
            .field("endpoints", &self.shared.endpoints.len())
            .finish_non_exhaustive()
    }
}

impl<S> Layer<S> for RateLimitRouterLayer {
    type Service = RateLimitRouter<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitRouter { inner, shared: Arc::clone(&self.shared) }
    }
}

/// Middleware service matching requests to endpoint rules and enforcing
/// the matched rule's limit.
pub struct RateLimitRouter<S> {
    inner: S,
    shared: Arc<RouterShared>,
}

impl<S: Clone> Clone for RateLimitRouter<S> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), shared: Arc::clone(&self.shared) }
    }
}

impl<S> fmt::Debug for RateLimitRouter<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitRouter")
            .field("endpoints", &self.shared.endpoints.len())
            .finish_non_exhaustive()
    }
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

impl<S, B> Service<Request<B>> for RateLimitRouter<S>
where
    S: Service<Request<B>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = BoxFuture<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let shared = Arc::clone(&self.shared);

        Box::pin(async move {
            let verdict = {
                let clean = clean_path(req.uri().path());
                let info = RequestInfo::new(&req, &clean);

                // First match wins; the sort above makes it the most
                // specific one.
                match shared.endpoints.iter().find(|ep| ep.matches(&clean, info.method)) {
                    Some(endpoint) => {
                        // The rule pattern suffix keeps per-rule state apart
                        // for the same client.
                        let mut key = (shared.options.key_func)(&info);
                        key.push(':');
                        key.push_str(&endpoint.path);
                        Some(check_limit(
                            endpoint.limiter.as_ref(),
                            &key,
                            &shared.options,
                            &info,
                        ))
                    }
                    None => None,
                }
            };

            match verdict {
                None | Some(Verdict::ForwardUnlimited) => inner.call(req).await,
                Some(Verdict::Forward(headers)) => {
                    let mut response = inner.call(req).await?;
                    headers.apply(response.headers_mut());
                    Ok(response)
                }
                Some(Verdict::Respond(response)) => Ok(response),
            }
        })
    }
}
