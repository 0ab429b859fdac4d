//! HTTP middleware for rate limiting.
//!
//! Two tower entry points share one decision helper:
//!
//! - [`RateLimitLayer`]: applies a single [`Limiter`] to every non-excluded
//!   request.
//! - [`RateLimitRouterLayer`](router::RateLimitRouterLayer): applies
//!   per-endpoint rules with specificity ordering.
//!
//! Every decision stamps `X-RateLimit-Limit`, `X-RateLimit-Remaining`, and
//! `X-RateLimit-Reset`; denials add `Retry-After`. Faults map as: key too
//! long → 431, store full → 503 (both fail closed), anything else → the
//! request is forwarded (fail open).

pub mod ip;
pub mod path;
pub mod router;

pub use ip::{client_ip_key, trusted_proxy_key};

use crate::limiter::{Limiter, RateLimitResult};
use axum::body::Body;
use axum::extract::ConnectInfo;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, Request, Response, StatusCode};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};
use tower_layer::Layer;
use tower_service::Service;
use tracing::warn;

use self::path::{clean_path, match_pattern};

/// Default maximum length of a rate limit key, in bytes.
const DEFAULT_MAX_KEY_SIZE: usize = 4096;

/// Borrowed view of a request handed to key extraction and limited-response
/// hooks, independent of the request body type.
#[derive(Debug)]
pub struct RequestInfo<'a> {
    /// Request headers.
    pub headers: &'a HeaderMap,
    /// Peer address, when the server recorded one (axum's `ConnectInfo`).
    pub peer_addr: Option<SocketAddr>,
    /// Request method.
    pub method: &'a Method,
    /// Normalized request path.
    pub path: &'a str,
}

impl<'a> RequestInfo<'a> {
    fn new<B>(req: &'a Request<B>, path: &'a str) -> Self {
        Self {
            headers: req.headers(),
            peer_addr: req.extensions().get::<ConnectInfo<SocketAddr>>().map(|info| info.0),
            method: req.method(),
            path,
        }
    }
}

/// Extracts the rate limiting key from a request. Common implementations
/// key by IP, user, or API key.
pub type KeyFunc = Arc<dyn Fn(&RequestInfo<'_>) -> String + Send + Sync>;

/// Builds the response for a rate limited request.
pub type OnLimited = Arc<dyn Fn(&RequestInfo<'_>) -> Response<Body> + Send + Sync>;

/// Middleware behavior configuration.
#[derive(Clone)]
pub struct Options {
    key_func: KeyFunc,
    on_limited: OnLimited,
    exclude_paths: Vec<String>,
    include_methods: Vec<Method>,
    max_key_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}

impl Options {
    /// Defaults: IP-based keys, JSON 429 responses, no exclusions, all
    /// methods, 4096-byte key cap.
    pub fn new() -> Self {
        Self {
            key_func: client_ip_key(),
            on_limited: Arc::new(default_on_limited),
            exclude_paths: Vec::new(),
            include_methods: Vec::new(),
            max_key_size: DEFAULT_MAX_KEY_SIZE,
        }
    }

    /// Use a custom key extraction function.
    pub fn key_func(mut self, key_func: KeyFunc) -> Self {
        self.key_func = key_func;
        self
    }

    /// Use a custom handler for rate limited requests.
    pub fn on_limited(mut self, on_limited: OnLimited) -> Self {
        self.on_limited = on_limited;
        self
    }

    /// Paths that bypass rate limiting. Patterns use the same grammar as
    /// endpoint rules (exact or trailing `*`).
    pub fn exclude_paths<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.exclude_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Limit rate limiting to specific methods. Empty means all methods.
    pub fn include_methods<I>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = Method>,
    {
        self.include_methods = methods.into_iter().collect();
        self
    }

    /// Maximum allowed key length; longer keys are rejected with 431.
    /// Zero resets to the default of 4096.
    pub fn max_key_size(mut self, size: usize) -> Self {
        self.max_key_size = if size == 0 { DEFAULT_MAX_KEY_SIZE } else { size };
        self
    }

    fn is_excluded(&self, clean: &str) -> bool {
        self.exclude_paths.iter().any(|pattern| match_pattern(clean, pattern))
    }

    fn includes_method(&self, method: &Method) -> bool {
        self.include_methods.is_empty() || self.include_methods.contains(method)
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("exclude_paths", &self.exclude_paths)
            .field("include_methods", &self.include_methods)
            .field("max_key_size", &self.max_key_size)
            .finish_non_exhaustive()
    }
}

/// Pre-rendered rate limit header values for one decision.
pub(crate) struct RateLimitHeaders {
    limit: HeaderValue,
    remaining: HeaderValue,
    reset: HeaderValue,
    retry_after: Option<HeaderValue>,
}

impl RateLimitHeaders {
    fn from_result(result: &RateLimitResult) -> Self {
        let reset_epoch = (SystemTime::now() + result.reset_after)
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let retry_after = (!result.allowed && !result.retry_after.is_zero()).then(|| {
            // Whole seconds, rounded up, at least one.
            HeaderValue::from(result.retry_after.as_secs_f64().ceil().max(1.0) as u64)
        });
        Self {
            limit: HeaderValue::from(result.limit),
            remaining: HeaderValue::from(result.remaining),
            reset: HeaderValue::from(reset_epoch),
            retry_after,
        }
    }

    pub(crate) fn apply(&self, headers: &mut HeaderMap) {
        headers.insert(HeaderName::from_static("x-ratelimit-limit"), self.limit.clone());
        headers.insert(HeaderName::from_static("x-ratelimit-remaining"), self.remaining.clone());
        headers.insert(HeaderName::from_static("x-ratelimit-reset"), self.reset.clone());
        if let Some(retry) = &self.retry_after {
            if !headers.contains_key(header::RETRY_AFTER) {
                headers.insert(header::RETRY_AFTER, retry.clone());
            }
        }
    }
}

/// Fixed security header block attached to limited and fail-closed
/// responses.
fn security_headers(headers: &mut HeaderMap) {
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    );
    headers.insert(header::REFERRER_POLICY, HeaderValue::from_static("no-referrer"));
    headers.insert(
        HeaderName::from_static("permissions-policy"),
        HeaderValue::from_static("interest-cohort=()"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
}

/// Default 429 handler: a JSON body plus the security header block.
pub fn default_on_limited(_info: &RequestInfo<'_>) -> Response<Body> {
    let body = serde_json::json!({
        "error": "rate limit exceeded",
        "message": "too many requests, please try again later",
    })
    .to_string();
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    security_headers(headers);
    response
}

/// Plain-text fail-closed response with the security header block.
fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    let mut response = Response::new(Body::from(format!("{}\n", message)));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    security_headers(headers);
    headers.insert(header::RETRY_AFTER, HeaderValue::from_static("60"));
    response
}

/// Outcome of a rate limit check for one request.
pub(crate) enum Verdict {
    /// Forward to the inner service and stamp rate limit headers on its
    /// response.
    Forward(RateLimitHeaders),
    /// Forward without headers: the limiter's dependency failed and the
    /// request is allowed through.
    ForwardUnlimited,
    /// Answer immediately without reaching the inner service.
    Respond(Response<Body>),
}

/// The single allow/deny/error mapping used by every entry point.
///
/// Input and capacity faults fail closed (431, 503): when the limit cannot
/// be proven the request is refused, otherwise a full store would turn the
/// limiter off. Any other limiter error fails open so a broken dependency
/// does not take the service down with it.
pub(crate) fn check_limit(
    limiter: &dyn Limiter,
    key: &str,
    options: &Options,
    info: &RequestInfo<'_>,
) -> Verdict {
    // Oversized keys never reach the limiter or the store.
    if key.len() > options.max_key_size {
        return Verdict::Respond(error_response(
            StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            "rate limit key too long",
        ));
    }

    match limiter.allow_n_with_details(key, 1) {
        Ok(result) => {
            let headers = RateLimitHeaders::from_result(&result);
            if result.allowed {
                Verdict::Forward(headers)
            } else {
                let mut response = (options.on_limited)(info);
                headers.apply(response.headers_mut());
                if !response.headers().contains_key(header::RETRY_AFTER) {
                    response
                        .headers_mut()
                        .insert(header::RETRY_AFTER, HeaderValue::from_static("60"));
                }
                Verdict::Respond(response)
            }
        }
        Err(err) if err.is_key_too_long() => Verdict::Respond(error_response(
            StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            "rate limit key too long",
        )),
        Err(err) if err.is_store_full() => Verdict::Respond(error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "rate limit store full",
        )),
        Err(err) => {
            warn!(error = %err, "rate limit check failed, allowing request");
            Verdict::ForwardUnlimited
        }
    }
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Tower layer applying a single rate limiter to every request.
pub struct RateLimitLayer<L> {
    limiter: Arc<L>,
    options: Arc<Options>,
}

impl<L> RateLimitLayer<L> {
    /// Wrap a limiter with default options.
    pub fn new(limiter: L) -> Self {
        Self::with_options(limiter, Options::new())
    }

    /// Wrap a limiter with custom options.
    pub fn with_options(limiter: L, options: Options) -> Self {
        Self { limiter: Arc::new(limiter), options: Arc::new(options) }
    }
}

impl<L> Clone for RateLimitLayer<L> {
    fn clone(&self) -> Self {
        Self { limiter: Arc::clone(&self.limiter), options: Arc::clone(&self.options) }
    }
}

impl<L> fmt::Debug for RateLimitLayer<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitLayer").finish_non_exhaustive()
    }
}

impl<S, L> Layer<S> for RateLimitLayer<L> {
    type Service = RateLimitService<S, L>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: Arc::clone(&self.limiter),
            options: Arc::clone(&self.options),
        }
    }
}

/// Middleware service enforcing a rate limit before the inner service runs.
pub struct RateLimitService<S, L> {
    inner: S,
    limiter: Arc<L>,
    options: Arc<Options>,
}

impl<S: Clone, L> Clone for RateLimitService<S, L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: Arc::clone(&self.limiter),
            options: Arc::clone(&self.options),
        }
    }
}

impl<S, L> fmt::Debug for RateLimitService<S, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitService").finish_non_exhaustive()
    }
}

impl<S, L, B> Service<Request<B>> for RateLimitService<S, L>
where
    S: Service<Request<B>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    L: Limiter + 'static,
    B: Send + 'static,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = BoxFuture<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        // Take the service that was driven to readiness; leave the clone.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let limiter = Arc::clone(&self.limiter);
        let options = Arc::clone(&self.options);

        Box::pin(async move {
            let verdict = {
                let clean = clean_path(req.uri().path());
                let info = RequestInfo::new(&req, &clean);

                if options.is_excluded(&clean) || !options.includes_method(info.method) {
                    None
                } else {
                    let key = (options.key_func)(&info);
                    Some(check_limit(limiter.as_ref(), &key, &options, &info))
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
