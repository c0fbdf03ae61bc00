//! Reverse proxy with pooled upstream sessions.
//!
//! # Data flow
//! ```text
//! request on a proxied path (route group `proxy`)
//!     → ProxyMiddleware (pre, before body ingestion)
//!     → (host without port, routepath) → candidate backends
//!         none: `full` → 502, otherwise fall through to the route
//!     → balancer + round-robin + failover, retried until connect_timeout
//!         none alive → 503
//!     → rewrite hook (new path, or 302 redirect)
//!     → pool.get_session()     exhausted → 429 "busy, retry later"
//!     → relay: downstream body ⇄ upstream stream
//!         upstream error or timeout → 503
//! ```
//!
//! # Usage
//! ```rust,no_run
//! use strata::App;
//! use strata::proxy::{BackendConfig, Proxy, ProxyConfig};
//!
//! # async fn run() -> Result<(), strata::Error> {
//! let mut config = ProxyConfig::new();
//! config
//!     .backend("api.test", BackendConfig::new("/", "http://10.0.0.7:8080").weight(3))
//!     .backend("api.test", BackendConfig::new("/", "http://10.0.0.8:8080"));
//!
//! let mut app = App::new();
//! let proxy = Proxy::new(config)?.init(&mut app)?;
//! # let _ = proxy;
//! app.listen("0.0.0.0:8080").await
//! # }
//! ```

mod backend;
mod backoff;
mod balancer;
mod config;
mod pool;
mod relay;
mod tls;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Response, StatusCode};
use http_body_util::BodyExt;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::app::App;
use crate::context::Context;
use crate::error::{Error, ProxyError};
use crate::handler::{BoxFuture, BoxedHandler, Noop};
use crate::method::Method;
use crate::middleware::{MidOptions, Middleware, Next};
use crate::response::full;
use crate::router::RouteOptions;

pub use backend::Backend;
pub use balancer::{Balancer, ConsistentBalancer, RoundRobin};
pub use config::{BackendConfig, ProxyConfig, Rewrite, RewriteFn, UpstreamProtocol, fmt_path};
pub use pool::{Lease, Pool, PoolOptions, PoolStatus, SessionStatus};
pub use relay::{Outcome, RelayBody, Settle};

/// Selection rounds before giving up with 503.
const PICK_ATTEMPTS: u32 = 200;
/// `get_session` retries while the pool refuses new sessions.
const SESSION_ATTEMPTS: u32 = 50;
const BUSY: &str = "busy, retry later";
const X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");

/// Candidates for one `(host, routepath)` pair.
struct Upstream {
    backends: Vec<Arc<Backend>>,
    cursor: RoundRobin,
}

impl Upstream {
    /// The first alive backend, starting from the balancer's (or the
    /// cursor's) choice. Every dead one passed over gets a reconnect
    /// scheduled.
    fn select(&self, ctx: &Context, balancer: Option<&dyn Balancer>) -> Option<Arc<Backend>> {
        let len = self.backends.len();
        let start = balancer
            .and_then(|b| b.select(ctx, &self.backends))
            .filter(|&i| i < len)
            .unwrap_or_else(|| self.cursor.next());
        balancer::failover(
            start,
            len,
            |i| self.backends[i].is_alive(),
            |i| {
                self.backends[i].pool().delay_connect();
            },
        )
        .map(|i| Arc::clone(&self.backends[i]))
    }
}

/// Health of one backend, as reported by [`Proxy::status`].
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub host: String,
    pub path: String,
    pub url: String,
    pub alive: bool,
    pub pool: PoolStatus,
}

/// The proxy: backends by host and route path, and the settings the
/// middleware runs with.
pub struct Proxy {
    hosts: HashMap<String, HashMap<String, Upstream>>,
    paths: BTreeSet<String>,
    full: bool,
    add_ip: bool,
    error_502: String,
    error_503: String,
    connect_timeout: Duration,
    group: String,
    balancer: Option<Arc<dyn Balancer>>,
}

impl Proxy {
    /// Validates `config` and builds one pool per backend. Nothing connects
    /// until [`init`](Self::init).
    pub fn new(config: ProxyConfig) -> Result<Self, Error> {
        config.validate()?;

        // `API.test:8080` and `api.test` share one entry.
        let mut grouped: HashMap<String, HashMap<String, Vec<Arc<Backend>>>> = HashMap::new();
        let mut paths = BTreeSet::new();
        for (host, entries) in &config.hosts {
            let host = strip_port(host).to_ascii_lowercase();
            for entry in entries {
                let path = fmt_path(&entry.path);
                let rewrite = config.rewrite_for(&host, &path);
                let backend = Backend::from_config(entry, &config, rewrite)?;
                grouped
                    .entry(host.clone())
                    .or_default()
                    .entry(path.clone())
                    .or_default()
                    .push(Arc::new(backend));
                paths.insert(path);
            }
        }

        let hosts = grouped
            .into_iter()
            .map(|(host, by_path)| {
                let upstreams = by_path
                    .into_iter()
                    .map(|(path, backends)| {
                        let weights = backends.iter().map(|b| b.weight).collect();
                        (path, Upstream { backends, cursor: RoundRobin::new(weights) })
                    })
                    .collect();
                (host, upstreams)
            })
            .collect();

        Ok(Self {
            hosts,
            paths,
            full: config.full,
            add_ip: config.add_ip,
            error_502: config.error_502.clone(),
            error_503: config.error_503.clone(),
            connect_timeout: config.connect_timeout(),
            group: config.group.clone(),
            balancer: None,
        })
    }

    /// Replaces weighted round-robin as the first choice.
    pub fn with_balancer(mut self, balancer: impl Balancer) -> Self {
        self.balancer = Some(Arc::new(balancer));
        self
    }

    /// Registers every proxied path for all methods under the proxy group,
    /// attaches the proxy middleware to that group ahead of body ingestion,
    /// and starts warming the pools when called inside a tokio runtime.
    pub fn init(self, app: &mut App) -> Result<Arc<Self>, Error> {
        let proxy = Arc::new(self);
        let terminal: BoxedHandler = Arc::new(Noop);
        let opts = RouteOptions::group(proxy.group.clone());
        for path in &proxy.paths {
            app.add_route(&Method::ALL, path, Arc::clone(&terminal), opts.clone())?;
        }
        app.pre(ProxyMiddleware(Arc::clone(&proxy)), MidOptions::new().group(proxy.group.clone()));

        for backend in proxy.backends() {
            backend.pool().warm_up();
        }
        info!(hosts = proxy.hosts.len(), paths = proxy.paths.len(), "proxy routes registered");
        Ok(proxy)
    }

    /// Route patterns the proxy serves.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(String::as_str)
    }

    pub fn backends(&self) -> impl Iterator<Item = &Arc<Backend>> {
        self.hosts.values().flat_map(|paths| paths.values()).flat_map(|u| u.backends.iter())
    }

    pub fn status(&self) -> Vec<BackendStatus> {
        let mut out = Vec::new();
        for (host, paths) in &self.hosts {
            for (path, upstream) in paths {
                for backend in &upstream.backends {
                    out.push(BackendStatus {
                        host: host.clone(),
                        path: path.clone(),
                        url: backend.url.clone(),
                        alive: backend.is_alive(),
                        pool: backend.status(),
                    });
                }
            }
        }
        out.sort_by(|a, b| (&a.host, &a.path, &a.url).cmp(&(&b.host, &b.path, &b.url)));
        out
    }

    /// Closes every upstream session; pools stop reconnecting.
    pub fn close_all(&self) {
        for backend in self.backends() {
            backend.pool().close_all();
        }
    }

    async fn handle<'a>(&'a self, ctx: &'a mut Context, next: Next<'a>) -> Result<(), Error> {
        let host = strip_port(&ctx.host).to_ascii_lowercase();
        let Some(upstream) = self.hosts.get(&host).and_then(|paths| paths.get(&ctx.routepath)) else {
            if self.full {
                debug!(%host, path = %ctx.path, "no backend for host");
                ctx.set_status(StatusCode::BAD_GATEWAY).html(self.error_502.clone());
                return Ok(());
            }
            return next.run(ctx).await;
        };

        let Some(backend) = self.pick(ctx, upstream).await else {
            warn!(%host, path = %ctx.path, "no alive backend");
            self.unavailable(ctx);
            return Ok(());
        };
        self.forward(ctx, &backend, &host).await
    }

    /// Retries selection with short, growing pauses until `connect_timeout`
    /// runs out; pools of dead backends reconnect in the meantime.
    async fn pick(&self, ctx: &mut Context, upstream: &Upstream) -> Option<Arc<Backend>> {
        let deadline = Instant::now() + self.connect_timeout;
        let mut pause = Duration::from_millis(9);
        for attempt in 0..PICK_ATTEMPTS {
            if let Some(backend) = upstream.select(ctx, self.balancer.as_deref()) {
                return Some(backend);
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(pause.min(deadline - now)).await;
            pause = Duration::from_millis(6 + u64::from(attempt));
        }
        None
    }

    async fn forward(&self, ctx: &mut Context, backend: &Backend, host: &str) -> Result<(), Error> {
        let mut target = ctx.target.clone();
        if let Some(rewrite) = &backend.rewrite {
            match rewrite(ctx, &target) {
                Some(Rewrite::Path(path)) if path.starts_with('/') => target = path,
                Some(Rewrite::Path(path)) => target = format!("/{path}"),
                Some(Rewrite::Redirect(location)) => {
                    ctx.set_status(StatusCode::FOUND).set_header("location", &location);
                    return Ok(());
                }
                None => {}
            }
        }

        let mut headers = ctx.headers.clone();
        self.set_real_ip(&mut headers, &ctx.ip);
        for (name, value) in &backend.headers {
            headers.insert(name.clone(), value.clone());
        }

        let lease = match self.lease(backend).await {
            Ok(lease) => lease,
            Err(ProxyError::Exhausted) => {
                warn!(backend = %backend.url, "upstream pool exhausted");
                ctx.respond(StatusCode::TOO_MANY_REQUESTS, BUSY);
                return Ok(());
            }
            Err(e) => {
                warn!(backend = %backend.url, "no upstream session: {e}");
                self.unavailable(ctx);
                return Ok(());
            }
        };

        let body = ctx.take_body().unwrap_or_else(|| full(ctx.raw_body.clone()));
        let pool = backend.pool();
        let req = relay::upstream_request(
            relay::Forward {
                method: ctx.method.to_http(),
                scheme: pool.endpoint().scheme(),
                host,
                path: &target,
                http2: pool.protocol() == UpstreamProtocol::Http2,
                headers,
            },
            body,
        )?;

        let resp = match tokio::time::timeout(backend.timeout, lease.send(req)).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                warn!(backend = %backend.url, session = %lease.session_id(), "upstream request failed: {e}");
                lease.discard();
                self.unavailable(ctx);
                return Ok(());
            }
            Err(_) => {
                warn!(backend = %backend.url, session = %lease.session_id(), "upstream response timed out");
                lease.discard();
                self.unavailable(ctx);
                return Ok(());
            }
        };

        let (parts, upstream_body) = relay::downstream_response(resp);
        let (settle, outcome) = Settle::new();
        let body = RelayBody::new(upstream_body, backend.timeout, settle, Some(lease));
        ctx.set_reply(Response::from_parts(parts, body.boxed_unsync()));
        watch(outcome, backend.url.clone(), ctx.path.clone());
        Ok(())
    }

    async fn lease(&self, backend: &Backend) -> Result<Lease, ProxyError> {
        let mut attempt = 0;
        loop {
            match backend.pool().get_session().await {
                Err(ProxyError::Exhausted) if attempt < SESSION_ATTEMPTS => {
                    tokio::time::sleep(Duration::from_millis(5 + u64::from(attempt))).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn set_real_ip(&self, headers: &mut HeaderMap, ip: &str) {
        let value = match headers.get(&X_REAL_IP).and_then(|v| v.to_str().ok()) {
            Some(existing) if self.add_ip => format!("{existing},{ip}"),
            _ => ip.to_owned(),
        };
        if let Ok(value) = HeaderValue::try_from(value) {
            headers.insert(X_REAL_IP, value);
        }
    }

    fn unavailable(&self, ctx: &mut Context) {
        ctx.set_status(StatusCode::SERVICE_UNAVAILABLE).html(self.error_503.clone());
    }
}

/// Logs how a relay ended once its body settles.
fn watch(outcome: oneshot::Receiver<Outcome>, backend: String, path: String) {
    tokio::spawn(async move {
        match outcome.await {
            Ok(Outcome::Done { bytes }) => debug!(%backend, %path, bytes, "relay finished"),
            Ok(Outcome::Aborted) => debug!(%backend, %path, "downstream left mid-relay"),
            Ok(Outcome::TimedOut) => warn!(%backend, %path, "upstream body stalled"),
            Ok(Outcome::Failed(e)) => warn!(%backend, %path, "upstream body failed: {e}"),
            Err(_) => {}
        }
    });
}

struct ProxyMiddleware(Arc<Proxy>);

impl Middleware for ProxyMiddleware {
    fn call<'a>(&'a self, ctx: &'a mut Context, next: Next<'a>) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(self.0.handle(ctx, next))
    }
}

/// `api.test:8080` → `api.test`, `[::1]:80` → `[::1]`.
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return match rest.find(']') {
            Some(end) => &host[..end + 2],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_backends() -> ProxyConfig {
        let mut config = ProxyConfig::new();
        config
            .backend("API.test:8080", BackendConfig::new("/api", "http://127.0.0.1:1").weight(3))
            .backend("api.test", BackendConfig::new("/api", "http://127.0.0.1:2"))
            .backend("api.test", BackendConfig::new("/user/:id", "http://127.0.0.1:3"));
        config
    }

    #[test]
    fn ports_are_stripped() {
        assert_eq!(strip_port("api.test:8080"), "api.test");
        assert_eq!(strip_port("api.test"), "api.test");
        assert_eq!(strip_port("[::1]:80"), "[::1]");
        assert_eq!(strip_port("[::1]"), "[::1]");
        assert_eq!(strip_port("odd:"), "odd:");
    }

    #[test]
    fn backends_are_grouped_by_host_and_pattern() {
        let proxy = Proxy::new(two_backends()).unwrap();
        assert_eq!(proxy.paths().collect::<Vec<_>>(), ["/api/*", "/user/:id"]);

        let api = &proxy.hosts["api.test"]["/api/*"];
        assert_eq!(api.backends.len(), 2);
        assert_eq!(api.backends[0].weight, 3);
        assert_eq!(proxy.backends().count(), 3);

        let status = proxy.status();
        assert_eq!(status.len(), 3);
        assert!(status.iter().all(|s| !s.alive && s.pool.total == 0));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = ProxyConfig::new();
        config.backend("a.test", BackendConfig::new("/", "ftp://nope"));
        assert!(matches!(Proxy::new(config), Err(Error::Config(_))));
    }

    #[test]
    fn init_registers_every_method_in_the_proxy_group() {
        let mut app = App::new();
        let proxy = Proxy::new(two_backends()).unwrap().init(&mut app).unwrap();
        for method in Method::ALL {
            let hit = app.router().find("/api/users/7", method).unwrap();
            assert_eq!(hit.route.group, "proxy");
            assert_eq!(hit.route.path, "/api/*");
        }
        assert!(app.router().find("/user/9", Method::Patch).is_some());
        assert_eq!(proxy.paths().count(), 2);
    }

    #[test]
    fn real_ip_is_set_or_appended() {
        let mut proxy = Proxy::new(ProxyConfig::new()).unwrap();
        let mut headers = HeaderMap::new();
        proxy.set_real_ip(&mut headers, "10.0.0.1");
        assert_eq!(headers["x-real-ip"], "10.0.0.1");

        proxy.set_real_ip(&mut headers, "10.0.0.2");
        assert_eq!(headers["x-real-ip"], "10.0.0.2");

        proxy.add_ip = true;
        proxy.set_real_ip(&mut headers, "10.0.0.3");
        assert_eq!(headers["x-real-ip"], "10.0.0.2,10.0.0.3");
    }

    #[test]
    fn consistent_balancer_is_sticky_without_alive_backends() {
        let proxy = Proxy::new(two_backends()).unwrap();
        let backends = &proxy.hosts["api.test"]["/api/*"].backends;
        let balancer = ConsistentBalancer::new(|c: &Context| c.header("x-user").map(str::to_owned));

        let mut ctx = Context::new();
        assert_eq!(balancer.select(&ctx, backends), None);

        ctx.headers.insert("x-user", HeaderValue::from_static("u-42"));
        let first = balancer.select(&ctx, backends);
        assert!(first.is_some());
        for _ in 0..5 {
            assert_eq!(balancer.select(&ctx, backends), first);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn dead_backends_yield_none_after_connect_timeout() {
        let mut config = two_backends();
        config.connect_timeout_ms = 200;
        let proxy = Proxy::new(config).unwrap();
        let upstream = &proxy.hosts["api.test"]["/api/*"];

        let started = Instant::now();
        let mut ctx = Context::new();
        assert!(proxy.pick(&mut ctx, upstream).await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(started.elapsed() < Duration::from_secs(1));
        proxy.close_all();
    }
}
