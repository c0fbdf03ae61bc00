//! Proxy configuration.
//!
//! ```toml
//! full = false
//! timeout_ms = 30000
//! connect_timeout_ms = 15000
//!
//! [[hosts."api.test"]]
//! path = "/v1"
//! url = "http://10.0.0.7:8080"
//! weight = 3
//!
//! [[hosts."api.test"]]
//! path = "/v1"
//! url = "http://10.0.0.8:8080"
//! protocol = "http2"
//! headers = { x-gateway = "strata" }
//! ```
//!
//! Rewrite hooks are closures and cannot come from TOML; attach them with
//! [`ProxyConfig::rewrite`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use super::strip_port;
use crate::context::Context;
use crate::error::{Error, ProxyError};

/// Wire protocol spoken to one backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamProtocol {
    /// One in-flight request per pooled connection.
    #[default]
    Http1,
    /// Multiplexed; up to `max_alive_streams` requests per session.
    Http2,
}

/// What a rewrite hook decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rewrite {
    /// Forward to this path (with query) instead.
    Path(String),
    /// Answer `302` with this `location`; nothing is forwarded.
    Redirect(String),
}

/// Rewrite hook: `(ctx, path_and_query) -> Some(Rewrite)` or `None` to
/// forward unchanged.
pub type RewriteFn = Arc<dyn Fn(&Context, &str) -> Option<Rewrite> + Send + Sync>;

/// One upstream target serving one path of one host.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackendConfig {
    pub path: String,
    pub url: String,
    pub weight: u32,
    /// Injected into every forwarded request.
    pub headers: BTreeMap<String, String>,
    /// Overrides [`ProxyConfig::timeout_ms`].
    pub timeout_ms: Option<u64>,
    /// Overrides [`ProxyConfig::connect_timeout_ms`].
    pub connect_timeout_ms: Option<u64>,
    /// Sessions opened when the pool warms up.
    pub max: usize,
    /// Refuse new sessions beyond this many. Defaults to the pool size + 500.
    pub max_connect: Option<usize>,
    /// Fixed part of the reconnect delay once every session is gone.
    pub reconn_delay_ms: u64,
    pub protocol: UpstreamProtocol,
    /// PEM bundle of roots trusted for an `https` backend.
    pub ca: Option<PathBuf>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            path: "/".to_owned(),
            url: String::new(),
            weight: 1,
            headers: BTreeMap::new(),
            timeout_ms: None,
            connect_timeout_ms: None,
            max: 50,
            max_connect: None,
            reconn_delay_ms: 500,
            protocol: UpstreamProtocol::Http1,
            ca: None,
        }
    }
}

impl BackendConfig {
    pub fn new(path: impl Into<String>, url: impl Into<String>) -> Self {
        Self { path: path.into(), url: url.into(), ..Self::default() }
    }

    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn protocol(mut self, protocol: UpstreamProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sessions the pool keeps: `max * 1.5`, rounded.
    pub fn pool_max(&self) -> usize {
        (self.max * 3 + 1) / 2
    }

    pub fn max_connect(&self) -> usize {
        self.max_connect.unwrap_or(self.pool_max() + 500)
    }
}

/// Virtual host → backends, plus proxy-wide settings.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub hosts: BTreeMap<String, Vec<BackendConfig>>,
    /// Answer 502 for requests on proxied paths whose host has no backend,
    /// instead of falling through to the route handler.
    pub full: bool,
    pub timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub max_alive_streams: usize,
    /// Append the peer address to an existing `x-real-ip` instead of
    /// replacing it.
    pub add_ip: bool,
    pub error_502: String,
    pub error_503: String,
    /// Route group the proxied paths are registered under.
    pub group: String,
    #[serde(skip)]
    pub(crate) rewrites: Vec<(String, String, RewriteFn)>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            hosts: BTreeMap::new(),
            full: false,
            timeout_ms: 30_000,
            connect_timeout_ms: 15_000,
            max_alive_streams: 100,
            add_ip: false,
            error_502: error_page(502, "Bad Gateway"),
            error_503: error_page(503, "Service Unavailable"),
            group: "proxy".to_owned(),
            rewrites: Vec::new(),
        }
    }
}

impl ProxyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, Error> {
        let config: ProxyConfig = toml::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Adds a backend for `host`.
    pub fn backend(&mut self, host: impl Into<String>, backend: BackendConfig) -> &mut Self {
        self.hosts.entry(host.into()).or_default().push(backend);
        self
    }

    /// Attaches a rewrite hook to every backend of `host` serving `path`.
    pub fn rewrite<F>(&mut self, host: impl Into<String>, path: &str, f: F) -> &mut Self
    where
        F: Fn(&Context, &str) -> Option<Rewrite> + Send + Sync + 'static,
    {
        self.rewrites.push((host.into(), fmt_path(path), Arc::new(f)));
        self
    }

    pub(crate) fn rewrite_for(&self, host: &str, path: &str) -> Option<RewriteFn> {
        self.rewrites
            .iter()
            .rev()
            .find(|(h, p, _)| strip_port(h).eq_ignore_ascii_case(host) && p == path)
            .map(|(_, _, f)| Arc::clone(f))
    }

    pub fn validate(&self) -> Result<(), Error> {
        let mut problems = Vec::new();
        if self.connect_timeout_ms == 0 {
            problems.push("connect_timeout_ms must be positive".to_owned());
        }
        if self.timeout_ms == 0 {
            problems.push("timeout_ms must be positive".to_owned());
        }
        if self.max_alive_streams == 0 {
            problems.push("max_alive_streams must be positive".to_owned());
        }
        for (host, backends) in &self.hosts {
            for b in backends {
                if let Err(e) = parse_backend_url(&b.url) {
                    problems.push(format!("{host}: {e}"));
                    continue;
                }
                if b.weight == 0 {
                    problems.push(format!("{host} {}: weight must be positive", b.url));
                }
                if b.max == 0 {
                    problems.push(format!("{host} {}: max must be positive", b.url));
                }
                if b.url.starts_with("https") && b.ca.is_none() {
                    problems.push(format!("{host} {}: https backends need `ca`", b.url));
                }
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(problems.join(", ")))
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn error_page(code: u16, reason: &str) -> String {
    format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>{code}</title></head>\
<body><h1>{code} {reason}</h1></body></html>"
    )
}

/// Route pattern a backend path is served under.
///
/// `/api` → `/api/*`, `` → `/*`; paths with parameters (`/user/:id`) are
/// kept exact.
pub fn fmt_path(path: &str) -> String {
    let trimmed = path.trim();
    let mut out = String::with_capacity(trimmed.len() + 3);
    out.push('/');
    for ch in trimmed.chars() {
        if ch == '/' && out.ends_with('/') {
            continue;
        }
        out.push(ch);
    }
    if out.ends_with('*') {
        return out;
    }
    if out.contains("/:") {
        while out.len() > 1 && out.ends_with('/') {
            out.pop();
        }
        return out;
    }
    if !out.ends_with('/') {
        out.push('/');
    }
    out.push('*');
    out
}

/// Host and port of an upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Endpoint {
    pub(crate) tls: bool,
    pub(crate) host: String,
    pub(crate) port: u16,
}

impl Endpoint {
    pub(crate) fn scheme(&self) -> &'static str {
        if self.tls { "https" } else { "http" }
    }

    pub(crate) fn addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Accepts `http://host[:port]` and `https://host[:port]`; a trailing `/` is
/// ignored, anything past the authority is rejected.
pub(crate) fn parse_backend_url(raw: &str) -> Result<Endpoint, ProxyError> {
    let invalid = || ProxyError::InvalidUrl(raw.to_owned());
    let trimmed = raw.trim().trim_end_matches('/');
    let url = Url::parse(trimmed).map_err(|_| invalid())?;

    let tls = match url.scheme() {
        "http" => false,
        "https" => true,
        _ => return Err(invalid()),
    };
    if (url.path() != "/" && !url.path().is_empty()) || url.query().is_some() {
        return Err(invalid());
    }
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(invalid)?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_owned();
    let port = url.port_or_known_default().ok_or_else(invalid)?;
    Ok(Endpoint { tls, host, port })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_become_star_routes() {
        assert_eq!(fmt_path(""), "/*");
        assert_eq!(fmt_path("/"), "/*");
        assert_eq!(fmt_path("/api"), "/api/*");
        assert_eq!(fmt_path("api/"), "/api/*");
        assert_eq!(fmt_path("//api//v1"), "/api/v1/*");
        assert_eq!(fmt_path("/user/:id/"), "/user/:id");
        assert_eq!(fmt_path("/static/*"), "/static/*");
    }

    #[test]
    fn backend_urls() {
        let ep = parse_backend_url("http://127.0.0.1:8001/").unwrap();
        assert_eq!(ep, Endpoint { tls: false, host: "127.0.0.1".into(), port: 8001 });
        assert_eq!(ep.addr(), "127.0.0.1:8001");

        let ep = parse_backend_url("https://api.internal").unwrap();
        assert_eq!((ep.tls, ep.port), (true, 443));

        assert_eq!(parse_backend_url("http://[::1]:9000").unwrap().addr(), "[::1]:9000");

        for bad in ["", "ftp://x", "http://", "10.0.0.1:80", "http://x/api"] {
            assert!(parse_backend_url(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn toml_with_defaults() {
        let config = ProxyConfig::from_toml_str(
            r#"
            add_ip = true

            [[hosts."api.test"]]
            url = "http://127.0.0.1:8001"
            weight = 3

            [[hosts."api.test"]]
            path = "/v2"
            url = "http://127.0.0.1:8002"
            protocol = "http2"
            headers = { x-gateway = "strata" }
            "#,
        )
        .unwrap();

        assert!(config.add_ip);
        assert_eq!(config.connect_timeout_ms, 15_000);
        let backends = &config.hosts["api.test"];
        assert_eq!(backends[0].path, "/");
        assert_eq!(backends[0].weight, 3);
        assert_eq!(backends[0].pool_max(), 75);
        assert_eq!(backends[0].max_connect(), 575);
        assert_eq!(backends[1].protocol, UpstreamProtocol::Http2);
        assert_eq!(backends[1].headers["x-gateway"], "strata");
    }

    #[test]
    fn validation_collects_every_problem() {
        let mut config = ProxyConfig::new();
        config
            .backend("a.test", BackendConfig::new("/", "unix:///tmp/sock"))
            .backend("a.test", BackendConfig::new("/", "http://ok:80").weight(0))
            .backend("b.test", BackendConfig::new("/", "https://secure"));
        let Err(Error::Config(msg)) = config.validate() else {
            panic!("expected a config error");
        };
        assert!(msg.contains("unix:///tmp/sock"), "{msg}");
        assert!(msg.contains("weight"), "{msg}");
        assert!(msg.contains("need `ca`"), "{msg}");
    }

    #[test]
    fn rewrites_attach_by_host_and_formatted_path() {
        let mut config = ProxyConfig::new();
        config.rewrite("a.test", "/api", |_, p| Some(Rewrite::Path(p.replacen("/api", "", 1))));
        assert!(config.rewrite_for("a.test", "/api/*").is_some());
        config.rewrite("B.test:8080", "/", |_, _| None);
        assert!(config.rewrite_for("b.test", "/*").is_some());
        assert!(config.rewrite_for("c.test", "/api/*").is_none());
    }
}
