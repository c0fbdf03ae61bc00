//! Backend descriptors.

use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;
use http::header::{HeaderName, HeaderValue};

use super::config::{BackendConfig, ProxyConfig, RewriteFn, parse_backend_url};
use super::pool::{Pool, PoolOptions, PoolStatus};
use super::tls;
use crate::error::Error;

/// One upstream target for one `(host, routepath)` pair.
pub struct Backend {
    /// `scheme://host:port`.
    pub url: String,
    /// Path as configured.
    pub path: String,
    pub weight: u32,
    /// Response-head budget, and the idle budget while relaying the body.
    pub timeout: Duration,
    pub(crate) headers: HeaderMap,
    pub(crate) rewrite: Option<RewriteFn>,
    pool: Arc<Pool>,
}

impl Backend {
    pub(crate) fn from_config(
        cfg: &BackendConfig,
        proxy: &ProxyConfig,
        rewrite: Option<RewriteFn>,
    ) -> Result<Self, Error> {
        let endpoint = parse_backend_url(&cfg.url)?;
        let tls = match (&cfg.ca, endpoint.tls) {
            (Some(ca), true) => Some(tls::connector(ca, cfg.protocol)?),
            (None, true) => return Err(Error::Config(format!("{}: https backends need `ca`", cfg.url))),
            (_, false) => None,
        };

        let mut headers = HeaderMap::with_capacity(cfg.headers.len());
        for (name, value) in &cfg.headers {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|e| Error::Config(format!("{}: header `{name}`: {e}", cfg.url)))?;
            let value = HeaderValue::try_from(value.as_str())
                .map_err(|e| Error::Config(format!("{}: header `{name}`: {e}", cfg.url)))?;
            headers.insert(name, value);
        }

        let timeout = Duration::from_millis(cfg.timeout_ms.unwrap_or(proxy.timeout_ms));
        let opts = PoolOptions {
            max: cfg.max,
            pool_max: cfg.pool_max(),
            max_connect: cfg.max_connect(),
            max_alive_streams: proxy.max_alive_streams,
            timeout,
            connect_timeout: Duration::from_millis(cfg.connect_timeout_ms.unwrap_or(proxy.connect_timeout_ms)),
            reconn_delay: Duration::from_millis(cfg.reconn_delay_ms),
            protocol: cfg.protocol,
        };
        let pool = Pool::new(endpoint, tls, opts);

        Ok(Self {
            url: pool.url(),
            path: cfg.path.clone(),
            weight: cfg.weight.max(1),
            timeout,
            headers,
            rewrite,
            pool,
        })
    }

    /// Derived from the pool on every call, never cached.
    pub fn is_alive(&self) -> bool {
        self.pool.ok()
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn status(&self) -> PoolStatus {
        self.pool.status()
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("url", &self.url)
            .field("path", &self.path)
            .field("weight", &self.weight)
            .field("alive", &self.is_alive())
            .finish()
    }
}
