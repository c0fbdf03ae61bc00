//! Unified error types.
//!
//! Three layers of failure, three types:
//!
//! - [`RouteError`]: registration went wrong. Returned from `App::get` and
//!   friends at startup; propagate with `?` and refuse to start.
//! - [`ProxyError`]: an upstream leg failed. The proxy middleware converts
//!   these to 502/503/429 for the downstream caller.
//! - [`Error`]: everything a handler, middleware or the server can return.
//!
//! Application-level outcomes (404, 422, ...) are written to the
//! [`Context`](crate::Context), not returned as errors. An `Err` that reaches
//! the chain runner becomes a 500.

use std::net::SocketAddr;

use thiserror::Error;

/// Boxed error used by request and response bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The error type returned by strata's fallible operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("route: {0}")]
    Route(#[from] RouteError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("hyper: {0}")]
    Hyper(#[from] hyper::Error),

    #[error("http: {0}")]
    Http(#[from] http::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("tls: {0}")]
    Tls(String),

    #[error("config: {0}")]
    Config(String),

    #[error("proxy: {0}")]
    Proxy(#[from] ProxyError),

    #[error("timed out")]
    Timeout,

    #[error("address already in use: {0}")]
    AddrInUse(SocketAddr),

    /// The client went away before the response could be written.
    #[error("request aborted by client")]
    Aborted,

    #[error("{0}")]
    Handler(String),

    #[error("panic in request chain: {0}")]
    Panic(String),
}

impl Error {
    /// Shorthand for handler code that wants to fail with a message.
    pub fn msg(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }
}

/// Registration-time routing failures. All of them are fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("illegal path `{0}`: allowed characters are a-z 0-9 - _ : * / . @")]
    IllegalPath(String),

    #[error("`{path}` conflicts with `{existing}`")]
    Conflict { path: String, existing: String },

    #[error("route name `{0}` is already in use")]
    DuplicateName(String),

    #[error("{method} {path} is already registered")]
    DuplicatePath { method: &'static str, path: String },

    #[error("`{0}`: only one `*` is allowed")]
    MultipleStar(String),

    #[error("`{0}`: `*` must be the last segment")]
    StarNotLast(String),

    #[error("`{0}`: `:` and `*` cannot be mixed")]
    MixedParamAndStar(String),

    #[error("`{0}`: parameter name is empty")]
    EmptyParamName(String),

    #[error("group `{0}` nests too deeply")]
    GroupTooDeep(String),
}

/// Upstream failures seen by the reverse proxy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProxyError {
    #[error("connect timed out")]
    ConnectTimeout,

    #[error("connect failed: {0}")]
    Connect(String),

    /// The pool already holds more than `max_connect` sessions.
    #[error("pool exhausted")]
    Exhausted,

    #[error("no alive backend")]
    NoBackend,

    #[error("session is not connected")]
    NotConnected,

    #[error("upstream request timed out")]
    RequestTimeout,

    #[error("relay aborted")]
    Aborted,

    #[error("upstream: {0}")]
    Upstream(String),

    #[error("invalid backend url `{0}`")]
    InvalidUrl(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
