//! Server configuration.
//!
//! Every field has a default, so an empty TOML document is a valid config.
//! Validation is separate from deserialization: serde checks shape,
//! [`Config::validate`] checks meaning.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Which wire protocols the listener speaks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// HTTP/1.1 only.
    #[default]
    Http1,
    /// HTTP/2 only: prior-knowledge h2c, or ALPN `h2` under TLS.
    Http2,
    /// Sniff the connection preface (or ALPN) and serve either.
    Auto,
}

/// PEM certificate chain and private key.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Largest accepted request body in bytes.
    pub max_body: usize,
    /// Request targets longer than this are truncated before parsing.
    pub max_url_length: usize,
    /// Maximum distinct query keys kept; 0 means unlimited.
    pub max_query: usize,
    /// Repeated query keys keep the last value instead of accumulating.
    pub fast_parse_query: bool,
    pub auto_decode_query: bool,
    /// Maximum distinct keys kept from a urlencoded form body.
    pub max_form_keys: usize,
    /// `/a/` and `/a` resolve to the same route.
    pub ignore_slash: bool,
    /// Install the body parser middleware.
    pub parse_body: bool,
    /// Connection (HTTP/1) and session (HTTP/2) idle timeout.
    pub timeout_ms: u64,
    /// Per-stream HTTP/2 timeout. Negative means "same as `timeout_ms`".
    pub stream_timeout_ms: i64,
    /// Budget for reading a complete request body.
    pub request_timeout_ms: u64,
    pub header_timeout_ms: u64,
    pub max_conn: usize,
    /// Capacity of the HTTP/2 context free-list.
    pub max_pool: usize,
    pub protocol: Protocol,
    pub not_found: String,
    pub bad_request: String,
    /// Emit an access-log record for every response.
    pub global_log: bool,
    /// Copy `x-real-ip` / `x-forwarded-for` into access records.
    pub real_ip: bool,
    pub tls: Option<TlsConfig>,
    pub max_concurrent_streams: u32,
    pub max_header_list_size: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_body: 50_000_000,
            max_url_length: 1152,
            max_query: 25,
            fast_parse_query: false,
            auto_decode_query: true,
            max_form_keys: 100,
            ignore_slash: true,
            parse_body: true,
            timeout_ms: 20_000,
            stream_timeout_ms: -1,
            request_timeout_ms: 65_000,
            header_timeout_ms: 6_000,
            max_conn: 2560,
            max_pool: 8192,
            protocol: Protocol::Http1,
            not_found: "not found".to_owned(),
            bad_request: "bad request".to_owned(),
            global_log: false,
            real_ip: false,
            tls: None,
            max_concurrent_streams: 100,
            max_header_list_size: 16 * 1024,
        }
    }
}

impl Config {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, Error> {
        let config: Config = toml::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), Error> {
        let mut problems = Vec::new();
        if self.max_url_length == 0 {
            problems.push("max_url_length must be positive");
        }
        if self.timeout_ms == 0 {
            problems.push("timeout_ms must be positive");
        }
        if self.max_conn == 0 {
            problems.push("max_conn must be positive");
        }
        if self.max_concurrent_streams == 0 {
            problems.push("max_concurrent_streams must be positive");
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

    pub fn stream_timeout(&self) -> Duration {
        u64::try_from(self.stream_timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or_else(|_| self.timeout())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn header_timeout(&self) -> Duration {
        Duration::from_millis(self.header_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_default() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.max_body, 50_000_000);
        assert_eq!(config.protocol, Protocol::Http1);
        assert_eq!(config.stream_timeout(), config.timeout());
    }

    #[test]
    fn fields_override_defaults() {
        let config = Config::from_toml_str(
            r#"
            max_body = 1024
            protocol = "auto"
            stream_timeout_ms = 500
            not_found = "nope"
            "#,
        )
        .unwrap();
        assert_eq!(config.max_body, 1024);
        assert_eq!(config.protocol, Protocol::Auto);
        assert_eq!(config.stream_timeout(), Duration::from_millis(500));
        assert_eq!(config.not_found, "nope");
        assert!(config.ignore_slash);
    }

    #[test]
    fn semantic_errors_are_reported() {
        let err = Config::from_toml_str("timeout_ms = 0\nmax_conn = 0").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("timeout_ms"), "{msg}");
        assert!(msg.contains("max_conn"), "{msg}");
    }

    #[test]
    fn unknown_protocol_is_a_parse_error() {
        assert!(matches!(
            Config::from_toml_str(r#"protocol = "spdy""#),
            Err(Error::Config(_))
        ));
    }
}
