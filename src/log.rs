//! Error reporting and access logging hooks.
//!
//! Both default to `tracing` events. Applications that ship logs elsewhere
//! replace them with `App::on_error` / `App::access_log`.

use std::sync::Arc;

use http::HeaderMap;
use serde::Serialize;
use tracing::{error, info};

/// Longest `user-agent` value copied into an access record.
pub const MAX_AGENT_LEN: usize = 111;
/// Longest `host` / `:authority` value copied into an access record.
pub const MAX_HOST_LEN: usize = 300;

type ErrorFn = dyn Fn(&(dyn std::error::Error + 'static), &str) + Send + Sync;

/// Receives every internal error together with a short tag saying where it
/// happened (`response`, `client`, `tls`, `proxy`, ...).
#[derive(Clone)]
pub struct ErrorHandler(Arc<ErrorFn>);

impl ErrorHandler {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&(dyn std::error::Error + 'static), &str) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn report(&self, err: &(dyn std::error::Error + 'static), tag: &str) {
        (self.0)(err, tag)
    }
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new(|err, tag| error!(tag, "{err}"))
    }
}

/// One access-log record.
#[derive(Debug, Clone, Serialize)]
pub struct AccessRecord {
    pub method: String,
    pub status: u16,
    pub ip: String,
    /// `scheme://host/target`.
    pub link: String,
    pub agent: String,
    pub real_ip: String,
}

impl AccessRecord {
    pub(crate) fn new(
        method: &str,
        status: u16,
        ip: &str,
        scheme: &str,
        host: &str,
        target: &str,
        headers: &HeaderMap,
        trust_forwarded: bool,
    ) -> Self {
        let agent = headers
            .get(http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-");
        let real_ip = if trust_forwarded {
            ["x-real-ip", "x-forwarded-for"]
                .iter()
                .find_map(|h| headers.get(*h).and_then(|v| v.to_str().ok()))
                .unwrap_or("-")
        } else {
            "-"
        };
        Self {
            method: method.to_owned(),
            status,
            ip: ip.to_owned(),
            link: format!("{scheme}://{}{target}", truncate(host, MAX_HOST_LEN)),
            agent: truncate(agent, MAX_AGENT_LEN).to_owned(),
            real_ip: truncate(real_ip, MAX_HOST_LEN).to_owned(),
        }
    }
}

/// Sink for access records. Called after the response head is produced and
/// must not block.
#[derive(Clone)]
pub struct AccessLogger(Arc<dyn Fn(AccessRecord) + Send + Sync>);

impl AccessLogger {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(AccessRecord) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn log(&self, record: AccessRecord) {
        (self.0)(record)
    }
}

impl Default for AccessLogger {
    fn default() -> Self {
        Self::new(|r| {
            info!(
                target: "strata::access",
                method = %r.method,
                status = r.status,
                ip = %r.ip,
                link = %r.link,
                agent = %r.agent,
                real_ip = %r.real_ip,
            )
        })
    }
}

/// Cuts `s` to at most `max` bytes on a char boundary.
pub fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("abc", 10), "abc");
        assert_eq!(truncate("abcdef", 3), "abc");
        // 'é' is two bytes
        assert_eq!(truncate("aé", 2), "a");
    }

    #[test]
    fn record_truncates_hostile_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("user-agent", "x".repeat(500).parse().unwrap());
        let host = "h".repeat(1000);
        headers.insert("x-forwarded-for", "9.9.9.9".parse().unwrap());
        let r = AccessRecord::new("GET", 200, "1.2.3.4", "http", &host, "/a?b=1", &headers, false);
        assert_eq!(r.agent.len(), MAX_AGENT_LEN);
        assert_eq!(r.link.len(), "http://".len() + MAX_HOST_LEN + "/a?b=1".len());
        assert_eq!(r.real_ip, "-");

        let r = AccessRecord::new("GET", 200, "1.2.3.4", "http", "h", "/", &headers, true);
        assert_eq!(r.real_ip, "9.9.9.9");
    }

    #[test]
    fn custom_error_handler_sees_tag() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = ErrorHandler::new(move |err, tag| {
            sink.lock().unwrap().push(format!("{tag}: {err}"));
        });
        handler.report(&crate::Error::Timeout, "stream");
        assert_eq!(seen.lock().unwrap().as_slice(), ["stream: timed out"]);
    }
}
