//! The per-request record threaded through the middleware chain.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{Extensions, HeaderMap, Response, StatusCode, Version};
use serde::Serialize;
use tracing::debug;

use crate::error::Error;
use crate::method::Method;
use crate::query::Query;
use crate::response::{self, ContentType, Data, HttpBody};
use crate::router::Route;

/// Route parameters extracted from `:name` segments.
pub type Params = HashMap<String, String>;

/// Parsed request body.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Body {
    #[default]
    Empty,
    Json(serde_json::Value),
    Form(Query),
    Text(String),
    Raw(Bytes),
}

/// Name → implementation registry for optional extensions.
///
/// Middleware that wants to offer something to handlers registers it here;
/// handlers check for the capability instead of assuming it exists.
#[derive(Default, Clone)]
pub struct Capabilities(HashMap<&'static str, Arc<dyn Any + Send + Sync>>);

impl Capabilities {
    pub fn insert<T: Any + Send + Sync>(&mut self, name: &'static str, value: T) {
        self.0.insert(name, Arc::new(value));
    }

    pub fn has(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// `None` when absent or registered under a different type.
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Option<&T> {
        self.0.get(name)?.downcast_ref()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

/// Application-wide shared values, handed to every request.
#[derive(Default, Clone)]
pub struct Services(HashMap<String, Arc<dyn Any + Send + Sync>>);

impl Services {
    pub fn insert<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.0.insert(key.into(), Arc::new(value));
    }

    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<&T> {
        self.0.get(key)?.downcast_ref()
    }
}

/// Per-request scratch space.
///
/// Protocol adapters fill the request side, middleware and handlers fill the
/// reply side (`send`, `set_status`, `set_header`). Nothing is written to the
/// wire until the chain unwinds.
#[derive(Default)]
pub struct Context {
    pub version: Version,
    pub method: Method,
    /// `http` or `https`.
    pub scheme: &'static str,
    pub host: String,
    /// Peer address and port.
    pub ip: String,
    pub port: u16,
    /// Path component of the request target, query stripped.
    pub path: String,
    /// Path and query exactly as received.
    pub target: String,
    /// The pattern that matched (`/users/:id`).
    pub routepath: String,
    pub name: String,
    pub group: String,
    pub headers: HeaderMap,
    pub query: Query,
    pub param: Params,
    /// What `*` consumed, for wildcard routes.
    pub star_path: Option<String>,
    pub body: Body,
    pub raw_body: Bytes,
    pub body_length: usize,
    pub is_upload: bool,
    pub max_body: usize,
    pub data: Data,
    /// Free-form typed bag for signalling between middleware.
    pub bag: Extensions,
    pub caps: Capabilities,
    pub services: Option<Arc<Services>>,

    pub(crate) status: StatusCode,
    pub(crate) reply_headers: HeaderMap,
    pub(crate) route: Option<Arc<Route>>,
    pub(crate) request_body: Option<HttpBody>,
    pub(crate) reply: Option<Response<HttpBody>>,
    pub(crate) aborted: bool,
    pub(crate) close_connection: bool,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Request side ──────────────────────────────────────────────────────────

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.param.get(key).map(String::as_str)
    }

    pub fn query_get(&self, key: &str) -> Option<&str> {
        self.query.get(key)
    }

    /// Takes the unread request body stream.
    ///
    /// Body ingestion normally consumes it; middleware registered with
    /// `pre` runs first and may take it to stream it elsewhere.
    pub fn take_body(&mut self) -> Option<HttpBody> {
        self.request_body.take()
    }

    pub fn set_request_body(&mut self, body: HttpBody) {
        self.request_body = Some(body);
    }

    // ── Reply side ────────────────────────────────────────────────────────────

    /// Sets the data the final sink will send.
    pub fn send(&mut self, data: impl Into<Data>) -> &mut Self {
        self.data = data.into();
        self
    }

    /// Same as [`send`](Self::send).
    pub fn to(&mut self, data: impl Into<Data>) -> &mut Self {
        self.send(data)
    }

    /// Serializes `value` and marks the reply as JSON.
    pub fn json<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<&mut Self, Error> {
        let value = serde_json::to_value(value)?;
        self.set_content_type(ContentType::Json);
        Ok(self.send(value))
    }

    pub fn text(&mut self, text: impl Into<String>) -> &mut Self {
        self.set_content_type(ContentType::Text);
        self.send(text.into())
    }

    pub fn html(&mut self, html: impl Into<String>) -> &mut Self {
        self.set_content_type(ContentType::Html);
        self.send(html.into())
    }

    pub fn set_content_type(&mut self, ct: ContentType) -> &mut Self {
        self.reply_headers.insert(http::header::CONTENT_TYPE, ct.header_value());
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) -> &mut Self {
        self.status = status;
        self
    }

    /// Sets a reply header. Names or values that are not valid HTTP are
    /// dropped with a debug event.
    pub fn set_header(&mut self, name: &str, value: &str) -> &mut Self {
        match (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            (Ok(name), Ok(value)) => {
                self.reply_headers.insert(name, value);
            }
            _ => debug!(header = name, "dropping invalid reply header"),
        }
        self
    }

    pub fn remove_header(&mut self, name: &str) -> &mut Self {
        self.reply_headers.remove(name);
        self
    }

    pub fn reply_header(&self, name: &str) -> Option<&HeaderValue> {
        self.reply_headers.get(name)
    }

    /// `true` until a response has been produced or the client went away.
    pub fn is_writable(&self) -> bool {
        self.reply.is_none() && !self.aborted
    }

    /// Answers right away with `status` and a plain-text body. The final sink
    /// leaves an answered context alone.
    pub fn respond(&mut self, status: StatusCode, body: impl Into<Bytes>) {
        if self.is_writable() {
            self.reply = Some(response::plain(status, body));
        }
    }

    /// Installs a fully built response, e.g. one relayed from upstream.
    pub fn set_reply(&mut self, reply: Response<HttpBody>) {
        if self.is_writable() {
            self.reply = Some(reply);
        }
    }

    /// Builds the reply from `data`, `status` and the reply headers.
    pub(crate) fn finish(&mut self) {
        if !self.is_writable() {
            return;
        }
        let headers = std::mem::take(&mut self.reply_headers);
        let data = std::mem::take(&mut self.data);
        self.reply = Some(response::assemble(self.status, headers, data));
    }

    pub(crate) fn take_reply(&mut self) -> Option<Response<HttpBody>> {
        self.reply.take()
    }

    /// Marks the connection for closing once the reply is written.
    pub fn close_connection(&mut self) {
        self.close_connection = true;
    }

    pub(crate) fn mark_aborted(&mut self) {
        self.aborted = true;
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Drops every transport handle and large object once the chain has
    /// settled. The reply, status and abort flag survive so the adapter can
    /// still write and log.
    pub(crate) fn release_transport(&mut self) {
        self.request_body = None;
        self.headers = HeaderMap::new();
        self.body = Body::Empty;
        self.raw_body = Bytes::new();
        self.param = Params::new();
        self.services = None;
        self.route = None;
        self.data = Data::Empty;
    }

    /// Returns every field to its neutral value for reuse from a pool.
    pub(crate) fn reset(&mut self) {
        self.release_transport();
        self.version = Version::default();
        self.method = Method::default();
        self.scheme = "";
        self.host.clear();
        self.ip.clear();
        self.port = 0;
        self.path.clear();
        self.target.clear();
        self.routepath.clear();
        self.name.clear();
        self.group.clear();
        self.query.clear();
        self.star_path = None;
        self.body_length = 0;
        self.is_upload = false;
        self.max_body = 0;
        self.bag.clear();
        self.caps.clear();
        self.status = StatusCode::OK;
        self.reply_headers.clear();
        self.reply = None;
        self.aborted = false;
        self.close_connection = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn respond_happens_once() {
        let mut ctx = Context::new();
        ctx.respond(StatusCode::PAYLOAD_TOO_LARGE, "too big");
        ctx.respond(StatusCode::INTERNAL_SERVER_ERROR, "");
        assert!(!ctx.is_writable());
        assert_eq!(ctx.take_reply().unwrap().status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn finish_uses_status_headers_and_data() {
        let mut ctx = Context::new();
        ctx.set_status(StatusCode::CREATED)
            .set_header("location", "/users/9")
            .send("made");
        ctx.finish();
        let reply = ctx.take_reply().unwrap();
        assert_eq!(reply.status(), StatusCode::CREATED);
        assert_eq!(reply.headers()["location"], "/users/9");
        assert_eq!(reply.headers()["content-type"], "text/plain;charset=utf-8");
    }

    #[test]
    fn invalid_headers_are_dropped() {
        let mut ctx = Context::new();
        ctx.set_header("bad name", "x").set_header("x-ok", "line\nbreak");
        assert!(ctx.reply_headers.is_empty());
    }

    #[test]
    fn reset_clears_request_and_reply_state() {
        let mut ctx = Context::new();
        ctx.path.push_str("/a");
        ctx.param.insert("id".into(), "1".into());
        ctx.bag.insert(7u8);
        ctx.caps.insert("jwt", "secret");
        ctx.set_status(StatusCode::NOT_FOUND).send("x");
        ctx.mark_aborted();

        ctx.reset();

        assert!(ctx.path.is_empty());
        assert!(ctx.param.is_empty());
        assert!(ctx.bag.get::<u8>().is_none());
        assert!(!ctx.caps.has("jwt"));
        assert_eq!(ctx.status(), StatusCode::OK);
        assert!(ctx.data.is_empty());
        assert!(ctx.is_writable());
    }

    #[test]
    fn capabilities_are_typed() {
        let mut caps = Capabilities::default();
        caps.insert("limit", 10usize);
        assert_eq!(caps.get::<usize>("limit"), Some(&10));
        assert_eq!(caps.get::<String>("limit"), None);
    }
}
