//! Response data, content types and body plumbing.
//!
//! Handlers do not build responses. They put a [`Data`] value on the
//! [`Context`](crate::Context) and the final sink turns it into a response
//! once the chain unwinds, sniffing a content type when none was set.

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Response, StatusCode, header};
use http_body_util::{BodyExt, Empty, Full};
use http_body_util::combinators::UnsyncBoxBody;

use crate::error::BoxError;

/// Body type for everything strata sends or receives.
pub type HttpBody = UnsyncBoxBody<Bytes, BoxError>;

pub fn full(data: impl Into<Bytes>) -> HttpBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed_unsync()
}

pub fn empty() -> HttpBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync()
}

// ── ContentType ───────────────────────────────────────────────────────────────

/// Content types the reply helpers and sniffing produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Html, // text/html;charset=utf-8
    Json, // application/json;charset=utf-8
    Text, // text/plain;charset=utf-8
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Html => "text/html;charset=utf-8",
            Self::Json => "application/json;charset=utf-8",
            Self::Text => "text/plain;charset=utf-8",
        }
    }

    pub fn header_value(self) -> HeaderValue {
        HeaderValue::from_static(self.as_str())
    }
}

// ── Data ──────────────────────────────────────────────────────────────────────

/// What a handler wants sent back.
#[derive(Default)]
pub enum Data {
    #[default]
    Empty,
    Bytes(Bytes),
    Text(String),
    Number(serde_json::Number),
    Json(serde_json::Value),
    /// Streamed as-is; never sniffed.
    Stream(HttpBody),
}

impl Data {
    /// `true` for values that produce no body at all.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Bytes(b) => b.is_empty(),
            Self::Text(s) => s.is_empty(),
            _ => false,
        }
    }

    /// Infers a content type from the value's shape.
    ///
    /// Structured values are JSON. Text longer than one character is JSON
    /// when it opens with `{` or `[`, HTML when it opens with `<!`, plain
    /// text otherwise. Numbers are plain text. Bytes, streams and empty
    /// values get nothing.
    pub fn sniff(&self) -> Option<ContentType> {
        match self {
            Self::Json(_) => Some(ContentType::Json),
            Self::Number(_) => Some(ContentType::Text),
            Self::Text(s) if s.len() > 1 => {
                if s.starts_with('{') || s.starts_with('[') {
                    Some(ContentType::Json)
                } else if s.starts_with("<!") {
                    Some(ContentType::Html)
                } else {
                    Some(ContentType::Text)
                }
            }
            Self::Text(s) if !s.is_empty() => Some(ContentType::Text),
            _ => None,
        }
    }

    pub fn into_body(self) -> HttpBody {
        match self {
            Self::Empty => empty(),
            Self::Bytes(b) => full(b),
            Self::Text(s) => full(s),
            Self::Number(n) => full(n.to_string()),
            Self::Json(v) => full(v.to_string()),
            Self::Stream(body) => body,
        }
    }
}

impl std::fmt::Debug for Data {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Bytes(b) => f.debug_tuple("Bytes").field(b).finish(),
            Self::Text(s) => f.debug_tuple("Text").field(s).finish(),
            Self::Number(n) => f.debug_tuple("Number").field(n).finish(),
            Self::Json(v) => f.debug_tuple("Json").field(v).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl From<&str> for Data {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<String> for Data {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Bytes> for Data {
    fn from(b: Bytes) -> Self {
        Self::Bytes(b)
    }
}

impl From<Vec<u8>> for Data {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(b.into())
    }
}

impl From<&'static [u8]> for Data {
    fn from(b: &'static [u8]) -> Self {
        Self::Bytes(Bytes::from_static(b))
    }
}

impl From<serde_json::Value> for Data {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

impl From<i64> for Data {
    fn from(n: i64) -> Self {
        Self::Number(n.into())
    }
}

impl From<u64> for Data {
    fn from(n: u64) -> Self {
        Self::Number(n.into())
    }
}

impl From<HttpBody> for Data {
    fn from(body: HttpBody) -> Self {
        Self::Stream(body)
    }
}

impl From<()> for Data {
    fn from(_: ()) -> Self {
        Self::Empty
    }
}

// ── Assembly ──────────────────────────────────────────────────────────────────

/// Builds the wire response, filling in a sniffed content type if the
/// headers carry none.
pub(crate) fn assemble(status: StatusCode, mut headers: HeaderMap, data: Data) -> Response<HttpBody> {
    if !headers.contains_key(header::CONTENT_TYPE) {
        if let Some(ct) = data.sniff() {
            headers.insert(header::CONTENT_TYPE, ct.header_value());
        }
    }
    let mut response = Response::new(data.into_body());
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// A bodyful response with a plain-text type, used for framework replies
/// (404, 413, ...).
pub(crate) fn plain(status: StatusCode, body: impl Into<Bytes>) -> Response<HttpBody> {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, ContentType::Text.header_value());
    assemble(status, headers, Data::Bytes(body.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sniffs_by_shape() {
        assert_eq!(Data::from("world").sniff(), Some(ContentType::Text));
        assert_eq!(Data::from(r#"{"a":1}"#).sniff(), Some(ContentType::Json));
        assert_eq!(Data::from("[1]").sniff(), Some(ContentType::Json));
        assert_eq!(Data::from("<!doctype html>").sniff(), Some(ContentType::Html));
        assert_eq!(Data::from(json!({"a": 1})).sniff(), Some(ContentType::Json));
        assert_eq!(Data::from(7i64).sniff(), Some(ContentType::Text));
        assert_eq!(Data::from(vec![1u8, 2]).sniff(), None);
        assert_eq!(Data::Empty.sniff(), None);
    }

    #[test]
    fn single_brace_is_text() {
        assert_eq!(Data::from("{").sniff(), Some(ContentType::Text));
    }

    #[test]
    fn explicit_content_type_wins() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/xml"));
        let res = assemble(StatusCode::OK, headers, Data::from("{}"));
        assert_eq!(res.headers()[header::CONTENT_TYPE], "application/xml");
    }

    #[tokio::test]
    async fn json_values_serialize_compactly() {
        let res = assemble(StatusCode::OK, HeaderMap::new(), json!({"a": 1}).into());
        let body = res.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], br#"{"a":1}"#);
    }
}
