//! Moving one request and its response between the two legs.
//!
//! The upstream request body is the downstream body stream itself, and the
//! downstream response body is the upstream one wrapped in [`RelayBody`], so
//! hyper's flow control applies end to end: a slow reader on either side
//! stops reads on the other.
//!
//! Every way a relay can end (upstream end, upstream error, idle timeout,
//! downstream going away) funnels into [`Settle`], which reports exactly
//! one [`Outcome`].

use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Request, Response, Uri, Version};
use hyper::body::{Body, Frame, SizeHint};
use tokio::sync::oneshot;
use tokio::time::{Instant, Sleep};

use super::pool::Lease;
use crate::error::{BoxError, ProxyError};
use crate::response::HttpBody;

/// Connection-scoped headers that never cross the proxy.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
    "proxy-authorization",
];

/// How a relay ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The upstream body ended and every byte was handed downstream.
    Done { bytes: u64 },
    Failed(String),
    TimedOut,
    /// The downstream side stopped reading first.
    Aborted,
}

/// One-shot settlement shared by every path that can end a relay.
pub struct Settle {
    tx: Mutex<Option<oneshot::Sender<Outcome>>>,
}

impl Settle {
    pub fn new() -> (Self, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Mutex::new(Some(tx)) }, rx)
    }

    /// Reports `outcome` if nothing was reported yet. Returns whether this
    /// call settled the relay.
    pub fn settle(&self, outcome: Outcome) -> bool {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        match tx {
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }
}

/// Upstream response body on its way downstream.
///
/// Fails the stream after `idle` without a frame. Holds the session lease
/// until the body is finished, so the stream counts as alive until then.
pub struct RelayBody<B> {
    inner: B,
    idle: Duration,
    timer: Pin<Box<Sleep>>,
    settle: Settle,
    lease: Option<Lease>,
    bytes: u64,
}

impl<B> RelayBody<B> {
    pub fn new(inner: B, idle: Duration, settle: Settle, lease: Option<Lease>) -> Self {
        Self {
            inner,
            idle,
            timer: Box::pin(tokio::time::sleep(idle)),
            settle,
            lease,
            bytes: 0,
        }
    }

    fn finish(&mut self, outcome: Outcome) {
        self.settle.settle(outcome);
        self.lease = None;
    }
}

impl<B> Body for RelayBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        let this = self.get_mut();
        if this.settle.is_settled() {
            return Poll::Ready(None);
        }
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.bytes += data.len() as u64;
                }
                let deadline = Instant::now() + this.idle;
                this.timer.as_mut().reset(deadline);
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                let err: BoxError = e.into();
                this.finish(Outcome::Failed(err.to_string()));
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                let bytes = this.bytes;
                this.finish(Outcome::Done { bytes });
                Poll::Ready(None)
            }
            Poll::Pending => {
                if this.timer.as_mut().poll(cx).is_ready() {
                    this.finish(Outcome::TimedOut);
                    return Poll::Ready(Some(Err(ProxyError::RequestTimeout.into())));
                }
                Poll::Pending
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.settle.is_settled() || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<B> Drop for RelayBody<B> {
    fn drop(&mut self) {
        self.settle.settle(Outcome::Aborted);
    }
}

/// Strips hop-by-hop headers, including any named by `connection`.
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::try_from(name.trim()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Parts of the upstream request decided by the proxy middleware.
pub(crate) struct Forward<'a> {
    pub(crate) method: http::Method,
    pub(crate) scheme: &'static str,
    pub(crate) host: &'a str,
    pub(crate) path: &'a str,
    pub(crate) http2: bool,
    pub(crate) headers: HeaderMap,
}

/// Builds the upstream request. HTTP/2 carries the host as `:authority`,
/// HTTP/1.1 as a `host` header with an origin-form target.
pub(crate) fn upstream_request(fwd: Forward<'_>, body: HttpBody) -> Result<Request<HttpBody>, http::Error> {
    let mut headers = fwd.headers;
    strip_hop_by_hop(&mut headers);

    let (uri, version) = if fwd.http2 {
        headers.remove(header::HOST);
        let uri = Uri::builder()
            .scheme(fwd.scheme)
            .authority(fwd.host)
            .path_and_query(fwd.path)
            .build()?;
        (uri, Version::HTTP_2)
    } else {
        if !headers.contains_key(header::HOST) {
            headers.insert(header::HOST, HeaderValue::try_from(fwd.host)?);
        }
        (Uri::try_from(fwd.path)?, Version::HTTP_11)
    };

    let mut req = Request::builder().method(fwd.method).uri(uri).version(version).body(body)?;
    *req.headers_mut() = headers;
    Ok(req)
}

/// Rebuilds the upstream response for the downstream leg.
pub(crate) fn downstream_response<B>(resp: Response<B>) -> (http::response::Parts, B) {
    let (mut parts, body) = resp.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    parts.version = Version::default();
    (parts, body)
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use http_body_util::{BodyExt, Full, StreamBody};

    use super::*;
    use crate::response::empty;

    #[test]
    fn settles_exactly_once() {
        let (settle, mut rx) = Settle::new();
        assert!(settle.settle(Outcome::TimedOut));
        assert!(!settle.settle(Outcome::Done { bytes: 3 }));
        assert!(!settle.settle(Outcome::Aborted));
        assert_eq!(rx.try_recv().unwrap(), Outcome::TimedOut);
    }

    #[tokio::test]
    async fn completed_body_reports_done() {
        let (settle, rx) = Settle::new();
        let body = RelayBody::new(Full::new(Bytes::from_static(b"hello")), Duration::from_secs(5), settle, None);
        let bytes = body.collect().await.unwrap().to_bytes();
        assert_eq!(bytes, "hello");
        assert_eq!(rx.await.unwrap(), Outcome::Done { bytes: 5 });
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_upstream_times_out_once() {
        let (settle, rx) = Settle::new();
        let stalled = StreamBody::new(futures_util::stream::pending::<Result<Frame<Bytes>, Infallible>>());
        let mut body = RelayBody::new(stalled, Duration::from_millis(100), settle, None);

        let err = body.frame().await.unwrap().unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err}");
        assert!(body.frame().await.is_none());
        drop(body);
        assert_eq!(rx.await.unwrap(), Outcome::TimedOut);
    }

    #[tokio::test]
    async fn dropped_body_reports_aborted() {
        let (settle, rx) = Settle::new();
        drop(RelayBody::new(Full::new(Bytes::from_static(b"x")), Duration::from_secs(5), settle, None));
        assert_eq!(rx.await.unwrap(), Outcome::Aborted);
    }

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive, x-trace"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-trace", HeaderValue::from_static("1"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("x-kept", HeaderValue::from_static("yes"));
        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers["x-kept"], "yes");
    }

    #[test]
    fn http2_requests_carry_authority() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("api.test"));
        let fwd = Forward {
            method: http::Method::GET,
            scheme: "http",
            host: "api.test",
            path: "/v1/users?id=7",
            http2: true,
            headers,
        };
        let req = upstream_request(fwd, empty()).unwrap();
        assert_eq!(req.uri(), "http://api.test/v1/users?id=7");
        assert_eq!(req.version(), Version::HTTP_2);
        assert!(req.headers().get("host").is_none());
    }

    #[test]
    fn http1_requests_keep_host() {
        let fwd = Forward {
            method: http::Method::POST,
            scheme: "http",
            host: "api.test",
            path: "/submit",
            http2: false,
            headers: HeaderMap::new(),
        };
        let req = upstream_request(fwd, empty()).unwrap();
        assert_eq!(req.uri(), "/submit");
        assert_eq!(req.headers()["host"], "api.test");
    }
}
