//! Request body ingestion.
//!
//! Pulls the body stream into `ctx.raw_body` before the route handler runs.
//! Reading stops the moment a limit is crossed, so an oversized upload
//! costs at most `max_body` bytes of memory.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::StatusCode;
use http::header::CONTENT_LENGTH;
use http_body_util::BodyExt;
use tokio::time::{Instant, timeout_at};
use tracing::debug;

use crate::context::Context;
use crate::error::Error;
use crate::handler::BoxFuture;
use crate::middleware::{Middleware, Next};
use crate::response::HttpBody;

/// How ingestion ended.
#[derive(Debug, PartialEq, Eq)]
enum Ingest {
    /// Body (possibly empty) is in `ctx.raw_body`; run the handler.
    Complete,
    /// A reply was written, or the client is gone. Skip the handler.
    Stopped,
}

pub(crate) struct BodyReader {
    bad_request: Bytes,
    read_timeout: Duration,
}

impl BodyReader {
    pub(crate) fn new(bad_request: impl Into<Bytes>, read_timeout: Duration) -> Self {
        Self { bad_request: bad_request.into(), read_timeout }
    }

    async fn ingest(&self, ctx: &mut Context) -> Ingest {
        let Some(mut body) = ctx.take_body() else {
            return Ingest::Complete;
        };
        let deadline = Instant::now() + self.read_timeout;

        if !ctx.method.carries_body() {
            return self.expect_empty(ctx, &mut body, deadline).await;
        }

        let declared = ctx
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        if declared.is_some_and(|len| len > ctx.max_body) {
            return too_large(ctx);
        }

        let mut buf = BytesMut::with_capacity(declared.unwrap_or(0));
        loop {
            let frame = match timeout_at(deadline, body.frame()).await {
                Err(_) => {
                    debug!(path = %ctx.path, "request body read timed out");
                    ctx.respond(StatusCode::REQUEST_TIMEOUT, Bytes::new());
                    ctx.close_connection();
                    return Ingest::Stopped;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    debug!(path = %ctx.path, "request body aborted: {e}");
                    ctx.mark_aborted();
                    return Ingest::Stopped;
                }
                Ok(Some(Ok(frame))) => frame,
            };
            if let Ok(data) = frame.into_data() {
                if buf.len() + data.len() > ctx.max_body {
                    return too_large(ctx);
                }
                buf.extend_from_slice(&data);
            }
        }

        ctx.body_length = buf.len();
        ctx.raw_body = buf.freeze();
        Ingest::Complete
    }

    /// GET, HEAD, OPTIONS and TRACE must not send data.
    async fn expect_empty(&self, ctx: &mut Context, body: &mut HttpBody, deadline: Instant) -> Ingest {
        match timeout_at(deadline, body.frame()).await {
            Ok(Some(Ok(frame))) if frame.data_ref().is_some_and(|d| !d.is_empty()) => {
                ctx.respond(StatusCode::BAD_REQUEST, self.bad_request.clone());
                ctx.close_connection();
                Ingest::Stopped
            }
            Ok(Some(Err(_))) => {
                ctx.mark_aborted();
                Ingest::Stopped
            }
            _ => Ingest::Complete,
        }
    }
}

fn too_large(ctx: &mut Context) -> Ingest {
    debug!(path = %ctx.path, max_body = ctx.max_body, "request body too large");
    ctx.respond(StatusCode::PAYLOAD_TOO_LARGE, Bytes::new());
    ctx.close_connection();
    Ingest::Stopped
}

impl Middleware for BodyReader {
    fn call<'a>(&'a self, ctx: &'a mut Context, next: Next<'a>) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            match self.ingest(ctx).await {
                Ingest::Complete => next.run(ctx).await,
                Ingest::Stopped => Ok(()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::pin::Pin;
    use std::task::{Context as TaskContext, Poll};

    use hyper::body::{Body, Frame};

    use super::*;
    use crate::method::Method;
    use crate::response::full;

    fn reader() -> BodyReader {
        BodyReader::new("bad request", Duration::from_secs(5))
    }

    fn ctx(method: Method, body: HttpBody, max_body: usize) -> Context {
        let mut ctx = Context::new();
        ctx.method = method;
        ctx.max_body = max_body;
        ctx.set_request_body(body);
        ctx
    }

    /// Yields `chunks` one by one without announcing a length.
    struct Chunked(Vec<Bytes>);

    impl Body for Chunked {
        type Data = Bytes;
        type Error = Infallible;

        fn poll_frame(
            mut self: Pin<&mut Self>,
            _cx: &mut TaskContext<'_>,
        ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
            if self.0.is_empty() {
                Poll::Ready(None)
            } else {
                Poll::Ready(Some(Ok(Frame::data(self.0.remove(0)))))
            }
        }
    }

    fn chunked(chunks: &[&'static [u8]]) -> HttpBody {
        Chunked(chunks.iter().map(|c| Bytes::from_static(c)).collect())
            .map_err(|never| match never {})
            .boxed_unsync()
    }

    #[tokio::test]
    async fn accumulates_chunks() {
        let mut c = ctx(Method::Post, chunked(&[b"ab", b"cd", b"e"]), 5);
        assert_eq!(reader().ingest(&mut c).await, Ingest::Complete);
        assert_eq!(&c.raw_body[..], b"abcde");
        assert_eq!(c.body_length, 5);
    }

    #[tokio::test]
    async fn one_byte_over_is_413() {
        let mut c = ctx(Method::Post, chunked(&[b"ab", b"cd", b"ef"]), 5);
        assert_eq!(reader().ingest(&mut c).await, Ingest::Stopped);
        assert_eq!(c.take_reply().unwrap().status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(c.close_connection);
        assert!(c.raw_body.is_empty());
    }

    #[tokio::test]
    async fn declared_length_is_checked_before_reading() {
        let mut c = ctx(Method::Put, full(vec![0u8; 3]), 5);
        c.headers.insert(CONTENT_LENGTH, "6".parse().unwrap());
        assert_eq!(reader().ingest(&mut c).await, Ingest::Stopped);
        assert_eq!(c.take_reply().unwrap().status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn data_on_get_is_400() {
        let mut c = ctx(Method::Get, full("oops"), 100);
        assert_eq!(reader().ingest(&mut c).await, Ingest::Stopped);
        assert_eq!(c.take_reply().unwrap().status(), StatusCode::BAD_REQUEST);

        let mut c = ctx(Method::Get, crate::response::empty(), 100);
        assert_eq!(reader().ingest(&mut c).await, Ingest::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_body_times_out_with_408() {
        struct Stalled;
        impl Body for Stalled {
            type Data = Bytes;
            type Error = Infallible;
            fn poll_frame(
                self: Pin<&mut Self>,
                _cx: &mut TaskContext<'_>,
            ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
                Poll::Pending
            }
        }

        let body = Stalled.map_err(|never| match never {}).boxed_unsync();
        let mut c = ctx(Method::Post, body, 100);
        assert_eq!(reader().ingest(&mut c).await, Ingest::Stopped);
        assert_eq!(c.take_reply().unwrap().status(), StatusCode::REQUEST_TIMEOUT);
    }
}
