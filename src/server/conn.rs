//! Per-connection plumbing: ids, activity tracking and the idle watchdog.
//!
//! An idle HTTP/1 socket is answered with `408 Request Timeout` before it is
//! closed. The answer is written by [`Tracked`] from inside the read that
//! stalled, since hyper owns the transport while it waits for a request.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::task::{Context, Poll, ready};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;
use tracing::debug;

const IDLE_REPLY: &[u8] = b"HTTP/1.1 408 Request Timeout\r\nconnection: close\r\ncontent-length: 0\r\n\r\n";

static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection, for tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// What the dispatcher needs to know about the connection a request came in on.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConnInfo {
    pub(crate) id: ConnectionId,
    pub(crate) peer: SocketAddr,
    pub(crate) secure: bool,
}

/// Last time bytes moved on a connection, and how many responses are still
/// being produced or written on it.
#[derive(Debug)]
pub(crate) struct Activity {
    epoch: Instant,
    last_ms: AtomicU64,
    in_flight: AtomicUsize,
    answers_idle: AtomicBool,
}

impl Activity {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            epoch: Instant::now(),
            last_ms: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            answers_idle: AtomicBool::new(false),
        })
    }

    /// Marks one response in flight until the guard is dropped.
    pub(crate) fn busy(self: &Arc<Self>) -> Busy {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        Busy(Arc::clone(self))
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// `true` while the transport will write its own 408 on idle.
    pub(crate) fn answers_idle(&self) -> bool {
        self.answers_idle.load(Ordering::Acquire)
    }

    fn touch(&self) {
        let ms = self.epoch.elapsed().as_millis() as u64;
        self.last_ms.store(ms, Ordering::Relaxed);
    }

    pub(crate) fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last)
    }
}

pub(crate) struct Busy(Arc<Activity>);

impl Drop for Busy {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Stream wrapper that records activity on every successful read or write.
///
/// With [`answer_idle`](Self::answer_idle) it also writes the HTTP/1 idle
/// 408 and then reports end of stream to its reader.
pub(crate) struct Tracked<S> {
    inner: S,
    activity: Arc<Activity>,
    idle_reply: Option<IdleReply>,
    sniff: bool,
}

struct IdleReply {
    idle: Duration,
    timer: Pin<Box<Sleep>>,
    state: IdleState,
}

enum IdleState {
    Watching,
    Answering(usize),
    Answered,
}

impl<S> Tracked<S> {
    pub(crate) fn new(inner: S, activity: Arc<Activity>) -> Self {
        Self { inner, activity, idle_reply: None, sniff: false }
    }

    /// Answers 408 once the connection has been quiet for `idle` with no
    /// response in flight. With `sniff`, an HTTP/2 preface on the first read
    /// switches this off again.
    pub(crate) fn answer_idle(mut self, idle: Duration, sniff: bool) -> Self {
        self.idle_reply = Some(IdleReply {
            idle,
            timer: Box::pin(tokio::time::sleep(idle)),
            state: IdleState::Watching,
        });
        self.sniff = sniff;
        self.activity.answers_idle.store(true, Ordering::Release);
        self
    }
}

impl<S: AsyncWrite + Unpin> Tracked<S> {
    /// Called while a read is pending. Stays pending until the idle answer
    /// has been written, then yields end of stream.
    fn poll_idle_reply(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let Self { inner, activity, idle_reply, .. } = self;
        let Some(reply) = idle_reply.as_mut() else {
            return Poll::Pending;
        };
        loop {
            match reply.state {
                IdleState::Watching => {
                    ready!(reply.timer.as_mut().poll(cx));
                    let quiet = activity.idle_for();
                    let next = if quiet < reply.idle {
                        reply.idle - quiet
                    } else if activity.in_flight() > 0 {
                        reply.idle
                    } else {
                        debug!("idle connection, answering 408");
                        reply.state = IdleState::Answering(0);
                        continue;
                    };
                    reply.timer.as_mut().reset(tokio::time::Instant::now() + next);
                }
                IdleState::Answering(sent) if sent < IDLE_REPLY.len() => {
                    let n = ready!(Pin::new(&mut *inner).poll_write(cx, &IDLE_REPLY[sent..]))?;
                    if n == 0 {
                        return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                    }
                    reply.state = IdleState::Answering(sent + n);
                }
                IdleState::Answering(_) => {
                    ready!(Pin::new(&mut *inner).poll_flush(cx))?;
                    reply.state = IdleState::Answered;
                    activity.answers_idle.store(false, Ordering::Release);
                }
                IdleState::Answered => return Poll::Ready(Ok(())),
            }
        }
    }
}

/// First bytes of the HTTP/2 connection preface.
fn is_h2_preface(data: &[u8]) -> bool {
    const PREFACE: &[u8] = b"PRI * HTTP/2.0";
    let n = data.len().min(PREFACE.len());
    data[..n] == PREFACE[..n]
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for Tracked<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if matches!(this.idle_reply, Some(IdleReply { state: IdleState::Answered, .. })) {
            return Poll::Ready(Ok(()));
        }
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) if buf.filled().len() > before => {
                this.activity.touch();
                if std::mem::take(&mut this.sniff) && is_h2_preface(&buf.filled()[before..]) {
                    this.idle_reply = None;
                    this.activity.answers_idle.store(false, Ordering::Release);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Pending => this.poll_idle_reply(cx),
            res => res,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Tracked<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let res = Pin::new(&mut self.inner).poll_write(cx, buf);
        if matches!(res, Poll::Ready(Ok(n)) if n > 0) {
            self.activity.touch();
        }
        res
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let res = Pin::new(&mut self.inner).poll_write_vectored(cx, bufs);
        if matches!(res, Poll::Ready(Ok(n)) if n > 0) {
            self.activity.touch();
        }
        res
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Drives a hyper connection future under an idle watchdog and the server's
/// drain signal.
///
/// After `idle` without traffic the connection is asked to shut down
/// gracefully; if it is still quiet one more `idle` later it is dropped,
/// which closes the socket. When the transport answers idle sockets itself
/// and nothing is in flight, only the drop stage applies.
macro_rules! drive_connection {
    ($conn:expr, $activity:expr, $idle:expr, $drain:expr, $on_error:expr) => {{
        let conn = $conn;
        tokio::pin!(conn);
        let activity = $activity;
        let idle: std::time::Duration = $idle;
        let mut drain = $drain;
        let on_error = $on_error;
        let watchdog = tokio::time::sleep(idle);
        tokio::pin!(watchdog);
        let mut closing = false;
        let mut deferred = false;
        loop {
            tokio::select! {
                res = conn.as_mut() => {
                    if let Err(e) = res {
                        let err: $crate::error::BoxError = e.into();
                        on_error(&*err);
                    }
                    break;
                }
                () = &mut watchdog => {
                    let quiet = activity.idle_for();
                    if quiet < idle {
                        deferred = false;
                        watchdog.as_mut().reset(tokio::time::Instant::now() + (idle - quiet));
                        continue;
                    }
                    if closing || deferred {
                        tracing::debug!("idle connection destroyed");
                        break;
                    }
                    if activity.answers_idle() && activity.in_flight() == 0 {
                        deferred = true;
                        watchdog.as_mut().reset(tokio::time::Instant::now() + idle);
                        continue;
                    }
                    tracing::debug!("idle connection, shutting down");
                    conn.as_mut().graceful_shutdown();
                    closing = true;
                    watchdog.as_mut().reset(tokio::time::Instant::now() + idle);
                }
                _ = drain.changed(), if !closing => {
                    conn.as_mut().graceful_shutdown();
                    closing = true;
                }
            }
        }
    }};
}

pub(crate) use drive_connection;
