//! Upstream session pool.
//!
//! One pool per backend. A session is one upstream connection: an HTTP/2
//! session multiplexing up to `max_alive_streams` requests, or an HTTP/1.1
//! connection carrying one request at a time. Each session's connection
//! future runs on its own driver task; when it ends the session leaves the
//! pool, and an empty pool schedules a reconnect whose delay grows with the
//! number of consecutive failed connects.
//!
//! The session map sits behind a `std` mutex that is never held across an
//! `.await`; every lookup-and-evict pass happens in one critical section.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use http::{Request, Response};
use hyper::body::Incoming;
use hyper::client::conn::{http1, http2};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use rustls::pki_types::ServerName;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::AbortHandle;
use tokio_rustls::TlsConnector;
use tracing::debug;
use uuid::Uuid;

use super::backoff::reconnect_delay;
use super::config::{Endpoint, UpstreamProtocol};
use crate::error::ProxyError;
use crate::handler::BoxFuture;
use crate::response::HttpBody;

/// Sessions that have issued this many streams are retired.
const MAX_STREAM_ID: u64 = 90_000;

/// Sizing and timing of one pool.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Sessions opened by [`Pool::warm_up`].
    pub max: usize,
    /// Sessions kept for reuse. Extra sessions serve one lease and close.
    pub pool_max: usize,
    /// Sessions (open or connecting) beyond which `connect` is refused.
    pub max_connect: usize,
    pub max_alive_streams: usize,
    /// Idle sessions older than this are evicted.
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub reconn_delay: Duration,
    pub protocol: UpstreamProtocol,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max: 50,
            pool_max: 75,
            max_connect: 575,
            max_alive_streams: 100,
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(15),
            reconn_delay: Duration::from_millis(500),
            protocol: UpstreamProtocol::Http1,
        }
    }
}

/// Serializable snapshot returned by [`Pool::status`].
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub total: usize,
    pub sessions: Vec<SessionStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub id: String,
    pub stream_count: u64,
    pub alive_streams: usize,
    pub connected: bool,
}

enum Sender {
    Http1(tokio::sync::Mutex<http1::SendRequest<HttpBody>>),
    Http2(http2::SendRequest<HttpBody>),
}

impl Sender {
    fn is_closed(&self) -> bool {
        match self {
            // A held lock means a request is in flight on a live connection.
            Self::Http1(tx) => tx.try_lock().map(|tx| tx.is_closed()).unwrap_or(false),
            Self::Http2(tx) => tx.is_closed(),
        }
    }
}

/// One pooled upstream connection.
pub(crate) struct Session {
    id: String,
    sender: Sender,
    connected: AtomicBool,
    stream_count: AtomicU64,
    alive_streams: AtomicUsize,
    epoch: Instant,
    last_used_ms: AtomicU64,
    driver: AbortHandle,
}

impl Session {
    fn new(id: String, sender: Sender, driver: AbortHandle) -> Self {
        Self {
            id,
            sender,
            connected: AtomicBool::new(true),
            stream_count: AtomicU64::new(0),
            alive_streams: AtomicUsize::new(0),
            epoch: Instant::now(),
            last_used_ms: AtomicU64::new(0),
            driver,
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.sender.is_closed()
    }

    fn alive_streams(&self) -> usize {
        self.alive_streams.load(Ordering::Acquire)
    }

    fn touch(&self) {
        let ms = self.epoch.elapsed().as_millis() as u64;
        self.last_used_ms.store(ms, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_used_ms.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last)
    }

    fn is_usable(&self, idle_timeout: Duration) -> bool {
        self.is_connected()
            && self.stream_count.load(Ordering::Relaxed) < MAX_STREAM_ID
            && (self.alive_streams() > 0 || self.idle_for() < idle_timeout)
    }

    /// Claims a stream slot if fewer than `limit` are in use.
    fn try_lease(self: &Arc<Self>, limit: usize) -> Option<Lease> {
        self.alive_streams
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then_some(n + 1))
            .ok()?;
        self.touch();
        Some(Lease { session: Arc::clone(self) })
    }

    fn lease(self: &Arc<Self>) -> Lease {
        self.alive_streams.fetch_add(1, Ordering::AcqRel);
        self.touch();
        Lease { session: Arc::clone(self) }
    }

    /// Stops handing the session out. An idle session is torn down at once;
    /// a busy one closes when its last lease is gone.
    fn close(&self) {
        self.connected.store(false, Ordering::Release);
        if self.alive_streams() == 0 {
            self.driver.abort();
        }
    }
}

/// The right to run one request on a session. Dropping it frees the slot.
pub struct Lease {
    session: Arc<Session>,
}

impl Lease {
    pub fn session_id(&self) -> &str {
        &self.session.id
    }

    /// Retires the session after a failed exchange. It is torn down once
    /// its last lease is gone and evicted on the next lookup.
    pub fn discard(&self) {
        self.session.connected.store(false, Ordering::Release);
    }

    /// Issues `req` on the leased session and waits for the response head.
    pub async fn send(&self, req: Request<HttpBody>) -> Result<Response<Incoming>, ProxyError> {
        let session = &self.session;
        session.stream_count.fetch_add(1, Ordering::Relaxed);
        if !session.is_connected() {
            return Err(ProxyError::NotConnected);
        }
        let res = match &session.sender {
            Sender::Http1(tx) => {
                let mut tx = tx.lock().await;
                tx.ready().await.map_err(upstream_failed)?;
                tx.send_request(req).await
            }
            Sender::Http2(tx) => {
                let mut tx = tx.clone();
                tx.send_request(req).await
            }
        };
        res.map_err(upstream_failed)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.session.alive_streams.fetch_sub(1, Ordering::AcqRel);
        self.session.touch();
        if !self.session.connected.load(Ordering::Acquire) && self.session.alive_streams() == 0 {
            self.session.driver.abort();
        }
    }
}

#[derive(Default)]
struct PoolState {
    sessions: HashMap<String, Arc<Session>>,
    connecting: usize,
    failed: u32,
    reconnecting: bool,
}

/// Sessions to one backend.
pub struct Pool {
    endpoint: Endpoint,
    tls: Option<TlsConnector>,
    opts: PoolOptions,
    state: Mutex<PoolState>,
    shut: AtomicBool,
    this: Weak<Pool>,
}

impl Pool {
    pub(crate) fn new(endpoint: Endpoint, tls: Option<TlsConnector>, opts: PoolOptions) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            endpoint,
            tls,
            opts,
            state: Mutex::new(PoolState::default()),
            shut: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn url(&self) -> String {
        format!("{}://{}", self.endpoint.scheme(), self.endpoint.addr())
    }

    pub(crate) fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn protocol(&self) -> UpstreamProtocol {
        self.opts.protocol
    }

    fn stream_limit(&self) -> usize {
        match self.opts.protocol {
            UpstreamProtocol::Http1 => 1,
            UpstreamProtocol::Http2 => self.opts.max_alive_streams,
        }
    }

    /// `true` while at least one pooled session is connected.
    pub fn ok(&self) -> bool {
        self.state().sessions.values().any(|s| s.is_connected())
    }

    /// A stream slot on a pooled session, or on a freshly connected one when
    /// every pooled session is busy. Sessions found unusable on the way are
    /// closed and evicted.
    pub async fn get_session(&self) -> Result<Lease, ProxyError> {
        if let Some(lease) = self.lease_pooled() {
            return Ok(lease);
        }
        self.connect().await
    }

    fn lease_pooled(&self) -> Option<Lease> {
        let limit = self.stream_limit();
        let mut state = self.state();
        let mut dead = Vec::new();
        let mut found = None;
        for (id, session) in &state.sessions {
            if !session.is_usable(self.opts.timeout) {
                session.close();
                dead.push(id.clone());
                continue;
            }
            if let Some(lease) = session.try_lease(limit) {
                found = Some(lease);
                break;
            }
        }
        for id in dead {
            debug!(backend = %self.url(), session = %id, "evicting upstream session");
            state.sessions.remove(&id);
        }
        found
    }

    /// Opens a new session and leases it to the caller. The session joins the
    /// pool if there is room.
    pub async fn connect(&self) -> Result<Lease, ProxyError> {
        let _pending = {
            let mut state = self.state();
            if state.sessions.len() + state.connecting >= self.opts.max_connect {
                return Err(ProxyError::Exhausted);
            }
            state.connecting += 1;
            Pending(self)
        };

        let opened = match tokio::time::timeout(self.opts.connect_timeout, self.open()).await {
            Ok(opened) => opened,
            Err(_) => Err(ProxyError::ConnectTimeout),
        };

        let mut state = self.state();
        match opened {
            Ok(session) => {
                state.failed = state.failed.saturating_sub(1);
                let lease = session.lease();
                if state.sessions.len() < self.opts.pool_max {
                    state.sessions.insert(session.id.clone(), session);
                }
                debug!(backend = %self.url(), session = %lease.session_id(), "upstream session connected");
                Ok(lease)
            }
            Err(e) => {
                state.failed = state.failed.saturating_add(1);
                debug!(backend = %self.url(), failed = state.failed, "upstream connect failed: {e}");
                Err(e)
            }
        }
    }

    async fn open(&self) -> Result<Arc<Session>, ProxyError> {
        let tcp = TcpStream::connect(self.endpoint.addr()).await.map_err(connect_failed)?;
        let _ = tcp.set_nodelay(true);
        match &self.tls {
            None => self.handshake(tcp).await,
            Some(connector) => {
                let name = ServerName::try_from(self.endpoint.host.clone()).map_err(connect_failed)?;
                let tls = connector.connect(name, tcp).await.map_err(connect_failed)?;
                self.handshake(tls).await
            }
        }
    }

    async fn handshake<S>(&self, io: S) -> Result<Arc<Session>, ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(io);
        let (sender, conn) = match self.opts.protocol {
            UpstreamProtocol::Http1 => {
                let (tx, conn) = http1::handshake(io).await.map_err(connect_failed)?;
                let conn: BoxFuture<'static, hyper::Result<()>> = Box::pin(conn);
                (Sender::Http1(tokio::sync::Mutex::new(tx)), conn)
            }
            UpstreamProtocol::Http2 => {
                let (tx, conn) = http2::Builder::new(TokioExecutor::new())
                    .timer(TokioTimer::new())
                    .handshake(io)
                    .await
                    .map_err(connect_failed)?;
                let conn: BoxFuture<'static, hyper::Result<()>> = Box::pin(conn);
                (Sender::Http2(tx), conn)
            }
        };

        let id = Uuid::new_v4().simple().to_string();
        let pool = self.this.clone();
        let backend = self.url();
        let session_id = id.clone();
        let driver = tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(%backend, session = %session_id, "upstream session ended: {e}");
            }
            if let Some(pool) = pool.upgrade() {
                pool.session_closed(&session_id);
            }
        });
        Ok(Arc::new(Session::new(id, sender, driver.abort_handle())))
    }

    fn session_closed(&self, id: &str) {
        let empty = {
            let mut state = self.state();
            if let Some(session) = state.sessions.remove(id) {
                session.connected.store(false, Ordering::Release);
            }
            state.sessions.is_empty()
        };
        if empty {
            self.delay_connect();
        }
    }

    /// Schedules one reconnect after `reconn_delay` plus the failure backoff.
    /// Returns `false` when one is already pending.
    pub fn delay_connect(&self) -> bool {
        if self.shut.load(Ordering::Acquire) {
            return false;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return false;
        };
        let Some(pool) = self.this.upgrade() else {
            return false;
        };
        let delay = {
            let mut state = self.state();
            if state.reconnecting {
                return false;
            }
            state.reconnecting = true;
            self.opts.reconn_delay + reconnect_delay(state.failed)
        };
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            // The lease is dropped right away; the session stays pooled.
            let _ = pool.connect().await;
            pool.state().reconnecting = false;
        });
        true
    }

    /// Opens `max` sessions in the background.
    pub fn warm_up(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        for _ in 0..self.opts.max {
            let Some(pool) = self.this.upgrade() else {
                return;
            };
            runtime.spawn(async move {
                let _ = pool.connect().await;
            });
        }
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.state();
        PoolStatus {
            total: state.sessions.len(),
            sessions: state
                .sessions
                .values()
                .map(|s| SessionStatus {
                    id: s.id.clone(),
                    stream_count: s.stream_count.load(Ordering::Relaxed),
                    alive_streams: s.alive_streams(),
                    connected: s.is_connected(),
                })
                .collect(),
        }
    }

    /// Closes every session and stops reconnecting.
    pub fn close_all(&self) {
        self.shut.store(true, Ordering::Release);
        let sessions: Vec<_> = self.state().sessions.drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close();
        }
    }
}

/// Counts an in-progress connect against `max_connect`, even if the caller
/// gives up halfway.
struct Pending<'a>(&'a Pool);

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        let mut state = self.0.state();
        state.connecting = state.connecting.saturating_sub(1);
    }
}

fn connect_failed(e: impl std::fmt::Display) -> ProxyError {
    ProxyError::Connect(e.to_string())
}

fn upstream_failed(e: hyper::Error) -> ProxyError {
    ProxyError::Upstream(e.to_string())
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::net::SocketAddr;

    use bytes::Bytes;
    use http_body_util::{BodyExt, Full};
    use hyper::service::service_fn;
    use tokio::net::TcpListener;

    use super::*;
    use crate::proxy::config::parse_backend_url;
    use crate::response::empty;

    fn pool_for(addr: SocketAddr, opts: PoolOptions) -> Arc<Pool> {
        let endpoint = parse_backend_url(&format!("http://{addr}")).unwrap();
        Pool::new(endpoint, None, opts)
    }

    async fn upstream() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let svc = service_fn(|_req| async {
                        Ok::<_, Infallible>(hyper::Response::new(Full::new(Bytes::from_static(b"ok"))))
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), svc)
                        .await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn refuses_beyond_max_connect() {
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let pool = pool_for(addr, PoolOptions { max_connect: 0, ..PoolOptions::default() });
        assert_eq!(pool.connect().await.err(), Some(ProxyError::Exhausted));
    }

    #[tokio::test]
    async fn refused_connect_counts_a_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let pool = pool_for(addr, PoolOptions::default());
        assert!(matches!(pool.connect().await, Err(ProxyError::Connect(_))));
        assert!(!pool.ok());
        assert_eq!(pool.status().total, 0);
        assert_eq!(pool.state().failed, 1);
        assert_eq!(pool.state().connecting, 0);
    }

    #[tokio::test]
    async fn http1_sessions_are_reused_one_request_at_a_time() {
        let pool = pool_for(upstream().await, PoolOptions::default());

        let first = pool.get_session().await.unwrap();
        let id = first.session_id().to_owned();
        let req = Request::get("/").header("host", "up").body(empty()).unwrap();
        let resp = first.send(req).await.unwrap();
        assert_eq!(resp.into_body().collect().await.unwrap().to_bytes(), "ok");
        assert!(pool.ok());

        // busy: a second caller gets its own session
        let second = pool.get_session().await.unwrap();
        assert_ne!(second.session_id(), id);
        drop(second);
        drop(first);

        let again = pool.get_session().await.unwrap();
        assert!(pool.status().sessions.iter().any(|s| s.id == again.session_id()));
        assert_eq!(pool.status().total, 2);
    }

    #[tokio::test]
    async fn close_all_empties_the_pool_for_good() {
        let pool = pool_for(upstream().await, PoolOptions::default());
        drop(pool.get_session().await.unwrap());
        assert!(pool.ok());

        pool.close_all();
        assert!(!pool.ok());
        assert_eq!(pool.status().total, 0);
        assert!(!pool.delay_connect());
    }
}
