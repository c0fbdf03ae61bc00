//! HTTP server and graceful shutdown.
//!
//! # Graceful shutdown and Kubernetes
//!
//! When Kubernetes terminates a pod it sends **SIGTERM** and waits
//! `terminationGracePeriodSeconds` (default 30 s) before sending SIGKILL.
//!
//! The server reacts by:
//! 1. Immediately stopping `listener.accept()`, so no new connections are made.
//! 2. Asking every open connection to finish its in-flight requests and close.
//! 3. Returning from [`Server::serve`] once all of them are gone.
//!
//! # Connection limits
//!
//! At most `max_conn` connections are served at once. The accept loop takes
//! a semaphore permit *before* accepting, so excess clients wait in the
//! kernel backlog instead of being accepted and dropped.

mod body;
mod conn;
mod dispatch;
mod http1;
mod http2;
mod pool;
mod tls;

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, info_span};

use crate::app::App;
use crate::config::{Config, Protocol};
use crate::context::Services;
use crate::error::Error;
use crate::log::{AccessLogger, ErrorHandler};
use crate::middleware::Chains;
use crate::router::Router;

pub(crate) use body::BodyReader;
pub(crate) use pool::ContextPool;

use conn::{Activity, ConnInfo, ConnectionId, Tracked};

/// Everything a running server reads. Built once by [`App::build`] and
/// shared by every connection task.
pub(crate) struct Service {
    pub(crate) router: Router,
    pub(crate) chains: Chains,
    pub(crate) config: Config,
    pub(crate) errors: ErrorHandler,
    pub(crate) logger: Option<AccessLogger>,
    pub(crate) services: Arc<Services>,
    pub(crate) pool: ContextPool,
}

/// The HTTP server.
pub struct Server {
    addr: SocketAddr,
}

impl Server {
    /// Configures the server to bind to `addr` when [`serve`](Server::serve)
    /// is called.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use strata::Server;
    /// let server = Server::bind("0.0.0.0:3000").unwrap();
    /// ```
    pub fn bind(addr: &str) -> Result<Self, Error> {
        let addr = addr
            .parse()
            .map_err(|e| Error::Config(format!("invalid socket address `{addr}`: {e}")))?;
        Ok(Self { addr })
    }

    /// Starts accepting connections and dispatching them through `app`.
    ///
    /// Returns only after a full graceful shutdown (SIGTERM or Ctrl-C,
    /// followed by all in-flight requests completing). A port that is
    /// already taken is fatal and reported as [`Error::AddrInUse`].
    pub async fn serve(self, app: App) -> Result<(), Error> {
        let listener = match TcpListener::bind(self.addr).await {
            Ok(listener) => listener,
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                error!(addr = %self.addr, "address already in use");
                return Err(Error::AddrInUse(self.addr));
            }
            Err(e) => return Err(e.into()),
        };
        serve_with_shutdown(app, listener, shutdown_signal()).await
    }
}

/// Serves `app` on an already bound listener until `signal` resolves, then
/// drains.
pub async fn serve_with_shutdown<F>(app: App, listener: TcpListener, signal: F) -> Result<(), Error>
where
    F: Future<Output = ()>,
{
    let svc = app.build()?;
    let acceptor = match &svc.config.tls {
        Some(tls) => Some(tls::acceptor(tls, svc.config.protocol)?),
        None => None,
    };

    let addr = listener.local_addr()?;
    info!(%addr, protocol = ?svc.config.protocol, tls = acceptor.is_some(), "strata listening");

    let limit = Arc::new(Semaphore::new(svc.config.max_conn));
    let (drain_tx, drain_rx) = watch::channel(false);

    // JoinSet tracks every spawned connection task so we can wait for
    // them all to finish during graceful shutdown.
    let mut tasks = JoinSet::new();
    tokio::pin!(signal);

    loop {
        let permit = tokio::select! {
            biased;
            () = &mut signal => break,
            permit = Arc::clone(&limit).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let (stream, peer) = tokio::select! {
            biased;
            () = &mut signal => break,
            res = listener.accept() => match res {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("accept error: {e}");
                    continue;
                }
            },
            // Reap finished connection tasks so the JoinSet does not grow
            // without bound on long-running servers.
            Some(_) = tasks.join_next(), if !tasks.is_empty() => continue,
        };

        let info = ConnInfo { id: ConnectionId::new(), peer, secure: acceptor.is_some() };
        let span = info_span!("conn", id = %info.id, %peer);
        let svc = Arc::clone(&svc);
        let acceptor = acceptor.clone();
        let drain = drain_rx.clone();

        tasks.spawn(
            async move {
                let _permit = permit;
                let _ = stream.set_nodelay(true);
                let Some(acceptor) = acceptor else {
                    return serve_stream(stream, svc, info, None, drain).await;
                };

                let handshake = tokio::time::timeout(svc.config.header_timeout(), acceptor.accept(stream)).await;
                let stream = match handshake {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => return svc.errors.report(&e, "tls"),
                    Err(_) => return svc.errors.report(&Error::Timeout, "tls"),
                };
                let alpn = match stream.get_ref().1.alpn_protocol() {
                    Some(b"h2") => Some(Protocol::Http2),
                    Some(b"http/1.1") => Some(Protocol::Http1),
                    _ => None,
                };
                serve_stream(stream, svc, info, alpn, drain).await;
            }
            .instrument(span),
        );
    }

    info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
    let _ = drain_tx.send(true);
    while tasks.join_next().await.is_some() {}

    info!("strata stopped");
    Ok(())
}

/// Picks the protocol engine. ALPN wins; otherwise the configured mode.
async fn serve_stream<S>(
    stream: S,
    svc: Arc<Service>,
    info: ConnInfo,
    alpn: Option<Protocol>,
    drain: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let activity = Activity::new();
    let protocol = alpn.unwrap_or(svc.config.protocol);
    let tracked = Tracked::new(stream, Arc::clone(&activity));
    let tracked = match protocol {
        Protocol::Http1 => tracked.answer_idle(svc.config.timeout(), false),
        Protocol::Auto => tracked.answer_idle(svc.config.timeout(), true),
        Protocol::Http2 => tracked,
    };
    let io = hyper_util::rt::TokioIo::new(tracked);
    match protocol {
        Protocol::Http1 => http1::serve(io, svc, info, activity, drain).await,
        Protocol::Http2 => http2::serve(io, svc, info, activity, drain).await,
        Protocol::Auto => http2::serve_auto(io, svc, info, activity, drain).await,
    }
}

/// Reports a connection-level failure. Clients that simply went away are
/// not errors.
fn connection_error(errors: &ErrorHandler, err: &(dyn std::error::Error + Send + Sync + 'static)) {
    if let Some(e) = err.downcast_ref::<hyper::Error>() {
        let aborted = std::error::Error::source(e)
            .and_then(|s| s.downcast_ref::<Error>())
            .is_some_and(|s| matches!(s, Error::Aborted));
        if e.is_incomplete_message() || e.is_canceled() || aborted {
            debug!("client went away: {e}");
            return;
        }
    }
    errors.report(err, "client");
}

/// Resolves on the first shutdown signal the process receives.
///
/// On Unix this listens for both **SIGTERM** (sent by `kubectl` and the
/// Kubernetes control plane) and **SIGINT** (Ctrl-C, for local dev).
/// On Windows only Ctrl-C is available. A handler that cannot be installed
/// is logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl-C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    // `pending()` is a future that never resolves; on non-Unix platforms
    // the SIGTERM arm is effectively disabled.
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}
