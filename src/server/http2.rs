//! HTTP/2 sessions, and the auto-detecting mode that serves either protocol.
//!
//! Each stream runs under its own timeout (`stream_timeout_ms`) inside the
//! dispatcher, so one stalled stream cannot pin an otherwise busy session.
//! The session itself is subject to the same idle watchdog as an HTTP/1
//! connection.

use std::sync::Arc;

use hyper::server::conn::http2;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use hyper_util::server::conn::auto;
use tokio::sync::watch;

use super::conn::{Activity, ConnInfo, drive_connection};
use super::dispatch::Dispatch;
use super::{Service, connection_error};

pub(crate) async fn serve<I>(
    io: I,
    svc: Arc<Service>,
    info: ConnInfo,
    activity: Arc<Activity>,
    drain: watch::Receiver<bool>,
) where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let config = &svc.config;
    let mut builder = http2::Builder::new(TokioExecutor::new());
    builder
        .timer(TokioTimer::new())
        .max_concurrent_streams(config.max_concurrent_streams)
        .max_header_list_size(config.max_header_list_size);

    let conn = builder.serve_connection(io, Dispatch::new(Arc::clone(&svc), info, Arc::clone(&activity)));
    drive_connection!(
        conn,
        activity,
        config.timeout(),
        drain,
        |e: &(dyn std::error::Error + Send + Sync + 'static)| connection_error(&svc.errors, e)
    );
}

/// Reads the connection preface and serves HTTP/2 or HTTP/1.1 accordingly.
pub(crate) async fn serve_auto<I>(
    io: I,
    svc: Arc<Service>,
    info: ConnInfo,
    activity: Arc<Activity>,
    drain: watch::Receiver<bool>,
) where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let config = &svc.config;
    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(config.header_timeout())
        .keep_alive(true);
    builder
        .http2()
        .timer(TokioTimer::new())
        .max_concurrent_streams(config.max_concurrent_streams)
        .max_header_list_size(config.max_header_list_size);

    let conn = builder.serve_connection(io, Dispatch::new(Arc::clone(&svc), info, Arc::clone(&activity)));
    drive_connection!(
        conn,
        activity,
        config.timeout(),
        drain,
        |e: &(dyn std::error::Error + Send + Sync + 'static)| connection_error(&svc.errors, e)
    );
}
