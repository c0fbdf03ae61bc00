//! HTTP/1.1 connections.

use std::sync::Arc;

use hyper::server::conn::http1;
use hyper_util::rt::TokioTimer;
use tokio::sync::watch;

use super::conn::{Activity, ConnInfo, drive_connection};
use super::dispatch::Dispatch;
use super::{Service, connection_error};

/// Serves one HTTP/1.1 connection until the client leaves, the idle
/// watchdog fires or the server drains.
pub(crate) async fn serve<I>(
    io: I,
    svc: Arc<Service>,
    info: ConnInfo,
    activity: Arc<Activity>,
    drain: watch::Receiver<bool>,
) where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let mut builder = http1::Builder::new();
    builder
        .timer(TokioTimer::new())
        .header_read_timeout(svc.config.header_timeout())
        .keep_alive(true);

    let conn = builder.serve_connection(io, Dispatch::new(Arc::clone(&svc), info, Arc::clone(&activity)));
    drive_connection!(
        conn,
        activity,
        svc.config.timeout(),
        drain,
        |e: &(dyn std::error::Error + Send + Sync + 'static)| connection_error(&svc.errors, e)
    );
}
