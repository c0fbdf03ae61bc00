//! Request dispatch: the per-request hot path shared by both protocols.

use std::sync::Arc;

use bytes::Bytes;
use http::header::{CONNECTION, HOST};
use http::{HeaderValue, Request, Response, StatusCode, Version};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use tracing::debug;

use super::Service;
use super::conn::{Activity, ConnInfo};
use crate::context::Context;
use crate::error::Error;
use crate::handler::BoxFuture;
use crate::log::{AccessRecord, truncate};
use crate::method::Method;
use crate::query::parse_url;
use crate::response::{self, HttpBody};

/// hyper-facing service for one connection.
#[derive(Clone)]
pub(crate) struct Dispatch {
    svc: Arc<Service>,
    info: ConnInfo,
    activity: Arc<Activity>,
}

impl Dispatch {
    pub(crate) fn new(svc: Arc<Service>, info: ConnInfo, activity: Arc<Activity>) -> Self {
        Self { svc, info, activity }
    }
}

impl hyper::service::Service<Request<Incoming>> for Dispatch {
    type Response = Response<HttpBody>;
    type Error = Error;
    type Future = BoxFuture<'static, Result<Response<HttpBody>, Error>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        // held until the reply body has been written out
        let busy = self.activity.busy();
        let run = handle(Arc::clone(&self.svc), req, self.info);
        Box::pin(async move {
            let reply = run.await?;
            Ok(reply.map(|body| {
                body.map_frame(move |frame| {
                    let _held = &busy;
                    frame
                })
                .boxed_unsync()
            }))
        })
    }
}

/// Routes one request and runs its group's chain.
///
/// Returning `Err` makes hyper drop the connection (HTTP/1) or reset the
/// stream (HTTP/2); that only happens when the client aborted mid-request.
pub(crate) async fn handle(
    svc: Arc<Service>,
    req: Request<Incoming>,
    info: ConnInfo,
) -> Result<Response<HttpBody>, Error> {
    let h2 = req.version() == Version::HTTP_2;
    let config = &svc.config;
    let scheme = if info.secure { "https" } else { "http" };

    let target = req.uri().path_and_query().map_or("/", |pq| pq.as_str());
    let target = truncate(target, config.max_url_length).to_owned();
    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))
        .unwrap_or("")
        .to_owned();

    let access = svc.logger.as_ref().map(|_| {
        AccessRecord::new(
            req.method().as_str(),
            0,
            &info.peer.ip().to_string(),
            scheme,
            &host,
            &target,
            req.headers(),
            config.real_ip,
        )
    });

    let url = parse_url(&target, config.auto_decode_query, config.fast_parse_query, config.max_query);
    let matched = Method::from_http(req.method()).and_then(|m| Some((m, svc.router.find(&url.path, m)?)));
    let Some((method, matched)) = matched else {
        debug!(conn = %info.id, method = %req.method(), path = %url.path, "no route");
        let mut reply = response::plain(StatusCode::NOT_FOUND, Bytes::from(config.not_found.clone()));
        if !h2 {
            reply.headers_mut().insert(CONNECTION, HeaderValue::from_static("close"));
        }
        log_access(&svc, access, &reply);
        return Ok(reply);
    };

    let mut ctx = if h2 { svc.pool.acquire() } else { Context::default() };
    let (parts, body) = req.into_parts();

    ctx.version = parts.version;
    ctx.method = method;
    ctx.scheme = scheme;
    ctx.host = host;
    ctx.ip = info.peer.ip().to_string();
    ctx.port = info.peer.port();
    ctx.path = url.path;
    ctx.target = target;
    ctx.query = url.query;
    ctx.routepath.clone_from(&matched.route.path);
    ctx.name.clone_from(&matched.route.name);
    ctx.group.clone_from(&matched.route.group);
    ctx.headers = parts.headers;
    ctx.param = matched.params;
    ctx.star_path = matched.star_path;
    ctx.max_body = config.max_body;
    ctx.services = Some(Arc::clone(&svc.services));
    ctx.route = Some(matched.route);
    ctx.set_request_body(body.map_err(Into::into).boxed_unsync());

    if h2 {
        let run = svc.chains.run(&mut ctx, &svc.errors);
        if tokio::time::timeout(config.stream_timeout(), run).await.is_err() {
            svc.errors.report(&Error::Timeout, "stream");
            ctx.release_transport();
            ctx.respond(StatusCode::REQUEST_TIMEOUT, Bytes::new());
        }
    } else {
        svc.chains.run(&mut ctx, &svc.errors).await;
    }

    if ctx.is_aborted() {
        debug!(conn = %info.id, path = %ctx.path, "request aborted");
        if h2 {
            svc.pool.release(ctx);
        }
        return Err(Error::Aborted);
    }

    let mut reply = ctx
        .take_reply()
        .unwrap_or_else(|| response::plain(ctx.status(), Bytes::new()));
    if ctx.close_connection && !h2 {
        reply.headers_mut().insert(CONNECTION, HeaderValue::from_static("close"));
    }
    log_access(&svc, access, &reply);

    if h2 {
        svc.pool.release(ctx);
    }
    Ok(reply)
}

fn log_access(svc: &Service, record: Option<AccessRecord>, reply: &Response<HttpBody>) {
    if let (Some(logger), Some(mut record)) = (&svc.logger, record) {
        record.status = reply.status().as_u16();
        logger.log(record);
    }
}
