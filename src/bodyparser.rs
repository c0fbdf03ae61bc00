//! Body parser middleware.
//!
//! Turns `ctx.raw_body` into `ctx.body` by content type. Only bodies of
//! POST, PUT, PATCH and DELETE requests are looked at.

use http::StatusCode;
use http::header::CONTENT_TYPE;

use crate::context::{Body, Context};
use crate::error::Error;
use crate::handler::BoxFuture;
use crate::method::Method;
use crate::middleware::{Middleware, Next};
use crate::query::parse_form;

pub(crate) const BAD_JSON: &str = "bad json data";

pub(crate) struct BodyParser {
    max_form_keys: usize,
}

impl BodyParser {
    pub(crate) fn new(max_form_keys: usize) -> Self {
        Self { max_form_keys }
    }

    /// `Err(())` means the body claimed to be JSON and was not.
    fn parse(&self, ctx: &mut Context) -> Result<(), ()> {
        if !matches!(ctx.method, Method::Post | Method::Put | Method::Patch | Method::Delete)
            || ctx.raw_body.is_empty()
        {
            return Ok(());
        }
        let content_type = ctx
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();

        ctx.body = if is_type(&content_type, "application/json") {
            Body::Json(serde_json::from_slice(&ctx.raw_body).map_err(|_| ())?)
        } else if is_type(&content_type, "application/x-www-form-urlencoded") {
            Body::Form(parse_form(&String::from_utf8_lossy(&ctx.raw_body), self.max_form_keys))
        } else if content_type.starts_with("text/") {
            Body::Text(String::from_utf8_lossy(&ctx.raw_body).into_owned())
        } else if content_type.starts_with("multipart/form-data") {
            ctx.is_upload = true;
            Body::Raw(ctx.raw_body.clone())
        } else {
            Body::Raw(ctx.raw_body.clone())
        };
        Ok(())
    }
}

/// `application/json`, `application/json; charset=…` and
/// `application/json;charset=…` all count.
fn is_type(content_type: &str, mime: &str) -> bool {
    match content_type.strip_prefix(mime) {
        Some(rest) => rest.is_empty() || rest.starts_with(' ') || rest.starts_with(';'),
        None => false,
    }
}

impl Middleware for BodyParser {
    fn call<'a>(&'a self, ctx: &'a mut Context, next: Next<'a>) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            if self.parse(ctx).is_err() {
                ctx.respond(StatusCode::BAD_REQUEST, BAD_JSON);
                return Ok(());
            }
            next.run(ctx).await
        })
    }
}
