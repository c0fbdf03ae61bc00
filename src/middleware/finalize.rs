//! The final sink: outermost middleware, last to see the context.

use super::{Middleware, Next};
use crate::context::Context;
use crate::error::Error;
use crate::handler::BoxFuture;

/// Turns `ctx.data` into the reply once everything inside has unwound.
///
/// Added after every other middleware, so its post-`next` code runs last.
/// A context that already answered (413, proxy relay, ...) is left alone.
pub(crate) struct FinalSink;

impl Middleware for FinalSink {
    fn call<'a>(&'a self, ctx: &'a mut Context, next: Next<'a>) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            next.run(ctx).await?;
            ctx.finish();
            Ok(())
        })
    }
}
