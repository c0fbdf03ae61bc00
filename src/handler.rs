//! Handler trait and type erasure.
//!
//! # How async handlers are stored
//!
//! The router holds handlers of *different* types in one table, so each one
//! is erased behind `Arc<dyn Handler>`. A handler borrows the
//! [`Context`] mutably for the duration of its future, which is why the
//! future type carries the borrow's lifetime:
//!
//! ```text
//! |c| Box::pin(async move { c.send("world"); Ok(()) })   ← user writes this
//!        ↓ app.get("/hello", …)
//! Arc::new(closure)  as BoxedHandler                     ← blanket impl
//!        ↓
//! handler.call(&mut ctx)  at request time                ← one vtable dispatch
//!        ↓
//! BoxFuture<'_, Result<()>>                               ← borrows ctx
//! ```
//!
//! Registration APIs spell the `for<'a> Fn(&'a mut Context) -> BoxFuture<'a, _>`
//! bound out directly so closures infer a higher-ranked signature; a plain
//! `H: Handler` bound would not.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::Context;
use crate::error::Error;

/// A heap-allocated, type-erased future borrowing for `'a`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Implemented for every route handler.
///
/// Closures and `fn` items of the shape
/// `for<'a> Fn(&'a mut Context) -> BoxFuture<'a, Result<(), Error>>` get it
/// for free. Implement it by hand for handlers that carry state.
pub trait Handler: Send + Sync + 'static {
    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, Result<(), Error>>;
}

/// A type-erased handler shared across concurrent requests.
pub type BoxedHandler = Arc<dyn Handler>;

impl<F> Handler for F
where
    F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, Result<(), Error>> + Send + Sync + 'static,
{
    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, Result<(), Error>> {
        (self)(ctx)
    }
}

/// Erases a closure or `fn` item into a [`BoxedHandler`].
pub fn boxed<F>(f: F) -> BoxedHandler
where
    F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, Result<(), Error>> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Handler that does nothing. Routes owned by middleware (the proxy) use it
/// as their terminal.
pub(crate) struct Noop;

impl Handler for Noop {
    fn call<'a>(&'a self, _ctx: &'a mut Context) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async { Ok(()) })
    }
}
