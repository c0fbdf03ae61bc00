//! Middleware layer.
//!
//! A middleware receives the [`Context`] and a [`Next`] continuation. Code
//! before `next.run(ctx).await` runs on the way in, code after it on the way
//! out, in strict LIFO order across every registered middleware:
//!
//! ```rust
//! use strata::middleware::from_fn;
//!
//! let timing = from_fn(|c, next| Box::pin(async move {
//!     let start = std::time::Instant::now();
//!     next.run(c).await?;
//!     c.set_header("x-elapsed-us", &start.elapsed().as_micros().to_string());
//!     Ok(())
//! }));
//! # let _ = timing;
//! ```
//!
//! Not calling `next` short-circuits the rest of the chain, including the
//! route handler.

mod chain;
mod finalize;

use std::collections::HashSet;
use std::sync::Arc;

use crate::context::Context;
use crate::error::Error;
use crate::handler::BoxFuture;
use crate::method::Method;

pub(crate) use chain::{ChainBuilder, Chains, Link};
pub(crate) use finalize::FinalSink;

// ── Middleware trait ──────────────────────────────────────────────────────────

/// Implemented by every middleware.
pub trait Middleware: Send + Sync + 'static {
    fn call<'a>(&'a self, ctx: &'a mut Context, next: Next<'a>) -> BoxFuture<'a, Result<(), Error>>;
}

/// A type-erased middleware shared by every chain it was added to.
pub type BoxedMiddleware = Arc<dyn Middleware>;

/// The rest of the chain.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    link: &'a dyn Link,
}

impl<'a> Next<'a> {
    pub(crate) fn new(link: &'a dyn Link) -> Self {
        Self { link }
    }

    /// Runs the inner middleware and, at the bottom, the route handler.
    pub fn run<'b>(self, ctx: &'b mut Context) -> BoxFuture<'b, Result<(), Error>>
    where
        'a: 'b,
    {
        self.link.call(ctx)
    }
}

/// Wraps a closure as a [`Middleware`].
///
/// The bound is spelled out here so closures get a higher-ranked signature.
pub fn from_fn<F>(f: F) -> FnMiddleware<F>
where
    F: for<'a> Fn(&'a mut Context, Next<'a>) -> BoxFuture<'a, Result<(), Error>> + Send + Sync + 'static,
{
    FnMiddleware(f)
}

pub struct FnMiddleware<F>(F);

impl<F> Middleware for FnMiddleware<F>
where
    F: for<'a> Fn(&'a mut Context, Next<'a>) -> BoxFuture<'a, Result<(), Error>> + Send + Sync + 'static,
{
    fn call<'a>(&'a self, ctx: &'a mut Context, next: Next<'a>) -> BoxFuture<'a, Result<(), Error>> {
        (self.0)(ctx, next)
    }
}

// ── Sources ───────────────────────────────────────────────────────────────────

/// Something that builds a middleware when it is registered, e.g. a
/// configurable extension object.
pub trait MidFactory {
    fn middleware(&self) -> BoxedMiddleware;
}

/// The shapes a middleware can be registered in. Resolved to a
/// [`BoxedMiddleware`] once, at registration.
pub enum MidSource {
    Direct(BoxedMiddleware),
    Factory(Box<dyn MidFactory + Send>),
}

impl MidSource {
    pub(crate) fn resolve(self) -> BoxedMiddleware {
        match self {
            Self::Direct(m) => m,
            Self::Factory(f) => f.middleware(),
        }
    }
}

// ── Options ───────────────────────────────────────────────────────────────────

/// Where a middleware applies.
#[derive(Debug, Clone, Default)]
pub struct MidOptions {
    pub group: Option<String>,
    pub methods: Option<HashSet<Method>>,
    pub names: Option<HashSet<String>>,
    /// Run before body ingestion, outside every staged middleware.
    pub pre: bool,
}

impl MidOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn method(self, method: Method) -> Self {
        self.methods([method])
    }

    pub fn methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods.get_or_insert_with(HashSet::new).extend(methods);
        self
    }

    /// Restrict to routes registered under `name`.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.names.get_or_insert_with(HashSet::new).insert(name.into());
        self
    }

    pub fn pre(mut self) -> Self {
        self.pre = true;
        self
    }

    pub(crate) fn matches(&self, ctx: &Context) -> bool {
        if let Some(methods) = &self.methods {
            if !methods.contains(&ctx.method) {
                return false;
            }
        }
        if let Some(names) = &self.names {
            if !names.contains(&ctx.name) {
                return false;
            }
        }
        true
    }
}

impl From<()> for MidOptions {
    fn from(_: ()) -> Self {
        Self::default()
    }
}

impl From<Method> for MidOptions {
    fn from(m: Method) -> Self {
        Self::default().method(m)
    }
}

/// `"@api"` scopes to group `api`; anything else to the route named so.
impl From<&str> for MidOptions {
    fn from(s: &str) -> Self {
        match s.strip_prefix('@') {
            Some(group) => Self::default().group(group),
            None => Self::default().name(s),
        }
    }
}
