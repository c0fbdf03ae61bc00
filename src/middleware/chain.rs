//! Chain composition.
//!
//! Every group owns a stack of links. Link 0 is the terminal that calls the
//! matched route's handler. Adding a middleware pushes a new link wrapping
//! the previous top, so the most recently added middleware runs outermost.
//!
//! A middleware added without a group is pushed onto every chain that exists
//! at that moment, the global one included. A group's chain is created on
//! first use as a copy of the global chain at that time; global middleware
//! added later reaches it only because it then exists.
//!
//! Chains are built once at startup and frozen. Serving reads only.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use http::StatusCode;

use super::{BoxedMiddleware, MidOptions, MidSource, Next};
use crate::context::Context;
use crate::error::Error;
use crate::handler::BoxFuture;
use crate::log::ErrorHandler;

/// One step of a composed chain.
pub(crate) trait Link: Send + Sync {
    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, Result<(), Error>>;
}

/// Bottom of every chain: the route handler.
struct Terminal;

impl Link for Terminal {
    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, Result<(), Error>> {
        let route = ctx.route.clone();
        Box::pin(async move {
            match route {
                Some(route) => route.handler.call(ctx).await,
                None => Ok(()),
            }
        })
    }
}

/// A middleware wrapped around the previous top of the stack.
struct Layer {
    mid: BoxedMiddleware,
    opts: MidOptions,
    prev: Arc<dyn Link>,
}

impl Link for Layer {
    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, Result<(), Error>> {
        if !self.opts.matches(ctx) {
            return self.prev.call(ctx);
        }
        self.mid.call(ctx, Next::new(&*self.prev))
    }
}

const GLOBAL: &str = "";

/// Mutable chain state during registration.
pub(crate) struct ChainBuilder {
    groups: HashMap<String, Vec<Arc<dyn Link>>>,
    staged: Vec<(MidSource, MidOptions)>,
}

impl ChainBuilder {
    pub(crate) fn new() -> Self {
        let mut groups = HashMap::new();
        groups.insert(GLOBAL.to_owned(), vec![Arc::new(Terminal) as Arc<dyn Link>]);
        Self { groups, staged: Vec::new() }
    }

    fn init_group(&mut self, group: &str) -> &mut Vec<Arc<dyn Link>> {
        if !self.groups.contains_key(group) {
            let seed = self.groups.get(GLOBAL).cloned().unwrap_or_default();
            self.groups.insert(group.to_owned(), seed);
        }
        self.groups.entry(group.to_owned()).or_default()
    }

    /// Composes `mid` onto its group's chain, or onto every chain when it
    /// has no group.
    ///
    /// A global entry also wraps groups created before it, outside their own
    /// entries. Groups created later start from a copy of the global chain.
    pub(crate) fn add(&mut self, mid: BoxedMiddleware, opts: MidOptions) {
        match opts.group.clone() {
            Some(group) => {
                let stack = self.init_group(&group);
                push(stack, Arc::clone(&mid), opts);
            }
            None => {
                for stack in self.groups.values_mut() {
                    push(stack, Arc::clone(&mid), opts.clone());
                }
            }
        }
    }

    /// Stages `mid` to be composed by [`flush`](Self::flush).
    pub(crate) fn stage(&mut self, mid: MidSource, opts: MidOptions) {
        self.staged.push((mid, opts));
    }

    /// Composes staged entries newest first, so the first one staged ends up
    /// outermost.
    pub(crate) fn flush(&mut self) {
        while let Some((mid, opts)) = self.staged.pop() {
            self.add(mid.resolve(), opts);
        }
    }

    pub(crate) fn freeze(mut self) -> Chains {
        self.flush();
        let mut tops: HashMap<String, Arc<dyn Link>> = self
            .groups
            .into_iter()
            .filter_map(|(name, stack)| stack.last().cloned().map(|top| (name, top)))
            .collect();
        let global = tops.remove(GLOBAL).unwrap_or_else(|| Arc::new(Terminal));
        Chains { global, groups: tops }
    }
}

fn push(stack: &mut Vec<Arc<dyn Link>>, mid: BoxedMiddleware, opts: MidOptions) {
    let prev = stack.last().cloned().unwrap_or_else(|| Arc::new(Terminal));
    stack.push(Arc::new(Layer { mid, opts, prev }));
}

/// Frozen chains, one per group plus the global fallback.
pub(crate) struct Chains {
    global: Arc<dyn Link>,
    groups: HashMap<String, Arc<dyn Link>>,
}

impl Chains {
    fn exec<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, Result<(), Error>> {
        let chain = self.groups.get(ctx.group.as_str()).unwrap_or(&self.global);
        chain.call(ctx)
    }

    /// Runs the chain for `ctx.group`.
    ///
    /// Errors and panics go to the error handler and become a 500 when the
    /// context can still answer. Transport references are dropped either way.
    pub(crate) async fn run(&self, ctx: &mut Context, errors: &ErrorHandler) {
        let outcome = AssertUnwindSafe(self.exec(ctx)).catch_unwind().await;
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(panic) => Some(Error::Panic(panic_message(panic.as_ref()))),
        };
        if let Some(err) = failure {
            errors.report(&err, "response");
            if ctx.is_writable() {
                ctx.respond(StatusCode::INTERNAL_SERVER_ERROR, "");
            }
        }
        ctx.release_transport();
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
