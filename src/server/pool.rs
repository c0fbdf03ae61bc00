//! Bounded free-list of reusable contexts for HTTP/2 streams.

use crossbeam::queue::ArrayQueue;

use crate::context::Context;

pub(crate) struct ContextPool {
    free: ArrayQueue<Context>,
}

impl ContextPool {
    pub(crate) fn new(capacity: usize) -> Self {
        Self { free: ArrayQueue::new(capacity.max(1)) }
    }

    /// A neutral context, recycled when one is available.
    pub(crate) fn acquire(&self) -> Context {
        self.free.pop().unwrap_or_default()
    }

    /// Resets `ctx` and keeps it for reuse. Call only after its chain has
    /// settled and its reply was taken. Dropped when the pool is full.
    pub(crate) fn release(&self, mut ctx: Context) {
        ctx.reset();
        let _ = self.free.push(ctx);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use http::StatusCode;

    use super::*;

    #[test]
    fn released_contexts_come_back_clean() {
        let pool = ContextPool::new(1);
        let mut ctx = pool.acquire();
        ctx.path.push_str("/dirty");
        ctx.set_status(StatusCode::NOT_FOUND);
        pool.release(ctx);
        assert_eq!(pool.len(), 1);

        let ctx = pool.acquire();
        assert!(ctx.path.is_empty());
        assert_eq!(ctx.status(), StatusCode::OK);
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn overflow_is_dropped() {
        let pool = ContextPool::new(1);
        pool.release(Context::new());
        pool.release(Context::new());
        assert_eq!(pool.len(), 1);
    }
}
