//! Built-in Kubernetes health-check handlers.
//!
//! Kubernetes asks two questions. strata answers them.
//!
//! | Check | Path | Question |
//! |---|---|---|
//! | **Liveness** | `/healthz` | Is the process alive? Failure → restart. |
//! | **Readiness** | `/readyz` | Can the pod serve traffic? Failure → pulled from load-balancer. |
//!
//! Register them on your app:
//!
//! ```rust,no_run
//! use strata::{App, health};
//!
//! # fn main() -> Result<(), strata::RouteError> {
//! let mut app = App::new();
//! app.get("/healthz", health::liveness)?
//!     .get("/readyz", health::readiness)?;
//! # Ok(())
//! # }
//! ```
//!
//! Override `readiness` with a custom handler if you need to gate on
//! dependency availability (database connections, upstream pools, etc.):
//!
//! ```rust,no_run
//! use strata::{BoxFuture, Context, Error};
//! use http::StatusCode;
//!
//! fn readiness(c: &mut Context) -> BoxFuture<'_, Result<(), Error>> {
//!     Box::pin(async move {
//!         if dependencies_are_healthy().await {
//!             c.text("ready");
//!         } else {
//!             c.set_status(StatusCode::SERVICE_UNAVAILABLE);
//!         }
//!         Ok(())
//!     })
//! }
//!
//! async fn dependencies_are_healthy() -> bool { true }
//! ```

use crate::context::Context;
use crate::error::Error;
use crate::handler::BoxFuture;

/// Kubernetes liveness check handler.
///
/// Always answers `200 OK` with body `"ok"`. If the process can respond to
/// HTTP at all, it is alive.
pub fn liveness(c: &mut Context) -> BoxFuture<'_, Result<(), Error>> {
    Box::pin(async move {
        c.text("ok");
        Ok(())
    })
}

/// Kubernetes readiness check handler (default implementation).
///
/// Answers `200 OK` with body `"ready"`. Replace it with your own handler
/// if the application needs a warm-up period or must verify dependency
/// health before accepting traffic.
pub fn readiness(c: &mut Context) -> BoxFuture<'_, Result<(), Error>> {
    Box::pin(async move {
        c.text("ready");
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_handlers_answer_plain_text() {
        let mut c = Context::new();
        liveness(&mut c).await.unwrap();
        c.finish();
        let reply = c.take_reply().unwrap();
        assert_eq!(reply.status(), http::StatusCode::OK);
        assert_eq!(reply.headers()["content-type"], "text/plain;charset=utf-8");
    }
}
