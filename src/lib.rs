//! # strata
//!
//! An HTTP/1.1 and HTTP/2 framework core with an onion middleware chain and
//! a pooled reverse proxy.
//!
//! ## The pieces
//!
//! - **Routing**: literal paths resolve through a hash table; `:param` and
//!   trailing `*` routes through a pre-sorted scan. Conflicting shapes are
//!   rejected at registration, not discovered at request time.
//! - **Middleware**: each route group owns one chain, composed once at
//!   startup. The most recently added middleware runs outermost.
//! - **Protocols**: hyper drives HTTP/1.1, HTTP/2 (h2c or ALPN) or both;
//!   body ingestion enforces `max_body` while reading.
//! - **Proxy**: per-host, per-path backends with weighted round-robin,
//!   pooled upstream sessions and failover. See [`proxy`].
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use strata::{App, Context, Error, BoxFuture, health};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let mut app = App::new();
//!     app.get("/users/:id", get_user)?
//!         .post("/users", create_user)?
//!         .get("/healthz", health::liveness)?;
//!
//!     app.listen("0.0.0.0:3000").await
//! }
//!
//! fn get_user(c: &mut Context) -> BoxFuture<'_, Result<(), Error>> {
//!     Box::pin(async move {
//!         let id = c.param("id").unwrap_or("unknown").to_owned();
//!         c.json(&serde_json::json!({ "id": id }))?;
//!         Ok(())
//!     })
//! }
//!
//! fn create_user(c: &mut Context) -> BoxFuture<'_, Result<(), Error>> {
//!     Box::pin(async move {
//!         if c.raw_body.is_empty() {
//!             c.respond(strata::StatusCode::BAD_REQUEST, "empty body");
//!             return Ok(());
//!         }
//!         let body = c.raw_body.clone();
//!         c.set_status(strata::StatusCode::CREATED)
//!             .set_header("location", "/users/99")
//!             .send(body);
//!         Ok(())
//!     })
//! }
//! ```

mod app;
mod bodyparser;
mod config;
mod context;
mod error;
mod handler;
mod method;
mod response;
mod router;
mod server;

pub mod health;
pub mod log;
pub mod middleware;
pub mod proxy;
pub mod query;

pub use app::{App, Group, MAX_GROUP_DEPTH, MiddlewareGroup};
pub use config::{Config, Protocol, TlsConfig};
pub use context::{Body, Capabilities, Context, Params, Services};
pub use error::{BoxError, Error, ProxyError, Result, RouteError};
pub use handler::{BoxFuture, BoxedHandler, Handler};
pub use http::StatusCode;
pub use method::Method;
pub use response::{ContentType, Data, HttpBody, empty, full};
pub use router::{Matched, Route, RouteOptions, Router};
pub use server::{Server, serve_with_shutdown};
