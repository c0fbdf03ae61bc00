//! Minimal strata example: JSON endpoints, a route group and health checks.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example basic
//!
//! Try:
//!   curl http://localhost:3000/users/42
//!   curl -X POST http://localhost:3000/users \
//!        -H 'content-type: application/json' \
//!        -d '{"name":"alice"}'
//!   curl -X DELETE http://localhost:3000/users/42
//!   curl http://localhost:3000/admin/stats
//!   curl http://localhost:3000/healthz

use strata::middleware::{MidOptions, from_fn};
use strata::{App, Body, BoxFuture, Context, Error, StatusCode, health};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let mut app = App::new();
    app.get("/users/:id", get_user)?
        .post("/users", create_user)?
        .delete("/users/:id", delete_user)?
        .get("/healthz", health::liveness)?
        .get("/readyz", health::readiness)?;

    app.group("admin", true, |admin| {
        admin.get("/stats", |c| Box::pin(async move {
            c.json(&serde_json::json!({ "users": 1 }))?;
            Ok(())
        }))?;
        Ok(())
    })?;

    // Only the admin group pays for this one.
    app.use_mid(
        from_fn(|c, next| Box::pin(async move {
            if c.header("x-admin-token").is_none() {
                c.respond(StatusCode::UNAUTHORIZED, "missing token");
                return Ok(());
            }
            next.run(c).await
        })),
        MidOptions::new().group("admin"),
    );

    app.listen("0.0.0.0:3000").await
}

// GET /users/:id
fn get_user(c: &mut Context) -> BoxFuture<'_, Result<(), Error>> {
    Box::pin(async move {
        let id = c.param("id").unwrap_or("unknown").to_owned();
        c.json(&serde_json::json!({ "id": id, "name": "alice" }))?;
        Ok(())
    })
}

// POST /users
//
// The body parser has already run: JSON arrives as `Body::Json`.
fn create_user(c: &mut Context) -> BoxFuture<'_, Result<(), Error>> {
    Box::pin(async move {
        let Body::Json(input) = &c.body else {
            c.respond(StatusCode::BAD_REQUEST, "expected a JSON body");
            return Ok(());
        };
        let name = input["name"].as_str().unwrap_or("new_user").to_owned();
        c.set_status(StatusCode::CREATED).set_header("location", "/users/99");
        c.json(&serde_json::json!({ "id": "99", "name": name }))?;
        Ok(())
    })
}

// DELETE /users/:id → 204 No Content
fn delete_user(c: &mut Context) -> BoxFuture<'_, Result<(), Error>> {
    Box::pin(async move {
        c.set_status(StatusCode::NO_CONTENT);
        Ok(())
    })
}
