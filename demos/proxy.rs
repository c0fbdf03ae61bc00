//! Reverse proxy in front of two local upstreams.
//!
//! Run with:
//!   RUST_LOG=strata=debug cargo run --example proxy
//!
//! Try:
//!   curl -H 'host: api.test' http://localhost:8080/api/users
//!   curl -H 'host: api.test' http://localhost:8080/api/v1/users   # rewritten to /v2/users
//!   curl http://localhost:8080/_proxy/status
//!
//! Point it at a config file instead with `PROXY_CONFIG=proxy.toml`:
//!
//! ```toml
//! connect_timeout_ms = 3000
//! full = true
//!
//! [[hosts."api.test"]]
//! path = "/api"
//! url = "http://127.0.0.1:9001"
//! weight = 3
//!
//! [[hosts."api.test"]]
//! path = "/api"
//! url = "http://127.0.0.1:9002"
//! protocol = "http2"
//! ```

use std::sync::Arc;

use strata::proxy::{BackendConfig, Proxy, ProxyConfig, Rewrite};
use strata::{App, Config, Error, Protocol};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    tokio::spawn(upstream(9001, Protocol::Http1));
    tokio::spawn(upstream(9002, Protocol::Http2));

    let mut config = match std::env::var("PROXY_CONFIG") {
        Ok(path) => ProxyConfig::load(path)?,
        Err(_) => {
            let mut config = ProxyConfig::new();
            config
                .backend("api.test", BackendConfig::new("/api", "http://127.0.0.1:9001").weight(3))
                .backend(
                    "api.test",
                    BackendConfig::new("/api", "http://127.0.0.1:9002")
                        .protocol(strata::proxy::UpstreamProtocol::Http2),
                );
            config
        }
    };
    config.rewrite("api.test", "/api", |_, target| {
        target.strip_prefix("/api/v1").map(|rest| Rewrite::Path(format!("/v2{rest}")))
    });

    let mut app = App::new();
    let proxy = Proxy::new(config)?.init(&mut app)?;

    let status = Arc::clone(&proxy);
    app.get("/_proxy/status", move |c| {
        let status = Arc::clone(&status);
        Box::pin(async move {
            c.json(&status.status())?;
            Ok(())
        })
    })?;

    let result = app.listen("0.0.0.0:8080").await;
    proxy.close_all();
    result
}

async fn upstream(port: u16, protocol: Protocol) -> Result<(), Error> {
    let mut app = App::with_config(Config { protocol, ..Config::default() });
    app.any("/*", move |c| Box::pin(async move {
        let line = format!("upstream {port} saw {} {}", c.method, c.target);
        c.send(line);
        Ok(())
    }))?;
    app.listen(&format!("127.0.0.1:{port}")).await
}
