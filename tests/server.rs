mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use http::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use strata::middleware::{MidOptions, from_fn};
use strata::{App, Body, Config, Error};

use common::{get, request, send, spawn};

#[tokio::test]
async fn serves_plain_routes_and_404s() {
    let mut app = App::new();
    app.get("/hello", |c| Box::pin(async move {
        c.send("world");
        Ok(())
    }))
    .unwrap();
    let server = spawn(app).await;

    let reply = get(server.addr, "/hello").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.text(), "world");
    assert!(reply.headers["content-type"].to_str().unwrap().starts_with("text/plain"));

    let reply = get(server.addr, "/nope").await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
    assert_eq!(reply.text(), "not found");
}

#[tokio::test]
async fn json_bodies_are_parsed_before_the_handler() {
    let mut app = App::new();
    app.post("/echo", |c| Box::pin(async move {
        let Body::Json(value) = &c.body else {
            return Err(Error::msg("expected json"));
        };
        let value = value.clone();
        c.json(&value)?;
        Ok(())
    }))
    .unwrap();
    let server = spawn(app).await;

    let mut req = request("POST", server.addr, "/echo", r#"{"name":"alice"}"#);
    req.headers_mut().insert("content-type", "application/json".parse().unwrap());
    let reply = send(server.addr, req).await;
    assert_eq!(reply.status, StatusCode::OK);
    let echoed: serde_json::Value = serde_json::from_slice(&reply.body).unwrap();
    assert_eq!(echoed["name"], "alice");
}

#[tokio::test]
async fn oversized_bodies_never_reach_the_handler() {
    let hits = Arc::new(Mutex::new(0));
    let seen = Arc::clone(&hits);

    let mut app = App::with_config(Config { max_body: 8, ..Config::default() });
    app.post("/upload", move |c| {
        let seen = Arc::clone(&seen);
        Box::pin(async move {
            *seen.lock().unwrap() += 1;
            c.send("stored");
            Ok(())
        })
    })
    .unwrap();
    let server = spawn(app).await;

    let reply = send(server.addr, request("POST", server.addr, "/upload", "0123456789abcdef")).await;
    assert_eq!(reply.status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(*hits.lock().unwrap(), 0);

    let reply = send(server.addr, request("POST", server.addr, "/upload", "small")).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(*hits.lock().unwrap(), 1);
}

#[tokio::test]
async fn handler_errors_become_500() {
    let mut app = App::new();
    app.get("/boom", |_c| Box::pin(async move { Err(Error::msg("boom")) })).unwrap();
    let server = spawn(app).await;

    let reply = get(server.addr, "/boom").await;
    assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn middleware_runs_as_an_onion() {
    let mut app = App::new();
    app.get("/order", |c| Box::pin(async move {
        c.send("handler");
        Ok(())
    }))
    .unwrap();
    app.use_mid(
        from_fn(|c, next| Box::pin(async move {
            next.run(c).await?;
            c.set_header("x-outer", "1");
            let inner = c.reply_header("x-inner").is_some();
            c.set_header("x-saw-inner", if inner { "yes" } else { "no" });
            Ok(())
        })),
        MidOptions::new(),
    );
    app.use_mid(
        from_fn(|c, next| Box::pin(async move {
            next.run(c).await?;
            c.set_header("x-inner", "1");
            Ok(())
        })),
        MidOptions::new(),
    );
    let server = spawn(app).await;

    let reply = get(server.addr, "/order").await;
    assert_eq!(reply.text(), "handler");
    assert_eq!(reply.headers["x-outer"], "1");
    assert_eq!(reply.headers["x-saw-inner"], "yes");
}

#[tokio::test]
async fn route_params_and_health_checks() {
    let mut app = App::new();
    app.get("/users/:id", |c| Box::pin(async move {
        let id = c.param("id").unwrap_or_default().to_owned();
        c.send(id);
        Ok(())
    }))
    .unwrap();
    app.get("/healthz", strata::health::liveness).unwrap();
    let server = spawn(app).await;

    assert_eq!(get(server.addr, "/users/42").await.text(), "42");
    assert_eq!(get(server.addr, "/healthz").await.text(), "ok");
}

#[tokio::test]
async fn get_with_a_body_is_rejected() {
    let hits = Arc::new(Mutex::new(0));
    let seen = Arc::clone(&hits);

    let mut app = App::new();
    app.get("/x", move |c| {
        let seen = Arc::clone(&seen);
        Box::pin(async move {
            *seen.lock().unwrap() += 1;
            c.send("ok");
            Ok(())
        })
    })
    .unwrap();
    let server = spawn(app).await;

    let reply = send(server.addr, request("GET", server.addr, "/x", "hello")).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.text(), "bad request");
    assert_eq!(reply.headers["connection"], "close");
    assert_eq!(*hits.lock().unwrap(), 0);
}

#[tokio::test]
async fn stalled_requests_get_408_before_close() {
    let mut app = App::with_config(Config { timeout_ms: 200, header_timeout_ms: 60_000, ..Config::default() });
    app.get("/x", |c| Box::pin(async move {
        c.send("x");
        Ok(())
    }))
    .unwrap();
    let server = spawn(app).await;

    let mut tcp = TcpStream::connect(server.addr).await.unwrap();
    tcp.write_all(b"GET /x HTTP/1.1\r\n").await.unwrap();

    let mut answer = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), tcp.read_to_end(&mut answer))
        .await
        .expect("connection should close")
        .unwrap();
    let answer = String::from_utf8_lossy(&answer);
    assert!(answer.starts_with("HTTP/1.1 408 Request Timeout\r\n"), "{answer}");
    assert!(answer.contains("connection: close"), "{answer}");
}

#[tokio::test]
async fn idle_keep_alive_connections_are_answered_and_closed() {
    let mut app = App::with_config(Config { timeout_ms: 200, ..Config::default() });
    app.get("/x", |c| Box::pin(async move {
        c.send("x");
        Ok(())
    }))
    .unwrap();
    let server = spawn(app).await;

    let mut tcp = TcpStream::connect(server.addr).await.unwrap();
    tcp.write_all(b"GET /x HTTP/1.1\r\nhost: t\r\n\r\n").await.unwrap();

    let mut answer = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), tcp.read_to_end(&mut answer))
        .await
        .expect("connection should close")
        .unwrap();
    let answer = String::from_utf8_lossy(&answer);
    assert!(answer.starts_with("HTTP/1.1 200 OK\r\n"), "{answer}");
    assert!(answer.contains("HTTP/1.1 408 Request Timeout\r\n"), "{answer}");
}
