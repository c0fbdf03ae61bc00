mod common;

use bytes::Bytes;
use http::{Request, StatusCode, Version};
use http_body_util::Full;
use strata::{App, Config, Protocol};

use common::{send, send_h2, spawn};

fn app(protocol: Protocol) -> App {
    let mut app = App::with_config(Config { protocol, ..Config::default() });
    app.get("/version", |c| Box::pin(async move {
        let version = format!("{:?}", c.version);
        c.send(version);
        Ok(())
    }))
    .unwrap();
    app
}

fn h2_request(addr: std::net::SocketAddr, path: &str) -> Request<Full<Bytes>> {
    Request::builder()
        .uri(format!("http://{addr}{path}"))
        .version(Version::HTTP_2)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

#[tokio::test]
async fn prior_knowledge_h2c() {
    let server = spawn(app(Protocol::Http2)).await;
    let reply = send_h2(server.addr, h2_request(server.addr, "/version")).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.text(), "HTTP/2.0");
}

#[tokio::test]
async fn auto_serves_both_protocols() {
    let server = spawn(app(Protocol::Auto)).await;

    let reply = send_h2(server.addr, h2_request(server.addr, "/version")).await;
    assert_eq!(reply.text(), "HTTP/2.0");

    let reply = send(server.addr, common::request("GET", server.addr, "/version", "")).await;
    assert_eq!(reply.text(), "HTTP/1.1");
}

#[tokio::test]
async fn streams_share_one_connection() {
    let server = spawn(app(Protocol::Http2)).await;
    let tcp = tokio::net::TcpStream::connect(server.addr).await.unwrap();
    let (tx, conn) = hyper::client::conn::http2::handshake(
        hyper_util::rt::TokioExecutor::new(),
        hyper_util::rt::TokioIo::new(tcp),
    )
    .await
    .unwrap();
    tokio::spawn(conn);

    let mut waiting = Vec::new();
    for _ in 0..8 {
        let mut tx = tx.clone();
        let req = h2_request(server.addr, "/version");
        waiting.push(tokio::spawn(async move { tx.send_request(req).await.unwrap().status() }));
    }
    for status in waiting {
        assert_eq!(status.await.unwrap(), StatusCode::OK);
    }
}

#[tokio::test]
async fn slow_streams_time_out_with_408() {
    let mut app = App::with_config(Config { protocol: Protocol::Http2, stream_timeout_ms: 100, ..Config::default() });
    app.get("/slow", |c| Box::pin(async move {
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        c.send("late");
        Ok(())
    }))
    .unwrap();
    let server = spawn(app).await;

    let reply = send_h2(server.addr, h2_request(server.addr, "/slow")).await;
    assert_eq!(reply.status, StatusCode::REQUEST_TIMEOUT);
    assert!(reply.body.is_empty());
}
