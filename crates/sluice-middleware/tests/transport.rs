//! The standard chain served over a real TCP socket.

mod common;

use bytes::Bytes;
use common::{gunzip, CapturedLogs};
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use sluice_middleware::prelude::*;
use sluice_middleware::{serve, HyperService};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

struct TestServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestServer {
    async fn start(app: BoxHandler, logs: &CapturedLogs) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let service = HyperService::new(app, logs.logger());
        tokio::spawn(serve(listener, service, async move {
            let _ = rx.await;
        }));
        Self {
            addr,
            shutdown: Some(tx),
        }
    }

    async fn send(
        &self,
        request: http::Request<Full<Bytes>>,
    ) -> Result<(http::response::Parts, Bytes), hyper::Error> {
        let stream = TcpStream::connect(self.addr).await.unwrap();
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .unwrap();
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let response = sender.send_request(request).await?;
        let (parts, body) = response.into_parts();
        let body = body.collect().await?.to_bytes();
        Ok((parts, body))
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

fn get(path: &str, headers: &[(&str, &str)]) -> http::Request<Full<Bytes>> {
    let mut builder = http::Request::builder()
        .uri(path)
        .header("host", "localhost");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Full::new(Bytes::new())).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_gzip_response_with_request_id() {
    let logs = CapturedLogs::default();
    let app = MiddlewareConfig::default()
        .chain(&logs.logger())
        .then(handler_fn(|w, _req| {
            let _ = w.write_all("hello world".repeat(40).as_bytes());
        }));
    let server = TestServer::start(app, &logs).await;

    let (parts, body) = server
        .send(get("/greeting", &[("accept-encoding", "gzip")]))
        .await
        .unwrap();

    assert_eq!(parts.status, StatusCode::OK);
    assert_eq!(parts.headers["content-encoding"], "gzip");
    assert_eq!(parts.headers["vary"], "Accept-Encoding");
    assert_eq!(parts.headers["x-request-id"].len(), 16);
    assert_eq!(gunzip(&body), "hello world".repeat(40).as_bytes());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_request_body_reaches_handler() {
    let logs = CapturedLogs::default();
    let app = MiddlewareConfig::default()
        .chain(&logs.logger())
        .then(handler_fn(|w, req| {
            let mut echoed = b"echo: ".to_vec();
            echoed.extend_from_slice(req.body());
            let _ = w.write_all(&echoed);
        }));
    let server = TestServer::start(app, &logs).await;

    let request = http::Request::builder()
        .method("POST")
        .uri("/echo")
        .header("host", "localhost")
        .body(Full::new(Bytes::from_static(b"ping")))
        .unwrap();
    let (parts, body) = server.send(request).await.unwrap();

    assert_eq!(parts.status, StatusCode::OK);
    assert_eq!(&body[..], b"echo: ping");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_streamed_response_arrives_whole() {
    let logs = CapturedLogs::default();
    let app = MiddlewareConfig::default()
        .chain(&logs.logger())
        .then(handler_fn(|w, _req| {
            w.headers_mut().insert(
                "content-type",
                http::HeaderValue::from_static("text/event-stream"),
            );
            for i in 0..50 {
                let _ = w.write_all(format!("data: {i}\n\n").as_bytes());
                let _ = flush(w);
            }
        }));
    let server = TestServer::start(app, &logs).await;

    let (parts, body) = server
        .send(get("/events", &[("accept-encoding", "gzip")]))
        .await
        .unwrap();

    assert_eq!(parts.status, StatusCode::OK);
    assert!(parts.headers.get("content-encoding").is_none());
    let expected: String = (0..50).map(|i| format!("data: {i}\n\n")).collect();
    assert_eq!(body, expected.as_bytes());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_recovered_panic_is_500() {
    let logs = CapturedLogs::default();
    let app = MiddlewareConfig::default()
        .chain(&logs.logger())
        .then(handler_fn(|_w, _req| panic!("boom")));
    let server = TestServer::start(app, &logs).await;

    let (parts, body) = server.send(get("/", &[])).await.unwrap();

    assert_eq!(parts.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(&body[..], b"Internal Server Error\n");
    assert_eq!(logs.with_message("panic recovered").len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unrecovered_panic_drops_connection() {
    let logs = CapturedLogs::default();
    let app = Chain::new().then(handler_fn(|_w, _req| panic!("no recovery here")));
    let server = TestServer::start(app, &logs).await;

    assert!(server.send(get("/", &[])).await.is_err());
}
