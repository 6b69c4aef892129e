//! End-to-end tests of the standard middleware chain.
//!
//! The chain runs outermost first:
//!
//! 1. Recovery - Panic to `500`
//! 2. Request ID - `X-Request-ID` propagation
//! 3. Logging - Access log
//! 4. CORS - Origin matching
//! 5. Rate Limit - Token bucket
//! 6. Compression - Gzip

mod common;

use bytes::Bytes;
use common::{gunzip, CapturedLogs};
use http::StatusCode;
use sluice_middleware::config::MiddlewareConfig;
use sluice_middleware::prelude::*;
use sluice_middleware::stages::cors::CorsConfig;
use sluice_middleware::stages::rate_limit::RateLimitConfig;
use sluice_middleware::stages::{
    CompressionMiddleware, CorsMiddleware, LoggingMiddleware, RecoveryMiddleware,
    RequestIdMiddleware,
};
use sluice_middleware::Request;
use std::io::{Cursor, Write as _};

fn full_config() -> MiddlewareConfig {
    MiddlewareConfig {
        cors: Some(CorsConfig {
            allowed_origins: vec!["example.com".to_string()],
            exposed_headers: vec!["X-Request-ID".to_string()],
            ..CorsConfig::default()
        }),
        rate_limit: Some(RateLimitConfig {
            requests_per_second: 1.0,
            burst: 2,
        }),
        ..MiddlewareConfig::default()
    }
}

fn request(method: &str, path: &str, headers: &[(&str, &str)]) -> Request {
    let mut builder = http::Request::builder().method(method).uri(path);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Bytes::new()).unwrap()
}

fn serve(app: &BoxHandler, req: Request) -> ResponseRecorder {
    let mut rec = ResponseRecorder::new();
    app.serve(&mut rec, req);
    rec
}

fn hello_world() -> BoxHandler {
    handler_fn(|w, _req| {
        let _ = w.write_all("hello world".repeat(40).as_bytes());
    })
}

// =============================================================================
// Full chain
// =============================================================================

#[test]
fn test_full_chain_decorates_response() {
    let logs = CapturedLogs::default();
    let app = full_config().chain(&logs.logger()).then(hello_world());

    let rec = serve(
        &app,
        request(
            "GET",
            "/greeting",
            &[
                ("accept-encoding", "gzip"),
                ("origin", "https://example.com:8443"),
                ("x-request-id", "client-supplied-1"),
            ],
        ),
    );

    assert_eq!(rec.status(), StatusCode::OK);
    assert_eq!(rec.header("content-encoding"), Some("gzip"));
    assert_eq!(rec.header("content-length"), None);
    assert_eq!(rec.header("x-request-id"), Some("client-supplied-1"));
    assert_eq!(
        rec.header("access-control-allow-origin"),
        Some("https://example.com:8443")
    );
    assert_eq!(
        rec.header("access-control-expose-headers"),
        Some("X-Request-ID")
    );
    assert_eq!(rec.header_all("vary"), vec!["Origin", "Accept-Encoding"]);
    assert_eq!(gunzip(rec.body()), "hello world".repeat(40).as_bytes());

    let access = logs.with_message("http request");
    assert_eq!(access.len(), 1);
    assert_eq!(access[0]["fields"]["status"], 200);
    assert_eq!(access[0]["fields"]["path"], "/greeting");
    assert_eq!(access[0]["fields"]["request_id"], "client-supplied-1");
}

#[test]
fn test_rate_limited_requests_are_logged_as_warnings() {
    let logs = CapturedLogs::default();
    let app = full_config().chain(&logs.logger()).then(hello_world());

    let statuses: Vec<_> = (0..3)
        .map(|_| serve(&app, request("GET", "/", &[])).status())
        .collect();
    assert_eq!(
        statuses,
        [StatusCode::OK, StatusCode::OK, StatusCode::TOO_MANY_REQUESTS]
    );

    let access = logs.with_message("http request");
    assert_eq!(access.len(), 3);
    assert_eq!(access[2]["level"], "WARN");
    assert_eq!(access[2]["fields"]["status"], 429);
    assert!(access[2]["fields"]["request_id"].is_string());
}

#[test]
fn test_rejection_carries_retry_after_and_request_id() {
    let app = full_config()
        .chain(&CapturedLogs::default().logger())
        .then(hello_world());
    serve(&app, request("GET", "/", &[]));
    serve(&app, request("GET", "/", &[]));

    let rec = serve(&app, request("GET", "/", &[]));
    assert_eq!(rec.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(rec.header("retry-after"), Some("1"));
    assert_eq!(rec.body_string(), "Too Many Requests\n");
    assert_eq!(rec.header("x-request-id").map(str::len), Some(16));
}

#[test]
fn test_preflight_skips_rate_limit_and_handler() {
    let app = full_config()
        .chain(&CapturedLogs::default().logger())
        .then(handler_fn(|_w, _req| panic!("handler must not run")));

    for _ in 0..5 {
        let rec = serve(
            &app,
            request(
                "OPTIONS",
                "/orders",
                &[
                    ("origin", "http://example.com"),
                    ("access-control-request-method", "DELETE"),
                ],
            ),
        );
        assert_eq!(rec.status(), StatusCode::NO_CONTENT);
        assert_eq!(rec.header("access-control-max-age"), Some("3600"));
    }
}

#[test]
fn test_panic_becomes_500_with_request_id_in_log() {
    let logs = CapturedLogs::default();
    let app = MiddlewareConfig::default()
        .chain(&logs.logger())
        .then(handler_fn(|_w, _req| panic!("database unavailable")));

    let rec = serve(&app, request("GET", "/orders", &[("accept-encoding", "gzip")]));
    assert_eq!(rec.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(rec.body_string(), "Internal Server Error\n");
    let request_id = rec.header("x-request-id").unwrap().to_string();

    let recovered = logs.with_message("panic recovered");
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0]["fields"]["panic"], "database unavailable");
    assert_eq!(recovered[0]["fields"]["request_id"], request_id.as_str());
}

#[test]
fn test_panic_mid_stream_keeps_gzip_valid() {
    let logs = CapturedLogs::default();
    let app = MiddlewareConfig::default()
        .chain(&logs.logger())
        .then(handler_fn(|w, _req| {
            let _ = w.write_all(&[b'a'; 4096]);
            panic!("stream broke");
        }));

    let rec = serve(&app, request("GET", "/export", &[("accept-encoding", "gzip")]));
    assert_eq!(rec.status(), StatusCode::OK);
    assert_eq!(rec.header("content-encoding"), Some("gzip"));
    assert_eq!(gunzip(rec.body()), vec![b'a'; 4096]);

    let recovered = logs.with_message("panic recovered after response was already written");
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0]["fields"]["response_already_written"], true);
}

// =============================================================================
// Capabilities through the chain
// =============================================================================

#[test]
fn test_flush_reaches_transport_through_every_wrapper() {
    let app = MiddlewareConfig::default()
        .chain(&CapturedLogs::default().logger())
        .then(handler_fn(|w, _req| {
            w.headers_mut().insert(
                "content-type",
                http::HeaderValue::from_static("text/event-stream"),
            );
            for i in 0..3 {
                let _ = w.write_all(format!("data: {i}\n\n").as_bytes());
                flush(w).unwrap();
            }
        }));

    let rec = serve(&app, request("GET", "/events", &[("accept-encoding", "gzip")]));
    assert_eq!(rec.flush_count(), 3);
    assert_eq!(rec.header("content-encoding"), None);
    assert_eq!(rec.body_string(), "data: 0\n\ndata: 1\n\ndata: 2\n\n");
}

#[test]
fn test_hijack_reaches_transport_through_every_wrapper() {
    let logs = CapturedLogs::default();
    let app = Chain::new()
        .with(RecoveryMiddleware::new(logs.logger()))
        .with(RequestIdMiddleware::new(logs.logger()))
        .with(LoggingMiddleware::new(logs.logger()))
        .with(CorsMiddleware::default())
        .with(CompressionMiddleware::new())
        .then(handler_fn(|w, _req| {
            let mut conn = hijack(w).unwrap();
            conn.write_all(b"HTTP/1.1 101 Switching Protocols\r\n\r\n").unwrap();
            assert!(w.write_all(b"too late").is_err());
        }));

    let mut rec = ResponseRecorder::new().with_connection(Cursor::new(Vec::new()));
    app.serve(
        &mut rec,
        request(
            "GET",
            "/ws",
            &[("accept-encoding", "gzip"), ("upgrade", "websocket")],
        ),
    );

    assert!(rec.is_hijacked());
    assert!(rec.body().is_empty());
    let access = logs.with_message("http request");
    assert_eq!(access[0]["fields"]["status"], 101);
    assert!(logs.with_message("panic recovered").is_empty());
}

#[test]
fn test_hijack_unsupported_is_typed_through_chain() {
    let app = MiddlewareConfig::default()
        .chain(&CapturedLogs::default().logger())
        .then(handler_fn(|w, _req| {
            let err = hijack(w).err().unwrap();
            let _ = w.write_all(err.to_string().as_bytes());
        }));

    let rec = serve(&app, request("GET", "/", &[]));
    assert_eq!(
        rec.body_string(),
        "response writer does not support hijacking"
    );
}

// =============================================================================
// Compression properties through the chain
// =============================================================================

#[test]
fn test_small_and_precompressed_bodies_are_not_encoded() {
    let app = MiddlewareConfig::default()
        .chain(&CapturedLogs::default().logger())
        .then(handler_fn(|w, req| {
            if req.uri().path() == "/image" {
                w.headers_mut()
                    .insert("content-type", http::HeaderValue::from_static("image/jpeg"));
                let _ = w.write_all(&[0xFF; 10_000]);
            } else {
                let _ = w.write_all(b"short");
            }
        }));

    for path in ["/image", "/small"] {
        let rec = serve(&app, request("GET", path, &[("accept-encoding", "gzip, br")]));
        assert_eq!(rec.header("content-encoding"), None, "{path}");
        assert_eq!(rec.header("vary"), Some("Accept-Encoding"));
    }
}

#[test]
fn test_zero_weight_gzip_is_refused() {
    let app = MiddlewareConfig::default()
        .chain(&CapturedLogs::default().logger())
        .then(hello_world());

    for accept in ["gzip;q=0", "gzip; q=0.0, deflate", "br, GZIP;Q=0.000"] {
        let rec = serve(&app, request("GET", "/", &[("accept-encoding", accept)]));
        assert_eq!(rec.header("content-encoding"), None, "{accept}");
        assert_eq!(rec.body(), "hello world".repeat(40).as_bytes());
    }
}
