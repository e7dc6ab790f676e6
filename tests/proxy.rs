//! End-to-end forwarding through a live gateway listener.

use std::time::{Duration, Instant};

use axum::http::StatusCode;
use crauti::config::{Middlewares, RewriteConfig};

mod common;
use common::{client, mount, TestGateway, GENERATOR_HEADER};

#[tokio::test]
async fn test_unmatched_request_gets_plain_404() {
    let backend = common::start_mock_backend("hello").await;
    let gw = TestGateway::start(vec![mount(
        "/api/",
        backend,
        Middlewares {
            match_host: "a.test".into(),
            ..Middlewares::default()
        },
    )])
    .await;

    let res = client()
        .get(gw.url("/api/x"))
        .header("host", "b.test")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert_eq!(res.text().await.unwrap(), "404 page not found\n");

    let res = client()
        .get(gw.url("/api/x"))
        .header("host", "A.test:8080")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()[GENERATOR_HEADER], "crauti/upstream");
    assert_eq!(res.text().await.unwrap(), "hello");
}

#[tokio::test]
async fn test_rewrite_and_forwarded_headers() {
    let (backend, seen) = common::start_recording_backend().await;
    let gw = TestGateway::start(vec![mount(
        "/mnt/",
        backend,
        Middlewares {
            rewrite: Some(RewriteConfig {
                pattern: "/get/(.+)".into(),
                target: "/get?id=$1".into(),
            }),
            ..Middlewares::default()
        },
    )])
    .await;

    let res = client()
        .get(gw.url("/mnt/get/42"))
        .header("host", "gw.test")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["x-backend"], "recording");
    assert_eq!(res.text().await.unwrap(), "/get?id=42");

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    let headers = &seen[0].headers;
    assert_eq!(headers["x-forwarded-host"], "gw.test");
    assert_eq!(headers["x-forwarded-proto"], "http");
    assert_eq!(headers["x-forwarded-for"], "127.0.0.1");
    assert_eq!(headers["host"], backend.to_string());
}

#[tokio::test]
async fn test_dead_upstream_is_bad_gateway() {
    let dead = common::dead_address().await;
    let gw = TestGateway::start(vec![mount("/", dead, Middlewares::default())]).await;

    let res = client().get(gw.url("/anything")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_slow_upstream_times_out() {
    let (backend, _) = common::start_recording_backend_with_delay(Duration::from_secs(2)).await;
    let gw = TestGateway::start(vec![mount(
        "/",
        backend,
        Middlewares {
            timeout: Duration::from_secs(1),
            ..Middlewares::default()
        },
    )])
    .await;

    let started = Instant::now();
    let res = client().get(gw.url("/slow")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::GATEWAY_TIMEOUT);
    assert!(started.elapsed() < Duration::from_millis(1900));

    // The collector sits above the timeout, so the 504 is still accounted for.
    assert!(
        common::eventually_rendered(&gw.metrics, |text| text
            .lines()
            .any(|l| l.starts_with("crauti_processed_requests_total")
                && l.contains("code=\"500\"")
                && l.ends_with(" 1")))
        .await
    );
}

#[tokio::test]
async fn test_deadline_covers_streamed_body() {
    let backend = common::start_stalling_backend("head ", Duration::from_secs(2), "tail").await;
    let gw = TestGateway::start(vec![mount(
        "/",
        backend,
        Middlewares {
            timeout: Duration::from_millis(300),
            ..Middlewares::default()
        },
    )])
    .await;

    let started = Instant::now();
    let body = match client().get(gw.url("/stream")).send().await {
        Ok(res) => res.text().await.ok(),
        Err(_) => None,
    };
    assert!(started.elapsed() < Duration::from_millis(1500));
    assert_ne!(body.as_deref(), Some("head tail"));
}

#[tokio::test]
async fn test_request_body_limit() {
    let (backend, seen) = common::start_recording_backend().await;
    let gw = TestGateway::start(vec![mount(
        "/",
        backend,
        Middlewares {
            max_request_body_size: "10b".into(),
            ..Middlewares::default()
        },
    )])
    .await;

    let res = client()
        .post(gw.url("/upload"))
        .body("01234567890")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client()
        .post(gw.url("/upload"))
        .body("0123456789")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(&seen[0].body[..], b"0123456789");
}

#[tokio::test]
async fn test_plain_http_redirects_to_https() {
    let backend = common::start_mock_backend("hello").await;
    let gw = TestGateway::start(vec![mount(
        "/",
        backend,
        Middlewares {
            redirect_to_https: true,
            ..Middlewares::default()
        },
    )])
    .await;

    let res = client()
        .get(gw.url("/a?b=c"))
        .header("host", "secure.test:8080")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::PERMANENT_REDIRECT);
    assert_eq!(res.headers()["location"], "https://secure.test:8080/a?b=c");
}

#[tokio::test]
async fn test_cors_headers_echo_request() {
    let backend = common::start_mock_backend("hello").await;
    let gw = TestGateway::start(vec![mount(
        "/",
        backend,
        Middlewares {
            cors_enabled: true,
            ..Middlewares::default()
        },
    )])
    .await;

    let res = client()
        .get(gw.url("/"))
        .header("origin", "https://app.test")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["access-control-allow-origin"], "https://app.test");
    assert_eq!(res.headers()["access-control-allow-methods"], "GET");
    assert_eq!(res.headers()["access-control-allow-headers"], "*");
}
