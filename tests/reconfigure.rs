//! Runtime reconfiguration: generation swaps, listener rebinds and metrics lifecycle.

use std::time::Duration;

use axum::http::StatusCode;
use crauti::config::Middlewares;
use crauti::MountPoint;

mod common;
use common::{client, mount, TestGateway};

#[tokio::test]
async fn test_update_rebinds_and_replaces_metrics() {
    let (backend, _) = common::start_recording_backend().await;
    let mut gw = TestGateway::start(vec![mount("/one/", backend, Middlewares::default())]).await;
    let first_addr = gw.addr;

    let res = client().get(gw.url("/one/a")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert!(gw.metrics.render().contains("mountPath=\"/one/\""));

    gw.update(vec![mount("/two/", backend, Middlewares::default())])
        .await;
    assert_eq!(gw.addr, first_addr);

    let res = client().get(gw.url("/one/a")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let res = client().get(gw.url("/two/b")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.unwrap(), "/b");

    let text = gw.metrics.render();
    assert!(!text.contains("mountPath=\"/one/\""));
    assert!(text.contains("mountPath=\"/two/\""));
}

#[tokio::test]
async fn test_rejected_update_keeps_serving() {
    let backend = common::start_mock_backend("still here").await;
    let gw = TestGateway::start(vec![mount("/", backend, Middlewares::default())]).await;
    let before = gw.gateway.current().id;

    assert!(gw
        .gateway
        .update(vec![MountPoint::new("relative", "ftp://nowhere")])
        .is_err());
    assert_eq!(gw.gateway.current().id, before);

    let res = client().get(gw.url("/")).send().await.unwrap();
    assert_eq!(res.text().await.unwrap(), "still here");
}

#[tokio::test]
async fn test_rapid_updates_settle_on_newest() {
    let backend = common::start_mock_backend("ok").await;
    let mut gw = TestGateway::start(vec![mount("/a/", backend, Middlewares::default())]).await;

    gw.gateway
        .update(vec![mount("/b/", backend, Middlewares::default())])
        .unwrap();
    gw.update(vec![mount("/c/", backend, Middlewares::default())])
        .await;

    assert_eq!(gw.handle.bound().generation, gw.gateway.current().id);
    let res = client().get(gw.url("/c/")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let res = client().get(gw.url("/b/")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_in_flight_request_finishes_on_old_generation() {
    let (old_backend, _) =
        common::start_recording_backend_with_delay(Duration::from_millis(800)).await;
    let new_backend = common::start_mock_backend("new").await;
    let mut gw = TestGateway::start(vec![mount("/", old_backend, Middlewares::default())]).await;

    let url = gw.url("/slow");
    let in_flight = tokio::spawn(async move {
        let res = client().get(url).send().await.unwrap();
        (res.status(), res.text().await.unwrap())
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    gw.update(vec![mount("/", new_backend, Middlewares::default())])
        .await;

    let (status, body) = in_flight.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "/slow");

    let res = client().get(gw.url("/slow")).send().await.unwrap();
    assert_eq!(res.text().await.unwrap(), "new");
}
