//! HttpProxy against wiremock upstreams
#![allow(clippy::unwrap_used, clippy::expect_used)]

use slipstream_cache::{CacheStore, MemoryStore};
use slipstream_fetch::{
    BaseProxy, DeviceClass, DeviceProfiler, FetchConfig, FetchError, FetchOptions,
    FetchOrchestrator, HttpProxy, ProxyRequest,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_string, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn proxy() -> HttpProxy {
    let _ = tracing_subscriber::fmt::try_init();
    let _ = rustls::crypto::ring::default_provider().install_default();
    HttpProxy::new().expect("client should build")
}

#[tokio::test]
async fn forwards_method_headers_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/save"))
        .and(header("x-slot", "3"))
        .and(body_string("state"))
        .respond_with(
            ResponseTemplate::new(201)
                .insert_header("content-type", "application/json")
                .set_body_string(r#"{"ok":true}"#),
        )
        .expect(1)
        .mount(&server)
        .await;

    let mut request = ProxyRequest::new("POST", format!("{}/api/save", server.uri()));
    request.headers.insert("X-Slot", "3");
    request.headers.insert("Host", "ignored.example");
    request.body = "state".into();

    let response = proxy()
        .fetch(&request, FetchOptions::default())
        .await
        .unwrap();

    assert_eq!(response.status, 201);
    assert_eq!(response.content_type(), Some("application/json"));
    assert_eq!(&response.body[..], br#"{"ok":true}"#);
}

#[tokio::test]
async fn repeated_set_cookie_headers_stay_separate() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/login"))
        .respond_with(
            ResponseTemplate::new(200)
                .append_header("set-cookie", "session=abc; Expires=Wed, 21 Oct 2026 07:28:00 GMT")
                .append_header("set-cookie", "theme=dark"),
        )
        .mount(&server)
        .await;

    let response = proxy()
        .fetch(
            &ProxyRequest::get(format!("{}/login", server.uri())),
            FetchOptions::default(),
        )
        .await
        .unwrap();

    let cookies: Vec<&str> = response.headers.get_all("set-cookie").collect();
    assert_eq!(
        cookies,
        vec!["session=abc; Expires=Wed, 21 Oct 2026 07:28:00 GMT", "theme=dark"]
    );
}

#[tokio::test]
async fn error_statuses_are_responses() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing.js"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let response = proxy()
        .fetch(
            &ProxyRequest::get(format!("{}/missing.js", server.uri())),
            FetchOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(response.status, 404);
}

#[tokio::test]
async fn cancellation_aborts_the_call() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
        .mount(&server)
        .await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let options = FetchOptions {
        cancel,
        ..FetchOptions::default()
    };
    let err = proxy()
        .fetch(&ProxyRequest::get(format!("{}/slow", server.uri())), options)
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::Cancelled));
    assert!(err.should_retry());
}

#[tokio::test]
async fn rejects_relative_and_non_http_urls() {
    let proxy = proxy();
    for url in ["/relative/app.js", "ftp://example.com/app.js"] {
        let err = proxy
            .fetch(&ProxyRequest::get(url), FetchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::InvalidRequest(_)), "{url}: {err}");
        assert!(!err.should_retry());
    }
}

#[tokio::test]
async fn orchestrator_caches_through_http_proxy() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/static/app.css"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/css")
                .set_body_string("body{}"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let config = FetchConfig {
        retry_count: 0,
        maintenance_probability: 0.0,
        slow_maintenance_probability: 0.0,
        ..FetchConfig::default()
    };
    let cache =
        CacheStore::new("t-v1", Arc::new(MemoryStore::new()), config.cache_limits()).unwrap();
    let orchestrator = FetchOrchestrator::new(
        config,
        Arc::new(DeviceProfiler::with_class(DeviceClass::Slow)),
        Arc::new(proxy()),
        Some(cache),
    )
    .unwrap();

    let request = ProxyRequest::get(format!("{}/static/app.css", server.uri()));
    let first = orchestrator.fetch(&request).await.unwrap();
    let second = orchestrator.fetch(&request).await.unwrap();

    assert_eq!(first.body, second.body);
    assert_eq!(orchestrator.stats().cached, 1);
}
