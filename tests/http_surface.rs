use std::sync::Arc;
use std::time::Duration;

use axum_test::TestServer;
use serde_json::Value;
use tokio::sync::RwLock;

use streamnzb::config::Settings;
use streamnzb::indexer::Aggregator;
use streamnzb::oracle::OracleClient;
use streamnzb::server::{AppState, router};
use streamnzb::session::SessionManager;
use streamnzb::triage::{FilterConfig, TriageService, WeightConfig};
use streamnzb::validation::{ValidationChecker, ValidationConfig};

fn settings() -> Settings {
    Settings {
        addon_port: 7990,
        addon_base_url: "http://127.0.0.1:7990".to_string(),
        addon_security_token: None,
        log_level: None,
        cache_ttl_seconds: 86_400,
        validation_sample_size: 10,
        validation_threshold: 1.0,
        validation_max_providers: 3,
        validation_max_per_provider: 4,
        max_streams: 6,
        nzb_download_timeout_seconds: 30,
        session_idle_ttl_seconds: 300,
        unavailable_video_url: "https://static.streamnzb.dev/unavailable.mp4".to_string(),
        data_dir: "./data".to_string(),
        nzbcheck_url: None,
        nzbcheck_api_key: None,
        nntp_proxy_enabled: false,
        nntp_proxy_host: "127.0.0.1".to_string(),
        nntp_proxy_port: 1190,
        nntp_proxy_auth_user: String::new(),
        nntp_proxy_auth_pass: String::new(),
    }
}

fn empty_state(settings: Settings) -> AppState {
    let aggregator = Arc::new(Aggregator::new(vec![]));
    AppState {
        settings: Arc::new(settings.clone()),
        aggregator: Arc::clone(&aggregator),
        triage: Arc::new(TriageService::new(
            FilterConfig::default(),
            WeightConfig::default(),
        )),
        validator: Arc::new(ValidationChecker::new(vec![], ValidationConfig::default())),
        oracle: Arc::new(OracleClient::disabled()),
        sessions: SessionManager::new(
            vec![],
            aggregator,
            Duration::from_secs(settings.session_idle_ttl_seconds),
        ),
        sources: Arc::new(RwLock::new(vec![])),
    }
}

#[tokio::test]
async fn health_reports_ok() {
    let server = TestServer::new(router(empty_state(settings()))).unwrap();
    let response = server.get("/health").await;
    response.assert_status_ok();

    let body: Value = response.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["addon"], "streamnzb");
}

#[tokio::test]
async fn manifest_announces_stream_resource() {
    let server = TestServer::new(router(empty_state(settings()))).unwrap();
    let body: Value = server.get("/manifest.json").await.json();

    assert_eq!(body["resources"][0], "stream");
    assert_eq!(body["types"][0], "movie");
    assert_eq!(body["types"][1], "series");
    assert_eq!(body["idPrefixes"][0], "tt");
    assert!(body["catalogs"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn empty_pool_yields_empty_streams_not_error() {
    let server = TestServer::new(router(empty_state(settings()))).unwrap();
    let response = server.get("/stream/movie/tt1375666.json").await;
    response.assert_status_ok();

    let body: Value = response.json();
    assert!(body["streams"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn unknown_session_is_404() {
    let server = TestServer::new(router(empty_state(settings()))).unwrap();
    let response = server.get("/play/deadbeefdeadbeefdeadbeefdeadbeef").await;
    response.assert_status(axum::http::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn token_prefix_gates_every_route() {
    let mut settings = settings();
    settings.addon_security_token = Some("sekret".to_string());
    let server = TestServer::new(router(empty_state(settings))).unwrap();

    // No token and a wrong token are both 401.
    server
        .get("/manifest.json")
        .await
        .assert_status(axum::http::StatusCode::UNAUTHORIZED);
    server
        .get("/wrong/manifest.json")
        .await
        .assert_status(axum::http::StatusCode::UNAUTHORIZED);

    // The right prefix reaches the handler.
    let response = server.get("/sekret/manifest.json").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["name"], "StreamNZB");
}

#[tokio::test]
async fn malformed_stream_id_is_rejected() {
    let server = TestServer::new(router(empty_state(settings()))).unwrap();
    let response = server.get("/stream/movie/bogus:1.json").await;
    response.assert_status(axum::http::StatusCode::BAD_REQUEST);
}
