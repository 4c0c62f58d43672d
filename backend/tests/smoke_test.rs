use autobatch_backend::balancer::HttpWorkerClient;
use autobatch_backend::test_util::{create_test_state, test_config, MockColdStartProxy};
use autobatch_backend::{create_router, Config};
use http::StatusCode;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SECRET: &str = "test-secret";

fn app_with(config: Config) -> axum::Router {
    let client = Arc::new(HttpWorkerClient::new(&config.balancer.endpoint));
    create_router(create_test_state(config, client, None))
}

async fn send_request(
    app: &axum::Router,
    method: http::Method,
    uri: &str,
    body: Option<String>,
    token: Option<&str>,
) -> (StatusCode, Value) {
    let mut req_builder = http::Request::builder().method(method).uri(uri);

    if body.is_some() {
        req_builder = req_builder.header("Content-Type", "application/json");
    }
    if let Some(token) = token {
        req_builder = req_builder.header("Authorization", format!("Bearer {}", token));
    }

    let req = req_builder
        .body(match body {
            Some(b) => axum::body::Body::from(b),
            None => axum::body::Body::empty(),
        })
        .unwrap();

    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn register_workers(app: &axum::Router, workers: &[String]) {
    let (status, _) = send_request(
        app,
        http::Method::PUT,
        "/system/update-servers",
        Some(serde_json::to_string(workers).unwrap()),
        Some(SECRET),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_health() {
    let app = app_with(test_config());

    let (status, body) = send_request(&app, http::Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_predict_without_workers_is_503() {
    let app = app_with(test_config());

    let (status, body) = send_request(
        &app,
        http::Method::POST,
        "/predict",
        Some(r#"{"text": "hello"}"#.to_string()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["type"], "no_healthy_workers");
}

#[tokio::test]
async fn test_predict_malformed_json_is_422() {
    let app = app_with(test_config());

    let (status, body) = send_request(
        &app,
        http::Method::POST,
        "/predict",
        Some("{not json".to_string()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["type"], "validation");
}

#[tokio::test]
async fn test_predict_routes_through_worker() {
    let worker = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/predict"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"outputs": [{"label": "cat"}]})),
        )
        .mount(&worker)
        .await;

    let mut config = test_config();
    config.balancer.max_batch_size = 1;
    let app = app_with(config);
    register_workers(&app, &[worker.uri()]).await;

    let (status, body) = send_request(
        &app,
        http::Method::POST,
        "/predict",
        Some(r#"{"image": "abc"}"#.to_string()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"label": "cat"}));
}

#[tokio::test]
async fn test_predict_worker_failure_is_500() {
    let worker = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&worker)
        .await;

    let app = app_with(test_config());
    register_workers(&app, &[worker.uri()]).await;

    let (status, body) = send_request(
        &app,
        http::Method::POST,
        "/predict",
        Some("1".to_string()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"]["type"], "backend_error");
}

#[tokio::test]
async fn test_predict_uses_cold_start_proxy() {
    let config = test_config();
    let client = Arc::new(HttpWorkerClient::new(&config.balancer.endpoint));
    let proxy = Arc::new(MockColdStartProxy::new(json!({"label": "fallback"})));
    let app = create_router(create_test_state(config, client, Some(proxy.clone())));

    let (status, body) = send_request(
        &app,
        http::Method::POST,
        "/predict",
        Some("{}".to_string()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"label": "fallback"}));
    assert_eq!(proxy.calls(), 1);
}

#[tokio::test]
async fn test_system_endpoints_require_secret() {
    let app = app_with(test_config());

    let (status, body) =
        send_request(&app, http::Method::GET, "/system/info", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["type"], "unauthorized");

    let (status, _) =
        send_request(&app, http::Method::GET, "/system/info", None, Some("wrong")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send_request(
        &app,
        http::Method::PUT,
        "/system/update-servers",
        Some(r#"["http://w1"]"#.to_string()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_system_endpoints_open_without_secret() {
    let mut config = test_config();
    config.admin.auth_secret = None;
    let app = app_with(config);

    let (status, body) =
        send_request(&app, http::Method::GET, "/system/info", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["num_workers"], 0);
}

#[tokio::test]
async fn test_update_servers_is_idempotent() {
    let app = app_with(test_config());
    let servers = r#"["http://w1", "http://w2"]"#.to_string();

    let (status, body) = send_request(
        &app,
        http::Method::PUT,
        "/system/update-servers",
        Some(servers.clone()),
        Some(SECRET),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["added"], json!(["http://w1", "http://w2"]));

    let (status, body) = send_request(
        &app,
        http::Method::PUT,
        "/system/update-servers",
        Some(servers),
        Some(SECRET),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["added"], json!([]));
    assert_eq!(body["removed"], json!([]));

    let (_, info) =
        send_request(&app, http::Method::GET, "/system/info", None, Some(SECRET)).await;
    assert_eq!(info["num_workers"], 2);
    assert_eq!(info["servers"], json!(["http://w1", "http://w2"]));
}

#[tokio::test]
async fn test_num_requests_is_public() {
    let app = app_with(test_config());

    let (status, body) =
        send_request(&app, http::Method::GET, "/num-requests", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!(0));
}

#[tokio::test]
async fn test_metrics_exposes_gauges() {
    let app = app_with(test_config());

    let req = http::Request::builder()
        .uri("/metrics")
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("autobatch_up 1"));
    assert!(text.contains("autobatch_workers 0"));
    assert!(text.contains("autobatch_pending_requests 0"));
}
