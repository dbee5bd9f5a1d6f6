use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
    response::Response,
};
use http_body_util::BodyExt;
use keystash::application::bulk_delete::{BulkDeleteConfig, BulkDeleteWorkflow};
use keystash::application::cache::{CacheService, CacheServiceConfig};
use keystash::application::cache_names::CacheNameRegistry;
use keystash::application::expiry::ExpiryScheduler;
use keystash::application::jobs::JobWorkerContext;
use keystash::application::store::ChunkedCacheStore;
use keystash::infra::http::{self, HttpState, ORG_HEADER, REQUEST_ID_HEADER};
use keystash::infra::jobs::InlineJobRunner;
use keystash::infra::memory::MemoryRepositories;
use keystash::projection::{EventQueue, ProjectionConfig, ProjectionConsumer, UsageLedger};
use keystash_api_types::{
    BatchCacheResponse, BatchDeleteCacheResponse, BatchGetCacheResponse, CacheGetKeysResponse,
    CacheGetResponse, CacheNameResponse, DeletionAccepted, DeletionJobView, DeletionStatus,
    TenantUsageResponse,
};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tower::ServiceExt;

const OCTET_STREAM: &str = "application/octet-stream";

struct TestApp {
    router: Router,
    consumer: Arc<ProjectionConsumer>,
}

impl TestApp {
    fn new(config: CacheServiceConfig) -> Self {
        let repos = Arc::new(MemoryRepositories::new());
        let queue = Arc::new(EventQueue::new(repos.clone()));
        let store = Arc::new(ChunkedCacheStore::new(repos.clone(), queue.clone()));
        let expiry = Arc::new(ExpiryScheduler::new(store.clone()));
        let ledger = Arc::new(UsageLedger::new(repos.clone()));
        let consumer = Arc::new(ProjectionConsumer::new(
            ProjectionConfig::default(),
            queue,
            repos.clone(),
            ledger.clone(),
        ));
        let names = CacheNameRegistry::new(repos.clone());
        let workflow = Arc::new(BulkDeleteWorkflow::new(
            repos.clone(),
            repos.clone(),
            store.clone(),
            expiry.clone(),
            names.clone(),
            BulkDeleteConfig::default(),
        ));
        let jobs = Arc::new(InlineJobRunner::new(JobWorkerContext {
            workflow: workflow.clone(),
        }));
        let cache = Arc::new(CacheService::new(
            store, expiry, repos, ledger, names, workflow, jobs, config,
        ));

        Self {
            router: http::build_router(HttpState::new(cache, None), 1 << 20),
            consumer,
        }
    }

    async fn send(&self, request: Request<Body>) -> Response {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router should respond")
    }

    async fn call(&self, method: Method, uri: &str) -> Response {
        self.send(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .expect("request should build"),
        )
        .await
    }

    async fn call_json(&self, method: Method, uri: &str, body: Value) -> Response {
        self.send(
            Request::builder()
                .method(method)
                .uri(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .expect("request should build"),
        )
        .await
    }

    async fn put_binary(&self, uri: &str, org: Option<&str>, payload: &[u8]) -> Response {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, OCTET_STREAM);
        if let Some(org) = org {
            builder = builder.header(ORG_HEADER, org);
        }
        self.send(
            builder
                .body(Body::from(payload.to_vec()))
                .expect("request should build"),
        )
        .await
    }

    async fn project(&self) {
        self.consumer.consume_all().await;
    }
}

async fn body_bytes(response: Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .expect("body should collect")
        .to_bytes()
        .to_vec()
}

async fn body_json<T: DeserializeOwned>(response: Response) -> T {
    let bytes = body_bytes(response).await;
    serde_json::from_slice(&bytes).expect("body should be valid json")
}

async fn error_code(response: Response) -> String {
    let body: Value = body_json(response).await;
    body["error"]["code"]
        .as_str()
        .expect("error code present")
        .to_string()
}

fn small_chunks() -> CacheServiceConfig {
    CacheServiceConfig {
        max_payload_size: NonZeroUsize::new(16).expect("non-zero"),
        ..CacheServiceConfig::default()
    }
}

#[tokio::test]
async fn binary_set_then_get_returns_payload() {
    let app = TestApp::new(CacheServiceConfig::default());

    let response = app.put_binary("/cache/sessions/user-1", None, b"hello").await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app.call(Method::GET, "/cache/sessions/user-1").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).map(|v| v.as_bytes()),
        Some(OCTET_STREAM.as_bytes())
    );
    assert_eq!(body_bytes(response).await, b"hello");
}

#[tokio::test]
async fn binary_set_requires_octet_stream() {
    let app = TestApp::new(CacheServiceConfig::default());

    let response = app
        .send(
            Request::builder()
                .method(Method::POST)
                .uri("/cache/sessions/user-1")
                .header(header::CONTENT_TYPE, "text/plain")
                .body(Body::from("hello"))
                .expect("request should build"),
        )
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "invalid_content_type");
}

#[tokio::test]
async fn oversized_payload_round_trips_through_chunks() {
    let app = TestApp::new(small_chunks());
    let payload: Vec<u8> = (0..100u8).collect();

    let response = app.put_binary("/cache/blobs/big/60", None, &payload).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app.call(Method::GET, "/cache/blobs/big").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, payload);

    let response = app.call(Method::GET, "/get/blobs/big").await;
    let body: CacheGetResponse = body_json(response).await;
    assert!(body.success);
    assert_eq!(body.value, payload);
}

#[tokio::test]
async fn json_set_and_get_use_base64_values() {
    let app = TestApp::new(CacheServiceConfig::default());

    let response = app
        .call_json(
            Method::POST,
            "/set",
            json!({"cacheName": "sessions", "key": "user-1", "value": "aGVsbG8="}),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app.call(Method::GET, "/get/sessions/user-1").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = body_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["value"], "aGVsbG8=");
    assert_eq!(body["cacheName"], "sessions");
}

#[tokio::test]
async fn missing_entries_are_not_found() {
    let app = TestApp::new(CacheServiceConfig::default());

    let response = app.call(Method::GET, "/cache/sessions/missing").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "not_found");

    let response = app.call(Method::DELETE, "/cache/sessions/missing").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app.call(Method::GET, "/get/sessions/missing").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: CacheGetResponse = body_json(response).await;
    assert!(!body.success);
    assert!(body.value.is_empty());
}

#[tokio::test]
async fn delete_removes_entry_and_second_delete_is_not_found() {
    let app = TestApp::new(CacheServiceConfig::default());
    app.put_binary("/cache/sessions/user-1", None, b"x").await;

    let response = app.call(Method::DELETE, "/cache/sessions/user-1").await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = app.call(Method::GET, "/cache/sessions/user-1").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app.call(Method::DELETE, "/cache/sessions/user-1").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cache_name_lifecycle() {
    let app = TestApp::new(CacheServiceConfig::default());

    let response = app
        .call_json(
            Method::POST,
            "/cache-names",
            json!({"cacheName": "sessions", "description": "user sessions"}),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app
        .call_json(
            Method::PUT,
            "/cache-names",
            json!({"cacheName": "sessions", "description": "renamed"}),
        )
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = app.call(Method::GET, "/cache-names/sessions").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: CacheNameResponse = body_json(response).await;
    assert_eq!(body.description.as_deref(), Some("renamed"));

    let response = app
        .call_json(Method::PUT, "/cache-names", json!({"cacheName": "unknown"}))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "cache_name_not_found");
}

#[tokio::test]
async fn keys_are_listed_once_projected() {
    let app = TestApp::new(CacheServiceConfig::default());
    for key in ["b", "a", "c"] {
        app.put_binary(&format!("/cache/sessions/{key}"), None, b"v")
            .await;
    }

    app.project().await;
    let response = app.call(Method::GET, "/cache-names/sessions/keys").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: CacheGetKeysResponse = body_json(response).await;
    assert_eq!(body.keys, vec!["a", "b", "c"]);
}

async fn wait_for_completion(app: &TestApp, job_id: uuid::Uuid) -> DeletionJobView {
    for _ in 0..200 {
        let response = app.call(Method::GET, &format!("/deletions/{job_id}")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let view: DeletionJobView = body_json(response).await;
        if view.status == DeletionStatus::Complete {
            return view;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("deletion job {job_id} did not complete");
}

#[tokio::test]
async fn deleting_a_cache_name_removes_keys_and_record() {
    let app = TestApp::new(CacheServiceConfig::default());
    app.call_json(Method::POST, "/cache-names", json!({"cacheName": "sessions"}))
        .await;
    for key in ["a", "b", "c"] {
        app.put_binary(&format!("/cache/sessions/{key}"), None, b"v")
            .await;
    }
    app.project().await;

    let response = app.call(Method::DELETE, "/cache-names/sessions").await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let accepted: DeletionAccepted = body_json(response).await;
    assert!(!accepted.flush_only);

    let view = wait_for_completion(&app, accepted.job_id).await;
    assert_eq!(view.keys_total, 3);

    let response = app.call(Method::GET, "/cache/sessions/a").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let response = app.call(Method::GET, "/cache-names/sessions").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    app.project().await;
    let response = app.call(Method::GET, "/cache-names/sessions/keys").await;
    let body: CacheGetKeysResponse = body_json(response).await;
    assert!(body.keys.is_empty());
}

#[tokio::test]
async fn flushing_keeps_the_cache_name() {
    let app = TestApp::new(CacheServiceConfig::default());
    app.call_json(Method::POST, "/cache-names", json!({"cacheName": "sessions"}))
        .await;
    app.put_binary("/cache/sessions/a", None, b"v").await;
    app.project().await;

    let response = app.call(Method::PUT, "/cache-names/sessions/flush").await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let accepted: DeletionAccepted = body_json(response).await;
    assert!(accepted.flush_only);

    wait_for_completion(&app, accepted.job_id).await;
    let response = app.call(Method::GET, "/cache/sessions/a").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let response = app.call(Method::GET, "/cache-names/sessions").await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn unknown_deletion_job_is_not_found() {
    let app = TestApp::new(CacheServiceConfig::default());
    let response = app
        .call(Method::GET, &format!("/deletions/{}", uuid::Uuid::new_v4()))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn tenant_usage_tracks_writes_and_resets() {
    let app = TestApp::new(CacheServiceConfig::default());
    app.put_binary("/cache/sessions/a", Some("acme"), b"12345")
        .await;
    app.put_binary("/cache/sessions/b", Some("acme"), b"123").await;
    app.project().await;

    let response = app.call(Method::GET, "/orgs/acme/usage").await;
    let usage: TenantUsageResponse = body_json(response).await;
    assert_eq!(usage.cache_count, 2);
    assert_eq!(usage.total_bytes_cached, 8);

    let response = app.call(Method::POST, "/orgs/acme/usage/reset").await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app.call(Method::GET, "/orgs/acme/usage").await;
    let usage: TenantUsageResponse = body_json(response).await;
    assert_eq!(usage.cache_count, 0);
    assert_eq!(usage.total_bytes_cached, 0);
}

#[tokio::test]
async fn writes_over_tenant_allotment_are_rejected() {
    let app = TestApp::new(CacheServiceConfig {
        max_bytes_per_org: Some(5),
        ..CacheServiceConfig::default()
    });

    let response = app
        .put_binary("/cache/sessions/a", Some("acme"), b"0123456789")
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    app.project().await;

    let response = app.put_binary("/cache/sessions/b", Some("acme"), b"x").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "quota_exceeded");

    let response = app.put_binary("/cache/sessions/c", Some("other"), b"x").await;
    assert_eq!(response.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn writes_need_a_cache_name_when_configured() {
    let app = TestApp::new(CacheServiceConfig {
        cache_name_needed_first: true,
        ..CacheServiceConfig::default()
    });

    let response = app.put_binary("/cache/sessions/a", None, b"x").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "cache_name_not_found");

    app.call_json(Method::POST, "/cache-names", json!({"cacheName": "sessions"}))
        .await;
    let response = app.put_binary("/cache/sessions/a", None, b"x").await;
    assert_eq!(response.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn batch_operations_report_per_item_results() {
    let app = TestApp::new(CacheServiceConfig::default());

    let response = app
        .call_json(
            Method::POST,
            "/batch",
            json!({"cacheRequests": [
                {"cacheName": "sessions", "key": "a", "value": "YQ=="},
                {"cacheName": "sessions", "key": "b", "value": "Yg=="}
            ]}),
        )
        .await;
    let body: BatchCacheResponse = body_json(response).await;
    assert!(body.complete);
    assert_eq!(body.results.len(), 2);

    let lookups = json!({"getCachedBatch": [
        {"cacheName": "sessions", "key": "a"},
        {"cacheName": "sessions", "key": "missing"}
    ]});
    let response = app.call_json(Method::POST, "/batch/get", lookups.clone()).await;
    let body: BatchGetCacheResponse = body_json(response).await;
    assert!(!body.complete);
    assert!(body.results[0].success);
    assert_eq!(body.results[0].value, b"a");
    assert!(!body.results[1].success);

    let response = app.call_json(Method::DELETE, "/batch", lookups).await;
    let body: BatchDeleteCacheResponse = body_json(response).await;
    assert!(!body.success);
    assert!(body.cache_delete_responses[0].success);
    assert!(!body.cache_delete_responses[1].success);
}

#[tokio::test]
async fn health_and_request_id() {
    let app = TestApp::new(CacheServiceConfig::default());

    let response = app.call(Method::GET, "/health").await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(response.headers().contains_key(REQUEST_ID_HEADER));

    let response = app
        .send(
            Request::builder()
                .uri("/health")
                .header(REQUEST_ID_HEADER, "req-42")
                .body(Body::empty())
                .expect("request should build"),
        )
        .await;
    assert_eq!(
        response.headers().get(REQUEST_ID_HEADER).map(|v| v.as_bytes()),
        Some(&b"req-42"[..])
    );
}
