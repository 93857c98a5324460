use axum::{
    body::Body,
    http::{Request, StatusCode},
    response::Response,
    Router,
};
use cadence_api::{routes::api_router, AppState};
use cadence_queue::{
    DlqConfig, DlqService, JobId, LeaseManager, MemoryQueue, NewJob, OrchestratorConfig,
    PolicyRegistry, QueueBackend, RetryPolicy, WorkerOrchestrator,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt; // for `oneshot`

struct Harness {
    router: Router,
    queue: Arc<MemoryQueue>,
}

fn setup() -> Harness {
    let queue = Arc::new(MemoryQueue::new());
    let backend: Arc<dyn QueueBackend> = queue.clone();
    let policies = PolicyRegistry::new(RetryPolicy::default())
        .with_kind("watchlist", RetryPolicy::default());
    let leases = Arc::new(LeaseManager::new(backend.clone(), policies));
    let dlq = Arc::new(DlqService::new(backend, DlqConfig::default()));
    let orchestrator = Arc::new(WorkerOrchestrator::new(
        leases.clone(),
        OrchestratorConfig::default(),
    ));

    Harness {
        router: api_router(AppState::new(leases, dlq, orchestrator)),
        queue,
    }
}

async fn dead_letter(queue: &MemoryQueue, error: &str, when: DateTime<Utc>) -> JobId {
    let id = queue
        .enqueue(NewJob::new("watchlist", json!({})), when)
        .await
        .unwrap();
    queue
        .lease("watchlist", 1, "seed", Duration::seconds(30), when)
        .await
        .unwrap();
    queue.dead_letter(id, "seed", error, when).await.unwrap();
    id
}

async fn send(router: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let response: Response = router.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_list_dead_letters_envelope() {
    let h = setup();
    let now = Utc::now();
    dead_letter(&h.queue, "network timeout while fetching", now).await;
    dead_letter(&h.queue, "http 500", now).await;

    let (status, json) = send(&h.router, get("/dlq?reason=network&page_size=10")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["ok"], true);
    assert!(json["error"].is_null());
    assert_eq!(json["data"]["total"], 1);
    assert_eq!(json["data"]["page"], 1);
    assert_eq!(json["data"]["page_size"], 10);
    assert_eq!(json["data"]["items"][0]["reason"], "network");
}

#[tokio::test]
async fn test_list_rejects_oversized_page() {
    let h = setup();
    let (status, json) = send(&h.router, get("/dlq?page_size=101")).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json["ok"], false);
    assert_eq!(json["error"]["code"], "VALIDATION_ERROR");

    let (status, _) = send(&h.router, get("/dlq?order_by=priority")).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_requeue_reports_skips() {
    let h = setup();
    let now = Utc::now();
    let dead = dead_letter(&h.queue, "network down", now).await;
    let pending = h
        .queue
        .enqueue(NewJob::new("watchlist", json!({})), now)
        .await
        .unwrap();

    let (status, json) = send(
        &h.router,
        post_json(
            "/dlq/requeue",
            json!({ "ids": [dead.to_string(), pending.to_string()] }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["requeued"], json!([dead.to_string()]));
    assert_eq!(
        json["data"]["skipped"],
        json!([{ "id": pending.to_string(), "reason": "already_queued" }])
    );
}

#[tokio::test]
async fn test_requeue_validates_id_count() {
    let h = setup();
    let (status, json) = send(&h.router, post_json("/dlq/requeue", json!({ "ids": [] }))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json["error"]["code"], "VALIDATION_ERROR");

    let ids: Vec<String> = (1..=501).map(|i| i.to_string()).collect();
    let (status, _) = send(&h.router, post_json("/dlq/requeue", json!({ "ids": ids }))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = send(&h.router, post_json("/dlq/requeue", json!({}))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_purge_by_age_and_reason() {
    let h = setup();
    let jan = Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap();
    let mar = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
    let old_network = dead_letter(&h.queue, "network timeout", jan).await;
    dead_letter(&h.queue, "http 502", jan).await;
    dead_letter(&h.queue, "network timeout", mar).await;

    let (status, json) = send(
        &h.router,
        post_json(
            "/dlq/purge",
            json!({ "older_than": "2025-02-01T00:00:00Z", "reason": "network" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["purged"], 1);
    assert!(h.queue.get_job(old_network).await.unwrap().is_none());
    assert_eq!(h.queue.len().await, 2);
}

#[tokio::test]
async fn test_purge_requires_exactly_one_selector() {
    let h = setup();
    let dead = dead_letter(&h.queue, "network", Utc::now()).await;

    for body in [
        json!({}),
        json!({ "ids": [dead.to_string()], "older_than": "2030-01-01T00:00:00Z" }),
    ] {
        let (status, json) = send(&h.router, post_json("/dlq/purge", body)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json["ok"], false);
    }
    assert!(h.queue.get_job(dead).await.unwrap().is_some());
}

#[tokio::test]
async fn test_stats() {
    let h = setup();
    let now = Utc::now();
    dead_letter(&h.queue, "network timeout while fetching", now).await;
    dead_letter(&h.queue, "network reset", now - Duration::days(3)).await;
    dead_letter(&h.queue, "invalid payload: missing url", now).await;

    let (status, json) = send(&h.router, get("/dlq/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["total"], 3);
    assert_eq!(json["data"]["by_reason"]["network"], 2);
    assert_eq!(json["data"]["by_reason"]["invalid"], 1);
    assert_eq!(json["data"]["last_24h"], 2);
}

#[tokio::test]
async fn test_create_and_fetch_job() {
    let h = setup();

    let (status, json) = send(
        &h.router,
        post_json(
            "/api/v1/jobs",
            json!({ "kind": "watchlist", "payload": { "artist_id": 9 }, "idempotency_key": "a-9" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = json["data"]["id"].as_str().unwrap().to_string();

    // Same key returns the same job
    let (_, again) = send(
        &h.router,
        post_json(
            "/api/v1/jobs",
            json!({ "kind": "watchlist", "payload": {}, "idempotency_key": "a-9" }),
        ),
    )
    .await;
    assert_eq!(again["data"]["id"], id.as_str());

    let (status, json) = send(&h.router, get(&format!("/api/v1/jobs/{}", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["status"], "pending");
    assert_eq!(json["data"]["payload"]["artist_id"], 9);

    let (status, json) = send(&h.router, get("/api/v1/jobs/424242")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"]["code"], "NOT_FOUND");

    let (status, _) = send(
        &h.router,
        post_json("/api/v1/jobs", json!({ "kind": "nope", "payload": {} })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_create_job_rejects_unrepresentable_delay() {
    let h = setup();

    for delay in [json!(9_000_000_000_000u64), json!(u64::MAX)] {
        let (status, json) = send(
            &h.router,
            post_json(
                "/api/v1/jobs",
                json!({ "kind": "watchlist", "payload": {}, "delay_secs": delay }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json["error"]["code"], "VALIDATION_ERROR");
    }
    assert!(h.queue.is_empty().await);

    let (status, json) = send(
        &h.router,
        post_json(
            "/api/v1/jobs",
            json!({ "kind": "watchlist", "payload": {}, "delay_secs": 3600 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id: i64 = json["data"]["id"].as_str().unwrap().parse().unwrap();
    let job = h.queue.get_job(id).await.unwrap().unwrap();
    assert!(job.visible_at > Utc::now() + Duration::minutes(59));
}

#[tokio::test]
async fn test_health_endpoints() {
    let h = setup();

    let (status, json) = send(&h.router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["workers_running"], false);

    let (status, json) = send(&h.router, get("/health/workers")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["reaper"]["running"], false);

    let (status, json) = send(&h.router, get("/api-docs/openapi.json")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["paths"]["/dlq/purge"].is_object());
}
