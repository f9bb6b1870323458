use axum::body::Body;
use axum::http::{Request, StatusCode};
use chainwatch_db::chain::{append_node, NewChainNode};
use chainwatch_db::{bootstrap_resources, create_pool, run_migrations, DbPool, PoolSettings};
use chainwatch_server::{app, unix_now, AppState, WatchSettings};
use chainwatch_types::{
    ClusterTime, Cursor, CursorType, ErrorCode, EventType, ResourceRegistry, CHAIN_TTL_SECONDS,
    NO_EVENT_CURSOR,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn setup() -> (AppState, Arc<ResourceRegistry>) {
    let pool = create_pool(
        ":memory:",
        PoolSettings {
            busy_timeout_ms: 5_000,
            pool_max_size: 1,
        },
    )
    .expect("failed to create pool");
    let registry = Arc::new(ResourceRegistry::builtin());
    {
        let conn = pool.get().expect("failed to get connection");
        run_migrations(&conn).expect("failed to run migrations");
        bootstrap_resources(&conn, &registry, unix_now()).expect("bootstrap should succeed");
    }

    let state = AppState {
        pool,
        registry: registry.clone(),
        watch: WatchSettings {
            hold_timeout: Duration::from_millis(300),
            loop_interval: Duration::from_millis(20),
            batch_limit: 200,
        },
    };
    (state, registry)
}

fn append(pool: &DbPool, registry: &ResourceRegistry, ty: CursorType, oid: &str, ago: i64) -> String {
    let conn = pool.get().unwrap();
    let key = registry.key_for(ty).unwrap();
    let sec = u32::try_from(unix_now() - ago).unwrap();
    append_node(
        &conn,
        key,
        &NewChainNode::new(oid, EventType::Create, ClusterTime::new(sec, 0))
            .with_detail(json!({"bk_host_id": 7, "bk_host_innerip": "10.0.0.7"})),
    )
    .unwrap()
    .cursor
}

async fn post_watch(state: &AppState, body: Value) -> (StatusCode, Value) {
    let response = app(state.clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/watch")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn health_check_returns_ok() {
    let (state, _) = setup();
    let response = app(state)
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn from_now_on_empty_chain_is_not_watched() {
    let (state, _) = setup();
    let (status, body) = post_watch(&state, json!({"resource": "host"})).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"], true);
    assert_eq!(body["code"], 0);
    assert_eq!(body["data"]["bk_watched"], false);
    assert_eq!(body["data"]["bk_events"][0]["bk_cursor"], NO_EVENT_CURSOR);
    assert_eq!(body["data"]["bk_events"][0]["bk_resource"], "host");
}

#[tokio::test]
async fn cursor_watch_returns_events_with_projected_fields() {
    let (state, registry) = setup();
    let first = append(&state.pool, &registry, CursorType::Host, "h1", 30);
    let second = append(&state.pool, &registry, CursorType::Host, "h2", 20);

    let (status, body) = post_watch(
        &state,
        json!({"resource": "host", "cursor": first, "fields": ["bk_host_id"]}),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["bk_watched"], true);
    let events = body["data"]["bk_events"].as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["bk_cursor"], second);
    assert_eq!(events[0]["bk_event_type"], "create");
    assert_eq!(events[0]["bk_detail"], json!({"bk_host_id": 7}));
}

#[tokio::test]
async fn caught_up_cursor_is_echoed_after_the_hold() {
    let (state, registry) = setup();
    let cursor = append(&state.pool, &registry, CursorType::Host, "h1", 5);

    let started = tokio::time::Instant::now();
    let (status, body) = post_watch(&state, json!({"resource": "host", "cursor": cursor})).await;

    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["bk_watched"], false);
    assert_eq!(body["data"]["bk_events"][0]["bk_cursor"], cursor);
}

#[tokio::test]
async fn held_request_returns_an_event_appended_meanwhile() {
    let (mut state, registry) = setup();
    state.watch.hold_timeout = Duration::from_secs(5);
    let cursor = append(&state.pool, &registry, CursorType::Host, "h1", 5);

    let pool = state.pool.clone();
    let writer_registry = registry.clone();
    let writer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        tokio::task::spawn_blocking(move || {
            append(&pool, &writer_registry, CursorType::Host, "h2", 0)
        })
        .await
        .unwrap()
    });

    let (_, body) = post_watch(&state, json!({"resource": "host", "cursor": cursor})).await;
    let appended = writer.await.unwrap();

    assert_eq!(body["data"]["bk_watched"], true);
    assert_eq!(body["data"]["bk_events"][0]["bk_cursor"], appended);
}

#[tokio::test]
async fn expired_cursor_is_gone() {
    let (state, _) = setup();
    let stale = Cursor::new(
        CursorType::Host,
        "5f3a1c2b9d8e7f6a5b4c3d2e",
        ClusterTime::new(
            u32::try_from(unix_now() - CHAIN_TTL_SECONDS - 60).unwrap(),
            0,
        ),
    );

    let (status, body) =
        post_watch(&state, json!({"resource": "host", "cursor": stale.encode()})).await;

    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["result"], false);
    assert_eq!(body["code"], ErrorCode::CursorExpired.as_i64());
    assert!(body["data"].is_null());
}

#[tokio::test]
async fn malformed_cursor_is_a_bad_request() {
    let (state, _) = setup();
    let (status, body) =
        post_watch(&state, json!({"resource": "host", "cursor": "not a cursor"})).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], ErrorCode::InvalidCursor.as_i64());
}

#[tokio::test]
async fn unknown_resource_is_reported_by_code() {
    let (state, _) = setup();
    let (status, body) = post_watch(&state, json!({"resource": "kube_pod"})).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], ErrorCode::UnknownResourceType.as_i64());
}

#[tokio::test]
async fn unregistered_resource_is_unknown() {
    let (mut state, _) = setup();
    state.registry = Arc::new(ResourceRegistry::with_types(&[CursorType::Host]));
    let (status, body) = post_watch(&state, json!({"resource": "biz"})).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], ErrorCode::UnknownResourceType.as_i64());
}

#[tokio::test]
async fn negative_start_from_is_rejected() {
    let (state, _) = setup();
    let (status, body) = post_watch(&state, json!({"resource": "host", "start_from": -300})).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], ErrorCode::InvalidParams.as_i64());
}

#[tokio::test]
async fn missing_resource_is_invalid_params() {
    let (state, _) = setup();
    let (status, body) = post_watch(&state, json!({"cursor": NO_EVENT_CURSOR})).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], ErrorCode::InvalidParams.as_i64());
}

#[tokio::test]
async fn event_type_filter_skips_past_other_events() {
    let (state, registry) = setup();
    let anchor = append(&state.pool, &registry, CursorType::Host, "h1", 30);
    let skipped = append(&state.pool, &registry, CursorType::Host, "h2", 20);

    let (status, body) = post_watch(
        &state,
        json!({"resource": "host", "cursor": anchor, "event_types": ["delete"]}),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["bk_watched"], false);
    assert_eq!(body["data"]["bk_events"][0]["bk_cursor"], skipped);
}
