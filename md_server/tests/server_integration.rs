//! Integration tests for the HTTP API.
//!
//! Each test builds a fresh in-memory stack (registry, mutation log, engine,
//! hub) and drives the router directly with `oneshot`.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{TimeDelta, TimeZone, Utc};
use http_body_util::BodyExt;
use matchday::{
    Elimination, HubConfig, InMemoryRegistry, LogConfig, Match, MemoryLogStore, MutationLog,
    MutationRecord, RealtimeHub, RegistryData, RoundRobin, ScheduleEngine, SchedulerConfig,
    Venue,
    registry::{Category, Competitor},
};
use md_server::api::{AppState, create_router};
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt; // For `oneshot` method

/// Category 1: four-person elimination. Category 2: round robin of
/// competitors 1, 5 and 6, so competitor 1 is in both.
fn registry() -> Arc<InMemoryRegistry> {
    let competitor = |id: i64, categories: &[i64]| Competitor {
        id,
        name: format!("Athlete {id}"),
        seed: None,
        categories: categories.iter().copied().collect(),
    };

    let data = RegistryData {
        competitors: vec![
            competitor(1, &[1, 2]),
            competitor(2, &[1]),
            competitor(3, &[1]),
            competitor(4, &[1]),
            competitor(5, &[2]),
            competitor(6, &[2]),
        ],
        categories: vec![
            Category {
                id: 1,
                name: "Senior Open".to_string(),
                competitors: vec![1, 2, 3, 4],
                bracket: Elimination {}.into(),
                draw_seed: None,
                match_duration: None,
                min_gap: None,
            },
            Category {
                id: 2,
                name: "Team Kata".to_string(),
                competitors: vec![1, 5, 6],
                bracket: RoundRobin {}.into(),
                draw_seed: None,
                match_duration: None,
                min_gap: None,
            },
        ],
    };
    Arc::new(InMemoryRegistry::new(data).unwrap())
}

/// Helper to create a test server over an in-memory log
async fn create_test_server() -> axum::Router {
    let config = SchedulerConfig {
        venues: vec![Venue::new(1, "Mat 1"), Venue::new(2, "Mat 2")],
        day_start: Utc.with_ymd_and_hms(2026, 5, 9, 9, 0, 0).unwrap(),
        match_duration: TimeDelta::minutes(20),
        min_gap: Some(TimeDelta::minutes(15)),
        ..Default::default()
    };

    let (log, writer) = MutationLog::open(Arc::new(MemoryLogStore::new()), LogConfig::default())
        .await
        .unwrap();
    let registry = registry();
    let (engine, _task) = ScheduleEngine::start(config, registry.clone(), writer)
        .await
        .unwrap();
    let hub = RealtimeHub::new(log.clone(), HubConfig::default()).unwrap();

    create_router(AppState {
        engine,
        log,
        hub,
        registry,
    })
}

async fn send(app: &axum::Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn matches_of(app: &axum::Router, category: i64) -> Vec<Match> {
    let (status, body) = send(app, "GET", &format!("/api/v1/schedule?categories={category}"), None).await;
    assert_eq!(status, StatusCode::OK);
    serde_json::from_value(body["matches"].clone()).unwrap()
}

/// First match of `category` in which competitor 1 actually plays
async fn match_with_competitor_one(app: &axum::Router, category: i64) -> Match {
    matches_of(app, category)
        .await
        .into_iter()
        .find(|m| m.involves(1) && m.has_both_competitors())
        .expect("competitor 1 plays in this category")
}

// ============================================================================
// Health Check Tests
// ============================================================================

#[tokio::test]
async fn test_health_check_endpoint() {
    let app = create_test_server().await;

    let (status, body) = send(&app, "GET", "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["engine"], true);
    assert_eq!(body["log_seq"], 0);
}

#[tokio::test]
async fn test_request_id_is_echoed() {
    let app = create_test_server().await;

    let request = Request::builder()
        .uri("/health")
        .header("x-request-id", "desk-42")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.headers()["x-request-id"], "desk-42");
}

// ============================================================================
// Bracket Tests
// ============================================================================

#[tokio::test]
async fn test_commit_bracket_once() {
    let app = create_test_server().await;

    let (status, body) = send(&app, "POST", "/api/v1/categories/1/bracket", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["category"], 1);
    assert_eq!(body["rounds"], 2);
    assert_eq!(body["matches"], 3);

    let (status, body) = send(&app, "POST", "/api/v1/categories/1/bracket", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("already exists"));
}

#[tokio::test]
async fn test_unknown_category_is_not_found() {
    let app = create_test_server().await;

    let (status, _) = send(&app, "POST", "/api/v1/categories/99/bracket", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_list_categories() {
    let app = create_test_server().await;

    let (status, body) = send(&app, "GET", "/api/v1/categories", None).await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["Senior Open", "Team Kata"]);
}

// ============================================================================
// Scheduling Tests
// ============================================================================

#[tokio::test]
async fn test_schedule_run_places_ready_matches() {
    let app = create_test_server().await;
    send(&app, "POST", "/api/v1/categories/1/bracket", None).await;

    let (status, body) = send(&app, "POST", "/api/v1/schedule/run", None).await;
    assert_eq!(status, StatusCode::OK);
    // Both first-round matches; the final waits for its entrants
    assert_eq!(body["placed"].as_array().unwrap().len(), 2);

    let placed: Vec<Match> = matches_of(&app, 1)
        .await
        .into_iter()
        .filter(|m| m.slot.is_some())
        .collect();
    assert_eq!(placed.len(), 2);

    let (status, body) = send(&app, "GET", "/api/v1/schedule/deferred", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_schedule_venue_filter() {
    let app = create_test_server().await;
    send(&app, "POST", "/api/v1/categories/1/bracket", None).await;
    send(&app, "POST", "/api/v1/schedule/run", None).await;

    let (status, body) = send(&app, "GET", "/api/v1/schedule?venues=2", None).await;
    assert_eq!(status, StatusCode::OK);
    let on_two: Vec<Match> = serde_json::from_value(body["matches"].clone()).unwrap();
    assert!(on_two.iter().all(|m| m.slot.map(|s| s.venue) == Some(2)));

    let (status, body) = send(&app, "GET", "/api/v1/schedule?venues=mat", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid venue id: mat");
}

#[tokio::test]
async fn test_cross_category_overlap_is_rejected() {
    let app = create_test_server().await;
    send(&app, "POST", "/api/v1/categories/1/bracket", None).await;
    send(&app, "POST", "/api/v1/categories/2/bracket", None).await;

    let first = match_with_competitor_one(&app, 1).await;
    let second = match_with_competitor_one(&app, 2).await;

    let (status, body) = send(
        &app,
        "POST",
        &format!("/api/v1/matches/{}/manual-place", first.id),
        Some(json!({ "venue": 1, "start": "2026-05-09T10:00:00Z" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["overridden"].is_null());

    // Same time on the other mat: competitor 1 cannot be in both
    let (status, body) = send(
        &app,
        "POST",
        &format!("/api/v1/matches/{}/manual-place", second.id),
        Some(json!({ "venue": 2, "start": "2026-05-09T10:00:00Z" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["clash"]["competitor"], 1);
    assert_eq!(body["clash"]["overlapping"], true);
    assert_eq!(body["clash"]["conflicting_match"], first.id.to_string());

    // Far enough apart it is accepted
    let (status, _) = send(
        &app,
        "POST",
        &format!("/api/v1/matches/{}/manual-place", second.id),
        Some(json!({ "venue": 2, "start": "2026-05-09T11:00:00Z" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_stale_expected_seq_conflicts() {
    let app = create_test_server().await;
    send(&app, "POST", "/api/v1/categories/1/bracket", None).await;
    send(&app, "POST", "/api/v1/schedule/run", None).await;

    let target = matches_of(&app, 1)
        .await
        .into_iter()
        .find(|m| m.slot.is_some())
        .unwrap();

    let (status, _) = send(
        &app,
        "POST",
        &format!("/api/v1/matches/{}/reschedule", target.id),
        Some(json!({ "venue": 1, "start": "2026-05-09T12:00:00Z", "expected_seq": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

// ============================================================================
// Match Lifecycle Tests
// ============================================================================

#[tokio::test]
async fn test_result_flow() {
    let app = create_test_server().await;
    send(&app, "POST", "/api/v1/categories/1/bracket", None).await;
    send(&app, "POST", "/api/v1/schedule/run", None).await;

    let target = match_with_competitor_one(&app, 1).await;
    let uri = format!("/api/v1/matches/{}", target.id);

    let (status, body) = send(&app, "POST", &format!("{uri}/start"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "in_progress");

    // Someone who did not play cannot win
    let (status, _) = send(&app, "POST", &format!("{uri}/result"), Some(json!({ "winner": 6 }))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, body) = send(&app, "POST", &format!("{uri}/result"), Some(json!({ "winner": 1 }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["winner"], 1);
    assert!(body["advanced_to"].is_string());

    let (status, body) = send(&app, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "completed");
}

#[tokio::test]
async fn test_unknown_and_malformed_match_ids() {
    let app = create_test_server().await;

    let (status, _) = send(&app, "POST", "/api/v1/matches/9-9-9/start", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&app, "POST", "/api/v1/matches/final/start", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid match id: final");
}

#[tokio::test]
async fn test_withdraw_unknown_competitor() {
    let app = create_test_server().await;
    send(&app, "POST", "/api/v1/categories/1/bracket", None).await;

    let (status, _) = send(
        &app,
        "POST",
        "/api/v1/categories/1/withdraw",
        Some(json!({ "competitor": 5 })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ============================================================================
// Audit Log Tests
// ============================================================================

#[tokio::test]
async fn test_log_paging() {
    let app = create_test_server().await;
    send(&app, "POST", "/api/v1/categories/1/bracket", None).await;
    send(&app, "POST", "/api/v1/schedule/run", None).await;

    let (_, health) = send(&app, "GET", "/health", None).await;
    let head = health["log_seq"].as_u64().unwrap();
    assert!(head >= 5);

    let (status, body) = send(&app, "GET", "/api/v1/log", None).await;
    assert_eq!(status, StatusCode::OK);
    let records: Vec<MutationRecord> = serde_json::from_value(body).unwrap();
    assert_eq!(
        records.iter().map(|r| r.seq).collect::<Vec<_>>(),
        (1..=head).collect::<Vec<_>>()
    );

    let (_, body) = send(&app, "GET", "/api/v1/log?from=2&limit=1", None).await;
    let page: Vec<MutationRecord> = serde_json::from_value(body).unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].seq, 3);
}
