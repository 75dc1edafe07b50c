//! Schedule management API handlers.
//!
//! Every mutating endpoint forwards to the schedule engine actor and returns
//! what it committed, including the log sequence number reached. Reads come
//! from the mutation log's folded state.
//!
//! # Examples
//!
//! Build a bracket and schedule everything:
//! ```bash
//! curl -X POST http://localhost:3000/api/v1/categories/3/bracket
//! curl -X POST http://localhost:3000/api/v1/schedule/run
//! ```
//!
//! Move a match, guarding against a concurrent edit:
//! ```bash
//! curl -X POST http://localhost:3000/api/v1/matches/3-1-0/reschedule \
//!   -H "Content-Type: application/json" \
//!   -d '{"venue": 2, "start": "2026-05-09T10:35:00Z", "expected_seq": 41}'
//! ```

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use matchday::{
    Category, Match, MatchId, MutationRecord, PlacementOutcome, ScheduleError,
    schedule::messages::{
        BracketReport, DeferredMatch, ManualPlacement, ResultReport, ScheduleReport,
        WithdrawReport,
    },
    schedule::models::{CategoryId, CompetitorId, Slot, VenueId},
};
use serde::{Deserialize, Serialize};
use std::time::Instant;

use super::{ApiError, AppState, ErrorResponse, bad_request, topic_filter};
use crate::{logging, metrics};

/// Largest page `GET /log` returns
const MAX_LOG_PAGE: usize = 1000;

#[derive(Debug, Default, Deserialize)]
pub struct PlaceRequest {
    /// Restrict the search to one venue
    #[serde(default)]
    pub venue: Option<VenueId>,
}

#[derive(Debug, Deserialize)]
pub struct SlotRequest {
    pub venue: VenueId,
    pub start: DateTime<Utc>,
    /// Sequence number the operator's view was based on
    #[serde(default)]
    pub expected_seq: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ResultRequest {
    pub winner: CompetitorId,
}

#[derive(Debug, Deserialize)]
pub struct WithdrawRequest {
    pub competitor: CompetitorId,
}

#[derive(Debug, Deserialize)]
pub struct ScheduleQuery {
    pub categories: Option<String>,
    pub venues: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    /// Return records after this sequence number
    #[serde(default)]
    pub from: u64,
    pub limit: Option<usize>,
}

/// Filtered view of the schedule at one log position
#[derive(Debug, Serialize)]
pub struct ScheduleView {
    pub seq: u64,
    pub matches: Vec<Match>,
}

#[derive(Debug, Serialize)]
pub struct RescheduleResponse {
    pub match_id: MatchId,
    pub slot: Slot,
}

/// Map an engine error to an HTTP status and a client-safe message.
///
/// Rejections keep the engine's wording since operators act on it; storage
/// and registry I/O failures are sanitised.
pub fn error_response(err: ScheduleError) -> ApiError {
    let status = match &err {
        ScheduleError::Clash(_)
        | ScheduleError::VenueOccupied { .. }
        | ScheduleError::ConcurrentWriteConflict { .. }
        | ScheduleError::BracketExists(_) => StatusCode::CONFLICT,
        ScheduleError::InvalidResult { .. }
        | ScheduleError::InvalidTransition { .. }
        | ScheduleError::AwaitingEntrants(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ScheduleError::StartOutOfRange(_) => StatusCode::BAD_REQUEST,
        ScheduleError::EngineClosed => StatusCode::SERVICE_UNAVAILABLE,
        e if e.is_not_found() => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %err, "Schedule command failed");
    }

    let clash = match &err {
        ScheduleError::Clash(violation) => {
            metrics::clash_rejections_total();
            Some(violation.clone())
        }
        _ => None,
    };

    (
        status,
        Json(ErrorResponse {
            error: err.client_message(),
            clash,
        }),
    )
}

fn parse_match_id(raw: &str) -> Result<MatchId, ApiError> {
    raw.parse().map_err(bad_request)
}

/// Count the outcome of a command and turn engine errors into responses
fn finish<T>(command: &str, result: Result<T, ScheduleError>) -> Result<Json<T>, ApiError> {
    metrics::schedule_commands_total(command, result.is_ok());
    result.map(Json).map_err(error_response)
}

/// List registered categories.
///
/// # Response
///
/// `200 OK` with every category the registry knows, in id order.
pub async fn list_categories(State(state): State<AppState>) -> Json<Vec<Category>> {
    let mut categories = state.registry.categories();
    categories.sort_by_key(|c| c.id);
    Json(categories)
}

/// Build and commit the bracket of a category.
///
/// # Response
///
/// - `200 OK` with the bracket's shape and byes
/// - `404 Not Found` for an unknown category
/// - `409 Conflict` if the bracket was already built
pub async fn commit_bracket(
    State(state): State<AppState>,
    Path(category_id): Path<CategoryId>,
) -> Result<Json<BracketReport>, ApiError> {
    let result = state.engine.commit_bracket(category_id).await;
    if let Ok(report) = &result {
        logging::log_operator_action(
            "commit_bracket",
            None,
            &format!(
                "category {}: {} matches over {} rounds",
                report.category, report.matches, report.rounds
            ),
        );
    }
    finish("commit_bracket", result)
}

/// Place every eligible unplaced match.
///
/// Matches that cannot be placed are reported as deferred; the call
/// itself still succeeds.
pub async fn schedule_all(
    State(state): State<AppState>,
) -> Result<Json<ScheduleReport>, ApiError> {
    let started = Instant::now();
    let result = state.engine.schedule_all().await;
    let elapsed = started.elapsed();

    metrics::schedule_pass_duration_ms(elapsed.as_secs_f64() * 1000.0);
    logging::log_performance("schedule_all", elapsed.as_millis() as u64, None);

    if let Ok(report) = &result {
        metrics::matches_placed_total(report.placed.len());
        metrics::matches_deferred(report.deferred.len());
        logging::log_operator_action(
            "schedule_all",
            None,
            &format!(
                "{} placed, {} deferred",
                report.placed.len(),
                report.deferred.len()
            ),
        );
    }
    finish("schedule_all", result)
}

/// Current schedule, optionally restricted to some categories and venues.
///
/// # Query Parameters
///
/// - `categories`: Comma-separated category ids
/// - `venues`: Comma-separated venue ids; unplaced matches are excluded
pub async fn get_schedule(
    State(state): State<AppState>,
    Query(query): Query<ScheduleQuery>,
) -> Result<Json<ScheduleView>, ApiError> {
    let filter = topic_filter(query.categories.as_deref(), query.venues.as_deref())
        .map_err(bad_request)?;

    let snapshot = state.log.snapshot().await;
    Ok(Json(ScheduleView {
        seq: snapshot.seq(),
        matches: snapshot
            .matches()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect(),
    }))
}

/// Matches whose last placement attempt found no slot, with the reason
pub async fn list_deferred(
    State(state): State<AppState>,
) -> Result<Json<Vec<DeferredMatch>>, ApiError> {
    let deferred = state.engine.deferred().await.map_err(error_response)?;
    metrics::matches_deferred(deferred.len());
    Ok(Json(deferred))
}

/// Audit history from the durable store.
///
/// # Query Parameters
///
/// - `from`: Return records with a greater sequence number (default 0)
/// - `limit`: Page size, capped at 1000
pub async fn get_log(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> Result<Json<Vec<MutationRecord>>, ApiError> {
    let limit = query.limit.unwrap_or(MAX_LOG_PAGE).min(MAX_LOG_PAGE);
    let mut records = state.log.history_from(query.from).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to read mutation history");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::new("Internal storage error")),
        )
    })?;
    records.truncate(limit);
    Ok(Json(records))
}

/// Current state of one match
pub async fn get_match(
    State(state): State<AppState>,
    Path(match_id): Path<String>,
) -> Result<Json<Match>, ApiError> {
    let match_id = parse_match_id(&match_id)?;
    let snapshot = state.log.snapshot().await;
    snapshot.get(&match_id).cloned().map(Json).ok_or_else(|| {
        error_response(ScheduleError::UnknownMatch(match_id))
    })
}

/// Ask the engine to find the earliest clash-free slot for a match.
///
/// A match with no slot in the horizon is returned as deferred with
/// `200 OK`; the placement search itself did not fail.
pub async fn place_match(
    State(state): State<AppState>,
    Path(match_id): Path<String>,
    body: Option<Json<PlaceRequest>>,
) -> Result<Json<PlacementOutcome>, ApiError> {
    let match_id = parse_match_id(&match_id)?;
    let request = body.map(|Json(r)| r).unwrap_or_default();

    let result = state.engine.place_match(match_id, request.venue).await;
    if let Ok(outcome) = &result {
        if outcome.is_deferred() {
            tracing::info!(match_id = %match_id, "Placement deferred");
        } else {
            metrics::matches_placed_total(1);
        }
    }
    finish("place_match", result)
}

/// Operator placement at an exact venue and time.
///
/// Overlaps are always rejected; a gap shorter than the minimum is accepted
/// when the server allows overrides and reported in `overridden`.
pub async fn manual_place(
    State(state): State<AppState>,
    Path(match_id): Path<String>,
    Json(request): Json<SlotRequest>,
) -> Result<Json<ManualPlacement>, ApiError> {
    let match_id = parse_match_id(&match_id)?;
    let result = state
        .engine
        .manual_place(match_id, request.venue, request.start, request.expected_seq)
        .await;

    if let Ok(placement) = &result {
        let note = match &placement.overridden {
            Some(violation) => format!(
                "venue {} at {}, gap overridden: {}",
                placement.slot.venue, placement.slot.start, violation
            ),
            None => format!("venue {} at {}", placement.slot.venue, placement.slot.start),
        };
        logging::log_operator_action("manual_place", Some(&match_id.to_string()), &note);
    }
    finish("manual_place", result)
}

/// Move a placed match. Unlike manual placement, no gap override applies.
pub async fn reschedule(
    State(state): State<AppState>,
    Path(match_id): Path<String>,
    Json(request): Json<SlotRequest>,
) -> Result<Json<RescheduleResponse>, ApiError> {
    let match_id = parse_match_id(&match_id)?;
    let result = state
        .engine
        .reschedule(match_id, request.venue, request.start, request.expected_seq)
        .await
        .map(|slot| RescheduleResponse { match_id, slot });

    if let Ok(moved) = &result {
        logging::log_operator_action(
            "reschedule",
            Some(&match_id.to_string()),
            &format!("venue {} at {}", moved.slot.venue, moved.slot.start),
        );
    }
    finish("reschedule", result)
}

pub async fn start_match(
    State(state): State<AppState>,
    Path(match_id): Path<String>,
) -> Result<Json<Match>, ApiError> {
    let match_id = parse_match_id(&match_id)?;
    finish("start_match", state.engine.start_match(match_id).await)
}

/// Record the winner of a match in progress or scheduled.
///
/// # Response
///
/// - `200 OK` with where the winner advanced and any auto-placement
/// - `422 Unprocessable Entity` if the winner did not play in the match
pub async fn record_result(
    State(state): State<AppState>,
    Path(match_id): Path<String>,
    Json(request): Json<ResultRequest>,
) -> Result<Json<ResultReport>, ApiError> {
    let match_id = parse_match_id(&match_id)?;
    let result = state.engine.record_result(match_id, request.winner).await;

    if let Ok(report) = &result {
        let mut note = format!("winner {}", report.winner);
        if let Some(next) = report.advanced_to {
            note.push_str(&format!(", advances to {next}"));
        }
        if let Some(champion) = report.champion {
            note.push_str(&format!(", category champion {champion}"));
        }
        logging::log_operator_action("record_result", Some(&match_id.to_string()), &note);
    }
    finish("record_result", result)
}

pub async fn cancel_match(
    State(state): State<AppState>,
    Path(match_id): Path<String>,
) -> Result<Json<Match>, ApiError> {
    let match_id = parse_match_id(&match_id)?;
    let result = state.engine.cancel_match(match_id).await;
    if result.is_ok() {
        logging::log_operator_action("cancel", Some(&match_id.to_string()), "cancelled");
    }
    finish("cancel_match", result)
}

/// Withdraw a competitor from a category; their open matches are resolved
/// as walkovers or cancelled.
pub async fn withdraw(
    State(state): State<AppState>,
    Path(category_id): Path<CategoryId>,
    Json(request): Json<WithdrawRequest>,
) -> Result<Json<WithdrawReport>, ApiError> {
    let result = state.engine.withdraw(category_id, request.competitor).await;
    if let Ok(report) = &result {
        logging::log_operator_action(
            "withdraw",
            None,
            &format!(
                "competitor {} from category {}; {} matches affected",
                report.competitor,
                report.category,
                report.affected.len()
            ),
        );
    }
    finish("withdraw", result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use matchday::ClashViolation;
    use chrono::{DateTime, TimeDelta, Utc};

    #[test]
    fn test_error_status_mapping() {
        let id = MatchId::new(1, 1, 0);

        let (status, _) = error_response(ScheduleError::VenueOccupied {
            venue: 1,
            occupant: id,
        });
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = error_response(ScheduleError::InvalidResult {
            match_id: id,
            reason: "not a participant".to_string(),
        });
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, _) = error_response(ScheduleError::UnknownMatch(id));
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = error_response(ScheduleError::EngineClosed);
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (status, _) = error_response(ScheduleError::StartOutOfRange(DateTime::<Utc>::MAX_UTC));
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_clash_carries_violation() {
        let violation = ClashViolation {
            conflicting_match: MatchId::new(2, 1, 0),
            competitor: 7,
            required_gap: TimeDelta::minutes(15),
            actual_gap: TimeDelta::minutes(5),
            overlapping: false,
        };
        let (status, Json(body)) = error_response(ScheduleError::Clash(violation.clone()));
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body.clash, Some(violation));
    }

    #[test]
    fn test_storage_error_is_sanitised() {
        let (status, Json(body)) = error_response(ScheduleError::Log(
            matchday::LogError::Storage("password authentication failed".to_string()),
        ));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.error, "Internal storage error");
    }
}
