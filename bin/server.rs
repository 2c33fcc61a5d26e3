// TurtleOps Console - Web Server
// REST API for the admin console screens (turtle roster, tag history,
// encounter intake, naming workflow, CMTTP export)

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tower_http::cors::CorsLayer;
use turtleops_console::{
    approve_suggested_name, assign_name, build_report, flag_for_research, get_tag_history,
    get_tag_history_for_turtle, get_observations_for_turtle, get_turtle_by_id, get_turtles,
    open_database, reject_suggestion, report_stats, resolve_research, submit_encounter,
    cmttp_to_string, ConsoleError, EncounterRequest, HistoryFilters, TagChangeKind, TagSet,
    Turtle, TurtleFilters,
};

/// Shared application state
#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Connection>>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn err(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

/// Map console errors onto HTTP statuses: refused preconditions are the
/// operator's to fix, store failures are ours.
fn error_response(err: ConsoleError) -> (StatusCode, Json<ApiResponse<()>>) {
    let status = match &err {
        ConsoleError::Validation(_) => StatusCode::BAD_REQUEST,
        ConsoleError::Conflict(_) => StatusCode::CONFLICT,
        ConsoleError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ApiResponse::err(err.to_string())))
}

fn store_error(err: anyhow::Error) -> (StatusCode, Json<ApiResponse<()>>) {
    eprintln!("Store error: {}", err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiResponse::err(err.to_string())),
    )
}

// ============================================================================
// Query / payload shapes
// ============================================================================

#[derive(Deserialize)]
struct OrgQuery {
    org: String,
}

#[derive(Deserialize)]
struct TurtleListQuery {
    org: String,
    search: Option<String>,
    named: Option<bool>,
    needs_research: Option<bool>,
}

#[derive(Deserialize)]
struct HistoryQuery {
    org: String,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    tag: Option<String>,
    kind: Option<String>,
}

impl HistoryQuery {
    fn filters(&self) -> HistoryFilters {
        HistoryFilters {
            date_from: self.from,
            date_to: self.to,
            tag_search: self.tag.clone(),
        }
    }

    fn kind_filter(&self) -> Result<Option<TagChangeKind>, ConsoleError> {
        match self.kind.as_deref() {
            None | Some("all") => Ok(None),
            Some(raw) => TagChangeKind::parse(raw).map(Some).ok_or_else(|| {
                ConsoleError::Validation(format!("unknown change kind {:?}", raw))
            }),
        }
    }
}

/// Intake payload from the observation form. Tag fields arrive as raw
/// text and are normalized here before they reach the identity resolver.
#[derive(Deserialize)]
struct EncounterPayload {
    matched_turtle_id: Option<String>,
    tag_lrf: Option<String>,
    tag_rrf: Option<String>,
    tag_rff: Option<String>,
    tag_lff: Option<String>,
    encounter_at: DateTime<Utc>,
    observer_id: Option<String>,
    observer_name: String,
    org_id: String,
    comments: Option<String>,
}

impl EncounterPayload {
    fn into_request(self) -> EncounterRequest {
        EncounterRequest {
            matched_turtle_id: self.matched_turtle_id,
            tags: TagSet::from_observed(
                self.tag_lrf.as_deref(),
                self.tag_rrf.as_deref(),
                self.tag_rff.as_deref(),
                self.tag_lff.as_deref(),
            ),
            encounter_at: self.encounter_at,
            observer_id: self.observer_id,
            observer_name: self.observer_name,
            org_id: self.org_id,
            comments: self.comments,
        }
    }
}

#[derive(Deserialize)]
struct NamePayload {
    name: String,
}

#[derive(Deserialize)]
struct ResearchFlagPayload {
    flagged_by: Option<String>,
    flagged_by_name: String,
    notes: Option<String>,
}

#[derive(Deserialize)]
struct ResearchResolvePayload {
    resolved_by: String,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// GET /api/turtles - Roster with filters
async fn list_turtles(
    State(state): State<AppState>,
    Query(query): Query<TurtleListQuery>,
) -> impl IntoResponse {
    let conn = state.db.lock().unwrap();

    let filters = TurtleFilters {
        search: query.search.clone(),
        has_name: query.named,
        needs_research: query.needs_research,
    };

    match get_turtles(&conn, &query.org, &filters) {
        Ok(turtles) => Json(ApiResponse::ok(turtles)).into_response(),
        Err(e) => store_error(e).into_response(),
    }
}

/// GET /api/turtles/:id - Single turtle
async fn get_turtle(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let conn = state.db.lock().unwrap();

    match get_turtle_by_id(&conn, &id) {
        Ok(Some(turtle)) => Json(ApiResponse::ok(turtle)).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::<Turtle>::err(format!(
                "turtle {} does not exist",
                id
            ))),
        )
            .into_response(),
        Err(e) => store_error(e).into_response(),
    }
}

/// GET /api/turtles/by-name/:name - Name lookup (URL-encoded name)
async fn get_turtle_by_name(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<OrgQuery>,
) -> impl IntoResponse {
    let conn = state.db.lock().unwrap();

    let decoded = urlencoding::decode(&name)
        .unwrap_or_else(|_| name.clone().into())
        .into_owned();

    match turtleops_console::find_turtle_by_name(&conn, &query.org, &decoded) {
        Ok(Some(turtle)) => Json(ApiResponse::ok(turtle)).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::<Turtle>::err(format!(
                "no turtle named {:?}",
                decoded
            ))),
        )
            .into_response(),
        Err(e) => store_error(e).into_response(),
    }
}

/// GET /api/turtles/:id/history - Audit records for one turtle
async fn turtle_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let conn = state.db.lock().unwrap();

    match get_tag_history_for_turtle(&conn, &id) {
        Ok(records) => Json(ApiResponse::ok(records)).into_response(),
        Err(e) => store_error(e).into_response(),
    }
}

/// GET /api/turtles/:id/observations - Encounter log for one turtle
async fn turtle_observations(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let conn = state.db.lock().unwrap();

    match get_observations_for_turtle(&conn, &id) {
        Ok(observations) => Json(ApiResponse::ok(observations)).into_response(),
        Err(e) => store_error(e).into_response(),
    }
}

/// POST /api/encounters - Record one encounter
async fn post_encounter(
    State(state): State<AppState>,
    Json(payload): Json<EncounterPayload>,
) -> impl IntoResponse {
    let mut conn = state.db.lock().unwrap();
    let request = payload.into_request();

    match submit_encounter(&mut conn, &request) {
        Ok(outcome) => (StatusCode::CREATED, Json(ApiResponse::ok(outcome))).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

/// POST /api/turtles/:id/name - Assign a custom name
async fn post_name(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<NamePayload>,
) -> impl IntoResponse {
    let conn = state.db.lock().unwrap();

    match assign_name(&conn, &id, &payload.name) {
        Ok(turtle) => Json(ApiResponse::ok(turtle)).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

/// POST /api/turtles/:id/name/approve - Approve the pending suggestion
async fn post_approve_name(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let conn = state.db.lock().unwrap();

    match approve_suggested_name(&conn, &id) {
        Ok(turtle) => Json(ApiResponse::ok(turtle)).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

/// POST /api/turtles/:id/name/reject - Discard the pending suggestion
async fn post_reject_name(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let conn = state.db.lock().unwrap();

    match reject_suggestion(&conn, &id) {
        Ok(turtle) => Json(ApiResponse::ok(turtle)).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

/// POST /api/turtles/:id/research - Flag for research
async fn post_research_flag(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<ResearchFlagPayload>,
) -> impl IntoResponse {
    let conn = state.db.lock().unwrap();

    match flag_for_research(
        &conn,
        &id,
        payload.flagged_by.as_deref(),
        &payload.flagged_by_name,
        payload.notes.as_deref(),
    ) {
        Ok(turtle) => Json(ApiResponse::ok(turtle)).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

/// POST /api/turtles/:id/research/resolve - Resolve the research flag
async fn post_research_resolve(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<ResearchResolvePayload>,
) -> impl IntoResponse {
    let conn = state.db.lock().unwrap();

    match resolve_research(&conn, &id, &payload.resolved_by) {
        Ok(turtle) => Json(ApiResponse::ok(turtle)).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

/// GET /api/tag-changes - Classified change rows (JSON)
async fn list_tag_changes(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let conn = state.db.lock().unwrap();

    let kind = match query.kind_filter() {
        Ok(kind) => kind,
        Err(e) => return error_response(e).into_response(),
    };

    match get_tag_history(&conn, &query.org, &query.filters()) {
        Ok(records) => {
            let changes = build_report(&records, kind);
            Json(ApiResponse::ok(changes)).into_response()
        }
        Err(e) => store_error(e).into_response(),
    }
}

/// GET /api/tag-changes/stats - Per-kind change counts
async fn tag_change_stats(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let conn = state.db.lock().unwrap();

    match get_tag_history(&conn, &query.org, &query.filters()) {
        Ok(records) => Json(ApiResponse::ok(report_stats(&records))).into_response(),
        Err(e) => store_error(e).into_response(),
    }
}

/// GET /api/export/cmttp - CMTTP report as a CSV body
async fn export_cmttp(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let conn = state.db.lock().unwrap();

    let kind = match query.kind_filter() {
        Ok(kind) => kind,
        Err(e) => return error_response(e).into_response(),
    };

    let records = match get_tag_history(&conn, &query.org, &query.filters()) {
        Ok(records) => records,
        Err(e) => return store_error(e).into_response(),
    };

    let changes = build_report(&records, kind);
    match cmttp_to_string(&changes) {
        Ok(body) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
                (
                    header::CONTENT_DISPOSITION,
                    "attachment; filename=\"cmttp_tag_history.csv\"",
                ),
            ],
            body,
        )
            .into_response(),
        Err(e) => store_error(e).into_response(),
    }
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() {
    println!("🐢 TurtleOps Console - Web Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let db_path = std::env::var("TURTLEOPS_DB").unwrap_or_else(|_| "turtleops.db".to_string());
    let conn = open_database(std::path::Path::new(&db_path)).expect("Failed to open database");
    println!("✓ Database opened: {}", db_path);

    // Create shared state
    let state = AppState {
        db: Arc::new(Mutex::new(conn)),
    };

    // Build API routes
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/turtles", get(list_turtles))
        .route("/turtles/by-name/:name", get(get_turtle_by_name))
        .route("/turtles/:id", get(get_turtle))
        .route("/turtles/:id/history", get(turtle_history))
        .route("/turtles/:id/observations", get(turtle_observations))
        .route("/turtles/:id/name", post(post_name))
        .route("/turtles/:id/name/approve", post(post_approve_name))
        .route("/turtles/:id/name/reject", post(post_reject_name))
        .route("/turtles/:id/research", post(post_research_flag))
        .route("/turtles/:id/research/resolve", post(post_research_resolve))
        .route("/encounters", post(post_encounter))
        .route("/tag-changes", get(list_tag_changes))
        .route("/tag-changes/stats", get(tag_change_stats))
        .route("/export/cmttp", get(export_cmttp))
        .with_state(state.clone());

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive());

    // Start server
    let addr = "0.0.0.0:3000";
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    println!("\n🚀 Server running on http://localhost:3000");
    println!("   API: http://localhost:3000/api/turtles?org=<org-id>");
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}
