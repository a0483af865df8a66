// Dues Ledger - Web Server
// Webhook intake for deposit notices plus read-only report endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use rusqlite::Connection;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use dues_ledger::config::{self, Config};
use dues_ledger::domain::{group, DepositNotice};
use dues_ledger::{db, fees, DashboardCache, IngestError, ReconciliationEngine};

/// Shared application state
#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Connection>>,
    dashboards: Arc<DashboardCache>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }
}

impl ApiResponse<()> {
    fn error(message: String) -> Self {
        Self {
            success: false,
            data: (),
            error: Some(message),
        }
    }
}

/// Webhook acknowledgment. Receipt means "stored", never "settled";
/// settlement is observable only through the fee and dashboard reads.
#[derive(Serialize)]
struct AckResponse {
    received: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    receipt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// POST /api/notifications - Ingest one deposit notice
async fn post_notification(
    State(state): State<AppState>,
    Json(notice): Json<DepositNotice>,
) -> impl IntoResponse {
    let mut conn = state.db.lock().unwrap();

    match ReconciliationEngine::new().ingest(&mut conn, notice) {
        Ok(receipt) => {
            if receipt.outcome.is_settled() {
                if let Some(group_id) = receipt.outcome.group_id() {
                    state.dashboards.invalidate(group_id);
                }
            }

            (
                StatusCode::ACCEPTED,
                Json(AckResponse {
                    received: true,
                    receipt: Some(receipt.receipt),
                    error: None,
                }),
            )
                .into_response()
        }
        Err(IngestError::CycleInvariant {
            group_id,
            count,
            receipt,
        }) => {
            error!(group_id, count, "notice logged but unmatched: multiple active cycles");
            (
                StatusCode::CONFLICT,
                Json(AckResponse {
                    received: true,
                    receipt: Some(receipt),
                    error: Some(format!(
                        "group {} has {} active cycles, expected at most one; the notice was logged but left unmatched",
                        group_id, count
                    )),
                }),
            )
                .into_response()
        }
        Err(e) => {
            error!("notice ingest failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(AckResponse {
                    received: false,
                    receipt: None,
                    error: Some(e.to_string()),
                }),
            )
                .into_response()
        }
    }
}

/// GET /api/groups - List groups
async fn list_groups(State(state): State<AppState>) -> impl IntoResponse {
    let conn = state.db.lock().unwrap();

    match group::list(&conn) {
        Ok(groups) => (StatusCode::OK, Json(ApiResponse::ok(groups))).into_response(),
        Err(e) => {
            error!("listing groups failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error(e.to_string())),
            )
                .into_response()
        }
    }
}

/// GET /api/groups/:id/fees/:period - Fee standing for one period
async fn get_fees(
    State(state): State<AppState>,
    Path((group_id, period)): Path<(i64, String)>,
) -> impl IntoResponse {
    let conn = state.db.lock().unwrap();

    match group::find_by_id(&conn, group_id) {
        Ok(Some(_)) => {}
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(ApiResponse::error(format!("group {} not found", group_id))),
            )
                .into_response();
        }
        Err(e) => {
            error!("group lookup failed: {}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error(e.to_string())),
            )
                .into_response();
        }
    }

    match fees::report(&conn, group_id, &period, Utc::now()) {
        Ok(report) => (StatusCode::OK, Json(ApiResponse::ok(report))).into_response(),
        Err(e) => {
            error!("fee report failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error(e.to_string())),
            )
                .into_response()
        }
    }
}

/// GET /api/groups/:id/dashboard - Cached dashboard
async fn get_dashboard(
    State(state): State<AppState>,
    Path(group_id): Path<i64>,
) -> impl IntoResponse {
    let conn = state.db.lock().unwrap();

    match group::find_by_id(&conn, group_id) {
        Ok(Some(_)) => {}
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(ApiResponse::error(format!("group {} not found", group_id))),
            )
                .into_response();
        }
        Err(e) => {
            error!("group lookup failed: {}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error(e.to_string())),
            )
                .into_response();
        }
    }

    match state.dashboards.get_or_compute(&conn, group_id, Utc::now()) {
        Ok(dashboard) => (StatusCode::OK, Json(ApiResponse::ok(dashboard))).into_response(),
        Err(e) => {
            error!("dashboard failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error(e.to_string())),
            )
                .into_response()
        }
    }
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    config::init_tracing();

    println!("🌐 Dues Ledger - Web Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let config = Config::from_env();
    let conn = db::open_database(&config.database_path)?;
    println!("✓ Database opened: {}", config.database_path.display());

    let state = AppState {
        db: Arc::new(Mutex::new(conn)),
        dashboards: Arc::new(DashboardCache::new()),
    };

    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/notifications", post(post_notification))
        .route("/groups", get(list_groups))
        .route("/groups/:id/fees/:period", get(get_fees))
        .route("/groups/:id/dashboard", get(get_dashboard))
        .with_state(state.clone());

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "listening");

    println!("\n🚀 Server running on http://{}", config.bind_addr);
    println!("   Webhook: POST /api/notifications");
    println!("   Reports: GET /api/groups/:id/dashboard");
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(listener, app).await?;

    Ok(())
}
