use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use log::{info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

use crate::config::{ApiConfig, ReportConfig, SecurityConfig};
use crate::error::Error;
use crate::registry::models::{DeviceRecord, Heartbeat};
use crate::registry::FleetRegistry;
use crate::reports::{build_report, to_csv, ReportScope};
use crate::storage::ShardStore;
use crate::devices;

// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<FleetRegistry>,
    pub store: Arc<ShardStore>,
    pub report_config: ReportConfig,
    pub admin_token: String,
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub message: String,
    pub status: u16,
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::InvalidInput(_) | Error::Config(_) => ApiError {
                message: err.to_string(),
                status: StatusCode::BAD_REQUEST.as_u16(),
            },
            Error::NotFound(_) => ApiError {
                message: err.to_string(),
                status: StatusCode::NOT_FOUND.as_u16(),
            },
            Error::Upstream(_) | Error::Mail(_) => ApiError {
                message: err.to_string(),
                status: StatusCode::BAD_GATEWAY.as_u16(),
            },
            _ => ApiError {
                message: err.to_string(),
                status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            },
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(err) = err.downcast_ref::<Error>() {
            return err.clone().into();
        }

        ApiError {
            message: err.to_string(),
            status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
        }
    }
}

/// Implement IntoResponse for ApiError
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(self);
        (status, body).into_response()
    }
}

pub struct RestApi {
    config: ApiConfig,
    state: AppState,
}

impl RestApi {
    pub fn new(
        config: &ApiConfig,
        security: &SecurityConfig,
        report_config: ReportConfig,
        registry: Arc<FleetRegistry>,
        store: Arc<ShardStore>,
    ) -> Result<Self> {
        Ok(Self {
            config: config.clone(),
            state: AppState {
                registry,
                store,
                report_config,
                admin_token: security.admin_token.clone(),
            },
        })
    }

    pub async fn run(&self) -> Result<()> {
        use std::time::Duration;
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
            .max_age(Duration::from_secs(3600));

        let app = router(self.state.clone()).layer(cors);

        let addr = self.config.address.clone() + ":" + &self.config.port.to_string();
        let addr: SocketAddr = addr.parse()?;

        info!("API server listening on {}", addr);

        let listener = TcpListener::bind(addr).await?;
        axum::Server::from_tcp(listener.into_std()?)?
            .serve(app.into_make_service())
            .await?;

        Ok(())
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/heartbeat", post(ingest_heartbeat))
        .route("/api/devices", get(list_devices))
        .route("/api/devices/:id", delete(remove_device))
        .route("/api/reports/export", get(export_report))
        .route("/api/health", get(health))
        .with_state(state)
}

/// Privileged routes require the configured token in `x-admin-token`.
/// An empty configured token disables the check.
fn require_admin(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    if state.admin_token.is_empty() {
        return Ok(());
    }

    let supplied = headers
        .get("x-admin-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if supplied != state.admin_token {
        return Err(ApiError {
            message: "Invalid or missing admin token".to_string(),
            status: StatusCode::UNAUTHORIZED.as_u16(),
        });
    }
    Ok(())
}

/// Ingest one heartbeat: update the registry, then append any per-day
/// activity to the shard store. A failed shard append is logged and the
/// acknowledgment still goes out: the registry update already happened
/// and the device should not retry into duplicate events.
async fn ingest_heartbeat(
    State(state): State<AppState>,
    Json(heartbeat): Json<Heartbeat>,
) -> Response {
    let record = match state.registry.upsert(&heartbeat).await {
        Ok(record) => record,
        Err(e) => {
            let message = match e.downcast_ref::<Error>() {
                Some(Error::InvalidInput(msg)) => msg.clone(),
                _ => e.to_string(),
            };
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": message })),
            )
                .into_response();
        }
    };

    for (date, activity) in &heartbeat.activity {
        if activity.is_empty() {
            continue;
        }
        if let Err(e) = state
            .store
            .append_activity(*date, &record.id, &record.name, &record.country, activity)
            .await
        {
            warn!("Shard append for {} on {} failed: {}", record.id, date, e);
        }
    }

    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" }))).into_response()
}

#[derive(Debug, Serialize)]
struct CountryGroup {
    country: String,
    devices: Vec<DeviceRecord>,
}

async fn list_devices(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<CountryGroup>>> {
    require_admin(&state, &headers)?;

    let mut grouped: BTreeMap<String, Vec<DeviceRecord>> = BTreeMap::new();
    for record in state.registry.list().await {
        grouped.entry(record.country.clone()).or_default().push(record);
    }

    let groups = grouped
        .into_iter()
        .map(|(country, devices)| CountryGroup { country, devices })
        .collect();
    Ok(Json(groups))
}

async fn remove_device(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    require_admin(&state, &headers)?;

    let removed = state.registry.remove(&id).await?;
    Ok(Json(serde_json::json!({ "removed": removed })))
}

#[derive(Debug, serde::Deserialize)]
struct ExportParams {
    #[serde(default = "default_scope")]
    scope: String,
}

fn default_scope() -> String {
    "all".to_string()
}

async fn export_report(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ExportParams>,
) -> ApiResult<Response> {
    require_admin(&state, &headers)?;

    let scope = ReportScope::parse(&params.scope)?;

    if state.report_config.pull_before_report {
        devices::pull_fleet(&state.registry, state.report_config.pull_timeout_secs).await;
    }

    let report = build_report(&state.store, &scope).await?;
    info!(
        "Report export: {} rows from {} shards ({} skipped)",
        report.rows.len(),
        report.shards_read,
        report.shards_skipped
    );

    let csv = to_csv(&report.rows);
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"fleet-report.csv\"",
            ),
        ],
        csv,
    )
        .into_response())
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let devices = state.registry.list().await.len();
    Json(serde_json::json!({ "status": "ok", "devices": devices }))
}
