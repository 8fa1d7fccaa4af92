//! API handlers for the HTTP REST API

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::alerting::{AlertOrchestrator, SweepReport};
use crate::db::Database;
use crate::error::Error;
use crate::models::{
    AlertDecision, AlertSettings, Channel, EventType, MemberEvent, MemberStatus,
};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Storage
    pub db: Database,
    /// Alert engine
    pub orchestrator: Arc<AlertOrchestrator>,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

fn api_error(e: &Error) -> (StatusCode, String) {
    let status = match e {
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::NotFound { .. } => StatusCode::NOT_FOUND,
        Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        e if e.is_store_error() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!(error = %e, "Request failed");
    }
    (status, e.to_string())
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    /// `ok` or `degraded`
    pub status: String,
    /// Crate version
    pub version: String,
}

/// Health check endpoint
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = match state.db.health_check().await {
        Ok(()) => "ok",
        Err(e) => {
            error!(error = %e, "Database health check failed");
            "degraded"
        }
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// A membership change reported by the ingestion side
#[derive(Debug, Deserialize)]
pub struct IngestEventRequest {
    pub channel_id: i64,
    pub user_id: i64,
    pub event_type: EventType,
    pub old_status: Option<MemberStatus>,
    /// Defaults to the status implied by `event_type`
    pub new_status: Option<MemberStatus>,
    pub inviter_id: Option<i64>,
    /// Defaults to the server's current time
    pub occurred_at: Option<DateTime<Utc>>,
}

impl IngestEventRequest {
    fn into_event(self, now: DateTime<Utc>) -> MemberEvent {
        let mut event = MemberEvent::new(
            self.channel_id,
            self.user_id,
            self.event_type,
            self.occurred_at.unwrap_or(now),
        );
        if self.old_status.is_some() {
            event.old_status = self.old_status;
        }
        if let Some(new_status) = self.new_status {
            event.new_status = new_status;
        }
        event.inviter_id = self.inviter_id;
        event
    }
}

/// Result of ingesting one event
#[derive(Serialize)]
pub struct IngestEventResponse {
    /// Store id of the recorded event
    pub event_id: Option<i64>,
    /// Alerts fired by the event
    pub decisions: Vec<AlertDecision>,
}

/// Record a member event and evaluate alerts for it
pub async fn ingest_event(
    State(state): State<AppState>,
    Json(req): Json<IngestEventRequest>,
) -> ApiResult<IngestEventResponse> {
    let event = req.into_event(state.orchestrator.now());

    let recorded = state
        .db
        .record_member_event(&event)
        .await
        .map_err(|e| api_error(&e))?;

    let decisions = state
        .orchestrator
        .on_member_event(&recorded)
        .await
        .map_err(|e| api_error(&e))?;

    Ok(Json(IngestEventResponse {
        event_id: recorded.id,
        decisions,
    }))
}

/// Sweep query parameters
#[derive(Debug, Default, Deserialize)]
pub struct SweepQuery {
    /// Instant to evaluate schedules at, defaults to now
    pub at: Option<DateTime<Utc>>,
}

/// Run a digest sweep immediately
pub async fn run_sweep(
    State(state): State<AppState>,
    Query(query): Query<SweepQuery>,
) -> ApiResult<SweepReport> {
    let at = query.at.unwrap_or_else(|| state.orchestrator.now());
    info!(%at, "Manual digest sweep requested");

    state
        .orchestrator
        .run_digest_sweep(at)
        .await
        .map(Json)
        .map_err(|e| api_error(&e))
}

/// List active channels
pub async fn list_channels(State(state): State<AppState>) -> ApiResult<Vec<Channel>> {
    state
        .db
        .channels
        .list_active()
        .await
        .map(Json)
        .map_err(|e| api_error(&e))
}

/// Channel registration body
#[derive(Debug, Deserialize)]
pub struct UpsertChannelRequest {
    pub title: String,
    pub admin_user_id: i64,
    pub notify_chat_id: Option<i64>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

/// Register or update a channel
pub async fn upsert_channel(
    State(state): State<AppState>,
    Path(channel_id): Path<i64>,
    Json(req): Json<UpsertChannelRequest>,
) -> ApiResult<Channel> {
    let channel = Channel {
        id: channel_id,
        title: req.title,
        admin_user_id: req.admin_user_id,
        notify_chat_id: req.notify_chat_id,
        is_active: req.is_active,
    };

    state
        .db
        .channels
        .upsert(&channel)
        .await
        .map_err(|e| api_error(&e))?;

    info!(channel_id, title = %channel.title, "Channel registered");
    Ok(Json(channel))
}

async fn require_channel(state: &AppState, channel_id: i64) -> Result<Channel, (StatusCode, String)> {
    state
        .db
        .channels
        .get(channel_id)
        .await
        .map_err(|e| api_error(&e))?
        .ok_or_else(|| api_error(&Error::not_found("Channel", channel_id.to_string())))
}

/// Get a channel's alert settings
pub async fn get_alert_settings(
    State(state): State<AppState>,
    Path(channel_id): Path<i64>,
) -> ApiResult<AlertSettings> {
    require_channel(&state, channel_id).await?;

    state
        .db
        .settings
        .get_or_create(channel_id)
        .await
        .map(Json)
        .map_err(|e| api_error(&e))
}

/// Partial update of alert configuration. Watermarks cannot be set here.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateAlertSettingsRequest {
    pub mass_leave_threshold: Option<i32>,
    pub mass_leave_window_minutes: Option<i32>,
    pub anomaly_factor: Option<f64>,
    pub milestone_step: Option<i64>,
    pub digest_daily: Option<bool>,
    pub digest_weekly: Option<bool>,
    pub digest_monthly: Option<bool>,
    pub quiet_hours_start: Option<u32>,
    pub quiet_hours_end: Option<u32>,
    pub churn_percent_threshold: Option<f64>,
    pub vip_ids: Option<BTreeSet<i64>>,
}

impl UpdateAlertSettingsRequest {
    /// Apply the given threshold and schedule fields onto `settings`.
    /// `vip_ids` is written separately.
    pub fn apply(&self, settings: &mut AlertSettings) -> crate::Result<()> {
        if let Some(v) = self.mass_leave_threshold {
            if v < 1 {
                return Err(Error::validation("mass_leave_threshold must be at least 1"));
            }
            settings.mass_leave_threshold = v;
        }
        if let Some(v) = self.mass_leave_window_minutes {
            if v < 1 {
                return Err(Error::validation("mass_leave_window_minutes must be at least 1"));
            }
            settings.mass_leave_window_minutes = v;
        }
        if let Some(v) = self.anomaly_factor {
            if !v.is_finite() || v <= 0.0 {
                return Err(Error::validation("anomaly_factor must be positive"));
            }
            settings.anomaly_factor = v;
        }
        if let Some(v) = self.milestone_step {
            settings.milestone_step = v;
        }
        if let Some(v) = self.digest_daily {
            settings.digest_daily = v;
        }
        if let Some(v) = self.digest_weekly {
            settings.digest_weekly = v;
        }
        if let Some(v) = self.digest_monthly {
            settings.digest_monthly = v;
        }
        for hour in [self.quiet_hours_start, self.quiet_hours_end].into_iter().flatten() {
            if hour > 23 {
                return Err(Error::validation(format!("quiet hour {hour} is outside 0-23")));
            }
        }
        if let Some(v) = self.quiet_hours_start {
            settings.quiet_hours_start = v;
        }
        if let Some(v) = self.quiet_hours_end {
            settings.quiet_hours_end = v;
        }
        if let Some(v) = self.churn_percent_threshold {
            if !v.is_finite() {
                return Err(Error::validation("churn_percent_threshold must be finite"));
            }
            settings.churn_percent_threshold = v;
        }
        Ok(())
    }
}

/// Update a channel's alert configuration
pub async fn update_alert_settings(
    State(state): State<AppState>,
    Path(channel_id): Path<i64>,
    Json(req): Json<UpdateAlertSettingsRequest>,
) -> ApiResult<AlertSettings> {
    require_channel(&state, channel_id).await?;

    let mut settings = state
        .db
        .settings
        .get_or_create(channel_id)
        .await
        .map_err(|e| api_error(&e))?;
    req.apply(&mut settings).map_err(|e| api_error(&e))?;

    let mut saved = state
        .db
        .settings
        .update_config(&settings)
        .await
        .map_err(|e| api_error(&e))?;

    if let Some(vip_ids) = req.vip_ids {
        state
            .db
            .settings
            .set_vip_ids(channel_id, &vip_ids)
            .await
            .map_err(|e| api_error(&e))?;
        info!(channel_id, vips = vip_ids.len(), "VIP list replaced");
        saved.vip_ids = vip_ids;
    }

    info!(channel_id, "Alert settings updated");
    Ok(Json(saved))
}
