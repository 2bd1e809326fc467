//! Business ingress: definitions, sequence triggers, campaign sends, delivery
//! webhooks and reply signals.

use std::collections::BTreeMap;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use mailflow_core::types::{Campaign, CampaignAnalytics, DeliveryEvent, Variables};
use mailflow_engine::{AudienceDef, CampaignDef, ContactInput, SequenceDef, TemplateDef};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::rest::{ApiError, AppState};

/// Optional contact attributes sent alongside a trigger.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContactAttributes {
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub custom_fields: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TriggerRequest {
    pub email: String,
    #[serde(default)]
    pub variables: Variables,
    #[serde(default)]
    pub attributes: ContactAttributes,
}

impl TriggerRequest {
    fn contact(&self) -> ContactInput {
        let attrs = self.attributes.clone();
        ContactInput {
            email: self.email.clone(),
            first_name: attrs.first_name,
            last_name: attrs.last_name,
            location: attrs.location,
            tags: attrs.tags,
            custom_fields: attrs.custom_fields,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplyRequest {
    pub email: String,
    pub sequence_key: String,
}

#[derive(Debug, Serialize)]
pub struct ReplyResponse {
    pub cancelled: usize,
}

#[derive(Debug, Serialize)]
pub struct CreatedResponse {
    pub id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleRequest {
    pub at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled_jobs: usize,
}

fn created(kind: &'static str, id: Uuid) -> (StatusCode, Json<CreatedResponse>) {
    info!(kind, id = %id, "Definition registered");
    metrics::counter!("api.definitions", "kind" => kind).increment(1);
    (StatusCode::CREATED, Json(CreatedResponse { id }))
}

/// POST /v1/templates
pub async fn handle_create_template(
    State(state): State<AppState>,
    Json(def): Json<TemplateDef>,
) -> Result<(StatusCode, Json<CreatedResponse>), ApiError> {
    let id = state.engine.define_template(def)?;
    Ok(created("template", id))
}

/// POST /v1/audiences
pub async fn handle_create_audience(
    State(state): State<AppState>,
    Json(def): Json<AudienceDef>,
) -> Result<(StatusCode, Json<CreatedResponse>), ApiError> {
    let id = state.engine.define_audience(def)?;
    Ok(created("audience", id))
}

/// POST /v1/sequences: steps name templates by key, the audience by id.
pub async fn handle_create_sequence(
    State(state): State<AppState>,
    Json(def): Json<SequenceDef>,
) -> Result<(StatusCode, Json<CreatedResponse>), ApiError> {
    let id = state.engine.define_sequence(def)?;
    Ok(created("sequence", id))
}

/// POST /v1/campaigns
pub async fn handle_create_campaign(
    State(state): State<AppState>,
    Json(def): Json<CampaignDef>,
) -> Result<(StatusCode, Json<CreatedResponse>), ApiError> {
    let id = state.engine.define_campaign(def)?;
    Ok(created("campaign", id))
}

/// POST /v1/sequences/:key/trigger
pub async fn handle_trigger(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(request): Json<TriggerRequest>,
) -> Result<(StatusCode, Json<mailflow_engine::PlanOutcome>), ApiError> {
    let outcome = state
        .engine
        .trigger(&key, &request.contact(), request.variables.clone())?;
    metrics::counter!("api.triggers", "kind" => "sequence").increment(1);
    Ok((StatusCode::ACCEPTED, Json(outcome)))
}

/// POST /v1/events/:event
pub async fn handle_event(
    State(state): State<AppState>,
    Path(event): Path<String>,
    Json(request): Json<TriggerRequest>,
) -> Result<(StatusCode, Json<Vec<mailflow_engine::PlanOutcome>>), ApiError> {
    let outcomes = state
        .engine
        .trigger_event(&event, &request.contact(), request.variables.clone())?;
    metrics::counter!("api.triggers", "kind" => "event").increment(1);
    Ok((StatusCode::ACCEPTED, Json(outcomes)))
}

/// POST /v1/campaigns/:id/send
pub async fn handle_send_campaign(
    State(state): State<AppState>,
    Path(campaign_id): Path<Uuid>,
) -> Result<(StatusCode, Json<mailflow_engine::BroadcastReport>), ApiError> {
    let report = state.engine.send_campaign(campaign_id)?;
    info!(campaign_id = %campaign_id, queued = report.queued, "Campaign send accepted");
    Ok((StatusCode::ACCEPTED, Json(report)))
}

/// POST /v1/campaigns/:id/schedule
pub async fn handle_schedule_campaign(
    State(state): State<AppState>,
    Path(campaign_id): Path<Uuid>,
    Json(request): Json<ScheduleRequest>,
) -> Result<Json<Campaign>, ApiError> {
    Ok(Json(state.engine.schedule_campaign(campaign_id, request.at)?))
}

/// POST /v1/campaigns/:id/cancel
pub async fn handle_cancel_campaign(
    State(state): State<AppState>,
    Path(campaign_id): Path<Uuid>,
) -> Result<Json<CancelResponse>, ApiError> {
    let cancelled_jobs = state.engine.cancel_campaign(campaign_id)?;
    Ok(Json(CancelResponse { cancelled_jobs }))
}

/// GET /v1/campaigns/:id/analytics
pub async fn handle_campaign_analytics(
    State(state): State<AppState>,
    Path(campaign_id): Path<Uuid>,
) -> Result<Json<CampaignAnalytics>, ApiError> {
    Ok(Json(state.engine.refresh_analytics(campaign_id)?))
}

/// POST /v1/webhooks/delivery: provider events, applied in order.
pub async fn handle_delivery_webhook(
    State(state): State<AppState>,
    Json(events): Json<Vec<DeliveryEvent>>,
) -> Json<mailflow_engine::ReconcileSummary> {
    metrics::counter!("api.webhook_events").increment(events.len() as u64);
    Json(state.engine.ingest_events(&events).await)
}

/// POST /v1/replies
pub async fn handle_reply(
    State(state): State<AppState>,
    Json(request): Json<ReplyRequest>,
) -> Result<Json<ReplyResponse>, ApiError> {
    let cancelled = state
        .engine
        .record_reply(&request.email, &request.sequence_key)?;
    Ok(Json(ReplyResponse { cancelled }))
}
