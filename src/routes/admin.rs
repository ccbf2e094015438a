use askama::Template;
use askama_axum::IntoResponse as AskamaTemplateResponse;
use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Redirect},
    routing::{get, post},
    Form, Json, Router,
};
use chrono::{DateTime, Local, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::{
    auth::{self, CurrentUser},
    error::AppError,
    models::login_event::{LoginEvent, LoginEventQuery},
    services::audit,
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/login-events", get(login_events_page))
        .route("/login-events/purge", post(purge_login_events))
        .route("/api/login-events", get(login_events_json))
        .route("/users/:id/sessions/revoke", post(revoke_sessions))
}

#[derive(Template)]
#[template(path = "admin/login_events.html")]
struct LoginEventsTemplate {
    events: Vec<LoginEventRow>,
}

#[derive(Clone)]
struct LoginEventRow {
    user_id: i64,
    event_type: String,
    occurred_at: String,
    ip_address: String,
    user_agent: String,
}

impl From<LoginEvent> for LoginEventRow {
    fn from(event: LoginEvent) -> Self {
        Self {
            user_id: event.user_id,
            event_type: event.event_type,
            occurred_at: format_timestamp(event.occurred_at),
            ip_address: event.ip_address.unwrap_or_else(|| "–".into()),
            user_agent: event.user_agent.unwrap_or_else(|| "–".into()),
        }
    }
}

async fn login_events_page(
    State(state): State<AppState>,
    current: CurrentUser,
    Query(query): Query<LoginEventQuery>,
) -> Result<impl IntoResponse, AppError> {
    current.require_admin()?;
    let events = audit::list_login_events(&state.db, &query).await?;
    Ok(AskamaTemplateResponse::into_response(LoginEventsTemplate {
        events: events.into_iter().map(LoginEventRow::from).collect(),
    }))
}

async fn login_events_json(
    State(state): State<AppState>,
    current: CurrentUser,
    Query(query): Query<LoginEventQuery>,
) -> Result<Json<Vec<LoginEvent>>, AppError> {
    current.require_admin()?;
    let events = audit::list_login_events(&state.db, &query).await?;
    Ok(Json(events))
}

#[derive(Deserialize)]
struct PurgeForm {
    before: Option<String>,
}

async fn purge_login_events(
    State(state): State<AppState>,
    current: CurrentUser,
    Form(form): Form<PurgeForm>,
) -> Result<Redirect, AppError> {
    let admin = current.require_admin()?;
    let before = match form.before.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(
            DateTime::parse_from_rfc3339(raw)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|_| AppError::BadRequest(format!("invalid timestamp: {raw}")))?,
        ),
    };
    let removed = audit::purge_login_events(&state.db, before).await?;
    info!(admin = %admin.username, removed, "purged login events");
    Ok(Redirect::to("/admin/login-events"))
}

async fn revoke_sessions(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(user_id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    current.require_admin()?;
    if auth::load_user(&state.db, user_id).await?.is_none() {
        return Err(AppError::NotFound);
    }
    let revoked = auth::revoke_user_sessions(&state, user_id).await?;
    Ok(Json(json!({ "user_id": user_id, "revoked": revoked })))
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.with_timezone(&Local)
        .format("%d.%m.%Y %H:%M")
        .to_string()
}
