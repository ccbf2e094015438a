use askama::Template;
use askama_axum::IntoResponse as AskamaTemplateResponse;
use axum::{response::IntoResponse, routing::get, Router};
use chrono::Local;

use crate::{
    auth::CurrentUser,
    error::AppError,
    middleware::{inactivity::parse_activity, CurrentSession},
    models::session::{SessionValues, IP_ADDRESS_KEY, LAST_ACTIVITY_KEY, USER_AGENT_KEY},
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(dashboard))
}

#[derive(Template)]
#[template(path = "user/dashboard.html")]
struct DashboardTemplate {
    display_name: String,
    ip_address: String,
    user_agent: String,
    last_activity: String,
}

async fn dashboard(
    current: CurrentUser,
    CurrentSession(session): CurrentSession,
) -> Result<impl IntoResponse, AppError> {
    let user = current.require_user()?;
    let session = session.lock().await;
    let value = |key: &str| session.get(key).unwrap_or("–").to_string();

    Ok(AskamaTemplateResponse::into_response(DashboardTemplate {
        display_name: user.username.clone(),
        ip_address: value(IP_ADDRESS_KEY),
        user_agent: value(USER_AGENT_KEY),
        last_activity: session
            .get(LAST_ACTIVITY_KEY)
            .and_then(parse_activity)
            .map(|ts| ts.with_timezone(&Local).format("%d.%m.%Y %H:%M").to_string())
            .unwrap_or_else(|| "–".into()),
    }))
}
