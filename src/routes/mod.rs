pub mod admin;
pub mod public;
pub mod user;

use axum::{middleware, Router};
use tower_http::{services::ServeDir, trace::TraceLayer};

use crate::{middleware::session_layer, state::AppState};

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(public::router(&state.config.session.login_url))
        .nest("/me", user::router())
        .nest("/admin", admin::router())
        .nest_service("/static", ServeDir::new("static"))
        .layer(middleware::from_fn_with_state(state.clone(), session_layer))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
