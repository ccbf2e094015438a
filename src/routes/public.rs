use askama::Template;
use askama_axum::IntoResponse as AskamaTemplateResponse;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Router,
};
use serde::Deserialize;

use crate::{
    auth::{self, CurrentUser},
    error::AppError,
    middleware::{CurrentSession, RequestContext},
    models::session::{SessionValues, NEXT_KEY},
    state::AppState,
};

/// `login_url` is where the login form lives; the session chain redirects there.
pub fn router(login_url: &str) -> Router<AppState> {
    Router::new()
        .route("/", get(landing))
        .route("/health", get(health))
        .route(login_url, get(login_form).post(login_submit))
        .route("/logout", post(logout))
}

#[derive(Template)]
#[template(path = "landing.html")]
struct LandingTemplate {
    logged_in: bool,
    login_url: String,
}

async fn landing(State(state): State<AppState>, current: CurrentUser) -> impl IntoResponse {
    AskamaTemplateResponse::into_response(LandingTemplate {
        logged_in: current.0.is_some(),
        login_url: state.config.session.login_url.clone(),
    })
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Template)]
#[template(path = "auth/login.html")]
pub struct LoginTemplate {
    login_url: String,
    show_error: bool,
    error_message: String,
    identifier: String,
}

async fn login_form(State(state): State<AppState>) -> impl IntoResponse {
    AskamaTemplateResponse::into_response(LoginTemplate {
        login_url: state.config.session.login_url.clone(),
        show_error: false,
        error_message: String::new(),
        identifier: String::new(),
    })
}

#[derive(Deserialize)]
struct LoginForm {
    identifier: String,
    password: String,
}

async fn login_submit(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    context: RequestContext,
    Form(form): Form<LoginForm>,
) -> Result<Response, AppError> {
    match auth::authenticate_user(&state, &form.identifier, &form.password).await {
        Ok(user) => {
            auth::login(&state, &session, &user, context).await;
            let next = session.lock().await.remove(NEXT_KEY);
            let target = auth::safe_redirect_target(next.as_deref());
            Ok(Redirect::to(&target).into_response())
        }
        Err(AppError::Unauthorized) => Ok(render_login_error(
            &state,
            form.identifier,
            "Login failed, please check your credentials.".into(),
        )),
        Err(AppError::BadRequest(msg)) => Ok(render_login_error(&state, form.identifier, msg)),
        Err(err) => Err(err),
    }
}

fn render_login_error(state: &AppState, identifier: String, message: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        AskamaTemplateResponse::into_response(LoginTemplate {
            login_url: state.config.session.login_url.clone(),
            show_error: true,
            error_message: message,
            identifier,
        }),
    )
        .into_response()
}

async fn logout(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    context: RequestContext,
) -> Redirect {
    auth::logout(&state, &session, Some(context)).await;
    Redirect::to(&state.config.session.login_url)
}
