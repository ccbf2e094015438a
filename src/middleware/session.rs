use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Request, State},
    http::request::Parts,
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use axum_extra::extract::cookie::{Cookie, PrivateCookieJar, SameSite};
use chrono::Utc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::{
    auth::{self, AuthenticatedUser},
    error::AppError,
    middleware::{context::RequestContext, pipeline::Flow},
    models::session::{Session, SessionValues},
    services::audit::AuthEvent,
    state::AppState,
};

pub const SESSION_COOKIE: &str = "backoffice_session";

/// Shared access to the session of the current request.
#[derive(Clone, Default)]
pub struct SessionHandle(Arc<Mutex<Session>>);

impl SessionHandle {
    pub fn new(session: Session) -> Self {
        Self(Arc::new(Mutex::new(session)))
    }

    pub async fn lock(&self) -> MutexGuard<'_, Session> {
        self.0.lock().await
    }

    async fn take(&self) -> Session {
        std::mem::take(&mut *self.0.lock().await)
    }
}

/// Extractor for handlers that read or change the session.
pub struct CurrentSession(pub SessionHandle);

#[async_trait]
impl<S> FromRequestParts<S> for CurrentSession
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<SessionHandle>()
            .cloned()
            .map(Self)
            .ok_or_else(|| AppError::Other(anyhow::anyhow!("session layer is not installed")))
    }
}

/// Loads the session, runs the session pipeline, calls the handler and
/// writes the session back.
pub async fn session_layer(
    State(state): State<AppState>,
    jar: PrivateCookieJar,
    request: Request,
    next: Next,
) -> Response {
    let mut session = load_session(&state, &jar).await;
    let current_user = resolve_user(&state, &mut session).await;

    let (mut parts, body) = request.into_parts();
    let context =
        RequestContext::from_parts(&parts).with_session_key(session.key().map(str::to_owned));

    let response = match state.pipeline.run(&context, &mut session, Utc::now()) {
        Flow::Continue => {
            let handle = SessionHandle::new(session);
            parts.extensions.insert(handle.clone());
            parts.extensions.insert(context);
            if let Some(user) = current_user {
                parts.extensions.insert(user);
            }
            let response = next.run(Request::from_parts(parts, body)).await;
            session = handle.take().await;
            response
        }
        Flow::Redirect(location) => Redirect::to(&location).into_response(),
        Flow::ForcedLogout { user_id, location } => {
            if let Some(user_id) = user_id {
                state
                    .events
                    .publish(AuthEvent::Logout {
                        user_id,
                        context: Some(context),
                    })
                    .await;
            }
            Redirect::to(&location).into_response()
        }
    };

    let jar = persist_session(&state, jar, session).await;
    (jar, response).into_response()
}

async fn load_session(state: &AppState, jar: &PrivateCookieJar) -> Session {
    let Some(key) = jar.get(SESSION_COOKIE).map(|cookie| cookie.value().to_string()) else {
        return Session::new();
    };
    match state.sessions.load(&key).await {
        Ok(Some(values)) => Session::from_store(key, values),
        Ok(None) => Session::new(),
        Err(err) => {
            warn!("could not load session, starting a fresh one: {err}");
            Session::new()
        }
    }
}

/// A session pointing at a user that no longer exists is flushed.
async fn resolve_user(state: &AppState, session: &mut Session) -> Option<AuthenticatedUser> {
    if !session.is_authenticated() {
        return None;
    }
    let Some(user_id) = session.user_id() else {
        session.flush();
        return None;
    };
    match auth::load_user(&state.db, user_id).await {
        Ok(Some(user)) => Some(user),
        Ok(None) => {
            info!(user_id, "session refers to a deleted user, flushing");
            session.flush();
            None
        }
        Err(err) => {
            warn!(user_id, "could not load session user: {err}");
            None
        }
    }
}

async fn persist_session(
    state: &AppState,
    jar: PrivateCookieJar,
    mut session: Session,
) -> PrivateCookieJar {
    for key in session.take_retired_keys() {
        if let Err(err) = state.sessions.delete(&key).await {
            warn!("could not delete retired session: {err}");
        }
    }

    if session.is_empty() || session.is_transient() {
        if let Some(key) = session.key() {
            if let Err(err) = state.sessions.delete(key).await {
                warn!("could not delete empty session: {err}");
            }
        }
        if jar.get(SESSION_COOKIE).is_some() {
            return jar.remove(Cookie::build(SESSION_COOKIE).path("/"));
        }
        return jar;
    }

    if !session.is_modified() {
        return jar;
    }

    let key = session.ensure_key();
    let expires_at = Utc::now() + state.config.session.session_age();
    if let Err(err) = state.sessions.save(&key, session.values(), expires_at).await {
        error!("could not save session: {err}");
        return jar;
    }
    jar.add(session_cookie(key))
}

fn session_cookie(key: String) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, key))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .build()
}
