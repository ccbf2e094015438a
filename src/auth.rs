use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use async_trait::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};
use chrono::Utc;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    config::AdminAccount,
    db::DbPool,
    error::AppError,
    middleware::{context::RequestContext, session::SessionHandle},
    models::{
        session::{SessionValues, AUTH_USER_KEY},
        user::{User, UserRole},
    },
    services::audit::AuthEvent,
    state::AppState,
};

pub const DEFAULT_LANDING: &str = "/me";
const MIN_PASSWORD_LEN: usize = 8;
const REDIRECT_BASE: &str = "http://backoffice.invalid/";

#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub id: i64,
    pub uuid: String,
    pub username: String,
    pub role: UserRole,
}

impl From<User> for AuthenticatedUser {
    fn from(user: User) -> Self {
        let role = user.role();
        Self {
            id: user.id,
            uuid: user.uuid,
            username: user.username,
            role,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CurrentUser(pub Option<AuthenticatedUser>);

#[async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        // Inserted by the session layer once the session user is resolved.
        if let Some(user) = parts.extensions.get::<AuthenticatedUser>() {
            return Ok(Self(Some(user.clone())));
        }

        Ok(Self(None))
    }
}

impl CurrentUser {
    pub fn require_user(&self) -> Result<&AuthenticatedUser, AppError> {
        self.0.as_ref().ok_or(AppError::Unauthorized)
    }

    pub fn require_admin(&self) -> Result<&AuthenticatedUser, AppError> {
        let user = self.require_user()?;
        if user.role == UserRole::Admin {
            Ok(user)
        } else {
            Err(AppError::Forbidden)
        }
    }
}

pub async fn register_user(
    state: &AppState,
    username: &str,
    email: &str,
    password: &str,
) -> Result<AuthenticatedUser, AppError> {
    insert_user(&state.db, username, email, password, UserRole::User).await
}

async fn insert_user(
    db: &DbPool,
    username: &str,
    email: &str,
    password: &str,
    role: UserRole,
) -> Result<AuthenticatedUser, AppError> {
    let username = username.trim();
    let email = email.trim();
    if username.is_empty() || email.is_empty() {
        return Err(AppError::BadRequest(
            "Username and email are required.".into(),
        ));
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::BadRequest(format!(
            "Passwords need at least {MIN_PASSWORD_LEN} characters."
        )));
    }

    let taken: Option<i64> =
        sqlx::query_scalar("SELECT id FROM users WHERE username = ?1 OR email = ?2")
            .bind(username)
            .bind(email)
            .fetch_optional(db)
            .await?;
    if taken.is_some() {
        return Err(AppError::BadRequest(
            "Username or email is already taken.".into(),
        ));
    }

    let uuid = Uuid::new_v4().to_string();
    let result = sqlx::query(
        r#"INSERT INTO users (uuid, username, email, password_hash, role, created_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
    )
    .bind(&uuid)
    .bind(username)
    .bind(email)
    .bind(hash_password(password)?)
    .bind(role.as_str())
    .bind(Utc::now())
    .execute(db)
    .await?;

    info!(username, role = %role, "created user");
    Ok(AuthenticatedUser {
        id: result.last_insert_rowid(),
        uuid,
        username: username.to_string(),
        role,
    })
}

/// Checks credentials; `identifier` may be a username or an email address.
pub async fn authenticate_user(
    state: &AppState,
    identifier: &str,
    password: &str,
) -> Result<AuthenticatedUser, AppError> {
    let identifier = identifier.trim();
    if identifier.is_empty() || password.is_empty() {
        return Err(AppError::BadRequest(
            "Please enter your username and password.".into(),
        ));
    }

    let user: Option<User> = sqlx::query_as(
        r#"SELECT id, uuid, username, email, password_hash, role, created_at, last_login_at
           FROM users WHERE username = ?1 OR email = ?1"#,
    )
    .bind(identifier)
    .fetch_optional(&state.db)
    .await?;

    match user {
        Some(user) if verify_password(password, &user.password_hash) => Ok(user.into()),
        _ => {
            warn!(identifier, "failed login attempt");
            Err(AppError::Unauthorized)
        }
    }
}

pub async fn load_user(db: &DbPool, user_id: i64) -> Result<Option<AuthenticatedUser>, AppError> {
    let user: Option<User> = sqlx::query_as(
        r#"SELECT id, uuid, username, email, password_hash, role, created_at, last_login_at
           FROM users WHERE id = ?1"#,
    )
    .bind(user_id)
    .fetch_optional(db)
    .await?;
    Ok(user.map(AuthenticatedUser::from))
}

/// Marks the session as authenticated under a fresh key and announces the login.
///
/// Values of an anonymous session (or of the same user) are kept; a session
/// that belongs to someone else is emptied first.
pub async fn login(
    state: &AppState,
    session: &SessionHandle,
    user: &AuthenticatedUser,
    context: RequestContext,
) -> String {
    let key = {
        let mut session = session.lock().await;
        if session.user_id().is_some_and(|id| id != user.id) {
            session.flush();
        }
        let key = session.cycle_key();
        session.set(AUTH_USER_KEY, user.id.to_string());
        key
    };

    info!(user_id = user.id, username = %user.username, "user logged in");
    state
        .events
        .publish(AuthEvent::Login {
            user_id: user.id,
            context: context.with_session_key(Some(key.clone())),
        })
        .await;
    key
}

/// Flushes the session. A `Logout` event is published when a user was logged in.
pub async fn logout(state: &AppState, session: &SessionHandle, context: Option<RequestContext>) {
    let (user_id, key) = {
        let mut session = session.lock().await;
        let user_id = session.user_id();
        let key = session.key().map(str::to_owned);
        session.flush();
        (user_id, key)
    };

    let Some(user_id) = user_id else {
        return;
    };
    info!(user_id, "user logged out");
    state
        .events
        .publish(AuthEvent::Logout {
            user_id,
            context: context.map(|context| context.with_session_key(key)),
        })
        .await;
}

/// Drops every stored session of a user; each one counts as a logout.
pub async fn revoke_user_sessions(state: &AppState, user_id: i64) -> Result<usize, AppError> {
    let keys = state.sessions.delete_user_sessions(user_id).await?;
    for _ in &keys {
        state
            .events
            .publish(AuthEvent::Logout {
                user_id,
                context: None,
            })
            .await;
    }
    info!(user_id, revoked = keys.len(), "revoked user sessions");
    Ok(keys.len())
}

/// Creates the configured admin account, or promotes it if it already exists.
pub async fn ensure_admin(state: &AppState, account: &AdminAccount) -> Result<(), AppError> {
    let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM users WHERE username = ?1")
        .bind(account.username.trim())
        .fetch_optional(&state.db)
        .await?;

    match existing {
        Some(id) => {
            sqlx::query("UPDATE users SET role = ?1 WHERE id = ?2")
                .bind(UserRole::Admin.as_str())
                .bind(id)
                .execute(&state.db)
                .await?;
        }
        None => {
            insert_user(
                &state.db,
                &account.username,
                &account.email,
                &account.password,
                UserRole::Admin,
            )
            .await?;
        }
    }
    Ok(())
}

/// Only same-site relative paths are followed after login.
pub fn safe_redirect_target(next: Option<&str>) -> String {
    let Some(next) = next.map(str::trim).filter(|next| !next.is_empty()) else {
        return DEFAULT_LANDING.to_string();
    };
    if !next.starts_with('/') || next.starts_with("//") || next.contains('\\') {
        return DEFAULT_LANDING.to_string();
    }

    let Ok(base) = Url::parse(REDIRECT_BASE) else {
        return DEFAULT_LANDING.to_string();
    };
    match base.join(next) {
        Ok(url) if url.host_str() == base.host_str() => match url.query() {
            Some(query) => format!("{}?{query}", url.path()),
            None => url.path().to_string(),
        },
        _ => DEFAULT_LANDING.to_string(),
    }
}

fn hash_password(password: &str) -> Result<String, AppError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| AppError::Other(anyhow::anyhow!("could not hash password: {err}")))
}

fn verify_password(password: &str, hash: &str) -> bool {
    PasswordHash::new(hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_next_is_followed() {
        assert_eq!(
            safe_redirect_target(Some("/cart/items?barcode=400123")),
            "/cart/items?barcode=400123"
        );
    }

    #[test]
    fn foreign_or_missing_next_falls_back() {
        assert_eq!(safe_redirect_target(None), DEFAULT_LANDING);
        assert_eq!(safe_redirect_target(Some("")), DEFAULT_LANDING);
        assert_eq!(safe_redirect_target(Some("https://evil.example/")), DEFAULT_LANDING);
        assert_eq!(safe_redirect_target(Some("//evil.example/")), DEFAULT_LANDING);
        assert_eq!(safe_redirect_target(Some("/\\evil.example")), DEFAULT_LANDING);
    }

    #[test]
    fn password_hashes_verify() {
        let hash = hash_password("correct horse").unwrap();
        assert!(verify_password("correct horse", &hash));
        assert!(!verify_password("wrong horse", &hash));
        assert!(!verify_password("correct horse", "not-a-phc-string"));
    }
}
