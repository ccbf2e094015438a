use std::sync::Arc;

use axum::extract::FromRef;
use axum_extra::extract::cookie::Key;
use sha2::{Digest, Sha512};

use crate::{
    config::{AppConfig, SessionBackend},
    db::DbPool,
    middleware::SessionPipeline,
    services::{
        audit::{AuthEvents, LastLoginUpdater, LoginAudit},
        sessions::{MemorySessionStore, SessionStore, SqliteSessionStore},
    },
};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub db: DbPool,
    pub sessions: Arc<dyn SessionStore>,
    pub events: AuthEvents,
    pub pipeline: Arc<SessionPipeline>,
    pub cookie_key: Key,
}

impl AppState {
    pub fn new(config: AppConfig, db: DbPool) -> Self {
        let sessions: Arc<dyn SessionStore> = match config.session.backend {
            SessionBackend::Database => Arc::new(SqliteSessionStore::new(db.clone())),
            SessionBackend::Memory => Arc::new(MemorySessionStore::new()),
        };
        let events = AuthEvents::new()
            .subscribe(Arc::new(LoginAudit::new(db.clone())))
            .subscribe(Arc::new(LastLoginUpdater::new(db.clone())));
        let pipeline = Arc::new(SessionPipeline::new(&config.session));

        let digest = Sha512::digest(config.cookie_secret.as_bytes());
        let cookie_key = Key::from(&digest[..]);
        Self {
            config,
            db,
            sessions,
            events,
            pipeline,
            cookie_key,
        }
    }
}

impl FromRef<AppState> for Key {
    fn from_ref(state: &AppState) -> Self {
        state.cookie_key.clone()
    }
}
