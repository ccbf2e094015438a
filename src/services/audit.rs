use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite};
use tracing::{debug, warn};

use crate::{
    db::DbPool,
    error::AppError,
    middleware::context::RequestContext,
    models::login_event::{EventType, LoginEvent, LoginEventQuery},
};

const DEFAULT_EVENT_LIMIT: i64 = 100;
const MAX_EVENT_LIMIT: i64 = 1_000;

#[derive(Debug, Clone)]
pub enum AuthEvent {
    Login {
        user_id: i64,
        context: RequestContext,
    },
    /// Logouts triggered outside a request (e.g. revoked sessions) carry no context.
    Logout {
        user_id: i64,
        context: Option<RequestContext>,
    },
}

impl AuthEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            AuthEvent::Login { .. } => EventType::Login,
            AuthEvent::Logout { .. } => EventType::Logout,
        }
    }

    pub fn user_id(&self) -> i64 {
        match self {
            AuthEvent::Login { user_id, .. } | AuthEvent::Logout { user_id, .. } => *user_id,
        }
    }

    pub fn context(&self) -> Option<&RequestContext> {
        match self {
            AuthEvent::Login { context, .. } => Some(context),
            AuthEvent::Logout { context, .. } => context.as_ref(),
        }
    }
}

#[async_trait]
pub trait AuthEventHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &AuthEvent) -> Result<(), AppError>;
}

/// Dispatches authentication events to the registered handlers, in
/// registration order. Handler failures are logged and dropped.
#[derive(Clone, Default)]
pub struct AuthEvents {
    handlers: Vec<Arc<dyn AuthEventHandler>>,
}

impl AuthEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(mut self, handler: Arc<dyn AuthEventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub async fn publish(&self, event: AuthEvent) {
        debug!(
            event_type = %event.event_type(),
            user_id = event.user_id(),
            "publishing auth event"
        );
        for handler in &self.handlers {
            if let Err(err) = handler.handle(&event).await {
                warn!(
                    "{} could not handle {} for user {}: {err}",
                    handler.name(),
                    event.event_type(),
                    event.user_id()
                );
            }
        }
    }
}

/// Appends a [`LoginEvent`] row for every login and logout.
#[derive(Clone)]
pub struct LoginAudit {
    db: DbPool,
}

impl LoginAudit {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AuthEventHandler for LoginAudit {
    fn name(&self) -> &'static str {
        "login_audit"
    }

    async fn handle(&self, event: &AuthEvent) -> Result<(), AppError> {
        let context = event.context();
        sqlx::query(
            r#"INSERT INTO login_events (user_id, event_type, occurred_at, ip_address, user_agent, session_key)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
        )
        .bind(event.user_id())
        .bind(event.event_type().as_str())
        .bind(Utc::now())
        .bind(context.and_then(|c| c.client_ip.clone()))
        .bind(context.and_then(|c| c.user_agent.clone()))
        .bind(context.and_then(|c| c.session_key.clone()))
        .execute(&self.db)
        .await?;
        Ok(())
    }
}

/// Stamps `users.last_login_at` on login.
#[derive(Clone)]
pub struct LastLoginUpdater {
    db: DbPool,
}

impl LastLoginUpdater {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AuthEventHandler for LastLoginUpdater {
    fn name(&self) -> &'static str {
        "last_login"
    }

    async fn handle(&self, event: &AuthEvent) -> Result<(), AppError> {
        let AuthEvent::Login { user_id, .. } = event else {
            return Ok(());
        };
        sqlx::query("UPDATE users SET last_login_at = ?1 WHERE id = ?2")
            .bind(Utc::now())
            .bind(user_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}

pub async fn list_login_events(
    db: &DbPool,
    query: &LoginEventQuery,
) -> Result<Vec<LoginEvent>, AppError> {
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT id, user_id, event_type, occurred_at, ip_address, user_agent, session_key \
         FROM login_events WHERE 1 = 1",
    );
    if let Some(user_id) = query.user_id {
        builder.push(" AND user_id = ").push_bind(user_id);
    }
    if let Some(event_type) = query.event_type {
        builder.push(" AND event_type = ").push_bind(event_type.as_str());
    }
    let limit = query
        .limit
        .unwrap_or(DEFAULT_EVENT_LIMIT)
        .clamp(1, MAX_EVENT_LIMIT);
    builder.push(" ORDER BY id DESC LIMIT ").push_bind(limit);

    let events = builder
        .build_query_as::<LoginEvent>()
        .fetch_all(db)
        .await?;
    Ok(events)
}

/// Bulk delete for admins; everything when `before` is `None`.
pub async fn purge_login_events(
    db: &DbPool,
    before: Option<DateTime<Utc>>,
) -> Result<u64, AppError> {
    let result = match before {
        Some(cutoff) => {
            sqlx::query("DELETE FROM login_events WHERE julianday(occurred_at) < julianday(?1)")
                .bind(cutoff)
                .execute(db)
                .await?
        }
        None => sqlx::query("DELETE FROM login_events").execute(db).await?,
    };
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Failing;

    #[async_trait]
    impl AuthEventHandler for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn handle(&self, _event: &AuthEvent) -> Result<(), AppError> {
            Err(AppError::Other(anyhow::anyhow!("audit table locked")))
        }
    }

    #[derive(Default)]
    struct Counting(AtomicUsize);

    #[async_trait]
    impl AuthEventHandler for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn handle(&self, _event: &AuthEvent) -> Result<(), AppError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn failing_handler_does_not_stop_the_others() {
        let counter = Arc::new(Counting::default());
        let events = AuthEvents::new()
            .subscribe(Arc::new(Failing))
            .subscribe(counter.clone());

        events
            .publish(AuthEvent::Logout {
                user_id: 3,
                context: None,
            })
            .await;

        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn logout_without_context_has_no_metadata() {
        let event = AuthEvent::Logout {
            user_id: 9,
            context: None,
        };
        assert_eq!(event.event_type(), EventType::Logout);
        assert!(event.context().is_none());
    }
}
