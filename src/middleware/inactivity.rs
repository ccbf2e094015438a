use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use tracing::info;

use crate::{
    config::SessionConfig,
    middleware::{
        context::RequestContext,
        exempt::ExemptPaths,
        pipeline::{Flow, RequestStage},
    },
    models::session::{SessionValues, LAST_ACTIVITY_KEY, NEXT_KEY},
};

/// Logs out authenticated sessions that were idle for longer than the timeout.
pub struct InactivityEvaluator {
    exempt: Arc<ExemptPaths>,
    timeout: Duration,
    login_url: String,
}

impl InactivityEvaluator {
    pub fn new(exempt: Arc<ExemptPaths>, config: &SessionConfig) -> Self {
        Self {
            exempt,
            timeout: config.inactivity_timeout(),
            login_url: config.login_url.clone(),
        }
    }
}

impl RequestStage for InactivityEvaluator {
    fn name(&self) -> &'static str {
        "inactivity"
    }

    fn process(
        &self,
        context: &RequestContext,
        session: &mut dyn SessionValues,
        now: DateTime<Utc>,
    ) -> Flow {
        if self.exempt.is_exempt(&context.path) || !session.is_authenticated() {
            return Flow::Continue;
        }

        // No usable timestamp counts as no prior activity.
        let Some(last_activity) = session.get(LAST_ACTIVITY_KEY).and_then(parse_activity) else {
            return Flow::Continue;
        };

        if now - last_activity <= self.timeout {
            return Flow::Continue;
        }

        let user_id = session.user_id();
        info!(
            user_id,
            idle_secs = (now - last_activity).num_seconds(),
            "session expired after inactivity"
        );
        session.flush();
        if context.is_navigation() {
            session.set(NEXT_KEY, context.full_path.clone());
        }
        Flow::ForcedLogout {
            user_id,
            location: self.login_url.clone(),
        }
    }
}

/// Reads RFC 3339 timestamps and naive ISO-8601 ones (taken as UTC).
pub fn parse_activity(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::session::{Session, AUTH_USER_KEY};
    use axum::http::Method;

    fn evaluator(timeout: i64) -> InactivityEvaluator {
        let config = SessionConfig {
            inactivity_timeout_secs: timeout,
            ..SessionConfig::default()
        };
        let exempt = Arc::new(ExemptPaths::new(&config.login_exempt_urls, &config.login_url));
        InactivityEvaluator::new(exempt, &config)
    }

    fn context(path: &str) -> RequestContext {
        RequestContext {
            method: Method::GET,
            path: path.into(),
            full_path: path.into(),
            ..RequestContext::default()
        }
    }

    #[test]
    fn parses_naive_and_offset_timestamps() {
        let naive = parse_activity("2024-03-01T08:30:00.123456").unwrap();
        let offset = parse_activity("2024-03-01T09:30:00.123456+01:00").unwrap();
        assert_eq!(naive, offset);
        assert!(parse_activity("yesterday-ish").is_none());
    }

    #[test]
    fn garbage_timestamp_fails_open() {
        let mut session = Session::new();
        session.set(AUTH_USER_KEY, "1".into());
        session.set(LAST_ACTIVITY_KEY, "not a date".into());

        let flow = evaluator(60).process(&context("/invoices"), &mut session, Utc::now());

        assert_eq!(flow, Flow::Continue);
        assert!(session.is_authenticated());
    }

    #[test]
    fn exactly_at_the_timeout_is_still_active() {
        let now = Utc::now();
        let mut session = Session::new();
        session.set(AUTH_USER_KEY, "1".into());
        session.set(LAST_ACTIVITY_KEY, (now - Duration::seconds(60)).to_rfc3339());

        let flow = evaluator(60).process(&context("/invoices"), &mut session, now);

        assert_eq!(flow, Flow::Continue);
    }

    #[test]
    fn idle_form_post_is_not_remembered_as_next() {
        let now = Utc::now();
        let mut session = Session::new();
        session.set(AUTH_USER_KEY, "1".into());
        session.set(LAST_ACTIVITY_KEY, (now - Duration::seconds(61)).to_rfc3339());
        let mut logout = context("/logout");
        logout.method = Method::POST;

        let flow = evaluator(60).process(&logout, &mut session, now);

        assert!(matches!(flow, Flow::ForcedLogout { .. }));
        assert!(session.is_empty());
    }

    #[test]
    fn anonymous_sessions_are_ignored() {
        let now = Utc::now();
        let mut session = Session::new();
        session.set(LAST_ACTIVITY_KEY, (now - Duration::days(1)).to_rfc3339());

        let flow = evaluator(60).process(&context("/invoices"), &mut session, now);

        assert_eq!(flow, Flow::Continue);
        assert!(session.contains(LAST_ACTIVITY_KEY));
    }
}
