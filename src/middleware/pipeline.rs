use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::{
    config::SessionConfig,
    middleware::{
        annotator::SessionAnnotator, context::RequestContext, exempt::ExemptPaths,
        gatekeeper::LoginGatekeeper, inactivity::InactivityEvaluator,
    },
    models::session::SessionValues,
};

/// Outcome of a single stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Redirect(String),
    /// The session was flushed because it sat idle too long.
    ForcedLogout {
        user_id: Option<i64>,
        location: String,
    },
}

pub trait RequestStage: Send + Sync {
    fn name(&self) -> &'static str;

    fn process(
        &self,
        context: &RequestContext,
        session: &mut dyn SessionValues,
        now: DateTime<Utc>,
    ) -> Flow;
}

/// The per-request session chain.
///
/// The inactivity check has to see the stored `last_activity` before the
/// annotator overwrites it, so the stage order is fixed here rather than
/// left to the caller.
pub struct SessionPipeline {
    stages: Vec<Box<dyn RequestStage>>,
}

impl SessionPipeline {
    pub fn new(config: &SessionConfig) -> Self {
        let exempt = Arc::new(ExemptPaths::new(
            &config.login_exempt_urls,
            &config.login_url,
        ));
        Self {
            stages: vec![
                Box::new(InactivityEvaluator::new(exempt.clone(), config)),
                Box::new(LoginGatekeeper::new(exempt, config)),
                Box::new(SessionAnnotator),
            ],
        }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Runs the stages in order and stops at the first one that does not continue.
    pub fn run(
        &self,
        context: &RequestContext,
        session: &mut dyn SessionValues,
        now: DateTime<Utc>,
    ) -> Flow {
        for stage in &self.stages {
            match stage.process(context, session, now) {
                Flow::Continue => continue,
                other => {
                    tracing::debug!(stage = stage.name(), path = %context.path, "request short-circuited");
                    return other;
                }
            }
        }
        Flow::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::session::{
        Session, AUTH_USER_KEY, IP_ADDRESS_KEY, LAST_ACTIVITY_KEY, NEXT_KEY, USER_AGENT_KEY,
    };
    use axum::http::Method;
    use chrono::Duration;

    const TIMEOUT: i64 = 10_800;

    fn pipeline() -> SessionPipeline {
        SessionPipeline::new(&SessionConfig::default())
    }

    fn context(path: &str) -> RequestContext {
        RequestContext {
            method: Method::GET,
            path: path.split('?').next().unwrap_or(path).to_string(),
            full_path: path.to_string(),
            client_ip: Some("10.1.1.1".into()),
            user_agent: Some("till/1.0".into()),
            session_key: None,
        }
    }

    fn logged_in(last_activity: DateTime<Utc>) -> Session {
        let mut session = Session::new();
        session.set(AUTH_USER_KEY, "42".into());
        session.set(LAST_ACTIVITY_KEY, last_activity.to_rfc3339());
        session
    }

    #[test]
    fn stages_run_inactivity_first() {
        assert_eq!(
            pipeline().stage_names(),
            vec!["inactivity", "login_required", "session_metadata"]
        );
    }

    #[test]
    fn idle_session_is_logged_out_before_metadata_refresh() {
        let now = Utc::now();
        let mut session = logged_in(now - Duration::seconds(TIMEOUT + 1));

        let flow = pipeline().run(&context("/cart?page=2"), &mut session, now);

        assert_eq!(
            flow,
            Flow::ForcedLogout {
                user_id: Some(42),
                location: "/login".into()
            }
        );
        assert!(!session.is_authenticated());
        assert_eq!(session.get(NEXT_KEY), Some("/cart?page=2"));
        assert!(!session.contains(LAST_ACTIVITY_KEY));
    }

    #[test]
    fn recently_active_session_proceeds() {
        let now = Utc::now();
        let mut session = logged_in(now - Duration::seconds(TIMEOUT - 1));

        let flow = pipeline().run(&context("/cart"), &mut session, now);

        assert_eq!(flow, Flow::Continue);
        assert!(session.is_authenticated());
        assert_eq!(session.get(LAST_ACTIVITY_KEY), Some(now.to_rfc3339().as_str()));
    }

    #[test]
    fn exempt_paths_never_redirect() {
        let now = Utc::now();
        let pipeline = pipeline();

        let mut stale = logged_in(now - Duration::days(3));
        assert_eq!(
            pipeline.run(&context("/static/app.js"), &mut stale, now),
            Flow::Continue
        );
        assert!(stale.is_authenticated());

        let mut anonymous = Session::new();
        assert_eq!(
            pipeline.run(&context("/login"), &mut anonymous, now),
            Flow::Continue
        );
        assert!(!anonymous.contains(NEXT_KEY));
    }

    #[test]
    fn anonymous_request_is_sent_to_login_with_next() {
        let now = Utc::now();
        let mut session = Session::new();

        let flow = pipeline().run(&context("/users/7/commissions"), &mut session, now);

        assert_eq!(flow, Flow::Redirect("/login".into()));
        assert_eq!(session.get(NEXT_KEY), Some("/users/7/commissions"));
        assert!(!session.contains(IP_ADDRESS_KEY));
    }

    #[test]
    fn anonymous_form_post_is_redirected_without_next() {
        let mut session = Session::new();
        let mut post = context("/invoices/9/cancel");
        post.method = Method::POST;

        let flow = pipeline().run(&post, &mut session, Utc::now());

        assert_eq!(flow, Flow::Redirect("/login".into()));
        assert!(!session.contains(NEXT_KEY));
    }

    #[test]
    fn landing_page_is_public() {
        let mut session = Session::new();
        assert_eq!(
            pipeline().run(&context("/"), &mut session, Utc::now()),
            Flow::Continue
        );
        assert_eq!(
            pipeline().run(&context("/cart"), &mut Session::new(), Utc::now()),
            Flow::Redirect("/login".into())
        );
    }

    #[test]
    fn metadata_is_captured_once() {
        let now = Utc::now();
        let pipeline = pipeline();
        let mut session = logged_in(now);

        pipeline.run(&context("/me"), &mut session, now);
        let later = now + Duration::seconds(30);
        let mut moved = context("/me");
        moved.client_ip = Some("192.168.0.9".into());
        moved.user_agent = Some("other-browser".into());
        pipeline.run(&moved, &mut session, later);

        assert_eq!(session.get(IP_ADDRESS_KEY), Some("10.1.1.1"));
        assert_eq!(session.get(USER_AGENT_KEY), Some("till/1.0"));
        assert_eq!(
            session.get(LAST_ACTIVITY_KEY),
            Some(later.to_rfc3339().as_str())
        );
    }
}
