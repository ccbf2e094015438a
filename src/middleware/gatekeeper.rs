use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::{
    config::SessionConfig,
    middleware::{
        context::RequestContext,
        exempt::ExemptPaths,
        pipeline::{Flow, RequestStage},
    },
    models::session::{SessionValues, NEXT_KEY},
};

/// Sends anonymous requests for protected paths to the login page.
pub struct LoginGatekeeper {
    exempt: Arc<ExemptPaths>,
    login_url: String,
}

impl LoginGatekeeper {
    pub fn new(exempt: Arc<ExemptPaths>, config: &SessionConfig) -> Self {
        Self {
            exempt,
            login_url: config.login_url.clone(),
        }
    }
}

impl RequestStage for LoginGatekeeper {
    fn name(&self) -> &'static str {
        "login_required"
    }

    fn process(
        &self,
        context: &RequestContext,
        session: &mut dyn SessionValues,
        _now: DateTime<Utc>,
    ) -> Flow {
        if self.exempt.is_exempt(&context.path) || session.is_authenticated() {
            return Flow::Continue;
        }
        if context.is_navigation() {
            session.set(NEXT_KEY, context.full_path.clone());
        }
        Flow::Redirect(self.login_url.clone())
    }
}
