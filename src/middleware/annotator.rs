use chrono::{DateTime, Utc};

use crate::{
    middleware::{
        context::RequestContext,
        pipeline::{Flow, RequestStage},
    },
    models::session::{SessionValues, IP_ADDRESS_KEY, LAST_ACTIVITY_KEY, USER_AGENT_KEY},
};

/// Records where a session came from and when it was last used.
///
/// IP and user agent are written on the first request of a session only;
/// `last_activity` is overwritten on every request. Never short-circuits.
pub struct SessionAnnotator;

impl RequestStage for SessionAnnotator {
    fn name(&self) -> &'static str {
        "session_metadata"
    }

    fn process(
        &self,
        context: &RequestContext,
        session: &mut dyn SessionValues,
        now: DateTime<Utc>,
    ) -> Flow {
        if !session.contains(IP_ADDRESS_KEY) {
            if let Some(ip) = &context.client_ip {
                session.set(IP_ADDRESS_KEY, ip.clone());
            }
        }
        if !session.contains(USER_AGENT_KEY) {
            session.set(
                USER_AGENT_KEY,
                context.user_agent.clone().unwrap_or_default(),
            );
        }
        session.set(LAST_ACTIVITY_KEY, now.to_rfc3339());
        Flow::Continue
    }
}
