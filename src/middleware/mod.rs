pub mod annotator;
pub mod context;
pub mod exempt;
pub mod gatekeeper;
pub mod inactivity;
pub mod pipeline;
pub mod session;

pub use context::RequestContext;
pub use pipeline::{Flow, RequestStage, SessionPipeline};
pub use session::{session_layer, CurrentSession, SessionHandle, SESSION_COOKIE};
