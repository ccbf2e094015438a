pub mod login_event;
pub mod session;
pub mod user;
