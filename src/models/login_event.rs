use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventType {
    #[serde(rename = "LOGIN")]
    Login,
    #[serde(rename = "LOGOUT")]
    Logout,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Login => "LOGIN",
            EventType::Logout => "LOGOUT",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Append-only audit row written for every login and logout.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LoginEvent {
    pub id: i64,
    pub user_id: i64,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub session_key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoginEventQuery {
    pub user_id: Option<i64>,
    pub event_type: Option<EventType>,
    pub limit: Option<i64>,
}
