use std::collections::HashMap;

use uuid::Uuid;

pub const AUTH_USER_KEY: &str = "_auth_user_id";
pub const IP_ADDRESS_KEY: &str = "ip_address";
pub const USER_AGENT_KEY: &str = "user_agent";
pub const LAST_ACTIVITY_KEY: &str = "last_activity";
pub const NEXT_KEY: &str = "next";

/// Written by the metadata stage on every request.
const METADATA_KEYS: &[&str] = &[IP_ADDRESS_KEY, USER_AGENT_KEY, LAST_ACTIVITY_KEY];

/// Key-value view of a session. The request stages only ever see this.
pub trait SessionValues {
    fn get(&self, key: &str) -> Option<&str>;

    fn set(&mut self, key: &str, value: String);

    fn remove(&mut self, key: &str) -> Option<String>;

    /// Drops every value and the session identity with them.
    fn flush(&mut self);

    fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    fn user_id(&self) -> Option<i64> {
        self.get(AUTH_USER_KEY).and_then(|raw| raw.parse().ok())
    }

    fn is_authenticated(&self) -> bool {
        self.contains(AUTH_USER_KEY)
    }
}

/// A session as loaded for one request.
///
/// `key` is `None` until the session is first persisted or after a flush.
/// Keys that were replaced during the request are kept in `retired` so the
/// layer can delete them from the store.
#[derive(Debug, Clone, Default)]
pub struct Session {
    key: Option<String>,
    values: HashMap<String, String>,
    retired: Vec<String>,
    modified: bool,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_store(key: String, values: HashMap<String, String>) -> Self {
        Self {
            key: Some(key),
            values,
            retired: Vec::new(),
            modified: false,
        }
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn values(&self) -> &HashMap<String, String> {
        &self.values
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// A session that was never stored and holds nothing but request
    /// metadata. Such sessions are not worth persisting.
    pub fn is_transient(&self) -> bool {
        self.key.is_none()
            && self
                .values
                .keys()
                .all(|key| METADATA_KEYS.contains(&key.as_str()))
    }

    /// Gives the session a fresh identifier and keeps its values.
    pub fn cycle_key(&mut self) -> String {
        if let Some(old) = self.key.take() {
            self.retired.push(old);
        }
        let key = generate_key();
        self.key = Some(key.clone());
        self.modified = true;
        key
    }

    /// Returns the key to persist under, allocating one if needed.
    pub fn ensure_key(&mut self) -> String {
        match &self.key {
            Some(key) => key.clone(),
            None => {
                let key = generate_key();
                self.key = Some(key.clone());
                key
            }
        }
    }

    pub fn take_retired_keys(&mut self) -> Vec<String> {
        std::mem::take(&mut self.retired)
    }
}

impl SessionValues for Session {
    fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    fn set(&mut self, key: &str, value: String) {
        self.values.insert(key.to_string(), value);
        self.modified = true;
    }

    fn remove(&mut self, key: &str) -> Option<String> {
        let removed = self.values.remove(key);
        if removed.is_some() {
            self.modified = true;
        }
        removed
    }

    fn flush(&mut self) {
        self.values.clear();
        if let Some(old) = self.key.take() {
            self.retired.push(old);
        }
        self.modified = true;
    }
}

fn generate_key() -> String {
    Uuid::new_v4().simple().to_string()
}
