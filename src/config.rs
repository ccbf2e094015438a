use std::{env, net::SocketAddr};

use chrono::Duration;

use crate::error::AppError;

pub const DEFAULT_INACTIVITY_TIMEOUT_SECS: i64 = 10_800;
pub const DEFAULT_SESSION_AGE_SECS: i64 = 1_209_600;
pub const DEFAULT_SESSION_SWEEP_SECS: i64 = 3_600;
/// Upper bound for every duration setting: ten years.
pub const MAX_DURATION_SECS: i64 = 315_360_000;

const DEFAULT_EXEMPT_URLS: &[&str] = &[
    // landing page
    "$",
    "static/",
    "media/",
    r"login/?$",
    r"health/?$",
    r"favicon\.ico$",
];

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub listen_addr: SocketAddr,
    pub cookie_secret: String,
    pub session: SessionConfig,
    pub bootstrap_admin: Option<AdminAccount>,
}

/// Everything the session chain needs; handed to each stage when it is built.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Regex path prefixes (leading slash stripped) skipped by the login and
    /// inactivity checks.
    pub login_exempt_urls: Vec<String>,
    pub inactivity_timeout_secs: i64,
    pub login_url: String,
    /// Absolute lifetime of a stored session, refreshed on every save.
    pub session_age_secs: i64,
    /// How often expired sessions are purged from the store.
    pub sweep_interval_secs: i64,
    pub backend: SessionBackend,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            login_exempt_urls: DEFAULT_EXEMPT_URLS.iter().map(|s| s.to_string()).collect(),
            inactivity_timeout_secs: DEFAULT_INACTIVITY_TIMEOUT_SECS,
            login_url: "/login".into(),
            session_age_secs: DEFAULT_SESSION_AGE_SECS,
            sweep_interval_secs: DEFAULT_SESSION_SWEEP_SECS,
            backend: SessionBackend::Database,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionBackend {
    #[default]
    Database,
    Memory,
}

#[derive(Debug, Clone)]
pub struct AdminAccount {
    pub username: String,
    pub email: String,
    pub password: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://backoffice.db".to_string());
        let listen_addr: SocketAddr = env::var("APP_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:3000".to_string())
            .parse()
            .map_err(|err| AppError::Config(format!("invalid APP_LISTEN_ADDR: {err}")))?;

        let cookie_secret = env::var("COOKIE_SECRET")
            .unwrap_or_else(|_| "change-me-backoffice-cookie-secret".to_string());

        let bootstrap_admin = match (
            env::var("ADMIN_USERNAME"),
            env::var("ADMIN_EMAIL"),
            env::var("ADMIN_PASSWORD"),
        ) {
            (Ok(username), Ok(email), Ok(password)) => Some(AdminAccount {
                username,
                email,
                password,
            }),
            _ => None,
        };

        Ok(Self {
            database_url,
            listen_addr,
            cookie_secret,
            session: SessionConfig::from_env()?,
            bootstrap_admin,
        })
    }
}

impl SessionConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let defaults = Self::default();

        let login_exempt_urls = match env::var("LOGIN_EXEMPT_URLS") {
            Ok(raw) => parse_url_list(&raw)?,
            Err(_) => defaults.login_exempt_urls,
        };

        let inactivity_timeout_secs = env_seconds(
            "INACTIVITY_TIMEOUT_SECONDS",
            defaults.inactivity_timeout_secs,
        )?;
        let session_age_secs = env_seconds("SESSION_AGE_SECONDS", defaults.session_age_secs)?;
        let sweep_interval_secs =
            env_seconds("SESSION_SWEEP_SECONDS", defaults.sweep_interval_secs)?;

        let login_url = match env::var("LOGIN_URL") {
            Ok(raw) => parse_login_url(&raw)?,
            Err(_) => defaults.login_url,
        };

        let backend = match env::var("SESSION_BACKEND").as_deref() {
            Err(_) | Ok("database") => SessionBackend::Database,
            Ok("memory") => SessionBackend::Memory,
            Ok(other) => {
                return Err(AppError::Config(format!(
                    "invalid SESSION_BACKEND: {other} (expected database or memory)"
                )))
            }
        };

        Ok(Self {
            login_exempt_urls,
            inactivity_timeout_secs,
            login_url,
            session_age_secs,
            sweep_interval_secs,
            backend,
        })
    }

    pub fn inactivity_timeout(&self) -> Duration {
        bounded_duration(self.inactivity_timeout_secs)
    }

    pub fn session_age(&self) -> Duration {
        bounded_duration(self.session_age_secs)
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs.clamp(1, MAX_DURATION_SECS) as u64)
    }
}

/// Configs built in code skip `from_env`, so out-of-range values are clamped here.
fn bounded_duration(secs: i64) -> Duration {
    Duration::seconds(secs.clamp(1, MAX_DURATION_SECS))
}

fn env_seconds(name: &str, default: i64) -> Result<i64, AppError> {
    match env::var(name) {
        Ok(raw) => parse_seconds(name, &raw),
        Err(_) => Ok(default),
    }
}

/// A positive number of seconds, at most [`MAX_DURATION_SECS`].
pub fn parse_seconds(name: &str, raw: &str) -> Result<i64, AppError> {
    let secs: i64 = raw
        .trim()
        .parse()
        .map_err(|err| AppError::Config(format!("invalid {name}: {err}")))?;
    if !(1..=MAX_DURATION_SECS).contains(&secs) {
        return Err(AppError::Config(format!(
            "invalid {name}: {secs} is outside 1..={MAX_DURATION_SECS} seconds"
        )));
    }
    Ok(secs)
}

/// The login route is mounted at this path, so it has to be an absolute path.
pub fn parse_login_url(raw: &str) -> Result<String, AppError> {
    let url = raw.trim();
    if !url.starts_with('/') || url.starts_with("//") || url.contains(['?', '#']) || url.len() < 2
    {
        return Err(AppError::Config(format!(
            "invalid LOGIN_URL: {url:?} (expected a path such as /login)"
        )));
    }
    Ok(url.trim_end_matches('/').to_string())
}

/// Accepts a JSON array of strings or a comma-separated list.
pub fn parse_url_list(raw: &str) -> Result<Vec<String>, AppError> {
    let trimmed = raw.trim();
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed)
            .map_err(|err| AppError::Config(format!("invalid LOGIN_EXEMPT_URLS: {err}")));
    }
    Ok(trimmed
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_list_accepts_json_arrays() {
        let urls = parse_url_list(r#"["static/", "api/v\\d{1,2}/"]"#).unwrap();
        assert_eq!(urls, vec!["static/".to_string(), r"api/v\d{1,2}/".to_string()]);
    }

    #[test]
    fn url_list_accepts_comma_separated_values() {
        let urls = parse_url_list(" static/ , media/,,login/?$ ").unwrap();
        assert_eq!(urls, vec!["static/", "media/", "login/?$"]);
    }

    #[test]
    fn url_list_rejects_broken_json() {
        assert!(matches!(
            parse_url_list("[\"static/\""),
            Err(AppError::Config(_))
        ));
    }

    #[test]
    fn default_timeout_is_three_hours() {
        assert_eq!(SessionConfig::default().inactivity_timeout_secs, 3 * 60 * 60);
    }

    #[test]
    fn seconds_must_be_positive_and_bounded() {
        assert_eq!(parse_seconds("SESSION_AGE_SECONDS", " 600 ").unwrap(), 600);
        for raw in ["0", "-3600", "1000000000000000", "soon"] {
            assert!(
                matches!(parse_seconds("SESSION_AGE_SECONDS", raw), Err(AppError::Config(_))),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn durations_built_in_code_are_clamped() {
        let config = SessionConfig {
            inactivity_timeout_secs: -5,
            session_age_secs: i64::MAX,
            ..SessionConfig::default()
        };
        assert_eq!(config.inactivity_timeout(), Duration::seconds(1));
        assert_eq!(config.session_age(), Duration::seconds(MAX_DURATION_SECS));
        assert_eq!(
            SessionConfig {
                sweep_interval_secs: 0,
                ..SessionConfig::default()
            }
            .sweep_interval(),
            std::time::Duration::from_secs(1)
        );
    }

    #[test]
    fn login_url_must_be_a_local_path() {
        assert_eq!(parse_login_url("/signin/").unwrap(), "/signin");
        assert_eq!(parse_login_url(" /staff/login ").unwrap(), "/staff/login");
        for raw in ["signin", "/", "//evil.example", "/login?x=1", ""] {
            assert!(parse_login_url(raw).is_err(), "{raw:?} should be rejected");
        }
    }
}
