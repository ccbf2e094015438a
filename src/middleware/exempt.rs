use regex::Regex;
use tracing::warn;

/// Paths that bypass the login and inactivity checks.
#[derive(Debug, Clone)]
pub struct ExemptPaths {
    patterns: Vec<Regex>,
}

impl ExemptPaths {
    /// Compiles `patterns`, each anchored at the start of the path. Patterns
    /// that fail to compile are skipped. The login route is always exempt.
    pub fn new<S: AsRef<str>>(patterns: &[S], login_url: &str) -> Self {
        let mut compiled: Vec<Regex> = patterns
            .iter()
            .filter_map(|pattern| {
                let pattern = pattern.as_ref();
                match Regex::new(&format!("^(?:{pattern})")) {
                    Ok(regex) => Some(regex),
                    Err(err) => {
                        warn!("ignoring invalid exempt url pattern {pattern:?}: {err}");
                        None
                    }
                }
            })
            .collect();

        let login = login_url.trim_start_matches('/');
        if let Ok(regex) = Regex::new(&format!("^{}/?$", regex::escape(login))) {
            compiled.push(regex);
        }

        Self { patterns: compiled }
    }

    pub fn is_exempt(&self, path: &str) -> bool {
        let path = path.strip_prefix('/').unwrap_or(path);
        self.patterns.iter().any(|pattern| pattern.is_match(path))
    }
}
