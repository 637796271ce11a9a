use std::collections::HashMap;

const SERVER_URL: &str = "UPLINK_SERVER_URL";

pub fn get_server_url() -> Option<String> {
    std::env::var(SERVER_URL).ok()
}

const AGENT_TOKEN: &str = "UPLINK_AGENT_TOKEN";

pub fn get_agent_token() -> Option<String> {
    std::env::var(AGENT_TOKEN).ok()
}

const AGENT_ID: &str = "UPLINK_AGENT_ID";

pub fn get_agent_id() -> Option<String> {
    std::env::var(AGENT_ID).ok()
}

const ENV_PREFIX: &str = "env:";

/// Resolve a value that is either a literal or an `env:NAME` reference.
///
/// Returns `None` when the reference points at an unset variable.
pub fn resolve_indirect(value: &str) -> Option<String> {
    match value.strip_prefix(ENV_PREFIX) {
        Some(name) => std::env::var(name.trim()).ok(),
        None => Some(value.to_string()),
    }
}

const MAX_SPAN_SECS: u64 = 10 * 365 * 24 * 3600;

/// Configured seconds as a chrono span, clamped to ten years
pub fn span(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_SPAN_SECS) as i64)
}

/// Locally known secrets, looked up by reference name
#[derive(Debug, Clone, Default)]
pub struct Secrets {
    entries: HashMap<String, String>,
}

impl Secrets {
    pub fn new(entries: HashMap<String, String>) -> Self {
        Self { entries }
    }

    /// Resolve a token reference: `env:NAME` reads the environment, anything
    /// else is looked up by name in the configured secrets.
    pub fn resolve(&self, reference: &str) -> Option<String> {
        if reference.starts_with(ENV_PREFIX) {
            return resolve_indirect(reference);
        }
        self.entries.get(reference).cloned()
    }
}
