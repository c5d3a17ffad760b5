use std::env;

pub(crate) const AUTOBATCH_VAR: &str = "AUTOBATCH";
pub(crate) const MAX_BATCH_VAR: &str = "AUTOBATCH_MAX_BATCH";
pub(crate) const PLAN_CACHE_VAR: &str = "AUTOBATCH_PLAN_CACHE";

/// Reads a variable, treating unset and blank values alike.
pub(crate) fn read(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
        _ => None,
    }
}

pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    let normalized = value.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
