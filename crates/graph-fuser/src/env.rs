use std::env;
use std::sync::OnceLock;

static FUSER_ENABLED: OnceLock<Option<bool>> = OnceLock::new();
static FUSER_MAX_MULTI_CONSUMERS: OnceLock<Option<u32>> = OnceLock::new();
static FUSER_MODULE: OnceLock<Option<String>> = OnceLock::new();
static FUSER_SERIALIZE_CALLS: OnceLock<Option<bool>> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn read_var(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
        _ => None,
    }
}

pub(crate) fn fuser_enabled() -> Option<bool> {
    *FUSER_ENABLED.get_or_init(|| read_var("GRAPH_FUSER_ENABLED").map(|v| parse_bool(&v)))
}

pub(crate) fn fuser_max_multi_consumers() -> Option<u32> {
    *FUSER_MAX_MULTI_CONSUMERS.get_or_init(|| {
        read_var("GRAPH_FUSER_MAX_MULTI_CONSUMERS").and_then(|v| v.parse().ok())
    })
}

pub(crate) fn fuser_module_name() -> Option<&'static str> {
    FUSER_MODULE
        .get_or_init(|| read_var("GRAPH_FUSER_MODULE"))
        .as_deref()
}

pub(crate) fn fuser_serialize_calls() -> Option<bool> {
    *FUSER_SERIALIZE_CALLS
        .get_or_init(|| read_var("GRAPH_FUSER_SERIALIZE_CALLS").map(|v| parse_bool(&v)))
}
