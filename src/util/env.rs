//! Environment helpers: centralized dotenv loading and ergonomic getters.
//! Call `init_env()` once early in each binary (or rely on lazy Once).
use std::str::FromStr;
use std::sync::Once;
use tracing::warn;

static INIT: Once = Once::new();

/// Load .env exactly once. Safe to call many times.
pub fn init_env() {
    INIT.call_once(|| {
        if dotenv::dotenv().is_err() {
            // Fallback to the crate root so `cargo run` from a subdirectory still works.
            let candidate = format!("{}/.env", env!("CARGO_MANIFEST_DIR"));
            let _ = dotenv::from_filename(candidate);
        }
    });
}

/// Get optional env var (None if unset or empty).
pub fn env_opt(key: &str) -> Option<String> {
    init_env();
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

/// Get parsed value with default fallback.
pub fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr + Clone,
{
    env_parse_opt(key).unwrap_or(default)
}

/// Optional parsed value. A present but unparsable value is logged and ignored.
pub fn env_parse_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    let raw = env_opt(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(target = "env", key, value = %redact_value(key, &raw), "ignoring unparsable env value");
            None
        }
    }
}

/// Tri-state boolean: Some(true) for 1/true/on/yes, Some(false) for 0/false/off/no,
/// None when unset or unrecognised.
pub fn env_flag_opt(key: &str) -> Option<bool> {
    let raw = env_opt(key)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => {
            warn!(target = "env", key, "ignoring unrecognised boolean env value");
            None
        }
    }
}

/// Boolean flag; accepts 1/true/on/yes (case-insensitive) as true.
pub fn env_flag(key: &str, default: bool) -> bool {
    env_flag_opt(key).unwrap_or(default)
}

/// Mask credentials before a value reaches the logs. Proxy pool URLs commonly
/// carry an API key in the query string or userinfo section.
pub fn redact_value(key: &str, val: &str) -> String {
    let k = key.to_ascii_uppercase();
    if k.contains("PASSWORD") || k.contains("SECRET") || k.contains("KEY") || k.contains("TOKEN") {
        return "***".to_string();
    }

    let val_trim = val.trim();
    if k.contains("URL") {
        let without_query = val_trim.split('?').next().unwrap_or(val_trim);
        if let Some(proto) = without_query.find("//") {
            let rest = &without_query[proto + 2..];
            if let Some(at) = rest.find('@') {
                return format!("{}***@{}", &without_query[..proto + 2], &rest[at + 1..]);
            }
        }
        if without_query.len() != val_trim.len() {
            return format!("{without_query}?***");
        }
    }

    val_trim.to_string()
}
