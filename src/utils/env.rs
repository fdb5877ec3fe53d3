/// Environment variable prefix for every two-factor setting.
pub const ENV_PREFIX: &str = "TWO_FACTOR_";

/// Read `TWO_FACTOR_{key}`, falling back to the bare `{key}`.
///
/// Empty values are treated as unset so a blank override does not shadow the
/// fallback or the built-in default.
pub fn get_env_with_prefix(key: &str) -> Option<String> {
    let non_empty = |v: String| if v.trim().is_empty() { None } else { Some(v) };

    std::env::var(format!("{ENV_PREFIX}{key}"))
        .ok()
        .and_then(non_empty)
        .or_else(|| std::env::var(key).ok().and_then(non_empty))
}
