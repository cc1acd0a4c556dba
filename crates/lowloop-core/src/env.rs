//! Environment knobs.
//!
//! Every engine setting can be overridden by a `LOWLOOP_*` variable; these
//! helpers do the parsing and fall back to the compiled default on absence
//! or parse failure.

use std::str::FromStr;

/// Prefix shared by every engine variable.
pub const ENV_PREFIX: &str = "LOWLOOP_";

/// Parse `key` as `T`, or return `default`.
#[inline]
pub fn env_get<T: FromStr>(key: &str, default: T) -> T {
    env_get_opt(key).unwrap_or(default)
}

/// `1/true/yes/on` are true, anything else set is false, unset is `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[inline]
pub fn env_get_opt<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[inline]
pub fn env_is_set(key: &str) -> bool {
    std::env::var_os(key).is_some()
}

/// `LOWLOOP_<name>` parsed as `T`.
#[inline]
pub fn knob<T: FromStr>(name: &str, default: T) -> T {
    env_get(&format!("{}{}", ENV_PREFIX, name), default)
}

/// `LOWLOOP_<name>` as a flag.
#[inline]
pub fn knob_flag(name: &str, default: bool) -> bool {
    env_get_bool(&format!("{}{}", ENV_PREFIX, name), default)
}
