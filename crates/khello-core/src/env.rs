//! Environment variable utilities
//!
//! # Usage
//!
//! ```ignore
//! use khello_core::env::{env_get, env_get_bool};
//!
//! let page: usize = env_get("KHELLO_PAGE_SIZE", 4096);
//! let trace: bool = env_get_bool("KHELLO_TRACE_VM", false);
//! ```

use std::str::FromStr;

/// Get environment variable parsed as type T, or return default
///
/// Unset and unparsable values both fall back to `default`.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Get environment variable as boolean
///
/// Accepts: "1", "true", "yes", "on" (case-insensitive) as true.
/// Any other set value is false; unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// `Some(T)` if the variable is set and parses, `None` otherwise.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__KHELLO_TEST_UNSET_12345__", 42);
        assert_eq!(val, 42);
    }

    #[test]
    fn test_env_get_opt_none() {
        let val: Option<usize> = env_get_opt("__KHELLO_TEST_UNSET_12345__");
        assert!(val.is_none());
    }

    #[test]
    fn test_env_get_str_default() {
        let val = env_get_str("__KHELLO_TEST_UNSET_12345__", "khello");
        assert_eq!(val, "khello");
    }

    #[test]
    fn test_env_get_with_set_var() {
        std::env::set_var("__KHELLO_TEST_NUM__", "8192");
        let val: usize = env_get("__KHELLO_TEST_NUM__", 0);
        assert_eq!(val, 8192);
        std::env::remove_var("__KHELLO_TEST_NUM__");
    }

    #[test]
    fn test_env_get_bool_variants() {
        for v in ["1", "true", "TRUE", "yes", "on"] {
            std::env::set_var("__KHELLO_TEST_BOOL__", v);
            assert!(env_get_bool("__KHELLO_TEST_BOOL__", false), "{}", v);
        }
        for v in ["0", "false", "garbage"] {
            std::env::set_var("__KHELLO_TEST_BOOL__", v);
            assert!(!env_get_bool("__KHELLO_TEST_BOOL__", true), "{}", v);
        }
        std::env::remove_var("__KHELLO_TEST_BOOL__");
    }

    #[test]
    fn test_env_get_invalid_parse() {
        std::env::set_var("__KHELLO_TEST_INVALID__", "not_a_number");
        let val: usize = env_get("__KHELLO_TEST_INVALID__", 99);
        assert_eq!(val, 99);
        std::env::remove_var("__KHELLO_TEST_INVALID__");
    }
}
