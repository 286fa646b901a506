//! Scoped overrides of process environment variables.
use std::env;
use std::ffi::OsString;

/// Sets an environment variable and restores its previous state when dropped.
pub(crate) struct ScopedEnv {
    key: String,
    previous: Option<OsString>,
}

impl ScopedEnv {
    pub(crate) fn set(key: &str, value: &str) -> Self {
        let previous = env::var_os(key);
        env::set_var(key, value);
        Self {
            key: key.to_string(),
            previous,
        }
    }
}

impl Drop for ScopedEnv {
    fn drop(&mut self) {
        match self.previous.take() {
            Some(value) => env::set_var(&self.key, value),
            None => env::remove_var(&self.key),
        }
    }
}

/// Newline separated concatenation of the non-empty values of `primary` and `fallback`.
pub(crate) fn merged_search_path(primary: &str, fallback: &str) -> String {
    [primary, fallback]
        .iter()
        .filter_map(|key| env::var(key).ok())
        .filter(|value| !value.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
