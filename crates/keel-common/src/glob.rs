//! Glob matching for project scoping rules
//!
//! Project rules (source repositories, destinations, source namespaces,
//! sync-window selectors) are lists of shell-style globs. A pattern that
//! fails to compile never matches.

use globset::Glob;

/// Match a single glob pattern against a value.
pub fn matches(pattern: &str, value: &str) -> bool {
    if pattern == "*" || pattern == value {
        return true;
    }
    match Glob::new(pattern) {
        Ok(glob) => glob.compile_matcher().is_match(value),
        Err(_) => false,
    }
}

/// True when any pattern in the list matches the value.
pub fn any_matches<S: AsRef<str>>(patterns: &[S], value: &str) -> bool {
    patterns.iter().any(|p| matches(p.as_ref(), value))
}

/// Evaluate an allow list that may contain `!`-prefixed deny patterns.
///
/// The value is permitted when at least one positive pattern matches and
/// no negated pattern matches it.
pub fn permitted_by<S: AsRef<str>>(patterns: &[S], value: &str) -> bool {
    let mut allowed = false;
    for pattern in patterns {
        let pattern = pattern.as_ref();
        if let Some(denied) = pattern.strip_prefix('!') {
            if matches(denied, value) {
                return false;
            }
        } else if matches(pattern, value) {
            allowed = true;
        }
    }
    allowed
}
