//! Environment merging for child processes.
//!
//! Windows treats variable names case-insensitively (`Path` and `PATH` are the
//! same variable), POSIX does not. Overrides therefore replace any base entry
//! whose name matches under the platform's rules, and the override's spelling
//! wins.

use std::collections::BTreeMap;

/// A process environment keyed by variable name.
pub type Environment = BTreeMap<String, String>;

/// How variable names are compared when merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameMatching {
    /// Names match only when byte-identical (POSIX).
    Exact,
    /// Names match ignoring ASCII case (Windows).
    IgnoreCase,
}

impl NameMatching {
    /// The rule used by the host platform.
    pub fn host() -> Self {
        if cfg!(windows) {
            Self::IgnoreCase
        } else {
            Self::Exact
        }
    }

    fn matches(self, a: &str, b: &str) -> bool {
        match self {
            Self::Exact => a == b,
            Self::IgnoreCase => a.eq_ignore_ascii_case(b),
        }
    }
}

/// Returns `base` with every entry of `overrides` applied on top.
///
/// Neither input is modified.
pub fn merge_environment(
    base: &Environment,
    overrides: &Environment,
    matching: NameMatching,
) -> Environment {
    let mut merged = base.clone();
    for (name, value) in overrides {
        merged.retain(|existing, _| !matching.matches(existing, name));
        merged.insert(name.clone(), value.clone());
    }
    merged
}

/// Snapshot of the current process environment.
///
/// Variables whose name or value is not valid unicode are skipped.
pub fn current_environment() -> Environment {
    std::env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Environment {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn exact_merge_keeps_differently_cased_names() {
        let base = env(&[("PATH", "/usr/bin"), ("HOME", "/home/u")]);
        let overrides = env(&[("Path", "/opt/bin")]);

        let merged = merge_environment(&base, &overrides, NameMatching::Exact);
        assert_eq!(merged.get("PATH").map(String::as_str), Some("/usr/bin"));
        assert_eq!(merged.get("Path").map(String::as_str), Some("/opt/bin"));
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn ignore_case_merge_replaces_existing_spelling() {
        let base = env(&[("Path", "C:\\Windows"), ("TEMP", "C:\\Temp")]);
        let overrides = env(&[("PATH", "C:\\Tools")]);

        let merged = merge_environment(&base, &overrides, NameMatching::IgnoreCase);
        assert!(!merged.contains_key("Path"));
        assert_eq!(merged.get("PATH").map(String::as_str), Some("C:\\Tools"));
        assert_eq!(merged.get("TEMP").map(String::as_str), Some("C:\\Temp"));
    }

    #[test]
    fn merge_leaves_inputs_untouched() {
        let base = env(&[("A", "1")]);
        let overrides = env(&[("A", "2"), ("B", "3")]);

        let merged = merge_environment(&base, &overrides, NameMatching::Exact);
        assert_eq!(base, env(&[("A", "1")]));
        assert_eq!(overrides.len(), 2);
        assert_eq!(merged, env(&[("A", "2"), ("B", "3")]));
    }

    #[test]
    fn empty_overrides_return_base() {
        let base = env(&[("A", "1")]);
        let merged = merge_environment(&base, &Environment::new(), NameMatching::host());
        assert_eq!(merged, base);
    }
}
