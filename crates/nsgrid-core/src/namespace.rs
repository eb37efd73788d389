//! Namespace naming rules.
//!
//! A namespace doubles as a DNS label (`{namespace}.{base_domain}`) and as a
//! directory name under the data root, so it follows DNS-label syntax.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// The privileged namespace served by the shared, pre-existing cluster.
pub const DEFAULT_NAMESPACE: &str = "default";

static NAMESPACE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$").expect("namespace regex is valid")
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NamespaceError {
    #[error("namespace must not be empty")]
    Empty,

    #[error("namespace {0:?} must be 1-63 lowercase alphanumerics or '-', not starting or ending with '-'")]
    Malformed(String),
}

/// Check that `namespace` is a valid tenant identifier.
pub fn validate_namespace(namespace: &str) -> Result<(), NamespaceError> {
    if namespace.is_empty() {
        return Err(NamespaceError::Empty);
    }
    if !NAMESPACE_RE.is_match(namespace) {
        return Err(NamespaceError::Malformed(namespace.to_string()));
    }
    Ok(())
}

pub fn is_default_namespace(namespace: &str) -> bool {
    namespace == DEFAULT_NAMESPACE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_dns_labels() {
        for ns in ["shop-42", "a", "default", "x1-y2-z3", &"a".repeat(63)] {
            assert!(validate_namespace(ns).is_ok(), "{ns} should be valid");
        }
    }

    #[test]
    fn rejects_path_and_dns_hazards() {
        assert_eq!(validate_namespace(""), Err(NamespaceError::Empty));
        for ns in ["../etc", "Shop", "-lead", "trail-", "a_b", "a.b", &"a".repeat(64)] {
            assert!(
                matches!(validate_namespace(ns), Err(NamespaceError::Malformed(_))),
                "{ns} should be rejected"
            );
        }
    }

    #[test]
    fn default_namespace_is_recognised() {
        assert!(is_default_namespace("default"));
        assert!(!is_default_namespace("default-2"));
    }
}
