//! Root-of-trust bootstrap set.
//!
//! Managers that validate signed artifacts consume a fixed, build-embedded
//! set of trust documents plus whatever was injected at startup. The
//! documents themselves are opaque here: decoding and cryptographic
//! verification belong to the trust subsystem, not the reconciliation core.
//!
//! The store is an explicit instance handed to the overlord at startup, so
//! tests can run multiple independent engines with different trust sets.

use serde::{Deserialize, Serialize};

/// The build-embedded account document for the default authority.
const BUILTIN_AUTHORITY_ACCOUNT: &str = include_str!("builtin/authority-account.txt");

/// The build-embedded signing-key document for the default authority.
const BUILTIN_AUTHORITY_KEY: &str = include_str!("builtin/authority-key.txt");

/// The build-embedded fallback policy document.
const BUILTIN_FALLBACK_POLICY: &str = include_str!("builtin/fallback-policy.txt");

/// One opaque, externally-verified trust document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustAnchor {
    /// Issuing authority identifier.
    pub authority: String,

    /// Document kind tag, e.g. `account` or `account-key`.
    pub kind: String,

    /// The encoded document, consumed opaquely.
    pub body: String,
}

impl TrustAnchor {
    /// Creates an anchor from its parts.
    pub fn new(
        authority: impl Into<String>,
        kind: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            authority: authority.into(),
            kind: kind.into(),
            body: body.into(),
        }
    }
}

/// The ordered set of trust anchors supplied to the core at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustStore {
    anchors: Vec<TrustAnchor>,
    fallback_policy: TrustAnchor,
}

impl TrustStore {
    /// The build-embedded trust set: the default authority's account and
    /// signing key, plus the fallback policy document.
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            anchors: vec![
                TrustAnchor::new("steward", "account", BUILTIN_AUTHORITY_ACCOUNT),
                TrustAnchor::new("steward", "account-key", BUILTIN_AUTHORITY_KEY),
            ],
            fallback_policy: TrustAnchor::new("steward", "policy", BUILTIN_FALLBACK_POLICY),
        }
    }

    /// Appends additional anchors after the built-in ones, preserving
    /// order.
    #[must_use]
    pub fn with_extra(mut self, extra: impl IntoIterator<Item = TrustAnchor>) -> Self {
        self.anchors.extend(extra);
        self
    }

    /// Replaces the single fallback policy document.
    pub fn override_fallback_policy(&mut self, anchor: TrustAnchor) {
        self.fallback_policy = anchor;
    }

    /// The anchors, built-in first, in injection order.
    #[must_use]
    pub fn anchors(&self) -> &[TrustAnchor] {
        &self.anchors
    }

    /// The current fallback policy document.
    #[must_use]
    pub const fn fallback_policy(&self) -> &TrustAnchor {
        &self.fallback_policy
    }
}

impl Default for TrustStore {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_set_is_populated() {
        let store = TrustStore::builtin();
        assert_eq!(store.anchors().len(), 2);
        assert_eq!(store.anchors()[0].kind, "account");
        assert_eq!(store.anchors()[1].kind, "account-key");
        assert!(!store.fallback_policy().body.is_empty());
    }

    #[test]
    fn test_extra_anchors_append_in_order() {
        let store = TrustStore::builtin().with_extra([
            TrustAnchor::new("acme", "account", "acme-account"),
            TrustAnchor::new("acme", "account-key", "acme-key"),
        ]);

        let authorities: Vec<&str> = store
            .anchors()
            .iter()
            .map(|a| a.authority.as_str())
            .collect();
        assert_eq!(authorities, vec!["steward", "steward", "acme", "acme"]);
    }

    #[test]
    fn test_fallback_policy_override() {
        let mut store = TrustStore::builtin();
        let replacement = TrustAnchor::new("acme", "policy", "acme-policy");
        store.override_fallback_policy(replacement.clone());
        assert_eq!(*store.fallback_policy(), replacement);
        // Built-in anchors are untouched by the override.
        assert_eq!(store.anchors().len(), 2);
    }
}
