//! Cache key derivation for decisions.
//!
//! The key fingerprints the full identity and query context. It must be
//! byte-identical across processes for the same logical request and stay
//! within memcached's 250-byte key limit, which is why the open-ended
//! identity part (token and groups) is folded into a fixed-width hash.

use std::collections::BTreeSet;

use sha2::{Digest, Sha256};

/// Derive the cache key for one decision.
///
/// Namespaces arrive as an ordered set and groups are sorted before hashing,
/// so permuting either in the input cannot change the key.
pub(crate) fn decision_cache_key(
    token: &str,
    subject: &str,
    groups: &[String],
    verb: &str,
    resource: &str,
    resource_name: &str,
    api_group: &str,
    namespaces: &BTreeSet<String>,
    metadata_only: bool,
) -> String {
    let joined = namespaces
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(":");

    [
        verb,
        if metadata_only { "true" } else { "false" },
        api_group,
        resource_name,
        resource,
        &joined,
        &hash_userinfo(token, subject, groups),
    ]
    .join(",")
}

/// Collapse `(token, subject, groups)` into `"<subject>:<sha256-hex>"`.
fn hash_userinfo(token: &str, subject: &str, groups: &[String]) -> String {
    let mut hash = Sha256::new();
    hash.update(token.as_bytes());
    hash.update(subject.as_bytes());

    let mut sorted = groups.to_vec();
    sorted.sort();
    for group in &sorted {
        hash.update(group.as_bytes());
    }

    format!("{subject}:{}", hex::encode(hash.finalize()))
}
