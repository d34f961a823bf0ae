//! Deterministic resource identifiers
//!
//! Identifiers are derived from the name prefix and the logical path of a
//! resource, so two resolution passes over the same declaration hand out the
//! same identifiers.

use sha2::{Digest, Sha256};

const SUFFIX_LEN: usize = 17;

/// Build an AWS-shaped identifier such as `tgw-attach-0f3a...`
pub fn resource_id(kind: &str, name_prefix: &str, path: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update([0u8]);
    hasher.update(name_prefix.as_bytes());
    for segment in path {
        hasher.update([0u8]);
        hasher.update(segment.as_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    format!("{}-{}", kind, &digest[..SUFFIX_LEN])
}

/// Human readable resource name (e.g., `acme-nat-us-east-1a`)
pub fn resource_name(name_prefix: &str, parts: &[&str]) -> String {
    let mut name = name_prefix.to_string();
    for part in parts {
        name.push('-');
        name.push_str(part);
    }
    name
}
