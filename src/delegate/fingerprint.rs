//! Config fingerprinting
//!
//! A delegate's inputs are summarized as a deterministic string so that the
//! operator can tell whether an existing Pod or ConfigMap was built from the
//! configuration it would hand out now.

use std::collections::BTreeMap;

use base32::Alphabet;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Fingerprint of an empty configuration map.
pub const EMPTY_FINGERPRINT: &str = "empty";

#[derive(Serialize)]
struct ConfigPair<'a> {
    key: &'a str,
    value: &'a str,
}

/// Compute the fingerprint of a delegate configuration.
///
/// The empty map fingerprints to the literal `empty`. Any other map is
/// serialized as a JSON array of `{key, value}` pairs ordered by key (the
/// `BTreeMap` iteration order), hashed with SHA-256, and rendered as
/// `sha256:` followed by the unpadded base32 digest. Two maps with the same
/// entries always produce the same fingerprint.
pub fn config_fingerprint(config: &BTreeMap<String, String>) -> Result<String, serde_json::Error> {
    if config.is_empty() {
        return Ok(EMPTY_FINGERPRINT.to_string());
    }

    let pairs: Vec<ConfigPair> = config
        .iter()
        .map(|(key, value)| ConfigPair { key, value })
        .collect();

    let encoded = serde_json::to_vec(&pairs)?;
    let digest = Sha256::digest(&encoded);
    let hash = base32::encode(Alphabet::Rfc4648 { padding: false }, &digest);

    Ok(format!("sha256:{hash}"))
}
