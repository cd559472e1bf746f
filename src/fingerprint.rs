//! Key fingerprints in the `AB:CD:EF:...` form shown to administrators.

use openssl::error::ErrorStack;
use openssl::hash::{hash, MessageDigest};
use openssl::pkey::{HasPublic, PKeyRef};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyFingerprints {
    pub sha1: String,
    pub md5: String,
}

/// SHA-1 and MD5 digests of `key_der`, each as colon-separated uppercase hex.
pub fn fingerprint(key_der: &[u8]) -> Result<KeyFingerprints, ErrorStack> {
    let sha1 = hash(MessageDigest::sha1(), key_der)?;
    let md5 = hash(MessageDigest::md5(), key_der)?;
    Ok(KeyFingerprints {
        sha1: colon_hex(&sha1),
        md5: colon_hex(&md5),
    })
}

/// Fingerprints of the DER SubjectPublicKeyInfo of `key`.
pub fn key_fingerprint<T: HasPublic>(key: &PKeyRef<T>) -> Result<KeyFingerprints, ErrorStack> {
    fingerprint(&key.public_key_to_der()?)
}

fn colon_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}
