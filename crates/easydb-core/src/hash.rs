//! Document fingerprints
//!
//! A fingerprint is a cheap digest of a document's serialized form. It is
//! used as an optimistic-concurrency token: a patch carries the fingerprint
//! of the document it was computed against, and the server rejects the patch
//! when its own fingerprint differs.
//!
//! Not suitable for security purposes. Collisions are possible and surface as
//! false "not stale" matches.

use serde_json::Value;

/// Fingerprint of a serialized document
pub type Fingerprint = u64;

/// Prime modulus (2^31 - 1)
const MODULUS: u64 = (1 << 31) - 1;

/// Polynomial base
const BASE: u64 = 487;

/// Fingerprint a JSON value
///
/// Objects serialize with sorted keys, so two documents with the same content
/// always share a fingerprint regardless of how they were built. A bare string
/// value is hashed as its raw contents rather than its quoted JSON form.
pub fn fingerprint(value: &Value) -> Fingerprint {
    match value {
        Value::String(s) => fingerprint_str(s),
        other => fingerprint_str(&other.to_string()),
    }
}

/// Fingerprint an already serialized document
///
/// Rolling polynomial hash over the UTF-16 code units of `s`, with the length
/// folded in as a final term.
pub fn fingerprint_str(s: &str) -> Fingerprint {
    let mut result = 0;
    let mut pow = 1;
    let mut len = 0;

    for unit in s.encode_utf16() {
        result = (result + u64::from(unit) * pow) % MODULUS;
        pow = pow * BASE % MODULUS;
        len += 1;
    }

    (result + len % MODULUS * pow) % MODULUS
}
