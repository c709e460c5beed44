use std::fmt;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::params::Vary;

/// The primary key of a stored entry: the request id plus a digest of the
/// canonical form of the entry's vary mapping.
///
/// The id stays around in human-readable form for diagnostics; equality and
/// hashing go through the digest so the key is cheap to compare and safe to
/// use in hash maps regardless of how large the vary mapping is.
#[derive(Debug, Clone, Eq)]
pub struct EntryKey {
    id: String,
    hash: [u8; 32],
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:02x}{:02x}", self.id, self.hash[0], self.hash[1])
    }
}

impl PartialEq for EntryKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.hash == other.hash
    }
}

impl std::hash::Hash for EntryKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.hash.hash(state);
    }
}

impl EntryKey {
    pub fn new(id: &str, vary: &Vary) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(canonical_json(vary).as_bytes());
        let hash = hasher.finalize().into();

        EntryKey {
            id: id.to_owned(),
            hash,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Serializes a value into its canonical JSON form.
///
/// Canonical here means deterministic under map-key reordering, which holds
/// because every map in this crate is a `BTreeMap`. Used for entry keys and
/// for the request collapser's coalescing keys.
pub fn canonical_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|err| {
        // Only reachable with a content type whose `Serialize` impl fails;
        // a constant key degrades collapsing but stays correct.
        tracing::error!(error = &err as &dyn std::error::Error, "failed to serialize collapse key");
        String::from("!unserializable")
    })
}

/// A canonical digest of any serializable value, hex-encoded.
pub fn canonical_digest<T: Serialize>(value: &T) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(value).as_bytes());
    let hash = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in hash {
        use fmt::Write;
        write!(out, "{byte:02x}").expect("writing to a String cannot fail");
    }
    out
}
