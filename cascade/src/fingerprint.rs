//! Request fingerprints.
//!
//! Two keys are derived from a [`RequestDescriptor`]:
//!
//! - [`CacheKey`]: SHA-256 over method, url, allow-listed headers and body.
//!   Long-lived, so it uses a collision-resistant digest.
//! - [`DedupKey`]: 64-bit FNV-1a over method, url and body only. It only has
//!   to be unique among requests in flight at the same moment.
//!
//! Both are pure functions of the descriptor and stable across restarts.
//! Every field is length-prefixed so `("ab", "c")` and `("a", "bc")` differ.

use fnv::FnvHasher;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::Hasher;

use crate::types::RequestDescriptor;

/// Strong key for the response cache (hex SHA-256).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Loose key for in-flight coalescing. Headers are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DedupKey(u64);

impl DedupKey {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Derives cache and dedup keys with a fixed header allow-list.
#[derive(Debug, Clone)]
pub struct Fingerprinter {
    allowed_headers: BTreeSet<String>,
}

impl Fingerprinter {
    pub fn new<I, S>(allowed_headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed_headers: allowed_headers
                .into_iter()
                .map(|h| h.as_ref().trim().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn cache_key(&self, request: &RequestDescriptor) -> CacheKey {
        let mut hasher = Sha256::new();
        let mut field = |bytes: &[u8]| {
            hasher.update((bytes.len() as u64).to_be_bytes());
            hasher.update(bytes);
        };
        field(request.method().to_ascii_uppercase().as_bytes());
        field(request.url().to_lowercase().as_bytes());
        // Sorted by lowercased name, so neither order nor casing matters.
        let headers: BTreeMap<String, &str> = request
            .headers()
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value.as_str()))
            .filter(|(name, _)| self.allowed_headers.contains(name))
            .collect();
        for (name, value) in &headers {
            field(name.as_bytes());
            field(value.as_bytes());
        }
        field(b"body");
        field(request.body());
        CacheKey(hex::encode(hasher.finalize()))
    }

    pub fn dedup_key(&self, request: &RequestDescriptor) -> DedupKey {
        let mut hasher = FnvHasher::default();
        for bytes in [
            request.method().to_ascii_uppercase().as_bytes(),
            request.url().to_lowercase().as_bytes(),
            request.body(),
        ] {
            hasher.write_u64(bytes.len() as u64);
            hasher.write(bytes);
        }
        DedupKey(hasher.finish())
    }
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new(crate::config::CacheConfig::default().allowed_headers)
    }
}
