//! Bucket key generation and parsing.

/// Identifies one counter: a rate-limit key plus the index of its time bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    /// The caller-supplied rate-limit key
    pub key: String,
    /// `floor(now_millis / bucket_size_millis)`
    pub index: i64,
}

impl BucketKey {
    /// Create a new bucket key.
    pub fn new(key: &str, index: i64) -> Self {
        Self {
            key: key.to_string(),
            index,
        }
    }

    /// Convert to the identifier handed to a counter store.
    /// Format: "{key}:{index}"
    pub fn to_store_key(&self) -> String {
        format!("{}:{}", self.key, self.index)
    }

    /// Parse a store identifier back into a bucket key.
    pub fn from_store_key(raw: &str) -> Option<Self> {
        // The index is always the last segment, so keys may contain ':'
        let sep = raw.rfind(':')?;
        let index: i64 = raw[sep + 1..].parse().ok()?;
        let key = &raw[..sep];
        if key.is_empty() {
            return None;
        }

        Some(Self {
            key: key.to_string(),
            index,
        })
    }
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.key, self.index)
    }
}
