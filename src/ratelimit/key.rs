//! Bucket key generation and identity handling.

/// Separator between namespace and identity in store keys.
pub const KEY_SEPARATOR: &str = "___";

/// Identity used for callers that cannot name themselves.
pub const ANONYMOUS: &str = "Anonymous";

/// A key that uniquely identifies one identity's bucket in a shared store.
///
/// The namespace keeps independently configured limiters that share one
/// store from reading each other's history.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    /// The limiter namespace
    pub namespace: String,
    /// The identity the bucket meters
    pub identity: String,
}

impl BucketKey {
    /// Create a new bucket key.
    pub fn new(namespace: &str, identity: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            identity: identity.to_string(),
        }
    }

    /// Convert to the store key string.
    /// Format: "{namespace}___{identity}"
    pub fn to_store_key(&self) -> String {
        format!("{}{}{}", self.namespace, KEY_SEPARATOR, self.identity)
    }

    /// Parse from a store key string.
    ///
    /// Splits on the first separator, so identities may themselves contain it.
    pub fn from_store_key(key: &str) -> Option<Self> {
        let (namespace, identity) = key.split_once(KEY_SEPARATOR)?;
        if namespace.is_empty() {
            return None;
        }

        Some(Self::new(namespace, identity))
    }
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_store_key())
    }
}

/// Resolve an optional caller name, falling back to [`ANONYMOUS`].
pub fn identity_or_anonymous(identity: Option<&str>) -> &str {
    match identity {
        Some(id) if !id.is_empty() => id,
        _ => ANONYMOUS,
    }
}

/// Sort and de-duplicate identities.
///
/// Every caller touching an overlapping identity set resolves buckets in the
/// same order.
pub fn normalize_identities<I, S>(identities: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut ids: Vec<String> = identities
        .into_iter()
        .map(|id| id.as_ref().to_string())
        .collect();
    ids.sort();
    ids.dedup();
    ids
}
