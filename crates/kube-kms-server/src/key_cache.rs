use std::sync::atomic::{AtomicU64, Ordering};

use kube_kms_core::{ConfigHash, KeyId};

/// Highest backend key version seen so far for this lineage.
///
/// The version only moves forward, so the KeyId reported to the API server
/// never goes back to an older key after a rotation has been observed.
pub struct KeyVersionCache {
    hash: ConfigHash,
    version: AtomicU64,
}

impl KeyVersionCache {
    pub fn new(hash: ConfigHash) -> Self {
        Self {
            hash,
            version: AtomicU64::new(0),
        }
    }

    pub fn hash(&self) -> &ConfigHash {
        &self.hash
    }

    /// Record a version returned by the backend. Returns the cached maximum.
    pub fn observe(&self, version: u64) -> u64 {
        let previous = self.version.fetch_max(version, Ordering::AcqRel);
        if version > previous {
            if previous == 0 {
                tracing::info!(key_id = %KeyId::new(&self.hash, version), "Key version observed");
            } else {
                tracing::info!(
                    old_key_id = %KeyId::new(&self.hash, previous),
                    new_key_id = %KeyId::new(&self.hash, version),
                    "Key rotation detected"
                );
            }
            version
        } else {
            previous
        }
    }

    /// 0 until the backend has answered once.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn key_id(&self) -> KeyId {
        KeyId::new(&self.hash, self.version())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube_kms_core::types::KeyConfig;
    use std::sync::Arc;

    fn cache() -> KeyVersionCache {
        KeyVersionCache::new(ConfigHash::of(&KeyConfig::local(None)).unwrap())
    }

    #[test]
    fn starts_at_zero() {
        let cache = cache();
        assert_eq!(cache.version(), 0);
        assert!(cache.key_id().as_str().ends_with("-v0"));
    }

    #[test]
    fn never_decreases() {
        let cache = cache();
        assert_eq!(cache.observe(3), 3);
        assert_eq!(cache.observe(2), 3);
        assert_eq!(cache.observe(5), 5);
        assert_eq!(cache.version(), 5);
        assert!(cache.key_id().as_str().ends_with("-v5"));
    }

    #[test]
    fn concurrent_observers_keep_maximum() {
        let cache = Arc::new(cache());
        let handles: Vec<_> = (1..=16u64)
            .map(|v| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || cache.observe(v))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.version(), 16);
    }
}
