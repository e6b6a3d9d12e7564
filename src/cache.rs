//! Caller-side cache of decompiled artifacts
//!
//! Decompilation itself is a pure function; this cache only avoids
//! repeating it for artifacts the caller has already seen. Cached results
//! are immutable and shared as `Arc<Decompiled>`.

use crate::artifact::{ArtifactError, CodeArtifact};
use crate::error::DecompileResult;
use crate::machine::Decompiled;
use crate::options::DecompileOptions;
use log::debug;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, PoisonError, RwLock};

/// Content-derived identity of an artifact: its protobuf encoding
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactKey(Vec<u8>);

impl ArtifactKey {
    pub fn of(artifact: &CodeArtifact) -> Result<Self, ArtifactError> {
        artifact.to_proto_bytes().map(ArtifactKey)
    }

    /// Key for an artifact already held in encoded form
    pub fn from_encoded(bytes: impl Into<Vec<u8>>) -> Self {
        ArtifactKey(bytes.into())
    }
}

/// Map from a caller-chosen key to shared decompilation results
///
/// Failures are returned to the caller and never stored, so a later call
/// with the same key retries.
pub struct DecompileCache<K> {
    entries: RwLock<HashMap<K, Arc<Decompiled>>>,
    options: DecompileOptions,
}

impl<K: Eq + Hash> Default for DecompileCache<K> {
    fn default() -> Self {
        Self::with_options(DecompileOptions::default())
    }
}

impl<K: Eq + Hash> DecompileCache<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: DecompileOptions) -> Self {
        DecompileCache {
            entries: RwLock::new(HashMap::new()),
            options,
        }
    }

    pub fn options(&self) -> &DecompileOptions {
        &self.options
    }

    pub fn get(&self, key: &K) -> Option<Arc<Decompiled>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).cloned()
    }

    /// Return the cached result for `key`, decompiling `artifact` on a miss
    ///
    /// Two threads missing on the same key may both decompile; the first
    /// insert wins and both receive equal results.
    pub fn get_or_decompile(
        &self,
        key: K,
        artifact: &CodeArtifact,
    ) -> DecompileResult<Arc<Decompiled>> {
        if let Some(hit) = self.get(&key) {
            debug!("decompile cache hit for {}", artifact.name);
            return Ok(hit);
        }
        debug!("decompile cache miss for {}", artifact.name);

        let result = Arc::new(crate::decompile_with(artifact, &self.options)?);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        Ok(Arc::clone(entries.entry(key).or_insert(result)))
    }

    pub fn insert(&self, key: K, decompiled: Decompiled) -> Arc<Decompiled> {
        let decompiled = Arc::new(decompiled);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key, Arc::clone(&decompiled));
        decompiled
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constant_pool::Constant;
    use std::thread;

    fn artifact(code: Vec<u8>) -> CodeArtifact {
        let mut artifact = CodeArtifact::new("<lambda>", code);
        artifact.names = vec!["a".to_string()];
        artifact.constants.add(Constant::None);
        artifact
    }

    #[test]
    fn test_hit_returns_shared_result() {
        let cache = DecompileCache::new();
        let code = artifact(vec![116, 0, 0, 83]);
        let key = ArtifactKey::of(&code).unwrap();

        let first = cache.get_or_decompile(key.clone(), &code).unwrap();
        let second = cache.get_or_decompile(key, &code).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_errors_are_not_cached() {
        let cache: DecompileCache<&str> = DecompileCache::new();
        // BINARY_ADD on an empty stack
        let broken = artifact(vec![23, 83]);

        assert!(cache.get_or_decompile("broken", &broken).is_err());
        assert!(cache.is_empty());
        assert!(cache.get(&"broken").is_none());
    }

    #[test]
    fn test_keys_follow_content() {
        let a = artifact(vec![116, 0, 0, 83]);
        let b = artifact(vec![100, 0, 0, 83]);
        assert_eq!(ArtifactKey::of(&a).unwrap(), ArtifactKey::of(&a.clone()).unwrap());
        assert_ne!(ArtifactKey::of(&a).unwrap(), ArtifactKey::of(&b).unwrap());
        assert_eq!(
            ArtifactKey::of(&a).unwrap(),
            ArtifactKey::from_encoded(a.to_proto_bytes().unwrap())
        );
    }

    #[test]
    fn test_concurrent_readers() {
        let cache = Arc::new(DecompileCache::new());
        let code = artifact(vec![116, 0, 0, 83]);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let code = code.clone();
                thread::spawn(move || cache.get_or_decompile(1u32, &code).unwrap())
            })
            .collect();

        let results: Vec<Arc<Decompiled>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        for result in &results {
            assert_eq!(result.root, results[0].root);
        }
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
    }
}
