//! Per-isolate cache of compiled scripts.
//!
//! Keyed by document unique id and code digest, so two documents with the
//! same text never share an entry and an edited document never hits a stale
//! one. Lookups use `peek`: eviction follows insertion order, not use.

use std::num::NonZeroUsize;

use lru::LruCache;

pub(crate) struct CachedScript {
    pub script: v8::Global<v8::UnboundScript>,
    /// Code cache bytes last accepted or produced for this script.
    pub cache_bytes: Option<Vec<u8>>,
}

pub(crate) struct ScriptCache {
    /// `None` when caching is disabled (capacity 0).
    entries: Option<LruCache<(u64, u64), CachedScript>>,
}

impl ScriptCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: NonZeroUsize::new(capacity).map(LruCache::new),
        }
    }

    pub(crate) fn get(&self, unique_id: u64, digest: u64) -> Option<&CachedScript> {
        self.entries.as_ref()?.peek(&(unique_id, digest))
    }

    pub(crate) fn insert(&mut self, unique_id: u64, digest: u64, entry: CachedScript) {
        if let Some(entries) = self.entries.as_mut() {
            if let Some(((id, _), _)) = entries.push((unique_id, digest), entry) {
                tracing::trace!("Script cache evicted document {}", id);
            }
        }
    }

    pub(crate) fn set_cache_bytes(&mut self, unique_id: u64, digest: u64, bytes: Vec<u8>) {
        if let Some(entry) = self
            .entries
            .as_mut()
            .and_then(|entries| entries.peek_mut(&(unique_id, digest)))
        {
            entry.cache_bytes = Some(bytes);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, |entries| entries.len())
    }

    pub(crate) fn clear(&mut self) {
        if let Some(entries) = self.entries.as_mut() {
            entries.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(scope: &mut v8::PinScope<'_, '_>, code: &str) -> v8::Global<v8::UnboundScript> {
        let code = v8::String::new(scope, code).unwrap();
        let mut source = v8::script_compiler::Source::new(code, None);
        let script = v8::script_compiler::compile_unbound_script(
            scope,
            &mut source,
            v8::script_compiler::CompileOptions::NoCompileOptions,
            v8::script_compiler::NoCacheReason::NoReason,
        )
        .unwrap();
        v8::Global::new(scope, script)
    }

    #[test]
    fn evicts_in_insertion_order() {
        crate::platform::initialize(Default::default());
        let mut isolate = v8::Isolate::new(Default::default());
        let scope = std::pin::pin!(v8::HandleScope::new(&mut isolate));
        let mut scope = scope.init();
        let context = v8::Context::new(&scope, Default::default());
        let scope = &mut v8::ContextScope::new(&mut scope, context);

        let mut cache = ScriptCache::new(2);
        for id in 1..=2 {
            let script = compile(scope, "1");
            cache.insert(id, 7, CachedScript { script, cache_bytes: None });
        }

        // a lookup does not protect the oldest entry
        assert!(cache.get(1, 7).is_some());
        let script = compile(scope, "2");
        cache.insert(3, 7, CachedScript { script, cache_bytes: None });

        assert!(cache.get(1, 7).is_none());
        assert!(cache.get(2, 7).is_some());
        assert!(cache.get(3, 8).is_none());
        assert_eq!(cache.len(), 2);

        cache.set_cache_bytes(3, 7, vec![1, 2, 3]);
        assert_eq!(cache.get(3, 7).and_then(|e| e.cache_bytes.clone()), Some(vec![1, 2, 3]));
        cache.clear();
    }

    #[test]
    fn zero_capacity_disables_caching() {
        let cache = ScriptCache::new(0);
        assert!(cache.get(1, 1).is_none());
        assert_eq!(cache.len(), 0);
    }
}
