//! Tag → handler routing, shared by the connection engine (message types)
//! and the event bus (topics).

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

/// Maps a routing key to exactly one handler.
///
/// Registration takes `&mut self` and happens before the registry is
/// shared; dispatch takes `&self` and is lock-free. Re-registering a key
/// replaces the previous handler.
pub struct HandlerRegistry<K, H: ?Sized> {
    handlers: HashMap<K, Arc<H>>,
}

impl<K, H: ?Sized> Default for HandlerRegistry<K, H> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash, H: ?Sized> HandlerRegistry<K, H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `key`. Returns the handler it replaced.
    pub fn register(&mut self, key: impl Into<K>, handler: Arc<H>) -> Option<Arc<H>> {
        self.handlers.insert(key.into(), handler)
    }

    pub fn get<Q>(&self, key: &Q) -> Option<Arc<H>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.handlers.get(key).cloned()
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.handlers.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.handlers.keys()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<K, H: ?Sized> std::fmt::Debug for HandlerRegistry<K, H>
where
    K: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}
