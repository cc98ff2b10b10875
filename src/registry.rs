//! Handle registry
//!
//! Maps opaque integer handles to live objects so they can be referenced
//! from the other side of the C boundary. Handles start at 1 and are never
//! reused within a process; 0 and negative values are never valid.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Thread-safe handle table for one object type
pub struct HandleRegistry<T> {
    inner: RwLock<Inner<T>>,
}

struct Inner<T> {
    next: i64,
    objects: HashMap<i64, Arc<T>>,
}

impl<T> HandleRegistry<T> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                next: 0,
                objects: HashMap::new(),
            }),
        }
    }

    // A panic while holding the lock cannot leave the map half-updated
    fn read(&self) -> RwLockReadGuard<'_, Inner<T>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner<T>> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Store an object and return its new handle
    pub fn add(&self, object: T) -> i64 {
        let mut inner = self.write();
        inner.next += 1;
        let handle = inner.next;
        inner.objects.insert(handle, Arc::new(object));
        handle
    }

    /// Look up an object
    pub fn get(&self, handle: i64) -> Option<Arc<T>> {
        self.read().objects.get(&handle).cloned()
    }

    /// Remove an object, returning it if the handle was live
    pub fn remove(&self, handle: i64) -> Option<Arc<T>> {
        self.write().objects.remove(&handle)
    }

    /// Number of live handles
    pub fn len(&self) -> usize {
        self.read().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for HandleRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_get_remove() {
        let registry = HandleRegistry::new();
        let a = registry.add("first".to_string());
        let b = registry.add("second".to_string());
        assert_eq!((a, b), (1, 2));
        assert_eq!(registry.get(a).as_deref().map(String::as_str), Some("first"));

        assert!(registry.remove(a).is_some());
        assert!(registry.remove(a).is_none());
        assert!(registry.get(a).is_none());
        assert!(registry.get(0).is_none());

        // Handles are not recycled
        assert_eq!(registry.add("third".to_string()), 3);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_concurrent_adds_are_unique() {
        let registry = Arc::new(HandleRegistry::new());
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let registry = registry.clone();
                std::thread::spawn(move || (0..100).map(|i| registry.add(t * 1000 + i)).collect::<Vec<_>>())
            })
            .collect();

        let mut handles: Vec<i64> = threads
            .into_iter()
            .flat_map(|t| t.join().unwrap())
            .collect();
        handles.sort_unstable();
        handles.dedup();
        assert_eq!(handles.len(), 800);
        assert_eq!(registry.len(), 800);
    }
}
