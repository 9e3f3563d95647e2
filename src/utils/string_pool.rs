use std::sync::Arc;
use dashmap::DashMap;

/// Interns names and string literals so that every distinct string is stored
/// once and shared by all tapes loaded through the same pool.
#[derive(Default)]
pub struct StringPool {
    strings: DashMap<Arc<str>, ()>,
}

impl StringPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the pooled copy of `value`, inserting it on first sight.
    pub fn intern(&self, value: &str) -> Arc<str> {
        if let Some(existing) = self.strings.get(value) {
            return existing.key().clone();
        }
        let entry = self.strings.entry(Arc::from(value)).or_insert(());
        entry.key().clone()
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_returns_shared_allocation() {
        let pool = StringPool::new();
        let a = pool.intern("main");
        let b = pool.intern("main");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_distinct_strings() {
        let pool = StringPool::new();
        pool.intern("a");
        pool.intern("b");
        pool.intern("a");
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_concurrent_interning() {
        use std::thread;

        let pool = Arc::new(StringPool::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || pool.intern("shared"))
            })
            .collect();

        let interned: Vec<Arc<str>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for s in &interned {
            assert!(Arc::ptr_eq(s, &interned[0]));
        }
        assert_eq!(pool.len(), 1);
    }
}
