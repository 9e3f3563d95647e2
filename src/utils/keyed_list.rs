//! Insertion-ordered, name-keyed table used for every name→item index in the
//! runtime (tape function/class refs, module and class function tables,
//! object members).
//!
//! Entries are never removed, so the position returned by [`KeyedList::insert`]
//! stays valid for the lifetime of the list.

use std::fmt;
use std::hash::BuildHasherDefault;
use std::sync::Arc;
use indexmap::IndexMap;
use rustc_hash::FxHasher;

type FxIndexMap<K, V> = IndexMap<K, V, BuildHasherDefault<FxHasher>>;

#[derive(Clone)]
pub struct KeyedList<V> {
    entries: FxIndexMap<Arc<str>, V>,
}

impl<V> KeyedList<V> {
    pub fn new() -> Self {
        Self {
            entries: FxIndexMap::default(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: FxIndexMap::with_capacity_and_hasher(capacity, Default::default()),
        }
    }

    /// Insert a new entry. Fails with the position of the existing entry if
    /// the name is already bound; the existing binding is left untouched.
    pub fn insert(&mut self, name: impl Into<Arc<str>>, value: V) -> Result<usize, usize> {
        let name = name.into();
        if let Some(existing) = self.entries.get_index_of(&*name) {
            return Err(existing);
        }
        let (index, _) = self.entries.insert_full(name, value);
        Ok(index)
    }

    /// Bind or rebind a name. Rebinding keeps the original position.
    pub fn set(&mut self, name: impl Into<Arc<str>>, value: V) -> usize {
        let name = name.into();
        if let Some((index, _, slot)) = self.entries.get_full_mut(&*name) {
            *slot = value;
            return index;
        }
        self.entries.insert_full(name, value).0
    }

    pub fn get(&self, name: &str) -> Option<&V> {
        self.entries.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut V> {
        self.entries.get_mut(name)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.entries.get_index_of(name)
    }

    pub fn get_index(&self, index: usize) -> Option<(&Arc<str>, &V)> {
        self.entries.get_index(index)
    }

    pub fn get_index_mut(&mut self, index: usize) -> Option<(&Arc<str>, &mut V)> {
        self.entries.get_index_mut(index).map(|(k, v)| (&*k, v))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Arc<str>, &V)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Arc<str>> {
        self.entries.keys()
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.values()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.entries.values_mut()
    }
}

impl<V> Default for KeyedList<V> {
    fn default() -> Self {
        Self::new()
    }
}

// Order-sensitive, unlike IndexMap's own equality.
impl<V: PartialEq> PartialEq for KeyedList<V> {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().eq(other.iter())
    }
}

impl<V: fmt::Debug> fmt::Debug for KeyedList<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.entries.iter()).finish()
    }
}

impl<K: Into<Arc<str>>, V> FromIterator<(K, V)> for KeyedList<V> {
    /// Later duplicates are dropped; the first binding wins.
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut list = KeyedList::new();
        for (name, value) in iter {
            let _ = list.insert(name, value);
        }
        list
    }
}
