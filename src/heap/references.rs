use std::fmt;

/// Non-owning handle to a heap object.
///
/// The upper 32 bits name the heap (one heap per process), the lower 32 bits
/// the object slot inside it. A heap refuses references minted by another
/// heap, which keeps objects from crossing process boundaries.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectReference {
    value: u64,
}

impl ObjectReference {
    pub fn new(heap_id: u32, object_id: u32) -> Self {
        Self {
            value: ((heap_id as u64) << 32) | object_id as u64,
        }
    }

    pub fn heap_id(&self) -> u32 {
        (self.value >> 32) as u32
    }

    pub fn object_id(&self) -> u32 {
        self.value as u32
    }
}

impl fmt::Debug for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef(heap={}, id={})", self.heap_id(), self.object_id())
    }
}

impl fmt::Display for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Object@{}:{}", self.heap_id(), self.object_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_packs_heap_and_object() {
        let obj_ref = ObjectReference::new(0x12345678, 0x87654321);
        assert_eq!(obj_ref.heap_id(), 0x12345678);
        assert_eq!(obj_ref.object_id(), 0x87654321);
        assert_eq!(obj_ref.value, (0x12345678u64 << 32) | 0x87654321);
    }

    #[test]
    fn test_same_slot_in_different_heaps_differs() {
        let a = ObjectReference::new(1, 123);
        let b = ObjectReference::new(2, 123);
        assert_ne!(a, b);
        assert_eq!(a.object_id(), b.object_id());
    }

    #[test]
    fn test_formatting() {
        let obj_ref = ObjectReference::new(42, 123);
        assert_eq!(format!("{:?}", obj_ref), "ObjectRef(heap=42, id=123)");
        assert_eq!(obj_ref.to_string(), "Object@42:123");
    }

    #[test]
    fn test_usable_as_map_key() {
        let mut map = rustc_hash::FxHashMap::default();
        map.insert(ObjectReference::new(1, 10), "first");
        map.insert(ObjectReference::new(2, 20), "second");
        assert_eq!(map.get(&ObjectReference::new(1, 10)), Some(&"first"));
        assert_eq!(map.len(), 2);
    }
}
