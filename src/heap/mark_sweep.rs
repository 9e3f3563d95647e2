use rustc_hash::FxHashSet;
use crate::heap::{HeapResult, ObjectReference};

/// Mark phase of the heap's mark-sweep collector
pub struct MarkSweepGC {
    // Root objects that are directly accessible
    roots: FxHashSet<ObjectReference>,
}

impl MarkSweepGC {
    pub fn new() -> Self {
        Self {
            roots: FxHashSet::default(),
        }
    }

    pub fn add_root(&mut self, reference: ObjectReference) {
        self.roots.insert(reference);
    }

    pub fn remove_root(&mut self, reference: &ObjectReference) {
        self.roots.remove(reference);
    }

    pub fn root_count(&self) -> usize {
        self.roots.len()
    }

    /// Mark every object reachable from the roots. `visit_object` returns
    /// the outgoing references of one object.
    pub fn mark(
        &self,
        visit_object: impl Fn(&ObjectReference) -> HeapResult<Vec<ObjectReference>>,
    ) -> HeapResult<FxHashSet<ObjectReference>> {
        let mut marked = FxHashSet::default();
        let mut stack: Vec<ObjectReference> = self.roots.iter().copied().collect();

        while let Some(reference) = stack.pop() {
            if !marked.insert(reference) {
                continue;
            }
            for child in visit_object(&reference)? {
                if !marked.contains(&child) {
                    stack.push(child);
                }
            }
        }

        Ok(marked)
    }
}

impl Default for MarkSweepGC {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::HeapError;
    use rustc_hash::FxHashMap;

    #[test]
    fn test_add_and_remove_roots() {
        let mut gc = MarkSweepGC::new();
        let ref1 = ObjectReference::new(1, 100);
        let ref2 = ObjectReference::new(1, 200);
        gc.add_root(ref1);
        gc.add_root(ref2);
        gc.add_root(ref1);
        assert_eq!(gc.root_count(), 2);
        gc.remove_root(&ref1);
        assert_eq!(gc.root_count(), 1);
    }

    #[test]
    fn test_mark_follows_graph_and_handles_cycles() {
        let a = ObjectReference::new(1, 1);
        let b = ObjectReference::new(1, 2);
        let c = ObjectReference::new(1, 3);
        let unreachable = ObjectReference::new(1, 4);
        let mut edges: FxHashMap<ObjectReference, Vec<ObjectReference>> = FxHashMap::default();
        edges.insert(a, vec![b]);
        edges.insert(b, vec![c, a]);
        edges.insert(unreachable, vec![a]);

        let mut gc = MarkSweepGC::new();
        gc.add_root(a);
        let marked = gc
            .mark(|r| Ok(edges.get(r).cloned().unwrap_or_default()))
            .unwrap();
        assert_eq!(marked.len(), 3);
        assert!(marked.contains(&c));
        assert!(!marked.contains(&unreachable));
    }

    #[test]
    fn test_mark_with_no_roots() {
        let gc = MarkSweepGC::new();
        let marked = gc.mark(|_| Ok(vec![ObjectReference::new(1, 1)])).unwrap();
        assert!(marked.is_empty());
    }

    #[test]
    fn test_mark_propagates_visit_errors() {
        let mut gc = MarkSweepGC::new();
        let root = ObjectReference::new(1, 1);
        gc.add_root(root);
        let result = gc.mark(|r| Err(HeapError::InvalidReference(*r)));
        assert_eq!(result, Err(HeapError::InvalidReference(root)));
    }
}
