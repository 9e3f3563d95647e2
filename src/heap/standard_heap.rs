use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;
use crate::entity::{Class, NativeObject, Object};
use crate::heap::{Heap, HeapError, HeapResult, MarkSweepGC, ObjectHandle, ObjectReference};

/// Object table keyed by slot id, collected by mark-sweep on request.
pub struct StandardHeap {
    id: u32,
    objects: RwLock<FxHashMap<u32, ObjectHandle>>,
    roots: Mutex<FxHashSet<ObjectReference>>,
    next_id: AtomicU32,
}

impl StandardHeap {
    pub fn new(id: u32) -> Self {
        Self::with_capacity(id, 0)
    }

    pub fn with_capacity(id: u32, capacity: usize) -> Self {
        Self {
            id,
            objects: RwLock::new(FxHashMap::with_capacity_and_hasher(capacity, Default::default())),
            roots: Mutex::new(FxHashSet::default()),
            next_id: AtomicU32::new(1),
        }
    }

    fn check_owner(&self, obj: ObjectReference) -> HeapResult<()> {
        if obj.heap_id() != self.id {
            return Err(HeapError::ForeignReference {
                reference: obj,
                owner: obj.heap_id(),
                heap: self.id,
            });
        }
        Ok(())
    }

    fn insert(&self, object: Object) -> HeapResult<ObjectReference> {
        let slot = self.next_id.fetch_add(1, Ordering::Relaxed);
        if slot == u32::MAX {
            return Err(HeapError::Exhausted(self.id));
        }
        self.objects.write().insert(slot, Arc::new(RwLock::new(object)));
        Ok(ObjectReference::new(self.id, slot))
    }

    pub fn root_count(&self) -> usize {
        self.roots.lock().len()
    }
}

impl Heap for StandardHeap {
    fn id(&self) -> u32 {
        self.id
    }

    fn allocate(&self, class: &Arc<Class>) -> HeapResult<ObjectReference> {
        self.insert(Object::new(class.clone()))
    }

    fn allocate_native(&self, class: &Arc<Class>, native: NativeObject) -> HeapResult<ObjectReference> {
        self.insert(Object::with_native(class.clone(), native))
    }

    fn mark_root(&self, obj: ObjectReference) -> HeapResult<()> {
        self.check_owner(obj)?;
        if !self.objects.read().contains_key(&obj.object_id()) {
            return Err(HeapError::InvalidReference(obj));
        }
        self.roots.lock().insert(obj);
        Ok(())
    }

    fn get(&self, obj: ObjectReference) -> HeapResult<ObjectHandle> {
        self.check_owner(obj)?;
        self.objects
            .read()
            .get(&obj.object_id())
            .cloned()
            .ok_or(HeapError::InvalidReference(obj))
    }

    fn get_class(&self, obj: ObjectReference) -> HeapResult<Arc<Class>> {
        let handle = self.get(obj)?;
        let class = handle.read().class.clone();
        Ok(class)
    }

    fn object_count(&self) -> usize {
        self.objects.read().len()
    }

    fn collect(&self, extra_roots: &[ObjectReference]) -> HeapResult<usize> {
        let mut gc = MarkSweepGC::new();
        for root in self.roots.lock().iter() {
            gc.add_root(*root);
        }
        for root in extra_roots {
            if root.heap_id() == self.id {
                gc.add_root(*root);
            }
        }

        let marked = gc.mark(|reference| match self.get(*reference) {
            Ok(handle) => Ok(handle
                .read()
                .references()
                .into_iter()
                .filter(|r| r.heap_id() == self.id)
                .collect()),
            // Dangling references are simply not traced.
            Err(HeapError::InvalidReference(_)) => Ok(Vec::new()),
            Err(err) => Err(err),
        })?;

        let mut objects = self.objects.write();
        let before = objects.len();
        objects.retain(|slot, _| marked.contains(&ObjectReference::new(self.id, *slot)));
        let freed = before - objects.len();
        debug!(heap = self.id, freed, live = objects.len(), "Collected heap");
        Ok(freed)
    }
}
