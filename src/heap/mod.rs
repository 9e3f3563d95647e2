mod mark_sweep;
mod references;
mod standard_heap;

pub use mark_sweep::MarkSweepGC;
pub use references::ObjectReference;
pub use standard_heap::StandardHeap;

use std::fmt::Write as _;
use std::sync::Arc;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use thiserror::Error;
use crate::entity::{Class, Entity, NativeObject, Object};

/// Errors that can occur in heap operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HeapError {
    #[error("Reference {reference} belongs to heap {owner}, not heap {heap}")]
    ForeignReference { reference: ObjectReference, owner: u32, heap: u32 },

    #[error("Invalid object reference: {0}")]
    InvalidReference(ObjectReference),

    #[error("Heap {0} has no object ids left")]
    Exhausted(u32),

    #[error("{0} objects cannot be copied between processes")]
    NotTransferable(&'static str),
}

/// Result type for heap operations
pub type HeapResult<T> = Result<T, HeapError>;

/// Shared, lockable handle to a heap object.
pub type ObjectHandle = Arc<RwLock<Object>>;

/// The operations the runtime needs from a heap. Object lifetime and
/// collection policy are up to the implementation.
pub trait Heap: Send + Sync {
    /// Heap id, stamped into every reference this heap hands out
    fn id(&self) -> u32;

    /// Allocate an instance of `class`, running the class's native init
    fn allocate(&self, class: &Arc<Class>) -> HeapResult<ObjectReference>;

    /// Allocate an instance with an explicit native payload
    fn allocate_native(&self, class: &Arc<Class>, native: NativeObject) -> HeapResult<ObjectReference>;

    /// Keep `obj` alive regardless of reachability
    fn mark_root(&self, obj: ObjectReference) -> HeapResult<()>;

    fn get(&self, obj: ObjectReference) -> HeapResult<ObjectHandle>;

    fn get_class(&self, obj: ObjectReference) -> HeapResult<Arc<Class>>;

    fn object_count(&self) -> usize;

    /// Reclaim objects unreachable from the marked roots and `extra_roots`.
    /// Returns the number of objects freed.
    fn collect(&self, extra_roots: &[ObjectReference]) -> HeapResult<usize>;
}

/// Closure-based access helpers for any heap
pub trait HeapExt {
    fn read<R>(&self, obj: ObjectReference, f: impl FnOnce(&Object) -> R) -> HeapResult<R>;

    fn write<R>(&self, obj: ObjectReference, f: impl FnOnce(&mut Object) -> R) -> HeapResult<R>;

    /// Allocate a string object
    fn allocate_str(&self, class: &Arc<Class>, value: impl Into<String>) -> HeapResult<ObjectReference>;
}

impl<H: ?Sized + Heap> HeapExt for H {
    fn read<R>(&self, obj: ObjectReference, f: impl FnOnce(&Object) -> R) -> HeapResult<R> {
        let handle = self.get(obj)?;
        let guard = handle.read();
        Ok(f(&guard))
    }

    fn write<R>(&self, obj: ObjectReference, f: impl FnOnce(&mut Object) -> R) -> HeapResult<R> {
        let handle = self.get(obj)?;
        let mut guard = handle.write();
        Ok(f(&mut guard))
    }

    fn allocate_str(&self, class: &Arc<Class>, value: impl Into<String>) -> HeapResult<ObjectReference> {
        self.allocate_native(class, NativeObject::Str(value.into()))
    }
}

const MAX_RENDER_DEPTH: usize = 16;

/// Print an entity the way `PRNT` does.
///
/// Objects print through their native payload; plain instances print as
/// `Instance of <module>.<class>`.
pub fn render_entity(heap: &dyn Heap, entity: &Entity) -> HeapResult<String> {
    let mut out = String::new();
    render_into(heap, entity, &mut out, 0)?;
    Ok(out)
}

fn render_into(heap: &dyn Heap, entity: &Entity, out: &mut String, depth: usize) -> HeapResult<()> {
    let obj = match entity {
        Entity::Object(obj) => *obj,
        other => {
            let _ = write!(out, "{}", other);
            return Ok(());
        }
    };
    if depth >= MAX_RENDER_DEPTH {
        out.push_str("...");
        return Ok(());
    }
    // Clone the payload so no lock is held while rendering children.
    let (class, native) = heap.read(obj, |o| (o.class.clone(), o.native.clone()))?;
    match native {
        None => {
            let _ = write!(out, "Instance of {}", class.qualified_name());
        }
        Some(NativeObject::Str(s)) => out.push_str(&s),
        Some(NativeObject::Array(items)) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                render_into(heap, item, out, depth + 1)?;
            }
            out.push(']');
        }
        Some(NativeObject::NamedList(items)) => {
            out.push('{');
            for (i, (name, item)) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                let _ = write!(out, "{}: ", name);
                render_into(heap, item, out, depth + 1)?;
            }
            out.push('}');
        }
        Some(NativeObject::Function(func)) => {
            let _ = write!(out, "<function {}>", func.function.qualified_name());
        }
        Some(NativeObject::Module(module)) => {
            let _ = write!(out, "<module {}>", module.name);
        }
        Some(NativeObject::Class(class)) => {
            let _ = write!(out, "<class {}>", class.qualified_name());
        }
        Some(NativeObject::Error(exception)) => {
            let _ = write!(out, "Error: {}", exception.message);
        }
        Some(NativeObject::Future(slot)) => {
            out.push_str(if slot.is_ready() { "<future ready>" } else { "<future pending>" });
        }
    }
    Ok(())
}

/// Objects that stand for something living outside any heap (a module, a
/// class, an unbound function) and have one canonical object per heap.
pub trait SharedObjects {
    type Error: From<HeapError>;

    /// The canonical object for `native` on `heap`, or `None` when the
    /// payload is plain data that must be copied.
    fn canonical(&self, heap: &dyn Heap, native: &NativeObject) -> Result<Option<ObjectReference>, Self::Error>;
}

/// Copy `entity` and everything it reaches from `from` into `to`.
///
/// Shared and cyclic structure is preserved. Objects `shared` knows about
/// resolve to their canonical object on `to` instead of being duplicated.
/// Futures are bound to the process that created them and cannot be copied.
pub fn deep_copy<S: SharedObjects>(from: &dyn Heap, to: &dyn Heap, entity: Entity, shared: &S) -> Result<Entity, S::Error> {
    let mut copied = FxHashMap::default();
    copy_entity(from, to, entity, shared, &mut copied)
}

fn copy_entity<S: SharedObjects>(
    from: &dyn Heap,
    to: &dyn Heap,
    entity: Entity,
    shared: &S,
    copied: &mut FxHashMap<ObjectReference, ObjectReference>,
) -> Result<Entity, S::Error> {
    let source = match entity {
        Entity::Object(obj) => obj,
        other => return Ok(other),
    };
    if let Some(target) = copied.get(&source) {
        return Ok(Entity::Object(*target));
    }

    let original = from.read(source, |o| o.clone())?;
    if let Some(NativeObject::Future(_)) = original.native {
        return Err(HeapError::NotTransferable("Future").into());
    }
    if let Some(native) = &original.native {
        if let Some(canonical) = shared.canonical(to, native)? {
            copied.insert(source, canonical);
            return Ok(Entity::Object(canonical));
        }
    }
    let target = match &original.native {
        Some(native) => to.allocate_native(&original.class, native.clone())?,
        None => to.allocate(&original.class)?,
    };
    copied.insert(source, target);

    let mut members = Vec::with_capacity(original.members.len());
    for (name, value) in original.members.iter() {
        members.push((name.clone(), copy_entity(from, to, *value, shared, copied)?));
    }
    let native = match original.native {
        Some(NativeObject::Array(items)) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(copy_entity(from, to, item, shared, copied)?);
            }
            Some(NativeObject::Array(out))
        }
        Some(NativeObject::NamedList(items)) => {
            let mut out = crate::utils::KeyedList::with_capacity(items.len());
            for (name, item) in items.iter() {
                out.set(name.clone(), copy_entity(from, to, *item, shared, copied)?);
            }
            Some(NativeObject::NamedList(out))
        }
        Some(NativeObject::Function(mut func)) => {
            if let Some(receiver) = func.receiver {
                func.receiver = Some(copy_entity(from, to, receiver, shared, copied)?);
            }
            Some(NativeObject::Function(func))
        }
        _ => None,
    };

    to.write(target, |o| {
        for (name, value) in members {
            o.set_member(name, value);
        }
        if native.is_some() {
            o.native = native;
        }
    })?;
    Ok(Entity::Object(target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Exception, NativeKind};

    /// Copies every payload as plain data
    struct Unshared;

    impl SharedObjects for Unshared {
        type Error = HeapError;

        fn canonical(&self, _heap: &dyn Heap, _native: &NativeObject) -> HeapResult<Option<ObjectReference>> {
            Ok(None)
        }
    }

    fn class(name: &str, native: Option<NativeKind>) -> Arc<Class> {
        let mut class = Class::new(name.into(), "builtin".into(), None);
        class.native = native;
        Arc::new(class)
    }

    #[test]
    fn test_heap_error_display() {
        let reference = ObjectReference::new(2, 5);
        assert_eq!(
            HeapError::ForeignReference { reference, owner: 2, heap: 1 }.to_string(),
            "Reference Object@2:5 belongs to heap 2, not heap 1"
        );
        assert_eq!(HeapError::InvalidReference(reference).to_string(), "Invalid object reference: Object@2:5");
        assert_eq!(HeapError::NotTransferable("Future").to_string(), "Future objects cannot be copied between processes");
    }

    #[test]
    fn test_heap_ext_read_write() {
        let heap = StandardHeap::new(1);
        let point = heap.allocate(&class("Point", None)).unwrap();
        heap.write(point, |o| o.set_member("x", Entity::int(3))).unwrap();
        assert_eq!(heap.read(point, |o| o.member("x")).unwrap(), Some(Entity::int(3)));
    }

    #[test]
    fn test_render_plain_instance_and_primitives() {
        let heap = StandardHeap::new(1);
        let point = heap.allocate(&Arc::new(Class::new("Point".into(), "geo".into(), None))).unwrap();
        assert_eq!(render_entity(&heap, &Entity::Object(point)).unwrap(), "Instance of geo.Point");
        assert_eq!(render_entity(&heap, &Entity::int(5)).unwrap(), "5");
        assert_eq!(render_entity(&heap, &Entity::None).unwrap(), "None");
    }

    #[test]
    fn test_render_native_payloads() {
        let heap = StandardHeap::new(1);
        let string_class = class("String", Some(NativeKind::Str));
        let s = heap.allocate_str(&string_class, "hi").unwrap();
        let array = heap
            .allocate_native(
                &class("Array", Some(NativeKind::Array)),
                NativeObject::Array(vec![Entity::int(1), Entity::Object(s)]),
            )
            .unwrap();
        assert_eq!(render_entity(&heap, &Entity::Object(array)).unwrap(), "[1, hi]");

        let error = heap
            .allocate_native(&class("Error", Some(NativeKind::Error)), NativeObject::Error(Exception::new("bad")))
            .unwrap();
        assert_eq!(render_entity(&heap, &Entity::Object(error)).unwrap(), "Error: bad");
    }

    #[test]
    fn test_render_cycle_is_bounded() {
        let heap = StandardHeap::new(1);
        let array_class = class("Array", Some(NativeKind::Array));
        let array = heap.allocate(&array_class).unwrap();
        heap.write(array, |o| {
            if let Some(items) = o.as_array_mut() {
                items.push(Entity::Object(array));
            }
        })
        .unwrap();
        let text = render_entity(&heap, &Entity::Object(array)).unwrap();
        assert!(text.starts_with("[["));
        assert!(text.contains("..."));
    }

    #[test]
    fn test_deep_copy_preserves_shape_across_heaps() {
        let from = StandardHeap::new(1);
        let to = StandardHeap::new(2);
        let node_class = class("Node", None);
        let a = from.allocate(&node_class).unwrap();
        let b = from.allocate(&node_class).unwrap();
        from.write(a, |o| o.set_member("next", Entity::Object(b))).unwrap();
        from.write(b, |o| o.set_member("next", Entity::Object(a))).unwrap();
        from.write(b, |o| o.set_member("value", Entity::int(7))).unwrap();

        let copy = deep_copy(&from, &to, Entity::Object(a), &Unshared).unwrap();
        let copy_a = copy.as_object().unwrap();
        assert_eq!(copy_a.heap_id(), 2);
        let copy_b = to.read(copy_a, |o| o.member("next")).unwrap().and_then(|e| e.as_object()).unwrap();
        assert_eq!(to.read(copy_b, |o| o.member("value")).unwrap(), Some(Entity::int(7)));
        assert_eq!(to.read(copy_b, |o| o.member("next")).unwrap(), Some(Entity::Object(copy_a)));
        assert_eq!(to.object_count(), 2);
    }

    #[test]
    fn test_deep_copy_primitives_pass_through() {
        let from = StandardHeap::new(1);
        let to = StandardHeap::new(2);
        assert_eq!(deep_copy(&from, &to, Entity::int(4), &Unshared).unwrap(), Entity::int(4));
        assert_eq!(deep_copy(&from, &to, Entity::None, &Unshared).unwrap(), Entity::None);
    }
}
