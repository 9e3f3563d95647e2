use std::fmt;
use std::sync::Arc;
use crate::entity::{Class, Entity, Exception, Function, Module};
use crate::heap::ObjectReference;
use crate::utils::KeyedList;
use crate::vm::FutureSlot;

/// Kinds of native payload a class can back its instances with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeKind {
    Str,
    Array,
    NamedList,
    Function,
    Module,
    Class,
    Error,
    Future,
}

impl NativeKind {
    /// Payload for a freshly allocated instance. Kinds that wrap a runtime
    /// entity have no default and must be allocated with their payload.
    pub fn init(&self) -> Option<NativeObject> {
        match self {
            NativeKind::Str => Some(NativeObject::Str(String::new())),
            NativeKind::Array => Some(NativeObject::Array(Vec::new())),
            NativeKind::NamedList => Some(NativeObject::NamedList(KeyedList::new())),
            NativeKind::Error => Some(NativeObject::Error(Exception::new(""))),
            NativeKind::Function | NativeKind::Module | NativeKind::Class | NativeKind::Future => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            NativeKind::Str => "String",
            NativeKind::Array => "Array",
            NativeKind::NamedList => "NamedList",
            NativeKind::Function => "Function",
            NativeKind::Module => "Module",
            NativeKind::Class => "Class",
            NativeKind::Error => "Error",
            NativeKind::Future => "Future",
        }
    }
}

/// A function value, optionally bound to a receiver.
#[derive(Clone)]
pub struct FunctionRef {
    pub function: Arc<Function>,
    pub receiver: Option<Entity>,
}

impl fmt::Debug for FunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FunctionRef({}", self.function.qualified_name())?;
        if let Some(receiver) = &self.receiver {
            write!(f, ", bound to {}", receiver)?;
        }
        write!(f, ")")
    }
}

/// Native payload of an object. The generic object machinery only goes
/// through this enum for init, copy, print and reference tracing.
#[derive(Clone)]
pub enum NativeObject {
    Str(String),
    Array(Vec<Entity>),
    NamedList(KeyedList<Entity>),
    Function(FunctionRef),
    Module(Arc<Module>),
    Class(Arc<Class>),
    Error(Exception),
    Future(Arc<FutureSlot>),
}

impl NativeObject {
    pub fn kind(&self) -> NativeKind {
        match self {
            NativeObject::Str(_) => NativeKind::Str,
            NativeObject::Array(_) => NativeKind::Array,
            NativeObject::NamedList(_) => NativeKind::NamedList,
            NativeObject::Function(_) => NativeKind::Function,
            NativeObject::Module(_) => NativeKind::Module,
            NativeObject::Class(_) => NativeKind::Class,
            NativeObject::Error(_) => NativeKind::Error,
            NativeObject::Future(_) => NativeKind::Future,
        }
    }

    fn trace(&self, out: &mut Vec<ObjectReference>) {
        let push = |out: &mut Vec<ObjectReference>, entity: &Entity| {
            if let Some(obj) = entity.as_object() {
                out.push(obj);
            }
        };
        match self {
            NativeObject::Array(items) => items.iter().for_each(|e| push(out, e)),
            NativeObject::NamedList(items) => items.values().for_each(|e| push(out, e)),
            NativeObject::Function(FunctionRef { receiver: Some(receiver), .. }) => push(out, receiver),
            NativeObject::Future(slot) => {
                if let Some(value) = slot.value() {
                    push(out, &value);
                }
            }
            _ => {}
        }
    }
}

impl fmt::Debug for NativeObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NativeObject::Str(s) => write!(f, "Str({:?})", s),
            NativeObject::Array(items) => f.debug_tuple("Array").field(items).finish(),
            NativeObject::NamedList(items) => f.debug_tuple("NamedList").field(items).finish(),
            NativeObject::Function(func) => write!(f, "{:?}", func),
            NativeObject::Module(module) => write!(f, "Module({})", module.name),
            NativeObject::Class(class) => write!(f, "Class({})", class.qualified_name()),
            NativeObject::Error(exception) => write!(f, "Error({:?})", exception.message),
            NativeObject::Future(slot) => write!(f, "Future(ready: {})", slot.is_ready()),
        }
    }
}

/// A heap object: its class, named members and optional native payload.
#[derive(Debug, Clone)]
pub struct Object {
    pub class: Arc<Class>,
    pub members: KeyedList<Entity>,
    pub native: Option<NativeObject>,
}

impl Object {
    /// New instance; the payload comes from the class's native init.
    pub fn new(class: Arc<Class>) -> Self {
        let native = class.native_kind().and_then(|kind| kind.init());
        Self {
            class,
            members: KeyedList::new(),
            native,
        }
    }

    pub fn with_native(class: Arc<Class>, native: NativeObject) -> Self {
        Self {
            class,
            members: KeyedList::new(),
            native: Some(native),
        }
    }

    pub fn member(&self, name: &str) -> Option<Entity> {
        self.members.get(name).copied()
    }

    pub fn set_member(&mut self, name: impl Into<Arc<str>>, value: Entity) {
        self.members.set(name, value);
    }

    /// Every object this one points at (members and native payload).
    pub fn references(&self) -> Vec<ObjectReference> {
        let mut out: Vec<ObjectReference> = self.members.values().filter_map(Entity::as_object).collect();
        if let Some(native) = &self.native {
            native.trace(&mut out);
        }
        out
    }

    pub fn native_kind(&self) -> Option<NativeKind> {
        self.native.as_ref().map(NativeObject::kind)
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.native {
            Some(NativeObject::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Entity>> {
        match &self.native {
            Some(NativeObject::Array(items)) => Some(items),
            _ => None,
        }
    }

    pub fn as_array_mut(&mut self) -> Option<&mut Vec<Entity>> {
        match &mut self.native {
            Some(NativeObject::Array(items)) => Some(items),
            _ => None,
        }
    }

    pub fn as_named_list(&self) -> Option<&KeyedList<Entity>> {
        match &self.native {
            Some(NativeObject::NamedList(items)) => Some(items),
            _ => None,
        }
    }

    pub fn as_named_list_mut(&mut self) -> Option<&mut KeyedList<Entity>> {
        match &mut self.native {
            Some(NativeObject::NamedList(items)) => Some(items),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&FunctionRef> {
        match &self.native {
            Some(NativeObject::Function(func)) => Some(func),
            _ => None,
        }
    }

    pub fn as_module(&self) -> Option<&Arc<Module>> {
        match &self.native {
            Some(NativeObject::Module(module)) => Some(module),
            _ => None,
        }
    }

    pub fn as_class(&self) -> Option<&Arc<Class>> {
        match &self.native {
            Some(NativeObject::Class(class)) => Some(class),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&Exception> {
        match &self.native {
            Some(NativeObject::Error(exception)) => Some(exception),
            _ => None,
        }
    }

    pub fn as_future(&self) -> Option<&Arc<FutureSlot>> {
        match &self.native {
            Some(NativeObject::Future(slot)) => Some(slot),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn native_class(kind: NativeKind) -> Arc<Class> {
        Arc::new(Class::new(kind.name().into(), "builtin".into(), None).with_native(kind))
    }

    #[test]
    fn test_new_runs_native_init() {
        let array = Object::new(native_class(NativeKind::Array));
        assert_eq!(array.as_array().map(Vec::len), Some(0));

        let plain = Object::new(Arc::new(Class::new("Point".into(), "main".into(), None)));
        assert!(plain.native.is_none());

        let module_ref = Object::new(native_class(NativeKind::Module));
        assert!(module_ref.native.is_none());
    }

    #[test]
    fn test_members_keep_insertion_order() {
        let mut obj = Object::new(Arc::new(Class::new("Point".into(), "main".into(), None)));
        obj.set_member("y", Entity::int(2));
        obj.set_member("x", Entity::int(1));
        obj.set_member("y", Entity::int(3));
        let names: Vec<&str> = obj.members.keys().map(|k| &**k).collect();
        assert_eq!(names, vec!["y", "x"]);
        assert_eq!(obj.member("y"), Some(Entity::int(3)));
        assert_eq!(obj.member("z"), None);
    }

    #[test]
    fn test_references_cover_members_and_payload() {
        let a = ObjectReference::new(1, 1);
        let b = ObjectReference::new(1, 2);
        let c = ObjectReference::new(1, 3);
        let mut obj = Object::with_native(
            native_class(NativeKind::Array),
            NativeObject::Array(vec![Entity::Object(a), Entity::int(4), Entity::Object(b)]),
        );
        obj.set_member("next", Entity::Object(c));
        let mut refs = obj.references();
        refs.sort();
        assert_eq!(refs, vec![a, b, c]);
    }

    #[test]
    fn test_copy_is_shallow() {
        let inner = ObjectReference::new(1, 9);
        let obj = Object::with_native(
            native_class(NativeKind::Array),
            NativeObject::Array(vec![Entity::Object(inner)]),
        );
        let mut copy = obj.clone();
        if let Some(items) = copy.as_array_mut() {
            items.push(Entity::int(1));
        }
        assert_eq!(obj.as_array().map(Vec::len), Some(1));
        assert_eq!(copy.as_array().and_then(|items| items.first().copied()), Some(Entity::Object(inner)));
    }
}
