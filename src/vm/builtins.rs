//! The `builtin` module: root `Object` class, native-backed value classes
//! and a couple of free functions.

use std::sync::Arc;
use crate::entity::{Entity, Exception, NativeCall, NativeKind, NativeObject};
use crate::heap::{render_entity, HeapExt, ObjectReference};
use crate::vm::{LoadResult, ModuleBuilder, VMError, VMResult};

pub(crate) fn register(builder: &mut ModuleBuilder<'_>) -> LoadResult<()> {
    builder.add_class("Object", None, None, &[])?;
    builder.add_class("String", None, Some(NativeKind::Str), &[("new", string_new), ("len", len)])?;
    builder.add_class("Array", None, Some(NativeKind::Array), &[("len", len), ("push", array_push)])?;
    builder.add_class("NamedList", None, Some(NativeKind::NamedList), &[("len", len), ("keys", named_list_keys)])?;
    builder.add_class("Function", None, Some(NativeKind::Function), &[("name", reflection_name)])?;
    builder.add_class("Module", None, Some(NativeKind::Module), &[("name", reflection_name)])?;
    builder.add_class(
        "Class",
        None,
        Some(NativeKind::Class),
        &[("name", reflection_name), ("super", class_super)],
    )?;
    builder.add_class("Error", None, Some(NativeKind::Error), &[("new", error_new), ("message", error_message)])?;
    builder.add_class("Future", None, Some(NativeKind::Future), &[("ready", future_ready)])?;

    builder.add_function("len", len_of)?;
    builder.add_function("type", type_name)?;
    Ok(())
}

fn receiver(call: &NativeCall<'_>) -> VMResult<ObjectReference> {
    call.receiver
        .as_object()
        .ok_or_else(|| VMError::TypeError(format!("method called on {}", call.receiver.type_name())))
}

/// New builtin `String` object holding `value`
pub(crate) fn new_str(call: &NativeCall<'_>, value: impl Into<String>) -> VMResult<Entity> {
    let class = call
        .modules
        .builtin_class("String")
        .ok_or_else(|| VMError::Native("builtin String class is missing".to_string()))?;
    Ok(Entity::Object(call.heap.allocate_str(&class, value)?))
}

fn string_new(call: &NativeCall<'_>, arg: Entity) -> VMResult<Entity> {
    let text = match arg {
        Entity::None => String::new(),
        other => render_entity(call.heap, &other)?,
    };
    let obj = receiver(call)?;
    call.heap.write(obj, |o| o.native = Some(NativeObject::Str(text)))?;
    Ok(Entity::None)
}

fn len(call: &NativeCall<'_>, _arg: Entity) -> VMResult<Entity> {
    len_of(call, call.receiver)
}

fn len_of(call: &NativeCall<'_>, value: Entity) -> VMResult<Entity> {
    let obj = value
        .as_object()
        .ok_or_else(|| VMError::TypeError(format!("{} has no length", value.type_name())))?;
    let length = call.heap.read(obj, |o| match &o.native {
        Some(NativeObject::Str(s)) => Some(s.len()),
        Some(NativeObject::Array(items)) => Some(items.len()),
        Some(NativeObject::NamedList(items)) => Some(items.len()),
        _ => None,
    })?;
    match length {
        Some(length) => Ok(Entity::int(length as i64)),
        None => Err(VMError::TypeError(format!("{} has no length", value))),
    }
}

fn array_push(call: &NativeCall<'_>, arg: Entity) -> VMResult<Entity> {
    let obj = receiver(call)?;
    let pushed = call.heap.write(obj, |o| o.as_array_mut().map(|items| items.push(arg)))?;
    pushed.ok_or_else(|| VMError::TypeError("push on a non-array".to_string()))?;
    Ok(call.receiver)
}

fn named_list_keys(call: &NativeCall<'_>, _arg: Entity) -> VMResult<Entity> {
    let obj = receiver(call)?;
    let keys: Vec<Arc<str>> = call
        .heap
        .read(obj, |o| o.as_named_list().map(|items| items.keys().cloned().collect()))?
        .ok_or_else(|| VMError::TypeError("keys on a non-named-list".to_string()))?;
    let mut entries = Vec::with_capacity(keys.len());
    for key in keys.iter() {
        entries.push(new_str(call, key.as_ref())?);
    }
    let class = call
        .modules
        .builtin_class("Array")
        .ok_or_else(|| VMError::Native("builtin Array class is missing".to_string()))?;
    Ok(Entity::Object(call.heap.allocate_native(&class, NativeObject::Array(entries))?))
}

fn reflection_name(call: &NativeCall<'_>, _arg: Entity) -> VMResult<Entity> {
    let obj = receiver(call)?;
    let name = call.heap.read(obj, |o| match &o.native {
        Some(NativeObject::Function(func)) => Some(func.function.qualified_name()),
        Some(NativeObject::Module(module)) => Some(module.name.to_string()),
        Some(NativeObject::Class(class)) => Some(class.qualified_name()),
        _ => None,
    })?;
    match name {
        Some(name) => new_str(call, name),
        None => Err(VMError::TypeError("name on a non-reflection object".to_string())),
    }
}

fn class_super(call: &NativeCall<'_>, _arg: Entity) -> VMResult<Entity> {
    let obj = receiver(call)?;
    let super_class = call
        .heap
        .read(obj, |o| o.as_class().and_then(|class| class.super_class.clone()))?;
    match super_class {
        Some(class) => Ok(Entity::Object(call.modules.reflect_class(call.heap, &class)?)),
        None => Ok(Entity::None),
    }
}

fn error_new(call: &NativeCall<'_>, arg: Entity) -> VMResult<Entity> {
    let message = match arg {
        Entity::None => String::new(),
        other => render_entity(call.heap, &other)?,
    };
    let obj = receiver(call)?;
    call.heap
        .write(obj, |o| o.native = Some(NativeObject::Error(Exception::new(message))))?;
    Ok(Entity::None)
}

fn error_message(call: &NativeCall<'_>, _arg: Entity) -> VMResult<Entity> {
    let obj = receiver(call)?;
    let message = call
        .heap
        .read(obj, |o| o.as_error().map(|e| e.message.clone()))?
        .ok_or_else(|| VMError::TypeError("message on a non-error".to_string()))?;
    new_str(call, message)
}

fn future_ready(call: &NativeCall<'_>, _arg: Entity) -> VMResult<Entity> {
    let obj = receiver(call)?;
    let ready = call.heap.read(obj, |o| o.as_future().map(|slot| slot.is_ready()))?;
    Ok(Entity::from_bool(ready.unwrap_or(false)))
}

fn type_name(call: &NativeCall<'_>, arg: Entity) -> VMResult<Entity> {
    let name = match arg {
        Entity::Object(obj) => call.heap.get_class(obj)?.qualified_name(),
        other => other.type_name().to_string(),
    };
    new_str(call, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{Heap, StandardHeap};
    use crate::vm::ModuleManager;

    fn call<'a>(heap: &'a StandardHeap, modules: &'a ModuleManager, receiver: Entity) -> NativeCall<'a> {
        NativeCall { heap, modules, receiver }
    }

    fn text(heap: &StandardHeap, value: Entity) -> String {
        render_entity(heap, &value).unwrap()
    }

    #[test]
    fn test_string_new_and_len() {
        let modules = ModuleManager::new().unwrap();
        let heap = StandardHeap::new(1);
        let s = heap.allocate(&modules.builtin_class("String").unwrap()).unwrap();
        let ctx = call(&heap, &modules, Entity::Object(s));
        string_new(&ctx, Entity::int(42)).unwrap();
        assert_eq!(text(&heap, Entity::Object(s)), "42");
        assert_eq!(len(&ctx, Entity::None).unwrap(), Entity::int(2));
    }

    #[test]
    fn test_array_push_returns_receiver() {
        let modules = ModuleManager::new().unwrap();
        let heap = StandardHeap::new(1);
        let array = heap.allocate(&modules.builtin_class("Array").unwrap()).unwrap();
        let ctx = call(&heap, &modules, Entity::Object(array));
        assert_eq!(array_push(&ctx, Entity::int(1)).unwrap(), Entity::Object(array));
        array_push(&ctx, Entity::int(2)).unwrap();
        assert_eq!(text(&heap, Entity::Object(array)), "[1, 2]");
        assert_eq!(len_of(&ctx, Entity::Object(array)).unwrap(), Entity::int(2));
    }

    #[test]
    fn test_len_rejects_primitives() {
        let modules = ModuleManager::new().unwrap();
        let heap = StandardHeap::new(1);
        let ctx = call(&heap, &modules, Entity::None);
        assert!(matches!(len_of(&ctx, Entity::int(3)), Err(VMError::TypeError(_))));
    }

    #[test]
    fn test_named_list_keys_in_order() {
        let modules = ModuleManager::new().unwrap();
        let heap = StandardHeap::new(1);
        let list = heap.allocate(&modules.builtin_class("NamedList").unwrap()).unwrap();
        heap.write(list, |o| {
            let items = o.as_named_list_mut().unwrap();
            items.set("b", Entity::int(1));
            items.set("a", Entity::int(2));
        })
        .unwrap();
        let ctx = call(&heap, &modules, Entity::Object(list));
        let keys = named_list_keys(&ctx, Entity::None).unwrap();
        assert_eq!(text(&heap, keys), "[b, a]");
    }

    #[test]
    fn test_error_message() {
        let modules = ModuleManager::new().unwrap();
        let heap = StandardHeap::new(1);
        let error = heap.allocate(&modules.builtin_class("Error").unwrap()).unwrap();
        let ctx = call(&heap, &modules, Entity::Object(error));
        let message = new_str(&ctx, "disk full").unwrap();
        error_new(&ctx, message).unwrap();
        assert_eq!(text(&heap, error_message(&ctx, Entity::None).unwrap()), "disk full");
    }

    #[test]
    fn test_type_names() {
        let modules = ModuleManager::new().unwrap();
        let heap = StandardHeap::new(1);
        let ctx = call(&heap, &modules, Entity::None);
        assert_eq!(text(&heap, type_name(&ctx, Entity::int(1)).unwrap()), "int");
        let s = new_str(&ctx, "x").unwrap();
        assert_eq!(text(&heap, type_name(&ctx, s).unwrap()), "builtin.String");
    }

    #[test]
    fn test_class_reflection_super() {
        let modules = ModuleManager::new().unwrap();
        let heap = StandardHeap::new(1);
        let string = modules.reflect_class(&heap, &modules.builtin_class("String").unwrap()).unwrap();
        let ctx = call(&heap, &modules, Entity::Object(string));
        let parent = class_super(&ctx, Entity::None).unwrap();
        assert_eq!(text(&heap, parent), "<class builtin.Object>");
        assert_eq!(text(&heap, reflection_name(&ctx, Entity::None).unwrap()), "builtin.String");
    }
}
