use std::sync::Arc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{ReentrantMutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, info};
use crate::bytecode::Tape;
use crate::entity::{Class, Entity, Function, FunctionFlags, FunctionRef, Module, NativeFn, NativeKind, NativeObject};
use crate::heap::{Heap, HeapExt, ObjectReference, SharedObjects};
use crate::utils::{KeyedList, StringPool};
use crate::vm::builtins;
use crate::vm::{LoadError, LoadResult, VMError, VMResult};

/// Name of the module every other module implicitly depends on
pub const BUILTIN_MODULE: &str = "builtin";

/// Hydration callback for a native module
pub type NativeModuleFn = fn(&mut ModuleBuilder<'_>) -> LoadResult<()>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ReflectionKey {
    Module(Arc<str>),
    Class(Arc<str>, Arc<str>),
    Function(Arc<str>, Option<Arc<str>>, Arc<str>),
}

/// Owns every loaded module of a VM.
///
/// Modules are deduplicated by name and immutable once hydrated. The
/// builtin module is hydrated before anything else can be loaded.
pub struct ModuleManager {
    modules: RwLock<KeyedList<Arc<Module>>>,
    natives: RwLock<FxHashMap<Arc<str>, NativeModuleFn>>,
    // Serializes hydration; reentrant because hydrating one module may
    // load the modules its classes inherit from.
    load_lock: ReentrantMutex<()>,
    strings: StringPool,
    reflections: DashMap<(u32, ReflectionKey), ObjectReference>,
}

impl ModuleManager {
    pub fn new() -> LoadResult<Self> {
        let manager = Self {
            modules: RwLock::new(KeyedList::new()),
            natives: RwLock::new(FxHashMap::default()),
            load_lock: ReentrantMutex::new(()),
            strings: StringPool::new(),
            reflections: DashMap::new(),
        };
        manager.register_native(BUILTIN_MODULE, builtins::register);
        manager.module(BUILTIN_MODULE)?;
        Ok(manager)
    }

    /// Pool every tape loaded through this manager should be decoded with
    pub fn strings(&self) -> &StringPool {
        &self.strings
    }

    /// Register a native module. Its callback runs once, on first lookup.
    pub fn register_native(&self, name: &str, callback: NativeModuleFn) {
        let name = self.strings.intern(name);
        self.natives.write().insert(name, callback);
    }

    /// Already-loaded module
    pub fn get(&self, name: &str) -> Option<Arc<Module>> {
        self.modules.read().get(name).cloned()
    }

    /// Loaded module, hydrating a registered native module on first use.
    pub fn module(&self, name: &str) -> LoadResult<Arc<Module>> {
        if let Some(module) = self.get(name) {
            return Ok(module);
        }
        let callback = self.natives.read().get(name).copied();
        match callback {
            Some(callback) => self.load_native(name, callback),
            None => Err(LoadError::UnknownModule(self.strings.intern(name))),
        }
    }

    pub fn loaded(&self) -> Vec<Arc<str>> {
        self.modules.read().keys().cloned().collect()
    }

    pub fn builtin(&self) -> Option<Arc<Module>> {
        self.get(BUILTIN_MODULE)
    }

    pub fn builtin_class(&self, name: &str) -> Option<Arc<Class>> {
        self.builtin().and_then(|module| module.class(name).cloned())
    }

    /// Hydrate `tape` as module `name`. Loading a name twice returns the
    /// module loaded first.
    pub fn load(&self, name: &str, tape: Tape) -> LoadResult<Arc<Module>> {
        let _guard = self.load_lock.lock();
        if let Some(existing) = self.get(name) {
            debug!(module = name, "Module already loaded");
            return Ok(existing);
        }
        let name = self.strings.intern(name);
        tape.validate().map_err(|source| LoadError::MalformedTape {
            module: name.clone(),
            source,
        })?;

        let module = Arc::new(self.hydrate(&name, Arc::new(tape))?);
        self.insert(module.clone());
        info!(
            module = %module.name,
            classes = module.classes.len(),
            functions = module.functions.len(),
            instructions = module.tape.len(),
            "Loaded module"
        );
        Ok(module)
    }

    fn load_native(&self, name: &str, callback: NativeModuleFn) -> LoadResult<Arc<Module>> {
        let _guard = self.load_lock.lock();
        if let Some(existing) = self.get(name) {
            return Ok(existing);
        }
        let mut builder = ModuleBuilder::new(self, self.strings.intern(name));
        callback(&mut builder)?;
        let module = Arc::new(builder.finish());
        self.insert(module.clone());
        info!(
            module = %module.name,
            classes = module.classes.len(),
            functions = module.functions.len(),
            "Loaded native module"
        );
        Ok(module)
    }

    fn insert(&self, module: Arc<Module>) {
        let name = module.name.clone();
        self.modules.write().set(name, module);
    }

    fn hydrate(&self, name: &Arc<str>, tape: Arc<Tape>) -> LoadResult<Module> {
        let mut functions = KeyedList::with_capacity(tape.functions().len());
        for (raw, entry) in tape.functions().iter() {
            let (function_name, flags) = FunctionFlags::parse_name(raw);
            let function_name = self.strings.intern(function_name);
            let function = Function::bytecode(function_name.clone(), name.clone(), None, *entry, flags);
            if functions.insert(function_name.clone(), Arc::new(function)).is_err() {
                return Err(LoadError::DuplicateFunction {
                    module: name.clone(),
                    scope: "module scope".to_string(),
                    name: function_name,
                });
            }
        }

        let mut resolved = FxHashMap::default();
        let mut classes = KeyedList::with_capacity(tape.classes().len());
        for class_name in tape.classes().keys() {
            let mut visiting = Vec::new();
            let class = self.resolve_class(name, &tape, class_name, &mut resolved, &mut visiting)?;
            if classes.insert(class_name.clone(), class).is_err() {
                return Err(LoadError::DuplicateClass {
                    module: name.clone(),
                    name: class_name.clone(),
                });
            }
        }

        Ok(Module {
            name: name.clone(),
            classes,
            functions,
            tape,
        })
    }

    /// Build a tape class after its super chain. `visiting` holds the
    /// classes whose parent is being resolved, so a repeat is a cycle.
    fn resolve_class(
        &self,
        module: &Arc<str>,
        tape: &Tape,
        class_name: &Arc<str>,
        resolved: &mut FxHashMap<Arc<str>, Arc<Class>>,
        visiting: &mut Vec<Arc<str>>,
    ) -> LoadResult<Arc<Class>> {
        if let Some(class) = resolved.get(class_name) {
            return Ok(class.clone());
        }
        if visiting.contains(class_name) {
            return Err(LoadError::InheritanceCycle {
                module: module.clone(),
                class: class_name.clone(),
            });
        }
        let class_ref = tape.class(class_name).ok_or_else(|| LoadError::UnknownClass {
            module: module.clone(),
            name: class_name.clone(),
        })?;
        if class_ref.parents.len() > 1 {
            return Err(LoadError::MultipleInheritance {
                module: module.clone(),
                class: class_name.clone(),
                count: class_ref.parents.len(),
            });
        }

        visiting.push(class_name.clone());
        let super_class = match class_ref.parents.first() {
            Some(parent) => Some(self.resolve_parent(module, tape, class_name, parent, resolved, visiting)?),
            None => self.builtin_class("Object"),
        };
        visiting.pop();

        let mut class = Class::new(class_name.clone(), module.clone(), super_class);
        for (raw, entry) in class_ref.methods.iter() {
            let (method_name, flags) = FunctionFlags::parse_name(raw);
            let method_name = self.strings.intern(method_name);
            let method = Function::bytecode(method_name.clone(), module.clone(), Some(class_name.clone()), *entry, flags);
            if class.functions.insert(method_name.clone(), Arc::new(method)).is_err() {
                return Err(LoadError::DuplicateFunction {
                    module: module.clone(),
                    scope: format!("class '{}'", class_name),
                    name: method_name,
                });
            }
        }

        let class = Arc::new(class);
        resolved.insert(class_name.clone(), class.clone());
        Ok(class)
    }

    /// `other.Class` names a class of another module; a bare name is
    /// looked up in this tape, then in the builtin module.
    fn resolve_parent(
        &self,
        module: &Arc<str>,
        tape: &Tape,
        class_name: &Arc<str>,
        parent: &Arc<str>,
        resolved: &mut FxHashMap<Arc<str>, Arc<Class>>,
        visiting: &mut Vec<Arc<str>>,
    ) -> LoadResult<Arc<Class>> {
        let unknown = || LoadError::UnknownParent {
            module: module.clone(),
            class: class_name.clone(),
            parent: parent.clone(),
        };

        if let Some((owner, name)) = parent.split_once('.') {
            if owner != module.as_ref() {
                return self.module(owner)?.class(name).cloned().ok_or_else(unknown);
            }
            let local = self.strings.intern(name);
            if tape.class(&local).is_some() {
                return self.resolve_class(module, tape, &local, resolved, visiting);
            }
            return Err(unknown());
        }

        if tape.class(parent).is_some() {
            return self.resolve_class(module, tape, parent, resolved, visiting);
        }
        self.builtin_class(parent).ok_or_else(unknown)
    }

    /// Drop the reflection objects cached for a destroyed heap.
    pub fn forget_heap(&self, heap_id: u32) {
        self.reflections.retain(|(heap, _), _| *heap != heap_id);
    }

    fn reflection_class(&self, name: &str) -> VMResult<Arc<Class>> {
        self.builtin_class(name).ok_or_else(|| {
            LoadError::UnknownClass {
                module: self.strings.intern(BUILTIN_MODULE),
                name: self.strings.intern(name),
            }
            .into()
        })
    }

    /// Get or create the reflection object for `key` on `heap`. Returns
    /// the object and whether it was created by this call.
    fn reflect(
        &self,
        heap: &dyn Heap,
        key: ReflectionKey,
        class: &Arc<Class>,
        payload: impl FnOnce() -> NativeObject,
    ) -> VMResult<(ObjectReference, bool)> {
        match self.reflections.entry((heap.id(), key)) {
            Entry::Occupied(entry) => Ok((*entry.get(), false)),
            Entry::Vacant(entry) => {
                let obj = heap.allocate_native(class, payload())?;
                heap.mark_root(obj)?;
                entry.insert(obj);
                Ok((obj, true))
            }
        }
    }

    /// Reflection object of a module on `heap`; created once per heap.
    pub fn reflect_module(&self, heap: &dyn Heap, module: &Arc<Module>) -> VMResult<ObjectReference> {
        let class = self.reflection_class("Module")?;
        let key = ReflectionKey::Module(module.name.clone());
        let (obj, _) = self.reflect(heap, key, &class, || NativeObject::Module(module.clone()))?;
        Ok(obj)
    }

    /// Reflection object of a class, wired as a member of its module's
    /// reflection object.
    pub fn reflect_class(&self, heap: &dyn Heap, class: &Arc<Class>) -> VMResult<ObjectReference> {
        let module = self.module(&class.module)?;
        let owner = self.reflect_module(heap, &module)?;
        let reflection_class = self.reflection_class("Class")?;
        let key = ReflectionKey::Class(class.module.clone(), class.name.clone());
        let (obj, created) = self.reflect(heap, key, &reflection_class, || NativeObject::Class(class.clone()))?;
        if created {
            heap.write(owner, |o| o.set_member(class.name.clone(), Entity::Object(obj)))?;
        }
        Ok(obj)
    }

    /// Reflection object of a function or method, wired into its class's
    /// or module's reflection object.
    pub fn reflect_function(&self, heap: &dyn Heap, function: &Arc<Function>) -> VMResult<ObjectReference> {
        let module = self.module(&function.module)?;
        let owner = match &function.class {
            Some(class_name) => {
                let class = module.class(class_name).ok_or_else(|| LoadError::UnknownClass {
                    module: module.name.clone(),
                    name: class_name.clone(),
                })?;
                self.reflect_class(heap, class)?
            }
            None => self.reflect_module(heap, &module)?,
        };
        let reflection_class = self.reflection_class("Function")?;
        let key = ReflectionKey::Function(function.module.clone(), function.class.clone(), function.name.clone());
        let (obj, created) = self.reflect(heap, key, &reflection_class, || {
            NativeObject::Function(FunctionRef {
                function: function.clone(),
                receiver: None,
            })
        })?;
        if created {
            heap.write(owner, |o| o.set_member(function.name.clone(), Entity::Object(obj)))?;
        }
        Ok(obj)
    }

    pub fn reflection_count(&self) -> usize {
        self.reflections.len()
    }
}

/// Reflection objects are canonical per heap; a copy between heaps lands on
/// the target heap's reflection.
impl SharedObjects for ModuleManager {
    type Error = VMError;

    fn canonical(&self, heap: &dyn Heap, native: &NativeObject) -> VMResult<Option<ObjectReference>> {
        match native {
            NativeObject::Module(module) => self.reflect_module(heap, module).map(Some),
            NativeObject::Class(class) => self.reflect_class(heap, class).map(Some),
            NativeObject::Function(FunctionRef { function, receiver: None }) => {
                self.reflect_function(heap, function).map(Some)
            }
            _ => Ok(None),
        }
    }
}

impl std::fmt::Debug for ModuleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleManager")
            .field("modules", &self.loaded())
            .finish()
    }
}

/// Collects the classes and functions of a native module during its
/// hydration callback.
pub struct ModuleBuilder<'m> {
    manager: &'m ModuleManager,
    name: Arc<str>,
    classes: KeyedList<Arc<Class>>,
    functions: KeyedList<Arc<Function>>,
}

impl<'m> ModuleBuilder<'m> {
    fn new(manager: &'m ModuleManager, name: Arc<str>) -> Self {
        Self {
            manager,
            name,
            classes: KeyedList::new(),
            functions: KeyedList::new(),
        }
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub fn add_function(&mut self, name: &str, body: NativeFn) -> LoadResult<Arc<Function>> {
        let name = self.manager.strings.intern(name);
        let function = Arc::new(Function::native(name.clone(), self.name.clone(), None, body));
        if self.functions.insert(name.clone(), function.clone()).is_err() {
            return Err(LoadError::DuplicateFunction {
                module: self.name.clone(),
                scope: "module scope".to_string(),
                name,
            });
        }
        Ok(function)
    }

    /// Add a class backed by native methods. `parent` resolves among the
    /// classes added so far, then in the builtin module; without one the
    /// class extends builtin `Object`.
    pub fn add_class(
        &mut self,
        name: &str,
        parent: Option<&str>,
        native: Option<NativeKind>,
        methods: &[(&str, NativeFn)],
    ) -> LoadResult<Arc<Class>> {
        let name = self.manager.strings.intern(name);
        if self.classes.contains(&name) {
            return Err(LoadError::DuplicateClass {
                module: self.name.clone(),
                name,
            });
        }
        let super_class = match parent {
            Some(parent) => Some(self.lookup(parent).ok_or_else(|| LoadError::UnknownParent {
                module: self.name.clone(),
                class: name.clone(),
                parent: self.manager.strings.intern(parent),
            })?),
            None if name.as_ref() == "Object" && self.name.as_ref() == BUILTIN_MODULE => None,
            None => self.lookup("Object"),
        };

        let mut class = Class::new(name.clone(), self.name.clone(), super_class);
        class.native = native;
        for (method_name, body) in methods {
            let method_name = self.manager.strings.intern(method_name);
            let method = Function::native(method_name.clone(), self.name.clone(), Some(name.clone()), *body);
            if class.functions.insert(method_name.clone(), Arc::new(method)).is_err() {
                return Err(LoadError::DuplicateFunction {
                    module: self.name.clone(),
                    scope: format!("class '{}'", name),
                    name: method_name,
                });
            }
        }

        let class = Arc::new(class);
        self.classes.set(name, class.clone());
        Ok(class)
    }

    fn lookup(&self, name: &str) -> Option<Arc<Class>> {
        self.classes
            .get(name)
            .cloned()
            .or_else(|| self.manager.builtin_class(name))
    }

    fn finish(self) -> Module {
        Module {
            name: self.name,
            classes: self.classes,
            functions: self.functions,
            tape: Arc::new(Tape::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{parse_text, Instruction, Op};
    use crate::heap::StandardHeap;

    fn manager() -> ModuleManager {
        ModuleManager::new().unwrap()
    }

    fn tape(text: &str) -> Tape {
        parse_text(text).unwrap()
    }

    #[test]
    fn test_builtin_loaded_first() {
        let manager = manager();
        assert_eq!(manager.loaded(), vec![Arc::<str>::from(BUILTIN_MODULE)]);
        let object = manager.builtin_class("Object").unwrap();
        assert!(object.super_class.is_none());
        let string = manager.builtin_class("String").unwrap();
        assert!(string.super_class.as_ref().unwrap().same_as(&object));
        assert_eq!(string.native_kind(), Some(NativeKind::Str));
    }

    #[test]
    fn test_load_hydrates_functions_and_classes() {
        let manager = manager();
        let module = manager
            .load(
                "main",
                tape("@~fetch\nPUSH 1\nRET\nclass A\n@foo\nRET\nendclass\nclass B : A\n@bar\nRET\nendclass\n"),
            )
            .unwrap();
        let fetch = module.function("fetch").unwrap();
        assert!(fetch.is_async());
        assert_eq!(fetch.entry(), Some(0));

        let a = module.class("A").unwrap();
        let b = module.class("B").unwrap();
        assert!(a.super_class.as_ref().unwrap().same_as(&manager.builtin_class("Object").unwrap()));
        assert!(b.is_subclass_of(a));
        assert_eq!(b.find_method("foo").unwrap().entry(), Some(2));
        assert_eq!(module.classes.keys().map(|k| k.as_ref()).collect::<Vec<_>>(), vec!["A", "B"]);
    }

    #[test]
    fn test_parent_declared_after_child() {
        let manager = manager();
        let module = manager
            .load("main", tape("class B : A\nNOP\nendclass\nclass A\nNOP\nendclass\n"))
            .unwrap();
        assert!(module.class("B").unwrap().is_subclass_of(module.class("A").unwrap()));
    }

    #[test]
    fn test_load_dedupes_by_name() {
        let manager = manager();
        let first = manager.load("main", tape("@f\nRET\n")).unwrap();
        let second = manager.load("main", tape("@g\nRET\n")).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(second.function("g").is_none());
    }

    #[test]
    fn test_sigil_collision_is_duplicate_function() {
        let manager = manager();
        let err = manager.load("main", tape("@f\nRET\n@~f\nRET\n")).unwrap_err();
        assert!(matches!(err, LoadError::DuplicateFunction { ref name, .. } if name.as_ref() == "f"));
        assert!(manager.get("main").is_none());
    }

    #[test]
    fn test_inheritance_cycle_rejected() {
        let manager = manager();
        let err = manager
            .load("main", tape("class A : B\nNOP\nendclass\nclass B : A\nNOP\nendclass\n"))
            .unwrap_err();
        assert!(matches!(err, LoadError::InheritanceCycle { .. }));
    }

    #[test]
    fn test_unknown_parent_and_multiple_inheritance() {
        let manager = manager();
        let err = manager.load("a", tape("class A : Missing\nNOP\nendclass\n")).unwrap_err();
        assert!(matches!(err, LoadError::UnknownParent { ref parent, .. } if parent.as_ref() == "Missing"));

        let err = manager
            .load("b", tape("class X\nNOP\nendclass\nclass Y\nNOP\nendclass\nclass Z : X, Y\nNOP\nendclass\n"))
            .unwrap_err();
        assert!(matches!(err, LoadError::MultipleInheritance { count: 2, .. }));
    }

    #[test]
    fn test_cross_module_and_builtin_parents() {
        let manager = manager();
        manager.load("shapes", tape("class Shape\n@area\nRET\nendclass\n")).unwrap();
        let main = manager
            .load("main", tape("class Square : shapes.Shape\nNOP\nendclass\nclass Oops : Error\nNOP\nendclass\n"))
            .unwrap();
        let square = main.class("Square").unwrap();
        assert_eq!(square.find_method("area").unwrap().module.as_ref(), "shapes");
        assert_eq!(main.class("Oops").unwrap().native_kind(), Some(NativeKind::Error));
    }

    #[test]
    fn test_malformed_tape() {
        let manager = manager();
        let mut bad = Tape::new();
        bad.begin_class("A", Vec::new()).unwrap();
        bad.append(Instruction::new(Op::Nop));
        let err = manager.load("main", bad).unwrap_err();
        assert!(matches!(err, LoadError::MalformedTape { .. }));
    }

    #[test]
    fn test_unknown_module() {
        let manager = manager();
        assert_eq!(manager.module("net").unwrap_err(), LoadError::UnknownModule("net".into()));
    }

    fn native_math(builder: &mut ModuleBuilder<'_>) -> LoadResult<()> {
        builder.add_function("identity", |_, arg| Ok(arg))?;
        builder.add_class("Vector", None, Some(NativeKind::Array), &[])?;
        Ok(())
    }

    #[test]
    fn test_native_module_loaded_lazily() {
        let manager = manager();
        manager.register_native("math", native_math);
        assert!(manager.get("math").is_none());
        let math = manager.module("math").unwrap();
        assert!(math.function("identity").unwrap().is_native());
        assert!(math.class("Vector").unwrap().super_class.is_some());
        assert!(Arc::ptr_eq(&math, &manager.module("math").unwrap()));
    }

    fn duplicate_native(builder: &mut ModuleBuilder<'_>) -> LoadResult<()> {
        builder.add_function("f", |_, arg| Ok(arg))?;
        builder.add_function("f", |_, arg| Ok(arg))?;
        Ok(())
    }

    #[test]
    fn test_native_duplicate_is_fatal() {
        let manager = manager();
        manager.register_native("dup", duplicate_native);
        assert!(matches!(manager.module("dup"), Err(LoadError::DuplicateFunction { .. })));
        assert!(manager.get("dup").is_none());
    }

    #[test]
    fn test_reflection_cached_per_heap_and_wired() {
        let manager = manager();
        let module = manager.load("main", tape("@f\nRET\nclass A\n@m\nRET\nendclass\n")).unwrap();
        let one = StandardHeap::new(1);
        let two = StandardHeap::new(2);

        let f = module.function("f").unwrap();
        let reflected = manager.reflect_function(&one, f).unwrap();
        assert_eq!(manager.reflect_function(&one, f).unwrap(), reflected);
        let module_obj = manager.reflect_module(&one, &module).unwrap();
        assert_eq!(one.read(module_obj, |o| o.member("f")).unwrap(), Some(Entity::Object(reflected)));

        let method = module.class("A").unwrap().functions.get("m").unwrap();
        let method_obj = manager.reflect_function(&one, method).unwrap();
        let class_obj = manager.reflect_class(&one, module.class("A").unwrap()).unwrap();
        assert_eq!(one.read(class_obj, |o| o.member("m")).unwrap(), Some(Entity::Object(method_obj)));
        assert_eq!(one.read(module_obj, |o| o.member("A")).unwrap(), Some(Entity::Object(class_obj)));

        let other = manager.reflect_module(&two, &module).unwrap();
        assert_eq!(other.heap_id(), 2);

        let before = manager.reflection_count();
        manager.forget_heap(1);
        assert_eq!(manager.reflection_count(), before - 4);
    }
}
