use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;
use crate::entity::Entity;
use crate::heap::Heap;
use crate::vm::{ModuleManager, VMResult};

/// Function attribute bits.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct FunctionFlags(u8);

impl FunctionFlags {
    pub const NONE: FunctionFlags = FunctionFlags(0);
    pub const NATIVE: FunctionFlags = FunctionFlags(1);
    pub const ANONYMOUS: FunctionFlags = FunctionFlags(1 << 1);
    pub const CONST: FunctionFlags = FunctionFlags(1 << 2);
    pub const ASYNC: FunctionFlags = FunctionFlags(1 << 3);
    pub const BACKGROUND: FunctionFlags = FunctionFlags(1 << 4);

    pub fn contains(&self, other: FunctionFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: FunctionFlags) {
        self.0 |= other.0;
    }

    /// Split the flag sigils off a tape-level function name.
    ///
    /// `~` async, `&` background, `!` const, `$` anonymous.
    pub fn parse_name(raw: &str) -> (&str, FunctionFlags) {
        let mut flags = FunctionFlags::NONE;
        let mut name = raw;
        while let Some(c) = name.chars().next() {
            let flag = match c {
                '~' => FunctionFlags::ASYNC,
                '&' => FunctionFlags::BACKGROUND,
                '!' => FunctionFlags::CONST,
                '$' => FunctionFlags::ANONYMOUS,
                _ => break,
            };
            flags.insert(flag);
            name = &name[1..];
        }
        (name, flags)
    }
}

impl BitOr for FunctionFlags {
    type Output = FunctionFlags;

    fn bitor(self, rhs: FunctionFlags) -> FunctionFlags {
        FunctionFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for FunctionFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (FunctionFlags::NATIVE, "native"),
            (FunctionFlags::ANONYMOUS, "anonymous"),
            (FunctionFlags::CONST, "const"),
            (FunctionFlags::ASYNC, "async"),
            (FunctionFlags::BACKGROUND, "background"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "FunctionFlags({})", set.join(" | "))
    }
}

/// What a native function body can reach.
pub struct NativeCall<'a> {
    pub heap: &'a dyn Heap,
    pub modules: &'a ModuleManager,
    /// Bound receiver for methods, `Entity::None` otherwise.
    pub receiver: Entity,
}

pub type NativeFn = fn(&NativeCall<'_>, Entity) -> VMResult<Entity>;

#[derive(Clone, Copy)]
pub enum FunctionBody {
    Bytecode { entry: usize },
    Native(NativeFn),
}

impl fmt::Debug for FunctionBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunctionBody::Bytecode { entry } => write!(f, "Bytecode {{ entry: {} }}", entry),
            FunctionBody::Native(_) => write!(f, "Native"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: Arc<str>,
    pub module: Arc<str>,
    pub class: Option<Arc<str>>,
    pub body: FunctionBody,
    pub flags: FunctionFlags,
}

impl Function {
    pub fn bytecode(
        name: Arc<str>,
        module: Arc<str>,
        class: Option<Arc<str>>,
        entry: usize,
        flags: FunctionFlags,
    ) -> Self {
        Self {
            name,
            module,
            class,
            body: FunctionBody::Bytecode { entry },
            flags,
        }
    }

    pub fn native(name: Arc<str>, module: Arc<str>, class: Option<Arc<str>>, body: NativeFn) -> Self {
        Self {
            name,
            module,
            class,
            body: FunctionBody::Native(body),
            flags: FunctionFlags::NATIVE,
        }
    }

    pub fn entry(&self) -> Option<usize> {
        match self.body {
            FunctionBody::Bytecode { entry } => Some(entry),
            FunctionBody::Native(_) => None,
        }
    }

    pub fn is_native(&self) -> bool {
        self.flags.contains(FunctionFlags::NATIVE)
    }

    pub fn is_async(&self) -> bool {
        self.flags.contains(FunctionFlags::ASYNC)
    }

    pub fn is_background(&self) -> bool {
        self.flags.contains(FunctionFlags::BACKGROUND)
    }

    /// `module.name` or `module.Class.name`
    pub fn qualified_name(&self) -> String {
        match &self.class {
            Some(class) => format!("{}.{}.{}", self.module, class, self.name),
            None => format!("{}.{}", self.module, self.name),
        }
    }

    /// Identity: same owner path and same name.
    pub fn same_as(&self, other: &Function) -> bool {
        self.name == other.name && self.module == other.module && self.class == other.class
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_name_strips_sigils() {
        assert_eq!(FunctionFlags::parse_name("main"), ("main", FunctionFlags::NONE));
        assert_eq!(FunctionFlags::parse_name("~fetch"), ("fetch", FunctionFlags::ASYNC));
        let (name, flags) = FunctionFlags::parse_name("!$&worker");
        assert_eq!(name, "worker");
        assert!(flags.contains(FunctionFlags::CONST));
        assert!(flags.contains(FunctionFlags::ANONYMOUS));
        assert!(flags.contains(FunctionFlags::BACKGROUND));
        assert!(!flags.contains(FunctionFlags::ASYNC));
    }

    #[test]
    fn test_flags_debug() {
        let flags = FunctionFlags::NATIVE | FunctionFlags::CONST;
        assert_eq!(format!("{:?}", flags), "FunctionFlags(native | const)");
    }

    #[test]
    fn test_qualified_name_and_identity() {
        let method = Function::bytecode("foo".into(), "main".into(), Some("A".into()), 3, FunctionFlags::NONE);
        let free = Function::bytecode("foo".into(), "main".into(), None, 3, FunctionFlags::NONE);
        assert_eq!(method.qualified_name(), "main.A.foo");
        assert_eq!(free.qualified_name(), "main.foo");
        assert!(!method.same_as(&free));
        assert_eq!(method.entry(), Some(3));
        assert!(!method.is_native());
    }

    #[test]
    fn test_native_function() {
        fn identity(_call: &NativeCall<'_>, arg: Entity) -> VMResult<Entity> {
            Ok(arg)
        }
        let f = Function::native("id".into(), "builtin".into(), None, identity);
        assert!(f.is_native());
        assert_eq!(f.entry(), None);
    }
}
