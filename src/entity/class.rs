use std::sync::Arc;
use crate::entity::{Function, NativeKind};
use crate::utils::KeyedList;

/// A class. Immutable once its module is hydrated; the super chain is a
/// tree because hydration rejects cycles.
#[derive(Debug)]
pub struct Class {
    pub name: Arc<str>,
    pub module: Arc<str>,
    pub super_class: Option<Arc<Class>>,
    pub functions: KeyedList<Arc<Function>>,
    pub native: Option<NativeKind>,
}

impl Class {
    pub fn new(name: Arc<str>, module: Arc<str>, super_class: Option<Arc<Class>>) -> Self {
        Self {
            name,
            module,
            super_class,
            functions: KeyedList::new(),
            native: None,
        }
    }

    pub fn with_native(mut self, native: NativeKind) -> Self {
        self.native = Some(native);
        self
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.module, self.name)
    }

    pub fn same_as(&self, other: &Class) -> bool {
        self.name == other.name && self.module == other.module
    }

    /// This class followed by its super chain.
    pub fn ancestors(&self) -> impl Iterator<Item = &Class> {
        std::iter::successors(Some(self), |class| class.super_class.as_deref())
    }

    /// Method lookup through the super chain.
    pub fn find_method(&self, name: &str) -> Option<&Arc<Function>> {
        self.ancestors().find_map(|class| class.functions.get(name))
    }

    pub fn is_subclass_of(&self, other: &Class) -> bool {
        self.ancestors().any(|class| class.same_as(other))
    }

    /// Native payload kind, inherited from the nearest native ancestor.
    pub fn native_kind(&self) -> Option<NativeKind> {
        self.ancestors().find_map(|class| class.native)
    }
}
