use std::sync::Arc;
use crate::bytecode::Tape;
use crate::entity::{Class, Function};
use crate::utils::KeyedList;

/// A hydrated module. The module manager keeps at most one per name.
#[derive(Debug)]
pub struct Module {
    pub name: Arc<str>,
    pub classes: KeyedList<Arc<Class>>,
    pub functions: KeyedList<Arc<Function>>,
    pub tape: Arc<Tape>,
}

impl Module {
    pub fn class(&self, name: &str) -> Option<&Arc<Class>> {
        self.classes.get(name)
    }

    pub fn function(&self, name: &str) -> Option<&Arc<Function>> {
        self.functions.get(name)
    }

    /// Whether any function or method runs bytecode from this module's tape.
    pub fn has_code(&self) -> bool {
        !self.tape.is_empty()
    }
}
