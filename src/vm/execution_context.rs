use std::sync::Arc;
use rustc_hash::FxHashMap;
use crate::bytecode::{Instruction, SourceMapping};
use crate::entity::{Entity, Module, StackLine};
use crate::heap::ObjectReference;
use crate::vm::{VMError, VMResult};

/// Name used for a module's top-level frame in stacktraces
pub const MODULE_FRAME: &str = "<module>";

/// An installed `CTCH` handler
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CatchHandler {
    /// Absolute instruction index to resume at
    pub target: usize,
    /// Value stack depth when the handler was installed
    pub stack_depth: usize,
}

/// What the caller receives when this frame returns
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReturnMode {
    Value,
    /// Constructor frame: the caller gets the new instance
    Construct(ObjectReference),
}

/// One call frame: value stack, locals and a pc into a module's tape.
#[derive(Debug)]
pub struct Context {
    module: Arc<Module>,
    function: Arc<str>,
    pc: usize,
    stack: Vec<Entity>,
    locals: FxHashMap<Arc<str>, Entity>,
    handlers: Vec<CatchHandler>,
    mode: ReturnMode,
}

impl Context {
    pub fn new(module: Arc<Module>, function: Arc<str>, entry: usize) -> Self {
        Self {
            module,
            function,
            pc: entry,
            stack: Vec::with_capacity(16),
            locals: FxHashMap::default(),
            handlers: Vec::new(),
            mode: ReturnMode::Value,
        }
    }

    /// Top-level frame of a module, starting at instruction 0
    pub fn for_module(module: Arc<Module>) -> Self {
        Self::new(module, Arc::from(MODULE_FRAME), 0)
    }

    /// Callee frame: the argument starts on the stack, the receiver is `self`
    pub fn call(module: Arc<Module>, function: Arc<str>, entry: usize, arg: Entity, receiver: Option<Entity>) -> Self {
        let mut context = Self::new(module, function, entry);
        context.stack.push(arg);
        if let Some(receiver) = receiver {
            context.define_local(Arc::from("self"), receiver);
        }
        context
    }

    pub fn with_mode(mut self, mode: ReturnMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn module(&self) -> &Arc<Module> {
        &self.module
    }

    pub fn function(&self) -> &Arc<str> {
        &self.function
    }

    pub fn mode(&self) -> ReturnMode {
        self.mode
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn set_pc(&mut self, pc: usize) {
        self.pc = pc;
    }

    /// Move the pc by a signed offset from `origin`.
    pub fn jump_relative(&mut self, origin: usize, offset: i64) -> VMResult<()> {
        let target = origin as i64 + offset;
        if target < 0 || target as usize > self.module.tape.len() {
            return Err(VMError::InvalidProgramCounter(target));
        }
        self.pc = target as usize;
        Ok(())
    }

    pub fn jump_absolute(&mut self, target: i64) -> VMResult<()> {
        if target < 0 || target as usize > self.module.tape.len() {
            return Err(VMError::InvalidProgramCounter(target));
        }
        self.pc = target as usize;
        Ok(())
    }

    /// Instruction at the pc; `None` once the pc runs off the tape.
    pub fn current_instruction(&self) -> Option<&Instruction> {
        self.module.tape.instruction(self.pc)
    }

    pub fn is_at_end(&self) -> bool {
        self.pc == self.module.tape.len()
    }

    pub fn push(&mut self, value: Entity) {
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> VMResult<Entity> {
        self.stack.pop().ok_or(VMError::StackUnderflow)
    }

    pub fn pop_or_none(&mut self) -> Entity {
        self.stack.pop().unwrap_or_default()
    }

    /// Pop the top `count` values, oldest first.
    pub fn pop_n(&mut self, count: usize) -> VMResult<Vec<Entity>> {
        let start = self.stack.len().checked_sub(count).ok_or(VMError::StackUnderflow)?;
        Ok(self.stack.split_off(start))
    }

    /// Value `depth` slots below the top (0 is the top)
    pub fn peek(&self, depth: usize) -> VMResult<Entity> {
        self.stack
            .len()
            .checked_sub(depth + 1)
            .and_then(|index| self.stack.get(index))
            .copied()
            .ok_or(VMError::StackUnderflow)
    }

    pub fn stack(&self) -> &[Entity] {
        &self.stack
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    pub fn truncate_stack(&mut self, depth: usize) {
        self.stack.truncate(depth);
    }

    pub fn local(&self, name: &str) -> Option<Entity> {
        self.locals.get(name).copied()
    }

    pub fn define_local(&mut self, name: Arc<str>, value: Entity) {
        self.locals.insert(name, value);
    }

    pub fn set_local(&mut self, name: &Arc<str>, value: Entity) -> VMResult<()> {
        match self.locals.get_mut(&**name) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(VMError::VariableNotFound(name.clone())),
        }
    }

    pub fn push_handler(&mut self, target: usize) {
        let stack_depth = self.stack.len();
        self.handlers.push(CatchHandler { target, stack_depth });
    }

    pub fn pop_handler(&mut self) -> Option<CatchHandler> {
        self.handlers.pop()
    }

    /// Object references held by this frame (stack, locals and the
    /// instance under construction)
    pub fn roots(&self) -> impl Iterator<Item = ObjectReference> + '_ {
        let constructing = match self.mode {
            ReturnMode::Construct(instance) => Some(instance),
            ReturnMode::Value => None,
        };
        self.stack
            .iter()
            .chain(self.locals.values())
            .filter_map(Entity::as_object)
            .chain(constructing)
    }

    /// Stacktrace line for this frame. The pc has already moved past the
    /// instruction being executed, so the mapping of `pc - 1` is reported.
    pub fn stack_line(&self) -> StackLine {
        let source = match self.pc.checked_sub(1) {
            Some(index) => self.module.tape.source(index),
            None => SourceMapping::NONE,
        };
        StackLine {
            module: self.module.name.clone(),
            function: self.function.clone(),
            source,
        }
    }
}
