use std::sync::Arc;
use thiserror::Error;
use crate::bytecode::{Op, TapeError};
use crate::entity::{ArithmeticError, Exception};
use crate::heap::{HeapError, ObjectReference};
use crate::vm::ThreadState;

/// Failures while loading or hydrating a module. Always fatal for the module.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoadError {
    #[error("Module '{module}': class '{name}' is already defined")]
    DuplicateClass { module: Arc<str>, name: Arc<str> },

    #[error("Module '{module}': function '{name}' is already defined in {scope}")]
    DuplicateFunction { module: Arc<str>, scope: String, name: Arc<str> },

    #[error("Unknown module '{0}'")]
    UnknownModule(Arc<str>),

    #[error("Module '{module}': unknown class '{name}'")]
    UnknownClass { module: Arc<str>, name: Arc<str> },

    #[error("Module '{module}': class '{class}' has unknown parent '{parent}'")]
    UnknownParent { module: Arc<str>, class: Arc<str>, parent: Arc<str> },

    #[error("Module '{module}': inheritance cycle through class '{class}'")]
    InheritanceCycle { module: Arc<str>, class: Arc<str> },

    #[error("Module '{module}': class '{class}' lists {count} parents, only single inheritance is supported")]
    MultipleInheritance { module: Arc<str>, class: Arc<str>, count: usize },

    #[error("Module '{module}': malformed tape: {source}")]
    MalformedTape { module: Arc<str>, source: TapeError },
}

pub type LoadResult<T> = Result<T, LoadError>;

/// Error type for VM operations
#[derive(Error, Debug)]
pub enum VMError {
    #[error("Stack underflow")]
    StackUnderflow,

    #[error("Invalid program counter: {0}")]
    InvalidProgramCounter(i64),

    #[error("{0:?} requires an operand")]
    MissingOperand(Op),

    #[error("{op:?} expects {expected} operand")]
    InvalidOperand { op: Op, expected: &'static str },

    #[error("Type error: {0}")]
    TypeError(String),

    #[error("Arithmetic error: {0}")]
    Arithmetic(#[from] ArithmeticError),

    #[error("Variable '{0}' not found")]
    VariableNotFound(Arc<str>),

    #[error("Member '{member}' not found on {owner}")]
    MemberNotFound { owner: String, member: Arc<str> },

    #[error("Method '{method}' not found on {owner}")]
    MethodNotFound { owner: String, method: Arc<str> },

    #[error("Key '{0}' not found in named list")]
    KeyNotFound(Arc<str>),

    #[error("Value of type {0} is not callable")]
    NotCallable(String),

    #[error("Index {index} out of bounds for length {len}")]
    IndexOutOfBounds { index: i64, len: usize },

    #[error("Stack overflow: call depth exceeded {0}")]
    StackOverflow(usize),

    #[error("Lock on {0} is not held by this thread")]
    LockNotHeld(ObjectReference),

    #[error("Illegal thread state transition {from:?} -> {to:?}")]
    IllegalTransition { from: ThreadState, to: ThreadState },

    #[error("Process {0} not found")]
    ProcessNotFound(u32),

    #[error("Deadlock: {0} tasks waiting with none runnable")]
    Deadlock(usize),

    #[error("Uncaught exception: {0}")]
    Uncaught(Exception),

    #[error("Heap error: {0}")]
    Heap(#[from] HeapError),

    #[error("Load error: {0}")]
    Load(#[from] LoadError),

    #[error("{0}")]
    Native(String),
}

impl VMError {
    /// Errors that signal a broken VM or tape rather than a program fault;
    /// these fail the task instead of being raised into it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VMError::InvalidProgramCounter(_)
                | VMError::IllegalTransition { .. }
                | VMError::ProcessNotFound(_)
        )
    }
}

/// Result type for VM operations
pub type VMResult<T> = Result<T, VMError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_error_display() {
        assert_eq!(VMError::StackUnderflow.to_string(), "Stack underflow");
        assert_eq!(VMError::InvalidProgramCounter(42).to_string(), "Invalid program counter: 42");
        assert_eq!(VMError::MissingOperand(Op::Let).to_string(), "Let requires an operand");
        assert_eq!(
            VMError::VariableNotFound("x".into()).to_string(),
            "Variable 'x' not found"
        );
        assert_eq!(
            VMError::IndexOutOfBounds { index: 5, len: 2 }.to_string(),
            "Index 5 out of bounds for length 2"
        );
    }

    #[test]
    fn test_arithmetic_conversion() {
        let err: VMError = ArithmeticError::DivisionByZero.into();
        assert!(matches!(err, VMError::Arithmetic(ArithmeticError::DivisionByZero)));
        assert_eq!(err.to_string(), "Arithmetic error: Division by zero");
    }

    #[test]
    fn test_heap_and_load_conversion() {
        let reference = ObjectReference::new(1, 1);
        let err: VMError = HeapError::InvalidReference(reference).into();
        assert!(matches!(err, VMError::Heap(_)));

        let err: VMError = LoadError::UnknownModule("io".into()).into();
        assert_eq!(err.to_string(), "Load error: Unknown module 'io'");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(VMError::InvalidProgramCounter(-1).is_fatal());
        assert!(VMError::IllegalTransition { from: ThreadState::New, to: ThreadState::Terminated }.is_fatal());
        assert!(!VMError::StackUnderflow.is_fatal());
        assert!(!VMError::TypeError("x".into()).is_fatal());
    }

    #[test]
    fn test_load_error_context() {
        let err = LoadError::InheritanceCycle { module: "main".into(), class: "A".into() };
        assert_eq!(err.to_string(), "Module 'main': inheritance cycle through class 'A'");
    }
}
