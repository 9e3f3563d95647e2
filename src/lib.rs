// tapevm - tape bytecode, class-based object model and a multi-process VM

pub mod bytecode;
pub mod entity;
pub mod heap;
pub mod vm;
pub mod runtime;
pub mod utils;

pub use bytecode::{Instruction, Op, Tape};
pub use entity::Entity;
pub use heap::{Heap, ObjectReference, StandardHeap};
pub use vm::{ModuleManager, Process, Task, TaskState, VM};
pub use runtime::Runtime;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
