//! Execution engine: module manager, processes, tasks and the interpreter.

mod builtins;
mod error;
mod execution_context;
mod interpreter;
mod locks;
mod module_manager;
mod process;
mod scheduler;
mod task;
mod thread;

pub use error::{LoadError, LoadResult, VMError, VMResult};
pub use execution_context::{CatchHandler, Context, ReturnMode, MODULE_FRAME};
pub use interpreter::VM;
pub use locks::LockTable;
pub use module_manager::{ModuleBuilder, ModuleManager, NativeModuleFn, BUILTIN_MODULE};
pub use process::Process;
pub use task::{FutureSlot, Task, TaskState};
pub use thread::{ThreadState, VMThread};
