//! Runtime value and type model.

mod class;
mod exception;
mod function;
mod module;
mod object;
mod primitive;
mod value;

pub use class::Class;
pub use exception::{Exception, StackLine};
pub use function::{Function, FunctionBody, FunctionFlags, NativeCall, NativeFn};
pub use module::Module;
pub use object::{FunctionRef, NativeKind, NativeObject, Object};
pub use primitive::{ArithmeticError, Primitive, PrimitiveType};
pub use value::Entity;
