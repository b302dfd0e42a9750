//! Interpreter for compiled code objects.

pub mod builtins;
pub mod frame;
mod interpreter;
mod ops;
pub mod value;

pub use interpreter::{compare_op_of, HaltReason, Interpreter, ModuleTable, Unwind, VmLimits};
