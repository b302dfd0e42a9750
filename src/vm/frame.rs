use super::value::{Cell, Namespace, Value};
use crate::bytecode::{CodeObject, FrameId, Name};
use std::collections::HashMap;
use std::sync::Arc;

/// An installed exception handler.
#[derive(Debug, Clone, Copy)]
pub struct Handler {
    pub target: usize,
    /// Stack depth to restore before entering the handler.
    pub depth: usize,
    /// Number of exceptions being handled when the block was set up.
    pub handled: usize,
}

/// Activation record of one code object.
#[derive(Debug)]
pub struct Frame {
    pub id: FrameId,
    pub code: Arc<CodeObject>,
    pub pc: usize,
    pub stack: Vec<Value>,
    pub locals: HashMap<Name, Value>,
    pub cells: HashMap<Name, Cell>,
    pub globals: Namespace,
    /// Target of `LOAD_NAME`/`STORE_NAME`: the globals for module code, the
    /// class namespace for class bodies.
    pub names: Namespace,
    pub handlers: Vec<Handler>,
    /// Exceptions currently being handled, innermost last.
    pub handled: Vec<Value>,
}

impl Frame {
    pub fn new(id: FrameId, code: Arc<CodeObject>, globals: Namespace, names: Namespace) -> Self {
        Self {
            id,
            code,
            pc: 0,
            stack: Vec::new(),
            locals: HashMap::new(),
            cells: HashMap::new(),
            globals,
            names,
            handlers: Vec::new(),
            handled: Vec::new(),
        }
    }
}
