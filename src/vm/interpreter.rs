use super::builtins;
use super::frame::{Frame, Handler};
use super::ops;
use super::value::{
    BoundMethod, Class, ExceptionKind, Function, GeneratorState, Instance, IteratorState,
    ModuleObject, Namespace, Shared, Value, new_namespace,
};
use crate::bytecode::{AccessProbe, CodeObject, CompareOp, Constant, Name, Op, Opcode, Probe, ProbeSite};
use crate::tracer::{AttributeAccess, ExecutionTracer, InstructionDetail, MemoryAccess};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

const MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Why execution stopped without an exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    Cancelled,
    InstructionLimit,
}

/// Abnormal exit from a frame.
#[derive(Debug, Clone)]
pub enum Unwind {
    /// An exception value propagating to the caller.
    Raise(Value),
    /// Execution must stop entirely.
    Halt(HaltReason),
}

impl Unwind {
    pub fn raise(kind: ExceptionKind, message: impl Into<String>) -> Self {
        Unwind::Raise(Value::exception(kind, message))
    }
}

fn internal(message: &str) -> Unwind {
    Unwind::raise(ExceptionKind::RuntimeError, format!("internal VM error: {}", message))
}

#[derive(Debug)]
pub enum FrameExit {
    Return(Value),
    Yield(Value),
}

enum Flow {
    Next,
    Return(Value),
    Yield(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmLimits {
    pub max_depth: usize,
    pub max_instructions: u64,
}

impl Default for VmLimits {
    fn default() -> Self {
        Self {
            max_depth: 100,
            max_instructions: 1_000_000,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ModuleEntry {
    /// Compiled but not yet executed.
    Source(Arc<CodeObject>),
    Loaded(Value),
}

/// Importable modules, shared by every interpreter of a run.
#[derive(Debug, Default)]
pub struct ModuleTable {
    entries: Mutex<HashMap<String, ModuleEntry>>,
}

impl ModuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, code: Arc<CodeObject>) {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(name.to_string(), ModuleEntry::Source(code));
    }

    pub fn entry(&self, name: &str) -> Option<ModuleEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned()
    }

    pub fn loaded(&self, name: &str) -> Option<Value> {
        match self.entry(name) {
            Some(ModuleEntry::Loaded(v)) => Some(v),
            _ => None,
        }
    }

    fn set(&self, name: &str, entry: ModuleEntry) {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(name.to_string(), entry);
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

pub struct Interpreter {
    tracer: Arc<ExecutionTracer>,
    modules: Arc<ModuleTable>,
    builtins: Namespace,
    cancel: Arc<AtomicBool>,
    limits: VmLimits,
    depth: usize,
    steps: u64,
    output: String,
}

impl Interpreter {
    pub fn new(
        tracer: Arc<ExecutionTracer>,
        modules: Arc<ModuleTable>,
        limits: VmLimits,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            tracer,
            modules,
            builtins: builtins::namespace(),
            cancel,
            limits,
            depth: 0,
            steps: 0,
            output: String::new(),
        }
    }

    /// Captured `print` output.
    pub fn output(&self) -> &str {
        &self.output
    }

    pub(crate) fn write_output(&mut self, line: &str) {
        if self.output.len() + line.len() < MAX_OUTPUT_BYTES {
            self.output.push_str(line);
            self.output.push('\n');
        }
    }

    /// Run top-level code with `namespace` as both globals and names.
    pub fn run_code(&mut self, code: Arc<CodeObject>, namespace: &Namespace) -> Result<Value, Unwind> {
        let mut frame = Frame::new(
            self.tracer.next_frame_id(),
            code,
            namespace.clone(),
            namespace.clone(),
        );
        match self.run_nested(&mut frame)? {
            FrameExit::Return(v) => Ok(v),
            FrameExit::Yield(_) => Err(Unwind::raise(
                ExceptionKind::RuntimeError,
                "'yield' outside function",
            )),
        }
    }

    /// Import `name` through the module table.
    pub fn import(&mut self, name: &str) -> Result<Value, Unwind> {
        match self.modules.entry(name) {
            Some(ModuleEntry::Loaded(module)) => Ok(module),
            Some(ModuleEntry::Source(code)) => {
                let globals = new_namespace();
                let module = Value::Module(Arc::new(ModuleObject {
                    name: name.to_string(),
                    globals: globals.clone(),
                }));
                // Visible while the body runs so circular imports terminate.
                self.modules.set(name, ModuleEntry::Loaded(module.clone()));
                match self.run_code(Arc::clone(&code), &globals) {
                    Ok(_) => Ok(module),
                    Err(err) => {
                        self.modules.set(name, ModuleEntry::Source(code));
                        Err(err)
                    }
                }
            }
            None => Err(Unwind::raise(
                ExceptionKind::ImportError,
                format!("No module named '{}'", name),
            )),
        }
    }

    fn tick(&mut self) -> Result<(), Unwind> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(Unwind::Halt(HaltReason::Cancelled));
        }
        self.steps += 1;
        if self.steps > self.limits.max_instructions {
            return Err(Unwind::Halt(HaltReason::InstructionLimit));
        }
        Ok(())
    }

    fn run_nested(&mut self, frame: &mut Frame) -> Result<FrameExit, Unwind> {
        if self.depth >= self.limits.max_depth {
            return Err(Unwind::raise(
                ExceptionKind::RecursionError,
                "maximum recursion depth exceeded",
            ));
        }
        self.depth += 1;
        let result = self.run_frame(frame);
        self.depth -= 1;
        result
    }

    fn run_frame(&mut self, frame: &mut Frame) -> Result<FrameExit, Unwind> {
        let code = Arc::clone(&frame.code);
        loop {
            self.tick()?;
            let Some(instr) = code.instructions.get(frame.pc) else {
                return Err(internal("execution ran past the last instruction"));
            };
            frame.pc += 1;
            match self.step(frame, &instr.op) {
                Ok(Flow::Next) => {}
                Ok(Flow::Return(v)) => return Ok(FrameExit::Return(v)),
                Ok(Flow::Yield(v)) => return Ok(FrameExit::Yield(v)),
                Err(Unwind::Raise(exc)) => match frame.handlers.pop() {
                    Some(handler) => {
                        frame.stack.truncate(handler.depth);
                        frame.handled.truncate(handler.handled);
                        frame.handled.push(exc.clone());
                        frame.stack.push(exc);
                        frame.pc = handler.target;
                    }
                    None => return Err(Unwind::Raise(exc)),
                },
                Err(halt) => return Err(halt),
            }
        }
    }

    fn step(&mut self, frame: &mut Frame, op: &Op) -> Result<Flow, Unwind> {
        match op {
            Op::Nop => {}
            Op::PopTop => {
                pop(frame)?;
            }
            Op::RotTwo => {
                let a = pop(frame)?;
                let b = pop(frame)?;
                frame.stack.push(a);
                frame.stack.push(b);
            }
            Op::RotThree => {
                let z = pop(frame)?;
                let y = pop(frame)?;
                let x = pop(frame)?;
                frame.stack.push(z);
                frame.stack.push(x);
                frame.stack.push(y);
            }
            Op::DupTop => {
                let top = peek(frame)?.clone();
                frame.stack.push(top);
            }
            Op::DupTopTwo => {
                let len = frame.stack.len();
                if len < 2 {
                    return Err(internal("stack underflow"));
                }
                let pair = frame.stack[len - 2..].to_vec();
                frame.stack.extend(pair);
            }
            Op::LoadConst(constant) => frame.stack.push(constant_value(constant)),
            Op::LoadFast(name) => {
                let value = frame.locals.get(name).cloned().ok_or_else(|| {
                    Unwind::raise(
                        ExceptionKind::NameError,
                        format!("local variable '{}' referenced before assignment", name),
                    )
                })?;
                frame.stack.push(value);
            }
            Op::StoreFast(name) => {
                let value = pop(frame)?;
                frame.locals.insert(name.clone(), value);
            }
            Op::DeleteFast(name) => {
                if frame.locals.remove(name).is_none() {
                    return Err(name_error(name));
                }
            }
            Op::LoadGlobal(name) => {
                let value = self.lookup(&[&frame.globals], name)?;
                frame.stack.push(value);
            }
            Op::StoreGlobal(name) => {
                let value = pop(frame)?;
                frame.globals.lock().insert(name.clone(), value);
            }
            Op::LoadName(name) => {
                let value = self.lookup(&[&frame.names, &frame.globals], name)?;
                frame.stack.push(value);
            }
            Op::StoreName(name) => {
                let value = pop(frame)?;
                frame.names.lock().insert(name.clone(), value);
            }
            Op::LoadDeref(name) => {
                let cell = frame
                    .cells
                    .get(name)
                    .ok_or_else(|| internal("missing cell"))?;
                let value = cell.lock().clone().ok_or_else(|| {
                    Unwind::raise(
                        ExceptionKind::NameError,
                        format!("free variable '{}' referenced before assignment", name),
                    )
                })?;
                frame.stack.push(value);
            }
            Op::StoreDeref(name) => {
                let value = pop(frame)?;
                let cell = frame
                    .cells
                    .get(name)
                    .ok_or_else(|| internal("missing cell"))?;
                *cell.lock() = Some(value);
            }
            Op::LoadClosure(name) => {
                let cell = frame
                    .cells
                    .get(name)
                    .cloned()
                    .ok_or_else(|| internal("missing cell"))?;
                frame.stack.push(Value::Cell(cell));
            }
            Op::LoadAttr(name) => {
                let owner = pop(frame)?;
                let value = self.get_attr(&owner, name)?;
                frame.stack.push(value);
            }
            Op::StoreAttr(name) => {
                let owner = pop(frame)?;
                let value = pop(frame)?;
                set_attr(&owner, name, value)?;
            }
            Op::BinarySubscr => {
                let index = pop(frame)?;
                let container = pop(frame)?;
                frame.stack.push(builtins::subscript(&container, &index)?);
            }
            Op::StoreSubscr => {
                let index = pop(frame)?;
                let container = pop(frame)?;
                let value = pop(frame)?;
                builtins::store_subscript(&container, &index, value)?;
            }
            Op::Binary(op) => {
                let r = pop(frame)?;
                let l = pop(frame)?;
                frame.stack.push(ops::binary(*op, &l, &r)?);
            }
            Op::Unary(op) => {
                let v = pop(frame)?;
                frame.stack.push(ops::unary(*op, &v)?);
            }
            Op::Compare(op) => {
                let r = pop(frame)?;
                let l = pop(frame)?;
                frame.stack.push(Value::Bool(ops::compare(*op, &l, &r)?));
            }
            Op::IsOp { invert } => {
                let r = pop(frame)?;
                let l = pop(frame)?;
                frame.stack.push(Value::Bool(l.is_same(&r) != *invert));
            }
            Op::ContainsOp { invert } => {
                let container = pop(frame)?;
                let item = pop(frame)?;
                let found = builtins::contains(&container, &item)?;
                frame.stack.push(Value::Bool(found != *invert));
            }
            Op::BuildList(n) => {
                let items = pop_n(frame, *n)?;
                frame.stack.push(Value::list(items));
            }
            Op::BuildTuple(n) => {
                let items = pop_n(frame, *n)?;
                frame.stack.push(Value::tuple(items));
            }
            Op::BuildMap(n) => {
                let flat = pop_n(frame, n * 2)?;
                let mut entries = Vec::with_capacity(*n);
                let mut iter = flat.into_iter();
                while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
                    builtins::dict_insert(&mut entries, k, v)?;
                }
                frame.stack.push(Value::Dict(Shared::new(entries)));
            }
            Op::Jump(target) => frame.pc = *target,
            Op::PopJumpIfFalse(target) => {
                if !pop(frame)?.truthy() {
                    frame.pc = *target;
                }
            }
            Op::PopJumpIfTrue(target) => {
                if pop(frame)?.truthy() {
                    frame.pc = *target;
                }
            }
            Op::JumpIfFalseOrPop(target) => {
                if peek(frame)?.truthy() {
                    pop(frame)?;
                } else {
                    frame.pc = *target;
                }
            }
            Op::JumpIfTrueOrPop(target) => {
                if peek(frame)?.truthy() {
                    frame.pc = *target;
                } else {
                    pop(frame)?;
                }
            }
            Op::GetIter => {
                let v = pop(frame)?;
                let it = self.get_iter(&v)?;
                frame.stack.push(it);
            }
            Op::ForIter(target) => {
                let it = peek(frame)?.clone();
                match self.iter_next(&it)? {
                    Some(v) => frame.stack.push(v),
                    None => {
                        pop(frame)?;
                        frame.pc = *target;
                    }
                }
            }
            Op::SetupFinally(target) => frame.handlers.push(Handler {
                target: *target,
                depth: frame.stack.len(),
                handled: frame.handled.len(),
            }),
            Op::PopBlock => {
                frame.handlers.pop();
            }
            Op::PopExcept => {
                frame.handled.pop();
            }
            Op::JumpIfNotExcMatch(target) => {
                let expected = pop(frame)?;
                let raised = pop(frame)?;
                if !exception_matches(&raised, &expected)? {
                    frame.pc = *target;
                }
            }
            Op::Reraise => {
                let exc = pop(frame)?;
                frame.handled.pop();
                return Err(Unwind::Raise(exc));
            }
            Op::Raise => {
                let v = pop(frame)?;
                return Err(Unwind::Raise(self.exception_to_raise(frame, v)?));
            }
            Op::MakeFunction { closure } => {
                let code = match pop(frame)? {
                    Value::Code(code) => code,
                    _ => return Err(internal("MAKE_FUNCTION without code")),
                };
                let cells = if *closure {
                    match pop(frame)? {
                        Value::Tuple(items) => items
                            .iter()
                            .map(|item| match item {
                                Value::Cell(cell) => Ok(cell.clone()),
                                _ => Err(internal("closure item is not a cell")),
                            })
                            .collect::<Result<Vec<_>, _>>()?,
                        _ => return Err(internal("closure is not a tuple")),
                    }
                } else {
                    Vec::new()
                };
                frame.stack.push(Value::Function(Arc::new(Function {
                    code,
                    globals: frame.globals.clone(),
                    closure: cells,
                })));
            }
            Op::MakeClass => {
                let body = match pop(frame)? {
                    Value::Function(f) => f,
                    _ => return Err(internal("MAKE_CLASS without body")),
                };
                let class = self.build_class(&body)?;
                frame.stack.push(class);
            }
            Op::CallFunction(argc) => {
                let args = pop_n(frame, *argc)?;
                let callee = pop(frame)?;
                let result = self.call(&callee, args)?;
                frame.stack.push(result);
            }
            Op::ReturnValue => return Ok(Flow::Return(pop(frame)?)),
            Op::YieldValue => return Ok(Flow::Yield(pop(frame)?)),
            Op::ImportName(name) => {
                let module = self.import(name)?;
                frame.stack.push(module);
            }
            Op::Probe(probe) => {
                let operands = pop_n(frame, probe.pops())?;
                self.dispatch_probe(frame, probe, &operands);
            }
        }
        Ok(Flow::Next)
    }

    fn lookup(&self, scopes: &[&Namespace], name: &Name) -> Result<Value, Unwind> {
        for scope in scopes.iter().copied().chain(std::iter::once(&self.builtins)) {
            let found = scope.lock().get(name).cloned();
            if let Some(v) = found {
                return Ok(v);
            }
        }
        Err(name_error(name))
    }

    /// The namespace a name access resolves to.
    fn resolve_scope(&self, frame: &Frame, opcode: Opcode, name: &Name) -> u64 {
        let candidates: Vec<&Namespace> = match opcode {
            Opcode::StoreGlobal => return frame.globals.addr(),
            Opcode::StoreName => return frame.names.addr(),
            Opcode::LoadGlobal => vec![&frame.globals],
            _ => vec![&frame.names, &frame.globals],
        };
        candidates
            .into_iter()
            .find(|ns| ns.lock().contains_key(name))
            .map(|ns| ns.addr())
            .unwrap_or_else(|| self.builtins.addr())
    }

    fn exception_to_raise(&self, frame: &Frame, v: Value) -> Result<Value, Unwind> {
        match v {
            Value::None => frame.handled.last().cloned().ok_or_else(|| {
                Unwind::raise(ExceptionKind::RuntimeError, "No active exception to reraise")
            }),
            Value::ExceptionType(kind) => Ok(Value::exception(kind, "")),
            exc @ Value::Exception(_) => Ok(exc),
            other => Err(Unwind::raise(
                ExceptionKind::TypeError,
                format!(
                    "exceptions must derive from BaseException, not {}",
                    other.type_name()
                ),
            )),
        }
    }

    fn build_class(&mut self, body: &Function) -> Result<Value, Unwind> {
        let namespace = new_namespace();
        let mut frame = Frame::new(
            self.tracer.next_frame_id(),
            Arc::clone(&body.code),
            body.globals.clone(),
            namespace.clone(),
        );
        for (name, cell) in body.code.freevars.iter().zip(&body.closure) {
            frame.cells.insert(name.clone(), cell.clone());
        }
        self.run_nested(&mut frame)?;
        Ok(Value::Class(Arc::new(Class {
            name: body.code.name.clone(),
            namespace,
        })))
    }

    fn function_frame(&self, f: &Function, args: Vec<Value>) -> Result<Frame, Unwind> {
        let code = &f.code;
        if args.len() != code.params.len() {
            return Err(Unwind::raise(
                ExceptionKind::TypeError,
                format!(
                    "{}() takes {} positional arguments but {} were given",
                    code.name,
                    code.params.len(),
                    args.len()
                ),
            ));
        }
        let mut frame = Frame::new(
            self.tracer.next_frame_id(),
            Arc::clone(code),
            f.globals.clone(),
            f.globals.clone(),
        );
        for (param, arg) in code.params.iter().zip(args) {
            frame.locals.insert(param.clone(), arg);
        }
        for name in &code.cellvars {
            let initial = frame.locals.remove(name);
            frame.cells.insert(name.clone(), Shared::new(initial));
        }
        for (name, cell) in code.freevars.iter().zip(&f.closure) {
            frame.cells.insert(name.clone(), cell.clone());
        }
        Ok(frame)
    }

    /// Call any callable value.
    pub fn call(&mut self, callee: &Value, args: Vec<Value>) -> Result<Value, Unwind> {
        match callee {
            Value::Function(f) => {
                let mut frame = self.function_frame(f, args)?;
                if f.code.is_generator {
                    return Ok(Value::Generator(Shared::new(GeneratorState {
                        frame: Some(frame),
                        started: false,
                        finished: false,
                    })));
                }
                match self.run_nested(&mut frame)? {
                    FrameExit::Return(v) => Ok(v),
                    FrameExit::Yield(_) => Err(internal("yield from a plain function")),
                }
            }
            Value::Builtin(b) => builtins::call(self, *b, args),
            Value::BoundMethod(m) => {
                let mut full = Vec::with_capacity(args.len() + 1);
                full.push(m.receiver.clone());
                full.extend(args);
                self.call(&m.func, full)
            }
            Value::Class(class) => {
                let instance = Value::Instance(Arc::new(Instance {
                    class: Arc::clone(class),
                    attrs: new_namespace(),
                }));
                let init = class.namespace.lock().get("__init__").cloned();
                match init {
                    Some(init) => {
                        let mut full = Vec::with_capacity(args.len() + 1);
                        full.push(instance.clone());
                        full.extend(args);
                        let result = self.call(&init, full)?;
                        if !matches!(result, Value::None) {
                            return Err(Unwind::raise(
                                ExceptionKind::TypeError,
                                "__init__() should return None",
                            ));
                        }
                    }
                    None if !args.is_empty() => {
                        return Err(Unwind::raise(
                            ExceptionKind::TypeError,
                            format!("{}() takes no arguments", class.name),
                        ))
                    }
                    None => {}
                }
                Ok(instance)
            }
            Value::ExceptionType(kind) => Ok(Value::exception(
                *kind,
                args.first().map(Value::to_display).unwrap_or_default(),
            )),
            other => Err(Unwind::raise(
                ExceptionKind::TypeError,
                format!("'{}' object is not callable", other.type_name()),
            )),
        }
    }

    pub fn get_iter(&mut self, v: &Value) -> Result<Value, Unwind> {
        let state = match v {
            Value::List(list) => IteratorState::List {
                list: list.clone(),
                pos: 0,
            },
            Value::Tuple(items) => IteratorState::Items {
                items: items.to_vec(),
                pos: 0,
            },
            Value::Str(s) => IteratorState::Items {
                items: s.chars().map(|c| Value::str(&c.to_string())).collect(),
                pos: 0,
            },
            Value::Dict(d) => IteratorState::Items {
                items: d.lock().iter().map(|(k, _)| k.clone()).collect(),
                pos: 0,
            },
            Value::Iterator(_) | Value::Generator(_) => return Ok(v.clone()),
            other => {
                return Err(Unwind::raise(
                    ExceptionKind::TypeError,
                    format!("'{}' object is not iterable", other.type_name()),
                ))
            }
        };
        Ok(Value::Iterator(Shared::new(state)))
    }

    /// Advance an iterator; `None` once exhausted.
    pub fn iter_next(&mut self, it: &Value) -> Result<Option<Value>, Unwind> {
        match it {
            Value::Iterator(state) => {
                let mut state = state.lock();
                let next = match &mut *state {
                    IteratorState::List { list, pos } => {
                        let items = list.lock();
                        let v = items.get(*pos).cloned();
                        if v.is_some() {
                            *pos += 1;
                        }
                        v
                    }
                    IteratorState::Items { items, pos } => {
                        let v = items.get(*pos).cloned();
                        if v.is_some() {
                            *pos += 1;
                        }
                        v
                    }
                    IteratorState::Range { next, stop, step } => {
                        let more = if *step > 0 { *next < *stop } else { *next > *stop };
                        if more {
                            let v = *next;
                            *next = next.saturating_add(*step);
                            Some(Value::Int(v))
                        } else {
                            None
                        }
                    }
                };
                Ok(next)
            }
            Value::Generator(g) => self.resume_generator(g),
            other => Err(Unwind::raise(
                ExceptionKind::TypeError,
                format!("'{}' object is not an iterator", other.type_name()),
            )),
        }
    }

    fn resume_generator(&mut self, g: &Shared<GeneratorState>) -> Result<Option<Value>, Unwind> {
        let (mut frame, started) = {
            let mut state = g.lock();
            if state.finished {
                return Ok(None);
            }
            match state.frame.take() {
                Some(frame) => (frame, state.started),
                None => {
                    return Err(Unwind::raise(
                        ExceptionKind::ValueError,
                        "generator already executing",
                    ))
                }
            }
        };
        if started {
            frame.stack.push(Value::None);
        }
        let result = self.run_nested(&mut frame);
        let mut state = g.lock();
        state.started = true;
        match result {
            Ok(FrameExit::Yield(v)) => {
                state.frame = Some(frame);
                Ok(Some(v))
            }
            Ok(FrameExit::Return(_)) => {
                state.finished = true;
                Ok(None)
            }
            Err(err) => {
                state.finished = true;
                Err(err)
            }
        }
    }

    /// Drain an iterable into a vector.
    pub fn iterate(&mut self, v: &Value) -> Result<Vec<Value>, Unwind> {
        let it = self.get_iter(v)?;
        let mut items = Vec::new();
        while let Some(item) = self.iter_next(&it)? {
            self.tick()?;
            items.push(item);
        }
        Ok(items)
    }

    pub fn get_attr(&mut self, owner: &Value, name: &str) -> Result<Value, Unwind> {
        match owner {
            Value::Instance(instance) => {
                let own = instance.attrs.lock().get(name).cloned();
                if let Some(v) = own {
                    return Ok(v);
                }
                let class_attr = instance.class.namespace.lock().get(name).cloned();
                match class_attr {
                    Some(func @ Value::Function(_)) => Ok(Value::BoundMethod(Arc::new(BoundMethod {
                        receiver: owner.clone(),
                        func,
                    }))),
                    Some(other) => Ok(other),
                    None => Err(attribute_error(
                        format!("'{}' object", instance.class.name),
                        name,
                    )),
                }
            }
            Value::Class(class) => {
                let found = class.namespace.lock().get(name).cloned();
                found.ok_or_else(|| attribute_error(format!("type object '{}'", class.name), name))
            }
            Value::Module(module) => {
                let found = module.globals.lock().get(name).cloned();
                found.ok_or_else(|| attribute_error(format!("module '{}'", module.name), name))
            }
            Value::Exception(e) if name == "args" => {
                Ok(Value::tuple(vec![Value::str(&e.message)]))
            }
            other => match builtins::method(other, name) {
                Some(method) => Ok(Value::BoundMethod(Arc::new(BoundMethod {
                    receiver: other.clone(),
                    func: Value::Builtin(method),
                }))),
                None => Err(attribute_error(format!("'{}' object", other.type_name()), name)),
            },
        }
    }

    /// Attribute lookup without binding or raising.
    pub fn peek_attr(&self, owner: &Value, name: &str) -> Option<Value> {
        match owner {
            Value::Instance(instance) => {
                let own = instance.attrs.lock().get(name).cloned();
                own.or_else(|| instance.class.namespace.lock().get(name).cloned())
            }
            other => {
                let namespace = other.attribute_namespace()?;
                let found = namespace.lock().get(name).cloned();
                found.or_else(|| builtins::method(other, name).map(Value::Builtin))
            }
        }
    }

    fn dispatch_probe(&self, frame: &Frame, probe: &Probe, operands: &[Value]) {
        let tracer = &self.tracer;
        match (probe, operands) {
            (Probe::CodeObjectEntered { code_object_id }, _) => {
                tracer.executed_code_object(*code_object_id)
            }
            (Probe::LineVisited { line_id }, _) => tracer.track_line_visit(*line_id),
            (Probe::BoolPredicate { predicate_id }, [value]) => {
                tracer.executed_bool_predicate(value, *predicate_id)
            }
            (Probe::ComparePredicate { predicate_id, op }, [left, right]) => {
                tracer.executed_compare_predicate(left, right, *predicate_id, *op)
            }
            (Probe::ExceptionMatch { predicate_id }, [raised, expected]) => {
                tracer.executed_exception_match(raised, expected, *predicate_id)
            }
            (Probe::DynamicConstants { op }, [left, right]) => {
                tracer.dynamic_constants(left, right, *op)
            }
            (Probe::Instruction { site, access }, operands) => {
                let detail = self.access_detail(frame, site, access, operands);
                tracer.executed_instruction(site, frame.id, detail);
            }
            _ => {}
        }
    }

    fn access_detail(
        &self,
        frame: &Frame,
        site: &ProbeSite,
        access: &AccessProbe,
        operands: &[Value],
    ) -> InstructionDetail {
        let memory = |value: &Value, scope: Option<u64>| {
            InstructionDetail::Memory(MemoryAccess {
                address: value.address(),
                mutable: value.is_mutable(),
                scope,
                object_creation: false,
            })
        };
        match (access, operands) {
            (AccessProbe::Local { .. }, [value]) => memory(value, None),
            (AccessProbe::Global { name }, [value]) => {
                memory(value, Some(self.resolve_scope(frame, site.opcode, name)))
            }
            (AccessProbe::Deref { name }, [value]) => {
                memory(value, frame.cells.get(name).map(|cell| cell.addr()))
            }
            (AccessProbe::Subscript, [container]) => memory(container, None),
            (AccessProbe::Attribute { name }, [owner]) => {
                let found = if site.opcode == Opcode::LoadAttr {
                    self.peek_attr(owner, name)
                } else {
                    None
                };
                InstructionDetail::Attribute(AttributeAccess {
                    owner: owner.address(),
                    address: found.as_ref().and_then(Value::address),
                    mutable: found.as_ref().map(Value::is_mutable).unwrap_or(false),
                })
            }
            (AccessProbe::Jump { target_node }, _) => InstructionDetail::Jump {
                target_node: *target_node,
            },
            (AccessProbe::Call { argc }, _) => InstructionDetail::Call { argc: *argc },
            (AccessProbe::Return, _) => InstructionDetail::Return,
            (AccessProbe::Import { name }, _) => InstructionDetail::Import {
                module: name.to_string(),
            },
            _ => InstructionDetail::Plain,
        }
    }
}

fn constant_value(constant: &Constant) -> Value {
    match constant {
        Constant::None => Value::None,
        Constant::Bool(b) => Value::Bool(*b),
        Constant::Int(i) => Value::Int(*i),
        Constant::Float(f) => Value::Float(*f),
        Constant::Str(s) => Value::Str(Arc::clone(s)),
        Constant::Code(code) => Value::Code(Arc::clone(code)),
    }
}

fn pop(frame: &mut Frame) -> Result<Value, Unwind> {
    frame.stack.pop().ok_or_else(|| internal("stack underflow"))
}

fn peek(frame: &Frame) -> Result<&Value, Unwind> {
    frame.stack.last().ok_or_else(|| internal("stack underflow"))
}

fn pop_n(frame: &mut Frame, n: usize) -> Result<Vec<Value>, Unwind> {
    if frame.stack.len() < n {
        return Err(internal("stack underflow"));
    }
    let at = frame.stack.len() - n;
    Ok(frame.stack.split_off(at))
}

fn name_error(name: &str) -> Unwind {
    Unwind::raise(
        ExceptionKind::NameError,
        format!("name '{}' is not defined", name),
    )
}

fn attribute_error(owner: String, name: &str) -> Unwind {
    Unwind::raise(
        ExceptionKind::AttributeError,
        format!("{} has no attribute '{}'", owner, name),
    )
}

fn set_attr(owner: &Value, name: &Name, value: Value) -> Result<(), Unwind> {
    match owner.attribute_namespace() {
        Some(namespace) => {
            namespace.lock().insert(name.clone(), value);
            Ok(())
        }
        None => Err(attribute_error(
            format!("'{}' object", owner.type_name()),
            name,
        )),
    }
}

fn exception_matches(raised: &Value, expected: &Value) -> Result<bool, Unwind> {
    let kind = match raised {
        Value::Exception(e) => e.kind,
        _ => return Err(internal("handler received a non-exception")),
    };
    match expected {
        Value::ExceptionType(k) => Ok(kind.is_subclass_of(*k)),
        Value::Tuple(options) => {
            for option in options.iter() {
                if exception_matches(raised, option)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Err(Unwind::raise(
            ExceptionKind::TypeError,
            "catching classes that do not inherit from BaseException is not allowed",
        )),
    }
}

/// `in`/`not in` and identity ops expressed as comparison operators, for
/// probes that report them.
pub fn compare_op_of(op: &Op) -> Option<CompareOp> {
    match op {
        Op::Compare(op) => Some(*op),
        Op::IsOp { invert: false } => Some(CompareOp::Is),
        Op::IsOp { invert: true } => Some(CompareOp::IsNot),
        Op::ContainsOp { invert: false } => Some(CompareOp::In),
        Op::ContainsOp { invert: true } => Some(CompareOp::NotIn),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::compile_module;

    fn run(source: &str) -> Result<(Interpreter, Namespace), Unwind> {
        let code = Arc::new(compile_module(source, "t.sub").expect("compiles"));
        let mut vm = Interpreter::new(
            Arc::new(ExecutionTracer::new()),
            Arc::new(ModuleTable::new()),
            VmLimits::default(),
            Arc::new(AtomicBool::new(false)),
        );
        let ns = new_namespace();
        vm.run_code(code, &ns)?;
        Ok((vm, ns))
    }

    fn global(ns: &Namespace, name: &str) -> Value {
        ns.lock().get(name).cloned().expect("global defined")
    }

    fn int_global(source: &str, name: &str) -> i64 {
        let (_, ns) = run(source).unwrap_or_else(|e| panic!("raised {:?}", e));
        match global(&ns, name) {
            Value::Int(i) => i,
            other => panic!("expected int, got {:?}", other),
        }
    }

    #[test]
    fn test_arithmetic_and_functions() {
        let src = "def f(a, b):\n    return a * 2 + b\nx = f(3, 4)\n";
        assert_eq!(int_global(src, "x"), 10);
    }

    #[test]
    fn test_while_and_for_loops() {
        let src = "t = 0\nfor i in range(5):\n    t += i\nn = 0\nwhile n < 3:\n    n += 1\n";
        assert_eq!(int_global(src, "t"), 10);
        assert_eq!(int_global(src, "n"), 3);
    }

    #[test]
    fn test_break_and_continue() {
        let src = "t = 0\nfor i in range(10):\n    if i == 5:\n        break\n    if i % 2 == 0:\n        continue\n    t += i\n";
        assert_eq!(int_global(src, "t"), 4);
    }

    #[test]
    fn test_closures_share_cells() {
        let src = "def counter():\n    n = 0\n    def inc():\n        nonlocal n\n        n += 1\n        return n\n    return inc\nc = counter()\nc()\nx = c()\n";
        assert_eq!(int_global(src, "x"), 2);
    }

    #[test]
    fn test_classes_and_methods() {
        let src = "class Acc:\n    def __init__(self, start):\n        self.v = start\n    def add(self, d):\n        self.v = self.v + d\n        return self\na = Acc(1)\na.add(2).add(3)\nx = a.v\n";
        assert_eq!(int_global(src, "x"), 6);
    }

    #[test]
    fn test_exception_handling() {
        let src = "def f(d):\n    try:\n        return d['k']\n    except KeyError:\n        return -1\nx = f({})\ny = f({'k': 3})\n";
        assert_eq!(int_global(src, "x"), -1);
        assert_eq!(int_global(src, "y"), 3);
    }

    #[test]
    fn test_unhandled_exception_propagates() {
        let err = run("x = 1 / 0\n").err().expect("raises");
        assert!(matches!(
            err,
            Unwind::Raise(Value::Exception(e)) if e.kind == ExceptionKind::ZeroDivisionError
        ));
    }

    #[test]
    fn test_bare_raise_reraises_handled_exception() {
        let src = "def f():\n    try:\n        raise ValueError('bad')\n    except ValueError:\n        raise\nf()\n";
        let err = run(src).err().expect("raises");
        assert!(matches!(
            err,
            Unwind::Raise(Value::Exception(e)) if e.kind == ExceptionKind::ValueError && e.message == "bad"
        ));
    }

    #[test]
    fn test_generators() {
        let src = "def gen(n):\n    i = 0\n    while i < n:\n        yield i\n        i += 1\nt = 0\nfor v in gen(4):\n    t += v\n";
        assert_eq!(int_global(src, "t"), 6);
    }

    #[test]
    fn test_recursion_limit() {
        let err = run("def f(n):\n    return f(n + 1)\nf(0)\n").err().expect("raises");
        assert!(matches!(
            err,
            Unwind::Raise(Value::Exception(e)) if e.kind == ExceptionKind::RecursionError
        ));
    }

    #[test]
    fn test_instruction_limit_halts() {
        let code = Arc::new(compile_module("while True:\n    pass\n", "t.sub").unwrap());
        let mut vm = Interpreter::new(
            Arc::new(ExecutionTracer::new()),
            Arc::new(ModuleTable::new()),
            VmLimits {
                max_depth: 10,
                max_instructions: 1000,
            },
            Arc::new(AtomicBool::new(false)),
        );
        let err = vm.run_code(code, &new_namespace()).unwrap_err();
        assert!(matches!(err, Unwind::Halt(HaltReason::InstructionLimit)));
    }

    #[test]
    fn test_cancellation_halts() {
        let code = Arc::new(compile_module("x = 1\n", "t.sub").unwrap());
        let mut vm = Interpreter::new(
            Arc::new(ExecutionTracer::new()),
            Arc::new(ModuleTable::new()),
            VmLimits::default(),
            Arc::new(AtomicBool::new(true)),
        );
        let err = vm.run_code(code, &new_namespace()).unwrap_err();
        assert!(matches!(err, Unwind::Halt(HaltReason::Cancelled)));
    }

    #[test]
    fn test_import_runs_module_once() {
        let modules = Arc::new(ModuleTable::new());
        let lib = compile_module("count = [0]\ncount[0] += 1\n", "lib.sub").unwrap();
        modules.register("lib", Arc::new(lib));
        let mut vm = Interpreter::new(
            Arc::new(ExecutionTracer::new()),
            Arc::clone(&modules),
            VmLimits::default(),
            Arc::new(AtomicBool::new(false)),
        );
        let main = Arc::new(compile_module("import lib\nimport lib\nx = lib.count[0]\n", "main.sub").unwrap());
        let ns = new_namespace();
        vm.run_code(main, &ns).unwrap();
        assert!(matches!(global(&ns, "x"), Value::Int(1)));
        assert!(modules.loaded("lib").is_some());
    }

    #[test]
    fn test_print_is_captured() {
        let (vm, _) = run("print('a', 1)\n").unwrap();
        assert_eq!(vm.output(), "a 1\n");
    }

    #[test]
    fn test_boolean_short_circuit() {
        let src = "def boom():\n    raise ValueError()\nx = 0 and boom()\ny = 1 or boom()\n";
        assert_eq!(int_global(src, "x"), 0);
        assert_eq!(int_global(src, "y"), 1);
    }
}
