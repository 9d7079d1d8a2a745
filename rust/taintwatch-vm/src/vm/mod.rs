//! Stack VM: frames, the dispatch loop, exception unwinding, and calls.
//!
//! Every instruction is offered to an [`InstructionHook`] before it runs. A
//! non-zero reply skips that many instructions; a hook that reports
//! `terminated()` ends the run.

mod natives;
mod ops;

pub use natives::{Effect, Sandbox};

use std::collections::BTreeMap;
use std::rc::Rc;
use taintwatch_core::bytecode::{BinaryOp, CodeObject, CompareOp, Instruction, OpCode, UnaryOp};
use taintwatch_core::frame::{Block, BlockKind, Frame, FrameArena, FrameId};
use taintwatch_core::host::{Host, HostError, InstructionHook, NoHook};
use taintwatch_core::tagged::TaggedValue;
use taintwatch_core::values::{
    BoundMethod, ClassValue, ExceptionValue, FunctionValue, InstanceValue, ModuleValue, Value,
};
use thiserror::Error;
use tracing::{debug, trace};

/// Type alias for debug callback to simplify type signatures
pub type DebugCallback = Option<Box<dyn FnMut(&DebugEvent)>>;

/// Debug events emitted during execution.
#[derive(Debug, Clone)]
pub enum DebugEvent {
    /// Instruction about to run: code name, index, opcode name
    Step { code: String, index: usize, opcode: String },
    /// The hook asked to skip `count` instructions starting at `index`
    Skip { code: String, index: usize, count: usize },
    CallEnter { name: String },
    CallExit { name: String },
}

#[derive(Debug, Error)]
pub enum VmError {
    #[error("uncaught {0}")]
    Host(HostError),
    #[error("execution terminated by instruction hook")]
    Terminated,
    #[error("stack overflow: call depth exceeded {0}")]
    StackOverflow(usize),
    #[error("instruction limit exceeded: {0}")]
    InstructionLimitExceeded(u64),
}

impl VmError {
    pub fn is_terminated(&self) -> bool {
        matches!(self, VmError::Terminated)
    }

    fn to_host(&self) -> HostError {
        match self {
            VmError::Host(err) => err.clone(),
            VmError::Terminated => HostError::Terminated,
            other => HostError::Fatal(other.to_string()),
        }
    }
}

const MAX_CALL_DEPTH: usize = 256;
const DEFAULT_MAX_INSTRUCTIONS: u64 = 10_000_000;

enum Flow {
    Next,
    Jump(usize),
    Return(Value),
}

pub struct Vm {
    frames: FrameArena,
    current: Option<FrameId>,
    modules: BTreeMap<String, Rc<ModuleValue>>,
    builtins: Rc<ModuleValue>,
    sandbox: Sandbox,
    pub debug_callback: DebugCallback,
    max_instructions: u64,
    instruction_count: u64,
    depth: usize,
    /// First fatal condition seen; every frame unwinds without running handlers.
    pending_fatal: Option<VmError>,
    last_exception: Option<HostError>,
    next_fd: i64,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Self::with_sandbox(Sandbox::default())
    }

    /// A VM whose native modules see `sandbox` (stdin lines, argv, environment).
    pub fn with_sandbox(sandbox: Sandbox) -> Self {
        let mut modules = BTreeMap::new();
        let builtins = natives::install(&mut modules, &sandbox);
        Self {
            frames: FrameArena::new(),
            current: None,
            modules,
            builtins,
            sandbox,
            debug_callback: None,
            max_instructions: DEFAULT_MAX_INSTRUCTIONS,
            instruction_count: 0,
            depth: 0,
            pending_fatal: None,
            last_exception: None,
            next_fd: 3,
        }
    }

    pub fn set_instruction_limit(&mut self, max_instructions: u64) {
        self.max_instructions = max_instructions;
    }

    pub fn set_debug_callback(&mut self, callback: impl FnMut(&DebugEvent) + 'static) {
        self.debug_callback = Some(Box::new(callback));
    }

    pub fn instruction_count(&self) -> u64 {
        self.instruction_count
    }

    /// Lines the script printed.
    pub fn output(&self) -> &[String] {
        &self.sandbox.output
    }

    /// Side effects the script requested, in order. None of them were performed.
    pub fn effects(&self) -> &[Effect] {
        &self.sandbox.effects
    }

    pub fn builtins(&self) -> &Rc<ModuleValue> {
        &self.builtins
    }

    /// Run `code` as the `__main__` module without a hook.
    pub fn run(&mut self, code: Rc<CodeObject>) -> Result<Value, VmError> {
        self.run_main(code, &mut NoHook)
    }

    /// Run `code` as the `__main__` module, offering each instruction to `hook`.
    pub fn run_main(&mut self, code: Rc<CodeObject>, hook: &mut dyn InstructionHook) -> Result<Value, VmError> {
        let globals = ModuleValue::new("__main__");
        globals.set("__name__", Value::str("__main__"));
        globals.set("__file__", Value::str(&code.filename));
        self.modules.insert("__main__".into(), Rc::clone(&globals));
        self.instruction_count = 0;
        self.depth = 0;
        self.pending_fatal = None;
        self.last_exception = None;

        debug!(file = %code.filename, instructions = code.len(), "running main module");
        let id = self.frames.push(code, globals, None);
        match self.run_frame(hook, id) {
            Ok(value) => Ok(value),
            Err(HostError::Raised { kind, message }) if kind == "SystemExit" => {
                debug!(status = %message, "script exited");
                Ok(Value::None)
            }
            Err(err) => Err(self.pending_fatal.take().unwrap_or(VmError::Host(err))),
        }
    }

    // ─── Frame plumbing ───

    fn frame(&self, id: FrameId) -> Result<&Frame, HostError> {
        self.frames.get(id).ok_or_else(|| HostError::Fatal(format!("{} is gone", id)))
    }

    fn frame_mut(&mut self, id: FrameId) -> Result<&mut Frame, HostError> {
        self.frames.get_mut(id).ok_or_else(|| HostError::Fatal(format!("{} is gone", id)))
    }

    fn push(&mut self, id: FrameId, value: Value) -> Result<(), HostError> {
        self.frame_mut(id)?.stack.push(value);
        Ok(())
    }

    fn pop(&mut self, id: FrameId) -> Result<Value, HostError> {
        self.frame_mut(id)?
            .stack
            .pop()
            .ok_or_else(|| HostError::Fatal("operand stack underflow".into()))
    }

    /// Pop `n` values, returned bottom first.
    fn pop_n(&mut self, id: FrameId, n: usize) -> Result<Vec<Value>, HostError> {
        let stack = &mut self.frame_mut(id)?.stack;
        if stack.len() < n {
            return Err(HostError::Fatal("operand stack underflow".into()));
        }
        Ok(stack.split_off(stack.len() - n))
    }

    fn top(&self, id: FrameId) -> Result<Value, HostError> {
        self.frame(id)?
            .stack
            .last()
            .cloned()
            .ok_or_else(|| HostError::Fatal("operand stack underflow".into()))
    }

    fn emit(&mut self, event: impl FnOnce() -> DebugEvent) {
        if let Some(callback) = self.debug_callback.as_mut() {
            callback(&event());
        }
    }

    /// Record a fatal condition and return its host form.
    fn fail(&mut self, err: VmError) -> HostError {
        let host = err.to_host();
        self.pending_fatal.get_or_insert(err);
        host
    }

    fn check_abort(&mut self, hook: &dyn InstructionHook) -> Result<(), HostError> {
        if let Some(err) = &self.pending_fatal {
            return Err(err.to_host());
        }
        if hook.terminated() {
            return Err(self.fail(VmError::Terminated));
        }
        Ok(())
    }

    // ─── Dispatch loop ───

    fn run_frame(&mut self, hook: &mut dyn InstructionHook, id: FrameId) -> Result<Value, HostError> {
        let saved = self.current.replace(id);
        let result = self.run_loop(hook, id);
        self.current = saved;
        self.frames.remove(id);
        result
    }

    fn run_loop(&mut self, hook: &mut dyn InstructionHook, id: FrameId) -> Result<Value, HostError> {
        loop {
            let (code, index) = {
                let frame = self.frame(id)?;
                (Rc::clone(&frame.code), frame.lasti)
            };
            let Some(instr) = code.instruction(index).copied() else {
                return Ok(Value::None);
            };

            self.instruction_count = self.instruction_count.saturating_add(1);
            if self.instruction_count > self.max_instructions {
                return Err(self.fail(VmError::InstructionLimitExceeded(self.max_instructions)));
            }

            let skip = hook.pre_instruction(self, &instr);
            self.check_abort(hook)?;
            if skip > 0 {
                self.emit(|| DebugEvent::Skip { code: code.name.clone(), index, count: skip });
                self.frame_mut(id)?.lasti = index + skip;
                continue;
            }

            self.emit(|| DebugEvent::Step { code: code.name.clone(), index, opcode: instr.op.name().to_string() });
            let flow = match self.step(hook, id, &code, index, &instr) {
                Ok(flow) => flow,
                Err(err) if err.is_fatal() || self.pending_fatal.is_some() => return Err(err),
                Err(err) => {
                    self.unwind(id, err)?;
                    continue;
                }
            };
            self.check_abort(hook)?;
            let after = hook.post_instruction(self, &instr);
            match flow {
                Flow::Next => self.frame_mut(id)?.lasti = index + 1 + after,
                Flow::Jump(target) => self.frame_mut(id)?.lasti = target,
                Flow::Return(value) => return Ok(value),
            }
        }
    }

    /// Transfer control to the innermost handler of `id`, or propagate `err`.
    fn unwind(&mut self, id: FrameId, err: HostError) -> Result<(), HostError> {
        let exception = Value::Exception(Rc::new(ExceptionValue {
            kind: err.type_name().to_string(),
            message: err.message(),
        }));
        let class = self.exception_class(err.type_name());
        let frame = self.frame_mut(id)?;
        while let Some(block) = frame.blocks.pop() {
            if block.kind != BlockKind::Finally {
                continue;
            }
            frame.stack.truncate(block.level);
            frame.blocks.push(Block { kind: BlockKind::ExceptHandler, handler: block.handler, level: block.level });
            frame.stack.extend([Value::None, exception, class]);
            frame.lasti = block.handler;
            trace!(%id, handler = block.handler, kind = err.type_name(), "exception caught");
            self.last_exception = Some(err);
            return Ok(());
        }
        Err(err)
    }

    fn exception_class(&self, kind: &str) -> Value {
        match self.builtins.get(kind) {
            Some(class @ Value::Class(_)) => class,
            _ => Value::Class(ClassValue::exception(kind)),
        }
    }

    fn step(
        &mut self,
        hook: &mut dyn InstructionHook,
        id: FrameId,
        code: &CodeObject,
        index: usize,
        instr: &Instruction,
    ) -> Result<Flow, HostError> {
        let name = || {
            code.name_at(instr.arg)
                .map(str::to_string)
                .ok_or_else(|| HostError::Fatal(format!("name index {} out of range in {}", instr.arg, code.name)))
        };
        let target = || {
            instr
                .jump_target(index)
                .ok_or_else(|| HostError::Fatal(format!("{} has no jump target", instr.op.name())))
        };

        if let Some(op) = instr.op.unary_op() {
            let operand = self.pop(id)?;
            self.push(id, ops::unary(op, &operand)?)?;
            return Ok(Flow::Next);
        }
        if let Some(op) = instr.op.binary_op() {
            let rhs = self.pop(id)?;
            let lhs = self.pop(id)?;
            self.push(id, ops::binary(op, &lhs, &rhs)?)?;
            return Ok(Flow::Next);
        }

        match instr.op {
            OpCode::Nop => {}
            OpCode::PopTop => {
                self.pop(id)?;
            }
            OpCode::RotTwo => {
                let mut items = self.pop_n(id, 2)?;
                items.swap(0, 1);
                self.frame_mut(id)?.stack.extend(items);
            }
            OpCode::RotThree => {
                let items = self.pop_n(id, 3)?;
                let [c, b, a] = <[Value; 3]>::try_from(items)
                    .map_err(|_| HostError::Fatal("operand stack underflow".into()))?;
                self.frame_mut(id)?.stack.extend([a, c, b]);
            }
            OpCode::DupTop => {
                let top = self.top(id)?;
                self.push(id, top)?;
            }
            OpCode::DupTopTwo => {
                let items = self.pop_n(id, 2)?;
                let stack = &mut self.frame_mut(id)?.stack;
                stack.extend(items.iter().cloned());
                stack.extend(items);
            }
            OpCode::CompareOp => {
                let cmp = CompareOp::from_arg(instr.arg)
                    .ok_or_else(|| HostError::Fatal(format!("bad comparison {}", instr.arg)))?;
                let rhs = self.pop(id)?;
                let lhs = self.pop(id)?;
                self.push(id, ops::compare(cmp, &lhs, &rhs)?)?;
            }
            OpCode::IsOp => {
                let rhs = self.pop(id)?;
                let lhs = self.pop(id)?;
                self.push(id, Value::Bool(lhs.is_same(&rhs) != (instr.arg == 1)))?;
            }
            OpCode::ContainsOp => {
                let container = self.pop(id)?;
                let needle = self.pop(id)?;
                let cmp = if instr.arg == 1 { CompareOp::NotIn } else { CompareOp::In };
                self.push(id, ops::compare(cmp, &needle, &container)?)?;
            }
            OpCode::LoadConst => {
                let constant = code
                    .consts
                    .get(instr.arg as usize)
                    .ok_or_else(|| HostError::Fatal(format!("constant {} out of range", instr.arg)))?;
                self.push(id, Value::from_constant(constant))?;
            }
            OpCode::LoadName | OpCode::LoadGlobal => {
                let value = self.load_global(id, &name()?)?;
                self.push(id, value)?;
            }
            OpCode::StoreName | OpCode::StoreGlobal => {
                let value = self.pop(id)?;
                self.frame(id)?.globals.set(name()?, value);
            }
            OpCode::LoadFast => {
                let slot = instr.arg as usize;
                let value = self.frame(id)?.fast.get(slot).cloned().flatten();
                match value {
                    Some(value) => self.push(id, value)?,
                    None => {
                        let var = code.varname_at(instr.arg).unwrap_or("?");
                        return Err(HostError::Raised {
                            kind: "UnboundLocalError".into(),
                            message: format!("local variable '{}' referenced before assignment", var),
                        });
                    }
                }
            }
            OpCode::StoreFast => {
                let value = self.pop(id)?;
                let frame = self.frame_mut(id)?;
                let slot = instr.arg as usize;
                if slot >= frame.fast.len() {
                    frame.fast.resize(slot + 1, None);
                }
                frame.fast[slot] = Some(value);
            }
            OpCode::LoadAttr => {
                let object = self.pop(id)?;
                let value = self.load_attr(&object, &name()?)?;
                self.push(id, value)?;
            }
            OpCode::StoreAttr => {
                let object = self.pop(id)?;
                let value = self.pop(id)?;
                self.store_attr(&object, &name()?, value)?;
            }
            OpCode::LoadMethod => {
                let object = self.pop(id)?;
                let attr = name()?;
                match self.lookup_method(&object, &attr) {
                    Some(method) => {
                        self.push(id, method)?;
                        self.push(id, object)?;
                    }
                    None => {
                        let value = self.load_attr(&object, &attr)?;
                        self.push(id, Value::Null)?;
                        self.push(id, value)?;
                    }
                }
            }
            OpCode::StoreSubscr => {
                let key = self.pop(id)?;
                let container = self.pop(id)?;
                let value = self.pop(id)?;
                ops::store_subscript(&container, key, value)?;
            }
            OpCode::BuildList => {
                let items = self.pop_n(id, instr.arg as usize)?;
                self.push(id, Value::list(items))?;
            }
            OpCode::BuildTuple => {
                let items = self.pop_n(id, instr.arg as usize)?;
                self.push(id, Value::tuple(items))?;
            }
            OpCode::BuildMap => {
                let items = self.pop_n(id, instr.arg as usize * 2)?;
                let pairs = items.chunks(2).map(|kv| (kv[0].clone(), kv[1].clone())).collect();
                self.push(id, Value::dict(pairs))?;
            }
            OpCode::BuildString => {
                let items = self.pop_n(id, instr.arg as usize)?;
                let text: String = items.iter().map(Value::display_text).collect();
                self.push(id, Value::str(text))?;
            }
            OpCode::ImportName => {
                let fromlist = self.pop(id)?;
                let level = self.pop(id)?;
                let module = self.import(&name()?, &fromlist, level.as_int().unwrap_or(0))?;
                self.push(id, module)?;
            }
            OpCode::ImportFrom => {
                let module = self.top(id)?;
                let attr = name()?;
                let value = self.load_attr(&module, &attr).map_err(|err| match err {
                    HostError::Attribute(_) => HostError::Import(format!("cannot import name '{}'", attr)),
                    other => other,
                })?;
                self.push(id, value)?;
            }
            OpCode::ImportStar => {
                let module = self.pop(id)?;
                match &module {
                    Value::Module(m) => {
                        let globals = Rc::clone(&self.frame(id)?.globals);
                        for (key, value) in m.attrs.borrow().iter().filter(|(k, _)| !k.starts_with('_')) {
                            globals.set(key.clone(), value.clone());
                        }
                    }
                    Value::Tagged(_) => {}
                    other => {
                        return Err(HostError::Type(format!("cannot import * from '{}'", other.type_name())))
                    }
                }
            }
            OpCode::CallFunction | OpCode::CallFunctionKw | OpCode::CallFunctionEx | OpCode::CallMethod => {
                let (callable, args, kwnames) = self.pop_call(id, instr)?;
                let result = self.call_value(hook, &callable, &args, &kwnames)?;
                self.push(id, result)?;
            }
            OpCode::MakeFunction => {
                let qualname = self.pop(id)?;
                let body = self.pop(id)?;
                let defaults = if instr.arg & 1 != 0 {
                    self.pop(id)?.sequence_items().unwrap_or_default()
                } else {
                    Vec::new()
                };
                let Value::Code(body) = body else {
                    return Err(HostError::Type(format!("MAKE_FUNCTION expects code, got {}", body.type_name())));
                };
                let globals = Rc::clone(&self.frame(id)?.globals);
                let func = FunctionValue {
                    name: qualname.as_str().map(str::to_string).unwrap_or_else(|| body.name.clone()),
                    code: body,
                    globals,
                    defaults,
                };
                self.push(id, Value::Function(Rc::new(func)))?;
            }
            OpCode::ReturnValue => return Ok(Flow::Return(self.pop(id)?)),
            OpCode::JumpForward | OpCode::JumpAbsolute => return Ok(Flow::Jump(target()?)),
            OpCode::PopJumpIfFalse | OpCode::PopJumpIfTrue => {
                let cond = self.pop(id)?.is_truthy();
                if cond == (instr.op == OpCode::PopJumpIfTrue) {
                    return Ok(Flow::Jump(target()?));
                }
            }
            OpCode::JumpIfFalseOrPop | OpCode::JumpIfTrueOrPop => {
                let cond = self.top(id)?.is_truthy();
                if cond == (instr.op == OpCode::JumpIfTrueOrPop) {
                    return Ok(Flow::Jump(target()?));
                }
                self.pop(id)?;
            }
            OpCode::JumpIfNotExcMatch => {
                let handler = self.pop(id)?;
                let raised = self.pop(id)?;
                if !exception_matches(&raised, &handler) {
                    return Ok(Flow::Jump(target()?));
                }
            }
            OpCode::GetIter => {
                let value = self.pop(id)?;
                self.push(id, ops::get_iter(&value)?)?;
            }
            OpCode::ForIter => {
                let Value::Iterator(state) = self.top(id)? else {
                    return Err(HostError::Type("FOR_ITER expects an iterator".into()));
                };
                let next = state.borrow_mut().next();
                match next {
                    Some(item) => self.push(id, item)?,
                    None => {
                        self.pop(id)?;
                        return Ok(Flow::Jump(target()?));
                    }
                }
            }
            OpCode::UnpackSequence => {
                let value = self.pop(id)?;
                let items = match &value {
                    Value::Tagged(t) => vec![Value::Tagged(Rc::clone(t)); instr.arg as usize],
                    other => ops::iterate(other)?,
                };
                if items.len() != instr.arg as usize {
                    return Err(HostError::Value(format!(
                        "expected {} values to unpack, got {}",
                        instr.arg,
                        items.len()
                    )));
                }
                self.frame_mut(id)?.stack.extend(items.into_iter().rev());
            }
            OpCode::SetupFinally => {
                let handler = target()?;
                let frame = self.frame_mut(id)?;
                let level = frame.stack.len();
                frame.blocks.push(Block { kind: BlockKind::Finally, handler, level });
            }
            OpCode::PopBlock => {
                self.frame_mut(id)?.blocks.pop();
            }
            OpCode::PopExcept => {
                let frame = self.frame_mut(id)?;
                if let Some(pos) = frame.blocks.iter().rposition(|b| b.kind == BlockKind::ExceptHandler) {
                    let block = frame.blocks.remove(pos);
                    frame.stack.truncate(block.level);
                }
                self.last_exception = None;
            }
            OpCode::Reraise => {
                let items = self.pop_n(id, 3)?;
                return Err(raised_error(&items[1]));
            }
            OpCode::RaiseVarargs => {
                if instr.arg == 0 {
                    return Err(self.last_exception.clone().unwrap_or_else(|| HostError::Raised {
                        kind: "RuntimeError".into(),
                        message: "No active exception to reraise".into(),
                    }));
                }
                let items = self.pop_n(id, instr.arg as usize)?;
                return Err(raised_error(&items[0]));
            }
            other => {
                return Err(HostError::Fatal(format!("opcode {} is not implemented", other.name())));
            }
        }
        Ok(Flow::Next)
    }

    // ─── Names and attributes ───

    fn load_global(&self, id: FrameId, name: &str) -> Result<Value, HostError> {
        self.frame(id)?
            .globals
            .get(name)
            .or_else(|| self.builtins.get(name))
            .ok_or_else(|| HostError::Name(name.to_string()))
    }

    pub(crate) fn load_attr(&self, object: &Value, name: &str) -> Result<Value, HostError> {
        let missing = || HostError::Attribute(format!("'{}' object has no attribute '{}'", object.type_name(), name));
        match object {
            Value::Tagged(t) => Ok(t.get_attr(name)),
            Value::Module(m) => match m.get(name) {
                Some(value) => Ok(value),
                None if m.is_synthetic() => Ok(Value::tagged(TaggedValue::undefined())),
                None => Err(HostError::Attribute(format!("module '{}' has no attribute '{}'", m.name, name))),
            },
            Value::Class(c) => c.get(name).ok_or_else(missing),
            Value::Instance(inst) => {
                if let Some(value) = inst.fields.borrow().get(name) {
                    return Ok(value.clone());
                }
                inst.class.get(name).map(|attr| bind(object, attr)).ok_or_else(missing)
            }
            Value::Exception(e) => match name {
                "args" => Ok(Value::tuple(vec![Value::str(&e.message)])),
                _ => Err(missing()),
            },
            other => natives::builtin_method(other, name).map(|f| bind(other, f)).ok_or_else(missing),
        }
    }

    /// The unbound callable behind `object.name()` when the receiver should be
    /// passed explicitly.
    fn lookup_method(&self, object: &Value, name: &str) -> Option<Value> {
        match object {
            Value::Instance(inst) if !inst.fields.borrow().contains_key(name) => {
                inst.class.get(name).filter(|f| matches!(f, Value::Function(_) | Value::Native(_)))
            }
            Value::Str(_) | Value::List(_) | Value::Dict(_) => natives::builtin_method(object, name),
            _ => None,
        }
    }

    fn store_attr(&self, object: &Value, name: &str, value: Value) -> Result<(), HostError> {
        match object {
            Value::Instance(inst) => {
                inst.fields.borrow_mut().insert(name.to_string(), value);
            }
            Value::Module(m) => m.set(name, value),
            Value::Class(c) => c.set(name, value),
            Value::Tagged(_) => {}
            other => {
                return Err(HostError::Attribute(format!(
                    "'{}' object attribute '{}' is read-only",
                    other.type_name(),
                    name
                )))
            }
        }
        Ok(())
    }

    fn import(&mut self, name: &str, fromlist: &Value, level: i64) -> Result<Value, HostError> {
        if level > 0 {
            return Err(HostError::Import("attempted relative import with no known parent package".into()));
        }
        let module = self.modules.get(name).ok_or_else(|| HostError::ModuleNotFound(name.to_string()))?;
        let wants_names = fromlist.sequence_items().is_some_and(|items| !items.is_empty());
        if !wants_names {
            if let Some((top, _)) = name.split_once('.') {
                if let Some(top) = self.modules.get(top) {
                    return Ok(Value::Module(Rc::clone(top)));
                }
            }
        }
        Ok(Value::Module(Rc::clone(module)))
    }

    // ─── Calls ───

    /// Callable, arguments, and keyword names for a call instruction.
    fn pop_call(&mut self, id: FrameId, instr: &Instruction) -> Result<(Value, Vec<Value>, Vec<String>), HostError> {
        let argc = instr.arg as usize;
        match instr.op {
            OpCode::CallFunctionKw => {
                let names = self.pop(id)?;
                let kwnames = keyword_names(&names)?;
                let args = self.pop_n(id, argc)?;
                let callable = self.pop(id)?;
                Ok((callable, args, kwnames))
            }
            OpCode::CallMethod => {
                let args = self.pop_n(id, argc)?;
                let receiver = self.pop(id)?;
                let method = self.pop(id)?;
                match method {
                    Value::Null => Ok((receiver, args, Vec::new())),
                    method => {
                        let mut full = Vec::with_capacity(args.len() + 1);
                        full.push(receiver);
                        full.extend(args);
                        Ok((method, full, Vec::new()))
                    }
                }
            }
            OpCode::CallFunctionEx => {
                let kwargs = if instr.arg & 1 != 0 { Some(self.pop(id)?) } else { None };
                let packed = self.pop(id)?;
                let callable = self.pop(id)?;
                let mut args = ops::iterate(&packed)?;
                let mut kwnames = Vec::new();
                if let Some(Value::Dict(pairs)) = kwargs {
                    for (key, value) in pairs.borrow().iter() {
                        let key = key
                            .as_str()
                            .ok_or_else(|| HostError::Type("keywords must be strings".into()))?;
                        kwnames.push(key.to_string());
                        args.push(value.clone());
                    }
                }
                Ok((callable, args, kwnames))
            }
            _ => {
                let args = self.pop_n(id, argc)?;
                let callable = self.pop(id)?;
                Ok((callable, args, Vec::new()))
            }
        }
    }

    pub(crate) fn call_value(
        &mut self,
        hook: &mut dyn InstructionHook,
        callable: &Value,
        args: &[Value],
        kwnames: &[String],
    ) -> Result<Value, HostError> {
        if kwnames.len() > args.len() {
            return Err(HostError::Fatal("more keyword names than arguments".into()));
        }
        match callable {
            Value::Function(func) => self.call_function(hook, func, args, kwnames),
            Value::Native(native) => self.call_native(hook, native, args, kwnames),
            Value::BoundMethod(bound) => {
                let mut full = Vec::with_capacity(args.len() + 1);
                full.push(bound.receiver.clone());
                full.extend_from_slice(args);
                self.call_value(hook, &bound.func, &full, kwnames)
            }
            Value::Class(class) => self.instantiate(hook, class, args, kwnames),
            Value::Tagged(tagged) => {
                let executed = match &tagged.original {
                    Some(original) if tagged.needs_original_execution() => {
                        Some(self.call_value(hook, original, args, kwnames))
                    }
                    _ => None,
                };
                tagged.call_outcome(args, executed)
            }
            other => Err(HostError::Type(format!("'{}' object is not callable", other.type_name()))),
        }
    }

    fn call_function(
        &mut self,
        hook: &mut dyn InstructionHook,
        func: &FunctionValue,
        args: &[Value],
        kwnames: &[String],
    ) -> Result<Value, HostError> {
        let fast = bind_arguments(func, args, kwnames)?;
        self.enter(hook, Rc::clone(&func.code), Rc::clone(&func.globals), fast)
    }

    /// Run `code` in a new frame called from the current one.
    pub(crate) fn enter(
        &mut self,
        hook: &mut dyn InstructionHook,
        code: Rc<CodeObject>,
        globals: Rc<ModuleValue>,
        fast: Vec<Option<Value>>,
    ) -> Result<Value, HostError> {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(self.fail(VmError::StackOverflow(MAX_CALL_DEPTH)));
        }
        let name = code.name.clone();
        let id = self.frames.push(code, globals, self.current);
        self.frame_mut(id)?.fast = fast;
        self.emit(|| DebugEvent::CallEnter { name: name.clone() });
        self.depth += 1;
        let result = self.run_frame(hook, id);
        self.depth -= 1;
        self.emit(|| DebugEvent::CallExit { name });
        result
    }

    fn instantiate(
        &mut self,
        hook: &mut dyn InstructionHook,
        class: &Rc<ClassValue>,
        args: &[Value],
        kwnames: &[String],
    ) -> Result<Value, HostError> {
        if class.is_exception {
            let message = args.first().map(Value::display_text).unwrap_or_default();
            return Ok(Value::Exception(Rc::new(ExceptionValue { kind: class.name.clone(), message })));
        }
        let instance = Value::Instance(InstanceValue::new(Rc::clone(class)));
        if let Some(init) = class.get("__init__") {
            let mut full = Vec::with_capacity(args.len() + 1);
            full.push(instance.clone());
            full.extend_from_slice(args);
            self.call_value(hook, &init, &full, kwnames)?;
        }
        Ok(instance)
    }

    pub(crate) fn allocate_fd(&mut self) -> i64 {
        let fd = self.next_fd;
        self.next_fd += 1;
        fd
    }
}

fn bind(receiver: &Value, attr: Value) -> Value {
    match attr {
        Value::Function(_) | Value::Native(_) => {
            Value::BoundMethod(Rc::new(BoundMethod { receiver: receiver.clone(), func: attr }))
        }
        other => other,
    }
}

fn keyword_names(names: &Value) -> Result<Vec<String>, HostError> {
    let items = names
        .sequence_items()
        .ok_or_else(|| HostError::Type("keyword names must be a tuple".into()))?;
    items
        .iter()
        .map(|n| n.as_str().map(str::to_string).ok_or_else(|| HostError::Type("keywords must be strings".into())))
        .collect()
}

/// Fill a function's local slots from positional, keyword, and default values.
fn bind_arguments(func: &FunctionValue, args: &[Value], kwnames: &[String]) -> Result<Vec<Option<Value>>, HostError> {
    let code = &func.code;
    let argc = code.argcount as usize;
    let npos = args.len() - kwnames.len();
    if npos > argc {
        return Err(HostError::Type(format!(
            "{}() takes {} positional arguments but {} were given",
            func.name, argc, npos
        )));
    }
    let mut fast = vec![None; code.varnames.len().max(argc)];
    for (slot, value) in args[..npos].iter().enumerate() {
        fast[slot] = Some(value.clone());
    }
    for (name, value) in kwnames.iter().zip(&args[npos..]) {
        let slot = code.varnames[..argc.min(code.varnames.len())]
            .iter()
            .position(|v| v == name)
            .ok_or_else(|| {
                HostError::Type(format!("{}() got an unexpected keyword argument '{}'", func.name, name))
            })?;
        if fast[slot].replace(value.clone()).is_some() {
            return Err(HostError::Type(format!("{}() got multiple values for argument '{}'", func.name, name)));
        }
    }
    let first_default = argc.saturating_sub(func.defaults.len());
    for (slot, value) in fast.iter_mut().enumerate().take(argc) {
        if value.is_none() {
            match slot.checked_sub(first_default).and_then(|i| func.defaults.get(i)) {
                Some(default) => *value = Some(default.clone()),
                None => {
                    return Err(HostError::Type(format!(
                        "{}() missing required positional argument #{}",
                        func.name,
                        slot + 1
                    )))
                }
            }
        }
    }
    Ok(fast)
}

/// The error a `raise` of `value` produces.
fn raised_error(value: &Value) -> HostError {
    match value {
        Value::Exception(e) => HostError::Raised { kind: e.kind.clone(), message: e.message.clone() },
        Value::Class(c) if c.is_exception => HostError::Raised { kind: c.name.clone(), message: String::new() },
        Value::Tagged(t) => HostError::Raised { kind: "Exception".into(), message: t.to_string() },
        _ => HostError::Type("exceptions must derive from BaseException".into()),
    }
}

/// Built-in exception hierarchy, child to parent.
fn parent_exception(kind: &str) -> Option<&'static str> {
    Some(match kind {
        "BaseException" => return None,
        "SystemExit" | "KeyboardInterrupt" | "Exception" => "BaseException",
        "ModuleNotFoundError" => "ImportError",
        "UnboundLocalError" => "NameError",
        "IndexError" | "KeyError" => "LookupError",
        "ZeroDivisionError" | "OverflowError" => "ArithmeticError",
        "ConnectionRefusedError" | "ConnectionResetError" => "ConnectionError",
        "ConnectionError" | "FileNotFoundError" | "PermissionError" | "TimeoutError" => "OSError",
        _ => "Exception",
    })
}

fn exception_matches(raised: &Value, handler: &Value) -> bool {
    let raised_kind = match raised {
        Value::Class(c) => c.name.as_str(),
        Value::Exception(e) => e.kind.as_str(),
        _ => return false,
    };
    match handler {
        Value::Tuple(options) => options.iter().any(|h| exception_matches(raised, h)),
        Value::Class(class) => {
            let mut kind = Some(raised_kind);
            while let Some(k) = kind {
                if k == class.name {
                    return true;
                }
                kind = parent_exception(k);
            }
            false
        }
        // tagged handlers stand in for classes the host never had
        Value::Tagged(_) => true,
        _ => false,
    }
}

impl Host for Vm {
    fn frames(&self) -> &FrameArena {
        &self.frames
    }

    fn frames_mut(&mut self) -> &mut FrameArena {
        &mut self.frames
    }

    fn current_frame(&self) -> Option<FrameId> {
        self.current
    }

    fn invoke(
        &mut self,
        hook: &mut dyn InstructionHook,
        callable: &Value,
        args: &[Value],
        kwnames: &[String],
    ) -> Result<Value, HostError> {
        self.call_value(hook, callable, args, kwnames)
    }

    fn unary_op(&mut self, op: UnaryOp, operand: &Value) -> Result<Value, HostError> {
        ops::unary(op, operand)
    }

    fn binary_op(&mut self, op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, HostError> {
        ops::binary(op, lhs, rhs)
    }

    fn compare_op(&mut self, op: CompareOp, lhs: &Value, rhs: &Value) -> Result<Value, HostError> {
        ops::compare(op, lhs, rhs)
    }

    fn import_module(&mut self, name: &str, fromlist: &Value, level: i64) -> Result<Value, HostError> {
        self.import(name, fromlist, level)
    }

    fn get_attr(&mut self, object: &Value, name: &str) -> Result<Value, HostError> {
        self.load_attr(object, name)
    }

    fn module(&self, name: &str) -> Option<Rc<ModuleValue>> {
        self.modules.get(name).cloned()
    }

    fn register_module(&mut self, module: Rc<ModuleValue>) {
        self.modules.insert(module.name.clone(), module);
    }
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("frames", &self.frames.len())
            .field("modules", &self.modules.keys().collect::<Vec<_>>())
            .field("instruction_count", &self.instruction_count)
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}
