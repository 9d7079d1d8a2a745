//! The per-instruction hook.
//!
//! `pre_instruction` runs before every instruction of an analysed frame. It
//! first captures the call about to be dispatched and runs the detection
//! pipeline over it, then either lets the host proceed (skip 0), replaces the
//! instruction's effect (skip 1), or rewrites control flow (skip n). The
//! indirect-taint tracker is updated last, whatever happened before.

use crate::args::{CallArguments, CallLayout, CallVariant};
use crate::context::{EngineContext, RunState};
use crate::detect::{CallSite, DetectCx};
use crate::flatten::{is_dead_loop_back_edge, plan, FlattenAnomaly, FrameFacts, Rewrite};
use crate::record::CallRecord;
use crate::region::RegionTracker;
use crate::search::GuardedSearch;
use std::rc::Rc;
use taintwatch_core::bytecode::{CodeObject, CompareOp, Instruction, OpCode};
use taintwatch_core::frame::FrameId;
use taintwatch_core::host::{Host, HostError, InstructionHook};
use taintwatch_core::tagged::{combine, highest_priority, is_kind, TagKind, TaggedValue};
use taintwatch_core::values::Value;
use tracing::{debug, info, warn};

impl InstructionHook for EngineContext {
    fn pre_instruction(&mut self, host: &mut dyn Host, instr: &Instruction) -> usize {
        if !self.config.enable || !self.hook_enabled.get() || self.verdict.is_some() {
            return 0;
        }
        let Some(frame) = host.current_frame() else {
            return 0;
        };
        let Some((code, index)) = host.frames().get(frame).map(|f| (Rc::clone(&f.code), f.lasti)) else {
            return 0;
        };
        if !self.admits(frame, &code.filename) {
            return 0;
        }

        self.record.invalidate();
        if instr.op.is_call() {
            self.analyse_call(host, frame, instr);
            if self.verdict.is_some() {
                return 0;
            }
        }

        let skip = self.dispatch(host, frame, &code, index, instr);
        self.regions.update(host.frames(), frame, index, instr.op, skip);
        skip
    }

    fn terminated(&self) -> bool {
        self.verdict.is_some()
    }
}

impl EngineContext {
    /// Frame filter plus the `Initializing -> Recording` transition.
    fn admits(&mut self, frame: FrameId, filename: &str) -> bool {
        if self.state == RunState::Initializing {
            if !self.filter.is_main_file(filename) {
                return false;
            }
            info!(script = filename, "main script reached; recording");
            self.state = RunState::Recording;
        }
        self.filter.accepts(frame, filename)
    }

    /// Capture the call about to run and feed it to the pipeline.
    fn analyse_call(&mut self, host: &dyn Host, frame: FrameId, instr: &Instruction) {
        let Some(stack) = host.frames().get(frame).map(|f| &f.stack) else {
            return;
        };
        let Some(variant) = CallVariant::from_instruction(instr) else {
            return;
        };
        let layout = match CallLayout::locate(stack, variant) {
            Ok(layout) => layout,
            Err(err) => {
                debug!(error = %err, "call layout unavailable");
                return;
            }
        };
        self.record = CallRecord::capture(layout.callable(stack), instr, frame);
        if !self.record.is_valid() {
            return;
        }
        let args = layout.arguments(stack).unwrap_or_else(|err| {
            debug!(call = %self.record.qualified_name(), error = %err, "treating call as having no arguments");
            CallArguments::empty()
        });

        let previous = std::mem::replace(&mut self.state, RunState::Analysing);
        let site = CallSite { record: &self.record, args: &args, in_region: self.regions.in_region() };
        let mut cx = DetectCx {
            search: GuardedSearch::new(self.searcher.as_ref(), &self.hook_enabled),
            trace: &mut self.trace_callback,
        };
        let verdict = self.pipeline.run(&site, &mut cx);
        self.state = previous;
        if verdict.is_some() {
            self.verdict = verdict;
        }
    }

    fn dispatch(&mut self, host: &mut dyn Host, frame: FrameId, code: &CodeObject, index: usize, instr: &Instruction) -> usize {
        let op = instr.op;
        if op.is_conditional_branch() && peek(host, frame, 0).is_some_and(|v| is_kind(v, TagKind::Taint)) {
            if let Some(end) = RegionTracker::region_end(code, index) {
                self.regions.enter(host.frames(), frame, index, end);
            }
        }

        let intercepted = if let Some(unary) = op.unary_op() {
            intercept_unary(host, frame, |h, v| h.unary_op(unary, v))
        } else if let Some(binary) = op.binary_op() {
            intercept_binary(host, frame, |h, l, r| h.binary_op(binary, l, r))
        } else {
            match op {
                OpCode::CompareOp => match CompareOp::from_arg(instr.arg) {
                    // a tagged equality result is not representable
                    Some(CompareOp::Eq | CompareOp::Ne) => {
                        intercept_binary(host, frame, |_, _, _| Err(HostError::Type("tagged equality".into())))
                    }
                    Some(cmp) => intercept_binary(host, frame, |h, l, r| h.compare_op(cmp, l, r)),
                    None => None,
                },
                OpCode::ContainsOp => {
                    let cmp = if instr.arg == 1 { CompareOp::NotIn } else { CompareOp::In };
                    intercept_binary(host, frame, |h, l, r| h.compare_op(cmp, l, r))
                }
                OpCode::BuildString => intercept_build_string(host, frame, instr.arg as usize),
                OpCode::CallFunction | OpCode::CallFunctionKw | OpCode::CallMethod | OpCode::CallFunctionEx => {
                    Some(self.intercept_call(host, frame, instr))
                }
                OpCode::ImportName => intercept_import(host, frame, code, instr),
                OpCode::ImportFrom => intercept_import_from(host, frame, code, instr),
                OpCode::ImportStar => intercept_import_star(host, frame),
                OpCode::UnpackSequence => intercept_unpack(host, frame, instr.arg as usize),
                _ => None,
            }
        };
        match intercepted {
            Some(skip) => skip,
            None => self.flatten(host, frame, code, index, instr),
        }
    }

    /// Run the call through the host and push its result, falling back to the
    /// most dangerous argument when the callee raises.
    fn intercept_call(&mut self, host: &mut dyn Host, frame: FrameId, instr: &Instruction) -> usize {
        let Some(variant) = CallVariant::from_instruction(instr) else {
            unreachable!("call interception on {}", instr.op)
        };
        let prepared = {
            let Some(stack) = host.frames().get(frame).map(|f| &f.stack) else {
                return 0;
            };
            match CallLayout::locate(stack, variant) {
                Ok(layout) => {
                    let args = layout.arguments(stack).unwrap_or_else(|err| {
                        debug!(error = %err, "calling with no arguments");
                        CallArguments::empty()
                    });
                    let fallback = args.highest_tagged().cloned();
                    let (args, kwnames) = args.into_call_parts();
                    Some((layout.callable(stack).clone(), args, kwnames, fallback, layout.slots))
                }
                Err(_) => None,
            }
        };
        // leave malformed stacks to the host
        let Some((callable, args, kwnames, fallback, slots)) = prepared else {
            return 0;
        };
        if let Some(stack) = stack_mut(host, frame) {
            let keep = stack.len() - slots;
            stack.truncate(keep);
        }

        let result = match host.invoke(self, &callable, &args, &kwnames) {
            Ok(value) => value,
            Err(err) if err.is_fatal() => {
                debug!(error = %err, "fatal error during intercepted call");
                return 1;
            }
            Err(err) => {
                debug!(callable = callable.type_name(), error = %err, "call failed; substituting fallback");
                fallback.unwrap_or(Value::None)
            }
        };
        push(host, frame, result);
        1
    }

    fn flatten(&mut self, host: &mut dyn Host, frame: FrameId, code: &CodeObject, index: usize, instr: &Instruction) -> usize {
        if !self.config.jump_branch {
            if is_dead_loop_back_edge(code, index) {
                debug!(code = %code.name, index, "breaking trailing loop back-edge");
                return 1;
            }
            return 0;
        }
        let facts = host
            .frames()
            .get(frame)
            .map(|f| FrameFacts { exception_pending: f.handling_exception(), block_depth: f.block_depth() })
            .unwrap_or_default();
        match plan(code, index, facts) {
            Ok(Rewrite::Run) => 0,
            Ok(Rewrite::Skip(n)) => n,
            Ok(Rewrite::PopAndSkip(n)) => {
                pop(host, frame, 1);
                n
            }
            Err(reason) => {
                warn!(code = %code.name, index, op = %instr.op, %reason, "flatten anomaly; leaving instruction to the host");
                self.anomalies.push(FlattenAnomaly { code: code.name.clone(), index, op: instr.op, reason });
                0
            }
        }
    }
}

fn peek(host: &dyn Host, frame: FrameId, depth: usize) -> Option<&Value> {
    host.frames().get(frame)?.peek(depth)
}

fn stack_mut(host: &mut dyn Host, frame: FrameId) -> Option<&mut Vec<Value>> {
    host.frames_mut().get_mut(frame).map(|f| &mut f.stack)
}

fn push(host: &mut dyn Host, frame: FrameId, value: Value) {
    if let Some(stack) = stack_mut(host, frame) {
        stack.push(value);
    }
}

/// Pop `n` values, returned bottom first.
fn pop(host: &mut dyn Host, frame: FrameId, n: usize) -> Vec<Value> {
    match stack_mut(host, frame) {
        Some(stack) if stack.len() >= n => {
            let at = stack.len() - n;
            stack.split_off(at)
        }
        _ => Vec::new(),
    }
}

fn intercept_unary<F>(host: &mut dyn Host, frame: FrameId, op: F) -> Option<usize>
where
    F: FnOnce(&mut dyn Host, &Value) -> Result<Value, HostError>,
{
    let operand = peek(host, frame, 0).filter(|v| v.is_tagged())?.clone();
    let result = match op(host, &operand) {
        Ok(value) => value,
        Err(err) if err.is_fatal() => return Some(1),
        Err(err) => {
            debug!(error = %err, "unary op on tagged operand; keeping operand");
            operand
        }
    };
    pop(host, frame, 1);
    push(host, frame, result);
    Some(1)
}

fn intercept_binary<F>(host: &mut dyn Host, frame: FrameId, op: F) -> Option<usize>
where
    F: FnOnce(&mut dyn Host, &Value, &Value) -> Result<Value, HostError>,
{
    let rhs = peek(host, frame, 0)?;
    let lhs = peek(host, frame, 1)?;
    if !lhs.is_tagged() && !rhs.is_tagged() {
        return None;
    }
    let (lhs, rhs) = (lhs.clone(), rhs.clone());
    let result = match op(host, &lhs, &rhs) {
        Ok(value) => value,
        Err(err) if err.is_fatal() => return Some(1),
        Err(err) => {
            debug!(error = %err, "binary op on tagged operand; substituting lower-ranked operand");
            combine(&lhs, &rhs).clone()
        }
    };
    pop(host, frame, 2);
    push(host, frame, result);
    Some(1)
}

fn intercept_build_string(host: &mut dyn Host, frame: FrameId, count: usize) -> Option<usize> {
    let stack = &host.frames().get(frame)?.stack;
    let pieces = stack.get(stack.len().checked_sub(count)?..)?;
    let best = highest_priority(pieces)?.clone();
    pop(host, frame, count);
    push(host, frame, best);
    Some(1)
}

/// Real import first; a missing module becomes an `Undefined` stand-in.
fn intercept_import(host: &mut dyn Host, frame: FrameId, code: &CodeObject, instr: &Instruction) -> Option<usize> {
    let name = code.name_at(instr.arg)?.to_string();
    if peek(host, frame, 1).is_none() {
        return None;
    }
    let operands = pop(host, frame, 2);
    let (level, fromlist) = (&operands[0], &operands[1]);
    match host.import_module(&name, fromlist, level.as_int().unwrap_or(0)) {
        Ok(module) => push(host, frame, module),
        Err(err) if err.is_module_not_found() => {
            debug!(module = %name, "module not found; substituting undefined stand-in");
            push(host, frame, Value::tagged(TaggedValue::undefined()));
        }
        Err(err) if err.is_fatal() => {}
        Err(err) => {
            debug!(module = %name, error = %err, "import failed; leaving it to the host");
            if let Some(stack) = stack_mut(host, frame) {
                stack.extend(operands);
            }
            return Some(0);
        }
    }
    Some(1)
}

fn intercept_import_from(host: &mut dyn Host, frame: FrameId, code: &CodeObject, instr: &Instruction) -> Option<usize> {
    let name = code.name_at(instr.arg)?;
    let missing = match peek(host, frame, 0)? {
        Value::Module(module) if module.is_synthetic() && !module.contains(name) => module.name.clone(),
        _ => return None,
    };
    debug!(module = %missing, name, "missing name on synthesized module");
    push(host, frame, Value::tagged(TaggedValue::undefined()));
    Some(1)
}

fn intercept_import_star(host: &mut dyn Host, frame: FrameId) -> Option<usize> {
    peek(host, frame, 0).filter(|v| v.is_tagged())?;
    pop(host, frame, 1);
    Some(1)
}

fn intercept_unpack(host: &mut dyn Host, frame: FrameId, count: usize) -> Option<usize> {
    let value = peek(host, frame, 0).filter(|v| v.is_tagged())?.clone();
    pop(host, frame, 1);
    for _ in 0..count {
        push(host, frame, value.clone());
    }
    Some(1)
}
