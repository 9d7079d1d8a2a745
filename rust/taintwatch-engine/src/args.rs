//! Call-argument reconstruction from the operand stack.
//!
//! Four call shapes exist (stack top on the right):
//!
//! | variant          | stack                                       |
//! |------------------|---------------------------------------------|
//! | `CALL_FUNCTION n`    | `callable a1 .. an`                     |
//! | `CALL_FUNCTION_KW n` | `callable a1 .. an kwnames`             |
//! | `CALL_METHOD n`      | `NULL callable a1 .. an` or `method self a1 .. an` |
//! | `CALL_FUNCTION_EX f` | `callable args [kwargs if f & 1]`       |
//!
//! Arguments are exposed as one flat slice (positional values followed by
//! keyword values) plus the keyword names for the trailing entries. Only the
//! dynamic variant can need a freshly built buffer; the slices of the other
//! variants borrow straight from the stack.

use std::borrow::Cow;
use taintwatch_core::bytecode::{Instruction, OpCode};
use taintwatch_core::tagged::highest_priority;
use taintwatch_core::values::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallVariant {
    Positional(usize),
    Keyword(usize),
    Method(usize),
    Dynamic { has_kwargs: bool },
}

impl CallVariant {
    pub fn from_instruction(instr: &Instruction) -> Option<Self> {
        let n = instr.arg as usize;
        Some(match instr.op {
            OpCode::CallFunction => CallVariant::Positional(n),
            OpCode::CallFunctionKw => CallVariant::Keyword(n),
            OpCode::CallMethod => CallVariant::Method(n),
            OpCode::CallFunctionEx => CallVariant::Dynamic { has_kwargs: instr.arg & 1 == 1 },
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArgumentError {
    #[error("call needs {need} stack values but only {have} are present")]
    StackUnderflow { need: usize, have: usize },
    #[error("keyword names are not a tuple of strings")]
    BadKeywordNames,
    #[error("packed arguments are not a sequence (got {0})")]
    ArgsNotSequence(&'static str),
    #[error("keyword arguments are not a plain mapping (got {0})")]
    KeywordsNotMapping(&'static str),
}

/// Stack positions of one call's pieces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallLayout {
    pub variant: CallVariant,
    /// Index of the callable in the stack.
    pub callable: usize,
    /// Number of values the call consumes from the top of the stack.
    pub slots: usize,
    args_start: usize,
    args_end: usize,
}

impl CallLayout {
    pub fn locate(stack: &[Value], variant: CallVariant) -> Result<Self, ArgumentError> {
        let have = stack.len();
        let need = match variant {
            CallVariant::Positional(n) => n + 1,
            CallVariant::Keyword(n) | CallVariant::Method(n) => n + 2,
            CallVariant::Dynamic { has_kwargs } => 2 + has_kwargs as usize,
        };
        if need > have {
            return Err(ArgumentError::StackUnderflow { need, have });
        }
        let base = have - need;
        let (callable, args_start, args_end) = match variant {
            CallVariant::Positional(_) => (base, base + 1, have),
            CallVariant::Keyword(_) => (base, base + 1, have - 1),
            CallVariant::Method(_) => match stack[base] {
                Value::Null => (base + 1, base + 2, have),
                _ => (base, base + 1, have),
            },
            CallVariant::Dynamic { .. } => (base, base + 1, have),
        };
        Ok(Self { variant, callable, slots: need, args_start, args_end })
    }

    pub fn callable<'a>(&self, stack: &'a [Value]) -> &'a Value {
        &stack[self.callable]
    }

    pub fn arguments<'a>(&self, stack: &'a [Value]) -> Result<CallArguments<'a>, ArgumentError> {
        match self.variant {
            CallVariant::Positional(_) | CallVariant::Method(_) => Ok(CallArguments {
                values: Cow::Borrowed(&stack[self.args_start..self.args_end]),
                kwnames: Cow::Borrowed(&[]),
                synthesized: false,
            }),
            CallVariant::Keyword(_) => {
                let names = match &stack[self.args_end] {
                    Value::Tuple(names) if names.iter().all(|n| matches!(n, Value::Str(_))) => names,
                    _ => return Err(ArgumentError::BadKeywordNames),
                };
                let values = &stack[self.args_start..self.args_end];
                if names.len() > values.len() {
                    return Err(ArgumentError::BadKeywordNames);
                }
                Ok(CallArguments {
                    values: Cow::Borrowed(values),
                    kwnames: Cow::Borrowed(names.as_slice()),
                    synthesized: false,
                })
            }
            CallVariant::Dynamic { has_kwargs } => {
                let packed = &stack[self.args_start];
                let mut values = match packed {
                    Value::Tuple(items) if !has_kwargs => {
                        return Ok(CallArguments {
                            values: Cow::Borrowed(items.as_slice()),
                            kwnames: Cow::Borrowed(&[]),
                            synthesized: false,
                        })
                    }
                    Value::Tuple(items) => items.as_ref().clone(),
                    Value::List(items) => items.borrow().clone(),
                    Value::Tagged(t) => t.iter_items(),
                    other => return Err(ArgumentError::ArgsNotSequence(other.type_name())),
                };
                let mut kwnames = Vec::new();
                if has_kwargs {
                    for (name, value) in normalize_keywords(&stack[self.args_start + 1])? {
                        kwnames.push(Value::Str(name));
                        values.push(value);
                    }
                }
                // a list or tagged pack is copied out, but only merged kwargs make a new buffer
                Ok(CallArguments { values: Cow::Owned(values), kwnames: Cow::Owned(kwnames), synthesized: has_kwargs })
            }
        }
    }
}

/// Keyword pairs from a dict, or from a list/tuple of `(name, value)` pairs.
fn normalize_keywords(value: &Value) -> Result<Vec<(std::rc::Rc<str>, Value)>, ArgumentError> {
    let pairs: Vec<(Value, Value)> = match value {
        Value::Dict(pairs) => pairs.borrow().clone(),
        Value::List(_) | Value::Tuple(_) => {
            let items = value.sequence_items().unwrap_or_default();
            let mut pairs = Vec::with_capacity(items.len());
            for item in items {
                match item.sequence_items() {
                    Some(pair) if pair.len() == 2 => pairs.push((pair[0].clone(), pair[1].clone())),
                    _ => return Err(ArgumentError::KeywordsNotMapping(item.type_name())),
                }
            }
            pairs
        }
        other => return Err(ArgumentError::KeywordsNotMapping(other.type_name())),
    };
    pairs
        .into_iter()
        .map(|(k, v)| match k {
            Value::Str(name) => Ok((name, v)),
            other => Err(ArgumentError::KeywordsNotMapping(other.type_name())),
        })
        .collect()
}

/// Reconstructed arguments of one call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallArguments<'a> {
    /// Positional values followed by keyword values.
    values: Cow<'a, [Value]>,
    /// Names of the trailing keyword values; every entry is a `Value::Str`.
    kwnames: Cow<'a, [Value]>,
    synthesized: bool,
}

impl<'a> CallArguments<'a> {
    pub fn empty() -> Self {
        Self { values: Cow::Borrowed(&[]), kwnames: Cow::Borrowed(&[]), synthesized: false }
    }

    /// Extract arguments for the call instruction `instr` from `stack`.
    pub fn extract(stack: &'a [Value], instr: &Instruction) -> Result<Self, ArgumentError> {
        let variant = CallVariant::from_instruction(instr)
            .unwrap_or_else(|| unreachable!("argument extraction on non-call {}", instr.op));
        CallLayout::locate(stack, variant)?.arguments(stack)
    }

    /// True when keyword arguments were merged into a buffer built for this call.
    /// The buffer is released when this value is dropped.
    pub fn is_synthesized(&self) -> bool {
        self.synthesized
    }

    /// Positional and keyword values, in that order.
    pub fn flattened(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn positional(&self) -> &[Value] {
        &self.values[..self.values.len() - self.kwnames.len()]
    }

    pub fn keyword_names(&self) -> impl Iterator<Item = &str> {
        self.kwnames.iter().filter_map(Value::as_str)
    }

    pub fn keywords(&self) -> impl Iterator<Item = (&str, &Value)> {
        let offset = self.values.len() - self.kwnames.len();
        self.keyword_names().zip(&self.values[offset..])
    }

    /// Highest-priority tagged value among the flattened arguments.
    pub fn highest_tagged(&self) -> Option<&Value> {
        highest_priority(self.values.iter())
    }

    /// Bind to declared parameter names: positional values first, then keywords by name.
    /// `None` when there are too many positional values or an unknown keyword.
    pub fn bind(&self, params: &[&str]) -> Option<Vec<Option<&Value>>> {
        let positional = self.positional();
        if positional.len() > params.len() {
            return None;
        }
        let mut bound: Vec<Option<&Value>> = vec![None; params.len()];
        for (slot, value) in bound.iter_mut().zip(positional) {
            *slot = Some(value);
        }
        for (name, value) in self.keywords() {
            let idx = params.iter().position(|p| *p == name)?;
            if bound[idx].is_some() {
                return None;
            }
            bound[idx] = Some(value);
        }
        Some(bound)
    }

    /// Owned argument vector and keyword names, ready to hand to the host.
    pub fn into_call_parts(self) -> (Vec<Value>, Vec<String>) {
        let names = self.keyword_names().map(str::to_string).collect();
        (self.values.into_owned(), names)
    }
}
