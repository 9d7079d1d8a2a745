//! Tagged values: the taint / threat / custom / undefined object model.
//!
//! Every tracked value is a `Value::Tagged` carrying an explicit [`TagKind`].
//! Kinds are ordered by rank; when two values meet in an operation the one
//! with the lower rank (the more dangerous one) survives.
//!
//! Tagged values also define their own small object protocol, which the host
//! consults whenever a script touches one directly:
//! - attribute lookup returns the value itself
//! - iteration yields the value itself [`TAGGED_ITER_LEN`] times
//! - calling returns the highest-priority argument when it outranks the
//!   callee, otherwise the callee (threat sinks may first run the original)

use crate::host::HostError;
use crate::values::{Value, PLAIN_RANK};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::rc::Rc;

/// Number of items produced when a script iterates over a tagged value.
pub const TAGGED_ITER_LEN: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagKind {
    Taint,
    Threat,
    Custom,
    Undefined,
}

impl TagKind {
    pub const ALL: [TagKind; 4] = [TagKind::Taint, TagKind::Threat, TagKind::Custom, TagKind::Undefined];

    pub fn rank(self) -> u8 {
        match self {
            TagKind::Taint => 0,
            TagKind::Threat => 1,
            TagKind::Custom => 2,
            TagKind::Undefined => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TagKind::Taint => "taint",
            TagKind::Threat => "threat",
            TagKind::Custom => "custom",
            TagKind::Undefined => "undefined",
        }
    }

    pub fn type_name(self) -> &'static str {
        match self {
            TagKind::Taint => "TaintObject",
            TagKind::Threat => "ThreatObject",
            TagKind::Custom => "CustomObject",
            TagKind::Undefined => "UndefObject",
        }
    }
}

/// What a threat sink does with its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThreatKind {
    CommandExec,
    CodeExec,
    ThreadExec,
}

impl ThreatKind {
    pub fn name(self) -> &'static str {
        match self {
            ThreatKind::CommandExec => "command-exec",
            ThreatKind::CodeExec => "code-exec",
            ThreatKind::ThreadExec => "thread-exec",
        }
    }
}

/// Which kind of host object a descriptor replaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Method,
    Class,
    Function,
    Variable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverrideAction {
    /// Do not run the original; behave like an undefined stand-in.
    Skip,
}

/// Immutable description of one source, sink, or override target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub module: String,
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub func: Option<String>,
    #[serde(default)]
    pub var: Option<String>,
    pub object_kind: ObjectKind,
    #[serde(default = "default_tag")]
    pub tag: TagKind,
    /// Argument positions that carry the effect; 0 is the return value.
    #[serde(default)]
    pub active_positions: Vec<i32>,
    #[serde(default)]
    pub threat: Option<ThreatKind>,
    #[serde(default)]
    pub needs_original_execution: bool,
    #[serde(default)]
    pub action: Option<OverrideAction>,
}

fn default_tag() -> TagKind {
    TagKind::Taint
}

impl Descriptor {
    /// Table key in `module[-class][-member]` form.
    pub fn key(&self) -> String {
        let mut key = self.module.clone();
        for part in [&self.class, &self.method, &self.func, &self.var].into_iter().flatten() {
            key.push('-');
            key.push_str(part);
        }
        key
    }

    /// Attribute name replaced on the owning module or class.
    pub fn member(&self) -> Option<&str> {
        match self.object_kind {
            ObjectKind::Class => self.class.as_deref(),
            ObjectKind::Method => self.method.as_deref(),
            ObjectKind::Function => self.func.as_deref(),
            ObjectKind::Variable => self.var.as_deref(),
        }
    }

    /// Name used when matching a call against denylists: class, then method, then function.
    pub fn callable_name(&self) -> Option<&str> {
        self.class.as_deref().or(self.method.as_deref()).or(self.func.as_deref())
    }
}

/// A value replaced or created by the engine.
#[derive(Debug)]
pub struct TaggedValue {
    pub kind: TagKind,
    pub descriptor: Option<Rc<Descriptor>>,
    /// The host object this value stands in for, if one existed.
    pub original: Option<Value>,
    /// True for stand-ins fabricated by the engine (failed imports, missing attributes).
    pub synthetic: bool,
}

impl TaggedValue {
    pub fn new(kind: TagKind, descriptor: Option<Rc<Descriptor>>, original: Option<Value>) -> Self {
        Self { kind, descriptor, original, synthetic: false }
    }

    pub fn from_descriptor(descriptor: Rc<Descriptor>, original: Option<Value>) -> Self {
        Self::new(descriptor.tag, Some(descriptor), original)
    }

    /// An `Undefined` stand-in for something the host could not provide.
    pub fn undefined() -> Self {
        Self { kind: TagKind::Undefined, descriptor: None, original: None, synthetic: true }
    }

    pub fn rank(&self) -> u8 {
        self.kind.rank()
    }

    pub fn needs_original_execution(&self) -> bool {
        self.kind == TagKind::Threat
            && self.original.is_some()
            && self.descriptor.as_ref().is_some_and(|d| d.needs_original_execution)
    }

    pub fn threat(&self) -> Option<ThreatKind> {
        self.descriptor.as_ref().and_then(|d| d.threat)
    }

    /// Attribute lookup on a tagged value yields the value itself.
    pub fn get_attr(self: &Rc<Self>, _name: &str) -> Value {
        Value::Tagged(Rc::clone(self))
    }

    /// Items produced when a script iterates over this value.
    pub fn iter_items(self: &Rc<Self>) -> Vec<Value> {
        vec![Value::Tagged(Rc::clone(self)); TAGGED_ITER_LEN]
    }

    /// Result of calling this value.
    ///
    /// `executed` is the outcome of running the original, when the host ran it.
    /// Fatal host errors pass through; every other failure falls back to the
    /// rank rule.
    pub fn call_outcome(
        self: &Rc<Self>,
        args: &[Value],
        executed: Option<Result<Value, HostError>>,
    ) -> Result<Value, HostError> {
        match executed {
            Some(Ok(value)) => return Ok(value),
            Some(Err(err)) if err.is_fatal() => return Err(err),
            _ => {}
        }
        match highest_priority(args) {
            Some(best) if best.rank() < self.rank() => Ok(best.clone()),
            _ => Ok(Value::Tagged(Rc::clone(self))),
        }
    }
}

impl fmt::Display for TaggedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.descriptor {
            Some(d) => write!(f, "<{} {}>", self.kind.type_name(), d.key()),
            None => write!(f, "<{}>", self.kind.type_name()),
        }
    }
}

/// Propagation rank of any value; untracked values return the sentinel max.
pub fn rank(value: &Value) -> u8 {
    value.rank()
}

/// Whichever operand has the lower rank; ties keep `a`.
pub fn combine<'a>(a: &'a Value, b: &'a Value) -> &'a Value {
    if b.rank() < a.rank() {
        b
    } else {
        a
    }
}

/// Kind membership of the value itself. Containers are not searched.
pub fn is_kind(value: &Value, kind: TagKind) -> bool {
    value.tag_kind() == Some(kind)
}

/// Kind membership of the value or any direct element of a list, tuple, or
/// dict (keys and values). Nested containers are not searched.
pub fn contains_kind_shallow(value: &Value, kind: TagKind) -> bool {
    if is_kind(value, kind) {
        return true;
    }
    match value {
        Value::List(items) => items.borrow().iter().any(|v| is_kind(v, kind)),
        Value::Tuple(items) => items.iter().any(|v| is_kind(v, kind)),
        Value::Dict(pairs) => pairs.borrow().iter().any(|(k, v)| is_kind(k, kind) || is_kind(v, kind)),
        _ => false,
    }
}

/// The tagged value with the lowest rank, first occurrence on ties.
pub fn highest_priority<'a, I>(values: I) -> Option<&'a Value>
where
    I: IntoIterator<Item = &'a Value>,
{
    let mut best: Option<&Value> = None;
    for value in values {
        if value.rank() == PLAIN_RANK {
            continue;
        }
        best = match best {
            Some(current) => Some(combine(current, value)),
            None => Some(value),
        };
    }
    best
}
