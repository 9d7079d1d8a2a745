//! Runtime values seen by the host VM and the engine.

use crate::bytecode::{CodeObject, Constant};
use crate::tagged::{TagKind, TaggedValue};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

/// Rank of an untracked value; lower ranks win when values combine.
pub const PLAIN_RANK: u8 = u8::MAX;

/// A runtime value.
#[derive(Debug, Clone)]
pub enum Value {
    None,
    /// Empty receiver slot left by `LOAD_METHOD` when no method was bound.
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    List(Rc<RefCell<Vec<Value>>>),
    Tuple(Rc<Vec<Value>>),
    Dict(Rc<RefCell<Vec<(Value, Value)>>>),
    Module(Rc<ModuleValue>),
    Function(Rc<FunctionValue>),
    Native(Rc<NativeFunction>),
    Class(Rc<ClassValue>),
    Instance(Rc<InstanceValue>),
    BoundMethod(Rc<BoundMethod>),
    Code(Rc<CodeObject>),
    Iterator(Rc<RefCell<IterState>>),
    Exception(Rc<ExceptionValue>),
    Tagged(Rc<TaggedValue>),
}

/// A module namespace.
#[derive(Debug)]
pub struct ModuleValue {
    pub name: String,
    pub attrs: RefCell<BTreeMap<String, Value>>,
    /// Set for modules fabricated because the host does not provide them.
    pub synthetic: Cell<bool>,
}

impl ModuleValue {
    pub fn new(name: impl Into<String>) -> Rc<Self> {
        Rc::new(Self {
            name: name.into(),
            attrs: RefCell::new(BTreeMap::new()),
            synthetic: Cell::new(false),
        })
    }

    pub fn synthetic(name: impl Into<String>) -> Rc<Self> {
        let module = Self::new(name);
        module.synthetic.set(true);
        module
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.attrs.borrow().get(name).cloned()
    }

    pub fn set(&self, name: impl Into<String>, value: Value) {
        self.attrs.borrow_mut().insert(name.into(), value);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.attrs.borrow().contains_key(name)
    }

    pub fn is_synthetic(&self) -> bool {
        self.synthetic.get()
    }
}

/// A script-defined function.
#[derive(Debug)]
pub struct FunctionValue {
    pub name: String,
    pub code: Rc<CodeObject>,
    pub globals: Rc<ModuleValue>,
    pub defaults: Vec<Value>,
}

/// A function provided by the host; `id` indexes the host's native table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeFunction {
    pub module: String,
    pub class: Option<String>,
    pub name: String,
    pub id: u32,
}

#[derive(Debug)]
pub struct ClassValue {
    pub name: String,
    pub module: Option<String>,
    pub attrs: RefCell<BTreeMap<String, Value>>,
    /// Exception classes construct `ExceptionValue`s instead of instances.
    pub is_exception: bool,
}

impl ClassValue {
    pub fn new(name: impl Into<String>, module: Option<&str>) -> Rc<Self> {
        Rc::new(Self {
            name: name.into(),
            module: module.map(str::to_string),
            attrs: RefCell::new(BTreeMap::new()),
            is_exception: false,
        })
    }

    pub fn exception(name: impl Into<String>) -> Rc<Self> {
        Rc::new(Self {
            name: name.into(),
            module: Some("builtins".into()),
            attrs: RefCell::new(BTreeMap::new()),
            is_exception: true,
        })
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.attrs.borrow().get(name).cloned()
    }

    pub fn set(&self, name: impl Into<String>, value: Value) {
        self.attrs.borrow_mut().insert(name.into(), value);
    }
}

#[derive(Debug)]
pub struct InstanceValue {
    pub class: Rc<ClassValue>,
    pub fields: RefCell<BTreeMap<String, Value>>,
}

impl InstanceValue {
    pub fn new(class: Rc<ClassValue>) -> Rc<Self> {
        Rc::new(Self { class, fields: RefCell::new(BTreeMap::new()) })
    }
}

#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: Value,
    pub func: Value,
}

#[derive(Debug)]
pub struct ExceptionValue {
    pub kind: String,
    pub message: String,
}

/// Iteration cursor over a snapshot of items.
#[derive(Debug)]
pub struct IterState {
    pub items: Vec<Value>,
    pub pos: usize,
}

impl IterState {
    pub fn new(items: Vec<Value>) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self { items, pos: 0 }))
    }
}

impl Iterator for IterState {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        let item = self.items.get(self.pos).cloned()?;
        self.pos += 1;
        Some(item)
    }
}

impl Value {
    pub fn str(s: impl AsRef<str>) -> Value {
        Value::Str(Rc::from(s.as_ref()))
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn tuple(items: Vec<Value>) -> Value {
        Value::Tuple(Rc::new(items))
    }

    pub fn dict(pairs: Vec<(Value, Value)>) -> Value {
        Value::Dict(Rc::new(RefCell::new(pairs)))
    }

    pub fn tagged(tagged: TaggedValue) -> Value {
        Value::Tagged(Rc::new(tagged))
    }

    pub fn from_constant(constant: &Constant) -> Value {
        match constant {
            Constant::None => Value::None,
            Constant::Bool(b) => Value::Bool(*b),
            Constant::Int(n) => Value::Int(*n),
            Constant::Float(f) => Value::Float(*f),
            Constant::Str(s) => Value::str(s),
            Constant::Tuple(items) => Value::tuple(items.iter().map(Value::from_constant).collect()),
            Constant::Code(code) => Value::Code(Rc::clone(code)),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_tagged(&self) -> Option<&Rc<TaggedValue>> {
        match self {
            Value::Tagged(t) => Some(t),
            _ => None,
        }
    }

    /// Items of a list or tuple, cloned.
    pub fn sequence_items(&self) -> Option<Vec<Value>> {
        match self {
            Value::List(items) => Some(items.borrow().clone()),
            Value::Tuple(items) => Some(items.as_ref().clone()),
            _ => None,
        }
    }

    /// Tag kind, or `None` for untracked values.
    pub fn tag_kind(&self) -> Option<TagKind> {
        match self {
            Value::Tagged(t) => Some(t.kind),
            _ => None,
        }
    }

    pub fn is_tagged(&self) -> bool {
        matches!(self, Value::Tagged(_))
    }

    /// Propagation rank; untracked values return [`PLAIN_RANK`].
    pub fn rank(&self) -> u8 {
        self.tag_kind().map(TagKind::rank).unwrap_or(PLAIN_RANK)
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::None | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.borrow().is_empty(),
            Value::Tuple(items) => !items.is_empty(),
            Value::Dict(pairs) => !pairs.borrow().is_empty(),
            _ => true,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Null => "NULL",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Module(_) => "module",
            Value::Function(_) => "function",
            Value::Native(_) => "builtin_function_or_method",
            Value::Class(_) => "type",
            Value::Instance(_) => "object",
            Value::BoundMethod(_) => "method",
            Value::Code(_) => "code",
            Value::Iterator(_) => "iterator",
            Value::Exception(_) => "exception",
            Value::Tagged(t) => t.kind.type_name(),
        }
    }

    /// Reference identity for heap values, structural equality for scalars.
    pub fn is_same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Tuple(a), Value::Tuple(b)) => Rc::ptr_eq(a, b),
            (Value::Dict(a), Value::Dict(b)) => Rc::ptr_eq(a, b),
            (Value::Module(a), Value::Module(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => Rc::ptr_eq(a, b),
            (Value::Class(a), Value::Class(b)) => Rc::ptr_eq(a, b),
            (Value::Instance(a), Value::Instance(b)) => Rc::ptr_eq(a, b),
            (Value::Tagged(a), Value::Tagged(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Python-style `str()` text, used by the host for printing and formatting.
    pub fn display_text(&self) -> String {
        match self {
            Value::Str(s) => s.to_string(),
            other => other.to_string(),
        }
    }

    /// JSON rendering used in trace records.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as J;
        match self {
            Value::None | Value::Null => J::Null,
            Value::Bool(b) => J::Bool(*b),
            Value::Int(n) => J::from(*n),
            Value::Float(f) => serde_json::Number::from_f64(*f).map(J::Number).unwrap_or(J::Null),
            Value::Str(s) => J::String(s.to_string()),
            Value::List(items) => J::Array(items.borrow().iter().map(Value::to_json).collect()),
            Value::Tuple(items) => J::Array(items.iter().map(Value::to_json).collect()),
            Value::Dict(pairs) => {
                let mut map = serde_json::Map::new();
                for (k, v) in pairs.borrow().iter() {
                    map.insert(k.display_text(), v.to_json());
                }
                J::Object(map)
            }
            other => J::String(other.to_string()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => (*a as f64) == *b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Bool(a), Value::Int(b)) | (Value::Int(b), Value::Bool(a)) => (*a as i64) == *b,
            (Value::List(a), Value::List(b)) => *a.borrow() == *b.borrow(),
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::Dict(a), Value::Dict(b)) => *a.borrow() == *b.borrow(),
            (Value::Exception(a), Value::Exception(b)) => a.kind == b.kind && a.message == b.message,
            _ => self.is_same(other),
        }
    }
}

fn join_items(f: &mut fmt::Formatter<'_>, items: &[Value]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        match item {
            Value::Str(s) => write!(f, "'{}'", s)?,
            other => write!(f, "{}", other)?,
        }
    }
    Ok(())
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Null => write!(f, "<NULL>"),
            Value::Bool(true) => write!(f, "True"),
            Value::Bool(false) => write!(f, "False"),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(x) => write!(f, "{:?}", x),
            Value::Str(s) => write!(f, "{}", s),
            Value::List(items) => {
                write!(f, "[")?;
                join_items(f, &items.borrow())?;
                write!(f, "]")
            }
            Value::Tuple(items) => {
                write!(f, "(")?;
                join_items(f, items)?;
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            Value::Dict(pairs) => {
                write!(f, "{{")?;
                for (i, (k, v)) in pairs.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Value::Module(m) => write!(f, "<module '{}'>", m.name),
            Value::Function(func) => write!(f, "<function {}>", func.name),
            Value::Native(n) => match &n.class {
                Some(class) => write!(f, "<built-in method {}.{}.{}>", n.module, class, n.name),
                None => write!(f, "<built-in function {}.{}>", n.module, n.name),
            },
            Value::Class(c) => write!(f, "<class '{}'>", c.name),
            Value::Instance(i) => write!(f, "<{} object>", i.class.name),
            Value::BoundMethod(m) => write!(f, "<bound method {}>", m.func),
            Value::Code(c) => write!(f, "<code {}>", c.name),
            Value::Iterator(_) => write!(f, "<iterator>"),
            Value::Exception(e) => write!(f, "{}: {}", e.kind, e.message),
            Value::Tagged(t) => write!(f, "{}", t),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_values_have_sentinel_rank() {
        assert_eq!(Value::Int(1).rank(), PLAIN_RANK);
        assert_eq!(Value::str("x").rank(), PLAIN_RANK);
        assert!(!Value::list(vec![]).is_tagged());
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::None.is_truthy());
        assert!(!Value::str("").is_truthy());
        assert!(Value::str("a").is_truthy());
        assert!(Value::tuple(vec![Value::Int(0)]).is_truthy());
    }

    #[test]
    fn test_display_matches_script_conventions() {
        let v = Value::list(vec![Value::str("reg"), Value::Int(1)]);
        assert_eq!(v.to_string(), "['reg', 1]");
        assert_eq!(Value::tuple(vec![Value::Int(1)]).to_string(), "(1,)");
        assert_eq!(Value::Bool(true).to_string(), "True");
    }

    #[test]
    fn test_lists_compare_structurally_but_identity_is_by_reference() {
        let a = Value::list(vec![Value::Int(1)]);
        let b = Value::list(vec![Value::Int(1)]);
        assert_eq!(a, b);
        assert!(!a.is_same(&b));
        assert!(a.is_same(&a.clone()));
    }
}
