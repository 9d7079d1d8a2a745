//! Arithmetic, comparison, subscript, and iteration on host values.
//!
//! Tagged operands are unsupported everywhere in this module; the engine
//! substitutes its own results when these operations fail.

use std::rc::Rc;
use taintwatch_core::bytecode::{BinaryOp, CompareOp, UnaryOp};
use taintwatch_core::host::HostError;
use taintwatch_core::values::Value;

fn unsupported(op: &str, lhs: &Value, rhs: &Value) -> HostError {
    HostError::Type(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        op,
        lhs.type_name(),
        rhs.type_name()
    ))
}

fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Int(n) => Some(*n as f64),
        Value::Bool(b) => Some(*b as i64 as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

/// Index into a sequence of `len` items, Python style (negative from the end).
fn resolve_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let idx = if index < 0 { index + len } else { index };
    (0..len).contains(&idx).then_some(idx as usize)
}

pub(crate) fn unary(op: UnaryOp, operand: &Value) -> Result<Value, HostError> {
    if let Value::Tagged(_) = operand {
        return Err(HostError::Type(format!("bad operand type for unary op: '{}'", operand.type_name())));
    }
    match (op, operand) {
        (UnaryOp::Not, v) => Ok(Value::Bool(!v.is_truthy())),
        (UnaryOp::Positive, Value::Int(_) | Value::Float(_)) => Ok(operand.clone()),
        (UnaryOp::Negative, Value::Int(n)) => n
            .checked_neg()
            .map(Value::Int)
            .ok_or_else(|| HostError::Raised { kind: "OverflowError".into(), message: "integer overflow".into() }),
        (UnaryOp::Negative, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Invert, Value::Int(n)) => Ok(Value::Int(!n)),
        (UnaryOp::Invert, Value::Bool(b)) => Ok(Value::Int(!(*b as i64))),
        _ => Err(HostError::Type(format!("bad operand type for unary op: '{}'", operand.type_name()))),
    }
}

pub(crate) fn binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, HostError> {
    if lhs.is_tagged() || rhs.is_tagged() {
        return Err(unsupported(symbol(op), lhs, rhs));
    }
    if op == BinaryOp::Subscr {
        return subscript(lhs, rhs);
    }
    if let (Some(a), Some(b)) = (lhs.as_int(), rhs.as_int()) {
        return int_arith(op, a, b);
    }
    match (op, lhs, rhs) {
        (BinaryOp::Add, Value::Str(a), Value::Str(b)) => Ok(Value::str(format!("{}{}", a, b))),
        (BinaryOp::Add, Value::List(a), Value::List(b)) => {
            let mut items = a.borrow().clone();
            items.extend(b.borrow().iter().cloned());
            Ok(Value::list(items))
        }
        (BinaryOp::Add, Value::Tuple(a), Value::Tuple(b)) => {
            let mut items = a.as_ref().clone();
            items.extend(b.iter().cloned());
            Ok(Value::tuple(items))
        }
        (BinaryOp::Mul, Value::Str(s), Value::Int(n)) | (BinaryOp::Mul, Value::Int(n), Value::Str(s)) => {
            Ok(Value::str(s.repeat((*n).max(0) as usize)))
        }
        (BinaryOp::Mul, Value::List(items), Value::Int(n)) => {
            let items = items.borrow();
            let mut out = Vec::with_capacity(items.len() * (*n).max(0) as usize);
            for _ in 0..(*n).max(0) {
                out.extend(items.iter().cloned());
            }
            Ok(Value::list(out))
        }
        (BinaryOp::Mod, Value::Str(fmt), args) => Ok(Value::str(percent_format(fmt, args))),
        _ => match (as_float(lhs), as_float(rhs)) {
            (Some(a), Some(b)) => float_arith(op, a, b).ok_or_else(|| unsupported(symbol(op), lhs, rhs)),
            _ => Err(unsupported(symbol(op), lhs, rhs)),
        },
    }
}

fn int_arith(op: BinaryOp, a: i64, b: i64) -> Result<Value, HostError> {
    let overflow = || HostError::Raised { kind: "OverflowError".into(), message: "integer overflow".into() };
    let v = match op {
        BinaryOp::Add => a.checked_add(b).ok_or_else(overflow)?,
        BinaryOp::Sub => a.checked_sub(b).ok_or_else(overflow)?,
        BinaryOp::Mul => a.checked_mul(b).ok_or_else(overflow)?,
        BinaryOp::Div => {
            if b == 0 {
                return Err(HostError::ZeroDivision);
            }
            return Ok(Value::Float(a as f64 / b as f64));
        }
        BinaryOp::FloorDiv => {
            if b == 0 {
                return Err(HostError::ZeroDivision);
            }
            a.div_euclid(b) - if b < 0 && a.rem_euclid(b) != 0 { 1 } else { 0 }
        }
        BinaryOp::Mod => {
            if b == 0 {
                return Err(HostError::ZeroDivision);
            }
            let r = a % b;
            if r != 0 && (r < 0) != (b < 0) {
                r + b
            } else {
                r
            }
        }
        BinaryOp::Pow => {
            if b < 0 {
                return Ok(Value::Float((a as f64).powf(b as f64)));
            }
            let exp = u32::try_from(b).map_err(|_| overflow())?;
            a.checked_pow(exp).ok_or_else(overflow)?
        }
        BinaryOp::Lshift => a.checked_shl(u32::try_from(b).map_err(|_| overflow())?).ok_or_else(overflow)?,
        BinaryOp::Rshift => a >> b.clamp(0, 63),
        BinaryOp::And => a & b,
        BinaryOp::Or => a | b,
        BinaryOp::Xor => a ^ b,
        BinaryOp::Subscr => unreachable!("subscript handled before integer arithmetic"),
    };
    Ok(Value::Int(v))
}

fn float_arith(op: BinaryOp, a: f64, b: f64) -> Option<Value> {
    Some(Value::Float(match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div if b != 0.0 => a / b,
        BinaryOp::FloorDiv if b != 0.0 => (a / b).floor(),
        BinaryOp::Mod if b != 0.0 => a - b * (a / b).floor(),
        BinaryOp::Pow => a.powf(b),
        _ => return None,
    }))
}

/// `%s`/`%d` substitution, enough for the formatting scripts do before a call.
fn percent_format(fmt: &str, args: &Value) -> String {
    let items = match args {
        Value::Tuple(items) => items.as_ref().clone(),
        other => vec![other.clone()],
    };
    let mut items = items.into_iter();
    let mut out = String::with_capacity(fmt.len());
    let mut chars = fmt.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some(_) => out.push_str(&items.next().map(|v| v.display_text()).unwrap_or_default()),
            None => out.push('%'),
        }
    }
    out
}

fn symbol(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::FloorDiv => "//",
        BinaryOp::Mod => "%",
        BinaryOp::Pow => "**",
        BinaryOp::Subscr => "[]",
        BinaryOp::Lshift => "<<",
        BinaryOp::Rshift => ">>",
        BinaryOp::And => "&",
        BinaryOp::Or => "|",
        BinaryOp::Xor => "^",
    }
}

pub(crate) fn subscript(container: &Value, key: &Value) -> Result<Value, HostError> {
    let index_error = || HostError::Index(format!("{} index out of range", container.type_name()));
    match (container, key) {
        (Value::List(items), Value::Int(i)) => {
            let items = items.borrow();
            resolve_index(*i, items.len()).map(|idx| items[idx].clone()).ok_or_else(index_error)
        }
        (Value::Tuple(items), Value::Int(i)) => {
            resolve_index(*i, items.len()).map(|idx| items[idx].clone()).ok_or_else(index_error)
        }
        (Value::Str(s), Value::Int(i)) => {
            let chars: Vec<char> = s.chars().collect();
            resolve_index(*i, chars.len()).map(|idx| Value::str(chars[idx].to_string())).ok_or_else(index_error)
        }
        (Value::Dict(pairs), key) => pairs
            .borrow()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| HostError::Key(key.to_string())),
        _ => Err(HostError::Type(format!("'{}' object is not subscriptable", container.type_name()))),
    }
}

pub(crate) fn store_subscript(container: &Value, key: Value, value: Value) -> Result<(), HostError> {
    match (container, &key) {
        (Value::List(items), Value::Int(i)) => {
            let mut items = items.borrow_mut();
            let idx = resolve_index(*i, items.len())
                .ok_or_else(|| HostError::Index("list assignment index out of range".into()))?;
            items[idx] = value;
            Ok(())
        }
        (Value::Dict(pairs), _) => {
            let mut pairs = pairs.borrow_mut();
            match pairs.iter_mut().find(|(k, _)| *k == key) {
                Some(slot) => slot.1 = value,
                None => pairs.push((key, value)),
            }
            Ok(())
        }
        (Value::Tagged(_), _) => Ok(()),
        _ => Err(HostError::Type(format!(
            "'{}' object does not support item assignment",
            container.type_name()
        ))),
    }
}

fn ordering(op: CompareOp, lhs: &Value, rhs: &Value) -> Result<bool, HostError> {
    let ord = match (lhs, rhs) {
        (Value::Str(a), Value::Str(b)) => a.cmp(b),
        _ => match (as_float(lhs), as_float(rhs)) {
            (Some(a), Some(b)) => a.partial_cmp(&b).ok_or_else(|| HostError::Value("nan comparison".into()))?,
            _ => {
                return Err(HostError::Type(format!(
                    "'{}' not supported between instances of '{}' and '{}'",
                    op.symbol(),
                    lhs.type_name(),
                    rhs.type_name()
                )))
            }
        },
    };
    Ok(match op {
        CompareOp::Lt => ord.is_lt(),
        CompareOp::Le => ord.is_le(),
        CompareOp::Gt => ord.is_gt(),
        CompareOp::Ge => ord.is_ge(),
        _ => unreachable!("ordering called for {}", op.symbol()),
    })
}

/// `needle in container`.
pub(crate) fn contains(container: &Value, needle: &Value) -> Result<bool, HostError> {
    match container {
        Value::Str(s) => match needle {
            Value::Str(n) => Ok(s.contains(n.as_ref())),
            other => Err(HostError::Type(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        Value::List(items) => Ok(items.borrow().iter().any(|v| v == needle)),
        Value::Tuple(items) => Ok(items.iter().any(|v| v == needle)),
        Value::Dict(pairs) => Ok(pairs.borrow().iter().any(|(k, _)| k == needle)),
        other => Err(HostError::Type(format!("argument of type '{}' is not iterable", other.type_name()))),
    }
}

/// `lhs op rhs`; for `In`/`NotIn` the container is `rhs`.
pub(crate) fn compare(op: CompareOp, lhs: &Value, rhs: &Value) -> Result<Value, HostError> {
    if lhs.is_tagged() || rhs.is_tagged() {
        return Err(HostError::Type(format!(
            "'{}' not supported between '{}' and '{}'",
            op.symbol(),
            lhs.type_name(),
            rhs.type_name()
        )));
    }
    let result = match op {
        CompareOp::Eq => lhs == rhs,
        CompareOp::Ne => lhs != rhs,
        CompareOp::In => contains(rhs, lhs)?,
        CompareOp::NotIn => !contains(rhs, lhs)?,
        _ => ordering(op, lhs, rhs)?,
    };
    Ok(Value::Bool(result))
}

/// Items produced by iterating `value`.
pub(crate) fn iterate(value: &Value) -> Result<Vec<Value>, HostError> {
    match value {
        Value::List(items) => Ok(items.borrow().clone()),
        Value::Tuple(items) => Ok(items.as_ref().clone()),
        Value::Str(s) => Ok(s.chars().map(|c| Value::str(c.to_string())).collect()),
        Value::Dict(pairs) => Ok(pairs.borrow().iter().map(|(k, _)| k.clone()).collect()),
        Value::Iterator(state) => {
            let state = state.borrow();
            Ok(state.items[state.pos.min(state.items.len())..].to_vec())
        }
        Value::Tagged(t) => Ok(t.iter_items()),
        other => Err(HostError::Type(format!("'{}' object is not iterable", other.type_name()))),
    }
}

/// Iterators iterate to themselves.
pub(crate) fn get_iter(value: &Value) -> Result<Value, HostError> {
    match value {
        Value::Iterator(state) => Ok(Value::Iterator(Rc::clone(state))),
        other => Ok(Value::Iterator(taintwatch_core::values::IterState::new(iterate(other)?))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taintwatch_core::tagged::{TagKind, TaggedValue};

    #[test]
    fn test_int_and_string_arithmetic() {
        assert_eq!(binary(BinaryOp::Add, &Value::Int(2), &Value::Int(3)).unwrap(), Value::Int(5));
        assert_eq!(binary(BinaryOp::FloorDiv, &Value::Int(-7), &Value::Int(2)).unwrap(), Value::Int(-4));
        assert_eq!(binary(BinaryOp::Mod, &Value::Int(-7), &Value::Int(2)).unwrap(), Value::Int(1));
        assert_eq!(binary(BinaryOp::Div, &Value::Int(1), &Value::Int(2)).unwrap(), Value::Float(0.5));
        assert_eq!(binary(BinaryOp::Add, &Value::str("ls "), &Value::str("-la")).unwrap(), Value::str("ls -la"));
        assert_eq!(binary(BinaryOp::Mod, &Value::str("id %s"), &Value::str("x")).unwrap(), Value::str("id x"));
        assert_eq!(binary(BinaryOp::Div, &Value::Int(1), &Value::Int(0)), Err(HostError::ZeroDivision));
    }

    #[test]
    fn test_tagged_operands_are_type_errors() {
        let taint = Value::tagged(TaggedValue::new(TagKind::Taint, None, None));
        assert!(matches!(binary(BinaryOp::Add, &Value::str("a"), &taint), Err(HostError::Type(_))));
        assert!(matches!(unary(UnaryOp::Not, &taint), Err(HostError::Type(_))));
        assert!(matches!(compare(CompareOp::Eq, &taint, &taint), Err(HostError::Type(_))));
    }

    #[test]
    fn test_subscript_and_contains() {
        let list = Value::list(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(subscript(&list, &Value::Int(-1)).unwrap(), Value::Int(2));
        assert!(matches!(subscript(&list, &Value::Int(2)), Err(HostError::Index(_))));
        let dict = Value::dict(vec![(Value::str("k"), Value::Int(9))]);
        assert_eq!(subscript(&dict, &Value::str("k")).unwrap(), Value::Int(9));
        assert_eq!(compare(CompareOp::In, &Value::str("sh"), &Value::str("/bin/sh")).unwrap(), Value::Bool(true));
        assert_eq!(compare(CompareOp::NotIn, &Value::Int(3), &list).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_store_subscript_updates_dict_in_place() {
        let dict = Value::dict(vec![]);
        store_subscript(&dict, Value::str("a"), Value::Int(1)).unwrap();
        store_subscript(&dict, Value::str("a"), Value::Int(2)).unwrap();
        assert_eq!(subscript(&dict, &Value::str("a")).unwrap(), Value::Int(2));
    }
}
