//! The contract between a host VM and an instruction hook.
//!
//! The host owns the frame arena and the dispatch loop. Before each
//! instruction it calls [`InstructionHook::pre_instruction`], which returns a
//! skip count: 0 runs the instruction normally, n > 0 advances past n
//! instructions without running them.

use crate::bytecode::{BinaryOp, CompareOp, Instruction, UnaryOp};
use crate::frame::{Frame, FrameArena, FrameId};
use crate::values::{ModuleValue, Value};
use std::rc::Rc;
use thiserror::Error;

/// Errors raised by host operations. All but the fatal ones are script-level
/// exceptions that a `try` block may catch.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HostError {
    #[error("ModuleNotFoundError: No module named '{0}'")]
    ModuleNotFound(String),
    #[error("ImportError: {0}")]
    Import(String),
    #[error("AttributeError: {0}")]
    Attribute(String),
    #[error("NameError: name '{0}' is not defined")]
    Name(String),
    #[error("TypeError: {0}")]
    Type(String),
    #[error("ValueError: {0}")]
    Value(String),
    #[error("IndexError: {0}")]
    Index(String),
    #[error("KeyError: {0}")]
    Key(String),
    #[error("ZeroDivisionError: division by zero")]
    ZeroDivision,
    #[error("{kind}: {message}")]
    Raised { kind: String, message: String },
    #[error("execution terminated by instruction hook")]
    Terminated,
    #[error("fatal: {0}")]
    Fatal(String),
}

impl HostError {
    /// Exception class name as a script would see it.
    pub fn type_name(&self) -> &str {
        match self {
            HostError::ModuleNotFound(_) => "ModuleNotFoundError",
            HostError::Import(_) => "ImportError",
            HostError::Attribute(_) => "AttributeError",
            HostError::Name(_) => "NameError",
            HostError::Type(_) => "TypeError",
            HostError::Value(_) => "ValueError",
            HostError::Index(_) => "IndexError",
            HostError::Key(_) => "KeyError",
            HostError::ZeroDivision => "ZeroDivisionError",
            HostError::Raised { kind, .. } => kind,
            HostError::Terminated | HostError::Fatal(_) => "SystemError",
        }
    }

    pub fn message(&self) -> String {
        match self {
            HostError::ModuleNotFound(name) => format!("No module named '{}'", name),
            HostError::Import(m)
            | HostError::Attribute(m)
            | HostError::Type(m)
            | HostError::Value(m)
            | HostError::Index(m)
            | HostError::Key(m)
            | HostError::Fatal(m) => m.clone(),
            HostError::Name(name) => format!("name '{}' is not defined", name),
            HostError::ZeroDivision => "division by zero".into(),
            HostError::Raised { message, .. } => message.clone(),
            HostError::Terminated => "terminated".into(),
        }
    }

    /// Fatal errors end the run and are never caught or suppressed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, HostError::Terminated | HostError::Fatal(_))
    }

    pub fn is_module_not_found(&self) -> bool {
        matches!(self, HostError::ModuleNotFound(_))
            || matches!(self, HostError::Raised { kind, .. } if kind == "ModuleNotFoundError")
    }
}

/// Services a host VM offers to an instruction hook.
pub trait Host {
    fn frames(&self) -> &FrameArena;
    fn frames_mut(&mut self) -> &mut FrameArena;

    /// Frame whose instruction is about to run.
    fn current_frame(&self) -> Option<FrameId>;

    /// Call `callable`. Keyword values are the trailing `kwnames.len()` entries of `args`.
    fn invoke(
        &mut self,
        hook: &mut dyn InstructionHook,
        callable: &Value,
        args: &[Value],
        kwnames: &[String],
    ) -> Result<Value, HostError>;

    fn unary_op(&mut self, op: UnaryOp, operand: &Value) -> Result<Value, HostError>;
    fn binary_op(&mut self, op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, HostError>;
    fn compare_op(&mut self, op: CompareOp, lhs: &Value, rhs: &Value) -> Result<Value, HostError>;

    fn import_module(&mut self, name: &str, fromlist: &Value, level: i64) -> Result<Value, HostError>;
    fn get_attr(&mut self, object: &Value, name: &str) -> Result<Value, HostError>;

    fn module(&self, name: &str) -> Option<Rc<ModuleValue>>;
    fn register_module(&mut self, module: Rc<ModuleValue>);

    fn current(&self) -> Option<&Frame> {
        let id = self.current_frame()?;
        self.frames().get(id)
    }

    fn current_mut(&mut self) -> Option<&mut Frame> {
        let id = self.current_frame()?;
        self.frames_mut().get_mut(id)
    }

    /// True while the current frame is inside an except clause.
    fn exception_pending(&self) -> bool {
        self.current().is_some_and(Frame::handling_exception)
    }
}

/// Per-instruction interception point.
pub trait InstructionHook {
    fn pre_instruction(&mut self, host: &mut dyn Host, instr: &Instruction) -> usize;

    /// Reserved; current hooks always return 0.
    fn post_instruction(&mut self, _host: &mut dyn Host, _instr: &Instruction) -> usize {
        0
    }

    /// Once true, the host stops running the script.
    fn terminated(&self) -> bool {
        false
    }
}

/// A hook that never intercepts anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHook;

impl InstructionHook for NoHook {
    fn pre_instruction(&mut self, _host: &mut dyn Host, _instr: &Instruction) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_type_names() {
        assert_eq!(HostError::ModuleNotFound("x".into()).type_name(), "ModuleNotFoundError");
        assert_eq!(
            HostError::Raised { kind: "OSError".into(), message: "m".into() }.type_name(),
            "OSError"
        );
        assert!(HostError::Terminated.is_fatal());
        assert!(!HostError::ZeroDivision.is_fatal());
    }

    #[test]
    fn test_module_not_found_detection_covers_raised_form() {
        let raised = HostError::Raised { kind: "ModuleNotFoundError".into(), message: "x".into() };
        assert!(raised.is_module_not_found());
        assert!(!HostError::Import("x".into()).is_module_not_found());
    }
}
