//! The call record: identity of the call instruction being dispatched.

use serde::Serialize;
use std::rc::Rc;
use taintwatch_core::bytecode::{Instruction, OpCode};
use taintwatch_core::frame::FrameId;
use taintwatch_core::tagged::{Descriptor, TagKind, ThreatKind};
use taintwatch_core::values::Value;

/// Module name recorded for classes that do not say where they come from.
pub const UNKNOWN_CLASS_MODULE: &str = "unknown_class_module";

#[derive(Debug, Clone, Default, Serialize)]
pub struct CallRecord {
    pub module: Option<String>,
    pub class: Option<String>,
    pub method: Option<String>,
    pub func: Option<String>,
    pub opcode: Option<OpCode>,
    pub oparg: u32,
    pub line: u32,
    #[serde(skip)]
    pub frame: Option<FrameId>,
    /// Kind of the tagged callable, if the callee is one.
    pub hook: Option<TagKind>,
    pub threat: Option<ThreatKind>,
    #[serde(skip)]
    pub descriptor: Option<Rc<Descriptor>>,
    #[serde(skip)]
    valid: bool,
}

impl CallRecord {
    pub fn invalid() -> Self {
        Self::default()
    }

    /// Resolve the identity of `callable` for the call instruction `instr`.
    pub fn capture(callable: &Value, instr: &Instruction, frame: FrameId) -> Self {
        let mut record = Self {
            opcode: Some(instr.op),
            oparg: instr.arg,
            line: instr.line,
            frame: Some(frame),
            ..Self::default()
        };
        record.identify(callable);
        record.valid = record.module.is_some();
        record
    }

    fn identify(&mut self, callable: &Value) {
        match callable {
            Value::Tagged(tagged) => {
                self.hook = Some(tagged.kind);
                if let Some(d) = &tagged.descriptor {
                    self.module = Some(d.module.clone());
                    self.class = d.class.clone();
                    self.method = d.method.clone();
                    self.func = d.func.clone();
                    self.threat = d.threat;
                    self.descriptor = Some(Rc::clone(d));
                }
            }
            Value::Function(f) => {
                self.module = Some(f.globals.name.clone());
                self.func = Some(f.name.clone());
            }
            Value::Native(n) => {
                self.module = Some(n.module.clone());
                match &n.class {
                    Some(class) => {
                        self.class = Some(class.clone());
                        self.method = Some(n.name.clone());
                    }
                    None => self.func = Some(n.name.clone()),
                }
            }
            Value::BoundMethod(bound) => {
                self.identify(&bound.func);
                if let Value::Instance(instance) = &bound.receiver {
                    self.class = Some(instance.class.name.clone());
                    if let Some(module) = &instance.class.module {
                        self.module = Some(module.clone());
                    }
                }
                if self.method.is_none() {
                    self.method = self.func.take();
                }
            }
            Value::Class(class) => {
                self.module = Some(class.module.clone().unwrap_or_else(|| UNKNOWN_CLASS_MODULE.to_string()));
                self.class = Some(class.name.clone());
            }
            _ => {}
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn invalidate(&mut self) {
        *self = Self::invalid();
    }

    /// Name matched against denylists: class, else method, else function.
    pub fn callable_name(&self) -> Option<&str> {
        self.class.as_deref().or(self.method.as_deref()).or(self.func.as_deref())
    }

    pub fn is_command_sink(&self) -> bool {
        self.threat == Some(ThreatKind::CommandExec)
    }

    /// `module.class.method` style name for logs.
    pub fn qualified_name(&self) -> String {
        [&self.module, &self.class, &self.method, &self.func]
            .into_iter()
            .flatten()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(".")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taintwatch_core::bytecode::CodeObject;
    use taintwatch_core::tagged::{ObjectKind, TaggedValue};
    use taintwatch_core::values::{BoundMethod, ClassValue, FunctionValue, InstanceValue, ModuleValue, NativeFunction};

    fn call() -> Instruction {
        Instruction::at_line(OpCode::CallFunction, 1, 7)
    }

    #[test]
    fn test_tagged_callable_uses_its_descriptor() {
        let d = Descriptor {
            module: "os".into(),
            class: None,
            method: None,
            func: Some("system".into()),
            var: None,
            object_kind: ObjectKind::Function,
            tag: TagKind::Threat,
            active_positions: vec![1],
            threat: Some(ThreatKind::CommandExec),
            needs_original_execution: false,
            action: None,
        };
        let callable = Value::tagged(TaggedValue::from_descriptor(Rc::new(d), None));
        let record = CallRecord::capture(&callable, &call(), FrameId(0));
        assert!(record.is_valid());
        assert!(record.is_command_sink());
        assert_eq!(record.hook, Some(TagKind::Threat));
        assert_eq!(record.qualified_name(), "os.system");
        assert_eq!(record.line, 7);
    }

    #[test]
    fn test_anonymous_tagged_value_is_invalid() {
        let callable = Value::tagged(TaggedValue::undefined());
        assert!(!CallRecord::capture(&callable, &call(), FrameId(0)).is_valid());
        assert!(!CallRecord::capture(&Value::Int(3), &call(), FrameId(0)).is_valid());
    }

    #[test]
    fn test_script_function_and_native_identity() {
        let globals = ModuleValue::new("__main__");
        let func = Value::Function(Rc::new(FunctionValue {
            name: "helper".into(),
            code: Rc::new(CodeObject::new("helper", "main.py")),
            globals,
            defaults: vec![],
        }));
        let record = CallRecord::capture(&func, &call(), FrameId(1));
        assert_eq!(record.qualified_name(), "__main__.helper");

        let native = Value::Native(Rc::new(NativeFunction { module: "time".into(), class: None, name: "sleep".into(), id: 0 }));
        assert_eq!(CallRecord::capture(&native, &call(), FrameId(1)).callable_name(), Some("sleep"));
    }

    #[test]
    fn test_bound_method_and_class_identity() {
        let class = ClassValue::new("Popen", Some("subprocess"));
        let receiver = Value::Instance(InstanceValue::new(Rc::clone(&class)));
        let func = Value::Native(Rc::new(NativeFunction {
            module: "subprocess".into(),
            class: Some("Popen".into()),
            name: "wait".into(),
            id: 0,
        }));
        let bound = Value::BoundMethod(Rc::new(BoundMethod { receiver, func }));
        let record = CallRecord::capture(&bound, &call(), FrameId(0));
        assert_eq!(record.qualified_name(), "subprocess.Popen.wait");

        let anonymous = Value::Class(ClassValue::new("Thing", None));
        let record = CallRecord::capture(&anonymous, &call(), FrameId(0));
        assert_eq!(record.module.as_deref(), Some(UNKNOWN_CLASS_MODULE));
        assert_eq!(record.callable_name(), Some("Thing"));
    }

    #[test]
    fn test_invalidate_clears_everything() {
        let native = Value::Native(Rc::new(NativeFunction { module: "os".into(), class: None, name: "getcwd".into(), id: 0 }));
        let mut record = CallRecord::capture(&native, &call(), FrameId(0));
        record.invalidate();
        assert!(!record.is_valid());
        assert!(record.module.is_none());
    }
}
