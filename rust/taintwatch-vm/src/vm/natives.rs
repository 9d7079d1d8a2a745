//! Native modules and their dispatch.
//!
//! Nothing here touches the outside world: process, socket, and descriptor
//! operations are appended to the sandbox's effect log and answered with
//! plausible values.

use super::*;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};
use taintwatch_core::values::NativeFunction;

/// A side effect the script asked for.
#[derive(Debug, Clone, PartialEq)]
pub struct Effect {
    /// Dotted callable path, e.g. `os.system` or `socket.socket.connect`.
    pub call: String,
    pub args: Vec<String>,
}

/// The world as the script sees it.
#[derive(Debug, Clone, Default)]
pub struct Sandbox {
    pub stdin: VecDeque<String>,
    pub argv: Vec<String>,
    pub environ: Vec<(String, String)>,
    pub output: Vec<String>,
    pub effects: Vec<Effect>,
}

impl Sandbox {
    pub fn with_stdin<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stdin.extend(lines.into_iter().map(Into::into));
        self
    }

    pub fn with_argv<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv = argv.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environ.push((key.into(), value.into()));
        self
    }

    fn record(&mut self, call: &str, args: &[Value]) {
        debug!(call, argc = args.len(), "side effect recorded");
        self.effects.push(Effect { call: call.to_string(), args: args.iter().map(Value::display_text).collect() });
    }
}

const EXCEPTION_CLASSES: &[&str] = &[
    "BaseException",
    "Exception",
    "SystemExit",
    "KeyboardInterrupt",
    "ArithmeticError",
    "AttributeError",
    "ConnectionError",
    "ConnectionRefusedError",
    "ConnectionResetError",
    "EOFError",
    "FileNotFoundError",
    "ImportError",
    "IndexError",
    "KeyError",
    "LookupError",
    "ModuleNotFoundError",
    "NameError",
    "OSError",
    "OverflowError",
    "PermissionError",
    "RuntimeError",
    "StopIteration",
    "SyntaxError",
    "TimeoutError",
    "TypeError",
    "UnboundLocalError",
    "ValueError",
    "ZeroDivisionError",
];

const STR_METHODS: &[&str] =
    &["join", "split", "strip", "upper", "lower", "startswith", "endswith", "replace", "encode", "decode", "format"];
const LIST_METHODS: &[&str] = &["append", "extend", "pop"];
const DICT_METHODS: &[&str] = &["get", "keys", "values", "items"];

struct Registrar {
    next_id: u32,
}

impl Registrar {
    fn native(&mut self, module: &str, class: Option<&str>, name: &str) -> Value {
        self.next_id += 1;
        Value::Native(Rc::new(NativeFunction {
            module: module.to_string(),
            class: class.map(str::to_string),
            name: name.to_string(),
            id: self.next_id,
        }))
    }

    fn functions(&mut self, module: &ModuleValue, names: &[&str]) {
        for name in names {
            module.set(*name, self.native(&module.name, None, name));
        }
    }

    fn class(&mut self, module: &ModuleValue, name: &str, methods: &[&str]) -> Rc<ClassValue> {
        let class = ClassValue::new(name, Some(&module.name));
        for method in methods {
            class.set(*method, self.native(&module.name, Some(name), method));
        }
        module.set(name, Value::Class(Rc::clone(&class)));
        class
    }
}

/// Build every native module into `modules` and return `builtins`.
pub(crate) fn install(modules: &mut BTreeMap<String, Rc<ModuleValue>>, sandbox: &Sandbox) -> Rc<ModuleValue> {
    let mut reg = Registrar { next_id: 0 };

    let builtins = ModuleValue::new("builtins");
    reg.functions(
        &builtins,
        &["print", "input", "len", "str", "int", "float", "repr", "range", "list", "tuple", "getattr", "eval", "exec"],
    );
    for name in EXCEPTION_CLASSES {
        builtins.set(*name, Value::Class(ClassValue::exception(*name)));
    }

    let os = ModuleValue::new("os");
    reg.functions(&os, &["system", "popen", "dup", "dup2", "fork", "getcwd", "getpid", "_exit"]);
    reg.class(&os, "_wrap_close", &["read", "close"]);
    os.set("name", Value::str("posix"));
    os.set("sep", Value::str("/"));
    let environ = sandbox.environ.iter().map(|(k, v)| (Value::str(k), Value::str(v))).collect();
    os.set("environ", Value::dict(environ));

    let subprocess = ModuleValue::new("subprocess");
    reg.functions(&subprocess, &["call", "run", "check_call", "check_output", "getoutput"]);
    reg.class(&subprocess, "Popen", &["__init__", "communicate", "wait", "poll"]);
    subprocess.set("PIPE", Value::Int(-1));
    subprocess.set("STDOUT", Value::Int(-2));
    subprocess.set("DEVNULL", Value::Int(-3));

    let sys = ModuleValue::new("sys");
    reg.functions(&sys, &["exit"]);
    sys.set("argv", Value::list(sandbox.argv.iter().map(Value::str).collect()));
    sys.set("platform", Value::str("linux"));

    let socket = ModuleValue::new("socket");
    reg.functions(&socket, &["create_server"]);
    reg.class(
        &socket,
        "socket",
        &["__init__", "connect", "bind", "listen", "accept", "send", "sendall", "recv", "fileno", "settimeout", "close"],
    );
    socket.set("AF_INET", Value::Int(2));
    socket.set("SOCK_STREAM", Value::Int(1));
    socket.set("SOL_SOCKET", Value::Int(1));
    socket.set("SO_REUSEADDR", Value::Int(2));
    if let Some(os_error) = builtins.get("OSError") {
        socket.set("error", os_error);
    }

    let time = ModuleValue::new("time");
    reg.functions(&time, &["sleep", "time"]);

    let code = ModuleValue::new("code");
    reg.class(&code, "InteractiveConsole", &["__init__", "push", "runcode", "interact"]);

    let pty = ModuleValue::new("pty");
    reg.functions(&pty, &["spawn"]);

    for module in [&builtins, &os, &subprocess, &sys, &socket, &time, &code, &pty] {
        modules.insert(module.name.clone(), Rc::clone(module));
    }
    debug!(modules = modules.len(), natives = reg.next_id, "native modules installed");
    builtins
}

/// Built-in method `name` of a string, list, or dict receiver.
pub(crate) fn builtin_method(receiver: &Value, name: &str) -> Option<Value> {
    let (class, known) = match receiver {
        Value::Str(_) => ("str", STR_METHODS),
        Value::List(_) => ("list", LIST_METHODS),
        Value::Dict(_) => ("dict", DICT_METHODS),
        _ => return None,
    };
    known.contains(&name).then(|| {
        Value::Native(Rc::new(NativeFunction {
            module: "builtins".into(),
            class: Some(class.into()),
            name: name.to_string(),
            id: 0,
        }))
    })
}

fn arg<'a>(args: &'a [Value], index: usize, path: &str) -> Result<&'a Value, HostError> {
    args.get(index)
        .ok_or_else(|| HostError::Type(format!("{}() missing required argument {}", path, index + 1)))
}

fn str_arg<'a>(args: &'a [Value], index: usize, path: &str) -> Result<&'a str, HostError> {
    let value = arg(args, index, path)?;
    value
        .as_str()
        .ok_or_else(|| HostError::Type(format!("{}() argument {} must be str, not {}", path, index + 1, value.type_name())))
}

fn after_receiver(args: &[Value]) -> &[Value] {
    args.get(1..).unwrap_or(&[])
}

fn keyword<'a>(args: &'a [Value], kwnames: &[String], name: &str) -> Option<&'a Value> {
    let offset = args.len() - kwnames.len();
    kwnames.iter().position(|k| k == name).map(|i| &args[offset + i])
}

/// Literal forms `eval` accepts from source text.
fn parse_literal(source: &str) -> Option<Value> {
    let text = source.trim();
    match text {
        "None" => return Some(Value::None),
        "True" => return Some(Value::Bool(true)),
        "False" => return Some(Value::Bool(false)),
        _ => {}
    }
    if let Ok(n) = text.parse::<i64>() {
        return Some(Value::Int(n));
    }
    if let Ok(f) = text.parse::<f64>() {
        return Some(Value::Float(f));
    }
    ['"', '\'']
        .iter()
        .find_map(|q| text.strip_prefix(*q).and_then(|rest| rest.strip_suffix(*q)))
        .map(Value::str)
}

fn repr(value: &Value) -> String {
    match value {
        Value::Str(s) => format!("'{}'", s),
        other => other.to_string(),
    }
}

fn to_int(value: &Value) -> Result<Value, HostError> {
    match value {
        Value::Int(_) => Ok(value.clone()),
        Value::Bool(b) => Ok(Value::Int(*b as i64)),
        Value::Float(f) => Ok(Value::Int(f.trunc() as i64)),
        Value::Str(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| HostError::Value(format!("invalid literal for int() with base 10: '{}'", s))),
        other => Err(HostError::Type(format!(
            "int() argument must be a string or a number, not '{}'",
            other.type_name()
        ))),
    }
}

fn to_float(value: &Value) -> Result<Value, HostError> {
    match value {
        Value::Float(_) => Ok(value.clone()),
        Value::Int(n) => Ok(Value::Float(*n as f64)),
        Value::Bool(b) => Ok(Value::Float(*b as i64 as f64)),
        Value::Str(s) => s
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| HostError::Value(format!("could not convert string to float: '{}'", s))),
        other => Err(HostError::Type(format!("float() argument must be a string or a number, not '{}'", other.type_name()))),
    }
}

fn range(args: &[Value]) -> Result<Value, HostError> {
    let ints = args
        .iter()
        .map(|a| a.as_int().ok_or_else(|| HostError::Type(format!("'{}' object cannot be interpreted as an integer", a.type_name()))))
        .collect::<Result<Vec<_>, _>>()?;
    let (start, stop, step) = match ints.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => return Err(HostError::Type(format!("range expected 1 to 3 arguments, got {}", ints.len()))),
    };
    if step == 0 {
        return Err(HostError::Value("range() arg 3 must not be zero".into()));
    }
    let mut items = Vec::new();
    let mut n = start;
    while (step > 0 && n < stop) || (step < 0 && n > stop) {
        items.push(Value::Int(n));
        n += step;
    }
    Ok(Value::list(items))
}

fn str_method(name: &str, receiver: &str, args: &[Value]) -> Result<Value, HostError> {
    let path = format!("str.{}", name);
    Ok(match name {
        "join" => {
            let parts = ops::iterate(arg(args, 0, &path)?)?;
            let texts = parts
                .iter()
                .map(|p| p.as_str().map(str::to_string).ok_or_else(|| HostError::Type("sequence item: expected str instance".into())))
                .collect::<Result<Vec<_>, _>>()?;
            Value::str(texts.join(receiver))
        }
        "split" => {
            let parts: Vec<Value> = match args.first().and_then(Value::as_str) {
                Some(sep) => receiver.split(sep).map(Value::str).collect(),
                None => receiver.split_whitespace().map(Value::str).collect(),
            };
            Value::list(parts)
        }
        "strip" => Value::str(receiver.trim()),
        "upper" => Value::str(receiver.to_uppercase()),
        "lower" => Value::str(receiver.to_lowercase()),
        "startswith" => Value::Bool(receiver.starts_with(str_arg(args, 0, &path)?)),
        "endswith" => Value::Bool(receiver.ends_with(str_arg(args, 0, &path)?)),
        "replace" => Value::str(receiver.replace(str_arg(args, 0, &path)?, str_arg(args, 1, &path)?)),
        "encode" | "decode" => Value::str(receiver),
        "format" => {
            let mut out = receiver.to_string();
            for value in args {
                out = out.replacen("{}", &value.display_text(), 1);
            }
            Value::str(out)
        }
        _ => return Err(HostError::Attribute(format!("'str' object has no attribute '{}'", name))),
    })
}

fn list_method(name: &str, list: &RefCell<Vec<Value>>, args: &[Value]) -> Result<Value, HostError> {
    let path = format!("list.{}", name);
    match name {
        "append" => {
            list.borrow_mut().push(arg(args, 0, &path)?.clone());
            Ok(Value::None)
        }
        "extend" => {
            let items = ops::iterate(arg(args, 0, &path)?)?;
            list.borrow_mut().extend(items);
            Ok(Value::None)
        }
        "pop" => list.borrow_mut().pop().ok_or_else(|| HostError::Index("pop from empty list".into())),
        _ => Err(HostError::Attribute(format!("'list' object has no attribute '{}'", name))),
    }
}

fn dict_method(name: &str, pairs: &RefCell<Vec<(Value, Value)>>, args: &[Value]) -> Result<Value, HostError> {
    let pairs = pairs.borrow();
    Ok(match name {
        "get" => {
            let key = arg(args, 0, "dict.get")?;
            pairs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
                .unwrap_or_else(|| args.get(1).cloned().unwrap_or(Value::None))
        }
        "keys" => Value::list(pairs.iter().map(|(k, _)| k.clone()).collect()),
        "values" => Value::list(pairs.iter().map(|(_, v)| v.clone()).collect()),
        "items" => Value::list(pairs.iter().map(|(k, v)| Value::tuple(vec![k.clone(), v.clone()])).collect()),
        _ => return Err(HostError::Attribute(format!("'dict' object has no attribute '{}'", name))),
    })
}

fn instance_field(receiver: &Value, field: &str) -> Value {
    match receiver {
        Value::Instance(inst) => inst.fields.borrow().get(field).cloned().unwrap_or(Value::None),
        _ => Value::None,
    }
}

fn set_field(receiver: &Value, field: &str, value: Value) {
    if let Value::Instance(inst) = receiver {
        inst.fields.borrow_mut().insert(field.to_string(), value);
    }
}

impl Vm {
    fn globals_for_eval(&self) -> Rc<ModuleValue> {
        self.current
            .and_then(|id| self.frames.get(id))
            .map(|frame| Rc::clone(&frame.globals))
            .or_else(|| self.modules.get("__main__").cloned())
            .unwrap_or_else(|| ModuleValue::new("__main__"))
    }

    fn instance_of(&self, module: &str, class: &str) -> Result<Value, HostError> {
        match self.modules.get(module).and_then(|m| m.get(class)) {
            Some(Value::Class(class)) => Ok(Value::Instance(InstanceValue::new(class))),
            _ => Err(HostError::Fatal(format!("native class {}.{} is missing", module, class))),
        }
    }

    fn new_socket(&mut self) -> Result<Value, HostError> {
        let sock = self.instance_of("socket", "socket")?;
        let fd = self.allocate_fd();
        set_field(&sock, "fd", Value::Int(fd));
        Ok(sock)
    }

    /// Execute a native function.
    pub(crate) fn call_native(
        &mut self,
        hook: &mut dyn InstructionHook,
        native: &NativeFunction,
        args: &[Value],
        kwnames: &[String],
    ) -> Result<Value, HostError> {
        let positional = &args[..args.len() - kwnames.len()];
        let path = match &native.class {
            Some(class) => format!("{}.{}.{}", native.module, class, native.name),
            None => format!("{}.{}", native.module, native.name),
        };
        trace!(call = %path, argc = args.len(), "native call");

        if native.module == "builtins" {
            return match native.class.as_deref() {
                None => self.call_builtin(hook, &path, &native.name, positional, args, kwnames),
                Some(class) => {
                    let receiver = arg(positional, 0, &path)?;
                    let rest = &positional[1..];
                    match (class, receiver) {
                        ("str", Value::Str(s)) => str_method(&native.name, s, rest),
                        ("list", Value::List(items)) => list_method(&native.name, items, rest),
                        ("dict", Value::Dict(pairs)) => dict_method(&native.name, pairs, rest),
                        _ => Err(HostError::Type(format!(
                            "descriptor '{}' requires a '{}' object but received a '{}'",
                            native.name,
                            class,
                            receiver.type_name()
                        ))),
                    }
                }
            };
        }

        match path.as_str() {
            "os.system" | "os.dup" | "os.dup2" | "pty.spawn" => {
                self.sandbox.record(&path, positional);
                Ok(Value::Int(0))
            }
            "os.fork" => {
                self.sandbox.record(&path, positional);
                // the child branch never runs; report being the parent
                Ok(Value::Int(4243))
            }
            "os.popen" => {
                self.sandbox.record(&path, positional);
                self.instance_of("os", "_wrap_close")
            }
            "os._wrap_close.read" => Ok(Value::str("")),
            "os._wrap_close.close" => Ok(Value::None),
            "os.getcwd" => Ok(Value::str("/")),
            "os.getpid" => Ok(Value::Int(4242)),
            "os._exit" | "sys.exit" => {
                let status = positional.first().map(Value::display_text).unwrap_or_else(|| "0".into());
                Err(HostError::Raised { kind: "SystemExit".into(), message: status })
            }
            "subprocess.call" | "subprocess.check_call" => {
                self.sandbox.record(&path, positional);
                Ok(Value::Int(0))
            }
            "subprocess.run" => {
                self.sandbox.record(&path, positional);
                let completed = self.instance_of("subprocess", "Popen")?;
                set_field(&completed, "returncode", Value::Int(0));
                set_field(&completed, "stdout", Value::str(""));
                Ok(completed)
            }
            "subprocess.check_output" | "subprocess.getoutput" => {
                self.sandbox.record(&path, positional);
                Ok(Value::str(""))
            }
            "subprocess.Popen.__init__" => {
                self.sandbox.record("subprocess.Popen", after_receiver(positional));
                let receiver = arg(positional, 0, &path)?;
                set_field(receiver, "returncode", Value::Int(0));
                set_field(receiver, "pid", Value::Int(4244));
                Ok(Value::None)
            }
            "subprocess.Popen.communicate" => Ok(Value::tuple(vec![Value::str(""), Value::str("")])),
            "subprocess.Popen.wait" | "subprocess.Popen.poll" => Ok(Value::Int(0)),
            "socket.create_server" => {
                self.sandbox.record(&path, positional);
                self.new_socket()
            }
            "socket.socket.__init__" => {
                let receiver = arg(positional, 0, &path)?;
                let fd = self.allocate_fd();
                set_field(receiver, "fd", Value::Int(fd));
                Ok(Value::None)
            }
            "socket.socket.connect" | "socket.socket.bind" | "socket.socket.send" | "socket.socket.sendall" => {
                self.sandbox.record(&path, after_receiver(positional));
                Ok(match native.name.as_str() {
                    "send" => Value::Int(positional.get(1).map(|v| v.display_text().len() as i64).unwrap_or(0)),
                    _ => Value::None,
                })
            }
            "socket.socket.accept" => {
                let conn = self.new_socket()?;
                let peer = Value::tuple(vec![Value::str("127.0.0.1"), Value::Int(4444)]);
                Ok(Value::tuple(vec![conn, peer]))
            }
            "socket.socket.recv" => Ok(Value::str("")),
            "socket.socket.fileno" => Ok(instance_field(arg(positional, 0, &path)?, "fd")),
            "socket.socket.listen" | "socket.socket.settimeout" | "socket.socket.close" => Ok(Value::None),
            "time.sleep" => Ok(Value::None),
            "time.time" => Ok(Value::Float(
                SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or(0.0),
            )),
            "code.InteractiveConsole.__init__" => Ok(Value::None),
            "code.InteractiveConsole.push" | "code.InteractiveConsole.runcode" | "code.InteractiveConsole.interact" => {
                self.sandbox.record(&path, after_receiver(positional));
                Ok(Value::Bool(false))
            }
            _ => Err(HostError::Fatal(format!("native {} has no implementation", path))),
        }
    }

    fn call_builtin(
        &mut self,
        hook: &mut dyn InstructionHook,
        path: &str,
        name: &str,
        positional: &[Value],
        args: &[Value],
        kwnames: &[String],
    ) -> Result<Value, HostError> {
        match name {
            "print" => {
                let sep = keyword(args, kwnames, "sep").map(Value::display_text).unwrap_or_else(|| " ".into());
                let line = positional.iter().map(Value::display_text).collect::<Vec<_>>().join(&sep);
                self.sandbox.output.push(line);
                Ok(Value::None)
            }
            "input" => self.sandbox.stdin.pop_front().map(Value::str).ok_or_else(|| HostError::Raised {
                kind: "EOFError".into(),
                message: "EOF when reading a line".into(),
            }),
            "len" => {
                let value = arg(positional, 0, path)?;
                let len = match value {
                    Value::Str(s) => s.chars().count(),
                    Value::List(items) => items.borrow().len(),
                    Value::Tuple(items) => items.len(),
                    Value::Dict(pairs) => pairs.borrow().len(),
                    other => {
                        return Err(HostError::Type(format!("object of type '{}' has no len()", other.type_name())))
                    }
                };
                Ok(Value::Int(len as i64))
            }
            "str" => Ok(match positional.first() {
                None => Value::str(""),
                Some(v @ (Value::Str(_) | Value::Tagged(_))) => v.clone(),
                Some(other) => Value::str(other.display_text()),
            }),
            "int" => positional.first().map(to_int).unwrap_or(Ok(Value::Int(0))),
            "float" => positional.first().map(to_float).unwrap_or(Ok(Value::Float(0.0))),
            "repr" => Ok(Value::str(repr(arg(positional, 0, path)?))),
            "range" => range(positional),
            "list" => Ok(Value::list(match positional.first() {
                Some(v) => ops::iterate(v)?,
                None => Vec::new(),
            })),
            "tuple" => Ok(Value::tuple(match positional.first() {
                Some(v) => ops::iterate(v)?,
                None => Vec::new(),
            })),
            "getattr" => {
                let object = arg(positional, 0, path)?;
                let attr = str_arg(positional, 1, path)?;
                match (self.load_attr(object, attr), positional.get(2)) {
                    (Err(err), Some(default)) if !err.is_fatal() => Ok(default.clone()),
                    (result, _) => result,
                }
            }
            "eval" | "exec" => {
                let source = arg(positional, 0, path)?;
                match source {
                    Value::Code(code) => {
                        let globals = self.globals_for_eval();
                        let value = self.enter(hook, Rc::clone(code), globals, Vec::new())?;
                        Ok(if name == "eval" { value } else { Value::None })
                    }
                    Value::Str(text) if name == "eval" => parse_literal(text).ok_or_else(|| HostError::Raised {
                        kind: "SyntaxError".into(),
                        message: "eval() accepts only literals or code objects".into(),
                    }),
                    Value::Str(text) if text.trim().is_empty() => Ok(Value::None),
                    Value::Str(_) => Err(HostError::Raised {
                        kind: "SyntaxError".into(),
                        message: "exec() accepts only code objects".into(),
                    }),
                    other => Err(HostError::Type(format!(
                        "{}() arg 1 must be a string or code object, not {}",
                        name,
                        other.type_name()
                    ))),
                }
            }
            _ => Err(HostError::Fatal(format!("builtin {} has no implementation", name))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taintwatch_core::asm::assemble;

    fn run_with(sandbox: Sandbox, src: &str) -> (Vm, Result<Value, VmError>) {
        let code = assemble(src, "t.py").unwrap();
        let mut vm = Vm::with_sandbox(sandbox);
        let result = vm.run(code);
        (vm, result)
    }

    #[test]
    fn test_literal_eval() {
        assert_eq!(parse_literal(" 42 "), Some(Value::Int(42)));
        assert_eq!(parse_literal("'id'"), Some(Value::str("id")));
        assert_eq!(parse_literal("None"), Some(Value::None));
        assert_eq!(parse_literal("__import__('os')"), None);
    }

    #[test]
    fn test_system_is_recorded_not_run() {
        let (vm, result) = run_with(
            Sandbox::default(),
            ".code m\n LOAD_CONST 0\n LOAD_CONST None\n IMPORT_NAME os\n STORE_NAME os\n LOAD_NAME os\n LOAD_METHOD system\n LOAD_CONST \"ls\"\n CALL_METHOD 1\n RETURN_VALUE\n",
        );
        assert_eq!(result.unwrap(), Value::Int(0));
        assert_eq!(vm.effects(), &[Effect { call: "os.system".into(), args: vec!["ls".into()] }]);
    }

    #[test]
    fn test_input_reads_sandbox_stdin_then_eof() {
        let src = ".code m\n LOAD_NAME input\n CALL_FUNCTION 0\n POP_TOP\n LOAD_NAME input\n CALL_FUNCTION 0\n RETURN_VALUE\n";
        let (_, result) = run_with(Sandbox::default().with_stdin(["first"]), src);
        assert!(matches!(result, Err(VmError::Host(HostError::Raised { ref kind, .. })) if kind == "EOFError"));
    }

    #[test]
    fn test_str_methods() {
        assert_eq!(
            str_method("join", ",", &[Value::list(vec![Value::str("a"), Value::str("b")])]).unwrap(),
            Value::str("a,b")
        );
        assert_eq!(
            str_method("split", "ls -la /", &[]).unwrap(),
            Value::list(vec![Value::str("ls"), Value::str("-la"), Value::str("/")])
        );
        assert_eq!(str_method("format", "{}:{}", &[Value::str("h"), Value::Int(1)]).unwrap(), Value::str("h:1"));
    }

    #[test]
    fn test_sys_exit_ends_the_run_cleanly() {
        let (vm, result) = run_with(
            Sandbox::default(),
            ".code m\n LOAD_CONST 0\n LOAD_CONST None\n IMPORT_NAME sys\n LOAD_METHOD exit\n LOAD_CONST 3\n CALL_METHOD 1\n POP_TOP\n LOAD_NAME print\n LOAD_CONST \"after\"\n CALL_FUNCTION 1\n RETURN_VALUE\n",
        );
        assert_eq!(result.unwrap(), Value::None);
        assert!(vm.output().is_empty());
    }

    #[test]
    fn test_range_and_len() {
        assert_eq!(range(&[Value::Int(3)]).unwrap(), Value::list(vec![Value::Int(0), Value::Int(1), Value::Int(2)]));
        assert_eq!(range(&[Value::Int(5), Value::Int(1), Value::Int(-2)]).unwrap(), Value::list(vec![Value::Int(5), Value::Int(3)]));
        assert!(range(&[Value::Int(1), Value::Int(2), Value::Int(0)]).is_err());
    }
}
