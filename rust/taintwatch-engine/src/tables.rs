//! Source, sink, and override lookup tables, and their installation into a host.
//!
//! Each record replaces one host object with a tagged stand-in:
//! taint sources produce `Taint` values, threat sinks are `Threat` callables,
//! overrides are `Custom` callables that skip the original.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::rc::Rc;
use taintwatch_core::host::Host;
use taintwatch_core::tagged::{Descriptor, ObjectKind, OverrideAction, TagKind, TaggedValue, ThreatKind};
use taintwatch_core::values::{ModuleValue, Value};
use tracing::{debug, info};

struct Rec(Descriptor);

impl Rec {
    fn new(tag: TagKind, kind: ObjectKind, path: &str) -> Self {
        let mut parts = path.split(':');
        let module = parts.next().unwrap_or_default().to_string();
        let first = parts.next().map(str::to_string);
        let second = parts.next().map(str::to_string);
        let (class, member) = match kind {
            ObjectKind::Method => (first, second),
            ObjectKind::Class => (first.clone(), None),
            _ => (None, first),
        };
        let mut d = Descriptor {
            module,
            class,
            method: None,
            func: None,
            var: None,
            object_kind: kind,
            tag,
            active_positions: Vec::new(),
            threat: None,
            needs_original_execution: false,
            action: None,
        };
        match kind {
            ObjectKind::Method => d.method = member,
            ObjectKind::Function => d.func = member,
            ObjectKind::Variable => d.var = member,
            ObjectKind::Class => {}
        }
        Rec(d)
    }

    fn threat(mut self, threat: ThreatKind) -> Self {
        self.0.threat = Some(threat);
        self
    }

    fn positions(mut self, positions: &[i32]) -> Self {
        self.0.active_positions = positions.to_vec();
        self
    }

    fn execute(mut self) -> Self {
        self.0.needs_original_execution = true;
        self
    }

    fn skip(mut self) -> Self {
        self.0.action = Some(OverrideAction::Skip);
        self
    }
}

fn source(kind: ObjectKind, path: &str) -> Descriptor {
    Rec::new(TagKind::Taint, kind, path).positions(&[0]).0
}

fn command(kind: ObjectKind, path: &str, positions: &[i32]) -> Descriptor {
    Rec::new(TagKind::Threat, kind, path).threat(ThreatKind::CommandExec).positions(positions).0
}

fn skip(path: &str) -> Descriptor {
    Rec::new(TagKind::Custom, ObjectKind::Function, path).skip().0
}

/// Built-in records, in table order.
static BUILTIN: Lazy<Vec<Descriptor>> = Lazy::new(|| {
    use ObjectKind::{Class, Function, Method, Variable};
    let mut t = vec![
        // taint sources
        source(Class, "socket:socket"),
        source(Class, "paramiko:SSHClient"),
        source(Class, "ctypes:CDLL"),
        source(Class, "cgi:FieldStorage"),
        source(Class, "argparse:ArgumentParser"),
        source(Class, "urllib.request:Request"),
        source(Class, "tornado.netutil:TCPServer"),
        source(Method, "socket:socket:accept"),
        source(Function, "socket:create_server"),
        source(Function, "builtins:input"),
        source(Function, "builtins:raw_input"),
        source(Function, "requests:post"),
        source(Function, "requests:get"),
        source(Function, "wget:download"),
        source(Function, "ssl:wrap_socket"),
        source(Function, "urllib:urlopen"),
        source(Function, "urllib.request:urlopen"),
        source(Function, "urllib.request:build_opener"),
        source(Variable, "sys:argv"),
        source(Variable, "sys:argc"),
        source(Variable, "ctypes:windll"),
        source(Variable, "os:environ"),
        // threat sinks
        command(Class, "subprocess:Popen", &[1]),
        Rec::new(TagKind::Threat, Class, "multiprocessing:Process")
            .threat(ThreatKind::ThreadExec)
            .positions(&[1])
            .execute()
            .0,
        Rec::new(TagKind::Threat, Method, "code:InteractiveConsole:push").threat(ThreatKind::CodeExec).positions(&[1]).0,
        Rec::new(TagKind::Threat, Method, "code:InteractiveConsole:runcode")
            .threat(ThreatKind::CodeExec)
            .positions(&[1])
            .0,
    ];

    for func in ["call", "check_output", "getoutput", "getstatusoutput", "check_call", "run"] {
        t.push(command(Function, &format!("subprocess:{}", func), &[1]));
    }
    for func in ["system", "popen", "popen2", "popen3"] {
        t.push(command(Function, &format!("os:{}", func), &[1]));
    }
    for func in ["spawnvpe", "spawnvp", "spawnve", "spawnv"] {
        t.push(command(Function, &format!("os:{}", func), &[2, 3]));
    }
    for func in ["spawnlpe", "spawnlp", "spawnle", "spawnl"] {
        t.push(command(Function, &format!("os:{}", func), &[2]));
    }
    for func in ["execvpe", "execvp", "execve", "execv", "execlpe", "execlp", "execle", "execl"] {
        t.push(command(Function, &format!("os:{}", func), &[1, 2]));
    }
    t.push(command(Function, "pty:spawn", &[1]));
    for func in ["popen2", "popen3", "popen4"] {
        t.push(command(Function, &format!("popen2:{}", func), &[1]));
    }
    t.push(command(Function, "scapy.all:sniff", &[1]));
    t.push(Rec::new(TagKind::Threat, Function, "builtins:eval").threat(ThreatKind::CodeExec).positions(&[1]).execute().0);
    t.push(Rec::new(TagKind::Threat, Function, "builtins:exec").threat(ThreatKind::CodeExec).positions(&[-1]).execute().0);

    // overrides
    for path in [
        "os:dup",
        "os:dup2",
        "os:exit",
        "os:fork",
        "sys:exit",
        "time:sleep",
        "ctypes:c_char_p",
        "ctypes:c_void_p",
        "ctypes:CFUNCTYPE",
        "ctypes:memmove",
        "ctypes:cast",
        "cgitb:enable",
        "importlib:reload",
    ] {
        t.push(skip(path));
    }
    t
});

/// Keyed set of descriptors.
#[derive(Debug, Clone, Default)]
pub struct LookupTables {
    entries: Vec<Rc<Descriptor>>,
    by_key: HashMap<String, usize>,
}

impl LookupTables {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut tables = Self::empty();
        tables.extend(BUILTIN.iter().cloned());
        tables
    }

    /// Add records; a record whose key already exists replaces the earlier one.
    pub fn extend<I: IntoIterator<Item = Descriptor>>(&mut self, records: I) {
        for record in records {
            let key = record.key();
            let record = Rc::new(record);
            match self.by_key.get(&key) {
                Some(&idx) => self.entries[idx] = record,
                None => {
                    self.by_key.insert(key, self.entries.len());
                    self.entries.push(record);
                }
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&Rc<Descriptor>> {
        self.by_key.get(key).map(|&idx| &self.entries[idx])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rc<Descriptor>> {
        self.entries.iter()
    }

    /// Methods, then classes, then functions, then variables; table order within each.
    pub fn install_order(&self) -> Vec<Rc<Descriptor>> {
        let mut ordered = self.entries.clone();
        ordered.sort_by_key(|d| d.object_kind);
        ordered
    }

    /// Replace every target in `host` with its tagged stand-in. Returns the number installed.
    pub fn install(&self, host: &mut dyn Host) -> usize {
        let mut installed = 0;
        for descriptor in self.install_order() {
            let module = ensure_module(host, &descriptor.module);
            let Some(member) = descriptor.member() else {
                continue;
            };
            if descriptor.object_kind == ObjectKind::Method {
                let class_name = descriptor.class.as_deref().unwrap_or_default();
                match module.get(class_name) {
                    Some(Value::Class(class)) => {
                        let original = class.get(member);
                        class.set(member, Value::tagged(TaggedValue::from_descriptor(Rc::clone(&descriptor), original)));
                        installed += 1;
                    }
                    _ => debug!(key = %descriptor.key(), "method hook skipped: class not found"),
                }
                continue;
            }
            let original = module.get(member);
            module.set(member, Value::tagged(TaggedValue::from_descriptor(Rc::clone(&descriptor), original)));
            installed += 1;
        }
        info!(installed, "lookup tables installed");
        installed
    }
}

/// The module named `name`, fabricating it (and its parents) when the host lacks it.
pub fn ensure_module(host: &mut dyn Host, name: &str) -> Rc<ModuleValue> {
    if let Some(module) = host.module(name) {
        return module;
    }
    let module = ModuleValue::synthetic(name);
    host.register_module(Rc::clone(&module));
    if let Some((parent, leaf)) = name.rsplit_once('.') {
        let parent = ensure_module(host, parent);
        if !parent.contains(leaf) {
            parent.set(leaf, Value::Module(Rc::clone(&module)));
        }
    }
    debug!(module = name, "synthesized missing module");
    module
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_keys() {
        let tables = LookupTables::builtin();
        let input = tables.get("builtins-input").expect("input is a source");
        assert_eq!(input.tag, TagKind::Taint);
        let system = tables.get("os-system").expect("os.system is a sink");
        assert_eq!(system.threat, Some(ThreatKind::CommandExec));
        let accept = tables.get("socket-socket-accept").expect("accept is a source method");
        assert_eq!(accept.object_kind, ObjectKind::Method);
        let dup2 = tables.get("os-dup2").expect("dup2 is overridden");
        assert_eq!(dup2.action, Some(OverrideAction::Skip));
        let eval = tables.get("builtins-eval").unwrap();
        assert!(eval.needs_original_execution);
        assert_eq!(tables.get("os-spawnv").unwrap().active_positions, vec![2, 3]);
    }

    #[test]
    fn test_single_argument_sinks_watch_the_first_argument() {
        let tables = LookupTables::builtin();
        for key in [
            "multiprocessing-Process",
            "code-InteractiveConsole-push",
            "code-InteractiveConsole-runcode",
            "scapy.all-sniff",
        ] {
            let record = tables.get(key).unwrap_or_else(|| panic!("{} is a sink", key));
            assert_eq!(record.active_positions, vec![1], "{}", key);
        }
    }

    #[test]
    fn test_install_order_puts_methods_first_and_variables_last() {
        let order = LookupTables::builtin().install_order();
        assert_eq!(order.first().map(|d| d.object_kind), Some(ObjectKind::Method));
        assert_eq!(order.last().map(|d| d.object_kind), Some(ObjectKind::Variable));
    }

    #[test]
    fn test_extend_replaces_records_with_the_same_key() {
        let mut tables = LookupTables::builtin();
        let before = tables.len();
        let mut replacement = (**tables.get("os-system").unwrap()).clone();
        replacement.active_positions = vec![9];
        tables.extend([replacement]);
        assert_eq!(tables.len(), before);
        assert_eq!(tables.get("os-system").unwrap().active_positions, vec![9]);
    }
}
