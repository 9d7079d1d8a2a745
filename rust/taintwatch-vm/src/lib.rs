//! Taintwatch VM: reference stack VM that hosts the instruction hook.
//!
//! Natives are sandboxed: process, socket, and file effects are recorded,
//! never performed.

pub mod vm;

pub use vm::{DebugCallback, DebugEvent, Effect, Sandbox, Vm, VmError};
