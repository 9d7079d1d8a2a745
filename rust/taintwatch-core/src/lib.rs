//! Taintwatch Core
//!
//! Shared types used by the engine and the host VM: bytecode, host values,
//! the tagged-value model, activation records, and the hook/host contract.

pub mod asm;
pub mod bytecode;
pub mod frame;
pub mod host;
pub mod strings;
pub mod tagged;
pub mod values;

pub use bytecode::{BinaryOp, CodeObject, CompareOp, Constant, Instruction, OpCode, UnaryOp};
pub use frame::{Block, BlockKind, Frame, FrameArena, FrameId};
pub use host::{Host, HostError, InstructionHook, NoHook};
pub use tagged::{Descriptor, ObjectKind, OverrideAction, TagKind, TaggedValue, ThreatKind};
pub use values::Value;
