//! Activation records.
//!
//! Frames live in an arena keyed by a monotonically increasing [`FrameId`].
//! Each frame stores its caller's id, so walking the call chain is an index
//! lookup. Ids are never reused, which keeps stale references (for example a
//! taint region whose owner already returned) from aliasing a newer frame.

use crate::bytecode::CodeObject;
use crate::values::{ModuleValue, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FrameId(pub u32);

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// `SETUP_FINALLY`: jump to `handler` when an exception escapes.
    Finally,
    /// Active while an except clause runs; popped by `POP_EXCEPT`.
    ExceptHandler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub kind: BlockKind,
    pub handler: usize,
    /// Operand stack depth when the block was entered.
    pub level: usize,
}

/// One in-progress invocation.
#[derive(Debug)]
pub struct Frame {
    pub id: FrameId,
    pub caller: Option<FrameId>,
    pub code: Rc<CodeObject>,
    /// Index of the instruction being executed.
    pub lasti: usize,
    pub stack: Vec<Value>,
    pub fast: Vec<Option<Value>>,
    pub globals: Rc<ModuleValue>,
    pub blocks: Vec<Block>,
}

impl Frame {
    pub fn filename(&self) -> &str {
        &self.code.filename
    }

    pub fn line(&self) -> u32 {
        self.code.instruction(self.lasti).map(|i| i.line).unwrap_or(self.code.first_line)
    }

    pub fn block_depth(&self) -> usize {
        self.blocks.len()
    }

    /// True while an except clause of this frame is running.
    pub fn handling_exception(&self) -> bool {
        self.blocks.iter().any(|b| b.kind == BlockKind::ExceptHandler)
    }

    pub fn peek(&self, depth: usize) -> Option<&Value> {
        let len = self.stack.len();
        if depth >= len {
            return None;
        }
        self.stack.get(len - 1 - depth)
    }
}

#[derive(Debug, Default)]
pub struct FrameArena {
    frames: HashMap<FrameId, Frame>,
    next_id: u32,
}

impl FrameArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a frame for `code`, called from `caller`.
    pub fn push(&mut self, code: Rc<CodeObject>, globals: Rc<ModuleValue>, caller: Option<FrameId>) -> FrameId {
        let id = FrameId(self.next_id);
        self.next_id += 1;
        let fast = vec![None; code.varnames.len()];
        self.frames.insert(
            id,
            Frame { id, caller, code, lasti: 0, stack: Vec::new(), fast, globals, blocks: Vec::new() },
        );
        id
    }

    pub fn remove(&mut self, id: FrameId) -> Option<Frame> {
        self.frames.remove(&id)
    }

    pub fn get(&self, id: FrameId) -> Option<&Frame> {
        self.frames.get(&id)
    }

    pub fn get_mut(&mut self, id: FrameId) -> Option<&mut Frame> {
        self.frames.get_mut(&id)
    }

    pub fn caller_of(&self, id: FrameId) -> Option<FrameId> {
        self.frames.get(&id).and_then(|f| f.caller)
    }

    pub fn contains(&self, id: FrameId) -> bool {
        self.frames.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Callers of `id`, nearest first. Stops at the first frame no longer in the arena.
    pub fn ancestors(&self, id: FrameId) -> Vec<FrameId> {
        let mut chain = Vec::new();
        let mut cursor = self.caller_of(id);
        while let Some(frame) = cursor {
            if chain.contains(&frame) {
                break;
            }
            chain.push(frame);
            cursor = self.caller_of(frame);
        }
        chain
    }

    /// True when `ancestor` appears on the caller chain of `id`.
    pub fn is_ancestor(&self, ancestor: FrameId, id: FrameId) -> bool {
        self.ancestors(id).contains(&ancestor)
    }
}
