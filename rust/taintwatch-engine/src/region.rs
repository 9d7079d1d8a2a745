//! Indirect taint: instruction ranges entered because a branch condition was tainted.
//!
//! Regions form a stack ordered by nesting. A region remembers its owner's
//! caller chain from when it was opened, so the tracker can still recognise
//! "execution is back in a caller" after the owner frame is gone.

use taintwatch_core::bytecode::{CodeObject, OpCode};
use taintwatch_core::frame::{FrameArena, FrameId};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaintRegion {
    pub frame: FrameId,
    pub begin: usize,
    /// Inclusive.
    pub end: usize,
    ancestors: Vec<FrameId>,
}

impl TaintRegion {
    pub fn covers(&self, frame: FrameId, index: usize) -> bool {
        self.frame == frame && (self.begin..=self.end).contains(&index)
    }
}

#[derive(Debug, Default)]
pub struct RegionTracker {
    stack: Vec<TaintRegion>,
}

impl RegionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn in_region(&self) -> bool {
        !self.stack.is_empty()
    }

    pub fn top(&self) -> Option<&TaintRegion> {
        self.stack.last()
    }

    /// Last instruction covered by a region opened at the conditional branch `index`.
    ///
    /// If the branch target is preceded by a forward jump that skips an else
    /// arm, the region extends to that jump's target.
    pub fn region_end(code: &CodeObject, index: usize) -> Option<usize> {
        let target = code.instruction(index)?.jump_target(index)?;
        let before = target.checked_sub(1).and_then(|i| code.instruction(i).map(|instr| (i, instr)));
        let end = match before {
            Some((i, instr)) if instr.op == OpCode::JumpForward => instr.jump_target(i).unwrap_or(target),
            Some((i, instr)) if instr.op == OpCode::JumpAbsolute && instr.arg as usize > i => instr.arg as usize,
            _ => target,
        };
        Some(end)
    }

    /// Open a region for the tainted branch at `begin`. Returns false when the
    /// top region already covers this point.
    pub fn enter(&mut self, frames: &FrameArena, frame: FrameId, begin: usize, end: usize) -> bool {
        if self.top().is_some_and(|top| top.covers(frame, begin)) {
            return false;
        }
        debug!(%frame, begin, end, depth = self.stack.len() + 1, "entering taint region");
        self.stack.push(TaintRegion { frame, begin, end, ancestors: frames.ancestors(frame) });
        true
    }

    /// Re-evaluate the top region for the instruction at `index` of `frame`.
    /// At most one region is popped per call.
    pub fn update(
        &mut self,
        frames: &FrameArena,
        frame: FrameId,
        index: usize,
        op: OpCode,
        skip: usize,
    ) -> Option<TaintRegion> {
        let top = self.stack.last()?;
        let pop = if top.frame == frame {
            !top.covers(frame, index) || (op == OpCode::ReturnValue && skip == 0)
        } else if frames.is_ancestor(top.frame, frame) {
            // a callee of the owner; the call does not end the region
            false
        } else {
            self.owner_returned_into(frame)
        };
        if !pop {
            return None;
        }
        let region = self.stack.pop();
        debug!(%frame, index, depth = self.stack.len(), "leaving taint region");
        region
    }

    /// True when `frame` is a recorded caller of some region owner above the
    /// nearest region that `frame` owns itself.
    fn owner_returned_into(&self, frame: FrameId) -> bool {
        self.stack
            .iter()
            .rev()
            .take_while(|region| region.frame != frame)
            .any(|region| region.ancestors.contains(&frame))
    }

    pub fn clear(&mut self) {
        self.stack.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;
    use taintwatch_core::asm::assemble;
    use taintwatch_core::values::ModuleValue;

    fn arena_chain(n: usize) -> (FrameArena, Vec<FrameId>) {
        let mut arena = FrameArena::new();
        let code = Rc::new(CodeObject::new("f", "main.py"));
        let globals = ModuleValue::new("__main__");
        let mut ids = Vec::new();
        for i in 0..n {
            let caller = if i == 0 { None } else { Some(ids[i - 1]) };
            ids.push(arena.push(Rc::clone(&code), Rc::clone(&globals), caller));
        }
        (arena, ids)
    }

    #[test]
    fn test_region_end_for_bare_if_and_if_else() {
        let bare = assemble(
            ".code m\n LOAD_NAME x\n POP_JUMP_IF_FALSE @out\n NOP\nout:\n LOAD_CONST None\n RETURN_VALUE\n",
            "m.py",
        )
        .unwrap();
        assert_eq!(RegionTracker::region_end(&bare, 1), Some(3));

        let with_else = assemble(
            ".code m\n LOAD_NAME x\n POP_JUMP_IF_FALSE @else\n NOP\n JUMP_FORWARD @out\nelse:\n NOP\n NOP\nout:\n LOAD_CONST None\n RETURN_VALUE\n",
            "m.py",
        )
        .unwrap();
        assert_eq!(RegionTracker::region_end(&with_else, 1), Some(6));
    }

    #[test]
    fn test_loop_back_edge_does_not_extend_region() {
        let code = assemble(
            ".code m\ntop:\n LOAD_NAME x\n POP_JUMP_IF_FALSE @out\n NOP\n JUMP_ABSOLUTE @top\nout:\n LOAD_CONST None\n RETURN_VALUE\n",
            "m.py",
        )
        .unwrap();
        assert_eq!(RegionTracker::region_end(&code, 1), Some(4));
    }

    #[test]
    fn test_push_and_pop_in_the_same_frame() {
        let (arena, ids) = arena_chain(1);
        let mut tracker = RegionTracker::new();
        assert!(tracker.enter(&arena, ids[0], 4, 9));
        assert!(!tracker.enter(&arena, ids[0], 6, 12));
        assert!(tracker.update(&arena, ids[0], 5, OpCode::Nop, 0).is_none());
        assert!(tracker.update(&arena, ids[0], 9, OpCode::Nop, 0).is_none());
        assert!(tracker.update(&arena, ids[0], 10, OpCode::Nop, 0).is_some());
        assert_eq!(tracker.depth(), 0);
        assert!(tracker.update(&arena, ids[0], 11, OpCode::Nop, 0).is_none());
    }

    #[test]
    fn test_executed_return_pops_but_skipped_return_does_not() {
        let (arena, ids) = arena_chain(1);
        let mut tracker = RegionTracker::new();
        tracker.enter(&arena, ids[0], 0, 10);
        assert!(tracker.update(&arena, ids[0], 5, OpCode::ReturnValue, 1).is_none());
        assert!(tracker.update(&arena, ids[0], 5, OpCode::ReturnValue, 0).is_some());
    }

    #[test]
    fn test_callee_of_owner_keeps_region_open() {
        let (arena, ids) = arena_chain(3);
        let mut tracker = RegionTracker::new();
        tracker.enter(&arena, ids[1], 2, 8);
        assert!(tracker.update(&arena, ids[2], 40, OpCode::Nop, 0).is_none());
        assert!(tracker.in_region());
    }

    #[test]
    fn test_return_into_caller_pops_even_after_owner_is_gone() {
        let (mut arena, ids) = arena_chain(2);
        let mut tracker = RegionTracker::new();
        tracker.enter(&arena, ids[1], 2, 8);
        arena.remove(ids[1]);
        let popped = tracker.update(&arena, ids[0], 3, OpCode::Nop, 0).expect("region popped");
        assert_eq!(popped.frame, ids[1]);
        assert!(!tracker.in_region());
    }

    #[test]
    fn test_at_most_one_pop_per_step() {
        let (arena, ids) = arena_chain(3);
        let mut tracker = RegionTracker::new();
        tracker.enter(&arena, ids[1], 0, 5);
        tracker.enter(&arena, ids[2], 0, 5);
        assert!(tracker.update(&arena, ids[0], 1, OpCode::Nop, 0).is_some());
        assert_eq!(tracker.depth(), 1);
        assert!(tracker.update(&arena, ids[0], 2, OpCode::Nop, 0).is_some());
        assert_eq!(tracker.depth(), 0);
    }
}
