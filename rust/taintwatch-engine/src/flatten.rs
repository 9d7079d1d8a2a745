//! Control-flow flattening.
//!
//! With `jump_branch` on, jumps become no-ops so one pass runs every arm of
//! every branch. Exception-handling scaffolding that would misbehave when
//! reached by fall-through is skipped, recognised by looking at the exact
//! opcodes that follow. Shapes that do not fit are reported as anomalies and
//! left to the host.

use serde::Serialize;
use taintwatch_core::bytecode::{CodeObject, OpCode};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rewrite {
    /// Let the host run the instruction.
    Run,
    /// Skip this many instructions, the current one included.
    Skip(usize),
    /// Pop the top of the stack, then skip.
    PopAndSkip(usize),
}

impl Rewrite {
    pub fn skip_count(self) -> usize {
        match self {
            Rewrite::Run => 0,
            Rewrite::Skip(n) | Rewrite::PopAndSkip(n) => n,
        }
    }
}

/// Frame state the rules depend on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFacts {
    pub exception_pending: bool,
    pub block_depth: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum AnomalyReason {
    #[error("computed skip {0} does not move forward")]
    NonPositiveSkip(i64),
    #[error("skip of {skip} from {index} passes the end of the code ({len} instructions)")]
    PastEnd { index: usize, skip: usize, len: usize },
}

/// A rewrite that was declined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlattenAnomaly {
    pub code: String,
    pub index: usize,
    pub op: OpCode,
    pub reason: AnomalyReason,
}

/// Flattening rewrite for the instruction at `index`.
pub fn plan(code: &CodeObject, index: usize, facts: FrameFacts) -> Result<Rewrite, AnomalyReason> {
    let Some(instr) = code.instruction(index) else {
        return Ok(Rewrite::Run);
    };
    let op_at = |i: usize| code.opcode_at(i);
    let jumps_to_for_iter = |i: usize| {
        code.instruction(i)
            .filter(|j| j.op == OpCode::JumpAbsolute)
            .and_then(|j| j.jump_target(i))
            .and_then(op_at)
            == Some(OpCode::ForIter)
    };

    let rewrite = match instr.op {
        OpCode::JumpForward => {
            let prev = index.checked_sub(1).and_then(op_at);
            if matches!(prev, Some(OpCode::PopBlock | OpCode::PopExcept)) {
                Rewrite::Run
            } else {
                Rewrite::Skip(1)
            }
        }
        OpCode::PopJumpIfFalse | OpCode::PopJumpIfTrue => Rewrite::PopAndSkip(1),
        OpCode::JumpAbsolute if jumps_to_for_iter(index) => Rewrite::Run,
        OpCode::JumpAbsolute => Rewrite::Skip(1),
        // an early return (a `break` out of a trailing loop) lets the rest of the body run
        OpCode::ReturnValue if index + 1 < code.len() => Rewrite::PopAndSkip(1),
        OpCode::PopTop if op_at(index + 1) == Some(OpCode::JumpAbsolute) && jumps_to_for_iter(index + 2) => {
            Rewrite::Skip(2)
        }
        OpCode::PopTop
            if !facts.exception_pending
                && op_at(index + 1) == Some(OpCode::PopTop)
                && op_at(index + 2) == Some(OpCode::PopTop) =>
        {
            Rewrite::Skip(3)
        }
        OpCode::PopExcept if !facts.exception_pending => Rewrite::Skip(1),
        OpCode::PopBlock | OpCode::Reraise if facts.block_depth == 0 => Rewrite::Skip(1),
        OpCode::DupTop if !facts.exception_pending => {
            let loads_class = matches!(op_at(index + 1), Some(OpCode::LoadGlobal | OpCode::LoadName));
            match code.instruction(index + 2) {
                Some(check) if loads_class && check.op == OpCode::JumpIfNotExcMatch => {
                    let skip = check.arg as i64 - index as i64;
                    if skip <= 0 {
                        return Err(AnomalyReason::NonPositiveSkip(skip));
                    }
                    Rewrite::Skip(skip as usize)
                }
                _ => Rewrite::Run,
            }
        }
        _ => Rewrite::Run,
    };

    let skip = rewrite.skip_count();
    if index + skip > code.len() {
        return Err(AnomalyReason::PastEnd { index, skip, len: code.len() });
    }
    Ok(rewrite)
}

/// A trailing `JUMP_ABSOLUTE` is the back-edge of an endless loop; skipping
/// it lets the body finish.
pub fn is_dead_loop_back_edge(code: &CodeObject, index: usize) -> bool {
    code.opcode_at(index) == Some(OpCode::JumpAbsolute) && code.last_index() == Some(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use taintwatch_core::asm::assemble;

    fn quiet() -> FrameFacts {
        FrameFacts { exception_pending: false, block_depth: 0 }
    }

    const TRY_EXCEPT: &str = "
.code m
    SETUP_FINALLY @handler
    LOAD_NAME risky
    CALL_FUNCTION 0
    POP_TOP
    POP_BLOCK
    JUMP_FORWARD @end
handler:
    DUP_TOP
    LOAD_NAME OSError
    JUMP_IF_NOT_EXC_MATCH @reraise
    POP_TOP
    POP_TOP
    POP_TOP
    POP_EXCEPT
    JUMP_FORWARD @end
reraise:
    RERAISE
end:
    LOAD_CONST None
    RETURN_VALUE
";

    #[test]
    fn test_jumps_fall_through() {
        let code = assemble(TRY_EXCEPT, "m.py").unwrap();
        // JUMP_FORWARD right after POP_BLOCK leaves the try body normally
        assert_eq!(plan(&code, 5, quiet()), Ok(Rewrite::Run));
        // and right after POP_EXCEPT leaves the handler normally
        assert_eq!(plan(&code, 13, quiet()), Ok(Rewrite::Run));
        assert_eq!(plan(&code, 3, quiet()), Ok(Rewrite::Run));
    }

    #[test]
    fn test_handler_is_skipped_without_a_pending_exception() {
        let code = assemble(TRY_EXCEPT, "m.py").unwrap();
        let pending = FrameFacts { exception_pending: true, block_depth: 1 };
        // DUP_TOP / LOAD_NAME / JUMP_IF_NOT_EXC_MATCH: jump to the next clause
        assert_eq!(plan(&code, 6, quiet()), Ok(Rewrite::Skip(8)));
        assert_eq!(plan(&code, 6, pending), Ok(Rewrite::Run));
        assert_eq!(plan(&code, 9, quiet()), Ok(Rewrite::Skip(3)));
        assert_eq!(plan(&code, 9, pending), Ok(Rewrite::Run));
        assert_eq!(plan(&code, 12, quiet()), Ok(Rewrite::Skip(1)));
        assert_eq!(plan(&code, 12, pending), Ok(Rewrite::Run));
        assert_eq!(plan(&code, 14, quiet()), Ok(Rewrite::Skip(1)));
        assert_eq!(plan(&code, 14, pending), Ok(Rewrite::Run));
        assert_eq!(plan(&code, 4, FrameFacts { exception_pending: false, block_depth: 1 }), Ok(Rewrite::Run));
        assert_eq!(plan(&code, 4, quiet()), Ok(Rewrite::Skip(1)));
    }

    #[test]
    fn test_loop_shapes() {
        let code = assemble(
            "
.code m
    LOAD_NAME items
    GET_ITER
loop:
    FOR_ITER @done
    STORE_NAME x
    LOAD_NAME x
    POP_JUMP_IF_FALSE @next
    POP_TOP
    JUMP_ABSOLUTE @done
next:
    JUMP_ABSOLUTE @loop
done:
    LOAD_CONST None
    RETURN_VALUE
",
            "m.py",
        )
        .unwrap();
        assert_eq!(plan(&code, 5, quiet()), Ok(Rewrite::PopAndSkip(1)));
        // `break`: keep the iterator on the stack and land on the back-edge
        assert_eq!(plan(&code, 6, quiet()), Ok(Rewrite::Skip(2)));
        assert_eq!(plan(&code, 7, quiet()), Ok(Rewrite::Skip(1)));
        assert_eq!(plan(&code, 8, quiet()), Ok(Rewrite::Run));
        assert_eq!(plan(&code, 10, quiet()), Ok(Rewrite::Run));
    }

    #[test]
    fn test_early_return_is_skipped_but_final_return_runs() {
        let code = assemble(".code m\n LOAD_CONST 1\n RETURN_VALUE\n LOAD_CONST None\n RETURN_VALUE\n", "m.py").unwrap();
        assert_eq!(plan(&code, 1, quiet()), Ok(Rewrite::PopAndSkip(1)));
        assert_eq!(plan(&code, 3, quiet()), Ok(Rewrite::Run));
    }

    #[test]
    fn test_backward_exception_match_is_an_anomaly() {
        let code = assemble(
            ".code m\ntop:\n NOP\n DUP_TOP\n LOAD_GLOBAL E\n JUMP_IF_NOT_EXC_MATCH @top\n RETURN_VALUE\n",
            "m.py",
        )
        .unwrap();
        assert_eq!(plan(&code, 1, quiet()), Err(AnomalyReason::NonPositiveSkip(-1)));
    }

    #[test]
    fn test_skip_past_the_end_is_an_anomaly() {
        let tail = assemble(".code m\n NOP\n DUP_TOP\n LOAD_GLOBAL E\n JUMP_IF_NOT_EXC_MATCH 9\n", "m.py").unwrap();
        assert_eq!(plan(&tail, 1, quiet()), Err(AnomalyReason::PastEnd { index: 1, skip: 8, len: 4 }));
    }

    #[test]
    fn test_dead_loop_back_edge() {
        let code = assemble(".code m\ntop:\n NOP\n JUMP_ABSOLUTE @top\n", "m.py").unwrap();
        assert!(is_dead_loop_back_edge(&code, 1));
        assert!(!is_dead_loop_back_edge(&code, 0));
    }
}
