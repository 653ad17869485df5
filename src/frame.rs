// File: src/frame.rs
//
// Activation-frame call stack. Each Frame borrows the Closure whose body
// is executing; see spec.md §3 for the Frame/Engine-state invariants.

use std::sync::Arc;

use crate::errors::EngineError;
use crate::value::Closure;

/// Ceiling on concurrent call depth (spec.md §3).
pub const MAX_FRAMES: usize = 1024;

/// One activation record: the executing closure, an instruction pointer
/// (byte offset, pre-incremented by the dispatch loop), and the operand
/// stack index where this call's locals begin.
#[derive(Clone)]
pub struct Frame {
    pub closure: Arc<Closure>,
    pub ip: isize,
    pub base_pointer: usize,
    /// Set when this call was dispatched under memoization and missed the
    /// cache; `do_return` fills the slot with this key on the way out.
    pub memo_key: Option<(crate::value::FunctionId, u64)>,
}

impl Frame {
    /// `ip` starts "just before the first instruction" (spec.md §3): the
    /// dispatch loop increments before reading, so -1 aligns to offset 0.
    pub fn new(closure: Arc<Closure>, base_pointer: usize) -> Self {
        Self { closure, ip: -1, base_pointer, memo_key: None }
    }

    pub fn instructions(&self) -> &crate::bytecode::Instructions {
        &self.closure.function.instructions
    }
}

/// Fixed-capacity frame stack, indexed by `frame_index` (spec.md §3:
/// `1 <= frame_index <= MAX_FRAMES`; the bottom frame wraps the top-level
/// instructions).
pub struct FrameStack {
    frames: Vec<Option<Frame>>,
    frame_index: usize,
}

impl FrameStack {
    pub fn new(bottom: Frame) -> Self {
        let mut frames = vec![None; MAX_FRAMES];
        frames[0] = Some(bottom);
        Self { frames, frame_index: 1 }
    }

    pub fn current(&self) -> &Frame {
        self.frames[self.frame_index - 1].as_ref().expect("current frame always present")
    }

    pub fn current_mut(&mut self) -> &mut Frame {
        self.frames[self.frame_index - 1].as_mut().expect("current frame always present")
    }

    pub fn push(&mut self, frame: Frame) -> Result<(), EngineError> {
        if self.frame_index >= MAX_FRAMES {
            return Err(EngineError::internal("frame stack overflow"));
        }
        self.frames[self.frame_index] = Some(frame);
        self.frame_index += 1;
        Ok(())
    }

    /// Pops and returns the current frame. The bottom frame (index 0) is
    /// never popped (spec.md §4.5's "Return-from-top-level" note).
    pub fn pop(&mut self) -> Frame {
        debug_assert!(self.frame_index > 1, "must not pop the bottom frame");
        self.frame_index -= 1;
        self.frames[self.frame_index].take().expect("popped frame always present")
    }

    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    pub fn is_bottom(&self) -> bool {
        self.frame_index == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::CompiledFunction;

    fn dummy_closure(instructions: Vec<u8>) -> Arc<Closure> {
        Arc::new(Closure {
            function: Arc::new(CompiledFunction {
                instructions,
                num_parameters: 0,
                num_locals: 0,
                id: 0,
            }),
            free: vec![],
        })
    }

    #[test]
    fn bottom_frame_starts_at_index_one() {
        let frames = FrameStack::new(Frame::new(dummy_closure(vec![]), 0));
        assert_eq!(frames.frame_index(), 1);
        assert!(frames.is_bottom());
    }

    #[test]
    fn push_and_pop_switch_current_frame() {
        let mut frames = FrameStack::new(Frame::new(dummy_closure(vec![1, 2, 3]), 0));
        frames.push(Frame::new(dummy_closure(vec![4, 5]), 1)).unwrap();
        assert_eq!(frames.frame_index(), 2);
        assert_eq!(frames.current().instructions(), &vec![4, 5]);
        let popped = frames.pop();
        assert_eq!(popped.instructions(), &vec![4, 5]);
        assert_eq!(frames.frame_index(), 1);
        assert_eq!(frames.current().instructions(), &vec![1, 2, 3]);
    }

    #[test]
    fn new_frame_ip_is_pre_first_instruction() {
        let frame = Frame::new(dummy_closure(vec![]), 0);
        assert_eq!(frame.ip, -1);
    }
}
