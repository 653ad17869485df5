// File: src/asm.rs
//
// A minimal instruction builder used by the test suite to hand-assemble
// `BytecodeImage`s without a real compiler front end (spec.md §1 puts the
// compiler out of scope; this is the leaf-level `emit`/patch machinery a
// compiler would sit on top of).

use crate::bytecode::{emit, Instructions, Op};
use crate::image::Constant;

pub struct FunctionBuilder {
    instructions: Instructions,
}

impl FunctionBuilder {
    pub fn new() -> Self {
        Self { instructions: Instructions::new() }
    }

    /// Emits `op` with `operands`, returning the byte offset it was
    /// written at (pass this to `patch_jump` later).
    pub fn emit(&mut self, op: Op, operands: &[usize]) -> usize {
        emit(&mut self.instructions, op, operands)
    }

    pub fn pos(&self) -> usize {
        self.instructions.len()
    }

    /// Rewrites the u16 operand of the Jump/JumpIfNotTrue instruction
    /// whose opcode byte sits at `pos` to `target`.
    pub fn patch_jump(&mut self, pos: usize, target: usize) {
        let bytes = (target as u16).to_be_bytes();
        self.instructions[pos + 1] = bytes[0];
        self.instructions[pos + 2] = bytes[1];
    }

    pub fn finish(self) -> Instructions {
        self.instructions
    }
}

impl Default for FunctionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Wraps a built instruction stream as a constant-pool `CompiledFunction`
/// entry, ready to be targeted by `OpClosure`.
pub fn compiled_function(instructions: Instructions, num_parameters: usize, num_locals: usize) -> Constant {
    Constant::CompiledFunction { instructions, num_parameters, num_locals }
}
