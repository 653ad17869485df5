// File: src/image.rs
//
// The bytecode image: the (constant pool, top-level instructions) pair
// produced by the external compiler (spec.md §6). The on-disk wire format
// is this crate's own choice (the core only cares about the in-memory
// shape) — we use `bincode` over a `serde`-derived `Constant`/`BytecodeImage`
// pair, following the bytecode-VM convention seen across this corpus
// (e.g. the Vitte VM's `bincode`-encoded `Op` stream).

use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::bytecode::Instructions;

/// A constant-pool entry as it exists on disk, before the loader turns it
/// into a runtime `Value` (functions get a fresh `FunctionId` stamped on
/// load — see `Engine::construct`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Integer(i64),
    String(String),
    CompiledFunction { instructions: Instructions, num_parameters: usize, num_locals: usize },
}

/// The compiler/loader contract: a constant pool plus the top-level
/// instruction sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BytecodeImage {
    pub constants: Vec<Constant>,
    pub instructions: Instructions,
}

impl BytecodeImage {
    pub fn new(constants: Vec<Constant>, instructions: Instructions) -> Self {
        Self { constants, instructions }
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let bytes = std::fs::read(path)?;
        bincode::deserialize(&bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    }

    pub fn save_to_path(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let bytes = bincode::serialize(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        std::fs::write(path, bytes)
    }
}
