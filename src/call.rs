// File: src/call.rs
//
// Call-site resolution for closures and built-ins, argument-count
// checking, and the optional per-invocation memoization cache
// (spec.md §4.5, §4.6).

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use ahash::AHasher;

use crate::builtins::BUILTINS;
use crate::engine::Engine;
use crate::errors::EngineError;
use crate::frame::Frame;
use crate::value::{Closure, FunctionId, Value};

/// Opt-in engine configuration (spec.md §4.6: "Memoization must be off by
/// default"). The only knob today is the memoization cache; `Default`
/// leaves everything off, matching `construct`'s plain behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineOptions {
    pub memoize: bool,
}

impl EngineOptions {
    /// Parses the CLI's `-o opt1,opt2` flag value (flags.go's
    /// `Optimizations` map, carried forward as the ambient config surface).
    pub fn from_flag_list(flags: &str) -> Self {
        let mut options = EngineOptions::default();
        for flag in flags.split(',') {
            if flag.trim() == "memoize" {
                options.memoize = true;
            }
        }
        options
    }
}

/// A recorded memoization-cache slot. `Pending` means a frame for this
/// call is currently executing and will fill the slot when it returns;
/// a `Pending` hit (recursive self-call before the first call returns)
/// is treated as a miss so the recursion still executes.
#[derive(Debug, Clone)]
enum MemoEntry {
    Pending,
    Ready(Value),
}

/// Key: (function identity, argument fingerprint). The fingerprint is a
/// structural hash over each argument's `HashKey` (§9's resolution of the
/// "fingerprinting by type-tag || display is brittle" open question) —
/// calls with any non-Hashable argument are never memoized.
type MemoKey = (FunctionId, u64);

pub struct MemoCache {
    entries: HashMap<MemoKey, MemoEntry>,
}

impl MemoCache {
    pub fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    /// Structural fingerprint of `args`, or `None` if any argument is not
    /// Hashable (Integer, Boolean, String) — such calls are never memoized.
    pub fn fingerprint(args: &[Value]) -> Option<u64> {
        let mut hasher = AHasher::default();
        for arg in args {
            let key = arg.hash_key()?;
            key.hash(&mut hasher);
        }
        Some(hasher.finish())
    }

    fn lookup(&self, key: MemoKey) -> Option<&MemoEntry> {
        self.entries.get(&key)
    }

    fn mark_pending(&mut self, key: MemoKey) {
        self.entries.insert(key, MemoEntry::Pending);
    }

    fn fill(&mut self, key: MemoKey, value: Value) {
        self.entries.insert(key, MemoEntry::Ready(value));
    }
}

impl Default for MemoCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Executes `OpCall` with `num_args` already on the stack below the
    /// callable (spec.md §4.5).
    pub(crate) fn execute_call(&mut self, num_args: usize) -> Result<(), EngineError> {
        let callee_index = self.stack.sp() - 1 - num_args;
        let callee = self.stack.get(callee_index).clone();

        match callee {
            Value::Closure(closure) => self.call_closure(closure, num_args, callee_index),
            Value::BuiltinFunction(builtin_ref) => self.call_builtin(builtin_ref.index, num_args),
            other => Err(EngineError::non_callable(other.type_name())),
        }
    }

    fn call_closure(
        &mut self,
        closure: Arc<Closure>,
        num_args: usize,
        callee_index: usize,
    ) -> Result<(), EngineError> {
        let expected = closure.function.num_parameters;
        if num_args != expected {
            return Err(EngineError::arity(expected, num_args));
        }

        let memo_key = if self.options.memoize {
            let args = self.stack.top_n(num_args).to_vec();
            MemoCache::fingerprint(&args).map(|fingerprint| (closure.function.id, fingerprint))
        } else {
            None
        };

        if let Some(key) = memo_key {
            if let Some(MemoEntry::Ready(value)) = self.memo.lookup(key) {
                let value = value.clone();
                self.stack.set_sp(callee_index);
                self.stack.push(value)?;
                return Ok(());
            }
        }

        let base_pointer = callee_index + 1;
        let num_locals = closure.function.num_locals;
        let mut frame = Frame::new(closure, base_pointer);
        frame.memo_key = memo_key;
        if let Some(key) = memo_key {
            self.memo.mark_pending(key);
        }
        self.frames.push(frame)?;
        self.stack.set_sp(base_pointer + num_locals);
        Ok(())
    }

    fn call_builtin(&mut self, index: usize, num_args: usize) -> Result<(), EngineError> {
        let args = self.stack.top_n(num_args).to_vec();
        let (_, builtin) = BUILTINS
            .get(index)
            .ok_or_else(|| EngineError::internal(format!("unknown builtin index: {}", index)))?;
        let result = builtin(self, &args);
        self.stack.set_sp(self.stack.sp() - num_args - 1);
        self.stack.push(result)?;
        Ok(())
    }

    /// Shared tail of `OpReturnValue`/`OpReturn` (spec.md §4.5): pop the
    /// current frame, restore `sp` to discard arguments and the callee,
    /// push `value`, and fill any pending memoization entry this call owned.
    pub(crate) fn do_return(&mut self, value: Value) -> Result<(), EngineError> {
        if self.frames.is_bottom() {
            // Return-from-top-level (spec.md §9): sp goes to 0, not popped.
            self.stack.set_sp(0);
            self.stack.push(value)?;
            return Ok(());
        }

        let frame = self.frames.pop();
        if let Some(key) = frame.memo_key {
            self.memo.fill(key, value.clone());
        }
        self.stack.set_sp(frame.base_pointer - 1);
        self.stack.push(value)
    }
}
