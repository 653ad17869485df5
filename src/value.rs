// File: src/value.rs
//
// Runtime value model for the bytecode engine.
// Tagged, value-semantic runtime values plus the Hashable/HashKey kernel
// used by hash-map construction and indexing.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use ahash::AHasher;

use crate::bytecode::Instructions;

/// Stable integer id assigned to every `CompiledFunction` at construction.
/// Used (together with argument fingerprints) as a memoization cache key.
pub type FunctionId = u64;

/// The body of a closure: immutable instructions plus arity metadata.
#[derive(Debug, PartialEq)]
pub struct CompiledFunction {
    pub instructions: Instructions,
    pub num_parameters: usize,
    pub num_locals: usize,
    pub id: FunctionId,
}

/// A runtime closure: a `CompiledFunction` plus the free values it captured
/// at construction time (see §4.7 — closures never capture by reference).
#[derive(Debug, PartialEq)]
pub struct Closure {
    pub function: Arc<CompiledFunction>,
    pub free: Vec<Value>,
}

/// A host-implemented callable. Built-ins are resolved by table index
/// (`GetBuiltinFunction`); the `Value` only carries the index and a name
/// for display purposes, not the function pointer itself, so that `Value`
/// stays `Clone`/`PartialEq` without comparing closures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuiltinRef {
    pub index: usize,
}

/// Content-addressed fingerprint for Hashable values (Integer, Boolean,
/// String). Two equal Hashable values always produce the same HashKey;
/// distinct variants never collide because the tag is part of the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HashKey {
    tag: u8,
    digest: u64,
}

const TAG_INTEGER: u8 = 0;
const TAG_BOOLEAN: u8 = 1;
const TAG_STRING: u8 = 2;

fn hash_str(s: &str) -> u64 {
    let mut hasher = AHasher::default();
    s.hash(&mut hasher);
    hasher.finish()
}

/// The central runtime value. One tag per variant, value semantics for
/// scalars, shared-reference semantics for containers (see §3 Ownership).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(i64),
    Boolean(bool),
    Null,
    String(Arc<str>),
    Array(Arc<Vec<Value>>),
    HashMap(Arc<HashMap<HashKey, (Value, Value)>>),
    CompiledFunction(Arc<CompiledFunction>),
    Closure(Arc<Closure>),
    BuiltinFunction(BuiltinRef),
    Error(Arc<str>),
}

impl Value {
    pub fn str(s: impl Into<Arc<str>>) -> Self {
        Value::String(s.into())
    }

    pub fn array(elements: Vec<Value>) -> Self {
        Value::Array(Arc::new(elements))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Value::Error(Arc::from(message.into()))
    }

    /// The short type tag used in error messages ("got=T") and hashing.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Integer(_) => "INTEGER",
            Value::Boolean(_) => "BOOLEAN",
            Value::Null => "NULL",
            Value::String(_) => "STRING",
            Value::Array(_) => "ARRAY",
            Value::HashMap(_) => "HASH",
            Value::CompiledFunction(_) => "COMPILED_FUNCTION_OBJ",
            Value::Closure(_) => "CLOSURE",
            Value::BuiltinFunction(_) => "BUILTIN",
            Value::Error(_) => "ERROR",
        }
    }

    /// Whether this value admits a HashKey (§3: Integer, Boolean, String).
    pub fn hash_key(&self) -> Option<HashKey> {
        match self {
            Value::Integer(n) => Some(HashKey { tag: TAG_INTEGER, digest: *n as u64 }),
            Value::Boolean(b) => Some(HashKey { tag: TAG_BOOLEAN, digest: if *b { 1 } else { 0 } }),
            Value::String(s) => Some(HashKey { tag: TAG_STRING, digest: hash_str(s) }),
            _ => None,
        }
    }

}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(n) => write!(f, "{}", n),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Null => write!(f, "null"),
            Value::String(s) => write!(f, "{}", s),
            Value::Array(elements) => {
                write!(f, "[")?;
                for (i, element) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", element)?;
                }
                write!(f, "]")
            }
            Value::HashMap(pairs) => {
                write!(f, "{{")?;
                for (i, (key, value)) in pairs.values().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", key, value)?;
                }
                write!(f, "}}")
            }
            Value::CompiledFunction(func) => write!(f, "CompiledFunction[{}]", func.id),
            Value::Closure(closure) => write!(f, "Closure[{}]", closure.function.id),
            Value::BuiltinFunction(_) => write!(f, "builtin function"),
            Value::Error(message) => write!(f, "ERROR: {}", message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_hash_by_value() {
        assert_eq!(Value::Integer(5).hash_key(), Value::Integer(5).hash_key());
        assert_ne!(Value::Integer(5).hash_key(), Value::Integer(6).hash_key());
    }

    #[test]
    fn strings_hash_stably_within_a_process() {
        let a = Value::str("hello");
        let b = Value::str("hello");
        assert_eq!(a.hash_key(), b.hash_key());
    }

    #[test]
    fn distinct_variants_never_collide_even_with_equal_digests() {
        // Boolean true digests as 1, same as Integer(1) would not digest to
        // (tag collapsed) — tags keep them apart regardless.
        assert_ne!(Value::Boolean(true).hash_key(), Value::Integer(1).hash_key());
    }

    #[test]
    fn containers_and_functions_are_not_hashable() {
        assert_eq!(Value::array(vec![]).hash_key(), None);
        assert_eq!(Value::Null.hash_key(), None);
    }

    #[test]
    fn display_matches_monkey_style_inspect() {
        assert_eq!(Value::array(vec![Value::Integer(1), Value::Integer(2)]).to_string(), "[1, 2]");
        assert_eq!(Value::error("boom").to_string(), "ERROR: boom");
    }
}
