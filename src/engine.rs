// File: src/engine.rs
//
// The dispatch loop: reads opcodes from the current frame, mutates the
// operand stack and the stores, and drives control flow, call/return,
// and closure construction (spec.md §4.2).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::bytecode::{read_u16, read_u8, Op};
use crate::call::{EngineOptions, MemoCache};
use crate::errors::EngineError;
use crate::frame::{Frame, FrameStack};
use crate::image::{BytecodeImage, Constant};
use crate::stack::OperandStack;
use crate::stores::Store;
use crate::value::{Closure, CompiledFunction, FunctionId, Value};

static NEXT_FUNCTION_ID: AtomicU64 = AtomicU64::new(1);

fn next_function_id() -> FunctionId {
    NEXT_FUNCTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// A caller-supplied callable invoked per opcode, pre-execution (spec.md
/// §9's "Trace hook"). Returning `true` cancels the run at the next
/// opcode boundary, so `sp`/frame-index stay consistent.
pub type TraceHook<'a> = &'a mut dyn FnMut(&Op) -> bool;

/// Everything one bytecode run needs: the operand stack, the frame stack,
/// the two flat stores, the shared constant pool, engine options, and the
/// (optional) memoization cache (spec.md §3 "Engine state").
pub struct Engine {
    pub(crate) stack: OperandStack,
    pub(crate) frames: FrameStack,
    pub(crate) globals: Store,
    pub(crate) variables: Store,
    pub(crate) constants: Arc<Vec<Value>>,
    pub(crate) options: EngineOptions,
    pub(crate) memo: MemoCache,
    /// Accumulates the body written by `writeHttp` calls (spec.md §4.8).
    /// Unused outside an `httpServer` handler's sub-engine.
    pub(crate) http_response: String,
}

impl Engine {
    /// Fresh engine: empty globals and variables, bottom frame wraps
    /// `image.instructions` as a zero-arity, zero-local `CompiledFunction`
    /// closed over no free values (spec.md §6).
    pub fn construct(image: BytecodeImage) -> Engine {
        Self::construct_with_globals(image, Store::new())
    }

    /// Like `construct`, but reuses a caller-provided globals array — the
    /// REPL keeps one of these alive across lines so top-level bindings
    /// persist (spec.md §6).
    pub fn construct_with_globals(image: BytecodeImage, globals: Store) -> Engine {
        let constants = image.constants.into_iter().map(Self::materialize_constant).collect();

        let bottom_function = Arc::new(CompiledFunction {
            instructions: image.instructions,
            num_parameters: 0,
            num_locals: 0,
            id: next_function_id(),
        });
        let bottom_closure = Arc::new(Closure { function: bottom_function, free: Vec::new() });

        Engine {
            stack: OperandStack::new(),
            frames: FrameStack::new(Frame::new(bottom_closure, 0)),
            globals,
            variables: Store::new(),
            constants: Arc::new(constants),
            options: EngineOptions::default(),
            memo: MemoCache::new(),
            http_response: String::new(),
        }
    }

    fn materialize_constant(constant: Constant) -> Value {
        match constant {
            Constant::Integer(n) => Value::Integer(n),
            Constant::String(s) => Value::str(s),
            Constant::CompiledFunction { instructions, num_parameters, num_locals } => {
                Value::CompiledFunction(Arc::new(CompiledFunction {
                    instructions,
                    num_parameters,
                    num_locals,
                    id: next_function_id(),
                }))
            }
        }
    }

    /// Constructs a throwaway engine whose bottom frame *is* `closure`
    /// itself (rather than a wrapper around top-level instructions), with a
    /// `writeHttp`-like single-argument String-consuming callable pre-loaded
    /// into local slot 0 — used by the `httpServer` built-in to dispatch one
    /// request through a handler closure (spec.md §4.8). The handler writes
    /// its response by invoking that callable; it is not read from
    /// `last_popped`.
    fn construct_for_handler(
        closure: Arc<Closure>,
        constants: Arc<Vec<Value>>,
        globals: Store,
        variables: Store,
        write_http: Value,
    ) -> Result<Engine, EngineError> {
        let mut stack = OperandStack::new();
        stack.push(write_http)?;
        let num_locals = closure.function.num_locals.max(1);
        stack.set_sp(num_locals);

        Ok(Engine {
            stack,
            frames: FrameStack::new(Frame::new(closure, 0)),
            globals,
            variables,
            constants,
            options: EngineOptions::default(),
            memo: MemoCache::new(),
            http_response: String::new(),
        })
    }

    pub fn set_options(&mut self, options: EngineOptions) {
        self.options = options;
    }

    /// `stack[sp]`, the slot the most recent pop vacated — the value of
    /// the last expression evaluated in this run (spec.md §6).
    pub fn last_popped(&self) -> Value {
        self.stack.last_popped()
    }

    /// Runs a handler closure against a one-shot sub-engine sharing this
    /// engine's constants, globals, and variables, returning the response
    /// body the handler wrote via `writeHttp` (spec.md §4.8) — not its
    /// `last_popped` value. Handlers run sequentially (spec.md §5); globals
    /// and variables are moved out for the duration of the call and moved
    /// back once it completes, so mutations are visible afterwards.
    pub(crate) fn run_http_handler(&mut self, closure: Arc<Closure>) -> String {
        let globals = std::mem::replace(&mut self.globals, Store::new());
        let variables = std::mem::replace(&mut self.variables, Store::new());
        let constants = self.constants.clone();
        let write_http_index = crate::builtins::index_of("writeHttp")
            .expect("writeHttp is always registered in BUILTINS");

        let mut sub = match Self::construct_for_handler(
            closure,
            constants,
            globals,
            variables,
            Value::BuiltinFunction(crate::value::BuiltinRef { index: write_http_index }),
        ) {
            Ok(engine) => engine,
            Err(err) => {
                self.globals = Store::new();
                self.variables = Store::new();
                return format!("ERROR: {}", err.message);
            }
        };

        let outcome = sub.run(None);
        self.globals = sub.globals;
        self.variables = sub.variables;

        match outcome {
            Ok(()) => sub.http_response,
            Err(err) => format!("ERROR: {}", err.message),
        }
    }

    /// Executes until the current (initially: bottom) frame's `ip` reaches
    /// the end of its instructions (spec.md §4.2).
    pub fn run(&mut self, mut trace: Option<TraceHook<'_>>) -> Result<(), EngineError> {
        loop {
            let ip = self.frames.current().ip;
            let len = self.frames.current().instructions().len() as isize;
            if ip >= len - 1 {
                return Ok(());
            }

            let next_ip = (ip + 1) as usize;
            let byte = self.frames.current().instructions()[next_ip];
            let op = Op::from_byte(byte).ok_or_else(|| EngineError::unknown_opcode(byte))?;

            if let Some(hook) = trace.as_deref_mut() {
                if hook(&op) {
                    return Err(EngineError::internal("run cancelled by trace hook"));
                }
            }

            self.execute(op, next_ip)?;
        }
    }

    /// Decodes `op`'s operands starting at `ip + 1` (advancing the current
    /// frame's `ip` past them), then performs its effect. Operand reads
    /// always happen against the frame that *contained* `op`, even when
    /// the effect (Call/Return) changes which frame is current afterwards.
    fn execute(&mut self, op: Op, ip: usize) -> Result<(), EngineError> {
        let widths = op.operand_widths();
        let mut operands = [0usize; 2];
        let mut cursor = ip + 1;
        for (slot, &width) in operands.iter_mut().zip(widths) {
            let instructions = self.frames.current().instructions();
            *slot = match width {
                2 => read_u16(instructions, cursor) as usize,
                1 => read_u8(instructions, cursor) as usize,
                other => return Err(EngineError::internal(format!("bad operand width: {}", other))),
            };
            cursor += width as usize;
        }
        self.frames.current_mut().ip = (cursor - 1) as isize;

        match op {
            Op::Constant => {
                let value = self.constants[operands[0]].clone();
                self.stack.push(value)
            }
            Op::Pop => {
                self.stack.pop();
                Ok(())
            }
            Op::Add => self.execute_add(),
            Op::Subtract => self.execute_integer_binop(|a, b| a - b),
            Op::Multiply => self.execute_integer_binop(|a, b| a * b),
            Op::Divide => self.execute_integer_binop(|a, b| a / b),
            Op::True => self.stack.push(Value::Boolean(true)),
            Op::False => self.stack.push(Value::Boolean(false)),
            Op::Null => self.stack.push(Value::Null),
            Op::Equals => self.execute_equality(true),
            Op::NotEquals => self.execute_equality(false),
            Op::GreaterThan => self.execute_greater_than(),
            Op::Jump => {
                self.frames.current_mut().ip = operands[0] as isize - 1;
                Ok(())
            }
            Op::JumpIfNotTrue => self.execute_jump_if_not_true(operands[0]),
            Op::SetGlobal => {
                let value = self.stack.pop();
                self.globals.set(operands[0] as u16, value);
                Ok(())
            }
            Op::GetGlobal => self.stack.push(self.globals.get(operands[0] as u16)),
            Op::SetVar => {
                let value = self.stack.pop();
                self.variables.set(operands[0] as u16, value);
                Ok(())
            }
            Op::GetVar => self.stack.push(self.variables.get(operands[0] as u16)),
            Op::SetLocal => {
                let value = self.stack.pop();
                let index = self.frames.current().base_pointer + operands[0];
                self.stack.set(index, value);
                Ok(())
            }
            Op::GetLocal => {
                let index = self.frames.current().base_pointer + operands[0];
                self.stack.push(self.stack.get(index).clone())
            }
            Op::Array => self.execute_array(operands[0]),
            Op::Hash => self.execute_hash(operands[0]),
            Op::Index => self.execute_index(),
            Op::Call => self.execute_call(operands[0]),
            Op::ReturnValue => {
                let value = self.stack.pop();
                self.do_return(value)
            }
            Op::Return => self.do_return(Value::Null),
            Op::Closure => self.execute_closure(operands[0], operands[1]),
            Op::GetFree => {
                let value = self.frames.current().closure.free[operands[0]].clone();
                self.stack.push(value)
            }
            Op::GetBuiltinFunction => {
                self.stack.push(Value::BuiltinFunction(crate::value::BuiltinRef { index: operands[0] }))
            }
        }
    }

    fn execute_add(&mut self) -> Result<(), EngineError> {
        let b = self.stack.pop();
        let a = self.stack.pop();
        let result = match (&a, &b) {
            (Value::Integer(x), Value::Integer(y)) => Value::Integer(x + y),
            (Value::String(x), Value::String(y)) => Value::str(format!("{}{}", x, y)),
            (Value::String(x), Value::Integer(y)) => Value::str(format!("{}{}", x, y)),
            (Value::Integer(x), Value::String(y)) => Value::str(format!("{}{}", x, y)),
            _ => {
                return Err(EngineError::type_error(format!(
                    "unknown operation exception. got={}. got={}",
                    a.type_name(),
                    b.type_name()
                )))
            }
        };
        self.stack.push(result)
    }

    fn execute_integer_binop(&mut self, op: impl Fn(i64, i64) -> i64) -> Result<(), EngineError> {
        let b = self.stack.pop();
        let a = self.stack.pop();
        match (&a, &b) {
            (Value::Integer(x), Value::Integer(y)) => self.stack.push(Value::Integer(op(*x, *y))),
            _ => Err(EngineError::type_error(format!(
                "unknown operation exception. got={}. got={}",
                a.type_name(),
                b.type_name()
            ))),
        }
    }

    fn execute_equality(&mut self, want_equal: bool) -> Result<(), EngineError> {
        let b = self.stack.pop();
        let a = self.stack.pop();
        let is_equal = match (&a, &b) {
            (Value::Integer(x), Value::Integer(y)) => x == y,
            (Value::Integer(_), _) | (_, Value::Integer(_)) => {
                let bad = if matches!(a, Value::Integer(_)) { b.type_name() } else { a.type_name() };
                return Err(EngineError::type_error(format!("left comparison is not of type integer. got={}", bad)));
            }
            _ => a == b,
        };
        self.stack.push(Value::Boolean(is_equal == want_equal))
    }

    fn execute_greater_than(&mut self) -> Result<(), EngineError> {
        let b = self.stack.pop();
        let a = self.stack.pop();
        match (&a, &b) {
            (Value::Integer(x), Value::Integer(y)) => self.stack.push(Value::Boolean(x > y)),
            _ => {
                let bad = if matches!(a, Value::Integer(_)) { b.type_name() } else { a.type_name() };
                Err(EngineError::type_error(format!("left comparison is not of type integer. got={}", bad)))
            }
        }
    }

    fn execute_jump_if_not_true(&mut self, target: usize) -> Result<(), EngineError> {
        let condition = self.stack.pop();
        match condition {
            Value::Boolean(true) => Ok(()),
            Value::Boolean(false) => {
                self.frames.current_mut().ip = target as isize - 1;
                Ok(())
            }
            other => Err(EngineError::type_error(format!("condition is not boolean. got={}", other.type_name()))),
        }
    }

    fn execute_array(&mut self, n: usize) -> Result<(), EngineError> {
        let elements = self.stack.top_n(n).to_vec();
        self.stack.set_sp(self.stack.sp() - n);
        self.stack.push(Value::array(elements))
    }

    fn execute_hash(&mut self, n: usize) -> Result<(), EngineError> {
        let slots = self.stack.top_n(n).to_vec();
        self.stack.set_sp(self.stack.sp() - n);
        let mut pairs = HashMap::with_capacity(n / 2);
        for chunk in slots.chunks_exact(2) {
            let key = &chunk[0];
            let value = chunk[1].clone();
            let hash_key = key
                .hash_key()
                .ok_or_else(|| EngineError::type_error(format!("incorrect key type: {}", key.type_name())))?;
            pairs.insert(hash_key, (key.clone(), value));
        }
        self.stack.push(Value::HashMap(Arc::new(pairs)))
    }

    fn execute_index(&mut self) -> Result<(), EngineError> {
        let index = self.stack.pop();
        let collection = self.stack.pop();
        match &collection {
            Value::Array(elements) => match index {
                Value::Integer(i) if i >= 0 && (i as usize) < elements.len() => {
                    self.stack.push(elements[i as usize].clone())
                }
                Value::Integer(_) => self.stack.push(Value::Null),
                _ => Err(EngineError::type_error(format!(
                    "index operator not supported on: {}",
                    collection.type_name()
                ))),
            },
            Value::HashMap(pairs) => match index.hash_key() {
                Some(key) => {
                    let value = pairs.get(&key).map(|(_, v)| v.clone()).unwrap_or(Value::Null);
                    self.stack.push(value)
                }
                None => Err(EngineError::type_error(format!("incorrect key type: {}", index.type_name()))),
            },
            other => Err(EngineError::type_error(format!("index operator not supported on: {}", other.type_name()))),
        }
    }

    fn execute_closure(&mut self, const_index: usize, num_free: usize) -> Result<(), EngineError> {
        let function = match &self.constants[const_index] {
            Value::CompiledFunction(function) => function.clone(),
            other => {
                return Err(EngineError::internal(format!(
                    "OpClosure constant at {} is not a CompiledFunction: {}",
                    const_index,
                    other.type_name()
                )))
            }
        };
        let free = self.stack.top_n(num_free).to_vec();
        self.stack.set_sp(self.stack.sp() - num_free);
        self.stack.push(Value::Closure(Arc::new(Closure { function, free })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{emit, Instructions};
    use crate::image::Constant;

    fn run_program(constants: Vec<Constant>, instructions: Instructions) -> Engine {
        let mut engine = Engine::construct(BytecodeImage::new(constants, instructions));
        engine.run(None).expect("program runs without error");
        engine
    }

    #[test]
    fn adds_two_constants() {
        let mut instructions = Instructions::new();
        emit(&mut instructions, Op::Constant, &[0]);
        emit(&mut instructions, Op::Constant, &[1]);
        emit(&mut instructions, Op::Add, &[]);
        emit(&mut instructions, Op::Pop, &[]);

        let engine = run_program(vec![Constant::Integer(1), Constant::Integer(2)], instructions);
        assert_eq!(engine.last_popped(), Value::Integer(3));
    }

    #[test]
    fn concatenates_mixed_string_and_integer() {
        let mut instructions = Instructions::new();
        emit(&mut instructions, Op::Constant, &[0]);
        emit(&mut instructions, Op::Constant, &[1]);
        emit(&mut instructions, Op::Add, &[]);
        emit(&mut instructions, Op::Pop, &[]);

        let engine =
            run_program(vec![Constant::String("count: ".to_string()), Constant::Integer(7)], instructions);
        assert_eq!(engine.last_popped(), Value::str("count: 7"));
    }

    #[test]
    fn jump_if_not_true_skips_the_then_branch() {
        let mut instructions = Instructions::new();
        emit(&mut instructions, Op::False, &[]);
        let jump_pos = emit(&mut instructions, Op::JumpIfNotTrue, &[9999]);
        emit(&mut instructions, Op::Constant, &[0]);
        emit(&mut instructions, Op::Jump, &[9999]);
        let else_target = instructions.len();
        emit(&mut instructions, Op::Constant, &[1]);
        let after_target = instructions.len();
        emit(&mut instructions, Op::Pop, &[]);

        instructions[jump_pos + 1..jump_pos + 3].copy_from_slice(&(else_target as u16).to_be_bytes());
        let jump_operand_pos = jump_pos + 3 + 3 + 1;
        instructions[jump_operand_pos..jump_operand_pos + 2]
            .copy_from_slice(&(after_target as u16).to_be_bytes());

        let engine = run_program(vec![Constant::Integer(10), Constant::Integer(20)], instructions);
        assert_eq!(engine.last_popped(), Value::Integer(20));
    }

    #[test]
    fn out_of_range_array_index_is_null() {
        let mut instructions = Instructions::new();
        emit(&mut instructions, Op::Constant, &[0]);
        emit(&mut instructions, Op::Constant, &[1]);
        emit(&mut instructions, Op::Constant, &[2]);
        emit(&mut instructions, Op::Array, &[3]);
        emit(&mut instructions, Op::Constant, &[3]);
        emit(&mut instructions, Op::Index, &[]);
        emit(&mut instructions, Op::Pop, &[]);

        let engine = run_program(
            vec![Constant::Integer(1), Constant::Integer(2), Constant::Integer(3), Constant::Integer(3)],
            instructions,
        );
        assert_eq!(engine.last_popped(), Value::Null);
    }

    #[test]
    fn indexing_an_array_with_a_non_integer_names_the_array_type() {
        let mut instructions = Instructions::new();
        emit(&mut instructions, Op::Constant, &[0]);
        emit(&mut instructions, Op::Array, &[1]);
        emit(&mut instructions, Op::Constant, &[1]);
        emit(&mut instructions, Op::Index, &[]);

        let mut engine = Engine::construct(BytecodeImage::new(
            vec![Constant::Integer(1), Constant::String("x".to_string())],
            instructions,
        ));
        let err = engine.run(None).unwrap_err();
        assert_eq!(err.message, "index operator not supported on: ARRAY");
    }

    #[test]
    fn equals_between_an_integer_and_a_non_integer_is_a_comparison_error() {
        let mut instructions = Instructions::new();
        emit(&mut instructions, Op::Constant, &[0]);
        emit(&mut instructions, Op::Constant, &[1]);
        emit(&mut instructions, Op::Equals, &[]);

        let mut engine = Engine::construct(BytecodeImage::new(
            vec![Constant::Integer(1), Constant::String("x".to_string())],
            instructions,
        ));
        let err = engine.run(None).unwrap_err();
        assert_eq!(err.message, "left comparison is not of type integer. got=STRING");
    }

    #[test]
    fn hash_index_looks_up_by_key() {
        let mut instructions = Instructions::new();
        emit(&mut instructions, Op::Constant, &[0]);
        emit(&mut instructions, Op::Constant, &[1]);
        emit(&mut instructions, Op::Hash, &[2]);
        emit(&mut instructions, Op::Constant, &[0]);
        emit(&mut instructions, Op::Index, &[]);
        emit(&mut instructions, Op::Pop, &[]);

        let engine = run_program(vec![Constant::Integer(1), Constant::Integer(200)], instructions);
        assert_eq!(engine.last_popped(), Value::Integer(200));
    }

    #[test]
    fn unknown_opcode_is_an_error() {
        let instructions: Instructions = vec![250];
        let mut engine = Engine::construct(BytecodeImage::new(vec![], instructions));
        let err = engine.run(None).unwrap_err();
        assert_eq!(err.message, "unknown operator: 250");
    }

    #[test]
    fn global_bindings_round_trip() {
        let mut instructions = Instructions::new();
        emit(&mut instructions, Op::Constant, &[0]);
        emit(&mut instructions, Op::SetGlobal, &[5]);
        emit(&mut instructions, Op::GetGlobal, &[5]);
        emit(&mut instructions, Op::Pop, &[]);

        let engine = run_program(vec![Constant::Integer(42)], instructions);
        assert_eq!(engine.last_popped(), Value::Integer(42));
    }
}
