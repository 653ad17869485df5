// File: src/repl.rs
//
// Interactive read-eval-print loop (spec.md §6). The lexer/parser/compiler
// are out of this crate's scope; `CompileFrontend` is the seam a real one
// plugs into. Bindings, the constant pool's "conceptual" shape, and the
// globals array persist across lines via one `Store` carried between
// per-line engines.

use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::call::EngineOptions;
use crate::engine::Engine;
use crate::image::BytecodeImage;
use crate::stores::Store;
use crate::value::Value;

/// The external lexer/parser/compiler collaborator (spec.md §1 Non-goals,
/// §6 REPL). One call per input line; implementations are expected to
/// keep their own symbol table so identifiers resolve consistently across
/// lines (the engine only carries the globals array itself).
pub trait CompileFrontend {
    fn compile_line(&mut self, source: &str) -> Result<BytecodeImage, String>;
}

/// Placeholder used when no real compiler is wired in. Reports every line
/// as uncompilable rather than silently doing nothing.
pub struct NoFrontend;

impl CompileFrontend for NoFrontend {
    fn compile_line(&mut self, _source: &str) -> Result<BytecodeImage, String> {
        Err("no compiler front end configured".to_string())
    }
}

pub struct Repl<F: CompileFrontend> {
    frontend: F,
    globals: Store,
    editor: DefaultEditor,
    options: EngineOptions,
    line: usize,
}

impl<F: CompileFrontend> Repl<F> {
    pub fn new(frontend: F, options: EngineOptions) -> Result<Self, ReadlineError> {
        Ok(Self { frontend, globals: Store::new(), editor: DefaultEditor::new()?, options, line: 1 })
    }

    /// Reads lines until EOF, compiling and running each against a fresh
    /// engine that inherits the carried-over globals array.
    pub fn run(&mut self) -> Result<(), ReadlineError> {
        loop {
            let prompt = format!("{} > ", self.line);
            match self.editor.readline(&prompt) {
                Ok(line) => {
                    let _ = self.editor.add_history_entry(line.as_str());
                    if !line.trim().is_empty() {
                        self.eval_line(&line);
                        self.line += 1;
                    }
                }
                Err(ReadlineError::Interrupted) => continue,
                Err(ReadlineError::Eof) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }

    fn eval_line(&mut self, source: &str) {
        let image = match self.frontend.compile_line(source) {
            Ok(image) => image,
            Err(message) => {
                eprintln!("{} {}", "compile error:".red().bold(), message);
                return;
            }
        };

        let globals = std::mem::take(&mut self.globals);
        let mut engine = Engine::construct_with_globals(image, globals);
        engine.set_options(self.options);

        let mut tracer = |op: &crate::bytecode::Op| {
            eprintln!("{}", op);
            false
        };
        let outcome = if std::env::var_os("RUFF_VM_TRACE").is_some() {
            engine.run(Some(&mut tracer))
        } else {
            engine.run(None)
        };

        match outcome {
            Ok(()) => {
                let result = engine.last_popped();
                if result != Value::Null {
                    println!("{}", result);
                }
            }
            Err(err) => eprint!("{}", err),
        }

        self.globals = engine.globals;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ConstantFrontend(i64);

    impl CompileFrontend for ConstantFrontend {
        fn compile_line(&mut self, _source: &str) -> Result<BytecodeImage, String> {
            let mut instructions = crate::bytecode::Instructions::new();
            crate::bytecode::emit(&mut instructions, crate::bytecode::Op::Constant, &[0]);
            crate::bytecode::emit(&mut instructions, crate::bytecode::Op::Pop, &[]);
            Ok(BytecodeImage::new(vec![crate::image::Constant::Integer(self.0)], instructions))
        }
    }

    #[test]
    fn eval_line_runs_compiled_image_against_persistent_globals() {
        let mut repl =
            Repl { frontend: ConstantFrontend(7), globals: Store::new(), editor: DefaultEditor::new().unwrap(), options: EngineOptions::default(), line: 1 };
        repl.globals.set(0, Value::Integer(99));
        repl.eval_line("ignored");
        assert_eq!(repl.globals.get(0), Value::Integer(99));
    }
}
