// File: src/main.rs
//
// Thin CLI wrapper around the engine (spec.md §6): run a bytecode image
// from disk, or start the REPL. Not part of the core.

mod asm;
mod builtins;
mod bytecode;
mod call;
mod engine;
mod errors;
mod frame;
mod image;
mod repl;
mod stack;
mod stores;
mod value;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser as ClapParser, Subcommand};

use bytecode::Op;
use call::EngineOptions;
use engine::Engine;
use image::BytecodeImage;
use repl::{NoFrontend, Repl};
use value::Value;

/// `RUFF_VM_TRACE=1 ruff-vm run ...` prints every opcode to stderr before
/// it executes (ambient debug aid, named after the interpreter's own
/// `DEBUG_VM`/`RUFF_HASHMAP_PROFILE` environment switches).
fn trace_enabled() -> bool {
    std::env::var_os("RUFF_VM_TRACE").is_some()
}

#[derive(ClapParser)]
#[command(
    name = "ruff-vm",
    about = "A bytecode execution engine for a small dynamically-typed scripting language",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and run a compiled bytecode image
    Run {
        /// Path to the bytecode image
        path: PathBuf,

        /// Comma-separated engine options, e.g. `-o memoize`
        #[arg(short = 'o', long)]
        opt: Option<String>,
    },

    /// Start the interactive REPL
    Repl {
        /// Comma-separated engine options, e.g. `-o memoize`
        #[arg(short = 'o', long)]
        opt: Option<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run { path, opt } => run_file(path, parse_options(opt)),
        Commands::Repl { opt } => start_repl(parse_options(opt)),
    }
}

fn parse_options(opt: Option<String>) -> EngineOptions {
    EngineOptions::from_flag_list(opt.as_deref().unwrap_or(""))
}

fn run_file(path: PathBuf, options: EngineOptions) -> ExitCode {
    let image = match BytecodeImage::load_from_path(&path) {
        Ok(image) => image,
        Err(err) => {
            eprintln!("could not load bytecode image: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let mut engine = Engine::construct(image);
    engine.set_options(options);

    let mut tracer = |op: &Op| {
        eprintln!("{}", op);
        false
    };
    let outcome = if trace_enabled() { engine.run(Some(&mut tracer)) } else { engine.run(None) };

    match outcome {
        Ok(()) => {
            let result = engine.last_popped();
            if result != Value::Null {
                println!("{}", result);
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprint!("{}", err);
            ExitCode::FAILURE
        }
    }
}

fn start_repl(options: EngineOptions) -> ExitCode {
    match Repl::new(NoFrontend, options) {
        Ok(mut repl) => match repl.run() {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("repl error: {}", err);
                ExitCode::FAILURE
            }
        },
        Err(err) => {
            eprintln!("could not start repl: {}", err);
            ExitCode::FAILURE
        }
    }
}
