//! BX Compiler Library
//!
//! Compiles BX source to x86-64 System V assembly through a fixed pipeline:
//!
//! ```text
//! source -> tokens -> AST -> typed AST -> TAC -> CFG -> TAC -> assembly
//! ```
//!
//! Phases run sequentially and the first error aborts with a positioned
//! diagnostic. The optimizer (unreachable-code elimination, block
//! coalescing, jump threading, copy propagation, dead-copy elimination) is
//! applied between lowering and assembly when enabled.
//!
//! Compiled programs call two runtime symbols, `__bx_print_int` and
//! `__bx_print_bool`; link the emitted assembly against `libbx_runtime.a`
//! (the sibling `bx-runtime` crate) to produce a runnable binary.

pub mod asm;
pub mod ast;
pub mod cfg;
pub mod error;
pub mod lexer;
pub mod lower;
pub mod parser;
pub mod scope;
pub mod tac;
pub mod typecheck;
pub mod types;

pub use error::{CompileError, ErrorKind};
pub use lower::Context;
pub use parser::Parser;
pub use tac::{Instr, Opcode};
pub use types::Type;

use cfg::opt;
use serde_json::{Value, json};
use std::fs;
use std::path::Path;
use tracing::info;

/// Parse, type check, and lower a source string to TAC.
pub fn compile_to_tac(source: &str) -> Result<(Vec<Instr>, Context), CompileError> {
    info!("parsing");
    let mut program = Parser::new(source)?.parse()?;
    info!("type checking");
    typecheck::type_check(&mut program)?;
    info!("lowering to TAC");
    let (instr, ctx) = lower::lower_program(&program)?;
    info!(instructions = instr.len(), "lowering done");
    Ok((instr, ctx))
}

/// Compile a source string all the way to assembly text.
pub fn compile_to_asm(source: &str, enable_opt: bool) -> Result<String, CompileError> {
    let (mut instr, mut ctx) = compile_to_tac(source)?;
    if enable_opt {
        let before = instr.len();
        instr = opt::run_pipeline(&mut ctx, instr);
        info!(before, after = instr.len(), "optimization round done");
    }
    info!("assembling");
    asm::assemble(&ctx, &instr)
}

/// JSON dump of the IR: global initializers as raw instruction objects,
/// then one `{"proc": name, "body": [...]}` entry per procedure.
pub fn tac_json(ctx: &Context, instr: &[Instr]) -> Value {
    let mut entries: Vec<Value> = ctx.globals.iter().map(Instr::to_json).collect();
    for &(start, finish) in &ctx.procs {
        let name = instr[start].result.clone().unwrap_or_default();
        let body: Vec<Value> = instr[start + 1..=finish].iter().map(Instr::to_json).collect();
        entries.push(json!({"proc": name, "body": body}));
    }
    Value::Array(entries)
}

/// Compile a `.bx` file to `<stem>.s` and `<stem>.tac.json`.
///
/// The JSON dump reflects the IR actually assembled, i.e. the optimized
/// form when `enable_opt` is set.
pub fn compile_file(input: &Path, output_stem: &Path, enable_opt: bool) -> Result<(), String> {
    let source = fs::read_to_string(input)
        .map_err(|e| format!("failed to read '{}': {}", input.display(), e))?;

    let (mut instr, mut ctx) = compile_to_tac(&source).map_err(|e| e.to_string())?;
    if enable_opt {
        let before = instr.len();
        instr = opt::run_pipeline(&mut ctx, instr);
        info!(before, after = instr.len(), "optimization round done");
    }

    let json_path = output_stem.with_extension("tac.json");
    let json = serde_json::to_string_pretty(&tac_json(&ctx, &instr))
        .map_err(|e| format!("failed to serialize IR: {}", e))?;
    fs::write(&json_path, json)
        .map_err(|e| format!("failed to write '{}': {}", json_path.display(), e))?;
    info!(path = %json_path.display(), "wrote IR dump");

    info!("assembling");
    let text = asm::assemble(&ctx, &instr).map_err(|e| e.to_string())?;
    let asm_path = output_stem.with_extension("s");
    fs::write(&asm_path, text)
        .map_err(|e| format!("failed to write '{}': {}", asm_path.display(), e))?;
    info!(path = %asm_path.display(), "wrote assembly");

    Ok(())
}
