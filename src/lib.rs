//! Crate root: wires together the compilation pipeline.
//!
//! - `tokenizer` performs lexical analysis and produces a flat token stream.
//! - `ty` holds the type descriptors stamped onto declarations and nodes.
//! - `symbols` is the per-function table of locals and their frame slots.
//! - `parser` owns all syntactic knowledge and returns one AST per function.
//! - `codegen` lowers the parsed functions into x86-64 AT&T assembly.
//! - `error` centralises reporting utilities shared by the other modules.

pub mod codegen;
pub mod error;
pub mod parser;
pub mod symbols;
pub mod tokenizer;
pub mod ty;

pub use codegen::Options;
pub use error::{CompileError, CompileResult};

/// Compile a source string into AT&T assembly with default options.
pub fn generate_assembly(source: &str) -> CompileResult<String> {
  compile(source, Options::default())
}

/// Lex, parse, then generate. The first error aborts the whole run.
pub fn compile(source: &str, options: Options) -> CompileResult<String> {
  let tokens = tokenizer::tokenize(source)?;
  let functions = parser::parse(&tokens, source)?;
  codegen::generate(&functions, options)
}
