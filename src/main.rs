use clap::Parser;
use colored::Colorize;
use std::io::{self, Write};
use std::process;

use minicc::{CompileError, Options, compile};

#[derive(Parser, Debug)]
#[command(name = "minicc")]
#[command(about = "Compile a tiny C-like program to x86-64 assembly")]
struct Args {
  /// Program source text.
  source: String,
  /// Omit the nesting comments interleaved with the instructions.
  #[arg(long = "no-annotate", action = clap::ArgAction::SetTrue)]
  no_annotate: bool,
}

/// Header on its own line so the echoed source and its caret stay aligned.
fn format_diagnostic(err: &CompileError) -> String {
  let stage = match err {
    CompileError::Lex { .. } => "lex error",
    CompileError::Parse { .. } => "parse error",
    CompileError::Internal { .. } => return err.to_string().red().bold().to_string(),
  };
  format!("{}: {stage}\n{err}", "error".red().bold())
}

fn main() {
  let args = Args::parse();
  let options = Options {
    annotate: !args.no_annotate,
  };

  match compile(&args.source, options) {
    Ok(asm) => {
      if let Err(err) = io::stdout().write_all(asm.as_bytes()) {
        eprintln!("{}: failed to write stdout: {err}", "error".red().bold());
        process::exit(1);
      }
    }
    Err(err) => {
      eprintln!("{}", format_diagnostic(&err));
      process::exit(if err.is_internal() { 2 } else { 1 });
    }
  }
}
