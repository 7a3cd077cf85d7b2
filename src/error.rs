//! Shared error utilities used across the compilation pipeline.
//!
//! User-facing diagnostics point at the offending byte with a caret placed
//! under the source line that contains it. Generator invariant violations
//! get their own variant so they never read like a mistake in the input.

use snafu::Snafu;

pub type CompileResult<T> = Result<T, CompileError>;

#[derive(Debug, Snafu)]
pub enum CompileError {
  /// A character the lexer cannot start a token with.
  #[snafu(display("{source_line}\n{marker} {message}"))]
  Lex {
    loc: usize,
    source_line: String,
    marker: String,
    message: String,
  },
  /// Unexpected token, missing punctuation, or a malformed construct.
  #[snafu(display("{source_line}\n{marker} {message}"))]
  Parse {
    loc: usize,
    source_line: String,
    marker: String,
    message: String,
  },
  #[snafu(display("internal compiler error: {message}"))]
  Internal { message: String },
}

impl CompileError {
  /// Construct a lexing error anchored at a byte offset in the source.
  pub fn lex(source: &str, loc: usize, message: impl Into<String>) -> Self {
    let (source_line, marker) = locate(source, loc);
    Self::Lex {
      loc,
      source_line,
      marker,
      message: message.into(),
    }
  }

  /// Construct a parse error anchored at a byte offset in the source.
  pub fn parse(source: &str, loc: usize, message: impl Into<String>) -> Self {
    let (source_line, marker) = locate(source, loc);
    Self::Parse {
      loc,
      source_line,
      marker,
      message: message.into(),
    }
  }

  pub fn internal(message: impl Into<String>) -> Self {
    Self::Internal {
      message: message.into(),
    }
  }

  /// Byte offset of a user-facing error, `None` for internal ones.
  pub fn loc(&self) -> Option<usize> {
    match self {
      Self::Lex { loc, .. } | Self::Parse { loc, .. } => Some(*loc),
      Self::Internal { .. } => None,
    }
  }

  pub fn message(&self) -> &str {
    match self {
      Self::Lex { message, .. } | Self::Parse { message, .. } | Self::Internal { message } => message,
    }
  }

  pub fn is_internal(&self) -> bool {
    matches!(self, Self::Internal { .. })
  }
}

/// Extract the line holding `loc` and a caret marker aligned under it.
fn locate(source: &str, loc: usize) -> (String, String) {
  let mut safe_loc = loc.min(source.len());
  while !source.is_char_boundary(safe_loc) {
    safe_loc -= 1;
  }
  let line_start = source[..safe_loc].rfind('\n').map_or(0, |pos| pos + 1);
  let line_end = source[safe_loc..]
    .find('\n')
    .map_or(source.len(), |pos| safe_loc + pos);
  let column = source[line_start..safe_loc].chars().count();
  let marker = format!("{}^", " ".repeat(column));
  (source[line_start..line_end].to_string(), marker)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn caret_sits_under_offending_byte() {
    let err = CompileError::parse("main() { return 1 }", 18, "expected \";\"");
    assert_eq!(
      err.to_string(),
      "main() { return 1 }\n                  ^ expected \";\""
    );
  }

  #[test]
  fn only_the_offending_line_is_echoed() {
    let src = "main() {\n  x = $;\n}";
    let err = CompileError::lex(src, 15, "invalid token: '$'");
    assert_eq!(err.to_string(), "  x = $;\n      ^ invalid token: '$'");
    assert_eq!(err.loc(), Some(15));
  }

  #[test]
  fn end_of_input_points_past_last_char() {
    let err = CompileError::parse("main(", 5, "expected \")\", but got \"EOF\"");
    assert!(err.to_string().starts_with("main(\n     ^ "));
  }

  #[test]
  fn internal_errors_are_distinguishable() {
    let err = CompileError::internal("stack depth 1 at end of main");
    assert!(err.is_internal());
    assert_eq!(err.loc(), None);
    assert_eq!(
      err.to_string(),
      "internal compiler error: stack depth 1 at end of main"
    );
  }
}
