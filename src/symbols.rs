//! Per-function symbol table.
//!
//! The language has no declaration syntax: the first use of a name declares
//! it, so every lookup is paired with a conditional insert. Slots are 8 bytes
//! wide and handed out in declaration order.

use crate::ty::Type;

pub const SLOT_SIZE: i64 = 8;

/// A local variable or parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LVar {
  pub name: String,
  pub ty: Type,
  /// Distance below `%rbp`, as a positive byte count.
  pub offset: i64,
}

#[derive(Debug, Default)]
pub struct SymbolTable {
  locals: Vec<LVar>,
}

impl SymbolTable {
  pub fn new() -> Self {
    Self::default()
  }

  /// Linear scan by name; first match wins.
  pub fn find(&self, name: &str) -> Option<usize> {
    self.locals.iter().position(|var| var.name == name)
  }

  /// Append a new slot after the deepest existing one.
  pub fn declare(&mut self, name: &str, ty: Type) -> usize {
    let offset = self.max_offset() + SLOT_SIZE;
    self.locals.push(LVar {
      name: name.to_string(),
      ty,
      offset,
    });
    self.locals.len() - 1
  }

  pub fn find_or_declare(&mut self, name: &str) -> usize {
    match self.find(name) {
      Some(idx) => idx,
      None => self.declare(name, Type::int()),
    }
  }

  pub fn get(&self, idx: usize) -> &LVar {
    &self.locals[idx]
  }

  pub fn len(&self) -> usize {
    self.locals.len()
  }

  pub fn is_empty(&self) -> bool {
    self.locals.is_empty()
  }

  pub fn max_offset(&self) -> i64 {
    self.locals.last().map_or(0, |var| var.offset)
  }

  pub fn into_locals(self) -> Vec<LVar> {
    self.locals
  }
}
