//! Recursive-descent parser producing one AST per function definition.
//!
//! The parser mirrors the classic chibicc structure: a precedence-climbing
//! set of helpers for expressions, a statement layer on top, and a
//! per-function symbol table that is reset whenever a new definition starts.
//! Every expression node leaves here with its type already stamped on.

use crate::error::{CompileError, CompileResult};
use crate::symbols::{LVar, SymbolTable};
use crate::tokenizer::{Token, TokenKind, describe_token, token_text};
use crate::ty::{Type, pointer_to};

/// Argument registers available for passing call arguments.
pub const MAX_ARGS: usize = 6;

/// Binary operators that survive parsing. `>` and `>=` are rewritten into
/// `Lt`/`Le` with swapped operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
  Add,
  Sub,
  Mul,
  Div,
  Eq,
  Ne,
  Lt,
  Le,
}

impl BinaryOp {
  pub fn is_comparison(self) -> bool {
    matches!(self, Self::Eq | Self::Ne | Self::Lt | Self::Le)
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
  Num {
    value: i64,
  },
  Var {
    /// Index into the owning function's `locals`.
    lvar: usize,
    offset: i64,
  },
  Binary {
    op: BinaryOp,
    lhs: Box<Node>,
    rhs: Box<Node>,
  },
  Assign {
    lhs: Box<Node>,
    rhs: Box<Node>,
  },
  Addr {
    operand: Box<Node>,
  },
  Deref {
    operand: Box<Node>,
  },
  FunCall {
    name: String,
    args: Vec<Node>,
  },
  Return {
    value: Box<Node>,
  },
  If {
    cond: Box<Node>,
    then: Box<Node>,
    els: Option<Box<Node>>,
  },
  While {
    cond: Box<Node>,
    body: Box<Node>,
  },
  For {
    init: Option<Box<Node>>,
    cond: Option<Box<Node>>,
    inc: Option<Box<Node>>,
    body: Box<Node>,
  },
  Block {
    body: Vec<Node>,
  },
}

/// AST node: a kind, the resolved type for expressions, and the byte offset
/// of the token that introduced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
  pub kind: NodeKind,
  pub ty: Option<Type>,
  pub loc: usize,
}

impl Node {
  fn new(kind: NodeKind, ty: Option<Type>, loc: usize) -> Self {
    Self { kind, ty, loc }
  }

  pub fn number(value: i64, loc: usize) -> Self {
    Self::new(NodeKind::Num { value }, Some(Type::int()), loc)
  }

  pub fn var(lvar: usize, var: &LVar, loc: usize) -> Self {
    Self::new(
      NodeKind::Var {
        lvar,
        offset: var.offset,
      },
      Some(var.ty.clone()),
      loc,
    )
  }

  /// Arithmetic takes the left operand's type; comparisons yield `Int`.
  pub fn binary(op: BinaryOp, lhs: Node, rhs: Node, loc: usize) -> Self {
    let ty = if op.is_comparison() {
      Type::int()
    } else {
      lhs.ty.clone().unwrap_or(Type::Int)
    };
    Self::new(
      NodeKind::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
      },
      Some(ty),
      loc,
    )
  }

  pub fn assign(lhs: Node, rhs: Node, loc: usize) -> Self {
    let ty = lhs.ty.clone();
    Self::new(
      NodeKind::Assign {
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
      },
      ty,
      loc,
    )
  }

  pub fn addr(operand: Node, loc: usize) -> Self {
    let ty = pointer_to(operand.ty.clone().unwrap_or(Type::Int));
    Self::new(
      NodeKind::Addr {
        operand: Box::new(operand),
      },
      Some(ty),
      loc,
    )
  }

  /// Dereferencing a plain integer is allowed and yields an integer, since
  /// variables are always `Int` yet may hold addresses.
  pub fn deref(operand: Node, loc: usize) -> Self {
    let ty = operand
      .ty
      .as_ref()
      .and_then(Type::base)
      .cloned()
      .unwrap_or(Type::Int);
    Self::new(
      NodeKind::Deref {
        operand: Box::new(operand),
      },
      Some(ty),
      loc,
    )
  }

  pub fn funcall(name: String, args: Vec<Node>, loc: usize) -> Self {
    Self::new(NodeKind::FunCall { name, args }, Some(Type::int()), loc)
  }

  pub fn block(body: Vec<Node>, loc: usize) -> Self {
    Self::new(NodeKind::Block { body }, None, loc)
  }

  fn stmt(kind: NodeKind, loc: usize) -> Self {
    Self::new(kind, None, loc)
  }

  fn with_type(mut self, ty: Type) -> Self {
    self.ty = Some(ty);
    self
  }

  pub fn is_pointer(&self) -> bool {
    self.ty.as_ref().is_some_and(Type::is_pointer)
  }

  fn is_lvalue(&self) -> bool {
    matches!(self.kind, NodeKind::Var { .. } | NodeKind::Deref { .. })
  }
}

/// A parsed function definition. Parameters are the leading `param_count`
/// entries of `locals`.
#[derive(Debug, Clone)]
pub struct Function {
  pub name: String,
  pub ty: Type,
  pub body: Vec<Node>,
  pub locals: Vec<LVar>,
  pub param_count: usize,
  /// Bytes reserved below `%rbp`, always a multiple of 16.
  pub stack_size: i64,
  pub loc: usize,
}

impl Function {
  pub fn params(&self) -> &[LVar] {
    &self.locals[..self.param_count]
  }
}

/// Round `n` up to the nearest multiple of `align`.
pub fn align_to(n: i64, align: i64) -> i64 {
  (n + align - 1) / align * align
}

/// Parse a whole translation unit into its function definitions.
pub fn parse(tokens: &[Token], source: &str) -> CompileResult<Vec<Function>> {
  let mut parser = Parser::new(tokens, source);
  parser.program()
}

struct Parser<'a> {
  stream: TokenStream<'a>,
  locals: SymbolTable,
}

impl<'a> Parser<'a> {
  fn new(tokens: &'a [Token], source: &'a str) -> Self {
    Self {
      stream: TokenStream::new(tokens, source),
      locals: SymbolTable::new(),
    }
  }

  fn error(&self, loc: usize, message: impl Into<String>) -> CompileError {
    CompileError::parse(self.stream.source, loc, message)
  }

  // program = function*
  fn program(&mut self) -> CompileResult<Vec<Function>> {
    let mut functions: Vec<Function> = Vec::new();
    while !self.stream.is_eof() {
      let func = self.function()?;
      if functions.iter().any(|f| f.name == func.name) {
        return Err(self.error(func.loc, format!("redefinition of '{}'", func.name)));
      }
      functions.push(func);
    }
    Ok(functions)
  }

  // function = declarator "{" compound_stmt
  fn function(&mut self) -> CompileResult<Function> {
    self.locals = SymbolTable::new();

    let (name, ty, loc) = self.declarator()?;
    let param_count = ty.params().len();
    self.stream.skip("{")?;
    let body = self.compound_stmt()?;

    // The frame size is only known once every local has been seen.
    let locals = std::mem::take(&mut self.locals);
    let stack_size = align_to(locals.max_offset(), 16);

    Ok(Function {
      name,
      ty,
      body,
      locals: locals.into_locals(),
      param_count,
      stack_size,
      loc,
    })
  }

  // declarator = ident "(" (ident ("," ident)*)? ")"
  fn declarator(&mut self) -> CompileResult<(String, Type, usize)> {
    let (name, loc) = self.stream.get_ident()?;
    self.stream.skip("(")?;

    let mut params = Vec::new();
    if !self.stream.equal(")") {
      loop {
        let (param, param_loc) = self.stream.get_ident()?;
        if params.len() == MAX_ARGS {
          return Err(self.error(
            param_loc,
            format!("too many parameters: at most {MAX_ARGS} are supported"),
          ));
        }
        if self.locals.find(param).is_some() {
          return Err(self.error(param_loc, format!("duplicate parameter '{param}'")));
        }
        self.locals.declare(param, Type::int());
        params.push(Type::int());
        if !self.stream.equal(",") {
          break;
        }
      }
      self.stream.skip(")")?;
    }

    Ok((name.to_string(), Type::func(Type::int(), params), loc))
  }

  // compound_stmt = stmt* "}"
  fn compound_stmt(&mut self) -> CompileResult<Vec<Node>> {
    let mut body = Vec::new();
    while !self.stream.equal("}") {
      if self.stream.is_eof() {
        let loc = self.stream.loc();
        return Err(self.error(loc, "expected \"}\", but got \"EOF\""));
      }
      body.push(self.stmt()?);
    }
    Ok(body)
  }

  fn stmt(&mut self) -> CompileResult<Node> {
    let loc = self.stream.loc();

    if self.stream.consume_kind(TokenKind::Return) {
      let value = self.expr()?;
      self.stream.skip(";")?;
      return Ok(Node::stmt(
        NodeKind::Return {
          value: Box::new(value),
        },
        loc,
      ));
    }

    if self.stream.consume_kind(TokenKind::If) {
      self.stream.skip("(")?;
      let cond = self.expr()?;
      self.stream.skip(")")?;
      let then = self.stmt()?;
      let els = if self.stream.consume_kind(TokenKind::Else) {
        Some(Box::new(self.stmt()?))
      } else {
        None
      };
      return Ok(Node::stmt(
        NodeKind::If {
          cond: Box::new(cond),
          then: Box::new(then),
          els,
        },
        loc,
      ));
    }

    if self.stream.consume_kind(TokenKind::While) {
      self.stream.skip("(")?;
      let cond = self.expr()?;
      self.stream.skip(")")?;
      let body = self.stmt()?;
      return Ok(Node::stmt(
        NodeKind::While {
          cond: Box::new(cond),
          body: Box::new(body),
        },
        loc,
      ));
    }

    if self.stream.consume_kind(TokenKind::For) {
      self.stream.skip("(")?;
      let init = self.opt_expr(";")?;
      self.stream.skip(";")?;
      let cond = self.opt_expr(";")?;
      self.stream.skip(";")?;
      let inc = self.opt_expr(")")?;
      self.stream.skip(")")?;
      let body = self.stmt()?;
      return Ok(Node::stmt(
        NodeKind::For {
          init,
          cond,
          inc,
          body: Box::new(body),
        },
        loc,
      ));
    }

    if self.stream.equal("{") {
      let body = self.compound_stmt()?;
      return Ok(Node::block(body, loc));
    }

    // A lone `;` is kept as an empty block so it can still be a branch target.
    if self.stream.equal(";") {
      return Ok(Node::block(Vec::new(), loc));
    }

    let node = self.expr()?;
    self.stream.skip(";")?;
    Ok(node)
  }

  /// An expression unless the next token is `terminator`.
  fn opt_expr(&mut self, terminator: &str) -> CompileResult<Option<Box<Node>>> {
    if self.stream.peek_is(terminator) {
      return Ok(None);
    }
    Ok(Some(Box::new(self.expr()?)))
  }

  fn expr(&mut self) -> CompileResult<Node> {
    self.assign()
  }

  // assign = equality ("=" assign)?
  fn assign(&mut self) -> CompileResult<Node> {
    let node = self.equality()?;

    let loc = self.stream.loc();
    if self.stream.equal("=") {
      if !node.is_lvalue() {
        return Err(self.error(node.loc, "not an lvalue"));
      }
      let rhs = self.assign()?;
      return Ok(Node::assign(node, rhs, loc));
    }

    Ok(node)
  }

  fn equality(&mut self) -> CompileResult<Node> {
    let mut node = self.relational()?;

    loop {
      let loc = self.stream.loc();
      let op = match self.stream.peek_punctuator() {
        Some("==") => BinaryOp::Eq,
        Some("!=") => BinaryOp::Ne,
        _ => break,
      };

      self.stream.advance();
      let rhs = self.relational()?;
      node = Node::binary(op, node, rhs, loc);
    }

    Ok(node)
  }

  fn relational(&mut self) -> CompileResult<Node> {
    let mut node = self.add()?;

    loop {
      let loc = self.stream.loc();
      let (op, swapped) = match self.stream.peek_punctuator() {
        Some("<") => (BinaryOp::Lt, false),
        Some("<=") => (BinaryOp::Le, false),
        Some(">") => (BinaryOp::Lt, true),
        Some(">=") => (BinaryOp::Le, true),
        _ => break,
      };

      self.stream.advance();
      let rhs = self.add()?;
      node = if swapped {
        Node::binary(op, rhs, node, loc)
      } else {
        Node::binary(op, node, rhs, loc)
      };
    }

    Ok(node)
  }

  fn add(&mut self) -> CompileResult<Node> {
    let mut node = self.mul()?;

    loop {
      let loc = self.stream.loc();
      match self.stream.peek_punctuator() {
        Some("+") => {
          self.stream.advance();
          let rhs = self.mul()?;
          node = self.new_add(node, rhs, loc)?;
        }
        Some("-") => {
          self.stream.advance();
          let rhs = self.mul()?;
          node = self.new_sub(node, rhs, loc)?;
        }
        _ => break,
      }
    }

    Ok(node)
  }

  /// `ptr + n` advances by `n` elements, so the integer side is scaled by
  /// the pointee size.
  fn new_add(&self, lhs: Node, rhs: Node, loc: usize) -> CompileResult<Node> {
    match (lhs.is_pointer(), rhs.is_pointer()) {
      (false, false) => Ok(Node::binary(BinaryOp::Add, lhs, rhs, loc)),
      (true, true) => Err(self.error(loc, "invalid operands: pointer + pointer")),
      (false, true) => Ok(scaled(BinaryOp::Add, rhs, lhs, loc)),
      (true, false) => Ok(scaled(BinaryOp::Add, lhs, rhs, loc)),
    }
  }

  /// `ptr - n` steps back by elements; `ptr - ptr` yields an element count.
  fn new_sub(&self, lhs: Node, rhs: Node, loc: usize) -> CompileResult<Node> {
    match (lhs.is_pointer(), rhs.is_pointer()) {
      (false, false) => Ok(Node::binary(BinaryOp::Sub, lhs, rhs, loc)),
      (true, false) => Ok(scaled(BinaryOp::Sub, lhs, rhs, loc)),
      (true, true) => {
        let size = pointee_size(&lhs);
        let bytes = Node::binary(BinaryOp::Sub, lhs, rhs, loc).with_type(Type::int());
        Ok(Node::binary(
          BinaryOp::Div,
          bytes,
          Node::number(size, loc),
          loc,
        ))
      }
      (false, true) => Err(self.error(loc, "invalid operands: integer - pointer")),
    }
  }

  fn mul(&mut self) -> CompileResult<Node> {
    let mut node = self.unary()?;

    loop {
      let loc = self.stream.loc();
      let op = match self.stream.peek_punctuator() {
        Some("*") => BinaryOp::Mul,
        Some("/") => BinaryOp::Div,
        _ => break,
      };

      self.stream.advance();
      let rhs = self.unary()?;
      node = Node::binary(op, node, rhs, loc);
    }

    Ok(node)
  }

  // unary = ("+" | "-" | "*" | "&") unary | primary
  fn unary(&mut self) -> CompileResult<Node> {
    let loc = self.stream.loc();

    if self.stream.equal("+") {
      return self.unary();
    }

    if self.stream.equal("-") {
      let operand = self.unary()?;
      return Ok(Node::binary(
        BinaryOp::Sub,
        Node::number(0, loc),
        operand,
        loc,
      ));
    }

    if self.stream.equal("*") {
      let operand = self.unary()?;
      return Ok(Node::deref(operand, loc));
    }

    if self.stream.equal("&") {
      let operand = self.unary()?;
      if !operand.is_lvalue() {
        return Err(self.error(operand.loc, "not an lvalue"));
      }
      return Ok(Node::addr(operand, loc));
    }

    self.primary()
  }

  // primary = "(" expr ")" | ident ("(" (expr ("," expr)*)? ")")? | num
  fn primary(&mut self) -> CompileResult<Node> {
    if self.stream.equal("(") {
      let node = self.expr()?;
      self.stream.skip(")")?;
      return Ok(node);
    }

    if self.stream.peek_kind() == Some(TokenKind::Ident) {
      let (name, loc) = self.stream.get_ident()?;

      if self.stream.equal("(") {
        let args = self.call_args()?;
        return Ok(Node::funcall(name.to_string(), args, loc));
      }

      let idx = self.locals.find_or_declare(name);
      return Ok(Node::var(idx, self.locals.get(idx), loc));
    }

    if self.stream.peek_kind() == Some(TokenKind::Num) {
      let (value, loc) = self.stream.get_number()?;
      return Ok(Node::number(value, loc));
    }

    let loc = self.stream.loc();
    let got = describe_token(self.stream.peek(), self.stream.source);
    Err(self.error(loc, format!("expected an expression, but got \"{got}\"")))
  }

  fn call_args(&mut self) -> CompileResult<Vec<Node>> {
    let mut args = Vec::new();
    if self.stream.equal(")") {
      return Ok(args);
    }

    loop {
      if args.len() == MAX_ARGS {
        let loc = self.stream.loc();
        return Err(self.error(
          loc,
          format!("too many arguments: at most {MAX_ARGS} are supported"),
        ));
      }
      args.push(self.expr()?);
      if !self.stream.equal(",") {
        break;
      }
    }
    self.stream.skip(")")?;
    Ok(args)
  }
}

fn pointee_size(node: &Node) -> i64 {
  node
    .ty
    .as_ref()
    .and_then(Type::base)
    .map_or(1, Type::size)
}

fn scaled(op: BinaryOp, ptr: Node, index: Node, loc: usize) -> Node {
  let size = pointee_size(&ptr);
  let index = Node::binary(BinaryOp::Mul, index, Node::number(size, loc), loc);
  Node::binary(op, ptr, index, loc)
}

/// Lightweight read cursor over the token slice.
struct TokenStream<'a> {
  tokens: &'a [Token],
  source: &'a str,
  pos: usize,
}

impl<'a> TokenStream<'a> {
  fn new(tokens: &'a [Token], source: &'a str) -> Self {
    Self {
      tokens,
      source,
      pos: 0,
    }
  }

  fn peek(&self) -> Option<&'a Token> {
    self.tokens.get(self.pos)
  }

  fn peek_kind(&self) -> Option<TokenKind> {
    self.peek().map(|token| token.kind)
  }

  fn peek_punctuator(&self) -> Option<&'a str> {
    self
      .peek()
      .filter(|token| token.kind == TokenKind::Punctuator)
      .map(|token| token_text(token, self.source))
  }

  fn peek_is(&self, op: &str) -> bool {
    self.peek_punctuator() == Some(op)
  }

  /// Byte offset of the current token, or the end of input.
  fn loc(&self) -> usize {
    self.peek().map_or(self.source.len(), |token| token.loc)
  }

  fn advance(&mut self) {
    if self.pos < self.tokens.len() {
      self.pos += 1;
    }
  }

  /// Consume the current token if it matches the provided punctuator.
  fn equal(&mut self, op: &str) -> bool {
    if self.peek_is(op) {
      self.pos += 1;
      return true;
    }
    false
  }

  fn consume_kind(&mut self, kind: TokenKind) -> bool {
    if self.peek_kind() == Some(kind) {
      self.pos += 1;
      return true;
    }
    false
  }

  fn skip(&mut self, s: &str) -> CompileResult<()> {
    if self.equal(s) {
      Ok(())
    } else {
      let got = describe_token(self.peek(), self.source);
      Err(CompileError::parse(
        self.source,
        self.loc(),
        format!("expected \"{s}\", but got \"{got}\""),
      ))
    }
  }

  /// Parse the current token as an integer literal returning its value and location.
  fn get_number(&mut self) -> CompileResult<(i64, usize)> {
    if let Some(token) = self.peek()
      && token.kind == TokenKind::Num
    {
      let value = token.value.ok_or_else(|| {
        CompileError::internal(format!("numeric token at byte {} has no value", token.loc))
      })?;
      self.pos += 1;
      return Ok((value, token.loc));
    }

    let got = describe_token(self.peek(), self.source);
    Err(CompileError::parse(
      self.source,
      self.loc(),
      format!("expected a number, but got \"{got}\""),
    ))
  }

  /// Parse the current token as an identifier.
  fn get_ident(&mut self) -> CompileResult<(&'a str, usize)> {
    if let Some(token) = self.peek()
      && token.kind == TokenKind::Ident
    {
      self.pos += 1;
      return Ok((token_text(token, self.source), token.loc));
    }

    let got = describe_token(self.peek(), self.source);
    Err(CompileError::parse(
      self.source,
      self.loc(),
      format!("expected an identifier, but got \"{got}\""),
    ))
  }

  fn is_eof(&self) -> bool {
    matches!(self.peek_kind(), Some(TokenKind::Eof) | None)
  }
}
