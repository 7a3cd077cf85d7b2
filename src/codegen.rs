//! Code generation: lower the parsed functions into AT&T x86-64 assembly.
//!
//! Every expression leaves its value in `%rax`. Operands that must survive
//! the evaluation of a sibling are pushed onto the machine stack, and the
//! generator counts those pushes so it can prove the stack is balanced at
//! each statement boundary. Locals live in the frame below `%rbp`.

use crate::error::{CompileError, CompileResult};
use crate::parser::{BinaryOp, Function, MAX_ARGS, Node, NodeKind};

const ARG_REGS: [&str; MAX_ARGS] = ["%rdi", "%rsi", "%rdx", "%rcx", "%r8", "%r9"];

/// Generator settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
  /// Interleave `# { ... # } ...` nesting comments with the instructions.
  pub annotate: bool,
}

impl Default for Options {
  fn default() -> Self {
    Self { annotate: true }
  }
}

/// Hands out label numbers. Starts at 1 and never repeats within one
/// compilation, even across functions.
#[derive(Debug)]
pub struct LabelCounter {
  next: usize,
}

impl LabelCounter {
  pub fn new() -> Self {
    Self { next: 1 }
  }

  pub fn fresh(&mut self) -> usize {
    let id = self.next;
    self.next += 1;
    id
  }
}

impl Default for LabelCounter {
  fn default() -> Self {
    Self::new()
  }
}

/// Operand-stack depth observed after a top-level statement
/// (`statement: Some(i)`) or at the end of a function body (`None`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepthCheckpoint {
  pub function: String,
  pub statement: Option<usize>,
  pub depth: usize,
}

pub struct Codegen {
  buffer: String,
  options: Options,
  labels: LabelCounter,
  depth: usize,
  checkpoints: Vec<DepthCheckpoint>,
}

impl Codegen {
  pub fn new(options: Options) -> Self {
    Self {
      buffer: String::new(),
      options,
      labels: LabelCounter::new(),
      depth: 0,
      checkpoints: Vec::new(),
    }
  }

  /// Emit the whole translation unit.
  pub fn generate(&mut self, functions: &[Function]) -> CompileResult<String> {
    self.emit(".att_syntax prefix");
    for func in functions {
      self.emit_function(func)?;
    }
    Ok(std::mem::take(&mut self.buffer))
  }

  pub fn checkpoints(&self) -> &[DepthCheckpoint] {
    &self.checkpoints
  }

  fn emit(&mut self, line: &str) {
    self.buffer.push_str(line);
    self.buffer.push('\n');
  }

  fn comment(&mut self, text: &str) {
    if self.options.annotate {
      self.emit(&format!("# {text}"));
    }
  }

  fn push(&mut self) {
    self.depth += 1;
    let depth = self.depth;
    self.emit("  push %rax");
    self.comment(&format!("depth {depth}"));
  }

  fn pop(&mut self, reg: &str) -> CompileResult<()> {
    self.depth = self
      .depth
      .checked_sub(1)
      .ok_or_else(|| CompileError::internal(format!("pop into {reg} with an empty operand stack")))?;
    let depth = self.depth;
    self.emit(&format!("  pop {reg}"));
    self.comment(&format!("depth {depth}"));
    Ok(())
  }

  fn emit_function(&mut self, func: &Function) -> CompileResult<()> {
    if func.param_count > MAX_ARGS {
      return Err(CompileError::internal(format!(
        "function {} has {} parameters; at most {MAX_ARGS} fit in registers",
        func.name, func.param_count
      )));
    }

    self.emit(&format!(".global {}", func.name));
    self.emit(&format!("{}:", func.name));

    self.comment("{ prologue");
    self.emit("  push %rbp");
    self.emit("  mov %rsp, %rbp");
    self.emit(&format!("  sub ${}, %rsp", func.stack_size));
    for (reg, param) in ARG_REGS.iter().zip(func.params()) {
      self.emit(&format!("  mov {reg}, -{}(%rbp)", param.offset));
    }
    self.comment("} prologue");

    for (idx, stmt) in func.body.iter().enumerate() {
      self.emit_stmt(stmt, func)?;
      self.checkpoints.push(DepthCheckpoint {
        function: func.name.clone(),
        statement: Some(idx),
        depth: self.depth,
      });
    }

    self.comment("{ epilogue");
    self.emit(&format!(".L.return.{}:", func.name));
    self.emit("  mov %rbp, %rsp");
    self.emit("  pop %rbp");
    self.emit("  ret");
    self.comment("} epilogue");

    self.checkpoints.push(DepthCheckpoint {
      function: func.name.clone(),
      statement: None,
      depth: self.depth,
    });
    if self.depth != 0 {
      return Err(CompileError::internal(format!(
        "operand stack depth is {} at the end of {}",
        self.depth, func.name
      )));
    }
    Ok(())
  }

  fn emit_stmt(&mut self, node: &Node, func: &Function) -> CompileResult<()> {
    match &node.kind {
      NodeKind::Return { value } => {
        self.comment("{ return");
        self.emit_expr(value, func)?;
        self.emit(&format!("  jmp .L.return.{}", func.name));
        self.comment("} return");
      }
      NodeKind::If { cond, then, els } => {
        let c = self.labels.fresh();
        self.comment("{ if");
        self.emit_expr(cond, func)?;
        self.emit("  cmp $0, %rax");
        match els {
          Some(els) => {
            self.emit(&format!("  je .Lelse{c}"));
            self.emit_stmt(then, func)?;
            self.emit(&format!("  jmp .Lend{c}"));
            self.emit(&format!(".Lelse{c}:"));
            self.emit_stmt(els, func)?;
          }
          None => {
            self.emit(&format!("  je .Lend{c}"));
            self.emit_stmt(then, func)?;
          }
        }
        self.emit(&format!(".Lend{c}:"));
        self.comment("} if");
      }
      NodeKind::While { cond, body } => {
        let c = self.labels.fresh();
        self.comment("{ while");
        self.emit(&format!(".Lbegin{c}:"));
        self.emit_expr(cond, func)?;
        self.emit("  cmp $0, %rax");
        self.emit(&format!("  je .Lend{c}"));
        self.emit_stmt(body, func)?;
        self.emit(&format!("  jmp .Lbegin{c}"));
        self.emit(&format!(".Lend{c}:"));
        self.comment("} while");
      }
      NodeKind::For {
        init,
        cond,
        inc,
        body,
      } => {
        let c = self.labels.fresh();
        self.comment("{ for");
        if let Some(init) = init {
          self.emit_expr(init, func)?;
        }
        self.emit(&format!(".Lbegin{c}:"));
        if let Some(cond) = cond {
          self.emit_expr(cond, func)?;
          self.emit("  cmp $0, %rax");
          self.emit(&format!("  je .Lend{c}"));
        }
        self.emit_stmt(body, func)?;
        if let Some(inc) = inc {
          self.emit_expr(inc, func)?;
        }
        self.emit(&format!("  jmp .Lbegin{c}"));
        self.emit(&format!(".Lend{c}:"));
        self.comment("} for");
      }
      NodeKind::Block { body } => {
        self.comment("{ block");
        for stmt in body {
          self.emit_stmt(stmt, func)?;
        }
        self.comment("} block");
      }
      _ => self.emit_expr(node, func)?,
    }
    Ok(())
  }

  /// Evaluate an expression into `%rax`.
  fn emit_expr(&mut self, node: &Node, func: &Function) -> CompileResult<()> {
    match &node.kind {
      NodeKind::Num { value } => {
        self.emit(&format!("  mov ${value}, %rax"));
      }
      NodeKind::Var { lvar, .. } => {
        let name = &func.locals[*lvar].name;
        self.comment(&format!("{{ var {name}"));
        self.emit_addr(node, func)?;
        self.emit("  mov (%rax), %rax");
        self.comment(&format!("}} var {name}"));
      }
      NodeKind::Deref { operand } => {
        self.emit_expr(operand, func)?;
        self.emit("  mov (%rax), %rax");
      }
      NodeKind::Addr { operand } => {
        self.emit_addr(operand, func)?;
      }
      NodeKind::Assign { lhs, rhs } => {
        self.comment("{ assign");
        self.emit_addr(lhs, func)?;
        self.push();
        self.emit_expr(rhs, func)?;
        self.pop("%rdi")?;
        self.emit("  mov %rax, (%rdi)");
        self.comment("} assign");
      }
      NodeKind::FunCall { name, args } => self.emit_call(name, args, func)?,
      NodeKind::Binary { op, lhs, rhs } => {
        self.emit_expr(lhs, func)?;
        self.push();
        self.emit_expr(rhs, func)?;
        self.emit("  mov %rax, %rdi");
        self.pop("%rax")?;
        self.emit_binary(*op);
      }
      other => {
        return Err(CompileError::internal(format!(
          "statement node in expression position: {other:?}"
        )));
      }
    }
    Ok(())
  }

  /// Load the address of an lvalue into `%rax`.
  fn emit_addr(&mut self, node: &Node, func: &Function) -> CompileResult<()> {
    match &node.kind {
      NodeKind::Var { offset, .. } => {
        self.emit(&format!("  lea -{offset}(%rbp), %rax"));
        Ok(())
      }
      NodeKind::Deref { operand } => self.emit_expr(operand, func),
      other => Err(CompileError::internal(format!("not an lvalue: {other:?}"))),
    }
  }

  fn emit_call(&mut self, name: &str, args: &[Node], func: &Function) -> CompileResult<()> {
    if args.len() > MAX_ARGS {
      return Err(CompileError::internal(format!(
        "call to {name} passes {} arguments; at most {MAX_ARGS} fit in registers",
        args.len()
      )));
    }

    self.comment(&format!("{{ call {name}"));
    for arg in args {
      self.emit_expr(arg, func)?;
      self.push();
    }
    for reg in ARG_REGS[..args.len()].iter().rev() {
      self.pop(reg)?;
    }

    // `%rsp` must be 16-byte aligned at the call; the frame itself is, so
    // only the values still pushed by enclosing expressions matter.
    let misaligned = self.depth % 2 == 1;
    if misaligned {
      self.emit("  sub $8, %rsp");
    }
    self.emit("  mov $0, %rax");
    self.emit(&format!("  call {name}"));
    if misaligned {
      self.emit("  add $8, %rsp");
    }
    self.comment(&format!("}} call {name}"));
    Ok(())
  }

  /// Combine `%rax` (lhs) and `%rdi` (rhs) into `%rax`.
  fn emit_binary(&mut self, op: BinaryOp) {
    let set = match op {
      BinaryOp::Add => "add %rdi, %rax",
      BinaryOp::Sub => "sub %rdi, %rax",
      BinaryOp::Mul => "imul %rdi, %rax",
      BinaryOp::Div => {
        self.emit("  cqo");
        "idiv %rdi"
      }
      BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le => {
        let flag = match op {
          BinaryOp::Eq => "sete",
          BinaryOp::Ne => "setne",
          BinaryOp::Lt => "setl",
          _ => "setle",
        };
        self.emit("  cmp %rdi, %rax");
        self.emit(&format!("  {flag} %al"));
        "movzb %al, %rax"
      }
    };
    self.emit(&format!("  {set}"));
  }
}

/// Emit assembly for a parsed program.
pub fn generate(functions: &[Function], options: Options) -> CompileResult<String> {
  Codegen::new(options).generate(functions)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::parser::parse;
  use crate::tokenizer::tokenize;

  fn functions(src: &str) -> Vec<Function> {
    let tokens = tokenize(src).expect("tokenize");
    parse(&tokens, src).expect("parse")
  }

  /// Instruction and label lines with annotations dropped and indentation trimmed.
  fn instructions(asm: &str) -> Vec<&str> {
    asm
      .lines()
      .filter(|line| !line.starts_with('#'))
      .map(str::trim)
      .collect()
  }

  fn compile(src: &str) -> String {
    generate(&functions(src), Options { annotate: false }).expect("codegen")
  }

  fn labels(asm: &str) -> Vec<String> {
    asm
      .lines()
      .filter(|line| line.starts_with(".L") && line.ends_with(':'))
      .map(|line| line.trim_end_matches(':').to_string())
      .collect()
  }

  #[test]
  fn emits_header_prologue_and_single_epilogue() {
    let asm = compile("main(){ if (1) return 2; return 3; }");
    let lines = instructions(&asm);
    assert_eq!(lines[0], ".att_syntax prefix");
    assert_eq!(lines[1], ".global main");
    assert_eq!(lines[2], "main:");
    assert_eq!(&lines[3..6], ["push %rbp", "mov %rsp, %rbp", "sub $0, %rsp"]);
    assert_eq!(asm.matches("jmp .L.return.main").count(), 2);
    assert_eq!(asm.matches(".L.return.main:").count(), 1);
    assert_eq!(asm.matches("  ret").count(), 1);
    assert!(asm.ends_with(".L.return.main:\n  mov %rbp, %rsp\n  pop %rbp\n  ret\n"));
  }

  #[test]
  fn functions_are_emitted_in_input_order() {
    let asm = compile("b(){ return 1; } a(){ return 2; } main(){ return 3; }");
    let globals: Vec<&str> = asm
      .lines()
      .filter_map(|line| line.strip_prefix(".global "))
      .collect();
    assert_eq!(globals, ["b", "a", "main"]);
  }

  #[test]
  fn binary_operands_pass_through_the_stack() {
    let asm = compile("main(){ return 7-2; }");
    let lines = instructions(&asm);
    let start = lines
      .iter()
      .position(|line| *line == "mov $7, %rax")
      .expect("lhs");
    assert_eq!(
      &lines[start..start + 6],
      [
        "mov $7, %rax",
        "push %rax",
        "mov $2, %rax",
        "mov %rax, %rdi",
        "pop %rax",
        "sub %rdi, %rax",
      ]
    );
  }

  #[test]
  fn variables_are_addressed_below_the_frame_pointer() {
    let asm = compile("main(){ a=3; b=a; return b; }");
    assert!(asm.contains("  sub $16, %rsp"));
    assert!(asm.contains("  lea -8(%rbp), %rax\n  push %rax\n  mov $3, %rax\n  pop %rdi\n  mov %rax, (%rdi)"));
    assert!(asm.contains("  lea -16(%rbp), %rax"));
    assert!(asm.contains("  lea -8(%rbp), %rax\n  mov (%rax), %rax"));
  }

  #[test]
  fn parameters_are_spilled_from_registers() {
    let asm = compile("add3(a,b,c){ return a+b+c; }");
    assert!(asm.contains(
      "  sub $32, %rsp\n  mov %rdi, -8(%rbp)\n  mov %rsi, -16(%rbp)\n  mov %rdx, -24(%rbp)\n"
    ));
  }

  #[test]
  fn call_arguments_are_popped_into_registers_in_reverse() {
    let asm = compile("main(){ return f(1,2,3,4,5,6); }");
    let lines = instructions(&asm);
    let first_pop = lines
      .iter()
      .position(|line| line.starts_with("pop"))
      .expect("pop");
    assert_eq!(
      &lines[first_pop..first_pop + 8],
      [
        "pop %r9",
        "pop %r8",
        "pop %rcx",
        "pop %rdx",
        "pop %rsi",
        "pop %rdi",
        "mov $0, %rax",
        "call f",
      ]
    );
  }

  #[test]
  fn calls_nested_under_a_pushed_operand_realign_the_stack() {
    let asm = compile("main(){ return 1 + f(); }");
    assert!(asm.contains("  sub $8, %rsp\n  mov $0, %rax\n  call f\n  add $8, %rsp\n"));
    let asm = compile("main(){ return f(); }");
    assert!(!asm.contains("sub $8, %rsp"));
  }

  #[test]
  fn if_else_uses_else_and_end_labels() {
    let asm = compile("main(){ if (1) 2; else 3; if (0) 4; return 0; }");
    assert_eq!(labels(&asm), [".Lelse1", ".Lend1", ".Lend2", ".L.return.main"]);
    assert!(asm.contains("  je .Lelse1"));
    assert!(asm.contains("  jmp .Lend1\n.Lelse1:"));
    assert!(asm.contains("  je .Lend2"));
  }

  #[test]
  fn loops_test_before_each_iteration() {
    let asm = compile("main(){ i=0; while (i<3) i=i+1; for (j=0; j<2; j=j+1) ; return i; }");
    assert_eq!(
      labels(&asm),
      [".Lbegin1", ".Lend1", ".Lbegin2", ".Lend2", ".L.return.main"]
    );
    let lines = instructions(&asm);
    let head = lines
      .iter()
      .position(|line| *line == ".Lbegin1:")
      .expect("loop head");
    let exit = lines
      .iter()
      .position(|line| *line == "je .Lend1")
      .expect("loop exit");
    let back = lines
      .iter()
      .position(|line| *line == "jmp .Lbegin1")
      .expect("back edge");
    assert!(head < exit && exit < back);
  }

  #[test]
  fn for_without_clauses_is_an_unconditional_loop() {
    let asm = compile("main(){ for (;;) return 1; }");
    assert!(!asm.contains("je .Lend1"));
    assert!(asm.contains(".Lbegin1:"));
    assert!(asm.contains("  jmp .Lbegin1\n.Lend1:"));
  }

  #[test]
  fn labels_are_unique_and_increasing_across_functions() {
    let asm = compile(
      "f(x){ while (x) { if (x) x=x-1; else x=0; } return x; }
       main(){ for (i=0; i<2; i=i+1) { while (0) ; if (1) ; } return f(2); }",
    );
    let numbers: Vec<usize> = labels(&asm)
      .iter()
      .filter_map(|label| {
        label
          .strip_prefix(".Lbegin")
          .or_else(|| label.strip_prefix(".Lelse"))
      })
      .map(|n| n.parse().expect("label number"))
      .collect();
    assert_eq!(numbers, [1, 2, 3, 4]);

    let mut all = labels(&asm);
    let total = all.len();
    all.sort();
    all.dedup();
    assert_eq!(all.len(), total);
  }

  #[test]
  fn stack_depth_returns_to_zero_after_every_statement() {
    let programs = [
      "main(){ return 1+2*3-4/2; }",
      "main(){ a=b=c=5; return a==b!=(c<a); }",
      "g(a,b,c,d,e,f){ return a*b+c*d+e*f; } main(){ return 1+g(1,2,3,4+5,g(1,1,1,1,1,1),6); }",
      "main(){ x=5; y=&x; *y=*y+1; return *&*y; }",
      "main(){ s=0; for (i=0; i<10; i=i+1) { if (i-i/2*2==0) s=s+i; else ; } while (s>100) s=s-1; return s; }",
    ];
    for src in programs {
      let funcs = functions(src);
      let mut codegen = Codegen::new(Options::default());
      codegen.generate(&funcs).expect("codegen");

      let checkpoints = codegen.checkpoints();
      let statements: usize = funcs.iter().map(|f| f.body.len()).sum();
      assert_eq!(checkpoints.len(), statements + funcs.len(), "{src}");
      assert!(checkpoints.iter().all(|cp| cp.depth == 0), "{src}: {checkpoints:?}");
      for func in &funcs {
        assert!(
          checkpoints
            .iter()
            .any(|cp| cp.function == func.name && cp.statement.is_none()),
          "{src}"
        );
      }
    }
  }

  #[test]
  fn oversized_calls_are_internal_errors() {
    let mut funcs = functions("main(){ return f(1); }");
    let NodeKind::Return { value } = &mut funcs[0].body[0].kind else {
      panic!("expected return");
    };
    let NodeKind::FunCall { args, .. } = &mut value.kind else {
      panic!("expected call");
    };
    let arg = args[0].clone();
    args.resize(7, arg);

    let err = generate(&funcs, Options::default()).unwrap_err();
    assert!(err.is_internal());
    assert!(err.message().contains("7 arguments"));
  }

  #[test]
  fn statements_in_expression_position_are_internal_errors() {
    let mut funcs = functions("main(){ return 1; }");
    let block = Node::block(Vec::new(), 0);
    let NodeKind::Return { value } = &mut funcs[0].body[0].kind else {
      panic!("expected return");
    };
    **value = block;
    let err = generate(&funcs, Options::default()).unwrap_err();
    assert!(err.is_internal());
  }

  #[test]
  fn annotations_can_be_switched_off() {
    let src = "main(){ if (1) return 2; return 3; }";
    let annotated = generate(&functions(src), Options::default()).expect("codegen");
    assert!(annotated.contains("# { if"));
    assert!(annotated.contains("# } if"));
    let plain = compile(src);
    assert!(!plain.lines().any(|line| line.starts_with('#')));
    assert_eq!(instructions(&annotated), instructions(&plain));
  }

  #[test]
  fn empty_program_is_just_the_header() {
    assert_eq!(compile(""), ".att_syntax prefix\n");
  }
}
