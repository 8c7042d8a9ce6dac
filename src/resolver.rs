//! Scope resolver (C4).
//!
//! Runs once over the whole AST before code generation and produces, per
//! function frame (numbered in the same pre-order the code generator visits
//! nested function literals), which locally-declared registers are captured
//! by an inner closure and the ordered upvalue list a closure built from
//! that frame must fill. Code generation re-derives register numbers for
//! locals itself (the allocation rule is deterministic: params, then each
//! `local` in declaration order, reusing a sibling block's registers once it
//! exits) and only consults this output to decide whether a given local
//! access goes through an upvalue cell. Getting the two numbering schemes to
//! agree also means mirroring, here, every register the code generator
//! reserves but never binds to a name — the counter/limit/step slots of a
//! numeric `for` and the iterator/state/control slots of a generic `for` —
//! since the generator's scratch-register use while evaluating expressions
//! is otherwise reclaimed between statements and invisible to this pass.

use std::collections::{HashMap, HashSet};

use crate::ast::*;
use crate::error::CompileError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpvalueSource {
    Local(u16),
    Upvalue(u16),
}

#[derive(Debug, Clone)]
pub struct UpvalueDescriptor {
    pub name: String,
    pub source: UpvalueSource,
}

#[derive(Debug, Clone, Default)]
pub struct FrameScopeInfo {
    pub captured_registers: HashSet<u16>,
    pub upvalues: Vec<UpvalueDescriptor>,
}

impl FrameScopeInfo {
    pub fn upvalue_index(&self, name: &str) -> Option<u16> {
        self.upvalues.iter().position(|u| u.name == name).map(|i| i as u16)
    }
}

pub struct ResolvedScopes {
    pub frames: Vec<FrameScopeInfo>,
}

struct BlockScope {
    locals: HashMap<String, u16>,
    labels: HashSet<String>,
    saved_register: u16,
}

struct Frame {
    id: usize,
    blocks: Vec<BlockScope>,
    next_register: u16,
    info: FrameScopeInfo,
    loop_depth: u32,
}

impl Frame {
    fn new(id: usize) -> Self {
        Frame { id, blocks: Vec::new(), next_register: 0, info: FrameScopeInfo::default(), loop_depth: 0 }
    }

    fn enter_block(&mut self, labels: HashSet<String>) {
        let saved_register = self.next_register;
        self.blocks.push(BlockScope { locals: HashMap::new(), labels, saved_register });
    }

    fn exit_block(&mut self) {
        let block = self.blocks.pop().expect("block scope");
        self.next_register = block.saved_register;
    }

    fn declare_local(&mut self, name: &str) -> u16 {
        let reg = self.alloc_register();
        self.blocks.last_mut().expect("block scope").locals.insert(name.to_string(), reg);
        reg
    }

    /// Reserves a register with no name bound to it, mirroring the code
    /// generator's anonymous control-register allocations (e.g. the
    /// counter/limit/step slots of a numeric `for`) so later named locals in
    /// the same frame land on the same register numbers the compiler assigns.
    fn alloc_register(&mut self) -> u16 {
        let reg = self.next_register;
        self.next_register += 1;
        reg
    }

    fn find_local(&self, name: &str) -> Option<u16> {
        self.blocks.iter().rev().find_map(|b| b.locals.get(name).copied())
    }

    fn has_label(&self, name: &str) -> bool {
        self.blocks.iter().any(|b| b.labels.contains(name))
    }
}

pub struct Resolver {
    frames: Vec<Frame>,
    /// Indexed by frame id, assigned in the same pre-order the code
    /// generator visits nested function literals (chunk is always 0).
    results: Vec<FrameScopeInfo>,
}

type CResult<T> = Result<T, CompileError>;

impl Resolver {
    pub fn new() -> Self {
        Resolver { frames: Vec::new(), results: Vec::new() }
    }

    /// Resolves a whole chunk (the implicit vararg top-level function) and
    /// returns the per-frame info indexed exactly as the code generator
    /// will number its nested prototypes in pre-order.
    pub fn resolve_chunk(block: &Block) -> CResult<ResolvedScopes> {
        let mut r = Resolver::new();
        r.push_frame();
        r.resolve_block(block)?;
        r.pop_frame();
        Ok(ResolvedScopes { frames: r.results })
    }

    fn push_frame(&mut self) {
        let id = self.results.len();
        self.results.push(FrameScopeInfo::default());
        self.frames.push(Frame::new(id));
    }

    fn pop_frame(&mut self) {
        let frame = self.frames.pop().expect("frame stack underflow");
        self.results[frame.id] = frame.info;
    }

    fn current(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("no active frame")
    }

    fn resolve_block(&mut self, block: &Block) -> CResult<()> {
        let labels: HashSet<String> = block
            .statements
            .iter()
            .filter_map(|s| match &s.node {
                Statement::Label(name) => Some(name.clone()),
                _ => None,
            })
            .collect();
        self.current().enter_block(labels);
        for stmt in &block.statements {
            self.resolve_statement(&stmt.node)?;
        }
        self.current().exit_block();
        Ok(())
    }

    fn resolve_statement(&mut self, stmt: &Statement) -> CResult<()> {
        match stmt {
            Statement::Empty | Statement::Label(_) => Ok(()),
            Statement::Break => {
                if self.current().loop_depth == 0 {
                    return Err(CompileError::BreakOutsideLoop);
                }
                Ok(())
            }
            Statement::Goto(name) => {
                if self.frames.iter().any(|f| f.has_label(name)) {
                    Ok(())
                } else {
                    Err(CompileError::UnresolvedLabel { label: name.clone() })
                }
            }
            Statement::Assign { targets, values } => {
                for v in values {
                    self.resolve_expr(&v.node)?;
                }
                for t in targets {
                    self.resolve_var(&t.node)?;
                }
                Ok(())
            }
            Statement::LocalAssign { names, values, .. } => {
                for v in values {
                    self.resolve_expr(&v.node)?;
                }
                for name in names {
                    self.current().declare_local(name);
                }
                Ok(())
            }
            Statement::Call(call) => self.resolve_call(&call.node),
            Statement::Do(block) => self.resolve_block(block),
            Statement::While { cond, body } => {
                self.resolve_expr(&cond.node)?;
                self.current().loop_depth += 1;
                let r = self.resolve_block(body);
                self.current().loop_depth -= 1;
                r
            }
            Statement::Repeat { body, cond } => {
                // `until` can see locals declared in the loop body, so the
                // condition is resolved as if still inside the body's block.
                let labels: HashSet<String> = body
                    .statements
                    .iter()
                    .filter_map(|s| match &s.node {
                        Statement::Label(name) => Some(name.clone()),
                        _ => None,
                    })
                    .collect();
                self.current().enter_block(labels);
                self.current().loop_depth += 1;
                for stmt in &body.statements {
                    self.resolve_statement(&stmt.node)?;
                }
                self.resolve_expr(&cond.node)?;
                self.current().loop_depth -= 1;
                self.current().exit_block();
                Ok(())
            }
            Statement::If { arms, else_block } => {
                for (cond, body) in arms {
                    self.resolve_expr(&cond.node)?;
                    self.resolve_block(body)?;
                }
                if let Some(block) = else_block {
                    self.resolve_block(block)?;
                }
                Ok(())
            }
            Statement::NumericFor { start, limit, step, body, var } => {
                self.resolve_expr(&start.node)?;
                self.resolve_expr(&limit.node)?;
                if let Some(step) = step {
                    self.resolve_expr(&step.node)?;
                }
                // Mirrors the code generator's counter/limit/step registers.
                self.current().alloc_register();
                self.current().alloc_register();
                self.current().alloc_register();
                self.current().enter_block(HashSet::new());
                self.current().declare_local(var);
                self.current().loop_depth += 1;
                let r = self.resolve_block(body);
                self.current().loop_depth -= 1;
                self.current().exit_block();
                r
            }
            Statement::GenericFor { vars, exprs, body } => {
                for e in exprs {
                    self.resolve_expr(&e.node)?;
                }
                // Mirrors the code generator's iterator/state/control registers.
                self.current().alloc_register();
                self.current().alloc_register();
                self.current().alloc_register();
                self.current().enter_block(HashSet::new());
                for v in vars {
                    self.current().declare_local(v);
                }
                self.current().loop_depth += 1;
                let r = self.resolve_block(body);
                self.current().loop_depth -= 1;
                self.current().exit_block();
                r
            }
            Statement::FunctionDecl { name, body } => {
                match name {
                    FunctionName::Plain(n) => self.resolve_name_use(n)?,
                    FunctionName::Field { base, .. } | FunctionName::Method { base, .. } => {
                        self.resolve_name_use(base)?
                    }
                }
                self.resolve_function_body(body)
            }
            Statement::LocalFunction { name, body } => {
                // Visible to its own body, unlike a plain local assignment.
                self.current().declare_local(name);
                self.resolve_function_body(body)
            }
            Statement::Return(exprs) => {
                for e in exprs {
                    self.resolve_expr(&e.node)?;
                }
                Ok(())
            }
        }
    }

    fn resolve_call(&mut self, call: &Call) -> CResult<()> {
        self.resolve_expr(&call.callee.node)?;
        for a in &call.args {
            self.resolve_expr(&a.node)?;
        }
        Ok(())
    }

    fn resolve_var(&mut self, var: &Var) -> CResult<()> {
        match var {
            Var::Name(name) => self.resolve_name_use(name),
            Var::Index { object, key } => {
                self.resolve_expr(&object.node)?;
                self.resolve_expr(&key.node)
            }
            Var::Field { object, .. } => self.resolve_expr(&object.node),
        }
    }

    fn resolve_expr(&mut self, expr: &Expr) -> CResult<()> {
        match expr {
            Expr::Nil | Expr::True | Expr::False | Expr::Int(_) | Expr::Float(_) | Expr::Str(_) | Expr::Vararg => {
                Ok(())
            }
            Expr::Var(v) => self.resolve_var(v),
            Expr::Call(call) => self.resolve_call(call),
            Expr::Function(body) => self.resolve_function_body(body),
            Expr::Table(fields) => {
                for field in fields {
                    match field {
                        TableField::Positional(e) => self.resolve_expr(&e.node)?,
                        TableField::Named { value, .. } => self.resolve_expr(&value.node)?,
                        TableField::Indexed { key, value } => {
                            self.resolve_expr(&key.node)?;
                            self.resolve_expr(&value.node)?;
                        }
                    }
                }
                Ok(())
            }
            Expr::Binary { lhs, rhs, .. } => {
                self.resolve_expr(&lhs.node)?;
                self.resolve_expr(&rhs.node)
            }
            Expr::Unary { operand, .. } => self.resolve_expr(&operand.node),
            Expr::Paren(e) => self.resolve_expr(&e.node),
        }
    }

    fn resolve_function_body(&mut self, body: &FunctionBody) -> CResult<()> {
        self.push_frame();
        self.current().enter_block(HashSet::new());
        for p in &body.params {
            self.current().declare_local(p);
        }
        for stmt in &body.block.statements {
            self.resolve_statement(&stmt.node)?;
        }
        self.current().exit_block();
        self.pop_frame();
        Ok(())
    }

    /// Resolves a bare name reference: local in the current frame, an
    /// upvalue chained through enclosing frames, or (implicitly) global.
    fn resolve_name_use(&mut self, name: &str) -> CResult<()> {
        let depth = self.frames.len();
        if self.frames[depth - 1].find_local(name).is_some() {
            return Ok(());
        }
        for i in (0..depth - 1).rev() {
            if let Some(reg) = self.frames[i].find_local(name) {
                self.frames[i].info.captured_registers.insert(reg);
                let mut source = UpvalueSource::Local(reg);
                for j in (i + 1)..depth {
                    if self.frames[j].info.upvalue_index(name).is_none() {
                        self.frames[j].info.upvalues.push(UpvalueDescriptor { name: name.to_string(), source });
                    }
                    let idx = self.frames[j].info.upvalue_index(name).unwrap();
                    source = UpvalueSource::Upvalue(idx);
                }
                return Ok(());
            }
        }
        // Not found anywhere: a global reference, nothing to record.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    fn resolve(src: &str) -> ResolvedScopes {
        let block = Parser::parse(src).unwrap();
        Resolver::resolve_chunk(&block).unwrap()
    }

    #[test]
    fn captures_enclosing_local_as_upvalue() {
        let scopes = resolve("local x = 1\nlocal f = function() return x end");
        // frame 0 = chunk, frame 1 = the closure.
        assert!(scopes.frames[0].captured_registers.contains(&0));
        assert_eq!(scopes.frames[1].upvalues.len(), 1);
        assert_eq!(scopes.frames[1].upvalues[0].name, "x");
        assert!(matches!(scopes.frames[1].upvalues[0].source, UpvalueSource::Local(0)));
    }

    #[test]
    fn chains_upvalue_through_two_levels() {
        let src = "local x = 1\nlocal f = function() return function() return x end end";
        let scopes = resolve(src);
        assert_eq!(scopes.frames.len(), 3);
        assert!(matches!(scopes.frames[1].upvalues[0].source, UpvalueSource::Local(0)));
        assert!(matches!(scopes.frames[2].upvalues[0].source, UpvalueSource::Upvalue(0)));
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        let block = Parser::parse("break").unwrap();
        assert!(matches!(Resolver::resolve_chunk(&block), Err(CompileError::BreakOutsideLoop)));
    }

    #[test]
    fn goto_without_matching_label_is_rejected() {
        let block = Parser::parse("goto nowhere").unwrap();
        assert!(matches!(Resolver::resolve_chunk(&block), Err(CompileError::UnresolvedLabel { .. })));
    }
}
