//! Code generator (C5): lowers a resolved AST to `Prototype` objects.
//!
//! Control-flow lowers to an embedded tree of instruction lists rather than
//! labeled jumps (SPEC_FULL §3's "Instruction set" note): `Test`, loops, and
//! short-circuit `and`/`or` all carry their sub-bodies inline and the
//! executor recurses into them. This removes an entire class of
//! jump-patching bugs from the generator at the cost of the executor doing
//! real recursion for control flow instead of an instruction pointer.

use std::collections::HashMap;

use crate::ast::*;
use crate::error::CompileError;
use crate::resolver::{Resolver, ResolvedScopes, UpvalueSource};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    Concat,
    Band,
    Bor,
    Bxor,
    Shl,
    Shr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
    Len,
    Bnot,
}

/// Result/argument counts for calls, returns, and vararg expansion. `Multi`
/// is the last element of an expression list whose value count isn't known
/// until it runs (a trailing call or `...`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Multiplicity {
    Fixed(u16),
    Multi,
}

pub type Body = Vec<Instr>;

#[derive(Debug, Clone)]
pub enum Instr {
    LoadConst(u16, Value),
    LoadBool(u16, bool),
    LoadNil(u16, u16),
    Move(u16, u16),

    Arith(ArithOp, u16, u16, u16),
    Unary(UnOp, u16, u16),
    Cmp(CmpOp, u16, u16, u16),

    GetGlobal(u16, String),
    SetGlobal(String, u16),

    GetUpvalue(u16, u16),
    SetUpvalue(u16, u16),
    GetOpenUpvalue(u16, u16),
    SetOpenUpvalue(u16, u16),

    NewTable(u16, u16, u16),
    GetField(u16, u16, String),
    SetField(u16, String, u16),
    GetIndex(u16, u16, u16),
    SetIndex(u16, u16, u16),
    SetList(u16, u16, Multiplicity, u16),
    SelfOp(u16, u16, String),

    Closure(u16, usize),
    /// `base`, argument count (`Multi` meaning "everything from `base+1`
    /// onward, as left by the last argument's evaluation"), result count.
    Call(u16, Multiplicity, Multiplicity),
    Return(u16, Multiplicity),
    Vararg(u16, Multiplicity),

    Test(u16, Body, Body),
    TestAnd(u16, u16, Body),
    TestOr(u16, u16, Body),
    WhileLoop(Body, u16, Body),
    RepeatLoop(Body, Body, u16),
    NumericFor(u16, u16, Body),
    GenericFor(u16, u16, Body),
    Break,
    Goto(String),
    Label(String),

    SourceLine(u32),
}

#[derive(Debug, Clone)]
pub struct Prototype {
    pub instructions: Body,
    pub prototypes: Vec<std::rc::Rc<Prototype>>,
    pub upvalue_descriptors: Vec<UpvalueSource>,
    pub param_count: u16,
    pub is_vararg: bool,
    pub max_registers: u16,
    pub source: String,
    pub line_range: (u32, u32),
    pub name: Option<String>,
    /// Registers that some nested closure captures, computed by the
    /// resolver; the executor pre-allocates a cell for each at frame entry
    /// so every read/write of that register (not just the explicit
    /// `Get/SetOpenUpvalue` instructions) observes captured mutations.
    pub captured_registers: std::collections::HashSet<u16>,
}

struct FnScope {
    frame_id: usize,
    blocks: Vec<HashMap<String, u16>>,
    next_register: u16,
    /// One past the highest register currently bound to a name. Scratch
    /// registers used while evaluating an expression live above this line
    /// and get discarded (see `reclaim_scratch`) once the statement that
    /// needed them is done, so later locals land on the same register
    /// numbers the resolver computed (it has no notion of scratch space).
    locals_top: u16,
    max_register: u16,
    prototypes: Vec<std::rc::Rc<Prototype>>,
}

impl FnScope {
    fn new(frame_id: usize) -> Self {
        FnScope {
            frame_id,
            blocks: Vec::new(),
            next_register: 0,
            locals_top: 0,
            max_register: 0,
            prototypes: Vec::new(),
        }
    }

    fn enter_block(&mut self) {
        self.blocks.push(HashMap::new());
    }

    fn exit_block(&mut self, saved_register: u16) {
        self.blocks.pop();
        self.next_register = saved_register;
        self.locals_top = saved_register;
    }

    fn declare_local(&mut self, name: &str) -> u16 {
        let reg = self.alloc_register();
        self.blocks.last_mut().expect("block scope").insert(name.to_string(), reg);
        self.locals_top = self.locals_top.max(reg + 1);
        reg
    }

    /// Binds a name to a register already reserved by the caller (e.g. by
    /// `compile_expr_list_into`), without allocating a new one.
    fn bind_local(&mut self, name: &str, reg: u16) {
        self.blocks.last_mut().expect("block scope").insert(name.to_string(), reg);
        self.locals_top = self.locals_top.max(reg + 1);
    }

    fn find_local(&self, name: &str) -> Option<u16> {
        self.blocks.iter().rev().find_map(|b| b.get(name).copied())
    }

    fn alloc_register(&mut self) -> u16 {
        let reg = self.next_register;
        self.next_register += 1;
        self.max_register = self.max_register.max(self.next_register);
        reg
    }

    /// Drops any scratch registers allocated above `locals_top` while
    /// compiling the last statement, so the next statement's locals get the
    /// same register numbers the resolver independently computed for them.
    fn reclaim_scratch(&mut self) {
        self.next_register = self.locals_top;
    }

    /// Like `reclaim_scratch`, but for mid-statement points where registers
    /// above `locals_top` (e.g. a numeric `for`'s counter/limit/step slots)
    /// must survive the reclaim.
    fn reclaim_scratch_above(&mut self, floor: u16) {
        self.next_register = floor;
    }
}

/// How a resolved name reference should be compiled.
enum Access {
    Register(u16),
    CapturedLocal(u16),
    Upvalue(u16),
    Global(String),
}

pub struct Compiler<'a> {
    scopes: &'a ResolvedScopes,
    next_frame_id: usize,
    scope_stack: Vec<FnScope>,
    source: String,
}

type CResult<T> = Result<T, CompileError>;

impl<'a> Compiler<'a> {
    /// Parses, resolves, and compiles a whole chunk to its top-level
    /// `Prototype`. The chunk is itself a vararg function with no params.
    pub fn compile_chunk(block: &Block, source: &str) -> CResult<Prototype> {
        let scopes = Resolver::resolve_chunk(block).map_err(|e| e)?;
        let mut compiler = Compiler { scopes: &scopes, next_frame_id: 0, scope_stack: Vec::new(), source: source.to_string() };
        compiler.compile_function_like(&[], true, block, None)
    }

    fn current(&mut self) -> &mut FnScope {
        self.scope_stack.last_mut().expect("no active function scope")
    }

    fn frame_info(&self) -> &crate::resolver::FrameScopeInfo {
        let id = self.scope_stack.last().unwrap().frame_id;
        &self.scopes.frames[id]
    }

    fn compile_function_like(
        &mut self,
        params: &[String],
        is_vararg: bool,
        block: &Block,
        name: Option<String>,
    ) -> CResult<Prototype> {
        let frame_id = self.next_frame_id;
        self.next_frame_id += 1;
        let mut scope = FnScope::new(frame_id);
        scope.enter_block();
        self.scope_stack.push(scope);
        for p in params {
            self.current().declare_local(p);
        }
        let mut instructions = Vec::new();
        self.compile_block(block, &mut instructions)?;
        // An implicit `return` covers falling off the end of a function body.
        instructions.push(Instr::Return(0, Multiplicity::Fixed(0)));

        let scope = self.scope_stack.pop().expect("scope pushed above");
        let upvalue_descriptors =
            self.scopes.frames[frame_id].upvalues.iter().map(|d| d.source).collect();
        let captured_registers = self.scopes.frames[frame_id].captured_registers.clone();

        Ok(Prototype {
            instructions,
            prototypes: scope.prototypes,
            upvalue_descriptors,
            param_count: params.len() as u16,
            is_vararg,
            max_registers: scope.max_register,
            source: self.source.clone(),
            line_range: (0, 0),
            name,
            captured_registers,
        })
    }

    fn compile_block(&mut self, block: &Block, out: &mut Body) -> CResult<()> {
        self.current().enter_block();
        let saved = self.current().next_register;
        for stmt in &block.statements {
            out.push(Instr::SourceLine(stmt.pos.line));
            self.compile_statement(&stmt.node, out)?;
            self.current().reclaim_scratch();
        }
        self.current().exit_block(saved);
        Ok(())
    }

    fn compile_statement(&mut self, stmt: &Statement, out: &mut Body) -> CResult<()> {
        match stmt {
            Statement::Empty => Ok(()),
            Statement::Break => {
                out.push(Instr::Break);
                Ok(())
            }
            Statement::Goto(name) => {
                out.push(Instr::Goto(name.clone()));
                Ok(())
            }
            Statement::Label(name) => {
                out.push(Instr::Label(name.clone()));
                Ok(())
            }
            Statement::Return(exprs) => {
                let base = self.current().next_register;
                let count = self.compile_expr_list(exprs, base, out)?;
                out.push(Instr::Return(base, count));
                Ok(())
            }
            Statement::LocalAssign { names, values, .. } => {
                let base = self.current().next_register;
                self.compile_expr_list_into(values, names.len() as u16, base, out)?;
                // Registers are already reserved positionally by the list
                // compile above; bind the names to them now.
                for (i, name) in names.iter().enumerate() {
                    self.current().bind_local(name, base + i as u16);
                }
                Ok(())
            }
            Statement::Assign { targets, values } => {
                let base = self.current().next_register;
                let count = targets.len() as u16;
                self.compile_expr_list_into(values, count, base, out)?;
                for (i, target) in targets.iter().enumerate() {
                    self.compile_store(&target.node, base + i as u16, out)?;
                }
                Ok(())
            }
            Statement::Call(call) => {
                let base = self.current().next_register;
                self.compile_call(&call.node, base, Multiplicity::Fixed(0), out)?;
                Ok(())
            }
            Statement::Do(block) => self.compile_block(block, out),
            Statement::While { cond, body } => {
                let cond_base = self.current().next_register;
                let mut cond_body = Vec::new();
                self.compile_expr(cond, cond_base, &mut cond_body)?;
                self.current().reclaim_scratch();
                let mut loop_body = Vec::new();
                self.compile_block(body, &mut loop_body)?;
                out.push(Instr::WhileLoop(cond_body, cond_base, loop_body));
                Ok(())
            }
            Statement::Repeat { body, cond } => {
                let mut loop_body = Vec::new();
                // `until` reads locals from the body, so keep the block open
                // while compiling the condition.
                self.current().enter_block();
                let saved = self.current().next_register;
                for stmt in &body.statements {
                    loop_body.push(Instr::SourceLine(stmt.pos.line));
                    self.compile_statement(&stmt.node, &mut loop_body)?;
                    self.current().reclaim_scratch();
                }
                let cond_base = self.current().next_register;
                let mut cond_body = Vec::new();
                self.compile_expr(cond, cond_base, &mut cond_body)?;
                self.current().exit_block(saved);
                out.push(Instr::RepeatLoop(loop_body, cond_body, cond_base));
                Ok(())
            }
            Statement::If { arms, else_block } => {
                out.extend(self.compile_if_chain(arms, else_block, 0)?);
                Ok(())
            }
            Statement::NumericFor { var, start, limit, step, body } => {
                let base = self.current().next_register;
                self.current().alloc_register(); // counter
                self.current().alloc_register(); // limit
                self.current().alloc_register(); // step
                self.compile_expr(start, base, out)?;
                self.compile_expr(limit, base + 1, out)?;
                match step {
                    Some(e) => self.compile_expr(e, base + 2, out)?,
                    None => out.push(Instr::LoadConst(base + 2, Value::Integer(1))),
                }
                self.current().reclaim_scratch_above(base + 3);
                self.current().enter_block();
                let saved = self.current().next_register;
                let loop_var = self.current().declare_local(var);
                let mut body_instrs = Vec::new();
                for stmt in &body.statements {
                    body_instrs.push(Instr::SourceLine(stmt.pos.line));
                    self.compile_statement(&stmt.node, &mut body_instrs)?;
                    self.current().reclaim_scratch();
                }
                self.current().exit_block(saved);
                out.push(Instr::NumericFor(base, loop_var, body_instrs));
                Ok(())
            }
            Statement::GenericFor { vars, exprs, body } => {
                let base = self.current().next_register;
                // `compile_expr_list_into` reserves the iterator/state/control
                // registers itself.
                self.compile_expr_list_into(exprs, 3, base, out)?;
                self.current().reclaim_scratch_above(base + 3);
                self.current().enter_block();
                let saved = self.current().next_register;
                for v in vars {
                    self.current().declare_local(v);
                }
                let mut body_instrs = Vec::new();
                for stmt in &body.statements {
                    body_instrs.push(Instr::SourceLine(stmt.pos.line));
                    self.compile_statement(&stmt.node, &mut body_instrs)?;
                    self.current().reclaim_scratch();
                }
                self.current().exit_block(saved);
                out.push(Instr::GenericFor(base, vars.len() as u16, body_instrs));
                Ok(())
            }
            Statement::FunctionDecl { name, body } => {
                let (is_method, full_name) = match name {
                    FunctionName::Plain(n) => (false, n.clone()),
                    FunctionName::Field { base, path } => {
                        (false, format!("{base}.{}", path.join(".")))
                    }
                    FunctionName::Method { base, path, method } => {
                        let mut full = base.clone();
                        for p in path {
                            full.push('.');
                            full.push_str(p);
                        }
                        full.push(':');
                        full.push_str(method);
                        (true, full)
                    }
                };
                let mut params = body.params.clone();
                if is_method && !params.first().map(|p| p == "self").unwrap_or(false) {
                    params.insert(0, "self".to_string());
                }
                let proto = self.compile_function_like(&params, body.is_vararg, &body.block, Some(full_name))?;
                let idx = self.current().prototypes.len();
                self.current().prototypes.push(std::rc::Rc::new(proto));
                let dest = self.current().alloc_register();
                out.push(Instr::Closure(dest, idx));
                match name {
                    FunctionName::Plain(n) => self.compile_store(&Var::Name(n.clone()), dest, out)?,
                    FunctionName::Field { base, path } => {
                        let mut target = Node::new(Expr::Var(Var::Name(base.clone())), Position::default());
                        for (i, p) in path.iter().enumerate() {
                            let is_last = i + 1 == path.len();
                            if is_last {
                                self.compile_store(&Var::Field { object: Box::new(target), name: p.clone() }, dest, out)?;
                                return Ok(());
                            }
                            target = Node::new(
                                Expr::Var(Var::Field { object: Box::new(target), name: p.clone() }),
                                Position::default(),
                            );
                        }
                    }
                    FunctionName::Method { base, path, method } => {
                        let mut target = Node::new(Expr::Var(Var::Name(base.clone())), Position::default());
                        for p in path {
                            target = Node::new(
                                Expr::Var(Var::Field { object: Box::new(target), name: p.clone() }),
                                Position::default(),
                            );
                        }
                        self.compile_store(&Var::Field { object: Box::new(target), name: method.clone() }, dest, out)?;
                    }
                }
                Ok(())
            }
            Statement::LocalFunction { name, body } => {
                // Declared before compiling the body so recursive calls resolve.
                let reg = self.current().declare_local(name);
                let proto = self.compile_function_like(&body.params, body.is_vararg, &body.block, Some(name.clone()))?;
                let idx = self.current().prototypes.len();
                self.current().prototypes.push(std::rc::Rc::new(proto));
                out.push(Instr::Closure(reg, idx));
                Ok(())
            }
        }
    }

    fn compile_if_chain(
        &mut self,
        arms: &[(Node<Expr>, Block)],
        else_block: &Option<Block>,
        idx: usize,
    ) -> CResult<Body> {
        if idx == arms.len() {
            let mut out = Vec::new();
            if let Some(block) = else_block {
                self.compile_block(block, &mut out)?;
            }
            return Ok(out);
        }
        let (cond, body) = &arms[idx];
        let cond_reg = self.current().next_register;
        let mut cond_code = Vec::new();
        self.compile_expr(cond, cond_reg, &mut cond_code)?;
        self.current().reclaim_scratch();
        let mut then_body = Vec::new();
        self.compile_block(body, &mut then_body)?;
        let else_body = self.compile_if_chain(arms, else_block, idx + 1)?;
        let mut out = cond_code;
        out.push(Instr::Test(cond_reg, then_body, else_body));
        Ok(out)
    }

    fn compile_store(&mut self, var: &Var, src: u16, out: &mut Body) -> CResult<()> {
        match var {
            Var::Name(name) => match self.resolve_access(name) {
                Access::Register(r) | Access::CapturedLocal(r) if r == src => {}
                Access::Register(r) => out.push(Instr::Move(r, src)),
                Access::CapturedLocal(r) => out.push(Instr::SetOpenUpvalue(r, src)),
                Access::Upvalue(i) => out.push(Instr::SetUpvalue(i, src)),
                Access::Global(name) => out.push(Instr::SetGlobal(name, src)),
            },
            Var::Field { object, name } => {
                let obj_reg = self.current().alloc_register();
                self.compile_expr(object, obj_reg, out)?;
                out.push(Instr::SetField(obj_reg, name.clone(), src));
            }
            Var::Index { object, key } => {
                let obj_reg = self.current().alloc_register();
                self.compile_expr(object, obj_reg, out)?;
                let key_reg = self.current().alloc_register();
                self.compile_expr(key, key_reg, out)?;
                out.push(Instr::SetIndex(obj_reg, key_reg, src));
            }
        }
        Ok(())
    }

    fn resolve_access(&mut self, name: &str) -> Access {
        if let Some(reg) = self.current().find_local(name) {
            return if self.frame_info().captured_registers.contains(&reg) {
                Access::CapturedLocal(reg)
            } else {
                Access::Register(reg)
            };
        }
        if let Some(idx) = self.frame_info().upvalue_index(name) {
            return Access::Upvalue(idx);
        }
        Access::Global(name.to_string())
    }

    /// Compiles `exprs` into `count` consecutive registers starting at
    /// `base`, expanding the last expression's results (if it's a call or
    /// `...`) to fill any shortfall and truncating/padding with `Nil`
    /// otherwise.
    fn compile_expr_list_into(&mut self, exprs: &[Node<Expr>], count: u16, base: u16, out: &mut Body) -> CResult<()> {
        for i in 0..count as usize {
            self.current().alloc_register();
            let _ = i;
        }
        if exprs.is_empty() {
            out.push(Instr::LoadNil(base, count));
            return Ok(());
        }
        for (i, e) in exprs.iter().enumerate() {
            let is_last = i + 1 == exprs.len();
            let reg = base + i as u16;
            if is_last && i as u16 + 1 < count {
                self.compile_multi_expr(&e.node, reg, Multiplicity::Fixed(count - i as u16), out)?;
            } else if reg < base + count {
                self.compile_expr(&e.node, reg, out)?;
            } else {
                // Extra values beyond `count`: still evaluate for side effects.
                let scratch = self.current().alloc_register();
                self.compile_expr(&e.node, scratch, out)?;
            }
        }
        if exprs.len() < count as usize {
            let filled = exprs.len() as u16;
            out.push(Instr::LoadNil(base + filled, count - filled));
        }
        Ok(())
    }

    /// Like `compile_expr_list_into` but used by `return`/call-argument
    /// contexts, where the final expression's multiplicity is preserved.
    fn compile_expr_list(&mut self, exprs: &[Node<Expr>], base: u16, out: &mut Body) -> CResult<Multiplicity> {
        if exprs.is_empty() {
            return Ok(Multiplicity::Fixed(0));
        }
        for (i, e) in exprs.iter().enumerate() {
            let reg = self.current().alloc_register();
            let is_last = i + 1 == exprs.len();
            if is_last {
                if let Some(mult) = self.compile_multi_tail(&e.node, reg, out)? {
                    return Ok(mult);
                }
            } else {
                self.compile_expr(&e.node, reg, out)?;
            }
        }
        let _ = base;
        Ok(Multiplicity::Fixed(exprs.len() as u16))
    }

    /// Compiles the final expression of a list as a potential multi-value
    /// tail (a call or `...`); returns `None` (expr compiled as a single
    /// value already) when it isn't one.
    fn compile_multi_tail(&mut self, expr: &Expr, reg: u16, out: &mut Body) -> CResult<Option<Multiplicity>> {
        match expr {
            Expr::Call(call) => {
                self.compile_call(call, reg, Multiplicity::Multi, out)?;
                Ok(Some(Multiplicity::Multi))
            }
            Expr::Vararg => {
                out.push(Instr::Vararg(reg, Multiplicity::Multi));
                Ok(Some(Multiplicity::Multi))
            }
            other => {
                self.compile_expr_inner(other, reg, out)?;
                Ok(None)
            }
        }
    }

    fn compile_multi_expr(&mut self, expr: &Expr, reg: u16, mult: Multiplicity, out: &mut Body) -> CResult<()> {
        match expr {
            Expr::Call(call) => self.compile_call(call, reg, mult, out),
            Expr::Vararg => {
                out.push(Instr::Vararg(reg, mult));
                Ok(())
            }
            other => self.compile_expr_inner(other, reg, out),
        }
    }

    fn compile_expr(&mut self, node: &Node<Expr>, dest: u16, out: &mut Body) -> CResult<()> {
        self.compile_expr_inner(&node.node, dest, out)
    }

    fn compile_expr_inner(&mut self, expr: &Expr, dest: u16, out: &mut Body) -> CResult<()> {
        match expr {
            Expr::Nil => out.push(Instr::LoadNil(dest, 1)),
            Expr::True => out.push(Instr::LoadBool(dest, true)),
            Expr::False => out.push(Instr::LoadBool(dest, false)),
            Expr::Int(n) => out.push(Instr::LoadConst(dest, Value::Integer(*n))),
            Expr::Float(n) => out.push(Instr::LoadConst(dest, Value::Float(*n))),
            Expr::Str(s) => out.push(Instr::LoadConst(dest, Value::str(s.clone()))),
            Expr::Vararg => out.push(Instr::Vararg(dest, Multiplicity::Fixed(1))),
            Expr::Paren(inner) => self.compile_expr(inner, dest, out)?,
            Expr::Var(Var::Name(name)) => match self.resolve_access(name) {
                Access::Register(r) => {
                    if r != dest {
                        out.push(Instr::Move(dest, r));
                    }
                }
                Access::CapturedLocal(r) => out.push(Instr::GetOpenUpvalue(dest, r)),
                Access::Upvalue(i) => out.push(Instr::GetUpvalue(dest, i)),
                Access::Global(name) => out.push(Instr::GetGlobal(dest, name)),
            },
            Expr::Var(Var::Field { object, name }) => {
                let obj_reg = self.current().alloc_register();
                self.compile_expr(object, obj_reg, out)?;
                out.push(Instr::GetField(dest, obj_reg, name.clone()));
            }
            Expr::Var(Var::Index { object, key }) => {
                let obj_reg = self.current().alloc_register();
                self.compile_expr(object, obj_reg, out)?;
                let key_reg = self.current().alloc_register();
                self.compile_expr(key, key_reg, out)?;
                out.push(Instr::GetIndex(dest, obj_reg, key_reg));
            }
            Expr::Call(call) => self.compile_call(call, dest, Multiplicity::Fixed(1), out)?,
            Expr::Function(body) => {
                let proto = self.compile_function_like(&body.params, body.is_vararg, &body.block, None)?;
                let idx = self.current().prototypes.len();
                self.current().prototypes.push(std::rc::Rc::new(proto));
                out.push(Instr::Closure(dest, idx));
            }
            Expr::Table(fields) => {
                out.push(Instr::NewTable(dest, 0, 0));
                let mut array_index: u16 = 1;
                for (i, field) in fields.iter().enumerate() {
                    match field {
                        TableField::Positional(e) => {
                            let is_last = i + 1 == fields.len();
                            let val_reg = self.current().alloc_register();
                            if is_last {
                                if let Some(mult) = self.compile_multi_tail(&e.node, val_reg, out)? {
                                    out.push(Instr::SetList(dest, val_reg, mult, array_index as u16));
                                    continue;
                                }
                            } else {
                                self.compile_expr(e, val_reg, out)?;
                            }
                            out.push(Instr::SetList(dest, val_reg, Multiplicity::Fixed(1), array_index));
                            array_index += 1;
                        }
                        TableField::Named { name, value } => {
                            let val_reg = self.current().alloc_register();
                            self.compile_expr(value, val_reg, out)?;
                            out.push(Instr::SetField(dest, name.clone(), val_reg));
                        }
                        TableField::Indexed { key, value } => {
                            let key_reg = self.current().alloc_register();
                            self.compile_expr(key, key_reg, out)?;
                            let val_reg = self.current().alloc_register();
                            self.compile_expr(value, val_reg, out)?;
                            out.push(Instr::SetIndex(dest, key_reg, val_reg));
                        }
                    }
                }
            }
            Expr::Unary { op, operand } => {
                let src = self.current().alloc_register();
                self.compile_expr(operand, src, out)?;
                let op = match op {
                    UnaryOp::Neg => UnOp::Neg,
                    UnaryOp::Not => UnOp::Not,
                    UnaryOp::Len => UnOp::Len,
                    UnaryOp::BNot => UnOp::Bnot,
                };
                out.push(Instr::Unary(op, dest, src));
            }
            Expr::Binary { op: BinaryOp::And, lhs, rhs } => {
                self.compile_expr(lhs, dest, out)?;
                let mut rhs_body = Vec::new();
                self.compile_expr(rhs, dest, &mut rhs_body)?;
                out.push(Instr::TestAnd(dest, dest, rhs_body));
            }
            Expr::Binary { op: BinaryOp::Or, lhs, rhs } => {
                self.compile_expr(lhs, dest, out)?;
                let mut rhs_body = Vec::new();
                self.compile_expr(rhs, dest, &mut rhs_body)?;
                out.push(Instr::TestOr(dest, dest, rhs_body));
            }
            Expr::Binary { op, lhs, rhs } => {
                let a = self.current().alloc_register();
                self.compile_expr(lhs, a, out)?;
                let b = self.current().alloc_register();
                self.compile_expr(rhs, b, out)?;
                if let Some(arith) = arith_op(*op) {
                    out.push(Instr::Arith(arith, dest, a, b));
                } else if let Some(cmp) = cmp_op(*op) {
                    out.push(Instr::Cmp(cmp, dest, a, b));
                } else {
                    return Err(CompileError::MalformedPrototype(format!("unhandled binary op {op:?}")));
                }
            }
        }
        Ok(())
    }

    fn compile_call(&mut self, call: &Call, base: u16, mult: Multiplicity, out: &mut Body) -> CResult<()> {
        // `base` and, for a method call, `base+1` (the receiver) are
        // reserved first so argument registers start right after them.
        self.current().alloc_register();
        let (args_base, extra_arg) = if let Some(method) = &call.method {
            let obj_reg = self.current().alloc_register();
            self.compile_expr(&call.callee, obj_reg, out)?;
            self.current().alloc_register();
            out.push(Instr::SelfOp(base, obj_reg, method.clone()));
            (base + 2, 1u16)
        } else {
            self.compile_expr(&call.callee, base, out)?;
            (base + 1, 0u16)
        };
        let argc = match self.compile_call_args(&call.args, args_base, out)? {
            Multiplicity::Fixed(n) => Multiplicity::Fixed(n + extra_arg),
            Multiplicity::Multi => Multiplicity::Multi,
        };
        out.push(Instr::Call(base, argc, mult));
        Ok(())
    }

    /// Compiles a call's argument list into consecutive registers starting
    /// at `base`; the last argument may expand to multiple values.
    fn compile_call_args(&mut self, args: &[Node<Expr>], base: u16, out: &mut Body) -> CResult<Multiplicity> {
        if args.is_empty() {
            return Ok(Multiplicity::Fixed(0));
        }
        for (i, a) in args.iter().enumerate() {
            let reg = self.current().alloc_register();
            debug_assert_eq!(reg, base + i as u16);
            let is_last = i + 1 == args.len();
            if is_last {
                if let Some(mult) = self.compile_multi_tail(&a.node, reg, out)? {
                    return Ok(mult);
                }
            } else {
                self.compile_expr(a, reg, out)?;
            }
        }
        Ok(Multiplicity::Fixed(args.len() as u16))
    }
}

fn arith_op(op: BinaryOp) -> Option<ArithOp> {
    Some(match op {
        BinaryOp::Add => ArithOp::Add,
        BinaryOp::Sub => ArithOp::Sub,
        BinaryOp::Mul => ArithOp::Mul,
        BinaryOp::Div => ArithOp::Div,
        BinaryOp::FloorDiv => ArithOp::FloorDiv,
        BinaryOp::Mod => ArithOp::Mod,
        BinaryOp::Pow => ArithOp::Pow,
        BinaryOp::Concat => ArithOp::Concat,
        BinaryOp::BAnd => ArithOp::Band,
        BinaryOp::BOr => ArithOp::Bor,
        BinaryOp::BXor => ArithOp::Bxor,
        BinaryOp::Shl => ArithOp::Shl,
        BinaryOp::Shr => ArithOp::Shr,
        _ => return None,
    })
}

fn cmp_op(op: BinaryOp) -> Option<CmpOp> {
    Some(match op {
        BinaryOp::Eq => CmpOp::Eq,
        BinaryOp::NotEq => CmpOp::NotEq,
        BinaryOp::Lt => CmpOp::Lt,
        BinaryOp::Le => CmpOp::Le,
        BinaryOp::Gt => CmpOp::Gt,
        BinaryOp::Ge => CmpOp::Ge,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    fn compile(src: &str) -> Prototype {
        let block = Parser::parse(src).unwrap();
        Compiler::compile_chunk(&block, "test").unwrap()
    }

    #[test]
    fn compiles_arithmetic_to_a_temp_register() {
        let proto = compile("return 1 + 2");
        assert!(proto.instructions.iter().any(|i| matches!(i, Instr::Arith(ArithOp::Add, ..))));
    }

    #[test]
    fn short_circuit_and_compiles_to_test_and() {
        let proto = compile("return a and b");
        assert!(proto.instructions.iter().any(|i| matches!(i, Instr::TestAnd(..))));
    }

    #[test]
    fn while_loop_embeds_condition_and_body() {
        let proto = compile("while true do break end");
        assert!(matches!(proto.instructions[1], Instr::WhileLoop(..)));
    }

    #[test]
    fn local_function_closure_has_one_nested_prototype() {
        let proto = compile("local function f() return 1 end");
        assert_eq!(proto.prototypes.len(), 1);
    }

    #[test]
    fn sequential_locals_bind_to_the_values_list_registers() {
        // Guards against double-allocating registers for `local` bindings:
        // `b`'s initializer must read `a`'s actual register (0), not a
        // register one past the one the value was written to.
        let proto = compile("local a = 1 + 2\nlocal b = a\nreturn 0");
        let moves: Vec<_> = proto
            .instructions
            .iter()
            .filter_map(|i| if let Instr::Move(dest, src) = i { Some((*dest, *src)) } else { None })
            .collect();
        assert_eq!(moves, vec![(1, 0)]);
    }

    #[test]
    fn local_after_nontrivial_expression_reuses_scratch_registers() {
        // `a`'s initializer needs scratch registers above its own (1 + 2
        // needs two temporaries); `b` must still land on register 1, not
        // wherever that scratch use left `next_register`.
        let proto = compile("local a = 1 + 2\nlocal b = 10");
        assert!(proto.instructions.iter().any(|i| matches!(i, Instr::LoadConst(1, Value::Integer(10)))));
    }
}
