//! Executor (C7): a tree-walking register machine that interprets a
//! `Prototype`'s embedded-tree instruction list against a `State`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::compiler::{ArithOp, Body, CmpOp, Instr, Multiplicity, Prototype, UnOp};
use crate::error::{LuaError, Result, RuntimeError};
use crate::heap::{CallFrameInfo, State};
use crate::resolver::UpvalueSource;
use crate::value::{Cell, LuaClosure, TableRef, Value};

struct Frame {
    registers: Vec<Value>,
    cells: HashMap<u16, Cell>,
    upvalues: Vec<Cell>,
    varargs: Vec<Value>,
    proto: Rc<Prototype>,
    /// One past the last register written by the most recent multi-value
    /// producing instruction (a call, `...`, or nested multi result); only
    /// meaningful immediately after such an instruction.
    top: u16,
}

impl Frame {
    fn new(proto: Rc<Prototype>, upvalues: Vec<Cell>, args: &[Value]) -> Self {
        let reg_count = (proto.max_registers as usize).max(proto.param_count as usize);
        let mut registers = vec![Value::Nil; reg_count];
        for i in 0..proto.param_count as usize {
            if let Some(v) = args.get(i) {
                registers[i] = v.clone();
            }
        }
        let varargs = if proto.is_vararg && args.len() > proto.param_count as usize {
            args[proto.param_count as usize..].to_vec()
        } else {
            Vec::new()
        };
        let mut cells = HashMap::new();
        for &reg in &proto.captured_registers {
            let initial = registers.get(reg as usize).cloned().unwrap_or(Value::Nil);
            cells.insert(reg, Rc::new(RefCell::new(initial)));
        }
        Frame { registers, cells, upvalues, varargs, proto, top: 0 }
    }

    fn ensure_len(&mut self, upto: usize) {
        if self.registers.len() <= upto {
            self.registers.resize(upto + 1, Value::Nil);
        }
    }

    fn get(&self, r: u16) -> Value {
        if let Some(cell) = self.cells.get(&r) {
            return cell.borrow().clone();
        }
        self.registers.get(r as usize).cloned().unwrap_or(Value::Nil)
    }

    fn set(&mut self, r: u16, v: Value) {
        if let Some(cell) = self.cells.get(&r) {
            *cell.borrow_mut() = v;
            return;
        }
        self.ensure_len(r as usize);
        self.registers[r as usize] = v;
    }

    fn slice(&self, base: u16, count: u16) -> Vec<Value> {
        (0..count).map(|i| self.get(base + i)).collect()
    }
}

/// What a just-executed instruction (or instruction body) wants the
/// surrounding control-flow to do next.
enum Flow {
    Normal,
    Break,
    Return(Vec<Value>),
    Goto(String),
}

pub struct Executor {
    pub state: State,
    frames: Vec<Frame>,
}

impl Executor {
    pub fn new(state: State) -> Self {
        Executor { state, frames: Vec::new() }
    }

    /// Runs a top-level chunk prototype (no upvalues, varargs from `args`).
    pub fn run_chunk(&mut self, proto: Rc<Prototype>, args: &[Value]) -> Result<Vec<Value>> {
        self.call_prototype(proto, Vec::new(), args)
    }

    fn call_prototype(&mut self, proto: Rc<Prototype>, upvalues: Vec<Cell>, args: &[Value]) -> Result<Vec<Value>> {
        if self.frames.len() >= self.state.config.limits.call_stack_limit {
            return Err(LuaError::Runtime(RuntimeError::StackOverflow));
        }
        let name = proto.name.clone();
        let source = proto.source.clone();
        if self.state.config.debug {
            eprintln!("call: {}", name.as_deref().unwrap_or("<anonymous>"));
        }
        self.state.call_stack.push(CallFrameInfo { source, line: 0, name });
        self.frames.push(Frame::new(proto.clone(), upvalues, args));
        let result = self.run_body(&proto.instructions);
        self.frames.pop();
        self.state.call_stack.pop();
        match result? {
            Flow::Return(values) => {
                if self.state.config.debug {
                    eprintln!("return: {} value(s)", values.len());
                }
                Ok(values)
            }
            _ => Ok(Vec::new()),
        }
    }

    pub fn call_function(&mut self, callee: Value, args: &[Value]) -> Result<Vec<Value>> {
        self.call_depth_guarded(callee, args, 0)
    }

    fn call_depth_guarded(&mut self, callee: Value, args: &[Value], call_chain: u8) -> Result<Vec<Value>> {
        if call_chain > 64 {
            return Err(LuaError::Runtime(RuntimeError::NotCallable));
        }
        match callee {
            Value::Closure(c) => self.call_prototype(c.proto.clone(), c.upvalues.clone(), args),
            Value::Native(n) => {
                let f = n.func.clone();
                (f)(self, args)
            }
            Value::Table(t) => {
                if let Some(call_fn) = self.metamethod(t, "__call") {
                    let mut new_args = Vec::with_capacity(args.len() + 1);
                    new_args.push(Value::Table(t));
                    new_args.extend_from_slice(args);
                    self.call_depth_guarded(call_fn, &new_args, call_chain + 1)
                } else {
                    Err(LuaError::Runtime(RuntimeError::NotCallable))
                }
            }
            _ => Err(LuaError::Runtime(RuntimeError::NotCallable)),
        }
    }

    fn metamethod(&self, t: TableRef, name: &str) -> Option<Value> {
        let table = self.state.get_table(t)?;
        let mt_ref = table.metatable?;
        let mt = self.state.get_table(mt_ref)?;
        let v = mt.get(&Value::str(name));
        if v.is_nil() { None } else { Some(v) }
    }

    fn check_budget(&mut self) -> Result<()> {
        self.state.instructions_run += 1;
        if self.state.instructions_run > self.state.config.limits.instruction_limit {
            return Err(LuaError::Runtime(RuntimeError::InstructionLimit(self.state.instructions_run)));
        }
        Ok(())
    }

    fn run_body(&mut self, body: &Body) -> Result<Flow> {
        let mut i = 0usize;
        while i < body.len() {
            match self.exec_instr(&body[i])? {
                Flow::Normal => i += 1,
                Flow::Goto(name) => {
                    if let Some(pos) = body.iter().position(|ins| matches!(ins, Instr::Label(l) if *l == name)) {
                        i = pos + 1;
                    } else {
                        return Ok(Flow::Goto(name));
                    }
                }
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    fn frame(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("no active frame")
    }

    fn exec_instr(&mut self, instr: &Instr) -> Result<Flow> {
        self.check_budget()?;
        match instr {
            Instr::LoadConst(d, v) => {
                self.frame().set(*d, v.clone());
                Ok(Flow::Normal)
            }
            Instr::LoadBool(d, b) => {
                self.frame().set(*d, Value::Bool(*b));
                Ok(Flow::Normal)
            }
            Instr::LoadNil(d, count) => {
                for i in 0..*count {
                    self.frame().set(d + i, Value::Nil);
                }
                Ok(Flow::Normal)
            }
            Instr::Move(d, s) => {
                let v = self.frame().get(*s);
                self.frame().set(*d, v);
                Ok(Flow::Normal)
            }
            Instr::Arith(op, d, a, b) => {
                let va = self.frame().get(*a);
                let vb = self.frame().get(*b);
                let result = self.arith(*op, &va, &vb)?;
                self.frame().set(*d, result);
                Ok(Flow::Normal)
            }
            Instr::Unary(op, d, s) => {
                let v = self.frame().get(*s);
                let result = self.unary(*op, &v)?;
                self.frame().set(*d, result);
                Ok(Flow::Normal)
            }
            Instr::Cmp(op, d, a, b) => {
                let va = self.frame().get(*a);
                let vb = self.frame().get(*b);
                let result = self.compare(*op, &va, &vb)?;
                self.frame().set(*d, Value::Bool(result));
                Ok(Flow::Normal)
            }
            Instr::GetGlobal(d, name) => {
                let v = self.state.get_global(name);
                self.frame().set(*d, v);
                Ok(Flow::Normal)
            }
            Instr::SetGlobal(name, s) => {
                let v = self.frame().get(*s);
                self.state.set_global(name.clone(), v);
                Ok(Flow::Normal)
            }
            Instr::GetUpvalue(d, idx) => {
                let v = self.frame().upvalues[*idx as usize].borrow().clone();
                self.frame().set(*d, v);
                Ok(Flow::Normal)
            }
            Instr::SetUpvalue(idx, s) => {
                let v = self.frame().get(*s);
                *self.frame().upvalues[*idx as usize].borrow_mut() = v;
                Ok(Flow::Normal)
            }
            Instr::GetOpenUpvalue(d, local_reg) => {
                let v = self.frame().get(*local_reg);
                self.frame().set(*d, v);
                Ok(Flow::Normal)
            }
            Instr::SetOpenUpvalue(local_reg, s) => {
                let v = self.frame().get(*s);
                self.frame().set(*local_reg, v);
                Ok(Flow::Normal)
            }
            Instr::NewTable(d, ..) => {
                let t = self.state.alloc_table();
                self.frame().set(*d, Value::Table(t));
                Ok(Flow::Normal)
            }
            Instr::GetField(d, tbl, name) => {
                let obj = self.frame().get(*tbl);
                let result = self.index_get(&obj, &Value::str(name.clone()))?;
                self.frame().set(*d, result);
                Ok(Flow::Normal)
            }
            Instr::SetField(tbl, name, s) => {
                let obj = self.frame().get(*tbl);
                let v = self.frame().get(*s);
                self.index_set(&obj, Value::str(name.clone()), v)?;
                Ok(Flow::Normal)
            }
            Instr::GetIndex(d, tbl, key) => {
                let obj = self.frame().get(*tbl);
                let k = self.frame().get(*key);
                let result = self.index_get(&obj, &k)?;
                self.frame().set(*d, result);
                Ok(Flow::Normal)
            }
            Instr::SetIndex(tbl, key, s) => {
                let obj = self.frame().get(*tbl);
                let k = self.frame().get(*key);
                let v = self.frame().get(*s);
                self.index_set(&obj, k, v)?;
                Ok(Flow::Normal)
            }
            Instr::SetList(tbl, base, mult, offset) => {
                let obj = self.frame().get(*tbl);
                let values = self.read_multi(*base, *mult);
                if let Value::Table(t) = obj {
                    let table = self.state.get_table_mut(t).expect("valid table ref");
                    for (i, v) in values.into_iter().enumerate() {
                        table.set(Value::Integer(*offset as i64 + i as i64), v);
                    }
                }
                Ok(Flow::Normal)
            }
            Instr::SelfOp(base, obj_reg, name) => {
                let obj = self.frame().get(*obj_reg);
                let method = self.index_get(&obj, &Value::str(name.clone()))?;
                self.frame().set(*base, method);
                self.frame().set(base + 1, obj);
                Ok(Flow::Normal)
            }
            Instr::Closure(d, idx) => {
                let nested = self.frame().proto.prototypes[*idx].clone();
                let mut upvalues = Vec::with_capacity(nested.upvalue_descriptors.len());
                for src in &nested.upvalue_descriptors {
                    let cell = match src {
                        UpvalueSource::Local(reg) => self
                            .frame()
                            .cells
                            .get(reg)
                            .cloned()
                            .unwrap_or_else(|| Rc::new(RefCell::new(Value::Nil))),
                        UpvalueSource::Upvalue(i) => self.frame().upvalues[*i as usize].clone(),
                    };
                    upvalues.push(cell);
                }
                let closure = Value::Closure(Rc::new(LuaClosure { proto: nested, upvalues }));
                self.frame().set(*d, closure);
                Ok(Flow::Normal)
            }
            Instr::Call(base, argc, resultc) => {
                let callee = self.frame().get(*base);
                let args = self.read_multi(base + 1, *argc);
                let results = self.call_function(callee, &args)?;
                match resultc {
                    Multiplicity::Fixed(n) => {
                        for i in 0..*n {
                            self.frame().set(base + i, results.get(i as usize).cloned().unwrap_or(Value::Nil));
                        }
                    }
                    Multiplicity::Multi => {
                        for (i, v) in results.iter().enumerate() {
                            self.frame().set(*base + i as u16, v.clone());
                        }
                        self.frame().top = base + results.len() as u16;
                    }
                }
                Ok(Flow::Normal)
            }
            Instr::Return(base, mult) => {
                let values = self.read_multi(*base, *mult);
                Ok(Flow::Return(values))
            }
            Instr::Vararg(d, mult) => {
                let varargs = self.frame().varargs.clone();
                match mult {
                    Multiplicity::Fixed(n) => {
                        for i in 0..*n {
                            self.frame().set(d + i, varargs.get(i as usize).cloned().unwrap_or(Value::Nil));
                        }
                    }
                    Multiplicity::Multi => {
                        for (i, v) in varargs.iter().enumerate() {
                            self.frame().set(*d + i as u16, v.clone());
                        }
                        self.frame().top = d + varargs.len() as u16;
                    }
                }
                Ok(Flow::Normal)
            }
            Instr::Test(cond, then_body, else_body) => {
                if self.frame().get(*cond).truthy() {
                    self.run_body(then_body)
                } else {
                    self.run_body(else_body)
                }
            }
            Instr::TestAnd(_dest, left, right_body) => {
                if self.frame().get(*left).truthy() {
                    self.run_body(right_body)
                } else {
                    Ok(Flow::Normal)
                }
            }
            Instr::TestOr(_dest, left, right_body) => {
                if !self.frame().get(*left).truthy() {
                    self.run_body(right_body)
                } else {
                    Ok(Flow::Normal)
                }
            }
            Instr::WhileLoop(cond_body, cond_reg, body) => {
                loop {
                    match self.run_body(cond_body)? {
                        Flow::Normal => {}
                        other => return Ok(other),
                    }
                    if !self.frame().get(*cond_reg).truthy() {
                        return Ok(Flow::Normal);
                    }
                    match self.run_body(body)? {
                        Flow::Normal => continue,
                        Flow::Break => return Ok(Flow::Normal),
                        other => return Ok(other),
                    }
                }
            }
            Instr::RepeatLoop(body, cond_body, cond_reg) => loop {
                match self.run_body(body)? {
                    Flow::Normal => {}
                    Flow::Break => return Ok(Flow::Normal),
                    other => return Ok(other),
                }
                match self.run_body(cond_body)? {
                    Flow::Normal => {}
                    other => return Ok(other),
                }
                if self.frame().get(*cond_reg).truthy() {
                    return Ok(Flow::Normal);
                }
            },
            Instr::NumericFor(base, loop_var, body) => self.exec_numeric_for(*base, *loop_var, body),
            Instr::GenericFor(base, var_count, body) => self.exec_generic_for(*base, *var_count, body),
            Instr::Break => Ok(Flow::Break),
            Instr::Goto(name) => Ok(Flow::Goto(name.clone())),
            Instr::Label(_) => Ok(Flow::Normal),
            Instr::SourceLine(line) => {
                if let Some(top) = self.state.call_stack.last_mut() {
                    top.line = *line;
                }
                Ok(Flow::Normal)
            }
        }
    }

    fn read_multi(&mut self, base: u16, mult: Multiplicity) -> Vec<Value> {
        match mult {
            Multiplicity::Fixed(n) => self.frame().slice(base, n),
            Multiplicity::Multi => {
                let top = self.frame().top;
                if top > base {
                    self.frame().slice(base, top - base)
                } else {
                    Vec::new()
                }
            }
        }
    }

    fn exec_numeric_for(&mut self, base: u16, loop_var: u16, body: &Body) -> Result<Flow> {
        let start = self.frame().get(base);
        let limit = self.frame().get(base + 1);
        let step = self.frame().get(base + 2);
        let all_ints = matches!(start, Value::Integer(_))
            && matches!(limit, Value::Integer(_))
            && matches!(step, Value::Integer(_));
        if all_ints {
            let (mut i, limit, step) = (
                as_int(&start).unwrap(),
                as_int(&limit).unwrap(),
                as_int(&step).unwrap(),
            );
            if step == 0 {
                return Err(LuaError::Runtime(RuntimeError::GenericError(Value::str("'for' step is zero"))));
            }
            loop {
                if step > 0 && i > limit {
                    break;
                }
                if step < 0 && i < limit {
                    break;
                }
                self.frame().set(loop_var, Value::Integer(i));
                match self.run_body(body)? {
                    Flow::Normal => {}
                    Flow::Break => break,
                    other => return Ok(other),
                }
                match i.checked_add(step) {
                    Some(n) => i = n,
                    None => break,
                }
            }
        } else {
            let (mut i, limit, step) = (
                start.as_f64().ok_or(num_err("'for' initial value"))?,
                limit.as_f64().ok_or(num_err("'for' limit"))?,
                step.as_f64().ok_or(num_err("'for' step"))?,
            );
            if step == 0.0 {
                return Err(LuaError::Runtime(RuntimeError::GenericError(Value::str("'for' step is zero"))));
            }
            loop {
                if step > 0.0 && i > limit {
                    break;
                }
                if step < 0.0 && i < limit {
                    break;
                }
                self.frame().set(loop_var, Value::Float(i));
                match self.run_body(body)? {
                    Flow::Normal => {}
                    Flow::Break => break,
                    other => return Ok(other),
                }
                i += step;
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_generic_for(&mut self, base: u16, var_count: u16, body: &Body) -> Result<Flow> {
        let iter_fn = self.frame().get(base);
        let state_val = self.frame().get(base + 1);
        let mut control = self.frame().get(base + 2);
        loop {
            let results = self.call_function(iter_fn.clone(), &[state_val.clone(), control.clone()])?;
            let first = results.first().cloned().unwrap_or(Value::Nil);
            if first.is_nil() {
                return Ok(Flow::Normal);
            }
            control = first;
            for i in 0..var_count {
                self.frame().set(base + 3 + i, results.get(i as usize).cloned().unwrap_or(Value::Nil));
            }
            match self.run_body(body)? {
                Flow::Normal => {}
                Flow::Break => return Ok(Flow::Normal),
                other => return Ok(other),
            }
        }
    }

    fn index_get(&mut self, obj: &Value, key: &Value) -> Result<Value> {
        match obj {
            Value::Table(t) => {
                let raw = self.state.get_table(*t).map(|tb| tb.get(key)).unwrap_or(Value::Nil);
                if !raw.is_nil() {
                    return Ok(raw);
                }
                match self.metamethod(*t, "__index") {
                    Some(Value::Table(_)) => {
                        let mm = self.metamethod(*t, "__index").unwrap();
                        self.index_get(&mm, key)
                    }
                    Some(f) if f.is_function() => Ok(self.call_function(f, &[obj.clone(), key.clone()])?.into_iter().next().unwrap_or(Value::Nil)),
                    _ => Ok(Value::Nil),
                }
            }
            Value::Str(_) => {
                if let Some(mt) = self.state.string_metatable() {
                    self.index_get(&Value::Table(mt), key)
                } else {
                    Ok(Value::Nil)
                }
            }
            Value::Nil => Err(LuaError::Runtime(RuntimeError::IndexError { value: obj.clone() })),
            _ => Ok(Value::Nil),
        }
    }

    fn index_set(&mut self, obj: &Value, key: Value, value: Value) -> Result<()> {
        match obj {
            Value::Table(t) => {
                let has_key = self.state.get_table(*t).map(|tb| !tb.get(&key).is_nil()).unwrap_or(false);
                if has_key {
                    self.state.get_table_mut(*t).unwrap().set(key, value);
                    return Ok(());
                }
                match self.metamethod(*t, "__newindex") {
                    Some(Value::Table(nt)) => self.index_set(&Value::Table(nt), key, value),
                    Some(f) if f.is_function() => {
                        self.call_function(f, &[obj.clone(), key, value])?;
                        Ok(())
                    }
                    _ => {
                        if key.is_nil() {
                            return Err(LuaError::Runtime(RuntimeError::GenericError(Value::str(
                                "table index is nil",
                            ))));
                        }
                        self.state.get_table_mut(*t).unwrap().set(key, value);
                        Ok(())
                    }
                }
            }
            Value::Nil => Err(LuaError::Runtime(RuntimeError::IndexError { value: obj.clone() })),
            _ => Err(LuaError::Runtime(RuntimeError::TypeError {
                operation: "index assignment".to_string(),
                got_type: obj.type_name().to_string(),
            })),
        }
    }

    fn table_arith_metamethod(&mut self, name: &str, a: &Value, b: &Value) -> Option<Value> {
        let t = match (a, b) {
            (Value::Table(t), _) => Some(*t),
            (_, Value::Table(t)) => Some(*t),
            _ => None,
        }?;
        let f = self.metamethod(t, name)?;
        self.call_function(f, &[a.clone(), b.clone()]).ok()?.into_iter().next()
    }

    fn arith(&mut self, op: ArithOp, a: &Value, b: &Value) -> Result<Value> {
        let (na, nb) = match (a.coerce_to_number(), b.coerce_to_number()) {
            (Some(x), Some(y)) => (x, y),
            _ => {
                let mm_name = arith_metamethod_name(op);
                if let Some(v) = self.table_arith_metamethod(mm_name, a, b) {
                    return Ok(v);
                }
                return Err(LuaError::Runtime(RuntimeError::ArithError {
                    op: format!("{op:?}"),
                    values: (a.type_name().to_string(), b.type_name().to_string()),
                }));
            }
        };
        use ArithOp::*;
        match op {
            Concat => {
                let sa = display_for_concat(a).ok_or_else(|| concat_err(a))?;
                let sb = display_for_concat(b).ok_or_else(|| concat_err(b))?;
                return Ok(Value::str(format!("{sa}{sb}")));
            }
            _ => {}
        }
        match (op, na, nb) {
            (Add, Value::Integer(x), Value::Integer(y)) => Ok(Value::Integer(x.wrapping_add(y))),
            (Sub, Value::Integer(x), Value::Integer(y)) => Ok(Value::Integer(x.wrapping_sub(y))),
            (Mul, Value::Integer(x), Value::Integer(y)) => Ok(Value::Integer(x.wrapping_mul(y))),
            (FloorDiv, Value::Integer(x), Value::Integer(y)) => {
                if y == 0 {
                    return Err(int_div_zero());
                }
                Ok(Value::Integer(int_floor_div(x, y)))
            }
            (Mod, Value::Integer(x), Value::Integer(y)) => {
                if y == 0 {
                    return Err(int_div_zero());
                }
                Ok(Value::Integer(int_floor_mod(x, y)))
            }
            (Band, Value::Integer(x), Value::Integer(y)) => Ok(Value::Integer(x & y)),
            (Bor, Value::Integer(x), Value::Integer(y)) => Ok(Value::Integer(x | y)),
            (Bxor, Value::Integer(x), Value::Integer(y)) => Ok(Value::Integer(x ^ y)),
            (Shl, Value::Integer(x), Value::Integer(y)) => Ok(Value::Integer(shift(x, y))),
            (Shr, Value::Integer(x), Value::Integer(y)) => Ok(Value::Integer(shift(x, -y))),
            (Div, _, _) => Ok(Value::Float(to_f64(&na) / to_f64(&nb))),
            (Pow, _, _) => Ok(Value::Float(to_f64(&na).powf(to_f64(&nb)))),
            (Add, _, _) => Ok(Value::Float(to_f64(&na) + to_f64(&nb))),
            (Sub, _, _) => Ok(Value::Float(to_f64(&na) - to_f64(&nb))),
            (Mul, _, _) => Ok(Value::Float(to_f64(&na) * to_f64(&nb))),
            (FloorDiv, _, _) => Ok(Value::Float((to_f64(&na) / to_f64(&nb)).floor())),
            (Mod, _, _) => {
                let (x, y) = (to_f64(&na), to_f64(&nb));
                let r = x - (x / y).floor() * y;
                Ok(Value::Float(r))
            }
            (Band | Bor | Bxor | Shl | Shr, _, _) => Err(LuaError::Runtime(RuntimeError::ArithError {
                op: format!("{op:?}"),
                values: ("float".to_string(), "float".to_string()),
            })),
            (Concat, ..) => unreachable!("handled above"),
        }
    }

    fn unary(&mut self, op: UnOp, v: &Value) -> Result<Value> {
        match op {
            UnOp::Not => Ok(Value::Bool(!v.truthy())),
            UnOp::Neg => match v.coerce_to_number() {
                Some(Value::Integer(n)) => Ok(Value::Integer(n.wrapping_neg())),
                Some(Value::Float(n)) => Ok(Value::Float(-n)),
                _ => {
                    if let Value::Table(t) = v {
                        if let Some(f) = self.metamethod(*t, "__unm") {
                            return Ok(self.call_function(f, &[v.clone(), v.clone()])?.into_iter().next().unwrap_or(Value::Nil));
                        }
                    }
                    Err(LuaError::Runtime(RuntimeError::TypeError {
                        operation: "negate".to_string(),
                        got_type: v.type_name().to_string(),
                    }))
                }
            },
            UnOp::Len => match v {
                Value::Str(s) => Ok(Value::Integer(s.len() as i64)),
                Value::Table(t) => Ok(Value::Integer(self.state.get_table(*t).map(|tb| tb.length()).unwrap_or(0))),
                _ => Err(LuaError::Runtime(RuntimeError::TypeError {
                    operation: "get length of".to_string(),
                    got_type: v.type_name().to_string(),
                })),
            },
            UnOp::Bnot => match v.as_i64() {
                Some(n) => Ok(Value::Integer(!n)),
                None => Err(LuaError::Runtime(RuntimeError::TypeError {
                    operation: "bitwise not".to_string(),
                    got_type: v.type_name().to_string(),
                })),
            },
        }
    }

    fn compare(&mut self, op: CmpOp, a: &Value, b: &Value) -> Result<bool> {
        match op {
            CmpOp::Eq => Ok(self.values_eq(a, b)?),
            CmpOp::NotEq => Ok(!self.values_eq(a, b)?),
            CmpOp::Lt => self.values_lt(a, b),
            CmpOp::Le => self.values_le(a, b),
            CmpOp::Gt => self.values_lt(b, a),
            CmpOp::Ge => self.values_le(b, a),
        }
    }

    fn values_eq(&mut self, a: &Value, b: &Value) -> Result<bool> {
        if a == b {
            return Ok(true);
        }
        if let (Value::Table(ta), Value::Table(_)) = (a, b) {
            if let Some(f) = self.metamethod(*ta, "__eq") {
                let r = self.call_function(f, &[a.clone(), b.clone()])?;
                return Ok(r.first().map(|v| v.truthy()).unwrap_or(false));
            }
        }
        Ok(false)
    }

    fn values_lt(&mut self, a: &Value, b: &Value) -> Result<bool> {
        match (a, b) {
            (Value::Integer(_) | Value::Float(_), Value::Integer(_) | Value::Float(_)) => {
                Ok(a.as_f64().unwrap() < b.as_f64().unwrap())
            }
            (Value::Str(x), Value::Str(y)) => Ok(x < y),
            (Value::Table(t), _) => {
                if let Some(f) = self.metamethod(*t, "__lt") {
                    let r = self.call_function(f, &[a.clone(), b.clone()])?;
                    return Ok(r.first().map(|v| v.truthy()).unwrap_or(false));
                }
                Err(order_err(a, b))
            }
            _ => Err(order_err(a, b)),
        }
    }

    fn values_le(&mut self, a: &Value, b: &Value) -> Result<bool> {
        match (a, b) {
            (Value::Integer(_) | Value::Float(_), Value::Integer(_) | Value::Float(_)) => {
                Ok(a.as_f64().unwrap() <= b.as_f64().unwrap())
            }
            (Value::Str(x), Value::Str(y)) => Ok(x <= y),
            (Value::Table(t), _) => {
                if let Some(f) = self.metamethod(*t, "__le") {
                    let r = self.call_function(f, &[a.clone(), b.clone()])?;
                    return Ok(r.first().map(|v| v.truthy()).unwrap_or(false));
                }
                Err(order_err(a, b))
            }
            _ => Err(order_err(a, b)),
        }
    }

    /// `tostring`-via-`__tostring` used by `print`/string coercion; falls
    /// back to `Value`'s `Display`.
    pub fn tostring(&mut self, v: &Value) -> Result<String> {
        if let Value::Table(t) = v {
            if let Some(f) = self.metamethod(*t, "__tostring") {
                let r = self.call_function(f, &[v.clone()])?;
                return Ok(r.into_iter().next().unwrap_or(Value::Nil).to_string());
            }
        }
        Ok(v.to_string())
    }
}

fn as_int(v: &Value) -> Option<i64> {
    match v {
        Value::Integer(n) => Some(*n),
        _ => None,
    }
}

fn to_f64(v: &Value) -> f64 {
    v.as_f64().unwrap_or(f64::NAN)
}

/// Lua 5.3 `//` on integers: `floor(x / y)`, not Rust's truncating division
/// or `div_euclid`'s always-nonnegative remainder convention.
fn int_floor_div(x: i64, y: i64) -> i64 {
    let q = x.wrapping_div(y);
    let r = x.wrapping_rem(y);
    if r != 0 && (r < 0) != (y < 0) {
        q - 1
    } else {
        q
    }
}

/// Lua 5.3 `%` on integers: `x - floor(x / y) * y`, sign follows `y`.
fn int_floor_mod(x: i64, y: i64) -> i64 {
    let r = x.wrapping_rem(y);
    if r != 0 && (r < 0) != (y < 0) {
        r.wrapping_add(y)
    } else {
        r
    }
}

fn shift(x: i64, by: i64) -> i64 {
    if by <= -64 || by >= 64 {
        0
    } else if by >= 0 {
        ((x as u64) << by) as i64
    } else {
        ((x as u64) >> (-by)) as i64
    }
}

fn display_for_concat(v: &Value) -> Option<String> {
    match v {
        Value::Str(_) | Value::Integer(_) | Value::Float(_) => Some(v.to_string()),
        _ => None,
    }
}

fn concat_err(v: &Value) -> LuaError {
    LuaError::Runtime(RuntimeError::TypeError { operation: "concatenate".to_string(), got_type: v.type_name().to_string() })
}

fn int_div_zero() -> LuaError {
    LuaError::Runtime(RuntimeError::GenericError(Value::str("attempt to perform 'n//0' or 'n%%0'")))
}

fn num_err(what: &str) -> LuaError {
    LuaError::Runtime(RuntimeError::GenericError(Value::str(format!("{what} must be a number"))))
}

fn order_err(a: &Value, b: &Value) -> LuaError {
    LuaError::Runtime(RuntimeError::ArithError {
        op: "compare".to_string(),
        values: (a.type_name().to_string(), b.type_name().to_string()),
    })
}

fn arith_metamethod_name(op: ArithOp) -> &'static str {
    match op {
        ArithOp::Add => "__add",
        ArithOp::Sub => "__sub",
        ArithOp::Mul => "__mul",
        ArithOp::Div => "__div",
        ArithOp::FloorDiv => "__idiv",
        ArithOp::Mod => "__mod",
        ArithOp::Pow => "__pow",
        ArithOp::Concat => "__concat",
        _ => "__add",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Compiler;
    use crate::heap::VMConfig;
    use crate::parser::Parser;

    fn run(src: &str) -> Vec<Value> {
        let block = Parser::parse(src).unwrap();
        let proto = Compiler::compile_chunk(&block, "test").unwrap();
        let mut exec = Executor::new(State::new(VMConfig::default()));
        exec.run_chunk(Rc::new(proto), &[]).unwrap()
    }

    #[test]
    fn arithmetic_precedence() {
        assert_eq!(run("return 1 + 2 * 3"), vec![Value::Integer(7)]);
    }

    #[test]
    fn table_length_and_index() {
        assert_eq!(run("local t={1,2,3}; return #t + t[2]"), vec![Value::Integer(5)]);
    }

    #[test]
    fn closures_share_upvalue_cell() {
        let result = run(
            "local function mk(n) return function() n=n+1; return n end end\nlocal c=mk(10); c(); c(); return c()",
        );
        assert_eq!(result, vec![Value::Integer(13)]);
    }

    #[test]
    fn numeric_for_accumulates() {
        assert_eq!(run("local s=0; for i=1,10 do s=s+i end; return s"), vec![Value::Integer(55)]);
    }

    #[test]
    fn global_recursion() {
        let result = run("factorial = function(n) if n<=1 then return 1 end; return n*factorial(n-1) end; return factorial(5)");
        assert_eq!(result, vec![Value::Integer(120)]);
    }

    #[test]
    fn tables_are_reference_shared() {
        let result = run("local a={}; local b=a; b.x=1; return a.x");
        assert_eq!(result, vec![Value::Integer(1)]);
    }

    #[test]
    fn short_circuit_or_skips_side_effect() {
        let result = run("local hit=false; local function f() hit=true; return true end\nlocal x = true or f(); return hit");
        assert_eq!(result, vec![Value::Bool(false)]);
    }
}
