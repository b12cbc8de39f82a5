//! Tree-walking evaluator for the page code dialect.
//!
//! A [`Machine`] executes expressions and statement blocks against a page's
//! state map plus a stack of local frames. Name resolution order is
//! locals, then page state, then page methods (call position only), then
//! builtins. Assignment to a bare name writes page state when the name is a
//! declared state field, otherwise the innermost local frame.

use indexmap::IndexMap;
use std::collections::HashSet;

use super::value::Value;
use crate::code::ast::*;
use crate::compile::Method;

const MAX_CALL_DEPTH: usize = 64;

#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub name: String,
    pub line: u32,
}

/// A runtime failure, carrying the page-source line and the call stack at
/// the point of failure.
#[derive(Debug, Clone)]
pub struct EvalError {
    pub message: String,
    pub line: u32,
    pub trace: Vec<TraceFrame>,
}

impl std::fmt::Display for EvalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for EvalError {}

/// Non-linear control flow escaping a statement block.
#[derive(Debug)]
pub enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

/// Stack of local frames. The bottom frame belongs to the current method
/// body; render loops push extra frames for their loop variables.
#[derive(Debug, Default)]
pub struct Locals {
    frames: Vec<IndexMap<String, Value>>,
}

impl Locals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self) {
        self.frames.push(IndexMap::new());
    }

    pub fn pop(&mut self) {
        self.frames.pop();
    }

    pub fn push_frame(&mut self, frame: IndexMap<String, Value>) {
        self.frames.push(frame);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.frames.iter().rev().find_map(|f| f.get(name))
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.frames.iter_mut().rev().find_map(|f| f.get_mut(name))
    }

    pub fn set(&mut self, name: &str, value: Value) {
        for frame in self.frames.iter_mut().rev() {
            if frame.contains_key(name) {
                frame.insert(name.to_string(), value);
                return;
            }
        }
        if let Some(frame) = self.frames.last_mut() {
            frame.insert(name.to_string(), value);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }
}

/// One path segment of an assignable place.
enum Seg {
    Attr(String),
    Index(Value),
}

pub struct Machine<'a> {
    pub methods: &'a IndexMap<String, Method>,
    pub state_names: &'a HashSet<String>,
    /// Captured `print` output, drained by the caller after each dispatch.
    pub console: Vec<String>,
    stack: Vec<TraceFrame>,
    depth: usize,
}

impl<'a> Machine<'a> {
    pub fn new(methods: &'a IndexMap<String, Method>, state_names: &'a HashSet<String>) -> Self {
        Machine {
            methods,
            state_names,
            console: Vec::new(),
            stack: Vec::new(),
            depth: 0,
        }
    }

    fn fail(&self, span: Span, message: impl Into<String>) -> EvalError {
        EvalError {
            message: message.into(),
            line: span.line,
            trace: self.stack.clone(),
        }
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    pub fn eval(
        &mut self,
        expr: &Expr,
        state: &mut IndexMap<String, Value>,
        locals: &mut Locals,
    ) -> Result<Value, EvalError> {
        match &expr.kind {
            ExprKind::Literal(lit) => Ok(match lit {
                Literal::None => Value::None,
                Literal::Bool(b) => Value::Bool(*b),
                Literal::Int(i) => Value::Int(*i),
                Literal::Float(f) => Value::Float(*f),
                Literal::Str(s) => Value::Str(s.clone()),
            }),
            ExprKind::Name(name) => {
                if let Some(value) = locals.get(name) {
                    return Ok(value.clone());
                }
                if let Some(value) = state.get(name) {
                    return Ok(value.clone());
                }
                Err(self.fail(expr.span, format!("name '{name}' is not defined")))
            }
            ExprKind::Attr { value, attr } => {
                let base = self.eval(value, state, locals)?;
                match base {
                    Value::Dict(pairs) => pairs.get(attr).cloned().ok_or_else(|| {
                        self.fail(expr.span, format!("dict has no attribute '{attr}'"))
                    }),
                    other => Err(self.fail(
                        expr.span,
                        format!("'{}' object has no attribute '{attr}'", other.type_name()),
                    )),
                }
            }
            ExprKind::Index { value, index } => {
                let base = self.eval(value, state, locals)?;
                let key = self.eval(index, state, locals)?;
                self.index_value(&base, &key, expr.span)
            }
            ExprKind::Call { func, args, kwargs } => self.eval_call(expr, func, args, kwargs, state, locals),
            ExprKind::Unary { op, operand } => {
                let value = self.eval(operand, state, locals)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!value.truthy())),
                    UnaryOp::Neg => match value {
                        Value::Int(i) => Ok(Value::Int(-i)),
                        Value::Float(f) => Ok(Value::Float(-f)),
                        Value::Bool(b) => Ok(Value::Int(-(b as i64))),
                        other => Err(self.fail(
                            expr.span,
                            format!("bad operand type for unary -: '{}'", other.type_name()),
                        )),
                    },
                }
            }
            ExprKind::Binary { op, left, right } => {
                let lhs = self.eval(left, state, locals)?;
                let rhs = self.eval(right, state, locals)?;
                self.binary(*op, lhs, rhs, expr.span)
            }
            ExprKind::Bool { op, values } => {
                let mut last = Value::None;
                for (i, value) in values.iter().enumerate() {
                    last = self.eval(value, state, locals)?;
                    let truthy = last.truthy();
                    let short = match op {
                        BoolOp::And => !truthy,
                        BoolOp::Or => truthy,
                    };
                    if short && i + 1 < values.len() {
                        return Ok(last);
                    }
                }
                Ok(last)
            }
            ExprKind::Compare { left, ops } => {
                let mut lhs = self.eval(left, state, locals)?;
                for (op, right) in ops {
                    let rhs = self.eval(right, state, locals)?;
                    if !self.compare(*op, &lhs, &rhs, expr.span)? {
                        return Ok(Value::Bool(false));
                    }
                    lhs = rhs;
                }
                Ok(Value::Bool(true))
            }
            ExprKind::Ternary { cond, then, other } => {
                if self.eval(cond, state, locals)?.truthy() {
                    self.eval(then, state, locals)
                } else {
                    self.eval(other, state, locals)
                }
            }
            ExprKind::List(items) | ExprKind::Tuple(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval(item, state, locals)?);
                }
                Ok(Value::List(out))
            }
            ExprKind::Dict(pairs) => {
                let mut out = IndexMap::with_capacity(pairs.len());
                for (key, value) in pairs {
                    let key = self.eval(key, state, locals)?.to_display();
                    let value = self.eval(value, state, locals)?;
                    out.insert(key, value);
                }
                Ok(Value::Dict(out))
            }
        }
    }

    fn index_value(&self, base: &Value, key: &Value, span: Span) -> Result<Value, EvalError> {
        match (base, key) {
            (Value::List(items), Value::Int(i)) => {
                let len = items.len() as i64;
                let idx = if *i < 0 { len + i } else { *i };
                items
                    .get(idx as usize)
                    .cloned()
                    .ok_or_else(|| self.fail(span, format!("list index {i} out of range")))
            }
            (Value::Dict(pairs), key) => {
                let key = key.to_display();
                pairs
                    .get(&key)
                    .cloned()
                    .ok_or_else(|| self.fail(span, format!("KeyError: '{key}'")))
            }
            (Value::Str(s), Value::Int(i)) => {
                let chars: Vec<char> = s.chars().collect();
                let len = chars.len() as i64;
                let idx = if *i < 0 { len + i } else { *i };
                chars
                    .get(idx as usize)
                    .map(|c| Value::Str(c.to_string()))
                    .ok_or_else(|| self.fail(span, format!("string index {i} out of range")))
            }
            (base, _) => Err(self.fail(
                span,
                format!("'{}' object is not subscriptable", base.type_name()),
            )),
        }
    }

    fn binary(&self, op: BinOp, lhs: Value, rhs: Value, span: Span) -> Result<Value, EvalError> {
        use BinOp::*;

        // String / list forms first.
        match (&op, &lhs, &rhs) {
            (Add, Value::Str(a), Value::Str(b)) => return Ok(Value::Str(format!("{a}{b}"))),
            (Add, Value::List(a), Value::List(b)) => {
                let mut out = a.clone();
                out.extend(b.iter().cloned());
                return Ok(Value::List(out));
            }
            (Mul, Value::Str(s), Value::Int(n)) | (Mul, Value::Int(n), Value::Str(s)) => {
                return Ok(Value::Str(s.repeat((*n).max(0) as usize)));
            }
            (Mul, Value::List(l), Value::Int(n)) | (Mul, Value::Int(n), Value::List(l)) => {
                let mut out = Vec::new();
                for _ in 0..(*n).max(0) {
                    out.extend(l.iter().cloned());
                }
                return Ok(Value::List(out));
            }
            _ => {}
        }

        // Integer arithmetic stays integral except true division.
        if let (Some(a), Some(b)) = (lhs.as_int(), rhs.as_int()) {
            if !matches!(lhs, Value::Float(_)) && !matches!(rhs, Value::Float(_)) {
                return match op {
                    Add => Ok(Value::Int(a.wrapping_add(b))),
                    Sub => Ok(Value::Int(a.wrapping_sub(b))),
                    Mul => Ok(Value::Int(a.wrapping_mul(b))),
                    Div => {
                        if b == 0 {
                            Err(self.fail(span, "division by zero"))
                        } else {
                            Ok(Value::Float(a as f64 / b as f64))
                        }
                    }
                    FloorDiv => {
                        if b == 0 {
                            Err(self.fail(span, "division by zero"))
                        } else {
                            Ok(Value::Int(a.div_euclid(b)))
                        }
                    }
                    Mod => {
                        if b == 0 {
                            Err(self.fail(span, "division by zero"))
                        } else {
                            Ok(Value::Int(a.rem_euclid(b)))
                        }
                    }
                };
            }
        }

        match (lhs.as_float(), rhs.as_float()) {
            (Some(a), Some(b)) => match op {
                Add => Ok(Value::Float(a + b)),
                Sub => Ok(Value::Float(a - b)),
                Mul => Ok(Value::Float(a * b)),
                Div => {
                    if b == 0.0 {
                        Err(self.fail(span, "division by zero"))
                    } else {
                        Ok(Value::Float(a / b))
                    }
                }
                FloorDiv => {
                    if b == 0.0 {
                        Err(self.fail(span, "division by zero"))
                    } else {
                        Ok(Value::Float((a / b).floor()))
                    }
                }
                Mod => {
                    if b == 0.0 {
                        Err(self.fail(span, "division by zero"))
                    } else {
                        Ok(Value::Float(a.rem_euclid(b)))
                    }
                }
            },
            _ => Err(self.fail(
                span,
                format!(
                    "unsupported operand types: '{}' and '{}'",
                    lhs.type_name(),
                    rhs.type_name()
                ),
            )),
        }
    }

    fn compare(&self, op: CmpOp, lhs: &Value, rhs: &Value, span: Span) -> Result<bool, EvalError> {
        use std::cmp::Ordering;

        Ok(match op {
            CmpOp::Eq => lhs == rhs,
            CmpOp::Ne => lhs != rhs,
            CmpOp::Is => match (lhs, rhs) {
                (Value::None, Value::None) => true,
                (Value::Bool(a), Value::Bool(b)) => a == b,
                _ => lhs == rhs && lhs.type_name() == rhs.type_name(),
            },
            CmpOp::IsNot => !self.compare(CmpOp::Is, lhs, rhs, span)?,
            CmpOp::In => rhs
                .contains(lhs)
                .ok_or_else(|| self.fail(span, format!("argument of type '{}' is not iterable", rhs.type_name())))?,
            CmpOp::NotIn => !self.compare(CmpOp::In, lhs, rhs, span)?,
            CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
                let ordering = lhs.order_with(rhs).ok_or_else(|| {
                    self.fail(
                        span,
                        format!(
                            "'<' not supported between '{}' and '{}'",
                            lhs.type_name(),
                            rhs.type_name()
                        ),
                    )
                })?;
                match op {
                    CmpOp::Lt => ordering == Ordering::Less,
                    CmpOp::Le => ordering != Ordering::Greater,
                    CmpOp::Gt => ordering == Ordering::Greater,
                    CmpOp::Ge => ordering != Ordering::Less,
                    _ => unreachable!(),
                }
            }
        })
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    fn eval_call(
        &mut self,
        expr: &Expr,
        func: &Expr,
        args: &[Expr],
        kwargs: &[(String, Expr)],
        state: &mut IndexMap<String, Value>,
        locals: &mut Locals,
    ) -> Result<Value, EvalError> {
        let mut arg_values = Vec::with_capacity(args.len());
        for arg in args {
            arg_values.push(self.eval(arg, state, locals)?);
        }
        let mut kwarg_values = IndexMap::new();
        for (name, arg) in kwargs {
            kwarg_values.insert(name.clone(), self.eval(arg, state, locals)?);
        }

        match &func.kind {
            ExprKind::Name(name) => {
                if self.methods.contains_key(name.as_str()) {
                    return self.call_method(name, arg_values, kwarg_values, state, expr.span);
                }
                self.call_builtin(name, arg_values, kwarg_values, expr.span)
            }
            ExprKind::Attr { value, attr } => {
                // Method call on a value. Mutating methods resolve the
                // receiver as a place so the mutation lands in state.
                self.call_value_method(value, attr, arg_values, kwarg_values, state, locals, expr.span)
            }
            _ => Err(self.fail(expr.span, "expression is not callable")),
        }
    }

    /// Invoke a page method by name. Shared with the event dispatcher.
    pub fn call_method(
        &mut self,
        name: &str,
        args: Vec<Value>,
        kwargs: IndexMap<String, Value>,
        state: &mut IndexMap<String, Value>,
        span: Span,
    ) -> Result<Value, EvalError> {
        let method = match self.methods.get(name) {
            Some(Method::User(func)) => func.clone(),
            Some(_) => {
                return Err(self.fail(span, format!("'{name}' is not directly callable")))
            }
            None => return Err(self.fail(span, format!("name '{name}' is not defined"))),
        };

        if self.depth >= MAX_CALL_DEPTH {
            return Err(self.fail(span, "maximum recursion depth exceeded"));
        }

        let mut frame = IndexMap::new();
        let positional: Vec<&Param> = method.params.iter().filter(|p| !p.var_kw).collect();

        if args.len() > positional.len() {
            return Err(self.fail(
                span,
                format!(
                    "{name}() takes {} arguments but {} were given",
                    positional.len(),
                    args.len()
                ),
            ));
        }

        let mut kwargs = kwargs;
        for (i, param) in positional.iter().enumerate() {
            let value = if i < args.len() {
                args[i].clone()
            } else if let Some(value) = kwargs.shift_remove(&param.name) {
                value
            } else if let Some(default) = &param.default {
                let mut empty = Locals::new();
                empty.push();
                self.eval(default, state, &mut empty)?
            } else {
                return Err(self.fail(
                    span,
                    format!("{name}() missing required argument: '{}'", param.name),
                ));
            };
            frame.insert(param.name.clone(), value);
        }

        if let Some(catch_all) = method.params.iter().find(|p| p.var_kw) {
            frame.insert(catch_all.name.clone(), Value::Dict(kwargs));
        } else if !kwargs.is_empty() {
            let unexpected = kwargs.keys().next().cloned().unwrap_or_default();
            return Err(self.fail(
                span,
                format!("{name}() got an unexpected keyword argument '{unexpected}'"),
            ));
        }

        self.depth += 1;
        self.stack.push(TraceFrame {
            name: name.to_string(),
            line: method.span.line,
        });

        let mut locals = Locals::new();
        locals.push_frame(frame);
        let flow = self.exec_block(&method.body, state, &mut locals)?;

        self.stack.pop();
        self.depth -= 1;

        Ok(match flow {
            Flow::Return(value) => value,
            _ => Value::None,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn call_value_method(
        &mut self,
        receiver: &Expr,
        method: &str,
        args: Vec<Value>,
        kwargs: IndexMap<String, Value>,
        state: &mut IndexMap<String, Value>,
        locals: &mut Locals,
        span: Span,
    ) -> Result<Value, EvalError> {
        let mutating = matches!(
            method,
            "append" | "pop" | "insert" | "remove" | "reverse" | "sort" | "update" | "clear"
        );

        if mutating {
            let segs = self.flatten_place(receiver, state, locals)?;
            if let Some((root, segs)) = segs {
                // Borrow dance: look the root up in locals first, then state.
                if locals.contains(&root) {
                    let mut stash = locals.get(&root).cloned().unwrap();
                    let target = navigate(&mut stash, &segs)
                        .ok_or_else(|| self.fail(span, "invalid receiver for mutation"))?;
                    let result = self.value_method(target, method, args, kwargs, span)?;
                    locals.set(&root, stash);
                    return Ok(result);
                }
                if state.contains_key(&root) {
                    let mut stash = state.get(&root).cloned().unwrap();
                    let target = navigate(&mut stash, &segs)
                        .ok_or_else(|| self.fail(span, "invalid receiver for mutation"))?;
                    let result = self.value_method(target, method, args, kwargs, span)?;
                    state.insert(root, stash);
                    return Ok(result);
                }
            }
            // Non-place receiver: mutate a temporary, discarding the effect.
            let mut value = self.eval(receiver, state, locals)?;
            return self.value_method(&mut value, method, args, kwargs, span);
        }

        let mut value = self.eval(receiver, state, locals)?;
        self.value_method(&mut value, method, args, kwargs, span)
    }

    /// Reduce an expression to a mutable place: `(root name, path segments)`.
    /// Returns `None` if the expression is not rooted in a name.
    fn flatten_place(
        &mut self,
        expr: &Expr,
        state: &mut IndexMap<String, Value>,
        locals: &mut Locals,
    ) -> Result<Option<(String, Vec<Seg>)>, EvalError> {
        match &expr.kind {
            ExprKind::Name(name) => Ok(Some((name.clone(), Vec::new()))),
            ExprKind::Attr { value, attr } => {
                let Some((root, mut segs)) = self.flatten_place(value, state, locals)? else {
                    return Ok(None);
                };
                segs.push(Seg::Attr(attr.clone()));
                Ok(Some((root, segs)))
            }
            ExprKind::Index { value, index } => {
                let Some((root, mut segs)) = self.flatten_place(value, state, locals)? else {
                    return Ok(None);
                };
                let key = self.eval(index, state, locals)?;
                segs.push(Seg::Index(key));
                Ok(Some((root, segs)))
            }
            _ => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    pub fn exec_block(
        &mut self,
        stmts: &[Stmt],
        state: &mut IndexMap<String, Value>,
        locals: &mut Locals,
    ) -> Result<Flow, EvalError> {
        for stmt in stmts {
            match self.exec(stmt, state, locals)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec(
        &mut self,
        stmt: &Stmt,
        state: &mut IndexMap<String, Value>,
        locals: &mut Locals,
    ) -> Result<Flow, EvalError> {
        match &stmt.kind {
            StmtKind::Assign { target, value } => {
                let value = self.eval(value, state, locals)?;
                self.assign(target, value, state, locals, stmt.span)?;
                Ok(Flow::Normal)
            }
            StmtKind::AugAssign { target, op, value } => {
                let rhs = self.eval(value, state, locals)?;
                let current = self.read_target(target, state, locals, stmt.span)?;
                let updated = self.binary(*op, current, rhs, stmt.span)?;
                self.assign(target, updated, state, locals, stmt.span)?;
                Ok(Flow::Normal)
            }
            StmtKind::Expr(expr) => {
                self.eval(expr, state, locals)?;
                Ok(Flow::Normal)
            }
            StmtKind::If { branches, orelse } => {
                for (cond, body) in branches {
                    if self.eval(cond, state, locals)?.truthy() {
                        return self.exec_block(body, state, locals);
                    }
                }
                self.exec_block(orelse, state, locals)
            }
            StmtKind::For {
                targets,
                iter,
                body,
            } => {
                let iterable = self.eval(iter, state, locals)?;
                let items = iterable.iterate().ok_or_else(|| {
                    self.fail(
                        stmt.span,
                        format!("'{}' object is not iterable", iterable.type_name()),
                    )
                })?;

                locals.push();
                for item in items {
                    bind_loop_targets(targets, item, locals, stmt.span, &self.stack)?;
                    match self.exec_block(body, state, locals)? {
                        Flow::Normal => {}
                        Flow::Break => break,
                        Flow::Continue => continue,
                        Flow::Return(value) => {
                            locals.pop();
                            return Ok(Flow::Return(value));
                        }
                    }
                }
                locals.pop();
                Ok(Flow::Normal)
            }
            StmtKind::While { cond, body } => {
                let mut guard = 0usize;
                while self.eval(cond, state, locals)?.truthy() {
                    guard += 1;
                    if guard > 1_000_000 {
                        return Err(self.fail(stmt.span, "while loop exceeded iteration limit"));
                    }
                    match self.exec_block(body, state, locals)? {
                        Flow::Normal => {}
                        Flow::Break => break,
                        Flow::Continue => continue,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                    }
                }
                Ok(Flow::Normal)
            }
            StmtKind::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr, state, locals)?,
                    None => Value::None,
                };
                Ok(Flow::Return(value))
            }
            StmtKind::Break => Ok(Flow::Break),
            StmtKind::Continue => Ok(Flow::Continue),
            StmtKind::Pass => Ok(Flow::Normal),
            StmtKind::FuncDef(func) => Err(self.fail(
                func.span,
                "nested function definitions are not supported",
            )),
        }
    }

    fn read_target(
        &mut self,
        target: &Target,
        state: &mut IndexMap<String, Value>,
        locals: &mut Locals,
        span: Span,
    ) -> Result<Value, EvalError> {
        match target {
            Target::Name(name) => {
                if let Some(value) = locals.get(name) {
                    Ok(value.clone())
                } else if let Some(value) = state.get(name) {
                    Ok(value.clone())
                } else {
                    Err(self.fail(span, format!("name '{name}' is not defined")))
                }
            }
            Target::Attr { value, attr } => {
                let base = self.eval(value, state, locals)?;
                match base {
                    Value::Dict(pairs) => pairs
                        .get(attr)
                        .cloned()
                        .ok_or_else(|| self.fail(span, format!("dict has no attribute '{attr}'"))),
                    other => Err(self.fail(
                        span,
                        format!("'{}' object has no attribute '{attr}'", other.type_name()),
                    )),
                }
            }
            Target::Index { value, index } => {
                let base = self.eval(value, state, locals)?;
                let key = self.eval(index, state, locals)?;
                self.index_value(&base, &key, span)
            }
        }
    }

    pub fn assign(
        &mut self,
        target: &Target,
        value: Value,
        state: &mut IndexMap<String, Value>,
        locals: &mut Locals,
        span: Span,
    ) -> Result<(), EvalError> {
        match target {
            Target::Name(name) => {
                if locals.contains(name) {
                    locals.set(name, value);
                } else if locals.is_empty() || self.state_names.contains(name) || state.contains_key(name) {
                    state.insert(name.clone(), value);
                } else {
                    locals.set(name, value);
                }
                Ok(())
            }
            Target::Attr {
                value: base,
                attr,
            } => {
                let Some((root, mut segs)) = self.flatten_place(base, state, locals)? else {
                    return Err(self.fail(span, "cannot assign to this expression"));
                };
                segs.push(Seg::Attr(attr.clone()));
                self.write_place(&root, &segs, value, state, locals, span)
            }
            Target::Index { value: base, index } => {
                let Some((root, mut segs)) = self.flatten_place(base, state, locals)? else {
                    return Err(self.fail(span, "cannot assign to this expression"));
                };
                let key = self.eval(index, state, locals)?;
                segs.push(Seg::Index(key));
                self.write_place(&root, &segs, value, state, locals, span)
            }
        }
    }

    fn write_place(
        &mut self,
        root: &str,
        segs: &[Seg],
        value: Value,
        state: &mut IndexMap<String, Value>,
        locals: &mut Locals,
        span: Span,
    ) -> Result<(), EvalError> {
        let in_locals = locals.contains(root);
        let mut stash = if in_locals {
            locals.get(root).cloned().unwrap()
        } else if let Some(existing) = state.get(root) {
            existing.clone()
        } else {
            return Err(self.fail(span, format!("name '{root}' is not defined")));
        };

        write_into(&mut stash, segs, value)
            .map_err(|message| self.fail(span, message))?;

        if in_locals {
            locals.set(root, stash);
        } else {
            state.insert(root.to_string(), stash);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Builtins and value methods live in `builtins.rs`.
    // ------------------------------------------------------------------

    fn call_builtin(
        &mut self,
        name: &str,
        args: Vec<Value>,
        kwargs: IndexMap<String, Value>,
        span: Span,
    ) -> Result<Value, EvalError> {
        super::builtins::call(self, name, args, kwargs, span)
    }

    fn value_method(
        &mut self,
        receiver: &mut Value,
        method: &str,
        args: Vec<Value>,
        kwargs: IndexMap<String, Value>,
        span: Span,
    ) -> Result<Value, EvalError> {
        super::builtins::value_method(self, receiver, method, args, kwargs, span)
    }

    pub(super) fn fail_at(&self, span: Span, message: impl Into<String>) -> EvalError {
        self.fail(span, message)
    }

    pub fn take_console(&mut self) -> Vec<String> {
        std::mem::take(&mut self.console)
    }

    pub fn trace(&self) -> &[TraceFrame] {
        &self.stack
    }
}

pub(crate) fn bind_loop_targets(
    targets: &[String],
    item: Value,
    locals: &mut Locals,
    span: Span,
    stack: &[TraceFrame],
) -> Result<(), EvalError> {
    if targets.len() == 1 {
        locals.set(&targets[0], item);
        return Ok(());
    }

    match item {
        Value::List(items) if items.len() == targets.len() => {
            for (target, value) in targets.iter().zip(items) {
                locals.set(target, value);
            }
            Ok(())
        }
        other => Err(EvalError {
            message: format!(
                "cannot unpack '{}' into {} loop variables",
                other.type_name(),
                targets.len()
            ),
            line: span.line,
            trace: stack.to_vec(),
        }),
    }
}

fn navigate<'v>(value: &'v mut Value, segs: &[Seg]) -> Option<&'v mut Value> {
    let mut current = value;
    for seg in segs {
        current = match (seg, current) {
            (Seg::Attr(name), Value::Dict(pairs)) => pairs.get_mut(name)?,
            (Seg::Index(Value::Int(i)), Value::List(items)) => {
                let len = items.len() as i64;
                let idx = if *i < 0 { len + i } else { *i };
                items.get_mut(idx as usize)?
            }
            (Seg::Index(key), Value::Dict(pairs)) => pairs.get_mut(&key.to_display())?,
            _ => return None,
        };
    }
    Some(current)
}

fn write_into(root: &mut Value, segs: &[Seg], value: Value) -> Result<(), String> {
    if segs.is_empty() {
        *root = value;
        return Ok(());
    }

    let (last, init) = segs.split_last().expect("segs is non-empty");
    let parent = navigate(root, init).ok_or("cannot assign to this expression")?;

    match (last, parent) {
        (Seg::Attr(name), Value::Dict(pairs)) => {
            pairs.insert(name.clone(), value);
            Ok(())
        }
        (Seg::Index(key), Value::Dict(pairs)) => {
            pairs.insert(key.to_display(), value);
            Ok(())
        }
        (Seg::Index(Value::Int(i)), Value::List(items)) => {
            let len = items.len() as i64;
            let idx = if *i < 0 { len + i } else { *i };
            match items.get_mut(idx as usize) {
                Some(slot) => {
                    *slot = value;
                    Ok(())
                }
                None => Err(format!("list index {i} out of range")),
            }
        }
        _ => Err("cannot assign to this expression".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{parse_expression, parse_module};
    use crate::compile::Method;

    fn run(src: &str) -> IndexMap<String, Value> {
        let module = parse_module(src, 0).unwrap();
        let mut methods = IndexMap::new();
        let mut state_names = HashSet::new();
        let mut init = Vec::new();

        for stmt in module {
            match stmt.kind {
                StmtKind::FuncDef(func) => {
                    state_names.insert(func.name.clone());
                    methods.insert(func.name.clone(), Method::User(func));
                }
                _ => {
                    if let StmtKind::Assign {
                        target: Target::Name(name),
                        ..
                    } = &stmt.kind
                    {
                        state_names.insert(name.clone());
                    }
                    init.push(stmt);
                }
            }
        }

        let mut state = IndexMap::new();
        let mut machine = Machine::new(&methods, &state_names);
        let mut locals = Locals::new();
        machine.exec_block(&init, &mut state, &mut locals).unwrap();

        // Invoke `main` if defined, mimicking a dispatched handler.
        if machine.methods.contains_key("main") {
            machine
                .call_method("main", vec![], IndexMap::new(), &mut state, Span::default())
                .unwrap();
        }

        state
    }

    fn eval_str(expr: &str) -> Value {
        let expr = parse_expression(expr).unwrap();
        let methods = IndexMap::new();
        let state_names = HashSet::new();
        let mut machine = Machine::new(&methods, &state_names);
        let mut state = IndexMap::new();
        let mut locals = Locals::new();
        machine.eval(&expr, &mut state, &mut locals).unwrap()
    }

    #[test]
    fn arithmetic_and_precedence() {
        assert_eq!(eval_str("1 + 2 * 3"), Value::Int(7));
        assert_eq!(eval_str("7 // 2"), Value::Int(3));
        assert_eq!(eval_str("7 / 2"), Value::Float(3.5));
        assert_eq!(eval_str("7 % 3"), Value::Int(1));
    }

    #[test]
    fn short_circuit_returns_operand() {
        assert_eq!(eval_str("'' or 'fallback'"), Value::Str("fallback".into()));
        assert_eq!(eval_str("0 and 1"), Value::Int(0));
    }

    #[test]
    fn comparison_chains() {
        assert_eq!(eval_str("1 < 2 < 3"), Value::Bool(true));
        assert_eq!(eval_str("1 < 2 > 5"), Value::Bool(false));
        assert_eq!(eval_str("'a' in 'cat'"), Value::Bool(true));
        assert_eq!(eval_str("3 not in [1, 2]"), Value::Bool(true));
    }

    #[test]
    fn handler_mutates_state() {
        let state = run(indoc::indoc! {"
            count = 0

            def main():
                count += 5
        "});
        assert_eq!(state["count"], Value::Int(5));
    }

    #[test]
    fn locals_do_not_leak_into_state() {
        let state = run(indoc::indoc! {"
            total = 0

            def main():
                scratch = 10
                total = scratch + 1
        "});
        assert_eq!(state["total"], Value::Int(11));
        assert!(!state.contains_key("scratch"));
    }

    #[test]
    fn list_mutation_through_place() {
        let state = run(indoc::indoc! {"
            items = [1, 2]

            def main():
                items.append(3)
        "});
        assert_eq!(
            state["items"],
            Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
    }

    #[test]
    fn nested_index_assignment() {
        let state = run(indoc::indoc! {"
            user = {'name': 'Ada', 'tags': ['x']}

            def main():
                user['name'] = 'Grace'
                user.tags[0] = 'y'
        "});
        let Value::Dict(user) = &state["user"] else { panic!() };
        assert_eq!(user["name"], Value::Str("Grace".into()));
        assert_eq!(user["tags"], Value::List(vec![Value::Str("y".into())]));
    }

    #[test]
    fn for_loop_with_unpacking() {
        let state = run(indoc::indoc! {"
            pairs = [[1, 'a'], [2, 'b']]
            out = ''

            def main():
                for n, s in pairs:
                    out = out + s + str(n)
        "});
        assert_eq!(state["out"], Value::Str("a1b2".into()));
    }

    #[test]
    fn return_and_recursion() {
        let state = run(indoc::indoc! {"
            result = 0

            def fib(n):
                if n < 2:
                    return n
                return fib(n - 1) + fib(n - 2)

            def main():
                result = fib(10)
        "});
        assert_eq!(state["result"], Value::Int(55));
    }

    #[test]
    fn undefined_name_errors_with_line() {
        let module = parse_module("x = missing + 1", 0).unwrap();
        let methods = IndexMap::new();
        let state_names = HashSet::new();
        let mut machine = Machine::new(&methods, &state_names);
        let mut state = IndexMap::new();
        let mut locals = Locals::new();
        let err = machine
            .exec_block(&module, &mut state, &mut locals)
            .unwrap_err();
        assert!(err.message.contains("missing"));
        assert_eq!(err.line, 1);
    }

    #[test]
    fn print_is_captured() {
        let module = parse_module("print('hello', 42)", 0).unwrap();
        let methods = IndexMap::new();
        let state_names = HashSet::new();
        let mut machine = Machine::new(&methods, &state_names);
        let mut state = IndexMap::new();
        let mut locals = Locals::new();
        machine.exec_block(&module, &mut state, &mut locals).unwrap();
        assert_eq!(machine.take_console(), vec!["hello 42".to_string()]);
    }
}
