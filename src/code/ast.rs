//! AST definitions for the page code dialect.

/// Source position, in coordinates of the *original* page source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub line: u32,
    pub column: u32,
}

impl Span {
    pub fn new(line: u32, column: u32) -> Self {
        Span { line, column }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Literal(Literal),
    Name(String),
    Attr {
        value: Box<Expr>,
        attr: String,
    },
    Index {
        value: Box<Expr>,
        index: Box<Expr>,
    },
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Bool {
        op: BoolOp,
        values: Vec<Expr>,
    },
    /// Chained comparison, e.g. `0 <= x < 10`.
    Compare {
        left: Box<Expr>,
        ops: Vec<(CmpOp, Expr)>,
    },
    /// `then if cond else other`
    Ternary {
        cond: Box<Expr>,
        then: Box<Expr>,
        other: Box<Expr>,
    },
    List(Vec<Expr>),
    Tuple(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    Is,
    IsNot,
}

/// Assignment target. Tuple targets only occur in `for` loops.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Name(String),
    Attr { value: Expr, attr: String },
    Index { value: Expr, index: Expr },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub default: Option<Expr>,
    /// True for a `**kwargs` catch-all parameter.
    pub var_kw: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FuncDef {
    pub name: String,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
    pub decorators: Vec<String>,
    pub span: Span,
}

impl FuncDef {
    /// Does this function declare a `**kwargs` catch-all?
    pub fn has_var_kw(&self) -> bool {
        self.params.iter().any(|p| p.var_kw)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Assign {
        target: Target,
        value: Expr,
    },
    AugAssign {
        target: Target,
        op: BinOp,
        value: Expr,
    },
    Expr(Expr),
    If {
        /// `if` plus any `elif` arms, in order.
        branches: Vec<(Expr, Vec<Stmt>)>,
        orelse: Vec<Stmt>,
    },
    For {
        targets: Vec<String>,
        iter: Expr,
        body: Vec<Stmt>,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
    },
    Return(Option<Expr>),
    Break,
    Continue,
    Pass,
    FuncDef(FuncDef),
}

/// Collect every bare name referenced anywhere in an expression.
pub fn collect_names(expr: &Expr, out: &mut Vec<String>) {
    match &expr.kind {
        ExprKind::Name(name) => out.push(name.clone()),
        ExprKind::Literal(_) => {}
        ExprKind::Attr { value, .. } => collect_names(value, out),
        ExprKind::Index { value, index } => {
            collect_names(value, out);
            collect_names(index, out);
        }
        ExprKind::Call { func, args, kwargs } => {
            collect_names(func, out);
            for arg in args {
                collect_names(arg, out);
            }
            for (_, arg) in kwargs {
                collect_names(arg, out);
            }
        }
        ExprKind::Unary { operand, .. } => collect_names(operand, out),
        ExprKind::Binary { left, right, .. } => {
            collect_names(left, out);
            collect_names(right, out);
        }
        ExprKind::Bool { values, .. } => {
            for value in values {
                collect_names(value, out);
            }
        }
        ExprKind::Compare { left, ops } => {
            collect_names(left, out);
            for (_, right) in ops {
                collect_names(right, out);
            }
        }
        ExprKind::Ternary { cond, then, other } => {
            collect_names(cond, out);
            collect_names(then, out);
            collect_names(other, out);
        }
        ExprKind::List(items) | ExprKind::Tuple(items) => {
            for item in items {
                collect_names(item, out);
            }
        }
        ExprKind::Dict(pairs) => {
            for (key, value) in pairs {
                collect_names(key, out);
                collect_names(value, out);
            }
        }
    }
}
