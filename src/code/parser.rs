//! Recursive-descent parser for the page code dialect.

use super::ast::*;
use super::lexer::{Lexer, Tok, Token};
use super::CodeError;

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(src: &str, line_offset: u32) -> Result<Self, CodeError> {
        let tokens = Lexer::new(src, line_offset).tokenize()?;
        Ok(Parser { tokens, pos: 0 })
    }

    fn peek(&self) -> &Tok {
        &self.tokens[self.pos].tok
    }

    fn peek_at(&self, offset: usize) -> &Tok {
        self.tokens
            .get(self.pos + offset)
            .map(|t| &t.tok)
            .unwrap_or(&Tok::Eof)
    }

    fn span(&self) -> Span {
        let token = &self.tokens[self.pos.min(self.tokens.len() - 1)];
        Span::new(token.line, token.column)
    }

    fn bump(&mut self) -> Tok {
        let tok = self.tokens[self.pos].tok.clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == tok {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: Tok, what: &str) -> Result<(), CodeError> {
        if self.peek() == &tok {
            self.bump();
            Ok(())
        } else {
            Err(self.error(format!("expected {what}, found {:?}", self.peek())))
        }
    }

    fn error(&self, message: impl Into<String>) -> CodeError {
        let span = self.span();
        CodeError {
            message: message.into(),
            line: span.line,
            column: span.column,
        }
    }

    fn skip_newlines(&mut self) {
        while matches!(self.peek(), Tok::Newline) {
            self.bump();
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    /// Parse a whole module (the page code section).
    pub fn parse_module(mut self) -> Result<Vec<Stmt>, CodeError> {
        let mut body = Vec::new();
        self.skip_newlines();

        while !matches!(self.peek(), Tok::Eof) {
            body.push(self.parse_statement()?);
            self.skip_newlines();
        }

        Ok(body)
    }

    /// Parse a single expression, requiring all input to be consumed.
    pub fn parse_expression_only(mut self) -> Result<Expr, CodeError> {
        self.skip_newlines();
        let expr = self.parse_expr()?;
        self.skip_newlines();

        if !matches!(self.peek(), Tok::Eof) {
            return Err(self.error("unexpected trailing input after expression"));
        }

        Ok(expr)
    }

    fn parse_statement(&mut self) -> Result<Stmt, CodeError> {
        let span = self.span();

        match self.peek() {
            Tok::At | Tok::Def => self.parse_func_def().map(|f| Stmt {
                span: f.span,
                kind: StmtKind::FuncDef(f),
            }),
            Tok::If => self.parse_if(),
            Tok::For => self.parse_for(),
            Tok::While => self.parse_while(),
            Tok::Return => {
                self.bump();
                let value = if matches!(self.peek(), Tok::Newline | Tok::Eof) {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                self.end_simple_statement()?;
                Ok(Stmt {
                    kind: StmtKind::Return(value),
                    span,
                })
            }
            Tok::Pass => {
                self.bump();
                self.end_simple_statement()?;
                Ok(Stmt {
                    kind: StmtKind::Pass,
                    span,
                })
            }
            Tok::Break => {
                self.bump();
                self.end_simple_statement()?;
                Ok(Stmt {
                    kind: StmtKind::Break,
                    span,
                })
            }
            Tok::Continue => {
                self.bump();
                self.end_simple_statement()?;
                Ok(Stmt {
                    kind: StmtKind::Continue,
                    span,
                })
            }
            _ => self.parse_small_statement(),
        }
    }

    /// Assignment, augmented assignment, or bare expression.
    fn parse_small_statement(&mut self) -> Result<Stmt, CodeError> {
        let span = self.span();
        let expr = self.parse_expr()?;

        let kind = match self.peek() {
            Tok::Assign => {
                self.bump();
                let target = self.expr_to_target(expr)?;
                let value = self.parse_expr()?;
                StmtKind::Assign { target, value }
            }
            Tok::PlusAssign | Tok::MinusAssign | Tok::StarAssign | Tok::SlashAssign => {
                let op = match self.bump() {
                    Tok::PlusAssign => BinOp::Add,
                    Tok::MinusAssign => BinOp::Sub,
                    Tok::StarAssign => BinOp::Mul,
                    Tok::SlashAssign => BinOp::Div,
                    _ => unreachable!(),
                };
                let target = self.expr_to_target(expr)?;
                let value = self.parse_expr()?;
                StmtKind::AugAssign { target, op, value }
            }
            _ => StmtKind::Expr(expr),
        };

        self.end_simple_statement()?;
        Ok(Stmt { kind, span })
    }

    fn end_simple_statement(&mut self) -> Result<(), CodeError> {
        match self.peek() {
            Tok::Newline => {
                self.bump();
                Ok(())
            }
            Tok::Eof | Tok::Dedent => Ok(()),
            other => Err(self.error(format!("unexpected {other:?} after statement"))),
        }
    }

    fn expr_to_target(&self, expr: Expr) -> Result<Target, CodeError> {
        match expr.kind {
            ExprKind::Name(name) => Ok(Target::Name(name)),
            ExprKind::Attr { value, attr } => Ok(Target::Attr {
                value: *value,
                attr,
            }),
            ExprKind::Index { value, index } => Ok(Target::Index {
                value: *value,
                index: *index,
            }),
            _ => Err(CodeError {
                message: "invalid assignment target".into(),
                line: expr.span.line,
                column: expr.span.column,
            }),
        }
    }

    fn parse_block(&mut self) -> Result<Vec<Stmt>, CodeError> {
        self.expect(Tok::Colon, "':'")?;
        self.expect(Tok::Newline, "newline after ':'")?;
        self.skip_newlines();
        self.expect(Tok::Indent, "an indented block")?;

        let mut body = Vec::new();
        self.skip_newlines();
        while !matches!(self.peek(), Tok::Dedent | Tok::Eof) {
            body.push(self.parse_statement()?);
            self.skip_newlines();
        }
        self.eat(&Tok::Dedent);

        Ok(body)
    }

    fn parse_if(&mut self) -> Result<Stmt, CodeError> {
        let span = self.span();
        self.expect(Tok::If, "'if'")?;

        let mut branches = vec![(self.parse_expr()?, self.parse_block()?)];
        let mut orelse = Vec::new();

        loop {
            self.skip_newlines();
            match self.peek() {
                Tok::Elif => {
                    self.bump();
                    branches.push((self.parse_expr()?, self.parse_block()?));
                }
                Tok::Else => {
                    self.bump();
                    orelse = self.parse_block()?;
                    break;
                }
                _ => break,
            }
        }

        Ok(Stmt {
            kind: StmtKind::If { branches, orelse },
            span,
        })
    }

    fn parse_for(&mut self) -> Result<Stmt, CodeError> {
        let span = self.span();
        self.expect(Tok::For, "'for'")?;

        let targets = self.parse_loop_targets()?;
        self.expect(Tok::In, "'in'")?;
        let iter = self.parse_expr()?;
        let body = self.parse_block()?;

        Ok(Stmt {
            kind: StmtKind::For {
                targets,
                iter,
                body,
            },
            span,
        })
    }

    pub(super) fn parse_loop_targets(&mut self) -> Result<Vec<String>, CodeError> {
        let mut targets = Vec::new();
        let parenthesized = self.eat(&Tok::LParen);

        loop {
            match self.bump() {
                Tok::Name(name) => targets.push(name),
                other => return Err(self.error(format!("expected loop variable, found {other:?}"))),
            }
            if !self.eat(&Tok::Comma) {
                break;
            }
        }

        if parenthesized {
            self.expect(Tok::RParen, "')'")?;
        }

        Ok(targets)
    }

    fn parse_while(&mut self) -> Result<Stmt, CodeError> {
        let span = self.span();
        self.expect(Tok::While, "'while'")?;
        let cond = self.parse_expr()?;
        let body = self.parse_block()?;

        Ok(Stmt {
            kind: StmtKind::While { cond, body },
            span,
        })
    }

    fn parse_func_def(&mut self) -> Result<FuncDef, CodeError> {
        let mut decorators = Vec::new();
        while self.eat(&Tok::At) {
            match self.bump() {
                Tok::Name(name) => decorators.push(name),
                other => return Err(self.error(format!("expected decorator name, found {other:?}"))),
            }
            self.skip_newlines();
        }

        let span = self.span();
        self.expect(Tok::Def, "'def'")?;

        let name = match self.bump() {
            Tok::Name(name) => name,
            other => return Err(self.error(format!("expected function name, found {other:?}"))),
        };

        self.expect(Tok::LParen, "'('")?;
        let mut params = Vec::new();
        while !matches!(self.peek(), Tok::RParen) {
            let var_kw = self.eat(&Tok::StarStar);
            let pname = match self.bump() {
                Tok::Name(n) => n,
                other => return Err(self.error(format!("expected parameter name, found {other:?}"))),
            };
            let default = if !var_kw && self.eat(&Tok::Assign) {
                Some(self.parse_expr()?)
            } else {
                None
            };
            params.push(Param {
                name: pname,
                default,
                var_kw,
            });
            if !self.eat(&Tok::Comma) {
                break;
            }
        }
        self.expect(Tok::RParen, "')'")?;

        let body = self.parse_block()?;

        Ok(FuncDef {
            name,
            params,
            body,
            decorators,
            span,
        })
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    pub(super) fn parse_expr(&mut self) -> Result<Expr, CodeError> {
        self.parse_ternary()
    }

    fn parse_ternary(&mut self) -> Result<Expr, CodeError> {
        let then = self.parse_or()?;

        if matches!(self.peek(), Tok::If) {
            let span = then.span;
            self.bump();
            let cond = self.parse_or()?;
            self.expect(Tok::Else, "'else' in conditional expression")?;
            let other = self.parse_ternary()?;

            return Ok(Expr {
                kind: ExprKind::Ternary {
                    cond: Box::new(cond),
                    then: Box::new(then),
                    other: Box::new(other),
                },
                span,
            });
        }

        Ok(then)
    }

    fn parse_or(&mut self) -> Result<Expr, CodeError> {
        let first = self.parse_and()?;
        if !matches!(self.peek(), Tok::Or) {
            return Ok(first);
        }

        let span = first.span;
        let mut values = vec![first];
        while self.eat(&Tok::Or) {
            values.push(self.parse_and()?);
        }

        Ok(Expr {
            kind: ExprKind::Bool {
                op: BoolOp::Or,
                values,
            },
            span,
        })
    }

    fn parse_and(&mut self) -> Result<Expr, CodeError> {
        let first = self.parse_not()?;
        if !matches!(self.peek(), Tok::And) {
            return Ok(first);
        }

        let span = first.span;
        let mut values = vec![first];
        while self.eat(&Tok::And) {
            values.push(self.parse_not()?);
        }

        Ok(Expr {
            kind: ExprKind::Bool {
                op: BoolOp::And,
                values,
            },
            span,
        })
    }

    fn parse_not(&mut self) -> Result<Expr, CodeError> {
        if matches!(self.peek(), Tok::Not) {
            let span = self.span();
            self.bump();
            let operand = self.parse_not()?;
            return Ok(Expr {
                kind: ExprKind::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
                span,
            });
        }

        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, CodeError> {
        let left = self.parse_arith()?;
        let mut ops = Vec::new();

        loop {
            let op = match self.peek() {
                Tok::Eq => CmpOp::Eq,
                Tok::Ne => CmpOp::Ne,
                Tok::Lt => CmpOp::Lt,
                Tok::Le => CmpOp::Le,
                Tok::Gt => CmpOp::Gt,
                Tok::Ge => CmpOp::Ge,
                Tok::In => CmpOp::In,
                Tok::Is => {
                    if matches!(self.peek_at(1), Tok::Not) {
                        self.bump();
                        CmpOp::IsNot
                    } else {
                        CmpOp::Is
                    }
                }
                Tok::Not if matches!(self.peek_at(1), Tok::In) => {
                    self.bump();
                    CmpOp::NotIn
                }
                _ => break,
            };
            self.bump();
            ops.push((op, self.parse_arith()?));
        }

        if ops.is_empty() {
            return Ok(left);
        }

        let span = left.span;
        Ok(Expr {
            kind: ExprKind::Compare {
                left: Box::new(left),
                ops,
            },
            span,
        })
    }

    fn parse_arith(&mut self) -> Result<Expr, CodeError> {
        let mut left = self.parse_term()?;

        loop {
            let op = match self.peek() {
                Tok::Plus => BinOp::Add,
                Tok::Minus => BinOp::Sub,
                _ => break,
            };
            self.bump();
            let right = self.parse_term()?;
            let span = left.span;
            left = Expr {
                kind: ExprKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            };
        }

        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr, CodeError> {
        let mut left = self.parse_factor()?;

        loop {
            let op = match self.peek() {
                Tok::Star => BinOp::Mul,
                Tok::Slash => BinOp::Div,
                Tok::SlashSlash => BinOp::FloorDiv,
                Tok::Percent => BinOp::Mod,
                _ => break,
            };
            self.bump();
            let right = self.parse_factor()?;
            let span = left.span;
            left = Expr {
                kind: ExprKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            };
        }

        Ok(left)
    }

    fn parse_factor(&mut self) -> Result<Expr, CodeError> {
        match self.peek() {
            Tok::Minus => {
                let span = self.span();
                self.bump();
                let operand = self.parse_factor()?;
                Ok(Expr {
                    kind: ExprKind::Unary {
                        op: UnaryOp::Neg,
                        operand: Box::new(operand),
                    },
                    span,
                })
            }
            Tok::Plus => {
                self.bump();
                self.parse_factor()
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr, CodeError> {
        let mut expr = self.parse_atom()?;

        loop {
            match self.peek() {
                Tok::Dot => {
                    self.bump();
                    let attr = match self.bump() {
                        Tok::Name(name) => name,
                        other => {
                            return Err(self.error(format!("expected attribute name, found {other:?}")))
                        }
                    };
                    let span = expr.span;
                    expr = Expr {
                        kind: ExprKind::Attr {
                            value: Box::new(expr),
                            attr,
                        },
                        span,
                    };
                }
                Tok::LParen => {
                    self.bump();
                    let (args, kwargs) = self.parse_call_args()?;
                    let span = expr.span;
                    expr = Expr {
                        kind: ExprKind::Call {
                            func: Box::new(expr),
                            args,
                            kwargs,
                        },
                        span,
                    };
                }
                Tok::LBracket => {
                    self.bump();
                    let index = self.parse_expr()?;
                    self.expect(Tok::RBracket, "']'")?;
                    let span = expr.span;
                    expr = Expr {
                        kind: ExprKind::Index {
                            value: Box::new(expr),
                            index: Box::new(index),
                        },
                        span,
                    };
                }
                _ => break,
            }
        }

        Ok(expr)
    }

    fn parse_call_args(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>), CodeError> {
        let mut args = Vec::new();
        let mut kwargs = Vec::new();

        while !matches!(self.peek(), Tok::RParen) {
            // Keyword argument: name=expr
            if let (Tok::Name(name), Tok::Assign) = (self.peek(), self.peek_at(1)) {
                let name = name.clone();
                self.bump();
                self.bump();
                kwargs.push((name, self.parse_expr()?));
            } else {
                if !kwargs.is_empty() {
                    return Err(self.error("positional argument follows keyword argument"));
                }
                args.push(self.parse_expr()?);
            }
            if !self.eat(&Tok::Comma) {
                break;
            }
        }
        self.expect(Tok::RParen, "')'")?;

        Ok((args, kwargs))
    }

    fn parse_atom(&mut self) -> Result<Expr, CodeError> {
        let span = self.span();

        let kind = match self.bump() {
            Tok::None => ExprKind::Literal(Literal::None),
            Tok::True => ExprKind::Literal(Literal::Bool(true)),
            Tok::False => ExprKind::Literal(Literal::Bool(false)),
            Tok::Int(value) => ExprKind::Literal(Literal::Int(value)),
            Tok::Float(value) => ExprKind::Literal(Literal::Float(value)),
            Tok::Str(value) => ExprKind::Literal(Literal::Str(value)),
            Tok::Name(name) => ExprKind::Name(name),
            Tok::LParen => {
                let first = self.parse_expr()?;
                if self.eat(&Tok::Comma) {
                    let mut items = vec![first];
                    while !matches!(self.peek(), Tok::RParen) {
                        items.push(self.parse_expr()?);
                        if !self.eat(&Tok::Comma) {
                            break;
                        }
                    }
                    self.expect(Tok::RParen, "')'")?;
                    ExprKind::Tuple(items)
                } else {
                    self.expect(Tok::RParen, "')'")?;
                    return Ok(first);
                }
            }
            Tok::LBracket => {
                let mut items = Vec::new();
                while !matches!(self.peek(), Tok::RBracket) {
                    items.push(self.parse_expr()?);
                    if !self.eat(&Tok::Comma) {
                        break;
                    }
                }
                self.expect(Tok::RBracket, "']'")?;
                ExprKind::List(items)
            }
            Tok::LBrace => {
                let mut pairs = Vec::new();
                while !matches!(self.peek(), Tok::RBrace) {
                    let key = self.parse_expr()?;
                    self.expect(Tok::Colon, "':' in dict literal")?;
                    let value = self.parse_expr()?;
                    pairs.push((key, value));
                    if !self.eat(&Tok::Comma) {
                        break;
                    }
                }
                self.expect(Tok::RBrace, "'}'")?;
                ExprKind::Dict(pairs)
            }
            other => return Err(self.error(format!("unexpected {other:?} in expression"))),
        };

        Ok(Expr { kind, span })
    }
}
