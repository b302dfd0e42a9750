//! Recursive-descent parser.

use super::ast::{ExceptHandler, Expr, ExprKind, Module, Stmt, StmtKind};
use super::lexer::{Token, TokenKind};
use super::CompileError;
use crate::bytecode::{BinaryOp, CompareOp, UnaryOp};

const KEYWORDS: &[&str] = &[
    "def", "class", "if", "elif", "else", "while", "for", "in", "break", "continue", "try",
    "except", "as", "return", "raise", "assert", "pass", "global", "nonlocal", "import", "yield",
    "and", "or", "not", "is", "None", "True", "False",
];

pub fn is_keyword(name: &str) -> bool {
    KEYWORDS.contains(&name)
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    pub fn parse_module(mut self) -> Result<Module, CompileError> {
        let mut body = Vec::new();
        while !self.at(&TokenKind::Eof) {
            if self.eat(&TokenKind::Newline) {
                continue;
            }
            body.push(self.statement()?);
        }
        Ok(Module { body })
    }

    fn peek(&self) -> &TokenKind {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].kind
    }

    fn peek_at(&self, ahead: usize) -> &TokenKind {
        &self.tokens[(self.pos + ahead).min(self.tokens.len() - 1)].kind
    }

    fn line(&self) -> u32 {
        self.tokens[self.pos.min(self.tokens.len() - 1)].line
    }

    fn advance(&mut self) -> TokenKind {
        let kind = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        kind
    }

    fn at(&self, kind: &TokenKind) -> bool {
        self.peek() == kind
    }

    fn at_op(&self, op: &str) -> bool {
        matches!(self.peek(), TokenKind::Op(o) if *o == op)
    }

    fn at_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), TokenKind::Name(n) if n == kw)
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.at(kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.at_op(op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.at_keyword(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn error<T>(&self, message: impl Into<String>) -> Result<T, CompileError> {
        Err(CompileError::Parse {
            line: self.line(),
            message: message.into(),
        })
    }

    fn expect_op(&mut self, op: &str) -> Result<(), CompileError> {
        if self.eat_op(op) {
            Ok(())
        } else {
            self.error(format!("expected '{}', found {:?}", op, self.peek()))
        }
    }

    fn expect_keyword(&mut self, kw: &str) -> Result<(), CompileError> {
        if self.eat_keyword(kw) {
            Ok(())
        } else {
            self.error(format!("expected '{}', found {:?}", kw, self.peek()))
        }
    }

    fn expect_newline(&mut self) -> Result<(), CompileError> {
        if self.eat(&TokenKind::Newline) || self.at(&TokenKind::Eof) {
            Ok(())
        } else {
            self.error(format!("expected end of line, found {:?}", self.peek()))
        }
    }

    fn identifier(&mut self) -> Result<String, CompileError> {
        match self.peek().clone() {
            TokenKind::Name(name) if !is_keyword(&name) => {
                self.pos += 1;
                Ok(name)
            }
            other => self.error(format!("expected identifier, found {:?}", other)),
        }
    }

    fn block(&mut self) -> Result<Vec<Stmt>, CompileError> {
        self.expect_op(":")?;
        if !self.eat(&TokenKind::Newline) {
            // Single-line suite: `if x: return 1`
            let stmt = self.simple_statement()?;
            return Ok(vec![stmt]);
        }
        if !self.eat(&TokenKind::Indent) {
            return self.error("expected an indented block");
        }
        let mut body = Vec::new();
        while !self.eat(&TokenKind::Dedent) {
            if self.at(&TokenKind::Eof) {
                break;
            }
            if self.eat(&TokenKind::Newline) {
                continue;
            }
            body.push(self.statement()?);
        }
        Ok(body)
    }

    fn statement(&mut self) -> Result<Stmt, CompileError> {
        let line = self.line();
        let keyword = match self.peek() {
            TokenKind::Name(n) => n.clone(),
            _ => String::new(),
        };
        let kind = match keyword.as_str() {
            "def" => {
                self.pos += 1;
                let name = self.identifier()?;
                self.expect_op("(")?;
                let mut params = Vec::new();
                while !self.at_op(")") {
                    params.push(self.identifier()?);
                    if !self.eat_op(",") {
                        break;
                    }
                }
                self.expect_op(")")?;
                if self.eat_op("->") {
                    self.expression()?;
                }
                let body = self.block()?;
                StmtKind::FunctionDef { name, params, body }
            }
            "class" => {
                self.pos += 1;
                let name = self.identifier()?;
                if self.eat_op("(") {
                    if !self.at_op(")") {
                        return self.error("class inheritance is not supported");
                    }
                    self.expect_op(")")?;
                }
                let body = self.block()?;
                StmtKind::ClassDef { name, body }
            }
            "if" => {
                self.pos += 1;
                return self.if_statement(line);
            }
            "while" => {
                self.pos += 1;
                let test = self.expression()?;
                let body = self.block()?;
                StmtKind::While { test, body }
            }
            "for" => {
                self.pos += 1;
                let target = self.identifier()?;
                self.expect_keyword("in")?;
                let iter = self.expression_list()?;
                let body = self.block()?;
                StmtKind::For { target, iter, body }
            }
            "try" => {
                self.pos += 1;
                let body = self.block()?;
                let mut handlers = Vec::new();
                while self.at_keyword("except") {
                    let handler_line = self.line();
                    self.pos += 1;
                    let (typ, name) = if self.at_op(":") {
                        (None, None)
                    } else {
                        let typ = self.expression()?;
                        let name = if self.eat_keyword("as") {
                            Some(self.identifier()?)
                        } else {
                            None
                        };
                        (Some(typ), name)
                    };
                    let body = self.block()?;
                    handlers.push(ExceptHandler {
                        typ,
                        name,
                        body,
                        line: handler_line,
                    });
                }
                if handlers.is_empty() {
                    return self.error("try statement without except clause");
                }
                if handlers[..handlers.len() - 1].iter().any(|h| h.typ.is_none()) {
                    return self.error("bare except must be the last clause");
                }
                StmtKind::Try { body, handlers }
            }
            _ => return self.simple_statement(),
        };
        Ok(Stmt { kind, line })
    }

    fn if_statement(&mut self, line: u32) -> Result<Stmt, CompileError> {
        let test = self.expression()?;
        let body = self.block()?;
        let orelse = if self.at_keyword("elif") {
            let elif_line = self.line();
            self.pos += 1;
            vec![self.if_statement(elif_line)?]
        } else if self.eat_keyword("else") {
            self.block()?
        } else {
            Vec::new()
        };
        Ok(Stmt {
            kind: StmtKind::If { test, body, orelse },
            line,
        })
    }

    fn simple_statement(&mut self) -> Result<Stmt, CompileError> {
        let line = self.line();
        let keyword = match self.peek() {
            TokenKind::Name(n) => n.clone(),
            _ => String::new(),
        };
        let kind = match keyword.as_str() {
            "pass" => {
                self.pos += 1;
                StmtKind::Pass
            }
            "break" => {
                self.pos += 1;
                StmtKind::Break
            }
            "continue" => {
                self.pos += 1;
                StmtKind::Continue
            }
            "return" => {
                self.pos += 1;
                if self.at(&TokenKind::Newline) || self.at(&TokenKind::Eof) {
                    StmtKind::Return(None)
                } else {
                    StmtKind::Return(Some(self.expression_list()?))
                }
            }
            "raise" => {
                self.pos += 1;
                if self.at(&TokenKind::Newline) || self.at(&TokenKind::Eof) {
                    StmtKind::Raise(None)
                } else {
                    StmtKind::Raise(Some(self.expression()?))
                }
            }
            "assert" => {
                self.pos += 1;
                let test = self.expression()?;
                let msg = if self.eat_op(",") {
                    Some(self.expression()?)
                } else {
                    None
                };
                StmtKind::Assert { test, msg }
            }
            "global" | "nonlocal" => {
                self.pos += 1;
                let mut names = vec![self.identifier()?];
                while self.eat_op(",") {
                    names.push(self.identifier()?);
                }
                if keyword == "global" {
                    StmtKind::Global(names)
                } else {
                    StmtKind::Nonlocal(names)
                }
            }
            "import" => {
                self.pos += 1;
                StmtKind::Import(self.identifier()?)
            }
            _ => {
                let target = self.expression_or_yield()?;
                if self.eat_op("=") {
                    check_target(&target)?;
                    let value = self.expression_or_yield()?;
                    StmtKind::Assign { target, value }
                } else if let Some(op) = self.augmented_op() {
                    check_target(&target)?;
                    let value = self.expression()?;
                    StmtKind::AugAssign { target, op, value }
                } else {
                    StmtKind::Expr(target)
                }
            }
        };
        self.expect_newline()?;
        Ok(Stmt { kind, line })
    }

    fn augmented_op(&mut self) -> Option<BinaryOp> {
        let op = match self.peek() {
            TokenKind::Op("+=") => BinaryOp::Add,
            TokenKind::Op("-=") => BinaryOp::Sub,
            TokenKind::Op("*=") => BinaryOp::Mul,
            TokenKind::Op("/=") => BinaryOp::TrueDiv,
            TokenKind::Op("//=") => BinaryOp::FloorDiv,
            TokenKind::Op("%=") => BinaryOp::Mod,
            _ => return None,
        };
        self.pos += 1;
        Some(op)
    }

    fn expression_or_yield(&mut self) -> Result<Expr, CompileError> {
        if self.at_keyword("yield") {
            let line = self.line();
            self.pos += 1;
            let value = if self.at(&TokenKind::Newline)
                || self.at(&TokenKind::Eof)
                || self.at_op(")")
            {
                None
            } else {
                Some(Box::new(self.expression_list()?))
            };
            return Ok(Expr::new(ExprKind::Yield(value), line));
        }
        self.expression_list()
    }

    /// Comma separated expressions; more than one forms a tuple.
    fn expression_list(&mut self) -> Result<Expr, CompileError> {
        let line = self.line();
        let first = self.expression()?;
        if !self.at_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at(&TokenKind::Newline) || self.at_op("=") || self.at_op(":") {
                break;
            }
            items.push(self.expression()?);
        }
        Ok(Expr::new(ExprKind::Tuple(items), line))
    }

    pub fn expression(&mut self) -> Result<Expr, CompileError> {
        let line = self.line();
        let body = self.or_expr()?;
        if self.eat_keyword("if") {
            let test = self.or_expr()?;
            self.expect_keyword("else")?;
            let orelse = self.expression()?;
            return Ok(Expr::new(
                ExprKind::IfExp {
                    test: Box::new(test),
                    body: Box::new(body),
                    orelse: Box::new(orelse),
                },
                line,
            ));
        }
        Ok(body)
    }

    fn or_expr(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.and_expr()?;
        while self.at_keyword("or") {
            let line = self.line();
            self.pos += 1;
            let right = self.and_expr()?;
            left = Expr::new(
                ExprKind::BoolOp {
                    is_and: false,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                line,
            );
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.not_expr()?;
        while self.at_keyword("and") {
            let line = self.line();
            self.pos += 1;
            let right = self.not_expr()?;
            left = Expr::new(
                ExprKind::BoolOp {
                    is_and: true,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                line,
            );
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr, CompileError> {
        if self.at_keyword("not") {
            let line = self.line();
            self.pos += 1;
            let operand = self.not_expr()?;
            return Ok(Expr::new(
                ExprKind::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
                line,
            ));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, CompileError> {
        let left = self.additive()?;
        let line = self.line();
        let op = match self.peek() {
            TokenKind::Op("==") => CompareOp::Eq,
            TokenKind::Op("!=") => CompareOp::Ne,
            TokenKind::Op("<") => CompareOp::Lt,
            TokenKind::Op("<=") => CompareOp::Le,
            TokenKind::Op(">") => CompareOp::Gt,
            TokenKind::Op(">=") => CompareOp::Ge,
            TokenKind::Name(n) if n == "in" => CompareOp::In,
            TokenKind::Name(n) if n == "is" => {
                if matches!(self.peek_at(1), TokenKind::Name(m) if m == "not") {
                    self.pos += 1;
                    CompareOp::IsNot
                } else {
                    CompareOp::Is
                }
            }
            TokenKind::Name(n)
                if n == "not" && matches!(self.peek_at(1), TokenKind::Name(m) if m == "in") =>
            {
                self.pos += 1;
                CompareOp::NotIn
            }
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.additive()?;
        if matches!(self.peek(), TokenKind::Op("==" | "!=" | "<" | "<=" | ">" | ">=")) {
            return self.error("chained comparisons are not supported");
        }
        Ok(Expr::new(
            ExprKind::Compare {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
            line,
        ))
    }

    fn additive(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                TokenKind::Op("+") => BinaryOp::Add,
                TokenKind::Op("-") => BinaryOp::Sub,
                _ => return Ok(left),
            };
            let line = self.line();
            self.pos += 1;
            let right = self.multiplicative()?;
            left = binary(op, left, right, line);
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                TokenKind::Op("*") => BinaryOp::Mul,
                TokenKind::Op("/") => BinaryOp::TrueDiv,
                TokenKind::Op("//") => BinaryOp::FloorDiv,
                TokenKind::Op("%") => BinaryOp::Mod,
                _ => return Ok(left),
            };
            let line = self.line();
            self.pos += 1;
            let right = self.unary()?;
            left = binary(op, left, right, line);
        }
    }

    fn unary(&mut self) -> Result<Expr, CompileError> {
        let line = self.line();
        if self.eat_op("-") {
            let operand = self.unary()?;
            return Ok(match operand.kind {
                ExprKind::Int(i) => Expr::new(ExprKind::Int(i.wrapping_neg()), line),
                ExprKind::Float(f) => Expr::new(ExprKind::Float(-f), line),
                _ => Expr::new(
                    ExprKind::Unary {
                        op: UnaryOp::Neg,
                        operand: Box::new(operand),
                    },
                    line,
                ),
            });
        }
        if self.eat_op("+") {
            return self.unary();
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, CompileError> {
        let mut expr = self.atom()?;
        loop {
            let line = self.line();
            if self.eat_op("(") {
                let mut args = Vec::new();
                while !self.at_op(")") {
                    args.push(self.expression()?);
                    if !self.eat_op(",") {
                        break;
                    }
                }
                self.expect_op(")")?;
                expr = Expr::new(
                    ExprKind::Call {
                        func: Box::new(expr),
                        args,
                    },
                    line,
                );
            } else if self.eat_op(".") {
                let attr = self.identifier()?;
                expr = Expr::new(
                    ExprKind::Attribute {
                        value: Box::new(expr),
                        attr,
                    },
                    line,
                );
            } else if self.eat_op("[") {
                let index = self.expression_list()?;
                self.expect_op("]")?;
                expr = Expr::new(
                    ExprKind::Subscript {
                        value: Box::new(expr),
                        index: Box::new(index),
                    },
                    line,
                );
            } else {
                return Ok(expr);
            }
        }
    }

    fn atom(&mut self) -> Result<Expr, CompileError> {
        let line = self.line();
        let kind = match self.advance() {
            TokenKind::Int(i) => ExprKind::Int(i),
            TokenKind::Float(f) => ExprKind::Float(f),
            TokenKind::Str(s) => {
                let mut s = s;
                while let TokenKind::Str(next) = self.peek().clone() {
                    self.pos += 1;
                    s.push_str(&next);
                }
                ExprKind::Str(s)
            }
            TokenKind::Name(n) => match n.as_str() {
                "None" => ExprKind::None,
                "True" => ExprKind::Bool(true),
                "False" => ExprKind::Bool(false),
                other if is_keyword(other) => {
                    self.pos -= 1;
                    return self.error(format!("unexpected keyword '{}'", other));
                }
                _ => ExprKind::Name(n),
            },
            TokenKind::Op("(") => {
                if self.eat_op(")") {
                    ExprKind::Tuple(Vec::new())
                } else {
                    let inner = if self.at_keyword("yield") {
                        self.expression_or_yield()?
                    } else {
                        self.expression()?
                    };
                    if self.eat_op(")") {
                        return Ok(inner);
                    }
                    let mut items = vec![inner];
                    while self.eat_op(",") {
                        if self.at_op(")") {
                            break;
                        }
                        items.push(self.expression()?);
                    }
                    self.expect_op(")")?;
                    ExprKind::Tuple(items)
                }
            }
            TokenKind::Op("[") => {
                let mut items = Vec::new();
                while !self.at_op("]") {
                    items.push(self.expression()?);
                    if !self.eat_op(",") {
                        break;
                    }
                }
                self.expect_op("]")?;
                ExprKind::List(items)
            }
            TokenKind::Op("{") => {
                let mut items = Vec::new();
                while !self.at_op("}") {
                    let key = self.expression()?;
                    self.expect_op(":")?;
                    let value = self.expression()?;
                    items.push((key, value));
                    if !self.eat_op(",") {
                        break;
                    }
                }
                self.expect_op("}")?;
                ExprKind::Dict(items)
            }
            other => {
                self.pos -= 1;
                return self.error(format!("unexpected token {:?}", other));
            }
        };
        Ok(Expr::new(kind, line))
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr, line: u32) -> Expr {
    Expr::new(
        ExprKind::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        },
        line,
    )
}

fn check_target(target: &Expr) -> Result<(), CompileError> {
    match &target.kind {
        ExprKind::Name(_) | ExprKind::Attribute { .. } | ExprKind::Subscript { .. } => Ok(()),
        ExprKind::Tuple(_) => Err(CompileError::Parse {
            line: target.line,
            message: "tuple unpacking is not supported".into(),
        }),
        _ => Err(CompileError::Parse {
            line: target.line,
            message: "cannot assign to expression".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::lexer::tokenize;

    fn parse(source: &str) -> Module {
        Parser::new(tokenize(source).unwrap()).parse_module().unwrap()
    }

    fn parse_err(source: &str) -> CompileError {
        Parser::new(tokenize(source).unwrap())
            .parse_module()
            .unwrap_err()
    }

    #[test]
    fn test_function_with_ternary_return() {
        let module = parse("def f(a, b):\n    return a if a > b else b\n");
        let StmtKind::FunctionDef { name, params, body } = &module.body[0].kind else {
            panic!("expected function");
        };
        assert_eq!(name, "f");
        assert_eq!(params, &vec!["a".to_string(), "b".to_string()]);
        let StmtKind::Return(Some(expr)) = &body[0].kind else {
            panic!("expected return");
        };
        assert!(matches!(expr.kind, ExprKind::IfExp { .. }));
        assert_eq!(body[0].line, 2);
    }

    #[test]
    fn test_elif_chain_nests_in_orelse() {
        let module = parse("if a:\n    x = 1\nelif b:\n    x = 2\nelse:\n    x = 3\n");
        let StmtKind::If { orelse, .. } = &module.body[0].kind else {
            panic!("expected if");
        };
        assert_eq!(orelse.len(), 1);
        assert_eq!(orelse[0].line, 3);
        assert!(matches!(
            &orelse[0].kind,
            StmtKind::If { orelse, .. } if orelse.len() == 1
        ));
    }

    #[test]
    fn test_membership_and_identity_operators() {
        let module = parse("a not in b\nc is not None\n");
        assert!(matches!(
            &module.body[0].kind,
            StmtKind::Expr(Expr { kind: ExprKind::Compare { op: CompareOp::NotIn, .. }, .. })
        ));
        assert!(matches!(
            &module.body[1].kind,
            StmtKind::Expr(Expr { kind: ExprKind::Compare { op: CompareOp::IsNot, .. }, .. })
        ));
    }

    #[test]
    fn test_try_except_with_binding() {
        let module = parse("try:\n    f()\nexcept ValueError as e:\n    pass\nexcept:\n    pass\n");
        let StmtKind::Try { handlers, .. } = &module.body[0].kind else {
            panic!("expected try");
        };
        assert_eq!(handlers.len(), 2);
        assert_eq!(handlers[0].name.as_deref(), Some("e"));
        assert!(handlers[1].typ.is_none());
    }

    #[test]
    fn test_postfix_chain() {
        let module = parse("x.items[0].append(1, 2)\n");
        let StmtKind::Expr(Expr {
            kind: ExprKind::Call { func, args },
            ..
        }) = &module.body[0].kind
        else {
            panic!("expected call");
        };
        assert_eq!(args.len(), 2);
        assert!(matches!(func.kind, ExprKind::Attribute { .. }));
    }

    #[test]
    fn test_yield_and_augmented_assignment() {
        let module = parse("def g(n):\n    i = 0\n    while i < n:\n        yield i\n        i += 1\n");
        let StmtKind::FunctionDef { body, .. } = &module.body[0].kind else {
            panic!("expected function");
        };
        let StmtKind::While { body, .. } = &body[1].kind else {
            panic!("expected while");
        };
        assert!(matches!(&body[0].kind, StmtKind::Expr(Expr { kind: ExprKind::Yield(Some(_)), .. })));
        assert!(matches!(&body[1].kind, StmtKind::AugAssign { op: BinaryOp::Add, .. }));
    }

    #[test]
    fn test_rejects_keyword_as_identifier() {
        assert!(matches!(parse_err("def if(a):\n    pass\n"), CompileError::Parse { line: 1, .. }));
    }

    #[test]
    fn test_rejects_assignment_to_call() {
        assert!(matches!(parse_err("f() = 1\n"), CompileError::Parse { .. }));
    }

    #[test]
    fn test_negative_literal_folds() {
        let module = parse("x = -3\n");
        let StmtKind::Assign { value, .. } = &module.body[0].kind else {
            panic!("expected assign");
        };
        assert_eq!(value.kind, ExprKind::Int(-3));
    }
}
