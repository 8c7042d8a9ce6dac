//! Parser (C3): hand-written recursive descent for statements, a
//! table-driven Pratt parser for expressions (SPEC_FULL §4.2).

use crate::ast::*;
use crate::error::{ParseError, Position};
use crate::lexer::{Lexer, Token, TokenKind};

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

type PResult<T> = Result<T, ParseError>;

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Parser { tokens, pos: 0 }
    }

    pub fn parse(source: &str) -> PResult<Block> {
        let tokens = Lexer::tokenize(source)?;
        let mut parser = Parser::new(tokens);
        let block = parser.parse_block()?;
        parser.expect_eof()?;
        Ok(block)
    }

    fn cur(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn cur_pos(&self) -> Position {
        self.cur().pos
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.cur().kind
    }

    fn bump(&mut self) -> Token {
        let tok = self.tokens[self.pos.min(self.tokens.len() - 1)].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn bump_if(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> PResult<Token> {
        if self.check(&kind) {
            Ok(self.bump())
        } else {
            Err(ParseError::UnexpectedToken {
                got: describe(self.peek_kind()),
                expected: Some(describe(&kind)),
                position: self.cur_pos(),
                suggestion: Some(format!("expected {}", describe(&kind))),
            })
        }
    }

    /// Like `expect`, but for a closing delimiter whose opener was seen at
    /// `open_pos`: produces `UnexpectedEnd` at EOF, `UnclosedDelimiter`
    /// otherwise, rather than a generic "unexpected token".
    fn expect_closer(&mut self, kind: TokenKind, kind_desc: &str, open_pos: Position) -> PResult<Token> {
        if self.check(&kind) {
            Ok(self.bump())
        } else if self.check(&TokenKind::Eof) {
            Err(ParseError::UnexpectedEnd { context: kind_desc.to_string(), position: self.cur_pos() })
        } else {
            Err(ParseError::UnclosedDelimiter { kind: kind_desc.to_string(), open_pos, close_pos: Some(self.cur_pos()) })
        }
    }

    fn expect_eof(&mut self) -> PResult<()> {
        if self.check(&TokenKind::Eof) {
            Ok(())
        } else {
            Err(ParseError::UnexpectedToken {
                got: describe(self.peek_kind()),
                expected: Some("end of input".to_string()),
                position: self.cur_pos(),
                suggestion: None,
            })
        }
    }

    fn expect_name(&mut self) -> PResult<String> {
        match self.peek_kind().clone() {
            TokenKind::Identifier(name) => {
                self.bump();
                Ok(name)
            }
            other => Err(ParseError::UnexpectedToken {
                got: describe(&other),
                expected: Some("identifier".to_string()),
                position: self.cur_pos(),
                suggestion: None,
            }),
        }
    }

    // ---- blocks & statements ----

    fn is_block_end(&self) -> bool {
        matches!(
            self.peek_kind(),
            TokenKind::Eof | TokenKind::End | TokenKind::Else | TokenKind::Elseif | TokenKind::Until
        )
    }

    fn parse_block(&mut self) -> PResult<Block> {
        let mut statements = Vec::new();
        while !self.is_block_end() {
            if self.check(&TokenKind::Return) {
                statements.push(self.parse_return()?);
                break;
            }
            if let Some(stmt) = self.parse_statement()? {
                statements.push(stmt);
            }
        }
        Ok(Block { statements })
    }

    fn parse_return(&mut self) -> PResult<Node<Statement>> {
        let pos = self.cur_pos();
        self.bump(); // return
        let mut exprs = Vec::new();
        if !self.is_block_end() && !self.check(&TokenKind::Semicolon) {
            exprs = self.parse_expr_list()?;
        }
        self.bump_if(&TokenKind::Semicolon);
        Ok(Node::new(Statement::Return(exprs), pos))
    }

    fn parse_statement(&mut self) -> PResult<Option<Node<Statement>>> {
        let pos = self.cur_pos();
        match self.peek_kind().clone() {
            TokenKind::Semicolon => {
                self.bump();
                Ok(None)
            }
            TokenKind::DColon => {
                self.bump();
                let name = self.expect_name()?;
                self.expect(TokenKind::DColon)?;
                Ok(Some(Node::new(Statement::Label(name), pos)))
            }
            TokenKind::Break => {
                self.bump();
                Ok(Some(Node::new(Statement::Break, pos)))
            }
            TokenKind::Goto => {
                self.bump();
                let name = self.expect_name()?;
                Ok(Some(Node::new(Statement::Goto(name), pos)))
            }
            TokenKind::Do => {
                self.bump();
                let block = self.parse_block()?;
                self.expect_closer(TokenKind::End, "do", pos)?;
                Ok(Some(Node::new(Statement::Do(block), pos)))
            }
            TokenKind::While => {
                self.bump();
                let cond = self.parse_expr(0)?;
                self.expect(TokenKind::Do)?;
                let body = self.parse_block()?;
                self.expect_closer(TokenKind::End, "while", pos)?;
                Ok(Some(Node::new(Statement::While { cond, body }, pos)))
            }
            TokenKind::Repeat => {
                self.bump();
                let body = self.parse_block()?;
                self.expect(TokenKind::Until)?;
                let cond = self.parse_expr(0)?;
                Ok(Some(Node::new(Statement::Repeat { body, cond }, pos)))
            }
            TokenKind::If => Ok(Some(self.parse_if()?)),
            TokenKind::For => Ok(Some(self.parse_for()?)),
            TokenKind::Function => Ok(Some(self.parse_function_stat()?)),
            TokenKind::Local => Ok(Some(self.parse_local()?)),
            _ => Ok(Some(self.parse_expr_statement()?)),
        }
    }

    fn parse_if(&mut self) -> PResult<Node<Statement>> {
        let pos = self.cur_pos();
        self.bump(); // if
        let mut arms = Vec::new();
        let cond = self.parse_expr(0)?;
        self.expect(TokenKind::Then)?;
        let body = self.parse_block()?;
        arms.push((cond, body));
        while self.check(&TokenKind::Elseif) {
            self.bump();
            let cond = self.parse_expr(0)?;
            self.expect(TokenKind::Then)?;
            let body = self.parse_block()?;
            arms.push((cond, body));
        }
        let else_block = if self.bump_if(&TokenKind::Else) { Some(self.parse_block()?) } else { None };
        self.expect_closer(TokenKind::End, "if", pos)?;
        Ok(Node::new(Statement::If { arms, else_block }, pos))
    }

    fn parse_for(&mut self) -> PResult<Node<Statement>> {
        let pos = self.cur_pos();
        self.bump(); // for
        let first = self.expect_name()?;
        if self.check(&TokenKind::Assign) {
            self.bump();
            let start = self.parse_expr(0)?;
            self.expect(TokenKind::Comma)?;
            let limit = self.parse_expr(0)?;
            let step = if self.bump_if(&TokenKind::Comma) { Some(self.parse_expr(0)?) } else { None };
            self.expect(TokenKind::Do)?;
            let body = self.parse_block()?;
            self.expect_closer(TokenKind::End, "for", pos)?;
            Ok(Node::new(Statement::NumericFor { var: first, start, limit, step, body }, pos))
        } else {
            let mut vars = vec![first];
            while self.bump_if(&TokenKind::Comma) {
                vars.push(self.expect_name()?);
            }
            self.expect(TokenKind::In)?;
            let exprs = self.parse_expr_list()?;
            self.expect(TokenKind::Do)?;
            let body = self.parse_block()?;
            self.expect_closer(TokenKind::End, "for", pos)?;
            Ok(Node::new(Statement::GenericFor { vars, exprs, body }, pos))
        }
    }

    fn parse_function_stat(&mut self) -> PResult<Node<Statement>> {
        let pos = self.cur_pos();
        self.bump(); // function
        let base = self.expect_name()?;
        let mut path = Vec::new();
        while self.bump_if(&TokenKind::Dot) {
            path.push(self.expect_name()?);
        }
        let name = if self.bump_if(&TokenKind::Colon) {
            let method = self.expect_name()?;
            FunctionName::Method { base, path, method }
        } else if path.is_empty() {
            FunctionName::Plain(base)
        } else {
            FunctionName::Field { base, path }
        };
        let is_method = matches!(name, FunctionName::Method { .. });
        let body = self.parse_function_body(is_method)?;
        Ok(Node::new(Statement::FunctionDecl { name, body }, pos))
    }

    fn parse_function_body(&mut self, is_method: bool) -> PResult<FunctionBody> {
        let pos = self.cur_pos();
        self.expect(TokenKind::LParen)?;
        let mut params = Vec::new();
        if is_method {
            params.push("self".to_string());
        }
        let mut is_vararg = false;
        if !self.check(&TokenKind::RParen) {
            loop {
                if self.bump_if(&TokenKind::Vararg) {
                    is_vararg = true;
                    break;
                }
                params.push(self.expect_name()?);
                if !self.bump_if(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect_closer(TokenKind::RParen, "(", pos)?;
        let block = self.parse_block()?;
        self.expect_closer(TokenKind::End, "function", pos)?;
        Ok(FunctionBody { params, is_vararg, block })
    }

    fn parse_local(&mut self) -> PResult<Node<Statement>> {
        let pos = self.cur_pos();
        self.bump(); // local
        if self.bump_if(&TokenKind::Function) {
            let name = self.expect_name()?;
            let body = self.parse_function_body(false)?;
            return Ok(Node::new(Statement::LocalFunction { name, body }, pos));
        }
        let mut names = Vec::new();
        let mut attribs = Vec::new();
        loop {
            names.push(self.expect_name()?);
            if self.bump_if(&TokenKind::Lt) {
                let attrib = self.expect_name()?;
                self.expect(TokenKind::Gt)?;
                attribs.push(Some(attrib));
            } else {
                attribs.push(None);
            }
            if !self.bump_if(&TokenKind::Comma) {
                break;
            }
        }
        let values = if self.bump_if(&TokenKind::Assign) { self.parse_expr_list()? } else { Vec::new() };
        Ok(Node::new(Statement::LocalAssign { names, attribs, values }, pos))
    }

    fn parse_expr_statement(&mut self) -> PResult<Node<Statement>> {
        let pos = self.cur_pos();
        let first = self.parse_suffixed_expr()?;
        if self.check(&TokenKind::Assign) || self.check(&TokenKind::Comma) {
            let mut targets = vec![expr_to_var(first)?];
            while self.bump_if(&TokenKind::Comma) {
                let e = self.parse_suffixed_expr()?;
                targets.push(expr_to_var(e)?);
            }
            self.expect(TokenKind::Assign)?;
            let values = self.parse_expr_list()?;
            Ok(Node::new(Statement::Assign { targets, values }, pos))
        } else {
            match first.node {
                Expr::Call(call) => Ok(Node::new(Statement::Call(Node::new(call, first.pos)), pos)),
                _ => Err(ParseError::InvalidSyntax {
                    message: "syntax error, expression used as a statement".to_string(),
                    position: pos,
                }),
            }
        }
    }

    // ---- expressions ----

    fn parse_expr_list(&mut self) -> PResult<Vec<Node<Expr>>> {
        let mut exprs = vec![self.parse_expr(0)?];
        while self.bump_if(&TokenKind::Comma) {
            exprs.push(self.parse_expr(0)?);
        }
        Ok(exprs)
    }

    /// Pratt expression parser driven by the precedence table in
    /// SPEC_FULL §4.2; `min_bp` is the left binding power the caller
    /// requires to keep consuming infix operators.
    fn parse_expr(&mut self, min_bp: u8) -> PResult<Node<Expr>> {
        let mut lhs = self.parse_unary_or_atom()?;
        loop {
            let Some((l_bp, r_bp, op)) = infix_binding_power(self.peek_kind()) else { break };
            if l_bp < min_bp {
                break;
            }
            let pos = self.cur_pos();
            self.bump();
            let rhs = self.parse_expr(r_bp)?;
            lhs = Node::new(Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) }, pos);
        }
        Ok(lhs)
    }

    const UNARY_BP: u8 = 21;

    fn parse_unary_or_atom(&mut self) -> PResult<Node<Expr>> {
        let pos = self.cur_pos();
        let op = match self.peek_kind() {
            TokenKind::Not => Some(UnaryOp::Not),
            TokenKind::Minus => Some(UnaryOp::Neg),
            TokenKind::Hash => Some(UnaryOp::Len),
            TokenKind::Tilde => Some(UnaryOp::BNot),
            _ => None,
        };
        if let Some(op) = op {
            self.bump();
            let operand = self.parse_expr(Self::UNARY_BP)?;
            return Ok(Node::new(Expr::Unary { op, operand: Box::new(operand) }, pos));
        }
        self.parse_suffixed_expr()
    }

    fn parse_primary_expr(&mut self) -> PResult<Node<Expr>> {
        let pos = self.cur_pos();
        match self.peek_kind().clone() {
            TokenKind::Nil => {
                self.bump();
                Ok(Node::new(Expr::Nil, pos))
            }
            TokenKind::True => {
                self.bump();
                Ok(Node::new(Expr::True, pos))
            }
            TokenKind::False => {
                self.bump();
                Ok(Node::new(Expr::False, pos))
            }
            TokenKind::Int(n) => {
                self.bump();
                Ok(Node::new(Expr::Int(n), pos))
            }
            TokenKind::Float(n) => {
                self.bump();
                Ok(Node::new(Expr::Float(n), pos))
            }
            TokenKind::Str(s) => {
                self.bump();
                Ok(Node::new(Expr::Str(s), pos))
            }
            TokenKind::Vararg => {
                self.bump();
                Ok(Node::new(Expr::Vararg, pos))
            }
            TokenKind::Function => {
                self.bump();
                let body = self.parse_function_body(false)?;
                Ok(Node::new(Expr::Function(body), pos))
            }
            TokenKind::LBrace => self.parse_table_constructor(),
            TokenKind::LParen => {
                self.bump();
                let inner = self.parse_expr(0)?;
                self.expect_closer(TokenKind::RParen, "(", pos)?;
                Ok(Node::new(Expr::Paren(Box::new(inner)), pos))
            }
            TokenKind::Identifier(name) => {
                self.bump();
                Ok(Node::new(Expr::Var(Var::Name(name)), pos))
            }
            other => Err(ParseError::UnexpectedToken {
                got: describe(&other),
                expected: Some("an expression".to_string()),
                position: pos,
                suggestion: None,
            }),
        }
    }

    /// A primary expression followed by any number of `.name`, `[expr]`,
    /// `:name(args)`, `(args)` suffixes.
    fn parse_suffixed_expr(&mut self) -> PResult<Node<Expr>> {
        let mut expr = self.parse_primary_expr()?;
        loop {
            let pos = self.cur_pos();
            match self.peek_kind().clone() {
                TokenKind::Dot => {
                    self.bump();
                    let name = self.expect_name()?;
                    expr = Node::new(Expr::Var(Var::Field { object: Box::new(expr), name }), pos);
                }
                TokenKind::LBracket => {
                    self.bump();
                    let key = self.parse_expr(0)?;
                    self.expect_closer(TokenKind::RBracket, "[", pos)?;
                    expr = Node::new(Expr::Var(Var::Index { object: Box::new(expr), key: Box::new(key) }), pos);
                }
                TokenKind::Colon => {
                    self.bump();
                    let method = self.expect_name()?;
                    let args = self.parse_call_args()?;
                    expr = Node::new(
                        Expr::Call(Call { callee: Box::new(expr), method: Some(method), args }),
                        pos,
                    );
                }
                TokenKind::LParen | TokenKind::Str(_) | TokenKind::LBrace => {
                    let args = self.parse_call_args()?;
                    expr = Node::new(Expr::Call(Call { callee: Box::new(expr), method: None, args }), pos);
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_call_args(&mut self) -> PResult<Vec<Node<Expr>>> {
        match self.peek_kind().clone() {
            TokenKind::LParen => {
                let pos = self.cur_pos();
                self.bump();
                let args = if self.check(&TokenKind::RParen) { Vec::new() } else { self.parse_expr_list()? };
                self.expect_closer(TokenKind::RParen, "(", pos)?;
                Ok(args)
            }
            TokenKind::Str(s) => {
                let pos = self.cur_pos();
                self.bump();
                Ok(vec![Node::new(Expr::Str(s), pos)])
            }
            TokenKind::LBrace => {
                let table = self.parse_table_constructor()?;
                Ok(vec![table])
            }
            other => Err(ParseError::UnexpectedToken {
                got: describe(&other),
                expected: Some("call arguments".to_string()),
                position: self.cur_pos(),
                suggestion: None,
            }),
        }
    }

    fn parse_table_constructor(&mut self) -> PResult<Node<Expr>> {
        let pos = self.cur_pos();
        self.expect(TokenKind::LBrace)?;
        let mut fields = Vec::new();
        while !self.check(&TokenKind::RBrace) {
            if self.check(&TokenKind::LBracket) {
                let bracket_pos = self.cur_pos();
                self.bump();
                let key = self.parse_expr(0)?;
                self.expect_closer(TokenKind::RBracket, "[", bracket_pos)?;
                self.expect(TokenKind::Assign)?;
                let value = self.parse_expr(0)?;
                fields.push(TableField::Indexed { key, value });
            } else if self.looks_like_named_field() {
                let name = self.expect_name()?;
                self.expect(TokenKind::Assign)?;
                let value = self.parse_expr(0)?;
                fields.push(TableField::Named { name, value });
            } else {
                fields.push(TableField::Positional(self.parse_expr(0)?));
            }
            if !self.bump_if(&TokenKind::Comma) && !self.bump_if(&TokenKind::Semicolon) {
                break;
            }
        }
        self.expect_closer(TokenKind::RBrace, "{", pos)?;
        Ok(Node::new(Expr::Table(fields), pos))
    }

    fn looks_like_named_field(&self) -> bool {
        matches!(self.peek_kind(), TokenKind::Identifier(_)) && self.tokens[self.pos + 1].kind == TokenKind::Assign
    }
}

fn expr_to_var(e: Node<Expr>) -> PResult<Node<Var>> {
    match e.node {
        Expr::Var(v) => Ok(Node::new(v, e.pos)),
        _ => Err(ParseError::InvalidSyntax {
            message: "cannot assign to this expression".to_string(),
            position: e.pos,
        }),
    }
}

/// `(left_bp, right_bp, op)` for an infix operator token, per the SPEC_FULL
/// §4.2 precedence table. `left_bp < right_bp` is left-associative.
fn infix_binding_power(kind: &TokenKind) -> Option<(u8, u8, BinaryOp)> {
    use BinaryOp::*;
    Some(match kind {
        TokenKind::Or => (1, 2, Or),
        TokenKind::And => (3, 4, And),
        TokenKind::Lt => (5, 6, Lt),
        TokenKind::Gt => (5, 6, Gt),
        TokenKind::Le => (5, 6, Le),
        TokenKind::Ge => (5, 6, Ge),
        TokenKind::NotEq => (5, 6, NotEq),
        TokenKind::Eq => (5, 6, Eq),
        TokenKind::Pipe => (7, 8, BOr),
        TokenKind::Tilde => (9, 10, BXor),
        TokenKind::Amp => (11, 12, BAnd),
        TokenKind::Shl => (13, 14, Shl),
        TokenKind::Shr => (13, 14, Shr),
        TokenKind::Concat => (15, 14, Concat), // right-associative
        TokenKind::Plus => (17, 18, Add),
        TokenKind::Minus => (17, 18, Sub),
        TokenKind::Star => (19, 20, Mul),
        TokenKind::Slash => (19, 20, Div),
        TokenKind::DSlash => (19, 20, FloorDiv),
        TokenKind::Percent => (19, 20, Mod),
        TokenKind::Caret => (24, 23, Pow), // right-associative
        _ => return None,
    })
}

fn describe(kind: &TokenKind) -> String {
    match kind {
        TokenKind::Identifier(n) => n.clone(),
        TokenKind::Str(_) => "<string>".to_string(),
        TokenKind::Int(n) => n.to_string(),
        TokenKind::Float(n) => n.to_string(),
        TokenKind::Eof => "<eof>".to_string(),
        TokenKind::End => "'end'".to_string(),
        TokenKind::Then => "'then'".to_string(),
        TokenKind::Do => "'do'".to_string(),
        other => format!("{other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(src: &str) -> Block {
        Parser::parse(src).expect("expected parse to succeed")
    }

    #[test]
    fn parses_simple_return() {
        let block = parse_ok("return 1 + 2 * 3");
        assert_eq!(block.statements.len(), 1);
        match &block.statements[0].node {
            Statement::Return(exprs) => {
                assert_eq!(exprs.len(), 1);
                match &exprs[0].node {
                    Expr::Binary { op: BinaryOp::Add, rhs, .. } => {
                        assert!(matches!(rhs.node, Expr::Binary { op: BinaryOp::Mul, .. }));
                    }
                    other => panic!("unexpected expr: {other:?}"),
                }
            }
            other => panic!("unexpected statement: {other:?}"),
        }
    }

    #[test]
    fn unary_minus_binds_looser_than_power_but_tighter_than_star() {
        let block = parse_ok("return -2^3");
        match &block.statements[0].node {
            Statement::Return(exprs) => match &exprs[0].node {
                Expr::Unary { op: UnaryOp::Neg, operand } => {
                    assert!(matches!(operand.node, Expr::Binary { op: BinaryOp::Pow, .. }));
                }
                other => panic!("expected unary neg of a power, got {other:?}"),
            },
            _ => unreachable!(),
        }

        let block = parse_ok("return -2*3");
        match &block.statements[0].node {
            Statement::Return(exprs) => match &exprs[0].node {
                Expr::Binary { op: BinaryOp::Mul, lhs, .. } => {
                    assert!(matches!(lhs.node, Expr::Unary { op: UnaryOp::Neg, .. }));
                }
                other => panic!("expected (-2)*3, got {other:?}"),
            },
            _ => unreachable!(),
        }
    }

    #[test]
    fn concat_and_power_are_right_associative() {
        let block = parse_ok("return a .. b .. c");
        match &block.statements[0].node {
            Statement::Return(exprs) => match &exprs[0].node {
                Expr::Binary { op: BinaryOp::Concat, rhs, .. } => {
                    assert!(matches!(rhs.node, Expr::Binary { op: BinaryOp::Concat, .. }));
                }
                other => panic!("unexpected: {other:?}"),
            },
            _ => unreachable!(),
        }
    }

    #[test]
    fn parses_method_call_and_index_chain() {
        let block = parse_ok("return a.b[1]:c(1, 2)");
        assert_eq!(block.statements.len(), 1);
    }

    #[test]
    fn parses_numeric_and_generic_for() {
        parse_ok("for i=1,10 do end");
        parse_ok("for i=1,10,2 do end");
        parse_ok("for k,v in pairs(t) do end");
    }

    #[test]
    fn missing_end_is_a_structured_error() {
        let err = Parser::parse("if true then").unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedEnd { ref context, .. } if context == "if"));
    }

    #[test]
    fn unclosed_paren_before_a_real_token_is_a_structured_error() {
        let err = Parser::parse("return (1 + 2 end").unwrap_err();
        assert!(matches!(err, ParseError::UnclosedDelimiter { ref kind, .. } if kind == "("));
    }
}
