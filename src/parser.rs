use crate::ast::*;
use crate::cst::{Cst, CstKind, CstNode, TokenSpan};
use crate::diag::{Diagnostic, Diagnostics};
use crate::number::Number;
use crate::pos::{Pos, Range};
use crate::scanner;
use crate::token::{Token, TokenKind};
use crate::value::{Type, Value};
use log::trace;
use std::sync::Arc;

/// A recursive descent parser for native BCL syntax, with precedence
/// climbing for operators. It consumes the scanner's token stream and
/// builds the AST and the token-preserving CST in lockstep: every
/// reduction records the span of tokens it consumed.
///
/// The parser recovers aggressively. Errors inside an attribute skip to
/// the next newline; errors inside a block skip to the matching closing
/// brace; all diagnostics accumulate and a (possibly partial) tree is
/// always returned.
pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    filename: Arc<str>,
    diags: Diagnostics,
    /// Finished CST nodes awaiting a parent; `Mark` captures a length so
    /// enclosing constructs can claim their children.
    nodes: Vec<CstNode>,
    /// Whether newlines are currently significant. Bodies push true;
    /// bracketed sub-expressions push false.
    include_newlines: Vec<bool>,
}

#[derive(Clone, Copy)]
struct Mark {
    tok: usize,
    node: usize,
}

/// Parses a configuration file into its AST body plus the rewrite CST.
pub fn parse_file(src: &str, filename: &str, start: Pos) -> (Body, Cst, Diagnostics) {
    trace!("parsing {filename}");
    let (tokens, mut diags) = scanner::scan(src, filename, start);
    let mut p = Parser::new(tokens, filename);
    let body = p.parse_body(TokenKind::Eof);
    diags.extend(p.diags);
    let mut root = p.nodes.pop().unwrap_or(CstNode {
        kind: CstKind::Body,
        span: TokenSpan { start: 0, end: 0 },
        children: Vec::new(),
    });
    // The root body owns every token, the EOF token included.
    root.span = TokenSpan {
        start: 0,
        end: p.tokens.len(),
    };
    (body, Cst::new(p.tokens, root), diags)
}

/// Parses a standalone expression, e.g. for a REPL or test harness.
pub fn parse_expression(src: &str, filename: &str, start: Pos) -> (Expression, Diagnostics) {
    let (tokens, mut diags) = scanner::scan(src, filename, start);
    let mut p = Parser::new(tokens, filename);
    p.include_newlines.push(false);
    let expr = p.parse_expr();
    p.expect_eof();
    diags.extend(p.diags);
    (expr, diags)
}

/// Parses a standalone template, i.e. the inside of a quoted string.
pub fn parse_template(src: &str, filename: &str, start: Pos) -> (Expression, Diagnostics) {
    let (tokens, mut diags) = scanner::scan_template(src, filename, start);
    let mut p = Parser::new(tokens, filename);
    let start_range = p.here();
    let (parts, _) = p.template_seq(TokenKind::Eof, true, &[]);
    diags.extend(p.diags);
    let range = parts
        .iter()
        .map(part_range)
        .reduce(|a, b| a.union(&b))
        .unwrap_or(start_range);
    (template_expr(parts, range), diags)
}

fn part_range(part: &TemplatePart) -> Range {
    match part {
        TemplatePart::Literal { range, .. } => range.clone(),
        TemplatePart::Interp(e) => e.range.clone(),
    }
}

/// Parses an absolute traversal such as `a.b[0]`.
pub fn parse_traversal(src: &str, filename: &str, start: Pos) -> (Traversal, Diagnostics) {
    let (tokens, mut diags) = scanner::scan(src, filename, start);
    let mut p = Parser::new(tokens, filename);
    p.include_newlines.push(false);
    let trav = p.parse_traversal_abs();
    p.expect_eof();
    diags.extend(p.diags);
    (trav, diags)
}

impl Parser {
    fn new(tokens: Vec<Token>, filename: &str) -> Parser {
        Parser {
            tokens,
            pos: 0,
            filename: Arc::from(filename),
            diags: Diagnostics::new(),
            nodes: Vec::new(),
            include_newlines: vec![true],
        }
    }

    // === Token helpers ===

    fn newlines_included(&self) -> bool {
        *self.include_newlines.last().unwrap_or(&true)
    }

    fn skip_transparent_newlines(&mut self) {
        if !self.newlines_included() {
            while self.tokens[self.pos].kind == TokenKind::Newline {
                self.pos += 1;
            }
        }
    }

    fn peek(&mut self) -> &Token {
        self.skip_transparent_newlines();
        &self.tokens[self.pos]
    }

    fn peek_kind(&mut self) -> TokenKind {
        self.peek().kind
    }

    /// Kind of the `n`th significant token ahead of the cursor, without
    /// consuming anything.
    fn nth_kind(&self, n: usize) -> TokenKind {
        let include = self.newlines_included();
        let mut i = self.pos;
        let mut seen = 0;
        loop {
            let k = self.tokens[i].kind;
            if k == TokenKind::Eof {
                return k;
            }
            if k == TokenKind::Newline && !include {
                i += 1;
                continue;
            }
            if seen == n {
                return k;
            }
            seen += 1;
            i += 1;
        }
    }

    fn next(&mut self) -> Token {
        self.skip_transparent_newlines();
        let t = self.tokens[self.pos].clone();
        if t.kind != TokenKind::Eof {
            self.pos += 1;
        }
        t
    }

    fn check(&mut self, kind: TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> Option<Token> {
        if self.check(kind) {
            Some(self.next())
        } else {
            None
        }
    }

    fn expect(&mut self, kind: TokenKind, context: &str) -> Option<Token> {
        if self.check(kind) {
            Some(self.next())
        } else {
            let found = self.peek().kind;
            let range = self.peek().range.clone();
            self.diags.push(Diagnostic::error(
                format!("Missing {}", kind.describe()),
                format!("Expected {} {}, but found {}.", kind.describe(), context, found.describe()),
                range,
            ));
            None
        }
    }

    fn expect_eof(&mut self) {
        if self.peek_kind() != TokenKind::Eof {
            let range = self.peek().range.clone();
            self.diags.push(Diagnostic::error(
                "Extra characters after expression",
                "The expression ended but more input remains.",
                range,
            ));
        }
    }

    fn error(&mut self, summary: &str, detail: String, range: Range) {
        self.diags.push(Diagnostic::error(summary, detail, range));
    }

    fn error_expr(&mut self, range: Range) -> Expression {
        Expression::literal(Value::unknown(Type::Dynamic), range)
    }

    fn here(&mut self) -> Range {
        self.peek().range.clone()
    }

    // === CST bookkeeping ===

    fn mark(&mut self) -> Mark {
        self.skip_transparent_newlines();
        Mark {
            tok: self.pos,
            node: self.nodes.len(),
        }
    }

    fn finish_node(&mut self, kind: CstKind, m: Mark) {
        let children = self.nodes.split_off(m.node);
        self.nodes.push(CstNode {
            kind,
            span: TokenSpan {
                start: m.tok,
                end: self.pos,
            },
            children,
        });
    }

    // === Recovery ===

    /// Skips forward past the next newline at bracket depth zero. Used
    /// to resynchronize after a malformed attribute.
    fn recover_past_newline(&mut self) {
        let mut depth = 0i32;
        loop {
            match self.tokens[self.pos].kind {
                TokenKind::Eof => return,
                TokenKind::LBrace | TokenKind::LBrack | TokenKind::LParen => {
                    depth += 1;
                    self.pos += 1;
                }
                TokenKind::RBrace | TokenKind::RBrack | TokenKind::RParen => {
                    if depth <= 0 {
                        return;
                    }
                    depth -= 1;
                    self.pos += 1;
                }
                TokenKind::Newline if depth <= 0 => {
                    self.pos += 1;
                    return;
                }
                _ => self.pos += 1,
            }
        }
    }

    /// Skips to (and past) the closing brace matching an already-consumed
    /// opening brace.
    fn recover_past_close(&mut self, open: TokenKind, close: TokenKind) {
        let mut depth = 0u32;
        loop {
            let k = self.tokens[self.pos].kind;
            if k == TokenKind::Eof {
                return;
            }
            self.pos += 1;
            if k == open {
                depth += 1;
            } else if k == close {
                if depth == 0 {
                    return;
                }
                depth -= 1;
            }
        }
    }

    // === Body parsing ===

    /// Body := (Attribute | Block)*
    fn parse_body(&mut self, end: TokenKind) -> Body {
        self.include_newlines.push(true);
        let m = self.mark();
        let start_range = self.here();
        let mut items = Vec::new();
        let end_pos;
        loop {
            let t = self.peek().clone();
            match t.kind {
                TokenKind::Newline => {
                    self.pos += 1;
                }
                k if k == end => {
                    end_pos = t.range.start;
                    break;
                }
                TokenKind::Eof => {
                    if end != TokenKind::Eof {
                        self.error(
                            "Unclosed block",
                            "The file ended before this block's closing brace.".to_string(),
                            t.range.clone(),
                        );
                    }
                    end_pos = t.range.start;
                    break;
                }
                TokenKind::Ident => {
                    if let Some(item) = self.parse_definition() {
                        items.push(item);
                    }
                }
                _ => {
                    self.error(
                        "Attribute or block definition required",
                        format!(
                            "An attribute definition (\"name = value\") or block definition is required here, not {}.",
                            t.kind.describe()
                        ),
                        t.range.clone(),
                    );
                    self.next();
                    self.recover_past_newline();
                }
            }
        }
        self.finish_node(CstKind::Body, m);
        self.include_newlines.pop();
        let end_range = Range::at(self.filename.clone(), end_pos);
        Body {
            items,
            range: Range::new(self.filename.clone(), start_range.start, end_pos),
            end_range,
        }
    }

    /// Attribute := IDENT "=" Expression NEWLINE
    /// Block     := IDENT (STRING | IDENT)* "{" Body "}" NEWLINE
    fn parse_definition(&mut self) -> Option<Item> {
        let m = self.mark();
        let name_tok = self.next();
        let mut labels = Vec::new();
        loop {
            match self.peek_kind() {
                TokenKind::Equal => {
                    let attr = self.parse_attribute_rest(m, name_tok);
                    return Some(Item::Attribute(attr));
                }
                TokenKind::LBrace => {
                    let block = self.parse_block_rest(m, name_tok, labels);
                    return Some(Item::Block(block));
                }
                TokenKind::OQuote => {
                    let label = self.parse_string_label();
                    labels.push(label);
                }
                TokenKind::Ident => {
                    let t = self.next();
                    labels.push(BlockLabel {
                        value: t.text.clone(),
                        range: t.range,
                    });
                }
                _ => {
                    let here = self.here();
                    if labels.is_empty() {
                        self.error(
                            "Invalid definition",
                            "Expected \"=\" to define an attribute, or block labels and \"{\".".to_string(),
                            here,
                        );
                    } else {
                        self.error(
                            "Invalid block definition",
                            "Expected either more block labels or \"{\" to open the block body.".to_string(),
                            here,
                        );
                    }
                    self.recover_past_newline();
                    return None;
                }
            }
        }
    }

    fn parse_attribute_rest(&mut self, m: Mark, name_tok: Token) -> Attribute {
        let equals_tok = self.next(); // the "=" that got us here
        let em = self.mark();
        let expr = self.parse_expr();
        self.finish_node(CstKind::Expression, em);

        let mut end_range = expr.range.clone();
        match self.peek_kind() {
            TokenKind::Newline => {
                let t = self.next();
                end_range = t.range;
            }
            // An attribute may end the file, or sit on the same line as
            // its block's closing brace.
            TokenKind::Eof | TokenKind::RBrace => {}
            _ => {
                let here = self.here();
                self.error(
                    "Missing newline after attribute",
                    "An attribute definition must end at the end of the line.".to_string(),
                    here,
                );
                self.recover_past_newline();
            }
        }
        self.finish_node(CstKind::Attribute, m);
        Attribute {
            name: name_tok.text.clone(),
            expr,
            name_range: name_tok.range.clone(),
            equals_range: equals_tok.range,
            range: name_tok.range.union(&end_range),
            json_alt: Vec::new(),
        }
    }

    fn parse_block_rest(&mut self, m: Mark, name_tok: Token, labels: Vec<BlockLabel>) -> Block {
        let open = self.next(); // "{"
        let body = self.parse_body(TokenKind::RBrace);
        let close_range = match self.expect(TokenKind::RBrace, "to close this block") {
            Some(t) => t.range,
            None => {
                self.recover_past_close(TokenKind::LBrace, TokenKind::RBrace);
                Range::at(self.filename.clone(), body.end_range.start)
            }
        };
        match self.peek_kind() {
            TokenKind::Newline => {
                self.next();
            }
            TokenKind::Eof | TokenKind::RBrace => {}
            _ => {
                let here = self.here();
                self.error(
                    "Missing newline after block",
                    "A block definition must end at the end of the line.".to_string(),
                    here,
                );
                self.recover_past_newline();
            }
        }
        self.finish_node(CstKind::Block, m);
        Block {
            type_name: name_tok.text.clone(),
            labels,
            range: name_tok.range.union(&close_range),
            type_range: name_tok.range,
            open_brace_range: open.range,
            close_brace_range: close_range,
            body,
        }
    }

    /// A block label must be a static quoted string: interpolation is
    /// not allowed there.
    fn parse_string_label(&mut self) -> BlockLabel {
        let start = self.here();
        let expr = self.parse_quoted_template();
        match &expr.kind {
            ExprKind::Literal(v) if v.as_string().is_some() => BlockLabel {
                value: v.as_string().unwrap().to_string(),
                range: expr.range,
            },
            _ => {
                self.error(
                    "Invalid block label",
                    "Block labels must be static strings without interpolation.".to_string(),
                    expr.range.clone(),
                );
                BlockLabel {
                    value: String::new(),
                    range: start,
                }
            }
        }
    }

    // === Expressions ===

    fn parse_expr(&mut self) -> Expression {
        self.parse_conditional()
    }

    /// Conditional := Expr "?" Expr ":" Expr  (binds above "||")
    fn parse_conditional(&mut self) -> Expression {
        let cond = self.parse_binary(1);
        if self.match_token(TokenKind::Question).is_none() {
            return cond;
        }
        let true_expr = self.parse_expr();
        self.expect(TokenKind::Colon, "between the conditional's branches");
        let false_expr = self.parse_expr();
        let range = cond.range.union(&false_expr.range);
        Expression {
            kind: ExprKind::Conditional {
                cond: Box::new(cond),
                true_expr: Box::new(true_expr),
                false_expr: Box::new(false_expr),
            },
            range,
        }
    }

    fn peek_binop(&mut self) -> Option<BinOp> {
        Some(match self.peek_kind() {
            TokenKind::Or => BinOp::Or,
            TokenKind::And => BinOp::And,
            TokenKind::EqualTo => BinOp::Equal,
            TokenKind::NotEqual => BinOp::NotEqual,
            TokenKind::LessThan => BinOp::LessThan,
            TokenKind::GreaterThan => BinOp::GreaterThan,
            TokenKind::LessThanEq => BinOp::LessThanEq,
            TokenKind::GreaterThanEq => BinOp::GreaterThanEq,
            TokenKind::Plus => BinOp::Add,
            TokenKind::Minus => BinOp::Subtract,
            TokenKind::Star => BinOp::Multiply,
            TokenKind::Slash => BinOp::Divide,
            TokenKind::Percent => BinOp::Modulo,
            _ => return None,
        })
    }

    /// Precedence climbing over the binary operator table; all binary
    /// operators are left-associative.
    fn parse_binary(&mut self, min_prec: u8) -> Expression {
        let mut lhs = self.parse_unary();
        loop {
            let op = match self.peek_binop() {
                Some(op) if op.precedence() >= min_prec => op,
                _ => break,
            };
            self.next();
            let rhs = self.parse_binary(op.precedence() + 1);
            let range = lhs.range.union(&rhs.range);
            lhs = Expression {
                kind: ExprKind::BinaryOp {
                    lhs: Box::new(lhs),
                    op,
                    rhs: Box::new(rhs),
                },
                range,
            };
        }
        lhs
    }

    /// Unary "-" and "!" are right-associative and bind tighter than any
    /// binary operator, but looser than traversal.
    fn parse_unary(&mut self) -> Expression {
        let op = match self.peek_kind() {
            TokenKind::Minus => Some(UnOp::Negate),
            TokenKind::Bang => Some(UnOp::Not),
            _ => None,
        };
        match op {
            Some(op) => {
                let tok = self.next();
                let operand = self.parse_unary();
                let range = tok.range.union(&operand.range);
                Expression {
                    kind: ExprKind::UnaryOp {
                        op,
                        operand: Box::new(operand),
                    },
                    range,
                }
            }
            None => self.parse_postfix(),
        }
    }

    /// Traversal steps `.attr`, `[expr]`, `.*`, `[*]` bind tighter than
    /// unary operators.
    fn parse_postfix(&mut self) -> Expression {
        let mut expr = self.parse_primary();
        loop {
            match self.peek_kind() {
                TokenKind::Dot if self.nth_kind(1) == TokenKind::Star => {
                    let dot = self.next();
                    let star = self.next();
                    expr = self.parse_splat(expr, SplatKind::Attr, dot.range.union(&star.range));
                }
                TokenKind::Dot => {
                    let dot = self.next();
                    expr = self.parse_attr_step(expr, dot);
                }
                TokenKind::LBrack
                    if self.nth_kind(1) == TokenKind::Star
                        && self.nth_kind(2) == TokenKind::RBrack =>
                {
                    let open = self.next();
                    self.next();
                    let close = self.next();
                    expr = self.parse_splat(expr, SplatKind::Full, open.range.union(&close.range));
                }
                TokenKind::LBrack => {
                    self.next();
                    self.include_newlines.push(false);
                    let key = self.parse_expr();
                    self.include_newlines.pop();
                    let close = self.expect(TokenKind::RBrack, "to close the index");
                    let end_range = close.map(|t| t.range).unwrap_or_else(|| key.range.clone());
                    expr = self.apply_index_step(expr, key, end_range);
                }
                _ => break,
            }
        }
        expr
    }

    fn parse_attr_step(&mut self, base: Expression, dot: Token) -> Expression {
        match self.peek_kind() {
            TokenKind::Ident | TokenKind::Number => {
                let t = self.next();
                let step_range = dot.range.union(&t.range);
                // `.0` indexes a tuple; `.name` reads an attribute.
                let step = if t.kind == TokenKind::Number {
                    match Number::from_literal(&t.text) {
                        Ok(n) => TravStep {
                            kind: TravStepKind::Index(Value::number(n)),
                            range: step_range.clone(),
                        },
                        Err(_) => TravStep {
                            kind: TravStepKind::Attr(t.text.clone()),
                            range: step_range.clone(),
                        },
                    }
                } else {
                    TravStep {
                        kind: TravStepKind::Attr(t.text.clone()),
                        range: step_range.clone(),
                    }
                };
                self.push_trav_step(base, step)
            }
            _ => {
                let here = self.here();
                self.error(
                    "Invalid attribute name",
                    "A name is required after the \".\" operator.".to_string(),
                    here.clone(),
                );
                self.error_expr(base.range.union(&here))
            }
        }
    }

    fn apply_index_step(&mut self, base: Expression, key: Expression, end_range: Range) -> Expression {
        // A literal key folds into the traversal; a computed key stays a
        // dynamic index expression.
        if let ExprKind::Literal(v) = &key.kind {
            if v.as_string().is_some() || v.as_number().is_some() {
                let step = TravStep {
                    kind: TravStepKind::Index(v.clone()),
                    range: key.range.union(&end_range),
                };
                return self.push_trav_step(base, step);
            }
        }
        let range = base.range.union(&end_range);
        Expression {
            kind: ExprKind::Index {
                collection: Box::new(base),
                key: Box::new(key),
            },
            range,
        }
    }

    fn push_trav_step(&mut self, base: Expression, step: TravStep) -> Expression {
        let range = base.range.union(&step.range);
        match base.kind {
            ExprKind::ScopeTraversal(mut t) => {
                t.steps.push(step);
                Expression {
                    kind: ExprKind::ScopeTraversal(t),
                    range,
                }
            }
            ExprKind::RelativeTraversal {
                base: inner,
                mut steps,
            } => {
                steps.push(step);
                Expression {
                    kind: ExprKind::RelativeTraversal { base: inner, steps },
                    range,
                }
            }
            _ => Expression {
                kind: ExprKind::RelativeTraversal {
                    base: Box::new(base),
                    steps: vec![step],
                },
                range,
            },
        }
    }

    /// After `.*` or `[*]`: the remaining traversal applies per element,
    /// with an anonymous symbol standing in for the element.
    fn parse_splat(&mut self, source: Expression, kind: SplatKind, marker: Range) -> Expression {
        let mut each = Expression {
            kind: ExprKind::AnonSymbol,
            range: marker.clone(),
        };
        loop {
            match self.peek_kind() {
                TokenKind::Dot if self.nth_kind(1) != TokenKind::Star => {
                    let dot = self.next();
                    each = self.parse_attr_step(each, dot);
                }
                TokenKind::LBrack
                    if kind == SplatKind::Full
                        && self.nth_kind(1) != TokenKind::Star =>
                {
                    self.next();
                    self.include_newlines.push(false);
                    let key = self.parse_expr();
                    self.include_newlines.pop();
                    let close = self.expect(TokenKind::RBrack, "to close the index");
                    let end_range = close.map(|t| t.range).unwrap_or_else(|| key.range.clone());
                    each = self.apply_index_step(each, key, end_range);
                }
                _ => break,
            }
        }
        let range = source.range.union(&each.range).union(&marker);
        Expression {
            kind: ExprKind::Splat {
                source: Box::new(source),
                each: Box::new(each),
                kind,
            },
            range,
        }
    }

    fn parse_primary(&mut self) -> Expression {
        match self.peek_kind() {
            TokenKind::Number => {
                let t = self.next();
                match Number::from_literal(&t.text) {
                    Ok(n) => Expression::literal(Value::number(n), t.range),
                    Err(err) => {
                        self.error(
                            "Invalid number literal",
                            format!("This is not a valid number: {err}."),
                            t.range.clone(),
                        );
                        Expression::literal(Value::unknown(Type::Number), t.range)
                    }
                }
            }
            TokenKind::Ident => self.parse_ident_expr(),
            TokenKind::OQuote => self.parse_quoted_template(),
            TokenKind::OHeredoc => self.parse_heredoc_template(),
            TokenKind::LBrack => self.parse_tuple_or_for(),
            TokenKind::LBrace => self.parse_object_or_for(),
            TokenKind::LParen => {
                self.next();
                self.include_newlines.push(false);
                let inner = self.parse_expr();
                self.expect(TokenKind::RParen, "to close the parenthesized expression");
                self.include_newlines.pop();
                inner
            }
            _ => {
                let t = self.peek().clone();
                self.error(
                    "Missing expression",
                    format!("An expression is required here, not {}.", t.kind.describe()),
                    t.range.clone(),
                );
                // Consume nothing the enclosing context needs for its own
                // recovery.
                if !matches!(
                    t.kind,
                    TokenKind::Newline
                        | TokenKind::Eof
                        | TokenKind::RBrace
                        | TokenKind::RBrack
                        | TokenKind::RParen
                        | TokenKind::Comma
                ) {
                    self.next();
                }
                self.error_expr(t.range)
            }
        }
    }

    fn parse_ident_expr(&mut self) -> Expression {
        let t = self.next();
        match t.text.as_str() {
            "true" => return Expression::literal(Value::bool(true), t.range),
            "false" => return Expression::literal(Value::bool(false), t.range),
            "null" => return Expression::literal(Value::null(Type::Dynamic), t.range),
            _ => {}
        }
        if self.check(TokenKind::LParen) {
            return self.parse_function_call(t);
        }
        Expression {
            range: t.range.clone(),
            kind: ExprKind::ScopeTraversal(Traversal {
                root: t.text,
                root_range: t.range,
                steps: Vec::new(),
            }),
        }
    }

    /// FunctionCall := IDENT "(" (Expr ("," Expr)* ","? "..."?)? ")"
    fn parse_function_call(&mut self, name_tok: Token) -> Expression {
        self.next(); // "("
        self.include_newlines.push(false);
        let mut args = Vec::new();
        let mut expand_final = false;
        if !self.check(TokenKind::RParen) {
            loop {
                args.push(self.parse_expr());
                if self.match_token(TokenKind::Ellipsis).is_some() {
                    expand_final = true;
                    break;
                }
                if self.match_token(TokenKind::Comma).is_some() {
                    if self.check(TokenKind::RParen) {
                        break;
                    }
                    continue;
                }
                break;
            }
        }
        let close = self.expect(TokenKind::RParen, "to close the function call");
        self.include_newlines.pop();
        let end_range = close
            .map(|t| t.range)
            .or_else(|| args.last().map(|a| a.range.clone()))
            .unwrap_or_else(|| name_tok.range.clone());
        Expression {
            range: name_tok.range.union(&end_range),
            kind: ExprKind::FunctionCall {
                name: name_tok.text,
                name_range: name_tok.range,
                args,
                expand_final,
            },
        }
    }

    /// Tuple := "[" (Expr ("," Expr)* ","?)? "]" | "[" "for" ... "]"
    fn parse_tuple_or_for(&mut self) -> Expression {
        let open = self.next();
        self.include_newlines.push(false);
        if self.at_for_keyword() {
            let expr = self.parse_for(open, TokenKind::RBrack, false);
            self.include_newlines.pop();
            return expr;
        }
        let mut elems = Vec::new();
        if !self.check(TokenKind::RBrack) {
            loop {
                let m = self.mark();
                elems.push(self.parse_expr());
                self.finish_node(CstKind::TupleItem, m);
                if self.match_token(TokenKind::Comma).is_none() {
                    break;
                }
                if self.check(TokenKind::RBrack) {
                    break;
                }
            }
        }
        let close = self.expect(TokenKind::RBrack, "to close the tuple");
        self.include_newlines.pop();
        let end_range = close
            .map(|t| t.range)
            .or_else(|| elems.last().map(|e| e.range.clone()))
            .unwrap_or_else(|| open.range.clone());
        Expression {
            range: open.range.union(&end_range),
            kind: ExprKind::Tuple(elems),
        }
    }

    /// Object := "{" (Item ((","|NEWLINE) Item)*)? "}" | "{" "for" ... "}"
    /// Item   := Key ("=" | ":") Expr
    fn parse_object_or_for(&mut self) -> Expression {
        let open = self.next();
        self.include_newlines.push(false);
        let is_for = self.at_for_keyword();
        self.include_newlines.pop();
        if is_for {
            self.include_newlines.push(false);
            let expr = self.parse_for(open, TokenKind::RBrace, true);
            self.include_newlines.pop();
            return expr;
        }
        // Object items may be separated by newlines as well as commas.
        self.include_newlines.push(true);
        let mut items = Vec::new();
        loop {
            while self.check(TokenKind::Newline) {
                self.next();
            }
            if self.check(TokenKind::RBrace) || self.check(TokenKind::Eof) {
                break;
            }
            let m = self.mark();
            let key = self.parse_object_key();
            if self.match_token(TokenKind::Equal).is_none()
                && self.match_token(TokenKind::Colon).is_none()
            {
                let here = self.here();
                self.error(
                    "Missing attribute value",
                    "Expected \"=\" or \":\" after the object key.".to_string(),
                    here,
                );
                self.recover_past_newline();
                continue;
            }
            let value = self.parse_expr();
            self.finish_node(CstKind::ObjectItem, m);
            items.push(ObjectItem { key, value });
            if self.match_token(TokenKind::Comma).is_some() {
                continue;
            }
            if self.check(TokenKind::Newline) {
                self.next();
                continue;
            }
            break;
        }
        let close = self.expect(TokenKind::RBrace, "to close the object");
        self.include_newlines.pop();
        let end_range = close
            .map(|t| t.range)
            .unwrap_or_else(|| open.range.clone());
        Expression {
            range: open.range.union(&end_range),
            kind: ExprKind::Object(items),
        }
    }

    /// A bare identifier key is shorthand for a literal string; wrap a
    /// key in parentheses to compute it.
    fn parse_object_key(&mut self) -> Expression {
        if self.check(TokenKind::Ident) {
            let t = self.next();
            return Expression::literal(Value::string(t.text), t.range);
        }
        self.parse_expr()
    }

    fn at_for_keyword(&mut self) -> bool {
        self.peek_kind() == TokenKind::Ident
            && self.peek().text == "for"
            && matches!(self.nth_kind(1), TokenKind::Ident)
    }

    /// For := "for" IDENT ("," IDENT)? "in" Expr ":" Expr
    ///        ("=>" Expr "..."?)? ("if" Expr)?
    fn parse_for(&mut self, open: Token, close: TokenKind, object_form: bool) -> Expression {
        self.next(); // "for"
        let first = match self.expect(TokenKind::Ident, "to name the iteration variable") {
            Some(t) => t,
            None => {
                self.recover_past_close(
                    if object_form { TokenKind::LBrace } else { TokenKind::LBrack },
                    close,
                );
                return self.error_expr(open.range);
            }
        };
        let (key_var, val_var) = if self.match_token(TokenKind::Comma).is_some() {
            let second = self.expect(TokenKind::Ident, "to name the value variable");
            match second {
                Some(t) => (Some(first.text), t.text),
                None => (None, first.text),
            }
        } else {
            (None, first.text)
        };

        let in_ok = matches!(self.peek_kind(), TokenKind::Ident) && self.peek().text == "in";
        if in_ok {
            self.next();
        } else {
            let here = self.here();
            self.error(
                "Missing \"in\" keyword",
                "A for expression requires \"in\" between its variables and the collection.".to_string(),
                here,
            );
        }
        let collection = self.parse_expr();
        self.expect(TokenKind::Colon, "after the for collection");

        let (key_expr, val_expr, grouping) = if object_form {
            let key = self.parse_expr();
            self.expect(TokenKind::FatArrow, "between the key and value of the for object");
            let val = self.parse_expr();
            let grouping = self.match_token(TokenKind::Ellipsis).is_some();
            (Some(key), val, grouping)
        } else {
            (None, self.parse_expr(), false)
        };

        let cond_expr = if self.peek_kind() == TokenKind::Ident && self.peek().text == "if" {
            self.next();
            Some(self.parse_expr())
        } else {
            None
        };

        let close_tok = self.expect(close, "to close the for expression");
        let end_range = close_tok
            .map(|t| t.range)
            .unwrap_or_else(|| val_expr.range.clone());
        Expression {
            range: open.range.union(&end_range),
            kind: ExprKind::For(Box::new(ForExpr {
                key_var,
                val_var,
                collection,
                key_expr,
                val_expr,
                cond_expr,
                grouping,
            })),
        }
    }

    // === Templates ===

    /// QuotedTemplate := '"' (LITERAL | "${" Expr "}" | "%{" Directive "}")* '"'
    pub(crate) fn parse_quoted_template(&mut self) -> Expression {
        let m = self.mark();
        let open = match self.expect(TokenKind::OQuote, "to open the string") {
            Some(t) => t,
            None => {
                let r = self.here();
                return self.error_expr(r);
            }
        };
        let (parts, _) = self.template_seq(TokenKind::CQuote, true, &[]);
        self.finish_node(CstKind::Template, m);
        let end = self
            .tokens
            .get(self.pos.saturating_sub(1))
            .map(|t| t.range.clone())
            .unwrap_or_else(|| open.range.clone());
        let range = open.range.union(&end);
        template_expr(parts, range)
    }

    /// Heredoc := "<<" "-"? IDENT NEWLINE (LINE NEWLINE)* IDENT
    fn parse_heredoc_template(&mut self) -> Expression {
        let m = self.mark();
        let open = self.next();
        let strip = open.text.starts_with("<<-");
        let (mut parts, _) = self.template_seq(TokenKind::CHeredoc, false, &[]);
        self.finish_node(CstKind::Template, m);
        if strip {
            strip_heredoc_indent(&mut parts);
        }
        let end = self
            .tokens
            .get(self.pos.saturating_sub(1))
            .map(|t| t.range.clone())
            .unwrap_or_else(|| open.range.clone());
        let range = open.range.union(&end);
        if parts.is_empty() {
            return Expression::literal(Value::string(""), range);
        }
        if parts.iter().all(|p| matches!(p, TemplatePart::Literal { .. })) {
            let mut text = String::new();
            for p in &parts {
                if let TemplatePart::Literal { text: t, .. } = p {
                    text.push_str(t);
                }
            }
            return Expression::literal(Value::string(text), range);
        }
        Expression {
            kind: ExprKind::Template(parts),
            range,
        }
    }

    /// Consumes template parts until the closing token or one of
    /// `stop_words` appears as a `%{ ... }` directive keyword. Returns
    /// the parts and the stopping keyword, if any.
    fn template_seq(
        &mut self,
        end: TokenKind,
        escapes: bool,
        stop_words: &[&str],
    ) -> (Vec<TemplatePart>, Option<String>) {
        let mut parts = Vec::new();
        loop {
            match self.peek_kind() {
                k if k == end => {
                    self.next();
                    return (parts, None);
                }
                TokenKind::StringLit => {
                    let t = self.next();
                    let text = self.decode_literal(&t, escapes);
                    parts.push(TemplatePart::Literal {
                        text,
                        range: t.range,
                    });
                }
                TokenKind::TemplateInterp => {
                    self.next();
                    self.include_newlines.push(false);
                    let e = self.parse_expr();
                    self.expect(TokenKind::TemplateSeqEnd, "to close the interpolation");
                    self.include_newlines.pop();
                    parts.push(TemplatePart::Interp(e));
                }
                TokenKind::TemplateControl => {
                    let ctl = self.next();
                    self.include_newlines.push(false);
                    let keyword = match self.match_token(TokenKind::Ident) {
                        Some(t) => t.text,
                        None => {
                            let here = self.here();
                            self.error(
                                "Invalid template directive",
                                "Expected a directive keyword after \"%{\".".to_string(),
                                here,
                            );
                            self.skip_to_seq_end();
                            self.include_newlines.pop();
                            continue;
                        }
                    };
                    if stop_words.contains(&keyword.as_str()) {
                        self.expect(TokenKind::TemplateSeqEnd, "to close the directive");
                        self.include_newlines.pop();
                        return (parts, Some(keyword));
                    }
                    match keyword.as_str() {
                        "if" => {
                            let part = self.parse_template_if(end, escapes);
                            self.include_newlines.pop();
                            parts.push(part);
                        }
                        "for" => {
                            let part = self.parse_template_for(end, escapes);
                            self.include_newlines.pop();
                            parts.push(part);
                        }
                        _ => {
                            self.error(
                                "Invalid template directive",
                                format!(
                                    "\"{keyword}\" is not a template directive; expected \"if\" or \"for\"."
                                ),
                                ctl.range.clone(),
                            );
                            self.skip_to_seq_end();
                            self.include_newlines.pop();
                        }
                    }
                }
                TokenKind::Eof => {
                    let here = self.here();
                    self.error(
                        "Unterminated template",
                        "The template is missing its closing delimiter.".to_string(),
                        here,
                    );
                    return (parts, None);
                }
                _ => {
                    // Stray token inside a template; skip it to make
                    // progress.
                    self.next();
                }
            }
        }
    }

    /// `%{ if c }A%{ else }B%{ endif }` becomes a conditional between two
    /// sub-templates.
    fn parse_template_if(&mut self, end: TokenKind, escapes: bool) -> TemplatePart {
        let cond = self.parse_expr();
        self.expect(TokenKind::TemplateSeqEnd, "to close the if directive");
        let (true_parts, term) = self.template_seq(end, escapes, &["else", "endif"]);
        let true_range = cond.range.clone();
        let (false_parts, term) = match term.as_deref() {
            Some("else") => {
                let (p, t) = self.template_seq(end, escapes, &["endif"]);
                (p, t)
            }
            other => (Vec::new(), other.map(str::to_string)),
        };
        if term.as_deref() != Some("endif") {
            self.error(
                "Unterminated if directive",
                "This template if has no matching \"%{ endif }\".".to_string(),
                true_range.clone(),
            );
        }
        let range = cond.range.clone();
        TemplatePart::Interp(Expression {
            kind: ExprKind::Conditional {
                cond: Box::new(cond),
                true_expr: Box::new(template_expr(true_parts, range.clone())),
                false_expr: Box::new(template_expr(false_parts, range.clone())),
            },
            range,
        })
    }

    /// `%{ for x in c }...%{ endfor }` becomes a for expression whose
    /// tuple of rendered bodies joins into one string.
    fn parse_template_for(&mut self, end: TokenKind, escapes: bool) -> TemplatePart {
        let first = self.match_token(TokenKind::Ident);
        let (key_var, val_var) = if self.match_token(TokenKind::Comma).is_some() {
            let second = self.match_token(TokenKind::Ident);
            (
                first.map(|t| t.text),
                second.map(|t| t.text).unwrap_or_default(),
            )
        } else {
            (None, first.map(|t| t.text).unwrap_or_default())
        };
        if !(self.peek_kind() == TokenKind::Ident && self.peek().text == "in") {
            let here = self.here();
            self.error(
                "Missing \"in\" keyword",
                "A for directive requires \"in\" between its variables and the collection.".to_string(),
                here,
            );
        } else {
            self.next();
        }
        let collection = self.parse_expr();
        self.expect(TokenKind::TemplateSeqEnd, "to close the for directive");
        let (body_parts, term) = self.template_seq(end, escapes, &["endfor"]);
        if term.as_deref() != Some("endfor") {
            self.error(
                "Unterminated for directive",
                "This template for has no matching \"%{ endfor }\".".to_string(),
                collection.range.clone(),
            );
        }
        let range = collection.range.clone();
        let body = template_expr(body_parts, range.clone());
        TemplatePart::Interp(Expression {
            kind: ExprKind::TemplateJoin(Box::new(Expression {
                kind: ExprKind::For(Box::new(ForExpr {
                    key_var,
                    val_var,
                    collection,
                    key_expr: None,
                    val_expr: body,
                    cond_expr: None,
                    grouping: false,
                })),
                range: range.clone(),
            })),
            range,
        })
    }

    fn skip_to_seq_end(&mut self) {
        loop {
            match self.peek_kind() {
                TokenKind::TemplateSeqEnd => {
                    self.next();
                    return;
                }
                TokenKind::Eof => return,
                _ => {
                    self.next();
                }
            }
        }
    }

    /// Decodes a raw template literal chunk: backslash escapes (quoted
    /// strings only) and the `$${` / `%%{` delimiter escapes.
    fn decode_literal(&mut self, tok: &Token, escapes: bool) -> String {
        let mut out = String::with_capacity(tok.text.len());
        let mut chars = tok.text.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '\\' if escapes => match chars.next() {
                    Some('n') => out.push('\n'),
                    Some('r') => out.push('\r'),
                    Some('t') => out.push('\t'),
                    Some('\\') => out.push('\\'),
                    Some('"') => out.push('"'),
                    Some('u') => self.decode_unicode_escape(&mut chars, 4, tok, &mut out),
                    Some('U') => self.decode_unicode_escape(&mut chars, 8, tok, &mut out),
                    Some(other) => {
                        self.error(
                            "Invalid escape sequence",
                            format!("\"\\{other}\" is not a valid escape sequence."),
                            tok.range.clone(),
                        );
                        out.push(other);
                    }
                    None => {
                        self.error(
                            "Invalid escape sequence",
                            "The string ends in the middle of an escape sequence.".to_string(),
                            tok.range.clone(),
                        );
                    }
                },
                '$' if chars.peek() == Some(&'$') => {
                    // Only an escape when it guards a "{".
                    let mut look = chars.clone();
                    look.next();
                    if look.peek() == Some(&'{') {
                        chars.next();
                        out.push('$');
                    } else {
                        out.push('$');
                    }
                }
                '%' if chars.peek() == Some(&'%') => {
                    let mut look = chars.clone();
                    look.next();
                    if look.peek() == Some(&'{') {
                        chars.next();
                        out.push('%');
                    } else {
                        out.push('%');
                    }
                }
                other => out.push(other),
            }
        }
        out
    }

    fn decode_unicode_escape(
        &mut self,
        chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
        digits: usize,
        tok: &Token,
        out: &mut String,
    ) {
        let mut hex = String::new();
        for _ in 0..digits {
            match chars.peek() {
                Some(c) if c.is_ascii_hexdigit() => {
                    hex.push(*c);
                    chars.next();
                }
                _ => break,
            }
        }
        let decoded = u32::from_str_radix(&hex, 16)
            .ok()
            .filter(|_| hex.len() == digits)
            .and_then(char::from_u32);
        match decoded {
            Some(c) => out.push(c),
            None => self.error(
                "Invalid escape sequence",
                format!("\"\\u{hex}\" is not a valid unicode escape."),
                tok.range.clone(),
            ),
        }
    }

    // === Traversals ===

    /// AbsTraversal := IDENT ("." IDENT | "[" (NUMBER | STRING) "]")*
    fn parse_traversal_abs(&mut self) -> Traversal {
        let root_tok = match self.expect(TokenKind::Ident, "to begin the traversal") {
            Some(t) => t,
            None => {
                let r = self.here();
                return Traversal {
                    root: String::new(),
                    root_range: r,
                    steps: Vec::new(),
                };
            }
        };
        let mut steps = Vec::new();
        loop {
            match self.peek_kind() {
                TokenKind::Dot => {
                    let dot = self.next();
                    match self.expect(TokenKind::Ident, "after \".\"") {
                        Some(t) => steps.push(TravStep {
                            kind: TravStepKind::Attr(t.text.clone()),
                            range: dot.range.union(&t.range),
                        }),
                        None => break,
                    }
                }
                TokenKind::LBrack => {
                    let open = self.next();
                    let key = self.parse_expr();
                    let close = self.expect(TokenKind::RBrack, "to close the index");
                    let range = close
                        .map(|t| open.range.union(&t.range))
                        .unwrap_or_else(|| open.range.union(&key.range));
                    match &key.kind {
                        ExprKind::Literal(v)
                            if v.as_string().is_some() || v.as_number().is_some() =>
                        {
                            steps.push(TravStep {
                                kind: TravStepKind::Index(v.clone()),
                                range,
                            });
                        }
                        _ => {
                            self.error(
                                "Invalid traversal index",
                                "Only literal string and number indices are allowed in a traversal.".to_string(),
                                key.range.clone(),
                            );
                        }
                    }
                }
                _ => break,
            }
        }
        Traversal {
            root: root_tok.text.clone(),
            root_range: root_tok.range,
            steps,
        }
    }
}

/// Builds the expression for a sequence of template parts, collapsing
/// pure-literal templates to string literals and a lone interpolation to
/// a pass-through wrap.
fn template_expr(mut parts: Vec<TemplatePart>, range: Range) -> Expression {
    if parts.is_empty() {
        return Expression::literal(Value::string(""), range);
    }
    if parts.len() == 1 {
        match parts.remove(0) {
            TemplatePart::Literal { text, .. } => {
                return Expression::literal(Value::string(text), range)
            }
            TemplatePart::Interp(e) => {
                return Expression {
                    kind: ExprKind::TemplateWrap(Box::new(e)),
                    range,
                }
            }
        }
    }
    if parts.iter().all(|p| matches!(p, TemplatePart::Literal { .. })) {
        let mut text = String::new();
        for p in &parts {
            if let TemplatePart::Literal { text: t, .. } = p {
                text.push_str(t);
            }
        }
        return Expression::literal(Value::string(text), range);
    }
    Expression {
        kind: ExprKind::Template(parts),
        range,
    }
}

/// For `<<-` heredocs: removes the longest common leading whitespace of
/// every line that begins in a literal part.
fn strip_heredoc_indent(parts: &mut [TemplatePart]) {
    let mut min_indent: Option<usize> = None;
    let mut at_line_start = true;
    for part in parts.iter() {
        match part {
            TemplatePart::Literal { text, .. } => {
                for (i, line) in text.split_inclusive('\n').enumerate() {
                    let starts_line = at_line_start || i > 0;
                    if starts_line && line.trim_end_matches(['\r', '\n']).trim().is_empty() {
                        continue; // blank lines don't constrain the indent
                    }
                    if starts_line {
                        let indent = line.len() - line.trim_start_matches([' ', '\t']).len();
                        min_indent = Some(min_indent.map_or(indent, |m| m.min(indent)));
                    }
                }
                at_line_start = text.ends_with('\n');
            }
            TemplatePart::Interp(_) => at_line_start = false,
        }
    }
    let strip = match min_indent {
        Some(n) if n > 0 => n,
        _ => return,
    };
    let mut at_line_start = true;
    for part in parts.iter_mut() {
        match part {
            TemplatePart::Literal { text, .. } => {
                let mut out = String::with_capacity(text.len());
                for (i, line) in text.split_inclusive('\n').enumerate() {
                    let starts_line = at_line_start || i > 0;
                    if starts_line {
                        let ws_len = line.len() - line.trim_start_matches([' ', '\t']).len();
                        out.push_str(&line[ws_len.min(strip)..]);
                    } else {
                        out.push_str(line);
                    }
                }
                at_line_start = text.ends_with('\n');
                *text = out;
            }
            TemplatePart::Interp(_) => at_line_start = false,
        }
    }
}
