use crate::ast::*;
use crate::token::is_valid_identifier;
use crate::value::Value;
use std::fmt::Write;

/// Prints a body in canonical form: two-space indentation, one space
/// around `=`, minimal parentheses. This is a plain rendering of the
/// AST, unrelated to the trivia-preserving rewrite tree.
pub fn print_body(body: &Body) -> String {
    let mut p = Printer {
        out: String::new(),
        indent: 0,
    };
    p.body(body);
    p.out
}

/// Renders a string as a quoted template literal, escaping quotes,
/// backslashes, control characters, and interpolation openers.
pub fn quote_string(s: &str) -> String {
    let mut p = Printer {
        out: String::new(),
        indent: 0,
    };
    p.string_quoted(s);
    p.out
}

pub fn print_expression(expr: &Expression) -> String {
    let mut p = Printer {
        out: String::new(),
        indent: 0,
    };
    p.expr(expr, 0);
    p.out
}

impl std::fmt::Display for Expression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&print_expression(self))
    }
}

struct Printer {
    out: String,
    indent: usize,
}

/// Precedence contexts, from loosest to tightest. Binary operators use
/// their own table shifted up by one so that conditionals sit below
/// everything.
const PREC_LOWEST: u8 = 0;
const PREC_UNARY: u8 = 8;

impl Printer {
    fn line_start(&mut self) {
        for _ in 0..self.indent {
            self.out.push_str("  ");
        }
    }

    fn body(&mut self, body: &Body) {
        for item in &body.items {
            match item {
                Item::Attribute(attr) => {
                    self.line_start();
                    self.out.push_str(&attr.name);
                    self.out.push_str(" = ");
                    self.expr(&attr.expr, PREC_LOWEST);
                    self.out.push('\n');
                }
                Item::Block(block) => {
                    self.line_start();
                    self.out.push_str(&block.type_name);
                    for label in &block.labels {
                        self.out.push(' ');
                        self.string_quoted(&label.value);
                    }
                    self.out.push_str(" {\n");
                    self.indent += 1;
                    self.body(&block.body);
                    self.indent -= 1;
                    self.line_start();
                    self.out.push_str("}\n");
                }
            }
        }
    }

    /// Prints an expression, parenthesizing when its own binding power
    /// is below the context's.
    fn expr(&mut self, e: &Expression, prec: u8) {
        match &e.kind {
            ExprKind::Literal(v) => self.value(v),
            ExprKind::ScopeTraversal(t) => {
                self.out.push_str(&t.root);
                self.steps(&t.steps);
            }
            ExprKind::RelativeTraversal { base, steps } => {
                self.expr(base, PREC_UNARY + 1);
                self.steps(steps);
            }
            ExprKind::Index { collection, key } => {
                self.expr(collection, PREC_UNARY + 1);
                self.out.push('[');
                self.expr(key, PREC_LOWEST);
                self.out.push(']');
            }
            ExprKind::FunctionCall {
                name,
                args,
                expand_final,
                ..
            } => {
                self.out.push_str(name);
                self.out.push('(');
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        self.out.push_str(", ");
                    }
                    self.expr(arg, PREC_LOWEST);
                }
                if *expand_final {
                    self.out.push_str("...");
                }
                self.out.push(')');
            }
            ExprKind::Conditional {
                cond,
                true_expr,
                false_expr,
            } => {
                let needs_parens = prec > PREC_LOWEST;
                if needs_parens {
                    self.out.push('(');
                }
                self.expr(cond, 1);
                self.out.push_str(" ? ");
                self.expr(true_expr, PREC_LOWEST);
                self.out.push_str(" : ");
                self.expr(false_expr, PREC_LOWEST);
                if needs_parens {
                    self.out.push(')');
                }
            }
            ExprKind::BinaryOp { lhs, op, rhs } => {
                let own = op.precedence() + 1;
                let needs_parens = own < prec;
                if needs_parens {
                    self.out.push('(');
                }
                self.expr(lhs, own);
                let _ = write!(self.out, " {} ", op.symbol());
                // Left associative: an equal-precedence right child needs
                // its own parentheses.
                self.expr(rhs, own + 1);
                if needs_parens {
                    self.out.push(')');
                }
            }
            ExprKind::UnaryOp { op, operand } => {
                let needs_parens = PREC_UNARY < prec;
                if needs_parens {
                    self.out.push('(');
                }
                self.out.push_str(op.symbol());
                self.expr(operand, PREC_UNARY);
                if needs_parens {
                    self.out.push(')');
                }
            }
            ExprKind::Template(parts) => {
                self.out.push('"');
                for part in parts {
                    self.template_part(part);
                }
                self.out.push('"');
            }
            ExprKind::TemplateWrap(inner) => {
                self.out.push_str("\"${");
                self.expr(inner, PREC_LOWEST);
                self.out.push_str("}\"");
            }
            ExprKind::TemplateJoin(inner) => {
                // The join of a for over template bodies prints as the
                // directive it came from.
                if let ExprKind::For(f) = &inner.kind {
                    self.out.push('"');
                    self.template_for(f);
                    self.out.push('"');
                } else {
                    self.out.push_str("\"${");
                    self.expr(inner, PREC_LOWEST);
                    self.out.push_str("}\"");
                }
            }
            ExprKind::For(f) => self.for_expr(f),
            ExprKind::Tuple(elems) => {
                self.out.push('[');
                for (i, elem) in elems.iter().enumerate() {
                    if i > 0 {
                        self.out.push_str(", ");
                    }
                    self.expr(elem, PREC_LOWEST);
                }
                self.out.push(']');
            }
            ExprKind::Object(items) => {
                if items.is_empty() {
                    self.out.push_str("{}");
                    return;
                }
                self.out.push_str("{ ");
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        self.out.push_str(", ");
                    }
                    self.object_key(&item.key);
                    self.out.push_str(" = ");
                    self.expr(&item.value, PREC_LOWEST);
                }
                self.out.push_str(" }");
            }
            ExprKind::Splat { source, each, kind } => {
                self.expr(source, PREC_UNARY + 1);
                self.out.push_str(match kind {
                    SplatKind::Attr => ".*",
                    SplatKind::Full => "[*]",
                });
                self.splat_suffix(each);
            }
            ExprKind::AnonSymbol => {}
        }
    }

    fn steps(&mut self, steps: &[TravStep]) {
        for step in steps {
            match &step.kind {
                TravStepKind::Attr(name) => {
                    self.out.push('.');
                    self.out.push_str(name);
                }
                TravStepKind::Index(v) => {
                    self.out.push('[');
                    self.value(v);
                    self.out.push(']');
                }
            }
        }
    }

    /// The per-element part of a splat, printed as the steps hanging off
    /// the anonymous symbol.
    fn splat_suffix(&mut self, each: &Expression) {
        match &each.kind {
            ExprKind::AnonSymbol => {}
            ExprKind::RelativeTraversal { base, steps } => {
                self.splat_suffix(base);
                self.steps(steps);
            }
            ExprKind::Index { collection, key } => {
                self.splat_suffix(collection);
                self.out.push('[');
                self.expr(key, PREC_LOWEST);
                self.out.push(']');
            }
            _ => self.expr(each, PREC_UNARY + 1),
        }
    }

    fn for_expr(&mut self, f: &ForExpr) {
        let object_form = f.key_expr.is_some();
        self.out.push(if object_form { '{' } else { '[' });
        self.out.push_str("for ");
        if let Some(k) = &f.key_var {
            self.out.push_str(k);
            self.out.push_str(", ");
        }
        self.out.push_str(&f.val_var);
        self.out.push_str(" in ");
        self.expr(&f.collection, PREC_LOWEST);
        self.out.push_str(" : ");
        if let Some(key_expr) = &f.key_expr {
            self.expr(key_expr, PREC_LOWEST);
            self.out.push_str(" => ");
        }
        self.expr(&f.val_expr, PREC_LOWEST);
        if f.grouping {
            self.out.push_str("...");
        }
        if let Some(cond) = &f.cond_expr {
            self.out.push_str(" if ");
            self.expr(cond, PREC_LOWEST);
        }
        self.out.push(if object_form { '}' } else { ']' });
    }

    fn template_for(&mut self, f: &ForExpr) {
        self.out.push_str("%{ for ");
        if let Some(k) = &f.key_var {
            self.out.push_str(k);
            self.out.push_str(", ");
        }
        self.out.push_str(&f.val_var);
        self.out.push_str(" in ");
        self.expr(&f.collection, PREC_LOWEST);
        self.out.push_str(" }");
        match &f.val_expr.kind {
            ExprKind::Template(parts) => {
                for part in parts {
                    self.template_part(part);
                }
            }
            ExprKind::Literal(v) if v.as_string().is_some() => {
                self.template_text(v.as_string().unwrap());
            }
            _ => {
                self.out.push_str("${");
                self.expr(&f.val_expr, PREC_LOWEST);
                self.out.push('}');
            }
        }
        self.out.push_str("%{ endfor }");
    }

    fn template_part(&mut self, part: &TemplatePart) {
        match part {
            TemplatePart::Literal { text, .. } => self.template_text(text),
            TemplatePart::Interp(e) => {
                self.out.push_str("${");
                self.expr(e, PREC_LOWEST);
                self.out.push('}');
            }
        }
    }

    fn object_key(&mut self, key: &Expression) {
        if let ExprKind::Literal(v) = &key.kind {
            if let Some(s) = v.as_string() {
                if is_valid_identifier(s) {
                    self.out.push_str(s);
                    return;
                }
            }
        }
        if matches!(key.kind, ExprKind::Literal(_) | ExprKind::Template(_)) {
            self.expr(key, PREC_LOWEST);
        } else {
            // A computed key needs parentheses so it does not read as a
            // bare name.
            self.out.push('(');
            self.expr(key, PREC_LOWEST);
            self.out.push(')');
        }
    }

    fn value(&mut self, v: &Value) {
        if v.is_unknown() {
            self.out.push_str("(unknown)");
            return;
        }
        if v.is_null() {
            self.out.push_str("null");
            return;
        }
        if let Some(s) = v.as_string() {
            self.string_quoted(s);
        } else if let Some(n) = v.as_number() {
            let _ = write!(self.out, "{n}");
        } else if let Some(b) = v.as_bool() {
            self.out.push_str(if b { "true" } else { "false" });
        } else if let Some(elems) = v.as_seq() {
            self.out.push('[');
            for (i, e) in elems.iter().enumerate() {
                if i > 0 {
                    self.out.push_str(", ");
                }
                self.value(e);
            }
            self.out.push(']');
        } else if let Some(entries) = v.as_map() {
            if entries.is_empty() {
                self.out.push_str("{}");
                return;
            }
            self.out.push_str("{ ");
            for (i, (k, e)) in entries.iter().enumerate() {
                if i > 0 {
                    self.out.push_str(", ");
                }
                if is_valid_identifier(k) {
                    self.out.push_str(k);
                } else {
                    self.string_quoted(k);
                }
                self.out.push_str(" = ");
                self.value(e);
            }
            self.out.push_str(" }");
        }
    }

    fn string_quoted(&mut self, s: &str) {
        self.out.push('"');
        self.template_text(s);
        self.out.push('"');
    }

    /// Escapes text for inclusion in a quoted template.
    fn template_text(&mut self, s: &str) {
        let mut chars = s.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '\\' => self.out.push_str("\\\\"),
                '"' => self.out.push_str("\\\""),
                '\n' => self.out.push_str("\\n"),
                '\r' => self.out.push_str("\\r"),
                '\t' => self.out.push_str("\\t"),
                '$' if chars.peek() == Some(&'{') => self.out.push_str("$${"),
                '%' if chars.peek() == Some(&'{') => self.out.push_str("%%{"),
                c if (c as u32) < 0x20 => {
                    let _ = write!(self.out, "\\u{:04x}", c as u32);
                }
                c => self.out.push(c),
            }
        }
    }
}
