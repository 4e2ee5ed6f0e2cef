use crate::ast::*;
use crate::diag::{Diagnostic, Diagnostics};
use crate::number::Number;
use crate::parser;
use crate::pos::{Pos, Range};
use crate::value::{Type, Value};
use std::sync::Arc;

/// Parses a JSON document into the same body model as native syntax.
/// The top level must be an object; each key becomes an attribute.
/// String values are themselves templates, so `"${var}"` interpolates
/// when evaluated.
///
/// JSON has no block syntax. Object and array-of-object values
/// additionally record block-shaped alternatives, which schema
/// extraction uses when a schema asks for a block of that name.
pub fn parse_json(src: &str, filename: &str) -> (Body, Diagnostics) {
    let mut p = JsonParser {
        src,
        filename: Arc::from(filename),
        pos: Pos::start(),
        diags: Diagnostics::new(),
    };
    p.skip_ws();
    let start = p.pos;
    let body = match p.peek() {
        Some('{') => {
            let body = p.parse_body();
            p.skip_ws();
            if p.peek().is_some() {
                p.error(
                    "Extra characters after JSON document",
                    "The top-level JSON object ended but more input remains.",
                    p.pos,
                );
            }
            body
        }
        _ => {
            p.error(
                "Invalid JSON document",
                "The top level of a JSON configuration must be a JSON object.",
                start,
            );
            p.empty_body(start)
        }
    };
    (body, p.diags)
}

struct JsonParser<'a> {
    src: &'a str,
    filename: Arc<str>,
    pos: Pos,
    diags: Diagnostics,
}

impl<'a> JsonParser<'a> {
    fn rest(&self) -> &'a str {
        &self.src[self.pos.byte..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos.advance(c);
        Some(c)
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(' ' | '\t' | '\n' | '\r')) {
            self.bump();
        }
    }

    fn error(&mut self, summary: &str, detail: &str, start: Pos) {
        let end = if self.pos.byte > start.byte {
            self.pos
        } else {
            start
        };
        self.diags.push(Diagnostic::error(
            summary,
            detail,
            Range::new(self.filename.clone(), start, end),
        ));
    }

    fn range_from(&self, start: Pos) -> Range {
        Range::new(self.filename.clone(), start, self.pos)
    }

    fn empty_body(&self, at: Pos) -> Body {
        Body {
            items: Vec::new(),
            range: Range::at(self.filename.clone(), at),
            end_range: Range::at(self.filename.clone(), at),
        }
    }

    /// Parses a JSON object as a body: `{ "name": value, ... }`. The
    /// opening brace is at the cursor.
    fn parse_body(&mut self) -> Body {
        let start = self.pos;
        self.bump(); // "{"
        let mut items = Vec::new();
        self.skip_ws();
        if self.peek() == Some('}') {
            let end_start = self.pos;
            self.bump();
            return Body {
                items,
                range: self.range_from(start),
                end_range: Range::new(self.filename.clone(), end_start, self.pos),
            };
        }
        loop {
            self.skip_ws();
            let key_start = self.pos;
            let name = match self.parse_string_raw() {
                Some(s) => s,
                None => break,
            };
            let name_range = self.range_from(key_start);
            self.skip_ws();
            let colon_start = self.pos;
            if self.peek() == Some(':') {
                self.bump();
            } else {
                self.error(
                    "Missing colon in JSON object",
                    "Each object key must be followed by \":\" and a value.",
                    self.pos,
                );
                break;
            }
            let equals_range = self.range_from(colon_start);
            self.skip_ws();
            match self.parse_value() {
                Some((expr, json_alt)) => {
                    let range = name_range.union(&expr.range);
                    items.push(Item::Attribute(Attribute {
                        name,
                        expr,
                        name_range,
                        equals_range,
                        range,
                        json_alt,
                    }));
                }
                None => break,
            }
            self.skip_ws();
            match self.peek() {
                Some(',') => {
                    self.bump();
                }
                Some('}') => break,
                _ => {
                    self.error(
                        "Missing comma in JSON object",
                        "Object entries must be separated by commas.",
                        self.pos,
                    );
                    break;
                }
            }
        }
        self.skip_ws();
        let end_start = self.pos;
        if self.peek() == Some('}') {
            self.bump();
        } else {
            self.error(
                "Unclosed JSON object",
                "The input ended before this object's closing brace.",
                end_start,
            );
        }
        Body {
            items,
            range: self.range_from(start),
            end_range: Range::new(self.filename.clone(), end_start, self.pos),
        }
    }

    /// Parses one JSON value as an expression, plus its block-shaped
    /// alternatives when it is an object or an array of objects.
    fn parse_value(&mut self) -> Option<(Expression, Vec<Body>)> {
        let start = self.pos;
        match self.peek()? {
            '"' => {
                let content_start = Pos {
                    byte: self.pos.byte + 1,
                    line: self.pos.line,
                    column: self.pos.column + 1,
                };
                let text = self.parse_string_raw()?;
                // A JSON string value is template source.
                let (expr, tmpl_diags) =
                    parser::parse_template(&text, &self.filename, content_start);
                self.diags.extend(tmpl_diags);
                let range = self.range_from(start);
                Some((
                    Expression {
                        kind: expr.kind,
                        range,
                    },
                    Vec::new(),
                ))
            }
            '{' => {
                let body = self.parse_body();
                let expr = body_as_object_expr(&body);
                Some((expr, vec![body]))
            }
            '[' => self.parse_array(),
            't' if self.rest().starts_with("true") => {
                for _ in 0..4 {
                    self.bump();
                }
                Some((
                    Expression::literal(Value::bool(true), self.range_from(start)),
                    Vec::new(),
                ))
            }
            'f' if self.rest().starts_with("false") => {
                for _ in 0..5 {
                    self.bump();
                }
                Some((
                    Expression::literal(Value::bool(false), self.range_from(start)),
                    Vec::new(),
                ))
            }
            'n' if self.rest().starts_with("null") => {
                for _ in 0..4 {
                    self.bump();
                }
                Some((
                    Expression::literal(Value::null(Type::Dynamic), self.range_from(start)),
                    Vec::new(),
                ))
            }
            c if c == '-' || c.is_ascii_digit() => self.parse_number(),
            _ => {
                self.error(
                    "Invalid JSON value",
                    "Expected a JSON value here.",
                    start,
                );
                None
            }
        }
    }

    fn parse_array(&mut self) -> Option<(Expression, Vec<Body>)> {
        let start = self.pos;
        self.bump(); // "["
        let mut elems = Vec::new();
        let mut alts: Vec<Body> = Vec::new();
        let mut all_objects = true;
        self.skip_ws();
        if self.peek() == Some(']') {
            self.bump();
            return Some((
                Expression {
                    kind: ExprKind::Tuple(elems),
                    range: self.range_from(start),
                },
                Vec::new(),
            ));
        }
        loop {
            self.skip_ws();
            let (expr, elem_alts) = self.parse_value()?;
            if elem_alts.len() == 1 && matches!(expr.kind, ExprKind::Object(_)) {
                alts.extend(elem_alts);
            } else {
                all_objects = false;
            }
            elems.push(expr);
            self.skip_ws();
            match self.peek() {
                Some(',') => {
                    self.bump();
                }
                Some(']') => {
                    self.bump();
                    break;
                }
                _ => {
                    self.error(
                        "Unclosed JSON array",
                        "Array elements must be separated by commas and ended with \"]\".",
                        self.pos,
                    );
                    break;
                }
            }
        }
        let json_alt = if all_objects && !alts.is_empty() {
            alts
        } else {
            Vec::new()
        };
        Some((
            Expression {
                kind: ExprKind::Tuple(elems),
                range: self.range_from(start),
            },
            json_alt,
        ))
    }

    fn parse_number(&mut self) -> Option<(Expression, Vec<Body>)> {
        let start = self.pos;
        let neg = self.peek() == Some('-');
        if neg {
            self.bump();
        }
        let digits_start = self.pos.byte;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit() || c == '.' || c == 'e' || c == 'E' || c == '+' || c == '-')
        {
            self.bump();
        }
        let text = &self.src[digits_start..self.pos.byte];
        match Number::from_literal(text) {
            Ok(n) => {
                let n = if neg { n.neg() } else { n };
                Some((
                    Expression::literal(Value::number(n), self.range_from(start)),
                    Vec::new(),
                ))
            }
            Err(err) => {
                self.error(
                    "Invalid JSON number",
                    &format!("This is not a valid number: {err}."),
                    start,
                );
                None
            }
        }
    }

    /// Parses a JSON string literal, decoding its escapes. The opening
    /// quote is at the cursor.
    fn parse_string_raw(&mut self) -> Option<String> {
        let start = self.pos;
        if self.peek() != Some('"') {
            self.error(
                "Invalid JSON string",
                "Expected a double-quoted string here.",
                start,
            );
            return None;
        }
        self.bump();
        let mut out = String::new();
        loop {
            match self.bump() {
                None => {
                    self.error(
                        "Unterminated JSON string",
                        "The input ended before this string's closing quote.",
                        start,
                    );
                    return None;
                }
                Some('"') => return Some(out),
                Some('\\') => match self.bump() {
                    Some('"') => out.push('"'),
                    Some('\\') => out.push('\\'),
                    Some('/') => out.push('/'),
                    Some('b') => out.push('\u{0008}'),
                    Some('f') => out.push('\u{000C}'),
                    Some('n') => out.push('\n'),
                    Some('r') => out.push('\r'),
                    Some('t') => out.push('\t'),
                    Some('u') => match self.parse_unicode_escape() {
                        Some(c) => out.push(c),
                        None => {
                            self.error(
                                "Invalid JSON string",
                                "This \\u escape is not a valid unicode scalar.",
                                start,
                            );
                        }
                    },
                    _ => {
                        self.error(
                            "Invalid JSON string",
                            "This backslash escape is not valid JSON.",
                            start,
                        );
                    }
                },
                Some(c) => out.push(c),
            }
        }
    }

    fn parse_unicode_escape(&mut self) -> Option<char> {
        let first = self.hex4()?;
        // Surrogate pairs encode characters outside the basic plane.
        if (0xD800..0xDC00).contains(&first) {
            if self.peek() == Some('\\') {
                self.bump();
                if self.peek() == Some('u') {
                    self.bump();
                    let second = self.hex4()?;
                    if (0xDC00..0xE000).contains(&second) {
                        let c = 0x10000 + ((first - 0xD800) << 10) + (second - 0xDC00);
                        return char::from_u32(c);
                    }
                }
            }
            return None;
        }
        char::from_u32(first)
    }

    fn hex4(&mut self) -> Option<u32> {
        let mut v = 0u32;
        for _ in 0..4 {
            let c = self.bump()?;
            v = v * 16 + c.to_digit(16)?;
        }
        Some(v)
    }
}

/// The expression form of a JSON object body, for schemas that read the
/// value as an attribute rather than as blocks.
fn body_as_object_expr(body: &Body) -> Expression {
    let items = body
        .items
        .iter()
        .filter_map(|item| match item {
            Item::Attribute(attr) => Some(ObjectItem {
                key: Expression::literal(Value::string(attr.name.clone()), attr.name_range.clone()),
                value: attr.expr.clone(),
            }),
            Item::Block(_) => None,
        })
        .collect();
    Expression {
        kind: ExprKind::Object(items),
        range: body.range.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::{self, EvalContext};
    use crate::schema::{BlockHeaderSchema, BodySchema};
    use crate::value::Value;

    fn parse_ok(src: &str) -> Body {
        let (body, diags) = parse_json(src, "test.bcl.json");
        assert!(!diags.has_errors(), "unexpected diagnostics: {diags}");
        body
    }

    #[test]
    fn test_scalar_values() {
        let body = parse_ok(r#"{"a": 1, "b": true, "c": null, "d": "text"}"#);
        assert_eq!(body.attributes().count(), 4);
        let ctx = EvalContext::new();
        let attrs: Vec<_> = body.attributes().collect();
        let (v, _) = eval::eval(&attrs[0].expr, &ctx);
        assert_eq!(v, Value::int(1));
        let (v, _) = eval::eval(&attrs[3].expr, &ctx);
        assert_eq!(v, Value::string("text"));
    }

    #[test]
    fn test_string_values_are_templates() {
        let body = parse_ok(r#"{"greeting": "hello ${name}"}"#);
        let attr = body.attributes().next().unwrap();
        let mut ctx = EvalContext::new();
        ctx.declare_variable("name", Value::string("world"));
        let (v, diags) = eval::eval(&attr.expr, &ctx);
        assert!(!diags.has_errors());
        assert_eq!(v, Value::string("hello world"));
    }

    #[test]
    fn test_top_level_must_be_object() {
        let (_, diags) = parse_json("[1, 2]", "t");
        assert!(diags.has_errors());
    }

    #[test]
    fn test_nested_object_prefers_attribute() {
        // Without a schema claiming a block, an object value is just an
        // object-typed attribute.
        let body = parse_ok(r#"{"settings": {"debug": true}}"#);
        let attr = body.attributes().next().unwrap();
        assert!(matches!(attr.expr.kind, ExprKind::Object(_)));
        assert_eq!(attr.json_alt.len(), 1);
    }

    #[test]
    fn test_schema_turns_objects_into_blocks() {
        let body = parse_ok(r#"{"server": {"web": {"port": 80}, "api": {"port": 81}}}"#);
        let schema = BodySchema {
            attributes: Vec::new(),
            blocks: vec![BlockHeaderSchema::new("server", &["name"])],
        };
        let (content, diags) = crate::schema::content(&body, &schema);
        assert!(!diags.has_errors(), "unexpected: {diags}");
        assert_eq!(content.blocks.len(), 2);
        let mut labels: Vec<_> = content.blocks.iter().map(|b| b.labels[0].clone()).collect();
        labels.sort();
        assert_eq!(labels, vec!["api", "web"]);
    }

    #[test]
    fn test_array_of_objects_becomes_repeated_blocks() {
        let body = parse_ok(r#"{"rule": [{"allow": true}, {"allow": false}]}"#);
        let schema = BodySchema {
            attributes: Vec::new(),
            blocks: vec![BlockHeaderSchema::new("rule", &[])],
        };
        let (content, diags) = crate::schema::content(&body, &schema);
        assert!(!diags.has_errors(), "unexpected: {diags}");
        assert_eq!(content.blocks.len(), 2);
    }

    #[test]
    fn test_escapes_decode() {
        let body = parse_ok(r#"{"s": "a\nbA😀"}"#);
        let attr = body.attributes().next().unwrap();
        let ctx = EvalContext::new();
        let (v, _) = eval::eval(&attr.expr, &ctx);
        assert_eq!(v, Value::string("a\nbA\u{1F600}"));
    }

    #[test]
    fn test_unterminated_string_diagnoses() {
        let (_, diags) = parse_json(r#"{"a": "oops"#, "t");
        assert!(diags.has_errors());
    }

    #[test]
    fn test_duplicate_keys_become_separate_attributes() {
        let body = parse_ok(r#"{"a": 1, "a": 2}"#);
        assert_eq!(body.attributes().count(), 2);
    }
}
