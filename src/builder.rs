//! Source constructors for rewrite edits.
//!
//! [`Cst`](crate::cst::Cst) edits take replacement expressions as source
//! text. The helpers here produce well-formed snippets so callers do not
//! hand-assemble quoting and escaping. Everything returns a `String`
//! ready to pass to `set_attribute` and friends; the fallible
//! constructors validate their input the same way the edit methods do.

use crate::cst::RewriteError;
use crate::number::Number;
use crate::parser;
use crate::pos::Pos;
use crate::printer;
use crate::token::is_valid_identifier;

/// A quoted string literal with all necessary escapes applied.
pub fn string_lit(s: &str) -> String {
    printer::quote_string(s)
}

pub fn int_lit(v: i64) -> String {
    v.to_string()
}

pub fn number_lit(n: &Number) -> String {
    n.to_string()
}

pub fn bool_lit(b: bool) -> String {
    if b { "true" } else { "false" }.to_string()
}

pub fn null_lit() -> String {
    "null".to_string()
}

/// A bare identifier reference. Fails when `name` is not a valid
/// identifier, since writing it would corrupt the tree.
pub fn ident(name: &str) -> Result<String, RewriteError> {
    if !is_valid_identifier(name) {
        return Err(RewriteError::InvalidName { name: name.into() });
    }
    Ok(name.to_string())
}

/// A dotted traversal such as `a.b.c`. Every part must be a valid
/// identifier.
pub fn traversal(parts: &[&str]) -> Result<String, RewriteError> {
    if parts.is_empty() {
        return Err(RewriteError::InvalidExpression);
    }
    for part in parts {
        if !is_valid_identifier(part) {
            return Err(RewriteError::InvalidName {
                name: (*part).into(),
            });
        }
    }
    Ok(parts.join("."))
}

pub fn tuple(elems: &[String]) -> String {
    format!("[{}]", elems.join(", "))
}

/// An object literal from key/value snippet pairs. Keys that are not
/// valid identifiers are quoted.
pub fn object(items: &[(String, String)]) -> String {
    if items.is_empty() {
        return "{}".to_string();
    }
    let rendered: Vec<String> = items
        .iter()
        .map(|(k, v)| {
            let key = if is_valid_identifier(k) {
                k.clone()
            } else {
                printer::quote_string(k)
            };
            format!("{key} = {v}")
        })
        .collect();
    format!("{{ {} }}", rendered.join(", "))
}

/// Arbitrary expression source, validated by parsing. Use this when a
/// caller already has the text of the expression to install.
pub fn raw(src: &str) -> Result<String, RewriteError> {
    let (_, diags) = parser::parse_expression(src, "<builder>", Pos::start());
    if diags.has_errors() {
        return Err(RewriteError::InvalidExpression);
    }
    Ok(src.to_string())
}
