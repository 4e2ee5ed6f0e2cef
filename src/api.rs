use crate::ast::{Body, Expression, Traversal};
use crate::cst::Cst;
use crate::diag::Diagnostics;
use crate::eval::EvalContext;
use crate::json;
use crate::parser;
use crate::pos::Pos;
use crate::printer;
use crate::value::Value;
use std::fmt;

pub use crate::eval::eval;
pub use crate::format::format;
pub use crate::schema::{content, decode_body, partial_content};
pub use crate::walk::{walk_body, walk_expr};

/// The result of parsing one configuration file: the evaluable body
/// plus, for the native syntax, the lossless rewrite tree backing it.
pub struct File {
    pub body: Body,
    /// `None` for JSON sources; the rewrite surface exists only for the
    /// native syntax.
    pub cst: Option<Cst>,
    pub filename: String,
}

impl File {
    /// The exact source bytes, reconstructed from the rewrite tree.
    pub fn to_source(&self) -> Option<String> {
        self.cst.as_ref().map(Cst::to_source)
    }
}

/// Parses native configuration source. All syntax problems come back as
/// diagnostics; the returned body covers whatever could be recovered, so
/// callers can keep analyzing a broken file.
///
/// # Arguments
///
/// * `source` - The configuration source text.
/// * `filename` - The name reported in diagnostics for this source.
pub fn parse_config(source: &str, filename: &str) -> (File, Diagnostics) {
    let (body, cst, diags) = parser::parse_file(source, filename, Pos::start());
    (
        File {
            body,
            cst: Some(cst),
            filename: filename.to_string(),
        },
        diags,
    )
}

/// Parses a JSON document into the same body model the native parser
/// produces. String values are re-parsed as templates; whether an object
/// value is an attribute or a nested block is settled later by the
/// schema that decodes it.
pub fn parse_json(source: &str, filename: &str) -> (File, Diagnostics) {
    let (body, diags) = json::parse_json(source, filename);
    (
        File {
            body,
            cst: None,
            filename: filename.to_string(),
        },
        diags,
    )
}

/// Parses a standalone expression, e.g. the text of a command-line
/// override.
pub fn parse_expression(source: &str, filename: &str) -> (Expression, Diagnostics) {
    parser::parse_expression(source, filename, Pos::start())
}

/// Parses standalone template text, the whole string being template
/// body rather than a quoted literal.
pub fn parse_template(source: &str, filename: &str) -> (Expression, Diagnostics) {
    parser::parse_template(source, filename, Pos::start())
}

/// Parses an absolute traversal such as `a.b[0].c`, for address-like
/// references held outside any expression.
pub fn parse_traversal_abs(source: &str, filename: &str) -> (Traversal, Diagnostics) {
    parser::parse_traversal(source, filename, Pos::start())
}

/// Convenience for evaluating source text directly.
pub fn eval_expression(source: &str, filename: &str, ctx: &EvalContext<'_>) -> (Value, Diagnostics) {
    let (expr, mut diags) = parse_expression(source, filename);
    let (value, eval_diags) = eval(&expr, ctx);
    diags.extend(eval_diags);
    (value, diags)
}

/// Writes the canonical rendering of a body to a formatter sink. This
/// is the plain AST printer; comments and original spacing live only in
/// the rewrite tree.
pub fn print<W: fmt::Write>(body: &Body, out: &mut W) -> fmt::Result {
    out.write_str(&printer::print_body(body))
}

/// Serializes an evaluated value as pretty-printed JSON.
///
/// # Errors
///
/// Returns a `serde_json::Error` if serialization fails.
pub fn to_json(value: &Value) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::EvalContext;
    use crate::value::Value;

    #[test]
    fn test_parse_eval_to_json() {
        let source = "name = \"app\"\nport = 8000 + 80\nhosts = [\"a\", \"b\"]\n";
        let (file, diags) = parse_config(source, "test.bcl");
        assert!(!diags.has_errors());
        assert_eq!(file.to_source().as_deref(), Some(source));

        let ctx = EvalContext::new();
        let mut rendered: Vec<(String, Value)> = Vec::new();
        for attr in file.body.attributes() {
            let (v, eval_diags) = eval(&attr.expr, &ctx);
            assert!(!eval_diags.has_errors());
            rendered.push((attr.name.clone(), v));
        }
        assert_eq!(rendered[0].1, Value::string("app"));
        assert_eq!(rendered[1].1, Value::int(8080));

        let json = to_json(&rendered[2].1).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, serde_json::json!(["a", "b"]));
    }

    #[test]
    fn test_json_and_native_agree() {
        let (native, d1) = parse_config("a = true\n", "n.bcl");
        let (json_file, d2) = parse_json("{\"a\": true}", "j.json");
        assert!(!d1.has_errors() && !d2.has_errors());

        let ctx = EvalContext::new();
        let native_attr = native.body.attributes().next().unwrap();
        let json_attr = json_file.body.attributes().next().unwrap();
        let (nv, _) = eval(&native_attr.expr, &ctx);
        let (jv, _) = eval(&json_attr.expr, &ctx);
        assert_eq!(nv, jv);
        assert!(json_file.cst.is_none());
    }

    #[test]
    fn test_eval_expression_merges_diagnostics() {
        let ctx = EvalContext::new();
        let (_, diags) = eval_expression("1 +", "t", &ctx);
        assert!(diags.has_errors());
    }

    #[test]
    fn test_print_to_writer() {
        let (file, _) = parse_config("a   =   1\n", "t");
        let mut out = String::new();
        print(&file.body, &mut out).unwrap();
        assert_eq!(out, "a = 1\n");
    }
}
