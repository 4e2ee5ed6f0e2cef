// The JSON parser maps documents onto the same body model the native
// parser produces; schemas settle the attribute-versus-block ambiguity.

use bcl_core::eval::{eval, EvalContext};
use bcl_core::parse_json;
use bcl_core::schema::{content, BlockHeaderSchema, BodySchema};
use bcl_core::value::Value;

fn body_of(src: &str) -> bcl_core::ast::Body {
    let (file, diags) = parse_json(src, "test.json");
    assert!(!diags.has_errors(), "parse failed: {diags}");
    file.body
}

#[test]
fn test_scalar_attributes() {
    let body = body_of("{\"a\": 1, \"b\": true, \"c\": null, \"d\": [1, 2]}");
    let ctx = EvalContext::new();
    let values: Vec<Value> = body
        .attributes()
        .map(|attr| eval(&attr.expr, &ctx).0)
        .collect();
    assert_eq!(values[0], Value::int(1));
    assert_eq!(values[1], Value::bool(true));
    assert!(values[2].is_null());
    assert_eq!(values[3], Value::tuple(vec![Value::int(1), Value::int(2)]));
}

#[test]
fn test_string_values_are_templates() {
    let body = body_of("{\"greeting\": \"hello ${name}\"}");
    let mut ctx = EvalContext::new();
    ctx.declare_variable("name", Value::string("json"));
    let attr = body.attributes().next().unwrap();
    let (v, diags) = eval(&attr.expr, &ctx);
    assert!(!diags.has_errors(), "{diags}");
    assert_eq!(v, Value::string("hello json"));
}

#[test]
fn test_object_value_defaults_to_attribute() {
    let body = body_of("{\"settings\": {\"x\": 1}}");
    let schema = BodySchema::default();
    // No schema claim: the object stays a plain attribute, and an empty
    // schema reports it as unsupported rather than as a block.
    let (_, diags) = content(&body, &schema);
    assert!(diags.iter().any(|d| d.summary == "Unsupported argument"));

    let ctx = EvalContext::new();
    let attr = body.attributes().next().unwrap();
    let (v, _) = eval(&attr.expr, &ctx);
    assert_eq!(v.as_map().unwrap().get("x"), Some(&Value::int(1)));
}

#[test]
fn test_schema_turns_object_into_block() {
    let body = body_of("{\"server\": {\"web\": {\"port\": 80}}}");
    let schema = BodySchema {
        attributes: Vec::new(),
        blocks: vec![BlockHeaderSchema::new("server", &["name"])],
    };
    let (extracted, diags) = content(&body, &schema);
    assert!(!diags.has_errors(), "{diags}");
    assert_eq!(extracted.blocks.len(), 1);
    let block = &extracted.blocks[0];
    assert_eq!(block.type_name, "server");
    assert_eq!(block.labels, vec!["web"]);
    let names: Vec<&str> = block.body.attributes().map(|a| a.name.as_str()).collect();
    assert_eq!(names, vec!["port"]);
}

#[test]
fn test_array_of_objects_becomes_repeated_blocks() {
    let body = body_of("{\"rule\": [{\"n\": 1}, {\"n\": 2}]}");
    let schema = BodySchema {
        attributes: Vec::new(),
        blocks: vec![BlockHeaderSchema::new("rule", &[])],
    };
    let (extracted, diags) = content(&body, &schema);
    assert!(!diags.has_errors(), "{diags}");
    assert_eq!(extracted.blocks.len(), 2);
}

#[test]
fn test_wrong_json_block_shape() {
    let body = body_of("{\"server\": 42}");
    let schema = BodySchema {
        attributes: Vec::new(),
        blocks: vec![BlockHeaderSchema::new("server", &["name"])],
    };
    let (_, diags) = content(&body, &schema);
    assert!(diags
        .iter()
        .any(|d| d.summary == "Incorrect JSON block structure"));
}

#[test]
fn test_escape_decoding() {
    let body = body_of("{\"s\": \"tab\\there \\u00e9 \\ud83d\\ude00\"}");
    let ctx = EvalContext::new();
    let attr = body.attributes().next().unwrap();
    let (v, _) = eval(&attr.expr, &ctx);
    assert_eq!(v, Value::string("tab\there é 😀"));
}

#[test]
fn test_duplicate_keys_surface_at_decode_time() {
    // Both definitions parse; the schema layer reports the collision.
    let body = body_of("{\"a\": 1, \"a\": 2}");
    assert_eq!(body.attributes().count(), 2);
}

#[test]
fn test_top_level_must_be_object() {
    let (_, diags) = parse_json("[1, 2]", "test.json");
    assert!(diags.has_errors());
    let (_, diags) = parse_json("not json", "test.json");
    assert!(diags.has_errors());
}

#[test]
fn test_trailing_garbage_rejected() {
    let (_, diags) = parse_json("{\"a\": 1} extra", "test.json");
    assert!(diags.has_errors());
}

#[test]
fn test_agrees_with_serde_json_on_numbers() {
    let src = "{\"n\": 1.25e2}";
    let body = body_of(src);
    let ctx = EvalContext::new();
    let attr = body.attributes().next().unwrap();
    let (v, _) = eval(&attr.expr, &ctx);
    let oracle: serde_json::Value = serde_json::from_str(src).unwrap();
    assert_eq!(v, Value::int(oracle["n"].as_f64().unwrap() as i64));
}
