// Schema-driven decoding of bodies into generic content and typed
// values.

use bcl_core::eval::EvalContext;
use bcl_core::parse_config;
use bcl_core::schema::{
    content, decode_body, partial_content, AttributeSchema, BlockHeaderSchema, BodySchema,
    BodySpec, FieldSpec,
};
use bcl_core::value::{Type, Value};

fn body_of(src: &str) -> bcl_core::ast::Body {
    let (file, diags) = parse_config(src, "decode.bcl");
    assert!(!diags.has_errors(), "parse failed: {diags}");
    file.body
}

#[test]
fn test_decode_flat_attributes() {
    let body = body_of("foo = \"bar\"\nbaz = 1 + 2\n");
    let spec = BodySpec::new(vec![
        FieldSpec::attr("foo", Type::String, true),
        FieldSpec::attr("baz", Type::Number, true),
    ]);
    let ctx = EvalContext::new();
    let (decoded, diags) = decode_body(&body, &ctx, &spec);
    assert!(!diags.has_errors(), "{diags}");

    let fields = decoded.value.as_map().unwrap();
    assert_eq!(fields.get("foo"), Some(&Value::string("bar")));
    assert_eq!(fields.get("baz"), Some(&Value::int(3)));
}

#[test]
fn test_decode_labeled_blocks_in_source_order() {
    let body = body_of("block \"x\" { a = 1 }\nblock \"y\" { a = 2 }\n");
    let inner = BodySpec::new(vec![
        FieldSpec::label("name"),
        FieldSpec::attr("a", Type::Number, true),
    ]);
    let spec = BodySpec::new(vec![FieldSpec::block("block", inner, true)]);
    let ctx = EvalContext::new();
    let (decoded, diags) = decode_body(&body, &ctx, &spec);
    assert!(!diags.has_errors(), "{diags}");

    let blocks = decoded.value.as_map().unwrap().get("block").cloned().unwrap();
    let blocks = blocks.as_seq().unwrap().to_vec();
    assert_eq!(blocks.len(), 2);
    let first = blocks[0].as_map().unwrap();
    assert_eq!(first.get("name"), Some(&Value::string("x")));
    assert_eq!(first.get("a"), Some(&Value::int(1)));
    let second = blocks[1].as_map().unwrap();
    assert_eq!(second.get("name"), Some(&Value::string("y")));
    assert_eq!(second.get("a"), Some(&Value::int(2)));
}

#[test]
fn test_duplicate_attribute_is_decode_error() {
    let body = body_of("a = 1\na = 2\n");
    let schema = BodySchema {
        attributes: vec![AttributeSchema::required("a")],
        blocks: Vec::new(),
    };
    let (extracted, diags) = content(&body, &schema);
    assert!(diags.has_errors());
    let dup = diags
        .iter()
        .find(|d| d.summary == "Duplicate attribute")
        .expect("missing duplicate diagnostic");
    // The diagnostic points at the second definition.
    assert_eq!(dup.subject.as_ref().unwrap().start.line, 2);
    // The first definition still decodes.
    assert_eq!(extracted.attributes.len(), 1);
}

#[test]
fn test_unsupported_items_are_diagnosed() {
    let body = body_of("known = 1\nmystery = 2\nrogue {\n}\n");
    let schema = BodySchema {
        attributes: vec![AttributeSchema::optional("known")],
        blocks: Vec::new(),
    };
    let (_, diags) = content(&body, &schema);
    let summaries: Vec<&str> = diags.iter().map(|d| d.summary.as_str()).collect();
    assert!(summaries.contains(&"Unsupported argument"));
    assert!(summaries.contains(&"Unsupported block type"));
}

#[test]
fn test_partial_content_leaves_remainder() {
    let body = body_of("mine = 1\nyours = 2\n");
    let schema = BodySchema {
        attributes: vec![AttributeSchema::optional("mine")],
        blocks: Vec::new(),
    };
    let (extracted, remain, diags) = partial_content(&body, &schema);
    assert!(!diags.has_errors());
    assert!(extracted.attributes.contains_key("mine"));
    let leftover: Vec<&str> = remain.attributes().map(|a| a.name.as_str()).collect();
    assert_eq!(leftover, vec!["yours"]);
}

#[test]
fn test_missing_required_attribute() {
    let body = body_of("present = 1\n");
    let schema = BodySchema {
        attributes: vec![
            AttributeSchema::optional("present"),
            AttributeSchema::required("absent"),
        ],
        blocks: Vec::new(),
    };
    let (_, diags) = content(&body, &schema);
    assert!(diags
        .iter()
        .any(|d| d.summary == "Missing required argument"));
}

#[test]
fn test_label_count_enforced() {
    let body = body_of("blk \"one\" \"two\" {\n}\nblk {\n}\n");
    let schema = BodySchema {
        attributes: Vec::new(),
        blocks: vec![BlockHeaderSchema::new("blk", &["name"])],
    };
    let (_, diags) = content(&body, &schema);
    let summaries: Vec<&str> = diags.iter().map(|d| d.summary.as_str()).collect();
    assert!(summaries.contains(&"Extraneous block label"));
    assert!(summaries.contains(&"Missing block label"));
}

#[test]
fn test_decode_single_block_and_remain() {
    let body = body_of("meta {\n  note = \"n\"\n}\nextra = true\n");
    let inner = BodySpec::new(vec![FieldSpec::attr("note", Type::String, true)]);
    let spec = BodySpec::new(vec![
        FieldSpec::block("meta", inner, false),
        FieldSpec::remain("rest"),
    ]);
    let ctx = EvalContext::new();
    let (decoded, diags) = decode_body(&body, &ctx, &spec);
    assert!(!diags.has_errors(), "{diags}");

    let meta = decoded.value.as_map().unwrap().get("meta").cloned().unwrap();
    assert_eq!(
        meta.as_map().unwrap().get("note"),
        Some(&Value::string("n"))
    );
    let remain = decoded.remain.expect("remainder requested");
    let names: Vec<&str> = remain.attributes().map(|a| a.name.as_str()).collect();
    assert_eq!(names, vec!["extra"]);
}

#[test]
fn test_decode_missing_optional_is_null() {
    let body = body_of("");
    let spec = BodySpec::new(vec![FieldSpec::attr("absent", Type::String, false)]);
    let ctx = EvalContext::new();
    let (decoded, diags) = decode_body(&body, &ctx, &spec);
    assert!(!diags.has_errors());
    let v = decoded.value.as_map().unwrap().get("absent").cloned().unwrap();
    assert!(v.is_null());
    assert_eq!(v.ty(), &Type::String);
}

#[test]
fn test_decode_wrong_type_is_diagnostic() {
    let body = body_of("count = [1, 2]\n");
    let spec = BodySpec::new(vec![FieldSpec::attr("count", Type::Number, true)]);
    let ctx = EvalContext::new();
    let (_, diags) = decode_body(&body, &ctx, &spec);
    assert!(diags.iter().any(|d| d.summary == "Invalid argument value"));
}
