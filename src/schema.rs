use crate::ast::{Attribute, Body, Expression, Item};
use crate::convert;
use crate::diag::{Diagnostic, Diagnostics};
use crate::eval::{self, EvalContext};
use crate::pos::Range;
use crate::value::{Type, Value};
use std::collections::{BTreeMap, HashMap};

/// Declares one attribute a body may carry.
#[derive(Debug, Clone)]
pub struct AttributeSchema {
    pub name: String,
    pub required: bool,
}

impl AttributeSchema {
    pub fn required(name: impl Into<String>) -> AttributeSchema {
        AttributeSchema {
            name: name.into(),
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>) -> AttributeSchema {
        AttributeSchema {
            name: name.into(),
            required: false,
        }
    }
}

/// Declares one block type a body may contain, with the names its
/// labels go by in diagnostics.
#[derive(Debug, Clone)]
pub struct BlockHeaderSchema {
    pub type_name: String,
    pub label_names: Vec<String>,
}

impl BlockHeaderSchema {
    pub fn new(type_name: impl Into<String>, label_names: &[&str]) -> BlockHeaderSchema {
        BlockHeaderSchema {
            type_name: type_name.into(),
            label_names: label_names.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BodySchema {
    pub attributes: Vec<AttributeSchema>,
    pub blocks: Vec<BlockHeaderSchema>,
}

/// An attribute matched by the schema.
#[derive(Debug, Clone)]
pub struct ContentAttribute {
    pub name: String,
    pub expr: Expression,
    pub name_range: Range,
    pub range: Range,
}

/// A block matched by the schema.
#[derive(Debug, Clone)]
pub struct ContentBlock {
    pub type_name: String,
    pub labels: Vec<String>,
    pub label_ranges: Vec<Range>,
    pub body: Body,
    pub range: Range,
}

/// What schema extraction found in a body.
#[derive(Debug, Clone, Default)]
pub struct BodyContent {
    pub attributes: HashMap<String, ContentAttribute>,
    pub blocks: Vec<ContentBlock>,
}

/// Extracts exactly the schema'd content from a body. Anything the
/// schema does not mention is a diagnostic.
pub fn content(body: &Body, schema: &BodySchema) -> (BodyContent, Diagnostics) {
    let (content, remain, mut diags) = extract(body, schema);
    for item in &remain.items {
        match item {
            Item::Attribute(attr) => diags.push(Diagnostic::error(
                "Unsupported argument",
                format!("An argument named {:?} is not expected here.", attr.name),
                attr.name_range.clone(),
            )),
            Item::Block(block) => diags.push(Diagnostic::error(
                "Unsupported block type",
                format!("Blocks of type {:?} are not expected here.", block.type_name),
                block.type_range.clone(),
            )),
        }
    }
    (content, diags)
}

/// Like [`content`], but items the schema does not mention are returned
/// as a leftover body instead of being diagnosed.
pub fn partial_content(body: &Body, schema: &BodySchema) -> (BodyContent, Body, Diagnostics) {
    extract(body, schema)
}

fn extract(body: &Body, schema: &BodySchema) -> (BodyContent, Body, Diagnostics) {
    let mut diags = Diagnostics::new();
    let mut content = BodyContent::default();
    let mut remain_items = Vec::new();

    for item in &body.items {
        match item {
            Item::Attribute(attr) => {
                let as_attr = schema.attributes.iter().any(|a| a.name == attr.name);
                let as_block = schema.blocks.iter().find(|b| b.type_name == attr.name);
                match (as_attr, as_block) {
                    // A JSON-sourced attribute can stand in for blocks
                    // when the schema asks for a block of that name.
                    (false, Some(header)) if !attr.json_alt.is_empty() => {
                        expand_json_blocks(attr, header, &mut content.blocks, &mut diags);
                    }
                    (true, _) => {
                        if let Some(first) = content.attributes.get(&attr.name) {
                            diags.push(
                                Diagnostic::error(
                                    "Duplicate attribute",
                                    format!(
                                        "The attribute {:?} was already set; each attribute may be set only once.",
                                        attr.name
                                    ),
                                    attr.name_range.clone(),
                                )
                                .with_context(first.name_range.clone()),
                            );
                            continue;
                        }
                        content.attributes.insert(
                            attr.name.clone(),
                            ContentAttribute {
                                name: attr.name.clone(),
                                expr: attr.expr.clone(),
                                name_range: attr.name_range.clone(),
                                range: attr.range.clone(),
                            },
                        );
                    }
                    _ => remain_items.push(item.clone()),
                }
            }
            Item::Block(block) => {
                match schema.blocks.iter().find(|b| b.type_name == block.type_name) {
                    Some(header) => {
                        if check_labels(block.labels.len(), header, &block.type_range, &mut diags) {
                            content.blocks.push(ContentBlock {
                                type_name: block.type_name.clone(),
                                labels: block.labels.iter().map(|l| l.value.clone()).collect(),
                                label_ranges: block.labels.iter().map(|l| l.range.clone()).collect(),
                                body: block.body.clone(),
                                range: block.range.clone(),
                            });
                        }
                    }
                    None => remain_items.push(item.clone()),
                }
            }
        }
    }

    for attr_schema in &schema.attributes {
        if attr_schema.required && !content.attributes.contains_key(&attr_schema.name) {
            diags.push(Diagnostic::error(
                "Missing required argument",
                format!("The argument {:?} is required, but was not set.", attr_schema.name),
                body.end_range.clone(),
            ));
        }
    }

    let remain = Body {
        items: remain_items,
        range: body.range.clone(),
        end_range: body.end_range.clone(),
    };
    (content, remain, diags)
}

fn check_labels(
    given: usize,
    header: &BlockHeaderSchema,
    range: &Range,
    diags: &mut Diagnostics,
) -> bool {
    let wanted = header.label_names.len();
    if given < wanted {
        diags.push(Diagnostic::error(
            "Missing block label",
            format!(
                "All {:?} blocks must have a {:?} label.",
                header.type_name, header.label_names[given]
            ),
            range.clone(),
        ));
        false
    } else if given > wanted {
        diags.push(Diagnostic::error(
            "Extraneous block label",
            format!(
                "{:?} blocks take only {wanted} label(s).",
                header.type_name
            ),
            range.clone(),
        ));
        false
    } else {
        true
    }
}

/// A JSON object standing in for labelled blocks nests one object level
/// per label: each level's keys become label values, and the innermost
/// bodies become the block bodies.
fn expand_json_blocks(
    attr: &Attribute,
    header: &BlockHeaderSchema,
    out: &mut Vec<ContentBlock>,
    diags: &mut Diagnostics,
) {
    for alt in &attr.json_alt {
        peel_labels(attr, header, alt, Vec::new(), out, diags);
    }
}

fn peel_labels(
    attr: &Attribute,
    header: &BlockHeaderSchema,
    body: &Body,
    labels: Vec<String>,
    out: &mut Vec<ContentBlock>,
    diags: &mut Diagnostics,
) {
    if labels.len() == header.label_names.len() {
        out.push(ContentBlock {
            type_name: header.type_name.clone(),
            labels,
            label_ranges: Vec::new(),
            body: body.clone(),
            range: attr.range.clone(),
        });
        return;
    }
    for item in &body.items {
        if let Item::Attribute(label_attr) = item {
            if !label_attr.json_alt.is_empty() {
                for alt in &label_attr.json_alt {
                    let mut next = labels.clone();
                    next.push(label_attr.name.clone());
                    peel_labels(attr, header, alt, next, out, diags);
                }
                continue;
            }
        }
        diags.push(Diagnostic::error(
            "Incorrect JSON block structure",
            format!(
                "Blocks of type {:?} expect one nested JSON object level per label ({}).",
                header.type_name,
                header.label_names.join(", ")
            ),
            attr.name_range.clone(),
        ));
        return;
    }
}

// === Typed decoding ===

/// How one field of a [`BodySpec`] maps onto body content.
#[derive(Clone)]
pub enum FieldKind {
    /// An attribute evaluated to a value of the field's type.
    Attr { required: bool },
    /// A nested block decoded with its own spec. Repeated blocks decode
    /// to a tuple, single blocks to one object or null.
    Block { spec: BodySpec, repeated: bool },
    /// A block label, bound by position when decoding a block.
    Label,
    /// The undecoded remainder of the body.
    Remain,
}

#[derive(Clone)]
pub struct FieldSpec {
    pub name: String,
    pub ty: Type,
    pub kind: FieldKind,
}

impl FieldSpec {
    pub fn attr(name: impl Into<String>, ty: Type, required: bool) -> FieldSpec {
        FieldSpec {
            name: name.into(),
            ty,
            kind: FieldKind::Attr { required },
        }
    }

    pub fn block(name: impl Into<String>, spec: BodySpec, repeated: bool) -> FieldSpec {
        FieldSpec {
            name: name.into(),
            ty: Type::Dynamic,
            kind: FieldKind::Block { spec, repeated },
        }
    }

    pub fn label(name: impl Into<String>) -> FieldSpec {
        FieldSpec {
            name: name.into(),
            ty: Type::String,
            kind: FieldKind::Label,
        }
    }

    pub fn remain(name: impl Into<String>) -> FieldSpec {
        FieldSpec {
            name: name.into(),
            ty: Type::Dynamic,
            kind: FieldKind::Remain,
        }
    }
}

#[derive(Clone, Default)]
pub struct BodySpec {
    pub fields: Vec<FieldSpec>,
}

impl BodySpec {
    pub fn new(fields: Vec<FieldSpec>) -> BodySpec {
        BodySpec { fields }
    }

    fn schema(&self) -> BodySchema {
        let mut schema = BodySchema::default();
        for field in &self.fields {
            match &field.kind {
                FieldKind::Attr { required } => {
                    schema.attributes.push(AttributeSchema {
                        name: field.name.clone(),
                        required: *required,
                    });
                }
                FieldKind::Block { spec, .. } => {
                    schema.blocks.push(BlockHeaderSchema {
                        type_name: field.name.clone(),
                        label_names: spec.label_names(),
                    });
                }
                FieldKind::Label | FieldKind::Remain => {}
            }
        }
        schema
    }

    fn label_names(&self) -> Vec<String> {
        self.fields
            .iter()
            .filter(|f| matches!(f.kind, FieldKind::Label))
            .map(|f| f.name.clone())
            .collect()
    }

    fn has_remain(&self) -> bool {
        self.fields.iter().any(|f| matches!(f.kind, FieldKind::Remain))
    }
}

/// The result of decoding a body against a spec: an object value with
/// one entry per field, plus the leftover body when the spec asked for
/// one.
pub struct Decoded {
    pub value: Value,
    pub remain: Option<Body>,
}

/// Decodes a whole body against a spec, evaluating attribute
/// expressions in the given context.
pub fn decode_body(body: &Body, ctx: &EvalContext<'_>, spec: &BodySpec) -> (Decoded, Diagnostics) {
    decode(body, &[], ctx, spec)
}

fn decode(
    body: &Body,
    labels: &[(String, Range)],
    ctx: &EvalContext<'_>,
    spec: &BodySpec,
) -> (Decoded, Diagnostics) {
    let schema = spec.schema();
    let (content, remain, mut diags) = if spec.has_remain() {
        let (c, r, d) = partial_content(body, &schema);
        (c, Some(r), d)
    } else {
        let (c, d) = content(body, &schema);
        (c, None, d)
    };

    let mut fields = BTreeMap::new();
    let mut label_iter = labels.iter();
    for field in &spec.fields {
        let value = match &field.kind {
            FieldKind::Attr { .. } => match content.attributes.get(&field.name) {
                Some(attr) => {
                    let (v, eval_diags) = eval::eval(&attr.expr, ctx);
                    diags.extend(eval_diags);
                    match convert::convert(&v, &field.ty) {
                        Ok(v) => v,
                        Err(msg) => {
                            diags.push(Diagnostic::error(
                                "Invalid argument value",
                                format!("The argument {:?} is unsuitable: {msg}.", field.name),
                                attr.expr.range.clone(),
                            ));
                            Value::unknown(field.ty.clone())
                        }
                    }
                }
                None => Value::null(field.ty.clone()),
            },
            FieldKind::Block { spec, repeated } => {
                let matching: Vec<&ContentBlock> = content
                    .blocks
                    .iter()
                    .filter(|b| b.type_name == field.name)
                    .collect();
                if *repeated {
                    let mut decoded = Vec::new();
                    for block in matching {
                        decoded.push(decode_block(block, ctx, spec, &mut diags));
                    }
                    Value::tuple(decoded)
                } else {
                    match matching.as_slice() {
                        [] => Value::null(Type::Dynamic),
                        [block] => decode_block(block, ctx, spec, &mut diags),
                        [_, extra, ..] => {
                            diags.push(Diagnostic::error(
                                "Duplicate block",
                                format!(
                                    "Only one block of type {:?} is allowed here.",
                                    field.name
                                ),
                                extra.range.clone(),
                            ));
                            decode_block(matching[0], ctx, spec, &mut diags)
                        }
                    }
                }
            }
            FieldKind::Label => match label_iter.next() {
                Some((value, _)) => Value::string(value.clone()),
                None => Value::null(Type::String),
            },
            FieldKind::Remain => continue,
        };
        fields.insert(field.name.clone(), value);
    }

    (
        Decoded {
            value: Value::object(fields),
            remain,
        },
        diags,
    )
}

fn decode_block(
    block: &ContentBlock,
    ctx: &EvalContext<'_>,
    spec: &BodySpec,
    diags: &mut Diagnostics,
) -> Value {
    let labels: Vec<(String, Range)> = block
        .labels
        .iter()
        .cloned()
        .zip(
            block
                .label_ranges
                .iter()
                .cloned()
                .chain(std::iter::repeat(block.range.clone())),
        )
        .collect();
    let (decoded, block_diags) = decode(&block.body, &labels, ctx, spec);
    diags.extend(block_diags);
    decoded.value
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_file;
    use crate::pos::Pos;

    fn body_of(src: &str) -> Body {
        let (body, _, diags) = parse_file(src, "test.bcl", Pos::start());
        assert!(!diags.has_errors(), "parse failed: {diags}");
        body
    }

    #[test]
    fn test_content_matches_schema() {
        let body = body_of("name = \"web\"\nport = 8080\nlisten \"a\" {\n}\n");
        let schema = BodySchema {
            attributes: vec![
                AttributeSchema::required("name"),
                AttributeSchema::optional("port"),
            ],
            blocks: vec![BlockHeaderSchema::new("listen", &["addr"])],
        };
        let (content, diags) = content(&body, &schema);
        assert!(!diags.has_errors(), "unexpected: {diags}");
        assert_eq!(content.attributes.len(), 2);
        assert_eq!(content.blocks.len(), 1);
        assert_eq!(content.blocks[0].labels, vec!["a"]);
    }

    #[test]
    fn test_unsupported_argument() {
        let body = body_of("mystery = 1\n");
        let (_, diags) = content(&body, &BodySchema::default());
        assert!(diags.has_errors());
        assert!(diags.iter().any(|d| d.summary == "Unsupported argument"));
    }

    #[test]
    fn test_missing_required_argument() {
        let body = body_of("");
        let schema = BodySchema {
            attributes: vec![AttributeSchema::required("name")],
            blocks: Vec::new(),
        };
        let (_, diags) = content(&body, &schema);
        assert!(diags
            .iter()
            .any(|d| d.summary == "Missing required argument"));
    }

    #[test]
    fn test_duplicate_argument() {
        let body = body_of("a = 1\na = 2\n");
        let schema = BodySchema {
            attributes: vec![AttributeSchema::optional("a")],
            blocks: Vec::new(),
        };
        let (content, diags) = content(&body, &schema);
        assert!(diags.iter().any(|d| d.summary == "Duplicate attribute"));
        // The first definition wins.
        assert_eq!(content.attributes.len(), 1);
    }

    #[test]
    fn test_label_count_checked() {
        let body = body_of("listen {\n}\nlisten \"a\" \"b\" {\n}\n");
        let schema = BodySchema {
            attributes: Vec::new(),
            blocks: vec![BlockHeaderSchema::new("listen", &["addr"])],
        };
        let (content, diags) = content(&body, &schema);
        assert!(diags.iter().any(|d| d.summary == "Missing block label"));
        assert!(diags.iter().any(|d| d.summary == "Extraneous block label"));
        assert!(content.blocks.is_empty());
    }

    #[test]
    fn test_partial_content_keeps_remainder() {
        let body = body_of("known = 1\nunknown = 2\nextra {\n}\n");
        let schema = BodySchema {
            attributes: vec![AttributeSchema::optional("known")],
            blocks: Vec::new(),
        };
        let (content, remain, diags) = partial_content(&body, &schema);
        assert!(!diags.has_errors());
        assert_eq!(content.attributes.len(), 1);
        assert_eq!(remain.items.len(), 2);
    }

    #[test]
    fn test_decode_body() {
        let body = body_of("name = \"web\"\nport = 80 + 8000\nserver \"one\" {\n  weight = 2\n}\nserver \"two\" {\n  weight = 3\n}\n");
        let spec = BodySpec::new(vec![
            FieldSpec::attr("name", Type::String, true),
            FieldSpec::attr("port", Type::Number, false),
            FieldSpec::block(
                "server",
                BodySpec::new(vec![
                    FieldSpec::label("id"),
                    FieldSpec::attr("weight", Type::Number, true),
                ]),
                true,
            ),
        ]);
        let ctx = EvalContext::new();
        let (decoded, diags) = decode_body(&body, &ctx, &spec);
        assert!(!diags.has_errors(), "unexpected: {diags}");
        let obj = decoded.value.as_map().unwrap();
        assert_eq!(obj["name"], Value::string("web"));
        assert_eq!(obj["port"], Value::int(8080));
        let servers = obj["server"].as_seq().unwrap();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].as_map().unwrap()["id"], Value::string("one"));
        assert_eq!(servers[1].as_map().unwrap()["weight"], Value::int(3));
    }

    #[test]
    fn test_decode_missing_optional_is_null() {
        let body = body_of("");
        let spec = BodySpec::new(vec![FieldSpec::attr("opt", Type::String, false)]);
        let ctx = EvalContext::new();
        let (decoded, diags) = decode_body(&body, &ctx, &spec);
        assert!(!diags.has_errors());
        assert!(decoded.value.as_map().unwrap()["opt"].is_null());
    }

    #[test]
    fn test_decode_with_remain() {
        let body = body_of("a = 1\nmystery = true\n");
        let spec = BodySpec::new(vec![
            FieldSpec::attr("a", Type::Number, true),
            FieldSpec::remain("rest"),
        ]);
        let ctx = EvalContext::new();
        let (decoded, diags) = decode_body(&body, &ctx, &spec);
        assert!(!diags.has_errors(), "unexpected: {diags}");
        let remain = decoded.remain.unwrap();
        assert_eq!(remain.items.len(), 1);
    }

    #[test]
    fn test_decode_type_mismatch() {
        let body = body_of("port = [1]\n");
        let spec = BodySpec::new(vec![FieldSpec::attr("port", Type::Number, true)]);
        let ctx = EvalContext::new();
        let (_, diags) = decode_body(&body, &ctx, &spec);
        assert!(diags.iter().any(|d| d.summary == "Invalid argument value"));
    }
}
