// Structural edits through the rewrite tree: surrounding trivia stays
// put, only the edited span changes.

use bcl_core::builder;
use bcl_core::cst::RewriteError;
use bcl_core::parse_config;

fn parse(src: &str) -> bcl_core::cst::Cst {
    let (file, diags) = parse_config(src, "rewrite.bcl");
    assert!(!diags.has_errors(), "parse failed: {diags}");
    file.cst.unwrap()
}

#[test]
fn test_set_attribute_preserves_spacing_and_comments() {
    let mut cst = parse("# comment\nfoo  =  \"x\"\n");
    assert_eq!(cst.to_source(), "# comment\nfoo  =  \"x\"\n");

    cst.set_attribute(&[], "foo", &builder::string_lit("y"))
        .unwrap();
    assert_eq!(cst.to_source(), "# comment\nfoo  =  \"y\"\n");
}

#[test]
fn test_set_attribute_in_nested_block() {
    let mut cst = parse("server \"web\" {\n  port = 80\n  tls {\n    min = \"1.2\"\n  }\n}\n");
    cst.set_attribute(&[("server", &["web"]), ("tls", &[])], "min", &builder::string_lit("1.3"))
        .unwrap();
    assert_eq!(
        cst.to_source(),
        "server \"web\" {\n  port = 80\n  tls {\n    min = \"1.3\"\n  }\n}\n"
    );
}

#[test]
fn test_set_missing_attribute_appends() {
    let mut cst = parse("blk {\n  a = 1\n}\n");
    cst.set_attribute(&[("blk", &[])], "b", &builder::int_lit(2))
        .unwrap();
    assert_eq!(cst.to_source(), "blk {\n  a = 1\n  b = 2\n}\n");
}

#[test]
fn test_remove_attribute_keeps_neighbors() {
    let mut cst = parse("a = 1 # trailing comment\nb = 2\nc = 3\n");
    cst.remove_attribute(&[], "b").unwrap();
    assert_eq!(cst.to_source(), "a = 1 # trailing comment\nc = 3\n");
}

#[test]
fn test_append_and_remove_block() {
    let mut cst = parse("a = 1\n");
    cst.append_block(&[], "server", &["web"]).unwrap();
    assert!(cst.has_block(&[], "server", &["web"]));
    cst.set_attribute(&[("server", &["web"])], "port", &builder::int_lit(8080))
        .unwrap();
    cst.remove_block(&[], "server", &["web"]).unwrap();
    assert_eq!(cst.to_source(), "a = 1\n");
}

#[test]
fn test_move_block_reorders() {
    let mut cst = parse("blk \"a\" {\n}\nblk \"b\" {\n}\nblk \"c\" {\n}\n");
    cst.move_block(&[], "blk", &["c"], 0).unwrap();
    assert_eq!(
        cst.to_source(),
        "blk \"c\" {\n}\nblk \"a\" {\n}\nblk \"b\" {\n}\n"
    );
    // An out-of-range index moves the block to the end.
    cst.move_block(&[], "blk", &["c"], 99).unwrap();
    assert_eq!(
        cst.to_source(),
        "blk \"a\" {\n}\nblk \"b\" {\n}\nblk \"c\" {\n}\n"
    );
}

#[test]
fn test_set_block_labels() {
    let mut cst = parse("server \"old\" {\n  a = 1\n}\n");
    cst.set_block_labels(&[], "server", &["old"], &["new", "extra"])
        .unwrap();
    assert_eq!(
        cst.to_source(),
        "server \"new\" \"extra\" {\n  a = 1\n}\n"
    );
    assert_eq!(
        cst.block_labels(&[], "server"),
        vec![vec!["new".to_string(), "extra".to_string()]]
    );
}

#[test]
fn test_queries() {
    let cst = parse("a = 1\nb = f(2)\nblk \"l\" {\n  c = 3\n}\n");
    assert_eq!(cst.attribute_names(&[]), vec!["a", "b"]);
    assert!(cst.has_attribute(&[], "b"));
    assert!(!cst.has_attribute(&[], "c"));
    assert!(cst.has_attribute(&[("blk", &["l"])], "c"));
    assert_eq!(cst.attribute_value_source(&[], "b").as_deref(), Some("f(2)"));
}

#[test]
fn test_invalid_edits_rejected() {
    let mut cst = parse("a = 1\n");
    assert!(matches!(
        cst.set_attribute(&[], "9bad", "1"),
        Err(RewriteError::InvalidName { .. })
    ));
    assert!(matches!(
        cst.set_attribute(&[], "a", "1 +"),
        Err(RewriteError::InvalidExpression)
    ));
    assert!(matches!(
        cst.set_attribute(&[("missing", &[])], "a", "1"),
        Err(RewriteError::BlockNotFound)
    ));
    assert!(matches!(
        cst.remove_attribute(&[], "zzz"),
        Err(RewriteError::AttributeNotFound { .. })
    ));
    // Failed edits leave the tree untouched.
    assert_eq!(cst.to_source(), "a = 1\n");
}

#[test]
fn test_builder_values() {
    let mut cst = parse("x = 0\n");
    cst.set_attribute(
        &[],
        "x",
        &builder::object(&[
            ("name".to_string(), builder::string_lit("a\"b")),
            ("on".to_string(), builder::bool_lit(true)),
        ]),
    )
    .unwrap();
    assert_eq!(cst.to_source(), "x = { name = \"a\\\"b\", on = true }\n");

    cst.set_attribute(&[], "x", &builder::traversal(&["var", "y"]).unwrap())
        .unwrap();
    assert_eq!(cst.to_source(), "x = var.y\n");
}

#[test]
fn test_edited_tree_reparses_cleanly() {
    let mut cst = parse("a = 1\nblk {\n  b = 2\n}\n");
    cst.set_attribute(&[("blk", &[])], "b", "[1, 2, 3]").unwrap();
    let (file, diags) = parse_config(&cst.to_source(), "reparse.bcl");
    assert!(!diags.has_errors(), "{diags}");
    assert_eq!(file.to_source().as_deref(), Some(cst.to_source().as_str()));
}
