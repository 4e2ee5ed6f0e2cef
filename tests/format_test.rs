// The format pass: deterministic, idempotent, validity-preserving.

use bcl_core::{format, parse_config};

fn fmt(src: &str) -> String {
    let (out, diags) = format(src, "fmt.bcl");
    assert!(!diags.has_errors(), "scan failed: {diags}");
    out
}

const MESSY: &str = "\
name   = \"app\"
retries=3


server \"web\" {
      port    = 80
  host = \"example.com\"
      tls {
    enabled=true
  }
}
";

#[test]
fn test_normalizes_messy_source() {
    assert_eq!(
        fmt(MESSY),
        "\
name    = \"app\"
retries = 3

server \"web\" {
  port = 80
  host = \"example.com\"
  tls {
    enabled = true
  }
}
"
    );
}

#[test]
fn test_idempotent() {
    let once = fmt(MESSY);
    assert_eq!(fmt(&once), once);
}

#[test]
fn test_preserves_validity() {
    let (_, before) = parse_config(MESSY, "before.bcl");
    let (_, after) = parse_config(&fmt(MESSY), "after.bcl");
    assert!(!before.has_errors());
    assert!(!after.has_errors());
}

#[test]
fn test_formatted_output_evaluates_identically() {
    let src = "x = 1+2 * 3\ny = \"${ x }\"\n";
    let formatted = fmt(src);
    let (a, _) = parse_config(src, "a.bcl");
    let (b, _) = parse_config(&formatted, "b.bcl");
    // Same AST shape modulo ranges: compare canonical printing.
    let mut pa = String::new();
    let mut pb = String::new();
    bcl_core::api::print(&a.body, &mut pa).unwrap();
    bcl_core::api::print(&b.body, &mut pb).unwrap();
    assert_eq!(pa, pb);
}

#[test]
fn test_comments_and_heredocs_survive() {
    let src = "# top\nx = <<EOT\n keep   me\nEOT\ny = 2   // end\n";
    let formatted = fmt(src);
    assert!(formatted.contains("# top\n"));
    assert!(formatted.contains("\n keep   me\n"));
    assert!(formatted.contains("// end"));
}
