use crate::ast::{Attribute, Block, Body, Expression, ExprKind, Item, TemplatePart};
use crate::diag::Diagnostics;

/// One node of the structural tree, as seen by a [`Walker`].
#[derive(Debug, Clone, Copy)]
pub enum Node<'a> {
    Body(&'a Body),
    Attribute(&'a Attribute),
    Block(&'a Block),
    Expression(&'a Expression),
}

/// Visits structure depth-first in source order. Both hooks see every
/// node; either may report diagnostics, which the walk accumulates.
pub trait Walker {
    fn enter(&mut self, node: Node<'_>) -> Diagnostics {
        let _ = node;
        Diagnostics::new()
    }

    fn exit(&mut self, node: Node<'_>) -> Diagnostics {
        let _ = node;
        Diagnostics::new()
    }
}

pub fn walk_body(body: &Body, walker: &mut dyn Walker) -> Diagnostics {
    let mut diags = Diagnostics::new();
    walk_body_inner(body, walker, &mut diags);
    diags
}

pub fn walk_expr(expr: &Expression, walker: &mut dyn Walker) -> Diagnostics {
    let mut diags = Diagnostics::new();
    walk_expr_inner(expr, walker, &mut diags);
    diags
}

fn walk_body_inner(body: &Body, walker: &mut dyn Walker, diags: &mut Diagnostics) {
    diags.extend(walker.enter(Node::Body(body)));
    for item in &body.items {
        match item {
            Item::Attribute(attr) => {
                diags.extend(walker.enter(Node::Attribute(attr)));
                walk_expr_inner(&attr.expr, walker, diags);
                diags.extend(walker.exit(Node::Attribute(attr)));
            }
            Item::Block(block) => {
                diags.extend(walker.enter(Node::Block(block)));
                walk_body_inner(&block.body, walker, diags);
                diags.extend(walker.exit(Node::Block(block)));
            }
        }
    }
    diags.extend(walker.exit(Node::Body(body)));
}

fn walk_expr_inner(expr: &Expression, walker: &mut dyn Walker, diags: &mut Diagnostics) {
    diags.extend(walker.enter(Node::Expression(expr)));
    match &expr.kind {
        ExprKind::Literal(_) | ExprKind::ScopeTraversal(_) | ExprKind::AnonSymbol => {}
        ExprKind::RelativeTraversal { base, .. } => walk_expr_inner(base, walker, diags),
        ExprKind::Index { collection, key } => {
            walk_expr_inner(collection, walker, diags);
            walk_expr_inner(key, walker, diags);
        }
        ExprKind::FunctionCall { args, .. } => {
            for arg in args {
                walk_expr_inner(arg, walker, diags);
            }
        }
        ExprKind::Conditional {
            cond,
            true_expr,
            false_expr,
        } => {
            walk_expr_inner(cond, walker, diags);
            walk_expr_inner(true_expr, walker, diags);
            walk_expr_inner(false_expr, walker, diags);
        }
        ExprKind::BinaryOp { lhs, rhs, .. } => {
            walk_expr_inner(lhs, walker, diags);
            walk_expr_inner(rhs, walker, diags);
        }
        ExprKind::UnaryOp { operand, .. } => walk_expr_inner(operand, walker, diags),
        ExprKind::Template(parts) => {
            for part in parts {
                if let TemplatePart::Interp(e) = part {
                    walk_expr_inner(e, walker, diags);
                }
            }
        }
        ExprKind::TemplateWrap(inner) | ExprKind::TemplateJoin(inner) => {
            walk_expr_inner(inner, walker, diags);
        }
        ExprKind::For(f) => {
            walk_expr_inner(&f.collection, walker, diags);
            if let Some(key_expr) = &f.key_expr {
                walk_expr_inner(key_expr, walker, diags);
            }
            walk_expr_inner(&f.val_expr, walker, diags);
            if let Some(cond) = &f.cond_expr {
                walk_expr_inner(cond, walker, diags);
            }
        }
        ExprKind::Tuple(elems) => {
            for e in elems {
                walk_expr_inner(e, walker, diags);
            }
        }
        ExprKind::Object(items) => {
            for item in items {
                walk_expr_inner(&item.key, walker, diags);
                walk_expr_inner(&item.value, walker, diags);
            }
        }
        ExprKind::Splat { source, each, .. } => {
            walk_expr_inner(source, walker, diags);
            walk_expr_inner(each, walker, diags);
        }
    }
    diags.extend(walker.exit(Node::Expression(expr)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::Diagnostic;
    use crate::parser::parse_file;
    use crate::pos::Pos;

    struct Recorder {
        events: Vec<String>,
    }

    impl Walker for Recorder {
        fn enter(&mut self, node: Node<'_>) -> Diagnostics {
            let tag = match node {
                Node::Body(_) => "body",
                Node::Attribute(a) => return self.note(format!("attr {}", a.name)),
                Node::Block(b) => return self.note(format!("block {}", b.type_name)),
                Node::Expression(_) => "expr",
            };
            self.note(tag.to_string())
        }
    }

    impl Recorder {
        fn note(&mut self, event: String) -> Diagnostics {
            self.events.push(event);
            Diagnostics::new()
        }
    }

    #[test]
    fn test_walk_order_is_source_order() {
        let (body, _, _) = parse_file(
            "first = 1\nwrap {\n  second = 2\n}\nthird = 3\n",
            "t",
            Pos::start(),
        );
        let mut rec = Recorder { events: Vec::new() };
        let diags = walk_body(&body, &mut rec);
        assert!(diags.is_empty());
        let interesting: Vec<_> = rec
            .events
            .iter()
            .filter(|e| e.starts_with("attr") || e.starts_with("block"))
            .cloned()
            .collect();
        assert_eq!(
            interesting,
            vec!["attr first", "block wrap", "attr second", "attr third"]
        );
    }

    #[test]
    fn test_walk_collects_diagnostics() {
        struct Complainer;
        impl Walker for Complainer {
            fn enter(&mut self, node: Node<'_>) -> Diagnostics {
                match node {
                    Node::Attribute(a) if a.name == "bad" => Diagnostic::error(
                        "Flagged attribute",
                        "This attribute is flagged by the walker.".to_string(),
                        a.name_range.clone(),
                    )
                    .into(),
                    _ => Diagnostics::new(),
                }
            }
        }
        let (body, _, _) = parse_file("good = 1\nbad = 2\n", "t", Pos::start());
        let diags = walk_body(&body, &mut Complainer);
        assert_eq!(diags.len(), 1);
    }

    #[test]
    fn test_walk_expr_visits_nested() {
        let (body, _, _) = parse_file("x = f(a + 1, [b, c])\n", "t", Pos::start());
        struct Counter(usize);
        impl Walker for Counter {
            fn enter(&mut self, node: Node<'_>) -> Diagnostics {
                if matches!(node, Node::Expression(_)) {
                    self.0 += 1;
                }
                Diagnostics::new()
            }
        }
        let mut counter = Counter(0);
        walk_body(&body, &mut counter);
        // call, a + 1, a, 1, tuple, b, c
        assert_eq!(counter.0, 7);
    }
}
