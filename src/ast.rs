use crate::pos::Range;
use crate::value::Value;
use std::collections::HashSet;

/// An ordered sequence of attribute definitions and blocks. The unit of
/// schema-driven decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct Body {
    pub items: Vec<Item>,
    pub range: Range,
    /// A zero-width range at the position where new items would go, used
    /// to anchor "missing required attribute" diagnostics.
    pub end_range: Range,
}

impl Body {
    pub fn attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.items.iter().filter_map(|i| match i {
            Item::Attribute(a) => Some(a),
            Item::Block(_) => None,
        })
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.items.iter().filter_map(|i| match i {
            Item::Block(b) => Some(b),
            Item::Attribute(_) => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Attribute(Attribute),
    Block(Block),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub expr: Expression,
    pub name_range: Range,
    pub equals_range: Range,
    pub range: Range,
    /// Alternative block-form bodies for attributes that came from a JSON
    /// object value. JSON cannot distinguish an attribute holding an
    /// object from a nested block until a schema decides; the decoder
    /// reads these when its schema claims the name as a block type.
    /// Always empty for natively parsed attributes.
    pub json_alt: Vec<Body>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub type_name: String,
    pub labels: Vec<BlockLabel>,
    pub body: Body,
    pub type_range: Range,
    pub open_brace_range: Range,
    pub close_brace_range: Range,
    pub range: Range,
}

impl Block {
    pub fn label_values(&self) -> Vec<&str> {
        self.labels.iter().map(|l| l.value.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockLabel {
    pub value: String,
    pub range: Range,
}

/// A chain of attribute/index steps from a root identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct Traversal {
    pub root: String,
    pub root_range: Range,
    pub steps: Vec<TravStep>,
}

impl Traversal {
    /// The full source range of the traversal.
    pub fn range(&self) -> Range {
        match self.steps.last() {
            Some(step) => self.root_range.union(&step.range),
            None => self.root_range.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TravStep {
    pub kind: TravStepKind,
    pub range: Range,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TravStepKind {
    /// `.name`
    Attr(String),
    /// `[literal]`; the key is an already-computed string or number.
    Index(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Or,
    And,
    Equal,
    NotEqual,
    LessThan,
    GreaterThan,
    LessThanEq,
    GreaterThanEq,
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Or => "||",
            BinOp::And => "&&",
            BinOp::Equal => "==",
            BinOp::NotEqual => "!=",
            BinOp::LessThan => "<",
            BinOp::GreaterThan => ">",
            BinOp::LessThanEq => "<=",
            BinOp::GreaterThanEq => ">=",
            BinOp::Add => "+",
            BinOp::Subtract => "-",
            BinOp::Multiply => "*",
            BinOp::Divide => "/",
            BinOp::Modulo => "%",
        }
    }

    /// Binding strength for precedence climbing; higher binds tighter.
    pub fn precedence(self) -> u8 {
        match self {
            BinOp::Or => 1,
            BinOp::And => 2,
            BinOp::Equal | BinOp::NotEqual => 3,
            BinOp::LessThan
            | BinOp::GreaterThan
            | BinOp::LessThanEq
            | BinOp::GreaterThanEq => 4,
            BinOp::Add | BinOp::Subtract => 5,
            BinOp::Multiply | BinOp::Divide | BinOp::Modulo => 6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Negate,
    Not,
}

impl UnOp {
    pub fn symbol(self) -> &'static str {
        match self {
            UnOp::Negate => "-",
            UnOp::Not => "!",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplatKind {
    /// Legacy `.*` form; consumes only attribute steps and auto-wraps
    /// non-null scalars into a one-element tuple.
    Attr,
    /// `[*]` form; consumes attribute and index steps.
    Full,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    Literal { text: String, range: Range },
    Interp(Expression),
}

/// A `for` comprehension: tuple form `[for v in c : expr]` or object form
/// `{for k, v in c : key => value}`.
#[derive(Debug, Clone, PartialEq)]
pub struct ForExpr {
    pub key_var: Option<String>,
    pub val_var: String,
    pub collection: Expression,
    /// Present for the object form.
    pub key_expr: Option<Expression>,
    pub val_expr: Expression,
    pub cond_expr: Option<Expression>,
    /// Object form only: `...` after the value collects duplicate keys
    /// into lists instead of reporting a collision.
    pub grouping: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectItem {
    pub key: Expression,
    pub value: Expression,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    pub kind: ExprKind,
    pub range: Range,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    /// An already-computed value, e.g. a literal number or `true`.
    Literal(Value),
    /// A root identifier with traversal steps, e.g. `a.b[0]`.
    ScopeTraversal(Traversal),
    /// Traversal steps applied to a computed base expression.
    RelativeTraversal {
        base: Box<Expression>,
        steps: Vec<TravStep>,
    },
    FunctionCall {
        name: String,
        name_range: Range,
        args: Vec<Expression>,
        /// `f(xs...)`: the final argument expands into the variadic
        /// parameters.
        expand_final: bool,
    },
    Conditional {
        cond: Box<Expression>,
        true_expr: Box<Expression>,
        false_expr: Box<Expression>,
    },
    BinaryOp {
        lhs: Box<Expression>,
        op: BinOp,
        rhs: Box<Expression>,
    },
    UnaryOp {
        op: UnOp,
        operand: Box<Expression>,
    },
    /// A template with literal and interpolated parts.
    Template(Vec<TemplatePart>),
    /// A template consisting of exactly one interpolation and nothing
    /// else; the inner value passes through unconverted.
    TemplateWrap(Box<Expression>),
    /// A template `for` directive: the inner expression produces a tuple
    /// whose elements join into a single string.
    TemplateJoin(Box<Expression>),
    For(Box<ForExpr>),
    Tuple(Vec<Expression>),
    Object(Vec<ObjectItem>),
    /// Dynamic index: `collection[key]` where the key is computed.
    Index {
        collection: Box<Expression>,
        key: Box<Expression>,
    },
    /// `source.*.attr` or `source[*]...`; `each` is evaluated once per
    /// element with [`ExprKind::AnonSymbol`] bound to the element.
    Splat {
        source: Box<Expression>,
        each: Box<Expression>,
        kind: SplatKind,
    },
    /// The iteration placeholder inside a splat's `each` expression.
    AnonSymbol,
}

impl Expression {
    pub fn literal(value: Value, range: Range) -> Expression {
        Expression {
            kind: ExprKind::Literal(value),
            range,
        }
    }

    /// Every scope traversal the expression refers to, for scope
    /// analysis. Variables bound by enclosing `for` expressions are
    /// excluded.
    pub fn variables(&self) -> Vec<Traversal> {
        let mut out = Vec::new();
        let mut bound = HashSet::new();
        collect_variables(self, &mut bound, &mut out);
        out
    }
}

fn collect_variables(
    expr: &Expression,
    bound: &mut HashSet<String>,
    out: &mut Vec<Traversal>,
) {
    match &expr.kind {
        ExprKind::Literal(_) | ExprKind::AnonSymbol => {}
        ExprKind::ScopeTraversal(t) => {
            if !bound.contains(&t.root) {
                out.push(t.clone());
            }
        }
        ExprKind::RelativeTraversal { base, .. } => collect_variables(base, bound, out),
        ExprKind::FunctionCall { args, .. } => {
            for a in args {
                collect_variables(a, bound, out);
            }
        }
        ExprKind::Conditional {
            cond,
            true_expr,
            false_expr,
        } => {
            collect_variables(cond, bound, out);
            collect_variables(true_expr, bound, out);
            collect_variables(false_expr, bound, out);
        }
        ExprKind::BinaryOp { lhs, rhs, .. } => {
            collect_variables(lhs, bound, out);
            collect_variables(rhs, bound, out);
        }
        ExprKind::UnaryOp { operand, .. } => collect_variables(operand, bound, out),
        ExprKind::Template(parts) => {
            for p in parts {
                if let TemplatePart::Interp(e) = p {
                    collect_variables(e, bound, out);
                }
            }
        }
        ExprKind::TemplateWrap(e) | ExprKind::TemplateJoin(e) => {
            collect_variables(e, bound, out)
        }
        ExprKind::For(f) => {
            collect_variables(&f.collection, bound, out);
            let mut added = Vec::new();
            if let Some(k) = &f.key_var {
                if bound.insert(k.clone()) {
                    added.push(k.clone());
                }
            }
            if bound.insert(f.val_var.clone()) {
                added.push(f.val_var.clone());
            }
            if let Some(k) = &f.key_expr {
                collect_variables(k, bound, out);
            }
            collect_variables(&f.val_expr, bound, out);
            if let Some(c) = &f.cond_expr {
                collect_variables(c, bound, out);
            }
            for name in added {
                bound.remove(&name);
            }
        }
        ExprKind::Tuple(elems) => {
            for e in elems {
                collect_variables(e, bound, out);
            }
        }
        ExprKind::Object(items) => {
            for item in items {
                collect_variables(&item.key, bound, out);
                collect_variables(&item.value, bound, out);
            }
        }
        ExprKind::Index { collection, key } => {
            collect_variables(collection, bound, out);
            collect_variables(key, bound, out);
        }
        ExprKind::Splat { source, each, .. } => {
            collect_variables(source, bound, out);
            collect_variables(each, bound, out);
        }
    }
}
