use crate::ast::*;
use crate::convert;
use crate::diag::{Diagnostic, Diagnostics};
use crate::number::Number;
use crate::pos::Range;
use crate::value::{Datum, MarkSet, Type, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// A lexical scope for evaluation: variables, functions, and a chain to
/// the enclosing scope. For expressions evaluate their bodies in child
/// scopes holding the iteration variables.
pub struct EvalContext<'a> {
    variables: HashMap<String, Value>,
    functions: HashMap<String, Function>,
    parent: Option<&'a EvalContext<'a>>,
}

impl<'a> EvalContext<'a> {
    pub fn new() -> EvalContext<'static> {
        EvalContext {
            variables: HashMap::new(),
            functions: HashMap::new(),
            parent: None,
        }
    }

    pub fn child(&'a self) -> EvalContext<'a> {
        EvalContext {
            variables: HashMap::new(),
            functions: HashMap::new(),
            parent: Some(self),
        }
    }

    pub fn declare_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn declare_function(&mut self, name: impl Into<String>, function: Function) {
        self.functions.insert(name.into(), function);
    }

    pub fn lookup_variable(&self, name: &str) -> Option<&Value> {
        match self.variables.get(name) {
            Some(v) => Some(v),
            None => self.parent.and_then(|p| p.lookup_variable(name)),
        }
    }

    pub fn lookup_function(&self, name: &str) -> Option<&Function> {
        match self.functions.get(name) {
            Some(f) => Some(f),
            None => self.parent.and_then(|p| p.lookup_function(name)),
        }
    }
}

impl Default for EvalContext<'static> {
    fn default() -> Self {
        EvalContext::new()
    }
}

/// A callable function value. The implementation sees finalized
/// arguments: converted to the declared parameter types, unmarked, and
/// with unknowns already short-circuited unless a parameter opts in.
#[derive(Clone)]
pub struct Function {
    params: Vec<Param>,
    variadic: Option<Param>,
    return_type: Type,
    imp: Arc<dyn Fn(&[Value]) -> Result<Value, String> + Send + Sync>,
}

#[derive(Clone)]
pub struct Param {
    pub name: String,
    pub ty: Type,
    /// Pass unknown arguments through instead of returning an unknown
    /// result without calling.
    pub allow_unknown: bool,
    pub allow_null: bool,
}

impl Param {
    pub fn new(name: impl Into<String>, ty: Type) -> Param {
        Param {
            name: name.into(),
            ty,
            allow_unknown: false,
            allow_null: false,
        }
    }
}

impl Function {
    pub fn new<F>(params: Vec<Param>, return_type: Type, imp: F) -> Function
    where
        F: Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        Function {
            params,
            variadic: None,
            return_type,
            imp: Arc::new(imp),
        }
    }

    pub fn new_variadic<F>(
        params: Vec<Param>,
        variadic: Param,
        return_type: Type,
        imp: F,
    ) -> Function
    where
        F: Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        Function {
            params,
            variadic: Some(variadic),
            return_type,
            imp: Arc::new(imp),
        }
    }
}

/// Evaluates an expression. Errors never abort: each failed
/// sub-expression yields an unknown value plus a diagnostic, and
/// evaluation carries on around it.
pub fn eval(expr: &Expression, ctx: &EvalContext<'_>) -> (Value, Diagnostics) {
    let mut e = Eval {
        anon: Vec::new(),
        diags: Diagnostics::new(),
    };
    let v = e.eval_expr(expr, ctx);
    (v, e.diags)
}

/// Applies traversal steps to an already-computed value.
pub fn apply_traversal(base: Value, steps: &[TravStep]) -> (Value, Diagnostics) {
    let mut e = Eval {
        anon: Vec::new(),
        diags: Diagnostics::new(),
    };
    let mut v = base;
    for step in steps {
        v = e.apply_step(v, step);
    }
    (v, e.diags)
}

impl Traversal {
    /// Applies this traversal's steps to a value standing in for the
    /// root. Scope-analysis callers resolve the root name themselves.
    pub fn traverse(&self, root: Value) -> (Value, Diagnostics) {
        apply_traversal(root, &self.steps)
    }
}

struct Eval {
    /// Values bound to the anonymous splat symbol, innermost last.
    anon: Vec<Value>,
    diags: Diagnostics,
}

impl Eval {
    fn error(&mut self, summary: &str, detail: String, range: Range) {
        self.diags.push(Diagnostic::error(summary, detail, range));
    }

    fn eval_expr(&mut self, expr: &Expression, ctx: &EvalContext<'_>) -> Value {
        match &expr.kind {
            ExprKind::Literal(v) => v.clone(),
            ExprKind::ScopeTraversal(trav) => self.eval_scope_traversal(trav, ctx),
            ExprKind::RelativeTraversal { base, steps } => {
                let mut v = self.eval_expr(base, ctx);
                for step in steps {
                    v = self.apply_step(v, step);
                }
                v
            }
            ExprKind::Index { collection, key } => {
                let coll = self.eval_expr(collection, ctx);
                let key = self.eval_expr(key, ctx);
                self.apply_index(coll, key, &expr.range)
            }
            ExprKind::FunctionCall {
                name,
                name_range,
                args,
                expand_final,
            } => self.eval_call(name, name_range, args, *expand_final, &expr.range, ctx),
            ExprKind::Conditional {
                cond,
                true_expr,
                false_expr,
            } => self.eval_conditional(cond, true_expr, false_expr, ctx),
            ExprKind::BinaryOp { lhs, op, rhs } => self.eval_binary(lhs, *op, rhs, &expr.range, ctx),
            ExprKind::UnaryOp { op, operand } => self.eval_unary(*op, operand, &expr.range, ctx),
            ExprKind::Template(parts) => self.eval_template(parts, ctx),
            ExprKind::TemplateWrap(inner) => self.eval_expr(inner, ctx),
            ExprKind::TemplateJoin(inner) => self.eval_template_join(inner, ctx),
            ExprKind::For(f) => self.eval_for(f, ctx),
            ExprKind::Tuple(elems) => {
                let values = elems.iter().map(|e| self.eval_expr(e, ctx)).collect();
                Value::tuple(values)
            }
            ExprKind::Object(items) => self.eval_object(items, ctx),
            ExprKind::Splat { source, each, kind } => {
                self.eval_splat(source, each, *kind, &expr.range, ctx)
            }
            ExprKind::AnonSymbol => self
                .anon
                .last()
                .cloned()
                .unwrap_or_else(|| Value::unknown(Type::Dynamic)),
        }
    }

    fn eval_scope_traversal(&mut self, trav: &Traversal, ctx: &EvalContext<'_>) -> Value {
        let mut v = match ctx.lookup_variable(&trav.root) {
            Some(v) => v.clone(),
            None => {
                self.error(
                    "Unknown variable",
                    format!("There is no variable named {:?} in this scope.", trav.root),
                    trav.root_range.clone(),
                );
                Value::unknown(Type::Dynamic)
            }
        };
        for step in &trav.steps {
            v = self.apply_step(v, step);
        }
        v
    }

    fn apply_step(&mut self, base: Value, step: &TravStep) -> Value {
        match &step.kind {
            TravStepKind::Attr(name) => self.apply_attr(base, name, &step.range),
            TravStepKind::Index(key) => self.apply_index(base, key.clone(), &step.range),
        }
    }

    fn apply_attr(&mut self, base: Value, name: &str, range: &Range) -> Value {
        let (base, marks) = base.unmark();
        if base.is_unknown() {
            let elem_ty = match base.ty() {
                Type::Object(attrs) => attrs.get(name).cloned().unwrap_or(Type::Dynamic),
                Type::Map(elem) => (**elem).clone(),
                _ => Type::Dynamic,
            };
            return Value::unknown(elem_ty).with_marks(&marks);
        }
        if base.is_null() {
            self.error(
                "Attempt to get attribute from null value",
                format!("The value being accessed for {name:?} is null."),
                range.clone(),
            );
            return Value::unknown(Type::Dynamic).with_marks(&marks);
        }
        match base.as_map() {
            Some(map) => match map.get(name) {
                Some(v) => v.clone().with_marks(&marks),
                None => {
                    self.error(
                        "Unsupported attribute",
                        format!("This value has no attribute named {name:?}."),
                        range.clone(),
                    );
                    Value::unknown(Type::Dynamic).with_marks(&marks)
                }
            },
            None => {
                self.error(
                    "Unsupported attribute",
                    format!(
                        "Attributes can only be read from objects and maps, not from {}.",
                        base.ty()
                    ),
                    range.clone(),
                );
                Value::unknown(Type::Dynamic).with_marks(&marks)
            }
        }
    }

    fn apply_index(&mut self, base: Value, key: Value, range: &Range) -> Value {
        let (base, mut marks) = base.unmark();
        let (key, key_marks) = key.unmark();
        marks.extend(key_marks);
        if base.is_null() {
            self.error(
                "Attempt to index null value",
                "The value being indexed is null.".to_string(),
                range.clone(),
            );
            return Value::unknown(Type::Dynamic).with_marks(&marks);
        }
        if base.is_unknown() || key.is_unknown() {
            let elem_ty = match base.ty() {
                Type::List(e) | Type::Set(e) | Type::Map(e) => (**e).clone(),
                _ => Type::Dynamic,
            };
            return Value::unknown(elem_ty).with_marks(&marks);
        }
        if key.is_null() {
            self.error(
                "Invalid index",
                "The index is null.".to_string(),
                range.clone(),
            );
            return Value::unknown(Type::Dynamic).with_marks(&marks);
        }
        if let Some(seq) = base.as_seq() {
            let idx = convert::convert(&key, &Type::Number)
                .ok()
                .and_then(|k| k.as_number().cloned())
                .and_then(|n| n.to_index());
            return match idx {
                Some(i) if i < seq.len() => seq[i].clone().with_marks(&marks),
                _ => {
                    self.error(
                        "Invalid index",
                        format!(
                            "The index must be a non-negative whole number less than {}.",
                            seq.len()
                        ),
                        range.clone(),
                    );
                    Value::unknown(Type::Dynamic).with_marks(&marks)
                }
            };
        }
        if let Some(map) = base.as_map() {
            let name = convert::convert(&key, &Type::String)
                .ok()
                .and_then(|k| k.as_string().map(str::to_string));
            return match name.as_deref().and_then(|n| map.get(n)) {
                Some(v) => v.clone().with_marks(&marks),
                None => {
                    self.error(
                        "Invalid index",
                        "The given key does not identify an element of this collection.".to_string(),
                        range.clone(),
                    );
                    Value::unknown(Type::Dynamic).with_marks(&marks)
                }
            };
        }
        self.error(
            "Invalid index",
            format!("Values of type {} cannot be indexed.", base.ty()),
            range.clone(),
        );
        Value::unknown(Type::Dynamic).with_marks(&marks)
    }

    // === Operators ===

    fn eval_conditional(
        &mut self,
        cond: &Expression,
        true_expr: &Expression,
        false_expr: &Expression,
        ctx: &EvalContext<'_>,
    ) -> Value {
        let cond_val = self.eval_expr(cond, ctx);
        let (cond_val, marks) = cond_val.unmark();
        let cond_val = self.coerce(cond_val, &Type::Bool, "condition", &cond.range);
        if cond_val.is_null() {
            self.error(
                "Invalid condition",
                "The condition of a conditional expression must not be null.".to_string(),
                cond.range.clone(),
            );
            return Value::unknown(Type::Dynamic).with_marks(&marks);
        }
        match cond_val.as_bool() {
            Some(true) => self.eval_expr(true_expr, ctx).with_marks(&marks),
            Some(false) => self.eval_expr(false_expr, ctx).with_marks(&marks),
            None => {
                // Unknown condition: evaluate both branches so their
                // diagnostics surface, and unify the result type.
                let t = self.eval_expr(true_expr, ctx);
                let f = self.eval_expr(false_expr, ctx);
                let ty = convert::unify(t.ty(), f.ty());
                Value::unknown(ty)
                    .with_marks(&marks)
                    .with_marks(t.marks())
                    .with_marks(f.marks())
            }
        }
    }

    fn eval_binary(
        &mut self,
        lhs: &Expression,
        op: BinOp,
        rhs: &Expression,
        range: &Range,
        ctx: &EvalContext<'_>,
    ) -> Value {
        if matches!(op, BinOp::And | BinOp::Or) {
            return self.eval_logical(lhs, op, rhs, ctx);
        }
        let lv = self.eval_expr(lhs, ctx);
        let rv = self.eval_expr(rhs, ctx);
        let (lv, mut marks) = lv.unmark();
        let (rv, rmarks) = rv.unmark();
        marks.extend(rmarks);
        let result = match op {
            BinOp::Equal | BinOp::NotEqual => self.eval_equality(lv, op, rv),
            BinOp::LessThan
            | BinOp::GreaterThan
            | BinOp::LessThanEq
            | BinOp::GreaterThanEq => self.eval_comparison(lv, op, rv, lhs, rhs),
            BinOp::Add | BinOp::Subtract | BinOp::Multiply | BinOp::Divide | BinOp::Modulo => {
                self.eval_arithmetic(lv, op, rv, lhs, rhs, range)
            }
            BinOp::And | BinOp::Or => unreachable!("handled above"),
        };
        result.with_marks(&marks)
    }

    /// Both operands always type-check, but when a known operand decides
    /// the result on its own, diagnostics from the other side are
    /// discarded.
    fn eval_logical(
        &mut self,
        lhs: &Expression,
        op: BinOp,
        rhs: &Expression,
        ctx: &EvalContext<'_>,
    ) -> Value {
        let decider = matches!(op, BinOp::Or);
        let lv = self.eval_expr(lhs, ctx);
        let (lv, mut marks) = lv.unmark();
        let lv = self.operand_bool(lv, lhs);
        if lv.as_bool() == Some(decider) {
            let before = self.diags.len();
            let rv = self.eval_expr(rhs, ctx);
            let (rv, _) = rv.unmark();
            self.operand_bool(rv, rhs);
            self.diags.truncate(before);
            return Value::bool(decider).with_marks(&marks);
        }
        let rv = self.eval_expr(rhs, ctx);
        let (rv, rmarks) = rv.unmark();
        marks.extend(rmarks);
        let rv = self.operand_bool(rv, rhs);
        match (lv.as_bool(), rv.as_bool()) {
            (Some(l), Some(r)) => {
                let v = if decider { l || r } else { l && r };
                Value::bool(v).with_marks(&marks)
            }
            // One side unknown; the other known side cannot decide, or
            // it would have been caught above.
            (_, Some(r)) if r == decider => Value::bool(decider).with_marks(&marks),
            _ => Value::unknown(Type::Bool).with_marks(&marks),
        }
    }

    fn operand_bool(&mut self, v: Value, expr: &Expression) -> Value {
        if v.is_null() {
            self.error(
                "Invalid operand",
                "Logical operators do not apply to null values.".to_string(),
                expr.range.clone(),
            );
            return Value::unknown(Type::Bool);
        }
        self.coerce(v, &Type::Bool, "operand", &expr.range)
    }

    fn eval_equality(&mut self, lv: Value, op: BinOp, rv: Value) -> Value {
        if lv.is_unknown() || rv.is_unknown() {
            return Value::unknown(Type::Bool);
        }
        let equal = values_equal(&lv, &rv);
        Value::bool(if op == BinOp::Equal { equal } else { !equal })
    }

    fn eval_comparison(
        &mut self,
        lv: Value,
        op: BinOp,
        rv: Value,
        lhs: &Expression,
        rhs: &Expression,
    ) -> Value {
        let ln = self.operand_number(lv, lhs);
        let rn = self.operand_number(rv, rhs);
        match (ln, rn) {
            (Some(a), Some(b)) => {
                let ord = a.compare(&b);
                let v = match op {
                    BinOp::LessThan => ord.is_lt(),
                    BinOp::GreaterThan => ord.is_gt(),
                    BinOp::LessThanEq => ord.is_le(),
                    BinOp::GreaterThanEq => ord.is_ge(),
                    _ => unreachable!(),
                };
                Value::bool(v)
            }
            _ => Value::unknown(Type::Bool),
        }
    }

    fn eval_arithmetic(
        &mut self,
        lv: Value,
        op: BinOp,
        rv: Value,
        lhs: &Expression,
        rhs: &Expression,
        range: &Range,
    ) -> Value {
        let ln = self.operand_number(lv, lhs);
        let rn = self.operand_number(rv, rhs);
        let (a, b) = match (ln, rn) {
            (Some(a), Some(b)) => (a, b),
            _ => return Value::unknown(Type::Number),
        };
        let result = match op {
            BinOp::Add => Some(a.add(&b)),
            BinOp::Subtract => Some(a.sub(&b)),
            BinOp::Multiply => Some(a.mul(&b)),
            BinOp::Divide => a.checked_div(&b),
            BinOp::Modulo => a.checked_rem(&b),
            _ => unreachable!(),
        };
        match result {
            Some(n) => Value::number(n),
            None => {
                self.error(
                    "Division by zero",
                    "The right-hand operand of this operation is zero.".to_string(),
                    range.clone(),
                );
                Value::unknown(Type::Number)
            }
        }
    }

    /// Coerces an operand to a number, reporting nulls and type
    /// mismatches. None means unknown.
    fn operand_number(&mut self, v: Value, expr: &Expression) -> Option<Number> {
        if v.is_null() {
            self.error(
                "Invalid operand",
                "Arithmetic and comparison operators do not apply to null values.".to_string(),
                expr.range.clone(),
            );
            return None;
        }
        let v = self.coerce(v, &Type::Number, "operand", &expr.range);
        v.as_number().cloned()
    }

    fn eval_unary(
        &mut self,
        op: UnOp,
        operand: &Expression,
        range: &Range,
        ctx: &EvalContext<'_>,
    ) -> Value {
        let v = self.eval_expr(operand, ctx);
        let (v, marks) = v.unmark();
        match op {
            UnOp::Negate => match self.operand_number(v, operand) {
                Some(n) => Value::number(n.neg()).with_marks(&marks),
                None => Value::unknown(Type::Number).with_marks(&marks),
            },
            UnOp::Not => {
                if v.is_null() {
                    self.error(
                        "Invalid operand",
                        "The \"!\" operator does not apply to null values.".to_string(),
                        range.clone(),
                    );
                    return Value::unknown(Type::Bool).with_marks(&marks);
                }
                let v = self.coerce(v, &Type::Bool, "operand", &operand.range);
                match v.as_bool() {
                    Some(b) => Value::bool(!b).with_marks(&marks),
                    None => Value::unknown(Type::Bool).with_marks(&marks),
                }
            }
        }
    }

    // === Calls ===

    fn eval_call(
        &mut self,
        name: &str,
        name_range: &Range,
        args: &[Expression],
        expand_final: bool,
        range: &Range,
        ctx: &EvalContext<'_>,
    ) -> Value {
        let mut values: Vec<(Value, Range)> = args
            .iter()
            .map(|a| (self.eval_expr(a, ctx), a.range.clone()))
            .collect();

        let f = match ctx.lookup_function(name) {
            Some(f) => f.clone(),
            None => {
                self.error(
                    "Call to unknown function",
                    format!("There is no function named {name:?}."),
                    name_range.clone(),
                );
                return Value::unknown(Type::Dynamic);
            }
        };

        if expand_final {
            match values.pop() {
                Some((last, last_range)) => {
                    if last.is_unknown() {
                        return Value::unknown(f.return_type.clone());
                    }
                    match last.as_seq() {
                        Some(seq) => {
                            let marks = last.marks().clone();
                            for v in seq {
                                values.push((v.clone().with_marks(&marks), last_range.clone()));
                            }
                        }
                        None => {
                            self.error(
                                "Invalid expanding argument",
                                "The expanding argument (after ...) must be a tuple or list."
                                    .to_string(),
                                last_range,
                            );
                            return Value::unknown(f.return_type.clone());
                        }
                    }
                }
                None => {
                    self.error(
                        "Invalid expanding argument",
                        "There is no argument to expand.".to_string(),
                        range.clone(),
                    );
                }
            }
        }

        let min = f.params.len();
        let arity_ok = if f.variadic.is_some() {
            values.len() >= min
        } else {
            values.len() == min
        };
        if !arity_ok {
            self.error(
                "Invalid function arguments",
                format!(
                    "Function {:?} expects {}{} argument(s), but {} were given.",
                    name,
                    min,
                    if f.variadic.is_some() { " or more" } else { "" },
                    values.len()
                ),
                range.clone(),
            );
            return Value::unknown(f.return_type.clone());
        }

        let mut finalized = Vec::with_capacity(values.len());
        let mut marks = MarkSet::new();
        let mut unknown = false;
        for (i, (v, arg_range)) in values.into_iter().enumerate() {
            // The arity check above guarantees a parameter for every
            // argument position.
            let Some(param) = f.params.get(i).or(f.variadic.as_ref()) else {
                break;
            };
            let (v, arg_marks) = v.unmark();
            marks.extend(arg_marks);
            if v.is_null() && !param.allow_null {
                self.error(
                    "Invalid function argument",
                    format!("Argument {:?} of {:?} must not be null.", param.name, name),
                    arg_range,
                );
                return Value::unknown(f.return_type.clone()).with_marks(&marks);
            }
            let v = match convert::convert(&v, &param.ty) {
                Ok(v) => v,
                Err(msg) => {
                    self.error(
                        "Invalid function argument",
                        format!("Argument {:?} of {:?}: {msg}.", param.name, name),
                        arg_range,
                    );
                    return Value::unknown(f.return_type.clone()).with_marks(&marks);
                }
            };
            if v.is_unknown() && !param.allow_unknown {
                unknown = true;
            }
            finalized.push(v);
        }
        if unknown {
            return Value::unknown(f.return_type.clone()).with_marks(&marks);
        }

        match (f.imp)(&finalized) {
            Ok(v) => v.with_marks(&marks),
            Err(msg) => {
                self.error(
                    "Error in function call",
                    format!("Call to {name:?} failed: {msg}."),
                    range.clone(),
                );
                Value::unknown(f.return_type.clone()).with_marks(&marks)
            }
        }
    }

    // === Templates ===

    fn eval_template(&mut self, parts: &[TemplatePart], ctx: &EvalContext<'_>) -> Value {
        let mut out = String::new();
        let mut marks = MarkSet::new();
        let mut unknown = false;
        for part in parts {
            match part {
                TemplatePart::Literal { text, .. } => out.push_str(text),
                TemplatePart::Interp(e) => {
                    let v = self.eval_expr(e, ctx);
                    let (v, v_marks) = v.unmark();
                    marks.extend(v_marks);
                    match self.template_piece(v, &e.range) {
                        Some(s) => out.push_str(&s),
                        None => unknown = true,
                    }
                }
            }
        }
        if unknown {
            return Value::unknown(Type::String).with_marks(&marks);
        }
        Value::string(out).with_marks(&marks)
    }

    fn eval_template_join(&mut self, inner: &Expression, ctx: &EvalContext<'_>) -> Value {
        let v = self.eval_expr(inner, ctx);
        let (v, marks) = v.unmark();
        if v.is_unknown() {
            return Value::unknown(Type::String).with_marks(&marks);
        }
        let seq = match v.as_seq() {
            Some(seq) => seq.to_vec(),
            None => return Value::unknown(Type::String).with_marks(&marks),
        };
        let mut out = String::new();
        let mut all_marks = marks;
        let mut unknown = false;
        for item in seq {
            let (item, item_marks) = item.unmark();
            all_marks.extend(item_marks);
            match self.template_piece(item, &inner.range) {
                Some(s) => out.push_str(&s),
                None => unknown = true,
            }
        }
        if unknown {
            return Value::unknown(Type::String).with_marks(&all_marks);
        }
        Value::string(out).with_marks(&all_marks)
    }

    /// Renders one interpolation result. None means unknown.
    fn template_piece(&mut self, v: Value, range: &Range) -> Option<String> {
        if v.is_null() {
            self.error(
                "Invalid template interpolation value",
                "The expression result is null, which cannot be rendered into a string."
                    .to_string(),
                range.clone(),
            );
            return Some(String::new());
        }
        if v.is_unknown() {
            return None;
        }
        match convert::convert(&v, &Type::String) {
            Ok(s) => Some(s.as_string().unwrap_or_default().to_string()),
            Err(msg) => {
                self.error(
                    "Invalid template interpolation value",
                    format!("The expression result cannot be rendered into a string: {msg}."),
                    range.clone(),
                );
                Some(String::new())
            }
        }
    }

    // === Comprehensions ===

    fn eval_for(&mut self, f: &ForExpr, ctx: &EvalContext<'_>) -> Value {
        let coll = self.eval_expr(&f.collection, ctx);
        let (coll, marks) = coll.unmark();
        if coll.is_null() {
            self.error(
                "Iteration over null value",
                "A for expression cannot iterate over a null value.".to_string(),
                f.collection.range.clone(),
            );
            return self.unknown_for_result(f).with_marks(&marks);
        }
        if coll.is_unknown() {
            return self.unknown_for_result(f).with_marks(&marks);
        }

        // Pairs of (key value, element value), in iteration order: index
        // order for sequences, lexical key order for maps and objects.
        let pairs: Vec<(Value, Value)> = if let Some(seq) = coll.as_seq() {
            seq.iter()
                .enumerate()
                .map(|(i, v)| (Value::number(Number::from(i)), v.clone()))
                .collect()
        } else if let Some(map) = coll.as_map() {
            map.iter()
                .map(|(k, v)| (Value::string(k.clone()), v.clone()))
                .collect()
        } else {
            self.error(
                "Iteration over non-collection",
                format!("A value of type {} cannot be iterated.", coll.ty()),
                f.collection.range.clone(),
            );
            return self.unknown_for_result(f).with_marks(&marks);
        };

        let mut tuple_items = Vec::new();
        let mut object_items: BTreeMap<String, Value> = BTreeMap::new();
        let mut grouped: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        let mut result_marks = marks;
        let mut unknown = false;

        for (key, elem) in pairs {
            let mut scope = ctx.child();
            if let Some(kv) = &f.key_var {
                scope.declare_variable(kv.clone(), key);
            }
            scope.declare_variable(f.val_var.clone(), elem);

            if let Some(cond) = &f.cond_expr {
                let cv = self.eval_expr(cond, &scope);
                let (cv, cond_marks) = cv.unmark();
                result_marks.extend(cond_marks);
                let cv = self.coerce(cv, &Type::Bool, "filter condition", &cond.range);
                if cv.is_null() {
                    self.error(
                        "Invalid for filter",
                        "The filter condition must not be null.".to_string(),
                        cond.range.clone(),
                    );
                    return self.unknown_for_result(f).with_marks(&result_marks);
                }
                match cv.as_bool() {
                    Some(false) => continue,
                    Some(true) => {}
                    // An unknown filter makes the whole shape unknown.
                    None => return self.unknown_for_result(f).with_marks(&result_marks),
                }
            }

            match &f.key_expr {
                None => tuple_items.push(self.eval_expr(&f.val_expr, &scope)),
                Some(key_expr) => {
                    let kv = self.eval_expr(key_expr, &scope);
                    let (kv, key_marks) = kv.unmark();
                    result_marks.extend(key_marks);
                    if kv.is_null() {
                        self.error(
                            "Invalid object key",
                            "The key of a for object must not be null.".to_string(),
                            key_expr.range.clone(),
                        );
                        return self.unknown_for_result(f).with_marks(&result_marks);
                    }
                    if kv.is_unknown() {
                        unknown = true;
                        continue;
                    }
                    let kv = self.coerce(kv, &Type::String, "object key", &key_expr.range);
                    let key_str = match kv.as_string() {
                        Some(s) => s.to_string(),
                        None => {
                            unknown = true;
                            continue;
                        }
                    };
                    let vv = self.eval_expr(&f.val_expr, &scope);
                    if f.grouping {
                        grouped.entry(key_str).or_default().push(vv);
                    } else if object_items.insert(key_str.clone(), vv).is_some() {
                        self.error(
                            "Duplicate object key",
                            format!(
                                "The key {key_str:?} was produced more than once; use the grouping mode (...) to collect duplicates."
                            ),
                            key_expr.range.clone(),
                        );
                    }
                }
            }
        }

        if unknown {
            return self.unknown_for_result(f).with_marks(&result_marks);
        }
        let result = match &f.key_expr {
            None => Value::tuple(tuple_items),
            Some(_) if f.grouping => Value::object(
                grouped
                    .into_iter()
                    .map(|(k, vs)| (k, Value::tuple(vs)))
                    .collect(),
            ),
            Some(_) => Value::object(object_items),
        };
        result.with_marks(&result_marks)
    }

    fn unknown_for_result(&self, f: &ForExpr) -> Value {
        if f.key_expr.is_some() {
            Value::unknown(Type::map(Type::Dynamic))
        } else {
            Value::unknown(Type::list(Type::Dynamic))
        }
    }

    fn eval_object(&mut self, items: &[ObjectItem], ctx: &EvalContext<'_>) -> Value {
        let mut attrs = BTreeMap::new();
        let mut marks = MarkSet::new();
        let mut unknown = false;
        for item in items {
            let kv = self.eval_expr(&item.key, ctx);
            let (kv, key_marks) = kv.unmark();
            marks.extend(key_marks);
            if kv.is_null() {
                self.error(
                    "Invalid object key",
                    "Object keys must not be null.".to_string(),
                    item.key.range.clone(),
                );
                continue;
            }
            if kv.is_unknown() {
                unknown = true;
                continue;
            }
            let kv = self.coerce(kv, &Type::String, "object key", &item.key.range);
            let key = match kv.as_string() {
                Some(s) => s.to_string(),
                None => {
                    unknown = true;
                    continue;
                }
            };
            let value = self.eval_expr(&item.value, ctx);
            if attrs.insert(key.clone(), value).is_some() {
                self.error(
                    "Duplicate object key",
                    format!("The key {key:?} appears more than once in this object."),
                    item.key.range.clone(),
                );
            }
        }
        if unknown {
            return Value::unknown(Type::map(Type::Dynamic)).with_marks(&marks);
        }
        Value::object(attrs).with_marks(&marks)
    }

    fn eval_splat(
        &mut self,
        source: &Expression,
        each: &Expression,
        kind: SplatKind,
        range: &Range,
        ctx: &EvalContext<'_>,
    ) -> Value {
        let src = self.eval_expr(source, ctx);
        let (src, marks) = src.unmark();
        if src.is_unknown() {
            return Value::unknown(Type::list(Type::Dynamic)).with_marks(&marks);
        }
        // Either splat form applied to null yields an empty tuple.
        if src.is_null() {
            return Value::empty_tuple().with_marks(&marks);
        }
        let elems: Vec<Value> = match src.as_seq() {
            Some(seq) => seq.to_vec(),
            None => match kind {
                // An attribute splat treats a single non-null value as a
                // one-element sequence.
                SplatKind::Attr => vec![src.clone()],
                SplatKind::Full => {
                    self.error(
                        "Splat of non-list value",
                        format!(
                            "The [*] splat can only be applied to tuples, lists, and sets, not to {}.",
                            src.ty()
                        ),
                        range.clone(),
                    );
                    return Value::unknown(Type::list(Type::Dynamic)).with_marks(&marks);
                }
            },
        };
        let mut out = Vec::with_capacity(elems.len());
        for elem in elems {
            self.anon.push(elem);
            let v = self.eval_expr(each, ctx);
            self.anon.pop();
            out.push(v);
        }
        Value::tuple(out).with_marks(&marks)
    }

    // === Helpers ===

    fn coerce(&mut self, v: Value, ty: &Type, what: &str, range: &Range) -> Value {
        match convert::convert(&v, ty) {
            Ok(v) => v,
            Err(msg) => {
                self.error(
                    "Type mismatch",
                    format!("The {what} has the wrong type: {msg}."),
                    range.clone(),
                );
                Value::unknown(ty.clone())
            }
        }
    }
}

/// Deep structural equality on known values; marks and exact collection
/// kinds are not significant.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.datum(), b.datum()) {
        (None, None) => a.is_null() && b.is_null(),
        (Some(x), Some(y)) => datums_equal(x, y),
        _ => false,
    }
}

fn datums_equal(x: &Datum, y: &Datum) -> bool {
    match (x, y) {
        (Datum::String(a), Datum::String(b)) => a == b,
        (Datum::Number(a), Datum::Number(b)) => a == b,
        (Datum::Bool(a), Datum::Bool(b)) => a == b,
        (Datum::Seq(a), Datum::Seq(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        (Datum::Map(a), Datum::Map(b)) => {
            a.len() == b.len()
                && a.iter()
                    .zip(b)
                    .all(|((ka, va), (kb, vb))| ka == kb && values_equal(va, vb))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_expression;
    use crate::pos::Pos;

    fn eval_src(src: &str, ctx: &EvalContext<'_>) -> (Value, Diagnostics) {
        let (expr, diags) = parse_expression(src, "test.bcl", Pos::start());
        assert!(!diags.has_errors(), "parse failed: {diags}");
        eval(&expr, ctx)
    }

    fn eval_ok(src: &str, ctx: &EvalContext<'_>) -> Value {
        let (v, diags) = eval_src(src, ctx);
        assert!(!diags.has_errors(), "eval failed: {diags}");
        v
    }

    #[test]
    fn test_arithmetic_is_exact() {
        let ctx = EvalContext::new();
        let v = eval_ok("0.1 + 0.2", &ctx);
        assert_eq!(v, Value::number(Number::from_literal("0.3").unwrap()));
    }

    #[test]
    fn test_division_by_zero() {
        let ctx = EvalContext::new();
        let (v, diags) = eval_src("1 / 0", &ctx);
        assert!(diags.has_errors());
        assert!(v.is_unknown());
    }

    #[test]
    fn test_string_number_coercion() {
        let ctx = EvalContext::new();
        let v = eval_ok("\"2\" + 3", &ctx);
        assert_eq!(v, Value::int(5));
    }

    #[test]
    fn test_equality_across_types_is_false() {
        let ctx = EvalContext::new();
        assert_eq!(eval_ok("1 == \"1\"", &ctx), Value::bool(false));
        assert_eq!(eval_ok("null == null", &ctx), Value::bool(true));
    }

    #[test]
    fn test_variable_lookup_and_scope_chain() {
        let mut root = EvalContext::new();
        root.declare_variable("a", Value::int(1));
        let mut child = root.child();
        child.declare_variable("b", Value::int(2));
        assert_eq!(eval_ok("a + b", &child), Value::int(3));
    }

    #[test]
    fn test_unknown_variable_diagnostic() {
        let ctx = EvalContext::new();
        let (v, diags) = eval_src("nope + 1", &ctx);
        assert!(diags.has_errors());
        assert!(v.is_unknown());
    }

    #[test]
    fn test_unknown_propagates() {
        let mut ctx = EvalContext::new();
        ctx.declare_variable("u", Value::unknown(Type::Number));
        let v = eval_ok("u + 1", &ctx);
        assert!(v.is_unknown());
        assert_eq!(v.ty(), &Type::Number);
    }

    #[test]
    fn test_short_circuit_suppresses_errors() {
        let mut ctx = EvalContext::new();
        ctx.declare_variable("t", Value::bool(true));
        // The right side would error, but the left side decides.
        let (v, diags) = eval_src("t || missing", &ctx);
        assert!(!diags.has_errors(), "unexpected: {diags}");
        assert_eq!(v, Value::bool(true));
        let (v, diags) = eval_src("!t && missing", &ctx);
        assert!(!diags.has_errors(), "unexpected: {diags}");
        assert_eq!(v, Value::bool(false));
    }

    #[test]
    fn test_non_deciding_operand_errors_surface() {
        let ctx = EvalContext::new();
        let (_, diags) = eval_src("false || missing", &ctx);
        assert!(diags.has_errors());
    }

    #[test]
    fn test_conditional_takes_one_branch() {
        let mut ctx = EvalContext::new();
        ctx.declare_variable("flag", Value::bool(false));
        // The true branch divides by zero; it must not be evaluated.
        let v = eval_ok("flag ? 1 / 0 : 9", &ctx);
        assert_eq!(v, Value::int(9));
    }

    #[test]
    fn test_conditional_unknown_predicate() {
        let mut ctx = EvalContext::new();
        ctx.declare_variable("flag", Value::unknown(Type::Bool));
        let v = eval_ok("flag ? 1 : 2", &ctx);
        assert!(v.is_unknown());
        assert_eq!(v.ty(), &Type::Number);
    }

    #[test]
    fn test_template_interpolation() {
        let mut ctx = EvalContext::new();
        ctx.declare_variable("name", Value::string("world"));
        assert_eq!(eval_ok("\"hello ${name}!\"", &ctx), Value::string("hello world!"));
    }

    #[test]
    fn test_template_converts_numbers() {
        let ctx = EvalContext::new();
        assert_eq!(eval_ok("\"n = ${1 + 1}\"", &ctx), Value::string("n = 2"));
    }

    #[test]
    fn test_template_null_interp_errors() {
        let ctx = EvalContext::new();
        let (_, diags) = eval_src("\"x ${null}\"", &ctx);
        assert!(diags.has_errors());
    }

    #[test]
    fn test_template_wrap_passes_value_through() {
        let mut ctx = EvalContext::new();
        ctx.declare_variable("n", Value::int(7));
        // A template that is exactly one interpolation keeps the type.
        assert_eq!(eval_ok("\"${n}\"", &ctx), Value::int(7));
    }

    #[test]
    fn test_traversal_and_index() {
        let mut ctx = EvalContext::new();
        let mut obj = BTreeMap::new();
        obj.insert("xs".to_string(), Value::tuple(vec![Value::int(10), Value::int(20)]));
        ctx.declare_variable("o", Value::object(obj));
        assert_eq!(eval_ok("o.xs[1]", &ctx), Value::int(20));
    }

    #[test]
    fn test_missing_attribute_diagnostic() {
        let mut ctx = EvalContext::new();
        ctx.declare_variable("o", Value::object(BTreeMap::new()));
        let (_, diags) = eval_src("o.nope", &ctx);
        assert!(diags.has_errors());
    }

    #[test]
    fn test_null_traversal_diagnostic() {
        let mut ctx = EvalContext::new();
        ctx.declare_variable("o", Value::null(Type::Dynamic));
        let (_, diags) = eval_src("o.attr", &ctx);
        assert!(diags.has_errors());
    }

    #[test]
    fn test_for_tuple_with_filter() {
        let mut ctx = EvalContext::new();
        ctx.declare_variable(
            "xs",
            Value::tuple(vec![Value::int(1), Value::int(2), Value::int(3)]),
        );
        let v = eval_ok("[for x in xs : x * 2 if x != 2]", &ctx);
        assert_eq!(v, Value::tuple(vec![Value::int(2), Value::int(6)]));
    }

    #[test]
    fn test_for_object_iterates_sorted() {
        let mut ctx = EvalContext::new();
        let mut map = BTreeMap::new();
        map.insert("b".to_string(), Value::int(2));
        map.insert("a".to_string(), Value::int(1));
        ctx.declare_variable("m", Value::object(map));
        let v = eval_ok("[for k, v in m : \"${k}=${v}\"]", &ctx);
        assert_eq!(
            v,
            Value::tuple(vec![Value::string("a=1"), Value::string("b=2")])
        );
    }

    #[test]
    fn test_for_grouping() {
        let mut ctx = EvalContext::new();
        ctx.declare_variable(
            "xs",
            Value::tuple(vec![Value::string("a"), Value::string("b"), Value::string("a")]),
        );
        let v = eval_ok("{for x in xs : x => x...}", &ctx);
        let map = v.as_map().unwrap();
        assert_eq!(map["a"].len(), Some(2));
        assert_eq!(map["b"].len(), Some(1));
    }

    #[test]
    fn test_for_duplicate_key_errors() {
        let mut ctx = EvalContext::new();
        ctx.declare_variable("xs", Value::tuple(vec![Value::string("a"), Value::string("a")]));
        let (_, diags) = eval_src("{for x in xs : x => x}", &ctx);
        assert!(diags.has_errors());
    }

    #[test]
    fn test_splat_attr() {
        let mut ctx = EvalContext::new();
        let mk = |n: i64| {
            let mut m = BTreeMap::new();
            m.insert("id".to_string(), Value::int(n));
            Value::object(m)
        };
        ctx.declare_variable("items", Value::tuple(vec![mk(1), mk(2)]));
        let v = eval_ok("items.*.id", &ctx);
        assert_eq!(v, Value::tuple(vec![Value::int(1), Value::int(2)]));
    }

    #[test]
    fn test_attr_splat_wraps_scalar() {
        let mut ctx = EvalContext::new();
        let mut m = BTreeMap::new();
        m.insert("id".to_string(), Value::int(9));
        ctx.declare_variable("item", Value::object(m));
        let v = eval_ok("item.*.id", &ctx);
        assert_eq!(v, Value::tuple(vec![Value::int(9)]));
    }

    #[test]
    fn test_full_splat_on_scalar_errors() {
        let mut ctx = EvalContext::new();
        ctx.declare_variable("x", Value::int(1));
        let (_, diags) = eval_src("x[*]", &ctx);
        assert!(diags.has_errors());
    }

    #[test]
    fn test_function_call() {
        let mut ctx = EvalContext::new();
        ctx.declare_function(
            "upper",
            Function::new(vec![Param::new("s", Type::String)], Type::String, |args| {
                Ok(Value::string(args[0].as_string().unwrap().to_uppercase()))
            }),
        );
        assert_eq!(eval_ok("upper(\"abc\")", &ctx), Value::string("ABC"));
    }

    #[test]
    fn test_function_unknown_arg_short_circuits() {
        let mut ctx = EvalContext::new();
        ctx.declare_function(
            "boom",
            Function::new(vec![Param::new("s", Type::String)], Type::String, |_| {
                Err("must not be called".to_string())
            }),
        );
        ctx.declare_variable("u", Value::unknown(Type::String));
        let (v, diags) = eval_src("boom(u)", &ctx);
        assert!(!diags.has_errors(), "unexpected: {diags}");
        assert!(v.is_unknown());
        assert_eq!(v.ty(), &Type::String);
    }

    #[test]
    fn test_variadic_expansion() {
        let mut ctx = EvalContext::new();
        ctx.declare_function(
            "sum",
            Function::new_variadic(
                Vec::new(),
                Param::new("n", Type::Number),
                Type::Number,
                |args| {
                    let mut acc = Number::zero();
                    for a in args {
                        acc = acc.add(a.as_number().unwrap());
                    }
                    Ok(Value::number(acc))
                },
            ),
        );
        ctx.declare_variable(
            "xs",
            Value::tuple(vec![Value::int(1), Value::int(2), Value::int(3)]),
        );
        assert_eq!(eval_ok("sum(xs...)", &ctx), Value::int(6));
    }

    #[test]
    fn test_marks_propagate_through_operations() {
        let mut ctx = EvalContext::new();
        ctx.declare_variable("secret", Value::string("5").with_mark("sensitive"));
        let v = eval_ok("secret + 1", &ctx);
        assert_eq!(v.as_number(), Some(&Number::from(6i64)));
        assert!(v.has_mark("sensitive"));
        let v = eval_ok("\"v: ${secret}\"", &ctx);
        assert!(v.has_mark("sensitive"));
    }

    #[test]
    fn test_marks_propagate_through_index() {
        let mut ctx = EvalContext::new();
        let list = Value::tuple(vec![Value::int(1)]).with_mark("sensitive");
        ctx.declare_variable("xs", list);
        let v = eval_ok("xs[0]", &ctx);
        assert!(v.has_mark("sensitive"));
    }
}
