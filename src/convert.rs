//! The type conversion lattice. Conversion is a partial function: some
//! pairs convert exactly (safe), some with permitted loss of type detail
//! (unsafe), and the rest not at all. Operators and function calls use
//! the unsafe set; identity conversion is always safe.

use crate::number::Number;
use crate::value::{Datum, Type, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Safety {
    /// Exact: no information loss possible.
    Safe,
    /// Permitted but lossy or fallible, e.g. number-to-string or
    /// string-to-number.
    Unsafe,
}

/// Whether a value of type `from` can be converted to `to`, and how.
/// `None` means the conversion is impossible.
pub fn safety(from: &Type, to: &Type) -> Option<Safety> {
    if from == to || matches!(to, Type::Dynamic) || matches!(from, Type::Dynamic) {
        return Some(Safety::Safe);
    }
    match (from, to) {
        (Type::Number | Type::Bool, Type::String) => Some(Safety::Safe),
        (Type::String, Type::Number | Type::Bool) => Some(Safety::Unsafe),

        (Type::List(a), Type::List(b))
        | (Type::Set(a), Type::Set(b))
        | (Type::Map(a), Type::Map(b)) => safety(a, b),
        (Type::List(a), Type::Set(b)) => safety(a, b).map(|_| Safety::Unsafe),
        (Type::Set(a), Type::List(b)) => safety(a, b),
        (Type::Tuple(elems), Type::List(b)) => {
            let mut worst = Safety::Safe;
            for e in elems {
                match safety(e, b)? {
                    Safety::Safe => {}
                    Safety::Unsafe => worst = Safety::Unsafe,
                }
            }
            Some(worst)
        }
        (Type::Tuple(elems), Type::Set(b)) => {
            for e in elems {
                safety(e, b)?;
            }
            Some(Safety::Unsafe)
        }
        (Type::Tuple(a), Type::Tuple(b)) => {
            if a.len() != b.len() {
                return None;
            }
            let mut worst = Safety::Safe;
            for (ea, eb) in a.iter().zip(b) {
                match safety(ea, eb)? {
                    Safety::Safe => {}
                    Safety::Unsafe => worst = Safety::Unsafe,
                }
            }
            Some(worst)
        }
        (Type::Object(attrs), Type::Map(b)) => {
            let mut worst = Safety::Safe;
            for t in attrs.values() {
                match safety(t, b)? {
                    Safety::Safe => {}
                    Safety::Unsafe => worst = Safety::Unsafe,
                }
            }
            Some(worst)
        }
        (Type::Map(a), Type::Object(attrs)) => {
            for t in attrs.values() {
                safety(a, t)?;
            }
            Some(Safety::Unsafe)
        }
        (Type::Object(a), Type::Object(b)) => {
            // Every attribute the target wants must exist in the source.
            let mut worst = Safety::Safe;
            for (name, tb) in b {
                let ta = a.get(name)?;
                match safety(ta, tb)? {
                    Safety::Safe => {}
                    Safety::Unsafe => worst = Safety::Unsafe,
                }
            }
            if a.len() != b.len() {
                worst = Safety::Unsafe;
            }
            Some(worst)
        }
        _ => None,
    }
}

/// Converts `v` to type `to`, applying unsafe conversions where needed.
/// Nulls convert to the null of any type; unknowns convert to an unknown
/// of the target when the types could convert. Marks are preserved.
pub fn convert(v: &Value, to: &Type) -> Result<Value, String> {
    if v.ty() == to || matches!(to, Type::Dynamic) {
        return Ok(v.clone());
    }
    if v.is_null() {
        return Ok(Value::null(to.clone()).with_marks(v.marks()));
    }
    if v.is_unknown() {
        return match safety(v.ty(), to) {
            Some(_) => Ok(Value::unknown(to.clone()).with_marks(v.marks())),
            None => Err(mismatch(v.ty(), to)),
        };
    }
    let marks = v.marks().clone();
    let converted = convert_known(v, to)?;
    Ok(converted.with_marks(&marks))
}

fn convert_known(v: &Value, to: &Type) -> Result<Value, String> {
    match to {
        Type::Dynamic => Ok(v.clone()),
        Type::String => match v.ty() {
            Type::Number => Ok(Value::string(v.as_number().unwrap().to_string())),
            Type::Bool => Ok(Value::string(if v.as_bool().unwrap() {
                "true"
            } else {
                "false"
            })),
            _ => Err(mismatch(v.ty(), to)),
        },
        Type::Number => match v.ty() {
            Type::String => {
                let s = v.as_string().unwrap().trim();
                let (neg, digits) = match s.strip_prefix('-') {
                    Some(rest) => (true, rest),
                    None => (false, s),
                };
                let n = Number::from_literal(digits)
                    .map_err(|_| format!("a number is required, but the string {s:?} cannot be parsed as one"))?;
                Ok(Value::number(if neg { n.neg() } else { n }))
            }
            _ => Err(mismatch(v.ty(), to)),
        },
        Type::Bool => match v.ty() {
            Type::String => match v.as_string().unwrap() {
                "true" => Ok(Value::bool(true)),
                "false" => Ok(Value::bool(false)),
                other => Err(format!(
                    "a bool is required; to convert from string, use only the values \"true\" and \"false\", not {other:?}"
                )),
            },
            _ => Err(mismatch(v.ty(), to)),
        },
        Type::List(elem) => {
            let elems = v.as_seq().ok_or_else(|| mismatch(v.ty(), to))?;
            let converted = elems
                .iter()
                .map(|e| convert(e, elem))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::list((**elem).clone(), converted))
        }
        Type::Set(elem) => {
            let elems = v.as_seq().ok_or_else(|| mismatch(v.ty(), to))?;
            // Drop repeated elements wherever they occur, keeping first-seen
            // order.
            let mut converted: Vec<Value> = Vec::with_capacity(elems.len());
            for e in elems {
                let c = convert(e, elem)?;
                if !converted.contains(&c) {
                    converted.push(c);
                }
            }
            Ok(Value::set((**elem).clone(), converted))
        }
        Type::Tuple(tys) => {
            let elems = v.as_seq().ok_or_else(|| mismatch(v.ty(), to))?;
            if elems.len() != tys.len() {
                return Err(mismatch(v.ty(), to));
            }
            let converted = elems
                .iter()
                .zip(tys)
                .map(|(e, t)| convert(e, t))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::known(to.clone(), Datum::Seq(converted)))
        }
        Type::Map(elem) => {
            let entries = v.as_map().ok_or_else(|| mismatch(v.ty(), to))?;
            let converted = entries
                .iter()
                .map(|(k, e)| convert(e, elem).map(|c| (k.clone(), c)))
                .collect::<Result<BTreeMap<_, _>, _>>()?;
            Ok(Value::map((**elem).clone(), converted))
        }
        Type::Object(attrs) => {
            let entries = v.as_map().ok_or_else(|| mismatch(v.ty(), to))?;
            let mut converted = BTreeMap::new();
            for (name, ty) in attrs {
                match entries.get(name) {
                    Some(e) => {
                        converted.insert(name.clone(), convert(e, ty)?);
                    }
                    None => return Err(format!("attribute {name:?} is required")),
                }
            }
            Ok(Value::known(to.clone(), Datum::Map(converted)))
        }
    }
}

/// The unified type of two branch types: the type both can convert to.
/// Used for conditional expressions with an unknown predicate.
pub fn unify(a: &Type, b: &Type) -> Type {
    if a == b {
        return a.clone();
    }
    match (safety(a, b), safety(b, a)) {
        (Some(Safety::Safe), _) => b.clone(),
        (_, Some(Safety::Safe)) => a.clone(),
        _ => Type::Dynamic,
    }
}

fn mismatch(from: &Type, to: &Type) -> String {
    format!("cannot convert {from} to {to}")
}
