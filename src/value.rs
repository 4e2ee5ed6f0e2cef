use crate::number::Number;
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A static type descriptor. Values carry one of these even when their
/// payload is unknown or null, which is what lets unknowns propagate with
/// useful types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    String,
    Number,
    Bool,
    /// Homogeneous ordered collection.
    List(Box<Type>),
    /// Homogeneous unordered collection without duplicates.
    Set(Box<Type>),
    /// Homogeneous string-keyed collection.
    Map(Box<Type>),
    /// Fixed-length heterogeneous sequence.
    Tuple(Vec<Type>),
    /// Fixed attribute names with per-attribute types.
    Object(BTreeMap<String, Type>),
    /// Shape not known statically; any value conforms.
    Dynamic,
}

impl Type {
    pub fn list(elem: Type) -> Type {
        Type::List(Box::new(elem))
    }

    pub fn set(elem: Type) -> Type {
        Type::Set(Box::new(elem))
    }

    pub fn map(elem: Type) -> Type {
        Type::Map(Box::new(elem))
    }

    pub fn is_primitive(&self) -> bool {
        matches!(self, Type::String | Type::Number | Type::Bool)
    }

    pub fn is_collection(&self) -> bool {
        matches!(
            self,
            Type::List(_) | Type::Set(_) | Type::Map(_) | Type::Tuple(_) | Type::Object(_)
        )
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::String => write!(f, "string"),
            Type::Number => write!(f, "number"),
            Type::Bool => write!(f, "bool"),
            Type::List(t) => write!(f, "list({t})"),
            Type::Set(t) => write!(f, "set({t})"),
            Type::Map(t) => write!(f, "map({t})"),
            Type::Tuple(ts) => {
                write!(f, "tuple([")?;
                for (i, t) in ts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{t}")?;
                }
                write!(f, "])")
            }
            Type::Object(attrs) => {
                write!(f, "object({{")?;
                for (i, (k, t)) in attrs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k} = {t}")?;
                }
                write!(f, "}})")
            }
            Type::Dynamic => write!(f, "dynamic"),
        }
    }
}

/// Opaque labels carried by values and preserved by every operation, e.g.
/// "sensitive". Operations union the marks of their inputs into their
/// outputs.
pub type MarkSet = BTreeSet<String>;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Payload {
    Known(Datum),
    /// Type known, value not yet computable.
    Unknown,
    /// The null of the carried type.
    Null,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Datum {
    String(String),
    Number(Number),
    Bool(bool),
    /// Backing store for list, set, and tuple values.
    Seq(Vec<Value>),
    /// Backing store for map and object values; sorted keys give the
    /// deterministic iteration order `for` expressions rely on.
    Map(BTreeMap<String, Value>),
}

/// A dynamic value: type descriptor, payload, and mark set. Values are
/// immutable; operations return new values.
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    ty: Type,
    payload: Payload,
    marks: MarkSet,
}

impl Value {
    pub fn string(s: impl Into<String>) -> Value {
        Value {
            ty: Type::String,
            payload: Payload::Known(Datum::String(s.into())),
            marks: MarkSet::new(),
        }
    }

    pub fn number(n: Number) -> Value {
        Value {
            ty: Type::Number,
            payload: Payload::Known(Datum::Number(n)),
            marks: MarkSet::new(),
        }
    }

    pub fn int(v: i64) -> Value {
        Value::number(Number::from(v))
    }

    pub fn bool(b: bool) -> Value {
        Value {
            ty: Type::Bool,
            payload: Payload::Known(Datum::Bool(b)),
            marks: MarkSet::new(),
        }
    }

    /// The null of `ty`.
    pub fn null(ty: Type) -> Value {
        Value {
            ty,
            payload: Payload::Null,
            marks: MarkSet::new(),
        }
    }

    /// A typed placeholder for a value not yet computable.
    pub fn unknown(ty: Type) -> Value {
        Value {
            ty,
            payload: Payload::Unknown,
            marks: MarkSet::new(),
        }
    }

    /// A tuple whose type is derived from its elements.
    pub fn tuple(elems: Vec<Value>) -> Value {
        let ty = Type::Tuple(elems.iter().map(|v| v.ty.clone()).collect());
        Value {
            ty,
            payload: Payload::Known(Datum::Seq(elems)),
            marks: MarkSet::new(),
        }
    }

    pub fn empty_tuple() -> Value {
        Value::tuple(Vec::new())
    }

    pub fn list(elem_ty: Type, elems: Vec<Value>) -> Value {
        Value {
            ty: Type::list(elem_ty),
            payload: Payload::Known(Datum::Seq(elems)),
            marks: MarkSet::new(),
        }
    }

    pub fn set(elem_ty: Type, elems: Vec<Value>) -> Value {
        Value {
            ty: Type::set(elem_ty),
            payload: Payload::Known(Datum::Seq(elems)),
            marks: MarkSet::new(),
        }
    }

    /// An object whose type is derived from its entries.
    pub fn object(attrs: BTreeMap<String, Value>) -> Value {
        let ty = Type::Object(
            attrs
                .iter()
                .map(|(k, v)| (k.clone(), v.ty.clone()))
                .collect(),
        );
        Value {
            ty,
            payload: Payload::Known(Datum::Map(attrs)),
            marks: MarkSet::new(),
        }
    }

    pub fn map(elem_ty: Type, entries: BTreeMap<String, Value>) -> Value {
        Value {
            ty: Type::map(elem_ty),
            payload: Payload::Known(Datum::Map(entries)),
            marks: MarkSet::new(),
        }
    }

    pub(crate) fn known(ty: Type, datum: Datum) -> Value {
        Value {
            ty,
            payload: Payload::Known(datum),
            marks: MarkSet::new(),
        }
    }

    pub fn ty(&self) -> &Type {
        &self.ty
    }

    pub fn is_known(&self) -> bool {
        matches!(self.payload, Payload::Known(_))
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self.payload, Payload::Unknown)
    }

    pub fn is_null(&self) -> bool {
        matches!(self.payload, Payload::Null)
    }

    pub(crate) fn datum(&self) -> Option<&Datum> {
        match &self.payload {
            Payload::Known(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&str> {
        match self.datum() {
            Some(Datum::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<&Number> {
        match self.datum() {
            Some(Datum::Number(n)) => Some(n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.datum() {
            Some(Datum::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    /// The elements of a known list, set, or tuple.
    pub fn as_seq(&self) -> Option<&[Value]> {
        match self.datum() {
            Some(Datum::Seq(vs)) => Some(vs),
            _ => None,
        }
    }

    /// The entries of a known map or object.
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self.datum() {
            Some(Datum::Map(m)) => Some(m),
            _ => None,
        }
    }

    pub fn marks(&self) -> &MarkSet {
        &self.marks
    }

    pub fn has_mark(&self, mark: &str) -> bool {
        self.marks.contains(mark)
    }

    pub fn with_mark(mut self, mark: impl Into<String>) -> Value {
        self.marks.insert(mark.into());
        self
    }

    pub fn with_marks(mut self, marks: &MarkSet) -> Value {
        self.marks.extend(marks.iter().cloned());
        self
    }

    /// Strips the marks off, returning the bare value and the mark set.
    pub fn unmark(mut self) -> (Value, MarkSet) {
        let marks = std::mem::take(&mut self.marks);
        (self, marks)
    }

    /// Element count of a known collection.
    pub fn len(&self) -> Option<usize> {
        match self.datum() {
            Some(Datum::Seq(vs)) => Some(vs.len()),
            Some(Datum::Map(m)) => Some(m.len()),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> Option<bool> {
        self.len().map(|n| n == 0)
    }
}

impl Serialize for Value {
    /// External surface: unknown and null both serialize as JSON null;
    /// marks are not part of the wire shape.
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match &self.payload {
            Payload::Unknown | Payload::Null => serializer.serialize_unit(),
            Payload::Known(Datum::String(s)) => serializer.serialize_str(s),
            Payload::Known(Datum::Number(n)) => n.serialize(serializer),
            Payload::Known(Datum::Bool(b)) => serializer.serialize_bool(*b),
            Payload::Known(Datum::Seq(vs)) => {
                let mut seq = serializer.serialize_seq(Some(vs.len()))?;
                for v in vs {
                    seq.serialize_element(v)?;
                }
                seq.end()
            }
            Payload::Known(Datum::Map(m)) => {
                let mut map = serializer.serialize_map(Some(m.len()))?;
                for (k, v) in m {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
        }
    }
}
