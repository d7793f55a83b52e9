//! Native representation of wire values.

use crate::error::{BusError, BusResult};
use crate::path::ObjectPath;
use crate::signature::{self, Signature};

/// A single wire value of any type.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Byte(u8),
    Int16(i16),
    Uint16(u16),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    Double(f64),
    Str(String),
    ObjectPath(ObjectPath),
    Signature(Signature),
    Array(Array),
    Dict(Dict),
    Struct(Vec<Value>),
    /// A self-describing boxed value.
    Variant(Box<Value>),
}

/// Homogeneous sequence; keeps its element signature so empty arrays are typed.
#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    element: Signature,
    items: Vec<Value>,
}

impl Array {
    /// Build an array, checking every item against `element`.
    pub fn new(element: Signature, items: Vec<Value>) -> BusResult<Self> {
        Signature::array_of(&element)?;
        for item in &items {
            let actual = item.signature();
            if actual != element {
                return Err(BusError::TypeMismatch(format!(
                    "array of '{element}' cannot hold a '{actual}'"
                )));
            }
        }
        Ok(Self { element, items })
    }

    /// Items already known to carry `element`'s signature.
    pub(crate) fn from_parts(element: Signature, items: Vec<Value>) -> Self {
        Self { element, items }
    }

    pub fn element(&self) -> &Signature {
        &self.element
    }

    pub fn items(&self) -> &[Value] {
        &self.items
    }

    pub fn into_items(self) -> Vec<Value> {
        self.items
    }
}

/// Keyed map with a basic key type; entry order is preserved.
#[derive(Debug, Clone, PartialEq)]
pub struct Dict {
    key: Signature,
    value: Signature,
    entries: Vec<(Value, Value)>,
}

impl Dict {
    /// Build a dict, checking every key and value signature.
    pub fn new(key: Signature, value: Signature, entries: Vec<(Value, Value)>) -> BusResult<Self> {
        Signature::dict_of(&key, &value)?;
        for (k, v) in &entries {
            if k.signature() != key || v.signature() != value {
                return Err(BusError::TypeMismatch(format!(
                    "dict of '{key}'->'{value}' cannot hold '{}'->'{}'",
                    k.signature(),
                    v.signature()
                )));
            }
        }
        Ok(Self {
            key,
            value,
            entries,
        })
    }

    /// Entries already known to carry the key/value signatures.
    pub(crate) fn from_parts(key: Signature, value: Signature, entries: Vec<(Value, Value)>) -> Self {
        Self {
            key,
            value,
            entries,
        }
    }

    pub fn key_signature(&self) -> &Signature {
        &self.key
    }

    pub fn value_signature(&self) -> &Signature {
        &self.value
    }

    pub fn entries(&self) -> &[(Value, Value)] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<(Value, Value)> {
        self.entries
    }

    /// Look up a value by string key.
    pub fn get_str(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v)
    }
}

/// Explicitly boxed value: always has signature `v`, whatever it holds.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant(Value);

impl Variant {
    pub fn new(value: impl Into<Value>) -> Self {
        Self(value.into().unboxed())
    }

    /// Signature of the boxed payload.
    pub fn signature(&self) -> Signature {
        self.0.signature()
    }

    /// The boxed payload.
    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

impl From<Variant> for Value {
    fn from(v: Variant) -> Self {
        Value::Variant(Box::new(v.0))
    }
}

impl Value {
    /// Derive the signature of this value.
    ///
    /// Variants are matched first: a boxed value is always `v` regardless
    /// of what it holds.
    pub fn signature(&self) -> Signature {
        match self {
            Value::Variant(_) => Signature::variant(),
            Value::Bool(_) => Signature::from_code(signature::BOOLEAN),
            Value::Byte(_) => Signature::from_code(signature::BYTE),
            Value::Int16(_) => Signature::from_code(signature::INT16),
            Value::Uint16(_) => Signature::from_code(signature::UINT16),
            Value::Int32(_) => Signature::from_code(signature::INT32),
            Value::Uint32(_) => Signature::from_code(signature::UINT32),
            Value::Int64(_) => Signature::from_code(signature::INT64),
            Value::Uint64(_) => Signature::from_code(signature::UINT64),
            Value::Double(_) => Signature::from_code(signature::DOUBLE),
            Value::Str(_) => Signature::from_code(signature::STRING),
            Value::ObjectPath(_) => Signature::from_code(signature::OBJECT_PATH),
            Value::Signature(_) => Signature::from_code(signature::SIGNATURE),
            Value::Array(a) => Signature::wrapped("a", &a.element, ""),
            Value::Dict(d) => {
                // Key/value pair was validated when the dict was built.
                Signature::dict_of(&d.key, &d.value).unwrap_or_default()
            }
            Value::Struct(fields) => {
                let sigs: Vec<Signature> = fields.iter().map(Value::signature).collect();
                Signature::struct_of(&sigs).unwrap_or_default()
            }
        }
    }

    /// Strip any number of variant boxes.
    pub fn unboxed(self) -> Value {
        match self {
            Value::Variant(inner) => inner.unboxed(),
            other => other,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            Value::ObjectPath(p) => Some(p.as_str()),
            Value::Signature(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Reshape this value to fit `target`, boxing into variants where the
    /// target asks for `v`. Fails with `TypeMismatch` when no such shape exists.
    pub fn coerce(self, target: &Signature) -> BusResult<Value> {
        let actual = self.signature();
        if &actual == target {
            return Ok(self);
        }
        if target.is_variant() {
            return Ok(Value::Variant(Box::new(self)));
        }
        match self {
            Value::Array(array) => {
                let element = target.array_element().ok_or_else(|| mismatch(&actual, target))?;
                let items = array
                    .items
                    .into_iter()
                    .map(|item| item.coerce(&element))
                    .collect::<BusResult<Vec<_>>>()?;
                Ok(Value::Array(Array::new(element, items)?))
            }
            Value::Dict(dict) => {
                let (key, value) = target.dict_entry().ok_or_else(|| mismatch(&actual, target))?;
                let entries = dict
                    .entries
                    .into_iter()
                    .map(|(k, v)| -> BusResult<(Value, Value)> {
                        Ok((k.coerce(&key)?, v.coerce(&value)?))
                    })
                    .collect::<BusResult<Vec<_>>>()?;
                Ok(Value::Dict(Dict::new(key, value, entries)?))
            }
            Value::Struct(fields) => {
                let targets = target.struct_fields().ok_or_else(|| mismatch(&actual, target))?;
                if targets.len() != fields.len() {
                    return Err(mismatch(&actual, target));
                }
                let fields = fields
                    .into_iter()
                    .zip(targets.iter())
                    .map(|(f, t)| f.coerce(t))
                    .collect::<BusResult<Vec<_>>>()?;
                Ok(Value::Struct(fields))
            }
            _ => Err(mismatch(&actual, target)),
        }
    }
}

fn mismatch(actual: &Signature, target: &Signature) -> BusError {
    BusError::TypeMismatch(format!("cannot encode '{actual}' as '{target}'"))
}

/// Signature of a list of values, in order.
pub fn signature_of(values: &[Value]) -> Signature {
    let sigs: Vec<Signature> = values.iter().map(Value::signature).collect();
    Signature::joined(&sigs)
}

/// Reshape an argument list to a declared signature.
///
/// The number of values must equal the number of complete types in
/// `target`; each value is coerced to its slot.
pub fn coerce_values(values: Vec<Value>, target: &Signature) -> BusResult<Vec<Value>> {
    let slots = target.split();
    if slots.len() != values.len() {
        return Err(BusError::SignatureMismatch {
            expected: target.to_string(),
            actual: signature_of(&values).to_string(),
        });
    }
    values
        .into_iter()
        .zip(slots.iter())
        .map(|(value, slot)| value.coerce(slot))
        .collect()
}
