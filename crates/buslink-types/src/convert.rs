//! Static signature derivation and native ⇄ wire conversion.
//!
//! [`BusType`] gives every supported Rust type exactly one signature. The
//! mapping is fixed per type, never per value: `i32` is always `i`, `Vec<T>` is
//! always `a` + `T`, a map is always `a{KV}`. Tuples used as a whole value are
//! structs; tuples used as argument lists go through [`Args`] and concatenate.

use crate::error::{BusError, BusResult};
use crate::path::ObjectPath;
use crate::signature::{self, Signature};
use crate::value::{Array, Dict, Value, Variant};
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// A Rust type with a fixed wire signature.
pub trait BusType: Sized {
    /// The signature every value of this type carries.
    fn signature() -> Signature;

    /// Convert into a wire value of exactly [`BusType::signature`].
    fn into_value(self) -> Value;

    /// Convert from a wire value; `TypeMismatch` when the shape differs.
    fn from_value(value: Value) -> BusResult<Self>;
}

/// Marker for types allowed as dict keys (non-container codes).
pub trait BasicType: BusType {}

fn unexpected<T: BusType>(value: &Value) -> BusError {
    BusError::TypeMismatch(format!(
        "expected '{}', got '{}'",
        T::signature(),
        value.signature()
    ))
}

macro_rules! basic_type {
    ($ty:ty, $variant:ident, $code:expr) => {
        impl BusType for $ty {
            fn signature() -> Signature {
                Signature::from_code($code)
            }

            fn into_value(self) -> Value {
                Value::$variant(self)
            }

            fn from_value(value: Value) -> BusResult<Self> {
                match value {
                    Value::$variant(v) => Ok(v),
                    other => Err(unexpected::<Self>(&other)),
                }
            }
        }

        impl BasicType for $ty {}
    };
}

basic_type!(bool, Bool, signature::BOOLEAN);
basic_type!(u8, Byte, signature::BYTE);
basic_type!(i16, Int16, signature::INT16);
basic_type!(u16, Uint16, signature::UINT16);
basic_type!(i32, Int32, signature::INT32);
basic_type!(u32, Uint32, signature::UINT32);
basic_type!(i64, Int64, signature::INT64);
basic_type!(u64, Uint64, signature::UINT64);
basic_type!(f64, Double, signature::DOUBLE);
basic_type!(String, Str, signature::STRING);
basic_type!(ObjectPath, ObjectPath, signature::OBJECT_PATH);
basic_type!(Signature, Signature, signature::SIGNATURE);

impl<T: BusType> BusType for Vec<T> {
    fn signature() -> Signature {
        Signature::wrapped("a", &T::signature(), "")
    }

    fn into_value(self) -> Value {
        let items = self.into_iter().map(T::into_value).collect();
        Value::Array(Array::from_parts(T::signature(), items))
    }

    fn from_value(value: Value) -> BusResult<Self> {
        match value {
            Value::Array(array) if array.element() == &T::signature() => {
                array.into_items().into_iter().map(T::from_value).collect()
            }
            other => Err(unexpected::<Self>(&other)),
        }
    }
}

fn dict_into_value<K: BasicType, V: BusType>(entries: impl Iterator<Item = (K, V)>) -> Value {
    let entries = entries
        .map(|(k, v)| (k.into_value(), v.into_value()))
        .collect();
    Value::Dict(Dict::from_parts(K::signature(), V::signature(), entries))
}

fn dict_signature<K: BasicType, V: BusType>() -> Signature {
    Signature::wrapped("a{", &Signature::joined([&K::signature(), &V::signature()]), "}")
}

fn dict_entries<K: BasicType, V: BusType>(value: Value) -> BusResult<Vec<(K, V)>> {
    match value {
        Value::Dict(dict)
            if dict.key_signature() == &K::signature()
                && dict.value_signature() == &V::signature() =>
        {
            dict.into_entries()
                .into_iter()
                .map(|(k, v)| -> BusResult<(K, V)> { Ok((K::from_value(k)?, V::from_value(v)?)) })
                .collect()
        }
        other => Err(BusError::TypeMismatch(format!(
            "expected '{}', got '{}'",
            dict_signature::<K, V>(),
            other.signature()
        ))),
    }
}

impl<K: BasicType + Eq + Hash, V: BusType> BusType for HashMap<K, V> {
    fn signature() -> Signature {
        dict_signature::<K, V>()
    }

    fn into_value(self) -> Value {
        dict_into_value(self.into_iter())
    }

    fn from_value(value: Value) -> BusResult<Self> {
        Ok(dict_entries::<K, V>(value)?.into_iter().collect())
    }
}

impl<K: BasicType + Ord, V: BusType> BusType for BTreeMap<K, V> {
    fn signature() -> Signature {
        dict_signature::<K, V>()
    }

    fn into_value(self) -> Value {
        dict_into_value(self.into_iter())
    }

    fn from_value(value: Value) -> BusResult<Self> {
        Ok(dict_entries::<K, V>(value)?.into_iter().collect())
    }
}

impl BusType for Variant {
    fn signature() -> Signature {
        Signature::variant()
    }

    fn into_value(self) -> Value {
        self.into()
    }

    fn from_value(value: Value) -> BusResult<Self> {
        match value {
            Value::Variant(inner) => Ok(Variant::new(*inner)),
            other => Err(unexpected::<Self>(&other)),
        }
    }
}

/// An untyped value travels as a variant: absent type information defaults
/// to `v`.
impl BusType for Value {
    fn signature() -> Signature {
        Signature::variant()
    }

    fn into_value(self) -> Value {
        match self {
            boxed @ Value::Variant(_) => boxed,
            other => Value::Variant(Box::new(other)),
        }
    }

    fn from_value(value: Value) -> BusResult<Self> {
        Ok(value.unboxed())
    }
}

fn next_arg<T: BusType>(iter: &mut impl Iterator<Item = Value>) -> BusResult<T> {
    let value = iter
        .next()
        .ok_or_else(|| BusError::TypeMismatch(format!("missing '{}' argument", T::signature())))?;
    T::from_value(value)
}

macro_rules! tuple_types {
    ($($name:ident),+) => {
        impl<$($name: BusType),+> BusType for ($($name,)+) {
            fn signature() -> Signature {
                Signature::wrapped("(", &<Self as Args>::signature(), ")")
            }

            fn into_value(self) -> Value {
                Value::Struct(<Self as Args>::into_values(self))
            }

            fn from_value(value: Value) -> BusResult<Self> {
                match value {
                    Value::Struct(fields) => <Self as Args>::from_values(fields),
                    other => Err(unexpected::<Self>(&other)),
                }
            }
        }

        impl<$($name: BusType),+> Args for ($($name,)+) {
            fn signature() -> Signature {
                Signature::joined([$(&$name::signature()),+])
            }

            #[allow(non_snake_case)]
            fn into_values(self) -> Vec<Value> {
                let ($($name,)+) = self;
                vec![$($name.into_value()),+]
            }

            #[allow(non_snake_case)]
            fn from_values(values: Vec<Value>) -> BusResult<Self> {
                let expected = <Self as Args>::signature();
                let count = expected.split().len();
                if values.len() != count {
                    return Err(BusError::SignatureMismatch {
                        expected: expected.to_string(),
                        actual: crate::value::signature_of(&values).to_string(),
                    });
                }
                let mut iter = values.into_iter();
                $(
                    let $name = next_arg::<$name>(&mut iter)?;
                )+
                Ok(($($name,)+))
            }
        }
    };
}

/// An ordered argument list (method args/returns, signal payloads).
///
/// The signature is the concatenation of each element's own signature in
/// declaration order, with no struct wrapping.
pub trait Args: Sized {
    fn signature() -> Signature;
    fn into_values(self) -> Vec<Value>;
    fn from_values(values: Vec<Value>) -> BusResult<Self>;
}

impl Args for () {
    fn signature() -> Signature {
        Signature::empty()
    }

    fn into_values(self) -> Vec<Value> {
        Vec::new()
    }

    fn from_values(values: Vec<Value>) -> BusResult<Self> {
        if values.is_empty() {
            Ok(())
        } else {
            Err(BusError::SignatureMismatch {
                expected: String::new(),
                actual: crate::value::signature_of(&values).to_string(),
            })
        }
    }
}

tuple_types!(A);
tuple_types!(A, B);
tuple_types!(A, B, C);
tuple_types!(A, B, C, D);
tuple_types!(A, B, C, D, E);
tuple_types!(A, B, C, D, E, F);
tuple_types!(A, B, C, D, E, F, G);
tuple_types!(A, B, C, D, E, F, G, H);

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

macro_rules! value_from {
    ($($ty:ty),+) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    v.into_value()
                }
            }
        )+
    };
}

value_from!(bool, u8, i16, u16, i32, u32, i64, u64, f64, String, ObjectPath, Signature);
