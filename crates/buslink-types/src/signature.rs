//! Wire signatures: validation, splitting and composition.
//!
//! A signature is a string of type codes. Every exported value maps to exactly
//! one signature; the codes and container rules here are the single source
//! both peers derive from, so two independently compiled programs agree on
//! the signature of a declared type without negotiation.

use crate::error::{BusError, BusResult};
use std::fmt;

/// Boolean (`b`).
pub const BOOLEAN: u8 = b'b';
/// Unsigned byte (`y`).
pub const BYTE: u8 = b'y';
/// Signed 16-bit integer (`n`).
pub const INT16: u8 = b'n';
/// Unsigned 16-bit integer (`q`).
pub const UINT16: u8 = b'q';
/// Signed 32-bit integer (`i`).
pub const INT32: u8 = b'i';
/// Unsigned 32-bit integer (`u`).
pub const UINT32: u8 = b'u';
/// Signed 64-bit integer (`x`).
pub const INT64: u8 = b'x';
/// Unsigned 64-bit integer (`t`).
pub const UINT64: u8 = b't';
/// IEEE 754 double (`d`).
pub const DOUBLE: u8 = b'd';
/// UTF-8 string (`s`).
pub const STRING: u8 = b's';
/// Object path (`o`).
pub const OBJECT_PATH: u8 = b'o';
/// Signature (`g`).
pub const SIGNATURE: u8 = b'g';
/// Variant (`v`).
pub const VARIANT: u8 = b'v';
/// Array prefix (`a`).
pub const ARRAY: u8 = b'a';
/// Struct delimiters.
pub const STRUCT_OPEN: u8 = b'(';
pub const STRUCT_CLOSE: u8 = b')';
/// Dict entry delimiters.
pub const DICT_OPEN: u8 = b'{';
pub const DICT_CLOSE: u8 = b'}';

/// Maximum length of a signature string.
pub const MAX_SIGNATURE_LEN: usize = 255;

/// Maximum nesting of arrays or of structs.
const MAX_DEPTH: usize = 32;

fn is_basic_code(code: u8) -> bool {
    matches!(
        code,
        BOOLEAN
            | BYTE
            | INT16
            | UINT16
            | INT32
            | UINT32
            | INT64
            | UINT64
            | DOUBLE
            | STRING
            | OBJECT_PATH
            | SIGNATURE
    )
}

/// A validated wire signature (possibly empty, possibly several complete types).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Signature(String);

impl Signature {
    /// Parse and validate a signature string.
    pub fn new(sig: impl Into<String>) -> BusResult<Self> {
        let sig = sig.into();
        if sig.len() > MAX_SIGNATURE_LEN {
            return Err(BusError::TypeMismatch(format!(
                "signature longer than {MAX_SIGNATURE_LEN} bytes"
            )));
        }
        let bytes = sig.as_bytes();
        let mut pos = 0;
        while pos < bytes.len() {
            pos = complete_type_end(bytes, pos, 0, 0)?;
        }
        Ok(Self(sig))
    }

    /// The empty signature (no arguments).
    pub fn empty() -> Self {
        Self(String::new())
    }

    /// Signature made of one type code that needs no validation.
    pub(crate) fn from_code(code: u8) -> Self {
        Self((code as char).to_string())
    }

    /// Variant signature (`v`).
    pub fn variant() -> Self {
        Self::from_code(VARIANT)
    }

    /// `a` + element signature. The element must be a single complete type.
    pub fn array_of(element: &Signature) -> BusResult<Self> {
        element.expect_single()?;
        Ok(Self(format!("a{}", element.0)))
    }

    /// `a{KV}`. The key must be a basic (non-container) type.
    pub fn dict_of(key: &Signature, value: &Signature) -> BusResult<Self> {
        key.expect_single()?;
        value.expect_single()?;
        if !key.is_basic() {
            return Err(BusError::TypeMismatch(format!(
                "dict key must be a basic type, got '{}'",
                key.0
            )));
        }
        Ok(Self(format!("a{{{}{}}}", key.0, value.0)))
    }

    /// `(` + fields + `)`. A struct needs at least one field.
    pub fn struct_of(fields: &[Signature]) -> BusResult<Self> {
        if fields.is_empty() {
            return Err(BusError::TypeMismatch("empty struct".to_string()));
        }
        let inner: String = fields.iter().map(|f| f.as_str()).collect();
        Self::new(format!("({inner})"))
    }

    /// Concatenate signatures in order (argument lists). Fails when the
    /// result is longer than [`MAX_SIGNATURE_LEN`].
    pub fn concat<'a>(parts: impl IntoIterator<Item = &'a Signature>) -> BusResult<Self> {
        let joined = Self::joined(parts);
        joined.check_len()?;
        Ok(joined)
    }

    /// Concatenation of already valid parts, length unchecked. Type-level
    /// signatures are built this way and checked with [`Signature::check_len`]
    /// where they are declared.
    pub(crate) fn joined<'a>(parts: impl IntoIterator<Item = &'a Signature>) -> Self {
        Self(parts.into_iter().map(|p| p.as_str()).collect())
    }

    /// Wrap valid parts in a container prefix/suffix, length unchecked.
    pub(crate) fn wrapped(open: &str, inner: &Signature, close: &str) -> Self {
        Self(format!("{open}{}{close}", inner.0))
    }

    /// Fail when longer than [`MAX_SIGNATURE_LEN`].
    pub fn check_len(&self) -> BusResult<()> {
        if self.0.len() > MAX_SIGNATURE_LEN {
            return Err(BusError::TypeMismatch(format!(
                "signature '{}' is longer than {MAX_SIGNATURE_LEN} bytes",
                self.0
            )));
        }
        Ok(())
    }

    /// The raw signature string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when there are no types at all.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True for a single basic type code.
    pub fn is_basic(&self) -> bool {
        self.0.len() == 1 && is_basic_code(self.0.as_bytes()[0])
    }

    /// True for exactly `v`.
    pub fn is_variant(&self) -> bool {
        self.0.as_bytes() == [VARIANT]
    }

    /// Split into the complete types it contains, in order.
    pub fn split(&self) -> Vec<Signature> {
        let bytes = self.0.as_bytes();
        let mut parts = Vec::new();
        let mut start = 0;
        while start < bytes.len() {
            // Validated on construction, so the walk cannot fail.
            let end = complete_type_end(bytes, start, 0, 0).unwrap_or(bytes.len());
            parts.push(Self(self.0[start..end].to_string()));
            start = end;
        }
        parts
    }

    /// Element signature when this is an array (`aT` → `T`).
    pub fn array_element(&self) -> Option<Signature> {
        if self.is_dict() || !self.0.starts_with('a') {
            return None;
        }
        Some(Self(self.0[1..].to_string()))
    }

    /// True when this is a dict signature (`a{..}`).
    pub fn is_dict(&self) -> bool {
        self.0.starts_with("a{")
    }

    /// Key and value signatures when this is a dict (`a{KV}`).
    pub fn dict_entry(&self) -> Option<(Signature, Signature)> {
        if !self.is_dict() {
            return None;
        }
        let inner = Self(self.0[2..self.0.len() - 1].to_string());
        let mut parts = inner.split().into_iter();
        match (parts.next(), parts.next()) {
            (Some(k), Some(v)) => Some((k, v)),
            _ => None,
        }
    }

    /// Field signatures when this is a struct (`(..)`).
    pub fn struct_fields(&self) -> Option<Vec<Signature>> {
        if !self.0.starts_with('(') {
            return None;
        }
        Some(Self(self.0[1..self.0.len() - 1].to_string()).split())
    }

    /// True when `actual` fills this signature slot by slot; a `v` slot
    /// takes any single complete type.
    pub fn accepts(&self, actual: &Signature) -> bool {
        if self == actual {
            return true;
        }
        let want = self.split();
        let got = actual.split();
        want.len() == got.len()
            && want
                .iter()
                .zip(got.iter())
                .all(|(w, g)| w.is_variant() || w == g)
    }

    fn expect_single(&self) -> BusResult<()> {
        if self.split().len() != 1 {
            return Err(BusError::TypeMismatch(format!(
                "'{}' is not a single complete type",
                self.0
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for Signature {
    type Error = BusError;

    fn try_from(value: &str) -> BusResult<Self> {
        Self::new(value)
    }
}

impl AsRef<str> for Signature {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Walk one complete type starting at `pos`; return the index just past it.
fn complete_type_end(
    bytes: &[u8],
    pos: usize,
    array_depth: usize,
    struct_depth: usize,
) -> BusResult<usize> {
    let code = *bytes
        .get(pos)
        .ok_or_else(|| BusError::TypeMismatch("truncated signature".to_string()))?;
    if is_basic_code(code) || code == VARIANT {
        return Ok(pos + 1);
    }
    match code {
        ARRAY => {
            if array_depth >= MAX_DEPTH {
                return Err(BusError::TypeMismatch("arrays nested too deep".into()));
            }
            if bytes.get(pos + 1) == Some(&DICT_OPEN) {
                let key = *bytes
                    .get(pos + 2)
                    .ok_or_else(|| BusError::TypeMismatch("truncated dict entry".into()))?;
                if !is_basic_code(key) {
                    return Err(BusError::TypeMismatch(format!(
                        "dict key must be a basic type, got '{}'",
                        key as char
                    )));
                }
                let end = complete_type_end(bytes, pos + 3, array_depth + 1, struct_depth)?;
                if bytes.get(end) != Some(&DICT_CLOSE) {
                    return Err(BusError::TypeMismatch(
                        "dict entry must hold exactly one key and one value".into(),
                    ));
                }
                return Ok(end + 1);
            }
            complete_type_end(bytes, pos + 1, array_depth + 1, struct_depth)
        }
        STRUCT_OPEN => {
            if struct_depth >= MAX_DEPTH {
                return Err(BusError::TypeMismatch("structs nested too deep".into()));
            }
            let mut cur = pos + 1;
            if bytes.get(cur) == Some(&STRUCT_CLOSE) {
                return Err(BusError::TypeMismatch("empty struct".into()));
            }
            while bytes.get(cur) != Some(&STRUCT_CLOSE) {
                if cur >= bytes.len() {
                    return Err(BusError::TypeMismatch("unterminated struct".into()));
                }
                cur = complete_type_end(bytes, cur, array_depth, struct_depth + 1)?;
            }
            Ok(cur + 1)
        }
        DICT_OPEN => Err(BusError::TypeMismatch(
            "dict entry outside of an array".into(),
        )),
        other => Err(BusError::TypeMismatch(format!(
            "unknown type code '{}'",
            other as char
        ))),
    }
}

/// Signature requirement attached to a listener or a call reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureSpec {
    /// Accept any payload shape; values are decoded at run time.
    Any,
    /// Payload must carry exactly this signature.
    Exact(Signature),
}

impl SignatureSpec {
    /// Check a payload signature against this requirement.
    pub fn check(&self, actual: &Signature) -> BusResult<()> {
        match self {
            SignatureSpec::Any => Ok(()),
            SignatureSpec::Exact(expected) if expected == actual => Ok(()),
            SignatureSpec::Exact(expected) => Err(BusError::SignatureMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            }),
        }
    }
}

impl fmt::Display for SignatureSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignatureSpec::Any => f.write_str("ANY"),
            SignatureSpec::Exact(sig) => f.write_str(sig.as_str()),
        }
    }
}

impl From<Signature> for SignatureSpec {
    fn from(sig: Signature) -> Self {
        SignatureSpec::Exact(sig)
    }
}
