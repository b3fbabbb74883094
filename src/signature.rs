//! The D-Bus signature grammar: §4.A of the type system.
//!
//! A signature is a non-empty string over the type-code alphabet
//! `y b n q i u x t d s o g v h a ( ) { }`. Container grammar:
//!
//! * `a<T>` is an array of `T`.
//! * `(<T1><T2>...)` is a struct.
//! * `a{<K><V>}` is a mapping from a basic `K` to any `V`, valid only
//!   immediately after `a`.

use std::fmt;

use crate::error::{Error, ErrorKind, Result};

/// Maximum container nesting depth the protocol allows.
pub const MAX_DEPTH: usize = 32;

/// A validated D-Bus signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Signature(String);

impl Signature {
    pub const BYTE: &'static str = "y";
    pub const BOOLEAN: &'static str = "b";
    pub const INT16: &'static str = "n";
    pub const UINT16: &'static str = "q";
    pub const INT32: &'static str = "i";
    pub const UINT32: &'static str = "u";
    pub const INT64: &'static str = "x";
    pub const UINT64: &'static str = "t";
    pub const DOUBLE: &'static str = "d";
    pub const STRING: &'static str = "s";
    pub const OBJECT_PATH: &'static str = "o";
    pub const SIGNATURE: &'static str = "g";
    pub const VARIANT: &'static str = "v";

    /// An empty signature (a message with no body arguments).
    pub fn empty() -> Self {
        Self(String::new())
    }

    /// Validate and wrap a signature string.
    pub fn new(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        validate(s.as_bytes())?;
        Ok(Self(s))
    }

    /// Wrap a signature that is already known to be valid, such as a
    /// slice carved out of a larger already-validated signature.
    pub(crate) fn from_validated(bytes: &[u8]) -> Self {
        debug_assert!(validate(bytes).is_ok());
        Self(String::from_utf8(bytes.to_vec()).expect("signature bytes are ASCII"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Append another signature's type codes to this one.
    pub fn push_signature(&mut self, other: &Signature) {
        self.0.push_str(other.as_str());
    }

    /// Advance past exactly one complete type starting at `offset`,
    /// returning the offset just past it.
    pub fn next_type(&self, offset: usize) -> Result<usize> {
        let mut pos = offset;
        advance_one_type(self.as_bytes(), &mut pos, 0)?;
        Ok(pos)
    }

    /// `true` iff repeated [`Signature::next_type`] from `0` reaches the
    /// end of the string exactly.
    pub fn validate(&self) -> Result<()> {
        validate(self.as_bytes())
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq<str> for Signature {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for Signature {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

impl TryFrom<&str> for Signature {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Signature::new(value)
    }
}

impl TryFrom<String> for Signature {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Signature::new(value)
    }
}

/// A single D-Bus type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    Byte,
    Boolean,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Double,
    String,
    ObjectPath,
    Signature,
    Variant,
    Array,
    StructOpen,
    StructClose,
    DictOpen,
    DictClose,
}

impl Type {
    pub fn from_code(code: u8) -> Option<Type> {
        Some(match code {
            b'y' => Type::Byte,
            b'b' => Type::Boolean,
            b'n' => Type::Int16,
            b'q' => Type::Uint16,
            b'i' => Type::Int32,
            b'u' => Type::Uint32,
            b'x' => Type::Int64,
            b't' => Type::Uint64,
            b'd' => Type::Double,
            b's' => Type::String,
            b'o' => Type::ObjectPath,
            b'g' => Type::Signature,
            b'v' => Type::Variant,
            b'a' => Type::Array,
            b'(' => Type::StructOpen,
            b')' => Type::StructClose,
            b'{' => Type::DictOpen,
            b'}' => Type::DictClose,
            _ => return None,
        })
    }

    /// The natural alignment of a basic (non-container) type code, per
    /// spec §4.B. Containers (array, struct, dict-entry, variant) are
    /// handled by their callers since they don't have a single constant
    /// alignment independent of context.
    pub fn basic_alignment(self) -> Option<usize> {
        Some(match self {
            Type::Byte => 1,
            Type::Signature => 1,
            Type::Boolean => 4,
            Type::Int16 | Type::Uint16 => 2,
            Type::Int32 | Type::Uint32 => 4,
            Type::Int64 | Type::Uint64 | Type::Double => 8,
            Type::String | Type::ObjectPath => 4,
            Type::Variant => 1,
            _ => return None,
        })
    }
}

/// Advance past exactly one complete type starting at `*pos`, erroring on
/// truncated containers, unknown codes, or a dict-entry that doesn't
/// appear directly inside an array.
fn advance_one_type(sig: &[u8], pos: &mut usize, depth: usize) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(Error::new(ErrorKind::SignatureTooDeep));
    }

    let Some(&code) = sig.get(*pos) else {
        return Err(Error::new(ErrorKind::SignatureOverrun));
    };

    let Some(ty) = Type::from_code(code) else {
        return Err(Error::new(ErrorKind::UnknownTypeCode(code)));
    };

    match ty {
        Type::Byte
        | Type::Boolean
        | Type::Int16
        | Type::Uint16
        | Type::Int32
        | Type::Uint32
        | Type::Int64
        | Type::Uint64
        | Type::Double
        | Type::String
        | Type::ObjectPath
        | Type::Signature
        | Type::Variant => {
            *pos += 1;
        }
        Type::Array => {
            *pos += 1;
            if sig.get(*pos) == Some(&b'{') {
                *pos += 1;
                // Key must be a basic type code.
                let Some(&key_code) = sig.get(*pos) else {
                    return Err(Error::new(ErrorKind::SignatureOverrun));
                };
                match Type::from_code(key_code) {
                    Some(k) if k.basic_alignment().is_some() && k != Type::Variant => {}
                    _ => return Err(Error::new(ErrorKind::InvalidSignature("dict key must be a basic type"))),
                }
                advance_one_type(sig, pos, depth + 1)?;
                advance_one_type(sig, pos, depth + 1)?;
                if sig.get(*pos) != Some(&b'}') {
                    return Err(Error::new(ErrorKind::InvalidSignature(
                        "dict entry not terminated by '}'",
                    )));
                }
                *pos += 1;
            } else {
                advance_one_type(sig, pos, depth + 1)?;
            }
        }
        Type::StructOpen => {
            *pos += 1;
            if sig.get(*pos) == Some(&b')') {
                return Err(Error::new(ErrorKind::InvalidSignature("empty struct")));
            }
            while sig.get(*pos) != Some(&b')') {
                if *pos >= sig.len() {
                    return Err(Error::new(ErrorKind::SignatureOverrun));
                }
                advance_one_type(sig, pos, depth + 1)?;
            }
            *pos += 1;
        }
        Type::StructClose => {
            return Err(Error::new(ErrorKind::InvalidSignature("unexpected ')'")));
        }
        Type::DictClose => {
            return Err(Error::new(ErrorKind::InvalidSignature(
                "'}' outside of a dict entry",
            )));
        }
        Type::DictOpen => {
            return Err(Error::new(ErrorKind::InvalidSignature(
                "dict entry outside of an array",
            )));
        }
    }

    Ok(())
}

/// A signature validates iff repeated application of "consume next
/// complete type" exhausts it exactly.
pub fn validate(sig: &[u8]) -> Result<()> {
    let mut pos = 0;
    while pos < sig.len() {
        advance_one_type(sig, &mut pos, 0)?;
    }
    Ok(())
}

pub(crate) fn advance_type(sig: &[u8], pos: &mut usize) -> Result<()> {
    advance_one_type(sig, pos, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_basic_types() {
        for s in ["y", "b", "n", "q", "i", "u", "x", "t", "d", "s", "o", "g", "v"] {
            Signature::new(s).unwrap();
        }
    }

    #[test]
    fn validates_containers() {
        Signature::new("a{si}").unwrap();
        Signature::new("(yyy)").unwrap();
        Signature::new("aa{sv}").unwrap();
        Signature::new("a(ii)").unwrap();
        Signature::new("ynbix").unwrap();
    }

    #[test]
    fn next_type_walks_to_the_end() {
        let sig = Signature::new("ynbix").unwrap();
        let mut offset = 0;
        let mut count = 0;
        while offset < sig.len() {
            offset = sig.next_type(offset).unwrap();
            count += 1;
        }
        assert_eq!(offset, sig.len());
        assert_eq!(count, 5);
    }

    #[test]
    fn rejects_dict_entry_outside_array() {
        assert!(Signature::new("{si}").is_err());
    }

    #[test]
    fn rejects_unterminated_dict_entry() {
        assert!(Signature::new("a{si").is_err());
    }

    #[test]
    fn rejects_unknown_code() {
        assert!(Signature::new("z").is_err());
    }

    #[test]
    fn rejects_truncated_struct() {
        assert!(Signature::new("(ii").is_err());
    }

    #[test]
    fn rejects_truncated_array() {
        assert!(Signature::new("a").is_err());
    }
}
