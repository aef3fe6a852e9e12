//! The tagged D-Bus type model.

use std::fmt;

use crate::signature::{Signature, SignatureError, MAX_SIGNATURE};

/// A single complete D-Bus type.
///
/// # Examples
///
/// ```
/// use pipebus::{DType, Signature};
///
/// let types = DType::parse(&Signature::new("a{sv}")?)?;
/// assert_eq!(types.len(), 1);
/// assert_eq!(types[0].signature().as_str(), "a{sv}");
/// # Ok::<_, pipebus::SignatureError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DType {
    /// 8-bit unsigned integer, `y`.
    Byte,
    /// Boolean value, `b`.
    Boolean,
    /// 16-bit signed integer, `n`.
    Int16,
    /// 16-bit unsigned integer, `q`.
    Uint16,
    /// 32-bit signed integer, `i`.
    Int32,
    /// 32-bit unsigned integer, `u`.
    Uint32,
    /// 64-bit signed integer, `x`.
    Int64,
    /// 64-bit unsigned integer, `t`.
    Uint64,
    /// IEEE 754 double, `d`.
    Double,
    /// Index into an out-of-band file descriptor array, `h`.
    UnixFd,
    /// UTF-8 string, `s`.
    String,
    /// Object path, `o`.
    ObjectPath,
    /// Type signature, `g`.
    Signature,
    /// Dynamically typed value carrying its own signature, `v`.
    Variant,
    /// Ordered sequence of values of one element type, `a`.
    Array(Box<DType>),
    /// Fixed tuple of fields, `(...)`.
    Struct(Vec<DType>),
    /// Key-value pair, `{kv}`; only valid as an array element.
    DictEntry(Box<DType>, Box<DType>),
}

impl DType {
    /// The alignment of the type in bytes.
    pub fn alignment(&self) -> usize {
        match self {
            DType::Byte | DType::Signature | DType::Variant => 1,
            DType::Int16 | DType::Uint16 => 2,
            DType::Boolean
            | DType::Int32
            | DType::Uint32
            | DType::UnixFd
            | DType::String
            | DType::ObjectPath
            | DType::Array(..) => 4,
            DType::Int64 | DType::Uint64 | DType::Double => 8,
            DType::Struct(..) | DType::DictEntry(..) => 8,
        }
    }

    /// Test if this is a basic (non-container) type.
    pub fn is_basic(&self) -> bool {
        !matches!(
            self,
            DType::Array(..) | DType::Struct(..) | DType::DictEntry(..) | DType::Variant
        )
    }

    /// Parse a validated signature into the sequence of complete types it
    /// describes.
    pub fn parse(signature: &Signature) -> Result<Vec<DType>, SignatureError> {
        Self::parse_bytes(signature.as_bytes())
    }

    /// Parse raw signature bytes into complete types.
    ///
    /// This re-checks the grammar, so it is usable on untrusted input such
    /// as a variant signature read off the wire.
    pub(crate) fn parse_bytes(bytes: &[u8]) -> Result<Vec<DType>, SignatureError> {
        if bytes.len() > MAX_SIGNATURE {
            return Err(SignatureError::SignatureTooLong);
        }

        let mut types = Vec::new();
        let mut pos = 0;

        while pos < bytes.len() {
            types.push(parse_single(bytes, &mut pos)?);
        }

        Ok(types)
    }

    /// Parse a signature describing exactly one complete type.
    pub(crate) fn parse_one(bytes: &[u8]) -> Result<DType, SignatureError> {
        let mut types = Self::parse_bytes(bytes)?;

        if types.len() != 1 {
            return Err(SignatureError::ExpectedSingleCompleteType);
        }

        Ok(types.remove(0))
    }

    /// Render the type back into its signature.
    pub fn signature(&self) -> Signature {
        let mut out = String::new();
        self.write_code(&mut out);
        Signature::new_unchecked(&out)
    }

    pub(crate) fn write_code(&self, out: &mut String) {
        match self {
            DType::Byte => out.push('y'),
            DType::Boolean => out.push('b'),
            DType::Int16 => out.push('n'),
            DType::Uint16 => out.push('q'),
            DType::Int32 => out.push('i'),
            DType::Uint32 => out.push('u'),
            DType::Int64 => out.push('x'),
            DType::Uint64 => out.push('t'),
            DType::Double => out.push('d'),
            DType::UnixFd => out.push('h'),
            DType::String => out.push('s'),
            DType::ObjectPath => out.push('o'),
            DType::Signature => out.push('g'),
            DType::Variant => out.push('v'),
            DType::Array(elem) => {
                out.push('a');
                elem.write_code(out);
            }
            DType::Struct(fields) => {
                out.push('(');

                for field in fields {
                    field.write_code(out);
                }

                out.push(')');
            }
            DType::DictEntry(key, value) => {
                out.push('{');
                key.write_code(out);
                value.write_code(out);
                out.push('}');
            }
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        self.write_code(&mut out);
        f.write_str(&out)
    }
}

fn parse_single(bytes: &[u8], pos: &mut usize) -> Result<DType, SignatureError> {
    use SignatureError::*;

    let Some(&b) = bytes.get(*pos) else {
        return Err(MissingArrayElementType);
    };

    *pos += 1;

    let ty = match b {
        b'y' => DType::Byte,
        b'b' => DType::Boolean,
        b'n' => DType::Int16,
        b'q' => DType::Uint16,
        b'i' => DType::Int32,
        b'u' => DType::Uint32,
        b'x' => DType::Int64,
        b't' => DType::Uint64,
        b'd' => DType::Double,
        b'h' => DType::UnixFd,
        b's' => DType::String,
        b'o' => DType::ObjectPath,
        b'g' => DType::Signature,
        b'v' => DType::Variant,
        b'a' => {
            if matches!(bytes.get(*pos), Some(b'{')) {
                *pos += 1;

                let key = parse_single(bytes, pos)?;

                if !key.is_basic() {
                    return Err(DictKeyMustBeBasicType);
                }

                let value = parse_single(bytes, pos)?;

                match bytes.get(*pos) {
                    Some(b'}') => *pos += 1,
                    Some(..) => return Err(DictEntryHasTooManyFields),
                    None => return Err(DictStartedButNotEnded),
                }

                DType::Array(Box::new(DType::DictEntry(Box::new(key), Box::new(value))))
            } else {
                DType::Array(Box::new(parse_single(bytes, pos)?))
            }
        }
        b'(' => {
            let mut fields = Vec::new();

            loop {
                match bytes.get(*pos) {
                    Some(b')') => {
                        *pos += 1;
                        break;
                    }
                    Some(..) => fields.push(parse_single(bytes, pos)?),
                    None => return Err(StructStartedButNotEnded),
                }
            }

            if fields.is_empty() {
                return Err(StructHasNoFields);
            }

            DType::Struct(fields)
        }
        b'{' => return Err(DictEntryNotInsideArray),
        b')' => return Err(StructEndedButNotStarted),
        b'}' => return Err(DictEndedButNotStarted),
        b => return Err(UnknownTypeCode(b)),
    };

    Ok(ty)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Vec<DType> {
        DType::parse_bytes(s.as_bytes()).unwrap()
    }

    #[test]
    fn parse_basic() {
        assert_eq!(parse("i"), vec![DType::Int32]);
        assert_eq!(parse("su"), vec![DType::String, DType::Uint32]);
        assert_eq!(
            parse("ai"),
            vec![DType::Array(Box::new(DType::Int32))]
        );
    }

    #[test]
    fn parse_nested() {
        let tys = parse("a{sv}(id)");

        assert_eq!(
            tys[0],
            DType::Array(Box::new(DType::DictEntry(
                Box::new(DType::String),
                Box::new(DType::Variant),
            )))
        );
        assert_eq!(
            tys[1],
            DType::Struct(vec![DType::Int32, DType::Double])
        );
    }

    #[test]
    fn round_trips_signature() {
        for sig in ["i", "ai", "a{sv}", "(i(sd))", "aa{y(ss)}", "vvg"] {
            let signature = Signature::new(sig).unwrap();
            let rendered: String = DType::parse(&signature)
                .unwrap()
                .iter()
                .map(|t| t.signature().as_str().to_owned())
                .collect();
            assert_eq!(rendered, sig);
        }
    }

    #[test]
    fn rejects_bad_input() {
        assert!(DType::parse_bytes(b"a").is_err());
        assert!(DType::parse_bytes(b"{sv}").is_err());
        assert!(DType::parse_bytes(b"a{vs}").is_err());
        assert!(DType::parse_bytes(b"(").is_err());
        assert!(DType::parse_bytes(b"z").is_err());
        assert!(DType::parse_one(b"ii").is_err());
        assert!(DType::parse_one(b"").is_err());
    }

    #[test]
    fn alignments() {
        assert_eq!(DType::Byte.alignment(), 1);
        assert_eq!(DType::Signature.alignment(), 1);
        assert_eq!(DType::Variant.alignment(), 1);
        assert_eq!(DType::Int16.alignment(), 2);
        assert_eq!(DType::Boolean.alignment(), 4);
        assert_eq!(DType::String.alignment(), 4);
        assert_eq!(DType::Array(Box::new(DType::Uint64)).alignment(), 4);
        assert_eq!(DType::Double.alignment(), 8);
        assert_eq!(DType::Struct(vec![DType::Byte]).alignment(), 8);
    }
}
