//! Validated D-Bus signature strings.

use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;

use thiserror::Error;

/// Maximum length of a signature in bytes.
pub(crate) const MAX_SIGNATURE: usize = 255;

/// Maximum nesting depth of a single container kind.
const MAX_CONTAINER_DEPTH: usize = 32;

/// Errors raised when validation of a [`Signature`] fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum SignatureError {
    #[error("unknown type code `{}`", *.0 as char)]
    UnknownTypeCode(u8),
    #[error("signature is longer than 255 bytes")]
    SignatureTooLong,
    #[error("array is missing an element type")]
    MissingArrayElementType,
    #[error("struct ended but was never started")]
    StructEndedButNotStarted,
    #[error("dict entry ended but was never started")]
    DictEndedButNotStarted,
    #[error("struct started but never ended")]
    StructStartedButNotEnded,
    #[error("dict entry started but never ended")]
    DictStartedButNotEnded,
    #[error("struct has no fields")]
    StructHasNoFields,
    #[error("dict entry key must be a basic type")]
    DictKeyMustBeBasicType,
    #[error("dict entry has no fields")]
    DictEntryHasNoFields,
    #[error("dict entry has only one field")]
    DictEntryHasOnlyOneField,
    #[error("dict entry has too many fields")]
    DictEntryHasTooManyFields,
    #[error("dict entry is only valid as an array element")]
    DictEntryNotInsideArray,
    #[error("exceeded maximum container recursion")]
    ExceededMaximumRecursion,
    #[error("expected exactly one complete type")]
    ExpectedSingleCompleteType,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Container {
    Array,
    Struct { fields: u8 },
    Dict { fields: u8 },
}

/// Validate the bytes of a signature against the signature grammar.
///
/// An empty signature is valid; it describes an empty body.
pub(crate) fn validate(bytes: &[u8]) -> Result<(), SignatureError> {
    use SignatureError::*;

    if bytes.len() > MAX_SIGNATURE {
        return Err(SignatureTooLong);
    }

    let mut stack = Vec::new();

    for &b in bytes {
        let mut is_basic = match b {
            b'y' | b'b' | b'n' | b'q' | b'i' | b'u' | b'x' | b't' | b'd' | b'h' | b's' | b'o'
            | b'g' => true,
            // Variant counts as a single complete type but never as a dict
            // key.
            b'v' => false,
            b'a' => {
                if stack.len() == MAX_CONTAINER_DEPTH {
                    return Err(ExceededMaximumRecursion);
                }

                stack.push(Container::Array);
                continue;
            }
            b'(' => {
                if stack.len() == MAX_CONTAINER_DEPTH {
                    return Err(ExceededMaximumRecursion);
                }

                stack.push(Container::Struct { fields: 0 });
                continue;
            }
            b')' => match stack.pop() {
                Some(Container::Struct { fields: 0 }) => return Err(StructHasNoFields),
                Some(Container::Struct { .. }) => false,
                Some(Container::Array) => return Err(MissingArrayElementType),
                _ => return Err(StructEndedButNotStarted),
            },
            b'{' => {
                if !matches!(stack.last(), Some(Container::Array)) {
                    return Err(DictEntryNotInsideArray);
                }

                if stack.len() == MAX_CONTAINER_DEPTH {
                    return Err(ExceededMaximumRecursion);
                }

                stack.push(Container::Dict { fields: 0 });
                continue;
            }
            b'}' => match stack.pop() {
                Some(Container::Dict { fields: 0 }) => return Err(DictEntryHasNoFields),
                Some(Container::Dict { fields: 1 }) => return Err(DictEntryHasOnlyOneField),
                Some(Container::Dict { fields: 2 }) => false,
                Some(Container::Dict { .. }) => return Err(DictEntryHasTooManyFields),
                Some(Container::Array) => return Err(MissingArrayElementType),
                _ => return Err(DictEndedButNotStarted),
            },
            b => return Err(UnknownTypeCode(b)),
        };

        // A complete type closes any enclosing arrays.
        while matches!(stack.last(), Some(Container::Array)) {
            stack.pop();
            is_basic = false;
        }

        match stack.last_mut() {
            Some(Container::Struct { fields }) => *fields = fields.saturating_add(1),
            Some(Container::Dict { fields }) => {
                if *fields == 0 && !is_basic {
                    return Err(DictKeyMustBeBasicType);
                }

                *fields += 1;
            }
            _ => {}
        }
    }

    match stack.pop() {
        Some(Container::Array) => Err(MissingArrayElementType),
        Some(Container::Struct { .. }) => Err(StructStartedButNotEnded),
        Some(Container::Dict { .. }) => Err(DictStartedButNotEnded),
        None => Ok(()),
    }
}

/// An owned, validated D-Bus signature.
///
/// A signature is a sequence of type codes describing the shape of a message
/// body or a variant payload.
///
/// # Examples
///
/// ```
/// use pipebus::Signature;
///
/// let sig = Signature::new("a{sv}")?;
/// assert_eq!(sig.as_str(), "a{sv}");
/// assert!(Signature::new("a").is_err());
/// # Ok::<_, pipebus::SignatureError>(())
/// ```
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Signature(Box<str>);

impl Signature {
    /// The empty signature, describing an empty body.
    #[inline]
    pub fn empty() -> Self {
        Self(Box::from(""))
    }

    /// Construct a new validated signature.
    pub fn new(signature: impl AsRef<str>) -> Result<Self, SignatureError> {
        let signature = signature.as_ref();
        validate(signature.as_bytes())?;
        Ok(Self(Box::from(signature)))
    }

    /// Construct a signature without validating it.
    ///
    /// Only for byte sequences already known to satisfy the grammar.
    pub(crate) fn new_unchecked(signature: &str) -> Self {
        debug_assert!(validate(signature.as_bytes()).is_ok());
        Self(Box::from(signature))
    }

    /// Get the string representation of the signature.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Test if the signature is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The length of the signature in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Debug for Signature {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({:?})", self.as_str())
    }
}

impl fmt::Display for Signature {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Deref for Signature {
    type Target = str;

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl Borrow<str> for Signature {
    #[inline]
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

impl PartialEq<str> for Signature {
    #[inline]
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl PartialEq<&str> for Signature {
    #[inline]
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

impl TryFrom<&str> for Signature {
    type Error = SignatureError;

    #[inline]
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_signatures() {
        for sig in [
            "", "y", "b", "n", "q", "i", "u", "x", "t", "d", "h", "s", "o", "g", "v", "ai",
            "aai", "(i)", "(ii)", "(i(ii))", "a(ii)", "a{sv}", "a{yv}", "aa{ss}", "av",
            "(sa{sv})", "ya{ii}", "isot",
        ] {
            assert!(Signature::new(sig).is_ok(), "expected `{sig}` to be valid");
        }
    }

    #[test]
    fn invalid_signatures() {
        use SignatureError::*;

        for (sig, expected) in [
            ("a", MissingArrayElementType),
            ("aaa", MissingArrayElementType),
            ("i)", StructEndedButNotStarted),
            ("(i", StructStartedButNotEnded),
            ("()", StructHasNoFields),
            ("a{}s", DictEntryHasNoFields),
            ("a{s}", DictEntryHasOnlyOneField),
            ("a{sss}", DictEntryHasTooManyFields),
            ("a{vs}", DictKeyMustBeBasicType),
            ("a{(i)s}", DictKeyMustBeBasicType),
            ("{sv}", DictEntryNotInsideArray),
            ("a{sv", DictStartedButNotEnded),
            ("z", UnknownTypeCode(b'z')),
            ("r", UnknownTypeCode(b'r')),
            ("e", UnknownTypeCode(b'e')),
        ] {
            assert_eq!(
                Signature::new(sig).unwrap_err(),
                expected,
                "signature `{sig}`"
            );
        }
    }

    #[test]
    fn too_long() {
        let sig = "i".repeat(256);
        assert_eq!(
            Signature::new(&sig).unwrap_err(),
            SignatureError::SignatureTooLong
        );

        let sig = "i".repeat(255);
        assert!(Signature::new(&sig).is_ok());
    }

    #[test]
    fn max_recursion() {
        let sig = "a".repeat(33) + "i";
        assert_eq!(
            Signature::new(&sig).unwrap_err(),
            SignatureError::ExceededMaximumRecursion
        );
    }
}
