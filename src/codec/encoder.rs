use crate::error::{Error, ErrorKind, Result};
use crate::proto::{Endianness, MAX_ARRAY_LENGTH};
use crate::signature::{SignatureError, MAX_SIGNATURE};
use crate::ty::DType;
use crate::value::Value;

/// A wire encoder appending to a growable buffer.
///
/// The encoder tracks the logical offset of the produced bytes inside the
/// enclosing message, so alignment padding comes out right even when the
/// buffer itself starts mid-message.
pub(crate) struct Encoder {
    buf: Vec<u8>,
    base: usize,
    endianness: Endianness,
}

impl Encoder {
    /// Construct an encoder whose first byte lands at logical offset
    /// `base`.
    pub(crate) fn new(base: usize, endianness: Endianness) -> Self {
        Self {
            buf: Vec::new(),
            base,
            endianness,
        }
    }

    /// The logical offset one past the last byte written.
    #[inline]
    pub(crate) fn offset(&self) -> usize {
        self.base + self.buf.len()
    }

    /// Number of bytes produced so far.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub(crate) fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    /// Pad with zero bytes to the next multiple of `align`.
    pub(crate) fn pad_to(&mut self, align: usize) {
        let rem = self.offset() % align;

        if rem != 0 {
            self.buf.resize(self.buf.len() + (align - rem), 0);
        }
    }

    #[inline]
    pub(crate) fn extend_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    #[inline]
    pub(crate) fn store_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub(crate) fn store_u16(&mut self, value: u16) {
        self.pad_to(2);
        let bytes = match self.endianness {
            Endianness::BIG => value.to_be_bytes(),
            _ => value.to_le_bytes(),
        };
        self.buf.extend_from_slice(&bytes);
    }

    pub(crate) fn store_u32(&mut self, value: u32) {
        self.pad_to(4);
        let bytes = match self.endianness {
            Endianness::BIG => value.to_be_bytes(),
            _ => value.to_le_bytes(),
        };
        self.buf.extend_from_slice(&bytes);
    }

    pub(crate) fn store_u64(&mut self, value: u64) {
        self.pad_to(8);
        let bytes = match self.endianness {
            Endianness::BIG => value.to_be_bytes(),
            _ => value.to_le_bytes(),
        };
        self.buf.extend_from_slice(&bytes);
    }

    /// Overwrite four bytes at buffer position `at` with a length patched
    /// in after the fact.
    pub(crate) fn patch_u32(&mut self, at: usize, value: u32) {
        let bytes = match self.endianness {
            Endianness::BIG => value.to_be_bytes(),
            _ => value.to_le_bytes(),
        };
        self.buf[at..at + 4].copy_from_slice(&bytes);
    }

    /// Encode a string-like payload: `u32` byte length, body, trailing nul.
    pub(crate) fn store_str(&mut self, value: &str) -> Result<()> {
        if value.as_bytes().contains(&0) {
            return Err(Error::new(ErrorKind::EmbeddedNul));
        }

        self.store_u32(value.len() as u32);
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.push(0);
        Ok(())
    }

    /// Encode a signature payload: `u8` length, body, trailing nul.
    pub(crate) fn store_signature_str(&mut self, value: &str) {
        self.buf.push(value.len() as u8);
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.push(0);
    }

    /// Encode a single value at the current offset.
    pub(crate) fn encode_value(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::Byte(v) => self.store_u8(*v),
            Value::Boolean(v) => self.store_u32(u32::from(*v)),
            Value::Int16(v) => self.store_u16(*v as u16),
            Value::Uint16(v) => self.store_u16(*v),
            Value::Int32(v) => self.store_u32(*v as u32),
            Value::Uint32(v) => self.store_u32(*v),
            Value::Int64(v) => self.store_u64(*v as u64),
            Value::Uint64(v) => self.store_u64(*v),
            Value::Double(v) => self.store_u64(v.to_bits()),
            Value::UnixFd(v) => self.store_u32(*v),
            Value::String(v) => self.store_str(v)?,
            Value::ObjectPath(v) => self.store_str(v.as_str())?,
            Value::Signature(v) => self.store_signature_str(v.as_str()),
            Value::Array(array) => {
                self.store_u32(0);
                let len_at = self.buf.len() - 4;

                self.pad_to(array.elem().alignment());
                let start = self.offset();

                for item in array {
                    let found = item.dtype();

                    if found != *array.elem() {
                        return Err(Error::new(ErrorKind::TypeMismatch {
                            expected: array.elem().clone(),
                            found,
                        }));
                    }

                    self.encode_value(item)?;
                }

                let size = self.offset() - start;

                if size > MAX_ARRAY_LENGTH as usize {
                    return Err(Error::new(ErrorKind::SizeLimitExceeded {
                        what: "array",
                        size: size as u64,
                        max: u64::from(MAX_ARRAY_LENGTH),
                    }));
                }

                self.patch_u32(len_at, size as u32);
            }
            Value::Struct(fields) => {
                if fields.is_empty() {
                    return Err(SignatureError::StructHasNoFields.into());
                }

                self.pad_to(8);

                for field in fields {
                    self.encode_value(field)?;
                }
            }
            Value::DictEntry(key, entry) => {
                if !key.dtype().is_basic() {
                    return Err(SignatureError::DictKeyMustBeBasicType.into());
                }

                self.pad_to(8);
                self.encode_value(key)?;
                self.encode_value(entry)?;
            }
            Value::Variant(inner) => {
                let mut signature = String::new();
                inner.dtype().write_code(&mut signature);

                if signature.len() > MAX_SIGNATURE {
                    return Err(SignatureError::SignatureTooLong.into());
                }

                self.store_signature_str(&signature);
                self.encode_value(inner)?;
            }
        }

        Ok(())
    }
}
