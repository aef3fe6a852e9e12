use std::str;

use crate::error::{Error, ErrorKind, Result};
use crate::object_path::ObjectPath;
use crate::proto::{Endianness, MAX_ARRAY_LENGTH};
use crate::signature::{validate, Signature};
use crate::ty::DType;
use crate::value::{Array, Value};

/// A wire decoder walking a byte buffer at message-absolute offsets.
pub(crate) struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
    endianness: Endianness,
}

impl<'a> Decoder<'a> {
    pub(crate) fn new(buf: &'a [u8], pos: usize, endianness: Endianness) -> Self {
        Self {
            buf,
            pos,
            endianness,
        }
    }

    /// The current offset into the buffer.
    #[inline]
    pub(crate) fn pos(&self) -> usize {
        self.pos
    }

    /// Test if the decoder has consumed the whole buffer.
    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// Skip padding up to the next multiple of `align`, requiring every
    /// padding byte to be zero.
    pub(crate) fn pad_to(&mut self, align: usize) -> Result<()> {
        let rem = self.pos % align;

        if rem == 0 {
            return Ok(());
        }

        for _ in 0..align - rem {
            let at = self.pos;

            match self.buf.get(at) {
                Some(0) => self.pos += 1,
                Some(..) => return Err(Error::new(ErrorKind::InvalidPadding { at })),
                None => return Err(Error::new(ErrorKind::UnexpectedEof)),
            }
        }

        Ok(())
    }

    /// Take `n` bytes off the front of the remaining buffer.
    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| Error::new(ErrorKind::UnexpectedEof))?;

        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    pub(crate) fn load_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn load_u16(&mut self) -> Result<u16> {
        self.pad_to(2)?;
        let bytes: [u8; 2] = self.take(2)?.try_into().map_err(|_| ErrorKind::UnexpectedEof)?;

        Ok(match self.endianness {
            Endianness::BIG => u16::from_be_bytes(bytes),
            _ => u16::from_le_bytes(bytes),
        })
    }

    pub(crate) fn load_u32(&mut self) -> Result<u32> {
        self.pad_to(4)?;
        let bytes: [u8; 4] = self.take(4)?.try_into().map_err(|_| ErrorKind::UnexpectedEof)?;

        Ok(match self.endianness {
            Endianness::BIG => u32::from_be_bytes(bytes),
            _ => u32::from_le_bytes(bytes),
        })
    }

    pub(crate) fn load_u64(&mut self) -> Result<u64> {
        self.pad_to(8)?;
        let bytes: [u8; 8] = self.take(8)?.try_into().map_err(|_| ErrorKind::UnexpectedEof)?;

        Ok(match self.endianness {
            Endianness::BIG => u64::from_be_bytes(bytes),
            _ => u64::from_le_bytes(bytes),
        })
    }

    /// Load a string payload: `u32` byte length, UTF-8 body, trailing nul.
    pub(crate) fn load_str(&mut self) -> Result<&'a str> {
        let len = self.load_u32()? as usize;
        let bytes = self.take(len)?;

        if self.load_u8()? != 0 {
            return Err(Error::new(ErrorKind::NotNullTerminated));
        }

        if bytes.contains(&0) {
            return Err(Error::new(ErrorKind::EmbeddedNul));
        }

        Ok(str::from_utf8(bytes)?)
    }

    /// Load a signature payload: `u8` length, body, trailing nul. The body
    /// is validated against the signature grammar.
    pub(crate) fn load_signature_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.load_u8()? as usize;
        let bytes = self.take(len)?;

        if self.load_u8()? != 0 {
            return Err(Error::new(ErrorKind::NotNullTerminated));
        }

        validate(bytes)?;
        Ok(bytes)
    }

    /// Decode a single value of the given type at the current offset.
    pub(crate) fn decode_value(&mut self, ty: &DType) -> Result<Value> {
        let value = match ty {
            DType::Byte => Value::Byte(self.load_u8()?),
            DType::Boolean => match self.load_u32()? {
                0 => Value::Boolean(false),
                1 => Value::Boolean(true),
                other => return Err(Error::new(ErrorKind::InvalidBoolean(other))),
            },
            DType::Int16 => Value::Int16(self.load_u16()? as i16),
            DType::Uint16 => Value::Uint16(self.load_u16()?),
            DType::Int32 => Value::Int32(self.load_u32()? as i32),
            DType::Uint32 => Value::Uint32(self.load_u32()?),
            DType::Int64 => Value::Int64(self.load_u64()? as i64),
            DType::Uint64 => Value::Uint64(self.load_u64()?),
            DType::Double => Value::Double(f64::from_bits(self.load_u64()?)),
            DType::UnixFd => Value::UnixFd(self.load_u32()?),
            DType::String => Value::String(self.load_str()?.into()),
            DType::ObjectPath => {
                let path = self.load_str()?;
                Value::ObjectPath(ObjectPath::new(path)?)
            }
            DType::Signature => {
                let bytes = self.load_signature_bytes()?;
                // Validated as a signature, so also valid UTF-8.
                Value::Signature(Signature::new_unchecked(str::from_utf8(bytes)?))
            }
            DType::Array(elem) => {
                let size = self.load_u32()?;

                if size > MAX_ARRAY_LENGTH {
                    return Err(Error::new(ErrorKind::SizeLimitExceeded {
                        what: "array",
                        size: u64::from(size),
                        max: u64::from(MAX_ARRAY_LENGTH),
                    }));
                }

                self.pad_to(elem.alignment())?;

                let end = self.pos + size as usize;

                if end > self.buf.len() {
                    return Err(Error::new(ErrorKind::UnexpectedEof));
                }

                let mut array = Array::new((**elem).clone());

                while self.pos < end {
                    array.push(self.decode_value(elem)?)?;
                }

                if self.pos != end {
                    // The last element overran the declared array length.
                    return Err(Error::new(ErrorKind::UnexpectedEof));
                }

                Value::Array(array)
            }
            DType::Struct(fields) => {
                self.pad_to(8)?;

                let mut values = Vec::with_capacity(fields.len());

                for field in fields {
                    values.push(self.decode_value(field)?);
                }

                Value::Struct(values)
            }
            DType::DictEntry(key, value) => {
                self.pad_to(8)?;
                let k = self.decode_value(key)?;
                let v = self.decode_value(value)?;
                Value::DictEntry(Box::new(k), Box::new(v))
            }
            DType::Variant => {
                let signature = self.load_signature_bytes()?;
                let inner = DType::parse_one(signature)?;
                Value::Variant(Box::new(self.decode_value(&inner)?))
            }
        };

        Ok(value)
    }
}
