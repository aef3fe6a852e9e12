//! Byte-exact encoding and decoding of D-Bus values.
//!
//! The codec honors the signature grammar, per-type alignment, both byte
//! orders and the protocol size limits. Padding is zero on encode and is
//! required to be zero on decode.

pub(crate) use self::decoder::Decoder;
mod decoder;

pub(crate) use self::encoder::Encoder;
mod encoder;

use crate::error::{Error, ErrorKind, Result};
use crate::proto::Endianness;
use crate::signature::{Signature, SignatureError, MAX_SIGNATURE};
use crate::ty::DType;
use crate::value::Value;

/// Encode a single value as if it started at logical offset `offset`
/// inside a message.
///
/// Returns the produced bytes, including any leading alignment padding,
/// and their length.
///
/// # Examples
///
/// ```
/// use pipebus::codec::encode;
/// use pipebus::{Endianness, Value};
///
/// let (bytes, produced) = encode(&Value::Uint16(513), 0, Endianness::LITTLE)?;
/// assert_eq!(bytes, [1, 2]);
/// assert_eq!(produced, 2);
/// # Ok::<_, pipebus::Error>(())
/// ```
pub fn encode(value: &Value, offset: usize, endianness: Endianness) -> Result<(Vec<u8>, usize)> {
    let mut encoder = Encoder::new(offset, endianness);
    encoder.encode_value(value)?;
    let produced = encoder.len();
    Ok((encoder.into_vec(), produced))
}

/// Decode a single value of type `ty` from `buf`, starting at `offset`.
///
/// Returns the value and the number of bytes consumed, including leading
/// alignment padding.
pub fn decode(
    buf: &[u8],
    offset: usize,
    ty: &DType,
    endianness: Endianness,
) -> Result<(Value, usize)> {
    let mut decoder = Decoder::new(buf, offset, endianness);
    let value = decoder.decode_value(ty)?;
    Ok((value, decoder.pos() - offset))
}

/// Compute the body signature describing a sequence of values.
pub(crate) fn signature_of(values: &[Value]) -> Result<Signature> {
    let mut out = String::new();

    for value in values {
        value.dtype().write_code(&mut out);
    }

    if out.len() > MAX_SIGNATURE {
        return Err(SignatureError::SignatureTooLong.into());
    }

    Ok(Signature::new_unchecked(&out))
}

/// Encode a message body. Bodies start at an 8-aligned boundary, so the
/// encode offset is zero.
pub(crate) fn encode_body(values: &[Value], endianness: Endianness) -> Result<Vec<u8>> {
    let mut encoder = Encoder::new(0, endianness);

    for value in values {
        encoder.encode_value(value)?;
    }

    Ok(encoder.into_vec())
}

/// Decode a message body against its signature. The whole body must be
/// consumed.
pub(crate) fn decode_body(
    buf: &[u8],
    signature: &Signature,
    endianness: Endianness,
) -> Result<Vec<Value>> {
    let types = DType::parse(signature)?;
    let mut decoder = Decoder::new(buf, 0, endianness);
    let mut values = Vec::with_capacity(types.len());

    for ty in &types {
        values.push(decoder.decode_value(ty)?);
    }

    if !decoder.is_empty() {
        return Err(Error::new(ErrorKind::BodySignatureMismatch));
    }

    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_path::ObjectPath;
    use crate::value::Array;

    const BOTH: [Endianness; 2] = [Endianness::LITTLE, Endianness::BIG];

    fn battery() -> Vec<Value> {
        let mut dict = Array::dict(DType::String, DType::Variant).unwrap();
        dict.insert(
            Value::String("answer".into()),
            Value::Uint32(42).into_variant(),
        )
        .unwrap();
        dict.insert(
            Value::String("pi".into()),
            Value::Double(3.5).into_variant(),
        )
        .unwrap();

        vec![
            Value::Byte(0xAB),
            Value::Boolean(true),
            Value::Boolean(false),
            Value::Int16(-2),
            Value::Uint16(0xBEEF),
            Value::Int32(i32::MIN),
            Value::Uint32(0xDEAD_BEEF),
            Value::Int64(i64::MIN),
            Value::Uint64(u64::MAX),
            Value::Double(-0.5),
            Value::UnixFd(7),
            Value::String(String::new()),
            Value::String("Hello World!".into()),
            Value::ObjectPath(ObjectPath::new("/org/freedesktop/DBus").unwrap()),
            Value::Signature(Signature::new("a{sv}").unwrap()),
            Value::Array(Array::new(DType::Uint64)),
            Value::Array(
                Array::from_iter(
                    DType::Int32,
                    [Value::Int32(1), Value::Int32(2), Value::Int32(3)],
                )
                .unwrap(),
            ),
            Value::Array(
                Array::from_iter(
                    DType::String,
                    [Value::String("a".into()), Value::String("bc".into())],
                )
                .unwrap(),
            ),
            Value::Struct(vec![
                Value::Byte(1),
                Value::Struct(vec![Value::String("x".into()), Value::Int64(-1)]),
            ]),
            Value::Array(dict),
            Value::Uint32(9).into_variant(),
            Value::Variant(Box::new(Value::Variant(Box::new(Value::Byte(2))))),
        ]
    }

    #[test]
    fn round_trip_offsets_and_endians() {
        for value in battery() {
            let ty = value.dtype();

            for endianness in BOTH {
                for offset in 0..16 {
                    let (bytes, produced) = encode(&value, offset, endianness).unwrap();
                    assert_eq!(bytes.len(), produced);

                    // Leading padding is all zero.
                    let pad = padding(ty.alignment(), offset);
                    assert!(bytes[..pad].iter().all(|&b| b == 0));

                    let mut buf = vec![0; offset];
                    buf.extend_from_slice(&bytes);

                    let (decoded, consumed) = decode(&buf, offset, &ty, endianness).unwrap();
                    assert_eq!(decoded, value, "offset {offset}, {endianness:?}");
                    assert_eq!(consumed, produced);
                }
            }
        }
    }

    fn padding(align: usize, offset: usize) -> usize {
        (align - offset % align) % align
    }

    #[test]
    fn fixed_width_alignment() {
        for (value, body) in [
            (Value::Byte(1), 1),
            (Value::Int16(1), 2),
            (Value::Uint16(1), 2),
            (Value::Boolean(true), 4),
            (Value::Int32(1), 4),
            (Value::Uint32(1), 4),
            (Value::UnixFd(1), 4),
            (Value::Int64(1), 8),
            (Value::Uint64(1), 8),
            (Value::Double(1.0), 8),
        ] {
            let align = value.dtype().alignment();

            for offset in 0..16 {
                let (_, produced) = encode(&value, offset, Endianness::LITTLE).unwrap();
                assert_eq!(produced, padding(align, offset) + body);
            }
        }
    }

    #[test]
    fn int32_array_at_offset_five() {
        let array = Array::from_iter(
            DType::Int32,
            [Value::Int32(i32::MIN), Value::Int32(i32::MAX)],
        )
        .unwrap();

        let (bytes, produced) = encode(&Value::Array(array), 5, Endianness::LITTLE).unwrap();

        assert_eq!(produced, 15);
        assert_eq!(
            bytes,
            [
                // pad to the length field
                0, 0, 0,
                // eight bytes of elements
                8, 0, 0, 0,
                // i32::MIN
                0x00, 0x00, 0x00, 0x80,
                // i32::MAX
                0xFF, 0xFF, 0xFF, 0x7F,
            ]
        );
    }

    #[test]
    fn empty_array_pads_to_element_alignment() {
        // Even an empty array of 8-aligned elements pads past the length
        // field.
        let (bytes, produced) =
            encode(&Value::Array(Array::new(DType::Uint64)), 0, Endianness::LITTLE).unwrap();
        assert_eq!(bytes, [0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(produced, 8);

        let (_, consumed) = decode(
            &bytes,
            0,
            &DType::Array(Box::new(DType::Uint64)),
            Endianness::LITTLE,
        )
        .unwrap();
        assert_eq!(consumed, 8);
    }

    #[test]
    fn array_length_excludes_leading_padding() {
        // u64 elements: 4-byte length, then 4 bytes of padding which must
        // not be counted in the length.
        let array =
            Array::from_iter(DType::Uint64, [Value::Uint64(1), Value::Uint64(2)]).unwrap();
        let (bytes, _) = encode(&Value::Array(array), 0, Endianness::LITTLE).unwrap();

        assert_eq!(bytes.len(), 4 + 4 + 16);
        assert_eq!(&bytes[..4], &[16, 0, 0, 0]);
    }

    #[test]
    fn rejects_non_zero_padding() {
        let (bytes, _) = encode(&Value::Int32(1), 1, Endianness::LITTLE).unwrap();

        let mut buf = vec![0u8; 1];
        buf.extend_from_slice(&bytes);
        buf[2] = 0xFF;

        let err = decode(&buf, 1, &DType::Int32, Endianness::LITTLE).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidPadding { at: 2 }));
    }

    #[test]
    fn rejects_invalid_boolean() {
        let buf = 2u32.to_le_bytes();
        let err = decode(&buf, 0, &DType::Boolean, Endianness::LITTLE).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidBoolean(2)));
    }

    #[test]
    fn rejects_short_input() {
        let (bytes, _) = encode(&Value::Uint64(1), 0, Endianness::LITTLE).unwrap();
        let err = decode(&bytes[..7], 0, &DType::Uint64, Endianness::LITTLE).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::UnexpectedEof));
    }

    #[test]
    fn rejects_missing_nul_terminator() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&2u32.to_le_bytes());
        buf.extend_from_slice(b"hiX");

        let err = decode(&buf, 0, &DType::String, Endianness::LITTLE).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::NotNullTerminated));
    }

    #[test]
    fn rejects_invalid_utf8() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&2u32.to_le_bytes());
        buf.extend_from_slice(&[0xFF, 0xFE, 0]);

        let err = decode(&buf, 0, &DType::String, Endianness::LITTLE).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidUtf8(..)));
    }

    #[test]
    fn rejects_embedded_nul_on_encode() {
        let err = encode(&Value::String("a\0b".into()), 0, Endianness::LITTLE).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::EmbeddedNul));
    }

    #[test]
    fn rejects_oversized_array() {
        let big = "x".repeat((1 << 26) + 1);
        let array = Array::from_iter(DType::String, [Value::String(big)]).unwrap();

        let err = encode(&Value::Array(array), 0, Endianness::LITTLE).unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::SizeLimitExceeded { what: "array", .. }
        ));
    }

    #[test]
    fn rejects_declared_array_length_over_limit() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&((1u32 << 26) + 1).to_le_bytes());
        buf.extend_from_slice(&[0; 16]);

        let err = decode(
            &buf,
            0,
            &DType::Array(Box::new(DType::Byte)),
            Endianness::LITTLE,
        )
        .unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::SizeLimitExceeded { what: "array", .. }
        ));
    }

    #[test]
    fn variant_signature_must_be_single_type() {
        // u8 length 2, "ii", nul, then data; two complete types inside a
        // variant are rejected.
        let buf = [2, b'i', b'i', 0, 1, 0, 0, 0, 2, 0, 0, 0];
        let err = decode(&buf, 0, &DType::Variant, Endianness::LITTLE).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Signature(..)));
    }

    #[test]
    fn body_round_trip() {
        let values = vec![
            Value::Uint32(7),
            Value::String("hello".into()),
            Value::Struct(vec![Value::Byte(1), Value::Int64(-1)]),
        ];

        let signature = signature_of(&values).unwrap();
        assert_eq!(signature.as_str(), "us(yx)");

        for endianness in BOTH {
            let body = encode_body(&values, endianness).unwrap();
            let decoded = decode_body(&body, &signature, endianness).unwrap();
            assert_eq!(decoded, values);
        }
    }

    #[test]
    fn body_with_trailing_garbage_is_rejected() {
        let values = vec![Value::Uint32(7)];
        let signature = signature_of(&values).unwrap();

        let mut body = encode_body(&values, Endianness::LITTLE).unwrap();
        body.push(0xAA);

        let err = decode_body(&body, &signature, Endianness::LITTLE).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::BodySignatureMismatch));
    }
}
