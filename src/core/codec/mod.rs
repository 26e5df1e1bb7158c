//! Debug buffer codec
//!
//! The controller reports live variable values as one flat byte buffer,
//! values laid out back-to-back in the order of the caller-supplied type
//! tag list. This module turns such a buffer into typed values, and
//! packs forced values back into their wire form.
//!
//! A decode either consumes the buffer exactly or fails as a whole:
//! truncation, trailing bytes, and unknown tags are structural
//! corruption, never partial results.

mod typemap;

pub use typemap::{known_tags, layout_of, TypeLayout, Width, STRING_MAX};

use chrono::Duration;
use std::fmt;
use thiserror::Error;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    /// A tag with no known layout was encountered
    #[error("unknown type tag: {0}")]
    UnknownType(String),

    /// The buffer ended before the current value was complete
    #[error("buffer exhausted while decoding {tag} at offset {offset}")]
    Truncated {
        /// Tag being decoded when the buffer ran out
        tag: String,
        /// Byte offset of the incomplete value
        offset: usize,
    },

    /// Bytes remained after the tag list was exhausted
    #[error("{trailing} trailing byte(s) after the last value")]
    TrailingBytes {
        /// Number of unconsumed bytes
        trailing: usize,
    },

    /// A value did not fit the tag's representable range
    #[error("value out of range for {tag}")]
    ValueOutOfRange {
        /// Offending tag
        tag: String,
    },

    /// A value of the wrong kind was supplied for encoding
    #[error("value does not match type {tag}")]
    TypeMismatch {
        /// Offending tag
        tag: String,
    },
}

/// A decoded wire value
#[derive(Debug, Clone, PartialEq)]
pub enum DebugValue {
    /// BOOL: true iff the wire byte is non-zero
    Bool(bool),
    /// Signed integer families (SINT/INT/DINT/LINT)
    Int(i64),
    /// Unsigned integer and bit-string families (USINT/UINT/UDINT/ULINT/BYTE/WORD/DWORD/LWORD, steps and actions)
    UInt(u64),
    /// Floating point (REAL/LREAL)
    Float(f64),
    /// Length-prefixed string
    Str(String),
    /// Time-like value (TIME/TOD/DATE/DT): seconds + nanoseconds
    Time(Duration),
}

impl fmt::Display for DebugValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::UInt(n) => write!(f, "{n}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(s) => write!(f, "'{s}'"),
            Self::Time(d) => write!(f, "{d}"),
        }
    }
}

/// Decode one debug buffer against an ordered type tag list
///
/// Walks the tags in order, consuming the byte width each implies, and
/// converts every chunk with that tag's decode rule. Succeeds only if
/// the tag list is exhausted exactly when the buffer is.
///
/// # Errors
///
/// [`CodecError::UnknownType`] on a tag without a layout,
/// [`CodecError::Truncated`] if the buffer ends mid-value,
/// [`CodecError::TrailingBytes`] if bytes remain after the last tag,
/// [`CodecError::ValueOutOfRange`] on an unrepresentable value. No
/// partial list is ever returned.
pub fn decode_debug_buffer<S: AsRef<str>>(
    buffer: &[u8],
    tags: &[S],
) -> Result<Vec<DebugValue>, CodecError> {
    let mut values = Vec::with_capacity(tags.len());
    let mut offset = 0usize;

    for tag in tags {
        let tag = tag.as_ref();
        let layout = layout_of(tag).ok_or_else(|| CodecError::UnknownType(tag.to_string()))?;

        let chunk = match layout.width {
            Width::Fixed(width) => {
                if offset + width > buffer.len() {
                    return Err(CodecError::Truncated {
                        tag: tag.to_string(),
                        offset,
                    });
                }
                let chunk = &buffer[offset..offset + width];
                offset += width;
                chunk
            }
            Width::LengthPrefixed => {
                if offset >= buffer.len() {
                    return Err(CodecError::Truncated {
                        tag: tag.to_string(),
                        offset,
                    });
                }
                let len = buffer[offset] as usize;
                if len > STRING_MAX {
                    return Err(CodecError::ValueOutOfRange {
                        tag: tag.to_string(),
                    });
                }
                if offset + 1 + len > buffer.len() {
                    return Err(CodecError::Truncated {
                        tag: tag.to_string(),
                        offset,
                    });
                }
                let chunk = &buffer[offset + 1..offset + 1 + len];
                offset += 1 + len;
                chunk
            }
        };

        let value = (layout.decode)(chunk).ok_or_else(|| CodecError::ValueOutOfRange {
            tag: tag.to_string(),
        })?;
        values.push(value);
    }

    if offset != buffer.len() {
        return Err(CodecError::TrailingBytes {
            trailing: buffer.len() - offset,
        });
    }

    Ok(values)
}

/// Pack one value into the wire form of a type tag
///
/// Used to build forced-value payloads for the trace machinery.
///
/// # Errors
///
/// [`CodecError::UnknownType`] on a tag without a layout,
/// [`CodecError::TypeMismatch`] when the value kind or range does not
/// fit the tag.
pub fn encode_value(tag: &str, value: &DebugValue) -> Result<Vec<u8>, CodecError> {
    let layout = layout_of(tag).ok_or_else(|| CodecError::UnknownType(tag.to_string()))?;
    (layout.encode)(value).ok_or_else(|| CodecError::TypeMismatch {
        tag: tag.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bool_dint_example() {
        let buffer = [0x01, 0x2A, 0x00, 0x00, 0x00];
        let values = decode_debug_buffer(&buffer, &["BOOL", "DINT"]).unwrap();
        assert_eq!(values, vec![DebugValue::Bool(true), DebugValue::Int(42)]);
    }

    #[test]
    fn test_truncated_buffer_fails_whole_decode() {
        let buffer = [0x01, 0x2A, 0x00, 0x00];
        let result = decode_debug_buffer(&buffer, &["BOOL", "DINT"]);
        assert!(matches!(result, Err(CodecError::Truncated { .. })));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let buffer = [0x01, 0x00];
        let result = decode_debug_buffer(&buffer, &["BOOL"]);
        assert!(matches!(
            result,
            Err(CodecError::TrailingBytes { trailing: 1 })
        ));
    }

    #[test]
    fn test_unknown_tag_aborts() {
        let buffer = [0x01];
        let result = decode_debug_buffer(&buffer, &["MYSTERY"]);
        assert!(matches!(result, Err(CodecError::UnknownType(_))));
    }

    #[test]
    fn test_empty_tags_and_buffer_decode_to_nothing() {
        let tags: [&str; 0] = [];
        assert_eq!(decode_debug_buffer(&[], &tags).unwrap(), Vec::new());
    }

    #[test]
    fn test_string_is_length_prefixed() {
        let buffer = [0x03, b'a', b'b', b'c', 0x07];
        let values = decode_debug_buffer(&buffer, &["STRING", "USINT"]).unwrap();
        assert_eq!(
            values,
            vec![DebugValue::Str("abc".into()), DebugValue::UInt(7)]
        );
    }

    #[test]
    fn test_time_combines_seconds_and_nanos() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&3i64.to_le_bytes());
        buffer.extend_from_slice(&500_000_000i64.to_le_bytes());
        let values = decode_debug_buffer(&buffer, &["TIME"]).unwrap();
        assert_eq!(
            values,
            vec![DebugValue::Time(
                Duration::seconds(3) + Duration::nanoseconds(500_000_000)
            )]
        );
    }

    #[test]
    fn test_negative_integers() {
        let buffer = (-5i16).to_le_bytes();
        let values = decode_debug_buffer(&buffer, &["INT"]).unwrap();
        assert_eq!(values, vec![DebugValue::Int(-5)]);
    }

    #[test]
    fn test_encode_decode_agree() {
        let cases = [
            ("BOOL", DebugValue::Bool(true)),
            ("SINT", DebugValue::Int(-12)),
            ("UINT", DebugValue::UInt(40_000)),
            ("DINT", DebugValue::Int(-1_000_000)),
            ("LWORD", DebugValue::UInt(u64::MAX)),
            ("LREAL", DebugValue::Float(1.5)),
            ("STRING", DebugValue::Str("forced".into())),
            (
                "TIME",
                DebugValue::Time(Duration::seconds(1) + Duration::nanoseconds(250)),
            ),
        ];
        for (tag, value) in cases {
            let wire = encode_value(tag, &value).unwrap();
            let back = decode_debug_buffer(&wire, &[tag]).unwrap();
            assert_eq!(back, vec![value], "mismatch for {tag}");
        }
    }

    #[test]
    fn test_encode_rejects_mismatched_value() {
        let result = encode_value("DINT", &DebugValue::Str("nope".into()));
        assert!(matches!(result, Err(CodecError::TypeMismatch { .. })));
    }

    #[test]
    fn test_encode_rejects_oversized_string() {
        let long = "x".repeat(STRING_MAX + 1);
        let result = encode_value("STRING", &DebugValue::Str(long));
        assert!(matches!(result, Err(CodecError::TypeMismatch { .. })));
    }
}
