//! IEC wire type table
//!
//! Declarative table mapping type tags to their binary layout and the
//! conversion in each direction. Must stay in sync with the
//! controller-side `iec_types` layout: fixed-width little-endian
//! scalars, length-prefixed strings, two-field time values.

use chrono::Duration;

use super::DebugValue;

/// Maximum body length of a wire string (excluding the length byte)
pub const STRING_MAX: usize = 126;

/// Byte width of time-like values: two 8-byte fields (seconds, nanos)
const TIME_WIDTH: usize = 16;

/// Wire width of a type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    /// Fixed number of bytes
    Fixed(usize),
    /// One length byte followed by that many body bytes
    LengthPrefixed,
}

/// Layout and conversion rules for one type tag
pub struct TypeLayout {
    /// The wire type tag (e.g. `"DINT"`)
    pub tag: &'static str,
    /// Number of bytes the tag occupies on the wire
    pub width: Width,
    pub(super) decode: fn(&[u8]) -> Option<DebugValue>,
    pub(super) encode: fn(&DebugValue) -> Option<Vec<u8>>,
}

// ============ Decode ============

fn de_bool(b: &[u8]) -> Option<DebugValue> {
    Some(DebugValue::Bool(b[0] != 0))
}

fn de_u8(b: &[u8]) -> Option<DebugValue> {
    Some(DebugValue::UInt(u64::from(b[0])))
}

fn de_i8(b: &[u8]) -> Option<DebugValue> {
    Some(DebugValue::Int(i64::from(b[0] as i8)))
}

fn de_i16(b: &[u8]) -> Option<DebugValue> {
    Some(DebugValue::Int(i64::from(i16::from_le_bytes([b[0], b[1]]))))
}

fn de_u16(b: &[u8]) -> Option<DebugValue> {
    Some(DebugValue::UInt(u64::from(u16::from_le_bytes([b[0], b[1]]))))
}

fn de_i32(b: &[u8]) -> Option<DebugValue> {
    Some(DebugValue::Int(i64::from(i32::from_le_bytes([
        b[0], b[1], b[2], b[3],
    ]))))
}

fn de_u32(b: &[u8]) -> Option<DebugValue> {
    Some(DebugValue::UInt(u64::from(u32::from_le_bytes([
        b[0], b[1], b[2], b[3],
    ]))))
}

fn de_i64(b: &[u8]) -> Option<DebugValue> {
    Some(DebugValue::Int(i64::from_le_bytes([
        b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
    ])))
}

fn de_u64(b: &[u8]) -> Option<DebugValue> {
    Some(DebugValue::UInt(u64::from_le_bytes([
        b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
    ])))
}

fn de_f32(b: &[u8]) -> Option<DebugValue> {
    Some(DebugValue::Float(f64::from(f32::from_le_bytes([
        b[0], b[1], b[2], b[3],
    ]))))
}

fn de_f64(b: &[u8]) -> Option<DebugValue> {
    Some(DebugValue::Float(f64::from_le_bytes([
        b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
    ])))
}

fn de_string(body: &[u8]) -> Option<DebugValue> {
    Some(DebugValue::Str(
        String::from_utf8_lossy(body).into_owned(),
    ))
}

fn de_time(b: &[u8]) -> Option<DebugValue> {
    let secs = i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]);
    let nanos = i64::from_le_bytes([b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15]]);
    let duration = Duration::try_seconds(secs)?.checked_add(&Duration::nanoseconds(nanos))?;
    Some(DebugValue::Time(duration))
}

// ============ Encode ============

fn en_bool(v: &DebugValue) -> Option<Vec<u8>> {
    match v {
        DebugValue::Bool(b) => Some(vec![u8::from(*b)]),
        _ => None,
    }
}

fn en_u8(v: &DebugValue) -> Option<Vec<u8>> {
    match v {
        DebugValue::UInt(n) => u8::try_from(*n).ok().map(|n| vec![n]),
        _ => None,
    }
}

fn en_i8(v: &DebugValue) -> Option<Vec<u8>> {
    match v {
        DebugValue::Int(n) => i8::try_from(*n).ok().map(|n| vec![n as u8]),
        _ => None,
    }
}

fn en_i16(v: &DebugValue) -> Option<Vec<u8>> {
    match v {
        DebugValue::Int(n) => i16::try_from(*n).ok().map(|n| n.to_le_bytes().to_vec()),
        _ => None,
    }
}

fn en_u16(v: &DebugValue) -> Option<Vec<u8>> {
    match v {
        DebugValue::UInt(n) => u16::try_from(*n).ok().map(|n| n.to_le_bytes().to_vec()),
        _ => None,
    }
}

fn en_i32(v: &DebugValue) -> Option<Vec<u8>> {
    match v {
        DebugValue::Int(n) => i32::try_from(*n).ok().map(|n| n.to_le_bytes().to_vec()),
        _ => None,
    }
}

fn en_u32(v: &DebugValue) -> Option<Vec<u8>> {
    match v {
        DebugValue::UInt(n) => u32::try_from(*n).ok().map(|n| n.to_le_bytes().to_vec()),
        _ => None,
    }
}

fn en_i64(v: &DebugValue) -> Option<Vec<u8>> {
    match v {
        DebugValue::Int(n) => Some(n.to_le_bytes().to_vec()),
        _ => None,
    }
}

fn en_u64(v: &DebugValue) -> Option<Vec<u8>> {
    match v {
        DebugValue::UInt(n) => Some(n.to_le_bytes().to_vec()),
        _ => None,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn en_f32(v: &DebugValue) -> Option<Vec<u8>> {
    match v {
        DebugValue::Float(f) => Some((*f as f32).to_le_bytes().to_vec()),
        _ => None,
    }
}

fn en_f64(v: &DebugValue) -> Option<Vec<u8>> {
    match v {
        DebugValue::Float(f) => Some(f.to_le_bytes().to_vec()),
        _ => None,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn en_string(v: &DebugValue) -> Option<Vec<u8>> {
    match v {
        DebugValue::Str(s) if s.len() <= STRING_MAX => {
            let mut out = Vec::with_capacity(1 + s.len());
            out.push(s.len() as u8);
            out.extend_from_slice(s.as_bytes());
            Some(out)
        }
        _ => None,
    }
}

fn en_time(v: &DebugValue) -> Option<Vec<u8>> {
    match v {
        DebugValue::Time(d) => {
            let secs = d.num_seconds();
            let nanos = i64::from(d.subsec_nanos());
            let mut out = Vec::with_capacity(TIME_WIDTH);
            out.extend_from_slice(&secs.to_le_bytes());
            out.extend_from_slice(&nanos.to_le_bytes());
            Some(out)
        }
        _ => None,
    }
}

// ============ Table ============

static TYPES: &[TypeLayout] = &[
    TypeLayout { tag: "BOOL", width: Width::Fixed(1), decode: de_bool, encode: en_bool },
    TypeLayout { tag: "STEP", width: Width::Fixed(1), decode: de_u8, encode: en_u8 },
    TypeLayout { tag: "TRANSITION", width: Width::Fixed(1), decode: de_u8, encode: en_u8 },
    TypeLayout { tag: "ACTION", width: Width::Fixed(1), decode: de_u8, encode: en_u8 },
    TypeLayout { tag: "SINT", width: Width::Fixed(1), decode: de_i8, encode: en_i8 },
    TypeLayout { tag: "USINT", width: Width::Fixed(1), decode: de_u8, encode: en_u8 },
    TypeLayout { tag: "BYTE", width: Width::Fixed(1), decode: de_u8, encode: en_u8 },
    TypeLayout { tag: "STRING", width: Width::LengthPrefixed, decode: de_string, encode: en_string },
    TypeLayout { tag: "INT", width: Width::Fixed(2), decode: de_i16, encode: en_i16 },
    TypeLayout { tag: "UINT", width: Width::Fixed(2), decode: de_u16, encode: en_u16 },
    TypeLayout { tag: "WORD", width: Width::Fixed(2), decode: de_u16, encode: en_u16 },
    TypeLayout { tag: "DINT", width: Width::Fixed(4), decode: de_i32, encode: en_i32 },
    TypeLayout { tag: "UDINT", width: Width::Fixed(4), decode: de_u32, encode: en_u32 },
    TypeLayout { tag: "DWORD", width: Width::Fixed(4), decode: de_u32, encode: en_u32 },
    TypeLayout { tag: "LINT", width: Width::Fixed(8), decode: de_i64, encode: en_i64 },
    TypeLayout { tag: "ULINT", width: Width::Fixed(8), decode: de_u64, encode: en_u64 },
    TypeLayout { tag: "LWORD", width: Width::Fixed(8), decode: de_u64, encode: en_u64 },
    TypeLayout { tag: "REAL", width: Width::Fixed(4), decode: de_f32, encode: en_f32 },
    TypeLayout { tag: "LREAL", width: Width::Fixed(8), decode: de_f64, encode: en_f64 },
    TypeLayout { tag: "TIME", width: Width::Fixed(TIME_WIDTH), decode: de_time, encode: en_time },
    TypeLayout { tag: "TOD", width: Width::Fixed(TIME_WIDTH), decode: de_time, encode: en_time },
    TypeLayout { tag: "DATE", width: Width::Fixed(TIME_WIDTH), decode: de_time, encode: en_time },
    TypeLayout { tag: "DT", width: Width::Fixed(TIME_WIDTH), decode: de_time, encode: en_time },
];

/// Look up the layout for a type tag
pub fn layout_of(tag: &str) -> Option<&'static TypeLayout> {
    TYPES.iter().find(|t| t.tag == tag)
}

/// All known type tags, in table order
pub fn known_tags() -> impl Iterator<Item = &'static str> {
    TYPES.iter().map(|t| t.tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_tags_resolve() {
        for tag in known_tags() {
            assert!(layout_of(tag).is_some(), "missing layout for {tag}");
        }
        assert!(layout_of("NOT_A_TYPE").is_none());
    }

    #[test]
    fn test_fixed_widths() {
        assert_eq!(layout_of("BOOL").unwrap().width, Width::Fixed(1));
        assert_eq!(layout_of("INT").unwrap().width, Width::Fixed(2));
        assert_eq!(layout_of("DINT").unwrap().width, Width::Fixed(4));
        assert_eq!(layout_of("LWORD").unwrap().width, Width::Fixed(8));
        assert_eq!(layout_of("TIME").unwrap().width, Width::Fixed(16));
        assert_eq!(layout_of("STRING").unwrap().width, Width::LengthPrefixed);
    }
}
