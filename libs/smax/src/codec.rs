//! Serialization between native values and the textual form stored in the
//! database hash fields.
//!
//! Integer types render as space-separated decimal tokens (hex `0x` tokens
//! are accepted on parse), booleans as `0`/`1`, floats in shortest
//! round-trip form, strings as `\r`-separated segments, and raw values pass
//! through verbatim. Timestamps render as `<seconds>.<microseconds>`.

use bytes::Bytes;

use crate::error::{Result, SmaxError};
use crate::types::{DataType, SmaxStruct, SmaxValue, Timestamp};

/// Serialize a value to its stored textual form. Structures are not
/// serialized here; they denormalize into per-level hashes.
pub fn serialize_value(value: &SmaxValue) -> Result<Bytes> {
    let text = match value {
        SmaxValue::Raw(b) => return Ok(b.clone()),
        SmaxValue::Struct(_) => {
            return Err(SmaxError::invalid("structures have no single-field form"))
        }
        SmaxValue::Boolean(v) => join_tokens(v.iter().map(|&b| if b { "1" } else { "0" }.into())),
        SmaxValue::Byte(v) => join_ints(v.iter().map(|&n| n as i64)),
        SmaxValue::Short(v) => join_ints(v.iter().map(|&n| n as i64)),
        SmaxValue::Int(v) => join_ints(v.iter().map(|&n| n as i64)),
        SmaxValue::Long(v) => join_ints(v.iter().copied()),
        SmaxValue::Float(v) => {
            let mut buf = ryu::Buffer::new();
            join_tokens(v.iter().map(|&x| buf.format(x).to_string()))
        }
        SmaxValue::Double(v) => {
            let mut buf = ryu::Buffer::new();
            join_tokens(v.iter().map(|&x| buf.format(x).to_string()))
        }
        SmaxValue::Chars { strings, length } => {
            let clipped: Vec<String> = strings.iter().map(|s| clip(s, *length)).collect();
            clipped.join("\r")
        }
        SmaxValue::Str(v) => v.join("\r"),
    };
    Ok(Bytes::from(text))
}

fn join_ints(values: impl Iterator<Item = i64>) -> String {
    let mut buf = itoa::Buffer::new();
    join_tokens(values.map(|n| buf.format(n).to_string()))
}

fn join_tokens(tokens: impl Iterator<Item = String>) -> String {
    tokens.collect::<Vec<_>>().join(" ")
}

fn clip(s: &str, length: usize) -> String {
    let mut end = s.len().min(length);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Deserialize stored text into `count` elements of the requested type.
/// Missing trailing elements are zero-filled; excess input is ignored.
pub fn deserialize_value(data: &[u8], ty: DataType, count: usize) -> Result<SmaxValue> {
    if count == 0 {
        return Err(SmaxError::SizeInvalid("zero element count".into()));
    }

    if ty == DataType::Raw {
        return Ok(SmaxValue::Raw(Bytes::copy_from_slice(data)));
    }
    if ty == DataType::Struct {
        return Err(SmaxError::TypeMismatch {
            expected: "non-struct".into(),
            got: "struct".into(),
        });
    }

    let text = String::from_utf8_lossy(data);

    match ty {
        DataType::Str => Ok(SmaxValue::Str(unpack_strings(&text, count, usize::MAX))),
        DataType::Chars(n) => Ok(SmaxValue::Chars {
            strings: unpack_strings(&text, count, n),
            length: n,
        }),
        DataType::Boolean => {
            let mut v = vec![false; count];
            for (slot, tok) in v.iter_mut().zip(text.split_ascii_whitespace()) {
                *slot = parse_boolean(tok);
            }
            Ok(SmaxValue::Boolean(v))
        }
        DataType::Byte => parse_ints(&text, count).map(|v| {
            SmaxValue::Byte(v.into_iter().map(|n| n as i8).collect())
        }),
        DataType::Short => parse_ints(&text, count).map(|v| {
            SmaxValue::Short(v.into_iter().map(|n| n as i16).collect())
        }),
        DataType::Int | DataType::Unknown => parse_ints(&text, count).map(|v| {
            SmaxValue::Int(v.into_iter().map(|n| n as i32).collect())
        }),
        DataType::Long => parse_ints(&text, count).map(SmaxValue::Long),
        DataType::Float => parse_floats(&text, count).map(|v| {
            SmaxValue::Float(v.into_iter().map(|x| x as f32).collect())
        }),
        DataType::Double => parse_floats(&text, count).map(SmaxValue::Double),
        DataType::Raw | DataType::Struct => unreachable!(),
    }
}

/// Split `\r`-separated string segments into exactly `count` entries,
/// clipping each to `max_len` bytes and padding with empty strings.
fn unpack_strings(text: &str, count: usize, max_len: usize) -> Vec<String> {
    let mut out: Vec<String> = text
        .split('\r')
        .take(count)
        .map(|s| {
            if max_len == usize::MAX {
                s.to_string()
            } else {
                clip(s, max_len)
            }
        })
        .collect();
    out.resize(count, String::new());
    out
}

fn parse_ints(text: &str, count: usize) -> Result<Vec<i64>> {
    let mut v = vec![0i64; count];
    for (slot, tok) in v.iter_mut().zip(text.split_ascii_whitespace()) {
        *slot = parse_int_token(tok)?;
    }
    Ok(v)
}

fn parse_floats(text: &str, count: usize) -> Result<Vec<f64>> {
    let mut v = vec![0f64; count];
    for (slot, tok) in v.iter_mut().zip(text.split_ascii_whitespace()) {
        *slot = tok
            .parse()
            .map_err(|_| SmaxError::Parse(format!("bad float token: {}", tok)))?;
    }
    Ok(v)
}

fn parse_int_token(tok: &str) -> Result<i64> {
    let (neg, body) = match tok.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, tok.strip_prefix('+').unwrap_or(tok)),
    };

    if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        let n = i64::from_str_radix(hex, 16)
            .map_err(|_| SmaxError::Parse(format!("bad integer token: {}", tok)))?;
        return Ok(if neg { n.wrapping_neg() } else { n });
    }

    tok.parse()
        .map_err(|_| SmaxError::Parse(format!("bad integer token: {}", tok)))
}

fn parse_boolean(tok: &str) -> bool {
    matches!(
        tok.to_ascii_lowercase().as_str(),
        "1" | "t" | "true" | "y" | "yes" | "on"
    )
}

/// Render a timestamp in the stored `<seconds>.<microseconds>` form.
pub fn format_timestamp(t: Timestamp) -> String {
    format!("{}.{:06}", t.seconds, t.nanos / 1000)
}

/// Current time in the stored timestamp form.
pub fn timestamp_now() -> String {
    format_timestamp(Timestamp::now())
}

/// Parse a stored timestamp; the fractional part may be missing.
pub fn parse_timestamp(s: &str) -> Option<Timestamp> {
    let s = s.trim();
    let (secs, frac) = match s.split_once('.') {
        Some((a, b)) => (a, Some(b)),
        None => (s, None),
    };

    let seconds: i64 = secs.parse().ok()?;
    let nanos = match frac {
        Some(f) if !f.is_empty() => {
            let fval: f64 = format!("0.{}", f).parse().ok()?;
            (fval * 1e9).round() as u32
        }
        _ => 0,
    };
    Some(Timestamp { seconds, nanos })
}

/// Sub-second UNIX time for a stored timestamp, or 0 if unparseable.
pub fn timestamp_secs_f64(s: &str) -> f64 {
    parse_timestamp(s).map(|t| t.as_secs_f64()).unwrap_or(0.0)
}

/// Decode a serialized value into a structure-free [`SmaxValue`] while
/// keeping nested struct fields as their child-id strings.
pub(crate) fn deserialize_field_value(
    data: &[u8],
    ty: DataType,
    count: usize,
) -> Result<SmaxValue> {
    match ty {
        // A nested struct field carries the aggregated id of the child hash.
        DataType::Struct => Ok(SmaxValue::Str(vec![String::from_utf8_lossy(data)
            .trim_end()
            .to_string()])),
        _ => deserialize_value(data, ty, count.max(1)),
    }
}

/// Placeholder value for a nested structure that was reported but whose
/// contents were not returned.
pub(crate) fn empty_struct() -> SmaxValue {
    SmaxValue::Struct(SmaxStruct::new())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn roundtrip(value: SmaxValue) -> SmaxValue {
        let ty = value.data_type();
        let count = value.len();
        let wire = serialize_value(&value).unwrap();
        deserialize_value(&wire, ty, count).unwrap()
    }

    #[test]
    fn test_int_roundtrip() {
        let v = SmaxValue::Int(vec![1, -2, 3]);
        assert_eq!(roundtrip(v.clone()), v);
    }

    #[test]
    fn test_long_roundtrip() {
        let v = SmaxValue::Long(vec![i64::MIN, 0, i64::MAX]);
        assert_eq!(roundtrip(v.clone()), v);
    }

    #[test]
    fn test_double_roundtrip_shortest_form() {
        let v = SmaxValue::Double(vec![3.14159265, -0.5, 1e-300]);
        assert_eq!(roundtrip(v.clone()), v);
        assert_eq!(
            serialize_value(&SmaxValue::Double(vec![0.5])).unwrap(),
            Bytes::from("0.5")
        );
    }

    #[test]
    fn test_float_roundtrip() {
        let v = SmaxValue::Float(vec![1.5, -2.25e-10]);
        assert_eq!(roundtrip(v.clone()), v);
    }

    #[test]
    fn test_boolean_tokens() {
        let wire = serialize_value(&SmaxValue::Boolean(vec![true, false, true])).unwrap();
        assert_eq!(wire, Bytes::from("1 0 1"));
        assert_eq!(
            deserialize_value(b"1 0 true no", DataType::Boolean, 4).unwrap(),
            SmaxValue::Boolean(vec![true, false, true, false])
        );
    }

    #[test]
    fn test_hex_tokens_accepted() {
        assert_eq!(
            deserialize_value(b"0x10 0X0a -0x1", DataType::Int, 3).unwrap(),
            SmaxValue::Int(vec![16, 10, -1])
        );
    }

    #[test]
    fn test_strings_roundtrip() {
        let v = SmaxValue::Str(vec!["one two".into(), "".into(), "three".into()]);
        assert_eq!(roundtrip(v.clone()), v);
    }

    #[test]
    fn test_chars_clip_and_pad() {
        let wire = serialize_value(&SmaxValue::Chars {
            strings: vec!["abcdef".into(), "x".into()],
            length: 4,
        })
        .unwrap();
        assert_eq!(wire, Bytes::from("abcd\rx"));

        // Parsing one segment into three elements pads with empties.
        assert_eq!(
            deserialize_value(b"hello", DataType::Chars(4), 3).unwrap(),
            SmaxValue::Chars {
                strings: vec!["hell".into(), "".into(), "".into()],
                length: 4,
            }
        );
    }

    #[test]
    fn test_raw_passes_verbatim() {
        let payload = Bytes::from_static(b"\x00\x01binary\xff");
        let v = SmaxValue::Raw(payload.clone());
        assert_eq!(serialize_value(&v).unwrap(), payload);
        assert_eq!(
            deserialize_value(&payload, DataType::Raw, 1).unwrap(),
            v
        );
    }

    #[test]
    fn test_short_input_zero_fills() {
        assert_eq!(
            deserialize_value(b"7", DataType::Int, 3).unwrap(),
            SmaxValue::Int(vec![7, 0, 0])
        );
    }

    #[test]
    fn test_bad_token_is_parse_error() {
        assert!(matches!(
            deserialize_value(b"1 fish", DataType::Int, 2),
            Err(SmaxError::Parse(_))
        ));
    }

    #[test]
    fn test_timestamp_format_and_parse() {
        let t = Timestamp {
            seconds: 1650000000,
            nanos: 250_000_000,
        };
        let s = format_timestamp(t);
        assert_eq!(s, "1650000000.250000");

        let back = parse_timestamp(&s).unwrap();
        assert_eq!(back.seconds, t.seconds);
        assert!((back.nanos as i64 - t.nanos as i64).abs() < 1000);
    }

    #[test]
    fn test_timestamp_parse_tolerates_missing_fraction() {
        let t = parse_timestamp("1650000000").unwrap();
        assert_eq!(t.seconds, 1650000000);
        assert_eq!(t.nanos, 0);
        assert!(parse_timestamp("not a time").is_none());
    }
}
