//! Typed values, shapes and metadata for SMA-X variables.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::error::{Result, SmaxError};

/// Reserved separator joining table and key into an aggregated id.
pub const SEP: &str = ":";

/// Maximum number of dimensions of a stored array.
pub const MAX_DIMS: usize = 20;

/// Maximum total element count of a stored array.
pub const MAX_ELEMENTS: usize = 1 << 24;

/// Maximum stored length of the origin tag, in bytes.
pub const ORIGIN_LENGTH: usize = 80;

/// Join `table` and `key` into an aggregated id.
pub fn aggregate_id(table: &str, key: &str) -> String {
    if table.is_empty() {
        key.to_string()
    } else if key.is_empty() {
        table.to_string()
    } else {
        format!("{}{}{}", table, SEP, key)
    }
}

/// Split an aggregated id at its last separator into `(table, key)`.
pub fn split_id(id: &str) -> Option<(&str, &str)> {
    id.rfind(SEP).map(|i| (&id[..i], &id[i + SEP.len()..]))
}

/// Primitive type tag of a stored variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Boolean,
    /// 8-bit signed integer.
    Byte,
    /// 16-bit signed integer.
    Short,
    /// 32-bit signed integer.
    Int,
    /// 64-bit signed integer.
    Long,
    Float,
    Double,
    /// Fixed-length character sequence; the element byte length is part of
    /// the type so variable-length input can be fitted without overflow.
    Chars(usize),
    /// Variable-length string.
    Str,
    /// Opaque bytes, stored verbatim.
    Raw,
    /// Nested structure; the stored value is the child's aggregated id.
    Struct,
    Unknown,
}

impl DataType {
    /// The type name used in the `<types>` metadata table.
    pub fn wire_name(&self) -> String {
        match self {
            DataType::Boolean => "boolean".into(),
            DataType::Byte => "int8".into(),
            DataType::Short => "int16".into(),
            DataType::Int => "int32".into(),
            DataType::Long => "int64".into(),
            DataType::Float => "float".into(),
            DataType::Double => "double".into(),
            DataType::Chars(n) => format!("char{}", n),
            DataType::Str => "string".into(),
            DataType::Raw => "raw".into(),
            DataType::Struct => "struct".into(),
            DataType::Unknown => "unknown".into(),
        }
    }

    /// Inverse of [`DataType::wire_name`]; unrecognized names map to
    /// [`DataType::Unknown`].
    pub fn from_wire_name(s: &str) -> DataType {
        match s {
            "boolean" => DataType::Boolean,
            "int8" => DataType::Byte,
            "int16" => DataType::Short,
            "int32" | "int" => DataType::Int,
            "int64" => DataType::Long,
            "float" | "float32" => DataType::Float,
            "double" | "float64" => DataType::Double,
            "string" => DataType::Str,
            "raw" => DataType::Raw,
            "struct" => DataType::Struct,
            _ => match s.strip_prefix("char").and_then(|n| n.parse().ok()) {
                Some(n) => DataType::Chars(n),
                None => DataType::Unknown,
            },
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            DataType::Byte
                | DataType::Short
                | DataType::Int
                | DataType::Long
                | DataType::Float
                | DataType::Double
        )
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.wire_name())
    }
}

/// Dimensions of a stored array. A scalar is a single dimension of size 1;
/// an empty shape means the dimensions are unknown (reset metadata).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn scalar() -> Self {
        Shape(vec![1])
    }

    pub fn empty() -> Self {
        Shape(Vec::new())
    }

    /// A 1-D shape for `count` elements, collapsing to scalar for 1.
    pub fn for_count(count: usize) -> Self {
        Shape(vec![count])
    }

    /// Validated multi-dimensional shape.
    pub fn of(sizes: &[usize]) -> Result<Self> {
        if sizes.is_empty() || sizes.len() > MAX_DIMS {
            return Err(SmaxError::SizeInvalid(format!(
                "dimension count {} out of range 1..={}",
                sizes.len(),
                MAX_DIMS
            )));
        }
        let mut count: usize = 1;
        for &s in sizes {
            if s == 0 {
                return Err(SmaxError::SizeInvalid("zero dimension size".into()));
            }
            count = count.saturating_mul(s);
        }
        if count > MAX_ELEMENTS {
            return Err(SmaxError::SizeInvalid(format!(
                "element count {} exceeds {}",
                count, MAX_ELEMENTS
            )));
        }
        Ok(Shape(sizes.to_vec()))
    }

    /// Parse the space-separated wire form, e.g. `"3 4"`.
    pub fn parse(s: &str) -> Result<Shape> {
        let mut sizes = Vec::new();
        for tok in s.split_ascii_whitespace() {
            let n: usize = tok
                .parse()
                .map_err(|_| SmaxError::Parse(format!("bad dimension: {}", tok)))?;
            sizes.push(n);
        }
        if sizes.is_empty() {
            return Ok(Shape::empty());
        }
        Shape::of(&sizes)
    }

    pub fn ndim(&self) -> usize {
        self.0.len()
    }

    pub fn sizes(&self) -> &[usize] {
        &self.0
    }

    /// Total number of elements, or 0 when the shape is unknown.
    pub fn element_count(&self) -> usize {
        if self.0.is_empty() {
            0
        } else {
            self.0.iter().product()
        }
    }
}

impl fmt::Display for Shape {
    /// The space-separated wire form; scalar renders as `"1"`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("1");
        }
        let mut first = true;
        let mut buf = itoa::Buffer::new();
        for &s in &self.0 {
            if !first {
                f.write_str(" ")?;
            }
            f.write_str(buf.format(s))?;
            first = false;
        }
        Ok(())
    }
}

/// Second + nanosecond wall-clock timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => Timestamp {
                seconds: d.as_secs() as i64,
                nanos: d.subsec_nanos(),
            },
            Err(_) => Timestamp::default(),
        }
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.seconds as f64 + 1e-9 * self.nanos as f64
    }
}

/// Standard metadata attached to every stored variable.
#[derive(Debug, Clone, PartialEq)]
pub struct Metadata {
    /// Type of the variable as stored.
    pub store_type: DataType,
    /// Shape of the data as stored.
    pub shape: Shape,
    /// Total number of serialized bytes stored.
    pub store_bytes: usize,
    /// `<host>:<prog>` of the last writer.
    pub origin: String,
    /// Time of the last write.
    pub timestamp: Timestamp,
    /// Number of times the variable has been written.
    pub serial: u64,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            store_type: DataType::Unknown,
            shape: Shape::empty(),
            store_bytes: 0,
            origin: String::new(),
            timestamp: Timestamp::default(),
            serial: 0,
        }
    }
}

impl Metadata {
    pub fn reset(&mut self) {
        *self = Metadata::default();
    }

    pub fn element_count(&self) -> usize {
        self.shape.element_count()
    }

    /// Set the origin, truncating to the allotted fixed storage.
    pub fn set_origin(&mut self, origin: &str) {
        let mut end = origin.len().min(ORIGIN_LENGTH);
        while !origin.is_char_boundary(end) {
            end -= 1;
        }
        self.origin = origin[..end].to_string();
    }
}

/// A typed, possibly multi-element value.
#[derive(Debug, Clone, PartialEq)]
pub enum SmaxValue {
    Boolean(Vec<bool>),
    Byte(Vec<i8>),
    Short(Vec<i16>),
    Int(Vec<i32>),
    Long(Vec<i64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    Chars { strings: Vec<String>, length: usize },
    Str(Vec<String>),
    Raw(Bytes),
    Struct(SmaxStruct),
}

impl SmaxValue {
    pub fn data_type(&self) -> DataType {
        match self {
            SmaxValue::Boolean(_) => DataType::Boolean,
            SmaxValue::Byte(_) => DataType::Byte,
            SmaxValue::Short(_) => DataType::Short,
            SmaxValue::Int(_) => DataType::Int,
            SmaxValue::Long(_) => DataType::Long,
            SmaxValue::Float(_) => DataType::Float,
            SmaxValue::Double(_) => DataType::Double,
            SmaxValue::Chars { length, .. } => DataType::Chars(*length),
            SmaxValue::Str(_) => DataType::Str,
            SmaxValue::Raw(_) => DataType::Raw,
            SmaxValue::Struct(_) => DataType::Struct,
        }
    }

    /// Number of elements held.
    pub fn len(&self) -> usize {
        match self {
            SmaxValue::Boolean(v) => v.len(),
            SmaxValue::Byte(v) => v.len(),
            SmaxValue::Short(v) => v.len(),
            SmaxValue::Int(v) => v.len(),
            SmaxValue::Long(v) => v.len(),
            SmaxValue::Float(v) => v.len(),
            SmaxValue::Double(v) => v.len(),
            SmaxValue::Chars { strings, .. } => strings.len(),
            SmaxValue::Str(v) => v.len(),
            SmaxValue::Raw(_) | SmaxValue::Struct(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The zero-filled value a pull of a missing variable produces.
    pub fn zeroed(ty: DataType, count: usize) -> SmaxValue {
        match ty {
            DataType::Boolean => SmaxValue::Boolean(vec![false; count]),
            DataType::Byte => SmaxValue::Byte(vec![0; count]),
            DataType::Short => SmaxValue::Short(vec![0; count]),
            DataType::Int | DataType::Unknown => SmaxValue::Int(vec![0; count]),
            DataType::Long => SmaxValue::Long(vec![0; count]),
            DataType::Float => SmaxValue::Float(vec![0.0; count]),
            DataType::Double => SmaxValue::Double(vec![0.0; count]),
            DataType::Chars(n) => SmaxValue::Chars {
                strings: vec![String::new(); count],
                length: n,
            },
            DataType::Str => SmaxValue::Str(vec![String::new(); count]),
            DataType::Raw => SmaxValue::Raw(Bytes::new()),
            DataType::Struct => SmaxValue::Struct(SmaxStruct::new()),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SmaxValue::Boolean(v) => v.first().copied(),
            _ => self.as_i64().map(|n| n != 0),
        }
    }

    /// First element as a 64-bit integer, for any integer-valued type.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SmaxValue::Boolean(v) => v.first().map(|&b| b as i64),
            SmaxValue::Byte(v) => v.first().map(|&n| n as i64),
            SmaxValue::Short(v) => v.first().map(|&n| n as i64),
            SmaxValue::Int(v) => v.first().map(|&n| n as i64),
            SmaxValue::Long(v) => v.first().copied(),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        self.as_i64().map(|n| n as i32)
    }

    /// First element as a double, for any numeric type.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SmaxValue::Float(v) => v.first().map(|&x| x as f64),
            SmaxValue::Double(v) => v.first().copied(),
            _ => self.as_i64().map(|n| n as f64),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SmaxValue::Str(v) => v.first().map(|s| s.as_str()),
            SmaxValue::Chars { strings, .. } => strings.first().map(|s| s.as_str()),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&SmaxStruct> {
        match self {
            SmaxValue::Struct(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_raw(&self) -> Option<&Bytes> {
        match self {
            SmaxValue::Raw(b) => Some(b),
            _ => None,
        }
    }

    /// All elements widened to doubles, for any numeric type.
    pub fn to_f64_vec(&self) -> Option<Vec<f64>> {
        match self {
            SmaxValue::Byte(v) => Some(v.iter().map(|&n| n as f64).collect()),
            SmaxValue::Short(v) => Some(v.iter().map(|&n| n as f64).collect()),
            SmaxValue::Int(v) => Some(v.iter().map(|&n| n as f64).collect()),
            SmaxValue::Long(v) => Some(v.iter().map(|&n| n as f64).collect()),
            SmaxValue::Float(v) => Some(v.iter().map(|&x| x as f64).collect()),
            SmaxValue::Double(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl From<bool> for SmaxValue {
    fn from(v: bool) -> Self {
        SmaxValue::Boolean(vec![v])
    }
}

impl From<i32> for SmaxValue {
    fn from(v: i32) -> Self {
        SmaxValue::Int(vec![v])
    }
}

impl From<i64> for SmaxValue {
    fn from(v: i64) -> Self {
        SmaxValue::Long(vec![v])
    }
}

impl From<f32> for SmaxValue {
    fn from(v: f32) -> Self {
        SmaxValue::Float(vec![v])
    }
}

impl From<f64> for SmaxValue {
    fn from(v: f64) -> Self {
        SmaxValue::Double(vec![v])
    }
}

impl From<&str> for SmaxValue {
    fn from(v: &str) -> Self {
        SmaxValue::Str(vec![v.to_string()])
    }
}

impl From<String> for SmaxValue {
    fn from(v: String) -> Self {
        SmaxValue::Str(vec![v])
    }
}

impl From<Vec<i32>> for SmaxValue {
    fn from(v: Vec<i32>) -> Self {
        SmaxValue::Int(v)
    }
}

impl From<Vec<i64>> for SmaxValue {
    fn from(v: Vec<i64>) -> Self {
        SmaxValue::Long(v)
    }
}

impl From<Vec<f32>> for SmaxValue {
    fn from(v: Vec<f32>) -> Self {
        SmaxValue::Float(v)
    }
}

impl From<Vec<f64>> for SmaxValue {
    fn from(v: Vec<f64>) -> Self {
        SmaxValue::Double(v)
    }
}

impl From<Vec<bool>> for SmaxValue {
    fn from(v: Vec<bool>) -> Self {
        SmaxValue::Boolean(v)
    }
}

impl From<Vec<String>> for SmaxValue {
    fn from(v: Vec<String>) -> Self {
        SmaxValue::Str(v)
    }
}

impl From<Bytes> for SmaxValue {
    fn from(v: Bytes) -> Self {
        SmaxValue::Raw(v)
    }
}

impl From<SmaxStruct> for SmaxValue {
    fn from(v: SmaxStruct) -> Self {
        SmaxValue::Struct(v)
    }
}

/// A named field of a structure.
#[derive(Debug, Clone, PartialEq)]
pub struct SmaxField {
    pub name: String,
    pub value: SmaxValue,
    pub shape: Shape,
}

impl SmaxField {
    /// A field whose shape is derived from the value's element count.
    pub fn new(name: impl Into<String>, value: impl Into<SmaxValue>) -> Self {
        let value = value.into();
        let shape = Shape::for_count(value.len().max(1));
        Self {
            name: name.into(),
            value,
            shape,
        }
    }

    pub fn with_shape(name: impl Into<String>, value: impl Into<SmaxValue>, shape: Shape) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            shape,
        }
    }
}

/// An ordered collection of named fields; values may be nested structures.
/// Children are owned by their parent, never the other way around.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SmaxStruct {
    fields: Vec<SmaxField>,
}

impl SmaxStruct {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn field(&self, name: &str) -> Option<&SmaxField> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_mut(&mut self, name: &str) -> Option<&mut SmaxField> {
        self.fields.iter_mut().find(|f| f.name == name)
    }

    /// Replace a same-named field, or append.
    pub fn set(&mut self, field: SmaxField) {
        match self.field_mut(&field.name) {
            Some(slot) => *slot = field,
            None => self.fields.push(field),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<SmaxField> {
        let i = self.fields.iter().position(|f| f.name == name)?;
        Some(self.fields.remove(i))
    }

    pub fn fields(&self) -> impl Iterator<Item = &SmaxField> {
        self.fields.iter()
    }

    pub fn fields_mut(&mut self) -> impl Iterator<Item = &mut SmaxField> {
        self.fields.iter_mut()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_and_split_id() {
        assert_eq!(aggregate_id("system", "temp"), "system:temp");
        assert_eq!(split_id("a:b:c"), Some(("a:b", "c")));
        assert_eq!(split_id("plain"), None);
    }

    #[test]
    fn test_type_wire_names_roundtrip() {
        for ty in [
            DataType::Boolean,
            DataType::Byte,
            DataType::Short,
            DataType::Int,
            DataType::Long,
            DataType::Float,
            DataType::Double,
            DataType::Chars(16),
            DataType::Str,
            DataType::Raw,
            DataType::Struct,
        ] {
            assert_eq!(DataType::from_wire_name(&ty.wire_name()), ty);
        }
        assert_eq!(DataType::from_wire_name("whatever"), DataType::Unknown);
    }

    #[test]
    fn test_shape_wire_form() {
        assert_eq!(Shape::scalar().to_string(), "1");
        assert_eq!(Shape::of(&[3, 4]).unwrap().to_string(), "3 4");
        assert_eq!(Shape::parse("3 4").unwrap(), Shape::of(&[3, 4]).unwrap());
        assert_eq!(Shape::parse("3 4").unwrap().element_count(), 12);
    }

    #[test]
    fn test_shape_rejects_zero_and_oversize() {
        assert!(Shape::of(&[0]).is_err());
        assert!(Shape::of(&[MAX_ELEMENTS + 1]).is_err());
        assert!(Shape::of(&vec![2; MAX_DIMS + 1]).is_err());
    }

    #[test]
    fn test_zeroed_values() {
        assert_eq!(
            SmaxValue::zeroed(DataType::Int, 3),
            SmaxValue::Int(vec![0, 0, 0])
        );
        assert_eq!(SmaxValue::zeroed(DataType::Raw, 1), SmaxValue::Raw(Bytes::new()));
    }

    #[test]
    fn test_scalar_accessors() {
        assert_eq!(SmaxValue::from(2022i32).as_i32(), Some(2022));
        assert_eq!(SmaxValue::from(3.5f64).as_f64(), Some(3.5));
        assert_eq!(SmaxValue::from(true).as_bool(), Some(true));
        assert_eq!(SmaxValue::from("hi").as_str(), Some("hi"));
        assert_eq!(SmaxValue::from(7i16 as i32).as_i64(), Some(7));
    }

    #[test]
    fn test_origin_truncation() {
        let mut m = Metadata::default();
        m.set_origin(&"x".repeat(200));
        assert_eq!(m.origin.len(), ORIGIN_LENGTH);
    }

    #[test]
    fn test_struct_set_replaces_by_name() {
        let mut s = SmaxStruct::new();
        s.set(SmaxField::new("a", 1i32));
        s.set(SmaxField::new("b", 2i32));
        s.set(SmaxField::new("a", 3i32));
        assert_eq!(s.len(), 2);
        assert_eq!(s.field("a").unwrap().value.as_i32(), Some(3));
    }
}
