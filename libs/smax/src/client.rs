//! The atomic value + metadata exchange protocol.
//!
//! Writes go through the `HSetWithMeta` / `HMSetWithMeta` server scripts so
//! that value, metadata and update notification are one transaction; reads
//! use `HGetWithMeta` (or plain `HGET` when no metadata is wanted) and
//! `GetStruct` for whole structures.

use redis::Value;
use tracing::debug;

use crate::codec;
use crate::error::{Result, SmaxError};
use crate::scripts::Script;
use crate::types::{
    aggregate_id, DataType, Metadata, Shape, SmaxField, SmaxStruct, SmaxValue, MAX_ELEMENTS,
};
use crate::Smax;

/// A single read of `(group, key)` as `count` elements of `ty`.
#[derive(Debug, Clone)]
pub(crate) struct ReadRequest {
    /// Hash table name, or the aggregated id for whole-structure reads.
    pub group: String,
    /// Field name; `None` for whole-structure reads.
    pub key: Option<String>,
    pub ty: DataType,
    pub count: usize,
    pub with_meta: bool,
}

impl ReadRequest {
    pub(crate) fn new(table: &str, key: &str, ty: DataType, count: usize, with_meta: bool) -> Result<Self> {
        if ty == DataType::Struct {
            // Structures are retrieved the same no matter how the name is
            // split into group + key.
            return Ok(ReadRequest {
                group: aggregate_id(table, key),
                key: None,
                ty,
                count: 1,
                with_meta,
            });
        }
        check_table(table)?;
        check_key(key)?;
        let count = if ty == DataType::Raw { 1 } else { count };
        if count == 0 || count > MAX_ELEMENTS {
            return Err(SmaxError::SizeInvalid(format!("invalid count: {}", count)));
        }
        Ok(ReadRequest {
            group: table.to_string(),
            key: Some(key.to_string()),
            ty,
            count,
            with_meta,
        })
    }
}

pub(crate) fn check_table(table: &str) -> Result<()> {
    if table.is_empty() {
        return Err(SmaxError::invalid("table is empty"));
    }
    Ok(())
}

pub(crate) fn check_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(SmaxError::invalid("key is empty"));
    }
    Ok(())
}

fn as_text(v: &Value) -> Option<String> {
    match v {
        Value::BulkString(b) => Some(String::from_utf8_lossy(b).into_owned()),
        Value::SimpleString(s) => Some(s.clone()),
        Value::Int(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_array(v: Value) -> Result<Vec<Value>> {
    match v {
        Value::Array(items) => Ok(items),
        other => Err(SmaxError::Parse(format!(
            "expected array reply, got {:?}",
            other
        ))),
    }
}

/// Fill metadata from the `[value, type, dims, timestamp, origin, serial]`
/// reply components, starting at `parts[1]`.
fn fill_meta(meta: &mut Metadata, parts: &[Value]) {
    if let Some(Value::BulkString(b)) = parts.first() {
        meta.store_bytes = b.len();
    }
    if let Some(s) = parts.get(1).and_then(as_text) {
        meta.store_type = DataType::from_wire_name(&s);
    }
    if let Some(s) = parts.get(2).and_then(as_text) {
        if let Ok(shape) = Shape::parse(&s) {
            meta.shape = shape;
        }
    }
    if let Some(s) = parts.get(3).and_then(as_text) {
        if let Some(t) = codec::parse_timestamp(&s) {
            meta.timestamp = t;
        }
    }
    if let Some(s) = parts.get(4).and_then(as_text) {
        meta.set_origin(&s);
    }
    if let Some(s) = parts.get(5).and_then(as_text) {
        meta.serial = s.trim().parse().unwrap_or(0);
    }
}

/// Decode a read reply into the requested value and metadata. A `nil`
/// reply (missing variable) yields a zero-filled value and reset metadata.
pub(crate) fn decode_read_reply(req: &ReadRequest, reply: Value) -> Result<(SmaxValue, Metadata)> {
    let mut meta = Metadata::default();

    match reply {
        Value::Nil => Ok((SmaxValue::zeroed(req.ty, req.count), meta)),
        Value::BulkString(data) => {
            meta.store_bytes = data.len();
            let value = codec::deserialize_value(&data, req.ty, req.count)?;
            Ok((value, meta))
        }
        Value::Array(parts) => {
            if req.ty == DataType::Struct {
                let (s, meta) = parse_struct_reply(&req.group, parts)?;
                return Ok((SmaxValue::Struct(s), meta));
            }
            fill_meta(&mut meta, &parts);
            let value = match parts.first() {
                Some(Value::BulkString(data)) => {
                    codec::deserialize_value(data, req.ty, req.count)?
                }
                _ => SmaxValue::zeroed(req.ty, req.count),
            };
            Ok((value, meta))
        }
        other => Err(SmaxError::Parse(format!(
            "unexpected read reply: {:?}",
            other
        ))),
    }
}

struct ParsedField {
    name: String,
    ty: DataType,
    shape: Shape,
    raw: Vec<u8>,
}

/// Decode the recursive `GetStruct` reply:
/// `[names, fields₁, data₁, fields₂, data₂, …]` with each `dataᵢ` holding
/// six arrays parallel to `fieldsᵢ`.
fn parse_struct_reply(requested: &str, items: Vec<Value>) -> Result<(SmaxStruct, Metadata)> {
    let mut items = items.into_iter();

    let names: Vec<String> = as_array(items.next().ok_or_else(|| {
        SmaxError::NameInvalid(requested.to_string())
    })?)?
    .iter()
    .filter_map(as_text)
    .collect();

    if names.is_empty() {
        return Err(SmaxError::NameInvalid(requested.to_string()));
    }

    let mut meta = Metadata {
        store_type: DataType::Struct,
        shape: Shape::scalar(),
        ..Metadata::default()
    };

    let mut parts: Vec<Option<Vec<ParsedField>>> = Vec::with_capacity(names.len());

    for name in &names {
        let field_names: Vec<String> = as_array(
            items
                .next()
                .ok_or_else(|| SmaxError::Parse(format!("truncated reply for {}", name)))?,
        )?
        .iter()
        .filter_map(as_text)
        .collect();

        let data = as_array(
            items
                .next()
                .ok_or_else(|| SmaxError::Parse(format!("truncated reply for {}", name)))?,
        )?;
        if data.len() != 6 {
            return Err(SmaxError::Parse(format!(
                "expected 6 data columns, got {}",
                data.len()
            )));
        }

        let mut columns = Vec::with_capacity(6);
        for col in data {
            let col = as_array(col)?;
            if col.len() != field_names.len() {
                return Err(SmaxError::Parse("ragged struct data columns".into()));
            }
            columns.push(col);
        }

        let mut fields = Vec::with_capacity(field_names.len());
        for (i, fname) in field_names.iter().enumerate() {
            let ty = columns[1]
                .get(i)
                .and_then(as_text)
                .map(|s| DataType::from_wire_name(&s))
                .unwrap_or(DataType::Unknown);
            let shape = columns[2]
                .get(i)
                .and_then(as_text)
                .and_then(|s| Shape::parse(&s).ok())
                .unwrap_or_else(Shape::scalar);
            let raw = match columns[0].get(i) {
                Some(Value::BulkString(b)) => b.clone(),
                _ => Vec::new(),
            };

            // The structure metadata reflects the most recently written
            // field among the whole fetched set.
            if let Some(ts) = columns[3]
                .get(i)
                .and_then(as_text)
                .and_then(|s| codec::parse_timestamp(&s))
            {
                if ts.as_secs_f64() > meta.timestamp.as_secs_f64() {
                    meta.timestamp = ts;
                    if let Some(origin) = columns[4].get(i).and_then(as_text) {
                        meta.set_origin(&origin);
                    }
                    if let Some(serial) = columns[5].get(i).and_then(as_text) {
                        meta.serial = serial.trim().parse().unwrap_or(0);
                    }
                }
            }

            fields.push(ParsedField {
                name: fname.clone(),
                ty,
                shape,
                raw,
            });
        }
        parts.push(Some(fields));
    }

    let top = names
        .iter()
        .position(|n| n.as_str() == requested)
        .unwrap_or(0);

    let s = assemble_struct(top, &mut parts, &names)?;
    Ok((s, meta))
}

/// Build a structure from its parsed fields, recursively linking nested
/// struct fields (whose values carry child aggregated ids) to the matching
/// returned substructure. Unmatched children become empty structures, and
/// each substructure is consumed at most once, so reference cycles in the
/// stored data cannot recurse.
fn assemble_struct(
    idx: usize,
    parts: &mut Vec<Option<Vec<ParsedField>>>,
    names: &[String],
) -> Result<SmaxStruct> {
    let fields = parts[idx].take().unwrap_or_default();
    let mut s = SmaxStruct::new();

    for f in fields {
        if f.ty == DataType::Struct {
            let child_id = String::from_utf8_lossy(&f.raw).trim().to_string();
            let value = match names.iter().position(|n| *n == child_id) {
                Some(k) if parts[k].is_some() => {
                    SmaxValue::Struct(assemble_struct(k, parts, names)?)
                }
                _ => codec::empty_struct(),
            };
            s.set(SmaxField::with_shape(f.name, value, Shape::scalar()));
        } else {
            let count = f.shape.element_count().max(1);
            let value = codec::deserialize_value(&f.raw, f.ty, count)?;
            s.set(SmaxField::with_shape(f.name, value, f.shape));
        }
    }
    Ok(s)
}

impl Smax {
    /// Build the command for a read request: `GetStruct` for structures,
    /// `HGetWithMeta` when metadata is wanted, plain `HGET` otherwise.
    pub(crate) fn read_command(&self, req: &ReadRequest) -> Result<redis::Cmd> {
        let mut cmd;
        if req.ty == DataType::Struct {
            cmd = redis::cmd("EVALSHA");
            cmd.arg(self.inner.scripts.sha(Script::GetStruct)?)
                .arg(1)
                .arg(&req.group);
        } else if req.with_meta {
            cmd = redis::cmd("EVALSHA");
            cmd.arg(self.inner.scripts.sha(Script::HGetWithMeta)?)
                .arg(1)
                .arg(&req.group)
                .arg(req.key.as_deref().unwrap_or_default());
        } else {
            cmd = redis::cmd("HGET");
            cmd.arg(&req.group).arg(req.key.as_deref().unwrap_or_default());
        }
        Ok(cmd)
    }

    /// Classify and escalate a failure: script-missing and transmit errors
    /// kick the reconnect supervisor.
    pub(crate) fn escalate(&self, e: SmaxError) -> SmaxError {
        if e.is_script_missing() {
            self.inner.supervisor.script_error(self);
        } else if e.is_no_service() {
            self.inner.supervisor.transmit_error(self);
        }
        e
    }

    pub(crate) async fn interactive_query<T: redis::FromRedisValue>(
        &self,
        cmd: &redis::Cmd,
    ) -> Result<T> {
        match self.inner.driver.request::<T>(cmd).await {
            Ok(v) => Ok(v),
            Err(e) => Err(self.escalate(e.into())),
        }
    }

    async fn read_interactive(&self, req: &ReadRequest) -> Result<(SmaxValue, Metadata)> {
        let cmd = self.read_command(req).map_err(|e| self.escalate(e))?;
        let reply: Value = self.interactive_query(&cmd).await?;
        decode_read_reply(req, reply)
    }

    /// Pull a variable over the interactive channel as `count` elements of
    /// `ty`. A missing variable yields a zero-filled value.
    pub async fn pull(
        &self,
        table: &str,
        key: &str,
        ty: DataType,
        count: usize,
    ) -> Result<SmaxValue> {
        let req = ReadRequest::new(table, key, ty, count, false)?;
        Ok(self.read_interactive(&req).await?.0)
    }

    /// Like [`Smax::pull`], also returning the stored metadata.
    pub async fn pull_with_meta(
        &self,
        table: &str,
        key: &str,
        ty: DataType,
        count: usize,
    ) -> Result<(SmaxValue, Metadata)> {
        let req = ReadRequest::new(table, key, ty, count, true)?;
        self.read_interactive(&req).await
    }

    /// Pull a whole structure, including nested substructures, by its
    /// aggregated id. The metadata reflects the most recently updated field.
    pub async fn pull_struct(&self, id: &str) -> Result<(SmaxStruct, Metadata)> {
        check_table(id)?;
        let req = ReadRequest::new(id, "", DataType::Struct, 1, true)?;
        match self.read_interactive(&req).await? {
            (SmaxValue::Struct(s), meta) => Ok((s, meta)),
            _ => Err(SmaxError::Parse("structure reply without structure".into())),
        }
    }

    /// Share a scalar or 1-D value under `table:key`, atomically with its
    /// metadata and an update notification.
    pub async fn share(
        &self,
        table: &str,
        key: &str,
        value: impl Into<SmaxValue>,
    ) -> Result<()> {
        let value = value.into();
        let shape = Shape::for_count(value.len());
        self.share_field(table, &SmaxField::with_shape(key, value, shape))
            .await
    }

    /// Share a multi-dimensional array in a single atomic transaction.
    pub async fn share_array(
        &self,
        table: &str,
        key: &str,
        value: impl Into<SmaxValue>,
        shape: Shape,
    ) -> Result<()> {
        self.share_field(table, &SmaxField::with_shape(key, value, shape))
            .await
    }

    /// Share a field, which may hold any type including a structure.
    ///
    /// In resilient mode a transmit failure stores the field locally; it is
    /// flushed when the connection returns.
    pub async fn share_field(&self, table: &str, field: &SmaxField) -> Result<()> {
        check_table(table)?;
        check_key(&field.name)?;

        if let SmaxValue::Struct(s) = &field.value {
            let id = aggregate_id(table, &field.name);
            return self.share_struct(&id, s).await;
        }

        let count = field.shape.element_count();
        if count == 0 || count > MAX_ELEMENTS {
            return Err(SmaxError::SizeInvalid(format!("invalid count: {}", count)));
        }
        if field.value.data_type() != DataType::Raw && field.value.len() != count {
            return Err(SmaxError::SizeInvalid(format!(
                "value holds {} elements, shape says {}",
                field.value.len(),
                count
            )));
        }

        let serialized = codec::serialize_value(&field.value)?;
        let result = self
            .write_serialized(
                table,
                &field.name,
                &serialized[..],
                field.value.data_type(),
                &field.shape,
            )
            .await;

        match result {
            Err(e) if e.is_no_service() && self.inner.supervisor.is_resilient() => {
                debug!(table, key = %field.name, "deferring share to local store");
                self.inner.store.push_field(table, field);
                Ok(())
            }
            other => other,
        }
    }

    /// Execute `HSetWithMeta` for an already-serialized value.
    pub(crate) async fn write_serialized(
        &self,
        table: &str,
        key: &str,
        serialized: &[u8],
        ty: DataType,
        shape: &Shape,
    ) -> Result<()> {
        let sha = self
            .inner
            .scripts
            .sha(Script::HSetWithMeta)
            .map_err(|e| self.escalate(e))?;

        let mut cmd = redis::cmd("EVALSHA");
        cmd.arg(sha)
            .arg(1)
            .arg(table)
            .arg(self.origin())
            .arg(key)
            .arg(serialized)
            .arg(ty.wire_name())
            .arg(shape.to_string());

        let _: Value = self.interactive_query(&cmd).await?;
        Ok(())
    }

    /// Send a structure and all its nested substructures, one atomic
    /// `HMSetWithMeta` per level, holding the interactive channel across the
    /// whole sequence. Children are written before their parents; only the
    /// outermost level notifies parent channels.
    pub async fn share_struct(&self, id: &str, s: &SmaxStruct) -> Result<()> {
        check_table(id)?;
        if s.is_empty() {
            return Ok(());
        }

        let result = self.send_struct_levels(id, s).await;
        match result {
            Err(e) if e.is_no_service() && self.inner.supervisor.is_resilient() => {
                debug!(id, "deferring structure share to local store");
                self.inner.store.push_struct(id, s);
                Ok(())
            }
            other => other,
        }
    }

    async fn send_struct_levels(&self, id: &str, s: &SmaxStruct) -> Result<()> {
        let sha = self
            .inner
            .scripts
            .sha(Script::HMSetWithMeta)
            .map_err(|e| self.escalate(e))?;
        let origin = self.origin();

        // Children first; the outermost level goes last and is the only one
        // that notifies parent channels.
        let mut levels: Vec<(String, &SmaxStruct)> = Vec::new();
        collect_levels(id.to_string(), s, &mut levels);

        let outcome: Result<()> = async {
            let mut guard = self.inner.driver.interactive().await?;
            let last = levels.len() - 1;

            for (i, (level_id, level)) in levels.iter().enumerate() {
                let mut cmd = redis::cmd("EVALSHA");
                cmd.arg(&sha).arg(1).arg(level_id).arg(&origin);

                for f in level.fields() {
                    match &f.value {
                        SmaxValue::Struct(_) => {
                            cmd.arg(&f.name)
                                .arg(aggregate_id(level_id, &f.name))
                                .arg(DataType::Struct.wire_name())
                                .arg("1");
                        }
                        value => {
                            let serialized = codec::serialize_value(value)?;
                            cmd.arg(&f.name)
                                .arg(&serialized[..])
                                .arg(value.data_type().wire_name())
                                .arg(f.shape.to_string());
                        }
                    }
                }
                cmd.arg(if i == last { "T" } else { "F" });

                let _: Value = cmd.query_async(guard.conn()?).await?;
            }
            Ok(())
        }
        .await;

        outcome.map_err(|e| self.escalate(e))
    }

    /// Number of variables stored in a table.
    pub async fn key_count(&self, table: &str) -> Result<i64> {
        check_table(table)?;
        self.interactive_query(redis::cmd("HLEN").arg(table)).await
    }

    /// Snapshot of the key names stored in a table.
    pub async fn get_keys(&self, table: &str) -> Result<Vec<String>> {
        check_table(table)?;
        self.interactive_query(redis::cmd("HKEYS").arg(table)).await
    }
}

/// Post-order traversal of a structure tree: every substructure level,
/// children before parents, each with its aggregated id.
fn collect_levels<'a>(id: String, s: &'a SmaxStruct, out: &mut Vec<(String, &'a SmaxStruct)>) {
    for f in s.fields() {
        if let SmaxValue::Struct(child) = &f.value {
            if !child.is_empty() {
                collect_levels(aggregate_id(&id, &f.name), child, out);
            }
        }
    }
    out.push((id, s));
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn bulk(s: &str) -> Value {
        Value::BulkString(s.as_bytes().to_vec())
    }

    fn req(ty: DataType, count: usize, with_meta: bool) -> ReadRequest {
        ReadRequest::new("_test_", "v", ty, count, with_meta).unwrap()
    }

    #[test]
    fn test_request_validation() {
        assert!(ReadRequest::new("", "v", DataType::Int, 1, false).is_err());
        assert!(ReadRequest::new("t", "", DataType::Int, 1, false).is_err());
        assert!(ReadRequest::new("t", "v", DataType::Int, 0, false).is_err());
        assert!(ReadRequest::new("t", "v", DataType::Int, MAX_ELEMENTS + 1, false).is_err());
    }

    #[test]
    fn test_struct_request_normalizes_to_aggregate_id() {
        let r = ReadRequest::new("sys", "sub", DataType::Struct, 1, true).unwrap();
        assert_eq!(r.group, "sys:sub");
        assert!(r.key.is_none());
    }

    #[test]
    fn test_nil_reply_zero_fills() {
        let (v, m) = decode_read_reply(&req(DataType::Int, 3, true), Value::Nil).unwrap();
        assert_eq!(v, SmaxValue::Int(vec![0, 0, 0]));
        assert_eq!(m, Metadata::default());
    }

    #[test]
    fn test_plain_value_reply() {
        let (v, _) = decode_read_reply(&req(DataType::Int, 1, false), bulk("2022")).unwrap();
        assert_eq!(v.as_i32(), Some(2022));
    }

    #[test]
    fn test_meta_reply_fills_metadata() {
        let reply = Value::Array(vec![
            bulk("1 2 3"),
            bulk("int32"),
            bulk("3"),
            bulk("1650000000.500000"),
            bulk("hal9000:monitor"),
            bulk("42"),
        ]);
        let (v, m) = decode_read_reply(&req(DataType::Int, 3, true), reply).unwrap();
        assert_eq!(v, SmaxValue::Int(vec![1, 2, 3]));
        assert_eq!(m.store_type, DataType::Int);
        assert_eq!(m.shape.sizes(), &[3]);
        assert_eq!(m.origin, "hal9000:monitor");
        assert_eq!(m.serial, 42);
        assert_eq!(m.store_bytes, 5);
        assert_eq!(m.timestamp.seconds, 1650000000);
    }

    #[test]
    fn test_struct_reply_links_children() {
        // system:sub nested under system; field "sub" carries the child id.
        let reply = vec![
            Value::Array(vec![bulk("system"), bulk("system:sub")]),
            // fields of "system"
            Value::Array(vec![bulk("a"), bulk("sub")]),
            Value::Array(vec![
                Value::Array(vec![bulk("1"), bulk("system:sub")]),
                Value::Array(vec![bulk("int32"), bulk("struct")]),
                Value::Array(vec![bulk("1"), bulk("1")]),
                Value::Array(vec![bulk("100.0"), bulk("200.0")]),
                Value::Array(vec![bulk("h:p"), bulk("h:p")]),
                Value::Array(vec![bulk("1"), bulk("2")]),
            ]),
            // fields of "system:sub"
            Value::Array(vec![bulk("b")]),
            Value::Array(vec![
                Value::Array(vec![bulk("2.5")]),
                Value::Array(vec![bulk("double")]),
                Value::Array(vec![bulk("1")]),
                Value::Array(vec![bulk("300.0")]),
                Value::Array(vec![bulk("h:q")]),
                Value::Array(vec![bulk("7")]),
            ]),
        ];

        let (s, meta) = parse_struct_reply("system", reply).unwrap();
        assert_eq!(s.field("a").unwrap().value.as_i32(), Some(1));

        let sub = s.field("sub").unwrap().value.as_struct().unwrap();
        assert_eq!(sub.field("b").unwrap().value.as_f64(), Some(2.5));

        // Metadata reflects the most recently written field of the set.
        assert_eq!(meta.timestamp.seconds, 300);
        assert_eq!(meta.origin, "h:q");
        assert_eq!(meta.serial, 7);
        assert_eq!(meta.store_type, DataType::Struct);
    }

    #[test]
    fn test_struct_reply_orphan_child_becomes_empty() {
        let reply = vec![
            Value::Array(vec![bulk("top")]),
            Value::Array(vec![bulk("ghost")]),
            Value::Array(vec![
                Value::Array(vec![bulk("top:gone")]),
                Value::Array(vec![bulk("struct")]),
                Value::Array(vec![bulk("1")]),
                Value::Array(vec![bulk("1.0")]),
                Value::Array(vec![bulk("h:p")]),
                Value::Array(vec![bulk("1")]),
            ]),
        ];
        let (s, _) = parse_struct_reply("top", reply).unwrap();
        let ghost = s.field("ghost").unwrap().value.as_struct().unwrap();
        assert!(ghost.is_empty());
    }

    #[test]
    fn test_collect_levels_children_first() {
        let mut inner = SmaxStruct::new();
        inner.set(SmaxField::new("x", 1i32));
        let mut outer = SmaxStruct::new();
        outer.set(SmaxField::new("sub", SmaxValue::Struct(inner)));

        let mut levels = Vec::new();
        collect_levels("top".into(), &outer, &mut levels);
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0].0, "top:sub");
        assert_eq!(levels[1].0, "top");
    }
}
