//! Access to the metadata hash tables: stored types, shapes and
//! timestamps, plus the optional static metadata (descriptions, physical
//! units, coordinate systems).

use std::collections::HashMap;

use crate::client::{check_key, check_table};
use crate::codec;
use crate::error::Result;
use crate::types::{aggregate_id, DataType, Shape, Timestamp, MAX_DIMS};
use crate::{
    Smax, COORDS_TABLE, DESCRIPTIONS_TABLE, DIMS_TABLE, TIMESTAMPS_TABLE, TYPES_TABLE,
    UNITS_TABLE,
};

/// One axis of a coordinate system attached to an array variable.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinateAxis {
    /// Coordinate name, e.g. `x` or `time`.
    pub name: String,
    /// Unit name, e.g. `GHz` or `ms`.
    pub unit: String,
    /// Data index at which the reference value is defined.
    pub ref_index: f64,
    /// Coordinate value at the reference index.
    pub ref_value: f64,
    /// Coordinate step between consecutive data.
    pub step: f64,
}

impl Default for CoordinateAxis {
    fn default() -> Self {
        Self {
            name: String::new(),
            unit: String::new(),
            ref_index: 0.0,
            ref_value: 0.0,
            step: 1.0,
        }
    }
}

/// A coordinate system: one axis per data dimension.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoordinateSystem {
    pub axes: Vec<CoordinateAxis>,
}

impl Smax {
    /// Set an entry in an arbitrary metadata hash table for `(table, key)`.
    pub async fn push_meta(
        &self,
        meta_table: &str,
        table: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        check_table(table)?;
        check_key(key)?;
        let id = aggregate_id(table, key);
        let _: i64 = self
            .interactive_query(redis::cmd("HSET").arg(meta_table).arg(id).arg(value))
            .await?;
        Ok(())
    }

    /// Read an entry from an arbitrary metadata hash table.
    pub async fn pull_meta(
        &self,
        meta_table: &str,
        table: &str,
        key: &str,
    ) -> Result<Option<String>> {
        check_table(table)?;
        check_key(key)?;
        let id = aggregate_id(table, key);
        self.interactive_query(redis::cmd("HGET").arg(meta_table).arg(id))
            .await
    }

    /// Last-write time of a variable, or `None` if never written.
    pub async fn pull_time(&self, table: &str, key: &str) -> Result<Option<Timestamp>> {
        let s = self.pull_meta(TIMESTAMPS_TABLE, table, key).await?;
        Ok(s.as_deref().and_then(codec::parse_timestamp))
    }

    /// Stored type and shape of a variable; unknown type and empty shape if
    /// the variable has no metadata.
    pub async fn pull_type_dimension(&self, table: &str, key: &str) -> Result<(DataType, Shape)> {
        let ty = self
            .pull_meta(TYPES_TABLE, table, key)
            .await?
            .map(|s| DataType::from_wire_name(&s))
            .unwrap_or(DataType::Unknown);

        let shape = self
            .pull_meta(DIMS_TABLE, table, key)
            .await?
            .and_then(|s| Shape::parse(&s).ok())
            .unwrap_or_else(Shape::empty);

        Ok((ty, shape))
    }

    /// Attach a human-readable description to a variable.
    pub async fn set_description(&self, table: &str, key: &str, description: &str) -> Result<()> {
        self.push_meta(DESCRIPTIONS_TABLE, table, key, description)
            .await
    }

    pub async fn get_description(&self, table: &str, key: &str) -> Result<Option<String>> {
        self.pull_meta(DESCRIPTIONS_TABLE, table, key).await
    }

    /// Attach a physical unit name, e.g. `"W / Hz"`.
    pub async fn set_units(&self, table: &str, key: &str, unit: &str) -> Result<()> {
        self.push_meta(UNITS_TABLE, table, key, unit).await
    }

    pub async fn get_units(&self, table: &str, key: &str) -> Result<Option<String>> {
        self.pull_meta(UNITS_TABLE, table, key).await
    }

    fn coords_axis_id(table: &str, key: &str, n: usize) -> String {
        format!(
            "{}:{}:{}",
            COORDS_TABLE,
            aggregate_id(table, key),
            n + 1
        )
    }

    /// Define the `n`'th (0-based) coordinate axis for an array variable.
    pub async fn set_coordinate_axis(
        &self,
        table: &str,
        key: &str,
        n: usize,
        axis: &CoordinateAxis,
    ) -> Result<()> {
        check_table(table)?;
        check_key(key)?;

        let id = Self::coords_axis_id(table, key, n);
        let mut buf = ryu::Buffer::new();
        let mut cmd = redis::cmd("HSET");
        cmd.arg(&id)
            .arg("name")
            .arg(&axis.name)
            .arg("unit")
            .arg(&axis.unit)
            .arg("refIndex")
            .arg(buf.format(axis.ref_index).to_string())
            .arg("refValue")
            .arg(buf.format(axis.ref_value).to_string())
            .arg("step")
            .arg(buf.format(axis.step).to_string());
        let _: i64 = self.interactive_query(&cmd).await?;
        Ok(())
    }

    /// Read the `n`'th (0-based) coordinate axis, or `None` if undefined.
    pub async fn get_coordinate_axis(
        &self,
        table: &str,
        key: &str,
        n: usize,
    ) -> Result<Option<CoordinateAxis>> {
        check_table(table)?;
        check_key(key)?;

        let id = Self::coords_axis_id(table, key, n);
        let fields: HashMap<String, String> = self
            .interactive_query(redis::cmd("HGETALL").arg(&id))
            .await?;
        if fields.is_empty() {
            return Ok(None);
        }

        let mut axis = CoordinateAxis::default();
        if let Some(name) = fields.get("name") {
            axis.name = name.clone();
        }
        if let Some(unit) = fields.get("unit") {
            axis.unit = unit.clone();
        }
        if let Some(v) = fields.get("refIndex").and_then(|s| s.parse().ok()) {
            axis.ref_index = v;
        }
        if let Some(v) = fields.get("refValue").and_then(|s| s.parse().ok()) {
            axis.ref_value = v;
        }
        if let Some(v) = fields.get("step").and_then(|s| s.parse::<f64>().ok()) {
            if v != 0.0 {
                axis.step = v;
            }
        }
        Ok(Some(axis))
    }

    /// Store the full coordinate system for an array variable.
    pub async fn set_coordinate_system(
        &self,
        table: &str,
        key: &str,
        system: &CoordinateSystem,
    ) -> Result<()> {
        for (n, axis) in system.axes.iter().enumerate() {
            self.set_coordinate_axis(table, key, n, axis).await?;
        }
        Ok(())
    }

    /// Read back the coordinate system, axis by axis until one is missing.
    pub async fn get_coordinate_system(
        &self,
        table: &str,
        key: &str,
    ) -> Result<Option<CoordinateSystem>> {
        let mut axes = Vec::new();
        for n in 0..MAX_DIMS {
            match self.get_coordinate_axis(table, key, n).await? {
                Some(axis) => axes.push(axis),
                None => break,
            }
        }
        if axes.is_empty() {
            return Ok(None);
        }
        Ok(Some(CoordinateSystem { axes }))
    }
}
