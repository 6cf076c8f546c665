//! Remote column model and its mapping onto Arrow arrays.
//!
//! The remote service stores tables as a fixed, ordered list of typed
//! columns. [`ColumnDescriptor`] describes one column, [`ColumnValues`] carries
//! a window of its values, and the conversion helpers here translate both to
//! and from Arrow so the fetch and push engines can work with `RecordBatch`es.

use std::{collections::HashMap, fmt, sync::Arc};

use arrow::{
    array::{Array, ArrayRef, AsArray, BooleanArray, Float64Array, Int64Array, StringArray},
    compute::cast,
    datatypes::{DataType, Field, Float64Type, Int64Type},
    error::ArrowError,
};
use snafu::prelude::*;

use crate::entity::EntityKind;

/// Field metadata key recording the referenced entity kind of an
/// [`ColumnKind::EntityRef`] column once converted to Arrow.
pub const ENTITY_KIND_METADATA_KEY: &str = "tablebridge.entity_kind";

/// Field metadata key recording the declared width of a text column.
pub const TEXT_WIDTH_METADATA_KEY: &str = "tablebridge.max_len";

/// Type of a remote column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnKind {
    /// 64-bit signed integers.
    Int64,
    /// 64-bit floats.
    Float64,
    /// Fixed-width text; `max_len` is fixed at table creation.
    Text {
        /// Maximum string length in characters.
        max_len: usize,
    },
    /// Booleans.
    Bool,
    /// Integer identifiers of another remote object.
    EntityRef(EntityKind),
}

impl ColumnKind {
    /// Arrow type used for values of this kind.
    pub fn arrow_type(&self) -> DataType {
        match self {
            ColumnKind::Int64 | ColumnKind::EntityRef(_) => DataType::Int64,
            ColumnKind::Float64 => DataType::Float64,
            ColumnKind::Text { .. } => DataType::Utf8,
            ColumnKind::Bool => DataType::Boolean,
        }
    }
}

impl fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnKind::Int64 => write!(f, "Int64"),
            ColumnKind::Float64 => write!(f, "Float64"),
            ColumnKind::Text { max_len } => write!(f, "Text({max_len})"),
            ColumnKind::Bool => write!(f, "Bool"),
            ColumnKind::EntityRef(kind) => write!(f, "EntityRef({kind})"),
        }
    }
}

/// One column of a remote table schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    /// Column name. Uniqueness is not enforced.
    pub name: String,
    /// Column type.
    pub kind: ColumnKind,
}

impl ColumnDescriptor {
    /// Build a descriptor.
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    /// Arrow field for this column. Remote columns never hold nulls.
    pub fn to_arrow_field(&self) -> Field {
        let field = Field::new(self.name.clone(), self.kind.arrow_type(), false);
        match self.kind {
            ColumnKind::EntityRef(kind) => field.with_metadata(HashMap::from([(
                ENTITY_KIND_METADATA_KEY.to_string(),
                kind.to_string(),
            )])),
            ColumnKind::Text { max_len } => field.with_metadata(HashMap::from([(
                TEXT_WIDTH_METADATA_KEY.to_string(),
                max_len.to_string(),
            )])),
            _ => field,
        }
    }
}

impl fmt::Display for ColumnDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.kind)
    }
}

/// A run of values for one column.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValues {
    /// Integer (and entity reference) values.
    Int64(Vec<i64>),
    /// Float values; missing values are NaN.
    Float64(Vec<f64>),
    /// Text values; missing values are empty strings.
    Text(Vec<String>),
    /// Boolean values.
    Bool(Vec<bool>),
}

/// Errors converting between Arrow arrays and remote column values.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ColumnConvertError {
    /// A column whose remote type has no null representation contains nulls.
    #[snafu(display("Column {column} ({kind}) contains {count} missing value(s)"))]
    NullValue {
        /// Column name.
        column: String,
        /// Remote column type.
        kind: ColumnKind,
        /// Number of nulls found in the chunk.
        count: usize,
    },

    /// The Arrow values could not be cast to the remote column type.
    #[snafu(display("Cannot convert column {column} to {kind}: {source}"))]
    Cast {
        /// Column name.
        column: String,
        /// Target remote type.
        kind: ColumnKind,
        /// Underlying Arrow error.
        source: ArrowError,
    },

    /// Two value runs of different types were combined.
    #[snafu(display("Column {column} mixes {expected} and {found} values"))]
    Mismatch {
        /// Column name.
        column: String,
        /// Type already buffered.
        expected: &'static str,
        /// Type of the incoming run.
        found: &'static str,
    },
}

impl ColumnValues {
    /// Number of values.
    pub fn len(&self) -> usize {
        match self {
            ColumnValues::Int64(v) => v.len(),
            ColumnValues::Float64(v) => v.len(),
            ColumnValues::Text(v) => v.len(),
            ColumnValues::Bool(v) => v.len(),
        }
    }

    /// True when there are no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn type_name(&self) -> &'static str {
        match self {
            ColumnValues::Int64(_) => "Int64",
            ColumnValues::Float64(_) => "Float64",
            ColumnValues::Text(_) => "Text",
            ColumnValues::Bool(_) => "Bool",
        }
    }

    /// Empty run matching a column kind.
    pub fn empty_for(kind: ColumnKind) -> Self {
        match kind {
            ColumnKind::Int64 | ColumnKind::EntityRef(_) => ColumnValues::Int64(Vec::new()),
            ColumnKind::Float64 => ColumnValues::Float64(Vec::new()),
            ColumnKind::Text { .. } => ColumnValues::Text(Vec::new()),
            ColumnKind::Bool => ColumnValues::Bool(Vec::new()),
        }
    }

    /// Append `other` to this run. Both runs must hold the same type.
    pub fn extend_from(&mut self, column: &str, other: ColumnValues) -> Result<(), ColumnConvertError> {
        match (self, other) {
            (ColumnValues::Int64(a), ColumnValues::Int64(b)) => a.extend(b),
            (ColumnValues::Float64(a), ColumnValues::Float64(b)) => a.extend(b),
            (ColumnValues::Text(a), ColumnValues::Text(b)) => a.extend(b),
            (ColumnValues::Bool(a), ColumnValues::Bool(b)) => a.extend(b),
            (this, other) => {
                return MismatchSnafu {
                    column,
                    expected: this.type_name(),
                    found: other.type_name(),
                }
                .fail();
            }
        }
        Ok(())
    }

    /// Keep only the first `len` values.
    pub fn truncate(&mut self, len: usize) {
        match self {
            ColumnValues::Int64(v) => v.truncate(len),
            ColumnValues::Float64(v) => v.truncate(len),
            ColumnValues::Text(v) => v.truncate(len),
            ColumnValues::Bool(v) => v.truncate(len),
        }
    }

    /// Convert into an Arrow array.
    pub fn into_array(self) -> ArrayRef {
        match self {
            ColumnValues::Int64(v) => Arc::new(Int64Array::from(v)),
            ColumnValues::Float64(v) => Arc::new(Float64Array::from(v)),
            ColumnValues::Text(v) => Arc::new(StringArray::from(v)),
            ColumnValues::Bool(v) => Arc::new(BooleanArray::from(v)),
        }
    }

    /// Convert an Arrow array into values for a remote column of `kind`.
    ///
    /// Missing text becomes `""` and missing floats become NaN; the remote
    /// integer and boolean types cannot store a missing value, so nulls there
    /// are rejected.
    pub fn from_array(
        column: &str,
        kind: ColumnKind,
        array: &dyn Array,
    ) -> Result<Self, ColumnConvertError> {
        let target = kind.arrow_type();
        let casted = cast(array, &target).context(CastSnafu { column, kind })?;

        match kind {
            ColumnKind::Float64 => {
                let values = casted.as_primitive::<Float64Type>();
                Ok(ColumnValues::Float64(
                    values.iter().map(|v| v.unwrap_or(f64::NAN)).collect(),
                ))
            }
            ColumnKind::Text { .. } => {
                let values = casted.as_string::<i32>();
                Ok(ColumnValues::Text(
                    values.iter().map(|v| v.unwrap_or("").to_string()).collect(),
                ))
            }
            ColumnKind::Int64 | ColumnKind::EntityRef(_) => {
                ensure_no_nulls(column, kind, casted.as_ref())?;
                let values = casted.as_primitive::<Int64Type>();
                Ok(ColumnValues::Int64(values.values().to_vec()))
            }
            ColumnKind::Bool => {
                ensure_no_nulls(column, kind, casted.as_ref())?;
                let values = casted.as_boolean();
                Ok(ColumnValues::Bool(values.iter().map(|v| v.unwrap_or(false)).collect()))
            }
        }
    }
}

fn ensure_no_nulls(column: &str, kind: ColumnKind, array: &dyn Array) -> Result<(), ColumnConvertError> {
    let count = array.null_count();
    ensure!(count == 0, NullValueSnafu { column, kind, count });
    Ok(())
}

/// Values of one column as returned by, or sent to, the remote service.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnData {
    /// Column name.
    pub name: String,
    /// Column values.
    pub values: ColumnValues,
}

impl ColumnData {
    /// Build a column run.
    pub fn new(name: impl Into<String>, values: ColumnValues) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }
}

/// Result of one remote read: column values plus the row numbers the server
/// reports for them.
///
/// The row numbers may be sparse and may not match the value count; callers
/// must not assume either list is the length of the request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkData {
    /// Returned columns, in the requested order.
    pub columns: Vec<ColumnData>,
    /// Row numbers reported by the server for this window.
    pub row_numbers: Vec<u64>,
}

impl ChunkData {
    /// Number of values delivered (length of the first column).
    pub fn value_count(&self) -> usize {
        self.columns.first().map_or(0, |c| c.values.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int32Array, UInt16Array};

    #[test]
    fn text_nulls_become_empty_strings() {
        let arr = StringArray::from(vec![Some("a"), None, Some("ccc")]);
        let values =
            ColumnValues::from_array("name", ColumnKind::Text { max_len: 3 }, &arr).unwrap();
        assert_eq!(
            values,
            ColumnValues::Text(vec!["a".to_string(), String::new(), "ccc".to_string()])
        );
    }

    #[test]
    fn float_nulls_become_nan() {
        let arr = Float64Array::from(vec![Some(1.5), None]);
        let ColumnValues::Float64(values) =
            ColumnValues::from_array("x", ColumnKind::Float64, &arr).unwrap()
        else {
            panic!("expected floats");
        };
        assert_eq!(values[0], 1.5);
        assert!(values[1].is_nan());
    }

    #[test]
    fn integer_nulls_are_rejected() {
        let arr = Int32Array::from(vec![Some(1), None, None]);
        let err = ColumnValues::from_array("id", ColumnKind::Int64, &arr).unwrap_err();
        assert!(matches!(err, ColumnConvertError::NullValue { count: 2, .. }));
    }

    #[test]
    fn narrow_integers_widen_to_int64() {
        let arr = UInt16Array::from(vec![1, 2, 65535]);
        let values = ColumnValues::from_array(
            "image",
            ColumnKind::EntityRef(EntityKind::Image),
            &arr,
        )
        .unwrap();
        assert_eq!(values, ColumnValues::Int64(vec![1, 2, 65535]));
    }

    #[test]
    fn extend_rejects_mixed_types() {
        let mut a = ColumnValues::Int64(vec![1]);
        let err = a
            .extend_from("c", ColumnValues::Text(vec!["x".into()]))
            .unwrap_err();
        assert!(matches!(err, ColumnConvertError::Mismatch { .. }));
    }

    #[test]
    fn entity_columns_record_kind_in_field_metadata() {
        let field =
            ColumnDescriptor::new("well", ColumnKind::EntityRef(EntityKind::Well)).to_arrow_field();
        assert_eq!(field.data_type(), &DataType::Int64);
        assert_eq!(
            field.metadata().get(ENTITY_KIND_METADATA_KEY).map(String::as_str),
            Some("Well")
        );
    }
}
