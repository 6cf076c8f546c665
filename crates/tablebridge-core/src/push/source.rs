//! Local tabular sources that can be pushed to a remote table.

use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::Arc,
};

use arrow::{
    datatypes::{DataType, Field, Schema, SchemaRef},
    record_batch::RecordBatch,
};
use arrow_csv::{ReaderBuilder, reader::Format};
use snafu::prelude::*;

use crate::push::error::{OpenSnafu, SchemaError, SourceSnafu};

/// Chunks produced by a [`TableSource`], in source order.
pub type ChunkIter<'a> = Box<dyn Iterator<Item = Result<RecordBatch, SchemaError>> + Send + 'a>;

/// A local table that can be scanned more than once.
///
/// Inference reads a source up to twice (a type scan and a text width scan)
/// and the transfer reads it once more, so every call to
/// [`TableSource::chunks`] restarts from the first row.
pub trait TableSource: Send {
    /// Short human-readable name, used in logs and errors.
    fn describe(&self) -> String;

    /// Row count, when known without scanning.
    fn total_rows(&self) -> Option<u64>;

    /// True when all rows are already in memory.
    fn is_materialized(&self) -> bool;

    /// Arrow schema of the source. Streaming sources infer it from the first
    /// `scan_rows` records.
    fn schema(&mut self, scan_rows: usize) -> Result<SchemaRef, SchemaError>;

    /// Iterate the whole source in chunks of at most `chunk_size` rows.
    fn chunks(&mut self, chunk_size: usize) -> Result<ChunkIter<'_>, SchemaError>;
}

/// An in-memory batch.
#[derive(Debug, Clone)]
pub struct BatchSource {
    name: String,
    batch: RecordBatch,
}

impl BatchSource {
    /// Wrap `batch`.
    pub fn new(batch: RecordBatch) -> Self {
        Self {
            name: "in-memory batch".to_string(),
            batch,
        }
    }

    /// Use `name` in logs and errors.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl TableSource for BatchSource {
    fn describe(&self) -> String {
        self.name.clone()
    }

    fn total_rows(&self) -> Option<u64> {
        Some(self.batch.num_rows() as u64)
    }

    fn is_materialized(&self) -> bool {
        true
    }

    fn schema(&mut self, _scan_rows: usize) -> Result<SchemaRef, SchemaError> {
        Ok(self.batch.schema())
    }

    fn chunks(&mut self, chunk_size: usize) -> Result<ChunkIter<'_>, SchemaError> {
        let step = chunk_size.max(1);
        let total = self.batch.num_rows();
        let batch = &self.batch;
        Ok(Box::new((0..total).step_by(step).map(move |offset| {
            Ok(batch.slice(offset, step.min(total - offset)))
        })))
    }
}

/// A CSV file with a header row, streamed with `arrow_csv`.
///
/// Column types are inferred from the first records. Types the push engine
/// cannot store (dates, timestamps, all-empty columns) are read as text.
#[derive(Debug, Clone)]
pub struct CsvSource {
    path: PathBuf,
    schema: Option<SchemaRef>,
}

impl CsvSource {
    /// Read from `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            schema: None,
        }
    }

    /// File path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<File, SchemaError> {
        File::open(&self.path).context(OpenSnafu {
            path: self.path.display().to_string(),
        })
    }

    fn format() -> Format {
        Format::default().with_header(true)
    }
}

fn storable(data_type: &DataType) -> bool {
    matches!(
        data_type,
        DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Float16
            | DataType::Float32
            | DataType::Float64
            | DataType::Boolean
            | DataType::Utf8
            | DataType::LargeUtf8
    )
}

impl TableSource for CsvSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn total_rows(&self) -> Option<u64> {
        None
    }

    fn is_materialized(&self) -> bool {
        false
    }

    fn schema(&mut self, scan_rows: usize) -> Result<SchemaRef, SchemaError> {
        if let Some(schema) = &self.schema {
            return Ok(Arc::clone(schema));
        }
        let file = self.open()?;
        let (inferred, _) = Self::format()
            .infer_schema(file, Some(scan_rows.max(1)))
            .context(SourceSnafu {
                source_name: self.describe(),
            })?;

        let fields: Vec<Field> = inferred
            .fields()
            .iter()
            .map(|f| {
                if storable(f.data_type()) {
                    f.as_ref().clone().with_nullable(true)
                } else {
                    Field::new(f.name(), DataType::Utf8, true)
                }
            })
            .collect();
        let schema = Arc::new(Schema::new(fields));
        self.schema = Some(Arc::clone(&schema));
        Ok(schema)
    }

    fn chunks(&mut self, chunk_size: usize) -> Result<ChunkIter<'_>, SchemaError> {
        let schema = match &self.schema {
            Some(schema) => Arc::clone(schema),
            None => self.schema(chunk_size)?,
        };
        let file = self.open()?;
        let source_name = self.describe();
        let reader = ReaderBuilder::new(schema)
            .with_format(Self::format())
            .with_batch_size(chunk_size.max(1))
            .build(file)
            .context(SourceSnafu {
                source_name: source_name.clone(),
            })?;
        Ok(Box::new(reader.map(move |batch| {
            batch.context(SourceSnafu {
                source_name: source_name.clone(),
            })
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, StringArray};
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn batch_source_chunks_cover_every_row() -> TestResult {
        let batch = RecordBatch::try_from_iter([(
            "id",
            Arc::new(Int64Array::from(vec![1, 2, 3, 4, 5])) as _,
        )])?;
        let mut source = BatchSource::new(batch);
        let sizes: Vec<usize> = source
            .chunks(2)?
            .map(|c| c.map(|b| b.num_rows()))
            .collect::<Result<_, _>>()?;
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(source.total_rows(), Some(5));
        Ok(())
    }

    #[test]
    fn csv_source_restarts_on_every_scan() -> TestResult {
        let tmp = TempDir::new()?;
        let path = tmp.path().join("data.csv");
        std::fs::write(&path, "id,name,when\n1,a,2024-01-01\n2,bb,2024-01-02\n3,ccc,2024-01-03\n")?;

        let mut source = CsvSource::new(&path);
        let schema = source.schema(10)?;
        assert_eq!(schema.field(0).data_type(), &DataType::Int64);
        assert_eq!(schema.field(1).data_type(), &DataType::Utf8);
        assert_eq!(schema.field(2).data_type(), &DataType::Utf8);

        for _ in 0..2 {
            let batches = source.chunks(2)?.collect::<Result<Vec<_>, _>>()?;
            assert_eq!(batches.len(), 2);
            let names = batches[1]
                .column(1)
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or("name column should be text")?;
            assert_eq!(names.value(0), "ccc");
        }
        Ok(())
    }

    #[test]
    fn missing_csv_is_an_open_error() {
        let mut source = CsvSource::new("/nonexistent/tablebridge.csv");
        assert!(matches!(source.schema(10), Err(SchemaError::Open { .. })));
    }
}
