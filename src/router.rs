//! Dynamic-schema sink router
//!
//! Records and counter rows arrive with a type name and an ordered column
//! list. The router hashes the column list into a [`SchemaFingerprint`] and
//! keeps one sink per (type name, fingerprint), so rows with different shapes
//! never share a file. Sinks are created lazily on first use, their header or
//! schema is written exactly once, and they stay open until the router is
//! closed.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use arrow::array::{ArrayRef, StringArray, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use chrono::{NaiveDateTime, Timelike};
use log::{debug, info, warn};
use md5::{Digest, Md5};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};

use crate::error::{FlattenError, Result};
use crate::flatten::{Record, RecordSink};
use crate::storage::{OutputStream, StorageBackend};

/// Lowercase hex MD5 of the column names concatenated in order
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchemaFingerprint(String);

impl SchemaFingerprint {
    pub fn of<S: AsRef<str>>(columns: &[S]) -> Self {
        let mut hasher = Md5::new();
        for column in columns {
            hasher.update(column.as_ref().as_bytes());
        }
        SchemaFingerprint(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SchemaFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Csv,
    Parquet,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Csv => f.write_str("csv"),
            OutputFormat::Parquet => f.write_str("parquet"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// Keys and attribute values, always strings
    Text,
    /// Unsigned counter values, null when unparsable
    Counter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
}

impl Column {
    pub fn text(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ColumnKind::Text,
        }
    }

    pub fn counter(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ColumnKind::Counter,
        }
    }
}

/// Deterministic location of a batch inside a partitioned table
///
/// A pure function of the batch's node identity and measurement time:
/// `[node/]YYYY-MM-DD/hh/mm`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    node: Option<String>,
    day: String,
    hour: String,
    minute: String,
}

impl PartitionKey {
    pub fn derive(time: &NaiveDateTime, node: Option<&str>) -> Self {
        Self {
            node: node.map(sanitize_segment),
            day: time.format("%Y-%m-%d").to_string(),
            hour: format!("{:02}", time.hour()),
            minute: format!("{:02}", time.minute()),
        }
    }

    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    /// Object key prefix of the partition
    pub fn as_key(&self) -> String {
        match &self.node {
            Some(node) => format!("{}/{}/{}/{}", node, self.day, self.hour, self.minute),
            None => format!("{}/{}/{}", self.day, self.hour, self.minute),
        }
    }
}

fn sanitize_segment(value: &str) -> String {
    let cleaned = value.trim().replace(['/', '\\'], "_");
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "_".to_string()
    } else {
        cleaned
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkHandle(usize);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SinkSummary {
    pub name: String,
    pub type_name: String,
    pub fingerprint: String,
    pub columns: usize,
    pub rows: u64,
}

enum SinkWriter {
    Csv(csv::Writer<Box<dyn OutputStream>>),
    Parquet { schema: SchemaRef, files: u64 },
}

struct Sink {
    name: String,
    type_name: String,
    fingerprint: SchemaFingerprint,
    /// Fingerprint as spelled in object names, suffixed on a hash collision
    label: String,
    columns: Vec<Column>,
    writer: SinkWriter,
    rows: u64,
}

impl Sink {
    fn summary(&self) -> SinkSummary {
        SinkSummary {
            name: self.name.clone(),
            type_name: self.type_name.clone(),
            fingerprint: self.fingerprint.to_string(),
            columns: self.columns.len(),
            rows: self.rows,
        }
    }

    fn has_columns(&self, columns: &[Column]) -> bool {
        self.columns
            .iter()
            .map(|column| &column.name)
            .eq(columns.iter().map(|column| &column.name))
    }

    fn check_width(&self, row: &[String]) -> Result<()> {
        if row.len() == self.columns.len() {
            Ok(())
        } else {
            Err(FlattenError::structural(format!(
                "row with {} values routed to {} which has {} columns",
                row.len(),
                self.name,
                self.columns.len()
            )))
        }
    }
}

fn arrow_schema(columns: &[Column]) -> SchemaRef {
    let fields: Vec<Field> = columns
        .iter()
        .map(|column| match column.kind {
            ColumnKind::Text => Field::new(column.name.as_str(), DataType::Utf8, true),
            ColumnKind::Counter => Field::new(column.name.as_str(), DataType::UInt64, true),
        })
        .collect();
    Arc::new(Schema::new(fields))
}

fn record_batch(schema: &SchemaRef, columns: &[Column], rows: &[Vec<String>]) -> Result<RecordBatch> {
    let arrays: Vec<ArrayRef> = columns
        .iter()
        .enumerate()
        .map(|(index, column)| -> ArrayRef {
            match column.kind {
                ColumnKind::Text => Arc::new(
                    rows.iter()
                        .map(|row| Some(row[index].as_str()))
                        .collect::<StringArray>(),
                ),
                ColumnKind::Counter => Arc::new(
                    rows.iter()
                        .map(|row| row[index].trim().parse::<u64>().ok())
                        .collect::<UInt64Array>(),
                ),
            }
        })
        .collect();
    Ok(RecordBatch::try_new(Arc::clone(schema), arrays)?)
}

/// Write one complete Parquet object and close it
fn write_parquet<B: StorageBackend>(
    storage: &B,
    key: &str,
    schema: &SchemaRef,
    batch: Option<&RecordBatch>,
) -> Result<()> {
    let to_sink_error = |e: parquet::errors::ParquetError| {
        FlattenError::sink_io(key, std::io::Error::other(e))
    };
    let stream = storage
        .open_for_write(key)
        .map_err(|e| FlattenError::sink_io(key, e))?;
    let mut writer = ArrowWriter::try_new(stream, Arc::clone(schema), None).map_err(to_sink_error)?;
    if let Some(batch) = batch {
        writer.write(batch).map_err(to_sink_error)?;
    }
    let stream = writer.into_inner().map_err(to_sink_error)?;
    stream.close().map_err(|e| FlattenError::sink_io(key, e))
}

/// Registry of open sinks for one run
pub struct SinkRouter<B: StorageBackend> {
    storage: B,
    format: OutputFormat,
    sinks: Vec<Sink>,
    /// Every sink sharing a (type, fingerprint), in creation order
    registry: HashMap<(String, SchemaFingerprint), Vec<SinkHandle>>,
}

impl<B: StorageBackend> SinkRouter<B> {
    pub fn new(storage: B, format: OutputFormat) -> Self {
        Self {
            storage,
            format,
            sinks: Vec::new(),
            registry: HashMap::new(),
        }
    }

    pub fn storage(&self) -> &B {
        &self.storage
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    pub fn sink_name(&self, handle: SinkHandle) -> &str {
        &self.sinks[handle.0].name
    }

    pub fn columns(&self, handle: SinkHandle) -> &[Column] {
        &self.sinks[handle.0].columns
    }

    /// Handle of the sink for (type, columns), creating it on first use
    ///
    /// Sinks are looked up by (type, fingerprint) and then by column names,
    /// so two column lists whose concatenations collide still get separate
    /// sinks. The first one keeps the plain fingerprint in its name, later
    /// ones get `-1`, `-2`, ... appended in order of first appearance.
    pub fn get_or_create(
        &mut self,
        type_name: &str,
        fingerprint: &SchemaFingerprint,
        columns: &[Column],
    ) -> Result<SinkHandle> {
        let key = (type_name.to_string(), fingerprint.clone());
        let existing = self.registry.get(&key).map(Vec::as_slice).unwrap_or_default();
        if let Some(handle) = existing
            .iter()
            .find(|handle| self.sinks[handle.0].has_columns(columns))
        {
            return Ok(*handle);
        }

        let label = match existing.len() {
            0 => fingerprint.to_string(),
            n => {
                warn!(
                    "Fingerprint {} of {} already names a sink with other columns",
                    fingerprint, type_name
                );
                format!("{}-{}", fingerprint, n)
            }
        };
        let sink = match self.format {
            OutputFormat::Csv => self.create_csv(type_name, fingerprint, label, columns)?,
            OutputFormat::Parquet => self.create_parquet(type_name, fingerprint, label, columns)?,
        };
        info!("Created sink {} ({} columns)", sink.name, sink.columns.len());

        let handle = SinkHandle(self.sinks.len());
        self.sinks.push(sink);
        self.registry.entry(key).or_default().push(handle);
        Ok(handle)
    }

    fn create_csv(
        &self,
        type_name: &str,
        fingerprint: &SchemaFingerprint,
        label: String,
        columns: &[Column],
    ) -> Result<Sink> {
        let name = format!("{}-{}.csv", type_name, label);
        let resumed = self
            .storage
            .exists(&name)
            .map_err(|e| FlattenError::sink_io(&name, e))?;
        let stream = if resumed {
            debug!("Appending to existing {}", name);
            self.storage.open_for_append(&name)
        } else {
            self.storage.open_for_write(&name)
        }
        .map_err(|e| FlattenError::sink_io(&name, e))?;

        let mut writer = csv::Writer::from_writer(stream);
        if !resumed {
            writer
                .write_record(columns.iter().map(|column| column.name.as_str()))
                .map_err(|e| FlattenError::sink_io(&name, std::io::Error::other(e)))?;
        }
        Ok(Sink {
            name,
            type_name: type_name.to_string(),
            fingerprint: fingerprint.clone(),
            label,
            columns: columns.to_vec(),
            writer: SinkWriter::Csv(writer),
            rows: 0,
        })
    }

    fn create_parquet(
        &self,
        type_name: &str,
        fingerprint: &SchemaFingerprint,
        label: String,
        columns: &[Column],
    ) -> Result<Sink> {
        let schema = arrow_schema(columns);
        let name = format!("{}/_schema-{}.parquet", type_name, label);
        write_parquet(&self.storage, &name, &schema, None)?;
        Ok(Sink {
            name,
            type_name: type_name.to_string(),
            fingerprint: fingerprint.clone(),
            label,
            columns: columns.to_vec(),
            writer: SinkWriter::Parquet { schema, files: 0 },
            rows: 0,
        })
    }

    /// Append one row to a delimited sink, in the sink's column order
    pub fn append(&mut self, handle: SinkHandle, row: &[String]) -> Result<()> {
        let sink = &mut self.sinks[handle.0];
        sink.check_width(row)?;
        match &mut sink.writer {
            SinkWriter::Csv(writer) => {
                writer
                    .write_record(row)
                    .map_err(|e| FlattenError::sink_io(&sink.name, std::io::Error::other(e)))?;
                sink.rows += 1;
                Ok(())
            }
            SinkWriter::Parquet { .. } => Err(FlattenError::structural(format!(
                "{} is partitioned, rows must be appended per partition",
                sink.name
            ))),
        }
    }

    /// Append a batch of rows to the given partition of a sink
    ///
    /// Partitioned sinks write one complete object per batch, named
    /// `part-{fingerprint}-{part}.parquet`. Delimited sinks ignore the
    /// partition and append the rows.
    pub fn append_partition(
        &mut self,
        handle: SinkHandle,
        partition: &PartitionKey,
        part: &str,
        rows: &[Vec<String>],
    ) -> Result<()> {
        if matches!(self.sinks[handle.0].writer, SinkWriter::Csv(_)) {
            for row in rows {
                self.append(handle, row)?;
            }
            return Ok(());
        }

        let sink = &mut self.sinks[handle.0];
        for row in rows {
            sink.check_width(row)?;
        }
        if let SinkWriter::Parquet { schema, files } = &mut sink.writer {
            let key = format!(
                "{}/{}/part-{}-{}.parquet",
                sink.type_name,
                partition.as_key(),
                sink.label,
                part
            );
            let batch = record_batch(schema, &sink.columns, rows)?;
            write_parquet(&self.storage, &key, schema, Some(&batch))?;
            debug!("Wrote {} rows to {}", rows.len(), key);
            *files += 1;
            sink.rows += rows.len() as u64;
        }
        Ok(())
    }

    /// Push buffered rows of every open sink to the store
    pub fn flush(&mut self) -> Result<()> {
        for sink in &mut self.sinks {
            if let SinkWriter::Csv(writer) = &mut sink.writer {
                writer
                    .flush()
                    .map_err(|e| FlattenError::sink_io(&sink.name, e))?;
            }
        }
        Ok(())
    }

    /// Flush and close every sink, in creation order
    ///
    /// Every sink is closed even when an earlier one fails; the first failure
    /// is returned.
    pub fn close(self) -> Result<Vec<SinkSummary>> {
        let mut summaries = Vec::with_capacity(self.sinks.len());
        let mut first_error = None;
        for sink in self.sinks {
            summaries.push(sink.summary());
            let Sink { name, writer, .. } = sink;
            let result = match writer {
                SinkWriter::Csv(writer) => writer
                    .into_inner()
                    .map_err(|e| FlattenError::sink_io(&name, e.into_error()))
                    .and_then(|stream| stream.close().map_err(|e| FlattenError::sink_io(&name, e))),
                SinkWriter::Parquet { files, .. } => {
                    debug!("{} closed after {} part files", name, files);
                    Ok(())
                }
            };
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(summaries),
        }
    }
}

impl<B: StorageBackend> RecordSink for SinkRouter<B> {
    fn accept(&mut self, record: Record) -> Result<()> {
        let names = record.columns();
        let fingerprint = SchemaFingerprint::of(&names);
        let columns: Vec<Column> = names.into_iter().map(Column::text).collect();
        let handle = self.get_or_create(&record.type_name, &fingerprint, &columns)?;
        self.append(handle, &record.values())
    }

    fn end_of_stream(&mut self) -> Result<()> {
        self.flush()
    }
}
