//! # telco-xml-tables
//!
//! Streaming flattener for 3GPP network exports. BulkCM configuration files
//! become one table per (element type, column set); performance-counter
//! files are scanned by a bounded producer/consumer pipeline into CSV or
//! partitioned Parquet tables.

pub mod bulkcm;
pub mod cli;
pub mod config;
pub mod counters;
pub mod dn;
pub mod error;
pub mod file_discovery;
pub mod flatten;
pub mod metadata;
pub mod pipeline;
pub mod router;
pub mod storage;
pub mod tables;
pub mod xml_events;

pub use bulkcm::{BulkCmReport, ProbeReport, parse_file, probe};
pub use cli::{Cli, VerbosityLevel};
pub use config::{Config, ConfigManager};
pub use counters::{CounterRow, CounterScanner, TableItem, scan_file};
pub use dn::DistinguishedName;
pub use error::{ConfigError, FlattenError, Result};
pub use file_discovery::FileDiscovery;
pub use flatten::{ElementFilter, FlattenOutcome, FlattenStats, Flattener, Record, RecordSink};
pub use metadata::FileMetadata;
pub use pipeline::{ExtractionPipeline, Message, PipelineOptions, PipelineReport, RunOutcome};
pub use router::{Column, OutputFormat, PartitionKey, SchemaFingerprint, SinkRouter, SinkSummary};
pub use storage::{LocalStorage, MemoryStorage, OutputStream, StorageBackend};
pub use tables::{CounterLayout, CounterTableWriter, NaturalKeyOptions};
pub use xml_events::{EventHandler, XmlEvent, XmlEventReader};
