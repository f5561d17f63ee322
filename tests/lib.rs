//! Integration test suite for telco-xml-tables
//!
//! - BulkCM flattening scenarios against the fixtures in `tests/fixtures`
//! - Counter extraction through the producer/consumer pipeline
//! - Parquet partition layout
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test --test lib
//! ```

pub mod common;

pub mod integration;
