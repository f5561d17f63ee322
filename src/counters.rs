//! Performance-counter scanner
//!
//! Reads 3GPP measurement files and produces one [`TableItem`] per
//! measurement interval. Two families are understood:
//!
//! * TS 32.401 `mdc` files (`mfh`, `md/neid/nedn`, `mi` with `mts`, `gp`,
//!   `mt` and `mv/moid` + `r` values)
//! * TS 32.435 `measCollecFile` files (`managedElement@localDn`, `measInfo`
//!   with `granPeriod`, positional `measType@p` and `measValue/r@p`)
//!
//! Scanning is streaming: only the interval being read is held in memory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, NaiveDateTime};
use log::{debug, warn};
use regex::Regex;

use crate::dn::DistinguishedName;
use crate::error::{FlattenError, Result};
use crate::metadata::FileMetadata;
use crate::xml_events::{EventHandler, XmlEventReader, drive};

static ISO_DURATION: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^P(?:(\d+)D)?(?:T(?:(\d+)H)?(?:(\d+)M)?(?:(\d+)S)?)?$").ok()
});

/// Granularity period in seconds from an ISO-8601 duration such as `PT900S`
pub fn parse_duration(raw: &str) -> Option<u32> {
    let captures = ISO_DURATION.as_ref()?.captures(raw.trim())?;
    let part = |index: usize, unit: u32| -> Option<u32> {
        match captures.get(index) {
            Some(m) => m.as_str().parse::<u32>().ok()?.checked_mul(unit),
            None => Some(0),
        }
    };
    let seconds = part(1, 86_400)?
        .checked_add(part(2, 3_600)?)?
        .checked_add(part(3, 60)?)?
        .checked_add(part(4, 1)?)?;
    (seconds > 0).then_some(seconds)
}

/// Wall-clock time of a measurement time stamp
///
/// Accepts the compact `YYYYMMDDhhmmss` form (optionally followed by a zone
/// suffix) and RFC 3339 date-times, whose local time is kept.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(time) = DateTime::parse_from_rfc3339(raw) {
        return Some(time.naive_local());
    }
    let compact = raw.get(..14)?;
    NaiveDateTime::parse_from_str(compact, "%Y%m%d%H%M%S").ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterRow {
    /// Measured object DN, relative to the network element
    pub ldn: String,
    pub values: Vec<String>,
}

/// Rows of one measurement interval sharing one metric-name list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableItem {
    pub source: PathBuf,
    /// Index of the interval within its source file
    pub sequence: usize,
    /// Measurement time stamp as written in the file
    pub timestamp: String,
    /// Seconds
    pub granularity_period: u32,
    pub ne_dn: String,
    pub metric_names: Vec<String>,
    pub rows: Vec<CounterRow>,
}

impl TableItem {
    /// Class of the measured objects, taken from the first row's LDN
    pub fn object_type(&self) -> Result<String> {
        let ldn = self.rows.first().map(|row| row.ldn.as_str()).unwrap_or_default();
        DistinguishedName::parse(ldn)?
            .leaf_type()
            .map(str::to_string)
            .ok_or_else(|| FlattenError::InvalidDistinguishedName { dn: ldn.to_string() })
    }

    pub fn time(&self) -> Result<NaiveDateTime> {
        parse_timestamp(&self.timestamp).ok_or_else(|| {
            FlattenError::structural(format!(
                "unparsable measurement time stamp {:?} in {}",
                self.timestamp,
                self.source.display()
            ))
        })
    }

    /// Stem of the source file name, used to name per-item output
    pub fn source_stem(&self) -> String {
        self.source
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| "input".to_string())
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

#[derive(Debug, Default)]
struct RowBuilder {
    ldn: String,
    values: Vec<(u32, String)>,
}

impl RowBuilder {
    fn push(&mut self, position: Option<u32>, value: String) {
        let position = position.unwrap_or(self.values.len() as u32 + 1);
        self.values.push((position, value));
    }
}

#[derive(Debug, Default)]
struct IntervalBuilder {
    id: Option<String>,
    timestamp: Option<String>,
    granularity_period: Option<u32>,
    metrics: Vec<(u32, String)>,
    rows: Vec<RowBuilder>,
}

impl IntervalBuilder {
    fn push_metric(&mut self, position: Option<u32>, name: String) {
        let position = position.unwrap_or(self.metrics.len() as u32 + 1);
        self.metrics.push((position, name));
    }
}

/// Number of items produced and the metadata of one scanned file
#[derive(Debug, Clone, Default)]
pub struct ScanSummary {
    pub metadata: FileMetadata,
    pub items: usize,
}

pub struct CounterScanner<F>
where
    F: FnMut(TableItem) -> Result<()>,
{
    source: PathBuf,
    emit: F,
    cancel: Option<Arc<AtomicBool>>,
    open: Vec<String>,
    text: String,
    position: Option<u32>,
    dn_prefix: Option<String>,
    ne_dn: String,
    interval: Option<IntervalBuilder>,
    row: Option<RowBuilder>,
    metadata: FileMetadata,
    items: usize,
}

fn attribute<'a>(attributes: &'a [(String, String)], name: &str) -> Option<&'a str> {
    attributes
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

impl<F> CounterScanner<F>
where
    F: FnMut(TableItem) -> Result<()>,
{
    pub fn new(source: impl Into<PathBuf>, emit: F) -> Self {
        Self {
            source: source.into(),
            emit,
            cancel: None,
            open: Vec::new(),
            text: String::new(),
            position: None,
            dn_prefix: None,
            ne_dn: String::new(),
            interval: None,
            row: None,
            metadata: FileMetadata::new(),
            items: 0,
        }
    }

    /// Stop with `Cancelled` at the next element once `flag` is raised
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn finish(self) -> ScanSummary {
        ScanSummary {
            metadata: self.metadata,
            items: self.items,
        }
    }

    fn interval_mut(&mut self, element: &str) -> Result<&mut IntervalBuilder> {
        let source = &self.source;
        self.interval.as_mut().ok_or_else(|| {
            FlattenError::structural(format!(
                "<{}> outside of a measurement interval in {}",
                element,
                source.display()
            ))
        })
    }

    fn row_mut(&mut self, element: &str) -> Result<&mut RowBuilder> {
        let source = &self.source;
        self.row.as_mut().ok_or_else(|| {
            FlattenError::structural(format!(
                "<{}> outside of a measured value in {}",
                element,
                source.display()
            ))
        })
    }

    fn finish_row(&mut self, element: &str) -> Result<()> {
        let row = self.row.take().unwrap_or_default();
        self.interval_mut(element)?.rows.push(row);
        Ok(())
    }

    fn finish_interval(&mut self) -> Result<()> {
        let Some(interval) = self.interval.take() else {
            return Ok(());
        };
        let label = interval.id.clone().unwrap_or_else(|| "mi".to_string());

        if interval.metrics.is_empty() || interval.rows.is_empty() {
            warn!(
                "Ignoring interval {} in {}: {} metric names, {} rows",
                label,
                self.source.display(),
                interval.metrics.len(),
                interval.rows.len()
            );
            return Ok(());
        }
        let (Some(timestamp), Some(granularity_period)) =
            (interval.timestamp, interval.granularity_period)
        else {
            warn!(
                "Ignoring interval {} in {}: missing time stamp or granularity period",
                label,
                self.source.display()
            );
            return Ok(());
        };

        let columns: HashMap<u32, usize> = interval
            .metrics
            .iter()
            .enumerate()
            .map(|(index, (position, _))| (*position, index))
            .collect();
        let metric_names: Vec<String> = interval.metrics.into_iter().map(|(_, name)| name).collect();

        let mut rows = Vec::with_capacity(interval.rows.len());
        for row in interval.rows {
            let mut values = vec![String::new(); metric_names.len()];
            for (position, value) in row.values {
                let column = columns.get(&position).ok_or_else(|| {
                    FlattenError::structural(format!(
                        "value {} of {} has no measurement type in {}",
                        position,
                        row.ldn,
                        self.source.display()
                    ))
                })?;
                values[*column] = value;
            }
            rows.push(CounterRow {
                ldn: row.ldn,
                values,
            });
        }

        let item = TableItem {
            source: self.source.clone(),
            sequence: self.items,
            timestamp,
            granularity_period,
            ne_dn: self.ne_dn.clone(),
            metric_names,
            rows,
        };
        debug!(
            "Interval {} of {}: {} rows x {} metrics",
            item.sequence,
            self.source.display(),
            item.rows.len(),
            item.metric_names.len()
        );
        self.items += 1;
        (self.emit)(item)
    }
}

impl<F> EventHandler for CounterScanner<F>
where
    F: FnMut(TableItem) -> Result<()>,
{
    fn on_start(&mut self, name: &str, attributes: &[(String, String)]) -> Result<()> {
        if let Some(flag) = &self.cancel
            && flag.load(Ordering::Relaxed)
        {
            return Err(FlattenError::Cancelled);
        }

        self.text.clear();
        self.open.push(name.to_string());

        match name {
            "mi" => self.interval = Some(IntervalBuilder::default()),
            "measInfo" => {
                self.interval = Some(IntervalBuilder {
                    id: attribute(attributes, "measInfoId").map(str::to_string),
                    ..IntervalBuilder::default()
                })
            }
            "mv" => self.row = Some(RowBuilder::default()),
            "measValue" => {
                self.row = Some(RowBuilder {
                    ldn: attribute(attributes, "measObjLdn")
                        .unwrap_or_default()
                        .to_string(),
                    values: Vec::new(),
                })
            }
            "r" | "measType" => {
                self.position = attribute(attributes, "p").and_then(|p| p.trim().parse().ok());
            }
            "granPeriod" => {
                let duration = attribute(attributes, "duration").and_then(parse_duration);
                let end_time = attribute(attributes, "endTime").map(str::to_string);
                let interval = self.interval_mut(name)?;
                interval.granularity_period = duration;
                interval.timestamp = end_time;
            }
            "managedElement" => {
                let local_dn = attribute(attributes, "localDn").unwrap_or_default();
                self.ne_dn = match (&self.dn_prefix, local_dn.is_empty()) {
                    (Some(prefix), false) => format!("{},{}", prefix, local_dn),
                    (Some(prefix), true) => prefix.clone(),
                    (None, _) => local_dn.to_string(),
                };
            }
            "fileHeader" => {
                self.dn_prefix = attribute(attributes, "dnPrefix")
                    .filter(|prefix| !prefix.is_empty())
                    .map(str::to_string);
                self.metadata.merge(attributes);
            }
            "measCollecFile" | "fileSender" | "measCollec" | "fileFooter" | "mdc" => {
                self.metadata.merge(attributes);
            }
            _ => {}
        }
        Ok(())
    }

    fn on_text(&mut self, chunk: &str) -> Result<()> {
        self.text.push_str(chunk.trim());
        Ok(())
    }

    fn on_end(&mut self, name: &str) -> Result<()> {
        match self.open.pop() {
            Some(open) if open == name => {}
            Some(open) => {
                return Err(FlattenError::structural(format!(
                    "</{}> closes <{}> in {}",
                    name,
                    open,
                    self.source.display()
                )));
            }
            None => {
                return Err(FlattenError::structural(format!(
                    "</{}> with nothing open in {}",
                    name,
                    self.source.display()
                )));
            }
        }
        let text = std::mem::take(&mut self.text);
        let position = self.position.take();

        match name {
            "nedn" => self.ne_dn = text,
            "md" => self.ne_dn.clear(),
            "mts" => self.interval_mut(name)?.timestamp = Some(text),
            "gp" => self.interval_mut(name)?.granularity_period = text.parse().ok(),
            "mt" | "measType" => self.interval_mut(name)?.push_metric(position, text),
            "measTypes" => {
                let interval = self.interval_mut(name)?;
                for metric in text.split_whitespace() {
                    interval.push_metric(None, metric.to_string());
                }
            }
            "moid" => self.row_mut(name)?.ldn = text,
            "r" => self.row_mut(name)?.push(position, text),
            "measResults" => {
                let row = self.row_mut(name)?;
                for value in text.split_whitespace() {
                    row.push(None, value.to_string());
                }
            }
            "mv" | "measValue" => self.finish_row(name)?,
            "mi" | "measInfo" => self.finish_interval()?,
            _ => {
                if matches!(self.open.last().map(String::as_str), Some("mfh" | "mff")) {
                    self.metadata.insert(name.to_string(), text);
                }
            }
        }
        Ok(())
    }
}

/// Scan one file, handing every interval to `emit` in document order
pub fn scan_file<F>(path: &Path, cancel: Option<Arc<AtomicBool>>, emit: F) -> Result<ScanSummary>
where
    F: FnMut(TableItem) -> Result<()>,
{
    let mut events = XmlEventReader::open(path)?;
    let mut scanner = CounterScanner::new(path, emit);
    if let Some(flag) = cancel {
        scanner = scanner.with_cancel_flag(flag);
    }
    drive(&mut events, &mut scanner)?;
    Ok(scanner.finish())
}
