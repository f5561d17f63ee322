//! BulkCM configuration files
//!
//! `parse_file` flattens a TS 32.615 document into one CSV sink per
//! (element type, column set) and stores the file metadata next to them as
//! `{stem}_metadata.json`. `probe` is a cheap counting pass that reports the
//! network layout without writing anything.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Serialize;

use crate::error::{FlattenError, Result};
use crate::flatten::{ElementFilter, FlattenStats, Flattener};
use crate::metadata::FileMetadata;
use crate::router::{OutputFormat, SinkRouter, SinkSummary};
use crate::storage::StorageBackend;
use crate::xml_events::{EventHandler, XmlEventReader, drive};

const CONFIG_DATA: &str = "configData";
const SUB_NETWORK: &str = "SubNetwork";
const METADATA_TAGS: [&str; 4] = ["bulkCmConfigDataFile", "fileHeader", "fileFooter", CONFIG_DATA];

#[derive(Debug, Clone, Serialize)]
pub struct BulkCmReport {
    pub file: PathBuf,
    pub metadata: FileMetadata,
    pub stats: FlattenStats,
    pub sinks: Vec<SinkSummary>,
    /// Key of the metadata side-car in the output store
    pub metadata_key: String,
    pub duration: Duration,
}

/// Flatten the BulkCM file at `path` into CSV sinks in `storage`
pub fn parse_file<B: StorageBackend>(path: &Path, storage: B, filter: ElementFilter) -> Result<BulkCmReport> {
    info!("Parsing {}", path.display());
    let events = XmlEventReader::open(path)?;
    parse_reader(events, storage, filter)
}

/// Flatten an already opened document
pub fn parse_reader<R: Read, B: StorageBackend>(
    mut events: XmlEventReader<R>,
    storage: B,
    filter: ElementFilter,
) -> Result<BulkCmReport> {
    let started = Instant::now();
    let file = events.source().to_path_buf();
    let mut router = SinkRouter::new(storage, OutputFormat::Csv);

    let flattened = {
        let mut flattener = Flattener::new(&mut router, filter);
        drive(&mut events, &mut flattener).and_then(|_| flattener.close())
    };
    let outcome = match flattened {
        Ok(outcome) => outcome,
        Err(e) => {
            if let Err(close_error) = router.close() {
                warn!("Closing sinks after failure: {}", close_error);
            }
            return Err(e);
        }
    };

    let metadata_key = format!("{}_metadata.json", file_stem(&file));
    let written = write_metadata(router.storage(), &metadata_key, &outcome.metadata);
    let sinks = router.close()?;
    written?;

    let duration = started.elapsed();
    info!(
        "Parsed {}: {} records into {} sinks in {:?}",
        file.display(),
        outcome.stats.emitted,
        sinks.len(),
        duration
    );
    Ok(BulkCmReport {
        file,
        metadata: outcome.metadata,
        stats: outcome.stats,
        sinks,
        metadata_key,
        duration,
    })
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| "bulkcm".to_string())
}

fn write_metadata<B: StorageBackend>(storage: &B, key: &str, metadata: &FileMetadata) -> Result<()> {
    let json = serde_json::to_vec_pretty(metadata)
        .map_err(|e| FlattenError::sink_io(key, std::io::Error::other(e)))?;
    let mut stream = storage
        .open_for_write(key)
        .map_err(|e| FlattenError::sink_io(key, e))?;
    stream
        .write_all(&json)
        .and_then(|_| stream.close())
        .map_err(|e| FlattenError::sink_io(key, e))?;
    debug!("Wrote metadata to {}", key);
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SubNetworkCounts {
    pub id: String,
    pub management_nodes: u64,
    pub me_contexts: u64,
    pub managed_elements: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConfigDataSummary {
    pub dn_prefix: Option<String>,
    /// In document order of their opening tags
    pub subnetworks: Vec<SubNetworkCounts>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub file: PathBuf,
    pub metadata: FileMetadata,
    pub config_data: Vec<ConfigDataSummary>,
    pub duration: Duration,
}

/// Counts network elements per SubNetwork
#[derive(Debug, Default)]
struct Prober {
    config_data: Vec<ConfigDataSummary>,
    /// Indices of the open SubNetworks in the current configData
    open: Vec<usize>,
    in_config_data: bool,
    metadata: FileMetadata,
}

impl Prober {
    fn current(&mut self) -> &mut ConfigDataSummary {
        if !self.in_config_data || self.config_data.is_empty() {
            self.config_data.push(ConfigDataSummary::default());
            self.in_config_data = true;
        }
        let last = self.config_data.len() - 1;
        &mut self.config_data[last]
    }

    fn innermost(&mut self) -> Option<&mut SubNetworkCounts> {
        let index = *self.open.last()?;
        self.current().subnetworks.get_mut(index)
    }
}

impl EventHandler for Prober {
    fn on_start(&mut self, name: &str, attributes: &[(String, String)]) -> Result<()> {
        if METADATA_TAGS.contains(&name) {
            self.metadata.merge(attributes);
        }
        match name {
            CONFIG_DATA => {
                let dn_prefix = attributes
                    .iter()
                    .find(|(key, _)| key == "dnPrefix")
                    .map(|(_, value)| value.clone());
                self.config_data.push(ConfigDataSummary {
                    dn_prefix,
                    subnetworks: Vec::new(),
                });
                self.in_config_data = true;
                self.open.clear();
            }
            SUB_NETWORK => {
                let id = attributes
                    .iter()
                    .find(|(key, _)| key == "id")
                    .map(|(_, value)| value.clone())
                    .unwrap_or_default();
                let subnetworks = &mut self.current().subnetworks;
                subnetworks.push(SubNetworkCounts {
                    id,
                    ..Default::default()
                });
                let index = subnetworks.len() - 1;
                self.open.push(index);
            }
            "ManagementNode" | "MeContext" | "ManagedElement" => match self.innermost() {
                Some(counts) => match name {
                    "ManagementNode" => counts.management_nodes += 1,
                    "MeContext" => counts.me_contexts += 1,
                    _ => counts.managed_elements += 1,
                },
                None => debug!("{} outside any SubNetwork", name),
            },
            _ => {}
        }
        Ok(())
    }

    fn on_text(&mut self, _chunk: &str) -> Result<()> {
        Ok(())
    }

    fn on_end(&mut self, name: &str) -> Result<()> {
        match name {
            SUB_NETWORK => {
                self.open.pop();
            }
            CONFIG_DATA => {
                self.in_config_data = false;
                self.open.clear();
            }
            _ => {}
        }
        Ok(())
    }
}

/// Report SubNetworks and their element counts without writing output
pub fn probe(path: &Path) -> Result<ProbeReport> {
    let started = Instant::now();
    info!("Probing {}", path.display());
    let mut events = XmlEventReader::open(path)?;
    let mut prober = Prober::default();
    drive(&mut events, &mut prober)?;
    Ok(ProbeReport {
        file: path.to_path_buf(),
        metadata: prober.metadata,
        config_data: prober.config_data,
        duration: started.elapsed(),
    })
}
