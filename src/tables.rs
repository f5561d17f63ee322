//! Counter table layouts
//!
//! Turns a [`TableItem`] into sink rows. The layout decides which key columns
//! precede the metrics and how the item's network-element and object DNs are
//! spelled out.

use indexmap::IndexMap;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::counters::TableItem;
use crate::dn::DistinguishedName;
use crate::error::{FlattenError, Result};
use crate::router::{Column, OutputFormat, PartitionKey, SchemaFingerprint, SinkRouter, SinkSummary};
use crate::storage::StorageBackend;

const TIME_COLUMN: &str = "ST";
const NE_COLUMN: &str = "NEDN";
const OBJECT_COLUMN: &str = "LDN";
const NODE_COLUMN: &str = "Node";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NaturalKeyOptions {
    /// Drop NEDN pairs before the last occurrence of this type
    pub nedn_ignore_before: Option<String>,
    /// Drop LDN pairs before the last occurrence of this type
    pub ldn_ignore_before: Option<String>,
    /// NEDN type whose id replaces the NEDN columns with a `Node` column
    pub node_key: Option<String>,
    /// Move the node id into the partition path (Parquet only)
    pub partition_by_node: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CounterLayout {
    /// `ST, NEDN, LDN, metrics...`
    #[default]
    Plain,
    /// NEDN and LDN split into one column per DN type
    NaturalKey(NaturalKeyOptions),
}

struct KeyedRows {
    table: String,
    columns: Vec<Column>,
    rows: Vec<Vec<String>>,
}

/// Consumer-side writer owning the sink router for counter tables
pub struct CounterTableWriter<B: StorageBackend> {
    router: SinkRouter<B>,
    layout: CounterLayout,
    items: u64,
    rows: u64,
}

impl<B: StorageBackend> CounterTableWriter<B> {
    pub fn new(router: SinkRouter<B>, layout: CounterLayout) -> Self {
        Self {
            router,
            layout,
            items: 0,
            rows: 0,
        }
    }

    pub fn items_written(&self) -> u64 {
        self.items
    }

    pub fn rows_written(&self) -> u64 {
        self.rows
    }

    pub fn router(&self) -> &SinkRouter<B> {
        &self.router
    }

    fn partitioned(&self) -> bool {
        self.router.format() == OutputFormat::Parquet
    }

    /// Route every row of `item` to its sink
    pub fn write_item(&mut self, item: &TableItem) -> Result<()> {
        let groups = match &self.layout {
            CounterLayout::Plain => vec![self.plain_rows(item)?],
            CounterLayout::NaturalKey(options) => self.natural_key_rows(item, options)?,
        };

        let partitioned = self.partitioned();
        let mut node = None;
        if partitioned
            && let CounterLayout::NaturalKey(options) = &self.layout
            && options.partition_by_node
            && let Some(key) = &options.node_key
        {
            node = Some(node_id(item, options, key)?);
        }

        for group in groups {
            let names: Vec<&str> = group
                .columns
                .iter()
                .map(|column| column.name.as_str())
                .filter(|name| *name != TIME_COLUMN)
                .collect();
            let fingerprint = match self.layout {
                CounterLayout::Plain => SchemaFingerprint::of(&item.metric_names),
                CounterLayout::NaturalKey(_) => SchemaFingerprint::of(&names),
            };
            let handle = self
                .router
                .get_or_create(&group.table, &fingerprint, &group.columns)?;

            if partitioned {
                let partition = PartitionKey::derive(&item.time()?, node.as_deref());
                let part = format!("{}-{}", item.source_stem(), item.sequence);
                self.router
                    .append_partition(handle, &partition, &part, &group.rows)?;
            } else {
                for row in &group.rows {
                    self.router.append(handle, row)?;
                }
            }
            self.rows += group.rows.len() as u64;
            debug!("{} rows to {}", group.rows.len(), self.router.sink_name(handle));
        }
        self.items += 1;
        Ok(())
    }

    fn plain_rows(&self, item: &TableItem) -> Result<KeyedRows> {
        let partitioned = self.partitioned();
        let mut columns = Vec::with_capacity(item.metric_names.len() + 3);
        if !partitioned {
            columns.push(Column::text(TIME_COLUMN));
        }
        columns.push(Column::text(NE_COLUMN));
        columns.push(Column::text(OBJECT_COLUMN));
        columns.extend(item.metric_names.iter().map(Column::counter));

        let rows = item
            .rows
            .iter()
            .map(|row| {
                let mut values = Vec::with_capacity(columns.len());
                if !partitioned {
                    values.push(item.timestamp.clone());
                }
                values.push(item.ne_dn.clone());
                values.push(row.ldn.clone());
                values.extend(row.values.iter().cloned());
                values
            })
            .collect();

        Ok(KeyedRows {
            table: format!("{}-{}", item.object_type()?, item.granularity_period),
            columns,
            rows,
        })
    }

    fn natural_key_rows(&self, item: &TableItem, options: &NaturalKeyOptions) -> Result<Vec<KeyedRows>> {
        let partitioned = self.partitioned();
        let by_node = partitioned && options.partition_by_node && options.node_key.is_some();

        let mut nedn = DistinguishedName::parse(&item.ne_dn)?;
        if let Some(type_name) = &options.nedn_ignore_before {
            nedn.ignore_before(type_name);
        }
        let (prefix_columns, prefix_values): (Vec<String>, Vec<String>) = match &options.node_key {
            Some(_) if by_node => (Vec::new(), Vec::new()),
            Some(key) => (vec![NODE_COLUMN.to_string()], vec![node_id(item, options, key)?]),
            None => (
                nedn.type_names().map(str::to_string).collect(),
                nedn.ids().map(str::to_string).collect(),
            ),
        };

        let mut groups: IndexMap<Vec<String>, KeyedRows> = IndexMap::new();
        for row in &item.rows {
            let mut ldn = DistinguishedName::parse(&row.ldn)?;
            if let Some(type_name) = &options.ldn_ignore_before {
                ldn.ignore_before(type_name);
            }
            let ldn_types: Vec<String> = ldn.type_names().map(str::to_string).collect();
            let leaf = ldn
                .leaf_type()
                .ok_or_else(|| FlattenError::InvalidDistinguishedName { dn: row.ldn.clone() })?
                .to_string();

            let group = groups.entry(ldn_types.clone()).or_insert_with(|| {
                let mut columns = Vec::new();
                if !partitioned {
                    columns.push(Column::text(TIME_COLUMN));
                }
                columns.extend(prefix_columns.iter().map(Column::text));
                columns.extend(ldn_types.iter().map(Column::text));
                columns.extend(item.metric_names.iter().map(Column::counter));
                let table = if by_node {
                    format!("{}-{}-{}", leaf, NODE_COLUMN, item.granularity_period)
                } else {
                    format!("{}-{}", leaf, item.granularity_period)
                };
                KeyedRows {
                    table,
                    columns,
                    rows: Vec::new(),
                }
            });

            let mut values = Vec::with_capacity(group.columns.len());
            if !partitioned {
                values.push(item.timestamp.clone());
            }
            values.extend(prefix_values.iter().cloned());
            values.extend(ldn.ids().map(str::to_string));
            values.extend(row.values.iter().cloned());
            group.rows.push(values);
        }
        Ok(groups.into_values().collect())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.router.flush()
    }

    pub fn close(self) -> Result<Vec<SinkSummary>> {
        self.router.close()
    }
}

fn node_id(item: &TableItem, options: &NaturalKeyOptions, key: &str) -> Result<String> {
    let mut nedn = DistinguishedName::parse(&item.ne_dn)?;
    if let Some(type_name) = &options.nedn_ignore_before {
        nedn.ignore_before(type_name);
    }
    nedn.take(key).ok_or_else(|| {
        FlattenError::structural(format!(
            "network element {:?} of {} has no {} to use as node",
            item.ne_dn,
            item.source.display(),
            key
        ))
    })
}
