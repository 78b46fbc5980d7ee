//! Table metadata: descriptors, distance metrics, time ranges, and the
//! metadata-store client the routing planner consults.
//!
//! The store itself is an external collaborator. Deployments back it with a
//! database or a control-plane service; this crate ships [`StaticMetaStore`],
//! a configuration-driven implementation, and the test suites provide mocks.
//! The core requires only the [`MetaStore`] trait: `lookup` must be
//! read-consistent within a single call (no file appears under two addresses
//! in one returned mapping).

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::config::MishardConfig;
use crate::error::{ShardError, ShardResult};

// ---------------------------------------------------------------------------
// Metric
// ---------------------------------------------------------------------------

/// Distance metric of a table. Decides the sort direction when partial
/// results are merged: `L2` ranks smaller distances first, `IP` ranks larger
/// inner products first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MetricKind {
    L2,
    Ip,
}

impl MetricKind {
    pub fn from_wire(metric_type: i32) -> ShardResult<Self> {
        match metric_type {
            1 => Ok(Self::L2),
            2 => Ok(Self::Ip),
            other => Err(ShardError::invalid_argument(format!(
                "unknown metric type: {other}"
            ))),
        }
    }

    pub fn as_wire(&self) -> i32 {
        match self {
            Self::L2 => 1,
            Self::Ip => 2,
        }
    }

    /// True when larger values rank first.
    pub fn descending(&self) -> bool {
        matches!(self, Self::Ip)
    }
}

// ---------------------------------------------------------------------------
// Table descriptor
// ---------------------------------------------------------------------------

/// Schema of one logical table as recorded in the metadata store.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDescriptor {
    pub name: String,
    pub dimension: i64,
    pub index_file_size: i64,
    pub metric: MetricKind,
}

// ---------------------------------------------------------------------------
// Time ranges
// ---------------------------------------------------------------------------

/// A calendar-date interval restricting which file shards a query considers.
/// The start is inclusive, the end exclusive; multiple ranges union.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl TimeRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> ShardResult<Self> {
        if start > end {
            return Err(ShardError::invalid_argument(format!(
                "time range start {start} is after end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// Parse a range from its wire representation (two date strings).
    pub fn parse(start: &str, end: &str) -> ShardResult<Self> {
        Self::new(parse_date(start)?, parse_date(end)?)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date < self.end
    }
}

/// Parse a calendar date from its wire form: `YYYY-MM-DD`, with the compact
/// `YYYYMMDD` accepted as well.
pub fn parse_date(value: &str) -> ShardResult<NaiveDate> {
    let trimmed = value.trim();
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(trimmed, "%Y%m%d"))
        .map_err(|_| ShardError::invalid_argument(format!("'{value}' is not a calendar date")))
}

// ---------------------------------------------------------------------------
// Store client
// ---------------------------------------------------------------------------

/// Read access to the authoritative shard/file metadata of the cluster.
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Resolve which backend owns which file shards of `table`, optionally
    /// restricted to the union of `ranges`. The returned mapping is
    /// address → file ids and never lists a file under two addresses.
    async fn lookup(
        &self,
        table: &str,
        ranges: Option<&[TimeRange]>,
    ) -> ShardResult<BTreeMap<String, Vec<String>>>;

    /// Fetch the descriptor of `table`, or `NotFound`.
    async fn describe(&self, table: &str) -> ShardResult<TableDescriptor>;
}

// ---------------------------------------------------------------------------
// Static store
// ---------------------------------------------------------------------------

struct StaticTable {
    descriptor: TableDescriptor,
    shards: Vec<StaticShard>,
}

struct StaticShard {
    address: String,
    file_id: String,
    date: NaiveDate,
}

/// A [`MetaStore`] whose topology is fixed at startup from configuration.
pub struct StaticMetaStore {
    tables: HashMap<String, StaticTable>,
}

impl StaticMetaStore {
    pub fn from_config(config: &MishardConfig) -> Self {
        let tables = config
            .tables
            .iter()
            .map(|(name, table)| {
                let descriptor = TableDescriptor {
                    name: name.clone(),
                    dimension: table.dimension,
                    index_file_size: table.index_file_size,
                    metric: table.metric,
                };
                let shards = table
                    .shards
                    .iter()
                    .map(|s| StaticShard {
                        address: s.address.clone(),
                        file_id: s.file_id.clone(),
                        date: s.date,
                    })
                    .collect();
                (name.clone(), StaticTable { descriptor, shards })
            })
            .collect();
        Self { tables }
    }
}

#[async_trait]
impl MetaStore for StaticMetaStore {
    async fn lookup(
        &self,
        table: &str,
        ranges: Option<&[TimeRange]>,
    ) -> ShardResult<BTreeMap<String, Vec<String>>> {
        let entry = self
            .tables
            .get(table)
            .ok_or_else(|| ShardError::not_found(format!("table '{table}' does not exist")))?;

        let mut mapping: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for shard in &entry.shards {
            let selected = match ranges {
                None => true,
                Some(ranges) => ranges.iter().any(|r| r.contains(shard.date)),
            };
            if selected {
                mapping
                    .entry(shard.address.clone())
                    .or_default()
                    .push(shard.file_id.clone());
            }
        }
        Ok(mapping)
    }

    async fn describe(&self, table: &str) -> ShardResult<TableDescriptor> {
        self.tables
            .get(table)
            .map(|t| t.descriptor.clone())
            .ok_or_else(|| ShardError::not_found(format!("table '{table}' does not exist")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
