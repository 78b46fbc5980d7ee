//! Partial-result merger.
//!
//! Combines per-shard partial top-K lists into the final ordered answer.
//! For every query position the rows of all partials are concatenated in
//! plan order and stably sorted by distance — ascending for `L2`, descending
//! for `IP`, NaN always last. Stability is what implements the tie-break:
//! equal distances resolve by partial index first, then by the row's
//! position within its partial, so a fixed partial order always produces the
//! same answer.

use std::cmp::Ordering;

use crate::backend::{ResultRow, TopKBlock};
use crate::error::{ShardError, ShardResult};
use crate::meta::MetricKind;

/// One backend's answer for its assigned files: either `nq` blocks aligned
/// with the input query order, or the error that sub-query ended in.
#[derive(Debug, Clone)]
pub struct Partial {
    pub address: String,
    pub result: ShardResult<Vec<TopKBlock>>,
}

impl Partial {
    pub fn ok(address: impl Into<String>, blocks: Vec<TopKBlock>) -> Self {
        Self {
            address: address.into(),
            result: Ok(blocks),
        }
    }

    pub fn err(address: impl Into<String>, error: ShardError) -> Self {
        Self {
            address: address.into(),
            result: Err(error),
        }
    }
}

fn compare(metric: MetricKind, a: &ResultRow, b: &ResultRow) -> Ordering {
    match (a.distance.is_nan(), b.distance.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => {
            let ordering = a
                .distance
                .partial_cmp(&b.distance)
                .unwrap_or(Ordering::Equal);
            if metric.descending() {
                ordering.reverse()
            } else {
                ordering
            }
        }
    }
}

/// Merge `partials` into at most `topk` rows per query position.
///
/// The first error-bearing partial (in plan order) becomes the overall
/// status and the result list is empty. Partials carrying zero blocks
/// contribute nothing; the remaining partials must agree on the number of
/// query positions or the input is considered malformed.
pub fn merge(
    partials: &[Partial],
    topk: usize,
    metric: MetricKind,
) -> ShardResult<Vec<TopKBlock>> {
    let mut block_lists = Vec::with_capacity(partials.len());
    for partial in partials {
        match &partial.result {
            Ok(blocks) => {
                if !blocks.is_empty() {
                    block_lists.push((partial.address.as_str(), blocks));
                }
            }
            Err(error) => return Err(error.clone()),
        }
    }

    let Some((_, first)) = block_lists.first() else {
        return Ok(Vec::new());
    };

    let nq = first.len();
    for (address, blocks) in &block_lists {
        if blocks.len() != nq {
            return Err(ShardError::internal(format!(
                "malformed partial from {address}: {} blocks where peers carried {nq}",
                blocks.len()
            )));
        }
    }

    let mut merged = Vec::with_capacity(nq);
    for position in 0..nq {
        let mut rows: Vec<ResultRow> = block_lists
            .iter()
            .flat_map(|(_, blocks)| blocks[position].iter().copied())
            .collect();
        rows.sort_by(|a, b| compare(metric, a, b));
        rows.truncate(topk);
        merged.push(rows);
    }
    Ok(merged)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
