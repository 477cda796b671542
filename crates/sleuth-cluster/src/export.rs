//! Cluster export: `address,cluster` rows, one per labelled token.

use std::io::{BufWriter, Write};

use sleuth_core::error::SleuthError;
use tracing::info;

use crate::disjoint_set::DisjointSet;

pub const EXPORT_HEADER: &str = "address,cluster";

/// Flatten `forest` and write every `(token, root)` pair as a CSV row after
/// a header line. Returns the number of rows written.
///
/// Root ids are forest indices and only meaningful within one export.
pub fn write_clusters<W: Write>(forest: &mut DisjointSet, out: W) -> Result<usize, SleuthError> {
    forest.finalize();

    let mut out = BufWriter::new(out);
    writeln!(out, "{EXPORT_HEADER}")?;
    let mut rows = 0usize;
    for (token, root) in forest.clusters() {
        writeln!(out, "{token},{root}")?;
        rows += 1;
    }
    out.flush()?;

    info!(rows, clusters = forest.cluster_count(), "cluster export written");
    Ok(rows)
}
