//! Diagnostics collected while extracting barcodes.
//!
//! The extractor increments a named counter for every malformed record it
//! recovers from; the counters are carried in an explicit
//! [`ExtractionMetrics`] value rather than global state so that independent
//! record windows can be processed separately and folded together with
//! [`ExtractionMetrics::update_with`].  At the end of a run the counters are
//! logged and may additionally be written to a two-column TSV.

use std::path::Path;

use anyhow::Result;
use fgoxide::io::DelimFile;
use log::info;
use serde::Serialize;

/// Counts of records seen and of extraction failures recovered from.
///
/// The counter names match the failure tags reported by the pipeline:
/// `read1_not_19bp`, `readi7i5_not_24bp` and `read1_not_BC_tag`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExtractionMetrics {
    /// Records whose first-read sequence was not the expected 19 bases.
    pub read1_not_19bp: u64,
    /// Records whose `BC` tag was present but not 24 bases.
    pub readi7i5_not_24bp: u64,
    /// Records carrying no `BC` tag at all.
    pub read1_not_bc_tag: u64,
    /// Records inside the requested window, before pair filtering.
    pub records_seen: u64,
    /// Rows emitted into the raw barcode table.
    pub records_emitted: u64,
}

/// A single named counter as serialized into the metrics file.
#[derive(Debug, Serialize)]
struct CounterRow<'a> {
    counter: &'a str,
    count: u64,
}

impl ExtractionMetrics {
    /// Fold the counts from another record window into this one.
    pub fn update_with(&mut self, other: &Self) {
        self.read1_not_19bp += other.read1_not_19bp;
        self.readi7i5_not_24bp += other.readi7i5_not_24bp;
        self.read1_not_bc_tag += other.read1_not_bc_tag;
        self.records_seen += other.records_seen;
        self.records_emitted += other.records_emitted;
    }

    fn rows(&self) -> Vec<CounterRow<'_>> {
        vec![
            CounterRow { counter: "records_seen", count: self.records_seen },
            CounterRow { counter: "records_emitted", count: self.records_emitted },
            CounterRow { counter: "read1_not_19bp", count: self.read1_not_19bp },
            CounterRow { counter: "readi7i5_not_24bp", count: self.readi7i5_not_24bp },
            CounterRow { counter: "read1_not_BC_tag", count: self.read1_not_bc_tag },
        ]
    }

    /// Log every counter at the end of a run.
    pub fn report(&self) {
        for row in self.rows() {
            info!("{}: {}", row.counter, row.count);
        }
    }

    /// Write the counters as a two-column TSV.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let delim = DelimFile::default();
        delim.write_tsv(&path, self.rows())?;
        Ok(())
    }
}
