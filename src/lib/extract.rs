//! Extraction of raw barcode segments and UMIs from aligned read records.
//!
//! One [`RawRecord`] is produced per first-of-pair alignment record.  The
//! first read carries the UMI and the `round1` barcode inline; the remaining
//! three barcode rounds are packed, reverse complemented, into the 24 base
//! `BC` tag.  Records that fail a length precondition still produce a row
//! (with missing values) so that every accepted read keeps its identifier;
//! the failure is tallied in [`ExtractionMetrics`].

use std::path::Path;

use anyhow::{Context, Result};
use bstr::BString;
use log::info;
use rust_htslib::bam::{self, record::Aux, Read};

use crate::catalog::BarcodeCategory;
use crate::metrics::ExtractionMetrics;
use crate::utils::s;

/// Expected length of the first read: an 8 base UMI followed by the 11 base
/// `round1` barcode.
pub const READ1_LENGTH: usize = 19;
/// Length of the UMI at the start of the first read.
pub const UMI_LENGTH: usize = 8;
/// Expected length of the `BC` tag holding rounds 2, 3a and 3b.
pub const BC_TAG_LENGTH: usize = 24;

/// The auxiliary tag holding the concatenated index reads.
const BC_TAG: &[u8] = b"BC";

/// Log progress after this many records.
const PROGRESS_INTERVAL: usize = 1_000_000;

/// One row of the raw barcode table: the read identifier plus the four
/// barcode segments and the UMI as sliced from the read, uncorrected.
///
/// `None` marks a value whose extraction failed a length precondition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub read_id: String,
    pub round1: Option<BString>,
    pub round2: Option<BString>,
    pub round3a: Option<BString>,
    pub round3b: Option<BString>,
    pub umi: Option<BString>,
}

impl RawRecord {
    /// The raw sequence extracted for the given category.
    pub fn barcode(&self, category: BarcodeCategory) -> Option<&BString> {
        match category {
            BarcodeCategory::Round1 => self.round1.as_ref(),
            BarcodeCategory::Round2 => self.round2.as_ref(),
            BarcodeCategory::Round3a => self.round3a.as_ref(),
            BarcodeCategory::Round3b => self.round3b.as_ref(),
        }
    }
}

/// An inclusive-exclusive window of record indices, to support chunked
/// re-runs over very large inputs.  Out-of-window records are skipped
/// without side effects.
#[derive(Debug, Clone, Copy)]
pub struct RecordWindow {
    pub start: usize,
    pub end: Option<usize>,
}

impl RecordWindow {
    pub fn new(start: usize, end: Option<usize>) -> Self {
        Self { start, end }
    }

    /// A window spanning the whole input.
    pub fn all() -> Self {
        Self { start: 0, end: None }
    }

    fn contains(&self, index: usize) -> bool {
        index >= self.start && self.end.map_or(true, |end| index < end)
    }

    fn is_past(&self, index: usize) -> bool {
        self.end.map_or(false, |end| index >= end)
    }
}

/// Reverse complement of a DNA sequence: A↔T and C↔G; any other byte,
/// including the undetermined base `N`, maps to itself.
pub fn reverse_complement(sequence: &[u8]) -> BString {
    sequence.iter().rev().map(|&base| complement(base)).collect::<Vec<u8>>().into()
}

fn complement(base: u8) -> u8 {
    match base {
        b'A' => b'T',
        b'T' => b'A',
        b'C' => b'G',
        b'G' => b'C',
        other => other,
    }
}

/// Extract one [`RawRecord`] from an alignment record.
///
/// Returns `None` for records that carry no barcode information in this
/// assay: unpaired records and second reads of a pair.
pub fn extract_record(record: &bam::Record, metrics: &mut ExtractionMetrics) -> Option<RawRecord> {
    if !record.is_paired() || record.is_last_in_template() {
        return None;
    }

    let read_id = s(record.qname());
    let sequence = record.seq().as_bytes();

    let (umi, round1) = if sequence.len() == READ1_LENGTH {
        (
            Some(BString::from(&sequence[..UMI_LENGTH])),
            Some(BString::from(&sequence[UMI_LENGTH..])),
        )
    } else {
        metrics.read1_not_19bp += 1;
        (None, None)
    };

    let (round2, round3a, round3b) = match record.aux(BC_TAG) {
        Ok(Aux::String(tag)) => {
            if tag.len() == BC_TAG_LENGTH {
                let rc = reverse_complement(tag.as_bytes());
                (
                    Some(BString::from(&rc[16..24])),
                    Some(BString::from(&rc[8..16])),
                    Some(BString::from(&rc[..8])),
                )
            } else {
                metrics.readi7i5_not_24bp += 1;
                (None, None, None)
            }
        }
        _ => {
            metrics.read1_not_bc_tag += 1;
            (None, None, None)
        }
    };

    Some(RawRecord { read_id, round1, round2, round3a, round3b, umi })
}

/// Scan a BAM file and produce the raw barcode table, one row per accepted
/// record within the window, in input order.
pub fn extract_from_path<P: AsRef<Path>>(
    path: P,
    window: RecordWindow,
    metrics: &mut ExtractionMetrics,
) -> Result<Vec<RawRecord>> {
    let path = path.as_ref();
    let mut reader = bam::Reader::from_path(path)
        .with_context(|| format!("Failed to open {}", path.to_string_lossy()))?;

    let mut record = bam::Record::new();
    let mut records = Vec::new();
    let mut index = 0usize;
    while let Some(result) = reader.read(&mut record) {
        result.with_context(|| format!("Failed to read record from {}", path.to_string_lossy()))?;
        if window.is_past(index) {
            break;
        }
        let in_window = window.contains(index);
        index += 1;
        if !in_window {
            continue;
        }
        if index % PROGRESS_INTERVAL == 0 {
            info!("Processed {} records", index);
        }
        metrics.records_seen += 1;
        if let Some(raw) = extract_record(&record, metrics) {
            records.push(raw);
        }
    }
    metrics.records_emitted += records.len() as u64;
    Ok(records)
}
