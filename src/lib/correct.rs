//! Correction of observed barcodes against the reference catalog.
//!
//! Each of the four barcode rounds is handled independently: every record is
//! first flagged for exact catalog membership and for undetermined bases,
//! then the *distinct* set of erroneous, N-free sequences is matched against
//! the catalog by Hamming distance and the result broadcast back to every
//! record sharing the sequence.  The number of distinct erroneous barcodes
//! is typically far smaller than the number of reads, and the matching step
//! is quadratic in (distinct queries × catalog size), so deduplicating first
//! bounds the dominant cost.

use std::collections::HashMap;

use ahash::{AHashSet, RandomState};
use bstr::{BString, ByteSlice};
use rayon::prelude::*;

use crate::catalog::{BarcodeCatalog, BarcodeCategory};
use crate::extract::RawRecord;

/// Per-category annotation attached to a record by the correction engine.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CategoryAnnotation {
    /// Whether the raw sequence is present in the catalog.
    pub is_exact: bool,
    /// Whether the raw sequence contains an undetermined base.
    pub contains_n: bool,
    /// Hamming distance to `nearest`, when a search was performed.
    pub mismatches: Option<u32>,
    /// The closest catalog entry, when a search was performed.  `None` for
    /// exact matches, N-containing or missing sequences, and for categories
    /// whose catalog is empty.
    pub nearest: Option<BString>,
}

/// A [`RawRecord`] annotated with correction results for all four rounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotatedRecord {
    pub raw: RawRecord,
    annotations: [CategoryAnnotation; 4],
}

impl AnnotatedRecord {
    /// The annotation for one category.
    pub fn annotation(&self, category: BarcodeCategory) -> &CategoryAnnotation {
        &self.annotations[category.index()]
    }

    /// Whether any category's sequence contains an undetermined base.
    pub fn contains_undetermined(&self) -> bool {
        self.annotations.iter().any(|annotation| annotation.contains_n)
    }
}

/// Hamming distance on slices of bytes.
///
/// Skips length check and will stop comparing after alpha is exhausted.
fn hamming_distance(alpha: &[u8], beta: &[u8]) -> u32 {
    alpha.iter().zip(beta.iter()).map(|(a, b)| u32::from(a != b)).sum()
}

/// Find the catalog entry closest to `sequence`, keeping the first entry at
/// minimum distance so that ties resolve to annotation order.
fn nearest_reference<'a>(sequence: &[u8], entries: &'a [BString]) -> Option<(u32, &'a BString)> {
    let mut best: Option<(u32, &BString)> = None;
    for entry in entries {
        let dist = hamming_distance(sequence, entry);
        if best.map_or(true, |(best_dist, _)| dist < best_dist) {
            best = Some((dist, entry));
        }
    }
    best
}

/// Annotate every record against the catalog.
///
/// Categories are processed independently; their columns are disjoint, so
/// the order has no observable effect.
pub fn annotate_records(records: Vec<RawRecord>, catalog: &BarcodeCatalog) -> Vec<AnnotatedRecord> {
    let mut annotated: Vec<AnnotatedRecord> = records
        .into_iter()
        .map(|raw| AnnotatedRecord { raw, annotations: Default::default() })
        .collect();

    for category in BarcodeCategory::ALL {
        annotate_category(&mut annotated, category, catalog);
    }
    annotated
}

fn annotate_category(
    records: &mut [AnnotatedRecord],
    category: BarcodeCategory,
    catalog: &BarcodeCatalog,
) {
    // Exact-match and N flags: independent boolean passes over the table.
    for record in records.iter_mut() {
        let (is_exact, contains_n) = match record.raw.barcode(category) {
            Some(sequence) => (
                catalog.contains(category, sequence.as_bstr()),
                bytecount::count(sequence, b'N') > 0,
            ),
            None => (false, false),
        };
        let annotation = &mut record.annotations[category.index()];
        annotation.is_exact = is_exact;
        annotation.contains_n = contains_n;
    }

    // Distinct erroneous, N-free sequences; undetermined bases are a hard
    // exclusion from correction, not a penalty.
    let candidates: AHashSet<BString> = records
        .iter()
        .filter(|record| {
            let annotation = record.annotation(category);
            !annotation.is_exact && !annotation.contains_n
        })
        .filter_map(|record| record.raw.barcode(category).cloned())
        .collect();

    // An empty catalog leaves every candidate permanently unresolved.
    if candidates.is_empty() || catalog.is_empty(category) {
        return;
    }

    let entries = catalog.entries(category);
    let corrections: HashMap<BString, (u32, BString), RandomState> = candidates
        .into_par_iter()
        .filter_map(|sequence| {
            nearest_reference(&sequence, entries)
                .map(|(dist, nearest)| (sequence, (dist, nearest.clone())))
        })
        .collect();

    // Broadcast each correction to every record sharing the sequence.
    for record in records.iter_mut() {
        let annotation = record.annotation(category);
        if annotation.is_exact || annotation.contains_n {
            continue;
        }
        let correction = record
            .raw
            .barcode(category)
            .and_then(|sequence| corrections.get(sequence))
            .cloned();
        if let Some((mismatches, nearest)) = correction {
            let annotation = &mut record.annotations[category.index()];
            annotation.mismatches = Some(mismatches);
            annotation.nearest = Some(nearest);
        }
    }
}
