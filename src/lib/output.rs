//! Projection of the annotated table into its serialized forms.
//!
//! Two output shapes are supported: full mode keeps every record together
//! with all correction bookkeeping columns, for provenance and debugging;
//! filtered mode applies corrections in place, drops records with
//! undetermined bases or corrections beyond the mismatch budget, and keeps
//! only the read identifier, the four barcodes and the UMI.  Rows are always
//! sorted by read identifier so repeated runs are byte identical.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::ArgEnum;
use gzp::{
    deflate::Gzip,
    par::compress::{ParCompress, ParCompressBuilder},
    ZWriter,
};
use itertools::Itertools;
use serde::Serialize;

use crate::catalog::{BarcodeCategory, UNRESOLVED_MARKER};
use crate::correct::{AnnotatedRecord, CategoryAnnotation};
use crate::extract::RawRecord;

/// How records are projected into the output table.
#[derive(ArgEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Keep every record with all correction bookkeeping columns.
    Full,
    /// Apply corrections in place and keep only budget-compliant records.
    Filtered,
}

/// One row of full-mode output: the raw values plus, per category, the
/// exact-match flag, the undetermined-base flag, the mismatch count and the
/// closest reference.  Flags are serialized as `0`/`1`; an absent mismatch
/// count as `0`; an absent closest reference as `X`.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct FullRow {
    read: String,
    round1: String,
    round2: String,
    round3a: String,
    round3b: String,
    umi: String,
    round1_correct: u8,
    #[serde(rename = "round1_contains_N")]
    round1_contains_n: u8,
    round1_mismatches: u32,
    round1_closest: String,
    round2_correct: u8,
    #[serde(rename = "round2_contains_N")]
    round2_contains_n: u8,
    round2_mismatches: u32,
    round2_closest: String,
    round3a_correct: u8,
    #[serde(rename = "round3a_contains_N")]
    round3a_contains_n: u8,
    round3a_mismatches: u32,
    round3a_closest: String,
    round3b_correct: u8,
    #[serde(rename = "round3b_contains_N")]
    round3b_contains_n: u8,
    round3b_mismatches: u32,
    round3b_closest: String,
}

/// One row of filtered-mode output: only the identifying columns remain and
/// barcodes have been corrected in place where the budget allowed.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct FilteredRow {
    read: String,
    round1: String,
    round2: String,
    round3a: String,
    round3b: String,
    umi: String,
}

/// The four bookkeeping columns derived from one category annotation.
struct CategoryColumns {
    correct: u8,
    contains_n: u8,
    mismatches: u32,
    closest: String,
}

impl CategoryColumns {
    fn new(annotation: &CategoryAnnotation) -> Self {
        Self {
            correct: u8::from(annotation.is_exact),
            contains_n: u8::from(annotation.contains_n),
            mismatches: annotation.mismatches.unwrap_or(0),
            closest: annotation
                .nearest
                .as_ref()
                .map_or_else(|| UNRESOLVED_MARKER.to_string(), ToString::to_string),
        }
    }
}

fn barcode_string(raw: &RawRecord, category: BarcodeCategory) -> String {
    raw.barcode(category).map(ToString::to_string).unwrap_or_default()
}

fn umi_string(raw: &RawRecord) -> String {
    raw.umi.as_ref().map(ToString::to_string).unwrap_or_default()
}

impl FullRow {
    fn new(record: &AnnotatedRecord) -> Self {
        let raw = &record.raw;
        let [round1, round2, round3a, round3b] =
            BarcodeCategory::ALL.map(|category| barcode_string(raw, category));
        let [c1, c2, c3a, c3b] =
            BarcodeCategory::ALL.map(|category| CategoryColumns::new(record.annotation(category)));
        Self {
            read: raw.read_id.clone(),
            round1,
            round2,
            round3a,
            round3b,
            umi: umi_string(raw),
            round1_correct: c1.correct,
            round1_contains_n: c1.contains_n,
            round1_mismatches: c1.mismatches,
            round1_closest: c1.closest,
            round2_correct: c2.correct,
            round2_contains_n: c2.contains_n,
            round2_mismatches: c2.mismatches,
            round2_closest: c2.closest,
            round3a_correct: c3a.correct,
            round3a_contains_n: c3a.contains_n,
            round3a_mismatches: c3a.mismatches,
            round3a_closest: c3a.closest,
            round3b_correct: c3b.correct,
            round3b_contains_n: c3b.contains_n,
            round3b_mismatches: c3b.mismatches,
            round3b_closest: c3b.closest,
        }
    }
}

impl FilteredRow {
    fn new(record: &AnnotatedRecord, max_mismatches: u32) -> Option<Self> {
        if record.contains_undetermined() {
            return None;
        }
        // Records whose best correction exceeds the budget are excluded
        // entirely; exact matches and unresolved sequences carry no count.
        let over_budget = BarcodeCategory::ALL.iter().any(|&category| {
            record
                .annotation(category)
                .mismatches
                .map_or(false, |mismatches| mismatches > max_mismatches)
        });
        if over_budget {
            return None;
        }

        let corrected = |category: BarcodeCategory| -> String {
            let annotation = record.annotation(category);
            match (&annotation.nearest, annotation.mismatches) {
                (Some(nearest), Some(mismatches))
                    if !annotation.is_exact && mismatches <= max_mismatches =>
                {
                    nearest.to_string()
                }
                _ => barcode_string(&record.raw, category),
            }
        };

        let [round1, round2, round3a, round3b] = BarcodeCategory::ALL.map(corrected);
        Some(Self {
            read: record.raw.read_id.clone(),
            round1,
            round2,
            round3a,
            round3b,
            umi: umi_string(&record.raw),
        })
    }
}

/// Project records into full-mode rows, sorted by read identifier.
pub fn full_rows(records: &[AnnotatedRecord]) -> Vec<FullRow> {
    records.iter().map(FullRow::new).sorted_by(|a, b| a.read.cmp(&b.read)).collect()
}

/// Project records into filtered-mode rows under `max_mismatches`, sorted by
/// read identifier.
pub fn filtered_rows(records: &[AnnotatedRecord], max_mismatches: u32) -> Vec<FilteredRow> {
    records
        .iter()
        .filter_map(|record| FilteredRow::new(record, max_mismatches))
        .sorted_by(|a, b| a.read.cmp(&b.read))
        .collect()
}

/// Serialize rows as a gzip-compressed CSV.
///
/// The table is written next to the final path and renamed into place only
/// after the compressor finishes, so a failed run leaves no partial output
/// at the destination.
pub fn write_table<P, S>(path: P, rows: &[S], compressor_threads: usize) -> Result<()>
where
    P: AsRef<Path>,
    S: Serialize,
{
    let path = path.as_ref();
    let mut partial = path.as_os_str().to_owned();
    partial.push(".partial");
    let partial = PathBuf::from(partial);

    let file = File::create(&partial)
        .with_context(|| format!("Failed to create {}", partial.to_string_lossy()))?;
    let compressor: ParCompress<Gzip> = ParCompressBuilder::new()
        .num_threads(compressor_threads)?
        .from_writer(BufWriter::new(file));

    let mut writer = csv::Writer::from_writer(compressor);
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    let mut compressor =
        writer.into_inner().map_err(|error| anyhow!("Failed to finish output CSV: {}", error))?;
    compressor.finish()?;

    std::fs::rename(&partial, path)
        .with_context(|| format!("Failed to move output into place at {}", path.to_string_lossy()))?;
    Ok(())
}

#[cfg(test)]
mod test {
    use bstr::BString;
    use rstest::rstest;
    use tempfile::tempdir;

    use super::{filtered_rows, full_rows, write_table, FilteredRow};
    use crate::catalog::{BarcodeCatalog, BarcodeCategory};
    use crate::correct::{annotate_records, AnnotatedRecord};
    use crate::extract::RawRecord;

    fn raw(read_id: &str, round1: &str, round2: &str) -> RawRecord {
        let field = |value: &str| {
            if value.is_empty() {
                None
            } else {
                Some(BString::from(value))
            }
        };
        RawRecord {
            read_id: read_id.to_string(),
            round1: field(round1),
            round2: field(round2),
            round3a: Some(BString::from("TTTTTTTT")),
            round3b: Some(BString::from("AACCGGTT")),
            umi: Some(BString::from("ACGTACGT")),
        }
    }

    fn annotated(records: Vec<RawRecord>) -> Vec<AnnotatedRecord> {
        let catalog = BarcodeCatalog::from_entries(vec![
            (BarcodeCategory::Round1, BString::from("AAAAAAAAAAA")),
            (BarcodeCategory::Round2, BString::from("ACTGACTG")),
            (BarcodeCategory::Round3a, BString::from("TTTTTTTT")),
            (BarcodeCategory::Round3b, BString::from("AACCGGTT")),
        ])
        .unwrap();
        annotate_records(records, &catalog)
    }

    fn to_csv<S: serde::Serialize>(rows: &[S]) -> String {
        let mut writer = csv::Writer::from_writer(vec![]);
        for row in rows {
            writer.serialize(row).unwrap();
        }
        String::from_utf8(writer.into_inner().unwrap()).unwrap()
    }

    #[test]
    fn test_full_mode_keeps_every_record_and_provenance() {
        let records = annotated(vec![
            raw("q2", "AAAAAAAAAAT", "ACTGACTG"),
            raw("q1", "AAAAAAAAAAA", "ACTGACTN"),
        ]);
        let rows = full_rows(&records);
        assert_eq!(rows.len(), 2);

        let csv = to_csv(&rows);
        let mut lines = csv.lines();
        assert_eq!(
            lines.next().unwrap(),
            "read,round1,round2,round3a,round3b,umi,\
             round1_correct,round1_contains_N,round1_mismatches,round1_closest,\
             round2_correct,round2_contains_N,round2_mismatches,round2_closest,\
             round3a_correct,round3a_contains_N,round3a_mismatches,round3a_closest,\
             round3b_correct,round3b_contains_N,round3b_mismatches,round3b_closest"
        );
        // Sorted by read identifier; q1 is exact for round1, N-flagged for
        // round2; q2 is one mismatch off for round1.
        assert_eq!(
            lines.next().unwrap(),
            "q1,AAAAAAAAAAA,ACTGACTN,TTTTTTTT,AACCGGTT,ACGTACGT,\
             1,0,0,X,0,1,0,X,1,0,0,X,1,0,0,X"
        );
        assert_eq!(
            lines.next().unwrap(),
            "q2,AAAAAAAAAAT,ACTGACTG,TTTTTTTT,AACCGGTT,ACGTACGT,\
             0,0,1,AAAAAAAAAAA,1,0,0,X,1,0,0,X,1,0,0,X"
        );
    }

    #[test]
    fn test_filtered_mode_corrects_within_budget() {
        let records = annotated(vec![raw("q1", "AAAAAAAAAAT", "ACTGACTG")]);
        let rows = filtered_rows(&records, 1);
        assert_eq!(rows.len(), 1);

        let csv = to_csv(&rows);
        let mut lines = csv.lines();
        assert_eq!(lines.next().unwrap(), "read,round1,round2,round3a,round3b,umi");
        assert_eq!(lines.next().unwrap(), "q1,AAAAAAAAAAA,ACTGACTG,TTTTTTTT,AACCGGTT,ACGTACGT");
    }

    #[test]
    fn test_filtered_mode_drops_over_budget_records() {
        let records = annotated(vec![raw("q1", "AAAAAAAAAAT", "ACTGACTG")]);
        assert_eq!(filtered_rows(&records, 0).len(), 0);
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(4)]
    fn test_filtered_mode_drops_undetermined_regardless_of_budget(#[case] max_mismatches: u32) {
        let records = annotated(vec![raw("q1", "AAAAAAAAAAA", "NNNNNNNN")]);
        assert_eq!(filtered_rows(&records, max_mismatches).len(), 0);
    }

    #[test]
    fn test_filtered_mode_is_monotone_in_the_budget() {
        let records = annotated(vec![
            raw("q1", "AAAAAAAAAAA", "ACTGACTG"),
            raw("q2", "AAAAAAAAAAT", "ACTGACTG"),
            raw("q3", "AAAAAAAATTT", "ACTGACTG"),
            raw("q4", "AAAAAAAAAAA", "NNNNNNNN"),
        ]);
        let mut previous = 0;
        for max_mismatches in 0..=4 {
            let retained = filtered_rows(&records, max_mismatches).len();
            assert!(retained >= previous, "retained rows shrank at budget {}", max_mismatches);
            previous = retained;
        }
        assert_eq!(previous, 3);
    }

    #[test]
    fn test_filtered_mode_keeps_missing_values_untouched() {
        let records = annotated(vec![raw("q1", "", "ACTGACTG")]);
        let rows = filtered_rows(&records, 1);
        assert_eq!(
            rows,
            vec![FilteredRow {
                read: "q1".to_string(),
                round1: String::new(),
                round2: "ACTGACTG".to_string(),
                round3a: "TTTTTTTT".to_string(),
                round3b: "AACCGGTT".to_string(),
                umi: "ACGTACGT".to_string(),
            }]
        );
    }

    #[test]
    fn test_rows_sort_by_read_identifier() {
        let records = annotated(vec![
            raw("q10", "AAAAAAAAAAA", "ACTGACTG"),
            raw("q1", "AAAAAAAAAAA", "ACTGACTG"),
            raw("q2", "AAAAAAAAAAA", "ACTGACTG"),
        ]);
        let reads: Vec<String> =
            filtered_rows(&records, 1).into_iter().map(|row| row.read).collect();
        assert_eq!(reads, vec!["q1", "q10", "q2"]);
    }

    #[test]
    fn test_write_table_is_gzip_and_atomic() {
        use std::io::Read;

        let dir = tempdir().unwrap();
        let path = dir.path().join("barcodes.csv.gz");
        let records = annotated(vec![raw("q1", "AAAAAAAAAAA", "ACTGACTG")]);
        let rows = filtered_rows(&records, 1);
        write_table(&path, &rows, 2).unwrap();

        assert!(path.is_file());
        assert!(!dir.path().join("barcodes.csv.gz.partial").exists());

        let mut decoder = flate2::read::MultiGzDecoder::new(std::fs::File::open(&path).unwrap());
        let mut contents = String::new();
        decoder.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, to_csv(&rows));
    }
}
