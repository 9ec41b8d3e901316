//! End-to-end orchestration of a barcode extraction run.
//!
//! A run either completes and leaves a full, internally consistent table at
//! the output path together with a logged counter report, or it fails before
//! any output is finalized.

use anyhow::{ensure, Context, Result};
use log::info;

use crate::catalog::{BarcodeCatalog, BarcodeCategory};
use crate::correct::annotate_records;
use crate::extract::{extract_from_path, RecordWindow};
use crate::metrics::ExtractionMetrics;
use crate::opts::Opts;
use crate::output::{filtered_rows, full_rows, write_table, OutputMode};

pub fn run(opts: Opts) -> Result<()> {
    let catalog = BarcodeCatalog::from_path(&opts.annotation).with_context(|| {
        format!("Failed to load barcode annotation from {}", opts.annotation.to_string_lossy())
    })?;
    for category in BarcodeCategory::ALL {
        info!("{}: {} reference barcodes", category, catalog.entries(category).len());
    }
    ensure!(
        opts.input.is_file(),
        "Input {} does not exist or is not a file",
        opts.input.to_string_lossy()
    );

    if opts.dry_run {
        info!("Dry run requested, exiting before record extraction");
        return Ok(());
    }

    info!("Extracting barcodes from {}", opts.input.to_string_lossy());
    let window = RecordWindow::new(opts.start, opts.end);
    let mut metrics = ExtractionMetrics::default();
    let records = extract_from_path(&opts.input, window, &mut metrics)?;
    info!("Extracted {} records", records.len());

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(opts.threads)
        .build()
        .context("Failed to build the correction thread pool")?;
    info!("Correcting barcodes with {} threads", opts.threads);
    let annotated = pool.install(|| annotate_records(records, &catalog));

    match opts.mode {
        OutputMode::Full => {
            write_table(&opts.output, &full_rows(&annotated), opts.compressor_threads)?;
        }
        OutputMode::Filtered => {
            let rows = filtered_rows(&annotated, opts.max_mismatches);
            info!("Retained {} of {} records", rows.len(), annotated.len());
            write_table(&opts.output, &rows, opts.compressor_threads)?;
        }
    }
    info!("Wrote {}", opts.output.to_string_lossy());

    metrics.report();
    if let Some(path) = &opts.metrics {
        metrics
            .to_file(path)
            .with_context(|| format!("Failed to write metrics to {}", path.to_string_lossy()))?;
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use std::io::Read;
    use std::path::{Path, PathBuf};

    use rust_htslib::bam;
    use tempfile::{tempdir, TempDir};

    use super::run;
    use crate::extract::test_commons::{
        alignment, write_bam, FLAGS_FIRST_OF_PAIR, FLAGS_SECOND_OF_PAIR,
    };
    use crate::extract::reverse_complement;
    use crate::opts::Opts;
    use crate::output::OutputMode;

    const UMI: &str = "ACGTACGT";

    /// Build the `BC` tag that reverse complements into the given rounds.
    fn bc_tag(round2: &str, round3a: &str, round3b: &str) -> String {
        let rc = format!("{}{}{}", round3b, round3a, round2);
        reverse_complement(rc.as_bytes()).to_string()
    }

    fn read1(name: &str, round1: &str, round2: &str) -> bam::Record {
        let sequence = format!("{}{}", UMI, round1);
        let tag = bc_tag(round2, "TTTTTTTT", "AACCGGTT");
        alignment(name, sequence.as_bytes(), FLAGS_FIRST_OF_PAIR, Some(tag.as_str()))
    }

    fn write_annotation(dir: &Path) -> PathBuf {
        let path = dir.join("annotation.csv");
        let bytes = "\
barcode_type,barcode_sequence
round1,AAAAAAAAAAA
round2,ACTGACTG
round3a,TTTTTTTT
round3b,AACCGGTT
";
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn setup_input(dir: &TempDir) -> (PathBuf, PathBuf) {
        let bam_path = dir.path().join("reads.bam");
        let records = vec![
            read1("q1", "AAAAAAAAAAA", "ACTGACTG"),
            read1("q2", "AAAAAAAAAAT", "ACTGACTG"),
            alignment("q2", b"ACGT", FLAGS_SECOND_OF_PAIR, None),
            read1("q3", "AAAAAAAAAAA", "ACTGACTN"),
        ];
        write_bam(&bam_path, &records);
        (bam_path, write_annotation(dir.path()))
    }

    fn slurp_gzip_csv(path: &Path) -> Vec<String> {
        let mut decoder =
            flate2::read::MultiGzDecoder::new(std::fs::File::open(path).unwrap());
        let mut contents = String::new();
        decoder.read_to_string(&mut contents).unwrap();
        contents.lines().map(ToString::to_string).collect()
    }

    #[test]
    fn test_filtered_run_corrects_and_drops() {
        let dir = tempdir().unwrap();
        let (input, annotation) = setup_input(&dir);
        let output = dir.path().join("barcodes.csv.gz");
        let metrics = dir.path().join("metrics.tsv");

        let opts = Opts {
            input,
            annotation,
            output: output.clone(),
            metrics: Some(metrics.clone()),
            ..Opts::default()
        };
        run(opts).unwrap();

        let lines = slurp_gzip_csv(&output);
        assert_eq!(
            lines,
            vec![
                "read,round1,round2,round3a,round3b,umi".to_string(),
                "q1,AAAAAAAAAAA,ACTGACTG,TTTTTTTT,AACCGGTT,ACGTACGT".to_string(),
                "q2,AAAAAAAAAAA,ACTGACTG,TTTTTTTT,AACCGGTT,ACGTACGT".to_string(),
            ]
        );

        let report = std::fs::read_to_string(&metrics).unwrap();
        assert!(report.contains("records_seen\t4"));
        assert!(report.contains("records_emitted\t3"));
    }

    #[test]
    fn test_zero_budget_drops_correctable_records() {
        let dir = tempdir().unwrap();
        let (input, annotation) = setup_input(&dir);
        let output = dir.path().join("barcodes.csv.gz");

        let opts = Opts {
            input,
            annotation,
            output: output.clone(),
            max_mismatches: 0,
            ..Opts::default()
        };
        run(opts).unwrap();

        let lines = slurp_gzip_csv(&output);
        assert_eq!(lines.len(), 2); // header + q1
        assert!(lines[1].starts_with("q1,"));
    }

    #[test]
    fn test_full_run_keeps_every_record() {
        let dir = tempdir().unwrap();
        let (input, annotation) = setup_input(&dir);
        let output = dir.path().join("barcodes.csv.gz");

        let opts = Opts {
            input,
            annotation,
            output: output.clone(),
            mode: OutputMode::Full,
            ..Opts::default()
        };
        run(opts).unwrap();

        let lines = slurp_gzip_csv(&output);
        assert_eq!(lines.len(), 4); // header + q1..q3
        assert!(lines[0].contains("round1_mismatches"));
        assert!(lines[2].contains(",AAAAAAAAAAT,"));
    }

    #[test]
    fn test_repeated_runs_are_deterministic() {
        let dir = tempdir().unwrap();
        let (input, annotation) = setup_input(&dir);
        let first = dir.path().join("first.csv.gz");
        let second = dir.path().join("second.csv.gz");

        for output in [&first, &second] {
            let opts = Opts {
                input: input.clone(),
                annotation: annotation.clone(),
                output: output.clone(),
                ..Opts::default()
            };
            run(opts).unwrap();
        }
        assert_eq!(slurp_gzip_csv(&first), slurp_gzip_csv(&second));
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let dir = tempdir().unwrap();
        let (input, annotation) = setup_input(&dir);
        let output = dir.path().join("barcodes.csv.gz");

        let opts =
            Opts { input, annotation, output: output.clone(), dry_run: true, ..Opts::default() };
        run(opts).unwrap();
        assert!(!output.exists());
    }

    #[test]
    fn test_missing_annotation_fails_before_output() {
        let dir = tempdir().unwrap();
        let (input, _) = setup_input(&dir);
        let output = dir.path().join("barcodes.csv.gz");

        let opts = Opts {
            input,
            annotation: dir.path().join("missing.csv"),
            output: output.clone(),
            ..Opts::default()
        };
        assert!(run(opts).is_err());
        assert!(!output.exists());
    }
}
