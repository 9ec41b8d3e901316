#![forbid(unsafe_code)]

use std::path::PathBuf;

use clap::Parser;
use env_logger::Env;

use crate::output::OutputMode;
use crate::utils::NUM_CPU;

pub static TOOL_NAME: &str = "scibc";

static SHORT_USAGE: &str =
    "Extracts and corrects combinatorial-indexing cell barcodes from aligned reads.";

static LONG_USAGE: &str = "
Extracts and corrects combinatorial-indexing cell barcodes from aligned reads.

Each first-of-pair record contributes one row to the output table: the 8 base
UMI and 11 base round1 barcode sliced from the read sequence, and the round2,
round3a and round3b barcodes sliced from the reverse complement of the 24 base
BC tag.  Barcodes are corrected against the reference annotation by Hamming
distance, deduplicating erroneous sequences before the search so the cost
scales with distinct error patterns rather than read volume.

The annotation file must be a CSV with `barcode_type` and `barcode_sequence`
columns; `barcode_type` is one of round1, round2, round3a, round3b.  The
output is a gzip-compressed CSV sorted by read name.

Example invocation:

scibc \\
  sample.bam \\
  --annotation barcodes.csv \\
  --mode filtered \\
  --max-mismatches 1 \\
  --output sample.barcodes.csv.gz
";

#[derive(Parser, Debug, Clone)]
#[clap(name = TOOL_NAME, version, about = SHORT_USAGE, long_about = LONG_USAGE, term_width = 0)]
pub struct Opts {
    /// Input BAM file with the reads to process.
    #[clap(display_order = 1)]
    pub input: PathBuf,

    /// Path to the barcode annotation CSV.
    #[clap(long, short = 'a', display_order = 2)]
    pub annotation: PathBuf,

    /// The output file for the barcode table.
    #[clap(long, short = 'o', default_value = "barcodes.csv.gz", display_order = 3)]
    pub output: PathBuf,

    /// Whether to keep every record with full correction provenance (full),
    /// or to apply corrections and keep only budget-compliant records
    /// (filtered).
    #[clap(long, arg_enum, default_value = "filtered", display_order = 11)]
    pub mode: OutputMode,

    /// Maximum mismatches allowed when correcting a barcode.
    #[clap(long, short = 'm', default_value = "1", display_order = 11)]
    pub max_mismatches: u32,

    /// Index of the first input record to process.
    #[clap(long, default_value = "0", display_order = 21)]
    pub start: usize,

    /// Index one past the last input record to process.
    ///
    /// [default: end of input]
    #[clap(long, display_order = 21)]
    pub end: Option<usize>,

    /// Validate the inputs and the annotation, then exit without processing
    /// any records.
    #[clap(long, short = 'd', display_order = 21)]
    pub dry_run: bool,

    /// Optional file for the extraction counter report.
    #[clap(long, display_order = 31)]
    pub metrics: Option<PathBuf>,

    /// Number of threads for barcode correction.
    #[clap(long, short = 't', default_value = NUM_CPU.as_str(), display_order = 31)]
    pub threads: usize,

    /// Number of threads for compressing the output table.
    #[clap(long, default_value = "4", display_order = 31)]
    pub compressor_threads: usize,
}

/// Implement defaults that match the CLI options to allow for easier testing.
///
/// Note that these defaults exist only within test code.
#[cfg(test)]
impl Default for Opts {
    fn default() -> Self {
        Self {
            input: PathBuf::default(),
            annotation: PathBuf::default(),
            output: PathBuf::from("barcodes.csv.gz"),
            mode: OutputMode::Filtered,
            max_mismatches: 1,
            start: 0,
            end: None,
            dry_run: false,
            metrics: None,
            threads: 2,
            compressor_threads: 2,
        }
    }
}

/// Parse args and set up logging.
pub fn setup() -> Opts {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    Opts::parse()
}
