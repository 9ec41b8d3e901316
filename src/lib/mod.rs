//! A library for recovering single-cell combinatorial-indexing barcodes from
//! aligned reads and correcting them against a reference catalog.
//!
//! # Overview
//!
//! The flow of data is as follows:
//!
//! - [`extract`] scans the input BAM and produces one [`extract::RawRecord`]
//!   per accepted read: the UMI and `round1` barcode sliced from the read
//!   sequence, and the `round2`/`round3a`/`round3b` barcodes sliced from the
//!   reverse-complemented `BC` tag.  Malformed records are tallied in
//!   [`metrics::ExtractionMetrics`] and emitted with missing values.
//! - [`correct`] annotates every record against the
//!   [`catalog::BarcodeCatalog`]: exact-match and undetermined-base flags,
//!   then a Hamming nearest-neighbor search over the distinct erroneous
//!   sequences, broadcast back to the records that share them.
//! - [`output`] projects the annotated table into full or filtered form and
//!   serializes it as a gzip-compressed CSV sorted by read identifier.
#![deny(unsafe_code)]
#![allow(
    clippy::must_use_candidate,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions
)]
pub mod catalog;
pub mod correct;
pub mod extract;
pub mod metrics;
pub mod opts;
pub mod output;
pub mod run;
pub mod utils;
