//! The reference barcode catalog: the set of valid sequences for each barcode
//! round, loaded once from a barcode annotation CSV and read-only afterwards.

use std::path::Path;

use ahash::AHashSet;
use bstr::{BStr, BString};
use serde::Deserialize;
use thiserror::Error;

/// The bases that are allowed in a reference barcode sequence.
const ALLOWED_BASES: &[u8] = &[b'A', b'C', b'T', b'G'];

/// Marker emitted in place of a reference sequence when no correction was
/// computed for a barcode.
pub const UNRESOLVED_MARKER: &str = "X";

/// One of the four combinatorial-indexing barcode rounds.
///
/// `Round1` is carried inline in the first read; `Round2`, `Round3a` and
/// `Round3b` are packed into the 24 base `BC` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BarcodeCategory {
    Round1,
    Round2,
    Round3a,
    Round3b,
}

impl BarcodeCategory {
    /// All categories in canonical (output column) order.
    pub const ALL: [BarcodeCategory; 4] =
        [Self::Round1, Self::Round2, Self::Round3a, Self::Round3b];

    /// The category name as it appears in the annotation file and in output
    /// column headers.
    pub fn name(self) -> &'static str {
        match self {
            Self::Round1 => "round1",
            Self::Round2 => "round2",
            Self::Round3a => "round3a",
            Self::Round3b => "round3b",
        }
    }

    /// Position of this category in [`BarcodeCategory::ALL`].
    pub(crate) fn index(self) -> usize {
        match self {
            Self::Round1 => 0,
            Self::Round2 => 1,
            Self::Round3a => 2,
            Self::Round3b => 3,
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "round1" => Some(Self::Round1),
            "round2" => Some(Self::Round2),
            "round3a" => Some(Self::Round3a),
            "round3b" => Some(Self::Round3b),
            _ => None,
        }
    }
}

impl std::fmt::Display for BarcodeCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// The error that may occur when building the [`BarcodeCatalog`].
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error(transparent)]
    Deserialize(#[from] csv::Error),

    #[error("Empty barcode sequence for {category}")]
    EmptyBarcode { category: BarcodeCategory },

    #[error("{category} barcode `{barcode}` contains a base other than ACTG")]
    InvalidBase { category: BarcodeCategory, barcode: String },

    #[error(
        "{category} barcode `{barcode}` has length {found}, expected {expected} like the rest of the category"
    )]
    UnequalBarcodeLengths {
        category: BarcodeCategory,
        barcode: String,
        expected: usize,
        found: usize,
    },

    #[error("The barcode annotation contained no usable entries")]
    Empty,
}

/// One row of the barcode annotation file.
///
/// Rows whose `barcode_type` is not one of the four category names are
/// ignored; the annotation may describe other oligos.
#[derive(Debug, Deserialize)]
struct AnnotationRow {
    barcode_type: String,
    barcode_sequence: BString,
}

/// Reference sequences for one category: a set for membership tests plus the
/// insertion-ordered distinct list used for nearest-neighbor scans.
#[derive(Debug, Default, Clone)]
struct CategoryEntries {
    lookup: AHashSet<BString>,
    ordered: Vec<BString>,
}

/// The full reference catalog, one entry collection per category.
///
/// Built once, then shared immutably; membership tests and entry scans are
/// safe from any number of threads.
#[derive(Debug, Default, Clone)]
pub struct BarcodeCatalog {
    categories: [CategoryEntries; 4],
}

impl BarcodeCatalog {
    /// Build a catalog from a flat collection of `(category, sequence)`
    /// pairs.  Duplicate pairs are idempotent.
    ///
    /// # Errors
    ///
    /// - [`CatalogError::Empty`] if the collection has no entries
    /// - [`CatalogError::InvalidBase`] for a non-ACTG base
    /// - [`CatalogError::UnequalBarcodeLengths`] if sequences within one
    ///   category differ in length
    pub fn from_entries<I>(entries: I) -> Result<Self, CatalogError>
    where
        I: IntoIterator<Item = (BarcodeCategory, BString)>,
    {
        let mut catalog = Self::default();
        let mut total = 0usize;
        for (category, sequence) in entries {
            catalog.insert(category, sequence)?;
            total += 1;
        }
        if total == 0 {
            return Err(CatalogError::Empty);
        }
        Ok(catalog)
    }

    /// Load a catalog from an annotation CSV with `barcode_type` and
    /// `barcode_sequence` columns.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, CatalogError> {
        let mut reader =
            csv::ReaderBuilder::new().has_headers(true).trim(csv::Trim::All).from_path(path)?;
        let mut entries = Vec::new();
        for row in reader.deserialize() {
            let row: AnnotationRow = row?;
            if let Some(category) = BarcodeCategory::from_name(&row.barcode_type) {
                entries.push((category, row.barcode_sequence));
            }
        }
        Self::from_entries(entries)
    }

    fn insert(&mut self, category: BarcodeCategory, sequence: BString) -> Result<(), CatalogError> {
        if sequence.is_empty() {
            return Err(CatalogError::EmptyBarcode { category });
        }
        if sequence.iter().any(|b| !ALLOWED_BASES.contains(b)) {
            return Err(CatalogError::InvalidBase { category, barcode: sequence.to_string() });
        }
        let slot = &mut self.categories[category.index()];
        if let Some(first) = slot.ordered.first() {
            if first.len() != sequence.len() {
                return Err(CatalogError::UnequalBarcodeLengths {
                    category,
                    barcode: sequence.to_string(),
                    expected: first.len(),
                    found: sequence.len(),
                });
            }
        }
        if slot.lookup.insert(sequence.clone()) {
            slot.ordered.push(sequence);
        }
        Ok(())
    }

    /// Membership test for an observed barcode.
    pub fn contains(&self, category: BarcodeCategory, sequence: &BStr) -> bool {
        self.categories[category.index()].lookup.contains(sequence)
    }

    /// The distinct reference sequences for a category, in annotation order.
    pub fn entries(&self, category: BarcodeCategory) -> &[BString] {
        &self.categories[category.index()].ordered
    }

    /// Whether a category has no reference sequences at all.
    pub fn is_empty(&self, category: BarcodeCategory) -> bool {
        self.categories[category.index()].ordered.is_empty()
    }

    /// The common sequence length of a category, `None` when it is empty.
    pub fn expected_length(&self, category: BarcodeCategory) -> Option<usize> {
        self.categories[category.index()].ordered.first().map(|entry| entry.len())
    }
}
