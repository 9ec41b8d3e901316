//! Utility functions.

use lazy_static::lazy_static;

lazy_static! {
    /// Return the number of cpus as a String
    pub static ref NUM_CPU: String = num_cpus::get().to_string();
}

/// Lossy conversion of raw bytes into an owned `String`.
pub fn s(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).to_string()
}
