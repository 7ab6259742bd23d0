//! Canonical local filenames for downloaded reports.
//!
//! The filename is the deduplication key in the history store, so it must
//! be a pure function of the period and the configured report name: same
//! inputs, same name, on every run and every host.

use crate::models::ReportPeriod;

/// Canonical filename for a period: `YYYY-MM_<slug>.pdf`.
///
/// The remote name (which may carry spaces, mixed case and punctuation)
/// is flattened to a lowercase slug so the local tree stays portable.
pub fn canonical_filename(period: ReportPeriod, filename_base: &str) -> String {
    format!(
        "{:04}-{:02}_{}.pdf",
        period.year(),
        period.month(),
        slug(filename_base)
    )
}

/// Lowercase, ASCII-alphanumeric-and-underscore slug. Runs of other
/// characters collapse to a single underscore; leading and trailing
/// separators are dropped.
fn slug(base: &str) -> String {
    let mut out = String::with_capacity(base.len());
    let mut pending_sep = false;
    for c in base.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
            pending_sep = false;
        } else {
            pending_sep = true;
        }
    }
    if out.is_empty() {
        "report".to_string()
    } else {
        out
    }
}
