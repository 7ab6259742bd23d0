//! Candidate URL generation for a reporting period.
//!
//! The publisher has never kept one URL layout for long: directory names
//! switch between zero-padded months, short month names and quarter
//! folders, and re-uploads get a `_2` suffix. Instead of chasing the
//! current layout, every known pattern is tried in a fixed order until
//! one hits.

use crate::models::{CandidateUrl, ReportPeriod};

/// A URL naming convention the publisher has been observed to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathPattern {
    /// `{base}/{YYYY}-{MM}/{name}.pdf`
    MonthPadded,
    /// `{base}/{YYYY}-{Mon}/{name}.pdf`
    MonthAbbrev,
    /// `{base}/{YYYY}-{MM}/{name}_2.pdf` (re-upload)
    MonthPaddedAlt,
    /// `{base}/{YYYY}-{Mon}/{name}_2.pdf` (re-upload)
    MonthAbbrevAlt,
    /// `{base}/{YYYY}-{M}/{name}.pdf` (no zero padding)
    MonthBare,
    /// `{base}/{YYYY}-Q{Q}/{name}.pdf`
    QuarterDir,
}

impl PathPattern {
    /// Every known pattern, in default probing order. Most recently
    /// observed layouts come first.
    pub const ALL: [PathPattern; 6] = [
        PathPattern::MonthPadded,
        PathPattern::MonthAbbrev,
        PathPattern::MonthPaddedAlt,
        PathPattern::MonthAbbrevAlt,
        PathPattern::MonthBare,
        PathPattern::QuarterDir,
    ];

    /// Stable identifier, persisted with each download record.
    pub fn id(&self) -> &'static str {
        match self {
            PathPattern::MonthPadded => "month-padded",
            PathPattern::MonthAbbrev => "month-abbrev",
            PathPattern::MonthPaddedAlt => "month-padded-alt",
            PathPattern::MonthAbbrevAlt => "month-abbrev-alt",
            PathPattern::MonthBare => "month-bare",
            PathPattern::QuarterDir => "quarter-dir",
        }
    }

    pub fn parse(id: &str) -> Option<Self> {
        PathPattern::ALL.into_iter().find(|p| p.id() == id)
    }

    fn dir_segment(&self, period: ReportPeriod) -> String {
        match self {
            PathPattern::MonthPadded | PathPattern::MonthPaddedAlt => {
                format!("{:04}-{:02}", period.year(), period.month())
            }
            PathPattern::MonthAbbrev | PathPattern::MonthAbbrevAlt => {
                format!("{:04}-{}", period.year(), period.month_abbr())
            }
            PathPattern::MonthBare => format!("{:04}-{}", period.year(), period.month()),
            PathPattern::QuarterDir => format!("{:04}-Q{}", period.year(), period.quarter()),
        }
    }

    fn file_segment(&self, escaped_base: &str) -> String {
        match self {
            PathPattern::MonthPaddedAlt | PathPattern::MonthAbbrevAlt => {
                format!("{}_2.pdf", escaped_base)
            }
            _ => format!("{}.pdf", escaped_base),
        }
    }
}

/// Produces the ordered candidate URL sequence for a period.
///
/// Given the same configuration, period and preferred pattern, the
/// sequence is identical on every call. URLs are built lazily so callers
/// that stop at the first hit never pay for the rest.
pub struct CandidateUrlGenerator {
    base_urls: Vec<String>,
    patterns: Vec<PathPattern>,
    filename_base: String,
}

impl CandidateUrlGenerator {
    pub fn new(base_urls: Vec<String>, patterns: Vec<PathPattern>, filename_base: String) -> Self {
        let base_urls = base_urls
            .into_iter()
            .map(|b| b.trim_end_matches('/').to_string())
            .filter(|b| !b.is_empty())
            .collect();
        Self {
            base_urls,
            patterns,
            filename_base,
        }
    }

    /// Remote report name the candidate URLs are built around.
    pub fn filename_base(&self) -> &str {
        &self.filename_base
    }

    /// Ordered candidate URLs for `period`.
    ///
    /// When `preferred` names a configured pattern (one that won for an
    /// earlier period), that pattern's URLs move to the front; relative
    /// order is otherwise preserved. Unknown ids are ignored.
    pub fn candidates(
        &self,
        period: ReportPeriod,
        preferred: Option<&str>,
    ) -> impl Iterator<Item = CandidateUrl> + '_ {
        let file_base = escape_base(&self.filename_base);
        self.ordered_patterns(preferred)
            .into_iter()
            .flat_map(move |pattern| {
                let dir = pattern.dir_segment(period);
                let file = pattern.file_segment(&file_base);
                self.base_urls.iter().map(move |base| CandidateUrl {
                    url: format!("{}/{}/{}", base, dir, file),
                    pattern_id: pattern.id(),
                })
            })
    }

    fn ordered_patterns(&self, preferred: Option<&str>) -> Vec<PathPattern> {
        match preferred.and_then(PathPattern::parse) {
            Some(p) if self.patterns.contains(&p) => {
                let mut ordered = Vec::with_capacity(self.patterns.len());
                ordered.push(p);
                ordered.extend(self.patterns.iter().copied().filter(|q| *q != p));
                ordered
            }
            _ => self.patterns.clone(),
        }
    }
}

/// Remote filenames carry literal spaces; everything else is left as-is.
fn escape_base(base: &str) -> String {
    base.replace(' ', "%20")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generator(bases: &[&str]) -> CandidateUrlGenerator {
        CandidateUrlGenerator::new(
            bases.iter().map(|b| b.to_string()).collect(),
            PathPattern::ALL.to_vec(),
            "CF1400 Records".to_string(),
        )
    }

    fn period(year: i32, month: u8) -> ReportPeriod {
        ReportPeriod::from_year_month(year, month).unwrap()
    }

    #[test]
    fn test_first_candidate_shape() {
        let gen = generator(&["https://example.gov/docs"]);
        let first = gen.candidates(period(2024, 2), None).next().unwrap();
        assert_eq!(
            first.url,
            "https://example.gov/docs/2024-02/CF1400%20Records.pdf"
        );
        assert_eq!(first.pattern_id, "month-padded");
    }

    #[test]
    fn test_pattern_major_base_minor_order() {
        let gen = generator(&["https://a.gov", "https://b.gov"]);
        let urls: Vec<String> = gen
            .candidates(period(2024, 2), None)
            .map(|c| c.url)
            .collect();

        assert_eq!(urls.len(), PathPattern::ALL.len() * 2);
        assert_eq!(urls[0], "https://a.gov/2024-02/CF1400%20Records.pdf");
        assert_eq!(urls[1], "https://b.gov/2024-02/CF1400%20Records.pdf");
        assert_eq!(urls[2], "https://a.gov/2024-Feb/CF1400%20Records.pdf");
        assert_eq!(urls[3], "https://b.gov/2024-Feb/CF1400%20Records.pdf");
        assert_eq!(urls[4], "https://a.gov/2024-02/CF1400%20Records_2.pdf");
    }

    #[test]
    fn test_all_pattern_shapes() {
        let gen = generator(&["https://a.gov"]);
        let urls: Vec<String> = gen
            .candidates(period(2023, 11), None)
            .map(|c| c.url)
            .collect();

        assert_eq!(
            urls,
            vec![
                "https://a.gov/2023-11/CF1400%20Records.pdf",
                "https://a.gov/2023-Nov/CF1400%20Records.pdf",
                "https://a.gov/2023-11/CF1400%20Records_2.pdf",
                "https://a.gov/2023-Nov/CF1400%20Records_2.pdf",
                "https://a.gov/2023-11/CF1400%20Records.pdf",
                "https://a.gov/2023-Q4/CF1400%20Records.pdf",
            ]
        );
    }

    #[test]
    fn test_month_bare_differs_for_single_digit_months() {
        let gen = generator(&["https://a.gov"]);
        let urls: Vec<String> = gen
            .candidates(period(2023, 3), None)
            .map(|c| c.url)
            .collect();
        assert!(urls.contains(&"https://a.gov/2023-3/CF1400%20Records.pdf".to_string()));
        assert!(urls.contains(&"https://a.gov/2023-03/CF1400%20Records.pdf".to_string()));
    }

    #[test]
    fn test_deterministic_across_calls() {
        let gen = generator(&["https://a.gov", "https://b.gov"]);
        let once: Vec<_> = gen.candidates(period(2024, 5), None).collect();
        let twice: Vec<_> = gen.candidates(period(2024, 5), None).collect();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_preferred_pattern_moves_to_front() {
        let gen = generator(&["https://a.gov"]);
        let urls: Vec<_> = gen
            .candidates(period(2024, 2), Some("quarter-dir"))
            .collect();

        assert_eq!(urls[0].pattern_id, "quarter-dir");
        assert_eq!(urls[0].url, "https://a.gov/2024-Q1/CF1400%20Records.pdf");
        // The rest keep their default relative order.
        assert_eq!(urls[1].pattern_id, "month-padded");
        assert_eq!(urls[2].pattern_id, "month-abbrev");
        assert_eq!(urls.len(), PathPattern::ALL.len());
    }

    #[test]
    fn test_unknown_preferred_is_ignored() {
        let gen = generator(&["https://a.gov"]);
        let with_unknown: Vec<_> = gen.candidates(period(2024, 2), Some("no-such")).collect();
        let without: Vec<_> = gen.candidates(period(2024, 2), None).collect();
        assert_eq!(with_unknown, without);
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let gen = generator(&["https://a.gov/docs/"]);
        let first = gen.candidates(period(2024, 2), None).next().unwrap();
        assert_eq!(first.url, "https://a.gov/docs/2024-02/CF1400%20Records.pdf");
    }

    #[test]
    fn test_pattern_id_round_trip() {
        for p in PathPattern::ALL {
            assert_eq!(PathPattern::parse(p.id()), Some(p));
        }
        assert_eq!(PathPattern::parse("bogus"), None);
    }
}
