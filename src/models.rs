//! Core domain types shared across the harvester.

use anyhow::{ensure, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Short month names as they appear in publisher URL paths.
const MONTH_ABBR: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// One monthly reporting unit for which exactly one CF1400 report file
/// is expected.
///
/// Fields are private so every value, constructed or deserialized, has
/// passed the validation in [`ReportPeriod::new`]. The derived ordering
/// is chronological because the fields are laid out year-first and
/// quarter always agrees with month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawPeriod")]
pub struct ReportPeriod {
    year: i32,
    quarter: u8,
    month: u8,
}

/// Wire shape of [`ReportPeriod`]; validated on the way in.
#[derive(Deserialize)]
struct RawPeriod {
    year: i32,
    quarter: u8,
    month: u8,
}

impl TryFrom<RawPeriod> for ReportPeriod {
    type Error = anyhow::Error;

    fn try_from(raw: RawPeriod) -> Result<Self> {
        ReportPeriod::new(raw.year, raw.quarter, raw.month)
    }
}

impl ReportPeriod {
    /// Build a period, rejecting out-of-range months/quarters and
    /// month/quarter combinations that disagree.
    pub fn new(year: i32, quarter: u8, month: u8) -> Result<Self> {
        ensure!((1..=12).contains(&month), "month {} out of range", month);
        ensure!((1..=4).contains(&quarter), "quarter {} out of range", quarter);
        ensure!(
            quarter_for_month(month) == quarter,
            "month {} is not in quarter {}",
            month,
            quarter
        );
        Ok(Self {
            year,
            quarter,
            month,
        })
    }

    /// Build a period from year and month, deriving the quarter.
    pub fn from_year_month(year: i32, month: u8) -> Result<Self> {
        ensure!((1..=12).contains(&month), "month {} out of range", month);
        Ok(Self {
            year,
            quarter: quarter_for_month(month),
            month,
        })
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    /// Calendar quarter, 1 through 4.
    pub fn quarter(&self) -> u8 {
        self.quarter
    }

    /// 1-based month.
    pub fn month(&self) -> u8 {
        self.month
    }

    /// The immediately following period (December rolls into January).
    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                quarter: 1,
                month: 1,
            }
        } else {
            let month = self.month + 1;
            Self {
                year: self.year,
                quarter: quarter_for_month(month),
                month,
            }
        }
    }

    /// Short month name ("Jan" .. "Dec") used by some publisher URL layouts.
    pub fn month_abbr(&self) -> &'static str {
        MONTH_ABBR[(self.month - 1) as usize]
    }
}

impl fmt::Display for ReportPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Calendar quarter for a 1-based month.
pub fn quarter_for_month(month: u8) -> u8 {
    (month - 1) / 3 + 1
}

/// One candidate URL for a period, tagged with the naming pattern that
/// produced it so successful patterns can be preferred on later runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateUrl {
    pub url: String,
    pub pattern_id: &'static str,
}

/// A successfully downloaded report as recorded in the history store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub id: Option<i64>,
    pub period: ReportPeriod,
    /// Canonical local filename; unique across the store.
    pub filename: String,
    /// URL the file was actually fetched from.
    pub source_url: String,
    /// Naming pattern that produced the winning URL.
    pub pattern_id: String,
    pub downloaded_at: DateTime<Utc>,
    /// Set once the PDF has been converted to tabular data downstream.
    pub processed: bool,
}

impl DownloadRecord {
    pub fn new(
        period: ReportPeriod,
        filename: String,
        source_url: String,
        pattern_id: String,
    ) -> Self {
        Self {
            id: None,
            period,
            filename,
            source_url,
            pattern_id,
            downloaded_at: Utc::now(),
            processed: false,
        }
    }
}

/// A report downloaded during the current reconciliation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadedReport {
    pub period: ReportPeriod,
    pub filename: String,
    pub source_url: String,
    pub pattern_id: String,
}

/// A due period for which every candidate URL was tried without success.
/// Expected near publication boundaries; the next pass tries again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExhaustedPeriod {
    pub period: ReportPeriod,
    pub tried_urls: Vec<String>,
    /// Most informative failure seen, if any candidate got past 404.
    pub last_error: Option<String>,
}

/// A failure not explained by the report simply not being published yet
/// (storage or filesystem trouble).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardFailure {
    pub period: Option<ReportPeriod>,
    pub reason: String,
}

/// Everything a single reconciliation pass did, per period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Periods whose report was fetched and committed by this pass.
    pub downloaded: Vec<DownloadedReport>,
    /// Periods found already satisfied (idempotent skip or lost race).
    pub satisfied: Vec<ReportPeriod>,
    /// Periods tried and given up on for this pass.
    pub exhausted: Vec<ExhaustedPeriod>,
    /// Periods never attempted (budget ran out or storage went down).
    pub deferred: Vec<ReportPeriod>,
    pub hard_failures: Vec<HardFailure>,
}

impl RunOutcome {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            finished_at: started_at,
            downloaded: Vec::new(),
            satisfied: Vec::new(),
            exhausted: Vec::new(),
            deferred: Vec::new(),
            hard_failures: Vec::new(),
        }
    }

    pub fn has_hard_failures(&self) -> bool {
        !self.hard_failures.is_empty()
    }
}
