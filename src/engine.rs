//! Reconciliation engine.
//!
//! One pass asks the history store where it stands, derives the due
//! periods, and closes the gap oldest-first: probe candidate URLs until
//! one yields a real PDF, write the file, then commit the record. The
//! file goes to disk before the record so a crash can leave an orphan
//! file (harmless, overwritten next pass) but never a record without
//! its file.

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::candidates::CandidateUrlGenerator;
use crate::config::Config;
use crate::fetcher::{fetch_with_retry, FetchOutcome, ReportFetcher, RetryPolicy};
use crate::history::{CommitOutcome, HistoryStore};
use crate::models::{
    CandidateUrl, DownloadRecord, DownloadedReport, ExhaustedPeriod, HardFailure, ReportPeriod,
    RunOutcome,
};
use crate::naming;

/// Tunables for a reconciliation pass.
#[derive(Debug, Clone)]
pub struct EnginePolicy {
    /// First period to acquire when the history store is empty.
    pub start: ReportPeriod,
    /// Months to wait after a period ends before expecting its report.
    pub publication_lag_months: u32,
    /// Candidate URLs probed concurrently per period.
    pub probe_parallelism: usize,
    pub retry: RetryPolicy,
    pub download_dir: PathBuf,
    /// Ceiling for one pass; periods not yet started are deferred.
    pub wall_clock_budget: Duration,
}

pub struct ReconcileEngine {
    store: Arc<dyn HistoryStore>,
    fetcher: Arc<dyn ReportFetcher>,
    generator: CandidateUrlGenerator,
    policy: EnginePolicy,
}

/// Periods that should have a report by `today` but come after the
/// latest recorded one. Oldest first; empty when the store is caught up.
///
/// With no history the window opens at `start` (inclusive). The window
/// closes `publication_lag_months` before the current month, since a
/// period's report only appears once the publisher has had time to
/// assemble it.
pub fn due_periods(
    latest: Option<ReportPeriod>,
    start: ReportPeriod,
    today: NaiveDate,
    publication_lag_months: u32,
) -> Vec<ReportPeriod> {
    let Some(horizon) = horizon_period(today, publication_lag_months) else {
        return Vec::new();
    };
    let mut cursor = match latest {
        Some(p) => p.next(),
        None => start,
    };
    let mut due = Vec::new();
    while cursor <= horizon {
        due.push(cursor);
        cursor = cursor.next();
    }
    due
}

/// Most recent period whose report should exist by `today`.
fn horizon_period(today: NaiveDate, lag_months: u32) -> Option<ReportPeriod> {
    let mut year = today.year();
    let mut month = today.month() as i32 - lag_months as i32;
    while month < 1 {
        month += 12;
        year -= 1;
    }
    ReportPeriod::from_year_month(year, month as u8).ok()
}

enum PeriodResolution {
    Downloaded(DownloadedReport),
    Satisfied,
    Exhausted {
        tried_urls: Vec<String>,
        last_error: Option<String>,
    },
    /// Filesystem trouble; fails this period only.
    IoFailure(String),
    /// History store trouble; the pass stops starting new periods.
    StorageFailure(String),
}

enum ProbeResult {
    Success {
        candidate: CandidateUrl,
        bytes: Vec<u8>,
    },
    Exhausted {
        tried_urls: Vec<String>,
        last_error: Option<String>,
    },
}

impl ReconcileEngine {
    pub fn new(
        store: Arc<dyn HistoryStore>,
        fetcher: Arc<dyn ReportFetcher>,
        generator: CandidateUrlGenerator,
        policy: EnginePolicy,
    ) -> Self {
        Self {
            store,
            fetcher,
            generator,
            policy,
        }
    }

    pub fn from_config(
        config: &Config,
        store: Arc<dyn HistoryStore>,
        fetcher: Arc<dyn ReportFetcher>,
    ) -> Result<Self> {
        let generator = CandidateUrlGenerator::new(
            config.source.base_urls.clone(),
            config.source.resolved_patterns()?,
            config.source.filename_base.clone(),
        );
        let policy = EnginePolicy {
            start: config.start_period()?,
            publication_lag_months: config.run.publication_lag_months,
            probe_parallelism: config.fetch.probe_parallelism,
            retry: RetryPolicy {
                max_attempts: config.fetch.retry_max_attempts,
                base_delay: config.fetch.retry_base_delay(),
            },
            download_dir: config.download.dir.clone(),
            wall_clock_budget: config.run.wall_clock_budget(),
        };
        Ok(Self::new(store, fetcher, generator, policy))
    }

    /// Execute one reconciliation pass.
    ///
    /// Returns `Err` only when the history store cannot even be read at
    /// the start; everything after that lands in the outcome.
    pub async fn run(&self) -> Result<RunOutcome> {
        self.run_at(Utc::now().date_naive()).await
    }

    async fn run_at(&self, today: NaiveDate) -> Result<RunOutcome> {
        let started_at = Utc::now();
        let clock = Instant::now();

        let latest = self
            .store
            .latest_known_period()
            .await
            .context("history store unreachable while reading latest period")?;
        // Seeded from history, then updated as this pass wins periods,
        // so a layout discovered on the first period speeds up the rest.
        let mut preferred = self
            .store
            .latest_successful_pattern()
            .await
            .context("history store unreachable while reading pattern history")?;

        let due = due_periods(
            latest,
            self.policy.start,
            today,
            self.policy.publication_lag_months,
        );
        info!(
            "🔍 Reconciliation pass: {} due period(s), latest known: {}",
            due.len(),
            latest.map(|p| p.to_string()).unwrap_or_else(|| "none".to_string())
        );

        let mut outcome = RunOutcome::new(started_at);

        for (i, period) in due.iter().copied().enumerate() {
            if clock.elapsed() >= self.policy.wall_clock_budget {
                warn!(
                    "wall-clock budget spent, deferring {} remaining period(s)",
                    due.len() - i
                );
                outcome.deferred.extend(due[i..].iter().copied());
                break;
            }

            match self.resolve_period(period, preferred.as_deref()).await {
                PeriodResolution::Downloaded(report) => {
                    info!(
                        "📥 {} downloaded from {} ({})",
                        report.filename, report.source_url, report.pattern_id
                    );
                    preferred = Some(report.pattern_id.clone());
                    outcome.downloaded.push(report);
                }
                PeriodResolution::Satisfied => {
                    debug!("{} already satisfied", period);
                    outcome.satisfied.push(period);
                }
                PeriodResolution::Exhausted {
                    tried_urls,
                    last_error,
                } => {
                    warn!(
                        "{} exhausted after {} candidate(s), retrying next pass",
                        period,
                        tried_urls.len()
                    );
                    outcome.exhausted.push(ExhaustedPeriod {
                        period,
                        tried_urls,
                        last_error,
                    });
                }
                PeriodResolution::IoFailure(reason) => {
                    error!("{} failed on local I/O: {}", period, reason);
                    outcome.hard_failures.push(HardFailure {
                        period: Some(period),
                        reason,
                    });
                }
                PeriodResolution::StorageFailure(reason) => {
                    error!("history store failed on {}: {}", period, reason);
                    outcome.hard_failures.push(HardFailure {
                        period: Some(period),
                        reason,
                    });
                    outcome.deferred.extend(due[i + 1..].iter().copied());
                    break;
                }
            }
        }

        outcome.finished_at = Utc::now();
        info!(
            "✅ Pass finished: {} downloaded, {} satisfied, {} exhausted, {} deferred, {} hard failure(s)",
            outcome.downloaded.len(),
            outcome.satisfied.len(),
            outcome.exhausted.len(),
            outcome.deferred.len(),
            outcome.hard_failures.len()
        );
        Ok(outcome)
    }

    async fn resolve_period(
        &self,
        period: ReportPeriod,
        preferred: Option<&str>,
    ) -> PeriodResolution {
        let filename = naming::canonical_filename(period, self.generator.filename_base());

        // A concurrent run may have satisfied the period since our
        // latest-period read.
        match self.store.exists(&filename).await {
            Ok(true) => {
                if self.policy.download_dir.join(&filename).exists() {
                    return PeriodResolution::Satisfied;
                }
                warn!("{} recorded but missing on disk, re-acquiring", filename);
            }
            Ok(false) => {}
            Err(e) => return PeriodResolution::StorageFailure(format!("{:#}", e)),
        }

        match self.probe_candidates(period, preferred).await {
            ProbeResult::Success { candidate, bytes } => {
                self.commit_download(period, &filename, candidate, bytes).await
            }
            ProbeResult::Exhausted {
                tried_urls,
                last_error,
            } => PeriodResolution::Exhausted {
                tried_urls,
                last_error,
            },
        }
    }

    /// Probe candidate URLs with a bounded window of in-flight fetches.
    /// First success wins and aborts the rest; candidate order decides
    /// which URLs get attempted at all.
    async fn probe_candidates(&self, period: ReportPeriod, preferred: Option<&str>) -> ProbeResult {
        let parallelism = self.policy.probe_parallelism.max(1);
        let mut candidates = self.generator.candidates(period, preferred);
        let mut inflight: JoinSet<(CandidateUrl, FetchOutcome)> = JoinSet::new();
        let mut tried_urls: Vec<String> = Vec::new();
        let mut last_error: Option<String> = None;

        loop {
            while inflight.len() < parallelism {
                let Some(candidate) = candidates.next() else {
                    break;
                };
                tried_urls.push(candidate.url.clone());
                let fetcher = Arc::clone(&self.fetcher);
                let retry = self.policy.retry.clone();
                inflight.spawn(async move {
                    let outcome = fetch_with_retry(fetcher.as_ref(), &candidate.url, &retry).await;
                    (candidate, outcome)
                });
            }

            let Some(joined) = inflight.join_next().await else {
                return ProbeResult::Exhausted {
                    tried_urls,
                    last_error,
                };
            };

            match joined {
                Ok((candidate, FetchOutcome::Fetched { bytes, .. })) => {
                    inflight.abort_all();
                    debug!("{} hit {} ({})", period, candidate.url, candidate.pattern_id);
                    return ProbeResult::Success { candidate, bytes };
                }
                Ok((candidate, FetchOutcome::NotFound)) => {
                    debug!("{} absent at {}", period, candidate.url);
                }
                Ok((candidate, FetchOutcome::InvalidContent { reason })) => {
                    // 2xx with a broken body is publisher-side trouble
                    // worth surfacing, unlike an ordinary miss.
                    warn!("{} served invalid content: {}", candidate.url, reason);
                    last_error = Some(format!("{}: {}", candidate.url, reason));
                }
                Ok((candidate, FetchOutcome::TransientError { reason })) => {
                    debug!("{} gave up on {}: {}", period, candidate.url, reason);
                    last_error = Some(format!("{}: {}", candidate.url, reason));
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    warn!("probe task for {} panicked: {}", period, e);
                    last_error = Some(e.to_string());
                }
            }
        }
    }

    /// Write the PDF, then commit the record. Order matters: a record
    /// must never point at a file that was not durably written.
    async fn commit_download(
        &self,
        period: ReportPeriod,
        filename: &str,
        candidate: CandidateUrl,
        bytes: Vec<u8>,
    ) -> PeriodResolution {
        // One more race check; the probe may have taken a while. Only a
        // record whose file is on disk counts as satisfied here; a
        // record missing its file is the corruption being repaired, and
        // the bytes still have to land.
        match self.store.exists(filename).await {
            Ok(true) if self.policy.download_dir.join(filename).exists() => {
                debug!("{} committed elsewhere during probe, discarding", filename);
                return PeriodResolution::Satisfied;
            }
            Ok(_) => {}
            Err(e) => return PeriodResolution::StorageFailure(format!("{:#}", e)),
        }

        if let Err(e) = self.persist_pdf(filename, &bytes).await {
            return PeriodResolution::IoFailure(format!("{:#}", e));
        }

        let record = DownloadRecord::new(
            period,
            filename.to_string(),
            candidate.url.clone(),
            candidate.pattern_id.to_string(),
        );
        match self.store.commit(&record).await {
            Ok(CommitOutcome::Committed) => PeriodResolution::Downloaded(DownloadedReport {
                period,
                filename: record.filename,
                source_url: record.source_url,
                pattern_id: record.pattern_id,
            }),
            Ok(CommitOutcome::Conflict) => {
                // Another run committed first; the bytes are identical.
                debug!("{} lost the commit race, treating as satisfied", filename);
                PeriodResolution::Satisfied
            }
            Err(e) => PeriodResolution::StorageFailure(format!("{:#}", e)),
        }
    }

    /// Write to `<name>.part`, then rename. A crash mid-write leaves a
    /// stray .part file, never a half-written PDF under the final name.
    async fn persist_pdf(&self, filename: &str, bytes: &[u8]) -> Result<()> {
        let dir = &self.policy.download_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create download dir {}", dir.display()))?;

        let part_path = dir.join(format!("{}.part", filename));
        let final_path = dir.join(filename);
        tokio::fs::write(&part_path, bytes)
            .await
            .with_context(|| format!("Failed to write {}", part_path.display()))?;
        tokio::fs::rename(&part_path, &final_path)
            .await
            .with_context(|| format!("Failed to move {} into place", final_path.display()))?;
        Ok(())
    }
}
