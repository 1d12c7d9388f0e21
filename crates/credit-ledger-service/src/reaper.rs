//! Expiry reaper for abandoned reservations.
//!
//! A reservation whose caller crashed before confirming or cancelling stays
//! `Locked` and keeps its credits out of reach. Two periodic sweeps cancel such
//! reservations: a short `Timeout` sweep for calls that likely died mid-flight,
//! and a long `Expired` sweep as a safety net.
//!
//! Sweeps go through [`CreditLedger::cancel_deduct_credits`], so they are safe to
//! run alongside live traffic and alongside each other. A cancellation that
//! fails is logged and left `Locked` for the next run.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use credit_ledger_core::{Deadline, EntryId, Result};
use credit_ledger_store::Store;

use crate::config::ReaperConfig;
use crate::ledger::CreditLedger;

/// The two sweeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReaperJob {
    /// Short threshold: reservations whose operation likely crashed.
    Timeout,
    /// Long threshold: everything that slipped through.
    Expired,
}

impl ReaperJob {
    /// Both jobs.
    pub const ALL: [Self; 2] = [Self::Timeout, Self::Expired];

    /// Job name used in logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for ReaperJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Counters of one reaper run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaperStats {
    /// Expired reservations looked at.
    pub scanned: usize,
    /// Reservations this run released (or found already released).
    pub cancelled: usize,
    /// Cancellations that failed and stay `Locked` for the next run.
    pub failed: usize,
}

/// Periodically cancels reservations held past a threshold.
pub struct Reaper<S> {
    ledger: Arc<CreditLedger<S>>,
    config: ReaperConfig,
    call_timeout: Duration,
}

impl<S: Store> Reaper<S> {
    /// Create a reaper over a ledger.
    #[must_use]
    pub fn new(ledger: Arc<CreditLedger<S>>, config: ReaperConfig, call_timeout: Duration) -> Self {
        Self {
            ledger,
            config,
            call_timeout,
        }
    }

    /// Age after which `job` cancels a reservation.
    #[must_use]
    pub const fn threshold(&self, job: ReaperJob) -> Duration {
        match job {
            ReaperJob::Timeout => self.config.timeout_threshold,
            ReaperJob::Expired => self.config.expired_threshold,
        }
    }

    /// How often `job` runs.
    #[must_use]
    pub const fn interval(&self, job: ReaperJob) -> Duration {
        match job {
            ReaperJob::Timeout => self.config.timeout_interval,
            ReaperJob::Expired => self.config.expired_interval,
        }
    }

    /// Run one sweep of `job`.
    ///
    /// Pages through `Locked` entries older than the job's threshold and
    /// cancels each of them. Stops on an empty or short page, or once as many
    /// entries were processed as the first page reported in total.
    ///
    /// # Errors
    ///
    /// Returns an error only if fetching a page fails. Failed cancellations are
    /// counted in [`ReaperStats::failed`].
    pub fn run_once(&self, job: ReaperJob) -> Result<ReaperStats> {
        let cutoff = chrono::Duration::from_std(self.threshold(job))
            .ok()
            .and_then(|threshold| Utc::now().checked_sub_signed(threshold))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let page_size = self.config.page_size.max(1);

        let mut stats = ReaperStats::default();
        let mut offset = 0;
        let mut processed = 0;
        let mut first_total = None;

        loop {
            let (page, total) = self
                .ledger
                .store()
                .list_locked_entries_older_than(cutoff, offset, page_size)?;
            if page.is_empty() {
                break;
            }
            let bound = *first_total.get_or_insert(total);
            let page_len = page.len();

            for entry in page {
                stats.scanned += 1;
                let deadline = Deadline::after(self.call_timeout);
                match self
                    .ledger
                    .cancel_deduct_credits(&entry.user_id, &entry.id, deadline)
                {
                    Ok(()) => stats.cancelled += 1,
                    Err(e) => {
                        stats.failed += 1;
                        // Only an entry still in the locked index stays ahead of the next page.
                        if self.still_locked(&entry.id) {
                            offset += 1;
                        }
                        tracing::warn!(
                            job = %job,
                            user_id = %entry.user_id,
                            entry_id = %entry.id,
                            error = %e,
                            "Failed to cancel expired reservation"
                        );
                    }
                }
            }

            processed += page_len;
            if page_len < page_size || processed >= bound {
                break;
            }
        }

        if stats.scanned > 0 {
            tracing::info!(
                job = %job,
                scanned = stats.scanned,
                cancelled = stats.cancelled,
                failed = stats.failed,
                "Reaper run finished"
            );
        } else {
            tracing::debug!(job = %job, "Reaper run found nothing to cancel");
        }
        Ok(stats)
    }

    /// Whether an entry the reaper failed to cancel is still `Locked`.
    ///
    /// An unreadable entry counts as locked so the run moves past it.
    fn still_locked(&self, entry_id: &EntryId) -> bool {
        match self.ledger.store().find_entry(entry_id) {
            Ok(entry) => entry.is_locked(),
            Err(_) => true,
        }
    }
}

impl<S: Store + 'static> Reaper<S> {
    /// Run `job` on its interval until `shutdown` flips to `true`.
    ///
    /// The first run starts immediately. Each run executes on the blocking
    /// pool; ticks missed by a slow run are delayed, not bunched.
    pub fn spawn(self: &Arc<Self>, job: ReaperJob, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let reaper = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(reaper.interval(job));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(
                job = %job,
                interval_secs = reaper.interval(job).as_secs(),
                threshold_secs = reaper.threshold(job).as_secs(),
                "Reaper job started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                let run = Arc::clone(&reaper);
                match tokio::task::spawn_blocking(move || run.run_once(job)).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(job = %job, error = %e, "Reaper run failed, retrying next tick");
                    }
                    Err(e) => {
                        tracing::error!(job = %job, error = %e, "Reaper run panicked");
                    }
                }
            }

            tracing::info!(job = %job, "Reaper job stopped");
        })
    }

    /// Start both jobs.
    pub fn spawn_all(self: &Arc<Self>) -> ReaperHandle {
        let (shutdown, rx) = watch::channel(false);
        let tasks = ReaperJob::ALL
            .into_iter()
            .map(|job| self.spawn(job, rx.clone()))
            .collect();
        ReaperHandle { shutdown, tasks }
    }
}

/// Handle to running reaper jobs.
pub struct ReaperHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ReaperHandle {
    /// Signal the jobs to stop and wait for them. A run in progress finishes first.
    pub async fn shutdown(self) {
        // Receivers may already be gone if every task exited.
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Reaper task ended abnormally");
            }
        }
    }
}
