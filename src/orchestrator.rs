//! # Update Orchestrator
//!
//! The one operation behind both "update now" and the daily alarm:
//!
//! 1. Read the URL and target from the config store
//! 2. Bail out early on an empty URL
//! 3. Download, decode and apply the image
//! 4. Surface the outcome (status text for interactive runs, a notification
//!    for scheduled ones)
//!
//! A fired alarm goes through [`UpdateOrchestrator::on_timer_fired`], which
//! re-arms for the next day before the run starts. A download that never
//! finishes cannot cost the following days their update.
//!
//! Runs are not mutually exclusive. Each run takes a ticket when it starts and
//! a run that is no longer the newest when it reaches the apply step does not
//! apply it, so a slow stale download cannot overwrite a newer wallpaper.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::alarm::TimerFired;
use crate::config::{ConfigError, ConfigStore};
use crate::fetcher::{FetchOutcome, SkipReason, WallpaperFetcher};
use crate::notifier::{notification_for, Notifier};
use crate::scheduler::Scheduler;

/// How long an interactive status message stays visible
pub const STATUS_CLEAR_DELAY: Duration = Duration::from_secs(2);

pub const STATUS_ENTER_URL: &str = "Enter a URL first";
pub const STATUS_UPDATED: &str = "Wallpaper updated";
pub const STATUS_FAILED: &str = "Failed";

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The user asked for an update
    Interactive,
    /// The daily alarm went off
    Scheduled(TimerFired),
}

/// Transient status text shown to interactive callers.
///
/// A message clears itself after a delay unless a newer message replaced it.
#[derive(Debug, Clone)]
pub struct StatusBoard {
    inner: Arc<Mutex<(u64, Option<String>)>>,
    clear_after: Duration,
}

impl StatusBoard {
    pub fn new(clear_after: Duration) -> Self {
        Self { inner: Arc::new(Mutex::new((0, None))), clear_after }
    }

    /// Shows `text` and schedules it to clear. Must be called inside a tokio runtime.
    pub fn show(&self, text: impl Into<String>) {
        let generation = {
            let mut guard = self.lock();
            guard.0 += 1;
            guard.1 = Some(text.into());
            guard.0
        };

        let inner = self.inner.clone();
        let delay = self.clear_after;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut guard = inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if guard.0 == generation {
                guard.1 = None;
            }
        });
    }

    pub fn current(&self) -> Option<String> {
        self.lock().1.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, (u64, Option<String>)> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new(STATUS_CLEAR_DELAY)
    }
}

/// Runs the read-config → fetch → apply → report → re-arm sequence.
pub struct UpdateOrchestrator {
    config: Arc<ConfigStore>,
    fetcher: WallpaperFetcher,
    scheduler: Arc<Scheduler>,
    notifier: Arc<dyn Notifier>,
    status: StatusBoard,
    latest_run: Arc<AtomicU64>,
}

impl UpdateOrchestrator {
    pub fn new(
        config: Arc<ConfigStore>,
        fetcher: WallpaperFetcher,
        scheduler: Arc<Scheduler>,
        notifier: Arc<dyn Notifier>,
        status: StatusBoard,
    ) -> Self {
        Self {
            config,
            fetcher,
            scheduler,
            notifier,
            status,
            latest_run: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn status(&self) -> &StatusBoard {
        &self.status
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Handles a fired alarm: re-arms for the next day, then starts the
    /// scheduled run in the background.
    ///
    /// Returns `None` for a stale event whose alarm has since been replaced
    /// or cancelled.
    pub fn on_timer_fired(
        self: &Arc<Self>,
        fired: TimerFired,
    ) -> Option<JoinHandle<Result<FetchOutcome, ConfigError>>> {
        if !self.scheduler.is_current(&fired) {
            debug!(at = %fired.scheduled_for, "ignoring stale alarm");
            return None;
        }

        info!(at = %fired.scheduled_for, "daily alarm fired");
        self.rearm(&fired);

        let orchestrator = Arc::clone(self);
        Some(tokio::spawn(async move { orchestrator.run_once(Trigger::Scheduled(fired)).await }))
    }

    /// Performs one update.
    ///
    /// Only an unusable config store is an error; everything else ends up in
    /// the returned [`FetchOutcome`]. Scheduling is left to
    /// [`on_timer_fired`](Self::on_timer_fired).
    pub async fn run_once(&self, trigger: Trigger) -> Result<FetchOutcome, ConfigError> {
        let ticket = self.latest_run.fetch_add(1, Ordering::SeqCst) + 1;
        info!(?trigger, ticket, "wallpaper update started");

        let result = self.fetch(ticket, trigger).await;

        match &result {
            Ok(outcome) => self.surface(trigger, outcome).await,
            Err(e) => {
                error!(error = %e, "configuration unavailable, update aborted");
                if trigger == Trigger::Interactive {
                    self.status.show(STATUS_FAILED);
                }
            }
        }

        result
    }

    async fn fetch(&self, ticket: u64, trigger: Trigger) -> Result<FetchOutcome, ConfigError> {
        let url = self.config.wallpaper_url()?;
        let target = self.config.wallpaper_target()?;

        let url = url.trim();
        if url.is_empty() {
            info!(?trigger, "no wallpaper URL configured, nothing to do");
            return Ok(FetchOutcome::Skipped(SkipReason::EmptyUrl));
        }

        let latest = self.latest_run.clone();
        let outcome = self
            .fetcher
            .fetch_and_apply_unless(url, target, move || latest.load(Ordering::SeqCst) != ticket)
            .await;
        Ok(outcome)
    }

    async fn surface(&self, trigger: Trigger, outcome: &FetchOutcome) {
        match trigger {
            Trigger::Interactive => {
                let text = match outcome {
                    FetchOutcome::Success => STATUS_UPDATED,
                    FetchOutcome::Failure(_) => STATUS_FAILED,
                    FetchOutcome::Skipped(SkipReason::EmptyUrl) => STATUS_ENTER_URL,
                    FetchOutcome::Skipped(SkipReason::Superseded) => return,
                };
                self.status.show(text);
            }
            Trigger::Scheduled(_) => {
                if outcome.is_success() && !self.notify_on_success() {
                    return;
                }
                if let Some((title, body)) = notification_for(outcome) {
                    self.notifier.notify(title, &body).await;
                }
            }
        }
    }

    fn notify_on_success(&self) -> bool {
        self.config.notify_on_success().unwrap_or_else(|e| {
            warn!(error = %e, "could not read notification preference");
            true
        })
    }

    fn rearm(&self, fired: &TimerFired) {
        let schedule = match self.config.schedule() {
            Ok(schedule) => Some(schedule),
            Err(e) => {
                warn!(error = %e, "could not read schedule, re-arming from the fired alarm");
                None
            }
        };

        match self.scheduler.rearm_after_fire(fired, schedule.as_ref()) {
            Ok(Some(at)) => info!(next = %at, "next wallpaper update armed"),
            Ok(None) => info!("schedule disabled, not re-arming"),
            Err(e) => error!(error = %e, "failed to re-arm the daily update"),
        }
    }
}
