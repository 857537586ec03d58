//! # Wallpaper Service Module
//!
//! The background daemon: owns the daily alarm, restores it at start-up and
//! exposes the interactive entry points over D-Bus.
//!
//! ## D-Bus Interface
//!
//! Service name: `org.pixelpull.Wallpaper1`
//! Object path: `/org/pixelpull/Wallpaper1`
//!
//! ### Methods
//! - `UpdateNow(url: String)` - Optionally save a new URL, then fetch and apply
//! - `GetUrl()` / `SetUrl(url: String)` - Wallpaper source URL
//! - `GetSchedule()` - Current schedule and next run
//! - `SetSchedule(hour: u8, minute: u8)` - Save and arm the daily update
//! - `DisableSchedule()` - Turn the daily update off
//! - `GetTarget()` / `SetTarget(target: String)` - home, lock or both
//! - `GetStatus()` - Transient status text of the last interactive update
//!
//! ### Signals
//! - `WallpaperChanged(url: String)` - Emitted after a successful update
//! - `ScheduleChanged(enabled: bool, next_run: String)` - Emitted when the schedule changes

use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};
use zbus::{connection, interface, Connection, SignalContext};

use crate::alarm::{AlarmClock, TokioAlarm};
use crate::config::{ConfigStore, ScheduleConfig, ScheduleTime, WallpaperTarget};
use crate::desktop::DesktopSetter;
use crate::fetcher::{FetchOutcome, ReqwestClient, SkipReason, WallpaperFetcher};
use crate::notifier::DesktopNotifier;
use crate::orchestrator::{StatusBoard, Trigger, UpdateOrchestrator, STATUS_ENTER_URL, STATUS_FAILED, STATUS_UPDATED};
use crate::scheduler::Scheduler;

/// D-Bus service name
pub const SERVICE_NAME: &str = "org.pixelpull.Wallpaper1";

/// D-Bus object path
pub const OBJECT_PATH: &str = "/org/pixelpull/Wallpaper1";

/// Schedule as reported over D-Bus (which has no optional values).
#[derive(Debug, Clone, zbus::zvariant::Type, serde::Serialize, serde::Deserialize)]
pub struct ScheduleInfo {
    pub enabled: bool,
    /// "HH:MM", empty if never set
    pub time: String,
    /// Next run, e.g. "Sat Oct 18 07:30", empty if not armed
    pub next_run: String,
}

impl ScheduleInfo {
    pub fn new(schedule: &ScheduleConfig, next_run: String) -> Self {
        Self {
            enabled: schedule.is_enabled(),
            time: schedule.time.map(|t| t.to_string()).unwrap_or_default(),
            next_run,
        }
    }
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

/// The D-Bus interface implementation
pub struct WallpaperService {
    config: Arc<ConfigStore>,
    orchestrator: Arc<UpdateOrchestrator>,
}

impl WallpaperService {
    pub fn new(config: Arc<ConfigStore>, orchestrator: Arc<UpdateOrchestrator>) -> Self {
        Self { config, orchestrator }
    }

    fn scheduler(&self) -> &Scheduler {
        self.orchestrator.scheduler()
    }

    fn schedule_info(&self) -> zbus::fdo::Result<ScheduleInfo> {
        let schedule = self.config.schedule().map_err(failed)?;
        Ok(ScheduleInfo::new(&schedule, self.scheduler().next_run_string()))
    }
}

#[interface(name = "org.pixelpull.Wallpaper1")]
impl WallpaperService {
    /// Fetch and apply the wallpaper now
    ///
    /// # Arguments
    /// * `url` - If non-empty, saved as the new source URL first
    ///
    /// # Returns
    /// * Success: status text
    /// * Error: why nothing was applied
    async fn update_now(
        &self,
        url: String,
        #[zbus(signal_context)] ctx: SignalContext<'_>,
    ) -> zbus::fdo::Result<String> {
        let url = url.trim();
        if !url.is_empty() {
            self.config.set_wallpaper_url(url).map_err(failed)?;
        }

        let outcome = self
            .orchestrator
            .run_once(Trigger::Interactive)
            .await
            .map_err(|e| failed(format!("{STATUS_FAILED}: {e}")))?;

        match outcome {
            FetchOutcome::Success => {
                let url = self.config.wallpaper_url().unwrap_or_default();
                Self::wallpaper_changed(&ctx, &url).await?;
                Ok(STATUS_UPDATED.to_string())
            }
            FetchOutcome::Failure(e) => Err(failed(format!("{STATUS_FAILED}: {e}"))),
            FetchOutcome::Skipped(SkipReason::EmptyUrl) => Err(failed(STATUS_ENTER_URL)),
            FetchOutcome::Skipped(SkipReason::Superseded) => {
                Ok("Superseded by a newer update".to_string())
            }
        }
    }

    /// Get the wallpaper source URL
    async fn get_url(&self) -> zbus::fdo::Result<String> {
        self.config.wallpaper_url().map_err(failed)
    }

    /// Set the wallpaper source URL
    async fn set_url(&self, url: String) -> zbus::fdo::Result<()> {
        let url = url.trim();
        if url.is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs(STATUS_ENTER_URL.to_string()));
        }
        self.config.set_wallpaper_url(url).map_err(failed)
    }

    /// Get the schedule and next run time
    async fn get_schedule(&self) -> zbus::fdo::Result<ScheduleInfo> {
        self.schedule_info()
    }

    /// Save a daily update time and arm it
    async fn set_schedule(
        &self,
        hour: u8,
        minute: u8,
        #[zbus(signal_context)] ctx: SignalContext<'_>,
    ) -> zbus::fdo::Result<ScheduleInfo> {
        let time = ScheduleTime::new(hour, minute).ok_or_else(|| {
            zbus::fdo::Error::InvalidArgs(format!("{hour}:{minute:02} is not a valid time of day"))
        })?;

        self.config.set_schedule(time).map_err(failed)?;
        self.scheduler().arm(time).map_err(failed)?;

        let info = self.schedule_info()?;
        Self::schedule_changed(&ctx, true, &info.next_run).await?;
        Ok(info)
    }

    /// Turn the daily update off
    async fn disable_schedule(&self, #[zbus(signal_context)] ctx: SignalContext<'_>) -> zbus::fdo::Result<()> {
        self.config.disable_schedule().map_err(failed)?;
        self.scheduler().cancel();
        Self::schedule_changed(&ctx, false, "").await?;
        Ok(())
    }

    /// Get the wallpaper target (home, lock or both)
    async fn get_target(&self) -> zbus::fdo::Result<String> {
        self.config.wallpaper_target().map(|t| t.to_string()).map_err(failed)
    }

    /// Set the wallpaper target
    async fn set_target(&self, target: String) -> zbus::fdo::Result<()> {
        let target: WallpaperTarget = target.parse().map_err(zbus::fdo::Error::InvalidArgs)?;
        self.config.set_wallpaper_target(target).map_err(failed)
    }

    /// Status text of the last interactive update (empty once cleared)
    async fn get_status(&self) -> String {
        self.orchestrator.status().current().unwrap_or_default()
    }

    // === Signals ===

    /// Signal emitted when the wallpaper changes
    #[zbus(signal)]
    async fn wallpaper_changed(ctx: &SignalContext<'_>, url: &str) -> zbus::Result<()>;

    /// Signal emitted when the schedule changes
    #[zbus(signal)]
    async fn schedule_changed(ctx: &SignalContext<'_>, enabled: bool, next_run: &str) -> zbus::Result<()>;
}

/// Announces a scheduled update that changed the wallpaper.
async fn emit_wallpaper_changed(conn: &Connection, url: &str) -> zbus::Result<()> {
    let iface = conn
        .object_server()
        .interface::<_, WallpaperService>(OBJECT_PATH)
        .await?;
    WallpaperService::wallpaper_changed(iface.signal_context(), url).await
}

/// Run the D-Bus daemon
///
/// Start-up doubles as the boot signal: a stored, enabled schedule is armed
/// exactly as if the user had just set it.
pub async fn run_daemon(config: Arc<ConfigStore>) -> Result<(), Box<dyn std::error::Error>> {
    let (alarm, mut fired_rx) = TokioAlarm::new(Handle::current());
    if !alarm.can_schedule_exact() {
        warn!(
            "wake-capable alarms are not permitted, daily updates may run up to five minutes late \
             and wait for the machine to resume; grant CAP_WAKE_ALARM \
             (e.g. `setcap cap_wake_alarm+ep <path to pixelpull>`) for exact timing"
        );
    }
    let scheduler = Arc::new(Scheduler::new(Arc::new(alarm)));

    let schedule = config.schedule()?;
    match scheduler.restore(&schedule) {
        Ok(Some(at)) => info!(next = %at, "restored daily wallpaper update"),
        Ok(None) => info!("no daily update scheduled"),
        Err(e) => error!(error = %e, "failed to restore the daily update"),
    }

    let fetcher = WallpaperFetcher::new(
        Arc::new(ReqwestClient::new()),
        Arc::new(DesktopSetter::with_default_dir()),
    );
    let notifier = Arc::new(DesktopNotifier::connect().await);
    let orchestrator = Arc::new(UpdateOrchestrator::new(
        config.clone(),
        fetcher,
        scheduler.clone(),
        notifier,
        StatusBoard::default(),
    ));

    let service = WallpaperService::new(config.clone(), orchestrator.clone());
    let conn = connection::Builder::session()?
        .name(SERVICE_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await?;

    info!("D-Bus service running at {} on {}", OBJECT_PATH, SERVICE_NAME);

    loop {
        tokio::select! {
            fired = fired_rx.recv() => {
                let Some(fired) = fired else { break };
                let Some(run) = orchestrator.on_timer_fired(fired) else { continue };

                let config = config.clone();
                let conn = conn.clone();
                tokio::spawn(async move {
                    match run.await {
                        Ok(Ok(FetchOutcome::Success)) => {
                            let url = config.wallpaper_url().unwrap_or_default();
                            if let Err(e) = emit_wallpaper_changed(&conn, &url).await {
                                debug!(error = %e, "could not emit WallpaperChanged");
                            }
                        }
                        Ok(Ok(outcome)) => debug!(?outcome, "scheduled update finished"),
                        Ok(Err(e)) => error!(error = %e, "scheduled update aborted"),
                        Err(e) => error!(error = %e, "scheduled update task failed"),
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    scheduler.cancel();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_info_for_unset_schedule() {
        let info = ScheduleInfo::new(&ScheduleConfig::default(), String::new());
        assert!(!info.enabled);
        assert_eq!(info.time, "");
        assert_eq!(info.next_run, "");
    }

    #[test]
    fn test_schedule_info_for_enabled_schedule() {
        let time = ScheduleTime::new(7, 5).unwrap();
        let info = ScheduleInfo::new(&ScheduleConfig::enabled(time), "Sun Oct 19 07:05".to_string());
        assert!(info.enabled);
        assert_eq!(info.time, "07:05");
        assert_eq!(info.next_run, "Sun Oct 19 07:05");
    }
}
