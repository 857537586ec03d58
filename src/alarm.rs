//! Alarm Module
//!
//! One-shot wall-clock alarms delivered as [`TimerFired`] messages.
//!
//! ## Precision
//! - **Exact**: a `CLOCK_REALTIME_ALARM` timerfd armed for the absolute
//!   instant. The kernel fires it on time and wakes the machine from suspend
//!   to do so. Creating one requires `CAP_WAKE_ALARM`.
//! - **Inexact**: checks the wall clock every five minutes, so delivery may
//!   be up to five minutes late and waits for the machine to be awake.
//!   Always available.
//!
//! Both follow the wall clock rather than a monotonic deadline, so a clock
//! change can delay an alarm but never make it fire early.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Mutex;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Local};
use tokio::io::unix::AsyncFd;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Check interval for inexact alarms
const INEXACT_POLL: StdDuration = StdDuration::from_secs(300);

/// Delivered when an armed alarm goes off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    /// The instant the alarm was armed for (not the delivery time)
    pub scheduled_for: DateTime<Local>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AlarmError {
    #[error("exact alarms are not permitted for this process")]
    PermissionDenied,
    #[error("alarm subsystem unavailable: {0}")]
    Unavailable(String),
}

/// The host's timer subsystem. Holds at most one pending alarm; scheduling a
/// new one replaces it.
pub trait AlarmClock: Send + Sync {
    /// Whether exact alarms are currently authorized.
    fn can_schedule_exact(&self) -> bool;

    fn schedule_exact(&self, at: DateTime<Local>) -> Result<(), AlarmError>;

    fn schedule_inexact(&self, at: DateTime<Local>) -> Result<(), AlarmError>;

    fn cancel(&self);
}

/// In-process [`AlarmClock`] backed by tokio tasks.
#[derive(Debug)]
pub struct TokioAlarm {
    tx: mpsc::Sender<TimerFired>,
    runtime: Handle,
    exact_permitted: bool,
    /// Background task handle for the pending alarm
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TokioAlarm {
    /// Creates the alarm and the receiver its events are delivered on.
    ///
    /// Exact-alarm permission is queried once here.
    pub fn new(runtime: Handle) -> (Self, mpsc::Receiver<TimerFired>) {
        Self::with_permission(runtime, wake_alarms_available())
    }

    pub fn with_permission(runtime: Handle, exact_permitted: bool) -> (Self, mpsc::Receiver<TimerFired>) {
        let (tx, rx) = mpsc::channel(4);
        let alarm = Self {
            tx,
            runtime,
            exact_permitted,
            handle: Mutex::new(None),
        };
        (alarm, rx)
    }

    fn replace_pending(&self, task: JoinHandle<()>) {
        let mut guard = self.handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = guard.replace(task) {
            previous.abort();
        }
    }

    fn spawn_timer_fd(&self, fd: OwnedFd, at: DateTime<Local>) {
        let tx = self.tx.clone();
        let task = self.runtime.spawn(async move {
            match wait_for_expiry(fd).await {
                Ok(()) => {
                    debug!(at = %at, "exact alarm fired");
                    let _ = tx.send(TimerFired { scheduled_for: at }).await;
                }
                Err(e) => error!(at = %at, error = %e, "exact alarm failed"),
            }
        });
        self.replace_pending(task);
    }

    fn spawn_poll(&self, at: DateTime<Local>) {
        let tx = self.tx.clone();
        let task = self.runtime.spawn(async move {
            loop {
                if at.signed_duration_since(Local::now()) <= chrono::Duration::zero() {
                    debug!(at = %at, "inexact alarm fired");
                    let _ = tx.send(TimerFired { scheduled_for: at }).await;
                    break;
                }
                tokio::time::sleep(INEXACT_POLL).await;
            }
        });
        self.replace_pending(task);
    }
}

impl AlarmClock for TokioAlarm {
    fn can_schedule_exact(&self) -> bool {
        self.exact_permitted
    }

    fn schedule_exact(&self, at: DateTime<Local>) -> Result<(), AlarmError> {
        if !self.exact_permitted {
            return Err(AlarmError::PermissionDenied);
        }

        let fd = timer_fd(libc::CLOCK_REALTIME_ALARM).map_err(|e| match e.raw_os_error() {
            Some(libc::EPERM) => AlarmError::PermissionDenied,
            _ => AlarmError::Unavailable(e.to_string()),
        })?;
        arm_timer_fd(&fd, at).map_err(|e| AlarmError::Unavailable(e.to_string()))?;

        self.spawn_timer_fd(fd, at);
        Ok(())
    }

    fn schedule_inexact(&self, at: DateTime<Local>) -> Result<(), AlarmError> {
        if self.tx.is_closed() {
            return Err(AlarmError::Unavailable("alarm receiver dropped".to_string()));
        }
        self.spawn_poll(at);
        Ok(())
    }

    fn cancel(&self) {
        let mut guard = self.handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(handle) = guard.take() {
            handle.abort();
        }
    }
}

impl Drop for TokioAlarm {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Whether this process may create wake-capable timers (`CAP_WAKE_ALARM`).
pub fn wake_alarms_available() -> bool {
    match timer_fd(libc::CLOCK_REALTIME_ALARM) {
        Ok(_) => true,
        Err(e) => {
            if e.raw_os_error() != Some(libc::EPERM) {
                warn!(error = %e, "wake-capable timers unsupported");
            }
            false
        }
    }
}

/// Creates a non-blocking timerfd on `clock`.
fn timer_fd(clock: libc::clockid_t) -> io::Result<OwnedFd> {
    // SAFETY: plain syscall, the returned descriptor is checked before use
    let fd = unsafe { libc::timerfd_create(clock, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `fd` is a freshly created descriptor owned by nobody else
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Arms `fd` to expire once at the absolute wall-clock instant `at`.
///
/// An instant in the past expires immediately.
fn arm_timer_fd(fd: &OwnedFd, at: DateTime<Local>) -> io::Result<()> {
    let spec = libc::itimerspec {
        it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
        it_value: libc::timespec {
            // Zero would disarm the timer
            tv_sec: at.timestamp().max(1) as libc::time_t,
            tv_nsec: at.timestamp_subsec_nanos() as libc::c_long,
        },
    };

    // SAFETY: `fd` is a valid timerfd and `spec` outlives the call
    let rc = unsafe {
        libc::timerfd_settime(fd.as_raw_fd(), libc::TFD_TIMER_ABSTIME, &spec, std::ptr::null_mut())
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

async fn wait_for_expiry(fd: OwnedFd) -> io::Result<()> {
    let fd = AsyncFd::new(fd)?;
    loop {
        let mut guard = fd.readable().await?;
        let mut expirations = [0u8; 8];
        let read = guard.try_io(|inner| {
            // SAFETY: the buffer is 8 bytes, the size of a timerfd expiration count
            let n = unsafe {
                libc::read(inner.get_ref().as_raw_fd(), expirations.as_mut_ptr().cast(), expirations.len())
            };
            if n < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(())
            }
        });

        match read {
            Ok(result) => return result,
            Err(_would_block) => continue,
        }
    }
}
