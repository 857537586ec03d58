//! Daily Scheduler
//!
//! Computes when the next daily update is due and keeps exactly one alarm
//! armed for it.
//!
//! ## Timer Behavior
//! - Runs daily at the user's chosen local time
//! - If that time has already passed today, the first run is tomorrow
//! - After each fire, re-arms for the same time on the following day,
//!   whatever happened to the update itself
//! - Prefers an exact alarm, falls back to an inexact one when exact alarms
//!   are not permitted
//! - On daemon start-up the stored schedule is restored as if freshly set

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Days, Local, NaiveDate, NaiveDateTime, TimeZone, Timelike};
use tracing::{debug, info, warn};

use crate::alarm::{AlarmClock, AlarmError, TimerFired};
use crate::config::{ScheduleConfig, ScheduleTime};

/// Which kind of alarm ended up armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmPrecision {
    Exact,
    Inexact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Unarmed,
    Armed {
        at: DateTime<Local>,
        time: ScheduleTime,
        precision: AlarmPrecision,
    },
}

/// Resolves a local wall-clock time in `tz`.
///
/// Ambiguous times (clocks going back) take the earlier instant; times that
/// do not exist (clocks going forward) move one hour later.
fn resolve_local<Tz: TimeZone>(tz: &Tz, naive: NaiveDateTime) -> DateTime<Tz> {
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + chrono::Duration::hours(1))).earliest())
        .unwrap_or_else(|| tz.from_utc_datetime(&naive))
}

fn at_on_date<Tz: TimeZone>(tz: &Tz, date: NaiveDate, time: ScheduleTime) -> DateTime<Tz> {
    resolve_local(tz, date.and_time(time.as_naive_time()))
}

/// The first instant strictly after `now` whose local time is `time`.
///
/// Today's occurrence if it is still ahead, otherwise tomorrow's.
pub fn next_trigger<Tz: TimeZone>(now: &DateTime<Tz>, time: ScheduleTime) -> DateTime<Tz> {
    let tz = now.timezone();
    let today = now.date_naive();

    let candidate = at_on_date(&tz, today, time);
    if candidate > *now {
        candidate
    } else {
        at_on_date(&tz, today + Days::new(1), time)
    }
}

/// The occurrence of `time` on the calendar day after `fired`.
pub fn following_day<Tz: TimeZone>(fired: &DateTime<Tz>, time: ScheduleTime) -> DateTime<Tz> {
    let tz = fired.timezone();
    at_on_date(&tz, fired.date_naive() + Days::new(1), time)
}

/// Owns the single pending alarm for the daily update.
pub struct Scheduler {
    alarm: Arc<dyn AlarmClock>,
    state: Mutex<SchedulerState>,
}

impl Scheduler {
    pub fn new(alarm: Arc<dyn AlarmClock>) -> Self {
        Self { alarm, state: Mutex::new(SchedulerState::Unarmed) }
    }

    pub fn state(&self) -> SchedulerState {
        *self.lock_state()
    }

    /// Next scheduled run, if armed.
    pub fn next_run(&self) -> Option<DateTime<Local>> {
        match self.state() {
            SchedulerState::Armed { at, .. } => Some(at),
            SchedulerState::Unarmed => None,
        }
    }

    /// Next run formatted for display, or an empty string when unarmed.
    pub fn next_run_string(&self) -> String {
        self.next_run()
            .map(|dt| dt.format("%a %b %d %H:%M").to_string())
            .unwrap_or_default()
    }

    /// Arms the alarm for the next occurrence of `time`.
    pub fn arm(&self, time: ScheduleTime) -> Result<DateTime<Local>, AlarmError> {
        self.arm_from(Local::now(), time)
    }

    /// Like [`arm`](Self::arm) with an explicit "now".
    pub fn arm_from(&self, now: DateTime<Local>, time: ScheduleTime) -> Result<DateTime<Local>, AlarmError> {
        self.arm_at(next_trigger(&now, time), time)
    }

    fn arm_at(&self, at: DateTime<Local>, time: ScheduleTime) -> Result<DateTime<Local>, AlarmError> {
        let precision = if self.alarm.can_schedule_exact() {
            match self.alarm.schedule_exact(at) {
                Ok(()) => AlarmPrecision::Exact,
                Err(AlarmError::PermissionDenied) => {
                    warn!("exact alarm refused, falling back to an inexact alarm");
                    self.alarm.schedule_inexact(at)?;
                    AlarmPrecision::Inexact
                }
                Err(e) => return Err(e),
            }
        } else {
            debug!("exact alarms not permitted, using an inexact alarm");
            self.alarm.schedule_inexact(at)?;
            AlarmPrecision::Inexact
        };

        *self.lock_state() = SchedulerState::Armed { at, time, precision };
        info!(at = %at, ?precision, "daily update armed");
        Ok(at)
    }

    /// Cancels the pending alarm, if any.
    pub fn cancel(&self) {
        self.alarm.cancel();
        let mut state = self.lock_state();
        if *state != SchedulerState::Unarmed {
            info!("daily update cancelled");
        }
        *state = SchedulerState::Unarmed;
    }

    /// Whether `fired` is for the alarm currently armed. Fire events that
    /// raced with a re-arm or cancel are stale and should be dropped.
    pub fn is_current(&self, fired: &TimerFired) -> bool {
        matches!(self.state(), SchedulerState::Armed { at, .. } if at == fired.scheduled_for)
    }

    /// Arms from the stored schedule at start-up. Safe to call repeatedly.
    pub fn restore(&self, schedule: &ScheduleConfig) -> Result<Option<DateTime<Local>>, AlarmError> {
        match schedule.active_time() {
            Some(time) => self.arm(time).map(Some),
            None => {
                debug!("no active schedule to restore");
                Ok(None)
            }
        }
    }

    /// Re-arms after `fired` went off.
    ///
    /// `schedule` is the stored schedule, or `None` if it could not be read,
    /// in which case the fired instant's own time of day is reused.
    pub fn rearm_after_fire(
        &self,
        fired: &TimerFired,
        schedule: Option<&ScheduleConfig>,
    ) -> Result<Option<DateTime<Local>>, AlarmError> {
        self.rearm_after_fire_from(Local::now(), fired, schedule)
    }

    pub fn rearm_after_fire_from(
        &self,
        now: DateTime<Local>,
        fired: &TimerFired,
        schedule: Option<&ScheduleConfig>,
    ) -> Result<Option<DateTime<Local>>, AlarmError> {
        let time = match schedule {
            Some(schedule) => match schedule.active_time() {
                Some(time) => time,
                None => {
                    self.cancel();
                    return Ok(None);
                }
            },
            None => match self.fired_time(fired) {
                Some(time) => time,
                None => return Ok(None),
            },
        };

        let fired_at = fired.scheduled_for;
        let same_time =
            fired_at.hour() == u32::from(time.hour()) && fired_at.minute() == u32::from(time.minute());

        let mut at = if same_time {
            following_day(&fired_at, time)
        } else {
            // The user picked a new time since this alarm was armed
            next_trigger(&now, time)
        };
        if at <= now {
            // Delivered more than a day late
            at = next_trigger(&now, time);
        }

        self.arm_at(at, time).map(Some)
    }

    fn fired_time(&self, fired: &TimerFired) -> Option<ScheduleTime> {
        match self.state() {
            SchedulerState::Armed { time, .. } => Some(time),
            SchedulerState::Unarmed => {
                let at = fired.scheduled_for;
                ScheduleTime::new(at.hour() as u8, at.minute() as u8)
            }
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Utc;
    use chrono_tz::America::New_York;

    /// Records every request and can refuse exact alarms.
    #[derive(Default)]
    pub(crate) struct FakeAlarm {
        pub exact_permitted: bool,
        /// Claims exact permission but refuses the request anyway
        pub refuse_exact: bool,
        pub scheduled: Mutex<Vec<(DateTime<Local>, AlarmPrecision)>>,
        pub cancelled: Mutex<usize>,
    }

    impl FakeAlarm {
        pub(crate) fn exact() -> Self {
            Self { exact_permitted: true, ..Default::default() }
        }

        pub(crate) fn last(&self) -> Option<(DateTime<Local>, AlarmPrecision)> {
            self.scheduled.lock().unwrap().last().copied()
        }
    }

    impl AlarmClock for FakeAlarm {
        fn can_schedule_exact(&self) -> bool {
            self.exact_permitted
        }

        fn schedule_exact(&self, at: DateTime<Local>) -> Result<(), AlarmError> {
            if !self.exact_permitted || self.refuse_exact {
                return Err(AlarmError::PermissionDenied);
            }
            self.scheduled.lock().unwrap().push((at, AlarmPrecision::Exact));
            Ok(())
        }

        fn schedule_inexact(&self, at: DateTime<Local>) -> Result<(), AlarmError> {
            self.scheduled.lock().unwrap().push((at, AlarmPrecision::Inexact));
            Ok(())
        }

        fn cancel(&self) {
            *self.cancelled.lock().unwrap() += 1;
        }
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn local(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, mo, d, h, mi, 0).earliest().unwrap()
    }

    fn time(h: u8, m: u8) -> ScheduleTime {
        ScheduleTime::new(h, m).unwrap()
    }

    #[test]
    fn test_time_already_passed_rolls_to_tomorrow() {
        let next = next_trigger(&utc(2026, 6, 15, 8, 0), time(7, 30));
        assert_eq!(next, utc(2026, 6, 16, 7, 30));
    }

    #[test]
    fn test_time_still_ahead_is_today() {
        let next = next_trigger(&utc(2026, 6, 15, 7, 0), time(7, 30));
        assert_eq!(next, utc(2026, 6, 15, 7, 30));
    }

    #[test]
    fn test_exactly_now_rolls_to_tomorrow() {
        let next = next_trigger(&utc(2026, 6, 15, 7, 30), time(7, 30));
        assert_eq!(next, utc(2026, 6, 16, 7, 30));
    }

    #[test]
    fn test_month_and_year_boundaries() {
        assert_eq!(next_trigger(&utc(2026, 1, 31, 23, 0), time(6, 0)), utc(2026, 2, 1, 6, 0));
        assert_eq!(next_trigger(&utc(2026, 12, 31, 23, 59), time(0, 0)), utc(2027, 1, 1, 0, 0));
    }

    #[test]
    fn test_every_time_of_day_is_in_the_future_and_matches() {
        let nows = [utc(2026, 6, 15, 0, 0), utc(2026, 6, 15, 12, 17), utc(2026, 6, 15, 23, 59)];
        for now in nows {
            for h in 0..24u8 {
                for m in 0..60u8 {
                    let next = next_trigger(&now, time(h, m));
                    assert!(next > now);
                    assert!(next - now <= chrono::Duration::days(1));
                    assert_eq!((next.hour(), next.minute(), next.second()), (h as u32, m as u32, 0));
                }
            }
        }
    }

    #[test]
    fn test_following_day_is_24h_later() {
        let fired = utc(2026, 6, 15, 7, 30);
        assert_eq!(following_day(&fired, time(7, 30)), fired + chrono::Duration::hours(24));
    }

    #[test]
    fn test_time_skipped_by_spring_forward_moves_an_hour_later() {
        // 2026-03-08 in New York: 02:00 jumps to 03:00
        let now = New_York.with_ymd_and_hms(2026, 3, 8, 0, 0, 0).unwrap();
        let next = next_trigger(&now, time(2, 30));
        assert_eq!(next, New_York.with_ymd_and_hms(2026, 3, 8, 3, 30, 0).unwrap());
        assert_eq!(next.with_timezone(&Utc), utc(2026, 3, 8, 7, 30));
    }

    #[test]
    fn test_time_repeated_by_fall_back_takes_earlier_instant() {
        // 2026-11-01 in New York: 01:00-02:00 happens twice
        let now = New_York.with_ymd_and_hms(2026, 10, 31, 12, 0, 0).unwrap();
        let next = next_trigger(&now, time(1, 30));
        assert_eq!(next.with_timezone(&Utc), utc(2026, 11, 1, 5, 30));
    }

    #[test]
    fn test_following_day_across_dst_keeps_wall_clock_time() {
        let fired = New_York.with_ymd_and_hms(2026, 3, 7, 7, 30, 0).unwrap();
        let next = following_day(&fired, time(7, 30));
        assert_eq!((next.hour(), next.minute()), (7, 30));
        assert_eq!(next - fired, chrono::Duration::hours(23));

        let fired = New_York.with_ymd_and_hms(2026, 10, 31, 7, 30, 0).unwrap();
        assert_eq!(following_day(&fired, time(7, 30)) - fired, chrono::Duration::hours(25));
    }

    #[test]
    fn test_arm_prefers_exact() {
        let alarm = Arc::new(FakeAlarm::exact());
        let scheduler = Scheduler::new(alarm.clone());

        let at = scheduler.arm_from(local(2026, 6, 15, 7, 0), time(7, 30)).unwrap();
        assert_eq!(at, local(2026, 6, 15, 7, 30));
        assert_eq!(alarm.last(), Some((at, AlarmPrecision::Exact)));
        assert_eq!(
            scheduler.state(),
            SchedulerState::Armed { at, time: time(7, 30), precision: AlarmPrecision::Exact }
        );
    }

    #[test]
    fn test_arm_without_exact_permission_falls_back_to_inexact() {
        let alarm = Arc::new(FakeAlarm::default());
        let scheduler = Scheduler::new(alarm.clone());

        let at = scheduler.arm_from(local(2026, 6, 15, 8, 0), time(7, 30)).unwrap();
        assert_eq!(at, local(2026, 6, 16, 7, 30));
        assert_eq!(alarm.last(), Some((at, AlarmPrecision::Inexact)));
        assert_eq!(scheduler.next_run(), Some(at));
    }

    #[test]
    fn test_refused_exact_request_falls_back_to_inexact() {
        let alarm = Arc::new(FakeAlarm { exact_permitted: true, refuse_exact: true, ..Default::default() });
        let scheduler = Scheduler::new(alarm.clone());

        let at = scheduler.arm_from(local(2026, 6, 15, 7, 0), time(7, 30)).unwrap();
        assert_eq!(alarm.last(), Some((at, AlarmPrecision::Inexact)));
    }

    #[test]
    fn test_cancel_returns_to_unarmed() {
        let alarm = Arc::new(FakeAlarm::exact());
        let scheduler = Scheduler::new(alarm.clone());
        scheduler.arm_from(local(2026, 6, 15, 7, 0), time(7, 30)).unwrap();

        scheduler.cancel();
        assert_eq!(scheduler.state(), SchedulerState::Unarmed);
        assert_eq!(scheduler.next_run_string(), "");
        assert_eq!(*alarm.cancelled.lock().unwrap(), 1);
    }

    #[test]
    fn test_rearm_after_fire_is_next_day_same_time() {
        let alarm = Arc::new(FakeAlarm::exact());
        let scheduler = Scheduler::new(alarm.clone());
        let at = scheduler.arm_from(local(2026, 6, 15, 7, 0), time(7, 30)).unwrap();
        let fired = TimerFired { scheduled_for: at };
        assert!(scheduler.is_current(&fired));

        let schedule = ScheduleConfig::enabled(time(7, 30));
        let next = scheduler
            .rearm_after_fire_from(local(2026, 6, 15, 7, 31), &fired, Some(&schedule))
            .unwrap()
            .unwrap();

        assert_eq!(next, local(2026, 6, 16, 7, 30));
        assert_eq!(next - at, chrono::Duration::hours(24));
        assert!(!scheduler.is_current(&fired));
    }

    #[test]
    fn test_rearm_when_delivered_late_still_targets_following_day() {
        let alarm = Arc::new(FakeAlarm::default());
        let scheduler = Scheduler::new(alarm.clone());
        let at = scheduler.arm_from(local(2026, 6, 15, 7, 0), time(23, 55)).unwrap();
        let fired = TimerFired { scheduled_for: at };

        // Inexact delivery after midnight
        let next = scheduler
            .rearm_after_fire_from(local(2026, 6, 16, 0, 2), &fired, Some(&ScheduleConfig::enabled(time(23, 55))))
            .unwrap()
            .unwrap();
        assert_eq!(next, local(2026, 6, 16, 23, 55));
    }

    #[test]
    fn test_rearm_after_very_late_delivery_rolls_forward_from_now() {
        let alarm = Arc::new(FakeAlarm::exact());
        let scheduler = Scheduler::new(alarm.clone());
        let at = scheduler.arm_from(local(2026, 6, 15, 7, 0), time(7, 30)).unwrap();
        let fired = TimerFired { scheduled_for: at };

        let next = scheduler
            .rearm_after_fire_from(local(2026, 6, 17, 9, 0), &fired, Some(&ScheduleConfig::enabled(time(7, 30))))
            .unwrap()
            .unwrap();
        assert_eq!(next, local(2026, 6, 18, 7, 30));
    }

    #[test]
    fn test_rearm_with_disabled_schedule_cancels() {
        let alarm = Arc::new(FakeAlarm::exact());
        let scheduler = Scheduler::new(alarm.clone());
        let at = scheduler.arm_from(local(2026, 6, 15, 7, 0), time(7, 30)).unwrap();

        let result = scheduler
            .rearm_after_fire_from(
                local(2026, 6, 15, 7, 30),
                &TimerFired { scheduled_for: at },
                Some(&ScheduleConfig::disabled(Some(time(7, 30)))),
            )
            .unwrap();
        assert_eq!(result, None);
        assert_eq!(scheduler.state(), SchedulerState::Unarmed);
    }

    #[test]
    fn test_rearm_without_readable_config_reuses_armed_time() {
        let alarm = Arc::new(FakeAlarm::exact());
        let scheduler = Scheduler::new(alarm.clone());
        let at = scheduler.arm_from(local(2026, 6, 15, 7, 0), time(7, 30)).unwrap();

        let next = scheduler
            .rearm_after_fire_from(local(2026, 6, 15, 7, 30), &TimerFired { scheduled_for: at }, None)
            .unwrap();
        assert_eq!(next, Some(local(2026, 6, 16, 7, 30)));
    }

    #[test]
    fn test_rearm_after_time_change_uses_new_time() {
        let alarm = Arc::new(FakeAlarm::exact());
        let scheduler = Scheduler::new(alarm.clone());
        let at = scheduler.arm_from(local(2026, 6, 15, 7, 0), time(7, 30)).unwrap();

        let next = scheduler
            .rearm_after_fire_from(
                local(2026, 6, 15, 7, 30),
                &TimerFired { scheduled_for: at },
                Some(&ScheduleConfig::enabled(time(18, 0))),
            )
            .unwrap();
        assert_eq!(next, Some(local(2026, 6, 15, 18, 0)));
    }

    #[test]
    fn test_restore_arms_only_enabled_schedules() {
        let alarm = Arc::new(FakeAlarm::exact());
        let scheduler = Scheduler::new(alarm.clone());

        assert_eq!(scheduler.restore(&ScheduleConfig::default()).unwrap(), None);
        assert_eq!(scheduler.restore(&ScheduleConfig::disabled(Some(time(7, 30)))).unwrap(), None);
        assert_eq!(scheduler.state(), SchedulerState::Unarmed);

        let first = scheduler.restore(&ScheduleConfig::enabled(time(7, 30))).unwrap();
        let second = scheduler.restore(&ScheduleConfig::enabled(time(7, 30))).unwrap();
        assert!(first.is_some());
        assert_eq!(first, second);
        assert_eq!(scheduler.next_run(), second);
    }
}
