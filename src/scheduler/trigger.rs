//! Fire-time arithmetic. Everything here is a pure function of the trigger,
//! the time and the timezone.

use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::config::{Timezone, UpdatePolicy};

#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    /// Fire immediately, once.
    Once,
    /// Fire immediately, then every period.
    Interval(Duration),
    Cron {
        schedule: Box<Schedule>,
        timezone: Timezone,
    },
}

impl Trigger {
    pub fn from_policy(policy: &UpdatePolicy, timezone: Timezone) -> Self {
        match policy {
            UpdatePolicy::RunOnce => Trigger::Once,
            UpdatePolicy::Interval(period) => Trigger::Interval(*period),
            UpdatePolicy::Cron(schedule) => Trigger::Cron {
                schedule: schedule.clone(),
                timezone,
            },
        }
    }

    /// First fire time of a job registered at `now`.
    pub fn first_fire(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Once | Trigger::Interval(_) => Some(now),
            Trigger::Cron { schedule, timezone } => timezone.next_cron_fire(schedule, now),
        }
    }

    /// Fire time following the one at `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Once => None,
            Trigger::Interval(period) => add_period(after, *period),
            Trigger::Cron { schedule, timezone } => timezone.next_cron_fire(schedule, after),
        }
    }

    /// Latest fire time at or before `now`, starting from `due`, and how many
    /// earlier fire times it absorbs.
    fn latest_due(&self, due: DateTime<Utc>, now: DateTime<Utc>) -> (DateTime<Utc>, usize) {
        if due >= now {
            return (due, 0);
        }
        match self {
            Trigger::Interval(period) if !period.is_zero() => {
                let behind = (now - due).to_std().unwrap_or_default();
                let missed = (behind.as_nanos() / period.as_nanos()) as u32;
                (due + *period * missed, missed as usize)
            }
            _ => {
                let mut latest = due;
                let mut missed = 0;
                while let Some(next) = self.next_after(latest).filter(|n| *n <= now) {
                    latest = next;
                    missed += 1;
                }
                (latest, missed)
            }
        }
    }
}

/// `at + period`, or `None` past the end of representable time.
fn add_period(at: DateTime<Utc>, period: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(period)
        .ok()
        .and_then(|period| at.checked_add_signed(period))
}

/// What a job does when it wakes up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Firing {
    /// `false` when the run is later than the grace period allows.
    pub run: bool,
    /// The fire time this run stands for.
    pub scheduled: DateTime<Utc>,
    /// Earlier fire times merged into this one.
    pub coalesced: usize,
    pub lateness: Duration,
    pub next: Option<DateTime<Utc>>,
}

/// `true` if a run `lateness` after its fire time may still happen.
/// `None` grace always allows it. Compared with second granularity.
pub fn within_grace(lateness: Duration, grace: Option<Duration>) -> bool {
    grace.is_none_or(|grace| lateness.as_secs() <= grace.as_secs())
}

/// Plan a wake up at `now` for a job whose next fire time was `due`. Missed
/// fire times are coalesced into one run of the latest of them.
pub fn coalesce(
    trigger: &Trigger,
    due: DateTime<Utc>,
    now: DateTime<Utc>,
    grace: Option<Duration>,
) -> Firing {
    let (scheduled, coalesced) = trigger.latest_due(due, now);
    let lateness = (now - scheduled).to_std().unwrap_or_default();
    Firing {
        run: within_grace(lateness, grace),
        scheduled,
        coalesced,
        lateness,
        next: trigger.next_after(scheduled),
    }
}

/// The next run shown at startup: none for run-once, the next cron fire, or
/// one interval from now.
pub fn next_run(policy: &UpdatePolicy, now: DateTime<Utc>, timezone: Timezone) -> Option<DateTime<Utc>> {
    match policy {
        UpdatePolicy::RunOnce => None,
        UpdatePolicy::Interval(period) => add_period(now, *period),
        UpdatePolicy::Cron(schedule) => timezone.next_cron_fire(schedule, now),
    }
}
