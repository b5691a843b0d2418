//! Cron-driven message schedules.
//!
//! Providers turn repository rows into [`ScheduleEntry`] values. The
//! [`ScheduleRunner`] keeps a [`ScheduleSnapshot`] of all providers, rebuilds
//! it every refresh interval, and dispatches messages whose time has come.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::bus::MessageBus;
use crate::config::ScheduleConfig;
use crate::domain::{CronJobRepository, SuiteRepository};
use crate::message::{CronJobMessage, QueueMessage, ScheduledSuiteMessage};
use crate::runtime::ShutdownToken;

#[derive(Debug, thiserror::Error)]
#[error("invalid cron expression {expression:?}: {reason}")]
pub struct InvalidCron {
    pub expression: String,
    pub reason: String,
}

/// A parsed cron expression. Classic five-field expressions are accepted
/// and run at second zero.
#[derive(Clone, Debug)]
pub struct CronSchedule {
    schedule: cron::Schedule,
    expression: String,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, InvalidCron> {
        let trimmed = expression.trim();
        let invalid = |reason: String| InvalidCron {
            expression: expression.to_string(),
            reason,
        };
        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        let normalised = if let [minute, hour, day, month, weekday] = fields[..] {
            let weekday = crontab_weekdays(weekday).map_err(invalid)?;
            format!("0 {minute} {hour} {day} {month} {weekday}")
        } else {
            trimmed.to_string()
        };
        let schedule =
            cron::Schedule::from_str(&normalised).map_err(|e| invalid(e.to_string()))?;
        Ok(Self {
            schedule,
            expression: trimmed.to_string(),
        })
    }

    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }
}

/// Rewrite a crontab day-of-week field (Sunday is 0 or 7, Monday is 1) into
/// the numbering of the `cron` crate (Sunday is 1, Saturday is 7). Numeric
/// items are expanded into an explicit list; names pass through.
fn crontab_weekdays(field: &str) -> Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }
    let number = |raw: &str| -> Result<u32, String> {
        match raw.parse::<u32>() {
            Ok(day) if day <= 7 => Ok(day),
            _ => Err(format!("invalid day of week {raw:?}")),
        }
    };

    let mut days = std::collections::BTreeSet::new();
    let mut named = Vec::new();
    for item in field.split(',') {
        if item.chars().any(|c| c.is_ascii_alphabetic()) {
            named.push(item.to_string());
            continue;
        }
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => match step.parse::<usize>() {
                Ok(step) if step > 0 => (range, Some(step)),
                _ => return Err(format!("invalid step in {item:?}")),
            },
            None => (item, None),
        };
        let (start, end) = match range.split_once('-') {
            _ if range == "*" => (0, 6),
            Some((start, end)) => (number(start)?, number(end)?),
            None => {
                let day = number(range)?;
                // `n/step` runs to the end of the week.
                (day, if step.is_some() { day.max(6) } else { day })
            }
        };
        if start > end {
            return Err(format!("invalid range {item:?}"));
        }
        for day in (start..=end).step_by(step.unwrap_or(1)) {
            days.insert(day % 7 + 1);
        }
    }

    Ok(days
        .iter()
        .map(u32::to_string)
        .chain(named)
        .collect::<Vec<_>>()
        .join(","))
}

#[derive(Clone, Debug)]
pub struct ScheduleEntry {
    /// Stable identity across refreshes, e.g. `cron_job:4`.
    pub id: String,
    pub schedule: CronSchedule,
    pub message: QueueMessage,
}

impl ScheduleEntry {
    /// Build an entry, logging and returning `None` for an unparsable expression.
    pub fn parse(id: String, expression: &str, message: QueueMessage) -> Option<Self> {
        match CronSchedule::parse(expression) {
            Ok(schedule) => Some(Self {
                id,
                schedule,
                message,
            }),
            Err(error) => {
                tracing::warn!(entry_id = %id, error = %error, "skipping schedule entry");
                None
            }
        }
    }
}

/// Entries of one provider, unique by id.
#[derive(Clone, Debug, Default)]
pub struct Schedule {
    entries: Vec<ScheduleEntry>,
    ids: HashSet<String>,
}

impl Schedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry; a second entry with the same id is dropped.
    pub fn add(&mut self, entry: ScheduleEntry) -> bool {
        if !self.ids.insert(entry.id.clone()) {
            tracing::debug!(entry_id = %entry.id, "duplicate schedule entry dropped");
            return false;
        }
        self.entries.push(entry);
        true
    }

    pub fn with(mut self, entry: ScheduleEntry) -> Self {
        self.add(entry);
        self
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
pub trait ScheduleProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn schedule(&self) -> anyhow::Result<Schedule>;
}

/// One entry per active cron job that has an expression.
pub struct CronJobScheduleProvider {
    jobs: Arc<dyn CronJobRepository>,
}

impl CronJobScheduleProvider {
    pub fn new(jobs: Arc<dyn CronJobRepository>) -> Self {
        Self { jobs }
    }
}

#[async_trait]
impl ScheduleProvider for CronJobScheduleProvider {
    fn name(&self) -> &'static str {
        "cron_jobs"
    }

    async fn schedule(&self) -> anyhow::Result<Schedule> {
        let mut schedule = Schedule::new();
        for job in self.jobs.find_active().await? {
            let Some(expression) = job.cron_expression.as_deref() else {
                continue;
            };
            if let Some(entry) = ScheduleEntry::parse(
                format!("cron_job:{}", job.id),
                expression,
                CronJobMessage { job_id: job.id }.into(),
            ) {
                schedule.add(entry);
            }
        }
        Ok(schedule)
    }
}

/// One entry per active suite that has an expression.
pub struct SuiteScheduleProvider {
    suites: Arc<dyn SuiteRepository>,
}

impl SuiteScheduleProvider {
    pub fn new(suites: Arc<dyn SuiteRepository>) -> Self {
        Self { suites }
    }
}

#[async_trait]
impl ScheduleProvider for SuiteScheduleProvider {
    fn name(&self) -> &'static str {
        "suites"
    }

    async fn schedule(&self) -> anyhow::Result<Schedule> {
        let mut schedule = Schedule::new();
        for suite in self.suites.find_scheduled().await? {
            if !suite.is_active {
                continue;
            }
            let Some(expression) = suite.cron_expression.as_deref() else {
                continue;
            };
            if let Some(entry) = ScheduleEntry::parse(
                format!("suite:{}", suite.id),
                expression,
                ScheduledSuiteMessage { suite_id: suite.id }.into(),
            ) {
                schedule.add(entry);
            }
        }
        Ok(schedule)
    }
}

#[derive(Clone, Debug)]
struct Slot {
    entry: ScheduleEntry,
    next_fire: Option<DateTime<Utc>>,
}

/// Point-in-time view of every provider's entries with their next fire time.
#[derive(Clone, Debug)]
pub struct ScheduleSnapshot {
    built_at: DateTime<Utc>,
    slots: Vec<Slot>,
}

impl ScheduleSnapshot {
    pub fn build(schedules: Vec<Schedule>, now: DateTime<Utc>) -> Self {
        Self::merge(schedules, now, &HashMap::new())
    }

    /// Rebuild from fresh schedules. Entries whose id and expression are
    /// unchanged keep their pending fire time.
    pub fn refreshed(&self, schedules: Vec<Schedule>, now: DateTime<Utc>) -> Self {
        let previous: HashMap<&str, &Slot> = self
            .slots
            .iter()
            .map(|slot| (slot.entry.id.as_str(), slot))
            .collect();
        Self::merge(schedules, now, &previous)
    }

    fn merge(schedules: Vec<Schedule>, now: DateTime<Utc>, previous: &HashMap<&str, &Slot>) -> Self {
        let mut seen = HashSet::new();
        let mut slots = Vec::new();
        for entry in schedules.into_iter().flat_map(|schedule| schedule.entries) {
            if !seen.insert(entry.id.clone()) {
                continue;
            }
            let next_fire = match previous.get(entry.id.as_str()) {
                Some(slot) if slot.entry.schedule.expression() == entry.schedule.expression() => {
                    slot.next_fire
                }
                _ => entry.schedule.next_after(now),
            };
            slots.push(Slot { entry, next_fire });
        }
        Self {
            built_at: now,
            slots,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_stale(&self, now: DateTime<Utc>, interval: chrono::Duration) -> bool {
        now - self.built_at >= interval
    }

    pub fn next_fire(&self, entry_id: &str) -> Option<DateTime<Utc>> {
        self.slots
            .iter()
            .find(|slot| slot.entry.id == entry_id)
            .and_then(|slot| slot.next_fire)
    }

    /// Messages due at `now`. Each due entry fires once, however many ticks
    /// were missed, and is rescheduled after `now`.
    pub fn due(&mut self, now: DateTime<Utc>) -> Vec<(String, QueueMessage)> {
        let mut due = Vec::new();
        for slot in &mut self.slots {
            if slot.next_fire.is_some_and(|at| at <= now) {
                due.push((slot.entry.id.clone(), slot.entry.message.clone()));
                slot.next_fire = slot.entry.schedule.next_after(now);
            }
        }
        due
    }
}

/// Periodically dispatches due schedule entries onto the bus.
pub struct ScheduleRunner {
    providers: Vec<Arc<dyn ScheduleProvider>>,
    bus: Arc<dyn MessageBus>,
    config: ScheduleConfig,
    snapshot: Mutex<Option<ScheduleSnapshot>>,
}

impl ScheduleRunner {
    pub fn new(bus: Arc<dyn MessageBus>, config: ScheduleConfig) -> Self {
        Self {
            providers: Vec::new(),
            bus,
            config,
            snapshot: Mutex::new(None),
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn ScheduleProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Rebuild the snapshot from all providers. On failure the previous
    /// snapshot stays in place.
    pub async fn refresh(&self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let mut schedules = Vec::with_capacity(self.providers.len());
        for provider in &self.providers {
            let schedule = provider.schedule().await.map_err(|error| {
                error.context(format!("schedule provider {} failed", provider.name()))
            })?;
            tracing::debug!(provider = provider.name(), entries = schedule.len(), "schedule loaded");
            schedules.push(schedule);
        }

        let mut guard = self.snapshot.lock();
        let snapshot = match guard.as_ref() {
            Some(current) => current.refreshed(schedules, now),
            None => ScheduleSnapshot::build(schedules, now),
        };
        let len = snapshot.len();
        *guard = Some(snapshot);
        Ok(len)
    }

    /// Refresh if stale, then dispatch everything due. Returns the number of
    /// messages dispatched.
    pub async fn tick(&self, now: DateTime<Utc>) -> usize {
        let stale = self
            .snapshot
            .lock()
            .as_ref()
            .map_or(true, |snapshot| snapshot.is_stale(now, self.config.refresh_interval()));
        if stale {
            if let Err(error) = self.refresh(now).await {
                tracing::warn!(error = ?error, "schedule refresh failed, keeping previous entries");
            }
        }

        let due = match self.snapshot.lock().as_mut() {
            Some(snapshot) => snapshot.due(now),
            None => Vec::new(),
        };

        let mut dispatched = 0;
        for (entry_id, message) in due {
            match self.bus.dispatch_message(message).await {
                Ok(receipt) => {
                    tracing::info!(
                        entry_id = %entry_id,
                        queue_name = %receipt.queue_name,
                        "scheduled message dispatched"
                    );
                    dispatched += 1;
                }
                Err(error) => {
                    tracing::error!(entry_id = %entry_id, error = ?error, "failed to dispatch scheduled message");
                }
            }
        }
        dispatched
    }

    pub async fn run(&self, shutdown: ShutdownToken) {
        let interval = tokio::time::Duration::from_millis(self.config.tick_interval_ms);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("schedule runner shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    self.tick(Utc::now()).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, s).unwrap()
    }

    fn entry(id: &str, expression: &str) -> ScheduleEntry {
        ScheduleEntry::parse(id.into(), expression, CronJobMessage { job_id: 1 }.into()).unwrap()
    }

    #[test]
    fn test_five_field_expression_normalised() {
        let schedule = CronSchedule::parse("*/5 * * * *").unwrap();
        assert_eq!(schedule.next_after(at(10, 1, 30)), Some(at(10, 5, 0)));
        assert_eq!(schedule.expression(), "*/5 * * * *");
    }

    fn weekday_after(expression: &str, after: DateTime<Utc>) -> chrono::Weekday {
        use chrono::Datelike;
        CronSchedule::parse(expression)
            .unwrap()
            .next_after(after)
            .unwrap()
            .weekday()
    }

    #[test]
    fn test_crontab_weekday_numbering() {
        use chrono::Weekday;
        // Sunday 2026-03-01.
        let sunday = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        assert_eq!(weekday_after("0 9 * * 1", sunday), Weekday::Mon);
        assert_eq!(weekday_after("0 0 * * 0", sunday), Weekday::Sun);
        assert_eq!(weekday_after("0 0 * * 7", sunday), Weekday::Sun);
        assert_eq!(weekday_after("0 0 * * 6", sunday), Weekday::Sat);
        assert_eq!(weekday_after("0 9 * * 1-5", sunday), Weekday::Mon);
        assert_eq!(weekday_after("0 9 * * 5-7", at(10, 0, 0)), Weekday::Fri);
        assert_eq!(weekday_after("0 9 * * 0,3", at(10, 0, 0)), Weekday::Wed);
        assert_eq!(weekday_after("0 9 * * */2", at(10, 0, 0)), Weekday::Tue);
        assert_eq!(weekday_after("0 9 * * Mon", sunday), Weekday::Mon);
        assert_eq!(
            CronSchedule::parse("0 0 * * 0").unwrap().next_after(sunday),
            Some(Utc.with_ymd_and_hms(2026, 3, 8, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_crontab_weekday_rejects_out_of_range() {
        assert!(CronSchedule::parse("0 0 * * 8").is_err());
        assert!(CronSchedule::parse("0 0 * * 5-2").is_err());
        assert!(CronSchedule::parse("0 0 * * */0").is_err());
    }

    #[test]
    fn test_invalid_expression_rejected() {
        assert!(CronSchedule::parse("every tuesday").is_err());
        assert!(ScheduleEntry::parse("x".into(), "nope", CronJobMessage { job_id: 1 }.into()).is_none());
    }

    #[test]
    fn test_duplicate_ids_dropped() {
        let mut schedule = Schedule::new();
        assert!(schedule.add(entry("cron_job:1", "0 * * * *")));
        assert!(!schedule.add(entry("cron_job:1", "30 * * * *")));
        assert_eq!(schedule.len(), 1);
    }

    #[test]
    fn test_due_fires_once_and_reschedules() {
        let schedule = Schedule::new().with(entry("cron_job:1", "0 * * * *"));
        let mut snapshot = ScheduleSnapshot::build(vec![schedule], at(9, 30, 0));
        assert!(snapshot.due(at(9, 59, 59)).is_empty());

        let due = snapshot.due(at(12, 0, 5));
        assert_eq!(due.len(), 1);
        assert_eq!(snapshot.next_fire("cron_job:1"), Some(at(13, 0, 0)));
    }

    #[test]
    fn test_refresh_keeps_pending_fire_time() {
        let schedule = Schedule::new().with(entry("cron_job:1", "0 * * * *"));
        let snapshot = ScheduleSnapshot::build(vec![schedule.clone()], at(9, 30, 0));

        let refreshed = snapshot.refreshed(vec![schedule], at(10, 0, 30));
        assert_eq!(refreshed.next_fire("cron_job:1"), Some(at(10, 0, 0)));

        let changed = Schedule::new().with(entry("cron_job:1", "15 * * * *"));
        let refreshed = snapshot.refreshed(vec![changed], at(10, 0, 30));
        assert_eq!(refreshed.next_fire("cron_job:1"), Some(at(10, 15, 0)));
    }

    #[test]
    fn test_staleness() {
        let snapshot = ScheduleSnapshot::build(Vec::new(), at(9, 0, 0));
        let interval = chrono::Duration::seconds(60);
        assert!(!snapshot.is_stale(at(9, 0, 59), interval));
        assert!(snapshot.is_stale(at(9, 1, 0), interval));
    }
}
