//! Fluent construction of job specs.

use chrono::{DateTime, Utc};
use mongodb::bson::{Bson, Document};
use serde::Serialize;

use crate::errors::Error;
use crate::interval;
use crate::spec::{JobSpec, JobType, PersistResult};
use crate::storage::JobStore;

/// Options for repeat scheduling.
#[derive(Debug, Clone)]
pub struct RepeatOptions {
    /// When true (the default), the first run is scheduled one interval out;
    /// when false, the job runs as soon as the next poll sees it.
    pub skip_immediate: bool,
    /// IANA zone id applied before the interval is recorded; `None` keeps
    /// whatever the builder already has.
    pub timezone: Option<String>,
}

impl Default for RepeatOptions {
    fn default() -> Self {
        RepeatOptions {
            skip_immediate: true,
            timezone: None,
        }
    }
}

/// Fluent builder for configuring a job before persisting it.
///
/// `build()` returns the in-memory [`JobSpec`]; `save()` builds and upserts
/// it through the store. Validating setters return `Result` so chains read
/// as `builder.unique_key("k")?.priority(10).save().await`.
#[derive(Debug, Clone)]
pub struct JobBuilder<T = ()> {
    store: JobStore,
    name: String,
    data: Option<T>,
    unique_key: Option<String>,
    unique: Option<Document>,
    job_type: JobType,
    next_run_at: Option<DateTime<Utc>>,
    repeat_interval: Option<String>,
    repeat_timezone: Option<String>,
    priority: i32,
}

impl<T: Serialize> JobBuilder<T> {
    pub(crate) fn new(store: JobStore, name: impl Into<String>, data: Option<T>) -> Self {
        JobBuilder {
            store,
            name: name.into(),
            data,
            unique_key: None,
            unique: None,
            job_type: JobType::Normal,
            next_run_at: None,
            repeat_interval: None,
            repeat_timezone: None,
            priority: 0,
        }
    }

    /// Set the deduplication key; marks the job `NORMAL`.
    pub fn unique_key(mut self, unique_key: impl Into<String>) -> Result<Self, Error> {
        let unique_key = unique_key.into();
        if unique_key.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "unique key must not be blank".into(),
            ));
        }
        self.unique_key = Some(unique_key);
        self.job_type = JobType::Normal;
        Ok(self)
    }

    /// Set the nested `unique` selector map. Keys must be non-blank and
    /// values non-null; the map must not be empty.
    pub fn unique(mut self, unique: Document) -> Result<Self, Error> {
        if unique.is_empty() {
            return Err(Error::InvalidArgument(
                "unique map must not be empty".into(),
            ));
        }
        for (key, value) in &unique {
            if key.trim().is_empty() {
                return Err(Error::InvalidArgument(
                    "unique map contains a blank key".into(),
                ));
            }
            if value == &Bson::Null {
                return Err(Error::InvalidArgument(format!(
                    "unique map contains a null value for key: {key}"
                )));
            }
        }
        self.unique = Some(unique);
        Ok(self)
    }

    /// Set the job priority from a raw value or a [`Priority`](crate::Priority) level.
    pub fn priority(mut self, priority: impl Into<i32>) -> Self {
        self.priority = priority.into();
        self
    }

    /// Set the zone used by `repeat_at` and cron schedules.
    pub fn timezone(mut self, timezone: impl Into<String>) -> Result<Self, Error> {
        let timezone = timezone.into();
        if timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(Error::InvalidArgument(format!(
                "unknown IANA zone id: {timezone}"
            )));
        }
        self.repeat_timezone = Some(timezone);
        Ok(self)
    }

    /// Schedule a one-time run at an absolute instant.
    ///
    /// Once set, later `repeat_at`/`repeat_every` calls keep this time and
    /// only record the repeat interval.
    pub fn schedule(mut self, at: DateTime<Utc>) -> Self {
        self.next_run_at = Some(at);
        self
    }

    /// Repeat once per day at a fixed wall-clock time (`"HH:mm"` or
    /// `"HH:mm:ss"`), in the builder's zone.
    pub fn repeat_at(mut self, time_of_day: &str) -> Result<Self, Error> {
        let time_of_day = time_of_day.trim();
        let time = interval::parse_time_of_day(time_of_day).map_err(|_| {
            Error::InvalidArgument(format!(
                "expected HH:mm or HH:mm:ss time of day: {time_of_day}"
            ))
        })?;

        let zone = interval::resolve_zone(self.repeat_timezone.as_deref());
        self.repeat_interval = Some(format!("AT {time_of_day}"));
        self.repeat_timezone
            .get_or_insert_with(|| zone.name().to_string());

        if self.next_run_at.is_none() {
            self.next_run_at = Some(interval::next_daily_occurrence(time, Utc::now(), zone)?);
        }
        Ok(self)
    }

    /// Repeat on an interval spec: human text, cron, or numeric seconds.
    pub fn repeat_every(self, interval: &str) -> Result<Self, Error> {
        self.repeat_every_with(interval, RepeatOptions::default())
    }

    /// Repeat on an interval spec with explicit options.
    pub fn repeat_every_with(mut self, interval: &str, options: RepeatOptions) -> Result<Self, Error> {
        if let Some(timezone) = &options.timezone {
            self = self.timezone(timezone.clone())?;
        }

        self.repeat_interval = Some(interval.to_string());
        if self.next_run_at.is_some() {
            return Ok(self);
        }

        let now = Utc::now();
        if !options.skip_immediate {
            self.next_run_at = Some(now);
            return Ok(self);
        }

        let zone = interval::resolve_zone(self.repeat_timezone.as_deref());
        let duration = interval::parse_duration(interval, zone, now)?;
        self.next_run_at = now
            .checked_add_signed(duration)
            .or(Some(DateTime::<Utc>::MAX_UTC));
        Ok(self)
    }

    /// Repeat every `seconds` seconds.
    pub fn repeat_every_secs(self, seconds: u64) -> Result<Self, Error> {
        self.repeat_every_secs_with(seconds, RepeatOptions::default())
    }

    /// Repeat every `seconds` seconds with explicit options.
    ///
    /// The interval is stored in its decimal string form and goes through
    /// the schedule parser's numeric branch at reschedule time.
    pub fn repeat_every_secs_with(
        mut self,
        seconds: u64,
        options: RepeatOptions,
    ) -> Result<Self, Error> {
        if seconds == 0 {
            return Err(Error::InvalidArgument(
                "interval must be a positive number of seconds".into(),
            ));
        }
        if let Some(timezone) = &options.timezone {
            self = self.timezone(timezone.clone())?;
        }

        self.repeat_interval = Some(seconds.to_string());
        if self.next_run_at.is_some() {
            return Ok(self);
        }

        let now = Utc::now();
        self.next_run_at = if options.skip_immediate {
            now.checked_add_signed(chrono::Duration::seconds(seconds.min(i64::MAX as u64) as i64))
                .or(Some(DateTime::<Utc>::MAX_UTC))
        } else {
            Some(now)
        };
        Ok(self)
    }

    /// Mark this job as `SINGLE`: one scheduled definition per name, updated
    /// in place on re-save. Clears any uniqueness selectors.
    pub fn single(mut self) -> Self {
        self.unique_key = None;
        self.unique = None;
        self.job_type = JobType::Single;
        self
    }

    /// Build the immutable spec without persisting it.
    pub fn build(self) -> JobSpec<T> {
        JobSpec {
            name: self.name,
            unique_key: self.unique_key,
            unique: self.unique,
            job_type: self.job_type,
            next_run_at: self.next_run_at,
            repeat_interval: self.repeat_interval,
            repeat_timezone: self.repeat_timezone,
            priority: self.priority,
            data: self.data,
        }
    }

    /// Build and persist (insert or upsert).
    pub async fn save(self) -> Result<PersistResult, Error> {
        let store = self.store.clone();
        let spec = self.build();
        store.save(&spec).await
    }
}
