//! Job definitions and the query/result types of the public API.

use chrono::{DateTime, Utc};
use mongodb::bson::{Bson, Document};

use crate::errors::Error;

/// Whether a job name identifies a singleton definition or a family of jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobType {
    /// At most one document per name; saving again updates it in place.
    Single,
    /// Multiple documents per name; an optional `unique_key` deduplicates.
    Normal,
}

impl JobType {
    /// The stored string form, also used in query filters.
    pub fn as_str(self) -> &'static str {
        match self {
            JobType::Single => "SINGLE",
            JobType::Normal => "NORMAL",
        }
    }
}

/// Predefined priority levels. Higher runs first among simultaneously-due jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// 20
    Highest,
    /// 10
    High,
    /// 0 (the default)
    Normal,
    /// -10
    Low,
    /// -20
    Lowest,
}

impl From<Priority> for i32 {
    fn from(priority: Priority) -> i32 {
        match priority {
            Priority::Highest => 20,
            Priority::High => 10,
            Priority::Normal => 0,
            Priority::Low => -10,
            Priority::Lowest => -20,
        }
    }
}

/// Immutable job definition produced by [`JobBuilder::build`](crate::JobBuilder::build).
///
/// A pure data object with no persistence logic; `T` is the typed payload.
#[derive(Debug, Clone)]
pub struct JobSpec<T = ()> {
    /// Handler name; selects which registered handler runs this job.
    pub name: String,
    /// Deduplication key for `Normal` jobs.
    pub unique_key: Option<String>,
    /// Ordered key/value selector map, stored under the nested `unique` field.
    pub unique: Option<Document>,
    /// Singleton or multi-instance semantics.
    pub job_type: JobType,
    /// Next scheduled run; absence means "not scheduled".
    pub next_run_at: Option<DateTime<Utc>>,
    /// Schedule expression evaluated after each successful run.
    pub repeat_interval: Option<String>,
    /// IANA zone id used by calendar-based schedules.
    pub repeat_timezone: Option<String>,
    /// Signed priority; defaults to 0.
    pub priority: i32,
    /// Typed payload delivered to the handler.
    pub data: Option<T>,
}

/// Outcome of persisting a job spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistResult {
    /// A new document was inserted.
    Created,
    /// An existing document was updated in place.
    Updated,
}

impl PersistResult {
    /// True if the save inserted a new document.
    pub fn created(self) -> bool {
        matches!(self, PersistResult::Created)
    }

    /// True if the save updated an existing document.
    pub fn updated(self) -> bool {
        matches!(self, PersistResult::Updated)
    }
}

/// Describes which jobs to cancel.
///
/// This is an API-layer object; the store translates it into a database
/// filter (`unique` entries match the nested `unique.<key>` fields).
#[derive(Debug, Clone, Default)]
pub struct CancelQuery {
    name: Option<String>,
    unique_key: Option<String>,
    unique: Document,
}

impl CancelQuery {
    /// Start building a query. At least one selector must be set.
    pub fn builder() -> CancelQueryBuilder {
        CancelQueryBuilder::default()
    }

    /// Shorthand for a query matching on handler name only.
    pub fn by_name(name: impl Into<String>) -> Self {
        CancelQueryBuilder::default().name(name).build()
    }

    /// Handler name selector, if set.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// `unique_key` selector, if set.
    pub fn unique_key(&self) -> Option<&str> {
        self.unique_key.as_deref()
    }

    /// Nested `unique` field selectors.
    pub fn unique(&self) -> &Document {
        &self.unique
    }

    /// True when no selector is present.
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.unique_key.is_none() && self.unique.is_empty()
    }
}

/// Incremental builder for [`CancelQuery`].
#[derive(Debug, Clone, Default)]
pub struct CancelQueryBuilder {
    name: Option<String>,
    unique_key: Option<String>,
    unique: Document,
}

impl CancelQueryBuilder {
    /// Match on handler name. Blank values are ignored.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.name = (!name.trim().is_empty()).then_some(name);
        self
    }

    /// Match on the deterministic `unique_key`. Blank values are ignored.
    pub fn unique_key(mut self, unique_key: impl Into<String>) -> Self {
        let unique_key = unique_key.into();
        self.unique_key = (!unique_key.trim().is_empty()).then_some(unique_key);
        self
    }

    /// Replace the nested `unique` selectors wholesale.
    pub fn unique(mut self, unique: Document) -> Self {
        self.unique = unique;
        self
    }

    /// Add a single nested `unique.<key>` selector. Blank keys and null
    /// values are ignored.
    pub fn put(mut self, key: impl Into<String>, value: impl Into<Bson>) -> Self {
        let key = key.into();
        let value = value.into();
        if !key.trim().is_empty() && value != Bson::Null {
            self.unique.insert(key, value);
        }
        self
    }

    /// Finish the query.
    pub fn build(self) -> CancelQuery {
        CancelQuery {
            name: self.name,
            unique_key: self.unique_key,
            unique: self.unique,
        }
    }
}

/// Whether cancellation disables matched jobs or deletes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelMode {
    /// Keep the documents but clear scheduling and lock fields.
    #[default]
    Disable,
    /// Remove the documents.
    Delete,
}

/// Options for [`Scheduler::cancel`](crate::Scheduler::cancel).
#[derive(Debug, Clone, Copy)]
pub struct CancelOptions {
    /// Disable or delete.
    pub mode: CancelMode,
    /// Maximum number of jobs to affect; must be positive.
    pub limit: u32,
}

impl Default for CancelOptions {
    fn default() -> Self {
        CancelOptions {
            mode: CancelMode::Disable,
            limit: u32::MAX,
        }
    }
}

impl CancelOptions {
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.limit == 0 {
            return Err(Error::InvalidArgument(
                "cancel limit must be a positive number".into(),
            ));
        }
        Ok(())
    }
}

/// Result of a cancel operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CancelResult {
    /// Number of jobs matched by the query.
    pub matched: u64,
    /// Number of jobs whose scheduling was cleared.
    pub modified: u64,
    /// Number of jobs deleted.
    pub deleted: u64,
}

impl CancelResult {
    /// True when at least one job was modified or deleted.
    pub fn has_effect(&self) -> bool {
        self.modified > 0 || self.deleted > 0
    }
}
