//! MongoDB persistence layer for scheduled jobs.
//!
//! Singleton semantics:
//! - `type=SINGLE`: name-only singleton, upserted by `{name, type}`.
//! - `type=NORMAL`: allows multiple documents; with a `unique_key` the upsert
//!   keys on `{name, type, uniqueKey}`, without one every save inserts.

use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use mongodb::Database;
use mongodb::bson::oid::ObjectId;
use mongodb::bson::{self, Bson, Document, doc};
use mongodb::options::ReturnDocument;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::trace;

use crate::errors::Error;
use crate::schema::{self, ScheduledJob};
use crate::spec::{CancelQuery, JobSpec, JobType, PersistResult};

/// Typed handle on the `scheduled_jobs` collection.
#[derive(Debug, Clone)]
pub struct JobStore {
    collection: mongodb::Collection<ScheduledJob>,
}

impl JobStore {
    /// Create a store over `scheduled_jobs` in the given database.
    pub fn new(database: &Database) -> Self {
        JobStore {
            collection: database.collection(schema::COLLECTION),
        }
    }

    /// The underlying typed collection.
    pub fn collection(&self) -> &mongodb::Collection<ScheduledJob> {
        &self.collection
    }

    /// Persist a job spec.
    ///
    /// Returns [`PersistResult::Created`] when a new document was inserted,
    /// [`PersistResult::Updated`] when an existing one was updated in place.
    pub async fn save<T: Serialize>(&self, spec: &JobSpec<T>) -> Result<PersistResult, Error> {
        if spec.name.trim().is_empty() {
            return Err(Error::InvalidArgument("job name must not be blank".into()));
        }

        if spec.job_type == JobType::Normal && is_blank(spec.unique_key.as_deref()) {
            let document = self.to_document(spec)?;
            self.collection.insert_one(document).await?;
            return Ok(PersistResult::Created);
        }

        let mut filter = doc! {
            "name": &spec.name,
            "type": spec.job_type.as_str(),
        };
        if spec.job_type == JobType::Normal {
            if let Some(unique_key) = non_blank(spec.unique_key.as_deref()) {
                filter.insert("uniqueKey", unique_key);
            }
        }

        let result = self
            .collection
            .update_one(filter, upsert_update(spec)?)
            .upsert(true)
            .await?;

        Ok(if result.upserted_id.is_some() {
            PersistResult::Created
        } else {
            PersistResult::Updated
        })
    }

    /// Atomically claim (lock) at most `batch_size` due jobs.
    ///
    /// A job is claimable when `nextRunAt` is set and not after `window_end`,
    /// and it is unlocked or its lock has expired. Claims go in ascending
    /// `nextRunAt` order, higher priority first among ties. Each claim is a
    /// single `findAndModify`, so two nodes can never both receive the same
    /// document; the loop stops early once no match remains.
    pub async fn claim_due_jobs(
        &self,
        window_end: DateTime<Utc>,
        batch_size: usize,
        lock_lifetime: std::time::Duration,
        worker_id: &str,
    ) -> Result<Vec<ScheduledJob>, Error> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }
        if lock_lifetime.is_zero() {
            return Err(Error::InvalidArgument(
                "lock lifetime must be a positive duration".into(),
            ));
        }
        if worker_id.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "worker id must not be blank".into(),
            ));
        }

        let now = Utc::now();
        let lock_until = now
            .checked_add_signed(chrono::Duration::from_std(lock_lifetime).map_err(|_| {
                Error::InvalidArgument("lock lifetime is out of range".into())
            })?)
            .ok_or_else(|| Error::InvalidArgument("lock lifetime is out of range".into()))?;

        let filter = doc! {
            "nextRunAt": { "$ne": null, "$lte": bson::DateTime::from_chrono(window_end) },
            "$or": [
                { "lockUntil": null },
                { "lockUntil": { "$lte": bson::DateTime::from_chrono(now) } },
            ],
        };
        let update = doc! {
            "$set": {
                "lockedAt": bson::DateTime::from_chrono(now),
                "lockUntil": bson::DateTime::from_chrono(lock_until),
                "lockedBy": worker_id,
            },
        };

        let mut claimed = Vec::with_capacity(batch_size.min(64));
        for _ in 0..batch_size {
            let job = self
                .collection
                .find_one_and_update(filter.clone(), update.clone())
                .sort(doc! { "nextRunAt": 1, "priority": -1 })
                .return_document(ReturnDocument::After)
                .await?;
            match job {
                Some(job) => claimed.push(job),
                None => break,
            }
        }

        trace!(claimed = claimed.len(), %window_end, "Claimed due jobs");
        Ok(claimed)
    }

    /// Record a successful run, clearing lock and failure state.
    ///
    /// The update is guarded on `lockedBy = worker_id` so a worker whose
    /// lease was already stolen cannot write back stale state. Returns false
    /// when the lease was no longer held.
    pub async fn mark_success(
        &self,
        id: ObjectId,
        worker_id: &str,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<bool, Error> {
        let filter = doc! { "_id": id, "lockedBy": worker_id };

        let mut set = doc! {
            "lastRunAt": bson::DateTime::from_chrono(started_at),
            "lastFinishedAt": bson::DateTime::from_chrono(finished_at),
            "failCount": 0,
        };
        let mut unset = doc! {
            "lockedAt": "",
            "lockUntil": "",
            "lockedBy": "",
            "failedAt": "",
        };
        match next_run_at {
            Some(at) => {
                set.insert("nextRunAt", bson::DateTime::from_chrono(at));
            }
            None => {
                unset.insert("nextRunAt", "");
            }
        }

        let result = self
            .collection
            .update_one(filter, doc! { "$set": set, "$unset": unset })
            .await?;
        Ok(result.modified_count > 0)
    }

    /// Record a failed run: bump `failCount`, stamp `failedAt`, release the
    /// lock, and set or clear the retry time. Same lease guard and return
    /// convention as [`mark_success`](Self::mark_success).
    pub async fn mark_failure(
        &self,
        id: ObjectId,
        worker_id: &str,
        failed_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<bool, Error> {
        let filter = doc! { "_id": id, "lockedBy": worker_id };

        let mut set = doc! {
            "failedAt": bson::DateTime::from_chrono(failed_at),
        };
        let mut unset = doc! {
            "lockedAt": "",
            "lockUntil": "",
            "lockedBy": "",
        };
        match next_run_at {
            Some(at) => {
                set.insert("nextRunAt", bson::DateTime::from_chrono(at));
            }
            None => {
                unset.insert("nextRunAt", "");
            }
        }

        let result = self
            .collection
            .update_one(
                filter,
                doc! { "$inc": { "failCount": 1 }, "$set": set, "$unset": unset },
            )
            .await?;
        Ok(result.modified_count > 0)
    }

    /// Disable (cancel) jobs matched by `query`: keep the documents but clear
    /// scheduling and lock fields so they will not run. Returns the modified
    /// count.
    pub async fn disable_by_query(&self, query: &CancelQuery, limit: u32) -> Result<u64, Error> {
        let ids = self.select_ids(query, limit).await?;
        if ids.is_empty() {
            return Ok(0);
        }
        let result = self
            .collection
            .update_many(doc! { "_id": { "$in": ids } }, disable_update())
            .await?;
        Ok(result.modified_count)
    }

    /// Hard-delete jobs matched by `query`. Returns the deleted count.
    pub async fn delete_by_query(&self, query: &CancelQuery, limit: u32) -> Result<u64, Error> {
        let ids = self.select_ids(query, limit).await?;
        if ids.is_empty() {
            return Ok(0);
        }
        let result = self
            .collection
            .delete_many(doc! { "_id": { "$in": ids } })
            .await?;
        Ok(result.deleted_count)
    }

    /// Find the SINGLE job with this name.
    pub async fn find_single_by_name(&self, name: &str) -> Result<Option<ScheduledJob>, Error> {
        let job = self
            .collection
            .find_one(doc! { "name": name, "type": JobType::Single.as_str() })
            .await?;
        Ok(job)
    }

    /// Find the NORMAL job with this `(name, uniqueKey)` pair.
    pub async fn find_normal_by_name_and_unique_key(
        &self,
        name: &str,
        unique_key: &str,
    ) -> Result<Option<ScheduledJob>, Error> {
        let job = self
            .collection
            .find_one(doc! {
                "name": name,
                "type": JobType::Normal.as_str(),
                "uniqueKey": unique_key,
            })
            .await?;
        Ok(job)
    }

    /// Hard-delete a job by document id. Returns the deleted count (0 or 1).
    pub async fn delete_by_id(&self, id: ObjectId) -> Result<u64, Error> {
        let result = self.collection.delete_one(doc! { "_id": id }).await?;
        Ok(result.deleted_count)
    }

    /// Disable the SINGLE job with this name.
    pub async fn disable_single_by_name(&self, name: &str) -> Result<u64, Error> {
        let result = self
            .collection
            .update_many(
                doc! { "name": name, "type": JobType::Single.as_str() },
                disable_update(),
            )
            .await?;
        Ok(result.modified_count)
    }

    /// Hard-delete the SINGLE job with this name.
    pub async fn delete_single_by_name(&self, name: &str) -> Result<u64, Error> {
        let result = self
            .collection
            .delete_many(doc! { "name": name, "type": JobType::Single.as_str() })
            .await?;
        Ok(result.deleted_count)
    }

    /// Disable the NORMAL job with this `(name, uniqueKey)` pair.
    pub async fn disable_normal_by_name_and_unique_key(
        &self,
        name: &str,
        unique_key: &str,
    ) -> Result<u64, Error> {
        require_pair(name, unique_key)?;
        let result = self
            .collection
            .update_many(
                doc! {
                    "name": name,
                    "type": JobType::Normal.as_str(),
                    "uniqueKey": unique_key,
                },
                disable_update(),
            )
            .await?;
        Ok(result.modified_count)
    }

    /// Hard-delete the NORMAL job with this `(name, uniqueKey)` pair.
    pub async fn delete_normal_by_name_and_unique_key(
        &self,
        name: &str,
        unique_key: &str,
    ) -> Result<u64, Error> {
        require_pair(name, unique_key)?;
        let result = self
            .collection
            .delete_many(doc! {
                "name": name,
                "type": JobType::Normal.as_str(),
                "uniqueKey": unique_key,
            })
            .await?;
        Ok(result.deleted_count)
    }

    /// Convert a spec into a fresh document ready for insertion.
    pub fn to_document<T: Serialize>(&self, spec: &JobSpec<T>) -> Result<ScheduledJob, Error> {
        Ok(ScheduledJob {
            id: ObjectId::new(),
            name: spec.name.clone(),
            unique_key: spec.unique_key.clone(),
            unique: spec.unique.clone(),
            job_type: spec.job_type,
            next_run_at: spec.next_run_at.map(bson::DateTime::from_chrono),
            repeat_interval: spec.repeat_interval.clone(),
            repeat_timezone: spec.repeat_timezone.clone(),
            locked_at: None,
            lock_until: None,
            locked_by: None,
            last_run_at: None,
            last_finished_at: None,
            fail_count: 0,
            failed_at: None,
            priority: spec.priority,
            data: spec
                .data
                .as_ref()
                .map(bson::to_document)
                .transpose()?,
        })
    }

    /// Reverse of [`to_document`](Self::to_document): convert a persisted
    /// document back into a spec, decoding the stored payload map into `T`.
    pub fn to_spec<T: DeserializeOwned>(&self, document: &ScheduledJob) -> Result<JobSpec<T>, Error> {
        Ok(JobSpec {
            name: document.name.clone(),
            unique_key: document.unique_key.clone(),
            unique: document.unique.clone(),
            job_type: document.job_type,
            next_run_at: document.next_run_at.map(|at| at.to_chrono()),
            repeat_interval: document.repeat_interval.clone(),
            repeat_timezone: document.repeat_timezone.clone(),
            priority: document.priority,
            data: document
                .data
                .clone()
                .map(bson::from_document)
                .transpose()?,
        })
    }

    /// Select up to `limit` matching ids, earliest `nextRunAt` first, higher
    /// priority first among ties.
    async fn select_ids(&self, query: &CancelQuery, limit: u32) -> Result<Vec<ObjectId>, Error> {
        if limit == 0 {
            return Err(Error::InvalidArgument(
                "cancel limit must be a positive number".into(),
            ));
        }
        let filter = cancel_filter(query)?;

        let mut cursor = self
            .collection
            .clone_with_type::<Document>()
            .find(filter)
            .sort(doc! { "nextRunAt": 1, "priority": -1 })
            .limit(i64::from(limit))
            .projection(doc! { "_id": 1 })
            .await?;

        let mut ids = Vec::new();
        while let Some(document) = cursor.try_next().await? {
            if let Ok(id) = document.get_object_id("_id") {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}

/// The `$set`/`$unset` document applied by an upsert-style save.
fn upsert_update<T: Serialize>(spec: &JobSpec<T>) -> Result<Document, Error> {
    let mut set = doc! {
        "name": &spec.name,
        "type": spec.job_type.as_str(),
        "priority": spec.priority,
        // always written so the claim filter sees a consistent shape
        "nextRunAt": spec
            .next_run_at
            .map(|at| Bson::DateTime(bson::DateTime::from_chrono(at)))
            .unwrap_or(Bson::Null),
    };
    let mut unset = Document::new();

    match non_blank(spec.unique_key.as_deref()) {
        Some(unique_key) => {
            set.insert("uniqueKey", unique_key);
        }
        None => {
            unset.insert("uniqueKey", "");
        }
    }

    match spec.unique.as_ref().filter(|unique| !unique.is_empty()) {
        Some(unique) => {
            set.insert("unique", unique.clone());
        }
        None => {
            unset.insert("unique", "");
        }
    }

    match non_blank(spec.repeat_interval.as_deref()) {
        Some(repeat_interval) => {
            set.insert("repeatInterval", repeat_interval);
        }
        None => {
            unset.insert("repeatInterval", "");
        }
    }

    match non_blank(spec.repeat_timezone.as_deref()) {
        Some(repeat_timezone) => {
            set.insert("repeatTimezone", repeat_timezone);
        }
        None => {
            unset.insert("repeatTimezone", "");
        }
    }

    match spec.data.as_ref() {
        Some(data) => {
            set.insert("data", bson::to_document(data)?);
        }
        None => {
            unset.insert("data", "");
        }
    }

    Ok(doc! { "$set": set, "$unset": unset })
}

/// Clears scheduling and lock fields without touching execution history.
fn disable_update() -> Document {
    doc! {
        "$unset": {
            "nextRunAt": "",
            "repeatInterval": "",
            "repeatTimezone": "",
            "lockedAt": "",
            "lockUntil": "",
            "lockedBy": "",
        },
    }
}

/// Translate a [`CancelQuery`] into a collection filter.
fn cancel_filter(query: &CancelQuery) -> Result<Document, Error> {
    if query.is_empty() {
        return Err(Error::InvalidArgument(
            "cancel query must include at least one selector".into(),
        ));
    }

    let mut filter = Document::new();
    if let Some(name) = query.name() {
        filter.insert("name", name);
    }
    if let Some(unique_key) = query.unique_key() {
        filter.insert("uniqueKey", unique_key);
    }
    for (key, value) in query.unique() {
        filter.insert(format!("unique.{key}"), value.clone());
    }
    Ok(filter)
}

fn is_blank(value: Option<&str>) -> bool {
    value.is_none_or(|s| s.trim().is_empty())
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|s| !s.trim().is_empty())
}

fn require_pair(name: &str, unique_key: &str) -> Result<(), Error> {
    if name.trim().is_empty() {
        return Err(Error::InvalidArgument("name must not be blank".into()));
    }
    if unique_key.trim().is_empty() {
        return Err(Error::InvalidArgument(
            "unique key must not be blank".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use claims::{assert_err, assert_none, assert_some};

    fn spec_with_everything() -> JobSpec<Document> {
        JobSpec {
            name: "sub-to-channel".into(),
            unique_key: Some("chan-1".into()),
            unique: Some(doc! { "guildId": "g-1" }),
            job_type: JobType::Normal,
            next_run_at: Some("2026-01-01T00:00:00Z".parse().unwrap()),
            repeat_interval: Some("*/5 * * * *".into()),
            repeat_timezone: Some("Asia/Taipei".into()),
            priority: 10,
            data: Some(doc! { "channel": "news" }),
        }
    }

    #[test]
    fn upsert_update_sets_present_and_unsets_absent_fields() {
        let update = upsert_update(&spec_with_everything()).unwrap();
        let set = update.get_document("$set").unwrap();
        assert_eq!(set.get_str("name").unwrap(), "sub-to-channel");
        assert_eq!(set.get_str("type").unwrap(), "NORMAL");
        assert_eq!(set.get_str("uniqueKey").unwrap(), "chan-1");
        assert_eq!(set.get_document("unique").unwrap(), &doc! { "guildId": "g-1" });
        assert_eq!(set.get_str("repeatInterval").unwrap(), "*/5 * * * *");
        assert_some!(set.get("nextRunAt"));
        let unset = update.get_document("$unset").unwrap();
        assert!(unset.is_empty());

        let mut bare = spec_with_everything();
        bare.unique_key = None;
        bare.unique = None;
        bare.repeat_interval = Some("  ".into());
        bare.repeat_timezone = None;
        bare.data = None;
        bare.next_run_at = None;
        let update = upsert_update(&bare).unwrap();
        let set = update.get_document("$set").unwrap();
        assert_eq!(set.get("nextRunAt"), Some(&Bson::Null));
        let unset = update.get_document("$unset").unwrap();
        for field in ["uniqueKey", "unique", "repeatInterval", "repeatTimezone", "data"] {
            assert_some!(unset.get(field), "expected $unset to cover {field}");
        }
    }

    #[test]
    fn document_spec_round_trip() {
        let spec = spec_with_everything();
        let store = detached_store();
        let document = store.to_document(&spec).unwrap();
        let restored: JobSpec<Document> = store.to_spec(&document).unwrap();

        assert_eq!(restored.name, spec.name);
        assert_eq!(restored.unique_key, spec.unique_key);
        assert_eq!(restored.unique, spec.unique);
        assert_eq!(restored.job_type, spec.job_type);
        assert_eq!(restored.next_run_at, spec.next_run_at);
        assert_eq!(restored.repeat_interval, spec.repeat_interval);
        assert_eq!(restored.repeat_timezone, spec.repeat_timezone);
        assert_eq!(restored.priority, spec.priority);
        assert_eq!(restored.data, spec.data);
    }

    #[test]
    fn fresh_documents_start_unlocked_and_unfailed() {
        let document = detached_store().to_document(&spec_with_everything()).unwrap();
        assert_none!(document.locked_by);
        assert_none!(document.lock_until);
        assert_none!(document.failed_at);
        assert_eq!(document.fail_count, 0);
    }

    #[test]
    fn cancel_filter_translates_selectors() {
        let query = CancelQuery::builder()
            .name("cleanup")
            .unique_key("k-1")
            .put("guildId", "g-1")
            .build();
        let filter = cancel_filter(&query).unwrap();
        assert_eq!(
            filter,
            doc! { "name": "cleanup", "uniqueKey": "k-1", "unique.guildId": "g-1" }
        );
    }

    #[test]
    fn cancel_filter_rejects_empty_query() {
        assert_err!(cancel_filter(&CancelQuery::builder().build()));
    }

    #[test]
    fn disable_update_clears_scheduling_and_lock_fields() {
        let unset = disable_update().get_document("$unset").unwrap().clone();
        for field in [
            "nextRunAt",
            "repeatInterval",
            "repeatTimezone",
            "lockedAt",
            "lockUntil",
            "lockedBy",
        ] {
            assert_some!(unset.get(field), "expected $unset to cover {field}");
        }
        assert_none!(unset.get("failCount"));
    }

    /// The driver connects lazily, so a store over an unconnected client is
    /// fine for exercising the pure conversions.
    fn test_runtime() -> &'static tokio::runtime::Runtime {
        static RT: std::sync::OnceLock<tokio::runtime::Runtime> = std::sync::OnceLock::new();
        RT.get_or_init(|| tokio::runtime::Runtime::new().unwrap())
    }

    fn detached_store() -> JobStore {
        let _enter = test_runtime().enter();
        let options = mongodb::options::ClientOptions::builder()
            .hosts(vec![mongodb::options::ServerAddress::Tcp {
                host: "localhost".into(),
                port: Some(27017),
            }])
            .build();
        let client = mongodb::Client::with_options(options).unwrap();
        JobStore::new(&client.database("rota_test"))
    }
}
