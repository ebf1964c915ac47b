//! Persisted document model and index definitions.
//!
//! The scheduler does **not** create indexes at startup unless
//! `ensure-indexes-on-startup` is set; in production they are usually
//! managed by migrations or ops tooling. The definitions here document what
//! the store relies on and provide an explicit [`ensure_indexes`] entrypoint.
//!
//! Required indexes on `scheduled_jobs`:
//!
//! | name | keys | properties |
//! |---|---|---|
//! | `idx_due_claim` | `nextRunAt: 1, lockUntil: 1, priority: -1` | supports the claim scan |
//! | `idx_name_uniqueKey` | `name: 1, uniqueKey: 1` | supports NORMAL upsert/lookup |
//! | `ux_single_name` | `name: 1` | unique, partial filter `{ type: "SINGLE" }` |

use mongodb::bson::oid::ObjectId;
use mongodb::bson::{DateTime, Document, doc};
use mongodb::options::IndexOptions;
use mongodb::{Database, IndexModel};
use serde::{Deserialize, Serialize};

use crate::errors::Error;
use crate::spec::JobType;

/// Collection holding all scheduled jobs.
pub const COLLECTION: &str = "scheduled_jobs";

/// Name of the claim-scan index.
pub const IDX_DUE_CLAIM: &str = "idx_due_claim";
/// Name of the `(name, uniqueKey)` lookup index.
pub const IDX_NAME_UNIQUE_KEY: &str = "idx_name_uniqueKey";
/// Name of the unique partial index enforcing the SINGLE invariant.
pub const UX_SINGLE_NAME: &str = "ux_single_name";

/// A scheduled job as persisted in the `scheduled_jobs` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledJob {
    /// Store-assigned id.
    #[serde(rename = "_id")]
    pub id: ObjectId,
    /// Handler name.
    pub name: String,
    /// Deduplication key for NORMAL jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_key: Option<String>,
    /// Nested selector map, queried as `unique.<key>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique: Option<Document>,
    /// SINGLE or NORMAL.
    #[serde(rename = "type")]
    pub job_type: JobType,
    /// Next due time; always written, null when the job is not scheduled.
    #[serde(default)]
    pub next_run_at: Option<DateTime>,
    /// Schedule expression evaluated after each successful run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_interval: Option<String>,
    /// IANA zone id for calendar-based schedules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_timezone: Option<String>,
    /// When the current lease was taken; absent while unlocked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime>,
    /// When the current lease expires; absent while unlocked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_until: Option<DateTime>,
    /// Lease owner; absent while unlocked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<String>,
    /// Start of the most recent execution attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime>,
    /// End of the most recent execution attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_finished_at: Option<DateTime>,
    /// Consecutive failures; reset to 0 on success.
    #[serde(default)]
    pub fail_count: i32,
    /// Most recent failure instant; cleared on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime>,
    /// Signed priority; higher runs first among simultaneously-due jobs.
    #[serde(default)]
    pub priority: i32,
    /// Payload as a generic key/value map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Document>,
}

/// Index for polling and claiming due jobs.
pub fn due_claim_index() -> IndexModel {
    IndexModel::builder()
        .keys(doc! { "nextRunAt": 1, "lockUntil": 1, "priority": -1 })
        .options(
            IndexOptions::builder()
                .name(IDX_DUE_CLAIM.to_string())
                .build(),
        )
        .build()
}

/// Index for NORMAL job lookup and cancellation by `(name, uniqueKey)`.
pub fn name_unique_key_index() -> IndexModel {
    IndexModel::builder()
        .keys(doc! { "name": 1, "uniqueKey": 1 })
        .options(
            IndexOptions::builder()
                .name(IDX_NAME_UNIQUE_KEY.to_string())
                .build(),
        )
        .build()
}

/// Unique partial index enforcing one SINGLE document per name.
pub fn single_name_unique_index() -> IndexModel {
    IndexModel::builder()
        .keys(doc! { "name": 1 })
        .options(
            IndexOptions::builder()
                .name(UX_SINGLE_NAME.to_string())
                .unique(true)
                .partial_filter_expression(doc! { "type": JobType::Single.as_str() })
                .build(),
        )
        .build()
}

/// Build a deployment-specific unique index over nested `unique.<key>` fields.
///
/// MongoDB indexes need a fixed key set, so create one index per key
/// combination you rely on for deduplication.
pub fn custom_unique_index(
    index_name: &str,
    unique_keys: &[&str],
    partial_filter: Option<Document>,
) -> Result<IndexModel, Error> {
    if unique_keys.is_empty() {
        return Err(Error::InvalidArgument(
            "unique index needs at least one key".into(),
        ));
    }

    let mut keys = Document::new();
    for key in unique_keys {
        if key.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "unique index keys must not be blank".into(),
            ));
        }
        keys.insert(format!("unique.{key}"), 1);
    }

    let options = IndexOptions::builder()
        .name(index_name.to_string())
        .unique(true)
        .partial_filter_expression(partial_filter)
        .build();

    Ok(IndexModel::builder().keys(keys).options(options).build())
}

/// Create the three required indexes on `scheduled_jobs`.
pub async fn ensure_indexes(database: &Database) -> Result<(), Error> {
    let collection = database.collection::<ScheduledJob>(COLLECTION);
    collection
        .create_indexes(vec![
            due_claim_index(),
            name_unique_key_index(),
            single_name_unique_index(),
        ])
        .await?;
    Ok(())
}
