use thiserror::Error;

/// Errors surfaced by the scheduler, store, builder, and schedule parser.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A caller-supplied argument failed validation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A schedule expression could not be parsed in any supported form.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    /// Two handlers were registered under the same name.
    #[error("duplicate job handler name: {0}")]
    DuplicateHandler(String),

    /// A claimed job names a handler this registry does not know.
    #[error("no job handler registered for name: {0}")]
    UnknownHandler(String),

    /// The document store rejected or failed an operation.
    #[error("document store error: {0}")]
    Store(#[from] mongodb::error::Error),

    /// A job payload could not be converted into a document.
    #[error("payload serialization error: {0}")]
    SerializePayload(#[from] mongodb::bson::ser::Error),

    /// A stored payload map could not be converted into the declared shape.
    #[error("payload deserialization error: {0}")]
    DeserializePayload(#[from] mongodb::bson::de::Error),
}
