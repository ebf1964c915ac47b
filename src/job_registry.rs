use std::collections::HashMap;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use mongodb::bson::{self, Document};

use crate::errors::Error;
use crate::handler::JobHandler;

/// A type-erased handler invocation: decode the stored payload map into the
/// declared shape, then run.
type RunFn = Arc<dyn Fn(Option<Document>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Maps handler names to their type-erased run functions.
#[derive(Clone, Default)]
pub struct JobRegistry {
    handlers: HashMap<String, RunFn>,
}

impl JobRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its declared name.
    ///
    /// Registering two handlers with the same name is a wiring error and
    /// fails with [`Error::DuplicateHandler`].
    pub fn register<H: JobHandler>(&mut self, handler: H) -> Result<(), Error> {
        if self.handlers.contains_key(H::NAME) {
            return Err(Error::DuplicateHandler(H::NAME.to_string()));
        }

        let handler = Arc::new(handler);
        let run: RunFn = Arc::new(move |data: Option<Document>| {
            let handler = Arc::clone(&handler);
            async move {
                let payload = data
                    .map(bson::from_document::<H::Data>)
                    .transpose()
                    .map_err(|source| {
                        anyhow::anyhow!("failed to decode payload for job '{}': {source}", H::NAME)
                    })?;
                handler.execute(payload).await
            }
            .boxed()
        });

        self.handlers.insert(H::NAME.to_string(), run);
        Ok(())
    }

    /// Look up the run function for a handler name.
    pub(crate) fn get(&self, name: &str) -> Option<&RunFn> {
        self.handlers.get(name)
    }

    /// Names of all registered handlers.
    pub fn handler_names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
