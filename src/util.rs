use std::any::Any;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::anyhow;
use uuid::Uuid;

/// Longest worker id the store will carry.
const WORKER_ID_MAX_LEN: usize = 128;

/// Resolve the lease-owner id for this node.
///
/// A non-blank configured value wins; otherwise the id is generated as
/// `<hostname>-<pid>-<uuid>`, truncated to 128 characters.
pub(crate) fn resolve_worker_id(configured: Option<&str>) -> String {
    if let Some(id) = configured {
        let id = id.trim();
        if !id.is_empty() {
            return id.to_string();
        }
    }

    let hostname = gethostname::gethostname().to_string_lossy().into_owned();
    let hostname = if hostname.is_empty() {
        "rota".to_string()
    } else {
        hostname
    };

    let generated = format!("{hostname}-{}-{}", std::process::id(), Uuid::new_v4());
    generated.chars().take(WORKER_ID_MAX_LEN).collect()
}

/// Lock a mutex, recovering the guard if a worker panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Turn a caught panic payload into an error we can record against the job.
pub(crate) fn panic_error(payload: &(dyn Any + Send)) -> anyhow::Error {
    if let Some(message) = payload.downcast_ref::<&str>() {
        anyhow!("job panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        anyhow!("job panicked: {message}")
    } else {
        anyhow!("job panicked")
    }
}
