//! Thin async wrappers around `tokio_rusqlite::Connection::call()`.
//!
//! Every DB access in the codebase should go through one of these three
//! helpers — no raw `pool.call()` in business logic.
//!
//! * [`db_call`]  — standard path, propagates errors
//! * [`db_call_or_default`] — graceful degradation (existence checks, counts)
//! * [`db_fire`]  — fire-and-forget writes where failure is non-fatal but logged

use crate::db::DbPool;
use crate::error::EngineError;

/// Standard async DB call — maps `tokio-rusqlite` errors to [`EngineError::Database`].
pub async fn db_call<T, F>(pool: &DbPool, f: F) -> Result<T, EngineError>
where
    T: Send + 'static,
    F: FnOnce(&mut rusqlite::Connection) -> Result<T, rusqlite::Error> + Send + 'static,
{
    pool.call(f).await.map_err(|e| EngineError::Database(e.to_string()))
}

/// Async DB call that returns `T::default()` on *any* failure (query error,
/// connection closed, thread panic).
pub async fn db_call_or_default<T, F>(pool: &DbPool, f: F) -> T
where
    T: Send + Default + 'static,
    F: FnOnce(&mut rusqlite::Connection) -> Result<T, rusqlite::Error> + Send + 'static,
{
    pool.call(f).await.unwrap_or_default()
}

/// Fire-and-forget DB operation — spawns a task, logs errors, never blocks the caller.
pub fn db_fire<F>(pool: &DbPool, context: &'static str, f: F)
where
    F: FnOnce(&mut rusqlite::Connection) -> Result<(), rusqlite::Error> + Send + 'static,
{
    let pool = pool.clone();
    tokio::spawn(async move {
        if let Err(e) = pool.call(f).await {
            tracing::warn!(context, error = %e, "fire-and-forget DB operation failed");
        }
    });
}
