//! Delivery Engine (spec §4.8): retry scheduling, staleness, ACK-driven
//! status transitions for outgoing direct messages. Group messages are
//! explicitly NOT covered here — see DESIGN.md Open Question #2.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use engine_protocol::DhtFacade;
use tokio::sync::Mutex as AsyncMutex;

use crate::config::{backoff_secs, EngineConfig};
use crate::db::{get_i64, get_str, timestamp_now, DbPool};
use crate::db_helpers::db_call;
use crate::error::EngineError;

pub const STATUS_PENDING: i64 = 0;
pub const STATUS_SENT: i64 = 1;
pub const STATUS_RECEIVED: i64 = 2;
pub const STATUS_FAILED: i64 = 3;

/// Outcome of one send attempt, as reported by the messaging handler's send
/// path (spec §4.8 steps 3-6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Queued to the DHT (return 0).
    Sent,
    /// The lower layer reported "duplicate on DHT" (return 1) — the engine
    /// must still advance status to `SENT` itself, since there is no
    /// message ID on that path (P6).
    Duplicate,
    /// Recipient key unavailable (return -3): do not increment retry_count,
    /// wait for the next DHT-ready event instead.
    KeyUnavailable,
    Failed,
}

pub type SendFuture = Pin<Box<dyn Future<Output = SendOutcome> + Send>>;
pub type SendFn = Arc<dyn Fn(String, String) -> SendFuture + Send + Sync>;

struct RetryCandidate {
    id: String,
    contact_fp: String,
    plaintext: String,
    created_at: i64,
    retry_count: i64,
}

pub struct DeliveryEngine {
    pool: DbPool,
    facade: Arc<dyn DhtFacade>,
    config: EngineConfig,
    retry_mutex: AsyncMutex<()>,
}

impl DeliveryEngine {
    pub fn new(pool: DbPool, facade: Arc<dyn DhtFacade>, config: EngineConfig) -> Self {
        Self { pool, facade, config, retry_mutex: AsyncMutex::new(()) }
    }

    /// One full retry pass over every `PENDING`/`SENT` direct message.
    /// Retries are globally serialized by `retry_mutex` so a DHT-reconnect
    /// trigger and a manual retry never race each other.
    pub async fn run_retry_cycle(&self, send: SendFn) -> Result<(), EngineError> {
        let _guard = self.retry_mutex.lock().await;

        if !self.facade.is_ready().await {
            return Ok(());
        }

        let candidates = self.fetch_candidates().await?;
        let now = timestamp_now() / 1000;

        for candidate in candidates {
            if now - candidate.created_at >= self.config.retry_staleness_secs {
                self.mark_status(&candidate.id, STATUS_FAILED).await?;
                continue;
            }

            let backoff = backoff_secs(
                u32::try_from(candidate.retry_count).unwrap_or(u32::MAX),
                self.config.retry_base_backoff_secs,
                self.config.retry_max_backoff_secs,
            );
            let ready_at = candidate.created_at + candidate.retry_count * i64::try_from(backoff).unwrap_or(i64::MAX);
            if now < ready_at {
                continue;
            }

            match send(candidate.contact_fp.clone(), candidate.plaintext.clone()).await {
                SendOutcome::Sent | SendOutcome::Duplicate => {
                    self.mark_status(&candidate.id, STATUS_SENT).await?;
                }
                SendOutcome::KeyUnavailable => {
                    // No retry-count bump: the next DHT-ready event re-attempts.
                }
                SendOutcome::Failed => {
                    self.increment_retry_count(&candidate.id).await?;
                }
            }
        }

        Ok(())
    }

    async fn fetch_candidates(&self) -> Result<Vec<RetryCandidate>, EngineError> {
        db_call(&self.pool, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, contact_fp, plaintext, created_at, retry_count FROM messages \
                 WHERE direction = 'outgoing' AND group_id IS NULL AND status IN (0, 1)",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(RetryCandidate {
                    id: get_str(row, "id"),
                    contact_fp: get_str(row, "contact_fp"),
                    plaintext: get_str(row, "plaintext"),
                    created_at: get_i64(row, "created_at"),
                    retry_count: get_i64(row, "retry_count"),
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>()
        })
        .await
    }

    async fn mark_status(&self, id: &str, status: i64) -> Result<(), EngineError> {
        let id = id.to_string();
        db_call(&self.pool, move |conn| {
            conn.execute("UPDATE messages SET status = ?1 WHERE id = ?2", rusqlite::params![status, id])?;
            Ok(())
        })
        .await
    }

    async fn increment_retry_count(&self, id: &str) -> Result<(), EngineError> {
        let id = id.to_string();
        db_call(&self.pool, move |conn| {
            conn.execute("UPDATE messages SET retry_count = retry_count + 1 WHERE id = ?1", [id])?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_pool;
    use engine_protocol::FakeDhtFacade;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    async fn test_pool() -> DbPool {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.sqlite");
        std::mem::forget(dir);
        create_pool(path.to_str().unwrap()).unwrap().pool
    }

    async fn insert_message(pool: &DbPool, id: &str, contact_fp: &str, created_at: i64, retry_count: i64, status: i64) {
        let id = id.to_string();
        let contact_fp = contact_fp.to_string();
        db_call(pool, move |conn| {
            conn.execute(
                "INSERT INTO messages (id, contact_fp, group_id, direction, plaintext, status, created_at, retry_count, message_type) \
                 VALUES (?1, ?2, NULL, 'outgoing', 'hi', ?3, ?4, ?5, 'text')",
                rusqlite::params![id, contact_fp, status, created_at, retry_count],
            )?;
            Ok(())
        })
        .await
        .unwrap();
    }

    async fn status_of(pool: &DbPool, id: &str) -> i64 {
        let id = id.to_string();
        db_call(pool, move |conn| {
            conn.query_row("SELECT status FROM messages WHERE id = ?1", [id], |row| row.get(0))
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn stale_message_transitions_to_failed_p5() {
        let pool = test_pool().await;
        let facade = FakeDhtFacade::new();
        let config = EngineConfig::new("/tmp/unused");
        let engine = DeliveryEngine::new(pool.clone(), facade, config);

        let now = timestamp_now() / 1000;
        insert_message(&pool, "m1", "bob", now - 31 * 24 * 3600, 0, STATUS_PENDING).await;

        let send: SendFn = Arc::new(|_, _| Box::pin(async { SendOutcome::Sent }));
        engine.run_retry_cycle(send).await.unwrap();

        assert_eq!(status_of(&pool, "m1").await, STATUS_FAILED);
    }

    #[tokio::test]
    async fn duplicate_advances_to_sent_p6() {
        let pool = test_pool().await;
        let facade = FakeDhtFacade::new();
        let config = EngineConfig::new("/tmp/unused");
        let engine = DeliveryEngine::new(pool.clone(), facade, config);

        let now = timestamp_now() / 1000;
        insert_message(&pool, "m2", "bob", now - 100, 0, STATUS_PENDING).await;

        let send: SendFn = Arc::new(|_, _| Box::pin(async { SendOutcome::Duplicate }));
        engine.run_retry_cycle(send).await.unwrap();

        assert_eq!(status_of(&pool, "m2").await, STATUS_SENT);
    }

    #[tokio::test]
    async fn key_unavailable_does_not_bump_retry_count() {
        let pool = test_pool().await;
        let facade = FakeDhtFacade::new();
        let config = EngineConfig::new("/tmp/unused");
        let engine = DeliveryEngine::new(pool.clone(), facade, config);

        let now = timestamp_now() / 1000;
        insert_message(&pool, "m3", "unknown", now - 100, 0, STATUS_PENDING).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let send: SendFn = Arc::new(move |_, _| {
            calls2.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { SendOutcome::KeyUnavailable })
        });
        engine.run_retry_cycle(send).await.unwrap();

        let retry_count: i64 = db_call(&pool, |conn| {
            conn.query_row("SELECT retry_count FROM messages WHERE id = 'm3'", [], |row| row.get(0))
        })
        .await
        .unwrap();
        assert_eq!(retry_count, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn not_ready_messages_are_skipped() {
        let pool = test_pool().await;
        let facade = FakeDhtFacade::new();
        let config = EngineConfig::new("/tmp/unused");
        let engine = DeliveryEngine::new(pool.clone(), facade, config);

        let now = timestamp_now() / 1000;
        // retry_count=1 means ready_at = created_at + 1*30s; created just now, not ready.
        insert_message(&pool, "m4", "bob", now, 1, STATUS_PENDING).await;

        let send: SendFn = Arc::new(|_, _| Box::pin(async { SendOutcome::Sent }));
        engine.run_retry_cycle(send).await.unwrap();

        assert_eq!(status_of(&pool, "m4").await, STATUS_PENDING);
    }
}
