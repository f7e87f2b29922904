use anyhow::Context;
use sqlx::pool::PoolConnection;
use sqlx::Postgres;

// Advisory locks are scoped to the Postgres session, so the lock is held on a
// dedicated connection until released.
const INGEST_LOCK_KEY: i64 = 0x5354_4B52_4154; // "STKRAT"

/// Session advisory lock guarding stock rating ingestion across processes.
pub struct IngestLock {
    conn: PoolConnection<Postgres>,
}

pub async fn try_acquire_ingest_lock(pool: &sqlx::PgPool) -> anyhow::Result<Option<IngestLock>> {
    let mut conn = pool
        .acquire()
        .await
        .context("failed to acquire connection for advisory lock")?;

    let acquired: (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
        .persistent(false)
        .bind(INGEST_LOCK_KEY)
        .fetch_one(&mut *conn)
        .await
        .with_context(|| format!("failed to acquire advisory lock (key={INGEST_LOCK_KEY})"))?;

    Ok(acquired.0.then_some(IngestLock { conn }))
}

impl IngestLock {
    pub async fn release(mut self) -> anyhow::Result<()> {
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .persistent(false)
            .bind(INGEST_LOCK_KEY)
            .execute(&mut *self.conn)
            .await
            .with_context(|| format!("failed to release advisory lock (key={INGEST_LOCK_KEY})"))?;
        Ok(())
    }
}
