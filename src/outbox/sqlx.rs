use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{Database, Pool, Postgres, Row};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_stream::StreamExt;

use crate::envelope::{EnvelopeId, Metadata};
use crate::outbox::{
    AppendRecords, Envelope, FetchPending, MarkForwarded, OutboxRecord, RelayLease,
    SubscriberOffset,
};

/// Type alias for the Postgres outbox.
pub type PgSqlxOutbox = SqlxOutbox<Postgres>;

/// Advisory lock key guarding the relay lease of the `outbox` table.
const RELAY_LEASE_KEY: i64 = 0x6f75_7462_6f78;

/// SQLx-based outbox driver.
///
/// Records live in the `outbox` table, relay offsets in `outbox_offsets`.
/// The relay lease is a session-level advisory lock held on a dedicated
/// connection for as long as the lease is owned.
pub struct SqlxOutbox<DB>
where
    DB: Database,
{
    pool: Pool<DB>,
    lease: Arc<Mutex<Option<Lease<DB>>>>,
}

struct Lease<DB: Database> {
    holder: String,
    connection: PoolConnection<DB>,
}

impl<DB> Clone for SqlxOutbox<DB>
where
    DB: Database,
{
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            lease: Arc::clone(&self.lease),
        }
    }
}

impl<DB> SqlxOutbox<DB>
where
    DB: Database,
{
    /// Creates a new outbox over a SQLx pool without touching the schema.
    pub fn new_uninitialized(pool: Pool<DB>) -> Self {
        Self {
            pool,
            lease: Arc::new(Mutex::new(None)),
        }
    }

    pub fn pool(&self) -> &Pool<DB> {
        &self.pool
    }
}

impl SqlxOutbox<Postgres> {
    /// Creates a new Postgres outbox and ensures its tables exist.
    #[tracing::instrument(skip_all)]
    pub async fn try_new(pool: sqlx::PgPool) -> Result<Self, Error> {
        create_tables(&pool).await?;
        Ok(Self::new_uninitialized(pool))
    }
}

/// SQLx `AppendRecords` implementation.
///
/// Positions come from the `BIGSERIAL` sequence; each row also stores the id
/// of the inserting transaction so the relay can skip rows of transactions
/// that are still in flight.
#[async_trait]
impl AppendRecords for SqlxOutbox<Postgres> {
    type Error = Error;
    type Transaction<'a> = sqlx::PgTransaction<'a>;

    #[tracing::instrument(skip_all, fields(records = envelopes.len()))]
    async fn append_records(
        &self,
        envelopes: Vec<Envelope>,
        tx: &mut Self::Transaction<'_>,
    ) -> Result<(), Self::Error> {
        for envelope in envelopes {
            let metadata = serde_json::to_value(envelope.metadata())?;

            sqlx::query(
                r#"
                INSERT INTO outbox (envelope_id, topic, payload, metadata)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(*envelope.id().as_uuid())
            .bind(envelope.topic())
            .bind(envelope.payload())
            .bind(metadata)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }
}

/// Fetches committed, unforwarded records.
///
/// Rows written by transactions newer than the oldest running transaction are
/// excluded: an earlier position may still be inserted by such a transaction,
/// and forwarding past it would break ordering.
#[async_trait]
impl FetchPending for SqlxOutbox<Postgres> {
    type Error = Error;

    #[tracing::instrument(skip_all)]
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>, Self::Error> {
        let mut rows = sqlx::query(
            "SELECT position, envelope_id, topic, payload, metadata, forwarded, forwarded_at
             FROM outbox
             WHERE forwarded = FALSE
               AND transaction_id < pg_snapshot_xmin(pg_current_snapshot())
             ORDER BY transaction_id, position
             LIMIT $1",
        )
        .bind(limit as i64)
        .fetch(&self.pool);

        let mut out = Vec::new();

        while let Some(row) = rows.try_next().await? {
            let id: uuid::Uuid = row.try_get("envelope_id")?;
            let topic: String = row.try_get("topic")?;
            let payload: Vec<u8> = row.try_get("payload")?;
            let metadata_json: serde_json::Value = row.try_get("metadata")?;
            let metadata: Metadata = serde_json::from_value(metadata_json)?;

            out.push(OutboxRecord {
                position: row.try_get("position")?,
                envelope: Envelope::from_parts(EnvelopeId::from(id), topic, payload, metadata),
                forwarded: row.try_get("forwarded")?,
                forwarded_at: row.try_get("forwarded_at")?,
            });
        }

        Ok(out)
    }
}

#[async_trait]
impl MarkForwarded for SqlxOutbox<Postgres> {
    type Error = Error;

    #[tracing::instrument(skip_all, fields(position = record.position()))]
    async fn mark_forwarded(
        &self,
        subscriber: &str,
        record: &OutboxRecord,
    ) -> Result<(), Self::Error> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE outbox SET forwarded = TRUE, forwarded_at = NOW()
            WHERE position = $1 AND envelope_id = $2
            "#,
        )
        .bind(record.position())
        .bind(*record.envelope().id().as_uuid())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(Error::not_found(record.position()));
        }

        sqlx::query(
            "INSERT INTO outbox_offsets (subscriber_name, last_position) VALUES ($1, $2)
             ON CONFLICT (subscriber_name) DO UPDATE
             SET last_position = GREATEST(outbox_offsets.last_position, EXCLUDED.last_position),
                 updated_at = NOW()",
        )
        .bind(subscriber)
        .bind(record.position())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn last_forwarded(
        &self,
        subscriber: &str,
    ) -> Result<Option<SubscriberOffset>, Self::Error> {
        let last_position: Option<i64> = sqlx::query_scalar(
            "SELECT last_position FROM outbox_offsets WHERE subscriber_name = $1",
        )
        .bind(subscriber)
        .fetch_optional(&self.pool)
        .await?;

        Ok(last_position.map(|last_position| SubscriberOffset {
            subscriber_name: subscriber.to_owned(),
            last_position,
        }))
    }
}

#[async_trait]
impl RelayLease for SqlxOutbox<Postgres> {
    type Error = Error;

    #[tracing::instrument(skip(self))]
    async fn try_acquire_lease(&self, holder: &str) -> Result<bool, Self::Error> {
        let mut lease = self.lease.lock().await;
        if let Some(current) = lease.as_ref() {
            return Ok(current.holder == holder);
        }

        let mut connection = self.pool.acquire().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(RELAY_LEASE_KEY)
            .fetch_one(&mut *connection)
            .await?;

        if acquired {
            *lease = Some(Lease {
                holder: holder.to_owned(),
                connection,
            });
        }
        Ok(acquired)
    }

    #[tracing::instrument(skip(self))]
    async fn release_lease(&self, holder: &str) -> Result<(), Self::Error> {
        let mut lease = self.lease.lock().await;
        if lease.as_ref().is_some_and(|current| current.holder == holder) {
            if let Some(mut current) = lease.take() {
                sqlx::query("SELECT pg_advisory_unlock($1)")
                    .bind(RELAY_LEASE_KEY)
                    .execute(&mut *current.connection)
                    .await?;
            }
        }
        Ok(())
    }
}

/// Ensures the outbox tables exist.
async fn create_tables(pool: &sqlx::PgPool) -> Result<(), Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS outbox (
            position BIGSERIAL PRIMARY KEY,
            transaction_id XID8 NOT NULL DEFAULT pg_current_xact_id(),
            envelope_id UUID NOT NULL UNIQUE,
            topic TEXT NOT NULL,
            payload BYTEA NOT NULL,
            metadata JSONB NOT NULL,
            forwarded BOOL NOT NULL DEFAULT FALSE,
            forwarded_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS outbox_offsets (
            subscriber_name TEXT PRIMARY KEY,
            last_position BIGINT NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Sqlx outbox errors.
#[derive(Debug)]
pub struct Error {
    context: tracing_error::SpanTrace,
    kind: SqlxDriverErrorKind,
}

impl Error {
    fn not_found(position: i64) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: SqlxDriverErrorKind::NotFound(position),
        }
    }
}

/// Kinds of SQLx outbox errors.
#[derive(Debug)]
pub enum SqlxDriverErrorKind {
    Database(sqlx::Error),
    Serde(serde_json::Error),
    NotFound(i64),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            SqlxDriverErrorKind::Database(err) => writeln!(f, "Database error: {}", err),
            SqlxDriverErrorKind::Serde(err) => writeln!(f, "Serde error: {}", err),
            SqlxDriverErrorKind::NotFound(position) => {
                writeln!(f, "Outbox record at position {} not found", position)
            }
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            SqlxDriverErrorKind::Database(err) => Some(err),
            SqlxDriverErrorKind::Serde(err) => Some(err),
            SqlxDriverErrorKind::NotFound(_) => None,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: SqlxDriverErrorKind::Database(err),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: SqlxDriverErrorKind::Serde(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::Outbox;
    use sqlx::PgPool;

    async fn create_bookings(pool: &PgPool) {
        sqlx::query("CREATE TABLE bookings (id TEXT PRIMARY KEY)")
            .execute(pool)
            .await
            .unwrap();
    }

    async fn count(pool: &PgPool, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(pool)
            .await
            .unwrap()
    }

    #[sqlx::test(migrations = false)]
    async fn append_and_fetch_records_in_order(pool: PgPool) {
        let store = PgSqlxOutbox::try_new(pool.clone()).await.unwrap();
        let outbox = Outbox::new(store.clone());

        let first = Envelope::new("a", b"1".to_vec()).with_metadata("type", "A");
        let second = Envelope::new("b", b"2".to_vec());
        let mut tx = pool.begin().await.unwrap();
        outbox
            .append_all(&mut tx, [first.clone(), second.clone()])
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let fetched = store.fetch_pending(10).await.unwrap();
        let envelopes: Vec<_> = fetched.iter().map(|r| r.envelope().clone()).collect();
        assert_eq!(envelopes, vec![first, second]);
        assert!(fetched[0].position() < fetched[1].position());
    }

    #[sqlx::test(migrations = false)]
    async fn rollback_discards_business_row_and_record(pool: PgPool) {
        let store = PgSqlxOutbox::try_new(pool.clone()).await.unwrap();
        let outbox = Outbox::new(store.clone());
        create_bookings(&pool).await;

        let mut tx = pool.begin().await.unwrap();
        sqlx::query("INSERT INTO bookings (id) VALUES ('b-1')")
            .execute(&mut *tx)
            .await
            .unwrap();
        outbox
            .append(&mut tx, "BookingMade", Envelope::new("BookingMade", b"{}".to_vec()))
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(count(&pool, "bookings").await, 0);
        assert_eq!(count(&pool, "outbox").await, 0);
    }

    #[sqlx::test(migrations = false)]
    async fn uncommitted_records_are_invisible(pool: PgPool) {
        let store = PgSqlxOutbox::try_new(pool.clone()).await.unwrap();
        let outbox = Outbox::new(store.clone());

        let mut tx = pool.begin().await.unwrap();
        outbox
            .append(&mut tx, "a", Envelope::new("a", Vec::new()))
            .await
            .unwrap();

        assert!(store.fetch_pending(10).await.unwrap().is_empty());

        tx.commit().await.unwrap();
        assert_eq!(store.fetch_pending(10).await.unwrap().len(), 1);
    }

    #[sqlx::test(migrations = false)]
    async fn mark_forwarded_advances_offset(pool: PgPool) {
        let store = PgSqlxOutbox::try_new(pool.clone()).await.unwrap();
        let outbox = Outbox::new(store.clone());

        let mut tx = pool.begin().await.unwrap();
        outbox
            .append_all(&mut tx, [Envelope::new("a", Vec::new()), Envelope::new("b", Vec::new())])
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let pending = store.fetch_pending(10).await.unwrap();
        store.mark_forwarded("relay", &pending[0]).await.unwrap();

        let remaining = store.fetch_pending(10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].position(), pending[1].position());

        let offset = store.last_forwarded("relay").await.unwrap().unwrap();
        assert_eq!(offset.last_position, pending[0].position());
    }

    #[sqlx::test(migrations = false)]
    async fn lease_is_exclusive_across_instances(pool: PgPool) {
        let first = PgSqlxOutbox::try_new(pool.clone()).await.unwrap();
        let second = PgSqlxOutbox::new_uninitialized(pool.clone());

        assert!(first.try_acquire_lease("relay-a").await.unwrap());
        assert!(!second.try_acquire_lease("relay-b").await.unwrap());

        first.release_lease("relay-a").await.unwrap();
        assert!(second.try_acquire_lease("relay-b").await.unwrap());
    }

    #[sqlx::test(migrations = false)]
    async fn clones_do_not_share_the_lease_between_holders(pool: PgPool) {
        let store = PgSqlxOutbox::try_new(pool).await.unwrap();
        let clone = store.clone();

        assert!(store.try_acquire_lease("relay-a").await.unwrap());
        assert!(!clone.try_acquire_lease("relay-b").await.unwrap());
        assert!(clone.try_acquire_lease("relay-a").await.unwrap());
    }
}
