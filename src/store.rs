//! Durable persistence of requests, per-recipient queue rows, and the
//! singleton job row. Exposes the transactional primitives the rest of
//! the core (Request API, Expander, Dispatcher) needs; callers never issue
//! raw SQL of their own.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use crate::domain::{PartyId, Subject};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, sqlx::Type, serde::Serialize, serde::Deserialize,
)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct RequestId(i64);

impl RequestId {
    pub fn get(self) -> i64 {
        self.0
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "request_status", rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Sending,
    Sent,
    PartialFailure,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct Request {
    pub request_id: RequestId,
    pub party_from: PartyId,
    pub party_to: PartyId,
    pub expand_group: bool,
    pub subject: String,
    pub message: String,
    pub request_date: DateTime<Utc>,
    pub fulfill_date: Option<DateTime<Utc>>,
    pub status: RequestStatus,
    pub max_retries: i32,
}

/// One recipient's delivery slot, joined with its parent request's fields.
/// Deliberately carries no party data of its own: email resolution is the
/// party directory's job, kept behind its own adapter rather than a
/// raw join against whatever table happens to back it.
#[derive(Debug, Clone)]
pub struct DeliverableRow {
    pub request_id: RequestId,
    pub party_from: PartyId,
    pub party_to: PartyId,
    pub subject: String,
    pub message: String,
    pub request_date: DateTime<Utc>,
    pub max_retries: i32,
    pub retry_count: i32,
}

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert a new request, drawing its id from the `request_id_seq`
    /// allocator. Atomic: a single statement, so there is no window in
    /// which a partially-written row could be observed.
    #[tracing::instrument(name = "Insert a new request", skip(self, subject, message))]
    pub async fn insert_request(
        &self,
        party_from: PartyId,
        party_to: PartyId,
        expand_group: bool,
        subject: &Subject,
        message: &str,
        max_retries: i32,
    ) -> Result<RequestId, StoreError> {
        let record = sqlx::query!(
            r#"
            INSERT INTO requests (party_from, party_to, expand_group, subject, message, max_retries)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING request_id
            "#,
            party_from.get(),
            party_to.get(),
            expand_group,
            subject.as_ref(),
            message,
            max_retries,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(RequestId(record.request_id))
    }

    /// Force every queue row of `request_id` into a non-retryable shape and
    /// terminalize the request. Idempotent and scoped strictly to the given
    /// id: every `WHERE` clause below binds on the caller's `request_id`,
    /// never on the column of the same name.
    #[tracing::instrument(name = "Cancel a request", skip(self))]
    pub async fn cancel_request(&self, request_id: RequestId) -> Result<(), StoreError> {
        let mut transaction = self.pool.begin().await?;

        sqlx::query!(
            r#"
            UPDATE queue_entries
            SET is_successful = false,
                retry_count = (
                    SELECT max_retries + 1 FROM requests WHERE request_id = $1
                )
            WHERE request_id = $1
            "#,
            request_id.0,
        )
        .execute(transaction.as_mut())
        .await?;

        sqlx::query!(
            r#"
            UPDATE requests
            SET status = 'cancelled'
            WHERE request_id = $1
            AND status != 'cancelled'
            "#,
            request_id.0,
        )
        .execute(transaction.as_mut())
        .await?;

        transaction.commit().await?;

        Ok(())
    }

    /// All requests still in `pending`, for the Expander to consume.
    #[tracing::instrument(name = "List pending requests", skip(self))]
    pub async fn pending_requests(&self) -> Result<Vec<Request>, StoreError> {
        let rows = sqlx::query_as!(
            RequestRow,
            r#"
            SELECT
                request_id,
                party_from,
                party_to,
                expand_group,
                subject,
                message,
                request_date,
                fulfill_date,
                status AS "status: RequestStatus",
                max_retries
            FROM requests
            WHERE status = 'pending'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Request::from).collect())
    }

    #[tracing::instrument(name = "Insert queue entries for a request", skip(self, party_tos))]
    pub async fn insert_queue_entries(
        &self,
        transaction: &mut Transaction<'_, Postgres>,
        request_id: RequestId,
        party_tos: &[PartyId],
    ) -> Result<(), StoreError> {
        for party_to in party_tos {
            sqlx::query!(
                r#"
                INSERT INTO queue_entries (request_id, party_to, retry_count, is_successful)
                VALUES ($1, $2, 0, false)
                "#,
                request_id.0,
                party_to.get(),
            )
            .execute(transaction.as_mut())
            .await?;
        }

        Ok(())
    }

    /// Transition every still-`pending` request to `sending` in one set
    /// operation.
    #[tracing::instrument(name = "Mark expanded requests as sending", skip(self))]
    pub async fn mark_pending_as_sending(
        &self,
        transaction: &mut Transaction<'_, Postgres>,
    ) -> Result<(), StoreError> {
        sqlx::query!(
            r#"
            UPDATE requests
            SET status = 'sending'
            WHERE status = 'pending'
            "#,
        )
        .execute(transaction.as_mut())
        .await?;

        Ok(())
    }

    pub async fn begin(&self) -> Result<Transaction<'_, Postgres>, StoreError> {
        Ok(self.pool.begin().await?)
    }

    /// True if any request is still in a non-terminal state. Used by the
    /// dispatcher's preamble to short-circuit an otherwise-empty run.
    #[tracing::instrument(name = "Check for active requests", skip(self))]
    pub async fn has_active_requests(&self) -> Result<bool, StoreError> {
        let record = sqlx::query!(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM requests WHERE status IN ('pending', 'sending')
            ) AS "exists!"
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(record.exists)
    }

    /// The ordered, filtered scan the dispatcher streams deliveries from
    /// Ordering by `(party_from, party_to)` is what makes the
    /// coalescing state machine correct: rows sharing a sender/recipient
    /// pair are guaranteed to be contiguous. Email resolution and the
    /// "recipient has a non-null email" filter happen downstream, against
    /// the party directory — the Store has no party data of its own.
    #[tracing::instrument(name = "Scan deliverable queue rows", skip(self))]
    pub async fn deliverable_rows(&self) -> Result<Vec<DeliverableRow>, StoreError> {
        let rows = sqlx::query!(
            r#"
            SELECT
                q.request_id AS "request_id!",
                r.party_from AS "party_from!",
                q.party_to AS "party_to!",
                r.subject AS "subject!",
                r.message AS "message!",
                r.request_date AS "request_date!",
                r.max_retries AS "max_retries!",
                q.retry_count AS "retry_count!"
            FROM queue_entries q
            JOIN requests r ON r.request_id = q.request_id
            WHERE q.is_successful = false
              AND q.retry_count < r.max_retries
              AND r.status = 'sending'
            ORDER BY r.party_from, q.party_to
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| DeliverableRow {
                request_id: RequestId(row.request_id),
                party_from: PartyId::new(row.party_from),
                party_to: PartyId::new(row.party_to),
                subject: row.subject,
                message: row.message,
                request_date: row.request_date,
                max_retries: row.max_retries,
                retry_count: row.retry_count,
            })
            .collect())
    }

    /// Mark a single row a terminal success. Re-checks the retryable
    /// condition so an overlapping run can't resurrect a row another run
    /// already finished.
    #[tracing::instrument(name = "Record a per-row delivery success", skip(self))]
    pub async fn record_row_success(
        &self,
        request_id: RequestId,
        party_to: PartyId,
        reply_code: i32,
        reply_message: &str,
    ) -> Result<(), StoreError> {
        sqlx::query!(
            r#"
            UPDATE queue_entries
            SET is_successful = true,
                smtp_reply_code = $3,
                smtp_reply_message = $4
            WHERE request_id = $1 AND party_to = $2
              AND is_successful = false
            "#,
            request_id.0,
            party_to.get(),
            reply_code,
            reply_message,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record a per-row failure: bump `retry_count` and store the last
    /// reply. Never retried again once `retry_count` reaches `max_retries`
    /// (enforced by the scan's `WHERE` clause, not by this update).
    #[tracing::instrument(name = "Record a per-row delivery failure", skip(self))]
    pub async fn record_row_failure(
        &self,
        request_id: RequestId,
        party_to: PartyId,
        reply_code: Option<i32>,
        reply_message: &str,
    ) -> Result<(), StoreError> {
        sqlx::query!(
            r#"
            UPDATE queue_entries
            SET retry_count = retry_count + 1,
                smtp_reply_code = $3,
                smtp_reply_message = $4
            WHERE request_id = $1 AND party_to = $2
              AND is_successful = false
            "#,
            request_id.0,
            party_to.get(),
            reply_code,
            reply_message,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Connection-wide failure path: fold every still-retryable row of
    /// every `sending` request forward by one retry, recording the failed
    /// open's reply. Skips expansion and delivery entirely.
    #[tracing::instrument(name = "Bulk-retry rows after a connection failure", skip(self))]
    pub async fn bulk_retry_on_connection_failure(
        &self,
        reply_code: Option<i32>,
        reply_message: &str,
    ) -> Result<(), StoreError> {
        sqlx::query!(
            r#"
            UPDATE queue_entries q
            SET retry_count = q.retry_count + 1,
                smtp_reply_code = $1,
                smtp_reply_message = $2
            FROM requests r
            WHERE r.request_id = q.request_id
              AND r.status = 'sending'
              AND q.is_successful = false
              AND q.retry_count < r.max_retries
            "#,
            reply_code,
            reply_message,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Set-based reconciliation: derive each `sending` request's
    /// terminal (or still-`sending`) status from the state of its queue
    /// rows. The three updates are disjoint by construction and may run in
    /// any order; running them twice with no intervening change is a no-op.
    #[tracing::instrument(name = "Reconcile request status from queue state", skip(self))]
    pub async fn reconcile(&self) -> Result<(), StoreError> {
        sqlx::query!(
            r#"
            UPDATE requests r
            SET status = 'sent', fulfill_date = now()
            WHERE r.status = 'sending'
              AND NOT EXISTS (
                  SELECT 1 FROM queue_entries q
                  WHERE q.request_id = r.request_id AND q.is_successful = false
              )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query!(
            r#"
            UPDATE requests r
            SET status = 'failed'
            WHERE r.status = 'sending'
              AND NOT EXISTS (
                  SELECT 1 FROM queue_entries q
                  WHERE q.request_id = r.request_id
                    AND (q.is_successful = true OR q.retry_count < r.max_retries)
              )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query!(
            r#"
            UPDATE requests r
            SET status = 'partial_failure', fulfill_date = now()
            WHERE r.status = 'sending'
              AND EXISTS (
                  SELECT 1 FROM queue_entries q
                  WHERE q.request_id = r.request_id AND q.is_successful = true
              )
              AND EXISTS (
                  SELECT 1 FROM queue_entries q
                  WHERE q.request_id = r.request_id
                    AND q.is_successful = false AND q.retry_count >= r.max_retries
              )
              AND NOT EXISTS (
                  SELECT 1 FROM queue_entries q
                  WHERE q.request_id = r.request_id
                    AND q.is_successful = false AND q.retry_count < r.max_retries
              )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[tracing::instrument(name = "Touch job.last_run_date", skip(self))]
    pub async fn touch_job_last_run(&self) -> Result<(), StoreError> {
        sqlx::query!(
            r#"UPDATE job SET last_run_date = now() WHERE singleton_id = 1"#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[tracing::instrument(name = "Set job.job_id", skip(self))]
    pub async fn set_job_id(&self, job_id: Option<&str>) -> Result<(), StoreError> {
        sqlx::query!(
            r#"UPDATE job SET job_id = $1, last_run_date = NULL WHERE singleton_id = 1"#,
            job_id,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[tracing::instrument(name = "Read job.job_id", skip(self))]
    pub async fn job_id(&self) -> Result<Option<String>, StoreError> {
        let record = sqlx::query!(r#"SELECT job_id FROM job WHERE singleton_id = 1"#)
            .fetch_one(&self.pool)
            .await?;

        Ok(record.job_id)
    }

    /// Try to acquire the advisory lock guarding overlapping dispatcher
    /// runs. Non-blocking: a run that can't acquire it simply skips rather
    /// than queueing behind the in-flight one.
    ///
    /// Session-level advisory locks are bound to the backend connection
    /// that took them, not to the session/pool as a whole, so the
    /// connection that acquires the lock is pinned inside the returned
    /// [`JobLock`] and must be the same one used to release it.
    #[tracing::instrument(name = "Try to acquire the job advisory lock", skip(self))]
    pub async fn try_acquire_job_lock(&self) -> Result<Option<JobLock>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let record = sqlx::query!(r#"SELECT pg_try_advisory_lock(1) AS "acquired!""#)
            .fetch_one(&mut *conn)
            .await?;

        if record.acquired {
            Ok(Some(JobLock { conn }))
        } else {
            Ok(None)
        }
    }
}

/// Holds the single pooled connection that acquired the dispatcher's
/// advisory lock, so releasing it always runs on that same connection.
pub struct JobLock {
    conn: sqlx::pool::PoolConnection<Postgres>,
}

impl JobLock {
    #[tracing::instrument(name = "Release the job advisory lock", skip(self))]
    pub async fn release(mut self) -> Result<(), StoreError> {
        sqlx::query!(r#"SELECT pg_advisory_unlock(1)"#)
            .fetch_one(&mut *self.conn)
            .await?;

        Ok(())
    }
}

struct RequestRow {
    request_id: i64,
    party_from: i64,
    party_to: i64,
    expand_group: bool,
    subject: String,
    message: String,
    request_date: DateTime<Utc>,
    fulfill_date: Option<DateTime<Utc>>,
    status: RequestStatus,
    max_retries: i32,
}

impl From<RequestRow> for Request {
    fn from(row: RequestRow) -> Self {
        Request {
            request_id: RequestId(row.request_id),
            party_from: PartyId::new(row.party_from),
            party_to: PartyId::new(row.party_to),
            expand_group: row.expand_group,
            subject: row.subject,
            message: row.message,
            request_date: row.request_date,
            fulfill_date: row.fulfill_date,
            status: row.status,
            max_retries: row.max_retries,
        }
    }
}
