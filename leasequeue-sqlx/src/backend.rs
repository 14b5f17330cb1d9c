use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use leasequeue::{
    backend::{Backend, BackendError, EnqueuableJob, LEASE_EXPIRED_ERROR},
    job::{ClaimedJob, Job, JobId, WorkerToken},
    metrics::QueueMetrics,
    notifier::{Wake, WakeReceiver},
};
use sqlx::{Postgres, Transaction};
use tracing::instrument;
use uuid::Uuid;

use crate::{
    map_err,
    types::{ClaimedRow, JobRow, MetricsRow},
    PgJobStore, WAKE_CHANNEL,
};

/// `delta` in whole microseconds, the resolution of `timestamptz`, rounding up so a positive
/// lease never becomes an empty one.
fn micros(delta: TimeDelta) -> Result<i64, BackendError> {
    let micros = delta
        .num_microseconds()
        .ok_or_else(|| BackendError::OutOfRange(delta.to_string()))?;
    match delta > TimeDelta::microseconds(micros) {
        true => Ok(micros + 1),
        false => Ok(micros),
    }
}

impl PgJobStore {
    /// Publishes a wake from inside `tx`, Postgres only delivers it once `tx` commits.
    async fn publish_wake(
        tx: &mut Transaction<'_, Postgres>,
        queue_name: &str,
        run_at: DateTime<Utc>,
    ) -> Result<(), BackendError> {
        let wake = serde_json::to_string(&Wake {
            queue_name: queue_name.to_owned(),
            run_at,
        })?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(WAKE_CHANNEL)
            .bind(wake)
            .execute(&mut **tx)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn dead_letter_expired_final_attempts(
        tx: &mut Transaction<'_, Postgres>,
        queue_name: &str,
    ) -> sqlx::Result<u64> {
        Ok(sqlx::query(
            r#"UPDATE leasequeue_jobs
            SET
                run_at = NULL,
                reserved_until = NULL,
                reserved_by = NULL,
                last_error = $2
            WHERE id IN (
                SELECT id FROM leasequeue_jobs
                WHERE queue_name = $1
                AND run_at IS NOT NULL
                AND attempts >= max_attempts
                AND reserved_until < now()
                FOR UPDATE SKIP LOCKED
            )"#,
        )
        .bind(queue_name)
        .bind(LEASE_EXPIRED_ERROR)
        .execute(&mut **tx)
        .await?
        .rows_affected())
    }

    async fn reserve_next(
        tx: &mut Transaction<'_, Postgres>,
        queue_name: &str,
        lease_micros: i64,
        token: WorkerToken,
    ) -> sqlx::Result<Option<ClaimedRow>> {
        sqlx::query_as::<_, ClaimedRow>(
            r#"UPDATE leasequeue_jobs
            SET
                reserved_until = now() + $2::double precision * interval '1 microsecond',
                reserved_by = $3,
                attempts = attempts + 1
            WHERE id = (
                SELECT id FROM leasequeue_jobs
                WHERE queue_name = $1
                AND run_at <= now()
                AND (reserved_until IS NULL OR reserved_until < now())
                AND attempts < max_attempts
                ORDER BY run_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING
                id,
                queue_name,
                payload,
                attempts,
                max_attempts,
                reserved_until,
                reserved_by
            "#,
        )
        .bind(queue_name)
        .bind(lease_micros)
        .bind(Uuid::from(token))
        .fetch_optional(&mut **tx)
        .await
    }
}

#[async_trait]
impl Backend for PgJobStore {
    #[instrument(skip(self, job), fields(queue_name = %job.queue_name))]
    async fn enqueue(&self, job: EnqueuableJob) -> Result<JobId, BackendError> {
        let max_attempts = i32::try_from(job.max_attempts)
            .map_err(|_| BackendError::OutOfRange(format!("max_attempts {}", job.max_attempts)))?;
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let (id, run_at): (i64, DateTime<Utc>) = sqlx::query_as(
            r#"INSERT INTO leasequeue_jobs (
                queue_name,
                payload,
                run_at,
                max_attempts
            ) VALUES ($1, $2, COALESCE($3, now()), $4)
            RETURNING id, run_at
            "#,
        )
        .bind(&job.queue_name)
        .bind(&job.payload)
        .bind(job.run_at)
        .bind(max_attempts)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_err)?;
        Self::publish_wake(&mut tx, &job.queue_name, run_at).await?;
        tx.commit().await.map_err(map_err)?;
        Ok(id.into())
    }

    #[instrument(skip(self))]
    async fn claim(
        &self,
        queue_name: &str,
        lease: TimeDelta,
        token: WorkerToken,
    ) -> Result<Option<ClaimedJob>, BackendError> {
        let lease_micros = micros(lease)?;
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let reaped = Self::dead_letter_expired_final_attempts(&mut tx, queue_name)
            .await
            .map_err(map_err)?;
        if reaped > 0 {
            tracing::warn!(
                reaped,
                "Dead-lettered {reaped} jobs of queue {queue_name} whose final lease expired"
            );
        }
        let row = Self::reserve_next(&mut tx, queue_name, lease_micros, token)
            .await
            .map_err(map_err)?;
        tx.commit().await.map_err(map_err)?;
        row.map(TryFrom::try_from).transpose()
    }

    #[instrument(skip(self))]
    async fn complete(&self, id: JobId, token: WorkerToken) -> Result<bool, BackendError> {
        let deleted = sqlx::query(
            r#"DELETE FROM leasequeue_jobs
            WHERE id = $1
            AND (reserved_by = $2 OR reserved_by IS NULL)"#,
        )
        .bind(i64::from(id))
        .bind(Uuid::from(token))
        .execute(&self.pool)
        .await
        .map_err(map_err)?
        .rows_affected();
        Ok(deleted == 1)
    }

    #[instrument(skip(self, error))]
    async fn fail(
        &self,
        id: JobId,
        token: WorkerToken,
        error: &str,
        retry_delay: TimeDelta,
    ) -> Result<bool, BackendError> {
        let retry_micros = micros(retry_delay)?;
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let released: Option<(String, Option<DateTime<Utc>>)> = sqlx::query_as(
            r#"UPDATE leasequeue_jobs
            SET
                run_at = CASE
                    WHEN attempts >= max_attempts THEN NULL
                    ELSE now() + $4::double precision * interval '1 microsecond'
                END,
                reserved_until = NULL,
                reserved_by = NULL,
                last_error = $3
            WHERE id = $1
            AND reserved_by = $2
            RETURNING queue_name, run_at
            "#,
        )
        .bind(i64::from(id))
        .bind(Uuid::from(token))
        .bind(error)
        .bind(retry_micros)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_err)?;

        let Some((queue_name, run_at)) = released else {
            return Ok(false);
        };
        if let Some(run_at) = run_at {
            Self::publish_wake(&mut tx, &queue_name, run_at).await?;
        }
        tx.commit().await.map_err(map_err)?;
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn extend_lease(
        &self,
        id: JobId,
        token: WorkerToken,
        lease: TimeDelta,
    ) -> Result<Option<DateTime<Utc>>, BackendError> {
        let lease_micros = micros(lease)?;
        let extended: Option<(DateTime<Utc>,)> = sqlx::query_as(
            r#"UPDATE leasequeue_jobs
            SET reserved_until = now() + $3::double precision * interval '1 microsecond'
            WHERE id = $1
            AND reserved_by = $2
            AND NOT (attempts >= max_attempts AND reserved_until < now())
            RETURNING reserved_until
            "#,
        )
        .bind(i64::from(id))
        .bind(Uuid::from(token))
        .bind(lease_micros)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(extended.map(|(reserved_until,)| reserved_until))
    }

    #[instrument(skip(self))]
    async fn metrics(&self, queue_name: Option<&str>) -> Result<Vec<QueueMetrics>, BackendError> {
        let rows = sqlx::query_as::<_, MetricsRow>(
            r#"SELECT
                queue_name,
                count(*) FILTER (
                    WHERE (reserved_until IS NULL OR reserved_until < now())
                    AND run_at <= now()
                    AND attempts < max_attempts
                ) AS ready,
                count(*) FILTER (
                    WHERE (reserved_until IS NULL OR reserved_until < now())
                    AND run_at > now()
                    AND attempts < max_attempts
                ) AS scheduled,
                count(*) FILTER (WHERE reserved_until >= now()) AS leased,
                count(*) FILTER (
                    WHERE (reserved_until IS NULL OR reserved_until < now())
                    AND (run_at IS NULL OR attempts >= max_attempts)
                ) AS dead_lettered,
                count(*) AS total
            FROM leasequeue_jobs
            WHERE $1::text IS NULL OR queue_name = $1
            GROUP BY queue_name
            ORDER BY queue_name COLLATE "C"
            "#,
        )
        .bind(queue_name)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;

        let mut metrics: Vec<QueueMetrics> = rows.into_iter().map(From::from).collect();
        if let (Some(queue_name), true) = (queue_name, metrics.is_empty()) {
            metrics.push(QueueMetrics::empty(queue_name));
        }
        Ok(metrics)
    }

    async fn subscribe(&self, queue_name: &str) -> Result<WakeReceiver, BackendError> {
        self.notifier.subscribe(queue_name)
    }

    #[instrument(skip(self))]
    async fn get_job(&self, id: JobId) -> Result<Option<Job>, BackendError> {
        sqlx::query_as::<_, JobRow>(
            r#"SELECT
                id,
                queue_name,
                payload,
                run_at,
                reserved_until,
                reserved_by,
                attempts,
                max_attempts,
                last_error,
                created_at,
                updated_at
            FROM leasequeue_jobs
            WHERE id = $1
            "#,
        )
        .bind(i64::from(id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?
        .map(TryFrom::try_from)
        .transpose()
    }
}

#[cfg(test)]
mod micros_test {
    use super::*;

    #[test]
    fn whole_microseconds_are_kept() {
        assert_eq!(micros(TimeDelta::microseconds(500)).unwrap(), 500);
        assert_eq!(micros(TimeDelta::seconds(30)).unwrap(), 30_000_000);
        assert_eq!(micros(TimeDelta::zero()).unwrap(), 0);
    }

    #[test]
    fn sub_microsecond_remainders_round_up() {
        assert_eq!(micros(TimeDelta::nanoseconds(1)).unwrap(), 1);
        assert_eq!(micros(TimeDelta::nanoseconds(500_500)).unwrap(), 501);
    }

    #[test]
    fn overflowing_durations_are_out_of_range() {
        assert!(matches!(
            micros(TimeDelta::MAX),
            Err(BackendError::OutOfRange(_))
        ));
    }
}
