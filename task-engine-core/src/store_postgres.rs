use crate::error::StoreError;
use crate::store::TransitionStore;
use crate::types::*;
use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

fn epoch_ms_to_datetime(epoch_ms: i64) -> chrono::DateTime<chrono::Utc> {
    use chrono::TimeZone;
    let secs = epoch_ms / 1000;
    let nanos = ((epoch_ms % 1000) * 1_000_000) as u32;
    chrono::Utc.timestamp_opt(secs, nanos).single().unwrap_or_else(chrono::Utc::now)
}

fn datetime_to_epoch_ms(dt: chrono::DateTime<chrono::Utc>) -> i64 {
    dt.timestamp_millis()
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// PostgreSQL-backed implementation of `TransitionStore`.
pub struct PostgresStore {
    pool: sqlx::PgPool,
}

impl PostgresStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Run embedded migrations (see `migrations/`).
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await.map_err(|e| StoreError::Backend(e.to_string()))
    }
}

#[async_trait]
impl TransitionStore for PostgresStore {
    async fn create_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        let status = serde_json::to_value(execution.status).map_err(|e| StoreError::Backend(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO executions (
                execution_id, task_id, developer_id, input, status,
                user_state, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(execution.execution_id)
        .bind(execution.task_id)
        .bind(execution.developer_id)
        .bind(&execution.input)
        .bind(&status)
        .bind(&execution.user_state)
        .bind(epoch_ms_to_datetime(execution.created_at))
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>, StoreError> {
        use sqlx::Row;
        let row = sqlx::query(
            r#"
            SELECT execution_id, task_id, developer_id, input, status, user_state,
                   created_at
            FROM executions WHERE execution_id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        let Some(row) = row else { return Ok(None) };
        let status_json: Value = row.try_get("status").map_err(backend)?;
        let status: ExecutionStatus =
            serde_json::from_value(status_json).map_err(|e| StoreError::Backend(e.to_string()))?;
        let created_at: chrono::DateTime<chrono::Utc> = row.try_get("created_at").map_err(backend)?;
        Ok(Some(Execution {
            execution_id: row.try_get("execution_id").map_err(backend)?,
            task_id: row.try_get("task_id").map_err(backend)?,
            developer_id: row.try_get("developer_id").map_err(backend)?,
            input: row.try_get("input").map_err(backend)?,
            status,
            user_state: row.try_get("user_state").map_err(backend)?,
            last_error: None,
            created_at: datetime_to_epoch_ms(created_at),
        }))
    }

    async fn update_status(&self, id: Uuid, status: ExecutionStatus) -> Result<(), StoreError> {
        let status = serde_json::to_value(status).map_err(|e| StoreError::Backend(e.to_string()))?;
        let result = sqlx::query("UPDATE executions SET status = $2 WHERE execution_id = $1")
            .bind(id)
            .bind(&status)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn update_user_state(&self, id: Uuid, state: &Value) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE executions SET user_state = $2 WHERE execution_id = $1")
            .bind(id)
            .bind(state)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn append(&self, transition: Transition) -> Result<u64, StoreError> {
        let kind = serde_json::to_value(transition.r#type).map_err(|e| StoreError::Backend(e.to_string()))?;
        let to_cursor = transition
            .to_cursor
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let from_cursor = serde_json::to_value(&transition.from_cursor).map_err(|e| StoreError::Backend(e.to_string()))?;
        let metadata = serde_json::to_value(&transition.metadata).map_err(|e| StoreError::Backend(e.to_string()))?;

        // Compare-and-set on the last-known seq, mirroring the in-memory
        // store's strict-successor check; the unique index on
        // (execution_id, seq) makes a racing writer fail here too.
        let result = sqlx::query(
            r#"
            INSERT INTO transitions (
                execution_id, seq, from_cursor, type, to_cursor, output,
                metadata, created_at
            )
            SELECT $1, $2, $3, $4, $5, $6, $7, $8
            WHERE $2 = (SELECT COALESCE(MAX(seq) + 1, 0) FROM transitions WHERE execution_id = $1)
            "#,
        )
        .bind(transition.execution_id)
        .bind(transition.seq as i64)
        .bind(&from_cursor)
        .bind(&kind)
        .bind(&to_cursor)
        .bind(&transition.output)
        .bind(&metadata)
        .bind(epoch_ms_to_datetime(transition.created_at))
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict { expected: transition.seq });
        }
        Ok(transition.seq)
    }

    async fn latest(&self, execution_id: Uuid) -> Result<Option<Transition>, StoreError> {
        let rows = self.read_range(execution_id, 0, None).await?;
        Ok(rows.into_iter().last())
    }

    async fn read_range(
        &self,
        execution_id: Uuid,
        from_seq: u64,
        to_seq: Option<u64>,
    ) -> Result<Vec<Transition>, StoreError> {
        use sqlx::Row;
        let rows = sqlx::query(
            r#"
            SELECT execution_id, seq, from_cursor, type, to_cursor, output,
                   metadata, created_at
            FROM transitions
            WHERE execution_id = $1 AND seq >= $2 AND ($3::bigint IS NULL OR seq <= $3)
            ORDER BY seq ASC
            "#,
        )
        .bind(execution_id)
        .bind(from_seq as i64)
        .bind(to_seq.map(|s| s as i64))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.into_iter()
            .map(|row| -> Result<Transition, StoreError> {
                let kind_json: Value = row.try_get("type").map_err(backend)?;
                let kind: TransitionType =
                    serde_json::from_value(kind_json).map_err(|e| StoreError::Backend(e.to_string()))?;
                let from_cursor_json: Value = row.try_get("from_cursor").map_err(backend)?;
                let from_cursor = serde_json::from_value(from_cursor_json)
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                let to_cursor_json: Option<Value> = row.try_get("to_cursor").map_err(backend)?;
                let to_cursor = to_cursor_json
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                let metadata_json: Value = row.try_get("metadata").map_err(backend)?;
                let metadata = serde_json::from_value(metadata_json)
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                let created_at: chrono::DateTime<chrono::Utc> =
                    row.try_get("created_at").map_err(backend)?;
                Ok(Transition {
                    execution_id: row.try_get("execution_id").map_err(backend)?,
                    seq: row.try_get::<i64, _>("seq").map_err(backend)? as u64,
                    from_cursor,
                    r#type: kind,
                    to_cursor,
                    output: row.try_get("output").map_err(backend)?,
                    metadata,
                    created_at: datetime_to_epoch_ms(created_at),
                })
            })
            .collect()
    }

    async fn record_last_error(
        &self,
        execution_id: Uuid,
        error: &LastErrorInput,
    ) -> Result<(), StoreError> {
        let error_json = serde_json::to_value(error).map_err(|e| StoreError::Backend(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO execution_signals (execution_id, last_error)
            VALUES ($1, $2)
            ON CONFLICT (execution_id) DO UPDATE SET last_error = EXCLUDED.last_error
            "#,
        )
        .bind(execution_id)
        .bind(&error_json)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn take_last_error(&self, execution_id: Uuid) -> Result<Option<LastErrorInput>, StoreError> {
        use sqlx::Row;
        let row = sqlx::query(
            "UPDATE execution_signals SET last_error = NULL WHERE execution_id = $1 RETURNING last_error",
        )
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        match row {
            None => Ok(None),
            Some(row) => {
                let value: Option<Value> = row.try_get("last_error").map_err(backend)?;
                value
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|e| StoreError::Backend(e.to_string()))
            }
        }
    }

    async fn request_cancel(&self, execution_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO execution_signals (execution_id, cancel_requested)
            VALUES ($1, TRUE)
            ON CONFLICT (execution_id) DO UPDATE SET cancel_requested = TRUE
            "#,
        )
        .bind(execution_id)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn is_cancel_requested(&self, execution_id: Uuid) -> Result<bool, StoreError> {
        use sqlx::Row;
        let row = sqlx::query("SELECT cancel_requested FROM execution_signals WHERE execution_id = $1")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        Ok(row.map(|r| r.try_get::<bool, _>("cancel_requested").unwrap_or(false)).unwrap_or(false))
    }

    async fn put_resume_input(&self, execution_id: Uuid, input: Value) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO execution_signals (execution_id, resume_input)
            VALUES ($1, $2)
            ON CONFLICT (execution_id) DO UPDATE SET resume_input = EXCLUDED.resume_input
            "#,
        )
        .bind(execution_id)
        .bind(&input)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn take_resume_input(&self, execution_id: Uuid) -> Result<Option<Value>, StoreError> {
        use sqlx::Row;
        let row = sqlx::query(
            "UPDATE execution_signals SET resume_input = NULL WHERE execution_id = $1 RETURNING resume_input",
        )
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        match row {
            None => Ok(None),
            Some(row) => row.try_get("resume_input").map_err(backend),
        }
    }
}
