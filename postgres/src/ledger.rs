use sqlx::PgPool;
use sqlx::prelude::FromRow;

/// A row of `sync.delivery_ledger`.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct LedgerRow {
    pub entity: String,
    pub record_id: i64,
    pub delivered: bool,
    pub attempts: i32,
    pub last_error: Option<String>,
}

/// Marks every record of a delivered batch in a single transaction.
pub async fn mark_delivered(pool: &PgPool, entity: &str, record_ids: &[i64]) -> sqlx::Result<()> {
    if record_ids.is_empty() {
        return Ok(());
    }

    let mut tx = pool.begin().await?;

    for record_id in record_ids {
        sqlx::query(
            r#"
            insert into sync.delivery_ledger (entity, record_id, delivered, last_error, updated_at)
            values ($1, $2, true, null, now())
            on conflict (entity, record_id) do update
            set delivered = true,
                last_error = null,
                updated_at = now()
            "#,
        )
        .bind(entity)
        .bind(record_id)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    Ok(())
}

/// Increments the attempt counter of a record and stores its last error.
///
/// Returns the attempt count after the increment.
pub async fn record_failure(
    pool: &PgPool,
    entity: &str,
    record_id: i64,
    error: &str,
) -> sqlx::Result<i32> {
    let attempts: i32 = sqlx::query_scalar(
        r#"
        insert into sync.delivery_ledger (entity, record_id, delivered, attempts, last_error, updated_at)
        values ($1, $2, false, 1, $3, now())
        on conflict (entity, record_id) do update
        set attempts = sync.delivery_ledger.attempts + 1,
            last_error = excluded.last_error,
            updated_at = now()
        returning attempts
        "#,
    )
    .bind(entity)
    .bind(record_id)
    .bind(error)
    .fetch_one(pool)
    .await?;

    Ok(attempts)
}

/// Reads the ledger row of a record.
pub async fn get_ledger_row(
    pool: &PgPool,
    entity: &str,
    record_id: i64,
) -> sqlx::Result<Option<LedgerRow>> {
    sqlx::query_as::<_, LedgerRow>(
        r#"
        select entity, record_id, delivered, attempts, last_error
        from sync.delivery_ledger
        where entity = $1 and record_id = $2
        "#,
    )
    .bind(entity)
    .bind(record_id)
    .fetch_optional(pool)
    .await
}
