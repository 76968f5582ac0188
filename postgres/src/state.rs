use chrono::{NaiveDate, NaiveDateTime};
use sqlx::PgPool;
use sqlx::prelude::FromRow;

/// A row of `sync.watermarks`.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct WatermarkRow {
    pub entity: String,
    pub last_id: Option<i64>,
    pub sync_date: NaiveDate,
    pub sequence_count: i32,
}

/// Reads the stored watermark of an entity, if one was ever written.
pub async fn get_watermark(pool: &PgPool, entity: &str) -> sqlx::Result<Option<WatermarkRow>> {
    let row = sqlx::query_as::<_, WatermarkRow>(
        r#"
        select entity, last_id, sync_date, sequence_count
        from sync.watermarks
        where entity = $1
        "#,
    )
    .bind(entity)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// Inserts or replaces the watermark of an entity.
///
/// `last_id` only ever grows: a lower or null value keeps the stored one, while the date and
/// sequence count are always written.
pub async fn upsert_watermark(pool: &PgPool, row: &WatermarkRow) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        insert into sync.watermarks (entity, last_id, sync_date, sequence_count, updated_at)
        values ($1, $2, $3, $4, now())
        on conflict (entity) do update
        set last_id = greatest(sync.watermarks.last_id, excluded.last_id),
            sync_date = excluded.sync_date,
            sequence_count = excluded.sequence_count,
            updated_at = now()
        "#,
    )
    .bind(&row.entity)
    .bind(row.last_id)
    .bind(row.sync_date)
    .bind(row.sequence_count)
    .execute(pool)
    .await?;

    Ok(())
}

/// Reads the modify-time cursor of a pull, if one was ever written.
pub async fn get_pull_cursor(pool: &PgPool, name: &str) -> sqlx::Result<Option<NaiveDateTime>> {
    sqlx::query_scalar(
        r#"
        select last_modified
        from sync.pull_cursors
        where name = $1
        "#,
    )
    .bind(name)
    .fetch_optional(pool)
    .await
}

/// Stores the modify-time cursor of a pull. The stored cursor never moves backwards.
pub async fn upsert_pull_cursor(
    pool: &PgPool,
    name: &str,
    last_modified: NaiveDateTime,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        insert into sync.pull_cursors (name, last_modified, updated_at)
        values ($1, $2, now())
        on conflict (name) do update
        set last_modified = greatest(sync.pull_cursors.last_modified, excluded.last_modified),
            updated_at = now()
        "#,
    )
    .bind(name)
    .bind(last_modified)
    .execute(pool)
    .await?;

    Ok(())
}
