use pg_escape::quote_identifier;
use sqlx::PgPool;
use sqlx::postgres::PgRow;

/// Quotes a possibly schema-qualified table name, e.g. `public.oms_order`.
pub fn quote_table_name(table: &str) -> String {
    table
        .split('.')
        .map(|part| quote_identifier(part).into_owned())
        .collect::<Vec<_>>()
        .join(".")
}

/// Reads up to `limit` rows with an `id` above `last_id`, ascending by `id`.
pub async fn fetch_rows_after(
    pool: &PgPool,
    table: &str,
    last_id: Option<i64>,
    limit: i64,
) -> sqlx::Result<Vec<PgRow>> {
    let query = format!(
        r#"
        select *
        from {}
        where $1::bigint is null or id > $1
        order by id asc
        limit $2
        "#,
        quote_table_name(table)
    );

    sqlx::query(&query)
        .bind(last_id)
        .bind(limit)
        .fetch_all(pool)
        .await
}

/// Reads up to `limit` rows the ledger has not marked delivered and whose attempt counter is
/// below `max_attempts`, ascending by `id`.
pub async fn fetch_pending_rows(
    pool: &PgPool,
    entity: &str,
    table: &str,
    max_attempts: i32,
    limit: i64,
) -> sqlx::Result<Vec<PgRow>> {
    let query = format!(
        r#"
        select t.*
        from {} t
        left join sync.delivery_ledger l
            on l.entity = $1 and l.record_id = t.id
        where coalesce(l.delivered, false) = false
          and coalesce(l.attempts, 0) < $2
        order by t.id asc
        limit $3
        "#,
        quote_table_name(table)
    );

    sqlx::query(&query)
        .bind(entity)
        .bind(max_attempts)
        .bind(limit)
        .fetch_all(pool)
        .await
}

/// Reads the child rows of a set of parents, ascending by child `id`.
pub async fn fetch_child_rows(
    pool: &PgPool,
    table: &str,
    foreign_key: &str,
    parent_ids: &[i64],
) -> sqlx::Result<Vec<PgRow>> {
    if parent_ids.is_empty() {
        return Ok(Vec::new());
    }

    let query = format!(
        r#"
        select *
        from {}
        where {} = any($1)
        order by id asc
        "#,
        quote_table_name(table),
        quote_identifier(foreign_key)
    );

    sqlx::query(&query).bind(parent_ids).fetch_all(pool).await
}
