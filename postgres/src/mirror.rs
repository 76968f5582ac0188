//! SQL for mirroring rows of an external database into local tables.
//!
//! Local rows are written from JSON objects through `jsonb_populate_record`, so every value is
//! cast to the type of its target column by Postgres itself.

use chrono::NaiveDateTime;
use pg_escape::quote_identifier;
use serde_json::{Map, Value as JsonValue};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool};

use crate::source::quote_table_name;

/// Local child rows written under a parent row.
#[derive(Debug, Clone, Copy)]
pub struct DetailRows<'a> {
    pub table: &'a str,
    /// Column receiving the local id of the parent.
    pub foreign_key: &'a str,
    pub rows: &'a [Map<String, JsonValue>],
}

/// Reads up to `limit` remote rows whose `modify_time_field` is after `since`, oldest first.
pub async fn fetch_rows_modified_after(
    pool: &PgPool,
    table: &str,
    modify_time_field: &str,
    since: NaiveDateTime,
    limit: i64,
) -> sqlx::Result<Vec<PgRow>> {
    let column = quote_identifier(modify_time_field);
    let query = format!(
        r#"
        select *
        from {}
        where {column} > $1
        order by {column} asc
        limit $2
        "#,
        quote_table_name(table)
    );

    sqlx::query(&query)
        .bind(since)
        .bind(limit)
        .fetch_all(pool)
        .await
}

/// Reads every row whose `column` renders as `value`.
///
/// Values are compared as text so the caller does not need to know the column type.
pub async fn fetch_rows_matching(
    pool: &PgPool,
    table: &str,
    column: &str,
    value: &str,
) -> sqlx::Result<Vec<PgRow>> {
    let query = format!(
        r#"
        select *
        from {}
        where {}::text = $1
        "#,
        quote_table_name(table),
        quote_identifier(column)
    );

    sqlx::query(&query).bind(value).fetch_all(pool).await
}

/// Returns the lowest local `id` whose `column` renders as `value`.
pub async fn find_local_id(
    pool: &PgPool,
    table: &str,
    column: &str,
    value: &str,
) -> sqlx::Result<Option<i64>> {
    let query = format!(
        r#"
        select id::bigint
        from {}
        where {}::text = $1
        order by id asc
        limit 1
        "#,
        quote_table_name(table),
        quote_identifier(column)
    );

    sqlx::query_scalar(&query)
        .bind(value)
        .fetch_optional(pool)
        .await
}

/// Inserts a row and its details in one transaction. Returns the local id of the new row.
pub async fn insert_mirrored(
    pool: &PgPool,
    table: &str,
    row: &Map<String, JsonValue>,
    details: Option<DetailRows<'_>>,
) -> sqlx::Result<i64> {
    let mut tx = pool.begin().await?;

    let quoted_table = quote_table_name(table);
    let columns = column_list(row.keys().map(String::as_str));
    let query = if columns.is_empty() {
        format!("insert into {quoted_table} default values returning id::bigint")
    } else {
        format!(
            r#"
            insert into {quoted_table} ({columns})
            select {columns}
            from jsonb_populate_record(null::{quoted_table}, $1)
            returning id::bigint
            "#
        )
    };

    let local_id: i64 = sqlx::query_scalar(&query)
        .bind(JsonValue::Object(row.clone()))
        .fetch_one(&mut *tx)
        .await?;

    if let Some(details) = details {
        insert_details(&mut *tx, local_id, details).await?;
    }

    tx.commit().await?;

    Ok(local_id)
}

/// Overwrites a local row, replaces its details and clears the delivery ledger entry of
/// `ledger_entity` so the row is pushed again. Runs in one transaction.
pub async fn replace_mirrored(
    pool: &PgPool,
    table: &str,
    local_id: i64,
    row: &Map<String, JsonValue>,
    details: Option<DetailRows<'_>>,
    ledger_entity: Option<&str>,
) -> sqlx::Result<()> {
    let mut tx = pool.begin().await?;

    let quoted_table = quote_table_name(table);
    let assignments = row
        .keys()
        .map(|column| {
            let column = quote_identifier(column);
            format!("{column} = source.{column}")
        })
        .collect::<Vec<_>>()
        .join(", ");

    if !assignments.is_empty() {
        let query = format!(
            r#"
            update {quoted_table} as target
            set {assignments}
            from jsonb_populate_record(null::{quoted_table}, $1) as source
            where target.id = $2
            "#
        );

        sqlx::query(&query)
            .bind(JsonValue::Object(row.clone()))
            .bind(local_id)
            .execute(&mut *tx)
            .await?;
    }

    if let Some(details) = details {
        let query = format!(
            "delete from {} where {} = $1",
            quote_table_name(details.table),
            quote_identifier(details.foreign_key)
        );
        sqlx::query(&query).bind(local_id).execute(&mut *tx).await?;

        insert_details(&mut *tx, local_id, details).await?;
    }

    if let Some(entity) = ledger_entity {
        sqlx::query(
            r#"
            delete from sync.delivery_ledger
            where entity = $1 and record_id = $2
            "#,
        )
        .bind(entity)
        .bind(local_id)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    Ok(())
}

async fn insert_details(
    conn: &mut PgConnection,
    parent_id: i64,
    details: DetailRows<'_>,
) -> sqlx::Result<()> {
    if details.rows.is_empty() {
        return Ok(());
    }

    let mut names: Vec<&str> = details
        .rows
        .iter()
        .flat_map(|row| row.keys().map(String::as_str))
        .filter(|column| *column != details.foreign_key)
        .collect();
    names.sort_unstable();
    names.dedup();

    let quoted_table = quote_table_name(details.table);
    let foreign_key = quote_identifier(details.foreign_key);
    let columns = column_list(names.iter().copied());
    let (target, selected) = if columns.is_empty() {
        (foreign_key.to_string(), "$2".to_string())
    } else {
        (format!("{foreign_key}, {columns}"), format!("$2, {columns}"))
    };

    let query = format!(
        r#"
        insert into {quoted_table} ({target})
        select {selected}
        from jsonb_populate_recordset(null::{quoted_table}, $1)
        "#
    );

    let rows = details
        .rows
        .iter()
        .cloned()
        .map(JsonValue::Object)
        .collect::<Vec<_>>();

    sqlx::query(&query)
        .bind(JsonValue::Array(rows))
        .bind(parent_id)
        .execute(conn)
        .await?;

    Ok(())
}

fn column_list<'a>(columns: impl Iterator<Item = &'a str>) -> String {
    columns
        .map(|column| quote_identifier(column).into_owned())
        .collect::<Vec<_>>()
        .join(", ")
}
