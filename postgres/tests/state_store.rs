use chrono::{NaiveDate, NaiveDateTime};
use serde_json::{Map, Value as JsonValue, json};
use sqlx::Row;
use sqlx::postgres::PgRow;
use sync_postgres::ledger::{get_ledger_row, mark_delivered, record_failure};
use sync_postgres::mirror::{
    DetailRows, fetch_rows_matching, fetch_rows_modified_after, find_local_id, insert_mirrored,
    replace_mirrored,
};
use sync_postgres::source::{fetch_child_rows, fetch_pending_rows, fetch_rows_after};
use sync_postgres::state::{
    WatermarkRow, get_pull_cursor, get_watermark, upsert_pull_cursor, upsert_watermark,
};
use sync_postgres::test_utils::{StateDatabase, spawn_state_database};

fn day(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 6, day).unwrap()
}

fn at(hour: u32) -> NaiveDateTime {
    day(1).and_hms_opt(hour, 0, 0).unwrap()
}

fn object(value: JsonValue) -> Map<String, JsonValue> {
    match value {
        JsonValue::Object(map) => map,
        other => panic!("expected a json object, got {other}"),
    }
}

fn ids(rows: &[PgRow]) -> Vec<i32> {
    rows.iter().map(|row| row.get::<i32, _>("id")).collect()
}

async fn create_orders(database: &StateDatabase, count: i32) {
    database
        .run_sql("create table public.orders (id serial primary key, job_num text not null)")
        .await;
    database
        .run_sql(&format!(
            "insert into public.orders (job_num) select 'J-' || n from generate_series(1, {count}) n"
        ))
        .await;
}

async fn create_local_mirror(database: &StateDatabase) {
    database
        .run_sql(
            r#"
            create table public.dm_order (
                id serial primary key,
                source_id text,
                order_no text,
                factory text,
                modify_time timestamp
            )
            "#,
        )
        .await;
    database
        .run_sql(
            r#"
            create table public.dm_order_detail (
                id serial primary key,
                order_id integer not null,
                material_code text,
                quantity numeric(12, 2)
            )
            "#,
        )
        .await;
}

async fn detail_lines(database: &StateDatabase, order_id: i64) -> Vec<(String, String)> {
    sqlx::query_as(
        r#"
        select material_code, quantity::text
        from public.dm_order_detail
        where order_id = $1
        order by id
        "#,
    )
    .bind(order_id)
    .fetch_all(&database.pool)
    .await
    .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn watermark_id_never_moves_backwards() {
    let database = spawn_state_database().await;
    let pool = &database.pool;

    assert_eq!(get_watermark(pool, "orders").await.unwrap(), None);

    let first = WatermarkRow {
        entity: "orders".to_string(),
        last_id: Some(10),
        sync_date: day(1),
        sequence_count: 3,
    };
    upsert_watermark(pool, &first).await.unwrap();
    assert_eq!(get_watermark(pool, "orders").await.unwrap(), Some(first));

    // A lower id keeps the stored one, but the day and its sequence count still move on.
    upsert_watermark(
        pool,
        &WatermarkRow {
            entity: "orders".to_string(),
            last_id: Some(4),
            sync_date: day(2),
            sequence_count: 1,
        },
    )
    .await
    .unwrap();
    upsert_watermark(
        pool,
        &WatermarkRow {
            entity: "orders".to_string(),
            last_id: None,
            sync_date: day(2),
            sequence_count: 2,
        },
    )
    .await
    .unwrap();

    let stored = get_watermark(pool, "orders").await.unwrap().unwrap();
    assert_eq!(stored.last_id, Some(10));
    assert_eq!(stored.sync_date, day(2));
    assert_eq!(stored.sequence_count, 2);

    database.cleanup().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn pull_cursor_never_moves_backwards() {
    let database = spawn_state_database().await;
    let pool = &database.pool;

    assert_eq!(get_pull_cursor(pool, "dm_orders").await.unwrap(), None);

    upsert_pull_cursor(pool, "dm_orders", at(9)).await.unwrap();
    upsert_pull_cursor(pool, "dm_orders", at(7)).await.unwrap();
    assert_eq!(get_pull_cursor(pool, "dm_orders").await.unwrap(), Some(at(9)));

    upsert_pull_cursor(pool, "dm_orders", at(11)).await.unwrap();
    assert_eq!(get_pull_cursor(pool, "dm_orders").await.unwrap(), Some(at(11)));
    assert_eq!(get_pull_cursor(pool, "other").await.unwrap(), None);

    database.cleanup().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn ledger_counts_failures_until_delivered() {
    let database = spawn_state_database().await;
    let pool = &database.pool;

    assert_eq!(get_ledger_row(pool, "orders", 7).await.unwrap(), None);

    assert_eq!(record_failure(pool, "orders", 7, "timeout").await.unwrap(), 1);
    assert_eq!(record_failure(pool, "orders", 7, "http 500").await.unwrap(), 2);

    let row = get_ledger_row(pool, "orders", 7).await.unwrap().unwrap();
    assert!(!row.delivered);
    assert_eq!(row.attempts, 2);
    assert_eq!(row.last_error.as_deref(), Some("http 500"));

    mark_delivered(pool, "orders", &[7, 8]).await.unwrap();

    let row = get_ledger_row(pool, "orders", 7).await.unwrap().unwrap();
    assert!(row.delivered);
    assert_eq!(row.attempts, 2);
    assert_eq!(row.last_error, None);
    let row = get_ledger_row(pool, "orders", 8).await.unwrap().unwrap();
    assert!(row.delivered);
    assert_eq!(row.attempts, 0);
    assert_eq!(get_ledger_row(pool, "items", 7).await.unwrap(), None);

    database.cleanup().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn source_rows_are_read_after_the_watermark() {
    let database = spawn_state_database().await;
    create_orders(&database, 5).await;
    let pool = &database.pool;

    let first = fetch_rows_after(pool, "public.orders", None, 2).await.unwrap();
    assert_eq!(ids(&first), vec![1, 2]);
    assert_eq!(first[0].get::<String, _>("job_num"), "J-1");

    let rest = fetch_rows_after(pool, "public.orders", Some(2), 10).await.unwrap();
    assert_eq!(ids(&rest), vec![3, 4, 5]);

    database.cleanup().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn pending_rows_skip_delivered_and_exhausted_records() {
    let database = spawn_state_database().await;
    create_orders(&database, 5).await;
    let pool = &database.pool;

    mark_delivered(pool, "orders", &[1]).await.unwrap();
    for _ in 0..3 {
        record_failure(pool, "orders", 2, "rejected").await.unwrap();
    }
    record_failure(pool, "orders", 3, "rejected").await.unwrap();
    // Ledger rows of another entity do not count.
    mark_delivered(pool, "items", &[4]).await.unwrap();

    let pending = fetch_pending_rows(pool, "orders", "public.orders", 3, 10)
        .await
        .unwrap();
    assert_eq!(ids(&pending), vec![3, 4, 5]);

    let limited = fetch_pending_rows(pool, "orders", "public.orders", 3, 1)
        .await
        .unwrap();
    assert_eq!(ids(&limited), vec![3]);

    database.cleanup().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn child_rows_are_read_for_the_requested_parents() {
    let database = spawn_state_database().await;
    database
        .run_sql(
            "create table public.order_items (id serial primary key, order_id integer, code text)",
        )
        .await;
    database
        .run_sql(
            r#"
            insert into public.order_items (order_id, code)
            values (1, 'A'), (2, 'B'), (1, 'C'), (3, 'D')
            "#,
        )
        .await;
    let pool = &database.pool;

    let rows = fetch_child_rows(pool, "public.order_items", "order_id", &[1, 3])
        .await
        .unwrap();
    let codes: Vec<String> = rows.iter().map(|row| row.get("code")).collect();
    assert_eq!(codes, vec!["A", "C", "D"]);

    assert!(
        fetch_child_rows(pool, "public.order_items", "order_id", &[])
            .await
            .unwrap()
            .is_empty()
    );

    database.cleanup().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_rows_are_read_in_modify_time_order() {
    let database = spawn_state_database().await;
    database
        .run_sql(
            "create table public.remote_orders (id integer primary key, bill_no text, modify_time timestamp)",
        )
        .await;
    database
        .run_sql(
            r#"
            insert into public.remote_orders (id, bill_no, modify_time)
            values (70, 'PO-1', '2025-06-01 09:00'),
                   (71, 'PO-2', '2025-06-01 07:00'),
                   (72, 'PO-3', '2025-06-01 08:00'),
                   (73, 'PO-4', '2025-06-01 10:00')
            "#,
        )
        .await;
    let pool = &database.pool;

    let rows = fetch_rows_modified_after(pool, "public.remote_orders", "modify_time", at(7), 2)
        .await
        .unwrap();
    assert_eq!(ids(&rows), vec![72, 70]);

    let matching = fetch_rows_matching(pool, "public.remote_orders", "id", "71")
        .await
        .unwrap();
    assert_eq!(ids(&matching), vec![71]);

    database.cleanup().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn mirrored_rows_are_inserted_and_replaced_with_their_details() {
    let database = spawn_state_database().await;
    create_local_mirror(&database).await;
    let pool = &database.pool;

    let lines = vec![
        object(json!({ "material_code": "M-1", "quantity": "2.5" })),
        object(json!({ "material_code": "M-2", "quantity": 5, "order_id": 999 })),
    ];
    let details = DetailRows {
        table: "public.dm_order_detail",
        foreign_key: "order_id",
        rows: &lines,
    };
    let row = object(json!({
        "source_id": "70",
        "order_no": "PO-1",
        "factory": "F1",
        "modify_time": "2025-06-01 08:00:00"
    }));

    let local_id = insert_mirrored(pool, "public.dm_order", &row, Some(details))
        .await
        .unwrap();

    assert_eq!(
        find_local_id(pool, "public.dm_order", "source_id", "70").await.unwrap(),
        Some(local_id)
    );
    assert_eq!(
        find_local_id(pool, "public.dm_order", "order_no", "PO-9").await.unwrap(),
        None
    );
    assert_eq!(
        detail_lines(&database, local_id).await,
        vec![
            ("M-1".to_string(), "2.50".to_string()),
            ("M-2".to_string(), "5.00".to_string()),
        ]
    );
    let modified: NaiveDateTime =
        sqlx::query_scalar("select modify_time from public.dm_order where id = $1")
            .bind(local_id)
            .fetch_one(pool)
            .await
            .unwrap();
    assert_eq!(modified, at(8));

    mark_delivered(pool, "orders", &[local_id]).await.unwrap();

    let lines = vec![object(json!({ "material_code": "M-3", "quantity": 1 }))];
    let details = DetailRows {
        table: "public.dm_order_detail",
        foreign_key: "order_id",
        rows: &lines,
    };
    let row = object(json!({ "factory": "F9" }));
    replace_mirrored(
        pool,
        "public.dm_order",
        local_id,
        &row,
        Some(details),
        Some("orders"),
    )
    .await
    .unwrap();

    let (order_no, factory): (String, String) =
        sqlx::query_as("select order_no, factory from public.dm_order where id = $1")
            .bind(local_id)
            .fetch_one(pool)
            .await
            .unwrap();
    assert_eq!(order_no, "PO-1");
    assert_eq!(factory, "F9");
    assert_eq!(
        detail_lines(&database, local_id).await,
        vec![("M-3".to_string(), "1.00".to_string())]
    );
    assert_eq!(get_ledger_row(pool, "orders", local_id).await.unwrap(), None);

    database.cleanup().await;
}
