mod common;

use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::{NaiveDate, NaiveDateTime};
use sync_config::shared::PullConfig;
use sync_engine::pull::PullPipeline;
use sync_engine::store::postgres::PostgresStore;
use sync_engine::store::remote::PostgresRemote;
use sync_engine::store::{DeliveryLedger, SourceStore, WatermarkStore};
use sync_engine::types::{Value, Watermark};
use sync_postgres::ledger::get_ledger_row;
use sync_postgres::test_utils::{StateDatabase, spawn_state_database};
use sync_telemetry::tracing::init_test_tracing;

use crate::common::test_settings;

fn at(day: u32, hour: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 6, day)
        .unwrap()
        .and_hms_opt(hour, 0, 0)
        .unwrap()
}

fn decimal(text: &str) -> Value {
    Value::Decimal(BigDecimal::from_str(text).unwrap())
}

#[tokio::test(flavor = "multi_thread")]
async fn source_columns_decode_to_typed_values() {
    init_test_tracing();
    let database = spawn_state_database().await;
    database
        .run_sql(
            r#"
            create table public.typed_orders (
                id serial primary key,
                line_no smallint,
                amount numeric(10, 2),
                ratio double precision,
                shipped boolean,
                order_date date,
                updated_at timestamp,
                stamped_at timestamptz,
                job_num varchar(20),
                code char(4),
                remark text,
                extra jsonb
            )
            "#,
        )
        .await;
    database
        .run_sql(
            r#"
            insert into public.typed_orders
                (line_no, amount, ratio, shipped, order_date, updated_at, stamped_at, job_num, code, remark, extra)
            values
                (3, 12.50, 0.25, true, '2025-06-01', '2025-06-01 08:30:00', '2025-06-01 08:00:00+02',
                 'J-1', 'AB', null, '{"a": 1}')
            "#,
        )
        .await;
    let store = PostgresStore::new(database.pool.clone());

    let batch = store
        .fetch_batch("public.typed_orders", None, 10)
        .await
        .unwrap();

    assert!(batch.malformed.is_empty());
    let record = &batch.records[0];
    assert_eq!(record.id(), 1);
    assert_eq!(record.get("line_no"), Some(&Value::Int(3)));
    assert_eq!(record.get("amount"), Some(&decimal("12.50")));
    assert_eq!(record.get("ratio"), Some(&Value::Float(0.25)));
    assert_eq!(record.get("shipped"), Some(&Value::Bool(true)));
    assert_eq!(
        record.get("order_date"),
        Some(&Value::Date(NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()))
    );
    assert_eq!(
        record.get("updated_at"),
        Some(&Value::Timestamp(
            NaiveDate::from_ymd_opt(2025, 6, 1)
                .unwrap()
                .and_hms_opt(8, 30, 0)
                .unwrap()
        ))
    );
    // Zoned timestamps are read in UTC.
    assert_eq!(record.get("stamped_at"), Some(&Value::Timestamp(at(1, 6))));
    assert_eq!(record.text("job_num").as_deref(), Some("J-1"));
    assert_eq!(record.get("code"), Some(&Value::from("AB  ")));
    assert_eq!(record.get("remark"), Some(&Value::Null));
    assert_eq!(record.get("extra"), Some(&Value::Null));

    database.cleanup().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn undecodable_rows_are_reported_by_id() {
    init_test_tracing();
    let database = spawn_state_database().await;
    database
        .run_sql("create table public.amounts (id serial primary key, amount numeric)")
        .await;
    // Numeric NaN has no decimal counterpart.
    database
        .run_sql("insert into public.amounts (amount) values (1.5), ('NaN'), (2)")
        .await;
    let store = PostgresStore::new(database.pool.clone());

    let batch = store.fetch_batch("public.amounts", None, 10).await.unwrap();

    let ids: Vec<_> = batch.records.iter().map(|record| record.id()).collect();
    assert_eq!(ids, vec![1, 3]);
    assert_eq!(batch.malformed, vec![Some(2)]);
    assert_eq!(batch.len(), 3);
    assert_eq!(batch.max_id(), Some(3));

    database.cleanup().await;
}

async fn create_orders_with_items(database: &StateDatabase) {
    database
        .run_sql("create table public.orders (id bigserial primary key, job_num text)")
        .await;
    database
        .run_sql(
            "create table public.order_items (id serial primary key, order_id bigint, code text)",
        )
        .await;
    database
        .run_sql(
            r#"
            insert into public.orders (job_num) values ('J-1'), ('J-2'), ('J-3');
            insert into public.order_items (order_id, code) values (1, 'A'), (3, 'B'), (1, 'C');
            "#,
        )
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn store_tracks_watermarks_ledger_and_children() {
    init_test_tracing();
    let database = spawn_state_database().await;
    create_orders_with_items(&database).await;
    let store = PostgresStore::new(database.pool.clone());

    assert_eq!(store.get_watermark("orders").await.unwrap(), None);
    let watermark = Watermark {
        last_id: Some(2),
        sync_date: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
        sequence_count: 4,
    };
    store.set_watermark("orders", &watermark).await.unwrap();
    store
        .set_watermark(
            "orders",
            &Watermark {
                last_id: Some(1),
                ..watermark
            },
        )
        .await
        .unwrap();
    assert_eq!(store.get_watermark("orders").await.unwrap(), Some(watermark));

    let after = store.fetch_batch("public.orders", Some(2), 10).await.unwrap();
    let ids: Vec<_> = after.records.iter().map(|record| record.id()).collect();
    assert_eq!(ids, vec![3]);

    store.mark_delivered("orders", &[1]).await.unwrap();
    assert_eq!(store.record_failure("orders", 2, "boom").await.unwrap(), 1);
    assert_eq!(store.record_failure("orders", 2, "boom").await.unwrap(), 2);
    let long_error = "x".repeat(600);
    store.record_failure("orders", 3, &long_error).await.unwrap();

    let pending = store
        .fetch_pending("orders", "public.orders", 2, 10)
        .await
        .unwrap();
    let ids: Vec<_> = pending.records.iter().map(|record| record.id()).collect();
    assert_eq!(ids, vec![3]);

    let row = get_ledger_row(&database.pool, "orders", 3)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.last_error.map(|error| error.len()), Some(500));

    let children = store
        .fetch_children("public.order_items", "order_id", &[1, 2])
        .await
        .unwrap();
    let codes: Vec<_> = children
        .iter()
        .filter_map(|child| child.text("code"))
        .collect();
    assert_eq!(codes, vec!["A", "C"]);

    database.cleanup().await;
}

fn dm_pull(database: &StateDatabase) -> PullConfig {
    serde_json::from_value(serde_json::json!({
        "name": "dm_orders",
        "remote": {
            "host": database.config.host,
            "port": database.config.port,
            "name": database.config.name,
            "username": database.config.username
        },
        "remote_table": "public.remote_orders",
        "modify_time_field": "modify_time",
        "local_table": "public.dm_order",
        "columns": {
            "source_id": "id",
            "order_no": "bill_no",
            "factory": "factory",
            "modify_time": "modify_time"
        },
        "detail": {
            "remote_table": "public.remote_lines",
            "remote_foreign_key": "order_id",
            "local_table": "public.dm_order_detail",
            "local_foreign_key": "order_id",
            "columns": { "material_code": "code", "quantity": "qty" }
        },
        "push_entity": "orders"
    }))
    .unwrap()
}

async fn create_pull_tables(database: &StateDatabase) {
    database
        .run_sql(
            r#"
            create table public.remote_orders (
                id integer primary key,
                bill_no text,
                factory text,
                modify_time timestamp
            );
            create table public.remote_lines (
                id serial primary key,
                order_id integer,
                code text,
                qty numeric(10, 2)
            );
            create table public.dm_order (
                id serial primary key,
                source_id text,
                order_no text,
                factory text,
                modify_time timestamp
            );
            create table public.dm_order_detail (
                id serial primary key,
                order_id integer,
                material_code text,
                quantity numeric(10, 2)
            );
            "#,
        )
        .await;
}

async fn local_orders(database: &StateDatabase) -> Vec<(i32, String, String)> {
    sqlx::query_as("select id, source_id, factory from public.dm_order order by id")
        .fetch_all(&database.pool)
        .await
        .unwrap()
}

async fn local_lines(database: &StateDatabase) -> Vec<(i32, String, String)> {
    sqlx::query_as(
        "select order_id, material_code, quantity::text from public.dm_order_detail order by id",
    )
    .fetch_all(&database.pool)
    .await
    .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn pulled_rows_are_mirrored_and_refreshed() {
    init_test_tracing();
    let database = spawn_state_database().await;
    create_pull_tables(&database).await;
    database
        .run_sql(
            r#"
            insert into public.remote_orders (id, bill_no, factory, modify_time)
            values (70, 'PO-1', 'F1', '2025-06-01 08:00'), (71, 'PO-2', 'F2', '2025-06-01 09:00');
            insert into public.remote_lines (order_id, code, qty) values (70, 'M-1', 2.5), (70, 'M-2', 5);
            "#,
        )
        .await;

    let config = dm_pull(&database);
    let remote = PostgresRemote::new(database.pool.clone(), &config);
    let store = PostgresStore::new(database.pool.clone());
    let pull = PullPipeline::new(config, &test_settings(), remote, store.clone())
        .with_clock(|| at(3, 12));

    let summary = pull.run_pass().await.unwrap();

    assert_eq!(summary.inserted, 2);
    assert_eq!(summary.cursor, Some(at(1, 9)));
    assert_eq!(
        local_orders(&database).await,
        vec![
            (1, "70".to_string(), "F1".to_string()),
            (2, "71".to_string(), "F2".to_string()),
        ]
    );
    assert_eq!(
        local_lines(&database).await,
        vec![
            (1, "M-1".to_string(), "2.50".to_string()),
            (1, "M-2".to_string(), "5.00".to_string()),
        ]
    );

    store.mark_delivered("orders", &[1]).await.unwrap();
    database
        .run_sql(
            r#"
            update public.remote_orders set factory = 'F9', modify_time = '2025-06-02 08:00' where id = 70;
            delete from public.remote_lines where order_id = 70;
            insert into public.remote_lines (order_id, code, qty) values (70, 'M-3', 1);
            "#,
        )
        .await;

    let summary = pull.run_pass().await.unwrap();

    assert_eq!(summary.total, 1);
    assert_eq!(summary.updated, 1);
    assert_eq!(summary.cursor, Some(at(2, 8)));
    assert_eq!(local_orders(&database).await[0], (1, "70".to_string(), "F9".to_string()));
    assert_eq!(
        local_lines(&database).await,
        vec![(1, "M-3".to_string(), "1.00".to_string())]
    );
    assert_eq!(get_ledger_row(&database.pool, "orders", 1).await.unwrap(), None);

    database.cleanup().await;
}
