//! End-to-end pipeline tests that exercise the full event path without a
//! live MySQL server: configuration → bus routing → filter/transform
//! planning → batch accumulation → generated SQL.

use myretl_lib::batch::BatchAccumulator;
use myretl_lib::bus::{Message, MessageBus, MessagePayload};
use myretl_lib::events::{Row, RowEvent};
use myretl_lib::sql;
use myretl_lib::target::{plan_event, EventAction, SkipReason};
use myretl_lib::{EtlConfig, TransformRegistry};
use serde_json::json;
use std::sync::Arc;

const CONFIG: &str = r#"{
    "sources": {
        "source1": {
            "host": "127.0.0.1",
            "user": "repl",
            "password": "secret",
            "database": "shop"
        }
    },
    "targets": {
        "target1": {
            "host": "127.0.0.1",
            "user": "etl",
            "password": "secret",
            "database": "warehouse",
            "batch_size": 100,
            "batch_flush_interval": 1.0
        }
    },
    "replication": {"server_id": 401},
    "mapping": {
        "source1.users": {
            "target": "target1.users",
            "primary_key": "id",
            "column_mapping": {
                "id": {"column": "id", "primary_key": true},
                "name": {"column": "name", "transform": "transform.uppercase"},
                "email": {"column": "email", "transform": "transform.lowercase"}
            }
        },
        "source1.orders": {
            "target": "target1.orders",
            "primary_key": "id",
            "column_mapping": {
                "id": {"column": "id", "primary_key": true},
                "status": "status",
                "age": "age"
            },
            "filter": {"status": {"eq": "active"}, "age": {"gte": 18}}
        }
    }
}"#;

fn row(pairs: &[(&str, serde_json::Value)]) -> Row {
    let mut r = Row::new();
    for (k, v) in pairs {
        r.insert(k.to_string(), v.clone());
    }
    r
}

fn setup() -> (EtlConfig, TransformRegistry, Vec<Arc<myretl_lib::MappingRule>>) {
    let config = EtlConfig::from_json_str(CONFIG).unwrap();
    let registry = TransformRegistry::with_builtins();
    let rules = config.resolve_mappings(&registry).unwrap();
    (config, registry, rules)
}

/// Spec seed 1: `{id:1, name:"John", email:"J@X"}` with uppercase/lowercase
/// transforms lands as `{id:1, name:"JOHN", email:"j@x"}`.
#[tokio::test]
async fn insert_travels_bus_and_transforms() {
    let (_, registry, rules) = setup();
    let users_rule = rules.iter().find(|r| r.key == "source1.users").unwrap();

    let bus = MessageBus::new();
    let mut subscriber = bus.subscribe("target1");

    let event = RowEvent::insert(
        "source1",
        "shop",
        "users",
        row(&[
            ("id", json!(1)),
            ("name", json!("John")),
            ("email", json!("J@X")),
        ]),
    );
    bus.publish(Message::event(
        "source1",
        &users_rule.target_name,
        &users_rule.key,
        event,
    ));

    let message = subscriber.recv().await.unwrap();
    let MessagePayload::Event { mapping_key, event } = message.payload else {
        panic!("expected an event message");
    };
    assert_eq!(mapping_key, "source1.users");

    let action = plan_event(users_rule, &event, &registry).unwrap();
    let EventAction::Upsert(target_row) = action else {
        panic!("expected an upsert");
    };
    assert_eq!(target_row.get("id"), Some(&json!(1)));
    assert_eq!(target_row.get("name"), Some(&json!("JOHN")));
    assert_eq!(target_row.get("email"), Some(&json!("j@x")));
}

/// Spec seed 2: two INSERTs for the same id inside one flush window coalesce
/// to one row carrying the second insert's values, written by one statement.
#[test]
fn same_key_inserts_coalesce_to_one_upsert() {
    let (_, registry, rules) = setup();
    let users_rule = rules.iter().find(|r| r.key == "source1.users").unwrap();
    let mut accumulator = BatchAccumulator::new();

    for name in ["John", "Johnny"] {
        let event = RowEvent::insert(
            "source1",
            "shop",
            "users",
            row(&[
                ("id", json!(1)),
                ("name", json!(name)),
                ("email", json!("J@X")),
            ]),
        );
        let EventAction::Upsert(target_row) = plan_event(users_rule, &event, &registry).unwrap()
        else {
            panic!("expected an upsert");
        };
        accumulator.push(users_rule, target_row);
    }

    let slot = accumulator.take(&users_rule.key).unwrap();
    assert_eq!(slot.len(), 1, "rows for the same key coalesce");
    assert_eq!(slot.rows()[0].get("name"), Some(&json!("JOHNNY")));

    let (sql_text, params) =
        sql::build_batch_upsert(&slot.target_table, slot.rows(), &slot.primary_key).unwrap();
    assert!(sql_text.contains("VALUES (?, ?, ?) ON DUPLICATE KEY UPDATE"));
    assert_eq!(params.len(), 3, "one tuple, one statement");
}

/// Spec seed 3: implicit AND of status/age conditions.
#[test]
fn filter_drops_and_passes_rows() {
    let (_, registry, rules) = setup();
    let orders_rule = rules.iter().find(|r| r.key == "source1.orders").unwrap();

    let too_young = RowEvent::insert(
        "source1",
        "shop",
        "orders",
        row(&[("id", json!(1)), ("status", json!("active")), ("age", json!(17))]),
    );
    assert!(matches!(
        plan_event(orders_rule, &too_young, &registry).unwrap(),
        EventAction::Skip(SkipReason::Filtered)
    ));

    let adult = RowEvent::insert(
        "source1",
        "shop",
        "orders",
        row(&[("id", json!(2)), ("status", json!("active")), ("age", json!(18))]),
    );
    assert!(matches!(
        plan_event(orders_rule, &adult, &registry).unwrap(),
        EventAction::Upsert(_)
    ));
}

/// Spec seed 4: nested and/or tree.
#[test]
fn nested_filter_combination() {
    let config = EtlConfig::from_json_str(
        &CONFIG.replace(
            r#""filter": {"status": {"eq": "active"}, "age": {"gte": 18}}"#,
            r#""filter": {"and": [
                {"status": {"eq": "active"}},
                {"or": [{"category": {"eq": "premium"}}, {"score": {"gte": 90}}]}
            ]}"#,
        ),
    )
    .unwrap();
    let registry = TransformRegistry::with_builtins();
    let rules = config.resolve_mappings(&registry).unwrap();
    let orders_rule = rules.iter().find(|r| r.key == "source1.orders").unwrap();

    let event = RowEvent::insert(
        "source1",
        "shop",
        "orders",
        row(&[
            ("id", json!(1)),
            ("status", json!("active")),
            ("category", json!("free")),
            ("score", json!(95)),
        ]),
    );
    assert!(matches!(
        plan_event(orders_rule, &event, &registry).unwrap(),
        EventAction::Upsert(_)
    ));
}

/// `batch_size = 1` means every accumulated row immediately reaches the
/// flush threshold, degrading to per-row upserts.
#[test]
fn batch_size_one_degrades_to_per_row() {
    let (_, registry, rules) = setup();
    let users_rule = rules.iter().find(|r| r.key == "source1.users").unwrap();
    let mut accumulator = BatchAccumulator::new();
    let batch_size = 1usize;

    let mut flushes = 0;
    for id in 0..3 {
        let event = RowEvent::insert(
            "source1",
            "shop",
            "users",
            row(&[
                ("id", json!(id)),
                ("name", json!("x")),
                ("email", json!("x@y")),
            ]),
        );
        let EventAction::Upsert(target_row) = plan_event(users_rule, &event, &registry).unwrap()
        else {
            panic!("expected an upsert");
        };
        let size = accumulator.push(users_rule, target_row);
        if size >= batch_size {
            let slot = accumulator.take(&users_rule.key).unwrap();
            assert_eq!(slot.len(), 1);
            flushes += 1;
        }
    }
    assert_eq!(flushes, 3);
}

/// DELETE classification carries the transformed primary key so the worker
/// can flush the pending batch and delete by key.
#[test]
fn delete_action_carries_pk() {
    let (_, registry, rules) = setup();
    let users_rule = rules.iter().find(|r| r.key == "source1.users").unwrap();

    let event = RowEvent::delete(
        "source1",
        "shop",
        "users",
        row(&[
            ("id", json!(42)),
            ("name", json!("gone")),
            ("email", json!("g@x")),
        ]),
    );
    let EventAction::Delete(target_row) = plan_event(users_rule, &event, &registry).unwrap() else {
        panic!("expected a delete");
    };
    let (sql_text, params) = sql::build_delete(
        &users_rule.target_table,
        &users_rule.primary_key,
        target_row.get("id").unwrap(),
    );
    assert_eq!(sql_text, "DELETE FROM `users` WHERE `id` = ?");
    assert_eq!(params.len(), 1);
}

/// Applying the same INSERT twice produces the same statement both times —
/// the upsert is what makes at-least-once delivery idempotent.
#[test]
fn reapplied_insert_is_idempotent_sql() {
    let (_, registry, rules) = setup();
    let users_rule = rules.iter().find(|r| r.key == "source1.users").unwrap();

    let event = RowEvent::insert(
        "source1",
        "shop",
        "users",
        row(&[
            ("id", json!(1)),
            ("name", json!("John")),
            ("email", json!("J@X")),
        ]),
    );

    let mut statements = Vec::new();
    for _ in 0..2 {
        let EventAction::Upsert(target_row) = plan_event(users_rule, &event, &registry).unwrap()
        else {
            panic!("expected an upsert");
        };
        let (sql_text, params) =
            sql::build_upsert(&users_rule.target_table, &target_row, &users_rule.primary_key)
                .unwrap();
        statements.push((sql_text, params));
    }
    assert_eq!(statements[0], statements[1]);
    assert!(statements[0].0.contains("ON DUPLICATE KEY UPDATE"));
}

/// INIT events follow the same path as INSERT: applying INIT then the same
/// UPDATE image equals applying the UPDATE alone.
#[test]
fn init_then_update_converges() {
    let (_, registry, rules) = setup();
    let users_rule = rules.iter().find(|r| r.key == "source1.users").unwrap();
    let mut accumulator = BatchAccumulator::new();

    let init = RowEvent::init(
        "source1",
        "shop",
        "users",
        row(&[
            ("id", json!(1)),
            ("name", json!("old")),
            ("email", json!("OLD@X")),
        ]),
    );
    let update = RowEvent::update(
        "source1",
        "shop",
        "users",
        row(&[("id", json!(1)), ("name", json!("old")), ("email", json!("OLD@X"))]),
        row(&[("id", json!(1)), ("name", json!("new")), ("email", json!("NEW@X"))]),
    );

    for event in [&init, &update] {
        let EventAction::Upsert(target_row) = plan_event(users_rule, event, &registry).unwrap()
        else {
            panic!("expected an upsert");
        };
        accumulator.push(users_rule, target_row);
    }

    let slot = accumulator.take(&users_rule.key).unwrap();
    assert_eq!(slot.len(), 1);
    assert_eq!(slot.rows()[0].get("name"), Some(&json!("NEW")));
    assert_eq!(slot.rows()[0].get("email"), Some(&json!("new@x")));
}

/// Bus invariant: publishers never block; beyond capacity the drop counter
/// strictly increases.
#[tokio::test]
async fn bus_overflow_counts_drops() {
    let bus = MessageBus::with_capacity(5);
    let _subscriber = bus.subscribe("target1");

    for i in 0..12 {
        let event = RowEvent::insert("source1", "shop", "users", row(&[("id", json!(i))]));
        bus.publish(Message::event("source1", "target1", "source1.users", event));
    }

    let stats = bus.stats().snapshot();
    assert_eq!(stats.published, 5);
    assert_eq!(stats.dropped, 7);
    assert_eq!(stats.peak, 5);
}
