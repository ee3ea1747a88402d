//! Warehouse construction, field registry, integrity checks, and table
//! set selection against the example warehouse.

mod common;

use std::collections::BTreeSet;

use common::{example_warehouse, warehouse_config};
use tributary::{EngineConfig, FieldManager, TributaryError, Warehouse};

#[tokio::test]
async fn builds_example_warehouse() {
    let fixture = example_warehouse().await;
    let wh = &fixture.warehouse;
    assert_eq!(wh.datasource_names(), vec!["testdb1", "testdb2"]);
    assert!(wh.has_metric("revenue"));
    assert!(wh.has_metric("rpl"));
    assert!(wh.has_dimension("partner_name"));
    assert!(!wh.has_metric("partner_name"));
}

#[tokio::test]
async fn conversion_fields_are_registered_on_the_datasource() {
    let fixture = example_warehouse().await;
    let wh = &fixture.warehouse;
    // Generated from campaigns.created_at with the campaign_ prefix.
    assert!(wh.has_dimension("campaign_year"));
    assert!(wh.has_dimension("campaign_month"));
    assert!(wh.has_dimension("campaign_date"));
    assert!(wh.has_dimension("campaign_hour"));
    // Warehouse-level lookup falls through to the datasource registry.
    let dim = wh.get_dimension("campaign_year").unwrap();
    assert_eq!(dim.name, "campaign_year");
}

#[tokio::test]
async fn unknown_fields_are_invalid() {
    let fixture = example_warehouse().await;
    let wh = &fixture.warehouse;
    assert!(matches!(
        wh.get_metric("nope"),
        Err(TributaryError::InvalidField(_))
    ));
    assert!(matches!(
        wh.get_dimension("revenue"),
        Err(TributaryError::InvalidField(_))
    ));
}

#[tokio::test]
async fn metric_table_set_prefers_datasource_priority() {
    let fixture = example_warehouse().await;
    let wh = &fixture.warehouse;
    let grain: BTreeSet<String> = ["partner_name".to_string(), "campaign_name".to_string()]
        .into_iter()
        .collect();

    // Both datasources can satisfy revenue at this grain; testdb1 wins on
    // priority even though its join is larger.
    let table_set = wh
        .get_metric_table_set("revenue", &grain, &grain, &[])
        .unwrap();
    assert_eq!(table_set.datasource, "testdb1");
    assert_eq!(table_set.ds_table, "sales");
    assert_eq!(table_set.table_count(), 4);

    // Only testdb2 has the quantity metric.
    let table_set = wh
        .get_metric_table_set("main_sales_quantity", &grain, &grain, &[])
        .unwrap();
    assert_eq!(table_set.datasource, "testdb2");
    assert_eq!(table_set.ds_table, "aggregated_stats");
    assert_eq!(table_set.table_count(), 3);
}

#[tokio::test]
async fn anchor_covering_the_grain_needs_no_join() {
    let fixture = example_warehouse().await;
    let wh = &fixture.warehouse;
    let grain: BTreeSet<String> = ["campaign_id".to_string()].into_iter().collect();
    let table_set = wh
        .get_metric_table_set("leads", &grain, &grain, &[])
        .unwrap();
    assert_eq!(table_set.datasource, "testdb1");
    assert!(table_set.join.is_none());
}

#[tokio::test]
async fn unreachable_grain_names_the_unsupported_dimensions() {
    let fixture = example_warehouse().await;
    let wh = &fixture.warehouse;
    let grain: BTreeSet<String> = ["sale_id".to_string()].into_iter().collect();
    let err = wh
        .get_metric_table_set("leads", &grain, &grain, &[])
        .unwrap_err();
    match err {
        TributaryError::UnsupportedGrain(msg) => {
            assert!(msg.contains("sale_id"), "message was: {msg}");
        }
        other => panic!("expected UnsupportedGrain, got {other:?}"),
    }
}

#[tokio::test]
async fn supported_dimensions_follow_the_join_graph() {
    let fixture = example_warehouse().await;
    let wh = &fixture.warehouse;
    let dims = wh.supported_dimensions_for_metric("revenue", &[]);
    assert!(dims.contains("partner_name"));
    assert!(dims.contains("campaign_name"));
    assert!(dims.contains("lead_id"));
    // sale_id is on the sales table itself.
    assert!(dims.contains("sale_id"));

    let dims = wh.supported_dimensions_for_metric("leads", &[]);
    assert!(dims.contains("campaign_name"));
    assert!(!dims.contains("sale_id"));
}

#[tokio::test]
async fn integrity_check_catches_missing_primary_key_dimension() {
    let db = tempfile::NamedTempFile::new().unwrap();
    rusqlite::Connection::open(db.path())
        .unwrap()
        .execute_batch(
            "CREATE TABLE facts (id INTEGER PRIMARY KEY, amount DECIMAL(10,2));
             INSERT INTO facts VALUES (1, 10.0);",
        )
        .unwrap();

    let yaml = format!(
        r#"
metrics:
  - name: amount
    type: decimal(10,2)
dimensions:
  - name: fact_id
    type: integer
datasources:
  facts_db:
    connect: "{}"
    tables:
      facts:
        type: metric
        primary_key: [missing_dim]
        columns:
          id:
            fields: [fact_id]
          amount:
            fields: [amount]
"#,
        db.path().to_string_lossy()
    );
    let config = serde_yaml::from_str(&yaml).unwrap();
    let err = Warehouse::from_config(&config, EngineConfig::default())
        .await
        .unwrap_err();
    match err {
        TributaryError::WarehouseIntegrity(msg) => {
            assert!(msg.contains("missing_dim"), "message was: {msg}");
        }
        other => panic!("expected WarehouseIntegrity, got {other:?}"),
    }
}

#[tokio::test]
async fn integrity_check_catches_conflicting_field_types() {
    let db = tempfile::NamedTempFile::new().unwrap();
    rusqlite::Connection::open(db.path())
        .unwrap()
        .execute_batch(
            "CREATE TABLE facts (id INTEGER PRIMARY KEY, amount DECIMAL(10,2));
             INSERT INTO facts VALUES (1, 10.0);",
        )
        .unwrap();

    // "amount" is declared both as a global metric and a global dimension.
    let yaml = format!(
        r#"
metrics:
  - name: amount
    type: decimal(10,2)
dimensions:
  - name: amount
    type: string(20)
  - name: fact_id
    type: integer
datasources:
  facts_db:
    connect: "{}"
    tables:
      facts:
        type: metric
        primary_key: [fact_id]
        columns:
          id:
            fields: [fact_id]
          amount:
            fields: [amount]
"#,
        db.path().to_string_lossy()
    );
    let config = serde_yaml::from_str(&yaml).unwrap();
    let err = Warehouse::from_config(&config, EngineConfig::default())
        .await
        .unwrap_err();
    match err {
        TributaryError::WarehouseIntegrity(msg) => {
            assert!(
                msg.contains("both metrics and dimensions"),
                "message was: {msg}"
            );
        }
        other => panic!("expected WarehouseIntegrity, got {other:?}"),
    }
}

#[tokio::test]
async fn integrity_check_catches_unknown_weighting_metric() {
    let db = tempfile::NamedTempFile::new().unwrap();
    rusqlite::Connection::open(db.path())
        .unwrap()
        .execute_batch(
            "CREATE TABLE facts (id INTEGER PRIMARY KEY, amount DECIMAL(10,2));
             INSERT INTO facts VALUES (1, 10.0);",
        )
        .unwrap();

    let yaml = format!(
        r#"
metrics:
  - name: amount_mean
    type: decimal(10,2)
    aggregation: mean
    weighting_metric: no_such_metric
dimensions:
  - name: fact_id
    type: integer
datasources:
  facts_db:
    connect: "{}"
    tables:
      facts:
        type: metric
        primary_key: [fact_id]
        columns:
          id:
            fields: [fact_id]
          amount:
            fields: [amount_mean]
"#,
        db.path().to_string_lossy()
    );
    let config = serde_yaml::from_str(&yaml).unwrap();
    let err = Warehouse::from_config(&config, EngineConfig::default())
        .await
        .unwrap_err();
    match err {
        TributaryError::WarehouseIntegrity(msg) => {
            assert!(msg.contains("no_such_metric"), "message was: {msg}");
        }
        other => panic!("expected WarehouseIntegrity, got {other:?}"),
    }
}

#[tokio::test]
async fn disallowed_sql_in_ds_formula_is_rejected() {
    let db = tempfile::NamedTempFile::new().unwrap();
    rusqlite::Connection::open(db.path())
        .unwrap()
        .execute_batch(
            "CREATE TABLE facts (id INTEGER PRIMARY KEY, amount DECIMAL(10,2));
             INSERT INTO facts VALUES (1, 10.0);",
        )
        .unwrap();

    let yaml = format!(
        r#"
metrics:
  - name: amount
    type: decimal(10,2)
dimensions:
  - name: fact_id
    type: integer
datasources:
  facts_db:
    connect: "{}"
    tables:
      facts:
        type: metric
        primary_key: [fact_id]
        columns:
          id:
            fields: [fact_id]
          amount:
            fields:
              - name: amount
                ds_formula: "DROP TABLE facts"
"#,
        db.path().to_string_lossy()
    );
    let config = serde_yaml::from_str(&yaml).unwrap();
    let err = Warehouse::from_config(&config, EngineConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, TributaryError::DisallowedSql(_)));
}

#[tokio::test]
async fn formula_recursion_depth_is_bounded_at_build_time() {
    let db = tempfile::NamedTempFile::new().unwrap();
    rusqlite::Connection::open(db.path())
        .unwrap()
        .execute_batch(
            "CREATE TABLE facts (id INTEGER PRIMARY KEY, amount DECIMAL(10,2));
             INSERT INTO facts VALUES (1, 10.0);",
        )
        .unwrap();

    let yaml = format!(
        r#"
metrics:
  - name: amount
    type: decimal(10,2)
  - name: f1
    formula: "{{amount}} + 1"
  - name: f2
    formula: "{{f1}} + 1"
  - name: f3
    formula: "{{f2}} + 1"
  - name: f4
    formula: "{{f3}} + 1"
  - name: f5
    formula: "{{f4}} + 1"
dimensions:
  - name: fact_id
    type: integer
datasources:
  facts_db:
    connect: "{}"
    tables:
      facts:
        type: metric
        primary_key: [fact_id]
        columns:
          id:
            fields: [fact_id]
          amount:
            fields: [amount]
"#,
        db.path().to_string_lossy()
    );
    let config = serde_yaml::from_str(&yaml).unwrap();
    let err = Warehouse::from_config(&config, EngineConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, TributaryError::MaxFormulaDepth(_)));
}

#[tokio::test]
async fn warehouse_config_survives_save_and_load() {
    let db1 = tempfile::NamedTempFile::new().unwrap();
    let db2 = tempfile::NamedTempFile::new().unwrap();

    // Round-trip the config itself through the metadata store.
    let config = warehouse_config(
        &db1.path().to_string_lossy(),
        &db2.path().to_string_lossy(),
    );
    let store = tributary::MetadataStore::in_memory().unwrap();
    let id = store
        .save_warehouse("example", &serde_json::to_value(&config).unwrap(), None)
        .unwrap();
    let record = store.load_warehouse(id).unwrap();
    let loaded: tributary::WarehouseConfig = serde_json::from_value(record.params).unwrap();
    assert_eq!(loaded.metrics.len(), config.metrics.len());
    assert!(loaded.datasources.contains_key("testdb1"));
}
