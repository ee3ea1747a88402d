//! Shared fixtures: an example warehouse with two SQLite datasources.
//!
//! `testdb1` is transactional (partners -> campaigns -> leads -> sales);
//! `testdb2` carries pre-aggregated per-campaign stats including
//! `main_sales_quantity`, the weighting metric for `revenue_mean`.
//! Revenue agrees between the two sources at the (partner, campaign)
//! grain so reports can resolve it from either side.

#![allow(dead_code)]

use std::sync::{Arc, Once, OnceLock};

use tempfile::NamedTempFile;
use tributary::{DataSource, DataSourceConfig, EngineConfig, Warehouse, WarehouseConfig};

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

pub struct TestWarehouse {
    pub warehouse: Warehouse,
    _db1: NamedTempFile,
    _db2: NamedTempFile,
}

pub async fn example_warehouse() -> TestWarehouse {
    example_warehouse_with_engine(EngineConfig::default()).await
}

pub async fn example_warehouse_with_engine(engine: EngineConfig) -> TestWarehouse {
    init_tracing();
    let db1 = NamedTempFile::new().expect("create testdb1 file");
    let db2 = NamedTempFile::new().expect("create testdb2 file");
    create_testdb1(db1.path());
    create_testdb2(db2.path());

    let config = warehouse_config(
        &db1.path().to_string_lossy(),
        &db2.path().to_string_lossy(),
    );
    let warehouse = Warehouse::from_config(&config, engine)
        .await
        .expect("build example warehouse");
    TestWarehouse {
        warehouse,
        _db1: db1,
        _db2: db2,
    }
}

fn create_testdb1(path: &std::path::Path) {
    let conn = rusqlite::Connection::open(path).expect("open testdb1");
    conn.execute_batch(
        r#"
        CREATE TABLE partners (
            id INTEGER PRIMARY KEY,
            name VARCHAR(50) NOT NULL,
            created_at DATETIME
        );
        CREATE TABLE campaigns (
            id INTEGER PRIMARY KEY,
            name VARCHAR(50) NOT NULL,
            partner_id INTEGER NOT NULL,
            category VARCHAR(50),
            created_at DATETIME
        );
        CREATE TABLE leads (
            id INTEGER PRIMARY KEY,
            name VARCHAR(50),
            campaign_id INTEGER NOT NULL,
            created_at DATETIME
        );
        CREATE TABLE sales (
            id INTEGER PRIMARY KEY,
            lead_id INTEGER NOT NULL,
            revenue DECIMAL(10,2),
            created_at DATETIME
        );

        INSERT INTO partners VALUES
            (1, 'Partner A', '2019-02-01 00:00:00'),
            (2, 'Partner B', '2019-03-01 00:00:00');

        INSERT INTO campaigns VALUES
            (1, 'Campaign 1A', 1, 'online',  '2020-02-05 10:30:00'),
            (2, 'Campaign 2A', 1, 'offline', '2020-03-10 11:00:00'),
            (3, 'Campaign 1B', 2, 'online',  '2020-04-01 09:00:00'),
            (4, 'Campaign 2B', 2, 'offline', '2019-03-15 10:30:00'),
            (5, 'Campaign 3B', 2, 'online',  '2020-05-20 12:00:00');

        INSERT INTO leads VALUES
            (1, 'Lead 1', 1, '2020-02-10 09:00:00'),
            (2, 'Lead 2', 1, '2020-02-11 09:30:00'),
            (3, 'Lead 3', 2, '2020-03-15 14:00:00'),
            (4, 'Lead 4', 3, '2020-04-05 10:00:00'),
            (5, 'Lead 5', 3, '2020-04-06 16:00:00'),
            (6, 'Lead 6', 4, '2019-04-01 12:00:00'),
            (7, 'Lead 7', 5, '2020-05-25 11:00:00');

        INSERT INTO sales VALUES
            (1, 1, 5.0,  '2020-02-15 10:00:00'),
            (2, 2, 7.0,  '2020-02-16 12:00:00'),
            (3, 3, 16.0, '2020-03-20 13:00:00'),
            (4, 4, 9.0,  '2020-04-10 09:30:00'),
            (5, 5, 11.0, '2020-04-11 15:00:00'),
            (6, 6, 15.0, '2019-04-05 10:00:00'),
            (7, 7, 10.0, '2020-05-28 14:00:00'),
            (8, 7, 8.0,  '2020-05-29 16:30:00');
        "#,
    )
    .expect("seed testdb1");
}

fn create_testdb2(path: &std::path::Path) {
    let conn = rusqlite::Connection::open(path).expect("open testdb2");
    conn.execute_batch(
        r#"
        CREATE TABLE partners (
            id INTEGER PRIMARY KEY,
            name VARCHAR(50) NOT NULL
        );
        CREATE TABLE campaigns (
            id INTEGER PRIMARY KEY,
            name VARCHAR(50) NOT NULL
        );
        CREATE TABLE aggregated_stats (
            partner_id INTEGER NOT NULL,
            campaign_id INTEGER NOT NULL,
            leads INTEGER DEFAULT 0,
            sales INTEGER DEFAULT 0,
            revenue DECIMAL(10,2) DEFAULT 0.0,
            main_sales_quantity INTEGER DEFAULT 0,
            PRIMARY KEY (partner_id, campaign_id)
        );

        INSERT INTO partners VALUES (1, 'Partner A'), (2, 'Partner B');
        INSERT INTO campaigns VALUES
            (1, 'Campaign 1A'),
            (2, 'Campaign 2A'),
            (3, 'Campaign 1B'),
            (4, 'Campaign 2B'),
            (5, 'Campaign 3B');

        INSERT INTO aggregated_stats VALUES
            (1, 1, 2, 2, 12.0, 1),
            (1, 2, 1, 1, 16.0, 2),
            (2, 3, 2, 2, 20.0, 4),
            (2, 4, 1, 1, 15.0, 3),
            (2, 5, 1, 2, 18.0, 2);
        "#,
    )
    .expect("seed testdb2");
}

pub fn warehouse_config(db1: &str, db2: &str) -> WarehouseConfig {
    let yaml = format!(
        r#"
metrics:
  - name: revenue
    type: decimal(10,2)
    rounding: 2
  - name: revenue_mean
    type: decimal(10,2)
    aggregation: mean
    rounding: 2
    weighting_metric: main_sales_quantity
  - name: main_sales_quantity
    type: integer
  - name: leads
    type: integer
  - name: sales
    type: integer
    required_grain: [campaign_name]
  - name: rpl
    formula: "1.0 * {{revenue}} / {{leads}}"
    rounding: 2
  - name: revenue_ma_2
    formula: "{{revenue}}"
    technical: "mean(2,1)"
    rounding: 2
dimensions:
  - name: partner_id
    type: integer
  - name: partner_name
    type: string(50)
  - name: campaign_id
    type: integer
  - name: campaign_name
    type: string(50)
  - name: lead_id
    type: integer
  - name: sale_id
    type: integer
  - name: campaign_created_at
    type: datetime
datasources:
  testdb1:
    connect: "{db1}"
    tables:
      partners:
        type: dimension
        primary_key: [partner_id]
        columns:
          id:
            fields: [partner_id]
          name:
            fields: [partner_name]
      campaigns:
        type: dimension
        primary_key: [campaign_id]
        parent: partners
        columns:
          id:
            fields: [campaign_id]
          name:
            fields: [campaign_name]
          partner_id:
            fields: [partner_id]
          created_at:
            fields: [campaign_created_at]
            allow_type_conversions: true
            type_conversion_prefix: campaign_
      leads:
        type: metric
        primary_key: [lead_id]
        columns:
          id:
            fields:
              - lead_id
              - name: leads
                ds_formula: "COUNT(DISTINCT {{}})"
          campaign_id:
            fields: [campaign_id]
      sales:
        type: metric
        primary_key: [sale_id]
        parent: leads
        columns:
          id:
            fields:
              - sale_id
              - name: sales
                ds_formula: "COUNT(DISTINCT {{}})"
          lead_id:
            fields: [lead_id]
          revenue:
            fields: [revenue]
  testdb2:
    connect: "{db2}"
    tables:
      partners:
        type: dimension
        primary_key: [partner_id]
        columns:
          id:
            fields: [partner_id]
          name:
            fields: [partner_name]
      campaigns:
        type: dimension
        primary_key: [campaign_id]
        columns:
          id:
            fields: [campaign_id]
          name:
            fields: [campaign_name]
      aggregated_stats:
        type: metric
        primary_key: [partner_id, campaign_id]
        columns:
          partner_id:
            fields: [partner_id]
          campaign_id:
            fields: [campaign_id]
          leads:
            fields: [leads]
          sales:
            fields: [sales]
          revenue:
            fields: [revenue, revenue_mean]
          main_sales_quantity:
            fields: [main_sales_quantity]
"#
    );
    serde_yaml::from_str(&yaml).expect("parse warehouse config")
}

/// A large single-table datasource whose aggregation query runs long
/// enough to exercise timeouts and kills. The backing file is built once
/// per test process.
static SLOW_DB: OnceLock<NamedTempFile> = OnceLock::new();

fn slow_db_path() -> std::path::PathBuf {
    SLOW_DB
        .get_or_init(|| {
            let file = NamedTempFile::new().expect("create slow db file");
            let conn = rusqlite::Connection::open(file.path()).expect("open slow db");
            conn.execute_batch(
                "CREATE TABLE adhoc_sales (
                    adhoc_id INTEGER,
                    partner_name VARCHAR(50),
                    adhoc_metric DOUBLE
                );
                INSERT INTO adhoc_sales VALUES
                    (1, 'Partner A', 1.25),
                    (2, 'Partner B', 2.5);",
            )
            .expect("seed slow db");
            // Double to ~4M rows so an aggregate scan takes hundreds of
            // milliseconds.
            for _ in 0..21 {
                conn.execute_batch(
                    "INSERT INTO adhoc_sales
                     SELECT adhoc_id + (SELECT MAX(adhoc_id) FROM adhoc_sales),
                            partner_name, adhoc_metric
                     FROM adhoc_sales;",
                )
                .expect("grow slow db");
            }
            file
        })
        .path()
        .to_path_buf()
}

pub async fn slow_datasource(engine: &EngineConfig) -> Arc<DataSource> {
    let path = slow_db_path();
    let yaml = format!(
        r#"
connect: "{}"
metrics:
  - name: adhoc_metric
    type: double
dimensions:
  - name: adhoc_id
    type: integer
  - name: partner_name
    type: string(50)
tables:
  adhoc_sales:
    type: metric
    primary_key: [adhoc_id]
    columns:
      adhoc_id:
        fields: [adhoc_id]
      partner_name:
        fields: [partner_name]
      adhoc_metric:
        fields: [adhoc_metric]
"#,
        path.to_string_lossy()
    );
    let config: DataSourceConfig = serde_yaml::from_str(&yaml).expect("parse slow ds config");
    Arc::new(
        DataSource::new("adhoc_large_db", &config, engine)
            .await
            .expect("build slow datasource"),
    )
}
