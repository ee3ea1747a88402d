//! End-to-end report execution against the example warehouse.

mod common;

use std::time::Duration;

use common::{example_warehouse, example_warehouse_with_engine, slow_datasource};
use serde_json::json;
use tributary::{
    Criterion, CriteriaOp, EngineConfig, MetricSpec, OrderBy, QueryMode, ReportFrame,
    ReportRequest, Rollup, RowFilter, RowFilterOp, SortDirection, TributaryError,
    ROLLUP_PRETTY_LABEL, ROLLUP_SENTINEL,
};

fn metric_names(names: &[&str]) -> Vec<MetricSpec> {
    names.iter().map(|n| MetricSpec::from(*n)).collect()
}

fn dims(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

#[tokio::test]
async fn basic_two_datasource_join_with_totals() {
    let fixture = example_warehouse().await;
    let request = ReportRequest {
        metrics: metric_names(&["revenue", "main_sales_quantity"]),
        dimensions: dims(&["partner_name", "campaign_name"]),
        criteria: vec![Criterion::new(
            "campaign_name",
            CriteriaOp::Neq,
            json!("Campaign 2B"),
        )],
        row_filters: vec![RowFilter::new("revenue", RowFilterOp::Gt, json!(11))],
        rollup: Some(Rollup::Totals),
        ..ReportRequest::default()
    };
    let result = fixture.warehouse.execute(request).await.unwrap();

    // 4 surviving (partner, campaign) pairs plus the totals row.
    assert_eq!(result.rowcount, 5);
    assert_eq!(result.query_summaries.len(), 2);

    let df = &result.df;
    assert_eq!(
        df.value_at(&["Partner A", "Campaign 1A"], "revenue"),
        Some(&json!(12))
    );
    assert_eq!(
        df.value_at(&["Partner B", "Campaign 1B"], "main_sales_quantity"),
        Some(&json!(4))
    );

    // Summing the non-rollup revenue equals the totals row.
    let rollup = result.rollup_rows();
    assert_eq!(rollup.len(), 1);
    assert_eq!(rollup.rows[0].values[df.column_position("revenue").unwrap()], json!(66));
    assert_eq!(
        rollup.rows[0].values[df.column_position("main_sales_quantity").unwrap()],
        json!(9)
    );

    // The sentinel sorts last and displays as the pretty label.
    let last = result.df.rows.last().unwrap();
    assert!(ReportFrame::is_rollup_row(last));
    let display = result.df_display();
    assert_eq!(
        display.rows.last().unwrap().index,
        vec![json!(ROLLUP_PRETTY_LABEL), json!(ROLLUP_PRETTY_LABEL)]
    );
}

#[tokio::test]
async fn generated_sql_joins_and_groups_by_position() {
    let fixture = example_warehouse().await;
    let request = ReportRequest {
        metrics: metric_names(&["revenue"]),
        dimensions: dims(&["partner_name", "campaign_name"]),
        criteria: vec![Criterion::new(
            "campaign_name",
            CriteriaOp::Neq,
            json!("Campaign 2B"),
        )],
        ..ReportRequest::default()
    };
    let result = fixture.warehouse.execute(request).await.unwrap();

    let summary = &result.query_summaries[0];
    assert_eq!(summary.datasource, "testdb1");
    assert!(summary.sql.contains("FROM \"sales\""));
    assert!(summary.sql.contains("LEFT OUTER JOIN \"leads\""));
    assert!(summary.sql.contains("LEFT OUTER JOIN \"campaigns\""));
    assert!(summary.sql.contains("LEFT OUTER JOIN \"partners\""));
    assert!(summary.sql.contains("GROUP BY 1, 2"));
    assert!(summary.sql.contains("(\"campaigns\".\"name\" != 'Campaign 2B')"));
    assert!(summary.sql.contains("SUM(\"sales\".\"revenue\")"));
}

#[tokio::test]
async fn weighted_mean_rollup_matches_expected_values() {
    let fixture = example_warehouse().await;
    let request = ReportRequest {
        metrics: metric_names(&["main_sales_quantity", "revenue_mean", "leads"]),
        dimensions: dims(&["partner_name"]),
        rollup: Some(Rollup::Totals),
        ..ReportRequest::default()
    };
    let result = fixture.warehouse.execute(request).await.unwrap();

    assert_eq!(
        result.df.value_at(&["Partner A"], "revenue_mean"),
        Some(&json!(14.67))
    );
    assert_eq!(
        result.df.value_at(&["Partner B"], "revenue_mean"),
        Some(&json!(17.89))
    );

    let rollup = result.rollup_rows();
    let col = result.df.column_position("revenue_mean").unwrap();
    assert_eq!(rollup.rows[0].values[col], json!(17.08));

    // Counts sum across the post-query rowset.
    let leads_col = result.df.column_position("leads").unwrap();
    assert_eq!(rollup.rows[0].values[leads_col], json!(7));
}

#[tokio::test]
async fn unsupported_grain_fails_before_any_query() {
    let fixture = example_warehouse().await;
    let request = ReportRequest {
        metrics: metric_names(&["leads"]),
        dimensions: dims(&["sale_id"]),
        ..ReportRequest::default()
    };
    let err = fixture.warehouse.execute(request).await.unwrap_err();
    match err {
        TributaryError::UnsupportedGrain(msg) => {
            assert!(msg.contains("sale_id"), "message was: {msg}")
        }
        other => panic!("expected UnsupportedGrain, got {other:?}"),
    }
}

#[tokio::test]
async fn required_grain_is_enforced_for_included_fields() {
    let fixture = example_warehouse().await;
    let request = ReportRequest {
        metrics: metric_names(&["sales"]),
        dimensions: dims(&["partner_name"]),
        ..ReportRequest::default()
    };
    let err = fixture.warehouse.execute(request).await.unwrap_err();
    assert!(matches!(err, TributaryError::UnsupportedGrain(_)));

    let request = ReportRequest {
        metrics: metric_names(&["sales"]),
        dimensions: dims(&["partner_name", "campaign_name"]),
        ..ReportRequest::default()
    };
    let result = fixture.warehouse.execute(request).await.unwrap();
    assert_eq!(
        result.df.value_at(&["Partner A", "Campaign 1A"], "sales"),
        Some(&json!(2))
    );
}

#[tokio::test]
async fn year_criteria_rewrite_to_sargable_ranges() {
    let fixture = example_warehouse().await;
    let request = ReportRequest {
        dimensions: dims(&["campaign_created_at"]),
        criteria: vec![
            Criterion::new("campaign_name", CriteriaOp::Eq, json!("Campaign 2B")),
            Criterion::new("campaign_year", CriteriaOp::Eq, json!(2019)),
        ],
        ..ReportRequest::default()
    };
    let result = fixture.warehouse.execute(request).await.unwrap();

    assert_eq!(result.rowcount, 1);
    assert_eq!(result.df.rows[0].index[0], json!("2019-03-15 10:30:00"));

    let sql = &result.query_summaries[0].sql;
    assert!(
        sql.contains("\"campaigns\".\"created_at\" >= '2019-01-01'"),
        "sql was: {sql}"
    );
    assert!(
        sql.contains("\"campaigns\".\"created_at\" < '2020-01-01'"),
        "sql was: {sql}"
    );
    // The criteria hit the raw column; no conversion function appears.
    assert!(!sql.contains("strftime"), "sql was: {sql}");
}

#[tokio::test]
async fn conversion_dimension_projects_the_formula() {
    let fixture = example_warehouse().await;
    let request = ReportRequest {
        metrics: metric_names(&["revenue"]),
        dimensions: dims(&["campaign_year"]),
        ..ReportRequest::default()
    };
    let result = fixture.warehouse.execute(request).await.unwrap();

    assert_eq!(result.rowcount, 2);
    assert_eq!(result.df.value(&[json!(2019)], "revenue"), Some(&json!(15)));
    assert_eq!(result.df.value(&[json!(2020)], "revenue"), Some(&json!(66)));
}

#[tokio::test]
async fn date_between_criteria_cover_whole_days() {
    let fixture = example_warehouse().await;
    let request = ReportRequest {
        metrics: metric_names(&["leads"]),
        dimensions: dims(&["partner_name"]),
        criteria: vec![Criterion::new(
            "campaign_date",
            CriteriaOp::Between,
            json!(["2020-01-01", "2020-04-30"]),
        )],
        ..ReportRequest::default()
    };
    let result = fixture.warehouse.execute(request).await.unwrap();

    assert_eq!(result.df.value_at(&["Partner A"], "leads"), Some(&json!(3)));
    assert_eq!(result.df.value_at(&["Partner B"], "leads"), Some(&json!(2)));
}

#[tokio::test]
async fn not_in_criteria_use_conjunction() {
    let fixture = example_warehouse().await;
    let request = ReportRequest {
        metrics: metric_names(&["revenue"]),
        dimensions: dims(&["partner_name"]),
        criteria: vec![Criterion::new(
            "campaign_name",
            CriteriaOp::NotIn,
            json!(["Campaign 2B", "Campaign 3B"]),
        )],
        ..ReportRequest::default()
    };
    let result = fixture.warehouse.execute(request).await.unwrap();
    assert_eq!(result.df.value_at(&["Partner A"], "revenue"), Some(&json!(28)));
    assert_eq!(result.df.value_at(&["Partner B"], "revenue"), Some(&json!(20)));
}

#[tokio::test]
async fn null_criteria_emit_is_null() {
    let fixture = example_warehouse().await;
    let request = ReportRequest {
        metrics: metric_names(&["revenue"]),
        dimensions: dims(&["partner_name"]),
        criteria: vec![Criterion::new("campaign_name", CriteriaOp::Eq, json!(null))],
        ..ReportRequest::default()
    };
    let result = fixture.warehouse.execute(request).await.unwrap();
    assert_eq!(result.rowcount, 0);
}

#[tokio::test]
async fn formula_metrics_compute_at_the_combined_layer() {
    let fixture = example_warehouse().await;
    let request = ReportRequest {
        metrics: metric_names(&["rpl"]),
        dimensions: dims(&["partner_name"]),
        ..ReportRequest::default()
    };
    let result = fixture.warehouse.execute(request).await.unwrap();

    // rpl = revenue / leads, computed over columns merged from two
    // datasource queries.
    assert_eq!(result.df.value_at(&["Partner A"], "rpl"), Some(&json!(9.33)));
    assert_eq!(result.df.value_at(&["Partner B"], "rpl"), Some(&json!(13.25)));
}

#[tokio::test]
async fn technicals_apply_per_group() {
    let fixture = example_warehouse().await;
    let request = ReportRequest {
        metrics: metric_names(&["revenue", "revenue_ma_2"]),
        dimensions: dims(&["partner_name", "campaign_name"]),
        ..ReportRequest::default()
    };
    let result = fixture.warehouse.execute(request).await.unwrap();

    // The moving average restarts per partner (group mode).
    assert_eq!(
        result.df.value_at(&["Partner A", "Campaign 2A"], "revenue_ma_2"),
        Some(&json!(14))
    );
    assert_eq!(
        result.df.value_at(&["Partner B", "Campaign 1B"], "revenue_ma_2"),
        Some(&json!(20))
    );
    assert_eq!(
        result.df.value_at(&["Partner B", "Campaign 2B"], "revenue_ma_2"),
        Some(&json!(17.5))
    );
}

#[tokio::test]
async fn multi_level_rollup_and_all() {
    let fixture = example_warehouse().await;
    let request = ReportRequest {
        metrics: metric_names(&["revenue"]),
        dimensions: dims(&["partner_name", "campaign_name"]),
        rollup: Some(Rollup::Levels(1)),
        ..ReportRequest::default()
    };
    let result = fixture.warehouse.execute(request).await.unwrap();
    // 5 base rows plus one subtotal per partner; depth 1 of 2 has no
    // grand total.
    assert_eq!(result.rowcount, 7);
    assert_eq!(
        result
            .df
            .value(&[json!("Partner A"), json!(ROLLUP_SENTINEL)], "revenue"),
        Some(&json!(28))
    );

    let request = ReportRequest {
        metrics: metric_names(&["revenue"]),
        dimensions: dims(&["partner_name", "campaign_name"]),
        rollup: Some(Rollup::All),
        ..ReportRequest::default()
    };
    let result = fixture.warehouse.execute(request).await.unwrap();
    assert_eq!(result.rowcount, 8);
    assert_eq!(
        result
            .df
            .value(&[json!(ROLLUP_SENTINEL), json!(ROLLUP_SENTINEL)], "revenue"),
        Some(&json!(81))
    );
}

#[tokio::test]
async fn pivot_unstacks_dimensions_into_columns() {
    let fixture = example_warehouse().await;
    let request = ReportRequest {
        metrics: metric_names(&["revenue"]),
        dimensions: dims(&["partner_name", "campaign_name"]),
        criteria: vec![Criterion::new(
            "campaign_name",
            CriteriaOp::In,
            json!(["Campaign 1A", "Campaign 1B"]),
        )],
        pivot: dims(&["campaign_name"]),
        ..ReportRequest::default()
    };
    let result = fixture.warehouse.execute(request).await.unwrap();

    assert_eq!(result.df.index_names, vec!["partner_name"]);
    assert!(result.df.columns.contains(&"revenue:Campaign 1A".to_string()));
    assert_eq!(
        result.df.value_at(&["Partner A"], "revenue:Campaign 1A"),
        Some(&json!(12))
    );
    assert_eq!(
        result.df.value_at(&["Partner A"], "revenue:Campaign 1B"),
        Some(&json!(null))
    );
}

#[tokio::test]
async fn order_by_and_limit() {
    let fixture = example_warehouse().await;
    let request = ReportRequest {
        metrics: metric_names(&["revenue"]),
        dimensions: dims(&["campaign_name"]),
        order_by: vec![OrderBy {
            field: "revenue".to_string(),
            direction: SortDirection::Desc,
        }],
        limit: Some(2),
        ..ReportRequest::default()
    };
    let result = fixture.warehouse.execute(request).await.unwrap();
    assert_eq!(result.rowcount, 2);
    assert_eq!(result.df.rows[0].index[0], json!("Campaign 1B"));
    assert_eq!(result.df.rows[0].values[0], json!(20));
}

#[tokio::test]
async fn limit_first_caps_rows_before_rollup() {
    let fixture = example_warehouse().await;
    let request = ReportRequest {
        metrics: metric_names(&["revenue"]),
        dimensions: dims(&["campaign_name"]),
        rollup: Some(Rollup::Totals),
        limit: Some(2),
        limit_first: true,
        ..ReportRequest::default()
    };
    let result = fixture.warehouse.execute(request).await.unwrap();
    // Two underlying rows plus a totals row computed from just those.
    assert_eq!(result.rowcount, 3);
    let rollup = result.rollup_rows();
    assert_eq!(rollup.rows[0].values[0], json!(32));

    let request = ReportRequest {
        metrics: metric_names(&["revenue"]),
        dimensions: dims(&["campaign_name"]),
        rollup: Some(Rollup::Totals),
        limit: Some(2),
        limit_first: false,
        ..ReportRequest::default()
    };
    let result = fixture.warehouse.execute(request).await.unwrap();
    // Limit applies last: the totals row sorts after the kept rows and is
    // trimmed away.
    assert_eq!(result.rowcount, 2);
    assert!(result.rollup_rows().is_empty());
}

#[tokio::test]
async fn dimension_only_reports_use_a_dimension_table_set() {
    let fixture = example_warehouse().await;
    let request = ReportRequest {
        dimensions: dims(&["campaign_name"]),
        ..ReportRequest::default()
    };
    let result = fixture.warehouse.execute(request).await.unwrap();
    assert_eq!(result.rowcount, 5);
    assert_eq!(result.df.rows[0].index[0], json!("Campaign 1A"));
    assert!(result.df.columns.is_empty());
}

#[tokio::test]
async fn adhoc_metrics_are_request_scoped() {
    let fixture = example_warehouse().await;
    let request: ReportRequest = serde_json::from_value(json!({
        "metrics": [
            "revenue",
            {"name": "rpl_adhoc", "formula": "1.0 * {revenue} / {leads}", "rounding": 2}
        ],
        "dimensions": ["partner_name"]
    }))
    .unwrap();
    let result = fixture.warehouse.execute(request).await.unwrap();
    assert_eq!(
        result.df.value_at(&["Partner A"], "rpl_adhoc"),
        Some(&json!(9.33))
    );

    // A later request without the ad-hoc metric cannot see it.
    let request = ReportRequest {
        metrics: metric_names(&["rpl_adhoc"]),
        dimensions: dims(&["partner_name"]),
        ..ReportRequest::default()
    };
    assert!(matches!(
        fixture.warehouse.execute(request).await,
        Err(TributaryError::InvalidField(_))
    ));
}

#[tokio::test]
async fn adhoc_metrics_cannot_shadow_existing_fields() {
    let fixture = example_warehouse().await;
    let request: ReportRequest = serde_json::from_value(json!({
        "metrics": [{"name": "revenue", "formula": "{leads} * 2"}],
        "dimensions": ["partner_name"]
    }))
    .unwrap();
    assert!(matches!(
        fixture.warehouse.execute(request).await,
        Err(TributaryError::InvalidField(_))
    ));
}

#[tokio::test]
async fn adhoc_formulas_reject_statement_keywords() {
    let fixture = example_warehouse().await;
    let request: ReportRequest = serde_json::from_value(json!({
        "metrics": [{"name": "evil", "formula": "DROP TABLE partners"}],
        "dimensions": ["partner_name"]
    }))
    .unwrap();
    assert!(matches!(
        fixture.warehouse.execute(request).await,
        Err(TributaryError::DisallowedSql(_))
    ));
}

#[tokio::test]
async fn criteria_on_formula_fields_are_rejected() {
    let fixture = example_warehouse().await;
    let request = ReportRequest {
        metrics: metric_names(&["revenue"]),
        dimensions: dims(&["partner_name"]),
        criteria: vec![Criterion::new("rpl", CriteriaOp::Gt, json!(1))],
        ..ReportRequest::default()
    };
    assert!(matches!(
        fixture.warehouse.execute(request).await,
        Err(TributaryError::Report(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sequential_timeout_aborts_the_fanout() {
    let engine = EngineConfig {
        query_mode: QueryMode::Sequential,
        query_timeout_ms: Some(10),
        ..EngineConfig::default()
    };
    let fixture = example_warehouse_with_engine(engine).await;
    let slow = slow_datasource(fixture.warehouse.engine()).await;

    let request = ReportRequest {
        metrics: metric_names(&["adhoc_metric", "revenue"]),
        dimensions: dims(&["partner_name"]),
        ..ReportRequest::default()
    };
    let err = fixture
        .warehouse
        .execute_with_adhoc(request, vec![slow])
        .await
        .unwrap_err();
    assert!(matches!(err, TributaryError::QueryTimeout(_)));

    // Connections were released; a normal report still runs.
    let request = ReportRequest {
        metrics: metric_names(&["revenue"]),
        dimensions: dims(&["partner_name"]),
        ..ReportRequest::default()
    };
    let result = fixture.warehouse.execute(request).await.unwrap();
    assert_eq!(result.rowcount, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_timeout_aborts_the_fanout() {
    let engine = EngineConfig {
        query_mode: QueryMode::Parallel,
        query_workers: 2,
        query_timeout_ms: Some(10),
        ..EngineConfig::default()
    };
    let fixture = example_warehouse_with_engine(engine).await;
    let slow = slow_datasource(fixture.warehouse.engine()).await;

    let request = ReportRequest {
        metrics: metric_names(&["adhoc_metric", "revenue"]),
        dimensions: dims(&["partner_name"]),
        ..ReportRequest::default()
    };
    let err = fixture
        .warehouse
        .execute_with_adhoc(request, vec![slow])
        .await
        .unwrap_err();
    assert!(matches!(err, TributaryError::QueryTimeout(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn kill_interrupts_and_the_report_stays_reusable() {
    let fixture = example_warehouse().await;
    let slow = slow_datasource(fixture.warehouse.engine()).await;

    let request = ReportRequest {
        metrics: metric_names(&["adhoc_metric", "revenue"]),
        dimensions: dims(&["partner_name"]),
        ..ReportRequest::default()
    };
    let report = fixture
        .warehouse
        .build_report(request, vec![slow])
        .unwrap();

    let kill = report.kill_handle();
    let killer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        kill.kill();
    });

    let err = report.execute().await.unwrap_err();
    assert!(matches!(err, TributaryError::ExecutionKilled));
    killer.await.unwrap();

    // The same report object re-executes successfully.
    let result = report.execute().await.unwrap();
    assert_eq!(result.rowcount, 2);
    assert!(result
        .df
        .value_at(&["Partner A"], "adhoc_metric")
        .is_some());
}

#[tokio::test]
async fn adhoc_datasources_materialize_literal_rows() {
    use tributary::{AdHocDataSource, AdHocDataTable, SqlType, TableType};

    let fixture = example_warehouse().await;
    let adhoc = AdHocDataSource::new(
        "adhoc_scores",
        vec![AdHocDataTable {
            name: "scores".to_string(),
            table_type: TableType::Metric,
            primary_key: vec!["score_id".to_string()],
            parent: None,
            columns: vec![
                ("score_id".to_string(), SqlType::Integer),
                ("partner_name".to_string(), SqlType::VarChar(Some(50))),
                ("score".to_string(), SqlType::Double),
            ],
            rows: vec![
                vec![json!(1), json!("Partner A"), json!(0.5)],
                vec![json!(2), json!("Partner A"), json!(1.5)],
                vec![json!(3), json!("Partner B"), json!(4.0)],
            ],
        }],
        fixture.warehouse.engine(),
    )
    .await
    .unwrap();

    let request = ReportRequest {
        metrics: metric_names(&["score", "revenue"]),
        dimensions: dims(&["partner_name"]),
        ..ReportRequest::default()
    };
    let result = fixture
        .warehouse
        .execute_with_adhoc(request, vec![adhoc.datasource()])
        .await
        .unwrap();

    // The inferred score metric sums per partner and merges with revenue
    // from the warehouse datasources.
    assert_eq!(result.df.value_at(&["Partner A"], "score"), Some(&json!(2)));
    assert_eq!(result.df.value_at(&["Partner B"], "score"), Some(&json!(4)));
    assert_eq!(result.df.value_at(&["Partner A"], "revenue"), Some(&json!(28)));
}
