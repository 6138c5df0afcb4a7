//! Polars engine against real files on disk.

use analytics_gateway::error::GatewayError;
use analytics_gateway::execution::{AnalyticalEngine, ExecutionContext, ExecutionStage, PolarsEngine};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn sales_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("international_sales.csv"),
        "sku,price,region\nA,10.0,EMEA\nB,5.0,EMEA\nC,7.5,APAC\nD,2.5,AMER\n",
    )
    .unwrap();
    dir
}

#[tokio::test]
async fn test_group_by_through_execution_stage() {
    let dir = sales_dir();
    let engine = Arc::new(PolarsEngine::new(dir.path().to_path_buf()));
    let stage = ExecutionStage::new(engine, 100, Duration::from_secs(30));

    let (shown, result) = stage
        .execute("SELECT region, SUM(price) AS total FROM international_sales GROUP BY region ORDER BY region")
        .await
        .unwrap();

    assert!(shown.ends_with("LIMIT 100"));
    assert_eq!(result.columns, vec!["region", "total"]);
    assert_eq!(result.row_count, 3);
    assert!(!result.truncated);
    assert_eq!(result.rows[0], vec![json!("AMER"), json!(2.5)]);
    assert_eq!(result.rows[2], vec![json!("EMEA"), json!(15.0)]);
}

#[tokio::test]
async fn test_ceiling_truncates_real_rows() {
    let dir = sales_dir();
    let engine = Arc::new(PolarsEngine::new(dir.path().to_path_buf()));
    let stage = ExecutionStage::new(engine, 2, Duration::from_secs(30));

    let (shown, result) = stage
        .execute("SELECT sku FROM international_sales ORDER BY sku")
        .await
        .unwrap();

    assert_eq!(shown, "SELECT sku FROM international_sales ORDER BY sku LIMIT 2");
    assert_eq!(result.rows, vec![vec![json!("A")], vec![json!("B")]]);
    assert!(result.truncated);
}

#[tokio::test]
async fn test_unknown_column_is_execution_failure() {
    let dir = sales_dir();
    let engine = Arc::new(PolarsEngine::new(dir.path().to_path_buf()));
    let stage = ExecutionStage::new(engine, 100, Duration::from_secs(30));

    let err = stage
        .execute("SELECT warehouse FROM international_sales")
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::ExecutionFailed(_)));
}

#[tokio::test]
async fn test_engine_refuses_writes_and_reports_health() {
    let dir = sales_dir();
    let engine = PolarsEngine::new(dir.path().to_path_buf());
    assert!(engine.health_check().await.unwrap());

    let err = engine
        .execute("DELETE FROM international_sales", &ExecutionContext::new(100, Duration::from_secs(5)))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::ExecutionFailed(_)));

    let missing = PolarsEngine::new(dir.path().join("missing"));
    assert!(!missing.health_check().await.unwrap());
}
