use std::sync::Arc;

use tempfile::TempDir;

use ingest_core::config::DatabaseConfig;
use ingest_core::{IndexSpec, StorageMaintainer};
use ingest_storage::{ConnectionPool, StorageMaintenance, StoreConnection};

async fn sqlite_pool(dir: &TempDir) -> Arc<ConnectionPool> {
    let path = dir.path().join("maintenance_test.db");
    let config = DatabaseConfig {
        url: format!("sqlite://{}?mode=rwc", path.display()),
        max_connections: 5,
        connection_timeout_seconds: 5,
        idle_timeout_seconds: 30,
        max_uses_per_connection: 10_000,
        keepalive_idle_seconds: 10,
    };
    ConnectionPool::connect(&config).await.unwrap()
}

async fn exec(pool: &Arc<ConnectionPool>, sql: &str) {
    let mut conn = pool.acquire().await.unwrap();
    conn.execute(sql, &[]).await.unwrap();
}

async fn index_names(pool: &Arc<ConnectionPool>, table: &str) -> Vec<String> {
    let mut conn = pool.acquire().await.unwrap();
    match conn.store().unwrap() {
        StoreConnection::SQLite(sqlite) => sqlx::query_scalar::<_, String>(
            "SELECT name FROM sqlite_master WHERE type = 'index' AND tbl_name = ?",
        )
        .bind(table)
        .fetch_all(&mut *sqlite)
        .await
        .unwrap(),
        _ => unreachable!("测试只使用SQLite"),
    }
}

#[tokio::test]
async fn test_optimize_table_runs_on_existing_table() {
    let dir = tempfile::tempdir().unwrap();
    let pool = sqlite_pool(&dir).await;
    exec(&pool, "CREATE TABLE phone_numbers (npa INTEGER, nxx INTEGER, zip TEXT)").await;

    let maintenance = StorageMaintenance::new(Arc::clone(&pool));
    maintenance.optimize_table("phone_numbers").await.unwrap();
}

#[tokio::test]
async fn test_ensure_indexes_creates_missing_indexes() {
    let dir = tempfile::tempdir().unwrap();
    let pool = sqlite_pool(&dir).await;
    exec(
        &pool,
        "CREATE TABLE phone_numbers (npa INTEGER, nxx INTEGER, zip TEXT, state_code TEXT)",
    )
    .await;

    let maintenance = StorageMaintenance::new(Arc::clone(&pool));
    let specs = vec![
        IndexSpec::new(&["npa", "nxx"]),
        IndexSpec::new(&["zip"]),
    ];
    maintenance
        .ensure_indexes("phone_numbers", &specs)
        .await
        .unwrap();

    let names = index_names(&pool, "phone_numbers").await;
    assert!(names.contains(&"phone_numbers_npa_nxx_idx".to_string()));
    assert!(names.contains(&"phone_numbers_zip_idx".to_string()));

    // 重复执行幂等
    maintenance
        .ensure_indexes("phone_numbers", &specs)
        .await
        .unwrap();
    assert_eq!(index_names(&pool, "phone_numbers").await.len(), 2);
}

#[tokio::test]
async fn test_monitor_performance_degrades_gracefully_on_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let pool = sqlite_pool(&dir).await;
    exec(&pool, "CREATE TABLE records (zip TEXT)").await;

    let maintenance = StorageMaintenance::new(Arc::clone(&pool));
    let report = maintenance.monitor_performance().await.unwrap();

    assert!(report
        .table_sizes
        .iter()
        .any(|stat| stat.table == "records" && stat.size == "n/a"));
    assert!(report.connections.is_empty());
    assert!(report.slow_queries.is_empty());
}
