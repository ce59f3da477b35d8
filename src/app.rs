use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use ingest_core::models::WorkFn;
use ingest_core::{AppConfig, IngestError, StorageMaintainer};
use ingest_scheduler::{HealthMonitor, SelfHealingScheduler};
use ingest_storage::{BulkWriteEngine, ColumnType, ConnectionPool, StorageMaintenance, TableSchema};

use crate::shutdown::ShutdownManager;

/// 导入域的表结构描述符
pub fn default_table_schemas() -> Vec<TableSchema> {
    vec![
        TableSchema::new(
            "demographic_records",
            &[
                ("zip_code", ColumnType::Text),
                ("city", ColumnType::Text),
                ("state_code", ColumnType::Text),
                ("county", ColumnType::Text),
                ("timezone_id", ColumnType::Integer),
                ("latitude", ColumnType::Real),
                ("longitude", ColumnType::Real),
                ("created_at", ColumnType::Timestamp),
            ],
        ),
        TableSchema::new(
            "phone_numbers",
            &[
                ("npa", ColumnType::Integer),
                ("nxx", ColumnType::Integer),
                ("full_phone", ColumnType::Text),
                ("zip", ColumnType::Text),
                ("state_code", ColumnType::Text),
                ("created_at", ColumnType::Timestamp),
            ],
        ),
        TableSchema::new(
            "records",
            &[
                ("zip", ColumnType::Text),
                ("state_code", ColumnType::Text),
                ("npa", ColumnType::Integer),
                ("nxx", ColumnType::Integer),
            ],
        ),
    ]
}

/// 主应用程序
///
/// 装配连接池、批量写入引擎、存储维护、调度器与健康监控，
/// 并注册标准的批量导入作业。
pub struct Application {
    pool: Arc<ConnectionPool>,
    scheduler: Arc<SelfHealingScheduler>,
    monitor: Arc<HealthMonitor>,
}

impl Application {
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!("初始化批量导入调度系统");

        let pool = ConnectionPool::connect(&config.database)
            .await
            .context("初始化数据库连接池失败")?;

        let schemas = default_table_schemas();
        let engine = Arc::new(BulkWriteEngine::new(
            Arc::clone(&pool),
            schemas.clone(),
            config.bulk.batch_size,
        ));

        let maintenance: Arc<dyn StorageMaintainer> =
            Arc::new(StorageMaintenance::new(Arc::clone(&pool)));

        let scheduler = SelfHealingScheduler::new(config.scheduler.clone());
        let monitor = HealthMonitor::new(Arc::clone(&scheduler), maintenance, &config.scheduler);

        let app = Self {
            pool,
            scheduler,
            monitor,
        };
        app.register_import_job(engine, schemas).await?;
        Ok(app)
    }

    /// 注册标准批量导入作业
    ///
    /// 参数形状：`{"table": "...", "records": [{...}],
    /// "unique_key_columns": ["zip_code"]}`；给出唯一键列时走
    /// 合并写入，否则插入并跳过冲突行。
    async fn register_import_job(
        &self,
        engine: Arc<BulkWriteEngine>,
        schemas: Vec<TableSchema>,
    ) -> Result<()> {
        let schemas: std::collections::HashMap<String, TableSchema> = schemas
            .into_iter()
            .map(|schema| (schema.name.clone(), schema))
            .collect();

        let work: WorkFn = Arc::new(move |params| {
            let engine = Arc::clone(&engine);
            let schemas = schemas.clone();
            Box::pin(async move {
                let table = params
                    .get("table")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        IngestError::Configuration("导入参数缺少 table 字段".to_string())
                    })?
                    .to_string();
                let schema = schemas.get(&table).ok_or_else(|| IngestError::UnknownTable {
                    table: table.clone(),
                })?;

                let rows = params
                    .get("records")
                    .and_then(|v| v.as_array())
                    .ok_or_else(|| {
                        IngestError::Configuration("导入参数缺少 records 数组".to_string())
                    })?;
                let records = rows
                    .iter()
                    .map(|row| schema.record_from_json(row))
                    .collect::<ingest_core::Result<Vec<_>>>()?;

                let key_columns: Vec<String> = params
                    .get("unique_key_columns")
                    .and_then(|v| v.as_array())
                    .map(|cols| {
                        cols.iter()
                            .filter_map(|c| c.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();

                let report = if key_columns.is_empty() {
                    engine.bulk_insert(&table, &records).await?
                } else {
                    let keys: Vec<&str> = key_columns.iter().map(String::as_str).collect();
                    engine.bulk_upsert(&table, &records, &keys).await?
                };

                Ok(serde_json::to_value(report)?)
            })
        });

        self.scheduler
            .register_job("bulk_import", work, None)
            .await?;
        Ok(())
    }

    /// 运行应用直到收到关闭信号
    pub async fn run(&self, shutdown: &ShutdownManager) -> Result<()> {
        let Some(shutdown_tx) = shutdown.sender().await else {
            anyhow::bail!("系统已经关闭，无法启动");
        };
        let mut shutdown_rx = shutdown.subscribe().await;

        let monitor_handles = self.monitor.start(&shutdown_tx);
        drop(shutdown_tx);

        info!("批量导入调度系统已启动");
        let _ = shutdown_rx.recv().await;
        info!("应用收到关闭信号");

        for handle in monitor_handles {
            let _ = handle.await;
        }
        self.scheduler.shutdown().await;
        self.pool.close().await;

        info!("应用已停止");
        Ok(())
    }
}
