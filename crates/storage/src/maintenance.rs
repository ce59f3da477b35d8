use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use ingest_core::{IndexSpec, Result, StorageMaintainer};

use crate::pool::{ConnectionPool, DatabaseType, StoreConnection};

/// 连接状态统计
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStat {
    pub state: String,
    pub application_name: String,
    pub count: i64,
}

/// 慢查询统计
#[derive(Debug, Clone, Serialize)]
pub struct SlowQueryStat {
    pub query: String,
    pub calls: i64,
    pub mean_time_ms: f64,
}

/// 表大小统计
#[derive(Debug, Clone, Serialize)]
pub struct TableSizeStat {
    pub table: String,
    pub size: String,
}

/// 性能诊断报告（尽力而为：诊断能力缺失时降级而不报错）
#[derive(Debug, Default, Serialize)]
pub struct PerformanceReport {
    pub connections: Vec<ConnectionStat>,
    pub slow_queries: Vec<SlowQueryStat>,
    pub table_sizes: Vec<TableSizeStat>,
    pub pool: crate::pool::PoolStats,
}

/// 存储维护服务
///
/// 每日维护扫描通过 `StorageMaintainer` 接口调用这里的
/// 统计刷新、空间回收、索引重建与缺失索引补建。
pub struct StorageMaintenance {
    pool: Arc<ConnectionPool>,
}

impl StorageMaintenance {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    /// 性能监控：活跃连接、慢查询、表大小
    ///
    /// 各项诊断单独尽力获取；扩展诊断不可用（如缺少
    /// pg_stat_statements）时对应项留空，绝不让调用方失败。
    pub async fn monitor_performance(&self) -> Result<PerformanceReport> {
        let mut conn = self.pool.acquire().await?;
        let mut report = PerformanceReport {
            pool: self.pool.stats(),
            ..PerformanceReport::default()
        };

        match conn.store()? {
            StoreConnection::PostgreSQL(pg) => {
                match sqlx::query_as::<_, (String, String, i64)>(
                    "SELECT COALESCE(state, ''), COALESCE(application_name, ''), count(*) \
                     FROM pg_stat_activity WHERE state IS NOT NULL \
                     GROUP BY 1, 2 ORDER BY 3 DESC",
                )
                .fetch_all(&mut *pg)
                .await
                {
                    Ok(rows) => {
                        report.connections = rows
                            .into_iter()
                            .map(|(state, application_name, count)| ConnectionStat {
                                state,
                                application_name,
                                count,
                            })
                            .collect();
                    }
                    Err(e) => warn!("获取活跃连接统计失败: {e}"),
                }

                match sqlx::query_as::<_, (String, i64, f64)>(
                    "SELECT query, calls, mean_exec_time FROM pg_stat_statements \
                     ORDER BY mean_exec_time DESC LIMIT 10",
                )
                .fetch_all(&mut *pg)
                .await
                {
                    Ok(rows) => {
                        report.slow_queries = rows
                            .into_iter()
                            .map(|(query, calls, mean_time_ms)| SlowQueryStat {
                                query,
                                calls,
                                mean_time_ms,
                            })
                            .collect();
                    }
                    Err(_) => {
                        debug!("pg_stat_statements 扩展不可用，跳过慢查询监控");
                    }
                }

                match sqlx::query_as::<_, (String, String)>(
                    "SELECT tablename, \
                     pg_size_pretty(pg_total_relation_size(schemaname||'.'||tablename)) \
                     FROM pg_tables \
                     WHERE schemaname NOT IN ('information_schema', 'pg_catalog') \
                     ORDER BY pg_total_relation_size(schemaname||'.'||tablename) DESC LIMIT 10",
                )
                .fetch_all(&mut *pg)
                .await
                {
                    Ok(rows) => {
                        report.table_sizes = rows
                            .into_iter()
                            .map(|(table, size)| TableSizeStat { table, size })
                            .collect();
                    }
                    Err(e) => warn!("获取表大小统计失败: {e}"),
                }
            }
            StoreConnection::SQLite(sqlite) => {
                // SQLite 没有对应的统计视图，降级为表清单加池内统计
                match sqlx::query_as::<_, (String,)>(
                    "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
                )
                .fetch_all(&mut *sqlite)
                .await
                {
                    Ok(rows) => {
                        report.table_sizes = rows
                            .into_iter()
                            .map(|(table,)| TableSizeStat {
                                table,
                                size: "n/a".to_string(),
                            })
                            .collect();
                    }
                    Err(e) => warn!("获取SQLite表清单失败: {e}"),
                }
            }
        }

        Ok(report)
    }
}

#[async_trait]
impl StorageMaintainer for StorageMaintenance {
    /// 刷新统计信息、回收空间并重建已有索引
    ///
    /// 单表内的步骤顺序执行，任一步骤失败上抛，由健康监控
    /// 决定容忍；这里不做吞错。
    async fn optimize_table(&self, table: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        info!(table, "开始表维护");

        let statements: Vec<String> = match self.pool.database_type() {
            DatabaseType::PostgreSQL => vec![
                format!("ANALYZE {table}"),
                format!("VACUUM {table}"),
                format!("REINDEX TABLE {table}"),
            ],
            // SQLite 的 VACUUM 只能整库执行，用增量回收代替按表回收
            DatabaseType::SQLite => vec![
                format!("ANALYZE {table}"),
                "PRAGMA incremental_vacuum".to_string(),
                format!("REINDEX {table}"),
            ],
        };

        for sql in &statements {
            if let Err(e) = conn.execute(sql, &[]).await {
                warn!(table, sql = %sql, "维护语句执行失败: {e}");
                return Err(e);
            }
        }

        info!(table, "表维护完成");
        Ok(())
    }

    /// 按索引规格补建缺失索引
    ///
    /// 单个索引失败只记录警告，不中断其余索引的创建。
    async fn ensure_indexes(&self, table: &str, indexes: &[IndexSpec]) -> Result<()> {
        let mut conn = self.pool.acquire().await?;

        for spec in indexes {
            let index_name = spec.index_name(table);
            let sql = format!(
                "CREATE INDEX IF NOT EXISTS {index_name} ON {table} ({})",
                spec.columns.join(", ")
            );

            match conn.execute(&sql, &[]).await {
                Ok(_) => debug!(table, index = %index_name, "索引就绪"),
                Err(e) => warn!(table, index = %index_name, "索引创建失败: {e}"),
            }
        }

        Ok(())
    }
}
