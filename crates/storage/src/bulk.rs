use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, warn};

use ingest_core::{IngestError, Result};

use crate::pool::{ConnectionPool, DatabaseType, PooledConnection};
use crate::schema::{Record, SqlValue, TableSchema};

/// 批量写入报告
///
/// 底层存储的受影响行数无法区分插入与更新，因此 upsert 的
/// `updated_count` 固定报告为 0，所有受影响行计入 `inserted_count`。
/// 这是已知的精度限制，不是待修复的缺陷。
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BulkWriteReport {
    pub inserted_count: u64,
    pub updated_count: u64,
    pub chunk_count: usize,
}

/// 独立的参数化语句
#[derive(Debug, Clone)]
pub struct SqlStatement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

/// 单条语句的执行结果
#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome {
    pub index: usize,
    pub success: bool,
    pub rows_affected: u64,
    pub error: Option<String>,
}

enum ConflictPolicy<'a> {
    /// 冲突行跳过（ON CONFLICT DO NOTHING）
    Skip,
    /// 按唯一键冲突时覆盖所有非键列
    Overwrite { key_columns: &'a [&'a str] },
}

/// 批量写入引擎
///
/// 把大记录集切成固定大小的块，在单个事务内逐块执行多行
/// 插入/合并语句：任一块失败则整体回滚并上抛，由调用方
/// （作业执行器）决定是否重试整个提交。
pub struct BulkWriteEngine {
    pool: Arc<ConnectionPool>,
    schemas: HashMap<String, TableSchema>,
    batch_size: usize,
}

impl BulkWriteEngine {
    /// 创建引擎；表结构描述符在此一次性登记
    pub fn new(pool: Arc<ConnectionPool>, schemas: Vec<TableSchema>, batch_size: usize) -> Self {
        let schemas = schemas
            .into_iter()
            .map(|schema| (schema.name.clone(), schema))
            .collect();
        Self {
            pool,
            schemas,
            batch_size: batch_size.max(1),
        }
    }

    pub fn with_default_batch(pool: Arc<ConnectionPool>, schemas: Vec<TableSchema>) -> Self {
        Self::new(pool, schemas, 1000)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// 确定性分块：保持输入顺序，最后一块可较短
    pub fn chunk_array<T>(items: &[T], size: usize) -> Vec<&[T]> {
        items.chunks(size.max(1)).collect()
    }

    /// 批量插入，冲突行跳过
    pub async fn bulk_insert(&self, table: &str, records: &[Record]) -> Result<BulkWriteReport> {
        self.write_in_chunks(table, records, ConflictPolicy::Skip)
            .await
    }

    /// 批量合并：按唯一键冲突时用新值覆盖所有非键列（包括 NULL）
    pub async fn bulk_upsert(
        &self,
        table: &str,
        records: &[Record],
        unique_key_columns: &[&str],
    ) -> Result<BulkWriteReport> {
        let schema = self.schema(table)?;
        for key in unique_key_columns {
            if !schema.has_column(key) {
                return Err(IngestError::Configuration(format!(
                    "表 {table} 不存在唯一键列 {key}"
                )));
            }
        }
        self.write_in_chunks(
            table,
            records,
            ConflictPolicy::Overwrite {
                key_columns: unique_key_columns,
            },
        )
        .await
    }

    /// 在同一事务作用域的连接上执行一组独立语句
    ///
    /// 语句按输入顺序下发并各自记录成败；任一语句失败则整个
    /// 事务回滚并返回失败语句的序号集合。
    pub async fn execute_parallel_queries(
        &self,
        queries: &[SqlStatement],
    ) -> Result<Vec<QueryOutcome>> {
        if queries.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.pool.acquire().await?;
        conn.begin().await?;

        let mut outcomes = Vec::with_capacity(queries.len());
        for (index, statement) in queries.iter().enumerate() {
            match conn.execute(&statement.sql, &statement.params).await {
                Ok(rows_affected) => outcomes.push(QueryOutcome {
                    index,
                    success: true,
                    rows_affected,
                    error: None,
                }),
                Err(e) => outcomes.push(QueryOutcome {
                    index,
                    success: false,
                    rows_affected: 0,
                    error: Some(e.to_string()),
                }),
            }
        }

        let failed: Vec<usize> = outcomes
            .iter()
            .filter(|o| !o.success)
            .map(|o| o.index)
            .collect();

        if !failed.is_empty() {
            Self::abort_transaction(&mut conn).await;
            return Err(IngestError::ParallelQuery { indices: failed });
        }

        conn.commit().await.map_err(|e| {
            conn.poison();
            e
        })?;
        Ok(outcomes)
    }

    async fn write_in_chunks(
        &self,
        table: &str,
        records: &[Record],
        policy: ConflictPolicy<'_>,
    ) -> Result<BulkWriteReport> {
        if records.is_empty() {
            return Ok(BulkWriteReport::default());
        }

        let schema = self.schema(table)?;
        let column_count = schema.columns.len();
        for record in records {
            if record.len() != column_count {
                return Err(IngestError::RecordShape {
                    table: table.to_string(),
                    expected: column_count,
                    actual: record.len(),
                });
            }
        }

        let chunks = Self::chunk_array(records, self.batch_size);
        let chunk_count = chunks.len();
        let db_type = self.pool.database_type();

        let mut conn = self.pool.acquire().await?;
        // 跨块单事务：部分导入比导入失败更糟
        conn.begin().await?;

        let mut inserted_count = 0u64;
        for (chunk_index, chunk) in chunks.iter().enumerate() {
            let sql = build_write_sql(schema, chunk.len(), &policy, db_type);
            let params: Vec<SqlValue> = chunk.iter().flatten().cloned().collect();

            match conn.execute(&sql, &params).await {
                Ok(rows) => {
                    inserted_count += rows;
                    debug!(
                        table,
                        chunk = chunk_index + 1,
                        chunks = chunk_count,
                        rows,
                        "块写入完成"
                    );
                }
                Err(e) => {
                    let message = e.to_string();
                    error!(table, chunk = chunk_index + 1, chunks = chunk_count, "块写入失败: {message}");
                    Self::abort_transaction(&mut conn).await;
                    return Err(IngestError::BulkWrite {
                        chunk_index,
                        chunk_count,
                        message,
                    });
                }
            }
        }

        conn.commit().await.map_err(|e| {
            conn.poison();
            e
        })?;

        Ok(BulkWriteReport {
            inserted_count,
            updated_count: 0,
            chunk_count,
        })
    }

    async fn abort_transaction(conn: &mut PooledConnection) {
        if let Err(e) = conn.rollback().await {
            // 回滚失败意味着事务状态未知，该连接不能回池
            conn.poison();
            warn!("事务回滚失败: {e}");
        }
    }

    fn schema(&self, table: &str) -> Result<&TableSchema> {
        self.schemas.get(table).ok_or_else(|| IngestError::UnknownTable {
            table: table.to_string(),
        })
    }
}

fn build_write_sql(
    schema: &TableSchema,
    rows: usize,
    policy: &ConflictPolicy<'_>,
    db_type: DatabaseType,
) -> String {
    let columns = schema.column_names();
    let column_list = columns.join(", ");

    let mut value_groups = Vec::with_capacity(rows);
    let mut position = 1usize;
    for _ in 0..rows {
        let group: Vec<String> = columns
            .iter()
            .map(|_| {
                let placeholder = db_type.placeholder(position);
                position += 1;
                placeholder
            })
            .collect();
        value_groups.push(format!("({})", group.join(", ")));
    }

    let conflict_clause = match policy {
        ConflictPolicy::Skip => "ON CONFLICT DO NOTHING".to_string(),
        ConflictPolicy::Overwrite { key_columns } => {
            let update_set: Vec<String> = columns
                .iter()
                .filter(|col| !key_columns.contains(col))
                .map(|col| format!("{col} = EXCLUDED.{col}"))
                .collect();
            if update_set.is_empty() {
                format!("ON CONFLICT ({}) DO NOTHING", key_columns.join(", "))
            } else {
                format!(
                    "ON CONFLICT ({}) DO UPDATE SET {}",
                    key_columns.join(", "),
                    update_set.join(", ")
                )
            }
        }
    };

    format!(
        "INSERT INTO {} ({}) VALUES {} {}",
        schema.name,
        column_list,
        value_groups.join(", "),
        conflict_clause
    )
}
