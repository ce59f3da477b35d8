use thiserror::Error;

/// 导入调度系统错误类型定义
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("连接池初始化失败: {0}")]
    PoolInit(String),

    #[error("连接池耗尽，等待 {waited_ms}ms 后仍无可用连接")]
    PoolExhausted { waited_ms: u64 },

    #[error("作业未找到: {id}")]
    JobNotFound { id: String },

    #[error("作业正在运行中，拒绝并发执行: {id}")]
    JobAlreadyRunning { id: String },

    // 超时消息格式被下游状态查询依赖，不要改动
    #[error("timeout after {0:?}")]
    ExecutionTimeout(std::time::Duration),

    #[error("批量写入失败，块 {chunk_index}/{chunk_count}: {message}")]
    BulkWrite {
        chunk_index: usize,
        chunk_count: usize,
        message: String,
    },

    #[error("未注册的目标表: {table}")]
    UnknownTable { table: String },

    #[error("并行语句执行失败: {indices:?}")]
    ParallelQuery { indices: Vec<usize> },

    #[error("记录形状不匹配: 表 {table} 期望 {expected} 列，实际 {actual} 列")]
    RecordShape {
        table: String,
        expected: usize,
        actual: usize,
    },

    #[error("作业执行错误: {0}")]
    JobExecution(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),
}

/// 统一的Result类型
pub type Result<T> = std::result::Result<T, IngestError>;
