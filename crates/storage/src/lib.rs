pub mod bulk;
pub mod maintenance;
pub mod pool;
pub mod schema;

pub use bulk::{BulkWriteEngine, BulkWriteReport, QueryOutcome, SqlStatement};
pub use maintenance::{PerformanceReport, StorageMaintenance};
pub use pool::{ConnectionPool, DatabaseType, PoolStats, PooledConnection, StoreConnection};
pub use schema::{ColumnSpec, ColumnType, Record, SqlValue, TableSchema};
