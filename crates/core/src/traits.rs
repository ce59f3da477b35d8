use async_trait::async_trait;
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::Result;

/// 索引规格：目标表上的一组索引列
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexSpec {
    pub columns: Vec<String>,
}

impl IndexSpec {
    pub fn new(columns: &[&str]) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
        }
    }

    /// 索引命名约定：`{table}_{col1}_{col2}_idx`
    pub fn index_name(&self, table: &str) -> String {
        format!("{}_{}_idx", table, self.columns.join("_"))
    }
}

/// 存储维护接口
///
/// 健康监控的每日维护扫描通过该接口触发统计刷新、空间回收、
/// 索引重建以及缺失索引的补建，调度器不直接依赖具体存储实现。
#[automock]
#[async_trait]
pub trait StorageMaintainer: Send + Sync {
    /// 刷新统计信息、回收空间并重建已有索引
    async fn optimize_table(&self, table: &str) -> Result<()>;

    /// 按索引规格补建缺失索引，单个索引失败不中断其余索引
    async fn ensure_indexes(&self, table: &str, indexes: &[IndexSpec]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_name_convention() {
        let spec = IndexSpec::new(&["zip_code", "state_code"]);
        assert_eq!(
            spec.index_name("demographic_records"),
            "demographic_records_zip_code_state_code_idx"
        );
    }
}
