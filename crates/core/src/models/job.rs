use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::Result;

/// 作业参数包，由调用方（上传控制器等）构造
pub type JobParams = serde_json::Value;

/// 作业工作函数
///
/// 接受参数包，异步返回结果或失败。超时时工作函数只会被放弃，
/// 不会被强制终止，因此工作函数必须自行负责资源清理（可安全放弃）。
pub type WorkFn = Arc<dyn Fn(JobParams) -> BoxFuture<'static, Result<serde_json::Value>> + Send + Sync>;

/// 作业状态
///
/// 状态机：`pending → running → completed`（成功终态），或
/// `running → failed → retrying → running`（受 `max_retries` 限制的循环），
/// 或重试耗尽后由恢复策略决定的终态（`completed`、
/// `manual_intervention_required`，或在 retry/restart 策略下无限重试）。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Retrying,
    ManualInterventionRequired,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Retrying => "retrying",
            JobStatus::ManualInterventionRequired => "manual_intervention_required",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 恢复策略：重试预算耗尽后的处理方式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// 重置重试计数，所有重试间隔翻倍后重新进入执行循环
    Retry,
    /// 清空错误历史，从头重新执行
    Restart,
    /// 调用配置的回退函数，其结果作为作业结果
    Fallback,
    /// 记录到问题日志，等待人工介入；终态，不会自动重试
    Manual,
}

/// 作业优先级（信息性字段，当前不影响调度顺序）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
}

/// 作业注册选项
#[derive(Clone)]
pub struct JobOptions {
    /// 最大重试次数
    pub max_retries: u32,
    /// 重试间隔序列（按惯例为指数退避）
    pub retry_delays: Vec<Duration>,
    /// 单次执行超时
    pub timeout: Duration,
    /// 重试耗尽后的恢复策略
    pub recovery_strategy: RecoveryStrategy,
    /// fallback 策略使用的回退函数
    pub fallback: Option<WorkFn>,
    pub priority: JobPriority,
    /// 依赖的作业 ID（信息性字段，调度器不会阻塞等待）
    pub dependencies: Vec<String>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(5),
                Duration::from_secs(15),
                Duration::from_secs(60),
                Duration::from_secs(300),
            ],
            timeout: Duration::from_secs(300),
            recovery_strategy: RecoveryStrategy::Retry,
            fallback: None,
            priority: JobPriority::Normal,
            dependencies: Vec::new(),
        }
    }
}

impl fmt::Debug for JobOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobOptions")
            .field("max_retries", &self.max_retries)
            .field("retry_delays", &self.retry_delays)
            .field("timeout", &self.timeout)
            .field("recovery_strategy", &self.recovery_strategy)
            .field("fallback", &self.fallback.is_some())
            .field("priority", &self.priority)
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

/// 错误历史记录项
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// 作业描述符
///
/// 仅存在于进程内存，由同一进程的执行器和失败处理器修改，
/// 注册后不会被删除；重试耗尽的作业同时进入失败作业表。
#[derive(Clone)]
pub struct Job {
    pub id: String,
    pub work: WorkFn,
    pub options: JobOptions,
    pub status: JobStatus,
    pub retry_count: u32,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub error_history: Vec<ErrorRecord>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: String, work: WorkFn, options: JobOptions) -> Self {
        Self {
            id,
            work,
            options,
            status: JobStatus::Pending,
            retry_count: 0,
            last_run: None,
            next_run: None,
            error_history: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id.clone(),
            status: self.status,
            last_run: self.last_run,
            next_run: self.next_run,
            retry_count: self.retry_count,
            priority: self.options.priority,
            error_history: self.error_history.clone(),
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("retry_count", &self.retry_count)
            .field("last_run", &self.last_run)
            .field("next_run", &self.next_run)
            .finish()
    }
}

/// 作业状态快照，状态查询接口的返回值
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: String,
    pub status: JobStatus,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub priority: JobPriority,
    pub error_history: Vec<ErrorRecord>,
}

/// 失败作业表条目
///
/// 重试耗尽的作业以最后一次错误和捕获的参数进入该表，
/// 由健康监控的恢复扫描处理，只有恢复成功才会移除。
#[derive(Debug, Clone, Serialize)]
pub struct FailedJobEntry {
    pub job_id: String,
    pub error: String,
    pub params: JobParams,
    pub timestamp: DateTime<Utc>,
}

/// 人工介入问题记录，追加到问题日志
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueRecord {
    pub job_id: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
    pub status: String,
}

impl IssueRecord {
    pub fn manual_intervention(job_id: &str, error: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            error: error.to_string(),
            timestamp: Utc::now(),
            status: "requires_manual_intervention".to_string(),
        }
    }
}

/// `execute_job` 的立即返回值
///
/// 重试和恢复都是后台调度（fire-and-forget），调用方通过状态查询
/// 观察最终结果，而不是阻塞在本次调用上。
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Completed {
        result: serde_json::Value,
    },
    Retrying {
        retry_count: u32,
        next_retry: DateTime<Utc>,
    },
    Failed {
        error: String,
    },
    ManualInterventionRequired {
        issue: IssueRecord,
    },
}

impl ExecutionOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, ExecutionOutcome::Completed { .. })
    }
}
