use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use ingest_core::config::SchedulerConfig;
use ingest_core::models::{
    ErrorRecord, ExecutionOutcome, FailedJobEntry, IssueRecord, Job, JobOptions, JobParams,
    JobSnapshot, JobStatus, RecoveryStrategy, WorkFn,
};
use ingest_core::{IngestError, Result};

use crate::journal::RollingJournal;

/// 按状态分类的作业计数
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct JobCounts {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub retrying: usize,
    pub manual_intervention_required: usize,
}

/// 失败处理的内部决策，在锁内计算、锁外执行
enum FailureDecision {
    Retry {
        retry_count: u32,
        delay: Duration,
        next_retry: DateTime<Utc>,
    },
    Recover {
        strategy: RecoveryStrategy,
        fallback: Option<WorkFn>,
    },
}

/// 自愈式作业调度器
///
/// 进程内作业注册表加执行器：带超时的单飞执行、指数退避重试、
/// 重试耗尽后的四种恢复策略。所有重试和恢复都是后台调度，
/// 定时任务统一挂在调度器持有的 `JoinSet` 上，关闭时一并取消。
pub struct SelfHealingScheduler {
    jobs: RwLock<HashMap<String, Job>>,
    failed_jobs: RwLock<HashMap<String, FailedJobEntry>>,
    retry_tasks: Mutex<JoinSet<()>>,
    issue_journal: RollingJournal,
    config: SchedulerConfig,
}

impl SelfHealingScheduler {
    pub fn new(config: SchedulerConfig) -> Arc<Self> {
        let issue_journal = RollingJournal::new(
            Path::new(&config.journal_dir).join("issues.json"),
            config.journal_cap,
        );

        Arc::new(Self {
            jobs: RwLock::new(HashMap::new()),
            failed_jobs: RwLock::new(HashMap::new()),
            retry_tasks: Mutex::new(JoinSet::new()),
            issue_journal,
            config,
        })
    }

    pub fn issue_journal(&self) -> &RollingJournal {
        &self.issue_journal
    }

    /// 配置派生的注册默认值
    fn default_options(&self) -> JobOptions {
        JobOptions {
            max_retries: self.config.default_max_retries,
            retry_delays: self
                .config
                .default_retry_delays_seconds
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
            timeout: Duration::from_secs(self.config.default_timeout_seconds),
            ..JobOptions::default()
        }
    }

    /// 注册作业；重复注册同一 ID 覆盖旧定义
    pub async fn register_job(
        &self,
        job_id: &str,
        work: WorkFn,
        options: Option<JobOptions>,
    ) -> Result<String> {
        let options = options.unwrap_or_else(|| self.default_options());
        if options.retry_delays.is_empty() {
            return Err(IngestError::Configuration(format!(
                "作业 {job_id} 的重试间隔序列不能为空"
            )));
        }

        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(job_id) {
            warn!(job_id, "作业已存在，覆盖注册");
        }
        jobs.insert(job_id.to_string(), Job::new(job_id.to_string(), work, options));

        info!(job_id, "作业注册完成");
        Ok(job_id.to_string())
    }

    /// 执行作业
    ///
    /// 同一作业同一时刻只允许一次执行，已在运行时直接拒绝。
    /// 失败走重试/恢复路径，本次调用立即返回调度结果，
    /// 最终结果通过状态查询观察。
    pub async fn execute_job(
        self: &Arc<Self>,
        job_id: &str,
        params: JobParams,
    ) -> Result<ExecutionOutcome> {
        let (work, timeout) = {
            let mut jobs = self.jobs.write().await;
            let job = jobs.get_mut(job_id).ok_or_else(|| IngestError::JobNotFound {
                id: job_id.to_string(),
            })?;

            if job.status == JobStatus::Running {
                return Err(IngestError::JobAlreadyRunning {
                    id: job_id.to_string(),
                });
            }

            job.status = JobStatus::Running;
            job.last_run = Some(Utc::now());
            job.next_run = None;
            (job.work.clone(), job.options.timeout)
        };

        info!(job_id, "开始执行作业");

        // 工作函数在锁外执行，超时只放弃等待，不强制终止工作函数
        match tokio::time::timeout(timeout, (work)(params.clone())).await {
            Ok(Ok(result)) => {
                {
                    let mut jobs = self.jobs.write().await;
                    if let Some(job) = jobs.get_mut(job_id) {
                        job.status = JobStatus::Completed;
                        job.retry_count = 0;
                        job.error_history.clear();
                    }
                }
                self.failed_jobs.write().await.remove(job_id);
                info!(job_id, "作业执行成功");
                Ok(ExecutionOutcome::Completed { result })
            }
            Ok(Err(e)) => {
                let message = e.to_string();
                warn!(job_id, "作业执行失败: {message}");
                self.handle_failure(job_id, message, params).await
            }
            Err(_) => {
                let message = IngestError::ExecutionTimeout(timeout).to_string();
                warn!(job_id, "作业超时: {message}");
                self.handle_failure(job_id, message, params).await
            }
        }
    }

    /// 失败处理：重试预算内按退避序列调度重试，耗尽后应用恢复策略
    async fn handle_failure(
        self: &Arc<Self>,
        job_id: &str,
        message: String,
        params: JobParams,
    ) -> Result<ExecutionOutcome> {
        let decision = {
            let mut jobs = self.jobs.write().await;
            let job = jobs.get_mut(job_id).ok_or_else(|| IngestError::JobNotFound {
                id: job_id.to_string(),
            })?;

            job.error_history.push(ErrorRecord {
                timestamp: Utc::now(),
                message: message.clone(),
            });

            if job.retry_count < job.options.max_retries {
                job.retry_count += 1;
                job.status = JobStatus::Retrying;

                // 超出序列长度的重试沿用最后一个间隔
                let index = std::cmp::min(
                    job.retry_count as usize - 1,
                    job.options.retry_delays.len() - 1,
                );
                let delay = job.options.retry_delays[index];
                let next_retry = Utc::now()
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1_000));
                job.next_run = Some(next_retry);

                FailureDecision::Retry {
                    retry_count: job.retry_count,
                    delay,
                    next_retry,
                }
            } else {
                job.status = JobStatus::Failed;
                FailureDecision::Recover {
                    strategy: job.options.recovery_strategy,
                    fallback: job.options.fallback.clone(),
                }
            }
        };

        match decision {
            FailureDecision::Retry {
                retry_count,
                delay,
                next_retry,
            } => {
                info!(
                    job_id,
                    retry_count,
                    delay_secs = delay.as_secs(),
                    "调度重试"
                );
                self.spawn_reentry(job_id.to_string(), params, delay).await;
                Ok(ExecutionOutcome::Retrying {
                    retry_count,
                    next_retry,
                })
            }
            FailureDecision::Recover { strategy, fallback } => {
                warn!(job_id, strategy = ?strategy, "重试预算耗尽，应用恢复策略");
                {
                    let mut failed = self.failed_jobs.write().await;
                    failed.insert(
                        job_id.to_string(),
                        FailedJobEntry {
                            job_id: job_id.to_string(),
                            error: message.clone(),
                            params: params.clone(),
                            timestamp: Utc::now(),
                        },
                    );
                }
                self.apply_recovery(job_id, strategy, fallback, message, params)
                    .await
            }
        }
    }

    async fn apply_recovery(
        self: &Arc<Self>,
        job_id: &str,
        strategy: RecoveryStrategy,
        fallback: Option<WorkFn>,
        error_message: String,
        params: JobParams,
    ) -> Result<ExecutionOutcome> {
        match strategy {
            RecoveryStrategy::Retry => {
                let next_retry = Utc::now();
                {
                    let mut jobs = self.jobs.write().await;
                    if let Some(job) = jobs.get_mut(job_id) {
                        job.retry_count = 0;
                        job.status = JobStatus::Retrying;
                        job.next_run = Some(next_retry);
                        // 间隔翻倍：每轮恢复让退避整体变慢一倍
                        job.options.retry_delays =
                            job.options.retry_delays.iter().map(|d| *d * 2).collect();
                    }
                }
                info!(job_id, "恢复策略 retry：重置计数并翻倍退避间隔");
                self.spawn_reentry(job_id.to_string(), params, Duration::ZERO)
                    .await;
                Ok(ExecutionOutcome::Retrying {
                    retry_count: 0,
                    next_retry,
                })
            }
            RecoveryStrategy::Restart => {
                let next_retry = Utc::now();
                {
                    let mut jobs = self.jobs.write().await;
                    if let Some(job) = jobs.get_mut(job_id) {
                        job.retry_count = 0;
                        job.error_history.clear();
                        job.status = JobStatus::Pending;
                        job.next_run = Some(next_retry);
                    }
                }
                info!(job_id, "恢复策略 restart：清空历史从头执行");
                self.spawn_reentry(job_id.to_string(), params, Duration::ZERO)
                    .await;
                Ok(ExecutionOutcome::Retrying {
                    retry_count: 0,
                    next_retry,
                })
            }
            RecoveryStrategy::Fallback => match fallback {
                Some(fallback_fn) => {
                    info!(job_id, "恢复策略 fallback：执行回退函数");
                    match (fallback_fn)(params).await {
                        Ok(result) => {
                            {
                                let mut jobs = self.jobs.write().await;
                                if let Some(job) = jobs.get_mut(job_id) {
                                    job.status = JobStatus::Completed;
                                }
                            }
                            self.failed_jobs.write().await.remove(job_id);
                            info!(job_id, "回退函数执行成功");
                            Ok(ExecutionOutcome::Completed { result })
                        }
                        Err(e) => {
                            let fallback_error = e.to_string();
                            error!(job_id, "回退函数执行失败: {fallback_error}");
                            Ok(ExecutionOutcome::Failed {
                                error: fallback_error,
                            })
                        }
                    }
                }
                None => {
                    warn!(job_id, "恢复策略 fallback 但未配置回退函数");
                    Ok(ExecutionOutcome::Failed {
                        error: "no fallback function available".to_string(),
                    })
                }
            },
            RecoveryStrategy::Manual => {
                let issue = IssueRecord::manual_intervention(job_id, &error_message);
                if let Err(e) = self.issue_journal.append(&issue).await {
                    error!(job_id, "问题日志写入失败: {e}");
                }
                {
                    let mut jobs = self.jobs.write().await;
                    if let Some(job) = jobs.get_mut(job_id) {
                        job.status = JobStatus::ManualInterventionRequired;
                    }
                }
                warn!(job_id, "作业需要人工介入");
                Ok(ExecutionOutcome::ManualInterventionRequired { issue })
            }
        }
    }

    /// 延迟重入执行，挂到调度器的定时任务集上
    async fn spawn_reentry(self: &Arc<Self>, job_id: String, params: JobParams, delay: Duration) {
        let reentry = self.reenter(job_id, params);
        let mut tasks = self.retry_tasks.lock().await;
        // JoinSet 会保留已完成的任务直到被 join，先回收再挂新任务，
        // 任务集里只留在途的重试
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            reentry.await;
        });
    }

    /// 装箱的重入 future，打断 `execute_job` 的递归类型
    fn reenter(self: &Arc<Self>, job_id: String, params: JobParams) -> BoxFuture<'static, ()> {
        let scheduler = Arc::clone(self);
        Box::pin(async move {
            match scheduler.execute_job(&job_id, params).await {
                Ok(outcome) => debug!(job_id = %job_id, outcome = ?outcome, "重入执行完成"),
                Err(e) => error!(job_id = %job_id, "重入执行失败: {e}"),
            }
        })
    }

    pub async fn _pending_retry_tasks(&self) -> usize {
        self.retry_tasks.lock().await.len()
    }

    pub async fn get_job_status(&self, job_id: &str) -> Option<JobSnapshot> {
        self.jobs.read().await.get(job_id).map(Job::snapshot)
    }

    pub async fn get_all_jobs(&self) -> Vec<JobSnapshot> {
        self.jobs.read().await.values().map(Job::snapshot).collect()
    }

    pub async fn get_failed_jobs(&self) -> Vec<FailedJobEntry> {
        self.failed_jobs.read().await.values().cloned().collect()
    }

    pub async fn job_counts(&self) -> JobCounts {
        let jobs = self.jobs.read().await;
        let mut counts = JobCounts {
            total: jobs.len(),
            ..JobCounts::default()
        };
        for job in jobs.values() {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Running => counts.running += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
                JobStatus::Retrying => counts.retrying += 1,
                JobStatus::ManualInterventionRequired => {
                    counts.manual_intervention_required += 1
                }
            }
        }
        counts
    }

    /// 检测卡死作业：running 状态持续超过阈值
    pub async fn detect_stuck_jobs(&self, threshold: Duration) -> Vec<String> {
        let threshold = chrono::Duration::from_std(threshold)
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1_000));
        let now = Utc::now();

        self.jobs
            .read()
            .await
            .values()
            .filter(|job| {
                job.status == JobStatus::Running
                    && job
                        .last_run
                        .map(|started| now - started > threshold)
                        .unwrap_or(false)
            })
            .map(|job| job.id.clone())
            .collect()
    }

    /// 强制复位卡死作业并延迟重新执行
    ///
    /// 原执行仍可能在后台收尾，复位只修正注册表状态；
    /// 延迟重入给原执行留出让出的窗口。
    pub async fn reset_stuck_job(self: &Arc<Self>, job_id: &str, restart_delay: Duration) -> Result<()> {
        {
            let mut jobs = self.jobs.write().await;
            let job = jobs.get_mut(job_id).ok_or_else(|| IngestError::JobNotFound {
                id: job_id.to_string(),
            })?;
            job.status = JobStatus::Pending;
            job.retry_count = 0;
        }

        warn!(job_id, "检测到卡死作业，已复位并调度重新执行");
        self.spawn_reentry(job_id.to_string(), serde_json::Value::Null, restart_delay)
            .await;
        Ok(())
    }

    /// 失败作业恢复扫描
    ///
    /// 逐个重新执行失败作业表里的条目（使用失败时捕获的参数），
    /// 成功的移出失败表；需要人工介入的作业绝不自动重试。
    pub async fn recover_failed_jobs(self: &Arc<Self>) -> usize {
        let entries = self.get_failed_jobs().await;
        if entries.is_empty() {
            return 0;
        }

        info!(count = entries.len(), "开始失败作业恢复扫描");
        let mut recovered = 0usize;

        for entry in entries {
            let manual = {
                let jobs = self.jobs.read().await;
                jobs.get(&entry.job_id)
                    .map(|job| job.status == JobStatus::ManualInterventionRequired)
                    .unwrap_or(false)
            };
            if manual {
                debug!(job_id = %entry.job_id, "等待人工介入，跳过自动恢复");
                continue;
            }

            match self.execute_job(&entry.job_id, entry.params.clone()).await {
                Ok(outcome) if outcome.is_completed() => {
                    self.failed_jobs.write().await.remove(&entry.job_id);
                    info!(job_id = %entry.job_id, "失败作业恢复成功");
                    recovered += 1;
                }
                Ok(_) => {}
                Err(e) => warn!(job_id = %entry.job_id, "失败作业恢复尝试未能执行: {e}"),
            }
        }

        recovered
    }

    /// 关闭调度器：取消所有待执行的重试与恢复定时任务
    pub async fn shutdown(&self) {
        let mut tasks = self.retry_tasks.lock().await;
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
        info!("调度器已关闭，待执行的重试任务已取消");
    }
}
