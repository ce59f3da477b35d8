use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sysinfo::{MemoryRefreshKind, RefreshKind, System};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use ingest_core::config::SchedulerConfig;
use ingest_core::{IndexSpec, Result, StorageMaintainer};

use crate::journal::RollingJournal;
use crate::scheduler::{JobCounts, SelfHealingScheduler};

/// 卡死作业复位后延迟多久重新执行
const STUCK_RESTART_DELAY: Duration = Duration::from_secs(1);

/// 进程与系统资源快照
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SystemStats {
    pub used_memory_bytes: u64,
    pub total_memory_bytes: u64,
    pub memory_usage_percent: f32,
    pub uptime_seconds: u64,
}

/// 健康检查快照，追加到健康日志
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub timestamp: DateTime<Utc>,
    pub jobs: JobCounts,
    pub failed_jobs: usize,
    pub stuck_jobs: Vec<String>,
    pub system: SystemStats,
}

/// 每日维护扫描的单个目标表
#[derive(Debug, Clone)]
pub struct MaintenanceTarget {
    pub table: String,
    pub indexes: Vec<IndexSpec>,
}

impl MaintenanceTarget {
    pub fn new(table: &str, indexes: Vec<IndexSpec>) -> Self {
        Self {
            table: table.to_string(),
            indexes,
        }
    }
}

/// 导入域三张主表的静态索引目录
pub fn default_maintenance_targets() -> Vec<MaintenanceTarget> {
    vec![
        MaintenanceTarget::new(
            "demographic_records",
            vec![
                IndexSpec::new(&["zip_code"]),
                IndexSpec::new(&["state_code"]),
                IndexSpec::new(&["timezone_id"]),
                IndexSpec::new(&["zip_code", "state_code"]),
                IndexSpec::new(&["created_at"]),
            ],
        ),
        MaintenanceTarget::new(
            "phone_numbers",
            vec![
                IndexSpec::new(&["npa", "nxx"]),
                IndexSpec::new(&["zip"]),
                IndexSpec::new(&["state_code"]),
                IndexSpec::new(&["created_at"]),
            ],
        ),
        MaintenanceTarget::new(
            "records",
            vec![
                IndexSpec::new(&["zip"]),
                IndexSpec::new(&["state_code"]),
                IndexSpec::new(&["npa", "nxx"]),
            ],
        ),
    ]
}

/// 健康监控
///
/// 三个独立的周期扫描：健康检查（含卡死作业检测）、失败作业
/// 恢复、每日存储维护。每个扫描监听关闭信号，单轮失败记录
/// 日志后继续下一轮。
pub struct HealthMonitor {
    scheduler: Arc<SelfHealingScheduler>,
    maintainer: Arc<dyn StorageMaintainer>,
    targets: Vec<MaintenanceTarget>,
    health_journal: RollingJournal,
    health_check_interval: Duration,
    recovery_sweep_interval: Duration,
    maintenance_interval: Duration,
    stuck_threshold: Duration,
    start_time: Instant,
    system: Mutex<System>,
}

impl HealthMonitor {
    pub fn new(
        scheduler: Arc<SelfHealingScheduler>,
        maintainer: Arc<dyn StorageMaintainer>,
        config: &SchedulerConfig,
    ) -> Arc<Self> {
        Self::with_targets(scheduler, maintainer, config, default_maintenance_targets())
    }

    pub fn with_targets(
        scheduler: Arc<SelfHealingScheduler>,
        maintainer: Arc<dyn StorageMaintainer>,
        config: &SchedulerConfig,
        targets: Vec<MaintenanceTarget>,
    ) -> Arc<Self> {
        let health_journal = RollingJournal::new(
            Path::new(&config.journal_dir).join("health.json"),
            config.journal_cap,
        );

        Arc::new(Self {
            scheduler,
            maintainer,
            targets,
            health_journal,
            health_check_interval: Duration::from_secs(config.health_check_interval_seconds),
            recovery_sweep_interval: Duration::from_secs(config.recovery_sweep_interval_seconds),
            maintenance_interval: Duration::from_secs(config.maintenance_interval_seconds),
            stuck_threshold: Duration::from_secs(config.stuck_threshold_seconds),
            start_time: Instant::now(),
            system: Mutex::new(System::new_with_specifics(
                RefreshKind::nothing().with_memory(MemoryRefreshKind::everything()),
            )),
        })
    }

    pub fn health_journal(&self) -> &RollingJournal {
        &self.health_journal
    }

    /// 启动三个周期扫描，返回任务句柄供关闭时等待
    pub fn start(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        info!(
            health_secs = self.health_check_interval.as_secs(),
            recovery_secs = self.recovery_sweep_interval.as_secs(),
            maintenance_secs = self.maintenance_interval.as_secs(),
            "健康监控启动"
        );

        let health = {
            let monitor = Arc::clone(self);
            let mut rx = shutdown.subscribe();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(monitor.health_check_interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = monitor.perform_health_check().await {
                                error!("健康检查失败: {e}");
                            }
                        }
                        _ = rx.recv() => {
                            info!("健康检查扫描收到关闭信号");
                            break;
                        }
                    }
                }
            })
        };

        let recovery = {
            let monitor = Arc::clone(self);
            let mut rx = shutdown.subscribe();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(monitor.recovery_sweep_interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let recovered = monitor.run_recovery_sweep().await;
                            if recovered > 0 {
                                info!(recovered, "失败作业恢复扫描完成");
                            }
                        }
                        _ = rx.recv() => {
                            info!("失败作业恢复扫描收到关闭信号");
                            break;
                        }
                    }
                }
            })
        };

        let maintenance = {
            let monitor = Arc::clone(self);
            let mut rx = shutdown.subscribe();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(monitor.maintenance_interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            monitor.run_maintenance_sweep().await;
                        }
                        _ = rx.recv() => {
                            info!("存储维护扫描收到关闭信号");
                            break;
                        }
                    }
                }
            })
        };

        vec![health, recovery, maintenance]
    }

    /// 健康检查：统计作业状态、检测并复位卡死作业、记录资源快照
    pub async fn perform_health_check(&self) -> Result<HealthSnapshot> {
        let jobs = self.scheduler.job_counts().await;
        let failed_jobs = self.scheduler.get_failed_jobs().await.len();

        let stuck_jobs = self.scheduler.detect_stuck_jobs(self.stuck_threshold).await;
        for job_id in &stuck_jobs {
            if let Err(e) = self
                .scheduler
                .reset_stuck_job(job_id, STUCK_RESTART_DELAY)
                .await
            {
                warn!(job_id = %job_id, "卡死作业复位失败: {e}");
            }
        }

        let snapshot = HealthSnapshot {
            timestamp: Utc::now(),
            jobs,
            failed_jobs,
            stuck_jobs,
            system: self.capture_system_stats().await,
        };

        self.health_journal.append(&snapshot).await?;

        info!(
            total = snapshot.jobs.total,
            running = snapshot.jobs.running,
            failed = snapshot.failed_jobs,
            stuck = snapshot.stuck_jobs.len(),
            "健康检查完成"
        );
        Ok(snapshot)
    }

    /// 失败作业恢复扫描
    pub async fn run_recovery_sweep(&self) -> usize {
        self.scheduler.recover_failed_jobs().await
    }

    /// 存储维护扫描：逐表优化并补建索引，单表失败不影响其余表
    pub async fn run_maintenance_sweep(&self) {
        info!(tables = self.targets.len(), "开始存储维护扫描");

        for target in &self.targets {
            if let Err(e) = self.maintainer.optimize_table(&target.table).await {
                warn!(table = %target.table, "表维护失败: {e}");
            }
            if let Err(e) = self
                .maintainer
                .ensure_indexes(&target.table, &target.indexes)
                .await
            {
                warn!(table = %target.table, "索引补建失败: {e}");
            }
        }

        info!("存储维护扫描完成");
    }

    async fn capture_system_stats(&self) -> SystemStats {
        let mut system = self.system.lock().await;
        system.refresh_memory();

        let used = system.used_memory();
        let total = system.total_memory();
        let percent = if total > 0 {
            (used as f64 / total as f64 * 100.0) as f32
        } else {
            0.0
        };

        SystemStats {
            used_memory_bytes: used,
            total_memory_bytes: total,
            memory_usage_percent: percent,
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }
}
