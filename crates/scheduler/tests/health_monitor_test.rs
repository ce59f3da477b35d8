use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use ingest_core::config::SchedulerConfig;
use ingest_core::models::{JobStatus, WorkFn};
use ingest_core::{IngestError, MockStorageMaintainer, StorageMaintainer};
use ingest_scheduler::health::{default_maintenance_targets, MaintenanceTarget};
use ingest_scheduler::{HealthMonitor, SelfHealingScheduler};

fn test_config(journal_dir: &Path) -> SchedulerConfig {
    SchedulerConfig {
        default_max_retries: 5,
        default_retry_delays_seconds: vec![1, 5, 15, 60, 300],
        default_timeout_seconds: 300,
        stuck_threshold_seconds: 600,
        health_check_interval_seconds: 300,
        recovery_sweep_interval_seconds: 600,
        maintenance_interval_seconds: 86400,
        journal_dir: journal_dir.to_string_lossy().into_owned(),
        journal_cap: 1000,
    }
}

fn work_ok(value: serde_json::Value) -> WorkFn {
    Arc::new(move |_params| {
        let value = value.clone();
        Box::pin(async move { Ok(value) })
    })
}

fn noop_maintainer() -> Arc<dyn StorageMaintainer> {
    let mut mock = MockStorageMaintainer::new();
    mock.expect_optimize_table().returning(|_| Ok(()));
    mock.expect_ensure_indexes().returning(|_, _| Ok(()));
    Arc::new(mock)
}

#[tokio::test]
async fn test_health_check_snapshot_and_journal() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let scheduler = SelfHealingScheduler::new(config.clone());

    scheduler
        .register_job("upload", work_ok(json!(null)), None)
        .await
        .unwrap();
    scheduler.execute_job("upload", json!(null)).await.unwrap();

    let monitor = HealthMonitor::new(Arc::clone(&scheduler), noop_maintainer(), &config);
    let snapshot = monitor.perform_health_check().await.unwrap();

    assert_eq!(snapshot.jobs.total, 1);
    assert_eq!(snapshot.jobs.completed, 1);
    assert_eq!(snapshot.failed_jobs, 0);
    assert!(snapshot.stuck_jobs.is_empty());
    assert!(snapshot.system.total_memory_bytes > 0);

    let entries = monitor.health_journal().read_all().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["jobs"]["completed"], 1);
}

#[tokio::test(start_paused = true)]
async fn test_health_check_resets_stuck_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.stuck_threshold_seconds = 0;
    let scheduler = SelfHealingScheduler::new(config.clone());

    let attempts = Arc::new(AtomicU32::new(0));
    let work: WorkFn = {
        let attempts = Arc::clone(&attempts);
        Arc::new(move |_params| {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            Box::pin(async move {
                if attempt == 1 {
                    futures::future::pending::<()>().await;
                }
                Ok(json!("ok"))
            })
        })
    };
    let options = ingest_core::models::JobOptions {
        timeout: Duration::from_secs(1_000_000),
        ..ingest_core::models::JobOptions::default()
    };
    scheduler
        .register_job("wedged", work, Some(options))
        .await
        .unwrap();

    {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move {
            let _ = scheduler.execute_job("wedged", json!(null)).await;
        });
    }
    for _ in 0..100 {
        if let Some(snapshot) = scheduler.get_job_status("wedged").await {
            if snapshot.status == JobStatus::Running {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let monitor = HealthMonitor::new(Arc::clone(&scheduler), noop_maintainer(), &config);
    let snapshot = monitor.perform_health_check().await.unwrap();
    assert_eq!(snapshot.stuck_jobs, vec!["wedged".to_string()]);

    for _ in 0..400 {
        if let Some(snapshot) = scheduler.get_job_status("wedged").await {
            if snapshot.status == JobStatus::Completed {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(
        scheduler.get_job_status("wedged").await.unwrap().status,
        JobStatus::Completed
    );
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_maintenance_sweep_covers_all_targets() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let scheduler = SelfHealingScheduler::new(config.clone());

    let mut mock = MockStorageMaintainer::new();
    mock.expect_optimize_table().times(3).returning(|_| Ok(()));
    mock.expect_ensure_indexes()
        .times(3)
        .returning(|_, _| Ok(()));

    let monitor = HealthMonitor::new(scheduler, Arc::new(mock), &config);
    monitor.run_maintenance_sweep().await;
}

#[tokio::test]
async fn test_maintenance_sweep_tolerates_single_table_failure() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let scheduler = SelfHealingScheduler::new(config.clone());

    let mut mock = MockStorageMaintainer::new();
    mock.expect_optimize_table().times(2).returning(|table| {
        if table == "demographic_records" {
            Err(IngestError::Configuration("表不存在".to_string()))
        } else {
            Ok(())
        }
    });
    mock.expect_ensure_indexes()
        .times(2)
        .returning(|_, _| Ok(()));

    let targets = vec![
        MaintenanceTarget::new("demographic_records", vec![]),
        MaintenanceTarget::new("phone_numbers", vec![]),
    ];
    let monitor = HealthMonitor::with_targets(scheduler, Arc::new(mock), &config, targets);

    // 第一张表维护失败不影响第二张表
    monitor.run_maintenance_sweep().await;
}

#[tokio::test]
async fn test_default_targets_include_composite_index() {
    let targets = default_maintenance_targets();
    let phone = targets
        .iter()
        .find(|t| t.table == "phone_numbers")
        .unwrap();
    assert!(phone
        .indexes
        .iter()
        .any(|spec| spec.columns == vec!["npa", "nxx"]));
}

#[tokio::test(start_paused = true)]
async fn test_periodic_sweeps_run_and_stop_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.health_check_interval_seconds = 5;
    config.recovery_sweep_interval_seconds = 7;
    config.maintenance_interval_seconds = 11;
    let scheduler = SelfHealingScheduler::new(config.clone());

    let monitor = HealthMonitor::new(Arc::clone(&scheduler), noop_maintainer(), &config);
    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let handles = monitor.start(&shutdown_tx);

    tokio::time::sleep(Duration::from_secs(12)).await;
    let entries = monitor.health_journal().read_all().await.unwrap();
    assert!(!entries.is_empty());

    shutdown_tx.send(()).unwrap();
    for handle in handles {
        handle.await.unwrap();
    }
}
