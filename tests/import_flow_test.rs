mod support;

use fleet_import::domain::model::{AuditKind, EntityKind, ImportOptions, ImportType, JobId, Record};
use fleet_import::domain::ports::JobStore;
use fleet_import::utils::error::{ErrorCode, ProviderError};
use fleet_import::{ImportError, JobStatus, OrchestratorState};
use std::time::Duration;
use support::{fast_config, harness, wait_for_active_job, MockTrackingProvider};

fn legacy_user() -> Record {
    Record::from_object(
        serde_json::json!({ "username": "legacy01", "name": "Legacy Driver" })
            .as_object()
            .cloned()
            .unwrap(),
    )
}

#[tokio::test]
async fn test_complete_system_import_succeeds() -> anyhow::Result<()> {
    let h = harness(MockTrackingProvider::new(25, 12), fast_config());

    let options = ImportOptions::new(ImportType::CompleteSystem).with_batch_size(10);
    let result = h.orchestrator.start_import(options).await?;

    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.counts.users.successful, 25);
    assert_eq!(result.counts.vehicles.successful, 12);
    assert_eq!(result.counts.total_failed(), 0);
    assert_eq!(h.sink.records(EntityKind::User).len(), 25);
    assert_eq!(h.sink.records(EntityKind::Vehicle).len(), 12);

    // 多次查詢共用同一個 session
    assert_eq!(h.provider.login_count(), 1);

    let snapshot = h.store.get_job(&result.job_id).await?;
    assert_eq!(snapshot.status, JobStatus::Completed);
    assert_eq!(snapshot.counts, result.counts);
    assert!(snapshot.phases.iter().all(|p| p.progress == 100));

    let audit: Vec<AuditKind> = h
        .store
        .audit_events(&result.job_id)
        .iter()
        .map(|e| e.kind)
        .collect();
    assert_eq!(audit.first(), Some(&AuditKind::JobStarted));
    assert_eq!(audit.last(), Some(&AuditKind::JobCompleted));

    assert_eq!(
        h.orchestrator.state(&result.job_id),
        Some(OrchestratorState::Completed)
    );
    assert!(h.orchestrator.active_job().is_none());
    Ok(())
}

#[tokio::test]
async fn test_selective_import_filters_users() -> anyhow::Result<()> {
    let h = harness(MockTrackingProvider::new(30, 5), fast_config());

    let options = ImportOptions::new(ImportType::Selective)
        .with_usernames(vec!["driver002".to_string(), "driver017".to_string()]);
    let result = h.orchestrator.start_import(options).await?;

    assert_eq!(result.counts.users.successful, 2);
    // 只匯入被選取使用者名下的車輛
    assert_eq!(result.counts.vehicles.successful, 1);
    let job = h.orchestrator.job(&result.job_id).unwrap();
    assert_eq!(job.phases.len(), 5);
    Ok(())
}

#[tokio::test]
async fn test_selective_without_usernames_fails_before_any_work() {
    let h = harness(MockTrackingProvider::new(5, 5), fast_config());

    let err = h
        .orchestrator
        .start_import(ImportOptions::new(ImportType::Selective))
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::ValidationFailed);
    assert_eq!(h.provider.login_count(), 0);
    assert_eq!(h.store.created_jobs(), 0);
    assert!(h
        .orchestrator
        .latest_error_summary()
        .contains("VALIDATION_FAILED"));
}

#[tokio::test]
async fn test_unhealthy_store_fails_validation_without_job() {
    let h = harness(MockTrackingProvider::new(5, 5), fast_config());
    h.store.set_healthy(false);

    let err = h
        .orchestrator
        .start_import(ImportOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::PersistenceFailed);
    assert_eq!(h.store.created_jobs(), 0);
    assert_eq!(h.provider.login_count(), 0);
}

#[tokio::test]
async fn test_unreachable_provider_fails_validation_without_job() {
    let provider = MockTrackingProvider::new(5, 5);
    provider.set_healthy(false);
    let h = harness(provider, fast_config());

    let err = h
        .orchestrator
        .start_import(ImportOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::ConfigurationInvalid);
    assert_eq!(h.store.created_jobs(), 0);
    assert_eq!(h.provider.login_count(), 0);
    assert_eq!(h.provider.query_count(), 0);
}

#[tokio::test]
async fn test_login_failure_fails_validation_without_job() {
    let provider = MockTrackingProvider::new(5, 5);
    provider.fail_login(ProviderError::AuthExpired("bad credentials".to_string()));
    let h = harness(provider, fast_config());

    let err = h
        .orchestrator
        .start_import(ImportOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::SessionAcquisitionFailed);
    assert_eq!(h.store.created_jobs(), 0);
    assert_eq!(h.provider.query_count(), 0);
    assert!(h
        .orchestrator
        .latest_error_summary()
        .contains("SESSION_ACQUISITION_FAILED"));
}

#[tokio::test]
async fn test_remote_failure_marks_job_failed() -> anyhow::Result<()> {
    let provider = MockTrackingProvider::new(8, 8);
    provider.fail_action(
        "list_vehicles",
        ProviderError::Unavailable("gateway down".to_string()),
    );
    let h = harness(provider, fast_config());

    let err = h
        .orchestrator
        .start_import(ImportOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::RemoteApiError);

    let job_id = h.only_job_id();
    let snapshot = h.store.get_job(&job_id).await?;
    assert_eq!(snapshot.status, JobStatus::Failed);
    assert_eq!(snapshot.error.as_ref().unwrap()["code"], "REMOTE_API_ERROR");
    assert_eq!(snapshot.counts.users.successful, 8);

    let summary = h.orchestrator.error_summary(&job_id)?;
    assert!(summary.starts_with("Critical errors (1):"));
    assert!(summary.contains("gateway down"));
    assert_eq!(h.orchestrator.state(&job_id), Some(OrchestratorState::Failed));

    // rollback_on_failure 未開啟時資料保留
    assert!(h.orchestrator.rollback_report(&job_id).is_none());
    assert_eq!(h.sink.records(EntityKind::User).len(), 8);
    Ok(())
}

#[tokio::test]
async fn test_failure_with_rollback_restores_backup() -> anyhow::Result<()> {
    let provider = MockTrackingProvider::new(6, 6);
    provider.fail_action("list_vehicles", ProviderError::Other("internal error".to_string()));
    let h = harness(provider, fast_config());
    h.sink.seed(EntityKind::User, vec![legacy_user()]);

    let options = ImportOptions::default().with_rollback_on_failure(true);
    let err = h.orchestrator.start_import(options).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::RemoteApiError);

    let job_id = h.only_job_id();
    let report = h.orchestrator.rollback_report(&job_id).unwrap();
    assert!(report.restored);
    assert_eq!(h.sink.records(EntityKind::User), vec![legacy_user()]);
    assert_eq!(
        h.orchestrator.state(&job_id),
        Some(OrchestratorState::RolledBack)
    );
    Ok(())
}

#[tokio::test]
async fn test_cancel_running_import_rolls_back() -> anyhow::Result<()> {
    let provider = MockTrackingProvider::new(400, 0);
    provider.set_query_delay(Duration::from_millis(40));
    let h = harness(provider, fast_config());
    h.sink.seed(EntityKind::User, vec![legacy_user()]);

    let orchestrator = h.orchestrator.clone();
    let run = tokio::spawn(async move {
        orchestrator
            .start_import(ImportOptions::new(ImportType::UsersOnly).with_batch_size(10))
            .await
    });

    let job_id = tokio::time::timeout(
        Duration::from_secs(5),
        wait_for_active_job(&h.orchestrator),
    )
    .await?;
    tokio::time::sleep(Duration::from_millis(150)).await;

    h.orchestrator.cancel_import(&job_id, "operator request").await?;
    // cancel_import 回傳時清理已完成
    assert!(h.orchestrator.active_job().is_none());

    let err = run.await?.unwrap_err();
    assert!(matches!(err, ImportError::Cancelled { .. }));

    let snapshot = h.store.get_job(&job_id).await?;
    assert_eq!(snapshot.status, JobStatus::Cancelled);

    let report = h.orchestrator.rollback_report(&job_id).unwrap();
    assert!(report.restored);
    assert_eq!(h.sink.records(EntityKind::User), vec![legacy_user()]);
    assert_eq!(
        h.orchestrator.state(&job_id),
        Some(OrchestratorState::RolledBack)
    );

    let audit: Vec<AuditKind> = h.store.audit_events(&job_id).iter().map(|e| e.kind).collect();
    assert!(audit.contains(&AuditKind::JobCancelled));
    assert!(audit.contains(&AuditKind::RollbackAttempted));
    Ok(())
}

#[tokio::test]
async fn test_cancel_finished_or_unknown_job() -> anyhow::Result<()> {
    let h = harness(MockTrackingProvider::new(3, 3), fast_config());
    let result = h.orchestrator.start_import(ImportOptions::default()).await?;

    h.orchestrator.cancel_import(&result.job_id, "too late").await?;
    assert_eq!(
        h.orchestrator.state(&result.job_id),
        Some(OrchestratorState::Completed)
    );

    let err = h
        .orchestrator
        .cancel_import(&JobId::new("missing"), "nothing")
        .await
        .unwrap_err();
    assert!(matches!(err, ImportError::JobNotFound { .. }));
    assert!(!h.orchestrator.cancel_active("idle").await);
    Ok(())
}

#[tokio::test]
async fn test_cancel_failed_job_is_noop() -> anyhow::Result<()> {
    let provider = MockTrackingProvider::new(3, 3);
    provider.fail_action("list_users", ProviderError::Unavailable("gateway down".to_string()));
    let h = harness(provider, fast_config());

    let err = h
        .orchestrator
        .start_import(ImportOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::RemoteApiError);

    let job_id = h.only_job_id();
    h.orchestrator.cancel_import(&job_id, "too late").await?;
    assert_eq!(h.orchestrator.state(&job_id), Some(OrchestratorState::Failed));
    assert_eq!(h.store.get_job(&job_id).await?.status, JobStatus::Failed);
    assert!(h.orchestrator.rollback_report(&job_id).is_none());
    Ok(())
}

#[tokio::test]
async fn test_rollback_completed_import() -> anyhow::Result<()> {
    let h = harness(MockTrackingProvider::new(10, 4), fast_config());
    h.sink.seed(EntityKind::User, vec![legacy_user()]);

    let result = h.orchestrator.start_import(ImportOptions::default()).await?;
    assert_eq!(h.sink.records(EntityKind::User).len(), 11);

    let report = h
        .orchestrator
        .rollback_import(&result.job_id, "bad source data")
        .await?;
    assert!(report.restored);
    assert!(report.warnings.is_empty());
    assert_eq!(h.sink.records(EntityKind::User), vec![legacy_user()]);
    assert!(h.sink.records(EntityKind::Vehicle).is_empty());
    assert_eq!(
        h.orchestrator.state(&result.job_id),
        Some(OrchestratorState::RolledBack)
    );
    Ok(())
}

#[tokio::test]
async fn test_failed_restore_is_reported_not_raised() -> anyhow::Result<()> {
    let h = harness(MockTrackingProvider::new(4, 4), fast_config());
    let result = h.orchestrator.start_import(ImportOptions::default()).await?;

    h.sink.set_fail_restore(true);
    let report = h
        .orchestrator
        .rollback_import(&result.job_id, "bad source data")
        .await?;

    assert!(!report.restored);
    assert_eq!(report.warnings.len(), 1);
    assert_eq!(
        h.orchestrator.state(&result.job_id),
        Some(OrchestratorState::Completed)
    );
    let summary = h.orchestrator.error_summary(&result.job_id)?;
    assert!(summary.contains("ROLLBACK_FAILED"));
    Ok(())
}

#[tokio::test]
async fn test_total_deadline_times_out_import() -> anyhow::Result<()> {
    let provider = MockTrackingProvider::new(300, 0);
    provider.set_query_delay(Duration::from_millis(50));
    let mut config = fast_config();
    config.supervisor.total_timeout = Duration::from_millis(300);
    let h = harness(provider, config);

    let err = h
        .orchestrator
        .start_import(ImportOptions::new(ImportType::UsersOnly).with_batch_size(10))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Timeout);

    let job_id = h.only_job_id();
    let snapshot = h.store.get_job(&job_id).await?;
    assert_eq!(snapshot.status, JobStatus::Failed);
    assert_eq!(snapshot.error.as_ref().unwrap()["code"], "TIMEOUT");
    assert_eq!(h.orchestrator.state(&job_id), Some(OrchestratorState::Failed));
    Ok(())
}

#[tokio::test]
async fn test_second_import_is_rejected_while_running() -> anyhow::Result<()> {
    let provider = MockTrackingProvider::new(100, 0);
    provider.set_query_delay(Duration::from_millis(30));
    let h = harness(provider, fast_config());

    let orchestrator = h.orchestrator.clone();
    let run = tokio::spawn(async move {
        orchestrator
            .start_import(ImportOptions::new(ImportType::UsersOnly).with_batch_size(10))
            .await
    });
    let job_id = tokio::time::timeout(
        Duration::from_secs(5),
        wait_for_active_job(&h.orchestrator),
    )
    .await?;

    let err = h
        .orchestrator
        .start_import(ImportOptions::default())
        .await
        .unwrap_err();
    match err {
        ImportError::ImportInProgress { job_id: running } => {
            assert_eq!(running.as_deref(), Some(job_id.as_str()))
        }
        other => panic!("unexpected error: {}", other),
    }

    let result = run.await??;
    assert_eq!(result.counts.users.successful, 100);
    assert_eq!(h.store.created_jobs(), 1);
    Ok(())
}

#[tokio::test]
async fn test_progress_events_are_monotonic() -> anyhow::Result<()> {
    let h = harness(MockTrackingProvider::new(35, 20), fast_config());
    let mut events = h.orchestrator.progress_channel();

    h.orchestrator
        .start_import(ImportOptions::default().with_batch_size(5))
        .await?;

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }

    assert!(!received.is_empty());
    for pair in received.windows(2) {
        assert!(pair[1].overall_progress >= pair[0].overall_progress);
    }
    assert_eq!(received.last().map(|e| e.overall_progress), Some(100));
    assert!(received.iter().any(|e| e.phase == "execution:users"));
    Ok(())
}

#[tokio::test]
async fn test_await_completion_reads_job_store() -> anyhow::Result<()> {
    let h = harness(MockTrackingProvider::new(6, 2), fast_config());
    let result = h.orchestrator.start_import(ImportOptions::default()).await?;

    let awaited = h.orchestrator.await_completion(&result.job_id).await?;
    assert_eq!(awaited.status, JobStatus::Completed);
    assert_eq!(awaited.counts, result.counts);

    let err = h
        .orchestrator
        .await_completion(&JobId::new("missing"))
        .await
        .unwrap_err();
    assert!(matches!(err, ImportError::JobNotFound { .. }));
    Ok(())
}
