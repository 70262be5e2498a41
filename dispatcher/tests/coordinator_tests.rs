use anyhow::Result;
use chrono::{Duration, Utc};
use nectar_common::{Job, JobStatus, Notification};
use nectar_dispatcher::jobs::JobFilter;
use nectar_dispatcher::workers::WorkerFilter;
use nectar_dispatcher::{Coordinator, CoordinatorConfig, Preference};

fn manual() -> Coordinator {
    Coordinator::new(CoordinatorConfig {
        auto_assign: false,
        ..CoordinatorConfig::default()
    })
}

fn job(id: &str, requirements: &str) -> Job {
    Job::posted(id, "0xclient", "Train classifier", "2.5", Utc::now() + Duration::hours(1))
        .with_details("Fine-tune a small model", requirements)
}

// J1/W1: post, register, heartbeat, match, assign, start, complete
#[tokio::test]
async fn test_single_job_single_worker_lifecycle() -> Result<()> {
    let c = manual();
    let mut rx = c.notifier().subscribe();

    c.submit_new_job(job("J1", "ml, gpu")).await?;
    c.register_worker("W1", r#"{"capabilities": ["ml", "gpu", "cpu"]}"#).await?;
    c.heartbeat("W1").await?;

    let best = c.find_best_worker("ml, gpu", Preference::HighestRated).await;
    assert_eq!(best.map(|w| w.address).as_deref(), Some("W1"));

    let assigned = c.force_assign("J1", "W1").await?;
    assert_eq!(assigned.status, JobStatus::Assigned);
    assert_eq!(c.worker_jobs("W1").await?, vec!["J1".to_string()]);

    c.report_start("J1", "W1").await?;
    let fingerprint = "a".repeat(64);
    let done = c.report_completion("J1", "W1", &fingerprint).await?;

    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.result_fingerprint.as_deref(), Some(fingerprint.as_str()));
    assert!(done.completed_at.is_some());

    let w1 = c.worker("W1").await?;
    assert!(w1.current_jobs.is_empty());
    assert_eq!(w1.completed_jobs, 1);

    let kinds: Vec<&'static str> = std::iter::from_fn(|| rx.try_recv().ok())
        .map(|msg| msg.kind())
        .collect();
    assert_eq!(
        kinds,
        vec![
            "new_job_available",
            "worker_registered",
            "job_assigned",
            "job_started",
            "job_completion_processed",
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_force_assign_on_assigned_job_leaves_state_unchanged() -> Result<()> {
    let c = manual();
    c.submit_new_job(job("J1", "")).await?;
    c.register_worker("W1", "cpu").await?;
    c.register_worker("W2", "cpu").await?;
    c.force_assign("J1", "W1").await?;

    let err = c.force_assign("J1", "W2").await.unwrap_err();
    assert_eq!(err.reason(), "illegal_transition");

    let j1 = c.job("J1").await?;
    assert_eq!(j1.status, JobStatus::Assigned);
    assert_eq!(j1.assigned_worker.as_deref(), Some("W1"));
    assert!(c.worker_jobs("W2").await?.is_empty());
    assert_eq!(c.worker_jobs("W1").await?, vec!["J1".to_string()]);
    Ok(())
}

#[tokio::test]
async fn test_force_assign_preconditions() -> Result<()> {
    let c = Coordinator::new(CoordinatorConfig {
        auto_assign: false,
        max_concurrent_jobs: 1,
        ..CoordinatorConfig::default()
    });
    c.submit_new_job(job("J1", "")).await?;
    c.submit_new_job(job("J2", "")).await?;
    c.register_worker("W1", "cpu").await?;

    assert_eq!(c.force_assign("J9", "W1").await.unwrap_err().reason(), "job_not_found");
    assert_eq!(c.force_assign("J1", "ghost").await.unwrap_err().reason(), "worker_not_found");

    c.force_assign("J1", "W1").await?;
    let err = c.force_assign("J2", "W1").await.unwrap_err();
    assert_eq!(err.reason(), "capacity_exceeded");
    assert_eq!(c.job("J2").await?.status, JobStatus::Posted);
    Ok(())
}

#[tokio::test]
async fn test_stale_worker_is_swept_and_excluded_from_matching() -> Result<()> {
    let c = manual();
    c.register_worker("stale", "gpu").await?;

    let later = Utc::now() + Duration::seconds(301);
    let report = c.sweep(later).await;
    assert_eq!(report.offline, vec!["stale".to_string()]);

    assert!(c.find_best_worker("gpu", Preference::HighestRated).await.is_none());
    let online = c
        .query_workers(&WorkerFilter {
            online_only: true,
            ..WorkerFilter::default()
        })
        .await;
    assert!(online.is_empty());

    // a heartbeat brings it back
    c.heartbeat("stale").await?;
    assert!(c.find_best_worker("gpu", Preference::HighestRated).await.is_some());
    Ok(())
}

#[tokio::test]
async fn test_sweep_prunes_finished_jobs() -> Result<()> {
    let c = manual();
    c.submit_new_job(job("J1", "")).await?;
    c.submit_new_job(job("J2", "")).await?;
    c.cancel_job("J1").await?;

    let report = c.sweep(Utc::now() + Duration::seconds(301)).await;
    assert_eq!(report.pruned, vec!["J1".to_string()]);
    assert_eq!(c.job("J1").await.unwrap_err().reason(), "job_not_found");
    assert!(c.is_retired("J1").await);

    // replayed posting of a retired job stays retired
    assert_eq!(c.submit_new_job(job("J1", "")).await?, None);
    assert!(!c.has_job("J1").await);
    assert_eq!(c.query_jobs(&JobFilter::default()).await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_least_loaded_preference_spreads_jobs() -> Result<()> {
    let c = Coordinator::new(CoordinatorConfig {
        preference: Preference::LeastLoaded,
        ..CoordinatorConfig::default()
    });
    c.register_worker("A", "cpu").await?;
    c.register_worker("B", "cpu").await?;

    let first = c.submit_new_job(job("J1", "cpu")).await?;
    let second = c.submit_new_job(job("J2", "cpu")).await?;

    assert_eq!(first.as_deref(), Some("A"));
    assert_eq!(second.as_deref(), Some("B"));
    Ok(())
}

#[tokio::test]
async fn test_worker_targeted_notification_reaches_every_observer() -> Result<()> {
    let c = manual();
    let mut a = c.notifier().subscribe();
    let mut b = c.notifier().subscribe();

    c.submit_new_job(job("J1", "")).await?;
    c.register_worker("W1", "cpu").await?;
    c.force_assign("J1", "W1").await?;

    for rx in [&mut a, &mut b] {
        let assigned = std::iter::from_fn(|| rx.try_recv().ok())
            .find(|msg| matches!(msg, Notification::JobAssigned { .. }))
            .expect("job_assigned delivered");
        assert_eq!(assigned.target(), Some("W1"));
    }
    Ok(())
}

#[tokio::test]
async fn test_stats_aggregate_both_registries() -> Result<()> {
    let c = manual();
    c.submit_new_job(job("J1", "")).await?;
    c.submit_new_job(job("J2", "")).await?;
    c.register_worker("W1", "cpu").await?;
    c.force_assign("J1", "W1").await?;
    c.rate_worker("J1", "W1", 5).await?;

    let stats = c.stats().await;
    assert_eq!(stats.jobs.total, 2);
    assert_eq!(stats.jobs.active_assignments, 1);
    assert!((stats.jobs.total_reward - 5.0).abs() < 1e-9);
    assert_eq!(stats.workers.total, 1);
    assert_eq!(stats.workers.jobs_in_progress, 1);
    assert!((stats.workers.average_rating - 5.0).abs() < 1e-9);

    let top = c.top_workers(5).await;
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].address, "W1");
    Ok(())
}

#[tokio::test]
async fn test_ledger_assignment_to_unregistered_worker_still_converges() -> Result<()> {
    let c = manual();
    c.submit_new_job(job("J1", "")).await?;

    assert!(c.notify_assignment("J1", "0xunknown").await?);
    let j1 = c.job("J1").await?;
    assert_eq!(j1.status, JobStatus::Assigned);
    assert_eq!(j1.assigned_worker.as_deref(), Some("0xunknown"));

    assert!(c.confirm_started("J1").await?);
    let fingerprint = "d".repeat(64);
    assert!(c.confirm_completed("J1", &fingerprint).await?);

    let j1 = c.job("J1").await?;
    assert_eq!(j1.status, JobStatus::Completed);
    assert_eq!(j1.result_fingerprint.as_deref(), Some(fingerprint.as_str()));
    Ok(())
}

#[tokio::test]
async fn test_ledger_assignment_beyond_capacity_follows_ledger() -> Result<()> {
    let c = Coordinator::new(CoordinatorConfig {
        auto_assign: false,
        max_concurrent_jobs: 1,
        ..CoordinatorConfig::default()
    });
    c.submit_new_job(job("J1", "")).await?;
    c.submit_new_job(job("J2", "")).await?;
    c.register_worker("W1", "cpu").await?;
    c.force_assign("J1", "W1").await?;

    assert!(c.notify_assignment("J2", "W1").await?);
    let j2 = c.job("J2").await?;
    assert_eq!(j2.status, JobStatus::Assigned);
    assert_eq!(j2.assigned_worker.as_deref(), Some("W1"));
    // the limit still holds on the worker side
    assert_eq!(c.worker_jobs("W1").await?, vec!["J1".to_string()]);

    c.report_start("J2", "W1").await?;
    c.report_completion("J2", "W1", &"e".repeat(64)).await?;
    assert_eq!(c.job("J2").await?.status, JobStatus::Completed);
    assert_eq!(c.worker("W1").await?.completed_jobs, 1);
    assert_eq!(c.worker_jobs("W1").await?, vec!["J1".to_string()]);
    Ok(())
}
