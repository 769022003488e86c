//! Claim and resolve semantics of the in-memory queue.

use std::{collections::HashSet, sync::Arc, time::Duration};

use chrono::Utc;
use herald_core::{FailedJob, JobKey, PendingJob, Subject, SubjectId, TestClock};
use herald_processor::{InMemoryWorkQueue, RetrySettings, WorkQueueStore};
use tokio::sync::Barrier;

fn queue_with_jobs(count: usize) -> (InMemoryWorkQueue, Arc<TestClock>) {
    let clock = Arc::new(TestClock::new());
    let queue = InMemoryWorkQueue::new(clock.clone());
    for i in 0..count {
        let subject = queue.add_subject(&format!("user{i}@example.com"));
        queue.seed(PendingJob {
            subject,
            lang: "en".to_string(),
            retries: 0,
            next_try: Utc::now() - chrono::Duration::seconds(60),
            actor: "signup".to_string(),
            action: "VerifyEmail".to_string(),
        });
    }
    (queue, clock)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claimants_receive_disjoint_batches() {
    let (queue, _) = queue_with_jobs(100);
    let claimants = 8;
    let barrier = Arc::new(Barrier::new(claimants));

    let handles: Vec<_> = (0..claimants)
        .map(|_| {
            let queue = queue.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                let mut tx = queue.begin().await.unwrap();
                let batch = tx.claim_batch(10).await.unwrap();
                // Keep every transaction open until all have claimed.
                barrier.wait().await;
                batch.into_iter().map(|job| job.key()).collect::<Vec<_>>()
            })
        })
        .collect();

    let mut seen = HashSet::new();
    let mut total = 0;
    for handle in handles {
        for key in handle.await.unwrap() {
            total += 1;
            assert!(seen.insert(key.clone()), "{key} claimed twice");
        }
    }

    assert_eq!(total, 80);
    assert_eq!(queue.locked_count(), 0);
}

#[tokio::test]
async fn failing_job_is_retried_three_times_then_dropped() {
    let (queue, _) = queue_with_jobs(1);
    let retry = RetrySettings::new(3, Duration::ZERO);
    let key = queue.jobs()[0].key();

    for expected in 1..=3 {
        let mut tx = queue.begin().await.unwrap();
        let batch = tx.claim_batch(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        let report = tx.record_outcome(&[], &[FailedJob::of(&batch[0])], &retry).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(report.rescheduled, 1);
        assert!(report.dropped.is_empty());
        assert_eq!(queue.job(&key).unwrap().retries, expected);
    }

    let mut tx = queue.begin().await.unwrap();
    let batch = tx.claim_batch(10).await.unwrap();
    let report = tx.record_outcome(&[], &[FailedJob::of(&batch[0])], &retry).await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(report.dropped, vec![FailedJob { key: key.clone(), retries: 3 }]);
    assert!(queue.job(&key).is_none());
}

#[tokio::test]
async fn empty_outcome_leaves_queue_untouched() {
    let (queue, _) = queue_with_jobs(5);
    let before = queue.jobs();

    let mut tx = queue.begin().await.unwrap();
    let _claimed = tx.claim_batch(3).await.unwrap();
    let report = tx.record_outcome(&[], &[], &RetrySettings::default()).await.unwrap();
    tx.commit().await.unwrap();

    assert!(report.is_empty());
    assert_eq!(queue.jobs(), before);
}

#[tokio::test]
async fn missing_keys_are_ignored() {
    let (queue, _) = queue_with_jobs(1);
    let ghost = JobKey::new(SubjectId(999), "VerifyEmail");

    let mut tx = queue.begin().await.unwrap();
    let report = tx
        .record_outcome(
            &[ghost.clone()],
            &[FailedJob { key: ghost, retries: 0 }],
            &RetrySettings::default(),
        )
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert_eq!(report.completed, 0);
    assert_eq!(report.rescheduled, 0);
    assert_eq!(queue.len(), 1);
}

#[tokio::test]
async fn successes_are_deleted_on_commit_only() {
    let (queue, _) = queue_with_jobs(2);

    let mut tx = queue.begin().await.unwrap();
    let batch = tx.claim_batch(10).await.unwrap();
    let keys: Vec<_> = batch.iter().map(PendingJob::key).collect();
    let report = tx.record_outcome(&keys, &[], &RetrySettings::default()).await.unwrap();
    assert_eq!(report.completed, 2);
    assert_eq!(queue.len(), 2, "uncommitted deletes must not be visible");

    tx.commit().await.unwrap();
    assert!(queue.is_empty());
}

#[tokio::test]
async fn claims_follow_next_try_order_and_eligibility() {
    let clock = Arc::new(TestClock::new());
    let queue = InMemoryWorkQueue::new(clock.clone());
    let now = Utc::now();
    for (name, offset) in [("late", -10), ("early", -300), ("future", 3600)] {
        let subject: Subject = queue.add_subject(name);
        queue.seed(PendingJob {
            subject,
            lang: "en".to_string(),
            retries: 0,
            next_try: now + chrono::Duration::seconds(offset),
            actor: "t".to_string(),
            action: "ResetPassword".to_string(),
        });
    }

    let mut tx = queue.begin().await.unwrap();
    let batch = tx.claim_batch(10).await.unwrap();
    let names: Vec<_> = batch.iter().map(|job| job.subject.name.as_str()).collect();

    assert_eq!(names, vec!["early", "late"]);
}
