//! Email dispatch against the in-memory queue and recording collaborators.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use herald_core::{
    AuditEventKind, AuditOutcome, JobAction, JobKey, PendingJob, Subject, TestClock,
};
use herald_processor::{
    EmailDispatchJob, InMemoryWorkQueue, ProcessContext, Processor, ProcessorError,
    ProcessorPolicy, RateLimiter, RetrySettings,
};
use herald_testing::{RecordingAuditLog, RecordingMailer, StaticTokenIssuer};

struct Fixture {
    clock: Arc<TestClock>,
    queue: InMemoryWorkQueue,
    mailer: Arc<RecordingMailer>,
    audit: Arc<RecordingAuditLog>,
    job: EmailDispatchJob,
}

fn fixture_with_tokens(tokens: StaticTokenIssuer) -> Fixture {
    let clock = Arc::new(TestClock::new());
    let queue = InMemoryWorkQueue::new(clock.clone());
    let mailer = Arc::new(RecordingMailer::new());
    let audit = Arc::new(RecordingAuditLog::new());
    let job = EmailDispatchJob::new(
        Arc::new(queue.clone()),
        mailer.clone(),
        Arc::new(tokens),
        audit.clone(),
        clock.clone(),
    );
    Fixture { clock, queue, mailer, audit, job }
}

fn fixture() -> Fixture {
    fixture_with_tokens(StaticTokenIssuer::new())
}

fn context(clock: &Arc<TestClock>, retry: RetrySettings) -> ProcessContext {
    let policy = ProcessorPolicy { retry, ..ProcessorPolicy::default() };
    ProcessContext::new(0, 1, Arc::new(policy), Arc::new(RateLimiter::new(1000.0, clock.clone())))
}

impl Fixture {
    fn add(&self, name: &str, action: &str, lang: &str) -> Subject {
        let subject = self.queue.add_subject(name);
        self.queue.seed(PendingJob {
            subject: subject.clone(),
            lang: lang.to_string(),
            retries: 0,
            next_try: Utc::now() - chrono::Duration::seconds(1),
            actor: "signup".to_string(),
            action: action.to_string(),
        });
        subject
    }
}

#[tokio::test]
async fn empty_queue_reports_no_work() {
    let f = fixture();
    let ctx = context(&f.clock, RetrySettings::default());

    assert!(!f.job.process(&ctx).await.unwrap());
    assert_eq!(f.mailer.attempts(), 0);
    assert_eq!(f.queue.commit_count(), 0);
}

#[tokio::test]
async fn batch_is_mailed_and_resolved() {
    let f = fixture();
    let alice = f.add("alice@example.com", "VerifyEmail", "el");
    let bob = f.add("bob@example.com", "ResetPassword", "en");
    let ctx = context(&f.clock, RetrySettings::default());

    assert!(f.job.process(&ctx).await.unwrap());

    let sent = f.mailer.sent();
    assert_eq!(sent.len(), 2);
    let to_alice = f.mailer.sent_to("alice@example.com").remove(0);
    assert_eq!(to_alice.action, JobAction::VerifyEmail);
    assert_eq!(to_alice.lang, "el");
    assert_eq!(to_alice.token, format!("token-{}", alice.id));
    assert_eq!(f.mailer.sent_to("bob@example.com")[0].token, format!("token-{}", bob.id));

    assert!(f.queue.is_empty());
    assert_eq!(f.queue.locked_count(), 0);
    assert_eq!(f.audit.of_kind(AuditEventKind::ProcessVerifyEmail).len(), 1);
    assert_eq!(f.audit.of_kind(AuditEventKind::ProcessResetPasswordEmail).len(), 1);
    assert!(f.audit.events().iter().all(|event| event.is_success()));
}

#[tokio::test]
async fn unknown_action_is_a_failure() {
    let f = fixture();
    let subject = f.add("carol@example.com", "SendNewsletter", "en");
    let ctx = context(&f.clock, RetrySettings::default());

    assert!(f.job.process(&ctx).await.unwrap());

    assert_eq!(f.mailer.attempts(), 0);
    let job = f.queue.job(&JobKey::new(subject.id, "SendNewsletter")).unwrap();
    assert_eq!(job.retries, 1);

    let events = f.audit.of_kind(AuditEventKind::ProcessUserEmail);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].outcome, AuditOutcome::Error { code: "UnsupportedEmailType".into() });
    assert_eq!(events[0].actor, "signup");
    assert_eq!(events[0].recipient, "carol@example.com");
}

#[tokio::test]
async fn one_bad_job_does_not_abort_the_batch() {
    let f = fixture();
    f.add("alice@example.com", "VerifyEmail", "en");
    let bob = f.add("bob@example.com", "VerifyEmail", "en");
    let carol = f.add("carol@example.com", "ResetPassword", "en");
    f.add("dave@example.com", "ResetPassword", "en");
    f.mailer.fail_for("bob@example.com");
    f.mailer.panic_for("carol@example.com");
    let ctx = context(&f.clock, RetrySettings::new(3, Duration::from_secs(300)));

    assert!(f.job.process(&ctx).await.unwrap());

    assert_eq!(f.mailer.attempts(), 4);
    assert_eq!(f.mailer.sent().len(), 2);
    assert_eq!(f.queue.len(), 2);
    let bob_job = f.queue.job(&JobKey::new(bob.id, "VerifyEmail")).unwrap();
    let carol_job = f.queue.job(&JobKey::new(carol.id, "ResetPassword")).unwrap();
    assert_eq!(bob_job.retries, 1);
    assert_eq!(carol_job.retries, 1);
    assert!(bob_job.next_try > Utc::now());

    let failures = f.audit.of_kind(AuditEventKind::ProcessUserEmail);
    assert_eq!(failures.len(), 2);
    assert!(failures
        .iter()
        .all(|e| e.outcome == AuditOutcome::Error { code: "UserEmailDispatchError".into() }));
}

#[tokio::test]
async fn exhausted_jobs_are_dropped_and_audited() {
    let f = fixture();
    let subject = f.add("erin@example.com", "VerifyEmail", "en");
    f.mailer.fail_all(true);
    let ctx = context(&f.clock, RetrySettings::new(1, Duration::ZERO));

    assert!(f.job.process(&ctx).await.unwrap());
    assert_eq!(f.queue.job(&JobKey::new(subject.id, "VerifyEmail")).unwrap().retries, 1);
    assert!(f.audit.of_kind(AuditEventKind::JobDropped).is_empty());

    assert!(f.job.process(&ctx).await.unwrap());
    assert!(f.queue.is_empty());

    let dropped = f.audit.of_kind(AuditEventKind::JobDropped);
    assert_eq!(dropped.len(), 1);
    assert_eq!(dropped[0].recipient, "erin@example.com");
    assert_eq!(dropped[0].outcome, AuditOutcome::Error { code: "RetriesExhausted".into() });
    assert_eq!(dropped[0].detail["retries"], 1);
}

#[tokio::test]
async fn token_failure_counts_as_dispatch_failure() {
    let f = fixture_with_tokens(StaticTokenIssuer::failing());
    let subject = f.add("frank@example.com", "VerifyEmail", "en");
    let ctx = context(&f.clock, RetrySettings::default());

    assert!(f.job.process(&ctx).await.unwrap());

    assert_eq!(f.mailer.attempts(), 0);
    assert_eq!(f.queue.job(&JobKey::new(subject.id, "VerifyEmail")).unwrap().retries, 1);
}

#[tokio::test]
async fn claim_failure_counts_as_idle() {
    let f = fixture();
    f.add("gina@example.com", "VerifyEmail", "en");
    f.queue.fail_next_claims(1);
    let ctx = context(&f.clock, RetrySettings::default());

    assert!(!f.job.process(&ctx).await.unwrap());

    assert_eq!(f.mailer.attempts(), 0);
    assert_eq!(f.queue.len(), 1);
    assert_eq!(f.queue.locked_count(), 0);

    assert!(f.job.process(&ctx).await.unwrap());
    assert!(f.queue.is_empty());
}

#[tokio::test]
async fn drop_is_not_audited_when_commit_fails() {
    let f = fixture();
    let subject = f.add("hugo@example.com", "VerifyEmail", "en");
    f.mailer.fail_all(true);
    f.queue.fail_next_commits(1);
    let ctx = context(&f.clock, RetrySettings::new(0, Duration::ZERO));

    let error = f.job.process(&ctx).await.unwrap_err();

    assert!(matches!(error, ProcessorError::Database { .. }));
    assert!(f.audit.of_kind(AuditEventKind::JobDropped).is_empty());
    assert_eq!(f.queue.job(&JobKey::new(subject.id, "VerifyEmail")).unwrap().retries, 0);
    assert_eq!(f.queue.locked_count(), 0);

    assert!(f.job.process(&ctx).await.unwrap());
    assert!(f.queue.is_empty());
    assert_eq!(f.audit.of_kind(AuditEventKind::JobDropped).len(), 1);
}

#[tokio::test]
async fn unrepresentable_backoff_drops_instead_of_redelivering() {
    let f = fixture();
    f.add("iris@example.com", "VerifyEmail", "en");
    f.mailer.fail_all(true);
    let ctx = context(&f.clock, RetrySettings::new(3, Duration::from_secs(8_640_000_000_000)));

    assert!(f.job.process(&ctx).await.unwrap());

    assert!(f.queue.is_empty());
    assert_eq!(f.mailer.attempts(), 1);
    let dropped = f.audit.of_kind(AuditEventKind::JobDropped);
    assert_eq!(dropped.len(), 1);
    assert_eq!(dropped[0].recipient, "iris@example.com");
}

#[tokio::test]
async fn batch_limit_caps_claims() {
    let f = fixture();
    for i in 0..5 {
        f.add(&format!("user{i}@example.com"), "VerifyEmail", "en");
    }
    let policy = ProcessorPolicy { batch_limit: 2, ..ProcessorPolicy::default() };
    let ctx = ProcessContext::new(
        0,
        1,
        Arc::new(policy),
        Arc::new(RateLimiter::new(1000.0, f.clock.clone())),
    );

    assert!(f.job.process(&ctx).await.unwrap());

    assert_eq!(f.mailer.sent().len(), 2);
    assert_eq!(f.queue.len(), 3);
}

#[tokio::test]
async fn each_job_consumes_one_permit() {
    let f = fixture();
    for i in 0..5 {
        f.add(&format!("user{i}@example.com"), "VerifyEmail", "en");
    }
    let ctx = ProcessContext::new(
        0,
        1,
        Arc::new(ProcessorPolicy::default()),
        Arc::new(RateLimiter::new(2.0, f.clock.clone())),
    );

    assert!(f.job.process(&ctx).await.unwrap());

    assert_eq!(f.clock.elapsed(), Duration::from_secs(2));
}

#[tokio::test]
async fn enqueue_uses_stored_action_names() {
    let f = fixture();
    let subject = f.queue.add_subject("hank@example.com");

    assert!(f.job.enqueue(subject.id, "", "admin", JobAction::ResetPassword).await.unwrap());
    assert!(!f.job.enqueue(subject.id, "de", "admin", JobAction::ResetPassword).await.unwrap());

    let job = f.queue.job(&JobKey::new(subject.id, "ResetPassword")).unwrap();
    assert_eq!(job.lang, "en");
    assert_eq!(job.actor, "admin");
}
