//! Test doubles for the dispatcher's collaborators and the config source.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

use async_trait::async_trait;
use herald_core::{AuditEvent, AuditEventKind, AuditLog, JobAction, SubjectId};
use herald_processor::{ConfigSource, Mailer, ProcessorError, Result, TokenIssuer};

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One message accepted by [`RecordingMailer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMail {
    /// Template.
    pub action: JobAction,
    /// Recipient address.
    pub recipient: String,
    /// Template language.
    pub lang: String,
    /// Token embedded in the link.
    pub token: String,
}

/// Mailer that records what it sends and fails or panics on request.
#[derive(Debug, Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<SentMail>>,
    failing: Mutex<HashSet<String>>,
    panicking: Mutex<HashSet<String>>,
    fail_all: AtomicBool,
    attempts: AtomicUsize,
}

impl RecordingMailer {
    /// Creates a mailer that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every send to `recipient` fail.
    pub fn fail_for(&self, recipient: &str) {
        guard(&self.failing).insert(recipient.to_string());
    }

    /// Makes every send to `recipient` panic.
    pub fn panic_for(&self, recipient: &str) {
        guard(&self.panicking).insert(recipient.to_string());
    }

    /// Makes every send fail until cleared.
    pub fn fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    /// Messages accepted so far.
    pub fn sent(&self) -> Vec<SentMail> {
        guard(&self.sent).clone()
    }

    /// Messages accepted for `recipient`.
    pub fn sent_to(&self, recipient: &str) -> Vec<SentMail> {
        self.sent().into_iter().filter(|mail| mail.recipient == recipient).collect()
    }

    /// Sends attempted so far, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(
        &self,
        action: JobAction,
        recipient: &str,
        lang: &str,
        token: &str,
    ) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if guard(&self.panicking).contains(recipient) {
            panic!("mail transport exploded for {recipient}");
        }
        if self.fail_all.load(Ordering::SeqCst) || guard(&self.failing).contains(recipient) {
            return Err(ProcessorError::dispatch(format!("relay rejected {recipient}")));
        }

        guard(&self.sent).push(SentMail {
            action,
            recipient: recipient.to_string(),
            lang: lang.to_string(),
            token: token.to_string(),
        });
        Ok(())
    }
}

/// Token issuer returning `token-<subject id>`, optionally failing.
#[derive(Debug, Default)]
pub struct StaticTokenIssuer {
    failing: AtomicBool,
}

impl StaticTokenIssuer {
    /// Creates an issuer that always succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an issuer that always fails.
    pub fn failing() -> Self {
        Self { failing: AtomicBool::new(true) }
    }
}

#[async_trait]
impl TokenIssuer for StaticTokenIssuer {
    async fn generate(&self, subject_id: SubjectId, _subject_name: &str) -> Result<String> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ProcessorError::token_issue("signing key unavailable"));
        }
        Ok(format!("token-{subject_id}"))
    }
}

/// Audit sink keeping every event in memory.
#[derive(Debug, Default)]
pub struct RecordingAuditLog {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every recorded event in order.
    pub fn events(&self) -> Vec<AuditEvent> {
        guard(&self.events).clone()
    }

    /// Recorded events of `kind`.
    pub fn of_kind(&self, kind: AuditEventKind) -> Vec<AuditEvent> {
        self.events().into_iter().filter(|event| event.kind == kind).collect()
    }
}

#[async_trait]
impl AuditLog for RecordingAuditLog {
    async fn record(&self, event: AuditEvent) {
        guard(&self.events).push(event);
    }
}

/// Editable configuration source.
#[derive(Debug, Default)]
pub struct MemoryConfigSource {
    entries: Mutex<HashMap<String, String>>,
    unavailable: AtomicBool,
    loads: AtomicUsize,
}

impl MemoryConfigSource {
    /// Creates a source holding `pairs`.
    pub fn with_entries(pairs: &[(&str, &str)]) -> Self {
        let source = Self::default();
        for (key, value) in pairs {
            source.set(key, value);
        }
        source
    }

    /// Sets one entry.
    pub fn set(&self, key: &str, value: &str) {
        guard(&self.entries).insert(key.to_string(), value.to_string());
    }

    /// Removes one entry.
    pub fn remove(&self, key: &str) {
        guard(&self.entries).remove(key);
    }

    /// Makes loads fail while `unavailable` is true.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Loads attempted so far.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfigSource for MemoryConfigSource {
    async fn load(&self) -> Result<HashMap<String, String>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ProcessorError::config_load("configuration source unavailable"));
        }
        Ok(guard(&self.entries).clone())
    }
}
