//! Request admission: validation of submissions and a bounded wait queue in
//! front of a fixed number of execution slots.

use crate::config::{Config, ResourceLimits};
use crate::error::{Error, Result};
use crate::language::Language;
use crate::sandbox::ExecutionRequest;
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Raw submission as received from a client.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct Submission {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub limits: Option<LimitOverrides>,
}

/// Per-request limits. They can only lower the server's ceilings.
#[derive(Debug, Default, Clone, Copy, Deserialize)]
pub struct LimitOverrides {
    pub time_ms: Option<u64>,
    pub memory_kb: Option<u64>,
    pub output_bytes: Option<usize>,
}

/// Holds an execution slot until dropped.
#[derive(Debug)]
pub struct Permit {
    _permit: OwnedSemaphorePermit,
}

#[derive(Debug)]
pub struct Admission {
    slots: Arc<Semaphore>,
    capacity: usize,
    max_queue: usize,
    queued: Arc<AtomicUsize>,
    max_code_bytes: usize,
    max_input_bytes: usize,
    ceilings: ResourceLimits,
}

impl Admission {
    pub fn new(config: &Config) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(config.max_concurrent)),
            capacity: config.max_concurrent,
            max_queue: config.max_queue,
            queued: Arc::new(AtomicUsize::new(0)),
            max_code_bytes: config.max_code_bytes,
            max_input_bytes: config.max_input_bytes,
            ceilings: config.limits,
        }
    }

    /// Check a submission and turn it into an [`ExecutionRequest`] with a
    /// fresh request id.
    pub fn validate(&self, submission: Submission) -> Result<ExecutionRequest> {
        let code = submission.code.unwrap_or_default();
        if code.trim().is_empty() {
            return Err(Error::InvalidInput("code must not be empty".to_string()));
        }
        if code.len() > self.max_code_bytes {
            return Err(Error::InvalidInput(format!(
                "code is {} bytes, the limit is {}",
                code.len(),
                self.max_code_bytes
            )));
        }

        let stdin = submission.input.unwrap_or_default();
        if stdin.len() > self.max_input_bytes {
            return Err(Error::InvalidInput(format!(
                "input is {} bytes, the limit is {}",
                stdin.len(),
                self.max_input_bytes
            )));
        }

        let language = match submission.language.as_deref() {
            None | Some("") => Language::default(),
            Some(name) => name.parse()?,
        };

        Ok(ExecutionRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            code,
            stdin,
            language,
            limits: self.clamp(submission.limits.unwrap_or_default()),
        })
    }

    fn clamp(&self, overrides: LimitOverrides) -> ResourceLimits {
        let ceilings = self.ceilings;
        let lower = |requested: Option<u64>, ceiling: u64| {
            requested.filter(|v| *v > 0).map_or(ceiling, |v| v.min(ceiling))
        };
        ResourceLimits {
            time_ms: lower(overrides.time_ms, ceilings.time_ms),
            memory_kb: lower(overrides.memory_kb, ceilings.memory_kb),
            output_bytes: overrides
                .output_bytes
                .filter(|v| *v > 0)
                .map_or(ceilings.output_bytes, |v| v.min(ceilings.output_bytes)),
            ..ceilings
        }
    }

    /// Wait for a free execution slot. Fails fast with [`Error::Overloaded`]
    /// when `max_queue` callers are already waiting.
    pub async fn admit(&self) -> Result<Permit> {
        if let Ok(permit) = self.slots.clone().try_acquire_owned() {
            return Ok(Permit { _permit: permit });
        }

        let _waiting = QueueSlot::claim(&self.queued, self.max_queue).ok_or(Error::Overloaded)?;
        debug!(queued = self.queued(), "Waiting for an execution slot");
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| Error::Internal(format!("admission closed: {}", e)))?;
        Ok(Permit { _permit: permit })
    }

    pub fn in_flight(&self) -> usize {
        self.capacity - self.slots.available_permits()
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A place in the wait queue, given back when dropped (including when the
/// waiting future is cancelled).
struct QueueSlot {
    counter: Arc<AtomicUsize>,
}

impl QueueSlot {
    fn claim(counter: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| Self { counter: counter.clone() })
    }
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn admission(max_concurrent: usize, max_queue: usize) -> Admission {
        let config = Config {
            max_concurrent,
            max_queue,
            ..Config::default()
        };
        Admission::new(&config)
    }

    fn submission(code: Option<&str>) -> Submission {
        Submission {
            code: code.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn rejects_missing_and_blank_code() {
        let admission = admission(1, 1);
        assert!(matches!(admission.validate(submission(None)), Err(Error::InvalidInput(_))));
        assert!(matches!(admission.validate(submission(Some(""))), Err(Error::InvalidInput(_))));
        assert!(matches!(admission.validate(submission(Some("  \n"))), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn rejects_oversized_code_and_input() {
        let admission = admission(1, 1);
        let big = "x".repeat(64 * 1024 + 1);
        assert!(matches!(admission.validate(submission(Some(&big))), Err(Error::InvalidInput(_))));

        let huge_input = Submission {
            code: Some("print(1)".to_string()),
            input: Some("y".repeat(1024 * 1024 + 1)),
            ..Default::default()
        };
        assert!(matches!(admission.validate(huge_input), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn assigns_unique_ids_and_defaults() {
        let admission = admission(1, 1);
        let a = admission.validate(submission(Some("print(1)"))).unwrap();
        let b = admission.validate(submission(Some("print(1)"))).unwrap();
        assert_ne!(a.request_id, b.request_id);
        assert_eq!(a.language, Language::Python);
        assert_eq!(a.stdin, "");
        assert_eq!(a.limits, Config::default().limits);
    }

    #[test]
    fn unknown_language_is_invalid_input() {
        let admission = admission(1, 1);
        let sub = Submission {
            code: Some("x".to_string()),
            language: Some("brainfuck".to_string()),
            ..Default::default()
        };
        assert!(matches!(admission.validate(sub), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn overrides_only_lower_limits() {
        let admission = admission(1, 1);
        let sub = Submission {
            code: Some("x".to_string()),
            limits: Some(LimitOverrides {
                time_ms: Some(1000),
                memory_kb: Some(u64::MAX),
                output_bytes: Some(0),
            }),
            ..Default::default()
        };
        let request = admission.validate(sub).unwrap();
        let defaults = Config::default().limits;
        assert_eq!(request.limits.time_ms, 1000);
        assert_eq!(request.limits.memory_kb, defaults.memory_kb);
        assert_eq!(request.limits.output_bytes, defaults.output_bytes);
    }

    #[tokio::test]
    async fn full_queue_is_rejected() {
        let admission = Arc::new(admission(1, 1));
        let held = admission.admit().await.unwrap();
        assert_eq!(admission.in_flight(), 1);

        let waiter = {
            let admission = admission.clone();
            tokio::spawn(async move { admission.admit().await.map(|_| ()) })
        };
        while admission.queued() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(matches!(admission.admit().await, Err(Error::Overloaded)));

        drop(held);
        waiter.await.unwrap().unwrap();
        assert_eq!(admission.queued(), 0);
        assert_eq!(admission.in_flight(), 0);
    }

    #[tokio::test]
    async fn abandoned_waiter_leaves_the_queue() {
        let admission = admission(1, 1);
        let _held = admission.admit().await.unwrap();

        let attempt = tokio::time::timeout(Duration::from_millis(20), admission.admit()).await;
        assert!(attempt.is_err());
        assert_eq!(admission.queued(), 0);
    }
}
