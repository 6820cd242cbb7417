//! Ties admission to the sandbox: one blocking worker per admitted request.

use crate::admission::{Admission, Submission};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::sandbox::{ExecutionRequest, ExecutionResult, Sandbox};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, info_span, Instrument};

pub struct Executor {
    admission: Admission,
    sandbox: Sandbox,
    config: Config,
}

impl Executor {
    pub fn new(config: Config) -> Self {
        Self {
            admission: Admission::new(&config),
            sandbox: Sandbox::new(&config),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn admission(&self) -> &Admission {
        &self.admission
    }

    /// Validate and run a raw submission.
    pub async fn submit(&self, submission: Submission) -> Result<ExecutionResult> {
        let request = self.admission.validate(submission)?;
        self.execute(request).await
    }

    /// Run an admitted request on the blocking pool.
    ///
    /// Dropping the returned future (for example when the HTTP client goes
    /// away) raises the cancel flag; the sandbox then kills the process group
    /// and cleans up without waiting for the timeout.
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        let span = info_span!("execute", request_id = %request.request_id);
        async move {
            let permit = self.admission.admit().await?;
            let cancel = CancelOnDrop::new();
            let flag = cancel.flag();
            let sandbox = self.sandbox.clone();
            let worker_span = tracing::Span::current();

            let result = tokio::task::spawn_blocking(move || {
                let _enter = worker_span.enter();
                // The slot stays taken until the process group is reaped.
                let _permit = permit;
                sandbox.run(&request, &flag)
            })
            .await
            .map_err(|e| Error::Internal(format!("sandbox worker: {}", e)))?;

            if let Ok(result) = &result {
                info!(status = ?result.status, duration_ms = result.duration_ms, "Execution finished");
            }
            drop(cancel);
            result
        }
        .instrument(span)
        .await
    }
}

/// Raises a shared flag when dropped.
struct CancelOnDrop {
    flag: Arc<AtomicBool>,
}

impl CancelOnDrop {
    fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    fn flag(&self) -> Arc<AtomicBool> {
        self.flag.clone()
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.flag.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::ExitStatus;
    use crate::test_utils::{python_available, test_config};

    #[tokio::test]
    async fn submit_runs_python() {
        if !python_available() {
            return;
        }
        let (config, _root) = test_config();
        let executor = Executor::new(config);
        let result = executor
            .submit(Submission {
                code: Some("print(int(input()) * 2)".to_string()),
                input: Some("21\n".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.status, ExitStatus::Completed);
        assert_eq!(result.stdout, b"42\n");
        assert_eq!(executor.admission().in_flight(), 0);
    }

    #[tokio::test]
    async fn invalid_submission_never_runs() {
        let (config, root) = test_config();
        let executor = Executor::new(config);
        let err = executor.submit(Submission::default()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn cancel_guard_raises_flag_on_drop() {
        let guard = CancelOnDrop::new();
        let flag = guard.flag();
        assert!(!flag.load(Ordering::Relaxed));
        drop(guard);
        assert!(flag.load(Ordering::Relaxed));
    }
}
