// External step execution with retry

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::RetryPolicy;
use crate::core::step::Step;
use crate::error::{PipelineError, PipelineResult};

/// Environment variable the processing applications read their thread count from.
pub const THREADS_ENV: &str = "ITK_GLOBAL_DEFAULT_NUMBER_OF_THREADS";

/// Raw result of one process invocation.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutput {
    pub success: bool,
    /// Exit code; `None` when the process was killed by a signal.
    pub code: Option<i32>,
    /// Captured standard output, only when the step asked for it.
    pub stdout: Vec<u8>,
}

impl ExecutionOutput {
    pub fn status_text(&self) -> String {
        match self.code {
            Some(code) => format!("exit status {code}"),
            None => "termination by signal".to_string(),
        }
    }
}

/// Runs one attempt of a step. Implementations must not retry.
#[async_trait]
pub trait StepRunner: Send + Sync {
    async fn run(&self, step: &Step) -> PipelineResult<ExecutionOutput>;
}

/// Runner spawning real processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

#[async_trait]
impl StepRunner for ProcessRunner {
    async fn run(&self, step: &Step) -> PipelineResult<ExecutionOutput> {
        let mut cmd = Command::new(&step.program);
        cmd.args(step.os_args());
        cmd.stdin(Stdio::null());
        cmd.stderr(Stdio::inherit());
        if step.out_file.is_some() {
            cmd.stdout(Stdio::piped());
        } else {
            cmd.stdout(Stdio::inherit());
        }
        if let Some(threads) = step.threads {
            cmd.env(THREADS_ENV, threads.to_string());
        }
        cmd.kill_on_drop(true);

        let output = cmd.output().await.map_err(|source| PipelineError::Spawn {
            step: step.name.clone(),
            program: step.program.clone(),
            source,
        })?;

        Ok(ExecutionOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: output.stdout,
        })
    }
}

/// Summary of a completed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepOutcome {
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Executes steps through a runner, applying the retry policy and the
/// completion check on declared outputs.
#[derive(Clone)]
pub struct StepExecutor {
    runner: Arc<dyn StepRunner>,
    retry: RetryPolicy,
    /// Leave partial outputs of failed steps in place.
    keep_partial_outputs: bool,
}

impl StepExecutor {
    pub fn new(runner: Arc<dyn StepRunner>, retry: RetryPolicy, keep_partial_outputs: bool) -> Self {
        Self {
            runner,
            retry,
            keep_partial_outputs,
        }
    }

    /// Run a step to completion.
    ///
    /// On success the exit status was zero, the captured output (if any) has
    /// been fully written and every declared output exists.
    pub async fn execute(&self, step: &Step) -> PipelineResult<StepOutcome> {
        let max_attempts = if step.retry { self.retry.max_attempts.max(1) } else { 1 };
        let start = Instant::now();

        let mut attempt = 1;
        loop {
            info!("Running step {}", step.name);
            debug!("{}", step.command_line());

            match self.attempt(step, attempt).await {
                Ok(()) => {
                    let elapsed = start.elapsed();
                    info!(
                        "Step {} finished in {:.1}s",
                        step.name,
                        elapsed.as_secs_f64()
                    );
                    return Ok(StepOutcome {
                        attempts: attempt,
                        elapsed,
                    });
                }
                // the program itself is missing, retrying will not help
                Err(err @ PipelineError::Spawn { .. }) => {
                    self.discard_outputs(step).await;
                    return Err(err);
                }
                Err(err) if attempt < max_attempts => {
                    let delay = self.retry.backoff * attempt;
                    warn!(
                        "Step {} failed ({}), retrying in {:?} (attempt {}/{})",
                        step.name, err, delay, attempt, max_attempts
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    self.discard_outputs(step).await;
                    return Err(err);
                }
            }
        }
    }

    async fn attempt(&self, step: &Step, attempt: u32) -> PipelineResult<()> {
        let output = self.runner.run(step).await?;

        if !output.success {
            return Err(PipelineError::StepFailed {
                step: step.name.clone(),
                status: output.status_text(),
                attempts: attempt,
            });
        }

        if let Some(out_file) = &step.out_file {
            tokio::fs::write(out_file, &output.stdout)
                .await
                .map_err(|e| PipelineError::io(out_file, e))?;
        }

        for path in &step.outputs {
            if tokio::fs::metadata(path).await.is_err() {
                return Err(PipelineError::MissingOutput {
                    step: step.name.clone(),
                    path: path.clone(),
                });
            }
        }

        Ok(())
    }

    /// Best-effort removal of whatever a failed step left behind.
    async fn discard_outputs(&self, step: &Step) {
        if self.keep_partial_outputs {
            return;
        }
        for path in step.outputs.iter().chain(step.out_file.iter()) {
            if tokio::fs::remove_file(path).await.is_ok() {
                debug!("Removed partial output {}", path.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls, then succeeds writing `outputs`.
    struct FlakyRunner {
        failures: u32,
        calls: AtomicU32,
        stdout: Vec<u8>,
        write_outputs: bool,
    }

    impl FlakyRunner {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
                stdout: Vec::new(),
                write_outputs: true,
            }
        }
    }

    #[async_trait]
    impl StepRunner for FlakyRunner {
        async fn run(&self, step: &Step) -> PipelineResult<ExecutionOutput> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            // a failing job may still leave a partial file behind
            for path in &step.outputs {
                if self.write_outputs || call < self.failures {
                    std::fs::write(path, b"partial").unwrap();
                }
            }
            if call < self.failures {
                return Ok(ExecutionOutput {
                    success: false,
                    code: Some(1),
                    stdout: Vec::new(),
                });
            }
            Ok(ExecutionOutput {
                success: true,
                code: Some(0),
                stdout: self.stdout.clone(),
            })
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_retryable_step_recovers_from_one_failure() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FlakyRunner::new(1));
        let executor = StepExecutor::new(runner.clone(), fast_policy(3), false);

        let step = Step::new("ImageClassifier_31TCJ", "classifier")
            .output(dir.path().join("map.tif"))
            .retryable();

        let outcome = executor.execute(&step).await.unwrap();
        assert_eq!(outcome.attempts, 2);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_step_fails_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("model.txt");
        let runner = Arc::new(FlakyRunner::new(1));
        let executor = StepExecutor::new(runner.clone(), fast_policy(3), false);

        let step = Step::new("TrainImagesClassifier", "trainer").output(&out);

        let err = executor.execute(&step).await.unwrap_err();
        assert!(matches!(err, PipelineError::StepFailed { attempts: 1, .. }));
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
        // partial output discarded
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let runner = Arc::new(FlakyRunner::new(10));
        let executor = StepExecutor::new(runner.clone(), fast_policy(3), true);

        let step = Step::new("ImageClassifier_31TCJ", "classifier").retryable();
        let err = executor.execute(&step).await.unwrap_err();
        assert!(matches!(err, PipelineError::StepFailed { attempts: 3, .. }));
        assert_eq!(runner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_keep_partial_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("partial.tif");
        let executor = StepExecutor::new(Arc::new(FlakyRunner::new(1)), fast_policy(1), true);

        let step = Step::new("Convert", "gdal_translate").output(&out);
        assert!(executor.execute(&step).await.is_err());
        assert!(out.exists());
    }

    #[tokio::test]
    async fn test_stdout_is_captured() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("quality-metrics.txt");
        let mut runner = FlakyRunner::new(0);
        runner.stdout = b"Kappa: 0.9\n".to_vec();
        let executor = StepExecutor::new(Arc::new(runner), fast_policy(1), false);

        let step = Step::new("ComputeConfusionMatrix_1", "otbcli").capture_stdout(&out);
        executor.execute(&step).await.unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "Kappa: 0.9\n");
    }

    #[tokio::test]
    async fn test_missing_declared_output_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = FlakyRunner::new(0);
        runner.write_outputs = false;
        let executor = StepExecutor::new(Arc::new(runner), fast_policy(1), false);

        let step = Step::new("Nodata", "gdal_edit.py").output(dir.path().join("never.tif"));
        let err = executor.execute(&step).await.unwrap_err();
        assert!(matches!(err, PipelineError::MissingOutput { .. }));
    }

    #[tokio::test]
    async fn test_process_runner_spawn_failure() {
        let executor = StepExecutor::new(Arc::new(ProcessRunner), fast_policy(3), false);
        let step = Step::new("Nope", "/definitely/not/a/program").retryable();
        let err = executor.execute(&step).await.unwrap_err();
        assert!(matches!(err, PipelineError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("echo.txt");
        let executor = StepExecutor::new(Arc::new(ProcessRunner), fast_policy(1), false);

        let step = Step::new("Echo", "echo")
            .args(crate::core::step::StepArgs::new().value("hello"))
            .capture_stdout(&out);
        executor.execute(&step).await.unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "hello\n");

        let step = Step::new("False", "false");
        let err = executor.execute(&step).await.unwrap_err();
        assert!(err.to_string().contains("exit status 1"));
    }
}
