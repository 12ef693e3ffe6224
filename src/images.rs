use crate::channels::emit_error;
use crate::extract::panic_message;
use crate::fetch::{FetchOutcome, ImageFetcher};
use crate::models::{ErrorRecord, ImageTask};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::shutdown::ShutdownSignal;
use crate::stats::PipelineStats;
use anyhow::Result;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What happens to a task after one fetch attempt
#[derive(Debug)]
pub enum Disposition {
    Fetched,
    Failed(ErrorRecord),
    Retry {
        task: ImageTask,
        delay: Duration,
        next_attempt: u32,
        /// Entries that failed before the 429; they are not retried
        settled: Option<ErrorRecord>,
    },
}

/// Rejects manifest entries that cannot be fetched at all.
fn check_manifest(task: &ImageTask) -> Result<(), String> {
    let broken: Vec<&str> = task
        .images
        .iter()
        .filter(|(_, meta)| meta.url.is_empty() || meta.file_name.is_empty())
        .map(|(id, _)| id.as_str())
        .collect();
    if broken.is_empty() {
        Ok(())
    } else {
        Err(format!("malformed manifest entries: {}", broken.join(", ")))
    }
}

/// Maps one fetch result to the task's next step. `task.attempts` already
/// counts the attempt that produced `result`.
pub fn classify(mut task: ImageTask, result: Result<FetchOutcome>, policy: &RetryPolicy) -> Disposition {
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            return Disposition::Failed(ErrorRecord::image(
                &task.title,
                format!("fetch failed for {}: {e:#}", task.identifiers().join(", ")),
            ))
        }
    };

    match outcome.status {
        200 => Disposition::Fetched,
        429 => {
            let earlier = outcome.error;
            match policy.on_rate_limited(task.attempts) {
                RetryDecision::Retry { delay, attempt } => {
                    let settled = earlier.map(|e| {
                        ErrorRecord::image(&task.title, format!("failed before rate limit: {e}"))
                    });
                    if !outcome.remaining.is_empty() {
                        task.images = outcome.remaining;
                    }
                    Disposition::Retry {
                        task,
                        delay,
                        next_attempt: attempt,
                        settled,
                    }
                }
                RetryDecision::GiveUp { reason } => {
                    let mut message =
                        format!("{reason}; unfetched: {}", task.identifiers().join(", "));
                    if let Some(e) = earlier {
                        message.push_str(&format!("; {e}"));
                    }
                    Disposition::Failed(ErrorRecord::image(&task.title, message))
                }
            }
        }
        404 => Disposition::Failed(ErrorRecord::image(
            &task.title,
            format!(
                "HTTP 404: {}",
                outcome
                    .error
                    .unwrap_or_else(|| format!("not found: {}", task.identifiers().join(", ")))
            ),
        )),
        status => Disposition::Failed(ErrorRecord::image(
            &task.title,
            format!(
                "HTTP {status}: {}",
                outcome.error.unwrap_or_else(|| task.identifiers().join(", "))
            ),
        )),
    }
}

pub struct ImageWorker<'a> {
    id: usize,
    fetcher: &'a dyn ImageFetcher,
    image_dir: &'a Path,
    policy: &'a RetryPolicy,
    stats: &'a PipelineStats,
    signal: &'a ShutdownSignal,
    poll_interval: Duration,
}

impl<'a> ImageWorker<'a> {
    pub fn new(
        id: usize,
        fetcher: &'a dyn ImageFetcher,
        image_dir: &'a Path,
        policy: &'a RetryPolicy,
        stats: &'a PipelineStats,
        signal: &'a ShutdownSignal,
        poll_interval: Duration,
    ) -> Self {
        Self {
            id,
            fetcher,
            image_dir,
            policy,
            stats,
            signal,
            poll_interval,
        }
    }

    /// Makes one fetch attempt for the task.
    pub fn attempt(&self, mut task: ImageTask) -> Disposition {
        if let Err(message) = check_manifest(&task) {
            return Disposition::Failed(ErrorRecord::image(&task.title, message));
        }
        task.attempts += 1;
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.fetcher.download(&task.images, self.image_dir, &task.title)
        }))
        .unwrap_or_else(|payload| {
            Err(anyhow::anyhow!("fetcher panicked: {}", panic_message(payload.as_ref())))
        });
        classify(task, result, self.policy)
    }

    fn finish(&self, error_tx: &Sender<ErrorRecord>, failure: Option<ErrorRecord>) {
        match failure {
            None => self.stats.inc_images_fetched(),
            Some(record) => {
                warn!(worker = self.id, error = %record, "Image task failed");
                self.stats.inc_image_failures();
                emit_error(error_tx, record, self.stats);
            }
        }
        self.stats.pending_images.done();
    }

    fn abandon(&self, error_tx: &Sender<ErrorRecord>, task: ImageTask) {
        self.stats.inc_abandoned();
        emit_error(
            error_tx,
            ErrorRecord::shutdown(
                &task.title,
                format!(
                    "image task abandoned after {} attempts: {}",
                    task.attempts,
                    task.identifiers().join(", ")
                ),
            ),
            self.stats,
        );
        self.stats.pending_images.done();
    }

    /// Consumes image tasks until the run terminates. Rate-limited tasks go
    /// back on `image_tx`; if that channel is full the worker keeps the task
    /// and retries it itself after the pause.
    pub fn run(
        self,
        image_rx: Receiver<ImageTask>,
        image_tx: Sender<ImageTask>,
        error_tx: Sender<ErrorRecord>,
    ) {
        debug!(worker = self.id, "Image worker started");
        let mut carried: Option<ImageTask> = None;

        loop {
            let task = match carried.take() {
                Some(task) => task,
                None => {
                    if self.signal.is_terminated() {
                        break;
                    }
                    match image_rx.recv_timeout(self.poll_interval) {
                        Ok(task) => task,
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            };

            match self.attempt(task) {
                Disposition::Fetched => self.finish(&error_tx, None),
                Disposition::Failed(record) => self.finish(&error_tx, Some(record)),
                Disposition::Retry {
                    task,
                    delay,
                    next_attempt,
                    settled,
                } => {
                    if let Some(record) = settled {
                        warn!(worker = self.id, error = %record, "Image task partly failed");
                        self.stats.inc_image_failures();
                        emit_error(&error_tx, record, self.stats);
                    }
                    self.stats.inc_rate_limit_retries();
                    info!(
                        worker = self.id,
                        title = %task.title,
                        next_attempt,
                        delay_secs = delay.as_secs_f64(),
                        "Rate limited, pausing"
                    );
                    let kept = match image_tx.try_send(task) {
                        Ok(()) => None,
                        Err(TrySendError::Full(task)) | Err(TrySendError::Disconnected(task)) => {
                            Some(task)
                        }
                    };
                    if !self.signal.pause(delay, self.poll_interval) {
                        if let Some(task) = kept {
                            self.abandon(&error_tx, task);
                        }
                        break;
                    }
                    carried = kept;
                }
            }
        }

        debug!(worker = self.id, "Image worker finished");
    }
}
