use crate::channels::{emit_error, send_until_terminated};
use crate::content;
use crate::extractor::PageExtractor;
use crate::models::{ErrorRecord, ImageTask, Images, Page, ProcessedRecord};
use crate::shutdown::ShutdownSignal;
use crate::stats::PipelineStats;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Everything one page turns into
#[derive(Debug)]
pub struct Extracted {
    pub record: ProcessedRecord,
    pub image_task: Option<ImageTask>,
    pub errors: Vec<ErrorRecord>,
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs a collaborator call, turning a panic into an error message.
fn guarded<T>(what: &str, f: impl FnOnce() -> T) -> Result<T, String> {
    panic::catch_unwind(AssertUnwindSafe(f))
        .map_err(|payload| format!("{what} panicked: {}", panic_message(payload.as_ref())))
}

pub struct ExtractionWorker<'a> {
    id: usize,
    extractor: &'a dyn PageExtractor,
    image_dir: &'a Path,
    download_images: bool,
    stats: &'a PipelineStats,
    signal: &'a ShutdownSignal,
    poll_interval: Duration,
}

impl<'a> ExtractionWorker<'a> {
    pub fn new(
        id: usize,
        extractor: &'a dyn PageExtractor,
        image_dir: &'a Path,
        download_images: bool,
        stats: &'a PipelineStats,
        signal: &'a ShutdownSignal,
        poll_interval: Duration,
    ) -> Self {
        Self {
            id,
            extractor,
            image_dir,
            download_images,
            stats,
            signal,
            poll_interval,
        }
    }

    /// Turns one page into exactly one record. Collaborator failures become
    /// error records and best-effort field values; they never lose the page.
    pub fn process(&self, page: Page) -> Extracted {
        let Page {
            title, raw_text, ..
        } = page;
        let mut errors = Vec::new();
        let mut image_task = None;

        let images = if self.download_images {
            match guarded("image extraction", || {
                self.extractor.extract_images(&raw_text, self.image_dir)
            }) {
                Ok((manifest, extraction_error)) => {
                    if let Some(message) = extraction_error {
                        errors.push(ErrorRecord::extraction(&title, message));
                    }
                    if !manifest.is_empty() {
                        image_task = Some(ImageTask::new(title.clone(), manifest.clone()));
                    }
                    Images::from_manifest(manifest)
                }
                Err(message) => {
                    errors.push(ErrorRecord::extraction(&title, message));
                    Images::None
                }
            }
        } else {
            Images::None
        };

        let categories = guarded("category extraction", || {
            self.extractor.extract_categories(&raw_text)
        })
        .unwrap_or_else(|message| {
            errors.push(ErrorRecord::extraction(&title, message));
            Vec::new()
        });

        let normalized = content::normalize_text(&raw_text);
        let sentences = match guarded("cleaning", || self.extractor.clean(&normalized)) {
            Ok(Ok(cleaned)) => cleaned,
            Ok(Err(e)) => {
                errors.push(ErrorRecord::extraction(&title, format!("cleaning failed: {e:#}")));
                normalized
            }
            Err(message) => {
                errors.push(ErrorRecord::extraction(&title, message));
                normalized
            }
        };

        Extracted {
            record: ProcessedRecord {
                page: title,
                sentences: sentences.into_bytes(),
                categories,
                images,
            },
            image_task,
            errors,
        }
    }

    /// Consumes pages until the channel closes or the run terminates.
    pub fn run(
        self,
        article_rx: Receiver<Page>,
        result_tx: Sender<ProcessedRecord>,
        image_tx: Option<Sender<ImageTask>>,
        error_tx: Sender<ErrorRecord>,
    ) {
        debug!(worker = self.id, "Extraction worker started");
        let mut processed = 0u64;

        loop {
            if self.signal.is_terminated() {
                break;
            }
            let page = match article_rx.recv_timeout(self.poll_interval) {
                Ok(page) => page,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            let Extracted {
                record,
                image_task,
                errors,
            } = self.process(page);
            let title = record.page.clone();

            self.stats.pending_results.add();
            if result_tx.send(record).is_err() {
                self.stats.pending_results.done();
                warn!(worker = self.id, title = %title, "Result channel closed, record dropped");
            }

            if let (Some(task), Some(tx)) = (image_task, image_tx.as_ref()) {
                self.stats.pending_images.add();
                if let Err(task) = send_until_terminated(tx, task, self.signal, self.poll_interval) {
                    self.stats.pending_images.done();
                    self.stats.inc_abandoned();
                    emit_error(
                        &error_tx,
                        ErrorRecord::shutdown(
                            &task.title,
                            format!("image task abandoned before queueing: {}", task.identifiers().join(", ")),
                        ),
                        self.stats,
                    );
                }
            }

            if !errors.is_empty() {
                self.stats.inc_extraction_failures();
            }
            for error in errors {
                emit_error(&error_tx, error, self.stats);
            }

            self.stats.pending_pages.done();
            processed += 1;
        }

        debug!(worker = self.id, processed, "Extraction worker finished");
    }
}
