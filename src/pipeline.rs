//! Wires the stages together and runs them to completion.
//!
//! ```text
//! reader --articles--> extraction xN --results--> result writer
//!                         |    \
//!                      images   errors ------------> error writer
//!                         |
//!                   image download xM (429: requeue + pause)
//! ```
//!
//! Every stage runs on its own named thread inside one `thread::scope`; the
//! calling thread acts as the shutdown coordinator.

use crate::channels::{emit_error, send_until_terminated};
use crate::config::PipelineConfig;
use crate::error::{StartupError, StreamError};
use crate::extract::{panic_message, ExtractionWorker};
use crate::extractor::PageExtractor;
use crate::fetch::ImageFetcher;
use crate::images::ImageWorker;
use crate::models::{ErrorRecord, ImageTask, Page, ProcessedRecord};
use crate::monitor::{ChannelProbe, StatusMonitor};
use crate::parser::{DumpReader, ReadOutcome};
use crate::retry::RetryPolicy;
use crate::shutdown::{ShutdownCoordinator, ShutdownSignal};
use crate::sink::{BincodeSink, JsonLinesSink, RecordSink, RecordWriter};
use crate::stats::{PipelineStats, StatsSnapshot};
use crossbeam_channel::{bounded, Receiver, Sender};
use indicatif::ProgressBar;
use std::fs;
use std::io::BufRead;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, Scope, ScopedJoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[derive(Debug)]
pub struct RunSummary {
    pub stats: StatsSnapshot,
    /// The drain timeout expired with work still in flight
    pub forced: bool,
    pub drain_time: Duration,
    pub elapsed: Duration,
    /// Set when the dump became unreadable before its end
    pub stream_error: Option<StreamError>,
}

impl RunSummary {
    pub fn is_clean(&self) -> bool {
        !self.forced && self.stream_error.is_none()
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    extractor: Arc<dyn PageExtractor>,
    fetcher: Arc<dyn ImageFetcher>,
    progress: Option<ProgressBar>,
}

fn spawn_stage<'scope, 'env, T, F>(
    scope: &'scope Scope<'scope, 'env>,
    signal: &ShutdownSignal,
    name: String,
    f: F,
) -> Result<ScopedJoinHandle<'scope, T>, StartupError>
where
    F: FnOnce() -> T + Send + 'scope,
    T: Send + 'scope,
{
    thread::Builder::new()
        .name(name.clone())
        .spawn_scoped(scope, f)
        .map_err(|source| {
            // Stages already running must not wait for work that will never come.
            signal.terminate(true);
            StartupError::Spawn { name, source }
        })
}

fn join_stage<T>(handle: ScopedJoinHandle<'_, T>) -> Option<T> {
    let name = handle.thread().name().unwrap_or("stage").to_string();
    match handle.join() {
        Ok(value) => Some(value),
        Err(_) => {
            error!(stage = %name, "Stage panicked");
            None
        }
    }
}

fn forward_pages<R: BufRead>(
    reader: DumpReader<R>,
    article_tx: &Sender<Page>,
    error_tx: &Sender<ErrorRecord>,
    stats: &PipelineStats,
    signal: &ShutdownSignal,
    poll_interval: Duration,
) -> Result<(), StreamError> {
    for outcome in reader {
        match outcome {
            Ok(ReadOutcome::Page(page)) => {
                stats.pending_pages.add();
                if let Err(page) = send_until_terminated(article_tx, page, signal, poll_interval) {
                    stats.pending_pages.done();
                    warn!(title = %page.title, "Reader stopped by shutdown");
                    break;
                }
                stats.inc_pages_read();
            }
            Ok(ReadOutcome::Rejected { title, reason }) => {
                warn!(title = %title, reason = %reason, "Skipping page");
                emit_error(error_tx, ErrorRecord::reader(title, reason), stats);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Feeds pages from the dump into the article channel, then starts the drain.
/// A stream error or a panic inside the decoder ends the feed early; either
/// way the pages already sent are drained.
fn feed_pages<R: BufRead>(
    reader: DumpReader<R>,
    article_tx: Sender<Page>,
    error_tx: Sender<ErrorRecord>,
    stats: &PipelineStats,
    signal: &ShutdownSignal,
    poll_interval: Duration,
) -> Result<(), StreamError> {
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        forward_pages(reader, &article_tx, &error_tx, stats, signal, poll_interval)
    }))
    .unwrap_or_else(|payload| {
        Err(StreamError::Panicked {
            message: panic_message(payload.as_ref()),
        })
    });

    if let Err(e) = &result {
        error!(error = %e, "Dump stream is unreadable, draining what was read");
        emit_error(&error_tx, ErrorRecord::reader("<dump>", e.to_string()), stats);
    }

    drop(article_tx);
    signal.begin_draining();
    info!(pages = stats.pages(), "Reader finished");
    result
}

/// Turns work still queued after termination into shutdown error records.
fn abandon_leftovers(
    articles: &Receiver<Page>,
    images: Option<&Receiver<ImageTask>>,
    error_tx: &Sender<ErrorRecord>,
    stats: &PipelineStats,
) {
    for page in articles.try_iter() {
        stats.inc_abandoned();
        emit_error(
            error_tx,
            ErrorRecord::shutdown(&page.title, "page was never extracted"),
            stats,
        );
        stats.pending_pages.done();
    }
    if let Some(images) = images {
        for task in images.try_iter() {
            stats.inc_abandoned();
            emit_error(
                error_tx,
                ErrorRecord::shutdown(
                    &task.title,
                    format!(
                        "image task never completed after {} attempts: {}",
                        task.attempts,
                        task.identifiers().join(", ")
                    ),
                ),
                stats,
            );
            stats.pending_images.done();
        }
    }
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        extractor: Arc<dyn PageExtractor>,
        fetcher: Arc<dyn ImageFetcher>,
    ) -> Self {
        Self {
            config,
            extractor,
            fetcher,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Opens the dump and both output files, then runs the pipeline over them.
    pub fn run_files(
        &self,
        input: &Path,
        results: &Path,
        errors: &Path,
    ) -> Result<RunSummary, StartupError> {
        self.config.validate()?;
        let reader = DumpReader::open(input, self.config.namespace_filter.clone())?;
        let result_sink = BincodeSink::create(results)?;
        let error_sink = JsonLinesSink::create(errors)?;
        if self.config.image_download_enabled {
            fs::create_dir_all(&self.config.image_dir).map_err(|source| {
                StartupError::CreateOutput {
                    what: "image directory",
                    path: self.config.image_dir.clone(),
                    source,
                }
            })?;
        }
        self.run(reader, result_sink, error_sink)
    }

    /// Runs every stage until the dump is exhausted and all in-flight work is
    /// persisted, or until the drain timeout forces termination.
    pub fn run<R, RS, ES>(
        &self,
        reader: DumpReader<R>,
        result_sink: RS,
        error_sink: ES,
    ) -> Result<RunSummary, StartupError>
    where
        R: BufRead + Send,
        RS: RecordSink<ProcessedRecord>,
        ES: RecordSink<ErrorRecord>,
    {
        let config = &self.config;
        config.validate()?;
        let started = Instant::now();
        let poll = config.poll_interval;

        let (article_tx, article_rx) = bounded::<Page>(config.article_channel_capacity);
        let (result_tx, result_rx) = bounded::<ProcessedRecord>(config.result_channel_capacity);
        let (error_tx, error_rx) = bounded::<ErrorRecord>(config.error_channel_capacity);
        let (image_tx, image_rx) = if config.image_download_enabled {
            let (tx, rx) = bounded::<ImageTask>(config.image_channel_capacity);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let probe = ChannelProbe::new(
            article_rx.clone(),
            image_rx.clone(),
            result_rx.clone(),
            error_rx.clone(),
        );
        let stats = PipelineStats::new();
        let signal = ShutdownSignal::new();
        let policy = RetryPolicy::from_config(config);

        info!(
            extraction_workers = config.extraction_workers,
            image_workers = if config.image_download_enabled { config.image_workers } else { 0 },
            "Starting pipeline"
        );

        let (drain, stream_error) = {
            let (stats, signal, probe, policy) = (&stats, &signal, &probe, &policy);
            let extractor: &dyn PageExtractor = self.extractor.as_ref();
            let fetcher: &dyn ImageFetcher = self.fetcher.as_ref();
            let image_dir = config.image_dir.as_path();
            let progress = self.progress.clone();

            thread::scope(move |s| -> Result<_, StartupError> {
                let result_writer = spawn_stage(s, signal, "result-writer".to_string(), move || {
                    RecordWriter::new("results", result_sink, &stats.pending_results, signal, poll)
                        .run(result_rx, |ok| {
                            if ok {
                                stats.inc_records_written()
                            } else {
                                stats.inc_write_failures()
                            }
                        })
                })?;
                let error_writer = spawn_stage(s, signal, "error-writer".to_string(), move || {
                    RecordWriter::new("errors", error_sink, &stats.pending_errors, signal, poll)
                        .run(error_rx, |ok| {
                            if ok {
                                stats.inc_errors_written()
                            } else {
                                stats.inc_write_failures()
                            }
                        })
                })?;

                let mut workers = Vec::new();
                if let (Some(image_tx), Some(image_rx)) = (&image_tx, &image_rx) {
                    for id in 0..config.image_workers {
                        let (rx, tx, errors) = (image_rx.clone(), image_tx.clone(), error_tx.clone());
                        workers.push(spawn_stage(s, signal, format!("image-{id}"), move || {
                            ImageWorker::new(id, fetcher, image_dir, policy, stats, signal, poll)
                                .run(rx, tx, errors)
                        })?);
                    }
                }
                for id in 0..config.extraction_workers {
                    let rx = article_rx.clone();
                    let (results, images, errors) =
                        (result_tx.clone(), image_tx.clone(), error_tx.clone());
                    workers.push(spawn_stage(s, signal, format!("extract-{id}"), move || {
                        ExtractionWorker::new(
                            id,
                            extractor,
                            image_dir,
                            config.image_download_enabled,
                            stats,
                            signal,
                            poll,
                        )
                        .run(rx, results, images, errors)
                    })?);
                }
                drop(result_tx);
                drop(image_tx);

                let reader_errors = error_tx.clone();
                let reader_stage = spawn_stage(s, signal, "dump-reader".to_string(), move || {
                    feed_pages(reader, article_tx, reader_errors, stats, signal, poll)
                })?;

                let monitor = spawn_stage(s, signal, "status-monitor".to_string(), move || {
                    let monitor =
                        StatusMonitor::new(probe, stats, signal, config.status_interval, poll);
                    match progress {
                        Some(pb) => monitor.with_progress(pb).run(),
                        None => monitor.run(),
                    }
                })?;

                let drain =
                    ShutdownCoordinator::new(signal, stats, probe, config.drain_timeout, poll).run();

                for worker in workers {
                    join_stage(worker);
                }
                let stream_error = join_stage(reader_stage).and_then(Result::err);

                abandon_leftovers(&article_rx, image_rx.as_ref(), &error_tx, stats);
                drop(error_tx);

                join_stage(result_writer);
                join_stage(error_writer);
                join_stage(monitor);
                Ok((drain, stream_error))
            })?
        };

        let summary = RunSummary {
            stats: stats.snapshot(),
            forced: drain.forced,
            drain_time: drain.drain_time,
            elapsed: started.elapsed(),
            stream_error,
        };
        info!(
            pages = summary.stats.pages_read,
            records = summary.stats.records_written,
            errors = summary.stats.errors_written,
            forced = summary.forced,
            elapsed_secs = summary.elapsed.as_secs_f64(),
            "Pipeline finished"
        );
        Ok(summary)
    }
}
