//! Wikiflow: streaming Wikipedia dump extraction
//!
//! This crate turns a MediaWiki XML export into a stream of cleaned article
//! records, with an optional image download stage:
//!
//! 1. **Reading** -- Stream `<page>` elements out of `.xml` or multistream
//!    `.bz2` dumps, keeping pages whose namespace passes the filter
//! 2. **Extraction** -- A worker pool cleans each page's wikitext, pulls out its
//!    categories and plans downloads for the images it references
//! 3. **Image download** -- An optional worker pool fetches planned images,
//!    pausing and requeueing on HTTP 429 with capped exponential backoff
//! 4. **Persistence** -- One writer per sink appends results (bincode stream)
//!    and error records (JSON Lines)
//!
//! # Architecture
//!
//! - **Bounded channels** -- Every stage hand-off is a bounded crossbeam channel,
//!   so a slow consumer suspends its producers instead of growing memory
//! - **Scoped threads** -- Each stage runs on a named thread inside one
//!   `std::thread::scope`; no async runtime is involved
//! - **Single shutdown signal** -- Stages re-read one shared signal whenever they
//!   wake from a receive, a send or a pause
//! - **Pending counters** -- Atomic per-channel work counts make "everything is
//!   drained" an exact check rather than a sampled guess
//! - **Nothing lost silently** -- Every page that enters the pipeline ends as a
//!   result record, an error record or both
//!
//! # Key Modules
//!
//! - [`source`] -- Dump opening with BZ2 multistream decompression
//! - [`parser`] -- Streaming XML reader with namespace filtering
//! - [`content`] -- Wikitext normalization, cleaning and category parsing
//! - [`extractor`] -- Extraction collaborators behind the [`extractor::PageExtractor`] trait
//! - [`extract`] -- Extraction worker
//! - [`fetch`] -- Image download collaborators behind the [`fetch::ImageFetcher`] trait
//! - [`images`] -- Image download worker and 429 handling
//! - [`retry`] -- Rate-limit backoff policy
//! - [`sink`] -- Result/error sinks, readers and the writer loop
//! - [`monitor`] -- Channel depth probe and periodic status reporting
//! - [`shutdown`] -- Shutdown signal and drain coordinator
//! - [`pipeline`] -- Stage wiring
//! - [`stats`] -- Atomic counters and pending-work accounting
//! - [`config`] -- Constants and runtime configuration
//!
//! # Example Usage
//!
//! ```bash
//! # Extract main-namespace articles without images
//! wikiflow run -i enwiki-latest-pages-articles.xml.bz2 -o out/records.bin -e out/errors.jsonl
//!
//! # Also download images, with 40 fetch workers
//! wikiflow run -i dump.xml -o records.bin -e errors.jsonl --download-images true --image-workers 40
//!
//! # Summarise what a run produced
//! wikiflow inspect --results records.bin --errors errors.jsonl
//! ```

pub mod channels;
pub mod config;
pub mod content;
pub mod error;
pub mod extract;
pub mod extractor;
pub mod fetch;
pub mod images;
pub mod models;
pub mod monitor;
pub mod parser;
pub mod pipeline;
pub mod retry;
pub mod shutdown;
pub mod sink;
pub mod source;
pub mod stats;
