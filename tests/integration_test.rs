//! End-to-end tests for the wikiflow pipeline.
//!
//! Each test writes a small dump fixture (plain XML or BZ2) into its own
//! TempDir, runs the full pipeline over it and reads both output files back.
//! Collaborators are swapped for fakes where a test needs to control image
//! fetching or extraction failures; everything else is the real stack.

use bzip2::write::BzEncoder;
use bzip2::Compression;
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wikiflow::config::PipelineConfig;
use wikiflow::error::StartupError;
use wikiflow::extractor::{PageExtractor, WikitextExtractor};
use wikiflow::fetch::{FetchOutcome, ImageFetcher};
use wikiflow::models::{ErrorRecord, ImageManifest, Images, ProcessedRecord, Stage};
use wikiflow::pipeline::{Pipeline, RunSummary};
use wikiflow::sink::{read_error_log, RecordReader};

fn page_xml(title: &str, ns: &str, text: &str) -> String {
    format!(
        "  <page>\n    <title>{title}</title>\n    <ns>{ns}</ns>\n    <id>1</id>\n    <revision>\n      <id>2</id>\n      <text xml:space=\"preserve\">{text}</text>\n    </revision>\n  </page>\n"
    )
}

fn dump_xml(pages: &[String]) -> String {
    let mut xml = String::from("<mediawiki xml:lang=\"en\">\n  <siteinfo><sitename>Wikipedia</sitename></siteinfo>\n");
    for page in pages {
        xml.push_str(page);
    }
    xml.push_str("</mediawiki>\n");
    xml
}

/// Writes `xml` to `dir/name`, BZ2-compressing it when the name ends in `.bz2`.
fn write_dump(dir: &Path, name: &str, xml: &str) -> PathBuf {
    let path = dir.join(name);
    let bytes = if name.ends_with(".bz2") {
        let mut encoder = BzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(xml.as_bytes()).unwrap();
        encoder.finish().unwrap()
    } else {
        xml.as_bytes().to_vec()
    };
    std::fs::write(&path, bytes).unwrap();
    path
}

fn test_config(dir: &Path) -> PipelineConfig {
    PipelineConfig {
        extraction_workers: 3,
        image_workers: 2,
        image_dir: dir.join("images"),
        status_interval: Duration::from_millis(50),
        poll_interval: Duration::from_millis(5),
        rate_limit_base_delay: Duration::from_millis(1),
        rate_limit_max_delay: Duration::from_millis(4),
        rate_limit_max_attempts: 3,
        drain_timeout: Duration::from_secs(20),
        ..PipelineConfig::default()
    }
}

struct Outputs {
    summary: RunSummary,
    records: Vec<ProcessedRecord>,
    errors: Vec<ErrorRecord>,
}

impl Outputs {
    fn titles(&self) -> BTreeSet<&str> {
        self.records.iter().map(|r| r.page.as_str()).collect()
    }

    fn errors_for(&self, stage: Stage) -> Vec<&ErrorRecord> {
        self.errors.iter().filter(|e| e.stage == stage).collect()
    }
}

fn run_pipeline(
    config: PipelineConfig,
    extractor: Arc<dyn PageExtractor>,
    fetcher: Arc<dyn ImageFetcher>,
    input: &Path,
    dir: &Path,
) -> Outputs {
    let results = dir.join("out/records.bin");
    let errors = dir.join("out/errors.jsonl");
    let summary = Pipeline::new(config, extractor, fetcher)
        .run_files(input, &results, &errors)
        .unwrap();
    let records = RecordReader::open(&results)
        .unwrap()
        .collect::<anyhow::Result<Vec<_>>>()
        .unwrap();
    let errors = read_error_log(&errors).unwrap();
    Outputs {
        summary,
        records,
        errors,
    }
}

/// Returns the same outcome for every call and counts calls.
struct FixedFetcher {
    outcome: FetchOutcome,
    calls: AtomicUsize,
}

impl FixedFetcher {
    fn new(outcome: FetchOutcome) -> Arc<Self> {
        Arc::new(Self {
            outcome,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ImageFetcher for FixedFetcher {
    fn download(&self, _images: &ImageManifest, _dir: &Path, _title: &str) -> anyhow::Result<FetchOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.outcome.clone())
    }
}

/// Panics while cleaning any text containing "boom".
struct ExplodingExtractor(WikitextExtractor);

impl PageExtractor for ExplodingExtractor {
    fn extract_images(&self, raw: &str, dir: &Path) -> (ImageManifest, Option<String>) {
        self.0.extract_images(raw, dir)
    }

    fn extract_categories(&self, raw: &str) -> Vec<String> {
        self.0.extract_categories(raw)
    }

    fn clean(&self, text: &str) -> anyhow::Result<String> {
        if text.contains("boom") {
            panic!("cleaner hit a bad page");
        }
        self.0.clean(text)
    }
}

fn default_extractor() -> Arc<dyn PageExtractor> {
    Arc::new(WikitextExtractor::default())
}

// ============================================================================
// Reading and filtering
// ============================================================================

#[test]
fn namespace_filter_keeps_main_articles() {
    let dir = TempDir::new().unwrap();
    let xml = dump_xml(&[
        page_xml("Page One", "0", "First article."),
        page_xml("Talk:Page One", "1", "Discussion."),
        page_xml("Page Three", "0", "Third article."),
    ]);
    let input = write_dump(dir.path(), "dump.xml.bz2", &xml);

    let out = run_pipeline(
        test_config(dir.path()),
        default_extractor(),
        FixedFetcher::new(FetchOutcome::ok()),
        &input,
        dir.path(),
    );

    assert!(out.summary.is_clean());
    assert_eq!(out.titles(), BTreeSet::from(["Page One", "Page Three"]));
    assert_eq!(out.summary.stats.pages_read, 2);
    assert_eq!(out.summary.stats.records_written, 2);
    assert!(out.errors.is_empty());
}

#[test]
fn xml_and_bz2_inputs_agree() {
    let dir = TempDir::new().unwrap();
    let xml = dump_xml(&[
        page_xml("Rust", "0", "'''Rust''' is a [[programming language]].\n[[Category:Languages]]"),
        page_xml("Go", "0", "Go is ''also'' a language."),
    ]);
    let plain = write_dump(dir.path(), "dump.xml", &xml);
    let packed = write_dump(dir.path(), "dump.xml.bz2", &xml);

    let plain_dir = dir.path().join("plain");
    let packed_dir = dir.path().join("packed");
    let mut a = run_pipeline(test_config(dir.path()), default_extractor(), FixedFetcher::new(FetchOutcome::ok()), &plain, &plain_dir).records;
    let mut b = run_pipeline(test_config(dir.path()), default_extractor(), FixedFetcher::new(FetchOutcome::ok()), &packed, &packed_dir).records;
    a.sort_by(|x, y| x.page.cmp(&y.page));
    b.sort_by(|x, y| x.page.cmp(&y.page));
    assert_eq!(a, b);
    assert_eq!(a.len(), 2);
}

#[test]
fn invalid_namespace_is_reported_not_processed() {
    let dir = TempDir::new().unwrap();
    let xml = dump_xml(&[
        page_xml("Broken", "main", "text"),
        page_xml("Fine", "0", "text"),
    ]);
    let input = write_dump(dir.path(), "dump.xml", &xml);

    let out = run_pipeline(
        test_config(dir.path()),
        default_extractor(),
        FixedFetcher::new(FetchOutcome::ok()),
        &input,
        dir.path(),
    );

    assert_eq!(out.titles(), BTreeSet::from(["Fine"]));
    let reader_errors = out.errors_for(Stage::Reader);
    assert_eq!(reader_errors.len(), 1);
    assert_eq!(reader_errors[0].context, "Broken");
}

#[test]
fn unsupported_extension_fails_at_startup() {
    let dir = TempDir::new().unwrap();
    let input = write_dump(dir.path(), "dump.gz", "<mediawiki/>");
    let result = Pipeline::new(
        test_config(dir.path()),
        default_extractor(),
        FixedFetcher::new(FetchOutcome::ok()),
    )
    .run_files(&input, &dir.path().join("r.bin"), &dir.path().join("e.jsonl"));

    assert!(matches!(result, Err(StartupError::UnsupportedExtension { .. })));
    assert!(!dir.path().join("r.bin").exists());
}

#[test]
fn missing_input_fails_at_startup() {
    let dir = TempDir::new().unwrap();
    let result = Pipeline::new(
        test_config(dir.path()),
        default_extractor(),
        FixedFetcher::new(FetchOutcome::ok()),
    )
    .run_files(
        &dir.path().join("absent.xml.bz2"),
        &dir.path().join("r.bin"),
        &dir.path().join("e.jsonl"),
    );

    assert!(matches!(result, Err(StartupError::OpenInput { .. })));
}

#[test]
fn corrupt_stream_drains_then_reports() {
    let dir = TempDir::new().unwrap();
    let mut encoder = BzEncoder::new(Vec::new(), Compression::fast());
    encoder
        .write_all(dump_xml(&[page_xml("Kept", "0", "text")]).as_bytes())
        .unwrap();
    let mut bytes = encoder.finish().unwrap();
    // Damage the stream past its header.
    let len = bytes.len();
    for b in &mut bytes[len / 2..] {
        *b ^= 0xA5;
    }
    let input = dir.path().join("dump.xml.bz2");
    std::fs::write(&input, bytes).unwrap();

    let out = run_pipeline(
        test_config(dir.path()),
        default_extractor(),
        FixedFetcher::new(FetchOutcome::ok()),
        &input,
        dir.path(),
    );

    assert!(out.summary.stream_error.is_some());
    assert!(!out.summary.forced);
    assert!(out
        .errors_for(Stage::Reader)
        .iter()
        .any(|e| e.context == "<dump>"));
}

#[test]
fn malformed_xml_keeps_pages_read_before_it() {
    let dir = TempDir::new().unwrap();
    let mut xml = String::from("<mediawiki>\n");
    xml.push_str(&page_xml("Early", "0", "made it"));
    xml.push_str("  <page><title>Late</title><ns>0</ns><text>&bogus;</text></page>\n</mediawiki>\n");
    let input = write_dump(dir.path(), "dump.xml", &xml);

    let out = run_pipeline(
        test_config(dir.path()),
        default_extractor(),
        FixedFetcher::new(FetchOutcome::ok()),
        &input,
        dir.path(),
    );

    assert!(out.summary.stream_error.is_some());
    assert_eq!(out.titles(), BTreeSet::from(["Early"]));
}

// ============================================================================
// Extraction
// ============================================================================

#[test]
fn every_page_becomes_exactly_one_record() {
    let dir = TempDir::new().unwrap();
    let pages: Vec<String> = (0..40)
        .map(|i| page_xml(&format!("Article {i}"), "0", &format!("Body of article {i}.")))
        .collect();
    let input = write_dump(dir.path(), "dump.xml.bz2", &dump_xml(&pages));
    let config = PipelineConfig {
        article_channel_capacity: 2,
        result_channel_capacity: 2,
        ..test_config(dir.path())
    };

    let out = run_pipeline(config, default_extractor(), FixedFetcher::new(FetchOutcome::ok()), &input, dir.path());

    assert_eq!(out.records.len(), 40);
    assert_eq!(out.titles().len(), 40);
    assert!(out.titles().contains("Article 39"));
    assert!(out.summary.is_clean());
}

#[test]
fn record_carries_clean_text_and_categories() {
    let dir = TempDir::new().unwrap();
    let text = "'''Einstein''' was a [[Physicist]].\n\
                {{Infobox scientist|name=Einstein}}\n\
                [[Category:Physicists|Einstein]]\n\
                ==References==\n\
                Cited books";
    let input = write_dump(dir.path(), "dump.xml", &dump_xml(&[page_xml("Einstein", "0", text)]));

    let out = run_pipeline(
        test_config(dir.path()),
        default_extractor(),
        FixedFetcher::new(FetchOutcome::ok()),
        &input,
        dir.path(),
    );

    let record = &out.records[0];
    let sentences = String::from_utf8(record.sentences.clone()).unwrap();
    assert!(sentences.contains("Einstein was a Physicist"));
    assert!(!sentences.contains("Cited books"));
    assert!(!sentences.contains("{{"));
    assert_eq!(record.categories, vec!["Physicists"]);
    assert_eq!(record.images, Images::None);
}

#[test]
fn collaborator_panic_still_writes_record() {
    let dir = TempDir::new().unwrap();
    let xml = dump_xml(&[
        page_xml("Bad", "0", "this goes boom"),
        page_xml("Good", "0", "this is fine"),
    ]);
    let input = write_dump(dir.path(), "dump.xml", &xml);

    let out = run_pipeline(
        test_config(dir.path()),
        Arc::new(ExplodingExtractor(WikitextExtractor::default())),
        FixedFetcher::new(FetchOutcome::ok()),
        &input,
        dir.path(),
    );

    assert_eq!(out.titles(), BTreeSet::from(["Bad", "Good"]));
    let bad = out.records.iter().find(|r| r.page == "Bad").unwrap();
    assert_eq!(bad.sentences, b"this goes boom".to_vec());

    let failures = out.errors_for(Stage::Extraction);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].context, "Bad");
    assert!(failures[0].message.contains("panicked"));
    assert_eq!(out.summary.stats.extraction_failures, 1);
}

// ============================================================================
// Image download
// ============================================================================

fn image_pages() -> String {
    dump_xml(&[
        page_xml("Crab", "0", "[[File:Ferris.png|thumb|A crab]] Ferris is a crab."),
        page_xml("Gopher", "0", "[[Image:Gopher.svg]] A gopher."),
        page_xml("Plain", "0", "No pictures here."),
    ])
}

#[test]
fn images_disabled_never_fetches() {
    let dir = TempDir::new().unwrap();
    let input = write_dump(dir.path(), "dump.xml", &image_pages());
    let fetcher = FixedFetcher::new(FetchOutcome::ok());

    let out = run_pipeline(test_config(dir.path()), default_extractor(), fetcher.clone(), &input, dir.path());

    assert_eq!(fetcher.calls(), 0);
    assert!(out.records.iter().all(|r| r.images.is_none()));
    assert!(!dir.path().join("images").exists());
}

#[test]
fn images_enabled_fetches_each_task_once() {
    let dir = TempDir::new().unwrap();
    let input = write_dump(dir.path(), "dump.xml", &image_pages());
    let fetcher = FixedFetcher::new(FetchOutcome::ok());
    let config = PipelineConfig {
        image_download_enabled: true,
        ..test_config(dir.path())
    };

    let out = run_pipeline(config, default_extractor(), fetcher.clone(), &input, dir.path());

    assert_eq!(fetcher.calls(), 2);
    assert_eq!(out.summary.stats.images_fetched, 2);
    assert!(out.errors.is_empty());

    let crab = out.records.iter().find(|r| r.page == "Crab").unwrap();
    match &crab.images {
        Images::Manifest(manifest) => {
            let meta = &manifest["Ferris.png"];
            assert!(meta.url.ends_with("/Ferris.png"));
            assert_eq!(meta.path, dir.path().join("images").join("Ferris.png"));
        }
        Images::None => panic!("expected a manifest for Crab"),
    }
    let plain = out.records.iter().find(|r| r.page == "Plain").unwrap();
    assert!(plain.images.is_none());
}

#[test]
fn missing_images_reported_once_without_retry() {
    let dir = TempDir::new().unwrap();
    let input = write_dump(dir.path(), "dump.xml", &dump_xml(&[page_xml("Crab", "0", "[[File:Gone.png]] text")]));
    let fetcher = FixedFetcher::new(FetchOutcome::with_status(404, Some("not found: Gone.png".to_string())));
    let config = PipelineConfig {
        image_download_enabled: true,
        ..test_config(dir.path())
    };

    let out = run_pipeline(config, default_extractor(), fetcher.clone(), &input, dir.path());

    assert_eq!(fetcher.calls(), 1);
    assert_eq!(out.summary.stats.rate_limit_retries, 0);
    let image_errors = out.errors_for(Stage::ImageDownload);
    assert_eq!(image_errors.len(), 1);
    assert_eq!(image_errors[0].context, "Crab");
    assert!(image_errors[0].message.contains("Gone.png"));
    assert_eq!(out.records.len(), 1);
}

#[test]
fn persistent_rate_limit_ends_in_error_record() {
    let dir = TempDir::new().unwrap();
    let input = write_dump(dir.path(), "dump.xml", &dump_xml(&[page_xml("Crab", "0", "[[File:Busy.png]] text")]));
    let fetcher = FixedFetcher::new(FetchOutcome::rate_limited(ImageManifest::new()));
    let config = PipelineConfig {
        image_download_enabled: true,
        ..test_config(dir.path())
    };

    let out = run_pipeline(config, default_extractor(), fetcher.clone(), &input, dir.path());

    assert_eq!(fetcher.calls(), 3);
    assert_eq!(out.summary.stats.rate_limit_retries, 2);
    assert!(!out.summary.forced);
    let image_errors = out.errors_for(Stage::ImageDownload);
    assert_eq!(image_errors.len(), 1);
    assert!(image_errors[0].message.contains("still rate limited"));
}

// ============================================================================
// Shutdown
// ============================================================================

#[test]
fn drain_timeout_records_unfinished_image_work() {
    let dir = TempDir::new().unwrap();
    let input = write_dump(dir.path(), "dump.xml", &image_pages());
    let fetcher = FixedFetcher::new(FetchOutcome::rate_limited(ImageManifest::new()));
    let config = PipelineConfig {
        image_download_enabled: true,
        rate_limit_base_delay: Duration::from_secs(30),
        rate_limit_max_delay: Duration::from_secs(30),
        rate_limit_max_attempts: 10,
        drain_timeout: Duration::from_millis(300),
        ..test_config(dir.path())
    };

    let started = std::time::Instant::now();
    let out = run_pipeline(config, default_extractor(), fetcher, &input, dir.path());

    assert!(started.elapsed() < Duration::from_secs(15));
    assert!(out.summary.forced);
    assert!(out.summary.stream_error.is_none());
    assert_eq!(out.records.len(), 3);

    let shutdown: BTreeSet<&str> = out
        .errors_for(Stage::Shutdown)
        .iter()
        .map(|e| e.context.as_str())
        .collect();
    assert_eq!(shutdown, BTreeSet::from(["Crab", "Gopher"]));
    assert_eq!(out.summary.stats.abandoned, 2);
}

#[test]
fn empty_dump_terminates_cleanly() {
    let dir = TempDir::new().unwrap();
    let input = write_dump(dir.path(), "dump.xml.bz2", &dump_xml(&[]));

    let out = run_pipeline(
        test_config(dir.path()),
        default_extractor(),
        FixedFetcher::new(FetchOutcome::ok()),
        &input,
        dir.path(),
    );

    assert!(out.summary.is_clean());
    assert!(out.records.is_empty());
    assert!(out.errors.is_empty());
}
