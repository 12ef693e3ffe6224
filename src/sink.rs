//! Persistent sinks and the single-consumer writer loop that feeds them.
//!
//! Results are a back-to-back stream of bincode values; errors are JSON Lines.
//! Both formats are self-delimiting and can be read back one record at a time.

use crate::error::StartupError;
use crate::models::{ErrorRecord, ProcessedRecord};
use crate::shutdown::ShutdownSignal;
use crate::stats::Pending;
use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::marker::PhantomData;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

const WRITE_BUFFER_SIZE: usize = 128 * 1024;

pub trait RecordSink<T>: Send {
    fn write(&mut self, record: &T) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

fn create_file(path: &Path, what: &'static str) -> Result<BufWriter<File>, StartupError> {
    let create_err = |source| StartupError::CreateOutput {
        what,
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(create_err)?;
    }
    let file = File::create(path).map_err(create_err)?;
    Ok(BufWriter::with_capacity(WRITE_BUFFER_SIZE, file))
}

pub struct BincodeSink<W: Write> {
    writer: W,
}

impl<W: Write> BincodeSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl BincodeSink<BufWriter<File>> {
    pub fn create(path: &Path) -> Result<Self, StartupError> {
        Ok(Self::new(create_file(path, "result file")?))
    }
}

impl<T: Serialize, W: Write + Send> RecordSink<T> for BincodeSink<W> {
    fn write(&mut self, record: &T) -> Result<()> {
        bincode::serialize_into(&mut self.writer, record).context("Failed to encode record")
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush().context("Failed to flush result file")
    }
}

pub struct JsonLinesSink<W: Write> {
    writer: W,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl JsonLinesSink<BufWriter<File>> {
    pub fn create(path: &Path) -> Result<Self, StartupError> {
        Ok(Self::new(create_file(path, "error file")?))
    }
}

impl<T: Serialize, W: Write + Send> RecordSink<T> for JsonLinesSink<W> {
    fn write(&mut self, record: &T) -> Result<()> {
        let mut line = serde_json::to_vec(record).context("Failed to encode record")?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .context("Failed to write error record")
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush().context("Failed to flush error file")
    }
}

/// Iterates bincode-encoded values written back to back.
pub struct RecordReader<R: BufRead, T> {
    reader: R,
    done: bool,
    _marker: PhantomData<T>,
}

impl<R: BufRead, T: DeserializeOwned> RecordReader<R, T> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            done: false,
            _marker: PhantomData,
        }
    }
}

impl RecordReader<BufReader<File>, ProcessedRecord> {
    pub fn open(path: &Path) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("Failed to open result file: {:?}", path))?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: BufRead, T: DeserializeOwned> Iterator for RecordReader<R, T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let at_end = match self.reader.fill_buf() {
            Ok(buf) => buf.is_empty(),
            Err(e) => {
                self.done = true;
                return Some(Err(e).context("Failed to read result file"));
            }
        };
        if at_end {
            self.done = true;
            return None;
        }

        let record =
            bincode::deserialize_from(&mut self.reader).context("Truncated or corrupt record");
        if record.is_err() {
            self.done = true;
        }
        Some(record)
    }
}

pub fn read_error_log(path: &Path) -> Result<Vec<ErrorRecord>> {
    let file = File::open(path).with_context(|| format!("Failed to open error file: {:?}", path))?;
    BufReader::new(file)
        .lines()
        .enumerate()
        .filter(|(_, line)| line.as_ref().map_or(true, |l| !l.trim().is_empty()))
        .map(|(idx, line)| {
            let line = line.context("Failed to read error file")?;
            serde_json::from_str(&line).with_context(|| format!("Bad error record on line {}", idx + 1))
        })
        .collect()
}

/// Something the writer can name when a record fails to persist
pub trait Described {
    fn describe(&self) -> String;
}

impl Described for ProcessedRecord {
    fn describe(&self) -> String {
        self.page.clone()
    }
}

impl Described for ErrorRecord {
    fn describe(&self) -> String {
        self.to_string()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterReport {
    pub written: u64,
    pub failures: u64,
}

/// Sole consumer of one channel, appending to one sink in receive order.
pub struct RecordWriter<'a, S> {
    name: &'static str,
    sink: S,
    pending: &'a Pending,
    signal: &'a ShutdownSignal,
    poll_interval: Duration,
}

impl<'a, S> RecordWriter<'a, S> {
    pub fn new(
        name: &'static str,
        sink: S,
        pending: &'a Pending,
        signal: &'a ShutdownSignal,
        poll_interval: Duration,
    ) -> Self {
        Self {
            name,
            sink,
            pending,
            signal,
            poll_interval,
        }
    }

    /// Runs until every sender is gone and the channel is empty. A failed write
    /// is logged through `on_write` and the loop moves on to the next record.
    pub fn run<T>(mut self, rx: Receiver<T>, mut on_write: impl FnMut(bool)) -> WriterReport
    where
        T: Described,
        S: RecordSink<T>,
    {
        let mut report = WriterReport::default();
        let mut closing = false;
        loop {
            match rx.recv_timeout(self.poll_interval) {
                Ok(record) => {
                    match self.sink.write(&record) {
                        Ok(()) => {
                            report.written += 1;
                            on_write(true);
                        }
                        Err(e) => {
                            report.failures += 1;
                            on_write(false);
                            warn!(
                                sink = self.name,
                                record = %record.describe(),
                                error = %e,
                                "Failed to write record"
                            );
                        }
                    }
                    self.pending.done();
                }
                Err(RecvTimeoutError::Timeout) => {
                    if !closing && self.signal.is_terminated() {
                        closing = true;
                        debug!(sink = self.name, "Waiting for remaining senders to close");
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if let Err(e) = self.sink.flush() {
            warn!(sink = self.name, error = %e, "Failed to flush sink");
        }
        debug!(sink = self.name, written = report.written, failures = report.failures, "Writer finished");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Images;
    use crossbeam_channel::bounded;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use tempfile::TempDir;

    fn record(title: &str) -> ProcessedRecord {
        ProcessedRecord {
            page: title.to_string(),
            sentences: format!("{title} text").into_bytes(),
            categories: vec!["Cat".to_string()],
            images: Images::None,
        }
    }

    /// Fails every write whose record title starts with "bad".
    struct FlakySink {
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl RecordSink<ProcessedRecord> for FlakySink {
        fn write(&mut self, record: &ProcessedRecord) -> Result<()> {
            if record.page.starts_with("bad") {
                anyhow::bail!("disk full");
            }
            self.seen.lock().unwrap().push(record.page.clone());
            Ok(())
        }

        fn flush(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn result_stream_reads_back_in_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/out.bin");
        let mut sink = BincodeSink::create(&path).unwrap();
        for title in ["A", "B", "C"] {
            sink.write(&record(title)).unwrap();
        }
        RecordSink::<ProcessedRecord>::flush(&mut sink).unwrap();
        drop(sink);

        let records: Vec<_> = RecordReader::open(&path)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        let titles: Vec<_> = records.iter().map(|r| r.page.as_str()).collect();
        assert_eq!(titles, vec!["A", "B", "C"]);
        assert_eq!(records[0], record("A"));
    }

    #[test]
    fn truncated_stream_reports_error_once() {
        let mut bytes = Vec::new();
        bincode::serialize_into(&mut bytes, &record("A")).unwrap();
        bincode::serialize_into(&mut bytes, &record("B")).unwrap();
        bytes.truncate(bytes.len() - 3);

        let mut reader = RecordReader::<_, ProcessedRecord>::new(Cursor::new(bytes));
        assert!(reader.next().unwrap().is_ok());
        assert!(reader.next().unwrap().is_err());
        assert!(reader.next().is_none());
    }

    #[test]
    fn error_log_is_json_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("errors.jsonl");
        let mut sink = JsonLinesSink::create(&path).unwrap();
        sink.write(&ErrorRecord::extraction("Rust", "bad image")).unwrap();
        sink.write(&ErrorRecord::image("Go", "HTTP 404")).unwrap();
        RecordSink::<ErrorRecord>::flush(&mut sink).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.starts_with("{\"stage\":\"extraction\""));

        let records = read_error_log(&path).unwrap();
        assert_eq!(records[1], ErrorRecord::image("Go", "HTTP 404"));
    }

    #[test]
    fn writer_survives_failed_writes() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let pending = Pending::default();
        let signal = ShutdownSignal::new();
        let (tx, rx) = bounded(8);

        for title in ["one", "bad-two", "three"] {
            pending.add();
            tx.send(record(title)).unwrap();
        }
        drop(tx);

        let mut outcomes = Vec::new();
        let report = RecordWriter::new(
            "results",
            FlakySink { seen: seen.clone() },
            &pending,
            &signal,
            Duration::from_millis(5),
        )
        .run(rx, |ok| outcomes.push(ok));

        assert_eq!(report, WriterReport { written: 2, failures: 1 });
        assert_eq!(outcomes, vec![true, false, true]);
        assert_eq!(*seen.lock().unwrap(), vec!["one", "three"]);
        assert_eq!(pending.get(), 0);
    }

    #[test]
    fn writer_drains_after_termination() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let pending = Pending::default();
        let signal = ShutdownSignal::new();
        let (tx, rx) = bounded(8);

        thread::scope(|s| {
            let writer = s.spawn(|| {
                RecordWriter::new(
                    "results",
                    FlakySink { seen: seen.clone() },
                    &pending,
                    &signal,
                    Duration::from_millis(5),
                )
                .run(rx, |_| {})
            });
            signal.terminate(false);
            thread::sleep(Duration::from_millis(20));
            pending.add();
            tx.send(record("late")).unwrap();
            drop(tx);
            assert_eq!(writer.join().unwrap().written, 1);
        });
        assert_eq!(*seen.lock().unwrap(), vec!["late"]);
    }
}
