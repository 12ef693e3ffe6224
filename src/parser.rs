//! Streaming reader over MediaWiki XML exports.
//!
//! Only four elements matter: `page`, `title`, `ns` and `text`. They are
//! tracked on a small stack so character data lands in whichever of them is
//! innermost; everything else (revisions, ids, contributors) is skipped
//! without being buffered.

use crate::config::NamespaceFilter;
use crate::error::{StartupError, StreamError};
use crate::models::Page;
use crate::source::DumpSource;
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use std::io::BufRead;
use std::path::Path;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag {
    Page,
    Title,
    Ns,
    Text,
}

impl Tag {
    fn from_name(name: &[u8]) -> Option<Self> {
        match name {
            b"page" => Some(Tag::Page),
            b"title" => Some(Tag::Title),
            b"ns" => Some(Tag::Ns),
            b"text" => Some(Tag::Text),
            _ => None,
        }
    }
}

/// What the reader produced for one closed `<page>` element
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Page(Page),
    /// The page could not be classified and is skipped
    Rejected { title: String, reason: String },
}

pub struct DumpReader<R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
    filter: NamespaceFilter,
    stack: Vec<Tag>,
    title: Option<String>,
    text: Option<String>,
    ns_text: String,
    namespace: Option<i64>,
    namespace_error: Option<String>,
    pages_read: u64,
    done: bool,
}

impl DumpReader<Box<dyn BufRead + Send>> {
    pub fn open(path: &Path, filter: NamespaceFilter) -> Result<Self, StartupError> {
        Ok(Self::new(DumpSource::open(path)?, filter))
    }
}

impl<R: BufRead> DumpReader<R> {
    pub fn new(source: R, filter: NamespaceFilter) -> Self {
        let mut reader = Reader::from_reader(source);
        reader.trim_text(false);
        reader.expand_empty_elements(true);
        // Tag mismatches are structural noise, not a corrupt stream.
        reader.check_end_names(false);

        Self {
            reader,
            buf: Vec::with_capacity(64 * 1024),
            filter,
            stack: Vec::new(),
            title: None,
            text: None,
            ns_text: String::new(),
            namespace: None,
            namespace_error: None,
            pages_read: 0,
            done: false,
        }
    }

    fn reset_page(&mut self) {
        self.title = None;
        self.text = None;
        self.namespace = None;
        self.namespace_error = None;
        self.ns_text.clear();
    }

    fn open_tag(&mut self, tag: Tag) {
        match tag {
            Tag::Page => self.reset_page(),
            Tag::Title => self.title = Some(String::new()),
            Tag::Text => self.text = Some(String::new()),
            Tag::Ns => {
                self.namespace = None;
                self.namespace_error = None;
                self.ns_text.clear();
            }
        }
        self.stack.push(tag);
    }

    fn push_chars(&mut self, content: &str) {
        match self.stack.last() {
            Some(Tag::Text) => self.text.get_or_insert_with(String::new).push_str(content),
            Some(Tag::Title) => self.title.get_or_insert_with(String::new).push_str(content),
            Some(Tag::Ns) => self.ns_text.push_str(content),
            Some(Tag::Page) | None => {}
        }
    }

    fn finish_namespace(&mut self) {
        let raw = self.ns_text.trim();
        match raw.parse::<i64>() {
            Ok(ns) => self.namespace = Some(ns),
            Err(e) => {
                self.namespace = None;
                self.namespace_error = Some(format!("invalid namespace id {raw:?}: {e}"));
            }
        }
    }

    /// Handles a closing tag; returns an outcome when a page completes.
    fn close_tag(&mut self, tag: Tag) -> Option<ReadOutcome> {
        if self.stack.last() == Some(&tag) {
            self.stack.pop();
        }

        match tag {
            Tag::Ns => {
                self.finish_namespace();
                None
            }
            Tag::Page => {
                let outcome = self.finish_page();
                self.reset_page();
                outcome
            }
            Tag::Title | Tag::Text => None,
        }
    }

    fn finish_page(&mut self) -> Option<ReadOutcome> {
        let text = self.text.take()?;
        let title = self.title.take();

        if let Some(reason) = self.namespace_error.take() {
            return Some(ReadOutcome::Rejected {
                title: title.unwrap_or_default(),
                reason,
            });
        }

        let namespace = self.namespace?;
        if !self.filter.accepts(namespace) {
            trace!(namespace, "Skipping page outside namespace filter");
            return None;
        }

        match title {
            Some(title) => {
                self.pages_read += 1;
                Some(ReadOutcome::Page(Page {
                    title,
                    raw_text: text,
                    namespace,
                }))
            }
            None => Some(ReadOutcome::Rejected {
                title: String::new(),
                reason: "page has text but no title".to_string(),
            }),
        }
    }

    fn stream_error(&self, source: quick_xml::Error) -> StreamError {
        StreamError::Xml {
            position: self.reader.buffer_position(),
            source,
        }
    }

    fn next_outcome(&mut self) -> Result<Option<ReadOutcome>, StreamError> {
        loop {
            self.buf.clear();
            let event = match self.reader.read_event_into(&mut self.buf) {
                Ok(event) => event.into_owned(),
                Err(e) => return Err(self.stream_error(e)),
            };

            match event {
                Event::Start(e) => {
                    if let Some(tag) = Tag::from_name(e.name().as_ref()) {
                        self.open_tag(tag);
                    }
                }
                Event::End(e) => {
                    if let Some(tag) = Tag::from_name(e.name().as_ref()) {
                        if let Some(outcome) = self.close_tag(tag) {
                            return Ok(Some(outcome));
                        }
                    }
                }
                Event::Text(e) => {
                    if self.stack.is_empty() {
                        continue;
                    }
                    let content = e.unescape().map_err(|err| self.stream_error(err))?;
                    self.push_chars(&content);
                }
                Event::CData(e) => {
                    if self.stack.is_empty() {
                        continue;
                    }
                    let content = String::from_utf8_lossy(&e).into_owned();
                    self.push_chars(&content);
                }
                Event::Eof => {
                    debug!(pages = self.pages_read, "Reached end of dump");
                    return Ok(None);
                }
                _ => {}
            }
        }
    }
}

impl<R: BufRead> Iterator for DumpReader<R> {
    type Item = Result<ReadOutcome, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_outcome() {
            Ok(Some(outcome)) => Some(Ok(outcome)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
