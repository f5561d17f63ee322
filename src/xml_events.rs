//! Tokenizer adapter
//!
//! Turns a quick-xml reader into the linear `Start` / `Text` / `End` event
//! sequence the flattener and the counter scanner consume. Empty elements are
//! reported as a `Start` immediately followed by an `End`, tag and attribute
//! names are reduced to their local part, and every tokenizer failure is
//! turned into [`FlattenError::MalformedInput`] carrying the line and column
//! where it was detected.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufRead, Read};
use std::path::{Path, PathBuf};

use log::debug;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use crate::error::{FlattenError, Result};

/// Ordered `(name, value)` pairs of one start tag
pub type Attributes = Vec<(String, String)>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmlEvent {
    Start { name: String, attributes: Attributes },
    Text(String),
    End { name: String },
}

/// Receiver of the event sequence, driven by [`drive`]
pub trait EventHandler {
    fn on_start(&mut self, name: &str, attributes: &[(String, String)]) -> Result<()>;
    fn on_text(&mut self, chunk: &str) -> Result<()>;
    fn on_end(&mut self, name: &str) -> Result<()>;
}

const READ_BUFFER_SIZE: usize = 64 * 1024;
const RECENT_NEWLINES: usize = 1024;

/// Buffered reader that counts the newlines it hands out
///
/// Only the offsets of the most recent newlines are kept, which is enough to
/// turn the byte offset of a tokenizer error into a line and column.
pub struct LineTracker<R> {
    inner: R,
    buf: Box<[u8]>,
    pos: usize,
    filled: usize,
    offset: u64,
    newlines: u64,
    recent: VecDeque<u64>,
}

impl<R: Read> LineTracker<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: vec![0; READ_BUFFER_SIZE].into_boxed_slice(),
            pos: 0,
            filled: 0,
            offset: 0,
            newlines: 0,
            recent: VecDeque::with_capacity(RECENT_NEWLINES),
        }
    }

    /// 1-based (line, column) of a byte offset already consumed by the parser
    pub fn locate(&self, position: u64) -> (u64, u64) {
        let after = self
            .recent
            .iter()
            .rev()
            .take_while(|&&newline| newline >= position)
            .count() as u64;
        let line = self.newlines.saturating_sub(after) + 1;
        let line_start = self
            .recent
            .iter()
            .rev()
            .find(|&&newline| newline < position)
            .map(|newline| newline + 1)
            .unwrap_or(0);
        (line, position.saturating_sub(line_start) + 1)
    }
}

impl<R: Read> Read for LineTracker<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let available = self.fill_buf()?;
        let count = available.len().min(out.len());
        out[..count].copy_from_slice(&available[..count]);
        self.consume(count);
        Ok(count)
    }
}

impl<R: Read> BufRead for LineTracker<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if self.pos >= self.filled {
            self.filled = self.inner.read(&mut self.buf)?;
            self.pos = 0;
        }
        Ok(&self.buf[self.pos..self.filled])
    }

    fn consume(&mut self, amt: usize) {
        let amt = amt.min(self.filled - self.pos);
        for (index, byte) in self.buf[self.pos..self.pos + amt].iter().enumerate() {
            if *byte == b'\n' {
                if self.recent.len() == RECENT_NEWLINES {
                    self.recent.pop_front();
                }
                self.recent.push_back(self.offset + index as u64);
                self.newlines += 1;
            }
        }
        self.pos += amt;
        self.offset += amt as u64;
    }
}

fn malformed<R: Read>(
    source: &Path,
    tracker: &LineTracker<R>,
    position: u64,
    message: impl Into<String>,
) -> FlattenError {
    let (line, column) = tracker.locate(position);
    FlattenError::MalformedInput {
        file: source.to_path_buf(),
        line,
        column,
        message: message.into(),
    }
}

fn decode_utf8(bytes: &[u8]) -> std::result::Result<String, String> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|e| format!("invalid UTF-8: {}", e))
}

/// Local tag name plus attributes; `xmlns` declarations keep their full name
fn decode_start(start: &BytesStart) -> std::result::Result<(String, Attributes), String> {
    let name = decode_utf8(start.local_name().into_inner())?;
    let mut attributes = Vec::new();
    for attribute in start.attributes() {
        let attribute = attribute.map_err(|e| e.to_string())?;
        let raw_key = attribute.key.as_ref();
        let key = if raw_key.starts_with(b"xmlns") {
            decode_utf8(raw_key)?
        } else {
            decode_utf8(attribute.key.local_name().into_inner())?
        };
        let value = attribute.unescape_value().map_err(|e| e.to_string())?;
        attributes.push((key, value.into_owned()));
    }
    Ok((name, attributes))
}

/// Pull-based event source over one XML document
pub struct XmlEventReader<R: Read> {
    reader: Reader<LineTracker<R>>,
    buf: Vec<u8>,
    source: PathBuf,
    pending_end: Option<String>,
    depth: usize,
    seen_root: bool,
    finished: bool,
}

impl XmlEventReader<File> {
    /// Open a file, failing with `MissingResource` when it does not exist
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => FlattenError::MissingResource {
                path: path.to_path_buf(),
            },
            _ => FlattenError::Io(e),
        })?;
        Ok(Self::new(file, path))
    }
}

impl<R: Read> XmlEventReader<R> {
    pub fn new(inner: R, source: impl Into<PathBuf>) -> Self {
        let mut reader = Reader::from_reader(LineTracker::new(inner));
        reader.config_mut().trim_text(true);
        Self {
            reader,
            buf: Vec::with_capacity(4096),
            source: source.into(),
            pending_end: None,
            depth: 0,
            seen_root: false,
            finished: false,
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Next event in document order, `None` once the document is complete
    pub fn next_event(&mut self) -> Result<Option<XmlEvent>> {
        if let Some(name) = self.pending_end.take() {
            self.depth -= 1;
            return Ok(Some(XmlEvent::End { name }));
        }
        if self.finished {
            return Ok(None);
        }

        loop {
            self.buf.clear();
            let event = match self.reader.read_event_into(&mut self.buf) {
                Ok(event) => event,
                Err(e) => {
                    let position = self.reader.error_position() as u64;
                    return Err(malformed(
                        &self.source,
                        self.reader.get_ref(),
                        position,
                        e.to_string(),
                    ));
                }
            };
            let position = self.reader.buffer_position() as u64;

            match event {
                Event::Start(start) => {
                    let (name, attributes) = decode_start(&start).map_err(|message| {
                        malformed(&self.source, self.reader.get_ref(), position, message)
                    })?;
                    self.depth += 1;
                    self.seen_root = true;
                    return Ok(Some(XmlEvent::Start { name, attributes }));
                }
                Event::Empty(start) => {
                    let (name, attributes) = decode_start(&start).map_err(|message| {
                        malformed(&self.source, self.reader.get_ref(), position, message)
                    })?;
                    self.depth += 1;
                    self.seen_root = true;
                    self.pending_end = Some(name.clone());
                    return Ok(Some(XmlEvent::Start { name, attributes }));
                }
                Event::End(end) => {
                    let name = decode_utf8(end.local_name().into_inner()).map_err(|message| {
                        malformed(&self.source, self.reader.get_ref(), position, message)
                    })?;
                    self.depth = self.depth.saturating_sub(1);
                    return Ok(Some(XmlEvent::End { name }));
                }
                Event::Text(text) => {
                    let text = text.unescape().map_err(|e| {
                        malformed(&self.source, self.reader.get_ref(), position, e.to_string())
                    })?;
                    if !text.is_empty() {
                        return Ok(Some(XmlEvent::Text(text.into_owned())));
                    }
                }
                Event::CData(data) => {
                    let text = decode_utf8(&data.into_inner()).map_err(|message| {
                        malformed(&self.source, self.reader.get_ref(), position, message)
                    })?;
                    let trimmed = text.trim();
                    if !trimmed.is_empty() {
                        return Ok(Some(XmlEvent::Text(trimmed.to_string())));
                    }
                }
                Event::Eof => {
                    self.finished = true;
                    if !self.seen_root {
                        return Err(malformed(
                            &self.source,
                            self.reader.get_ref(),
                            position,
                            "document is empty",
                        ));
                    }
                    if self.depth > 0 {
                        return Err(malformed(
                            &self.source,
                            self.reader.get_ref(),
                            position,
                            format!(
                                "unexpected end of document, {} element(s) still open",
                                self.depth
                            ),
                        ));
                    }
                    debug!("Finished tokenizing {}", self.source.display());
                    return Ok(None);
                }
                Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_) => {}
            }
        }
    }
}

/// Feed every event of `events` to `handler`, stopping at the first error
pub fn drive<R, H>(events: &mut XmlEventReader<R>, handler: &mut H) -> Result<()>
where
    R: Read,
    H: EventHandler + ?Sized,
{
    while let Some(event) = events.next_event()? {
        match event {
            XmlEvent::Start { name, attributes } => handler.on_start(&name, &attributes)?,
            XmlEvent::Text(chunk) => handler.on_text(&chunk)?,
            XmlEvent::End { name } => handler.on_end(&name)?,
        }
    }
    Ok(())
}
