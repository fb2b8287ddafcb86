use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::prelude::*;
use crate::xml::{RawElement, COUNT_ATTR};

#[cfg(test)]
#[path = "reader_tests.rs"]
mod tests;

/// Hard limits applied while scanning untrusted input. Exceeding any of them
/// aborts the current file with a malformed-XML error.
#[derive(Clone, Copy, Debug)]
pub struct XmlLimits {
    pub max_depth: usize,
    pub max_attr_len: usize,
    pub max_text_len: usize,
    pub max_total_bytes: u64,
}

impl Default for XmlLimits {
    fn default() -> Self {
        XmlLimits {
            max_depth: 8,
            // Must admit a multi-megabyte base64 part; 128 MiB of base64 is
            // ~96 MiB decoded, far beyond anything a phone actually sends.
            max_attr_len: 128 * 1024 * 1024,
            max_text_len: 16 * 1024 * 1024,
            max_total_bytes: 4 * 1024 * 1024 * 1024,
        }
    }
}

/// Pull-parser over a backup file, yielding top-level records lazily.
///
/// The sequence is finite and non-restartable; per-record memory is bounded
/// by that record's own subtree. The whole document is never materialized.
pub struct RecordReader<R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
    limits: XmlLimits,
    file_label: String,
    root_name: String,
    declared_count: Option<u64>,
    finished: bool,
}

impl<R: BufRead> std::fmt::Debug for RecordReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordReader")
            .field("buf", &self.buf)
            .field("limits", &self.limits)
            .field("file_label", &self.file_label)
            .field("root_name", &self.root_name)
            .field("declared_count", &self.declared_count)
            .field("finished", &self.finished)
            .finish()
    }
}

impl RecordReader<BufReader<File>> {
    pub fn open(path: &Path, limits: XmlLimits) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Cannot open {path:?}"))?;
        Self::from_reader(BufReader::new(file), path.to_string_lossy().into_owned(), limits)
    }
}

impl<R: BufRead> RecordReader<R> {
    /// Scans up to and including the root element start tag.
    pub fn from_reader(source: R, file_label: String, limits: XmlLimits) -> Result<Self> {
        let mut reader = Reader::from_reader(source);
        reader.trim_text(true);
        let mut this = RecordReader {
            reader,
            buf: vec![],
            limits,
            file_label,
            root_name: String::new(),
            declared_count: None,
            finished: false,
        };
        this.read_root()?;
        Ok(this)
    }

    pub fn root_name(&self) -> &str {
        &self.root_name
    }

    /// Value of the root `count` attribute, if present and numeric.
    pub fn declared_count(&self) -> Option<u64> {
        self.declared_count
    }

    pub fn byte_offset(&self) -> u64 {
        self.reader.buffer_position() as u64
    }

    fn read_root(&mut self) -> EmptyRes {
        loop {
            match self.read_event()? {
                Event::Decl(_) | Event::Comment(_) | Event::DocType(_) | Event::PI(_) => {}
                Event::Text(_) => {}
                Event::Start(start) => {
                    let (name, attrs) = self.element_parts(&start)?;
                    self.declared_count =
                        attrs.iter().find(|(k, _)| k == COUNT_ATTR).and_then(|(_, v)| v.parse().ok());
                    self.root_name = name;
                    return Ok(());
                }
                Event::Eof => return self.malformed("Document has no root element"),
                etc => return self.malformed(&format!("Unexpected {etc:?} before root element")),
            }
        }
    }

    fn next_record(&mut self) -> Result<Option<RawElement>> {
        if self.finished {
            return Ok(None);
        }
        loop {
            match self.read_event()? {
                Event::Empty(start) => {
                    let (name, attrs) = self.element_parts(&start)?;
                    return Ok(Some(RawElement { name, attrs, children: vec![] }));
                }
                Event::Start(start) => {
                    let (name, attrs) = self.element_parts(&start)?;
                    let children = self.read_subtree(&name, 2)?;
                    return Ok(Some(RawElement { name, attrs, children }));
                }
                Event::End(end) => {
                    if end.name().as_ref() == self.root_name.as_bytes() {
                        self.finished = true;
                        return Ok(None);
                    }
                    return self.malformed("Unbalanced closing tag");
                }
                Event::Text(_) | Event::Comment(_) | Event::CData(_) => {}
                Event::Eof => {
                    // Missing root close tag; record-wise the file is done.
                    self.finished = true;
                    return Ok(None);
                }
                etc => return self.malformed(&format!("Unexpected {etc:?} between records")),
            }
        }
    }

    /// Reads children of an already-opened element until its end tag.
    fn read_subtree(&mut self, parent_name: &str, depth: usize) -> Result<Vec<RawElement>> {
        if depth > self.limits.max_depth {
            return self.malformed(&format!("Element depth exceeds limit of {}", self.limits.max_depth));
        }
        let mut children = vec![];
        loop {
            match self.read_event()? {
                Event::Empty(start) => {
                    let (name, attrs) = self.element_parts(&start)?;
                    children.push(RawElement { name, attrs, children: vec![] });
                }
                Event::Start(start) => {
                    let (name, attrs) = self.element_parts(&start)?;
                    let grandchildren = self.read_subtree(&name, depth + 1)?;
                    children.push(RawElement { name, attrs, children: grandchildren });
                }
                Event::End(end) => {
                    if end.name().as_ref() != parent_name.as_bytes() {
                        return self.malformed(&format!(
                            "Expected </{}>, found </{}>",
                            parent_name,
                            String::from_utf8_lossy(end.name().as_ref())));
                    }
                    return Ok(children);
                }
                Event::Text(text) => {
                    if text.len() > self.limits.max_text_len {
                        return self.malformed(&format!("Text exceeds limit of {} bytes", self.limits.max_text_len));
                    }
                }
                Event::Comment(_) | Event::CData(_) => {}
                Event::Eof => return self.malformed(&format!("Unexpected EOF inside <{parent_name}>")),
                etc => return self.malformed(&format!("Unexpected {etc:?} inside <{parent_name}>")),
            }
        }
    }

    fn read_event(&mut self) -> Result<Event<'static>> {
        self.buf.clear();
        if self.byte_offset() > self.limits.max_total_bytes {
            return self.malformed(&format!("File exceeds limit of {} bytes", self.limits.max_total_bytes));
        }
        match self.reader.read_event_into(&mut self.buf) {
            Ok(event) => Ok(event.into_owned()),
            Err(e) => self.malformed(&e.to_string()),
        }
    }

    fn element_parts(&self, start: &BytesStart) -> Result<(String, Vec<(String, String)>)> {
        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let mut attrs = vec![];
        for attr in start.attributes() {
            let attr = match attr {
                Ok(a) => a,
                Err(e) => return self.malformed(&e.to_string()),
            };
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            if attr.value.len() > self.limits.max_attr_len {
                return self.malformed(&format!(
                    "Attribute '{key}' exceeds limit of {} bytes", self.limits.max_attr_len));
            }
            let value = match attr.unescape_value() {
                Ok(v) => v.into_owned(),
                Err(e) => return self.malformed(&format!("Attribute '{key}': {e}")),
            };
            attrs.push((key, value));
        }
        Ok((name, attrs))
    }

    fn malformed<T>(&self, message: &str) -> Result<T> {
        Err(PipelineError::MalformedXml {
            file: self.file_label.clone(),
            offset: self.byte_offset(),
            message: message.to_owned(),
        }.into())
    }
}

impl<R: BufRead> Iterator for RecordReader<R> {
    type Item = Result<RawElement>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_record() {
            Ok(Some(elem)) => Some(Ok(elem)),
            Ok(None) => None,
            Err(e) => {
                // A parse error is unrecoverable for this file.
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}
