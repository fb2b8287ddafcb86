pub mod reader;
pub mod writer;

pub use reader::{RecordReader, XmlLimits};

/// One parsed element subtree in the source backup schema, attributes and
/// children in document order. Unknown attributes are preserved so a record
/// can round-trip into a rejection file unchanged.
#[derive(Clone, Debug, PartialEq)]
pub struct RawElement {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<RawElement>,
}

impl RawElement {
    pub fn new(name: &str) -> Self {
        RawElement { name: name.to_owned(), attrs: vec![], children: vec![] }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    pub fn with_attr(mut self, name: &str, value: &str) -> Self {
        self.attrs.push((name.to_owned(), value.to_owned()));
        self
    }

    pub fn with_child(mut self, child: RawElement) -> Self {
        self.children.push(child);
        self
    }
}

/// Root element names of the two source schemas.
pub const CALLS_ROOT: &str = "calls";
pub const SMSES_ROOT: &str = "smses";

pub const COUNT_ATTR: &str = "count";
