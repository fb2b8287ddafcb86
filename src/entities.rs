use std::fmt::{Display, Formatter};

use derive_deref::Deref;
use num_traits::FromPrimitive;

use crate::prelude::*;
use crate::xml::RawElement;

pub mod fingerprint;

#[cfg(test)]
#[path = "entities_tests.rs"]
mod tests;

/// Attribute value the source backup format emits for absent fields.
pub const NULL_VALUE: &str = "null";

pub const UNKNOWN_CONTACT: &str = "(Unknown)";

/// Separator between addresses of a group message.
pub const ADDRESS_SEP: char = '~';

//
// Helper entities
//

/// Number of epoch milliseconds, UTC.
#[derive(Deref, Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn year_utc(&self) -> Result<Year> {
        year_of_timestamp(self.0).map(Year)
    }
}

#[derive(Deref, Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Year(pub i32);

impl Display for Year {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(FromPrimitive, Copy, Clone, Debug, PartialEq, Eq)]
pub enum CallType {
    Incoming = 1,
    Outgoing = 2,
    Missed = 3,
    Voicemail = 4,
}

#[derive(FromPrimitive, Copy, Clone, Debug, PartialEq, Eq)]
pub enum SmsType {
    Received = 1,
    Sent = 2,
}

#[derive(FromPrimitive, Copy, Clone, Debug, PartialEq, Eq)]
pub enum MessageBox {
    Received = 1,
    Sent = 2,
}

#[derive(FromPrimitive, Copy, Clone, Debug, PartialEq, Eq)]
pub enum AddrType {
    From = 137,
    To = 151,
}

//
// Records
//

#[derive(Clone, Debug, PartialEq)]
pub struct Call {
    pub number: String,
    pub duration: i64,
    pub date: Timestamp,
    pub call_type: CallType,
    pub readable_date: Option<String>,
    pub contact_name: Option<String>,
    /// Unknown attributes, preserved in source order for round-trip.
    pub extra_attrs: Vec<(String, String)>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Sms {
    pub address: String,
    pub date: Timestamp,
    pub sms_type: SmsType,
    pub body: String,
    pub protocol: Option<String>,
    pub subject: Option<String>,
    pub read: u8,
    pub status: Option<String>,
    pub locked: u8,
    pub date_sent: Option<Timestamp>,
    pub service_center: Option<String>,
    pub readable_date: Option<String>,
    pub contact_name: Option<String>,
    pub extra_attrs: Vec<(String, String)>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Mms {
    /// Raw address string, `~`-separated for group messages.
    pub address: String,
    pub date: Timestamp,
    pub msg_box: MessageBox,
    pub m_type: Option<String>,
    pub m_id: Option<String>,
    pub thread_id: Option<String>,
    pub readable_date: Option<String>,
    pub contact_name: Option<String>,
    pub parts: Vec<MmsPart>,
    pub addrs: Vec<MmsAddr>,
    pub extra_attrs: Vec<(String, String)>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MmsPart {
    pub seq: i64,
    pub ct: String,
    pub name: Option<String>,
    pub text: Option<String>,
    /// Inline base64 payload. Absent once the part has been extracted.
    pub data: Option<String>,
    pub cid: Option<String>,
    pub cl: Option<String>,
    /// Repo-relative attachment reference, set by extraction.
    pub path: Option<String>,
    pub original_size: Option<u64>,
    pub extraction_date: Option<String>,
    pub extra_attrs: Vec<(String, String)>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MmsAddr {
    pub address: String,
    pub addr_type: AddrType,
    pub charset: Option<String>,
    pub extra_attrs: Vec<(String, String)>,
}

/// A record of an `sms*.xml` file; both kinds share one coalescer.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Sms(Sms),
    Mms(Mms),
}

impl Message {
    pub fn date(&self) -> Timestamp {
        match self {
            Message::Sms(sms) => sms.date,
            Message::Mms(mms) => mms.date,
        }
    }

    pub fn address_and_contact_name(&self) -> (&str, Option<&str>) {
        match self {
            Message::Sms(sms) => (&sms.address, sms.contact_name.as_deref()),
            Message::Mms(mms) => (&mms.address, mms.contact_name.as_deref()),
        }
    }
}

impl Call {
    pub fn normalized_number(&self) -> String {
        normalize_number(&self.number)
    }
}

impl Mms {
    pub fn addresses(&self) -> Vec<&str> {
        split_addresses(&self.address)
    }
}

impl MmsPart {
    /// Content hash of the referenced blob, taken from the `path` basename.
    pub fn blob_hash(&self) -> Option<&str> {
        self.path.as_deref()
            .and_then(|p| p.rsplit('/').next())
            .filter(|h| hashing::is_hash_hex(h))
    }
}

//
// Canonicalization
//

/// Strips a phone number down to its digits, dropping a single leading `1`
/// of an 11-digit NANP form. Non-numeric addresses (short codes, alpha
/// sender IDs) are keyed by their lowercased trimmed raw form.
pub fn normalize_number(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    match digits.len() {
        0 => raw.trim().to_lowercase(),
        11 if digits.starts_with('1') => digits[1..].to_owned(),
        _ => digits,
    }
}

/// Splits a group-message address preserving the original join order.
pub fn split_addresses(raw: &str) -> Vec<&str> {
    raw.split(ADDRESS_SEP).collect()
}

fn bool_flag(value: Option<&str>, attr: &str) -> Result<u8> {
    match value {
        None => Ok(0),
        Some("0") => Ok(0),
        Some("1") => Ok(1),
        Some(etc) => Err(PipelineError::RecordInvalid {
            reason: format!("attribute '{attr}' must be 0 or 1, got '{etc}'"),
        }.into()),
    }
}

fn parse_i64(value: &str, attr: &str) -> Result<i64> {
    value.parse::<i64>().map_err(|_| PipelineError::RecordInvalid {
        reason: format!("attribute '{attr}' is not an integer: '{value}'"),
    }.into())
}

fn invalid<T>(reason: String) -> Result<T> {
    Err(PipelineError::RecordInvalid { reason }.into())
}

//
// Parsing from raw XML elements
//

struct AttrReader<'a> {
    elem: &'a RawElement,
    consumed: Vec<&'a str>,
}

impl<'a> AttrReader<'a> {
    fn new(elem: &'a RawElement) -> Self {
        AttrReader { elem, consumed: vec![] }
    }

    /// The literal string "null" means the attribute is absent.
    fn opt(&mut self, name: &'static str) -> Option<&'a str> {
        self.consumed.push(name);
        self.elem.attr(name).filter(|v| *v != NULL_VALUE)
    }

    fn required(&mut self, name: &'static str) -> Result<&'a str> {
        match self.opt(name) {
            Some(v) => Ok(v),
            None => invalid(format!("<{}> has no '{}' attribute", self.elem.name, name)),
        }
    }

    fn date(&mut self) -> Result<Timestamp> {
        let raw = self.required("date")?;
        let ms = parse_i64(raw, "date")?;
        // Sanity-check that the timestamp maps to a calendar year at all.
        Timestamp(ms).year_utc()
            .map_err(|_| PipelineError::RecordInvalid {
                reason: format!("date {ms} is out of range"),
            })?;
        Ok(Timestamp(ms))
    }

    fn leftovers(self) -> Vec<(String, String)> {
        self.elem.attrs.iter()
            .filter(|(k, _)| !self.consumed.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl Call {
    pub fn from_xml(elem: &RawElement) -> Result<Call> {
        let mut attrs = AttrReader::new(elem);
        let number = attrs.required("number")?.to_owned();
        let date = attrs.date()?;
        let duration = parse_i64(attrs.required("duration")?, "duration")?;
        if duration < 0 {
            return invalid(format!("negative call duration {duration}"));
        }
        let type_raw = attrs.required("type")?;
        let call_type = CallType::from_i64(parse_i64(type_raw, "type")?)
            .map(Ok)
            .unwrap_or_else(|| invalid(format!("unknown call type '{type_raw}'")))?;
        let readable_date = attrs.opt("readable_date").map(str::to_owned);
        let contact_name = attrs.opt("contact_name").map(str::to_owned);
        Ok(Call {
            number,
            duration,
            date,
            call_type,
            readable_date,
            contact_name,
            extra_attrs: attrs.leftovers(),
        })
    }
}

impl Sms {
    pub fn from_xml(elem: &RawElement) -> Result<Sms> {
        let mut attrs = AttrReader::new(elem);
        let address = attrs.required("address")?.to_owned();
        let date = attrs.date()?;
        let type_raw = attrs.required("type")?;
        let sms_type = SmsType::from_i64(parse_i64(type_raw, "type")?)
            .map(Ok)
            .unwrap_or_else(|| invalid(format!("unknown sms type '{type_raw}'")))?;
        let body = attrs.opt("body").unwrap_or_default().to_owned();
        let protocol = attrs.opt("protocol").map(str::to_owned);
        let subject = attrs.opt("subject").map(str::to_owned);
        let read = bool_flag(attrs.opt("read"), "read")?;
        let status = attrs.opt("status").map(str::to_owned);
        let locked = bool_flag(attrs.opt("locked"), "locked")?;
        let date_sent = attrs.opt("date_sent")
            .map(|v| parse_i64(v, "date_sent").map(Timestamp))
            .transpose()?
            // A zero date_sent is how the backup format spells "not sent yet".
            .filter(|ts| ts.0 != 0);
        let service_center = attrs.opt("service_center").map(str::to_owned);
        let readable_date = attrs.opt("readable_date").map(str::to_owned);
        let contact_name = attrs.opt("contact_name").map(str::to_owned);
        Ok(Sms {
            address,
            date,
            sms_type,
            body,
            protocol,
            subject,
            read,
            status,
            locked,
            date_sent,
            service_center,
            readable_date,
            contact_name,
            extra_attrs: attrs.leftovers(),
        })
    }
}

impl Mms {
    pub fn from_xml(elem: &RawElement) -> Result<Mms> {
        let mut attrs = AttrReader::new(elem);
        let address = attrs.required("address")?.to_owned();
        let date = attrs.date()?;
        let msg_box_raw = attrs.required("msg_box")?;
        let msg_box = MessageBox::from_i64(parse_i64(msg_box_raw, "msg_box")?)
            .map(Ok)
            .unwrap_or_else(|| invalid(format!("unknown msg_box '{msg_box_raw}'")))?;
        let m_type = attrs.opt("m_type").map(str::to_owned);
        let m_id = attrs.opt("m_id").map(str::to_owned);
        let thread_id = attrs.opt("thread_id").map(str::to_owned);
        let readable_date = attrs.opt("readable_date").map(str::to_owned);
        let contact_name = attrs.opt("contact_name").map(str::to_owned);

        let mut parts = vec![];
        let mut addrs = vec![];
        for child in &elem.children {
            match child.name.as_str() {
                "parts" => {
                    for part_elem in &child.children {
                        require!(part_elem.name == "part",
                                 "Unexpected <{}> inside <parts>", part_elem.name);
                        parts.push(MmsPart::from_xml(part_elem)?);
                    }
                }
                "addrs" => {
                    for addr_elem in &child.children {
                        require!(addr_elem.name == "addr",
                                 "Unexpected <{}> inside <addrs>", addr_elem.name);
                        addrs.push(MmsAddr::from_xml(addr_elem)?);
                    }
                }
                etc => return invalid(format!("unexpected <{etc}> inside <mms>")),
            }
        }

        Ok(Mms {
            address,
            date,
            msg_box,
            m_type,
            m_id,
            thread_id,
            readable_date,
            contact_name,
            parts,
            addrs,
            extra_attrs: attrs.leftovers(),
        })
    }
}

impl MmsPart {
    pub fn from_xml(elem: &RawElement) -> Result<MmsPart> {
        let mut attrs = AttrReader::new(elem);
        let seq = attrs.opt("seq").map(|v| parse_i64(v, "seq")).transpose()?.unwrap_or(0);
        let ct = attrs.required("ct")?.to_owned();
        let name = attrs.opt("name").map(str::to_owned);
        let text = attrs.opt("text").map(str::to_owned);
        let data = attrs.opt("data").map(str::to_owned);
        let cid = attrs.opt("cid").map(str::to_owned);
        let cl = attrs.opt("cl").map(str::to_owned);
        let path = attrs.opt("path").map(str::to_owned);
        let original_size = attrs.opt("original_size")
            .map(|v| parse_i64(v, "original_size"))
            .transpose()?
            .map(|v| v as u64);
        let extraction_date = attrs.opt("extraction_date").map(str::to_owned);
        Ok(MmsPart {
            seq,
            ct,
            name,
            text,
            data,
            cid,
            cl,
            path,
            original_size,
            extraction_date,
            extra_attrs: attrs.leftovers(),
        })
    }
}

impl MmsAddr {
    pub fn from_xml(elem: &RawElement) -> Result<MmsAddr> {
        let mut attrs = AttrReader::new(elem);
        let address = attrs.required("address")?.to_owned();
        let type_raw = attrs.required("type")?;
        let addr_type = AddrType::from_i64(parse_i64(type_raw, "type")?)
            .map(Ok)
            .unwrap_or_else(|| invalid(format!("unknown addr type '{type_raw}'")))?;
        let charset = attrs.opt("charset").map(str::to_owned);
        Ok(MmsAddr {
            address,
            addr_type,
            charset,
            extra_attrs: attrs.leftovers(),
        })
    }
}
