use std::fs;
use std::path::{Path, PathBuf};

use base64::Engine;
use chrono::{NaiveDateTime, TimeZone, Utc};
use tempfile::TempDir;

use crate::prelude::*;
use crate::repo::Repository;

/// Epoch milliseconds of a `%Y-%m-%d %H:%M:%S` UTC timestamp.
pub fn ts(s: &str) -> i64 {
    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap();
    Utc.from_utc_datetime(&naive).timestamp_millis()
}

pub fn new_temp_dir() -> TempDir {
    TempDir::new().unwrap()
}

/// A fresh initialized repository inside a temp dir. Keep the `TempDir`
/// alive for as long as the repository is used.
pub fn init_temp_repo() -> (TempDir, Repository) {
    let dir = new_temp_dir();
    let repo = Repository::init(&dir.path().join("repo")).unwrap();
    (dir, repo)
}

pub fn create_named_file(path: &Path, content: &[u8]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

/// Drops an input file next to (not inside) the repository.
pub fn write_input(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    create_named_file(&path, content.as_bytes());
    path
}

//
// Source-schema XML builders
//

pub fn calls_xml(records: &[String]) -> String {
    format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<calls count=\"{}\">\n{}\n</calls>\n",
            records.len(), records.join("\n"))
}

pub fn smses_xml(records: &[String]) -> String {
    format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<smses count=\"{}\">\n{}\n</smses>\n",
            records.len(), records.join("\n"))
}

pub fn call_xml(number: &str, date_ms: i64, call_type: i32, duration: i64) -> String {
    format!("<call number=\"{number}\" duration=\"{duration}\" date=\"{date_ms}\" \
             type=\"{call_type}\" readable_date=\"whenever\" contact_name=\"null\" />")
}

pub fn call_xml_named(number: &str, date_ms: i64, contact_name: &str) -> String {
    format!("<call number=\"{number}\" duration=\"10\" date=\"{date_ms}\" \
             type=\"1\" contact_name=\"{contact_name}\" />")
}

pub fn sms_xml(address: &str, date_ms: i64, sms_type: i32, body: &str) -> String {
    format!("<sms protocol=\"0\" address=\"{address}\" date=\"{date_ms}\" type=\"{sms_type}\" \
             subject=\"null\" body=\"{body}\" read=\"1\" status=\"-1\" locked=\"0\" \
             date_sent=\"0\" readable_date=\"whenever\" contact_name=\"null\" />")
}

pub fn sms_xml_named(address: &str, date_ms: i64, body: &str, contact_name: &str) -> String {
    format!("<sms address=\"{address}\" date=\"{date_ms}\" type=\"1\" body=\"{body}\" \
             read=\"1\" locked=\"0\" contact_name=\"{contact_name}\" />")
}

pub fn mms_xml(address: &str, date_ms: i64, parts: &[String]) -> String {
    format!("<mms address=\"{address}\" date=\"{date_ms}\" msg_box=\"1\" m_type=\"132\" \
             m_id=\"mid-{date_ms}\" readable_date=\"whenever\">\n\
             <parts>\n{}\n</parts>\n\
             <addrs><addr address=\"{address}\" type=\"137\" charset=\"106\" /></addrs>\n\
             </mms>",
            parts.join("\n"))
}

pub fn part_xml(seq: i32, ct: &str, data_b64: &str) -> String {
    format!("<part seq=\"{seq}\" ct=\"{ct}\" name=\"null\" cid=\"&lt;part{seq}&gt;\" \
             cl=\"part{seq}\" data=\"{data_b64}\" />")
}

pub fn text_part_xml(text: &str) -> String {
    format!("<part seq=\"0\" ct=\"text/plain\" name=\"null\" text=\"{text}\" />")
}

//
// Attachment payloads
//

pub fn b64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// A blob with a valid JPEG magic, `len` bytes total.
pub fn jpeg_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0xff, 0xd8, 0xff, 0xe0];
    bytes.extend((4..len).map(|i| (i % 251) as u8));
    bytes
}

pub fn png_bytes(len: usize) -> Vec<u8> {
    let mut bytes = b"\x89PNG\r\n\x1a\n".to_vec();
    bytes.extend((8..len).map(|i| (i % 241) as u8));
    bytes
}

//
// Typed record builders
//

pub fn make_call(number: &str, date_ms: i64) -> Call {
    Call {
        number: number.to_owned(),
        duration: 35,
        date: Timestamp(date_ms),
        call_type: CallType::Incoming,
        readable_date: None,
        contact_name: None,
        extra_attrs: vec![],
    }
}

pub fn make_sms(address: &str, date_ms: i64, body: &str) -> Sms {
    Sms {
        address: address.to_owned(),
        date: Timestamp(date_ms),
        sms_type: SmsType::Received,
        body: body.to_owned(),
        protocol: Some("0".to_owned()),
        subject: None,
        read: 1,
        status: Some("-1".to_owned()),
        locked: 0,
        date_sent: None,
        service_center: None,
        readable_date: None,
        contact_name: None,
        extra_attrs: vec![],
    }
}

pub fn make_mms(address: &str, date_ms: i64, parts: Vec<MmsPart>) -> Mms {
    Mms {
        address: address.to_owned(),
        date: Timestamp(date_ms),
        msg_box: MessageBox::Received,
        m_type: Some("132".to_owned()),
        m_id: Some(format!("mid-{date_ms}")),
        thread_id: None,
        readable_date: None,
        contact_name: None,
        parts,
        addrs: vec![],
        extra_attrs: vec![],
    }
}

pub fn make_part(seq: i64, ct: &str, data: Option<String>) -> MmsPart {
    MmsPart {
        seq,
        ct: ct.to_owned(),
        name: None,
        text: None,
        data,
        cid: None,
        cl: None,
        path: None,
        original_size: None,
        extraction_date: None,
        extra_attrs: vec![],
    }
}
