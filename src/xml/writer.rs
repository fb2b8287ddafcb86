use std::io::Cursor;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use crate::prelude::*;
use crate::xml::{RawElement, CALLS_ROOT, COUNT_ATTR, SMSES_ROOT};

#[cfg(test)]
#[path = "writer_tests.rs"]
mod tests;

type XmlWriter = Writer<Cursor<Vec<u8>>>;

/// Renders a full `calls-YYYY.xml` partition in canonical form.
pub fn render_calls_file(calls: &[&Call]) -> Result<Vec<u8>> {
    render_document(CALLS_ROOT, calls.len(), |writer| {
        for call in calls {
            write_empty(writer, call_element(call))?;
        }
        Ok(())
    })
}

/// Renders a full `sms-YYYY.xml` partition in canonical form.
pub fn render_messages_file(messages: &[&Message]) -> Result<Vec<u8>> {
    render_document(SMSES_ROOT, messages.len(), |writer| {
        for message in messages {
            match message {
                Message::Sms(sms) => write_empty(writer, sms_element(sms))?,
                Message::Mms(mms) => write_mms(writer, mms)?,
            }
        }
        Ok(())
    })
}

/// Renders a rejection batch: records in their original source shape, each
/// preceded by a reason comment, re-importable after manual fix.
pub fn render_rejects_file(root_name: &str, rejected: &[(RawElement, String)]) -> Result<Vec<u8>> {
    render_document(root_name, rejected.len(), |writer| {
        for (elem, reason) in rejected {
            writer.write_event(Event::Comment(BytesText::new(&format!(" reason: {reason} "))))
                .context("Cannot write rejection comment")?;
            write_raw(writer, elem)?;
        }
        Ok(())
    })
}

fn render_document(root_name: &str,
                   count: usize,
                   body: impl FnOnce(&mut XmlWriter) -> EmptyRes) -> Result<Vec<u8>> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .context("Cannot write XML declaration")?;
    let count_str = count.to_string();
    let mut root = BytesStart::new(root_name);
    root.push_attribute((COUNT_ATTR, count_str.as_str()));
    writer.write_event(Event::Start(root))
        .with_context(|| format!("Cannot write <{root_name}>"))?;
    body(&mut writer)?;
    writer.write_event(Event::End(BytesEnd::new(root_name)))
        .with_context(|| format!("Cannot write </{root_name}>"))?;
    let mut bytes = writer.into_inner().into_inner();
    bytes.push(b'\n');
    Ok(bytes)
}

fn write_empty(writer: &mut XmlWriter, elem: BytesStart) -> EmptyRes {
    writer.write_event(Event::Empty(elem)).context("Cannot write element")
}

fn write_mms(writer: &mut XmlWriter, mms: &Mms) -> EmptyRes {
    writer.write_event(Event::Start(mms_element(mms))).context("Cannot write <mms>")?;

    writer.write_event(Event::Start(BytesStart::new("parts"))).context("Cannot write <parts>")?;
    for part in &mms.parts {
        write_empty(writer, part_element(part))?;
    }
    writer.write_event(Event::End(BytesEnd::new("parts"))).context("Cannot write </parts>")?;

    if !mms.addrs.is_empty() {
        writer.write_event(Event::Start(BytesStart::new("addrs"))).context("Cannot write <addrs>")?;
        for addr in &mms.addrs {
            write_empty(writer, addr_element(addr))?;
        }
        writer.write_event(Event::End(BytesEnd::new("addrs"))).context("Cannot write </addrs>")?;
    }

    writer.write_event(Event::End(BytesEnd::new("mms"))).context("Cannot write </mms>")
}

fn write_raw(writer: &mut XmlWriter, elem: &RawElement) -> EmptyRes {
    let mut start = BytesStart::new(elem.name.as_str());
    for (k, v) in &elem.attrs {
        start.push_attribute((k.as_str(), v.as_str()));
    }
    if elem.children.is_empty() {
        write_empty(writer, start)
    } else {
        writer.write_event(Event::Start(start))
            .with_context(|| format!("Cannot write <{}>", elem.name))?;
        for child in &elem.children {
            write_raw(writer, child)?;
        }
        writer.write_event(Event::End(BytesEnd::new(elem.name.as_str())))
            .with_context(|| format!("Cannot write </{}>", elem.name))
    }
}

//
// Canonical attribute layouts. Known optional attributes are spelled "null"
// when absent, matching the source schema convention the reader undoes.
//

struct AttrWriter {
    name: &'static str,
    attrs: Vec<(String, String)>,
}

impl AttrWriter {
    fn new(name: &'static str) -> Self {
        AttrWriter { name, attrs: vec![] }
    }

    fn set(mut self, name: &str, value: &str) -> Self {
        self.attrs.push((name.to_owned(), value.to_owned()));
        self
    }

    fn set_opt(self, name: &str, value: Option<&str>) -> Self {
        let value = value.unwrap_or(NULL_VALUE);
        self.set(name, value)
    }

    fn set_int(self, name: &str, value: i64) -> Self {
        self.set(name, &value.to_string())
    }

    fn set_extras(mut self, extras: &[(String, String)]) -> Self {
        for (k, v) in extras {
            self.attrs.push((k.clone(), v.clone()));
        }
        self
    }

    fn into_inner(self) -> BytesStart<'static> {
        let mut elem = BytesStart::new(self.name);
        for (k, v) in &self.attrs {
            elem.push_attribute((k.as_str(), v.as_str()));
        }
        elem.into_owned()
    }
}

fn call_element(call: &Call) -> BytesStart<'static> {
    AttrWriter::new("call")
        .set("number", &call.number)
        .set_int("duration", call.duration)
        .set_int("date", *call.date)
        .set_int("type", call.call_type as i64)
        .set_opt("readable_date", call.readable_date.as_deref())
        .set_opt("contact_name", call.contact_name.as_deref())
        .set_extras(&call.extra_attrs)
        .into_inner()
}

fn sms_element(sms: &Sms) -> BytesStart<'static> {
    AttrWriter::new("sms")
        .set_opt("protocol", sms.protocol.as_deref())
        .set("address", &sms.address)
        .set_int("date", *sms.date)
        .set_int("type", sms.sms_type as i64)
        .set_opt("subject", sms.subject.as_deref())
        .set("body", &sms.body)
        .set_opt("service_center", sms.service_center.as_deref())
        .set_int("read", sms.read as i64)
        .set_opt("status", sms.status.as_deref())
        .set_int("locked", sms.locked as i64)
        .set_opt("date_sent", sms.date_sent.map(|ts| ts.0.to_string()).as_deref())
        .set_opt("readable_date", sms.readable_date.as_deref())
        .set_opt("contact_name", sms.contact_name.as_deref())
        .set_extras(&sms.extra_attrs)
        .into_inner()
}

fn mms_element(mms: &Mms) -> BytesStart<'static> {
    AttrWriter::new("mms")
        .set("address", &mms.address)
        .set_int("date", *mms.date)
        .set_int("msg_box", mms.msg_box as i64)
        .set_opt("m_type", mms.m_type.as_deref())
        .set_opt("m_id", mms.m_id.as_deref())
        .set_opt("thread_id", mms.thread_id.as_deref())
        .set_opt("readable_date", mms.readable_date.as_deref())
        .set_opt("contact_name", mms.contact_name.as_deref())
        .set_extras(&mms.extra_attrs)
        .into_inner()
}

fn part_element(part: &MmsPart) -> BytesStart<'static> {
    let mut writer = AttrWriter::new("part")
        .set_int("seq", part.seq)
        .set("ct", &part.ct)
        .set_opt("name", part.name.as_deref())
        .set_opt("cid", part.cid.as_deref())
        .set_opt("cl", part.cl.as_deref())
        .set_opt("text", part.text.as_deref());
    // Inline payload and extracted reference are mutually exclusive; the
    // extraction metadata is only present on extracted parts.
    if let Some(data) = part.data.as_deref() {
        writer = writer.set("data", data);
    }
    if let Some(path) = part.path.as_deref() {
        writer = writer.set("path", path);
    }
    if let Some(size) = part.original_size {
        writer = writer.set_int("original_size", size as i64);
    }
    if let Some(date) = part.extraction_date.as_deref() {
        writer = writer.set("extraction_date", date);
    }
    writer.set_extras(&part.extra_attrs).into_inner()
}

fn addr_element(addr: &MmsAddr) -> BytesStart<'static> {
    AttrWriter::new("addr")
        .set("address", &addr.address)
        .set_int("type", addr.addr_type as i64)
        .set_opt("charset", addr.charset.as_deref())
        .set_extras(&addr.extra_attrs)
        .into_inner()
}
