use std::fmt::{Debug, Display, Formatter};

use derive_deref::Deref;

use crate::prelude::*;
use crate::utils::hashing::IncrementalHasher;

#[cfg(test)]
#[path = "fingerprint_tests.rs"]
mod tests;

/// Stable 256-bit identity of a record, used for dedup.
///
/// Volatile display fields (`readable_date`, `contact_name`) are excluded, as
/// is inline base64 once the part payload hash is known, so the identity
/// survives re-export and attachment extraction.
#[derive(Deref, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl Debug for Fingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({})", self.short_hex())
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.hex())
    }
}

// Record kind tags, hashed first so identical field sets of different kinds
// cannot collide.
const TAG_CALL: u8 = b'C';
const TAG_SMS: u8 = b'S';
const TAG_MMS: u8 = b'M';

/// Canonical length-prefixed binary encoder: each present field is emitted as
/// `varint(field_id) ++ varint(len) ++ bytes`, fields in ascending id order,
/// absent fields omitted. Integers are encoded as their decimal ASCII form to
/// keep the encoding independent of native widths.
struct FieldEncoder {
    buf: Vec<u8>,
}

impl FieldEncoder {
    fn new() -> Self {
        FieldEncoder { buf: vec![] }
    }

    fn bytes_field(&mut self, id: u64, bytes: &[u8]) {
        write_varint(&mut self.buf, id);
        write_varint(&mut self.buf, bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
    }

    fn str_field(&mut self, id: u64, value: &str) {
        self.bytes_field(id, value.as_bytes());
    }

    fn opt_str_field(&mut self, id: u64, value: Option<&str>) {
        if let Some(v) = value {
            self.str_field(id, v);
        }
    }

    fn int_field(&mut self, id: u64, value: i64) {
        self.str_field(id, &value.to_string());
    }

    fn opt_int_field(&mut self, id: u64, value: Option<i64>) {
        if let Some(v) = value {
            self.int_field(id, v);
        }
    }

    fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

fn write_varint(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

fn finish(tag: u8, encoder: FieldEncoder) -> Fingerprint {
    let mut hasher = IncrementalHasher::new();
    hasher.update(&[tag]);
    hasher.update(&encoder.into_bytes());
    Fingerprint(hasher.finalize())
}

impl Call {
    pub fn fingerprint(&self) -> Fingerprint {
        let mut enc = FieldEncoder::new();
        enc.str_field(1, &self.normalized_number());
        enc.int_field(2, self.duration);
        enc.int_field(3, *self.date);
        enc.int_field(4, self.call_type as i64);
        finish(TAG_CALL, enc)
    }
}

impl Sms {
    pub fn fingerprint(&self) -> Fingerprint {
        let mut enc = FieldEncoder::new();
        enc.str_field(1, &normalize_number(&self.address));
        enc.int_field(2, *self.date);
        enc.int_field(3, self.sms_type as i64);
        enc.str_field(4, &self.body);
        enc.opt_str_field(5, self.protocol.as_deref());
        enc.opt_str_field(6, self.subject.as_deref());
        enc.int_field(7, self.read as i64);
        enc.opt_str_field(8, self.status.as_deref());
        enc.int_field(9, self.locked as i64);
        enc.opt_int_field(10, self.date_sent.map(|ts| *ts));
        enc.opt_str_field(11, self.service_center.as_deref());
        finish(TAG_SMS, enc)
    }
}

impl Mms {
    pub fn fingerprint(&self) -> Fingerprint {
        let mut enc = FieldEncoder::new();
        let normalized_addresses =
            self.addresses().iter().map(|a| normalize_number(a)).join(&ADDRESS_SEP.to_string());
        enc.str_field(1, &normalized_addresses);
        enc.int_field(2, *self.date);
        enc.int_field(3, self.msg_box as i64);
        enc.opt_str_field(4, self.m_type.as_deref());
        enc.opt_str_field(5, self.m_id.as_deref());
        enc.opt_str_field(6, self.thread_id.as_deref());
        for part in self.parts.iter().sorted_by_key(|p| p.seq) {
            enc.bytes_field(15, &part.canonical_bytes());
        }
        finish(TAG_MMS, enc)
    }
}

impl MmsPart {
    /// Canonical sub-encoding of one part. The payload field (7) holds the
    /// content hash of the decoded data whether the part is still inline or
    /// already extracted, which is what keeps an MMS fingerprint stable
    /// across extraction.
    fn canonical_bytes(&self) -> Vec<u8> {
        let mut enc = FieldEncoder::new();
        enc.int_field(1, self.seq);
        enc.str_field(2, &self.ct);
        enc.opt_str_field(3, self.name.as_deref());
        enc.opt_str_field(4, self.text.as_deref());
        enc.opt_str_field(5, self.cid.as_deref());
        enc.opt_str_field(6, self.cl.as_deref());
        enc.opt_str_field(7, self.payload_hash().as_deref());
        enc.into_bytes()
    }

    /// Content hash of the part payload: the blob basename after extraction,
    /// the hash of the decoded base64 before. An undecodable inline payload
    /// is hashed as its raw attribute bytes so the fingerprint stays total.
    fn payload_hash(&self) -> Option<String> {
        if let Some(hash) = self.blob_hash() {
            return Some(hash.to_owned());
        }
        self.data.as_deref().map(|data| {
            match decode_base64(data) {
                Ok(bytes) => hashing::hash_bytes(&bytes),
                Err(_) => hashing::hash_bytes(data.as_bytes()),
            }
        })
    }
}

/// Decodes base64 the way backup tools emit it, i.e. possibly wrapped in
/// whitespace/newlines.
pub fn decode_base64(data: &str) -> Result<Vec<u8>> {
    use base64::Engine;
    let compact: String = data.chars().filter(|c| !c.is_whitespace()).collect();
    base64::engine::general_purpose::STANDARD.decode(compact.as_bytes())
        .map_err(|e| PipelineError::AttachmentDecode { reason: e.to_string() }.into())
}
