use pretty_assertions::{assert_eq, assert_ne};

use super::*;
use crate::prelude::*;
use crate::repo::attachments::blob_rel_path;

//
// Stability under volatile fields
//

#[test]
fn call_fingerprint_ignores_volatile_fields() {
    let mut a = make_call("+15551234567", ts("2013-12-02 08:00:00"));
    let mut b = a.clone();
    a.readable_date = Some("Dec 2, 2013 8:00:00 AM".to_owned());
    b.readable_date = Some("2 Dec 2013 09:00:00 CET".to_owned());
    b.contact_name = Some("Alice".to_owned());
    assert_eq!(a.fingerprint(), b.fingerprint());
}

#[test]
fn call_fingerprint_uses_normalized_number() {
    let a = make_call("+1 (555) 123-4567", ts("2013-12-02 08:00:00"));
    let b = make_call("5551234567", ts("2013-12-02 08:00:00"));
    assert_eq!(a.fingerprint(), b.fingerprint());
}

#[test]
fn call_fingerprint_distinguishes_content_fields() {
    let base = make_call("5551234567", ts("2013-12-02 08:00:00"));

    let mut other = base.clone();
    other.duration += 1;
    assert_ne!(base.fingerprint(), other.fingerprint());

    let mut other = base.clone();
    other.call_type = CallType::Missed;
    assert_ne!(base.fingerprint(), other.fingerprint());
}

#[test]
fn sms_fingerprint_ignores_volatile_fields() {
    let mut a = make_sms("5551234567", ts("2014-03-01 10:00:00"), "hello");
    let mut b = a.clone();
    a.contact_name = Some("Alice".to_owned());
    b.readable_date = Some("whenever".to_owned());
    assert_eq!(a.fingerprint(), b.fingerprint());

    b.body = "hello!".to_owned();
    assert_ne!(a.fingerprint(), b.fingerprint());
}

#[test]
fn sms_fingerprint_separates_absent_and_empty() {
    let a = make_sms("5551234567", ts("2014-03-01 10:00:00"), "hi");
    let mut b = a.clone();
    b.subject = Some("".to_owned());
    // Absent and empty-string subject are different records.
    assert_ne!(a.fingerprint(), b.fingerprint());
}

#[test]
fn kind_tags_prevent_cross_kind_collisions() {
    // A call and an SMS with coinciding leading fields must not collide.
    let call = make_call("5551234567", 1_000_000);
    let sms = make_sms("5551234567", 1_000_000, "");
    assert_ne!(*call.fingerprint(), *sms.fingerprint());
}

//
// MMS: stability across extraction
//

#[test]
fn mms_fingerprint_stable_across_extraction() {
    let payload = jpeg_bytes(4096);
    let hash = hashing::hash_bytes(&payload);

    let inline = make_mms("555~666", ts("2015-06-01 12:00:00"),
                          vec![make_part(0, "image/jpeg", Some(b64(&payload)))]);

    let mut extracted = inline.clone();
    {
        let part = &mut extracted.parts[0];
        part.data = None;
        part.path = Some(blob_rel_path(&hash));
        part.original_size = Some(payload.len() as u64);
        part.extraction_date = Some("2015-06-02T00:00:00Z".to_owned());
    }

    assert_eq!(inline.fingerprint(), extracted.fingerprint());
}

#[test]
fn mms_fingerprint_normalizes_addresses_preserving_order() {
    let a = make_mms("+1 (555) 111-2222~666", ts("2015-06-01 12:00:00"), vec![]);
    let b = make_mms("5551112222~666", ts("2015-06-01 12:00:00"), vec![]);
    let c = make_mms("666~5551112222", ts("2015-06-01 12:00:00"), vec![]);
    assert_eq!(a.fingerprint(), b.fingerprint());
    // Join order is part of the identity.
    assert_ne!(a.fingerprint(), c.fingerprint());
}

#[test]
fn mms_fingerprint_orders_parts_by_seq() {
    let part_a = make_part(0, "text/plain", None);
    let part_b = make_part(1, "image/jpeg", Some(b64(&jpeg_bytes(2048))));

    let ordered = make_mms("555", ts("2015-06-01 12:00:00"),
                           vec![part_a.clone(), part_b.clone()]);
    let shuffled = make_mms("555", ts("2015-06-01 12:00:00"), vec![part_b, part_a]);
    assert_eq!(ordered.fingerprint(), shuffled.fingerprint());
}

//
// Encoding plumbing
//

#[test]
fn decode_base64_tolerates_whitespace() -> EmptyRes {
    let payload = b"attachment payload bytes";
    let mut encoded = b64(payload);
    encoded.insert(8, '\n');
    encoded.insert(4, ' ');
    assert_eq!(decode_base64(&encoded)?, payload);
    Ok(())
}

#[test]
fn decode_base64_flags_garbage() {
    let err = decode_base64("@@not-base64@@").unwrap_err();
    assert!(matches!(pipeline_error(&err), Some(PipelineError::AttachmentDecode { .. })));
}

#[test]
fn fingerprint_hex_shapes() {
    let fingerprint = make_call("555", 1_000).fingerprint();
    assert_eq!(fingerprint.hex().len(), 64);
    assert_eq!(fingerprint.short_hex().len(), 8);
    assert_eq!(format!("{fingerprint}"), fingerprint.hex());
}
