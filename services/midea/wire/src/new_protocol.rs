//! "New protocol" tag/length/value records carried inside some message bodies.
//!
//! ```text
//! body:   | body type | count | record ... |
//! narrow: | tag lo | tag hi | len | value ... |          (body type 0xB5)
//! wide:   | tag lo | tag hi | 0x00 | len | value ... |   (all other body types)
//! ```

use crate::WireError;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use tracing::debug;

/// Body type whose records use the narrow prefix
pub const NARROW_BODY_TYPE: u8 = 0xB5;

/// Record prefix layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordWidth {
    /// `tag, len` prefix
    Narrow,
    /// `tag, reserved, len` prefix
    Wide,
}

impl RecordWidth {
    /// Record width used inside a body of the given type
    pub fn for_body_type(body_type: u8) -> Self {
        if body_type == NARROW_BODY_TYPE {
            RecordWidth::Narrow
        } else {
            RecordWidth::Wide
        }
    }

    fn prefix_len(self) -> usize {
        match self {
            RecordWidth::Narrow => 3,
            RecordWidth::Wide => 4,
        }
    }
}

/// Pack one record
pub fn pack_record(tag: u16, value: &[u8], width: RecordWidth) -> Result<Bytes, WireError> {
    let mut buf = BytesMut::with_capacity(width.prefix_len() + value.len());
    put_record(&mut buf, tag, value, width)?;
    Ok(buf.freeze())
}

/// Pack a full body: body type, record count and every record
pub fn pack_records(body_type: u8, records: &[(u16, &[u8])]) -> Result<Bytes, WireError> {
    if records.len() > u8::MAX as usize {
        return Err(WireError::Length(records.len()));
    }

    let width = RecordWidth::for_body_type(body_type);
    let mut buf = BytesMut::new();
    buf.put_u8(body_type);
    buf.put_u8(records.len() as u8);
    for (tag, value) in records {
        put_record(&mut buf, *tag, value, width)?;
    }

    Ok(buf.freeze())
}

fn put_record(
    buf: &mut BytesMut,
    tag: u16,
    value: &[u8],
    width: RecordWidth,
) -> Result<(), WireError> {
    let len = u8::try_from(value.len()).map_err(|_| WireError::Length(value.len()))?;
    buf.put_u16_le(tag);
    if width == RecordWidth::Wide {
        buf.put_u8(0x00);
    }
    buf.put_u8(len);
    buf.put_slice(value);
    Ok(())
}

/// Parse the records of a body into a tag → value map.
///
/// Some devices emit records whose length runs past the end of the body.
/// Parsing stops at the first such record and whatever was parsed before it is
/// returned. Zero-length records carry no value and are skipped.
pub fn parse_records(body: &[u8]) -> BTreeMap<u16, Bytes> {
    let mut records = BTreeMap::new();
    if body.len() < 2 {
        return records;
    }

    let width = RecordWidth::for_body_type(body[0]);
    let count = body[1] as usize;
    let mut pos = 2;

    for _ in 0..count {
        let prefix = width.prefix_len();
        if pos + prefix > body.len() {
            debug!("Non-standard new protocol body {}", hex::encode(body));
            break;
        }

        let tag = u16::from_le_bytes([body[pos], body[pos + 1]]);
        let len = body[pos + prefix - 1] as usize;
        let start = pos + prefix;
        if start + len > body.len() {
            debug!("Non-standard new protocol body {}", hex::encode(body));
            break;
        }

        if len > 0 {
            records.insert(tag, Bytes::copy_from_slice(&body[start..start + len]));
        }
        pos = start + len;
    }

    records
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_record_layouts() {
        let narrow = pack_record(0x005B, &[0x01], RecordWidth::Narrow).unwrap();
        assert_eq!(&narrow[..], &[0x5B, 0x00, 0x01, 0x01]);

        let wide = pack_record(0x0230, &[0xAA, 0xBB], RecordWidth::Wide).unwrap();
        assert_eq!(&wide[..], &[0x30, 0x02, 0x00, 0x02, 0xAA, 0xBB]);
    }

    #[test]
    fn test_pack_then_parse() {
        let records: Vec<(u16, &[u8])> = vec![
            (0x005B, &[0x01][..]),
            (0x0230, &[0x10, 0x20, 0x30][..]),
            (0x1234, &[0xFF; 7][..]),
        ];

        for body_type in [0xB5u8, 0xB0, 0xB1] {
            let body = pack_records(body_type, &records).unwrap();
            let parsed = parse_records(&body);

            assert_eq!(parsed.len(), records.len());
            for (tag, value) in &records {
                assert_eq!(&parsed[tag][..], *value);
            }
        }
    }

    #[test]
    fn test_overrunning_record_yields_partial_map() {
        let mut body = pack_records(0xB1, &[(0x0001, &[0x01, 0x02][..])]).unwrap().to_vec();
        body[1] = 2;
        // second record claims 9 value bytes but only carries 2
        body.extend_from_slice(&[0x02, 0x00, 0x00, 0x09, 0xAA, 0xBB]);

        let parsed = parse_records(&body);
        assert_eq!(parsed.len(), 1);
        assert_eq!(&parsed[&0x0001][..], &[0x01, 0x02]);
    }

    #[test]
    fn test_truncated_prefix_and_empty_bodies() {
        assert!(parse_records(&[]).is_empty());
        assert!(parse_records(&[0xB5]).is_empty());
        assert!(parse_records(&[0xB5, 0x03, 0x5B]).is_empty());

        // zero-length record is skipped but parsing continues
        let body = [0xB5, 0x02, 0x10, 0x00, 0x00, 0x5B, 0x00, 0x01, 0x01];
        let parsed = parse_records(&body);
        assert_eq!(parsed.len(), 1);
        assert_eq!(&parsed[&0x005B][..], &[0x01]);
    }

    #[test]
    fn test_oversized_value_rejected() {
        assert!(pack_record(0x0001, &[0u8; 256], RecordWidth::Wide).is_err());
    }
}
