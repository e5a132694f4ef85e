//! Confluent wire envelope: `[marker: u8][schema id: u32 BE][body..]`.
//!
//! See the [wire format](https://docs.confluent.io/platform/current/schema-registry/fundamentals/serdes-develop/index.html#wire-format).
use std::ops::Range;

use thiserror::Error;

/// Offset of the format marker byte
pub const MARKER_OFFSET: usize = 0;
/// Expected value of the format marker
pub const MARKER: u8 = 0;
/// Bytes holding the big-endian schema identifier
pub const SCHEMA_ID_RANGE: Range<usize> = 1..5;
/// Envelope header length, body starts right after it
pub const HEADER_LEN: usize = SCHEMA_ID_RANGE.end;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("payload truncated: {0} bytes, header needs {HEADER_LEN}")]
    Truncated(usize),
    #[error("unknown format marker {0:#04x}")]
    UnknownMarker(u8),
}

/// Parsed envelope, borrowing the body from the original payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope<'a> {
    pub marker: u8,
    pub schema_id: u32,
    pub body: &'a [u8],
}

/// Splits payload into schema id and body. Marker byte is not validated.
pub fn parse_envelope(payload: &[u8]) -> Result<Envelope<'_>, EnvelopeError> {
    if payload.len() < HEADER_LEN {
        return Err(EnvelopeError::Truncated(payload.len()));
    }
    let mut id = [0u8; 4];
    id.copy_from_slice(&payload[SCHEMA_ID_RANGE]);
    Ok(Envelope {
        marker: payload[MARKER_OFFSET],
        schema_id: u32::from_be_bytes(id),
        body: &payload[HEADER_LEN..],
    })
}

/// Same as [parse_envelope], but rejects payloads whose marker is not [MARKER]
pub fn parse_envelope_strict(payload: &[u8]) -> Result<Envelope<'_>, EnvelopeError> {
    let envelope = parse_envelope(payload)?;
    if envelope.marker != MARKER {
        return Err(EnvelopeError::UnknownMarker(envelope.marker));
    }
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_payloads_are_truncated() {
        for len in 0..HEADER_LEN {
            let payload = vec![0u8; len];
            assert_eq!(parse_envelope(&payload), Err(EnvelopeError::Truncated(len)));
        }
        assert_eq!(
            parse_envelope(&[0, 0, 7]),
            Err(EnvelopeError::Truncated(3))
        );
    }

    #[test]
    fn schema_id_is_big_endian_regardless_of_marker() {
        for marker in [0u8, 1, 0x7f, 0xff] {
            let payload = [marker, 0x01, 0x02, 0x03, 0x04, 0xaa, 0xbb];
            let envelope = parse_envelope(&payload).unwrap();
            assert_eq!(envelope.marker, marker);
            assert_eq!(envelope.schema_id, 0x0102_0304);
            assert_eq!(envelope.body, &[0xaa, 0xbb]);
        }
        let envelope = parse_envelope(&[0, 0xff, 0xff, 0xff, 0xff]).unwrap();
        assert_eq!(envelope.schema_id, u32::MAX);
    }

    #[test]
    fn header_only_payload_has_empty_body() {
        let envelope = parse_envelope(&[0, 0, 0, 0, 7]).unwrap();
        assert_eq!(envelope.schema_id, 7);
        assert!(envelope.body.is_empty());
    }

    #[test]
    fn strict_mode_checks_marker() {
        assert!(parse_envelope_strict(&[0, 0, 0, 0, 1]).is_ok());
        assert_eq!(
            parse_envelope_strict(&[2, 0, 0, 0, 1]),
            Err(EnvelopeError::UnknownMarker(2))
        );
        assert_eq!(
            parse_envelope_strict(&[2, 0]),
            Err(EnvelopeError::Truncated(2))
        );
    }
}
