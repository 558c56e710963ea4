//! RFC 4588 retransmission payload framing: a 2-byte big-endian original
//! sequence number prefixed onto the original RTP payload.

use bytes::{BufMut, Bytes, BytesMut};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RtxUnwrapError {
    #[error("RTX payload shorter than the 2-byte original-sequence-number prefix")]
    TooShort,
}

/// Prefix `original_sn` onto `payload`, producing the payload of an RTX packet.
pub fn wrap_rtx_payload(original_sn: u16, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + payload.len());
    buf.put_u16(original_sn);
    buf.put_slice(payload);
    buf.freeze()
}

/// Strip the 2-byte original-sequence-number prefix off an RTX payload,
/// returning the original sequence number and the original payload.
pub fn unwrap_rtx_payload(rtx_payload: &Bytes) -> Result<(u16, Bytes), RtxUnwrapError> {
    if rtx_payload.len() < 2 {
        return Err(RtxUnwrapError::TooShort);
    }

    let original_sn = u16::from_be_bytes([rtx_payload[0], rtx_payload[1]]);
    Ok((original_sn, rtx_payload.slice(2..)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_prefixes_big_endian_sn() {
        let wrapped = wrap_rtx_payload(7000, &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(&wrapped[..2], &[0x1B, 0x58]);
        assert_eq!(&wrapped[2..], &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn unwrap_round_trips() {
        let wrapped = wrap_rtx_payload(65000, b"payload");
        let (sn, payload) = unwrap_rtx_payload(&wrapped).unwrap();
        assert_eq!(sn, 65000);
        assert_eq!(&payload[..], b"payload");
    }

    #[test]
    fn unwrap_rejects_short_payload() {
        let short = Bytes::from_static(&[0x00]);
        assert_eq!(unwrap_rtx_payload(&short), Err(RtxUnwrapError::TooShort));
    }
}
