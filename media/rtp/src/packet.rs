//! RTP fixed header (RFC 3550 §5.1) and the in-memory packet representation
//! used throughout the stack.

use crate::{
    ExtensionElement, RtpExtensionsWriter, RtpTimestamp, SequenceNumber, Ssrc, parse_extensions,
};
use bytes::Bytes;
use rtp_types::{RtpPacketBuilder, prelude::RtpPacketWriter};
use smallvec::SmallVec;
use std::time::Instant;

/// RFC 3550 fixed RTP header fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    pub version: u8,
    pub padding: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: SequenceNumber,
    pub timestamp: RtpTimestamp,
    pub ssrc: Ssrc,
    pub csrcs: SmallVec<[u32; 4]>,
}

impl RtpHeader {
    pub fn new(payload_type: u8, sequence_number: SequenceNumber, timestamp: RtpTimestamp, ssrc: Ssrc) -> Self {
        Self {
            version: 2,
            padding: false,
            marker: false,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrcs: SmallVec::new(),
        }
    }
}

/// FSSN carrying MPRTP subflow extension (RFC-draft `urn:ietf:params:rtp-hdrext:mprtp`):
/// 8 bits flow id, 16 bits flow-specific sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MprtpSubflowHeader {
    pub flow_id: u16,
    pub fssn: u16,
}

impl MprtpSubflowHeader {
    /// Encode as the 3 raw bytes of the extension element (zero-padded to the
    /// 32-bit boundary by [`RtpExtensionsWriter`]).
    pub fn encode(self) -> [u8; 3] {
        let flow_id = self.flow_id as u8;
        let [a, b] = self.fssn.to_be_bytes();
        [flow_id, a, b]
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        let &[flow_id, a, b] = data else {
            return None;
        };

        Some(Self {
            flow_id: u16::from(flow_id),
            fssn: u16::from_be_bytes([a, b]),
        })
    }
}

/// An RTP packet: parsed/received form, or the form about to be sent.
///
/// Sent packets leave `arrival_*`/`owd_seconds` at their defaults; received
/// packets have them filled in by the session's extension-header dispatch
/// (§4.1) before being handed to the jitter buffer.
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub header: RtpHeader,
    /// Raw, unparsed extension elements in wire order. Typed fields below
    /// (`flow_id`, `mprtp_subflow_header`, `owd_seconds`) are populated by the
    /// session's extension dispatch table, not derived automatically here.
    pub extensions: Vec<(u8, Bytes)>,
    pub payload: Bytes,

    /// NTP64 timestamp of arrival, if known (0 = unknown).
    pub arrival_ntp: u64,
    pub arrival_local_time: Option<Instant>,
    /// One-way-delay estimate from the RFC 6051 rapid-sync extension, seconds.
    /// `-1.0` means unknown.
    pub owd_seconds: f64,
    pub flow_id: Option<u16>,
    pub mprtp_subflow_header: Option<MprtpSubflowHeader>,
    /// Original SN carried by an RFC 4588 RTX packet, once unwrapped.
    pub rtx_original_sn: Option<u16>,
}

impl RtpPacket {
    pub fn new(header: RtpHeader, payload: Bytes) -> Self {
        Self {
            header,
            extensions: Vec::new(),
            payload,
            arrival_ntp: 0,
            arrival_local_time: None,
            owd_seconds: -1.0,
            flow_id: None,
            mprtp_subflow_header: None,
            rtx_original_sn: None,
        }
    }

    /// Validates the invariant from §3: a packet with a nonempty MPRTP
    /// subflow header must carry the matching `flow_id`.
    pub fn mprtp_invariant_holds(&self) -> bool {
        match (&self.mprtp_subflow_header, self.flow_id) {
            (Some(subflow), Some(flow_id)) => subflow.flow_id == flow_id,
            (Some(_), None) => false,
            (None, _) => true,
        }
    }

    pub fn write_vec(&self, extension_profile: Option<(u16, &[u8])>, vec: &mut Vec<u8>) {
        let mut builder = RtpPacketBuilder::<_, Vec<u8>>::new()
            .payload_type(self.header.payload_type)
            .sequence_number(self.header.sequence_number.0)
            .ssrc(self.header.ssrc.0)
            .timestamp(self.header.timestamp.0)
            .payload(&self.payload[..]);

        if self.header.marker {
            builder = builder.marker_bit(true);
        }

        for csrc in &self.header.csrcs {
            builder = builder.add_csrc(*csrc);
        }

        if let Some((profile, data)) = extension_profile {
            builder = builder.extension(profile, data.to_vec());
        }

        vec.reserve(builder.calculate_size().unwrap_or(0));

        let mut writer = RtpPacketWriterVec {
            output: vec,
            padding: None,
        };
        builder.write(&mut writer).unwrap();
    }

    pub fn to_vec(&self, extension_profile: Option<(u16, &[u8])>) -> Vec<u8> {
        let mut vec = Vec::with_capacity(1500);
        self.write_vec(extension_profile, &mut vec);
        vec
    }

    pub fn parse(bytes: impl Into<Bytes>) -> Result<Self, rtp_types::RtpParseError> {
        let packet: Bytes = bytes.into();
        let parsed = rtp_types::RtpPacket::parse(&packet[..])?;

        let mut extensions = Vec::new();
        if let Some((profile, extension_data)) = parsed.extension() {
            for ExtensionElement { id, data } in parse_extensions(profile, extension_data) {
                extensions.push((id, packet.slice_ref(data)));
            }
        }

        let csrcs: SmallVec<[u32; 4]> = parsed.csrc().iter().copied().collect();

        let header = RtpHeader {
            version: 2,
            padding: parsed.padding(),
            marker: parsed.marker_bit(),
            payload_type: parsed.payload_type(),
            sequence_number: SequenceNumber(parsed.sequence_number()),
            timestamp: RtpTimestamp(parsed.timestamp()),
            ssrc: Ssrc(parsed.ssrc()),
            csrcs,
        };

        Ok(Self {
            header,
            extensions,
            payload: packet.slice_ref(parsed.payload()),
            arrival_ntp: 0,
            arrival_local_time: None,
            owd_seconds: -1.0,
            flow_id: None,
            mprtp_subflow_header: None,
            rtx_original_sn: None,
        })
    }
}

/// Build the RFC 5285 extension payload for a single MPRTP subflow element at
/// the given local extmap id.
pub fn encode_mprtp_extension(id: u8, subflow: MprtpSubflowHeader) -> (u16, Vec<u8>) {
    let mut w = RtpExtensionsWriter::new(false);
    w.write(id, &subflow.encode());
    w.finish()
}

/// Build the RFC 6051 rapid-sync extension payload (64-bit NTP, MSW‖LSW) at
/// the given local extmap id. Returns `None` if either NTP half is zero, per
/// §4.1: "insertion requires both NTP halves non-zero".
pub fn encode_rapid_sync_extension(id: u8, ntp64: u64) -> Option<(u16, Vec<u8>)> {
    let msw = (ntp64 >> 32) as u32;
    let lsw = ntp64 as u32;
    if msw == 0 || lsw == 0 {
        return None;
    }

    let mut w = RtpExtensionsWriter::new(false);
    let mut buf = [0u8; 8];
    buf[0..4].copy_from_slice(&msw.to_be_bytes());
    buf[4..8].copy_from_slice(&lsw.to_be_bytes());
    // RFC 6051 elements are 8 bytes; one-byte header ids only allow 16 bytes max so this fits,
    // but requires splitting into two 4-byte writes to stay within the 1..=16 length rule is not
    // needed since 8 <= 16.
    w.write(id, &buf);
    Some(w.finish())
}

pub fn decode_rapid_sync_extension(data: &[u8]) -> Option<u64> {
    let &[a, b, c, d, e, f, g, h] = data else {
        return None;
    };
    let msw = u32::from_be_bytes([a, b, c, d]);
    let lsw = u32::from_be_bytes([e, f, g, h]);
    Some((u64::from(msw) << 32) | u64::from(lsw))
}

struct RtpPacketWriterVec<'a> {
    output: &'a mut Vec<u8>,
    padding: Option<u8>,
}

impl<'a> RtpPacketWriter for RtpPacketWriterVec<'a> {
    type Output = ();
    type Payload = &'a [u8];
    type Extension = Vec<u8>;

    fn reserve(&mut self, size: usize) {
        if self.output.len() < size {
            self.output.reserve(size - self.output.len());
        }
    }

    fn push(&mut self, data: &[u8]) {
        self.output.extend_from_slice(data)
    }

    fn push_extension(&mut self, extension_data: &Self::Extension) {
        self.push(extension_data)
    }

    fn push_payload(&mut self, data: &Self::Payload) {
        self.push(data)
    }

    fn padding(&mut self, size: u8) {
        self.padding = Some(size);
    }

    fn finish(&mut self) -> Self::Output {
        if let Some(padding) = self.padding.take() {
            self.output
                .resize(self.output.len() + padding as usize - 1, 0);
            self.output.push(padding);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mprtp_subflow_header_round_trip() {
        let subflow = MprtpSubflowHeader {
            flow_id: 1,
            fssn: 4242,
        };
        let encoded = subflow.encode();
        let decoded = MprtpSubflowHeader::decode(&encoded).unwrap();
        assert_eq!(decoded, subflow);
    }

    #[test]
    fn rapid_sync_round_trip() {
        let ntp = 0x0102_0304_0506_0708u64;
        let (profile, bytes) = encode_rapid_sync_extension(1, ntp).unwrap();
        let elements: Vec<_> = parse_extensions(profile, &bytes).collect();
        assert_eq!(elements.len(), 1);
        assert_eq!(decode_rapid_sync_extension(elements[0].data), Some(ntp));
    }

    #[test]
    fn rapid_sync_skipped_when_either_half_zero() {
        assert!(encode_rapid_sync_extension(1, 0x0000_0000_0506_0708).is_none());
        assert!(encode_rapid_sync_extension(1, 0x0102_0304_0000_0000).is_none());
    }

    #[test]
    fn mprtp_invariant() {
        let mut packet = RtpPacket::new(
            RtpHeader::new(96, SequenceNumber(1), RtpTimestamp(0), Ssrc(1)),
            Bytes::new(),
        );
        assert!(packet.mprtp_invariant_holds());

        packet.mprtp_subflow_header = Some(MprtpSubflowHeader { flow_id: 2, fssn: 0 });
        assert!(!packet.mprtp_invariant_holds());

        packet.flow_id = Some(2);
        assert!(packet.mprtp_invariant_holds());
    }
}
