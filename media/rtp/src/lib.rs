//! RTP/RTCP wire types and packetization primitives.
//!
//! This crate is sans-io: it knows how to build and parse RTP packets,
//! one-byte/two-byte header extensions (RFC 5285), the RFC 4588 retransmission
//! payload shape and the MPRTP/rapid-sync extension elements, but never
//! touches a socket. `rtmedia-core` builds the session state machine on top
//! of these types.

mod extensions;
mod ntp_timestamp;
mod packet;
mod payloader;
mod rtx;

pub use extensions::{ExtensionElement, RtpExtensionsWriter, parse_extensions};
pub use ntp_timestamp::NtpTimestamp;
pub use packet::{
    MprtpSubflowHeader, RtpHeader, RtpPacket, decode_rapid_sync_extension,
    encode_mprtp_extension, encode_rapid_sync_extension,
};
pub use payloader::{DePayloader, GenericDePayloader, GenericPayloader, Payloader};
pub use rtx::{RtxUnwrapError, unwrap_rtx_payload, wrap_rtx_payload};

pub use rtcp_types;
pub use rtp_types;

/// 32-bit synchronization source identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ssrc(pub u32);

/// 16-bit RTP sequence number, as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceNumber(pub u16);

/// RTP sequence number extended with a rollover count, per RFC 3550 appendix A.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExtendedSequenceNumber(pub u64);

/// RFC 3550 appendix A.1 rollover-detection constants.
pub const MAX_DROPOUT: u32 = 3000;
pub const MAX_MISORDER: u32 = 100;
pub const MIN_SEQUENTIAL: u32 = 2;
pub const RTP_SEQ_MOD: u32 = 1 << 16;

impl ExtendedSequenceNumber {
    pub fn increase_one(&mut self) -> SequenceNumber {
        self.0 += 1;
        self.truncated()
    }

    pub fn truncated(&self) -> SequenceNumber {
        SequenceNumber(self.0 as u16)
    }

    pub fn rollover_count(&self) -> u64 {
        self.0 >> 16
    }

    /// Guess the extended sequence number of `seq` assuming it is close to `self`.
    ///
    /// This is the cheap "nearest rollover" guess used once a stream is already
    /// tracked. The probationary RFC 3550 A.1 `update_seq` state machine
    /// (bad_seq/cycles/probation) lives on `SessionDatabase` in `rtmedia-core`,
    /// since it needs more state than a single counter carries.
    pub fn guess_extended(&self, seq: SequenceNumber) -> ExtendedSequenceNumber {
        ExtendedSequenceNumber(wrapping_counter_to_u64_counter(
            self.0,
            u64::from(seq.0),
            u64::from(u16::MAX),
        ))
    }
}

/// RTP timestamp, as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RtpTimestamp(pub u32);

/// RTP timestamp extended with a rollover count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExtendedRtpTimestamp(pub u64);

impl ExtendedRtpTimestamp {
    pub fn truncated(&self) -> RtpTimestamp {
        RtpTimestamp(self.0 as u32)
    }

    pub fn rollover_count(&self) -> u64 {
        self.0 >> 32
    }

    pub fn guess_extended(&self, ts: RtpTimestamp) -> ExtendedRtpTimestamp {
        ExtendedRtpTimestamp(wrapping_counter_to_u64_counter(
            self.0,
            u64::from(ts.0),
            u64::from(u32::MAX),
        ))
    }
}

fn wrapping_counter_to_u64_counter(reference: u64, got: u64, max: u64) -> u64 {
    let base = (reference & !max) | got;

    let below = base.wrapping_sub(1u64 << max.count_ones());
    let above = base.wrapping_add(1u64 << max.count_ones());

    let dist_base = reference.abs_diff(base);
    let dist_below = reference.abs_diff(below);
    let dist_above = reference.abs_diff(above);

    if dist_below < dist_base && dist_below <= dist_above {
        below
    } else if dist_above < dist_base && dist_above < dist_below {
        above
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollover() {
        let reference = ExtendedSequenceNumber(65535);
        assert_eq!(
            reference.guess_extended(SequenceNumber(65534)),
            ExtendedSequenceNumber(65534)
        );
        assert_eq!(
            reference.guess_extended(SequenceNumber(0)),
            ExtendedSequenceNumber(65536)
        );
        assert_eq!(
            reference.guess_extended(SequenceNumber(1)),
            ExtendedSequenceNumber(65537)
        );
    }

    #[test]
    fn rtp_timestamp_rollover() {
        let reference = ExtendedRtpTimestamp(u64::from(u32::MAX));
        assert_eq!(
            reference.guess_extended(RtpTimestamp(0)),
            ExtendedRtpTimestamp(u64::from(u32::MAX) + 1)
        );
    }
}
