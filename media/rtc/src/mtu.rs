const RTP_OVERHEAD: usize = rtp::rtp_types::RtpPacket::MIN_RTP_PACKET_LEN;

// The core does not implement a secure transport itself (key management is
// out of scope, see spec §1); it only reserves room for one when a
// NetworkInterface declares itself `secure`.
const SECURE_TRANSPORT_OVERHEAD: usize = 32;

/// Maximum Transmission Unit. Utility type to calculate maximum packet sizes.
#[derive(Debug, Clone, Copy)]
pub struct Mtu {
    base: usize,
    secure: bool,
    // total overhead introduced by RTP extensions only
    rtp_extensions: usize,
}

impl Default for Mtu {
    fn default() -> Self {
        Mtu {
            base: 1472,
            secure: false,
            rtp_extensions: 0,
        }
    }
}

impl Mtu {
    /// Create a new MTU config with the given upper limit. The limit is
    /// always at least 256.
    ///
    /// Overhead of the IP & UDP layer is not taken into account when
    /// calculating RTP/RTCP packet sizes.
    pub const fn new(mut mtu: usize) -> Self {
        if mtu < 256 {
            mtu = 256;
        }

        Self {
            base: mtu,
            secure: false,
            rtp_extensions: 0,
        }
    }

    pub const fn with_secure_transport(self) -> Self {
        Self {
            secure: true,
            ..self
        }
    }

    pub const fn with_additional_rtp_extension(mut self, attribute_len: usize) -> Self {
        // Assumes the worst case: two-byte header extensions.
        if self.rtp_extensions == 0 {
            self.rtp_extensions = 2;
        }

        Self {
            rtp_extensions: self.rtp_extensions + attribute_len + 2,
            ..self
        }
    }

    /// The maximum allowed size of RTP payloads.
    pub const fn for_rtp_payload(self) -> usize {
        let mut base = self.base;

        if self.secure {
            base -= SECURE_TRANSPORT_OVERHEAD;
        }

        base.saturating_sub(self.rtp_extensions)
            .saturating_sub(RTP_OVERHEAD)
    }

    pub const fn for_rtcp_packets(self) -> usize {
        if self.secure {
            self.base - SECURE_TRANSPORT_OVERHEAD
        } else {
            self.base
        }
    }
}
