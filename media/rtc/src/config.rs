//! Plain session configuration. No SDP parsing happens here or anywhere in
//! this crate (explicit non-goal) — a caller that does speak SDP builds one
//! of these directly from the attributes listed in spec §6.

use rtp::Ssrc;
use std::time::Duration;

/// When to insert the RFC 6051 rapid-sync NTP header extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RapidSyncMode {
    #[default]
    None,
    EverySample,
    EveryRtpPacket,
}

/// Negotiated `rtcp-fb` values (spec §6).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RtcpFeedback {
    pub nack: bool,
    pub ack: bool,
    pub scream: bool,
    pub nada: bool,
    pub goog_remb: bool,
}

/// Local extmap id table. `None` means the extension is not negotiated.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtensionIds {
    pub mprtp: Option<u8>,
    pub rapid_sync: Option<u8>,
    pub rtcp_in_rtp: Option<u8>,
}

/// One `a=mprtp interface:` declaration, optionally restricted to a set of
/// remote interface indices via `a=mprtp bind:`.
#[derive(Debug, Clone)]
pub struct MprtpInterface {
    pub flow_id: u16,
    pub local_rtp: std::net::SocketAddr,
    pub local_rtcp: std::net::SocketAddr,
    pub remote_rtp: std::net::SocketAddr,
    pub remote_rtcp: std::net::SocketAddr,
    /// Remote interface indices this local interface is allowed to bind to.
    /// Empty means full mesh (any remote interface).
    pub bind: Vec<u16>,
}

/// Attributes of a single RTP session that the core consumes, mirroring the
/// subset of SDP media-description fields from spec §6. Constructed directly
/// by the caller — the thing that actually parses SDP.
#[derive(Debug, Clone)]
pub struct SessionParameters {
    pub ssrc: Ssrc,
    pub payload_type: u8,
    pub clock_rate: u32,

    /// RTX payload type and `a=rtx-time`, if retransmission is negotiated.
    pub rtx: Option<RtxParameters>,

    pub rapid_sync: RapidSyncMode,
    pub extension_ids: ExtensionIds,
    pub feedback: RtcpFeedback,

    /// MPRTP interfaces; empty means this is a single-path session.
    pub mprtp_interfaces: Vec<MprtpInterface>,

    pub rtcp_mux: bool,
    pub rtcp_rsize: bool,

    /// `ExitOnBye`: stop as soon as the first BYE for this session is seen,
    /// rather than waiting for a BYE from every known remote SSRC.
    pub exit_on_bye: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct RtxParameters {
    pub payload_type: u8,
    pub rtx_time: Duration,
}

impl Default for SessionParameters {
    fn default() -> Self {
        Self {
            ssrc: Ssrc(rand::random()),
            payload_type: 96,
            clock_rate: 90_000,
            rtx: None,
            rapid_sync: RapidSyncMode::default(),
            extension_ids: ExtensionIds::default(),
            feedback: RtcpFeedback::default(),
            mprtp_interfaces: Vec::new(),
            rtcp_mux: true,
            rtcp_rsize: false,
            exit_on_bye: true,
        }
    }
}

impl SessionParameters {
    pub fn is_mprtp(&self) -> bool {
        !self.mprtp_interfaces.is_empty() && self.extension_ids.mprtp.is_some()
    }
}
