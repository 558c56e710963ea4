//! The transport-facing interface the core expects. Socket I/O, ICE,
//! DTLS-SRTP and SDP negotiation are deliberately out of scope (spec §1); an
//! embedding application implements [`NetworkInterface`] over whatever
//! transport it actually has and hands instances to [`RtpSession`](crate::RtpSession).

use crate::Result;
use std::net::SocketAddr;

/// One network path a session can send RTP/RTCP over (the RTP/RTCP pair for
/// a single flow in the single-path case, or one MPRTP subflow).
pub trait NetworkInterface: Send {
    /// Whether this interface applies a secure transport (key management is
    /// out of scope here; the core only needs to know to budget for it, see
    /// [`crate::Mtu::with_secure_transport`]).
    fn secure(&self) -> bool {
        false
    }

    fn local_rtp_addr(&self) -> SocketAddr;
    fn remote_rtp_addr(&self) -> SocketAddr;

    fn send_rtp(&mut self, bytes: &[u8]) -> Result<()>;
    fn send_rtcp(&mut self, bytes: &[u8]) -> Result<()>;
}

/// An in-memory pair of queues implementing [`NetworkInterface`], useful for
/// tests and for composing a session end-to-end without real sockets.
#[derive(Debug, Default)]
pub struct LoopbackInterface {
    pub local: SocketAddrPair,
    pub remote: SocketAddrPair,
    pub sent_rtp: Vec<Vec<u8>>,
    pub sent_rtcp: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Copy)]
pub struct SocketAddrPair(pub SocketAddr);

impl Default for SocketAddrPair {
    fn default() -> Self {
        Self(SocketAddr::from(([127, 0, 0, 1], 0)))
    }
}

impl NetworkInterface for LoopbackInterface {
    fn local_rtp_addr(&self) -> SocketAddr {
        self.local.0
    }

    fn remote_rtp_addr(&self) -> SocketAddr {
        self.remote.0
    }

    fn send_rtp(&mut self, bytes: &[u8]) -> Result<()> {
        self.sent_rtp.push(bytes.to_vec());
        Ok(())
    }

    fn send_rtcp(&mut self, bytes: &[u8]) -> Result<()> {
        self.sent_rtcp.push(bytes.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_records_sent_packets() {
        let mut iface = LoopbackInterface::default();
        iface.send_rtp(&[1, 2, 3]).unwrap();
        iface.send_rtcp(&[4, 5]).unwrap();
        assert_eq!(iface.sent_rtp, vec![vec![1, 2, 3]]);
        assert_eq!(iface.sent_rtcp, vec![vec![4, 5]]);
    }
}
