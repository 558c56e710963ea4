//! MPRTP subflow core (spec §4.6): per-flow sequence numbering and subflow
//! selection for multi-path RTP sessions.

use rtp::MprtpSubflowHeader;
use std::net::SocketAddr;

/// Per-flow path measurements; updated only on `MemberUpdate` events.
#[derive(Debug, Clone, Copy)]
pub struct PathInfo {
    pub flow_id: u16,
    pub rtt_seconds: f64,
    pub cumulative_lost: u64,
    pub one_way_delay_seconds: f64,
}

/// RTT reported for a flow on which no RTT has ever been measured.
pub const UNMEASURED_RTT_SECONDS: f64 = 100.0;

impl PathInfo {
    pub fn new(flow_id: u16) -> Self {
        Self {
            flow_id,
            rtt_seconds: UNMEASURED_RTT_SECONDS,
            cumulative_lost: 0,
            one_way_delay_seconds: 0.0,
        }
    }
}

/// One MPRTP subflow: its own sequence-number space on top of the session's
/// shared SSRC.
#[derive(Debug, Clone)]
pub struct MpRtpFlow {
    pub flow_id: u16,
    pub local_rtp: SocketAddr,
    pub local_rtcp: SocketAddr,
    pub remote_rtp: SocketAddr,
    pub remote_rtcp: SocketAddr,
    next_sn: u16,
    next_rtx_sn: u16,
    pub path_info: PathInfo,
}

impl MpRtpFlow {
    pub fn new(
        flow_id: u16,
        local_rtp: SocketAddr,
        local_rtcp: SocketAddr,
        remote_rtp: SocketAddr,
        remote_rtcp: SocketAddr,
    ) -> Self {
        Self {
            flow_id,
            local_rtp,
            local_rtcp,
            remote_rtp,
            remote_rtcp,
            next_sn: 0,
            next_rtx_sn: 0,
            path_info: PathInfo::new(flow_id),
        }
    }

    /// Allocate the next flow-specific sequence number (FSSN), per-flow
    /// sequential and independently wrapping modulo 2^16.
    pub fn next_fssn(&mut self) -> u16 {
        let fssn = self.next_sn;
        self.next_sn = self.next_sn.wrapping_add(1);
        fssn
    }

    pub fn next_rtx_fssn(&mut self) -> u16 {
        let fssn = self.next_rtx_sn;
        self.next_rtx_sn = self.next_rtx_sn.wrapping_add(1);
        fssn
    }

    pub fn subflow_header(&mut self) -> MprtpSubflowHeader {
        MprtpSubflowHeader {
            flow_id: self.flow_id,
            fssn: self.next_fssn(),
        }
    }

    pub fn rtx_subflow_header(&mut self) -> MprtpSubflowHeader {
        MprtpSubflowHeader {
            flow_id: self.flow_id,
            fssn: self.next_rtx_fssn(),
        }
    }
}

/// All subflows of one MPRTP session.
#[derive(Debug, Default)]
pub struct MpRtpFlowTable {
    flows: Vec<MpRtpFlow>,
}

impl MpRtpFlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, flow: MpRtpFlow) {
        self.flows.push(flow);
    }

    pub fn get(&self, flow_id: u16) -> Option<&MpRtpFlow> {
        self.flows.iter().find(|f| f.flow_id == flow_id)
    }

    pub fn get_mut(&mut self, flow_id: u16) -> Option<&mut MpRtpFlow> {
        self.flows.iter_mut().find(|f| f.flow_id == flow_id)
    }

    pub fn update_path_info(&mut self, path_info: PathInfo) {
        if let Some(flow) = self.get_mut(path_info.flow_id) {
            flow.path_info = path_info;
        }
    }

    /// Minimum observed RTT across flows, used by retransmission-scheduling
    /// policies. Flows with no measurement yet carry the sentinel 100s RTT.
    pub fn find_subflow_with_smallest_rtt(&self) -> Option<u16> {
        self.flows
            .iter()
            .min_by(|a, b| {
                a.path_info
                    .rtt_seconds
                    .partial_cmp(&b.path_info.rtt_seconds)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|f| f.flow_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MpRtpFlow> {
        self.flows.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn fssn_increments_independently_per_flow() {
        let mut table = MpRtpFlowTable::new();
        table.insert(MpRtpFlow::new(0, addr(5000), addr(5001), addr(6000), addr(6001)));
        table.insert(MpRtpFlow::new(1, addr(5002), addr(5003), addr(6002), addr(6003)));

        let mut fssns = Vec::new();
        for flow_id in [0u16, 1, 0, 1] {
            fssns.push(table.get_mut(flow_id).unwrap().subflow_header().fssn);
        }
        assert_eq!(fssns, vec![0, 0, 1, 1]);
    }

    #[test]
    fn smallest_rtt_prefers_measured_flows() {
        let mut table = MpRtpFlowTable::new();
        table.insert(MpRtpFlow::new(0, addr(5000), addr(5001), addr(6000), addr(6001)));
        table.insert(MpRtpFlow::new(1, addr(5002), addr(5003), addr(6002), addr(6003)));

        table.update_path_info(PathInfo {
            flow_id: 1,
            rtt_seconds: 0.02,
            cumulative_lost: 0,
            one_way_delay_seconds: 0.0,
        });

        assert_eq!(table.find_subflow_with_smallest_rtt(), Some(1));
    }
}
