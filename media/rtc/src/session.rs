//! The RTP session (spec §4.1): orchestrates packetization, sending,
//! reception, loss detection, retransmission, feedback and RTCP interval
//! scheduling for one session (single- or multi-path).

use crate::clock::{RtpClock, ntp_now};
use crate::config::{RapidSyncMode, SessionParameters};
use crate::error::{Error, Result};
use crate::feedback::FeedbackManager;
use crate::jitter_buffer::JitterBufferV2;
use crate::loss::{AnyLossDetector, LossDetectorChoice, LossEvent, MultipathLossDetector};
use crate::mprtp::{MpRtpFlow, MpRtpFlowTable};
use crate::network::NetworkInterface;
use crate::rtcp_report_manager::RtcpReportManager;
use crate::scheduler::{CongestionFeedback, Scheduler};
use crate::session_database::SessionDatabase;
use crate::stats::{SessionStatistics, TrafficCounters, build_session_statistics};
use crate::transmission::TransmissionManager;
use crate::{Mtu, opt_min};
use bytes::Bytes;
use rtp::rtcp_types::Compound;
use rtp::{
    DePayloader, ExtendedRtpTimestamp, GenericDePayloader, MprtpSubflowHeader, Payloader, RtpHeader,
    RtpPacket, RtpTimestamp, SequenceNumber, Ssrc, decode_rapid_sync_extension, encode_rapid_sync_extension,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

/// Session lifecycle. Transitions outside `Stopped -> Started -> ShuttingDown
/// -> Stopped` fail with [`Error::InvalidState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtpSessionState {
    Stopped,
    Started,
    ShuttingDown,
}

/// A reassembled media sample ready for the application, produced by
/// [`RtpSession::depacketize`].
#[derive(Debug, Clone)]
pub struct MediaSample {
    pub ssrc: Ssrc,
    pub data: Bytes,
    pub presentation_time: Instant,
    pub rtcp_synchronised: bool,
}

/// Event produced by [`RtpSession::poll`].
#[derive(Debug)]
pub enum Event {
    SendRtp { packet: RtpPacket, flow_id: Option<u16> },
    SendRtcp(Vec<u8>),
    Deliver(MediaSample),
}

/// Per-SSRC receive-side state: jitter buffer, reassembly and the RTP clock
/// anchoring its timestamp space to wall-clock time.
struct InboundStream {
    clock: RtpClock,
    jitter: JitterBufferV2,
    depayloader: GenericDePayloader,
}

pub struct RtpSession {
    state: RtpSessionState,
    params: SessionParameters,
    loss_choice: LossDetectorChoice,

    db: SessionDatabase,
    inbound: HashMap<Ssrc, InboundStream>,
    tx: TransmissionManager,
    loss: MultipathLossDetector<AnyLossDetector>,
    feedback: FeedbackManager,
    mprtp: MpRtpFlowTable,
    scheduler: Box<dyn Scheduler>,
    rtcp_managers: Vec<RtcpReportManager>,
    network: Vec<Box<dyn NetworkInterface>>,

    traffic: TrafficCounters,
    next_sn: u16,
    next_rtx_sn: u16,
    /// Timestamp base set via `override_ts`, used as `packetize`'s fallback
    /// when a caller passes `rtp_ts: None` instead of computing one itself.
    ts_base: Option<u32>,
    warned_packetize_while_stopped: bool,

    /// Count of BYE *packets* seen (not sources within them — this crate's
    /// rtcp-types fork doesn't expose per-source iteration on a parsed BYE).
    bye_received_count: usize,
    bye_sent_count: usize,
    stats: Option<SessionStatistics>,
}

const SINGLE_PATH_FLOW: u16 = 0;

impl RtpSession {
    pub fn new(params: SessionParameters, scheduler: Box<dyn Scheduler>, loss_choice: LossDetectorChoice) -> Self {
        let tx_mode = params
            .rtx
            .map(|rtx| crate::transmission::TxBufferManagementMode::NackTimed { rtx_time: rtx.rtx_time })
            .unwrap_or(crate::transmission::TxBufferManagementMode::Circular { capacity: 512 });
        let rtx_pt = params.rtx.map(|rtx| rtx.payload_type).unwrap_or(params.payload_type);

        Self {
            state: RtpSessionState::Stopped,
            loss_choice,
            db: SessionDatabase::new(),
            inbound: HashMap::new(),
            tx: TransmissionManager::new(tx_mode, rtx_pt),
            loss: MultipathLossDetector::new(move || loss_choice.build()),
            feedback: FeedbackManager::new(crate::rtcp_report_manager::DEFAULT_T_RR_INTERVAL),
            mprtp: MpRtpFlowTable::new(),
            scheduler,
            rtcp_managers: Vec::new(),
            network: Vec::new(),
            traffic: TrafficCounters::default(),
            next_sn: rand::random(),
            next_rtx_sn: rand::random(),
            ts_base: None,
            warned_packetize_while_stopped: false,
            bye_received_count: 0,
            bye_sent_count: 0,
            stats: None,
            params,
        }
    }

    pub fn state(&self) -> RtpSessionState {
        self.state
    }

    /// Sets the starting sequence number `packetize` allocates from. Startup
    /// only (spec §3's `RtpSessionState::override_*`) — this is how a caller
    /// drives a deterministic SN_base such as spec §8's scenario 1.
    pub fn override_sn(&mut self, sn: u16) -> Result<()> {
        if self.state != RtpSessionState::Stopped {
            return Err(Error::invalid_state("override_sn", "not Stopped"));
        }
        self.next_sn = sn;
        Ok(())
    }

    /// Sets the starting sequence number used for RFC 4588 retransmissions.
    /// Startup only, same as `override_sn`.
    pub fn override_rtx_sn(&mut self, sn: u16) -> Result<()> {
        if self.state != RtpSessionState::Stopped {
            return Err(Error::invalid_state("override_rtx_sn", "not Stopped"));
        }
        self.next_rtx_sn = sn;
        Ok(())
    }

    /// Sets the timestamp `packetize` falls back to when called with
    /// `rtp_ts: None`. Startup only, same as `override_sn`.
    pub fn override_ts(&mut self, ts: u32) -> Result<()> {
        if self.state != RtpSessionState::Stopped {
            return Err(Error::invalid_state("override_ts", "not Stopped"));
        }
        self.ts_base = Some(ts);
        Ok(())
    }

    /// Build the packetizer/session database/network interfaces/RTCP report
    /// managers and begin reading. One `NetworkInterface` per RTCP report
    /// manager — one for the single-path case, one per MPRTP subflow.
    pub fn start(&mut self, network: Vec<Box<dyn NetworkInterface>>, now: Instant) -> Result<()> {
        if self.state != RtpSessionState::Stopped {
            return Err(Error::invalid_state("start", "not Stopped"));
        }
        if network.is_empty() {
            return Err(Error::config("start requires at least one network interface"));
        }

        self.rtcp_managers = network
            .iter()
            .map(|_| RtcpReportManager::new(self.params.ssrc, Mtu::default(), self.params.rtcp_rsize, now))
            .collect();
        self.network = network;

        self.mprtp = MpRtpFlowTable::new();
        for iface in &self.params.mprtp_interfaces {
            self.mprtp.insert(MpRtpFlow::new(
                iface.flow_id,
                iface.local_rtp,
                iface.local_rtcp,
                iface.remote_rtp,
                iface.remote_rtcp,
            ));
        }

        self.state = RtpSessionState::Started;
        Ok(())
    }

    /// Schedules a final RTCP (including BYE) from each report manager.
    /// Network interfaces are shut down only once [`Self::bye_sent_count`]
    /// equals the number of report managers.
    pub fn stop(&mut self, now: Instant) -> Result<()> {
        if self.state != RtpSessionState::Started {
            return Err(Error::invalid_state("stop", "not Started"));
        }
        for mgr in &mut self.rtcp_managers {
            mgr.schedule_bye(now);
        }
        self.state = RtpSessionState::ShuttingDown;
        Ok(())
    }

    pub fn bye_sent_count(&self) -> usize {
        self.bye_sent_count
    }

    pub fn bye_received_count(&self) -> usize {
        self.bye_received_count
    }

    /// Teardown statistics, available once the session has fully stopped.
    pub fn statistics(&self) -> Option<&SessionStatistics> {
        self.stats.as_ref()
    }

    /// Split `sample` into RTP packets, stamping SN/TS/SSRC/PT and optionally
    /// a rapid-sync (RFC 6051) header per the configured [`RapidSyncMode`].
    /// Packetization while not `Started` is silently dropped with a one-shot
    /// warning (spec §4.1 failure semantics).
    pub fn packetize(
        &mut self,
        sample: Bytes,
        rtp_ts: Option<RtpTimestamp>,
        mtu: Mtu,
        payloader: &mut dyn Payloader,
        now: Instant,
    ) -> Vec<RtpPacket> {
        if self.state != RtpSessionState::Started {
            if !self.warned_packetize_while_stopped {
                log::warn!("packetize called while session is not Started; dropping sample");
                self.warned_packetize_while_stopped = true;
            }
            return Vec::new();
        }

        let ts = rtp_ts
            .or_else(|| self.ts_base.map(RtpTimestamp))
            .unwrap_or_else(|| RtpTimestamp(now.elapsed().as_nanos() as u32));
        let payloads: Vec<Bytes> = payloader.payload(mtu.for_rtp_payload(), sample).collect();
        let last_index = payloads.len().saturating_sub(1);

        let mut packets = Vec::with_capacity(payloads.len());
        for (i, payload) in payloads.into_iter().enumerate() {
            let sn = SequenceNumber(self.next_sn);
            self.next_sn = self.next_sn.wrapping_add(1);

            let mut header = RtpHeader::new(self.params.payload_type, sn, ts, self.params.ssrc);
            header.marker = i == last_index;

            let mut packet = RtpPacket::new(header, payload);

            let insert_rapid_sync = match self.params.rapid_sync {
                RapidSyncMode::None => false,
                RapidSyncMode::EverySample => i == 0,
                RapidSyncMode::EveryRtpPacket => true,
            };
            if insert_rapid_sync {
                if let Some(id) = self.params.extension_ids.rapid_sync {
                    let ntp64 = ntp_now(now).to_fixed_u64();
                    if let Some((_profile, data)) = encode_rapid_sync_extension(id, ntp64) {
                        packet.extensions.push((id, Bytes::from(data)));
                    }
                }
            }

            packets.push(packet);
        }

        packets
    }

    /// Insert/update the MPRTP subflow extension if this is a multi-path
    /// session, store the packet for possible retransmission, and hand it to
    /// the scheduler to pace onto the network (spec §2: "Scheduler paces
    /// packets onto NetworkInterface(s)"). The actual write happens when
    /// `poll` drains `Scheduler::poll_outgoing`.
    pub fn send_rtp_packet(&mut self, mut packet: RtpPacket, flow_id: Option<u16>, now: Instant) -> Result<()> {
        if self.state != RtpSessionState::Started {
            return Err(Error::invalid_state("send_rtp_packet", "not Started"));
        }

        if self.params.is_mprtp() {
            let flow_id = flow_id.unwrap_or(SINGLE_PATH_FLOW);
            if let Some(flow) = self.mprtp.get_mut(flow_id) {
                let subflow = flow.subflow_header();
                packet.flow_id = Some(flow_id);
                packet.mprtp_subflow_header = Some(subflow);
                if let Some(id) = self.params.extension_ids.mprtp {
                    let (_profile, data) = rtp::encode_mprtp_extension(id, subflow);
                    packet.extensions.push((id, Bytes::from(data)));
                }
            }
        }

        self.traffic.on_packet_sent(packet.payload.len());
        self.tx.store(packet.clone(), now);
        self.scheduler.schedule_rtp_packets(vec![packet]);
        Ok(())
    }

    /// Write `packet` to the network interface for its flow (`None`/unbound
    /// selects interface 0, the single-path case). Used by `poll` to drain
    /// packets the scheduler has released.
    fn write_to_network(&mut self, packet: &RtpPacket, flow_id: Option<u16>) -> Result<()> {
        let interface_index = flow_id.unwrap_or(0) as usize;
        let iface = self
            .network
            .get_mut(interface_index.min(self.network.len().saturating_sub(1)))
            .ok_or_else(|| Error::Network { flow_id, reason: "no network interface".into() })?;
        iface.send_rtp(&packet.to_vec(None))
    }

    /// Remote RTP address for `flow_id` (`None` selects interface 0), used to
    /// hand the scheduler and congestion-control hooks a `SocketAddr` even
    /// though this session's `NetworkInterface`s are addressed implicitly.
    fn remote_addr_for_flow(&self, flow_id: Option<u16>) -> SocketAddr {
        let interface_index = flow_id.unwrap_or(0) as usize;
        self.network
            .get(interface_index.min(self.network.len().saturating_sub(1)))
            .map(|iface| iface.remote_rtp_addr())
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)))
    }

    /// Feed an out-of-band congestion-control report (SCREAM/NADA/GOOG-REMB)
    /// from `remote` into the scheduler.
    pub fn process_feedback(&mut self, feedback: &CongestionFeedback, remote: SocketAddr) {
        self.scheduler.process_feedback(feedback, remote);
    }

    /// Reconstructs the original packet and PT from an RFC 4588 RTX packet.
    /// `rtx_packet` must carry `payload_type == rtx.payload_type`.
    pub fn unwrap_rtx(&mut self, rtx_packet: &RtpPacket) -> Result<RtpPacket> {
        let original_pt = self.params.payload_type;
        self.tx
            .process_retransmission(rtx_packet, original_pt)
            .map_err(|_| Error::Protocol {
                reason: "malformed RTX payload",
                ssrc: Some(rtx_packet.header.ssrc),
                sn: Some(rtx_packet.header.sequence_number),
            })
    }

    /// Dispatches extension headers (MPRTP, rapid-sync, RTCP-in-RTP), records
    /// the packet in the session database and loss detector, and feeds the
    /// jitter buffer. Returns any samples the playout buffer released as a
    /// side effect of the insertion becoming the new front (normally none —
    /// playout is driven by [`Self::poll`]).
    pub fn on_incoming_rtp(&mut self, mut packet: RtpPacket, now: Instant) {
        let is_rtx = self.params.rtx.is_some_and(|rtx| rtx.payload_type == packet.header.payload_type);
        if is_rtx {
            match self.unwrap_rtx(&packet) {
                Ok(original) => packet = original,
                Err(err) => {
                    log::warn!("dropping unparsable RTX packet: {err}");
                    return;
                }
            }
        }

        let mut rapid_sync_seen = false;
        let extensions = std::mem::take(&mut packet.extensions);
        for (id, data) in &extensions {
            if Some(*id) == self.params.extension_ids.mprtp {
                if let Some(subflow) = MprtpSubflowHeader::decode(data) {
                    packet.flow_id = Some(subflow.flow_id);
                    packet.mprtp_subflow_header = Some(subflow);
                }
            } else if Some(*id) == self.params.extension_ids.rapid_sync {
                if let Some(sender_ntp) = decode_rapid_sync_extension(data) {
                    let arrival_ntp = ntp_now(now).to_fixed_u64();
                    packet.arrival_ntp = arrival_ntp;
                    let owd = (arrival_ntp as i128 - sender_ntp as i128).max(0) as f64 / f64::from(1u32 << 32);
                    packet.owd_seconds = owd;
                    rapid_sync_seen = true;
                }
            } else if Some(*id) == self.params.extension_ids.rtcp_in_rtp {
                let remote = self.remote_addr_for_flow(packet.flow_id);
                self.receive_rtcp(now, data, remote);
            }
        }
        packet.extensions = extensions;

        let ssrc = packet.header.ssrc;
        let sn = packet.header.sequence_number;
        self.traffic.on_packet_received(packet.payload.len());

        let accepted = self.db.on_packet_arrival(ssrc, sn, now, packet.header.timestamp, self.params.clock_rate);
        if !accepted {
            return;
        }

        let flow_id = packet.flow_id.unwrap_or(SINGLE_PATH_FLOW);
        for (_, event) in self.loss.on_packet_arrival(now, flow_id, sn) {
            match event {
                LossEvent::Lost(lost_sn) => {
                    self.tx.record_lost(lost_sn);
                    self.feedback.report_lost(packet.flow_id, lost_sn.0);
                }
                LossEvent::FalsePositive(recovered_sn) => {
                    self.tx.record_false_positive(recovered_sn);
                }
            }
        }
        self.feedback.report_received(sn.0);
        self.tx.record_received(sn);

        if is_rtx {
            self.loss.on_rtx_packet_arrival(now, flow_id, sn);
        }

        let stream = self.inbound.entry(ssrc).or_insert_with(|| InboundStream {
            clock: RtpClock::new(self.params.clock_rate),
            jitter: JitterBufferV2::new(std::time::Duration::from_millis(150), self.params.clock_rate),
            depayloader: GenericDePayloader::new(),
        });

        let extended = stream.clock.extend(now, packet.header.timestamp);
        let presentation_time = presentation_time_for(&stream.clock, extended, now);

        let rtcp_synchronised = rapid_sync_seen || self.db.member(ssrc).is_some_and(|m| m.last_sr().is_some());

        let remote = self.remote_addr_for_flow(packet.flow_id);
        self.scheduler
            .on_incoming_rtp(&packet, remote, true, rtcp_synchronised, presentation_time);

        let stream = self.inbound.get_mut(&ssrc).expect("just inserted above");
        stream.jitter.add_packet(packet, presentation_time, rtcp_synchronised, now);
    }

    /// Drain any playout groups whose time has come and reassemble them.
    fn depacketize_ready_groups(&mut self, now: Instant) -> Vec<MediaSample> {
        let mut samples = Vec::new();
        for (&ssrc, stream) in self.inbound.iter_mut() {
            while let Some(group) = stream.jitter.next_playout_group(now) {
                for packet in group.into_packets() {
                    stream.depayloader.push_fragment(&packet.payload);
                }
                samples.push(MediaSample {
                    ssrc,
                    data: stream.depayloader.finish(),
                    presentation_time: group.playout_time,
                    rtcp_synchronised: group.rtcp_synchronised,
                });
            }
        }
        samples
    }

    /// RFC 4585 early-feedback fast path: schedules an out-of-cycle compound
    /// if `T_rr_interval` has elapsed since the last one.
    pub fn try_schedule_early_feedback(&mut self, now: Instant) -> Option<(Instant, u64)> {
        self.feedback.try_schedule_early_feedback(now)
    }

    /// Handle one compound RTCP, updating report/member state and BYE
    /// accounting, and — the spec §4.4 `nack(sns)` path — synthesizing and
    /// scheduling RFC 4588 retransmissions for an incoming generic-NACK.
    /// Drives a `stop()` if every expected BYE (or, under `exit_on_bye`, the
    /// first one) has now been seen. Takes the raw compound bytes (rather
    /// than a pre-parsed `Compound`) so they can also reach
    /// `Scheduler::on_incoming_rtcp` unchanged.
    pub fn receive_rtcp(&mut self, now: Instant, data: &[u8], remote: SocketAddr) {
        use rtp::rtcp_types::{Fir, Packet as RtcpPacket, Pli};

        self.scheduler.on_incoming_rtcp(data, remote);

        let compound = match Compound::parse(data) {
            Ok(compound) => compound,
            Err(e) => {
                log::warn!("failed to parse RTCP compound, {e}");
                return;
            }
        };

        for packet in compound {
            let packet = match packet {
                Ok(packet) => packet,
                Err(e) => {
                    log::warn!("failed to parse RTCP packet in compound, {e}");
                    return;
                }
            };

            match packet {
                RtcpPacket::Sr(sr) => {
                    if let Some(member) = self.db.member_mut(Ssrc(sr.ssrc())) {
                        member.record_sender_report(
                            rtp::NtpTimestamp::from_fixed_u64(sr.ntp_timestamp()),
                            now,
                        );
                    }
                }
                RtcpPacket::Rr(_rr) => {
                    // TODO: feed report blocks into per-flow RTT once
                    // something downstream of MultipathLossDetector wants it.
                }
                RtcpPacket::Sdes(_sdes) => {}
                RtcpPacket::Bye(_bye) => {
                    self.bye_received_count += 1;
                    let should_stop =
                        self.params.exit_on_bye || self.bye_received_count >= self.db_member_count();
                    if should_stop && self.state == RtpSessionState::Started {
                        let _ = self.stop(now);
                    }
                }
                RtcpPacket::TransportFeedback(transport_feedback) => {
                    match transport_feedback.parse_fci::<rtp::rtcp_types::Nack>() {
                        Ok(nack) => self.handle_incoming_nack(nack.rtp_sequence_numbers()),
                        Err(_) => {
                            log::warn!("received unparsable transport-layer RTCP feedback packet");
                        }
                    }
                }
                RtcpPacket::PayloadFeedback(payload_feedback) => {
                    if payload_feedback.parse_fci::<Pli>().is_ok() {
                        log::debug!("received PLI for ssrc={}", payload_feedback.media_ssrc());
                    } else if let Ok(fir) = payload_feedback.parse_fci::<Fir>() {
                        for entry in fir.entries() {
                            log::debug!("received FIR for ssrc={}", entry.ssrc());
                        }
                    } else {
                        log::warn!(
                            "received unknown RTCP payload feedback packet sender_ssrc={} media_ssrc={}",
                            payload_feedback.sender_ssrc(),
                            payload_feedback.media_ssrc(),
                        );
                    }
                }
                RtcpPacket::App(_app) => {}
                RtcpPacket::Xr(_xr) => {}
                RtcpPacket::Unknown(..) => {}
            }
        }
    }

    /// RFC 4588 RTX synthesis for each still-held SN in an incoming
    /// generic-NACK (spec §1 item 3, §4.4): `TransmissionManager::nack`
    /// records the hit, `generate_retransmission_packet` wraps it if one
    /// isn't already outstanding, and the scheduler paces it out.
    fn handle_incoming_nack(&mut self, sns: impl Iterator<Item = u16>) {
        let sns: Vec<SequenceNumber> = sns.map(SequenceNumber).collect();
        self.tx.nack(&sns);

        for sn in sns {
            let new_sn = SequenceNumber(self.next_rtx_sn);
            self.next_rtx_sn = self.next_rtx_sn.wrapping_add(1);

            let subflow = self
                .tx
                .entry(sn)
                .and_then(|entry| entry.flow_id)
                .and_then(|flow_id| self.mprtp.get_mut(flow_id).map(|flow| flow.rtx_subflow_header()));

            if let Some(rtx_packet) = self.tx.generate_retransmission_packet(sn, new_sn, subflow) {
                self.scheduler.schedule_rtx_packet(rtx_packet);
            }
        }
    }

    fn db_member_count(&self) -> usize {
        self.db.ssrcs().count().max(1)
    }

    /// Drains due RTCP compounds, outgoing RTP from the scheduler and ready
    /// playout groups, in that priority order — mirroring the teacher's
    /// report-then-send-then-receive poll shape.
    pub fn poll(&mut self, now: Instant) -> Option<Event> {
        let congestion = self.scheduler.retrieve_feedback();
        let report = self.feedback.on_feedback_generation(&self.tx, congestion);
        for nack in &report.nacks {
            self.feedback.note_feedback_sent(now);
            let mut nack_builder = rtp::rtcp_types::NackBuilder::default();
            for sn in &nack.sns {
                nack_builder = nack_builder.add_rtp_sequence(*sn);
            }
            if let Some(mgr) = self.rtcp_managers.first_mut() {
                mgr.queue_mut().add_generic_nack(nack_builder);
            }
        }
        self.traffic.on_nack_sent(report.nacks.iter().map(|n| n.sns.len() as u64).sum());
        for congestion in report.congestion {
            if let Some(mgr) = self.rtcp_managers.first_mut() {
                mgr.queue_mut().add_congestion_feedback(congestion.0);
            }
        }

        let mut rng = rand::rng();
        for mgr in &mut self.rtcp_managers {
            if let Some(bytes) = mgr.poll(now, &mut rng) {
                return Some(Event::SendRtcp(bytes));
            }
        }

        if let Some(packet) = self.scheduler.poll_outgoing(now) {
            let flow_id = packet.flow_id;
            if let Err(err) = self.write_to_network(&packet, flow_id) {
                log::warn!("failed to send RTP packet on flow {flow_id:?}: {err}");
            }
            return Some(Event::SendRtp { packet, flow_id });
        }

        if let Some(sample) = self.depacketize_ready_groups(now).into_iter().next() {
            return Some(Event::Deliver(sample));
        }

        if self.state == RtpSessionState::ShuttingDown {
            let all_byes_sent = self.rtcp_managers.iter().all(RtcpReportManager::bye_sent);
            if all_byes_sent {
                self.bye_sent_count = self.rtcp_managers.len();
                self.stats = Some(build_session_statistics(&self.traffic, &self.tx, &self.db));
                self.state = RtpSessionState::Stopped;
                self.scheduler.shutdown();
            }
        }

        None
    }

    /// Next wakeup instant across all RTCP report managers.
    pub fn timeout(&self, now: Instant) -> Option<std::time::Duration> {
        let mut timeout = None;
        for mgr in &self.rtcp_managers {
            let deadline = mgr.next_deadline(now);
            timeout = opt_min(timeout, Some(deadline.saturating_duration_since(now)));
        }
        timeout
    }
}

fn presentation_time_for(clock: &RtpClock, extended: ExtendedRtpTimestamp, now: Instant) -> Instant {
    clock.rtp_timestamp_to_instant(extended).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::LoopbackInterface;
    use crate::scheduler::BaseScheduler;
    use rtp::GenericPayloader;

    fn params() -> SessionParameters {
        SessionParameters {
            ssrc: Ssrc(1),
            ..SessionParameters::default()
        }
    }

    #[test]
    fn packetize_before_start_is_dropped_silently() {
        let mut session = RtpSession::new(params(), Box::new(BaseScheduler::new()), LossDetectorChoice::Simple);
        let mut payloader = GenericPayloader;
        let packets = session.packetize(
            Bytes::from_static(b"hello"),
            None,
            Mtu::default(),
            &mut payloader,
            Instant::now(),
        );
        assert!(packets.is_empty());
    }

    #[test]
    fn start_requires_stopped_state() {
        let mut session = RtpSession::new(params(), Box::new(BaseScheduler::new()), LossDetectorChoice::Simple);
        let now = Instant::now();
        session.start(vec![Box::new(LoopbackInterface::default())], now).unwrap();
        assert!(session.start(vec![Box::new(LoopbackInterface::default())], now).is_err());
    }

    #[test]
    fn packetize_after_start_shares_one_timestamp_per_sample() {
        let mut session = RtpSession::new(params(), Box::new(BaseScheduler::new()), LossDetectorChoice::Simple);
        let now = Instant::now();
        session.start(vec![Box::new(LoopbackInterface::default())], now).unwrap();

        let mut payloader = GenericPayloader;
        let packets = session.packetize(
            Bytes::from(vec![0u8; 3000]),
            Some(RtpTimestamp(1234)),
            Mtu::new(1400),
            &mut payloader,
            now,
        );

        assert!(packets.len() > 1);
        assert!(packets.iter().all(|p| p.header.timestamp == RtpTimestamp(1234)));
        assert!(packets.last().unwrap().header.marker);
        assert!(!packets[0].header.marker || packets.len() == 1);
    }

    #[test]
    fn stop_requires_started_state() {
        let mut session = RtpSession::new(params(), Box::new(BaseScheduler::new()), LossDetectorChoice::Simple);
        assert!(session.stop(Instant::now()).is_err());
    }

    #[test]
    fn bye_with_exit_on_bye_drives_shutdown() {
        let mut p = params();
        p.exit_on_bye = true;
        let mut session = RtpSession::new(p, Box::new(BaseScheduler::new()), LossDetectorChoice::Simple);
        let now = Instant::now();
        session.start(vec![Box::new(LoopbackInterface::default())], now).unwrap();

        use rtp::rtcp_types::{CompoundBuilder, RtcpPacketWriter};
        let compound_builder = CompoundBuilder::default().add_packet(rtp::rtcp_types::Bye::builder().add_source(42));
        let mut buf = vec![0u8; compound_builder.calculate_size().unwrap()];
        let len = compound_builder.write_into_unchecked(&mut buf);
        buf.truncate(len);

        let remote = SocketAddr::from(([127, 0, 0, 1], 5000));
        session.receive_rtcp(now, &buf, remote);
        assert_eq!(session.state(), RtpSessionState::ShuttingDown);
        assert_eq!(session.bye_received_count(), 1);
    }

    #[test]
    fn override_sn_and_ts_drive_the_basic_send_path_scenario() {
        // spec §8 scenario 1: SSRC=0x12345678, SN_base=1000, TS_base=0,
        // clock=90000, one 3000-byte sample, MTU=1400 -> 3 packets, SN
        // 1000/1001/1002, same TS, marker only on the last.
        let mut p = params();
        p.ssrc = Ssrc(0x12345678);
        p.clock_rate = 90_000;
        let mut session = RtpSession::new(p, Box::new(BaseScheduler::new()), LossDetectorChoice::Simple);

        session.override_sn(1000).unwrap();
        session.override_ts(0).unwrap();

        let now = Instant::now();
        session.start(vec![Box::new(LoopbackInterface::default())], now).unwrap();

        let mut payloader = GenericPayloader;
        let packets = session.packetize(Bytes::from(vec![0u8; 3000]), None, Mtu::new(1400), &mut payloader, now);

        assert_eq!(packets.len(), 3);
        let sns: Vec<u16> = packets.iter().map(|p| p.header.sequence_number.0).collect();
        assert_eq!(sns, vec![1000, 1001, 1002]);
        assert!(packets.iter().all(|p| p.header.timestamp == RtpTimestamp(0)));
        assert!(packets.iter().all(|p| p.header.ssrc == Ssrc(0x12345678)));
        assert!(!packets[0].header.marker && !packets[1].header.marker);
        assert!(packets[2].header.marker);
    }

    #[test]
    fn override_sn_fails_once_started() {
        let mut session = RtpSession::new(params(), Box::new(BaseScheduler::new()), LossDetectorChoice::Simple);
        let now = Instant::now();
        session.start(vec![Box::new(LoopbackInterface::default())], now).unwrap();
        assert!(session.override_sn(42).is_err());
        assert!(session.override_ts(0).is_err());
    }

    #[test]
    fn send_rtp_packet_stamps_mprtp_subflow_header() {
        use crate::config::MprtpInterface;

        let mut p = params();
        p.extension_ids.mprtp = Some(5);
        p.mprtp_interfaces = vec![MprtpInterface {
            flow_id: 0,
            local_rtp: SocketAddr::from(([127, 0, 0, 1], 5000)),
            local_rtcp: SocketAddr::from(([127, 0, 0, 1], 5001)),
            remote_rtp: SocketAddr::from(([127, 0, 0, 1], 6000)),
            remote_rtcp: SocketAddr::from(([127, 0, 0, 1], 6001)),
            bind: Vec::new(),
        }];
        let mut session = RtpSession::new(p, Box::new(BaseScheduler::new()), LossDetectorChoice::Simple);
        let now = Instant::now();
        session.start(vec![Box::new(LoopbackInterface::default())], now).unwrap();

        let mut payloader = GenericPayloader;
        let packets = session.packetize(Bytes::from_static(b"x"), Some(RtpTimestamp(0)), Mtu::default(), &mut payloader, now);
        let packet = packets.into_iter().next().unwrap();
        session.send_rtp_packet(packet, Some(0), now).unwrap();

        let sent = session.poll(now);
        match sent {
            Some(Event::SendRtp { packet, .. }) => {
                assert_eq!(packet.mprtp_subflow_header.map(|h| h.flow_id), Some(0));
            }
            other => panic!("expected Event::SendRtp, got {other:?}"),
        }
    }

    #[test]
    fn incoming_generic_nack_schedules_a_retransmission() {
        let mut session = RtpSession::new(params(), Box::new(BaseScheduler::new()), LossDetectorChoice::Simple);
        let now = Instant::now();
        session.start(vec![Box::new(LoopbackInterface::default())], now).unwrap();

        let mut payloader = GenericPayloader;
        let packets = session.packetize(Bytes::from_static(b"x"), Some(RtpTimestamp(0)), Mtu::default(), &mut payloader, now);
        let sent_sn = packets[0].header.sequence_number.0;
        session.send_rtp_packet(packets.into_iter().next().unwrap(), None, now).unwrap();
        // drain the scheduled original packet before the NACK arrives
        session.poll(now);

        use rtp::rtcp_types::{CompoundBuilder, NackBuilder, ReceiverReport, RtcpPacketWriter, TransportFeedback};
        let nack = TransportFeedback::builder_owned(NackBuilder::default().add_rtp_sequence(sent_sn))
            .sender_ssrc(0xAAAA)
            .media_ssrc(1);
        let compound_builder = CompoundBuilder::default()
            .add_packet(ReceiverReport::builder(0xAAAA))
            .add_packet(nack);
        let mut buf = vec![0u8; compound_builder.calculate_size().unwrap()];
        let len = compound_builder.write_into_unchecked(&mut buf);
        buf.truncate(len);

        session.receive_rtcp(now, &buf, SocketAddr::from(([127, 0, 0, 1], 5000)));

        let rtx = session.poll(now);
        match rtx {
            Some(Event::SendRtp { packet, .. }) => {
                assert_ne!(packet.header.sequence_number.0, sent_sn);
            }
            other => panic!("expected a scheduled retransmission, got {other:?}"),
        }
    }
}
