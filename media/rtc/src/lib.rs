//! # Real-time RTP/RTCP media transport core
//!
//! This crate implements the session state machine, jitter buffer, loss
//! detection, transmission/feedback management and MPRTP scheduling core of
//! a real-time media stack. Like [`rtp`], it is sans-io: [`RtpSession`] and
//! friends never touch a socket, they only produce and consume [`rtc::Event`]
//! values through `poll(now)`. Hooking the core up to actual sockets, SDP
//! negotiation, RTSP/SIP signaling and concrete codec bitstreams is left to
//! the embedding application; see [`network`] for the interface the core
//! expects of a transport.
//!
//! [`rtc::Event`]: session::Event

mod clock;
pub mod config;
pub mod error;
pub mod feedback;
pub mod jitter_buffer;
pub mod loss;
pub mod mprtp;
mod mtu;
pub mod network;
pub mod rtcp_report_manager;
pub mod scheduler;
pub mod session;
pub mod session_database;
pub mod stats;
pub mod transmission;

pub use error::{Error, Result};
pub use mtu::Mtu;
pub use session::{RtpSession, RtpSessionState};

pub(crate) fn opt_min<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (None, None) => None,
        (None, Some(b)) => Some(b),
        (Some(a), None) => Some(a),
        (Some(a), Some(b)) => Some(std::cmp::min(a, b)),
    }
}
