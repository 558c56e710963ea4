//! Error taxonomy (see spec §7).

use rtp::{SequenceNumber, Ssrc};

pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds produced by the core. Each variant carries the minimal
/// context needed to log or report it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {reason}")]
    Config { reason: &'static str },

    #[error("invalid state: {attempted} while in {current}")]
    InvalidState {
        attempted: &'static str,
        current: &'static str,
    },

    #[error("network error on flow {flow_id:?}: {reason}")]
    Network {
        flow_id: Option<u16>,
        reason: String,
    },

    #[error("protocol error: {reason} (ssrc={ssrc:?}, sn={sn:?})")]
    Protocol {
        reason: &'static str,
        ssrc: Option<Ssrc>,
        sn: Option<SequenceNumber>,
    },

    #[error("timeout: {reason}")]
    Timeout { reason: &'static str },

    #[error("exhausted: {reason}")]
    Exhausted { reason: &'static str },
}

impl Error {
    pub fn invalid_state(attempted: &'static str, current: &'static str) -> Self {
        Error::InvalidState { attempted, current }
    }

    pub fn config(reason: &'static str) -> Self {
        Error::Config { reason }
    }
}
