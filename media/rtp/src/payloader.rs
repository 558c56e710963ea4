//! Packetization traits and a generic MTU-bounded fragmenting payloader.

use bytes::{Bytes, BytesMut};

/// Splits a single media sample into one or more RTP payloads.
pub trait Payloader {
    /// Split `sample` into RTP payloads no larger than `mtu` bytes each.
    /// Returns the payloads in transmission order.
    fn payload(&mut self, mtu: usize, sample: Bytes) -> Box<dyn Iterator<Item = Bytes>>;
}

/// Reassembles RTP payloads back into media samples.
pub trait DePayloader {
    /// Feed one RTP payload; returns any complete sample(s) it produced.
    fn depayload(&mut self, payload: Bytes) -> Box<dyn Iterator<Item = Bytes>>;
}

/// Payloader with no codec-specific framing: splits the sample on MTU
/// boundaries and relies on the caller to mark the final fragment's RTP
/// packet with the marker bit.
///
/// This is the fallback used when no codec-specific payloader is
/// registered; it matches how a raw/uncompressed or already-framed payload
/// (e.g. Opus, whose packets are already MTU-sized application units) is
/// typically carried.
#[derive(Debug, Default, Clone, Copy)]
pub struct GenericPayloader;

impl Payloader for GenericPayloader {
    fn payload(&mut self, mtu: usize, sample: Bytes) -> Box<dyn Iterator<Item = Bytes>> {
        assert!(mtu > 0, "mtu must be nonzero");

        if sample.is_empty() {
            return Box::new(std::iter::once(sample));
        }

        let mut chunks = Vec::with_capacity(sample.len().div_ceil(mtu));
        let mut remaining = sample;

        while !remaining.is_empty() {
            let take = remaining.len().min(mtu);
            chunks.push(remaining.split_to(take));
        }

        Box::new(chunks.into_iter())
    }
}

/// Reassembles fragments produced by [`GenericPayloader`] by simply
/// concatenating payloads as they arrive; the caller is responsible for
/// calling [`DePayloader::depayload`] only once per marker-terminated group
/// and flushing on marker.
#[derive(Debug, Default)]
pub struct GenericDePayloader {
    pending: BytesMut,
}

impl GenericDePayloader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment; call [`Self::finish`] once the marker bit arrives.
    pub fn push_fragment(&mut self, payload: &[u8]) {
        self.pending.extend_from_slice(payload);
    }

    /// Take the accumulated sample, resetting internal state for the next one.
    pub fn finish(&mut self) -> Bytes {
        self.pending.split().freeze()
    }
}

impl DePayloader for GenericDePayloader {
    fn depayload(&mut self, payload: Bytes) -> Box<dyn Iterator<Item = Bytes>> {
        self.push_fragment(&payload);
        Box::new(std::iter::empty())
    }
}
