// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The interface between the receiver and the application.

use crate::buffer::{AuBuffer, BufferRelease};
use crate::codec::h264::SyncType;
use crate::hex::LimitedHex;
use crate::macroblock::MacroblockStatusGrid;
use crate::Timestamp;

/// Receives access units and supplies the memory they're written into.
///
/// All methods are called from the receiving task, one at a time.
pub trait Consumer {
    /// Supplies an empty buffer of at least `min_size` bytes, or `None` if
    /// none is available. In the latter case the access unit is skipped.
    ///
    /// A buffer smaller than `min_size` is handed back through
    /// [`Consumer::release_buffer`] with [`BufferRelease::Unused`].
    fn request_buffer(&mut self, min_size: usize) -> Option<AuBuffer>;

    /// Returns a buffer which won't be delivered through
    /// [`Consumer::au_ready`].
    fn release_buffer(&mut self, buffer: AuBuffer, reason: BufferRelease) {
        let _ = (buffer, reason);
    }

    /// Delivers a finished access unit. The buffer inside it now belongs to
    /// the consumer.
    ///
    /// Returning [`ConsumerError::ResyncRequired`] makes the receiver drop
    /// everything until the next synchronization point, for example after the
    /// application's decoder failed.
    fn au_ready(&mut self, au: AccessUnit<'_>) -> Result<(), ConsumerError>;

    /// Called when the active SPS or PPS changes, before the next access
    /// unit is delivered. Each NAL unit is given without start code or length
    /// prefix.
    fn parameter_sets(&mut self, sps: &[u8], pps: &[u8]) -> Result<(), ConsumerError> {
        let _ = (sps, pps);
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    /// Discard state and wait for the next synchronization point.
    #[error("consumer requested resynchronization")]
    ResyncRequired,

    /// Logged and otherwise ignored.
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

/// A finished access unit: all NAL units sharing one RTP timestamp, each
/// prefixed by a start code or a 4-byte big-endian length.
pub struct AccessUnit<'a> {
    pub(crate) buffer: AuBuffer,
    pub(crate) timestamp: Timestamp,
    pub(crate) shifted_timestamp: Option<u64>,
    pub(crate) sync_type: SyncType,
    pub(crate) complete: bool,
    pub(crate) missing_packets: u32,
    pub(crate) placeholder: bool,
    pub(crate) metadata: &'a [u8],
    pub(crate) user_data: &'a [u8],
    pub(crate) macroblocks: Option<&'a MacroblockStatusGrid>,
}

impl<'a> AccessUnit<'a> {
    #[inline]
    pub fn data(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    #[inline]
    pub fn buffer(&self) -> &AuBuffer {
        &self.buffer
    }

    /// Takes ownership of the underlying buffer.
    #[inline]
    pub fn into_buffer(self) -> AuBuffer {
        self.buffer
    }

    #[inline]
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// The timestamp in microseconds on the receiver's local clock, if a
    /// clock offset has been supplied.
    #[inline]
    pub fn shifted_timestamp(&self) -> Option<u64> {
        self.shifted_timestamp
    }

    #[inline]
    pub fn sync_type(&self) -> SyncType {
        self.sync_type
    }

    /// True iff every packet of the access unit arrived (or lost slices were
    /// replaced by synthesized ones) and its end was marked.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// RTP packets known to be missing within this access unit.
    #[inline]
    pub fn missing_packets(&self) -> u32 {
        self.missing_packets
    }

    /// True for a generated gray frame standing in for the stream's
    /// beginning.
    #[inline]
    pub fn is_placeholder(&self) -> bool {
        self.placeholder
    }

    /// The RTP header extension of the access unit's first packet.
    #[inline]
    pub fn metadata(&self) -> &'a [u8] {
        self.metadata
    }

    /// Concatenated user-data-unregistered SEI payloads.
    #[inline]
    pub fn user_data(&self) -> &'a [u8] {
        self.user_data
    }

    /// The macroblock status map after this access unit, when parameter sets
    /// are known.
    #[inline]
    pub fn macroblocks(&self) -> Option<&'a MacroblockStatusGrid> {
        self.macroblocks
    }
}

impl std::fmt::Debug for AccessUnit<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessUnit")
            .field("timestamp", &self.timestamp)
            .field("shifted_timestamp", &self.shifted_timestamp)
            .field("sync_type", &self.sync_type)
            .field("complete", &self.complete)
            .field("missing_packets", &self.missing_packets)
            .field("placeholder", &self.placeholder)
            .field("metadata", &LimitedHex::new(self.metadata, 16))
            .field("user_data", &LimitedHex::new(self.user_data, 16))
            .field("data", &LimitedHex::new(self.buffer.as_slice(), 64))
            .finish()
    }
}
