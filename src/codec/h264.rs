// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [H.264](https://www.itu.int/rec/T-REC-H.264-201906-I/en)-encoded video.

use std::collections::VecDeque;

use bytes::{Buf, Bytes};
use h264_reader::nal::{NalHeader, UnitType};
use log::debug;
use thiserror::Error;

use crate::rtp::Packet;
use crate::Timestamp;

pub(crate) mod params;
pub(crate) mod slice;
pub(crate) mod synth;

pub use params::ParameterSets;

/// How an access unit allows a decoder to start (or restart) decoding.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum SyncType {
    /// Not a sync point; depends on earlier pictures.
    #[default]
    None,

    /// An IDR picture.
    Idr,

    /// A non-IDR picture made only of I (or SI) slices.
    IFrame,

    /// The start of a progressive intra refresh, signalled by a recovery point SEI.
    PirStart,
}

impl SyncType {
    pub fn is_sync(self) -> bool {
        self != SyncType::None
    }
}

/// A NAL unit reassembled from one or more RTP packets.
pub struct Nal {
    hdr: NalHeader,

    /// The payload, excluding the header byte, possibly in several pieces.
    pieces: Vec<Bytes>,

    /// The total length, including the header byte.
    len: u32,
    timestamp: Timestamp,
    shifted_timestamp: Option<u64>,
    first_in_au: bool,
    last_in_au: bool,
    missing_packets_before: u32,
    prev_au_missing_packets: u32,
    complete: bool,
    metadata: Option<Bytes>,
}

impl Nal {
    #[inline]
    pub fn header(&self) -> NalHeader {
        self.hdr
    }

    #[inline]
    pub fn unit_type(&self) -> UnitType {
        self.hdr.nal_unit_type()
    }

    /// Returns the length in bytes, including the header byte.
    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Never true; a NAL unit always has at least its header byte.
    #[inline]
    pub fn is_empty(&self) -> bool {
        false
    }

    #[inline]
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    #[inline]
    pub fn shifted_timestamp(&self) -> Option<u64> {
        self.shifted_timestamp
    }

    /// True if this is the first NAL unit of its access unit, as far as the
    /// depacketizer can tell.
    #[inline]
    pub fn is_first_in_au(&self) -> bool {
        self.first_in_au
    }

    /// True if this NAL unit ended with the RTP marker bit.
    #[inline]
    pub fn is_last_in_au(&self) -> bool {
        self.last_in_au
    }

    /// Number of RTP packets lost between the previous NAL unit and this one.
    #[inline]
    pub fn missing_packets_before(&self) -> u32 {
        self.missing_packets_before
    }

    /// Number of RTP packets lost at the end of the previous access unit,
    /// which closed without its marker. Only the first NAL unit of a new
    /// timestamp carries this; none was left in that access unit to carry it.
    #[inline]
    pub fn prev_au_missing_packets(&self) -> u32 {
        self.prev_au_missing_packets
    }

    /// False if some fragment of this NAL unit was lost; its contents are then
    /// truncated or have holes.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// The RTP header extension of the packet which started this NAL unit.
    #[inline]
    pub fn metadata(&self) -> Option<&Bytes> {
        self.metadata.as_ref()
    }

    /// Calls `f` with each contiguous piece, starting with the header byte.
    pub(crate) fn for_each_piece<F: FnMut(&[u8])>(&self, mut f: F) {
        f(&[u8::from(self.hdr)]);
        for p in &self.pieces {
            f(&p[..]);
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(self.len as usize);
        self.for_each_piece(|p| v.extend_from_slice(p));
        v
    }

    /// Builds a NAL unit directly, bypassing RTP.
    #[cfg(test)]
    pub(crate) fn for_test(data: &[u8], timestamp: i64) -> Self {
        let hdr = NalHeader::new(data[0]).unwrap();
        Nal {
            hdr,
            pieces: vec![Bytes::copy_from_slice(&data[1..])],
            len: data.len() as u32,
            timestamp: Timestamp::new(timestamp, crate::H264_CLOCK_RATE),
            shifted_timestamp: None,
            first_in_au: false,
            last_in_au: false,
            missing_packets_before: 0,
            prev_au_missing_packets: 0,
            complete: true,
            metadata: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn last(mut self) -> Self {
        self.last_in_au = true;
        self
    }

    #[cfg(test)]
    pub(crate) fn missing(mut self, n: u32) -> Self {
        self.missing_packets_before = n;
        self
    }

    #[cfg(test)]
    pub(crate) fn prev_au_missing(mut self, n: u32) -> Self {
        self.prev_au_missing_packets = n;
        self
    }
}

impl std::fmt::Debug for Nal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Nal")
            .field("hdr", &self.hdr)
            .field("len", &self.len)
            .field("timestamp", &self.timestamp)
            .field("first_in_au", &self.first_in_au)
            .field("last_in_au", &self.last_in_au)
            .field("missing_packets_before", &self.missing_packets_before)
            .field("prev_au_missing_packets", &self.prev_au_missing_packets)
            .field("complete", &self.complete)
            .field("data", &crate::hex::LimitedHex::new(&self.to_vec(), 64))
            .finish()
    }
}

/// Why a packet was discarded by the [`Depacketizer`].
///
/// None of these are fatal: the packet is counted, treated as lost, and
/// depacketization continues with the next one.
#[derive(Debug, Error)]
pub enum DepacketizeError {
    #[error("empty payload at seq {seq:04x}")]
    Empty { seq: u16 },

    #[error("NAL header {header:02x} has F bit set at seq {seq:04x}")]
    ForbiddenBit { seq: u16, header: u8 },

    #[error("unsupported RTP payload structure {nal_type} at seq {seq:04x}")]
    Unsupported { seq: u16, nal_type: u8 },

    #[error("malformed STAP-A at seq {seq:04x}: {description}")]
    BadStapA { seq: u16, description: String },

    #[error("malformed FU-A at seq {seq:04x}: {description}")]
    BadFuA { seq: u16, description: String },
}

/// Cumulative counters kept by [`Depacketizer`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DepacketizerCounters {
    /// Packets discarded because they couldn't be parsed.
    pub malformed_packets: u64,

    /// FU-A fragments discarded because their start was lost.
    pub orphan_fragments: u64,

    /// NAL units emitted with missing fragments.
    pub incomplete_nals: u64,
}

/// A fragmented NAL unit in progress.
#[derive(Debug)]
struct Fragment {
    hdr: NalHeader,
    pieces: Vec<Bytes>,
    len: u32,
    timestamp: Timestamp,
    shifted_timestamp: Option<u64>,
    missing_packets_before: u32,
    metadata: Option<Bytes>,
}

/// Reassembles NAL units from RTP packets as specified in
/// [RFC 6184](https://tools.ietf.org/html/rfc6184), in non-interleaved mode.
///
/// Unlike a depacketizer that only deals in whole access units, this one
/// keeps going through loss: every NAL unit it can recover is emitted, tagged
/// with the number of packets lost just before it, and fragments cut short by
/// loss come out marked incomplete. Deciding what to do with damaged data is
/// left to the [`crate::assembler::AuAssembler`].
#[derive(Debug, Default)]
pub struct Depacketizer {
    frag: Option<Fragment>,

    /// Timestamp of the most recent packet.
    last_timestamp: Option<i64>,

    /// Timestamp and last-in-AU flag of the most recently emitted NAL unit.
    prev_nal: Option<(i64, bool)>,

    /// Packets lost since the last emitted NAL unit (or fragment start).
    loss: u32,

    /// Packets lost at the tail of the previous timestamp's access unit, for
    /// the first NAL unit of the current timestamp.
    prev_au_loss: u32,

    pending: VecDeque<Nal>,
    counters: DepacketizerCounters,
}

impl Depacketizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counters(&self) -> DepacketizerCounters {
        self.counters
    }

    /// Returns the next reassembled NAL unit, if any.
    pub fn pull(&mut self) -> Option<Nal> {
        self.pending.pop_front()
    }

    /// Processes one packet. Call [`Depacketizer::pull`] until it returns
    /// `None` afterward.
    pub fn push(&mut self, pkt: Packet) -> Result<(), DepacketizeError> {
        let seq = pkt.sequence_number;
        let ts = pkt.timestamp.timestamp();
        let prev_timestamp = self.last_timestamp.replace(ts);
        let new_timestamp = prev_timestamp != Some(ts);
        if new_timestamp {
            // If the previous timestamp's access unit is still open, its
            // marker was lost, so the gap belongs to its tail. Otherwise the
            // unattributed loss came from packets that yielded nothing and
            // says nothing about this access unit.
            let prev_open = self.frag.is_some()
                || matches!(self.prev_nal, Some((t, false)) if Some(t) == prev_timestamp);
            if prev_open {
                self.prev_au_loss = self.loss.saturating_add(u32::from(pkt.loss));
                self.loss = 0;
            } else {
                self.prev_au_loss = 0;
                self.loss = u32::from(pkt.loss);
            }
        } else {
            self.loss = self.loss.saturating_add(u32::from(pkt.loss));
        }
        if pkt.loss > 0 || new_timestamp {
            self.close_fragment(false);
        }

        let mut data = pkt.payload;
        if data.is_empty() {
            self.discard();
            return Err(DepacketizeError::Empty { seq });
        }
        // https://tools.ietf.org/html/rfc6184#section-5.2
        let nal_header = data[0];
        if (nal_header >> 7) != 0 {
            self.discard();
            return Err(DepacketizeError::ForbiddenBit {
                seq,
                header: nal_header,
            });
        }
        match nal_header & 0b11111 {
            1..=23 => {
                self.close_fragment(false);
                let hdr = header(nal_header);
                data.advance(1);
                let missing = std::mem::take(&mut self.loss);
                self.emit(Nal {
                    hdr,
                    len: 1 + data.len() as u32,
                    pieces: vec![data],
                    timestamp: pkt.timestamp,
                    shifted_timestamp: pkt.shifted_timestamp,
                    first_in_au: false,
                    last_in_au: pkt.mark,
                    missing_packets_before: missing,
                    prev_au_missing_packets: 0,
                    complete: true,
                    metadata: pkt.extension,
                });
            }
            24 => {
                // STAP-A. https://tools.ietf.org/html/rfc6184#section-5.7.1
                self.close_fragment(false);
                data.advance(1);
                let nals = match split_stap_a(data) {
                    Ok(n) => n,
                    Err(description) => {
                        self.discard();
                        return Err(DepacketizeError::BadStapA { seq, description });
                    }
                };
                let n = nals.len();
                for (i, (hdr, piece)) in nals.into_iter().enumerate() {
                    let missing = std::mem::take(&mut self.loss);
                    self.emit(Nal {
                        hdr,
                        len: 1 + piece.len() as u32,
                        pieces: vec![piece],
                        timestamp: pkt.timestamp,
                        shifted_timestamp: pkt.shifted_timestamp,
                        first_in_au: false,
                        last_in_au: pkt.mark && i + 1 == n,
                        missing_packets_before: missing,
                        prev_au_missing_packets: 0,
                        complete: true,
                        metadata: pkt.extension.clone(),
                    });
                }
            }
            28 => {
                // FU-A. https://tools.ietf.org/html/rfc6184#section-5.8
                if data.len() < 3 {
                    self.discard();
                    return Err(DepacketizeError::BadFuA {
                        seq,
                        description: format!("only {} bytes", data.len()),
                    });
                }
                let fu_header = data[1];
                let start = (fu_header & 0b10000000) != 0;
                let end = (fu_header & 0b01000000) != 0;
                let reserved = (fu_header & 0b00100000) != 0;
                let hdr = header((nal_header & 0b011100000) | (fu_header & 0b00011111));
                if (start && end) || reserved {
                    self.discard();
                    return Err(DepacketizeError::BadFuA {
                        seq,
                        description: format!("invalid FU header {:08b}", fu_header),
                    });
                }
                data.advance(2);
                if start {
                    self.close_fragment(false);
                    let missing = std::mem::take(&mut self.loss);
                    self.frag = Some(Fragment {
                        hdr,
                        len: 1 + data.len() as u32,
                        pieces: vec![data],
                        timestamp: pkt.timestamp,
                        shifted_timestamp: pkt.shifted_timestamp,
                        missing_packets_before: missing,
                        metadata: pkt.extension,
                    });
                } else {
                    let Some(frag) = self.frag.as_mut() else {
                        // The start of this NAL was lost; nothing to attach to.
                        self.counters.orphan_fragments += 1;
                        self.loss = self.loss.saturating_add(1);
                        debug!("dropping orphan FU-A fragment at seq {:04x}", seq);
                        return Ok(());
                    };
                    if u8::from(frag.hdr) != u8::from(hdr) {
                        self.close_fragment(false);
                        self.discard();
                        return Err(DepacketizeError::BadFuA {
                            seq,
                            description: format!(
                                "inconsistent NAL header {:02x} in fragment",
                                u8::from(hdr)
                            ),
                        });
                    }
                    frag.len = frag.len.saturating_add(data.len() as u32);
                    frag.pieces.push(data);
                    if end {
                        self.close_fragment_with(true, pkt.mark);
                    }
                }
                if pkt.mark && self.frag.is_some() {
                    // The marker came before the fragment's end.
                    self.close_fragment_with(false, true);
                }
            }
            t => {
                // 25..=27 and 29 are interleaved-mode structures; 0, 30 and 31 are undefined.
                self.discard();
                return Err(DepacketizeError::Unsupported { seq, nal_type: t });
            }
        }
        Ok(())
    }

    /// Drops the current packet, counting it as lost. An open fragment can't
    /// be completed across it.
    fn discard(&mut self) {
        self.counters.malformed_packets += 1;
        self.close_fragment(false);
        self.loss = self.loss.saturating_add(1);
    }

    fn close_fragment(&mut self, complete: bool) {
        self.close_fragment_with(complete, false)
    }

    fn close_fragment_with(&mut self, complete: bool, last_in_au: bool) {
        let Some(frag) = self.frag.take() else {
            return;
        };
        self.emit(Nal {
            hdr: frag.hdr,
            pieces: frag.pieces,
            len: frag.len,
            timestamp: frag.timestamp,
            shifted_timestamp: frag.shifted_timestamp,
            first_in_au: false,
            last_in_au,
            missing_packets_before: frag.missing_packets_before,
            prev_au_missing_packets: 0,
            complete,
            metadata: frag.metadata,
        });
    }

    fn emit(&mut self, mut nal: Nal) {
        let ts = nal.timestamp.timestamp();
        nal.first_in_au = match self.prev_nal {
            None => true,
            Some((prev_ts, prev_last)) => prev_ts != ts || prev_last,
        } || nal.hdr.nal_unit_type() == UnitType::AccessUnitDelimiter;
        self.prev_nal = Some((ts, nal.last_in_au));
        if self.last_timestamp == Some(ts) {
            nal.prev_au_missing_packets = std::mem::take(&mut self.prev_au_loss);
        }
        if !nal.complete {
            self.counters.incomplete_nals += 1;
        }
        self.pending.push_back(nal);
    }
}

fn header(b: u8) -> NalHeader {
    // Only fails with the F bit set, which callers have already masked or checked.
    NalHeader::new(b & 0x7f).unwrap_or_else(|_| unreachable!())
}

/// Splits a STAP-A payload (after its header byte) into NAL units.
///
/// Fails without emitting anything if any length is inconsistent.
fn split_stap_a(mut data: Bytes) -> Result<Vec<(NalHeader, Bytes)>, String> {
    let mut nals = Vec::new();
    while !data.is_empty() {
        if data.remaining() < 2 {
            return Err(format!(
                "{} remaining bytes while expecting 2-byte length",
                data.remaining()
            ));
        }
        let len = usize::from(data.get_u16());
        if len == 0 {
            return Err("zero length".into());
        }
        if data.remaining() < len {
            return Err(format!(
                "{} bytes remaining, expecting {}-byte NAL",
                data.remaining(),
                len
            ));
        }
        let mut piece = data.split_to(len);
        let hdr =
            NalHeader::new(piece[0]).map_err(|_| format!("bad header {:02x}", piece[0]))?;
        piece.advance(1);
        nals.push((hdr, piece));
    }
    if nals.is_empty() {
        return Err("no aggregated NAL units".into());
    }
    Ok(nals)
}
