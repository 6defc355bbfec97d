// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTP header handling; see [RFC 3550](https://datatracker.ietf.org/doc/html/rfc3550).

use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;
use log::{debug, info};

use crate::clock::ClockSync;
use crate::timeline::Timeline;
use crate::{Error, ErrorInt, PacketContext};

/// A received RTP packet, accepted by [`SequenceChecker`].
pub struct Packet {
    pub ctx: PacketContext,
    pub timestamp: crate::Timestamp,

    /// `timestamp` mapped to the local clock, if an offset is known.
    pub shifted_timestamp: Option<u64>,
    pub ssrc: u32,
    pub sequence_number: u16,

    /// Number of skipped sequence numbers since the previously emitted packet.
    pub loss: u16,

    pub mark: bool,

    /// The raw RTP header extension (profile id, length and data), if present.
    pub extension: Option<Bytes>,

    /// Never empty.
    pub payload: Bytes,
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("ctx", &self.ctx)
            .field("timestamp", &self.timestamp)
            .field("shifted_timestamp", &self.shifted_timestamp)
            .field("ssrc", &self.ssrc)
            .field("sequence_number", &self.sequence_number)
            .field("loss", &self.loss)
            .field("mark", &self.mark)
            .field(
                "extension",
                &self
                    .extension
                    .as_ref()
                    .map(|e| crate::hex::LimitedHex::new(e, 16)),
            )
            .field("payload", &crate::hex::LimitedHex::new(&self.payload, 64))
            .finish()
    }
}

/// Cumulative packet-level counters kept by [`SequenceChecker`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SequenceCounters {
    pub received: u64,
    pub malformed: u64,
    pub late: u64,
    pub duplicate: u64,
    pub missed: u64,
    pub ssrc_changes: u64,
}

/// RTP demarshaller which checks SSRC and sequence numbers and reports loss.
///
/// Packets are emitted (via [`SequenceChecker::pull`]) in sequence number
/// order. With a reorder window of 0, every packet that advances the sequence
/// number is emitted immediately and any gap is reported as loss on it;
/// packets that arrive after a later one are dropped as late. With a window of
/// `n`, up to `n` packets following a gap are held back in the hope the gap
/// fills; when the window overflows, the gap is declared lost.
///
/// A change of SSRC means the sender restarted: history is discarded and the
/// new source is followed. Sequence distances of more than `i16::MAX` are
/// indistinguishable from reordering and are treated as late packets.
#[derive(Debug)]
pub struct SequenceChecker {
    payload_type: Option<u8>,
    reorder_window: usize,
    timeline: Timeline,

    ssrc: Option<u32>,

    /// Extended (non-wrapping) sequence number expected next.
    next_seq: Option<u64>,

    /// Packets waiting for a gap before them to fill, keyed by extended seq.
    held: BTreeMap<u64, Packet>,
    ready: VecDeque<Packet>,
    counters: SequenceCounters,
}

impl SequenceChecker {
    pub fn new(payload_type: Option<u8>, reorder_window: usize, timeline: Timeline) -> Self {
        Self {
            payload_type,
            reorder_window,
            timeline,
            ssrc: None,
            next_seq: None,
            held: BTreeMap::new(),
            ready: VecDeque::new(),
            counters: SequenceCounters::default(),
        }
    }

    pub fn counters(&self) -> SequenceCounters {
        self.counters
    }

    /// Processes one datagram.
    ///
    /// Errors describe packets which were dropped and counted as malformed;
    /// they never leave the checker in a bad state.
    pub fn rtp(
        &mut self,
        pkt_ctx: &PacketContext,
        clock: &ClockSync,
        data: Bytes,
    ) -> Result<(), Error> {
        self.counters.received += 1;
        let reader = match rtp_rs::RtpReader::new(&data[..]) {
            Ok(r) => r,
            Err(e) => {
                self.counters.malformed += 1;
                bail!(ErrorInt::MalformedPacket {
                    pkt_ctx: *pkt_ctx,
                    description: format!(
                        "corrupt RTP header while expecting seq={:04x?}: {:?}",
                        self.next_seq.map(|s| s as u16),
                        e
                    ),
                    data,
                });
            }
        };
        let sequence_number = u16::from_be_bytes([data[2], data[3]]); // rtp_rs::Seq is awkward.
        let ssrc = reader.ssrc();
        let payload_type = reader.payload_type();
        if matches!(self.payload_type, Some(pt) if pt != payload_type) {
            self.counters.malformed += 1;
            bail!(ErrorInt::RtpPacketError {
                pkt_ctx: *pkt_ctx,
                ssrc,
                sequence_number,
                description: format!(
                    "unexpected payload type {}; expecting {:?}",
                    payload_type, self.payload_type
                ),
            });
        }
        let payload = reader.payload();
        if payload.is_empty() {
            self.counters.malformed += 1;
            bail!(ErrorInt::RtpPacketError {
                pkt_ctx: *pkt_ctx,
                ssrc,
                sequence_number,
                description: "empty payload".into(),
            });
        }
        let payload = data.slice_ref(payload);
        let mark = reader.mark();
        let rtp_timestamp = reader.timestamp();
        let extension = raw_extension(&data);

        if matches!(self.ssrc, Some(s) if s != ssrc) {
            info!(
                "[{}] ssrc changed from {:08x?} to {:08x}; restarting sequence tracking",
                pkt_ctx, self.ssrc, ssrc
            );
            self.counters.ssrc_changes += 1;
            self.flush();
            self.next_seq = None;
            self.timeline.reset();
        }
        self.ssrc = Some(ssrc);

        let ext_seq = match self.next_seq {
            None => {
                // Start far enough from zero that backward steps stay representable.
                let s = (1 << 16) | u64::from(sequence_number);
                self.next_seq = Some(s);
                s
            }
            Some(next) => {
                let delta = sequence_number.wrapping_sub(next as u16) as i16;
                match next.checked_add_signed(i64::from(delta)) {
                    Some(s) => s,
                    None => {
                        self.counters.late += 1;
                        return Ok(());
                    }
                }
            }
        };
        let next = self.next_seq.unwrap_or(ext_seq);
        if ext_seq < next {
            self.counters.late += 1;
            info!(
                "[{}] Skipping late seq={:04x} when expecting ssrc={:08x} seq={:04x}",
                pkt_ctx, sequence_number, ssrc, next as u16
            );
            return Ok(());
        }
        if self.held.contains_key(&ext_seq) {
            self.counters.duplicate += 1;
            debug!("[{}] duplicate seq={:04x}", pkt_ctx, sequence_number);
            return Ok(());
        }

        let timestamp = match self.timeline.advance_to(rtp_timestamp) {
            Ok(ts) => ts,
            Err(description) => {
                self.counters.malformed += 1;
                bail!(ErrorInt::RtpPacketError {
                    pkt_ctx: *pkt_ctx,
                    ssrc,
                    sequence_number,
                    description,
                });
            }
        };
        let pkt = Packet {
            ctx: *pkt_ctx,
            timestamp,
            shifted_timestamp: clock.shift(timestamp.micros()),
            ssrc,
            sequence_number,
            loss: 0,
            mark,
            extension,
            payload,
        };

        if ext_seq == next || self.reorder_window == 0 {
            self.emit(ext_seq, pkt);
        } else {
            self.held.insert(ext_seq, pkt);
            while self.held.len() > self.reorder_window {
                let Some((s, p)) = self.held.pop_first() else {
                    break;
                };
                self.emit(s, p);
            }
        }
        self.drain_consecutive();
        Ok(())
    }

    /// Returns the next in-order packet, if any.
    pub fn pull(&mut self) -> Option<Packet> {
        self.ready.pop_front()
    }

    /// Gives up on any gaps and makes all held packets available.
    pub fn flush(&mut self) {
        while let Some((s, p)) = self.held.pop_first() {
            self.emit(s, p);
        }
    }

    fn emit(&mut self, ext_seq: u64, mut pkt: Packet) {
        let next = self.next_seq.unwrap_or(ext_seq);
        let loss = ext_seq.saturating_sub(next);
        pkt.loss = u16::try_from(loss).unwrap_or(u16::MAX);
        self.counters.missed += loss;
        self.next_seq = Some(ext_seq + 1);
        self.ready.push_back(pkt);
    }

    fn drain_consecutive(&mut self) {
        while let Some(next) = self.next_seq {
            let Some(p) = self.held.remove(&next) else {
                break;
            };
            self.emit(next, p);
        }
    }
}

/// Returns the raw header extension of an RTP packet already validated by
/// `rtp_rs::RtpReader`.
fn raw_extension(data: &Bytes) -> Option<Bytes> {
    if data[0] & 0b0001_0000 == 0 {
        return None;
    }
    let start = 12 + 4 * usize::from(data[0] & 0b0000_1111);
    let words = u16::from_be_bytes([*data.get(start + 2)?, *data.get(start + 3)?]);
    let end = start + 4 + 4 * usize::from(words);
    if end > data.len() {
        return None;
    }
    Some(data.slice(start..end))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker(window: usize) -> SequenceChecker {
        SequenceChecker::new(
            Some(96),
            window,
            Timeline::new(90_000, None).unwrap(),
        )
    }

    fn pkt(ssrc: u32, seq: u16, ts: u32) -> Bytes {
        rtp_rs::RtpPacketBuilder::new()
            .payload_type(96)
            .ssrc(ssrc)
            .sequence(seq.into())
            .timestamp(ts)
            .marked(true)
            .payload(b"x")
            .build()
            .unwrap()
            .into()
    }

    fn push(c: &mut SequenceChecker, ssrc: u32, seq: u16) {
        c.rtp(
            &PacketContext::dummy(),
            &ClockSync::new(),
            pkt(ssrc, seq, u32::from(seq) * 3000),
        )
        .unwrap();
    }

    fn drain(c: &mut SequenceChecker) -> Vec<(u16, u16)> {
        std::iter::from_fn(|| c.pull())
            .map(|p| (p.sequence_number, p.loss))
            .collect()
    }

    #[test]
    fn wrong_payload_type() {
        let mut c = checker(0);
        let data: Bytes = rtp_rs::RtpPacketBuilder::new()
            .payload_type(50)
            .ssrc(0xd25614e)
            .sequence(0x1234.into())
            .timestamp(141000)
            .marked(true)
            .payload(b"bar")
            .build()
            .unwrap()
            .into();
        c.rtp(&PacketContext::dummy(), &ClockSync::new(), data)
            .unwrap_err();
        assert!(c.pull().is_none());
        assert_eq!(c.counters().malformed, 1);
    }

    #[test]
    fn corrupt_header() {
        let mut c = checker(0);
        c.rtp(
            &PacketContext::dummy(),
            &ClockSync::new(),
            Bytes::from_static(b"\x80\x60\x00"),
        )
        .unwrap_err();
        assert_eq!(c.counters().malformed, 1);
    }

    #[test]
    fn loss_and_late() {
        let mut c = checker(0);
        push(&mut c, 1, 0xfffe);
        push(&mut c, 1, 0xffff);
        push(&mut c, 1, 2); // skips 0 and 1 across the wrap.
        push(&mut c, 1, 1); // late; dropped.
        push(&mut c, 1, 3);
        assert_eq!(drain(&mut c), vec![(0xfffe, 0), (0xffff, 0), (2, 2), (3, 0)]);
        let counters = c.counters();
        assert_eq!(counters.late, 1);
        assert_eq!(counters.missed, 2);
    }

    #[test]
    fn reorder_window_fills_gap() {
        let mut c = checker(2);
        push(&mut c, 1, 10);
        push(&mut c, 1, 12);
        assert_eq!(drain(&mut c), vec![(10, 0)]);
        push(&mut c, 1, 11);
        assert_eq!(drain(&mut c), vec![(11, 0), (12, 0)]);
        assert_eq!(c.counters().missed, 0);
    }

    #[test]
    fn reorder_window_overflow_declares_loss() {
        let mut c = checker(2);
        push(&mut c, 1, 10);
        push(&mut c, 1, 12);
        push(&mut c, 1, 13);
        push(&mut c, 1, 13); // duplicate of a held packet.
        assert_eq!(drain(&mut c), vec![(10, 0)]);
        push(&mut c, 1, 14);
        assert_eq!(drain(&mut c), vec![(12, 1), (13, 0), (14, 0)]);
        push(&mut c, 1, 11); // gave up on it already.
        assert!(c.pull().is_none());
        let counters = c.counters();
        assert_eq!(counters.duplicate, 1);
        assert_eq!(counters.late, 1);
        assert_eq!(counters.missed, 1);
    }

    #[test]
    fn ssrc_change_restarts() {
        let mut c = checker(0);
        push(&mut c, 1, 100);
        push(&mut c, 2, 5);
        push(&mut c, 2, 6);
        assert_eq!(drain(&mut c), vec![(100, 0), (5, 0), (6, 0)]);
        assert_eq!(c.counters().ssrc_changes, 1);
    }

    #[test]
    fn header_extension() {
        let mut raw = pkt(1, 7, 0).to_vec();
        raw[0] |= 0b0001_0000;
        let ext = [0xab, 0xac, 0x00, 0x01, 1, 2, 3, 4];
        raw.splice(12..12, ext.iter().copied());
        let mut c = checker(0);
        c.rtp(&PacketContext::dummy(), &ClockSync::new(), raw.into())
            .unwrap();
        let p = c.pull().unwrap();
        assert_eq!(p.extension.as_deref(), Some(&ext[..]));
        assert_eq!(&p.payload[..], b"x");
    }

    #[test]
    fn shifted_timestamp() {
        let clock = ClockSync::new();
        clock.update(1_000_000);
        let mut c = checker(0);
        c.rtp(&PacketContext::dummy(), &clock, pkt(1, 1, 90_000))
            .unwrap();
        let p = c.pull().unwrap();
        assert_eq!(p.shifted_timestamp, Some(2_000_000));
    }
}
