// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Groups NAL units into access units and decides what reaches the consumer.
//!
//! The assembler is **Idle** until a NAL unit with a new timestamp arrives,
//! then **Collecting** that access unit into a consumer-supplied buffer until
//! a NAL unit ends with the RTP marker bit or a newer timestamp forces the
//! access unit closed. Sealing an access unit classifies its sync type, maps
//! its slices onto the macroblock grid, optionally replaces lost slices, and
//! applies the output policy of [`FilterOptions`]. If no buffer is available
//! the access unit's remaining NAL units are skipped.

use std::sync::{Arc, Mutex};

use bytes::{BufMut, Bytes};
use h264_reader::nal::UnitType;
use log::{debug, info, trace, warn};

use crate::buffer::{AuBuffer, BufferExchange, BufferRelease};
use crate::codec::h264::params::{ParameterSetCache, SpsChange};
use crate::codec::h264::slice::{parse_slice_header, scan_sei, SliceHeader};
use crate::codec::h264::{synth, Nal, ParameterSets, SyncType};
use crate::consumer::{AccessUnit, Consumer, ConsumerError};
use crate::error::ErrorInt;
use crate::macroblock::{
    ConcealmentPolicy, MacroblockStatus, MacroblockTracker, NearestValidConcealment, Segment,
    SliceRecord,
};
use crate::monitoring::{bump, Counters};
use crate::options::{FilterOptions, ResyncPolicy};
use crate::{Error, Timestamp};

/// A timestamp this far behind the newest one is taken as a sender restart
/// rather than a stray packet.
const RESTART_SECS: i64 = 10;

const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Writes the 4-byte prefix of a NAL unit of `len` bytes.
fn put_prefix<B: BufMut>(b: &mut B, len: usize, length_prefixed: bool) {
    if length_prefixed {
        b.put_u32(len as u32);
    } else {
        b.put_slice(&START_CODE);
    }
}

struct AuState {
    timestamp: Timestamp,
    shifted_timestamp: Option<u64>,
    metadata: Option<Bytes>,
    user_data: Vec<u8>,

    /// Packets lost anywhere within the access unit, including just before
    /// its first NAL unit.
    missing_packets: u32,

    /// Packets lost (or NAL units truncated or dropped) since the last
    /// recorded slice.
    loss_since_last_slice: u32,

    /// Some data which belongs in the output isn't there.
    dropped_data: bool,

    /// The access unit's end was marked.
    marker: bool,
    slices: Vec<SliceRecord>,
    idr: bool,
    all_intra: bool,
    recovery_point: bool,
    is_reference: bool,

    /// A fully-parsed slice header, for synthesizing others of the same picture.
    reference: Option<SliceHeader>,
}

impl AuState {
    fn new(nal: &Nal) -> Self {
        AuState {
            timestamp: nal.timestamp(),
            shifted_timestamp: nal.shifted_timestamp(),
            metadata: nal.metadata().cloned(),
            user_data: Vec::new(),
            missing_packets: 0,
            loss_since_last_slice: 0,
            dropped_data: false,
            marker: false,
            slices: Vec::new(),
            idr: false,
            all_intra: true,
            recovery_point: false,
            is_reference: false,
            reference: None,
        }
    }

    fn sync_type(&self, opts: &FilterOptions) -> SyncType {
        if self.idr {
            SyncType::Idr
        } else if !self.slices.is_empty() && self.all_intra {
            SyncType::IFrame
        } else if self.recovery_point && opts.pir_start_on_recovery_point {
            SyncType::PirStart
        } else {
            SyncType::None
        }
    }
}

enum State {
    Idle,
    Collecting(AuState),

    /// No buffer was available for the access unit with this timestamp.
    Skipping { timestamp: i64 },
}

/// Turns a stream of NAL units into access units delivered to a [`Consumer`].
pub struct AuAssembler<C: Consumer> {
    consumer: C,
    opts: FilterOptions,
    params: ParameterSetCache,
    shared_params: Arc<Mutex<Option<ParameterSets>>>,

    /// The consumer hasn't yet been told of the current parameter sets.
    params_dirty: bool,
    buffers: BufferExchange,
    tracker: MacroblockTracker,
    counters: Arc<Counters>,
    state: State,

    /// Timestamp of the newest access unit sealed or skipped.
    last_sealed: Option<i64>,

    /// Output is held until a sync access unit (or a gray placeholder).
    need_sync_frame: bool,
    gray_allowed: bool,
}

impl<C: Consumer> AuAssembler<C> {
    pub fn new(opts: FilterOptions, consumer: C, counters: Arc<Counters>) -> Result<Self, Error> {
        opts.validate()?;
        let mut a = AuAssembler {
            consumer,
            params: ParameterSetCache::new(),
            shared_params: Arc::new(Mutex::new(None)),
            params_dirty: false,
            buffers: BufferExchange::new(opts.initial_buffer_size, counters.clone()),
            tracker: MacroblockTracker::new(Box::new(NearestValidConcealment)),
            counters,
            state: State::Idle,
            last_sealed: None,
            need_sync_frame: opts.wait_for_sync,
            gray_allowed: true,
            opts,
        };
        if let Some(sprop) = a.opts.sprop_parameter_sets.clone() {
            a.params.put_sprop(&sprop).map_err(|e| {
                wrap!(ErrorInt::InvalidArgument(format!(
                    "bad sprop-parameter-sets {sprop:?}: {e}"
                )))
            })?;
            if let Some(sps) = a.params.sps() {
                let (w, h) = (sps.mb_width, sps.mb_height);
                a.tracker.reset(w, h)?;
            }
            a.params_dirty = true;
            if let Ok(mut l) = a.shared_params.lock() {
                *l = a.params.to_parameter_sets();
            }
        }
        Ok(a)
    }

    /// Replaces the default [`NearestValidConcealment`] policy.
    pub fn with_concealment_policy(mut self, policy: Box<dyn ConcealmentPolicy>) -> Self {
        self.tracker = MacroblockTracker::new(policy);
        if let Some(sps) = self.params.sps() {
            let (w, h) = (sps.mb_width, sps.mb_height);
            if let Err(e) = self.tracker.reset(w, h) {
                warn!("{}", e);
            }
        }
        self
    }

    pub fn consumer(&self) -> &C {
        &self.consumer
    }

    /// The most recent parameter sets, kept current for other threads.
    pub(crate) fn shared_parameter_sets(&self) -> Arc<Mutex<Option<ParameterSets>>> {
        self.shared_params.clone()
    }

    /// Processes one NAL unit.
    pub fn push(&mut self, nal: Nal) {
        trace!("nal: {:?}", &nal);
        let ts = nal.timestamp().timestamp();
        let current = match &self.state {
            State::Idle => None,
            State::Collecting(au) => Some(au.timestamp.timestamp()),
            State::Skipping { timestamp } => Some(*timestamp),
        };
        if current != Some(ts) {
            if let Some(newest) = current.or(self.last_sealed) {
                let restart_ticks = RESTART_SECS * i64::from(nal.timestamp().clock_rate().get());
                if ts <= newest && newest - ts <= restart_ticks {
                    debug!(
                        "dropping stray {:?} NAL at {}; newest access unit is at {}",
                        nal.unit_type(),
                        nal.timestamp(),
                        newest
                    );
                    bump(&self.counters.stray_nalus, 1);
                    return;
                }
                if ts <= newest {
                    info!(
                        "timestamp stepped back from {} to {}; assuming sender restart",
                        newest,
                        nal.timestamp()
                    );
                    self.reset_stream();
                }
            }
            if let State::Collecting(au) = &mut self.state {
                au.missing_packets += nal.prev_au_missing_packets();
                au.loss_since_last_slice += nal.prev_au_missing_packets();
            }
            self.finish_current();
            self.open(&nal);
        }
        self.handle(nal);
    }

    /// Closes any open access unit and forgets timestamp history, for a new
    /// RTP stream (such as after an SSRC change).
    pub fn reset_stream(&mut self) {
        self.finish_current();
        self.last_sealed = None;
    }

    /// Abandons any access unit in progress, returning its buffer as
    /// cancelled.
    pub fn shutdown(&mut self) {
        if let State::Collecting(au) = std::mem::replace(&mut self.state, State::Idle) {
            debug!("abandoning access unit at {} on shutdown", au.timestamp);
        }
        self.buffers.cancel(&mut self.consumer, BufferRelease::Cancelled);
    }

    pub fn into_consumer(mut self) -> C {
        self.shutdown();
        self.consumer
    }

    fn finish_current(&mut self) {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Idle => {}
            State::Collecting(au) => {
                debug!("force-sealing access unit at {}", au.timestamp);
                self.seal(au);
            }
            State::Skipping { timestamp } => self.last_sealed = Some(timestamp),
        }
    }

    fn open(&mut self, nal: &Nal) {
        match self
            .buffers
            .acquire(&mut self.consumer, self.opts.initial_buffer_size)
        {
            Ok(()) => self.state = State::Collecting(AuState::new(nal)),
            Err(_) => {
                debug!("no buffer; skipping access unit at {}", nal.timestamp());
                bump(&self.counters.aus_skipped_no_buffer, 1);

                // The decoder will miss this picture entirely.
                self.tracker.fill(MacroblockStatus::Missing);
                self.state = State::Skipping {
                    timestamp: nal.timestamp().timestamp(),
                };
            }
        }
    }

    fn handle(&mut self, nal: Nal) {
        let unit_type = nal.unit_type();
        if nal.is_complete() {
            match unit_type {
                UnitType::SeqParameterSet => self.put_sps(&nal),
                UnitType::PicParameterSet => self.put_pps(&nal),
                _ => {}
            }
        }
        let mut au = match std::mem::replace(&mut self.state, State::Idle) {
            State::Collecting(au) => au,
            other => {
                if nal.is_last_in_au() {
                    if let State::Skipping { timestamp } = other {
                        self.last_sealed = Some(timestamp);
                    }
                } else {
                    self.state = other;
                }
                return;
            }
        };
        au.missing_packets += nal.missing_packets_before();
        au.loss_since_last_slice += nal.missing_packets_before();
        if !nal.is_complete() {
            bump(&self.counters.nalus_incomplete, 1);
            au.dropped_data = true;
        }
        let filtered = match unit_type {
            UnitType::SeqParameterSet | UnitType::PicParameterSet => self.opts.filter_out_sps_pps,
            UnitType::SEI => self.opts.filter_out_sei,
            _ => false,
        };
        let offset = if filtered { None } else { self.write_nal(&nal) };
        if offset.is_none() && !filtered {
            au.dropped_data = true;
        }
        match unit_type {
            UnitType::SEI => {
                let r = match offset {
                    Some(o) => scan_sei(&self.buffers.data()[o + 4..], &mut au.user_data),
                    None => scan_sei(&nal.to_vec(), &mut au.user_data),
                };
                match r {
                    Ok(s) => au.recovery_point |= s.recovery_point,
                    Err(e) => debug!("unable to parse SEI at {}: {}", au.timestamp, e),
                }
            }
            UnitType::SliceLayerWithoutPartitioningIdr
            | UnitType::SliceLayerWithoutPartitioningNonIdr => match offset {
                Some(o) => self.record_slice(&mut au, o),
                None => au.loss_since_last_slice += 1,
            },
            _ => {}
        }
        if !nal.is_complete() {
            au.loss_since_last_slice += 1;
        }
        if nal.is_last_in_au() {
            au.marker = true;
            self.seal(au);
        } else {
            self.state = State::Collecting(au);
        }
    }

    fn put_sps(&mut self, nal: &Nal) {
        match self.params.put_sps(Bytes::from(nal.to_vec())) {
            Ok(SpsChange::Unchanged) => {}
            Ok(SpsChange::Replaced { resized }) => {
                self.params_dirty = true;
                if let Some(sps) = self.params.sps() {
                    let (w, h) = (sps.mb_width, sps.mb_height);
                    debug!("SPS replaced (resized={}); {}x{} macroblocks", resized, w, h);
                    if let Err(e) = self.tracker.reset(w, h) {
                        warn!("{}", e);
                        self.tracker.invalidate();
                    }
                }
            }
            Err(e) => warn!("ignoring bad SPS: {}", e),
        }
    }

    fn put_pps(&mut self, nal: &Nal) {
        match self.params.put_pps(Bytes::from(nal.to_vec())) {
            Ok(true) => self.params_dirty = true,
            Ok(false) => {}
            Err(e) => warn!("ignoring bad PPS: {}", e),
        }
    }

    /// Appends a NAL unit to the live buffer, returning its prefix's offset.
    fn write_nal(&mut self, nal: &Nal) -> Option<usize> {
        let len = nal.len();
        let length_prefixed = self.opts.replace_start_codes_with_nalu_size;
        let r = self
            .buffers
            .append_with(&mut self.consumer, 4 + len, |b| {
                put_prefix(b, len, length_prefixed);
                nal.for_each_piece(|p| b.extend_from_slice(p));
            });
        match r {
            Ok(o) => Some(o),
            Err(_) => {
                debug!(
                    "no room for {}-byte {:?} NAL at {}; dropping",
                    len,
                    nal.unit_type(),
                    nal.timestamp()
                );
                bump(&self.counters.nalus_dropped, 1);
                None
            }
        }
    }

    /// Parses the header of the slice written at `offset` and records it.
    fn record_slice(&self, au: &mut AuState, offset: usize) {
        let data = &self.buffers.data()[offset + 4..];
        let h = match parse_slice_header(data, self.params.active()) {
            Ok(h) => h,
            Err(e) => {
                debug!("bad slice header at {}: {}", au.timestamp, e);
                au.dropped_data = true;
                return;
            }
        };
        if let Some(sps) = self.params.sps() {
            if h.first_mb >= sps.total_mbs() {
                debug!(
                    "slice at {} starts at macroblock {} of {}",
                    au.timestamp,
                    h.first_mb,
                    sps.total_mbs()
                );
                au.dropped_data = true;
                return;
            }
        }
        if au.slices.last().is_some_and(|s| h.first_mb <= s.first_mb) {
            debug!(
                "ignoring out-of-order or redundant slice at {} macroblock {}",
                au.timestamp, h.first_mb
            );
            return;
        }
        au.slices.push(SliceRecord {
            first_mb: h.first_mb,
            intra: h.kind.is_intra(),
            offset,
            loss_before: au.loss_since_last_slice,
        });
        au.loss_since_last_slice = 0;
        au.idr |= h.idr;
        au.all_intra &= h.kind.is_intra();
        au.is_reference |= h.nal_ref_idc != 0;
        if au.reference.is_none() && h.picture.is_some() {
            au.reference = Some(h);
        }
    }

    fn seal(&mut self, au: AuState) {
        self.last_sealed = Some(au.timestamp.timestamp());
        self.flush_params();
        // An access unit with no usable slice after loss covers nothing; one
        // that simply has none (parameter sets only) leaves the grid alone.
        let damaged = !au.marker || au.dropped_data || au.missing_packets > 0;
        let mut segments = if self.tracker.grid().is_some() && (!au.slices.is_empty() || damaged)
        {
            self.tracker.plan(
                &au.slices,
                au.marker && au.loss_since_last_slice == 0,
                self.buffers.len(),
            )
        } else {
            Vec::new()
        };
        let planned = !segments.is_empty();
        let sync_type = au.sync_type(&self.opts);

        let mut gray = false;
        if self.need_sync_frame {
            if !self.params.is_synchronized() || !sync_type.is_sync() {
                gray = self.params.is_synchronized()
                    && self.opts.generate_first_gray_i_frame
                    && self.gray_allowed;
                if !gray {
                    return self.drop_before_sync(&au);
                }
            }
        }

        if self.opts.generate_skipped_p_slices && sync_type != SyncType::Idr && planned {
            self.synthesize(&au, &mut segments);
        }
        let unconcealed = segments
            .iter()
            .any(|s| matches!(s, Segment::Lost { synthesized: false, .. }));
        let complete = au.marker
            && !au.dropped_data
            && if planned {
                !unconcealed
            } else {
                au.missing_packets == 0
            };
        if !complete && !self.opts.output_incomplete_au {
            debug!(
                "dropping incomplete access unit at {} ({} packets missing)",
                au.timestamp, au.missing_packets
            );
            bump(&self.counters.aus_incomplete_dropped, 1);
            if au.is_reference || au.slices.is_empty() {
                self.tracker.fill(MacroblockStatus::Missing);
            }
            self.buffers.clear();
            return;
        }

        if gray {
            if !self.emit_gray(&au) || self.need_sync_frame {
                return self.drop_before_sync(&au);
            }
        } else if self.need_sync_frame {
            debug!("synchronized at {} ({:?})", au.timestamp, sync_type);
            self.need_sync_frame = false;
        }
        if planned {
            self.tracker.apply(&segments, sync_type == SyncType::Idr);
        }
        let Some(buffer) = self.buffers.take() else {
            return;
        };
        self.deliver(Delivery {
            buffer,
            timestamp: au.timestamp,
            shifted_timestamp: au.shifted_timestamp,
            sync_type,
            complete,
            missing_packets: au.missing_packets,
            placeholder: false,
            metadata: au.metadata.as_deref().unwrap_or(&[]),
            user_data: &au.user_data,
        });
    }

    fn drop_before_sync(&mut self, au: &AuState) {
        debug!("dropping access unit at {} while waiting for sync", au.timestamp);
        bump(&self.counters.aus_dropped_before_sync, 1);
        self.buffers.clear();
    }

    /// Inserts skipped P slices for lost ranges, back to front so earlier
    /// offsets stay valid.
    fn synthesize(&mut self, au: &AuState, segments: &mut [Segment]) {
        let Some((sps, pps)) = self.params.active() else {
            return;
        };
        let Some(reference) = au.reference.as_ref() else {
            return;
        };
        let length_prefixed = self.opts.replace_start_codes_with_nalu_size;
        for seg in segments.iter_mut().rev() {
            let Segment::Lost {
                range,
                insert_at,
                synthesized,
            } = seg
            else {
                continue;
            };
            let nal = match synth::skipped_p_slice(
                sps,
                pps,
                reference,
                range.start,
                range.end - range.start,
            ) {
                Ok(n) => n,
                Err(e) => {
                    debug!(
                        "not concealing macroblocks {:?} at {}: {}",
                        range, au.timestamp, e
                    );
                    return;
                }
            };
            let mut bytes = Vec::with_capacity(4 + nal.len());
            put_prefix(&mut bytes, nal.len(), length_prefixed);
            bytes.extend_from_slice(&nal);
            if self
                .buffers
                .insert(&mut self.consumer, *insert_at, &bytes)
                .is_err()
            {
                debug!("no room for skipped slice at {}", au.timestamp);
                return;
            }
            *synthesized = true;
            bump(&self.counters.skipped_slices_generated, 1);
        }
    }

    /// Delivers a gray IDR picture ahead of `au`. Returns false if none could
    /// be made.
    fn emit_gray(&mut self, au: &AuState) -> bool {
        let Some((sps, pps)) = self.params.active() else {
            return false;
        };
        let slice = match synth::gray_idr_slice(sps, pps) {
            Ok(s) => s,
            Err(e) => {
                warn!("unable to generate gray IDR picture: {}", e);
                self.gray_allowed = false;
                return false;
            }
        };
        let mut parts: Vec<&[u8]> = Vec::with_capacity(3);
        if !self.opts.filter_out_sps_pps {
            if let (Some(s), Some(p)) = (self.params.sps_nal(), self.params.pps_nal()) {
                parts.push(s);
                parts.push(p);
            }
        }
        parts.push(&slice);
        let total: usize = parts.iter().map(|p| 4 + p.len()).sum();
        let length_prefixed = self.opts.replace_start_codes_with_nalu_size;

        // The held access unit's buffer is complete; set it aside while the
        // gray picture is written.
        let Some(held) = self.buffers.take() else {
            return false;
        };
        let gray = match self.buffers.acquire(&mut self.consumer, total) {
            Ok(()) => self
                .buffers
                .append_with(&mut self.consumer, total, |b| {
                    for p in &parts {
                        put_prefix(b, p.len(), length_prefixed);
                        b.extend_from_slice(p);
                    }
                })
                .ok()
                .and_then(|_| self.buffers.take()),
            Err(_) => None,
        };
        self.buffers.restore(&mut self.consumer, held);
        let Some(gray) = gray else {
            debug!("no buffer for gray IDR picture");
            bump(&self.counters.aus_skipped_no_buffer, 1);
            return false;
        };

        self.gray_allowed = false;
        self.need_sync_frame = false;
        self.tracker.fill(MacroblockStatus::MissingConcealed);
        bump(&self.counters.gray_frames_generated, 1);
        let rate = au.timestamp.clock_rate();
        let tick_us = 1_000_000 / u64::from(rate.get());
        info!("emitting gray IDR picture before {}", au.timestamp);
        self.deliver(Delivery {
            buffer: gray,
            timestamp: Timestamp::new(au.timestamp.timestamp() - 1, rate),
            shifted_timestamp: au.shifted_timestamp.map(|s| s.saturating_sub(tick_us)),
            sync_type: SyncType::Idr,
            complete: true,
            missing_packets: 0,
            placeholder: true,
            metadata: &[],
            user_data: &[],
        });
        true
    }

    fn deliver(&mut self, d: Delivery<'_>) {
        bump(&self.counters.aus_output, 1);
        if !d.complete {
            bump(&self.counters.aus_incomplete_output, 1);
        }
        let au = AccessUnit {
            buffer: d.buffer,
            timestamp: d.timestamp,
            shifted_timestamp: d.shifted_timestamp,
            sync_type: d.sync_type,
            complete: d.complete,
            missing_packets: d.missing_packets,
            placeholder: d.placeholder,
            metadata: d.metadata,
            user_data: d.user_data,
            macroblocks: self.tracker.grid(),
        };
        trace!("au: {:?}", &au);
        match self.consumer.au_ready(au) {
            Ok(()) => {}
            Err(ConsumerError::ResyncRequired) => {
                info!("consumer requested resync at {}", d.timestamp);
                self.resync();
            }
            Err(ConsumerError::Other(e)) => {
                warn!("consumer failed on access unit at {}: {}", d.timestamp, e)
            }
        }
    }

    /// Tells the consumer about new parameter sets, once both are known.
    fn flush_params(&mut self) {
        if !self.params_dirty || !self.params.is_synchronized() {
            return;
        }
        self.params_dirty = false;
        let ps = self.params.to_parameter_sets();
        if let Ok(mut l) = self.shared_params.lock() {
            *l = ps.clone();
        }
        let Some(ps) = ps else {
            return;
        };
        match self.consumer.parameter_sets(ps.sps(), ps.pps()) {
            Ok(()) => {}
            Err(ConsumerError::ResyncRequired) => {
                info!("consumer requested resync on new parameter sets");
                self.resync();
            }
            Err(ConsumerError::Other(e)) => warn!("consumer failed on parameter sets: {}", e),
        }
    }

    fn resync(&mut self) {
        bump(&self.counters.resyncs, 1);
        self.need_sync_frame = true;
        self.gray_allowed = true;
        if self.opts.resync_policy == ResyncPolicy::DropParameterSets {
            self.params.clear();
            self.params_dirty = false;
            self.tracker.invalidate();
            if let Ok(mut l) = self.shared_params.lock() {
                *l = None;
            }
        }
    }
}

/// Arguments to [`AuAssembler::deliver`].
struct Delivery<'a> {
    buffer: AuBuffer,
    timestamp: Timestamp,
    shifted_timestamp: Option<u64>,
    sync_type: SyncType,
    complete: bool,
    missing_packets: u32,
    placeholder: bool,
    metadata: &'a [u8],
    user_data: &'a [u8],
}
