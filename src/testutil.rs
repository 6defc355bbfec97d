// Copyright (C) 2022 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::str::FromStr;

use bytes::Bytes;

use crate::buffer::{AuBuffer, BufferRelease};
use crate::codec::h264::synth::{rbsp_to_nal, RbspWriter};
use crate::consumer::{AccessUnit, Consumer, ConsumerError};
use crate::macroblock::MacroblockStatus;
use crate::SyncType;

pub(crate) fn init_logging() {
    let h = mylog::Builder::new()
        .set_format(
            ::std::env::var("MOONFIRE_FORMAT")
                .map_err(|_| ())
                .and_then(|s| mylog::Format::from_str(&s))
                .unwrap_or(mylog::Format::Google),
        )
        .set_spec(::std::env::var("MOONFIRE_LOG").as_deref().unwrap_or("info"))
        .build();
    let _ = h.install();
}

/// Shape of a generated sequence parameter set.
#[derive(Clone, Debug)]
pub(crate) struct SpsConfig {
    pub(crate) mb_width: u32,
    pub(crate) mb_height: u32,
    pub(crate) poc_type: u32,
    pub(crate) chroma_format_idc: u32,
    pub(crate) frame_mbs_only: bool,
}

impl Default for SpsConfig {
    fn default() -> Self {
        SpsConfig {
            mb_width: 40,
            mb_height: 30,
            poc_type: 2,
            chroma_format_idc: 1,
            frame_mbs_only: true,
        }
    }
}

/// Returns an SPS NAL unit. Frame numbers take 4 bits, as do picture order
/// count LSBs when `poc_type` is 0.
pub(crate) fn sps(cfg: &SpsConfig) -> Vec<u8> {
    let mut w = RbspWriter::new();
    let high = cfg.chroma_format_idc != 1;
    w.u(8, if high { 100 } else { 66 }).unwrap(); // profile_idc
    w.u(8, 0).unwrap(); // constraint flags
    w.u(8, 30).unwrap(); // level_idc
    w.ue(0).unwrap(); // seq_parameter_set_id
    if high {
        w.ue(cfg.chroma_format_idc).unwrap();
        if cfg.chroma_format_idc == 3 {
            w.flag(false).unwrap(); // separate_colour_plane_flag
        }
        w.ue(0).unwrap(); // bit_depth_luma_minus8
        w.ue(0).unwrap(); // bit_depth_chroma_minus8
        w.flag(false).unwrap(); // qpprime_y_zero_transform_bypass_flag
        w.flag(false).unwrap(); // seq_scaling_matrix_present_flag
    }
    w.ue(0).unwrap(); // log2_max_frame_num_minus4
    w.ue(cfg.poc_type).unwrap();
    match cfg.poc_type {
        0 => w.ue(0).unwrap(), // log2_max_pic_order_cnt_lsb_minus4
        1 => {
            w.flag(true).unwrap(); // delta_pic_order_always_zero_flag
            w.se(0).unwrap(); // offset_for_non_ref_pic
            w.se(0).unwrap(); // offset_for_top_to_bottom_field
            w.ue(0).unwrap(); // num_ref_frames_in_pic_order_cnt_cycle
        }
        _ => {}
    }
    w.ue(1).unwrap(); // max_num_ref_frames
    w.flag(false).unwrap(); // gaps_in_frame_num_value_allowed_flag
    w.ue(cfg.mb_width - 1).unwrap();
    w.ue(cfg.mb_height - 1).unwrap(); // in map units; equal for progressive
    w.flag(cfg.frame_mbs_only).unwrap();
    if !cfg.frame_mbs_only {
        w.flag(false).unwrap(); // mb_adaptive_frame_field_flag
    }
    w.flag(true).unwrap(); // direct_8x8_inference_flag
    w.flag(false).unwrap(); // frame_cropping_flag
    w.flag(false).unwrap(); // vui_parameters_present_flag
    rbsp_to_nal(0x67, &w.finish().unwrap())
}

/// Returns a PPS NAL unit referring to SPS 0, with deblocking filter control
/// present.
pub(crate) fn pps(cabac: bool) -> Vec<u8> {
    let mut w = RbspWriter::new();
    w.ue(0).unwrap(); // pic_parameter_set_id
    w.ue(0).unwrap(); // seq_parameter_set_id
    w.flag(cabac).unwrap(); // entropy_coding_mode_flag
    w.flag(false).unwrap(); // bottom_field_pic_order_in_frame_present_flag
    w.ue(0).unwrap(); // num_slice_groups_minus1
    w.ue(0).unwrap(); // num_ref_idx_l0_default_active_minus1
    w.ue(0).unwrap(); // num_ref_idx_l1_default_active_minus1
    w.flag(false).unwrap(); // weighted_pred_flag
    w.u(2, 0).unwrap(); // weighted_bipred_idc
    w.se(0).unwrap(); // pic_init_qp_minus26
    w.se(0).unwrap(); // pic_init_qs_minus26
    w.se(0).unwrap(); // chroma_qp_index_offset
    w.flag(true).unwrap(); // deblocking_filter_control_present_flag
    w.flag(false).unwrap(); // constrained_intra_pred_flag
    w.flag(false).unwrap(); // redundant_pic_cnt_present_flag
    rbsp_to_nal(0x68, &w.finish().unwrap())
}

/// Shape of a generated slice NAL unit.
#[derive(Clone, Debug)]
pub(crate) struct SliceConfig {
    pub(crate) idr: bool,
    pub(crate) slice_type: u32,
    pub(crate) first_mb: u32,
    pub(crate) frame_num: u32,
    pub(crate) poc_lsb: u32,
    pub(crate) ref_idc: u8,

    /// Bytes of opaque slice data following the header.
    pub(crate) body_len: usize,
}

impl Default for SliceConfig {
    fn default() -> Self {
        SliceConfig {
            idr: false,
            slice_type: 0,
            first_mb: 0,
            frame_num: 0,
            poc_lsb: 0,
            ref_idc: 3,
            body_len: 8,
        }
    }
}

/// Returns a slice NAL unit with a valid header and filler slice data.
pub(crate) fn slice(sps: &SpsConfig, cfg: &SliceConfig) -> Vec<u8> {
    let mut w = RbspWriter::new();
    w.ue(cfg.first_mb).unwrap();
    w.ue(cfg.slice_type).unwrap();
    w.ue(0).unwrap(); // pic_parameter_set_id
    w.u(4, cfg.frame_num).unwrap();
    if !sps.frame_mbs_only {
        w.flag(false).unwrap(); // field_pic_flag
    }
    if cfg.idr {
        w.ue(0).unwrap(); // idr_pic_id
    }
    if sps.poc_type == 0 {
        w.u(4, cfg.poc_lsb).unwrap();
    }
    for _ in 0..cfg.body_len {
        w.u(8, 0xa5).unwrap();
    }
    let nal_type = if cfg.idr { 5 } else { 1 };
    rbsp_to_nal((cfg.ref_idc << 5) | nal_type, &w.finish().unwrap())
}

/// Returns an SEI NAL unit holding the given `(payload_type, payload)` messages.
pub(crate) fn sei(messages: &[(u8, &[u8])]) -> Vec<u8> {
    let mut rbsp = Vec::new();
    for &(t, payload) in messages {
        rbsp.push(t);
        rbsp.push(u8::try_from(payload.len()).unwrap());
        rbsp.extend_from_slice(payload);
    }
    rbsp.push(0x80);
    rbsp_to_nal(0x06, &rbsp)
}

/// Splits NAL units into RTP packets of at most `mtu` payload bytes, using
/// single NAL unit packets where they fit and FU-A otherwise. The final
/// packet carries the marker bit.
pub(crate) fn packetize(seq: &mut u16, timestamp: u32, nals: &[&[u8]], mtu: usize) -> Vec<Bytes> {
    assert!(mtu > 2);
    let mut payloads: Vec<Vec<u8>> = Vec::new();
    for nal in nals {
        if nal.len() <= mtu {
            payloads.push(nal.to_vec());
            continue;
        }
        let indicator = (nal[0] & 0xe0) | 28;
        let chunks: Vec<&[u8]> = nal[1..].chunks(mtu - 2).collect();
        for (i, chunk) in chunks.iter().enumerate() {
            let mut fu_header = nal[0] & 0x1f;
            if i == 0 {
                fu_header |= 0x80;
            }
            if i == chunks.len() - 1 {
                fu_header |= 0x40;
            }
            let mut p = vec![indicator, fu_header];
            p.extend_from_slice(chunk);
            payloads.push(p);
        }
    }
    let n = payloads.len();
    payloads
        .into_iter()
        .enumerate()
        .map(|(i, p)| {
            let pkt = rtp_packet(*seq, timestamp, i == n - 1, &p);
            *seq = seq.wrapping_add(1);
            pkt
        })
        .collect()
}

pub(crate) fn rtp_packet(seq: u16, timestamp: u32, mark: bool, payload: &[u8]) -> Bytes {
    rtp_rs::RtpPacketBuilder::new()
        .payload_type(96)
        .ssrc(0x4cacc3d1)
        .sequence(seq.into())
        .timestamp(timestamp)
        .marked(mark)
        .payload(payload)
        .build()
        .unwrap()
        .into()
}

/// An access unit as seen by [`RecordingConsumer`].
#[derive(Debug)]
pub(crate) struct RecordedAu {
    pub(crate) data: Vec<u8>,
    pub(crate) buffer_id: u64,
    pub(crate) timestamp: i64,
    pub(crate) shifted_timestamp: Option<u64>,
    pub(crate) sync_type: SyncType,
    pub(crate) complete: bool,
    pub(crate) placeholder: bool,
    pub(crate) missing_packets: u32,
    pub(crate) metadata: Vec<u8>,
    pub(crate) user_data: Vec<u8>,
    pub(crate) macroblocks: Option<Vec<MacroblockStatus>>,
}

/// A consumer which hands out fresh buffers and remembers everything.
pub(crate) struct RecordingConsumer {
    /// Capacity of supplied buffers; 0 means exactly what was asked for.
    pub(crate) buffer_size: usize,
    pub(crate) refuse_buffers: bool,

    /// Indices of `au_ready` calls which answer `ResyncRequired`.
    pub(crate) resync_on: Vec<usize>,

    pub(crate) aus: Vec<RecordedAu>,
    pub(crate) params: Vec<(Vec<u8>, Vec<u8>)>,
    pub(crate) released: Vec<(u64, BufferRelease)>,
    next_id: u64,
}

impl RecordingConsumer {
    pub(crate) fn with_buffer_size(buffer_size: usize) -> Self {
        RecordingConsumer {
            buffer_size,
            refuse_buffers: false,
            resync_on: Vec::new(),
            aus: Vec::new(),
            params: Vec::new(),
            released: Vec::new(),
            next_id: 0,
        }
    }

    /// Buffers handed out and neither released nor delivered.
    pub(crate) fn outstanding(&self) -> usize {
        self.next_id as usize - self.released.len() - self.aus.len()
    }
}

impl Default for RecordingConsumer {
    fn default() -> Self {
        Self::with_buffer_size(0)
    }
}

impl Consumer for RecordingConsumer {
    fn request_buffer(&mut self, min_size: usize) -> Option<AuBuffer> {
        if self.refuse_buffers {
            return None;
        }
        let size = if self.buffer_size == 0 {
            min_size
        } else {
            self.buffer_size
        };
        let b = AuBuffer::new(size, self.next_id);
        self.next_id += 1;
        Some(b)
    }

    fn release_buffer(&mut self, buffer: AuBuffer, reason: BufferRelease) {
        self.released.push((buffer.id(), reason));
    }

    fn au_ready(&mut self, au: AccessUnit<'_>) -> Result<(), ConsumerError> {
        let i = self.aus.len();
        self.aus.push(RecordedAu {
            data: au.data().to_vec(),
            buffer_id: au.buffer().id(),
            timestamp: au.timestamp().timestamp(),
            shifted_timestamp: au.shifted_timestamp(),
            sync_type: au.sync_type(),
            complete: au.is_complete(),
            placeholder: au.is_placeholder(),
            missing_packets: au.missing_packets(),
            metadata: au.metadata().to_vec(),
            user_data: au.user_data().to_vec(),
            macroblocks: au.macroblocks().map(|g| g.as_slice().to_vec()),
        });
        if self.resync_on.contains(&i) {
            return Err(ConsumerError::ResyncRequired);
        }
        Ok(())
    }

    fn parameter_sets(&mut self, sps: &[u8], pps: &[u8]) -> Result<(), ConsumerError> {
        self.params.push((sps.to_vec(), pps.to_vec()));
        Ok(())
    }
}
