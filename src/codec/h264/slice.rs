// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Slice header and SEI inspection.

use h264_reader::nal::{NalHeader, UnitType};
use h264_reader::rbsp::{BitRead, BitReader, BitReaderError, ByteReader};
use thiserror::Error;

use super::params::{PocInfo, PpsInfo, SpsInfo};

#[derive(Debug, Error)]
pub(crate) enum SliceError {
    #[error("not a slice NAL unit")]
    NotASlice,

    #[error("bad NAL header")]
    NalHeader,

    #[error("invalid slice_type {0}")]
    SliceType(u32),

    #[error("error reading slice header: {0:?}")]
    BitReader(BitReaderError),

    #[error("unable to decode SEI RBSP: {0}")]
    Rbsp(std::io::Error),

    #[error("truncated SEI message")]
    TruncatedSei,
}

impl From<BitReaderError> for SliceError {
    fn from(e: BitReaderError) -> Self {
        SliceError::BitReader(e)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum SliceKind {
    P,
    B,
    I,
    Sp,
    Si,
}

impl SliceKind {
    fn from_slice_type(t: u32) -> Result<Self, SliceError> {
        Ok(match t % 5 {
            0 if t <= 9 => SliceKind::P,
            1 if t <= 9 => SliceKind::B,
            2 if t <= 9 => SliceKind::I,
            3 if t <= 9 => SliceKind::Sp,
            4 if t <= 9 => SliceKind::Si,
            _ => return Err(SliceError::SliceType(t)),
        })
    }

    pub(crate) fn is_intra(self) -> bool {
        matches!(self, SliceKind::I | SliceKind::Si)
    }
}

/// Picture-level fields, shared by every slice of a picture.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct PictureFields {
    pub(crate) frame_num: u32,
    pub(crate) field_pic: bool,
    pub(crate) idr_pic_id: Option<u32>,
    pub(crate) pic_order_cnt_lsb: u32,
    pub(crate) delta_pic_order_cnt_bottom: i32,
    pub(crate) delta_pic_order_cnt: [i32; 2],
}

/// The leading fields of a slice header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct SliceHeader {
    pub(crate) first_mb: u32,
    pub(crate) kind: SliceKind,
    pub(crate) pps_id: u32,
    pub(crate) idr: bool,
    pub(crate) nal_ref_idc: u8,

    /// Present only if the active parameter sets were supplied and match.
    pub(crate) picture: Option<PictureFields>,
}

/// Parses a slice header through the picture-level fields.
///
/// `nal` starts with the NAL header byte and may contain emulation
/// prevention bytes. Without parameter sets (or with a PPS id that doesn't
/// match), only `first_mb_in_slice`, `slice_type` and `pic_parameter_set_id`
/// are read.
pub(crate) fn parse_slice_header(
    nal: &[u8],
    params: Option<(&SpsInfo, &PpsInfo)>,
) -> Result<SliceHeader, SliceError> {
    let hdr = NalHeader::new(*nal.first().ok_or(SliceError::NalHeader)?)
        .map_err(|_| SliceError::NalHeader)?;
    let idr = match hdr.nal_unit_type() {
        UnitType::SliceLayerWithoutPartitioningIdr => true,
        UnitType::SliceLayerWithoutPartitioningNonIdr => false,
        _ => return Err(SliceError::NotASlice),
    };
    let mut r = BitReader::new(ByteReader::skipping_h264_header(nal));
    let first_mb = r.read_ue("first_mb_in_slice")?;
    let kind = SliceKind::from_slice_type(r.read_ue("slice_type")?)?;
    let pps_id = r.read_ue("pic_parameter_set_id")?;
    let mut header = SliceHeader {
        first_mb,
        kind,
        pps_id,
        idr,
        nal_ref_idc: hdr.nal_ref_idc(),
        picture: None,
    };
    let Some((sps, pps)) = params else {
        return Ok(header);
    };
    if pps.id != pps_id {
        return Ok(header);
    }
    let mut pic = PictureFields::default();
    if sps.separate_colour_plane {
        r.skip(2, "colour_plane_id")?;
    }
    pic.frame_num = r.read(sps.frame_num_bits, "frame_num")?;
    if !sps.frame_mbs_only {
        pic.field_pic = r.read_bool("field_pic_flag")?;
        if pic.field_pic {
            r.skip(1, "bottom_field_flag")?;
        }
    }
    if idr {
        pic.idr_pic_id = Some(r.read_ue("idr_pic_id")?);
    }
    match sps.poc {
        PocInfo::Type0 { lsb_bits } => {
            pic.pic_order_cnt_lsb = r.read(lsb_bits, "pic_order_cnt_lsb")?;
            if pps.bottom_field_pic_order_in_frame_present && !pic.field_pic {
                pic.delta_pic_order_cnt_bottom = r.read_se("delta_pic_order_cnt_bottom")?;
            }
        }
        PocInfo::Type1 {
            delta_always_zero: false,
        } => {
            pic.delta_pic_order_cnt[0] = r.read_se("delta_pic_order_cnt[0]")?;
            if pps.bottom_field_pic_order_in_frame_present && !pic.field_pic {
                pic.delta_pic_order_cnt[1] = r.read_se("delta_pic_order_cnt[1]")?;
            }
        }
        PocInfo::Type1 { .. } | PocInfo::Type2 => {}
    }
    header.picture = Some(pic);
    Ok(header)
}

/// What an SEI NAL unit says that matters downstream.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct SeiSummary {
    /// A recovery point message is present, marking the start of a
    /// progressive intra refresh.
    pub(crate) recovery_point: bool,
}

const SEI_USER_DATA_UNREGISTERED: u32 = 5;
const SEI_RECOVERY_POINT: u32 = 6;

/// Walks the messages of an SEI NAL unit (starting with its header byte).
///
/// Each user-data-unregistered payload (UUID followed by data) is appended to
/// `user_data`.
pub(crate) fn scan_sei(nal: &[u8], user_data: &mut Vec<u8>) -> Result<SeiSummary, SliceError> {
    let rbsp = h264_reader::rbsp::decode_nal(nal).map_err(SliceError::Rbsp)?;
    let mut data = &rbsp[..];
    let mut summary = SeiSummary::default();
    loop {
        // Stop at rbsp_trailing_bits.
        if matches!(data, [] | [0x80]) {
            return Ok(summary);
        }
        let payload_type = read_sei_varint(&mut data)?;
        let payload_size = read_sei_varint(&mut data)? as usize;
        if data.len() < payload_size {
            return Err(SliceError::TruncatedSei);
        }
        let (payload, rest) = data.split_at(payload_size);
        data = rest;
        match payload_type {
            SEI_USER_DATA_UNREGISTERED => user_data.extend_from_slice(payload),
            SEI_RECOVERY_POINT => summary.recovery_point = true,
            _ => {}
        }
    }
}

/// Reads a `payloadType` or `payloadSize`: a run of 0xFF bytes plus a final byte.
fn read_sei_varint(data: &mut &[u8]) -> Result<u32, SliceError> {
    let mut v = 0u32;
    loop {
        let (&b, rest) = data.split_first().ok_or(SliceError::TruncatedSei)?;
        *data = rest;
        v = v.saturating_add(u32::from(b));
        if b != 0xff {
            return Ok(v);
        }
    }
}
