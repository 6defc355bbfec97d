// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Synthesis of concealment slices.
//!
//! Two kinds of slice are generated, both entropy-coded with CAVLC:
//!
//! *   a P slice in which every macroblock is `P_Skip`, used to replace lost
//!     slices so a decoder copies the co-located reference picture area
//!     instead of showing garbage;
//! *   an IDR slice of `I_16x16` DC-predicted macroblocks without residual,
//!     which decodes to flat mid-gray. It stands in as the first frame when a
//!     stream is joined mid-GOP.

use std::io;

use bitstream_io::{BigEndian, BitWrite, BitWriter};
use thiserror::Error;

use super::params::{PocInfo, PpsInfo, SpsInfo};
use super::slice::SliceHeader;

#[derive(Debug, Error)]
pub(crate) enum SynthError {
    #[error("CABAC entropy coding isn't supported")]
    Cabac,

    #[error("interlaced coding isn't supported")]
    Interlaced,

    #[error("slice groups (FMO) aren't supported")]
    SliceGroups,

    #[error("chroma format {0} isn't supported")]
    ChromaFormat(u32),

    #[error("skipped slices can't be placed in an IDR picture")]
    IdrPicture,

    #[error("reference slice header is incomplete")]
    IncompleteReference,

    #[error("macroblock range {first}+{count} is outside the picture")]
    OutOfRange { first: u32, count: u32 },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Writes RBSP syntax elements MSB-first.
pub(crate) struct RbspWriter {
    w: BitWriter<Vec<u8>, BigEndian>,
}

impl RbspWriter {
    pub(crate) fn new() -> Self {
        RbspWriter {
            w: BitWriter::endian(Vec::new(), BigEndian),
        }
    }

    /// `u(n)`: an unsigned value in `bits` bits.
    pub(crate) fn u(&mut self, bits: u32, value: u32) -> io::Result<()> {
        if bits == 0 {
            return Ok(());
        }
        self.w.write(bits, value)
    }

    pub(crate) fn flag(&mut self, value: bool) -> io::Result<()> {
        self.w.write_bit(value)
    }

    /// `ue(v)`: unsigned Exp-Golomb.
    pub(crate) fn ue(&mut self, value: u32) -> io::Result<()> {
        let x = u64::from(value) + 1;
        let bits = 64 - x.leading_zeros();
        if bits > 1 {
            self.w.write(bits - 1, 0u64)?;
        }
        self.w.write(bits, x)
    }

    /// `se(v)`: signed Exp-Golomb.
    pub(crate) fn se(&mut self, value: i32) -> io::Result<()> {
        let v = i64::from(value);
        let code = if v > 0 { 2 * v - 1 } else { -2 * v };
        let code = u32::try_from(code)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "se(v) out of range"))?;
        self.ue(code)
    }

    /// Appends `rbsp_trailing_bits()` and returns the RBSP.
    pub(crate) fn finish(mut self) -> io::Result<Vec<u8>> {
        self.w.write_bit(true)?;
        self.w.byte_align()?;
        Ok(self.w.into_writer())
    }
}

/// Prefixes `header` and inserts emulation prevention bytes.
pub(crate) fn rbsp_to_nal(header: u8, rbsp: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + rbsp.len() + rbsp.len() / 64);
    out.push(header);
    let mut zeros = 0;
    for &b in rbsp {
        if zeros >= 2 && b <= 3 {
            out.push(3);
            zeros = 0;
        }
        out.push(b);
        if b == 0 {
            zeros += 1;
        } else {
            zeros = 0;
        }
    }
    out
}

fn check_common(sps: &SpsInfo, pps: &PpsInfo) -> Result<(), SynthError> {
    if pps.entropy_coding_mode {
        return Err(SynthError::Cabac);
    }
    if !sps.frame_mbs_only {
        return Err(SynthError::Interlaced);
    }
    if pps.slice_groups {
        return Err(SynthError::SliceGroups);
    }
    if sps.separate_colour_plane {
        return Err(SynthError::ChromaFormat(sps.chroma_format_idc));
    }
    Ok(())
}

fn write_deblocking(w: &mut RbspWriter, pps: &PpsInfo) -> io::Result<()> {
    if pps.deblocking_filter_control_present {
        w.ue(0)?; // disable_deblocking_filter_idc
        w.se(0)?; // slice_alpha_c0_offset_div2
        w.se(0)?; // slice_beta_offset_div2
    }
    Ok(())
}

/// Builds a P slice NAL unit covering macroblocks `first_mb..first_mb + count`,
/// all skipped.
///
/// Picture-level header fields (frame number, picture order count) are copied
/// from `reference`, another slice of the same picture.
pub(crate) fn skipped_p_slice(
    sps: &SpsInfo,
    pps: &PpsInfo,
    reference: &SliceHeader,
    first_mb: u32,
    count: u32,
) -> Result<Vec<u8>, SynthError> {
    check_common(sps, pps)?;
    if reference.idr {
        return Err(SynthError::IdrPicture);
    }
    let Some(pic) = reference.picture.as_ref() else {
        return Err(SynthError::IncompleteReference);
    };
    if count == 0 || first_mb.saturating_add(count) > sps.total_mbs() {
        return Err(SynthError::OutOfRange { first: first_mb, count });
    }
    let mut w = RbspWriter::new();
    w.ue(first_mb)?;
    w.ue(0)?; // slice_type: P
    w.ue(pps.id)?;
    w.u(sps.frame_num_bits, pic.frame_num)?;
    match sps.poc {
        PocInfo::Type0 { lsb_bits } => {
            w.u(lsb_bits, pic.pic_order_cnt_lsb)?;
            if pps.bottom_field_pic_order_in_frame_present {
                w.se(pic.delta_pic_order_cnt_bottom)?;
            }
        }
        PocInfo::Type1 {
            delta_always_zero: false,
        } => {
            w.se(pic.delta_pic_order_cnt[0])?;
            if pps.bottom_field_pic_order_in_frame_present {
                w.se(pic.delta_pic_order_cnt[1])?;
            }
        }
        PocInfo::Type1 { .. } | PocInfo::Type2 => {}
    }
    if pps.redundant_pic_cnt_present {
        w.ue(0)?; // redundant_pic_cnt: primary picture
    }
    w.flag(false)?; // num_ref_idx_active_override_flag
    w.flag(false)?; // ref_pic_list_modification_flag_l0
    if pps.weighted_pred {
        let chroma = sps.chroma_array_type() != 0;
        w.ue(0)?; // luma_log2_weight_denom
        if chroma {
            w.ue(0)?; // chroma_log2_weight_denom
        }
        for _ in 0..=pps.num_ref_idx_l0_default_active_minus1 {
            w.flag(false)?; // luma_weight_l0_flag
            if chroma {
                w.flag(false)?; // chroma_weight_l0_flag
            }
        }
    }
    if reference.nal_ref_idc != 0 {
        w.flag(false)?; // adaptive_ref_pic_marking_mode_flag
    }
    w.se(0)?; // slice_qp_delta
    write_deblocking(&mut w, pps)?;

    // slice_data(): a single run covering every macroblock.
    w.ue(count)?; // mb_skip_run
    let rbsp = w.finish()?;
    Ok(rbsp_to_nal((reference.nal_ref_idc << 5) | 1, &rbsp))
}

/// Builds an IDR slice NAL unit covering the whole picture in flat gray.
pub(crate) fn gray_idr_slice(sps: &SpsInfo, pps: &PpsInfo) -> Result<Vec<u8>, SynthError> {
    check_common(sps, pps)?;
    let chroma = sps.chroma_array_type();
    if chroma > 2 {
        return Err(SynthError::ChromaFormat(chroma));
    }
    let mut w = RbspWriter::new();
    w.ue(0)?; // first_mb_in_slice
    w.ue(7)?; // slice_type: I, all slices
    w.ue(pps.id)?;
    w.u(sps.frame_num_bits, 0)?;
    w.ue(0)?; // idr_pic_id
    match sps.poc {
        PocInfo::Type0 { lsb_bits } => {
            w.u(lsb_bits, 0)?;
            if pps.bottom_field_pic_order_in_frame_present {
                w.se(0)?;
            }
        }
        PocInfo::Type1 {
            delta_always_zero: false,
        } => {
            w.se(0)?;
            if pps.bottom_field_pic_order_in_frame_present {
                w.se(0)?;
            }
        }
        PocInfo::Type1 { .. } | PocInfo::Type2 => {}
    }
    if pps.redundant_pic_cnt_present {
        w.ue(0)?;
    }
    w.flag(false)?; // no_output_of_prior_pics_flag
    w.flag(false)?; // long_term_reference_flag
    w.se(0)?; // slice_qp_delta
    write_deblocking(&mut w, pps)?;

    for _ in 0..sps.total_mbs() {
        w.ue(3)?; // mb_type: I_16x16_2_0_0 (DC prediction, no coded blocks)
        if chroma != 0 {
            w.ue(0)?; // intra_chroma_pred_mode: DC
        }
        w.se(0)?; // mb_qp_delta
        w.flag(true)?; // Intra16x16DCLevel coeff_token, nC=0: no coefficients
    }
    let rbsp = w.finish()?;
    Ok(rbsp_to_nal((3 << 5) | 5, &rbsp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::params::ParameterSetCache;
    use crate::codec::h264::slice::parse_slice_header;
    use crate::testutil::{pps, slice, sps, SliceConfig, SpsConfig};
    use bytes::Bytes;

    fn cache(cfg: &SpsConfig, cabac: bool) -> ParameterSetCache {
        let mut c = ParameterSetCache::new();
        c.put_sps(Bytes::from(sps(cfg))).unwrap();
        c.put_pps(Bytes::from(pps(cabac))).unwrap();
        c
    }

    #[test]
    fn exp_golomb() {
        let mut w = RbspWriter::new();
        w.ue(0).unwrap(); // 1
        w.ue(3).unwrap(); // 00100
        w.se(-1).unwrap(); // 011
        w.se(1).unwrap(); // 010
        // 1001 0001 1010 + stop bit 1 + 000
        assert_eq!(w.finish().unwrap(), vec![0b1001_0001, 0b1010_1000]);
    }

    #[test]
    fn emulation_prevention() {
        assert_eq!(
            rbsp_to_nal(0x41, &[0, 0, 1, 0, 0, 0, 0, 0, 4]),
            vec![0x41, 0, 0, 3, 1, 0, 0, 3, 0, 0, 3, 0, 4]
        );
    }

    #[test]
    fn skipped_slice_parses_back() {
        let cfg = SpsConfig {
            poc_type: 0,
            ..Default::default()
        };
        let c = cache(&cfg, false);
        let (sps, pps) = c.active().unwrap();
        let received = slice(
            &cfg,
            &SliceConfig {
                first_mb: 0,
                frame_num: 5,
                poc_lsb: 10,
                ..Default::default()
            },
        );
        let reference = parse_slice_header(&received, Some((sps, pps))).unwrap();
        let nal = skipped_p_slice(sps, pps, &reference, 400, 400).unwrap();
        assert_eq!(nal[0], 0x61);
        let parsed = parse_slice_header(&nal, Some((sps, pps))).unwrap();
        assert_eq!(parsed.first_mb, 400);
        assert!(!parsed.kind.is_intra());
        let pic = parsed.picture.unwrap();
        assert_eq!(pic.frame_num, 5);
        assert_eq!(pic.pic_order_cnt_lsb, 10);
    }

    #[test]
    fn skipped_slice_refusals() {
        let cfg = SpsConfig::default();
        let c = cache(&cfg, true);
        let (sps, pps) = c.active().unwrap();
        let received = slice(&cfg, &SliceConfig::default());
        let reference = parse_slice_header(&received, Some((sps, pps))).unwrap();
        assert!(matches!(
            skipped_p_slice(sps, pps, &reference, 0, 1),
            Err(SynthError::Cabac)
        ));

        let c = cache(&cfg, false);
        let (sps, pps) = c.active().unwrap();
        let idr = slice(
            &cfg,
            &SliceConfig {
                idr: true,
                ..Default::default()
            },
        );
        let reference = parse_slice_header(&idr, Some((sps, pps))).unwrap();
        assert!(matches!(
            skipped_p_slice(sps, pps, &reference, 0, 1),
            Err(SynthError::IdrPicture)
        ));
    }

    #[test]
    fn gray_idr() {
        let cfg = SpsConfig {
            mb_width: 2,
            mb_height: 2,
            ..Default::default()
        };
        let c = cache(&cfg, false);
        let (sps, pps) = c.active().unwrap();
        let nal = gray_idr_slice(sps, pps).unwrap();
        assert_eq!(nal[0], 0x65);
        let parsed = parse_slice_header(&nal, Some((sps, pps))).unwrap();
        assert!(parsed.idr);
        assert!(parsed.kind.is_intra());
        assert_eq!(parsed.first_mb, 0);

        // Header: 1 (first_mb) 0001000 (type 7) 1 (pps 0) 0000 (frame_num)
        // 1 (idr_pic_id) 00 (marking) 1 (qp delta) 111 (deblocking).
        // Each macroblock: 00100 1 1 1. Then the stop bit.
        assert_eq!(
            &nal[1..],
            &[
                0b1000_1000,
                0b1000_0100,
                0b1111_0010,
                0b0111_0010,
                0b0111_0010,
                0b0111_0010,
                0b0111_1000,
            ][..]
        );
    }

    #[test]
    fn gray_idr_refuses_444() {
        let cfg = SpsConfig {
            chroma_format_idc: 3,
            ..Default::default()
        };
        let c = cache(&cfg, false);
        let (sps, pps) = c.active().unwrap();
        assert!(matches!(
            gray_idr_slice(sps, pps),
            Err(SynthError::ChromaFormat(3))
        ));
    }
}
