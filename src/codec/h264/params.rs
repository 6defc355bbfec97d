// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Sequence and picture parameter set cache.
//!
//! Parsing is delegated to `h264_reader`; the handful of fields the rest of
//! the crate needs are copied into [`SpsInfo`] and [`PpsInfo`] right here so
//! that nothing else depends on `h264_reader`'s representation.

use base64::Engine as _;
use bytes::Bytes;
use h264_reader::nal::pps::PicParameterSet;
use h264_reader::nal::sps::{ChromaFormat, FrameMbsFlags, PicOrderCntType, SeqParameterSet};
use h264_reader::rbsp::{BitRead, BitReader, BitReaderError};
use log::{debug, warn};
use thiserror::Error;

/// `h264_reader::rbsp::BitRead` impl that *notes* extra trailing data rather than failing on it.
///
/// Some encoders pad parameter sets with a stray byte after the RBSP stop
/// bit. Decoders ignore it, so this does too.
#[derive(Debug)]
struct TolerantBitReader<'a, R> {
    inner: R,
    has_extra_trailing_data: &'a mut bool,
}

impl<R: BitRead> BitRead for TolerantBitReader<'_, R> {
    fn read_ue(&mut self, name: &'static str) -> Result<u32, BitReaderError> {
        self.inner.read_ue(name)
    }

    fn read_se(&mut self, name: &'static str) -> Result<i32, BitReaderError> {
        self.inner.read_se(name)
    }

    fn read_bool(&mut self, name: &'static str) -> Result<bool, BitReaderError> {
        self.inner.read_bool(name)
    }

    fn skip(&mut self, bit_count: u32, name: &'static str) -> Result<(), BitReaderError> {
        self.inner.skip(bit_count, name)
    }

    fn read<U: h264_reader::rbsp::Numeric>(
        &mut self,
        bit_count: u32,
        name: &'static str,
    ) -> Result<U, BitReaderError> {
        self.inner.read(bit_count, name)
    }

    fn read_to<V: h264_reader::rbsp::Primitive>(
        &mut self,
        name: &'static str,
    ) -> Result<V, BitReaderError> {
        self.inner.read_to(name)
    }

    fn has_more_rbsp_data(&mut self, name: &'static str) -> Result<bool, BitReaderError> {
        self.inner.has_more_rbsp_data(name)
    }

    fn finish_rbsp(self) -> Result<(), BitReaderError> {
        match self.inner.finish_rbsp() {
            Err(BitReaderError::RemainingData) => {
                *self.has_extra_trailing_data = true;
                Ok(())
            }
            r => r,
        }
    }

    fn finish_sei_payload(self) -> Result<(), BitReaderError> {
        self.inner.finish_sei_payload()
    }
}

#[derive(Debug, Error)]
pub(crate) enum ParamError {
    #[error("unable to decode {what} RBSP: {source}")]
    Rbsp {
        what: &'static str,
        source: std::io::Error,
    },

    #[error("unable to parse SPS: {0:?}")]
    Sps(h264_reader::nal::sps::SpsError),

    #[error("unable to parse PPS: {0:?}")]
    Pps(h264_reader::nal::pps::PpsError),

    #[error("PPS references SPS {wanted} but the active SPS is {active:?}")]
    WrongSps { wanted: u32, active: Option<u32> },

    #[error("bad sprop-parameter-sets: {0}")]
    Sprop(String),
}

/// Picture order count fields that appear in slice headers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum PocInfo {
    Type0 { lsb_bits: u32 },
    Type1 { delta_always_zero: bool },
    Type2,
}

/// Fields of the active sequence parameter set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct SpsInfo {
    pub(crate) id: u32,
    pub(crate) mb_width: u32,

    /// Height of a frame in macroblocks (not map units).
    pub(crate) mb_height: u32,
    pub(crate) frame_mbs_only: bool,
    pub(crate) frame_num_bits: u32,
    pub(crate) poc: PocInfo,

    /// `chroma_format_idc`: 0 for monochrome, 1 for 4:2:0, 2 for 4:2:2, 3 for 4:4:4.
    pub(crate) chroma_format_idc: u32,
    pub(crate) separate_colour_plane: bool,
    pub(crate) pixel_dimensions: (u32, u32),
}

impl SpsInfo {
    fn from_sps(sps: &SeqParameterSet) -> Self {
        let frame_mbs_only = matches!(sps.frame_mbs_flags, FrameMbsFlags::Frames);
        let mb_width = sps.pic_width_in_mbs_minus1 + 1;
        let map_units = sps.pic_height_in_map_units_minus1 + 1;
        let mb_height = if frame_mbs_only {
            map_units
        } else {
            map_units * 2
        };
        let poc = match &sps.pic_order_cnt {
            PicOrderCntType::TypeZero {
                log2_max_pic_order_cnt_lsb_minus4,
            } => PocInfo::Type0 {
                lsb_bits: u32::from(*log2_max_pic_order_cnt_lsb_minus4) + 4,
            },
            PicOrderCntType::TypeOne {
                delta_pic_order_always_zero_flag,
                ..
            } => PocInfo::Type1 {
                delta_always_zero: *delta_pic_order_always_zero_flag,
            },
            PicOrderCntType::TypeTwo => PocInfo::Type2,
        };
        let chroma_format_idc = match sps.chroma_info.chroma_format {
            ChromaFormat::Monochrome => 0,
            ChromaFormat::YUV420 => 1,
            ChromaFormat::YUV422 => 2,
            ChromaFormat::YUV444 => 3,
            ChromaFormat::Invalid(v) => v,
        };
        let pixel_dimensions = sps
            .pixel_dimensions()
            .unwrap_or((mb_width * 16, mb_height * 16));
        SpsInfo {
            id: u32::from(sps.seq_parameter_set_id.id()),
            mb_width,
            mb_height,
            frame_mbs_only,
            frame_num_bits: u32::from(sps.log2_max_frame_num_minus4) + 4,
            poc,
            chroma_format_idc,
            separate_colour_plane: sps.chroma_info.separate_colour_plane_flag,
            pixel_dimensions,
        }
    }

    /// `ChromaArrayType` as defined in H.264 section 7.4.2.1.1.
    pub(crate) fn chroma_array_type(&self) -> u32 {
        if self.separate_colour_plane {
            0
        } else {
            self.chroma_format_idc
        }
    }

    pub(crate) fn total_mbs(&self) -> u32 {
        self.mb_width * self.mb_height
    }
}

/// Fields of the active picture parameter set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct PpsInfo {
    pub(crate) id: u32,
    pub(crate) sps_id: u32,
    pub(crate) entropy_coding_mode: bool,
    pub(crate) bottom_field_pic_order_in_frame_present: bool,
    pub(crate) slice_groups: bool,
    pub(crate) num_ref_idx_l0_default_active_minus1: u32,
    pub(crate) weighted_pred: bool,
    pub(crate) deblocking_filter_control_present: bool,
    pub(crate) redundant_pic_cnt_present: bool,
}

impl PpsInfo {
    fn from_pps(pps: &PicParameterSet) -> Self {
        PpsInfo {
            id: u32::from(pps.pic_parameter_set_id.id()),
            sps_id: u32::from(pps.seq_parameter_set_id.id()),
            entropy_coding_mode: pps.entropy_coding_mode_flag,
            bottom_field_pic_order_in_frame_present: pps
                .bottom_field_pic_order_in_frame_present_flag,
            slice_groups: pps.slice_groups.is_some(),
            num_ref_idx_l0_default_active_minus1: pps.num_ref_idx_l0_default_active_minus1,
            weighted_pred: pps.weighted_pred_flag,
            deblocking_filter_control_present: pps.deblocking_filter_control_present_flag,
            redundant_pic_cnt_present: pps.redundant_pic_cnt_present_flag,
        }
    }
}

/// The active parameter sets, as handed to applications.
#[derive(Clone, PartialEq, Eq)]
pub struct ParameterSets {
    sps: Bytes,
    pps: Bytes,
    pixel_dimensions: (u32, u32),
    mb_dimensions: (u32, u32),
}

impl ParameterSets {
    /// The SPS NAL unit, starting with its header byte, without a start code.
    pub fn sps(&self) -> &[u8] {
        &self.sps
    }

    /// The PPS NAL unit, starting with its header byte, without a start code.
    pub fn pps(&self) -> &[u8] {
        &self.pps
    }

    /// Returns (width, height) in pixels, after cropping.
    pub fn pixel_dimensions(&self) -> (u32, u32) {
        self.pixel_dimensions
    }

    /// Returns (width, height) in macroblocks.
    pub fn mb_dimensions(&self) -> (u32, u32) {
        self.mb_dimensions
    }
}

impl std::fmt::Debug for ParameterSets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterSets")
            .field("pixel_dimensions", &self.pixel_dimensions)
            .field("mb_dimensions", &self.mb_dimensions)
            .field("sps", &crate::hex::LimitedHex::new(&self.sps, 32))
            .field("pps", &crate::hex::LimitedHex::new(&self.pps, 32))
            .finish()
    }
}

/// What storing a new SPS did.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum SpsChange {
    /// Byte-identical to the active one.
    Unchanged,

    /// New or different. `resized` is true if the macroblock dimensions differ
    /// from the previous SPS (or there was none).
    Replaced { resized: bool },
}

#[derive(Debug)]
struct ActiveSps {
    nal: Bytes,
    info: SpsInfo,
    parsed: SeqParameterSet,
}

/// Holds at most one SPS and one PPS: the most recently received of each.
///
/// Single-slot replacement matches what live encoders do: one SPS/PPS pair,
/// repeated before each IDR and replaced wholesale on a configuration change.
#[derive(Debug, Default)]
pub(crate) struct ParameterSetCache {
    sps: Option<ActiveSps>,
    pps: Option<(Bytes, PpsInfo)>,

    /// A PPS received before the SPS it refers to; retried when an SPS arrives.
    orphan_pps: Option<Bytes>,
}

impl ParameterSetCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Seeds the cache from an SDP `sprop-parameter-sets` value: comma-separated
    /// base64 NAL units.
    pub(crate) fn put_sprop(&mut self, sprop: &str) -> Result<(), ParamError> {
        for nal in sprop.split(',') {
            let nal = base64::engine::general_purpose::STANDARD
                .decode(nal.trim())
                .map_err(|e| ParamError::Sprop(format!("bad base64 {:?}: {}", nal, e)))?;

            // Some senders include a trailing start code; strip it.
            let nal = nal
                .strip_suffix(b"\x00\x00\x00\x01")
                .map(<[u8]>::to_vec)
                .unwrap_or(nal);
            let Some(&header) = nal.first() else {
                return Err(ParamError::Sprop("empty NAL".into()));
            };
            match header & 0x1f {
                7 => {
                    self.put_sps(Bytes::from(nal))?;
                }
                8 => {
                    self.put_pps(Bytes::from(nal))?;
                }
                t => debug!("ignoring sprop-parameter-sets NAL of type {}", t),
            }
        }
        Ok(())
    }

    /// Stores an SPS NAL unit (starting with the header byte).
    pub(crate) fn put_sps(&mut self, nal: Bytes) -> Result<SpsChange, ParamError> {
        if matches!(&self.sps, Some(s) if s.nal == nal) {
            return Ok(SpsChange::Unchanged);
        }
        let rbsp = h264_reader::rbsp::decode_nal(&nal).map_err(|source| ParamError::Rbsp {
            what: "SPS",
            source,
        })?;
        let mut extra = false;
        let parsed = SeqParameterSet::from_bits(TolerantBitReader {
            inner: BitReader::new(&*rbsp),
            has_extra_trailing_data: &mut extra,
        })
        .map_err(ParamError::Sps)?;
        if extra {
            warn!("SPS has extra trailing data");
        }
        let info = SpsInfo::from_sps(&parsed);
        let resized = match &self.sps {
            Some(old) => {
                (old.info.mb_width, old.info.mb_height) != (info.mb_width, info.mb_height)
            }
            None => true,
        };
        debug!("new SPS: {:?}", &info);
        self.sps = Some(ActiveSps { nal, info, parsed });

        // A PPS parsed against the old SPS may no longer be valid against the new one.
        if let Some((pps, _)) = self.pps.take() {
            self.orphan_pps = Some(pps);
        }
        if let Some(pps) = self.orphan_pps.take() {
            if let Err(e) = self.put_pps(pps) {
                debug!("dropping PPS which doesn't match the new SPS: {}", e);
            }
        }
        Ok(SpsChange::Replaced { resized })
    }

    /// Stores a PPS NAL unit (starting with the header byte). Returns true if
    /// it differs from the active one.
    pub(crate) fn put_pps(&mut self, nal: Bytes) -> Result<bool, ParamError> {
        if matches!(&self.pps, Some((p, _)) if *p == nal) {
            return Ok(false);
        }
        let Some(sps) = self.sps.as_ref() else {
            self.orphan_pps = Some(nal);
            return Ok(false);
        };
        let rbsp = h264_reader::rbsp::decode_nal(&nal).map_err(|source| ParamError::Rbsp {
            what: "PPS",
            source,
        })?;
        let wanted = pps_sps_id(&rbsp);
        if wanted != Some(sps.info.id) {
            self.orphan_pps = Some(nal);
            return Err(ParamError::WrongSps {
                wanted: wanted.unwrap_or(u32::MAX),
                active: Some(sps.info.id),
            });
        }
        let mut ctx = h264_reader::Context::default();
        ctx.put_seq_param_set(sps.parsed.clone());
        let mut extra = false;
        let parsed = PicParameterSet::from_bits(
            &ctx,
            TolerantBitReader {
                inner: BitReader::new(&*rbsp),
                has_extra_trailing_data: &mut extra,
            },
        )
        .map_err(ParamError::Pps)?;
        if extra {
            warn!("PPS has extra trailing data");
        }
        let info = PpsInfo::from_pps(&parsed);
        debug!("new PPS: {:?}", &info);
        self.pps = Some((nal, info));
        Ok(true)
    }

    /// True once both an SPS and a PPS which refers to it are present.
    pub(crate) fn is_synchronized(&self) -> bool {
        self.sps.is_some() && self.pps.is_some()
    }

    pub(crate) fn sps(&self) -> Option<&SpsInfo> {
        self.sps.as_ref().map(|s| &s.info)
    }

    pub(crate) fn pps(&self) -> Option<&PpsInfo> {
        self.pps.as_ref().map(|(_, p)| p)
    }

    pub(crate) fn sps_nal(&self) -> Option<&Bytes> {
        self.sps.as_ref().map(|s| &s.nal)
    }

    pub(crate) fn pps_nal(&self) -> Option<&Bytes> {
        self.pps.as_ref().map(|(n, _)| n)
    }

    /// Returns the SPS and PPS together if synchronized.
    pub(crate) fn active(&self) -> Option<(&SpsInfo, &PpsInfo)> {
        Some((self.sps()?, self.pps()?))
    }

    pub(crate) fn to_parameter_sets(&self) -> Option<ParameterSets> {
        let sps = self.sps.as_ref()?;
        let (pps, _) = self.pps.as_ref()?;
        Some(ParameterSets {
            sps: sps.nal.clone(),
            pps: pps.clone(),
            pixel_dimensions: sps.info.pixel_dimensions,
            mb_dimensions: (sps.info.mb_width, sps.info.mb_height),
        })
    }

    pub(crate) fn clear(&mut self) {
        self.sps = None;
        self.pps = None;
        self.orphan_pps = None;
    }
}

/// Reads `seq_parameter_set_id` from a PPS RBSP, for error messages.
fn pps_sps_id(rbsp: &[u8]) -> Option<u32> {
    let mut r = BitReader::new(rbsp);
    r.read_ue("pic_parameter_set_id").ok()?;
    r.read_ue("seq_parameter_set_id").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{pps, sps, SpsConfig};

    #[test]
    fn sps_then_pps() {
        let mut c = ParameterSetCache::new();
        assert!(!c.is_synchronized());
        let change = c.put_sps(Bytes::from(sps(&SpsConfig::default()))).unwrap();
        assert_eq!(change, SpsChange::Replaced { resized: true });
        assert!(!c.is_synchronized());
        assert!(c.put_pps(Bytes::from(pps(false))).unwrap());
        assert!(c.is_synchronized());
        let info = c.sps().unwrap();
        assert_eq!((info.mb_width, info.mb_height), (40, 30));
        assert_eq!(info.pixel_dimensions, (640, 480));
        assert_eq!(info.poc, PocInfo::Type2);
        assert_eq!(info.chroma_array_type(), 1);
        assert!(!c.pps().unwrap().entropy_coding_mode);
        let p = c.to_parameter_sets().unwrap();
        assert_eq!(p.mb_dimensions(), (40, 30));

        // Repeats are no-ops.
        assert_eq!(
            c.put_sps(Bytes::from(sps(&SpsConfig::default()))).unwrap(),
            SpsChange::Unchanged
        );
        assert!(!c.put_pps(Bytes::from(pps(false))).unwrap());
    }

    #[test]
    fn pps_before_sps() {
        let mut c = ParameterSetCache::new();
        assert!(!c.put_pps(Bytes::from(pps(false))).unwrap());
        assert!(!c.is_synchronized());
        c.put_sps(Bytes::from(sps(&SpsConfig::default()))).unwrap();
        assert!(c.is_synchronized());
    }

    #[test]
    fn resize() {
        let mut c = ParameterSetCache::new();
        c.put_sps(Bytes::from(sps(&SpsConfig::default()))).unwrap();
        c.put_pps(Bytes::from(pps(false))).unwrap();
        let change = c
            .put_sps(Bytes::from(sps(&SpsConfig {
                mb_width: 20,
                mb_height: 15,
                ..Default::default()
            })))
            .unwrap();
        assert_eq!(change, SpsChange::Replaced { resized: true });
        assert_eq!(c.sps().unwrap().total_mbs(), 300);

        // The PPS still refers to SPS 0, so it's re-parsed and kept.
        assert!(c.is_synchronized());
    }

    #[test]
    fn sprop() {
        let sps = sps(&SpsConfig::default());
        let pps = pps(true);
        let engine = base64::engine::general_purpose::STANDARD;
        let mut sps_with_start_code = sps.clone();
        sps_with_start_code.extend_from_slice(b"\x00\x00\x00\x01");
        let sprop = format!(
            "{},{}",
            engine.encode(&sps_with_start_code),
            engine.encode(&pps)
        );
        let mut c = ParameterSetCache::new();
        c.put_sprop(&sprop).unwrap();
        assert!(c.is_synchronized());
        assert_eq!(&c.sps_nal().unwrap()[..], &sps[..]);
        assert!(c.pps().unwrap().entropy_coding_mode);

        ParameterSetCache::new().put_sprop("not base64!").unwrap_err();
    }

    #[test]
    fn garbage_sps() {
        let mut c = ParameterSetCache::new();
        c.put_sps(Bytes::from_static(b"\x67")).unwrap_err();
        assert!(c.sps().is_none());
    }
}
