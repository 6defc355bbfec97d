// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration, fixed when the receiver is constructed.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroU32;
use std::time::Duration;

use crate::error::ErrorInt;
use crate::Error;

/// What to do with cached parameter sets when the consumer asks for
/// resynchronization.
///
/// Either way, output stops until the next synchronization point (an IDR,
/// an I-frame or the start of a periodic intra refresh).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ResyncPolicy {
    /// Keep the SPS and PPS.
    #[default]
    KeepParameterSets,

    /// Forget the SPS and PPS, so that a new pair must arrive in-band.
    DropParameterSets,
}

impl std::fmt::Display for ResyncPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResyncPolicy::KeepParameterSets => f.pad("keep"),
            ResyncPolicy::DropParameterSets => f.pad("drop"),
        }
    }
}

impl std::str::FromStr for ResyncPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "keep" => ResyncPolicy::KeepParameterSets,
            "drop" => ResyncPolicy::DropParameterSets,
            _ => bail!(ErrorInt::InvalidArgument(format!(
                "resync policy {s:?} not understood"
            ))),
        })
    }
}

/// Controls which access units reach the consumer and in what form.
#[derive(Clone, Debug)]
pub struct FilterOptions {
    pub(crate) wait_for_sync: bool,
    pub(crate) output_incomplete_au: bool,
    pub(crate) filter_out_sps_pps: bool,
    pub(crate) filter_out_sei: bool,
    pub(crate) replace_start_codes_with_nalu_size: bool,
    pub(crate) generate_skipped_p_slices: bool,
    pub(crate) generate_first_gray_i_frame: bool,
    pub(crate) resync_policy: ResyncPolicy,
    pub(crate) pir_start_on_recovery_point: bool,
    pub(crate) initial_buffer_size: usize,
    pub(crate) sprop_parameter_sets: Option<String>,
}

impl Default for FilterOptions {
    fn default() -> Self {
        FilterOptions {
            wait_for_sync: false,
            output_incomplete_au: false,
            filter_out_sps_pps: false,
            filter_out_sei: false,
            replace_start_codes_with_nalu_size: false,
            generate_skipped_p_slices: false,
            generate_first_gray_i_frame: false,
            resync_policy: ResyncPolicy::default(),
            pir_start_on_recovery_point: true,
            initial_buffer_size: 256 * 1024,
            sprop_parameter_sets: None,
        }
    }
}

impl FilterOptions {
    /// Suppresses output until an SPS and a PPS are known and a
    /// synchronization point arrives.
    pub fn wait_for_sync(self, wait_for_sync: bool) -> Self {
        Self {
            wait_for_sync,
            ..self
        }
    }

    /// Delivers access units with missing data, flagged as incomplete,
    /// instead of dropping them.
    pub fn output_incomplete_au(self, output_incomplete_au: bool) -> Self {
        Self {
            output_incomplete_au,
            ..self
        }
    }

    /// Leaves SPS and PPS NAL units out of access units. They're still
    /// parsed, and delivered through [`crate::Consumer::parameter_sets`].
    pub fn filter_out_sps_pps(self, filter_out_sps_pps: bool) -> Self {
        Self {
            filter_out_sps_pps,
            ..self
        }
    }

    /// Leaves SEI NAL units out of access units. User data is still
    /// extracted.
    pub fn filter_out_sei(self, filter_out_sei: bool) -> Self {
        Self {
            filter_out_sei,
            ..self
        }
    }

    /// Prefixes each NAL unit with its 4-byte big-endian length (as in
    /// `avcC`-style framing) rather than an Annex B start code.
    pub fn replace_start_codes_with_nalu_size(self, v: bool) -> Self {
        Self {
            replace_start_codes_with_nalu_size: v,
            ..self
        }
    }

    /// Replaces lost slices of P pictures with slices of skipped macroblocks.
    pub fn generate_skipped_p_slices(self, generate_skipped_p_slices: bool) -> Self {
        Self {
            generate_skipped_p_slices,
            ..self
        }
    }

    /// Emits a gray IDR picture as soon as synchronization is gained, before
    /// the first real access unit. Requires [`FilterOptions::wait_for_sync`].
    pub fn generate_first_gray_i_frame(self, generate_first_gray_i_frame: bool) -> Self {
        Self {
            generate_first_gray_i_frame,
            ..self
        }
    }

    pub fn resync_policy(self, resync_policy: ResyncPolicy) -> Self {
        Self {
            resync_policy,
            ..self
        }
    }

    /// Classifies an access unit carrying a recovery point SEI message as the
    /// start of a periodic intra refresh. Enabled by default.
    pub fn pir_start_on_recovery_point(self, pir_start_on_recovery_point: bool) -> Self {
        Self {
            pir_start_on_recovery_point,
            ..self
        }
    }

    /// Size hint for the first buffer requested for each access unit.
    pub fn initial_buffer_size(self, initial_buffer_size: usize) -> Self {
        Self {
            initial_buffer_size,
            ..self
        }
    }

    /// Seeds the parameter sets from an SDP `sprop-parameter-sets` value:
    /// comma-separated base64 NAL units.
    pub fn sprop_parameter_sets(self, sprop: impl Into<String>) -> Self {
        Self {
            sprop_parameter_sets: Some(sprop.into()),
            ..self
        }
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.generate_first_gray_i_frame && !self.wait_for_sync {
            bail!(ErrorInt::InvalidArgument(
                "generate_first_gray_i_frame requires wait_for_sync".to_owned()
            ));
        }
        if self.initial_buffer_size == 0 {
            bail!(ErrorInt::InvalidArgument(
                "initial_buffer_size must be positive".to_owned()
            ));
        }
        Ok(())
    }
}

/// Controls RTP reception.
#[derive(Clone, Debug)]
pub struct ReceiverOptions {
    pub(crate) payload_type: Option<u8>,
    pub(crate) reorder_window: usize,
    pub(crate) max_packet_size: usize,
    pub(crate) monitoring_capacity: usize,
    pub(crate) monitoring_retention: Duration,
    pub(crate) max_forward_jump_secs: Option<NonZeroU32>,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        ReceiverOptions {
            payload_type: None,
            reorder_window: 0,
            max_packet_size: 1500,
            monitoring_capacity: 8192,
            monitoring_retention: Duration::from_secs(60),
            max_forward_jump_secs: None,
        }
    }
}

impl ReceiverOptions {
    /// Drops packets with any other RTP payload type.
    pub fn payload_type(self, payload_type: u8) -> Self {
        Self {
            payload_type: Some(payload_type),
            ..self
        }
    }

    /// Holds up to this many packets to restore order. With the default of
    /// 0, packets are processed immediately and late ones are dropped.
    pub fn reorder_window(self, reorder_window: usize) -> Self {
        Self {
            reorder_window,
            ..self
        }
    }

    /// Size of the receive buffer; larger datagrams are truncated and
    /// therefore malformed.
    pub fn max_packet_size(self, max_packet_size: usize) -> Self {
        Self {
            max_packet_size,
            ..self
        }
    }

    /// Bounds the monitoring ring by sample count and age.
    pub fn monitoring(self, capacity: usize, retention: Duration) -> Self {
        Self {
            monitoring_capacity: capacity,
            monitoring_retention: retention,
            ..self
        }
    }

    /// Rejects packets whose timestamps jump forward by more than `secs`.
    ///
    /// By default, no enforcement is done.
    pub fn enforce_timestamps_with_max_jump_secs(self, secs: NonZeroU32) -> Self {
        Self {
            max_forward_jump_secs: Some(secs),
            ..self
        }
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.max_packet_size < 12 {
            bail!(ErrorInt::InvalidArgument(format!(
                "max_packet_size {} can't hold an RTP header",
                self.max_packet_size
            )));
        }
        Ok(())
    }
}

/// Where to receive.
#[derive(Clone, Debug)]
pub struct NetConfig {
    pub(crate) bind: SocketAddr,
    pub(crate) multicast: Option<(Ipv4Addr, Ipv4Addr)>,
}

impl NetConfig {
    pub fn new(bind: SocketAddr) -> Self {
        NetConfig {
            bind,
            multicast: None,
        }
    }

    /// Joins IPv4 multicast `group` on the interface with address
    /// `interface` (unspecified for the default).
    pub fn multicast(self, group: Ipv4Addr, interface: Ipv4Addr) -> Self {
        Self {
            multicast: Some((group, interface)),
            ..self
        }
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if let Some((group, _)) = self.multicast {
            if !group.is_multicast() {
                bail!(ErrorInt::InvalidArgument(format!(
                    "{group} is not a multicast address"
                )));
            }
            if !matches!(self.bind.ip(), IpAddr::V4(_)) {
                bail!(ErrorInt::InvalidArgument(format!(
                    "IPv4 multicast requires an IPv4 bind address, not {}",
                    self.bind
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gray_requires_wait_for_sync() {
        let o = FilterOptions::default().generate_first_gray_i_frame(true);
        assert!(o.validate().unwrap_err().is_invalid_argument());
        let o = o.wait_for_sync(true);
        o.validate().unwrap();
    }

    #[test]
    fn resync_policy_str() {
        for p in [ResyncPolicy::KeepParameterSets, ResyncPolicy::DropParameterSets] {
            assert_eq!(p.to_string().parse::<ResyncPolicy>().unwrap(), p);
        }
        assert!("sometimes".parse::<ResyncPolicy>().is_err());
    }

    #[test]
    fn net_config() {
        let bind: SocketAddr = "0.0.0.0:5004".parse().unwrap();
        NetConfig::new(bind)
            .multicast(Ipv4Addr::new(239, 1, 2, 3), Ipv4Addr::UNSPECIFIED)
            .validate()
            .unwrap();
        assert!(NetConfig::new(bind)
            .multicast(Ipv4Addr::new(10, 1, 2, 3), Ipv4Addr::UNSPECIFIED)
            .validate()
            .unwrap_err()
            .is_invalid_argument());
        assert!(ReceiverOptions::default()
            .max_packet_size(4)
            .validate()
            .unwrap_err()
            .is_invalid_argument());
    }
}
