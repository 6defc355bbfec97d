// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Codec-specific logic: RTP depacketization and bitstream inspection.
//!
//! Only [H.264](h264) is supported.

pub mod h264;
