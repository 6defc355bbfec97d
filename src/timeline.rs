// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Extension of wrapping 32-bit RTP timestamps onto a 64-bit timeline.

use std::num::{NonZeroI32, NonZeroU32};

use crate::Timestamp;

/// Creates [Timestamp]s (which don't wrap) from 32-bit RTP timestamps.
///
/// Each timestamp is placed relative to the newest one seen so far, using the
/// signed 32-bit difference. Backward steps are always allowed: they happen
/// legitimately with reordered or stray packets and are sorted out by the
/// access unit assembler. Forward jumps can optionally be bounded.
#[derive(Debug)]
pub struct Timeline {
    /// The newest timestamp placed so far, or `None` before the first packet.
    newest: Option<i64>,
    clock_rate: NonZeroU32,

    /// The maximum forward jump to allow, in clock rate units.
    max_forward_jump: Option<NonZeroI32>,

    /// The same in seconds, for logging.
    max_forward_jump_secs: u32,
}

impl Timeline {
    /// Creates a new timeline, erroring on crazy clock rates.
    pub fn new(
        clock_rate: u32,
        enforce_with_max_forward_jump_secs: Option<NonZeroU32>,
    ) -> Result<Self, String> {
        let clock_rate = NonZeroU32::new(clock_rate)
            .ok_or_else(|| "clock_rate=0 rejected to prevent division by zero".to_string())?;
        let max_forward_jump = match enforce_with_max_forward_jump_secs {
            None => None,
            Some(secs) => {
                let j = i32::try_from(u64::from(secs.get()) * u64::from(clock_rate.get()))
                    .map_err(|_| {
                        format!(
                            "clock_rate={} rejected because max forward jump of {} sec \
                             exceeds i32::MAX",
                            clock_rate, secs
                        )
                    })?;
                NonZeroI32::new(j)
            }
        };
        Ok(Timeline {
            newest: None,
            clock_rate,
            max_forward_jump,
            max_forward_jump_secs: enforce_with_max_forward_jump_secs
                .map(NonZeroU32::get)
                .unwrap_or(0),
        })
    }

    /// Forgets history, as when the sender's SSRC changes.
    pub fn reset(&mut self) {
        self.newest = None;
    }

    /// Places the given (wrapping) RTP timestamp on the timeline.
    ///
    /// The timeline's notion of "newest" only moves forward, so an old
    /// timestamp arriving late doesn't drag later placements backward.
    pub fn advance_to(&mut self, rtp_timestamp: u32) -> Result<Timestamp, String> {
        let Some(newest) = self.newest else {
            let timestamp = i64::from(rtp_timestamp);
            self.newest = Some(timestamp);
            return Ok(Timestamp::new(timestamp, self.clock_rate));
        };
        let delta = (rtp_timestamp as i32).wrapping_sub(newest as i32);
        let timestamp = newest.checked_add(i64::from(delta)).ok_or_else(|| {
            format!("timestamp {} + delta {} won't fit in i64!", newest, delta)
        })?;
        if matches!(self.max_forward_jump, Some(j) if delta >= j.get()) {
            return Err(format!(
                "Timestamp jumped {} ({:.03} sec) from {} to {}; \
                 policy is to allow up to {} sec only",
                delta,
                (delta as f64) / f64::from(self.clock_rate.get()),
                newest,
                timestamp,
                self.max_forward_jump_secs
            ));
        }
        if delta > 0 {
            self.newest = Some(timestamp);
        }
        Ok(Timestamp::new(timestamp, self.clock_rate))
    }
}
