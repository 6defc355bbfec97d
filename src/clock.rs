// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Offset between the sender's RTP clock and a local clock.
//!
//! The offset is produced elsewhere (typically from RTCP sender reports or an
//! application-level clock sync exchange) and fed in through
//! [`crate::receiver::ReceiverHandle::clock`]. When it's known, access units
//! carry a "shifted" timestamp in the local clock's microseconds.

use std::sync::atomic::{AtomicI64, Ordering};

/// Marks the offset as unknown. Not a plausible offset in practice.
const UNKNOWN: i64 = i64::MIN;

/// Latest known clock offset, shareable between the receive task and any
/// number of updaters.
#[derive(Debug)]
pub struct ClockSync {
    offset_us: AtomicI64,
}

impl Default for ClockSync {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSync {
    pub fn new() -> Self {
        ClockSync {
            offset_us: AtomicI64::new(UNKNOWN),
        }
    }

    /// Sets the offset such that `local_us = rtp_us + offset_us`.
    pub fn update(&self, offset_us: i64) {
        let offset_us = if offset_us == UNKNOWN {
            UNKNOWN + 1
        } else {
            offset_us
        };
        self.offset_us.store(offset_us, Ordering::Relaxed);
        log::debug!("clock offset updated to {}µs", offset_us);
    }

    /// Forgets the offset; shifted timestamps become unavailable.
    pub fn invalidate(&self) {
        self.offset_us.store(UNKNOWN, Ordering::Relaxed);
    }

    pub fn offset(&self) -> Option<i64> {
        match self.offset_us.load(Ordering::Relaxed) {
            UNKNOWN => None,
            o => Some(o),
        }
    }

    /// Maps an RTP-clock time in microseconds to local microseconds.
    ///
    /// Returns `None` if no offset is known or the result would be negative.
    pub fn shift(&self, rtp_us: i64) -> Option<u64> {
        let offset = self.offset()?;
        rtp_us
            .checked_add(offset)
            .and_then(|t| u64::try_from(t).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::ClockSync;

    #[test]
    fn shift() {
        let c = ClockSync::new();
        assert_eq!(c.shift(1_000), None);
        c.update(-500);
        assert_eq!(c.offset(), Some(-500));
        assert_eq!(c.shift(1_000), Some(500));
        assert_eq!(c.shift(100), None);
        c.invalidate();
        assert_eq!(c.shift(1_000), None);
    }
}
