// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Loss-tolerant reception of H.264 video carried over RTP.
//!
//! Datagrams flow through a fixed pipeline:
//!
//! 1.  [`rtp::SequenceChecker`] validates RTP headers, extends timestamps and
//!     counts missing packets.
//! 2.  [`codec::h264::Depacketizer`] reassembles NAL units from single NAL,
//!     STAP-A and FU-A payloads ([RFC 6184](https://datatracker.ietf.org/doc/html/rfc6184)).
//! 3.  [`assembler::AuAssembler`] groups NAL units into access units, waits for
//!     parameter sets, tracks per-macroblock damage and optionally conceals
//!     lost slices.
//! 4.  A [`Consumer`] supplies output buffers and receives each finished
//!     [`AccessUnit`].
//!
//! [`receiver::Receiver`] drives the pipeline from a UDP socket and exposes a
//! [`receiver::ReceiverHandle`] for stopping it and for monitoring queries.

#![forbid(clippy::print_stderr, clippy::print_stdout)]

use std::fmt::{Debug, Display};
use std::net::SocketAddr;
use std::num::NonZeroU32;

mod error;
mod hex;

#[cfg(test)]
mod testutil;

pub use error::Error;

/// Wraps the supplied `ErrorInt` and returns it as an `Err`.
macro_rules! bail {
    ($e:expr) => {
        return Err(crate::error::Error(std::sync::Arc::new($e)))
    };
}

macro_rules! wrap {
    ($e:expr) => {
        crate::error::Error(std::sync::Arc::new($e))
    };
}

pub mod assembler;
pub mod buffer;
pub mod clock;
pub mod codec;
pub mod consumer;
pub mod macroblock;
pub mod monitoring;
pub mod options;
pub mod receiver;
pub mod rtp;
pub mod timeline;

pub use buffer::{AuBuffer, BufferRelease};
pub use codec::h264::{ParameterSets, SyncType};
pub use consumer::{AccessUnit, Consumer, ConsumerError};
pub use macroblock::{
    ConcealmentPolicy, MacroblockStatus, MacroblockStatusGrid, NearestValidConcealment,
};
pub use monitoring::{CounterSnapshot, MonitoringReport};
pub use options::{FilterOptions, NetConfig, ReceiverOptions, ResyncPolicy};
pub use receiver::{Receiver, ReceiverHandle};

use error::ErrorInt;

/// The RTP clock rate of H.264 video, as fixed by RFC 6184 section 8.2.1.
pub const H264_CLOCK_RATE: NonZeroU32 = match NonZeroU32::new(90_000) {
    Some(r) => r,
    None => panic!("zero clock rate"),
};

/// An RTP timestamp extended onto a 64-bit timeline.
///
/// The top bits are inferred from wraparounds of the 32-bit RTP timestamp:
/// a timestamp that differs from the previous one by more than `i32::MAX`
/// is treated as a backwards step rather than a huge forward jump. Senders
/// which restart their clock or send out-of-order timestamps are tolerated;
/// the receiver's [`crate::timeline::Timeline`] can optionally bound forward
/// jumps.
///
/// The [`Display`] and [`Debug`] implementations show the extended value,
/// the bottom 32 bits as seen in packet headers, and microseconds.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Timestamp {
    timestamp: i64,
    clock_rate: NonZeroU32,
}

impl Timestamp {
    #[inline]
    pub fn new(timestamp: i64, clock_rate: NonZeroU32) -> Self {
        Timestamp {
            timestamp,
            clock_rate,
        }
    }

    /// Returns the extended timestamp in clock rate units.
    #[inline]
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Returns the clock rate, in Hz.
    #[inline]
    pub fn clock_rate(&self) -> NonZeroU32 {
        self.clock_rate
    }

    /// Returns the extended timestamp converted to microseconds.
    #[inline]
    pub fn micros(&self) -> i64 {
        let us = i128::from(self.timestamp) * 1_000_000 / i128::from(self.clock_rate.get());
        us as i64
    }

    /// Returns `self + delta` unless it would overflow.
    pub fn try_add(&self, delta: u32) -> Option<Self> {
        self.timestamp
            .checked_add(i64::from(delta))
            .map(|timestamp| Timestamp {
                timestamp,
                clock_rate: self.clock_rate,
            })
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (mod-2^32: {}), {}µs",
            self.timestamp,
            self.timestamp as u32,
            self.micros()
        )
    }
}

impl Debug for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

/// A wall time taken from the local machine's realtime clock, used in error reporting.
#[derive(Copy, Clone, Debug)]
pub struct WallTime(chrono::DateTime<chrono::Utc>);

impl WallTime {
    fn now() -> Self {
        Self(chrono::Utc::now())
    }
}

impl Display for WallTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%FT%T%.3f"))
    }
}

/// Context of a received datagram.
///
/// This gives enough information to pick out the packet in a capture.
#[derive(Copy, Clone, Debug)]
pub struct PacketContext(PacketContextInner);

#[derive(Copy, Clone, Debug)]
enum PacketContextInner {
    Udp {
        peer: SocketAddr,
        received_wall: WallTime,
        received: std::time::Instant,
    },
    Dummy,
}

impl PacketContext {
    /// Context for a datagram just received from `peer`.
    pub fn udp(peer: SocketAddr) -> Self {
        Self(PacketContextInner::Udp {
            peer,
            received_wall: WallTime::now(),
            received: std::time::Instant::now(),
        })
    }

    #[doc(hidden)]
    pub fn dummy() -> Self {
        Self(PacketContextInner::Dummy)
    }

    /// Returns the monotonic time the datagram was received, if known.
    pub fn received(&self) -> Option<std::time::Instant> {
        match self.0 {
            PacketContextInner::Udp { received, .. } => Some(received),
            PacketContextInner::Dummy => None,
        }
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        match self.0 {
            PacketContextInner::Udp { peer, .. } => Some(peer),
            PacketContextInner::Dummy => None,
        }
    }
}

impl Display for PacketContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            PacketContextInner::Udp {
                peer,
                received_wall,
                ..
            } => write!(f, "{}@{}", peer, &received_wall),
            PacketContextInner::Dummy => write!(f, "dummy"),
        }
    }
}
