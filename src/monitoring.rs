// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Counters and sliding-window reception statistics.
//!
//! Both are written by the receive flow and read from any thread through
//! [`crate::receiver::ReceiverHandle`]. Counters are plain atomics. Packet
//! samples go into a bounded ring behind a mutex which is held only to push
//! one sample or to copy out a window; statistics are computed outside it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::ErrorInt;
use crate::Error;

macro_rules! counters {
    ($($(#[$doc:meta])* $name:ident,)*) => {
        /// Event counters, updated by the receive flow.
        #[derive(Debug, Default)]
        pub struct Counters {
            $(pub(crate) $name: AtomicU64,)*
        }

        /// A copy of [`Counters`] at one moment.
        #[derive(Clone, Debug, Default, PartialEq, Eq)]
        pub struct CounterSnapshot {
            $($(#[$doc])* pub $name: u64,)*
        }

        impl Counters {
            /// Reads every counter. Each is read atomically; the set as a
            /// whole may straddle an update.
            pub fn snapshot(&self) -> CounterSnapshot {
                CounterSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters! {
    /// Datagrams handed to the sequence checker.
    packets_received,
    /// Datagrams with an invalid RTP header or unusable payload.
    packets_malformed,
    /// Packets that arrived after their sequence number was passed.
    packets_late,
    packets_duplicate,
    /// Sequence numbers never received.
    packets_missed,
    /// NAL units missing one or more fragments.
    nalus_incomplete,
    /// NAL units dropped because no output buffer was available.
    nalus_dropped,
    aus_output,
    /// Incomplete access units delivered to the consumer.
    aus_incomplete_output,
    /// Incomplete access units discarded.
    aus_incomplete_dropped,
    /// Access units discarded while waiting for synchronization.
    aus_dropped_before_sync,
    /// NAL units with a timestamp older than an already-sealed access unit.
    stray_nalus,
    /// Access units skipped because the consumer supplied no buffer.
    aus_skipped_no_buffer,
    /// Output buffers outgrown and copied into larger ones.
    buffer_replacements,
    resyncs,
    skipped_slices_generated,
    gray_frames_generated,
}

#[inline]
pub(crate) fn bump(c: &AtomicU64, n: u64) {
    c.fetch_add(n, Ordering::Relaxed);
}

/// Reception statistics over a time window.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MonitoringReport {
    /// The span actually covered, which is shorter than requested if less
    /// history is available.
    pub real_interval: Duration,

    /// Mean absolute difference between packet spacing on the local clock and
    /// on the RTP clock, in microseconds.
    pub reception_jitter_us: f64,
    pub bytes_received: u64,
    pub mean_packet_size: f64,
    pub packet_size_std_dev: f64,
    pub packets_received: u64,
    pub packets_missed: u64,
}

#[derive(Copy, Clone, Debug)]
struct Sample {
    /// Local receive time, in microseconds since the monitor's epoch.
    recv_us: u64,

    /// RTP timestamp in microseconds.
    rtp_us: i64,
    bytes: u32,
    missed: u16,
}

#[derive(Debug)]
struct Ring {
    samples: VecDeque<Sample>,
    capacity: usize,
    retention_us: u64,
}

#[derive(Debug)]
pub(crate) struct Monitor {
    ring: Mutex<Ring>,
    epoch: Instant,
}

impl Monitor {
    pub(crate) fn new(capacity: usize, retention: Duration) -> Result<Self, Error> {
        if capacity == 0 {
            bail!(ErrorInt::InvalidArgument(
                "monitoring capacity must be positive".to_owned()
            ));
        }
        let mut samples = VecDeque::new();
        samples.try_reserve_exact(capacity).map_err(|e| {
            wrap!(ErrorInt::ResourceExhausted(format!(
                "unable to allocate {capacity}-sample monitoring ring: {e}"
            )))
        })?;
        Ok(Monitor {
            ring: Mutex::new(Ring {
                samples,
                capacity,
                retention_us: u64::try_from(retention.as_micros()).unwrap_or(u64::MAX),
            }),
            epoch: Instant::now(),
        })
    }

    fn micros_since_epoch(&self, t: Instant) -> u64 {
        u64::try_from(t.saturating_duration_since(self.epoch).as_micros()).unwrap_or(u64::MAX)
    }

    /// Records one received packet.
    pub(crate) fn record_packet(&self, received: Instant, rtp_us: i64, bytes: usize, missed: u16) {
        let sample = Sample {
            recv_us: self.micros_since_epoch(received),
            rtp_us,
            bytes: u32::try_from(bytes).unwrap_or(u32::MAX),
            missed,
        };
        let Ok(mut ring) = self.ring.lock() else {
            return;
        };
        if ring.samples.len() == ring.capacity {
            ring.samples.pop_front();
        }
        ring.samples.push_back(sample);
    }

    /// Computes statistics over `interval` ending at `end` (default: now).
    pub(crate) fn report(
        &self,
        end: Option<Instant>,
        interval: Duration,
    ) -> Result<MonitoringReport, Error> {
        let interval_us = u64::try_from(interval.as_micros()).unwrap_or(u64::MAX);
        if interval_us == 0 {
            bail!(ErrorInt::InvalidArgument(
                "monitoring interval must be positive".to_owned()
            ));
        }
        let end_us = self.micros_since_epoch(end.unwrap_or_else(Instant::now));
        let start_us = end_us.saturating_sub(interval_us);

        let (window, oldest_us) = {
            let mut ring = self
                .ring
                .lock()
                .map_err(|_| wrap!(ErrorInt::Internal("monitoring lock poisoned".into())))?;

            // Prune lazily, relative to the newest sample.
            if let Some(newest) = ring.samples.back().map(|s| s.recv_us) {
                let cutoff = newest.saturating_sub(ring.retention_us);
                while ring.samples.front().is_some_and(|s| s.recv_us < cutoff) {
                    ring.samples.pop_front();
                }
            }
            let oldest_us = ring.samples.front().map(|s| s.recv_us);
            let window: Vec<Sample> = ring
                .samples
                .iter()
                .filter(|s| s.recv_us > start_us && s.recv_us <= end_us)
                .copied()
                .collect();
            (window, oldest_us)
        };

        let mut r = MonitoringReport::default();
        let Some(oldest_us) = oldest_us else {
            return Ok(r);
        };
        r.real_interval = Duration::from_micros(end_us.saturating_sub(oldest_us.max(start_us)));
        if window.is_empty() {
            return Ok(r);
        }
        let n = window.len() as f64;
        r.packets_received = window.len() as u64;
        r.bytes_received = window.iter().map(|s| u64::from(s.bytes)).sum();
        r.packets_missed = window.iter().map(|s| u64::from(s.missed)).sum();
        r.mean_packet_size = r.bytes_received as f64 / n;
        let var = window
            .iter()
            .map(|s| {
                let d = f64::from(s.bytes) - r.mean_packet_size;
                d * d
            })
            .sum::<f64>()
            / n;
        r.packet_size_std_dev = var.sqrt();
        if window.len() > 1 {
            let total: f64 = window
                .windows(2)
                .map(|w| {
                    let recv = w[1].recv_us as f64 - w[0].recv_us as f64;
                    let rtp = w[1].rtp_us as f64 - w[0].rtp_us as f64;
                    (recv - rtp).abs()
                })
                .sum();
            r.reception_jitter_us = total / (n - 1.0);
        }
        Ok(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn report() {
        let m = Monitor::new(16, Duration::from_secs(10)).unwrap();
        let t0 = m.epoch;

        // Perfectly paced except the third packet, 2 ms late.
        m.record_packet(t0 + ms(10), 0, 100, 0);
        m.record_packet(t0 + ms(20), 10_000, 300, 0);
        m.record_packet(t0 + ms(32), 20_000, 100, 2);
        m.record_packet(t0 + ms(40), 30_000, 300, 0);

        let r = m.report(Some(t0 + ms(40)), Duration::from_secs(1)).unwrap();
        assert_eq!(r.real_interval, ms(30));
        assert_eq!(r.packets_received, 4);
        assert_eq!(r.packets_missed, 2);
        assert_eq!(r.bytes_received, 800);
        assert_eq!(r.mean_packet_size, 200.0);
        assert_eq!(r.packet_size_std_dev, 100.0);

        // |0| + |2000| + |-2000| over three pairs.
        assert!((r.reception_jitter_us - 4000.0 / 3.0).abs() < 1e-6);

        // A shorter window ending earlier sees only the middle packets.
        let r = m.report(Some(t0 + ms(32)), ms(15)).unwrap();
        assert_eq!(r.real_interval, ms(15));
        assert_eq!(r.packets_received, 2);
        assert_eq!(r.bytes_received, 400);
    }

    #[test]
    fn bounded() {
        let m = Monitor::new(2, Duration::from_secs(10)).unwrap();
        let t0 = m.epoch;
        for i in 0..5 {
            m.record_packet(t0 + ms(i), 0, 10, 0);
        }
        let r = m.report(Some(t0 + ms(4)), Duration::from_secs(1)).unwrap();
        assert_eq!(r.packets_received, 2);
        assert_eq!(r.real_interval, ms(1));
    }

    #[test]
    fn retention() {
        let m = Monitor::new(16, ms(5)).unwrap();
        let t0 = m.epoch;
        m.record_packet(t0 + ms(1), 0, 10, 0);
        m.record_packet(t0 + ms(20), 0, 10, 0);
        let r = m.report(Some(t0 + ms(20)), Duration::from_secs(1)).unwrap();
        assert_eq!(r.packets_received, 1);
        assert_eq!(r.real_interval, Duration::ZERO);
    }

    #[test]
    fn invalid_interval() {
        let m = Monitor::new(16, ms(5)).unwrap();
        let e = m.report(None, Duration::ZERO).unwrap_err();
        assert!(e.is_invalid_argument());
        assert!(Monitor::new(0, ms(5)).unwrap_err().is_invalid_argument());
    }

    #[test]
    fn empty() {
        let m = Monitor::new(16, ms(5)).unwrap();
        assert_eq!(m.report(None, ms(5)).unwrap(), MonitoringReport::default());
    }

    #[test]
    fn snapshot() {
        let c = Counters::default();
        bump(&c.packets_received, 3);
        bump(&c.resyncs, 1);
        let s = c.snapshot();
        assert_eq!(s.packets_received, 3);
        assert_eq!(s.resyncs, 1);
        assert_eq!(s.aus_output, 0);
    }
}
