// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Drives the pipeline from a UDP socket.
//!
//! A [`Receiver`] owns all mutable pipeline state and is moved into the
//! receive task by [`Receiver::run`]. Everything another task may want
//! (stopping, counters, monitoring reports, the latest parameter sets and the
//! clock offset feed) goes through a cloneable [`ReceiverHandle`].
//!
//! The consumer is called synchronously from the receive task. Slow consumer
//! callbacks stall packet intake and so increase loss.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use log::{debug, info, trace, warn};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::assembler::AuAssembler;
use crate::clock::ClockSync;
use crate::codec::h264::{Depacketizer, ParameterSets};
use crate::consumer::Consumer;
use crate::macroblock::ConcealmentPolicy;
use crate::error::ErrorInt;
use crate::monitoring::{bump, CounterSnapshot, Counters, Monitor, MonitoringReport};
use crate::options::{FilterOptions, NetConfig, ReceiverOptions};
use crate::rtp::{Packet, SequenceChecker, SequenceCounters};
use crate::timeline::Timeline;
use crate::{Error, PacketContext, H264_CLOCK_RATE};

/// Pause after a socket error so a persistent failure doesn't spin.
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// State shared between the receive task and [`ReceiverHandle`]s.
struct Shared {
    counters: Arc<Counters>,
    monitor: Monitor,
    clock: ClockSync,
    params: Arc<Mutex<Option<ParameterSets>>>,
    cancel: CancellationToken,
}

/// Receives H.264 over RTP and delivers access units to a [`Consumer`].
pub struct Receiver<C: Consumer> {
    checker: SequenceChecker,
    depacketizer: Depacketizer,
    assembler: AuAssembler<C>,
    shared: Arc<Shared>,
    max_packet_size: usize,

    /// Checker counters already copied into the shared [`Counters`].
    seen: SequenceCounters,

    /// SSRC of the most recent packet passed to the depacketizer.
    ssrc: Option<u32>,
}

impl<C: Consumer> Receiver<C> {
    /// Creates a receiver. All configuration errors are reported here.
    pub fn new(
        receiver_opts: ReceiverOptions,
        filter_opts: FilterOptions,
        consumer: C,
    ) -> Result<Self, Error> {
        receiver_opts.validate()?;
        let timeline = Timeline::new(H264_CLOCK_RATE.get(), receiver_opts.max_forward_jump_secs)
            .map_err(|e| wrap!(ErrorInt::InvalidArgument(e)))?;
        let monitor = Monitor::new(
            receiver_opts.monitoring_capacity,
            receiver_opts.monitoring_retention,
        )?;
        let counters = Arc::new(Counters::default());
        let assembler = AuAssembler::new(filter_opts, consumer, counters.clone())?;
        let shared = Arc::new(Shared {
            counters,
            monitor,
            clock: ClockSync::new(),
            params: assembler.shared_parameter_sets(),
            cancel: CancellationToken::new(),
        });
        Ok(Receiver {
            checker: SequenceChecker::new(
                receiver_opts.payload_type,
                receiver_opts.reorder_window,
                timeline,
            ),
            depacketizer: Depacketizer::new(),
            assembler,
            shared,
            max_packet_size: receiver_opts.max_packet_size,
            seen: SequenceCounters::default(),
            ssrc: None,
        })
    }

    /// Replaces the default [`crate::NearestValidConcealment`] policy.
    pub fn with_concealment_policy(self, policy: Box<dyn ConcealmentPolicy>) -> Self {
        Receiver {
            assembler: self.assembler.with_concealment_policy(policy),
            ..self
        }
    }

    pub fn handle(&self) -> ReceiverHandle {
        ReceiverHandle(self.shared.clone())
    }

    pub fn consumer(&self) -> &C {
        self.assembler.consumer()
    }

    /// Processes one datagram. Bad packets are logged and counted; they never
    /// cause an error.
    pub fn push_datagram(&mut self, ctx: PacketContext, data: Bytes) {
        trace!("[{}] {}-byte datagram", ctx, data.len());
        let r = self.checker.rtp(&ctx, &self.shared.clock, data);
        self.copy_sequence_counters();
        if let Err(e) = r {
            debug!("{}", e);
        }
        while let Some(pkt) = self.checker.pull() {
            self.handle_packet(pkt);
        }
    }

    fn copy_sequence_counters(&mut self) {
        let now = self.checker.counters();
        let c = &self.shared.counters;
        bump(&c.packets_received, now.received - self.seen.received);
        bump(&c.packets_malformed, now.malformed - self.seen.malformed);
        bump(&c.packets_late, now.late - self.seen.late);
        bump(&c.packets_duplicate, now.duplicate - self.seen.duplicate);
        bump(&c.packets_missed, now.missed - self.seen.missed);
        self.seen = now;
    }

    fn handle_packet(&mut self, pkt: Packet) {
        if matches!(self.ssrc, Some(s) if s != pkt.ssrc) {
            info!(
                "[{}] new stream with ssrc {:08x}; closing access unit in progress",
                pkt.ctx, pkt.ssrc
            );
            self.depacketizer = Depacketizer::new();
            self.assembler.reset_stream();
        }
        self.ssrc = Some(pkt.ssrc);
        self.shared.monitor.record_packet(
            pkt.ctx.received().unwrap_or_else(Instant::now),
            pkt.timestamp.micros(),
            pkt.payload.len(),
            pkt.loss,
        );
        let (ctx, ssrc) = (pkt.ctx, pkt.ssrc);
        if let Err(e) = self.depacketizer.push(pkt) {
            bump(&self.shared.counters.packets_malformed, 1);
            debug!("[{}, ssrc={:08x}] {}", ctx, ssrc, e);
        }
        while let Some(nal) = self.depacketizer.pull() {
            self.assembler.push(nal);
        }
    }

    /// Receives from `socket` until [`ReceiverHandle::stop`] is called, then
    /// cancels any buffer in progress and returns the consumer.
    ///
    /// Socket errors are logged and don't end the loop.
    pub async fn run(mut self, socket: UdpSocket) -> C {
        let cancel = self.shared.cancel.clone();
        let mut buf = BytesMut::new();
        loop {
            buf.resize(self.max_packet_size, 0);
            let (len, peer) = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                r = socket.recv_from(&mut buf[..]) => match r {
                    Ok(r) => r,
                    Err(source) => {
                        warn!("{}", wrap!(ErrorInt::UdpRecvError { source }));
                        tokio::time::sleep(RECV_ERROR_BACKOFF).await;
                        continue;
                    }
                },
            };
            buf.truncate(len);
            let data = buf.split().freeze();
            self.push_datagram(PacketContext::udp(peer), data);
        }
        debug!("receive loop stopped");
        self.into_consumer()
    }

    /// Cancels any buffer in progress and returns the consumer.
    pub fn into_consumer(self) -> C {
        self.assembler.into_consumer()
    }
}

/// Binds a socket as described by `net`, joining its multicast group if any.
pub async fn bind(net: &NetConfig) -> Result<UdpSocket, Error> {
    net.validate()?;
    let socket = UdpSocket::bind(net.bind)
        .await
        .map_err(|e| wrap!(ErrorInt::SocketSetupError(e)))?;
    if let Some((group, interface)) = net.multicast {
        socket
            .join_multicast_v4(group, interface)
            .map_err(|e| wrap!(ErrorInt::SocketSetupError(e)))?;
        info!("joined multicast group {} on {}", group, interface);
    }
    Ok(socket)
}

/// Control and monitoring access to a running [`Receiver`].
#[derive(Clone)]
pub struct ReceiverHandle(Arc<Shared>);

impl ReceiverHandle {
    /// Asks the receive loop to exit. Returns immediately; await the
    /// [`Receiver::run`] future to know when it has.
    pub fn stop(&self) {
        self.0.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.0.cancel.is_cancelled()
    }

    /// Statistics over the `interval` ending at `end` (default: now).
    pub fn monitoring(
        &self,
        end: Option<Instant>,
        interval: Duration,
    ) -> Result<MonitoringReport, Error> {
        self.0.monitor.report(end, interval)
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.0.counters.snapshot()
    }

    /// The current SPS and PPS, once both are known.
    pub fn parameter_sets(&self) -> Option<ParameterSets> {
        self.0.params.lock().ok().and_then(|p| p.clone())
    }

    /// The feed for the sender-to-local clock offset.
    pub fn clock(&self) -> &ClockSync {
        &self.0.clock
    }
}

impl std::fmt::Debug for ReceiverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiverHandle")
            .field("stopped", &self.is_stopped())
            .field("counters", &self.counters())
            .finish()
    }
}
