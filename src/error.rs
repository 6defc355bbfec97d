// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{fmt::Display, sync::Arc};

use crate::PacketContext;
use bytes::Bytes;
use thiserror::Error;

/// An opaque `std::error::Error + Send + Sync + 'static` implementation.
///
/// The focus is on detailed human-readable messages: packet errors carry
/// enough context (peer, receive time, SSRC and sequence number) to find the
/// offending datagram in a packet capture.
#[derive(Clone)]
pub struct Error(pub(crate) Arc<ErrorInt>);

impl Error {
    /// Returns true if the error was caused by a bad argument or configuration.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(*self.0, ErrorInt::InvalidArgument(_))
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

#[derive(Debug, Error)]
pub(crate) enum ErrorInt {
    /// The method's caller provided an invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A datagram which can't be parsed as RTP at all.
    #[error(
        "[{pkt_ctx}] Malformed RTP packet: {description}\n{:?}",
        crate::hex::LimitedHex::new(data, 64)
    )]
    MalformedPacket {
        pkt_ctx: PacketContext,
        description: String,
        data: Bytes,
    },

    /// An RTP packet which parsed but can't be accepted.
    #[error("[{pkt_ctx}, ssrc={ssrc:08x}, seq={sequence_number:04x}] {description}")]
    RtpPacketError {
        pkt_ctx: PacketContext,
        ssrc: u32,
        sequence_number: u16,
        description: String,
    },

    #[error("Unable to set up UDP socket: {0}")]
    SocketSetupError(#[source] std::io::Error),

    #[error("Error receiving UDP packet: {source}")]
    UdpRecvError { source: std::io::Error },

    /// An allocation (such as a monitoring ring or macroblock grid) failed.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Internal error: {0}")]
    Internal(#[source] Box<dyn std::error::Error + Send + Sync>),
}
