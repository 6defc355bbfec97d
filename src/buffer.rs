// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Output buffers exchanged with the [`Consumer`].
//!
//! The consumer owns buffer memory. The assembler asks for a buffer when an
//! access unit begins, fills it, and hands it back either through
//! [`Consumer::au_ready`] (inside the [`crate::AccessUnit`]) or through
//! [`Consumer::release_buffer`]. At most one buffer is being filled at any
//! time, and every buffer handed out is returned exactly once.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use log::debug;

use crate::consumer::Consumer;
use crate::monitoring::{bump, Counters};

/// A consumer-supplied buffer with a fixed capacity.
///
/// The assembler never grows a buffer in place; when more room is needed it
/// requests a larger one and copies.
pub struct AuBuffer {
    data: BytesMut,
    capacity: usize,
    id: u64,
}

impl AuBuffer {
    /// Allocates a new empty buffer. `id` is opaque to this crate; consumers
    /// can use it to track their pool.
    pub fn new(capacity: usize, id: u64) -> Self {
        Self::from_bytes_mut(BytesMut::with_capacity(capacity), id)
    }

    /// Reuses existing memory. Any contents are discarded.
    pub fn from_bytes_mut(mut data: BytesMut, id: u64) -> Self {
        data.clear();
        let capacity = data.capacity();
        AuBuffer { data, capacity, id }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..]
    }

    pub fn into_bytes_mut(self) -> BytesMut {
        self.data
    }

    pub fn freeze(self) -> Bytes {
        self.data.freeze()
    }

    #[inline]
    fn remaining(&self) -> usize {
        self.capacity - self.data.len()
    }
}

impl std::fmt::Debug for AuBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuBuffer")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("data", &crate::hex::LimitedHex::new(&self.data, 64))
            .finish()
    }
}

/// Why a buffer is being returned through [`Consumer::release_buffer`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BufferRelease {
    /// Its contents were copied into a larger replacement buffer.
    CopyComplete,

    /// The access unit it held was abandoned because the receiver stopped.
    Cancelled,

    /// It was never used: too small, or its access unit was discarded.
    Unused,
}

/// The buffer can't accept the write; no replacement was available.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Unavailable;

/// Holds the single buffer currently being filled.
#[derive(Debug)]
pub(crate) struct BufferExchange {
    live: Option<AuBuffer>,
    initial_size: usize,
    counters: Arc<Counters>,
}

impl BufferExchange {
    pub(crate) fn new(initial_size: usize, counters: Arc<Counters>) -> Self {
        BufferExchange {
            live: None,
            initial_size,
            counters,
        }
    }

    /// Ensures a live, empty buffer of at least `min_size` bytes.
    ///
    /// A live buffer left over from a discarded access unit is cleared and
    /// reused.
    pub(crate) fn acquire<C: Consumer>(
        &mut self,
        consumer: &mut C,
        min_size: usize,
    ) -> Result<(), Unavailable> {
        if let Some(b) = self.live.as_mut() {
            b.data.clear();
            if b.capacity >= min_size {
                return Ok(());
            }
            return self.reserve(consumer, min_size);
        }
        let wanted = min_size.max(self.initial_size);
        let Some(mut b) = consumer.request_buffer(wanted) else {
            debug!("consumer has no {}-byte buffer available", wanted);
            return Err(Unavailable);
        };
        if b.capacity < min_size {
            debug!(
                "consumer supplied {}-byte buffer; needed {}",
                b.capacity, min_size
            );
            consumer.release_buffer(b, BufferRelease::Unused);
            return Err(Unavailable);
        }
        b.data.clear();
        self.live = Some(b);
        Ok(())
    }

    /// Ensures room for `additional` more bytes, swapping in a larger buffer
    /// if needed.
    pub(crate) fn reserve<C: Consumer>(
        &mut self,
        consumer: &mut C,
        additional: usize,
    ) -> Result<(), Unavailable> {
        let Some(old) = self.live.as_ref() else {
            return self.acquire(consumer, additional);
        };
        if old.remaining() >= additional {
            return Ok(());
        }
        let needed = old.len() + additional;
        let wanted = needed.max(old.capacity.saturating_mul(2));
        let Some(mut new) = consumer.request_buffer(wanted) else {
            debug!("consumer has no {}-byte replacement buffer", wanted);
            return Err(Unavailable);
        };
        if new.capacity < needed {
            debug!(
                "consumer supplied {}-byte replacement buffer; needed {}",
                new.capacity, needed
            );
            consumer.release_buffer(new, BufferRelease::Unused);
            return Err(Unavailable);
        }
        new.data.clear();
        let Some(old) = self.live.take() else {
            return Err(Unavailable);
        };
        new.data.extend_from_slice(&old.data);
        consumer.release_buffer(old, BufferRelease::CopyComplete);
        self.live = Some(new);
        bump(&self.counters.buffer_replacements, 1);
        Ok(())
    }

    /// Appends `len` bytes produced by `fill`, which must push exactly that
    /// many bytes. Returns the offset they were written at.
    pub(crate) fn append_with<C: Consumer, F: FnOnce(&mut BytesMut)>(
        &mut self,
        consumer: &mut C,
        len: usize,
        fill: F,
    ) -> Result<usize, Unavailable> {
        self.reserve(consumer, len)?;
        let b = self.live.as_mut().ok_or(Unavailable)?;
        let offset = b.data.len();
        fill(&mut b.data);
        debug_assert_eq!(b.data.len(), offset + len);
        Ok(offset)
    }

    /// Inserts `bytes` at `offset`, shifting later data.
    pub(crate) fn insert<C: Consumer>(
        &mut self,
        consumer: &mut C,
        offset: usize,
        bytes: &[u8],
    ) -> Result<(), Unavailable> {
        self.reserve(consumer, bytes.len())?;
        let b = self.live.as_mut().ok_or(Unavailable)?;
        if offset > b.data.len() {
            return Err(Unavailable);
        }
        let old_len = b.data.len();
        b.data.resize(old_len + bytes.len(), 0);
        b.data.copy_within(offset..old_len, offset + bytes.len());
        b.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.live.as_ref().map(AuBuffer::len).unwrap_or(0)
    }

    pub(crate) fn data(&self) -> &[u8] {
        self.live.as_ref().map(AuBuffer::as_slice).unwrap_or(&[])
    }

    pub(crate) fn truncate(&mut self, len: usize) {
        if let Some(b) = self.live.as_mut() {
            b.data.truncate(len);
        }
    }

    /// Empties the live buffer, keeping it for the next access unit.
    pub(crate) fn clear(&mut self) {
        self.truncate(0);
    }

    /// Takes the live buffer for delivery.
    pub(crate) fn take(&mut self) -> Option<AuBuffer> {
        self.live.take()
    }

    /// Makes a buffer previously returned by [`BufferExchange::take`] live
    /// again. Any other live buffer is released as unused.
    pub(crate) fn restore<C: Consumer>(&mut self, consumer: &mut C, buffer: AuBuffer) {
        if let Some(other) = self.live.replace(buffer) {
            consumer.release_buffer(other, BufferRelease::Unused);
        }
    }

    /// Returns the live buffer to the consumer, if any. Idempotent.
    pub(crate) fn cancel<C: Consumer>(&mut self, consumer: &mut C, reason: BufferRelease) {
        if let Some(b) = self.live.take() {
            consumer.release_buffer(b, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::RecordingConsumer;

    fn exchange(initial_size: usize) -> BufferExchange {
        BufferExchange::new(initial_size, Arc::new(Counters::default()))
    }

    #[test]
    fn grow_copies_and_releases() {
        let mut c = RecordingConsumer::with_buffer_size(8);
        let mut x = exchange(8);
        x.acquire(&mut c, 4).unwrap();
        x.append_with(&mut c, 6, |b| b.extend_from_slice(b"abcdef"))
            .unwrap();
        assert_eq!(x.counters.snapshot().buffer_replacements, 0);

        // Exceeds the remaining capacity, so a bigger buffer is requested.
        c.buffer_size = 0;
        let off = x
            .append_with(&mut c, 6, |b| b.extend_from_slice(b"ghijkl"))
            .unwrap();
        assert_eq!(off, 6);
        assert_eq!(x.data(), b"abcdefghijkl");
        assert_eq!(x.counters.snapshot().buffer_replacements, 1);
        assert_eq!(c.released, vec![(0, BufferRelease::CopyComplete)]);
        assert!(x.take().unwrap().capacity() >= 12);
    }

    #[test]
    fn replacement_too_small() {
        let mut c = RecordingConsumer::with_buffer_size(4);
        let mut x = exchange(4);
        x.acquire(&mut c, 4).unwrap();
        x.append_with(&mut c, 3, |b| b.extend_from_slice(b"abc"))
            .unwrap();
        assert_eq!(
            x.append_with(&mut c, 3, |b| b.extend_from_slice(b"def")),
            Err(Unavailable)
        );

        // The original buffer is untouched and still live.
        assert_eq!(x.data(), b"abc");
        assert_eq!(c.released, vec![(1, BufferRelease::Unused)]);
    }

    #[test]
    fn insert_shifts() {
        let mut c = RecordingConsumer::with_buffer_size(16);
        let mut x = exchange(16);
        x.acquire(&mut c, 1).unwrap();
        x.append_with(&mut c, 4, |b| b.extend_from_slice(b"abef"))
            .unwrap();
        x.insert(&mut c, 2, b"cd").unwrap();
        assert_eq!(x.data(), b"abcdef");
    }

    #[test]
    fn cancel_is_idempotent() {
        let mut c = RecordingConsumer::with_buffer_size(16);
        let mut x = exchange(16);
        x.acquire(&mut c, 1).unwrap();
        x.cancel(&mut c, BufferRelease::Cancelled);
        x.cancel(&mut c, BufferRelease::Cancelled);
        assert_eq!(c.released, vec![(0, BufferRelease::Cancelled)]);
        assert_eq!(c.outstanding(), 0);
    }

    #[test]
    fn unavailable() {
        let mut c = RecordingConsumer::with_buffer_size(16);
        c.refuse_buffers = true;
        let mut x = exchange(16);
        assert_eq!(x.acquire(&mut c, 1), Err(Unavailable));
        assert!(x.take().is_none());
    }
}
