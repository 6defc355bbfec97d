// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

#![no_main]
use std::collections::HashSet;

use bytes::Bytes;
use h264_receiver::receiver::Receiver;
use h264_receiver::{
    AccessUnit, AuBuffer, BufferRelease, Consumer, ConsumerError, FilterOptions, PacketContext,
    ReceiverOptions,
};
use libfuzzer_sys::fuzz_target;

/// Hands out buffers and checks each comes back exactly once.
#[derive(Default)]
struct Checking {
    next_id: u64,
    outstanding: HashSet<u64>,
}

impl Consumer for Checking {
    fn request_buffer(&mut self, min_size: usize) -> Option<AuBuffer> {
        if min_size > 1 << 20 {
            return None;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.outstanding.insert(id);
        Some(AuBuffer::new(min_size, id))
    }

    fn release_buffer(&mut self, buffer: AuBuffer, _reason: BufferRelease) {
        assert!(self.outstanding.remove(&buffer.id()));
    }

    fn au_ready(&mut self, au: AccessUnit<'_>) -> Result<(), ConsumerError> {
        assert!(self.outstanding.remove(&au.buffer().id()));
        assert!(au.data().len() <= au.buffer().capacity());
        if let Some(g) = au.macroblocks() {
            assert_eq!(g.as_slice().len(), (g.width() * g.height()) as usize);
        }
        Ok(())
    }
}

fuzz_target!(|data: &[u8]| {
    let mut data = data;
    let mut receiver = Receiver::new(
        ReceiverOptions::default().reorder_window(2),
        FilterOptions::default()
            .wait_for_sync(true)
            .output_incomplete_au(true)
            .generate_skipped_p_slices(true)
            .generate_first_gray_i_frame(true)
            .initial_buffer_size(64)
            .sprop_parameter_sets("Z2QAHqwsaoLA9puCgIKgAAADACAAAAMD0IAA,aO4xshsA"),
        Checking::default(),
    )
    .unwrap();
    let mut timestamp: u32 = 0;
    let mut sequence_number: u16 = 0;
    loop {
        let Some((hdr, rest)) = data.split_first() else {
            break;
        };
        let ts_change = (hdr & 0b001) != 0;
        let mark = (hdr & 0b010) != 0;
        let loss = (hdr & 0b100) != 0;
        let len = usize::from(hdr >> 3);
        if rest.len() < len {
            break;
        }
        let (payload, rest) = rest.split_at(len);
        data = rest;
        if loss {
            sequence_number = sequence_number.wrapping_add(1);
        }
        if ts_change {
            timestamp = timestamp.wrapping_add(3000);
        }
        let mut pkt = Vec::with_capacity(12 + len);
        pkt.push(0x80);
        pkt.push(96 | if mark { 0x80 } else { 0 });
        pkt.extend_from_slice(&sequence_number.to_be_bytes());
        pkt.extend_from_slice(&timestamp.to_be_bytes());
        pkt.extend_from_slice(&0x4cacc3d1u32.to_be_bytes());
        pkt.extend_from_slice(payload);
        receiver.push_datagram(PacketContext::dummy(), Bytes::from(pkt));
        sequence_number = sequence_number.wrapping_add(1);
    }
    let consumer = receiver.into_consumer();
    assert!(consumer.outstanding.is_empty());
});
