//! Sequence number and timestamp translation
//!
//! A down track's egress must look like one continuous RTP stream no matter
//! how many uplink layers fed it. The munger maintains the offsets between
//! incoming and outgoing sequence numbers/timestamps, swallows dropped and
//! padding-only packets without leaving gaps, and keeps a small history of
//! offsets so retransmitted packets map with the offset that was in effect
//! when they were first forwarded.

use crate::error::{Error, Result};
use crate::packet::ExtPacket;
use std::collections::VecDeque;

/// Half the 16-bit sequence space; beyond this a difference is "older"
const NEWER_THRESHOLD: u16 = 1 << 15;
const SN_OFFSET_CACHE_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnOrdering {
    Contiguous,
    Gap,
    OutOfOrder,
}

#[derive(Debug, Clone, Copy)]
pub struct TranslationParams {
    pub ordering: SnOrdering,
    pub sequence_number: u16,
    pub timestamp: u32,
}

#[derive(Debug)]
pub struct RtpMunger {
    start_sn: u16,
    start_ts: u32,

    started: bool,
    resync_pending: bool,
    resync_ts_adjust: u32,

    highest_incoming_sn: u16,
    sn_offset: u16,
    ts_offset: u32,

    last_sn: u16,
    last_ts: u32,
    last_marker: bool,

    // (first incoming sn the offset applies from, offset), newest at the back
    sn_offsets: VecDeque<(u16, u16)>,
}

impl RtpMunger {
    /// Munger with a random egress starting point
    #[must_use]
    pub fn new() -> Self {
        Self::with_start(rand::random::<u16>(), rand::random::<u32>())
    }

    /// Munger whose first outgoing packet uses the given sequence number and
    /// timestamp
    #[must_use]
    pub fn with_start(start_sn: u16, start_ts: u32) -> Self {
        Self {
            start_sn,
            start_ts,
            started: false,
            resync_pending: false,
            resync_ts_adjust: 1,
            highest_incoming_sn: 0,
            sn_offset: 0,
            ts_offset: 0,
            last_sn: start_sn.wrapping_sub(1),
            last_ts: start_ts,
            last_marker: false,
            sn_offsets: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn last_sequence_number(&self) -> u16 {
        self.last_sn
    }

    #[must_use]
    pub fn last_timestamp(&self) -> u32 {
        self.last_ts
    }

    #[must_use]
    pub fn last_marker(&self) -> bool {
        self.last_marker
    }

    /// Start a new rewrite epoch at the next accepted packet. `ts_adjust` is
    /// the timestamp step inserted between the epochs; at least 1 so the
    /// subscriber never sees a backward or equal timestamp across a switch.
    pub fn resync(&mut self, ts_adjust: u32) {
        self.resync_pending = true;
        self.resync_ts_adjust = ts_adjust.max(1);
    }

    /// Translate one packet. Contiguity is judged on the incoming stream;
    /// the returned sequence number continues the outgoing stream without a
    /// step.
    pub fn update_and_get_sn_ts(&mut self, ext_pkt: &ExtPacket) -> Result<TranslationParams> {
        let sn = ext_pkt.packet.header.sequence_number;
        let ts = ext_pkt.packet.header.timestamp;

        if !self.started {
            self.started = true;
            self.resync_pending = false;
            self.highest_incoming_sn = sn.wrapping_sub(1);
            self.sn_offset = sn.wrapping_sub(self.start_sn);
            self.ts_offset = ts.wrapping_sub(self.start_ts);
            self.push_offset(sn);
        }

        if self.resync_pending {
            self.resync_pending = false;
            self.highest_incoming_sn = sn.wrapping_sub(1);
            self.sn_offset = sn.wrapping_sub(self.last_sn.wrapping_add(1));
            self.ts_offset = ts.wrapping_sub(self.last_ts.wrapping_add(self.resync_ts_adjust));
            self.push_offset(sn);
        }

        let diff = sn.wrapping_sub(self.highest_incoming_sn);
        if diff == 0 {
            return Err(Error::DuplicatePacket);
        }

        if diff >= NEWER_THRESHOLD {
            // out of order, most likely a retransmission; map with the offset
            // that applied when this sequence number first passed through
            let offset = self.lookup_offset(sn)?;
            return Ok(TranslationParams {
                ordering: SnOrdering::OutOfOrder,
                sequence_number: sn.wrapping_sub(offset),
                timestamp: ts.wrapping_sub(self.ts_offset),
            });
        }

        if ext_pkt.packet.payload.is_empty() && diff == 1 {
            // padding-only packet at the head: swallow it and close the gap
            self.highest_incoming_sn = sn;
            self.sn_offset = self.sn_offset.wrapping_add(1);
            self.push_offset(sn.wrapping_add(1));
            return Err(Error::PaddingOnlyPacket);
        }

        self.highest_incoming_sn = sn;
        let out_sn = sn.wrapping_sub(self.sn_offset);
        let out_ts = ts.wrapping_sub(self.ts_offset);
        self.last_sn = out_sn;
        self.last_ts = out_ts;
        self.last_marker = ext_pkt.packet.header.marker;

        Ok(TranslationParams {
            ordering: if diff == 1 { SnOrdering::Contiguous } else { SnOrdering::Gap },
            sequence_number: out_sn,
            timestamp: out_ts,
        })
    }

    /// Account for a packet the selector rejected before translation. The
    /// skipped number is absorbed into the offset so the egress stream stays
    /// gap-free; genuinely lost packets in between remain gaps.
    pub fn packet_skipped(&mut self, ext_pkt: &ExtPacket) {
        if !self.started || self.resync_pending {
            return;
        }

        let sn = ext_pkt.packet.header.sequence_number;
        let diff = sn.wrapping_sub(self.highest_incoming_sn);
        if diff == 0 || diff >= NEWER_THRESHOLD {
            return;
        }

        self.highest_incoming_sn = sn;
        self.sn_offset = self.sn_offset.wrapping_add(1);
        self.push_offset(sn.wrapping_add(1));
    }

    /// Map a source timestamp with the offset currently in effect
    #[must_use]
    pub fn translate_timestamp(&self, ts: u32) -> u32 {
        ts.wrapping_sub(self.ts_offset)
    }

    /// Sequence number and timestamp for a locally generated packet (probe
    /// padding or a blank flush frame)
    pub fn next_padding_sn_ts(&mut self) -> (u16, u32) {
        self.last_sn = self.last_sn.wrapping_add(1);
        // the incoming stream did not produce this packet; shift the mapping
        // so the next real packet lands after it
        self.sn_offset = self.sn_offset.wrapping_sub(1);
        self.push_offset(self.highest_incoming_sn.wrapping_add(1));
        (self.last_sn, self.last_ts)
    }

    fn push_offset(&mut self, from_sn: u16) {
        if let Some(back) = self.sn_offsets.back_mut() {
            if back.0 == from_sn {
                back.1 = self.sn_offset;
                return;
            }
        }
        self.sn_offsets.push_back((from_sn, self.sn_offset));
        while self.sn_offsets.len() > SN_OFFSET_CACHE_SIZE {
            self.sn_offsets.pop_front();
        }
    }

    fn lookup_offset(&self, sn: u16) -> Result<u16> {
        for (from_sn, offset) in self.sn_offsets.iter().rev() {
            if sn.wrapping_sub(*from_sn) < NEWER_THRESHOLD {
                return Ok(*offset);
            }
        }
        Err(Error::OutOfOrderSequenceNumberCacheOnly)
    }
}

impl Default for RtpMunger {
    fn default() -> Self {
        Self::new()
    }
}
