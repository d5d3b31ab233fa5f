//! RED → primary wrapper
//!
//! Installed on an `audio/red` receiver for subscribers that only take the
//! primary codec. Every RED packet yields its primary encoding; redundancy
//! blocks fill in packets that never arrived, within a sliding delivered
//! window that prevents duplicate emission across retransmission and
//! reordering.

use super::{impl_wrapped_receiver, parse_red_payload, WrapperCore};
use crate::packet::{CodecDescriptor, ExtPacket};
use crate::receiver::Receiver;
use crate::types::VideoLayer;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::warn;

/// Sliding window width; sequence numbers older than this fall off and are
/// treated as already delivered
const DELIVERED_WINDOW: u16 = 64;

struct SnWindow {
    started: bool,
    highest: u16,
    // bit n set = (highest - n) delivered
    mask: u64,
}

impl SnWindow {
    fn new() -> Self {
        Self {
            started: false,
            highest: 0,
            mask: 0,
        }
    }

    fn mark(&mut self, sn: u16) {
        if !self.started {
            self.started = true;
            self.highest = sn;
            self.mask = 1;
            return;
        }

        let diff = sn.wrapping_sub(self.highest);
        if diff == 0 {
            return;
        }

        if diff < (1 << 15) {
            self.mask = if diff >= DELIVERED_WINDOW {
                0
            } else {
                self.mask << diff
            };
            self.mask |= 1;
            self.highest = sn;
        } else {
            let age = self.highest.wrapping_sub(sn);
            if age < DELIVERED_WINDOW {
                self.mask |= 1 << age;
            }
        }
    }

    fn is_delivered(&self, sn: u16) -> bool {
        if !self.started {
            return false;
        }

        let diff = sn.wrapping_sub(self.highest);
        if diff < (1 << 15) && diff != 0 {
            // newer than anything seen
            return false;
        }

        let age = self.highest.wrapping_sub(sn);
        if age >= DELIVERED_WINDOW {
            // fell off the window; recovering would risk duplicates
            return true;
        }
        self.mask & (1 << age) != 0
    }

    fn is_too_old(&self, sn: u16) -> bool {
        if !self.started {
            return false;
        }
        let diff = sn.wrapping_sub(self.highest);
        diff >= (1 << 15) && self.highest.wrapping_sub(sn) >= DELIVERED_WINDOW
    }
}

pub struct RedPrimaryReceiver {
    pub(crate) core: WrapperCore,
    window: Mutex<SnWindow>,
}

impl RedPrimaryReceiver {
    #[must_use]
    pub fn new(parent: &Arc<Receiver>, lb_threshold: usize) -> Arc<Self> {
        Arc::new(Self {
            core: WrapperCore::new(parent, lb_threshold),
            window: Mutex::new(SnWindow::new()),
        })
    }

    /// Unpack one RED packet, emitting recovered redundancy (oldest first)
    /// followed by the primary encoding
    pub async fn forward_rtp(&self, ext_pkt: &ExtPacket, spatial_layer: i32) {
        if self.core.spreader.down_track_count() == 0 {
            return;
        }

        let payload = &ext_pkt.packet.payload;
        let (blocks, primary_start) = match parse_red_payload(payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "dropping malformed red packet");
                return;
            }
        };

        let primary_sn = ext_pkt.packet.header.sequence_number;
        let primary_ts = ext_pkt.packet.header.timestamp;

        let mut emit: Vec<(u16, u32, Bytes)> = Vec::with_capacity(blocks.len() + 1);
        {
            let mut window = self.window.lock();

            if !window.is_too_old(primary_sn) {
                let count = blocks.len() as u16;
                for (i, block) in blocks.iter().enumerate() {
                    if block.len == 0 {
                        continue;
                    }
                    let sn = primary_sn.wrapping_sub(count - i as u16);
                    if window.is_delivered(sn) {
                        continue;
                    }
                    window.mark(sn);
                    emit.push((
                        sn,
                        primary_ts.wrapping_sub(block.ts_offset),
                        payload.slice(block.start..block.start + block.len),
                    ));
                }
                window.mark(primary_sn);
            }

            // the primary encoding is always forwarded, duplicates included;
            // per-subscriber mungers deduplicate downstream
            emit.push((primary_sn, primary_ts, payload.slice(primary_start..)));
        }

        for (sn, ts, block) in emit {
            let mut packet = ext_pkt.packet.clone();
            packet.header.sequence_number = sn;
            packet.header.timestamp = ts;
            packet.payload = block;

            let primary_pkt = ExtPacket {
                arrival: ext_pkt.arrival,
                packet,
                raw_packet: Bytes::new(),
                key_frame: false,
                video_layer: VideoLayer::INVALID,
                spatial: -1,
                descriptor: CodecDescriptor::None,
            };

            self.core.spreader.broadcast_packet(&primary_pkt, spatial_layer).await;
        }
    }

    pub fn close(&self) {
        self.core.close();
    }

    #[must_use]
    pub fn can_close(&self) -> bool {
        self.core.can_close()
    }
}

impl_wrapped_receiver!(RedPrimaryReceiver);

#[cfg(test)]
mod tests {
    use super::super::testutil::{base_header, generate_pkts, generate_red_pkts, TS_STEP};
    use super::*;
    use crate::receiver::test_support::{opus_receiver, RecordingSender};
    use webrtc::rtp::packet::Packet;

    fn to_ext(pkt: &Packet) -> ExtPacket {
        ExtPacket {
            arrival: std::time::Instant::now(),
            packet: pkt.clone(),
            raw_packet: Bytes::new(),
            key_frame: false,
            video_layer: VideoLayer::INVALID,
            spatial: -1,
            descriptor: CodecDescriptor::None,
        }
    }

    /// Feed `send_idx` of a RED-encoded sequence, expect primaries `expect_idx`
    async fn run_case(count: usize, red_count: usize, send_idx: &[usize], expect_idx: &[usize]) {
        let receiver = opus_receiver();
        let red = RedPrimaryReceiver::new(&receiver, 0);
        let sink = RecordingSender::new("sub-primary");
        red.core.add_down_track(sink.clone()).unwrap();

        let primary_pkts = generate_pkts(base_header(), count, TS_STEP);
        let red_pkts = generate_red_pkts(&primary_pkts, red_count);

        for i in send_idx {
            red.forward_rtp(&to_ext(&red_pkts[*i]), 0).await;
        }

        let received = sink.packets();
        assert_eq!(
            received.len(),
            expect_idx.len(),
            "emitted sequence numbers: {:?}",
            received
                .iter()
                .map(|p| p.packet.header.sequence_number)
                .collect::<Vec<_>>()
        );
        for (got, want_idx) in received.iter().zip(expect_idx) {
            let want = &primary_pkts[*want_idx];
            assert_eq!(got.packet.header.sequence_number, want.header.sequence_number);
            assert_eq!(got.packet.header.timestamp, want.header.timestamp);
            assert_eq!(got.packet.payload, want.payload);
        }
    }

    #[tokio::test]
    async fn every_packet_delivered_once_without_loss() {
        let all: Vec<usize> = (0..19).collect();
        run_case(19, 2, &all, &all).await;
    }

    #[tokio::test]
    async fn alternating_loss_recovers_fully() {
        // primary opus packets SN 65534..65543; every other packet dropped,
        // two redundancy blocks cover the holes
        run_case(10, 2, &[1, 3, 5, 7, 9], &(0..10).collect::<Vec<_>>()).await;
    }

    #[tokio::test]
    async fn single_redundancy_cannot_cover_double_loss() {
        run_case(
            10,
            1,
            &[0, 3, 6, 9],
            // 2, 5, 8 recovered from the following packet; 1, 4, 7 exceed the
            // redundancy depth and stay lost
            &[0, 2, 3, 5, 6, 8, 9],
        )
        .await;
    }

    #[tokio::test]
    async fn recovery_after_long_jump_is_bounded() {
        run_case(
            50,
            2,
            &[0, 5, 12, 21, 24, 27],
            &[0, 3, 4, 5, 10, 11, 12, 19, 20, 21, 22, 23, 24, 25, 26, 27],
        )
        .await;
    }

    #[tokio::test]
    async fn duplicates_forward_primary_but_not_redundancy() {
        let receiver = opus_receiver();
        let red = RedPrimaryReceiver::new(&receiver, 0);
        let sink = RecordingSender::new("sub-primary");
        red.core.add_down_track(sink.clone()).unwrap();

        let primary_pkts = generate_pkts(base_header(), 5, TS_STEP);
        let red_pkts = generate_red_pkts(&primary_pkts, 2);

        red.forward_rtp(&to_ext(&red_pkts[2]), 0).await;
        red.forward_rtp(&to_ext(&red_pkts[2]), 0).await;

        let sns: Vec<u16> = sink
            .packets()
            .iter()
            .map(|p| p.packet.header.sequence_number)
            .collect();
        // first delivery recovers 0 and 1; the duplicate re-emits only the
        // primary
        let base = primary_pkts[0].header.sequence_number;
        assert_eq!(
            sns,
            vec![
                base,
                base.wrapping_add(1),
                base.wrapping_add(2),
                base.wrapping_add(2)
            ]
        );
    }

    #[tokio::test]
    async fn stale_packet_forwards_primary_only() {
        let receiver = opus_receiver();
        let red = RedPrimaryReceiver::new(&receiver, 0);
        let sink = RecordingSender::new("sub-primary");
        red.core.add_down_track(sink.clone()).unwrap();

        let primary_pkts = generate_pkts(base_header(), 200, TS_STEP);
        let red_pkts = generate_red_pkts(&primary_pkts, 2);

        red.forward_rtp(&to_ext(&red_pkts[199]), 0).await;
        // far behind the window: no redundancy emission
        red.forward_rtp(&to_ext(&red_pkts[10]), 0).await;

        let sns: Vec<u16> = sink
            .packets()
            .iter()
            .map(|p| p.packet.header.sequence_number)
            .collect();
        assert_eq!(
            sns,
            vec![
                primary_pkts[197].header.sequence_number,
                primary_pkts[198].header.sequence_number,
                primary_pkts[199].header.sequence_number,
                primary_pkts[10].header.sequence_number,
            ]
        );
    }
}
