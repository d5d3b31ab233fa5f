//! Primary → RED wrapper
//!
//! Installed on an opus receiver when a subscriber negotiated `audio/red`.
//! Each primary packet is forwarded as a RED payload carrying up to
//! [`super::MAX_RED_COUNT`] recent packets as redundancy.

use super::{encode_red_for_primary, impl_wrapped_receiver, WrapperCore, MAX_RED_COUNT, MTU_SIZE};
use crate::error::Result;
use crate::packet::ExtPacket;
use crate::receiver::Receiver;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::error;
use webrtc::rtp::packet::Packet;

struct EncoderState {
    // oldest at index 0, newest at the top
    pkt_buff: [Option<Packet>; MAX_RED_COUNT],
    scratch: Vec<u8>,
}

pub struct RedReceiver {
    pub(crate) core: WrapperCore,
    state: Mutex<EncoderState>,
}

impl RedReceiver {
    #[must_use]
    pub fn new(parent: &Arc<Receiver>, lb_threshold: usize) -> Arc<Self> {
        Arc::new(Self {
            core: WrapperCore::new(parent, lb_threshold),
            state: Mutex::new(EncoderState {
                pkt_buff: Default::default(),
                scratch: vec![0u8; MTU_SIZE],
            }),
        })
    }

    /// Encode the primary packet with redundancy and fan out
    pub async fn forward_rtp(&self, ext_pkt: &ExtPacket, spatial_layer: i32) {
        if self.core.spreader.down_track_count() == 0 {
            return;
        }

        let red_payload = match self.encode_red_for_primary(&ext_pkt.packet) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "red encoding failed");
                return;
            }
        };

        let mut red_pkt = ext_pkt.clone();
        red_pkt.packet.payload = red_payload;
        // raw_packet is left as the primary wire form; down tracks do not
        // read it on this path

        self.core.spreader.broadcast_packet(&red_pkt, spatial_layer).await;
    }

    pub fn close(&self) {
        self.core.close();
    }

    #[must_use]
    pub fn can_close(&self) -> bool {
        self.core.can_close()
    }

    fn encode_red_for_primary(&self, pkt: &Packet) -> Result<Bytes> {
        let mut state = self.state.lock();
        let EncoderState { pkt_buff, scratch } = &mut *state;

        let encoded = {
            let mut red_pkts: Vec<&Packet> = Vec::with_capacity(MAX_RED_COUNT);
            for prev in pkt_buff.iter().flatten() {
                let sn_diff = pkt.header.sequence_number.wrapping_sub(prev.header.sequence_number);
                let ts_diff = pkt.header.timestamp.wrapping_sub(prev.header.timestamp);
                if sn_diff == 0 || sn_diff > MAX_RED_COUNT as u16 || ts_diff >= (1 << 14) {
                    continue;
                }
                red_pkts.push(prev);
            }

            encode_red_for_primary(&red_pkts, pkt, scratch)?
        };

        // insert the packet into the history, aging out older entries; an
        // older-than-history sequence number is not recorded
        for i in (0..MAX_RED_COUNT).rev() {
            let newer = match &pkt_buff[i] {
                None => true,
                Some(prev) => {
                    pkt.header.sequence_number.wrapping_sub(prev.header.sequence_number) < (1 << 15)
                }
            };
            if newer {
                for j in 0..i {
                    let shifted = pkt_buff[j + 1].take();
                    pkt_buff[j] = shifted;
                }
                pkt_buff[i] = Some(pkt.clone());
                break;
            }
        }

        Ok(Bytes::copy_from_slice(&scratch[..encoded]))
    }
}

impl_wrapped_receiver!(RedReceiver);
