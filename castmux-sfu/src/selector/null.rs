use super::{Base, SelectorResult};
use crate::packet::ExtPacket;

/// Pass-through selector for audio and not-yet-negotiated video
#[derive(Debug, Default)]
pub struct Null {
    pub(crate) base: Base,
}

impl Null {
    pub fn select(&mut self, ext_pkt: &ExtPacket, _layer: i32) -> SelectorResult {
        SelectorResult {
            is_selected: true,
            is_relevant: true,
            rtp_marker: ext_pkt.packet.header.marker,
            ..Default::default()
        }
    }
}
