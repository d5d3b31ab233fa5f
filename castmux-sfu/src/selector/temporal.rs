use crate::packet::ExtPacket;

/// Temporal layer stepping rules for codecs that expose temporal structure in
/// the payload descriptor.
#[derive(Debug, Default)]
pub enum TemporalLayerSelector {
    #[default]
    None,
    Vp8,
}

impl TemporalLayerSelector {
    /// Decide the temporal layer for this packet and the updated current
    /// layer. Moving up waits for a layer-sync point; moving down happens
    /// immediately, higher temporal frames are discardable by construction.
    pub fn select(&self, ext_pkt: &ExtPacket, current: i32, target: i32) -> (i32, i32) {
        match self {
            Self::None => (current, current),
            Self::Vp8 => {
                let Some(vp8) = ext_pkt.descriptor.as_vp8() else {
                    return (current, current);
                };

                let tid = if vp8.t == 1 { i32::from(vp8.tid) } else { 0 };
                let layer_sync = vp8.y == 1;

                if target < 0 {
                    return (tid, current);
                }
                if target > current && tid > current && tid <= target && layer_sync {
                    return (tid, tid);
                }
                if target < current {
                    return (tid, target);
                }
                (tid, current)
            }
        }
    }
}
