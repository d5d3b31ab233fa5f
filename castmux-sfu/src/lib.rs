//! castmux track-forwarding engine
//!
//! The data plane of the SFU: publishers' RTP streams come in per layer,
//! subscribers receive a server-selected subset over their own transports.
//!
//! ## Architecture
//!
//! - **`Buffer`**: per-uplink-layer jitter/RTX ring with RTCP feedback
//! - **`Receiver`**: per-publisher-track ingest, one forwarding task per layer
//! - **`StreamTrackerManager`**: which layers are live, at what bitrates
//! - **`DownTrack`**: per-subscriber egress with codec-aware layer selection
//! - **`DownTrackSpreader`**: lock-free fan-out from receivers to down tracks
//! - **`RedReceiver` / `RedPrimaryReceiver`**: RFC 2198 audio redundancy
//!
//! ## Forwarding path
//!
//! ```text
//! publisher rtp ─► Buffer ─► Receiver ─► DownTrackSpreader ─► DownTrack ─► subscriber
//!                              │                                  │
//!                              ├─► StreamTrackerManager           ├─► VideoLayerSelector
//!                              └─► RED wrapper (audio)            └─► RtpMunger
//! ```

pub mod buffer;
pub mod down_track;
pub mod error;
pub mod packet;
pub mod receiver;
pub mod red;
pub mod rtp_munger;
pub mod selector;
pub mod spreader;
pub mod stream_tracker;
pub mod types;

pub use buffer::{Buffer, NtpTime, RtcpSenderReportData};
pub use down_track::{DownTrack, DownTrackState, DownTrackTransport};
pub use error::{Error, Result};
pub use packet::{CodecDescriptor, ExtPacket};
pub use receiver::{Receiver, ReceiverParams, TrackReceiver, UpTrack};
pub use red::{RedPrimaryReceiver, RedReceiver};
pub use selector::{SelectorResult, VideoLayerSelector};
pub use spreader::{DownTrackSpreader, TrackSender};
pub use stream_tracker::{StreamStatus, StreamTracker, StreamTrackerManager, StreamTrackerManagerListener};
pub use types::{Bitrates, TrackInfo, TrackKind, TrackSource, VideoLayer};
