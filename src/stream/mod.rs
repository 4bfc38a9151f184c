//! Live stream distribution
//!
//! - [`PacketBus`] / [`PlaybackCursor`]: single-writer, multi-reader packet buffer
//! - [`ChannelRegistry`]: key -> live channel, one publisher per key

pub mod bus;
pub mod packet;
pub mod registry;

pub use bus::{BusStats, PacketBus, PlaybackCursor, ReadError, StartPosition};
pub use packet::{MediaCodec, Packet, PayloadFormat, StreamHeader, TrackInfo, TrackKind};
pub use registry::{ChannelInfo, ChannelPublisher, ChannelRegistry, StreamChannel};
