//! Channel registry
//!
//! Process-wide table of live channels. A channel exists exactly while its
//! publisher holds a [`ChannelPublisher`]; closing or dropping the handle
//! removes the channel and closes its bus.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use super::bus::{BusStats, PacketBus, PlaybackCursor, StartPosition};
use super::packet::{Packet, StreamHeader};
use crate::config::BusConfig;
use crate::error::{AppError, Result};
use crate::events::{EventBus, IngestKind, SystemEvent};

/// A named live stream backed by one packet bus
pub struct StreamChannel {
    key: String,
    publisher_id: u64,
    ingest: IngestKind,
    bus: Arc<PacketBus>,
    created_at: Instant,
}

impl StreamChannel {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn publisher_id(&self) -> u64 {
        self.publisher_id
    }

    pub fn ingest(&self) -> IngestKind {
        self.ingest
    }

    pub fn bus(&self) -> &Arc<PacketBus> {
        &self.bus
    }

    pub fn header(&self) -> Option<&StreamHeader> {
        self.bus.header()
    }

    pub fn open_cursor(&self, start: StartPosition) -> PlaybackCursor {
        self.bus.open_cursor(start)
    }

    pub fn info(&self) -> ChannelInfo {
        ChannelInfo {
            key: self.key.clone(),
            ingest: self.ingest,
            publisher_id: self.publisher_id,
            uptime_secs: self.created_at.elapsed().as_secs(),
            header: self.bus.header().cloned(),
            stats: self.bus.stats(),
        }
    }
}

/// Channel snapshot for the status API
#[derive(Debug, Clone, Serialize)]
pub struct ChannelInfo {
    pub key: String,
    pub ingest: IngestKind,
    pub publisher_id: u64,
    pub uptime_secs: u64,
    pub header: Option<StreamHeader>,
    pub stats: BusStats,
}

/// Maps channel keys to live channels
pub struct ChannelRegistry {
    channels: Mutex<HashMap<String, Arc<StreamChannel>>>,
    bus_config: BusConfig,
    events: Arc<EventBus>,
    next_publisher_id: AtomicU64,
}

impl ChannelRegistry {
    pub fn new(bus_config: BusConfig, events: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            channels: Mutex::new(HashMap::new()),
            bus_config,
            events,
            next_publisher_id: AtomicU64::new(1),
        })
    }

    /// Claim `key` for a new publisher.
    ///
    /// Fails with [`AppError::ChannelBusy`] when the key already has a
    /// publisher; the existing channel is left untouched.
    pub fn publish(self: &Arc<Self>, key: &str, ingest: IngestKind) -> Result<ChannelPublisher> {
        let channel = {
            let mut channels = self.channels.lock();
            if channels.contains_key(key) {
                drop(channels);
                warn!(channel = %key, %ingest, "Publish rejected, channel busy");
                self.events.publish(SystemEvent::ChannelPublishRejected {
                    channel: key.to_string(),
                    ingest,
                    reason: "channel busy".to_string(),
                });
                return Err(AppError::ChannelBusy(key.to_string()));
            }

            let channel = Arc::new(StreamChannel {
                key: key.to_string(),
                publisher_id: self.next_publisher_id.fetch_add(1, Ordering::Relaxed),
                ingest,
                bus: Arc::new(PacketBus::new(key, self.bus_config)),
                created_at: Instant::now(),
            });
            channels.insert(key.to_string(), Arc::clone(&channel));
            channel
        };

        info!(
            channel = %key,
            publisher_id = channel.publisher_id,
            %ingest,
            "Channel published"
        );
        self.events.publish(SystemEvent::ChannelPublished {
            channel: key.to_string(),
            publisher_id: channel.publisher_id,
        });

        Ok(ChannelPublisher {
            registry: Arc::clone(self),
            channel,
            closed: false,
        })
    }

    /// Look up a live channel for playback.
    pub fn lookup(&self, key: &str) -> Result<Arc<StreamChannel>> {
        self.channels
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| AppError::ChannelNotFound(key.to_string()))
    }

    /// Remove `key` and close its bus, if `publisher_id` still owns it.
    ///
    /// Returns `false` when the key is gone or owned by another publisher.
    pub fn remove(&self, key: &str, publisher_id: u64) -> bool {
        let channel = {
            let mut channels = self.channels.lock();
            match channels.get(key) {
                Some(existing) if existing.publisher_id == publisher_id => channels.remove(key),
                Some(existing) => {
                    warn!(
                        channel = %key,
                        expected = existing.publisher_id,
                        actual = publisher_id,
                        "Channel remove mismatch"
                    );
                    return false;
                }
                None => return false,
            }
        };

        let Some(channel) = channel else {
            return false;
        };

        channel.bus.close();
        let packets = channel.bus.stats().appended;
        info!(channel = %key, publisher_id, packets, "Channel closed");
        self.events.publish(SystemEvent::ChannelClosed {
            channel: key.to_string(),
            packets,
        });
        true
    }

    pub fn list(&self) -> Vec<ChannelInfo> {
        let channels: Vec<_> = self.channels.lock().values().cloned().collect();
        let mut infos: Vec<_> = channels.iter().map(|c| c.info()).collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }

    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.lock().is_empty()
    }

    /// Close every channel. Used at shutdown.
    pub fn close_all(&self) {
        let drained: Vec<_> = self.channels.lock().drain().collect();
        for (key, channel) in drained {
            channel.bus.close();
            info!(channel = %key, "Channel closed at shutdown");
        }
    }
}

/// Exclusive write handle for one channel
///
/// The only way to append to a channel's bus. Dropping the handle without
/// calling [`close`](Self::close) removes the channel as well.
pub struct ChannelPublisher {
    registry: Arc<ChannelRegistry>,
    channel: Arc<StreamChannel>,
    closed: bool,
}

impl ChannelPublisher {
    pub fn key(&self) -> &str {
        &self.channel.key
    }

    pub fn id(&self) -> u64 {
        self.channel.publisher_id
    }

    pub fn channel(&self) -> &Arc<StreamChannel> {
        &self.channel
    }

    /// Write the stream header. Returns `false` if one was already written.
    pub fn set_header(&self, header: StreamHeader) -> bool {
        self.channel.bus.set_header(header)
    }

    pub fn has_header(&self) -> bool {
        self.channel.bus.header().is_some()
    }

    pub fn append(&self, packet: Packet) -> Result<u64> {
        self.channel.bus.append(packet)
    }

    /// Remove the channel from the registry and close its bus.
    pub fn close(mut self) {
        self.closed = true;
        self.registry.remove(&self.channel.key, self.channel.publisher_id);
    }
}

impl Drop for ChannelPublisher {
    fn drop(&mut self) {
        if !self.closed {
            self.registry
                .remove(&self.channel.key, self.channel.publisher_id);
        }
    }
}
