//! Packet bus and playback cursors
//!
//! A [`PacketBus`] is the single-writer, multi-reader buffer behind one live
//! channel. Packets are numbered with a monotonically increasing sequence;
//! every open [`PlaybackCursor`] is a sequence number into that space.
//!
//! The writer never waits on readers: `append` pushes under a short
//! `parking_lot` lock and wakes blocked readers through a shared
//! [`Notify`]. Memory is bounded two ways:
//!
//! - packets behind the slowest cursor are evicted down to `retain`
//! - past `capacity` the oldest packet is evicted unconditionally, and any
//!   cursor still pointing at it gets [`ReadError::Lagged`] on its next read

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::packet::{Packet, StreamHeader};
use crate::config::BusConfig;
use crate::error::{AppError, Result};

/// Why a cursor read returned without a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReadError {
    /// The bus was closed by its publisher
    #[error("end of stream")]
    EndOfStream,
    /// The cursor's cancellation token fired
    #[error("cursor cancelled")]
    Cancelled,
    /// Packets were evicted before this cursor read them; the cursor has
    /// been moved to the oldest retained packet
    #[error("cursor lagged, {0} packets skipped")]
    Lagged(u64),
}

/// Where a new cursor starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// At the write head: only packets appended after the open are seen
    Latest,
    /// At the oldest packet still retained
    Oldest,
}

/// Snapshot of bus counters
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct BusStats {
    /// Packets appended over the bus lifetime
    pub appended: u64,
    /// Packets currently held
    pub buffered: usize,
    /// Packets dropped while some cursor had not read them yet
    pub forced_evictions: u64,
    pub cursors: usize,
    pub closed: bool,
}

struct BusInner {
    packets: VecDeque<Packet>,
    /// Sequence number of `packets[0]`
    head_seq: u64,
    /// Sequence number the next append gets
    next_seq: u64,
    /// Cursor id -> next sequence number to read
    cursors: HashMap<u64, u64>,
    next_cursor_id: u64,
    forced_evictions: u64,
    closed: bool,
}

impl BusInner {
    fn evict(&mut self, config: &BusConfig) {
        let slowest = self
            .cursors
            .values()
            .copied()
            .min()
            .unwrap_or(self.next_seq);

        while !self.packets.is_empty() {
            let over_capacity = self.packets.len() > config.capacity;
            let unreferenced = self.head_seq < slowest && self.packets.len() > config.retain;
            if !over_capacity && !unreferenced {
                break;
            }
            if self.head_seq >= slowest {
                self.forced_evictions += 1;
            }
            self.packets.pop_front();
            self.head_seq += 1;
        }
    }
}

/// Append-only, bounded-lookback packet buffer for one channel
pub struct PacketBus {
    name: String,
    config: BusConfig,
    header: OnceLock<StreamHeader>,
    inner: Mutex<BusInner>,
    notify: Notify,
}

impl PacketBus {
    pub fn new(name: impl Into<String>, config: BusConfig) -> Self {
        Self {
            name: name.into(),
            config,
            header: OnceLock::new(),
            inner: Mutex::new(BusInner {
                packets: VecDeque::with_capacity(config.capacity.min(1024)),
                head_seq: 0,
                next_seq: 0,
                cursors: HashMap::new(),
                next_cursor_id: 0,
                forced_evictions: 0,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record the stream header. Only the first call takes effect.
    pub fn set_header(&self, header: StreamHeader) -> bool {
        self.header.set(header).is_ok()
    }

    pub fn header(&self) -> Option<&StreamHeader> {
        self.header.get()
    }

    /// Append a packet and wake every waiting cursor.
    ///
    /// Returns the packet's sequence number.
    pub fn append(&self, packet: Packet) -> Result<u64> {
        let seq = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(AppError::ChannelClosed(self.name.clone()));
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.packets.push_back(packet);
            inner.evict(&self.config);
            seq
        };

        trace!(channel = %self.name, seq, "Packet appended");
        self.notify.notify_waiters();
        Ok(seq)
    }

    /// Open a cursor at `start`. A cursor on a closed bus reads end-of-stream.
    pub fn open_cursor(self: &Arc<Self>, start: StartPosition) -> PlaybackCursor {
        let id = {
            let mut inner = self.inner.lock();
            let id = inner.next_cursor_id;
            inner.next_cursor_id += 1;
            let position = match start {
                StartPosition::Latest => inner.next_seq,
                StartPosition::Oldest => inner.head_seq,
            };
            inner.cursors.insert(id, position);
            id
        };

        debug!(channel = %self.name, cursor = id, ?start, "Cursor opened");
        PlaybackCursor {
            bus: Arc::clone(self),
            id,
            cancel: CancellationToken::new(),
        }
    }

    /// Close the bus: drop buffered packets and wake every reader with
    /// end-of-stream. Idempotent.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.packets.clear();
            inner.head_seq = inner.next_seq;
        }

        debug!(channel = %self.name, "Bus closed");
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn stats(&self) -> BusStats {
        let inner = self.inner.lock();
        BusStats {
            appended: inner.next_seq,
            buffered: inner.packets.len(),
            forced_evictions: inner.forced_evictions,
            cursors: inner.cursors.len(),
            closed: inner.closed,
        }
    }

    fn try_read(&self, cursor: u64) -> Option<std::result::Result<Packet, ReadError>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Some(Err(ReadError::EndOfStream));
        }

        let position = *inner.cursors.get(&cursor)?;
        if position < inner.head_seq {
            let skipped = inner.head_seq - position;
            let head = inner.head_seq;
            inner.cursors.insert(cursor, head);
            return Some(Err(ReadError::Lagged(skipped)));
        }

        if position < inner.next_seq {
            let index = (position - inner.head_seq) as usize;
            let packet = inner.packets.get(index).cloned()?;
            inner.cursors.insert(cursor, position + 1);
            inner.evict(&self.config);
            return Some(Ok(packet));
        }

        None
    }

    fn release_cursor(&self, cursor: u64) {
        let mut inner = self.inner.lock();
        inner.cursors.remove(&cursor);
        inner.evict(&self.config);
    }
}

/// A reader's position in a [`PacketBus`]
///
/// Owned by exactly one consumer. Dropping the cursor releases its
/// position so the bus can evict past it.
pub struct PlaybackCursor {
    bus: Arc<PacketBus>,
    id: u64,
    cancel: CancellationToken,
}

impl PlaybackCursor {
    /// Replace the cancellation token, typically with a child of the
    /// owning session's token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn bus(&self) -> &Arc<PacketBus> {
        &self.bus
    }

    /// Wait for the next packet.
    ///
    /// Returns packets in append order. Cancel-safe: dropping the future
    /// never loses a packet.
    pub async fn read_next(&mut self) -> std::result::Result<Packet, ReadError> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(ReadError::Cancelled);
            }

            // Register for wakeups before checking, so an append between the
            // check and the await is not missed.
            let notified = self.bus.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.bus.try_read(self.id) {
                return result;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(ReadError::Cancelled),
                _ = &mut notified => {}
            }
        }
    }

    /// Non-blocking read; `None` when no packet is ready yet.
    pub fn try_read_next(&mut self) -> Option<std::result::Result<Packet, ReadError>> {
        if self.cancel.is_cancelled() {
            return Some(Err(ReadError::Cancelled));
        }
        self.bus.try_read(self.id)
    }
}

impl Drop for PlaybackCursor {
    fn drop(&mut self) {
        self.bus.release_cursor(self.id);
        trace!(channel = %self.bus.name, cursor = self.id, "Cursor released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::packet::TrackKind;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::time::timeout;

    fn packet(n: u8) -> Packet {
        Packet::new(
            TrackKind::Video,
            Duration::from_millis(n as u64 * 33),
            Bytes::from(vec![n]),
        )
    }

    fn bus(capacity: usize, retain: usize) -> Arc<PacketBus> {
        Arc::new(PacketBus::new("test", BusConfig { capacity, retain }))
    }

    #[tokio::test]
    async fn test_latest_cursor_sees_only_new_packets() {
        let bus = bus(64, 0);
        bus.append(packet(0)).unwrap();

        let mut cursor = bus.open_cursor(StartPosition::Latest);
        for n in 1..=10 {
            bus.append(packet(n)).unwrap();
        }

        for n in 1..=10 {
            let p = cursor.read_next().await.unwrap();
            assert_eq!(p.payload[0], n);
        }
        assert!(cursor.try_read_next().is_none());
    }

    #[tokio::test]
    async fn test_two_cursors_see_their_own_suffix() {
        let bus = bus(64, 0);
        let mut early = bus.open_cursor(StartPosition::Latest);
        bus.append(packet(1)).unwrap();
        bus.append(packet(2)).unwrap();
        let mut late = bus.open_cursor(StartPosition::Latest);
        bus.append(packet(3)).unwrap();
        bus.append(packet(4)).unwrap();

        let mut seen_early = Vec::new();
        while let Some(Ok(p)) = early.try_read_next() {
            seen_early.push(p.payload[0]);
        }
        let mut seen_late = Vec::new();
        while let Some(Ok(p)) = late.try_read_next() {
            seen_late.push(p.payload[0]);
        }

        assert_eq!(seen_early, vec![1, 2, 3, 4]);
        assert_eq!(seen_late, vec![3, 4]);
    }

    #[tokio::test]
    async fn test_blocked_reader_wakes_on_append() {
        let bus = bus(64, 0);
        let mut cursor = bus.open_cursor(StartPosition::Latest);

        let reader = tokio::spawn(async move { cursor.read_next().await });
        tokio::task::yield_now().await;
        bus.append(packet(7)).unwrap();

        let p = timeout(Duration::from_secs(1), reader)
            .await
            .expect("reader should wake")
            .unwrap()
            .unwrap();
        assert_eq!(p.payload[0], 7);
    }

    #[tokio::test]
    async fn test_close_wakes_all_blocked_readers() {
        let bus = bus(64, 0);
        let mut readers = Vec::new();
        for _ in 0..8 {
            let mut cursor = bus.open_cursor(StartPosition::Latest);
            readers.push(tokio::spawn(async move { cursor.read_next().await }));
        }
        tokio::task::yield_now().await;

        bus.close();
        bus.close();

        for reader in readers {
            let result = timeout(Duration::from_secs(1), reader)
                .await
                .expect("reader left blocked")
                .unwrap();
            assert_eq!(result.unwrap_err(), ReadError::EndOfStream);
        }
        assert!(bus.append(packet(1)).is_err());
    }

    #[tokio::test]
    async fn test_cancel_wakes_reader() {
        let bus = bus(64, 0);
        let mut cursor = bus.open_cursor(StartPosition::Latest);
        let token = cursor.cancel_token();

        let reader = tokio::spawn(async move { cursor.read_next().await });
        tokio::task::yield_now().await;
        token.cancel();

        let result = timeout(Duration::from_secs(1), reader).await.unwrap().unwrap();
        assert_eq!(result.unwrap_err(), ReadError::Cancelled);
        assert_eq!(bus.stats().cursors, 0);
    }

    #[test]
    fn test_capacity_forces_gap() {
        let bus = bus(4, 0);
        let mut cursor = bus.open_cursor(StartPosition::Latest);
        for n in 0..10 {
            bus.append(packet(n)).unwrap();
        }

        let stats = bus.stats();
        assert_eq!(stats.buffered, 4);
        assert_eq!(stats.forced_evictions, 6);
        assert!(matches!(
            cursor.try_read_next(),
            Some(Err(ReadError::Lagged(6)))
        ));
    }

    #[test]
    fn test_gap_then_resume_in_order() {
        let bus = bus(4, 0);
        let mut cursor = bus.open_cursor(StartPosition::Latest);
        for n in 0..10 {
            bus.append(packet(n)).unwrap();
        }

        match cursor.try_read_next() {
            Some(Err(ReadError::Lagged(skipped))) => assert_eq!(skipped, 6),
            other => panic!("expected gap, got {:?}", other.map(|r| r.map(|p| p.payload))),
        }
        let rest: Vec<u8> = std::iter::from_fn(|| cursor.try_read_next())
            .map(|r| r.unwrap().payload[0])
            .collect();
        assert_eq!(rest, vec![6, 7, 8, 9]);
    }

    #[test]
    fn test_unreferenced_packets_are_evicted() {
        let bus = bus(64, 2);
        for n in 0..10 {
            bus.append(packet(n)).unwrap();
        }
        assert_eq!(bus.stats().buffered, 2);

        let mut cursor = bus.open_cursor(StartPosition::Oldest);
        let first = cursor.try_read_next().unwrap().unwrap();
        assert_eq!(first.payload[0], 8);
    }

    #[test]
    fn test_slow_cursor_pins_packets() {
        let bus = bus(64, 0);
        let mut cursor = bus.open_cursor(StartPosition::Latest);
        for n in 0..5 {
            bus.append(packet(n)).unwrap();
        }
        assert_eq!(bus.stats().buffered, 5);

        cursor.try_read_next().unwrap().unwrap();
        assert_eq!(bus.stats().buffered, 4);

        drop(cursor);
        assert_eq!(bus.stats().buffered, 0);
        assert_eq!(bus.stats().appended, 5);
    }

    #[test]
    fn test_pending_read_woken_by_append() {
        let bus = bus(8, 0);
        let mut cursor = bus.open_cursor(StartPosition::Latest);
        let mut read = tokio_test::task::spawn(cursor.read_next());
        tokio_test::assert_pending!(read.poll());

        bus.append(packet(7)).unwrap();
        assert!(read.is_woken());
        let p = tokio_test::assert_ready_ok!(read.poll());
        assert_eq!(p.payload[0], 7);
    }

    #[test]
    fn test_header_written_once() {
        let bus = bus(8, 0);
        assert!(bus.header().is_none());
        assert!(bus.set_header(StreamHeader::default()));
        assert!(!bus.set_header(StreamHeader::default()));
        assert!(bus.header().is_some());
    }

    #[test]
    fn test_cursor_on_closed_bus() {
        let bus = bus(8, 0);
        bus.append(packet(1)).unwrap();
        bus.close();
        let mut cursor = bus.open_cursor(StartPosition::Oldest);
        assert!(matches!(
            cursor.try_read_next(),
            Some(Err(ReadError::EndOfStream))
        ));
    }
}
