//! Link-level abstraction over the BLE radio
//!
//! The mesh loop talks to the radio through [`LinkDriver`], keeping the loop
//! testable with an in-memory driver. Drivers deliver whole wire frames;
//! stream framing (a 4-byte big-endian length prefix, accumulated across
//! notification chunks) is handled here by [`FrameBuffer`].

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::mpsc;

use bitchat_core::Result;

// ----------------------------------------------------------------------------
// Link Identity
// ----------------------------------------------------------------------------

/// Opaque identifier for one radio link
///
/// Assigned by the driver per connection; the peer behind a link is unknown
/// until its first announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl core::fmt::Display for LinkId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Link Events
// ----------------------------------------------------------------------------

/// Events a driver posts to the mesh loop
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A connection came up and notifications are subscribed
    Up { link: LinkId },
    /// A connection dropped
    Down { link: LinkId },
    /// One complete wire frame arrived
    Frame { link: LinkId, bytes: Vec<u8> },
}

/// Channel carrying link events into the mesh loop
pub type LinkEventSender = mpsc::UnboundedSender<LinkEvent>;

// ----------------------------------------------------------------------------
// Link Driver
// ----------------------------------------------------------------------------

/// Radio backend the mesh loop drives
///
/// Implementations own connection supervision (scanning, connecting,
/// backoff) and per-peer write queues; `send_frame` fails with
/// `SendBufferFull` when a peer's queue is at capacity.
#[async_trait]
pub trait LinkDriver: Send + Sync {
    /// Begin advertising and scanning, posting events to `events`
    async fn start(&self, events: LinkEventSender) -> Result<()>;

    /// Stop the radio and drop all connections
    async fn stop(&self) -> Result<()>;

    /// Write one frame to a specific link
    async fn send_frame(&self, link: LinkId, frame: Vec<u8>) -> Result<()>;

    /// Write one frame to every connected link, optionally skipping the
    /// link a forwarded packet arrived on
    async fn broadcast_frame(&self, frame: Vec<u8>, except: Option<LinkId>) -> Result<()>;
}

// ----------------------------------------------------------------------------
// Stream Framing
// ----------------------------------------------------------------------------

/// Bytes of the length prefix in front of every frame on the wire
pub const FRAME_PREFIX_LEN: usize = 4;

/// Largest frame a peer may send us
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Prefix a frame with its length for transmission
pub fn frame_with_length(frame: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(FRAME_PREFIX_LEN + frame.len());
    framed.extend_from_slice(&(frame.len() as u32).to_be_bytes());
    framed.extend_from_slice(frame);
    framed
}

/// Accumulates notification chunks into complete frames
///
/// One buffer per inbound link; the codec runs once per complete frame.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buffer: Vec<u8>,
}

impl FrameBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes, returning every frame they complete
    ///
    /// A length prefix larger than [`MAX_FRAME_LEN`] poisons the stream;
    /// the buffer resets and the partial data is discarded.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        loop {
            if self.buffer.len() < FRAME_PREFIX_LEN {
                break;
            }
            let len = u32::from_be_bytes([
                self.buffer[0],
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
            ]) as usize;
            if len > MAX_FRAME_LEN {
                self.buffer.clear();
                break;
            }
            if self.buffer.len() < FRAME_PREFIX_LEN + len {
                break;
            }
            let frame = self.buffer[FRAME_PREFIX_LEN..FRAME_PREFIX_LEN + len].to_vec();
            self.buffer.drain(..FRAME_PREFIX_LEN + len);
            frames.push(frame);
        }
        frames
    }

    /// Bytes currently buffered
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

// ----------------------------------------------------------------------------
// Reconnect Backoff
// ----------------------------------------------------------------------------

/// Exponential reconnect backoff with jitter
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    jitter: f64,
    current: Duration,
}

impl Backoff {
    /// Create a backoff ramping from `initial` to `max`
    pub fn new(initial: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            initial,
            max,
            jitter,
            current: initial,
        }
    }

    /// Next delay; doubles up to the ceiling, with +/- jitter applied
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = core::cmp::min(self.current * 2, self.max);

        let jitter_span = base.as_secs_f64() * self.jitter;
        let offset = rand::thread_rng().gen_range(-jitter_span..=jitter_span);
        Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.0))
    }

    /// Reset after a successful connection
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_buffer_single_frame() {
        let mut buffer = FrameBuffer::new();
        let framed = frame_with_length(b"hello");
        let frames = buffer.push(&framed);
        assert_eq!(frames, vec![b"hello".to_vec()]);
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn test_frame_buffer_chunked_delivery() {
        let mut buffer = FrameBuffer::new();
        let framed = frame_with_length(b"split across notifications");

        let (first, second) = framed.split_at(7);
        assert!(buffer.push(first).is_empty());
        let frames = buffer.push(second);
        assert_eq!(frames, vec![b"split across notifications".to_vec()]);
    }

    #[test]
    fn test_frame_buffer_multiple_frames_one_chunk() {
        let mut buffer = FrameBuffer::new();
        let mut chunk = frame_with_length(b"one");
        chunk.extend_from_slice(&frame_with_length(b"two"));
        let frames = buffer.push(&chunk);
        assert_eq!(frames, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn test_frame_buffer_rejects_oversize_prefix() {
        let mut buffer = FrameBuffer::new();
        let mut chunk = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes().to_vec();
        chunk.extend_from_slice(&[0u8; 16]);
        assert!(buffer.push(&chunk).is_empty());
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn test_backoff_ramps_and_caps() {
        let mut backoff = Backoff::new(
            Duration::from_secs(1),
            Duration::from_secs(30),
            0.0,
        );
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        for _ in 0..10 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(30));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_jitter_stays_in_band() {
        let mut backoff = Backoff::new(
            Duration::from_secs(10),
            Duration::from_secs(30),
            0.2,
        );
        for _ in 0..50 {
            backoff.reset();
            let delay = backoff.next_delay().as_secs_f64();
            assert!((8.0..=12.0).contains(&delay), "delay {delay} out of band");
        }
    }
}
