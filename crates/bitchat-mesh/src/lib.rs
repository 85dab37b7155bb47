//! BLE mesh transport for BitChat
//!
//! The mesh is driven by a single-owner loop task that holds every piece of
//! mutable transport state: Noise sessions, the dedup cache, reassembly
//! buffers, the peer book, and the queues of private messages waiting for a
//! session. BLE callbacks and timers post messages to the loop; nothing
//! mutates mesh state from outside it.

pub mod ble;
pub mod link;
pub mod peers;
pub mod transport;

pub use link::{Backoff, FrameBuffer, LinkDriver, LinkEvent, LinkId};
pub use transport::{MeshOptions, MeshTransport};
