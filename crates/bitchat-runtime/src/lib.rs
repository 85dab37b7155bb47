//! BitChat runtime: everything above the transports
//!
//! The router picks a transport per recipient and parks messages for
//! unreachable peers in an outbox. The public pipeline batches, orders and
//! deduplicates broadcast messages from all transports. The pending-file
//! manager holds inbound transfers under strict memory bounds until the
//! user decides. The runtime wires these together around the event plane.

pub mod favorites;
pub mod pending;
pub mod pipeline;
pub mod router;
pub mod runtime;

pub use favorites::FavoritesStore;
pub use pending::{PendingFileError, PendingFileManager, PendingFileSink, PendingFileTransfer};
pub use pipeline::{ChannelKind, PipelineSink, PublicPipeline};
pub use router::MessageRouter;
pub use runtime::BitchatRuntime;
