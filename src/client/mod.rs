//! Offline device side: a local store, the outbox that replays queued writes and
//! a replica that follows the server's change feed.

pub mod error;
pub mod outbox;
pub mod replica;
pub mod store;
pub mod transport;

pub use error::{ClientError, ClientResult, RetryClass};
pub use outbox::{
    FlushReport, FlushStop, OutboxItem, OutboxManager, OutboxOperation, QueuedMutation,
};
pub use replica::{Replica, SyncReport};
pub use store::{DeviceDb, open_device_store};
pub use transport::{HttpTransport, SyncTransport};
