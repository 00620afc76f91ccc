//! Push channel abstraction.

use std::future::Future;

use crate::error::SyncResult;

/// An open push connection yielding text messages.
pub trait PushConnection: Send {
    /// Next message. `None` when the server closed the connection.
    ///
    /// An `Err` is a channel failure; the connection is dropped afterwards.
    fn next_message(&mut self) -> impl Future<Output = Option<SyncResult<String>>> + Send;
}

/// Something that can open push connections.
pub trait PushChannel: Send + Sync + 'static {
    /// Connection type.
    type Connection: PushConnection;

    /// Open a new connection.
    fn connect(&self) -> impl Future<Output = SyncResult<Self::Connection>> + Send;
}
