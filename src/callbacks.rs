use std::sync::Arc;

use crate::buffer::Buffer;
use crate::connection::TcpConnection;

/// Invoked on the owning loop once a connection reaches `Connected`.
pub type ConnectedCallback = Arc<dyn Fn(&TcpConnection) + Send + Sync>;

/// Invoked on the owning loop exactly once, after the connection reaches
/// `Disconnected`.
pub type DisconnectedCallback = Arc<dyn Fn(&TcpConnection) + Send + Sync>;

/// Invoked after each successful read with the connection's input buffer.
/// The callback consumes whatever it processed via `retrieve`/`retrieve_all`.
pub type MessageCallback = Arc<dyn Fn(&TcpConnection, &mut Buffer) + Send + Sync>;

/// Invoked when the output buffer drains to zero.
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnection) + Send + Sync>;

/// Invoked when a send leaves at least the high-water threshold buffered;
/// the second argument is the buffered byte count.
pub type HighWaterCallback = Arc<dyn Fn(&TcpConnection, usize) + Send + Sync>;

// Default no-op callbacks are installed at construction so the hot paths
// never branch on a missing callback.

pub(crate) fn default_connected() -> ConnectedCallback {
    Arc::new(|_| {})
}

pub(crate) fn default_disconnected() -> DisconnectedCallback {
    Arc::new(|_| {})
}

pub(crate) fn default_message() -> MessageCallback {
    Arc::new(|_, input| {
        input.retrieve_all();
    })
}

pub(crate) fn default_write_complete() -> WriteCompleteCallback {
    Arc::new(|_| {})
}

pub(crate) fn default_high_water() -> HighWaterCallback {
    Arc::new(|_, _| {})
}
