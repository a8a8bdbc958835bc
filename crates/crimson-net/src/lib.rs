//! Crimson Net - the connection layer
//!
//! A [`Connection`] reads and writes framed messages; a [`Listener`]
//! accepts connections. Both come in two flavors sharing the abstraction:
//! real sockets, and in-process queue pairs used by tests and embedded
//! clients.

mod direct;
mod socket;

pub use direct::{DirectConnection, DirectListener};
pub use socket::{SocketConnection, SocketListener};

use async_trait::async_trait;
use crimson_common::Result;
use crimson_proto::Frame;

/// A bidirectional framed-message transport
#[async_trait]
pub trait Connection: Send + Sync {
    /// Read the next message frame; `None` when the peer closed cleanly
    async fn read_message(&self) -> Result<Option<Frame>>;

    /// Write one message frame
    async fn write_message(&self, frame: Frame) -> Result<()>;

    /// Close the connection
    async fn close(&self) -> Result<()>;
}

/// An acceptor of incoming connections
#[async_trait]
pub trait Listener: Send + Sync {
    async fn accept(&self) -> Result<Box<dyn Connection>>;
}
