//! In-process connections
//!
//! A `DirectConnection` pair ships decoded frames over unbounded channels
//! without touching the codec, giving tests and embedded clients the same
//! `Connection` surface as a socket.

use crate::{Connection, Listener};
use async_trait::async_trait;
use crimson_common::{Error, Result};
use crimson_proto::Frame;
use parking_lot::Mutex as SyncMutex;
use std::collections::VecDeque;
use tokio::sync::{mpsc, Mutex, Notify};

/// One endpoint of an in-process connection
pub struct DirectConnection {
    tx: mpsc::UnboundedSender<Frame>,
    rx: Mutex<mpsc::UnboundedReceiver<Frame>>,
}

impl DirectConnection {
    /// A connected pair of endpoints
    #[must_use]
    pub fn make_pair() -> (DirectConnection, DirectConnection) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            DirectConnection {
                tx: a_tx,
                rx: Mutex::new(a_rx),
            },
            DirectConnection {
                tx: b_tx,
                rx: Mutex::new(b_rx),
            },
        )
    }
}

#[async_trait]
impl Connection for DirectConnection {
    async fn read_message(&self) -> Result<Option<Frame>> {
        Ok(self.rx.lock().await.recv().await)
    }

    async fn write_message(&self, frame: Frame) -> Result<()> {
        self.tx
            .send(frame)
            .map_err(|_| Error::protocol("direct", "peer endpoint closed"))
    }

    async fn close(&self) -> Result<()> {
        self.rx.lock().await.close();
        Ok(())
    }
}

/// Rendezvous point for in-process clients
///
/// `connect()` hands one endpoint to the caller and queues the other for
/// `accept()`.
#[derive(Default)]
pub struct DirectListener {
    pending: SyncMutex<VecDeque<DirectConnection>>,
    notify: Notify,
}

impl DirectListener {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a connection pair and surface the server end to `accept()`
    pub fn connect(&self) -> DirectConnection {
        let (client, server) = DirectConnection::make_pair();
        self.pending.lock().push_back(server);
        self.notify.notify_one();
        client
    }
}

#[async_trait]
impl Listener for DirectListener {
    async fn accept(&self) -> Result<Box<dyn Connection>> {
        loop {
            if let Some(conn) = self.pending.lock().pop_front() {
                return Ok(Box::new(conn));
            }
            self.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_pair_roundtrip() {
        let (a, b) = DirectConnection::make_pair();

        let frame = Frame::single(Bytes::from_static(b"12345678"));
        a.write_message(frame.clone()).await.unwrap();

        let got = b.read_message().await.unwrap().expect("frame present");
        assert_eq!(got.segments, frame.segments);

        // And the other direction.
        b.write_message(frame.clone()).await.unwrap();
        let got = a.read_message().await.unwrap().expect("frame present");
        assert_eq!(got.segments, frame.segments);
    }

    #[tokio::test]
    async fn test_dropped_peer_reads_none() {
        let (a, b) = DirectConnection::make_pair();
        drop(a);
        assert!(b.read_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_listener_rendezvous() {
        let listener = DirectListener::new();

        let client = listener.connect();
        let server = listener.accept().await.unwrap();

        client
            .write_message(Frame::single(Bytes::from_static(b"abcdefgh")))
            .await
            .unwrap();
        let got = server.read_message().await.unwrap().expect("frame present");
        assert_eq!(got.segments[0], Bytes::from_static(b"abcdefgh"));
    }
}
