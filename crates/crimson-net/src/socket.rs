//! Socket-backed connections

use crate::{Connection, Listener};
use async_trait::async_trait;
use crimson_common::Result;
use crimson_proto::{read_frame, write_frame, Frame, DEFAULT_MAX_SEGMENT_BYTES};
use std::net::SocketAddr;
use tokio::io::{BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::debug;

/// A framed-message connection over a TCP stream
pub struct SocketConnection {
    peer: Option<SocketAddr>,
    reader: Mutex<BufReader<OwnedReadHalf>>,
    writer: Mutex<BufWriter<OwnedWriteHalf>>,
    max_segment_bytes: usize,
}

impl SocketConnection {
    #[must_use]
    pub fn new(stream: TcpStream) -> Self {
        Self::with_segment_limit(stream, DEFAULT_MAX_SEGMENT_BYTES)
    }

    #[must_use]
    pub fn with_segment_limit(stream: TcpStream, max_segment_bytes: usize) -> Self {
        let peer = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        Self {
            peer,
            reader: Mutex::new(BufReader::new(read_half)),
            writer: Mutex::new(BufWriter::new(write_half)),
            max_segment_bytes,
        }
    }

    /// Connect to a remote OSD
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }

    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

#[async_trait]
impl Connection for SocketConnection {
    async fn read_message(&self) -> Result<Option<Frame>> {
        let mut reader = self.reader.lock().await;
        read_frame(&mut *reader, self.max_segment_bytes).await
    }

    async fn write_message(&self, frame: Frame) -> Result<()> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &frame).await
    }

    async fn close(&self) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        debug!(peer = ?self.peer, "connection closed");
        Ok(())
    }
}

/// Accepts socket connections on a bound address
pub struct SocketListener {
    inner: TcpListener,
    max_segment_bytes: usize,
}

impl SocketListener {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let inner = TcpListener::bind(addr).await?;
        Ok(Self {
            inner,
            max_segment_bytes: DEFAULT_MAX_SEGMENT_BYTES,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }
}

#[async_trait]
impl Listener for SocketListener {
    async fn accept(&self) -> Result<Box<dyn Connection>> {
        let (stream, peer) = self.inner.accept().await?;
        stream.set_nodelay(true)?;
        debug!(%peer, "accepted connection");
        Ok(Box::new(SocketConnection::with_segment_limit(
            stream,
            self.max_segment_bytes,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_socket_roundtrip() {
        let listener = SocketListener::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let conn = listener.accept().await.unwrap();
            let frame = conn.read_message().await.unwrap().expect("frame present");
            conn.write_message(frame).await.unwrap();
        });

        let client = SocketConnection::connect(addr).await.unwrap();
        let sent = Frame::single(Bytes::from(vec![0x5Au8; 64]));
        client.write_message(sent.clone()).await.unwrap();

        let echoed = client.read_message().await.unwrap().expect("frame present");
        assert_eq!(echoed.segments, sent.segments);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_socket_clean_close() {
        let listener = SocketListener::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let conn = listener.accept().await.unwrap();
            conn.read_message().await.unwrap()
        });

        let client = SocketConnection::connect(addr).await.unwrap();
        client.close().await.unwrap();

        assert!(server.await.unwrap().is_none());
    }
}
