//! Request dispatcher
//!
//! Translates wire messages into store operations against the boot
//! collection. Replies echo the request's sequence number and carry
//! either the payload or a POSIX error code. A protocol failure closes
//! the offending connection and nothing else.

use bytes::Bytes;
use crimson_common::{Error, Range, Result};
use crimson_net::Connection;
use crimson_proto::{
    Body, Message, OsdReadArgs, OsdReadRes, OsdWriteArgs, OsdWriteRes, ON_APPLY, ON_COMMIT,
};
use crimson_store::{Collection, Store};
use tracing::{debug, warn};

/// Collection served to remote clients
const BOOT_COLLECTION: &str = "osd";

/// The OSD request dispatcher
pub struct OsdServer {
    store: Store,
    boot: Collection,
}

impl OsdServer {
    /// Build the store and its boot collection
    pub async fn new(workers: usize) -> Result<Self> {
        let store = Store::new(workers)?;
        let boot = store.create_collection(BOOT_COLLECTION).await?;
        Ok(Self { store, boot })
    }

    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Serve one connection until it closes or misbehaves
    pub async fn handle_connection(&self, conn: Box<dyn Connection>) {
        loop {
            let frame = match conn.read_message().await {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => {
                    warn!(%err, "closing connection");
                    break;
                }
            };
            let message = match Message::decode(&frame) {
                Ok(message) => message,
                Err(err) => {
                    warn!(%err, "closing connection");
                    break;
                }
            };

            let reply = match self.dispatch(message).await {
                Ok(reply) => reply,
                Err(err) => {
                    warn!(%err, "closing connection");
                    break;
                }
            };
            if let Err(err) = conn.write_message(reply.encode()).await {
                warn!(%err, "reply failed, closing connection");
                break;
            }
        }
        let _ = conn.close().await;
    }

    /// Route one decoded message and build its reply
    async fn dispatch(&self, message: Message) -> Result<Message> {
        let sequence = message.sequence;
        match message.body {
            Body::OsdRead(args) => {
                debug!(sequence, object = %args.object, offset = args.offset,
                       length = args.length, "osd read");
                let result = match self.read(&args).await {
                    Ok(data) => OsdReadRes::Data(data),
                    Err(err) => OsdReadRes::Error(err.errno()),
                };
                Ok(Message {
                    sequence,
                    body: Body::OsdReadReply(result),
                })
            }
            Body::OsdWrite(args) => {
                debug!(sequence, object = %args.object, offset = args.offset,
                       length = args.length, flags = args.flags, "osd write");
                let result = match self.write(&args).await {
                    Ok(flags) => OsdWriteRes::Flags(flags),
                    Err(err) => OsdWriteRes::Error(err.errno()),
                };
                Ok(Message {
                    sequence,
                    body: Body::OsdWriteReply(result),
                })
            }
            Body::OsdReadReply(_) | Body::OsdWriteReply(_) => Err(Error::protocol(
                "message",
                "unexpected reply from client",
            )),
        }
    }

    async fn read(&self, args: &OsdReadArgs) -> Result<Bytes> {
        let object = self.boot.lookup(&args.object).await?;
        let range = Range::new(args.offset, args.length);
        let iov = object.read(range).await?;
        // Holes become explicit zeros on the wire.
        Ok(iov.contiguous(range))
    }

    async fn write(&self, args: &OsdWriteArgs) -> Result<u32> {
        if args.data.len() as u64 != args.length {
            return Err(Error::invalid_argument(format!(
                "write declares {} bytes but carries {}",
                args.length,
                args.data.len()
            )));
        }
        if args.offset.checked_add(args.length).is_none() {
            return Err(Error::invalid_argument(format!(
                "write offset {} + length {} overflows",
                args.offset, args.length
            )));
        }
        let object = self.boot.create(&args.object, false).await?;
        object.write_at(args.offset, args.data.clone()).await?;
        if args.flags & ON_COMMIT != 0 {
            object.commit().await?;
        }
        // Both acknowledgement levels are satisfied by now; reply with
        // whichever the client asked for, in one message.
        Ok(args.flags & (ON_APPLY | ON_COMMIT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crimson_common::error::errno;
    use crimson_net::DirectConnection;
    use std::sync::Arc;

    async fn serve_pair(server: Arc<OsdServer>) -> DirectConnection {
        let (client, served) = DirectConnection::make_pair();
        tokio::spawn(async move {
            server.handle_connection(Box::new(served)).await;
        });
        client
    }

    async fn call(conn: &DirectConnection, message: Message) -> Message {
        conn.write_message(message.encode()).await.unwrap();
        let frame = conn.read_message().await.unwrap().expect("reply present");
        Message::decode(&frame).unwrap()
    }

    #[tokio::test]
    async fn test_read_of_missing_object_returns_enoent() {
        // Scenario: read a nonexistent object over the wire.
        let server = Arc::new(OsdServer::new(2).await.unwrap());
        let conn = serve_pair(server).await;

        let reply = call(
            &conn,
            Message {
                sequence: 77,
                body: Body::OsdRead(OsdReadArgs {
                    object: "missing".into(),
                    offset: 0,
                    length: 1024,
                }),
            },
        )
        .await;

        assert_eq!(reply.sequence, 77);
        assert_eq!(
            reply.body,
            Body::OsdReadReply(OsdReadRes::Error(errno::ENOENT))
        );
    }

    #[tokio::test]
    async fn test_write_then_read_roundtrip() {
        let server = Arc::new(OsdServer::new(2).await.unwrap());
        let conn = serve_pair(server).await;

        let payload = Bytes::from(vec![0x42u8; 8192]);
        let reply = call(
            &conn,
            Message {
                sequence: 1,
                body: Body::OsdWrite(OsdWriteArgs {
                    object: "obj".into(),
                    offset: 512,
                    length: payload.len() as u64,
                    data: payload.clone(),
                    flags: ON_APPLY | ON_COMMIT,
                }),
            },
        )
        .await;
        assert_eq!(reply.sequence, 1);
        assert_eq!(
            reply.body,
            Body::OsdWriteReply(OsdWriteRes::Flags(ON_APPLY | ON_COMMIT))
        );

        let reply = call(
            &conn,
            Message {
                sequence: 2,
                body: Body::OsdRead(OsdReadArgs {
                    object: "obj".into(),
                    offset: 512,
                    length: payload.len() as u64,
                }),
            },
        )
        .await;
        assert_eq!(reply.sequence, 2);
        assert_eq!(reply.body, Body::OsdReadReply(OsdReadRes::Data(payload)));
    }

    #[tokio::test]
    async fn test_read_past_end_returns_einval() {
        let server = Arc::new(OsdServer::new(2).await.unwrap());
        let conn = serve_pair(server).await;

        call(
            &conn,
            Message {
                sequence: 1,
                body: Body::OsdWrite(OsdWriteArgs {
                    object: "short".into(),
                    offset: 0,
                    length: 1024,
                    data: Bytes::from(vec![0x41u8; 1024]),
                    flags: ON_APPLY,
                }),
            },
        )
        .await;

        let reply = call(
            &conn,
            Message {
                sequence: 2,
                body: Body::OsdRead(OsdReadArgs {
                    object: "short".into(),
                    offset: 65536,
                    length: 1024,
                }),
            },
        )
        .await;
        assert_eq!(
            reply.body,
            Body::OsdReadReply(OsdReadRes::Error(errno::EINVAL))
        );
    }

    #[tokio::test]
    async fn test_length_mismatch_rejected() {
        let server = Arc::new(OsdServer::new(2).await.unwrap());
        let conn = serve_pair(server).await;

        let reply = call(
            &conn,
            Message {
                sequence: 9,
                body: Body::OsdWrite(OsdWriteArgs {
                    object: "obj".into(),
                    offset: 0,
                    length: 10,
                    data: Bytes::from_static(b"four"),
                    flags: ON_APPLY,
                }),
            },
        )
        .await;
        assert_eq!(
            reply.body,
            Body::OsdWriteReply(OsdWriteRes::Error(errno::EINVAL))
        );
    }

    #[tokio::test]
    async fn test_reads_see_holes_as_zeros() {
        let server = Arc::new(OsdServer::new(2).await.unwrap());
        let conn = serve_pair(server).await;

        // Write a short tail, leaving [0, 4096) as a hole.
        call(
            &conn,
            Message {
                sequence: 1,
                body: Body::OsdWrite(OsdWriteArgs {
                    object: "sparse".into(),
                    offset: 4096,
                    length: 16,
                    data: Bytes::from(vec![0xFFu8; 16]),
                    flags: ON_APPLY,
                }),
            },
        )
        .await;

        let reply = call(
            &conn,
            Message {
                sequence: 2,
                body: Body::OsdRead(OsdReadArgs {
                    object: "sparse".into(),
                    offset: 0,
                    length: 4112,
                }),
            },
        )
        .await;
        match reply.body {
            Body::OsdReadReply(OsdReadRes::Data(data)) => {
                assert_eq!(data.len(), 4112);
                assert!(data[..4096].iter().all(|&b| b == 0));
                assert!(data[4096..].iter().all(|&b| b == 0xFF));
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_client_sending_reply_closes_connection() {
        let server = Arc::new(OsdServer::new(2).await.unwrap());
        let conn = serve_pair(server).await;

        conn.write_message(
            Message {
                sequence: 1,
                body: Body::OsdWriteReply(OsdWriteRes::Flags(0)),
            }
            .encode(),
        )
        .await
        .unwrap();

        assert!(conn.read_message().await.unwrap().is_none());
    }
}
