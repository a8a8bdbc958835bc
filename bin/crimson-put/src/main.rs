//! Crimson Put - stream a local file into an OSD object
//!
//! Reads the file in fixed-size blocks and sends one write request per
//! block, throttling the number of outstanding requests with a semaphore
//! that is released as the server acknowledges applies.

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::Parser;
use crimson_net::{Connection, SocketConnection};
use crimson_proto::{Body, Message, OsdWriteArgs, OsdWriteRes, ON_APPLY, ON_COMMIT};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "crimson-put")]
#[command(about = "Stream a file into a Crimson OSD object")]
#[command(version)]
struct Args {
    /// OSD address
    #[arg(long, default_value = "127.0.0.1")]
    address: String,

    /// OSD port
    #[arg(long, default_value = "6800")]
    port: u16,

    /// Source file
    #[arg(long)]
    filename: String,

    /// Target object name
    #[arg(long)]
    object: String,

    /// Write block size
    #[arg(long, default_value = "4096")]
    block_size: usize,

    /// Maximum number of outstanding write requests
    #[arg(long, default_value = "32")]
    max_requests: usize,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Tracks the replies still expected for in-flight writes
struct ReplyTracker {
    entries: Mutex<HashMap<u32, Entry>>,
    throttle: Arc<Semaphore>,
}

struct Entry {
    /// Acknowledgement flags still expected
    flags: u32,
    done: oneshot::Sender<std::result::Result<(), u32>>,
}

impl ReplyTracker {
    fn new(throttle: Arc<Semaphore>) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            throttle,
        })
    }

    /// Register the acks expected for a sequence number
    fn expect(&self, sequence: u32, flags: u32) -> oneshot::Receiver<std::result::Result<(), u32>> {
        let (tx, rx) = oneshot::channel();
        self.entries.lock().insert(
            sequence,
            Entry {
                flags,
                done: tx,
            },
        );
        rx
    }

    fn on_reply(&self, message: Message) {
        let Body::OsdWriteReply(reply) = message.body else {
            warn!(sequence = message.sequence, "dropping unexpected reply body");
            return;
        };

        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&message.sequence) else {
            warn!(sequence = message.sequence, "dropping unexpected sequence");
            return;
        };

        match reply {
            OsdWriteRes::Error(code) => {
                if let Some(entry) = entries.remove(&message.sequence) {
                    let _ = entry.done.send(Err(code));
                }
                // The request slot is free even though the write failed.
                self.throttle.add_permits(1);
            }
            OsdWriteRes::Flags(flags) => {
                let acked = entry.flags & flags;
                if acked & ON_APPLY != 0 {
                    self.throttle.add_permits(1);
                }
                entry.flags &= !acked;
                if entry.flags == 0 {
                    if let Some(entry) = entries.remove(&message.sequence) {
                        let _ = entry.done.send(Ok(()));
                    }
                }
            }
        }
    }
}

/// Drain replies off the connection until it closes
async fn read_replies(conn: Arc<SocketConnection>, tracker: Arc<ReplyTracker>) {
    loop {
        match conn.read_message().await {
            Ok(Some(frame)) => match Message::decode(&frame) {
                Ok(message) => tracker.on_reply(message),
                Err(err) => {
                    warn!(%err, "reply decode failed");
                    break;
                }
            },
            Ok(None) => break,
            Err(err) => {
                warn!(%err, "reply read failed");
                break;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if args.block_size == 0 {
        bail!("--block-size must be nonzero");
    }

    let mut file = tokio::fs::File::open(&args.filename)
        .await
        .with_context(|| format!("failed to open {}", args.filename))?;
    let size = file.metadata().await?.len();

    let addr = format!("{}:{}", args.address, args.port)
        .parse()
        .with_context(|| format!("invalid address {}:{}", args.address, args.port))?;
    let conn = Arc::new(
        SocketConnection::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?,
    );
    debug!(%addr, "connected");

    let throttle = Arc::new(Semaphore::new(args.max_requests));
    let tracker = ReplyTracker::new(throttle.clone());
    let reader = tokio::spawn(read_replies(conn.clone(), tracker.clone()));

    let flags = ON_APPLY | ON_COMMIT;
    let mut pending = Vec::new();
    let mut sequence = 0u32;
    let mut offset = 0u64;
    while offset < size {
        let len = (args.block_size as u64).min(size - offset) as usize;
        let mut block = vec![0u8; len];
        file.read_exact(&mut block).await?;

        // One permit per outstanding request; returned on ON_APPLY.
        throttle.acquire().await?.forget();

        pending.push((sequence, tracker.expect(sequence, flags)));
        debug!(sequence, offset, len, "osd write");
        conn.write_message(
            Message {
                sequence,
                body: Body::OsdWrite(OsdWriteArgs {
                    object: args.object.clone(),
                    offset,
                    length: len as u64,
                    data: Bytes::from(block),
                    flags,
                }),
            }
            .encode(),
        )
        .await?;

        sequence += 1;
        offset += len as u64;
    }

    for (sequence, done) in pending {
        match done.await {
            Ok(Ok(())) => {}
            Ok(Err(code)) => bail!("write {sequence} failed with error {code}"),
            Err(_) => bail!("connection closed before write {sequence} was acknowledged"),
        }
    }

    conn.close().await?;
    reader.abort();

    println!(
        "wrote {size} bytes to {} in {sequence} blocks",
        args.object
    );
    Ok(())
}
