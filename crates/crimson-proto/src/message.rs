//! Wire message model
//!
//! A message is a sequence-numbered header plus a tagged body union,
//! encoded little-endian into a single word-aligned segment. Replies echo
//! the request's sequence number and carry either a POSIX error code or
//! their payload.

use crate::frame::{Frame, WORD};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crimson_common::{Error, Result};

/// Write flag: acknowledge once the write is applied in memory
pub const ON_APPLY: u32 = 0x1;
/// Write flag: acknowledge once the write is committed
pub const ON_COMMIT: u32 = 0x2;

const TAG_OSD_READ: u32 = 1;
const TAG_OSD_READ_REPLY: u32 = 2;
const TAG_OSD_WRITE: u32 = 3;
const TAG_OSD_WRITE_REPLY: u32 = 4;

const UNION_ERROR: u32 = 0;
const UNION_VALUE: u32 = 1;

/// A framed request or reply
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub sequence: u32,
    pub body: Body,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Body {
    OsdRead(OsdReadArgs),
    OsdReadReply(OsdReadRes),
    OsdWrite(OsdWriteArgs),
    OsdWriteReply(OsdWriteRes),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OsdReadArgs {
    pub object: String,
    pub offset: u64,
    pub length: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OsdReadRes {
    Error(u32),
    Data(Bytes),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OsdWriteArgs {
    pub object: String,
    pub offset: u64,
    pub length: u64,
    pub data: Bytes,
    pub flags: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OsdWriteRes {
    Error(u32),
    Flags(u32),
}

impl Message {
    /// Encode into a single-segment frame, padded to a word boundary
    #[must_use]
    pub fn encode(&self) -> Frame {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u32_le(self.sequence);
        match &self.body {
            Body::OsdRead(args) => {
                buf.put_u32_le(TAG_OSD_READ);
                put_string(&mut buf, &args.object);
                buf.put_u64_le(args.offset);
                buf.put_u64_le(args.length);
            }
            Body::OsdReadReply(res) => {
                buf.put_u32_le(TAG_OSD_READ_REPLY);
                match res {
                    OsdReadRes::Error(code) => {
                        buf.put_u32_le(UNION_ERROR);
                        buf.put_u32_le(*code);
                    }
                    OsdReadRes::Data(data) => {
                        buf.put_u32_le(UNION_VALUE);
                        put_bytes(&mut buf, data);
                    }
                }
            }
            Body::OsdWrite(args) => {
                buf.put_u32_le(TAG_OSD_WRITE);
                put_string(&mut buf, &args.object);
                buf.put_u64_le(args.offset);
                buf.put_u64_le(args.length);
                put_bytes(&mut buf, &args.data);
                buf.put_u32_le(args.flags);
            }
            Body::OsdWriteReply(res) => {
                buf.put_u32_le(TAG_OSD_WRITE_REPLY);
                match res {
                    OsdWriteRes::Error(code) => {
                        buf.put_u32_le(UNION_ERROR);
                        buf.put_u32_le(*code);
                    }
                    OsdWriteRes::Flags(flags) => {
                        buf.put_u32_le(UNION_VALUE);
                        buf.put_u32_le(*flags);
                    }
                }
            }
        }

        let pad = (WORD - buf.len() % WORD) % WORD;
        buf.put_bytes(0, pad);
        Frame::single(buf.freeze())
    }

    /// Decode from the first segment of a frame
    pub fn decode(frame: &Frame) -> Result<Self> {
        let mut buf = frame
            .segments
            .first()
            .cloned()
            .ok_or_else(|| Error::protocol("message", "frame has no segments"))?;

        let sequence = get_u32(&mut buf)?;
        let tag = get_u32(&mut buf)?;
        let body = match tag {
            TAG_OSD_READ => Body::OsdRead(OsdReadArgs {
                object: get_string(&mut buf)?,
                offset: get_u64(&mut buf)?,
                length: get_u64(&mut buf)?,
            }),
            TAG_OSD_READ_REPLY => match get_u32(&mut buf)? {
                UNION_ERROR => Body::OsdReadReply(OsdReadRes::Error(get_u32(&mut buf)?)),
                UNION_VALUE => Body::OsdReadReply(OsdReadRes::Data(get_bytes(&mut buf)?)),
                which => {
                    return Err(Error::protocol(
                        "message",
                        format!("unknown read reply union {which}"),
                    ))
                }
            },
            TAG_OSD_WRITE => Body::OsdWrite(OsdWriteArgs {
                object: get_string(&mut buf)?,
                offset: get_u64(&mut buf)?,
                length: get_u64(&mut buf)?,
                data: get_bytes(&mut buf)?,
                flags: get_u32(&mut buf)?,
            }),
            TAG_OSD_WRITE_REPLY => match get_u32(&mut buf)? {
                UNION_ERROR => Body::OsdWriteReply(OsdWriteRes::Error(get_u32(&mut buf)?)),
                UNION_VALUE => Body::OsdWriteReply(OsdWriteRes::Flags(get_u32(&mut buf)?)),
                which => {
                    return Err(Error::protocol(
                        "message",
                        format!("unknown write reply union {which}"),
                    ))
                }
            },
            tag => {
                return Err(Error::protocol(
                    "message",
                    format!("unknown message tag {tag}"),
                ))
            }
        };
        Ok(Self { sequence, body })
    }
}

fn put_string(buf: &mut BytesMut, value: &str) {
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

fn put_bytes(buf: &mut BytesMut, value: &Bytes) {
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value);
}

fn need(buf: &Bytes, len: usize) -> Result<()> {
    if buf.remaining() < len {
        return Err(Error::protocol(
            "message",
            format!("truncated body: need {len} bytes, have {}", buf.remaining()),
        ));
    }
    Ok(())
}

fn get_u32(buf: &mut Bytes) -> Result<u32> {
    need(buf, 4)?;
    Ok(buf.get_u32_le())
}

fn get_u64(buf: &mut Bytes) -> Result<u64> {
    need(buf, 8)?;
    Ok(buf.get_u64_le())
}

fn get_bytes(buf: &mut Bytes) -> Result<Bytes> {
    let len = get_u32(buf)? as usize;
    need(buf, len)?;
    Ok(buf.split_to(len))
}

fn get_string(buf: &mut Bytes) -> Result<String> {
    let raw = get_bytes(buf)?;
    String::from_utf8(raw.to_vec())
        .map_err(|_| Error::protocol("message", "string field is not utf-8"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(message: Message) {
        let frame = message.encode();
        assert_eq!(frame.segments.len(), 1);
        assert_eq!(frame.segments[0].len() % WORD, 0);
        let decoded = Message::decode(&frame).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_read_args_roundtrip() {
        roundtrip(Message {
            sequence: 42,
            body: Body::OsdRead(OsdReadArgs {
                object: "an-object".into(),
                offset: 1 << 33,
                length: 4096,
            }),
        });
    }

    #[test]
    fn test_read_reply_roundtrips() {
        roundtrip(Message {
            sequence: 7,
            body: Body::OsdReadReply(OsdReadRes::Error(2)),
        });
        roundtrip(Message {
            sequence: 8,
            body: Body::OsdReadReply(OsdReadRes::Data(Bytes::from(vec![9u8; 1000]))),
        });
    }

    #[test]
    fn test_write_args_roundtrip() {
        roundtrip(Message {
            sequence: u32::MAX,
            body: Body::OsdWrite(OsdWriteArgs {
                object: "o".into(),
                offset: 0,
                length: 5,
                data: Bytes::from_static(b"hello"),
                flags: ON_APPLY | ON_COMMIT,
            }),
        });
    }

    #[test]
    fn test_write_reply_roundtrips() {
        roundtrip(Message {
            sequence: 1,
            body: Body::OsdWriteReply(OsdWriteRes::Error(22)),
        });
        roundtrip(Message {
            sequence: 2,
            body: Body::OsdWriteReply(OsdWriteRes::Flags(ON_APPLY)),
        });
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(1);
        buf.put_u32_le(99);
        let frame = Frame::single(buf.freeze());
        let err = Message::decode(&frame).unwrap_err();
        assert!(err.to_string().contains("unknown message tag"));
    }

    #[test]
    fn test_truncated_body_rejected() {
        let message = Message {
            sequence: 3,
            body: Body::OsdRead(OsdReadArgs {
                object: "x".into(),
                offset: 0,
                length: 10,
            }),
        };
        let frame = message.encode();
        let truncated = Frame::single(frame.segments[0].slice(..8));
        let err = Message::decode(&truncated).unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }
}
