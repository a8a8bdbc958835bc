//! Segmented message framing
//!
//! Messages travel as a list of segments. On the stream that is, all
//! integers little-endian:
//!
//! - 4 bytes: the number of segments, minus one
//! - N * 4 bytes: the size of each segment, in 64-bit words
//! - 0 or 4 bytes: padding up to the next word boundary
//! - the content of each segment, in order
//!
//! Segment buffers are surfaced as owned [`Bytes`]; keeping the decoded
//! [`Frame`] alive keeps the underlying buffers alive.

use bytes::{BufMut, Bytes, BytesMut};
use crimson_common::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Bytes per framing word
pub const WORD: usize = 8;

/// Ceiling on a single segment's size
pub const DEFAULT_MAX_SEGMENT_BYTES: usize = 16 * 1024 * 1024;

/// A decoded message frame: its segments, in order
#[derive(Clone, Debug, Default)]
pub struct Frame {
    pub segments: Vec<Bytes>,
}

impl Frame {
    /// Frame carrying a single segment
    #[must_use]
    pub fn single(segment: Bytes) -> Self {
        Self {
            segments: vec![segment],
        }
    }
}

/// Read one frame, or `None` on a clean end of stream
pub async fn read_frame<R>(reader: &mut R, max_segment_bytes: usize) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut count_buf = [0u8; 4];
    if !read_exact_or_eof(reader, &mut count_buf, "segment count").await? {
        return Ok(None);
    }
    let count = u32::from_le_bytes(count_buf) as usize + 1;

    let mut sizes_buf = vec![0u8; 4 * count];
    read_all(reader, &mut sizes_buf, "sizes").await?;
    let sizes: Vec<usize> = sizes_buf
        .chunks_exact(4)
        .map(|chunk| {
            let words = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            words as usize * WORD
        })
        .collect();

    for (index, &size) in sizes.iter().enumerate() {
        if size == 0 {
            return Err(Error::protocol(
                format!("segment {index}"),
                "zero-length segment",
            ));
        }
        if size > max_segment_bytes {
            return Err(Error::protocol(
                format!("segment {index}"),
                format!("size {size} exceeds limit {max_segment_bytes}"),
            ));
        }
    }

    // The count and size table occupy (1 + N) u32s; an even N leaves them
    // at a half-word boundary, padded up before the segment data.
    if count % 2 == 0 {
        let mut pad = [0u8; 4];
        read_all(reader, &mut pad, "sizes").await?;
    }

    let mut segments = Vec::with_capacity(count);
    for (index, size) in sizes.into_iter().enumerate() {
        let mut segment = vec![0u8; size];
        read_all(reader, &mut segment, &format!("segment {index}")).await?;
        segments.push(Bytes::from(segment));
    }
    Ok(Some(Frame { segments }))
}

/// Write one frame and flush it
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let count = frame.segments.len();
    if count == 0 {
        return Err(Error::invalid_argument("frame has no segments"));
    }
    for segment in &frame.segments {
        if segment.is_empty() || segment.len() % WORD != 0 {
            return Err(Error::invalid_argument(format!(
                "segment length {} is not a positive multiple of {WORD}",
                segment.len()
            )));
        }
    }

    let mut header = BytesMut::with_capacity(4 * (count + 2));
    header.put_u32_le(count as u32 - 1);
    for segment in &frame.segments {
        header.put_u32_le((segment.len() / WORD) as u32);
    }
    if count % 2 == 0 {
        header.put_u32_le(0);
    }

    writer.write_all(&header).await?;
    for segment in &frame.segments {
        writer.write_all(segment).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Fill `buf`, distinguishing a clean EOF before the first byte from a
/// torn frame
async fn read_exact_or_eof<R>(reader: &mut R, buf: &mut [u8], phase: &str) -> Result<bool>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(Error::protocol(
                phase,
                format!("short read: expected {} bytes, got {filled}", buf.len()),
            ));
        }
        filled += n;
    }
    Ok(true)
}

async fn read_all<R>(reader: &mut R, buf: &mut [u8], phase: &str) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    reader.read_exact(buf).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::protocol(phase, format!("short read of {} bytes", buf.len()))
        } else {
            Error::Io(err)
        }
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(n: usize, byte: u8) -> Bytes {
        Bytes::from(vec![byte; n * WORD])
    }

    async fn roundtrip(frame: &Frame) -> Frame {
        let (mut client, mut server) = tokio::io::duplex(1 << 20);
        write_frame(&mut client, frame).await.unwrap();
        read_frame(&mut server, DEFAULT_MAX_SEGMENT_BYTES)
            .await
            .unwrap()
            .expect("frame present")
    }

    #[tokio::test]
    async fn test_roundtrip_single_segment() {
        let frame = Frame::single(words(3, 0xAB));
        let got = roundtrip(&frame).await;
        assert_eq!(got.segments.len(), 1);
        assert_eq!(got.segments[0], frame.segments[0]);
    }

    #[tokio::test]
    async fn test_roundtrip_many_segments_any_sizes() {
        for count in 1..6usize {
            let frame = Frame {
                segments: (0..count).map(|i| words(i + 1, i as u8)).collect(),
            };
            let got = roundtrip(&frame).await;
            assert_eq!(got.segments, frame.segments);
        }
    }

    #[tokio::test]
    async fn test_even_segment_count_is_padded() {
        let frame = Frame {
            segments: vec![words(1, 1), words(2, 2)],
        };
        let mut encoded = Vec::new();
        write_frame(&mut encoded, &frame).await.unwrap();
        // count + 2 sizes + padding = 16 header bytes, then 3 words of data.
        assert_eq!(encoded.len(), 16 + 3 * WORD);
        assert_eq!(&encoded[12..16], &[0, 0, 0, 0]);

        let got = read_frame(&mut encoded.as_slice(), DEFAULT_MAX_SEGMENT_BYTES)
            .await
            .unwrap()
            .expect("frame present");
        assert_eq!(got.segments, frame.segments);
    }

    #[tokio::test]
    async fn test_clean_eof_returns_none() {
        let empty: &[u8] = &[];
        let got = read_frame(&mut &*empty, DEFAULT_MAX_SEGMENT_BYTES)
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_torn_segment_count() {
        let torn: &[u8] = &[1, 0];
        let err = read_frame(&mut &*torn, DEFAULT_MAX_SEGMENT_BYTES)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("segment count"));
    }

    #[tokio::test]
    async fn test_torn_size_table() {
        // Two segments declared, only one size present.
        let torn: &[u8] = &[1, 0, 0, 0, 1, 0, 0, 0];
        let err = read_frame(&mut &*torn, DEFAULT_MAX_SEGMENT_BYTES)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("sizes"));
    }

    #[tokio::test]
    async fn test_torn_segment_body() {
        let frame = Frame::single(words(4, 7));
        let mut encoded = Vec::new();
        write_frame(&mut encoded, &frame).await.unwrap();
        encoded.truncate(encoded.len() - 5);

        let err = read_frame(&mut encoded.as_slice(), DEFAULT_MAX_SEGMENT_BYTES)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("segment 0"));
    }

    #[tokio::test]
    async fn test_zero_length_segment_rejected() {
        // One segment of zero words.
        let bad: &[u8] = &[0, 0, 0, 0, 0, 0, 0, 0];
        let err = read_frame(&mut &*bad, DEFAULT_MAX_SEGMENT_BYTES)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("zero-length"));
    }

    #[tokio::test]
    async fn test_oversized_segment_rejected() {
        let frame = Frame::single(words(4, 1));
        let mut encoded = Vec::new();
        write_frame(&mut encoded, &frame).await.unwrap();

        let err = read_frame(&mut encoded.as_slice(), 2 * WORD)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exceeds limit"));
    }

    #[tokio::test]
    async fn test_unaligned_segment_rejected_on_write() {
        let frame = Frame::single(Bytes::from_static(&[1, 2, 3]));
        let mut out = Vec::new();
        let err = write_frame(&mut out, &frame).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
