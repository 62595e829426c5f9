use std::io;

use bytes::{Bytes, BytesMut};
use futures::{StreamExt, stream};

use crate::caching::{CacheEntry, CacheError};
use crate::types::ByteStream;

/// The outcome of [`buffer_stream`].
pub enum Buffered {
    /// The whole stream fit within the limit.
    Complete(Bytes),
    /// The stream exceeded the limit. This stream yields everything, including the part
    /// that was already read.
    Overflow(ByteStream),
}

/// Reads `stream` into memory as long as it stays within `limit` bytes.
pub async fn buffer_stream(mut stream: ByteStream, limit: u64) -> io::Result<Buffered> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if (buf.len() + chunk.len()) as u64 > limit {
            let head = [buf.freeze(), chunk]
                .into_iter()
                .filter(|chunk| !chunk.is_empty())
                .map(Ok);
            return Ok(Buffered::Overflow(stream::iter(head).chain(stream).boxed()));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(Buffered::Complete(buf.freeze()))
}

/// Reads `stream` into memory, failing with [`CacheError::TooLarge`] beyond `limit` bytes.
pub async fn read_to_bytes(stream: ByteStream, limit: u64) -> CacheEntry<Bytes> {
    match buffer_stream(stream, limit).await? {
        Buffered::Complete(bytes) => Ok(bytes),
        Buffered::Overflow(_) => Err(CacheError::TooLarge),
    }
}

/// A stream yielding `bytes` as a single chunk.
pub fn bytes_stream(bytes: Bytes) -> ByteStream {
    stream::once(async move { Ok(bytes) }).boxed()
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;

    use super::*;

    fn chunked(chunks: &[&'static [u8]]) -> ByteStream {
        let chunks: Vec<_> = chunks.iter().map(|c| Ok(Bytes::from_static(c))).collect();
        stream::iter(chunks).boxed()
    }

    #[tokio::test]
    async fn test_buffer_within_limit() {
        let buffered = buffer_stream(chunked(&[b"hello ", b"world"]), 11)
            .await
            .unwrap();
        match buffered {
            Buffered::Complete(bytes) => assert_eq!(&bytes[..], b"hello world"),
            Buffered::Overflow(_) => panic!("expected the stream to fit"),
        }
    }

    #[tokio::test]
    async fn test_overflow_keeps_content() {
        let buffered = buffer_stream(chunked(&[b"hello ", b"big ", b"world"]), 8)
            .await
            .unwrap();
        let Buffered::Overflow(stream) = buffered else {
            panic!("expected the stream to overflow");
        };
        let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"hello big world");
    }

    #[tokio::test]
    async fn test_read_to_bytes_too_large() {
        let result = read_to_bytes(chunked(&[b"hello"]), 4).await;
        assert_eq!(result, Err(CacheError::TooLarge));
    }
}
