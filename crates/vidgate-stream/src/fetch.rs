//! Chunked fetch loop: bounded blob reads across a negotiated window.

use std::sync::Arc;

use async_stream::try_stream;
use bytes::Bytes;
use futures::Stream;
use tracing::debug;

use crate::{BlobSource, RangeWindow, StreamError};

/// One bounded read from the blob source, consumed immediately by the
/// response body and then dropped.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub offset: u64,
    pub bytes: Bytes,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Mutable progress through a window. Owned exclusively by the fetch loop for
/// the lifetime of one request.
#[derive(Debug)]
struct StreamCursor {
    position: u64,
    remaining: u64,
}

impl StreamCursor {
    fn new(window: RangeWindow) -> Self {
        Self {
            position: window.start,
            remaining: window.len(),
        }
    }

    fn advance(&mut self, len: u64) {
        self.position += len;
        self.remaining -= len;
    }
}

/// Produces a lazy, finite, non-restartable sequence of [`Chunk`]s covering
/// `[window.start, window.end]` exactly once, in ascending offset order, with
/// no gaps and no overlaps.
///
/// Each item is one bounded `read_range` round trip; the loop issues exactly
/// `ceil(window.len() / chunk_size)` reads and holds at most one chunk in
/// flight, so backend load stays proportional to the consumer's pace. A failed
/// read ends the stream with an error rather than silently truncating it, and
/// dropping the stream issues no further reads.
pub fn chunk_stream<S>(
    source: Arc<S>,
    key: String,
    window: RangeWindow,
    chunk_size: u64,
) -> impl Stream<Item = Result<Chunk, StreamError>>
where
    S: BlobSource + ?Sized,
{
    let chunk_size = chunk_size.max(1);

    try_stream! {
        let mut cursor = StreamCursor::new(window);

        while cursor.remaining > 0 {
            let len = cursor.remaining.min(chunk_size);
            let end = cursor.position + len - 1;

            let bytes = source.read_range(&key, cursor.position, end).await?;
            if bytes.len() as u64 != len {
                Err(StreamError::ShortRead {
                    key: key.clone(),
                    offset: cursor.position,
                    expected: len,
                    actual: bytes.len() as u64,
                })?;
            }

            debug!(key = %key, offset = cursor.position, len, "chunk fetched");

            let chunk = Chunk {
                offset: cursor.position,
                bytes,
            };
            cursor.advance(len);
            yield chunk;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::memory::MemoryBlobSource;
    use crate::negotiate_range;
    use futures::{pin_mut, StreamExt};

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn source_with(key: &str, body: &[u8]) -> Arc<MemoryBlobSource> {
        let source = Arc::new(MemoryBlobSource::new());
        source.insert(key, Bytes::copy_from_slice(body), Some("video/mp4"));
        source
    }

    async fn collect_bytes(
        source: Arc<MemoryBlobSource>,
        key: &str,
        window: RangeWindow,
        chunk_size: u64,
    ) -> Vec<u8> {
        let stream = chunk_stream(source, key.to_string(), window, chunk_size);
        pin_mut!(stream);

        let mut out = Vec::new();
        let mut next_offset = window.start;
        while let Some(item) = stream.next().await {
            let chunk = item.unwrap();
            assert_eq!(chunk.offset, next_offset, "chunks must be contiguous");
            next_offset += chunk.len() as u64;
            out.extend_from_slice(&chunk.bytes);
        }
        out
    }

    #[tokio::test]
    async fn full_window_reproduces_source_bytes() {
        let body = pattern(5000);
        let source = source_with("a.mp4", &body);
        let window = negotiate_range(None, 5000).unwrap();

        let out = collect_bytes(source.clone(), "a.mp4", window, 1024).await;
        assert_eq!(out, body);
        // ceil(5000 / 1024) reads, no prefetch beyond that.
        assert_eq!(source.read_count(), 5);
    }

    #[tokio::test]
    async fn partial_window_covers_exact_interval() {
        let body = pattern(1000);
        let source = source_with("a.mp4", &body);
        let window = negotiate_range(Some("bytes=990-2000"), 1000).unwrap();

        let out = collect_bytes(source.clone(), "a.mp4", window, 64).await;
        assert_eq!(out, &body[990..1000]);
        assert_eq!(source.read_count(), 1);
    }

    #[tokio::test]
    async fn single_byte_window_issues_one_read() {
        let body = pattern(1000);
        let source = source_with("a.mp4", &body);
        let window = negotiate_range(Some("bytes=0-0"), 1000).unwrap();

        let out = collect_bytes(source.clone(), "a.mp4", window, 4096).await;
        assert_eq!(out, &body[0..1]);
        assert_eq!(source.read_count(), 1);
    }

    #[tokio::test]
    async fn chunk_sizes_never_exceed_configured_maximum() {
        let body = pattern(10_000);
        let source = source_with("a.mp4", &body);
        let window = negotiate_range(None, 10_000).unwrap();

        let stream = chunk_stream(source, "a.mp4".to_string(), window, 3000);
        pin_mut!(stream);

        let mut lens = Vec::new();
        while let Some(item) = stream.next().await {
            lens.push(item.unwrap().len());
        }
        assert_eq!(lens, vec![3000, 3000, 3000, 1000]);
    }

    #[tokio::test]
    async fn two_full_streams_are_byte_identical() {
        let body = pattern(4096);
        let source = source_with("a.mp4", &body);
        let window = negotiate_range(None, 4096).unwrap();

        let first = collect_bytes(source.clone(), "a.mp4", window, 1000).await;
        let second = collect_bytes(source, "a.mp4", window, 1000).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn dropping_the_stream_stops_backend_reads() {
        let body = pattern(10_240);
        let source = source_with("a.mp4", &body);
        let window = negotiate_range(None, 10_240).unwrap();

        // 10 expected chunks at 1024 bytes; consume two then drop.
        {
            let stream = chunk_stream(source.clone(), "a.mp4".to_string(), window, 1024);
            pin_mut!(stream);
            stream.next().await.unwrap().unwrap();
            stream.next().await.unwrap().unwrap();
        }

        assert!(
            source.read_count() <= 3,
            "expected at most one in-flight read beyond the consumed chunks, saw {}",
            source.read_count()
        );
    }

    #[tokio::test]
    async fn mid_stream_read_failure_surfaces_after_good_chunks() {
        let body = pattern(10_240);
        let source = source_with("a.mp4", &body);
        // Chunk 5 of 10 starts at offset 4096.
        source.fail_read_at(4096);
        let window = negotiate_range(None, 10_240).unwrap();

        let stream = chunk_stream(source, "a.mp4".to_string(), window, 1024);
        pin_mut!(stream);

        let mut ok_chunks = 0;
        let mut saw_error = false;
        while let Some(item) = stream.next().await {
            match item {
                Ok(_) => ok_chunks += 1,
                Err(err) => {
                    assert!(matches!(err, StreamError::BackendRead { offset: 4096, .. }));
                    saw_error = true;
                    break;
                }
            }
        }
        assert_eq!(ok_chunks, 4);
        assert!(saw_error);
    }

    #[tokio::test]
    async fn missing_object_fails_on_first_read() {
        let source = Arc::new(MemoryBlobSource::new());
        let window = RangeWindow {
            start: 0,
            end: 99,
            is_partial: false,
        };

        let stream = chunk_stream(source, "ghost.mp4".to_string(), window, 64);
        pin_mut!(stream);

        let first = stream.next().await.unwrap();
        assert!(matches!(first, Err(StreamError::NotFound(_))));
    }
}
