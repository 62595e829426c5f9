//! Splitting one byte stream into independent readers.
//!
//! A feeder task reads the upstream once and forwards every chunk to a bounded channel per
//! reader. Each reader buffers at most `fanout_buffer_chunks` chunks, so the memory held for one
//! waiter is bounded by that many upstream chunks. A reader that stays full for longer than
//! `fanout_stall_timeout` is detached, and ends with a [`io::ErrorKind::TimedOut`] error instead
//! of stalling everyone else.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, ready};
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use futures::{Stream, StreamExt};
use sentry::{Hub, SentryFutureExt};
use tokio::sync::mpsc;

use crate::config::CoalescingConfig;
use crate::types::ByteStream;

type Chunk = io::Result<Bytes>;

/// Splits streams into multiple readers.
#[derive(Clone, Debug)]
pub struct Fanout {
    buffer_chunks: usize,
    stall_timeout: Duration,
    runtime: tokio::runtime::Handle,
}

impl Fanout {
    pub fn new(config: &CoalescingConfig, runtime: tokio::runtime::Handle) -> Self {
        Self {
            buffer_chunks: config.fanout_buffer_chunks.max(1),
            stall_timeout: config.fanout_stall_timeout,
            runtime,
        }
    }

    pub fn runtime(&self) -> &tokio::runtime::Handle {
        &self.runtime
    }

    /// Splits `upstream` into `readers` streams yielding the same bytes.
    ///
    /// For a single reader, the upstream is returned as is.
    pub fn split(&self, upstream: ByteStream, readers: usize) -> Vec<ByteStream> {
        if readers <= 1 {
            return (readers == 1).then_some(upstream).into_iter().collect();
        }

        let mut sinks = Vec::with_capacity(readers);
        let mut streams = Vec::with_capacity(readers);
        for _ in 0..readers {
            let (sender, receiver) = mpsc::channel(self.buffer_chunks);
            let abandoned = Arc::new(AtomicBool::new(false));
            sinks.push(Sink {
                sender,
                abandoned: Arc::clone(&abandoned),
            });
            streams.push(
                FanoutReader {
                    receiver,
                    abandoned,
                    finished: false,
                }
                .boxed(),
            );
        }

        let feeder = feed(upstream, sinks, self.stall_timeout);
        self.runtime
            .spawn(feeder.bind_hub(Hub::new_from_top(Hub::current())));
        streams
    }
}

struct Sink {
    sender: mpsc::Sender<Chunk>,
    abandoned: Arc<AtomicBool>,
}

async fn feed(mut upstream: ByteStream, mut sinks: Vec<Sink>, stall_timeout: Duration) {
    while !sinks.is_empty() {
        let Some(chunk) = upstream.next().await else {
            return;
        };

        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                tracing::debug!(error = %err, "Upstream of shared stream failed");
                let sends = sinks.iter().map(|sink| {
                    let err = io::Error::new(err.kind(), err.to_string());
                    tokio::time::timeout(stall_timeout, sink.sender.send(Err(err)))
                });
                join_all(sends).await;
                return;
            }
        };

        let sends = sinks.iter().map(|sink| {
            tokio::time::timeout(stall_timeout, sink.sender.send(Ok(chunk.clone())))
        });
        let results = join_all(sends).await;

        sinks = sinks
            .into_iter()
            .zip(results)
            .filter_map(|(sink, result)| match result {
                Ok(Ok(())) => Some(sink),
                // the reader is gone
                Ok(Err(_)) => None,
                Err(_) => {
                    tracing::warn!("Detaching a stalled reader from a shared stream");
                    metric!(counter("coalescing.fanout.stalled") += 1);
                    sink.abandoned.store(true, Ordering::SeqCst);
                    None
                }
            })
            .collect();
    }
    tracing::trace!("All readers of a shared stream are gone");
}

/// One reader of a split stream.
struct FanoutReader {
    receiver: mpsc::Receiver<Chunk>,
    abandoned: Arc<AtomicBool>,
    finished: bool,
}

impl Stream for FanoutReader {
    type Item = Chunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match ready!(self.receiver.poll_recv(cx)) {
            Some(chunk) => Poll::Ready(Some(chunk)),
            None => {
                self.finished = true;
                if self.abandoned.load(Ordering::SeqCst) {
                    let err = io::Error::new(
                        io::ErrorKind::TimedOut,
                        "reader fell behind the shared stream",
                    );
                    Poll::Ready(Some(Err(err)))
                } else {
                    Poll::Ready(None)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::{TryStreamExt, stream};

    use super::*;

    fn fanout(buffer_chunks: usize, stall_timeout: Duration) -> Fanout {
        let config = CoalescingConfig {
            fanout_buffer_chunks: buffer_chunks,
            fanout_stall_timeout: stall_timeout,
            ..Default::default()
        };
        Fanout::new(&config, tokio::runtime::Handle::current())
    }

    fn chunks(count: usize) -> ByteStream {
        let chunks: Vec<_> = (0..count)
            .map(|i| Ok(Bytes::from(format!("chunk-{i};"))))
            .collect();
        stream::iter(chunks).boxed()
    }

    async fn collect(stream: ByteStream) -> io::Result<Vec<u8>> {
        let chunks: Vec<Bytes> = stream.try_collect().await?;
        Ok(chunks.concat())
    }

    #[tokio::test]
    async fn test_readers_get_identical_bytes() {
        mediarepo_test::setup();
        let expected = collect(chunks(50)).await.unwrap();

        let readers = fanout(4, Duration::from_secs(5)).split(chunks(50), 3);
        assert_eq!(readers.len(), 3);
        let results = join_all(readers.into_iter().map(collect)).await;
        for result in results {
            assert_eq!(result.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_single_reader_gets_upstream() {
        let readers = fanout(4, Duration::from_secs(5)).split(chunks(3), 1);
        assert_eq!(readers.len(), 1);
        assert!(fanout(4, Duration::from_secs(5)).split(chunks(3), 0).is_empty());
    }

    #[tokio::test]
    async fn test_dropped_reader_does_not_affect_others() {
        mediarepo_test::setup();
        let expected = collect(chunks(20)).await.unwrap();

        let mut readers = fanout(1, Duration::from_secs(5)).split(chunks(20), 2);
        drop(readers.pop());
        let reader = readers.pop().unwrap();
        assert_eq!(collect(reader).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_stalled_reader_is_detached() {
        mediarepo_test::setup();
        let expected = collect(chunks(10)).await.unwrap();

        let mut readers = fanout(1, Duration::from_millis(50)).split(chunks(10), 2);
        let mut stalled = readers.pop().unwrap();
        let reader = readers.pop().unwrap();

        // the other reader finishes while this one is not polled at all
        let content = tokio::time::timeout(Duration::from_secs(5), collect(reader))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(content, expected);

        assert_eq!(
            stalled.next().await.unwrap().unwrap(),
            Bytes::from("chunk-0;")
        );
        let err = stalled.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(stalled.next().await.is_none());
    }

    #[tokio::test]
    async fn test_upstream_errors_reach_all_readers() {
        mediarepo_test::setup();
        let upstream = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "gone")),
        ])
        .boxed();

        let readers = fanout(4, Duration::from_secs(5)).split(upstream, 3);
        for result in join_all(readers.into_iter().map(collect)).await {
            assert_eq!(result.unwrap_err().kind(), io::ErrorKind::ConnectionReset);
        }
    }
}
