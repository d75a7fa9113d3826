//! Streaming destinations for response bodies.
//!
//! Each sink sees the chunks of the delivering attempt in emission order and
//! then exactly one terminal call: [`Sink::finish`] after a successful
//! request, [`Sink::destroy`] after a failed or aborted one. A sink that fails
//! is logged and dropped from the fan-out; it never affects the other sinks
//! or the request's own outcome.

use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures_util::future::{BoxFuture, join_all};
use tokio::fs::File;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::Error;

pub trait Sink: Send + 'static {
    fn write<'a>(&'a mut self, chunk: &'a Bytes) -> BoxFuture<'a, io::Result<()>>;

    /// Flushes and closes the destination; resolves once it is durable.
    fn finish(&mut self) -> BoxFuture<'_, io::Result<()>>;

    /// Marks the destination invalid. Must not block.
    fn destroy(&mut self, error: &Error);

    /// Sinks that were closed by their owner are skipped.
    fn is_destroyed(&self) -> bool {
        false
    }
}

/// Adapts any [`AsyncWrite`].
pub struct WriterSink<W> {
    writer: Option<W>,
}

impl<W> WriterSink<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: Some(writer),
        }
    }

    pub fn into_inner(self) -> Option<W> {
        self.writer
    }
}

impl<W> Sink for WriterSink<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn write<'a>(&'a mut self, chunk: &'a Bytes) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            match self.writer.as_mut() {
                Some(writer) => writer.write_all(chunk).await,
                None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink destroyed")),
            }
        })
    }

    fn finish(&mut self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            let Some(writer) = self.writer.as_mut() else {
                return Ok(());
            };
            writer.flush().await?;
            writer.shutdown().await
        })
    }

    fn destroy(&mut self, _error: &Error) {
        self.writer = None;
    }

    fn is_destroyed(&self) -> bool {
        self.writer.is_none()
    }
}

/// Writes the body to a file and removes the file if the request fails.
pub struct FileSink {
    path: PathBuf,
    inner: WriterSink<File>,
}

impl FileSink {
    pub async fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).await?;
        Ok(Self {
            path,
            inner: WriterSink::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Sink for FileSink {
    fn write<'a>(&'a mut self, chunk: &'a Bytes) -> BoxFuture<'a, io::Result<()>> {
        self.inner.write(chunk)
    }

    fn finish(&mut self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            if let Some(file) = self.inner.writer.as_mut() {
                file.flush().await?;
                file.sync_all().await?;
            }
            Ok(())
        })
    }

    fn destroy(&mut self, error: &Error) {
        self.inner.destroy(error);
        if let Err(remove_error) = std::fs::remove_file(&self.path) {
            debug!(
                path = %self.path.display(),
                error = %remove_error,
                "failed to remove partially written file"
            );
        }
    }

    fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }
}

struct SinkSlot {
    sink: Box<dyn Sink>,
    position: usize,
    live: bool,
}

impl SinkSlot {
    fn is_live(&self) -> bool {
        self.live && !self.sink.is_destroyed()
    }
}

/// Ordered set of sinks attached to one request.
#[derive(Default)]
pub(crate) struct SinkFanout {
    slots: Vec<SinkSlot>,
    closed: bool,
}

impl SinkFanout {
    pub(crate) fn push(&mut self, sink: Box<dyn Sink>) {
        let position = self.slots.len();
        self.slots.push(SinkSlot {
            sink,
            position,
            live: true,
        });
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    #[cfg(test)]
    pub(crate) fn live_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_live()).count()
    }

    /// Forwards one chunk to every live sink. Returns the number of sinks
    /// that failed on this chunk.
    pub(crate) async fn write(&mut self, chunk: &Bytes) -> usize {
        if self.closed {
            return 0;
        }
        let mut failures = 0;
        for slot in &mut self.slots {
            if !slot.is_live() {
                continue;
            }
            if let Err(error) = slot.sink.write(chunk).await {
                warn!(sink = slot.position, error = %error, "sink write failed; detaching sink");
                slot.live = false;
                failures += 1;
            }
        }
        failures
    }

    /// Waits for every live sink to acknowledge completion. Returns the
    /// number of sinks that failed to finish.
    ///
    /// If this future is dropped before it resolves, the fan-out stays open
    /// so a later [`destroy`](Self::destroy) still reaches every sink.
    pub(crate) async fn finalize(&mut self) -> usize {
        if self.closed {
            return 0;
        }
        let pending = self
            .slots
            .iter_mut()
            .filter(|slot| slot.is_live())
            .map(|slot| async move {
                let result = slot.sink.finish().await;
                (slot.position, result)
            });
        let results = join_all(pending).await;
        self.closed = true;
        let mut failures = 0;
        for (position, result) in results {
            if let Err(error) = result {
                warn!(sink = position, error = %error, "sink failed to finish");
                failures += 1;
            }
        }
        debug!(sinks = self.slots.len(), failures, "sinks finalized");
        failures
    }

    /// Propagates a terminal error without waiting for acknowledgement.
    pub(crate) fn destroy(&mut self, error: &Error) {
        if self.closed {
            return;
        }
        self.closed = true;
        for slot in &mut self.slots {
            if slot.is_live() {
                slot.sink.destroy(error);
            }
            slot.live = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::{Arc, Mutex};

    use bytes::Bytes;
    use futures_util::future::BoxFuture;
    use http::Method;

    use super::{FileSink, Sink, SinkFanout, WriterSink};
    use crate::error::Error;
    use crate::util::lock_unpoisoned;

    #[derive(Default)]
    struct Journal {
        chunks: Vec<Bytes>,
        finished: usize,
        destroyed: usize,
    }

    struct RecordingSink {
        journal: Arc<Mutex<Journal>>,
        fail_writes: bool,
    }

    impl Sink for RecordingSink {
        fn write<'a>(&'a mut self, chunk: &'a Bytes) -> BoxFuture<'a, io::Result<()>> {
            Box::pin(async move {
                if self.fail_writes {
                    return Err(io::Error::other("disk full"));
                }
                lock_unpoisoned(&self.journal).chunks.push(chunk.clone());
                Ok(())
            })
        }

        fn finish(&mut self) -> BoxFuture<'_, io::Result<()>> {
            Box::pin(async move {
                lock_unpoisoned(&self.journal).finished += 1;
                Ok(())
            })
        }

        fn destroy(&mut self, _error: &Error) {
            lock_unpoisoned(&self.journal).destroyed += 1;
        }
    }

    fn recording(fail_writes: bool) -> (Box<dyn Sink>, Arc<Mutex<Journal>>) {
        let journal = Arc::new(Mutex::new(Journal::default()));
        let sink = RecordingSink {
            journal: Arc::clone(&journal),
            fail_writes,
        };
        (Box::new(sink), journal)
    }

    fn aborted() -> Error {
        Error::Aborted {
            method: Method::GET,
            uri: "http://example.test/".to_owned(),
        }
    }

    #[tokio::test]
    async fn failing_sink_is_detached_and_others_keep_receiving() {
        let (broken, broken_journal) = recording(true);
        let (healthy, healthy_journal) = recording(false);
        let mut fanout = SinkFanout::default();
        fanout.push(broken);
        fanout.push(healthy);

        assert_eq!(fanout.write(&Bytes::from_static(b"one")).await, 1);
        assert_eq!(fanout.write(&Bytes::from_static(b"two")).await, 0);
        assert_eq!(fanout.live_count(), 1);
        assert_eq!(fanout.finalize().await, 0);

        let healthy = lock_unpoisoned(&healthy_journal);
        assert_eq!(healthy.chunks, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);
        assert_eq!(healthy.finished, 1);
        assert_eq!(lock_unpoisoned(&broken_journal).finished, 0);
    }

    #[tokio::test]
    async fn terminal_signal_is_delivered_once() {
        let (sink, journal) = recording(false);
        let mut fanout = SinkFanout::default();
        fanout.push(sink);

        fanout.destroy(&aborted());
        fanout.destroy(&aborted());
        assert_eq!(fanout.finalize().await, 0);
        assert_eq!(fanout.write(&Bytes::from_static(b"late")).await, 0);

        let journal = lock_unpoisoned(&journal);
        assert_eq!(journal.destroyed, 1);
        assert_eq!(journal.finished, 0);
        assert!(journal.chunks.is_empty());
    }

    #[tokio::test]
    async fn writer_sink_is_skipped_after_destroy() {
        let mut sink = WriterSink::new(Vec::new());
        sink.write(&Bytes::from_static(b"abc")).await.expect("write");
        sink.destroy(&aborted());
        assert!(sink.is_destroyed());
        assert!(sink.write(&Bytes::from_static(b"def")).await.is_err());
        assert!(sink.into_inner().is_none());
    }

    #[tokio::test]
    async fn file_sink_removes_its_file_on_destroy() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("partial.bin");
        let mut sink = FileSink::create(&path).await.expect("create file sink");
        sink.write(&Bytes::from_static(b"partial")).await.expect("write");
        assert!(path.exists());
        sink.destroy(&aborted());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn file_sink_keeps_complete_body() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("body.txt");
        let mut sink = FileSink::create(&path).await.expect("create file sink");
        sink.write(&Bytes::from_static(b"hello ")).await.expect("write");
        sink.write(&Bytes::from_static(b"world")).await.expect("write");
        sink.finish().await.expect("finish");
        assert_eq!(std::fs::read(&path).expect("read body"), b"hello world");
    }
}
