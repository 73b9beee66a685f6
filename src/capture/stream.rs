//! Consumer side of the capture pool.
//!
//! [`ConsumerStream`] hands out completed buffers in completion order. Each
//! buffer is wrapped in a [`DrainedBuffer`] guard that returns it to the free
//! set when dropped. [`RecordReader`] reads the same buffers as byte-exact
//! records from a capture device.

use std::io::{ErrorKind, Read};
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use super::pool::SampleBufferPool;
use super::record::{Buffer, RecordError, RECORD_SIZE};

/// Anything that yields completed sample buffers, blocking as needed.
pub trait BufferSource: Send + 'static {
    type Item: Deref<Target = Buffer> + Send + 'static;

    /// Next completed buffer, or `None` at end of stream.
    fn next_buffer(&mut self) -> Result<Option<Self::Item>>;
}

/// A drained buffer on loan from the pool.
pub struct DrainedBuffer {
    pool: Arc<SampleBufferPool>,
    buffer: Option<Box<Buffer>>,
}

impl Deref for DrainedBuffer {
    type Target = Buffer;

    fn deref(&self) -> &Buffer {
        // Only `Drop` takes the buffer out.
        match self.buffer.as_deref() {
            Some(buffer) => buffer,
            None => unreachable!("drained buffer already released"),
        }
    }
}

impl Drop for DrainedBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.release_free(buffer);
        }
    }
}

/// Single-reader blocking view over a pool's full set.
#[derive(Clone)]
pub struct ConsumerStream {
    pool: Arc<SampleBufferPool>,
}

impl ConsumerStream {
    pub fn new(pool: Arc<SampleBufferPool>) -> Self {
        Self { pool }
    }

    fn guard(&self, buffer: Box<Buffer>) -> DrainedBuffer {
        DrainedBuffer {
            pool: Arc::clone(&self.pool),
            buffer: Some(buffer),
        }
    }

    /// Blocks until a buffer completes. `None` once the pool shuts down
    /// and nothing is left to drain.
    pub fn next(&self) -> Option<DrainedBuffer> {
        self.pool.drain_full().map(|b| self.guard(b))
    }

    /// Copies the next buffer into `out` as a record, device-read style.
    ///
    /// Destinations shorter than one record are rejected before blocking.
    /// Returns 0 at end of stream.
    pub fn read_record(&self, out: &mut [u8]) -> Result<usize, RecordError> {
        if out.len() < RECORD_SIZE {
            return Err(RecordError::ShortRead { len: out.len() });
        }
        match self.next() {
            Some(buffer) => buffer.encode_record(out),
            None => Ok(0),
        }
    }
}

impl BufferSource for ConsumerStream {
    type Item = DrainedBuffer;

    fn next_buffer(&mut self) -> Result<Option<DrainedBuffer>> {
        Ok(self.next())
    }
}

/// Reads byte-exact buffer records from a device or file.
pub struct RecordReader<R> {
    inner: R,
    scratch: Vec<u8>,
}

impl<R: Read> RecordReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            scratch: vec![0u8; RECORD_SIZE],
        }
    }

    /// Reads the next record into `dst`. Returns false at a clean end of stream.
    pub fn read_into(&mut self, dst: &mut Buffer) -> Result<bool> {
        match self.inner.read_exact(&mut self.scratch) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(false),
            Err(e) => return Err(e).context("reading buffer record"),
        }
        dst.decode_record(&self.scratch)
            .context("decoding buffer record")?;
        Ok(true)
    }
}

impl RecordReader<std::fs::File> {
    /// Opens a capture device (or a file of concatenated records).
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("opening capture device {}", path.display()))?;
        Ok(Self::new(file))
    }
}

impl<R: Read + Send + 'static> BufferSource for RecordReader<R> {
    type Item = Box<Buffer>;

    fn next_buffer(&mut self) -> Result<Option<Box<Buffer>>> {
        let mut buffer = Box::new(Buffer::new());
        if self.read_into(&mut buffer)? {
            Ok(Some(buffer))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic, clippy::indexing_slicing)]
mod tests {
    use std::io::Cursor;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::capture::record::Sample;

    fn publish(pool: &SampleBufferPool, core: u32, pids: &[u32]) {
        let mut buf = pool.acquire_free().unwrap();
        buf.reset(core);
        for pid in pids {
            buf.push(Sample {
                pid: *pid,
                ..Sample::default()
            });
        }
        pool.publish_full(buf);
    }

    #[test]
    fn test_guard_returns_buffer() {
        let pool = Arc::new(SampleBufferPool::new(2));
        publish(&pool, 0, &[1, 2]);
        let stream = ConsumerStream::new(Arc::clone(&pool));

        let buf = stream.next().unwrap();
        assert_eq!(buf.len(), 2);
        assert_eq!(pool.stats().free, 1);

        drop(buf);
        assert_eq!(pool.stats().free, 2);
    }

    #[test]
    fn test_read_record_rejects_short_destination() {
        let pool = Arc::new(SampleBufferPool::new(1));
        publish(&pool, 0, &[1]);
        let stream = ConsumerStream::new(Arc::clone(&pool));

        let mut small = vec![0u8; 100];
        assert!(matches!(
            stream.read_record(&mut small),
            Err(RecordError::ShortRead { len: 100 })
        ));
        // Nothing was consumed.
        assert_eq!(pool.stats().full, 1);

        let mut out = vec![0u8; RECORD_SIZE];
        assert_eq!(stream.read_record(&mut out).unwrap(), RECORD_SIZE);
        assert_eq!(pool.stats().free, 1);
    }

    #[test]
    fn test_read_record_end_of_stream() {
        let pool = Arc::new(SampleBufferPool::new(1));
        let stream = ConsumerStream::new(Arc::clone(&pool));

        let reader = thread::spawn(move || {
            let mut out = vec![0u8; RECORD_SIZE];
            stream.read_record(&mut out).unwrap()
        });
        thread::sleep(Duration::from_millis(20));
        pool.shutdown();
        assert_eq!(reader.join().unwrap(), 0);
    }

    #[test]
    fn test_record_reader() {
        let mut bytes = Vec::new();
        for core in 0..2u32 {
            let mut buf = Buffer::new();
            buf.reset(core);
            buf.push(Sample {
                cycles: 5,
                pid: 10 + core,
                counters: [core; 6],
            });
            let mut record = vec![0u8; RECORD_SIZE];
            buf.encode_record(&mut record).unwrap();
            bytes.extend_from_slice(&record);
        }
        // Trailing partial record is treated as end of stream.
        bytes.extend_from_slice(&[0u8; 7]);

        let mut reader = RecordReader::new(Cursor::new(bytes));
        let first = reader.next_buffer().unwrap().unwrap();
        assert_eq!(first.samples()[0].pid, 10);
        let second = reader.next_buffer().unwrap().unwrap();
        assert_eq!(second.core(), 1);
        assert!(reader.next_buffer().unwrap().is_none());
    }
}
