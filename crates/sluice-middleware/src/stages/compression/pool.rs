//! Reusable gzip encoders.
//!
//! A [`GzipStream`] is a raw deflate compressor plus a CRC-32, framed with the
//! gzip header and trailer by hand. Unlike a `GzEncoder`, it can be reset in
//! place, so its compressor state is allocated once and reused across
//! requests.
//!
//! Encoders are borrowed from an [`EncoderPool`] through a [`PooledEncoder`]
//! guard. Dropping the guard (normally or while unwinding) resets the stream
//! before it goes back to the idle set, so no request's bytes or checksum can
//! leak into the next.

use crate::writer::ResponseWriter;
use flate2::{Compress, Compression, Crc, FlushCompress, Status};
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::sync::Arc;

/// Fixed gzip member header: deflate, no flags, no mtime, unknown OS.
const GZIP_HEADER: [u8; 10] = [0x1f, 0x8b, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff];

/// Output reserved per deflate call.
const CHUNK: usize = 8 * 1024;

/// A resettable gzip stream writing into a response writer.
pub struct GzipStream {
    compress: Compress,
    crc: Crc,
    out: Vec<u8>,
    header_written: bool,
    finished: bool,
}

impl fmt::Debug for GzipStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GzipStream")
            .field("total_in", &self.compress.total_in())
            .field("total_out", &self.compress.total_out())
            .field("header_written", &self.header_written)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl GzipStream {
    /// Creates a stream at the given compression level.
    pub fn new(level: Compression) -> Self {
        Self {
            compress: Compress::new(level, false),
            crc: Crc::new(),
            out: Vec::with_capacity(CHUNK),
            header_written: false,
            finished: false,
        }
    }

    /// Returns the stream to its pristine state.
    pub fn reset(&mut self) {
        self.compress.reset();
        self.crc.reset();
        self.out.clear();
        self.header_written = false;
        self.finished = false;
    }

    /// Whether nothing has been emitted since the last reset.
    pub fn is_pristine(&self) -> bool {
        !self.header_written && self.crc.amount() == 0 && self.compress.total_in() == 0
    }

    /// Compresses `input` into `sink`.
    pub fn write(&mut self, input: &[u8], sink: &mut dyn ResponseWriter) -> io::Result<()> {
        self.ensure_open()?;
        self.crc.update(input);
        self.deflate(input, FlushCompress::None, sink)
    }

    /// Emits everything compressed so far as a complete deflate block.
    pub fn flush(&mut self, sink: &mut dyn ResponseWriter) -> io::Result<()> {
        self.ensure_open()?;
        self.deflate(&[], FlushCompress::Sync, sink)
    }

    /// Ends the stream and writes the gzip trailer.
    pub fn finish(&mut self, sink: &mut dyn ResponseWriter) -> io::Result<()> {
        if self.finished {
            return Ok(());
        }
        self.ensure_open()?;
        self.deflate(&[], FlushCompress::Finish, sink)?;
        self.finished = true;

        let mut trailer = [0u8; 8];
        trailer[..4].copy_from_slice(&self.crc.sum().to_le_bytes());
        trailer[4..].copy_from_slice(&self.crc.amount().to_le_bytes());
        sink.write_all(&trailer)
    }

    fn ensure_open(&mut self) -> io::Result<()> {
        if self.finished {
            return Err(io::Error::other("gzip stream already finished"));
        }
        if !self.header_written {
            self.out.extend_from_slice(&GZIP_HEADER);
            self.header_written = true;
        }
        Ok(())
    }

    fn deflate(
        &mut self,
        mut input: &[u8],
        flush: FlushCompress,
        sink: &mut dyn ResponseWriter,
    ) -> io::Result<()> {
        loop {
            self.out.reserve(CHUNK);
            let before = self.compress.total_in();
            let status = self
                .compress
                .compress_vec(input, &mut self.out, flush)
                .map_err(io::Error::other)?;
            #[allow(clippy::cast_possible_truncation)]
            let consumed = (self.compress.total_in() - before) as usize;
            input = &input[consumed..];

            let room_left = self.out.len() < self.out.capacity();
            if self.out.len() >= CHUNK {
                self.drain(sink)?;
            }

            let done = match status {
                Status::StreamEnd => true,
                Status::Ok | Status::BufError => {
                    input.is_empty() && room_left && !matches!(flush, FlushCompress::Finish)
                }
            };
            if done {
                return self.drain(sink);
            }
        }
    }

    fn drain(&mut self, sink: &mut dyn ResponseWriter) -> io::Result<()> {
        if self.out.is_empty() {
            return Ok(());
        }
        let result = sink.write_all(&self.out);
        self.out.clear();
        result
    }
}

/// A bounded set of idle gzip streams.
pub struct EncoderPool {
    idle: Mutex<Vec<GzipStream>>,
    max_idle: usize,
    level: Compression,
}

impl fmt::Debug for EncoderPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncoderPool")
            .field("idle", &self.idle_count())
            .field("max_idle", &self.max_idle)
            .field("level", &self.level.level())
            .finish()
    }
}

impl EncoderPool {
    /// Creates a pool keeping at most `max_idle` streams at `level` (0-9).
    pub fn new(level: u32, max_idle: usize) -> Arc<Self> {
        Arc::new(Self {
            idle: Mutex::new(Vec::new()),
            max_idle,
            level: Compression::new(level.min(9)),
        })
    }

    /// Borrows a stream, allocating one if none is idle.
    pub fn acquire(self: &Arc<Self>) -> PooledEncoder {
        let idle = self.idle.lock().pop();
        let stream = idle.unwrap_or_else(|| GzipStream::new(self.level));
        PooledEncoder {
            pool: Arc::clone(self),
            stream: Some(stream),
        }
    }

    /// Number of idle streams.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    fn release(&self, mut stream: GzipStream) {
        stream.reset();
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(stream);
        }
    }
}

/// A stream on loan from an [`EncoderPool`]; returned on drop.
pub struct PooledEncoder {
    pool: Arc<EncoderPool>,
    stream: Option<GzipStream>,
}

impl fmt::Debug for PooledEncoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledEncoder")
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}

impl PooledEncoder {
    /// The borrowed stream.
    pub fn stream(&mut self) -> &mut GzipStream {
        let level = self.pool.level;
        self.stream.get_or_insert_with(|| GzipStream::new(level))
    }
}

impl Drop for PooledEncoder {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            self.pool.release(stream);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::ResponseRecorder;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn gunzip(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        GzDecoder::new(data).read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_stream_produces_valid_gzip() {
        let mut rec = ResponseRecorder::new();
        let mut stream = GzipStream::new(Compression::default());

        stream.write(b"hello ", &mut rec).unwrap();
        stream.write(b"world", &mut rec).unwrap();
        stream.finish(&mut rec).unwrap();

        assert_eq!(&rec.body()[..3], &[0x1f, 0x8b, 0x08]);
        assert_eq!(gunzip(rec.body()), b"hello world");
    }

    #[test]
    fn test_sync_flush_emits_decodable_prefix() {
        let mut rec = ResponseRecorder::new();
        let mut stream = GzipStream::new(Compression::default());

        stream.write(b"data: first event\n\n", &mut rec).unwrap();
        stream.flush(&mut rec).unwrap();

        // A sync flush ends on a byte boundary with an empty stored block.
        assert!(rec.body().ends_with(&[0x00, 0x00, 0xff, 0xff]));

        stream.write(b"data: second event\n\n", &mut rec).unwrap();
        stream.finish(&mut rec).unwrap();
        assert_eq!(
            gunzip(rec.body()),
            b"data: first event\n\ndata: second event\n\n"
        );
    }

    #[test]
    fn test_large_input_crosses_chunks() {
        let input: Vec<u8> = (0..200_000u32).map(|i| (i * 7919 % 251) as u8).collect();
        let mut rec = ResponseRecorder::new();
        let mut stream = GzipStream::new(Compression::fast());

        for piece in input.chunks(3_000) {
            stream.write(piece, &mut rec).unwrap();
        }
        stream.finish(&mut rec).unwrap();

        assert_eq!(gunzip(rec.body()), input);
    }

    #[test]
    fn test_finish_twice_is_noop_and_write_after_fails() {
        let mut rec = ResponseRecorder::new();
        let mut stream = GzipStream::new(Compression::default());
        stream.finish(&mut rec).unwrap();
        let len = rec.body().len();

        stream.finish(&mut rec).unwrap();
        assert_eq!(rec.body().len(), len);
        assert!(stream.write(b"late", &mut rec).is_err());
        assert!(gunzip(rec.body()).is_empty());
    }

    #[test]
    fn test_pool_resets_before_reuse() {
        let pool = EncoderPool::new(6, 4);
        {
            let mut guard = pool.acquire();
            let mut rec = ResponseRecorder::new();
            guard.stream().write(b"request one", &mut rec).unwrap();
            assert!(!guard.stream().is_pristine());
        }
        assert_eq!(pool.idle_count(), 1);

        let mut guard = pool.acquire();
        assert_eq!(pool.idle_count(), 0);
        assert!(guard.stream().is_pristine());

        let mut rec = ResponseRecorder::new();
        guard.stream().write(b"request two", &mut rec).unwrap();
        guard.stream().finish(&mut rec).unwrap();
        assert_eq!(gunzip(rec.body()), b"request two");
    }

    #[test]
    fn test_pool_is_bounded() {
        let pool = EncoderPool::new(6, 2);
        let guards: Vec<_> = (0..5).map(|_| pool.acquire()).collect();
        drop(guards);
        assert_eq!(pool.idle_count(), 2);
    }

    #[test]
    fn test_guard_returns_stream_on_panic() {
        let pool = EncoderPool::new(6, 4);
        let cloned = Arc::clone(&pool);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = cloned.acquire();
            panic!("handler failed");
        }));
        assert!(result.is_err());
        assert_eq!(pool.idle_count(), 1);
    }
}
