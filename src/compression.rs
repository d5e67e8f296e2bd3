//! Pooled gzip compressors.
//!
//! Each scratch object bundles a raw deflate stream, a CRC32 accumulator and
//! an output buffer. Scratch objects are handed out through [`PooledScratch`],
//! which resets and returns them to the pool when dropped, whichever way the
//! caller leaves its scope.

use crossbeam_queue::ArrayQueue;
use flate2::{Compress, Compression, Crc, FlushCompress, Status};
use serde::Serialize;
use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

/// gzip member header: magic, CM=deflate, no flags, mtime 0, XFL=fastest, OS=unknown.
const GZIP_HEADER: [u8; 10] = [0x1f, 0x8b, 0x08, 0x00, 0, 0, 0, 0, 0x04, 0xff];

/// Buffers that grew beyond this are shrunk before going back to the pool.
const MAX_RETAINED_CAPACITY: usize = 256 * 1024;

pub struct GzipScratch {
    deflate: Compress,
    crc: Crc,
    buffer: Vec<u8>,
}

impl GzipScratch {
    fn new() -> Self {
        Self {
            // Raw deflate; the gzip framing is written by hand.
            deflate: Compress::new(Compression::fast(), false),
            crc: Crc::new(),
            buffer: Vec::new(),
        }
    }

    /// Compress `input` as a single gzip member into the scratch buffer.
    pub fn gzip(&mut self, input: &[u8]) -> io::Result<&[u8]> {
        self.reset();
        self.buffer.reserve(GZIP_HEADER.len() + input.len() / 2 + 64);
        self.buffer.extend_from_slice(&GZIP_HEADER);

        self.deflate_all(input)?;

        self.crc.update(input);
        self.buffer.extend_from_slice(&self.crc.sum().to_le_bytes());
        // ISIZE is the input length modulo 2^32.
        self.buffer
            .extend_from_slice(&(input.len() as u32).to_le_bytes());

        Ok(&self.buffer)
    }

    pub fn output(&self) -> &[u8] {
        &self.buffer
    }

    fn deflate_all(&mut self, input: &[u8]) -> io::Result<()> {
        let start_in = self.deflate.total_in();
        loop {
            if self.buffer.capacity() - self.buffer.len() < 64 {
                self.buffer.reserve(self.buffer.capacity().max(1024));
            }

            let consumed = (self.deflate.total_in() - start_in) as usize;
            let status = self
                .deflate
                .compress_vec(&input[consumed..], &mut self.buffer, FlushCompress::Finish)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

            match status {
                Status::StreamEnd => return Ok(()),
                Status::Ok | Status::BufError => continue,
            }
        }
    }

    fn reset(&mut self) {
        self.deflate.reset();
        self.crc.reset();
        self.buffer.clear();
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub created: u64,
    pub reused: u64,
    pub idle: usize,
}

pub struct CompressionPool {
    idle: ArrayQueue<GzipScratch>,
    created: AtomicU64,
    reused: AtomicU64,
}

impl CompressionPool {
    /// `capacity` bounds how many idle scratch objects are retained.
    pub fn new(capacity: usize) -> Self {
        Self {
            idle: ArrayQueue::new(capacity.max(1)),
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }

    pub fn acquire(&self) -> PooledScratch<'_> {
        let scratch = match self.idle.pop() {
            Some(scratch) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                scratch
            }
            None => {
                self.created.fetch_add(1, Ordering::Relaxed);
                GzipScratch::new()
            }
        };

        PooledScratch {
            pool: self,
            scratch: Some(scratch),
        }
    }

    fn release(&self, mut scratch: GzipScratch) {
        scratch.reset();
        if scratch.buffer.capacity() > MAX_RETAINED_CAPACITY {
            scratch.buffer.shrink_to(MAX_RETAINED_CAPACITY);
        }
        // A full pool drops the extra scratch.
        let _ = self.idle.push(scratch);
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            idle: self.idle.len(),
        }
    }
}

/// Scratch borrowed from a [`CompressionPool`]; returned on drop.
pub struct PooledScratch<'a> {
    pool: &'a CompressionPool,
    scratch: Option<GzipScratch>,
}

impl Deref for PooledScratch<'_> {
    type Target = GzipScratch;

    fn deref(&self) -> &GzipScratch {
        self.scratch.as_ref().expect("scratch present until drop")
    }
}

impl DerefMut for PooledScratch<'_> {
    fn deref_mut(&mut self) -> &mut GzipScratch {
        self.scratch.as_mut().expect("scratch present until drop")
    }
}

impl Drop for PooledScratch<'_> {
    fn drop(&mut self) {
        if let Some(scratch) = self.scratch.take() {
            self.pool.release(scratch);
        }
    }
}

/// Whether an `Accept-Encoding` value admits gzip.
///
/// An explicit `gzip`/`x-gzip` entry decides; `*` only applies when gzip is
/// not named.
pub fn accepts_gzip(accept_encoding: &str) -> bool {
    let mut named: Option<bool> = None;
    let mut wildcard: Option<bool> = None;

    for item in accept_encoding.split(',') {
        let mut parts = item.split(';');
        let coding = parts.next().unwrap_or("").trim();

        // q=0 means "not acceptable".
        let quality = parts
            .filter_map(|param| {
                let (name, value) = param.split_once('=')?;
                name.trim()
                    .eq_ignore_ascii_case("q")
                    .then(|| value.trim().parse::<f32>().ok())
                    .flatten()
            })
            .next()
            .unwrap_or(1.0);
        let acceptable = quality > 0.0;

        if coding.eq_ignore_ascii_case("gzip") || coding.eq_ignore_ascii_case("x-gzip") {
            named = Some(named.unwrap_or(false) || acceptable);
        } else if coding == "*" {
            wildcard = Some(acceptable);
        }
    }

    named.or(wildcard).unwrap_or(false)
}
