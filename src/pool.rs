//! Pools of staging buffers and encoders shared by the requests of one layer.
//!
//! Every acquisition hands back a guard. Dropping the guard returns the
//! object to its pool, so release happens exactly once whichever way the
//! response ends: normal completion, an error, or the body being dropped
//! by a cancelled connection.

use crate::codec::Encoder;
use crate::error::{Error, Result};
use crate::registry::{CompressorRegistry, RegisteredCompressor};
use bytes::BytesMut;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Staging buffers larger than this are dropped instead of pooled.
pub const DEFAULT_MAX_POOLED_BUFFER: usize = 64 * 1024;

/// Default number of idle objects retained per pool.
pub const DEFAULT_MAX_IDLE: usize = 64;

/// Retention limits for [`Pools`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum idle objects kept by each pool.
    pub max_idle: usize,
    /// Capacity ceiling for pooled staging buffers.
    pub max_buffer_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: DEFAULT_MAX_IDLE,
            max_buffer_capacity: DEFAULT_MAX_POOLED_BUFFER,
        }
    }
}

/// A thread-safe pool of staging buffers.
#[derive(Debug)]
pub struct BufferPool {
    buffers: Mutex<Vec<BytesMut>>,
    max_idle: usize,
    max_capacity: usize,
}

impl BufferPool {
    /// Creates an empty pool.
    pub fn new(max_idle: usize, max_capacity: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
            max_idle,
            max_capacity,
        }
    }

    /// Takes a buffer from the pool, allocating one when none is idle.
    pub fn acquire(pool: &Arc<Self>) -> PooledBuffer {
        let buffer = pool.buffers.lock().pop().unwrap_or_default();
        PooledBuffer {
            buffer,
            pool: Arc::clone(pool),
        }
    }

    fn release(&self, mut buffer: BytesMut) {
        if buffer.capacity() > self.max_capacity {
            tracing::trace!(capacity = buffer.capacity(), "dropping oversized staging buffer");
            return;
        }
        buffer.clear();
        let mut buffers = self.buffers.lock();
        if buffers.len() < self.max_idle {
            buffers.push(buffer);
        }
    }

    /// Number of idle buffers.
    pub fn idle(&self) -> usize {
        self.buffers.lock().len()
    }

    /// Total capacity held by idle buffers.
    pub fn retained_bytes(&self) -> usize {
        self.buffers.lock().iter().map(BytesMut::capacity).sum()
    }
}

/// A staging buffer on loan from a [`BufferPool`].
pub struct PooledBuffer {
    buffer: BytesMut,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buffer
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buffer));
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Idle encoders for a single content coding.
///
/// Returned encoders are [`reset`](Encoder::reset) before they are kept.
/// What a reset preserves is up to the encoder. The built-in codecs rebuild
/// their compression state from scratch on every reset, so for them pooling
/// saves the output scratch buffer and the provider call, not the codec's
/// internal tables. Custom encoders with a cheap reset keep everything.
pub struct EncoderPool {
    encoding: Arc<str>,
    encoders: Mutex<Vec<Box<dyn Encoder>>>,
    max_idle: usize,
}

impl EncoderPool {
    /// Creates an empty pool for `encoding`.
    pub fn new(encoding: Arc<str>, max_idle: usize) -> Self {
        Self {
            encoding,
            encoders: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    /// Takes an idle encoder, or asks `compressor` for a new one.
    pub fn acquire(pool: &Arc<Self>, compressor: &RegisteredCompressor) -> Result<PooledEncoder> {
        let idle = pool.encoders.lock().pop();
        let encoder = match idle {
            Some(encoder) => encoder,
            None => compressor
                .provider()
                .encoder()
                .map_err(|source| Error::ProviderInit {
                    encoding: pool.encoding.to_string(),
                    source,
                })?,
        };
        Ok(PooledEncoder {
            encoder: Some(encoder),
            pool: Arc::clone(pool),
            finished: false,
        })
    }

    fn release(&self, mut encoder: Box<dyn Encoder>) {
        if let Err(err) = encoder.reset() {
            tracing::warn!(encoding = %self.encoding, error = %err, "dropping encoder that failed to reset");
            return;
        }
        let mut encoders = self.encoders.lock();
        if encoders.len() < self.max_idle {
            encoders.push(encoder);
        }
    }

    /// Number of idle encoders.
    pub fn idle(&self) -> usize {
        self.encoders.lock().len()
    }
}

impl fmt::Debug for EncoderPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncoderPool")
            .field("encoding", &self.encoding)
            .field("idle", &self.idle())
            .finish()
    }
}

/// An encoder on loan from an [`EncoderPool`].
///
/// If the stream was never finished when the guard drops, the encoder is
/// finished into a scratch buffer first, so its close always runs.
pub struct PooledEncoder {
    encoder: Option<Box<dyn Encoder>>,
    pool: Arc<EncoderPool>,
    finished: bool,
}

impl PooledEncoder {
    /// Returns the content coding of this encoder.
    pub fn encoding(&self) -> &str {
        &self.pool.encoding
    }

    fn inner(&mut self) -> &mut dyn Encoder {
        self.encoder
            .as_deref_mut()
            .expect("encoder is present until the guard drops")
    }

    /// Compresses `input` into `sink`.
    pub fn encode(&mut self, input: &[u8], sink: &mut BytesMut) -> io::Result<()> {
        self.inner().encode(input, sink)
    }

    /// Flushes pending compressed output into `sink`.
    pub fn flush(&mut self, sink: &mut BytesMut) -> io::Result<()> {
        self.inner().flush(sink)
    }

    /// Ends the compressed stream. Later calls are no-ops.
    pub fn finish(&mut self, sink: &mut BytesMut) -> io::Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.inner().finish(sink)
    }
}

impl Drop for PooledEncoder {
    fn drop(&mut self) {
        let Some(mut encoder) = self.encoder.take() else {
            return;
        };
        if !self.finished {
            let mut scratch = BytesMut::new();
            if let Err(err) = encoder.finish(&mut scratch) {
                tracing::debug!(encoding = %self.pool.encoding, error = %err, "closing abandoned encoder failed");
            }
        }
        self.pool.release(encoder);
    }
}

impl fmt::Debug for PooledEncoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledEncoder")
            .field("encoding", &self.encoding())
            .field("finished", &self.finished)
            .finish()
    }
}

/// The staging-buffer pool plus one encoder pool per registered encoding.
///
/// Owned by a single layer and shared with its requests through an `Arc`;
/// independently configured layers never share pools.
#[derive(Debug)]
pub struct Pools {
    buffers: Arc<BufferPool>,
    encoders: BTreeMap<Arc<str>, Arc<EncoderPool>>,
}

impl Pools {
    /// Creates empty pools for every encoding in `registry`.
    pub fn new(registry: &CompressorRegistry, config: PoolConfig) -> Self {
        let encoders = registry
            .iter()
            .map(|c| {
                let name = c.shared_name();
                let pool = Arc::new(EncoderPool::new(Arc::clone(&name), config.max_idle));
                (name, pool)
            })
            .collect();
        Self {
            buffers: Arc::new(BufferPool::new(config.max_idle, config.max_buffer_capacity)),
            encoders,
        }
    }

    /// Leases a staging buffer.
    pub fn buffer(&self) -> PooledBuffer {
        BufferPool::acquire(&self.buffers)
    }

    /// Leases an encoder for `compressor`.
    pub fn encoder(&self, compressor: &RegisteredCompressor) -> Result<PooledEncoder> {
        let pool = self.encoders.get(compressor.name()).ok_or_else(|| {
            Error::InvalidConfig(format!("no encoder pool for {:?}", compressor.name()))
        })?;
        EncoderPool::acquire(pool, compressor)
    }

    /// The staging-buffer pool.
    pub fn buffers(&self) -> &BufferPool {
        &self.buffers
    }

    /// The encoder pool for `encoding`.
    pub fn encoders(&self, encoding: &str) -> Option<&EncoderPool> {
        self.encoders.get(encoding).map(Arc::as_ref)
    }
}
