//! Per-response buffering and compression state machine.
//!
//! The writer sits between the handler's body and the connection. It keeps
//! the response headers until it knows whether the body will be compressed,
//! buffering up to the minimum size when the body length is not declared.
//!
//! ```text
//! Init ──▶ Buffering ──▶ Compressing ──▶ Closed
//!   │          │                           ▲
//!   │          └───────▶ Passthrough ──────┘
//!   └──────────────────────▲
//! ```

use crate::config::Config;
use crate::error::{Error, Result};
use crate::headers;
use crate::negotiate::Negotiated;
use crate::pool::{PooledBuffer, PooledEncoder};
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Method, StatusCode};
use std::sync::Arc;

/// States of a [`CompressingWriter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    /// Nothing written and headers not committed.
    Init,
    /// Collecting the body until the minimum size is reached.
    Buffering,
    /// Headers committed with a Content-Encoding; bytes go through the encoder.
    Compressing,
    /// Headers committed unchanged; bytes are forwarded verbatim.
    Passthrough,
    /// Finalized; leased resources are back in their pools.
    Closed,
}

/// Buffered compressing writer for a single response.
///
/// Output ready for the connection accumulates internally and is drained
/// with [`take_output`](Self::take_output). Headers are available through
/// [`take_headers`](Self::take_headers) once committed, and can no longer
/// be changed after that.
#[derive(Debug)]
pub struct CompressingWriter {
    config: Arc<Config>,
    negotiated: Negotiated,
    min_size: usize,
    headers: HeaderMap,
    bodyless: bool,
    committed: bool,
    headers_taken: bool,
    always_flush: bool,
    state: WriterState,
    buffer: Option<PooledBuffer>,
    encoder: Option<PooledEncoder>,
    written: u64,
    output: BytesMut,
}

enum Decision {
    Passthrough(&'static str),
    Buffer,
    Compress,
}

impl CompressingWriter {
    pub(crate) fn new(
        config: Arc<Config>,
        negotiated: Negotiated,
        min_size: usize,
        method: &Method,
        status: StatusCode,
        headers: HeaderMap,
    ) -> Self {
        Self {
            config,
            negotiated,
            min_size,
            bodyless: headers::is_bodyless(method, status),
            always_flush: headers::is_streaming(&headers),
            headers,
            committed: false,
            headers_taken: false,
            state: WriterState::Init,
            buffer: None,
            encoder: None,
            written: 0,
            output: BytesMut::new(),
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> WriterState {
        self.state
    }

    /// Returns true once the response headers are final.
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Mutable access to the headers, only until they are committed.
    pub fn headers_mut(&mut self) -> Option<&mut HeaderMap> {
        if self.committed {
            None
        } else {
            Some(&mut self.headers)
        }
    }

    /// Takes the committed headers. Returns `None` before the commit and
    /// on every call after the first.
    pub fn take_headers(&mut self) -> Option<HeaderMap> {
        if !self.committed || self.headers_taken {
            return None;
        }
        self.headers_taken = true;
        Some(std::mem::take(&mut self.headers))
    }

    /// Returns true when output is waiting to be sent.
    pub fn has_output(&self) -> bool {
        !self.output.is_empty()
    }

    /// Drains the output produced so far.
    pub fn take_output(&mut self) -> Bytes {
        self.output.split().freeze()
    }

    /// Total body bytes written by the handler.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Writes body bytes.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.state == WriterState::Init {
            self.start()?;
        }
        if self.state == WriterState::Closed {
            return Err(Error::Closed);
        }
        self.written += data.len() as u64;

        match self.state {
            WriterState::Buffering => {
                let buffer = self.buffer.get_or_insert_with(|| self.config.pools.buffer());
                buffer.extend_from_slice(data);
                if buffer.len() >= self.min_size {
                    self.start_compressing()?;
                }
                Ok(())
            }
            WriterState::Compressing => self.encode(data),
            WriterState::Passthrough => {
                self.output.extend_from_slice(data);
                Ok(())
            }
            WriterState::Init | WriterState::Closed => Err(Error::Closed),
        }
    }

    /// Commits the header decision if not made yet, and flushes the encoder.
    ///
    /// While buffering this does nothing: the body size is still unknown.
    pub fn flush(&mut self) -> Result<()> {
        match self.state {
            WriterState::Init => self.start(),
            WriterState::Compressing => self.flush_encoder(),
            _ => Ok(()),
        }
    }

    /// Finalizes the response.
    ///
    /// A body still buffering here is shorter than the minimum size and is
    /// sent as is. The encoder is closed unconditionally and every leased
    /// resource goes back to its pool, even when closing fails. Closing
    /// twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.state == WriterState::Init {
            if let Err(err) = self.start() {
                self.release();
                return Err(err);
            }
        }

        let result = match self.state {
            WriterState::Buffering => {
                self.commit_passthrough("body below minimum size");
                Ok(())
            }
            WriterState::Compressing => match self.encoder.as_mut() {
                Some(encoder) => encoder
                    .finish(&mut self.output)
                    .map_err(|err| Error::encoder(encoder.encoding(), err)),
                None => Ok(()),
            },
            WriterState::Passthrough | WriterState::Closed | WriterState::Init => Ok(()),
        };

        if self.state != WriterState::Closed {
            tracing::trace!(written = self.written, "response finalized");
        }
        self.release();
        result
    }

    /// Stops the response after a failure, discarding pending output.
    pub(crate) fn abort(&mut self) {
        self.output.clear();
        self.release();
    }

    fn release(&mut self) {
        // Dropping the guards closes the encoder if needed and returns both to their pools.
        self.encoder = None;
        self.buffer = None;
        self.state = WriterState::Closed;
    }

    fn start(&mut self) -> Result<()> {
        match self.decide() {
            Decision::Passthrough(reason) => {
                self.commit_passthrough(reason);
                Ok(())
            }
            Decision::Compress => self.start_compressing(),
            Decision::Buffer => {
                self.state = WriterState::Buffering;
                Ok(())
            }
        }
    }

    fn decide(&self) -> Decision {
        if self.negotiated.is_empty() {
            return Decision::Passthrough("no acceptable encoding");
        }
        if self.bodyless {
            return Decision::Passthrough("response has no body");
        }
        if headers::has_content_encoding(&self.headers) {
            return Decision::Passthrough("already encoded");
        }
        if headers::has_content_range(&self.headers) {
            return Decision::Passthrough("range response");
        }
        if headers::is_uncompressible_content_type(&self.headers) {
            return Decision::Passthrough("incompressible content type");
        }
        if let Some(filter) = &self.config.filter {
            if !filter.allows(self.headers.get(http::header::CONTENT_TYPE)) {
                return Decision::Passthrough("content type filtered");
            }
        }
        match headers::content_length(&self.headers) {
            Some(len) if len < self.min_size as u64 => Decision::Passthrough("body below minimum size"),
            Some(_) => Decision::Compress,
            None if self.always_flush || self.min_size == 0 => Decision::Compress,
            None => Decision::Buffer,
        }
    }

    fn commit_passthrough(&mut self, reason: &'static str) {
        if self.committed {
            return;
        }
        tracing::debug!(reason, "not compressing response");
        if !self.config.registry.is_empty() {
            headers::add_vary_accept_encoding(&mut self.headers);
        }
        self.committed = true;
        self.state = WriterState::Passthrough;

        if let Some(buffer) = self.buffer.take() {
            self.output.extend_from_slice(&buffer);
        }
    }

    /// Leases an encoder, commits the compressed headers and replays the buffered prefix.
    ///
    /// If no encoder can be leased, nothing is committed and the error is
    /// returned so the caller can answer with an error response instead.
    fn start_compressing(&mut self) -> Result<()> {
        let Some(compressor) = self.negotiated.chosen() else {
            self.commit_passthrough("no acceptable encoding");
            return Ok(());
        };
        let mut encoder = match self.config.pools.encoder(compressor) {
            Ok(encoder) => encoder,
            Err(err) => {
                tracing::warn!(encoding = compressor.name(), error = %err, "cannot lease encoder");
                self.release();
                return Err(err);
            }
        };

        tracing::debug!(encoding = compressor.name(), streaming = self.always_flush, "compressing response");
        headers::set_compressed(&mut self.headers, compressor.header_value());
        self.committed = true;
        self.state = WriterState::Compressing;

        let prefix = self.buffer.take();
        let result = match &prefix {
            Some(buffer) if !buffer.is_empty() => encoder
                .encode(buffer, &mut self.output)
                .map_err(|err| Error::encoder(encoder.encoding(), err)),
            _ => Ok(()),
        };
        self.encoder = Some(encoder);
        result?;
        if self.always_flush {
            self.flush_encoder()?;
        }
        Ok(())
    }

    fn encode(&mut self, data: &[u8]) -> Result<()> {
        let Some(encoder) = self.encoder.as_mut() else {
            return Err(Error::Closed);
        };
        encoder
            .encode(data, &mut self.output)
            .map_err(|err| Error::encoder(encoder.encoding(), err))?;
        if self.always_flush {
            self.flush_encoder()?;
        }
        Ok(())
    }

    fn flush_encoder(&mut self) -> Result<()> {
        match self.encoder.as_mut() {
            Some(encoder) => encoder
                .flush(&mut self.output)
                .map_err(|err| Error::encoder(encoder.encoding(), err)),
            None => Ok(()),
        }
    }
}
