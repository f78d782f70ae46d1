use crate::error::{Error, Result};
use bytes::BytesMut;
#[cfg(feature = "brotli")]
use compression_codecs::brotli::{BrotliEncoder, params::EncoderParams as BrotliParams};
#[cfg(feature = "gzip")]
use compression_codecs::gzip::GzipEncoder;
#[cfg(feature = "deflate")]
use compression_codecs::zlib::ZlibEncoder;
#[cfg(feature = "zstd")]
use compression_codecs::zstd::ZstdEncoder;
use compression_codecs::EncodeV2;
use compression_core::Level;
use compression_core::util::{PartialBuffer, WriteBuffer};
use std::fmt;
use std::io;

const OUTPUT_BUFFER_SIZE: usize = 8 * 1024; // 8KB scratch per encoder

const PROBE: &[u8] = b"probe payload used to check that the encoder produces output";

/// A source of encoders for a single content coding.
///
/// Providers are constructed once, at configuration time, and shared by
/// every request served by the layer. Each call to [`encoder`] hands back a
/// fresh encoder; pooled encoders are recycled through [`Encoder::reset`]
/// instead of being requested again.
///
/// [`encoder`]: CompressorProvider::encoder
pub trait CompressorProvider: Send + Sync + 'static {
    /// Creates a new encoder.
    fn encoder(&self) -> io::Result<Box<dyn Encoder>>;
}

/// A streaming encoder writing compressed output into a byte sink.
pub trait Encoder: Send {
    /// Compresses `input`, appending whatever output is ready to `sink`.
    fn encode(&mut self, input: &[u8], sink: &mut BytesMut) -> io::Result<()>;

    /// Forces out all data buffered inside the encoder.
    fn flush(&mut self, sink: &mut BytesMut) -> io::Result<()>;

    /// Terminates the stream, appending the trailing output to `sink`.
    ///
    /// Any resources held by the encoder must be released before this
    /// returns.
    fn finish(&mut self, sink: &mut BytesMut) -> io::Result<()>;

    /// Clears all state so the encoder can start an unrelated stream.
    fn reset(&mut self) -> io::Result<()>;
}

impl fmt::Debug for dyn Encoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Encoder")
    }
}

/// Supported compression codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// Zstd compression.
    #[cfg(feature = "zstd")]
    Zstd,
    /// Brotli compression.
    #[cfg(feature = "brotli")]
    Brotli,
    /// Gzip compression.
    #[cfg(feature = "gzip")]
    Gzip,
    /// Deflate compression, sent in the zlib format.
    #[cfg(feature = "deflate")]
    Deflate,
}

impl Codec {
    /// Returns every codec compiled into this build.
    pub fn all() -> &'static [Codec] {
        &[
            #[cfg(feature = "zstd")]
            Codec::Zstd,
            #[cfg(feature = "brotli")]
            Codec::Brotli,
            #[cfg(feature = "gzip")]
            Codec::Gzip,
            #[cfg(feature = "deflate")]
            Codec::Deflate,
        ]
    }

    /// Returns the Content-Encoding header value for this codec.
    pub fn content_encoding(&self) -> &'static str {
        match *self {
            #[cfg(feature = "zstd")]
            Codec::Zstd => "zstd",
            #[cfg(feature = "brotli")]
            Codec::Brotli => "br",
            #[cfg(feature = "gzip")]
            Codec::Gzip => "gzip",
            #[cfg(feature = "deflate")]
            Codec::Deflate => "deflate",
        }
    }

    /// Returns the default server priority for this codec.
    ///
    /// Higher values are preferred: zstd over brotli over gzip over deflate.
    pub fn default_priority(&self) -> i32 {
        match *self {
            #[cfg(feature = "zstd")]
            Codec::Zstd => -50,
            #[cfg(feature = "brotli")]
            Codec::Brotli => -100,
            #[cfg(feature = "gzip")]
            Codec::Gzip => -200,
            #[cfg(feature = "deflate")]
            Codec::Deflate => -300,
        }
    }

    fn check_level(&self, level: Level) -> Result<()> {
        let Level::Precise(n) = level else {
            return Ok(());
        };
        let valid = match *self {
            #[cfg(feature = "zstd")]
            Codec::Zstd => (1..=22).contains(&n),
            #[cfg(feature = "brotli")]
            Codec::Brotli => (0..=11).contains(&n),
            #[cfg(feature = "gzip")]
            Codec::Gzip => (0..=9).contains(&n),
            #[cfg(feature = "deflate")]
            Codec::Deflate => (0..=9).contains(&n),
        };
        if valid {
            Ok(())
        } else {
            Err(Error::InvalidLevel {
                encoding: self.content_encoding(),
                level: n,
            })
        }
    }

    /// Creates a new raw encoder for this codec.
    fn raw_encoder(&self, level: Level) -> Box<dyn EncodeV2 + Send> {
        match *self {
            #[cfg(feature = "zstd")]
            Codec::Zstd => Box::new(ZstdEncoder::new(zstd_level(level))),
            #[cfg(feature = "brotli")]
            Codec::Brotli => Box::new(BrotliEncoder::new(
                BrotliParams::default().quality(brotli_level(level)),
            )),
            #[cfg(feature = "gzip")]
            Codec::Gzip => Box::new(GzipEncoder::new(level.into())),
            // HTTP deflate is the zlib format, not a raw deflate stream.
            #[cfg(feature = "deflate")]
            Codec::Deflate => Box::new(ZlibEncoder::new(level.into())),
        }
    }
}

#[cfg(feature = "zstd")]
fn zstd_level(level: Level) -> i32 {
    match level {
        Level::Fastest => 1,
        Level::Best => 19,
        Level::Precise(n) => n,
        _ => 3, // level 3 is a good default
    }
}

#[cfg(feature = "brotli")]
fn brotli_level(level: Level) -> Level {
    match level {
        Level::Fastest => Level::Precise(0),
        Level::Best => Level::Precise(11),
        Level::Precise(n) => Level::Precise(n),
        // quality 11 is too slow for responses compressed on the fly
        _ => Level::Precise(3),
    }
}

/// [`CompressorProvider`] for the built-in codecs.
#[derive(Debug, Clone, Copy)]
pub struct CodecProvider {
    codec: Codec,
    level: Level,
}

impl CodecProvider {
    /// Creates a provider using the codec's default level.
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            level: Level::Default,
        }
    }

    /// Creates a provider with an explicit level.
    ///
    /// The level is validated and one encoder is run over a probe payload,
    /// so a provider that would fail at request time fails here instead.
    pub fn with_level(codec: Codec, level: Level) -> Result<Self> {
        codec.check_level(level)?;
        let provider = Self { codec, level };
        provider.probe().map_err(|source| Error::ProviderInit {
            encoding: codec.content_encoding().to_owned(),
            source,
        })?;
        Ok(provider)
    }

    /// Returns the codec of this provider.
    pub fn codec(&self) -> Codec {
        self.codec
    }

    fn probe(&self) -> io::Result<()> {
        let mut encoder = self.encoder()?;
        let mut sink = BytesMut::new();
        encoder.encode(PROBE, &mut sink)?;
        encoder.finish(&mut sink)?;
        if sink.is_empty() {
            return Err(io::Error::other("encoder produced no output"));
        }
        Ok(())
    }
}

impl CompressorProvider for CodecProvider {
    fn encoder(&self) -> io::Result<Box<dyn Encoder>> {
        Ok(Box::new(CodecEncoder {
            codec: self.codec,
            level: self.level,
            inner: self.codec.raw_encoder(self.level),
            output_buffer: vec![0u8; OUTPUT_BUFFER_SIZE],
            finished: false,
        }))
    }
}

/// Streaming encoder driving a `compression-codecs` encoder.
struct CodecEncoder {
    codec: Codec,
    level: Level,
    inner: Box<dyn EncodeV2 + Send>,
    output_buffer: Vec<u8>,
    finished: bool,
}

impl CodecEncoder {
    /// Repeatedly runs `step` until it reports completion, collecting output.
    fn drain(
        &mut self,
        sink: &mut BytesMut,
        step: fn(&mut (dyn EncodeV2 + Send), &mut WriteBuffer<'_>) -> io::Result<bool>,
    ) -> io::Result<()> {
        loop {
            let mut output = WriteBuffer::new_initialized(self.output_buffer.as_mut_slice());
            let done = step(self.inner.as_mut(), &mut output)?;
            let written = output.written_len();
            sink.extend_from_slice(&self.output_buffer[..written]);
            if done {
                return Ok(());
            }
        }
    }
}

impl Encoder for CodecEncoder {
    fn encode(&mut self, input: &[u8], sink: &mut BytesMut) -> io::Result<()> {
        if self.finished {
            return Err(io::Error::other("encode after finish"));
        }
        let mut input_buf = PartialBuffer::new(input);

        // Keep encoding until all input is consumed
        loop {
            let mut output = WriteBuffer::new_initialized(self.output_buffer.as_mut_slice());
            self.inner.encode(&mut input_buf, &mut output)?;

            let written = output.written_len();
            sink.extend_from_slice(&self.output_buffer[..written]);

            if input_buf.written_len() >= input.len() {
                return Ok(());
            }
            if written == 0 && input_buf.written_len() == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "encoder made no progress",
                ));
            }
        }
    }

    fn flush(&mut self, sink: &mut BytesMut) -> io::Result<()> {
        if self.finished {
            return Ok(());
        }
        self.drain(sink, |encoder, output| encoder.flush(output))
    }

    fn finish(&mut self, sink: &mut BytesMut) -> io::Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.drain(sink, |encoder, output| encoder.finish(output))
    }

    /// Codec encoders carry no reset hook, so the codec state is rebuilt
    /// from scratch. Only the output scratch buffer survives a reset.
    fn reset(&mut self) -> io::Result<()> {
        self.inner = self.codec.raw_encoder(self.level);
        self.finished = false;
        Ok(())
    }
}
