//! HTTP response compression middleware for Tower.
//!
//! This crate provides a Tower layer that negotiates a content coding from
//! the client's `Accept-Encoding` header and compresses HTTP response bodies
//! with it. Encoders come from a registry of providers (the built-in Zstd,
//! Brotli, Gzip and Deflate codecs, or your own) and are recycled through
//! per-layer pools.
//!
//! # Example
//!
//! ```ignore
//! use http_compression_negotiator::{CompressionLayer, Preference};
//! use tower::ServiceBuilder;
//!
//! let compression = CompressionLayer::builder()
//!     .default_codecs()
//!     .prefer(Preference::Client)
//!     .min_size(512)
//!     .build()?;
//!
//! let service = ServiceBuilder::new()
//!     .layer(compression)
//!     .service(my_service);
//! ```
//!
//! # Negotiation
//!
//! Every registered encoding with a positive quality, explicit or through
//! `*`, is a candidate; `q=0` always excludes. With [`Preference::Server`]
//! (the default) the highest server priority wins; with
//! [`Preference::Client`] the highest quality wins and priority breaks ties.
//! `identity` is never a candidate.
//!
//! # Compression Rules
//!
//! The middleware will **not** compress responses when:
//! - No registered encoding is acceptable to the client
//! - `Content-Encoding` header is already set
//! - `Content-Range` header is present (range responses)
//! - The response has no body (HEAD, 1xx, 204, 304)
//! - `Content-Type` starts with `image/` (except `image/svg+xml`)
//! - `Content-Type` starts with `application/grpc` (except `application/grpc-web`)
//! - `Content-Type` is rejected by the configured content type filter
//! - The body is smaller than the minimum size (default: 200 bytes)
//!
//! Bodies without a `Content-Length` are buffered until the minimum size is
//! reached, so short responses are never compressed.
//!
//! The middleware will **always flush** after each chunk when:
//! - `X-Accel-Buffering: no` header is present
//! - `Content-Type` is `text/event-stream`
//! - `Content-Type` starts with `application/grpc-web`
//!
//! # Response Modifications
//!
//! When compression is applied:
//! - `Content-Encoding` header is set to the negotiated coding
//! - `Content-Length` header is removed (compressed size is unknown)
//! - `Accept-Ranges` header is removed
//!
//! Whenever at least one compressor is registered, `Vary` includes
//! `Accept-Encoding`, and the request's `Range` header is dropped when an
//! encoding was negotiated.

#![deny(missing_docs)]

mod body;
mod codec;
mod config;
mod error;
mod future;
mod headers;
mod layer;
mod negotiate;
mod pool;
mod registry;
mod service;
mod writer;

#[cfg(test)]
mod testing;

pub use body::{CompressionBody, EncodedBody};
pub use codec::{Codec, CodecProvider, CompressorProvider, Encoder};
pub use compression_core::Level;
pub use config::{
    ContentTypeFilter, DEFAULT_MIN_SIZE, DefaultErrorHandler, ErrorHandler, FilterMode, MediaRange,
    MinSize, RequestHead,
};
pub use error::{BoxError, Error, Result};
pub use future::ResponseFuture;
pub use layer::{Builder, CompressionLayer};
pub use negotiate::{Codings, Negotiated, Preference, accepted_compression, parse_encodings};
pub use pool::{
    BufferPool, DEFAULT_MAX_IDLE, DEFAULT_MAX_POOLED_BUFFER, EncoderPool, PoolConfig,
    PooledBuffer, PooledEncoder, Pools,
};
pub use registry::{CompressorRegistry, RegisteredCompressor, RegistryBuilder};
pub use service::CompressionService;
pub use writer::{CompressingWriter, WriterState};
