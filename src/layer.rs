use crate::codec::{Codec, CodecProvider, CompressorProvider};
use crate::config::{
    Config, ContentTypeFilter, DefaultErrorHandler, ErrorHandler, FilterMode, MinSize,
};
use crate::error::{BoxError, Error, Result};
use crate::negotiate::Preference;
use crate::pool::{PoolConfig, Pools};
use crate::registry::{CompressorRegistry, RegistryBuilder};
use crate::service::CompressionService;
use compression_core::Level;
use http::request;
use std::sync::Arc;
use tower::Layer;

/// A Tower layer that compresses HTTP response bodies.
///
/// This layer wraps services and compresses response bodies with the
/// encoding negotiated from the client's `Accept-Encoding` header. Every
/// service produced by one layer shares its registry and pools.
#[derive(Debug, Clone)]
pub struct CompressionLayer {
    config: Arc<Config>,
}

impl CompressionLayer {
    /// Creates a layer with every built-in codec and default settings.
    ///
    /// The default minimum size for compression is 200 bytes.
    pub fn new() -> Self {
        let registry = CompressorRegistry::with_default_codecs();
        Self::from_parts(
            registry,
            PoolConfig::default(),
            MinSize::default(),
            Preference::default(),
            None,
            Arc::new(DefaultErrorHandler),
        )
    }

    /// Returns a builder starting from an empty registry.
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Returns the compressors this layer negotiates between.
    pub fn registry(&self) -> &CompressorRegistry {
        &self.config.registry
    }

    /// Returns the pools shared by the services of this layer.
    pub fn pools(&self) -> &Pools {
        &self.config.pools
    }

    fn from_parts(
        registry: CompressorRegistry,
        pool: PoolConfig,
        min_size: MinSize,
        preference: Preference,
        filter: Option<ContentTypeFilter>,
        error_handler: Arc<dyn ErrorHandler>,
    ) -> Self {
        Self {
            config: Arc::new(Config {
                pools: Pools::new(&registry, pool),
                registry,
                min_size,
                preference,
                filter,
                error_handler,
            }),
        }
    }
}

impl Default for CompressionLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Layer<S> for CompressionLayer {
    type Service = CompressionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CompressionService::new(inner, Arc::clone(&self.config))
    }
}

/// Builder for [`CompressionLayer`].
///
/// Options are checked in [`build`](Builder::build); the first invalid one
/// is reported there.
pub struct Builder {
    registry: RegistryBuilder,
    pool: PoolConfig,
    min_size: MinSize,
    preference: Preference,
    include: Option<Vec<String>>,
    exclude: Option<Vec<String>>,
    error_handler: Arc<dyn ErrorHandler>,
    error: Option<Error>,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            registry: RegistryBuilder::default(),
            pool: PoolConfig::default(),
            min_size: MinSize::default(),
            preference: Preference::default(),
            include: None,
            exclude: None,
            error_handler: Arc::new(DefaultErrorHandler),
            error: None,
        }
    }
}

impl Builder {
    /// Registers a custom compressor under a content-coding name.
    ///
    /// Higher priorities are preferred. A later registration under the same
    /// name replaces an earlier one.
    pub fn compressor<P>(mut self, name: impl Into<String>, priority: i32, provider: P) -> Self
    where
        P: CompressorProvider,
    {
        self.registry = self.registry.register(name, priority, provider);
        self
    }

    /// Registers a built-in codec at its default level and priority.
    pub fn codec(mut self, codec: Codec) -> Self {
        self.registry = self.registry.codec(CodecProvider::new(codec));
        self
    }

    /// Registers a built-in codec at an explicit level.
    pub fn codec_level(mut self, codec: Codec, level: Level) -> Self {
        match CodecProvider::with_level(codec, level) {
            Ok(provider) => self.registry = self.registry.codec(provider),
            Err(err) => self.fail(err),
        }
        self
    }

    /// Registers every built-in codec at its default level and priority.
    pub fn default_codecs(self) -> Self {
        Codec::all().iter().fold(self, |builder, codec| builder.codec(*codec))
    }

    /// Sets the minimum body size required for compression.
    ///
    /// Responses with a known Content-Length smaller than this value are not
    /// compressed; bodies of unknown length are buffered up to it.
    pub fn min_size(mut self, size: usize) -> Self {
        self.min_size = MinSize::Fixed(size);
        self
    }

    /// Computes the minimum body size per request.
    ///
    /// When the function fails the error handler answers the request and
    /// the inner service is not called.
    pub fn min_size_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&request::Parts) -> std::result::Result<usize, BoxError> + Send + Sync + 'static,
    {
        self.min_size = MinSize::Resolver(Arc::new(f));
        self
    }

    /// Sets whose ranking decides between mutually acceptable encodings.
    pub fn prefer(mut self, preference: Preference) -> Self {
        self.preference = preference;
        self
    }

    /// Compresses only responses whose Content-Type matches one of `ranges`.
    pub fn content_types<I, S>(mut self, ranges: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include = Some(ranges.into_iter().map(Into::into).collect());
        self
    }

    /// Never compresses responses whose Content-Type matches one of `ranges`.
    pub fn exclude_content_types<I, S>(mut self, ranges: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude = Some(ranges.into_iter().map(Into::into).collect());
        self
    }

    /// Staging buffers that grew beyond `bytes` are not pooled.
    pub fn max_pooled_buffer(mut self, bytes: usize) -> Self {
        self.pool.max_buffer_capacity = bytes;
        self
    }

    /// Maximum idle buffers, and idle encoders per encoding, kept for reuse.
    pub fn max_idle(mut self, count: usize) -> Self {
        self.pool.max_idle = count;
        self
    }

    /// Replaces the handler invoked when compressing a response fails.
    pub fn error_handler<H>(mut self, handler: H) -> Self
    where
        H: ErrorHandler,
    {
        self.error_handler = Arc::new(handler);
        self
    }

    /// Validates the options and builds the layer.
    pub fn build(self) -> Result<CompressionLayer> {
        if let Some(err) = self.error {
            return Err(err);
        }

        let filter = match (self.include, self.exclude) {
            (Some(_), Some(_)) => {
                return Err(Error::InvalidConfig(
                    "content_types and exclude_content_types are mutually exclusive".to_owned(),
                ));
            }
            (Some(ranges), None) => Some(ContentTypeFilter::new(ranges, FilterMode::Allow)?),
            (None, Some(ranges)) => Some(ContentTypeFilter::new(ranges, FilterMode::Deny)?),
            (None, None) => None,
        };

        let registry = self.registry.build()?;
        if registry.is_empty() {
            tracing::debug!("no compressors registered, responses will pass through");
        }

        Ok(CompressionLayer::from_parts(
            registry,
            self.pool,
            self.min_size,
            self.preference,
            filter,
            self.error_handler,
        ))
    }

    fn fail(&mut self, err: Error) {
        self.error.get_or_insert(err);
    }
}

impl std::fmt::Debug for Builder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builder")
            .field("registry", &self.registry)
            .field("pool", &self.pool)
            .field("min_size", &self.min_size)
            .field("preference", &self.preference)
            .field("include", &self.include)
            .field("exclude", &self.exclude)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Verbatim;

    #[test]
    fn test_new_registers_default_codecs() {
        let layer = CompressionLayer::new();
        assert_eq!(layer.registry().len(), Codec::all().len());
    }

    #[test]
    fn test_builder_starts_empty() {
        let layer = CompressionLayer::builder().build().unwrap();
        assert!(layer.registry().is_empty());
    }

    #[test]
    fn test_custom_compressor_registered() {
        let layer = CompressionLayer::builder()
            .default_codecs()
            .compressor("x-verbatim", 7, Verbatim)
            .build()
            .unwrap();
        assert_eq!(layer.registry().get("x-verbatim").unwrap().priority(), 7);
        assert!(layer.pools().encoders("x-verbatim").is_some());
    }

    #[test]
    fn test_conflicting_filters_rejected() {
        let err = CompressionLayer::builder()
            .content_types(["text/*"])
            .exclude_content_types(["image/*"])
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_invalid_media_range_rejected() {
        let err = CompressionLayer::builder()
            .content_types(["text"])
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_invalid_name_rejected() {
        let err = CompressionLayer::builder()
            .compressor("identity", 0, Verbatim)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_invalid_level_rejected() {
        let err = CompressionLayer::builder()
            .codec_level(Codec::Gzip, Level::Precise(42))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidLevel { encoding: "gzip", level: 42 }));
    }

    #[test]
    #[cfg(feature = "zstd")]
    fn test_valid_level_accepted() {
        let layer = CompressionLayer::builder()
            .codec_level(Codec::Zstd, Level::Precise(19))
            .build()
            .unwrap();
        assert!(layer.registry().get("zstd").is_some());
    }

    #[test]
    fn test_layers_do_not_share_pools() {
        let a = CompressionLayer::builder().compressor("x-verbatim", 0, Verbatim).build().unwrap();
        let b = a.clone();
        let c = CompressionLayer::builder().compressor("x-verbatim", 0, Verbatim).build().unwrap();
        assert!(std::ptr::eq(a.pools(), b.pools()));
        assert!(!std::ptr::eq(a.pools(), c.pools()));
    }
}
