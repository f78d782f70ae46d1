use crate::codec::{Codec, CodecProvider, CompressorProvider};
use crate::error::{Error, Result};
use http::HeaderValue;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A compressor registered under a content-coding name.
#[derive(Clone)]
pub struct RegisteredCompressor {
    name: Arc<str>,
    header_value: HeaderValue,
    priority: i32,
    provider: Arc<dyn CompressorProvider>,
}

impl RegisteredCompressor {
    /// Returns the content-coding name, lowercase.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the server priority; higher values are preferred.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Returns the provider backing this encoding.
    pub fn provider(&self) -> &dyn CompressorProvider {
        self.provider.as_ref()
    }

    /// Returns the name as a `Content-Encoding` header value.
    pub(crate) fn header_value(&self) -> &HeaderValue {
        &self.header_value
    }

    pub(crate) fn shared_name(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }
}

impl fmt::Debug for RegisteredCompressor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredCompressor")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Immutable mapping from content-coding name to compressor.
///
/// Built once through [`RegistryBuilder`] and never mutated afterwards, so it
/// can be read from any number of concurrent requests without locking.
#[derive(Debug, Clone, Default)]
pub struct CompressorRegistry {
    entries: BTreeMap<Arc<str>, RegisteredCompressor>,
}

impl CompressorRegistry {
    /// Returns a builder for a new registry.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Returns a registry with every built-in codec at its default level and priority.
    pub fn with_default_codecs() -> Self {
        let mut registry = Self::default();
        for codec in Codec::all() {
            registry.insert(
                codec.content_encoding().into(),
                HeaderValue::from_static(codec.content_encoding()),
                codec.default_priority(),
                Arc::new(CodecProvider::new(*codec)),
            );
        }
        registry
    }

    /// Number of registered compressors.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when no compressor is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up a compressor by name, case-insensitively.
    pub fn get(&self, name: &str) -> Option<&RegisteredCompressor> {
        if name.bytes().any(|b| b.is_ascii_uppercase()) {
            self.entries.get(name.to_ascii_lowercase().as_str())
        } else {
            self.entries.get(name)
        }
    }

    /// Iterates over the registered compressors, ordered by name.
    pub fn iter(&self) -> impl Iterator<Item = &RegisteredCompressor> {
        self.entries.values()
    }

    fn insert(
        &mut self,
        name: Arc<str>,
        header_value: HeaderValue,
        priority: i32,
        provider: Arc<dyn CompressorProvider>,
    ) {
        let entry = RegisteredCompressor {
            name: Arc::clone(&name),
            header_value,
            priority,
            provider,
        };
        self.entries.insert(name, entry);
    }
}

/// Builder for [`CompressorRegistry`].
///
/// Registering a name twice replaces the earlier entry.
#[derive(Default)]
pub struct RegistryBuilder {
    entries: Vec<(String, i32, Arc<dyn CompressorProvider>)>,
}

impl RegistryBuilder {
    /// Registers `provider` under `name` with the given server priority.
    pub fn register<P>(mut self, name: impl Into<String>, priority: i32, provider: P) -> Self
    where
        P: CompressorProvider,
    {
        self.entries.push((name.into(), priority, Arc::new(provider)));
        self
    }

    /// Registers a built-in codec under its standard name and default priority.
    pub fn codec(self, provider: CodecProvider) -> Self {
        let codec = provider.codec();
        self.register(codec.content_encoding(), codec.default_priority(), provider)
    }

    /// Validates the names and builds the registry.
    pub fn build(self) -> Result<CompressorRegistry> {
        let mut registry = CompressorRegistry::default();
        for (name, priority, provider) in self.entries {
            let (name, header_value) = validate_name(&name)?;
            registry.insert(name.into(), header_value, priority, provider);
        }
        Ok(registry)
    }
}

impl fmt::Debug for RegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(name, priority, _)| (name, priority)))
            .finish()
    }
}

fn validate_name(name: &str) -> Result<(String, HeaderValue)> {
    let name = name.trim().to_ascii_lowercase();
    let invalid = || Error::InvalidConfig(format!("invalid content-coding name {name:?}"));
    if name.is_empty() || !name.bytes().all(is_token_byte) {
        return Err(invalid());
    }
    if name == "identity" || name == "*" {
        return Err(Error::InvalidConfig(format!(
            "{name:?} cannot be registered as a compressor"
        )));
    }
    let header_value = HeaderValue::from_str(&name).map_err(|_| invalid())?;
    Ok((name, header_value))
}

/// RFC 9110 `tchar`.
pub(crate) fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}
