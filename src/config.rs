use crate::error::{BoxError, Error, Result};
use crate::negotiate::Preference;
use crate::pool::Pools;
use crate::registry::CompressorRegistry;
use bytes::Bytes;
use http::{HeaderValue, Method, Response, StatusCode, Uri, Version, header, request};
use std::fmt;
use std::sync::Arc;

/// Default minimum body size for compression.
pub const DEFAULT_MIN_SIZE: usize = 200;

/// The part of a request kept around for error reporting.
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// Request method.
    pub method: Method,
    /// Request URI.
    pub uri: Uri,
    /// HTTP version.
    pub version: Version,
}

impl From<&request::Parts> for RequestHead {
    fn from(parts: &request::Parts) -> Self {
        Self {
            method: parts.method.clone(),
            uri: parts.uri.clone(),
            version: parts.version,
        }
    }
}

type MinSizeFn = dyn Fn(&request::Parts) -> std::result::Result<usize, BoxError> + Send + Sync;

/// Minimum body size below which responses are sent uncompressed.
#[derive(Clone)]
pub enum MinSize {
    /// The same threshold for every request.
    Fixed(usize),
    /// A threshold computed per request.
    Resolver(Arc<MinSizeFn>),
}

impl MinSize {
    pub(crate) fn resolve(&self, parts: &request::Parts) -> Result<usize> {
        match self {
            MinSize::Fixed(size) => Ok(*size),
            MinSize::Resolver(f) => f(parts).map_err(Error::MinSize),
        }
    }
}

impl Default for MinSize {
    fn default() -> Self {
        MinSize::Fixed(DEFAULT_MIN_SIZE)
    }
}

impl fmt::Debug for MinSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MinSize::Fixed(size) => f.debug_tuple("Fixed").field(size).finish(),
            MinSize::Resolver(_) => f.write_str("Resolver(..)"),
        }
    }
}

/// A media range such as `text/html`, `text/*` or `text/html; charset=utf-8`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRange {
    kind: String,
    subtype: String,
    params: Vec<(String, String)>,
}

impl MediaRange {
    /// Parses a media range; type, subtype and parameter names are lowercased.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split(';');
        let (kind, subtype) = parts.next()?.trim().split_once('/')?;
        let (kind, subtype) = (kind.trim(), subtype.trim());
        if kind.is_empty() || subtype.is_empty() || (kind == "*" && subtype != "*") {
            return None;
        }

        let mut params = Vec::new();
        for param in parts {
            let param = param.trim();
            if param.is_empty() {
                continue;
            }
            let (name, value) = param.split_once('=')?;
            params.push((
                name.trim().to_ascii_lowercase(),
                value.trim().trim_matches('"').to_owned(),
            ));
        }

        Some(Self {
            kind: kind.to_ascii_lowercase(),
            subtype: subtype.to_ascii_lowercase(),
            params,
        })
    }

    /// Returns true when `content_type` falls within this range.
    ///
    /// Every parameter of the range must be present on the content type
    /// with an equal value; extra parameters on the content type are fine.
    pub fn matches(&self, content_type: &MediaRange) -> bool {
        (self.kind == "*" || self.kind == content_type.kind)
            && (self.subtype == "*" || self.subtype == content_type.subtype)
            && self.params.iter().all(|(name, value)| {
                content_type
                    .params
                    .iter()
                    .any(|(n, v)| n == name && v.eq_ignore_ascii_case(value))
            })
    }
}

/// Whether the listed media ranges are the only ones compressed, or never compressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    /// Compress only matching responses.
    Allow,
    /// Compress everything except matching responses.
    Deny,
}

/// Content-Type based allow- or deny-list.
#[derive(Debug, Clone)]
pub struct ContentTypeFilter {
    ranges: Vec<MediaRange>,
    mode: FilterMode,
}

impl ContentTypeFilter {
    /// Builds a filter from media range strings.
    pub fn new<I, S>(ranges: I, mode: FilterMode) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ranges = ranges
            .into_iter()
            .map(|s| {
                let s = s.as_ref();
                MediaRange::parse(s)
                    .ok_or_else(|| Error::InvalidConfig(format!("invalid media range {s:?}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { ranges, mode })
    }

    /// Returns true when a response with this Content-Type may be compressed.
    ///
    /// A missing or unparsable Content-Type matches no range.
    pub fn allows(&self, content_type: Option<&HeaderValue>) -> bool {
        let matched = content_type
            .and_then(|v| v.to_str().ok())
            .and_then(MediaRange::parse)
            .is_some_and(|ct| self.ranges.iter().any(|r| r.matches(&ct)));
        match self.mode {
            FilterMode::Allow => matched,
            FilterMode::Deny => !matched,
        }
    }
}

/// Receives errors raised while compressing a response.
pub trait ErrorHandler: Send + Sync + 'static {
    /// Builds the response sent instead when an error happens before the
    /// response headers were committed.
    fn on_error(&self, head: &RequestHead, error: &Error) -> Response<Bytes>;

    /// Reports an error that happened after the headers were sent.
    ///
    /// The client connection is aborted afterwards; nothing can be written.
    fn on_stream_error(&self, head: &RequestHead, error: &Error) {
        tracing::error!(method = %head.method, uri = %head.uri, error = %error, "response compression failed");
    }
}

impl<F> ErrorHandler for F
where
    F: Fn(&RequestHead, &Error) -> Response<Bytes> + Send + Sync + 'static,
{
    fn on_error(&self, head: &RequestHead, error: &Error) -> Response<Bytes> {
        self(head, error)
    }
}

/// Logs the error and answers `500 Internal Server Error`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultErrorHandler;

impl ErrorHandler for DefaultErrorHandler {
    fn on_error(&self, head: &RequestHead, error: &Error) -> Response<Bytes> {
        tracing::error!(method = %head.method, uri = %head.uri, error = %error, "response compression failed");
        let mut response = Response::new(Bytes::from_static(b"500 Internal Server Error\n"));
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }
}

/// Everything a layer shares with the requests it serves.
pub(crate) struct Config {
    pub(crate) registry: CompressorRegistry,
    pub(crate) pools: Pools,
    pub(crate) min_size: MinSize,
    pub(crate) preference: Preference,
    pub(crate) filter: Option<ContentTypeFilter>,
    pub(crate) error_handler: Arc<dyn ErrorHandler>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("registry", &self.registry)
            .field("min_size", &self.min_size)
            .field("preference", &self.preference)
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}
