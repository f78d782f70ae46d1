use crate::body::CompressionBody;
use crate::config::{Config, RequestHead};
use crate::error::BoxError;
use crate::future::{RequestContext, ResponseFuture};
use crate::negotiate::{accepted_compression, parse_encodings};
use bytes::Buf;
use http::{Request, Response, header};
use http_body::Body;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::Service;

/// A Tower service that compresses HTTP response bodies.
#[derive(Debug, Clone)]
pub struct CompressionService<S> {
    inner: S,
    config: Arc<Config>,
}

impl<S> CompressionService<S> {
    pub(crate) fn new(inner: S, config: Arc<Config>) -> Self {
        Self { inner, config }
    }

    /// Returns a reference to the inner service.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Returns a mutable reference to the inner service.
    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Consumes this service, returning the inner service.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for CompressionService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    ResBody: Body,
    ResBody::Data: Buf,
    ResBody::Error: Into<BoxError>,
{
    type Response = Response<CompressionBody<ResBody>>;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future, ResBody>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        if self.config.registry.is_empty() {
            return ResponseFuture::noop(self.inner.call(req));
        }

        let accept = parse_encodings(req.headers().get_all(header::ACCEPT_ENCODING));
        let negotiated = accepted_compression(&accept, &self.config.registry, self.config.preference);

        let (mut parts, body) = req.into_parts();
        if !negotiated.is_empty() {
            // Byte ranges would address the identity representation
            parts.headers.remove(header::RANGE);
        }

        let head = RequestHead::from(&parts);
        let min_size = match self.config.min_size.resolve(&parts) {
            Ok(min_size) => min_size,
            Err(err) => return ResponseFuture::failed(self.config.error_handler.on_error(&head, &err)),
        };

        tracing::trace!(
            method = %head.method,
            uri = %head.uri,
            candidates = ?negotiated.names(),
            min_size,
            "negotiated response encoding"
        );

        let inner = self.inner.call(Request::from_parts(parts, body));
        ResponseFuture::new(
            inner,
            RequestContext {
                config: Arc::clone(&self.config),
                negotiated,
                min_size,
                head,
            },
        )
    }
}
