use crate::config::{ErrorHandler, RequestHead};
use crate::error::Error;
use crate::writer::CompressingWriter;
use bytes::{Buf, Bytes};
use http::HeaderMap;
use http_body::{Body, Frame, SizeHint};
use http_body_util::Full;
use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

pin_project! {
    /// A response body that may be compressed.
    ///
    /// Bodies decided at header time to stay uncompressed are forwarded
    /// frame by frame. Every other body is fed through a
    /// [`CompressingWriter`] whose output is emitted as data frames.
    #[project = CompressionBodyProj]
    #[allow(missing_docs)]
    pub enum CompressionBody<B> {
        /// Body forwarded unchanged.
        Passthrough {
            #[pin]
            inner: B,
        },
        /// Body written through the compressing writer.
        Encoded {
            state: EncodedBody<B>,
        },
        /// Response produced by the error handler instead of the handler's own.
        Replaced {
            #[pin]
            body: Full<Bytes>,
        },
    }
}

impl<B> CompressionBody<B> {
    pub(crate) fn passthrough(inner: B) -> Self {
        Self::Passthrough { inner }
    }

    pub(crate) fn encoded(state: EncodedBody<B>) -> Self {
        Self::Encoded { state }
    }

    pub(crate) fn replaced(data: Bytes) -> Self {
        Self::Replaced {
            body: Full::new(data),
        }
    }
}

/// An inner body and the writer it is being written through.
pub struct EncodedBody<B> {
    inner: Option<Pin<Box<B>>>,
    writer: CompressingWriter,
    head: RequestHead,
    error_handler: Arc<dyn ErrorHandler>,
    trailers: Option<HeaderMap>,
}

impl<B> EncodedBody<B> {
    pub(crate) fn new(
        inner: B,
        writer: CompressingWriter,
        head: RequestHead,
        error_handler: Arc<dyn ErrorHandler>,
    ) -> Self {
        Self {
            inner: Some(Box::pin(inner)),
            writer,
            head,
            error_handler,
            trailers: None,
        }
    }

    pub(crate) fn writer(&self) -> &CompressingWriter {
        &self.writer
    }

    pub(crate) fn writer_mut(&mut self) -> &mut CompressingWriter {
        &mut self.writer
    }

    /// Asks the error handler for a response replacing this one.
    pub(crate) fn on_error(&self, err: &Error) -> http::Response<Bytes> {
        self.error_handler.on_error(&self.head, err)
    }

    /// Stops reading the inner body and releases the writer's resources.
    pub(crate) fn abort(&mut self) {
        self.inner = None;
        self.trailers = None;
        self.writer.abort();
    }

    fn is_finished(&self) -> bool {
        self.inner.is_none() && !self.writer.has_output() && self.trailers.is_none()
    }
}

impl<B> EncodedBody<B>
where
    B: Body,
    B::Error: Into<crate::BoxError>,
{
    /// Moves one frame of the inner body into the writer.
    ///
    /// The writer is closed when the inner body ends or yields its trailers.
    pub(crate) fn poll_fill(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        let Some(inner) = self.inner.as_mut() else {
            return Poll::Ready(Ok(()));
        };

        match inner.as_mut().poll_frame(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => {
                self.inner = None;
                Poll::Ready(self.writer.close())
            }
            Poll::Ready(Some(Err(err))) => Poll::Ready(Err(Error::Body(err.into()))),
            Poll::Ready(Some(Ok(frame))) => match frame.into_data() {
                Ok(mut data) => {
                    while data.has_remaining() {
                        let chunk = data.chunk();
                        let len = chunk.len();
                        if let Err(err) = self.writer.write(chunk) {
                            return Poll::Ready(Err(err));
                        }
                        data.advance(len);
                    }
                    Poll::Ready(Ok(()))
                }
                Err(frame) => {
                    if let Ok(trailers) = frame.into_trailers() {
                        // Trailers end the body
                        self.trailers = Some(trailers);
                        self.inner = None;
                        return Poll::Ready(self.writer.close());
                    }
                    Poll::Ready(Ok(()))
                }
            },
        }
    }

    fn poll_next(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Bytes>, io::Error>>> {
        loop {
            if self.writer.has_output() {
                return Poll::Ready(Some(Ok(Frame::data(self.writer.take_output()))));
            }
            if self.inner.is_none() {
                return Poll::Ready(self.trailers.take().map(|t| Ok(Frame::trailers(t))));
            }

            match self.poll_fill(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(())) => continue,
                Poll::Ready(Err(err)) => {
                    // Headers are already on the wire; all that is left is to end the stream
                    self.abort();
                    self.error_handler.on_stream_error(&self.head, &err);
                    return Poll::Ready(Some(Err(err.into())));
                }
            }
        }
    }
}

impl<B> std::fmt::Debug for EncodedBody<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodedBody")
            .field("writer", &self.writer)
            .field("ended", &self.inner.is_none())
            .finish_non_exhaustive()
    }
}

impl<B> Body for CompressionBody<B>
where
    B: Body,
    B::Data: Buf,
    B::Error: Into<crate::BoxError>,
{
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.project() {
            CompressionBodyProj::Passthrough { inner } => match inner.poll_frame(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(None) => Poll::Ready(None),
                Poll::Ready(Some(Ok(frame))) => Poll::Ready(Some(Ok(
                    frame.map_data(|mut data| data.copy_to_bytes(data.remaining())),
                ))),
                Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(io::Error::other(e.into())))),
            },
            CompressionBodyProj::Encoded { state } => state.poll_next(cx),
            CompressionBodyProj::Replaced { body } => match body.poll_frame(cx) {
                Poll::Ready(Some(Err(never))) => match never {},
                Poll::Ready(Some(Ok(frame))) => Poll::Ready(Some(Ok(frame))),
                Poll::Ready(None) => Poll::Ready(None),
                Poll::Pending => Poll::Pending,
            },
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            CompressionBody::Passthrough { inner } => inner.is_end_stream(),
            CompressionBody::Encoded { state } => state.is_finished(),
            CompressionBody::Replaced { body } => body.is_end_stream(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match self {
            CompressionBody::Passthrough { inner } => inner.size_hint(),
            // Compressed size is unknown
            CompressionBody::Encoded { .. } => SizeHint::default(),
            CompressionBody::Replaced { body } => body.size_hint(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, DefaultErrorHandler, MinSize};
    use crate::negotiate::{Preference, accepted_compression, parse_encodings};
    use crate::pool::{PoolConfig, Pools};
    use crate::registry::CompressorRegistry;
    use crate::codec::CompressorProvider;
    use crate::testing::{Counters, FailAt, Failing, Verbatim};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use http::{HeaderValue, Method, Response, StatusCode, Uri, Version};
    use std::collections::VecDeque;

    /// A test body that yields predefined frames.
    struct TestBody {
        frames: VecDeque<Result<Frame<Bytes>, &'static str>>,
    }

    impl TestBody {
        fn new(frames: Vec<Result<Frame<Bytes>, &'static str>>) -> Self {
            Self {
                frames: frames.into(),
            }
        }
    }

    impl Body for TestBody {
        type Data = Bytes;
        type Error = &'static str;

        fn poll_frame(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
            Poll::Ready(self.frames.pop_front())
        }
    }

    fn poll_body<B: Body + Unpin>(body: &mut B) -> Option<Result<Frame<B::Data>, B::Error>> {
        let waker = std::task::Waker::noop();
        let mut cx = Context::from_waker(waker);
        match Pin::new(body).poll_frame(&mut cx) {
            Poll::Ready(result) => result,
            Poll::Pending => None,
        }
    }

    fn encoded(inner: TestBody) -> CompressionBody<TestBody> {
        encoded_with(inner, Verbatim, Arc::new(DefaultErrorHandler)).0
    }

    fn encoded_with<P: CompressorProvider>(
        inner: TestBody,
        provider: P,
        error_handler: Arc<dyn ErrorHandler>,
    ) -> (CompressionBody<TestBody>, Arc<Config>) {
        let registry = CompressorRegistry::builder()
            .register("x-verbatim", 0, provider)
            .build()
            .unwrap();
        let config = Arc::new(Config {
            pools: Pools::new(&registry, PoolConfig::default()),
            registry,
            min_size: MinSize::Fixed(4),
            preference: Preference::Server,
            filter: None,
            error_handler,
        });
        let accept = parse_encodings(&[HeaderValue::from_static("x-verbatim")]);
        let negotiated = accepted_compression(&accept, &config.registry, config.preference);
        let writer = CompressingWriter::new(
            Arc::clone(&config),
            negotiated,
            4,
            &Method::GET,
            StatusCode::OK,
            HeaderMap::new(),
        );
        let head = RequestHead {
            method: Method::GET,
            uri: Uri::from_static("/"),
            version: Version::HTTP_11,
        };
        let body = EncodedBody::new(inner, writer, head, config.error_handler.clone());
        (CompressionBody::encoded(body), config)
    }

    fn collect(body: &mut CompressionBody<TestBody>) -> (Vec<u8>, Option<HeaderMap>) {
        let mut data = Vec::new();
        let mut trailers = None;
        while let Some(frame) = poll_body(body) {
            let frame = frame.unwrap();
            match frame.into_data() {
                Ok(chunk) => data.extend_from_slice(&chunk),
                Err(frame) => trailers = frame.into_trailers().ok(),
            }
        }
        (data, trailers)
    }

    #[test]
    fn test_passthrough_data() {
        let inner = TestBody::new(vec![Ok(Frame::data(Bytes::from("hello world")))]);
        let mut body = CompressionBody::passthrough(inner);

        let frame = poll_body(&mut body).unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), Bytes::from("hello world"));
        assert!(poll_body(&mut body).is_none());
    }

    #[test]
    fn test_passthrough_error() {
        let inner = TestBody::new(vec![Err("boom")]);
        let mut body = CompressionBody::passthrough(inner);
        let err = poll_body(&mut body).unwrap().unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_encoded_data() {
        let inner = TestBody::new(vec![
            Ok(Frame::data(Bytes::from("hello"))),
            Ok(Frame::data(Bytes::from(" world"))),
        ]);
        let mut body = encoded(inner);
        let (data, trailers) = collect(&mut body);
        assert_eq!(data, b"[hello world]");
        assert!(trailers.is_none());
        assert!(body.is_end_stream());
    }

    #[test]
    fn test_encoded_short_body_passes_through() {
        let inner = TestBody::new(vec![Ok(Frame::data(Bytes::from("hi")))]);
        let mut body = encoded(inner);
        let (data, _) = collect(&mut body);
        assert_eq!(data, b"hi");
    }

    #[test]
    fn test_encoded_trailers_after_data() {
        let mut trailers = HeaderMap::new();
        trailers.insert("x-checksum", HeaderValue::from_static("abc123"));

        let inner = TestBody::new(vec![
            Ok(Frame::data(Bytes::from("hello world"))),
            Ok(Frame::trailers(trailers)),
        ]);
        let mut body = encoded(inner);
        let (data, trailers) = collect(&mut body);
        assert_eq!(data, b"[hello world]");
        assert_eq!(trailers.unwrap().get("x-checksum").unwrap(), "abc123");
    }

    #[test]
    fn test_encoded_inner_error_ends_stream() {
        let inner = TestBody::new(vec![Ok(Frame::data(Bytes::from("hello world"))), Err("reset")]);
        let mut body = encoded(inner);

        let first = poll_body(&mut body).unwrap().unwrap();
        assert_eq!(first.into_data().unwrap(), Bytes::from("[hello world"));
        let err = poll_body(&mut body).unwrap().unwrap_err();
        assert!(err.to_string().contains("reset"));
        assert!(poll_body(&mut body).is_none());
        assert!(body.is_end_stream());
    }

    /// Counts stream errors; replacement responses are never expected here.
    #[derive(Default)]
    struct CountingHandler {
        stream_errors: AtomicUsize,
    }

    impl ErrorHandler for CountingHandler {
        fn on_error(&self, _head: &RequestHead, error: &Error) -> Response<Bytes> {
            panic!("unexpected replacement after commit: {error}");
        }

        fn on_stream_error(&self, _head: &RequestHead, error: &Error) {
            assert!(matches!(error, Error::Encoder { .. }), "{error:?}");
            self.stream_errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_encoder_error_after_commit_ends_stream() {
        let provider = Failing::new(FailAt::Encode);
        let counters = Arc::clone(&provider.counters);
        let handler = Arc::new(CountingHandler::default());
        let inner = TestBody::new(vec![
            Ok(Frame::data(Bytes::from("hello world"))),
            Ok(Frame::data(Bytes::from(" and more"))),
        ]);
        let (mut body, config) = encoded_with(inner, provider, handler.clone());

        let first = poll_body(&mut body).unwrap().unwrap();
        assert_eq!(first.into_data().unwrap(), Bytes::from("[hello world"));

        let err = poll_body(&mut body).unwrap().unwrap_err();
        assert!(err.to_string().contains("disk full"), "{err}");
        assert_eq!(handler.stream_errors.load(Ordering::SeqCst), 1);
        assert!(poll_body(&mut body).is_none());
        assert!(body.is_end_stream());

        // The broken stream still hands its encoder back, reset.
        assert_eq!(Counters::get(&counters.reset), 1);
        assert_eq!(config.pools.encoders("x-verbatim").unwrap().idle(), 1);
    }

    #[test]
    fn test_encoder_finish_error_ends_stream() {
        let provider = Failing::new(FailAt::Finish);
        let counters = Arc::clone(&provider.counters);
        let handler = Arc::new(CountingHandler::default());
        let inner = TestBody::new(vec![Ok(Frame::data(Bytes::from("hello world")))]);
        let (mut body, config) = encoded_with(inner, provider, handler.clone());

        let first = poll_body(&mut body).unwrap().unwrap();
        assert_eq!(first.into_data().unwrap(), Bytes::from("[hello world"));

        let err = poll_body(&mut body).unwrap().unwrap_err();
        assert!(err.to_string().contains("disk full"), "{err}");
        assert_eq!(handler.stream_errors.load(Ordering::SeqCst), 1);
        assert!(poll_body(&mut body).is_none());

        assert_eq!(Counters::get(&counters.reset), 1);
        assert_eq!(config.pools.encoders("x-verbatim").unwrap().idle(), 1);
    }

    #[test]
    fn test_replaced_body() {
        let mut body: CompressionBody<TestBody> = CompressionBody::replaced(Bytes::from("oops"));
        assert_eq!(body.size_hint().exact(), Some(4));
        let frame = poll_body(&mut body).unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), Bytes::from("oops"));
    }
}
