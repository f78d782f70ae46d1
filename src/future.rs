use crate::body::{CompressionBody, EncodedBody};
use crate::config::{Config, RequestHead};
use crate::negotiate::Negotiated;
use crate::writer::{CompressingWriter, WriterState};
use bytes::{Buf, Bytes};
use http::{Response, response};
use http_body::Body;
use pin_project_lite::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

/// What the service learned from the request.
#[derive(Debug)]
pub(crate) struct RequestContext {
    pub(crate) config: Arc<Config>,
    pub(crate) negotiated: Negotiated,
    pub(crate) min_size: usize,
    pub(crate) head: RequestHead,
}

pin_project! {
    /// Future for compression service responses.
    ///
    /// Resolves once the response headers are final: immediately when the
    /// decision can be made from the headers alone, otherwise after enough
    /// of the body has been buffered.
    pub struct ResponseFuture<F, B> {
        #[pin]
        kind: Kind<F, B>,
    }
}

pin_project! {
    #[project = KindProj]
    enum Kind<F, B> {
        // No compressor registered; responses are forwarded as is.
        Noop {
            #[pin]
            inner: F,
        },
        // Answered by the error handler without calling the inner service.
        Failed {
            response: Option<Response<Bytes>>,
        },
        Waiting {
            #[pin]
            inner: F,
            request: Option<RequestContext>,
        },
        Buffering {
            parts: Option<response::Parts>,
            body: Option<EncodedBody<B>>,
        },
    }
}

impl<F, B> ResponseFuture<F, B> {
    pub(crate) fn noop(inner: F) -> Self {
        Self {
            kind: Kind::Noop { inner },
        }
    }

    pub(crate) fn failed(response: Response<Bytes>) -> Self {
        Self {
            kind: Kind::Failed {
                response: Some(response),
            },
        }
    }

    pub(crate) fn new(inner: F, request: RequestContext) -> Self {
        Self {
            kind: Kind::Waiting {
                inner,
                request: Some(request),
            },
        }
    }
}

impl<F, B, E> Future for ResponseFuture<F, B>
where
    F: Future<Output = Result<Response<B>, E>>,
    B: Body,
    B::Data: Buf,
    B::Error: Into<crate::BoxError>,
{
    type Output = Result<Response<CompressionBody<B>>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();

        loop {
            match this.kind.as_mut().project() {
                KindProj::Noop { inner } => {
                    let response = ready!(inner.poll(cx))?;
                    return Poll::Ready(Ok(response.map(CompressionBody::passthrough)));
                }
                KindProj::Failed { response } => {
                    let response = response.take().expect("polled after completion");
                    return Poll::Ready(Ok(replaced(response)));
                }
                KindProj::Waiting { inner, request } => {
                    let response = ready!(inner.poll(cx))?;
                    let request = request.take().expect("polled after completion");
                    match start(response, request) {
                        Start::Ready(response) => return Poll::Ready(Ok(response)),
                        Start::Buffer(parts, body) => this.kind.set(Kind::Buffering {
                            parts: Some(parts),
                            body: Some(body),
                        }),
                    }
                }
                KindProj::Buffering { parts, body } => {
                    let state = body.as_mut().expect("polled after completion");
                    while !state.writer().is_committed() {
                        if let Err(err) = ready!(state.poll_fill(cx)) {
                            // Nothing has been sent yet, so the response can still be replaced
                            state.abort();
                            let response = state.on_error(&err);
                            body.take();
                            return Poll::Ready(Ok(replaced(response)));
                        }
                    }

                    let mut parts = parts.take().expect("polled after completion");
                    let mut state = body.take().expect("polled after completion");
                    if let Some(headers) = state.writer_mut().take_headers() {
                        parts.headers = headers;
                    }
                    return Poll::Ready(Ok(Response::from_parts(parts, CompressionBody::encoded(state))));
                }
            }
        }
    }
}

enum Start<B> {
    Ready(Response<CompressionBody<B>>),
    Buffer(response::Parts, EncodedBody<B>),
}

/// Makes the header-time decision for a response fresh from the inner service.
fn start<B>(response: Response<B>, request: RequestContext) -> Start<B> {
    let RequestContext {
        config,
        negotiated,
        min_size,
        head,
    } = request;
    let (mut parts, body) = response.into_parts();
    let headers = std::mem::take(&mut parts.headers);
    let error_handler = Arc::clone(&config.error_handler);

    let mut writer = CompressingWriter::new(config, negotiated, min_size, &head.method, parts.status, headers);
    if let Err(err) = writer.flush() {
        writer.abort();
        return Start::Ready(replaced(error_handler.on_error(&head, &err)));
    }

    match writer.state() {
        WriterState::Passthrough if !writer.has_output() => {
            if let Some(headers) = writer.take_headers() {
                parts.headers = headers;
            }
            Start::Ready(Response::from_parts(parts, CompressionBody::passthrough(body)))
        }
        WriterState::Buffering => Start::Buffer(parts, EncodedBody::new(body, writer, head, error_handler)),
        _ => {
            if let Some(headers) = writer.take_headers() {
                parts.headers = headers;
            }
            let state = EncodedBody::new(body, writer, head, error_handler);
            Start::Ready(Response::from_parts(parts, CompressionBody::encoded(state)))
        }
    }
}

fn replaced<B>(response: Response<Bytes>) -> Response<CompressionBody<B>> {
    response.map(CompressionBody::replaced)
}
