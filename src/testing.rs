//! Providers used by the unit tests.

use crate::codec::{CompressorProvider, Encoder};
use bytes::BytesMut;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Provider whose encoder copies input verbatim between `[` and `]` markers.
pub(crate) struct Verbatim;

impl CompressorProvider for Verbatim {
    fn encoder(&self) -> io::Result<Box<dyn Encoder>> {
        Ok(Box::new(VerbatimEncoder::default()))
    }
}

#[derive(Default)]
struct VerbatimEncoder {
    started: bool,
    counters: Option<Arc<Counters>>,
}

impl Encoder for VerbatimEncoder {
    fn encode(&mut self, input: &[u8], sink: &mut BytesMut) -> io::Result<()> {
        if !self.started {
            sink.extend_from_slice(b"[");
            self.started = true;
        }
        sink.extend_from_slice(input);
        Ok(())
    }

    fn flush(&mut self, _sink: &mut BytesMut) -> io::Result<()> {
        if let Some(counters) = &self.counters {
            counters.flushed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn finish(&mut self, sink: &mut BytesMut) -> io::Result<()> {
        if !self.started {
            sink.extend_from_slice(b"[");
        }
        sink.extend_from_slice(b"]");
        self.started = false;
        if let Some(counters) = &self.counters {
            counters.finished.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn reset(&mut self) -> io::Result<()> {
        self.started = false;
        if let Some(counters) = &self.counters {
            counters.reset.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Lifecycle counters shared by every encoder of a [`Tracked`] provider.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) created: AtomicUsize,
    pub(crate) flushed: AtomicUsize,
    pub(crate) finished: AtomicUsize,
    pub(crate) reset: AtomicUsize,
}

impl Counters {
    pub(crate) fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// [`Verbatim`] provider that records encoder lifecycle events.
#[derive(Clone, Default)]
pub(crate) struct Tracked(pub(crate) Arc<Counters>);

impl CompressorProvider for Tracked {
    fn encoder(&self) -> io::Result<Box<dyn Encoder>> {
        self.0.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(VerbatimEncoder {
            started: false,
            counters: Some(Arc::clone(&self.0)),
        }))
    }
}

/// Provider that cannot create encoders.
pub(crate) struct Broken;

impl CompressorProvider for Broken {
    fn encoder(&self) -> io::Result<Box<dyn Encoder>> {
        Err(io::Error::other("backend unavailable"))
    }
}

/// Step at which a [`Failing`] encoder breaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailAt {
    /// The second `encode` call fails; the first one succeeds.
    Encode,
    /// `finish` fails.
    Finish,
}

/// [`Verbatim`] provider whose encoders hit an I/O error mid-stream.
#[derive(Clone)]
pub(crate) struct Failing {
    pub(crate) at: FailAt,
    pub(crate) counters: Arc<Counters>,
}

impl Failing {
    pub(crate) fn new(at: FailAt) -> Self {
        Self {
            at,
            counters: Arc::default(),
        }
    }
}

impl CompressorProvider for Failing {
    fn encoder(&self) -> io::Result<Box<dyn Encoder>> {
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FailingEncoder {
            at: self.at,
            encodes: 0,
            inner: VerbatimEncoder::default(),
            counters: Arc::clone(&self.counters),
        }))
    }
}

struct FailingEncoder {
    at: FailAt,
    encodes: usize,
    inner: VerbatimEncoder,
    counters: Arc<Counters>,
}

impl Encoder for FailingEncoder {
    fn encode(&mut self, input: &[u8], sink: &mut BytesMut) -> io::Result<()> {
        self.encodes += 1;
        if self.at == FailAt::Encode && self.encodes > 1 {
            return Err(io::Error::other("disk full"));
        }
        self.inner.encode(input, sink)
    }

    fn flush(&mut self, sink: &mut BytesMut) -> io::Result<()> {
        self.inner.flush(sink)
    }

    fn finish(&mut self, sink: &mut BytesMut) -> io::Result<()> {
        self.counters.finished.fetch_add(1, Ordering::SeqCst);
        if self.at == FailAt::Finish {
            return Err(io::Error::other("disk full"));
        }
        self.inner.finish(sink)
    }

    fn reset(&mut self) -> io::Result<()> {
        self.counters.reset.fetch_add(1, Ordering::SeqCst);
        self.encodes = 0;
        self.inner.reset()
    }
}
