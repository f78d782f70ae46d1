//! `Accept-Encoding` parsing and encoding selection.

use crate::registry::{CompressorRegistry, RegisteredCompressor, is_token_byte};
use http::HeaderValue;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Whose ranking decides between encodings both sides accept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Preference {
    /// Order by server priority; client quality only gates inclusion.
    #[default]
    Server,
    /// Order by client quality, breaking ties by server priority.
    Client,
}

/// Codings accepted by a client, keyed by lowercase name.
///
/// Ordered so that every iteration, and therefore every negotiation, is
/// reproducible.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Codings(BTreeMap<String, f32>);

impl Codings {
    /// Returns the quality explicitly listed for `name`.
    pub fn get(&self, name: &str) -> Option<f32> {
        self.0.get(name).copied()
    }

    /// Returns the quality `name` gets from the header, including the `*` wildcard.
    pub fn effective_quality(&self, name: &str) -> f32 {
        self.get(name)
            .or_else(|| self.get("*"))
            .unwrap_or(0.0)
    }

    /// Returns true when the header listed no coding at all.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of distinct codings listed.
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Parses every `Accept-Encoding` header occurrence into a coding map.
///
/// Malformed tokens are skipped individually; the rest of the header is
/// still honored. A value that is not visible ASCII is skipped as a whole.
/// When a coding is listed more than once the last occurrence wins.
/// `x-gzip` and `brotli` are read as `gzip` and `br`.
pub fn parse_encodings<'a, I>(values: I) -> Codings
where
    I: IntoIterator<Item = &'a HeaderValue>,
{
    let mut codings = BTreeMap::new();
    for value in values {
        let Ok(value) = value.to_str() else {
            tracing::trace!("skipping non-ascii Accept-Encoding value");
            continue;
        };
        for part in value.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match parse_coding(part) {
                Some((name, quality)) => {
                    codings.insert(name, quality);
                }
                None => tracing::trace!(token = part, "skipping malformed Accept-Encoding token"),
            }
        }
    }
    Codings(codings)
}

/// Parses an entry like "gzip" or "br;q=0.8" into (encoding, quality).
fn parse_coding(s: &str) -> Option<(String, f32)> {
    let mut parts = s.split(';');
    let encoding = parts.next().unwrap_or("").trim();
    if encoding.is_empty() || !encoding.bytes().all(is_token_byte) {
        return None;
    }

    let mut quality = 1.0;
    for param in parts {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        if key.trim().eq_ignore_ascii_case("q") {
            let q = value.trim().parse::<f32>().ok().filter(|q| q.is_finite())?;
            quality = q.clamp(0.0, 1.0);
        }
    }

    let mut encoding = encoding.to_ascii_lowercase();
    if let Some(canonical) = canonical_name(&encoding) {
        encoding = canonical.to_owned();
    }
    Some((encoding, quality))
}

/// Maps legacy coding names some clients still send to their registered names.
fn canonical_name(encoding: &str) -> Option<&'static str> {
    match encoding {
        "x-gzip" => Some("gzip"),
        "brotli" => Some("br"),
        _ => None,
    }
}

/// Encodings acceptable to both client and server, best first.
///
/// An empty list selects passthrough.
#[derive(Debug, Clone, Default)]
pub struct Negotiated {
    candidates: Vec<RegisteredCompressor>,
}

impl Negotiated {
    /// Returns the chosen compressor, if any.
    pub fn chosen(&self) -> Option<&RegisteredCompressor> {
        self.candidates.first()
    }

    /// Returns the candidate names in preference order.
    pub fn names(&self) -> Vec<Arc<str>> {
        self.candidates.iter().map(|c| c.shared_name()).collect()
    }

    /// Returns the candidates in preference order.
    pub fn candidates(&self) -> &[RegisteredCompressor] {
        &self.candidates
    }

    /// Returns true when no compression will be applied.
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

/// Computes the candidate encodings acceptable to both sides.
///
/// A registered encoding qualifies when its explicit quality is positive, or
/// when it is unlisted and the `*` wildcard has positive quality. An explicit
/// `q=0` always excludes. Ties fall back to server priority and then name,
/// so the outcome never depends on map iteration order.
pub fn accepted_compression(
    accept: &Codings,
    registry: &CompressorRegistry,
    preference: Preference,
) -> Negotiated {
    let mut candidates: Vec<(f32, &RegisteredCompressor)> = registry
        .iter()
        .map(|c| (accept.effective_quality(c.name()), c))
        .filter(|(q, _)| *q > 0.0)
        .collect();

    let by_priority = |a: &RegisteredCompressor, b: &RegisteredCompressor| {
        b.priority()
            .cmp(&a.priority())
            .then_with(|| a.name().cmp(b.name()))
    };

    match preference {
        Preference::Server => candidates.sort_by(|(_, a), (_, b)| by_priority(a, b)),
        Preference::Client => candidates.sort_by(|(qa, a), (qb, b)| {
            qb.partial_cmp(qa)
                .unwrap_or(Ordering::Equal)
                .then_with(|| by_priority(a, b))
        }),
    }

    Negotiated {
        candidates: candidates.into_iter().map(|(_, c)| c.clone()).collect(),
    }
}
