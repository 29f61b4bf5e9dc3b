//! Resource version metadata extracted from HTTP response headers.
//!
//! A [`Metadata`] value captures the validators a server hands out
//! (`ETag`, `Last-Modified`) together with the total resource length
//! inferred from `Content-Range` or `Content-Length`. The reader takes a
//! snapshot at open time and compares every later response against it to
//! detect the resource changing mid-read.

use reqwest::header::{
    HeaderMap, HeaderValue, CONTENT_LENGTH, CONTENT_RANGE, ETAG, IF_MATCH, IF_UNMODIFIED_SINCE,
    LAST_MODIFIED,
};

/// Validators and inferred length of a remote resource version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    /// `ETag` header value, verbatim (including quotes).
    pub etag: Option<String>,
    /// `Last-Modified` header value, verbatim.
    pub last_modified: Option<String>,
    /// Total resource length in bytes, when a response declared one.
    pub length: Option<u64>,
}

impl Metadata {
    /// Extract metadata from response headers.
    ///
    /// The length is taken from the total component of `Content-Range`
    /// (the part after `/`) when that header is present; a partial
    /// response knows the full size even though `Content-Length` only
    /// covers the body. Responses without `Content-Range` use
    /// `Content-Length`.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header_str = |name| headers.get(name).and_then(|v: &HeaderValue| v.to_str().ok());

        // On a partial response Content-Length covers only the body, so the
        // Content-Range total is authoritative whenever the header is
        // present, even when its total is unknown (`*`).
        let length = match header_str(CONTENT_RANGE) {
            Some(v) => v
                .rsplit('/')
                .next()
                .and_then(|total| total.trim().parse::<u64>().ok()),
            None => header_str(CONTENT_LENGTH).and_then(|v| v.parse::<u64>().ok()),
        };

        Self {
            etag: header_str(ETAG).map(str::to_owned),
            last_modified: header_str(LAST_MODIFIED).map(str::to_owned),
            length,
        }
    }

    /// Add precondition headers to an outgoing request.
    ///
    /// Sets `If-Match` and `If-Unmodified-Since` rather than the
    /// revalidation pair (`If-None-Match`/`If-Modified-Since`): the point
    /// is to make the server fail the read with 412 when the resource has
    /// changed, not to revalidate a cached copy.
    pub fn apply_validators(&self, headers: &mut HeaderMap) {
        if let Some(v) = self.etag.as_deref().and_then(|e| HeaderValue::from_str(e).ok()) {
            headers.insert(IF_MATCH, v);
        }
        if let Some(v) = self
            .last_modified
            .as_deref()
            .and_then(|m| HeaderValue::from_str(m).ok())
        {
            headers.insert(IF_UNMODIFIED_SINCE, v);
        }
    }

    /// Whether two metadata values may describe the same resource version.
    ///
    /// A field absent on either side is permissive; only a field set on
    /// both sides with differing values makes the versions distinct.
    /// Lengths take part only when both are positive.
    pub fn equal(&self, other: &Metadata) -> bool {
        if let (Some(a), Some(b)) = (&self.etag, &other.etag) {
            if a != b {
                return false;
            }
        }
        if let (Some(a), Some(b)) = (&self.last_modified, &other.last_modified) {
            if a != b {
                return false;
            }
        }
        if let (Some(a), Some(b)) = (self.length, other.length) {
            if a > 0 && b > 0 && a != b {
                return false;
            }
        }
        true
    }

    /// Adopt any fields this snapshot lacks from `other`.
    ///
    /// Used when the open-time response omitted a validator that a later
    /// response supplies; fields already set are never overwritten.
    pub fn merge(&mut self, other: &Metadata) {
        if self.etag.is_none() {
            self.etag.clone_from(&other.etag);
        }
        if self.last_modified.is_none() {
            self.last_modified.clone_from(&other.last_modified);
        }
        if self.length.is_none() {
            self.length = other.length;
        }
    }
}
