//! Trailer discovery: the byte sequence a stream uses to separate records is
//! not assumed up front. It is discovered once, from the first block read off
//! a connection or file, and then held fixed for the rest of that stream.

use bytes::Bytes;

use crate::RawRecord;

/// Falls back to a bare newline when no discovery callable is configured or
/// the callable declines to name a trailer.
pub const DEFAULT_TRAILER: &[u8] = b"\n";

/// A user-supplied callable that inspects a best-effort parse of the first
/// block on a stream and may name the trailer that stream actually uses
/// (some senders terminate records with `\r\n`, `\0`, or a structured-data
/// hint rather than `\n`).
pub type DiscoveryFn = dyn Fn(&RawRecord) -> Option<Bytes> + Send + Sync;

/// Determines the trailer for a stream given its first block.
///
/// When `discovery` is provided, it is consulted first; a `None` or empty
/// result falls through to [`DEFAULT_TRAILER`].
pub fn discover_trailer(first_block: &[u8], discovery: Option<&DiscoveryFn>) -> Bytes {
    if let Some(discovery) = discovery {
        let raw = crate::parse_raw(first_block);
        if let Some(trailer) = discovery(&raw) {
            if !trailer.is_empty() {
                return trailer;
            }
        }
    }
    Bytes::from_static(DEFAULT_TRAILER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_default_without_discovery() {
        let trailer = discover_trailer(b"<34>1 2023-10-11T22:14:15Z h a p m - detail", None);
        assert_eq!(trailer.as_ref(), DEFAULT_TRAILER);
    }

    #[test]
    fn uses_discovery_result_when_present() {
        let discovery: &DiscoveryFn = &|raw: &RawRecord| {
            if raw.hostname.as_deref() == Some("h") {
                Some(Bytes::from_static(b"\r\n"))
            } else {
                None
            }
        };
        let trailer = discover_trailer(
            b"<34>1 2023-10-11T22:14:15Z h a p m - detail",
            Some(discovery),
        );
        assert_eq!(trailer.as_ref(), b"\r\n");
    }

    #[test]
    fn empty_discovery_result_falls_back_to_default() {
        let discovery: &DiscoveryFn = &|_raw: &RawRecord| Some(Bytes::new());
        let trailer = discover_trailer(
            b"<34>1 2023-10-11T22:14:15Z h a p m - detail",
            Some(discovery),
        );
        assert_eq!(trailer.as_ref(), DEFAULT_TRAILER);
    }
}
