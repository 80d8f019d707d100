//! HTTP `Range` header parsing for ranged content reads.

use crate::error::{Error, Result};
use crate::store::ByteRange;

/// Parses a `Range` header against an object of `size` bytes.
///
/// Supports a single `bytes=a-b` (closed interval), `bytes=a-` (open
/// end) or `bytes=-N` (suffix) form. Returns `None` when the range
/// covers the whole object from byte zero, so callers can fall back to
/// a plain 200.
///
/// A suffix longer than the object selects the whole object. A start at
/// or past the end is unsatisfiable.
pub fn parse_range(header: &str, size: u64) -> Result<Option<ByteRange>> {
    let value = header
        .strip_prefix("bytes=")
        .ok_or_else(|| Error::BadRequest(format!("unsupported range unit: {header}")))?
        .trim();
    if value.contains(',') {
        return Err(Error::BadRequest("multiple ranges are not supported".into()));
    }
    let (start, end) = value
        .split_once('-')
        .ok_or_else(|| Error::BadRequest(format!("malformed range: {header}")))?;

    if start.is_empty() {
        // suffix form: the last N bytes
        let n: u64 = parse_bound(end, header)?;
        if n == 0 {
            return Err(Error::RangeNotSatisfiable { size });
        }
        if n >= size {
            return Ok(None);
        }
        return Ok(Some(ByteRange::new(size - n, size - 1)));
    }

    let start: u64 = parse_bound(start, header)?;
    if start >= size {
        return Err(Error::RangeNotSatisfiable { size });
    }
    let end = if end.is_empty() {
        size - 1
    } else {
        let end: u64 = parse_bound(end, header)?;
        if end < start {
            return Err(Error::BadRequest(format!("inverted range: {header}")));
        }
        end.min(size - 1)
    };
    if start == 0 && end == size - 1 {
        return Ok(None);
    }
    Ok(Some(ByteRange::new(start, end)))
}

fn parse_bound(raw: &str, header: &str) -> Result<u64> {
    raw.trim()
        .parse()
        .map_err(|_| Error::BadRequest(format!("malformed range: {header}")))
}

/// `Content-Range` value for a 206 response.
pub fn content_range(range: &ByteRange, size: u64) -> String {
    format!("bytes {}-{}/{}", range.start, range.end, size)
}

/// `Content-Range` value for a 416 response.
pub fn unsatisfiable_range(size: u64) -> String {
    format!("bytes */{size}")
}
