use crate::error::Error;
use crate::server::range::{content_range, parse_range, unsatisfiable_range};
use crate::store::ByteRange;

#[test]
fn test_closed_interval() {
    assert_eq!(parse_range("bytes=0-0", 10).unwrap(), Some(ByteRange::new(0, 0)));
    assert_eq!(parse_range("bytes=2-5", 10).unwrap(), Some(ByteRange::new(2, 5)));
}

#[test]
fn test_full_range_collapses_to_none() {
    assert_eq!(parse_range("bytes=0-9", 10).unwrap(), None);
    assert_eq!(parse_range("bytes=0-", 10).unwrap(), None);
}

#[test]
fn test_open_end_and_clamping() {
    assert_eq!(parse_range("bytes=4-", 10).unwrap(), Some(ByteRange::new(4, 9)));
    assert_eq!(parse_range("bytes=4-999", 10).unwrap(), Some(ByteRange::new(4, 9)));
}

#[test]
fn test_suffix_form() {
    assert_eq!(parse_range("bytes=-3", 10).unwrap(), Some(ByteRange::new(7, 9)));
    // suffix longer than the object selects the whole object
    assert_eq!(parse_range("bytes=-10", 10).unwrap(), None);
    assert_eq!(parse_range("bytes=-999", 10).unwrap(), None);
}

#[test]
fn test_unsatisfiable() {
    assert!(matches!(
        parse_range("bytes=10-12", 10),
        Err(Error::RangeNotSatisfiable { size: 10 })
    ));
    assert!(matches!(parse_range("bytes=0-0", 0), Err(Error::RangeNotSatisfiable { .. })));
    assert!(matches!(parse_range("bytes=-0", 10), Err(Error::RangeNotSatisfiable { .. })));
}

#[test]
fn test_malformed() {
    assert!(matches!(parse_range("items=0-1", 10), Err(Error::BadRequest(_))));
    assert!(matches!(parse_range("bytes=a-b", 10), Err(Error::BadRequest(_))));
    assert!(matches!(parse_range("bytes=5-2", 10), Err(Error::BadRequest(_))));
    assert!(matches!(parse_range("bytes=0-1,3-4", 10), Err(Error::BadRequest(_))));
}

#[test]
fn test_header_rendering() {
    assert_eq!(content_range(&ByteRange::new(0, 0), 14), "bytes 0-0/14");
    assert_eq!(unsatisfiable_range(14), "bytes */14");
    assert_eq!(ByteRange::new(0, 65535).to_header(), "bytes=0-65535");
    assert_eq!(ByteRange::new(2, 5).len(), 4);
}
