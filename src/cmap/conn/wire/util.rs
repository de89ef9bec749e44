use std::sync::atomic::{AtomicI32, Ordering};

/// Returns a new, unique request ID.
pub(crate) fn next_request_id() -> i32 {
    static REQUEST_ID: AtomicI32 = AtomicI32::new(0);
    REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

/// Serializes `string` to UTF-8 bytes with a null terminator appended, the wire protocol's
/// cstring form.
pub(crate) fn write_cstring(buf: &mut Vec<u8>, string: &str) {
    buf.extend_from_slice(string.as_bytes());
    buf.push(0);
}

/// Parses a null-terminated UTF-8 string from the front of `bytes`, returning it along with the
/// remainder.
pub(crate) fn parse_cstring(bytes: &[u8]) -> Option<(&str, &[u8])> {
    let nul = bytes.iter().position(|b| *b == 0)?;
    let s = std::str::from_utf8(&bytes[..nul]).ok()?;
    Some((s, &bytes[nul + 1..]))
}
