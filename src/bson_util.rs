use std::convert::TryFrom;

use crate::{
    bson::{Bson, Document},
    error::{ErrorKind, Result},
};

/// Coerce numeric types into an `i64` if it would be lossless to do so.
pub(crate) fn get_int(val: &Bson) -> Option<i64> {
    match *val {
        Bson::Int32(i) => Some(i64::from(i)),
        Bson::Int64(i) => Some(i),
        Bson::Double(f) if (f - (f as i64 as f64)).abs() <= f64::EPSILON => Some(f as i64),
        _ => None,
    }
}

/// Returns the name of the first key in the document, which by convention is the name of the
/// command it encodes.
pub(crate) fn first_key(document: &Document) -> Option<&str> {
    document.keys().next().map(String::as_str)
}

/// Serialize the document to raw BSON bytes.
pub(crate) fn document_to_vec(document: &Document) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    document.to_writer(&mut out)?;
    Ok(out)
}

/// The wire-level size of the document in bytes, without serializing it in full.
pub(crate) fn doc_size_bytes(document: &Document) -> Result<u64> {
    let bytes = document_to_vec(document)?;
    Ok(bytes.len() as u64)
}

/// Read a little-endian i32 length prefix from the front of a BSON byte slice.
pub(crate) fn read_document_length(bytes: &[u8]) -> Result<i32> {
    let arr = <[u8; 4]>::try_from(bytes.get(0..4).ok_or_else(|| ErrorKind::InvalidResponse {
        message: "BSON document shorter than its length prefix".to_string(),
    })?)
    .map_err(|_| ErrorKind::InvalidResponse {
        message: "BSON document shorter than its length prefix".to_string(),
    })?;
    Ok(i32::from_le_bytes(arr))
}

#[cfg(test)]
mod test {
    use crate::bson::{bson, doc};

    use super::*;

    #[test]
    fn get_int_coerces_lossless_values() {
        assert_eq!(get_int(&bson!(1_i32)), Some(1));
        assert_eq!(get_int(&bson!(1_i64)), Some(1));
        assert_eq!(get_int(&bson!(1.0)), Some(1));
        assert_eq!(get_int(&bson!(1.5)), None);
        assert_eq!(get_int(&bson!("1")), None);
    }

    #[test]
    fn document_length_prefix_round_trips() {
        let doc = doc! { "ping": 1 };
        let bytes = document_to_vec(&doc).unwrap();
        assert_eq!(read_document_length(&bytes).unwrap() as usize, bytes.len());
    }

    #[test]
    fn first_key_is_command_name() {
        assert_eq!(first_key(&doc! { "find": "coll", "filter": {} }), Some("find"));
        assert_eq!(first_key(&doc! {}), None);
    }
}
