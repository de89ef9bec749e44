use std::time::Duration;

use serde::{ser, Serialize, Serializer};

use crate::error::Result;

/// Serializes a `Result` by serializing the error variant as its display string. Used for
/// embedding monitoring errors in serialized server descriptions.
pub(crate) fn serialize_result_error_as_string<S: Serializer, T: Serialize>(
    result: &Result<T>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    result
        .as_ref()
        .map_err(|e| e.to_string())
        .serialize(serializer)
}

/// Serializes a `Duration` as the integer number of milliseconds, the form the server expects
/// for `maxTimeMS` style fields.
pub(crate) fn serialize_duration_option_as_int_millis<S: Serializer>(
    val: &Option<Duration>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match val {
        Some(duration) => {
            let millis = i64::try_from(duration.as_millis()).map_err(ser::Error::custom)?;
            serializer.serialize_i64(millis)
        }
        None => serializer.serialize_none(),
    }
}

/// Serializes a `Duration` as the integer number of seconds.
pub(crate) fn serialize_duration_option_as_int_secs<S: Serializer>(
    val: &Option<Duration>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match val {
        Some(duration) => {
            let secs = i64::try_from(duration.as_secs()).map_err(ser::Error::custom)?;
            serializer.serialize_i64(secs)
        }
        None => serializer.serialize_none(),
    }
}
