//! Contains all of the types needed to specify options to the driver core.

pub use crate::{
    client::{
        auth::{AuthMechanism, Credential},
        options::*,
    },
    compression::compressors::Compressor,
    concern::*,
    operation::find::{CursorType, FindOptions},
    selection_criteria::*,
};
