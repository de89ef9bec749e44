#[cfg(any(
    feature = "zstd-compression",
    feature = "zlib-compression",
    feature = "snappy-compression"
))]
pub(crate) mod compress;
pub(crate) mod compressors;
pub(crate) mod decompress;

pub(crate) const NOOP_COMPRESSOR_ID: u8 = 0;
#[cfg(feature = "snappy-compression")]
pub(crate) const SNAPPY_COMPRESSOR_ID: u8 = 1;
#[cfg(feature = "zlib-compression")]
pub(crate) const ZLIB_COMPRESSOR_ID: u8 = 2;
#[cfg(feature = "zstd-compression")]
pub(crate) const ZSTD_COMPRESSOR_ID: u8 = 3;

/// Commands that may carry credentials or negotiate them; these are never compressed.
pub(crate) const UNCOMPRESSIBLE_COMMANDS: &[&str] = &[
    "hello",
    "isMaster",
    "ismaster",
    "saslStart",
    "saslContinue",
    "getnonce",
    "authenticate",
    "createUser",
    "updateUser",
    "copydbSaslStart",
    "copydbgetnonce",
    "copydb",
];

pub(crate) fn command_supports_compression(command_name: &str) -> bool {
    !UNCOMPRESSIBLE_COMMANDS.contains(&command_name)
}

#[cfg(test)]
mod test {
    use super::command_supports_compression;

    #[test]
    fn sensitive_commands_are_never_compressed() {
        assert!(!command_supports_compression("hello"));
        assert!(!command_supports_compression("saslContinue"));
        assert!(!command_supports_compression("authenticate"));
        assert!(command_supports_compression("find"));
        assert!(command_supports_compression("insert"));
    }
}
