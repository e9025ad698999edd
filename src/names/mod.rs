pub mod metrics;
pub mod slices;

/// IEEE CRC32 of the UTF-8 bytes, widened to fit the BIGINT columns of the
/// names tables. An acceleration index only: lookups always pair it with
/// the string column, so collisions fall through to string comparison.
pub(crate) fn name_crc32(value: &str) -> i64 {
    i64::from(crc32fast::hash(value.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_the_ieee_reference_value() {
        assert_eq!(name_crc32("123456789"), 0xCBF4_3926);
        assert_eq!(name_crc32(""), 0);
    }
}
