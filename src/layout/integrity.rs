//! Attach CRC32 check bytes to a buffer and verify those bytes when
//! decoding a buffer.
//!
//! The associated data is mixed into the checksum but not stored, which
//! ties a record to where it was written.

/// The number of check bytes written by [write_check_bytes].
pub const CHECK_BYTES_LEN: usize = 4;

/// Compute the CRC32 checksum of a buffer.
pub fn checksum(buffer: &[u8]) -> u32 {
    crc32_hash_components(&[], buffer)
}

/// Verify the check bytes at the start of `context` match the buffer.
///
/// Returns `false` if the checksums did not match.
pub fn verify(associated_data: &[u8], buffer: &[u8], context: &[u8]) -> bool {
    if context.len() < CHECK_BYTES_LEN {
        return false;
    }

    let expected_checksum =
        u32::from_le_bytes(context[..CHECK_BYTES_LEN].try_into().unwrap());
    let actual_checksum = crc32_hash_components(associated_data, buffer);
    actual_checksum == expected_checksum
}

/// Prefix the given context buffer with the CRC32 check bytes
/// of the associated data and input buffer.
pub fn write_check_bytes(associated_data: &[u8], input_buffer: &[u8], context: &mut [u8]) {
    let result = crc32_hash_components(associated_data, input_buffer);
    context[..CHECK_BYTES_LEN].copy_from_slice(&result.to_le_bytes());
}

fn crc32_hash_components(associated_data: &[u8], buffer: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(associated_data);
    hasher.update(buffer);
    hasher.finalize()
}
