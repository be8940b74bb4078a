//! The stored configuration record.
//!
//! The record occupies the config region and has the following layout:
//!
//! - Magic bytes (16 bytes)
//! - CRC32 check bytes over the length prefix and body (4 bytes)
//! - Body length prefix (4 bytes)
//! - JSON body, zero filled up to the end of the buffer.

use super::integrity;

/// The magic bytes prefix of config records.
static MAGIC_BYTES: &[u8] = b"__LNX_IDXCONFIG_";
/// The number of bytes preceding the record body.
pub const RECORD_HEADER_SIZE: usize = 24;

/// Checks if the provided buffer starts with the config [MAGIC_BYTES].
fn has_magic_bytes(buffer: &[u8]) -> bool {
    if buffer.len() < MAGIC_BYTES.len() {
        false
    } else {
        &buffer[..MAGIC_BYTES.len()] == MAGIC_BYTES
    }
}

#[derive(Debug, thiserror::Error)]
/// An error that prevented the config record from being decoded.
pub enum DecodeError {
    #[error("buffer missing magic bytes prefix")]
    /// The buffer is missing the magic bytes at the start of the buffer.
    MissingMagicBytes,
    #[error("buffer missing check bytes")]
    /// The buffer is too short to hold the record header.
    MissingCheckBytes,
    #[error("record length {0} exceeds buffer")]
    /// The length prefix points beyond the end of the buffer.
    InvalidLength(usize),
    #[error("record verification failed")]
    /// The check bytes do not match the record body.
    VerificationFailed,
    #[error("deserialize error: {0}")]
    /// The record body could not be deserialized.
    Deserialize(serde_json::Error),
}

/// Decode a config record from the provided buffer.
pub fn decode_config_record<T: serde::de::DeserializeOwned>(
    associated_data: &[u8],
    buffer: &[u8],
) -> Result<T, DecodeError> {
    if !has_magic_bytes(buffer) {
        return Err(DecodeError::MissingMagicBytes);
    }
    if buffer.len() < RECORD_HEADER_SIZE {
        return Err(DecodeError::MissingCheckBytes);
    }

    let context = &buffer[MAGIC_BYTES.len()..][..integrity::CHECK_BYTES_LEN];
    let body = &buffer[MAGIC_BYTES.len() + integrity::CHECK_BYTES_LEN..];

    let body_len = u32::from_le_bytes(body[..size_of::<u32>()].try_into().unwrap()) as usize;
    let Some(record) = body.get(..size_of::<u32>() + body_len) else {
        return Err(DecodeError::InvalidLength(body_len));
    };

    if !integrity::verify(associated_data, record, context) {
        return Err(DecodeError::VerificationFailed);
    }

    serde_json::from_slice(&record[size_of::<u32>()..]).map_err(DecodeError::Deserialize)
}

#[derive(Debug, thiserror::Error)]
/// An error that prevented the config record from being encoded.
pub enum EncodeError {
    #[error("buffer too small")]
    /// The serialized record does not fit in the provided buffer.
    BufferTooSmall,
    #[error("serialize error: {0}")]
    /// The record could not be serialized.
    Serialize(serde_json::Error),
}

/// Encode the record into the given buffer, zero filling any unused space.
pub fn encode_config_record<T: serde::Serialize>(
    associated_data: &[u8],
    record: &T,
    buffer: &mut [u8],
) -> Result<(), EncodeError> {
    let data = serde_json::to_vec(record).map_err(EncodeError::Serialize)?;
    if RECORD_HEADER_SIZE + data.len() > buffer.len() {
        return Err(EncodeError::BufferTooSmall);
    }

    buffer.fill(0);
    buffer[..MAGIC_BYTES.len()].copy_from_slice(MAGIC_BYTES);

    let (context, body) =
        buffer[MAGIC_BYTES.len()..].split_at_mut(integrity::CHECK_BYTES_LEN);
    body[..size_of::<u32>()].copy_from_slice(&(data.len() as u32).to_le_bytes());
    body[size_of::<u32>()..][..data.len()].copy_from_slice(&data);

    integrity::write_check_bytes(
        associated_data,
        &body[..size_of::<u32>() + data.len()],
        context,
    );

    Ok(())
}
