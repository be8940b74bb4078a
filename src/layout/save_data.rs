use super::codec::{DecodeError, Decoder, EncodeError, Encoder};

/// The encoded size of [IndexSaveData].
pub const SAVE_DATA_SIZE: usize = 24;
/// The save data version written by the system.
pub const SAVE_DATA_VERSION: u32 = 1;

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
/// Identifies and authenticates the contents of a save slot.
pub struct IndexSaveData {
    /// When the save was made, in milliseconds since the unix epoch.
    ///
    /// A timestamp of `0` marks a slot which has never been saved.
    pub timestamp: u64,
    /// The save nonce binding the save to its slot and sub-index.
    pub nonce: u64,
    pub version: u32,
}

impl IndexSaveData {
    /// Returns a copy of the data with the nonce cleared, as used
    /// as the input to the save nonce derivation.
    pub fn without_nonce(&self) -> Self {
        Self { nonce: 0, ..*self }
    }
}

/// Decode [IndexSaveData] from a buffer of exactly [SAVE_DATA_SIZE] bytes.
pub fn decode_save_data(buffer: &[u8]) -> Result<IndexSaveData, DecodeError> {
    let mut decoder = Decoder::new(buffer);
    let timestamp = decoder.u64()?;
    let nonce = decoder.u64()?;
    let version = decoder.u32()?;
    decoder.padding(4, "save data")?;
    decoder.finish()?;

    Ok(IndexSaveData {
        timestamp,
        nonce,
        version,
    })
}

/// Encode [IndexSaveData] onto the end of `buffer`.
pub fn encode_save_data(
    data: &IndexSaveData,
    buffer: &mut Vec<u8>,
) -> Result<(), EncodeError> {
    let mut encoder = Encoder::new(buffer);
    encoder.u64(data.timestamp);
    encoder.u64(data.nonce);
    encoder.u32(data.version);
    encoder.padding(4);
    encoder.finish(SAVE_DATA_SIZE)
}
