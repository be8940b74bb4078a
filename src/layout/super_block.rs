use super::codec::{DecodeError, Decoder, EncodeError, Encoder};

/// The fixed label identifying a single file index layout.
pub static MAGIC_LABEL: &[u8; MAGIC_LABEL_LEN] = b"*LNX*DEDUPE*SINGLE*FILE*LAYOUT*1";
pub const MAGIC_LABEL_LEN: usize = 32;
/// The number of random seed bytes the master nonce is derived from.
pub const NONCE_INFO_LEN: usize = 32;
/// The encoded size of [SuperBlockData].
pub const SUPER_BLOCK_DATA_SIZE: usize = 104;

/// The oldest super block version which can still be loaded.
pub const SUPER_VERSION_MINIMUM: u32 = 1;
/// The newest super block version which can be loaded.
pub const SUPER_VERSION_MAXIMUM: u32 = 2;
/// The version written by new layouts.
pub const SUPER_VERSION_CURRENT: u32 = 2;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
/// The payload of the super block region table.
pub struct SuperBlockData {
    /// Always [MAGIC_LABEL].
    pub magic_label: [u8; MAGIC_LABEL_LEN],
    /// Random seed bytes the master nonce is derived from.
    pub nonce_info: [u8; NONCE_INFO_LEN],
    /// The master nonce.
    pub nonce: u64,
    pub version: u32,
    /// The block size the layout was created with.
    pub block_size: u32,
    /// The number of sub-indexes, always `1`.
    pub num_indexes: u16,
    /// The number of save slots in each sub-index.
    pub max_saves: u16,
    pub open_chapter_blocks: u64,
    pub page_map_blocks: u64,
}

/// Decode [SuperBlockData] from a buffer of exactly [SUPER_BLOCK_DATA_SIZE] bytes.
pub fn decode_super_block(buffer: &[u8]) -> Result<SuperBlockData, DecodeError> {
    let mut decoder = Decoder::new(buffer);
    let magic_label = decoder.array::<MAGIC_LABEL_LEN>()?;
    let nonce_info = decoder.array::<NONCE_INFO_LEN>()?;
    let nonce = decoder.u64()?;
    let version = decoder.u32()?;
    let block_size = decoder.u32()?;
    let num_indexes = decoder.u16()?;
    let max_saves = decoder.u16()?;
    decoder.padding(4, "super block")?;
    let open_chapter_blocks = decoder.u64()?;
    let page_map_blocks = decoder.u64()?;
    decoder.finish()?;

    Ok(SuperBlockData {
        magic_label,
        nonce_info,
        nonce,
        version,
        block_size,
        num_indexes,
        max_saves,
        open_chapter_blocks,
        page_map_blocks,
    })
}

/// Encode [SuperBlockData] onto the end of `buffer`.
pub fn encode_super_block(
    super_block: &SuperBlockData,
    buffer: &mut Vec<u8>,
) -> Result<(), EncodeError> {
    let mut encoder = Encoder::new(buffer);
    encoder.bytes(&super_block.magic_label);
    encoder.bytes(&super_block.nonce_info);
    encoder.u64(super_block.nonce);
    encoder.u32(super_block.version);
    encoder.u32(super_block.block_size);
    encoder.u16(super_block.num_indexes);
    encoder.u16(super_block.max_saves);
    encoder.padding(4);
    encoder.u64(super_block.open_chapter_blocks);
    encoder.u64(super_block.page_map_blocks);
    encoder.finish(SUPER_BLOCK_DATA_SIZE)
}
