//! Nonce derivation for authenticating persisted layout state.
//!
//! Nonces form a chain: the master nonce is derived from the random seed
//! bytes stored in the super block, the sub-index (volume) nonce from the
//! master nonce and the sub-index position, and each save nonce from the
//! volume nonce, the save metadata and the save slot position. A save copied
//! into another slot or another index therefore fails validation.

use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::layout::IndexSaveData;
use crate::layout::super_block::NONCE_INFO_LEN;

type HmacSha256 = Hmac<Sha256>;

/// The key used for deriving the master nonce from the seed bytes.
static MASTER_NONCE_KEY: &[u8] = b"lnx-dedupe-index-master-nonce";

/// Derive the master nonce from the super block seed bytes.
pub fn master_nonce(nonce_info: &[u8]) -> u64 {
    keyed_hash(MASTER_NONCE_KEY, nonce_info)
}

/// Derive a secondary nonce from a parent nonce and some data.
pub fn secondary_nonce(nonce: u64, data: &[u8]) -> u64 {
    keyed_hash(&nonce.to_le_bytes(), data)
}

/// Derive the nonce of a sub-index from the master nonce and the position
/// of its container.
///
/// Zero is reserved to mean "no sub-index present", so a zero result is
/// re-derived from the negated master nonce.
pub fn sub_index_nonce(master_nonce: u64, start_block: u64, index_id: u16) -> u64 {
    let mut data = [0; 10];
    data[..8].copy_from_slice(&start_block.to_le_bytes());
    data[8..].copy_from_slice(&index_id.to_le_bytes());

    let nonce = secondary_nonce(master_nonce, &data);
    if nonce != 0 {
        return nonce;
    }
    secondary_nonce((!master_nonce).wrapping_add(1), &data)
}

/// Derive the nonce of a save from the volume nonce, the save metadata
/// and the first block of the save slot.
///
/// The nonce stored in `save_data` does not take part in the derivation.
pub fn save_nonce(volume_nonce: u64, save_data: &IndexSaveData, start_block: u64) -> u64 {
    let mut data = [0; 32];
    data[0..8].copy_from_slice(&save_data.timestamp.to_le_bytes());
    // data[8..16] is the cleared nonce slot and data[20..24] is padding.
    data[16..20].copy_from_slice(&save_data.version.to_le_bytes());
    data[24..32].copy_from_slice(&start_block.to_le_bytes());
    secondary_nonce(volume_nonce, &data)
}

/// Create a new set of seed bytes for a master nonce.
///
/// The seed is the current time in milliseconds followed by random bytes.
pub fn create_nonce_info() -> [u8; NONCE_INFO_LEN] {
    let mut nonce_info = [0; NONCE_INFO_LEN];
    nonce_info[..8].copy_from_slice(&current_time_ms().to_le_bytes());
    fastrand::fill(&mut nonce_info[8..]);
    nonce_info
}

/// The current time in milliseconds since the unix epoch.
pub(crate) fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

fn keyed_hash(key: &[u8], data: &[u8]) -> u64 {
    let mut mac =
        HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    let digest = mac.finalize().into_bytes();
    u64::from_le_bytes(digest[..8].try_into().unwrap())
}
