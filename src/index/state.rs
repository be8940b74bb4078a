//! Records written into a save by the index session.

use crate::geometry::BYTES_PER_RECORD;
use crate::index_layout::{MASTER_INDEX_ZONE_OVERHEAD, OPEN_CHAPTER_HEADER_SIZE};
use crate::layout::codec::{DecodeError, Decoder, EncodeError, Encoder};

/// A single record held by a chapter.
pub type Record = [u8; BYTES_PER_RECORD];

/// The encoded size of [IndexState].
pub const INDEX_STATE_SIZE: usize = 24;
/// The magic value at the start of a master index zone header.
const ZONE_MAGIC: u64 = u64::from_le_bytes(*b"LNXMIZN1");
/// The magic value at the start of a saved open chapter.
const OPEN_CHAPTER_MAGIC: u64 = u64::from_le_bytes(*b"LNXOPCH1");
/// The encoded size of a [ZoneHeader], padded to the zone overhead.
pub const ZONE_HEADER_SIZE: usize = MASTER_INDEX_ZONE_OVERHEAD as usize;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
/// The index state stored in the save slot header.
pub struct IndexState {
    pub oldest_virtual_chapter: u64,
    pub newest_virtual_chapter: u64,
    pub zone_count: u32,
}

impl IndexState {
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let mut buffer = Vec::with_capacity(INDEX_STATE_SIZE);
        let mut encoder = Encoder::new(&mut buffer);
        encoder.u64(self.oldest_virtual_chapter);
        encoder.u64(self.newest_virtual_chapter);
        encoder.u32(self.zone_count);
        encoder.padding(4);
        encoder.finish(INDEX_STATE_SIZE)?;
        Ok(buffer)
    }

    pub fn decode(buffer: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(buffer);
        let oldest_virtual_chapter = decoder.u64()?;
        let newest_virtual_chapter = decoder.u64()?;
        let zone_count = decoder.u32()?;
        decoder.padding(4, "index state")?;
        decoder.finish()?;

        if oldest_virtual_chapter > newest_virtual_chapter {
            return Err(DecodeError::InvalidValue {
                field: "oldest virtual chapter",
                value: oldest_virtual_chapter,
            });
        }

        Ok(Self {
            oldest_virtual_chapter,
            newest_virtual_chapter,
            zone_count,
        })
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
/// The header written at the start of every master index zone.
pub struct ZoneHeader {
    pub zone: u32,
    pub num_zones: u32,
    pub oldest_virtual_chapter: u64,
    pub newest_virtual_chapter: u64,
}

impl ZoneHeader {
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let mut buffer = Vec::with_capacity(ZONE_HEADER_SIZE);
        let mut encoder = Encoder::new(&mut buffer);
        encoder.u64(ZONE_MAGIC);
        encoder.u32(self.zone);
        encoder.u32(self.num_zones);
        encoder.u64(self.oldest_virtual_chapter);
        encoder.u64(self.newest_virtual_chapter);
        encoder.padding(ZONE_HEADER_SIZE - 32);
        encoder.finish(ZONE_HEADER_SIZE)?;
        Ok(buffer)
    }

    pub fn decode(buffer: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(buffer);
        if decoder.u64()? != ZONE_MAGIC {
            return Err(DecodeError::BadMagic("master index zone"));
        }
        let zone = decoder.u32()?;
        let num_zones = decoder.u32()?;
        let oldest_virtual_chapter = decoder.u64()?;
        let newest_virtual_chapter = decoder.u64()?;
        decoder.padding(ZONE_HEADER_SIZE - 32, "master index zone")?;
        decoder.finish()?;

        Ok(Self {
            zone,
            num_zones,
            oldest_virtual_chapter,
            newest_virtual_chapter,
        })
    }
}

/// Encode the records of the open chapter.
pub fn encode_open_chapter(records: &[Record]) -> Result<Vec<u8>, EncodeError> {
    let expected = OPEN_CHAPTER_HEADER_SIZE as usize + records.len() * BYTES_PER_RECORD;
    let mut buffer = Vec::with_capacity(expected);
    let mut encoder = Encoder::new(&mut buffer);
    encoder.u64(OPEN_CHAPTER_MAGIC);
    encoder.u32(records.len() as u32);
    for record in records {
        encoder.bytes(record);
    }
    encoder.finish(expected)?;
    Ok(buffer)
}

/// Decode the open chapter from the start of `buffer`.
///
/// Bytes after the last record are ignored, the region is block padded.
pub fn decode_open_chapter(buffer: &[u8], max_records: u64) -> Result<Vec<Record>, DecodeError> {
    let mut decoder = Decoder::new(buffer);
    if decoder.u64()? != OPEN_CHAPTER_MAGIC {
        return Err(DecodeError::BadMagic("open chapter"));
    }
    let count = decoder.u32()?;
    if count as u64 > max_records {
        return Err(DecodeError::InvalidValue {
            field: "open chapter records",
            value: count as u64,
        });
    }

    let mut records = Vec::with_capacity(count as usize);
    for _ in 0..count {
        records.push(decoder.array::<BYTES_PER_RECORD>()?);
    }
    Ok(records)
}
