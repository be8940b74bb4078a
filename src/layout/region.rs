use super::codec::{DecodeError, Decoder, EncodeError, Encoder};

/// The magic value at the start of every region table.
pub const REGION_MAGIC: u64 = u64::from_le_bytes(*b"LNXREGN1");
/// The only region table version understood by the system.
pub const REGION_TABLE_VERSION: u16 = 1;
/// The encoded size of a [RegionHeader].
pub const REGION_HEADER_SIZE: usize = 24;
/// The encoded size of a [Region].
pub const REGION_SIZE: usize = 24;
/// The instance value of a region kind which only occurs once.
pub const SOLE_INSTANCE: u16 = u16::MAX;

#[repr(u16)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
/// The semantic role of a [Region].
pub enum RegionKind {
    /// Unused or free space.
    Scratch = 0,
    /// A block holding a region table.
    Header = 1,
    /// The stored index configuration.
    Config = 2,
    /// A sub-index container spanning the volume and its save slots.
    Index = 3,
    /// The trailing seal block.
    Seal = 4,
    /// The chapter volume.
    Volume = 5,
    /// A save slot container.
    Save = 6,
    /// The saved index page map.
    IndexPageMap = 7,
    /// A saved master index zone.
    MasterIndex = 8,
    /// The saved open chapter.
    OpenChapter = 9,
}

impl RegionKind {
    fn try_from_u16(value: u16) -> Option<Self> {
        let kind = match value {
            0 => RegionKind::Scratch,
            1 => RegionKind::Header,
            2 => RegionKind::Config,
            3 => RegionKind::Index,
            4 => RegionKind::Seal,
            5 => RegionKind::Volume,
            6 => RegionKind::Save,
            7 => RegionKind::IndexPageMap,
            8 => RegionKind::MasterIndex,
            9 => RegionKind::OpenChapter,
            _ => return None,
        };
        Some(kind)
    }
}

#[repr(u16)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
/// The kind of data a region table describes.
pub enum TableType {
    /// An unused table.
    Free = 0,
    /// The super block table describing the whole layout.
    Super = 1,
    /// A save slot holding a full save.
    Save = 2,
    /// A save slot holding a checkpoint.
    Checkpoint = 3,
    /// A save slot which holds no valid data.
    Unsaved = 4,
}

impl TableType {
    fn try_from_u16(value: u16) -> Option<Self> {
        let table_type = match value {
            0 => TableType::Free,
            1 => TableType::Super,
            2 => TableType::Save,
            3 => TableType::Checkpoint,
            4 => TableType::Unsaved,
            _ => return None,
        };
        Some(table_type)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
/// A block-aligned span of the layout.
pub struct Region {
    /// The absolute block the region starts at.
    pub start_block: u64,
    /// The length of the region in blocks.
    pub num_blocks: u64,
    /// A checksum of the region contents, zero where unused.
    pub checksum: u32,
    /// The role of the region.
    pub kind: RegionKind,
    /// Disambiguates repeated kinds, or [SOLE_INSTANCE].
    pub instance: u16,
}

impl Region {
    /// Creates a new region with no checksum.
    pub const fn new(
        start_block: u64,
        num_blocks: u64,
        kind: RegionKind,
        instance: u16,
    ) -> Self {
        Self {
            start_block,
            num_blocks,
            checksum: 0,
            kind,
            instance,
        }
    }

    #[inline]
    /// The first block after the region.
    pub const fn end_block(&self) -> u64 {
        self.start_block + self.num_blocks
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
/// The fixed header at the start of a region table.
pub struct RegionHeader {
    /// Always [REGION_MAGIC].
    pub magic: u64,
    /// The number of blocks covered by the table's regions.
    pub region_blocks: u64,
    /// What the table describes.
    pub table_type: TableType,
    /// Always [REGION_TABLE_VERSION].
    pub version: u16,
    /// The number of regions following the header.
    pub num_regions: u16,
    /// The number of payload bytes following the regions.
    pub payload: u16,
}

/// Decode a [RegionHeader] from a buffer of exactly [REGION_HEADER_SIZE] bytes.
///
/// A magic mismatch is reported before any other field is checked.
pub fn decode_region_header(buffer: &[u8]) -> Result<RegionHeader, DecodeError> {
    let mut decoder = Decoder::new(buffer);
    let magic = decoder.u64()?;
    if magic != REGION_MAGIC {
        return Err(DecodeError::BadMagic("region table"));
    }

    let region_blocks = decoder.u64()?;
    let raw_type = decoder.u16()?;
    let table_type =
        TableType::try_from_u16(raw_type).ok_or(DecodeError::InvalidValue {
            field: "table type",
            value: raw_type as u64,
        })?;
    let version = decoder.u16()?;
    let num_regions = decoder.u16()?;
    let payload = decoder.u16()?;
    decoder.finish()?;

    Ok(RegionHeader {
        magic,
        region_blocks,
        table_type,
        version,
        num_regions,
        payload,
    })
}

/// Encode a [RegionHeader] onto the end of `buffer`.
pub fn encode_region_header(
    header: &RegionHeader,
    buffer: &mut Vec<u8>,
) -> Result<(), EncodeError> {
    let mut encoder = Encoder::new(buffer);
    encoder.u64(header.magic);
    encoder.u64(header.region_blocks);
    encoder.u16(header.table_type as u16);
    encoder.u16(header.version);
    encoder.u16(header.num_regions);
    encoder.u16(header.payload);
    encoder.finish(REGION_HEADER_SIZE)
}

fn read_region(decoder: &mut Decoder) -> Result<Region, DecodeError> {
    let start_block = decoder.u64()?;
    let num_blocks = decoder.u64()?;
    let checksum = decoder.u32()?;
    let raw_kind = decoder.u16()?;
    let kind = RegionKind::try_from_u16(raw_kind).ok_or(DecodeError::InvalidValue {
        field: "region kind",
        value: raw_kind as u64,
    })?;
    let instance = decoder.u16()?;

    Ok(Region {
        start_block,
        num_blocks,
        checksum,
        kind,
        instance,
    })
}

/// Decode a single [Region] from a buffer of exactly [REGION_SIZE] bytes.
pub fn decode_region(buffer: &[u8]) -> Result<Region, DecodeError> {
    let mut decoder = Decoder::new(buffer);
    let region = read_region(&mut decoder)?;
    decoder.finish()?;
    Ok(region)
}

/// Decode `count` consecutive regions, consuming the whole buffer.
pub fn decode_regions(buffer: &[u8], count: usize) -> Result<Vec<Region>, DecodeError> {
    let mut decoder = Decoder::new(buffer);
    let mut regions = Vec::with_capacity(count);
    for _ in 0..count {
        regions.push(read_region(&mut decoder)?);
    }
    decoder.finish()?;
    Ok(regions)
}

/// Encode a [Region] onto the end of `buffer`.
pub fn encode_region(region: &Region, buffer: &mut Vec<u8>) -> Result<(), EncodeError> {
    let mut encoder = Encoder::new(buffer);
    encoder.u64(region.start_block);
    encoder.u64(region.num_blocks);
    encoder.u32(region.checksum);
    encoder.u16(region.kind as u16);
    encoder.u16(region.instance);
    encoder.finish(REGION_SIZE)
}

#[derive(Debug, Clone, Eq, PartialEq)]
/// A decoded region table: its header and the regions it lists.
pub struct RegionTable {
    pub header: RegionHeader,
    pub regions: Vec<Region>,
}

impl RegionTable {
    /// Creates a new table of the given type.
    pub fn new(
        table_type: TableType,
        region_blocks: u64,
        regions: Vec<Region>,
        payload: u16,
    ) -> Self {
        let header = RegionHeader {
            magic: REGION_MAGIC,
            region_blocks,
            table_type,
            version: REGION_TABLE_VERSION,
            num_regions: regions.len() as u16,
            payload,
        };
        Self { header, regions }
    }

    /// The encoded size of the table, excluding its payload.
    pub fn encoded_len(&self) -> usize {
        REGION_HEADER_SIZE + self.regions.len() * REGION_SIZE
    }
}

/// Read a region table from the start of `block`.
///
/// Returns the table along with the payload bytes which follow it.
pub fn read_region_table(block: &[u8]) -> Result<(RegionTable, &[u8]), DecodeError> {
    if block.len() < REGION_HEADER_SIZE {
        return Err(DecodeError::EndOfBuffer);
    }

    let header = decode_region_header(&block[..REGION_HEADER_SIZE])?;
    if header.version != REGION_TABLE_VERSION {
        return Err(DecodeError::InvalidValue {
            field: "region table version",
            value: header.version as u64,
        });
    }

    let regions_len = header.num_regions as usize * REGION_SIZE;
    let payload_start = REGION_HEADER_SIZE + regions_len;
    let payload_end = payload_start + header.payload as usize;
    if block.len() < payload_end {
        return Err(DecodeError::EndOfBuffer);
    }

    let regions = decode_regions(
        &block[REGION_HEADER_SIZE..payload_start],
        header.num_regions as usize,
    )?;
    let table = RegionTable { header, regions };
    Ok((table, &block[payload_start..payload_end]))
}

/// Write a region table followed by its payload onto the end of `buffer`.
pub fn write_region_table(
    table: &RegionTable,
    payload: &[u8],
    buffer: &mut Vec<u8>,
) -> Result<(), EncodeError> {
    debug_assert_eq!(table.header.payload as usize, payload.len());
    debug_assert_eq!(table.header.num_regions as usize, table.regions.len());

    let start = buffer.len();
    let result = encode_region_header(&table.header, buffer).and_then(|_| {
        table
            .regions
            .iter()
            .try_for_each(|region| encode_region(region, buffer))
    });
    if let Err(err) = result {
        buffer.truncate(start);
        return Err(err);
    }

    buffer.extend_from_slice(payload);
    Ok(())
}
