//! Block storage the layout is persisted to.
//!
//! All offsets passed to a [BlockDevice] are in bytes, callers working in
//! blocks convert through [IoFactory::block_size].

use std::fmt::Formatter;
use std::io;
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;

/// The smallest block size a layout can be created with.
pub const MIN_BLOCK_SIZE: usize = 4 << 10;
/// The default block size of new layouts.
pub const DEFAULT_BLOCK_SIZE: usize = 4 << 10;

/// A raw device or file which can be read and written at byte offsets.
pub trait BlockDevice: Send + Sync + 'static {
    /// Fill `buffer` with the bytes starting at `offset`.
    fn read_at(&self, buffer: &mut [u8], offset: u64) -> io::Result<()>;

    /// Write all of `buffer` starting at `offset`.
    fn write_at(&self, buffer: &[u8], offset: u64) -> io::Result<()>;

    /// Make all previous writes durable.
    fn sync(&self) -> io::Result<()>;

    /// The size of the device in bytes.
    fn size(&self) -> io::Result<u64>;
}

/// A [BlockDevice] backed by a regular file or block special file.
pub struct FileDevice {
    file: std::fs::File,
}

impl FileDevice {
    /// Create a new file of `size` bytes, failing if it already exists.
    pub fn create(path: &Path, size: u64) -> io::Result<Self> {
        let file = crate::utils::create_file(path, false)?;
        file.set_len(size)?;
        file.sync_all()?;
        Ok(Self { file })
    }

    /// Open an existing file.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)?;
        Ok(Self { file })
    }
}

impl BlockDevice for FileDevice {
    fn read_at(&self, buffer: &mut [u8], offset: u64) -> io::Result<()> {
        self.file.read_exact_at(buffer, offset)
    }

    fn write_at(&self, buffer: &[u8], offset: u64) -> io::Result<()> {
        self.file.write_all_at(buffer, offset)
    }

    fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

/// A fixed size [BlockDevice] held in memory.
pub struct MemoryDevice {
    data: RwLock<Vec<u8>>,
    #[cfg(test)]
    fail_points: bool,
}

impl MemoryDevice {
    /// Create a new zeroed device of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            data: RwLock::new(vec![0; size]),
            #[cfg(test)]
            fail_points: false,
        }
    }

    #[cfg(test)]
    /// Create a new zeroed device whose reads and writes go through the
    /// `storage::read_at` and `storage::write_at` fail points.
    pub(crate) fn with_fail_points(size: usize) -> Self {
        Self {
            data: RwLock::new(vec![0; size]),
            fail_points: true,
        }
    }

    /// Apply `mutate` to the raw device contents.
    pub fn with_contents<R>(&self, mutate: impl FnOnce(&mut [u8]) -> R) -> R {
        mutate(&mut self.data.write())
    }
}

/// The in-memory range of `len` bytes at `offset`, `None` if it overflows.
fn byte_range(offset: u64, len: usize) -> Option<std::ops::Range<usize>> {
    let start = usize::try_from(offset).ok()?;
    let end = start.checked_add(len)?;
    Some(start..end)
}

fn out_of_bounds(offset: u64, len: usize, size: usize) -> io::Error {
    io::Error::new(
        ErrorKind::UnexpectedEof,
        format!("access of {len} bytes at {offset} is beyond device size {size}"),
    )
}

impl BlockDevice for MemoryDevice {
    fn read_at(&self, buffer: &mut [u8], offset: u64) -> io::Result<()> {
        #[cfg(test)]
        fail::fail_point!(
            "storage::read_at",
            self.fail_points,
            crate::utils::parse_io_error_return
        );

        let data = self.data.read();
        let Some(range) = byte_range(offset, buffer.len()) else {
            return Err(out_of_bounds(offset, buffer.len(), data.len()));
        };
        let Some(src) = data.get(range) else {
            return Err(out_of_bounds(offset, buffer.len(), data.len()));
        };
        buffer.copy_from_slice(src);
        Ok(())
    }

    fn write_at(&self, buffer: &[u8], offset: u64) -> io::Result<()> {
        #[cfg(test)]
        fail::fail_point!(
            "storage::write_at",
            self.fail_points,
            crate::utils::parse_io_error_return
        );

        let mut data = self.data.write();
        let size = data.len();
        let Some(range) = byte_range(offset, buffer.len()) else {
            return Err(out_of_bounds(offset, buffer.len(), size));
        };
        let Some(dst) = data.get_mut(range) else {
            return Err(out_of_bounds(offset, buffer.len(), size));
        };
        dst.copy_from_slice(buffer);
        Ok(())
    }

    fn sync(&self) -> io::Result<()> {
        Ok(())
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.data.read().len() as u64)
    }
}

#[derive(Clone)]
/// The shared storage handle used by every component of the layout.
///
/// Cloning the factory shares the underlying device.
pub struct IoFactory {
    device: Arc<dyn BlockDevice>,
    block_size: usize,
}

impl std::fmt::Debug for IoFactory {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "IoFactory(block_size={})", self.block_size)
    }
}

impl IoFactory {
    /// Creates a new factory over a device using the [DEFAULT_BLOCK_SIZE].
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        Self {
            device,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }

    /// Creates a new factory with a custom block size.
    ///
    /// The block size must be a power of two no smaller than [MIN_BLOCK_SIZE].
    pub fn with_block_size(
        device: Arc<dyn BlockDevice>,
        block_size: usize,
    ) -> io::Result<Self> {
        if block_size < MIN_BLOCK_SIZE || !block_size.is_power_of_two() {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("invalid block size {block_size}"),
            ));
        }
        Ok(Self { device, block_size })
    }

    #[inline]
    /// The size of a block in bytes.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[inline]
    /// The size of the underlying device in bytes.
    pub fn device_size(&self) -> io::Result<u64> {
        self.device.size()
    }

    /// Read `num_blocks` blocks starting at the absolute block `start_block`.
    pub fn read_blocks(&self, start_block: u64, num_blocks: usize) -> io::Result<Vec<u8>> {
        let mut buffer = vec![0; num_blocks * self.block_size];
        self.device
            .read_at(&mut buffer, start_block * self.block_size as u64)?;
        Ok(buffer)
    }

    /// Write `buffer`, zero padded to a whole number of blocks, at the
    /// absolute block `start_block` and sync the device.
    pub fn write_blocks(&self, start_block: u64, buffer: &[u8]) -> io::Result<()> {
        let padded_len = crate::utils::align_up(buffer.len(), self.block_size);
        let offset = start_block * self.block_size as u64;
        if padded_len == buffer.len() {
            self.device.write_at(buffer, offset)?;
        } else {
            let mut padded = Vec::with_capacity(padded_len);
            padded.extend_from_slice(buffer);
            padded.resize(padded_len, 0);
            self.device.write_at(&padded, offset)?;
        }
        self.device.sync()
    }

    /// Read exactly `buffer.len()` bytes at a byte offset.
    pub fn read_at(&self, buffer: &mut [u8], offset: u64) -> io::Result<()> {
        self.device.read_at(buffer, offset)
    }

    /// Write all of `buffer` at a byte offset without syncing.
    pub fn write_at(&self, buffer: &[u8], offset: u64) -> io::Result<()> {
        self.device.write_at(buffer, offset)
    }

    /// Make all previous writes durable.
    pub fn sync(&self) -> io::Result<()> {
        self.device.sync()
    }

    /// Open a reader over `len` bytes starting at the byte `offset`.
    pub fn open_reader(&self, offset: u64, len: usize) -> RegionReader {
        RegionReader {
            device: self.device.clone(),
            offset,
            len,
            pos: 0,
        }
    }

    /// Open a writer over `len` bytes starting at the byte `offset`.
    ///
    /// Nothing reaches the device until [RegionWriter::flush] is called.
    pub fn open_writer(&self, offset: u64, len: usize) -> RegionWriter {
        RegionWriter {
            device: self.device.clone(),
            block_size: self.block_size,
            offset,
            len,
            buffer: Vec::new(),
        }
    }
}

/// A sequential reader bounded to a single region.
pub struct RegionReader {
    device: Arc<dyn BlockDevice>,
    offset: u64,
    len: usize,
    pos: usize,
}

impl io::Read for RegionReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.len - self.pos);
        if n == 0 {
            return Ok(0);
        }
        self.device
            .read_at(&mut buf[..n], self.offset + self.pos as u64)?;
        self.pos += n;
        Ok(n)
    }
}

/// A buffered writer bounded to a single region.
///
/// Writing past the end of the region fails without touching the device.
pub struct RegionWriter {
    device: Arc<dyn BlockDevice>,
    block_size: usize,
    offset: u64,
    len: usize,
    buffer: Vec<u8>,
}

impl io::Write for RegionWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.buffer.len() + buf.len() > self.len {
            return Err(io::Error::new(
                ErrorKind::WriteZero,
                format!("write exceeds region of {} bytes", self.len),
            ));
        }
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    /// Pad the buffered data to a whole block, write it and sync the device.
    fn flush(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let padded_len = crate::utils::align_up(self.buffer.len(), self.block_size)
            .min(self.len);
        self.buffer.resize(padded_len, 0);
        self.device.write_at(&self.buffer, self.offset)?;
        self.device.sync()?;
        self.offset += self.buffer.len() as u64;
        self.len -= self.buffer.len();
        self.buffer.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use super::*;

    fn memory_factory(size: usize) -> (Arc<MemoryDevice>, IoFactory) {
        let device = Arc::new(MemoryDevice::new(size));
        let io = IoFactory::new(device.clone());
        (device, io)
    }

    #[rstest::rstest]
    #[case::too_small(512, false)]
    #[case::not_power_of_two(6 << 10, false)]
    #[case::default(4 << 10, true)]
    #[case::large(64 << 10, true)]
    fn test_block_size_validation(#[case] block_size: usize, #[case] ok: bool) {
        let device = Arc::new(MemoryDevice::new(0));
        let result = IoFactory::with_block_size(device, block_size);
        assert_eq!(result.is_ok(), ok);
    }

    #[test]
    fn test_write_blocks_pads_to_block() {
        let (device, io) = memory_factory(3 * DEFAULT_BLOCK_SIZE);
        device.with_contents(|data| data.fill(0xFF));

        io.write_blocks(1, b"hello").unwrap();

        let block = io.read_blocks(1, 1).unwrap();
        assert_eq!(&block[..5], b"hello");
        assert!(block[5..].iter().all(|b| *b == 0));
        let untouched = io.read_blocks(2, 1).unwrap();
        assert!(untouched.iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn test_region_writer_bounded() {
        let (_, io) = memory_factory(2 * DEFAULT_BLOCK_SIZE);
        let mut writer = io.open_writer(0, 8);
        writer.write_all(b"12345678").unwrap();
        let err = writer.write_all(b"9").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WriteZero);
    }

    #[test]
    fn test_region_writer_reader() {
        let (_, io) = memory_factory(4 * DEFAULT_BLOCK_SIZE);
        let mut writer = io.open_writer(DEFAULT_BLOCK_SIZE as u64, 2 * DEFAULT_BLOCK_SIZE);
        writer.write_all(b"region data").unwrap();
        writer.flush().unwrap();

        let mut reader = io.open_reader(DEFAULT_BLOCK_SIZE as u64, 2 * DEFAULT_BLOCK_SIZE);
        let mut contents = Vec::new();
        reader.read_to_end(&mut contents).unwrap();
        assert_eq!(contents.len(), 2 * DEFAULT_BLOCK_SIZE);
        assert_eq!(&contents[..11], b"region data");
    }

    #[test]
    fn test_memory_device_out_of_bounds() {
        let (_, io) = memory_factory(DEFAULT_BLOCK_SIZE);
        let err = io.read_blocks(1, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
        let err = io.write_blocks(1, b"x").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[rstest::rstest]
    #[case::near_u64_max(u64::MAX - 2)]
    #[case::near_overflow(usize::MAX as u64)]
    fn test_memory_device_offset_overflow(#[case] offset: u64) {
        let device = MemoryDevice::new(DEFAULT_BLOCK_SIZE);
        let mut buffer = [0; 16];
        let err = device.read_at(&mut buffer, offset).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
        let err = device.write_at(&buffer, offset).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_memory_device_fail_points() {
        let scenario = fail::FailScenario::setup();
        let device = Arc::new(MemoryDevice::with_fail_points(2 * DEFAULT_BLOCK_SIZE));
        let io = IoFactory::new(device.clone());

        fail::cfg("storage::write_at", "1*off->return(5)").unwrap();
        io.write_blocks(0, b"ok").unwrap();
        let err = io.write_blocks(1, b"fail").unwrap_err();
        assert_eq!(err.raw_os_error(), Some(5));

        fail::cfg("storage::read_at", "return").unwrap();
        assert!(io.read_blocks(0, 1).is_err());

        // Devices created without fail points ignore them.
        let (_, plain) = memory_factory(DEFAULT_BLOCK_SIZE);
        plain.write_blocks(0, b"ok").unwrap();
        assert_eq!(&plain.read_blocks(0, 1).unwrap()[..2], b"ok");

        scenario.teardown();
        assert_eq!(&io.read_blocks(0, 1).unwrap()[..2], b"ok");
    }

    #[test]
    fn test_file_device() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index");
        let device = FileDevice::create(&path, 2 * DEFAULT_BLOCK_SIZE as u64).unwrap();
        assert_eq!(device.size().unwrap(), 2 * DEFAULT_BLOCK_SIZE as u64);

        device.write_at(b"abc", 10).unwrap();
        device.sync().unwrap();
        drop(device);

        let device = FileDevice::open(&path).unwrap();
        let mut buffer = [0; 3];
        device.read_at(&mut buffer, 10).unwrap();
        assert_eq!(&buffer, b"abc");

        let err = FileDevice::create(&path, 10)
            .err()
            .expect("existing file should not be recreated");
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }
}
