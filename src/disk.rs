use std::{
    fs,
    io::{self, Read, Seek},
    sync::Mutex,
};

use crate::{Error, Result};

/// Trait providing the function [ReadAt::read_at]
/// This function has the same behavior as seeking and reading at a given location.
/// To improve compatibility with different operating systems, the guarantees
/// provided by this function are minimal
pub trait ReadAt {
    /// Similar to [io::Read::read] but instead of using the internal cursor,
    /// Use `offset` as the explicit cursor
    /// The state of the internal cursor is considered as undefined after a call to this function
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Fill as much of `buf` as possible, stopping early only at the end of the source.
    /// Returns the number of bytes read
    fn read_full_at(&self, mut buf: &mut [u8], mut offset: u64) -> io::Result<usize> {
        let initial_len = buf.len();
        while !buf.is_empty() {
            match self.read_at(buf, offset) {
                Ok(0) => break,
                Ok(n) => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
                Err(ref e) if matches!(e.kind(), io::ErrorKind::Interrupted) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(initial_len - buf.len())
    }
}

impl<T: ReadAt + ?Sized> ReadAt for &T {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        (**self).read_at(buf, offset)
    }
}

#[cfg(unix)]
impl ReadAt for fs::File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(self, buf, offset)
    }
}

#[cfg(windows)]
impl ReadAt for fs::File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        // [ReadAt::read_at] has no guarantee regarding the value of the cursor
        // after a call to this function. Therefore, it is valid to implement
        // read_at using seek_read, which modifies the position of the internal cursor
        std::os::windows::fs::FileExt::seek_read(self, buf, offset)
    }
}

impl ReadAt for [u8] {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let Some(available) = usize::try_from(offset).ok().and_then(|o| self.get(o..)) else {
            return Ok(0);
        };
        let len = available.len().min(buf.len());
        buf[..len].copy_from_slice(&available[..len]);
        Ok(len)
    }
}

impl ReadAt for Vec<u8> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.as_slice().read_at(buf, offset)
    }
}

/// Reader which implements [ReadAt] using
/// a mutex with a [Read] and [Seek] type internally
pub struct SharedReader<T: Read + Seek> {
    inner: Mutex<T>,
}

impl<T: Read + Seek> SharedReader<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }
}

impl<T: Read + Seek> ReadAt for SharedReader<T> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| io::Error::other("shared reader lock poisoned"))?;
        inner.seek(io::SeekFrom::Start(offset))?;
        inner.read(buf)
    }
}

/// A device addressed in fixed-size blocks (sectors)
pub trait BlockDevice {
    /// Native block size of the device in bytes
    fn block_size(&self) -> u32;

    /// Read `count` blocks starting at block `start` into `buf`,
    /// which is at least `count * block_size()` bytes long.
    /// Returns the number of blocks actually read
    fn read_blocks(&self, start: u64, count: u64, buf: &mut [u8]) -> io::Result<u64>;
}

impl<D: BlockDevice + ?Sized> BlockDevice for &D {
    fn block_size(&self) -> u32 {
        (**self).block_size()
    }

    fn read_blocks(&self, start: u64, count: u64, buf: &mut [u8]) -> io::Result<u64> {
        (**self).read_blocks(start, count, buf)
    }
}

/// Exposes any [ReadAt] source (image file, memory buffer) as a [BlockDevice]
/// with a configurable sector size.
/// A trailing partial sector is zero-filled, images do not need to be padded
pub struct SectorDevice<T: ReadAt> {
    reader: T,
    sector_size: u32,
}

impl<T: ReadAt> SectorDevice<T> {
    pub const DEFAULT_SECTOR_SIZE: u32 = 512;

    pub fn new(reader: T) -> Self {
        Self {
            reader,
            sector_size: Self::DEFAULT_SECTOR_SIZE,
        }
    }

    /// Fails with [Error::Unsupported] when `sector_size` is zero
    pub fn with_sector_size(reader: T, sector_size: u32) -> Result<Self> {
        if sector_size == 0 {
            return Err(Error::unsupported("zero sector size"));
        }
        Ok(Self {
            reader,
            sector_size,
        })
    }

    pub fn into_inner(self) -> T {
        self.reader
    }
}

impl<T: ReadAt> BlockDevice for SectorDevice<T> {
    fn block_size(&self) -> u32 {
        self.sector_size
    }

    fn read_blocks(&self, start: u64, count: u64, buf: &mut [u8]) -> io::Result<u64> {
        let sector_size = self.sector_size as u64;
        let len = count
            .checked_mul(sector_size)
            .and_then(|len| usize::try_from(len).ok())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "read too large"))?;
        let buf = buf
            .get_mut(..len)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "buffer too small"))?;

        let offset = start
            .checked_mul(sector_size)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "read offset too large"))?;
        let read = self.reader.read_full_at(buf, offset)?;
        buf[read..].fill(0);
        Ok((read as u64).div_ceil(sector_size))
    }
}

/// Location of the filesystem on its device, in device blocks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Partition {
    pub start: u64,
}

impl Partition {
    pub const fn new(start: u64) -> Self {
        Self { start }
    }
}

/// Buffer returned by [Disk::read_range]: whole device blocks, with the requested
/// bytes starting at `start`
pub(crate) struct SectorBuffer {
    bytes: Vec<u8>,
    start: usize,
}

impl SectorBuffer {
    pub(crate) fn data(&self) -> &[u8] {
        &self.bytes[self.start..]
    }
}

/// Partition-relative, byte addressed view of a [BlockDevice]
pub(crate) struct Disk<D: BlockDevice> {
    device: D,
    partition: Partition,
}

impl<D: BlockDevice> Disk<D> {
    pub(crate) fn new(device: D, partition: Partition) -> Self {
        Self { device, partition }
    }

    pub(crate) fn device(&self) -> &D {
        &self.device
    }

    pub(crate) fn into_device(self) -> D {
        self.device
    }

    /// Number of device blocks covering `len` bytes starting at byte `start`, along with the
    /// first block index and the offset of `start` within that block
    pub(crate) fn calc_n_blks(&self, start: u64, len: u64) -> Result<(u64, u64, u64)> {
        let blksz = self.device.block_size() as u64;
        let first_block = start / blksz;
        let offset = start - first_block * blksz;
        let n_blks = len
            .checked_add(offset)
            .ok_or_else(|| Error::format("disk range overflow"))?
            .div_ceil(blksz);
        Ok((first_block, n_blks, offset))
    }

    /// Read the device blocks `[start, start + count)` of the partition
    pub(crate) fn disk_read(&self, start: u64, count: u64, buf: &mut [u8]) -> Result<()> {
        let read = self
            .device
            .read_blocks(self.partition.start + start, count, buf)?;
        if read != count {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("read {read} of {count} blocks at block {start}"),
            )
            .into());
        }
        Ok(())
    }

    /// Read the byte range `[offset, offset + len)` of the partition through
    /// block-aligned device reads
    pub(crate) fn read_range(&self, offset: u64, len: u64) -> Result<SectorBuffer> {
        let (first_block, n_blks, start) = self.calc_n_blks(offset, len)?;
        let total = n_blks
            .checked_mul(self.device.block_size() as u64)
            .and_then(|total| usize::try_from(total).ok())
            .ok_or_else(|| Error::format("disk range too large"))?;

        let mut bytes = alloc_zeroed(total)?;
        self.disk_read(first_block, n_blks, &mut bytes)?;
        Ok(SectorBuffer {
            bytes,
            start: start as usize,
        })
    }
}

/// Allocate a zeroed buffer, reporting allocation failure instead of aborting
pub(crate) fn alloc_zeroed(len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| Error::OutOfMemory(len))?;
    buf.resize(len, 0);
    Ok(buf)
}
