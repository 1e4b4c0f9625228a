//! Metadata blocks and the flat tables built out of them.
//!
//! The inode and directory tables are stored as a run of metadata blocks, each
//! one compressed on its own and decompressing to 8KiB (except the last one).
//! [read_table] inflates a whole table into a single buffer where block `j`
//! starts at `j * 8192`, and records where each block ends on disk so that
//! (block start, offset) references can be turned into buffer offsets.

use tracing::trace;
use zerocopy::{FromBytes, little_endian::U16};

use crate::{
    Decompressor, Error, Result,
    disk::{BlockDevice, Disk, alloc_zeroed},
    structs::{METADATA_BLOCK_SIZE, METADATA_HEADER_SIZE, METADATA_UNCOMPRESSED_BIT},
};

/// Decoded 16-bit metadata block header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MetablockHeader {
    pub(crate) compressed: bool,
    /// Size of the payload following the header, as stored on disk
    pub(crate) size: u32,
}

impl MetablockHeader {
    /// Bytes taken on disk by the header and its payload
    pub(crate) fn disk_size(self) -> u32 {
        self.size + METADATA_HEADER_SIZE as u32
    }
}

/// Decode the metadata block header found at `offset` in `buffer`
pub(crate) fn read_metablock(buffer: &[u8], offset: usize) -> Result<MetablockHeader> {
    let header = buffer
        .get(offset..)
        .and_then(|bytes| U16::read_from_prefix(bytes).ok())
        .map(|(header, _)| header.get())
        .ok_or_else(|| Error::format("truncated metadata block header"))?;

    if header == 0 {
        return Err(Error::format("null metadata block header"));
    }

    let size = (header & !METADATA_UNCOMPRESSED_BIT) as u32;
    if size as usize > METADATA_BLOCK_SIZE {
        return Err(Error::format(format!(
            "invalid metadata block size: {size} bytes"
        )));
    }

    Ok(MetablockHeader {
        compressed: header & METADATA_UNCOMPRESSED_BIT == 0,
        size,
    })
}

/// Count the metadata blocks stored in the first `table_size` bytes of `buffer`
pub(crate) fn count_metablks(buffer: &[u8], table_size: u64) -> Result<usize> {
    let mut count = 0;
    let mut cur_size = 0u64;
    loop {
        let offset =
            usize::try_from(cur_size).map_err(|_| Error::format("metadata table too large"))?;
        cur_size += read_metablock(buffer, offset)?.disk_size() as u64;
        count += 1;

        if cur_size >= table_size {
            return Ok(count);
        }
    }
}

/// For each of the first `count` metadata blocks of `buffer`, the on-disk offset (relative
/// to the table start) where it ends, which is also where the next block starts
pub(crate) fn metablk_positions(buffer: &[u8], count: usize) -> Result<Vec<u32>> {
    if count == 0 {
        return Err(Error::format("empty metadata table"));
    }

    let mut positions = Vec::with_capacity(count);
    let mut cur_size = 0u32;
    for _ in 0..count {
        let header = read_metablock(buffer, cur_size as usize)?;
        cur_size = cur_size
            .checked_add(header.disk_size())
            .ok_or_else(|| Error::format("metadata table too large"))?;
        positions.push(cur_size);
    }
    Ok(positions)
}

/// Translate a metadata reference into an offset inside a flat table
/// `start_block` is the on-disk start of the metadata block relative to the table start,
/// `positions` the list produced by [metablk_positions]
pub(crate) fn metadata_offset(positions: &[u32], start_block: u64, offset: u16) -> Result<usize> {
    if let Some(index) = positions.iter().position(|&pos| pos as u64 == start_block) {
        return Ok((index + 1) * METADATA_BLOCK_SIZE + offset as usize);
    }

    if start_block == 0 {
        return Ok(offset as usize);
    }

    Err(Error::InvalidReference {
        block: start_block,
        offset,
    })
}

/// A fully decompressed inode or directory table
pub(crate) struct Table {
    data: Vec<u8>,
    positions: Vec<u32>,
}

impl Table {
    #[cfg(test)]
    pub(crate) fn from_parts(data: Vec<u8>, positions: Vec<u32>) -> Self {
        Self { data, positions }
    }

    pub(crate) fn data(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn positions(&self) -> &[u32] {
        &self.positions
    }

    /// Offset in [Self::data] of the metadata reference (start_block, offset)
    pub(crate) fn offset_of(&self, start_block: u64, offset: u16) -> Result<usize> {
        metadata_offset(&self.positions, start_block, offset)
    }
}

/// Read and decompress the table stored on disk in `[start, end)`
pub(crate) fn read_table<D: BlockDevice>(
    disk: &Disk<D>,
    decompressor: &dyn Decompressor,
    start: u64,
    end: u64,
) -> Result<Table> {
    let table_size = end
        .checked_sub(start)
        .filter(|&size| size > 0)
        .ok_or_else(|| Error::format(format!("invalid table bounds {start:#x}..{end:#x}")))?;

    let raw = disk.read_range(start, table_size)?;
    let raw = raw.data();

    let count = count_metablks(raw, table_size)?;
    let positions = metablk_positions(raw, count)?;
    let capacity = count
        .checked_mul(METADATA_BLOCK_SIZE)
        .ok_or_else(|| Error::format("metadata table too large"))?;
    let mut data = alloc_zeroed(capacity)?;

    let mut src_offset = 0usize;
    let mut filled = 0usize;
    for (j, slot) in data.chunks_exact_mut(METADATA_BLOCK_SIZE).enumerate() {
        let header = read_metablock(raw, src_offset)?;
        let payload_start = src_offset + METADATA_HEADER_SIZE;
        let payload = raw
            .get(payload_start..payload_start + header.size as usize)
            .ok_or_else(|| Error::format("truncated metadata block"))?;

        let len = if header.compressed {
            decompressor.decompress(slot, payload)?
        } else {
            slot[..payload.len()].copy_from_slice(payload);
            payload.len()
        };
        trace!(
            block = j,
            compressed = header.compressed,
            disk_size = header.size,
            len,
            "metadata block"
        );

        filled = j * METADATA_BLOCK_SIZE + len;
        src_offset += header.disk_size() as usize;
    }

    data.truncate(filled);
    Ok(Table { data, positions })
}

/// Read and decompress the single metadata block starting at byte `offset` of the partition
pub(crate) fn read_single_metablock<D: BlockDevice>(
    disk: &Disk<D>,
    decompressor: &dyn Decompressor,
    offset: u64,
) -> Result<Vec<u8>> {
    let header_bytes = disk.read_range(offset, METADATA_HEADER_SIZE as u64)?;
    let header = read_metablock(header_bytes.data(), 0)?;

    let raw = disk.read_range(offset, header.disk_size() as u64)?;
    let payload = raw
        .data()
        .get(METADATA_HEADER_SIZE..header.disk_size() as usize)
        .ok_or_else(|| Error::format("truncated metadata block"))?;

    let mut block = alloc_zeroed(METADATA_BLOCK_SIZE)?;
    let len = if header.compressed {
        decompressor.decompress(&mut block, payload)?
    } else {
        block[..payload.len()].copy_from_slice(payload);
        payload.len()
    };
    block.truncate(len);
    Ok(block)
}
