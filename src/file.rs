//! Regular file content: data blocks, sparse blocks and fragment tails.

use tracing::{trace, warn};

use crate::{
    Decompressor, Error, Result,
    disk::{BlockDevice, Disk, alloc_zeroed},
    fragment::{Fragment, fragment_lookup},
    inode::RegInfo,
    structs::{BLOCK_SIZE_MASK, BLOCK_UNCOMPRESSED_BIT, Superblock},
};

/// What is needed to assemble the content of a regular file
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FileInfo {
    pub(crate) size: u64,
    /// Offset of the tail within its fragment block
    pub(crate) offset: u32,
    /// On-disk location of the first data block
    pub(crate) start: u64,
    pub(crate) fragment: Option<u32>,
    pub(crate) block_sizes: Vec<u32>,
}

impl From<&RegInfo> for FileInfo {
    fn from(reg: &RegInfo) -> Self {
        Self {
            size: reg.file_size,
            offset: reg.frag_offset,
            start: reg.start_block,
            fragment: reg.is_fragmented().then_some(reg.fragment),
            block_sizes: reg.block_sizes.clone(),
        }
    }
}

impl FileInfo {
    /// Bytes of block `index` that belong to the file
    fn expected_block_len(&self, index: usize, block_size: u32) -> u64 {
        let consumed = index as u64 * block_size as u64;
        self.size.saturating_sub(consumed).min(block_size as u64)
    }

    /// Bytes of the file stored in its fragment
    fn tail_len(&self, block_size: u32) -> u64 {
        self.size
            .saturating_sub(self.block_sizes.len() as u64 * block_size as u64)
    }
}

/// Reads the data of one file for a single [crate::SquashFs::read] call
pub(crate) struct FileReader<'a, D: BlockDevice> {
    pub(crate) disk: &'a Disk<D>,
    pub(crate) decompressor: &'a dyn Decompressor,
    pub(crate) superblock: &'a Superblock,
}

impl<D: BlockDevice> FileReader<'_, D> {
    fn block_size(&self) -> u32 {
        self.superblock.block_size.get()
    }

    /// Copy the first `len` bytes of the file into `buf`, which must be large enough.
    /// Returns the number of bytes written, always `len`
    pub(crate) fn read(&self, info: &FileInfo, buf: &mut [u8], len: u64) -> Result<usize> {
        let too_small = Error::BufferTooSmall {
            needed: len,
            available: buf.len(),
        };
        let Some(buf) = usize::try_from(len).ok().and_then(|len| buf.get_mut(..len)) else {
            return Err(too_small);
        };
        let len = buf.len();
        if len == 0 {
            return Ok(0);
        }

        let block_size = self.block_size();
        let mut scratch = Vec::new();
        let mut data_offset = info.start;
        let mut pos = 0usize;

        for (j, &word) in info.block_sizes.iter().enumerate() {
            let expected = info.expected_block_len(j, block_size) as usize;
            if expected == 0 {
                warn!(block = j, size = info.size, "too many data blocks");
                return Err(Error::format(format!(
                    "data block {j} lies past the end of a {} byte file",
                    info.size
                )));
            }
            let wanted = expected.min(len - pos);
            let out = &mut buf[pos..pos + wanted];

            let disk_size = word & BLOCK_SIZE_MASK;
            if word == 0 {
                // sparse block, nothing stored on disk
                out.fill(0);
                trace!(block = j, len = wanted, "sparse block");
            } else {
                if disk_size > block_size {
                    warn!(block = j, disk_size, block_size, "too many data blocks");
                    return Err(Error::format(format!(
                        "data block {j} is {disk_size} bytes on disk, more than the {block_size} byte block size"
                    )));
                }
                if scratch.is_empty() {
                    scratch = alloc_zeroed(block_size as usize)?;
                }
                let compressed = word & BLOCK_UNCOMPRESSED_BIT == 0;
                let produced = self.read_block(data_offset, disk_size, compressed, &mut scratch)?;
                if produced != expected {
                    return Err(Error::format(format!(
                        "data block {j} holds {produced} bytes, {expected} expected"
                    )));
                }
                out.copy_from_slice(&scratch[..wanted]);
                trace!(block = j, disk_size, compressed, "data block");
            }

            data_offset += disk_size as u64;
            pos += wanted;
            if pos >= len {
                return Ok(pos);
            }
        }

        let Some(index) = info.fragment else {
            if pos < len {
                return Err(Error::format(format!(
                    "file data ends after {pos} bytes, {len} expected"
                )));
            }
            return Ok(pos);
        };

        let fragment = fragment_lookup(self.disk, self.decompressor, self.superblock, index)?;
        pos += self.read_tail(info, &fragment, &mut buf[pos..])?;
        Ok(pos)
    }

    /// Copy the part of the file stored in `fragment` into `out`, as far as it fits
    fn read_tail(&self, info: &FileInfo, fragment: &Fragment, out: &mut [u8]) -> Result<usize> {
        let block_size = self.block_size();
        if fragment.disk_size > block_size {
            return Err(Error::InvalidFragment(info.fragment.unwrap_or_default()));
        }

        let mut block = alloc_zeroed(block_size as usize)?;
        let produced = self.read_block(
            fragment.start,
            fragment.disk_size,
            fragment.compressed,
            &mut block,
        )?;

        let tail_len = info.tail_len(block_size) as usize;
        let start = info.offset as usize;
        let tail = block[..produced]
            .get(start..start + tail_len)
            .ok_or_else(|| {
                Error::format(format!(
                    "fragment tail {start}..{} outside of a {produced} byte fragment block",
                    start + tail_len
                ))
            })?;

        let wanted = tail_len.min(out.len());
        out[..wanted].copy_from_slice(&tail[..wanted]);
        trace!(start, len = wanted, "fragment tail");
        Ok(wanted)
    }

    /// Read the block stored on disk at `[offset, offset + disk_size)` into `dst`,
    /// decompressing it when needed. Returns the uncompressed length
    fn read_block(
        &self,
        offset: u64,
        disk_size: u32,
        compressed: bool,
        dst: &mut [u8],
    ) -> Result<usize> {
        let raw = self.disk.read_range(offset, disk_size as u64)?;
        let raw = raw
            .data()
            .get(..disk_size as usize)
            .ok_or_else(|| Error::format("truncated data block"))?;

        if compressed {
            self.decompressor.decompress(dst, raw)
        } else {
            let dst = dst
                .get_mut(..raw.len())
                .ok_or_else(|| Error::format("uncompressed block larger than the block size"))?;
            dst.copy_from_slice(raw);
            Ok(raw.len())
        }
    }
}
