//! Fragment table lookup.
//!
//! The fragment table is a list of 16-byte entries stored in metadata blocks,
//! 512 per block. The superblock points to an array of 64-bit disk offsets, one
//! per metadata block of entries.

use tracing::trace;
use zerocopy::little_endian::U64;

use crate::{
    Decompressor, Error, Result,
    disk::{BlockDevice, Disk},
    metadata::read_single_metablock,
    structs::{
        BLOCK_SIZE_MASK, BLOCK_UNCOMPRESSED_BIT, FRAGMENT_ENTRIES_PER_BLOCK, FragmentEntry,
        Superblock, read_struct,
    },
};

/// Start sentinel of a fragment entry which was never written
const INVALID_FRAGMENT_START: u64 = 0x7FFF_FFFF;

/// Location of a fragment block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Fragment {
    pub(crate) start: u64,
    /// Bytes taken on disk
    pub(crate) disk_size: u32,
    /// Whether the fragment block (not the metadata holding its entry) is compressed
    pub(crate) compressed: bool,
}

impl Fragment {
    fn from_entry(index: u32, entry: &FragmentEntry) -> Result<Self> {
        let start = entry.start.get();
        let size = entry.size.get();
        let disk_size = size & BLOCK_SIZE_MASK;
        if start == INVALID_FRAGMENT_START || disk_size < 1 {
            return Err(Error::InvalidFragment(index));
        }

        Ok(Self {
            start,
            disk_size,
            compressed: size & BLOCK_UNCOMPRESSED_BIT == 0,
        })
    }
}

/// Locate the fragment block numbered `index`
pub(crate) fn fragment_lookup<D: BlockDevice>(
    disk: &Disk<D>,
    decompressor: &dyn Decompressor,
    superblock: &Superblock,
    index: u32,
) -> Result<Fragment> {
    let fragment_count = superblock.frag_count.get();
    if index >= fragment_count {
        return Err(Error::InvalidFragment(index));
    }

    let block = index / FRAGMENT_ENTRIES_PER_BLOCK;
    let offset = index % FRAGMENT_ENTRIES_PER_BLOCK;

    let pointer_count = fragment_count.div_ceil(FRAGMENT_ENTRIES_PER_BLOCK) as u64;
    let pointers = disk.read_range(
        superblock.frag_table.get(),
        pointer_count * size_of::<U64>() as u64,
    )?;
    let pointer: U64 = read_struct(pointers.data(), block as usize * size_of::<U64>())?;

    let entries = read_single_metablock(disk, decompressor, pointer.get())?;
    let entry: FragmentEntry =
        read_struct(&entries, offset as usize * size_of::<FragmentEntry>())?;
    trace!(
        index,
        start = entry.start.get(),
        size = entry.size.get(),
        "fragment entry"
    );

    Fragment::from_entry(index, &entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(start: u64, size: u32) -> FragmentEntry {
        FragmentEntry {
            start: start.into(),
            size: size.into(),
            _unused: 0.into(),
        }
    }

    #[test]
    fn compressed_flag_comes_from_the_size_word() {
        let compressed = Fragment::from_entry(0, &entry(96, 1200)).unwrap();
        assert!(compressed.compressed);
        assert_eq!(compressed.disk_size, 1200);

        let raw = Fragment::from_entry(0, &entry(96, 1200 | BLOCK_UNCOMPRESSED_BIT)).unwrap();
        assert!(!raw.compressed);
        assert_eq!(raw.disk_size, 1200);
    }

    #[test]
    fn sentinel_entries_are_invalid() {
        assert!(matches!(
            Fragment::from_entry(4, &entry(INVALID_FRAGMENT_START, 10)),
            Err(Error::InvalidFragment(4))
        ));
        assert!(matches!(
            Fragment::from_entry(5, &entry(96, 0)),
            Err(Error::InvalidFragment(5))
        ));
        assert!(matches!(
            Fragment::from_entry(6, &entry(96, BLOCK_UNCOMPRESSED_BIT)),
            Err(Error::InvalidFragment(6))
        ));
    }
}
