//! This file defines data structures used by the squashfs file format

use bitflags::bitflags;
use zerocopy::{
    FromBytes, Immutable, KnownLayout, TryFromBytes,
    little_endian::{I16, U16, U32, U64},
};

use crate::{Error, Result};

/// "hsqs" read as a little-endian u32
pub(crate) const SQUASHFS_MAGIC: u32 = 0x7371_7368;

/// Every metadata block starts with a 16-bit header
pub(crate) const METADATA_HEADER_SIZE: usize = 2;

/// Metadata blocks decompress to at most 8KiB
pub(crate) const METADATA_BLOCK_SIZE: usize = 8192;

/// Bit 15 of a metadata block header is set when the payload is stored uncompressed
pub(crate) const METADATA_UNCOMPRESSED_BIT: u16 = 1 << 15;

/// Bit 24 of a data or fragment block size word is set when the block is stored uncompressed
pub(crate) const BLOCK_UNCOMPRESSED_BIT: u32 = 1 << 24;

/// Mask giving the on-disk byte length of a data or fragment block
pub(crate) const BLOCK_SIZE_MASK: u32 = BLOCK_UNCOMPRESSED_BIT - 1;

/// Fragment index stored in regular file inodes which do not end in a fragment
pub(crate) const NO_FRAGMENT: u32 = 0xFFFF_FFFF;

/// Fragment block entries are 16 bytes, so a metadata block holds 512 of them
pub(crate) const FRAGMENT_ENTRIES_PER_BLOCK: u32 =
    (METADATA_BLOCK_SIZE / size_of::<FragmentEntry>()) as u32;

/// Directory `file_size` value of a directory without any entry.
/// The kernel accounts 3 extra bytes for the "." and ".." entries it synthesizes.
pub(crate) const EMPTY_DIR_FILE_SIZE: u32 = 3;

/// The superblock is the first section of a SquashFS archive.
/// It is always 96 bytes in size and contains important information about the archive, including the locations of other sections.
#[repr(C)]
#[derive(Debug, Clone, KnownLayout, FromBytes)]
pub(crate) struct Superblock {
    /// Magic number, must be equal to [SQUASHFS_MAGIC]
    pub(crate) magic: U32,
    /// The number of inodes stored in the archive.
    pub(crate) inode_count: U32,
    /// Last modification time of the archive. Count seconds since 00:00, Jan 1st 1970 UTC
    pub(crate) mod_time: U32,
    /// The size of a data block in bytes. Must be a power of two between 4096 (4k) and 1048576 (1 MiB)
    pub(crate) block_size: U32,
    /// The number of entries in the fragment table.
    pub(crate) frag_count: U32,
    /// See [CompressorType]
    pub(crate) compressor: U16,
    /// The log2 of the block size. If the two fields do not agree, the archive is considered corrupted.
    pub(crate) block_log: U16,
    /// See [SuperblockFlags]
    pub(crate) flags: U16,
    /// The number of entries in the ID lookup table.
    pub(crate) id_count: U16,
    /// Major version of the format. Must be set to 4.
    pub(crate) version_major: U16,
    /// Minor version of the format. Must be set to 0.
    pub(crate) version_minor: U16,
    /// A reference to the inode of the root directory.
    pub(crate) root_inode: U64,
    /// The number of bytes used by the archive.
    pub(crate) bytes_used: U64,
    /// The byte offset at which the id table starts.
    pub(crate) id_table: U64,
    /// The byte offset at which the xattr id table starts.
    pub(crate) xattr_table: U64,
    /// The byte offset at which the inode table starts.
    pub(crate) inode_table: U64,
    /// The byte offset at which the directory table starts.
    pub(crate) dir_table: U64,
    /// The byte offset at which the fragment table starts.
    pub(crate) frag_table: U64,
    /// The byte offset at which the export table starts.
    pub(crate) export_table: U64,
}

const _: () = {
    assert!(size_of::<Superblock>() == 96);
};

/// An ID designating the compressor used for both data and meta data blocks
#[repr(u16)]
#[derive(Debug, Clone, Copy, KnownLayout, TryFromBytes)]
#[allow(unused)] // variants are only built through TryFromBytes
pub(crate) enum CompressorType {
    Gzip = 1,
    Lzma,
    Lzo,
    Xz,
    Lz4,
    Zstd,
}

/// Flags containing properties of the squashfs system.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperblockFlags(u16);

bitflags! {
    impl SuperblockFlags : u16 {
        /// Inodes are stored uncompressed.
        const INODES_UNCOMPRESSED = 0x0001;
        /// Data blocks are stored uncompressed.
        const DATA_BLOCKS_UNCOMPRESSED = 0x0002;
        /// Fragments are stored uncompressed.
        const FRAGMENTS_UNCOMPRESSED = 0x0008;
        /// Fragments are not used.
        const FRAGMENTS_UNUSED = 0x0010;
        /// Fragments are always generated.
        const FRAGMENTS_ALWAYS = 0x0020;
        /// Data has been deduplicated.
        const DATA_DEDUPLICATED = 0x0040;
        /// NFS export table exists.
        const NFS_EXPORT_EXISTS = 0x0080;
        /// Xattrs are stored uncompressed.
        const XATTRS_UNCOMPRESSED = 0x0100;
        /// There are no Xattrs in the archive.
        const XATTRS_MISSING = 0x0200;
        ///  Compressor options are present.
        const COMPRESSOR_OPTIONS = 0x0400;
        /// The ID table is uncompressed.
        const ID_TABLE_UNCOMPRESSED = 0x0800;
    }
}

/// Type tag found at the start of every inode and in every directory entry
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, KnownLayout, TryFromBytes)]
#[allow(unused)] // variants are only built through TryFromBytes
pub(crate) enum InodeType {
    Dir = 1,
    Reg,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
    LDir,
    LReg,
    LSymlink,
    LBlockDevice,
    LCharDevice,
    LFifo,
    LSocket,
}

impl InodeType {
    pub(crate) fn is_dir(self) -> bool {
        matches!(self, Self::Dir | Self::LDir)
    }
}

/// Fields shared by every inode
#[repr(C)]
#[derive(Debug, Clone, FromBytes)]
pub(crate) struct InodeHeader {
    pub(crate) ty: U16,
    pub(crate) permissions: U16,
    pub(crate) uid: U16,
    pub(crate) gid: U16,
    pub(crate) mtime: U32,
    pub(crate) inode_number: U32,
}

#[repr(C)]
#[derive(Debug, Clone, FromBytes)]
pub(crate) struct DirInode {
    pub(crate) block_index: U32,
    pub(crate) link_count: U32,
    pub(crate) file_size: U16,
    pub(crate) block_offset: U16,
    pub(crate) parent_inode: U32,
}

#[repr(C)]
#[derive(Debug, Clone, FromBytes)]
pub(crate) struct LDirInode {
    pub(crate) link_count: U32,
    pub(crate) file_size: U32,
    pub(crate) block_index: U32,
    pub(crate) parent_inode: U32,
    pub(crate) index_count: U16,
    pub(crate) block_offset: U16,
    pub(crate) xattr_index: U32,
}

/// Index record trailing an extended directory inode, followed by `name_size + 1` name bytes
#[repr(C)]
#[derive(Debug, Clone, FromBytes)]
pub(crate) struct DirectoryIndex {
    /// This stores a byte offset from the first directory header to the current header,
    /// as if the uncompressed directory metadata blocks were laid out in memory consecutively.
    pub(crate) index: U32,
    /// Start offset of a directory table metadata block, relative to the directory table start.
    pub(crate) start: U32,
    /// One less than the size of the entry name.
    pub(crate) name_size: U32,
}

#[repr(C)]
#[derive(Debug, Clone, FromBytes)]
pub(crate) struct RegInode {
    pub(crate) block_index: U32,
    pub(crate) frag_index: U32,
    pub(crate) frag_offset: U32,
    pub(crate) file_size: U32,
}

#[repr(C)]
#[derive(Debug, Clone, FromBytes)]
pub(crate) struct LRegInode {
    pub(crate) block_index: U64,
    pub(crate) file_size: U64,
    pub(crate) sparse: U64,
    pub(crate) link_count: U32,
    pub(crate) frag_index: U32,
    pub(crate) frag_offset: U32,
    pub(crate) xattr_index: U32,
}

/// Shared by basic and extended symlinks. The extended one stores an xattr index after the target.
#[repr(C)]
#[derive(Debug, Clone, FromBytes)]
pub(crate) struct SymlinkInode {
    pub(crate) link_count: U32,
    pub(crate) target_size: U32,
}

#[repr(C)]
#[derive(Debug, Clone, FromBytes)]
pub(crate) struct DevInode {
    pub(crate) link_count: U32,
    pub(crate) rdev: U32,
}

#[repr(C)]
#[derive(Debug, Clone, FromBytes)]
pub(crate) struct LDevInode {
    pub(crate) link_count: U32,
    pub(crate) rdev: U32,
    pub(crate) xattr_index: U32,
}

#[repr(C)]
#[derive(Debug, Clone, FromBytes)]
pub(crate) struct IpcInode {
    pub(crate) link_count: U32,
}

#[repr(C)]
#[derive(Debug, Clone, FromBytes)]
pub(crate) struct LIpcInode {
    pub(crate) link_count: U32,
    pub(crate) xattr_index: U32,
}

#[repr(C)]
#[derive(Debug, Clone, FromBytes)]
pub(crate) struct DirectoryHeader {
    /// One less than the number of entries following the header
    pub(crate) count: U32,
    /// Start of the inode table metadata block holding the inodes of the entries
    pub(crate) start: U32,
    pub(crate) inode_number: U32,
}

#[repr(C)]
#[derive(Debug, Clone, FromBytes)]
pub(crate) struct DirectoryEntry {
    pub(crate) offset: U16,
    pub(crate) inode_offset: I16,
    pub(crate) ty: U16,
    pub(crate) name_size: U16,
}

#[repr(C)]
#[derive(Debug, FromBytes, KnownLayout, Immutable, Clone, Copy)]
pub(crate) struct FragmentEntry {
    /// The offset within the archive where the fragment block starts
    pub(crate) start: U64,
    /// The on-disk size of the fragment block. If the block is uncompressed, bit 24 (i.e. 1 << 24) is set.
    pub(crate) size: U32,
    pub(crate) _unused: U32,
}

const _: () = {
    assert!(size_of::<InodeHeader>() == 16);
    assert!(size_of::<InodeHeader>() + size_of::<DirInode>() == 32);
    assert!(size_of::<InodeHeader>() + size_of::<LDirInode>() == 40);
    assert!(size_of::<InodeHeader>() + size_of::<RegInode>() == 32);
    assert!(size_of::<InodeHeader>() + size_of::<LRegInode>() == 56);
    assert!(size_of::<DirectoryHeader>() == 12);
    assert!(size_of::<DirectoryEntry>() == 8);
    assert!(size_of::<FragmentEntry>() == 16);
};

/// Copy the fixed-size structure `T` found at `offset` in `bytes`
pub(crate) fn read_struct<T: FromBytes>(bytes: &[u8], offset: usize) -> Result<T> {
    bytes
        .get(offset..)
        .and_then(|tail| T::read_from_prefix(tail).ok())
        .map(|(value, _)| value)
        .ok_or_else(|| {
            Error::format(format!(
                "truncated {} at offset {offset}",
                std::any::type_name::<T>().rsplit("::").next().unwrap_or("record")
            ))
        })
}
