//! Inode records of the decompressed inode table.
//!
//! Inodes are variable-length and carry no total length field: the size of a
//! record follows from its type tag plus, depending on the type, the file size
//! (block list), the symlink target length or the directory index entries.
//! Locating an inode by number is therefore a linear walk from the start of the
//! table. Nothing is cached between lookups.

use zerocopy::{IntoBytes, TryFromBytes};

use crate::{
    Error, Result,
    structs::{
        DevInode, DirInode, DirectoryIndex, InodeHeader, InodeType, IpcInode, LDevInode,
        LDirInode, LIpcInode, LRegInode, NO_FRAGMENT, RegInode, SymlinkInode, read_struct,
    },
};

const HEADER_SIZE: usize = size_of::<InodeHeader>();

/// Directory inode fields, basic or extended
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DirInfo {
    /// Start of the directory table metadata block holding the listing
    pub(crate) start_block: u32,
    /// Offset of the listing within that block once decompressed
    pub(crate) offset: u16,
    /// Listing size in bytes, headers included, plus 3
    pub(crate) file_size: u32,
}

/// Directory index entry of an extended directory, one per directory header
/// except the first
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DirIndexEntry {
    /// Byte offset of the header from the start of the listing
    pub(crate) index: u32,
    /// Start of the directory table metadata block holding the header
    pub(crate) start: u32,
    /// Name of the first entry following the header
    pub(crate) name: Vec<u8>,
}

/// Regular file inode fields, basic or extended
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RegInfo {
    /// On-disk location of the first data block
    pub(crate) start_block: u64,
    pub(crate) file_size: u64,
    /// Index in the fragment table, [NO_FRAGMENT] if the file has no tail in a fragment
    pub(crate) fragment: u32,
    /// Offset of the file tail within its fragment block
    pub(crate) frag_offset: u32,
    /// Size word (on-disk length and uncompressed flag) of each data block
    pub(crate) block_sizes: Vec<u32>,
}

impl RegInfo {
    pub(crate) fn is_fragmented(&self) -> bool {
        self.fragment != NO_FRAGMENT
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InodeKind {
    Dir(DirInfo),
    LDir {
        dir: DirInfo,
        index: Vec<DirIndexEntry>,
    },
    Reg(RegInfo),
    LReg(RegInfo),
    Symlink {
        target: Vec<u8>,
    },
    LSymlink {
        target: Vec<u8>,
    },
    BlockDevice,
    CharDevice,
    LBlockDevice,
    LCharDevice,
    Fifo,
    Socket,
    LFifo,
    LSocket,
}

/// A decoded inode record
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Inode {
    pub(crate) inode_number: u32,
    pub(crate) permissions: u16,
    pub(crate) mtime: u32,
    pub(crate) kind: InodeKind,
}

impl Inode {
    pub(crate) fn dir_info(&self) -> Option<&DirInfo> {
        match &self.kind {
            InodeKind::Dir(dir) | InodeKind::LDir { dir, .. } => Some(dir),
            _ => None,
        }
    }

    pub(crate) fn is_dir(&self) -> bool {
        self.dir_info().is_some()
    }

    pub(crate) fn reg_info(&self) -> Option<&RegInfo> {
        match &self.kind {
            InodeKind::Reg(reg) | InodeKind::LReg(reg) => Some(reg),
            _ => None,
        }
    }

    pub(crate) fn symlink_target(&self) -> Option<&[u8]> {
        match &self.kind {
            InodeKind::Symlink { target } | InodeKind::LSymlink { target } => Some(target),
            _ => None,
        }
    }

    /// Decode the inode starting at `offset` in the inode table, copying its variable-length
    /// tail (block list, symlink target, directory index) into owned buffers
    pub(crate) fn read(table: &[u8], offset: usize, block_size: u32) -> Result<Self> {
        let header: InodeHeader = read_struct(table, offset)?;
        let ty = inode_type(&header)?;
        let body = offset + HEADER_SIZE;

        let kind = match ty {
            InodeType::Dir => {
                let raw: DirInode = read_struct(table, body)?;
                InodeKind::Dir(DirInfo {
                    start_block: raw.block_index.get(),
                    offset: raw.block_offset.get(),
                    file_size: raw.file_size.get().into(),
                })
            }
            InodeType::LDir => {
                let raw: LDirInode = read_struct(table, body)?;
                let mut index = Vec::new();
                let mut pos = body + size_of::<LDirInode>();
                for _ in 0..raw.index_count.get() {
                    let entry: DirectoryIndex = read_struct(table, pos)?;
                    let name_start = pos + size_of::<DirectoryIndex>();
                    let name_len = entry.name_size.get() as usize + 1;
                    let name = table
                        .get(name_start..name_start + name_len)
                        .ok_or_else(|| Error::format("truncated directory index"))?;
                    index.push(DirIndexEntry {
                        index: entry.index.get(),
                        start: entry.start.get(),
                        name: name.to_vec(),
                    });
                    pos = name_start + name_len;
                }
                InodeKind::LDir {
                    dir: DirInfo {
                        start_block: raw.block_index.get(),
                        offset: raw.block_offset.get(),
                        file_size: raw.file_size.get(),
                    },
                    index,
                }
            }
            InodeType::Reg => {
                let raw: RegInode = read_struct(table, body)?;
                let fragment = raw.frag_index.get();
                let file_size = raw.file_size.get().into();
                let blocks = block_count(file_size, block_size, fragment != NO_FRAGMENT);
                let block_sizes = read_block_list(table, body + size_of::<RegInode>(), blocks)?;
                InodeKind::Reg(RegInfo {
                    start_block: raw.block_index.get().into(),
                    file_size,
                    fragment,
                    frag_offset: raw.frag_offset.get(),
                    block_sizes,
                })
            }
            InodeType::LReg => {
                let raw: LRegInode = read_struct(table, body)?;
                let fragment = raw.frag_index.get();
                let file_size = raw.file_size.get();
                let blocks = block_count(file_size, block_size, fragment != NO_FRAGMENT);
                let block_sizes = read_block_list(table, body + size_of::<LRegInode>(), blocks)?;
                InodeKind::LReg(RegInfo {
                    start_block: raw.block_index.get(),
                    file_size,
                    fragment,
                    frag_offset: raw.frag_offset.get(),
                    block_sizes,
                })
            }
            InodeType::Symlink | InodeType::LSymlink => {
                let raw: SymlinkInode = read_struct(table, body)?;
                let target_start = body + size_of::<SymlinkInode>();
                let target = table
                    .get(target_start..target_start + raw.target_size.get() as usize)
                    .ok_or_else(|| Error::format("truncated symlink target"))?
                    .to_vec();
                if ty == InodeType::Symlink {
                    InodeKind::Symlink { target }
                } else {
                    InodeKind::LSymlink { target }
                }
            }
            InodeType::BlockDevice | InodeType::CharDevice => {
                read_struct::<DevInode>(table, body)?;
                if ty == InodeType::BlockDevice {
                    InodeKind::BlockDevice
                } else {
                    InodeKind::CharDevice
                }
            }
            InodeType::LBlockDevice | InodeType::LCharDevice => {
                read_struct::<LDevInode>(table, body)?;
                if ty == InodeType::LBlockDevice {
                    InodeKind::LBlockDevice
                } else {
                    InodeKind::LCharDevice
                }
            }
            InodeType::Fifo | InodeType::Socket => {
                read_struct::<IpcInode>(table, body)?;
                if ty == InodeType::Fifo {
                    InodeKind::Fifo
                } else {
                    InodeKind::Socket
                }
            }
            InodeType::LFifo | InodeType::LSocket => {
                read_struct::<LIpcInode>(table, body)?;
                if ty == InodeType::LFifo {
                    InodeKind::LFifo
                } else {
                    InodeKind::LSocket
                }
            }
        };

        Ok(Self {
            inode_number: header.inode_number.get(),
            permissions: header.permissions.get(),
            mtime: header.mtime.get(),
            kind,
        })
    }
}

fn inode_type(header: &InodeHeader) -> Result<InodeType> {
    InodeType::try_read_from_bytes(header.ty.as_bytes())
        .map_err(|_| Error::UnknownInodeType(header.ty.get()))
}

fn read_block_list(table: &[u8], offset: usize, count: u64) -> Result<Vec<u32>> {
    let len = usize::try_from(count)
        .ok()
        .and_then(|count| count.checked_mul(size_of::<u32>()))
        .ok_or_else(|| Error::format("block list too large"))?;
    let bytes = table
        .get(offset..)
        .and_then(|tail| tail.get(..len))
        .ok_or_else(|| Error::format("truncated block list"))?;
    Ok(bytes
        .chunks_exact(size_of::<u32>())
        .map(|word| u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
        .collect())
}

/// Number of full data blocks of a regular file. When the file ends in a fragment, the
/// trailing partial block lives there and is not part of the block list
pub(crate) fn block_count(file_size: u64, block_size: u32, fragmented: bool) -> u64 {
    let block_size = block_size as u64;
    if fragmented {
        file_size / block_size
    } else {
        file_size.div_ceil(block_size)
    }
}

/// Size in bytes of the inode record starting at `offset` in the inode table
pub(crate) fn inode_record_size(table: &[u8], offset: usize, block_size: u32) -> Result<usize> {
    let header: InodeHeader = read_struct(table, offset)?;
    let body = offset + HEADER_SIZE;

    let size = match inode_type(&header)? {
        InodeType::Dir => HEADER_SIZE + size_of::<DirInode>(),
        InodeType::LDir => {
            let raw: LDirInode = read_struct(table, body)?;
            // Each index entry is followed by its name, whose length is only known
            // once the entry has been read
            let mut index_list_size = 0;
            let mut pos = body + size_of::<LDirInode>();
            for _ in 0..raw.index_count.get() {
                let entry: DirectoryIndex = read_struct(table, pos)?;
                let entry_size = size_of::<DirectoryIndex>() + entry.name_size.get() as usize + 1;
                index_list_size += entry_size;
                pos += entry_size;
            }
            HEADER_SIZE + size_of::<LDirInode>() + index_list_size
        }
        InodeType::Reg => {
            let raw: RegInode = read_struct(table, body)?;
            let blocks = block_count(
                raw.file_size.get().into(),
                block_size,
                raw.frag_index.get() != NO_FRAGMENT,
            );
            HEADER_SIZE + size_of::<RegInode>() + block_list_size(blocks)?
        }
        InodeType::LReg => {
            let raw: LRegInode = read_struct(table, body)?;
            let blocks = block_count(
                raw.file_size.get(),
                block_size,
                raw.frag_index.get() != NO_FRAGMENT,
            );
            HEADER_SIZE + size_of::<LRegInode>() + block_list_size(blocks)?
        }
        InodeType::Symlink => {
            let raw: SymlinkInode = read_struct(table, body)?;
            HEADER_SIZE + size_of::<SymlinkInode>() + raw.target_size.get() as usize
        }
        InodeType::LSymlink => {
            let raw: SymlinkInode = read_struct(table, body)?;
            // trailing xattr index
            HEADER_SIZE + size_of::<SymlinkInode>() + raw.target_size.get() as usize + 4
        }
        InodeType::BlockDevice | InodeType::CharDevice => HEADER_SIZE + size_of::<DevInode>(),
        InodeType::LBlockDevice | InodeType::LCharDevice => HEADER_SIZE + size_of::<LDevInode>(),
        InodeType::Fifo | InodeType::Socket => HEADER_SIZE + size_of::<IpcInode>(),
        InodeType::LFifo | InodeType::LSocket => HEADER_SIZE + size_of::<LIpcInode>(),
    };
    Ok(size)
}

fn block_list_size(blocks: u64) -> Result<usize> {
    usize::try_from(blocks)
        .ok()
        .and_then(|blocks| blocks.checked_mul(size_of::<u32>()))
        .ok_or_else(|| Error::format("block list too large"))
}

/// Offset in the inode table of the inode numbered `inode_number`.
/// Walks at most `inode_count` records from the start of the table
pub(crate) fn find_inode(
    table: &[u8],
    inode_number: u32,
    inode_count: u32,
    block_size: u32,
) -> Result<usize> {
    let mut offset = 0usize;
    for _ in 0..inode_count {
        let header: InodeHeader = read_struct(table, offset)?;
        if header.inode_number.get() == inode_number {
            return Ok(offset);
        }
        offset = offset
            .checked_add(inode_record_size(table, offset, block_size)?)
            .ok_or_else(|| Error::format("inode table overflow"))?;
    }

    Err(Error::InodeNotFound(inode_number))
}
