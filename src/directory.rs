//! Directory listings of the decompressed directory table.
//!
//! A listing is a run of directory headers, each followed by up to 256 entries.
//! Entries store their inode number as a signed delta from the header and their
//! name inline. The listing size declared by the directory inode includes 3
//! extra bytes, so an empty directory has a size of 3.

use std::{
    fmt,
    time::{Duration, SystemTime},
};

use tracing::{debug, trace};
use zerocopy::TryFromBytes;

use crate::{
    Decompressor, Error, Result,
    disk::{BlockDevice, Disk},
    inode::{DirInfo, Inode, InodeKind, find_inode},
    metadata::{Table, metadata_offset, read_table},
    structs::{
        DirectoryEntry, DirectoryHeader, EMPTY_DIR_FILE_SIZE, InodeType, METADATA_BLOCK_SIZE,
        Superblock, read_struct,
    },
};

const HEADER_SIZE: u32 = size_of::<DirectoryHeader>() as u32;
const ENTRY_BASE_SIZE: u32 = size_of::<DirectoryEntry>() as u32;

/// Longest raw name reported by [DirEntry::name]. Longer names are truncated
/// to this many bytes before the UTF-8 conversion, so a multi-byte character
/// cut at the limit shows up as a trailing U+FFFD
pub const MAX_NAME_LEN: usize = 255;

/// Offset in the directory table where the listing of `dir` starts
pub(crate) fn dir_offset(dir: &DirInfo, positions: &[u32]) -> Result<usize> {
    metadata_offset(positions, dir.start_block.into(), dir.offset)
}

/// Whether the inode type tag `ty` designates a basic or extended directory
pub(crate) fn is_dir(ty: u16) -> bool {
    InodeType::try_read_from_bytes(&ty.to_le_bytes()).is_ok_and(InodeType::is_dir)
}

pub(crate) fn is_empty_dir(dir: &DirInfo) -> bool {
    dir.file_size == EMPTY_DIR_FILE_SIZE
}

/// Inode and directory tables, decompressed for the duration of one operation
pub(crate) struct Tables {
    inodes: Table,
    dirs: Table,
    inode_count: u32,
    block_size: u32,
    root_block: u64,
    root_offset: u16,
}

impl Tables {
    pub(crate) fn load<D: BlockDevice>(
        disk: &Disk<D>,
        decompressor: &dyn Decompressor,
        superblock: &Superblock,
    ) -> Result<Self> {
        let inodes = read_table(
            disk,
            decompressor,
            superblock.inode_table.get(),
            superblock.dir_table.get(),
        )?;
        let dirs = read_table(
            disk,
            decompressor,
            superblock.dir_table.get(),
            superblock.frag_table.get(),
        )?;
        debug!(
            inode_table = inodes.data().len(),
            dir_table = dirs.data().len(),
            "tables loaded"
        );

        let root = superblock.root_inode.get();
        Ok(Self {
            inodes,
            dirs,
            inode_count: superblock.inode_count.get(),
            block_size: superblock.block_size.get(),
            root_block: root >> 16,
            root_offset: root as u16,
        })
    }

    pub(crate) fn root(&self) -> Result<Inode> {
        let offset = self.inodes.offset_of(self.root_block, self.root_offset)?;
        Inode::read(self.inodes.data(), offset, self.block_size)
    }

    pub(crate) fn inode(&self, inode_number: u32) -> Result<Inode> {
        let offset = find_inode(
            self.inodes.data(),
            inode_number,
            self.inode_count,
            self.block_size,
        )?;
        Inode::read(self.inodes.data(), offset, self.block_size)
    }

    /// Cursor over the listing of the directory `inode`
    pub(crate) fn listing(&self, inode: &Inode) -> Result<Listing> {
        let dir = inode
            .dir_info()
            .ok_or_else(|| Error::NotADirectory(format!("inode {}", inode.inode_number)))?;
        if dir.file_size <= EMPTY_DIR_FILE_SIZE {
            return Ok(Listing::exhausted());
        }
        let offset = dir_offset(dir, self.dirs.positions())?;

        let header: DirectoryHeader = read_struct(self.dirs.data(), offset)?;
        Ok(Listing {
            cursor: offset + HEADER_SIZE as usize,
            remaining: dir.file_size.saturating_sub(HEADER_SIZE),
            entry_count: entry_count(&header)?,
            base_inode: header.inode_number.get(),
        })
    }

    /// Decode the next entry of `listing`, `None` once the listing is exhausted
    pub(crate) fn next_entry(&self, listing: &mut Listing) -> Result<Option<RawEntry>> {
        let data = self.dirs.data();
        if listing.remaining == 0 {
            return Ok(None);
        }

        if listing.entry_count == 0 {
            // Another header follows unless only the 3 bytes of padding are left
            if listing.remaining <= HEADER_SIZE {
                listing.remaining = 0;
                return Ok(None);
            }
            listing.remaining -= HEADER_SIZE;
            if listing.remaining <= EMPTY_DIR_FILE_SIZE {
                listing.remaining = 0;
                return Ok(None);
            }

            let header: DirectoryHeader = read_struct(data, listing.cursor)?;
            listing.entry_count = entry_count(&header)?;
            listing.base_inode = header.inode_number.get();
            listing.cursor += HEADER_SIZE as usize;
            trace!(
                count = listing.entry_count,
                base = listing.base_inode,
                "directory header"
            );
        }

        let entry: DirectoryEntry = read_struct(data, listing.cursor)?;
        let name_start = listing.cursor + ENTRY_BASE_SIZE as usize;
        let name_len = entry.name_size.get() as usize + 1;
        let name = data
            .get(name_start..name_start + name_len)
            .ok_or_else(|| Error::format("truncated directory entry name"))?;

        let inode_number = u32::try_from(
            i64::from(listing.base_inode) + i64::from(entry.inode_offset.get()),
        )
        .map_err(|_| Error::format("directory entry inode number out of range"))?;

        let consumed = ENTRY_BASE_SIZE + name_len as u32;
        listing.entry_count -= 1;
        listing.remaining = listing.remaining.saturating_sub(consumed);
        listing.cursor = name_start + name_len;

        Ok(Some(RawEntry {
            name: name.to_vec(),
            ty: entry.ty.get(),
            inode_number,
        }))
    }

    /// Listing of `inode` starting at the header which may hold `name`.
    /// Extended directories index their headers by first name, so the scan can skip
    /// the headers sorting before it
    fn listing_for(&self, inode: &Inode, name: &[u8]) -> Result<Listing> {
        let InodeKind::LDir { dir, index } = &inode.kind else {
            return self.listing(inode);
        };
        let Some(entry) = index
            .iter()
            .take_while(|entry| entry.name.as_slice() <= name)
            .last()
        else {
            return self.listing(inode);
        };

        let remaining = dir
            .file_size
            .checked_sub(entry.index)
            .filter(|&remaining| remaining > HEADER_SIZE + EMPTY_DIR_FILE_SIZE)
            .ok_or_else(|| Error::format("directory index past the end of the listing"))?;
        let offset = u32::from(dir.offset)
            .checked_add(entry.index)
            .ok_or_else(|| Error::format("directory index offset overflow"))?
            % METADATA_BLOCK_SIZE as u32;
        let cursor = self.dirs.offset_of(entry.start.into(), offset as u16)?;
        trace!(index = entry.index, start = entry.start, "directory index");
        Ok(Listing {
            cursor,
            remaining,
            entry_count: 0,
            base_inode: 0,
        })
    }

    /// Scan the listing of `dir` for an entry named `name`
    pub(crate) fn find_entry(&self, dir: &Inode, name: &str) -> Result<Option<RawEntry>> {
        let mut listing = self.listing_for(dir, name.as_bytes())?;
        while let Some(entry) = self.next_entry(&mut listing)? {
            if entry.name == name.as_bytes() {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Full [DirEntry] for a raw entry, looking up its inode for the file size
    pub(crate) fn dir_entry(&self, raw: RawEntry) -> Result<DirEntry> {
        let inode = self.inode(raw.inode_number)?;
        let ty = EntryType::from_tag(raw.ty)?;
        let size = match ty {
            // Entries do not tell basic and extended files apart, the inode does
            EntryType::File => inode.reg_info().map_or(0, |reg| reg.file_size),
            _ => 0,
        };

        let mut name = raw.name;
        name.truncate(MAX_NAME_LEN);
        Ok(DirEntry {
            name: String::from_utf8_lossy(&name).into_owned(),
            ty,
            size,
            inode_number: raw.inode_number,
            permissions: inode.permissions,
            mtime: inode.mtime,
        })
    }
}

fn entry_count(header: &DirectoryHeader) -> Result<u32> {
    header
        .count
        .get()
        .checked_add(1)
        .ok_or_else(|| Error::format("invalid directory header count"))
}

/// Position within one directory listing
#[derive(Debug, Clone)]
pub(crate) struct Listing {
    /// Offset in the directory table of the next entry (or header)
    cursor: usize,
    /// Listing bytes not consumed yet, 3 bytes of padding included
    remaining: u32,
    /// Entries left under the current header
    entry_count: u32,
    base_inode: u32,
}

impl Listing {
    fn exhausted() -> Self {
        Self {
            cursor: 0,
            remaining: 0,
            entry_count: 0,
            base_inode: 0,
        }
    }
}

/// Directory entry as stored on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RawEntry {
    pub(crate) name: Vec<u8>,
    pub(crate) ty: u16,
    pub(crate) inode_number: u32,
}

/// Kind of object a directory entry points to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Directory,
    File,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl EntryType {
    fn from_tag(tag: u16) -> Result<Self> {
        let ty = InodeType::try_read_from_bytes(&tag.to_le_bytes())
            .map_err(|_| Error::UnknownInodeType(tag))?;
        Ok(match ty {
            InodeType::Dir | InodeType::LDir => Self::Directory,
            InodeType::Reg | InodeType::LReg => Self::File,
            InodeType::Symlink | InodeType::LSymlink => Self::Symlink,
            InodeType::BlockDevice | InodeType::LBlockDevice => Self::BlockDevice,
            InodeType::CharDevice | InodeType::LCharDevice => Self::CharDevice,
            InodeType::Fifo | InodeType::LFifo => Self::Fifo,
            InodeType::Socket | InodeType::LSocket => Self::Socket,
        })
    }
}

/// An entry returned by [DirStream::readdir]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    name: String,
    ty: EntryType,
    size: u64,
    inode_number: u32,
    permissions: u16,
    mtime: u32,
}

impl DirEntry {
    /// Entry name, built from at most [MAX_NAME_LEN] raw bytes
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file_type(&self) -> EntryType {
        self.ty
    }

    pub fn is_dir(&self) -> bool {
        self.ty == EntryType::Directory
    }

    pub fn is_file(&self) -> bool {
        self.ty == EntryType::File
    }

    pub fn is_symlink(&self) -> bool {
        self.ty == EntryType::Symlink
    }

    /// File size for regular files, 0 for anything else
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn inode_number(&self) -> u32 {
        self.inode_number
    }

    /// Permission bits of the entry
    pub fn permissions(&self) -> u16 {
        self.permissions
    }

    /// Return the last time the entry was modified
    pub fn modified(&self) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(self.mtime.into())
    }
}

/// Cursor over the entries of one directory.
///
/// The stream owns the tables it was opened with, dropping it releases them.
/// It can be consumed with [DirStream::readdir] or as an [Iterator].
pub struct DirStream {
    tables: Tables,
    listing: Listing,
}

impl DirStream {
    pub(crate) fn new(tables: Tables, listing: Listing) -> Self {
        Self { tables, listing }
    }

    /// Next entry of the directory, `None` at the end of the listing
    pub fn readdir(&mut self) -> Result<Option<DirEntry>> {
        let entry = match self.tables.next_entry(&mut self.listing) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Ok(None),
            Err(err) => {
                self.listing.remaining = 0;
                return Err(err);
            }
        };
        self.tables.dir_entry(entry).map(Some).inspect_err(|_| {
            self.listing.remaining = 0;
        })
    }
}

impl Iterator for DirStream {
    type Item = Result<DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.readdir().transpose()
    }
}

impl fmt::Debug for DirStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirStream")
            .field("listing", &self.listing)
            .finish_non_exhaustive()
    }
}
