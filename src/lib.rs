//! Sqfs_boot is a read-only SquashFS reader designed for bootloader-like environments:
//! the archive is read from a sector-addressed block device, nothing is cached between calls
//! and every operation works on a path.
//!
//! ## Features
//!
//! - **Pure Rust:** built on [`zerocopy`](https://crates.io/crates/zerocopy) for the on-disk structures.
//! - **zlib compression:** the only compression wired up, through [`flate2`](https://crates.io/crates/flate2).
//!   Other compressors are recognized and can be injected with [SquashFs::probe_with_decompressor].
//! - **Small memory footprint:** the inode and directory tables are decompressed for the duration of a
//!   call and freed afterwards, only the superblock stays in memory.
//! - **Symlinks:** symbolic links are followed, with a configurable bound on the number of links
//!   resolved per call.
//!
//! ## Example
//!
//! ```no_run
//! use sqfs_boot::SquashFs;
//!
//! fn main() -> sqfs_boot::Result<()> {
//!     let fs = SquashFs::from_path("rootfs.squashfs")?;
//!
//!     // List contents of root directory
//!     for entry in fs.opendir("/")? {
//!         let entry = entry?;
//!         println!("{} ({} bytes)", entry.name(), entry.size());
//!     }
//!
//!     // Read a whole file
//!     let size = fs.size("/boot/kernel.img")?;
//!     let mut kernel = vec![0u8; size as usize];
//!     fs.read("/boot/kernel.img", &mut kernel, 0, 0)?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Limitations
//!
//! - Reading at a nonzero offset is not supported, a read always starts at the beginning of the file.
//! - Extended attributes are ignored.
//!
//! ## Safety
//!
//! This crate is entirely written in safe Rust (it uses `#![forbid(unsafe_code)]`).

#![forbid(unsafe_code)]

use std::{
    fmt, fs,
    io::{Read, Seek},
    time::{Duration, SystemTime},
};

use directory::{Tables, is_dir, is_empty_dir};
use file::{FileInfo, FileReader};
use inode::Inode;
use path::{concat_tokens, resolve_symlink, split_path, tokenize};
use structs::{SQUASHFS_MAGIC, Superblock};
use tracing::{debug, warn};
use zerocopy::FromBytes;

mod decompression;
mod directory;
mod disk;
mod error;
mod file;
mod fragment;
mod inode;
mod metadata;
mod path;
mod structs;

pub use decompression::{Compression, Decompressor, ZlibDecompressor};
pub use directory::{DirEntry, DirStream, EntryType, MAX_NAME_LEN};
pub use disk::{BlockDevice, Partition, ReadAt, SectorDevice, SharedReader};
pub use error::{Error, ErrorKind, Result};
pub use structs::SuperblockFlags;

use decompression::decompressor_init;
use disk::Disk;

/// Smallest data block size allowed by the format
const MIN_BLOCK_SIZE: u32 = 4 * 1024;
/// Largest data block size allowed by the format
const MAX_BLOCK_SIZE: u32 = 1024 * 1024;

/// Options which can be used to configure how a squashfs filesystem is opened
#[derive(Debug, Clone)]
pub struct OpenOptions {
    max_symlink_depth: u32,
    sector_size: u32,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenOptions {
    /// Initialize the [OpenOptions] with the default value
    /// Right now, this implies:
    /// - At most 40 symbolic links followed while resolving one path
    /// - 512 byte sectors when wrapping a file or a reader into a [SectorDevice]
    pub const fn new() -> Self {
        Self {
            max_symlink_depth: 40,
            sector_size: SectorDevice::<&[u8]>::DEFAULT_SECTOR_SIZE,
        }
    }

    /// Specify how many symbolic links can be followed while resolving a single path
    /// Resolving more fails with [Error::SymlinkLoop]
    pub fn max_symlink_depth(&mut self, depth: u32) -> &mut Self {
        self.max_symlink_depth = depth;
        self
    }

    /// Specify the sector size of the [SectorDevice] built by [SquashFs::from_path],
    /// [SquashFs::from_read_at] and [SquashFs::from_read]
    /// Block devices given to [SquashFs::probe] use their own block size
    pub fn sector_size(&mut self, sector_size: u32) -> &mut Self {
        self.sector_size = sector_size;
        self
    }
}

/// A probed squashfs filesystem, this is the entrypoint of the library.
/// From there, one can use functions such as [Self::opendir], [Self::read] or [Self::size]
/// on paths inside the archive
pub struct SquashFs<D: BlockDevice> {
    disk: Disk<D>,
    superblock: Superblock,
    compression: Compression,
    decompressor: Box<dyn Decompressor>,
    options: OpenOptions,
}

#[cfg(any(windows, unix))]
impl SquashFs<SectorDevice<fs::File>> {
    pub fn from_path<P>(path: P) -> Result<Self>
    where
        P: AsRef<std::path::Path>,
    {
        Self::from_path_with_options(path, OpenOptions::default())
    }

    pub fn from_path_with_options<P>(path: P, options: OpenOptions) -> Result<Self>
    where
        P: AsRef<std::path::Path>,
    {
        let file = fs::File::open(path)?;
        // On windows/unix, file already implements our ReadAt trait,
        // So we can avoid one level of indirection
        Self::from_read_at_with_options(file, options)
    }
}

impl<R: Read + Seek> SquashFs<SectorDevice<SharedReader<R>>> {
    pub fn from_read(reader: R) -> Result<Self> {
        Self::from_read_at(SharedReader::new(reader))
    }
}

impl<T: ReadAt> SquashFs<SectorDevice<T>> {
    pub fn from_read_at(reader: T) -> Result<Self> {
        Self::from_read_at_with_options(reader, OpenOptions::default())
    }

    pub fn from_read_at_with_options(reader: T, options: OpenOptions) -> Result<Self> {
        let device = SectorDevice::with_sector_size(reader, options.sector_size)?;
        Self::probe_with_options(device, Partition::default(), options)
    }
}

impl<D: BlockDevice> SquashFs<D> {
    /// Read and check the superblock of the filesystem stored on `partition` of `device`
    pub fn probe(device: D, partition: Partition) -> Result<Self> {
        Self::probe_with_options(device, partition, OpenOptions::default())
    }

    pub fn probe_with_options(device: D, partition: Partition, options: OpenOptions) -> Result<Self> {
        Self::probe_inner(device, partition, options, |compression| {
            decompressor_init(compression).inspect_err(|_| {
                warn!(%compression, "compression not supported");
            })
        })
    }

    /// Same as [Self::probe_with_options], with a caller provided decompressor used for
    /// every block whatever the compression named by the superblock
    pub fn probe_with_decompressor(
        device: D,
        partition: Partition,
        options: OpenOptions,
        decompressor: Box<dyn Decompressor>,
    ) -> Result<Self> {
        Self::probe_inner(device, partition, options, |_| Ok(decompressor))
    }

    fn probe_inner(
        device: D,
        partition: Partition,
        options: OpenOptions,
        select: impl FnOnce(Compression) -> Result<Box<dyn Decompressor>>,
    ) -> Result<Self> {
        let disk = Disk::new(device, partition);
        let superblock = read_superblock(&disk)?;
        let compression = Compression::from_id(superblock.compressor.get())?;
        let decompressor = select(compression)?;
        Ok(Self {
            disk,
            superblock,
            compression,
            decompressor,
            options,
        })
    }

    /// Release the filesystem and give the block device back
    pub fn close(self) -> D {
        self.disk.into_device()
    }

    pub fn device(&self) -> &D {
        self.disk.device()
    }

    /// The size of a data block in bytes
    pub fn block_size(&self) -> u32 {
        self.superblock.block_size.get()
    }

    pub fn inode_count(&self) -> u32 {
        self.superblock.inode_count.get()
    }

    pub fn fragment_count(&self) -> u32 {
        self.superblock.frag_count.get()
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn flags(&self) -> SuperblockFlags {
        SuperblockFlags::from_bits_retain(self.superblock.flags.get())
    }

    /// Return the last time the archive was modified
    pub fn modified(&self) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(self.superblock.mod_time.get().into())
    }

    /// Open the directory at `path` for listing
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn opendir(&self, path: &str) -> Result<DirStream> {
        let tables = self.tables()?;
        let mut depth = 0;
        let dir = self.search_dir(&tables, path, &mut depth)?;
        let listing = tables.listing(&dir)?;
        Ok(DirStream::new(tables, listing))
    }

    /// Next entry of `stream`, `None` once every entry was returned
    pub fn readdir(&self, stream: &mut DirStream) -> Result<Option<DirEntry>> {
        stream.readdir()
    }

    /// Release the tables held by `stream`
    pub fn closedir(&self, stream: DirStream) {
        drop(stream);
    }

    /// Read the regular file at `path` into `buf` and return the number of bytes read.
    ///
    /// At most `len` bytes are read, `0` meaning the whole file. `buf` must be large
    /// enough for them. Reading from a nonzero `offset` is not supported
    #[tracing::instrument(level = "debug", skip(self, buf))]
    pub fn read(&self, path: &str, buf: &mut [u8], offset: u64, len: u64) -> Result<usize> {
        if offset != 0 {
            warn!("reading at a specific offset in a squashfs file is not supported");
            return Err(Error::unsupported(format!("read at offset {offset}")));
        }

        let info = {
            let tables = self.tables()?;
            let (path, inode) = self.lookup(&tables, path)?;
            file_info(&inode, &path)?
        };

        let total = if len == 0 { info.size } else { len.min(info.size) };
        debug!(size = info.size, total, blocks = info.block_sizes.len(), "reading file");
        let reader = FileReader {
            disk: &self.disk,
            decompressor: self.decompressor.as_ref(),
            superblock: &self.superblock,
        };
        reader.read(&info, buf, total)
    }

    /// Read the whole regular file at `path`
    pub fn read_to_vec(&self, path: &str) -> Result<Vec<u8>> {
        let size = self.size(path)?;
        let len = usize::try_from(size).map_err(|_| Error::OutOfMemory(usize::MAX))?;
        let mut buf = disk::alloc_zeroed(len)?;
        let read = self.read(path, &mut buf, 0, size)?;
        buf.truncate(read);
        Ok(buf)
    }

    /// Size of the regular file at `path`, symbolic links being followed
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn size(&self, path: &str) -> Result<u64> {
        let tables = self.tables()?;
        let (path, inode) = self.lookup(&tables, path)?;
        match inode.reg_info() {
            Some(reg) => Ok(reg.file_size),
            None => {
                warn!(%path, "unable to recover entry's size");
                Err(Error::unsupported(format!("size of {path}")))
            }
        }
    }

    /// Whether an entry exists at `path`.
    /// Symbolic links leading to the entry are followed, the entry itself is not
    pub fn exists(&self, path: &str) -> bool {
        let found = self.tables().and_then(|tables| {
            let mut depth = 0;
            let (dir, name) = split_path(path);
            let dir = self.search_dir(&tables, dir, &mut depth)?;
            if name.is_empty() {
                return tables.listing(&dir).map(|_| true);
            }
            Ok(tables.find_entry(&dir, name)?.is_some())
        });
        found.unwrap_or_else(|err| {
            debug!(path, %err, "lookup failed");
            false
        })
    }

    fn tables(&self) -> Result<Tables> {
        Tables::load(&self.disk, self.decompressor.as_ref(), &self.superblock)
    }

    fn follow_symlink(&self, depth: &mut u32, link: &str) -> Result<()> {
        *depth += 1;
        if *depth > self.options.max_symlink_depth {
            warn!(link, depth = *depth, "too many levels of symbolic links");
            return Err(Error::SymlinkLoop(link.to_owned()));
        }
        Ok(())
    }

    /// Walk `path` from the root directory and return the directory inode it designates.
    /// Symbolic links met on the way are replaced by their target
    fn search_dir(&self, tables: &Tables, path: &str, depth: &mut u32) -> Result<Inode> {
        let mut tokens: Vec<String> = tokenize(path).into_iter().map(str::to_owned).collect();

        'walk: loop {
            let mut inode = tables.root()?;
            if !inode.is_dir() {
                return Err(Error::format("root inode is not a directory"));
            }

            for j in 0..tokens.len() {
                let Some(dir) = inode.dir_info() else {
                    return Err(Error::NotADirectory(concat_tokens(&tokens[..j])));
                };
                if is_empty_dir(dir) {
                    debug!(path = %concat_tokens(&tokens[..j]), "empty directory");
                    return Err(Error::EmptyDir(concat_tokens(&tokens[..j])));
                }

                let Some(entry) = tables.find_entry(&inode, &tokens[j])? else {
                    debug!(path = %concat_tokens(&tokens[..=j]), "cannot find directory");
                    return Err(Error::NotFound(concat_tokens(&tokens[..=j])));
                };
                let found = tables.inode(entry.inode_number)?;

                if let Some(target) = found.symlink_target() {
                    let link = concat_tokens(&tokens[..=j]);
                    self.follow_symlink(depth, &link)?;
                    let resolved = resolve_symlink(target, &link)?;
                    let mut rest: Vec<String> =
                        tokenize(&resolved).into_iter().map(str::to_owned).collect();
                    rest.extend_from_slice(&tokens[j + 1..]);
                    tokens = rest;
                    continue 'walk;
                }

                if !is_dir(entry.ty) || !found.is_dir() {
                    return Err(Error::NotADirectory(concat_tokens(&tokens[..=j])));
                }
                inode = found;
            }

            return Ok(inode);
        }
    }

    /// Resolve `path` down to a non symlink inode, returning it along with its resolved path
    fn lookup(&self, tables: &Tables, path: &str) -> Result<(String, Inode)> {
        let mut depth = 0;
        let mut path = path.to_owned();

        loop {
            let (dir, name) = split_path(&path);
            let dir = self.search_dir(tables, dir, &mut depth)?;
            if name.is_empty() {
                return Ok((path, dir));
            }

            let Some(entry) = tables.find_entry(&dir, name)? else {
                debug!(%path, "file not found");
                return Err(Error::NotFound(path));
            };
            let inode = tables.inode(entry.inode_number)?;

            match inode.symlink_target() {
                Some(target) => {
                    self.follow_symlink(&mut depth, &path)?;
                    path = resolve_symlink(target, &path)?;
                }
                None => return Ok((path, inode)),
            }
        }
    }
}

impl<D: BlockDevice> fmt::Debug for SquashFs<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SquashFs")
            .field("block_size", &self.block_size())
            .field("inode_count", &self.inode_count())
            .field("compression", &self.compression)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

fn file_info(inode: &Inode, path: &str) -> Result<FileInfo> {
    match inode.reg_info() {
        Some(reg) => Ok(FileInfo::from(reg)),
        None => {
            warn!(path, "unsupported entry type");
            Err(Error::unsupported(format!("{path} is not a regular file")))
        }
    }
}

fn read_superblock<D: BlockDevice>(disk: &Disk<D>) -> Result<Superblock> {
    if disk.device().block_size() == 0 {
        return Err(Error::unsupported("block device with a zero block size"));
    }
    let bytes = disk.read_range(0, size_of::<Superblock>() as u64)?;
    let (superblock, _) = Superblock::read_from_prefix(bytes.data())
        .map_err(|_| Error::format("truncated superblock"))?;

    if superblock.magic.get() != SQUASHFS_MAGIC {
        warn!(magic = superblock.magic.get(), "bad magic");
        return Err(Error::format("bad magic"));
    }

    let version = (
        superblock.version_major.get(),
        superblock.version_minor.get(),
    );
    if version.0 != 4 {
        return Err(Error::format(format!(
            "unsupported version {}.{}",
            version.0, version.1
        )));
    }

    let block_size = superblock.block_size.get();
    let block_log = superblock.block_log.get() as u32;
    if 1u32.checked_shl(block_log) != Some(block_size)
        || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
    {
        return Err(Error::format(format!(
            "invalid block size {block_size} (log {block_log})"
        )));
    }

    debug!(
        block_size,
        inodes = superblock.inode_count.get(),
        fragments = superblock.frag_count.get(),
        "superblock"
    );
    Ok(superblock)
}
