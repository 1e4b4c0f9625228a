//! In-memory SquashFS 4.0 image builder shared by the integration tests.
//!
//! Images are laid out the way mksquashfs does it: superblock, data and
//! fragment blocks, inode table, directory table, fragment table, id table.
//! Inodes are written in post-order so the root directory comes last and gets
//! the highest inode number.

#![allow(dead_code)]

use std::{
    cell::Cell,
    collections::BTreeMap,
    io::{self, Write},
};

use flate2::{Compression, write::ZlibEncoder};
use sqfs_boot::{BlockDevice, SectorDevice};

pub const MOD_TIME: u32 = 1_700_000_000;

const METADATA_BLOCK_SIZE: usize = 8192;
const NO_FRAGMENT: u32 = 0xFFFF_FFFF;

pub fn zlib(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Deterministic incompressible bytes
pub fn noise(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}

/// Compressible bytes
pub fn text(len: usize) -> Vec<u8> {
    b"All work and no play makes Jack a dull boy. "
        .iter()
        .copied()
        .cycle()
        .take(len)
        .collect()
}

#[derive(Clone)]
enum Node {
    File { data: Vec<u8>, extended: bool },
    Dir(DirTree),
    Symlink { target: String, extended: bool },
    Device { block: bool, rdev: u32, extended: bool },
    Fifo { extended: bool },
    Socket { extended: bool },
}

#[derive(Clone, Default)]
struct DirTree {
    entries: BTreeMap<String, Node>,
    extended: bool,
}

impl DirTree {
    fn inode_total(&self) -> u32 {
        1 + self
            .entries
            .values()
            .map(|node| match node {
                Node::Dir(dir) => dir.inode_total(),
                _ => 1,
            })
            .sum::<u32>()
    }
}

#[derive(Clone)]
pub struct ImageBuilder {
    block_size: u32,
    compress_metadata: bool,
    compress_data: bool,
    fragments: bool,
    root: DirTree,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self {
            block_size: 4096,
            compress_metadata: true,
            compress_data: true,
            fragments: true,
            root: DirTree::default(),
        }
    }

    pub fn block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    /// Store metadata and data blocks without compression
    pub fn uncompressed(mut self) -> Self {
        self.compress_metadata = false;
        self.compress_data = false;
        self
    }

    /// Store file tails in data blocks instead of fragments
    pub fn no_fragments(mut self) -> Self {
        self.fragments = false;
        self
    }

    pub fn file(self, path: &str, data: impl Into<Vec<u8>>) -> Self {
        self.insert(
            path,
            Node::File {
                data: data.into(),
                extended: false,
            },
        )
    }

    pub fn extended_file(self, path: &str, data: impl Into<Vec<u8>>) -> Self {
        self.insert(
            path,
            Node::File {
                data: data.into(),
                extended: true,
            },
        )
    }

    pub fn dir(self, path: &str) -> Self {
        self.insert(path, Node::Dir(DirTree::default()))
    }

    pub fn extended_dir(self, path: &str) -> Self {
        self.insert(
            path,
            Node::Dir(DirTree {
                entries: BTreeMap::new(),
                extended: true,
            }),
        )
    }

    pub fn symlink(self, path: &str, target: &str) -> Self {
        self.insert(
            path,
            Node::Symlink {
                target: target.to_owned(),
                extended: false,
            },
        )
    }

    pub fn extended_symlink(self, path: &str, target: &str) -> Self {
        self.insert(
            path,
            Node::Symlink {
                target: target.to_owned(),
                extended: true,
            },
        )
    }

    pub fn char_device(self, path: &str, rdev: u32) -> Self {
        self.insert(
            path,
            Node::Device {
                block: false,
                rdev,
                extended: false,
            },
        )
    }

    pub fn extended_block_device(self, path: &str, rdev: u32) -> Self {
        self.insert(
            path,
            Node::Device {
                block: true,
                rdev,
                extended: true,
            },
        )
    }

    pub fn fifo(self, path: &str) -> Self {
        self.insert(path, Node::Fifo { extended: false })
    }

    pub fn extended_socket(self, path: &str) -> Self {
        self.insert(path, Node::Socket { extended: true })
    }

    fn insert(mut self, path: &str, node: Node) -> Self {
        let mut tokens: Vec<&str> = path.split('/').filter(|t| !t.is_empty()).collect();
        let name = tokens.pop().expect("cannot insert the root directory");
        let mut dir = &mut self.root;
        for token in tokens {
            let child = dir
                .entries
                .entry(token.to_owned())
                .or_insert_with(|| Node::Dir(DirTree::default()));
            dir = match child {
                Node::Dir(dir) => dir,
                _ => panic!("{token} is not a directory"),
            };
        }
        match (dir.entries.get_mut(name), node) {
            // keep the content of an existing directory
            (Some(Node::Dir(existing)), Node::Dir(tree)) => existing.extended |= tree.extended,
            (_, node) => {
                dir.entries.insert(name.to_owned(), node);
            }
        }
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut writer = Writer {
            block_size: self.block_size,
            compress_data: self.compress_data,
            fragments_enabled: self.fragments,
            data: Vec::new(),
            fragment_buf: Vec::new(),
            fragments: Vec::new(),
            inodes: MetaWriter::new(self.compress_metadata),
            dirs: MetaWriter::new(self.compress_metadata),
        };

        let inode_count = self.root.inode_total();
        let (root_ref, root_number) = writer.write_dir(&self.root, 1, inode_count + 1);
        assert_eq!(root_number, inode_count);
        writer.flush_fragment();

        let mut image = vec![0u8; 96];
        image.extend_from_slice(&writer.data);

        let inode_table = image.len() as u64;
        image.extend_from_slice(&writer.inodes.finish());
        let dir_table = image.len() as u64;
        image.extend_from_slice(&writer.dirs.finish());

        let mut pointers = Vec::new();
        let entries: Vec<u8> = writer.fragments.iter().flatten().copied().collect();
        for group in entries.chunks(METADATA_BLOCK_SIZE) {
            pointers.push(image.len() as u64);
            image.extend_from_slice(&metablock(group, self.compress_metadata));
        }
        let frag_table = image.len() as u64;
        for pointer in pointers {
            image.extend_from_slice(&pointer.to_le_bytes());
        }

        let id_block = image.len() as u64;
        image.extend_from_slice(&metablock(&0u32.to_le_bytes(), self.compress_metadata));
        let id_table = image.len() as u64;
        image.extend_from_slice(&id_block.to_le_bytes());
        let bytes_used = image.len() as u64;
        image.resize(image.len().next_multiple_of(4096), 0);

        let mut flags = 0x0200u16; // no xattrs
        if !self.compress_metadata {
            flags |= 0x0001;
        }
        if !self.compress_data {
            flags |= 0x0002 | 0x0008;
        }
        if !self.fragments {
            flags |= 0x0010;
        }

        let mut sb = Vec::with_capacity(96);
        sb.extend_from_slice(&0x7371_7368u32.to_le_bytes());
        sb.extend_from_slice(&inode_count.to_le_bytes());
        sb.extend_from_slice(&MOD_TIME.to_le_bytes());
        sb.extend_from_slice(&self.block_size.to_le_bytes());
        sb.extend_from_slice(&(writer.fragments.len() as u32).to_le_bytes());
        sb.extend_from_slice(&1u16.to_le_bytes()); // gzip
        sb.extend_from_slice(&(self.block_size.trailing_zeros() as u16).to_le_bytes());
        sb.extend_from_slice(&flags.to_le_bytes());
        sb.extend_from_slice(&1u16.to_le_bytes()); // id count
        sb.extend_from_slice(&4u16.to_le_bytes());
        sb.extend_from_slice(&0u16.to_le_bytes());
        sb.extend_from_slice(&((root_ref.0 << 16) | root_ref.1 as u64).to_le_bytes());
        sb.extend_from_slice(&bytes_used.to_le_bytes());
        sb.extend_from_slice(&id_table.to_le_bytes());
        sb.extend_from_slice(&u64::MAX.to_le_bytes()); // xattr table
        sb.extend_from_slice(&inode_table.to_le_bytes());
        sb.extend_from_slice(&dir_table.to_le_bytes());
        sb.extend_from_slice(&frag_table.to_le_bytes());
        sb.extend_from_slice(&u64::MAX.to_le_bytes()); // export table
        assert_eq!(sb.len(), 96);
        image[..96].copy_from_slice(&sb);

        image
    }
}

/// Metadata block holding `data`, compressed when it helps
fn metablock(data: &[u8], compress: bool) -> Vec<u8> {
    assert!(data.len() <= METADATA_BLOCK_SIZE);
    if compress {
        let packed = zlib(data);
        if packed.len() < data.len() {
            let mut out = (packed.len() as u16).to_le_bytes().to_vec();
            out.extend_from_slice(&packed);
            return out;
        }
    }
    let mut out = (data.len() as u16 | 0x8000).to_le_bytes().to_vec();
    out.extend_from_slice(data);
    out
}

/// Streams bytes into 8KiB metadata blocks, so that the (block start, offset) reference
/// of anything is known when it is written
struct MetaWriter {
    compress: bool,
    out: Vec<u8>,
    pending: Vec<u8>,
}

impl MetaWriter {
    fn new(compress: bool) -> Self {
        Self {
            compress,
            out: Vec::new(),
            pending: Vec::new(),
        }
    }

    fn position(&self) -> (u64, u16) {
        (self.out.len() as u64, self.pending.len() as u16)
    }

    fn write(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
        while self.pending.len() >= METADATA_BLOCK_SIZE {
            let block: Vec<u8> = self.pending.drain(..METADATA_BLOCK_SIZE).collect();
            self.out.extend_from_slice(&metablock(&block, self.compress));
        }
    }

    fn finish(mut self) -> Vec<u8> {
        if !self.pending.is_empty() {
            let block = std::mem::take(&mut self.pending);
            self.out.extend_from_slice(&metablock(&block, self.compress));
        }
        self.out
    }
}

struct Writer {
    block_size: u32,
    compress_data: bool,
    fragments_enabled: bool,
    /// Everything stored between the superblock and the inode table
    data: Vec<u8>,
    fragment_buf: Vec<u8>,
    fragments: Vec<[u8; 16]>,
    inodes: MetaWriter,
    dirs: MetaWriter,
}

fn inode_header(out: &mut Vec<u8>, ty: u16, number: u32) {
    out.extend_from_slice(&ty.to_le_bytes());
    out.extend_from_slice(&0o644u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&MOD_TIME.to_le_bytes());
    out.extend_from_slice(&number.to_le_bytes());
}

struct Listed {
    name: String,
    ty: u16,
    number: u32,
    inode_ref: (u64, u16),
}

impl Writer {
    fn data_position(&self) -> u64 {
        96 + self.data.len() as u64
    }

    /// Store one data or fragment block, returning its size word
    fn store_block(&mut self, block: &[u8]) -> u32 {
        if self.compress_data {
            let packed = zlib(block);
            if packed.len() < block.len() {
                self.data.extend_from_slice(&packed);
                return packed.len() as u32;
            }
        }
        self.data.extend_from_slice(block);
        block.len() as u32 | (1 << 24)
    }

    fn flush_fragment(&mut self) {
        if self.fragment_buf.is_empty() {
            return;
        }
        let start = self.data_position();
        let block = std::mem::take(&mut self.fragment_buf);
        let size = self.store_block(&block);
        let mut entry = [0u8; 16];
        entry[..8].copy_from_slice(&start.to_le_bytes());
        entry[8..12].copy_from_slice(&size.to_le_bytes());
        self.fragments.push(entry);
    }

    /// Write the blocks of a file, returning (start, words, fragment index, fragment offset)
    fn write_file_data(&mut self, data: &[u8]) -> (u64, Vec<u32>, u32, u32) {
        let block_size = self.block_size as usize;
        let tail_len = data.len() % block_size;
        let use_fragment = self.fragments_enabled && tail_len != 0;
        let block_bytes = if use_fragment {
            data.len() - tail_len
        } else {
            data.len()
        };

        let start = self.data_position();
        let mut words = Vec::new();
        for chunk in data[..block_bytes].chunks(block_size) {
            if chunk.iter().all(|&b| b == 0) {
                words.push(0);
            } else {
                words.push(self.store_block(chunk));
            }
        }

        if !use_fragment {
            return (start, words, NO_FRAGMENT, 0);
        }
        if self.fragment_buf.len() + tail_len > block_size {
            self.flush_fragment();
        }
        let index = self.fragments.len() as u32;
        let offset = self.fragment_buf.len() as u32;
        self.fragment_buf.extend_from_slice(&data[block_bytes..]);
        (start, words, index, offset)
    }

    fn write_leaf(&mut self, node: &Node, number: u32) -> (u16, (u64, u16)) {
        let mut out = Vec::new();
        let basic_ty = match node {
            Node::File { data, extended } => {
                let (start, words, fragment, offset) = self.write_file_data(data);
                let size = data.len() as u64;
                if *extended || size > u32::MAX as u64 || start > u32::MAX as u64 {
                    inode_header(&mut out, 9, number);
                    out.extend_from_slice(&start.to_le_bytes());
                    out.extend_from_slice(&size.to_le_bytes());
                    out.extend_from_slice(&0u64.to_le_bytes());
                    out.extend_from_slice(&1u32.to_le_bytes());
                    out.extend_from_slice(&fragment.to_le_bytes());
                    out.extend_from_slice(&offset.to_le_bytes());
                    out.extend_from_slice(&u32::MAX.to_le_bytes());
                } else {
                    inode_header(&mut out, 2, number);
                    out.extend_from_slice(&(start as u32).to_le_bytes());
                    out.extend_from_slice(&fragment.to_le_bytes());
                    out.extend_from_slice(&offset.to_le_bytes());
                    out.extend_from_slice(&(size as u32).to_le_bytes());
                }
                for word in words {
                    out.extend_from_slice(&word.to_le_bytes());
                }
                2
            }
            Node::Symlink { target, extended } => {
                inode_header(&mut out, if *extended { 10 } else { 3 }, number);
                out.extend_from_slice(&1u32.to_le_bytes());
                out.extend_from_slice(&(target.len() as u32).to_le_bytes());
                out.extend_from_slice(target.as_bytes());
                if *extended {
                    out.extend_from_slice(&u32::MAX.to_le_bytes());
                }
                3
            }
            Node::Device {
                block,
                rdev,
                extended,
            } => {
                let basic = if *block { 4 } else { 5 };
                inode_header(&mut out, if *extended { basic + 7 } else { basic }, number);
                out.extend_from_slice(&1u32.to_le_bytes());
                out.extend_from_slice(&rdev.to_le_bytes());
                if *extended {
                    out.extend_from_slice(&u32::MAX.to_le_bytes());
                }
                basic
            }
            Node::Fifo { extended } | Node::Socket { extended } => {
                let basic = if matches!(node, Node::Fifo { .. }) { 6 } else { 7 };
                inode_header(&mut out, if *extended { basic + 7 } else { basic }, number);
                out.extend_from_slice(&1u32.to_le_bytes());
                if *extended {
                    out.extend_from_slice(&u32::MAX.to_le_bytes());
                }
                basic
            }
            Node::Dir(_) => unreachable!("directories are written by write_dir"),
        };
        let inode_ref = self.inodes.position();
        self.inodes.write(&out);
        (basic_ty, inode_ref)
    }

    /// Write the subtree of `dir`, whose inodes are numbered from `first`.
    /// Returns the reference and number of the directory inode
    fn write_dir(&mut self, dir: &DirTree, first: u32, parent: u32) -> ((u64, u16), u32) {
        let number = first + dir.inode_total() - 1;
        let mut next = first;
        let mut listed = Vec::new();
        for (name, node) in &dir.entries {
            let (ty, inode_ref, entry_number) = match node {
                Node::Dir(sub) => {
                    let (inode_ref, sub_number) = self.write_dir(sub, next, number);
                    next = sub_number + 1;
                    (1, inode_ref, sub_number)
                }
                leaf => {
                    let (ty, inode_ref) = self.write_leaf(leaf, next);
                    next += 1;
                    (ty, inode_ref, next - 1)
                }
            };
            listed.push(Listed {
                name: name.clone(),
                ty,
                number: entry_number,
                inode_ref,
            });
        }
        assert_eq!(next, number);

        // listing, split into headers of at most 256 entries sharing an inode block
        let listing_start = self.dirs.position();
        let mut listing_len = 0usize;
        let mut index = Vec::new();
        let mut groups: Vec<Vec<&Listed>> = Vec::new();
        for entry in &listed {
            let new_group = match groups.last() {
                None => true,
                Some(group) => {
                    group.len() == 256
                        || group[0].inode_ref.0 != entry.inode_ref.0
                        || (entry.number as i64 - group[0].number as i64).abs() > i16::MAX as i64
                }
            };
            if new_group {
                groups.push(Vec::new());
            }
            groups.last_mut().unwrap().push(entry);
        }
        for (g, group) in groups.iter().enumerate() {
            let (block, _) = self.dirs.position();
            if g > 0 {
                index.push((listing_len as u32, block as u32, group[0].name.clone()));
            }
            let mut bytes = Vec::new();
            bytes.extend_from_slice(&(group.len() as u32 - 1).to_le_bytes());
            bytes.extend_from_slice(&(group[0].inode_ref.0 as u32).to_le_bytes());
            bytes.extend_from_slice(&group[0].number.to_le_bytes());
            for entry in group {
                bytes.extend_from_slice(&entry.inode_ref.1.to_le_bytes());
                bytes.extend_from_slice(&((entry.number as i64 - group[0].number as i64) as i16).to_le_bytes());
                bytes.extend_from_slice(&entry.ty.to_le_bytes());
                bytes.extend_from_slice(&(entry.name.len() as u16 - 1).to_le_bytes());
                bytes.extend_from_slice(entry.name.as_bytes());
            }
            listing_len += bytes.len();
            self.dirs.write(&bytes);
        }
        let file_size = listing_len as u32 + 3;

        let mut out = Vec::new();
        if dir.extended || file_size > u16::MAX as u32 {
            inode_header(&mut out, 8, number);
            out.extend_from_slice(&2u32.to_le_bytes());
            out.extend_from_slice(&file_size.to_le_bytes());
            out.extend_from_slice(&(listing_start.0 as u32).to_le_bytes());
            out.extend_from_slice(&parent.to_le_bytes());
            out.extend_from_slice(&(index.len() as u16).to_le_bytes());
            out.extend_from_slice(&listing_start.1.to_le_bytes());
            out.extend_from_slice(&u32::MAX.to_le_bytes());
            for (offset, start, name) in index {
                out.extend_from_slice(&offset.to_le_bytes());
                out.extend_from_slice(&start.to_le_bytes());
                out.extend_from_slice(&(name.len() as u32 - 1).to_le_bytes());
                out.extend_from_slice(name.as_bytes());
            }
        } else {
            inode_header(&mut out, 1, number);
            out.extend_from_slice(&(listing_start.0 as u32).to_le_bytes());
            out.extend_from_slice(&2u32.to_le_bytes());
            out.extend_from_slice(&(file_size as u16).to_le_bytes());
            out.extend_from_slice(&listing_start.1.to_le_bytes());
            out.extend_from_slice(&parent.to_le_bytes());
        }
        let inode_ref = self.inodes.position();
        self.inodes.write(&out);
        (inode_ref, number)
    }
}

/// Block device over an in-memory image which counts the reads it serves
pub struct CountingDevice {
    inner: SectorDevice<Vec<u8>>,
    reads: Cell<usize>,
    blocks: Cell<u64>,
}

impl CountingDevice {
    pub fn new(image: Vec<u8>) -> Self {
        Self {
            inner: SectorDevice::new(image),
            reads: Cell::new(0),
            blocks: Cell::new(0),
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.get()
    }

    pub fn blocks(&self) -> u64 {
        self.blocks.get()
    }
}

impl BlockDevice for CountingDevice {
    fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    fn read_blocks(&self, start: u64, count: u64, buf: &mut [u8]) -> io::Result<u64> {
        self.reads.set(self.reads.get() + 1);
        self.blocks.set(self.blocks.get() + count);
        self.inner.read_blocks(start, count, buf)
    }
}
