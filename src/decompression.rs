use std::fmt;

use zerocopy::{IntoBytes, TryFromBytes, little_endian::U16};

use crate::{Error, Result, structs::CompressorType};

/// Compressor used for both data and meta data blocks, as named by the superblock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// zlib deflate (no gzip header)
    Gzip,
    /// LZMA 1 (considered deprecated)
    Lzma,
    Lzo,
    /// LZMA 2
    Xz,
    Lz4,
    Zstd,
}

impl Compression {
    /// Map the 16-bit compressor id of the superblock
    pub fn from_id(id: u16) -> Result<Self> {
        let compressor = CompressorType::try_read_from_bytes(U16::new(id).as_bytes())
            .map_err(|_| Error::format(format!("unknown compressor id {id}")))?;
        Ok(match compressor {
            CompressorType::Gzip => Self::Gzip,
            CompressorType::Lzma => Self::Lzma,
            CompressorType::Lzo => Self::Lzo,
            CompressorType::Xz => Self::Xz,
            CompressorType::Lz4 => Self::Lz4,
            CompressorType::Zstd => Self::Zstd,
        })
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Gzip => "gzip",
            Self::Lzma => "lzma",
            Self::Lzo => "lzo",
            Self::Xz => "xz",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        };
        f.write_str(name)
    }
}

/// Decompression capability used for metadata, data and fragment blocks
pub trait Decompressor {
    /// Decompress `src` into `dst` and return the number of bytes written.
    /// Output which does not fit in `dst` is an error
    fn decompress(&self, dst: &mut [u8], src: &[u8]) -> Result<usize>;
}

impl<T: Decompressor + ?Sized> Decompressor for Box<T> {
    fn decompress(&self, dst: &mut [u8], src: &[u8]) -> Result<usize> {
        (**self).decompress(dst, src)
    }
}

/// zlib stream decoder backed by flate2
#[derive(Debug, Clone, Copy, Default)]
pub struct ZlibDecompressor;

impl Decompressor for ZlibDecompressor {
    fn decompress(&self, dst: &mut [u8], src: &[u8]) -> Result<usize> {
        let mut decoder = flate2::Decompress::new(true);
        let status = decoder
            .decompress(src, dst, flate2::FlushDecompress::Finish)
            .map_err(|err| Error::Decompression(err.to_string()))?;

        match status {
            flate2::Status::StreamEnd => Ok(decoder.total_out() as usize),
            // Either the input is truncated or the output does not fit
            flate2::Status::Ok | flate2::Status::BufError => Err(Error::Decompression(format!(
                "incomplete zlib stream ({} bytes in, {} bytes out)",
                decoder.total_in(),
                decoder.total_out()
            ))),
        }
    }
}

/// Select the decompressor matching the compression named by the superblock.
/// Only zlib is wired up, the other algorithms are recognized but refused
pub(crate) fn decompressor_init(compression: Compression) -> Result<Box<dyn Decompressor>> {
    match compression {
        Compression::Gzip => Ok(Box::new(ZlibDecompressor)),
        other => Err(Error::unsupported(format!("{other} compression"))),
    }
}
