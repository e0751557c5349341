/*
simgtrunc, to truncate trailing chunks off Android sparse images: sparse format module
Copyright (C) 2024-present Guoxin "7Ji" Pu

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as
published by the Free Software Foundation, either version 3 of the
License, or (at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

// Logic to interact with Android Sparse Image
// # Android sparse img format
// # From https://android.googlesource.com/\
// # platform/system/core/+/master/libsparse/sparse_format.h
// 0		lelong	0xed26ff3a		Android sparse image
// >4		leshort	x			\b, version: %d
// >6		leshort	x			\b.%d
// >16		lelong	x			\b, Total of %d
// >12		lelong	x			\b %d-byte output blocks in
// >20		lelong	x			\b %d input chunks.

use std::fmt::Display;

pub(crate) const MAGIC: u32 = 0xed26ff3a;
pub(crate) const MAJOR_VERSION: u16 = 1;
pub(crate) const MINOR_VERSION: u16 = 0;

pub(crate) const SIZE_HEADER: usize = 28;
pub(crate) const SIZE_CHUNK_HEADER: usize = 12;

const CHUNK_TYPE_RAW: u16 = 0xcac1;
const CHUNK_TYPE_FILL: u16 = 0xcac2;
const CHUNK_TYPE_DONT_CARE: u16 = 0xcac3;
const CHUNK_TYPE_CRC32: u16 = 0xcac4;

#[derive(Debug, thiserror::Error)]
pub(crate) enum SparseError {
    #[error("Invalid magic: expected {expected:#010x}, found {0:#010x}",
        expected = MAGIC)]
    InvalidMagic(u32),
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(Version),
    #[error("Invalid file header size: {0} < {min}", min = SIZE_HEADER)]
    InvalidHeaderSize(u16),
    #[error("Invalid chunk header size: {0} < {min}",
        min = SIZE_CHUNK_HEADER)]
    InvalidChunkHeaderSize(u16),
    #[error("Invalid block size (must be a non-zero multiple of 4): {0}")]
    InvalidBlockSize(u32),
    #[error("Chunk #{index}: Unknown chunk type {chunk_type:#06x}")]
    UnknownChunkType {
        index: u32,
        chunk_type: u16,
    },
    #[error("Chunk #{index}: Expected total size {expected}, found {actual}")]
    ChunkSizeMismatch {
        index: u32,
        expected: u64,
        actual: u32,
    },
    #[error("Chunk #{index}: CRC32 chunk covers {blocks} blocks")]
    Crc32ChunkNotEmpty {
        index: u32,
        blocks: u32,
    },
    #[error("Chunks cover {actual} blocks, header declares {expected}")]
    BlockCountMismatch {
        expected: u64,
        actual: u64,
    },
    #[error("Expected CRC32 {expected:08x}, calculated {actual:08x}")]
    Crc32Mismatch {
        expected: u32,
        actual: u32,
    },
}

type SparseResult<T> = std::result::Result<T, SparseError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Version {
    pub(crate) major: u16,
    pub(crate) minor: u16,
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

fn u16_at(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn u32_at(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([bytes[offset], bytes[offset + 1],
        bytes[offset + 2], bytes[offset + 3]])
}

/// Checks that a block size is usable by both the importer and the encoder.
pub(crate) fn valid_block_size(block_size: u32) -> bool {
    block_size != 0 && block_size % 4 == 0
}

/// Most data a single RAW chunk can carry, in whole blocks, as its total
/// size including the chunk header has to fit in 32 bits.
pub(crate) fn max_raw_chunk_bytes(block_size: u32) -> u64 {
    let limit = u32::MAX as u64 - SIZE_CHUNK_HEADER as u64;
    limit / block_size as u64 * block_size as u64
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Header {
    pub(crate) version: Version,
    pub(crate) file_header_size: u16,
    pub(crate) chunk_header_size: u16,
    pub(crate) block_size: u32,
    pub(crate) total_blocks: u32,
    pub(crate) total_chunks: u32,
    pub(crate) image_checksum: u32,
}

impl Header {
    /// Header of a freshly written image, always in the version and layout
    /// this tool emits.
    pub(crate) fn new(block_size: u32, total_blocks: u32, total_chunks: u32)
        -> Self
    {
        Self {
            version: Version { major: MAJOR_VERSION, minor: MINOR_VERSION },
            file_header_size: SIZE_HEADER as u16,
            chunk_header_size: SIZE_CHUNK_HEADER as u16,
            block_size,
            total_blocks,
            total_chunks,
            image_checksum: 0,
        }
    }

    /// Only peeks the magic, for telling sparse images from raw ones
    pub(crate) fn has_magic(bytes: &[u8]) -> bool {
        bytes.len() >= 4 && u32_at(bytes, 0) == MAGIC
    }

    pub(crate) fn from_bytes(bytes: &[u8; SIZE_HEADER]) -> SparseResult<Self> {
        let magic = u32_at(bytes, 0);
        if magic != MAGIC {
            return Err(SparseError::InvalidMagic(magic))
        }
        let version = Version {
            major: u16_at(bytes, 4),
            minor: u16_at(bytes, 6),
        };
        if version.major != MAJOR_VERSION {
            return Err(SparseError::UnsupportedVersion(version))
        }
        let header = Self {
            version,
            file_header_size: u16_at(bytes, 8),
            chunk_header_size: u16_at(bytes, 10),
            block_size: u32_at(bytes, 12),
            total_blocks: u32_at(bytes, 16),
            total_chunks: u32_at(bytes, 20),
            image_checksum: u32_at(bytes, 24),
        };
        if (header.file_header_size as usize) < SIZE_HEADER {
            return Err(SparseError::InvalidHeaderSize(header.file_header_size))
        }
        if (header.chunk_header_size as usize) < SIZE_CHUNK_HEADER {
            return Err(SparseError::InvalidChunkHeaderSize(
                header.chunk_header_size))
        }
        if ! valid_block_size(header.block_size) {
            return Err(SparseError::InvalidBlockSize(header.block_size))
        }
        Ok(header)
    }

    pub(crate) fn to_bytes(&self) -> [u8; SIZE_HEADER] {
        let mut bytes = [0; SIZE_HEADER];
        bytes[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.version.major.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.version.minor.to_le_bytes());
        bytes[8..10].copy_from_slice(&self.file_header_size.to_le_bytes());
        bytes[10..12].copy_from_slice(&self.chunk_header_size.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.block_size.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.total_blocks.to_le_bytes());
        bytes[20..24].copy_from_slice(&self.total_chunks.to_le_bytes());
        bytes[24..28].copy_from_slice(&self.image_checksum.to_le_bytes());
        bytes
    }

    /// Bytes between the standard header and the first chunk
    pub(crate) fn excess_header_bytes(&self) -> u64 {
        (self.file_header_size as usize - SIZE_HEADER) as u64
    }

    pub(crate) fn excess_chunk_header_bytes(&self) -> u64 {
        (self.chunk_header_size as usize - SIZE_CHUNK_HEADER) as u64
    }

    pub(crate) fn image_size(&self) -> u64 {
        self.total_blocks as u64 * self.block_size as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkType {
    Raw,
    Fill,
    DontCare,
    Crc32,
}

impl ChunkType {
    fn from_raw(raw: u16, index: u32) -> SparseResult<Self> {
        match raw {
            CHUNK_TYPE_RAW => Ok(Self::Raw),
            CHUNK_TYPE_FILL => Ok(Self::Fill),
            CHUNK_TYPE_DONT_CARE => Ok(Self::DontCare),
            CHUNK_TYPE_CRC32 => Ok(Self::Crc32),
            _ => Err(SparseError::UnknownChunkType {
                index, chunk_type: raw }),
        }
    }

    fn to_raw(self) -> u16 {
        match self {
            Self::Raw => CHUNK_TYPE_RAW,
            Self::Fill => CHUNK_TYPE_FILL,
            Self::DontCare => CHUNK_TYPE_DONT_CARE,
            Self::Crc32 => CHUNK_TYPE_CRC32,
        }
    }
}

impl Display for ChunkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}",
            match self {
                ChunkType::Raw => "raw",
                ChunkType::Fill => "fill",
                ChunkType::DontCare => "dont-care",
                ChunkType::Crc32 => "crc32",
            }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChunkHeader {
    pub(crate) chunk_type: ChunkType,
    /// Blocks this chunk expands to
    pub(crate) blocks: u32,
    /// Bytes this chunk takes in the sparse file, header included
    pub(crate) total_size: u32,
}

impl ChunkHeader {
    pub(crate) fn new(chunk_type: ChunkType, blocks: u32, data_size: u32)
        -> Self
    {
        Self {
            chunk_type,
            blocks,
            total_size: SIZE_CHUNK_HEADER as u32 + data_size,
        }
    }

    /// Parses and validates a chunk header, `index` is only for diagnostics
    pub(crate) fn from_bytes(
        bytes: &[u8; SIZE_CHUNK_HEADER], index: u32, header: &Header
    ) -> SparseResult<Self> {
        let chunk = Self {
            chunk_type: ChunkType::from_raw(u16_at(bytes, 0), index)?,
            blocks: u32_at(bytes, 4),
            total_size: u32_at(bytes, 8),
        };
        if chunk.chunk_type == ChunkType::Crc32 && chunk.blocks != 0 {
            return Err(SparseError::Crc32ChunkNotEmpty {
                index, blocks: chunk.blocks })
        }
        let expected = chunk.expected_size(header);
        if expected != chunk.total_size as u64 {
            return Err(SparseError::ChunkSizeMismatch {
                index, expected, actual: chunk.total_size })
        }
        Ok(chunk)
    }

    pub(crate) fn to_bytes(&self) -> [u8; SIZE_CHUNK_HEADER] {
        let mut bytes = [0; SIZE_CHUNK_HEADER];
        bytes[0..2].copy_from_slice(&self.chunk_type.to_raw().to_le_bytes());
        bytes[4..8].copy_from_slice(&self.blocks.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.total_size.to_le_bytes());
        bytes
    }

    fn expected_size(&self, header: &Header) -> u64 {
        let data_size = match self.chunk_type {
            ChunkType::Raw => self.blocks as u64 * header.block_size as u64,
            ChunkType::Fill | ChunkType::Crc32 => 4,
            ChunkType::DontCare => 0,
        };
        header.chunk_header_size as u64 + data_size
    }

    /// Bytes of payload following the (possibly oversized) chunk header
    pub(crate) fn data_size(&self, header: &Header) -> u64 {
        self.total_size as u64 - header.chunk_header_size as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_bytes(block_size: u32, total_blocks: u32, total_chunks: u32)
        -> [u8; SIZE_HEADER]
    {
        Header::new(block_size, total_blocks, total_chunks).to_bytes()
    }

    #[test]
    fn header_layout_matches_format() {
        let bytes = header_bytes(4096, 1000, 10);
        assert_eq!(&bytes[0..4], &[0x3a, 0xff, 0x26, 0xed]);
        assert_eq!(u16_at(&bytes, 8), 28);
        assert_eq!(u16_at(&bytes, 10), 12);
        let header = Header::from_bytes(&bytes).unwrap();
        assert_eq!(header.block_size, 4096);
        assert_eq!(header.total_blocks, 1000);
        assert_eq!(header.total_chunks, 10);
        assert_eq!(header.image_size(), 4096 * 1000);
    }

    #[test]
    fn header_rejects_bad_magic_and_version() {
        let mut bytes = header_bytes(4096, 1, 1);
        bytes[0] = 0xff;
        assert!(matches!(Header::from_bytes(&bytes),
            Err(SparseError::InvalidMagic(_))));
        let mut bytes = header_bytes(4096, 1, 1);
        bytes[4] = 2;
        assert!(matches!(Header::from_bytes(&bytes),
            Err(SparseError::UnsupportedVersion(Version { major: 2, .. }))));
    }

    #[test]
    fn header_rejects_bad_block_size() {
        let bytes = header_bytes(4094, 1, 1);
        assert!(matches!(Header::from_bytes(&bytes),
            Err(SparseError::InvalidBlockSize(4094))));
        let bytes = header_bytes(0, 1, 1);
        assert!(matches!(Header::from_bytes(&bytes),
            Err(SparseError::InvalidBlockSize(0))));
    }

    #[test]
    fn raw_chunk_limit_is_whole_blocks() {
        assert_eq!(max_raw_chunk_bytes(4096), 0xfffff000);
        assert_eq!(max_raw_chunk_bytes(4), 0xfffffff0);
        assert_eq!(max_raw_chunk_bytes(4096) % 4096, 0);
    }

    #[test]
    fn chunk_header_sizes_are_validated() {
        let header = Header::new(4096, 8, 3);
        let raw = ChunkHeader::new(ChunkType::Raw, 2, 8192).to_bytes();
        let chunk = ChunkHeader::from_bytes(&raw, 0, &header).unwrap();
        assert_eq!(chunk.chunk_type, ChunkType::Raw);
        assert_eq!(chunk.data_size(&header), 8192);

        let short = ChunkHeader::new(ChunkType::Raw, 2, 4096).to_bytes();
        assert!(matches!(ChunkHeader::from_bytes(&short, 1, &header),
            Err(SparseError::ChunkSizeMismatch { index: 1, expected: 8204, .. })));

        let fill = ChunkHeader::new(ChunkType::Fill, 6, 4).to_bytes();
        assert!(ChunkHeader::from_bytes(&fill, 2, &header).is_ok());
    }

    #[test]
    fn chunk_header_rejects_unknown_type_and_filled_crc() {
        let header = Header::new(4096, 8, 3);
        let mut bytes = ChunkHeader::new(ChunkType::DontCare, 1, 0).to_bytes();
        bytes[0] = 0x00;
        assert!(matches!(ChunkHeader::from_bytes(&bytes, 4, &header),
            Err(SparseError::UnknownChunkType { index: 4, .. })));

        let crc = ChunkHeader::new(ChunkType::Crc32, 1, 4).to_bytes();
        assert!(matches!(ChunkHeader::from_bytes(&crc, 5, &header),
            Err(SparseError::Crc32ChunkNotEmpty { index: 5, blocks: 1 })));
    }
}
