/*
simgtrunc, to truncate trailing chunks off Android sparse images: backed block module
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

use std::{fmt::Display, fs::File, io::{Read, Seek, SeekFrom}};

use crate::{sparse::{max_raw_chunk_bytes, valid_block_size}, Error, Result};

const SIZE_READ_BUFFER: usize = 0x100000;

/// Where the bytes of a backed block come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BlockData {
    /// Region of the source image file, starting at this offset
    File {
        offset: u64,
    },
    #[cfg(test)]
    Memory(Vec<u8>),
    /// Little-endian 32-bit value repeated over the whole block
    Fill(u32),
}

/// A contiguous run of real data in the logical image
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BackedBlock {
    pub(crate) start_block: u32,
    pub(crate) len: u64,
    pub(crate) data: BlockData,
}

impl BackedBlock {
    pub(crate) fn blocks(&self, block_size: u32) -> u64 {
        self.len.div_ceil(block_size as u64)
    }

    /// First block after this one, in blocks
    pub(crate) fn end_block(&self, block_size: u32) -> u64 {
        self.start_block as u64 + self.blocks(block_size)
    }

    pub(crate) fn is_fill(&self) -> bool {
        matches!(self.data, BlockData::Fill(_))
    }

    /// Appends `other` into self if both describe one contiguous run that
    /// would be written as a single chunk. File regions stop growing at the
    /// largest RAW chunk.
    fn try_merge(&mut self, other: &BackedBlock, block_size: u32) -> bool {
        if self.len % block_size as u64 != 0 ||
            self.end_block(block_size) != other.start_block as u64
        {
            return false
        }
        let mergeable = match (&self.data, &other.data) {
            (BlockData::File { offset }, BlockData::File { offset: next }) =>
                offset + self.len == *next &&
                self.len + other.len <= max_raw_chunk_bytes(block_size),
            (BlockData::Fill(value), BlockData::Fill(next)) => value == next,
            _ => false,
        };
        if mergeable {
            self.len += other.len
        }
        mergeable
    }
}

impl Display for BackedBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "block {} (0x{:x} bytes, ", self.start_block, self.len)?;
        match &self.data {
            BlockData::File { offset } => write!(f, "file @ 0x{:x})", offset),
            #[cfg(test)]
            BlockData::Memory(_) => write!(f, "memory)"),
            BlockData::Fill(value) => write!(f, "fill 0x{:08x})", value),
        }
    }
}

/// An image as an ordered list of backed blocks, everything else is holes
#[derive(Debug)]
pub(crate) struct SparseImage {
    block_size: u32,
    len: u64,
    blocks: Vec<BackedBlock>,
    source: Option<File>,
}

impl SparseImage {
    pub(crate) fn new(block_size: u32, len: u64) -> Result<Self> {
        if ! valid_block_size(block_size) {
            log::error!("Block size {} is not a non-zero multiple of 4",
                block_size);
            return Err(Error::InvalidArgument(
                format!("block size {}", block_size)))
        }
        Ok(Self {
            block_size,
            len,
            blocks: Vec::new(),
            source: None,
        })
    }

    pub(crate) fn block_size(&self) -> u32 {
        self.block_size
    }

    pub(crate) fn len(&self) -> u64 {
        self.len
    }

    /// Logical length in blocks, a trailing partial block counts as one
    pub(crate) fn len_blocks(&self) -> u64 {
        self.len.div_ceil(self.block_size as u64)
    }

    pub(crate) fn blocks(&self) -> std::slice::Iter<'_, BackedBlock> {
        self.blocks.iter()
    }

    /// File that [`BlockData::File`] offsets point into
    pub(crate) fn attach_source(&mut self, source: File) {
        self.source = Some(source)
    }

    #[cfg(test)]
    pub(crate) fn add_data(&mut self, start_block: u32, data: Vec<u8>)
        -> Result<()>
    {
        self.push(BackedBlock {
            start_block,
            len: data.len() as u64,
            data: BlockData::Memory(data),
        })
    }

    pub(crate) fn add_file(&mut self, start_block: u32, len: u64, offset: u64)
        -> Result<()>
    {
        self.push(BackedBlock {
            start_block,
            len,
            data: BlockData::File { offset },
        })
    }

    pub(crate) fn add_fill(&mut self, start_block: u32, len: u64, value: u32)
        -> Result<()>
    {
        self.push(BackedBlock {
            start_block,
            len,
            data: BlockData::Fill(value),
        })
    }

    fn push(&mut self, block: BackedBlock) -> Result<()> {
        let end_block = block.end_block(self.block_size);
        if end_block > self.len_blocks() {
            log::error!("{} is out of the image of {} blocks",
                block, self.len_blocks());
            return Err(Error::OutOfBounds {
                start_block: block.start_block,
                blocks: block.blocks(self.block_size),
                total_blocks: self.len_blocks(),
            })
        }
        if let Some(last) = self.blocks.last_mut() {
            let last_block = last.end_block(self.block_size);
            if (block.start_block as u64) < last_block {
                log::error!("{} overlaps previous {}", block, last);
                return Err(Error::Overlap {
                    start_block: block.start_block,
                    last_block: last_block as u32,
                })
            }
            if last.len % self.block_size as u64 != 0 {
                log::error!("{} follows partial {}", block, last);
                return Err(Error::PartialBlock {
                    start_block: block.start_block })
            }
            if last.try_merge(&block, self.block_size) {
                return Ok(())
            }
        }
        self.blocks.push(block);
        Ok(())
    }

    /// Chunks a full write of this image takes: every gap before a block,
    /// every block, and the hole up to the end of the image
    pub(crate) fn count_chunks(&self) -> usize {
        let mut last_block = 0;
        let mut chunks = 0;
        for block in self.blocks.iter() {
            if block.start_block as u64 > last_block {
                chunks += 1
            }
            chunks += 1;
            last_block = block.end_block(self.block_size)
        }
        if last_block < self.len_blocks() {
            chunks += 1
        }
        chunks
    }

    /// Feeds exactly `block.len` bytes of the block's content to `sink`,
    /// piece by piece, fill patterns expanded.
    pub(crate) fn read_block<F>(&self, block: &BackedBlock, mut sink: F)
        -> Result<()>
    where
        F: FnMut(&[u8]) -> Result<()>
    {
        match &block.data {
            #[cfg(test)]
            BlockData::Memory(data) => sink(data),
            BlockData::Fill(value) => {
                let pattern = value.to_le_bytes();
                let piece_len = block.len.min(SIZE_READ_BUFFER as u64) as usize;
                let piece: Vec<u8> = pattern.iter().copied().cycle()
                    .take(piece_len).collect();
                let mut remaining = block.len;
                while remaining > 0 {
                    let size = remaining.min(piece_len as u64) as usize;
                    sink(&piece[..size])?;
                    remaining -= size as u64;
                }
                Ok(())
            },
            BlockData::File { offset } => {
                let mut source = match &self.source {
                    Some(source) => source,
                    None => {
                        log::error!("{} is file-backed but no source file \
                            is attached", block);
                        return Err(Error::InvariantViolation(
                            "file-backed block without source".into()))
                    }
                };
                source.seek(SeekFrom::Start(*offset))?;
                let mut buffer = vec![0;
                    block.len.min(SIZE_READ_BUFFER as u64) as usize];
                let mut remaining = block.len;
                while remaining > 0 {
                    let size = remaining.min(buffer.len() as u64) as usize;
                    if let Err(e) = source.read_exact(&mut buffer[..size]) {
                        log::error!("Failed to read {}: {}", block, e);
                        return Err(e.into())
                    }
                    sink(&buffer[..size])?;
                    remaining -= size as u64;
                }
                Ok(())
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn rejects_bad_block_size() {
        assert!(matches!(SparseImage::new(0, 4096),
            Err(Error::InvalidArgument(_))));
        assert!(matches!(SparseImage::new(4095, 4096),
            Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn rejects_overlap_and_out_of_bounds() {
        let mut image = SparseImage::new(4096, 4096 * 8).unwrap();
        image.add_data(2, vec![1; 8192]).unwrap();
        assert!(matches!(image.add_data(3, vec![1; 4096]),
            Err(Error::Overlap { start_block: 3, last_block: 4 })));
        assert!(matches!(image.add_data(7, vec![1; 8192]),
            Err(Error::OutOfBounds { start_block: 7, .. })));
    }

    #[test]
    fn only_final_block_may_be_partial() {
        let mut image = SparseImage::new(4096, 4096 * 8).unwrap();
        image.add_data(0, vec![1; 100]).unwrap();
        assert!(matches!(image.add_data(4, vec![1; 4096]),
            Err(Error::PartialBlock { start_block: 4 })));
    }

    #[test]
    fn adjacent_fills_and_file_regions_merge() {
        let mut image = SparseImage::new(4096, 4096 * 16).unwrap();
        image.add_fill(0, 8192, 0xdeadbeef).unwrap();
        image.add_fill(2, 4096, 0xdeadbeef).unwrap();
        image.add_fill(3, 4096, 0x1).unwrap();
        image.add_file(4, 4096, 0x1000).unwrap();
        image.add_file(5, 4096, 0x2000).unwrap();
        image.add_file(6, 4096, 0x4000).unwrap();
        image.add_data(7, vec![2; 4096]).unwrap();
        image.add_data(8, vec![2; 4096]).unwrap();
        let lens: Vec<(u32, u64)> = image.blocks()
            .map(|block| (block.start_block, block.len)).collect();
        assert_eq!(lens, vec![(0, 12288), (3, 4096), (4, 8192), (6, 4096),
            (7, 4096), (8, 4096)]);
    }

    #[test]
    fn file_regions_stop_merging_at_raw_chunk_limit() {
        const GIB: u64 = 1 << 30;
        let mut image = SparseImage::new(4096, 6 * GIB).unwrap();
        image.add_file(0, 3 * GIB, 0).unwrap();
        image.add_file(786432, 3 * GIB, 3 * GIB).unwrap();
        assert_eq!(image.blocks().count(), 2);
        assert_eq!(image.count_chunks(), 2);

        // right up to the limit still merges
        let limit = max_raw_chunk_bytes(4096);
        let mut image = SparseImage::new(4096, 6 * GIB).unwrap();
        image.add_file(0, 2 * GIB, 0).unwrap();
        image.add_file(524288, limit - 2 * GIB, 2 * GIB).unwrap();
        let lens: Vec<u64> = image.blocks().map(|block| block.len).collect();
        assert_eq!(lens, vec![limit]);
        image.add_file(1048575, 4096, limit).unwrap();
        assert_eq!(image.blocks().count(), 2);
    }

    #[test]
    fn counts_gaps_blocks_and_trailing_hole() {
        let mut image = SparseImage::new(4096, 4096 * 6).unwrap();
        image.add_data(0, vec![1; 4096]).unwrap();
        image.add_data(5, vec![1; 4096]).unwrap();
        assert_eq!(image.count_chunks(), 3);

        let mut image = SparseImage::new(4096, 4096 * 10).unwrap();
        image.add_data(1, vec![1; 4096]).unwrap();
        assert_eq!(image.count_chunks(), 3);

        assert_eq!(SparseImage::new(4096, 0).unwrap().count_chunks(), 0);
        assert_eq!(SparseImage::new(4096, 4096).unwrap().count_chunks(), 1);
    }

    #[test]
    fn reads_every_kind_of_block() {
        let mut file = tempfile::tempfile().unwrap();
        let content: Vec<u8> = (0..=255).cycle().take(0x3000).collect();
        file.write_all(&content).unwrap();

        let mut image = SparseImage::new(4096, 4096 * 8).unwrap();
        image.attach_source(file);
        image.add_file(0, 0x2000, 0x1000).unwrap();
        image.add_fill(3, 4096, 0x04030201).unwrap();
        image.add_data(5, vec![9; 10]).unwrap();

        let mut read = Vec::new();
        for block in image.blocks() {
            image.read_block(block, |piece| {
                read.extend_from_slice(piece);
                Ok(())
            }).unwrap();
        }
        assert_eq!(read.len(), 0x2000 + 4096 + 10);
        assert_eq!(&read[..0x2000], &content[0x1000..]);
        assert_eq!(&read[0x2000..0x2004], &[1, 2, 3, 4]);
        assert_eq!(&read[0x2000 + 4092..0x2000 + 4096], &[1, 2, 3, 4]);
        assert_eq!(&read[0x3000..], &[9; 10]);
    }

    #[test]
    fn file_block_without_source_is_an_error() {
        let mut image = SparseImage::new(4096, 4096).unwrap();
        image.add_file(0, 4096, 0).unwrap();
        let block = image.blocks().next().unwrap().clone();
        assert!(matches!(image.read_block(&block, |_| Ok(())),
            Err(Error::InvariantViolation(_))));
    }
}
