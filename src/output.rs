/*
simgtrunc, to truncate trailing chunks off Android sparse images: output module
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

use std::io::Write;

use flate2::{write::GzEncoder, Compression};
use indicatif::ProgressBar;

use crate::{backed::{BackedBlock, BlockData, SparseImage}, crc32::Crc32Hasher,
    sparse::{max_raw_chunk_bytes, valid_block_size, ChunkHeader, ChunkType,
        Header}, trunc::ChunkSink,
    Error, Result};

const SIZE_ZERO_BUFFER: usize = 0x100000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OutputFlags {
    pub(crate) gzip: bool,
    /// Sparse container, otherwise the fully expanded image
    pub(crate) sparse: bool,
    /// Trailing CRC32 chunk, sparse container only
    pub(crate) crc: bool,
}

impl Default for OutputFlags {
    fn default() -> Self {
        Self {
            gzip: false,
            sparse: true,
            crc: false,
        }
    }
}

enum Sink<W: Write> {
    Plain(W),
    Gzip(GzEncoder<W>),
}

impl<W: Write> Write for Sink<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Sink::Plain(writer) => writer.write(buf),
            Sink::Gzip(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Sink::Plain(writer) => writer.flush(),
            Sink::Gzip(encoder) => encoder.flush(),
        }
    }
}

impl<W: Write> Sink<W> {
    fn finish(self) -> std::io::Result<W> {
        let mut writer = match self {
            Sink::Plain(writer) => writer,
            Sink::Gzip(encoder) => encoder.finish()?,
        };
        writer.flush()?;
        Ok(writer)
    }
}

/// Encoder of an output image, either a sparse container or a plain one
pub(crate) struct OutputFile<W: Write> {
    sink: Sink<W>,
    flags: OutputFlags,
    block_size: u32,
    total_blocks: u32,
    total_chunks: u32,
    chunks_written: u32,
    blocks_written: u64,
    crc: Option<Crc32Hasher>,
    zeros: Vec<u8>,
    progress: ProgressBar,
}

impl<W: Write> OutputFile<W> {
    /// Starts an image of `total_size` bytes made of `chunks` chunks, the
    /// sparse header is written right away
    pub(crate) fn open(
        writer: W, block_size: u32, total_size: u64, chunks: usize,
        flags: OutputFlags, progress: ProgressBar
    ) -> Result<Self> {
        if ! valid_block_size(block_size) {
            log::error!("Cannot encode with block size {}", block_size);
            return Err(Error::EncoderSetup(
                format!("block size {}", block_size)))
        }
        let total_blocks = total_size.div_ceil(block_size as u64);
        let total_blocks = match u32::try_from(total_blocks) {
            Ok(total_blocks) => total_blocks,
            Err(_) => {
                log::error!("Image of {} blocks is too large for a sparse \
                    header", total_blocks);
                return Err(Error::EncoderSetup(
                    format!("{} blocks", total_blocks)))
            }
        };
        let chunks = u32::try_from(chunks).ok()
            .and_then(|chunks| chunks.checked_add(
                if flags.sparse && flags.crc { 1 } else { 0 }));
        let total_chunks = match chunks {
            Some(total_chunks) => total_chunks,
            None => {
                log::error!("Too many chunks for a sparse header");
                return Err(Error::EncoderSetup("chunk count".into()))
            }
        };
        let sink = if flags.gzip {
            Sink::Gzip(GzEncoder::new(writer, Compression::default()))
        } else {
            Sink::Plain(writer)
        };
        progress.set_length(total_blocks as u64 * block_size as u64);
        let mut out = Self {
            sink,
            flags,
            block_size,
            total_blocks,
            total_chunks,
            chunks_written: 0,
            blocks_written: 0,
            crc: (flags.sparse && flags.crc).then(Crc32Hasher::new),
            zeros: Vec::new(),
            progress,
        };
        if flags.sparse {
            let header = Header::new(block_size, total_blocks, total_chunks);
            out.write(&header.to_bytes())?;
        }
        log::debug!("Opened output of {} blocks in {} chunks (gzip: {}, \
            sparse: {}, crc: {})", total_blocks, total_chunks, flags.gzip,
            flags.sparse, flags.crc);
        Ok(out)
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        if let Err(e) = self.sink.write_all(data) {
            log::error!("Failed to write to output: {}", e);
            return Err(e.into())
        }
        Ok(())
    }

    fn write_chunk_header(&mut self, chunk_type: ChunkType, blocks: u32,
        data_size: u32
    ) -> Result<()> {
        let header = ChunkHeader::new(chunk_type, blocks, data_size);
        self.write(&header.to_bytes())?;
        self.chunks_written += 1;
        Ok(())
    }

    /// Expanded content the image gets, fed to the checksum and the progress
    /// bar, and written out as is for plain images
    fn content(&mut self, data: &[u8]) -> Result<()> {
        if let Some(crc) = &mut self.crc {
            crc.update(data)
        }
        if ! self.flags.sparse {
            self.write(data)?
        }
        self.progress.inc(data.len() as u64);
        Ok(())
    }

    fn content_zeros(&mut self, len: u64) -> Result<()> {
        if self.flags.sparse {
            if let Some(crc) = &mut self.crc {
                crc.update_zeros(len)
            }
            self.progress.inc(len);
            return Ok(())
        }
        if self.zeros.is_empty() {
            self.zeros = vec![0; SIZE_ZERO_BUFFER]
        }
        let zeros = std::mem::take(&mut self.zeros);
        let mut remaining = len;
        let mut result = Ok(());
        while remaining > 0 {
            let size = remaining.min(zeros.len() as u64) as usize;
            result = self.content(&zeros[..size]);
            if result.is_err() {
                break
            }
            remaining -= size as u64;
        }
        self.zeros = zeros;
        result
    }

    fn content_fill(&mut self, value: u32, len: u64) -> Result<()> {
        if self.flags.sparse {
            if let Some(crc) = &mut self.crc {
                crc.update_fill(value, len)
            }
            self.progress.inc(len);
            return Ok(())
        }
        let piece: Vec<u8> = value.to_le_bytes().iter().copied().cycle()
            .take(len.min(SIZE_ZERO_BUFFER as u64) as usize).collect();
        let mut remaining = len;
        while remaining > 0 {
            let size = remaining.min(piece.len() as u64) as usize;
            self.content(&piece[..size])?;
            remaining -= size as u64;
        }
        Ok(())
    }

    /// Block count of a chunk header. DONT_CARE and FILL chunks only need
    /// the count to fit, RAW chunks also carry every byte of their blocks.
    fn chunk_blocks(&self, chunk_type: ChunkType, blocks: u64) -> Result<u32> {
        let fits = match chunk_type {
            ChunkType::Raw => blocks * self.block_size as u64
                <= max_raw_chunk_bytes(self.block_size),
            _ => true,
        };
        match u32::try_from(blocks) {
            Ok(blocks) if fits => Ok(blocks),
            _ => {
                log::error!("{} chunk of {} blocks is too large to encode",
                    chunk_type, blocks);
                Err(Error::EncoderSetup(format!("{} chunk of {} blocks",
                    chunk_type, blocks)))
            }
        }
    }

    /// Finishes the image, writing the CRC chunk if asked. Always releases
    /// the underlying writer, mismatches are reported afterwards.
    pub(crate) fn close(mut self) -> Result<W> {
        let mut result = Ok(());
        if self.flags.sparse {
            if let Some(crc) = self.crc.take() {
                result = self.write_chunk_header(ChunkType::Crc32, 0, 4)
                    .and_then(|_| self.write(&crc.value().to_le_bytes()));
            }
        }
        self.progress.finish_and_clear();
        let writer = match self.sink.finish() {
            Ok(writer) => writer,
            Err(e) => {
                log::error!("Failed to finish output: {}", e);
                return Err(e.into())
            }
        };
        result?;
        if self.blocks_written != self.total_blocks as u64 {
            log::error!("Output declares {} blocks but {} were written",
                self.total_blocks, self.blocks_written);
            return Err(Error::OutputMismatch {
                what: "blocks",
                declared: self.total_blocks as u64,
                written: self.blocks_written,
            })
        }
        if self.flags.sparse && self.chunks_written != self.total_chunks {
            log::error!("Output declares {} chunks but {} were written",
                self.total_chunks, self.chunks_written);
            return Err(Error::OutputMismatch {
                what: "chunks",
                declared: self.total_chunks as u64,
                written: self.chunks_written as u64,
            })
        }
        Ok(writer)
    }
}

impl<W: Write> ChunkSink for OutputFile<W> {
    fn append_skip(&mut self, len: u64) -> Result<()> {
        if len % self.block_size as u64 != 0 {
            log::error!("Skip of 0x{:x} bytes is not aligned to blocks of \
                0x{:x} bytes", len, self.block_size);
            return Err(Error::InvalidArgument(format!("skip of {} bytes",
                len)))
        }
        let blocks = len / self.block_size as u64;
        if self.flags.sparse {
            let blocks = self.chunk_blocks(ChunkType::DontCare, blocks)?;
            self.write_chunk_header(ChunkType::DontCare, blocks, 0)?;
        }
        self.content_zeros(len)?;
        self.blocks_written += blocks;
        Ok(())
    }

    fn append_data(&mut self, image: &SparseImage, block: &BackedBlock)
        -> Result<()>
    {
        let blocks = block.blocks(self.block_size);
        let padded = blocks * self.block_size as u64;
        match &block.data {
            BlockData::Fill(value) => {
                if self.flags.sparse {
                    let blocks = self.chunk_blocks(ChunkType::Fill, blocks)?;
                    self.write_chunk_header(ChunkType::Fill, blocks, 4)?;
                    self.write(&value.to_le_bytes())?;
                }
                self.content_fill(*value, padded)?;
            },
            _ => {
                if self.flags.sparse {
                    let blocks = self.chunk_blocks(ChunkType::Raw, blocks)?;
                    self.write_chunk_header(ChunkType::Raw, blocks,
                        blocks * self.block_size)?;
                }
                let sparse = self.flags.sparse;
                image.read_block(block, |piece| {
                    if sparse {
                        self.write(piece)?;
                    }
                    self.content(piece)
                })?;
                // Raw chunks carry whole blocks
                let pad = padded - block.len;
                if sparse && pad > 0 {
                    let zeros = vec![0; pad as usize];
                    self.write(&zeros)?;
                }
                self.content_zeros(pad)?;
            },
        }
        self.blocks_written += blocks;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use flate2::read::GzDecoder;

    use super::*;
    use crate::sparse::{SIZE_CHUNK_HEADER, SIZE_HEADER};

    fn image() -> SparseImage {
        let mut image = SparseImage::new(4096, 4096 * 8).unwrap();
        image.add_data(1, vec![0x5a; 4096]).unwrap();
        image.add_fill(2, 8192, 0xcafebabe).unwrap();
        image.add_data(6, vec![0x77; 100]).unwrap();
        image
    }

    fn encode(image: &SparseImage, flags: OutputFlags) -> Vec<u8> {
        let mut out = OutputFile::open(Vec::new(), 4096, 4096 * 7, 5, flags,
            ProgressBar::hidden()).unwrap();
        out.append_skip(4096).unwrap();
        let blocks: Vec<_> = image.blocks().cloned().collect();
        out.append_data(image, &blocks[0]).unwrap();
        out.append_data(image, &blocks[1]).unwrap();
        out.append_skip(8192).unwrap();
        out.append_data(image, &blocks[2]).unwrap();
        out.close().unwrap()
    }

    fn expanded() -> Vec<u8> {
        let mut expected = vec![0; 4096];
        expected.extend(vec![0x5a; 4096]);
        expected.extend([0xbe, 0xba, 0xfe, 0xca].iter().cycle().take(8192));
        expected.extend(vec![0; 8192]);
        expected.extend(vec![0x77; 100]);
        expected.extend(vec![0; 4096 - 100]);
        expected
    }

    #[test]
    fn sparse_layout() {
        let image = image();
        let bytes = encode(&image, OutputFlags::default());
        let header = Header::from_bytes(
            bytes[..SIZE_HEADER].try_into().unwrap()).unwrap();
        assert_eq!(header.total_blocks, 7);
        assert_eq!(header.total_chunks, 5);
        assert_eq!(bytes.len(), SIZE_HEADER + 5 * SIZE_CHUNK_HEADER
            + 4096 + 4 + 4096);
        // padding of the partial raw block
        assert!(bytes[bytes.len() - (4096 - 100)..].iter()
            .all(|byte| *byte == 0));
    }

    #[test]
    fn plain_output_is_expanded() {
        let image = image();
        let flags = OutputFlags { sparse: false, ..Default::default() };
        assert_eq!(encode(&image, flags), expanded());
    }

    #[test]
    fn gzip_wraps_output() {
        let image = image();
        let flags = OutputFlags { gzip: true, sparse: false, crc: false };
        let compressed = encode(&image, flags);
        let mut decompressed = Vec::new();
        GzDecoder::new(&compressed[..]).read_to_end(&mut decompressed)
            .unwrap();
        assert_eq!(decompressed, expanded());
    }

    #[test]
    fn crc_chunk_covers_expanded_image() {
        let image = image();
        let flags = OutputFlags { crc: true, ..Default::default() };
        let bytes = encode(&image, flags);
        let header = Header::from_bytes(
            bytes[..SIZE_HEADER].try_into().unwrap()).unwrap();
        assert_eq!(header.total_chunks, 6);
        let mut hasher = Crc32Hasher::new();
        hasher.update(&expanded());
        assert_eq!(&bytes[bytes.len() - 4..], &hasher.value().to_le_bytes());
    }

    #[test]
    fn rejects_unaligned_skip() {
        let mut out = OutputFile::open(Vec::new(), 4096, 4096, 1,
            OutputFlags::default(), ProgressBar::hidden()).unwrap();
        assert!(matches!(out.append_skip(100),
            Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn close_reports_short_output() {
        let out = OutputFile::open(Vec::new(), 4096, 4096 * 2, 1,
            OutputFlags::default(), ProgressBar::hidden()).unwrap();
        assert!(matches!(out.close(),
            Err(Error::OutputMismatch { what: "blocks", declared: 2,
                written: 0 })));

        let mut out = OutputFile::open(Vec::new(), 4096, 4096 * 2, 2,
            OutputFlags::default(), ProgressBar::hidden()).unwrap();
        out.append_skip(8192).unwrap();
        assert!(matches!(out.close(),
            Err(Error::OutputMismatch { what: "chunks", declared: 2,
                written: 1 })));
    }

    const GIB: u64 = 1 << 30;

    fn blocks_of_chunk(bytes: &[u8], at: usize) -> u32 {
        u32::from_le_bytes(bytes[at + 4..at + 8].try_into().unwrap())
    }

    #[test]
    fn holes_and_fills_past_4gib_are_single_chunks() {
        let mut image = SparseImage::new(4096, 12 * GIB).unwrap();
        image.add_fill(0, 6 * GIB, 0x11223344).unwrap();
        let mut out = OutputFile::open(Vec::new(), 4096, 12 * GIB, 2,
            OutputFlags::default(), ProgressBar::hidden()).unwrap();
        let blocks: Vec<_> = image.blocks().cloned().collect();
        out.append_data(&image, &blocks[0]).unwrap();
        out.append_skip(6 * GIB).unwrap();
        let bytes = out.close().unwrap();
        assert_eq!(bytes.len(), SIZE_HEADER + 2 * SIZE_CHUNK_HEADER + 4);
        assert_eq!(blocks_of_chunk(&bytes, SIZE_HEADER), 1572864);
        assert_eq!(blocks_of_chunk(&bytes, SIZE_HEADER + SIZE_CHUNK_HEADER + 4),
            1572864);
    }

    #[test]
    fn raw_chunk_past_its_limit_is_rejected() {
        let mut image = SparseImage::new(4096, 8 * GIB).unwrap();
        image.add_file(0, 5 * GIB, 0).unwrap();
        let mut out = OutputFile::open(Vec::new(), 4096, 8 * GIB, 2,
            OutputFlags::default(), ProgressBar::hidden()).unwrap();
        let blocks: Vec<_> = image.blocks().cloned().collect();
        assert!(matches!(out.append_data(&image, &blocks[0]),
            Err(Error::EncoderSetup(_))));
    }

    #[test]
    fn rejects_bad_setup() {
        assert!(matches!(OutputFile::open(Vec::new(), 4097, 4096, 1,
            OutputFlags::default(), ProgressBar::hidden()),
            Err(Error::EncoderSetup(_))));
        assert!(matches!(OutputFile::open(Vec::new(), 4096,
            4096 * (u32::MAX as u64 + 1), 1, OutputFlags::default(),
            ProgressBar::hidden()), Err(Error::EncoderSetup(_))));
    }
}
