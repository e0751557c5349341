/*
simgtrunc, to truncate trailing chunks off Android sparse images: import module
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

use std::{fs::File, io::{Read, Seek, SeekFrom}, path::Path};

use crate::{backed::SparseImage, crc32::Crc32Hasher, pretty::HumanSize,
    sparse::{ChunkHeader, ChunkType, Header, SparseError, SIZE_CHUNK_HEADER,
    SIZE_HEADER}, Result};

/// Block size raw images are cut into
const BLOCK_SIZE_RAW: u32 = 4096;
const SIZE_READ_BUFFER: usize = 0x100000;

fn read_u32_at(file: &mut File, offset: u64) -> Result<u32> {
    let mut bytes = [0; 4];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn hash_region(file: &mut File, offset: u64, len: u64, crc: &mut Crc32Hasher)
    -> Result<()>
{
    file.seek(SeekFrom::Start(offset))?;
    let mut buffer = vec![0; len.min(SIZE_READ_BUFFER as u64) as usize];
    let mut remaining = len;
    while remaining > 0 {
        let size = remaining.min(buffer.len() as u64) as usize;
        file.read_exact(&mut buffer[..size])?;
        crc.update(&buffer[..size]);
        remaining -= size as u64;
    }
    Ok(())
}

/// Value repeated over the whole block, if the block is one
fn fill_value(block: &[u8]) -> Option<u32> {
    if block.len() % 4 != 0 {
        return None
    }
    let first: [u8; 4] = block.get(0..4)?.try_into().ok()?;
    if block.chunks_exact(4).all(|word| word == &first[..]) {
        Some(u32::from_le_bytes(first))
    } else {
        None
    }
}

impl SparseImage {
    /// Reads an image from `path`: sparse images by their chunks, anything
    /// else as a raw image cut into blocks. With `verify_crc` the CRC32
    /// checkpoints and checksum of a sparse image are checked.
    pub(crate) fn import<P: AsRef<Path>>(path: P, verify_crc: bool)
        -> Result<Self>
    {
        let path = path.as_ref();
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) => {
                log::error!("Cannot open input file '{}': {}",
                    path.display(), e);
                return Err(e.into())
            }
        };
        let mut head = Vec::with_capacity(SIZE_HEADER);
        (&mut file).take(SIZE_HEADER as u64).read_to_end(&mut head)?;
        let result = if Header::has_magic(&head) {
            Self::import_sparse(file, &head, verify_crc)
        } else {
            log::info!("'{}' is not a sparse image, reading it as raw",
                path.display());
            Self::import_raw(file)
        };
        match result {
            Ok(image) => {
                log::info!("Imported '{}': {} in blocks of {} bytes, {} \
                    chunks", path.display(), HumanSize(image.len()),
                    image.block_size(), image.count_chunks());
                Ok(image)
            },
            Err(e) => {
                log::error!("Failed to import '{}': {}", path.display(), e);
                Err(e)
            }
        }
    }

    fn import_sparse(mut file: File, head: &[u8], verify_crc: bool)
        -> Result<Self>
    {
        let head: &[u8; SIZE_HEADER] = match head.try_into() {
            Ok(head) => head,
            Err(_) => return Err(std::io::Error::from(
                std::io::ErrorKind::UnexpectedEof).into()),
        };
        let header = Header::from_bytes(head)?;
        log::debug!("Sparse header: {:?}", header);
        let block_size = header.block_size as u64;
        let mut image = Self::new(header.block_size, header.image_size())?;
        let mut crc = verify_crc.then(Crc32Hasher::new);
        let mut offset = SIZE_HEADER as u64 + header.excess_header_bytes();
        let mut block: u64 = 0;
        for index in 0..header.total_chunks {
            let mut chunk_bytes = [0; SIZE_CHUNK_HEADER];
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut chunk_bytes)?;
            let chunk = ChunkHeader::from_bytes(&chunk_bytes, index, &header)?;
            let data_offset = offset + SIZE_CHUNK_HEADER as u64
                + header.excess_chunk_header_bytes();
            let end_block = block + chunk.blocks as u64;
            if end_block > header.total_blocks as u64 {
                return Err(SparseError::BlockCountMismatch {
                    expected: header.total_blocks as u64,
                    actual: end_block,
                }.into())
            }
            let len = chunk.blocks as u64 * block_size;
            match chunk.chunk_type {
                ChunkType::Raw => {
                    if len > 0 {
                        image.add_file(block as u32, len, data_offset)?
                    }
                    if let Some(crc) = &mut crc {
                        hash_region(&mut file, data_offset, len, crc)?
                    }
                },
                ChunkType::Fill => {
                    let value = read_u32_at(&mut file, data_offset)?;
                    if len > 0 {
                        image.add_fill(block as u32, len, value)?
                    }
                    if let Some(crc) = &mut crc {
                        crc.update_fill(value, len)
                    }
                },
                ChunkType::DontCare => {
                    if let Some(crc) = &mut crc {
                        crc.update_zeros(len)
                    }
                },
                ChunkType::Crc32 => {
                    let expected = read_u32_at(&mut file, data_offset)?;
                    if let Some(crc) = &crc {
                        let actual = crc.value();
                        if actual != expected {
                            return Err(SparseError::Crc32Mismatch {
                                expected, actual }.into())
                        }
                        log::debug!("CRC32 checkpoint {:08x} at chunk #{} \
                            matches", actual, index);
                    }
                },
            }
            log::trace!("Chunk #{}: {} at block {}, {} blocks",
                index, chunk.chunk_type, block, chunk.blocks);
            block = end_block;
            offset = data_offset + chunk.data_size(&header);
        }
        if block != header.total_blocks as u64 {
            return Err(SparseError::BlockCountMismatch {
                expected: header.total_blocks as u64,
                actual: block,
            }.into())
        }
        if let Some(crc) = &crc {
            let actual = crc.value();
            if header.image_checksum != 0 && header.image_checksum != actual {
                return Err(SparseError::Crc32Mismatch {
                    expected: header.image_checksum, actual }.into())
            }
        }
        image.attach_source(file);
        Ok(image)
    }

    fn import_raw(mut file: File) -> Result<Self> {
        let len = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(0))?;
        let mut image = Self::new(BLOCK_SIZE_RAW, len)?;
        let block_size = BLOCK_SIZE_RAW as usize;
        let mut buffer = vec![0; SIZE_READ_BUFFER];
        let mut offset: u64 = 0;
        while offset < len {
            let size = (len - offset).min(buffer.len() as u64) as usize;
            file.read_exact(&mut buffer[..size])?;
            for (id, piece) in buffer[..size].chunks(block_size).enumerate() {
                let piece_offset = offset + (id * block_size) as u64;
                let start_block = (piece_offset / block_size as u64) as u32;
                let piece_len = piece.len() as u64;
                match fill_value(piece) {
                    Some(0) if piece.len() == block_size => (),
                    Some(value) if piece.len() == block_size =>
                        image.add_fill(start_block, piece_len, value)?,
                    _ => image.add_file(start_block, piece_len, piece_offset)?,
                }
            }
            offset += size as u64;
        }
        image.attach_source(file);
        Ok(image)
    }
}
