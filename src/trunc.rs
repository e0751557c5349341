/*
simgtrunc, to truncate trailing chunks off Android sparse images: truncation module
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

use indicatif::ProgressBar;
use serde::Serialize;

use crate::{backed::{BackedBlock, SparseImage}, output::{OutputFile, OutputFlags},
    pretty::HumanSize, Error, Result};

/// Something chunks can be appended to, in image order
pub(crate) trait ChunkSink {
    /// Appends a hole of `len` bytes
    fn append_skip(&mut self, len: u64) -> Result<()>;

    /// Appends the content of `block`, read through `image`
    fn append_data(&mut self, image: &SparseImage, block: &BackedBlock)
        -> Result<()>;
}

/// One chunk of a truncated image, before the trailing pad
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step<'a> {
    Skip {
        blocks: u64,
    },
    Data(&'a BackedBlock),
}

impl Step<'_> {
    /// Bytes this step adds to the image size
    pub(crate) fn len(&self, block_size: u32) -> u64 {
        match self {
            Step::Skip { blocks } => blocks * block_size as u64,
            Step::Data(block) => block.len,
        }
    }
}

/// Walks the chunks of an image in write order, stopping once `budget`
/// chunks were yielded. Both the size calculation and the emission go
/// through this, so they always agree on where the image ends.
pub(crate) struct Walk<'a> {
    blocks: std::slice::Iter<'a, BackedBlock>,
    block_size: u32,
    total_blocks: u64,
    budget: usize,
    counted: usize,
    last_block: u64,
    after_gap: Option<&'a BackedBlock>,
}

impl<'a> Walk<'a> {
    pub(crate) fn new(image: &'a SparseImage, budget: usize) -> Self {
        Self {
            blocks: image.blocks(),
            block_size: image.block_size(),
            total_blocks: image.len_blocks(),
            budget,
            counted: 0,
            last_block: 0,
            after_gap: None,
        }
    }

    /// Block right after everything yielded so far
    pub(crate) fn last_block(&self) -> u64 {
        self.last_block
    }

    pub(crate) fn counted(&self) -> usize {
        self.counted
    }

    fn skip_to(&mut self, block: u64) -> Step<'a> {
        let blocks = block - self.last_block;
        self.counted += 1;
        self.last_block = block;
        Step::Skip { blocks }
    }
}

impl<'a> Iterator for Walk<'a> {
    type Item = Step<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.counted >= self.budget {
            return None
        }
        let block = match self.after_gap.take() {
            Some(block) => block,
            None => match self.blocks.next() {
                Some(block) => {
                    let start_block = block.start_block as u64;
                    if start_block > self.last_block {
                        self.after_gap = Some(block);
                        return Some(self.skip_to(start_block))
                    }
                    block
                },
                None => {
                    if self.last_block < self.total_blocks {
                        return Some(self.skip_to(self.total_blocks))
                    }
                    return None
                },
            },
        };
        self.counted += 1;
        self.last_block = block.end_block(self.block_size);
        Some(Step::Data(block))
    }
}

/// Validates a request to drop `discard` trailing chunks, returns how many
/// chunks are kept
pub(crate) fn chunk_budget(image: &SparseImage, discard: i64) -> Result<usize> {
    let total = image.count_chunks();
    if discard < 0 || total as i64 <= discard {
        log::error!("Cannot discard {} chunks from an image of {} chunks",
            discard, total);
        return Err(Error::InvalidArgument(format!(
            "discarding {} of {} chunks", discard, total)))
    }
    Ok(total - discard as usize)
}

/// Size in bytes of the image made of the first `n_chunks` chunks, rounded
/// up to whole blocks
pub(crate) fn trunc_size(image: &SparseImage, n_chunks: usize) -> u64 {
    let block_size = image.block_size() as u64;
    let size: u64 = Walk::new(image, n_chunks)
        .map(|step| step.len(image.block_size()))
        .sum();
    size.div_ceil(block_size) * block_size
}

/// Appends the first `n_chunks` chunks of `image` to `out`, then a hole to
/// pad up to `trunc_size`. Stops at the first failed append, whatever was
/// already appended stays.
pub(crate) fn write_n_blocks<S: ChunkSink>(
    image: &SparseImage, out: &mut S, n_chunks: usize, trunc_size: u64
) -> Result<()> {
    let block_size = image.block_size() as u64;
    let mut walk = Walk::new(image, n_chunks);
    for step in walk.by_ref() {
        match step {
            Step::Skip { blocks } => out.append_skip(blocks * block_size)?,
            Step::Data(block) => out.append_data(image, block)?,
        }
    }
    let end = walk.last_block() * block_size;
    if trunc_size < end {
        log::error!("Chunks written end at 0x{:x}, beyond the truncated size \
            0x{:x}", end, trunc_size);
        return Err(Error::InvariantViolation(format!(
            "negative pad: {} - {}", trunc_size, end)))
    }
    let pad = trunc_size - end;
    if pad > 0 {
        log::debug!("Padding 0x{:x} bytes after {} chunks", pad, walk.counted());
        out.append_skip(pad)?
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct TruncSummary {
    pub(crate) size: u64,
    pub(crate) blocks: u64,
    pub(crate) chunks: usize,
    pub(crate) original_chunks: usize,
}

/// Writes `image` without its last `discard` chunks into `writer`, encoded
/// as `flags` asks. The encoder is closed even if writing chunks failed.
pub(crate) fn write_trunc<W: Write>(
    image: &SparseImage, writer: W, flags: OutputFlags, discard: i64,
    progress: ProgressBar
) -> Result<(TruncSummary, W)> {
    let n_chunks = chunk_budget(image, discard)?;
    let size = trunc_size(image, n_chunks);
    let mut out = OutputFile::open(writer, image.block_size(), size,
        n_chunks, flags, progress)?;
    let written = write_n_blocks(image, &mut out, n_chunks, size);
    let closed = out.close();
    if let Err(e) = written {
        log::error!("Failed to write truncated image: {}", e);
        return Err(e)
    }
    let writer = closed?;
    let summary = TruncSummary {
        size,
        blocks: size / image.block_size() as u64,
        chunks: n_chunks,
        original_chunks: image.count_chunks(),
    };
    log::info!("Truncated {} chunks to {}, image is now {}",
        summary.original_chunks, summary.chunks, HumanSize(summary.size));
    Ok((summary, writer))
}
